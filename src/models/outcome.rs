//! Classified result of one executor invocation.

use serde::{Deserialize, Serialize};

use super::job::BlockReason;

/// Result category assigned to an executor run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Ran to completion without a terminal signal; more work may remain.
    Success,
    /// Executor claims the whole backlog is done.
    SignalComplete,
    /// Executor claims every remaining job is blocked.
    SignalAllBlocked,
    /// Executor exited with status 130.
    UserCancelled,
    /// Service returned nothing.
    NoResponseError,
    /// Network, rate-limit, 5xx, or unexplained nonzero exit.
    TransientInfraError,
}

impl Outcome {
    /// Retryable error class, if this outcome is a retryable failure.
    #[must_use]
    pub fn error_class(self) -> Option<ErrorClass> {
        match self {
            Self::NoResponseError => Some(ErrorClass::NoResponse),
            Self::TransientInfraError => Some(ErrorClass::TransientInfra),
            _ => None,
        }
    }

    /// Snake-case label used in logs and incident files.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::SignalComplete => "signal_complete",
            Self::SignalAllBlocked => "signal_all_blocked",
            Self::UserCancelled => "user_cancelled",
            Self::NoResponseError => "no_response_error",
            Self::TransientInfraError => "transient_infra_error",
        }
    }
}

/// Retryable failure classes, each with an independent budget.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Budgeted by `retry.max_retries` / `retry.cooldown_seconds`.
    TransientInfra,
    /// Budgeted by `retry.no_response_max_retries` / `retry.no_response_cooldown_seconds`.
    NoResponse,
}

impl ErrorClass {
    /// Snake-case label.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::TransientInfra => "transient_infra_error",
            Self::NoResponse => "no_response_error",
        }
    }
}

/// Which classifier produced a [`Classification`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationSource {
    /// Structured JSON footer emitted by the executor.
    Envelope,
    /// Text-pattern fallback over raw output.
    Patterns,
}

/// Outcome plus the progress the executor reported for its job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// Result category.
    pub outcome: Outcome,
    /// Zero-based criteria the executor reports as satisfied.
    pub checked: Vec<usize>,
    /// Explicit block requested by the executor.
    pub blocked: Option<BlockReason>,
    /// Classifier that produced this result.
    pub source: ClassificationSource,
}

impl Classification {
    /// Classification with no reported progress.
    #[must_use]
    pub fn bare(outcome: Outcome, source: ClassificationSource) -> Self {
        Self {
            outcome,
            checked: Vec::new(),
            blocked: None,
            source,
        }
    }
}
