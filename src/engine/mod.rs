//! Execution engine: scheduler loop and the components it composes.
//!
//! Per iteration the [`scheduler::Scheduler`] merges the staged inbox
//! ([`merger`]), promotes jobs whose blockers passed ([`resolver`]), picks
//! the head of `pending`, and dispatches it either to a single executor or
//! to the parallel verification fan-out ([`verification`]). Executor output
//! is classified ([`classifier`]) and retryable failures are budgeted by
//! [`retry`], with incidents written by [`incident`].

pub mod classifier;
pub mod controls;
pub mod incident;
pub mod merger;
pub mod resolver;
pub mod retry;
pub mod scheduler;
pub mod verification;

use serde::Serialize;

/// Final state of a scheduler run.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Terminal {
    /// No pending and no blocked jobs remain.
    Complete,
    /// The iteration cap was reached.
    MaxIterations,
    /// Work remains but every remaining job is blocked.
    Blocked,
    /// Operator interrupt, `quit` control, or executor exit 130.
    UserCancelled,
}

impl Terminal {
    /// Process exit code reported by the engine binary.
    #[must_use]
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Complete => 0,
            Self::MaxIterations => 1,
            Self::Blocked => 2,
            Self::UserCancelled => 130,
        }
    }
}

/// Exit code for fatal engine errors (corrupt store, invariant violation,
/// bad configuration).
pub const FATAL_EXIT_CODE: u8 = 3;

/// Per-iteration status published to observers and `storyloop-ctl status`.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct EngineStatus {
    /// Iterations started so far.
    pub iteration: u32,
    /// Iteration cap.
    pub max_iterations: u32,
    /// Job being dispatched, if any.
    pub current_job: Option<String>,
    /// Label of the most recent classification.
    pub last_outcome: Option<String>,
    /// Label of the most recent retryable error class.
    pub last_error: Option<String>,
    /// Remaining transient-error attempts for the current job.
    pub general_remaining: u32,
    /// Remaining no-response attempts for the current job.
    pub no_response_remaining: u32,
    /// Pending jobs after the last commit.
    pub pending: usize,
    /// Blocked jobs after the last commit.
    pub blocked: usize,
    /// Whether the loop is paused between iterations.
    pub paused: bool,
    /// Completion signals discarded because work remained.
    pub false_completions: u32,
    /// Set once the run has ended.
    pub terminal: Option<Terminal>,
}
