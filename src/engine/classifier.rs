//! Outcome classification of executor output.
//!
//! [`DefaultClassifier`] honors exit status 130 first, then a structured
//! JSON envelope on the last non-empty stdout line, and falls back to
//! [`PatternClassifier`] text matching. Error patterns are only searched in
//! the head and tail of the output so narrative prose in the middle of a
//! long transcript cannot trigger a retry.

use regex::{Regex, RegexSet};
use serde::Deserialize;
use tracing::debug;

use crate::executor::ExecutorOutput;
use crate::models::job::BlockReason;
use crate::models::outcome::{Classification, ClassificationSource, Outcome};
use crate::{AppError, Result};

/// Sentinel announcing that the whole backlog is done.
pub const COMPLETE_SENTINEL: &str = "<promise>COMPLETE</promise>";

/// Sentinel announcing that every remaining job is blocked.
pub const ALL_BLOCKED_SENTINEL: &str = "<promise>ALL_BLOCKED</promise>";

/// Exit status reported by an interrupted executor.
pub const CANCELLED_EXIT_CODE: i32 = 130;

const HEAD_LINES: usize = 5;
const TAIL_LINES: usize = 10;

const NO_RESPONSE_PATTERNS: &[&str] = &[
    r"(?i)no response (received|from)",
    r"(?i)empty (response|payload|reply)",
    r"(?i)received an empty",
    r"(?i)response was empty",
];

const TRANSIENT_PATTERNS: &[&str] = &[
    r"(?i)rate[ _-]?limit",
    r"\b429\b",
    r"(?i)\b5\d\d\b.{0,20}(error|server|gateway|unavailable)",
    r"(?i)(internal server error|bad gateway|service unavailable|gateway timeout)",
    r"(?i)overloaded",
    r"ECONNRESET|ETIMEDOUT|ECONNREFUSED|EAI_AGAIN",
    r"(?i)network error",
    r"(?i)connection (refused|reset|timed out)",
];

/// Assigns an [`Outcome`] to executor output.
pub trait OutcomeClassifier: Send + Sync {
    /// Classify one executor run.
    fn classify(&self, output: &ExecutorOutput) -> Classification;
}

/// Structured result footer emitted by cooperating executors.
#[derive(Debug, Deserialize)]
struct Envelope {
    outcome: EnvelopeOutcome,
    #[serde(default)]
    checked: Vec<usize>,
    #[serde(default)]
    blocked: Option<BlockReason>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum EnvelopeOutcome {
    Success,
    Complete,
    AllBlocked,
    NoResponse,
    Transient,
}

impl From<EnvelopeOutcome> for Outcome {
    fn from(value: EnvelopeOutcome) -> Self {
        match value {
            EnvelopeOutcome::Success => Self::Success,
            EnvelopeOutcome::Complete => Self::SignalComplete,
            EnvelopeOutcome::AllBlocked => Self::SignalAllBlocked,
            EnvelopeOutcome::NoResponse => Self::NoResponseError,
            EnvelopeOutcome::Transient => Self::TransientInfraError,
        }
    }
}

/// Parses the JSON envelope on the last non-empty stdout line.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeClassifier;

impl EnvelopeClassifier {
    /// Classification from the envelope, or `None` when the output carries
    /// no envelope.
    #[must_use]
    pub fn parse(output: &ExecutorOutput) -> Option<Classification> {
        let last = output
            .stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())?;
        if !last.starts_with('{') {
            return None;
        }
        let envelope: Envelope = serde_json::from_str(last).ok()?;
        Some(Classification {
            outcome: envelope.outcome.into(),
            checked: envelope.checked,
            blocked: envelope.blocked,
            source: ClassificationSource::Envelope,
        })
    }
}

/// Text-pattern classifier over raw output.
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    no_response: RegexSet,
    transient: RegexSet,
    check_marker: Regex,
    blocked_marker: Regex,
}

impl PatternClassifier {
    /// Compile the built-in pattern sets.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a pattern fails to compile.
    pub fn new() -> Result<Self> {
        let compile_err = |err: regex::Error| AppError::Config(format!("invalid pattern: {err}"));
        Ok(Self {
            no_response: RegexSet::new(NO_RESPONSE_PATTERNS).map_err(compile_err)?,
            transient: RegexSet::new(TRANSIENT_PATTERNS).map_err(compile_err)?,
            check_marker: Regex::new(r"<check>\s*(\d+)\s*</check>").map_err(compile_err)?,
            blocked_marker: Regex::new(r#"<blocked\s+kind="(\w+)"\s*>(.*?)</blocked>"#)
                .map_err(compile_err)?,
        })
    }

    /// Criterion indices named by `<check>N</check>` markers, deduplicated
    /// in first-seen order.
    #[must_use]
    pub fn checked_markers(&self, stdout: &str) -> Vec<usize> {
        let mut seen = Vec::new();
        for caps in self.check_marker.captures_iter(stdout) {
            if let Some(index) = caps.get(1).and_then(|m| m.as_str().parse().ok()) {
                if !seen.contains(&index) {
                    seen.push(index);
                }
            }
        }
        seen
    }

    /// Last `<blocked kind="...">reason</blocked>` marker with a known kind.
    #[must_use]
    pub fn blocked_marker(&self, stdout: &str) -> Option<BlockReason> {
        self.blocked_marker
            .captures_iter(stdout)
            .filter_map(|caps| BlockReason::from_kind(&caps[1], caps[2].trim()))
            .last()
    }

    fn outcome(&self, output: &ExecutorOutput) -> Outcome {
        if output.exit_code == Some(CANCELLED_EXIT_CODE) {
            return Outcome::UserCancelled;
        }
        if output.stdout.contains(COMPLETE_SENTINEL) {
            return Outcome::SignalComplete;
        }
        if output.stdout.contains(ALL_BLOCKED_SENTINEL) {
            return Outcome::SignalAllBlocked;
        }

        let scope = scoped_text(&output.stdout, &output.stderr);
        if self.no_response.is_match(&scope) {
            return Outcome::NoResponseError;
        }
        if self.transient.is_match(&scope) {
            return Outcome::TransientInfraError;
        }

        if output.exit_code != Some(0) || output.stdout.trim().is_empty() {
            return Outcome::TransientInfraError;
        }
        Outcome::Success
    }
}

impl OutcomeClassifier for PatternClassifier {
    fn classify(&self, output: &ExecutorOutput) -> Classification {
        Classification {
            outcome: self.outcome(output),
            checked: self.checked_markers(&output.stdout),
            blocked: self.blocked_marker(&output.stdout),
            source: ClassificationSource::Patterns,
        }
    }
}

/// Exit 130, then the envelope, then text patterns.
#[derive(Debug, Clone)]
pub struct DefaultClassifier {
    patterns: PatternClassifier,
}

impl DefaultClassifier {
    /// Build the default classifier chain.
    ///
    /// # Errors
    ///
    /// Same as [`PatternClassifier::new`].
    pub fn new() -> Result<Self> {
        Ok(Self {
            patterns: PatternClassifier::new()?,
        })
    }
}

impl OutcomeClassifier for DefaultClassifier {
    fn classify(&self, output: &ExecutorOutput) -> Classification {
        if output.exit_code == Some(CANCELLED_EXIT_CODE) {
            return Classification::bare(Outcome::UserCancelled, ClassificationSource::Patterns);
        }
        if let Some(classification) = EnvelopeClassifier::parse(output) {
            debug!(outcome = classification.outcome.label(), "classified from envelope");
            return classification;
        }
        self.patterns.classify(output)
    }
}

/// First [`HEAD_LINES`] and last [`TAIL_LINES`] lines of each stream.
fn scoped_text(stdout: &str, stderr: &str) -> String {
    let mut scoped = Vec::new();
    for stream in [stdout, stderr] {
        let lines: Vec<&str> = stream.lines().collect();
        if lines.len() <= HEAD_LINES + TAIL_LINES {
            scoped.extend_from_slice(&lines);
        } else {
            scoped.extend_from_slice(&lines[..HEAD_LINES]);
            scoped.extend_from_slice(&lines[lines.len() - TAIL_LINES..]);
        }
    }
    scoped.join("\n")
}
