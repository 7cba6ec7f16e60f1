//! Parallel verification fan-out.
//!
//! A verification job is handed to one executor per focus. All agents run
//! concurrently and are joined before aggregation; the job passes only if
//! every agent signals completion.

use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::executor::prompt::PromptComposer;
use crate::executor::{ExecutionRequest, Executor, ExecutorOutput};
use crate::models::job::Job;
use crate::models::outcome::Outcome;
use crate::models::process::ProcessKind;

use super::classifier::OutcomeClassifier;

/// Reason reported when an agent neither signals completion nor explains
/// itself.
pub const NO_SIGNAL_REASON: &str = "no completion signal found";

/// Result of one verification agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentVerdict {
    /// Agent label (`verifier-1`, ...).
    pub agent: String,
    /// Focus preamble it was given.
    pub focus: String,
    /// Session id of its run.
    pub session_id: String,
    /// Its classified outcome; `None` if it could not be run.
    pub outcome: Option<Outcome>,
    /// Whether it signalled completion.
    pub passed: bool,
}

/// Why an agent failed.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FailureReason {
    /// Agent label.
    pub agent: String,
    /// Focus preamble.
    pub focus: String,
    /// Short reason.
    pub reason: String,
}

/// Aggregated verification result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    /// Job that was verified.
    pub job_id: String,
    /// One verdict per agent, in focus order.
    pub verdicts: Vec<AgentVerdict>,
    /// One entry per failing agent.
    pub failures: Vec<FailureReason>,
    /// Some agent exited with status 130.
    pub cancelled: bool,
    /// Tail of the first failing agent's output.
    pub output_tail: String,
}

impl VerificationReport {
    /// Whether every agent signalled completion.
    #[must_use]
    pub fn passed(&self) -> bool {
        !self.cancelled && !self.verdicts.is_empty() && self.failures.is_empty()
    }
}

/// Fans a verification job out to concurrent executors.
pub struct VerificationDispatcher {
    executor: Arc<dyn Executor>,
    classifier: Arc<dyn OutcomeClassifier>,
    focuses: Vec<String>,
}

impl VerificationDispatcher {
    /// Dispatcher running one agent per focus, capped at `max_agents`.
    #[must_use]
    pub fn new(
        executor: Arc<dyn Executor>,
        classifier: Arc<dyn OutcomeClassifier>,
        focuses: &[String],
        max_agents: usize,
    ) -> Self {
        Self {
            executor,
            classifier,
            focuses: focuses.iter().take(max_agents).cloned().collect(),
        }
    }

    /// Number of agents a dispatch spawns.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.focuses.len()
    }

    /// Run every agent against `job` and aggregate with AND semantics.
    ///
    /// Dropping the returned future drops every agent's executor future.
    pub async fn dispatch(
        &self,
        job: &Job,
        model: &str,
        composer: &PromptComposer,
    ) -> VerificationReport {
        let span = info_span!("verification", job_id = %job.id, agents = self.focuses.len());

        async {
            let runs = self.focuses.iter().enumerate().map(|(n, focus)| {
                let agent = format!("verifier-{}", n + 1);
                let request = ExecutionRequest {
                    job_id: job.id.clone(),
                    model: model.to_owned(),
                    prompt: composer.compose_verification(job, focus),
                    session_id: Uuid::new_v4().to_string(),
                    kind: ProcessKind::Verifier,
                    role: agent.clone(),
                };
                let session_id = request.session_id.clone();
                async move {
                    let result = self.executor.execute(request).await;
                    (agent, focus.clone(), session_id, result)
                }
            });

            let mut report = VerificationReport {
                job_id: job.id.clone(),
                verdicts: Vec::with_capacity(self.focuses.len()),
                failures: Vec::new(),
                cancelled: false,
                output_tail: String::new(),
            };

            for (agent, focus, session_id, result) in join_all(runs).await {
                let (outcome, reason, tail) = match result {
                    Ok(output) => {
                        let outcome = self.classifier.classify(&output).outcome;
                        (Some(outcome), failure_reason(&output), output.tail(20))
                    }
                    Err(err) => (None, err.to_string(), String::new()),
                };

                let passed = outcome == Some(Outcome::SignalComplete);
                if outcome == Some(Outcome::UserCancelled) {
                    report.cancelled = true;
                }
                if !passed {
                    warn!(%agent, %focus, %reason, "verification agent failed");
                    if report.output_tail.is_empty() {
                        report.output_tail = tail;
                    }
                    report.failures.push(FailureReason {
                        agent: agent.clone(),
                        focus: focus.clone(),
                        reason,
                    });
                }
                report.verdicts.push(AgentVerdict {
                    agent,
                    focus,
                    session_id,
                    outcome,
                    passed,
                });
            }

            info!(
                passed = report.passed(),
                failures = report.failures.len(),
                "verification aggregated"
            );
            report
        }
        .instrument(span)
        .await
    }
}

/// Text after the last `BLOCKED:` or `Error:` marker in stdout then
/// stderr, or [`NO_SIGNAL_REASON`].
#[must_use]
pub fn failure_reason(output: &ExecutorOutput) -> String {
    for stream in [&output.stdout, &output.stderr] {
        for line in stream.lines().rev() {
            for marker in ["BLOCKED:", "Error:"] {
                if let Some(pos) = line.find(marker) {
                    let reason = line[pos + marker.len()..].trim();
                    if !reason.is_empty() {
                        return truncate(reason, 200);
                    }
                }
            }
        }
    }
    NO_SIGNAL_REASON.to_owned()
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_owned(),
    }
}
