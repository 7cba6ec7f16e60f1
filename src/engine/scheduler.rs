//! Scheduler main loop.
//!
//! Strictly sequential: one job is dispatched at a time, always the head of
//! `pending`. Per iteration:
//!
//! 1. Sample interactive controls (pause / skip / quit).
//! 2. Merge the staged inbox.
//! 3. Promote blocked jobs whose blockers pass.
//! 4. Select the head of `pending` or terminate.
//! 5. Dispatch (single executor with retries, or verification fan-out).
//! 6. Apply reported progress to the store.
//!
//! Store mutations happen synchronously after the executor future resolves,
//! so cancellation can never land between "executor returned" and "store
//! committed".

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::executor::prompt::PromptComposer;
use crate::executor::{ExecutionRequest, Executor, ExecutorOutput};
use crate::models::job::Job;
use crate::models::outcome::{Classification, ClassificationSource, ErrorClass, Outcome};
use crate::models::process::ProcessKind;
use crate::store::JobStore;
use crate::{AppError, Result};

use super::classifier::{DefaultClassifier, OutcomeClassifier};
use super::controls::{self, Control, ControlAction};
use super::incident::{git_history, CrashReport, Incident, IncidentEvent, IncidentLog};
use super::merger::{MergeOutcome, UpdateMerger};
use super::resolver::resolve_blocked;
use super::retry::{RetryDecision, RetryPolicy, RetryTracker};
use super::verification::VerificationDispatcher;
use super::{EngineStatus, Terminal};

const OUTPUT_TAIL_LINES: usize = 20;

/// Drives jobs from the store through executors until a terminal state.
pub struct Scheduler {
    config: Arc<EngineConfig>,
    store: JobStore,
    executor: Arc<dyn Executor>,
    classifier: Arc<dyn OutcomeClassifier>,
    composer: PromptComposer,
    merger: UpdateMerger,
    retry: RetryPolicy,
    incidents: IncidentLog,
    cancel: CancellationToken,
    controls: Option<mpsc::Receiver<Control>>,
    status_tx: watch::Sender<EngineStatus>,
    iteration: u32,
    current_job: Option<String>,
    last_output_tail: String,
}

impl Scheduler {
    /// Build a scheduler over an already-loaded store.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the prompt file cannot be read or the
    /// classifier patterns fail to compile.
    pub fn new(
        config: Arc<EngineConfig>,
        store: JobStore,
        executor: Arc<dyn Executor>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let retry = RetryPolicy::from_config(&config);
        let (status_tx, _) = watch::channel(EngineStatus {
            max_iterations: config.max_iterations,
            general_remaining: retry.general.max_attempts,
            no_response_remaining: retry.no_response.max_attempts,
            pending: store.pending_count(),
            blocked: store.blocked_count(),
            ..EngineStatus::default()
        });

        Ok(Self {
            classifier: Arc::new(DefaultClassifier::new()?),
            composer: PromptComposer::from_config(&config)?,
            merger: UpdateMerger::from_config(&config),
            incidents: IncidentLog::new(config.incident_dir()),
            retry,
            config,
            store,
            executor,
            cancel,
            controls: None,
            status_tx,
            iteration: 0,
            current_job: None,
            last_output_tail: String::new(),
        })
    }

    /// Replace the outcome classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<dyn OutcomeClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Replace the prompt composer.
    #[must_use]
    pub fn with_composer(mut self, composer: PromptComposer) -> Self {
        self.composer = composer;
        self
    }

    /// Receive interactive controls on `rx`.
    #[must_use]
    pub fn with_controls(mut self, rx: mpsc::Receiver<Control>) -> Self {
        self.controls = Some(rx);
        self
    }

    /// Subscribe to per-iteration status.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<EngineStatus> {
        self.status_tx.subscribe()
    }

    /// The store as last committed.
    #[must_use]
    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Iterations started so far.
    #[must_use]
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Run until a terminal state.
    ///
    /// # Errors
    ///
    /// Returns the fatal error that stopped the loop (store corruption,
    /// invariant violation, failed write). A crash postmortem is written to
    /// the crash directory first.
    pub async fn run(&mut self) -> Result<Terminal> {
        info!(
            max_iterations = self.config.max_iterations,
            pending = self.store.pending_count(),
            blocked = self.store.blocked_count(),
            "scheduler starting"
        );

        match self.run_loop().await {
            Ok(terminal) => {
                self.status_tx.send_modify(|s| {
                    s.terminal = Some(terminal);
                    s.current_job = None;
                });
                info!(
                    ?terminal,
                    exit_code = terminal.exit_code(),
                    iterations = self.iteration,
                    "scheduler finished"
                );
                Ok(terminal)
            }
            Err(err) => {
                error!(%err, iteration = self.iteration, "scheduler aborted");
                self.write_crash_report(&err).await;
                Err(err)
            }
        }
    }

    async fn run_loop(&mut self) -> Result<Terminal> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(Terminal::UserCancelled);
            }

            match self.sample_controls().await {
                ControlAction::Quit => return Ok(Terminal::UserCancelled),
                ControlAction::Skip => self.skip_head()?,
                ControlAction::Continue => {}
            }

            self.merge_inbox()?;
            resolve_blocked(&mut self.store)?;
            self.publish_counts();

            let Some(job_id) = self.store.next_pending().map(str::to_owned) else {
                return Ok(if self.store.blocked_count() == 0 {
                    Terminal::Complete
                } else {
                    Terminal::Blocked
                });
            };

            if self.iteration >= self.config.max_iterations {
                return Ok(Terminal::MaxIterations);
            }
            self.iteration += 1;

            let span = info_span!("scheduler_iteration", iteration = self.iteration, job_id = %job_id);
            let terminal = self.iterate(&job_id).instrument(span).await?;

            self.publish_counts();
            self.log_iteration();

            if let Some(terminal) = terminal {
                return Ok(terminal);
            }
        }
    }

    async fn sample_controls(&mut self) -> ControlAction {
        let Some(rx) = self.controls.as_mut() else {
            return ControlAction::Continue;
        };
        let status = &self.status_tx;
        controls::sample(rx, &self.cancel, |paused| {
            status.send_modify(|s| s.paused = paused);
        })
        .await
    }

    fn skip_head(&mut self) -> Result<()> {
        if let Some(head) = self.store.next_pending().map(str::to_owned) {
            if self.store.skip(&head)? {
                info!(job_id = %head, "job skipped to tail of pending");
            }
        }
        Ok(())
    }

    fn merge_inbox(&mut self) -> Result<()> {
        match self.merger.merge(&mut self.store) {
            Ok(MergeOutcome::NoInbox) => {}
            Ok(MergeOutcome::Merged(report)) => {
                debug!(?report, "inbox applied");
            }
            Ok(MergeOutcome::DeadLettered(path)) => {
                warn!(path = %path.display(), "inbox moved to dead-letter");
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => warn!(%err, "inbox merge deferred to next iteration"),
        }
        Ok(())
    }

    async fn iterate(&mut self, job_id: &str) -> Result<Option<Terminal>> {
        let job = self.store.job(job_id).cloned().ok_or_else(|| {
            AppError::InvariantViolation(format!("pending job {job_id} has no job record"))
        })?;

        self.current_job = Some(job.id.clone());
        let iteration = self.iteration;
        let retry = self.retry;
        self.status_tx.send_modify(|s| {
            s.iteration = iteration;
            s.current_job = Some(job.id.clone());
            s.general_remaining = retry.general.max_attempts;
            s.no_response_remaining = retry.no_response.max_attempts;
        });

        let verification = &self.config.verification;
        if verification.enabled && job.id.starts_with(&verification.id_prefix) {
            let model = job
                .model
                .clone()
                .unwrap_or_else(|| self.config.verification_model().to_owned());
            return self.verify(&job, &model).await;
        }

        let model = job
            .model
            .clone()
            .unwrap_or_else(|| self.config.executor.default_model.clone());
        self.dispatch_single(&job, &model).await
    }

    async fn dispatch_single(&mut self, job: &Job, model: &str) -> Result<Option<Terminal>> {
        let mut tracker = RetryTracker::new(self.retry);
        let executor = Arc::clone(&self.executor);

        loop {
            let session_id = Uuid::new_v4().to_string();
            let request = ExecutionRequest {
                job_id: job.id.clone(),
                model: model.to_owned(),
                prompt: self.composer.compose(job),
                session_id: session_id.clone(),
                kind: ProcessKind::Executor,
                role: "worker".into(),
            };
            debug!(%session_id, category = job.category().label(), "dispatching");

            let result = tokio::select! {
                () = self.cancel.cancelled() => {
                    info!(%session_id, "cancelled during dispatch; job left untouched");
                    return Ok(Some(Terminal::UserCancelled));
                }
                result = executor.execute(request) => result,
            };

            let (classification, output) = match result {
                Ok(output) => (self.classifier.classify(&output), output),
                Err(err) => {
                    warn!(%err, "executor could not be run");
                    let output = ExecutorOutput {
                        stderr: err.to_string(),
                        ..ExecutorOutput::default()
                    };
                    (
                        Classification::bare(
                            Outcome::TransientInfraError,
                            ClassificationSource::Patterns,
                        ),
                        output,
                    )
                }
            };

            self.last_output_tail = output.tail(OUTPUT_TAIL_LINES);
            let outcome = classification.outcome;
            self.status_tx
                .send_modify(|s| s.last_outcome = Some(outcome.label().to_owned()));

            let Some(class) = outcome.error_class() else {
                return self.apply_outcome(job, &session_id, &classification);
            };

            let decision = tracker.record_failure(class);
            let general_remaining = tracker.remaining(ErrorClass::TransientInfra);
            let no_response_remaining = tracker.remaining(ErrorClass::NoResponse);
            self.status_tx.send_modify(|s| {
                s.last_error = Some(class.label().to_owned());
                s.general_remaining = general_remaining;
                s.no_response_remaining = no_response_remaining;
            });

            match decision {
                RetryDecision::Retry {
                    attempt,
                    remaining,
                    cooldown,
                } => {
                    self.record_incident(
                        Incident::new(
                            self.iteration,
                            &job.id,
                            IncidentEvent::Retry {
                                error_class: class,
                                attempt,
                                remaining,
                                cooldown_seconds: cooldown.as_secs(),
                            },
                        )
                        .with_session(&session_id),
                    );
                    info!(
                        error_class = class.label(),
                        attempt,
                        general_remaining,
                        no_response_remaining,
                        cooldown_secs = cooldown.as_secs(),
                        "retrying after cooldown"
                    );

                    tokio::select! {
                        () = self.cancel.cancelled() => return Ok(Some(Terminal::UserCancelled)),
                        () = tokio::time::sleep(cooldown) => {}
                    }
                }
                RetryDecision::Exhausted { attempts } => {
                    let path = self.record_incident(
                        Incident::new(
                            self.iteration,
                            &job.id,
                            IncidentEvent::Exhausted {
                                error_class: class,
                                attempts,
                            },
                        )
                        .with_session(&session_id),
                    );
                    warn!(
                        error_class = class.label(),
                        attempts,
                        incident = ?path,
                        "retry budget exhausted; job left pending"
                    );
                    return Ok(None);
                }
            }
        }
    }

    fn apply_outcome(
        &mut self,
        job: &Job,
        session_id: &str,
        classification: &Classification,
    ) -> Result<Option<Terminal>> {
        match classification.outcome {
            Outcome::UserCancelled => {
                info!("executor cancelled; job left untouched");
                return Ok(Some(Terminal::UserCancelled));
            }
            Outcome::SignalAllBlocked => {
                info!("executor reports every remaining job blocked");
                return Ok(Some(Terminal::Blocked));
            }
            Outcome::Success | Outcome::SignalComplete => {}
            Outcome::NoResponseError | Outcome::TransientInfraError => return Ok(None),
        }

        self.apply_progress(job, session_id, classification)?;

        if classification.outcome == Outcome::SignalComplete {
            // Ground truth is the queue after the same merge and unblock
            // pass the next iteration would run.
            self.store.reload()?;
            self.merge_inbox()?;
            resolve_blocked(&mut self.store)?;
            self.publish_counts();
            let pending = self.store.pending_count();
            if pending == 0 {
                info!("completion signal confirmed by store");
                return Ok(Some(if self.store.blocked_count() == 0 {
                    Terminal::Complete
                } else {
                    Terminal::Blocked
                }));
            }
            self.status_tx.send_modify(|s| s.false_completions += 1);
            warn!(
                pending,
                "false completion signal: pending work remains, continuing"
            );
        }

        Ok(None)
    }

    fn apply_progress(
        &mut self,
        job: &Job,
        session_id: &str,
        classification: &Classification,
    ) -> Result<()> {
        for &index in &classification.checked {
            match self.store.mark_criterion(&job.id, index) {
                Ok(true) => debug!(criterion = index, "criterion checked"),
                Ok(false) => {}
                Err(AppError::NotFound(msg)) => {
                    warn!(%msg, "ignoring check marker for unknown criterion");
                }
                Err(err) => return Err(err),
            }
        }

        if let Some(reason) = &classification.blocked {
            self.store.mark_blocked(&job.id, reason.clone())?;
            info!(reason = reason.detail(), "job blocked by executor");
            return Ok(());
        }

        let Some(current) = self.store.job(&job.id) else {
            return Ok(());
        };
        if current.all_checked() && !current.passes {
            self.store
                .mark_complete(&job.id, &format!("storyloop:{session_id}"))?;
            info!("job complete");
        } else if !current.passes {
            debug!(open = current.unchecked_count(), "job still has open criteria");
        }
        Ok(())
    }

    async fn verify(&mut self, job: &Job, model: &str) -> Result<Option<Terminal>> {
        let dispatcher = VerificationDispatcher::new(
            Arc::clone(&self.executor),
            Arc::clone(&self.classifier),
            &self.config.verification.focuses,
            self.config.verification.max_agents,
        );

        let report = tokio::select! {
            () = self.cancel.cancelled() => {
                info!("cancelled during verification; job left untouched");
                return Ok(Some(Terminal::UserCancelled));
            }
            report = dispatcher.dispatch(job, model, &self.composer) => report,
        };

        self.last_output_tail.clone_from(&report.output_tail);
        if report.cancelled {
            return Ok(Some(Terminal::UserCancelled));
        }

        if report.passed() {
            for index in 0..job.acceptance_criteria.len() {
                self.store.mark_criterion(&job.id, index)?;
            }
            let by = report
                .verdicts
                .first()
                .map_or_else(String::new, |v| v.session_id.clone());
            self.store
                .mark_complete(&job.id, &format!("storyloop:{by}"))?;
            self.status_tx
                .send_modify(|s| s.last_outcome = Some(Outcome::SignalComplete.label().into()));
            info!(agents = report.verdicts.len(), "verification passed");
            return Ok(None);
        }

        self.status_tx
            .send_modify(|s| s.last_outcome = Some("verification_failed".into()));
        let path = self.record_incident(
            Incident::new(
                self.iteration,
                &job.id,
                IncidentEvent::VerificationFailed {
                    failures: report.failures.clone(),
                },
            )
            .with_output_tail(report.output_tail.clone()),
        );
        warn!(
            failures = report.failures.len(),
            incident = ?path,
            "verification failed; job left pending"
        );
        Ok(None)
    }

    fn record_incident(&self, incident: Incident) -> Option<std::path::PathBuf> {
        let incident = if incident.output_tail.is_empty() {
            incident.with_output_tail(self.last_output_tail.clone())
        } else {
            incident
        };
        match self.incidents.record(&incident) {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(%err, "failed to write incident file");
                None
            }
        }
    }

    fn publish_counts(&self) {
        let pending = self.store.pending_count();
        let blocked = self.store.blocked_count();
        self.status_tx.send_modify(|s| {
            s.pending = pending;
            s.blocked = blocked;
        });
    }

    fn log_iteration(&self) {
        let status = self.status_tx.borrow();
        info!(
            iteration = status.iteration,
            last_outcome = status.last_outcome.as_deref().unwrap_or("-"),
            last_error = status.last_error.as_deref().unwrap_or("-"),
            general_remaining = status.general_remaining,
            no_response_remaining = status.no_response_remaining,
            pending = status.pending,
            blocked = status.blocked,
            "iteration finished"
        );
    }

    async fn write_crash_report(&self, err: &AppError) {
        let last_unchecked = self
            .current_job
            .as_deref()
            .and_then(|id| self.store.job(id))
            .and_then(|job| job.first_unchecked().map(|(_, c)| c.text.clone()));

        let report = CrashReport {
            iteration: self.iteration,
            job_id: self.current_job.clone(),
            last_unchecked,
            error: err.to_string(),
            output_tail: self.last_output_tail.clone(),
            git_history: git_history(&self.config.workspace_root).await,
        };

        match report.write_to(&self.config.crash_dir()) {
            Ok(path) => error!(path = %path.display(), "crash report written"),
            Err(write_err) => error!(%write_err, "failed to write crash report"),
        }
    }
}
