//! Instruction payload composition.

use std::fmt::Write as _;
use std::fs;

use crate::config::EngineConfig;
use crate::engine::classifier::{ALL_BLOCKED_SENTINEL, COMPLETE_SENTINEL};
use crate::models::job::Job;
use crate::{AppError, Result};

/// Base instructions used when no `prompt_file` is configured.
pub const DEFAULT_INSTRUCTIONS: &str = "\
You are one iteration of an autonomous build loop. Work on the single job \
described below and nothing else. Leave the workspace in a state the next \
iteration can continue from.";

/// Builds the instruction payload handed to each executor.
#[derive(Debug, Clone)]
pub struct PromptComposer {
    base: String,
}

impl PromptComposer {
    /// Composer with the given base instructions.
    #[must_use]
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    /// Composer using `executor.prompt_file` (relative to the workspace) or
    /// the built-in instructions.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the prompt file cannot be read.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let Some(file) = &config.executor.prompt_file else {
            return Ok(Self::new(DEFAULT_INSTRUCTIONS));
        };
        let path = if file.is_absolute() {
            file.clone()
        } else {
            config.workspace_root.join(file)
        };
        let base = fs::read_to_string(&path).map_err(|err| {
            AppError::Config(format!("failed to read prompt file {}: {err}", path.display()))
        })?;
        Ok(Self::new(base))
    }

    /// Payload for a worker dispatched on `job`.
    #[must_use]
    pub fn compose(&self, job: &Job) -> String {
        let mut out = String::with_capacity(self.base.len() + 1024);
        out.push_str(self.base.trim_end());
        out.push_str("\n\n");
        write_job(&mut out, job);
        write_protocol(&mut out);
        out
    }

    /// Payload for one verification agent with its focus preamble.
    #[must_use]
    pub fn compose_verification(&self, job: &Job, focus: &str) -> String {
        let mut out = String::with_capacity(self.base.len() + 1024);
        let _ = writeln!(
            out,
            "Verification focus: {focus}. Check the job below only from this angle.\n"
        );
        out.push_str(self.base.trim_end());
        out.push_str("\n\n");
        write_job(&mut out, job);
        let _ = writeln!(
            out,
            "\n## Reporting\n\
             - Print {COMPLETE_SENTINEL} if every criterion holds for your focus.\n\
             - Otherwise print `BLOCKED: <reason>` or `Error: <reason>` on its own line."
        );
        out
    }
}

fn write_job(out: &mut String, job: &Job) {
    let _ = writeln!(out, "# Job {}: {}", job.id, job.title);
    if !job.description.is_empty() {
        let _ = writeln!(out, "\n{}", job.description.trim_end());
    }
    if !job.acceptance_criteria.is_empty() {
        let _ = writeln!(out, "\n## Acceptance criteria");
        for (index, criterion) in job.acceptance_criteria.iter().enumerate() {
            let mark = if criterion.checked { 'x' } else { ' ' };
            let _ = writeln!(out, "{index}. [{mark}] {}", criterion.text);
        }
    }
}

fn write_protocol(out: &mut String) {
    let _ = writeln!(
        out,
        "\n## Reporting\n\
         - Print `<check>N</check>` for each criterion N you have satisfied.\n\
         - Print `<blocked kind=\"infra|decision|external\">reason</blocked>` if you cannot proceed.\n\
         - Print {COMPLETE_SENTINEL} only if no work remains anywhere in the backlog.\n\
         - Print {ALL_BLOCKED_SENTINEL} if every remaining job is blocked."
    );
}
