//! Job (story) model and criterion bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{AppError, Result};

/// Category of work, encoded in the job id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobCategory {
    /// User story (`US-`).
    Story,
    /// Verification pass (`V-`).
    Verification,
    /// Bug fix (`BUG-`).
    Bug,
    /// Any other prefix.
    Other,
}

impl JobCategory {
    /// Derive the category from a job id.
    #[must_use]
    pub fn from_id(id: &str) -> Self {
        if id.starts_with("US-") {
            Self::Story
        } else if id.starts_with("V-") {
            Self::Verification
        } else if id.starts_with("BUG-") {
            Self::Bug
        } else {
            Self::Other
        }
    }

    /// Short lowercase label used in logs and prompts.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Story => "story",
            Self::Verification => "verification",
            Self::Bug => "bug",
            Self::Other => "other",
        }
    }
}

/// One acceptance criterion of a job.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Criterion {
    /// Requirement text.
    pub text: String,
    /// Whether the requirement has been met. Never reset once set.
    pub checked: bool,
}

impl Criterion {
    /// Construct an unchecked criterion.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            checked: false,
        }
    }
}

impl<'de> Deserialize<'de> for Criterion {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Full {
                text: String,
                #[serde(default)]
                checked: bool,
            },
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(text) => Self::new(text),
            Raw::Full { text, checked } => Self { text, checked },
        })
    }
}

/// Why a job was moved to the blocked set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum BlockReason {
    /// Tooling, environment, or service unavailable.
    Infra(String),
    /// Waiting on a human decision.
    Decision(String),
    /// Waiting on something outside the workspace.
    External(String),
}

impl BlockReason {
    /// Build a reason from its wire kind (`infra`, `decision`, `external`).
    #[must_use]
    pub fn from_kind(kind: &str, detail: impl Into<String>) -> Option<Self> {
        let detail = detail.into();
        match kind.trim().to_ascii_lowercase().as_str() {
            "infra" => Some(Self::Infra(detail)),
            "decision" => Some(Self::Decision(detail)),
            "external" => Some(Self::External(detail)),
            _ => None,
        }
    }

    /// Free-text detail carried by the reason.
    #[must_use]
    pub fn detail(&self) -> &str {
        match self {
            Self::Infra(d) | Self::Decision(d) | Self::External(d) => d,
        }
    }
}

/// A unit of work tracked to completion through its acceptance criteria.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Stable unique identifier; the prefix encodes the category.
    pub id: String,
    /// Short title.
    #[serde(default)]
    pub title: String,
    /// Longer description handed to the executor.
    #[serde(default)]
    pub description: String,
    /// Ordered acceptance criteria.
    #[serde(default)]
    pub acceptance_criteria: Vec<Criterion>,
    /// True iff every criterion is checked and the job was completed.
    #[serde(default)]
    pub passes: bool,
    /// Jobs that must pass before this one becomes pending.
    #[serde(
        default,
        deserialize_with = "super::deserialize_one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub blocked_by: Vec<String>,
    /// Reason recorded when the job was blocked explicitly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<BlockReason>,
    /// Model override for this job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Completion timestamp; written once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Completing session; written once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_by: Option<String>,
}

impl Job {
    /// Construct an empty, unblocked job.
    #[must_use]
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            passes: false,
            blocked_by: Vec::new(),
            block_reason: None,
            model: None,
            completed_at: None,
            completed_by: None,
        }
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Append unchecked criteria.
    #[must_use]
    pub fn with_criteria<I, S>(mut self, criteria: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.acceptance_criteria
            .extend(criteria.into_iter().map(Criterion::new));
        self
    }

    /// Add a blocker.
    #[must_use]
    pub fn with_blocker(mut self, blocker: impl Into<String>) -> Self {
        self.blocked_by.push(blocker.into());
        self
    }

    /// Set the model override.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Category derived from the id prefix.
    #[must_use]
    pub fn category(&self) -> JobCategory {
        JobCategory::from_id(&self.id)
    }

    /// Whether every acceptance criterion is checked (vacuously true when
    /// the job has none).
    #[must_use]
    pub fn all_checked(&self) -> bool {
        self.acceptance_criteria.iter().all(|c| c.checked)
    }

    /// Number of criteria still open.
    #[must_use]
    pub fn unchecked_count(&self) -> usize {
        self.acceptance_criteria
            .iter()
            .filter(|c| !c.checked)
            .count()
    }

    /// First open criterion with its index.
    #[must_use]
    pub fn first_unchecked(&self) -> Option<(usize, &Criterion)> {
        self.acceptance_criteria
            .iter()
            .enumerate()
            .find(|(_, c)| !c.checked)
    }

    /// Mark criterion `index` checked. Returns whether anything changed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the index is out of range.
    pub fn check(&mut self, index: usize) -> Result<bool> {
        let len = self.acceptance_criteria.len();
        let criterion = self.acceptance_criteria.get_mut(index).ok_or_else(|| {
            AppError::NotFound(format!(
                "criterion {index} of job {} (job has {len})",
                self.id
            ))
        })?;
        if criterion.checked {
            return Ok(false);
        }
        criterion.checked = true;
        Ok(true)
    }

    /// Re-derive `passes` so it can never be true with an open criterion.
    pub fn normalize_passes(&mut self) {
        self.passes = self.passes && self.all_checked();
    }
}
