//! Staged update inbox written by external collaborators.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::job::Job;
use crate::{AppError, Result};

/// A queue insertion: either a bare id (the job file already exists) or a
/// full job object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum NewJobEntry {
    /// Reference to a job the generator already wrote.
    Id(String),
    /// Complete job to create.
    Job(Box<Job>),
}

impl NewJobEntry {
    /// Id of the referenced or embedded job.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) => id,
            Self::Job(job) => &job.id,
        }
    }
}

/// A shallow patch for an existing job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobPatch {
    /// Target job.
    pub id: String,
    /// Top-level fields to overwrite.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Hot-reload artifact consumed at iteration boundaries.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInbox {
    /// Jobs to add to the queue.
    #[serde(default)]
    pub new_jobs: Vec<NewJobEntry>,
    /// Patches to apply to existing jobs.
    #[serde(default)]
    pub update_jobs: Vec<JobPatch>,
}

impl UpdateInbox {
    /// Decode a parsed inbox document section by section.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Merge` naming the first section or entry that
    /// does not match the inbox format.
    pub fn decode(doc: &Value) -> Result<Self> {
        let Value::Object(sections) = doc else {
            return Err(AppError::Merge("inbox must be a JSON object".into()));
        };
        Ok(Self {
            new_jobs: decode_section(sections, "newJobs")?,
            update_jobs: decode_section(sections, "updateJobs")?,
        })
    }
}

fn decode_section<T: serde::de::DeserializeOwned>(
    sections: &Map<String, Value>,
    name: &str,
) -> Result<Vec<T>> {
    let entries = match sections.get(name) {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(entries)) => entries,
        Some(_) => return Err(AppError::Merge(format!("{name} must be an array"))),
    };
    entries
        .iter()
        .enumerate()
        .map(|(pos, entry)| {
            T::deserialize(entry)
                .map_err(|err| AppError::Merge(format!("{name}[{pos}] is malformed: {err}")))
        })
        .collect()
}
