//! Domain model module declarations.

use serde::{Deserialize, Deserializer};

pub mod inbox;
pub mod job;
pub mod outcome;
pub mod process;
pub mod queue;

/// Deserialize a field that may hold a single string, a list of strings,
/// or `null` into a `Vec<String>`.
///
/// Job files written by older generators carry `blockedBy` as a single id;
/// current files carry a list. Both load into the same representation.
pub(crate) fn deserialize_one_or_many<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(id)) if id.is_empty() => Vec::new(),
        Some(OneOrMany::One(id)) => vec![id],
        Some(OneOrMany::Many(ids)) => ids.into_iter().filter(|id| !id.is_empty()).collect(),
    })
}
