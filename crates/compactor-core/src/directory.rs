//! Activity directory boundary: the source of truth for activities and
//! their owners.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ErrorCode;
use crate::fsutil;

/// An activity as reported by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    pub owners: Vec<String>,
}

impl Activity {
    pub fn new<I, S>(id: impl Into<String>, owners: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            owners: owners.into_iter().map(Into::into).collect(),
        }
    }

    /// Owners sorted ascending, duplicates dropped. Names that are not a
    /// single path segment are skipped since they key output paths.
    #[must_use]
    pub fn sorted_owners(&self) -> Vec<String> {
        let mut owners: Vec<String> = self
            .owners
            .iter()
            .filter(|owner| {
                let usable = fsutil::is_path_segment(owner);
                if !usable {
                    warn!(activity_id = %self.id, owner = %owner, "ignoring owner with unusable name");
                }
                usable
            })
            .cloned()
            .collect();
        owners.sort();
        owners.dedup();
        owners
    }
}

/// Query sent to the directory. Serializes as `{"type": [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActivityFilter {
    #[serde(rename = "type")]
    pub types: Vec<String>,
}

impl ActivityFilter {
    #[must_use]
    pub fn of_types(types: &[String]) -> Self {
        Self {
            types: types.to_vec(),
        }
    }

    /// Whether an activity of `kind` passes the filter. An empty filter
    /// accepts everything.
    #[must_use]
    pub fn accepts(&self, kind: Option<&str>) -> bool {
        self.types.is_empty() || kind.is_some_and(|k| self.types.iter().any(|t| t == k))
    }

    /// JSON form used as the `searchString` query parameter.
    #[must_use]
    pub fn to_query(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("activity directory rejected credentials: {0}")]
    Unauthorized(String),

    #[error("activity directory request failed: {0}")]
    Transport(String),

    #[error("activity directory response could not be decoded: {0}")]
    Decode(String),
}

impl DirectoryError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Unauthorized(_) => ErrorCode::DirectoryUnauthorized,
            Self::Transport(_) | Self::Decode(_) => ErrorCode::DirectoryUnavailable,
        }
    }
}

/// Read access to the activity directory.
pub trait ActivityDirectory: Send + Sync {
    fn activities(&self, filter: &ActivityFilter) -> Result<Vec<Activity>, DirectoryError>;
}

/// Decode a raw directory response, skipping items without an id or owners.
pub fn parse_activities(raw: Vec<serde_json::Value>) -> Vec<Activity> {
    raw.into_iter()
        .enumerate()
        .filter_map(|(index, item)| match serde_json::from_value::<Activity>(item) {
            Ok(activity) if !activity.id.is_empty() => Some(activity),
            Ok(_) => {
                warn!(index, "skipping activity with empty id");
                None
            }
            Err(err) => {
                warn!(index, error = %err, "skipping malformed activity");
                None
            }
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct StaticEntry {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(flatten)]
    raw: serde_json::Map<String, serde_json::Value>,
}

/// A fixed activity list, used for offline runs and tests.
///
/// Entries may carry a `type` field, which is matched against the filter;
/// entries without one pass every filter.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    entries: Mutex<Vec<(Option<String>, Activity)>>,
}

impl StaticDirectory {
    /// Untyped activities, returned for any filter.
    #[must_use]
    pub fn new(activities: Vec<Activity>) -> Self {
        let directory = Self::default();
        directory.set_activities(activities);
        directory
    }

    /// Load a JSON array of activities from a file.
    pub fn from_file(path: &Path) -> Result<Self, DirectoryError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DirectoryError::Transport(format!("{}: {e}", path.display())))?;
        let raw: Vec<StaticEntry> = serde_json::from_str(&content)
            .map_err(|e| DirectoryError::Decode(format!("{}: {e}", path.display())))?;

        let mut entries = Vec::with_capacity(raw.len());
        for entry in raw {
            let kind = entry.kind;
            if let Some(activity) = parse_activities(vec![serde_json::Value::Object(entry.raw)]).pop() {
                entries.push((kind, activity));
            }
        }
        Ok(Self {
            entries: Mutex::new(entries),
        })
    }

    /// Replace the listing; every entry is returned regardless of filter.
    pub fn set_activities(&self, activities: Vec<Activity>) {
        *self.entries.lock().unwrap_or_else(PoisonError::into_inner) =
            activities.into_iter().map(|a| (None, a)).collect();
    }
}

impl ActivityDirectory for StaticDirectory {
    fn activities(&self, filter: &ActivityFilter) -> Result<Vec<Activity>, DirectoryError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .iter()
            .filter(|(kind, _)| kind.is_none() || filter.accepts(kind.as_deref()))
            .map(|(_, activity)| activity.clone())
            .collect())
    }
}
