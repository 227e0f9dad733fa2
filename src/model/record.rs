//! Deployment records: one entry in a stack's update history.

use std::collections::BTreeMap;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

/// Resource change counts keyed by change kind (`create`, `update`, `delete`, `same`, ...).
pub type ResourceChanges = BTreeMap<String, u64>;

/// One recorded deployment event in a stack's history.
///
/// Created by the backend on every update, refresh, or destroy.
/// Versions are unique within a stack, and the backend returns
/// history most-recent-first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    pub version: u64,

    #[serde(default)]
    pub kind: UpdateKind,

    #[serde(default)]
    pub start_time: Option<Timestamp>,

    #[serde(default)]
    pub end_time: Option<Timestamp>,

    #[serde(default)]
    pub result: UpdateResult,

    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub resource_changes: ResourceChanges,
}

impl DeploymentRecord {
    /// A bare record for `version` with no timing or change data.
    pub fn new(version: u64) -> Self {
        Self {
            version,
            kind: UpdateKind::Update,
            start_time: None,
            end_time: None,
            result: UpdateResult::Succeeded,
            message: String::new(),
            resource_changes: ResourceChanges::new(),
        }
    }
}

/// What kind of operation produced a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    #[default]
    Update,
    Preview,
    Refresh,
    Destroy,
    Import,
    Rename,
    /// Anything newer than this tool knows about.
    #[serde(other)]
    Other,
}

impl UpdateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Preview => "preview",
            Self::Refresh => "refresh",
            Self::Destroy => "destroy",
            Self::Import => "import",
            Self::Rename => "rename",
            Self::Other => "other",
        }
    }
}

/// How a recorded operation ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateResult {
    #[default]
    Succeeded,
    Failed,
    InProgress,
    #[serde(other)]
    Unknown,
}

impl UpdateResult {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::InProgress => "in-progress",
            Self::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_missing_optional_fields() {
        let record: DeploymentRecord = serde_json::from_str(r#"{"version": 4}"#).unwrap();

        assert_eq!(record.version, 4);
        assert_eq!(record.kind, UpdateKind::Update);
        assert_eq!(record.result, UpdateResult::Succeeded);
        assert!(record.start_time.is_none());
        assert!(record.resource_changes.is_empty());
    }

    #[test]
    fn unknown_kind_and_result_are_tolerated() {
        let record: DeploymentRecord = serde_json::from_str(
            r#"{"version": 1, "kind": "teleport", "result": "exploded"}"#,
        )
        .unwrap();

        assert_eq!(record.kind, UpdateKind::Other);
        assert_eq!(record.result, UpdateResult::Unknown);
    }

    #[test]
    fn in_progress_result_uses_kebab_case() {
        let record: DeploymentRecord =
            serde_json::from_str(r#"{"version": 2, "result": "in-progress"}"#).unwrap();

        assert_eq!(record.result, UpdateResult::InProgress);
        assert_eq!(record.result.as_str(), "in-progress");
    }
}
