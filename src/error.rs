//! Errors returned by the rollback core.

use crate::operator::BackendError;

/// A mutating step of a flow, named in errors and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ImportTarget,
    Refresh,
    Apply,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ImportTarget => "import target state",
            Self::Refresh => "refresh",
            Self::Apply => "apply",
        };
        f.write_str(name)
    }
}

/// Errors from history resolution, checkpoint retrieval, and the rollback flows.
#[derive(Debug, thiserror::Error)]
pub enum RollbackError {
    #[error("failed to select stack {stack}: {source}")]
    Selection {
        stack: String,
        #[source]
        source: BackendError,
    },

    #[error("failed to export current state: {0}")]
    Export(#[source] BackendError),

    #[error("failed to get stack history: {0}")]
    History(#[source] BackendError),

    #[error("no deployment history found for stack {0}")]
    EmptyHistory(String),

    #[error("version {0} not found in stack history")]
    VersionNotFound(u64),

    #[error("checkpoint for version {version} is unavailable: {source}")]
    CheckpointUnavailable {
        version: u64,
        #[source]
        source: BackendError,
    },

    #[error("checkpoint for version {version} is not a valid deployment: {source}")]
    InvalidCheckpoint {
        version: u64,
        #[source]
        source: serde_json::Error,
    },

    /// The target import failed part-way; committed state is unknown.
    #[error(
        "failed to import state for version {version}: {source}\n\
         The stack's committed state may be partially modified. \
         Verify it with `pulumi stack export` before retrying."
    )]
    Import {
        version: u64,
        #[source]
        source: BackendError,
    },

    #[error("preview failed: {0}")]
    Preview(#[source] BackendError),

    /// Refresh or apply failed after the target state was imported.
    /// Nothing is restored; the stack is partially rolled back.
    #[error(
        "rollback to version {version} stopped during {stage}: {source}\n\
         The stack state was already replaced with version {version}, and {stage} did not \
         complete. Infrastructure and state are now partially rolled back and need manual \
         intervention; this tool will not retry or restore automatically."
    )]
    Incomplete {
        version: u64,
        stage: Stage,
        #[source]
        source: BackendError,
    },

    #[error("rollback cancelled before {0}; no changes were made")]
    Cancelled(Stage),
}

impl RollbackError {
    /// Whether the stack may be left in a state that needs an operator to look at it.
    pub fn needs_intervention(&self) -> bool {
        matches!(self, Self::Import { .. } | Self::Incomplete { .. })
    }

    /// Whether a read-only backend call failed because it was cancelled.
    pub fn is_cancelled_read(&self) -> bool {
        match self {
            Self::Selection { source, .. } | Self::CheckpointUnavailable { source, .. } => {
                source.is_cancelled()
            }
            Self::Export(source) | Self::History(source) => source.is_cancelled(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_names_the_stage_and_manual_follow_up() {
        let err = RollbackError::Incomplete {
            version: 4,
            stage: Stage::Apply,
            source: BackendError::Rejected("quota exceeded".into()),
        };
        let message = err.to_string();

        assert!(message.contains("stopped during apply"));
        assert!(message.contains("quota exceeded"));
        assert!(message.contains("manual intervention"));
        assert!(err.needs_intervention());
    }

    #[test]
    fn import_failure_needs_intervention() {
        let err = RollbackError::Import {
            version: 2,
            source: BackendError::Cancelled,
        };
        assert!(err.needs_intervention());
        assert!(err.to_string().contains("partially modified"));
    }

    #[test]
    fn cancelled_reads_are_recognised() {
        let cancelled = [
            RollbackError::Export(BackendError::Cancelled),
            RollbackError::History(BackendError::Cancelled),
            RollbackError::CheckpointUnavailable {
                version: 1,
                source: BackendError::Cancelled,
            },
        ];
        for err in &cancelled {
            assert!(err.is_cancelled_read(), "{err:?}");
        }

        assert!(!RollbackError::CheckpointUnavailable {
            version: 1,
            source: BackendError::CheckpointMissing(1),
        }
        .is_cancelled_read());
        assert!(!RollbackError::Preview(BackendError::Cancelled).is_cancelled_read());
    }

    #[test]
    fn read_only_failures_do_not_need_intervention() {
        assert!(!RollbackError::VersionNotFound(9).needs_intervention());
        assert!(!RollbackError::Preview(BackendError::Cancelled).needs_intervention());
        assert!(!RollbackError::Cancelled(Stage::ImportTarget).needs_intervention());
    }
}
