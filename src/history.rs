//! Deployment history: fetch a stack's records and resolve versions against them.
//!
//! History is fetched fresh on every call. The lookups are pure functions
//! over an already-fetched history, which the backend orders most-recent-first.

use std::path::Path;

use tracing::debug;

use crate::cancel::Cancellation;
use crate::error::RollbackError;
use crate::model::DeploymentRecord;
use crate::operator::{RollbackStack, StackOperator};

/// Select `stack_name` and fetch its full history.
pub fn list_history<O: StackOperator>(
    operator: &O,
    project_path: &Path,
    stack_name: &str,
    cancel: &Cancellation,
) -> Result<Vec<DeploymentRecord>, RollbackError> {
    let stack = operator
        .select_stack(stack_name, project_path, cancel)
        .map_err(|source| RollbackError::Selection {
            stack: stack_name.to_string(),
            source,
        })?;
    fetch_all(&stack, cancel)
}

/// Fetch the full history of an already-selected stack.
pub fn fetch_all<S: RollbackStack + ?Sized>(
    stack: &S,
    cancel: &Cancellation,
) -> Result<Vec<DeploymentRecord>, RollbackError> {
    // Page size 0 asks for everything in one go.
    let history = stack.history(0, 0, cancel).map_err(RollbackError::History)?;
    debug!(records = history.len(), "fetched stack history");
    Ok(history)
}

/// Whether any record in `history` has `version`.
pub fn version_exists(history: &[DeploymentRecord], version: u64) -> bool {
    history.iter().any(|record| record.version == version)
}

/// The record for `version`.
pub fn find_by_version(
    history: &[DeploymentRecord],
    version: u64,
) -> Result<&DeploymentRecord, RollbackError> {
    history
        .iter()
        .find(|record| record.version == version)
        .ok_or(RollbackError::VersionNotFound(version))
}

/// The most recent version: the first record, since history is newest-first.
pub fn latest_version(
    history: &[DeploymentRecord],
    stack_name: &str,
) -> Result<u64, RollbackError> {
    history
        .first()
        .map(|record| record.version)
        .ok_or_else(|| RollbackError::EmptyHistory(stack_name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    use crate::model::StateSnapshot;
    use crate::operator::{MemoryOperator, MemoryStackState, Operation};

    fn records(versions: &[u64]) -> Vec<DeploymentRecord> {
        versions.iter().copied().map(DeploymentRecord::new).collect()
    }

    #[test]
    fn version_exists_in_history() {
        let history = records(&[1, 2, 5]);
        let cases = [(1, true), (2, true), (5, true), (3, false), (0, false)];

        for (version, expected) in cases {
            assert_eq!(version_exists(&history, version), expected, "version {version}");
        }
    }

    #[test]
    fn version_exists_in_empty_history() {
        assert!(!version_exists(&[], 1));
    }

    #[test]
    fn find_by_version_matches_exactly_when_present() {
        let history = records(&[1, 2, 5]);

        for version in 0..8 {
            let found = find_by_version(&history, version);
            assert_eq!(found.is_ok(), version_exists(&history, version));
            if let Ok(record) = found {
                assert_eq!(record.version, version);
            }
        }
    }

    #[test]
    fn find_by_version_reports_the_missing_version() {
        let err = find_by_version(&records(&[1]), 99).unwrap_err();
        assert!(matches!(err, RollbackError::VersionNotFound(99)));
        assert_eq!(err.to_string(), "version 99 not found in stack history");
    }

    #[test]
    fn latest_version_is_the_first_record() {
        assert_eq!(latest_version(&records(&[5, 2, 1]), "dev").unwrap(), 5);
        assert_eq!(latest_version(&records(&[7]), "dev").unwrap(), 7);
    }

    #[test]
    fn latest_version_of_empty_history_fails() {
        let err = latest_version(&[], "dev").unwrap_err();
        assert!(matches!(err, RollbackError::EmptyHistory(ref s) if s == "dev"));
    }

    #[test]
    fn list_history_fetches_everything_newest_first() {
        let state = MemoryStackState::new(StateSnapshot::new(3, "{}"))
            .deploy(DeploymentRecord::new(1), None)
            .deploy(DeploymentRecord::new(2), None);
        let operator = MemoryOperator::new().with_stack("dev", state);

        let history =
            list_history(&operator, &PathBuf::from("."), "dev", &Cancellation::never()).unwrap();

        let versions: Vec<u64> = history.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![2, 1]);
        assert_eq!(operator.calls(), vec![Operation::Select, Operation::History]);
    }

    #[test]
    fn list_history_is_never_cached() {
        let operator = MemoryOperator::new()
            .with_stack("dev", MemoryStackState::new(StateSnapshot::new(3, "{}")));
        let path = PathBuf::from(".");
        let never = Cancellation::never();

        list_history(&operator, &path, "dev", &never).unwrap();
        list_history(&operator, &path, "dev", &never).unwrap();

        assert_eq!(operator.count(Operation::History), 2);
    }

    #[test]
    fn list_history_unknown_stack() {
        let operator = MemoryOperator::new();
        let err = list_history(&operator, &PathBuf::from("."), "ghost", &Cancellation::never())
            .unwrap_err();

        assert!(matches!(err, RollbackError::Selection { ref stack, .. } if stack == "ghost"));
    }

    #[test]
    fn list_history_wraps_backend_failure() {
        let operator = MemoryOperator::new()
            .with_stack("dev", MemoryStackState::new(StateSnapshot::new(3, "{}")));
        operator.fail(Operation::History, "backend unavailable");

        let err = list_history(&operator, &PathBuf::from("."), "dev", &Cancellation::never())
            .unwrap_err();

        assert!(matches!(err, RollbackError::History(_)));
        assert!(err.to_string().contains("backend unavailable"));
    }
}
