//! Checkpoint retrieval: the state a stack had at a given version.
//!
//! The checkpoint always comes from the backend's per-version export. When
//! the backend has no checkpoint for that version, retrieval fails; the
//! current state is never used in its place, since rolling back to it would
//! silently do nothing.

use serde_json::{Map, Value};
use tracing::debug;

use crate::cancel::Cancellation;
use crate::error::RollbackError;
use crate::history;
use crate::model::StateSnapshot;
use crate::operator::RollbackStack;

/// Fetch and validate the checkpoint recorded at `version`.
///
/// Reads history first; an unknown version fails before any further backend
/// call, and nothing on this path mutates the stack.
pub fn get_checkpoint<S: RollbackStack + ?Sized>(
    stack: &S,
    version: u64,
    cancel: &Cancellation,
) -> Result<StateSnapshot, RollbackError> {
    let history = history::fetch_all(stack, cancel)?;
    if !history::version_exists(&history, version) {
        return Err(RollbackError::VersionNotFound(version));
    }

    let checkpoint = stack
        .export_version(version, cancel)
        .map_err(|source| RollbackError::CheckpointUnavailable { version, source })?;

    validate_deployment(&checkpoint)
        .map_err(|source| RollbackError::InvalidCheckpoint { version, source })?;

    debug!(version, digest = %checkpoint.short_digest(), "retrieved checkpoint");
    Ok(checkpoint)
}

/// Check that a snapshot's deployment parses as a JSON object.
///
/// Nothing beyond that is interpreted.
pub fn validate_deployment(snapshot: &StateSnapshot) -> Result<(), serde_json::Error> {
    serde_json::from_str::<Map<String, Value>>(&snapshot.deployment).map(|_| ())
}
