//! Stack operator: the single seam between the rollback core and a deployment backend.
//!
//! [`StackOperator`] selects a stack; the returned [`RollbackStack`] handle
//! exposes every backend call the core makes. Two implementations exist:
//!
//! - [`PulumiOperator`] drives the `pulumi` CLI.
//! - [`MemoryOperator`] keeps stacks in memory, for tests and fixture runs.
//!
//! The caller picks one and passes it down explicitly.

mod memory;
mod pulumi;

use std::io;
use std::path::Path;

use crate::cancel::Cancellation;
use crate::model::{DeploymentRecord, ResourceChanges, StateSnapshot};

pub use memory::MemoryOperator;
#[cfg(test)]
pub use memory::{MemoryStack, MemoryStackState, Operation};
pub use pulumi::PulumiOperator;

/// Errors reported by a backend call.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("unexpected output from `{command}`: {source}")]
    Output {
        command: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("stack not found: {0}")]
    StackNotFound(String),

    #[error("no checkpoint stored for version {0}")]
    CheckpointMissing(u64),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Rejected(String),
}

impl BackendError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Options for a preview run.
#[derive(Debug, Clone, Default)]
pub struct PreviewOptions {
    /// Message attached to the operation.
    pub message: String,
}

/// Options for a refresh run.
#[derive(Debug, Clone, Default)]
pub struct RefreshOptions {
    pub message: String,
}

/// Options for an apply (`up`) run.
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    pub message: String,
}

/// Result of a preview: the proposed changes and the captured output.
#[derive(Debug, Clone, Default)]
pub struct PreviewResult {
    /// `None` when the backend reported no summary at all.
    pub change_summary: Option<ResourceChanges>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Default)]
pub struct RefreshResult {
    pub stdout: String,
    pub stderr: String,
}

/// Result of an apply: the changes made and the captured output.
#[derive(Debug, Clone, Default)]
pub struct ApplyResult {
    /// `None` when the backend reported no summary at all.
    pub resource_changes: Option<ResourceChanges>,
    pub stdout: String,
    pub stderr: String,
}

/// Selects stacks on a deployment backend.
pub trait StackOperator {
    type Stack: RollbackStack;

    /// Select `stack_name` in the project at `project_path`.
    fn select_stack(
        &self,
        stack_name: &str,
        project_path: &Path,
        cancel: &Cancellation,
    ) -> Result<Self::Stack, BackendError>;
}

/// Backend calls against one selected stack.
///
/// Every call blocks until the backend finishes. A call observes `cancel`
/// and returns [`BackendError::Cancelled`] when it fires.
pub trait RollbackStack {
    /// Export the committed state.
    fn export(&self, cancel: &Cancellation) -> Result<StateSnapshot, BackendError>;

    /// Export the state recorded at `version`.
    ///
    /// Must return that version's own checkpoint; a backend that has none
    /// reports an error instead of substituting another state.
    fn export_version(
        &self,
        version: u64,
        cancel: &Cancellation,
    ) -> Result<StateSnapshot, BackendError>;

    /// Replace the committed state. Idempotent for identical input.
    fn import(&self, snapshot: &StateSnapshot, cancel: &Cancellation) -> Result<(), BackendError>;

    /// Deployment history, most recent first. `page_size == 0` returns everything.
    fn history(
        &self,
        page_size: u32,
        page: u32,
        cancel: &Cancellation,
    ) -> Result<Vec<DeploymentRecord>, BackendError>;

    /// Diff the committed state against the program without mutating anything.
    fn preview(
        &self,
        options: &PreviewOptions,
        cancel: &Cancellation,
    ) -> Result<PreviewResult, BackendError>;

    /// Reconcile the committed state with live infrastructure.
    fn refresh(
        &self,
        options: &RefreshOptions,
        cancel: &Cancellation,
    ) -> Result<RefreshResult, BackendError>;

    /// Change live infrastructure to match the committed state.
    fn apply(
        &self,
        options: &ApplyOptions,
        cancel: &Cancellation,
    ) -> Result<ApplyResult, BackendError>;
}
