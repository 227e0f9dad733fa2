//! Rollback request and outcome: what the caller asks for and what comes back.

use std::io::Write;
use std::path::PathBuf;

use super::ResourceChanges;

/// One invocation of the preview or execute flow.
///
/// Progress lines and the restore warning are written to `output`.
pub struct RollbackRequest<'a> {
    pub project_path: PathBuf,
    pub stack_name: String,
    pub target_version: u64,

    /// Preview only; never apply.
    pub dry_run: bool,

    pub verbose: bool,
    pub output: &'a mut dyn Write,
}

impl std::fmt::Debug for RollbackRequest<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackRequest")
            .field("project_path", &self.project_path)
            .field("stack_name", &self.stack_name)
            .field("target_version", &self.target_version)
            .field("dry_run", &self.dry_run)
            .field("verbose", &self.verbose)
            .finish_non_exhaustive()
    }
}

/// What a preview or execute flow produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackOutcome {
    pub success: bool,
    pub message: String,
    pub resource_changes: ResourceChanges,
    pub stdout: String,
    pub stderr: String,

    /// Non-fatal problems, such as a failed restore after a successful preview.
    pub warnings: Vec<String>,
}

impl RollbackOutcome {
    /// The informational outcome when the target is already the current version.
    pub fn already_current(version: u64) -> Self {
        Self {
            success: true,
            message: format!("Version {version} is the current version. No rollback needed."),
            ..Self::default()
        }
    }
}
