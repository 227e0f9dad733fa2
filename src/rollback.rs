//! Rollback orchestration: the preview and execute flows.
//!
//! Preview (non-mutating overall):
//!
//! ```text
//! select → export current → fetch checkpoint → import target → preview → restore current
//! ```
//!
//! Once the target import succeeds, the original state is always imported
//! back, whatever the preview did (including being cancelled). A restore
//! failure after a successful preview is a warning, never the call's error.
//!
//! Execute (mutating, forward-only):
//!
//! ```text
//! select → fetch checkpoint → import target → refresh → apply
//! ```
//!
//! There is no compensation here. After the target import succeeds, a
//! refresh or apply failure leaves the stack partially rolled back and is
//! reported as [`RollbackError::Incomplete`] for an operator to resolve.

mod substitution;

use std::io::Write;

use tracing::{debug, info, info_span, warn};

use crate::cancel::Cancellation;
use crate::checkpoint;
use crate::error::{RollbackError, Stage};
use crate::history;
use crate::model::{DeploymentRecord, RollbackOutcome, RollbackRequest};
use crate::operator::{
    ApplyOptions, BackendError, PreviewOptions, RefreshOptions, RollbackStack, StackOperator,
};

use substitution::StateSubstitution;

/// Where a requested rollback stands before any flow runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// The target is the latest version; nothing to do.
    AlreadyCurrent { version: u64 },

    /// The target exists and differs from the latest version.
    Ready { target: DeploymentRecord, latest: u64 },
}

/// Drives rollback flows through one stack operator.
pub struct Rollback<'o, O> {
    operator: &'o O,
    cancel: Cancellation,
}

impl<'o, O: StackOperator> Rollback<'o, O> {
    pub fn new(operator: &'o O, cancel: Cancellation) -> Self {
        Self { operator, cancel }
    }

    /// Resolve the target version against fresh history.
    pub fn plan(&self, request: &RollbackRequest<'_>) -> Result<Plan, RollbackError> {
        let history = history::list_history(
            self.operator,
            &request.project_path,
            &request.stack_name,
            &self.cancel,
        )
        .map_err(before_import)?;
        let target = history::find_by_version(&history, request.target_version)?;
        let latest = history::latest_version(&history, &request.stack_name)?;

        if target.version == latest {
            Ok(Plan::AlreadyCurrent { version: latest })
        } else {
            Ok(Plan::Ready {
                target: target.clone(),
                latest,
            })
        }
    }

    /// Carry out a plan: preview (`dry_run`) or execute.
    ///
    /// Rolling back to the current version is an informational no-op.
    pub fn run(
        &self,
        plan: Plan,
        request: &mut RollbackRequest<'_>,
    ) -> Result<RollbackOutcome, RollbackError> {
        match plan {
            Plan::AlreadyCurrent { version } => {
                info!(version, "target is already the current version");
                let outcome = RollbackOutcome::already_current(version);
                note(request.output, &outcome.message);
                Ok(outcome)
            }
            Plan::Ready { .. } if request.dry_run => self.preview(request),
            Plan::Ready { .. } => self.execute(request),
        }
    }

    /// Show what rolling back to the target version would change, leaving the stack as it was.
    pub fn preview(
        &self,
        request: &mut RollbackRequest<'_>,
    ) -> Result<RollbackOutcome, RollbackError> {
        let version = request.target_version;
        let span = info_span!("preview", stack = %request.stack_name, version);
        let _entered = span.enter();

        let stack = self.select(request).map_err(before_import)?;
        let current = stack
            .export(&self.cancel)
            .map_err(|e| before_import(RollbackError::Export(e)))?;
        let target = checkpoint::get_checkpoint(&stack, version, &self.cancel)
            .map_err(before_import)?;
        self.ensure_not_cancelled(Stage::ImportTarget)?;

        if request.verbose {
            note(
                request.output,
                &format!(
                    "Staging checkpoint {} for version {version} (current state {})",
                    target.short_digest(),
                    current.short_digest(),
                ),
            );
        }

        let substitution = StateSubstitution::begin(&stack, current, &target, &self.cancel)
            .map_err(|source| RollbackError::Import { version, source })?;

        let options = PreviewOptions {
            message: format!("Preview rollback to version {version}"),
        };
        let preview = stack.preview(&options, &self.cancel);

        let mut warnings = Vec::new();
        if let Err(e) = substitution.restore() {
            let warning = format!("failed to restore current state: {e}");
            warn!("{warning}");
            note(request.output, &format!("Warning: {warning}"));
            warnings.push(warning);
        }

        let preview = preview.map_err(|e| {
            if e.is_cancelled() {
                info!("preview cancelled after the current state was put back");
            }
            RollbackError::Preview(e)
        })?;
        info!("preview complete");

        Ok(RollbackOutcome {
            success: true,
            message: format!("Preview of rollback to version {version} completed"),
            resource_changes: preview.change_summary.unwrap_or_default(),
            stdout: preview.stdout,
            stderr: preview.stderr,
            warnings,
        })
    }

    /// Roll the stack back to the target version for real.
    pub fn execute(
        &self,
        request: &mut RollbackRequest<'_>,
    ) -> Result<RollbackOutcome, RollbackError> {
        let version = request.target_version;
        let span = info_span!("execute", stack = %request.stack_name, version);
        let _entered = span.enter();

        let stack = self.select(request).map_err(before_import)?;
        let target = checkpoint::get_checkpoint(&stack, version, &self.cancel)
            .map_err(before_import)?;
        self.ensure_not_cancelled(Stage::ImportTarget)?;

        if request.verbose {
            note(
                request.output,
                &format!("Importing checkpoint {} for version {version}", target.short_digest()),
            );
        }
        stack
            .import(&target, &self.cancel)
            .map_err(|source| RollbackError::Import { version, source })?;
        // Past this point there is no way back.
        info!(digest = %target.short_digest(), "target state imported");

        note(request.output, "Refreshing stack to reconcile with target state...");
        let options = RefreshOptions {
            message: format!("Refresh for rollback to version {version}"),
        };
        let refreshed = stack
            .refresh(&options, &self.cancel)
            .map_err(|source| incomplete(version, Stage::Refresh, source))?;

        note(request.output, "Applying rollback changes...");
        let options = ApplyOptions {
            message: format!("Rollback to version {version}"),
        };
        let applied = stack
            .apply(&options, &self.cancel)
            .map_err(|source| incomplete(version, Stage::Apply, source))?;
        info!("rollback applied");

        Ok(RollbackOutcome {
            success: true,
            message: format!("Successfully rolled back to version {version}"),
            resource_changes: applied.resource_changes.unwrap_or_default(),
            stdout: refreshed.stdout + &applied.stdout,
            stderr: refreshed.stderr + &applied.stderr,
            warnings: Vec::new(),
        })
    }

    fn select(&self, request: &RollbackRequest<'_>) -> Result<O::Stack, RollbackError> {
        self.operator
            .select_stack(&request.stack_name, &request.project_path, &self.cancel)
            .map_err(|source| RollbackError::Selection {
                stack: request.stack_name.clone(),
                source,
            })
    }

    fn ensure_not_cancelled(&self, before: Stage) -> Result<(), RollbackError> {
        if self.cancel.is_cancelled() {
            return Err(RollbackError::Cancelled(before));
        }
        Ok(())
    }
}

/// A cancelled read before the target import means nothing was changed.
fn before_import(err: RollbackError) -> RollbackError {
    if err.is_cancelled_read() {
        info!("cancelled before the target import; no changes made");
        RollbackError::Cancelled(Stage::ImportTarget)
    } else {
        err
    }
}

fn incomplete(version: u64, stage: Stage, source: BackendError) -> RollbackError {
    warn!(%stage, "rollback stopped after the target state was imported: {source}");
    RollbackError::Incomplete {
        version,
        stage,
        source,
    }
}

/// Write one progress line to the caller's sink.
///
/// The sink is informational; a failed write does not fail the flow.
fn note(output: &mut dyn Write, line: &str) {
    if let Err(e) = writeln!(output, "{line}") {
        debug!("could not write to output: {e}");
    }
}
