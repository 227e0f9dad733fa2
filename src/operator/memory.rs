//! In-memory stack operator.
//!
//! Stacks live in a shared map; every handle selected from one
//! [`MemoryOperator`] sees the same state. Each call is recorded, and faults
//! can be injected per operation or per call ordinal, which makes this the
//! test double for the orchestrator. It can also be loaded from a JSON
//! fixture to exercise the CLI without a real backend:
//!
//! ```json
//! {
//!   "stacks": {
//!     "dev": {
//!       "current": { "resources": [] },
//!       "deployments": [
//!         { "version": 1, "message": "initial", "checkpoint": { "resources": [] } }
//!       ],
//!       "previewChanges": { "create": 1 }
//!     }
//!   }
//! }
//! ```

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use serde::Deserialize;

use crate::cancel::Cancellation;
use crate::model::{DeploymentRecord, ResourceChanges, StateSnapshot, UpdateKind};

use super::{
    ApplyOptions, ApplyResult, BackendError, PreviewOptions, PreviewResult, RefreshOptions,
    RefreshResult, RollbackStack, StackOperator,
};

/// Deployment document schema version used for fixture snapshots.
const FIXTURE_SNAPSHOT_VERSION: u32 = 3;

/// A backend call, as recorded by [`MemoryOperator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Operation {
    Select,
    Export,
    ExportVersion,
    Import,
    History,
    Preview,
    Refresh,
    Apply,
}

#[cfg(test)]
impl Operation {
    /// Whether the call changes committed state or live infrastructure.
    pub fn is_mutating(self) -> bool {
        matches!(self, Self::Import | Self::Refresh | Self::Apply)
    }
}

/// One stack's state inside a [`MemoryOperator`].
#[derive(Debug, Clone)]
pub struct MemoryStackState {
    current: StateSnapshot,

    /// Chronological: oldest first.
    deployments: Vec<(DeploymentRecord, Option<StateSnapshot>)>,

    preview_changes: Option<ResourceChanges>,
    apply_changes: Option<ResourceChanges>,
}

impl MemoryStackState {
    pub fn new(current: StateSnapshot) -> Self {
        Self {
            current,
            deployments: Vec::new(),
            preview_changes: None,
            apply_changes: None,
        }
    }

    /// Record a deployment, optionally with the checkpoint it produced.
    #[must_use]
    pub fn deploy(mut self, record: DeploymentRecord, checkpoint: Option<StateSnapshot>) -> Self {
        self.deployments.push((record, checkpoint));
        self
    }

    /// Summary every preview on this stack reports.
    #[must_use]
    pub fn with_preview_changes(mut self, changes: Option<ResourceChanges>) -> Self {
        self.preview_changes = changes;
        self
    }

    /// Summary every apply on this stack reports.
    #[must_use]
    pub fn with_apply_changes(mut self, changes: Option<ResourceChanges>) -> Self {
        self.apply_changes = changes;
        self
    }

    fn next_version(&self) -> u64 {
        self.deployments
            .iter()
            .map(|(record, _)| record.version)
            .max()
            .unwrap_or(0)
            + 1
    }
}

#[derive(Debug)]
struct Fault {
    operation: Operation,
    /// 1-based call ordinal for this operation; `None` fails every call.
    ordinal: Option<usize>,
    message: String,
}

#[derive(Debug, Default)]
struct Backend {
    stacks: BTreeMap<String, MemoryStackState>,
    calls: Vec<Operation>,
    counts: BTreeMap<Operation, usize>,
    imports: Vec<StateSnapshot>,
    faults: Vec<Fault>,
    cancel_during: Option<(Operation, Cancellation)>,
}

impl Backend {
    /// Record a call and decide whether it fails before doing any work.
    fn enter(&mut self, operation: Operation, cancel: &Cancellation) -> Result<(), BackendError> {
        self.calls.push(operation);
        let count = self.counts.entry(operation).or_insert(0);
        *count += 1;
        let count = *count;

        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }

        if let Some((op, token)) = &self.cancel_during
            && *op == operation
        {
            token.cancel();
            return Err(BackendError::Cancelled);
        }

        let fault = self
            .faults
            .iter()
            .find(|f| f.operation == operation && f.ordinal.is_none_or(|n| n == count));
        match fault {
            Some(f) => Err(BackendError::Rejected(f.message.clone())),
            None => Ok(()),
        }
    }

    fn stack(&mut self, name: &str) -> Result<&mut MemoryStackState, BackendError> {
        self.stacks
            .get_mut(name)
            .ok_or_else(|| BackendError::StackNotFound(name.to_string()))
    }
}

/// Stack operator backed by in-memory state.
#[derive(Debug, Clone, Default)]
pub struct MemoryOperator {
    backend: Rc<RefCell<Backend>>,
}

impl MemoryOperator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a stack.
    #[must_use]
    pub fn with_stack(self, name: &str, state: MemoryStackState) -> Self {
        self.backend
            .borrow_mut()
            .stacks
            .insert(name.to_string(), state);
        self
    }

    /// Load stacks from a JSON fixture file.
    pub fn from_fixture(path: &Path) -> Result<Self, String> {
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
        Self::from_fixture_str(&contents)
            .map_err(|e| format!("invalid fixture at {}: {e}", path.display()))
    }

    pub fn from_fixture_str(json: &str) -> Result<Self, serde_json::Error> {
        let fixture: Fixture = serde_json::from_str(json)?;
        let mut operator = Self::new();
        for (name, stack) in fixture.stacks {
            let mut state = MemoryStackState::new(fixture_snapshot(&stack.current))
                .with_preview_changes(stack.preview_changes)
                .with_apply_changes(stack.apply_changes);
            for deployment in stack.deployments {
                let checkpoint = deployment.checkpoint.as_ref().map(fixture_snapshot);
                state = state.deploy(deployment.record, checkpoint);
            }
            operator = operator.with_stack(&name, state);
        }
        Ok(operator)
    }
}

/// Fault injection and call inspection.
#[cfg(test)]
impl MemoryOperator {
    /// Fail every call of `operation` with `message`.
    pub fn fail(&self, operation: Operation, message: &str) {
        self.push_fault(operation, None, message);
    }

    /// Fail only the `nth` (1-based) call of `operation`.
    pub fn fail_nth(&self, operation: Operation, nth: usize, message: &str) {
        self.push_fault(operation, Some(nth), message);
    }

    /// Fire `token` when `operation` is called, and fail that call as cancelled.
    pub fn cancel_during(&self, operation: Operation, token: Cancellation) {
        self.backend.borrow_mut().cancel_during = Some((operation, token));
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<Operation> {
        self.backend.borrow().calls.clone()
    }

    pub fn count(&self, operation: Operation) -> usize {
        self.backend
            .borrow()
            .counts
            .get(&operation)
            .copied()
            .unwrap_or(0)
    }

    /// Number of calls that change state or infrastructure.
    pub fn mutation_count(&self) -> usize {
        self.backend
            .borrow()
            .calls
            .iter()
            .filter(|op| op.is_mutating())
            .count()
    }

    /// Snapshots passed to `import`, in call order.
    pub fn imports(&self) -> Vec<StateSnapshot> {
        self.backend.borrow().imports.clone()
    }

    /// The committed state of `stack`.
    pub fn current_state(&self, stack: &str) -> Option<StateSnapshot> {
        self.backend
            .borrow()
            .stacks
            .get(stack)
            .map(|s| s.current.clone())
    }

    fn push_fault(&self, operation: Operation, ordinal: Option<usize>, message: &str) {
        self.backend.borrow_mut().faults.push(Fault {
            operation,
            ordinal,
            message: message.to_string(),
        });
    }
}

impl StackOperator for MemoryOperator {
    type Stack = MemoryStack;

    fn select_stack(
        &self,
        stack_name: &str,
        _project_path: &Path,
        cancel: &Cancellation,
    ) -> Result<MemoryStack, BackendError> {
        let mut backend = self.backend.borrow_mut();
        backend.enter(Operation::Select, cancel)?;
        backend.stack(stack_name)?;
        Ok(MemoryStack {
            name: stack_name.to_string(),
            backend: Rc::clone(&self.backend),
        })
    }
}

/// A stack selected from a [`MemoryOperator`].
#[derive(Debug)]
pub struct MemoryStack {
    name: String,
    backend: Rc<RefCell<Backend>>,
}

impl RollbackStack for MemoryStack {
    fn export(&self, cancel: &Cancellation) -> Result<StateSnapshot, BackendError> {
        let mut backend = self.backend.borrow_mut();
        backend.enter(Operation::Export, cancel)?;
        Ok(backend.stack(&self.name)?.current.clone())
    }

    fn export_version(
        &self,
        version: u64,
        cancel: &Cancellation,
    ) -> Result<StateSnapshot, BackendError> {
        let mut backend = self.backend.borrow_mut();
        backend.enter(Operation::ExportVersion, cancel)?;
        backend
            .stack(&self.name)?
            .deployments
            .iter()
            .find(|(record, _)| record.version == version)
            .and_then(|(_, checkpoint)| checkpoint.clone())
            .ok_or(BackendError::CheckpointMissing(version))
    }

    fn import(&self, snapshot: &StateSnapshot, cancel: &Cancellation) -> Result<(), BackendError> {
        let mut backend = self.backend.borrow_mut();
        backend.enter(Operation::Import, cancel)?;
        backend.imports.push(snapshot.clone());
        backend.stack(&self.name)?.current = snapshot.clone();
        Ok(())
    }

    fn history(
        &self,
        page_size: u32,
        page: u32,
        cancel: &Cancellation,
    ) -> Result<Vec<DeploymentRecord>, BackendError> {
        let mut backend = self.backend.borrow_mut();
        backend.enter(Operation::History, cancel)?;
        let newest_first = backend
            .stack(&self.name)?
            .deployments
            .iter()
            .rev()
            .map(|(record, _)| record.clone());

        if page_size == 0 {
            return Ok(newest_first.collect());
        }
        let size = page_size as usize;
        let skip = (page.max(1) as usize - 1) * size;
        Ok(newest_first.skip(skip).take(size).collect())
    }

    fn preview(
        &self,
        _options: &PreviewOptions,
        cancel: &Cancellation,
    ) -> Result<PreviewResult, BackendError> {
        let mut backend = self.backend.borrow_mut();
        backend.enter(Operation::Preview, cancel)?;
        let stack = backend.stack(&self.name)?;
        Ok(PreviewResult {
            change_summary: stack.preview_changes.clone(),
            stdout: format!("Previewing update ({})\n", self.name),
            stderr: String::new(),
        })
    }

    fn refresh(
        &self,
        _options: &RefreshOptions,
        cancel: &Cancellation,
    ) -> Result<RefreshResult, BackendError> {
        let mut backend = self.backend.borrow_mut();
        backend.enter(Operation::Refresh, cancel)?;
        backend.stack(&self.name)?;
        Ok(RefreshResult {
            stdout: format!("Refreshing ({})\n", self.name),
            stderr: String::new(),
        })
    }

    fn apply(
        &self,
        options: &ApplyOptions,
        cancel: &Cancellation,
    ) -> Result<ApplyResult, BackendError> {
        let mut backend = self.backend.borrow_mut();
        backend.enter(Operation::Apply, cancel)?;
        let stack = backend.stack(&self.name)?;

        let record = DeploymentRecord {
            kind: UpdateKind::Update,
            message: options.message.clone(),
            resource_changes: stack.apply_changes.clone().unwrap_or_default(),
            ..DeploymentRecord::new(stack.next_version())
        };
        let checkpoint = stack.current.clone();
        stack.deployments.push((record, Some(checkpoint)));

        Ok(ApplyResult {
            resource_changes: stack.apply_changes.clone(),
            stdout: format!("Updating ({})\n", self.name),
            stderr: String::new(),
        })
    }
}

// ── Fixture format ──

#[derive(Deserialize)]
struct Fixture {
    stacks: BTreeMap<String, StackFixture>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StackFixture {
    current: serde_json::Value,
    #[serde(default)]
    deployments: Vec<DeploymentFixture>,
    #[serde(default)]
    preview_changes: Option<ResourceChanges>,
    #[serde(default)]
    apply_changes: Option<ResourceChanges>,
}

#[derive(Deserialize)]
struct DeploymentFixture {
    #[serde(flatten)]
    record: DeploymentRecord,
    #[serde(default)]
    checkpoint: Option<serde_json::Value>,
}

fn fixture_snapshot(value: &serde_json::Value) -> StateSnapshot {
    StateSnapshot::new(FIXTURE_SNAPSHOT_VERSION, value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    use tempfile::TempDir;

    fn snapshot(label: &str) -> StateSnapshot {
        StateSnapshot::new(3, format!(r#"{{"label":"{label}"}}"#))
    }

    fn three_deployments() -> MemoryOperator {
        let state = MemoryStackState::new(snapshot("v3"))
            .deploy(DeploymentRecord::new(1), Some(snapshot("v1")))
            .deploy(DeploymentRecord::new(2), None)
            .deploy(DeploymentRecord::new(3), Some(snapshot("v3")));
        MemoryOperator::new().with_stack("dev", state)
    }

    fn select(operator: &MemoryOperator) -> MemoryStack {
        operator
            .select_stack("dev", &PathBuf::from("."), &Cancellation::never())
            .unwrap()
    }

    #[test]
    fn history_is_newest_first() {
        let operator = three_deployments();
        let stack = select(&operator);

        let versions: Vec<u64> = stack
            .history(0, 0, &Cancellation::never())
            .unwrap()
            .iter()
            .map(|r| r.version)
            .collect();
        assert_eq!(versions, vec![3, 2, 1]);
    }

    #[test]
    fn history_paginates() {
        let operator = three_deployments();
        let stack = select(&operator);
        let never = Cancellation::never();

        let first: Vec<u64> = stack
            .history(2, 1, &never)
            .unwrap()
            .iter()
            .map(|r| r.version)
            .collect();
        let second: Vec<u64> = stack
            .history(2, 2, &never)
            .unwrap()
            .iter()
            .map(|r| r.version)
            .collect();

        assert_eq!(first, vec![3, 2]);
        assert_eq!(second, vec![1]);
    }

    #[test]
    fn export_version_returns_that_versions_checkpoint() {
        let operator = three_deployments();
        let stack = select(&operator);
        let never = Cancellation::never();

        assert_eq!(stack.export_version(1, &never).unwrap(), snapshot("v1"));
        assert!(matches!(
            stack.export_version(2, &never),
            Err(BackendError::CheckpointMissing(2))
        ));
        assert!(matches!(
            stack.export_version(9, &never),
            Err(BackendError::CheckpointMissing(9))
        ));
    }

    #[test]
    fn import_replaces_committed_state() {
        let operator = three_deployments();
        let stack = select(&operator);
        let never = Cancellation::never();

        stack.import(&snapshot("v1"), &never).unwrap();

        assert_eq!(stack.export(&never).unwrap(), snapshot("v1"));
        assert_eq!(operator.current_state("dev"), Some(snapshot("v1")));
        assert_eq!(operator.imports(), vec![snapshot("v1")]);
    }

    #[test]
    fn apply_appends_a_deployment() {
        let operator = three_deployments();
        let stack = select(&operator);
        let never = Cancellation::never();

        let options = ApplyOptions {
            message: "Rollback to version 1".into(),
        };
        let result = stack.apply(&options, &never).unwrap();
        assert!(result.resource_changes.is_none());

        let history = stack.history(1, 1, &never).unwrap();
        assert_eq!(history[0].version, 4);
        assert_eq!(history[0].message, "Rollback to version 1");
    }

    #[test]
    fn unknown_stack_is_not_found() {
        let operator = three_deployments();
        let err = operator
            .select_stack("prod", &PathBuf::from("."), &Cancellation::never())
            .unwrap_err();

        assert!(matches!(err, BackendError::StackNotFound(name) if name == "prod"));
    }

    #[test]
    fn fail_nth_only_fails_that_call() {
        let operator = three_deployments();
        let stack = select(&operator);
        let never = Cancellation::never();
        operator.fail_nth(Operation::Import, 2, "disk full");

        assert!(stack.import(&snapshot("a"), &never).is_ok());
        assert!(matches!(
            stack.import(&snapshot("b"), &never),
            Err(BackendError::Rejected(m)) if m == "disk full"
        ));
        assert!(stack.import(&snapshot("c"), &never).is_ok());
        assert_eq!(operator.count(Operation::Import), 3);
    }

    #[test]
    fn cancelled_token_fails_calls() {
        let operator = three_deployments();
        let stack = select(&operator);
        let token = Cancellation::new();
        token.cancel();

        assert!(stack.export(&token).unwrap_err().is_cancelled());
        assert!(stack.export(&Cancellation::never()).is_ok());
    }

    #[test]
    fn cancel_during_fires_the_token() {
        let operator = three_deployments();
        let stack = select(&operator);
        let token = Cancellation::new();
        operator.cancel_during(Operation::Preview, token.clone());

        let err = stack
            .preview(&PreviewOptions::default(), &token)
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(token.is_cancelled());
    }

    #[test]
    fn mutation_count_ignores_reads() {
        let operator = three_deployments();
        let stack = select(&operator);
        let never = Cancellation::never();

        stack.export(&never).unwrap();
        stack.history(0, 0, &never).unwrap();
        stack.preview(&PreviewOptions::default(), &never).unwrap();
        assert_eq!(operator.mutation_count(), 0);

        stack.refresh(&RefreshOptions::default(), &never).unwrap();
        assert_eq!(operator.mutation_count(), 1);
    }

    #[test]
    fn loads_fixture_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fixture.json");
        fs::write(
            &path,
            r#"{
                "stacks": {
                    "dev": {
                        "current": {"resources": [1, 2]},
                        "deployments": [
                            {
                                "version": 1,
                                "kind": "update",
                                "message": "first",
                                "checkpoint": {"resources": [1]}
                            },
                            {"version": 2, "message": "second", "resourceChanges": {"create": 1}}
                        ],
                        "previewChanges": {"delete": 1}
                    }
                }
            }"#,
        )
        .unwrap();

        let operator = MemoryOperator::from_fixture(&path).unwrap();
        let stack = select(&operator);
        let never = Cancellation::never();

        let history = stack.history(0, 0, &never).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].message, "second");
        assert_eq!(history[0].resource_changes.get("create"), Some(&1));
        assert_eq!(
            stack.export_version(1, &never).unwrap().deployment,
            r#"{"resources":[1]}"#
        );

        let preview = stack.preview(&PreviewOptions::default(), &never).unwrap();
        assert_eq!(preview.change_summary.unwrap().get("delete"), Some(&1));
    }

    #[test]
    fn missing_fixture_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = MemoryOperator::from_fixture(&dir.path().join("nope.json")).unwrap_err();
        assert!(err.contains("failed to read"));
    }
}
