//! Core data model: deployment records, state snapshots,
//! and the request/outcome pair exchanged with the orchestrator.

mod record;
mod rollback;
mod snapshot;

pub use record::{DeploymentRecord, ResourceChanges, UpdateKind, UpdateResult};
pub use rollback::{RollbackOutcome, RollbackRequest};
pub use snapshot::StateSnapshot;
