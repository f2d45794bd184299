//! Configuration snapshots and hot reload.

mod coordinator;
mod snapshot;

pub use coordinator::{ReloadCoordinator, ReloadReport, RuleSources};
pub use snapshot::ConfigSnapshot;
