//! Reactive team store
//!
//! The single source of truth for workflow state, with selector-scoped
//! subscriptions, redacted snapshots, and log-derived statistics.

mod snapshot;
mod stats;
mod team_store;

pub use snapshot::{REDACTED, cleaned_state};
pub use stats::{CostDetails, ModelUsage, WorkflowStats, compute_workflow_stats};
pub use team_store::{DEFAULT_MAX_CONCURRENCY, Subscription, TeamState, TeamStore};
