//! Workflow-run correlation and tracking for delegated bonk work.
//!
//! One [`RunTracker`] owns the state of one repository: pending correlations
//! waiting for a run id, tracked runs being polled, and the durable trigger
//! queue that drives polls and cleanups. [`TrackerRegistry`] keys trackers by
//! repository, serializes access to each one and fires due triggers.

mod github_backend;
pub mod messages;
pub mod ports;
pub mod registry;
pub mod state;
pub mod state_store;
pub mod tracker;
pub mod triggers;

#[cfg(test)]
mod tests;

pub use ports::{IssueNotifier, RunStatusPoller, TrackerClientFactory, TrackerSession};
pub use registry::{DriverTickReport, TrackerRegistry, TriggerSnapshot};
pub use state::{PendingCorrelation, RepositoryTrackerState, RunState, TrackedRun};
pub use tracker::{FinalizeOutcome, PollOutcome, RunTracker, TrackerConfig};
pub use triggers::{ScheduledTrigger, TriggerKind, TriggerQueue};
