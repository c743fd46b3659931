use std::collections::BTreeMap;

use bonk_github::RepoRef;
use serde::{Deserialize, Serialize};

use crate::triggers::TriggerQueue;

pub const TRACKER_STATE_SCHEMA_VERSION: u32 = 1;

fn tracker_state_schema_version() -> u32 {
    TRACKER_STATE_SCHEMA_VERSION
}

/// Builds the `actor:timestamp` correlation key.
pub fn correlation_key(actor: &str, request_timestamp: &str) -> String {
    format!("{}:{}", actor.trim(), request_timestamp.trim())
}

/// Delegated work requested before its run id is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCorrelation {
    pub key: String,
    pub actor: String,
    pub request_timestamp: String,
    pub issue_number: u64,
    pub created_unix_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Polling,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
    Unknown,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Polling => "polling",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_terminal(self) -> bool {
        self != Self::Polling
    }
}

/// A run whose id is known and whose completion is being followed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedRun {
    pub run_id: u64,
    pub run_url: String,
    pub issue_number: u64,
    pub created_unix_ms: u64,
    pub state: RunState,
    #[serde(default)]
    pub polls: u64,
    #[serde(default)]
    pub finished_unix_ms: Option<u64>,
}

/// Durable aggregate owned by one repository's tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryTrackerState {
    #[serde(default = "tracker_state_schema_version")]
    pub schema_version: u32,
    pub repo: RepoRef,
    #[serde(default)]
    pub installation_id: Option<u64>,
    /// Insertion ordered; consumption takes the first actor match.
    #[serde(default)]
    pub pending: Vec<PendingCorrelation>,
    #[serde(default)]
    pub runs: BTreeMap<u64, TrackedRun>,
    #[serde(default)]
    pub triggers: TriggerQueue,
}

impl RepositoryTrackerState {
    pub fn new(repo: RepoRef) -> Self {
        Self {
            schema_version: TRACKER_STATE_SCHEMA_VERSION,
            repo,
            installation_id: None,
            pending: Vec::new(),
            runs: BTreeMap::new(),
            triggers: TriggerQueue::default(),
        }
    }

    /// Drops the oldest finished runs once more than `cap` are retained.
    pub fn prune_finished_runs(&mut self, cap: usize) {
        let mut finished = self
            .runs
            .values()
            .filter(|run| run.state.is_terminal())
            .map(|run| (run.finished_unix_ms.unwrap_or_default(), run.run_id))
            .collect::<Vec<_>>();
        if finished.len() <= cap {
            return;
        }
        finished.sort_unstable();
        let excess = finished.len() - cap;
        for (_, run_id) in finished.into_iter().take(excess) {
            self.runs.remove(&run_id);
        }
    }
}
