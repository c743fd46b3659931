use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use bonk_github::RepoRef;
use futures_util::future::join_all;
use tokio::sync::Mutex as AsyncMutex;

use crate::ports::TrackerClientFactory;
use crate::state_store::{current_unix_timestamp_ms, list_tracker_state_files, load_tracker_state};
use crate::tracker::{RunTracker, TrackerConfig};

pub type SharedRunTracker = Arc<AsyncMutex<RunTracker>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverTickReport {
    pub repositories: usize,
    pub fired: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerSnapshot {
    pub repositories: usize,
    pub pending_triggers: usize,
    pub busy_repositories: usize,
}

/// Holds one tracker per repository. Operations on the same repository are
/// serialized by that tracker's lock; different repositories run in parallel.
pub struct TrackerRegistry {
    config: TrackerConfig,
    clients: Arc<dyn TrackerClientFactory>,
    trackers: Mutex<BTreeMap<RepoRef, SharedRunTracker>>,
}

impl TrackerRegistry {
    pub fn new(config: TrackerConfig, clients: Arc<dyn TrackerClientFactory>) -> Self {
        Self {
            config,
            clients,
            trackers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Reopens every tracker persisted under the state directory so their
    /// triggers resume firing. Unreadable files are skipped.
    pub fn recover(&self) -> Result<usize> {
        let Some(state_dir) = self.config.state_dir.as_deref() else {
            return Ok(0);
        };
        let mut recovered = 0;
        for path in list_tracker_state_files(state_dir)? {
            let state = match load_tracker_state(&path) {
                Ok(Some(state)) => state,
                Ok(None) => continue,
                Err(error) => {
                    tracing::warn!(path = %path.display(), error = %format!("{error:#}"), "skipping unreadable tracker state");
                    continue;
                }
            };
            let repo = state.repo.clone();
            let tracker = RunTracker::from_state(state, self.config.clone(), self.clients.clone());
            lock_or_recover(&self.trackers)
                .entry(repo)
                .or_insert_with(|| Arc::new(AsyncMutex::new(tracker)));
            recovered += 1;
        }
        tracing::info!(recovered, "recovered persisted trackers");
        Ok(recovered)
    }

    /// Returns the tracker for `repo`, opening it on first use.
    pub fn tracker(&self, repo: &RepoRef) -> SharedRunTracker {
        let mut trackers = lock_or_recover(&self.trackers);
        trackers
            .entry(repo.clone())
            .or_insert_with(|| {
                Arc::new(AsyncMutex::new(RunTracker::open(
                    repo.clone(),
                    self.config.clone(),
                    self.clients.clone(),
                )))
            })
            .clone()
    }

    pub fn repositories(&self) -> Vec<RepoRef> {
        lock_or_recover(&self.trackers).keys().cloned().collect()
    }

    /// Counts scheduled triggers without waiting on any tracker lock.
    /// Trackers busy with a request or a poll are reported, not counted.
    pub fn trigger_snapshot(&self) -> TriggerSnapshot {
        let trackers = lock_or_recover(&self.trackers)
            .values()
            .cloned()
            .collect::<Vec<_>>();
        let mut snapshot = TriggerSnapshot {
            repositories: trackers.len(),
            ..TriggerSnapshot::default()
        };
        for tracker in trackers {
            match tracker.try_lock() {
                Ok(guard) => snapshot.pending_triggers += guard.state().triggers.len(),
                Err(_) => snapshot.busy_repositories += 1,
            }
        }
        snapshot
    }

    /// Fires due triggers across all repositories.
    pub async fn fire_due(&self, now_unix_ms: u64) -> DriverTickReport {
        let trackers = lock_or_recover(&self.trackers)
            .values()
            .cloned()
            .collect::<Vec<_>>();
        let repositories = trackers.len();
        let fired = join_all(trackers.into_iter().map(|tracker| async move {
            tracker.lock().await.fire_due(now_unix_ms).await
        }))
        .await
        .into_iter()
        .sum();
        DriverTickReport {
            repositories,
            fired,
        }
    }

    /// Drives triggers every `tick` until `shutdown` resolves.
    pub async fn run_driver<F>(&self, tick: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            let report = self.fire_due(current_unix_timestamp_ms()).await;
            if report.fired > 0 {
                tracing::info!(
                    repositories = report.repositories,
                    fired = report.fired,
                    "tracker triggers fired"
                );
            }
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("tracker driver shutdown requested");
                    return;
                }
                _ = tokio::time::sleep(tick) => {}
            }
        }
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
