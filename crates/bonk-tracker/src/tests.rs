use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bonk_github::{RepoRef, WorkflowRunStatus};
use tempfile::tempdir;

use crate::ports::{IssueNotifier, RunStatusPoller, TrackerClientFactory, TrackerSession};
use crate::registry::TrackerRegistry;
use crate::state::RunState;
use crate::tracker::{FinalizeOutcome, PollOutcome, RunTracker, TrackerConfig};
use crate::triggers::{cleanup_trigger_id, poll_trigger_id};

const T0: u64 = 1_700_000_000_000;
const RUN_URL: &str = "https://github.com/acme/widgets/actions/runs/7";

#[derive(Default)]
struct FakeHost {
    statuses: Mutex<VecDeque<WorkflowRunStatus>>,
    status_calls: AtomicUsize,
    comments: Mutex<Vec<(u64, String)>>,
    fail_connect: AtomicBool,
    fail_status: AtomicBool,
    fail_comments: AtomicBool,
    connects: AtomicUsize,
}

impl FakeHost {
    fn push_status(&self, status: &str, conclusion: Option<&str>) {
        self.statuses
            .lock()
            .expect("statuses lock")
            .push_back(WorkflowRunStatus {
                id: 7,
                status: status.to_string(),
                conclusion: conclusion.map(str::to_string),
                html_url: Some(RUN_URL.to_string()),
            });
    }

    fn comments(&self) -> Vec<(u64, String)> {
        self.comments.lock().expect("comments lock").clone()
    }
}

#[async_trait]
impl RunStatusPoller for FakeHost {
    async fn run_status(&self, _run_id: u64) -> Result<WorkflowRunStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_status.load(Ordering::SeqCst) {
            bail!("github api returned 502");
        }
        self.statuses
            .lock()
            .expect("statuses lock")
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted status"))
    }
}

#[async_trait]
impl IssueNotifier for FakeHost {
    async fn create_comment(&self, issue_number: u64, body: &str) -> Result<u64> {
        if self.fail_comments.load(Ordering::SeqCst) {
            bail!("comment rejected");
        }
        let mut comments = self.comments.lock().expect("comments lock");
        comments.push((issue_number, body.to_string()));
        Ok(comments.len() as u64)
    }

    async fn update_comment(&self, _comment_id: u64, _body: &str) -> Result<()> {
        Ok(())
    }
}

struct FakeClients {
    host: Arc<FakeHost>,
}

#[async_trait]
impl TrackerClientFactory for FakeClients {
    async fn connect(
        &self,
        _repo: &RepoRef,
        _installation_id: Option<u64>,
    ) -> Result<Arc<dyn TrackerSession>> {
        self.host.connects.fetch_add(1, Ordering::SeqCst);
        if self.host.fail_connect.load(Ordering::SeqCst) {
            bail!("installation token unavailable");
        }
        let session: Arc<dyn TrackerSession> = self.host.clone();
        Ok(session)
    }
}

fn repo() -> RepoRef {
    RepoRef::new("acme", "widgets")
}

fn tracker_with(config: TrackerConfig) -> (RunTracker, Arc<FakeHost>) {
    let host = Arc::new(FakeHost::default());
    let clients = Arc::new(FakeClients { host: host.clone() });
    (RunTracker::open(repo(), config, clients), host)
}

fn tracker() -> (RunTracker, Arc<FakeHost>) {
    tracker_with(TrackerConfig::default())
}

#[test]
fn functional_pending_entry_is_consumed_exactly_once() {
    let (mut tracker, _host) = tracker();
    let key = tracker.register_pending("alice", "2024-01-01T00:00:00Z", 42, T0);
    assert_eq!(key, "alice:2024-01-01T00:00:00Z");

    let consumed = tracker.consume_pending("alice").expect("first consume");
    assert_eq!(consumed.issue_number, 42);
    assert!(tracker.consume_pending("alice").is_none());
}

#[test]
fn functional_consume_takes_first_registered_entry_for_actor() {
    let (mut tracker, _host) = tracker();
    tracker.register_pending("alice", "2024-01-01T00:00:00Z", 1, T0);
    tracker.register_pending("bob", "2024-01-01T00:00:01Z", 2, T0);
    tracker.register_pending("alice", "2024-01-01T00:00:02Z", 3, T0);

    assert_eq!(tracker.consume_pending("alice").map(|p| p.issue_number), Some(1));
    assert_eq!(tracker.consume_pending("alice").map(|p| p.issue_number), Some(3));
    assert_eq!(tracker.consume_pending("bob").map(|p| p.issue_number), Some(2));
    assert!(tracker.consume_pending("carol").is_none());
}

#[test]
fn regression_registering_same_key_overwrites_in_place() {
    let (mut tracker, _host) = tracker();
    tracker.register_pending("alice", "2024-01-01T00:00:00Z", 1, T0);
    tracker.register_pending("bob", "2024-01-01T00:00:01Z", 2, T0);
    tracker.register_pending("alice", "2024-01-01T00:00:00Z", 9, T0 + 5);

    let pending = &tracker.state().pending;
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].issue_number, 9);
    assert_eq!(pending[1].actor, "bob");
    assert_eq!(
        tracker
            .state()
            .triggers
            .get(&cleanup_trigger_id("alice:2024-01-01T00:00:00Z"))
            .map(|trigger| trigger.due_unix_ms),
        Some(T0 + 5 + 600_000)
    );
}

#[tokio::test]
async fn functional_cleanup_expires_unconsumed_entries_and_ignores_consumed_ones() {
    let (mut tracker, _host) = tracker();
    tracker.register_pending("alice", "2024-01-01T00:00:00Z", 1, T0);
    tracker.register_pending("bob", "2024-01-01T00:00:00Z", 2, T0);
    assert!(tracker.consume_pending("bob").is_some());

    assert_eq!(tracker.fire_due(T0 + 599_999).await, 0);
    assert_eq!(tracker.state().pending.len(), 1);

    assert_eq!(tracker.fire_due(T0 + 600_000).await, 2);
    assert!(tracker.state().pending.is_empty());
    assert!(tracker.consume_pending("alice").is_none());
    assert!(tracker.state().triggers.is_empty());
}

#[tokio::test]
async fn integration_cancelled_run_posts_exactly_one_notification() {
    let (mut tracker, host) = tracker();
    host.push_status("in_progress", None);
    host.push_status("completed", Some("cancelled"));

    assert!(tracker.track_run(7, RUN_URL, 42, T0));
    assert_eq!(tracker.fire_due(T0 + 29_999).await, 0);
    assert_eq!(tracker.fire_due(T0 + 30_000).await, 1);
    assert!(host.comments().is_empty());
    assert_eq!(
        tracker
            .state()
            .triggers
            .get(&poll_trigger_id(7))
            .map(|trigger| trigger.due_unix_ms),
        Some(T0 + 60_000)
    );

    assert_eq!(tracker.fire_due(T0 + 60_000).await, 1);
    let comments = host.comments();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].0, 42);
    assert!(comments[0].1.contains("cancelled"));
    assert!(comments[0].1.contains(RUN_URL));
    assert_eq!(tracker.state().runs[&7].state, RunState::Cancelled);
    assert!(tracker.state().triggers.is_empty());

    let again = tracker.on_poll_fire(7, RUN_URL, 42, T0, T0 + 90_000).await;
    assert_eq!(again, PollOutcome::AlreadyFinished(RunState::Cancelled));
    assert_eq!(host.comments().len(), 1);
    assert_eq!(host.status_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn functional_successful_run_finishes_silently() {
    let (mut tracker, host) = tracker();
    host.push_status("completed", Some("success"));
    tracker.track_run(7, RUN_URL, 42, T0);

    let outcome = tracker.on_poll_fire(7, RUN_URL, 42, T0, T0 + 30_000).await;
    assert_eq!(
        outcome,
        PollOutcome::Finished {
            state: RunState::Succeeded,
            notified: false
        }
    );
    assert!(host.comments().is_empty());
}

#[tokio::test]
async fn functional_failure_and_unknown_conclusions_use_message_table() {
    let (mut tracker, host) = tracker();
    host.push_status("completed", Some("failure"));
    tracker.track_run(7, RUN_URL, 1, T0);
    tracker.fire_due(T0 + 30_000).await;

    host.push_status("completed", Some("action_required"));
    tracker.track_run(8, "", 2, T0);
    tracker.fire_due(T0 + 30_000).await;

    let comments = host.comments();
    assert_eq!(comments.len(), 2);
    assert!(comments[0].1.contains("workflow failed, check logs"));
    assert!(comments[1]
        .1
        .contains("workflow finished with status: action_required"));
    assert_eq!(tracker.state().runs[&8].state, RunState::Unknown);
}

#[tokio::test]
async fn functional_run_past_ceiling_times_out_without_querying() {
    let (mut tracker, host) = tracker();
    tracker.track_run(7, RUN_URL, 42, T0);

    let outcome = tracker
        .on_poll_fire(7, RUN_URL, 42, T0, T0 + 30 * 60 * 1_000 + 1)
        .await;
    assert_eq!(
        outcome,
        PollOutcome::Finished {
            state: RunState::TimedOut,
            notified: true
        }
    );
    assert_eq!(host.status_calls.load(Ordering::SeqCst), 0);
    let comments = host.comments();
    assert_eq!(comments.len(), 1);
    assert!(comments[0].1.contains("workflow timed out"));
}

#[tokio::test]
async fn functional_in_progress_run_polls_every_interval_until_ceiling() {
    let (mut tracker, host) = tracker();
    for _ in 0..60 {
        host.push_status("in_progress", None);
    }
    tracker.track_run(7, RUN_URL, 42, T0);
    assert_eq!(tracker.next_due_unix_ms(), Some(T0 + 30_000));

    for step in 1..=60_u64 {
        let now = T0 + step * 30_000;
        assert_eq!(tracker.fire_due(now - 1).await, 0);
        assert_eq!(tracker.fire_due(now).await, 1);
        assert_eq!(tracker.next_due_unix_ms(), Some(now + 30_000));
        assert_eq!(tracker.state().runs[&7].state, RunState::Polling);
    }
    assert_eq!(host.status_calls.load(Ordering::SeqCst), 60);
    assert!(host.comments().is_empty());

    assert_eq!(tracker.fire_due(T0 + 61 * 30_000).await, 1);
    assert_eq!(host.status_calls.load(Ordering::SeqCst), 60);
    assert_eq!(tracker.state().runs[&7].state, RunState::TimedOut);
    assert!(tracker.state().triggers.is_empty());
    let comments = host.comments();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].0, 42);
    assert!(comments[0].1.contains("workflow timed out"));

    assert_eq!(tracker.fire_due(T0 + 3_600_000).await, 0);
    assert_eq!(host.comments().len(), 1);
}

#[tokio::test]
async fn regression_status_query_failure_reschedules_without_notifying() {
    let (mut tracker, host) = tracker();
    host.fail_status.store(true, Ordering::SeqCst);
    tracker.track_run(7, RUN_URL, 42, T0);

    let outcome = tracker.on_poll_fire(7, RUN_URL, 42, T0, T0 + 30_000).await;
    assert_eq!(
        outcome,
        PollOutcome::Rescheduled {
            due_unix_ms: T0 + 60_000
        }
    );
    assert!(host.comments().is_empty());
    assert_eq!(tracker.state().runs[&7].state, RunState::Polling);
}

#[tokio::test]
async fn regression_connect_failure_reschedules_poll() {
    let (mut tracker, host) = tracker();
    host.fail_connect.store(true, Ordering::SeqCst);
    tracker.track_run(7, RUN_URL, 42, T0);

    assert_eq!(tracker.fire_due(T0 + 30_000).await, 1);
    assert_eq!(tracker.state().runs[&7].polls, 1);
    assert!(tracker.state().triggers.get(&poll_trigger_id(7)).is_some());
    assert_eq!(host.status_calls.load(Ordering::SeqCst), 0);
    assert_eq!(host.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn regression_notification_failure_still_finishes_run_once() {
    let (mut tracker, host) = tracker();
    host.fail_comments.store(true, Ordering::SeqCst);
    host.push_status("completed", Some("failure"));
    tracker.track_run(7, RUN_URL, 42, T0);

    let outcome = tracker.on_poll_fire(7, RUN_URL, 42, T0, T0 + 30_000).await;
    assert_eq!(
        outcome,
        PollOutcome::Finished {
            state: RunState::Failed,
            notified: false
        }
    );
    assert!(tracker.state().triggers.is_empty());
}

#[tokio::test]
async fn functional_finalize_short_circuits_polling() {
    let (mut tracker, host) = tracker();
    tracker.track_run(7, RUN_URL, 42, T0);

    let outcome = tracker.finalize_run(7, Some("failure"), T0 + 5_000).await;
    assert_eq!(
        outcome,
        FinalizeOutcome::Finished {
            state: RunState::Failed,
            notified: true
        }
    );
    assert!(tracker.state().triggers.is_empty());
    assert_eq!(
        tracker.finalize_run(7, Some("failure"), T0 + 6_000).await,
        FinalizeOutcome::AlreadyFinished(RunState::Failed)
    );
    assert_eq!(tracker.fire_due(T0 + 60_000).await, 0);
    assert_eq!(host.comments().len(), 1);
    assert_eq!(host.status_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unit_finalize_ignores_untracked_runs_and_success_is_silent() {
    let (mut tracker, host) = tracker();
    assert_eq!(
        tracker.finalize_run(99, Some("failure"), T0).await,
        FinalizeOutcome::UnknownRun
    );
    tracker.track_run(7, RUN_URL, 42, T0);
    assert_eq!(
        tracker.finalize_run(7, Some("success"), T0 + 1).await,
        FinalizeOutcome::Finished {
            state: RunState::Succeeded,
            notified: false
        }
    );
    assert!(host.comments().is_empty());
}

#[tokio::test]
async fn functional_timeout_is_measured_from_supplied_creation_time() {
    let (mut tracker, host) = tracker();
    let created = T0 - 29 * 60 * 1_000;
    assert!(tracker.track_run_created_at(7, RUN_URL, 42, created, T0));
    host.push_status("in_progress", None);

    assert_eq!(tracker.fire_due(T0 + 30_000).await, 1);
    assert_eq!(tracker.state().runs[&7].state, RunState::Polling);

    assert_eq!(tracker.fire_due(T0 + 60_001).await, 1);
    assert_eq!(tracker.state().runs[&7].state, RunState::TimedOut);
    assert_eq!(host.status_calls.load(Ordering::SeqCst), 1);
    assert!(host.comments()[0].1.contains("workflow timed out"));
}

#[test]
fn unit_track_run_is_idempotent_per_run_id() {
    let (mut tracker, _host) = tracker();
    assert!(tracker.track_run(7, RUN_URL, 42, T0));
    assert!(!tracker.track_run(7, RUN_URL, 42, T0 + 10));
    assert_eq!(tracker.state().triggers.len(), 1);
}

#[tokio::test]
async fn integration_state_survives_restart_and_resumes_polling() {
    let temp = tempdir().expect("tempdir");
    let config = TrackerConfig {
        state_dir: Some(temp.path().to_path_buf()),
        ..TrackerConfig::default()
    };
    {
        let (mut tracker, _host) = tracker_with(config.clone());
        tracker.set_installation_id(Some(55));
        tracker.register_pending("alice", "2024-01-01T00:00:00Z", 42, T0);
        tracker.track_run(7, RUN_URL, 42, T0);
    }

    let host = Arc::new(FakeHost::default());
    host.push_status("completed", Some("timed_out"));
    let registry = TrackerRegistry::new(config, Arc::new(FakeClients { host: host.clone() }));
    assert_eq!(registry.recover().expect("recover"), 1);
    assert_eq!(registry.repositories(), vec![repo()]);

    {
        let tracker = registry.tracker(&repo());
        let tracker = tracker.lock().await;
        assert_eq!(tracker.state().installation_id, Some(55));
        assert_eq!(tracker.state().pending.len(), 1);
    }

    let report = registry.fire_due(T0 + 30_000).await;
    assert_eq!(report.repositories, 1);
    assert_eq!(report.fired, 1);
    let comments = host.comments();
    assert_eq!(comments.len(), 1);
    assert!(comments[0].1.contains("workflow timed out"));

    let report = registry.fire_due(T0 + 600_000).await;
    assert_eq!(report.fired, 1);
    let tracker = registry.tracker(&repo());
    assert!(tracker.lock().await.state().pending.is_empty());
}

#[tokio::test]
async fn functional_registry_keeps_repositories_independent() {
    let host = Arc::new(FakeHost::default());
    let registry = TrackerRegistry::new(
        TrackerConfig::default(),
        Arc::new(FakeClients { host: host.clone() }),
    );
    let other = RepoRef::new("acme", "gadgets");
    registry
        .tracker(&repo())
        .lock()
        .await
        .register_pending("alice", "t1", 1, T0);
    registry
        .tracker(&other)
        .lock()
        .await
        .register_pending("alice", "t2", 2, T0);

    let consumed = registry.tracker(&other).lock().await.consume_pending("alice");
    assert_eq!(consumed.map(|pending| pending.issue_number), Some(2));
    let consumed = registry.tracker(&repo()).lock().await.consume_pending("alice");
    assert_eq!(consumed.map(|pending| pending.issue_number), Some(1));
    assert_eq!(registry.repositories().len(), 2);
    let snapshot = registry.trigger_snapshot();
    assert_eq!(snapshot.repositories, 2);
    assert_eq!(snapshot.pending_triggers, 2);
    assert_eq!(snapshot.busy_repositories, 0);
}

#[tokio::test]
async fn regression_trigger_snapshot_skips_busy_tracker() {
    let registry = TrackerRegistry::new(
        TrackerConfig::default(),
        Arc::new(FakeClients {
            host: Arc::new(FakeHost::default()),
        }),
    );
    let other = RepoRef::new("acme", "gadgets");
    registry
        .tracker(&repo())
        .lock()
        .await
        .register_pending("alice", "t1", 1, T0);
    registry
        .tracker(&other)
        .lock()
        .await
        .register_pending("bob", "t2", 2, T0);

    let busy = registry.tracker(&repo());
    let _held = busy.lock().await;
    let snapshot = registry.trigger_snapshot();
    assert_eq!(snapshot.repositories, 2);
    assert_eq!(snapshot.pending_triggers, 1);
    assert_eq!(snapshot.busy_repositories, 1);
}

#[tokio::test]
async fn unit_driver_stops_on_shutdown() {
    let registry = TrackerRegistry::new(
        TrackerConfig::default(),
        Arc::new(FakeClients {
            host: Arc::new(FakeHost::default()),
        }),
    );
    registry
        .run_driver(std::time::Duration::from_secs(60), async {})
        .await;
}
