//! Per-repository run tracker.
//!
//! Every operation takes `now_unix_ms` so that scheduling is decided by the
//! caller's clock. Faults from the hosting platform never escape: a failed
//! poll is rescheduled and a failed notification is logged.

use std::path::PathBuf;
use std::sync::Arc;

use bonk_github::comment_render::render_run_notification;
use bonk_github::RepoRef;

use crate::messages::{
    notification_message, terminal_state_for_conclusion, TRACKER_TIMEOUT_CONCLUSION,
};
use crate::ports::{TrackerClientFactory, TrackerSession};
use crate::state::{correlation_key, PendingCorrelation, RepositoryTrackerState, RunState, TrackedRun};
use crate::state_store::{load_or_default_tracker_state, save_tracker_state, tracker_state_path};
use crate::triggers::{poll_trigger_id, TriggerKind};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_PENDING_EXPIRY_MS: u64 = 600_000;
pub const DEFAULT_RUN_TIMEOUT_MS: u64 = 30 * 60 * 1_000;
pub const DEFAULT_FINISHED_RUN_CAP: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Directory for durable state; `None` keeps state in memory only.
    pub state_dir: Option<PathBuf>,
    pub poll_interval_ms: u64,
    pub pending_expiry_ms: u64,
    pub run_timeout_ms: u64,
    pub finished_run_cap: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            pending_expiry_ms: DEFAULT_PENDING_EXPIRY_MS,
            run_timeout_ms: DEFAULT_RUN_TIMEOUT_MS,
            finished_run_cap: DEFAULT_FINISHED_RUN_CAP,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Rescheduled { due_unix_ms: u64 },
    Finished { state: RunState, notified: bool },
    AlreadyFinished(RunState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Finished { state: RunState, notified: bool },
    AlreadyFinished(RunState),
    UnknownRun,
}

pub struct RunTracker {
    config: TrackerConfig,
    state: RepositoryTrackerState,
    state_path: Option<PathBuf>,
    clients: Arc<dyn TrackerClientFactory>,
}

impl RunTracker {
    /// Opens the tracker for `repo`, restoring durable state when configured.
    pub fn open(
        repo: RepoRef,
        config: TrackerConfig,
        clients: Arc<dyn TrackerClientFactory>,
    ) -> Self {
        let state_path = config
            .state_dir
            .as_deref()
            .map(|dir| tracker_state_path(dir, &repo));
        let state = match state_path.as_deref() {
            Some(path) => load_or_default_tracker_state(path, &repo),
            None => RepositoryTrackerState::new(repo),
        };
        Self {
            config,
            state,
            state_path,
            clients,
        }
    }

    pub fn from_state(
        state: RepositoryTrackerState,
        config: TrackerConfig,
        clients: Arc<dyn TrackerClientFactory>,
    ) -> Self {
        let state_path = config
            .state_dir
            .as_deref()
            .map(|dir| tracker_state_path(dir, &state.repo));
        Self {
            config,
            state,
            state_path,
            clients,
        }
    }

    pub fn repo(&self) -> &RepoRef {
        &self.state.repo
    }

    pub fn state(&self) -> &RepositoryTrackerState {
        &self.state
    }

    pub fn next_due_unix_ms(&self) -> Option<u64> {
        self.state.triggers.next_due_unix_ms()
    }

    pub fn set_installation_id(&mut self, installation_id: Option<u64>) {
        if installation_id.is_some() && self.state.installation_id != installation_id {
            self.state.installation_id = installation_id;
            self.persist();
        }
    }

    /// Records delegated work awaiting its run id and schedules its expiry.
    ///
    /// A second registration under the same `actor:timestamp` key overwrites
    /// the first in place.
    pub fn register_pending(
        &mut self,
        actor: &str,
        request_timestamp: &str,
        issue_number: u64,
        now_unix_ms: u64,
    ) -> String {
        let key = correlation_key(actor, request_timestamp);
        let entry = PendingCorrelation {
            key: key.clone(),
            actor: actor.trim().to_string(),
            request_timestamp: request_timestamp.trim().to_string(),
            issue_number,
            created_unix_ms: now_unix_ms,
        };
        match self.state.pending.iter_mut().find(|pending| pending.key == key) {
            Some(existing) => *existing = entry,
            None => self.state.pending.push(entry),
        }
        let due_unix_ms = now_unix_ms.saturating_add(self.config.pending_expiry_ms);
        self.state
            .triggers
            .schedule(TriggerKind::Cleanup { key: key.clone() }, due_unix_ms);
        tracing::info!(
            repo = %self.state.repo,
            key = %key,
            issue_number,
            cleanup_due_unix_ms = due_unix_ms,
            "registered pending correlation"
        );
        self.persist();
        key
    }

    /// Removes and returns the earliest pending entry for `actor`.
    pub fn consume_pending(&mut self, actor: &str) -> Option<PendingCorrelation> {
        let actor = actor.trim();
        let index = self
            .state
            .pending
            .iter()
            .position(|pending| pending.actor.eq_ignore_ascii_case(actor))?;
        let consumed = self.state.pending.remove(index);
        tracing::info!(
            repo = %self.state.repo,
            key = %consumed.key,
            issue_number = consumed.issue_number,
            "consumed pending correlation"
        );
        self.persist();
        Some(consumed)
    }

    /// Starts polling `run_id`. Returns false when the run is already known.
    pub fn track_run(
        &mut self,
        run_id: u64,
        run_url: &str,
        issue_number: u64,
        now_unix_ms: u64,
    ) -> bool {
        self.track_run_created_at(run_id, run_url, issue_number, now_unix_ms, now_unix_ms)
    }

    /// Like [`RunTracker::track_run`] with the timeout measured from
    /// `created_unix_ms` instead of now.
    pub fn track_run_created_at(
        &mut self,
        run_id: u64,
        run_url: &str,
        issue_number: u64,
        created_unix_ms: u64,
        now_unix_ms: u64,
    ) -> bool {
        if let Some(existing) = self.state.runs.get(&run_id) {
            tracing::debug!(
                repo = %self.state.repo,
                run_id,
                state = existing.state.as_str(),
                "run already tracked"
            );
            return false;
        }
        self.state.runs.insert(
            run_id,
            TrackedRun {
                run_id,
                run_url: run_url.to_string(),
                issue_number,
                created_unix_ms,
                state: RunState::Polling,
                polls: 0,
                finished_unix_ms: None,
            },
        );
        let due_unix_ms =
            self.schedule_poll(run_id, run_url, issue_number, created_unix_ms, now_unix_ms);
        tracing::info!(
            repo = %self.state.repo,
            run_id,
            issue_number,
            poll_due_unix_ms = due_unix_ms,
            "tracking workflow run"
        );
        self.persist();
        true
    }

    /// Handles a poll trigger for `run_id`.
    pub async fn on_poll_fire(
        &mut self,
        run_id: u64,
        run_url: &str,
        issue_number: u64,
        created_unix_ms: u64,
        now_unix_ms: u64,
    ) -> PollOutcome {
        if let Some(state) = self
            .state
            .runs
            .get(&run_id)
            .map(|run| run.state)
            .filter(|state| state.is_terminal())
        {
            tracing::debug!(repo = %self.state.repo, run_id, state = state.as_str(), "poll for finished run ignored");
            return PollOutcome::AlreadyFinished(state);
        }

        let run = self.state.runs.entry(run_id).or_insert_with(|| TrackedRun {
            run_id,
            run_url: run_url.to_string(),
            issue_number,
            created_unix_ms,
            state: RunState::Polling,
            polls: 0,
            finished_unix_ms: None,
        });
        run.polls = run.polls.saturating_add(1);

        let elapsed_ms = now_unix_ms.saturating_sub(created_unix_ms);
        if elapsed_ms > self.config.run_timeout_ms {
            tracing::warn!(repo = %self.state.repo, run_id, elapsed_ms, "workflow run exceeded tracking ceiling");
            let (state, notified) = self
                .complete(
                    run_id,
                    Some(TRACKER_TIMEOUT_CONCLUSION),
                    run_url,
                    issue_number,
                    now_unix_ms,
                    None,
                )
                .await;
            return PollOutcome::Finished { state, notified };
        }

        let session = match self
            .clients
            .connect(&self.state.repo, self.state.installation_id)
            .await
        {
            Ok(session) => session,
            Err(error) => {
                tracing::warn!(repo = %self.state.repo, run_id, error = %format!("{error:#}"), "failed to open session for poll");
                return self.reschedule(run_id, run_url, issue_number, created_unix_ms, now_unix_ms);
            }
        };

        let polled = session.run_status(run_id).await;
        match polled {
            Ok(status) if status.is_completed() => {
                let (state, notified) = self
                    .complete(
                        run_id,
                        status.conclusion.as_deref(),
                        run_url,
                        issue_number,
                        now_unix_ms,
                        Some(session),
                    )
                    .await;
                PollOutcome::Finished { state, notified }
            }
            Ok(status) => {
                tracing::debug!(repo = %self.state.repo, run_id, status = %status.status, "workflow run still active");
                self.reschedule(run_id, run_url, issue_number, created_unix_ms, now_unix_ms)
            }
            Err(error) => {
                tracing::warn!(repo = %self.state.repo, run_id, error = %format!("{error:#}"), "workflow run status query failed");
                self.reschedule(run_id, run_url, issue_number, created_unix_ms, now_unix_ms)
            }
        }
    }

    /// Drops the pending entry with `key`; a no-op once it was consumed.
    pub fn on_cleanup_fire(&mut self, key: &str) -> bool {
        let before = self.state.pending.len();
        self.state.pending.retain(|pending| pending.key != key);
        let removed = self.state.pending.len() != before;
        if removed {
            tracing::info!(repo = %self.state.repo, key, "expired pending correlation");
            self.persist();
        }
        removed
    }

    /// Reports a terminal conclusion directly, skipping remaining polls.
    pub async fn finalize_run(
        &mut self,
        run_id: u64,
        conclusion: Option<&str>,
        now_unix_ms: u64,
    ) -> FinalizeOutcome {
        let Some(run) = self.state.runs.get(&run_id).cloned() else {
            tracing::debug!(repo = %self.state.repo, run_id, "finalize for untracked run ignored");
            return FinalizeOutcome::UnknownRun;
        };
        if run.state.is_terminal() {
            return FinalizeOutcome::AlreadyFinished(run.state);
        }
        let (state, notified) = self
            .complete(
                run_id,
                conclusion,
                &run.run_url,
                run.issue_number,
                now_unix_ms,
                None,
            )
            .await;
        FinalizeOutcome::Finished { state, notified }
    }

    /// Fires every trigger due at `now_unix_ms` and returns how many fired.
    pub async fn fire_due(&mut self, now_unix_ms: u64) -> usize {
        let due = self.state.triggers.take_due(now_unix_ms);
        if due.is_empty() {
            return 0;
        }
        let fired = due.len();
        for trigger in due {
            match trigger.kind {
                TriggerKind::Poll {
                    run_id,
                    run_url,
                    issue_number,
                    created_unix_ms,
                } => {
                    self.on_poll_fire(run_id, &run_url, issue_number, created_unix_ms, now_unix_ms)
                        .await;
                }
                TriggerKind::Cleanup { key } => {
                    self.on_cleanup_fire(&key);
                }
            }
        }
        self.persist();
        fired
    }

    fn schedule_poll(
        &mut self,
        run_id: u64,
        run_url: &str,
        issue_number: u64,
        created_unix_ms: u64,
        now_unix_ms: u64,
    ) -> u64 {
        let due_unix_ms = now_unix_ms.saturating_add(self.config.poll_interval_ms);
        self.state.triggers.schedule(
            TriggerKind::Poll {
                run_id,
                run_url: run_url.to_string(),
                issue_number,
                created_unix_ms,
            },
            due_unix_ms,
        );
        due_unix_ms
    }

    fn reschedule(
        &mut self,
        run_id: u64,
        run_url: &str,
        issue_number: u64,
        created_unix_ms: u64,
        now_unix_ms: u64,
    ) -> PollOutcome {
        let due_unix_ms =
            self.schedule_poll(run_id, run_url, issue_number, created_unix_ms, now_unix_ms);
        self.persist();
        PollOutcome::Rescheduled { due_unix_ms }
    }

    /// Marks the run terminal before notifying so a notification is sent at
    /// most once per run.
    async fn complete(
        &mut self,
        run_id: u64,
        conclusion: Option<&str>,
        run_url: &str,
        issue_number: u64,
        now_unix_ms: u64,
        session: Option<Arc<dyn TrackerSession>>,
    ) -> (RunState, bool) {
        let state = terminal_state_for_conclusion(conclusion);
        if let Some(run) = self.state.runs.get_mut(&run_id) {
            run.state = state;
            run.finished_unix_ms = Some(now_unix_ms);
        }
        self.state.triggers.cancel(&poll_trigger_id(run_id));
        self.state.prune_finished_runs(self.config.finished_run_cap);
        self.persist();
        tracing::info!(
            repo = %self.state.repo,
            run_id,
            state = state.as_str(),
            conclusion = conclusion.unwrap_or("unknown"),
            "workflow run finished"
        );

        if state == RunState::Succeeded {
            return (state, false);
        }
        let body = render_run_notification(&notification_message(conclusion), run_url);
        let notified = self.notify(issue_number, &body, session).await;
        (state, notified)
    }

    async fn notify(
        &self,
        issue_number: u64,
        body: &str,
        session: Option<Arc<dyn TrackerSession>>,
    ) -> bool {
        let session = match session {
            Some(session) => session,
            None => match self
                .clients
                .connect(&self.state.repo, self.state.installation_id)
                .await
            {
                Ok(session) => session,
                Err(error) => {
                    tracing::warn!(repo = %self.state.repo, issue_number, error = %format!("{error:#}"), "failed to open session for notification");
                    return false;
                }
            },
        };
        match session.create_comment(issue_number, body).await {
            Ok(comment_id) => {
                tracing::info!(repo = %self.state.repo, issue_number, comment_id, "posted run notification");
                true
            }
            Err(error) => {
                tracing::warn!(repo = %self.state.repo, issue_number, error = %format!("{error:#}"), "failed to post run notification");
                false
            }
        }
    }

    fn persist(&self) {
        let Some(path) = self.state_path.as_deref() else {
            return;
        };
        if let Err(error) = save_tracker_state(path, &self.state) {
            tracing::warn!(
                repo = %self.state.repo,
                path = %path.display(),
                error = %format!("{error:#}"),
                "failed to persist tracker state"
            );
        }
    }
}
