//! Seams between the tracker and the hosting platform.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bonk_github::{RepoRef, WorkflowRunStatus};

#[async_trait]
pub trait RunStatusPoller: Send + Sync {
    async fn run_status(&self, run_id: u64) -> Result<WorkflowRunStatus>;
}

#[async_trait]
pub trait IssueNotifier: Send + Sync {
    /// Posts a new comment and returns its id.
    async fn create_comment(&self, issue_number: u64, body: &str) -> Result<u64>;
    async fn update_comment(&self, comment_id: u64, body: &str) -> Result<()>;
}

/// Authenticated session able to both poll runs and post notifications.
pub trait TrackerSession: RunStatusPoller + IssueNotifier {}

impl<T> TrackerSession for T where T: RunStatusPoller + IssueNotifier {}

/// Opens a session per operation; credentials are never cached by the tracker.
#[async_trait]
pub trait TrackerClientFactory: Send + Sync {
    async fn connect(
        &self,
        repo: &RepoRef,
        installation_id: Option<u64>,
    ) -> Result<Arc<dyn TrackerSession>>;
}
