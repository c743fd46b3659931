use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bonk_github::{GithubApiClient, GithubClientFactory, RepoRef, WorkflowRunStatus};

use crate::ports::{IssueNotifier, RunStatusPoller, TrackerClientFactory, TrackerSession};

#[async_trait]
impl RunStatusPoller for GithubApiClient {
    async fn run_status(&self, run_id: u64) -> Result<WorkflowRunStatus> {
        self.workflow_run(run_id).await
    }
}

#[async_trait]
impl IssueNotifier for GithubApiClient {
    async fn create_comment(&self, issue_number: u64, body: &str) -> Result<u64> {
        Ok(self.create_issue_comment(issue_number, body).await?.id)
    }

    async fn update_comment(&self, comment_id: u64, body: &str) -> Result<()> {
        self.update_issue_comment(comment_id, body).await?;
        Ok(())
    }
}

#[async_trait]
impl TrackerClientFactory for GithubClientFactory {
    async fn connect(
        &self,
        repo: &RepoRef,
        installation_id: Option<u64>,
    ) -> Result<Arc<dyn TrackerSession>> {
        tracing::debug!(repo = %repo, installation_id, "opening github session");
        let client: Arc<dyn TrackerSession> = Arc::new(GithubClientFactory::connect(self, repo)?);
        Ok(client)
    }
}
