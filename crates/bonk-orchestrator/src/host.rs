use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bonk_github::webhook_events::PullRequestRefs;
use bonk_github::{GithubApiClient, GithubClientFactory, RepoRef};

/// Repository operations the orchestrator needs from the hosting platform.
#[async_trait]
pub trait RepositoryHost: Send + Sync {
    async fn can_write(&self, login: &str) -> Result<bool>;
    async fn create_comment(&self, issue_number: u64, body: &str) -> Result<u64>;
    async fn update_comment(&self, comment_id: u64, body: &str) -> Result<()>;
    async fn pull_request_refs(&self, number: u64) -> Result<PullRequestRefs>;
    async fn default_branch(&self) -> Result<String>;
    /// Opens a pull request and returns its URL.
    async fn open_pull_request(
        &self,
        title: &str,
        head: &str,
        base: &str,
        body: &str,
    ) -> Result<String>;
}

#[async_trait]
impl RepositoryHost for GithubApiClient {
    async fn can_write(&self, login: &str) -> Result<bool> {
        Ok(self.collaborator_permission(login).await?.can_write())
    }

    async fn create_comment(&self, issue_number: u64, body: &str) -> Result<u64> {
        Ok(self.create_issue_comment(issue_number, body).await?.id)
    }

    async fn update_comment(&self, comment_id: u64, body: &str) -> Result<()> {
        self.update_issue_comment(comment_id, body).await?;
        Ok(())
    }

    async fn pull_request_refs(&self, number: u64) -> Result<PullRequestRefs> {
        Ok(self.pull_request(number).await?.refs())
    }

    async fn default_branch(&self) -> Result<String> {
        GithubApiClient::default_branch(self).await
    }

    async fn open_pull_request(
        &self,
        title: &str,
        head: &str,
        base: &str,
        body: &str,
    ) -> Result<String> {
        let pull = self.create_pull_request(title, head, base, body).await?;
        Ok(pull.html_url.unwrap_or_else(|| {
            format!(
                "https://github.com/{}/pull/{}",
                self.repo().as_slug(),
                pull.number
            )
        }))
    }
}

/// Opens a host session per request.
#[async_trait]
pub trait RepositoryHostFactory: Send + Sync {
    async fn connect(
        &self,
        repo: &RepoRef,
        installation_id: Option<u64>,
    ) -> Result<Arc<dyn RepositoryHost>>;
}

#[async_trait]
impl RepositoryHostFactory for GithubClientFactory {
    async fn connect(
        &self,
        repo: &RepoRef,
        installation_id: Option<u64>,
    ) -> Result<Arc<dyn RepositoryHost>> {
        tracing::debug!(repo = %repo, installation_id, "opening github host session");
        let client: Arc<dyn RepositoryHost> = Arc::new(GithubClientFactory::connect(self, repo)?);
        Ok(client)
    }
}
