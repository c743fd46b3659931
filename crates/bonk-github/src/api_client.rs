//! Minimal GitHub REST client for the calls the bot makes.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::repo_ref::RepoRef;
use crate::webhook_events::PullRequestRefs;
use crate::transport_helpers::{
    is_retryable_status, is_retryable_transport_error, parse_retry_after, truncate_for_error,
    RetryPolicy,
};

const USER_AGENT: &str = "bonk-github-bot";
const GITHUB_API_VERSION: &str = "2022-11-28";

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct GithubComment {
    pub id: u64,
    #[serde(default)]
    pub html_url: Option<String>,
}

/// Status and conclusion of one workflow run, as reported by the Actions API.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct WorkflowRunStatus {
    pub id: u64,
    pub status: String,
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
}

impl WorkflowRunStatus {
    pub fn is_completed(&self) -> bool {
        self.status.eq_ignore_ascii_case("completed")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct GithubRepoName {
    pub full_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct GithubBranchRef {
    #[serde(rename = "ref")]
    pub ref_name: String,
    #[serde(default)]
    pub sha: String,
    #[serde(default)]
    pub repo: Option<GithubRepoName>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct GithubPullRequest {
    pub number: u64,
    #[serde(default)]
    pub html_url: Option<String>,
    pub head: GithubBranchRef,
    pub base: GithubBranchRef,
}

impl GithubPullRequest {
    pub fn refs(&self) -> PullRequestRefs {
        PullRequestRefs {
            head_full_name: self.head.repo.as_ref().map(|repo| repo.full_name.clone()),
            base_full_name: self.base.repo.as_ref().map(|repo| repo.full_name.clone()),
            head_ref: self.head.ref_name.clone(),
            head_sha: self.head.sha.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CollaboratorPermission {
    pub permission: String,
    #[serde(default)]
    pub role_name: Option<String>,
}

impl CollaboratorPermission {
    /// True for `admin`, `maintain` and `write`; everything else is read-only.
    pub fn can_write(&self) -> bool {
        let grants = |value: &str| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "admin" | "maintain" | "write"
            )
        };
        grants(&self.permission) || self.role_name.as_deref().is_some_and(grants)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GithubRepository {
    default_branch: String,
}

/// Builds authenticated clients on demand.
///
/// Each call produces a fresh client so a credential is held no longer than
/// the operation that needs it.
#[derive(Debug, Clone)]
pub struct GithubClientFactory {
    pub api_base: String,
    pub token: String,
    pub request_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl GithubClientFactory {
    pub fn connect(&self, repo: &RepoRef) -> Result<GithubApiClient> {
        if self.token.trim().is_empty() {
            bail!("github token is not configured");
        }
        GithubApiClient::new(
            self.api_base.clone(),
            self.token.clone(),
            repo.clone(),
            self.request_timeout_ms,
            self.retry,
        )
    }
}

#[derive(Clone)]
pub struct GithubApiClient {
    http: reqwest::Client,
    api_base: String,
    repo: RepoRef,
    retry: RetryPolicy,
}

impl GithubApiClient {
    pub fn new(
        api_base: String,
        token: String,
        repo: RepoRef,
        request_timeout_ms: u64,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static(USER_AGENT),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "x-github-api-version",
            reqwest::header::HeaderValue::from_static(GITHUB_API_VERSION),
        );
        let auth_header = format!("Bearer {}", token.trim());
        headers.insert(
            reqwest::header::AUTHORIZATION,
            reqwest::header::HeaderValue::from_str(&auth_header)
                .context("invalid github authorization header")?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(request_timeout_ms.max(1)))
            .build()
            .context("failed to create github api client")?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            repo,
            retry: retry.normalized(),
        })
    }

    pub fn repo(&self) -> &RepoRef {
        &self.repo
    }

    fn repo_url(&self, suffix: &str) -> String {
        format!(
            "{}/repos/{}/{}{}",
            self.api_base, self.repo.owner, self.repo.name, suffix
        )
    }

    pub async fn create_issue_comment(&self, issue_number: u64, body: &str) -> Result<GithubComment> {
        let payload = json!({ "body": body });
        let url = self.repo_url(&format!("/issues/{issue_number}/comments"));
        self.request_json("create issue comment", || self.http.post(&url).json(&payload))
            .await
    }

    pub async fn update_issue_comment(&self, comment_id: u64, body: &str) -> Result<GithubComment> {
        let payload = json!({ "body": body });
        let url = self.repo_url(&format!("/issues/comments/{comment_id}"));
        self.request_json("update issue comment", || self.http.patch(&url).json(&payload))
            .await
    }

    pub async fn collaborator_permission(&self, login: &str) -> Result<CollaboratorPermission> {
        let url = self.repo_url(&format!("/collaborators/{}/permission", login.trim()));
        self.request_json("read collaborator permission", || self.http.get(&url))
            .await
    }

    pub async fn workflow_run(&self, run_id: u64) -> Result<WorkflowRunStatus> {
        let url = self.repo_url(&format!("/actions/runs/{run_id}"));
        self.request_json("read workflow run", || self.http.get(&url))
            .await
    }

    pub async fn pull_request(&self, number: u64) -> Result<GithubPullRequest> {
        let url = self.repo_url(&format!("/pulls/{number}"));
        self.request_json("read pull request", || self.http.get(&url))
            .await
    }

    pub async fn default_branch(&self) -> Result<String> {
        let url = self.repo_url("");
        let repository: GithubRepository = self
            .request_json("read repository", || self.http.get(&url))
            .await?;
        Ok(repository.default_branch)
    }

    pub async fn create_pull_request(
        &self,
        title: &str,
        head: &str,
        base: &str,
        body: &str,
    ) -> Result<GithubPullRequest> {
        let payload = json!({
            "title": title,
            "head": head,
            "base": base,
            "body": body,
        });
        let url = self.repo_url("/pulls");
        self.request_json("create pull request", || self.http.post(&url).json(&payload))
            .await
    }

    async fn request_json<T, F>(&self, operation: &str, mut request_builder: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: FnMut() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0_usize;
        loop {
            attempt = attempt.saturating_add(1);
            match request_builder().send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json::<T>()
                            .await
                            .with_context(|| format!("failed to decode github {operation}"));
                    }

                    let retry_after = parse_retry_after(response.headers());
                    let body = response.text().await.unwrap_or_default();
                    if self.retry.allows_another_attempt(attempt)
                        && is_retryable_status(status.as_u16())
                    {
                        tracing::debug!(
                            repo = %self.repo,
                            operation,
                            attempt,
                            status = status.as_u16(),
                            "retrying github request"
                        );
                        tokio::time::sleep(self.retry.delay_for(attempt, retry_after)).await;
                        continue;
                    }

                    bail!(
                        "github api {operation} failed with status {}: {}",
                        status.as_u16(),
                        truncate_for_error(&body, 800)
                    );
                }
                Err(error) => {
                    if self.retry.allows_another_attempt(attempt)
                        && is_retryable_transport_error(&error)
                    {
                        tracing::debug!(
                            repo = %self.repo,
                            operation,
                            attempt,
                            error = %error,
                            "retrying github request after transport error"
                        );
                        tokio::time::sleep(self.retry.delay_for(attempt, None)).await;
                        continue;
                    }
                    return Err(error)
                        .with_context(|| format!("github api {operation} request failed"));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use httpmock::Method::{GET, PATCH, POST};
    use httpmock::MockServer;
    use serde_json::json;

    use super::*;

    fn client_for(server: &MockServer, max_attempts: usize) -> GithubApiClient {
        GithubApiClient::new(
            server.base_url(),
            "token".to_string(),
            RepoRef::parse("owner/repo").expect("repo"),
            2_000,
            RetryPolicy {
                max_attempts,
                base_delay_ms: 1,
            },
        )
        .expect("client")
    }

    #[tokio::test]
    async fn functional_create_and_update_issue_comment_round_trip() {
        let server = MockServer::start_async().await;
        let create = server.mock(|when, then| {
            when.method(POST)
                .path("/repos/owner/repo/issues/7/comments")
                .header("authorization", "Bearer token")
                .body_includes("working on it");
            then.status(201).json_body(json!({
                "id": 901,
                "html_url": "https://example.test/comment/901"
            }));
        });
        let update = server.mock(|when, then| {
            when.method(PATCH)
                .path("/repos/owner/repo/issues/comments/901")
                .body_includes("done");
            then.status(200).json_body(json!({ "id": 901 }));
        });

        let client = client_for(&server, 1);
        let created = client
            .create_issue_comment(7, "working on it")
            .await
            .expect("create comment");
        assert_eq!(created.id, 901);
        client
            .update_issue_comment(created.id, "done")
            .await
            .expect("update comment");
        create.assert_calls(1);
        update.assert_calls(1);
    }

    #[tokio::test]
    async fn functional_workflow_run_reports_status_and_conclusion() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path("/repos/owner/repo/actions/runs/77");
            then.status(200).json_body(json!({
                "id": 77,
                "status": "completed",
                "conclusion": "failure",
                "html_url": "https://example.test/runs/77"
            }));
        });

        let run = client_for(&server, 1)
            .workflow_run(77)
            .await
            .expect("workflow run");
        assert!(run.is_completed());
        assert_eq!(run.conclusion.as_deref(), Some("failure"));
    }

    #[tokio::test]
    async fn integration_request_retries_server_errors_until_budget_is_spent() {
        let server = MockServer::start_async().await;
        let failing = server.mock(|when, then| {
            when.method(GET).path("/repos/owner/repo/actions/runs/5");
            then.status(502).body("bad gateway");
        });

        let error = client_for(&server, 3)
            .workflow_run(5)
            .await
            .expect_err("server error");
        failing.assert_calls(3);
        assert!(error.to_string().contains("status 502"));
    }

    #[tokio::test]
    async fn regression_client_errors_are_not_retried() {
        let server = MockServer::start_async().await;
        let missing = server.mock(|when, then| {
            when.method(GET).path("/repos/owner/repo/pulls/3");
            then.status(404).body("not found");
        });

        let error = client_for(&server, 3)
            .pull_request(3)
            .await
            .expect_err("missing pull");
        missing.assert_calls(1);
        assert!(error.to_string().contains("status 404"));
    }

    #[tokio::test]
    async fn functional_pull_request_refs_expose_fork_heads() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path("/repos/owner/repo/pulls/8");
            then.status(200).json_body(json!({
                "number": 8,
                "html_url": "https://github.com/owner/repo/pull/8",
                "head": {"ref": "patch-1", "sha": "abc123", "repo": {"full_name": "mallory/repo"}},
                "base": {"ref": "main", "sha": "def456", "repo": {"full_name": "owner/repo"}}
            }));
        });

        let refs = client_for(&server, 1)
            .pull_request(8)
            .await
            .expect("pull")
            .refs();
        assert_eq!(refs.head_ref, "patch-1");
        assert_eq!(refs.head_sha, "abc123");
        assert!(refs.is_fork());
    }

    #[test]
    fn unit_collaborator_permission_grants_write_roles_only() {
        let write = CollaboratorPermission {
            permission: "write".to_string(),
            role_name: None,
        };
        let maintain = CollaboratorPermission {
            permission: "read".to_string(),
            role_name: Some("maintain".to_string()),
        };
        let triage = CollaboratorPermission {
            permission: "read".to_string(),
            role_name: Some("triage".to_string()),
        };
        assert!(write.can_write());
        assert!(maintain.can_write());
        assert!(!triage.can_write());
    }

    #[test]
    fn regression_factory_refuses_blank_token() {
        let factory = GithubClientFactory {
            api_base: "https://api.github.com".to_string(),
            token: "  ".to_string(),
            request_timeout_ms: 1_000,
            retry: RetryPolicy::default(),
        };
        let error = factory
            .connect(&RepoRef::new("owner", "repo"))
            .err()
            .expect("blank token");
        assert!(error.to_string().contains("not configured"));
    }
}
