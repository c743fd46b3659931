//! Webhook payload model, reduced to the fields the bot routes on.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::mention::ReviewContext;
use crate::repo_ref::RepoRef;

pub const EVENT_HEADER: &str = "x-github-event";
pub const DELIVERY_HEADER: &str = "x-github-delivery";

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("missing webhook signature header")]
    MissingSignature,
    #[error("webhook signature must use sha256=<hex> format")]
    MalformedSignature,
    #[error("webhook signature verification failed")]
    SignatureMismatch,
    #[error("failed to decode {event} payload: {source}")]
    Payload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid repository in {event} payload")]
    Repository { event: String },
}

impl WebhookError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingSignature => "webhook_signature_missing",
            Self::MalformedSignature => "webhook_signature_malformed",
            Self::SignatureMismatch => "webhook_signature_mismatch",
            Self::Payload { .. } => "webhook_payload_invalid",
            Self::Repository { .. } => "webhook_repository_invalid",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GithubUser {
    pub login: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

impl GithubUser {
    pub fn is_bot(&self) -> bool {
        self.kind
            .as_deref()
            .is_some_and(|kind| kind.eq_ignore_ascii_case("bot"))
            || self.login.ends_with("[bot]")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookRepository {
    pub name: String,
    pub full_name: String,
    pub owner: GithubUser,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookInstallation {
    pub id: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookIssue {
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub pull_request: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookComment {
    pub id: u64,
    #[serde(default)]
    pub body: Option<String>,
    pub created_at: String,
    pub user: GithubUser,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookReviewComment {
    pub id: u64,
    #[serde(default)]
    pub body: Option<String>,
    pub created_at: String,
    pub user: GithubUser,
    pub path: String,
    #[serde(default)]
    pub line: Option<u64>,
    #[serde(default)]
    pub original_line: Option<u64>,
    #[serde(default)]
    pub diff_hunk: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookReview {
    pub id: u64,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub submitted_at: Option<String>,
    pub user: GithubUser,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookRepoName {
    pub full_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookBranchRef {
    #[serde(rename = "ref")]
    pub ref_name: String,
    #[serde(default)]
    pub sha: String,
    #[serde(default)]
    pub repo: Option<WebhookRepoName>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookPullRequest {
    pub number: u64,
    pub head: WebhookBranchRef,
    pub base: WebhookBranchRef,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookWorkflowRun {
    pub id: u64,
    pub html_url: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    /// Event that started the run, e.g. `push` or `issue_comment`.
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Workflow file, e.g. `.github/workflows/bonk.yml`.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub actor: Option<GithubUser>,
    #[serde(default)]
    pub triggering_actor: Option<GithubUser>,
}

impl WebhookWorkflowRun {
    /// Login of whoever caused the run; `triggering_actor` wins over `actor`.
    pub fn triggering_login(&self) -> Option<&str> {
        self.triggering_actor
            .as_ref()
            .or(self.actor.as_ref())
            .map(|user| user.login.as_str())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IssueCommentPayload {
    pub action: String,
    pub issue: WebhookIssue,
    pub comment: WebhookComment,
    pub repository: WebhookRepository,
    #[serde(default)]
    pub installation: Option<WebhookInstallation>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReviewCommentPayload {
    pub action: String,
    pub comment: WebhookReviewComment,
    pub pull_request: WebhookPullRequest,
    pub repository: WebhookRepository,
    #[serde(default)]
    pub installation: Option<WebhookInstallation>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReviewPayload {
    pub action: String,
    pub review: WebhookReview,
    pub pull_request: WebhookPullRequest,
    pub repository: WebhookRepository,
    #[serde(default)]
    pub installation: Option<WebhookInstallation>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowRunPayload {
    pub action: String,
    pub workflow_run: WebhookWorkflowRun,
    pub repository: WebhookRepository,
    #[serde(default)]
    pub installation: Option<WebhookInstallation>,
}

#[derive(Debug, Clone)]
pub enum WebhookEvent {
    IssueComment(IssueCommentPayload),
    PullRequestReviewComment(ReviewCommentPayload),
    PullRequestReview(ReviewPayload),
    WorkflowRun(WorkflowRunPayload),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MentionEventKind {
    IssueComment,
    ReviewComment,
    Review,
}

impl MentionEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IssueComment => "issue_comment",
            Self::ReviewComment => "pull_request_review_comment",
            Self::Review => "pull_request_review",
        }
    }
}

/// Head/base repositories of a pull request, used for fork detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestRefs {
    pub head_full_name: Option<String>,
    pub base_full_name: Option<String>,
    pub head_ref: String,
    pub head_sha: String,
}

impl PullRequestRefs {
    /// A PR whose head repository differs from (or lacks) the base repository
    /// comes from a fork.
    pub fn is_fork(&self) -> bool {
        match (&self.head_full_name, &self.base_full_name) {
            (Some(head), Some(base)) => !head.eq_ignore_ascii_case(base),
            _ => true,
        }
    }
}

impl From<&WebhookPullRequest> for PullRequestRefs {
    fn from(pull: &WebhookPullRequest) -> Self {
        Self {
            head_full_name: pull.head.repo.as_ref().map(|repo| repo.full_name.clone()),
            base_full_name: pull.base.repo.as_ref().map(|repo| repo.full_name.clone()),
            head_ref: pull.head.ref_name.clone(),
            head_sha: pull.head.sha.clone(),
        }
    }
}

/// Normalized comment or review that may carry a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MentionEvent {
    pub kind: MentionEventKind,
    pub repo: RepoRef,
    pub installation_id: Option<u64>,
    pub actor: String,
    pub actor_is_bot: bool,
    pub issue_number: u64,
    pub is_pull_request: bool,
    pub body: String,
    pub created_at: String,
    pub source_id: u64,
    pub review_context: Option<ReviewContext>,
    pub pull_request: Option<PullRequestRefs>,
}

impl MentionEvent {
    pub fn event_key(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.source_id)
    }
}

/// Run start/finish notice delivered by the `workflow_run` webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowRunNotice {
    pub repo: RepoRef,
    pub installation_id: Option<u64>,
    pub action: String,
    pub run_id: u64,
    pub run_url: String,
    pub actor: Option<String>,
    pub status: Option<String>,
    pub conclusion: Option<String>,
    pub event: Option<String>,
    pub workflow_name: Option<String>,
    pub workflow_path: Option<String>,
}

/// Events a mention-triggered workflow run can be started by.
pub const MENTION_RUN_EVENTS: [&str; 3] = [
    "issue_comment",
    "pull_request_review_comment",
    "pull_request_review",
];

fn normalize_workflow_path(raw: &str) -> &str {
    let raw = raw.trim();
    let raw = raw.split_once('@').map_or(raw, |(path, _)| path);
    raw.trim_start_matches("./")
}

impl WorkflowRunNotice {
    /// Whether this run can answer a pending mention. With a configured
    /// workflow path only runs of that file qualify; without one the run
    /// must have been started by a comment event.
    pub fn is_mention_run(&self, workflow_path: Option<&str>) -> bool {
        match workflow_path.map(normalize_workflow_path) {
            Some(expected) if !expected.is_empty() => self
                .workflow_path
                .as_deref()
                .is_some_and(|path| normalize_workflow_path(path) == expected),
            _ => self
                .event
                .as_deref()
                .is_some_and(|event| MENTION_RUN_EVENTS.contains(&event)),
        }
    }
}

fn repo_of(repository: &WebhookRepository, event: &str) -> Result<RepoRef, WebhookError> {
    RepoRef::from_parts(&repository.owner.login, &repository.name).map_err(|_| {
        WebhookError::Repository {
            event: event.to_string(),
        }
    })
}

fn decode<T: serde::de::DeserializeOwned>(event: &str, body: &[u8]) -> Result<T, WebhookError> {
    serde_json::from_slice(body).map_err(|source| WebhookError::Payload {
        event: event.to_string(),
        source,
    })
}

impl WebhookEvent {
    /// Decodes a delivery; event names the bot does not route yield `None`.
    pub fn parse(event_name: &str, body: &[u8]) -> Result<Option<Self>, WebhookError> {
        let event = event_name.trim();
        let parsed = match event {
            "issue_comment" => Self::IssueComment(decode(event, body)?),
            "pull_request_review_comment" => Self::PullRequestReviewComment(decode(event, body)?),
            "pull_request_review" => Self::PullRequestReview(decode(event, body)?),
            "workflow_run" => Self::WorkflowRun(decode(event, body)?),
            _ => return Ok(None),
        };
        Ok(Some(parsed))
    }

    /// Mention candidate for newly created comments and submitted reviews.
    pub fn mention_event(&self) -> Result<Option<MentionEvent>, WebhookError> {
        let event = match self {
            Self::IssueComment(payload) => {
                if payload.action != "created" {
                    return Ok(None);
                }
                MentionEvent {
                    kind: MentionEventKind::IssueComment,
                    repo: repo_of(&payload.repository, "issue_comment")?,
                    installation_id: payload.installation.as_ref().map(|value| value.id),
                    actor: payload.comment.user.login.clone(),
                    actor_is_bot: payload.comment.user.is_bot(),
                    issue_number: payload.issue.number,
                    is_pull_request: payload.issue.pull_request.is_some(),
                    body: payload.comment.body.clone().unwrap_or_default(),
                    created_at: payload.comment.created_at.clone(),
                    source_id: payload.comment.id,
                    review_context: None,
                    pull_request: None,
                }
            }
            Self::PullRequestReviewComment(payload) => {
                if payload.action != "created" {
                    return Ok(None);
                }
                let comment = &payload.comment;
                MentionEvent {
                    kind: MentionEventKind::ReviewComment,
                    repo: repo_of(&payload.repository, "pull_request_review_comment")?,
                    installation_id: payload.installation.as_ref().map(|value| value.id),
                    actor: comment.user.login.clone(),
                    actor_is_bot: comment.user.is_bot(),
                    issue_number: payload.pull_request.number,
                    is_pull_request: true,
                    body: comment.body.clone().unwrap_or_default(),
                    created_at: comment.created_at.clone(),
                    source_id: comment.id,
                    review_context: Some(ReviewContext {
                        path: comment.path.clone(),
                        line: comment.line.or(comment.original_line),
                        diff_hunk: comment.diff_hunk.clone(),
                    }),
                    pull_request: Some(PullRequestRefs::from(&payload.pull_request)),
                }
            }
            Self::PullRequestReview(payload) => {
                if payload.action != "submitted" {
                    return Ok(None);
                }
                let review = &payload.review;
                MentionEvent {
                    kind: MentionEventKind::Review,
                    repo: repo_of(&payload.repository, "pull_request_review")?,
                    installation_id: payload.installation.as_ref().map(|value| value.id),
                    actor: review.user.login.clone(),
                    actor_is_bot: review.user.is_bot(),
                    issue_number: payload.pull_request.number,
                    is_pull_request: true,
                    body: review.body.clone().unwrap_or_default(),
                    created_at: review.submitted_at.clone().unwrap_or_default(),
                    source_id: review.id,
                    review_context: None,
                    pull_request: Some(PullRequestRefs::from(&payload.pull_request)),
                }
            }
            Self::WorkflowRun(_) => return Ok(None),
        };
        Ok(Some(event))
    }

    pub fn workflow_run_notice(&self) -> Result<Option<WorkflowRunNotice>, WebhookError> {
        let Self::WorkflowRun(payload) = self else {
            return Ok(None);
        };
        let run = &payload.workflow_run;
        Ok(Some(WorkflowRunNotice {
            repo: repo_of(&payload.repository, "workflow_run")?,
            installation_id: payload.installation.as_ref().map(|value| value.id),
            action: payload.action.clone(),
            run_id: run.id,
            run_url: run.html_url.clone(),
            actor: run.triggering_login().map(ToOwned::to_owned),
            event: run.event.clone(),
            workflow_name: run.name.clone(),
            workflow_path: run.path.clone(),
            status: run.status.clone(),
            conclusion: run.conclusion.clone(),
        }))
    }
}
