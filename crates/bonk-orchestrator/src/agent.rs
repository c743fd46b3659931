use anyhow::Result;
use async_trait::async_trait;
use bonk_github::webhook_events::{MentionEvent, PullRequestRefs};
use bonk_github::RepoRef;
use serde::{Deserialize, Serialize};

/// Normalized unit of work handed to the coding agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkRequest {
    pub repo: RepoRef,
    #[serde(default)]
    pub installation_id: Option<u64>,
    pub event_key: String,
    pub actor: String,
    pub issue_number: u64,
    pub is_pull_request: bool,
    pub prompt: String,
    #[serde(default)]
    pub pull_request: Option<PullRequestRefs>,
}

impl WorkRequest {
    pub fn from_mention(event: &MentionEvent, prompt: String) -> Self {
        Self {
            repo: event.repo.clone(),
            installation_id: event.installation_id,
            event_key: event.event_key(),
            actor: event.actor.clone(),
            issue_number: event.issue_number,
            is_pull_request: event.is_pull_request,
            prompt,
            pull_request: event.pull_request.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub summary: String,
    #[serde(default)]
    pub changed_files: Vec<String>,
    /// Branch the agent pushed its changes to, if any.
    #[serde(default)]
    pub branch: Option<String>,
}

impl AgentOutcome {
    pub fn has_changes(&self) -> bool {
        !self.changed_files.is_empty()
    }
}

#[async_trait]
pub trait CodingAgent: Send + Sync {
    async fn run(&self, request: &WorkRequest) -> Result<AgentOutcome>;
}
