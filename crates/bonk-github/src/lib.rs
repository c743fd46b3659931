//! GitHub plumbing shared by the bonk tracker, orchestrator and server.
//!
//! Covers the REST client used for comments, permissions, pulls and workflow
//! runs, the webhook payload model, signature verification, the mention
//! parser and comment rendering.

pub mod api_client;
pub mod comment_render;
pub mod mention;
pub mod repo_ref;
pub mod transport_helpers;
pub mod webhook_events;
pub mod webhook_signature;

pub use api_client::{
    CollaboratorPermission, GithubApiClient, GithubClientFactory, GithubComment,
    GithubPullRequest, WorkflowRunStatus,
};
pub use mention::{MentionTriggers, ReviewContext};
pub use repo_ref::RepoRef;
pub use transport_helpers::RetryPolicy;
