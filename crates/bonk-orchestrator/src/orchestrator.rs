use std::sync::Arc;
use std::time::Duration;

use bonk_github::comment_render::{
    append_pull_request_link, render_failure_comment, render_placeholder_comment,
    render_result_comment,
};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;

use crate::agent::{AgentOutcome, CodingAgent, WorkRequest};
use crate::host::RepositoryHost;

pub const DEFAULT_MAX_ATTEMPTS: usize = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 15_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub max_attempts: usize,
    /// Fixed pause between attempts.
    pub retry_delay_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("pull request head {head} is a fork of the base repository")]
    ForkRefused { head: String },
    #[error("pull request #{number} could not be read")]
    PullRequestUnavailable { number: u64 },
    #[error("{actor} does not have write access")]
    PermissionDenied { actor: String },
    #[error("failed to create placeholder comment: {0:#}")]
    Placeholder(anyhow::Error),
    #[error("{last_error}")]
    AgentExhausted { attempts: usize, last_error: String },
    #[error("interrupted by server shutdown after {attempts} attempt(s)")]
    Interrupted { attempts: usize },
}

impl OrchestratorError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ForkRefused { .. } => "fork_refused",
            Self::PullRequestUnavailable { .. } => "pull_request_unavailable",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::Placeholder(_) => "placeholder_failed",
            Self::AgentExhausted { .. } => "agent_exhausted",
            Self::Interrupted { .. } => "interrupted",
        }
    }

    /// Refusals are dropped without any comment.
    pub fn is_silent(&self) -> bool {
        matches!(
            self,
            Self::ForkRefused { .. }
                | Self::PullRequestUnavailable { .. }
                | Self::PermissionDenied { .. }
        )
    }
}

/// Progress notices for callers streaming the orchestration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum OrchestratorProgress {
    Started { comment_id: u64 },
    Attempt { attempt: usize, max_attempts: usize },
    AttemptFailed { attempt: usize, error: String },
    Completed {
        attempts: usize,
        pull_request_url: Option<String>,
    },
    Failed { attempts: usize, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationOutcome {
    Completed {
        summary: String,
        pull_request_url: Option<String>,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestrationReport {
    pub comment_id: u64,
    pub attempts: usize,
    /// False when the final comment update itself failed.
    pub finalized: bool,
    pub outcome: OrchestrationOutcome,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    agent: Arc<dyn CodingAgent>,
    interrupt: watch::Sender<bool>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, agent: Arc<dyn CodingAgent>) -> Self {
        let (interrupt, _) = watch::channel(false);
        Self {
            config,
            agent,
            interrupt,
        }
    }

    pub fn config(&self) -> OrchestratorConfig {
        self.config
    }

    /// Stops running and future agent attempts. Requests that already have
    /// a placeholder still finalize it with a failure notice.
    pub fn interrupt(&self) {
        self.interrupt.send_replace(true);
    }

    pub fn is_interrupted(&self) -> bool {
        *self.interrupt.borrow()
    }

    /// Handles one direct-mode request end to end.
    ///
    /// Returns `Err` only when no placeholder comment exists; once it is
    /// posted the placeholder is finalized exactly once, whatever happens.
    pub async fn handle(
        &self,
        host: &dyn RepositoryHost,
        request: &WorkRequest,
        progress: Option<&UnboundedSender<OrchestratorProgress>>,
    ) -> Result<OrchestrationReport, OrchestratorError> {
        let resolved;
        let request = if request.is_pull_request && request.pull_request.is_none() {
            resolved = resolve_pull_request(host, request).await?;
            &resolved
        } else {
            request
        };

        if let Some(pull) = request.pull_request.as_ref().filter(|pull| pull.is_fork()) {
            tracing::info!(
                repo = %request.repo,
                actor = %request.actor,
                issue_number = request.issue_number,
                "refusing request from fork pull request"
            );
            return Err(OrchestratorError::ForkRefused {
                head: pull
                    .head_full_name
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
            });
        }

        match host.can_write(&request.actor).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(repo = %request.repo, actor = %request.actor, "dropping request without write permission");
                return Err(OrchestratorError::PermissionDenied {
                    actor: request.actor.clone(),
                });
            }
            Err(error) => {
                tracing::warn!(
                    repo = %request.repo,
                    actor = %request.actor,
                    error = %format!("{error:#}"),
                    "permission check failed; dropping request"
                );
                return Err(OrchestratorError::PermissionDenied {
                    actor: request.actor.clone(),
                });
            }
        }

        let comment_id = host
            .create_comment(
                request.issue_number,
                &render_placeholder_comment(&request.event_key, &request.actor),
            )
            .await
            .map_err(OrchestratorError::Placeholder)?;
        emit(progress, OrchestratorProgress::Started { comment_id });

        let (attempts, outcome) = match self.run_with_retry(request, progress).await {
            Ok((attempts, outcome)) => (attempts, Ok(outcome)),
            Err(
                error @ (OrchestratorError::AgentExhausted { attempts, .. }
                | OrchestratorError::Interrupted { attempts }),
            ) => (attempts, Err(error.to_string())),
            Err(error) => (0, Err(error.to_string())),
        };

        match outcome {
            Ok(outcome) => {
                let body = render_result_comment(&request.event_key, &outcome.summary, attempts);
                let finalized = finalize(host, request, comment_id, &body).await;
                let pull_request_url = if finalized {
                    self.open_pull_request_if_needed(host, request, comment_id, &body, &outcome)
                        .await
                } else {
                    None
                };
                tracing::info!(
                    repo = %request.repo,
                    issue_number = request.issue_number,
                    attempts,
                    pull_request = pull_request_url.as_deref().unwrap_or("none"),
                    "direct request completed"
                );
                emit(
                    progress,
                    OrchestratorProgress::Completed {
                        attempts,
                        pull_request_url: pull_request_url.clone(),
                    },
                );
                Ok(OrchestrationReport {
                    comment_id,
                    attempts,
                    finalized,
                    outcome: OrchestrationOutcome::Completed {
                        summary: outcome.summary,
                        pull_request_url,
                    },
                })
            }
            Err(error) => {
                let body = render_failure_comment(&request.event_key, &error, attempts);
                let finalized = finalize(host, request, comment_id, &body).await;
                tracing::warn!(
                    repo = %request.repo,
                    issue_number = request.issue_number,
                    attempts,
                    error = %error,
                    "direct request failed"
                );
                emit(
                    progress,
                    OrchestratorProgress::Failed {
                        attempts,
                        error: error.clone(),
                    },
                );
                Ok(OrchestrationReport {
                    comment_id,
                    attempts,
                    finalized,
                    outcome: OrchestrationOutcome::Failed { error },
                })
            }
        }
    }

    /// Every failure is retried, panics included. An interrupt aborts the
    /// running attempt and skips the rest.
    async fn run_with_retry(
        &self,
        request: &WorkRequest,
        progress: Option<&UnboundedSender<OrchestratorProgress>>,
    ) -> Result<(usize, AgentOutcome), OrchestratorError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            if self.is_interrupted() {
                return Err(OrchestratorError::Interrupted {
                    attempts: attempt - 1,
                });
            }
            emit(
                progress,
                OrchestratorProgress::Attempt {
                    attempt,
                    max_attempts,
                },
            );
            let agent = Arc::clone(&self.agent);
            let owned = request.clone();
            let mut task = tokio::spawn(async move { agent.run(&owned).await });
            let joined = tokio::select! {
                joined = &mut task => joined,
                _ = wait_for_interrupt(self.interrupt.subscribe()) => {
                    task.abort();
                    tracing::warn!(repo = %request.repo, issue_number = request.issue_number, attempt, "agent attempt interrupted");
                    return Err(OrchestratorError::Interrupted { attempts: attempt });
                }
            };
            let result = match joined {
                Ok(result) => result,
                Err(join_error) => Err(anyhow::anyhow!("agent task aborted: {join_error}")),
            };
            match result {
                Ok(outcome) => return Ok((attempt, outcome)),
                Err(error) => {
                    last_error = format!("{error:#}");
                    tracing::warn!(
                        repo = %request.repo,
                        issue_number = request.issue_number,
                        attempt,
                        max_attempts,
                        error = %last_error,
                        "agent attempt failed"
                    );
                    emit(
                        progress,
                        OrchestratorProgress::AttemptFailed {
                            attempt,
                            error: last_error.clone(),
                        },
                    );
                }
            }
            if attempt < max_attempts {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)) => {}
                    _ = wait_for_interrupt(self.interrupt.subscribe()) => {
                        return Err(OrchestratorError::Interrupted { attempts: attempt });
                    }
                }
            }
        }
        Err(OrchestratorError::AgentExhausted {
            attempts: max_attempts,
            last_error,
        })
    }

    /// Opens a PR for changes an issue request left on a fresh branch.
    async fn open_pull_request_if_needed(
        &self,
        host: &dyn RepositoryHost,
        request: &WorkRequest,
        comment_id: u64,
        finalized_body: &str,
        outcome: &AgentOutcome,
    ) -> Option<String> {
        if request.is_pull_request || !outcome.has_changes() {
            return None;
        }
        let branch = outcome
            .branch
            .as_deref()
            .map(str::trim)
            .filter(|branch| !branch.is_empty())?;
        let base = match host.default_branch().await {
            Ok(base) => base,
            Err(error) => {
                tracing::warn!(repo = %request.repo, error = %format!("{error:#}"), "failed to read default branch");
                return None;
            }
        };
        if base == branch {
            return None;
        }

        let title = format!("Bonk changes for #{}", request.issue_number);
        let body = format!(
            "Requested by @{} in #{}.\n\n{}",
            request.actor,
            request.issue_number,
            outcome.summary.trim()
        );
        let url = match host.open_pull_request(&title, branch, &base, &body).await {
            Ok(url) => url,
            Err(error) => {
                tracing::warn!(
                    repo = %request.repo,
                    branch,
                    error = %format!("{error:#}"),
                    "failed to open pull request"
                );
                return None;
            }
        };
        let linked = append_pull_request_link(finalized_body, &url);
        if let Err(error) = host.update_comment(comment_id, &linked).await {
            tracing::warn!(repo = %request.repo, comment_id, error = %format!("{error:#}"), "failed to link pull request");
        }
        Some(url)
    }
}

/// Fills in head/base refs for requests that only know they target a PR.
pub async fn resolve_pull_request(
    host: &dyn RepositoryHost,
    request: &WorkRequest,
) -> Result<WorkRequest, OrchestratorError> {
    match host.pull_request_refs(request.issue_number).await {
        Ok(refs) => Ok(WorkRequest {
            pull_request: Some(refs),
            ..request.clone()
        }),
        Err(error) => {
            tracing::warn!(
                repo = %request.repo,
                issue_number = request.issue_number,
                error = %format!("{error:#}"),
                "failed to read pull request; dropping request"
            );
            Err(OrchestratorError::PullRequestUnavailable {
                number: request.issue_number,
            })
        }
    }
}

async fn finalize(
    host: &dyn RepositoryHost,
    request: &WorkRequest,
    comment_id: u64,
    body: &str,
) -> bool {
    match host.update_comment(comment_id, body).await {
        Ok(()) => true,
        Err(error) => {
            tracing::error!(
                repo = %request.repo,
                issue_number = request.issue_number,
                comment_id,
                error = %format!("{error:#}"),
                "failed to finalize placeholder comment"
            );
            false
        }
    }
}

fn emit(
    progress: Option<&UnboundedSender<OrchestratorProgress>>,
    event: OrchestratorProgress,
) {
    if let Some(sender) = progress {
        let _ = sender.send(event);
    }
}

async fn wait_for_interrupt(mut interrupt: watch::Receiver<bool>) {
    while !*interrupt.borrow_and_update() {
        if interrupt.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
