use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use bonk_github::{GithubClientFactory, MentionTriggers, RetryPolicy};
use bonk_orchestrator::{OrchestratorConfig, SubprocessAgentConfig};
use bonk_tracker::TrackerConfig;

use crate::cli::{Cli, ExecutionMode};

pub const DELIVERY_CACHE_CAP: usize = 1_024;

/// Validated runtime configuration assembled from the CLI.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub mode: ExecutionMode,
    pub webhook_secret: String,
    pub api_token: Option<String>,
    pub bot_login: Option<String>,
    pub triggers: MentionTriggers,
    /// Only runs of this workflow file answer pending mentions.
    pub workflow_path: Option<String>,
    pub github: GithubClientFactory,
    pub tracker: TrackerConfig,
    pub orchestrator: OrchestratorConfig,
    /// `None` when no agent command is configured; direct mode requires one.
    pub agent: Option<SubprocessAgentConfig>,
    pub driver_tick_ms: u64,
    pub shutdown_grace_ms: u64,
    pub delivery_cache_cap: usize,
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

impl ServerConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let bind = cli
            .bind
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid --bind '{}'", cli.bind))?;
        let webhook_secret = cli.webhook_secret.trim();
        if webhook_secret.is_empty() {
            bail!("--webhook-secret cannot be empty");
        }
        if cli.github_token.trim().is_empty() {
            bail!("--github-token cannot be empty");
        }
        if cli.mention_trigger.trim().is_empty() || cli.command_trigger.trim().is_empty() {
            bail!("mention and command triggers cannot be empty");
        }
        let agent = non_empty(Some(cli.agent_command.as_str())).map(|command| {
            SubprocessAgentConfig {
                command,
                args: cli.agent_args.clone(),
                working_dir: cli.agent_working_dir.clone(),
                timeout_ms: cli.agent_timeout_ms,
            }
        });
        if cli.mode == ExecutionMode::Direct && agent.is_none() {
            bail!("--agent-command is required in direct mode");
        }

        Ok(Self {
            bind,
            mode: cli.mode,
            webhook_secret: webhook_secret.to_string(),
            api_token: non_empty(cli.api_token.as_deref()),
            bot_login: non_empty(cli.bot_login.as_deref()),
            triggers: MentionTriggers {
                mention: cli.mention_trigger.trim().to_string(),
                command: cli.command_trigger.trim().to_string(),
            },
            workflow_path: non_empty(cli.workflow_path.as_deref()),
            github: GithubClientFactory {
                api_base: cli.github_api_base.trim().to_string(),
                token: cli.github_token.trim().to_string(),
                request_timeout_ms: cli.request_timeout_ms,
                retry: RetryPolicy {
                    max_attempts: cli.github_retry_attempts,
                    ..RetryPolicy::default()
                },
            },
            tracker: TrackerConfig {
                state_dir: cli.state_dir.clone(),
                poll_interval_ms: cli.poll_interval_ms,
                pending_expiry_ms: cli.pending_expiry_ms,
                run_timeout_ms: cli.run_timeout_ms,
                ..TrackerConfig::default()
            },
            orchestrator: OrchestratorConfig {
                max_attempts: cli.agent_max_attempts.max(1),
                retry_delay_ms: cli.agent_retry_delay_ms,
            },
            agent,
            driver_tick_ms: cli.driver_tick_ms,
            shutdown_grace_ms: cli.shutdown_grace_ms,
            delivery_cache_cap: DELIVERY_CACHE_CAP,
        })
    }
}
