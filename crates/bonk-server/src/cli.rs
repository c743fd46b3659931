use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::Serialize;

/// How accepted mentions are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Run the coding agent in-process and finalize a placeholder comment.
    Direct,
    /// Register a pending correlation and track the workflow run it starts.
    Workflow,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Workflow => "workflow",
        }
    }
}

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "bonk",
    about = "GitHub mention bot that delegates work to a coding agent",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "BONK_BIND",
        default_value = "127.0.0.1:8787",
        help = "Socket address the HTTP server binds to"
    )]
    pub bind: String,

    #[arg(
        long,
        value_enum,
        env = "BONK_MODE",
        default_value = "workflow",
        help = "Execution mode for accepted mentions"
    )]
    pub mode: ExecutionMode,

    #[arg(
        long = "github-api-base",
        env = "BONK_GITHUB_API_BASE",
        default_value = "https://api.github.com",
        help = "GitHub REST API base URL"
    )]
    pub github_api_base: String,

    #[arg(
        long = "github-token",
        env = "BONK_GITHUB_TOKEN",
        hide_env_values = true,
        help = "Token used for GitHub API calls"
    )]
    pub github_token: String,

    #[arg(
        long = "webhook-secret",
        env = "BONK_WEBHOOK_SECRET",
        hide_env_values = true,
        help = "Shared secret used to verify X-Hub-Signature-256"
    )]
    pub webhook_secret: String,

    #[arg(
        long = "api-token",
        env = "BONK_API_TOKEN",
        hide_env_values = true,
        help = "Bearer token for /ask and /runs endpoints; those endpoints are disabled without it"
    )]
    pub api_token: Option<String>,

    #[arg(
        long = "bot-login",
        env = "BONK_BOT_LOGIN",
        help = "Login of the bot account; its own comments are ignored"
    )]
    pub bot_login: Option<String>,

    #[arg(
        long = "mention-trigger",
        env = "BONK_MENTION_TRIGGER",
        default_value = "@ask-bonk",
        help = "Mention that triggers the bot"
    )]
    pub mention_trigger: String,

    #[arg(
        long = "command-trigger",
        env = "BONK_COMMAND_TRIGGER",
        default_value = "/bonk",
        help = "Slash command that triggers the bot"
    )]
    pub command_trigger: String,

    #[arg(
        long = "workflow-path",
        env = "BONK_WORKFLOW_PATH",
        help = "Workflow file whose runs answer mentions, e.g. .github/workflows/bonk.yml"
    )]
    pub workflow_path: Option<String>,

    #[arg(
        long = "state-dir",
        env = "BONK_STATE_DIR",
        help = "Directory for durable tracker state; omitted means in-memory only"
    )]
    pub state_dir: Option<PathBuf>,

    #[arg(
        long = "poll-interval-ms",
        env = "BONK_POLL_INTERVAL_MS",
        default_value_t = 30_000,
        value_parser = parse_positive_u64,
        help = "Delay between workflow run status polls"
    )]
    pub poll_interval_ms: u64,

    #[arg(
        long = "pending-expiry-ms",
        env = "BONK_PENDING_EXPIRY_MS",
        default_value_t = 600_000,
        value_parser = parse_positive_u64,
        help = "How long a pending correlation waits for its run"
    )]
    pub pending_expiry_ms: u64,

    #[arg(
        long = "run-timeout-ms",
        env = "BONK_RUN_TIMEOUT_MS",
        default_value_t = 1_800_000,
        value_parser = parse_positive_u64,
        help = "Wall-clock ceiling for a tracked run"
    )]
    pub run_timeout_ms: u64,

    #[arg(
        long = "driver-tick-ms",
        env = "BONK_DRIVER_TICK_MS",
        default_value_t = 1_000,
        value_parser = parse_positive_u64,
        help = "How often due tracker triggers are fired"
    )]
    pub driver_tick_ms: u64,

    #[arg(
        long = "shutdown-grace-ms",
        env = "BONK_SHUTDOWN_GRACE_MS",
        default_value_t = 30_000,
        help = "How long in-flight requests may finish after a shutdown signal"
    )]
    pub shutdown_grace_ms: u64,

    #[arg(
        long = "agent-command",
        env = "BONK_AGENT_COMMAND",
        default_value = "bonk-agent",
        help = "Executable invoked for direct-mode and /ask requests; empty disables the agent"
    )]
    pub agent_command: String,

    #[arg(
        long = "agent-arg",
        env = "BONK_AGENT_ARGS",
        value_delimiter = ',',
        help = "Arguments passed to the agent command"
    )]
    pub agent_args: Vec<String>,

    #[arg(
        long = "agent-working-dir",
        env = "BONK_AGENT_WORKING_DIR",
        help = "Working directory for the agent process"
    )]
    pub agent_working_dir: Option<PathBuf>,

    #[arg(
        long = "agent-timeout-ms",
        env = "BONK_AGENT_TIMEOUT_MS",
        default_value_t = 900_000,
        value_parser = parse_positive_u64,
        help = "Timeout for one agent attempt"
    )]
    pub agent_timeout_ms: u64,

    #[arg(
        long = "agent-max-attempts",
        env = "BONK_AGENT_MAX_ATTEMPTS",
        default_value_t = 3,
        help = "Agent attempts per direct-mode request"
    )]
    pub agent_max_attempts: usize,

    #[arg(
        long = "agent-retry-delay-ms",
        env = "BONK_AGENT_RETRY_DELAY_MS",
        default_value_t = 15_000,
        help = "Pause between agent attempts"
    )]
    pub agent_retry_delay_ms: u64,

    #[arg(
        long = "request-timeout-ms",
        env = "BONK_REQUEST_TIMEOUT_MS",
        default_value_t = 30_000,
        value_parser = parse_positive_u64,
        help = "Timeout for one GitHub API request"
    )]
    pub request_timeout_ms: u64,

    #[arg(
        long = "github-retry-attempts",
        env = "BONK_GITHUB_RETRY_ATTEMPTS",
        default_value_t = 3,
        help = "Attempts per GitHub API request on retryable failures"
    )]
    pub github_retry_attempts: usize,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, ExecutionMode};

    #[test]
    fn unit_cli_defaults_match_tracking_intervals() {
        let cli = Cli::try_parse_from([
            "bonk",
            "--github-token",
            "ghs_token",
            "--webhook-secret",
            "s3cret",
        ])
        .expect("parse");
        assert_eq!(cli.mode, ExecutionMode::Workflow);
        assert_eq!(cli.poll_interval_ms, 30_000);
        assert_eq!(cli.pending_expiry_ms, 600_000);
        assert_eq!(cli.run_timeout_ms, 1_800_000);
        assert_eq!(cli.agent_max_attempts, 3);
        assert_eq!(cli.agent_retry_delay_ms, 15_000);
        assert_eq!(cli.mention_trigger, "@ask-bonk");
        assert_eq!(cli.command_trigger, "/bonk");
        assert_eq!(cli.shutdown_grace_ms, 30_000);
        assert!(cli.workflow_path.is_none());
    }

    #[test]
    fn functional_cli_parses_mode_and_agent_args() {
        let cli = Cli::try_parse_from([
            "bonk",
            "--github-token",
            "t",
            "--webhook-secret",
            "s",
            "--mode",
            "direct",
            "--agent-arg",
            "run,--json",
        ])
        .expect("parse");
        assert_eq!(cli.mode, ExecutionMode::Direct);
        assert_eq!(cli.agent_args, vec!["run".to_string(), "--json".to_string()]);
    }

    #[test]
    fn regression_zero_poll_interval_is_rejected() {
        let error = Cli::try_parse_from([
            "bonk",
            "--github-token",
            "t",
            "--webhook-secret",
            "s",
            "--poll-interval-ms",
            "0",
        ])
        .expect_err("zero interval");
        assert!(error.to_string().contains("greater than 0"));
    }
}
