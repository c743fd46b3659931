//! Coding agent run as a child process.
//!
//! The work request is written to stdin as JSON. The agent answers on stdout
//! with either an [`AgentOutcome`] JSON object or plain text, which is taken
//! as the summary of a run without file changes.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bonk_github::transport_helpers::truncate_for_error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::agent::{AgentOutcome, CodingAgent, WorkRequest};

const STDERR_MAX_CHARS: usize = 400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubprocessAgentConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub timeout_ms: u64,
}

impl Default for SubprocessAgentConfig {
    fn default() -> Self {
        Self {
            command: "bonk-agent".to_string(),
            args: Vec::new(),
            working_dir: None,
            timeout_ms: 15 * 60 * 1_000,
        }
    }
}

pub struct SubprocessAgent {
    config: SubprocessAgentConfig,
}

impl SubprocessAgent {
    pub fn new(config: SubprocessAgentConfig) -> Result<Self> {
        if config.command.trim().is_empty() {
            bail!("agent command cannot be empty");
        }
        Ok(Self { config })
    }
}

#[async_trait]
impl CodingAgent for SubprocessAgent {
    async fn run(&self, request: &WorkRequest) -> Result<AgentOutcome> {
        let payload = serde_json::to_vec(request).context("failed to encode work request")?;

        let mut command = Command::new(self.config.command.as_str());
        command.args(&self.config.args);
        if let Some(dir) = self.config.working_dir.as_ref() {
            command.current_dir(dir);
        }
        command
            .env("BONK_REPO", request.repo.as_slug())
            .env("BONK_ISSUE_NUMBER", request.issue_number.to_string())
            .env("BONK_ACTOR", &request.actor)
            .env("BONK_EVENT_KEY", &request.event_key)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn agent '{}'", self.config.command))?;
        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&payload).await {
                Ok(()) => {}
                // Agent exited without reading; its exit status tells the story.
                Err(error) if error.kind() == std::io::ErrorKind::BrokenPipe => {
                    tracing::debug!("agent closed stdin before reading the work request");
                }
                Err(error) => {
                    return Err(error).context("failed to write work request to agent");
                }
            }
        }

        let timeout_ms = self.config.timeout_ms.max(1);
        let output = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            child.wait_with_output(),
        )
        .await
        .map_err(|_| anyhow!("agent exceeded timeout of {timeout_ms}ms"))?
        .context("failed to collect agent output")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "agent exited with {}: {}",
                output
                    .status
                    .code()
                    .map(|code| format!("status {code}"))
                    .unwrap_or_else(|| "a signal".to_string()),
                truncate_for_error(stderr.trim(), STDERR_MAX_CHARS)
            );
        }
        parse_agent_output(&String::from_utf8_lossy(&output.stdout))
    }
}

pub fn parse_agent_output(stdout: &str) -> Result<AgentOutcome> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        bail!("agent produced no output");
    }
    if trimmed.starts_with('{') {
        return serde_json::from_str::<AgentOutcome>(trimmed)
            .context("failed to decode agent outcome");
    }
    Ok(AgentOutcome {
        summary: trimmed.to_string(),
        ..AgentOutcome::default()
    })
}

#[cfg(test)]
mod tests {
    use bonk_github::RepoRef;

    use super::{parse_agent_output, SubprocessAgent, SubprocessAgentConfig};
    use crate::agent::{CodingAgent, WorkRequest};

    fn request() -> WorkRequest {
        WorkRequest {
            repo: RepoRef::new("acme", "widgets"),
            installation_id: None,
            event_key: "issue_comment:9".to_string(),
            actor: "alice".to_string(),
            issue_number: 42,
            is_pull_request: false,
            prompt: "fix the build".to_string(),
            pull_request: None,
        }
    }

    fn shell_agent(script: &str, timeout_ms: u64) -> SubprocessAgent {
        SubprocessAgent::new(SubprocessAgentConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: None,
            timeout_ms,
        })
        .expect("agent")
    }

    #[test]
    fn unit_parse_agent_output_accepts_json_and_plain_text() {
        let outcome = parse_agent_output(
            r#"{"summary":"done","changed_files":["src/lib.rs"],"branch":"bonk/issue-42"}"#,
        )
        .expect("json");
        assert!(outcome.has_changes());
        assert_eq!(outcome.branch.as_deref(), Some("bonk/issue-42"));

        let outcome = parse_agent_output("  just a summary \n").expect("text");
        assert_eq!(outcome.summary, "just a summary");
        assert!(!outcome.has_changes());

        assert!(parse_agent_output("   ").is_err());
        assert!(parse_agent_output("{broken").is_err());
    }

    #[test]
    fn unit_blank_command_is_rejected() {
        let error = SubprocessAgent::new(SubprocessAgentConfig {
            command: "  ".to_string(),
            ..SubprocessAgentConfig::default()
        })
        .err()
        .expect("blank command");
        assert!(error.to_string().contains("cannot be empty"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn functional_agent_reads_request_and_environment() {
        let agent = shell_agent(
            r#"input=$(cat); case "$input" in *"fix the build"*) ;; *) exit 3;; esac; printf '{"summary":"issue %s for %s"}' "$BONK_ISSUE_NUMBER" "$BONK_ACTOR""#,
            5_000,
        );
        let outcome = agent.run(&request()).await.expect("run");
        assert_eq!(outcome.summary, "issue 42 for alice");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn regression_non_zero_exit_reports_stderr() {
        let agent = shell_agent("cat >/dev/null; echo 'model overloaded' >&2; exit 2", 5_000);
        let error = agent.run(&request()).await.expect_err("failure");
        let message = error.to_string();
        assert!(message.contains("status 2"));
        assert!(message.contains("model overloaded"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn regression_slow_agent_is_killed_at_timeout() {
        let agent = shell_agent("sleep 5", 100);
        let error = agent.run(&request()).await.expect_err("timeout");
        assert!(error.to_string().contains("timeout of 100ms"));
    }
}
