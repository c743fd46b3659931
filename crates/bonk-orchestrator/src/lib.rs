//! Direct-mode handling of a mention: permission gate, placeholder comment,
//! bounded agent retries and a single finalization of that comment.

pub mod agent;
pub mod host;
pub mod orchestrator;
pub mod subprocess_agent;

pub use agent::{AgentOutcome, CodingAgent, WorkRequest};
pub use host::{RepositoryHost, RepositoryHostFactory};
pub use orchestrator::{
    OrchestrationOutcome, OrchestrationReport, Orchestrator, OrchestratorConfig,
    OrchestratorError, OrchestratorProgress, resolve_pull_request,
};
pub use subprocess_agent::{SubprocessAgent, SubprocessAgentConfig};
