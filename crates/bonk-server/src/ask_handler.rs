//! `POST /ask`: runs one direct-mode request on behalf of an API caller and
//! streams its progress as server-sent events.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use bonk_github::RepoRef;
use bonk_orchestrator::{OrchestratorProgress, WorkRequest};
use bonk_tracker::state_store::current_unix_timestamp_ms;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::api_error::ApiError;
use crate::auth::authorize_api_request;
use crate::server::{parse_json_body, BonkServerState};

#[derive(Debug, Clone, Deserialize)]
pub struct AskRequest {
    pub repo: String,
    pub issue_number: u64,
    pub prompt: String,
    pub actor: String,
    #[serde(default)]
    pub is_pull_request: bool,
    #[serde(default)]
    pub installation_id: Option<u64>,
}

impl AskRequest {
    fn into_work_request(self, now_unix_ms: u64) -> Result<WorkRequest, ApiError> {
        let repo = RepoRef::parse(&self.repo)
            .map_err(|error| ApiError::bad_request("invalid_repo", format!("{error:#}")))?;
        let prompt = self.prompt.trim();
        if prompt.is_empty() {
            return Err(ApiError::bad_request("missing_prompt", "prompt cannot be empty"));
        }
        let actor = self.actor.trim();
        if actor.is_empty() {
            return Err(ApiError::bad_request("missing_actor", "actor cannot be empty"));
        }
        if self.issue_number == 0 {
            return Err(ApiError::bad_request(
                "invalid_issue_number",
                "issue_number must be greater than 0",
            ));
        }
        Ok(WorkRequest {
            repo,
            installation_id: self.installation_id,
            event_key: format!("ask:{now_unix_ms}"),
            actor: actor.to_string(),
            issue_number: self.issue_number,
            is_pull_request: self.is_pull_request,
            prompt: prompt.to_string(),
            pull_request: None,
        })
    }
}

#[derive(Debug)]
enum SseFrame {
    Json { event: &'static str, payload: Value },
    Done,
}

impl SseFrame {
    fn progress(progress: &OrchestratorProgress) -> Self {
        Self::Json {
            event: "status",
            payload: serde_json::to_value(progress).unwrap_or(Value::Null),
        }
    }

    fn into_event(self) -> Event {
        match self {
            Self::Json { event, payload } => Event::default().event(event).data(payload.to_string()),
            Self::Done => Event::default().event("done").data("[DONE]"),
        }
    }
}

pub async fn handle_ask(
    State(state): State<Arc<BonkServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(error) = authorize_api_request(state.config.api_token.as_deref(), &headers) {
        return error.into_response();
    }
    let Some(orchestrator) = state.orchestrator.clone() else {
        return ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "agent_unavailable",
            "no coding agent is configured",
        )
        .into_response();
    };
    let request = match parse_json_body::<AskRequest>(&body)
        .and_then(|ask| ask.into_work_request(current_unix_timestamp_ms()))
    {
        Ok(request) => request,
        Err(error) => return error.into_response(),
    };
    let host = match state
        .hosts
        .connect(&request.repo, request.installation_id)
        .await
    {
        Ok(host) => host,
        Err(error) => {
            return ApiError::bad_gateway("github_unavailable", format!("{error:#}"))
                .into_response();
        }
    };
    tracing::info!(
        repo = %request.repo,
        actor = %request.actor,
        issue_number = request.issue_number,
        "accepted ask request"
    );

    let (tx, rx) = mpsc::unbounded_channel::<SseFrame>();
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<OrchestratorProgress>();
    let forward = tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(progress) = progress_rx.recv().await {
            let _ = forward.send(SseFrame::progress(&progress));
        }
    });
    state.spawn_request(async move {
        let result = orchestrator
            .handle(host.as_ref(), &request, Some(&progress_tx))
            .await;
        drop(progress_tx);
        let _ = forwarder.await;
        if let Err(error) = result {
            let _ = tx.send(SseFrame::Json {
                event: "error",
                payload: json!({ "code": error.code(), "message": error.to_string() }),
            });
        }
        let _ = tx.send(SseFrame::Done);
    });

    let stream =
        UnboundedReceiverStream::new(rx).map(|frame| Ok::<Event, Infallible>(frame.into_event()));
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}
