//! `POST /webhooks`: signature check, delivery dedupe and routing of mention
//! and `workflow_run` deliveries.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bonk_github::webhook_events::{
    MentionEvent, WebhookError, WebhookEvent, WorkflowRunNotice, DELIVERY_HEADER, EVENT_HEADER,
};
use bonk_github::webhook_signature::{verify_github_signature, SIGNATURE_HEADER};
use bonk_orchestrator::{resolve_pull_request, WorkRequest};
use bonk_tracker::state_store::current_unix_timestamp_ms;
use bonk_tracker::FinalizeOutcome;
use serde_json::{json, Value};

use crate::api_error::ApiError;
use crate::cli::ExecutionMode;
use crate::server::BonkServerState;

type WebhookReply = (StatusCode, Json<Value>);

fn reply(status: StatusCode, body: Value) -> WebhookReply {
    (status, Json(body))
}

fn ignored(reason: &str) -> WebhookReply {
    reply(StatusCode::OK, json!({ "status": "ignored", "reason": reason }))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn payload_error(error: WebhookError) -> ApiError {
    ApiError::bad_request(error.code(), error.to_string())
}

pub async fn handle_github_webhook(
    State(state): State<Arc<BonkServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match process_webhook(&state, &headers, &body).await {
        Ok(reply) => reply.into_response(),
        Err(error) => error.into_response(),
    }
}

async fn process_webhook(
    state: &Arc<BonkServerState>,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<WebhookReply, ApiError> {
    let event_name = header_str(headers, EVENT_HEADER).ok_or_else(|| {
        ApiError::bad_request("missing_event", format!("missing {EVENT_HEADER} header"))
    })?;
    verify_github_signature(
        body,
        header_str(headers, SIGNATURE_HEADER),
        &state.config.webhook_secret,
    )
    .map_err(|error| {
        tracing::warn!(event = event_name, code = error.code(), "rejected webhook delivery");
        ApiError::new(StatusCode::UNAUTHORIZED, error.code(), error.to_string())
    })?;

    let Some(event) = WebhookEvent::parse(event_name, body).map_err(payload_error)? else {
        return Ok(ignored("unsupported_event"));
    };
    let notice = event.workflow_run_notice().map_err(payload_error)?;
    let mention = match notice {
        Some(_) => None,
        None => event.mention_event().map_err(payload_error)?,
    };

    // Only deliveries that parsed are remembered, so a redelivery can
    // recover from a rejected payload.
    if let Some(delivery_id) = header_str(headers, DELIVERY_HEADER) {
        if !state.note_delivery(delivery_id) {
            tracing::debug!(delivery_id, "duplicate webhook delivery");
            return Ok(reply(StatusCode::OK, json!({ "status": "duplicate" })));
        }
    }

    if let Some(notice) = notice {
        return Ok(handle_workflow_run(state, notice).await);
    }
    match mention {
        Some(mention) => Ok(handle_mention(state, mention).await),
        None => Ok(ignored("unsupported_action")),
    }
}

async fn handle_workflow_run(state: &BonkServerState, notice: WorkflowRunNotice) -> WebhookReply {
    let shared = state.registry.tracker(&notice.repo);
    let mut tracker = shared.lock().await;
    tracker.set_installation_id(notice.installation_id);
    let now = current_unix_timestamp_ms();

    match notice.action.as_str() {
        "requested" | "in_progress" => {
            if tracker.state().runs.contains_key(&notice.run_id) {
                return reply(
                    StatusCode::OK,
                    json!({ "status": "already_tracked", "run_id": notice.run_id }),
                );
            }
            if !notice.is_mention_run(state.config.workflow_path.as_deref()) {
                tracing::debug!(
                    repo = %notice.repo,
                    run_id = notice.run_id,
                    event = notice.event.as_deref().unwrap_or("unknown"),
                    workflow = notice.workflow_path.as_deref().unwrap_or("unknown"),
                    "workflow run is not a mention run"
                );
                return ignored("unrelated_workflow");
            }
            let Some(actor) = notice.actor.as_deref() else {
                return ignored("missing_actor");
            };
            let Some(pending) = tracker.consume_pending(actor) else {
                return ignored("no_pending_request");
            };
            tracker.track_run(notice.run_id, &notice.run_url, pending.issue_number, now);
            reply(
                StatusCode::ACCEPTED,
                json!({
                    "status": "tracked",
                    "run_id": notice.run_id,
                    "issue_number": pending.issue_number,
                }),
            )
        }
        "completed" => {
            let outcome = tracker
                .finalize_run(notice.run_id, notice.conclusion.as_deref(), now)
                .await;
            let status = match outcome {
                FinalizeOutcome::Finished { .. } => "finalized",
                FinalizeOutcome::AlreadyFinished(_) => "already_finished",
                FinalizeOutcome::UnknownRun => "untracked",
            };
            reply(
                StatusCode::OK,
                json!({ "status": status, "run_id": notice.run_id }),
            )
        }
        _ => ignored("unsupported_action"),
    }
}

fn is_own_comment(state: &BonkServerState, event: &MentionEvent) -> bool {
    event.actor_is_bot
        || state
            .config
            .bot_login
            .as_deref()
            .is_some_and(|login| login.eq_ignore_ascii_case(&event.actor))
}

async fn handle_mention(state: &Arc<BonkServerState>, event: MentionEvent) -> WebhookReply {
    if is_own_comment(state, &event) {
        return ignored("bot_sender");
    }
    let triggers = &state.config.triggers;
    if !triggers.has_mention(&event.body) {
        return ignored("no_mention");
    }
    let prompt = triggers.extract_prompt(&event.body, event.review_context.as_ref());
    let request = WorkRequest::from_mention(&event, prompt);
    tracing::info!(
        repo = %request.repo,
        actor = %request.actor,
        issue_number = request.issue_number,
        event_key = %request.event_key,
        mode = state.config.mode.as_str(),
        "accepted mention"
    );

    match state.config.mode {
        ExecutionMode::Workflow => register_for_workflow(state, request, &event.created_at).await,
        ExecutionMode::Direct => {
            if state.orchestrator.is_none() {
                tracing::warn!(repo = %request.repo, "direct mode request without a configured agent");
                return ignored("agent_unavailable");
            }
            let event_key = request.event_key.clone();
            let task_state = Arc::clone(state);
            state.spawn_request(async move { run_direct(task_state, request).await });
            reply(
                StatusCode::ACCEPTED,
                json!({ "status": "accepted", "event_key": event_key }),
            )
        }
    }
}

async fn register_for_workflow(
    state: &BonkServerState,
    request: WorkRequest,
    created_at: &str,
) -> WebhookReply {
    let request = if request.is_pull_request && request.pull_request.is_none() {
        let host = match state
            .hosts
            .connect(&request.repo, request.installation_id)
            .await
        {
            Ok(host) => host,
            Err(error) => {
                tracing::warn!(repo = %request.repo, error = %format!("{error:#}"), "failed to open github session");
                return ignored("pull_request_unavailable");
            }
        };
        match resolve_pull_request(host.as_ref(), &request).await {
            Ok(resolved) => resolved,
            Err(error) => return ignored(error.code()),
        }
    } else {
        request
    };
    if request.pull_request.as_ref().is_some_and(|pull| pull.is_fork()) {
        tracing::info!(repo = %request.repo, actor = %request.actor, "refusing mention on fork pull request");
        return ignored("fork_refused");
    }

    let shared = state.registry.tracker(&request.repo);
    let mut tracker = shared.lock().await;
    tracker.set_installation_id(request.installation_id);
    let key = tracker.register_pending(
        &request.actor,
        created_at,
        request.issue_number,
        current_unix_timestamp_ms(),
    );
    reply(
        StatusCode::ACCEPTED,
        json!({ "status": "registered", "correlation_key": key }),
    )
}

async fn run_direct(state: Arc<BonkServerState>, request: WorkRequest) {
    let Some(orchestrator) = state.orchestrator.as_ref() else {
        return;
    };
    let host = match state
        .hosts
        .connect(&request.repo, request.installation_id)
        .await
    {
        Ok(host) => host,
        Err(error) => {
            tracing::warn!(repo = %request.repo, error = %format!("{error:#}"), "failed to open github session");
            return;
        }
    };
    match orchestrator.handle(host.as_ref(), &request, None).await {
        Ok(report) => tracing::info!(
            repo = %request.repo,
            issue_number = request.issue_number,
            comment_id = report.comment_id,
            attempts = report.attempts,
            finalized = report.finalized,
            "direct request finished"
        ),
        Err(error) if error.is_silent() => tracing::info!(
            repo = %request.repo,
            issue_number = request.issue_number,
            code = error.code(),
            "direct request refused"
        ),
        Err(error) => tracing::warn!(
            repo = %request.repo,
            issue_number = request.issue_number,
            code = error.code(),
            error = %error,
            "direct request failed"
        ),
    }
}
