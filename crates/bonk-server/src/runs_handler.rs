//! `POST /runs/register` and `POST /runs/finalize`, called by the workflow
//! itself once it knows its run id and again when it finishes.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bonk_github::RepoRef;
use bonk_tracker::state_store::current_unix_timestamp_ms;
use bonk_tracker::FinalizeOutcome;
use chrono::DateTime;
use serde::Deserialize;
use serde_json::json;

use crate::api_error::ApiError;
use crate::auth::authorize_api_request;
use crate::server::{parse_json_body, BonkServerState};

#[derive(Debug, Clone, Deserialize)]
pub struct RunRegistration {
    pub owner: String,
    pub repo: String,
    pub run_id: u64,
    #[serde(default)]
    pub run_url: Option<String>,
    /// Known issue number; skips correlation entirely.
    #[serde(default)]
    pub issue_number: Option<u64>,
    /// RFC 3339 start time of the run; the timeout is measured from it.
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub actor: Option<String>,
    /// Timestamp half of the correlation key. Matching is by actor only;
    /// a mismatch is logged.
    #[serde(default)]
    pub correlation_timestamp: Option<String>,
    #[serde(default)]
    pub installation_id: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunFinalization {
    pub owner: String,
    pub repo: String,
    pub run_id: u64,
    /// Run conclusion as GitHub reports it, e.g. `success` or `cancelled`.
    pub status: String,
}

fn repo_from_parts(owner: &str, name: &str) -> Result<RepoRef, ApiError> {
    RepoRef::from_parts(owner, name)
        .map_err(|error| ApiError::bad_request("invalid_repo", format!("{error:#}")))
}

fn parse_created_at(raw: &str) -> Result<u64, ApiError> {
    let parsed = DateTime::parse_from_rfc3339(raw.trim()).map_err(|error| {
        ApiError::bad_request(
            "invalid_created_at",
            format!("created_at '{raw}' is not RFC 3339: {error}"),
        )
    })?;
    u64::try_from(parsed.timestamp_millis()).map_err(|_| {
        ApiError::bad_request("invalid_created_at", format!("created_at '{raw}' predates 1970"))
    })
}

pub async fn handle_register_run(
    State(state): State<Arc<BonkServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match register_run(&state, &headers, &body).await {
        Ok(tracked) => (StatusCode::OK, Json(json!({ "tracked": tracked }))).into_response(),
        Err(error) => error.into_response(),
    }
}

async fn register_run(
    state: &BonkServerState,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<bool, ApiError> {
    authorize_api_request(state.config.api_token.as_deref(), headers)?;
    let registration = parse_json_body::<RunRegistration>(body)?;
    let repo = repo_from_parts(&registration.owner, &registration.repo)?;
    let run_url = registration
        .run_url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| {
            format!(
                "https://github.com/{}/actions/runs/{}",
                repo.as_slug(),
                registration.run_id
            )
        });
    let now = current_unix_timestamp_ms();
    let created_unix_ms = match registration.created_at.as_deref() {
        Some(raw) => parse_created_at(raw)?,
        None => now,
    };

    let shared = state.registry.tracker(&repo);
    let mut tracker = shared.lock().await;
    tracker.set_installation_id(registration.installation_id);

    if let Some(issue_number) = registration.issue_number {
        return Ok(tracker.track_run_created_at(
            registration.run_id,
            &run_url,
            issue_number,
            created_unix_ms,
            now,
        ));
    }
    let Some(actor) = registration
        .actor
        .as_deref()
        .map(str::trim)
        .filter(|actor| !actor.is_empty())
    else {
        return Err(ApiError::bad_request(
            "missing_correlation",
            "either issue_number or actor is required",
        ));
    };
    if tracker.state().runs.contains_key(&registration.run_id) {
        return Ok(false);
    }
    match tracker.consume_pending(actor) {
        Some(pending) => {
            if let Some(expected) = registration.correlation_timestamp.as_deref() {
                if expected.trim() != pending.request_timestamp {
                    tracing::info!(repo = %repo, key = %pending.key, expected, "run matched an earlier pending request for the same actor");
                }
            }
            Ok(tracker.track_run_created_at(
                registration.run_id,
                &run_url,
                pending.issue_number,
                created_unix_ms,
                now,
            ))
        }
        None => {
            tracing::info!(repo = %repo, actor, run_id = registration.run_id, "no pending request for run registration");
            Ok(false)
        }
    }
}

pub async fn handle_finalize_run(
    State(state): State<Arc<BonkServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match finalize_run(&state, &headers, &body).await {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(error) => error.into_response(),
    }
}

async fn finalize_run(
    state: &BonkServerState,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<serde_json::Value, ApiError> {
    authorize_api_request(state.config.api_token.as_deref(), headers)?;
    let finalization = parse_json_body::<RunFinalization>(body)?;
    let repo = repo_from_parts(&finalization.owner, &finalization.repo)?;
    let shared = state.registry.tracker(&repo);
    let mut tracker = shared.lock().await;
    let outcome = tracker
        .finalize_run(
            finalization.run_id,
            Some(finalization.status.as_str()),
            current_unix_timestamp_ms(),
        )
        .await;
    Ok(match outcome {
        FinalizeOutcome::Finished { state, notified } => json!({
            "outcome": "finished",
            "state": state.as_str(),
            "notified": notified,
        }),
        FinalizeOutcome::AlreadyFinished(state) => json!({
            "outcome": "already_finished",
            "state": state.as_str(),
        }),
        FinalizeOutcome::UnknownRun => json!({ "outcome": "unknown_run" }),
    })
}
