use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};

use crate::api_error::ApiError;

fn bearer_token_from_headers(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = raw.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

/// Checks the bearer token guarding the `/ask` and `/runs` endpoints.
pub fn authorize_api_request(expected: Option<&str>, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = expected else {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "api_disabled",
            "api token is not configured",
        ));
    };
    match bearer_token_from_headers(headers) {
        Some(observed) if observed == expected => Ok(()),
        _ => {
            tracing::warn!("rejected api request with missing or invalid bearer token");
            Err(ApiError::unauthorized())
        }
    }
}
