//! Shared-secret authentication.
//!
//! The admin API uses one pre-shared key. Replication endpoints use the receiving
//! site's own key. Both compare in constant time and reject before the body is read.

use axum::{
    extract::{Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use subtle::ConstantTimeEq;

use crate::errors::{codes, ErrorDetails, ErrorResponse};
use crate::AppState;

/// Header name for the API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// PSK authentication layer function that takes the expected PSK as a parameter.
pub async fn psk_auth_layer(
    expected_psk: Option<String>,
    request: Request,
    next: Next,
) -> Response {
    // If no PSK is configured, allow all requests (dev mode)
    let Some(expected) = expected_psk else {
        return next.run(request).await;
    };

    match provided_key(request.headers()) {
        Some(key) if constant_time_compare(&key, &expected) => next.run(request).await,
        Some(_) => unauthorized_response("Invalid API key"),
        None => unauthorized_response("Missing or invalid API key"),
    }
}

/// Per-site key check for the replication endpoints under `/sites/{site_id}/ccm/v1`.
pub async fn site_key_auth(
    State(state): State<AppState>,
    Path(site_id): Path<i64>,
    request: Request,
    next: Next,
) -> Response {
    let Some(provided) = provided_key(request.headers()) else {
        return unauthorized_response("Missing API key");
    };

    let expected = match state.repo.get_site_key(site_id).await {
        Ok(Some(key)) => key,
        Ok(None) => return unauthorized_response("Unknown site"),
        Err(e) => {
            tracing::error!("Site key lookup for site {} failed: {}", site_id, e);
            return e.into_response();
        }
    };

    if constant_time_compare(&provided, &expected) {
        next.run(request).await
    } else {
        tracing::warn!("Rejected replication call to site {}: bad key", site_id);
        unauthorized_response("Invalid API key")
    }
}

/// Key from `x-api-key`, or a bearer token.
fn provided_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.strip_prefix("Bearer "))
        })
        .map(|s| s.to_string())
}

/// Perform constant-time string comparison.
fn constant_time_compare(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();

    // Constant-time comparison
    a_bytes.ct_eq(b_bytes).into()
}

/// Create an unauthorized response.
fn unauthorized_response(message: &str) -> Response {
    let body = ErrorResponse {
        success: false,
        error: ErrorDetails {
            code: codes::UNAUTHORIZED.to_string(),
            message: message.to_string(),
            details: None,
        },
    };

    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_constant_time_compare_equal() {
        assert!(constant_time_compare("test-key-123", "test-key-123"));
    }

    #[test]
    fn test_constant_time_compare_not_equal() {
        assert!(!constant_time_compare("test-key-123", "test-key-124"));
    }

    #[test]
    fn test_constant_time_compare_different_lengths() {
        assert!(!constant_time_compare("short", "much-longer-key"));
    }

    #[test]
    fn test_constant_time_compare_empty() {
        assert!(constant_time_compare("", ""));
        assert!(!constant_time_compare("", "not-empty"));
    }

    #[test]
    fn test_provided_key_prefers_header_then_bearer() {
        let mut headers = HeaderMap::new();
        assert_eq!(provided_key(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer tok"));
        assert_eq!(provided_key(&headers).as_deref(), Some("tok"));

        headers.insert(API_KEY_HEADER, HeaderValue::from_static("key"));
        assert_eq!(provided_key(&headers).as_deref(), Some("key"));
    }
}
