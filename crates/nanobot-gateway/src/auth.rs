use axum::extract::{Query, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::state::SharedState;

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Reject requests that do not carry the configured API key, either as a
/// bearer token or as `?token=`. A gateway without a key lets everything in.
pub async fn require_api_key(
    State(state): State<SharedState>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = state
        .config
        .gateway
        .api_key
        .as_deref()
        .filter(|k| !k.is_empty())
    else {
        return next.run(req).await;
    };

    let bearer = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    let presented = bearer.or_else(|| {
        Query::<TokenQuery>::try_from_uri(req.uri())
            .ok()
            .and_then(|Query(q)| q.token)
    });

    match presented {
        Some(key) if key_matches(&key, expected) => next.run(req).await,
        _ => {
            debug!(path = %req.uri().path(), "rejected request without a valid api key");
            (
                StatusCode::UNAUTHORIZED,
                axum::Json(serde_json::json!({ "error": "invalid or missing api key" })),
            )
                .into_response()
        }
    }
}

fn key_matches(presented: &str, expected: &str) -> bool {
    presented.len() == expected.len() && bool::from(presented.as_bytes().ct_eq(expected.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::key_matches;

    #[test]
    fn keys_compare_exactly() {
        assert!(key_matches("s3cret", "s3cret"));
        assert!(!key_matches("s3cret", "s3creT"));
        assert!(!key_matches("s3cre", "s3cret"));
        assert!(!key_matches("", "s3cret"));
    }
}
