//! Bearer-token authentication.
//!
//! Single static token, set once at startup, compared with a fixed-time
//! equality check before anything else sees the request.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use subtle::ConstantTimeEq;

use super::super::AppState;

pub async fn require_auth(State(state): State<AppState>, request: Request<Body>, next: Next) -> Response {
    if state.config.auth.disabled {
        return next.run(request).await;
    }

    let auth_header = request.headers().get("Authorization").and_then(|h| h.to_str().ok());

    let token = match auth_header {
        Some(header) if header.starts_with("Bearer ") => &header[7..],
        _ => return unauthorized_response("missing or invalid authorization header"),
    };

    let token_matches: bool = token.as_bytes().ct_eq(state.config.auth.bearer_token.as_bytes()).into();
    if !token_matches {
        return unauthorized_response("invalid authentication token");
    }

    next.run(request).await
}

fn unauthorized_response(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": true,
            "message": message,
        })),
    )
        .into_response()
}
