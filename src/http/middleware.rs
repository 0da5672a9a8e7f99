//! Request guards: API-key tenant resolution and admin basic auth.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use secrecy::ExposeSecret;
use serde_json::json;
use subtle::ConstantTimeEq;

use crate::app::Engine;
use crate::error::EngineError;

/// Resolve the caller's API key to a tenant and stash it in request
/// extensions. Accepts `Authorization: Bearer <key>` or `X-API-Key: <key>`.
pub async fn require_api_key(
    State(engine): State<Arc<Engine>>,
    mut request: Request,
    next: Next,
) -> Result<Response, EngineError> {
    let headers = request.headers();
    let api_key = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .or_else(|| {
            headers
                .get("x-api-key")
                .and_then(|value| value.to_str().ok())
        })
        .filter(|key| !key.is_empty())
        .ok_or(EngineError::MissingApiKey)?
        .to_string();

    let tenant = engine
        .tenants()
        .resolve(&api_key)
        .await?
        .ok_or(EngineError::InvalidApiKey)?;

    request.extensions_mut().insert(tenant);
    Ok(next.run(request).await)
}

/// Basic-auth guard for the admin surface. The password check is
/// constant-time; a deployment without a configured password answers 500
/// rather than silently allowing access.
pub async fn require_admin(
    State(engine): State<Arc<Engine>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(password) = engine.config().admin_password.as_ref() else {
        return EngineError::AdminAuthNotConfigured.into_response();
    };

    let supplied = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Basic "))
        .and_then(|encoded| BASE64_STANDARD.decode(encoded).ok())
        .and_then(|decoded| String::from_utf8(decoded).ok())
        .and_then(|decoded| {
            decoded
                .split_once(':')
                .map(|(_user, password)| password.to_string())
        });

    let authorized = supplied.is_some_and(|candidate| {
        bool::from(
            candidate
                .as_bytes()
                .ct_eq(password.expose_secret().as_bytes()),
        )
    });

    if !authorized {
        return unauthorized();
    }

    next.run(request).await
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"purser-admin\"")],
        Json(json!({"error": "unauthorized"})),
    )
        .into_response()
}
