//! HTTP surface.
//!
//! SDK routes live under `/v1` behind API-key resolution; the operator
//! surface lives under `/admin` behind basic auth. Unmatched `/v1` paths
//! answer 501 so SDK clients probing unimplemented endpoints get a stable
//! machine-readable response instead of a bare 404.

mod handlers;
mod middleware;

use std::sync::Arc;

use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;

use crate::app::Engine;

pub fn router(engine: Arc<Engine>) -> Router {
    let v1 = Router::new()
        .route("/receipts", post(handlers::submit_receipt))
        .route("/subscribers/identify", post(handlers::identify))
        .route("/subscribers/:app_user_id", get(handlers::get_subscriber))
        .route(
            "/subscribers/:app_user_id/attributes",
            post(handlers::set_attributes),
        )
        .route("/webhooks", post(handlers::ingest_webhook))
        .fallback(handlers::not_implemented)
        .layer(from_fn_with_state(
            engine.clone(),
            middleware::require_api_key,
        ))
        // Health stays reachable without credentials
        .route("/health", get(handlers::health));

    let admin = Router::new()
        .route("/health", get(handlers::admin_health))
        .layer(from_fn_with_state(engine.clone(), middleware::require_admin));

    Router::new()
        .nest("/v1", v1)
        .nest("/admin", admin)
        .with_state(engine)
}
