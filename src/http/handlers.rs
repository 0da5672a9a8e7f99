//! Route handlers for the SDK and admin surfaces.
//!
//! Bodies are parsed by hand from bytes so malformed JSON yields the same
//! `invalid_payload` shape as a failed field validation, instead of the
//! extractor's default rejection.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::{SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::app::Engine;
use crate::error::{EngineError, Result};
use crate::projection::CustomerProjection;
use crate::store::Store;
use crate::tenant::Tenant;
use crate::verifier::{PurchaseClaim, PurchaseProof};

/// Standard SDK response wrapper around a projection.
#[derive(Debug, Serialize)]
struct SubscriberEnvelope {
    request_date: String,
    request_date_ms: i64,
    subscriber: CustomerProjection,
}

fn envelope(subscriber: CustomerProjection) -> Json<SubscriberEnvelope> {
    let now = Utc::now();
    Json(SubscriberEnvelope {
        request_date: now.to_rfc3339_opts(SecondsFormat::Millis, true),
        request_date_ms: now.timestamp_millis(),
        subscriber,
    })
}

fn parse_body<T: DeserializeOwned>(bytes: &Bytes) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|err| EngineError::InvalidPayload(err.to_string()))
}

#[derive(Debug, Deserialize)]
struct ReceiptRequest {
    app_user_id: String,
    product_id: String,
    #[serde(default = "default_store")]
    store: String,
    #[serde(default)]
    transaction_id: Option<String>,
    #[serde(default)]
    receipt_data: Option<String>,
    #[serde(default)]
    purchase_token: Option<String>,
    #[serde(default)]
    package_name: Option<String>,
}

fn default_store() -> String {
    "app_store".to_string()
}

impl ReceiptRequest {
    fn into_claim(self) -> (String, PurchaseClaim) {
        let store = Store::from_wire(&self.store);
        let proof = match store {
            Store::AppStore => self
                .receipt_data
                .map(|receipt_data| PurchaseProof::AppStoreReceipt { receipt_data }),
            Store::PlayStore => self.purchase_token.map(|purchase_token| {
                PurchaseProof::PlayStoreToken {
                    purchase_token,
                    package_name: self.package_name.unwrap_or_default(),
                }
            }),
        };

        (
            self.app_user_id,
            PurchaseClaim {
                store,
                product_id: self.product_id,
                transaction_id: self.transaction_id,
                proof,
            },
        )
    }
}

pub(super) async fn submit_receipt(
    State(engine): State<Arc<Engine>>,
    Extension(tenant): Extension<Tenant>,
    body: Bytes,
) -> Result<Response> {
    let request: ReceiptRequest = parse_body(&body)?;
    if request.app_user_id.is_empty() || request.product_id.is_empty() {
        return Err(EngineError::InvalidPayload(
            "app_user_id and product_id are required".to_string(),
        ));
    }

    let (app_user_id, claim) = request.into_claim();
    let projection = engine.submit_receipt(&tenant, &app_user_id, claim).await?;
    Ok(envelope(projection).into_response())
}

pub(super) async fn get_subscriber(
    State(engine): State<Arc<Engine>>,
    Extension(tenant): Extension<Tenant>,
    Path(app_user_id): Path<String>,
) -> Result<Response> {
    let projection = engine.customer_info(&tenant, &app_user_id).await?;
    Ok(envelope(projection).into_response())
}

#[derive(Debug, Deserialize)]
struct AttributesRequest {
    #[serde(default)]
    attributes: Option<HashMap<String, String>>,
}

pub(super) async fn set_attributes(
    State(engine): State<Arc<Engine>>,
    Extension(tenant): Extension<Tenant>,
    Path(app_user_id): Path<String>,
    body: Bytes,
) -> Result<Response> {
    let request: AttributesRequest = parse_body(&body)?;
    engine
        .set_attributes(&tenant, &app_user_id, request.attributes.unwrap_or_default())
        .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Debug, Deserialize)]
struct IdentifyRequest {
    app_user_id: String,
    new_app_user_id: String,
}

pub(super) async fn identify(
    State(engine): State<Arc<Engine>>,
    Extension(tenant): Extension<Tenant>,
    body: Bytes,
) -> Result<Response> {
    let request: IdentifyRequest = parse_body(&body)?;
    if request.app_user_id.is_empty() || request.new_app_user_id.is_empty() {
        return Err(EngineError::InvalidPayload(
            "app_user_id and new_app_user_id are required".to_string(),
        ));
    }

    let outcome = engine
        .identify(&tenant, &request.app_user_id, &request.new_app_user_id)
        .await?;
    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(json!({"subscriber": outcome.projection}))).into_response())
}

pub(super) async fn ingest_webhook(
    State(engine): State<Arc<Engine>>,
    Extension(tenant): Extension<Tenant>,
    body: Bytes,
) -> Result<Response> {
    let payload: Value = parse_body(&body)?;
    engine.ingest_webhook(&tenant, payload).await?;
    Ok(Json(json!({"status": "ok"})).into_response())
}

pub(super) async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

pub(super) async fn admin_health() -> Json<Value> {
    Json(json!({"status": "ok", "surface": "admin"}))
}

pub(super) async fn not_implemented() -> EngineError {
    EngineError::NotImplemented
}
