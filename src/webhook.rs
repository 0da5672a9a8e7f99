//! Store webhook ingestion.
//!
//! Webhooks are trusted as pre-verified by the originating store: no outbound
//! verification call is made. The raw delivery is recorded before any
//! interpretation, so even unparseable or unknown payloads leave an audit
//! trail.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::reconciler::Reconciler;
use crate::store::{new_row_id, Environment, Event, Store, SubscriberStore, WebhookRecord};
use crate::tenant::Tenant;
use crate::verifier::VerifiedPurchase;

/// Window granted when a renewal-family event carries no expiry.
const DEFAULT_EXPIRY_DAYS: i64 = 30;

const RENEWAL_TYPES: &[&str] = &["initial_purchase", "renewal", "non_renewing_purchase"];
const TERMINAL_TYPES: &[&str] = &["cancellation", "expiration"];

/// Parsed webhook body. Everything beyond the event type and subscriber id
/// is optional; absent fields fall back to defaults rather than rejecting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    #[serde(rename = "type")]
    pub event_type: String,
    pub app_user_id: String,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub entitlement_id: Option<String>,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub store: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub purchase_date_ms: Option<i64>,
    #[serde(default)]
    pub expires_date_ms: Option<i64>,
}

/// What ingestion did with the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Renewal-family event installed a fresh active subscription and
    /// entitlement.
    Applied,
    /// Terminal event deactivated all of the subscriber's active rows.
    Deactivated,
    /// Unrecognized type; recorded for audit, no state mutated.
    Ignored,
}

pub struct WebhookIngestor {
    store: Arc<dyn SubscriberStore>,
    reconciler: Arc<Reconciler>,
}

impl WebhookIngestor {
    #[must_use]
    pub fn new(store: Arc<dyn SubscriberStore>, reconciler: Arc<Reconciler>) -> Self {
        Self { store, reconciler }
    }

    /// Ingest a raw webhook body.
    ///
    /// The delivery record is appended before parsing, so a rejected payload
    /// is still on file. Renewal-family events without a product id are a
    /// client error; terminal events deactivate account-wide by design.
    pub async fn ingest(&self, tenant: &Tenant, raw: Value) -> Result<WebhookOutcome> {
        let event_type = raw
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        self.store
            .record_webhook(WebhookRecord {
                id: new_row_id(),
                tenant_id: tenant.id.clone(),
                event_type: event_type.clone(),
                received_at: Utc::now(),
                payload: raw.clone(),
            })
            .await?;

        let payload: WebhookPayload = serde_json::from_value(raw.clone())
            .map_err(|err| EngineError::InvalidPayload(err.to_string()))?;

        if RENEWAL_TYPES.contains(&payload.event_type.as_str()) {
            let purchase = trusted_purchase(&payload)?;
            self.reconciler
                .apply_trusted(
                    tenant,
                    &payload.app_user_id,
                    &purchase,
                    &format!("webhook_{}", payload.event_type),
                )
                .await?;
            return Ok(WebhookOutcome::Applied);
        }

        if TERMINAL_TYPES.contains(&payload.event_type.as_str()) {
            self.reconciler
                .deactivate_subscriber(
                    tenant,
                    &payload.app_user_id,
                    &format!("webhook_{}", payload.event_type),
                    raw,
                )
                .await?;
            return Ok(WebhookOutcome::Deactivated);
        }

        // Forward-compatible: store event types we do not yet interpret are
        // audited and acknowledged.
        self.store
            .record_event(Event {
                id: new_row_id(),
                tenant_id: tenant.id.clone(),
                event_type: format!("webhook_{}", payload.event_type),
                app_user_id: Some(payload.app_user_id.clone()),
                product_id: payload.product_id.clone(),
                amount_cents: None,
                payload: raw,
                created_at: Utc::now(),
            })
            .await?;

        tracing::debug!(
            target: "purser::webhook",
            tenant = %tenant.id,
            event_type = %payload.event_type,
            "unrecognized webhook type recorded"
        );
        Ok(WebhookOutcome::Ignored)
    }
}

/// Build the purchase a renewal-family webhook asserts, trusting its claimed
/// timestamps.
fn trusted_purchase(payload: &WebhookPayload) -> Result<VerifiedPurchase> {
    let product_id = payload
        .product_id
        .clone()
        .ok_or(EngineError::MissingProductId)?;

    let purchase_date = payload
        .purchase_date_ms
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);

    let expires_date = payload
        .expires_date_ms
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(|| Utc::now() + Duration::days(DEFAULT_EXPIRY_DAYS));

    let store = payload
        .store
        .as_deref()
        .map_or(Store::AppStore, Store::from_wire);

    let environment = match payload.environment.as_deref() {
        Some("sandbox") => Environment::Sandbox,
        _ => Environment::Production,
    };

    Ok(VerifiedPurchase {
        entitlement_id: payload
            .entitlement_id
            .clone()
            .unwrap_or_else(|| product_id.clone()),
        product_id,
        transaction_id: payload.transaction_id.clone(),
        store,
        purchase_date,
        expires_date: Some(expires_date),
        environment,
        amount_cents: None,
    })
}
