//! App Store receipt verification.
//!
//! Calls the verifyReceipt endpoint with the tenant's shared secret. A
//! sandbox-receipt status (21007) is retried once against the sandbox
//! endpoint; any other non-zero status is a rejection. When the response
//! carries multiple transactions, the most recent by purchase time wins.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use secrecy::ExposeSecret;
use serde_json::Value;

use crate::config::AppStoreConfig;
use crate::store::{Environment, Store};

use super::{PurchaseClaim, PurchaseProof, VerifiedPurchase, VerifyFailure, VerifyResult};

/// Receipt was issued by the sandbox but sent to production.
const STATUS_SANDBOX_RECEIPT: i64 = 21007;

pub struct AppStoreVerifier {
    client: reqwest::Client,
    config: AppStoreConfig,
}

impl AppStoreVerifier {
    #[must_use]
    pub fn new(config: AppStoreConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .unwrap_or_default();

        Self { client, config }
    }

    pub async fn verify(&self, claim: &PurchaseClaim) -> VerifyResult {
        let receipt_data = match &claim.proof {
            Some(PurchaseProof::AppStoreReceipt { receipt_data }) if !receipt_data.is_empty() => {
                receipt_data
            }
            _ => return Err(VerifyFailure::MissingReceiptData),
        };

        let secret = self
            .config
            .shared_secret
            .as_ref()
            .ok_or(VerifyFailure::MissingSharedSecret)?;

        let body = serde_json::json!({
            "receipt-data": receipt_data,
            "password": secret.expose_secret(),
        });

        let (mut response, mut environment) = (
            self.call(&self.config.production_url, &body).await?,
            Environment::Production,
        );

        // The first attempt always targets the production endpoint, so the
        // only wrong-environment answer it can produce is a sandbox receipt
        // (21007). One fallback, never more; 21008 stays a plain rejection.
        if status_of(&response) == Some(STATUS_SANDBOX_RECEIPT) {
            response = self.call(&self.config.sandbox_url, &body).await?;
            environment = Environment::Sandbox;
        }

        parse_verify_response(&response, environment, claim)
    }

    async fn call(&self, url: &str, body: &Value) -> Result<Value, VerifyFailure> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|err| {
                tracing::warn!(
                    target: "purser::verifier::app_store",
                    error = %err,
                    "verifyReceipt call failed"
                );
                VerifyFailure::Transport
            })?;

        response
            .json::<Value>()
            .await
            .map_err(|_| VerifyFailure::VerificationFailed)
    }
}

fn status_of(response: &Value) -> Option<i64> {
    response.get("status").and_then(Value::as_i64)
}

/// Map a verifyReceipt body to the normalized purchase shape.
fn parse_verify_response(
    response: &Value,
    environment: Environment,
    claim: &PurchaseClaim,
) -> VerifyResult {
    let status = status_of(response).ok_or(VerifyFailure::VerificationFailed)?;
    if status != 0 {
        return Err(VerifyFailure::StoreRejected { status });
    }

    let transactions = response
        .get("latest_receipt_info")
        .and_then(Value::as_array)
        .or_else(|| {
            response
                .get("receipt")
                .and_then(|r| r.get("in_app"))
                .and_then(Value::as_array)
        })
        .filter(|txs| !txs.is_empty())
        .ok_or(VerifyFailure::VerificationFailed)?;

    // Most recent transaction by purchase time wins.
    let latest = transactions
        .iter()
        .max_by_key(|tx| millis_field(tx.get("purchase_date_ms")).unwrap_or(i64::MIN))
        .ok_or(VerifyFailure::VerificationFailed)?;

    let purchase_ms =
        millis_field(latest.get("purchase_date_ms")).ok_or(VerifyFailure::VerificationFailed)?;
    let purchase_date =
        datetime_from_millis(purchase_ms).ok_or(VerifyFailure::VerificationFailed)?;

    let expires_date = millis_field(latest.get("expires_date_ms")).and_then(datetime_from_millis);

    let product_id = latest
        .get("product_id")
        .and_then(Value::as_str)
        .unwrap_or(&claim.product_id)
        .to_string();

    let transaction_id = latest
        .get("transaction_id")
        .and_then(Value::as_str)
        .map(String::from)
        .or_else(|| claim.transaction_id.clone());

    Ok(VerifiedPurchase {
        entitlement_id: product_id.clone(),
        product_id,
        transaction_id,
        store: Store::AppStore,
        purchase_date,
        expires_date,
        environment,
        // verifyReceipt reports no amounts
        amount_cents: None,
    })
}

/// Apple serializes millisecond timestamps as strings; tolerate numbers too.
fn millis_field(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

fn datetime_from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}
