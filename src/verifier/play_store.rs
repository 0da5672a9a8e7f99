//! Play Store purchase-token verification.
//!
//! Two-step flow: mint a service-account assertion, exchange it for a bearer
//! token, then look the purchase token up on the Android Publisher
//! subscriptions endpoint. Each step maps to its own [`VerifyFailure`] so a
//! key problem never masquerades as a bad purchase.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::PlayStoreConfig;
use crate::store::{Environment, Store};

use super::{PurchaseClaim, PurchaseProof, VerifiedPurchase, VerifyFailure, VerifyResult};

const OAUTH_SCOPE: &str = "https://www.googleapis.com/auth/androidpublisher";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// The subset of a Google service-account key file we need.
#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    token_uri: String,
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

pub struct PlayStoreVerifier {
    client: reqwest::Client,
    config: PlayStoreConfig,
}

impl PlayStoreVerifier {
    #[must_use]
    pub fn new(config: PlayStoreConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .unwrap_or_default();

        Self { client, config }
    }

    pub async fn verify(&self, claim: &PurchaseClaim) -> VerifyResult {
        let (purchase_token, package_name) = match &claim.proof {
            Some(PurchaseProof::PlayStoreToken {
                purchase_token,
                package_name,
            }) if !purchase_token.is_empty() => (purchase_token, package_name),
            _ => return Err(VerifyFailure::MissingPurchaseToken),
        };

        let key = self.service_account_key()?;
        let assertion = sign_assertion(&key, Utc::now())?;
        let access_token = self.exchange_assertion(&key.token_uri, &assertion).await?;

        let subscription = self
            .fetch_subscription(&access_token, package_name, &claim.product_id, purchase_token)
            .await?;

        parse_subscription(&subscription, claim)
    }

    fn service_account_key(&self) -> Result<ServiceAccountKey, VerifyFailure> {
        let json = self
            .config
            .service_account_json
            .as_ref()
            .ok_or(VerifyFailure::MissingCredentials)?;

        serde_json::from_str(json.expose_secret()).map_err(|_| VerifyFailure::InvalidCredentials)
    }

    async fn exchange_assertion(
        &self,
        token_uri: &str,
        assertion: &str,
    ) -> Result<String, VerifyFailure> {
        let response = self
            .client
            .post(token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion)])
            .send()
            .await
            .map_err(|err| {
                tracing::warn!(
                    target: "purser::verifier::play_store",
                    error = %err,
                    "token exchange unreachable"
                );
                VerifyFailure::Transport
            })?;

        if !response.status().is_success() {
            tracing::warn!(
                target: "purser::verifier::play_store",
                status = %response.status(),
                "token exchange rejected"
            );
            return Err(VerifyFailure::TokenExchangeFailed);
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|_| VerifyFailure::TokenExchangeFailed)?;

        Ok(token.access_token)
    }

    async fn fetch_subscription(
        &self,
        access_token: &str,
        package_name: &str,
        product_id: &str,
        purchase_token: &str,
    ) -> Result<Value, VerifyFailure> {
        let url = format!(
            "{}/applications/{package_name}/purchases/subscriptions/{product_id}/tokens/{purchase_token}",
            self.config.api_base_url
        );

        let response = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|err| {
                tracing::warn!(
                    target: "purser::verifier::play_store",
                    error = %err,
                    "subscription lookup unreachable"
                );
                VerifyFailure::Transport
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(VerifyFailure::StoreRejected {
                status: i64::from(status.as_u16()),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|_| VerifyFailure::VerificationFailed)
    }
}

/// Sign the OAuth assertion for the androidpublisher scope.
fn sign_assertion(key: &ServiceAccountKey, now: DateTime<Utc>) -> Result<String, VerifyFailure> {
    let encoding_key =
        EncodingKey::from_rsa_pem(key.private_key.as_bytes()).map_err(|_| {
            tracing::error!(
                target: "purser::verifier::play_store",
                "service-account private key is not a usable RSA PEM"
            );
            VerifyFailure::SigningFailed
        })?;

    let issued_at = now.timestamp();
    let claims = AssertionClaims {
        iss: &key.client_email,
        scope: OAUTH_SCOPE,
        aud: &key.token_uri,
        iat: issued_at,
        exp: issued_at + ASSERTION_LIFETIME_SECS,
    };

    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &encoding_key)
        .map_err(|_| VerifyFailure::SigningFailed)
}

/// Map an Android Publisher subscription resource to the normalized purchase
/// shape. Google serializes millisecond timestamps and micro amounts as
/// strings.
fn parse_subscription(resource: &Value, claim: &PurchaseClaim) -> VerifyResult {
    let start_ms = string_i64(resource.get("startTimeMillis"))
        .ok_or(VerifyFailure::VerificationFailed)?;
    let purchase_date =
        datetime_from_millis(start_ms).ok_or(VerifyFailure::VerificationFailed)?;

    let expires_date = string_i64(resource.get("expiryTimeMillis")).and_then(datetime_from_millis);

    let transaction_id = resource
        .get("orderId")
        .and_then(Value::as_str)
        .map(String::from)
        .or_else(|| claim.transaction_id.clone());

    // purchaseType is only present for non-production purchases; 0 = test.
    let environment = match resource.get("purchaseType").and_then(Value::as_i64) {
        Some(0) => Environment::Sandbox,
        _ => Environment::Production,
    };

    let amount_cents = string_i64(resource.get("priceAmountMicros")).map(|micros| micros / 10_000);

    Ok(VerifiedPurchase {
        product_id: claim.product_id.clone(),
        entitlement_id: claim.product_id.clone(),
        transaction_id,
        store: Store::PlayStore,
        purchase_date,
        expires_date,
        environment,
        amount_cents,
    })
}

fn string_i64(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

fn datetime_from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}
