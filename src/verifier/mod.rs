//! Purchase verification against the platform stores.
//!
//! The verifier is a pure normalizer: it calls the two external verification
//! authorities (receipt-based for the App Store, token-based for the Play
//! Store) and maps their divergent responses into one [`VerifiedPurchase`]
//! shape or a tagged [`VerifyFailure`]. It never touches durable state.

pub mod app_store;
pub mod play_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{AppStoreConfig, PlayStoreConfig};
use crate::store::{Environment, Store};
use crate::tenant::Tenant;

pub use app_store::AppStoreVerifier;
pub use play_store::PlayStoreVerifier;

/// Store-specific proof of purchase. One variant per store, each carrying
/// exactly the fields that store's verification endpoint needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PurchaseProof {
    /// Base64 receipt blob for the App Store verifyReceipt endpoint.
    AppStoreReceipt { receipt_data: String },
    /// Purchase token plus package name for the Play Store subscriptions
    /// endpoint.
    PlayStoreToken {
        purchase_token: String,
        package_name: String,
    },
}

/// A purchase claim as submitted by a client, before verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseClaim {
    pub store: Store,
    pub product_id: String,
    pub transaction_id: Option<String>,
    /// Absent proof is a distinct failure reason, not a parse error.
    pub proof: Option<PurchaseProof>,
}

/// Normalized result of a successful verification, regardless of origin
/// store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedPurchase {
    pub product_id: String,
    /// Entitlement unlocked by this purchase. Defaults to the product id
    /// when the store response does not name one.
    pub entitlement_id: String,
    pub transaction_id: Option<String>,
    pub store: Store,
    pub purchase_date: DateTime<Utc>,
    pub expires_date: Option<DateTime<Utc>>,
    pub environment: Environment,
    /// Purchase amount when the store reports one (the Play Store does, the
    /// App Store does not).
    pub amount_cents: Option<i64>,
}

/// Why a verification did not produce a [`VerifiedPurchase`].
///
/// Configuration problems (missing credentials, unusable keys) are kept
/// distinct from rejected proofs so callers can answer 5xx vs 4xx, and every
/// reason has a stable string used as the receipt audit row status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyFailure {
    /// No shared secret configured for the App Store.
    MissingSharedSecret,
    /// The claim carried no receipt blob.
    MissingReceiptData,
    /// No service-account credentials configured for the Play Store.
    MissingCredentials,
    /// The service-account credentials JSON could not be parsed.
    InvalidCredentials,
    /// Signing the service-account assertion failed.
    SigningFailed,
    /// The bearer-token exchange was rejected.
    TokenExchangeFailed,
    /// The claim carried no purchase token.
    MissingPurchaseToken,
    /// The store rejected the proof with the given status code.
    StoreRejected { status: i64 },
    /// The verification endpoint was unreachable or timed out.
    Transport,
    /// The store response was malformed or missing required fields.
    VerificationFailed,
}

impl VerifyFailure {
    /// Stable string persisted as the receipt audit row status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingSharedSecret => "missing_shared_secret",
            Self::MissingReceiptData => "missing_receipt_data",
            Self::MissingCredentials => "missing_credentials",
            Self::InvalidCredentials => "invalid_credentials",
            Self::SigningFailed => "signing_failed",
            Self::TokenExchangeFailed => "token_exchange_failed",
            Self::MissingPurchaseToken => "missing_purchase_token",
            Self::StoreRejected { .. } => "store_rejected",
            Self::Transport => "transport_error",
            Self::VerificationFailed => "verification_failed",
        }
    }

    /// True when the failure is a server misconfiguration rather than a
    /// client-attributable rejection.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::MissingSharedSecret
                | Self::MissingCredentials
                | Self::InvalidCredentials
                | Self::SigningFailed
        )
    }
}

impl std::fmt::Display for VerifyFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StoreRejected { status } => write!(f, "store_rejected (status {status})"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// Result of a verification attempt. Failures are data, not panics: the
/// reconciler records them as receipt audit rows.
pub type VerifyResult = std::result::Result<VerifiedPurchase, VerifyFailure>;

/// Verifies purchase claims against their store of origin.
#[async_trait]
pub trait ReceiptVerifier: Send + Sync {
    async fn verify(&self, tenant: &Tenant, claim: &PurchaseClaim) -> VerifyResult;
}

/// Dispatches claims to the store-specific verifier.
pub struct StoreVerifier {
    app_store: AppStoreVerifier,
    play_store: PlayStoreVerifier,
}

impl StoreVerifier {
    #[must_use]
    pub fn new(app_store: AppStoreConfig, play_store: PlayStoreConfig) -> Self {
        Self {
            app_store: AppStoreVerifier::new(app_store),
            play_store: PlayStoreVerifier::new(play_store),
        }
    }
}

#[async_trait]
impl ReceiptVerifier for StoreVerifier {
    async fn verify(&self, tenant: &Tenant, claim: &PurchaseClaim) -> VerifyResult {
        let outcome = match claim.store {
            Store::AppStore => self.app_store.verify(claim).await,
            Store::PlayStore => self.play_store.verify(claim).await,
        };

        match &outcome {
            Ok(purchase) => tracing::info!(
                target: "purser::verifier",
                tenant = %tenant.id,
                store = %claim.store,
                product = %purchase.product_id,
                environment = %purchase.environment,
                "purchase verified"
            ),
            Err(reason) => tracing::warn!(
                target: "purser::verifier",
                tenant = %tenant.id,
                store = %claim.store,
                product = %claim.product_id,
                reason = %reason,
                "purchase verification failed"
            ),
        }

        outcome
    }
}

/// Mock verifier for tests.
pub mod test {
    use super::*;
    use std::collections::HashMap;
    use std::sync::RwLock;

    /// Programmable verifier: map product ids to outcomes, with a default
    /// behavior for everything else.
    pub struct MockVerifier {
        outcomes: RwLock<HashMap<String, VerifyResult>>,
        /// `None` means unpinned claims verify successfully.
        default_failure: Option<VerifyFailure>,
    }

    impl MockVerifier {
        /// Mock that verifies every claim as a 30-day sandbox purchase.
        #[must_use]
        pub fn accepting() -> Self {
            Self {
                outcomes: RwLock::new(HashMap::new()),
                default_failure: None,
            }
        }

        /// Mock that fails every claim with the given reason.
        #[must_use]
        pub fn rejecting(reason: VerifyFailure) -> Self {
            Self {
                outcomes: RwLock::new(HashMap::new()),
                default_failure: Some(reason),
            }
        }

        /// Pin the outcome for a specific product id.
        pub fn set_outcome(&self, product_id: impl Into<String>, outcome: VerifyResult) {
            self.outcomes
                .write()
                .unwrap()
                .insert(product_id.into(), outcome);
        }

        fn default_success(claim: &PurchaseClaim) -> VerifiedPurchase {
            let now = Utc::now();
            VerifiedPurchase {
                product_id: claim.product_id.clone(),
                entitlement_id: claim.product_id.clone(),
                transaction_id: claim.transaction_id.clone(),
                store: claim.store,
                purchase_date: now,
                expires_date: Some(now + chrono::Duration::days(30)),
                environment: Environment::Sandbox,
                amount_cents: None,
            }
        }
    }

    #[async_trait]
    impl ReceiptVerifier for MockVerifier {
        async fn verify(&self, _tenant: &Tenant, claim: &PurchaseClaim) -> VerifyResult {
            if let Some(outcome) = self.outcomes.read().unwrap().get(&claim.product_id) {
                return outcome.clone();
            }
            match &self.default_failure {
                Some(reason) => Err(reason.clone()),
                None => Ok(Self::default_success(claim)),
            }
        }
    }
}
