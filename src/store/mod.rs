//! Durable subscriber state: entities and the storage trait.
//!
//! Implement [`SubscriberStore`] to persist state to your database. The
//! bundled [`memory::InMemoryStore`] is suitable for tests and single-node
//! deployments; relational implementations should back the `replace_active_*`
//! operations with a transaction so the deactivate-then-insert pair stays
//! atomic.

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::tenant::Tenant;

/// Purchase store of origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Store {
    /// Apple App Store (receipt-blob verification).
    AppStore,
    /// Google Play Store (purchase-token verification).
    PlayStore,
}

impl Store {
    /// Parse from the wire string, defaulting to the App Store for unknown
    /// values.
    #[must_use]
    pub fn from_wire(s: &str) -> Self {
        match s {
            "play_store" => Self::PlayStore,
            _ => Self::AppStore,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AppStore => "app_store",
            Self::PlayStore => "play_store",
        }
    }
}

impl std::fmt::Display for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Store environment the purchase was made in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Production,
    Sandbox,
}

impl Environment {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Sandbox => "sandbox",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A subscriber identity, created lazily on first reference and never
/// hard-deleted. Identity merges reparent purchase rows instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    /// Row id.
    pub id: String,
    pub tenant_id: String,
    /// Opaque application-chosen user id.
    pub app_user_id: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Free-form attributes, merged on every attributes call.
    pub attributes: HashMap<String, String>,
}

/// One subscription row per (subscriber, product, validity window).
///
/// Rows are write-once: later purchases for the same product deactivate the
/// prior row and insert a fresh one. At most one row per
/// (subscriber, product) has `is_active == true` at any time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub tenant_id: String,
    pub app_user_id: String,
    pub product_id: String,
    pub store: Store,
    pub transaction_id: Option<String>,
    pub purchase_date: DateTime<Utc>,
    /// `None` means non-expiring.
    pub expires_date: Option<DateTime<Utc>>,
    pub environment: Environment,
    pub is_active: bool,
}

/// One entitlement row per (subscriber, identifier, validity window), with
/// the same at-most-one-active invariant keyed on (subscriber, identifier).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub id: String,
    pub tenant_id: String,
    pub app_user_id: String,
    pub identifier: String,
    /// Product backing this entitlement.
    pub product_id: String,
    pub expires_date: Option<DateTime<Utc>>,
    pub is_active: bool,
}

/// Audit row for a receipt submission, written for failures as well as
/// successes so every attempt is attributable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptRecord {
    pub id: String,
    pub tenant_id: String,
    pub app_user_id: String,
    pub product_id: String,
    pub store: Store,
    pub transaction_id: Option<String>,
    pub purchase_date: Option<DateTime<Utc>>,
    /// Raw claim as submitted, for debugging.
    pub raw_json: Option<serde_json::Value>,
    /// "validated" or a failure reason.
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Immutable append-only audit event. Never updated or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub tenant_id: String,
    /// e.g. "receipt_validated", "webhook_renewal".
    pub event_type: String,
    pub app_user_id: Option<String>,
    pub product_id: Option<String>,
    pub amount_cents: Option<i64>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Raw webhook delivery record, written before any interpretation. Unknown
/// event types are recorded too; the system favors over-recording audit data
/// over dropping events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookRecord {
    pub id: String,
    pub tenant_id: String,
    pub event_type: String,
    pub received_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Generate a fresh row id.
#[must_use]
pub fn new_row_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Storage trait for subscriber state.
///
/// All operations are scoped by tenant. The store is the sole source of
/// truth; the projection cache is never consulted for correctness-sensitive
/// decisions.
#[async_trait]
pub trait SubscriberStore: Send + Sync {
    // Subscriber identity

    /// Create the subscriber if absent, else bump `last_seen`. Returns the
    /// row after the write.
    async fn upsert_subscriber(&self, tenant: &Tenant, app_user_id: &str) -> Result<Subscriber>;

    /// Fetch a subscriber without creating it.
    async fn get_subscriber(
        &self,
        tenant: &Tenant,
        app_user_id: &str,
    ) -> Result<Option<Subscriber>>;

    /// Merge attributes into an existing subscriber and bump `last_seen`.
    async fn merge_attributes(
        &self,
        tenant: &Tenant,
        app_user_id: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<()>;

    // Purchase state

    /// Deactivate the current active subscription for
    /// (subscriber, product) if any, then insert `subscription`, as one
    /// atomic operation. No other writer for the same subscriber+product may
    /// observe the intermediate state.
    async fn replace_active_subscription(&self, subscription: Subscription) -> Result<()>;

    /// Same contract as [`replace_active_subscription`], keyed on
    /// (subscriber, entitlement identifier).
    ///
    /// [`replace_active_subscription`]: SubscriberStore::replace_active_subscription
    async fn replace_active_entitlement(&self, entitlement: Entitlement) -> Result<()>;

    /// Deactivate every active subscription and entitlement for the
    /// subscriber. Returns the number of rows flipped. Used for terminal
    /// store events (cancellation, expiration).
    async fn deactivate_all(&self, tenant: &Tenant, app_user_id: &str) -> Result<u64>;

    /// Bulk-move all subscription and entitlement rows from one subscriber
    /// id to another. Returns the number of rows moved.
    async fn reparent_subscriber(
        &self,
        tenant: &Tenant,
        old_app_user_id: &str,
        new_app_user_id: &str,
    ) -> Result<u64>;

    /// All subscription rows (active and inactive) for a subscriber.
    async fn list_subscriptions(
        &self,
        tenant: &Tenant,
        app_user_id: &str,
    ) -> Result<Vec<Subscription>>;

    /// All entitlement rows (active and inactive) for a subscriber.
    async fn list_entitlements(
        &self,
        tenant: &Tenant,
        app_user_id: &str,
    ) -> Result<Vec<Entitlement>>;

    // Audit trail

    /// Append a receipt audit row.
    async fn record_receipt(&self, receipt: ReceiptRecord) -> Result<()>;

    /// Append an audit event.
    async fn record_event(&self, event: Event) -> Result<()>;

    /// Append a raw webhook delivery record.
    async fn record_webhook(&self, record: WebhookRecord) -> Result<()>;

    /// Audit events for a tenant, oldest first.
    async fn list_events(&self, tenant: &Tenant) -> Result<Vec<Event>>;

    /// Receipt audit rows for a tenant, oldest first.
    async fn list_receipts(&self, tenant: &Tenant) -> Result<Vec<ReceiptRecord>>;
}
