//! Customer info projection.
//!
//! A projection is a derived, read-only snapshot assembled from the durable
//! subscriber, subscription, and entitlement rows. It is never persisted as
//! truth: the same rows always produce the same projection, byte for byte,
//! which is what makes the write-through cache safe.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::{Environment, SubscriberStore};
use crate::tenant::Tenant;

/// SDK-facing customer info snapshot.
///
/// Field names and the fixed `ownership_type`/`period_type` values follow the
/// wire format mobile SDK clients expect. Maps are ordered so serialization
/// is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerProjection {
    pub original_app_user_id: String,
    pub first_seen: String,
    pub last_seen: String,
    pub entitlements: BTreeMap<String, EntitlementView>,
    pub subscriptions: BTreeMap<String, SubscriptionView>,
    /// One-time purchases are not modeled; always empty on the wire.
    pub non_subscriptions: BTreeMap<String, serde_json::Value>,
    pub management_url: Option<String>,
}

/// Per-product subscription view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionView {
    pub purchase_date: String,
    pub expires_date: Option<String>,
    pub ownership_type: String,
    pub store: String,
    pub is_sandbox: bool,
    pub period_type: String,
    pub unsubscribe_detected_at: Option<String>,
    pub billing_issues_detected_at: Option<String>,
    pub environment: String,
    pub is_active: bool,
}

/// Per-identifier entitlement view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementView {
    pub product_identifier: String,
    pub expires_date: Option<String>,
    pub grace_period_expires_date: Option<String>,
    pub purchase_date: Option<String>,
    pub ownership_type: String,
    pub is_active: bool,
}

const OWNERSHIP_PURCHASED: &str = "PURCHASED";
const PERIOD_NORMAL: &str = "normal";

/// Assembles [`CustomerProjection`]s from durable rows.
pub struct Projector {
    store: Arc<dyn SubscriberStore>,
}

impl Projector {
    #[must_use]
    pub fn new(store: Arc<dyn SubscriberStore>) -> Self {
        Self { store }
    }

    /// Pure read over durable state. Includes both active and inactive rows;
    /// where a product has several rows, the most recently inserted one (the
    /// active row, when one exists) wins.
    pub async fn project(
        &self,
        tenant: &Tenant,
        app_user_id: &str,
    ) -> Result<CustomerProjection> {
        let subscriber = self.store.get_subscriber(tenant, app_user_id).await?;
        let subscriptions = self.store.list_subscriptions(tenant, app_user_id).await?;
        let entitlements = self.store.list_entitlements(tenant, app_user_id).await?;

        let (first_seen, last_seen) = match &subscriber {
            Some(s) => (format_date(s.first_seen), format_date(s.last_seen)),
            None => {
                let now = format_date(Utc::now());
                (now.clone(), now)
            }
        };

        let mut subscription_map = BTreeMap::new();
        for row in subscriptions {
            subscription_map.insert(
                row.product_id.clone(),
                SubscriptionView {
                    purchase_date: format_date(row.purchase_date),
                    expires_date: row.expires_date.map(format_date),
                    ownership_type: OWNERSHIP_PURCHASED.to_string(),
                    store: row.store.as_str().to_string(),
                    is_sandbox: row.environment == Environment::Sandbox,
                    period_type: PERIOD_NORMAL.to_string(),
                    unsubscribe_detected_at: None,
                    billing_issues_detected_at: None,
                    environment: row.environment.as_str().to_string(),
                    is_active: row.is_active,
                },
            );
        }

        let mut entitlement_map = BTreeMap::new();
        for row in entitlements {
            entitlement_map.insert(
                row.identifier.clone(),
                EntitlementView {
                    product_identifier: row.product_id.clone(),
                    expires_date: row.expires_date.map(format_date),
                    grace_period_expires_date: None,
                    purchase_date: None,
                    ownership_type: OWNERSHIP_PURCHASED.to_string(),
                    is_active: row.is_active,
                },
            );
        }

        Ok(CustomerProjection {
            original_app_user_id: app_user_id.to_string(),
            first_seen,
            last_seen,
            entitlements: entitlement_map,
            subscriptions: subscription_map,
            non_subscriptions: BTreeMap::new(),
            management_url: None,
        })
    }
}

fn format_date(date: DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use crate::store::{new_row_id, Entitlement, Store, Subscription};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn tenant() -> Tenant {
        Tenant::new("app_1", "Demo")
    }

    fn subscription(product: &str, active: bool) -> Subscription {
        let purchase = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();
        Subscription {
            id: new_row_id(),
            tenant_id: "app_1".to_string(),
            app_user_id: "user_1".to_string(),
            product_id: product.to_string(),
            store: Store::AppStore,
            transaction_id: Some("txn_1".to_string()),
            purchase_date: purchase,
            expires_date: Some(purchase + chrono::Duration::days(30)),
            environment: Environment::Production,
            is_active: active,
        }
    }

    #[tokio::test]
    async fn projects_rows_into_wire_shape() {
        let store = Arc::new(InMemoryStore::new());
        let tenant = tenant();
        store.upsert_subscriber(&tenant, "user_1").await.unwrap();
        store
            .replace_active_subscription(subscription("pro_monthly", true))
            .await
            .unwrap();
        store
            .replace_active_entitlement(Entitlement {
                id: new_row_id(),
                tenant_id: "app_1".to_string(),
                app_user_id: "user_1".to_string(),
                identifier: "pro".to_string(),
                product_id: "pro_monthly".to_string(),
                expires_date: None,
                is_active: true,
            })
            .await
            .unwrap();

        let projector = Projector::new(store);
        let projection = projector.project(&tenant, "user_1").await.unwrap();

        assert_eq!(projection.original_app_user_id, "user_1");
        let sub = &projection.subscriptions["pro_monthly"];
        assert!(sub.is_active);
        assert_eq!(sub.store, "app_store");
        assert_eq!(sub.environment, "production");
        assert!(!sub.is_sandbox);
        assert_eq!(sub.ownership_type, "PURCHASED");
        assert_eq!(sub.period_type, "normal");
        assert_eq!(sub.purchase_date, "2024-01-15T12:00:00.000Z");

        let ent = &projection.entitlements["pro"];
        assert_eq!(ent.product_identifier, "pro_monthly");
        assert!(ent.is_active);

        assert!(projection.non_subscriptions.is_empty());
        assert!(projection.management_url.is_none());
    }

    #[tokio::test]
    async fn inactive_rows_are_included() {
        let store = Arc::new(InMemoryStore::new());
        let tenant = tenant();
        store.upsert_subscriber(&tenant, "user_1").await.unwrap();
        store
            .replace_active_subscription(subscription("pro_monthly", true))
            .await
            .unwrap();
        store.deactivate_all(&tenant, "user_1").await.unwrap();

        let projector = Projector::new(store);
        let projection = projector.project(&tenant, "user_1").await.unwrap();

        // History stays visible; the consumer reads the active flag
        assert!(!projection.subscriptions["pro_monthly"].is_active);
    }

    #[tokio::test]
    async fn replacement_row_wins_over_deactivated_history() {
        let store = Arc::new(InMemoryStore::new());
        let tenant = tenant();
        store.upsert_subscriber(&tenant, "user_1").await.unwrap();
        store
            .replace_active_subscription(subscription("pro_monthly", true))
            .await
            .unwrap();
        let mut renewal = subscription("pro_monthly", true);
        renewal.purchase_date = renewal.purchase_date + chrono::Duration::days(30);
        renewal.expires_date = renewal.expires_date.map(|d| d + chrono::Duration::days(30));
        store.replace_active_subscription(renewal).await.unwrap();

        let projector = Projector::new(store);
        let projection = projector.project(&tenant, "user_1").await.unwrap();

        let sub = &projection.subscriptions["pro_monthly"];
        assert!(sub.is_active);
        assert_eq!(sub.purchase_date, "2024-02-14T12:00:00.000Z");
    }

    #[tokio::test]
    async fn projection_is_deterministic() {
        let store = Arc::new(InMemoryStore::new());
        let tenant = tenant();
        store.upsert_subscriber(&tenant, "user_1").await.unwrap();
        store
            .replace_active_subscription(subscription("pro_monthly", true))
            .await
            .unwrap();
        store
            .replace_active_subscription(subscription("addon_gold", true))
            .await
            .unwrap();

        let projector = Projector::new(store);
        let first = projector.project(&tenant, "user_1").await.unwrap();
        let second = projector.project(&tenant, "user_1").await.unwrap();

        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }
}
