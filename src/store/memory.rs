//! In-memory subscriber store.
//!
//! Suitable for tests and single-node deployments. Wraps data in `Arc` for
//! cheap cloning. The `replace_active_*` operations hold a single write lock
//! for the deactivate-then-insert pair, which is what makes them atomic here;
//! relational implementations should use a transaction instead.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::Result;
use crate::tenant::Tenant;

use super::{
    new_row_id, Entitlement, Event, ReceiptRecord, Subscriber, SubscriberStore, Subscription,
    WebhookRecord,
};

/// In-memory [`SubscriberStore`] backend.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    /// Keyed by (tenant_id, app_user_id).
    subscribers: RwLock<HashMap<(String, String), Subscriber>>,
    subscriptions: RwLock<Vec<Subscription>>,
    entitlements: RwLock<Vec<Entitlement>>,
    receipts: RwLock<Vec<ReceiptRecord>>,
    events: RwLock<Vec<Event>>,
    webhooks: RwLock<Vec<WebhookRecord>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All webhook delivery records for a tenant (for tests and inspection).
    pub fn webhook_records(&self, tenant: &Tenant) -> Vec<WebhookRecord> {
        self.inner
            .webhooks
            .read()
            .unwrap()
            .iter()
            .filter(|w| w.tenant_id == tenant.id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SubscriberStore for InMemoryStore {
    async fn upsert_subscriber(&self, tenant: &Tenant, app_user_id: &str) -> Result<Subscriber> {
        let mut subscribers = self.inner.subscribers.write().unwrap();
        let now = Utc::now();
        let key = (tenant.id.clone(), app_user_id.to_string());

        let subscriber = subscribers
            .entry(key)
            .and_modify(|s| s.last_seen = now)
            .or_insert_with(|| Subscriber {
                id: new_row_id(),
                tenant_id: tenant.id.clone(),
                app_user_id: app_user_id.to_string(),
                first_seen: now,
                last_seen: now,
                attributes: HashMap::new(),
            });

        Ok(subscriber.clone())
    }

    async fn get_subscriber(
        &self,
        tenant: &Tenant,
        app_user_id: &str,
    ) -> Result<Option<Subscriber>> {
        Ok(self
            .inner
            .subscribers
            .read()
            .unwrap()
            .get(&(tenant.id.clone(), app_user_id.to_string()))
            .cloned())
    }

    async fn merge_attributes(
        &self,
        tenant: &Tenant,
        app_user_id: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<()> {
        let mut subscribers = self.inner.subscribers.write().unwrap();
        let now = Utc::now();
        let key = (tenant.id.clone(), app_user_id.to_string());

        let subscriber = subscribers.entry(key).or_insert_with(|| Subscriber {
            id: new_row_id(),
            tenant_id: tenant.id.clone(),
            app_user_id: app_user_id.to_string(),
            first_seen: now,
            last_seen: now,
            attributes: HashMap::new(),
        });

        subscriber.last_seen = now;
        subscriber
            .attributes
            .extend(attributes.iter().map(|(k, v)| (k.clone(), v.clone())));

        Ok(())
    }

    async fn replace_active_subscription(&self, subscription: Subscription) -> Result<()> {
        let mut rows = self.inner.subscriptions.write().unwrap();

        // Deactivate-then-insert under one write lock.
        for row in rows.iter_mut() {
            if row.tenant_id == subscription.tenant_id
                && row.app_user_id == subscription.app_user_id
                && row.product_id == subscription.product_id
                && row.is_active
            {
                row.is_active = false;
            }
        }
        rows.push(subscription);

        Ok(())
    }

    async fn replace_active_entitlement(&self, entitlement: Entitlement) -> Result<()> {
        let mut rows = self.inner.entitlements.write().unwrap();

        for row in rows.iter_mut() {
            if row.tenant_id == entitlement.tenant_id
                && row.app_user_id == entitlement.app_user_id
                && row.identifier == entitlement.identifier
                && row.is_active
            {
                row.is_active = false;
            }
        }
        rows.push(entitlement);

        Ok(())
    }

    async fn deactivate_all(&self, tenant: &Tenant, app_user_id: &str) -> Result<u64> {
        let mut flipped = 0u64;

        let mut subscriptions = self.inner.subscriptions.write().unwrap();
        for row in subscriptions.iter_mut() {
            if row.tenant_id == tenant.id && row.app_user_id == app_user_id && row.is_active {
                row.is_active = false;
                flipped += 1;
            }
        }
        drop(subscriptions);

        let mut entitlements = self.inner.entitlements.write().unwrap();
        for row in entitlements.iter_mut() {
            if row.tenant_id == tenant.id && row.app_user_id == app_user_id && row.is_active {
                row.is_active = false;
                flipped += 1;
            }
        }

        Ok(flipped)
    }

    async fn reparent_subscriber(
        &self,
        tenant: &Tenant,
        old_app_user_id: &str,
        new_app_user_id: &str,
    ) -> Result<u64> {
        let mut moved = 0u64;

        let mut subscriptions = self.inner.subscriptions.write().unwrap();
        for row in subscriptions.iter_mut() {
            if row.tenant_id == tenant.id && row.app_user_id == old_app_user_id {
                row.app_user_id = new_app_user_id.to_string();
                moved += 1;
            }
        }
        drop(subscriptions);

        let mut entitlements = self.inner.entitlements.write().unwrap();
        for row in entitlements.iter_mut() {
            if row.tenant_id == tenant.id && row.app_user_id == old_app_user_id {
                row.app_user_id = new_app_user_id.to_string();
                moved += 1;
            }
        }

        Ok(moved)
    }

    async fn list_subscriptions(
        &self,
        tenant: &Tenant,
        app_user_id: &str,
    ) -> Result<Vec<Subscription>> {
        Ok(self
            .inner
            .subscriptions
            .read()
            .unwrap()
            .iter()
            .filter(|s| s.tenant_id == tenant.id && s.app_user_id == app_user_id)
            .cloned()
            .collect())
    }

    async fn list_entitlements(
        &self,
        tenant: &Tenant,
        app_user_id: &str,
    ) -> Result<Vec<Entitlement>> {
        Ok(self
            .inner
            .entitlements
            .read()
            .unwrap()
            .iter()
            .filter(|e| e.tenant_id == tenant.id && e.app_user_id == app_user_id)
            .cloned()
            .collect())
    }

    async fn record_receipt(&self, receipt: ReceiptRecord) -> Result<()> {
        self.inner.receipts.write().unwrap().push(receipt);
        Ok(())
    }

    async fn record_event(&self, event: Event) -> Result<()> {
        self.inner.events.write().unwrap().push(event);
        Ok(())
    }

    async fn record_webhook(&self, record: WebhookRecord) -> Result<()> {
        self.inner.webhooks.write().unwrap().push(record);
        Ok(())
    }

    async fn list_events(&self, tenant: &Tenant) -> Result<Vec<Event>> {
        Ok(self
            .inner
            .events
            .read()
            .unwrap()
            .iter()
            .filter(|e| e.tenant_id == tenant.id)
            .cloned()
            .collect())
    }

    async fn list_receipts(&self, tenant: &Tenant) -> Result<Vec<ReceiptRecord>> {
        Ok(self
            .inner
            .receipts
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.tenant_id == tenant.id)
            .cloned()
            .collect())
    }
}
