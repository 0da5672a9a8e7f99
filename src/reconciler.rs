//! State reconciliation.
//!
//! The reconciler owns every durable mutation triggered by a purchase,
//! webhook, or identity merge. Writers for the same (tenant, subscriber) are
//! serialized through a keyed async mutex so the deactivate-then-insert pair
//! can never interleave with another writer for the same subscriber, even
//! when a receipt and a webhook arrive together.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::json;

use crate::cache::ProjectionCache;
use crate::error::{EngineError, Result};
use crate::projection::{CustomerProjection, Projector};
use crate::store::{
    new_row_id, Entitlement, Event, ReceiptRecord, SubscriberStore, Subscription,
};
use crate::tenant::Tenant;
use crate::verifier::{PurchaseClaim, VerifiedPurchase, VerifyResult};

const STATUS_VALIDATED: &str = "validated";
const EVENT_RECEIPT_VALIDATED: &str = "receipt_validated";

/// Result of an identity merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyOutcome {
    /// True when the new identity did not exist before the merge.
    pub created: bool,
    pub projection: CustomerProjection,
}

pub struct Reconciler {
    store: Arc<dyn SubscriberStore>,
    projector: Arc<Projector>,
    cache: Arc<ProjectionCache>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Holds the write lock for one (tenant, subscriber) key.
struct SubscriberGuard<'a> {
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
    locks: &'a Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    key: String,
}

impl Drop for SubscriberGuard<'_> {
    fn drop(&mut self) {
        // Release the mutex (and its Arc) before counting holders.
        self.guard.take();

        let mut locks = self.locks.lock().expect("reconciler lock map poisoned");
        if let Some(entry) = locks.get(&self.key) {
            // Waiters cloned the Arc under the map mutex, so a count of one
            // means the map holds the only reference left.
            if Arc::strong_count(entry) == 1 {
                locks.remove(&self.key);
            }
        }
    }
}

impl Reconciler {
    #[must_use]
    pub fn new(
        store: Arc<dyn SubscriberStore>,
        projector: Arc<Projector>,
        cache: Arc<ProjectionCache>,
    ) -> Self {
        Self {
            store,
            projector,
            cache,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Serialization point for writers against one (tenant, subscriber).
    ///
    /// The returned guard prunes the map entry on drop once no other writer
    /// holds or awaits the same key, so the map tracks in-flight subscribers
    /// only, not every subscriber that ever wrote.
    async fn lock_subscriber(&self, tenant: &Tenant, app_user_id: &str) -> SubscriberGuard<'_> {
        let key = format!("{}:{}", tenant.id, app_user_id);
        let lock = self
            .locks
            .lock()
            .expect("reconciler lock map poisoned")
            .entry(key.clone())
            .or_default()
            .clone();
        let guard = lock.lock_owned().await;

        SubscriberGuard {
            guard: Some(guard),
            locks: &self.locks,
            key,
        }
    }

    /// Apply a verification outcome for a submitted claim.
    ///
    /// The subscriber is upserted and a receipt audit row written whether
    /// verification succeeded or not, so every attempt stays attributable.
    /// Failures mutate nothing else and surface as [`EngineError::ReceiptRejected`].
    pub async fn reconcile(
        &self,
        tenant: &Tenant,
        app_user_id: &str,
        claim: &PurchaseClaim,
        outcome: VerifyResult,
    ) -> Result<CustomerProjection> {
        let _guard = self.lock_subscriber(tenant, app_user_id).await;

        self.store.upsert_subscriber(tenant, app_user_id).await?;

        let raw_json = serde_json::to_value(claim).ok();

        match outcome {
            Err(reason) => {
                self.store
                    .record_receipt(ReceiptRecord {
                        id: new_row_id(),
                        tenant_id: tenant.id.clone(),
                        app_user_id: app_user_id.to_string(),
                        product_id: claim.product_id.clone(),
                        store: claim.store,
                        transaction_id: claim.transaction_id.clone(),
                        purchase_date: None,
                        raw_json,
                        status: reason.as_str().to_string(),
                        created_at: Utc::now(),
                    })
                    .await?;

                tracing::warn!(
                    target: "purser::reconciler",
                    tenant = %tenant.id,
                    app_user_id,
                    product = %claim.product_id,
                    reason = %reason,
                    "receipt rejected"
                );
                Err(EngineError::ReceiptRejected(reason))
            }
            Ok(purchase) => {
                self.store
                    .record_receipt(ReceiptRecord {
                        id: new_row_id(),
                        tenant_id: tenant.id.clone(),
                        app_user_id: app_user_id.to_string(),
                        product_id: purchase.product_id.clone(),
                        store: purchase.store,
                        transaction_id: purchase.transaction_id.clone(),
                        purchase_date: Some(purchase.purchase_date),
                        raw_json,
                        status: STATUS_VALIDATED.to_string(),
                        created_at: Utc::now(),
                    })
                    .await?;

                self.install_purchase(tenant, app_user_id, &purchase).await?;

                self.store
                    .record_event(Event {
                        id: new_row_id(),
                        tenant_id: tenant.id.clone(),
                        event_type: EVENT_RECEIPT_VALIDATED.to_string(),
                        app_user_id: Some(app_user_id.to_string()),
                        product_id: Some(purchase.product_id.clone()),
                        amount_cents: purchase.amount_cents,
                        payload: json!({
                            "store": purchase.store.as_str(),
                            "environment": purchase.environment.as_str(),
                            "transaction_id": purchase.transaction_id,
                        }),
                        created_at: Utc::now(),
                    })
                    .await?;

                tracing::info!(
                    target: "purser::reconciler",
                    tenant = %tenant.id,
                    app_user_id,
                    product = %purchase.product_id,
                    "receipt reconciled"
                );
                self.refresh_projection(tenant, app_user_id).await
            }
        }
    }

    /// Install a pre-verified purchase, e.g. from a store webhook. Same
    /// mutation path as a validated receipt minus the receipt audit row.
    pub async fn apply_trusted(
        &self,
        tenant: &Tenant,
        app_user_id: &str,
        purchase: &VerifiedPurchase,
        event_type: &str,
    ) -> Result<CustomerProjection> {
        let _guard = self.lock_subscriber(tenant, app_user_id).await;

        self.store.upsert_subscriber(tenant, app_user_id).await?;
        self.install_purchase(tenant, app_user_id, purchase).await?;

        self.store
            .record_event(Event {
                id: new_row_id(),
                tenant_id: tenant.id.clone(),
                event_type: event_type.to_string(),
                app_user_id: Some(app_user_id.to_string()),
                product_id: Some(purchase.product_id.clone()),
                amount_cents: purchase.amount_cents,
                payload: json!({
                    "store": purchase.store.as_str(),
                    "expires_date": purchase.expires_date,
                }),
                created_at: Utc::now(),
            })
            .await?;

        self.refresh_projection(tenant, app_user_id).await
    }

    /// End the subscriber's relationship broadly: deactivate every active
    /// subscription and entitlement, regardless of product.
    pub async fn deactivate_subscriber(
        &self,
        tenant: &Tenant,
        app_user_id: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<CustomerProjection> {
        let _guard = self.lock_subscriber(tenant, app_user_id).await;

        self.store.upsert_subscriber(tenant, app_user_id).await?;
        let flipped = self.store.deactivate_all(tenant, app_user_id).await?;

        self.store
            .record_event(Event {
                id: new_row_id(),
                tenant_id: tenant.id.clone(),
                event_type: event_type.to_string(),
                app_user_id: Some(app_user_id.to_string()),
                product_id: None,
                amount_cents: None,
                payload,
                created_at: Utc::now(),
            })
            .await?;

        tracing::info!(
            target: "purser::reconciler",
            tenant = %tenant.id,
            app_user_id,
            rows = flipped,
            event_type,
            "deactivated subscriber state"
        );
        self.refresh_projection(tenant, app_user_id).await
    }

    /// Merge an old identity into a new one by reparenting purchase rows,
    /// then re-cache under the new id and drop the old entry.
    ///
    /// A reconciliation running concurrently against the old id is an
    /// accepted race: its writes land on the old id and surface on the next
    /// merge or read, rather than being blocked here.
    pub async fn identify(
        &self,
        tenant: &Tenant,
        old_app_user_id: &str,
        new_app_user_id: &str,
    ) -> Result<IdentifyOutcome> {
        let _guard = self.lock_subscriber(tenant, new_app_user_id).await;

        let created = self
            .store
            .get_subscriber(tenant, new_app_user_id)
            .await?
            .is_none();
        self.store.upsert_subscriber(tenant, new_app_user_id).await?;

        if old_app_user_id != new_app_user_id {
            let moved = self
                .store
                .reparent_subscriber(tenant, old_app_user_id, new_app_user_id)
                .await?;
            self.cache.forget(tenant, old_app_user_id).await;

            tracing::info!(
                target: "purser::reconciler",
                tenant = %tenant.id,
                old = old_app_user_id,
                new = new_app_user_id,
                rows = moved,
                "identity merged"
            );
        }

        let projection = self.refresh_projection(tenant, new_app_user_id).await?;
        Ok(IdentifyOutcome {
            created,
            projection,
        })
    }

    /// Deactivate-then-insert for both the subscription and its entitlement.
    /// Callers must hold the subscriber lock.
    async fn install_purchase(
        &self,
        tenant: &Tenant,
        app_user_id: &str,
        purchase: &VerifiedPurchase,
    ) -> Result<()> {
        self.store
            .replace_active_subscription(Subscription {
                id: new_row_id(),
                tenant_id: tenant.id.clone(),
                app_user_id: app_user_id.to_string(),
                product_id: purchase.product_id.clone(),
                store: purchase.store,
                transaction_id: purchase.transaction_id.clone(),
                purchase_date: purchase.purchase_date,
                expires_date: purchase.expires_date,
                environment: purchase.environment,
                is_active: true,
            })
            .await?;

        self.store
            .replace_active_entitlement(Entitlement {
                id: new_row_id(),
                tenant_id: tenant.id.clone(),
                app_user_id: app_user_id.to_string(),
                identifier: purchase.entitlement_id.clone(),
                product_id: purchase.product_id.clone(),
                expires_date: purchase.expires_date,
                is_active: true,
            })
            .await?;

        Ok(())
    }

    /// Recompute the projection from durable state and write it through.
    async fn refresh_projection(
        &self,
        tenant: &Tenant,
        app_user_id: &str,
    ) -> Result<CustomerProjection> {
        let projection = self.projector.project(tenant, app_user_id).await?;
        self.cache.put(tenant, app_user_id, &projection).await;
        Ok(projection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::config::CacheConfig;
    use crate::store::memory::InMemoryStore;
    use crate::store::{Environment, Store};
    use crate::verifier::{PurchaseProof, VerifyFailure};

    struct Fixture {
        store: Arc<InMemoryStore>,
        cache: Arc<ProjectionCache>,
        reconciler: Arc<Reconciler>,
        tenant: Tenant,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(ProjectionCache::new(Arc::new(InMemoryCache::new(
            &CacheConfig::default(),
        ))));
        let projector = Arc::new(Projector::new(store.clone()));
        let reconciler = Arc::new(Reconciler::new(store.clone(), projector, cache.clone()));
        Fixture {
            store,
            cache,
            reconciler,
            tenant: Tenant::new("app_1", "Demo"),
        }
    }

    fn claim(product: &str) -> PurchaseClaim {
        PurchaseClaim {
            store: Store::AppStore,
            product_id: product.to_string(),
            transaction_id: Some("txn_1".to_string()),
            proof: Some(PurchaseProof::AppStoreReceipt {
                receipt_data: "blob".to_string(),
            }),
        }
    }

    fn purchase(product: &str) -> VerifiedPurchase {
        let now = Utc::now();
        VerifiedPurchase {
            product_id: product.to_string(),
            entitlement_id: product.to_string(),
            transaction_id: Some("txn_1".to_string()),
            store: Store::AppStore,
            purchase_date: now,
            expires_date: Some(now + chrono::Duration::days(30)),
            environment: Environment::Production,
            amount_cents: Some(499),
        }
    }

    #[tokio::test]
    async fn failed_verification_still_leaves_an_audit_trail() {
        let f = fixture();

        let err = f
            .reconciler
            .reconcile(
                &f.tenant,
                "user_1",
                &claim("pro_monthly"),
                Err(VerifyFailure::StoreRejected { status: 21003 }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ReceiptRejected(_)));

        // Subscriber and receipt row exist; purchase state untouched
        assert!(f
            .store
            .get_subscriber(&f.tenant, "user_1")
            .await
            .unwrap()
            .is_some());
        let receipts = f.store.list_receipts(&f.tenant).await.unwrap();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].status, "store_rejected");
        assert!(f
            .store
            .list_subscriptions(&f.tenant, "user_1")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn successful_reconcile_installs_state_and_caches() {
        let f = fixture();

        let projection = f
            .reconciler
            .reconcile(
                &f.tenant,
                "user_1",
                &claim("pro_monthly"),
                Ok(purchase("pro_monthly")),
            )
            .await
            .unwrap();

        assert!(projection.subscriptions["pro_monthly"].is_active);
        assert!(projection.entitlements["pro_monthly"].is_active);

        let receipts = f.store.list_receipts(&f.tenant).await.unwrap();
        assert_eq!(receipts[0].status, "validated");

        let events = f.store.list_events(&f.tenant).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "receipt_validated");
        assert_eq!(events[0].amount_cents, Some(499));

        // Write-through: the cache already holds the fresh projection
        let cached = f.cache.get(&f.tenant, "user_1").await.unwrap();
        assert_eq!(cached, projection);
    }

    #[tokio::test]
    async fn reconciling_twice_keeps_one_active_row() {
        let f = fixture();

        for _ in 0..2 {
            f.reconciler
                .reconcile(
                    &f.tenant,
                    "user_1",
                    &claim("pro_monthly"),
                    Ok(purchase("pro_monthly")),
                )
                .await
                .unwrap();
        }

        let subscriptions = f.store.list_subscriptions(&f.tenant, "user_1").await.unwrap();
        assert_eq!(subscriptions.len(), 2);
        assert_eq!(subscriptions.iter().filter(|s| s.is_active).count(), 1);

        let entitlements = f.store.list_entitlements(&f.tenant, "user_1").await.unwrap();
        assert_eq!(entitlements.iter().filter(|e| e.is_active).count(), 1);
    }

    #[tokio::test]
    async fn concurrent_reconciles_never_violate_the_active_invariant() {
        let f = fixture();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let reconciler = f.reconciler.clone();
                let tenant = f.tenant.clone();
                tokio::spawn(async move {
                    reconciler
                        .reconcile(&tenant, "user_1", &claim("pro_monthly"), Ok(purchase("pro_monthly")))
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let subscriptions = f.store.list_subscriptions(&f.tenant, "user_1").await.unwrap();
        assert_eq!(subscriptions.iter().filter(|s| s.is_active).count(), 1);
    }

    #[tokio::test]
    async fn subscriber_locks_are_pruned_after_writes() {
        let f = fixture();

        f.reconciler
            .reconcile(&f.tenant, "user_1", &claim("pro_monthly"), Ok(purchase("pro_monthly")))
            .await
            .unwrap();
        f.reconciler
            .identify(&f.tenant, "user_1", "user_2")
            .await
            .unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let reconciler = f.reconciler.clone();
                let tenant = f.tenant.clone();
                tokio::spawn(async move {
                    reconciler
                        .reconcile(&tenant, "user_3", &claim("pro_monthly"), Ok(purchase("pro_monthly")))
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // The map only tracks in-flight writers; idle subscribers leave no entry
        assert!(f.reconciler.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn deactivate_subscriber_ends_everything() {
        let f = fixture();
        f.reconciler
            .reconcile(&f.tenant, "user_1", &claim("pro_monthly"), Ok(purchase("pro_monthly")))
            .await
            .unwrap();
        f.reconciler
            .reconcile(&f.tenant, "user_1", &claim("addon_gold"), Ok(purchase("addon_gold")))
            .await
            .unwrap();

        let projection = f
            .reconciler
            .deactivate_subscriber(&f.tenant, "user_1", "webhook_cancellation", json!({}))
            .await
            .unwrap();

        assert!(projection.subscriptions.values().all(|s| !s.is_active));
        assert!(projection.entitlements.values().all(|e| !e.is_active));
    }

    #[tokio::test]
    async fn identify_moves_rows_and_swaps_cache_entries() {
        let f = fixture();
        f.reconciler
            .reconcile(&f.tenant, "anon_1", &claim("pro_monthly"), Ok(purchase("pro_monthly")))
            .await
            .unwrap();

        let outcome = f
            .reconciler
            .identify(&f.tenant, "anon_1", "user_42")
            .await
            .unwrap();

        assert!(outcome.created);
        assert!(outcome.projection.subscriptions["pro_monthly"].is_active);
        assert!(f.cache.get(&f.tenant, "anon_1").await.is_none());
        assert_eq!(
            f.cache.get(&f.tenant, "user_42").await.unwrap(),
            outcome.projection
        );

        // Merging again onto an existing identity is not a creation
        let again = f
            .reconciler
            .identify(&f.tenant, "anon_2", "user_42")
            .await
            .unwrap();
        assert!(!again.created);
    }
}
