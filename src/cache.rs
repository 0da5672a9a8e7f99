//! Projection cache.
//!
//! Advisory, short-TTL cache of serialized projections. The durable store is
//! the only source of truth: a missing, expired, or unparseable entry is a
//! miss, never an error, and mutations write the fresh projection through
//! rather than just dropping the stale one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::CacheConfig;
use crate::projection::CustomerProjection;
use crate::tenant::Tenant;

/// TTL'd byte-oriented key-value store.
///
/// Implement this against your cache backend. The bundled [`InMemoryCache`]
/// covers tests and single-node deployments.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get_bytes(&self, key: &str) -> Option<Vec<u8>>;
    async fn set_bytes(&self, key: &str, value: Vec<u8>);
    async fn delete(&self, key: &str);
}

/// Process-local cache with a fixed TTL and bounded capacity.
pub struct InMemoryCache {
    inner: moka::future::Cache<String, Vec<u8>>,
}

impl InMemoryCache {
    #[must_use]
    pub fn new(config: &CacheConfig) -> Self {
        let inner = moka::future::Cache::builder()
            .max_capacity(config.max_entries)
            .time_to_live(Duration::from_secs(config.ttl_seconds))
            .build();

        Self { inner }
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.get(key).await
    }

    async fn set_bytes(&self, key: &str, value: Vec<u8>) {
        self.inner.insert(key.to_string(), value).await;
    }

    async fn delete(&self, key: &str) {
        self.inner.invalidate(key).await;
    }
}

/// Typed wrapper keying projections by (tenant, subscriber).
pub struct ProjectionCache {
    inner: Arc<dyn Cache>,
}

impl ProjectionCache {
    #[must_use]
    pub fn new(inner: Arc<dyn Cache>) -> Self {
        Self { inner }
    }

    fn key(tenant: &Tenant, app_user_id: &str) -> String {
        format!("projection:{}:{}", tenant.id, app_user_id)
    }

    /// Look up a cached projection. Corrupt entries are dropped and reported
    /// as misses.
    pub async fn get(&self, tenant: &Tenant, app_user_id: &str) -> Option<CustomerProjection> {
        let key = Self::key(tenant, app_user_id);
        let bytes = self.inner.get_bytes(&key).await?;

        match serde_json::from_slice(&bytes) {
            Ok(projection) => Some(projection),
            Err(err) => {
                tracing::warn!(
                    target: "purser::cache",
                    key = %key,
                    error = %err,
                    "dropping unparseable cache entry"
                );
                self.inner.delete(&key).await;
                None
            }
        }
    }

    /// Write a projection through to the cache. Serialization failure is
    /// logged and swallowed; the cache is never load-bearing.
    pub async fn put(&self, tenant: &Tenant, app_user_id: &str, projection: &CustomerProjection) {
        match serde_json::to_vec(projection) {
            Ok(bytes) => {
                self.inner
                    .set_bytes(&Self::key(tenant, app_user_id), bytes)
                    .await;
            }
            Err(err) => {
                tracing::warn!(
                    target: "purser::cache",
                    error = %err,
                    "failed to serialize projection for caching"
                );
            }
        }
    }

    /// Drop the entry for a subscriber, e.g. the old id after an identity
    /// merge.
    pub async fn forget(&self, tenant: &Tenant, app_user_id: &str) {
        self.inner.delete(&Self::key(tenant, app_user_id)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn cache() -> ProjectionCache {
        ProjectionCache::new(Arc::new(InMemoryCache::new(&CacheConfig::default())))
    }

    fn tenant() -> Tenant {
        Tenant::new("app_1", "Demo")
    }

    fn projection(user: &str) -> CustomerProjection {
        CustomerProjection {
            original_app_user_id: user.to_string(),
            first_seen: "2024-01-01T00:00:00.000Z".to_string(),
            last_seen: "2024-01-01T00:00:00.000Z".to_string(),
            entitlements: BTreeMap::new(),
            subscriptions: BTreeMap::new(),
            non_subscriptions: BTreeMap::new(),
            management_url: None,
        }
    }

    #[tokio::test]
    async fn round_trips_projections() {
        let cache = cache();
        let tenant = tenant();

        assert!(cache.get(&tenant, "user_1").await.is_none());
        cache.put(&tenant, "user_1", &projection("user_1")).await;
        let cached = cache.get(&tenant, "user_1").await.unwrap();
        assert_eq!(cached.original_app_user_id, "user_1");
    }

    #[tokio::test]
    async fn keys_are_tenant_scoped() {
        let cache = cache();
        cache.put(&tenant(), "user_1", &projection("user_1")).await;

        let other = Tenant::new("app_2", "Other");
        assert!(cache.get(&other, "user_1").await.is_none());
    }

    #[tokio::test]
    async fn forget_removes_entry() {
        let cache = cache();
        let tenant = tenant();
        cache.put(&tenant, "user_1", &projection("user_1")).await;
        cache.forget(&tenant, "user_1").await;
        assert!(cache.get(&tenant, "user_1").await.is_none());
    }

    #[tokio::test]
    async fn corrupt_entry_is_a_miss() {
        let backing = Arc::new(InMemoryCache::new(&CacheConfig::default()));
        let cache = ProjectionCache::new(backing.clone());
        let tenant = tenant();

        backing
            .set_bytes("projection:app_1:user_1", b"not json".to_vec())
            .await;

        assert!(cache.get(&tenant, "user_1").await.is_none());
        // The bad entry is gone, not repeatedly re-parsed
        assert!(backing.get_bytes("projection:app_1:user_1").await.is_none());
    }
}
