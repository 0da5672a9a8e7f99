//! Tenant (application) identity and API-key resolution.
//!
//! Every core call takes the resolved [`Tenant`] as an explicit value; the
//! engine never reads tenant identity from ambient state.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A tenant application. All durable rows are scoped by `Tenant::id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    /// Opaque tenant identifier.
    pub id: String,
    /// Display name.
    pub name: String,
}

impl Tenant {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Maps an API key to a tenant application.
///
/// Implement this trait against your tenant registry. A static in-memory
/// resolver is provided for tests and single-tenant deployments.
#[async_trait]
pub trait TenantResolver: Send + Sync {
    /// Resolve an API key. `Ok(None)` means the key is unknown.
    async fn resolve(&self, api_key: &str) -> Result<Option<Tenant>>;
}

/// In-memory API key → tenant map.
#[derive(Default)]
pub struct StaticTenantResolver {
    keys: RwLock<HashMap<String, Tenant>>,
}

impl StaticTenantResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an API key for a tenant.
    pub fn register(&self, api_key: impl Into<String>, tenant: Tenant) {
        self.keys
            .write()
            .expect("tenant key map poisoned")
            .insert(api_key.into(), tenant);
    }
}

#[async_trait]
impl TenantResolver for StaticTenantResolver {
    async fn resolve(&self, api_key: &str) -> Result<Option<Tenant>> {
        Ok(self
            .keys
            .read()
            .expect("tenant key map poisoned")
            .get(api_key)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_registered_key() {
        let resolver = StaticTenantResolver::new();
        resolver.register("pk_test_abc", Tenant::new("app_1", "Demo"));

        let tenant = resolver.resolve("pk_test_abc").await.unwrap().unwrap();
        assert_eq!(tenant.id, "app_1");

        assert!(resolver.resolve("pk_unknown").await.unwrap().is_none());
    }
}
