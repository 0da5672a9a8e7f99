//! Engine assembly and serving.
//!
//! [`Engine`] wires the store, tenant resolver, verifier, and cache together
//! and exposes the domain operations the HTTP layer calls. Every dependency
//! sits behind a trait, so deployments swap backends without touching the
//! engine; the builder fills in the bundled in-memory implementations for
//! anything not provided.

use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::{Cache, InMemoryCache, ProjectionCache};
use crate::config::Config;
use crate::error::Result;
use crate::http;
use crate::projection::{CustomerProjection, Projector};
use crate::reconciler::{IdentifyOutcome, Reconciler};
use crate::store::memory::InMemoryStore;
use crate::store::SubscriberStore;
use crate::tenant::{StaticTenantResolver, Tenant, TenantResolver};
use crate::verifier::{PurchaseClaim, ReceiptVerifier, StoreVerifier};
use crate::webhook::{WebhookIngestor, WebhookOutcome};

pub struct Engine {
    config: Config,
    store: Arc<dyn SubscriberStore>,
    tenants: Arc<dyn TenantResolver>,
    verifier: Arc<dyn ReceiptVerifier>,
    cache: Arc<ProjectionCache>,
    projector: Arc<Projector>,
    reconciler: Arc<Reconciler>,
    ingestor: WebhookIngestor,
}

impl Engine {
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder {
            config,
            store: None,
            tenants: None,
            verifier: None,
            cache: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn SubscriberStore> {
        &self.store
    }

    #[must_use]
    pub fn tenants(&self) -> &Arc<dyn TenantResolver> {
        &self.tenants
    }

    /// Verify a submitted claim and reconcile the outcome into durable
    /// state. Returns the fresh projection on success.
    pub async fn submit_receipt(
        &self,
        tenant: &Tenant,
        app_user_id: &str,
        claim: PurchaseClaim,
    ) -> Result<CustomerProjection> {
        let outcome = self.verifier.verify(tenant, &claim).await;
        self.reconciler
            .reconcile(tenant, app_user_id, &claim, outcome)
            .await
    }

    /// Cache-aware subscriber read. A miss upserts the subscriber (reads
    /// create identities lazily), projects, and repopulates the cache.
    pub async fn customer_info(
        &self,
        tenant: &Tenant,
        app_user_id: &str,
    ) -> Result<CustomerProjection> {
        // A hit deliberately skips the last-seen bump: the upsert happens on
        // the next miss or mutation, so last_seen lags by at most one cache
        // TTL. Bumping here would have to invalidate the entry it just read.
        if let Some(projection) = self.cache.get(tenant, app_user_id).await {
            return Ok(projection);
        }

        self.store.upsert_subscriber(tenant, app_user_id).await?;
        let projection = self.projector.project(tenant, app_user_id).await?;
        self.cache.put(tenant, app_user_id, &projection).await;
        Ok(projection)
    }

    /// Merge attributes into the subscriber record, creating it if absent.
    pub async fn set_attributes(
        &self,
        tenant: &Tenant,
        app_user_id: &str,
        attributes: HashMap<String, String>,
    ) -> Result<()> {
        self.store.upsert_subscriber(tenant, app_user_id).await?;
        self.store
            .merge_attributes(tenant, app_user_id, &attributes)
            .await?;

        // last_seen moved, so rewrite the cached projection
        let projection = self.projector.project(tenant, app_user_id).await?;
        self.cache.put(tenant, app_user_id, &projection).await;
        Ok(())
    }

    /// Merge an anonymous identity into a durable one.
    pub async fn identify(
        &self,
        tenant: &Tenant,
        app_user_id: &str,
        new_app_user_id: &str,
    ) -> Result<IdentifyOutcome> {
        self.reconciler
            .identify(tenant, app_user_id, new_app_user_id)
            .await
    }

    /// Record and apply a store webhook delivery.
    pub async fn ingest_webhook(
        &self,
        tenant: &Tenant,
        payload: serde_json::Value,
    ) -> Result<WebhookOutcome> {
        self.ingestor.ingest(tenant, payload).await
    }

    /// Build the HTTP router over this engine.
    #[must_use]
    pub fn router(self: &Arc<Self>) -> axum::Router {
        http::router(self.clone())
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn serve(self: Arc<Self>) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(target: "purser", %addr, "listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

/// Fluent construction of an [`Engine`] with pluggable backends.
#[must_use = "builder does nothing until you call build()"]
pub struct EngineBuilder {
    config: Config,
    store: Option<Arc<dyn SubscriberStore>>,
    tenants: Option<Arc<dyn TenantResolver>>,
    verifier: Option<Arc<dyn ReceiptVerifier>>,
    cache: Option<Arc<dyn Cache>>,
}

impl EngineBuilder {
    pub fn with_store(mut self, store: Arc<dyn SubscriberStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_tenants(mut self, tenants: Arc<dyn TenantResolver>) -> Self {
        self.tenants = Some(tenants);
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn ReceiptVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> Arc<Engine> {
        let config = self.config;

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()));
        let tenants = self
            .tenants
            .unwrap_or_else(|| Arc::new(StaticTenantResolver::new()));
        let verifier = self.verifier.unwrap_or_else(|| {
            Arc::new(StoreVerifier::new(
                config.app_store.clone(),
                config.play_store.clone(),
            ))
        });
        let backing = self
            .cache
            .unwrap_or_else(|| Arc::new(InMemoryCache::new(&config.cache)));
        let cache = Arc::new(ProjectionCache::new(backing));

        let projector = Arc::new(Projector::new(store.clone()));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            projector.clone(),
            cache.clone(),
        ));
        let ingestor = WebhookIngestor::new(store.clone(), reconciler.clone());

        Arc::new(Engine {
            config,
            store,
            tenants,
            verifier,
            cache,
            projector,
            reconciler,
            ingestor,
        })
    }
}
