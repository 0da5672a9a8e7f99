//! Purser - a subscription-commerce backend
//!
//! Purser accepts purchase receipts and store webhooks, validates them against
//! the platform stores, and projects a consistent "customer info" view (active
//! subscriptions + entitlements) to every client, speaking the wire format of
//! a widely used mobile monetization SDK.
//!
//! # Components
//!
//! - **Verifier**: calls the App Store / Play Store verification authorities
//!   and normalizes their divergent responses into one result shape
//! - **Reconciler**: converts verified purchases into idempotent subscriber
//!   state transitions (deactivate-then-insert, audit trail, cache rewrite)
//! - **Webhook ingestor**: applies the same state-transition contract to
//!   store-originated events, including terminal cancellation/expiration
//! - **Projector**: assembles the deterministic per-subscriber view
//! - **Projection cache**: short-lived write-through cache of that view
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use purser::{Config, Engine, InMemoryStore, StaticTenantResolver};
//!
//! #[tokio::main]
//! async fn main() {
//!     purser::init_tracing();
//!
//!     let config = Config::from_env();
//!     let engine = Engine::builder(config)
//!         .with_store(Arc::new(InMemoryStore::new()))
//!         .with_tenants(Arc::new(StaticTenantResolver::new()))
//!         .build();
//!
//!     engine.serve().await.unwrap();
//! }
//! ```

mod app;
pub mod cache;
mod config;
mod error;
mod http;
pub mod projection;
pub mod reconciler;
pub mod store;
pub mod tenant;
pub mod verifier;
pub mod webhook;

pub use app::{Engine, EngineBuilder};
pub use cache::{Cache, InMemoryCache, ProjectionCache};
pub use config::{AppStoreConfig, CacheConfig, Config, PlayStoreConfig, ServerConfig};
pub use error::{EngineError, Result};
pub use projection::{CustomerProjection, Projector};
pub use reconciler::{IdentifyOutcome, Reconciler};
pub use store::memory::InMemoryStore;
pub use store::{
    Entitlement, Environment, Event, ReceiptRecord, Store, Subscriber, SubscriberStore,
    Subscription,
};
pub use tenant::{StaticTenantResolver, Tenant, TenantResolver};
pub use verifier::{
    PurchaseClaim, PurchaseProof, ReceiptVerifier, StoreVerifier, VerifiedPurchase, VerifyFailure,
};
pub use webhook::{WebhookIngestor, WebhookOutcome, WebhookPayload};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing/logging with sensible defaults
///
/// This should be called early in your application, typically in main()
/// before creating the Engine.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "debug", "purser=debug")
/// - `PURSER_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("PURSER_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
