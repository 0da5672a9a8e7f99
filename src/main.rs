use std::sync::Arc;

use purser::{Config, Engine, StaticTenantResolver, Tenant};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    purser::init_tracing();

    let config = Config::from_env();

    // Single-tenant deployment: one API key from the environment. Multi-tenant
    // deployments implement TenantResolver against their registry instead.
    let tenants = Arc::new(StaticTenantResolver::new());
    match std::env::var("PURSER_API_KEY") {
        Ok(api_key) => {
            tenants.register(api_key, Tenant::new("default", "Default"));
        }
        Err(_) => {
            tracing::warn!(
                target: "purser",
                "PURSER_API_KEY is unset; every /v1 request will be rejected"
            );
        }
    }

    let engine = Engine::builder(config).with_tenants(tenants).build();
    engine.serve().await
}
