use secrecy::SecretString;
use serde::Deserialize;

/// Main configuration for a Purser deployment.
///
/// Every field has a sensible default and can be overridden from the
/// environment via `Config::from_env` (`PURSER_*` variables).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub app_store: AppStoreConfig,
    #[serde(default)]
    pub play_store: PlayStoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Password for the HTTP basic-auth admin surface. When unset, admin
    /// routes answer 500 `basic_auth_not_configured`.
    #[serde(default)]
    pub admin_password: Option<SecretString>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// App Store receipt verification settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AppStoreConfig {
    /// Shared secret for the verifyReceipt endpoint. Absent means receipt
    /// submissions for this store fail with a configuration reason.
    #[serde(default)]
    pub shared_secret: Option<SecretString>,
    #[serde(default = "default_app_store_production_url")]
    pub production_url: String,
    #[serde(default = "default_app_store_sandbox_url")]
    pub sandbox_url: String,
    #[serde(default = "default_verify_timeout_seconds")]
    pub timeout_seconds: u64,
}

/// Play Store purchase-token verification settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PlayStoreConfig {
    /// Service-account credentials JSON (client_email, private_key,
    /// token_uri). Absent means token submissions fail with a configuration
    /// reason.
    #[serde(default)]
    pub service_account_json: Option<SecretString>,
    #[serde(default = "default_play_store_api_base")]
    pub api_base_url: String,
    #[serde(default = "default_verify_timeout_seconds")]
    pub timeout_seconds: u64,
}

/// Projection cache settings. The cache is advisory: entries are short-lived
/// and their absence is never an error.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_seconds")]
    pub ttl_seconds: u64,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            app_store: AppStoreConfig::default(),
            play_store: PlayStoreConfig::default(),
            cache: CacheConfig::default(),
            admin_password: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for AppStoreConfig {
    fn default() -> Self {
        Self {
            shared_secret: None,
            production_url: default_app_store_production_url(),
            sandbox_url: default_app_store_sandbox_url(),
            timeout_seconds: default_verify_timeout_seconds(),
        }
    }
}

impl Default for PlayStoreConfig {
    fn default() -> Self {
        Self {
            service_account_json: None,
            api_base_url: default_play_store_api_base(),
            timeout_seconds: default_verify_timeout_seconds(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_cache_ttl_seconds(),
            max_entries: default_cache_max_entries(),
        }
    }
}

impl Config {
    /// Build a configuration from `PURSER_*` environment variables, falling
    /// back to defaults for anything unset.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("PURSER_HOST") {
            config.server.host = host;
        }
        if let Ok(port) = std::env::var("PURSER_PORT") {
            if let Ok(port) = port.parse() {
                config.server.port = port;
            }
        }
        if let Ok(secret) = std::env::var("PURSER_APPLE_SHARED_SECRET") {
            config.app_store.shared_secret = Some(secret.into());
        }
        if let Ok(json) = std::env::var("PURSER_GOOGLE_SERVICE_ACCOUNT_JSON") {
            config.play_store.service_account_json = Some(json.into());
        }
        if let Ok(password) = std::env::var("PURSER_ADMIN_PASSWORD") {
            config.admin_password = Some(password.into());
        }
        if let Ok(ttl) = std::env::var("PURSER_CACHE_TTL_SECONDS") {
            if let Ok(ttl) = ttl.parse() {
                config.cache.ttl_seconds = ttl;
            }
        }

        config
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_app_store_production_url() -> String {
    "https://buy.itunes.apple.com/verifyReceipt".to_string()
}

fn default_app_store_sandbox_url() -> String {
    "https://sandbox.itunes.apple.com/verifyReceipt".to_string()
}

fn default_play_store_api_base() -> String {
    "https://androidpublisher.googleapis.com/androidpublisher/v3".to_string()
}

fn default_verify_timeout_seconds() -> u64 {
    10
}

fn default_cache_ttl_seconds() -> u64 {
    300
}

fn default_cache_max_entries() -> u64 {
    10_000
}
