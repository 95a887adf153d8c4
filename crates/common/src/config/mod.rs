//! Configuration management for SiteBridge services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config.toml, config.yaml)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;
use validator::Validate;

use crate::errors::{AppError, Result};
use crate::transfer::matching::MatchStrategy;
use crate::transfer::references::ReferencePolicy;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Which installation backend serves the transfer engine
    #[serde(default)]
    pub storage: StorageConfig,

    /// Transfer engine behaviour
    pub transfer: TransferConfig,

    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Largest snapshot accepted by the import endpoint
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Primary database URL (for writes)
    pub url: String,

    /// Read replica URL (optional, falls back to primary)
    pub read_url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Run bundled migrations on startup
    #[serde(default = "default_enabled")]
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Expose field group storage to the engine (Stage F is skipped otherwise)
    #[serde(default = "default_enabled")]
    pub schema_provider: bool,

    /// Expose catalog storage to the engine (Stage G is skipped otherwise)
    #[serde(default = "default_enabled")]
    pub catalog: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TransferConfig {
    /// Public base URL of this installation, used for reference URL fixup
    #[validate(url)]
    pub site_url: String,

    /// How an incoming entity is matched against existing ones
    #[serde(default)]
    pub match_strategy: MatchStrategy,

    /// Metadata key holding a cross-installation identifier (external_id strategy)
    #[validate(length(min = 1))]
    pub external_id_key: Option<String>,

    /// How metadata values are recognised as entity references
    #[serde(default)]
    pub reference_policy: ReferencePolicy,

    /// Metadata keys known to hold entity ids
    #[serde(default)]
    pub reference_meta_keys: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// JWT secret for token signing
    pub jwt_secret: Option<String>,

    /// JWT expiration in seconds
    #[serde(default = "default_jwt_expiration")]
    pub jwt_expiration_secs: u64,

    /// SHA-256 hex digests of accepted API keys
    #[serde(default)]
    pub api_key_hashes: Vec<String>,

    /// Secret mixed into transfer nonces
    pub nonce_secret: Option<String>,

    /// Nonce lifetime in seconds
    #[serde(default = "default_nonce_lifetime")]
    pub nonce_lifetime_secs: u64,

    /// Request ID header name
    #[serde(default = "default_request_id_header")]
    pub request_id_header: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Serve Prometheus metrics at /metrics
    #[serde(default = "default_enabled")]
    pub metrics_enabled: bool,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 120 }
fn default_max_upload_bytes() -> usize { 32 * 1024 * 1024 }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_jwt_expiration() -> u64 { 3600 }
fn default_nonce_lifetime() -> u64 { 86400 }
fn default_request_id_header() -> String { "X-Request-ID".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_service_name() -> String { "sitebridge".to_string() }
fn default_enabled() -> bool { true }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            schema_provider: default_enabled(),
            catalog: default_enabled(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            jwt_expiration_secs: default_jwt_expiration(),
            api_key_hashes: Vec::new(),
            nonce_secret: None,
            nonce_lifetime_secs: default_nonce_lifetime(),
            request_id_header: default_request_id_header(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_enabled: default_enabled(),
            service_name: default_service_name(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> std::result::Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Start with defaults
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?

            // Load base config file
            .add_source(File::with_name("config/default").required(false))

            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))

            // Load local overrides
            .add_source(File::with_name("config/local").required(false))

            // Load from environment variables with APP__ prefix
            // e.g., APP__TRANSFER__SITE_URL=https://new.example
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("auth.api_key_hashes")
                    .with_list_parse_key("transfer.reference_meta_keys"),
            )

            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific TOML file
    pub fn from_file(path: &str) -> std::result::Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?;

        config.try_deserialize()
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<()> {
        self.transfer.validate().map_err(|e| AppError::Configuration {
            message: format!("transfer: {}", e),
        })?;

        if self.transfer.match_strategy == MatchStrategy::ExternalId
            && self.transfer.external_id_key.is_none()
        {
            return Err(AppError::Configuration {
                message: "transfer.external_id_key is required for the external_id strategy"
                    .to_string(),
            });
        }

        if self.transfer.reference_policy == ReferencePolicy::Declared
            && self.transfer.reference_meta_keys.is_empty()
        {
            tracing::warn!(
                "Declared reference policy without configured keys; only keys declared by snapshots will be remapped"
            );
        }

        Ok(())
    }

    /// Parsed site URL of this installation
    pub fn site_url(&self) -> Result<Url> {
        self.transfer.site_url()
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get the read database URL (falls back to primary)
    pub fn read_database_url(&self) -> &str {
        self.database.read_url.as_deref().unwrap_or(&self.database.url)
    }
}

impl TransferConfig {
    /// Parsed site URL of this installation
    pub fn site_url(&self) -> Result<Url> {
        Url::parse(&self.site_url).map_err(|e| AppError::Configuration {
            message: format!("Invalid transfer.site_url '{}': {}", self.site_url, e),
        })
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            site_url: "http://localhost".to_string(),
            match_strategy: MatchStrategy::default(),
            external_id_key: None,
            reference_policy: ReferencePolicy::default(),
            reference_meta_keys: Vec::new(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: default_host(),
                port: default_port(),
                request_timeout_secs: default_request_timeout(),
                max_upload_bytes: default_max_upload_bytes(),
            },
            database: DatabaseConfig {
                url: "postgres://localhost/sitebridge".to_string(),
                read_url: None,
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                connect_timeout_secs: default_connect_timeout(),
                idle_timeout_secs: default_idle_timeout(),
                run_migrations: default_enabled(),
            },
            storage: StorageConfig::default(),
            transfer: TransferConfig::default(),
            auth: AuthConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.storage.backend, StorageBackend::Postgres);
        assert_eq!(config.transfer.match_strategy, MatchStrategy::Title);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_read_database_fallback() {
        let config = AppConfig::default();
        assert_eq!(config.read_database_url(), "postgres://localhost/sitebridge");
    }

    #[test]
    fn test_external_id_strategy_requires_key() {
        let mut config = AppConfig::default();
        config.transfer.match_strategy = MatchStrategy::ExternalId;
        assert!(matches!(
            config.validate(),
            Err(AppError::Configuration { .. })
        ));

        config.transfer.external_id_key = Some("course_code".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_site_url_rejected() {
        let mut config = AppConfig::default();
        config.transfer.site_url = "not a url".to_string();
        assert!(config.validate().is_err());
        assert!(config.site_url().is_err());
    }
}
