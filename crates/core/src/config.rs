//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Listener configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Registry store (PostgreSQL) configuration.
    pub registry: RegistryConfig,
    /// Shared bootstrap tokens.
    pub auth: AuthConfig,
    /// Token signing backend.
    #[serde(default)]
    pub signing: SigningConfig,
    /// Distributed lock table.
    #[serde(default)]
    pub lock: LockConfig,
    /// Object-store credentials handed to hubs verbatim.
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    /// TLS bundle handed to hubs in ConfigResponse.
    #[serde(default)]
    pub hub_tls: Option<HubTlsConfig>,
}

/// Listener configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC bind address (e.g., "0.0.0.0:24401").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Ops HTTP bind address for /healthz and /metrics.
    #[serde(default = "default_ops_bind")]
    pub ops_bind: String,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "127.0.0.1:24401".to_string()
}

fn default_ops_bind() -> String {
    "127.0.0.1:24402".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            ops_bind: default_ops_bind(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

/// Registry store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// PostgreSQL connection URL.
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Server-side statement timeout. None disables it.
    #[serde(default)]
    pub statement_timeout_ms: Option<u64>,
}

fn default_max_connections() -> u32 {
    10
}

/// Shared bootstrap tokens.
///
/// `register_token` gates Register/IssueHubToken; `ops_token` gates the
/// ops HTTP surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthConfig {
    pub register_token: String,
    pub ops_token: String,
}

/// Token signing backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SigningConfig {
    /// Key id within the signing backend.
    #[serde(default = "default_key_id")]
    pub key_id: String,
    #[serde(default)]
    pub backend: SigningBackend,
}

fn default_key_id() -> String {
    "control-signing".to_string()
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            key_id: default_key_id(),
            backend: SigningBackend::default(),
        }
    }
}

/// Where the ed25519 private half lives.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SigningBackend {
    /// Vault transit engine; the private key never leaves Vault.
    Vault {
        /// Vault address (e.g., "https://vault.internal:8200").
        addr: String,
        /// Transit mount path.
        #[serde(default = "default_vault_mount")]
        mount: String,
        /// Environment variable holding the Vault token.
        #[serde(default = "default_vault_token_env")]
        token_env: String,
    },
    /// Key file on disk (32-byte seed, base64).
    File { path: PathBuf },
    /// Ephemeral in-process key. Not suitable for production.
    Ephemeral,
}

fn default_vault_mount() -> String {
    "transit".to_string()
}

fn default_vault_token_env() -> String {
    "VAULT_TOKEN".to_string()
}

impl Default for SigningBackend {
    fn default() -> Self {
        Self::Ephemeral
    }
}

/// Distributed lock configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockConfig {
    /// Name of the leased-lock table.
    #[serde(default = "default_lock_table")]
    pub table: String,
    /// Lease TTL in seconds.
    #[serde(default = "default_lock_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_lock_table() -> String {
    "control_locks".to_string()
}

fn default_lock_ttl_secs() -> u64 {
    60
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            table: default_lock_table(),
            ttl_secs: default_lock_ttl_secs(),
        }
    }
}

/// Object-store credentials passed through to hubs in ConfigResponse.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub bucket: String,
}

/// TLS bundle served to hubs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HubTlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub domain: String,
}

impl ControlConfig {
    /// Create a test configuration.
    ///
    /// **For testing only.** Uses an ephemeral signing key and fixed
    /// bootstrap tokens.
    pub fn for_testing() -> Self {
        Self {
            server: ServerConfig::default(),
            registry: RegistryConfig {
                url: "postgres://localhost/trellis_test".to_string(),
                max_connections: default_max_connections(),
                statement_timeout_ms: None,
            },
            auth: AuthConfig {
                register_token: "test-register-token".to_string(),
                ops_token: "test-ops-token".to_string(),
            },
            signing: SigningConfig::default(),
            lock: LockConfig::default(),
            object_store: ObjectStoreConfig {
                access_key: "test-access".to_string(),
                secret_key: "test-secret".to_string(),
                bucket: "test-bucket".to_string(),
            },
            hub_tls: None,
        }
    }
}
