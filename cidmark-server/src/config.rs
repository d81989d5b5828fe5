use cidmark_core::{
    CidmarkError, ContentId, ContentStoreBuilder, Identity, LedgerBuilder, LocalKeyring, Result,
    RetryPolicy,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub identity: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    pub store: StoreConfig,
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub keyring: KeyringConfig,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_gateway_url() -> String {
    "https://ipfs.io/ipfs/".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Local,
    Ipfs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub ipfs_api_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackendKind {
    Memory,
    Redis,
    Etcd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub backend: LedgerBackendKind,
    #[serde(default)]
    pub namespace: Option<String>,
    pub redis: Option<RedisConfig>,
    pub etcd: Option<EtcdConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl LedgerConfig {
    pub fn namespace_or_default(&self) -> &str {
        self.namespace
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or("default")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
}

/// Ledger read retries. Left at a single attempt unless configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyringConfig {
    #[serde(default)]
    pub entries: Vec<KeyringEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyringEntry {
    pub identity: String,
    pub secret: String,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("CIDMARK").separator("__"))
            .build()
            .map_err(|e| CidmarkError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| CidmarkError::Config(e.to_string()))?;

        Ok(config)
    }

    pub fn identity(&self) -> Result<Identity> {
        Identity::new(self.identity.clone())
    }

    pub fn keyring(&self) -> Result<LocalKeyring> {
        let mut keyring = LocalKeyring::new();
        for entry in &self.keyring.entries {
            if entry.secret.is_empty() {
                return Err(CidmarkError::Config(format!(
                    "keyring secret for '{}' cannot be empty",
                    entry.identity
                )));
            }
            keyring.insert(Identity::new(entry.identity.clone())?, entry.secret.clone());
        }
        Ok(keyring)
    }

    pub fn store_builder(&self) -> ContentStoreBuilder {
        let mut builder = ContentStoreBuilder::new().backend(match self.store.backend {
            StoreBackend::Local => "local",
            StoreBackend::Ipfs => "ipfs",
        });
        if let Some(data_dir) = &self.store.data_dir {
            builder = builder.data_dir(data_dir.clone());
        }
        if let Some(url) = &self.store.ipfs_api_url {
            builder = builder.ipfs_api_url(url.clone());
        }
        builder
    }

    pub fn ledger_builder(&self, keyring: Arc<LocalKeyring>) -> LedgerBuilder {
        let mut builder = LedgerBuilder::new()
            .backend(match self.ledger.backend {
                LedgerBackendKind::Memory => "memory",
                LedgerBackendKind::Redis => "redis",
                LedgerBackendKind::Etcd => "etcd",
            })
            .namespace(self.ledger.namespace_or_default())
            .retry(RetryPolicy::new(
                self.ledger.retry.max_attempts,
                Duration::from_millis(self.ledger.retry.backoff_ms),
            ))
            .signers(keyring.clone())
            .verifier(keyring);

        if let Some(redis) = &self.ledger.redis {
            builder = builder.redis_url(redis.url.clone());
        }
        if let Some(etcd) = &self.ledger.etcd {
            builder = builder.etcd_endpoints(etcd.endpoints.clone());
        }
        builder
    }

    /// Retrieval link for a published file.
    pub fn link_for(&self, cid: &ContentId) -> String {
        format!("{}/{}", self.gateway_url.trim_end_matches('/'), cid)
    }
}
