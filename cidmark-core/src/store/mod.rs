//! Content-addressed storage for Cidmark
//!
//! [`ContentStoreClient`] owns one store node for the lifetime of the process
//! and exposes "add bytes -> content identifier". Backends plug in through
//! [`ContentStoreBackend`].

pub mod factory;
pub mod ipfs;
pub mod local;

pub use factory::ContentStoreBuilder;
pub use ipfs::IpfsHttpStore;
pub use local::{LocalContentStore, StoredObject, compute_hash, verify_hash};

use crate::error::{CidmarkError, Result};
use crate::types::ContentId;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Describes a started store node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreHandle {
    pub backend: String,
    pub version: String,
    pub started_at: DateTime<Utc>,
}

#[async_trait]
pub trait ContentStoreBackend: Send + Sync {
    /// Start the node. Called at most once per client.
    async fn start(&self) -> Result<StoreHandle>;

    /// Ingest `body`; must not return until the content is retrievable.
    async fn add(&self, body: Bytes, name: &str) -> Result<ContentId>;

    async fn get(&self, cid: &ContentId) -> Result<Bytes>;
}

pub struct ContentStoreClient {
    backend: Arc<dyn ContentStoreBackend>,
    handle: OnceCell<StoreHandle>,
}

impl ContentStoreClient {
    pub fn new(backend: Arc<dyn ContentStoreBackend>) -> Self {
        Self {
            backend,
            handle: OnceCell::new(),
        }
    }

    /// Start the underlying node. Concurrent and repeated calls share the
    /// first successful start; a failed start may be attempted again.
    pub async fn initialize(&self) -> Result<StoreHandle> {
        let handle = self
            .handle
            .get_or_try_init(|| async {
                self.backend.start().await.map_err(|error| match error {
                    CidmarkError::StoreUnavailable(_) => error,
                    other => CidmarkError::StoreUnavailable(other.to_string()),
                })
            })
            .await?;

        tracing::info!(
            backend = %handle.backend,
            version = %handle.version,
            "content store initialized"
        );
        Ok(handle.clone())
    }

    pub fn handle(&self) -> Option<&StoreHandle> {
        self.handle.get()
    }

    pub fn is_initialized(&self) -> bool {
        self.handle.initialized()
    }

    /// Add a payload and return its identifier. `name` is bookkeeping only
    /// and never influences the identifier.
    pub async fn add(&self, body: Bytes, name: &str) -> Result<ContentId> {
        self.ensure_initialized()?;

        let size = body.len();
        let cid = self.backend.add(body, name).await.map_err(into_ingest_error)?;

        tracing::debug!(cid = %cid, name, size, "content added");
        Ok(cid)
    }

    pub async fn get(&self, cid: &ContentId) -> Result<Bytes> {
        self.ensure_initialized()?;
        self.backend.get(cid).await
    }

    fn ensure_initialized(&self) -> Result<()> {
        if !self.is_initialized() {
            return Err(CidmarkError::NotInitialized);
        }
        Ok(())
    }
}

fn into_ingest_error(error: CidmarkError) -> CidmarkError {
    match error {
        CidmarkError::IngestError(_) => error,
        CidmarkError::Io(io) => CidmarkError::IngestError(io.to_string()),
        CidmarkError::Database(db) => CidmarkError::IngestError(db.to_string()),
        other => other,
    }
}
