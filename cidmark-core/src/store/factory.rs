use super::{ContentStoreBackend, ContentStoreClient, IpfsHttpStore, LocalContentStore};
use crate::{CidmarkError, Result};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct ContentStoreBuilder {
    backend: Option<String>,
    data_dir: Option<PathBuf>,
    ipfs_api_url: Option<String>,
}

impl ContentStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(data_dir.into());
        self
    }

    pub fn ipfs_api_url(mut self, url: impl Into<String>) -> Self {
        self.ipfs_api_url = Some(url.into());
        self
    }

    fn resolve_backend(&self) -> Result<String> {
        let backend = self
            .backend
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if backend.is_empty() {
            return Err(CidmarkError::Config(
                "store backend cannot be empty".to_string(),
            ));
        }

        Ok(backend)
    }

    /// Build an uninitialized client. No I/O happens until `initialize()`.
    pub fn build(&self) -> Result<ContentStoreClient> {
        let backend: Arc<dyn ContentStoreBackend> = match self.resolve_backend()?.as_str() {
            "local" => {
                let data_dir = self.data_dir.clone().ok_or_else(|| {
                    CidmarkError::Config("data_dir is required for local store".to_string())
                })?;
                Arc::new(LocalContentStore::new(data_dir))
            }
            "ipfs" => {
                let url = self.ipfs_api_url.as_deref().unwrap_or_default().trim();
                if url.is_empty() {
                    return Err(CidmarkError::Config(
                        "ipfs_api_url is required for ipfs store".to_string(),
                    ));
                }
                Arc::new(IpfsHttpStore::new(url))
            }
            other => {
                return Err(CidmarkError::Config(format!(
                    "unsupported store backend: {}",
                    other
                )));
            }
        };

        Ok(ContentStoreClient::new(backend))
    }
}
