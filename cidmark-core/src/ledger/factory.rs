use super::{
    EtcdLedger, LedgerBackend, MemoryLedger, OwnershipLedgerClient, RedisLedger, RetryPolicy,
    SignatureVerifier, SignerProvider,
};
use crate::{CidmarkError, Result};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct LedgerBuilder {
    backend: Option<String>,
    namespace: Option<String>,
    etcd_endpoints: Option<Vec<String>>,
    redis_url: Option<String>,
    retry: RetryPolicy,
    signers: Option<Arc<dyn SignerProvider>>,
    verifier: Option<Arc<dyn SignatureVerifier>>,
}

impl LedgerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn etcd_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.etcd_endpoints = Some(endpoints);
        self
    }

    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn signers(mut self, signers: Arc<dyn SignerProvider>) -> Self {
        self.signers = Some(signers);
        self
    }

    pub fn verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    fn resolve_namespace(&self) -> Result<String> {
        let namespace = self
            .namespace
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_string();
        if namespace.is_empty() {
            return Err(CidmarkError::Config(
                "ledger namespace cannot be empty".to_string(),
            ));
        }

        Ok(namespace)
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
                "ledger backend cannot be empty".to_string(),
            ));
        }

        Ok(backend)
    }

    pub async fn build(&self) -> Result<OwnershipLedgerClient> {
        let namespace = self.resolve_namespace()?;
        let backend = self.resolve_backend()?;

        let signers = self.signers.clone().ok_or_else(|| {
            CidmarkError::Config("a signer provider is required".to_string())
        })?;
        let verifier = self.verifier.clone().ok_or_else(|| {
            CidmarkError::Config("a signature verifier is required".to_string())
        })?;

        let ledger: Arc<dyn LedgerBackend> = match backend.as_str() {
            "memory" => Arc::new(MemoryLedger::new(verifier)),
            "etcd" => {
                let endpoints = self.etcd_endpoints.clone().ok_or_else(|| {
                    CidmarkError::Config("etcd endpoints are required for etcd backend".to_string())
                })?;

                if endpoints.is_empty() {
                    return Err(CidmarkError::Config(
                        "etcd endpoints cannot be empty for etcd backend".to_string(),
                    ));
                }

                Arc::new(EtcdLedger::new(&endpoints, &namespace, verifier).await?)
            }
            "redis" => {
                let url = self.redis_url.as_deref().unwrap_or_default().trim();
                if url.is_empty() {
                    return Err(CidmarkError::Config(
                        "redis url is required for redis backend".to_string(),
                    ));
                }

                Arc::new(RedisLedger::new(url, &namespace, verifier).await?)
            }
            other => {
                return Err(CidmarkError::Config(format!(
                    "unsupported ledger backend: {}",
                    other
                )));
            }
        };

        Ok(OwnershipLedgerClient::new(ledger, signers, self.retry.clone()))
    }
}
