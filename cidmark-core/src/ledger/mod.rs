//! Ownership ledger for Cidmark
//!
//! The ledger holds at most one pointer (a [`ContentId`]) per [`Identity`].
//! Backends speak the wire format, where an unset pointer reads as
//! [`POINTER_SENTINEL`]; [`OwnershipLedgerClient`] turns that into `None`.

pub mod etcd;
pub mod factory;
pub mod memory;
pub mod redis;
pub mod signer;

pub use etcd::EtcdLedger;
pub use factory::LedgerBuilder;
pub use memory::MemoryLedger;
pub use redis::RedisLedger;
pub use signer::{
    LocalKeyring, PointerWrite, Signature, SignatureVerifier, SignedWrite, Signer, SignerError,
    SignerProvider,
};

use crate::error::{CidmarkError, Result};
use crate::types::{ContentId, Identity, POINTER_SENTINEL};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use ulid::Ulid;

/// Stored form of a pointer inside key-value ledger backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub identity: String,
    pub value: String,
    pub revision: u64,
    pub request_id: String,
    pub signature: String,
    pub written_at: DateTime<Utc>,
}

impl LedgerRecord {
    pub fn from_write(signed: &SignedWrite, revision: u64) -> Self {
        Self {
            identity: signed.write.identity.to_string(),
            value: signed.write.value.to_string(),
            revision,
            request_id: signed.write.request_id.clone(),
            signature: signed.signature.0.clone(),
            written_at: Utc::now(),
        }
    }

    pub fn receipt(&self) -> Receipt {
        Receipt {
            revision: self.revision,
            request_id: self.request_id.clone(),
            recorded_at: self.written_at,
        }
    }
}

/// What a backend reports once a write is durably applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub revision: u64,
    pub request_id: String,
    pub recorded_at: DateTime<Utc>,
}

/// A confirmed pointer write; a subsequent read observes `cid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Confirmation {
    pub identity: Identity,
    pub cid: ContentId,
    pub revision: u64,
    pub request_id: String,
    pub confirmed_at: DateTime<Utc>,
}

#[async_trait]
pub trait LedgerBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Raw pointer value, [`POINTER_SENTINEL`] when never written.
    /// Fails with `LedgerQueryError`.
    async fn read_raw(&self, identity: &Identity) -> Result<String>;

    /// Apply a signed write and return only once it is readable.
    /// Fails with `WriteRejected` when the signature does not authenticate
    /// the identity, `LedgerWriteError` on transport failure.
    async fn submit(&self, signed: &SignedWrite) -> Result<Receipt>;
}

/// Reject writes whose signature does not authenticate the declared identity.
pub(crate) fn authorize(verifier: &dyn SignatureVerifier, signed: &SignedWrite) -> Result<()> {
    if !verifier.verify(signed) {
        return Err(CidmarkError::WriteRejected(format!(
            "ledger refused unauthenticated write for {}",
            signed.write.identity
        )));
    }
    Ok(())
}

/// Refuse a write that is a replay of, or older than, the stored record.
pub(crate) fn ensure_newer(previous: Option<&LedgerRecord>, signed: &SignedWrite) -> Result<()> {
    let Some(previous) = previous else {
        return Ok(());
    };

    let stale = if previous.request_id == signed.write.request_id {
        true
    } else {
        match (
            Ulid::from_string(&previous.request_id),
            Ulid::from_string(&signed.write.request_id),
        ) {
            (Ok(stored), Ok(incoming)) => incoming.timestamp_ms() < stored.timestamp_ms(),
            (_, Err(_)) => true,
            (Err(_), Ok(_)) => false,
        }
    };

    if stale {
        return Err(CidmarkError::WriteRejected(format!(
            "write {} for {} is not newer than stored write {}",
            signed.write.request_id, signed.write.identity, previous.request_id
        )));
    }
    Ok(())
}

/// Check a read-back after submitting `record`: the stored record must be the
/// one just written.
pub(crate) fn confirm(record: &LedgerRecord, stored: Option<LedgerRecord>) -> Result<Receipt> {
    match stored {
        Some(stored) if stored.request_id == record.request_id => Ok(stored.receipt()),
        Some(stored) => Err(CidmarkError::LedgerWriteError(format!(
            "write {} superseded by {} before confirmation",
            record.request_id, stored.request_id
        ))),
        None => Err(CidmarkError::LedgerWriteError(format!(
            "write {} not visible after submit",
            record.request_id
        ))),
    }
}

/// Identity as it appears inside backend keys; hex keeps separators out.
pub(crate) fn key_segment(identity: &Identity) -> String {
    hex::encode(identity.as_str())
}

pub(crate) fn decode_record(payload: &[u8]) -> Result<LedgerRecord> {
    serde_json::from_slice(payload).map_err(|error| {
        CidmarkError::LedgerQueryError(format!("failed to decode ledger record: {}", error))
    })
}

pub(crate) fn record_value(record: Option<LedgerRecord>) -> String {
    record
        .map(|record| record.value)
        .unwrap_or_else(|| POINTER_SENTINEL.to_string())
}

/// Retry policy for ledger reads. Writes are never retried because a failed
/// write has an ambiguous outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    async fn run<T, F, Fut>(&self, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut tried = 0;
        loop {
            tried += 1;
            match attempt().await {
                Err(CidmarkError::LedgerQueryError(reason)) if tried < max_attempts => {
                    tracing::warn!(
                        attempt = tried,
                        max_attempts,
                        "ledger query failed, retrying: {}",
                        reason
                    );
                    if !self.backoff.is_zero() {
                        tokio::time::sleep(self.backoff).await;
                    }
                }
                other => return other,
            }
        }
    }
}

pub struct OwnershipLedgerClient {
    backend: Arc<dyn LedgerBackend>,
    signers: Arc<dyn SignerProvider>,
    retry: RetryPolicy,
}

impl OwnershipLedgerClient {
    pub fn new(
        backend: Arc<dyn LedgerBackend>,
        signers: Arc<dyn SignerProvider>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            signers,
            retry,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Latest confirmed pointer for `identity`, `None` if never set.
    pub async fn read_pointer(&self, identity: &Identity) -> Result<Option<ContentId>> {
        let raw = self.retry.run(|| self.backend.read_raw(identity)).await?;

        ContentId::from_wire(&raw).map_err(|error| {
            CidmarkError::LedgerQueryError(format!(
                "ledger returned malformed pointer for {}: {}",
                identity, error
            ))
        })
    }

    /// Sign and submit a pointer write as `identity`, returning once the
    /// ledger confirms it.
    pub async fn write_pointer(
        &self,
        identity: &Identity,
        value: &ContentId,
    ) -> Result<Confirmation> {
        let signer = self.signers.signer_for(identity).ok_or_else(|| {
            CidmarkError::InvalidIdentity(format!("no signer available for {}", identity))
        })?;

        let write = PointerWrite::new(identity.clone(), value.clone());
        let signature = signer
            .sign(&write)
            .await
            .map_err(|error| CidmarkError::WriteRejected(error.to_string()))?;

        let signed = SignedWrite { write, signature };
        let receipt = self.backend.submit(&signed).await?;

        tracing::info!(
            identity = %identity,
            cid = %value,
            revision = receipt.revision,
            backend = self.backend.name(),
            "ledger pointer write confirmed"
        );

        Ok(Confirmation {
            identity: identity.clone(),
            cid: value.clone(),
            revision: receipt.revision,
            request_id: receipt.request_id,
            confirmed_at: receipt.recorded_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn alice() -> Identity {
        Identity::new("0xA11CE").unwrap()
    }

    fn client_with(keyring: LocalKeyring) -> OwnershipLedgerClient {
        let keyring = Arc::new(keyring);
        let backend = Arc::new(MemoryLedger::new(keyring.clone()));
        OwnershipLedgerClient::new(backend, keyring, RetryPolicy::default())
    }

    #[tokio::test]
    async fn test_unset_pointer_reads_none() {
        let client = client_with(LocalKeyring::new().with_key(alice(), "s"));
        assert_eq!(client.read_pointer(&alice()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let client = client_with(LocalKeyring::new().with_key(alice(), "s"));
        let cid = ContentId::new("Qm123").unwrap();

        let confirmation = client.write_pointer(&alice(), &cid).await.unwrap();
        assert_eq!(confirmation.cid, cid);
        assert_eq!(confirmation.revision, 1);

        assert_eq!(client.read_pointer(&alice()).await.unwrap(), Some(cid));
    }

    #[tokio::test]
    async fn test_missing_signer_is_invalid_identity() {
        let client = client_with(LocalKeyring::new());
        let cid = ContentId::new("Qm123").unwrap();

        let err = client.write_pointer(&alice(), &cid).await.unwrap_err();
        assert!(matches!(err, CidmarkError::InvalidIdentity(_)));
    }

    fn record(request_id: &str) -> LedgerRecord {
        LedgerRecord {
            identity: "0xA11CE".to_string(),
            value: "Qm123".to_string(),
            revision: 1,
            request_id: request_id.to_string(),
            signature: String::new(),
            written_at: Utc::now(),
        }
    }

    fn signed_with(request_id: Ulid) -> SignedWrite {
        let mut write = PointerWrite::new(alice(), ContentId::new("Qm123").unwrap());
        write.request_id = request_id.to_string();
        SignedWrite {
            write,
            signature: Signature(String::new()),
        }
    }

    #[test]
    fn test_confirm_matching_read_back() {
        let written = record("01A");
        let receipt = confirm(&written, Some(written.clone())).unwrap();
        assert_eq!(receipt.request_id, "01A");
        assert_eq!(receipt.revision, 1);
    }

    #[test]
    fn test_confirm_superseded_read_back() {
        let err = confirm(&record("01A"), Some(record("01B"))).unwrap_err();
        assert!(matches!(err, CidmarkError::LedgerWriteError(_)));
        assert!(err.to_string().contains("superseded by 01B"));
    }

    #[test]
    fn test_confirm_missing_read_back() {
        let err = confirm(&record("01A"), None).unwrap_err();
        assert!(matches!(err, CidmarkError::LedgerWriteError(_)));
    }

    #[test]
    fn test_ensure_newer() {
        let older = Ulid::from_parts(1_000, 7);
        let newer = Ulid::from_parts(2_000, 3);
        let stored = record(&older.to_string());

        assert!(ensure_newer(None, &signed_with(older)).is_ok());
        assert!(ensure_newer(Some(&stored), &signed_with(newer)).is_ok());

        let replay = ensure_newer(Some(&stored), &signed_with(older)).unwrap_err();
        assert!(matches!(replay, CidmarkError::WriteRejected(_)));

        let stored = record(&newer.to_string());
        let rollback = ensure_newer(Some(&stored), &signed_with(older)).unwrap_err();
        assert!(matches!(rollback, CidmarkError::WriteRejected(_)));
    }

    #[test]
    fn test_key_segment_escapes_separators() {
        let tricky = Identity::new("a:b/c").unwrap();
        let segment = key_segment(&tricky);
        assert_eq!(segment, "613a622f63");
        assert!(!segment.contains(':') && !segment.contains('/'));
    }

    struct DecliningSigner(Identity);

    #[async_trait]
    impl Signer for DecliningSigner {
        fn identity(&self) -> &Identity {
            &self.0
        }

        async fn sign(&self, _write: &PointerWrite) -> std::result::Result<Signature, SignerError> {
            Err(SignerError::Cancelled)
        }
    }

    struct DecliningProvider;

    impl SignerProvider for DecliningProvider {
        fn signer_for(&self, identity: &Identity) -> Option<Arc<dyn Signer>> {
            Some(Arc::new(DecliningSigner(identity.clone())))
        }
    }

    #[tokio::test]
    async fn test_declined_signature_is_write_rejected() {
        let backend = Arc::new(MemoryLedger::new(Arc::new(LocalKeyring::new())));
        let client =
            OwnershipLedgerClient::new(backend, Arc::new(DecliningProvider), RetryPolicy::default());

        let err = client
            .write_pointer(&alice(), &ContentId::new("Qm123").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, CidmarkError::WriteRejected(_)));
    }

    struct FlakyReads {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl LedgerBackend for FlakyReads {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn read_raw(&self, _identity: &Identity) -> Result<String> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(CidmarkError::LedgerQueryError("timeout".to_string()));
            }
            Ok(POINTER_SENTINEL.to_string())
        }

        async fn submit(&self, _signed: &SignedWrite) -> Result<Receipt> {
            Err(CidmarkError::LedgerWriteError("read-only".to_string()))
        }
    }

    #[tokio::test]
    async fn test_read_retry_policy() {
        let backend = Arc::new(FlakyReads {
            failures_left: AtomicU32::new(2),
        });
        let signers = Arc::new(LocalKeyring::new());

        let single = OwnershipLedgerClient::new(backend.clone(), signers.clone(), RetryPolicy::default());
        let err = single.read_pointer(&alice()).await.unwrap_err();
        assert!(matches!(err, CidmarkError::LedgerQueryError(_)));

        // one failure left; two attempts are enough
        let retrying =
            OwnershipLedgerClient::new(backend, signers, RetryPolicy::new(2, Duration::ZERO));
        assert_eq!(retrying.read_pointer(&alice()).await.unwrap(), None);
    }
}
