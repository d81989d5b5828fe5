use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use cidmark_core::{
    CidmarkError, ContentId, ContentStoreBackend, ContentStoreClient, Identity, LedgerBackend,
    LocalContentStore, LocalKeyring, MemoryLedger, OwnershipLedgerClient, Receipt, Result,
    RetryPolicy, SignedWrite, StoreHandle, SyncController, SyncPhase, cancellation, compute_hash,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

const ALICE: &str = "0xAB12";

fn alice() -> Identity {
    Identity::new(ALICE).unwrap()
}

/// Store that maps "hello" to "Qm123" and everything else to its SHA256.
#[derive(Default)]
struct ScriptedStore {
    fail_start: bool,
    fail_add: AtomicBool,
    gate: Option<Arc<Notify>>,
    adds: AtomicUsize,
    objects: StdMutex<HashMap<String, Bytes>>,
}

#[async_trait]
impl ContentStoreBackend for ScriptedStore {
    async fn start(&self) -> Result<StoreHandle> {
        if self.fail_start {
            return Err(CidmarkError::StoreUnavailable("no local resources".to_string()));
        }
        Ok(StoreHandle {
            backend: "scripted".to_string(),
            version: "test".to_string(),
            started_at: Utc::now(),
        })
    }

    async fn add(&self, body: Bytes, _name: &str) -> Result<ContentId> {
        self.adds.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail_add.load(Ordering::SeqCst) {
            return Err(CidmarkError::IngestError("disk full".to_string()));
        }

        let cid = if body.as_ref() == b"hello" {
            "Qm123".to_string()
        } else {
            compute_hash(&body)
        };
        self.objects.lock().unwrap().insert(cid.clone(), body);
        ContentId::new(cid)
    }

    async fn get(&self, cid: &ContentId) -> Result<Bytes> {
        self.objects
            .lock()
            .unwrap()
            .get(cid.as_str())
            .cloned()
            .ok_or_else(|| CidmarkError::ContentNotFound(cid.to_string()))
    }
}

enum WriteFault {
    /// Transport fails and the write never lands.
    Lost,
    /// The write lands but the caller sees a transport failure.
    AppliedThenFailed,
    /// The write lands and is confirmed only after a delay.
    SlowConfirm(Duration),
}

struct CountingLedger {
    inner: MemoryLedger,
    reads: AtomicUsize,
    submits: AtomicUsize,
    fault: StdMutex<Option<WriteFault>>,
}

impl CountingLedger {
    fn inject(&self, fault: WriteFault) {
        *self.fault.lock().unwrap() = Some(fault);
    }

    fn calls(&self) -> usize {
        self.reads.load(Ordering::SeqCst) + self.submits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerBackend for CountingLedger {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn read_raw(&self, identity: &Identity) -> Result<String> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read_raw(identity).await
    }

    async fn submit(&self, signed: &SignedWrite) -> Result<Receipt> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        let fault = self.fault.lock().unwrap().take();
        match fault {
            Some(WriteFault::Lost) => Err(CidmarkError::LedgerWriteError(
                "connection reset".to_string(),
            )),
            Some(WriteFault::AppliedThenFailed) => {
                self.inner.submit(signed).await?;
                Err(CidmarkError::LedgerWriteError("timeout awaiting receipt".to_string()))
            }
            Some(WriteFault::SlowConfirm(delay)) => {
                let receipt = self.inner.submit(signed).await?;
                tokio::time::sleep(delay).await;
                Ok(receipt)
            }
            None => self.inner.submit(signed).await,
        }
    }
}

struct Harness {
    controller: Arc<SyncController>,
    ledger: Arc<CountingLedger>,
    client: Arc<OwnershipLedgerClient>,
}

fn harness_with(backend: Arc<dyn ContentStoreBackend>, keyring: LocalKeyring) -> Harness {
    let keyring = Arc::new(keyring);
    let ledger = Arc::new(CountingLedger {
        inner: MemoryLedger::new(keyring.clone()),
        reads: AtomicUsize::new(0),
        submits: AtomicUsize::new(0),
        fault: StdMutex::new(None),
    });
    let client = Arc::new(OwnershipLedgerClient::new(
        ledger.clone(),
        keyring,
        RetryPolicy::default(),
    ));
    let store = Arc::new(ContentStoreClient::new(backend));
    let controller = Arc::new(SyncController::new(store, client.clone()));

    Harness {
        controller,
        ledger,
        client,
    }
}

fn harness(backend: Arc<dyn ContentStoreBackend>) -> Harness {
    harness_with(backend, LocalKeyring::new().with_key(alice(), "alice-secret"))
}

#[tokio::test]
async fn test_fresh_identity_publishes_hello() {
    let h = harness(Arc::new(ScriptedStore::default()));

    let initial = h.controller.start(alice()).await.unwrap();
    assert_eq!(initial, None);

    let cid = tokio_test::assert_ok!(h.controller.publish(&alice(), "hello", "hello.txt").await);
    assert_eq!(cid.as_str(), "Qm123");
    assert_eq!(h.client.read_pointer(&alice()).await.unwrap(), Some(cid.clone()));

    let snapshot = h.controller.snapshot().await;
    assert_eq!(snapshot.phase, SyncPhase::Ready);
    assert!(snapshot.store_ready);
    assert_eq!(snapshot.current_pointer, Some(cid));
}

#[tokio::test]
async fn test_unset_pointer_maps_to_none() {
    let h = harness(Arc::new(ScriptedStore::default()));

    assert_eq!(h.controller.start(alice()).await.unwrap(), None);
    assert_eq!(h.controller.snapshot().await.current_pointer, None);
    assert_eq!(h.ledger.reads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_start_loads_existing_pointer() {
    let h = harness(Arc::new(ScriptedStore::default()));
    let existing = ContentId::new("QmExisting").unwrap();
    h.client.write_pointer(&alice(), &existing).await.unwrap();

    let loaded = h.controller.start(alice()).await.unwrap();
    assert_eq!(loaded, Some(existing.clone()));
    assert_eq!(*h.controller.subscribe().borrow(), Some(existing));
}

#[tokio::test]
async fn test_round_trip_and_last_write_wins_on_local_store() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(Arc::new(LocalContentStore::new(dir.path().to_path_buf())));
    h.controller.start(alice()).await.unwrap();

    let first = h.controller.publish(&alice(), "first file", "a.txt").await.unwrap();
    assert_eq!(h.client.read_pointer(&alice()).await.unwrap(), Some(first.clone()));

    let second = h.controller.publish(&alice(), "second file", "b.txt").await.unwrap();
    assert_ne!(first, second);
    assert_eq!(second.as_str(), compute_hash(b"second file"));
    assert_eq!(h.client.read_pointer(&alice()).await.unwrap(), Some(second.clone()));

    let body = h.controller.store().get(&second).await.unwrap();
    assert_eq!(body, Bytes::from("second file"));
}

#[tokio::test]
async fn test_add_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let store = ContentStoreClient::new(Arc::new(LocalContentStore::new(dir.path().to_path_buf())));
    store.initialize().await.unwrap();

    let payloads: [&[u8]; 3] = [b"", b"hello", &[0u8, 1, 2, 255]];
    for payload in payloads {
        let a = store.add(Bytes::copy_from_slice(payload), "one").await.unwrap();
        let b = store.add(Bytes::copy_from_slice(payload), "two").await.unwrap();
        assert_eq!(a, b);
        assert!(!cidmark_core::is_sentinel(a.as_str()));
    }
}

#[tokio::test]
async fn test_publish_while_cold_never_touches_ledger() {
    let store = Arc::new(ScriptedStore::default());
    let h = harness(store.clone());

    let err = tokio_test::assert_err!(h.controller.publish(&alice(), "hello", "hello.txt").await);
    assert!(matches!(err, CidmarkError::NotReady(_)));
    assert_eq!(h.ledger.calls(), 0);
    assert_eq!(store.adds.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_store_is_terminal() {
    let store = Arc::new(ScriptedStore {
        fail_start: true,
        ..Default::default()
    });
    let h = harness(store.clone());

    let err = h.controller.start(alice()).await.unwrap_err();
    assert!(matches!(err, CidmarkError::StoreUnavailable(_)));
    assert_eq!(h.controller.phase().await, SyncPhase::Failed);

    let err = h.controller.publish(&alice(), "hello", "hello.txt").await.unwrap_err();
    assert!(matches!(err, CidmarkError::StoreUnavailable(_)));

    let err = h.controller.start(alice()).await.unwrap_err();
    assert!(matches!(err, CidmarkError::StoreUnavailable(_)));

    assert_eq!(h.ledger.calls(), 0);
    assert_eq!(store.adds.load(Ordering::SeqCst), 0);
    assert!(!h.controller.snapshot().await.store_ready);
}

#[tokio::test]
async fn test_ingest_failure_leaves_state_unchanged() {
    let store = Arc::new(ScriptedStore::default());
    let h = harness(store.clone());
    h.controller.start(alice()).await.unwrap();
    let before = h.controller.publish(&alice(), "hello", "hello.txt").await.unwrap();

    store.fail_add.store(true, Ordering::SeqCst);
    let err = h.controller.publish(&alice(), "other", "other.txt").await.unwrap_err();

    assert!(matches!(err, CidmarkError::IngestError(_)));
    assert!(err.orphaned_cid().is_none());
    assert_eq!(h.ledger.submits.load(Ordering::SeqCst), 1);
    assert_eq!(h.controller.snapshot().await.current_pointer, Some(before));
}

#[tokio::test]
async fn test_partial_failure_carries_cid_and_write_retry_succeeds() {
    let h = harness(Arc::new(ScriptedStore::default()));
    h.controller.start(alice()).await.unwrap();

    h.ledger.inject(WriteFault::Lost);
    let err = h.controller.publish(&alice(), "hello", "hello.txt").await.unwrap_err();

    let cid = match &err {
        CidmarkError::PublishPartiallyFailed { cid, source } => {
            assert!(matches!(**source, CidmarkError::LedgerWriteError(_)));
            cid.clone()
        }
        other => panic!("unexpected error: {other}"),
    };
    assert_eq!(cid.as_str(), "Qm123");
    assert_eq!(h.controller.snapshot().await.current_pointer, None);
    assert_eq!(h.client.read_pointer(&alice()).await.unwrap(), None);

    // Retrying only the write is enough.
    h.client.write_pointer(&alice(), &cid).await.unwrap();
    assert_eq!(h.client.read_pointer(&alice()).await.unwrap(), Some(cid.clone()));

    let committed = h.controller.commit_pointer(&alice(), cid.clone()).await.unwrap();
    assert_eq!(committed, cid);
    assert_eq!(h.controller.snapshot().await.current_pointer, Some(cid));
}

#[tokio::test]
async fn test_ambiguous_write_is_reconciled_by_requery() {
    let h = harness(Arc::new(ScriptedStore::default()));
    h.controller.start(alice()).await.unwrap();

    h.ledger.inject(WriteFault::AppliedThenFailed);
    let cid = h.controller.publish(&alice(), "hello", "hello.txt").await.unwrap();

    assert_eq!(cid.as_str(), "Qm123");
    assert_eq!(h.controller.snapshot().await.current_pointer, Some(cid));
    // start read + re-query after the ambiguous write
    assert_eq!(h.ledger.reads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_missing_signer_surfaces_partial_failure() {
    let h = harness_with(Arc::new(ScriptedStore::default()), LocalKeyring::new());
    h.controller.start(alice()).await.unwrap();

    let err = h.controller.publish(&alice(), "hello", "hello.txt").await.unwrap_err();
    match err {
        CidmarkError::PublishPartiallyFailed { cid, source } => {
            assert_eq!(cid.as_str(), "Qm123");
            assert!(matches!(*source, CidmarkError::InvalidIdentity(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.ledger.submits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_publish_for_other_identity_is_rejected() {
    let h = harness(Arc::new(ScriptedStore::default()));
    h.controller.start(alice()).await.unwrap();

    let mallory = Identity::new("0xBAD").unwrap();
    let err = h.controller.publish(&mallory, "hello", "hello.txt").await.unwrap_err();
    assert!(matches!(err, CidmarkError::InvalidIdentity(_)));
    assert_eq!(h.ledger.submits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancel_before_publish() {
    let store = Arc::new(ScriptedStore::default());
    let h = harness(store.clone());
    h.controller.start(alice()).await.unwrap();

    let (handle, token) = cancellation();
    handle.cancel();

    let err = h
        .controller
        .publish_with_cancel(&alice(), "hello", "hello.txt", token)
        .await
        .unwrap_err();
    assert!(matches!(err, CidmarkError::Cancelled { cid: None }));
    assert_eq!(store.adds.load(Ordering::SeqCst), 0);
    assert_eq!(h.ledger.submits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancel_during_ingest_never_submits_write() {
    let gate = Arc::new(Notify::new());
    let store = Arc::new(ScriptedStore {
        gate: Some(gate.clone()),
        ..Default::default()
    });
    let h = harness(store.clone());
    h.controller.start(alice()).await.unwrap();

    let (handle, token) = cancellation();
    let controller = h.controller.clone();
    let task = tokio::spawn(async move {
        controller
            .publish_with_cancel(&alice(), "hello", "hello.txt", token)
            .await
    });

    tokio::time::timeout(Duration::from_secs(1), async {
        while store.adds.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    // tearing down the caller drops the handle
    drop(handle);

    let err = tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, CidmarkError::Cancelled { .. }));
    assert_eq!(h.ledger.submits.load(Ordering::SeqCst), 0);
    assert_eq!(h.controller.snapshot().await.current_pointer, None);
}

#[tokio::test]
async fn test_concurrent_publishes_keep_state_and_ledger_in_step() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(Arc::new(LocalContentStore::new(dir.path().to_path_buf())));
    h.controller.start(alice()).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..8 {
        let controller = h.controller.clone();
        tasks.push(tokio::spawn(async move {
            controller
                .publish(&alice(), format!("payload {i}").into_bytes(), "drop.bin")
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let ledger_pointer = h.client.read_pointer(&alice()).await.unwrap();
    assert!(ledger_pointer.is_some());
    assert_eq!(h.controller.snapshot().await.current_pointer, ledger_pointer);
    assert_eq!(h.ledger.submits.load(Ordering::SeqCst), 8);
}

#[tokio::test]
async fn test_subscribers_observe_publishes() {
    let h = harness(Arc::new(ScriptedStore::default()));
    let mut pointer = h.controller.subscribe();
    h.controller.start(alice()).await.unwrap();

    h.controller.publish(&alice(), "hello", "hello.txt").await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), pointer.wait_for(|p| p.is_some()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        pointer.borrow().as_ref().map(ContentId::as_str),
        Some("Qm123")
    );
}

#[tokio::test]
async fn test_dropped_publish_still_records_submitted_write() {
    let h = harness(Arc::new(ScriptedStore::default()));
    h.controller.start(alice()).await.unwrap();
    h.ledger.inject(WriteFault::SlowConfirm(Duration::from_millis(200)));

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        h.controller.publish(&alice(), "hello", "hello.txt"),
    )
    .await;
    assert!(abandoned.is_err());

    let mut pointer = h.controller.subscribe();
    tokio::time::timeout(
        Duration::from_secs(2),
        pointer.wait_for(|cid| cid.is_some()),
    )
    .await
    .unwrap()
    .unwrap();

    let expected = ContentId::new("Qm123").unwrap();
    assert_eq!(h.client.read_pointer(&alice()).await.unwrap(), Some(expected.clone()));
    assert_eq!(h.controller.snapshot().await.current_pointer, Some(expected));
}
