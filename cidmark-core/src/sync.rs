//! Session controller sequencing the content store and the ownership ledger.
//!
//! ```text
//! Cold -> Initializing -> Ready
//!              \-> Failed (terminal)
//! ```
//!
//! The ledger is the durable source of truth; [`SyncSnapshot::current_pointer`]
//! caches it for the session.

use crate::operations::{
    PublishFileOperation, PublishFileOperationRequest, PublishFileOperationResult,
    ResolvePointerOperation, ResolvePointerOperationRequest,
};
use crate::{
    CancelToken, CidmarkError, ContentId, ContentStoreClient, Identity, OwnershipLedgerClient,
    Result,
};
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Cold,
    Initializing,
    Ready,
    Failed,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Cold => "cold",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncSnapshot {
    pub phase: SyncPhase,
    pub identity: Option<Identity>,
    pub current_pointer: Option<ContentId>,
    pub store_ready: bool,
}

struct SyncState {
    phase: SyncPhase,
    identity: Option<Identity>,
    current_pointer: Option<ContentId>,
    store_ready: bool,
    failure: Option<String>,
}

/// Session state shared with detached ledger commits.
struct Shared {
    state: Mutex<SyncState>,
    pointer_tx: watch::Sender<Option<ContentId>>,
}

impl Shared {
    async fn set_current_pointer(&self, pointer: Option<ContentId>) {
        let mut state = self.state.lock().await;
        state.current_pointer = pointer.clone();
        self.pointer_tx.send_replace(pointer);
    }

    async fn apply(&self, result: PublishFileOperationResult) -> ContentId {
        tracing::info!(cid = %result.cid, commit = ?result.commit, "pointer published");
        self.set_current_pointer(Some(result.cid.clone())).await;
        result.cid
    }
}

pub struct SyncController {
    store: Arc<ContentStoreClient>,
    publish_op: PublishFileOperation,
    resolve_op: ResolvePointerOperation,
    shared: Arc<Shared>,
    // Serializes ledger-touching pipelines so confirmation order and
    // SyncState updates agree.
    pipeline: Arc<Mutex<()>>,
}

impl SyncController {
    pub fn new(store: Arc<ContentStoreClient>, ledger: Arc<OwnershipLedgerClient>) -> Self {
        let (pointer_tx, _) = watch::channel(None);
        Self {
            publish_op: PublishFileOperation::new(store.clone(), ledger.clone()),
            resolve_op: ResolvePointerOperation::new(ledger),
            store,
            shared: Arc::new(Shared {
                state: Mutex::new(SyncState {
                    phase: SyncPhase::Cold,
                    identity: None,
                    current_pointer: None,
                    store_ready: false,
                    failure: None,
                }),
                pointer_tx,
            }),
            pipeline: Arc::new(Mutex::new(())),
        }
    }

    pub fn store(&self) -> &Arc<ContentStoreClient> {
        &self.store
    }

    /// Follow `current_pointer` as it changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<ContentId>> {
        self.shared.pointer_tx.subscribe()
    }

    pub async fn snapshot(&self) -> SyncSnapshot {
        let state = self.shared.state.lock().await;
        SyncSnapshot {
            phase: state.phase,
            identity: state.identity.clone(),
            current_pointer: state.current_pointer.clone(),
            store_ready: state.store_ready,
        }
    }

    pub async fn phase(&self) -> SyncPhase {
        self.shared.state.lock().await.phase
    }

    /// Bring the session up for `identity`: initialize the store, then load
    /// the identity's pointer. Calling again once ready only reloads.
    pub async fn start(&self, identity: Identity) -> Result<Option<ContentId>> {
        {
            let mut state = self.shared.state.lock().await;
            match state.phase {
                SyncPhase::Cold => {
                    state.phase = SyncPhase::Initializing;
                    state.identity = Some(identity.clone());
                }
                SyncPhase::Initializing => {
                    return Err(CidmarkError::NotReady(
                        "store initialization already in progress".to_string(),
                    ));
                }
                SyncPhase::Failed => {
                    return Err(CidmarkError::StoreUnavailable(
                        state.failure.clone().unwrap_or_default(),
                    ));
                }
                SyncPhase::Ready => {
                    check_session(state.identity.as_ref(), &identity)?;
                    drop(state);
                    return self.load_current_pointer().await;
                }
            }
        }

        tracing::info!(identity = %identity, "starting sync session");

        match self.store.initialize().await {
            Ok(_) => {
                let mut state = self.shared.state.lock().await;
                state.phase = SyncPhase::Ready;
                state.store_ready = true;
                tracing::info!(identity = %identity, "sync session ready");
            }
            Err(error) => {
                let error = match error {
                    CidmarkError::StoreUnavailable(_) => error,
                    other => CidmarkError::StoreUnavailable(other.to_string()),
                };
                let mut state = self.shared.state.lock().await;
                state.phase = SyncPhase::Failed;
                state.failure = Some(error.to_string());
                tracing::error!(identity = %identity, "sync session failed: {}", error);
                return Err(error);
            }
        }

        self.load_current_pointer().await
    }

    /// Re-read the session identity's pointer from the ledger.
    pub async fn load_current_pointer(&self) -> Result<Option<ContentId>> {
        let identity = self.ready_identity().await?;
        let _pipeline = self.pipeline.lock().await;

        let pointer = self
            .resolve_op
            .run(ResolvePointerOperationRequest { identity })
            .await?
            .into_pointer();

        self.shared.set_current_pointer(pointer.clone()).await;
        Ok(pointer)
    }

    pub async fn publish(
        &self,
        identity: &Identity,
        body: impl Into<Bytes>,
        name: &str,
    ) -> Result<ContentId> {
        self.publish_with_cancel(identity, body, name, CancelToken::never())
            .await
    }

    /// Add `body` to the store and point `identity` at it. Cancelling the
    /// token before the ledger write is submitted stops the pipeline with
    /// `Cancelled`. The ledger write and the state update run on their own
    /// task, so they complete even if this future is dropped.
    pub async fn publish_with_cancel(
        &self,
        identity: &Identity,
        body: impl Into<Bytes>,
        name: &str,
        cancel: CancelToken,
    ) -> Result<ContentId> {
        let session = self.ready_identity().await?;
        check_session(Some(&session), identity)?;

        let pipeline = tokio::select! {
            biased;
            guard = self.pipeline.clone().lock_owned() => guard,
            _ = cancel.cancelled() => return Err(CidmarkError::Cancelled { cid: None }),
        };

        let cid = self
            .publish_op
            .ingest(PublishFileOperationRequest {
                identity: session.clone(),
                body: body.into(),
                name: name.to_string(),
                cancel,
            })
            .await?;

        self.commit_detached(pipeline, session, cid).await
    }

    /// Retry only the ledger write for content that is already stored, e.g.
    /// the `cid` carried by `PublishPartiallyFailed`.
    pub async fn commit_pointer(&self, identity: &Identity, cid: ContentId) -> Result<ContentId> {
        let session = self.ready_identity().await?;
        check_session(Some(&session), identity)?;

        let pipeline = self.pipeline.clone().lock_owned().await;
        self.commit_detached(pipeline, session, cid).await
    }

    /// Write `cid` to the ledger and record it, on a task that owns the
    /// pipeline lock until the state reflects the ledger's answer.
    async fn commit_detached(
        &self,
        pipeline: OwnedMutexGuard<()>,
        identity: Identity,
        cid: ContentId,
    ) -> Result<ContentId> {
        let publish_op = self.publish_op.clone();
        let shared = self.shared.clone();

        let task = tokio::spawn(async move {
            let _pipeline = pipeline;
            let result = publish_op.run_commit(&identity, cid).await?;
            Ok::<_, CidmarkError>(shared.apply(result).await)
        });

        task.await
            .map_err(|e| CidmarkError::Internal(format!("ledger commit task failed: {}", e)))?
    }

    async fn ready_identity(&self) -> Result<Identity> {
        let state = self.shared.state.lock().await;
        match state.phase {
            SyncPhase::Ready => state
                .identity
                .clone()
                .ok_or_else(|| CidmarkError::Internal("ready session without identity".to_string())),
            SyncPhase::Failed => Err(CidmarkError::StoreUnavailable(
                state.failure.clone().unwrap_or_default(),
            )),
            phase => Err(CidmarkError::NotReady(format!("session is {}", phase))),
        }
    }
}

fn check_session(session: Option<&Identity>, identity: &Identity) -> Result<()> {
    match session {
        Some(session) if session == identity => Ok(()),
        Some(session) => Err(CidmarkError::InvalidIdentity(format!(
            "session belongs to {}, not {}",
            session, identity
        ))),
        None => Err(CidmarkError::NotReady("no session identity".to_string())),
    }
}
