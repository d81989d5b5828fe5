use crate::{
    CancelToken, CidmarkError, Confirmation, ContentId, ContentStoreClient, Identity,
    OwnershipLedgerClient, Result,
};
use bytes::Bytes;
use std::sync::Arc;

/// Store the bytes, then point the identity's ledger entry at them.
#[derive(Clone)]
pub struct PublishFileOperation {
    store: Arc<ContentStoreClient>,
    ledger: Arc<OwnershipLedgerClient>,
}

#[derive(Debug, Clone)]
pub struct PublishFileOperationRequest {
    pub identity: Identity,
    pub body: Bytes,
    pub name: String,
    pub cancel: CancelToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Confirmed(Confirmation),
    /// The write reported a transport failure, but a re-query shows the
    /// ledger already points at the content.
    Observed,
}

#[derive(Debug, Clone)]
pub struct PublishFileOperationResult {
    pub cid: ContentId,
    pub commit: CommitOutcome,
}

impl PublishFileOperation {
    pub fn new(store: Arc<ContentStoreClient>, ledger: Arc<OwnershipLedgerClient>) -> Self {
        Self { store, ledger }
    }

    /// Store the bytes, honouring `cancel` until the content is ingested and
    /// once more afterwards. Nothing is written to the ledger here; the
    /// returned cid goes to [`run_commit`](Self::run_commit).
    pub async fn ingest(&self, request: PublishFileOperationRequest) -> Result<ContentId> {
        let PublishFileOperationRequest {
            identity,
            body,
            name,
            cancel,
        } = request;

        if cancel.is_cancelled() {
            return Err(CidmarkError::Cancelled { cid: None });
        }

        let cid = tokio::select! {
            biased;
            added = self.store.add(body, &name) => added?,
            _ = cancel.cancelled() => {
                tracing::warn!(identity = %identity, name = %name, "publish cancelled during ingest");
                return Err(CidmarkError::Cancelled { cid: None });
            }
        };

        // Nothing has been submitted to the ledger yet; honour a late cancel.
        if cancel.is_cancelled() {
            tracing::warn!(
                identity = %identity,
                cid = %cid,
                "publish cancelled before ledger write; content left unreferenced"
            );
            return Err(CidmarkError::Cancelled { cid: Some(cid) });
        }

        Ok(cid)
    }

    /// Write an already-ingested `cid` to the ledger. Used both as step two
    /// of a publish and to retry an orphaned identifier.
    pub async fn run_commit(
        &self,
        identity: &Identity,
        cid: ContentId,
    ) -> Result<PublishFileOperationResult> {
        match self.commit(identity, &cid).await {
            Ok(commit) => Ok(PublishFileOperationResult { cid, commit }),
            Err(source) => {
                tracing::error!(
                    identity = %identity,
                    cid = %cid,
                    "ledger write failed after content was stored: {}",
                    source
                );
                Err(CidmarkError::partially_failed(cid, source))
            }
        }
    }

    async fn commit(&self, identity: &Identity, cid: &ContentId) -> Result<CommitOutcome> {
        let reason = match self.ledger.write_pointer(identity, cid).await {
            Ok(confirmation) => return Ok(CommitOutcome::Confirmed(confirmation)),
            Err(CidmarkError::LedgerWriteError(reason)) => reason,
            Err(other) => return Err(other),
        };

        // Ambiguous outcome: ask the ledger before concluding anything.
        tracing::warn!(
            identity = %identity,
            cid = %cid,
            "ledger write outcome unknown, re-querying: {}",
            reason
        );

        match self.ledger.read_pointer(identity).await {
            Ok(Some(current)) if &current == cid => {
                tracing::info!(identity = %identity, cid = %cid, "ledger shows write applied");
                Ok(CommitOutcome::Observed)
            }
            Ok(_) => Err(CidmarkError::LedgerWriteError(reason)),
            Err(query_error) => Err(CidmarkError::LedgerWriteError(format!(
                "{}; re-query failed: {}",
                reason, query_error
            ))),
        }
    }
}
