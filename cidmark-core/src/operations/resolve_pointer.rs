use crate::{ContentId, Identity, OwnershipLedgerClient, Result};
use std::sync::Arc;

#[derive(Clone)]
pub struct ResolvePointerOperation {
    ledger: Arc<OwnershipLedgerClient>,
}

#[derive(Debug, Clone)]
pub struct ResolvePointerOperationRequest {
    pub identity: Identity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvePointerOperationOutcome {
    Set(ContentId),
    Unset,
}

impl ResolvePointerOperationOutcome {
    pub fn into_pointer(self) -> Option<ContentId> {
        match self {
            Self::Set(cid) => Some(cid),
            Self::Unset => None,
        }
    }
}

impl ResolvePointerOperation {
    pub fn new(ledger: Arc<OwnershipLedgerClient>) -> Self {
        Self { ledger }
    }

    pub async fn run(
        &self,
        request: ResolvePointerOperationRequest,
    ) -> Result<ResolvePointerOperationOutcome> {
        let ResolvePointerOperationRequest { identity } = request;

        let outcome = match self.ledger.read_pointer(&identity).await? {
            Some(cid) => ResolvePointerOperationOutcome::Set(cid),
            None => ResolvePointerOperationOutcome::Unset,
        };

        tracing::info!(identity = %identity, outcome = ?outcome, "resolved ledger pointer");
        Ok(outcome)
    }
}
