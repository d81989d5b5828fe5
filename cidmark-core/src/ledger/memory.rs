use super::{
    LedgerBackend, LedgerRecord, Receipt, SignatureVerifier, SignedWrite, authorize, ensure_newer,
    record_value,
};
use crate::Result;
use crate::types::Identity;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-process ledger. Writes are serialized by the lock, so the last
/// confirmed write per identity wins.
#[derive(Clone)]
pub struct MemoryLedger {
    records: Arc<RwLock<HashMap<Identity, LedgerRecord>>>,
    verifier: Arc<dyn SignatureVerifier>,
}

impl MemoryLedger {
    pub fn new(verifier: Arc<dyn SignatureVerifier>) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            verifier,
        }
    }

    pub async fn record(&self, identity: &Identity) -> Option<LedgerRecord> {
        self.records.read().await.get(identity).cloned()
    }
}

#[async_trait]
impl LedgerBackend for MemoryLedger {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn read_raw(&self, identity: &Identity) -> Result<String> {
        Ok(record_value(self.record(identity).await))
    }

    async fn submit(&self, signed: &SignedWrite) -> Result<Receipt> {
        authorize(self.verifier.as_ref(), signed)?;

        let mut records = self.records.write().await;
        let previous = records.get(&signed.write.identity);
        ensure_newer(previous, signed)?;
        let revision = previous.map(|record| record.revision + 1).unwrap_or(1);

        let record = LedgerRecord::from_write(signed, revision);
        let receipt = record.receipt();
        records.insert(signed.write.identity.clone(), record);
        Ok(receipt)
    }
}
