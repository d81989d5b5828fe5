use super::{
    LedgerBackend, LedgerRecord, Receipt, SignatureVerifier, SignedWrite, authorize, confirm,
    decode_record, ensure_newer, key_segment, record_value,
};
use crate::types::Identity;
use crate::{CidmarkError, Result};
use async_trait::async_trait;
use etcd_client::Client;
use std::sync::Arc;

fn pointer_key(namespace: &str, identity: &Identity) -> String {
    format!("/cidmark/{}/pointers/{}", namespace, key_segment(identity))
}

/// Ledger backed by etcd keys under `/cidmark/{namespace}/pointers/`.
pub struct EtcdLedger {
    client: Client,
    namespace: String,
    verifier: Arc<dyn SignatureVerifier>,
}

impl EtcdLedger {
    pub async fn new(
        endpoints: &[String],
        namespace: &str,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Result<Self> {
        let client = Client::connect(endpoints, None).await.map_err(|error| {
            CidmarkError::LedgerQueryError(format!("etcd connection failed: {}", error))
        })?;

        tracing::info!("Connected to etcd ledger at {:?}, namespace={}", endpoints, namespace);

        Ok(Self {
            client,
            namespace: namespace.to_string(),
            verifier,
        })
    }

    async fn load_record(&self, identity: &Identity) -> Result<Option<LedgerRecord>> {
        let mut client = self.client.clone();
        let response = client
            .get(pointer_key(&self.namespace, identity), None)
            .await
            .map_err(|error| CidmarkError::LedgerQueryError(format!("etcd get failed: {}", error)))?;

        response
            .kvs()
            .first()
            .map(|kv| decode_record(kv.value()))
            .transpose()
    }
}

#[async_trait]
impl LedgerBackend for EtcdLedger {
    fn name(&self) -> &'static str {
        "etcd"
    }

    async fn read_raw(&self, identity: &Identity) -> Result<String> {
        Ok(record_value(self.load_record(identity).await?))
    }

    async fn submit(&self, signed: &SignedWrite) -> Result<Receipt> {
        authorize(self.verifier.as_ref(), signed)?;

        let identity = &signed.write.identity;
        let previous = self
            .load_record(identity)
            .await
            .map_err(|error| CidmarkError::LedgerWriteError(error.to_string()))?;
        ensure_newer(previous.as_ref(), signed)?;
        let revision = previous.map(|record| record.revision + 1).unwrap_or(1);

        let record = LedgerRecord::from_write(signed, revision);
        let payload = serde_json::to_vec(&record)?;

        let mut client = self.client.clone();
        client
            .put(pointer_key(&self.namespace, identity), payload, None)
            .await
            .map_err(|error| CidmarkError::LedgerWriteError(format!("etcd put failed: {}", error)))?;

        // Confirm by reading back.
        let stored = self
            .load_record(identity)
            .await
            .map_err(|error| CidmarkError::LedgerWriteError(error.to_string()))?;

        confirm(&record, stored)
    }
}
