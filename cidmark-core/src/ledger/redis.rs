use super::{
    LedgerBackend, LedgerRecord, Receipt, SignatureVerifier, SignedWrite, authorize, confirm,
    decode_record, ensure_newer, key_segment, record_value,
};
use crate::types::Identity;
use crate::{CidmarkError, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::sync::Arc;

fn pointer_key(namespace: &str, identity: &Identity) -> String {
    format!("cidmark:{}:pointer:{}", namespace, key_segment(identity))
}

fn revision_key(namespace: &str, identity: &Identity) -> String {
    format!("cidmark:{}:revision:{}", namespace, key_segment(identity))
}

/// Ledger backed by Redis keys under `cidmark:{namespace}:`.
pub struct RedisLedger {
    conn: ConnectionManager,
    namespace: String,
    verifier: Arc<dyn SignatureVerifier>,
}

impl RedisLedger {
    pub async fn new(
        url: &str,
        namespace: &str,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|error| CidmarkError::Config(format!("invalid redis url: {}", error)))?;

        let conn = ConnectionManager::new(client).await.map_err(|error| {
            CidmarkError::LedgerQueryError(format!("redis connection failed: {}", error))
        })?;

        tracing::info!("Connected to redis ledger, namespace={}", namespace);

        Ok(Self {
            conn,
            namespace: namespace.to_string(),
            verifier,
        })
    }

    async fn load_record(&self, identity: &Identity) -> Result<Option<LedgerRecord>> {
        let mut conn = self.conn.clone();
        let payload: Option<Vec<u8>> = conn.get(pointer_key(&self.namespace, identity)).await.map_err(|error| {
            CidmarkError::LedgerQueryError(format!("redis GET failed: {}", error))
        })?;

        payload.as_deref().map(decode_record).transpose()
    }
}

#[async_trait]
impl LedgerBackend for RedisLedger {
    fn name(&self) -> &'static str {
        "redis"
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

        let mut conn = self.conn.clone();

        let revision: u64 = conn
            .incr(revision_key(&self.namespace, identity), 1u64)
            .await
            .map_err(|error| CidmarkError::LedgerWriteError(format!("redis INCR failed: {}", error)))?;

        let record = LedgerRecord::from_write(signed, revision);
        let payload = serde_json::to_vec(&record)?;

        conn.set::<_, _, ()>(pointer_key(&self.namespace, identity), payload)
            .await
            .map_err(|error| CidmarkError::LedgerWriteError(format!("redis SET failed: {}", error)))?;

        // Confirm by reading back.
        let stored = self
            .load_record(identity)
            .await
            .map_err(|error| CidmarkError::LedgerWriteError(error.to_string()))?;

        confirm(&record, stored)
    }
}
