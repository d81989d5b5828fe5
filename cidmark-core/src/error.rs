use crate::types::ContentId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CidmarkError>;

#[derive(Debug, Error)]
pub enum CidmarkError {
    /// The content store node could not be started. Fatal for the session.
    #[error("content store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("content store used before initialize() completed")]
    NotInitialized,

    #[error("sync controller not ready: {0}")]
    NotReady(String),

    #[error("content ingest failed: {0}")]
    IngestError(String),

    #[error("content not found: {0}")]
    ContentNotFound(String),

    #[error("ledger query failed: {0}")]
    LedgerQueryError(String),

    #[error("ledger write rejected: {0}")]
    WriteRejected(String),

    /// Transport failure after submission. The write may or may not have
    /// been confirmed.
    #[error("ledger write outcome unknown: {0}")]
    LedgerWriteError(String),

    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("invalid pointer value: {0}")]
    InvalidValue(String),

    /// Content was stored but the ledger does not reference it.
    #[error("content {cid} stored but ledger write failed: {source}")]
    PublishPartiallyFailed {
        cid: ContentId,
        #[source]
        source: Box<CidmarkError>,
    },

    #[error("operation cancelled")]
    Cancelled { cid: Option<ContentId> },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CidmarkError {
    /// Which stage of the pipeline produced the error.
    pub fn step(&self) -> &'static str {
        match self {
            Self::StoreUnavailable(_) | Self::NotInitialized => "store_init",
            Self::IngestError(_) | Self::ContentNotFound(_) => "store",
            Self::LedgerQueryError(_) => "ledger_read",
            Self::WriteRejected(_)
            | Self::LedgerWriteError(_)
            | Self::InvalidValue(_)
            | Self::PublishPartiallyFailed { .. } => "ledger_write",
            Self::NotReady(_) | Self::InvalidIdentity(_) | Self::Cancelled { .. } => "controller",
            Self::Config(_) => "config",
            Self::Internal(_) | Self::Io(_) | Self::Database(_) | Self::Serialization(_) => {
                "internal"
            }
        }
    }

    /// Whether the caller may retry the failed step without changing inputs.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::IngestError(_) | Self::LedgerQueryError(_) | Self::PublishPartiallyFailed { .. }
        )
    }

    /// Identifier of content that was ingested but is not referenced by the ledger.
    pub fn orphaned_cid(&self) -> Option<&ContentId> {
        match self {
            Self::PublishPartiallyFailed { cid, .. } => Some(cid),
            Self::Cancelled { cid } => cid.as_ref(),
            _ => None,
        }
    }

    pub(crate) fn partially_failed(cid: ContentId, source: CidmarkError) -> Self {
        Self::PublishPartiallyFailed {
            cid,
            source: Box::new(source),
        }
    }
}
