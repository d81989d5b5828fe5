//! Cidmark Core - publish a file to a content-addressed store and record a
//! pointer to it in a per-identity ownership ledger.
//!
//! - [`ContentStoreClient`]: owns the store node, "add bytes -> content id"
//! - [`OwnershipLedgerClient`]: read/write the identity -> content id pointer
//! - [`SyncController`]: sequences the two and caches the session's pointer

pub mod cancel;
pub mod error;
pub mod ledger;
pub mod operations;
pub mod store;
pub mod sync;
pub mod types;

pub use cancel::{CancelHandle, CancelToken, cancellation};
pub use error::{CidmarkError, Result};
pub use ledger::{
    Confirmation, EtcdLedger, LedgerBackend, LedgerBuilder, LedgerRecord, LocalKeyring,
    MemoryLedger, OwnershipLedgerClient, PointerWrite, Receipt, RedisLedger, RetryPolicy,
    Signature, SignatureVerifier, SignedWrite, Signer, SignerError, SignerProvider,
};
pub use store::{
    ContentStoreBackend, ContentStoreBuilder, ContentStoreClient, IpfsHttpStore,
    LocalContentStore, StoreHandle, StoredObject, compute_hash, verify_hash,
};
pub use sync::{SyncController, SyncPhase, SyncSnapshot};
pub use types::{ContentId, Identity, POINTER_SENTINEL, is_sentinel};
