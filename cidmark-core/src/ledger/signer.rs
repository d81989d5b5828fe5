//! Signer capability for ledger writes.
//!
//! A [`SignerProvider`] hands out a [`Signer`] per identity; ledger backends
//! check submitted writes with a [`SignatureVerifier`]. [`LocalKeyring`] is a
//! shared-secret (HMAC-SHA256) implementation of both sides for
//! single-operator setups.

use crate::types::{ContentId, Identity};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use ulid::Ulid;

/// An unsigned request to set `identity`'s pointer to `value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerWrite {
    pub identity: Identity,
    pub value: ContentId,
    pub request_id: String,
    pub issued_at: DateTime<Utc>,
}

impl PointerWrite {
    pub fn new(identity: Identity, value: ContentId) -> Self {
        Self {
            identity,
            value,
            request_id: Ulid::new().to_string(),
            issued_at: Utc::now(),
        }
    }

    /// Canonical bytes covered by the signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        format!(
            "cidmark:set-pointer:{}:{}:{}:{}",
            self.identity,
            self.value,
            self.request_id,
            self.issued_at.to_rfc3339_opts(SecondsFormat::Nanos, true)
        )
        .into_bytes()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(pub String);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedWrite {
    pub write: PointerWrite,
    pub signature: Signature,
}

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("signer declined: {0}")]
    Declined(String),

    #[error("signing cancelled by user")]
    Cancelled,
}

#[async_trait]
pub trait Signer: Send + Sync {
    fn identity(&self) -> &Identity;

    async fn sign(&self, write: &PointerWrite) -> std::result::Result<Signature, SignerError>;
}

pub trait SignerProvider: Send + Sync {
    fn signer_for(&self, identity: &Identity) -> Option<Arc<dyn Signer>>;
}

pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, signed: &SignedWrite) -> bool;
}

#[derive(Debug, Clone, Default)]
pub struct LocalKeyring {
    secrets: HashMap<Identity, String>,
}

impl LocalKeyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, identity: Identity, secret: impl Into<String>) -> Self {
        self.insert(identity, secret);
        self
    }

    pub fn insert(&mut self, identity: Identity, secret: impl Into<String>) {
        self.secrets.insert(identity, secret.into());
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

type HmacSha256 = Hmac<Sha256>;

fn keyed_mac(secret: &str, write: &PointerWrite) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(&write.signing_bytes());
    Some(mac)
}

impl SignerProvider for LocalKeyring {
    fn signer_for(&self, identity: &Identity) -> Option<Arc<dyn Signer>> {
        let secret = self.secrets.get(identity)?;
        Some(Arc::new(KeyedSigner {
            identity: identity.clone(),
            secret: secret.clone(),
        }))
    }
}

impl SignatureVerifier for LocalKeyring {
    fn verify(&self, signed: &SignedWrite) -> bool {
        self.secrets
            .get(&signed.write.identity)
            .and_then(|secret| keyed_mac(secret, &signed.write))
            .zip(hex::decode(&signed.signature.0).ok())
            .map(|(mac, signature)| mac.verify_slice(&signature).is_ok())
            .unwrap_or(false)
    }
}

struct KeyedSigner {
    identity: Identity,
    secret: String,
}

#[async_trait]
impl Signer for KeyedSigner {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn sign(&self, write: &PointerWrite) -> std::result::Result<Signature, SignerError> {
        if write.identity != self.identity {
            return Err(SignerError::Declined(format!(
                "signer for {} cannot sign as {}",
                self.identity, write.identity
            )));
        }
        let mac = keyed_mac(&self.secret, write)
            .ok_or_else(|| SignerError::Declined("unusable signing key".to_string()))?;
        Ok(Signature(hex::encode(mac.finalize().into_bytes())))
    }
}
