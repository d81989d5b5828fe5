use crate::error::{CidmarkError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire-level value a ledger reports for an identity that never set a pointer.
pub const POINTER_SENTINEL: &str =
    "0x0000000000000000000000000000000000000000000000000000000000000000";

pub fn is_sentinel(raw: &str) -> bool {
    raw.trim().eq_ignore_ascii_case(POINTER_SENTINEL)
}

/// Caller identity, e.g. a wallet address. Immutable for a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into().trim().to_string();
        if value.is_empty() {
            return Err(CidmarkError::InvalidIdentity(
                "identity cannot be empty".to_string(),
            ));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Identity {
    type Error = CidmarkError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Identity> for String {
    fn from(value: Identity) -> Self {
        value.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content identifier produced by a content store. Never empty and never
/// equal to [`POINTER_SENTINEL`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentId(String);

impl ContentId {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into().trim().to_string();
        if value.is_empty() {
            return Err(CidmarkError::InvalidValue(
                "content identifier cannot be empty".to_string(),
            ));
        }
        if is_sentinel(&value) {
            return Err(CidmarkError::InvalidValue(
                "the unset sentinel is not a content identifier".to_string(),
            ));
        }
        Ok(Self(value))
    }

    /// Decode a raw ledger value, mapping the sentinel to `None`.
    pub fn from_wire(raw: &str) -> Result<Option<Self>> {
        if is_sentinel(raw) {
            return Ok(None);
        }
        Self::new(raw).map(Some)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ContentId {
    type Error = CidmarkError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ContentId> for String {
    fn from(value: ContentId) -> Self {
        value.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
