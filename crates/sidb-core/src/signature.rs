//! Content signatures for deduplication
//!
//! Every segment written by a backup is identified by the SHA-256 digest of
//! its bytes. The dedup index maps signatures to the chunk holding them.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{Error, Result};

/// SHA-256 digest identifying a deduplicated segment
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature([u8; 32]);

impl Signature {
    /// Compute signature from data
    pub fn from_data(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let result = hasher.finalize();
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&result);
        Self(digest)
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse from hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::InvalidSignature(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(Error::InvalidSignature(format!(
                "Expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&bytes);
        Ok(Self(digest))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Pick one of `partitions` substores for a signature not yet indexed.
    ///
    /// Uses the leading 8 bytes so placement is stable across restarts.
    pub fn partition_index(&self, partitions: usize) -> usize {
        if partitions == 0 {
            return 0;
        }
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&self.0[..8]);
        (u64::from_be_bytes(prefix) % partitions as u64) as usize
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", &self.to_hex()[..16])
    }
}

// Hex on the wire so signatures stay readable in persisted state.
impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Signature::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
