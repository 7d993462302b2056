//! Content addressing for pipeline artifacts.
//!
//! Every artifact identity is a Blake2s-256 digest over a domain tag and the
//! canonical encoding of its upstream inputs, so a change anywhere upstream
//! changes every downstream key.

use std::fmt;

use blake2::{Blake2s256, Digest};
use serde::{Deserialize, Serialize};

/// A 32-byte Blake2s digest identifying an artifact.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub const ZERO: ContentHash = ContentHash([0u8; 32]);

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Self(out))
    }

    /// First 8 hex digits, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.short())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ContentHash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Incremental hasher with length-prefixed fields.
pub struct ContentHasher {
    inner: Blake2s256,
}

impl ContentHasher {
    pub fn new(domain: &str) -> Self {
        let mut inner = Blake2s256::new();
        inner.update((domain.len() as u32).to_le_bytes());
        inner.update(domain.as_bytes());
        Self { inner }
    }

    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.inner.update((data.len() as u64).to_le_bytes());
        self.inner.update(data);
        self
    }

    pub fn hash(self, other: &ContentHash) -> Self {
        self.bytes(&other.0)
    }

    pub fn u64(mut self, v: u64) -> Self {
        self.inner.update(v.to_le_bytes());
        self
    }

    /// Feed the canonical JSON encoding of a value.
    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> Result<Self, serde_json::Error> {
        let encoded = serde_json::to_vec(value)?;
        Ok(self.bytes(&encoded))
    }

    pub fn finish(self) -> ContentHash {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.inner.finalize());
        ContentHash(out)
    }
}

/// Hash a serializable value under a domain tag.
pub fn hash_json<T: Serialize + ?Sized>(
    domain: &str,
    value: &T,
) -> Result<ContentHash, serde_json::Error> {
    Ok(ContentHasher::new(domain).json(value)?.finish())
}
