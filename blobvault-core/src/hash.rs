use crate::error::{Result, VaultError};
use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;

pub const HASH_LEN: usize = 20;

/// SHA-1 sized content hash.
///
/// Ordering is the derived array ordering, i.e. unsigned byte-wise
/// lexicographic with the most significant byte first.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash([u8; HASH_LEN]);

impl Hash {
    pub const fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; HASH_LEN] = bytes.try_into().map_err(|_| {
            VaultError::CorruptIndex(format!(
                "hash must be {} bytes, got {}",
                HASH_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short prefix used in log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl FromStr for Hash {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| VaultError::InvalidRequest(format!("invalid hash '{}': {}", s, e)))?;
        Hash::from_slice(&bytes)
            .map_err(|_| VaultError::InvalidRequest(format!("invalid hash length: {}", s)))
    }
}

/// Compute the SHA-1 of `data`.
pub fn sha1_digest(data: &[u8]) -> Hash {
    let mut hasher = Sha1::new();
    hasher.update(data);
    Hash(hasher.finalize().into())
}

/// Incremental SHA-1 over a sequence of blocks.
#[derive(Clone, Default)]
pub struct StreamHasher {
    inner: Sha1,
    bytes: u64,
}

impl StreamHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, block: &[u8]) {
        self.inner.update(block);
        self.bytes += block.len() as u64;
    }

    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> Hash {
        Hash(self.inner.finalize().into())
    }
}
