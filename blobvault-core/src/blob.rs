use crate::encoding::{DictReader, DictWriter, decode_hashes, encode_hashes, enum_decode, enum_encode};
use crate::error::{Result, VaultError};
use crate::hash::Hash;
use std::collections::BTreeMap;
use std::fmt;

/// What a blob's bytes mean, which decides how its references expand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BlobType {
    Simple,
    FileBlob,
    BackupRecord,
    MetadataNode,
}

impl BlobType {
    fn code(self) -> u8 {
        match self {
            BlobType::Simple => 0,
            BlobType::FileBlob => 1,
            BlobType::BackupRecord => 2,
            BlobType::MetadataNode => 3,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(BlobType::Simple),
            1 => Ok(BlobType::FileBlob),
            2 => Ok(BlobType::BackupRecord),
            3 => Ok(BlobType::MetadataNode),
            other => Err(VaultError::CorruptIndex(format!("unknown blob type {}", other))),
        }
    }
}

/// Key under which a backup set holds references to a blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackupSetReference {
    pub backup_set: String,
    /// Bookkeeping only: the holder does not own the blob's bytes.
    pub shallow: bool,
    /// Records blobs a remote destination is already known to hold.
    pub bloblist_cache: bool,
}

impl BackupSetReference {
    pub fn new(backup_set: impl Into<String>) -> Self {
        Self {
            backup_set: backup_set.into(),
            shallow: false,
            bloblist_cache: false,
        }
    }

    pub fn shallow(backup_set: impl Into<String>) -> Self {
        Self {
            backup_set: backup_set.into(),
            shallow: true,
            bloblist_cache: false,
        }
    }

    pub fn bloblist_cache(backup_set: impl Into<String>) -> Self {
        Self {
            backup_set: backup_set.into(),
            shallow: true,
            bloblist_cache: true,
        }
    }

    /// The bloblist-cache marker for this reference's backup set name.
    pub fn bloblist_marker(&self) -> Self {
        Self::bloblist_cache(self.backup_set.clone())
    }

    fn encode(&self, count: u64) -> Vec<u8> {
        DictWriter::new()
            .str("BackupSet-v1", &self.backup_set)
            .bool("Shallow-v1", self.shallow)
            .bool("BloblistCache-v1", self.bloblist_cache)
            .u64("Count-v1", count)
            .finish()
    }

    fn decode(data: &[u8]) -> Result<(Self, u64)> {
        let dict = DictReader::decode(data)?;
        let backup_set = dict
            .str("BackupSet-v1")?
            .ok_or_else(|| VaultError::CorruptIndex("reference without backup set".into()))?;
        let reference = Self {
            backup_set,
            shallow: dict.bool("Shallow-v1")?.unwrap_or(false),
            bloblist_cache: dict.bool("BloblistCache-v1")?.unwrap_or(false),
        };
        Ok((reference, dict.u64("Count-v1")?.unwrap_or(0)))
    }
}

impl fmt::Display for BackupSetReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.backup_set)?;
        if self.bloblist_cache {
            f.write_str(" (bloblist cache)")
        } else if self.shallow {
            f.write_str(" (shallow)")
        } else {
            Ok(())
        }
    }
}

/// Index record for one hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobLocation {
    pub blob_type: BlobType,
    /// Storage path of the bytes; `None` when nothing is physically stored
    /// (multi-block references and shallow-only blobs).
    pub relative_path: Option<String>,
    pub byte_length: u64,
    /// Ordered child blocks; present only for multi-block references.
    pub block_hashes: Option<Vec<Hash>>,
    pub reference_frequencies: BTreeMap<BackupSetReference, u64>,
}

impl BlobLocation {
    pub fn new(blob_type: BlobType, relative_path: Option<String>, byte_length: u64) -> Self {
        Self {
            blob_type,
            relative_path,
            byte_length,
            block_hashes: None,
            reference_frequencies: BTreeMap::new(),
        }
    }

    pub fn multi_block(blob_type: BlobType, block_hashes: Vec<Hash>, byte_length: u64) -> Self {
        Self {
            blob_type,
            relative_path: None,
            byte_length,
            block_hashes: Some(block_hashes),
            reference_frequencies: BTreeMap::new(),
        }
    }

    pub fn is_multi_block(&self) -> bool {
        self.block_hashes.is_some()
    }

    pub fn has_stored_bytes(&self) -> bool {
        self.relative_path.is_some()
    }

    pub fn total_references(&self) -> u64 {
        self.reference_frequencies.values().sum()
    }

    pub fn total_non_shallow_references(&self) -> u64 {
        self.reference_frequencies
            .iter()
            .filter(|(set, _)| !set.shallow)
            .map(|(_, count)| *count)
            .sum()
    }

    pub fn reference_count(&self, set: &BackupSetReference) -> u64 {
        self.reference_frequencies.get(set).copied().unwrap_or(0)
    }

    /// Apply `delta` to `set`'s count, dropping the entry at zero.
    pub fn apply_delta(&mut self, set: &BackupSetReference, delta: i64) -> Result<u64> {
        let current = self.reference_count(set);
        let updated = (current as i64).checked_add(delta).filter(|n| *n >= 0).ok_or_else(|| {
            VaultError::InvariantViolation(format!(
                "reference count for {} would become {} + {}",
                set, current, delta
            ))
        })? as u64;
        if updated == 0 {
            self.reference_frequencies.remove(set);
        } else {
            self.reference_frequencies.insert(set.clone(), updated);
        }
        Ok(updated)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = DictWriter::new();
        writer
            .bytes("BlobType-v1", &[self.blob_type.code()])
            .u64("ByteLength-v1", self.byte_length);
        if let Some(path) = &self.relative_path {
            writer.str("RelativeFilePath-v1", path);
        }
        if let Some(blocks) = &self.block_hashes {
            writer.bytes("BlockHashes-v1", &encode_hashes(blocks));
        }
        let references = enum_encode(
            self.reference_frequencies
                .iter()
                .map(|(set, count)| set.encode(*count)),
        );
        writer.bytes("ReferenceFrequencies-v1", &references);
        writer.finish()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let dict = DictReader::decode(data)?;
        let blob_type = match dict.get("BlobType-v1") {
            Some([code]) => BlobType::from_code(*code)?,
            Some(_) => return Err(VaultError::CorruptIndex("malformed blob type".into())),
            None => BlobType::Simple,
        };
        let block_hashes = dict.get("BlockHashes-v1").map(decode_hashes).transpose()?;

        let mut reference_frequencies = BTreeMap::new();
        if let Some(raw) = dict.get("ReferenceFrequencies-v1") {
            for entry in enum_decode(raw)? {
                let (set, count) = BackupSetReference::decode(entry)?;
                if count > 0 {
                    reference_frequencies.insert(set, count);
                }
            }
        }

        Ok(Self {
            blob_type,
            relative_path: dict.str("RelativeFilePath-v1")?,
            byte_length: dict.u64("ByteLength-v1")?.unwrap_or(0),
            block_hashes,
            reference_frequencies,
        })
    }
}
