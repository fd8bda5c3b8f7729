//! Backup records and the named backup sets that list them.

use crate::blob::{BackupSetReference, BlobType};
use crate::blob_store::{BlobStore, TransferSummary};
use crate::encoding::{DictReader, DictWriter, enum_decode, enum_encode};
use crate::error::{Result, VaultError};
use crate::hash::{HASH_LEN, Hash};
use crate::tree::MetadataNode;
use bytes::Bytes;
use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use ulid::Ulid;

const METADATA_TREE_HASH: &str = "MetadataTreeHash-v1";

/// One snapshot: a message, a time and the root of its metadata tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub id: Ulid,
    pub message: String,
    pub backup_time: DateTime<Utc>,
    pub metadata_tree_hash: Hash,
}

impl BackupRecord {
    pub fn new(message: impl Into<String>, metadata_tree_hash: Hash) -> Self {
        Self {
            id: Ulid::new(),
            message: message.into(),
            // Stored with microsecond precision.
            backup_time: Utc::now().trunc_subsecs(6),
            metadata_tree_hash,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        DictWriter::new()
            .str("Message-v1", &self.message)
            .i64("BackupTime-v1", self.backup_time.timestamp_micros())
            .hash(METADATA_TREE_HASH, &self.metadata_tree_hash)
            .bytes("Id-v1", &self.id.to_bytes())
            .finish()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let dict = DictReader::decode(data)?;
        let id = match dict.get("Id-v1") {
            Some(raw) => {
                let bytes: [u8; 16] = raw
                    .try_into()
                    .map_err(|_| VaultError::CorruptIndex("backup id is not 16 bytes".into()))?;
                Ulid::from_bytes(bytes)
            }
            None => Ulid::nil(),
        };
        let micros = dict.i64("BackupTime-v1")?.unwrap_or(0);
        let backup_time = DateTime::from_timestamp_micros(micros)
            .ok_or_else(|| VaultError::CorruptIndex("backup time out of range".into()))?;
        Ok(Self {
            id,
            message: dict.str("Message-v1")?.unwrap_or_default(),
            backup_time,
            metadata_tree_hash: Self::tree_hash_of(data)?,
        })
    }

    /// Read only the metadata tree root out of an encoded record.
    pub fn tree_hash_of(data: &[u8]) -> Result<Hash> {
        DictReader::decode(data)?
            .hash(METADATA_TREE_HASH)?
            .ok_or_else(|| VaultError::CorruptIndex("backup record without tree hash".into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupEntry {
    pub hash: Hash,
    /// Only the metadata is held; file contents live elsewhere.
    pub shallow: bool,
}

/// Ordered list of backups, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupSet {
    pub backups: Vec<BackupEntry>,
    /// Set once the set has been mirrored into a local cache.
    pub cache_used: bool,
}

impl BackupSet {
    pub fn latest(&self) -> Option<&BackupEntry> {
        self.backups.last()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.backups.iter().any(|entry| entry.hash == *hash)
    }

    pub fn encode(&self) -> Vec<u8> {
        let entries = self.backups.iter().map(|entry| {
            let mut raw = entry.hash.as_bytes().to_vec();
            raw.push(u8::from(entry.shallow));
            raw
        });
        DictWriter::new()
            .bytes("Backups-v1", &enum_encode(entries))
            .bool("CacheUsed-v1", self.cache_used)
            .finish()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let dict = DictReader::decode(data)?;
        let mut backups = Vec::new();
        if let Some(raw) = dict.get("Backups-v1") {
            for entry in enum_decode(raw)? {
                let (hash, flag) = match entry {
                    [hash @ .., flag] if hash.len() == HASH_LEN => (hash, *flag),
                    _ => return Err(VaultError::CorruptIndex("malformed backup entry".into())),
                };
                backups.push(BackupEntry {
                    hash: Hash::from_slice(hash)?,
                    shallow: flag != 0,
                });
            }
        }
        Ok(Self {
            backups,
            cache_used: dict.bool("CacheUsed-v1")?.unwrap_or(false),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheSyncSummary {
    pub backups_added: usize,
    pub backups_removed: usize,
    pub blobs_marked: u64,
}

/// Set names become backend index file names.
pub fn validate_set_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(VaultError::InvalidRequest(format!(
            "invalid backup set name: {:?}",
            name
        )))
    }
}

fn set_index_name(name: &str) -> String {
    format!("backupset-{}", name)
}

/// Backup sets over one blob store.
pub struct BackupCatalog {
    blobs: Arc<BlobStore>,
    sets: Mutex<BTreeMap<String, BackupSet>>,
}

impl BackupCatalog {
    pub fn new(blobs: Arc<BlobStore>) -> Self {
        Self {
            blobs,
            sets: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn blob_store(&self) -> &Arc<BlobStore> {
        &self.blobs
    }

    pub fn backup_set(&self, name: &str) -> Option<BackupSet> {
        self.sets.lock().get(name).cloned()
    }

    pub fn set_names(&self) -> Vec<String> {
        self.sets.lock().keys().cloned().collect()
    }

    fn entry(&self, set: &str, hash: &Hash) -> Result<BackupEntry> {
        self.sets
            .lock()
            .get(set)
            .and_then(|backups| backups.backups.iter().find(|e| e.hash == *hash).copied())
            .ok_or_else(|| {
                VaultError::InvalidRequest(format!("backup {} is not in set {}", hash.short(), set))
            })
    }

    fn push_entry(&self, set: &str, entry: BackupEntry) {
        self.sets
            .lock()
            .entry(set.to_string())
            .or_default()
            .backups
            .push(entry);
    }

    /// Store `tree` and a record pointing at it, and append it to `set`.
    pub async fn add_backup(&self, set: &str, message: &str, tree: &MetadataNode) -> Result<Hash> {
        validate_set_name(set)?;
        let reference = BackupSetReference::new(set);
        let (tree_hash, _) = self.blobs.store_metadata_tree(&reference, tree).await?;
        let record = BackupRecord::new(message, tree_hash);
        let hash = self
            .blobs
            .store_data(&reference, record.encode(), BlobType::BackupRecord)
            .await?;
        self.push_entry(set, BackupEntry { hash, shallow: false });
        tracing::info!("Added backup {} to set {}", hash.short(), set);
        Ok(hash)
    }

    pub async fn load_record(&self, hash: &Hash) -> Result<BackupRecord> {
        BackupRecord::decode(&self.blobs.retrieve_data(hash).await?)
    }

    pub async fn load_tree(&self, record: &BackupRecord) -> Result<MetadataNode> {
        MetadataNode::load(&self.blobs, record.metadata_tree_hash).await
    }

    pub async fn list_backups(&self, set: &str) -> Result<Vec<(BackupEntry, BackupRecord)>> {
        let entries = self.backup_set(set).unwrap_or_default().backups;
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let record = self.load_record(&entry.hash).await?;
            out.push((entry, record));
        }
        Ok(out)
    }

    pub async fn latest_backup(&self, set: &str) -> Result<Option<(Hash, BackupRecord)>> {
        let Some(entry) = self.backup_set(set).and_then(|s| s.latest().copied()) else {
            return Ok(None);
        };
        Ok(Some((entry.hash, self.load_record(&entry.hash).await?)))
    }

    /// Look a backup up by full hash or unambiguous hex prefix.
    pub async fn get_backup(&self, set: &str, prefix: &str) -> Result<(Hash, BackupRecord)> {
        let prefix = prefix.to_ascii_lowercase();
        let matches: Vec<Hash> = self
            .backup_set(set)
            .unwrap_or_default()
            .backups
            .iter()
            .map(|entry| entry.hash)
            .filter(|hash| hash.to_hex().starts_with(&prefix))
            .collect();
        match matches.as_slice() {
            [hash] => Ok((*hash, self.load_record(hash).await?)),
            [] => Err(VaultError::InvalidRequest(format!(
                "no backup in {} matches {}",
                set, prefix
            ))),
            _ => Err(VaultError::InvalidRequest(format!(
                "{} backups in {} match {}",
                matches.len(),
                set,
                prefix
            ))),
        }
    }

    /// Drop a backup and release every reference it holds.
    pub async fn remove_backup(&self, set: &str, hash: &Hash) -> Result<()> {
        let entry = self.entry(set, hash)?;
        self.blobs
            .increment_reference_count(&BackupSetReference::new(set), hash, -1, !entry.shallow)
            .await?;
        if let Some(backups) = self.sets.lock().get_mut(set) {
            if let Some(pos) = backups.backups.iter().position(|e| e.hash == *hash) {
                backups.backups.remove(pos);
            }
        }
        tracing::info!("Removed backup {} from set {}", hash.short(), set);
        Ok(())
    }

    /// Copy a backup into another catalog's store and set. Without files
    /// the destination entry is shallow.
    pub async fn transfer_backup(
        &self,
        set: &str,
        hash: &Hash,
        dst: &BackupCatalog,
        dst_set: &str,
        include_files: bool,
    ) -> Result<TransferSummary> {
        validate_set_name(dst_set)?;
        self.entry(set, hash)?;
        if dst.backup_set(dst_set).is_some_and(|s| s.contains(hash)) {
            return Err(VaultError::InvalidRequest(format!(
                "backup {} is already in {}",
                hash.short(),
                dst_set
            )));
        }
        let summary = self
            .blobs
            .transfer_blob_and_references(
                &dst.blobs,
                &BackupSetReference::new(dst_set),
                hash,
                BlobType::BackupRecord,
                include_files,
            )
            .await?;
        dst.push_entry(
            dst_set,
            BackupEntry {
                hash: *hash,
                shallow: !include_files,
            },
        );
        Ok(summary)
    }

    /// Mirror `remote`'s set into this catalog as shallow backups and record
    /// which blobs the remote holds, so later local writes of the same
    /// content can skip storing bytes.
    pub async fn sync_cache_from(&self, remote: &BackupCatalog, set: &str) -> Result<CacheSyncSummary> {
        validate_set_name(set)?;
        let remote_set = remote.backup_set(set).unwrap_or_default();
        let local_set = self.backup_set(set).unwrap_or_default();
        let mut summary = CacheSyncSummary::default();

        let stale: Vec<Hash> = local_set
            .backups
            .iter()
            .filter(|entry| !remote_set.contains(&entry.hash))
            .map(|entry| entry.hash)
            .collect();
        for hash in &stale {
            self.remove_backup(set, hash).await?;
            summary.backups_removed += 1;
        }
        if !stale.is_empty() {
            self.blobs.clear_bloblist_cache(set).await?;
        }

        for entry in &remote_set.backups {
            if !local_set.contains(&entry.hash) {
                remote.transfer_backup(set, &entry.hash, self, set, false).await?;
                summary.backups_added += 1;
            }
            if !local_set.contains(&entry.hash) || !stale.is_empty() {
                summary.blobs_marked += remote
                    .blobs
                    .cache_bloblist(&self.blobs, set, &entry.hash, BlobType::BackupRecord)
                    .await?;
            }
        }

        // Follow the remote's order.
        {
            let mut sets = self.sets.lock();
            let local = sets.entry(set.to_string()).or_default();
            let flags: HashMap<Hash, bool> =
                local.backups.iter().map(|e| (e.hash, e.shallow)).collect();
            local.backups = remote_set
                .backups
                .iter()
                .map(|e| BackupEntry {
                    hash: e.hash,
                    shallow: flags.get(&e.hash).copied().unwrap_or(true),
                })
                .collect();
        }
        if let Some(remote_backups) = remote.sets.lock().get_mut(set) {
            remote_backups.cache_used = true;
        }

        tracing::info!(
            "Synced cache for {}: {} added, {} removed, {} blobs marked",
            set,
            summary.backups_added,
            summary.backups_removed,
            summary.blobs_marked
        );
        Ok(summary)
    }

    pub async fn save_backup_set(&self, set: &str) -> Result<()> {
        validate_set_name(set)?;
        let encoded = self.backup_set(set).unwrap_or_default().encode();
        self.blobs
            .backend()
            .store_index(&set_index_name(set), Bytes::from(encoded))
            .await
    }

    /// Load `set` from the backend, replacing any in-memory copy. A set that
    /// was never saved loads empty.
    pub async fn load_backup_set(&self, set: &str) -> Result<BackupSet> {
        validate_set_name(set)?;
        let loaded = match self.blobs.backend().load_index(&set_index_name(set)).await? {
            Some(data) => BackupSet::decode(&data)?,
            None => BackupSet::default(),
        };
        self.sets.lock().insert(set.to_string(), loaded.clone());
        Ok(loaded)
    }

    /// Persist the hash index and every set.
    pub async fn save(&self) -> Result<()> {
        for name in self.set_names() {
            self.save_backup_set(&name).await?;
        }
        self.blobs.save_index().await
    }
}
