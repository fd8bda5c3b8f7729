//! Deduplicating blob store.
//!
//! Every distinct content hash has exactly one [`BlobLocation`] in the hash
//! index. Reference counts are kept per backup set and follow paths: a blob
//! reachable twice from one backup is counted twice. Bytes are deleted once
//! no non-shallow reference remains and the index entry goes away once no
//! reference of any kind remains.

use crate::backup::BackupRecord;
use crate::blob::{BackupSetReference, BlobLocation, BlobType};
use crate::chunker::{self, ChunkerConfig, SplitResult};
use crate::encoding::{DictReader, DictWriter, enum_decode, enum_encode};
use crate::error::{Result, VaultError};
use crate::hash::{HASH_LEN, Hash, sha1_digest};
use crate::index::{DEFAULT_ORDER, HashIndex};
use crate::references::{BlobReference, BlobReferenceIterator, TraversalOrder};
use crate::storage::BlobBackend;
use crate::tree::{HashTreeNode, MetadataNode};
use bytes::{Bytes, BytesMut};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::Mutex;

/// Name of the persisted hash index inside a backend.
pub const HASH_INDEX_FILE: &str = "hashindex";

/// Upper bound on buffer space reserved up front when reassembling a
/// multi-block blob; the recorded length comes from the persisted index.
const MAX_PREALLOCATION: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub blobs_copied: u64,
    pub bytes_copied: u64,
    /// Subtrees already held by the destination and only re-referenced.
    pub subtrees_reused: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceSizes {
    /// Bytes of every distinct blob the backup reaches.
    pub all_references: u64,
    /// Bytes that would be freed if only this backup let go of them.
    pub unique_references: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub blob_count: u64,
    pub stored_blobs: u64,
    pub stored_bytes: u64,
    pub multi_block_blobs: u64,
    /// Number of blobs per total reference count.
    pub reference_histogram: BTreeMap<u64, u64>,
}

pub struct BlobStore {
    index: HashIndex<BlobLocation>,
    backend: Arc<dyn BlobBackend>,
    chunker: ChunkerConfig,
    /// Serializes check-then-act sequences that span backend awaits.
    write_gate: Mutex<()>,
}

impl BlobStore {
    pub fn new(backend: Arc<dyn BlobBackend>) -> Result<Self> {
        Self::with_options(backend, DEFAULT_ORDER, ChunkerConfig::default())
    }

    pub fn with_options(
        backend: Arc<dyn BlobBackend>,
        index_order: usize,
        chunker: ChunkerConfig,
    ) -> Result<Self> {
        Ok(Self {
            index: HashIndex::new(index_order)?,
            backend,
            chunker,
            write_gate: Mutex::new(()),
        })
    }

    pub fn backend(&self) -> &Arc<dyn BlobBackend> {
        &self.backend
    }

    pub fn chunker_config(&self) -> ChunkerConfig {
        self.chunker
    }

    pub fn blob_count(&self) -> usize {
        self.index.count()
    }

    /// Split `data`, store what is new and add one reference for `set`.
    pub async fn store_data(
        &self,
        set: &BackupSetReference,
        data: impl AsRef<[u8]>,
        blob_type: BlobType,
    ) -> Result<Hash> {
        let split = chunker::split(self.chunker, data.as_ref());
        self.store_split(set, split, blob_type).await
    }

    pub async fn store_reader<R: AsyncRead + Unpin>(
        &self,
        set: &BackupSetReference,
        reader: R,
        blob_type: BlobType,
    ) -> Result<Hash> {
        let split = chunker::split_async(self.chunker, reader).await?;
        self.store_split(set, split, blob_type).await
    }

    async fn store_split(
        &self,
        set: &BackupSetReference,
        split: SplitResult,
        blob_type: BlobType,
    ) -> Result<Hash> {
        let _gate = self.write_gate.lock().await;

        if let [block] = split.blocks.as_slice() {
            self.add_blob(set, block.hash, block.data.clone(), blob_type, true)
                .await?;
            tracing::debug!("Stored single-block blob {} for {}", block.hash.short(), set);
            return Ok(split.hash);
        }

        let total_len = split.total_len();
        let mut block_hashes = Vec::with_capacity(split.blocks.len());
        for block in split.blocks {
            block_hashes.push(block.hash);
            self.add_blob(set, block.hash, block.data, BlobType::Simple, false)
                .await?;
        }
        let blocks = block_hashes.len();
        self.add_reference_only(set, split.hash, blob_type, total_len, Some(block_hashes))?;
        tracing::debug!(
            "Stored blob {} as {} blocks ({} bytes) for {}",
            split.hash.short(),
            blocks,
            total_len,
            set
        );
        Ok(split.hash)
    }

    /// Reference one stored blob, writing bytes only when this store does
    /// not already hold them. Callers hold the write gate.
    async fn add_blob(
        &self,
        set: &BackupSetReference,
        hash: Hash,
        data: Bytes,
        blob_type: BlobType,
        retype: bool,
    ) -> Result<()> {
        let Some(existing) = self.index.get_record(&hash) else {
            let relative_path = if set.shallow {
                None
            } else {
                Some(self.backend.store_blob(&hash, data.clone()).await?)
            };
            let mut location = BlobLocation::new(blob_type, relative_path, data.len() as u64);
            location.apply_delta(set, 1)?;
            self.index.add_or_find(hash, location);
            return Ok(());
        };

        let write_through = !set.shallow
            && !existing.has_stored_bytes()
            && !existing.is_multi_block()
            && !existing
                .reference_frequencies
                .contains_key(&set.bloblist_marker());
        let relative_path = if write_through {
            tracing::debug!("Writing through shallow-only blob {}", hash.short());
            Some(self.backend.store_blob(&hash, data).await?)
        } else {
            None
        };

        self.index
            .update(&hash, |location| {
                if relative_path.is_some() {
                    location.relative_path = relative_path;
                }
                if retype {
                    location.blob_type = blob_type;
                }
                location.apply_delta(set, 1)
            })
            .ok_or(VaultError::NotFound(hash))??;
        Ok(())
    }

    /// Reference a blob without touching the backend: multi-block parents,
    /// and shallow copies during transfer.
    fn add_reference_only(
        &self,
        set: &BackupSetReference,
        hash: Hash,
        blob_type: BlobType,
        byte_length: u64,
        block_hashes: Option<Vec<Hash>>,
    ) -> Result<()> {
        let updated = self.index.update(&hash, |location| {
            location.blob_type = blob_type;
            location.apply_delta(set, 1)
        });
        match updated {
            Some(result) => {
                result?;
            }
            None => {
                let mut location = match block_hashes {
                    Some(blocks) => BlobLocation::multi_block(blob_type, blocks, byte_length),
                    None => BlobLocation::new(blob_type, None, byte_length),
                };
                location.apply_delta(set, 1)?;
                self.index.add_or_find(hash, location);
            }
        }
        Ok(())
    }

    /// Reassemble the bytes of `hash`.
    pub async fn retrieve_data(&self, hash: &Hash) -> Result<Bytes> {
        let location = self.index.get_record(hash).ok_or(VaultError::NotFound(*hash))?;
        self.load_location(hash, &location).await
    }

    async fn load_location(&self, hash: &Hash, location: &BlobLocation) -> Result<Bytes> {
        let Some(blocks) = &location.block_hashes else {
            return self.load_single(hash, location).await;
        };
        let mut buf = BytesMut::with_capacity(location.byte_length.min(MAX_PREALLOCATION) as usize);
        for block_hash in blocks {
            let block = self
                .index
                .get_record(block_hash)
                .ok_or(VaultError::NotFound(*block_hash))?;
            if block.is_multi_block() {
                return Err(VaultError::InvariantViolation(format!(
                    "block {} of {} is itself multi-block",
                    block_hash, hash
                )));
            }
            buf.extend_from_slice(&self.load_single(block_hash, &block).await?);
            if buf.len() as u64 > location.byte_length {
                break;
            }
        }
        if buf.len() as u64 != location.byte_length {
            return Err(VaultError::CorruptIndex(format!(
                "blocks of {} hold {} bytes, index records {}",
                hash,
                buf.len(),
                location.byte_length
            )));
        }
        Ok(buf.freeze())
    }

    async fn load_single(&self, hash: &Hash, location: &BlobLocation) -> Result<Bytes> {
        // Shallow-only blobs are known here but stored elsewhere.
        let path = location
            .relative_path
            .as_deref()
            .ok_or(VaultError::NotFound(*hash))?;
        let data = self.backend.load_blob(path, location.byte_length).await?;
        if sha1_digest(&data) != *hash {
            return Err(VaultError::StorageIo(format!(
                "content of {} does not match its hash",
                path
            )));
        }
        Ok(data)
    }

    pub fn contains_hash(&self, hash: &Hash) -> bool {
        self.index.contains(hash)
    }

    pub fn contains_hash_for_set(&self, set: &BackupSetReference, hash: &Hash) -> bool {
        self.index
            .get_record(hash)
            .is_some_and(|location| location.reference_count(set) > 0)
    }

    pub fn get_location(&self, hash: &Hash) -> Option<BlobLocation> {
        self.index.get_record(hash)
    }

    /// Walk everything `hash` references, `hash` included.
    pub fn references(
        &self,
        hash: Hash,
        blob_type: BlobType,
        include_files: bool,
        order: TraversalOrder,
    ) -> BlobReferenceIterator<'_> {
        BlobReferenceIterator::new(
            self,
            BlobReference { hash, blob_type },
            include_files,
            order,
        )
    }

    /// Immediate children of one reference.
    pub(crate) async fn expand_reference(
        &self,
        reference: BlobReference,
        include_files: bool,
    ) -> Result<Vec<BlobReference>> {
        let location = self
            .index
            .get_record(&reference.hash)
            .ok_or(VaultError::NotFound(reference.hash))?;

        let mut children = match reference.blob_type {
            BlobType::BackupRecord => {
                let data = self.load_location(&reference.hash, &location).await?;
                vec![BlobReference {
                    hash: BackupRecord::tree_hash_of(&data)?,
                    blob_type: BlobType::MetadataNode,
                }]
            }
            BlobType::MetadataNode => {
                let data = self.load_location(&reference.hash, &location).await?;
                MetadataNode::child_references(&data, include_files)?
            }
            BlobType::Simple | BlobType::FileBlob => Vec::new(),
        };
        if let Some(blocks) = &location.block_hashes {
            children.extend(blocks.iter().map(|hash| BlobReference {
                hash: *hash,
                blob_type: BlobType::Simple,
            }));
        }
        Ok(children)
    }

    /// Add `delta` references for `set` to `hash` and everything it reaches,
    /// deleting bytes and index entries whose counts drop to zero.
    pub async fn increment_reference_count(
        &self,
        set: &BackupSetReference,
        hash: &Hash,
        delta: i64,
        include_files: bool,
    ) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        self.increment_locked(set, hash, delta, include_files).await
    }

    async fn increment_locked(
        &self,
        set: &BackupSetReference,
        hash: &Hash,
        delta: i64,
        include_files: bool,
    ) -> Result<()> {
        let root = self.index.get_record(hash).ok_or(VaultError::NotFound(*hash))?;
        // Walk completely before touching counts so that parents are still
        // loadable and a failure leaves the store unchanged.
        let walk = self
            .references(*hash, root.blob_type, include_files, TraversalOrder::BottomUp)
            .collect_all()
            .await?;
        let touched = walk.len();
        self.apply_deltas(set, walk.iter().map(|reference| reference.hash), delta)
            .await?;
        tracing::debug!(
            "Applied {:+} for {} to {} references under {}",
            delta,
            set,
            touched,
            hash.short()
        );
        Ok(())
    }

    /// Apply `delta` once per listed hash. Every update is checked against
    /// staged copies first; nothing is written unless all of them succeed.
    async fn apply_deltas(
        &self,
        set: &BackupSetReference,
        hashes: impl IntoIterator<Item = Hash>,
        delta: i64,
    ) -> Result<()> {
        let mut staged: HashMap<Hash, BlobLocation> = HashMap::new();
        let mut order = Vec::new();
        for hash in hashes {
            let location = match staged.entry(hash) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let current = self.index.get_record(&hash).ok_or(VaultError::NotFound(hash))?;
                    order.push(hash);
                    entry.insert(current)
                }
            };
            location.apply_delta(set, delta)?;
        }

        for hash in order {
            let Some(mut location) = staged.remove(&hash) else {
                continue;
            };
            let orphaned_path = if location.total_non_shallow_references() == 0 {
                location.relative_path.take()
            } else {
                None
            };
            if location.total_references() == 0 {
                self.index.remove(&hash);
            } else {
                self.index.upsert(hash, location);
            }
            if let Some(path) = orphaned_path {
                match self.backend.delete_blob(&path).await {
                    Ok(()) => tracing::debug!("Deleted unreferenced blob {}", hash.short()),
                    Err(e) => tracing::warn!("Failed to delete blob {} at {}: {}", hash.short(), path, e),
                }
            }
        }
        Ok(())
    }

    fn is_present_for(&self, set: &BackupSetReference, hash: &Hash) -> bool {
        self.index.get_record(hash).is_some_and(|location| {
            set.shallow || location.total_non_shallow_references() > 0
        })
    }

    /// Whether every blob reachable from `hash` is indexed here and, for a
    /// non-shallow set, backed by bytes. A metadata-only copy of a tree
    /// fails this once files are included.
    async fn holds_subtree(
        &self,
        set: &BackupSetReference,
        reference: BlobReference,
        include_files: bool,
    ) -> Result<bool> {
        let mut walk = self.references(
            reference.hash,
            reference.blob_type,
            include_files,
            TraversalOrder::TopDown,
        );
        loop {
            let next = match walk.next().await {
                Ok(Some(next)) => next,
                Ok(None) => return Ok(true),
                Err(e) if e.is_not_found() => return Ok(false),
                Err(e) => return Err(e),
            };
            let Some(location) = self.index.get_record(&next.hash) else {
                return Ok(false);
            };
            if !set.shallow && !location.has_stored_bytes() && !location.is_multi_block() {
                return Ok(false);
            }
        }
    }

    /// Copy `hash` and what it references into `dst` under `dst_set`.
    /// Subtrees `dst` already holds are re-referenced instead of copied.
    pub async fn transfer_blob_and_references(
        &self,
        dst: &BlobStore,
        dst_set: &BackupSetReference,
        hash: &Hash,
        blob_type: BlobType,
        include_files: bool,
    ) -> Result<TransferSummary> {
        let _gate = dst.write_gate.lock().await;
        let mut summary = TransferSummary::default();
        let mut walk = self.references(*hash, blob_type, include_files, TraversalOrder::TopDown);

        while let Some(reference) = walk.next().await? {
            if dst.is_present_for(dst_set, &reference.hash) {
                if dst.holds_subtree(dst_set, reference, include_files).await? {
                    dst.increment_locked(dst_set, &reference.hash, 1, include_files)
                        .await?;
                    walk.skip_child();
                    summary.subtrees_reused += 1;
                } else {
                    // Indexed without everything below it: count this node
                    // and keep walking to fill in what is missing.
                    dst.apply_deltas(dst_set, [reference.hash], 1).await?;
                }
                continue;
            }

            let location = self
                .index
                .get_record(&reference.hash)
                .ok_or(VaultError::NotFound(reference.hash))?;
            if location.is_multi_block() || dst_set.shallow {
                dst.add_reference_only(
                    dst_set,
                    reference.hash,
                    location.blob_type,
                    location.byte_length,
                    location.block_hashes.clone(),
                )?;
            } else {
                let data = self.load_single(&reference.hash, &location).await?;
                summary.bytes_copied += data.len() as u64;
                dst.add_blob(dst_set, reference.hash, data, location.blob_type, true)
                    .await?;
            }
            summary.blobs_copied += 1;
        }

        tracing::info!(
            "Transferred {} from {} to {}: {} blobs copied ({} bytes), {} subtrees reused",
            hash.short(),
            self.backend.name(),
            dst.backend.name(),
            summary.blobs_copied,
            summary.bytes_copied,
            summary.subtrees_reused
        );
        Ok(summary)
    }

    /// Mark every blob reachable from `hash` in this store as held by the
    /// remote backup set `remote_set` inside `cache`. Markers are flags, so
    /// repeated calls do not accumulate.
    pub async fn cache_bloblist(
        &self,
        cache: &BlobStore,
        remote_set: &str,
        hash: &Hash,
        blob_type: BlobType,
    ) -> Result<u64> {
        let marker = BackupSetReference::bloblist_cache(remote_set);
        let _gate = cache.write_gate.lock().await;
        let mut walk = self.references(*hash, blob_type, true, TraversalOrder::TopDown);
        let mut seen = HashSet::new();
        let mut marked = 0;

        while let Some(reference) = walk.next().await? {
            if !seen.insert(reference.hash) {
                walk.skip_child();
                continue;
            }
            if cache.contains_hash_for_set(&marker, &reference.hash) {
                continue;
            }
            let location = self
                .index
                .get_record(&reference.hash)
                .ok_or(VaultError::NotFound(reference.hash))?;
            let updated = cache
                .index
                .update(&reference.hash, |existing| existing.apply_delta(&marker, 1));
            match updated {
                Some(result) => {
                    result?;
                }
                None => {
                    let mut placeholder = BlobLocation {
                        relative_path: None,
                        reference_frequencies: BTreeMap::new(),
                        ..location
                    };
                    placeholder.apply_delta(&marker, 1)?;
                    cache.index.add_or_find(reference.hash, placeholder);
                }
            }
            marked += 1;
        }
        Ok(marked)
    }

    /// Drop every bloblist-cache marker for `remote_set`, and index entries
    /// that only existed for those markers.
    pub async fn clear_bloblist_cache(&self, remote_set: &str) -> Result<u64> {
        let marker = BackupSetReference::bloblist_cache(remote_set);
        let _gate = self.write_gate.lock().await;
        let mut marked = Vec::new();
        self.index.scan(|hash, location| {
            if location.reference_count(&marker) > 0 {
                marked.push(*hash);
            }
        });
        for hash in &marked {
            let unreferenced = self
                .index
                .update(hash, |location| {
                    location.reference_frequencies.remove(&marker);
                    location.total_references() == 0
                })
                .unwrap_or(false);
            if unreferenced {
                self.index.remove(hash);
            }
        }
        Ok(marked.len() as u64)
    }

    /// Persist a metadata tree and reference each of its nodes for `set`.
    pub async fn store_metadata_tree(
        &self,
        set: &BackupSetReference,
        root: &MetadataNode,
    ) -> Result<(Hash, HashTreeNode)> {
        let mut serialized = Vec::new();
        let (hash, shadow) = root.store(&mut |bytes: Vec<u8>| {
            let hash = sha1_digest(&bytes);
            serialized.push(bytes);
            Ok(hash)
        })?;
        for bytes in serialized {
            self.store_data(set, bytes, BlobType::MetadataNode).await?;
        }
        Ok((hash, shadow))
    }

    /// Sizes of the distinct blobs holding bytes under a backup. A blob is
    /// unique when every non-shallow reference to it comes from paths
    /// inside this backup.
    pub async fn reference_sizes(
        &self,
        hash: &Hash,
        blob_type: BlobType,
        include_files: bool,
    ) -> Result<ReferenceSizes> {
        let mut tally: HashMap<Hash, u64> = HashMap::new();
        let mut order = Vec::new();
        let mut walk = self.references(*hash, blob_type, include_files, TraversalOrder::TopDown);
        while let Some(reference) = walk.next().await? {
            let paths = tally.entry(reference.hash).or_insert_with(|| {
                order.push(reference.hash);
                0
            });
            *paths += 1;
        }

        let mut sizes = ReferenceSizes::default();
        for hash in order {
            let Some(location) = self.index.get_record(&hash) else {
                continue;
            };
            if !location.has_stored_bytes() {
                continue;
            }
            sizes.all_references += location.byte_length;
            if location.total_non_shallow_references() <= tally.get(&hash).copied().unwrap_or(0) {
                sizes.unique_references += location.byte_length;
            }
        }
        Ok(sizes)
    }

    pub fn index_stats(&self) -> IndexStats {
        let mut stats = IndexStats::default();
        self.index.scan(|_, location| {
            stats.blob_count += 1;
            if location.has_stored_bytes() {
                stats.stored_blobs += 1;
                stats.stored_bytes += location.byte_length;
            }
            if location.is_multi_block() {
                stats.multi_block_blobs += 1;
            }
            *stats
                .reference_histogram
                .entry(location.total_references())
                .or_default() += 1;
        });
        stats
    }

    /// Serialize the hash index. Entries are written in hash order so the
    /// tree can be rebuilt bottom-up.
    pub fn encode_index(&self) -> Vec<u8> {
        let mut entries = Vec::with_capacity(self.index.count());
        self.index.scan(|hash, location| {
            let mut entry = hash.as_bytes().to_vec();
            entry.extend_from_slice(&location.encode());
            entries.push(entry);
        });
        DictWriter::new()
            .u32("Order-v1", self.index.order() as u32)
            .bytes("Entries-v1", &enum_encode(entries))
            .finish()
    }

    pub fn from_encoded_index(
        backend: Arc<dyn BlobBackend>,
        data: &[u8],
        chunker: ChunkerConfig,
    ) -> Result<Self> {
        let dict = DictReader::decode(data)?;
        let order = dict.u32("Order-v1")?.map_or(DEFAULT_ORDER, |o| o as usize);
        let mut pairs = Vec::new();
        if let Some(raw) = dict.get("Entries-v1") {
            for entry in enum_decode(raw)? {
                if entry.len() < HASH_LEN {
                    return Err(VaultError::CorruptIndex("truncated index entry".into()));
                }
                let (hash, location) = entry.split_at(HASH_LEN);
                pairs.push((Hash::from_slice(hash)?, BlobLocation::decode(location)?));
            }
        }
        let count = pairs.len();
        let store = Self {
            index: HashIndex::from_sorted(order, pairs)?,
            backend,
            chunker,
            write_gate: Mutex::new(()),
        };
        tracing::info!("Loaded hash index with {} entries (order {})", count, order);
        Ok(store)
    }

    pub async fn save_index(&self) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        let encoded = self.encode_index();
        let len = encoded.len();
        self.backend
            .store_index(HASH_INDEX_FILE, Bytes::from(encoded))
            .await?;
        tracing::debug!("Saved hash index ({} bytes) to {}", len, self.backend.name());
        Ok(())
    }

    /// Open the store persisted in `backend`, or an empty one.
    pub async fn load(
        backend: Arc<dyn BlobBackend>,
        index_order: usize,
        chunker: ChunkerConfig,
    ) -> Result<Self> {
        match backend.load_index(HASH_INDEX_FILE).await? {
            Some(data) => Self::from_encoded_index(backend, &data, chunker),
            None => Self::with_options(backend, index_order, chunker),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DiskBackend, MemoryBackend};
    use crate::tree::FileMetadata;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};

    fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        StdRng::seed_from_u64(seed).fill_bytes(&mut data);
        data
    }

    fn memory_store() -> (Arc<MemoryBackend>, BlobStore) {
        let backend = Arc::new(MemoryBackend::new());
        let store =
            BlobStore::with_options(backend.clone(), 8, ChunkerConfig::small_blocks()).unwrap();
        (backend, store)
    }

    fn main_set() -> BackupSetReference {
        BackupSetReference::new("main")
    }

    async fn store_backup(
        store: &BlobStore,
        set: &BackupSetReference,
        files: &[(&str, &[u8])],
    ) -> Hash {
        let mut root = MetadataNode::new(FileMetadata::new("root"));
        let sub = root.add_directory(MetadataNode::new(FileMetadata::new("sub")));
        for (name, content) in files {
            let hash = store
                .store_data(set, content, BlobType::FileBlob)
                .await
                .unwrap();
            sub.add_file(FileMetadata::new(*name).with_content(hash, content.len() as u64));
        }
        let (tree_hash, _) = store.store_metadata_tree(set, &root).await.unwrap();
        let record = BackupRecord::new("test", tree_hash);
        store
            .store_data(set, record.encode(), BlobType::BackupRecord)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_identical_content_is_written_once() {
        let (backend, store) = memory_store();
        let set = main_set();
        let first = store
            .store_data(&set, b"hello world", BlobType::FileBlob)
            .await
            .unwrap();
        let second = store
            .store_data(&set, b"hello world", BlobType::FileBlob)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first, sha1_digest(b"hello world"));
        assert_eq!(backend.write_count(), 1);
        assert_eq!(store.get_location(&first).unwrap().reference_count(&set), 2);
        assert_eq!(store.retrieve_data(&first).await.unwrap().as_ref(), b"hello world");
    }

    #[tokio::test]
    async fn test_large_stream_round_trips_as_multi_block() {
        let (_, store) = memory_store();
        let set = main_set();
        let data = random_bytes(7, 12 * 1024 * 1024);
        let hash = store
            .store_reader(&set, data.as_slice(), BlobType::FileBlob)
            .await
            .unwrap();

        let location = store.get_location(&hash).unwrap();
        assert!(location.is_multi_block());
        assert!(!location.has_stored_bytes());
        assert_eq!(location.byte_length, data.len() as u64);
        let blocks = location.block_hashes.as_ref().unwrap();
        assert!(blocks.len() > 1);
        for block in blocks {
            let block_location = store.get_location(block).unwrap();
            assert!(block_location.has_stored_bytes());
            assert_eq!(block_location.reference_count(&set), 1);
        }

        let restored = store.retrieve_data(&hash).await.unwrap();
        assert_eq!(restored.len(), data.len());
        assert!(restored.as_ref() == data.as_slice());
    }

    #[tokio::test]
    async fn test_single_block_reuses_existing_block_location() {
        let (backend, store) = memory_store();
        let set = main_set();
        let data = random_bytes(8, 1024 * 1024);
        let big = store
            .store_data(&set, &data, BlobType::FileBlob)
            .await
            .unwrap();
        let first_block = store.get_location(&big).unwrap().block_hashes.unwrap()[0];
        let block_bytes = store.retrieve_data(&first_block).await.unwrap();
        let writes = backend.write_count();

        let small = store
            .store_data(&set, &block_bytes, BlobType::FileBlob)
            .await
            .unwrap();
        assert_eq!(small, first_block);
        assert_eq!(backend.write_count(), writes);
        let location = store.get_location(&small).unwrap();
        assert_eq!(location.blob_type, BlobType::FileBlob);
        assert_eq!(location.reference_count(&set), 2);
    }

    #[tokio::test]
    async fn test_inflated_multi_block_length_is_rejected() {
        let (_, store) = memory_store();
        let data = random_bytes(11, 2 * 1024 * 1024);
        let hash = store
            .store_data(&main_set(), &data, BlobType::FileBlob)
            .await
            .unwrap();
        assert!(store.get_location(&hash).unwrap().is_multi_block());

        store.index.update(&hash, |location| location.byte_length = u64::MAX);
        assert!(matches!(
            store.retrieve_data(&hash).await,
            Err(VaultError::CorruptIndex(_))
        ));
    }

    #[tokio::test]
    async fn test_retrieve_unknown_hash_is_not_found() {
        let (_, store) = memory_store();
        let err = store.retrieve_data(&sha1_digest(b"nope")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_shallow_reference_stores_no_bytes_until_written_through() {
        let (backend, store) = memory_store();
        let hash = store
            .store_data(&BackupSetReference::shallow("remote"), b"abc", BlobType::FileBlob)
            .await
            .unwrap();
        assert_eq!(backend.write_count(), 0);
        assert!(store.contains_hash(&hash));
        assert!(store.retrieve_data(&hash).await.unwrap_err().is_not_found());

        store
            .store_data(&main_set(), b"abc", BlobType::FileBlob)
            .await
            .unwrap();
        assert_eq!(backend.write_count(), 1);
        assert_eq!(store.retrieve_data(&hash).await.unwrap().as_ref(), b"abc");
    }

    #[tokio::test]
    async fn test_removing_only_backup_empties_store() {
        let (backend, store) = memory_store();
        let set = main_set();
        let big = random_bytes(9, 512 * 1024);
        let backup = store_backup(
            &store,
            &set,
            &[("a.txt", b"alpha".as_slice()), ("b.txt", b"alpha".as_slice()), ("big.bin", big.as_slice())],
        )
        .await;
        assert!(store.blob_count() > 4);

        store
            .increment_reference_count(&set, &backup, -1, true)
            .await
            .unwrap();
        assert_eq!(store.blob_count(), 0);
        assert_eq!(backend.blob_count(), 0);
    }

    #[tokio::test]
    async fn test_shared_blobs_survive_removal_of_one_backup() {
        let (_, store) = memory_store();
        let set = main_set();
        let first = store_backup(&store, &set, &[("a", b"shared".as_slice()), ("b", b"first only".as_slice())]).await;
        let second = store_backup(&store, &set, &[("a", b"shared".as_slice()), ("c", b"second only".as_slice())]).await;

        store
            .increment_reference_count(&set, &first, -1, true)
            .await
            .unwrap();
        assert!(!store.contains_hash(&first));
        assert!(!store.contains_hash(&sha1_digest(b"first only")));
        assert_eq!(store.retrieve_data(&sha1_digest(b"shared")).await.unwrap().as_ref(), b"shared");

        let remaining = store
            .references(second, BlobType::BackupRecord, true, TraversalOrder::TopDown)
            .collect_all()
            .await
            .unwrap();
        for reference in remaining {
            assert!(store.retrieve_data(&reference.hash).await.is_ok());
        }

        store
            .increment_reference_count(&set, &second, -1, true)
            .await
            .unwrap();
        assert_eq!(store.blob_count(), 0);
    }

    #[tokio::test]
    async fn test_bytes_are_deleted_before_the_index_entry() {
        let (backend, store) = memory_store();
        let set = main_set();
        let cache = BackupSetReference::shallow("main");
        let hash = store
            .store_data(&set, b"kept by cache", BlobType::FileBlob)
            .await
            .unwrap();
        store
            .store_data(&cache, b"kept by cache", BlobType::FileBlob)
            .await
            .unwrap();
        assert_eq!(backend.blob_count(), 1);

        store
            .increment_reference_count(&set, &hash, -1, false)
            .await
            .unwrap();
        assert_eq!(backend.blob_count(), 0);
        assert!(store.contains_hash(&hash));
        let location = store.get_location(&hash).unwrap();
        assert!(!location.has_stored_bytes());
        assert_eq!(location.reference_count(&cache), 1);
        assert!(store.retrieve_data(&hash).await.unwrap_err().is_not_found());

        store
            .increment_reference_count(&cache, &hash, -1, false)
            .await
            .unwrap();
        assert!(!store.contains_hash(&hash));
    }

    #[tokio::test]
    async fn test_failed_delete_is_not_fatal() {
        let (backend, store) = memory_store();
        let set = main_set();
        let hash = store.store_data(&set, b"sticky", BlobType::FileBlob).await.unwrap();
        backend.set_fail_deletes(true);
        store
            .increment_reference_count(&set, &hash, -1, false)
            .await
            .unwrap();
        assert!(!store.contains_hash(&hash));
        assert_eq!(backend.blob_count(), 1);
    }

    #[tokio::test]
    async fn test_decrement_below_zero_is_rejected() {
        let (_, store) = memory_store();
        let hash = store
            .store_data(&main_set(), b"once", BlobType::FileBlob)
            .await
            .unwrap();
        let err = store
            .increment_reference_count(&BackupSetReference::new("other"), &hash, -1, false)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::InvariantViolation(_)));
        assert!(store.contains_hash(&hash));
    }

    #[tokio::test]
    async fn test_failed_decrement_leaves_every_count_untouched() {
        let (backend, store) = memory_store();
        let set = main_set();
        let other = BackupSetReference::new("other");
        let file = store
            .store_data(&set, b"kept", BlobType::FileBlob)
            .await
            .unwrap();
        store
            .store_data(&other, b"kept", BlobType::FileBlob)
            .await
            .unwrap();
        let mut root = MetadataNode::new(FileMetadata::new("root"));
        root.add_file(FileMetadata::new("kept").with_content(file, 4));
        let (tree, _) = store.store_metadata_tree(&set, &root).await.unwrap();
        let file_before = store.get_location(&file).unwrap();
        let tree_before = store.get_location(&tree).unwrap();

        // The file can lose its "other" reference but the tree has none.
        let err = store
            .increment_reference_count(&other, &tree, -1, true)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::InvariantViolation(_)));
        assert_eq!(store.get_location(&file).unwrap(), file_before);
        assert_eq!(store.get_location(&tree).unwrap(), tree_before);
        assert_eq!(backend.delete_count(), 0);
    }

    #[tokio::test]
    async fn test_transfer_metadata_then_files() {
        let (_, src) = memory_store();
        let set = main_set();
        let big = random_bytes(10, 2 * 1024 * 1024);
        let backup = store_backup(&src, &set, &[("x", b"xxx".as_slice()), ("big", big.as_slice())]).await;

        let (dst_backend, dst) = memory_store();
        let dst_set = BackupSetReference::new("mirror");
        src.transfer_blob_and_references(&dst, &dst_set, &backup, BlobType::BackupRecord, false)
            .await
            .unwrap();
        assert!(dst.contains_hash_for_set(&dst_set, &backup));
        assert!(!dst.contains_hash(&sha1_digest(b"xxx")));
        assert!(dst.retrieve_data(&sha1_digest(&big)).await.unwrap_err().is_not_found());
        let metadata_writes = dst_backend.write_count();

        // Same destination and set: the metadata is already there, the
        // files are not.
        let summary = src
            .transfer_blob_and_references(&dst, &dst_set, &backup, BlobType::BackupRecord, true)
            .await
            .unwrap();
        assert_eq!(summary.subtrees_reused, 0);
        assert!(summary.blobs_copied > 2);
        assert!(dst_backend.write_count() > metadata_writes);
        assert_eq!(dst.retrieve_data(&sha1_digest(&big)).await.unwrap().len(), big.len());
        assert_eq!(dst.retrieve_data(&sha1_digest(b"xxx")).await.unwrap().as_ref(), b"xxx");
        assert_eq!(dst.get_location(&backup).unwrap().reference_count(&dst_set), 2);

        dst.increment_reference_count(&dst_set, &backup, -1, true)
            .await
            .unwrap();
        assert!(!dst.contains_hash(&sha1_digest(b"xxx")));
        assert!(dst.contains_hash(&backup));
        dst.increment_reference_count(&dst_set, &backup, -1, false)
            .await
            .unwrap();
        assert_eq!(dst.blob_count(), 0);
        assert_eq!(dst_backend.blob_count(), 0);
    }

    #[tokio::test]
    async fn test_transfer_reuses_subtrees_already_held() {
        let (_, src) = memory_store();
        let set = main_set();
        let first = store_backup(&src, &set, &[("a", b"same".as_slice())]).await;
        let (dst_backend, dst) = memory_store();
        let dst_set = BackupSetReference::new("mirror");
        src.transfer_blob_and_references(&dst, &dst_set, &first, BlobType::BackupRecord, true)
            .await
            .unwrap();
        let writes = dst_backend.write_count();

        // Same tree, new record: only the record itself is new.
        let second = store_backup(&src, &set, &[("a", b"same".as_slice())]).await;
        let summary = src
            .transfer_blob_and_references(&dst, &dst_set, &second, BlobType::BackupRecord, true)
            .await
            .unwrap();
        assert_eq!(summary.blobs_copied, 1);
        assert_eq!(summary.subtrees_reused, 1);
        assert_eq!(dst_backend.write_count(), writes + 1);

        dst.increment_reference_count(&dst_set, &first, -1, true)
            .await
            .unwrap();
        assert_eq!(dst.retrieve_data(&sha1_digest(b"same")).await.unwrap().as_ref(), b"same");
        dst.increment_reference_count(&dst_set, &second, -1, true)
            .await
            .unwrap();
        assert_eq!(dst.blob_count(), 0);
    }

    #[tokio::test]
    async fn test_bloblist_marker_suppresses_write_through() {
        let (_, remote) = memory_store();
        let backup = store_backup(&remote, &main_set(), &[("f", b"remote file".as_slice())]).await;

        let (cache_backend, cache) = memory_store();
        let marked = remote
            .cache_bloblist(&cache, "main", &backup, BlobType::BackupRecord)
            .await
            .unwrap();
        assert!(marked >= 4);
        assert_eq!(cache_backend.write_count(), 0);

        cache
            .store_data(&main_set(), b"remote file", BlobType::FileBlob)
            .await
            .unwrap();
        assert_eq!(cache_backend.write_count(), 0);
        cache
            .store_data(&BackupSetReference::new("local"), b"remote file", BlobType::FileBlob)
            .await
            .unwrap();
        assert_eq!(cache_backend.write_count(), 1);

        let cleared = cache.clear_bloblist_cache("main").await.unwrap();
        assert_eq!(cleared, marked);
        assert!(cache.contains_hash(&sha1_digest(b"remote file")));
        assert!(!cache.contains_hash(&backup));
    }

    #[tokio::test]
    async fn test_reference_sizes_and_stats() {
        let (_, store) = memory_store();
        let set = main_set();
        let first = store_backup(&store, &set, &[("a", b"12345".as_slice()), ("b", b"12345".as_slice())]).await;
        let sizes = store
            .reference_sizes(&first, BlobType::BackupRecord, true)
            .await
            .unwrap();
        assert!(sizes.all_references >= 5);
        // Both paths to "12345" belong to this backup.
        assert_eq!(sizes.all_references, sizes.unique_references);

        let stats = store.index_stats();
        assert_eq!(stats.blob_count, store.blob_count() as u64);
        assert_eq!(stats.stored_blobs, stats.blob_count);
        assert_eq!(stats.reference_histogram.get(&2), Some(&1));

        store_backup(&store, &set, &[("c", b"12345".as_slice())]).await;
        let sizes = store
            .reference_sizes(&first, BlobType::BackupRecord, true)
            .await
            .unwrap();
        assert_eq!(sizes.all_references - sizes.unique_references, 5);

        let stored_before = store.index_stats().stored_bytes;
        store
            .increment_reference_count(&set, &first, -1, true)
            .await
            .unwrap();
        assert_eq!(
            stored_before - store.index_stats().stored_bytes,
            sizes.unique_references
        );
    }

    #[tokio::test]
    async fn test_index_persists_across_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn BlobBackend> =
            Arc::new(DiskBackend::new(temp_dir.path().to_path_buf()).unwrap());
        let set = main_set();
        let backup = {
            let store =
                BlobStore::load(backend.clone(), 4, ChunkerConfig::small_blocks()).await.unwrap();
            let backup = store_backup(&store, &set, &[("a", b"persisted".as_slice())]).await;
            store.save_index().await.unwrap();
            backup
        };

        let reopened = BlobStore::load(backend, 4, ChunkerConfig::small_blocks()).await.unwrap();
        assert!(reopened.contains_hash_for_set(&set, &backup));
        assert_eq!(
            reopened.retrieve_data(&sha1_digest(b"persisted")).await.unwrap().as_ref(),
            b"persisted"
        );
        reopened
            .increment_reference_count(&set, &backup, -1, true)
            .await
            .unwrap();
        assert_eq!(reopened.blob_count(), 0);
    }

    #[test]
    fn test_corrupt_index_is_rejected() {
        let backend: Arc<dyn BlobBackend> = Arc::new(MemoryBackend::new());
        let bad = DictWriter::new()
            .bytes("Entries-v1", &enum_encode([vec![1u8, 2, 3]]))
            .finish();
        assert!(matches!(
            BlobStore::from_encoded_index(backend, &bad, ChunkerConfig::default()),
            Err(VaultError::CorruptIndex(_))
        ));
    }
}
