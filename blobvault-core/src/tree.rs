//! Directory snapshots as a Merkle tree.
//!
//! A [`MetadataNode`] is one directory. Persisting a node writes its
//! subdirectories first and then a record holding the directory's own
//! metadata, the hashes of its subdirectories and its file entries. Equal
//! subtrees serialize to equal bytes, so unchanged directories share blobs
//! across backups.

use crate::blob::BlobType;
use crate::blob_store::BlobStore;
use crate::encoding::{DictReader, DictWriter, decode_hashes, encode_hashes, enum_decode, enum_encode};
use crate::error::{Result, VaultError};
use crate::hash::Hash;
use crate::references::BlobReference;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

const DIR_METADATA: &str = "DirMetadata-v1";
const DIRECTORIES: &str = "Directories-v1";
const FILES: &str = "Files-v1";
const FILE_HASH: &str = "FileHash-v1";

/// Name, timestamps and attributes of a file or directory.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileMetadata {
    pub name: String,
    pub date_accessed: Option<DateTime<Utc>>,
    pub date_modified: Option<DateTime<Utc>>,
    pub date_created: Option<DateTime<Utc>>,
    pub attributes: u32,
    pub size: u64,
    /// Content hash of a file's data; `None` for directories.
    pub file_hash: Option<Hash>,
}

impl FileMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_content(mut self, hash: Hash, size: u64) -> Self {
        self.file_hash = Some(hash);
        self.size = size;
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = DictWriter::new();
        writer
            .str("FileName-v1", &self.name)
            .u32("Attributes-v1", self.attributes)
            .u64("FileSize-v1", self.size);
        for (key, time) in [
            ("DateAccessedUtc-v1", self.date_accessed),
            ("DateModifiedUtc-v1", self.date_modified),
            ("DateCreatedUtc-v1", self.date_created),
        ] {
            if let Some(time) = time {
                writer.i64(key, time.timestamp_micros());
            }
        }
        if let Some(hash) = &self.file_hash {
            writer.hash(FILE_HASH, hash);
        }
        writer.finish()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let dict = DictReader::decode(data)?;
        let time = |key: &str| -> Result<Option<DateTime<Utc>>> {
            dict.i64(key)?
                .map(|micros| {
                    DateTime::from_timestamp_micros(micros).ok_or_else(|| {
                        VaultError::CorruptIndex(format!("timestamp out of range in {}", key))
                    })
                })
                .transpose()
        };
        Ok(Self {
            name: dict.str("FileName-v1")?.unwrap_or_default(),
            date_accessed: time("DateAccessedUtc-v1")?,
            date_modified: time("DateModifiedUtc-v1")?,
            date_created: time("DateCreatedUtc-v1")?,
            attributes: dict.u32("Attributes-v1")?.unwrap_or(0),
            size: dict.u64("FileSize-v1")?.unwrap_or(0),
            file_hash: dict.hash(FILE_HASH)?,
        })
    }
}

/// One directory of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataNode {
    pub dir_metadata: FileMetadata,
    directories: BTreeMap<String, MetadataNode>,
    files: BTreeMap<String, FileMetadata>,
}

/// Shadow of a freshly stored subtree, so callers can walk what was just
/// written without reading it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashTreeNode {
    pub hash: Hash,
    /// Subdirectories carry their shadow; files carry `None`.
    pub children: Vec<(Hash, Option<HashTreeNode>)>,
}

impl HashTreeNode {
    /// Every hash in the shadow, parents before children.
    pub fn hashes(&self) -> Vec<Hash> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            out.push(node.hash);
            for (hash, child) in node.children.iter().rev() {
                match child {
                    Some(child) => stack.push(child),
                    None => out.push(*hash),
                }
            }
        }
        out
    }
}

impl MetadataNode {
    pub fn new(dir_metadata: FileMetadata) -> Self {
        Self {
            dir_metadata,
            directories: BTreeMap::new(),
            files: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.dir_metadata.name
    }

    pub fn directories(&self) -> impl Iterator<Item = &MetadataNode> {
        self.directories.values()
    }

    pub fn files(&self) -> impl Iterator<Item = &FileMetadata> {
        self.files.values()
    }

    /// Add or replace a file entry in this directory.
    pub fn add_file(&mut self, file: FileMetadata) {
        self.files.insert(file.name.clone(), file);
    }

    /// Add or replace a subdirectory and return it.
    pub fn add_directory(&mut self, node: MetadataNode) -> &mut MetadataNode {
        match self.directories.entry(node.name().to_string()) {
            Entry::Occupied(mut slot) => {
                slot.insert(node);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(node),
        }
    }

    /// Add a file under the directory at `dir_path` (relative to this node).
    pub fn add_file_at(&mut self, dir_path: &str, file: FileMetadata) -> Result<()> {
        self.directory_mut(dir_path)?.add_file(file);
        Ok(())
    }

    /// Add an empty subdirectory under the directory at `dir_path`.
    pub fn add_directory_at(
        &mut self,
        dir_path: &str,
        metadata: FileMetadata,
    ) -> Result<&mut MetadataNode> {
        Ok(self
            .directory_mut(dir_path)?
            .add_directory(MetadataNode::new(metadata)))
    }

    /// Resolve a slash separated directory path. `.` stays, `..` goes up
    /// (never above this node), names match case-sensitively.
    pub fn get_directory(&self, path: &str) -> Option<&MetadataNode> {
        let mut stack: Vec<&MetadataNode> = vec![self];
        for segment in path.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    if stack.len() > 1 {
                        stack.pop();
                    }
                }
                name => {
                    let next = stack.last()?.directories.get(name)?;
                    stack.push(next);
                }
            }
        }
        stack.last().copied()
    }

    pub fn get_file(&self, path: &str) -> Option<&FileMetadata> {
        let (dir, name) = match path.rsplit_once('/') {
            Some((dir, name)) => (dir, name),
            None => ("", path),
        };
        self.get_directory(dir)?.files.get(name)
    }

    pub fn node_equals(&self, other: &MetadataNode) -> bool {
        self == other
    }

    fn directory_mut(&mut self, path: &str) -> Result<&mut MetadataNode> {
        let segments = self.resolve_segments(path).ok_or_else(|| {
            VaultError::InvalidRequest(format!("no such directory: {}", path))
        })?;
        let mut node = self;
        for segment in segments {
            node = node
                .directories
                .get_mut(&segment)
                .ok_or_else(|| VaultError::Internal(format!("lost directory {}", segment)))?;
        }
        Ok(node)
    }

    /// Normalized segment list for an existing directory path.
    fn resolve_segments(&self, path: &str) -> Option<Vec<String>> {
        let mut stack: Vec<&MetadataNode> = vec![self];
        let mut names: Vec<String> = Vec::new();
        for segment in path.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    if stack.len() > 1 {
                        stack.pop();
                        names.pop();
                    }
                }
                name => {
                    let next = stack.last()?.directories.get(name)?;
                    stack.push(next);
                    names.push(name.to_string());
                }
            }
        }
        Some(names)
    }

    /// Persist this subtree depth first. `write` receives each serialized
    /// node (children before parents) and returns its hash.
    pub fn store<F>(&self, write: &mut F) -> Result<(Hash, HashTreeNode)>
    where
        F: FnMut(Vec<u8>) -> Result<Hash>,
    {
        let mut children = Vec::with_capacity(self.directories.len() + self.files.len());
        let mut directory_hashes = Vec::with_capacity(self.directories.len());
        for child in self.directories.values() {
            let (hash, shadow) = child.store(write)?;
            directory_hashes.push(hash);
            children.push((hash, Some(shadow)));
        }
        for file in self.files.values() {
            if let Some(hash) = file.file_hash {
                children.push((hash, None));
            }
        }

        let record = DictWriter::new()
            .bytes(DIR_METADATA, &self.dir_metadata.encode())
            .bytes(DIRECTORIES, &encode_hashes(&directory_hashes))
            .bytes(FILES, &enum_encode(self.files.values().map(FileMetadata::encode)))
            .finish();
        let hash = write(record)?;
        Ok((hash, HashTreeNode { hash, children }))
    }

    /// Load the subtree rooted at `hash` from `store`.
    pub fn load(store: &BlobStore, hash: Hash) -> BoxFuture<'_, Result<MetadataNode>> {
        async move {
            let data = store.retrieve_data(&hash).await?;
            let dict = DictReader::decode(&data)?;
            let mut node = MetadataNode::new(FileMetadata::decode(dict.require(DIR_METADATA)?)?);

            if let Some(raw) = dict.get(DIRECTORIES) {
                for child_hash in decode_hashes(raw)? {
                    let child = MetadataNode::load(store, child_hash).await?;
                    node.add_directory(child);
                }
            }
            if let Some(raw) = dict.get(FILES) {
                for entry in enum_decode(raw)? {
                    node.add_file(FileMetadata::decode(entry)?);
                }
            }
            Ok(node)
        }
        .boxed()
    }

    /// Child references of a serialized node without decoding file metadata
    /// beyond its content hash.
    pub fn child_references(data: &[u8], include_files: bool) -> Result<Vec<BlobReference>> {
        let dict = DictReader::decode(data)?;
        let mut references = Vec::new();
        if let Some(raw) = dict.get(DIRECTORIES) {
            references.extend(decode_hashes(raw)?.into_iter().map(|hash| BlobReference {
                hash,
                blob_type: BlobType::MetadataNode,
            }));
        }
        if include_files {
            if let Some(raw) = dict.get(FILES) {
                for entry in enum_decode(raw)? {
                    if let Some(hash) = DictReader::decode(entry)?.hash(FILE_HASH)? {
                        references.push(BlobReference {
                            hash,
                            blob_type: BlobType::FileBlob,
                        });
                    }
                }
            }
        }
        Ok(references)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BackupSetReference;
    use crate::hash::sha1_digest;
    use crate::storage::MemoryBackend;
    use bytes::Bytes;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn file(name: &str, content: &[u8]) -> FileMetadata {
        let mut meta = FileMetadata::new(name).with_content(sha1_digest(content), content.len() as u64);
        meta.date_modified = Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        meta.attributes = 0x20;
        meta
    }

    fn sample_tree() -> MetadataNode {
        let mut root = MetadataNode::new(FileMetadata::new("root"));
        root.add_file(file("readme.md", b"hello"));
        let docs = root.add_directory(MetadataNode::new(FileMetadata::new("docs")));
        docs.add_file(file("a.txt", b"a"));
        docs.add_directory(MetadataNode::new(FileMetadata::new("empty")));
        root.add_directory_at("docs", FileMetadata::new("Nested")).unwrap();
        root.add_file_at("docs/Nested", file("deep.bin", b"deep")).unwrap();
        root
    }

    fn collecting_store(node: &MetadataNode) -> (Hash, HashTreeNode, Vec<Vec<u8>>) {
        let mut written = Vec::new();
        let (hash, shadow) = node
            .store(&mut |bytes: Vec<u8>| {
                let hash = sha1_digest(&bytes);
                written.push(bytes);
                Ok(hash)
            })
            .unwrap();
        (hash, shadow, written)
    }

    #[test]
    fn test_file_metadata_encoding() {
        let meta = file("photo.jpg", b"jpeg");
        assert_eq!(FileMetadata::decode(&meta.encode()).unwrap(), meta);

        let bare = FileMetadata::new("dir");
        let decoded = FileMetadata::decode(&bare.encode()).unwrap();
        assert_eq!(decoded, bare);
        assert!(decoded.file_hash.is_none());
    }

    #[test]
    fn test_path_lookup() {
        let root = sample_tree();
        assert_eq!(root.get_directory("").unwrap().name(), "root");
        assert_eq!(root.get_directory("docs/./Nested").unwrap().name(), "Nested");
        assert_eq!(root.get_directory("docs/Nested/..").unwrap().name(), "docs");
        assert_eq!(root.get_directory("../docs").unwrap().name(), "docs");
        assert!(root.get_directory("docs/nested").is_none());
        assert!(root.get_directory("docs/missing/..").is_none());

        assert_eq!(root.get_file("readme.md").unwrap().size, 5);
        assert_eq!(root.get_file("docs/Nested/deep.bin").unwrap().size, 4);
        assert_eq!(root.get_file("docs/Nested/../a.txt").unwrap().name, "a.txt");
        assert!(root.get_file("docs/A.txt").is_none());
    }

    #[test]
    fn test_add_at_missing_directory_fails() {
        let mut root = sample_tree();
        assert!(root.add_file_at("nope", file("x", b"x")).is_err());
        assert!(root.add_directory_at("docs/nope", FileMetadata::new("y")).is_err());
        root.add_directory_at("docs/Nested/..", FileMetadata::new("sibling")).unwrap();
        assert!(root.get_directory("docs/sibling").is_some());
    }

    #[test]
    fn test_identical_trees_hash_identically() {
        let (first, _, _) = collecting_store(&sample_tree());
        let (second, _, _) = collecting_store(&sample_tree());
        assert_eq!(first, second);

        let mut changed = sample_tree();
        changed.add_file_at("docs/Nested", file("deep.bin", b"changed")).unwrap();
        let (third, _, _) = collecting_store(&changed);
        assert_ne!(first, third);
    }

    #[test]
    fn test_store_writes_children_first() {
        let (root_hash, shadow, written) = collecting_store(&sample_tree());
        // docs/empty, docs/Nested, docs, root
        assert_eq!(written.len(), 4);
        assert_eq!(sha1_digest(written.last().unwrap()), root_hash);
        assert_eq!(shadow.hash, root_hash);

        let hashes = shadow.hashes();
        assert_eq!(hashes[0], root_hash);
        for bytes in &written {
            assert!(hashes.contains(&sha1_digest(bytes)));
        }
        // four directories plus three files
        assert_eq!(hashes.len(), 7);
    }

    #[test]
    fn test_child_references_respect_include_files() {
        let (_, _, written) = collecting_store(&sample_tree());
        let root_record = written.last().unwrap();

        let dirs_only = MetadataNode::child_references(root_record, false).unwrap();
        assert_eq!(dirs_only.len(), 1);
        assert_eq!(dirs_only[0].blob_type, BlobType::MetadataNode);

        let with_files = MetadataNode::child_references(root_record, true).unwrap();
        assert_eq!(with_files.len(), 2);
        assert_eq!(with_files[1].hash, sha1_digest(b"hello"));
        assert_eq!(with_files[1].blob_type, BlobType::FileBlob);
    }

    #[tokio::test]
    async fn test_load_inverts_store() {
        let store = BlobStore::new(Arc::new(MemoryBackend::new())).unwrap();
        let set = BackupSetReference::new("main");
        let tree = sample_tree();

        let (root_hash, _) = store.store_metadata_tree(&set, &tree).await.unwrap();
        let loaded = MetadataNode::load(&store, root_hash).await.unwrap();
        assert!(loaded.node_equals(&tree));
        assert!(
            loaded
                .get_directory("docs/Nested")
                .unwrap()
                .node_equals(tree.get_directory("docs/Nested").unwrap())
        );
    }

    #[tokio::test]
    async fn test_load_unknown_hash_is_not_found() {
        let store = BlobStore::new(Arc::new(MemoryBackend::new())).unwrap();
        let missing = sha1_digest(b"never stored");
        let err = MetadataNode::load(&store, missing).await.unwrap_err();
        assert!(err.is_not_found());

        let garbage = store
            .store_data(&BackupSetReference::new("main"), Bytes::from_static(b"\x05junk"), BlobType::MetadataNode)
            .await
            .unwrap();
        assert!(matches!(
            MetadataNode::load(&store, garbage).await,
            Err(VaultError::CorruptIndex(_))
        ));
    }
}
