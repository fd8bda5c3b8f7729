//! BlobVault Core - deduplicating content-addressed backup store
//!
//! Backups are stored as blobs keyed by SHA-1:
//! - content-defined chunking with a rolling checksum
//! - a B+Tree hash index of blob locations
//! - per backup set reference counts with garbage collection
//! - directory snapshots as Merkle trees of metadata nodes

pub mod backup;
pub mod blob;
pub mod blob_store;
pub mod chunker;
pub mod encoding;
pub mod error;
pub mod hash;
pub mod index;
pub mod references;
pub mod storage;
pub mod tree;

pub use backup::{
    BackupCatalog, BackupEntry, BackupRecord, BackupSet, CacheSyncSummary, validate_set_name,
};
pub use blob::{BackupSetReference, BlobLocation, BlobType};
pub use blob_store::{BlobStore, IndexStats, ReferenceSizes, TransferSummary, HASH_INDEX_FILE};
pub use chunker::{Block, ChunkerConfig, ContentChunker, SplitResult, split, split_async, split_reader};
pub use error::{Result, VaultError};
pub use hash::{Hash, HASH_LEN, StreamHasher, sha1_digest};
pub use index::{BPlusTree, DEFAULT_ORDER, HashIndex, MIN_ORDER};
pub use references::{BlobReference, BlobReferenceIterator, TraversalOrder};
pub use storage::{BlobBackend, DiskBackend, MemoryBackend};
pub use tree::{FileMetadata, HashTreeNode, MetadataNode};
