//! Content-defined chunking with an rsync style rolling checksum.
//!
//! A 32 byte window slides over the stream. `alpha` is the plain sum of the
//! window and `beta` the weighted sum (each byte weighted by how long it has
//! been in the window). A block ends after the current byte when the low
//! byte of both sums is `0xFF` and the second byte of `beta` is below
//! [`ChunkerConfig::beta_high_threshold`].

use crate::error::Result;
use crate::hash::{Hash, StreamHasher, sha1_digest};
use bytes::Bytes;
use std::io::Read;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const WINDOW_SIZE: usize = 32;
const WINDOW_SHIFT: u32 = 5;
pub const DEFAULT_BETA_HIGH_THRESHOLD: u32 = 2;
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    /// Exclusive bound on the second byte of `beta` at a boundary. `2` gives
    /// roughly one boundary per 8 MiB of random input; `256` removes the
    /// clause and averages 64 KiB blocks.
    pub beta_high_threshold: u32,
    pub read_buffer_size: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            beta_high_threshold: DEFAULT_BETA_HIGH_THRESHOLD,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl ChunkerConfig {
    pub fn small_blocks() -> Self {
        Self {
            beta_high_threshold: 256,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub hash: Hash,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct SplitResult {
    /// SHA-1 of the whole stream.
    pub hash: Hash,
    pub blocks: Vec<Block>,
}

impl SplitResult {
    pub fn total_len(&self) -> u64 {
        self.blocks.iter().map(|b| b.data.len() as u64).sum()
    }
}

/// Incremental splitter. Feed bytes in any slicing and call
/// [`ContentChunker::finish`] at end of stream; boundaries depend only on
/// the byte sequence.
pub struct ContentChunker {
    config: ChunkerConfig,
    window: [u8; WINDOW_SIZE],
    cursor: usize,
    alpha: u32,
    beta: u32,
    pending: Vec<u8>,
    stream: StreamHasher,
    emitted: usize,
}

impl ContentChunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self {
            config,
            window: [0; WINDOW_SIZE],
            cursor: 0,
            alpha: 0,
            beta: 0,
            pending: Vec::new(),
            stream: StreamHasher::new(),
            emitted: 0,
        }
    }

    pub fn feed(&mut self, data: &[u8], out: &mut Vec<Block>) {
        let mut start = 0;
        for (i, &byte) in data.iter().enumerate() {
            if self.roll(byte) {
                self.pending.extend_from_slice(&data[start..=i]);
                start = i + 1;
                self.emit(out);
            }
        }
        self.pending.extend_from_slice(&data[start..]);
    }

    /// Flush the trailing block and return the whole-stream hash. An empty
    /// stream still yields one empty block.
    pub fn finish(mut self, out: &mut Vec<Block>) -> Hash {
        if !self.pending.is_empty() || self.emitted == 0 {
            self.emit(out);
        }
        self.stream.finalize()
    }

    fn roll(&mut self, byte: u8) -> bool {
        let outgoing = u32::from(self.window[self.cursor]);
        self.window[self.cursor] = byte;
        self.cursor = (self.cursor + 1) % WINDOW_SIZE;

        self.alpha = self.alpha.wrapping_sub(outgoing).wrapping_add(u32::from(byte));
        self.beta = self
            .beta
            .wrapping_sub(outgoing << WINDOW_SHIFT)
            .wrapping_add(self.alpha);

        (self.alpha & 0xFF) == 0xFF
            && (self.beta & 0xFF) == 0xFF
            && ((self.beta >> 8) & 0xFF) < self.config.beta_high_threshold
    }

    fn emit(&mut self, out: &mut Vec<Block>) {
        let data = Bytes::from(std::mem::take(&mut self.pending));
        self.stream.update(&data);
        out.push(Block {
            hash: sha1_digest(&data),
            data,
        });
        self.emitted += 1;
        self.window = [0; WINDOW_SIZE];
        self.cursor = 0;
        self.alpha = 0;
        self.beta = 0;
    }
}

pub fn split(config: ChunkerConfig, data: &[u8]) -> SplitResult {
    let mut chunker = ContentChunker::new(config);
    let mut blocks = Vec::new();
    chunker.feed(data, &mut blocks);
    let hash = chunker.finish(&mut blocks);
    SplitResult { hash, blocks }
}

pub fn split_reader<R: Read>(config: ChunkerConfig, mut reader: R) -> Result<SplitResult> {
    let mut chunker = ContentChunker::new(config);
    let mut blocks = Vec::new();
    let mut buf = vec![0u8; config.read_buffer_size.max(1)];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        chunker.feed(&buf[..n], &mut blocks);
    }
    let hash = chunker.finish(&mut blocks);
    Ok(SplitResult { hash, blocks })
}

pub async fn split_async<R: AsyncRead + Unpin>(
    config: ChunkerConfig,
    mut reader: R,
) -> Result<SplitResult> {
    let mut chunker = ContentChunker::new(config);
    let mut blocks = Vec::new();
    let mut buf = vec![0u8; config.read_buffer_size.max(1)];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        chunker.feed(&buf[..n], &mut blocks);
    }
    let hash = chunker.finish(&mut blocks);
    Ok(SplitResult { hash, blocks })
}
