//! Hierarchical (tree) SHA-256 digest.
//!
//! The byte stream is cut into 1 MiB blocks, each block is hashed, and the
//! block hashes are folded pairwise into a single root. An odd hash at the
//! end of a level is carried up unchanged. An empty stream hashes to
//! `sha256("")`.
//!
//! The result depends only on content: `TreeHasher` buffers partial blocks,
//! so feeding it 7-byte or 8 MiB slices yields the same digest.

use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::{fs::File, io::AsyncReadExt};

/// Block size the tree is built over.
pub const BLOCK_SIZE: usize = 1024 * 1024;

const READ_BUFFER: usize = 256 * 1024;

type Hash = [u8; 32];

/// Incremental tree hasher.
#[derive(Clone)]
pub struct TreeHasher {
    block: Sha256,
    block_len: usize,
    leaves: Vec<Hash>,
    total: u64,
}

impl Default for TreeHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeHasher {
    pub fn new() -> Self {
        Self {
            block: Sha256::new(),
            block_len: 0,
            leaves: Vec::new(),
            total: 0,
        }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        self.total += data.len() as u64;
        while !data.is_empty() {
            let take = (BLOCK_SIZE - self.block_len).min(data.len());
            self.block.update(&data[..take]);
            self.block_len += take;
            data = &data[take..];
            if self.block_len == BLOCK_SIZE {
                self.flush_block();
            }
        }
    }

    /// Bytes consumed so far.
    pub fn total_len(&self) -> u64 {
        self.total
    }

    fn flush_block(&mut self) {
        let block = std::mem::replace(&mut self.block, Sha256::new());
        self.leaves.push(block.finalize().into());
        self.block_len = 0;
    }

    /// Root digest as lowercase hex.
    pub fn finalize(mut self) -> String {
        if self.block_len > 0 || self.leaves.is_empty() {
            self.flush_block();
        }
        hex::encode(fold_levels(self.leaves))
    }
}

fn fold_levels(mut level: Vec<Hash>) -> Hash {
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => {
                    let mut parent = Sha256::new();
                    parent.update(left);
                    parent.update(right);
                    parent.finalize().into()
                }
                [single] => *single,
                _ => unreachable!("chunks(2) yields one or two items"),
            })
            .collect();
    }
    level[0]
}

/// Tree hash of an in-memory buffer.
pub fn tree_hash(data: &[u8]) -> String {
    let mut hasher = TreeHasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Tree hash and size of a file on disk.
pub async fn tree_hash_file(path: &Path) -> std::io::Result<(String, u64)> {
    let mut file = File::open(path).await?;
    let mut hasher = TreeHasher::new();
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let size = hasher.total_len();
    Ok((hasher.finalize(), size))
}
