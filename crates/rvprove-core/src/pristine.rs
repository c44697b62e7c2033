//! Hashes of all-zero subtrees for every size between word and root.

use crate::error::TreeError;
use crate::hasher::{concat_hash, leaf_hash, Hash};

/// Precomputed hashes of pristine subtrees.
///
/// `get(h + 1)` is always the concat hash of `get(h)` with itself, down to
/// the hash of a single all-zero word at `log2_word_size`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PristineHashes {
  log2_root_size: u32,
  log2_word_size: u32,
  hashes: Vec<Hash>,
}

impl PristineHashes {
  pub fn new(log2_root_size: u32, log2_word_size: u32) -> Result<Self, TreeError> {
    if log2_root_size > 63 {
      return Err(TreeError::RootSizeTooLarge);
    }
    if log2_word_size > log2_root_size {
      return Err(TreeError::WordLargerThanRoot);
    }
    let word = vec![0u8; 1usize << log2_word_size];
    let levels = (log2_root_size - log2_word_size + 1) as usize;
    let mut hashes = Vec::with_capacity(levels);
    hashes.push(leaf_hash(&word));
    for i in 1..levels {
      let child = hashes[i - 1];
      hashes.push(concat_hash(&child, &child));
    }
    Ok(Self { log2_root_size, log2_word_size, hashes })
  }

  /// Hash of the pristine subtree spanning `2^log2_size` bytes.
  pub fn get(&self, log2_size: u32) -> Result<&Hash, TreeError> {
    if log2_size < self.log2_word_size || log2_size > self.log2_root_size {
      return Err(TreeError::SizeOutOfRange);
    }
    Ok(&self.hashes[(log2_size - self.log2_word_size) as usize])
  }

  pub fn log2_root_size(&self) -> u32 {
    self.log2_root_size
  }

  pub fn log2_word_size(&self) -> u32 {
    self.log2_word_size
  }
}
