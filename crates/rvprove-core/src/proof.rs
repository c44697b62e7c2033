//! Merkle proof for a single node of the state tree.
//!
//! A proof carries the tree parameters, the target node's address and hash,
//! the claimed root hash, and one sibling hash per level between target and
//! root, ordered nearest-the-target first. Folding the target hash through
//! the siblings along the bits of `target_address >> log2_target_size` must
//! reproduce the root hash.

use serde::{Deserialize, Serialize};

use crate::error::TreeError;
use crate::hasher::{concat_hash, Hash};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
  log2_root_size: u32,
  log2_target_size: u32,
  target_address: u64,
  target_hash: Hash,
  root_hash: Hash,
  /// Sibling hashes along the path from target to root, nearest first.
  siblings: Vec<Hash>,
}

impl MerkleProof {
  /// Allocates a proof with pristine target, root, and sibling slots.
  pub fn new(log2_root_size: u32, log2_target_size: u32) -> Result<Self, TreeError> {
    if log2_root_size > 63 {
      return Err(TreeError::RootSizeTooLarge);
    }
    if log2_target_size > log2_root_size {
      return Err(TreeError::TargetLargerThanRoot);
    }
    Ok(Self {
      log2_root_size,
      log2_target_size,
      target_address: 0,
      target_hash: Hash::default(),
      root_hash: Hash::default(),
      siblings: vec![Hash::default(); (log2_root_size - log2_target_size) as usize],
    })
  }

  pub fn log2_root_size(&self) -> u32 {
    self.log2_root_size
  }

  pub fn log2_target_size(&self) -> u32 {
    self.log2_target_size
  }

  pub fn target_address(&self) -> u64 {
    self.target_address
  }

  pub fn set_target_address(&mut self, target_address: u64) {
    self.target_address = target_address;
  }

  pub fn target_hash(&self) -> &Hash {
    &self.target_hash
  }

  pub fn set_target_hash(&mut self, hash: Hash) {
    self.target_hash = hash;
  }

  pub fn root_hash(&self) -> &Hash {
    &self.root_hash
  }

  pub fn set_root_hash(&mut self, hash: Hash) {
    self.root_hash = hash;
  }

  pub fn siblings(&self) -> &[Hash] {
    &self.siblings
  }

  /// Sibling of the path node spanning `2^log2_size` bytes.
  pub fn sibling_hash(&self, log2_size: u32) -> Result<&Hash, TreeError> {
    Ok(&self.siblings[self.sibling_index(log2_size)?])
  }

  pub fn set_sibling_hash(&mut self, hash: Hash, log2_size: u32) -> Result<(), TreeError> {
    let index = self.sibling_index(log2_size)?;
    self.siblings[index] = hash;
    Ok(())
  }

  fn sibling_index(&self, log2_size: u32) -> Result<usize, TreeError> {
    if log2_size < self.log2_target_size || log2_size >= self.log2_root_size {
      return Err(TreeError::SizeOutOfRange);
    }
    Ok((log2_size - self.log2_target_size) as usize)
  }

  /// Folds `from` up through the siblings as if it were the target hash,
  /// returning the resulting root. Bit `i` of the target's leaf-index path
  /// selects whether the sibling at level `i` sits to the left or right.
  pub fn fold(&self, from: &Hash) -> Hash {
    let path = self.target_address >> self.log2_target_size;
    let mut hash = *from;
    for (i, sibling) in self.siblings.iter().enumerate() {
      if (path >> i) & 1 != 0 {
        hash = concat_hash(sibling, &hash);
      } else {
        hash = concat_hash(&hash, sibling);
      }
    }
    hash
  }

  /// True when the target hash folds through the siblings to the root hash.
  pub fn verify(&self) -> bool {
    if self.target_address & ((1u64 << self.log2_target_size) - 1) != 0 {
      return false;
    }
    if self.log2_root_size < 64 && self.target_address >> self.log2_root_size != 0 {
      return false;
    }
    self.fold(&self.target_hash) == self.root_hash
  }
}
