//! Dense Merkle tree over the whole machine span.
//!
//! Every node hash is materialized in a binary heap layout, so proofs are
//! sibling lookups and a single-word mutation only recomputes the ancestors
//! on its root path. This is the dense generalization of the back-merkle
//! spine used to maintain the machine-state root while recording accesses.

use crate::error::TreeError;
use crate::hasher::{concat_hash, Hash};
use crate::pristine::PristineHashes;
use crate::proof::MerkleProof;

#[derive(Debug, Clone)]
pub struct FullMerkleTree {
  log2_root_size: u32,
  log2_leaf_size: u32,
  max_leaves: u64,
  /// Heap with node hashes: index 1 is the root, node `i` has children
  /// `2i` and `2i + 1`. Index 0 is unused.
  tree: Vec<Hash>,
}

impl FullMerkleTree {
  /// Builds a pristine tree.
  pub fn new(log2_root_size: u32, log2_leaf_size: u32, log2_word_size: u32) -> Result<Self, TreeError> {
    let pristine = Self::check_log2_sizes(log2_root_size, log2_leaf_size, log2_word_size)?;
    let depth = log2_root_size - log2_leaf_size;
    let max_leaves = 1u64 << depth;
    let mut tree = vec![Hash::default(); (2 * max_leaves) as usize];
    for level in 0..=depth {
      let first = 1usize << level;
      // Pristine hashes are the same across a whole level.
      let hash = *pristine.get(log2_root_size - level).unwrap();
      tree[first..2 * first].fill(hash);
    }
    Ok(Self { log2_root_size, log2_leaf_size, max_leaves, tree })
  }

  /// Builds a tree whose first leaves are `leaves` and whose remaining
  /// positions are pristine.
  pub fn from_leaves(
    log2_root_size: u32,
    log2_leaf_size: u32,
    log2_word_size: u32,
    leaves: &[Hash],
  ) -> Result<Self, TreeError> {
    let pristine = Self::check_log2_sizes(log2_root_size, log2_leaf_size, log2_word_size)?;
    let depth = log2_root_size - log2_leaf_size;
    let max_leaves = 1u64 << depth;
    if leaves.len() as u64 > max_leaves {
      return Err(TreeError::TreeFull);
    }
    let mut tree = vec![Hash::default(); (2 * max_leaves) as usize];
    let first_leaf = max_leaves as usize;
    tree[first_leaf..first_leaf + leaves.len()].copy_from_slice(leaves);
    tree[first_leaf + leaves.len()..].fill(*pristine.get(log2_leaf_size).unwrap());
    for index in (1..first_leaf).rev() {
      tree[index] = concat_hash(&tree[2 * index], &tree[2 * index + 1]);
    }
    Ok(Self { log2_root_size, log2_leaf_size, max_leaves, tree })
  }

  pub fn log2_root_size(&self) -> u32 {
    self.log2_root_size
  }

  pub fn log2_leaf_size(&self) -> u32 {
    self.log2_leaf_size
  }

  pub fn root_hash(&self) -> &Hash {
    &self.tree[1]
  }

  /// Hash of the node spanning `2^log2_size` bytes at `address`.
  pub fn node_hash(&self, address: u64, log2_size: u32) -> Result<&Hash, TreeError> {
    Ok(&self.tree[self.node_index(address, log2_size)?])
  }

  /// Replaces the leaf covering `address` and recomputes its root path.
  pub fn update_leaf(&mut self, address: u64, leaf: Hash) -> Result<(), TreeError> {
    let mut index = self.node_index(address, self.log2_leaf_size)?;
    self.tree[index] = leaf;
    while index > 1 {
      index /= 2;
      self.tree[index] = concat_hash(&self.tree[2 * index], &self.tree[2 * index + 1]);
    }
    Ok(())
  }

  /// Proof for the node spanning `2^log2_size` bytes at `address`.
  pub fn proof(&self, address: u64, log2_size: u32) -> Result<MerkleProof, TreeError> {
    if log2_size < self.log2_leaf_size || log2_size > self.log2_root_size {
      return Err(TreeError::SizeOutOfRange);
    }
    if address & ((1u64 << log2_size) - 1) != 0 {
      return Err(TreeError::AddressOutOfBounds);
    }
    let mut proof = MerkleProof::new(self.log2_root_size, log2_size)?;
    proof.set_target_address(address);
    proof.set_target_hash(*self.node_hash(address, log2_size)?);
    proof.set_root_hash(*self.root_hash());
    for log2_sibling_size in log2_size..self.log2_root_size {
      let sibling_address = address ^ (1u64 << log2_sibling_size);
      proof.set_sibling_hash(*self.node_hash(sibling_address, log2_sibling_size)?, log2_sibling_size)?;
    }
    debug_assert!(proof.verify(), "produced invalid proof");
    Ok(proof)
  }

  fn check_log2_sizes(
    log2_root_size: u32,
    log2_leaf_size: u32,
    log2_word_size: u32,
  ) -> Result<PristineHashes, TreeError> {
    if log2_root_size > 63 {
      return Err(TreeError::RootSizeTooLarge);
    }
    if log2_leaf_size > log2_root_size {
      return Err(TreeError::LeafLargerThanRoot);
    }
    if log2_word_size > log2_leaf_size {
      return Err(TreeError::WordLargerThanLeaf);
    }
    PristineHashes::new(log2_root_size, log2_word_size)
  }

  fn node_index(&self, address: u64, log2_size: u32) -> Result<usize, TreeError> {
    if log2_size < self.log2_leaf_size || log2_size > self.log2_root_size {
      return Err(TreeError::SizeOutOfRange);
    }
    let base = 1u64 << (self.log2_root_size - log2_size);
    let offset = address >> log2_size;
    if offset >= base {
      return Err(TreeError::AddressOutOfBounds);
    }
    Ok((base + offset) as usize)
  }
}
