//! Append-only Merkle accumulator over a fixed-height tree.
//!
//! The tree keeps one hash per height in `context`, behaving exactly like a
//! binary adder's carry chain: bit `i` of `leaf_count` says whether
//! `context[i]` currently holds the root of a completed subtree of height
//! `i` waiting for a right sibling. Appending a leaf combines it leftward
//! while carry bits are set and parks the result at the first clear bit.
//! Unfilled positions are treated as pristine subtrees, so the root and the
//! proof for the next free leaf slot are both available at any point using
//! O(log N) memory.

use crate::error::TreeError;
use crate::hasher::{concat_hash, Hash};
use crate::pristine::PristineHashes;
use crate::proof::MerkleProof;

#[derive(Debug, Clone)]
pub struct BackMerkleTree {
  log2_root_size: u32,
  log2_leaf_size: u32,
  leaf_count: u64,
  max_leaves: u64,
  /// One slot per height; slot `i` is live iff bit `i` of `leaf_count` is set.
  context: Vec<Hash>,
  pristine: PristineHashes,
}

impl BackMerkleTree {
  pub fn new(log2_root_size: u32, log2_leaf_size: u32, log2_word_size: u32) -> Result<Self, TreeError> {
    if log2_root_size > 63 {
      return Err(TreeError::RootSizeTooLarge);
    }
    if log2_leaf_size > log2_root_size {
      return Err(TreeError::LeafLargerThanRoot);
    }
    if log2_word_size > log2_leaf_size {
      return Err(TreeError::WordLargerThanLeaf);
    }
    let depth = log2_root_size - log2_leaf_size;
    Ok(Self {
      log2_root_size,
      log2_leaf_size,
      leaf_count: 0,
      max_leaves: 1u64 << depth,
      context: vec![Hash::default(); depth as usize + 1],
      pristine: PristineHashes::new(log2_root_size, log2_word_size)?,
    })
  }

  pub fn log2_root_size(&self) -> u32 {
    self.log2_root_size
  }

  pub fn log2_leaf_size(&self) -> u32 {
    self.log2_leaf_size
  }

  /// Number of leaves appended so far.
  pub fn leaf_count(&self) -> u64 {
    self.leaf_count
  }

  pub fn max_leaves(&self) -> u64 {
    self.max_leaves
  }

  /// Appends one leaf hash at the next free position.
  pub fn push_back(&mut self, leaf: Hash) -> Result<(), TreeError> {
    if self.leaf_count >= self.max_leaves {
      return Err(TreeError::TreeFull);
    }
    let depth = self.log2_root_size - self.log2_leaf_size;
    let mut right = leaf;
    for i in 0..=depth {
      if self.leaf_count & (1u64 << i) != 0 {
        right = concat_hash(&self.context[i as usize], &right);
      } else {
        self.context[i as usize] = right;
        break;
      }
    }
    self.leaf_count += 1;
    Ok(())
  }

  /// Current root, filling unoccupied positions with pristine subtrees.
  pub fn root_hash(&self) -> Hash {
    let depth = self.log2_root_size - self.log2_leaf_size;
    if self.leaf_count == self.max_leaves {
      return self.context[depth as usize];
    }
    let mut root = *self.pristine_hash(self.log2_leaf_size);
    for i in 0..depth {
      if self.leaf_count & (1u64 << i) != 0 {
        root = concat_hash(&self.context[i as usize], &root);
      } else {
        root = concat_hash(&root, self.pristine_hash(self.log2_leaf_size + i));
      }
    }
    root
  }

  /// Inclusion proof for the next not-yet-appended leaf position. The
  /// target hash is the pristine leaf hash.
  pub fn next_leaf_proof(&self) -> Result<MerkleProof, TreeError> {
    if self.leaf_count >= self.max_leaves {
      return Err(TreeError::TreeFull);
    }
    let depth = self.log2_root_size - self.log2_leaf_size;
    let mut proof = MerkleProof::new(self.log2_root_size, self.log2_leaf_size)?;
    proof.set_target_address(self.leaf_count << self.log2_leaf_size);
    proof.set_target_hash(*self.pristine_hash(self.log2_leaf_size));
    let mut hash = *self.pristine_hash(self.log2_leaf_size);
    for i in 0..depth {
      let log2_size = self.log2_leaf_size + i;
      if self.leaf_count & (1u64 << i) != 0 {
        let left = self.context[i as usize];
        proof.set_sibling_hash(left, log2_size)?;
        hash = concat_hash(&left, &hash);
      } else {
        let right = *self.pristine_hash(log2_size);
        proof.set_sibling_hash(right, log2_size)?;
        hash = concat_hash(&hash, &right);
      }
    }
    proof.set_root_hash(hash);
    debug_assert!(proof.verify(), "produced invalid next-leaf proof");
    Ok(proof)
  }

  fn pristine_hash(&self, log2_size: u32) -> &Hash {
    // Sizes were validated at construction, so the lookup cannot fail.
    self.pristine.get(log2_size).unwrap()
  }
}
