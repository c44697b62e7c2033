//! Ordered log of word-granularity state accesses with Merkle proofs.

use serde::{Deserialize, Serialize};

use crate::proof::MerkleProof;

/// Type of state access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessType {
  Read,
  Write,
}

/// One recorded access to the machine state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Access {
  pub access_type: AccessType,
  /// Word-aligned physical address of the access.
  pub address: u64,
  /// Log2 of the number of bytes accessed.
  pub log2_size: u32,
  /// Word value at the address before the access.
  pub read_value: u64,
  /// Word value stored by the access, for writes.
  pub written_value: Option<u64>,
  /// Word inclusion proof rooted at the pre-access state root. For writes
  /// the siblings remain valid for recomputing the post-access root.
  pub proof: MerkleProof,
}

/// Log of all accesses performed by one step, in access order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessLog {
  accesses: Vec<Access>,
}

impl AccessLog {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&mut self, access: Access) {
    self.accesses.push(access);
  }

  pub fn accesses(&self) -> &[Access] {
    &self.accesses
  }

  pub fn len(&self) -> usize {
    self.accesses.len()
  }

  pub fn is_empty(&self) -> bool {
    self.accesses.is_empty()
  }
}

impl<'a> IntoIterator for &'a AccessLog {
  type Item = &'a Access;
  type IntoIter = std::slice::Iter<'a, Access>;

  fn into_iter(self) -> Self::IntoIter {
    self.accesses.iter()
  }
}
