//! Error types shared across the state-attestation core.

use thiserror::Error;

use crate::replay::ReplayError;

/// Errors from Merkle tree construction and use.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TreeError {
  #[error("log2_root_size is too large for the address type")]
  RootSizeTooLarge,
  #[error("log2_leaf_size is greater than log2_root_size")]
  LeafLargerThanRoot,
  #[error("log2_word_size is greater than log2_leaf_size")]
  WordLargerThanLeaf,
  #[error("log2_word_size is greater than log2_root_size")]
  WordLargerThanRoot,
  #[error("log2_target_size is greater than log2_root_size")]
  TargetLargerThanRoot,
  #[error("log2_size is out of range")]
  SizeOutOfRange,
  #[error("address is out of bounds")]
  AddressOutOfBounds,
  #[error("too many leaves")]
  TreeFull,
}

/// Errors surfaced by machine construction and machine-level operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MachineError {
  #[error("invalid machine config: {0}")]
  InvalidConfig(&'static str),
  #[error(transparent)]
  Tree(#[from] TreeError),
  #[error("address is not word aligned")]
  MisalignedAddress,
  #[error("machine is not yielded")]
  NotYielded,
  #[error("cmio response does not fit in the rx buffer")]
  ResponseTooLong,
  #[error("recorded log failed self verification: {0}")]
  SelfCheck(#[from] ReplayError),
}
