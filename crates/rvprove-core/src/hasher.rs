//! Keccak-256 hashing of machine words and Merkle node pairs.

use p3_keccak::Keccak256Hash;
use p3_symmetric::CryptographicHasher;

/// Storage for a Keccak-256 digest.
pub type Hash = [u8; 32];

/// Number of bytes in a digest.
pub const HASH_SIZE: usize = 32;

/// Compute keccak256 of `input` and return the 32-byte digest.
pub fn keccak256_bytes(input: &[u8]) -> Hash {
  Keccak256Hash.hash_iter(input.iter().copied())
}

/// Hash of a leaf covering `word.len()` bytes of machine state.
pub fn leaf_hash(word: &[u8]) -> Hash {
  keccak256_bytes(word)
}

/// Hash of an inner node from its two child hashes.
pub fn concat_hash(left: &Hash, right: &Hash) -> Hash {
  let mut preimage = [0u8; 2 * HASH_SIZE];
  preimage[..HASH_SIZE].copy_from_slice(left);
  preimage[HASH_SIZE..].copy_from_slice(right);
  keccak256_bytes(&preimage)
}

/// Hash of a 64-bit machine word in its little-endian memory representation.
pub fn word_hash(word: u64) -> Hash {
  leaf_hash(&word.to_le_bytes())
}
