//! Attested RISC-V machine emulation.
//!
//! Every machine state is summarised by a Keccak-256 Merkle root over its
//! registers and memory. Running the interpreter through the direct state
//! access is a plain emulator step; running the same interpreter body
//! through the recording access produces an ordered log of every state
//! read and write, each carrying a word-granularity Merkle proof. A third
//! party can replay such a log against the pre-state root and arrive at
//! the post-state root without ever seeing the full state.
//!
//! The crate is organised leaves first:
//!
//! - [`hasher`], [`pristine`], [`proof`]: digests, empty-subtree hashes,
//!   and the self-verifying sibling-path proof.
//! - [`back_merkle`]: the append-only O(log N) root accumulator.
//! - [`full_merkle`]: the dense tree that maintains the machine root under
//!   single-word mutation.
//! - [`shadow`], [`machine`]: the word-addressable state layout and the
//!   machine itself.
//! - [`state_access`], [`record`], [`interpret`]: the uniform state
//!   catalog, its direct and recording implementations, and the one
//!   interpreter body they share.
//! - [`access_log`], [`replay`], [`cmio`]: the log wire types, the pure
//!   replay verifiers, and cmio response delivery.

pub mod access_log;
pub mod back_merkle;
pub mod cmio;
pub mod error;
pub mod full_merkle;
pub mod hasher;
pub mod interpret;
pub mod machine;
pub mod pristine;
pub mod proof;
pub mod record;
pub mod replay;
pub mod shadow;
pub mod state_access;

pub use access_log::{Access, AccessLog, AccessType};
pub use error::{MachineError, TreeError};
pub use hasher::Hash;
pub use machine::{Machine, MachineConfig};
pub use proof::MerkleProof;
pub use replay::ReplayError;
