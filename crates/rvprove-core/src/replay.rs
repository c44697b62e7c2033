//! Replay verification of recorded access logs.
//!
//! The verifier is a pure fold over the log: it trusts nothing but the
//! claimed pre root, checks every record's proof against the root reached
//! so far, checks the proved target against the recorded word value, and
//! refolds written values to advance the root. A log is a witness of the
//! transition `pre_root → post_root` exactly when the fold accepts and
//! lands on `post_root`. Reset and cmio-response logs get additional shape
//! checks layered on top of the same fold.
//!
//! Verification is deterministic: identical inputs yield identical
//! results, with no dependence on clocks, threads, or allocation.

use thiserror::Error;
use tracing::instrument;

use crate::access_log::{Access, AccessLog, AccessType};
use crate::cmio::{fromhost_ack, response_word};
use crate::error::TreeError;
use crate::hasher::{word_hash, Hash};
use crate::machine::{reset_root_hash, MachineLayout, HTIF_FROMHOST_REL};
use crate::shadow::{
  csr_address, pma_board_contains, ShadowCsr, IFLAGS_Y_MASK, LOG2_WORD_SIZE, WORD_SIZE,
};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReplayError {
  #[error("access {index}: proof parameters do not match the machine schema")]
  SchemaMismatch { index: usize },
  #[error("access {index}: address is not word aligned")]
  MisalignedAddress { index: usize },
  #[error("access {index}: proof root does not match the current root")]
  StaleRoot { index: usize },
  #[error("access {index}: invalid access proof")]
  InvalidProof { index: usize },
  #[error("access {index}: read value does not match the proof target")]
  ValueMismatch { index: usize },
  #[error("access {index}: write access is missing its written value")]
  MissingWrittenValue { index: usize },
  #[error("access {index}: read access carries a written value")]
  UnexpectedWrittenValue { index: usize },
  #[error("final root does not match the expected post root")]
  RootMismatch,
  #[error("log is empty")]
  EmptyLog,
  #[error("access {index}: unexpected access shape for this step kind")]
  UnexpectedAccess { index: usize },
  #[error("access {index}: reset write does not clear its word")]
  NonPristineWrite { index: usize },
  #[error("reset does not reach the pristine post-reset root")]
  NotPristine,
  #[error("cmio response data does not fit in the rx buffer")]
  ResponseTooLong,
  #[error(transparent)]
  Tree(#[from] TreeError),
}

/// Checks one record against the root reached so far and returns the root
/// after the access.
fn replay_access(
  current_root: &Hash,
  access: &Access,
  index: usize,
  log2_root_size: u32,
) -> Result<Hash, ReplayError> {
  let proof = &access.proof;
  if access.log2_size != LOG2_WORD_SIZE
    || proof.log2_target_size() != LOG2_WORD_SIZE
    || proof.log2_root_size() != log2_root_size
    || proof.target_address() != access.address
  {
    return Err(ReplayError::SchemaMismatch { index });
  }
  if access.address & (WORD_SIZE - 1) != 0 {
    return Err(ReplayError::MisalignedAddress { index });
  }
  if proof.root_hash() != current_root {
    return Err(ReplayError::StaleRoot { index });
  }
  if !proof.verify() {
    return Err(ReplayError::InvalidProof { index });
  }
  if proof.target_hash() != &word_hash(access.read_value) {
    return Err(ReplayError::ValueMismatch { index });
  }
  match access.access_type {
    AccessType::Read => {
      if access.written_value.is_some() {
        return Err(ReplayError::UnexpectedWrittenValue { index });
      }
      Ok(*current_root)
    }
    AccessType::Write => {
      let written = access.written_value.ok_or(ReplayError::MissingWrittenValue { index })?;
      Ok(proof.fold(&word_hash(written)))
    }
  }
}

fn replay_log(pre_root: &Hash, log: &AccessLog, log2_root_size: u32) -> Result<Hash, ReplayError> {
  let mut root = *pre_root;
  for (index, access) in log.accesses().iter().enumerate() {
    root = replay_access(&root, access, index, log2_root_size)?;
  }
  Ok(root)
}

/// Structural verification of a log in isolation: the records must chain
/// from the root asserted by the first proof.
#[instrument(skip_all)]
pub fn verify_step_log(log: &AccessLog) -> Result<(), ReplayError> {
  let first = log.accesses().first().ok_or(ReplayError::EmptyLog)?;
  let pre_root = *first.proof.root_hash();
  replay_log(&pre_root, log, first.proof.log2_root_size())?;
  Ok(())
}

/// Full transition check: the log must replay `pre_root` to `post_root`.
#[instrument(skip_all)]
pub fn verify_step_transition(
  pre_root: &Hash,
  log: &AccessLog,
  post_root: &Hash,
) -> Result<(), ReplayError> {
  let root = match log.accesses().first() {
    Some(first) => replay_log(pre_root, log, first.proof.log2_root_size())?,
    None => *pre_root,
  };
  if &root != post_root {
    return Err(ReplayError::RootMismatch);
  }
  Ok(())
}

/// A reset log is all zero-writes, and none of them touches the PMA
/// board, which survives reset.
fn check_reset_shape(log: &AccessLog) -> Result<(), ReplayError> {
  for (index, access) in log.accesses().iter().enumerate() {
    if access.access_type != AccessType::Write || pma_board_contains(access.address) {
      return Err(ReplayError::UnexpectedAccess { index });
    }
    if access.written_value != Some(0) {
      return Err(ReplayError::NonPristineWrite { index });
    }
  }
  Ok(())
}

/// Structural verification of a reset log in isolation.
#[instrument(skip_all)]
pub fn verify_reset_log(log: &AccessLog, layout: &MachineLayout) -> Result<(), ReplayError> {
  check_reset_shape(log)?;
  let first = log.accesses().first().ok_or(ReplayError::EmptyLog)?;
  let pre_root = *first.proof.root_hash();
  replay_log(&pre_root, log, layout.log2_root_size)?;
  Ok(())
}

/// Reset transition check: a generic replay in which every record is a
/// write clearing a word outside the PMA board, ending on the layout's
/// post-reset root.
#[instrument(skip_all)]
pub fn verify_reset_transition(
  pre_root: &Hash,
  log: &AccessLog,
  post_root: &Hash,
  layout: &MachineLayout,
) -> Result<(), ReplayError> {
  check_reset_shape(log)?;
  let root = replay_log(pre_root, log, layout.log2_root_size)?;
  if root != reset_root_hash(layout)? {
    return Err(ReplayError::NotPristine);
  }
  if &root != post_root {
    return Err(ReplayError::RootMismatch);
  }
  Ok(())
}

/// A cmio-response log is the yielded-iflags read, the whole rx buffer
/// rewritten with the zero-padded response, the fromhost acknowledgement,
/// and the yield flag clear, in that order.
fn check_cmio_shape(
  reason: u16,
  data: &[u8],
  log: &AccessLog,
  layout: &MachineLayout,
) -> Result<(), ReplayError> {
  if data.len() as u64 > layout.rx_buffer_length {
    return Err(ReplayError::ResponseTooLong);
  }
  let accesses = log.accesses();
  let buffer_words = (layout.rx_buffer_length / WORD_SIZE) as usize;
  if accesses.len() != buffer_words + 3 {
    return Err(ReplayError::UnexpectedAccess { index: accesses.len() });
  }

  let iflags_address = csr_address(ShadowCsr::Iflags);
  let first = &accesses[0];
  if first.access_type != AccessType::Read
    || first.address != iflags_address
    || first.read_value & IFLAGS_Y_MASK == 0
  {
    return Err(ReplayError::UnexpectedAccess { index: 0 });
  }
  let yielded_iflags = first.read_value;

  for word in 0..buffer_words {
    let index = 1 + word;
    let access = &accesses[index];
    let offset = word as u64 * WORD_SIZE;
    if access.access_type != AccessType::Write
      || access.address != layout.rx_buffer_start + offset
      || access.written_value != Some(response_word(data, offset as usize))
    {
      return Err(ReplayError::UnexpectedAccess { index });
    }
  }

  let ack_index = buffer_words + 1;
  let ack = &accesses[ack_index];
  if ack.access_type != AccessType::Write
    || ack.address != layout.htif_start + HTIF_FROMHOST_REL
    || ack.written_value != Some(fromhost_ack(reason, data.len()))
  {
    return Err(ReplayError::UnexpectedAccess { index: ack_index });
  }

  let resume_index = buffer_words + 2;
  let resume = &accesses[resume_index];
  if resume.access_type != AccessType::Write
    || resume.address != iflags_address
    || resume.written_value != Some(yielded_iflags & !IFLAGS_Y_MASK)
  {
    return Err(ReplayError::UnexpectedAccess { index: resume_index });
  }
  Ok(())
}

/// Structural verification of a cmio-response log in isolation.
#[instrument(skip_all)]
pub fn verify_send_cmio_response_log(
  reason: u16,
  data: &[u8],
  log: &AccessLog,
  layout: &MachineLayout,
) -> Result<(), ReplayError> {
  check_cmio_shape(reason, data, log, layout)?;
  // Shape guarantees at least the iflags read is present.
  let pre_root = *log.accesses()[0].proof.root_hash();
  replay_log(&pre_root, log, layout.log2_root_size)?;
  Ok(())
}

/// CMIO response transition check: the same shape, replayed between the
/// claimed roots.
#[instrument(skip_all)]
pub fn verify_send_cmio_response_transition(
  reason: u16,
  data: &[u8],
  pre_root: &Hash,
  log: &AccessLog,
  post_root: &Hash,
  layout: &MachineLayout,
) -> Result<(), ReplayError> {
  check_cmio_shape(reason, data, log, layout)?;
  let root = replay_log(pre_root, log, layout.log2_root_size)?;
  if &root != post_root {
    return Err(ReplayError::RootMismatch);
  }
  Ok(())
}
