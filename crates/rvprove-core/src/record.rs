//! State access that records every operation with a Merkle proof.
//!
//! Each read appends a record carrying the word value and an inclusion
//! proof against the current machine root. Each write additionally carries
//! the stored value; the proof is taken against the pre-access root and its
//! siblings stay valid for recomputing the post-access root, which the
//! recording access maintains incrementally on the dense tree. Records
//! appear in exactly the order the interpreter performed the accesses.

use crate::access_log::{Access, AccessLog, AccessType};
use crate::hasher::word_hash;
use crate::machine::{Machine, MachineLayout};
use crate::shadow::{
  csr_address, pma_ilength_address, pma_istart_address, x_address, ShadowCsr, LOG2_WORD_SIZE,
};
use crate::state_access::StateAccess;

pub struct RecordStateAccess<'a> {
  machine: &'a mut Machine,
  log: AccessLog,
}

impl<'a> RecordStateAccess<'a> {
  /// The machine tree must be in sync with the raw state; the caller
  /// snapshots the pre root before constructing the recorder.
  pub fn new(machine: &'a mut Machine) -> Self {
    debug_assert!(!machine.tree_is_dirty(), "recording requires an in-sync tree");
    Self { machine, log: AccessLog::new() }
  }

  /// Seals and returns the log.
  pub fn into_log(self) -> AccessLog {
    self.log
  }

  fn log_read(&mut self, paddr: u64) -> u64 {
    let val = self.machine.read_word_raw(paddr);
    let proof = self.machine.tree_word_proof(paddr);
    self.log.push(Access {
      access_type: AccessType::Read,
      address: paddr,
      log2_size: LOG2_WORD_SIZE,
      read_value: val,
      written_value: None,
      proof,
    });
    val
  }

  fn log_write(&mut self, paddr: u64, val: u64) {
    let old = self.machine.read_word_raw(paddr);
    let proof = self.machine.tree_word_proof(paddr);
    self.machine.write_word_raw(paddr, val);
    // Unbacked words silently drop writes; fold whatever the state now
    // holds so the tree always matches it.
    let stored = self.machine.read_word_raw(paddr);
    self.machine.tree_update_word(paddr, word_hash(stored));
    self.log.push(Access {
      access_type: AccessType::Write,
      address: paddr,
      log2_size: LOG2_WORD_SIZE,
      read_value: old,
      written_value: Some(stored),
      proof,
    });
  }
}

impl StateAccess for RecordStateAccess<'_> {
  fn read_x(&mut self, reg: usize) -> u64 {
    self.log_read(x_address(reg))
  }

  fn write_x(&mut self, reg: usize, val: u64) {
    debug_assert!(reg != 0, "x0 is not writable");
    self.log_write(x_address(reg), val)
  }

  fn read_csr(&mut self, csr: ShadowCsr) -> u64 {
    self.log_read(csr_address(csr))
  }

  fn write_csr(&mut self, csr: ShadowCsr, val: u64) {
    self.log_write(csr_address(csr), val)
  }

  fn read_pma_istart(&mut self, index: usize) -> u64 {
    self.log_read(pma_istart_address(index))
  }

  fn read_pma_ilength(&mut self, index: usize) -> u64 {
    self.log_read(pma_ilength_address(index))
  }

  fn read_memory_word(&mut self, paddr: u64) -> u64 {
    self.log_read(paddr)
  }

  fn write_memory_word(&mut self, paddr: u64, val: u64) {
    self.log_write(paddr, val)
  }

  fn layout(&self) -> MachineLayout {
    self.machine.layout()
  }

  fn peek_word(&self, paddr: u64) -> u64 {
    self.machine.read_word_raw(paddr)
  }
}
