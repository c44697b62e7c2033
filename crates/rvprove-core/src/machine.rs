//! Machine state, physical address routing, and attested operations.
//!
//! The machine owns its state together with a dense Merkle tree over the
//! attested span. `run` drives the interpreter through the direct state
//! access (no hashing); `step`, `log_reset`, and `log_send_cmio_response`
//! drive the same code through the recording access and return an access
//! log that replays between the pre and post root hashes. Every recorded
//! log is verified before it is handed out.

use serde::{Deserialize, Serialize};

use crate::access_log::AccessLog;
use crate::cmio::send_cmio_response;
use crate::error::{MachineError, TreeError};
use crate::full_merkle::FullMerkleTree;
use crate::hasher::{word_hash, Hash};
use crate::interpret::interpret;
use crate::proof::MerkleProof;
use crate::record::RecordStateAccess;
use crate::replay;
use crate::shadow::{
  pma_board_contains, pma_ilength_address, pma_istart_address, pma_istart_pack, ShadowCsr,
  IFLAGS_H_MASK, IFLAGS_PRV_SHIFT, IFLAGS_Y_MASK, LOG2_WORD_SIZE, PMA_FLAG_E, PMA_FLAG_IO,
  PMA_FLAG_M, PMA_FLAG_R, PMA_FLAG_W, PMA_FLAG_X, PMA_MAX, PRV_M, SHADOW_CSR_COUNT,
  SHADOW_CSR_START, SHADOW_LENGTH, SHADOW_PMAS_START, WORD_SIZE, X_REG_COUNT,
};
use crate::state_access::{DirectStateAccess, StateAccess};

// ── HTIF device ───────────────────────────────────────────────────────

/// Length of the HTIF device range.
pub const HTIF_LENGTH: u64 = 0x100;
pub const HTIF_TOHOST_REL: u64 = 0;
pub const HTIF_FROMHOST_REL: u64 = 8;

pub const HTIF_DEV_HALT: u64 = 0;
pub const HTIF_DEV_YIELD: u64 = 2;
pub const HTIF_YIELD_MANUAL: u64 = 0;
pub const HTIF_YIELD_AUTOMATIC: u64 = 1;

/// Device field of a tohost word.
pub fn htif_dev(tohost: u64) -> u64 {
  tohost >> 56
}

/// Command field of a tohost word.
pub fn htif_cmd(tohost: u64) -> u64 {
  (tohost >> 48) & 0xff
}

/// Data field of a tohost word.
pub fn htif_data(tohost: u64) -> u64 {
  tohost & 0xffff_ffff_ffff
}

/// misa: RV64 with I, S, and U.
pub const MISA_INIT: u64 = (2 << 62) | (1 << 8) | (1 << 18) | (1 << 20);

// ── Configuration ─────────────────────────────────────────────────────

/// Placement of the machine inside its attested span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
  /// Log2 of the attested span in bytes.
  pub log2_root_size: u32,
  pub htif_start: u64,
  pub rx_buffer_start: u64,
  pub rx_buffer_length: u64,
  pub ram_start: u64,
  pub ram_length: u64,
  /// Boot image copied to the start of RAM.
  pub ram_image: Vec<u8>,
}

impl Default for MachineConfig {
  fn default() -> Self {
    Self {
      log2_root_size: 16,
      htif_start: 0x1000,
      rx_buffer_start: 0x2000,
      rx_buffer_length: 0x1000,
      ram_start: 0x4000,
      ram_length: 0x4000,
      ram_image: Vec::new(),
    }
  }
}

/// Copyable view of the layout, shared with the state-access
/// implementations and the cmio/reset operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineLayout {
  pub log2_root_size: u32,
  pub htif_start: u64,
  pub rx_buffer_start: u64,
  pub rx_buffer_length: u64,
  pub ram_start: u64,
  pub ram_length: u64,
}

impl MachineLayout {
  fn from_config(config: &MachineConfig) -> Self {
    Self {
      log2_root_size: config.log2_root_size,
      htif_start: config.htif_start,
      rx_buffer_start: config.rx_buffer_start,
      rx_buffer_length: config.rx_buffer_length,
      ram_start: config.ram_start,
      ram_length: config.ram_length,
    }
  }
}

// ── State ─────────────────────────────────────────────────────────────

/// Raw machine state, addressable word by word through the shadow layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineState {
  pub x: [u64; X_REG_COUNT],
  pub csrs: [u64; SHADOW_CSR_COUNT],
  /// PMA board entries as (istart, ilength) word pairs.
  pub pmas: [[u64; 2]; PMA_MAX],
  pub htif_tohost: u64,
  pub htif_fromhost: u64,
  pub rx_buffer: Vec<u8>,
  pub ram: Vec<u8>,
}

// ── Machine ───────────────────────────────────────────────────────────

pub struct Machine {
  config: MachineConfig,
  layout: MachineLayout,
  state: MachineState,
  tree: FullMerkleTree,
  tree_dirty: bool,
}

impl Machine {
  pub fn new(config: MachineConfig) -> Result<Self, MachineError> {
    validate_config(&config)?;
    let layout = MachineLayout::from_config(&config);

    let mut csrs = [0u64; SHADOW_CSR_COUNT];
    csrs[ShadowCsr::Pc as usize] = config.ram_start;
    csrs[ShadowCsr::Misa as usize] = MISA_INIT;
    csrs[ShadowCsr::Iflags as usize] = PRV_M << IFLAGS_PRV_SHIFT;

    let pmas = pma_board(&layout);

    let mut ram = vec![0u8; config.ram_length as usize];
    ram[..config.ram_image.len()].copy_from_slice(&config.ram_image);

    let state = MachineState {
      x: [0; X_REG_COUNT],
      csrs,
      pmas,
      htif_tohost: 0,
      htif_fromhost: 0,
      rx_buffer: vec![0u8; config.rx_buffer_length as usize],
      ram,
    };

    let mut machine = Self {
      config,
      layout,
      state,
      // Placeholder replaced by the rebuild below.
      tree: FullMerkleTree::new(LOG2_WORD_SIZE, LOG2_WORD_SIZE, LOG2_WORD_SIZE)?,
      tree_dirty: true,
    };
    machine.sync_tree()?;
    Ok(machine)
  }

  pub fn config(&self) -> &MachineConfig {
    &self.config
  }

  pub fn layout(&self) -> MachineLayout {
    self.layout
  }

  // ── direct state accessors ──────────────────────────────────────────

  pub fn read_x(&self, reg: usize) -> u64 {
    self.state.x[reg]
  }

  pub fn write_x(&mut self, reg: usize, val: u64) {
    debug_assert!(reg != 0, "x0 is not writable");
    self.state.x[reg] = val;
    self.tree_dirty = true;
  }

  pub fn read_csr(&self, csr: ShadowCsr) -> u64 {
    self.state.csrs[csr as usize]
  }

  pub fn write_csr(&mut self, csr: ShadowCsr, val: u64) {
    self.state.csrs[csr as usize] = val;
    self.tree_dirty = true;
  }

  pub fn halted(&self) -> bool {
    self.read_csr(ShadowCsr::Iflags) & IFLAGS_H_MASK != 0
  }

  pub fn yielded(&self) -> bool {
    self.read_csr(ShadowCsr::Iflags) & IFLAGS_Y_MASK != 0
  }

  /// Reads an aligned word anywhere in the attested span.
  pub fn read_word(&self, paddr: u64) -> Result<u64, MachineError> {
    self.check_word_address(paddr)?;
    Ok(self.read_word_raw(paddr))
  }

  /// Writes an aligned word anywhere in the attested span. Writes to
  /// unbacked addresses are discarded.
  pub fn write_word(&mut self, paddr: u64, val: u64) -> Result<(), MachineError> {
    self.check_word_address(paddr)?;
    self.write_word_raw(paddr, val);
    self.tree_dirty = true;
    Ok(())
  }

  fn check_word_address(&self, paddr: u64) -> Result<(), MachineError> {
    if paddr & (WORD_SIZE - 1) != 0 {
      return Err(MachineError::MisalignedAddress);
    }
    if paddr >> self.layout.log2_root_size != 0 {
      return Err(MachineError::Tree(TreeError::AddressOutOfBounds));
    }
    Ok(())
  }

  // ── attestation ─────────────────────────────────────────────────────

  /// Merkle root over the attested span.
  pub fn root_hash(&mut self) -> Result<Hash, MachineError> {
    self.sync_tree()?;
    Ok(*self.tree.root_hash())
  }

  /// Word inclusion proof against the current root.
  pub fn proof(&mut self, paddr: u64) -> Result<MerkleProof, MachineError> {
    self.check_word_address(paddr)?;
    self.sync_tree()?;
    Ok(self.tree.proof(paddr, LOG2_WORD_SIZE)?)
  }

  // ── operations ──────────────────────────────────────────────────────

  /// Runs the interpreter on the direct state access until `mcycle_end`
  /// or halt. No log is produced.
  pub fn run(&mut self, mcycle_end: u64) {
    let mut a = DirectStateAccess::new(self);
    interpret(&mut a, mcycle_end);
  }

  /// Executes exactly one cycle through the recording state access and
  /// returns the sealed access log. The log is self-verified against the
  /// pre/post roots before being returned.
  pub fn step(&mut self) -> Result<AccessLog, MachineError> {
    self.sync_tree()?;
    let pre_root = *self.tree.root_hash();
    let mcycle_end = self.read_csr(ShadowCsr::Mcycle) + 1;
    let mut a = RecordStateAccess::new(self);
    interpret(&mut a, mcycle_end);
    let log = a.into_log();
    let post_root = *self.tree.root_hash();
    replay::verify_step_transition(&pre_root, &log, &post_root)?;
    Ok(log)
  }

  /// Wipes the attested span back to the pristine state. The PMA board
  /// survives the wipe so the machine keeps its addressable ranges.
  pub fn reset(&mut self) {
    let mut a = DirectStateAccess::new(self);
    reset_state(&mut a);
  }

  /// Wipes the span through the recording access and returns the sealed
  /// log, verified to transition the pre root to [`reset_root_hash`].
  pub fn log_reset(&mut self) -> Result<AccessLog, MachineError> {
    self.sync_tree()?;
    let pre_root = *self.tree.root_hash();
    let layout = self.layout;
    let mut a = RecordStateAccess::new(self);
    reset_state(&mut a);
    let log = a.into_log();
    let post_root = *self.tree.root_hash();
    replay::verify_reset_transition(&pre_root, &log, &post_root, &layout)?;
    Ok(log)
  }

  /// Deposits a cmio response into the rx buffer of a yielded machine.
  pub fn send_cmio_response(&mut self, reason: u16, data: &[u8]) -> Result<(), MachineError> {
    let mut a = DirectStateAccess::new(self);
    send_cmio_response(&mut a, reason, data)
  }

  /// Recording counterpart of [`Machine::send_cmio_response`].
  pub fn log_send_cmio_response(&mut self, reason: u16, data: &[u8]) -> Result<AccessLog, MachineError> {
    self.sync_tree()?;
    let pre_root = *self.tree.root_hash();
    let layout = self.layout;
    let mut a = RecordStateAccess::new(self);
    send_cmio_response(&mut a, reason, data)?;
    let log = a.into_log();
    let post_root = *self.tree.root_hash();
    replay::verify_send_cmio_response_transition(reason, data, &pre_root, &log, &post_root, &layout)?;
    Ok(log)
  }

  // ── word routing ────────────────────────────────────────────────────

  pub(crate) fn read_word_raw(&self, paddr: u64) -> u64 {
    debug_assert_eq!(paddr & (WORD_SIZE - 1), 0);
    if paddr < SHADOW_CSR_START {
      return self.state.x[(paddr / WORD_SIZE) as usize];
    }
    if paddr < SHADOW_PMAS_START {
      let index = ((paddr - SHADOW_CSR_START) / WORD_SIZE) as usize;
      return if index < SHADOW_CSR_COUNT { self.state.csrs[index] } else { 0 };
    }
    if paddr < SHADOW_LENGTH {
      let index = ((paddr - SHADOW_PMAS_START) / WORD_SIZE) as usize;
      return if index < 2 * PMA_MAX { self.state.pmas[index / 2][index % 2] } else { 0 };
    }
    if paddr == self.layout.htif_start + HTIF_TOHOST_REL {
      return self.state.htif_tohost;
    }
    if paddr == self.layout.htif_start + HTIF_FROMHOST_REL {
      return self.state.htif_fromhost;
    }
    if let Some(offset) = range_offset(paddr, self.layout.rx_buffer_start, self.layout.rx_buffer_length) {
      return read_le_word(&self.state.rx_buffer, offset);
    }
    if let Some(offset) = range_offset(paddr, self.layout.ram_start, self.layout.ram_length) {
      return read_le_word(&self.state.ram, offset);
    }
    0
  }

  pub(crate) fn write_word_raw(&mut self, paddr: u64, val: u64) {
    debug_assert_eq!(paddr & (WORD_SIZE - 1), 0);
    if paddr < SHADOW_CSR_START {
      self.state.x[(paddr / WORD_SIZE) as usize] = val;
      return;
    }
    if paddr < SHADOW_PMAS_START {
      let index = ((paddr - SHADOW_CSR_START) / WORD_SIZE) as usize;
      if index < SHADOW_CSR_COUNT {
        self.state.csrs[index] = val;
      }
      return;
    }
    if paddr < SHADOW_LENGTH {
      let index = ((paddr - SHADOW_PMAS_START) / WORD_SIZE) as usize;
      if index < 2 * PMA_MAX {
        self.state.pmas[index / 2][index % 2] = val;
      }
      return;
    }
    if paddr == self.layout.htif_start + HTIF_TOHOST_REL {
      self.state.htif_tohost = val;
      return;
    }
    if paddr == self.layout.htif_start + HTIF_FROMHOST_REL {
      self.state.htif_fromhost = val;
      return;
    }
    if let Some(offset) = range_offset(paddr, self.layout.rx_buffer_start, self.layout.rx_buffer_length) {
      write_le_word(&mut self.state.rx_buffer, offset, val);
      return;
    }
    if let Some(offset) = range_offset(paddr, self.layout.ram_start, self.layout.ram_length) {
      write_le_word(&mut self.state.ram, offset, val);
    }
  }

  // ── tree maintenance ────────────────────────────────────────────────

  pub(crate) fn mark_dirty(&mut self) {
    self.tree_dirty = true;
  }

  pub(crate) fn tree_is_dirty(&self) -> bool {
    self.tree_dirty
  }

  /// Rebuilds the dense tree from the raw state if direct writes made it
  /// stale.
  pub(crate) fn sync_tree(&mut self) -> Result<(), TreeError> {
    if !self.tree_dirty {
      return Ok(());
    }
    let span = 1u64 << self.layout.log2_root_size;
    let mut leaves = Vec::with_capacity((span / WORD_SIZE) as usize);
    let mut paddr = 0;
    while paddr < span {
      leaves.push(word_hash(self.read_word_raw(paddr)));
      paddr += WORD_SIZE;
    }
    self.tree =
      FullMerkleTree::from_leaves(self.layout.log2_root_size, LOG2_WORD_SIZE, LOG2_WORD_SIZE, &leaves)?;
    self.tree_dirty = false;
    Ok(())
  }

  /// Word proof against the in-sync tree; recording-path internal.
  pub(crate) fn tree_word_proof(&self, paddr: u64) -> MerkleProof {
    debug_assert!(!self.tree_dirty);
    // The span covers every state address, so the lookup cannot fail.
    self.tree.proof(paddr, LOG2_WORD_SIZE).unwrap()
  }

  /// Incrementally folds one mutated word into the tree.
  pub(crate) fn tree_update_word(&mut self, paddr: u64, leaf: Hash) {
    debug_assert!(!self.tree_dirty);
    self.tree.update_leaf(paddr, leaf).unwrap()
  }
}

/// Zeroes every non-pristine word of the attested span except the PMA
/// board, taking any state to [`reset_root_hash`].
pub fn reset_state<A: StateAccess>(a: &mut A) {
  let span = 1u64 << a.layout().log2_root_size;
  let mut paddr = 0;
  while paddr < span {
    // The PMA board survives reset.
    if !pma_board_contains(paddr) && a.peek_word(paddr) != 0 {
      a.write_memory_word(paddr, 0);
    }
    paddr += WORD_SIZE;
  }
}

/// PMA board entries for a layout: the excluded shadow region, the HTIF
/// device, the cmio rx buffer, and RAM.
fn pma_board(layout: &MachineLayout) -> [[u64; 2]; PMA_MAX] {
  let mut pmas = [[0u64; 2]; PMA_MAX];
  pmas[0] = [pma_istart_pack(0, PMA_FLAG_E), SHADOW_LENGTH];
  pmas[1] = [pma_istart_pack(layout.htif_start, PMA_FLAG_IO | PMA_FLAG_R | PMA_FLAG_W), HTIF_LENGTH];
  pmas[2] = [
    pma_istart_pack(layout.rx_buffer_start, PMA_FLAG_M | PMA_FLAG_R | PMA_FLAG_W),
    layout.rx_buffer_length,
  ];
  pmas[3] = [
    pma_istart_pack(layout.ram_start, PMA_FLAG_M | PMA_FLAG_R | PMA_FLAG_W | PMA_FLAG_X),
    layout.ram_length,
  ];
  pmas
}

/// Root hash a machine reaches after a reset: every word pristine except
/// the PMA board, which always mirrors the configured layout.
pub fn reset_root_hash(layout: &MachineLayout) -> Result<Hash, TreeError> {
  let mut tree = FullMerkleTree::new(layout.log2_root_size, LOG2_WORD_SIZE, LOG2_WORD_SIZE)?;
  for (index, entry) in pma_board(layout).iter().enumerate() {
    let [istart, ilength] = *entry;
    if istart != 0 {
      tree.update_leaf(pma_istart_address(index), word_hash(istart))?;
    }
    if ilength != 0 {
      tree.update_leaf(pma_ilength_address(index), word_hash(ilength))?;
    }
  }
  Ok(*tree.root_hash())
}

fn range_offset(paddr: u64, start: u64, length: u64) -> Option<usize> {
  if paddr >= start && paddr < start + length {
    Some((paddr - start) as usize)
  } else {
    None
  }
}

fn read_le_word(data: &[u8], offset: usize) -> u64 {
  let mut bytes = [0u8; 8];
  bytes.copy_from_slice(&data[offset..offset + 8]);
  u64::from_le_bytes(bytes)
}

fn write_le_word(data: &mut [u8], offset: usize, val: u64) {
  data[offset..offset + 8].copy_from_slice(&val.to_le_bytes());
}

fn validate_config(config: &MachineConfig) -> Result<(), MachineError> {
  if config.log2_root_size > 63 {
    return Err(MachineError::InvalidConfig("log2_root_size is too large"));
  }
  if config.log2_root_size < 12 {
    return Err(MachineError::InvalidConfig("span does not cover the shadow region"));
  }
  let span = 1u64 << config.log2_root_size;
  let ranges = [
    ("htif", config.htif_start, HTIF_LENGTH),
    ("rx buffer", config.rx_buffer_start, config.rx_buffer_length),
    ("ram", config.ram_start, config.ram_length),
  ];
  for (_, start, length) in &ranges {
    if *length == 0 || length % WORD_SIZE != 0 {
      return Err(MachineError::InvalidConfig("range length is not a positive word multiple"));
    }
    if start & 0xff != 0 {
      return Err(MachineError::InvalidConfig("range start is not 256-byte aligned"));
    }
    if *start < SHADOW_LENGTH {
      return Err(MachineError::InvalidConfig("range overlaps the shadow region"));
    }
    let end = start.checked_add(*length).ok_or(MachineError::InvalidConfig("range wraps around"))?;
    if end > span {
      return Err(MachineError::InvalidConfig("range does not fit in the attested span"));
    }
  }
  let mut sorted = ranges;
  sorted.sort_by_key(|(_, start, _)| *start);
  for pair in sorted.windows(2) {
    if pair[0].1 + pair[0].2 > pair[1].1 {
      return Err(MachineError::InvalidConfig("ranges overlap"));
    }
  }
  if config.ram_image.len() as u64 > config.ram_length {
    return Err(MachineError::InvalidConfig("ram image does not fit in ram"));
  }
  Ok(())
}
