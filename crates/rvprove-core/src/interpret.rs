//! RV64I interpreter parameterised over the state-access implementation.
//!
//! One body, two instantiations: with [`DirectStateAccess`] every operation
//! is a plain state read or write; with [`RecordStateAccess`] the same
//! operations emit proved access records. The interpreter itself never
//! touches the state except through the access object, so the two paths
//! cannot diverge.
//!
//! The hart is in-order RV64I with M-mode and S-mode trap plumbing. CSR
//! instructions and the A/M/C extensions are not decoded here and raise
//! illegal-instruction; the surrounding system treats the full decoder as
//! an external collaborator.
//!
//! [`DirectStateAccess`]: crate::state_access::DirectStateAccess
//! [`RecordStateAccess`]: crate::record::RecordStateAccess

use crate::machine::{
  htif_cmd, htif_data, htif_dev, HTIF_DEV_HALT, HTIF_DEV_YIELD, HTIF_TOHOST_REL,
  HTIF_YIELD_AUTOMATIC, HTIF_YIELD_MANUAL,
};
use crate::shadow::{
  iflags_prv, iflags_set_prv, pma_istart_unpack, IFLAGS_H_MASK, IFLAGS_X_MASK, IFLAGS_Y_MASK,
  PMA_FLAG_IO, PMA_FLAG_M, PMA_FLAG_R, PMA_FLAG_W, PMA_FLAG_X, PMA_MAX, PRV_M, PRV_S,
};
use crate::state_access::StateAccess;

// ── Exception causes ──────────────────────────────────────────────────

pub const CAUSE_MISALIGNED_FETCH: u64 = 0;
pub const CAUSE_FETCH_FAULT: u64 = 1;
pub const CAUSE_ILLEGAL_INSN: u64 = 2;
pub const CAUSE_BREAKPOINT: u64 = 3;
pub const CAUSE_MISALIGNED_LOAD: u64 = 4;
pub const CAUSE_LOAD_FAULT: u64 = 5;
pub const CAUSE_MISALIGNED_STORE: u64 = 6;
pub const CAUSE_STORE_FAULT: u64 = 7;
pub const CAUSE_ECALL_BASE: u64 = 8;
pub const CAUSE_INTERRUPT_FLAG: u64 = 1 << 63;

// ── mstatus fields ────────────────────────────────────────────────────

pub const MSTATUS_SIE: u64 = 1 << 1;
pub const MSTATUS_MIE: u64 = 1 << 3;
pub const MSTATUS_SPIE: u64 = 1 << 5;
pub const MSTATUS_MPIE: u64 = 1 << 7;
pub const MSTATUS_SPP: u64 = 1 << 8;
pub const MSTATUS_MPP: u64 = 3 << 11;

/// Whether the executed instruction retired or trapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecStatus {
  Retired,
  Trapped,
}

/// Runs the hart until `mcycle` reaches `mcycle_end` or the machine
/// halts or yields. Exactly one instruction (or trap, or interrupt) is
/// processed per cycle.
pub fn interpret<A: StateAccess>(a: &mut A, mcycle_end: u64) {
  loop {
    let iflags = a.read_iflags();
    if iflags & (IFLAGS_H_MASK | IFLAGS_Y_MASK | IFLAGS_X_MASK) != 0 {
      return;
    }
    let mcycle = a.read_mcycle();
    if mcycle >= mcycle_end {
      return;
    }
    if poll_interrupts(a) {
      a.write_mcycle(mcycle.wrapping_add(1));
      continue;
    }
    let pc = a.read_pc();
    if let Some(insn) = fetch_insn(a, pc) {
      if execute_insn(a, pc, insn) == ExecStatus::Retired {
        let minstret = a.read_minstret();
        a.write_minstret(minstret.wrapping_add(1));
      }
    }
    a.write_mcycle(mcycle.wrapping_add(1));
  }
}

// ── Traps and interrupts ──────────────────────────────────────────────

/// Takes the highest-priority pending enabled interrupt, if any.
fn poll_interrupts<A: StateAccess>(a: &mut A) -> bool {
  let mip = a.read_mip();
  if mip == 0 {
    return false;
  }
  let mie = a.read_mie();
  let pending = mip & mie;
  if pending == 0 {
    return false;
  }
  let iflags = a.read_iflags();
  if iflags_prv(iflags) == PRV_M {
    let mstatus = a.read_mstatus();
    if mstatus & MSTATUS_MIE == 0 {
      return false;
    }
  }
  let bit = pending.trailing_zeros() as u64;
  let pc = a.read_pc();
  raise_exception(a, pc, CAUSE_INTERRUPT_FLAG | bit, 0);
  true
}

/// Enters the trap handler for `cause`, delegating to S-mode when the
/// corresponding medeleg/mideleg bit is set.
fn raise_exception<A: StateAccess>(a: &mut A, pc: u64, cause: u64, tval: u64) {
  let iflags = a.read_iflags();
  let prv = iflags_prv(iflags);
  let bit = cause & 63;
  let deleg = if cause & CAUSE_INTERRUPT_FLAG != 0 {
    a.read_mideleg()
  } else {
    a.read_medeleg()
  };
  if prv <= PRV_S && (deleg >> bit) & 1 != 0 {
    a.write_scause(cause);
    a.write_sepc(pc);
    a.write_stval(tval);
    let mut mstatus = a.read_mstatus();
    mstatus = (mstatus & !MSTATUS_SPIE) | (((mstatus & MSTATUS_SIE) >> 1) << 5);
    mstatus &= !MSTATUS_SIE;
    mstatus = (mstatus & !MSTATUS_SPP) | (prv << 8);
    a.write_mstatus(mstatus);
    a.write_iflags(iflags_set_prv(iflags, PRV_S));
    let stvec = a.read_stvec();
    a.write_pc(stvec & !3);
  } else {
    a.write_mcause(cause);
    a.write_mepc(pc);
    a.write_mtval(tval);
    let mut mstatus = a.read_mstatus();
    mstatus = (mstatus & !MSTATUS_MPIE) | (((mstatus & MSTATUS_MIE) >> 3) << 7);
    mstatus &= !MSTATUS_MIE;
    mstatus = (mstatus & !MSTATUS_MPP) | (prv << 11);
    a.write_mstatus(mstatus);
    a.write_iflags(iflags_set_prv(iflags, PRV_M));
    let mtvec = a.read_mtvec();
    a.write_pc(mtvec & !3);
  }
}

// ── Physical memory attributes ────────────────────────────────────────

/// Scans the PMA board for the range containing `[paddr, paddr + len)`.
/// The board is packed, so an empty ilength ends the scan.
fn find_pma<A: StateAccess>(a: &mut A, paddr: u64, len: u64) -> Option<(u64, u64)> {
  let end = paddr.checked_add(len)?;
  for index in 0..PMA_MAX {
    let istart = a.read_pma_istart(index);
    let ilength = a.read_pma_ilength(index);
    if ilength == 0 {
      return None;
    }
    let (start, flags) = pma_istart_unpack(istart);
    if paddr >= start && end <= start + ilength {
      return Some((start, flags));
    }
  }
  None
}

// ── Fetch ─────────────────────────────────────────────────────────────

/// Fetches the 32-bit instruction at `pc`, or raises and returns `None`.
fn fetch_insn<A: StateAccess>(a: &mut A, pc: u64) -> Option<u32> {
  if pc & 3 != 0 {
    raise_exception(a, pc, CAUSE_MISALIGNED_FETCH, pc);
    return None;
  }
  match find_pma(a, pc, 4) {
    Some((_, flags)) if flags & PMA_FLAG_M != 0 && flags & PMA_FLAG_X != 0 => {}
    _ => {
      raise_exception(a, pc, CAUSE_FETCH_FAULT, pc);
      return None;
    }
  }
  let word = a.read_memory_word(pc & !7);
  Some(if pc & 4 != 0 { (word >> 32) as u32 } else { word as u32 })
}

// ── Decode helpers ────────────────────────────────────────────────────

fn insn_rd(insn: u32) -> usize {
  ((insn >> 7) & 0x1f) as usize
}

fn insn_rs1(insn: u32) -> usize {
  ((insn >> 15) & 0x1f) as usize
}

fn insn_rs2(insn: u32) -> usize {
  ((insn >> 20) & 0x1f) as usize
}

fn insn_funct3(insn: u32) -> u32 {
  (insn >> 12) & 7
}

fn insn_funct7(insn: u32) -> u32 {
  insn >> 25
}

fn insn_i_imm(insn: u32) -> i64 {
  ((insn as i32) >> 20) as i64
}

fn insn_u_imm(insn: u32) -> i64 {
  (insn & 0xffff_f000) as i32 as i64
}

fn insn_s_imm(insn: u32) -> i64 {
  ((((insn as i32) >> 25) as i64) << 5) | (((insn >> 7) & 0x1f) as i64)
}

fn insn_b_imm(insn: u32) -> i64 {
  ((((insn as i32) >> 31) as i64) << 12)
    | ((((insn >> 7) & 1) as i64) << 11)
    | ((((insn >> 25) & 0x3f) as i64) << 5)
    | ((((insn >> 8) & 0xf) as i64) << 1)
}

fn insn_j_imm(insn: u32) -> i64 {
  ((((insn as i32) >> 31) as i64) << 20)
    | ((((insn >> 12) & 0xff) as i64) << 12)
    | ((((insn >> 20) & 1) as i64) << 11)
    | ((((insn >> 21) & 0x3ff) as i64) << 1)
}

fn sign_extend(raw: u64, bits: u32) -> u64 {
  ((raw << (64 - bits)) as i64 >> (64 - bits)) as u64
}

// ── Execute ───────────────────────────────────────────────────────────

fn advance<A: StateAccess>(a: &mut A, pc: u64) -> ExecStatus {
  a.write_pc(pc.wrapping_add(4));
  ExecStatus::Retired
}

fn write_rd<A: StateAccess>(a: &mut A, rd: usize, val: u64) {
  if rd != 0 {
    a.write_x(rd, val);
  }
}

fn raise_illegal<A: StateAccess>(a: &mut A, pc: u64, insn: u32) -> ExecStatus {
  raise_exception(a, pc, CAUSE_ILLEGAL_INSN, insn as u64);
  ExecStatus::Trapped
}

fn execute_insn<A: StateAccess>(a: &mut A, pc: u64, insn: u32) -> ExecStatus {
  match insn & 0x7f {
    0x37 => {
      // LUI
      write_rd(a, insn_rd(insn), insn_u_imm(insn) as u64);
      advance(a, pc)
    }
    0x17 => {
      // AUIPC
      write_rd(a, insn_rd(insn), pc.wrapping_add(insn_u_imm(insn) as u64));
      advance(a, pc)
    }
    0x6f => {
      // JAL
      write_rd(a, insn_rd(insn), pc.wrapping_add(4));
      a.write_pc(pc.wrapping_add(insn_j_imm(insn) as u64));
      ExecStatus::Retired
    }
    0x67 if insn_funct3(insn) == 0 => {
      // JALR
      let target = a.read_x(insn_rs1(insn)).wrapping_add(insn_i_imm(insn) as u64) & !1;
      write_rd(a, insn_rd(insn), pc.wrapping_add(4));
      a.write_pc(target);
      ExecStatus::Retired
    }
    0x63 => execute_branch(a, pc, insn),
    0x03 => execute_load(a, pc, insn),
    0x23 => execute_store(a, pc, insn),
    0x13 => execute_op_imm(a, pc, insn),
    0x1b => execute_op_imm_32(a, pc, insn),
    0x33 => execute_op(a, pc, insn),
    0x3b => execute_op_32(a, pc, insn),
    0x0f => {
      // FENCE and FENCE.I are no-ops on an in-order single hart.
      advance(a, pc)
    }
    0x73 => match insn {
      0x0000_0073 => {
        // ECALL
        let iflags = a.read_iflags();
        raise_exception(a, pc, CAUSE_ECALL_BASE + iflags_prv(iflags), 0);
        ExecStatus::Trapped
      }
      0x0010_0073 => {
        // EBREAK
        raise_exception(a, pc, CAUSE_BREAKPOINT, pc);
        ExecStatus::Trapped
      }
      _ => raise_illegal(a, pc, insn),
    },
    _ => raise_illegal(a, pc, insn),
  }
}

fn execute_branch<A: StateAccess>(a: &mut A, pc: u64, insn: u32) -> ExecStatus {
  let lhs = a.read_x(insn_rs1(insn));
  let rhs = a.read_x(insn_rs2(insn));
  let taken = match insn_funct3(insn) {
    0 => lhs == rhs,
    1 => lhs != rhs,
    4 => (lhs as i64) < (rhs as i64),
    5 => (lhs as i64) >= (rhs as i64),
    6 => lhs < rhs,
    7 => lhs >= rhs,
    _ => return raise_illegal(a, pc, insn),
  };
  if taken {
    a.write_pc(pc.wrapping_add(insn_b_imm(insn) as u64));
    ExecStatus::Retired
  } else {
    advance(a, pc)
  }
}

fn execute_load<A: StateAccess>(a: &mut A, pc: u64, insn: u32) -> ExecStatus {
  let (size_log2, signed) = match insn_funct3(insn) {
    0 => (0, true),  // LB
    1 => (1, true),  // LH
    2 => (2, true),  // LW
    3 => (3, true),  // LD
    4 => (0, false), // LBU
    5 => (1, false), // LHU
    6 => (2, false), // LWU
    _ => return raise_illegal(a, pc, insn),
  };
  let vaddr = a.read_x(insn_rs1(insn)).wrapping_add(insn_i_imm(insn) as u64);
  let size = 1u64 << size_log2;
  if vaddr & (size - 1) != 0 {
    raise_exception(a, pc, CAUSE_MISALIGNED_LOAD, vaddr);
    return ExecStatus::Trapped;
  }
  let readable = match find_pma(a, vaddr, size) {
    Some((_, flags)) if flags & PMA_FLAG_R != 0 => {
      // Device ranges only support whole-word access.
      flags & PMA_FLAG_M != 0 || (flags & PMA_FLAG_IO != 0 && size_log2 == 3)
    }
    _ => false,
  };
  if !readable {
    raise_exception(a, pc, CAUSE_LOAD_FAULT, vaddr);
    return ExecStatus::Trapped;
  }
  let word = a.read_memory_word(vaddr & !7);
  let bits = 8u32 << size_log2;
  let raw = if bits == 64 {
    word
  } else {
    (word >> ((vaddr & 7) * 8)) & ((1u64 << bits) - 1)
  };
  let val = if signed { sign_extend(raw, bits) } else { raw };
  write_rd(a, insn_rd(insn), val);
  advance(a, pc)
}

fn execute_store<A: StateAccess>(a: &mut A, pc: u64, insn: u32) -> ExecStatus {
  let size_log2 = match insn_funct3(insn) {
    0 => 0, // SB
    1 => 1, // SH
    2 => 2, // SW
    3 => 3, // SD
    _ => return raise_illegal(a, pc, insn),
  };
  let vaddr = a.read_x(insn_rs1(insn)).wrapping_add(insn_s_imm(insn) as u64);
  let size = 1u64 << size_log2;
  if vaddr & (size - 1) != 0 {
    raise_exception(a, pc, CAUSE_MISALIGNED_STORE, vaddr);
    return ExecStatus::Trapped;
  }
  let flags = match find_pma(a, vaddr, size) {
    Some((_, flags)) if flags & PMA_FLAG_W != 0 => {
      if flags & PMA_FLAG_M != 0 || (flags & PMA_FLAG_IO != 0 && size_log2 == 3) {
        flags
      } else {
        raise_exception(a, pc, CAUSE_STORE_FAULT, vaddr);
        return ExecStatus::Trapped;
      }
    }
    _ => {
      raise_exception(a, pc, CAUSE_STORE_FAULT, vaddr);
      return ExecStatus::Trapped;
    }
  };
  let val = a.read_x(insn_rs2(insn));
  if size_log2 == 3 {
    a.write_memory_word(vaddr, val);
  } else {
    let old = a.read_memory_word(vaddr & !7);
    let shift = (vaddr & 7) * 8;
    let mask = ((1u64 << (8 << size_log2)) - 1) << shift;
    a.write_memory_word(vaddr & !7, (old & !mask) | ((val << shift) & mask));
  }
  if flags & PMA_FLAG_IO != 0 && vaddr & !7 == a.layout().htif_start + HTIF_TOHOST_REL {
    htif_handle_tohost(a);
  }
  advance(a, pc)
}

/// Processes a guest write to the HTIF tohost word.
fn htif_handle_tohost<A: StateAccess>(a: &mut A) {
  let tohost = a.read_htif_tohost();
  let dev = htif_dev(tohost);
  let cmd = htif_cmd(tohost);
  let data = htif_data(tohost);
  if dev == HTIF_DEV_HALT && cmd == 0 && data & 1 != 0 {
    let iflags = a.read_iflags();
    a.write_iflags(iflags | IFLAGS_H_MASK);
  } else if dev == HTIF_DEV_YIELD && cmd == HTIF_YIELD_MANUAL {
    let iflags = a.read_iflags();
    a.write_iflags(iflags | IFLAGS_Y_MASK);
  } else if dev == HTIF_DEV_YIELD && cmd == HTIF_YIELD_AUTOMATIC {
    let iflags = a.read_iflags();
    a.write_iflags(iflags | IFLAGS_X_MASK);
  }
}

fn execute_op_imm<A: StateAccess>(a: &mut A, pc: u64, insn: u32) -> ExecStatus {
  let rs1 = a.read_x(insn_rs1(insn));
  let imm = insn_i_imm(insn);
  let shamt = ((insn >> 20) & 0x3f) as u32;
  let val = match insn_funct3(insn) {
    0 => rs1.wrapping_add(imm as u64),
    1 if insn_funct7(insn) & !1 == 0 => rs1 << shamt,
    2 => ((rs1 as i64) < imm) as u64,
    3 => (rs1 < imm as u64) as u64,
    4 => rs1 ^ imm as u64,
    5 if insn_funct7(insn) & !1 == 0 => rs1 >> shamt,
    5 if insn_funct7(insn) & !1 == 0x20 => ((rs1 as i64) >> shamt) as u64,
    6 => rs1 | imm as u64,
    7 => rs1 & imm as u64,
    _ => return raise_illegal(a, pc, insn),
  };
  write_rd(a, insn_rd(insn), val);
  advance(a, pc)
}

fn execute_op_imm_32<A: StateAccess>(a: &mut A, pc: u64, insn: u32) -> ExecStatus {
  let rs1 = a.read_x(insn_rs1(insn));
  let shamt = ((insn >> 20) & 0x1f) as u32;
  let val = match (insn_funct3(insn), insn_funct7(insn)) {
    (0, _) => rs1.wrapping_add(insn_i_imm(insn) as u64) as i32 as u64,
    (1, 0) => ((rs1 as u32) << shamt) as i32 as u64,
    (5, 0) => ((rs1 as u32) >> shamt) as i32 as u64,
    (5, 0x20) => ((rs1 as i32) >> shamt) as u64,
    _ => return raise_illegal(a, pc, insn),
  };
  write_rd(a, insn_rd(insn), val);
  advance(a, pc)
}

fn execute_op<A: StateAccess>(a: &mut A, pc: u64, insn: u32) -> ExecStatus {
  let rs1 = a.read_x(insn_rs1(insn));
  let rs2 = a.read_x(insn_rs2(insn));
  let val = match (insn_funct3(insn), insn_funct7(insn)) {
    (0, 0) => rs1.wrapping_add(rs2),
    (0, 0x20) => rs1.wrapping_sub(rs2),
    (1, 0) => rs1 << (rs2 & 63),
    (2, 0) => ((rs1 as i64) < (rs2 as i64)) as u64,
    (3, 0) => (rs1 < rs2) as u64,
    (4, 0) => rs1 ^ rs2,
    (5, 0) => rs1 >> (rs2 & 63),
    (5, 0x20) => ((rs1 as i64) >> (rs2 & 63)) as u64,
    (6, 0) => rs1 | rs2,
    (7, 0) => rs1 & rs2,
    _ => return raise_illegal(a, pc, insn),
  };
  write_rd(a, insn_rd(insn), val);
  advance(a, pc)
}

fn execute_op_32<A: StateAccess>(a: &mut A, pc: u64, insn: u32) -> ExecStatus {
  let rs1 = a.read_x(insn_rs1(insn));
  let rs2 = a.read_x(insn_rs2(insn));
  let val = match (insn_funct3(insn), insn_funct7(insn)) {
    (0, 0) => (rs1 as u32).wrapping_add(rs2 as u32) as i32 as u64,
    (0, 0x20) => (rs1 as u32).wrapping_sub(rs2 as u32) as i32 as u64,
    (1, 0) => ((rs1 as u32) << (rs2 & 31)) as i32 as u64,
    (5, 0) => ((rs1 as u32) >> (rs2 & 31)) as i32 as u64,
    (5, 0x20) => ((rs1 as i32) >> (rs2 & 31)) as u64,
    _ => return raise_illegal(a, pc, insn),
  };
  write_rd(a, insn_rd(insn), val);
  advance(a, pc)
}
