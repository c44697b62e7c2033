//! Shared helpers: a tiny RV64I assembler and machine builders.

use rvprove_core::machine::{Machine, MachineConfig};

pub const TEST_LOG2_ROOT_SIZE: u32 = 15;

/// Machine whose RAM starts with the given instructions; pc boots at the
/// first one.
pub fn machine_with_program(insns: &[u32]) -> Machine {
  let mut image = Vec::with_capacity(insns.len() * 4);
  for insn in insns {
    image.extend_from_slice(&insn.to_le_bytes());
  }
  Machine::new(MachineConfig {
    log2_root_size: TEST_LOG2_ROOT_SIZE,
    ram_image: image,
    ..MachineConfig::default()
  })
  .unwrap()
}

// ── encoders ──────────────────────────────────────────────────────────

fn r_type(funct7: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
  (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

fn i_type(imm: i32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
  (((imm as u32) & 0xfff) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

fn s_type(imm: i32, rs2: u32, rs1: u32, funct3: u32) -> u32 {
  let imm = imm as u32;
  (((imm >> 5) & 0x7f) << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | ((imm & 0x1f) << 7) | 0x23
}

fn b_type(imm: i32, rs2: u32, rs1: u32, funct3: u32) -> u32 {
  let imm = imm as u32;
  (((imm >> 12) & 1) << 31)
    | (((imm >> 5) & 0x3f) << 25)
    | (rs2 << 20)
    | (rs1 << 15)
    | (funct3 << 12)
    | (((imm >> 1) & 0xf) << 8)
    | (((imm >> 11) & 1) << 7)
    | 0x63
}

/// `imm` is the full 32-bit value; its low 12 bits must be zero.
pub fn lui(rd: u32, imm: u32) -> u32 {
  assert_eq!(imm & 0xfff, 0);
  imm | (rd << 7) | 0x37
}

pub fn addi(rd: u32, rs1: u32, imm: i32) -> u32 {
  i_type(imm, rs1, 0, rd, 0x13)
}

pub fn slli(rd: u32, rs1: u32, shamt: u32) -> u32 {
  i_type(shamt as i32, rs1, 1, rd, 0x13)
}

pub fn srai(rd: u32, rs1: u32, shamt: u32) -> u32 {
  i_type((0x400 | shamt) as i32, rs1, 5, rd, 0x13)
}

pub fn add(rd: u32, rs1: u32, rs2: u32) -> u32 {
  r_type(0, rs2, rs1, 0, rd, 0x33)
}

pub fn sub(rd: u32, rs1: u32, rs2: u32) -> u32 {
  r_type(0x20, rs2, rs1, 0, rd, 0x33)
}

pub fn xor(rd: u32, rs1: u32, rs2: u32) -> u32 {
  r_type(0, rs2, rs1, 4, rd, 0x33)
}

pub fn sltu(rd: u32, rs1: u32, rs2: u32) -> u32 {
  r_type(0, rs2, rs1, 3, rd, 0x33)
}

pub fn addw(rd: u32, rs1: u32, rs2: u32) -> u32 {
  r_type(0, rs2, rs1, 0, rd, 0x3b)
}

pub fn ld(rd: u32, rs1: u32, imm: i32) -> u32 {
  i_type(imm, rs1, 3, rd, 0x03)
}

pub fn lw(rd: u32, rs1: u32, imm: i32) -> u32 {
  i_type(imm, rs1, 2, rd, 0x03)
}

pub fn lbu(rd: u32, rs1: u32, imm: i32) -> u32 {
  i_type(imm, rs1, 4, rd, 0x03)
}

pub fn sd(rs2: u32, rs1: u32, imm: i32) -> u32 {
  s_type(imm, rs2, rs1, 3)
}

pub fn sw(rs2: u32, rs1: u32, imm: i32) -> u32 {
  s_type(imm, rs2, rs1, 2)
}

pub fn sb(rs2: u32, rs1: u32, imm: i32) -> u32 {
  s_type(imm, rs2, rs1, 0)
}

pub fn beq(rs1: u32, rs2: u32, imm: i32) -> u32 {
  b_type(imm, rs2, rs1, 0)
}

pub fn bne(rs1: u32, rs2: u32, imm: i32) -> u32 {
  b_type(imm, rs2, rs1, 1)
}

pub fn blt(rs1: u32, rs2: u32, imm: i32) -> u32 {
  b_type(imm, rs2, rs1, 4)
}

pub fn jal(rd: u32, imm: i32) -> u32 {
  let imm = imm as u32;
  (((imm >> 20) & 1) << 31)
    | (((imm >> 1) & 0x3ff) << 21)
    | (((imm >> 11) & 1) << 20)
    | (((imm >> 12) & 0xff) << 12)
    | (rd << 7)
    | 0x6f
}

pub fn jalr(rd: u32, rs1: u32, imm: i32) -> u32 {
  i_type(imm, rs1, 0, rd, 0x67)
}

pub fn ecall() -> u32 {
  0x0000_0073
}

pub fn ebreak() -> u32 {
  0x0010_0073
}

/// Stores to tohost to request a halt: t0 = 1; t1 = htif; sd t0, 0(t1).
pub fn halt_sequence() -> Vec<u32> {
  vec![addi(5, 0, 1), lui(6, 0x1000), sd(5, 6, 0)]
}

/// Stores the manual-yield command to tohost: tohost = 2 << 56.
pub fn yield_sequence() -> Vec<u32> {
  vec![addi(5, 0, 2), slli(5, 5, 56), lui(6, 0x1000), sd(5, 6, 0)]
}
