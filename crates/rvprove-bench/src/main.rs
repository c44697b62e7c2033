//! End-to-end timing of attested machine stepping.
//!
//! Builds a machine around a randomized arithmetic program, runs it on the
//! direct path, then re-runs it cycle by cycle on the recording path and
//! replays every log. Prints wall-clock timings and encoded log sizes.

use std::hint::black_box;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rvprove_core::machine::{Machine, MachineConfig};
use rvprove_core::replay::verify_step_transition;
use rvprove_core::shadow::ShadowCsr;

const CYCLES: u64 = 200;

fn addi(rd: u32, rs1: u32, imm: i32) -> u32 {
  (((imm as u32) & 0xfff) << 20) | (rs1 << 15) | (rd << 7) | 0x13
}

fn add(rd: u32, rs1: u32, rs2: u32) -> u32 {
  (rs2 << 20) | (rs1 << 15) | (rd << 7) | 0x33
}

fn xor(rd: u32, rs1: u32, rs2: u32) -> u32 {
  (rs2 << 20) | (rs1 << 15) | (4 << 12) | (rd << 7) | 0x33
}

fn jal_back(offset: u32) -> u32 {
  let imm = (offset as i32).wrapping_neg() as u32;
  (((imm >> 20) & 1) << 31)
    | (((imm >> 1) & 0x3ff) << 21)
    | (((imm >> 11) & 1) << 20)
    | (((imm >> 12) & 0xff) << 12)
    | 0x6f
}

/// A random arithmetic block over x1..x15, closed into an infinite loop.
fn random_program(rng: &mut StdRng, len: usize) -> Vec<u8> {
  let mut insns = Vec::with_capacity(len + 1);
  for reg in 1..16 {
    insns.push(addi(reg, 0, rng.gen_range(-2048..2048)));
  }
  while insns.len() < len {
    let rd = rng.gen_range(1..16);
    let rs1 = rng.gen_range(1..16);
    let rs2 = rng.gen_range(1..16);
    insns.push(if rng.gen_bool(0.5) { add(rd, rs1, rs2) } else { xor(rd, rs1, rs2) });
  }
  insns.push(jal_back(4 * insns.len() as u32));
  let mut image = Vec::with_capacity(insns.len() * 4);
  for insn in &insns {
    image.extend_from_slice(&insn.to_le_bytes());
  }
  image
}

fn main() {
  let mut rng = StdRng::seed_from_u64(42);
  let config = MachineConfig {
    log2_root_size: 16,
    ram_image: random_program(&mut rng, 64),
    ..MachineConfig::default()
  };

  // Direct path.
  let mut direct = Machine::new(config.clone()).unwrap();
  let start = Instant::now();
  direct.run(CYCLES);
  let direct_elapsed = start.elapsed();
  println!(
    "direct:   {CYCLES} cycles in {direct_elapsed:?} ({:.1} cycles/ms)",
    CYCLES as f64 / direct_elapsed.as_secs_f64() / 1000.0
  );

  // Recording path, one verified log per cycle.
  let mut recorded = Machine::new(config).unwrap();
  let mut log_bytes_json = 0usize;
  let mut log_bytes_binary = 0usize;
  let mut accesses = 0usize;
  let mut step_elapsed = std::time::Duration::ZERO;
  let mut verify_elapsed = std::time::Duration::ZERO;

  for _ in 0..CYCLES {
    let pre_root = recorded.root_hash().unwrap();
    let start = Instant::now();
    let log = recorded.step().unwrap();
    step_elapsed += start.elapsed();
    let post_root = recorded.root_hash().unwrap();

    let start = Instant::now();
    verify_step_transition(&pre_root, &log, &post_root).unwrap();
    verify_elapsed += start.elapsed();

    accesses += log.len();
    log_bytes_json += serde_json::to_vec(&log).unwrap().len();
    log_bytes_binary += bincode::serialize(&log).unwrap().len();
    black_box(log);
  }

  println!(
    "recorded: {CYCLES} cycles in {step_elapsed:?} ({} accesses, avg {} per cycle)",
    accesses,
    accesses as u64 / CYCLES
  );
  println!("replayed: {CYCLES} logs in {verify_elapsed:?}");
  println!(
    "log size: avg {} bytes bincode, {} bytes json",
    log_bytes_binary as u64 / CYCLES,
    log_bytes_json as u64 / CYCLES
  );

  assert_eq!(direct.root_hash().unwrap(), recorded.root_hash().unwrap());
  assert_eq!(direct.read_csr(ShadowCsr::Mcycle), recorded.read_csr(ShadowCsr::Mcycle));
  println!("direct and recorded roots agree");
}
