//! End-to-end step logging and replay verification.

mod common;

use common::*;
use rvprove_core::access_log::{AccessLog, AccessType};
use rvprove_core::error::MachineError;
use rvprove_core::hasher::Hash;
use rvprove_core::interpret::{
  CAUSE_BREAKPOINT, CAUSE_ECALL_BASE, CAUSE_ILLEGAL_INSN, CAUSE_INTERRUPT_FLAG,
  CAUSE_MISALIGNED_LOAD, CAUSE_STORE_FAULT, MSTATUS_MIE, MSTATUS_MPP,
};
use rvprove_core::machine::{reset_root_hash, Machine};
use rvprove_core::replay::{
  verify_reset_log, verify_reset_transition, verify_send_cmio_response_log,
  verify_send_cmio_response_transition, verify_step_log, verify_step_transition, ReplayError,
};
use rvprove_core::shadow::{
  pma_board_contains, ShadowCsr, IFLAGS_PRV_SHIFT, IFLAGS_Y_MASK, LOG2_WORD_SIZE, PRV_M,
};

/// Steps the machine once and checks the log against the observed roots.
fn checked_step(m: &mut Machine) -> (Hash, AccessLog, Hash) {
  let pre_root = m.root_hash().unwrap();
  let log = m.step().unwrap();
  let post_root = m.root_hash().unwrap();
  verify_step_log(&log).unwrap();
  verify_step_transition(&pre_root, &log, &post_root).unwrap();
  (pre_root, log, post_root)
}

fn run_to_halt(m: &mut Machine) {
  while !m.halted() {
    m.run(m.read_csr(ShadowCsr::Mcycle) + 1000);
  }
}

fn step_to_halt(m: &mut Machine) -> Vec<(Hash, AccessLog, Hash)> {
  let mut transitions = Vec::new();
  while !m.halted() {
    transitions.push(checked_step(m));
  }
  transitions
}

#[test]
fn test_arithmetic_program_runs_and_halts() {
  let mut program = vec![
    addi(1, 0, 5),
    addi(2, 0, 7),
    add(3, 1, 2),
    sub(4, 2, 1),
    xor(28, 1, 2),
    sltu(29, 1, 2),
  ];
  program.extend(halt_sequence());
  let mut m = machine_with_program(&program);
  run_to_halt(&mut m);
  assert_eq!(m.read_x(3), 12);
  assert_eq!(m.read_x(4), 2);
  assert_eq!(m.read_x(28), 2);
  assert_eq!(m.read_x(29), 1);
  assert_eq!(m.read_csr(ShadowCsr::Minstret), program.len() as u64);
}

#[test]
fn test_step_equivalence_with_direct_run() {
  let mut program = vec![addi(1, 0, 42), addi(2, 0, -3), add(3, 1, 2), addw(4, 3, 1)];
  program.extend(halt_sequence());

  let mut stepped = machine_with_program(&program);
  let mut direct = machine_with_program(&program);

  let transitions = step_to_halt(&mut stepped);
  run_to_halt(&mut direct);

  assert_eq!(stepped.root_hash().unwrap(), direct.root_hash().unwrap());
  assert_eq!(stepped.read_x(3), 39);
  assert_eq!(stepped.read_x(4), 81);

  // Transitions chain: each post root is the next pre root.
  for pair in transitions.windows(2) {
    assert_eq!(pair[0].2, pair[1].0);
  }
}

#[test]
fn test_branch_loop_program() {
  // x1 = 5; x2 = 0; loop: x2 += x1; x1 -= 1; bne x1, x0, loop
  let mut program = vec![
    addi(1, 0, 5),
    addi(2, 0, 0),
    add(2, 2, 1),
    addi(1, 1, -1),
    bne(1, 0, -8),
  ];
  program.extend(halt_sequence());
  let mut m = machine_with_program(&program);
  run_to_halt(&mut m);
  assert_eq!(m.read_x(2), 15);
  assert_eq!(m.read_x(1), 0);
}

#[test]
fn test_comparison_branches_and_shifts() {
  let mut program = vec![
    addi(1, 0, -8),
    srai(2, 1, 2),  // x2 = -2
    blt(1, 2, 8),   // -8 < -2, skip the poison write
    addi(3, 0, 111),
    beq(2, 2, 8),   // taken, skip the poison write
    addi(4, 0, 222),
  ];
  program.extend(halt_sequence());
  let mut m = machine_with_program(&program);
  run_to_halt(&mut m);
  assert_eq!(m.read_x(2), -2i64 as u64);
  assert_eq!(m.read_x(3), 0);
  assert_eq!(m.read_x(4), 0);
}

#[test]
fn test_jal_and_jalr_link_and_jump() {
  let ram = 0x4000u32;
  // 0x00: jal x1, +16 → 0x10, linking x1 = 0x04
  // 0x04: halt island, reached by the jalr return
  // 0x10: jalr x0, x1, 0 → 0x04
  let mut program = vec![jal(1, 16)];
  program.extend(halt_sequence());
  program.push(jalr(0, 1, 0));
  let mut m = machine_with_program(&program);
  run_to_halt(&mut m);
  assert_eq!(m.read_x(1), (ram + 4) as u64);
}

#[test]
fn test_memory_program_subword_accesses() {
  let scratch = 0x100; // offset into RAM, reachable from the data base below
  let mut program = vec![
    lui(10, 0x4000),      // x10 = ram base
    addi(11, 0, 0x77),
    sw(11, 10, scratch),  // store word
    lw(12, 10, scratch),  // load it back
    sb(11, 10, scratch + 9),
    lbu(13, 10, scratch + 9),
    ld(14, 10, scratch + 8), // whole word holding the stored byte
  ];
  program.extend(halt_sequence());
  let mut m = machine_with_program(&program);
  run_to_halt(&mut m);
  assert_eq!(m.read_x(12), 0x77);
  assert_eq!(m.read_x(13), 0x77);
  assert_eq!(m.read_x(14), 0x77 << 8);
}

#[test]
fn test_every_step_of_a_memory_program_replays() {
  let mut program = vec![
    lui(10, 0x4000),
    addi(11, 0, 1234),
    sd(11, 10, 0x200),
    ld(12, 10, 0x200),
  ];
  program.extend(halt_sequence());
  let mut m = machine_with_program(&program);
  let transitions = step_to_halt(&mut m);
  assert_eq!(m.read_x(12), 1234);
  // A store step contains at least one write with a reusable proof.
  let store_step = &transitions[2].1;
  assert!(store_step
    .accesses()
    .iter()
    .any(|a| a.access_type == AccessType::Write && a.written_value == Some(1234)));
}

#[test]
fn test_tampered_logs_are_rejected() {
  let mut program = vec![addi(1, 0, 9)];
  program.extend(halt_sequence());
  let mut m = machine_with_program(&program);
  let (pre_root, log, post_root) = checked_step(&mut m);

  // Tamper a read value.
  let mut accesses = log.accesses().to_vec();
  accesses[0].read_value ^= 1;
  let tampered = rebuild_log(accesses);
  assert!(verify_step_transition(&pre_root, &tampered, &post_root).is_err());

  // Tamper a written value.
  let mut accesses = log.accesses().to_vec();
  let write_index = accesses.iter().position(|a| a.access_type == AccessType::Write).unwrap();
  accesses[write_index].written_value = Some(accesses[write_index].written_value.unwrap() ^ 1);
  let tampered = rebuild_log(accesses);
  assert!(verify_step_transition(&pre_root, &tampered, &post_root).is_err());

  // Tamper a sibling hash.
  let mut accesses = log.accesses().to_vec();
  let mut sibling = *accesses[0].proof.sibling_hash(LOG2_WORD_SIZE).unwrap();
  sibling[7] ^= 0x80;
  accesses[0].proof.set_sibling_hash(sibling, LOG2_WORD_SIZE).unwrap();
  let tampered = rebuild_log(accesses);
  assert!(verify_step_transition(&pre_root, &tampered, &post_root).is_err());

  // Drop a record.
  let mut accesses = log.accesses().to_vec();
  accesses.pop();
  let tampered = rebuild_log(accesses);
  assert!(verify_step_transition(&pre_root, &tampered, &post_root).is_err());

  // Wrong roots.
  let mut bad_root = pre_root;
  bad_root[0] ^= 1;
  assert!(verify_step_transition(&bad_root, &log, &post_root).is_err());
  assert!(verify_step_transition(&pre_root, &log, &bad_root).is_err());
}

fn rebuild_log(accesses: Vec<rvprove_core::access_log::Access>) -> AccessLog {
  let mut log = AccessLog::new();
  for access in accesses {
    log.push(access);
  }
  log
}

#[test]
fn test_step_logs_are_deterministic() {
  let mut program = vec![addi(1, 0, 3), add(2, 1, 1)];
  program.extend(halt_sequence());
  let mut a = machine_with_program(&program);
  let mut b = machine_with_program(&program);
  loop {
    let halted = a.halted();
    assert_eq!(halted, b.halted());
    if halted {
      break;
    }
    assert_eq!(a.step().unwrap(), b.step().unwrap());
  }
  assert_eq!(a.root_hash().unwrap(), b.root_hash().unwrap());
}

#[test]
fn test_illegal_instruction_traps_to_mtvec() {
  // Handler at ram + 0x20 halts the machine.
  let handler_offset = 0x20u64;
  let mut program = vec![0xffff_ffffu32]; // not a valid RV64I encoding
  while program.len() < (handler_offset / 4) as usize {
    program.push(addi(0, 0, 0)); // nop padding
  }
  program.extend(halt_sequence());
  let mut m = machine_with_program(&program);
  let ram_start = m.layout().ram_start;
  m.write_csr(ShadowCsr::Mtvec, ram_start + handler_offset);

  checked_step(&mut m);
  assert_eq!(m.read_csr(ShadowCsr::Mcause), CAUSE_ILLEGAL_INSN);
  assert_eq!(m.read_csr(ShadowCsr::Mepc), ram_start);
  assert_eq!(m.read_csr(ShadowCsr::Mtval), 0xffff_ffff);
  assert_eq!(m.read_csr(ShadowCsr::Pc), ram_start + handler_offset);
  assert_eq!(m.read_csr(ShadowCsr::Mstatus) & MSTATUS_MPP, PRV_M << 11);
  // The trap cycle does not retire an instruction.
  assert_eq!(m.read_csr(ShadowCsr::Minstret), 0);

  run_to_halt(&mut m);
  assert!(m.halted());
}

#[test]
fn test_ecall_and_ebreak_causes() {
  let mut m = machine_with_program(&[ecall()]);
  let ram_start = m.layout().ram_start;
  m.write_csr(ShadowCsr::Mtvec, ram_start + 0x100);
  checked_step(&mut m);
  assert_eq!(m.read_csr(ShadowCsr::Mcause), CAUSE_ECALL_BASE + PRV_M);

  let mut m = machine_with_program(&[ebreak()]);
  m.write_csr(ShadowCsr::Mtvec, ram_start + 0x100);
  checked_step(&mut m);
  assert_eq!(m.read_csr(ShadowCsr::Mcause), CAUSE_BREAKPOINT);
  assert_eq!(m.read_csr(ShadowCsr::Mtval), ram_start);
}

#[test]
fn test_misaligned_load_and_store_fault() {
  let mut m = machine_with_program(&[lui(10, 0x4000), ld(1, 10, 1)]);
  let ram_start = m.layout().ram_start;
  m.write_csr(ShadowCsr::Mtvec, ram_start + 0x100);
  checked_step(&mut m); // lui
  checked_step(&mut m); // faulting load
  assert_eq!(m.read_csr(ShadowCsr::Mcause), CAUSE_MISALIGNED_LOAD);
  assert_eq!(m.read_csr(ShadowCsr::Mtval), ram_start + 1);

  // A store outside any PMA range faults.
  let mut m = machine_with_program(&[sd(1, 0, 0)]); // x0 base → address 0, shadow is E
  m.write_csr(ShadowCsr::Mtvec, ram_start + 0x100);
  checked_step(&mut m);
  assert_eq!(m.read_csr(ShadowCsr::Mcause), CAUSE_STORE_FAULT);
}

#[test]
fn test_pending_interrupt_is_taken_and_logged() {
  let mut program = halt_sequence();
  program.push(addi(0, 0, 0));
  let mut m = machine_with_program(&program);
  let ram_start = m.layout().ram_start;
  m.write_csr(ShadowCsr::Mtvec, ram_start + 0x40);
  m.write_csr(ShadowCsr::Mie, 1 << 7);
  m.write_csr(ShadowCsr::Mip, 1 << 7);
  m.write_csr(ShadowCsr::Mstatus, MSTATUS_MIE);

  let (_, log, _) = checked_step(&mut m);
  assert_eq!(m.read_csr(ShadowCsr::Mcause), CAUSE_INTERRUPT_FLAG | 7);
  assert_eq!(m.read_csr(ShadowCsr::Pc), ram_start + 0x40);
  // The interrupt poll reads mip and mie before anything else but iflags.
  assert!(log.len() >= 3);

  // With MIE clear the same interrupt is not taken.
  let mut m = machine_with_program(&program);
  m.write_csr(ShadowCsr::Mie, 1 << 7);
  m.write_csr(ShadowCsr::Mip, 1 << 7);
  checked_step(&mut m);
  assert_eq!(m.read_csr(ShadowCsr::Mcause), 0);
}

#[test]
fn test_step_of_halted_machine_is_minimal() {
  let mut program = halt_sequence();
  program.push(addi(0, 0, 0));
  let mut m = machine_with_program(&program);
  run_to_halt(&mut m);
  let (pre_root, log, post_root) = checked_step(&mut m);
  assert_eq!(pre_root, post_root);
  // Just the iflags read that observes the halt flag.
  assert_eq!(log.len(), 1);
  assert_eq!(log.accesses()[0].access_type, AccessType::Read);
}

#[test]
fn test_reset_log_replays_to_reset_root() {
  let mut program = vec![addi(1, 0, 77), lui(10, 0x4000), sd(1, 10, 0x80)];
  program.extend(halt_sequence());
  let mut m = machine_with_program(&program);
  run_to_halt(&mut m);

  let layout = m.layout();
  let pre_root = m.root_hash().unwrap();
  let log = m.log_reset().unwrap();
  let post_root = m.root_hash().unwrap();

  assert_eq!(post_root, reset_root_hash(&layout).unwrap());
  verify_reset_log(&log, &layout).unwrap();
  verify_reset_transition(&pre_root, &log, &post_root, &layout).unwrap();

  // The board survives the wipe, so no record may touch it.
  assert!(log.accesses().iter().all(|a| !pma_board_contains(a.address)));

  // Tampering any write breaks the zero-write shape.
  let mut accesses = log.accesses().to_vec();
  accesses[0].written_value = Some(1);
  let tampered = rebuild_log(accesses);
  assert_eq!(
    verify_reset_transition(&pre_root, &tampered, &post_root, &layout).unwrap_err(),
    ReplayError::NonPristineWrite { index: 0 }
  );

  // Dropping the final write leaves a word unwiped.
  let mut accesses = log.accesses().to_vec();
  accesses.pop();
  let tampered = rebuild_log(accesses);
  assert_eq!(
    verify_reset_transition(&pre_root, &tampered, &post_root, &layout).unwrap_err(),
    ReplayError::NotPristine
  );

  let mut accesses = log.accesses().to_vec();
  accesses.remove(0);
  let tampered = rebuild_log(accesses);
  assert!(verify_reset_transition(&pre_root, &tampered, &post_root, &layout).is_err());
}

#[test]
fn test_machine_stays_operable_after_reset() {
  let mut program = vec![addi(1, 0, 21), add(2, 1, 1)];
  program.extend(halt_sequence());
  let mut m = machine_with_program(&program);
  run_to_halt(&mut m);
  m.log_reset().unwrap();

  // The PMA board survives the wipe; reload the boot state and run again.
  let layout = m.layout();
  let mut image: Vec<u8> = Vec::new();
  for insn in &program {
    image.extend_from_slice(&insn.to_le_bytes());
  }
  image.resize(image.len().next_multiple_of(8), 0);
  for (i, chunk) in image.chunks(8).enumerate() {
    let mut word = [0u8; 8];
    word.copy_from_slice(chunk);
    m.write_word(layout.ram_start + 8 * i as u64, u64::from_le_bytes(word)).unwrap();
  }
  m.write_csr(ShadowCsr::Pc, layout.ram_start);
  m.write_csr(ShadowCsr::Iflags, PRV_M << IFLAGS_PRV_SHIFT);

  run_to_halt(&mut m);
  assert_eq!(m.read_x(2), 42);
  assert_eq!(m.read_x(1), 21);
}

#[test]
fn test_cmio_round_trip_with_guest_resume() {
  // Guest yields, then reads the first response word and halts.
  let mut program = yield_sequence();
  program.push(lui(10, 0x2000)); // rx buffer base
  program.push(ld(11, 10, 0));
  program.extend(halt_sequence());
  let mut m = machine_with_program(&program);

  // Run until the yield lands.
  while !m.yielded() {
    m.run(m.read_csr(ShadowCsr::Mcycle) + 100);
  }

  let pre_root = m.root_hash().unwrap();
  let data = b"response!".to_vec();
  let log = m.log_send_cmio_response(3, &data).unwrap();
  let post_root = m.root_hash().unwrap();
  verify_send_cmio_response_log(3, &data, &log, &m.layout()).unwrap();
  verify_send_cmio_response_transition(3, &data, &pre_root, &log, &post_root, &m.layout())
    .unwrap();

  // First record is the yielded iflags read.
  assert_eq!(log.accesses()[0].access_type, AccessType::Read);
  assert_ne!(log.accesses()[0].read_value & IFLAGS_Y_MASK, 0);

  // Wrong reason or data must be rejected.
  assert!(matches!(
    verify_send_cmio_response_transition(4, &data, &pre_root, &log, &post_root, &m.layout()),
    Err(ReplayError::UnexpectedAccess { .. })
  ));
  assert!(matches!(
    verify_send_cmio_response_transition(3, b"tampered!", &pre_root, &log, &post_root, &m.layout()),
    Err(ReplayError::UnexpectedAccess { .. })
  ));

  // The guest resumes and reads the response.
  run_to_halt(&mut m);
  let mut expected = [0u8; 8];
  expected.copy_from_slice(&data[..8]);
  assert_eq!(m.read_x(11), u64::from_le_bytes(expected));
}

#[test]
fn test_cmio_rejects_unyielded_machine() {
  let mut program = halt_sequence();
  program.push(addi(0, 0, 0));
  let mut m = machine_with_program(&program);
  assert_eq!(
    m.log_send_cmio_response(1, b"data").unwrap_err(),
    MachineError::NotYielded
  );
}

#[test]
fn test_access_log_serialization_roundtrip() {
  let mut program = vec![addi(1, 0, 1)];
  program.extend(halt_sequence());
  let mut m = machine_with_program(&program);
  let (_, log, _) = checked_step(&mut m);

  let bytes = bincode::serialize(&log).unwrap();
  let decoded: AccessLog = bincode::deserialize(&bytes).unwrap();
  assert_eq!(decoded, log);
  verify_step_log(&decoded).unwrap();
}
