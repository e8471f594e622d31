//! End-to-end scenario tests driving `Core` through its public API, one per the worked example
//! in the system this emulator is modeled on. Unlike the unit tests colocated with each module,
//! these exercise multiple subsystems together (decode + interpreter/JIT + bus + CSR file).

use riscv_emu_core::bus::{DRAM_BASE, UART_BASE, UART_THR};
use riscv_emu_core::config::{BackendKind, Config, Extension, Extensions};
use riscv_emu_core::csr::address::MSCRATCH;
use riscv_emu_core::Core;

fn addi(rd: u8, rs1: u8, imm: i32) -> u32 {
    ((imm as u32 & 0xFFF) << 20) | ((rs1 as u32) << 15) | (0b000 << 12) | ((rd as u32) << 7) | 0b0010011
}

fn add(rd: u8, rs1: u8, rs2: u8) -> u32 {
    ((rs2 as u32) << 20) | ((rs1 as u32) << 15) | (0b000 << 12) | ((rd as u32) << 7) | 0b0110011
}

fn jal(rd: u8, imm: i32) -> u32 {
    let imm = imm as u32;
    (((imm >> 20) & 1) << 31)
        | (((imm >> 12) & 0xFF) << 12)
        | (((imm >> 11) & 1) << 20)
        | (((imm >> 1) & 0x3FF) << 21)
        | ((rd as u32) << 7)
        | 0b1101111
}

fn jalr(rd: u8, rs1: u8, imm: i32) -> u32 {
    ((imm as u32 & 0xFFF) << 20) | ((rs1 as u32) << 15) | (0b000 << 12) | ((rd as u32) << 7) | 0b1100111
}

fn beq(rs1: u8, rs2: u8, imm: i32) -> u32 {
    branch(0b000, rs1, rs2, imm)
}

fn branch(funct3: u32, rs1: u8, rs2: u8, imm: i32) -> u32 {
    let imm = imm as u32;
    let bit12 = (imm >> 12) & 1;
    let bits10_5 = (imm >> 5) & 0x3F;
    let bits4_1 = (imm >> 1) & 0xF;
    let bit11 = (imm >> 11) & 1;
    (bit12 << 31)
        | (bits10_5 << 25)
        | ((rs2 as u32) << 20)
        | ((rs1 as u32) << 15)
        | (funct3 << 12)
        | (bits4_1 << 8)
        | (bit11 << 7)
        | 0b1100011
}

fn csrrwi(rd: u8, csr: u16, uimm: u8) -> u32 {
    ((csr as u32) << 20) | ((uimm as u32) << 15) | (0b101 << 12) | ((rd as u32) << 7) | 0b1110011
}

fn csrrs(rd: u8, csr: u16, rs1: u8) -> u32 {
    ((csr as u32) << 20) | ((rs1 as u32) << 15) | (0b010 << 12) | ((rd as u32) << 7) | 0b1110011
}

fn write_program(core: &Core, words: &[u32]) {
    for (i, &word) in words.iter().enumerate() {
        core.write32(DRAM_BASE + (i as u32 * 4), word).unwrap();
    }
}

/// Scenario 1: `addi x1, x0, 5; addi x2, x0, 7; add x3, x1, x2; jal x0, 0`.
#[test]
fn scenario_add_two_immediates() {
    let core = Core::new(Config::default());
    write_program(&core, &[addi(1, 0, 5), addi(2, 0, 7), add(3, 1, 2), jal(0, 0)]);
    for _ in 0..3 {
        core.step().unwrap();
    }
    assert_eq!(5, core.get_register(1));
    assert_eq!(7, core.get_register(2));
    assert_eq!(12, core.get_register(3));
    assert_eq!(0x8000_000C, core.pc());
}

/// Scenario 2: `csrrwi t0, mscratch, 0x15; csrrs t1, mscratch, x0`.
#[test]
fn scenario_csr_round_trip() {
    let config = Config {
        extensions: Extensions::from_iter([Extension::Zicsr]),
        ..Config::default()
    };
    let core = Core::new(config);
    // t0 = x5, t1 = x6.
    write_program(&core, &[csrrwi(5, MSCRATCH, 0x15), csrrs(6, MSCRATCH, 0)]);
    core.step().unwrap();
    core.step().unwrap();
    assert_eq!(0x15, core.get_csr(MSCRATCH).unwrap());
    assert_eq!(0x15, core.get_register(6));
    // mscratch was never written before, so the old value csrrwi returned into t0 is 0.
    assert_eq!(0, core.get_register(5));
}

/// Scenario 3: a taken branch skips exactly the one instruction in its delay slot.
#[test]
fn scenario_branch_taken() {
    let core = Core::new(Config::default());
    write_program(
        &core,
        &[
            addi(1, 0, 1),
            addi(2, 0, 1),
            beq(1, 2, 8),
            addi(3, 0, 99),
            addi(4, 0, 42),
        ],
    );
    for _ in 0..4 {
        core.step().unwrap();
    }
    assert_eq!(0, core.get_register(3));
    assert_eq!(42, core.get_register(4));
}

/// Scenario 4: `jal ra, +8; addi x5, x0, 1; jalr x0, 0(ra)` — call-and-return.
#[test]
fn scenario_jal_and_return() {
    let core = Core::new(Config::default());
    // ra == x1.
    write_program(&core, &[jal(1, 8), addi(5, 0, 1), jalr(0, 1, 0)]);
    let start_pc = core.pc();
    core.step().unwrap(); // jal: ra <- start_pc + 4, pc <- start_pc + 8
    assert_eq!(start_pc + 4, core.get_register(1));
    assert_eq!(start_pc + 8, core.pc());
    core.step().unwrap(); // the jalr at start_pc + 8
    assert_eq!(start_pc + 4, core.pc());
    core.step().unwrap(); // addi x5, x0, 1, now actually executed
    assert_eq!(1, core.get_register(5));
}

/// Scenario 5: writing `"hi\n"` byte-by-byte to the UART THR flushes exactly one line, `"hi"`.
#[test]
fn scenario_uart_stream() {
    use std::sync::{Arc, Mutex};

    let mut core = Core::new(Config::default());
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink_lines = lines.clone();
    core.set_uart_sink(Box::new(move |line: &str| sink_lines.lock().unwrap().push(line.to_owned())));

    for &byte in b"hi\n" {
        core.write8(UART_BASE + UART_THR, byte).unwrap();
    }

    assert_eq!(vec!["hi".to_owned()], *lines.lock().unwrap());
}

/// Scenario 6: stepping through 1025 distinct single-instruction-then-jump blocks overflows the
/// JIT cache; the earliest-compiled blocks are evicted.
///
/// `Core::step` compiles (and caches) one guest instruction at a time, so each two-instruction
/// block contributes two distinct cache entries: one for its `addi` and one for its `jal`. Walking
/// all 1025 blocks therefore takes `BLOCKS * 2` steps and touches `BLOCKS * 2` distinct addresses,
/// well past the cache's 1024-entry cap — only the most recently visited 1024 survive, so the very
/// first block's `addi` is long gone by the end.
#[test]
fn scenario_jit_cache_eviction() {
    let config = Config {
        backend: BackendKind::Jit,
        ..Config::default()
    };
    let core = Core::new(config);

    const BLOCKS: u32 = 1025;
    let mut words = Vec::with_capacity(BLOCKS as usize * 2);
    for _ in 0..BLOCKS {
        words.push(addi(1, 1, 1)); // translated straight-line instruction
        words.push(jal(0, 4)); // ends the block, jumps to the start of the next one
    }
    write_program(&core, &words);

    let first_block_pc = DRAM_BASE as u64;
    for _ in 0..(BLOCKS * 2) {
        core.step().unwrap();
    }

    assert_eq!(Some(1024), core.jit_cached_block_count());
    assert!(!core.jit_has_cached_block(first_block_pc));
}
