//! Direct-threaded interpreter back-end.
//!
//! Fetches one instruction at `pc`, decodes it via [`crate::instruction::decode`], and dispatches
//! to a per-opcode handler. Each handler is responsible for leaving `pc` pointing at the next
//! instruction to execute before returning — for straight-line instructions that means advancing
//! by the decoded size, for taken branches/jumps it means writing the target address directly.
//! There is exactly one place `pc` is ever written for a given instruction; no handler both
//! advances `pc` unconditionally *and* writes a jump target, so there is no possibility of a
//! double-advance.

use crate::backend::{Backend, HartState};
use crate::config::{Extension, Xlen};
use crate::csr::CsrFile;
use crate::error::CoreError;
use crate::instruction::{
    decode, AluOp, AmoOp, BranchOp, CsrOp, CsrSource, Instruction, LoadOp, MiscMemOp, StoreOp,
    SystemOp,
};
use crate::registers::{Registers, Specifier};

/// The interpreter back-end. Holds no state of its own beyond what [`HartState`] already
/// provides — it is a pure dispatcher.
#[derive(Debug, Default)]
pub struct Interpreter;

impl Interpreter {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for Interpreter {
    fn step(&mut self, state: &mut HartState) -> Result<(), CoreError> {
        let pc = state.registers.pc();
        let word = state
            .bus
            .read32(pc as u32)
            .map_err(|_| CoreError::Decode { pc, word: 0 })?;
        let (instruction, size) =
            decode(word).map_err(|e| CoreError::Decode { pc, word: e.word })?;
        execute(state, pc, &instruction, size as u32)
    }
}

fn require(state: &HartState, pc: u64, extension: Extension) -> Result<(), CoreError> {
    if state.extensions.contains(extension) {
        Ok(())
    } else {
        Err(CoreError::ExtensionNotEnabled { pc, extension })
    }
}

fn signed_at_width(width: u32, value: u64) -> i64 {
    if width == 32 {
        (value as u32 as i32) as i64
    } else {
        value as i64
    }
}

fn op_width(state: &HartState, word: bool) -> u32 {
    if word {
        32
    } else {
        state.xlen.bits()
    }
}

/// Evaluates an [`AluOp`] at bit `width` (32 or 64), returning the raw result pre-truncation.
/// The result for a 32-bit-width operation on an RV64 hart (i.e. the `*W` instructions) is
/// sign-extended to 64 bits here, matching the ISA's definition of those instructions; all other
/// combinations simply return the width-masked bit pattern, relying on `Registers::set_x`'s own
/// truncation for RV32 harts.
fn eval_alu(op: AluOp, width: u32, a: u64, b: u64) -> u64 {
    let mask = if width == 64 { u64::MAX } else { (1u64 << width) - 1 };
    let (a, b) = (a & mask, b & mask);
    let raw = match op {
        AluOp::Add => a.wrapping_add(b) & mask,
        AluOp::Sub => a.wrapping_sub(b) & mask,
        AluOp::Sll => a.wrapping_shl(b as u32 & (width - 1)) & mask,
        AluOp::Srl => a.wrapping_shr(b as u32 & (width - 1)) & mask,
        AluOp::Sra => {
            let shamt = b as u32 & (width - 1);
            (signed_at_width(width, a) >> shamt) as u64 & mask
        }
        AluOp::Slt => (signed_at_width(width, a) < signed_at_width(width, b)) as u64,
        AluOp::Sltu => (a < b) as u64,
        AluOp::Xor => a ^ b,
        AluOp::Or => a | b,
        AluOp::And => a & b,
        AluOp::Mul => a.wrapping_mul(b) & mask,
        AluOp::Mulh => {
            let product = (signed_at_width(width, a) as i128) * (signed_at_width(width, b) as i128);
            (product >> width) as u64 & mask
        }
        AluOp::Mulhu => {
            let product = (a as u128) * (b as u128);
            (product >> width) as u64 & mask
        }
        AluOp::Mulhsu => {
            let product = (signed_at_width(width, a) as i128) * (b as u128 as i128);
            (product >> width) as u64 & mask
        }
        AluOp::Div => {
            let (sa, sb) = (signed_at_width(width, a), signed_at_width(width, b));
            let min = i64::MIN >> (64 - width);
            if sb == 0 {
                u64::MAX & mask
            } else if sa == min && sb == -1 {
                (min as u64) & mask
            } else {
                (sa.wrapping_div(sb)) as u64 & mask
            }
        }
        AluOp::Divu => {
            if b == 0 {
                u64::MAX & mask
            } else {
                a / b
            }
        }
        AluOp::Rem => {
            let (sa, sb) = (signed_at_width(width, a), signed_at_width(width, b));
            let min = i64::MIN >> (64 - width);
            if sb == 0 {
                a
            } else if sa == min && sb == -1 {
                0
            } else {
                (sa.wrapping_rem(sb)) as u64 & mask
            }
        }
        AluOp::Remu => {
            if b == 0 {
                a
            } else {
                a % b
            }
        }
    };
    if width == 32 {
        // Sign-extend the 32-bit result to 64 bits; a no-op beyond masking for a genuinely RV32
        // hart, since `Registers::set_x` will immediately re-truncate it back down to 32 bits.
        (raw as u32 as i32) as i64 as u64
    } else {
        raw
    }
}

fn execute(
    state: &mut HartState,
    pc: u64,
    instruction: &Instruction,
    size: u32,
) -> Result<(), CoreError> {
    match *instruction {
        Instruction::Lui { rd, imm } => {
            state.registers.set_x(rd, imm as i64 as u64);
            state.registers.advance_pc(size);
        }
        Instruction::Auipc { rd, imm } => {
            state.registers.set_x(rd, pc.wrapping_add(imm as i64 as u64));
            state.registers.advance_pc(size);
        }
        Instruction::Jal { rd, imm } => {
            state.registers.set_x(rd, pc.wrapping_add(size as u64));
            state.registers.set_pc(pc.wrapping_add(imm as i64 as u64));
        }
        Instruction::Jalr { rd, rs1, imm } => {
            let target = state
                .registers
                .x(rs1)
                .wrapping_add(imm as i64 as u64)
                & !1u64;
            state.registers.set_x(rd, pc.wrapping_add(size as u64));
            state.registers.set_pc(target);
        }
        Instruction::Branch { op, rs1, rs2, imm } => {
            let width = state.xlen.bits();
            let (a, b) = (state.registers.x(rs1), state.registers.x(rs2));
            let taken = match op {
                BranchOp::Beq => a == b,
                BranchOp::Bne => a != b,
                BranchOp::Blt => signed_at_width(width, a) < signed_at_width(width, b),
                BranchOp::Bge => signed_at_width(width, a) >= signed_at_width(width, b),
                BranchOp::Bltu => a < b,
                BranchOp::Bgeu => a >= b,
            };
            if taken {
                state.registers.set_pc(pc.wrapping_add(imm as i64 as u64));
            } else {
                state.registers.advance_pc(size);
            }
        }
        Instruction::Load { op, rd, rs1, imm } => {
            let address = (state.registers.x(rs1).wrapping_add(imm as i64 as u64)) as u32;
            let value = load(state, address, op)?;
            state.registers.set_x(rd, value);
            state.registers.advance_pc(size);
        }
        Instruction::Store { op, rs1, rs2, imm } => {
            let address = (state.registers.x(rs1).wrapping_add(imm as i64 as u64)) as u32;
            let value = state.registers.x(rs2);
            store(state, address, op, value)?;
            state.registers.advance_pc(size);
        }
        Instruction::AluImm { op, rd, rs1, imm, word } => {
            if word {
                require_rv64(state, pc)?;
            }
            let width = op_width(state, word);
            let b = if matches!(op, AluOp::Sll | AluOp::Srl | AluOp::Sra) {
                imm as u32 as u64
            } else {
                imm as i64 as u64
            };
            let result = eval_alu(op, width, state.registers.x(rs1), b);
            state.registers.set_x(rd, result);
            state.registers.advance_pc(size);
        }
        Instruction::Alu { op, rd, rs1, rs2, word } => {
            if word {
                require_rv64(state, pc)?;
            }
            if matches!(
                op,
                AluOp::Mul | AluOp::Mulh | AluOp::Mulhsu | AluOp::Mulhu | AluOp::Div | AluOp::Divu | AluOp::Rem | AluOp::Remu
            ) {
                require(state, pc, Extension::M)?;
            }
            let width = op_width(state, word);
            let result = eval_alu(op, width, state.registers.x(rs1), state.registers.x(rs2));
            state.registers.set_x(rd, result);
            state.registers.advance_pc(size);
        }
        Instruction::MiscMem { op } => {
            if op == MiscMemOp::FenceI {
                require(state, pc, Extension::Zifencei)?;
            }
            // FENCE/FENCE.I are no-ops: single hart, no instruction or data cache to synchronize.
            state.registers.advance_pc(size);
        }
        Instruction::System { op } => {
            return Err(CoreError::Unimplemented {
                pc,
                mnemonic: match op {
                    SystemOp::Ecall => "ecall",
                    SystemOp::Ebreak => "ebreak",
                },
            });
        }
        Instruction::Csr { op, rd, source, csr } => {
            require(state, pc, Extension::Zicsr)?;
            execute_csr(state, op, rd, source, csr)?;
            state.registers.advance_pc(size);
        }
        Instruction::Amo { op, rd, rs1, rs2, .. } => {
            require(state, pc, Extension::A)?;
            execute_amo(state, op, rd, rs1, rs2)?;
            state.registers.advance_pc(size);
        }
        Instruction::CAddi { rd, imm } => {
            require(state, pc, Extension::C)?;
            // C.NOP is the special case rd == x0, imm == 0; it falls out of the general
            // C.ADDI handling naturally since writes to x0 are always ignored.
            let result = state.registers.x(rd).wrapping_add(imm as i64 as u64);
            state.registers.set_x(rd, result);
            state.registers.advance_pc(size);
        }
    }
    Ok(())
}

fn require_rv64(state: &HartState, pc: u64) -> Result<(), CoreError> {
    if state.xlen == Xlen::Rv64 {
        Ok(())
    } else {
        Err(CoreError::Decode { pc, word: 0 })
    }
}

fn load(state: &HartState, address: u32, op: LoadOp) -> Result<u64, CoreError> {
    let bus_err = |_| CoreError::Bus { kind: "load", address };
    Ok(match op {
        LoadOp::Lb => (state.bus.read8(address).map_err(bus_err)? as i8) as i64 as u64,
        LoadOp::Lh => (state.bus.read16(address).map_err(bus_err)? as i16) as i64 as u64,
        LoadOp::Lw => (state.bus.read32(address).map_err(bus_err)? as i32) as i64 as u64,
        LoadOp::Lbu => state.bus.read8(address).map_err(bus_err)? as u64,
        LoadOp::Lhu => state.bus.read16(address).map_err(bus_err)? as u64,
        LoadOp::Lwu => state.bus.read32(address).map_err(bus_err)? as u64,
        LoadOp::Ld => state.bus.read64(address).map_err(bus_err)?,
    })
}

fn store(state: &mut HartState, address: u32, op: StoreOp, value: u64) -> Result<(), CoreError> {
    let bus_err = |_| CoreError::Bus { kind: "store", address };
    match op {
        StoreOp::Sb => state.bus.write8(address, value as u8).map_err(bus_err)?,
        StoreOp::Sh => state.bus.write16(address, value as u16).map_err(bus_err)?,
        StoreOp::Sw => state.bus.write32(address, value as u32).map_err(bus_err)?,
        StoreOp::Sd => state.bus.write64(address, value).map_err(bus_err)?,
    }
    Ok(())
}

fn execute_csr(
    state: &mut HartState,
    op: CsrOp,
    rd: Specifier,
    source: CsrSource,
    csr: u16,
) -> Result<(), CoreError> {
    let old = state.csrs.read(csr)?;
    let operand = match source {
        CsrSource::Register(rs1) => state.registers.x(rs1),
        CsrSource::Immediate(uimm) => uimm as u64,
    };
    let new = match op {
        CsrOp::Csrrw => operand,
        CsrOp::Csrrs => old | operand,
        CsrOp::Csrrc => old & !operand,
    };
    // A write is skipped entirely when the source is register x0 for csrrs/csrrc (no-op mask),
    // but csrrw with rs1 == x0 still writes (it writes zero). Matching the plain semantics here
    // (always write unless csrrs/csrrc operand is zero) is sufficient since `operand` is already
    // zero in that case and `old | 0 == old`, `old & !0 == old` leave the CSR unchanged either way.
    state.csrs.write(csr, new)?;
    state.registers.set_x(rd, old);
    Ok(())
}

fn execute_amo(
    state: &mut HartState,
    op: AmoOp,
    rd: Specifier,
    rs1: Specifier,
    rs2: Specifier,
) -> Result<(), CoreError> {
    let address = state.registers.x(rs1) as u32;
    let bus_err = |_| CoreError::Bus { kind: "amo", address };
    let loaded = state.bus.read32(address).map_err(bus_err)?;
    let rs2_value = state.registers.x(rs2) as u32;

    // Single-hart model: LR/SC always succeed (no reservation tracking needed), and every AMO
    // read-modify-write is trivially atomic since nothing else can observe the intermediate state.
    let stored = match op {
        AmoOp::LrW => None,
        AmoOp::ScW => {
            state.bus.write32(address, rs2_value).map_err(bus_err)?;
            state.registers.set_x(rd, 0); // 0 == success
            return Ok(());
        }
        AmoOp::AmoSwapW => Some(rs2_value),
        AmoOp::AmoAddW => Some(loaded.wrapping_add(rs2_value)),
        AmoOp::AmoXorW => Some(loaded ^ rs2_value),
        AmoOp::AmoAndW => Some(loaded & rs2_value),
        AmoOp::AmoOrW => Some(loaded | rs2_value),
    };
    if let Some(new_value) = stored {
        state.bus.write32(address, new_value).map_err(bus_err)?;
    }
    state.registers.set_x(rd, (loaded as i32) as i64 as u64);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Extensions};

    fn state_with(config_mut: impl FnOnce(&mut Config)) -> HartState {
        let mut config = Config::default();
        config_mut(&mut config);
        HartState::new(&config)
    }

    fn write_instruction(state: &mut HartState, pc: u32, word: u32) {
        state.bus.write32(pc, word).unwrap();
    }

    #[test]
    fn test_addi() {
        let mut state = state_with(|_| {});
        let pc = state.registers.pc() as u32;
        // addi x1, x0, 5
        write_instruction(&mut state, pc, (5 << 20) | (0b000 << 12) | (1 << 7) | 0b0010011);
        let mut backend = Interpreter::new();
        backend.step(&mut state).unwrap();
        assert_eq!(5, state.registers.x(Specifier::from_u5(1)));
        assert_eq!(pc as u64 + 4, state.registers.pc());
    }

    #[test]
    fn test_branch_not_taken_vs_taken() {
        let mut state = state_with(|_| {});
        let pc = state.registers.pc() as u32;
        // beq x0, x0, 8 (always taken: x0 == x0)
        let imm: u32 = 8;
        let word = (((imm >> 12) & 1) << 31)
            | (((imm >> 5) & 0x3F) << 25)
            | (0 << 20)
            | (0 << 15)
            | (0b000 << 12)
            | (((imm >> 1) & 0xF) << 8)
            | (((imm >> 11) & 1) << 7)
            | 0b1100011;
        write_instruction(&mut state, pc, word);
        let mut backend = Interpreter::new();
        backend.step(&mut state).unwrap();
        assert_eq!(pc as u64 + 8, state.registers.pc());
    }

    #[test]
    fn test_div_by_zero_returns_all_ones() {
        let mut state = state_with(|c| c.extensions = Extensions::from_iter([crate::config::Extension::M]));
        state.registers.set_x(Specifier::from_u5(1), 42);
        state.registers.set_x(Specifier::from_u5(2), 0);
        let result = eval_alu(AluOp::Divu, 32, 42, 0);
        assert_eq!(0xFFFF_FFFF, result);
    }

    #[test]
    fn test_csrrc_advances_pc_exactly_once() {
        let mut state = state_with(|c| c.extensions = Extensions::from_iter([crate::config::Extension::Zicsr]));
        let pc = state.registers.pc() as u32;
        // csrrc x1, mscratch, x0 (operand is x0, so this is a pure read of mscratch into x1)
        let csr = crate::csr::address::MSCRATCH as u32;
        state.csrs.write(csr as u16, 0xABCD).unwrap();
        let word = (csr << 20) | (0 << 15) | (0b011 << 12) | (1 << 7) | 0b1110011;
        write_instruction(&mut state, pc, word);
        let mut backend = Interpreter::new();
        backend.step(&mut state).unwrap();
        assert_eq!(0xABCD, state.registers.x(Specifier::from_u5(1)));
        // Exactly one instruction's worth of advance, not two.
        assert_eq!(pc as u64 + 4, state.registers.pc());
    }
}
