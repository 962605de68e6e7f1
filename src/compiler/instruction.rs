//! # Sequencer Instruction Set
//!
//! Every instruction is one 32-bit word. The low 7 bits hold the opcode, the
//! remaining fields follow the RISC-V layouts (I, R, U, S, B) with custom
//! opcodes for waiting, triggering and cell synchronization.
//!
//! ## Formats
//!
//! ```text
//! I   imm[11:0] | rs1 | funct3 | rd | opcode        addi, xori, lw, wtq
//! R   funct7 | rs2 | rs1 | funct3 | rd | opcode     add, sub, mul, sra
//! U   imm[31:12] | rd | opcode                      lui, wtr, twr, tr, wti, sync
//! S   imm[11:5] | rs2 | rs1 | funct3 | imm[4:0]     sw, end
//! B   split 12 bit word offset                      beq, bne, blt, bge
//! J   split 20 bit word offset                      j
//! ```
//!
//! Branch and jump offsets count instructions, not bytes.

use crate::error::{Error, Result};
use crate::program::expr::{BinOp, CmpOp};
use serde::Serialize;
use std::fmt;

// =============================================================================
// INSTRUCTION ENCODING
// =============================================================================

/// Opcodes (bits 0-6)
pub mod opcode {
    pub const JUMP: u32 = 0b1101111;
    pub const BRANCH: u32 = 0b1100011;
    pub const REG_IMM: u32 = 0b0010011;
    pub const LOAD_UPPER_IMM: u32 = 0b0110111;
    pub const REG_REG: u32 = 0b0110011;
    pub const LOAD: u32 = 0b0000011;
    pub const STORE: u32 = 0b0100011;
    /// End of program and awaiting qubit states
    pub const SYNCH: u32 = 0b0001000;
    pub const WAIT_IMM: u32 = 0b0000100;
    pub const WAIT_REG: u32 = 0b0000110;
    pub const TRIG_WAIT_REG: u32 = 0b0001010;
    pub const TRIGGER: u32 = 0b0000010;
    pub const CELL_SYNC: u32 = 0b0001100;
}

/// Register-immediate and register-register funct3 values
mod alu {
    pub const ADD_SUB_MUL: u32 = 0;
    pub const SLL: u32 = 1;
    pub const XOR: u32 = 4;
    pub const SR: u32 = 5;
    pub const OR: u32 = 6;
    pub const AND: u32 = 7;
}

/// funct7 values
mod funct7 {
    pub const ADD: u32 = 0;
    pub const MUL: u32 = 1;
    pub const SUB: u32 = 0b0100000;
    pub const SRA: u32 = 0b0100000;
}

/// Branch funct3 values
mod branch {
    pub const BEQ: u32 = 0;
    pub const BNE: u32 = 1;
    pub const BLT: u32 = 4;
    pub const BGE: u32 = 5;
}

/// SYNCH funct3 values
mod synch {
    pub const END: u32 = 0;
    pub const QUBIT_STATE: u32 = 0b010;
}

/// Memory access width: 32-bit words only
const MEM_WORD: u32 = 0b010;

// =============================================================================
// IMMEDIATE RANGES
// =============================================================================

/// Signed 12-bit lower immediate
pub const LOWER_IMM_MIN: i64 = -(1 << 11);
pub const LOWER_IMM_MAX: i64 = (1 << 11) - 1;

/// Largest duration of a `wti`
pub const WAIT_IMM_MAX: i64 = (1 << 20) - 1;

/// Signed 20-bit jump offset
const JUMP_MIN: i64 = -(1 << 19);
const JUMP_MAX: i64 = (1 << 19) - 1;

/// Number of general purpose registers; `r0` is hardwired to zero
pub const REGISTER_COUNT: u8 = 32;

/// Highest index usable in the readout and manipulation trigger fields;
/// 0 means "no pulse", 14 chokes a running generator and 15 is reserved
pub const MAX_PULSE_INDEX: u8 = 13;

/// Trigger index that stops a running pulse generator
pub const CHOKE_PULSE_INDEX: u8 = 14;

/// Digital trigger sets addressable by the 2-bit external field
pub const MAX_TRIGGER_SET_INDEX: u8 = 3;

pub fn fits_lower_immediate(value: i64) -> bool {
    (LOWER_IMM_MIN..=LOWER_IMM_MAX).contains(&value)
}

/// Sign-corrected upper part of `value`: `upper + sign_extend(value & 0xFFF) == value`
pub fn split_immediate(value: i64) -> (u32, i64) {
    let lower = sign_extend_12(value & 0xFFF);
    let upper = ((value - lower) as u64 & 0xFFFF_F000) as u32;
    (upper, lower)
}

fn sign_extend_12(value: i64) -> i64 {
    if value & 0x800 != 0 {
        value - 0x1000
    } else {
        value
    }
}

/// Python style signed hex: `0xb`, `-0xb`
fn signed_hex(value: i64) -> String {
    if value < 0 {
        format!("-{:#x}", value.unsigned_abs())
    } else {
        format!("{:#x}", value)
    }
}

// =============================================================================
// OPERANDS
// =============================================================================

/// Hardware register number
pub type Reg = u8;

/// The zero register
pub const R0: Reg = 0;

/// Arithmetic logic unit operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AluOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    /// Arithmetic right shift
    Shr,
}

impl AluOp {
    fn funct3(&self) -> u32 {
        match self {
            AluOp::Add | AluOp::Sub | AluOp::Mul => alu::ADD_SUB_MUL,
            AluOp::Shl => alu::SLL,
            AluOp::Xor => alu::XOR,
            AluOp::Shr => alu::SR,
            AluOp::Or => alu::OR,
            AluOp::And => alu::AND,
        }
    }

    fn funct7(&self) -> u32 {
        match self {
            AluOp::Sub => funct7::SUB,
            AluOp::Shr => funct7::SRA,
            AluOp::Mul => funct7::MUL,
            _ => funct7::ADD,
        }
    }

    fn mnemonic(&self, immediate: bool) -> &'static str {
        match (self, immediate) {
            (AluOp::Add, true) => "addi",
            (AluOp::Add, false) => "add",
            (AluOp::Sub, _) => "sub",
            (AluOp::Mul, _) => "mul",
            (AluOp::And, true) => "andi",
            (AluOp::And, false) => "and",
            (AluOp::Or, true) => "ori",
            (AluOp::Or, false) => "or",
            (AluOp::Xor, true) => "xori",
            (AluOp::Xor, false) => "xor",
            (AluOp::Shl, _) => "sll",
            (AluOp::Shr, _) => "sra",
        }
    }

    /// Whether the register-immediate form exists
    pub fn has_immediate_form(&self) -> bool {
        !matches!(self, AluOp::Sub | AluOp::Mul)
    }
}

impl From<BinOp> for AluOp {
    fn from(op: BinOp) -> Self {
        match op {
            BinOp::Add => AluOp::Add,
            BinOp::Sub => AluOp::Sub,
            BinOp::Mul => AluOp::Mul,
            BinOp::And => AluOp::And,
            BinOp::Or => AluOp::Or,
            BinOp::Xor => AluOp::Xor,
            BinOp::Shl => AluOp::Shl,
            BinOp::Shr => AluOp::Shr,
        }
    }
}

/// Hardware branch conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BranchCond {
    Eq,
    Ne,
    Lt,
    Ge,
}

impl BranchCond {
    fn funct3(&self) -> u32 {
        match self {
            BranchCond::Eq => branch::BEQ,
            BranchCond::Ne => branch::BNE,
            BranchCond::Lt => branch::BLT,
            BranchCond::Ge => branch::BGE,
        }
    }

    fn mnemonic(&self) -> &'static str {
        match self {
            BranchCond::Eq => "beq",
            BranchCond::Ne => "bne",
            BranchCond::Lt => "blt",
            BranchCond::Ge => "bge",
        }
    }
}

/// Module indices started by one trigger word
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TriggerFields {
    pub readout: u8,
    /// 0 none, 1 single shot with result, 2 single shot, 3 toggle continuous
    pub recording: u8,
    pub manipulation: u8,
    /// Digital trigger set
    pub external: u8,
    /// Synchronize the numerically controlled oscillators
    pub sync: bool,
    pub reset: bool,
}

impl TriggerFields {
    fn immediate(&self) -> u32 {
        (self.reset as u32) << 12
            | (self.sync as u32) << 14
            | (self.readout as u32 & 0xF) << 16
            | (self.recording as u32 & 0xF) << 20
            | (self.manipulation as u32 & 0xF) << 22
            | (self.external as u32 & 0x3) << 26
    }

    pub fn is_empty(&self) -> bool {
        *self == TriggerFields::default()
    }
}

// =============================================================================
// INSTRUCTIONS
// =============================================================================

/// One sequencer instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Instruction {
    RegImm {
        op: AluOp,
        dst: Reg,
        src: Reg,
        imm: i32,
    },
    RegReg {
        op: AluOp,
        dst: Reg,
        lhs: Reg,
        rhs: Reg,
    },
    /// Load `upper` (low 12 bits clear) into `dst`
    LoadUpper { dst: Reg, upper: u32 },
    /// Relative branch taken when `cond(lhs, rhs)` holds
    Branch {
        cond: BranchCond,
        lhs: Reg,
        rhs: Reg,
        offset: i32,
    },
    Jump { offset: i32 },
    WaitImm { cycles: u32 },
    WaitReg { reg: Reg },
    TriggerWaitReg { reg: Reg },
    Trigger(TriggerFields),
    /// Barrier across the cells of `mask`
    CellSync { mask: u16 },
    /// Wait for the measured state of a cell and write it to `dst`
    AwaitState { dst: Reg, cell: u8 },
    Store { src: Reg, base: Reg, offset: i32 },
    Load { dst: Reg, base: Reg, offset: i32 },
    End,
}

impl Instruction {
    pub fn reg_imm(op: AluOp, dst: Reg, src: Reg, imm: i64) -> Self {
        Instruction::RegImm {
            op,
            dst,
            src,
            imm: imm as i32,
        }
    }

    pub fn reg_reg(op: AluOp, dst: Reg, lhs: Reg, rhs: Reg) -> Self {
        Instruction::RegReg { op, dst, lhs, rhs }
    }

    /// `dst = src`
    pub fn mov(dst: Reg, src: Reg) -> Self {
        Instruction::reg_imm(AluOp::Add, dst, src, 0)
    }

    pub fn load_upper(dst: Reg, value: u32) -> Self {
        Instruction::LoadUpper {
            dst,
            upper: value & 0xFFFF_F000,
        }
    }

    /// Branch taken when `lhs op rhs`; `>` and `<=` swap their operands
    pub fn branch(op: CmpOp, lhs: Reg, rhs: Reg, offset: i32) -> Self {
        let (cond, lhs, rhs) = match op {
            CmpOp::Eq => (BranchCond::Eq, lhs, rhs),
            CmpOp::Ne => (BranchCond::Ne, lhs, rhs),
            CmpOp::Lt => (BranchCond::Lt, lhs, rhs),
            CmpOp::Ge => (BranchCond::Ge, lhs, rhs),
            CmpOp::Gt => (BranchCond::Lt, rhs, lhs),
            CmpOp::Le => (BranchCond::Ge, rhs, lhs),
        };
        Instruction::Branch {
            cond,
            lhs,
            rhs,
            offset,
        }
    }

    pub fn jump(offset: i32) -> Self {
        Instruction::Jump { offset }
    }

    pub fn wait_imm(cycles: u32) -> Self {
        Instruction::WaitImm { cycles }
    }

    pub fn trigger(fields: TriggerFields) -> Self {
        Instruction::Trigger(fields)
    }

    /// Trigger word that only synchronizes the oscillators
    pub fn nco_sync() -> Self {
        Instruction::Trigger(TriggerFields {
            sync: true,
            ..TriggerFields::default()
        })
    }

    /// Barrier across 2 to 16 hardware cells
    pub fn cell_sync(cells: &[usize]) -> Result<Self> {
        if !(2..=16).contains(&cells.len()) {
            return Err(Error::encoding(format!(
                "Number of cells to be synchronized is out of range ({})",
                cells.len()
            )));
        }
        let mut mask = 0u16;
        for &cell in cells {
            if cell >= 16 {
                return Err(Error::encoding(format!(
                    "Cell {} can not take part in a cell sync",
                    cell
                )));
            }
            mask |= 1 << cell;
        }
        Ok(Instruction::CellSync { mask })
    }

    pub fn store(src: Reg, base: Reg, offset: i32) -> Self {
        Instruction::Store { src, base, offset }
    }

    pub fn load(dst: Reg, base: Reg, offset: i32) -> Self {
        Instruction::Load { dst, base, offset }
    }

    /// Point a patched branch or jump at a new relative target
    pub fn set_offset(&mut self, target: i32) {
        match self {
            Instruction::Branch { offset, .. } | Instruction::Jump { offset } => *offset = target,
            _ => {}
        }
    }

    /// Encode into one machine word
    pub fn encode(&self) -> Result<u32> {
        let word = match *self {
            Instruction::RegImm { op, dst, src, imm } => {
                if !op.has_immediate_form() {
                    return Err(Error::encoding(format!(
                        "{} has no register-immediate form",
                        op.mnemonic(false)
                    )));
                }
                check_lower(imm as i64, "immediate")?;
                if matches!(op, AluOp::Shl | AluOp::Shr) && !(0..32).contains(&imm) {
                    return Err(Error::encoding(format!(
                        "Shift amount {} out of range 0..=31",
                        imm
                    )));
                }
                let mut word = i_type(opcode::REG_IMM, op.funct3(), dst, src, imm as u32);
                if op == AluOp::Shr {
                    word |= op.funct7() << 25;
                }
                word
            }
            Instruction::RegReg { op, dst, lhs, rhs } => {
                opcode::REG_REG
                    | reg(dst) << 7
                    | op.funct3() << 12
                    | reg(lhs) << 15
                    | reg(rhs) << 20
                    | (op.funct7() & 0x7F) << 25
            }
            Instruction::LoadUpper { dst, upper } => u_type(opcode::LOAD_UPPER_IMM, dst, upper),
            Instruction::Branch {
                cond,
                lhs,
                rhs,
                offset,
            } => {
                check_lower(offset as i64, "branch offset")?;
                let imm = offset as u32;
                opcode::BRANCH
                    | ((imm & 0x400) >> 10) << 7
                    | (imm & 0xF) << 8
                    | cond.funct3() << 12
                    | reg(lhs) << 15
                    | reg(rhs) << 20
                    | ((imm & 0x3F0) >> 4) << 25
                    | ((imm & 0x800) >> 11) << 31
            }
            Instruction::Jump { offset } => {
                if !(JUMP_MIN..=JUMP_MAX).contains(&(offset as i64)) {
                    return Err(Error::encoding(format!(
                        "Jump offset {} out of range",
                        offset
                    )));
                }
                let j = offset as u32;
                opcode::JUMP
                    | ((j & 0x7F800) >> 11) << 12
                    | ((j & 0x400) >> 10) << 20
                    | (j & 0x3FF) << 21
                    | ((j & 0x80000) >> 19) << 31
            }
            Instruction::WaitImm { cycles } => {
                if cycles as i64 > WAIT_IMM_MAX {
                    return Err(Error::encoding(format!(
                        "Wait of {} cycles does not fit the immediate field",
                        cycles
                    )));
                }
                u_type(opcode::WAIT_IMM, R0, (cycles & 0xFFFFF) << 12)
            }
            Instruction::WaitReg { reg } => u_type(opcode::WAIT_REG, reg, 0),
            Instruction::TriggerWaitReg { reg } => u_type(opcode::TRIG_WAIT_REG, reg, 0),
            Instruction::Trigger(fields) => u_type(opcode::TRIGGER, R0, fields.immediate()),
            Instruction::CellSync { mask } => u_type(opcode::CELL_SYNC, R0, (mask as u32) << 16),
            Instruction::AwaitState { dst, cell } => {
                i_type(opcode::SYNCH, synch::QUBIT_STATE, dst, R0, cell as u32)
            }
            Instruction::Store { src, base, offset } => {
                check_lower(offset as i64, "store offset")?;
                let imm = offset as u32;
                opcode::STORE
                    | (imm & 0x1F) << 7
                    | MEM_WORD << 12
                    | reg(base) << 15
                    | reg(src) << 20
                    | ((imm & 0xFE0) >> 5) << 25
            }
            Instruction::Load { dst, base, offset } => {
                check_lower(offset as i64, "load offset")?;
                i_type(opcode::LOAD, MEM_WORD, dst, base, offset as u32)
            }
            Instruction::End => opcode::SYNCH | synch::END << 12,
        };
        Ok(word)
    }
}

fn reg(r: Reg) -> u32 {
    r as u32 & 0x1F
}

fn i_type(op: u32, funct3: u32, dst: Reg, src: Reg, imm: u32) -> u32 {
    op | reg(dst) << 7 | funct3 << 12 | reg(src) << 15 | (imm & 0xFFF) << 20
}

fn u_type(op: u32, dst: Reg, imm: u32) -> u32 {
    op | reg(dst) << 7 | (imm & 0xFFFF_F000)
}

fn check_lower(value: i64, what: &str) -> Result<()> {
    if fits_lower_immediate(value) {
        Ok(())
    } else {
        Err(Error::encoding(format!(
            "{} {} does not fit into 12 bits",
            what, value
        )))
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Instruction::RegImm { op, dst, src, imm } => write!(
                f,
                "{} r{}, r{}, {:#x}",
                op.mnemonic(true),
                dst,
                src,
                imm & 0xFFF
            ),
            Instruction::RegReg { op, dst, lhs, rhs } => {
                write!(f, "{} r{}, r{}, r{}", op.mnemonic(false), dst, lhs, rhs)
            }
            Instruction::LoadUpper { dst, upper } => write!(f, "lui r{}, {:#x}", dst, upper),
            Instruction::Branch {
                cond,
                lhs,
                rhs,
                offset,
            } => write!(
                f,
                "{} r{}, r{}, {}",
                cond.mnemonic(),
                lhs,
                rhs,
                signed_hex(offset as i64)
            ),
            Instruction::Jump { offset } => write!(f, "j {}", signed_hex(offset as i64)),
            Instruction::WaitImm { cycles } => write!(f, "wti {:#x}", cycles & 0xFFFFF),
            Instruction::WaitReg { reg } => write!(f, "wtr r{}, 0x0", reg),
            Instruction::TriggerWaitReg { reg } => write!(f, "twr r{}, 0x0", reg),
            Instruction::Trigger(t) => write!(
                f,
                "tr {:#x}, {:#x}, {:#x}, {:#x}, 0x0, 0x0",
                t.readout, t.recording, t.manipulation, t.external
            ),
            Instruction::CellSync { mask } => write!(f, "sync r0, {:#x}", (mask as u32) << 16),
            Instruction::AwaitState { dst, cell } => write!(f, "wtq r{}, {}", dst, cell),
            Instruction::Store { src, base, offset } => write!(f, "sw r{}, {}(r{})", src, offset, base),
            Instruction::Load { dst, base, offset } => write!(f, "lw r{}, {}(r{})", dst, offset, base),
            Instruction::End => write!(f, "end"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reg_imm_encoding() {
        let addi = Instruction::reg_imm(AluOp::Add, 1, 0, 10);
        assert_eq!(addi.encode().unwrap(), 0x00A0_0093);
        assert_eq!(addi.to_string(), "addi r1, r0, 0xa");

        let negative = Instruction::reg_imm(AluOp::Add, 2, 2, -1);
        assert_eq!(negative.encode().unwrap() >> 20, 0xFFF);
        assert_eq!(negative.to_string(), "addi r2, r2, 0xfff");
    }

    #[test]
    fn test_arithmetic_shift_sets_funct7() {
        let sra = Instruction::reg_imm(AluOp::Shr, 3, 3, 2);
        assert_eq!(sra.encode().unwrap() >> 25, 0b0100000);
        assert_eq!(sra.to_string(), "sra r3, r3, 0x2");
    }

    #[test]
    fn test_shift_amount_range() {
        assert!(Instruction::reg_imm(AluOp::Shl, 1, 1, 31).encode().is_ok());
        for imm in [32, 1000, -1] {
            for op in [AluOp::Shl, AluOp::Shr] {
                assert!(matches!(
                    Instruction::reg_imm(op, 1, 1, imm).encode(),
                    Err(Error::EncodingRangeError(_))
                ));
            }
        }
    }

    #[test]
    fn test_reg_reg_encoding() {
        let sub = Instruction::reg_reg(AluOp::Sub, 3, 1, 2);
        assert_eq!(sub.encode().unwrap(), 0x4020_81B3);
        assert_eq!(sub.to_string(), "sub r3, r1, r2");
        let mul = Instruction::reg_reg(AluOp::Mul, 3, 1, 2);
        assert_eq!(mul.encode().unwrap() >> 25, 1);
    }

    #[test]
    fn test_branch_swaps_greater_than() {
        let gt = Instruction::branch(CmpOp::Gt, 1, 2, 3);
        assert_eq!(gt.to_string(), "blt r2, r1, 0x3");
        let le = Instruction::branch(CmpOp::Le, 1, 2, 3);
        assert_eq!(le.to_string(), "bge r2, r1, 0x3");
    }

    #[test]
    fn test_jump_prints_signed_offsets() {
        assert_eq!(Instruction::jump(-11).to_string(), "j -0xb");
        assert_eq!(Instruction::jump(4).to_string(), "j 0x4");
        assert!(Instruction::jump(1 << 19).encode().is_err());
    }

    #[test]
    fn test_upper_immediate() {
        let lui = Instruction::load_upper(4, 0x8400);
        assert_eq!(lui.to_string(), "lui r4, 0x8000");
        assert_eq!(lui.encode().unwrap(), 0x0000_8237);
    }

    #[test]
    fn test_trigger_fields() {
        let play = Instruction::trigger(TriggerFields {
            manipulation: 1,
            ..TriggerFields::default()
        });
        assert_eq!(play.to_string(), "tr 0x0, 0x0, 0x1, 0x0, 0x0, 0x0");
        assert_eq!(play.encode().unwrap(), opcode::TRIGGER | 1 << 22);

        let sync = Instruction::nco_sync();
        assert_eq!(sync.encode().unwrap(), opcode::TRIGGER | 1 << 14);
        assert_eq!(sync.to_string(), "tr 0x0, 0x0, 0x0, 0x0, 0x0, 0x0");
    }

    #[test]
    fn test_wait_immediate_range() {
        assert_eq!(Instruction::wait_imm(24).to_string(), "wti 0x18");
        assert_eq!(Instruction::wait_imm(24).encode().unwrap(), opcode::WAIT_IMM | 24 << 12);
        assert!(Instruction::wait_imm(1 << 20).encode().is_err());
    }

    #[test]
    fn test_cell_sync_needs_two_cells() {
        assert!(Instruction::cell_sync(&[0]).is_err());
        let sync = Instruction::cell_sync(&[0, 2]).unwrap();
        assert_eq!(sync.encode().unwrap(), opcode::CELL_SYNC | 0b101 << 16);
    }

    #[test]
    fn test_memory_access() {
        let sw = Instruction::store(4, 5, 0);
        assert_eq!(sw.to_string(), "sw r4, 0(r5)");
        let lw = Instruction::load(4, 3, 0);
        assert_eq!(lw.to_string(), "lw r4, 0(r3)");
        assert!(Instruction::store(1, 0, 4096).encode().is_err());
    }

    #[test]
    fn test_await_state_and_end() {
        let wtq = Instruction::AwaitState { dst: 5, cell: 0 };
        assert_eq!(wtq.to_string(), "wtq r5, 0");
        assert_eq!(wtq.encode().unwrap(), opcode::SYNCH | 5 << 7 | 0b010 << 12);
        assert_eq!(Instruction::End.encode().unwrap(), opcode::SYNCH);
    }

    #[test]
    fn test_split_immediate() {
        assert_eq!(split_immediate(0x8400), (0x8000, 0x400));
        assert_eq!(split_immediate(0x6005), (0x6000, 5));
        assert_eq!(split_immediate(0xFFF), (0x1000, -1));
    }
}
