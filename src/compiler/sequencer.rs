//! # Per-Cell Instruction Emitter
//!
//! A [`Sequencer`] owns the instruction stream, the register file and the
//! trigger bookkeeping of one cell. The code generator walks the command tree
//! and calls into one sequencer per relevant cell.
//!
//! ## Key Technical Details
//! - 31 general registers, handed out in stack order (r1 first); r0 is zero
//! - Every instruction takes at least one cycle; `mul` takes 6, `j` 2, `lw`/`sw` 8
//! - Register values are tracked statically where possible so that cells can
//!   be synchronized by padding waits instead of a `sync` word
//! - A pulse of variable length keeps its generator running until the next
//!   instruction, which is preceded by a choke trigger

use super::instruction::{
    fits_lower_immediate, split_immediate, AluOp, Instruction, Reg, TriggerFields,
    CHOKE_PULSE_INDEX, MAX_PULSE_INDEX, MAX_TRIGGER_SET_INDEX, R0, REGISTER_COUNT, WAIT_IMM_MAX,
};
use crate::error::{Error, Result};
use crate::program::expr::{CmpOp, Expr, ExprKind, Literal, VarId};
use crate::program::units;
use crate::program::{Cell, Command, PulseShape, Var};
use crate::types::{Type, TypeTable};
use std::collections::{BTreeSet, HashMap};

// =============================================================================
// TIMING
// =============================================================================

/// Execution cycles of instructions that take longer than one cycle
pub mod cycles {
    pub const MULTIPLICATION: i64 = 6;
    pub const JUMP: i64 = 2;
    pub const LOAD_STORE: i64 = 8;
    /// Delay between triggering and the start of a recording
    pub const RECORDING_MODULE_DELAY: i64 = 1;
}

/// Why the cells were last synchronized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPointKind {
    ProgramStart,
    SyncCommand,
    BeforeIf,
    BeforeForRange,
    AfterForRangeIteration,
    BeforeWhile,
    BeforeParallel,
    LoopUnroll0,
    LoopUnroll1,
}

/// A position in the command tree at which cells were synchronized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPoint {
    kind: SyncPointKind,
    /// Identity of the command, stable while the tree is borrowed
    command: usize,
}

impl SyncPoint {
    pub fn program_start() -> Self {
        Self {
            kind: SyncPointKind::ProgramStart,
            command: 0,
        }
    }

    pub fn at(command: &Command, kind: SyncPointKind) -> Self {
        Self {
            kind,
            command: command as *const Command as usize,
        }
    }

    pub fn kind(&self) -> SyncPointKind {
        self.kind
    }
}

/// Cycles elapsed since the last sync point, if statically known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramCycles {
    pub cycles: i64,
    pub valid: bool,
    pub last_sync: SyncPoint,
}

impl ProgramCycles {
    fn add(&mut self, cycles: i64, valid: bool) {
        self.cycles += cycles;
        self.valid &= valid;
    }
}

// =============================================================================
// REGISTERS
// =============================================================================

/// Statically tracked content of a register
///
/// `value` is `None` until something was written. `valid` is cleared as soon
/// as the value depends on anything only known at runtime (branches, loads,
/// measured states).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterState {
    pub value: Option<i64>,
    pub valid: bool,
}

impl RegisterState {
    const FREE: RegisterState = RegisterState {
        value: None,
        valid: true,
    };
}

/// Operand of an ALU operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(Reg),
    Imm(i64),
}

// =============================================================================
// TRIGGERS
// =============================================================================

/// Duration of a triggered pulse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Length {
    Cycles(i64),
    /// Runs for the value of a register
    Var(Reg),
}

/// Pulse started on one generator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseTrigger {
    pub index: u8,
    pub length: Length,
}

/// Recording started by a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordTrigger {
    /// 1 single shot with result, 2 single shot, 3 toggle continuous
    pub mode: u8,
    pub cycles: i64,
    /// Register receiving the measured state
    pub state_to: Option<Reg>,
}

impl RecordTrigger {
    pub const SINGLE: u8 = 1;
    pub const ONESHOT: u8 = 2;
    pub const CONTINUOUS: u8 = 3;

    pub fn is_continuous(&self) -> bool {
        self.mode == Self::CONTINUOUS
    }
}

/// Everything started by one trigger word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger {
    pub manipulation: Option<PulseTrigger>,
    pub readout: Option<PulseTrigger>,
    pub recording: Option<RecordTrigger>,
    /// Digital trigger set index and duration in cycles
    pub external: Option<(u8, i64)>,
    /// Add the recording module delay to the trigger duration
    pub recording_delay: bool,
    /// Variable pulses become single cycle triggers without `twr`
    pub single_cycle: bool,
}

impl Default for Trigger {
    fn default() -> Self {
        Self {
            manipulation: None,
            readout: None,
            recording: None,
            external: None,
            recording_delay: true,
            single_cycle: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ActiveModules {
    readout: bool,
    manipulation: bool,
}

impl ActiveModules {
    fn any(&self) -> bool {
        self.readout || self.manipulation
    }
}

/// Result of emitting one cell
#[derive(Debug, Clone, Default)]
pub struct SequencerOutput {
    pub instructions: Vec<Instruction>,
    pub pulses: Vec<PulseShape>,
    pub readout_pulses: Vec<PulseShape>,
    pub trigger_sets: Vec<Vec<u8>>,
}

// =============================================================================
// SEQUENCER
// =============================================================================

/// Instruction emitter of one cell
pub struct Sequencer<'t> {
    cell: Cell,
    hw_cell: usize,
    types: &'t TypeTable,
    instructions: Vec<Instruction>,
    /// Free registers; the next one handed out is on top
    available: Vec<Reg>,
    registers: [RegisterState; REGISTER_COUNT as usize],
    vars: HashMap<VarId, Reg>,
    /// Word addresses of the arrays in the static data region
    arrays: HashMap<VarId, i64>,
    cycles: ProgramCycles,
    active: ActiveModules,
    pulses: Vec<PulseShape>,
    readout_pulses: Vec<PulseShape>,
    trigger_sets: Vec<Vec<u8>>,
}

impl<'t> Sequencer<'t> {
    pub fn new(cell: Cell, hw_cell: usize, types: &'t TypeTable) -> Self {
        let mut registers = [RegisterState::FREE; REGISTER_COUNT as usize];
        registers[R0 as usize].value = Some(0);

        Self {
            cell,
            hw_cell,
            types,
            instructions: Vec::new(),
            available: (1..REGISTER_COUNT).rev().collect(),
            registers,
            vars: HashMap::new(),
            arrays: HashMap::new(),
            cycles: ProgramCycles {
                cycles: 0,
                valid: true,
                last_sync: SyncPoint::program_start(),
            },
            active: ActiveModules::default(),
            pulses: Vec::new(),
            readout_pulses: Vec::new(),
            trigger_sets: Vec::new(),
        }
    }

    pub fn cell(&self) -> Cell {
        self.cell
    }

    /// Index of the cell on the hardware
    pub fn hw_cell(&self) -> usize {
        self.hw_cell
    }

    /// Number of emitted instructions
    pub fn size(&self) -> usize {
        self.instructions.len()
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn finish(self) -> SequencerOutput {
        SequencerOutput {
            instructions: self.instructions,
            pulses: self.pulses,
            readout_pulses: self.readout_pulses,
            trigger_sets: self.trigger_sets,
        }
    }

    /// Append an instruction, choking running generators first
    fn push(&mut self, instruction: Instruction, cycles: i64, valid: bool) {
        if self.active.any() {
            self.choke();
        }
        self.instructions.push(instruction);
        self.cycles.add(cycles.max(1), valid);
    }

    // =========================================================================
    // Register file
    // =========================================================================

    pub fn request(&mut self) -> Result<Reg> {
        let reg = self.available.pop().ok_or_else(|| {
            Error::encoding(format!("Cell {} ran out of registers", self.cell))
        })?;
        self.registers[reg as usize] = RegisterState::FREE;
        Ok(reg)
    }

    pub fn release(&mut self, reg: Reg) {
        if reg == R0 {
            return;
        }
        self.registers[reg as usize] = RegisterState::FREE;
        self.available.push(reg);
    }

    /// Reserve a register for a variable for the rest of the program
    pub fn allocate_var(&mut self, var: VarId) -> Result<Reg> {
        let reg = self.request()?;
        self.vars.insert(var, reg);
        Ok(reg)
    }

    pub fn var_register(&self, var: &Var) -> Result<Reg> {
        self.vars.get(&var.id()).copied().ok_or_else(|| {
            Error::structural(format!(
                "Variable {} has no register on cell {}",
                var, self.cell
            ))
        })
    }

    pub fn register(&self, reg: Reg) -> RegisterState {
        self.registers[reg as usize]
    }

    pub fn set_register(&mut self, reg: Reg, state: RegisterState) {
        if reg != R0 {
            self.registers[reg as usize] = state;
        }
    }

    pub fn set_register_valid(&mut self, reg: Reg, valid: bool) {
        if reg != R0 {
            self.registers[reg as usize].valid = valid;
        }
    }

    /// Value of a register that must have been written before
    fn bound_value(&self, reg: Reg) -> Result<i64> {
        self.registers[reg as usize]
            .value
            .ok_or(Error::UnboundVariable { register: reg })
    }

    /// Place the array at a word address of the static data region
    pub fn set_array_address(&mut self, var: VarId, address: i64) {
        self.arrays.insert(var, address);
    }

    // =========================================================================
    // Arithmetic
    // =========================================================================

    /// Load a constant, using `r0` for zero unless a destination is given
    pub fn immediate_to_register(&mut self, value: i64, dst: Option<Reg>) -> Result<Reg> {
        if !(-(1i64 << 31)..(1i64 << 32)).contains(&value) {
            return Err(Error::encoding(format!(
                "Value {} does not fit into a register",
                value
            )));
        }
        let dst = match dst {
            Some(dst) => dst,
            None if value == 0 => return Ok(R0),
            None => self.request()?,
        };

        if fits_lower_immediate(value) {
            self.push(Instruction::reg_imm(AluOp::Add, dst, R0, value), 1, true);
        } else {
            let (upper, lower) = split_immediate(value);
            self.push(Instruction::load_upper(dst, upper), 1, true);
            self.push(Instruction::reg_imm(AluOp::Add, dst, dst, lower), 1, true);
        }
        self.set_register(
            dst,
            RegisterState {
                value: Some(value),
                valid: true,
            },
        );
        Ok(dst)
    }

    /// `dst = src`
    pub fn mov(&mut self, dst: Reg, src: Reg) -> Result<()> {
        self.alu(AluOp::Add, Operand::Reg(src), Operand::Imm(0), Some(dst))?;
        Ok(())
    }

    /// `dst = value`; with `valid` cleared the result is not statically known
    pub fn assign(&mut self, dst: Reg, value: &Expr, valid: bool) -> Result<()> {
        match value.kind() {
            ExprKind::Const(literal) => {
                let v = self.constant(value, *literal)?;
                self.immediate_to_register(v, Some(dst))?;
            }
            ExprKind::Var(var) => {
                let src = self.var_register(var)?;
                self.mov(dst, src)?;
            }
            _ => {
                let tmp = self.calc(value)?;
                self.mov(dst, tmp)?;
                self.release(tmp);
            }
        }
        if !valid {
            self.set_register_valid(dst, false);
        }
        Ok(())
    }

    /// Emit `dst = lhs op rhs`, requesting `dst` if none is given
    pub fn alu(
        &mut self,
        op: AluOp,
        lhs: Operand,
        rhs: Operand,
        dst: Option<Reg>,
    ) -> Result<Reg> {
        // the hardware has no immediate-immediate form
        let (lhs, loaded) = match (lhs, rhs) {
            (Operand::Imm(a), Operand::Imm(_)) => {
                (Operand::Reg(self.immediate_to_register(a, None)?), true)
            }
            _ => (lhs, false),
        };
        let dst = match dst {
            Some(dst) => dst,
            None => self.request()?,
        };

        match op {
            AluOp::Add | AluOp::And | AluOp::Or | AluOp::Xor => {
                self.commutative(op, dst, lhs, rhs, 1)?
            }
            AluOp::Sub => match (lhs, rhs) {
                (Operand::Reg(src), Operand::Imm(c)) if fits_lower_immediate(-c) => {
                    self.push(Instruction::reg_imm(AluOp::Add, dst, src, -c), 1, true)
                }
                _ => self.non_commutative(op, dst, lhs, rhs)?,
            },
            AluOp::Mul => self.commutative(op, dst, lhs, rhs, cycles::MULTIPLICATION)?,
            AluOp::Shl | AluOp::Shr => self.non_commutative(op, dst, lhs, rhs)?,
        }

        self.update_value(dst, op, lhs, rhs)?;
        if let (true, Operand::Reg(reg)) = (loaded, lhs) {
            self.release(reg);
        }
        Ok(dst)
    }

    fn commutative(
        &mut self,
        op: AluOp,
        dst: Reg,
        lhs: Operand,
        rhs: Operand,
        cycles: i64,
    ) -> Result<()> {
        let (reg, other) = match (lhs, rhs) {
            (Operand::Reg(reg), other) => (reg, other),
            (imm, Operand::Reg(reg)) => (reg, imm),
            (Operand::Imm(_), Operand::Imm(_)) => {
                return Err(Error::unsupported("Calculation without register operand"))
            }
        };
        match other {
            Operand::Reg(rhs) => self.push(Instruction::reg_reg(op, dst, reg, rhs), cycles, true),
            Operand::Imm(c) if op.has_immediate_form() && fits_lower_immediate(c) => {
                self.push(Instruction::reg_imm(op, dst, reg, c), cycles, true)
            }
            Operand::Imm(c) => self.large_immediate(op, dst, reg, c, cycles)?,
        }
        Ok(())
    }

    fn non_commutative(&mut self, op: AluOp, dst: Reg, lhs: Operand, rhs: Operand) -> Result<()> {
        match (lhs, rhs) {
            (Operand::Reg(a), Operand::Reg(b)) => {
                self.push(Instruction::reg_reg(op, dst, a, b), 1, true)
            }
            (Operand::Reg(a), Operand::Imm(c)) if op.has_immediate_form() && fits_lower_immediate(c) => {
                self.push(Instruction::reg_imm(op, dst, a, c), 1, true)
            }
            (Operand::Reg(a), Operand::Imm(c)) => self.large_immediate(op, dst, a, c, 1)?,
            (Operand::Imm(c), Operand::Reg(b)) => {
                let tmp = self.immediate_to_register(c, None)?;
                self.push(Instruction::reg_reg(op, dst, tmp, b), 1, true);
                self.release(tmp);
            }
            (Operand::Imm(_), Operand::Imm(_)) => {
                return Err(Error::unsupported("Calculation without register operand"))
            }
        }
        Ok(())
    }

    fn large_immediate(&mut self, op: AluOp, dst: Reg, reg: Reg, imm: i64, cycles: i64) -> Result<()> {
        let tmp = self.immediate_to_register(imm, None)?;
        self.push(Instruction::reg_reg(op, dst, reg, tmp), cycles, true);
        self.release(tmp);
        Ok(())
    }

    /// Track the value a calculation leaves in `dst`
    fn update_value(&mut self, dst: Reg, op: AluOp, lhs: Operand, rhs: Operand) -> Result<()> {
        if dst == R0 {
            return Ok(());
        }
        let mut valid = self.registers[dst as usize].valid;
        let mut operand = |operand: Operand| -> Result<i64> {
            match operand {
                Operand::Imm(value) => Ok(value),
                Operand::Reg(reg) => {
                    let state = self.registers[reg as usize];
                    valid &= state.valid;
                    state.value.ok_or(Error::UnboundVariable { register: reg })
                }
            }
        };
        let a = operand(lhs)?;
        let b = operand(rhs)?;

        let value = match op {
            AluOp::Add => a.wrapping_add(b),
            AluOp::Sub => a.wrapping_sub(b),
            AluOp::Mul => a.wrapping_mul(b),
            AluOp::And => a & b,
            AluOp::Or => a | b,
            AluOp::Xor => a ^ b,
            AluOp::Shl => u32::try_from(b).ok().and_then(|b| a.checked_shl(b)).unwrap_or(0),
            AluOp::Shr => u32::try_from(b).ok().and_then(|b| a.checked_shr(b)).unwrap_or(0),
        };
        self.registers[dst as usize] = RegisterState {
            value: Some(value),
            valid,
        };
        Ok(())
    }

    /// Integer representation of a constant node
    fn constant(&self, expr: &Expr, value: Literal) -> Result<i64> {
        let ty = match self.types.expr(expr) {
            Some(ty) if ty.is_known() => ty.clone(),
            _ if value.is_float() => Type::Time,
            _ => Type::Normal,
        };
        units::convert(value, &ty)
    }

    /// Evaluate an operand; the flag tells whether the register is a temporary
    fn operand(&mut self, expr: &Expr) -> Result<(Operand, bool)> {
        match expr.kind() {
            ExprKind::Const(value) => Ok((Operand::Imm(self.constant(expr, *value)?), false)),
            ExprKind::Var(var) => Ok((Operand::Reg(self.var_register(var)?), false)),
            ExprKind::Binary { .. } | ExprKind::Not(_) | ExprKind::Index { .. } => {
                Ok((Operand::Reg(self.calc(expr)?), true))
            }
            ExprKind::Property(prop) => Err(Error::structural(format!(
                "Property '{}' of cell {} was not resolved",
                prop.name, prop.cell
            ))),
            ExprKind::Compare { .. } => Err(Error::unsupported(format!(
                "Comparison {} can not be used as a value",
                expr
            ))),
        }
    }

    /// Register holding the value of `expr`; the flag tells whether the
    /// caller has to release it
    pub fn value_register(&mut self, expr: &Expr) -> Result<(Reg, bool)> {
        match self.operand(expr)? {
            (Operand::Reg(reg), temp) => Ok((reg, temp)),
            (Operand::Imm(value), _) => Ok((self.immediate_to_register(value, None)?, true)),
        }
    }

    /// Emit a calculation into a fresh register
    pub fn calc(&mut self, expr: &Expr) -> Result<Reg> {
        match expr.kind() {
            ExprKind::Binary { op, lhs, rhs } => {
                let (a, a_temp) = self.operand(lhs)?;
                let (b, b_temp) = self.operand(rhs)?;
                let dst = self.alu(AluOp::from(*op), a, b, None)?;
                self.release_operand(a, a_temp);
                self.release_operand(b, b_temp);
                Ok(dst)
            }
            ExprKind::Not(inner) => {
                let (a, temp) = self.operand(inner)?;
                let dst = self.alu(AluOp::Xor, a, Operand::Imm(-1), None)?;
                self.release_operand(a, temp);
                Ok(dst)
            }
            ExprKind::Index { array, index } => {
                let base = self.arrays.get(&array.id()).copied().ok_or_else(|| {
                    Error::structural(format!("Array {} has no data on cell {}", array, self.cell))
                })?;
                let (index, temp) = self.operand(index)?;
                let dst = self.load_index(base, index)?;
                self.release_operand(index, temp);
                Ok(dst)
            }
            _ => {
                let (reg, temp) = self.value_register(expr)?;
                if temp {
                    return Ok(reg);
                }
                let dst = self.request()?;
                self.mov(dst, reg)?;
                Ok(dst)
            }
        }
    }

    fn release_operand(&mut self, operand: Operand, temp: bool) {
        if let (Operand::Reg(reg), true) = (operand, temp) {
            self.release(reg);
        }
    }

    // =========================================================================
    // Memory
    // =========================================================================

    /// Load element `index` of the array stored at word address `base`
    fn load_index(&mut self, base: i64, index: Operand) -> Result<Reg> {
        let address = match index {
            Operand::Imm(i) => self.immediate_to_register(base + i, None)?,
            Operand::Reg(index) => {
                let address = self.request()?;
                let tmp = self.immediate_to_register(base, None)?;
                self.push(Instruction::reg_reg(AluOp::Add, address, index, tmp), 1, true);
                self.release(tmp);
                address
            }
        };
        let dst = self.request()?;
        self.push(Instruction::load(dst, address, 0), cycles::LOAD_STORE, true);
        self.release(address);
        self.set_register(
            dst,
            RegisterState {
                value: Some(0),
                valid: false,
            },
        );
        Ok(dst)
    }

    /// Store a value at an absolute word address
    ///
    /// With `pair` the 16 bit value is written to both halves of the word.
    pub fn store(&mut self, value: &Expr, address: u32, pair: bool) -> Result<()> {
        let mut temporaries = Vec::new();

        let src = match value.kind() {
            ExprKind::Const(literal) => {
                let mut v = self.constant(value, *literal)?;
                if pair {
                    v = (v & 0xFFFF) | (v & 0xFFFF) << 16;
                }
                let reg = self.request()?;
                temporaries.push(reg);
                self.immediate_to_register(v, Some(reg))?
            }
            _ => {
                let (reg, temp) = self.value_register(value)?;
                if pair {
                    let tmp = self.request()?;
                    self.push(Instruction::reg_imm(AluOp::Shl, tmp, reg, 16), 1, true);
                    self.push(Instruction::reg_reg(AluOp::Or, tmp, tmp, reg), 1, true);
                    if temp {
                        self.release(reg);
                    }
                    temporaries.push(tmp);
                    tmp
                } else {
                    if temp {
                        temporaries.push(reg);
                    }
                    reg
                }
            }
        };

        let address = address as i64;
        let (base, offset) = if fits_lower_immediate(address) {
            (R0, address)
        } else {
            let base = self.request()?;
            temporaries.push(base);
            self.immediate_to_register(address, Some(base))?;
            (base, 0)
        };

        self.push(
            Instruction::store(src, base, offset as i32),
            cycles::LOAD_STORE,
            true,
        );
        for reg in temporaries.into_iter().rev() {
            self.release(reg);
        }
        Ok(())
    }

    // =========================================================================
    // Control flow
    // =========================================================================

    /// Compare-and-branch with an offset patched later; returns its position
    pub fn branch(&mut self, op: CmpOp, lhs: Reg, rhs: Reg) -> usize {
        self.push(Instruction::branch(op, lhs, rhs, 0), 1, true);
        self.size() - 1
    }

    /// Branch over a body unless `condition` holds; returns the branch position
    pub fn if_condition(&mut self, condition: &Expr) -> Result<usize> {
        let ExprKind::Compare { op, lhs, rhs } = condition.kind() else {
            return Err(Error::unsupported(format!(
                "Condition {} is not a comparison",
                condition
            )));
        };
        let (a, a_temp) = self.value_register(lhs)?;
        let (b, b_temp) = self.value_register(rhs)?;
        let pc = self.branch(op.invert(), a, b);
        if a_temp {
            self.release(a);
        }
        if b_temp {
            self.release(b);
        }
        Ok(pc)
    }

    /// Jump with an offset patched later; returns its position
    pub fn jump(&mut self, offset: i32) -> usize {
        self.push(Instruction::jump(offset), cycles::JUMP, true);
        self.size() - 1
    }

    /// Set the relative target of the branch or jump at `pc`
    pub fn patch(&mut self, pc: usize, offset: i64) {
        if let Some(instruction) = self.instructions.get_mut(pc) {
            instruction.set_offset(offset as i32);
        }
    }

    // =========================================================================
    // Waits
    // =========================================================================

    pub fn wait_cycles(&mut self, cycles: i64) -> Result<()> {
        if !(0..(1i64 << 32)).contains(&cycles) {
            return Err(Error::encoding(format!(
                "Wait length needs to be between 0 and {:.3}s, but was {} cycles",
                units::cycles_to_time((1i64 << 32) - 1),
                cycles
            )));
        }
        if cycles <= WAIT_IMM_MAX {
            self.push(Instruction::wait_imm(cycles as u32), cycles, true);
        } else {
            // loading the register takes two cycles
            let reg = self.immediate_to_register(cycles - 2, None)?;
            self.push(Instruction::WaitReg { reg }, cycles - 2, true);
            self.release(reg);
        }
        Ok(())
    }

    fn wait_register(&mut self, reg: Reg) -> Result<()> {
        let value = self.bound_value(reg)?;
        let valid = self.registers[reg as usize].valid;
        self.push(Instruction::WaitReg { reg }, value, valid);
        Ok(())
    }

    pub fn wait(&mut self, length: &Expr) -> Result<()> {
        match length.kind() {
            ExprKind::Const(value) => self.wait_cycles(units::convert(*value, &Type::Time)?),
            ExprKind::Var(var) => {
                let reg = self.var_register(var)?;
                self.wait_register(reg)
            }
            _ => {
                tracing::warn!("Calculations inside wait might impede timing");
                let reg = self.calc(length)?;
                self.wait_register(reg)?;
                self.release(reg);
                Ok(())
            }
        }
    }

    // =========================================================================
    // Triggers
    // =========================================================================

    /// Trigger field of a generator: the new pulse, a choke if it is still
    /// running, or nothing
    fn pulse_field(pulse: Option<&PulseTrigger>, active: bool) -> u8 {
        match pulse {
            Some(pulse) => pulse.index,
            None if active => CHOKE_PULSE_INDEX,
            None => 0,
        }
    }

    pub fn trigger(&mut self, trigger: Trigger) -> Result<()> {
        let fields = TriggerFields {
            readout: Self::pulse_field(trigger.readout.as_ref(), self.active.readout),
            recording: trigger.recording.map_or(0, |r| r.mode),
            manipulation: Self::pulse_field(trigger.manipulation.as_ref(), self.active.manipulation),
            external: trigger.external.map_or(0, |(set, _)| set),
            ..TriggerFields::default()
        };
        // the new trigger stops whatever was running
        self.active = ActiveModules::default();
        self.push(Instruction::trigger(fields), 1, true);

        let var_lengths: BTreeSet<Reg> = [trigger.manipulation, trigger.readout]
            .iter()
            .flatten()
            .filter_map(|pulse| match pulse.length {
                Length::Var(reg) => Some(reg),
                Length::Cycles(_) => None,
            })
            .collect();
        if var_lengths.len() > 1 {
            return Err(Error::structural(
                "Concurrent pulses with different variable length not supported",
            ));
        }

        if let Some(&reg) = var_lengths.iter().next().filter(|_| !trigger.single_cycle) {
            let value = self.bound_value(reg)?;
            let valid = self.registers[reg as usize].valid;
            self.push(Instruction::TriggerWaitReg { reg }, value - 1, valid);
        }
        if !var_lengths.is_empty() || trigger.single_cycle {
            self.active = ActiveModules {
                readout: trigger.readout.is_some(),
                manipulation: trigger.manipulation.is_some(),
            };
            self.await_state(trigger.recording);
            return Ok(());
        }

        let mut length = 0;
        for pulse in [trigger.manipulation, trigger.readout].iter().flatten() {
            if let Length::Cycles(cycles) = pulse.length {
                length = length.max(cycles);
            }
        }
        if let Some((_, cycles)) = trigger.external {
            length = length.max(cycles);
        }
        if let Some(recording) = trigger.recording {
            let delay = if trigger.recording_delay {
                cycles::RECORDING_MODULE_DELAY
            } else {
                0
            };
            length = length.max(recording.cycles + delay);
        }

        let continuous = trigger.recording.is_some_and(|r| r.is_continuous());
        if !self.await_state(trigger.recording) && length > 1 && !continuous {
            // the trigger itself took one cycle
            self.wait_cycles(length - 1)?;
        }
        Ok(())
    }

    /// Wait for the measured state if the recording saves one
    fn await_state(&mut self, recording: Option<RecordTrigger>) -> bool {
        let Some(dst) = recording.and_then(|r| r.state_to) else {
            return false;
        };
        self.push(
            Instruction::AwaitState {
                dst,
                cell: self.hw_cell as u8,
            },
            1,
            true,
        );
        self.set_register(
            dst,
            RegisterState {
                value: Some(0),
                valid: false,
            },
        );
        // the state arrives after an unknown number of cycles
        self.cycles.valid = false;
        true
    }

    /// Stop every running generator
    pub fn choke(&mut self) {
        let fields = TriggerFields {
            readout: Self::pulse_field(None, self.active.readout),
            manipulation: Self::pulse_field(None, self.active.manipulation),
            ..TriggerFields::default()
        };
        self.active = ActiveModules::default();
        self.push(Instruction::trigger(fields), 1, true);
    }

    /// Called at the end of every command body
    pub fn end_of_body(&mut self) {
        if self.active.any() {
            self.choke();
        }
    }

    pub fn nco_sync(&mut self, cycles: i64) -> Result<()> {
        self.push(Instruction::nco_sync(), 1, true);
        if cycles > 1 {
            self.wait_cycles(cycles - 1)?;
        }
        Ok(())
    }

    pub fn end(&mut self) {
        self.push(Instruction::End, 1, true);
    }

    // =========================================================================
    // Synchronization
    // =========================================================================

    pub fn program_cycles(&self) -> ProgramCycles {
        self.cycles
    }

    pub fn set_program_cycles(&mut self, cycles: ProgramCycles) {
        self.cycles = cycles;
    }

    pub fn invalidate_cycles(&mut self) {
        self.cycles.valid = false;
    }

    pub fn set_synchronized(&mut self, point: SyncPoint) {
        self.cycles = ProgramCycles {
            cycles: 0,
            valid: true,
            last_sync: point,
        };
    }

    /// Emit a `sync` word and restart cycle counting
    pub fn cell_sync(&mut self, instruction: Instruction, point: SyncPoint) {
        self.push(instruction, 1, true);
        self.set_synchronized(point);
    }

    // =========================================================================
    // Registries
    // =========================================================================

    fn register_shape(registry: &mut Vec<PulseShape>, shape: PulseShape) -> Result<u8> {
        let position = match registry.iter().position(|s| *s == shape) {
            Some(position) => position,
            None => {
                registry.push(shape);
                registry.len() - 1
            }
        };
        if position >= MAX_PULSE_INDEX as usize {
            return Err(Error::structural("Too many pulses in use"));
        }
        Ok(position as u8 + 1)
    }

    /// Trigger index of a manipulation pulse shape
    pub fn register_pulse(&mut self, shape: PulseShape) -> Result<u8> {
        Self::register_shape(&mut self.pulses, shape)
    }

    /// Trigger index of a readout pulse shape
    pub fn register_readout_pulse(&mut self, shape: PulseShape) -> Result<u8> {
        Self::register_shape(&mut self.readout_pulses, shape)
    }

    /// External field value of a set of digital trigger outputs
    pub fn register_trigger_set(&mut self, outputs: &[u8]) -> Result<u8> {
        let mut set = outputs.to_vec();
        set.sort_unstable();
        set.dedup();
        let position = match self.trigger_sets.iter().position(|s| *s == set) {
            Some(position) => position,
            None => {
                self.trigger_sets.push(set);
                self.trigger_sets.len() - 1
            }
        };
        if position >= MAX_TRIGGER_SET_INDEX as usize {
            return Err(Error::structural(
                "Too many digital trigger sets in use (Only three sets are available)",
            ));
        }
        Ok(position as u8 + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::pulse::Envelope;

    fn mnemonics(seq: &Sequencer) -> Vec<String> {
        seq.instructions().iter().map(|i| i.to_string()).collect()
    }

    #[test]
    fn test_registers_are_handed_out_in_order() {
        let types = TypeTable::default();
        let mut seq = Sequencer::new(Cell::new(0), 0, &types);
        assert_eq!(seq.request().unwrap(), 1);
        assert_eq!(seq.request().unwrap(), 2);
        seq.release(2);
        assert_eq!(seq.request().unwrap(), 2);
    }

    #[test]
    fn test_running_out_of_registers() {
        let types = TypeTable::default();
        let mut seq = Sequencer::new(Cell::new(0), 0, &types);
        for _ in 0..31 {
            seq.request().unwrap();
        }
        assert!(matches!(seq.request(), Err(Error::EncodingRangeError(_))));
    }

    #[test]
    fn test_large_immediate_uses_lui() {
        let types = TypeTable::default();
        let mut seq = Sequencer::new(Cell::new(0), 0, &types);
        let reg = seq.immediate_to_register(0x8400, None).unwrap();
        assert_eq!(mnemonics(&seq), vec!["lui r1, 0x8000", "addi r1, r1, 0x400"]);
        assert_eq!(seq.register(reg).value, Some(0x8400));
        assert_eq!(seq.immediate_to_register(0, None).unwrap(), R0);
        assert!(seq.immediate_to_register(1 << 32, None).is_err());
    }

    #[test]
    fn test_subtraction_of_constant_becomes_addi() {
        let types = TypeTable::default();
        let mut seq = Sequencer::new(Cell::new(0), 0, &types);
        let x = seq.immediate_to_register(10, None).unwrap();
        let dst = seq
            .alu(AluOp::Sub, Operand::Reg(x), Operand::Imm(3), None)
            .unwrap();
        assert_eq!(mnemonics(&seq)[1], "addi r2, r1, 0xffd");
        assert_eq!(seq.register(dst).value, Some(7));
    }

    #[test]
    fn test_commutative_swaps_immediate_operand() {
        let types = TypeTable::default();
        let mut seq = Sequencer::new(Cell::new(0), 0, &types);
        let x = seq.immediate_to_register(4, None).unwrap();
        seq.alu(AluOp::Add, Operand::Imm(5), Operand::Reg(x), None)
            .unwrap();
        assert_eq!(mnemonics(&seq)[1], "addi r2, r1, 0x5");

        let before = seq.program_cycles().cycles;
        seq.alu(AluOp::Mul, Operand::Reg(x), Operand::Reg(x), None)
            .unwrap();
        assert_eq!(mnemonics(&seq)[2], "mul r3, r1, r1");
        assert_eq!(seq.program_cycles().cycles - before, cycles::MULTIPLICATION);
    }

    #[test]
    fn test_unbound_register_in_calculation() {
        let types = TypeTable::default();
        let mut seq = Sequencer::new(Cell::new(0), 0, &types);
        let x = seq.allocate_var(VarId(0)).unwrap();
        let err = seq
            .alu(AluOp::Add, Operand::Reg(x), Operand::Imm(1), None)
            .unwrap_err();
        assert_eq!(err, Error::UnboundVariable { register: 1 });
    }

    #[test]
    fn test_long_wait_uses_register() {
        let types = TypeTable::default();
        let mut seq = Sequencer::new(Cell::new(0), 0, &types);
        seq.wait_cycles(24).unwrap();
        seq.wait_cycles(1 << 21).unwrap();
        assert_eq!(
            mnemonics(&seq),
            vec!["wti 0x18", "lui r1, 0x200000", "addi r1, r1, 0xffe", "wtr r1, 0x0"]
        );
        assert_eq!(seq.program_cycles().cycles, 24 + 2 + (1 << 21) - 2);
        assert!(seq.wait_cycles(-1).is_err());
        assert!(seq.wait_cycles(1 << 32).is_err());
    }

    #[test]
    fn test_variable_pulse_is_choked() {
        let types = TypeTable::default();
        let mut seq = Sequencer::new(Cell::new(0), 0, &types);
        let length = seq.immediate_to_register(5, None).unwrap();
        seq.trigger(Trigger {
            manipulation: Some(PulseTrigger {
                index: 1,
                length: Length::Var(length),
            }),
            ..Trigger::default()
        })
        .unwrap();
        seq.wait_cycles(3).unwrap();

        assert_eq!(
            mnemonics(&seq),
            vec![
                "addi r1, r0, 0x5",
                "tr 0x0, 0x0, 0x1, 0x0, 0x0, 0x0",
                "twr r1, 0x0",
                "tr 0x0, 0x0, 0xe, 0x0, 0x0, 0x0",
                "wti 0x3",
            ]
        );
    }

    #[test]
    fn test_trigger_waits_for_longest_module() {
        let types = TypeTable::default();
        let mut seq = Sequencer::new(Cell::new(0), 0, &types);
        seq.trigger(Trigger {
            readout: Some(PulseTrigger {
                index: 1,
                length: Length::Cycles(100),
            }),
            recording: Some(RecordTrigger {
                mode: RecordTrigger::SINGLE,
                cycles: 100,
                state_to: None,
            }),
            ..Trigger::default()
        })
        .unwrap();
        assert_eq!(
            mnemonics(&seq),
            vec!["tr 0x1, 0x1, 0x0, 0x0, 0x0, 0x0", "wti 0x64"]
        );
        assert_eq!(seq.program_cycles().cycles, 101);
    }

    #[test]
    fn test_state_recording_awaits_state() {
        let types = TypeTable::default();
        let mut seq = Sequencer::new(Cell::new(0), 3, &types);
        let state = seq.allocate_var(VarId(0)).unwrap();
        seq.trigger(Trigger {
            recording: Some(RecordTrigger {
                mode: RecordTrigger::ONESHOT,
                cycles: 100,
                state_to: Some(state),
            }),
            ..Trigger::default()
        })
        .unwrap();
        assert_eq!(mnemonics(&seq)[1], "wtq r1, 3");
        assert!(!seq.program_cycles().valid);
        assert!(!seq.register(state).valid);
    }

    #[test]
    fn test_different_variable_lengths_conflict() {
        let types = TypeTable::default();
        let mut seq = Sequencer::new(Cell::new(0), 0, &types);
        let a = seq.immediate_to_register(5, None).unwrap();
        let b = seq.immediate_to_register(6, None).unwrap();
        let err = seq
            .trigger(Trigger {
                manipulation: Some(PulseTrigger {
                    index: 1,
                    length: Length::Var(a),
                }),
                readout: Some(PulseTrigger {
                    index: 1,
                    length: Length::Var(b),
                }),
                ..Trigger::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::StructuralError(_)));
    }

    #[test]
    fn test_amplitude_store_fills_both_halves() {
        let types = TypeTable::default();
        let mut seq = Sequencer::new(Cell::new(0), 0, &types);
        let amp = seq.allocate_var(VarId(0)).unwrap();
        seq.set_register(
            amp,
            RegisterState {
                value: Some(100),
                valid: true,
            },
        );
        let var = Var::new(VarId(0), "amp");
        seq.store(&var.expr(), 0x18010 / 4, true).unwrap();
        assert_eq!(
            mnemonics(&seq),
            vec![
                "sll r2, r1, 0x10",
                "or r2, r2, r1",
                "lui r3, 0x6000",
                "addi r3, r3, 0x4",
                "sw r2, 0(r3)",
            ]
        );
    }

    #[test]
    fn test_pulse_registry() {
        let types = TypeTable::default();
        let mut seq = Sequencer::new(Cell::new(0), 0, &types);
        let shape = |cycles| PulseShape {
            envelope: Envelope::Rect,
            cycles: Some(cycles),
        };
        assert_eq!(seq.register_pulse(shape(5)).unwrap(), 1);
        assert_eq!(seq.register_pulse(shape(6)).unwrap(), 2);
        assert_eq!(seq.register_pulse(shape(5)).unwrap(), 1);
        for cycles in 7..18 {
            seq.register_pulse(shape(cycles)).unwrap();
        }
        assert!(seq.register_pulse(shape(100)).is_err());
    }

    #[test]
    fn test_trigger_sets_are_limited() {
        let types = TypeTable::default();
        let mut seq = Sequencer::new(Cell::new(0), 0, &types);
        assert_eq!(seq.register_trigger_set(&[1, 0]).unwrap(), 1);
        assert_eq!(seq.register_trigger_set(&[0, 1]).unwrap(), 1);
        seq.register_trigger_set(&[2]).unwrap();
        seq.register_trigger_set(&[3]).unwrap();
        assert!(seq.register_trigger_set(&[4]).is_err());
    }
}
