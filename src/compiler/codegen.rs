//! # Code Generation
//!
//! Walks the analyzed command tree once and drives one [`Sequencer`] per
//! cell. Structured commands are emitted on every cell they are relevant
//! for, single-cell commands only on their own cell.
//!
//! ## Synchronization
//!
//! Cells run independently, so every multi-cell construct (If, loops,
//! Parallel, Sync) starts with a synchronization. When all cells know
//! statically how many cycles passed since the same sync point, the shorter
//! ones are padded with a wait; otherwise a `sync` word is emitted.
//!
//! ## Loops over durations
//!
//! A TIME loop variable used as a pulse or wait length can not run its 0 and
//! 1 cycle iterations through `wtr`/`twr`. These iterations are unrolled:
//! with 0 cycles the affected commands disappear, with 1 cycle variable
//! pulses become single cycle triggers.

use super::instruction::{AluOp, Instruction, Reg};
use super::mem_params::Parameter;
use super::relevance::Relevance;
use super::sequencer::{
    Length, Operand, PulseTrigger, RecordTrigger, RegisterState, Sequencer, SequencerOutput,
    SyncPoint, SyncPointKind, Trigger,
};
use super::CompileOptions;
use crate::error::{Error, Result};
use crate::program::expr::{CmpOp, Expr, ExprKind, Literal, VarId};
use crate::program::units;
use crate::program::{Cell, CellSet, Command, Program, Pulse, PulseShape, Recording, Var};
use crate::types::{Type, TypeTable};
use std::collections::{BTreeMap, BTreeSet};

/// First word of the static data region holding array contents
pub const STATIC_DATA_BASE: i64 = 0x8400;

/// Instruction stream and data of one cell
#[derive(Debug, Clone)]
pub struct GeneratedCell {
    pub cell: Cell,
    pub hw_cell: usize,
    pub output: SequencerOutput,
    /// Initial content of the static data region
    pub static_data: Vec<i64>,
}

/// Result of code generation for a whole program
#[derive(Debug, Clone, Default)]
pub struct GeneratedCode {
    pub cells: Vec<GeneratedCell>,
    /// Instruction offset of every entry point on every cell
    pub entry_points: BTreeMap<String, BTreeMap<Cell, usize>>,
}

/// How commands depending on an unrolled loop variable are emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unroll {
    /// The variable is 0 cycles: drop pulses and waits of that length
    Skip,
    /// The variable is 1 cycle: variable pulses become single cycle triggers
    SingleCycle,
}

/// Start or end value of a counted loop
#[derive(Debug, Clone)]
enum Bound {
    Cycles(i64),
    Expr(Expr),
}

pub struct CodeGenerator<'a> {
    program: &'a Program,
    types: &'a TypeTable,
    sequencers: BTreeMap<Cell, Sequencer<'a>>,
    static_data: BTreeMap<Cell, Vec<i64>>,
    /// Nesting of bodies that may run zero or several times
    depth: usize,
    unroll: Option<(VarId, Unroll)>,
    entry_points: BTreeMap<String, BTreeMap<Cell, usize>>,
}

impl<'a> CodeGenerator<'a> {
    pub fn new(
        program: &'a Program,
        types: &'a TypeTable,
        relevance: &'a Relevance,
        options: &CompileOptions,
    ) -> Result<Self> {
        let mut sequencers = BTreeMap::new();
        let mut static_data = BTreeMap::new();

        for &cell in &program.cells {
            let hw_cell = options.hw_cell(cell);
            let mut seq = Sequencer::new(cell, hw_cell, types);
            let mut data = Vec::new();

            for (&id, ty) in types.variables() {
                if !relevance.is_relevant(id, cell) {
                    continue;
                }
                match ty {
                    Type::Array(element, shape) => {
                        seq.set_array_address(id, STATIC_DATA_BASE + data.len() as i64);
                        match program.variable(id).and_then(|v| v.elements()) {
                            Some(values) => {
                                for value in values {
                                    data.push(units::convert(*value, element)?);
                                }
                            }
                            None => data.extend(std::iter::repeat(0).take(shape.len().unwrap_or(0))),
                        }
                    }
                    _ => {
                        seq.allocate_var(id)?;
                    }
                }
            }

            tracing::debug!(
                cell = cell.index(),
                hw_cell,
                static_words = data.len(),
                "cell prepared"
            );
            if !options.skip_nco_sync {
                seq.nco_sync(units::time_to_cycles(options.nco_sync_length))?;
            }
            sequencers.insert(cell, seq);
            static_data.insert(cell, data);
        }

        Ok(Self {
            program,
            types,
            sequencers,
            static_data,
            depth: 0,
            unroll: None,
            entry_points: BTreeMap::new(),
        })
    }

    /// Emit the whole program
    pub fn generate(mut self) -> Result<GeneratedCode> {
        let program = self.program;
        let mut entries: BTreeMap<usize, Vec<&String>> = BTreeMap::new();
        for (name, &position) in &program.entry_points {
            entries.entry(position).or_default().push(name);
        }

        for (index, command) in program.commands.iter().enumerate() {
            self.mark_entry_points(entries.get(&index));
            self.command(command)?;
        }
        self.mark_entry_points(entries.get(&program.commands.len()));

        let mut cells = Vec::new();
        for (cell, mut seq) in self.sequencers {
            seq.end();
            tracing::debug!(cell = cell.index(), instructions = seq.size(), "cell finished");
            cells.push(GeneratedCell {
                cell,
                hw_cell: seq.hw_cell(),
                output: seq.finish(),
                static_data: self.static_data.remove(&cell).unwrap_or_default(),
            });
        }
        Ok(GeneratedCode {
            cells,
            entry_points: self.entry_points,
        })
    }

    fn mark_entry_points(&mut self, names: Option<&Vec<&String>>) {
        for name in names.into_iter().flatten() {
            let offsets = self
                .sequencers
                .iter()
                .map(|(cell, seq)| (*cell, seq.size()))
                .collect();
            self.entry_points.insert((*name).clone(), offsets);
        }
    }

    fn seq(&mut self, cell: Cell) -> Result<&mut Sequencer<'a>> {
        self.sequencers
            .get_mut(&cell)
            .ok_or_else(|| Error::structural(format!("Cell {} is not part of the program", cell)))
    }

    fn var_type(&self, var: &Var) -> Type {
        self.types.var(var.id()).cloned().unwrap_or(Type::Unknown)
    }

    // =========================================================================
    // Commands
    // =========================================================================

    fn commands(&mut self, commands: &[Command]) -> Result<()> {
        for command in commands {
            self.command(command)?;
        }
        Ok(())
    }

    /// A nested body; running modules are choked at its end
    fn body(&mut self, commands: &[Command], cells: &CellSet) -> Result<()> {
        self.commands(commands)?;
        for &cell in cells {
            self.seq(cell)?.end_of_body();
        }
        Ok(())
    }

    fn command(&mut self, command: &Command) -> Result<()> {
        match command {
            Command::Play { cell, pulse } => self.play(*cell, pulse),
            Command::PlayReadout {
                cell,
                pulse,
                recording,
            } => self.play_readout(*cell, pulse, recording.as_ref()),
            Command::Record { cell, recording } => {
                let recording = self.record_trigger(*cell, recording)?;
                self.seq(*cell)?.trigger(Trigger {
                    recording: Some(recording),
                    ..Trigger::default()
                })
            }
            Command::Wait { cell, length } => self.wait(*cell, length),
            Command::DigitalTrigger {
                cell,
                length,
                outputs,
            } => {
                let cycles = constant_cycles(length).ok_or_else(|| {
                    Error::unsupported("Digital trigger length must be a constant")
                })?;
                let seq = self.seq(*cell)?;
                let set = seq.register_trigger_set(outputs)?;
                seq.trigger(Trigger {
                    external: Some((set, cycles)),
                    ..Trigger::default()
                })
            }
            Command::Assign { var, value, cells } => {
                let valid = self.depth == 0;
                for &cell in cells {
                    let seq = self.seq(cell)?;
                    let dst = seq.var_register(var)?;
                    seq.assign(dst, value, valid)?;
                }
                Ok(())
            }
            Command::If {
                condition,
                body,
                else_body,
                cells,
            } => self.if_else(command, condition, body, else_body.as_deref(), cells),
            Command::ForRange {
                var,
                start,
                end,
                step,
                body,
                cells,
            } => self.for_range(command, var, start, end, step, body, cells),
            Command::While {
                condition,
                body,
                cells,
            } => self.while_loop(command, condition, body, cells),
            Command::Parallel { branches, cells } => self.parallel(command, branches, cells),
            Command::Sync { cells } => {
                let cells = if cells.is_empty() {
                    self.program.cells.iter().copied().collect()
                } else {
                    cells.clone()
                };
                self.sync_cells(&cells, SyncPoint::at(command, SyncPointKind::SyncCommand))
            }
            Command::MemoryStore {
                cell,
                address,
                value,
            } => {
                let pair = Parameter::from_address(*address).is_some_and(|p| p.is_amplitude());
                self.seq(*cell)?.store(value, *address, pair)
            }
        }
    }

    /// Mode of an unrolled iteration if `expr` is exactly its variable
    fn unrolled(&self, expr: &Expr) -> Option<Unroll> {
        let (var, mode) = self.unroll?;
        (expr.as_var()?.id() == var).then_some(mode)
    }

    // =========================================================================
    // Pulses, recordings, waits
    // =========================================================================

    /// Register the pulse shape and work out its trigger length; the flag
    /// tells whether the length register is a temporary
    fn pulse_trigger(&mut self, cell: Cell, pulse: &Pulse, readout: bool) -> Result<(PulseTrigger, bool)> {
        let seq = self.sequencers.get_mut(&cell).ok_or_else(|| {
            Error::structural(format!("Cell {} is not part of the program", cell))
        })?;
        let (length, cycles, temp) = match pulse.length.kind() {
            ExprKind::Const(value) => {
                let cycles = units::convert(*value, &Type::Time)?;
                (Length::Cycles(cycles), Some(cycles.max(0) as u64), false)
            }
            ExprKind::Var(var) => (Length::Var(seq.var_register(var)?), None, false),
            _ => (Length::Var(seq.calc(&pulse.length)?), None, true),
        };
        let shape = PulseShape {
            envelope: pulse.envelope,
            cycles,
        };
        let index = if readout {
            seq.register_readout_pulse(shape)?
        } else {
            seq.register_pulse(shape)?
        };
        Ok((PulseTrigger { index, length }, temp))
    }

    fn release_length(&mut self, cell: Cell, trigger: &PulseTrigger, temp: bool) -> Result<()> {
        if let (Length::Var(reg), true) = (trigger.length, temp) {
            self.seq(cell)?.release(reg);
        }
        Ok(())
    }

    fn play(&mut self, cell: Cell, pulse: &Pulse) -> Result<()> {
        let mode = self.unrolled(&pulse.length);
        if mode == Some(Unroll::Skip) {
            return Ok(());
        }
        let (manipulation, temp) = self.pulse_trigger(cell, pulse, false)?;
        self.seq(cell)?.trigger(Trigger {
            manipulation: Some(manipulation),
            single_cycle: mode == Some(Unroll::SingleCycle),
            ..Trigger::default()
        })?;
        self.release_length(cell, &manipulation, temp)
    }

    fn play_readout(&mut self, cell: Cell, pulse: &Pulse, recording: Option<&Recording>) -> Result<()> {
        let recording = recording
            .map(|r| self.record_trigger(cell, r))
            .transpose()?;
        let mode = self.unrolled(&pulse.length);
        if mode == Some(Unroll::Skip) {
            if let Some(recording) = recording {
                self.seq(cell)?.trigger(Trigger {
                    recording: Some(recording),
                    ..Trigger::default()
                })?;
            }
            return Ok(());
        }
        let (readout, temp) = self.pulse_trigger(cell, pulse, true)?;
        self.seq(cell)?.trigger(Trigger {
            readout: Some(readout),
            recording,
            single_cycle: mode == Some(Unroll::SingleCycle),
            ..Trigger::default()
        })?;
        self.release_length(cell, &readout, temp)
    }

    fn record_trigger(&mut self, cell: Cell, recording: &Recording) -> Result<RecordTrigger> {
        let cycles = constant_cycles(&recording.length)
            .ok_or_else(|| Error::unsupported("Recording length must be a constant"))?;
        let mode = if recording.continuous {
            RecordTrigger::CONTINUOUS
        } else if recording.save_to.is_none() {
            RecordTrigger::ONESHOT
        } else {
            RecordTrigger::SINGLE
        };
        let state_to = match &recording.state_to {
            Some(var) => Some(self.seq(cell)?.var_register(var)?),
            None => None,
        };
        Ok(RecordTrigger {
            mode,
            cycles,
            state_to,
        })
    }

    fn wait(&mut self, cell: Cell, length: &Expr) -> Result<()> {
        match self.unrolled(length) {
            Some(Unroll::Skip) => return Ok(()),
            Some(Unroll::SingleCycle) => return self.seq(cell)?.wait_cycles(1),
            None => {}
        }
        if constant_cycles(length) == Some(0) {
            return Ok(());
        }
        self.seq(cell)?.wait(length)
    }

    // =========================================================================
    // Synchronization
    // =========================================================================

    fn sync_cells(&mut self, cells: &CellSet, point: SyncPoint) -> Result<()> {
        if cells.len() < 2 {
            return Ok(());
        }
        let mut states = Vec::new();
        for &cell in cells {
            states.push((cell, self.seq(cell)?.program_cycles()));
        }
        let reference = states[0].1.last_sync;
        let implicit = states
            .iter()
            .all(|(_, s)| s.valid && s.last_sync == reference);
        if !implicit {
            return self.force_sync(cells, point);
        }

        let longest = states.iter().map(|(_, s)| s.cycles).max().unwrap_or(0);
        for (cell, state) in states {
            let seq = self.seq(cell)?;
            if longest > state.cycles {
                seq.wait_cycles(longest - state.cycles)?;
            }
            seq.set_synchronized(point);
        }
        tracing::debug!(kind = ?point.kind(), cycles = longest, "cells synchronized by padding");
        Ok(())
    }

    fn force_sync(&mut self, cells: &CellSet, point: SyncPoint) -> Result<()> {
        if cells.len() < 2 {
            return Ok(());
        }
        let mut hw_cells = Vec::new();
        for &cell in cells {
            hw_cells.push(self.seq(cell)?.hw_cell());
        }
        let instruction = Instruction::cell_sync(&hw_cells)?;
        for &cell in cells {
            self.seq(cell)?.cell_sync(instruction, point);
        }
        tracing::debug!(kind = ?point.kind(), cells = cells.len(), "cells synchronized explicitly");
        Ok(())
    }

    // =========================================================================
    // Branches
    // =========================================================================

    fn if_else(
        &mut self,
        command: &Command,
        condition: &Expr,
        body: &[Command],
        else_body: Option<&[Command]>,
        cells: &CellSet,
    ) -> Result<()> {
        self.sync_cells(cells, SyncPoint::at(command, SyncPointKind::BeforeIf))?;
        self.depth += 1;

        let mut branches = BTreeMap::new();
        for &cell in cells {
            let seq = self.seq(cell)?;
            let pc = seq.if_condition(condition)?;
            seq.invalidate_cycles();
            branches.insert(cell, pc);
        }

        self.body(body, cells)?;

        match else_body {
            Some(else_body) => {
                let mut jumps = BTreeMap::new();
                for (&cell, &pc) in &branches {
                    let seq = self.seq(cell)?;
                    let jump = seq.jump(0);
                    seq.patch(pc, (seq.size() - pc) as i64);
                    jumps.insert(cell, jump);
                }
                self.body(else_body, cells)?;
                for (&cell, &jump) in &jumps {
                    let seq = self.seq(cell)?;
                    seq.patch(jump, (seq.size() - jump) as i64);
                }
            }
            None => {
                for (&cell, &pc) in &branches {
                    let seq = self.seq(cell)?;
                    seq.patch(pc, (seq.size() - pc) as i64);
                }
            }
        }

        self.depth -= 1;
        Ok(())
    }

    fn while_loop(&mut self, command: &Command, condition: &Expr, body: &[Command], cells: &CellSet) -> Result<()> {
        self.sync_cells(cells, SyncPoint::at(command, SyncPointKind::BeforeWhile))?;
        self.depth += 1;

        let mut heads = BTreeMap::new();
        for &cell in cells {
            let seq = self.seq(cell)?;
            let start = seq.size();
            let pc = seq.if_condition(condition)?;
            seq.invalidate_cycles();
            heads.insert(cell, (start, pc));
        }

        self.body(body, cells)?;

        for (&cell, &(start, pc)) in &heads {
            let seq = self.seq(cell)?;
            let jump = seq.jump(0);
            seq.patch(jump, start as i64 - jump as i64);
            seq.patch(pc, (seq.size() - pc) as i64);
            seq.invalidate_cycles();
        }

        self.depth -= 1;
        Ok(())
    }

    // =========================================================================
    // Counted loops
    // =========================================================================

    #[allow(clippy::too_many_arguments)]
    fn for_range(
        &mut self,
        command: &Command,
        var: &Var,
        start: &Expr,
        end: &Expr,
        step: &Expr,
        body: &[Command],
        cells: &CellSet,
    ) -> Result<()> {
        if assigns(body, var.id()) {
            return Err(Error::structural(format!(
                "Variable used in ForRange must not be used in internal Assign-Commands, var: {}",
                var
            )));
        }
        let ty = match self.var_type(var) {
            Type::Unknown => Type::Normal,
            known => known,
        };
        let step = match step.as_const() {
            Some(value) => units::convert(value, &ty)?,
            None => return Err(Error::structural("ForRange step must be a constant")),
        };
        let bound = |expr: &Expr| -> Result<Bound> {
            Ok(match expr.as_const() {
                Some(value) => Bound::Cycles(units::convert(value, &ty)?),
                None => Bound::Expr(expr.clone()),
            })
        };
        let (start, end) = (bound(start)?, bound(end)?);

        if ty != Type::Time || !uses_as_duration(body, var.id(), true) {
            return self.counted_loop(command, var, start, end, step, body, cells);
        }

        let (Bound::Cycles(mut first), Bound::Cycles(mut last)) = (start, end) else {
            return Err(Error::unsupported(format!(
                "ForRange over {} uses the variable as a duration and therefore needs constant start and end values",
                var
            )));
        };

        if step > 0 {
            for (value, mode, kind) in [
                (0, Unroll::Skip, SyncPointKind::LoopUnroll0),
                (1, Unroll::SingleCycle, SyncPointKind::LoopUnroll1),
            ] {
                if first == value && first < last {
                    self.unrolled_iteration(command, var, value, mode, kind, body, cells)?;
                    first += step;
                }
            }
            if first < last {
                self.counted_loop(command, var, Bound::Cycles(first), Bound::Cycles(last), step, body, cells)?;
            }
        } else {
            // iterations running through 1 and 0 cycles come last
            let mut tail = Vec::new();
            let count = iterations(first, last, step).unwrap_or(0);
            let mut remaining = count;
            while remaining > 0 {
                let value = first + (remaining - 1) * step;
                if value > 1 {
                    break;
                }
                tail.push(value);
                remaining -= 1;
            }
            if let Some(&highest) = tail.last() {
                last = highest;
            }
            if first > last {
                self.counted_loop(command, var, Bound::Cycles(first), Bound::Cycles(last), step, body, cells)?;
            }
            for value in tail.into_iter().rev() {
                let (mode, kind) = if value == 0 {
                    (Unroll::Skip, SyncPointKind::LoopUnroll0)
                } else {
                    (Unroll::SingleCycle, SyncPointKind::LoopUnroll1)
                };
                self.unrolled_iteration(command, var, value, mode, kind, body, cells)?;
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn unrolled_iteration(
        &mut self,
        command: &Command,
        var: &Var,
        value: i64,
        mode: Unroll,
        kind: SyncPointKind,
        body: &[Command],
        cells: &CellSet,
    ) -> Result<()> {
        self.sync_cells(cells, SyncPoint::at(command, kind))?;
        let valid = self.depth == 0;
        for &cell in cells {
            let seq = self.seq(cell)?;
            let reg = seq.var_register(var)?;
            seq.immediate_to_register(value, Some(reg))?;
            seq.set_register_valid(reg, valid);
        }
        let outer = self.unroll.replace((var.id(), mode));
        let result = self.body(body, cells);
        self.unroll = outer;
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn counted_loop(
        &mut self,
        command: &Command,
        var: &Var,
        start: Bound,
        end: Bound,
        step: i64,
        body: &[Command],
        cells: &CellSet,
    ) -> Result<()> {
        self.sync_cells(cells, SyncPoint::at(command, SyncPointKind::BeforeForRange))?;

        let count = match (&start, &end) {
            (Bound::Cycles(s), Bound::Cycles(e)) => iterations(*s, *e, step),
            _ => None,
        };
        let exit = if step > 0 { CmpOp::Ge } else { CmpOp::Le };

        struct Head {
            var: Reg,
            end: Reg,
            end_temp: bool,
            head: usize,
            branch: usize,
        }
        let mut heads = BTreeMap::new();
        for &cell in cells {
            let seq = self.seq(cell)?;
            let var_reg = seq.var_register(var)?;
            let (end_reg, end_temp) = match &end {
                Bound::Cycles(value) => (seq.immediate_to_register(*value, None)?, true),
                Bound::Expr(expr) => seq.value_register(expr)?,
            };
            match &start {
                Bound::Cycles(value) => {
                    seq.immediate_to_register(*value, Some(var_reg))?;
                }
                Bound::Expr(expr) => seq.assign(var_reg, expr, true)?,
            }
            // the counter changes with every iteration
            seq.set_register_valid(var_reg, false);
            let head = seq.size();
            let branch = seq.branch(exit, var_reg, end_reg);
            heads.insert(
                cell,
                Head {
                    var: var_reg,
                    end: end_reg,
                    end_temp,
                    head,
                    branch,
                },
            );
        }
        let before: BTreeMap<Cell, _> = cells
            .iter()
            .filter_map(|cell| Some((*cell, self.sequencers.get(cell)?.program_cycles())))
            .collect();

        self.depth += 1;
        self.body(body, cells)?;
        self.depth -= 1;

        let synced = cells.len() > 1;
        let timing = uses_as_duration(body, var.id(), false);
        if synced {
            let point = SyncPoint::at(command, SyncPointKind::AfterForRangeIteration);
            if timing {
                self.force_sync(cells, point)?;
            } else {
                self.sync_cells(cells, point)?;
            }
        }

        let valid = self.depth == 0;
        for (&cell, head) in &heads {
            let seq = self.seq(cell)?;
            seq.alu(AluOp::Add, Operand::Reg(head.var), Operand::Imm(step), Some(head.var))?;
            let jump = seq.jump(0);
            seq.patch(jump, head.head as i64 - jump as i64);
            seq.patch(head.branch, (seq.size() - head.branch) as i64);

            let final_value = match (&start, count) {
                (Bound::Cycles(s), Some(n)) => Some(s + n * step),
                _ => None,
            };
            let current = seq.register(head.var).value;
            seq.set_register(
                head.var,
                RegisterState {
                    value: final_value.or(current),
                    valid: valid && final_value.is_some(),
                },
            );
            if head.end_temp {
                seq.release(head.end);
            }

            let mut after = seq.program_cycles();
            let entry = before.get(&cell).copied();
            match (count, entry) {
                (Some(0), Some(entry)) => seq.set_program_cycles(entry),
                (Some(_), _) if synced => {
                    // from the last iteration's sync point through the exit branch
                    after.cycles += 1;
                    seq.set_program_cycles(after);
                }
                (Some(n), Some(entry)) if !timing && entry.last_sync == after.last_sync => {
                    let per_iteration = after.cycles - entry.cycles + 1;
                    after.cycles = entry.cycles + n * per_iteration;
                    after.valid &= entry.valid;
                    seq.set_program_cycles(after);
                }
                _ => seq.invalidate_cycles(),
            }
        }
        tracing::debug!(var = %var, iterations = ?count, step, "counted loop emitted");
        Ok(())
    }

    // =========================================================================
    // Parallel blocks
    // =========================================================================

    fn parallel(&mut self, command: &Command, branches: &[Vec<Command>], cells: &CellSet) -> Result<()> {
        self.sync_cells(cells, SyncPoint::at(command, SyncPointKind::BeforeParallel))?;

        for &cell in cells {
            let mut starts = Vec::new();
            let mut total = 0;
            for branch in branches {
                let mut now = 0;
                for command in branch.iter().filter(|c| c.cell() == Some(cell)) {
                    now = self.timeline_entry(cell, command, now, &mut starts)?;
                }
                total = total.max(now);
            }

            for (i, a) in starts.iter().enumerate() {
                for b in &starts[i + 1..] {
                    if a.module() == b.module() && a.start < b.end && b.start < a.end {
                        return Err(Error::structural(format!(
                            "Parallel blocks start the {} module of cell {} while it is still running",
                            a.module(),
                            cell
                        )));
                    }
                }
            }

            let mut bounds = BTreeSet::from([0, total]);
            for start in &starts {
                bounds.insert(start.start);
                bounds.insert(start.end);
            }
            let bounds: Vec<i64> = bounds.into_iter().collect();
            let seq = self.seq(cell)?;
            for slot in bounds.windows(2) {
                let (from, length) = (slot[0], slot[1] - slot[0]);
                let mut trigger = Trigger {
                    recording_delay: false,
                    ..Trigger::default()
                };
                let mut started = false;
                for start in starts.iter().filter(|s| s.start == from) {
                    started = true;
                    match start.what {
                        Started::Manipulation(index) => {
                            trigger.manipulation = Some(PulseTrigger {
                                index,
                                length: Length::Cycles(length),
                            })
                        }
                        Started::Readout(index) => {
                            trigger.readout = Some(PulseTrigger {
                                index,
                                length: Length::Cycles(length),
                            })
                        }
                        Started::Recording(record) => {
                            trigger.recording = Some(RecordTrigger {
                                cycles: length,
                                ..record
                            })
                        }
                        Started::External(set) => trigger.external = Some((set, length)),
                    }
                }
                if started {
                    seq.trigger(trigger)?;
                } else {
                    seq.wait_cycles(length)?;
                }
            }
        }
        Ok(())
    }

    /// Add what `command` starts at cycle `now` and return when it is done
    fn timeline_entry(&mut self, cell: Cell, command: &Command, now: i64, starts: &mut Vec<TimedStart>) -> Result<i64> {
        let constant = |expr: &Expr| {
            constant_cycles(expr).ok_or_else(|| {
                Error::structural(format!(
                    "Parallel blocks only support constant durations, got {}",
                    expr
                ))
            })
        };
        let mut push = |cycles: i64, what: Started| {
            if cycles > 0 {
                starts.push(TimedStart {
                    start: now,
                    end: now + cycles,
                    what,
                });
            }
        };

        let duration = match command {
            Command::Wait { length, .. } => constant(length)?,
            Command::Play { pulse, .. } => {
                let cycles = constant(&pulse.length)?;
                let index = self.seq(cell)?.register_pulse(PulseShape {
                    envelope: pulse.envelope,
                    cycles: Some(cycles.max(0) as u64),
                })?;
                push(cycles, Started::Manipulation(index));
                cycles
            }
            Command::PlayReadout {
                pulse, recording, ..
            } => {
                let cycles = constant(&pulse.length)?;
                let index = self.seq(cell)?.register_readout_pulse(PulseShape {
                    envelope: pulse.envelope,
                    cycles: Some(cycles.max(0) as u64),
                })?;
                push(cycles, Started::Readout(index));
                let mut duration = cycles;
                if let Some(recording) = recording {
                    let record = self.record_trigger(cell, recording)?;
                    push(record.cycles, Started::Recording(record));
                    duration = duration.max(record.cycles);
                }
                duration
            }
            Command::Record { recording, .. } => {
                let record = self.record_trigger(cell, recording)?;
                push(record.cycles, Started::Recording(record));
                record.cycles
            }
            Command::DigitalTrigger {
                length, outputs, ..
            } => {
                let cycles = constant(length)?;
                let set = self.seq(cell)?.register_trigger_set(outputs)?;
                push(cycles, Started::External(set));
                cycles
            }
            other => {
                return Err(Error::structural(format!(
                    "{} is not allowed inside Parallel blocks",
                    other.name()
                )))
            }
        };
        Ok(now + duration)
    }
}

/// Something a Parallel block starts on a cell
#[derive(Debug, Clone, Copy)]
enum Started {
    Manipulation(u8),
    Readout(u8),
    Recording(RecordTrigger),
    External(u8),
}

#[derive(Debug, Clone, Copy)]
struct TimedStart {
    start: i64,
    end: i64,
    what: Started,
}

impl TimedStart {
    fn module(&self) -> &'static str {
        match self.what {
            Started::Manipulation(_) => "manipulation",
            Started::Readout(_) => "readout",
            Started::Recording(_) => "recording",
            Started::External(_) => "digital trigger",
        }
    }
}

/// Cycles of a constant duration
fn constant_cycles(expr: &Expr) -> Option<i64> {
    expr.as_const()
        .and_then(|value: Literal| units::convert(value, &Type::Time).ok())
}

/// Number of iterations of `start..end` in steps of `step`
fn iterations(start: i64, end: i64, step: i64) -> Option<i64> {
    if step == 0 {
        return None;
    }
    let span = end - start;
    if span == 0 || (span > 0) != (step > 0) {
        return Some(0);
    }
    Some((span.abs() + step.abs() - 1) / step.abs())
}

/// Whether any Assign inside `commands` writes `var`
fn assigns(commands: &[Command], var: VarId) -> bool {
    commands.iter().any(|command| {
        matches!(command, Command::Assign { var: target, .. } if target.id() == var)
            || command.bodies().into_iter().any(|body| assigns(body, var))
    })
}

/// Whether `var` determines a pulse or wait length; with `exact` only the
/// variable itself counts, otherwise any calculation reading it
fn uses_as_duration(commands: &[Command], var: VarId, exact: bool) -> bool {
    let matches = |expr: &Expr| {
        if exact {
            expr.as_var().is_some_and(|v| v.id() == var)
        } else {
            expr.variables().contains(&var)
        }
    };
    commands.iter().any(|command| {
        let own = match command {
            Command::Play { pulse, .. } | Command::PlayReadout { pulse, .. } => matches(&pulse.length),
            Command::Wait { length, .. } => matches(length),
            _ => false,
        };
        own || command
            .bodies()
            .into_iter()
            .any(|body| uses_as_duration(body, var, exact))
    })
}
