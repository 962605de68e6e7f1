//! # Memory Parameter Stores
//!
//! Some pulse and recording parameters are not part of the trigger word but
//! live in memory-mapped registers of the signal generators and the recording
//! module. Before a command can use such a value it has to be written with a
//! `sw`. This pass inserts [`Command::MemoryStore`]s into the program so that
//! every command finds its parameter in place, while writing as little as
//! possible:
//!
//! - a store is placed directly before a command whose value differs from
//!   the last known value of the same (cell, parameter)
//! - a loop whose uses all agree on a value that the loop does not modify
//!   gets the store once in front of the loop
//! - after an If whose branches leave different values, the store needed by
//!   the next command is appended to every branch lacking it
//! - a parameter that only ever uses one constant is never stored; the value
//!   becomes part of the cell's initial configuration instead
//!
//! Commands without a value for an optional parameter (a pulse without
//! frequency) keep whatever was configured last, so stores are never moved
//! in front of them.

use crate::error::{Error, Result};
use crate::program::expr::{Expr, VarId};
use crate::program::{Cell, Command, Program};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// PARAMETERS
// =============================================================================

/// Word addresses of the memory-mapped parameters
pub mod address {
    pub const RECORDING_OFFSET: u32 = 0x8010 / 4;
    pub const MANIPULATION_FREQUENCY: u32 = 0x18014 / 4;
    pub const READOUT_FREQUENCY: u32 = 0x38100 / 4;
    pub const MANIPULATION_PHASE: u32 = 0x18030 / 4;
    pub const READOUT_PHASE: u32 = 0x38030 / 4;
    pub const MANIPULATION_AMPLITUDE: u32 = 0x18010 / 4;
    pub const READOUT_AMPLITUDE: u32 = 0x38010 / 4;
}

/// A memory-mapped parameter of a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Parameter {
    RecordingOffset,
    ManipulationFrequency,
    ReadoutFrequency,
    ManipulationPhase,
    ReadoutPhase,
    ManipulationAmplitude,
    ReadoutAmplitude,
}

impl Parameter {
    pub const ALL: [Parameter; 7] = [
        Parameter::RecordingOffset,
        Parameter::ManipulationFrequency,
        Parameter::ReadoutFrequency,
        Parameter::ManipulationPhase,
        Parameter::ReadoutPhase,
        Parameter::ManipulationAmplitude,
        Parameter::ReadoutAmplitude,
    ];

    pub fn address(&self) -> u32 {
        match self {
            Parameter::RecordingOffset => address::RECORDING_OFFSET,
            Parameter::ManipulationFrequency => address::MANIPULATION_FREQUENCY,
            Parameter::ReadoutFrequency => address::READOUT_FREQUENCY,
            Parameter::ManipulationPhase => address::MANIPULATION_PHASE,
            Parameter::ReadoutPhase => address::READOUT_PHASE,
            Parameter::ManipulationAmplitude => address::MANIPULATION_AMPLITUDE,
            Parameter::ReadoutAmplitude => address::READOUT_AMPLITUDE,
        }
    }

    pub fn from_address(address: u32) -> Option<Parameter> {
        Parameter::ALL.into_iter().find(|p| p.address() == address)
    }

    /// Amplitudes are written to both 16 bit halves of the word
    pub fn is_amplitude(&self) -> bool {
        matches!(
            self,
            Parameter::ManipulationAmplitude | Parameter::ReadoutAmplitude
        )
    }

    fn parallel_conflict(&self) -> String {
        let what = match self {
            Parameter::RecordingOffset => {
                return "Parallel Blocks with multiple Recording instructions with different offsets are not supported.".to_string()
            }
            Parameter::ManipulationFrequency => "manipulation frequencies",
            Parameter::ReadoutFrequency => "readout frequencies",
            Parameter::ManipulationPhase => "manipulation phases",
            Parameter::ReadoutPhase => "readout phases",
            Parameter::ManipulationAmplitude => "manipulation amplitudes",
            Parameter::ReadoutAmplitude => "readout amplitudes",
        };
        format!(
            "Parallel Blocks with multiple pulses with different {} are not supported.",
            what
        )
    }

    /// What `command` needs of this parameter on `cell`; `None` if it does
    /// not care at all
    fn required(&self, command: &Command, cell: Cell) -> Option<Use> {
        if command.cell() != Some(cell) {
            return None;
        }
        let optional = |value: &Option<Expr>| Some(value.clone().map_or(Use::Missing, Use::Value));
        match (self, command) {
            (Parameter::RecordingOffset, _) => command
                .recording()
                .map(|recording| Use::Value(recording.offset.clone())),
            (Parameter::ManipulationFrequency, Command::Play { pulse, .. }) => optional(&pulse.frequency),
            (Parameter::ManipulationPhase, Command::Play { pulse, .. }) => optional(&pulse.phase),
            (Parameter::ManipulationAmplitude, Command::Play { pulse, .. }) => optional(&pulse.amplitude),
            (Parameter::ReadoutFrequency, Command::PlayReadout { pulse, .. }) => optional(&pulse.frequency),
            (Parameter::ReadoutPhase, Command::PlayReadout { pulse, .. }) => optional(&pulse.phase),
            (Parameter::ReadoutAmplitude, Command::PlayReadout { pulse, .. }) => optional(&pulse.amplitude),
            _ => None,
        }
    }
}

/// Parameter values a cell starts with, in physical units
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InitialConfig {
    pub recording_offset: Option<f64>,
    pub manipulation_frequency: Option<f64>,
    pub readout_frequency: Option<f64>,
    pub manipulation_phase: Option<f64>,
    pub readout_phase: Option<f64>,
    pub manipulation_amplitude: Option<f64>,
    pub readout_amplitude: Option<f64>,
}

impl InitialConfig {
    fn slot(&mut self, parameter: Parameter) -> &mut Option<f64> {
        match parameter {
            Parameter::RecordingOffset => &mut self.recording_offset,
            Parameter::ManipulationFrequency => &mut self.manipulation_frequency,
            Parameter::ReadoutFrequency => &mut self.readout_frequency,
            Parameter::ManipulationPhase => &mut self.manipulation_phase,
            Parameter::ReadoutPhase => &mut self.readout_phase,
            Parameter::ManipulationAmplitude => &mut self.manipulation_amplitude,
            Parameter::ReadoutAmplitude => &mut self.readout_amplitude,
        }
    }

    pub fn get(&self, parameter: Parameter) -> Option<f64> {
        self.clone().slot(parameter).take()
    }

    pub fn is_empty(&self) -> bool {
        *self == InitialConfig::default()
    }
}

/// Outcome of [`insert_memory_stores`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreInsertion {
    /// Static values of parameters that never needed a store
    pub initial: BTreeMap<Cell, InitialConfig>,
    /// Number of inserted store commands
    pub stores: usize,
}

// =============================================================================
// PASS
// =============================================================================

/// Value a command needs
#[derive(Debug, Clone, PartialEq)]
enum Use {
    Value(Expr),
    /// Optional parameter left out: plays with the previous value
    Missing,
}

/// Value currently held by the parameter register
#[derive(Debug, Clone, PartialEq)]
enum Known {
    Unknown,
    Value(Expr),
}

impl Known {
    fn holds(&self, value: &Expr) -> bool {
        matches!(self, Known::Value(known) if known == value)
    }

    /// Forget the value if it reads any of `written`
    fn kill(self, written: &BTreeSet<VarId>) -> Known {
        match self {
            Known::Value(value) if !value.variables().is_disjoint(written) => Known::Unknown,
            known => known,
        }
    }
}

/// If whose branches ended with different values
struct Pending {
    index: usize,
    body_end: Known,
    else_end: Known,
}

/// Insert the stores needed by every cell and parameter of `program`
pub fn insert_memory_stores(program: &mut Program) -> Result<StoreInsertion> {
    let mut result = StoreInsertion::default();

    for cell in program.cells.clone() {
        for parameter in Parameter::ALL {
            let uses = collect_uses(&program.commands, parameter, cell);
            if !uses.iter().any(|u| matches!(u, Use::Value(_))) {
                continue;
            }

            if let Some(value) = constant_value(&uses)
                .filter(|_| !has_user_store(&program.commands, parameter, cell))
            {
                *result.initial.entry(cell).or_default().slot(parameter) = Some(value);
                continue;
            }

            let mut hoister = Hoister {
                cell,
                parameter,
                inserted: 0,
            };
            let mut entries: BTreeMap<usize, usize> = program
                .entry_points
                .values()
                .map(|&position| (position, position))
                .collect();
            hoister.walk(&mut program.commands, Known::Unknown, &mut entries)?;
            for position in program.entry_points.values_mut() {
                if let Some(&moved) = entries.get(position) {
                    *position = moved;
                }
            }

            tracing::debug!(
                cell = cell.index(),
                parameter = ?parameter,
                stores = hoister.inserted,
                "memory parameter stores inserted"
            );
            result.stores += hoister.inserted;
        }
    }
    Ok(result)
}

/// The single constant used for a parameter, if there is one
fn constant_value(uses: &[Use]) -> Option<f64> {
    let mut constant = None;
    for value in uses.iter().filter_map(|u| match u {
        Use::Value(value) => Some(value),
        Use::Missing => None,
    }) {
        let literal = value.as_const()?;
        match constant {
            None => constant = Some(literal),
            Some(seen) if seen == literal => {}
            Some(_) => return None,
        }
    }
    constant.map(|literal| literal.as_f64())
}

fn collect_uses(commands: &[Command], parameter: Parameter, cell: Cell) -> Vec<Use> {
    let mut uses = Vec::new();
    for command in commands {
        uses.extend(parameter.required(command, cell));
        for body in command.bodies() {
            uses.extend(collect_uses(body, parameter, cell));
        }
    }
    uses
}

fn is_store_to(command: &Command, parameter: Parameter, cell: Cell) -> bool {
    matches!(
        command,
        Command::MemoryStore { cell: c, address, .. } if *c == cell && *address == parameter.address()
    )
}

fn has_user_store(commands: &[Command], parameter: Parameter, cell: Cell) -> bool {
    commands.iter().any(|command| {
        is_store_to(command, parameter, cell)
            || command
                .bodies()
                .into_iter()
                .any(|body| has_user_store(body, parameter, cell))
    })
}

struct Hoister {
    cell: Cell,
    parameter: Parameter,
    inserted: usize,
}

impl Hoister {
    fn store(&mut self, value: Expr) -> Command {
        self.inserted += 1;
        Command::MemoryStore {
            cell: self.cell,
            address: self.parameter.address(),
            value,
        }
    }

    /// Walk one command list; `entries` maps original positions the program
    /// may be started at to their position after insertion
    fn walk(
        &mut self,
        commands: &mut Vec<Command>,
        mut known: Known,
        entries: &mut BTreeMap<usize, usize>,
    ) -> Result<Known> {
        let mut pending: Option<Pending> = None;
        let mut shift = 0;
        let mut i = 0;

        while i < commands.len() {
            if let Some(slot) = entries.get_mut(&(i - shift)) {
                *slot = i;
                known = Known::Unknown;
                pending = None;
            }

            if let Some(required) = self.parameter.required(&commands[i], self.cell) {
                if let Use::Value(value) = required {
                    if let Some(open) = pending.take() {
                        self.complete_if(&mut commands[open.index], open, &value);
                    } else if !known.holds(&value) {
                        let store = self.store(value.clone());
                        commands.insert(i, store);
                        i += 1;
                        shift += 1;
                    }
                    known = Known::Value(value);
                }
                let written = commands[i].written_vars();
                known = known.kill(&written);
                if !written.is_empty() {
                    pending = None;
                }
                i += 1;
                continue;
            }

            if commands[i].is_structured() {
                pending = None;
            }

            match &mut commands[i] {
                Command::If {
                    body, else_body, ..
                } => {
                    let body_end = self.walk(body, known.clone(), &mut BTreeMap::new())?;
                    let else_end = match else_body {
                        Some(else_body) => self.walk(else_body, known.clone(), &mut BTreeMap::new())?,
                        None => known.clone(),
                    };
                    if body_end == else_end {
                        known = body_end;
                    } else {
                        known = Known::Unknown;
                        pending = Some(Pending {
                            index: i,
                            body_end,
                            else_end,
                        });
                    }
                }
                command @ (Command::ForRange { .. } | Command::While { .. }) => {
                    let assigned = command.assigned_vars();
                    let mut uses = Vec::new();
                    let mut stored = false;
                    for body in command.bodies() {
                        uses.extend(collect_uses(body, self.parameter, self.cell));
                        stored |= has_user_store(body, self.parameter, self.cell);
                    }

                    if uses.is_empty() && !stored {
                        known = known.kill(&assigned);
                    } else if let Some(value) = loop_invariant(&uses, &assigned).filter(|_| !stored) {
                        let before = !known.holds(&value);
                        for body in command.bodies_mut() {
                            self.walk(body, Known::Value(value.clone()), &mut BTreeMap::new())?;
                        }
                        if before {
                            let store = self.store(value.clone());
                            commands.insert(i, store);
                            i += 1;
                            shift += 1;
                        }
                        known = Known::Value(value);
                    } else {
                        for body in command.bodies_mut() {
                            self.walk(body, Known::Unknown, &mut BTreeMap::new())?;
                        }
                        known = Known::Unknown;
                    }
                }
                Command::Parallel { branches, .. } => {
                    let mut uses = Vec::new();
                    for branch in branches.iter() {
                        uses.extend(collect_uses(branch, self.parameter, self.cell));
                    }
                    if let Some(first) = uses.first().cloned() {
                        if uses.iter().any(|u| *u != first) {
                            return Err(Error::structural(self.parameter.parallel_conflict()));
                        }
                        if let Use::Value(value) = first {
                            if !known.holds(&value) {
                                let store = self.store(value.clone());
                                commands.insert(i, store);
                                i += 1;
                                shift += 1;
                            }
                            known = Known::Value(value);
                        }
                    }
                }
                command @ Command::MemoryStore { .. } => {
                    if is_store_to(command, self.parameter, self.cell) {
                        if let Command::MemoryStore { value, .. } = command {
                            known = Known::Value(value.clone());
                        }
                    }
                }
                command => {
                    let written = command.written_vars();
                    known = known.kill(&written);
                    if !written.is_empty() {
                        pending = None;
                    }
                }
            }
            i += 1;
        }

        if let Some(slot) = entries.get_mut(&(i - shift)) {
            *slot = i;
        }
        Ok(known)
    }

    /// Append the store for `value` to every branch of the If that ends
    /// with a different value
    fn complete_if(&mut self, command: &mut Command, open: Pending, value: &Expr) {
        let Command::If {
            body, else_body, ..
        } = command
        else {
            return;
        };
        if !open.body_end.holds(value) {
            body.push(self.store(value.clone()));
        }
        if !open.else_end.holds(value) {
            let store = self.store(value.clone());
            else_body.get_or_insert_with(Vec::new).push(store);
        }
    }
}

/// The value every use inside a loop agrees on, if the loop leaves it alone
fn loop_invariant(uses: &[Use], assigned: &BTreeSet<VarId>) -> Option<Expr> {
    let mut agreed: Option<&Expr> = None;
    for u in uses {
        let Use::Value(value) = u else {
            return None;
        };
        match agreed {
            None => agreed = Some(value),
            Some(seen) if seen == value => {}
            Some(_) => return None,
        }
    }
    agreed
        .filter(|value| value.variables().is_disjoint(assigned))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{ProgramBuilder, Pulse};

    fn stores(commands: &[Command]) -> usize {
        commands
            .iter()
            .map(|c| {
                let own = usize::from(matches!(c, Command::MemoryStore { .. }));
                own + c.bodies().into_iter().map(|b| stores(b)).sum::<usize>()
            })
            .sum()
    }

    #[test]
    fn test_single_constant_becomes_initial_config() {
        let _serial = crate::program::builder::serial();
        let mut p = ProgramBuilder::new("const").unwrap();
        let q = p.cell();
        p.play(q, &Pulse::new(20e-9).frequency(60e6));
        p.play(q, &Pulse::new(20e-9).frequency(60e6));
        let mut program = p.finish().unwrap();

        let result = insert_memory_stores(&mut program).unwrap();
        assert_eq!(result.stores, 0);
        assert_eq!(result.initial[&q].manipulation_frequency, Some(60e6));
        assert_eq!(stores(&program.commands), 0);
    }

    #[test]
    fn test_same_runtime_value_is_stored_once() {
        let _serial = crate::program::builder::serial();
        let mut p = ProgramBuilder::new("var").unwrap();
        let q = p.cell();
        let f = p.freq_var("f", Some(60e6));
        p.play(q, &Pulse::new(20e-9).frequency(&f));
        p.play(q, &Pulse::new(20e-9).frequency(&f));
        let mut program = p.finish().unwrap();

        let result = insert_memory_stores(&mut program).unwrap();
        assert_eq!(result.stores, 1);
        assert!(matches!(
            &program.commands[1],
            Command::MemoryStore { address, .. } if *address == address::MANIPULATION_FREQUENCY
        ));
    }

    #[test]
    fn test_invariant_store_is_hoisted_above_loop() {
        let _serial = crate::program::builder::serial();
        let mut p = ProgramBuilder::new("hoist").unwrap();
        let q = p.cell();
        let f = p.freq_var("f", Some(60e6));
        let i = p.int_var("i", None);
        {
            let mut body = p.for_range(&i, 0, 10, 1).unwrap();
            body.play(q, &Pulse::new(20e-9).frequency(&f));
        }
        let mut program = p.finish().unwrap();

        insert_memory_stores(&mut program).unwrap();
        assert!(matches!(program.commands[1], Command::MemoryStore { .. }));
        let Command::ForRange { body, .. } = &program.commands[2] else {
            panic!("expected loop");
        };
        assert_eq!(stores(body), 0);
    }

    #[test]
    fn test_value_assigned_in_loop_is_stored_inside() {
        let _serial = crate::program::builder::serial();
        let mut p = ProgramBuilder::new("inside").unwrap();
        let q = p.cell();
        let f = p.freq_var("f", Some(60e6));
        let i = p.int_var("i", None);
        {
            let mut body = p.for_range(&i, 0, 10, 1).unwrap();
            body.play(q, &Pulse::new(20e-9).frequency(&f));
            body.assign(&f, &f + 1e6);
        }
        let mut program = p.finish().unwrap();

        insert_memory_stores(&mut program).unwrap();
        let Command::ForRange { body, .. } = &program.commands[1] else {
            panic!("expected loop, got {:?}", program.commands[1]);
        };
        assert!(matches!(body[0], Command::MemoryStore { .. }));
        assert_eq!(stores(&program.commands), 1);
    }

    #[test]
    fn test_missing_value_keeps_previous_one() {
        let _serial = crate::program::builder::serial();
        let mut p = ProgramBuilder::new("missing").unwrap();
        let q = p.cell();
        let f = p.freq_var("f", None);
        let g = p.freq_var("g", None);
        p.play(q, &Pulse::new(20e-9).frequency(&f));
        p.play(q, &Pulse::new(20e-9));
        p.play(q, &Pulse::new(20e-9).frequency(&g));
        let mut program = p.finish().unwrap();

        insert_memory_stores(&mut program).unwrap();
        let names: Vec<_> = program.commands.iter().map(Command::name).collect();
        assert_eq!(
            names,
            vec!["MemoryStore", "Play", "Play", "MemoryStore", "Play"]
        );
    }

    #[test]
    fn test_store_after_if_is_duplicated_into_branches() {
        let _serial = crate::program::builder::serial();
        let mut p = ProgramBuilder::new("branches").unwrap();
        let q = p.cell();
        let f = p.freq_var("f", None);
        let g = p.freq_var("g", None);
        let x = p.int_var("x", Some(0));
        {
            let mut then = p.if_(x.expr().equals(1)).unwrap();
            then.play(q, &Pulse::new(20e-9).frequency(&g));
        }
        p.play(q, &Pulse::new(20e-9).frequency(&f));
        let mut program = p.finish().unwrap();

        insert_memory_stores(&mut program).unwrap();
        let Command::If {
            body, else_body, ..
        } = &program.commands[1]
        else {
            panic!("expected if");
        };
        assert!(matches!(body.last(), Some(Command::MemoryStore { .. })));
        assert_eq!(else_body.as_ref().map(Vec::len), Some(1));
        assert!(matches!(program.commands[2], Command::Play { .. }));
    }

    #[test]
    fn test_entry_points_include_their_stores() {
        let _serial = crate::program::builder::serial();
        let mut p = ProgramBuilder::new("entry").unwrap();
        let q = p.cell();
        let f = p.freq_var("f", None);
        p.play(q, &Pulse::new(20e-9).frequency(&f));
        p.entry_point("again").unwrap();
        p.play(q, &Pulse::new(20e-9).frequency(&f));
        let mut program = p.finish().unwrap();

        insert_memory_stores(&mut program).unwrap();
        // the second play needs its own store when started directly
        assert_eq!(program.entry_points["again"], 2);
        assert!(matches!(program.commands[2], Command::MemoryStore { .. }));
        assert_eq!(stores(&program.commands), 2);
    }

    #[test]
    fn test_parallel_pulses_must_agree_on_parameters() {
        let _serial = crate::program::builder::serial();

        let mut p = ProgramBuilder::new("missing").unwrap();
        let q = p.cell();
        {
            let mut branch = p.parallel().unwrap();
            branch.play(q, &Pulse::new(20e-9).frequency(60e6));
        }
        {
            let mut branch = p.parallel().unwrap();
            branch.wait(q, 40e-9);
            branch.play(q, &Pulse::new(20e-9));
        }
        let mut program = p.finish().unwrap();
        assert_eq!(
            insert_memory_stores(&mut program).unwrap_err(),
            Error::structural(
                "Parallel Blocks with multiple pulses with different manipulation frequencies are not supported."
            )
        );

        // a branch without any manipulation pulse is no use
        let mut p = ProgramBuilder::new("readout").unwrap();
        let q = p.cell();
        {
            let mut branch = p.parallel().unwrap();
            branch.play(q, &Pulse::new(20e-9).frequency(60e6));
        }
        {
            let mut branch = p.parallel().unwrap();
            branch.play_readout(q, &Pulse::new(40e-9));
        }
        let mut program = p.finish().unwrap();
        assert!(insert_memory_stores(&mut program).is_ok());
    }

    #[test]
    fn test_parameter_addresses() {
        assert_eq!(Parameter::RecordingOffset.address(), 0x2004);
        assert_eq!(
            Parameter::from_address(0x38010 / 4),
            Some(Parameter::ReadoutAmplitude)
        );
        assert!(Parameter::ReadoutAmplitude.is_amplitude());
    }
}
