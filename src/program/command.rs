//! The command tree

use super::expr::{Expr, Var, VarId};
use super::pulse::Pulse;
use super::Cell;
use std::collections::BTreeSet;

/// Set of cells a command touches
pub type CellSet = BTreeSet<Cell>;

/// Signal recording on a cell
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    pub length: Expr,
    pub offset: Expr,
    /// Name of the result container receiving the recorded value
    pub save_to: Option<String>,
    /// Variable receiving the measured state
    pub state_to: Option<Var>,
    /// Toggle continuous recording instead of a single shot
    pub continuous: bool,
}

impl Recording {
    pub fn new(length: impl Into<Expr>) -> Self {
        Self {
            length: length.into(),
            offset: Expr::constant(0),
            save_to: None,
            state_to: None,
            continuous: false,
        }
    }

    pub fn offset(mut self, offset: impl Into<Expr>) -> Self {
        self.offset = offset.into();
        self
    }

    pub fn save_to(mut self, name: impl Into<String>) -> Self {
        self.save_to = Some(name.into());
        self
    }

    pub fn state_to(mut self, var: &Var) -> Self {
        self.state_to = Some(var.clone());
        self
    }

    pub fn continuous(mut self) -> Self {
        self.continuous = true;
        self
    }
}

/// One node of the command tree
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Manipulation pulse
    Play { cell: Cell, pulse: Pulse },
    /// Readout pulse, optionally with the recording it triggers
    PlayReadout {
        cell: Cell,
        pulse: Pulse,
        recording: Option<Recording>,
    },
    Record { cell: Cell, recording: Recording },
    Wait { cell: Cell, length: Expr },
    /// Pulse on the digital trigger outputs of a cell
    DigitalTrigger {
        cell: Cell,
        length: Expr,
        outputs: Vec<u8>,
    },
    Assign {
        var: Var,
        value: Expr,
        cells: CellSet,
    },
    If {
        condition: Expr,
        body: Vec<Command>,
        else_body: Option<Vec<Command>>,
        cells: CellSet,
    },
    /// Counted loop; `end` is exclusive
    ForRange {
        var: Var,
        start: Expr,
        end: Expr,
        step: Expr,
        body: Vec<Command>,
        cells: CellSet,
    },
    While {
        condition: Expr,
        body: Vec<Command>,
        cells: CellSet,
    },
    /// Branches that run simultaneously
    Parallel {
        branches: Vec<Vec<Command>>,
        cells: CellSet,
    },
    /// Synchronize cells; an empty set means every cell of the program
    Sync { cells: CellSet },
    /// Write a value to a word address of a cell's memory-mapped parameters
    MemoryStore { cell: Cell, address: u32, value: Expr },
}

impl Command {
    /// Cell of a single-cell command
    pub fn cell(&self) -> Option<Cell> {
        match self {
            Command::Play { cell, .. }
            | Command::PlayReadout { cell, .. }
            | Command::Record { cell, .. }
            | Command::Wait { cell, .. }
            | Command::DigitalTrigger { cell, .. }
            | Command::MemoryStore { cell, .. } => Some(*cell),
            _ => None,
        }
    }

    /// Cells the command is relevant for
    pub fn cells(&self) -> CellSet {
        if let Some(cell) = self.cell() {
            return CellSet::from([cell]);
        }
        match self {
            Command::Assign { cells, .. }
            | Command::If { cells, .. }
            | Command::ForRange { cells, .. }
            | Command::While { cells, .. }
            | Command::Parallel { cells, .. }
            | Command::Sync { cells } => cells.clone(),
            _ => CellSet::new(),
        }
    }

    pub(crate) fn cells_mut(&mut self) -> Option<&mut CellSet> {
        match self {
            Command::Assign { cells, .. }
            | Command::If { cells, .. }
            | Command::ForRange { cells, .. }
            | Command::While { cells, .. }
            | Command::Parallel { cells, .. } => Some(cells),
            _ => None,
        }
    }

    pub fn is_structured(&self) -> bool {
        matches!(
            self,
            Command::If { .. }
                | Command::ForRange { .. }
                | Command::While { .. }
                | Command::Parallel { .. }
        )
    }

    /// Nested command lists in program order
    pub fn bodies(&self) -> Vec<&Vec<Command>> {
        match self {
            Command::If {
                body, else_body, ..
            } => {
                let mut bodies = vec![body];
                if let Some(else_body) = else_body {
                    bodies.push(else_body);
                }
                bodies
            }
            Command::ForRange { body, .. } | Command::While { body, .. } => vec![body],
            Command::Parallel { branches, .. } => branches.iter().collect(),
            _ => Vec::new(),
        }
    }

    pub fn bodies_mut(&mut self) -> Vec<&mut Vec<Command>> {
        match self {
            Command::If {
                body, else_body, ..
            } => {
                let mut bodies = vec![body];
                if let Some(else_body) = else_body {
                    bodies.push(else_body);
                }
                bodies
            }
            Command::ForRange { body, .. } | Command::While { body, .. } => vec![body],
            Command::Parallel { branches, .. } => branches.iter_mut().collect(),
            _ => Vec::new(),
        }
    }

    /// Expressions read by the command itself, excluding nested bodies
    pub fn expressions(&self) -> Vec<&Expr> {
        fn pulse_exprs(pulse: &Pulse) -> Vec<&Expr> {
            let mut exprs = vec![&pulse.length];
            exprs.extend(pulse.frequency.iter());
            exprs.extend(pulse.phase.iter());
            exprs.extend(pulse.amplitude.iter());
            exprs
        }

        match self {
            Command::Play { pulse, .. } => pulse_exprs(pulse),
            Command::PlayReadout {
                pulse, recording, ..
            } => {
                let mut exprs = pulse_exprs(pulse);
                if let Some(recording) = recording {
                    exprs.push(&recording.length);
                    exprs.push(&recording.offset);
                }
                exprs
            }
            Command::Record { recording, .. } => vec![&recording.length, &recording.offset],
            Command::Wait { length, .. } | Command::DigitalTrigger { length, .. } => vec![length],
            Command::Assign { value, .. } => vec![value],
            Command::If { condition, .. } | Command::While { condition, .. } => vec![condition],
            Command::ForRange {
                start, end, step, ..
            } => vec![start, end, step],
            Command::MemoryStore { value, .. } => vec![value],
            Command::Parallel { .. } | Command::Sync { .. } => Vec::new(),
        }
    }

    pub(crate) fn expressions_mut(&mut self) -> Vec<&mut Expr> {
        fn pulse_exprs(pulse: &mut Pulse) -> Vec<&mut Expr> {
            let mut exprs = vec![&mut pulse.length];
            exprs.extend(pulse.frequency.iter_mut());
            exprs.extend(pulse.phase.iter_mut());
            exprs.extend(pulse.amplitude.iter_mut());
            exprs
        }

        match self {
            Command::Play { pulse, .. } => pulse_exprs(pulse),
            Command::PlayReadout {
                pulse, recording, ..
            } => {
                let mut exprs = pulse_exprs(pulse);
                if let Some(recording) = recording {
                    exprs.push(&mut recording.length);
                    exprs.push(&mut recording.offset);
                }
                exprs
            }
            Command::Record { recording, .. } => {
                vec![&mut recording.length, &mut recording.offset]
            }
            Command::Wait { length, .. } | Command::DigitalTrigger { length, .. } => vec![length],
            Command::Assign { value, .. } => vec![value],
            Command::If { condition, .. } | Command::While { condition, .. } => vec![condition],
            Command::ForRange {
                start, end, step, ..
            } => vec![start, end, step],
            Command::MemoryStore { value, .. } => vec![value],
            Command::Parallel { .. } | Command::Sync { .. } => Vec::new(),
        }
    }

    /// Variables read by the command itself, excluding nested bodies
    pub fn read_vars(&self) -> BTreeSet<VarId> {
        self.expressions()
            .into_iter()
            .flat_map(|expr| expr.variables())
            .collect()
    }

    /// Variables written by the command itself, excluding nested bodies
    pub fn written_vars(&self) -> BTreeSet<VarId> {
        let mut vars = BTreeSet::new();
        match self {
            Command::Assign { var, .. } | Command::ForRange { var, .. } => {
                vars.insert(var.id());
            }
            Command::Record { recording, .. }
            | Command::PlayReadout {
                recording: Some(recording),
                ..
            } => {
                if let Some(var) = &recording.state_to {
                    vars.insert(var.id());
                }
            }
            _ => {}
        }
        vars
    }

    /// Variables written anywhere inside the command, including nested bodies
    pub fn assigned_vars(&self) -> BTreeSet<VarId> {
        let mut vars = self.written_vars();
        for body in self.bodies() {
            for command in body {
                vars.extend(command.assigned_vars());
            }
        }
        vars
    }

    /// Loop variables of this command and of every loop nested in it
    pub fn loop_vars(&self) -> BTreeSet<VarId> {
        let mut vars = BTreeSet::new();
        if let Command::ForRange { var, .. } = self {
            vars.insert(var.id());
        }
        for body in self.bodies() {
            for command in body {
                vars.extend(command.loop_vars());
            }
        }
        vars
    }

    /// The recording carried by the command, if any
    pub fn recording(&self) -> Option<&Recording> {
        match self {
            Command::Record { recording, .. }
            | Command::PlayReadout {
                recording: Some(recording),
                ..
            } => Some(recording),
            _ => None,
        }
    }

    /// Short name used in diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            Command::Play { .. } => "Play",
            Command::PlayReadout { .. } => "PlayReadout",
            Command::Record { .. } => "Recording",
            Command::Wait { .. } => "Wait",
            Command::DigitalTrigger { .. } => "DigitalTrigger",
            Command::Assign { .. } => "Assign",
            Command::If { .. } => "If",
            Command::ForRange { .. } => "ForRange",
            Command::While { .. } => "While",
            Command::Parallel { .. } => "Parallel",
            Command::Sync { .. } => "Sync",
            Command::MemoryStore { .. } => "MemoryStore",
        }
    }
}
