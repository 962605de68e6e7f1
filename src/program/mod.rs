//! # Program Model
//!
//! Programs are trees of [`Command`]s addressed to [`Cell`]s, built with the
//! [`ProgramBuilder`]:
//!
//! ```ignore
//! use qicode::{ProgramBuilder, Pulse, Recording};
//!
//! let mut p = ProgramBuilder::new("rabi")?;
//! let q = p.cell();
//! let t = p.time_var("t", None);
//! {
//!     let mut body = p.for_range(&t, 0.0, 100e-9, 4e-9)?;
//!     body.play(q, &Pulse::new(&t).frequency(60e6));
//!     body.play_readout(q, &Pulse::new(400e-9).frequency(30e6));
//!     body.record(q, Recording::new(400e-9).save_to("result"));
//! }
//! let program = p.finish()?;
//! ```

pub mod builder;
pub mod command;
pub mod expr;
pub mod pulse;
pub mod sample;
pub mod units;

pub use builder::{ProgramBuilder, Scope};
pub use command::{CellSet, Command, Recording};
pub use expr::{BinOp, CellProperty, CmpOp, Expr, ExprId, ExprKind, Literal, Var, VarId};
pub use pulse::{Envelope, Pulse, PulseShape};
pub use sample::ParameterTable;

use crate::types::Type;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A logical channel with its own instruction stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cell(usize);

impl Cell {
    pub fn new(index: usize) -> Self {
        Cell(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }

    /// Deferred lookup of a parameter of this cell
    pub fn property(&self, name: impl Into<String>) -> Expr {
        Expr::property(*self, name)
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// Initial value of a variable
#[derive(Debug, Clone, PartialEq)]
pub enum InitValue {
    Scalar(Literal),
    Array(Vec<Literal>),
}

/// Declaration of a program variable
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub var: Var,
    /// Type given at declaration
    pub declared: Option<Type>,
    pub init: Option<InitValue>,
}

impl Variable {
    pub fn is_array(&self) -> bool {
        matches!(self.init, Some(InitValue::Array(_))) || matches!(self.declared, Some(Type::Array(..)))
    }

    /// Literal elements of an array variable
    pub fn elements(&self) -> Option<&[Literal]> {
        match &self.init {
            Some(InitValue::Array(values)) => Some(values),
            _ => None,
        }
    }
}

/// A complete program as produced by the builder
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub name: String,
    pub cells: Vec<Cell>,
    pub variables: Vec<Variable>,
    pub commands: Vec<Command>,
    /// Named entry points; positions index into `commands`
    pub entry_points: BTreeMap<String, usize>,
}

impl Program {
    pub fn variable(&self, id: VarId) -> Option<&Variable> {
        self.variables.iter().find(|v| v.var.id() == id)
    }

    /// Number of commands including every nested body
    pub fn command_count(&self) -> usize {
        fn count(commands: &[Command]) -> usize {
            commands
                .iter()
                .map(|c| 1 + c.bodies().into_iter().map(|b| count(b)).sum::<usize>())
                .sum()
        }
        count(&self.commands)
    }
}
