//! # qicode - Pulse Sequencer Compiler
//!
//! Compiles experiment descriptions for qubit control cells into the 32-bit
//! instruction streams executed by their sequencers.
//!
//! ## Features
//!
//! - **Builder API** - cells, typed variables, pulses and structured control
//!   flow with scope guards
//! - **Type inference** - physical units (time, frequency, phase, amplitude,
//!   state) are inferred from how values are used, with the full causal chain
//!   on conflicts
//! - **Deferred properties** - cell calibration values are looked up late, so
//!   one prepared program compiles against many parameter tables
//! - **Parameter hoisting** - frequency, phase, amplitude and recording offset
//!   stores are only emitted where the value actually changes
//! - **Multi-cell timing** - cells are synchronized by padding waits when the
//!   timing is static and by `sync` words otherwise
//!
//! ## Quick Start
//!
//! ```rust
//! use qicode::{CompileOptions, Compiler, ParameterTable, ProgramBuilder, Pulse, Recording};
//!
//! # fn main() -> qicode::Result<()> {
//! let mut p = ProgramBuilder::new("readout")?;
//! let q = p.cell();
//! p.play(q, &Pulse::new(20e-9).frequency(60e6));
//! p.play_readout(q, &Pulse::new(400e-9).frequency(30e6));
//! p.record(q, Recording::new(400e-9).save_to("result"));
//! let program = p.finish()?;
//!
//! let compiled = Compiler::new(CompileOptions::default()).compile(&program, &ParameterTable::new())?;
//! assert_eq!(compiled.cells.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`program`] - command tree, expressions and the builder
//! - [`types`] - unit inference
//! - [`compiler`] - analyses, code generation and encoding
//! - [`error`] - the error type shared by every phase

/// Version of the compiler
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod compiler;
pub mod error;
pub mod program;
pub mod types;

// Re-export main types
pub use compiler::{CellProgram, CompileOptions, CompiledProgram, Compiler, Loader, PreparedProgram};
pub use error::{Error, Result};
pub use program::{
    Cell, Command, Envelope, Expr, Literal, ParameterTable, Program, ProgramBuilder, Pulse,
    Recording, Var,
};
pub use types::{Type, TypeInference, TypeTable};
