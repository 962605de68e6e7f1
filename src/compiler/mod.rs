//! # Compiler - Command Trees to Sequencer Code
//!
//! Turns a [`Program`] built with the [`ProgramBuilder`](crate::ProgramBuilder)
//! into one 32-bit instruction stream per cell.
//!
//! ## Architecture
//!
//! ```text
//! Program → Relevance → Type Inference → Property Resolution
//!         → Memory Stores → Code Generation → Encoding → CompiledProgram
//! ```
//!
//! Relevance and inference only depend on the program, so a
//! [`PreparedProgram`] can be compiled against several parameter tables.
//!
//! ## Usage
//!
//! ```ignore
//! use qicode::compiler::{CompileOptions, Compiler};
//! use qicode::ParameterTable;
//!
//! let compiler = Compiler::new(CompileOptions::default());
//! let compiled = compiler.compile(&program, &ParameterTable::new())?;
//! println!("{}", compiled.listing());
//! ```

pub mod codegen;
pub mod instruction;
pub mod mem_params;
pub mod relevance;
pub mod resolve;
pub mod sequencer;

pub use codegen::{CodeGenerator, GeneratedCell, GeneratedCode, STATIC_DATA_BASE};
pub use instruction::{AluOp, BranchCond, Instruction, Reg};
pub use mem_params::{insert_memory_stores, InitialConfig, Parameter, StoreInsertion};
pub use relevance::Relevance;
pub use resolve::resolve_properties;
pub use sequencer::{Sequencer, SequencerOutput, SyncPointKind};

use crate::error::{Error, Result};
use crate::program::{Cell, ParameterTable, Program, PulseShape};
use crate::types::{TypeInference, TypeTable};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Compilation options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Leave out the NCO sync trigger at the start of every cell
    pub skip_nco_sync: bool,
    /// Wait after the NCO sync trigger, in seconds
    pub nco_sync_length: f64,
    /// Hardware index of every logical cell; missing entries map to themselves
    pub cell_map: Vec<usize>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            skip_nco_sync: false,
            nco_sync_length: 0.0,
            cell_map: Vec::new(),
        }
    }
}

impl CompileOptions {
    /// Parse options from JSON; absent fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::structural(format!("Invalid compile options: {}", e)))
    }

    pub fn hw_cell(&self, cell: Cell) -> usize {
        self.cell_map
            .get(cell.index())
            .copied()
            .unwrap_or(cell.index())
    }
}

/// Program with relevance and types attached, ready to be compiled
#[derive(Debug, Clone)]
pub struct PreparedProgram {
    pub program: Program,
    pub relevance: Relevance,
    pub types: TypeTable,
}

/// Output of one cell
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellProgram {
    pub cell: Cell,
    pub hw_cell: usize,
    /// Encoded instruction words
    pub words: Vec<u32>,
    /// Assembly of every word, for diagnostics
    pub mnemonics: Vec<String>,
    /// Initial content of the static data region at word 0x8400
    pub static_data: Vec<i64>,
    /// Pulse shapes by trigger index minus one
    pub pulses: Vec<PulseShape>,
    pub readout_pulses: Vec<PulseShape>,
    /// Digital outputs of every trigger set
    pub trigger_sets: Vec<Vec<u8>>,
    /// Parameter values to configure before the start
    pub initial: InitialConfig,
    /// Instruction offset of every entry point
    pub entry_points: BTreeMap<String, usize>,
}

/// Result of a successful compilation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledProgram {
    pub name: String,
    pub cells: Vec<CellProgram>,
}

/// Receives compiled code, usually a hardware driver
///
/// Implementations report their own failures as [`Error::Loader`].
pub trait Loader {
    fn load_instructions(&mut self, cell: Cell, words: &[u32]) -> Result<()>;

    fn start_at(&mut self, cell: Cell, offset: usize) -> Result<()>;
}

impl CompiledProgram {
    pub fn cell(&self, cell: Cell) -> Option<&CellProgram> {
        self.cells.iter().find(|c| c.cell == cell)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::structural(format!("Serialization failed: {}", e)))
    }

    /// Address, word and mnemonic of every instruction
    pub fn listing(&self) -> String {
        let mut out = String::new();
        for cell in &self.cells {
            out.push_str(&format!("; {} (hardware cell {})\n", cell.cell, cell.hw_cell));
            for (pc, (word, mnemonic)) in cell.words.iter().zip(&cell.mnemonics).enumerate() {
                out.push_str(&format!(
                    "{:4}: {}  {}\n",
                    pc,
                    hex::encode(word.to_be_bytes()),
                    mnemonic
                ));
            }
        }
        out
    }

    /// Load every cell and set its start offset
    ///
    /// Without an entry point every cell starts at offset 0.
    pub fn upload(&self, loader: &mut dyn Loader, entry: Option<&str>) -> Result<()> {
        let mut offsets = Vec::new();
        for cell in &self.cells {
            let offset = match entry {
                Some(name) => *cell
                    .entry_points
                    .get(name)
                    .ok_or_else(|| Error::UnknownEntryPoint(name.to_string()))?,
                None => 0,
            };
            offsets.push((cell.cell, offset));
        }

        for cell in &self.cells {
            loader.load_instructions(cell.cell, &cell.words)?;
        }
        for (cell, offset) in offsets {
            loader.start_at(cell, offset)?;
        }
        tracing::debug!(program = %self.name, entry = ?entry, cells = self.cells.len(), "program uploaded");
        Ok(())
    }
}

/// Command tree to sequencer code compiler
pub struct Compiler {
    options: CompileOptions,
}

impl Compiler {
    pub fn new(options: CompileOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Run the program dependent analyses
    pub fn prepare(&self, program: &Program) -> Result<PreparedProgram> {
        let mut program = program.clone();

        // Phase 1: Relevance
        let relevance = Relevance::analyze(&mut program);

        // Phase 2: Type inference
        let types = TypeInference::infer(&program)?;
        tracing::debug!(
            program = %program.name,
            commands = program.command_count(),
            "program prepared"
        );

        Ok(PreparedProgram {
            program,
            relevance,
            types,
        })
    }

    /// Compile a prepared program against a parameter table
    pub fn compile_prepared(
        &self,
        prepared: &PreparedProgram,
        table: &ParameterTable,
    ) -> Result<CompiledProgram> {
        let mut program = prepared.program.clone();

        // Phase 3: Property resolution
        resolve_properties(&mut program, &prepared.types, table)?;

        // Phase 4: Memory parameter stores
        let insertion = insert_memory_stores(&mut program)?;
        tracing::debug!(stores = insertion.stores, "memory stores inserted");

        // Phase 5: Code generation
        let generated = CodeGenerator::new(
            &program,
            &prepared.types,
            &prepared.relevance,
            &self.options,
        )?
        .generate()?;

        // Phase 6: Encoding
        let mut cells = Vec::new();
        for generated_cell in generated.cells {
            let GeneratedCell {
                cell,
                hw_cell,
                output,
                static_data,
            } = generated_cell;
            let words = output
                .instructions
                .iter()
                .map(Instruction::encode)
                .collect::<Result<Vec<_>>>()?;
            let mnemonics = output.instructions.iter().map(|i| i.to_string()).collect();
            let entry_points = generated
                .entry_points
                .iter()
                .filter_map(|(name, offsets)| Some((name.clone(), *offsets.get(&cell)?)))
                .collect();
            tracing::debug!(cell = cell.index(), words = words.len(), "cell encoded");
            cells.push(CellProgram {
                cell,
                hw_cell,
                words,
                mnemonics,
                static_data,
                pulses: output.pulses,
                readout_pulses: output.readout_pulses,
                trigger_sets: output.trigger_sets,
                initial: insertion.initial.get(&cell).cloned().unwrap_or_default(),
                entry_points,
            });
        }

        Ok(CompiledProgram {
            name: program.name.clone(),
            cells,
        })
    }

    /// Compile a program against a parameter table
    pub fn compile(&self, program: &Program, table: &ParameterTable) -> Result<CompiledProgram> {
        let prepared = self.prepare(program)?;
        self.compile_prepared(&prepared, table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{ProgramBuilder, Pulse};

    #[derive(Default)]
    struct RecordingLoader {
        loaded: Vec<(Cell, usize)>,
        started: Vec<(Cell, usize)>,
    }

    impl Loader for RecordingLoader {
        fn load_instructions(&mut self, cell: Cell, words: &[u32]) -> Result<()> {
            self.loaded.push((cell, words.len()));
            Ok(())
        }

        fn start_at(&mut self, cell: Cell, offset: usize) -> Result<()> {
            self.started.push((cell, offset));
            Ok(())
        }
    }

    /// Accepts the instructions but refuses to start
    struct OfflineLoader;

    impl Loader for OfflineLoader {
        fn load_instructions(&mut self, _cell: Cell, _words: &[u32]) -> Result<()> {
            Ok(())
        }

        fn start_at(&mut self, cell: Cell, _offset: usize) -> Result<()> {
            Err(Error::loader(format!("cell {} is offline", cell)))
        }
    }

    fn two_part_program() -> Program {
        let mut p = ProgramBuilder::new("parts").unwrap();
        let q = p.cell();
        p.play(q, &Pulse::new(20e-9).frequency(60e6));
        p.entry_point("second").unwrap();
        p.wait(q, 100e-9);
        p.finish().unwrap()
    }

    #[test]
    fn test_options_from_json() {
        let options = CompileOptions::from_json(r#"{"skip_nco_sync": true, "cell_map": [3]}"#).unwrap();
        assert!(options.skip_nco_sync);
        assert_eq!(options.nco_sync_length, 0.0);
        assert_eq!(options.hw_cell(Cell::new(0)), 3);
        assert_eq!(options.hw_cell(Cell::new(1)), 1);
        assert!(CompileOptions::from_json("[1, 2]").is_err());
    }

    #[test]
    fn test_compile_and_upload() {
        let _serial = crate::program::builder::serial();
        let compiled = Compiler::new(CompileOptions::default())
            .compile(&two_part_program(), &ParameterTable::new())
            .unwrap();
        let cell = &compiled.cells[0];
        assert_eq!(cell.words.len(), cell.mnemonics.len());
        assert_eq!(cell.mnemonics.last().map(String::as_str), Some("end"));
        assert_eq!(cell.initial.manipulation_frequency, Some(60e6));

        let second = cell.entry_points["second"];
        assert!(second > 0);

        let mut loader = RecordingLoader::default();
        compiled.upload(&mut loader, Some("second")).unwrap();
        assert_eq!(loader.loaded, vec![(Cell::new(0), cell.words.len())]);
        assert_eq!(loader.started, vec![(Cell::new(0), second)]);

        let mut loader = RecordingLoader::default();
        let err = compiled.upload(&mut loader, Some("third")).unwrap_err();
        assert_eq!(err, Error::UnknownEntryPoint("third".to_string()));
        assert!(loader.loaded.is_empty());

        let err = compiled.upload(&mut OfflineLoader, None).unwrap_err();
        assert_eq!(err, Error::Loader("cell q0 is offline".to_string()));
        assert_eq!(err.classify(), crate::error::ErrorSeverity::Recoverable);
    }

    #[test]
    fn test_listing_and_json() {
        let _serial = crate::program::builder::serial();
        let compiled = Compiler::new(CompileOptions::default())
            .compile(&two_part_program(), &ParameterTable::new())
            .unwrap();
        let listing = compiled.listing();
        assert!(listing.starts_with("; q0 (hardware cell 0)"));
        assert!(listing.contains("end"));

        let json: serde_json::Value = serde_json::from_str(&compiled.to_json().unwrap()).unwrap();
        assert_eq!(json["name"], "parts");
        assert!(json["cells"][0]["words"].is_array());
    }
}
