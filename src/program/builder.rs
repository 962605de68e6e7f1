//! Program construction with scope guards
//!
//! A [`ProgramBuilder`] collects commands into the innermost open scope.
//! Structured commands open a scope that is returned as a [`Scope`] guard;
//! the guard dereferences to the builder, and dropping it (or calling
//! [`Scope::end`]) attaches the collected body to the enclosing command list.
//!
//! Only one builder can be open in the process at a time.

use super::command::{CellSet, Command, Recording};
use super::expr::{Expr, Literal, Var, VarId};
use super::pulse::{Envelope, Pulse};
use super::{Cell, InitValue, Program, Variable};
use crate::error::{Error, Result};
use crate::types::{Shape, Type};
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

/// Set while a [`ProgramBuilder`] exists anywhere in the process
static PROGRAM_OPEN: AtomicBool = AtomicBool::new(false);

#[derive(Debug)]
enum FrameKind {
    Root,
    If(Expr),
    Else,
    ForRange {
        var: Var,
        start: Expr,
        end: Expr,
        step: Expr,
    },
    While(Expr),
    Parallel,
}

#[derive(Debug)]
struct Frame {
    kind: FrameKind,
    commands: Vec<Command>,
}

/// Builds one [`Program`]
#[derive(Debug)]
pub struct ProgramBuilder {
    name: String,
    cells: Vec<Cell>,
    variables: Vec<Variable>,
    frames: Vec<Frame>,
    entry_points: BTreeMap<String, usize>,
    deferred: Option<Error>,
}

impl ProgramBuilder {
    /// Open a new program; fails while another builder is open
    pub fn new(name: impl Into<String>) -> Result<Self> {
        if PROGRAM_OPEN
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::structural("Another program is still being built"));
        }
        Ok(Self {
            name: name.into(),
            cells: Vec::new(),
            variables: Vec::new(),
            frames: vec![Frame {
                kind: FrameKind::Root,
                commands: Vec::new(),
            }],
            entry_points: BTreeMap::new(),
            deferred: None,
        })
    }

    /// Whether a builder is currently open
    pub fn is_open() -> bool {
        PROGRAM_OPEN.load(Ordering::Acquire)
    }

    // ==================== cells and variables ====================

    pub fn cell(&mut self) -> Cell {
        let cell = Cell::new(self.cells.len());
        self.cells.push(cell);
        cell
    }

    pub fn cells(&mut self, count: usize) -> Vec<Cell> {
        (0..count).map(|_| self.cell()).collect()
    }

    fn declare(&mut self, name: &str, declared: Option<Type>, init: Option<InitValue>) -> Var {
        let var = Var::new(VarId(self.variables.len() as u32), name);
        if let Some(InitValue::Scalar(value)) = &init {
            let value = Expr::constant(*value);
            self.push(Command::Assign {
                var: var.clone(),
                value,
                cells: CellSet::new(),
            });
        }
        self.variables.push(Variable {
            var: var.clone(),
            declared,
            init,
        });
        var
    }

    /// Variable whose type is inferred from its uses
    pub fn var(&mut self, name: &str) -> Var {
        self.declare(name, None, None)
    }

    /// Untyped variable with an initial value
    pub fn var_init(&mut self, name: &str, value: impl Into<Literal>) -> Var {
        self.declare(name, None, Some(InitValue::Scalar(value.into())))
    }

    pub fn int_var(&mut self, name: &str, value: Option<i64>) -> Var {
        let init = value.map(|v| InitValue::Scalar(Literal::Int(v)));
        self.declare(name, Some(Type::Normal), init)
    }

    /// Duration variable; values in seconds
    pub fn time_var(&mut self, name: &str, value: Option<f64>) -> Var {
        let init = value.map(|v| InitValue::Scalar(Literal::Float(v)));
        self.declare(name, Some(Type::Time), init)
    }

    /// Frequency variable; values in Hz
    pub fn freq_var(&mut self, name: &str, value: Option<f64>) -> Var {
        let init = value.map(|v| InitValue::Scalar(Literal::Float(v)));
        self.declare(name, Some(Type::Frequency), init)
    }

    /// Phase variable; values in radians
    pub fn phase_var(&mut self, name: &str, value: Option<f64>) -> Var {
        let init = value.map(|v| InitValue::Scalar(Literal::Float(v)));
        self.declare(name, Some(Type::Phase), init)
    }

    pub fn amp_var(&mut self, name: &str, value: Option<f64>) -> Var {
        let init = value.map(|v| InitValue::Scalar(Literal::Float(v)));
        self.declare(name, Some(Type::Amplitude), init)
    }

    /// Variable receiving measured states
    pub fn state_var(&mut self, name: &str) -> Var {
        self.declare(name, Some(Type::State), None)
    }

    /// Array initialized from literal values; the element type is inferred
    pub fn array<L: Into<Literal>>(&mut self, name: &str, values: Vec<L>) -> Var {
        let values = values.into_iter().map(Into::into).collect();
        self.declare(name, None, Some(InitValue::Array(values)))
    }

    /// Array with an explicit element type and shape
    pub fn array_of(&mut self, name: &str, element: Type, shape: Shape) -> Var {
        self.declare(name, Some(Type::array(element, shape)), None)
    }

    // ==================== commands ====================

    fn push(&mut self, command: Command) {
        if let Some(frame) = self.frames.last_mut() {
            frame.commands.push(command);
        }
    }

    fn defer(&mut self, error: Error) {
        if self.deferred.is_none() {
            self.deferred = Some(error);
        }
    }

    fn check_pulse(&mut self, pulse: &Pulse) {
        if !pulse.length.is_static() && pulse.envelope != Envelope::Rect {
            self.defer(Error::unsupported(
                "Variable pulse lengths are only supported for rectangular pulses",
            ));
        }
    }

    pub fn play(&mut self, cell: Cell, pulse: &Pulse) {
        self.check_pulse(pulse);
        self.push(Command::Play {
            cell,
            pulse: pulse.clone(),
        });
    }

    pub fn play_readout(&mut self, cell: Cell, pulse: &Pulse) {
        self.check_pulse(pulse);
        self.push(Command::PlayReadout {
            cell,
            pulse: pulse.clone(),
            recording: None,
        });
    }

    /// Record on a cell; directly following a readout on the same cell the
    /// recording is started together with it
    pub fn record(&mut self, cell: Cell, recording: Recording) {
        if let Some(Command::PlayReadout {
            cell: readout_cell,
            recording: slot @ None,
            ..
        }) = self.frames.last_mut().and_then(|f| f.commands.last_mut())
        {
            if *readout_cell == cell {
                *slot = Some(recording);
                return;
            }
        }
        self.push(Command::Record { cell, recording });
    }

    pub fn wait(&mut self, cell: Cell, length: impl Into<Expr>) {
        self.push(Command::Wait {
            cell,
            length: length.into(),
        });
    }

    /// Pulse on the given digital trigger outputs of a cell
    pub fn digital_trigger(&mut self, cell: Cell, length: impl Into<Expr>, outputs: &[u8]) {
        let mut outputs = outputs.to_vec();
        outputs.sort_unstable();
        outputs.dedup();
        self.push(Command::DigitalTrigger {
            cell,
            length: length.into(),
            outputs,
        });
    }

    pub fn assign(&mut self, var: &Var, value: impl Into<Expr>) {
        self.push(Command::Assign {
            var: var.clone(),
            value: value.into(),
            cells: CellSet::new(),
        });
    }

    /// Synchronize the given cells; no cells means all cells
    pub fn sync(&mut self, cells: &[Cell]) {
        self.push(Command::Sync {
            cells: cells.iter().copied().collect(),
        });
    }

    /// Name the current top-level position as an entry point
    pub fn entry_point(&mut self, name: &str) -> Result<()> {
        if self.frames.len() != 1 {
            return Err(Error::structural(format!(
                "Entry point '{}' must be placed at the top level",
                name
            )));
        }
        if self.entry_points.contains_key(name) {
            return Err(Error::structural(format!(
                "Entry point '{}' is defined twice",
                name
            )));
        }
        let position = self.frames[0].commands.len();
        self.entry_points.insert(name.to_string(), position);
        Ok(())
    }

    // ==================== scopes ====================

    fn open(&mut self, kind: FrameKind) -> Scope<'_> {
        self.frames.push(Frame {
            kind,
            commands: Vec::new(),
        });
        let depth = self.frames.len() - 1;
        Scope {
            builder: self,
            depth,
            closed: false,
        }
    }

    pub fn if_(&mut self, condition: Expr) -> Result<Scope<'_>> {
        if !condition.is_comparison() {
            return Err(Error::unsupported(format!(
                "If condition must be a comparison, got {}",
                condition
            )));
        }
        Ok(self.open(FrameKind::If(condition)))
    }

    /// Else branch of the If directly preceding it
    pub fn else_(&mut self) -> Result<Scope<'_>> {
        match self.frames.last().and_then(|f| f.commands.last()) {
            Some(Command::If {
                else_body: None, ..
            }) => Ok(self.open(FrameKind::Else)),
            _ => Err(Error::structural(
                "Else must directly follow an If without else branch",
            )),
        }
    }

    /// Counted loop over `start..end` in steps of the constant `step`
    pub fn for_range(
        &mut self,
        var: &Var,
        start: impl Into<Expr>,
        end: impl Into<Expr>,
        step: impl Into<Expr>,
    ) -> Result<Scope<'_>> {
        let (start, end, step) = (start.into(), end.into(), step.into());

        let step_value = match step.as_const() {
            Some(value) if value.as_f64() != 0.0 => value.as_f64(),
            Some(_) => return Err(Error::structural("ForRange step must not be 0")),
            None => return Err(Error::structural("ForRange step must be a constant")),
        };

        if let (Some(s), Some(e)) = (start.as_const(), end.as_const()) {
            let (s, e) = (s.as_f64(), e.as_f64());
            if s > e && step_value >= 0.0 {
                return Err(Error::structural(format!(
                    "Definition of ForRange faulty: start ({}) is greater than end ({}) and the step is positive",
                    start, end
                )));
            }
            if s < e && step_value <= 0.0 {
                return Err(Error::structural(format!(
                    "Definition of ForRange faulty: start ({}) is less than end ({}) and the step is negative",
                    start, end
                )));
            }
        }

        Ok(self.open(FrameKind::ForRange {
            var: var.clone(),
            start,
            end,
            step,
        }))
    }

    /// Loop re-evaluating `condition` before every iteration
    pub fn while_(&mut self, condition: Expr) -> Result<Scope<'_>> {
        if !condition.is_comparison() {
            return Err(Error::unsupported(format!(
                "While condition must be a comparison, got {}",
                condition
            )));
        }
        Ok(self.open(FrameKind::While(condition)))
    }

    /// One branch of a Parallel block; two consecutive branches run together
    pub fn parallel(&mut self) -> Result<Scope<'_>> {
        Ok(self.open(FrameKind::Parallel))
    }

    fn close(&mut self, depth: usize) -> Result<()> {
        if self.frames.len() != depth + 1 || depth == 0 {
            return Err(Error::structural("Scopes must be closed in reverse order"));
        }
        let Some(frame) = self.frames.pop() else {
            return Err(Error::structural("No open scope"));
        };
        let body = frame.commands;

        match frame.kind {
            FrameKind::Root => Err(Error::structural("The program scope can not be closed")),
            FrameKind::If(condition) => {
                self.push(Command::If {
                    condition,
                    body,
                    else_body: None,
                    cells: CellSet::new(),
                });
                Ok(())
            }
            FrameKind::Else => {
                match self.frames.last_mut().and_then(|f| f.commands.last_mut()) {
                    Some(Command::If { else_body, .. }) if else_body.is_none() => {
                        *else_body = Some(body);
                        Ok(())
                    }
                    _ => Err(Error::structural(
                        "Else must directly follow an If without else branch",
                    )),
                }
            }
            FrameKind::ForRange {
                var,
                start,
                end,
                step,
            } => {
                self.push(Command::ForRange {
                    var,
                    start,
                    end,
                    step,
                    body,
                    cells: CellSet::new(),
                });
                Ok(())
            }
            FrameKind::While(condition) => {
                self.push(Command::While {
                    condition,
                    body,
                    cells: CellSet::new(),
                });
                Ok(())
            }
            FrameKind::Parallel => {
                check_parallel_branch(&body)?;
                let last = self.frames.last_mut().and_then(|f| f.commands.last_mut());
                match last {
                    Some(Command::Parallel { branches, .. }) if branches.len() < 2 => {
                        branches.push(body);
                        check_parallel_recordings(branches)
                    }
                    _ => {
                        self.push(Command::Parallel {
                            branches: vec![body],
                            cells: CellSet::new(),
                        });
                        Ok(())
                    }
                }
            }
        }
    }

    /// Close the builder and hand out the program
    pub fn finish(mut self) -> Result<Program> {
        if let Some(error) = self.deferred.take() {
            return Err(error);
        }
        if self.frames.len() != 1 {
            return Err(Error::structural("Program finished with open scopes"));
        }
        let commands = self
            .frames
            .pop()
            .map(|frame| frame.commands)
            .unwrap_or_default();

        Ok(Program {
            name: std::mem::take(&mut self.name),
            cells: std::mem::take(&mut self.cells),
            variables: std::mem::take(&mut self.variables),
            commands,
            entry_points: std::mem::take(&mut self.entry_points),
        })
    }
}

impl Drop for ProgramBuilder {
    fn drop(&mut self) {
        PROGRAM_OPEN.store(false, Ordering::Release);
    }
}

/// Only timing commands may run in parallel
fn check_parallel_branch(body: &[Command]) -> Result<()> {
    for command in body {
        match command {
            Command::Play { .. }
            | Command::PlayReadout { .. }
            | Command::Record { .. }
            | Command::Wait { .. }
            | Command::DigitalTrigger { .. } => {}
            other => {
                return Err(Error::structural(format!(
                    "{} commands are not allowed inside Parallel blocks",
                    other.name()
                )))
            }
        }
        if let Some(recording) = command.recording() {
            if recording.state_to.is_some() {
                return Err(Error::structural(
                    "Recordings saving a state are not allowed inside Parallel blocks",
                ));
            }
        }
    }
    Ok(())
}

/// All branches have to agree on each cell's recording length and offset
fn check_parallel_recordings(branches: &[Vec<Command>]) -> Result<()> {
    let mut seen: BTreeMap<Cell, &Recording> = BTreeMap::new();
    for command in branches.iter().flatten() {
        let (Some(cell), Some(recording)) = (command.cell(), command.recording()) else {
            continue;
        };
        match seen.get(&cell) {
            None => {
                seen.insert(cell, recording);
            }
            Some(first) => {
                if first.offset != recording.offset {
                    return Err(Error::structural(
                        "Parallel Blocks with multiple Recording instructions with different offsets are not supported.",
                    ));
                }
                if first.length != recording.length {
                    return Err(Error::structural(
                        "Parallel Blocks with multiple Recording instructions with different lengths are not supported.",
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Guard of an open scope; dereferences to the builder
///
/// Errors raised while closing the scope on drop are reported by
/// [`ProgramBuilder::finish`].
#[derive(Debug)]
pub struct Scope<'a> {
    builder: &'a mut ProgramBuilder,
    depth: usize,
    closed: bool,
}

impl Scope<'_> {
    /// Close the scope and report errors immediately
    pub fn end(mut self) -> Result<()> {
        self.closed = true;
        self.builder.close(self.depth)
    }
}

impl Deref for Scope<'_> {
    type Target = ProgramBuilder;

    fn deref(&self) -> &ProgramBuilder {
        self.builder
    }
}

impl DerefMut for Scope<'_> {
    fn deref_mut(&mut self) -> &mut ProgramBuilder {
        self.builder
    }
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Err(error) = self.builder.close(self.depth) {
                self.builder.defer(error);
            }
        }
    }
}

/// Serializes unit tests that open a builder
#[cfg(test)]
pub(crate) fn serial() -> std::sync::MutexGuard<'static, ()> {
    static SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());
    SERIAL
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_builder_is_rejected() {
        let _serial = serial();
        let first = ProgramBuilder::new("first").unwrap();
        let second = ProgramBuilder::new("second");
        assert!(matches!(second, Err(Error::StructuralError(_))));
        drop(first);
        assert!(ProgramBuilder::new("third").is_ok());
    }

    #[test]
    fn test_builder_on_another_thread_is_rejected() {
        let _serial = serial();
        let first = ProgramBuilder::new("first").unwrap();
        let rejected = std::thread::spawn(|| {
            matches!(ProgramBuilder::new("second"), Err(Error::StructuralError(_)))
        })
        .join()
        .unwrap();
        assert!(rejected);
        assert!(ProgramBuilder::is_open());
        drop(first);
        assert!(!ProgramBuilder::is_open());
    }

    #[test]
    fn test_scopes_nest() {
        let _serial = serial();
        let mut p = ProgramBuilder::new("nest").unwrap();
        let c = p.cell();
        let i = p.int_var("i", Some(0));
        {
            let mut body = p.for_range(&i, 0, 4, 1).unwrap();
            {
                let mut then = body.if_(i.expr().equals(2)).unwrap();
                then.wait(c, 8e-9);
            }
            {
                let mut otherwise = body.else_().unwrap();
                otherwise.wait(c, 16e-9);
            }
        }
        let program = p.finish().unwrap();

        assert_eq!(program.commands.len(), 2);
        match &program.commands[1] {
            Command::ForRange { body, .. } => match &body[0] {
                Command::If {
                    body, else_body, ..
                } => {
                    assert_eq!(body.len(), 1);
                    assert_eq!(else_body.as_ref().map(Vec::len), Some(1));
                }
                other => panic!("expected If, got {:?}", other),
            },
            other => panic!("expected ForRange, got {:?}", other),
        }
    }

    #[test]
    fn test_else_without_if() {
        let _serial = serial();
        let mut p = ProgramBuilder::new("else").unwrap();
        assert!(matches!(p.else_(), Err(Error::StructuralError(_))));
    }

    #[test]
    fn test_condition_must_compare() {
        let _serial = serial();
        let mut p = ProgramBuilder::new("cond").unwrap();
        let x = p.int_var("x", Some(1));
        assert!(matches!(p.if_(&x + 1), Err(Error::UnsupportedOperation(_))));
        assert!(matches!(p.while_(x.expr()), Err(Error::UnsupportedOperation(_))));
    }

    #[test]
    fn test_record_attaches_to_readout() {
        let _serial = serial();
        let mut p = ProgramBuilder::new("readout").unwrap();
        let c = p.cell();
        p.play_readout(c, &Pulse::new(400e-9));
        p.record(c, Recording::new(400e-9).save_to("result"));
        p.record(c, Recording::new(400e-9));
        let program = p.finish().unwrap();

        assert_eq!(program.commands.len(), 2);
        assert!(matches!(
            &program.commands[0],
            Command::PlayReadout {
                recording: Some(_),
                ..
            }
        ));
        assert!(matches!(&program.commands[1], Command::Record { .. }));
    }

    #[test]
    fn test_consecutive_parallel_scopes_merge() {
        let _serial = serial();
        let mut p = ProgramBuilder::new("parallel").unwrap();
        let c = p.cell();
        {
            let mut branch = p.parallel().unwrap();
            branch.play(c, &Pulse::new(40e-9));
        }
        {
            let mut branch = p.parallel().unwrap();
            branch.wait(c, 8e-9);
            branch.play_readout(c, &Pulse::new(40e-9));
        }
        let program = p.finish().unwrap();

        assert_eq!(program.commands.len(), 1);
        match &program.commands[0] {
            Command::Parallel { branches, .. } => assert_eq!(branches.len(), 2),
            other => panic!("expected Parallel, got {:?}", other),
        }
    }

    #[test]
    fn test_third_parallel_scope_starts_new_block() {
        let _serial = serial();
        let mut p = ProgramBuilder::new("parallel").unwrap();
        let c = p.cell();
        for _ in 0..3 {
            let mut branch = p.parallel().unwrap();
            branch.play(c, &Pulse::new(40e-9));
        }
        let program = p.finish().unwrap();

        let branch_counts: Vec<usize> = program
            .commands
            .iter()
            .map(|command| match command {
                Command::Parallel { branches, .. } => branches.len(),
                other => panic!("expected Parallel, got {:?}", other),
            })
            .collect();
        assert_eq!(branch_counts, vec![2, 1]);
    }

    #[test]
    fn test_parallel_recording_offsets_must_agree() {
        let _serial = serial();
        let mut p = ProgramBuilder::new("parallel").unwrap();
        let c = p.cell();
        {
            let mut branch = p.parallel().unwrap();
            branch.record(c, Recording::new(400e-9).offset(20e-9));
        }
        let result = {
            let mut branch = p.parallel().unwrap();
            branch.record(c, Recording::new(400e-9).offset(40e-9));
            branch.end()
        };
        assert_eq!(
            result,
            Err(Error::structural(
                "Parallel Blocks with multiple Recording instructions with different offsets are not supported."
            ))
        );
    }

    #[test]
    fn test_parallel_rejects_control_flow() {
        let _serial = serial();
        let mut p = ProgramBuilder::new("parallel").unwrap();
        let x = p.int_var("x", Some(0));
        {
            let mut branch = p.parallel().unwrap();
            branch.assign(&x, 1);
        }
        assert!(matches!(p.finish(), Err(Error::StructuralError(_))));
    }

    #[test]
    fn test_duplicate_entry_point() {
        let _serial = serial();
        let mut p = ProgramBuilder::new("entry").unwrap();
        let c = p.cell();
        p.entry_point("start").unwrap();
        p.wait(c, 8e-9);
        assert!(p.entry_point("start").is_err());
        p.entry_point("second").unwrap();
        let program = p.finish().unwrap();
        assert_eq!(program.entry_points["start"], 0);
        assert_eq!(program.entry_points["second"], 1);
    }

    #[test]
    fn test_initial_value_emits_assign() {
        let _serial = serial();
        let mut p = ProgramBuilder::new("init").unwrap();
        let _x = p.int_var("x", Some(3));
        let _y = p.int_var("y", None);
        let program = p.finish().unwrap();
        assert_eq!(program.commands.len(), 1);
        assert!(matches!(program.commands[0], Command::Assign { .. }));
    }

    #[test]
    fn test_for_range_direction_is_checked() {
        let _serial = serial();
        let mut p = ProgramBuilder::new("range").unwrap();
        let i = p.int_var("i", None);
        assert!(p.for_range(&i, 10, 0, 1).is_err());
        assert!(p.for_range(&i, 0, 10, -1).is_err());
        assert!(p.for_range(&i, 0, 10, 0).is_err());
    }
}
