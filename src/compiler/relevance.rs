//! Relevance analysis
//!
//! Decides on which cells every structured command and every variable is
//! needed. Structured commands are relevant for the union of their bodies;
//! a variable is relevant wherever it is read or written, and an assignment
//! follows its target onto every cell the target is relevant for. Since
//! assignments can precede or follow the uses that make them relevant (loops),
//! the backwards inspection runs until nothing changes.

use crate::program::{Cell, CellSet, Command, Program, VarId};
use std::collections::BTreeMap;

/// Cells each variable needs a register on
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Relevance {
    vars: BTreeMap<VarId, CellSet>,
}

impl Relevance {
    /// Annotate the cells of every structured command and Assign of `program`
    pub fn analyze(program: &mut Program) -> Relevance {
        let mut relevance = Relevance::default();
        let mut rounds = 0;
        loop {
            rounds += 1;
            contained_cells(&mut program.commands);
            if !relevance.inspect(&mut program.commands) {
                break;
            }
        }
        contained_cells(&mut program.commands);
        tracing::debug!(rounds, vars = relevance.vars.len(), "relevance fixpoint reached");
        relevance
    }

    pub fn cells(&self, var: VarId) -> CellSet {
        self.vars.get(&var).cloned().unwrap_or_default()
    }

    pub fn is_relevant(&self, var: VarId, cell: Cell) -> bool {
        self.vars.get(&var).is_some_and(|cells| cells.contains(&cell))
    }

    fn add(&mut self, var: VarId, cells: &CellSet) -> bool {
        let entry = self.vars.entry(var).or_default();
        let before = entry.len();
        entry.extend(cells.iter().copied());
        entry.len() != before
    }

    /// One backwards pass; returns whether anything changed
    fn inspect(&mut self, commands: &mut [Command]) -> bool {
        let mut changed = false;
        for command in commands.iter_mut().rev() {
            if let Command::Assign {
                var, value, cells, ..
            } = command
            {
                let target = self.cells(var.id());
                let before = cells.len();
                cells.extend(target.iter().copied());
                changed |= cells.len() != before;
                for used in value.variables() {
                    changed |= self.add(used, &target);
                }
                continue;
            }

            for body in command.bodies_mut() {
                changed |= self.inspect(body);
            }

            // Parallel blocks have no header of their own
            if matches!(command, Command::Parallel { .. } | Command::Sync { .. }) {
                continue;
            }
            let cells = command.cells();
            for var in command.read_vars().into_iter().chain(command.written_vars()) {
                changed |= self.add(var, &cells);
            }
        }
        changed
    }
}

/// Widen every structured command to the cells of its bodies; returns the
/// cells of the whole list
fn contained_cells(commands: &mut [Command]) -> CellSet {
    let mut cells = CellSet::new();
    for command in commands.iter_mut() {
        if command.is_structured() {
            let mut inner = CellSet::new();
            for body in command.bodies_mut() {
                inner.extend(contained_cells(body));
            }
            if let Some(own) = command.cells_mut() {
                own.extend(inner);
            }
        }
        cells.extend(command.cells());
    }
    cells
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{Cell, ProgramBuilder};

    #[test]
    fn test_structured_commands_collect_body_cells() {
        let _serial = crate::program::builder::serial();
        let mut p = ProgramBuilder::new("cells").unwrap();
        let (q0, q1) = (p.cell(), p.cell());
        let i = p.int_var("i", None);
        {
            let mut body = p.for_range(&i, 0, 4, 1).unwrap();
            body.wait(q0, 8e-9);
            {
                let mut inner = body.if_(i.expr().equals(1)).unwrap();
                inner.wait(q1, 8e-9);
            }
        }
        let mut program = p.finish().unwrap();
        let relevance = Relevance::analyze(&mut program);

        assert_eq!(program.commands[0].cells(), CellSet::from([q0, q1]));
        assert_eq!(relevance.cells(i.id()), CellSet::from([q0, q1]));
    }

    #[test]
    fn test_top_level_assign_follows_its_target() {
        let _serial = crate::program::builder::serial();
        let mut p = ProgramBuilder::new("assign").unwrap();
        let (_q0, q1) = (p.cell(), p.cell());
        let a = p.time_var("a", Some(20e-9));
        let b = p.time_var("b", None);
        p.assign(&b, &a + 8e-9);
        p.wait(q1, &b);
        let mut program = p.finish().unwrap();
        let relevance = Relevance::analyze(&mut program);

        assert_eq!(relevance.cells(b.id()), CellSet::from([q1]));
        assert_eq!(relevance.cells(a.id()), CellSet::from([q1]));
        for command in &program.commands {
            if let Command::Assign { cells, .. } = command {
                assert_eq!(*cells, CellSet::from([q1]));
            }
        }
    }

    #[test]
    fn test_assign_after_use_inside_loop() {
        let _serial = crate::program::builder::serial();
        let mut p = ProgramBuilder::new("loop").unwrap();
        let q = p.cell();
        let i = p.int_var("i", None);
        let t = p.time_var("t", Some(8e-9));
        let step = p.time_var("step", Some(4e-9));
        {
            let mut body = p.for_range(&i, 0, 3, 1).unwrap();
            body.wait(q, &t);
            body.assign(&t, &t + &step);
        }
        let mut program = p.finish().unwrap();
        let relevance = Relevance::analyze(&mut program);

        assert!(relevance.is_relevant(step.id(), q));
        assert!(relevance.is_relevant(t.id(), q));
        assert!(!relevance.is_relevant(t.id(), Cell::new(1)));
    }

    #[test]
    fn test_unused_variable_is_relevant_nowhere() {
        let _serial = crate::program::builder::serial();
        let mut p = ProgramBuilder::new("unused").unwrap();
        let q = p.cell();
        let x = p.int_var("x", Some(4));
        p.wait(q, 8e-9);
        let mut program = p.finish().unwrap();
        let relevance = Relevance::analyze(&mut program);

        assert!(relevance.cells(x.id()).is_empty());
        assert!(program.commands[0].cells().is_empty());
    }
}
