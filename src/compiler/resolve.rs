//! Property resolution
//!
//! Replaces every deferred cell property with the literal found in a
//! [`ParameterTable`]. Resolved nodes keep their identity, so the types
//! inferred before resolution still apply and one inferred program can be
//! resolved against several tables.

use crate::error::Result;
use crate::program::expr::{Expr, ExprKind, Literal};
use crate::program::{Command, ParameterTable, Program};
use crate::types::{Type, TypeTable};

/// Resolve all properties of `program`; returns how many were substituted
pub fn resolve_properties(
    program: &mut Program,
    types: &TypeTable,
    table: &ParameterTable,
) -> Result<usize> {
    let mut resolver = Resolver {
        types,
        table,
        resolved: 0,
    };
    resolver.commands(&mut program.commands)?;
    tracing::debug!(resolved = resolver.resolved, "cell properties resolved");
    Ok(resolver.resolved)
}

struct Resolver<'a> {
    types: &'a TypeTable,
    table: &'a ParameterTable,
    resolved: usize,
}

impl Resolver<'_> {
    fn commands(&mut self, commands: &mut [Command]) -> Result<()> {
        for command in commands {
            for expr in command.expressions_mut() {
                if !expr.properties().is_empty() {
                    *expr = self.expr(expr)?;
                }
            }
            for body in command.bodies_mut() {
                self.commands(body)?;
            }
        }
        Ok(())
    }

    fn expr(&mut self, expr: &Expr) -> Result<Expr> {
        Ok(match expr.kind() {
            ExprKind::Const(_) | ExprKind::Var(_) => expr.clone(),
            ExprKind::Property(prop) => {
                let value = prop.apply(self.table.lookup(prop.cell, &prop.name)?);
                self.resolved += 1;
                expr.resolved(self.literal(expr, value))
            }
            ExprKind::Binary { op, lhs, rhs } => expr.with_kind(ExprKind::Binary {
                op: *op,
                lhs: self.expr(lhs)?,
                rhs: self.expr(rhs)?,
            }),
            ExprKind::Not(inner) => expr.with_kind(ExprKind::Not(self.expr(inner)?)),
            ExprKind::Compare { op, lhs, rhs } => expr.with_kind(ExprKind::Compare {
                op: *op,
                lhs: self.expr(lhs)?,
                rhs: self.expr(rhs)?,
            }),
            ExprKind::Index { array, index } => expr.with_kind(ExprKind::Index {
                array: array.clone(),
                index: self.expr(index)?,
            }),
        })
    }

    /// Integer types get integer literals as long as the value is integral
    fn literal(&self, expr: &Expr, value: f64) -> Literal {
        let integral = matches!(self.types.expr(expr), Some(Type::Normal | Type::State));
        if integral && value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
            Literal::Int(value as i64)
        } else {
            Literal::Float(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::program::{ProgramBuilder, Pulse, Recording};
    use crate::types::TypeInference;

    #[test]
    fn test_properties_become_literals() {
        let _serial = crate::program::builder::serial();
        let mut p = ProgramBuilder::new("resolve").unwrap();
        let q = p.cell();
        p.play(q, &Pulse::new(q.property("pi_len")).frequency(q.property("freq")));
        p.record(
            q,
            Recording::new(400e-9).offset(q.property("rec_offset") + 8e-9),
        );
        let mut program = p.finish().unwrap();
        let types = TypeInference::infer(&program).unwrap();

        let mut table = ParameterTable::new();
        table
            .set(q, "pi_len", 20e-9)
            .set(q, "freq", 60e6)
            .set(q, "rec_offset", 100e-9);
        let count = resolve_properties(&mut program, &types, &table).unwrap();
        assert_eq!(count, 3);

        let Command::Record { recording, .. } = &program.commands[1] else {
            panic!("expected record");
        };
        let offset = recording.offset.as_const().unwrap().as_f64();
        assert!((offset - 108e-9).abs() < 1e-15);
        assert_eq!(types.expr(&recording.offset), Some(&Type::Time));
    }

    #[test]
    fn test_missing_property() {
        let _serial = crate::program::builder::serial();
        let mut p = ProgramBuilder::new("missing").unwrap();
        let q = p.cell();
        p.wait(q, q.property("idle"));
        let mut program = p.finish().unwrap();
        let types = TypeInference::infer(&program).unwrap();

        let err = resolve_properties(&mut program, &types, &ParameterTable::new()).unwrap_err();
        assert_eq!(
            err,
            Error::MissingProperty {
                cell: 0,
                name: "idle".to_string()
            }
        );
    }

    #[test]
    fn test_integer_property_in_loop_bound() {
        let _serial = crate::program::builder::serial();
        let mut p = ProgramBuilder::new("bound").unwrap();
        let q = p.cell();
        let i = p.int_var("i", None);
        {
            let mut body = p.for_range(&i, 0, q.property("shots"), 1).unwrap();
            body.wait(q, 8e-9);
        }
        let mut program = p.finish().unwrap();
        let types = TypeInference::infer(&program).unwrap();
        let mut table = ParameterTable::new();
        table.set(q, "shots", 10.0);
        resolve_properties(&mut program, &types, &table).unwrap();

        let Command::ForRange { end, .. } = &program.commands[0] else {
            panic!("expected loop");
        };
        assert_eq!(end.as_const(), Some(Literal::Int(10)));
    }
}
