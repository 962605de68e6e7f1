//! Constraint based type inference
//!
//! Every typing rule is an implication: *if* some nodes have certain types
//! *then* another node has a certain type. Rules are attached to the nodes in
//! their condition and fire as soon as those nodes learn their type, so
//! information flows in every direction through calculations, comparisons,
//! assignments and loop headers.
//!
//! Each assigned type remembers the fact that produced it (a type defining
//! use, a fallback or a rule). Facts of rules point at the nodes of their
//! condition, which forms an acyclic justification graph that is rendered
//! into the causal chain of a conflict message.

use super::{IllegalTypeReason, Shape, Type, TypeDefiningUse, TypeFallback, SCALAR_TYPES};
use crate::error::{Error, Result};
use crate::program::expr::{BinOp, CmpOp, Expr, ExprId, ExprKind, Literal, Var, VarId};
use crate::program::units::CYCLE_TIME;
use crate::program::{Command, InitValue, Program, Pulse, Recording, Variable};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

/// Something that carries a type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Node {
    /// A declared variable
    Var(VarId),
    /// An expression node other than a variable reference
    Expr(ExprId),
    /// The elements of an array variable
    Elem(VarId),
}

#[derive(Debug, Clone, Copy)]
enum CalcOp {
    Binary(BinOp),
    Not,
}

impl fmt::Display for CalcOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalcOp::Binary(op) => write!(f, "{}", op),
            CalcOp::Not => write!(f, "~"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Reason {
    Calc { op: CalcOp, result: Node },
    Condition(CmpOp),
    Assign,
    ForRange,
    ArrayElement(VarId),
}

#[derive(Debug, Clone, Copy)]
enum Fact {
    Use(TypeDefiningUse),
    Fallback(TypeFallback),
    Constraint(usize),
}

#[derive(Debug)]
struct Constraint {
    condition: Vec<(Node, Type)>,
    conclusion: (Node, Type),
    reason: Reason,
}

#[derive(Debug)]
struct NodeInfo {
    label: String,
    ty: Type,
    fact: Option<Fact>,
    constraints: Vec<usize>,
    illegal: Vec<(Type, IllegalTypeReason)>,
}

impl NodeInfo {
    fn new(label: String) -> Self {
        Self {
            label,
            ty: Type::Unknown,
            fact: None,
            constraints: Vec::new(),
            illegal: Vec::new(),
        }
    }
}

/// Inferred types of every variable and expression of one program
#[derive(Debug, Clone, Default)]
pub struct TypeTable {
    vars: BTreeMap<VarId, Type>,
    exprs: HashMap<ExprId, Type>,
}

impl TypeTable {
    /// Type of a variable; arrays carry their element type
    pub fn var(&self, id: VarId) -> Option<&Type> {
        self.vars.get(&id)
    }

    /// Type of an expression node
    pub fn expr(&self, expr: &Expr) -> Option<&Type> {
        match expr.kind() {
            ExprKind::Var(var) => self.vars.get(&var.id()),
            _ => self.exprs.get(&expr.id()),
        }
    }

    /// All typed variables
    pub fn variables(&self) -> impl Iterator<Item = (&VarId, &Type)> {
        self.vars.iter()
    }
}

/// The inference engine
///
/// One engine infers one program:
///
/// ```ignore
/// let table = TypeInference::infer(&program)?;
/// ```
#[derive(Debug, Default)]
pub struct TypeInference {
    nodes: HashMap<Node, NodeInfo>,
    order: Vec<Node>,
    constraints: Vec<Constraint>,
    seen: HashSet<ExprId>,
    constants: Vec<(Node, Literal)>,
    literal_arrays: Vec<(VarId, bool)>,
    loop_vars: Vec<VarId>,
}

impl TypeInference {
    pub fn new() -> Self {
        Self::default()
    }

    /// Infer the types of a whole program
    pub fn infer(program: &Program) -> Result<TypeTable> {
        let mut engine = Self::new();
        for variable in &program.variables {
            engine.declare(variable)?;
        }
        engine.walk(&program.commands)?;
        engine.apply_fallbacks()?;
        let table = engine.into_table()?;
        check_loops(&program.commands, &table)?;
        Ok(table)
    }

    // ==================== node bookkeeping ====================

    fn ensure(&mut self, node: Node, label: impl FnOnce() -> String) {
        if !self.nodes.contains_key(&node) {
            self.nodes.insert(node, NodeInfo::new(label()));
            self.order.push(node);
        }
    }

    fn node_of(&mut self, expr: &Expr) -> Node {
        match expr.kind() {
            ExprKind::Var(var) => {
                let node = Node::Var(var.id());
                self.ensure(node, || var.name().to_string());
                node
            }
            _ => {
                let node = Node::Expr(expr.id());
                self.ensure(node, || expr.to_string());
                node
            }
        }
    }

    fn elem_node(&mut self, var: &Var) -> Node {
        let node = Node::Elem(var.id());
        self.ensure(node, || format!("elements of {}", var.name()));
        node
    }

    fn ty(&self, node: Node) -> Type {
        self.nodes
            .get(&node)
            .map(|info| info.ty.clone())
            .unwrap_or(Type::Unknown)
    }

    fn label(&self, node: Node) -> &str {
        self.nodes
            .get(&node)
            .map(|info| info.label.as_str())
            .unwrap_or("?")
    }

    // ==================== rendering ====================

    fn render_fact(&self, fact: Option<Fact>) -> String {
        match fact {
            Some(Fact::Use(use_)) => use_.message().to_string(),
            Some(Fact::Fallback(fallback)) => fallback.message().to_string(),
            Some(Fact::Constraint(id)) => self.render_constraint(id),
            None => String::new(),
        }
    }

    fn node_fact(&self, node: Node) -> Option<Fact> {
        self.nodes.get(&node).and_then(|info| info.fact)
    }

    fn render_constraint(&self, id: usize) -> String {
        let constraint = &self.constraints[id];
        let (first, first_ty) = &constraint.condition[0];
        let because = format!(
            "{} {}",
            self.label(*first),
            self.render_fact(self.node_fact(*first))
        );

        match constraint.reason {
            Reason::Calc {
                op: CalcOp::Binary(BinOp::Mul),
                result,
            } => {
                let mut msg = String::new();
                for (i, (node, ty)) in constraint.condition.iter().enumerate() {
                    if i > 0 {
                        msg.push_str("\nand ");
                    }
                    msg.push_str(&format!(
                        "{} has type {}\n(because it {})",
                        self.label(*node),
                        ty,
                        self.render_fact(self.node_fact(*node))
                    ));
                }
                format!(
                    "is used in * calculation of type {}\n(because {})",
                    self.ty(result),
                    msg
                )
            }
            Reason::Calc { op, result } => format!(
                "is used in {} calculation of type {}\n(because {})",
                op,
                self.ty(result),
                because
            ),
            Reason::Condition(_) => format!(
                "is compared with {} with type {}\n(because {})",
                self.label(*first),
                first_ty,
                because
            ),
            Reason::Assign => format!(
                "is used in Assign command with type {}\n(because {})",
                first_ty, because
            ),
            Reason::ForRange => format!(
                "is used in ForRange over type {}\n(because {})",
                first_ty, because
            ),
            Reason::ArrayElement(_) => format!(
                "is an element of an array with type {}\n(because {})",
                first_ty, because
            ),
        }
    }

    fn illegal_error(&self, node: Node, ty: &Type, illegal: IllegalTypeReason, fact: Option<Fact>) -> Error {
        Error::type_conflict(format!(
            "{} can not have {}\n(because {})\nbut the type is required.\n(because it {})",
            self.label(node),
            ty,
            illegal.message(),
            self.render_fact(fact)
        ))
    }

    // ==================== propagation ====================

    fn set_type(&mut self, node: Node, ty: Type, fact: Fact) -> Result<()> {
        let Some(info) = self.nodes.get(&node) else {
            return Ok(());
        };

        if let Some((_, illegal)) = info.illegal.iter().find(|(t, _)| *t == ty) {
            return Err(self.illegal_error(node, &ty, *illegal, Some(fact)));
        }

        if info.ty == Type::Unknown {
            let constraints = info.constraints.clone();
            if let Some(info) = self.nodes.get_mut(&node) {
                info.ty = ty;
                info.fact = Some(fact);
            }
            for id in constraints {
                self.try_apply(id)?;
            }
            Ok(())
        } else if info.ty != ty {
            Err(Error::type_conflict(format!(
                "{} was of type {}\n(because it {})\nbut is also used as type {}\n(because it {})",
                info.label,
                info.ty,
                self.render_fact(info.fact),
                ty,
                self.render_fact(Some(fact))
            )))
        } else {
            Ok(())
        }
    }

    fn try_apply(&mut self, id: usize) -> Result<()> {
        let constraint = &self.constraints[id];
        let satisfied = constraint
            .condition
            .iter()
            .all(|(node, ty)| self.ty(*node) == *ty);
        if satisfied {
            let (node, ty) = constraint.conclusion.clone();
            self.set_type(node, ty, Fact::Constraint(id))?;
        }
        Ok(())
    }

    fn add_constraint(
        &mut self,
        condition: Vec<(Node, Type)>,
        conclusion: (Node, Type),
        reason: Reason,
    ) -> Result<()> {
        let id = self.constraints.len();
        let nodes: Vec<Node> = condition.iter().map(|(node, _)| *node).collect();
        self.constraints.push(Constraint {
            condition,
            conclusion,
            reason,
        });

        for node in nodes {
            let untyped = self.ty(node) == Type::Unknown;
            if untyped {
                if let Some(info) = self.nodes.get_mut(&node) {
                    info.constraints.push(id);
                }
            } else {
                self.try_apply(id)?;
            }
        }
        Ok(())
    }

    /// Ring of implications making all `nodes` share `ty` once one has it
    fn add_equal(&mut self, ty: &Type, reason: Reason, nodes: &[Node]) -> Result<()> {
        let Some(mut prev) = nodes.last().copied() else {
            return Ok(());
        };
        for &next in nodes {
            self.add_constraint(vec![(prev, ty.clone())], (next, ty.clone()), reason)?;
            prev = next;
        }
        Ok(())
    }

    fn add_implies(
        &mut self,
        condition: &[(Node, Type)],
        conclusion: (Node, Type),
        reason: Reason,
    ) -> Result<()> {
        self.add_constraint(condition.to_vec(), conclusion, reason)
    }

    fn add_illegal(&mut self, node: Node, ty: Type, reason: IllegalTypeReason) -> Result<()> {
        let Some(info) = self.nodes.get(&node) else {
            return Ok(());
        };
        if info.ty == ty {
            return Err(self.illegal_error(node, &ty, reason, info.fact));
        }
        if let Some(info) = self.nodes.get_mut(&node) {
            info.illegal.push((ty, reason));
        }
        Ok(())
    }

    fn require(&mut self, expr: &Expr, ty: Type, use_: TypeDefiningUse) -> Result<()> {
        let node = self.visit_expr(expr)?;
        self.set_type(node, ty, Fact::Use(use_))
    }

    // ==================== rules ====================

    fn scalar_multiplication(
        &mut self,
        ty: Type,
        lhs: Node,
        rhs: Node,
        res: Node,
        reason: Reason,
    ) -> Result<()> {
        let normal = Type::Normal;
        self.add_implies(&[(lhs, ty.clone())], (rhs, normal.clone()), reason)?;
        self.add_implies(&[(lhs, ty.clone())], (res, ty.clone()), reason)?;

        self.add_implies(&[(rhs, ty.clone())], (lhs, normal.clone()), reason)?;
        self.add_implies(&[(rhs, ty.clone())], (res, ty.clone()), reason)?;

        self.add_implies(
            &[(rhs, normal.clone()), (lhs, normal.clone())],
            (res, normal.clone()),
            reason,
        )?;
        self.add_implies(
            &[(res, ty.clone()), (lhs, normal.clone())],
            (rhs, ty.clone()),
            reason,
        )?;
        self.add_implies(
            &[(res, ty.clone()), (rhs, normal.clone())],
            (lhs, ty.clone()),
            reason,
        )?;
        self.add_implies(&[(res, normal.clone())], (lhs, normal.clone()), reason)?;
        self.add_implies(&[(res, normal.clone())], (rhs, normal), reason)
    }

    fn calc_constraints(&mut self, op: CalcOp, lhs: Node, rhs: Option<Node>, res: Node) -> Result<()> {
        let reason = Reason::Calc { op, result: res };

        let (op, rhs) = match (op, rhs) {
            (CalcOp::Not, _) | (_, None) => {
                self.add_equal(&Type::Normal, reason, &[lhs, res])?;
                return self.add_equal(&Type::State, reason, &[lhs, res]);
            }
            (CalcOp::Binary(op), Some(rhs)) => (op, rhs),
        };

        match op {
            BinOp::Add | BinOp::Sub | BinOp::And | BinOp::Or | BinOp::Xor => {
                self.add_equal(&Type::Normal, reason, &[rhs, lhs, res])?;
            }
            _ => {}
        }

        if matches!(op, BinOp::And | BinOp::Or | BinOp::Xor) {
            self.add_equal(&Type::State, reason, &[rhs, lhs, res])?;
        }

        if op == BinOp::Add {
            for ty in [Type::Time, Type::Frequency, Type::Phase, Type::Amplitude] {
                self.add_equal(&ty, reason, &[rhs, lhs, res])?;
            }
        }

        if op == BinOp::Mul {
            for ty in [Type::Time, Type::Frequency, Type::Phase, Type::Amplitude] {
                self.scalar_multiplication(ty, lhs, rhs, res, reason)?;
            }
        }

        if matches!(op, BinOp::Shl | BinOp::Shr) {
            self.set_type(rhs, Type::Normal, Fact::Use(TypeDefiningUse::ShiftExpression))?;
            for ty in [Type::Normal, Type::Time, Type::Frequency] {
                self.add_equal(&ty, reason, &[lhs, res])?;
            }
        }
        Ok(())
    }

    fn condition_constraints(&mut self, op: CmpOp, lhs: Node, rhs: Node) -> Result<()> {
        let reason = Reason::Condition(op);
        self.add_equal(&Type::Normal, reason, &[lhs, rhs])?;
        self.add_equal(&Type::Time, reason, &[lhs, rhs])?;
        if matches!(op, CmpOp::Eq | CmpOp::Ne) {
            self.add_equal(&Type::State, reason, &[lhs, rhs])?;
        }
        Ok(())
    }

    fn index_constraints(&mut self, array: &Var, index: Node, result: Node) -> Result<()> {
        let array_node = Node::Var(array.id());
        self.ensure(array_node, || array.name().to_string());

        match self.ty(array_node) {
            Type::Unknown => self.set_type(
                array_node,
                Type::array(Type::Unknown, Shape::unknown()),
                Fact::Use(TypeDefiningUse::ArrayAccess),
            )?,
            Type::Array(_, shape) => {
                if let Some(rank) = shape.rank() {
                    if rank != 1 {
                        return Err(Error::unsupported(format!(
                            "Only one-dimensional arrays can be indexed, but {} has shape {}",
                            array, shape
                        )));
                    }
                }
            }
            other => {
                return Err(Error::unsupported(format!(
                    "{} has type {} and can not be indexed",
                    array, other
                )))
            }
        }

        match self.ty(index) {
            Type::Unknown => {
                self.set_type(index, Type::Normal, Fact::Use(TypeDefiningUse::ArrayIndex))?
            }
            Type::Normal => {}
            other => {
                return Err(Error::unsupported(format!(
                    "Array index {} must be of type NORMAL, but has type {}",
                    self.label(index),
                    other
                )))
            }
        }

        let elem = self.elem_node(array);
        let reason = Reason::ArrayElement(array.id());
        for ty in SCALAR_TYPES.iter() {
            self.add_equal(ty, reason, &[result, elem])?;
        }
        Ok(())
    }

    // ==================== walk ====================

    fn declare(&mut self, variable: &Variable) -> Result<()> {
        let var = &variable.var;
        let node = Node::Var(var.id());
        self.ensure(node, || var.name().to_string());

        match (&variable.declared, &variable.init) {
            (Some(Type::Array(elem, shape)), _) => {
                self.set_type(
                    node,
                    Type::array(Type::Unknown, shape.clone()),
                    Fact::Use(TypeDefiningUse::VariableDefinition),
                )?;
                let elem_node = self.elem_node(var);
                if elem.is_known() {
                    self.set_type(
                        elem_node,
                        (**elem).clone(),
                        Fact::Use(TypeDefiningUse::VariableDefinition),
                    )?;
                }
            }
            (Some(ty), _) => {
                self.set_type(node, ty.clone(), Fact::Use(TypeDefiningUse::VariableDefinition))?
            }
            (None, _) => {}
        }

        if let Some(InitValue::Array(values)) = &variable.init {
            if variable.declared.is_none() {
                self.set_type(
                    node,
                    Type::array(Type::Unknown, Shape::vector(values.len())),
                    Fact::Use(TypeDefiningUse::VariableDefinition),
                )?;
            }
            let elem_node = self.elem_node(var);
            let any_float = values.iter().any(Literal::is_float);
            if values.iter().any(|v| !v.is_state_value()) {
                self.add_illegal(elem_node, Type::State, IllegalTypeReason::InvalidStateConstant)?;
            }
            if any_float {
                self.add_illegal(elem_node, Type::Normal, IllegalTypeReason::InvalidNormalConstant)?;
            }
            self.literal_arrays.push((var.id(), any_float));
        }
        Ok(())
    }

    fn visit_expr(&mut self, expr: &Expr) -> Result<Node> {
        let node = match expr.kind() {
            ExprKind::Compare { .. } => Node::Expr(expr.id()),
            _ => self.node_of(expr),
        };
        if !self.seen.insert(expr.id()) {
            return Ok(node);
        }

        match expr.kind() {
            ExprKind::Const(lit) => {
                if !lit.is_state_value() {
                    self.add_illegal(node, Type::State, IllegalTypeReason::InvalidStateConstant)?;
                }
                if lit.is_float() {
                    self.add_illegal(node, Type::Normal, IllegalTypeReason::InvalidNormalConstant)?;
                }
                self.constants.push((node, *lit));
            }
            ExprKind::Var(_) | ExprKind::Property(_) => {}
            ExprKind::Binary { op, lhs, rhs } => {
                let lhs = self.visit_expr(lhs)?;
                let rhs = self.visit_expr(rhs)?;
                self.calc_constraints(CalcOp::Binary(*op), lhs, Some(rhs), node)?;
            }
            ExprKind::Not(inner) => {
                let inner = self.visit_expr(inner)?;
                self.calc_constraints(CalcOp::Not, inner, None, node)?;
            }
            ExprKind::Compare { op, lhs, rhs } => {
                let lhs = self.visit_expr(lhs)?;
                let rhs = self.visit_expr(rhs)?;
                self.condition_constraints(*op, lhs, rhs)?;
            }
            ExprKind::Index { array, index } => {
                let index = self.visit_expr(index)?;
                self.index_constraints(array, index, node)?;
            }
        }
        Ok(node)
    }

    fn visit_pulse(&mut self, pulse: &Pulse) -> Result<()> {
        self.require(&pulse.length, Type::Time, TypeDefiningUse::PulseLength)?;
        if let Some(frequency) = &pulse.frequency {
            self.require(frequency, Type::Frequency, TypeDefiningUse::PulseFrequency)?;
        }
        if let Some(phase) = &pulse.phase {
            self.require(phase, Type::Phase, TypeDefiningUse::PulsePhase)?;
        }
        if let Some(amplitude) = &pulse.amplitude {
            self.require(amplitude, Type::Amplitude, TypeDefiningUse::PulseAmplitude)?;
        }
        Ok(())
    }

    fn visit_recording(&mut self, recording: &Recording) -> Result<()> {
        self.require(&recording.length, Type::Time, TypeDefiningUse::RecordingLength)?;
        self.require(
            &recording.offset,
            Type::Time,
            TypeDefiningUse::RecordingOffsetExpression,
        )?;
        if let Some(var) = &recording.state_to {
            let node = Node::Var(var.id());
            self.ensure(node, || var.name().to_string());
            self.set_type(node, Type::State, Fact::Use(TypeDefiningUse::RecordingSaveTo))?;
        }
        Ok(())
    }

    fn walk(&mut self, commands: &[Command]) -> Result<()> {
        for command in commands {
            self.visit_command(command)?;
        }
        Ok(())
    }

    fn visit_command(&mut self, command: &Command) -> Result<()> {
        match command {
            Command::Play { pulse, .. } => self.visit_pulse(pulse),
            Command::PlayReadout {
                pulse, recording, ..
            } => {
                self.visit_pulse(pulse)?;
                if let Some(recording) = recording {
                    self.visit_recording(recording)?;
                }
                Ok(())
            }
            Command::Record { recording, .. } => self.visit_recording(recording),
            Command::Wait { length, .. } => {
                self.require(length, Type::Time, TypeDefiningUse::WaitCommand)
            }
            Command::DigitalTrigger { length, .. } => {
                self.require(length, Type::Time, TypeDefiningUse::PulseLength)
            }
            Command::Assign { var, value, .. } => {
                let value = self.visit_expr(value)?;
                let target = Node::Var(var.id());
                self.ensure(target, || var.name().to_string());
                self.add_illegal(target, Type::State, IllegalTypeReason::Assign)?;
                for ty in [
                    Type::Normal,
                    Type::Time,
                    Type::Frequency,
                    Type::Phase,
                    Type::Amplitude,
                ] {
                    self.add_equal(&ty, Reason::Assign, &[target, value])?;
                }
                Ok(())
            }
            Command::If {
                condition,
                body,
                else_body,
                ..
            } => {
                self.visit_expr(condition)?;
                self.walk(body)?;
                if let Some(else_body) = else_body {
                    self.walk(else_body)?;
                }
                Ok(())
            }
            Command::ForRange {
                var,
                start,
                end,
                step,
                body,
                ..
            } => {
                let target = Node::Var(var.id());
                self.ensure(target, || var.name().to_string());
                let start = self.visit_expr(start)?;
                let end = self.visit_expr(end)?;
                let step = self.visit_expr(step)?;

                for ty in [Type::State, Type::Frequency, Type::Phase, Type::Amplitude] {
                    self.add_illegal(target, ty, IllegalTypeReason::ForRange)?;
                }
                for node in [start, end, step] {
                    self.add_illegal(node, Type::State, IllegalTypeReason::ForRange)?;
                }
                for ty in [Type::Normal, Type::Time] {
                    self.add_equal(&ty, Reason::ForRange, &[target, start, end, step])?;
                }
                self.loop_vars.push(var.id());
                self.walk(body)
            }
            Command::While {
                condition, body, ..
            } => {
                self.visit_expr(condition)?;
                self.walk(body)
            }
            Command::Parallel { branches, .. } => {
                for branch in branches {
                    self.walk(branch)?;
                }
                Ok(())
            }
            Command::Sync { .. } => Ok(()),
            Command::MemoryStore { value, .. } => self.visit_expr(value).map(|_| ()),
        }
    }

    // ==================== completion ====================

    fn apply_fallbacks(&mut self) -> Result<()> {
        for var in self.loop_vars.clone() {
            let node = Node::Var(var);
            if self.ty(node) == Type::Unknown {
                self.set_type(node, Type::Normal, Fact::Fallback(TypeFallback::Int))?;
            }
        }

        for (node, lit) in self.constants.clone() {
            if self.ty(node) == Type::Unknown {
                let fallback = if lit.is_float() {
                    TypeFallback::Float
                } else {
                    TypeFallback::Int
                };
                self.set_type(node, fallback.target(), Fact::Fallback(fallback))?;
            }
        }

        for (var, any_float) in self.literal_arrays.clone() {
            let node = Node::Elem(var);
            if self.ty(node) == Type::Unknown {
                let fallback = if any_float {
                    TypeFallback::Float
                } else {
                    TypeFallback::Int
                };
                self.set_type(node, fallback.target(), Fact::Fallback(fallback))?;
            }
        }
        Ok(())
    }

    fn into_table(self) -> Result<TypeTable> {
        let mut table = TypeTable::default();

        for node in &self.order {
            let ty = self.ty(*node);
            match (node, ty) {
                (Node::Elem(_), _) => {}
                (_, Type::Unknown) => {
                    return Err(Error::type_conflict(format!(
                        "Could not infer type of {}.",
                        self.label(*node)
                    )))
                }
                (Node::Var(id), Type::Array(_, shape)) => {
                    let elem = self.ty(Node::Elem(*id));
                    if !elem.is_known() {
                        return Err(Error::type_conflict(format!(
                            "Could not infer type of {}.",
                            self.label(*node)
                        )));
                    }
                    table.vars.insert(*id, Type::array(elem, shape));
                }
                (Node::Var(id), ty) => {
                    table.vars.insert(*id, ty);
                }
                (Node::Expr(id), ty) => {
                    table.exprs.insert(*id, ty);
                }
            }
        }
        Ok(table)
    }
}

/// Checks on counted loops that need the final types
fn check_loops(commands: &[Command], table: &TypeTable) -> Result<()> {
    for command in commands {
        if let Command::ForRange {
            var,
            start,
            end,
            step,
            ..
        } = command
        {
            if table.var(var.id()) == Some(&Type::Time) {
                if let Some(start) = start.as_const() {
                    if start.as_f64() < 0.0 {
                        return Err(Error::structural(format!(
                            "ForRange with negative time value ({}) are not allowed",
                            start
                        )));
                    }
                }
                if let Some(end) = end.as_const() {
                    if end.as_f64() == 0.0 {
                        tracing::warn!("End value of 0 will not be included in ForRange.");
                    }
                }
                if let Some(step) = step.as_const() {
                    let cycles = step.as_f64() / CYCLE_TIME;
                    let off = (cycles - cycles.round()).abs();
                    if off > 1e-6 {
                        return Err(Error::structural(format!(
                            "When using time variables define step size as multiple of {:.3} ns. (It is currently off by {:.3} ns.)",
                            CYCLE_TIME * 1e9,
                            (cycles - cycles.floor()) * CYCLE_TIME * 1e9
                        )));
                    }
                }
            }
        }
        for body in command.bodies() {
            check_loops(body, table)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{Pulse, Recording};
    use crate::ProgramBuilder;

    #[test]
    fn test_wait_and_state_conflict() {
        let _serial = crate::program::builder::serial();
        let mut p = ProgramBuilder::new("conflict").unwrap();
        let c = p.cell();
        let x = p.var("x");
        p.wait(c, &x);
        p.record(c, Recording::new(20e-9).state_to(&x));
        let program = p.finish().unwrap();

        let err = TypeInference::infer(&program).unwrap_err();
        assert_eq!(
            err.to_string(),
            "x was of type TIME\n(because it is used as length in wait command)\n\
             but is also used as type STATE\n(because it is used as save_to of recording command)"
        );
    }

    #[test]
    fn test_calculation_propagates_types() {
        let _serial = crate::program::builder::serial();
        let mut p = ProgramBuilder::new("calc").unwrap();
        let c = p.cell();
        let t = p.var("t");
        let u = p.var("u");
        p.assign(&t, 20e-9);
        p.assign(&u, &t + 8e-9);
        p.wait(c, &u);
        let program = p.finish().unwrap();

        let table = TypeInference::infer(&program).unwrap();
        assert_eq!(table.var(t.id()), Some(&Type::Time));
        assert_eq!(table.var(u.id()), Some(&Type::Time));
    }

    #[test]
    fn test_conflict_message_follows_chain() {
        let _serial = crate::program::builder::serial();
        let mut p = ProgramBuilder::new("chain").unwrap();
        let c = p.cell();
        let x = p.var("x");
        let z = p.var("z");
        p.wait(c, &x);
        p.assign(&z, &x + 1);
        p.play(c, &Pulse::new(20e-9).frequency(&z));
        let err = p.finish().and_then(|prog| TypeInference::infer(&prog)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "z was of type TIME\n\
             (because it is used in Assign command with type TIME\n\
             (because (x + 1) is used in + calculation of type TIME\n\
             (because x is used as length in wait command)))\n\
             but is also used as type FREQUENCY\n\
             (because it is used as pulse frequency.)"
        );
    }

    #[test]
    fn test_assign_can_not_target_state() {
        let _serial = crate::program::builder::serial();
        let mut p = ProgramBuilder::new("assign").unwrap();
        let c = p.cell();
        let x = p.var("x");
        let y = p.var("y");
        p.wait(c, &x);
        p.assign(&y, &x);
        p.record(c, Recording::new(20e-9).state_to(&y));
        let err = p.finish().and_then(|prog| TypeInference::infer(&prog)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "y can not have STATE\n\
             (because assign commands can not assign STATE variables)\n\
             but the type is required.\n\
             (because it is used as save_to of recording command)"
        );
    }

    #[test]
    fn test_multiplication_rules() {
        let _serial = crate::program::builder::serial();
        let mut p = ProgramBuilder::new("mult").unwrap();
        let c = p.cell();
        let n = p.var("n");
        let t = p.time_var("t", None);
        p.assign(&n, 3);
        p.wait(c, &t * &n);
        let program = p.finish().unwrap();

        let table = TypeInference::infer(&program).unwrap();
        assert_eq!(table.var(n.id()), Some(&Type::Normal));
    }

    #[test]
    fn test_time_times_time_is_rejected() {
        let _serial = crate::program::builder::serial();
        let mut p = ProgramBuilder::new("mult").unwrap();
        let c = p.cell();
        let a = p.time_var("a", Some(8e-9));
        let b = p.time_var("b", Some(8e-9));
        p.wait(c, &a * &b);
        let err = p.finish().and_then(|prog| TypeInference::infer(&prog)).unwrap_err();
        assert!(matches!(err, Error::TypeConflict { .. }));
        assert!(err.to_string().contains("is used in * calculation of type"));
    }

    #[test]
    fn test_for_range_falls_back_to_normal() {
        let _serial = crate::program::builder::serial();
        let mut p = ProgramBuilder::new("loop").unwrap();
        let c = p.cell();
        let i = p.var("i");
        {
            let mut body = p.for_range(&i, 0, 10, 1).unwrap();
            body.wait(c, 8e-9);
        }
        let program = p.finish().unwrap();

        let table = TypeInference::infer(&program).unwrap();
        assert_eq!(table.var(i.id()), Some(&Type::Normal));
    }

    #[test]
    fn test_for_range_over_state_is_illegal() {
        let _serial = crate::program::builder::serial();
        let mut p = ProgramBuilder::new("loop").unwrap();
        let c = p.cell();
        let s = p.state_var("s");
        {
            let mut body = p.for_range(&s, 0, 1, 1).unwrap();
            body.wait(c, 8e-9);
        }
        let err = p.finish().and_then(|prog| TypeInference::infer(&prog)).unwrap_err();
        assert!(err
            .to_string()
            .contains("ForRanges can only iterate over TIME or NORMAL values"));
    }

    #[test]
    fn test_time_loop_step_must_be_cycle_multiple() {
        let _serial = crate::program::builder::serial();
        let mut p = ProgramBuilder::new("loop").unwrap();
        let c = p.cell();
        let t = p.time_var("t", None);
        {
            let mut body = p.for_range(&t, 0.0, 100e-9, 6e-9).unwrap();
            body.wait(c, &t);
        }
        let err = p.finish().and_then(|prog| TypeInference::infer(&prog)).unwrap_err();
        assert!(matches!(err, Error::StructuralError(_)));
    }

    #[test]
    fn test_float_constant_can_not_be_normal() {
        let _serial = crate::program::builder::serial();
        let mut p = ProgramBuilder::new("float").unwrap();
        let n = p.int_var("n", None);
        p.assign(&n, 1.5);
        let err = p.finish().and_then(|prog| TypeInference::infer(&prog)).unwrap_err();
        assert!(err.to_string().starts_with("1.5 can not have NORMAL"));
    }

    #[test]
    fn test_array_element_type_from_use() {
        let _serial = crate::program::builder::serial();
        let mut p = ProgramBuilder::new("array").unwrap();
        let c = p.cell();
        let freqs = p.array("freqs", vec![10e6, 20e6, 30e6, 40e6, 50e6, 60e6, 70e6, 80e6]);
        let i = p.int_var("i", None);
        {
            let mut body = p.for_range(&i, 0, 8, 1).unwrap();
            body.play(c, &Pulse::new(20e-9).frequency(freqs.at(&i)));
        }
        let program = p.finish().unwrap();

        let table = TypeInference::infer(&program).unwrap();
        assert_eq!(
            table.var(freqs.id()),
            Some(&Type::array(Type::Frequency, Shape::vector(8)))
        );
    }

    #[test]
    fn test_array_index_must_be_normal() {
        let _serial = crate::program::builder::serial();
        let mut p = ProgramBuilder::new("array").unwrap();
        let c = p.cell();
        let freqs = p.array("freqs", vec![10e6, 20e6]);
        let f = p.freq_var("f", Some(10e6));
        p.play(c, &Pulse::new(20e-9).frequency(freqs.at(&f)));
        let err = p.finish().and_then(|prog| TypeInference::infer(&prog)).unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperation(_)));
    }

    #[test]
    fn test_unused_variable_is_reported() {
        let _serial = crate::program::builder::serial();
        let mut p = ProgramBuilder::new("unused").unwrap();
        let _x = p.var("x");
        let err = p.finish().and_then(|prog| TypeInference::infer(&prog)).unwrap_err();
        assert_eq!(err.to_string(), "Could not infer type of x.");
    }
}
