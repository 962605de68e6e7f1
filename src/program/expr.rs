//! Immutable expression trees
//!
//! Expressions are cheap to clone (`Arc` shared nodes). Each node carries an
//! [`ExprId`] so later passes can attach inferred types to it; clones share the
//! id, structurally equal but separately built expressions do not.

use super::Cell;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::ops::{Add, BitAnd, BitOr, BitXor, Mul, Not, Shl, Shr, Sub};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_EXPR_ID: AtomicU64 = AtomicU64::new(0);

/// Identity of one expression node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(u64);

impl ExprId {
    fn fresh() -> Self {
        ExprId(NEXT_EXPR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Identity of a program variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VarId(pub u32);

/// Handle to a declared variable
#[derive(Debug, Clone)]
pub struct Var {
    id: VarId,
    name: Arc<str>,
}

impl Var {
    pub(crate) fn new(id: VarId, name: &str) -> Self {
        Self {
            id,
            name: Arc::from(name),
        }
    }

    pub fn id(&self) -> VarId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Element `index` of an array variable
    pub fn at(&self, index: impl Into<Expr>) -> Expr {
        Expr::new(ExprKind::Index {
            array: self.clone(),
            index: index.into(),
        })
    }

    /// Reference to this variable as an expression
    pub fn expr(&self) -> Expr {
        Expr::from(self)
    }
}

impl PartialEq for Var {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Var {}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Literal constant as written by the user
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Int(i64),
    Float(f64),
}

impl Literal {
    pub fn as_f64(&self) -> f64 {
        match self {
            Literal::Int(i) => *i as f64,
            Literal::Float(f) => *f,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Literal::Float(_))
    }

    /// Whether the literal could be a measured state
    pub fn is_state_value(&self) -> bool {
        matches!(self, Literal::Int(0) | Literal::Int(1))
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Int(i) => write!(f, "{}", i),
            Literal::Float(v) => {
                let abs = v.abs();
                if abs != 0.0 && !(1e-3..1e6).contains(&abs) {
                    write!(f, "{:e}", v)
                } else {
                    write!(f, "{}", v)
                }
            }
        }
    }
}

impl From<i64> for Literal {
    fn from(v: i64) -> Self {
        Literal::Int(v)
    }
}

impl From<i32> for Literal {
    fn from(v: i32) -> Self {
        Literal::Int(v as i64)
    }
}

impl From<f64> for Literal {
    fn from(v: f64) -> Self {
        Literal::Float(v)
    }
}

/// Arithmetic and bitwise operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::And => "&",
            BinOp::Or => "|",
            BinOp::Xor => "^",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
        }
    }

    pub fn is_commutative(&self) -> bool {
        matches!(
            self,
            BinOp::Add | BinOp::Mul | BinOp::And | BinOp::Or | BinOp::Xor
        )
    }

    fn fold(&self, lhs: Literal, rhs: Literal) -> Option<Literal> {
        use Literal::{Float, Int};
        Some(match (self, lhs, rhs) {
            (BinOp::Add, Int(a), Int(b)) => Int(a.wrapping_add(b)),
            (BinOp::Sub, Int(a), Int(b)) => Int(a.wrapping_sub(b)),
            (BinOp::Mul, Int(a), Int(b)) => Int(a.wrapping_mul(b)),
            (BinOp::And, Int(a), Int(b)) => Int(a & b),
            (BinOp::Or, Int(a), Int(b)) => Int(a | b),
            (BinOp::Xor, Int(a), Int(b)) => Int(a ^ b),
            (BinOp::Shl, Int(a), Int(b)) if (0..64).contains(&b) => Int(a << b),
            (BinOp::Shr, Int(a), Int(b)) if (0..64).contains(&b) => Int(a >> b),
            (BinOp::Add, a, b) if a.is_float() || b.is_float() => Float(a.as_f64() + b.as_f64()),
            (BinOp::Sub, a, b) if a.is_float() || b.is_float() => Float(a.as_f64() - b.as_f64()),
            (BinOp::Mul, a, b) if a.is_float() || b.is_float() => Float(a.as_f64() * b.as_f64()),
            _ => return None,
        })
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }

    /// The comparison that holds exactly when this one does not
    pub fn invert(&self) -> Self {
        match self {
            CmpOp::Eq => CmpOp::Ne,
            CmpOp::Ne => CmpOp::Eq,
            CmpOp::Lt => CmpOp::Ge,
            CmpOp::Ge => CmpOp::Lt,
            CmpOp::Gt => CmpOp::Le,
            CmpOp::Le => CmpOp::Gt,
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// One constant step of a folded property transform
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyOp {
    pub op: BinOp,
    pub operand: Literal,
    /// The constant was the left operand
    pub constant_first: bool,
}

/// Deferred lookup of a cell parameter, resolved against a parameter table
#[derive(Debug, Clone, PartialEq)]
pub struct CellProperty {
    pub cell: Cell,
    pub name: String,
    pub ops: Vec<PropertyOp>,
}

impl CellProperty {
    pub fn new(cell: Cell, name: impl Into<String>) -> Self {
        Self {
            cell,
            name: name.into(),
            ops: Vec::new(),
        }
    }

    /// Apply the folded transform to a looked-up value
    pub fn apply(&self, value: f64) -> f64 {
        self.ops.iter().fold(value, |acc, step| {
            let k = step.operand.as_f64();
            match (step.op, step.constant_first) {
                (BinOp::Add, _) => acc + k,
                (BinOp::Mul, _) => acc * k,
                (BinOp::Sub, false) => acc - k,
                (BinOp::Sub, true) => k - acc,
                // only + - * are folded into properties
                _ => acc,
            }
        })
    }

    /// Transform rendered with `x` standing for the looked-up value
    pub fn opcode(&self) -> String {
        let mut code = "x".to_string();
        for (i, step) in self.ops.iter().enumerate() {
            if i > 0 {
                code = format!("({})", code);
            }
            code = if step.constant_first {
                format!("{} {} {}", step.operand, step.op, code)
            } else {
                format!("{} {} {}", code, step.op, step.operand)
            };
        }
        code
    }
}

/// Expression node kinds
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Const(Literal),
    Var(Var),
    Binary { op: BinOp, lhs: Expr, rhs: Expr },
    Not(Expr),
    Compare { op: CmpOp, lhs: Expr, rhs: Expr },
    Index { array: Var, index: Expr },
    Property(CellProperty),
}

/// Immutable, shareable expression tree
#[derive(Debug, Clone)]
pub struct Expr {
    id: ExprId,
    kind: Arc<ExprKind>,
}

impl Expr {
    fn new(kind: ExprKind) -> Self {
        Self {
            id: ExprId::fresh(),
            kind: Arc::new(kind),
        }
    }

    pub fn id(&self) -> ExprId {
        self.id
    }

    pub fn kind(&self) -> &ExprKind {
        &self.kind
    }

    pub fn constant(value: impl Into<Literal>) -> Self {
        Expr::new(ExprKind::Const(value.into()))
    }

    pub fn property(cell: Cell, name: impl Into<String>) -> Self {
        Expr::new(ExprKind::Property(CellProperty::new(cell, name)))
    }

    /// Same node identity with a concrete literal; used when resolving properties
    pub(crate) fn resolved(&self, value: Literal) -> Self {
        Self {
            id: self.id,
            kind: Arc::new(ExprKind::Const(value)),
        }
    }

    /// Same node identity with rewritten children
    pub(crate) fn with_kind(&self, kind: ExprKind) -> Self {
        Self {
            id: self.id,
            kind: Arc::new(kind),
        }
    }

    /// Binary operation with constant folding
    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        match (lhs.kind(), rhs.kind()) {
            (ExprKind::Const(a), ExprKind::Const(b)) => {
                if let Some(folded) = op.fold(*a, *b) {
                    return Expr::constant(folded);
                }
            }
            (ExprKind::Property(prop), ExprKind::Const(k))
                if matches!(op, BinOp::Add | BinOp::Sub | BinOp::Mul) =>
            {
                let mut prop = prop.clone();
                prop.ops.push(PropertyOp {
                    op,
                    operand: *k,
                    constant_first: false,
                });
                return Expr::new(ExprKind::Property(prop));
            }
            (ExprKind::Const(k), ExprKind::Property(prop))
                if matches!(op, BinOp::Add | BinOp::Sub | BinOp::Mul) =>
            {
                let mut prop = prop.clone();
                prop.ops.push(PropertyOp {
                    op,
                    operand: *k,
                    constant_first: true,
                });
                return Expr::new(ExprKind::Property(prop));
            }
            _ => {}
        }
        Expr::new(ExprKind::Binary { op, lhs, rhs })
    }

    pub fn compare(op: CmpOp, lhs: impl Into<Expr>, rhs: impl Into<Expr>) -> Self {
        Expr::new(ExprKind::Compare {
            op,
            lhs: lhs.into(),
            rhs: rhs.into(),
        })
    }

    pub fn equals(&self, rhs: impl Into<Expr>) -> Expr {
        Expr::compare(CmpOp::Eq, self.clone(), rhs)
    }

    pub fn not_equals(&self, rhs: impl Into<Expr>) -> Expr {
        Expr::compare(CmpOp::Ne, self.clone(), rhs)
    }

    pub fn lt(&self, rhs: impl Into<Expr>) -> Expr {
        Expr::compare(CmpOp::Lt, self.clone(), rhs)
    }

    pub fn le(&self, rhs: impl Into<Expr>) -> Expr {
        Expr::compare(CmpOp::Le, self.clone(), rhs)
    }

    pub fn gt(&self, rhs: impl Into<Expr>) -> Expr {
        Expr::compare(CmpOp::Gt, self.clone(), rhs)
    }

    pub fn ge(&self, rhs: impl Into<Expr>) -> Expr {
        Expr::compare(CmpOp::Ge, self.clone(), rhs)
    }

    pub fn as_const(&self) -> Option<Literal> {
        match self.kind() {
            ExprKind::Const(lit) => Some(*lit),
            _ => None,
        }
    }

    pub fn as_var(&self) -> Option<&Var> {
        match self.kind() {
            ExprKind::Var(var) => Some(var),
            _ => None,
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(self.kind(), ExprKind::Compare { .. })
    }

    /// Constant or resolved/unresolved property: known before the program runs
    pub fn is_static(&self) -> bool {
        matches!(self.kind(), ExprKind::Const(_) | ExprKind::Property(_))
    }

    /// Every variable read by this expression
    pub fn variables(&self) -> BTreeSet<VarId> {
        let mut vars = BTreeSet::new();
        self.collect_variables(&mut vars);
        vars
    }

    fn collect_variables(&self, out: &mut BTreeSet<VarId>) {
        match self.kind() {
            ExprKind::Const(_) | ExprKind::Property(_) => {}
            ExprKind::Var(var) => {
                out.insert(var.id());
            }
            ExprKind::Binary { lhs, rhs, .. } | ExprKind::Compare { lhs, rhs, .. } => {
                lhs.collect_variables(out);
                rhs.collect_variables(out);
            }
            ExprKind::Not(inner) => inner.collect_variables(out),
            ExprKind::Index { array, index } => {
                out.insert(array.id());
                index.collect_variables(out);
            }
        }
    }

    /// Every cell property referenced by this expression
    pub fn properties(&self) -> Vec<&CellProperty> {
        let mut props = Vec::new();
        self.collect_properties(&mut props);
        props
    }

    fn collect_properties<'a>(&'a self, out: &mut Vec<&'a CellProperty>) {
        match self.kind() {
            ExprKind::Property(prop) => out.push(prop),
            ExprKind::Binary { lhs, rhs, .. } | ExprKind::Compare { lhs, rhs, .. } => {
                lhs.collect_properties(out);
                rhs.collect_properties(out);
            }
            ExprKind::Not(inner) => inner.collect_properties(out),
            ExprKind::Index { index, .. } => index.collect_properties(out),
            ExprKind::Const(_) | ExprKind::Var(_) => {}
        }
    }
}

/// Structural equality; node identities are ignored
impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.kind, &other.kind) || self.kind == other.kind
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            ExprKind::Const(lit) => write!(f, "{}", lit),
            ExprKind::Var(var) => write!(f, "{}", var),
            ExprKind::Binary { op, lhs, rhs } => write!(f, "({} {} {})", lhs, op, rhs),
            ExprKind::Not(inner) => write!(f, "~{}", inner),
            ExprKind::Compare { op, lhs, rhs } => write!(f, "{} {} {}", lhs, op, rhs),
            ExprKind::Index { array, index } => write!(f, "{}[{}]", array, index),
            ExprKind::Property(prop) => {
                if prop.ops.is_empty() {
                    write!(f, "q{}.{}", prop.cell.index(), prop.name)
                } else {
                    write!(
                        f,
                        "q{}.{}{{{}}}",
                        prop.cell.index(),
                        prop.name,
                        prop.opcode()
                    )
                }
            }
        }
    }
}

impl From<i64> for Expr {
    fn from(v: i64) -> Self {
        Expr::constant(v)
    }
}

impl From<i32> for Expr {
    fn from(v: i32) -> Self {
        Expr::constant(v)
    }
}

impl From<f64> for Expr {
    fn from(v: f64) -> Self {
        Expr::constant(v)
    }
}

impl From<Literal> for Expr {
    fn from(v: Literal) -> Self {
        Expr::constant(v)
    }
}

impl From<&Var> for Expr {
    fn from(var: &Var) -> Self {
        Expr::new(ExprKind::Var(var.clone()))
    }
}

impl From<Var> for Expr {
    fn from(var: Var) -> Self {
        Expr::new(ExprKind::Var(var))
    }
}

impl From<&Expr> for Expr {
    fn from(expr: &Expr) -> Self {
        expr.clone()
    }
}

macro_rules! impl_binary_operator {
    ($trait:ident, $method:ident, $op:expr) => {
        impl<R: Into<Expr>> $trait<R> for Expr {
            type Output = Expr;
            fn $method(self, rhs: R) -> Expr {
                Expr::binary($op, self, rhs.into())
            }
        }

        impl<R: Into<Expr>> $trait<R> for &Expr {
            type Output = Expr;
            fn $method(self, rhs: R) -> Expr {
                Expr::binary($op, self.clone(), rhs.into())
            }
        }

        impl<R: Into<Expr>> $trait<R> for &Var {
            type Output = Expr;
            fn $method(self, rhs: R) -> Expr {
                Expr::binary($op, Expr::from(self), rhs.into())
            }
        }
    };
}

impl_binary_operator!(Add, add, BinOp::Add);
impl_binary_operator!(Sub, sub, BinOp::Sub);
impl_binary_operator!(Mul, mul, BinOp::Mul);
impl_binary_operator!(BitAnd, bitand, BinOp::And);
impl_binary_operator!(BitOr, bitor, BinOp::Or);
impl_binary_operator!(BitXor, bitxor, BinOp::Xor);
impl_binary_operator!(Shl, shl, BinOp::Shl);
impl_binary_operator!(Shr, shr, BinOp::Shr);

impl Not for Expr {
    type Output = Expr;
    fn not(self) -> Expr {
        Expr::new(ExprKind::Not(self))
    }
}

impl Not for &Var {
    type Output = Expr;
    fn not(self) -> Expr {
        Expr::new(ExprKind::Not(Expr::from(self)))
    }
}
