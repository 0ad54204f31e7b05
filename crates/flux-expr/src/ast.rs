//! Expression AST (spec §4.C): the node set filters and projections compile
//! down to. The surface query-language parser that produces these trees is
//! out of scope; this crate only defines the tree shape and evaluates it.

use flux_core::diagnostics::Location;
use flux_core::value::Value;

/// A dot-separated field reference, e.g. `src.ip` becomes
/// `FieldPath(vec!["src", "ip"])`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath(pub Vec<String>);

impl FieldPath {
    pub fn new(segments: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn single(name: impl Into<String>) -> Self {
        Self(vec![name.into()])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Match,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }
}

/// The expression AST node set from spec §4.C: literal, field reference,
/// unary/binary operators, function call, and a sequential-steps expression.
/// This is value-level sequencing only (think a chain of scalar transforms),
/// distinct from an operator-level sub-pipeline: those are built from actual
/// `Operator` instances composed in `flux-exec` (the `fork` operator's
/// branches), not from this AST.
#[derive(Debug, Clone)]
pub enum ExprKind {
    Literal(Value),
    Field(FieldPath),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    /// A sequence of sub-expressions, each evaluated independently against
    /// the same row slice; the pipeline's value is its last step's result.
    /// At least one step is required.
    Pipeline(Vec<Expr>),
}

/// An AST node paired with its source location, so evaluation can pin
/// diagnostics (spec §4.C: "null + warning diagnostic pinned to the
/// expression's source location").
#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub location: Option<Location>,
}

impl Expr {
    pub fn new(kind: ExprKind) -> Self {
        Self { kind, location: None }
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    pub fn literal(value: Value) -> Self {
        Self::new(ExprKind::Literal(value))
    }

    pub fn field(path: FieldPath) -> Self {
        Self::new(ExprKind::Field(path))
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Self {
        Self::new(ExprKind::Unary(op, Box::new(operand)))
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Self::new(ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Self::new(ExprKind::Call(name.into(), args))
    }
}
