//! # Operation Tags
//!
//! The closed set of semantic operations a lazy buffer can carry, as one
//! tagged variant with exhaustive matches. Meta ops mark realization
//! boundaries and data movement; unary/binary/ternary ops are elementwise;
//! reduce ops collapse axes.
//!
//! The finite maps the scheduler consults live here too: the
//! reduce-to-ALU map (`ReduceOp::alu`) and the set of ops that are unsafe
//! to evaluate under value-changing padding (`Op::unsafe_when_padded`).

use std::fmt;

/// Realization markers and data movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaOp {
    Const,
    Copy,
    Empty,
    Custom,
    View,
    Assign,
    Contiguous,
}

/// Elementwise single-source ops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Cast,
    Bitcast,
    Neg,
    Exp2,
    Log2,
    Sin,
    Sqrt,
    Recip,
}

/// Elementwise two-source ops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Max,
    CmpLt,
    CmpNe,
    Xor,
    And,
    Or,
}

/// Elementwise three-source ops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TernaryOp {
    Where,
    MulAcc,
}

/// Axis-collapsing ops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Max,
}

impl ReduceOp {
    /// The ALU op a reduce accumulates with
    pub fn alu(self) -> BinaryOp {
        match self {
            ReduceOp::Sum => BinaryOp::Add,
            ReduceOp::Max => BinaryOp::Max,
        }
    }
}

/// The semantic operation tag of a lazy buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Meta(MetaOp),
    Unary(UnaryOp),
    Binary(BinaryOp),
    Ternary(TernaryOp),
    Reduce(ReduceOp),
}

impl Op {
    pub fn is_meta(self) -> bool {
        matches!(self, Op::Meta(_))
    }

    pub fn is_reduce(self) -> bool {
        matches!(self, Op::Reduce(_))
    }

    pub fn reduce_op(self) -> Option<ReduceOp> {
        match self {
            Op::Reduce(r) => Some(r),
            _ => None,
        }
    }

    /// Ops whose value changes when their inputs are padded with zeros.
    ///
    /// A masked load returns 0 outside the valid region; these ops map 0
    /// to something non-zero (or undefined), so a pad cannot be fused
    /// through them.
    pub fn unsafe_when_padded(self) -> bool {
        matches!(
            self,
            Op::Binary(BinaryOp::Div)
                | Op::Binary(BinaryOp::CmpLt)
                | Op::Binary(BinaryOp::CmpNe)
                | Op::Unary(UnaryOp::Log2)
                | Op::Unary(UnaryOp::Exp2)
                | Op::Unary(UnaryOp::Recip)
        )
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Meta(m) => write!(f, "{m:?}"),
            Op::Unary(u) => write!(f, "{u:?}"),
            Op::Binary(b) => write!(f, "{b:?}"),
            Op::Ternary(t) => write!(f, "{t:?}"),
            Op::Reduce(r) => write!(f, "{r:?}"),
        }
    }
}
