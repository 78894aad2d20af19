//! # Kernel AST Nodes
//!
//! A lowered kernel is a DAG of immutable [`UOp`] nodes rooted at a `Sink`
//! of `Store`s (or a single `Ext` meta node). Nodes compare and hash
//! structurally over `(op, dtype, src, arg)`, with a pointer fast path, so
//! identical subtrees collapse under hash-consing within a kernel.

pub mod pattern;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::rc::Rc;

use crate::dtype::DType;
use crate::ops::{BinaryOp, MetaOp, Op};
use crate::shape::ShapeTracker;
use crate::symbolic::Variable;

/// The closed set of kernel AST node kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UOpKind {
    Sink,
    Store,
    Load,
    Const,
    DefineGlobal,
    Alu,
    Cast,
    Bitcast,
    ReduceAxis,
    Swizzle,
    ShapeTracker,
    Ext,
}

impl UOpKind {
    /// Buffer ops carry a shape-tracker operand and so define their own
    /// shape
    pub fn defines_shape(self) -> bool {
        matches!(self, UOpKind::Load | UOpKind::Store | UOpKind::Const)
    }
}

/// A constant payload. Floats compare and hash by bit pattern.
#[derive(Debug, Clone)]
pub enum ConstValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    /// A symbolic variable, possibly bound
    Var(Variable),
}

impl PartialEq for ConstValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ConstValue::Int(a), ConstValue::Int(b)) => a == b,
            (ConstValue::Float(a), ConstValue::Float(b)) => a.to_bits() == b.to_bits(),
            (ConstValue::Bool(a), ConstValue::Bool(b)) => a == b,
            (ConstValue::Var(a), ConstValue::Var(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ConstValue {}

impl Hash for ConstValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            ConstValue::Int(i) => (0u8, i).hash(state),
            ConstValue::Float(f) => (1u8, f.to_bits()).hash(state),
            ConstValue::Bool(b) => (2u8, b).hash(state),
            ConstValue::Var(v) => (3u8, v).hash(state),
        }
    }
}

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstValue::Int(i) => write!(f, "{i}"),
            ConstValue::Float(x) => write!(f, "{x}"),
            ConstValue::Bool(b) => write!(f, "{b}"),
            ConstValue::Var(v) => write!(f, "{v}"),
        }
    }
}

/// Payload of an `Ext` meta item, opaque to the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExtArg {
    None,
    /// Copy size in bytes
    Bytes(i64),
    /// Custom-kernel payload
    Custom(String),
}

/// Node argument payload
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UArg {
    None,
    /// Elementwise op kind for `Alu` nodes
    Alu(Op),
    /// `(accumulator op, reduced axes)` for `ReduceAxis` nodes
    Reduce(BinaryOp, Vec<usize>),
    /// Position into the kernel's `outputs ++ inputs` buffer list
    Buffer(usize),
    Const(ConstValue),
    Tracker(ShapeTracker),
    /// Meta-op schedule items carry the op and its opaque payload
    Ext(MetaOp, ExtArg),
}

#[derive(Debug, PartialEq, Eq, Hash)]
pub struct UOpNode {
    pub op: UOpKind,
    pub dtype: Option<DType>,
    pub src: Vec<UOp>,
    pub arg: UArg,
}

/// A shared, immutable kernel AST node
#[derive(Debug, Clone, Eq)]
pub struct UOp(Rc<UOpNode>);

impl UOp {
    pub fn new(op: UOpKind, dtype: Option<DType>, src: Vec<UOp>, arg: UArg) -> UOp {
        UOp(Rc::new(UOpNode {
            op,
            dtype,
            src,
            arg,
        }))
    }

    /// The shape-tracker operand of a buffer op
    pub fn st_arg(&self) -> &ShapeTracker {
        debug_assert!(self.op.defines_shape());
        let idx = if self.op == UOpKind::Const { 0 } else { 1 };
        match &self.src[idx].arg {
            UArg::Tracker(st) => st,
            other => panic!("buffer op carries {other:?} instead of a shape-tracker"),
        }
    }

    /// All transitive source nodes: direct sources first, then each
    /// source's ancestors, deduplicated in first-visit order.
    pub fn parents(&self) -> Vec<UOp> {
        fn walk(
            u: &UOp,
            out: &mut Vec<UOp>,
            seen: &mut std::collections::HashSet<UOp>,
            done: &mut std::collections::HashSet<UOp>,
        ) {
            for x in &u.src {
                if seen.insert(x.clone()) {
                    out.push(x.clone());
                }
            }
            for x in &u.src {
                if done.insert(x.clone()) {
                    walk(x, out, seen, done);
                }
            }
        }
        let mut out = Vec::new();
        walk(
            self,
            &mut out,
            &mut std::collections::HashSet::new(),
            &mut std::collections::HashSet::new(),
        );
        out
    }

    /// `parents()` plus this node, self last
    pub fn sparents(&self) -> Vec<UOp> {
        let mut out = self.parents();
        if !out.contains(self) {
            out.push(self.clone());
        }
        out
    }
}

impl Deref for UOp {
    type Target = UOpNode;

    fn deref(&self) -> &UOpNode {
        &self.0
    }
}

impl PartialEq for UOp {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0) || self.0 == other.0
    }
}

impl Hash for UOp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl fmt::Display for UOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op {
            UOpKind::ShapeTracker => {
                if let UArg::Tracker(st) = &self.arg {
                    return write!(f, "{st}");
                }
                write!(f, "ST(?)")
            }
            UOpKind::DefineGlobal => {
                if let UArg::Buffer(i) = self.arg {
                    return write!(f, "g{i}");
                }
                write!(f, "g?")
            }
            UOpKind::Const => {
                if let UArg::Const(c) = &self.arg {
                    return write!(f, "CONST({}, {c})", self.src[0]);
                }
                write!(f, "CONST(?)")
            }
            _ => {
                write!(f, "{:?}", self.op)?;
                match &self.arg {
                    UArg::Alu(op) => write!(f, "<{op}>")?,
                    UArg::Reduce(alu, axes) => write!(f, "<{alu:?}, {axes:?}>")?,
                    UArg::Ext(m, _) => write!(f, "<{m:?}>")?,
                    _ => {}
                }
                write!(f, "(")?;
                for (i, s) in self.src.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{s}")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::ScalarType;

    fn global(idx: usize) -> UOp {
        UOp::new(
            UOpKind::DefineGlobal,
            Some(DType::Ptr(ScalarType::Float32)),
            vec![],
            UArg::Buffer(idx),
        )
    }

    fn load(idx: usize, dims: &[i64]) -> UOp {
        UOp::new(
            UOpKind::Load,
            Some(DType::FLOAT32),
            vec![global(idx), ShapeTracker::from_dims(dims).to_uop()],
            UArg::None,
        )
    }

    #[test]
    fn test_structural_equality() {
        let a = load(1, &[4, 4]);
        let b = load(1, &[4, 4]);
        let c = load(2, &[4, 4]);
        assert_eq!(a, b);
        assert_ne!(a, c);

        use std::collections::HashSet;
        let set: HashSet<UOp> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_st_arg() {
        let l = load(0, &[8, 16]);
        assert_eq!(l.st_arg().size(), 128);
    }

    #[test]
    fn test_sparents_self_last() {
        let a = load(0, &[2]);
        let b = load(1, &[2]);
        let alu = UOp::new(
            UOpKind::Alu,
            Some(DType::FLOAT32),
            vec![a.clone(), b.clone()],
            UArg::Alu(Op::Binary(BinaryOp::Add)),
        );
        let sp = alu.sparents();
        assert_eq!(sp.last().unwrap(), &alu);
        assert!(sp.contains(&a) && sp.contains(&b));
    }

    #[test]
    fn test_shared_subtree_dedup() {
        let a = load(0, &[2]);
        let double = UOp::new(
            UOpKind::Alu,
            Some(DType::FLOAT32),
            vec![a.clone(), a.clone()],
            UArg::Alu(Op::Binary(BinaryOp::Add)),
        );
        let count = double.parents().iter().filter(|p| **p == a).count();
        assert_eq!(count, 1);
    }
}
