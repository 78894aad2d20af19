//! # Symbolic Dimensions
//!
//! Shapes may carry bound symbolic variables (a variable plus the concrete
//! value it is bound to for this schedule). Emitting a kernel strips the
//! bindings: the shape-tracker keeps the bare variable and the scheduler
//! collects the `(variable, value)` pairs into the `var_vals` map returned
//! next to the schedule.

use std::fmt;

/// A named integer variable with an inclusive range.
///
/// Equality and ordering ignore the binding: a bound variable and its
/// unbound form are the same variable.
#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub min: i64,
    pub max: i64,
    /// Concrete value this variable is bound to, if any
    pub val: Option<i64>,
}

impl Variable {
    pub fn new(name: impl Into<String>, min: i64, max: i64) -> Self {
        Variable {
            name: name.into(),
            min,
            max,
            val: None,
        }
    }

    /// Bind the variable to a concrete value
    pub fn bind(mut self, val: i64) -> Self {
        debug_assert!(self.min <= val && val <= self.max);
        self.val = Some(val);
        self
    }

    /// Strip the binding, returning the unbound variable and the value it
    /// was bound to
    pub fn unbind(&self) -> (Variable, Option<i64>) {
        let mut v = self.clone();
        let val = v.val.take();
        (v, val)
    }
}

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.min == other.min && self.max == other.max
    }
}

impl Eq for Variable {}

impl PartialOrd for Variable {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Variable {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.name, self.min, self.max).cmp(&(&other.name, other.min, other.max))
    }
}

impl std::hash::Hash for Variable {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.min.hash(state);
        self.max.hash(state);
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.val {
            Some(v) => write!(f, "{}[{}..{}]={v}", self.name, self.min, self.max),
            None => write!(f, "{}[{}..{}]", self.name, self.min, self.max),
        }
    }
}

/// A shape dimension: a concrete integer or a symbolic variable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SInt {
    Const(i64),
    Var(Variable),
}

impl SInt {
    /// Concrete value: the integer itself, a bound variable's value, or
    /// the variable's upper bound when unbound.
    pub fn value(&self) -> i64 {
        match self {
            SInt::Const(c) => *c,
            SInt::Var(v) => v.val.unwrap_or(v.max),
        }
    }

    pub fn as_const(&self) -> Option<i64> {
        match self {
            SInt::Const(c) => Some(*c),
            SInt::Var(_) => None,
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(self, SInt::Const(_))
    }

    /// Strip a binding if present, reporting the `(variable, value)` pair
    pub fn unbind(&self) -> (SInt, Option<(Variable, i64)>) {
        match self {
            SInt::Const(_) => (self.clone(), None),
            SInt::Var(v) => {
                let (unbound, val) = v.unbind();
                let pair = val.map(|x| (unbound.clone(), x));
                (SInt::Var(unbound), pair)
            }
        }
    }
}

impl From<i64> for SInt {
    fn from(c: i64) -> Self {
        SInt::Const(c)
    }
}

impl fmt::Display for SInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SInt::Const(c) => write!(f, "{c}"),
            SInt::Var(v) => write!(f, "{v}"),
        }
    }
}

/// True when every dimension is a concrete integer
pub fn all_int(shape: &[SInt]) -> bool {
    shape.iter().all(SInt::is_const)
}

/// Product of the concrete values of a shape
pub fn prod(shape: &[SInt]) -> i64 {
    shape.iter().map(SInt::value).product()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_unbind_roundtrip() {
        let v = Variable::new("i", 1, 10).bind(4);
        let (unbound, pair) = SInt::Var(v.clone()).unbind();
        assert_eq!(pair, Some((Variable::new("i", 1, 10), 4)));
        // unbinding twice is a no-op
        let (again, pair2) = unbound.unbind();
        assert_eq!(again, unbound);
        assert_eq!(pair2, None);
    }

    #[test]
    fn test_equality_ignores_binding() {
        let a = Variable::new("n", 0, 16);
        let b = Variable::new("n", 0, 16).bind(8);
        assert_eq!(a, b);
        assert_eq!(SInt::Var(a), SInt::Var(b));
    }

    #[test]
    fn test_value_and_prod() {
        let shape = vec![
            SInt::Const(4),
            SInt::Var(Variable::new("n", 1, 32).bind(8)),
        ];
        assert!(!all_int(&shape));
        assert_eq!(prod(&shape), 32);
    }
}
