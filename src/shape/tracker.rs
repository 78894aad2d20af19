//! Composable stacks of views. Composition is written `&inner + &outer`:
//! the right-hand tracker's index space reads through the left-hand one.

use std::fmt;
use std::ops::Add;

use crate::shape::view::View;
use crate::symbolic::{SInt, Variable};
use crate::uop::{UArg, UOp, UOpKind};

/// An ordered stack of [`View`]s, innermost (closest to the buffer) first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShapeTracker {
    pub views: Vec<View>,
}

impl ShapeTracker {
    pub fn new(views: Vec<View>) -> ShapeTracker {
        debug_assert!(!views.is_empty());
        ShapeTracker { views }
    }

    /// Identity tracker over a shape
    pub fn from_shape(shape: Vec<SInt>) -> ShapeTracker {
        ShapeTracker {
            views: vec![View::from_shape(shape)],
        }
    }

    /// Identity tracker over a concrete shape
    pub fn from_dims(dims: &[i64]) -> ShapeTracker {
        ShapeTracker::from_shape(dims.iter().map(|&d| SInt::Const(d)).collect())
    }

    /// The logical (outermost) shape
    pub fn shape(&self) -> &[SInt] {
        &self.views.last().expect("tracker has at least one view").shape
    }

    /// Number of logical elements
    pub fn size(&self) -> i64 {
        self.views.last().expect("tracker has at least one view").size()
    }

    /// A single identity view
    pub fn contiguous(&self) -> bool {
        self.views.len() == 1 && self.views[0].contiguous
    }

    /// The shape after reducing `axes` (reduced dims kept as 1)
    pub fn reduce(&self, axes: &[usize]) -> Vec<SInt> {
        self.shape()
            .iter()
            .enumerate()
            .map(|(i, d)| {
                if axes.contains(&i) {
                    SInt::Const(1)
                } else {
                    d.clone()
                }
            })
            .collect()
    }

    fn merge_pair(inner: &View, outer: &View) -> Option<View> {
        if outer.contiguous && outer.shape == inner.shape {
            return Some(inner.clone());
        }
        if inner.contiguous {
            return Some(outer.clone());
        }
        // a contiguous outer is a pure re-dimensioning of the inner view
        if outer.contiguous {
            return inner.reshape(&outer.shape);
        }
        None
    }

    /// Merge adjacent views wherever the composition collapses to one
    /// layout. Idempotent.
    pub fn simplify(&self) -> ShapeTracker {
        let mut views = self.views.clone();
        let mut i = 0;
        while i + 1 < views.len() {
            if let Some(merged) = Self::merge_pair(&views[i], &views[i + 1]) {
                views[i] = merged;
                views.remove(i + 1);
                i = i.saturating_sub(1);
            } else {
                i += 1;
            }
        }
        ShapeTracker { views }
    }

    /// Strip symbolic bindings from every dimension, reporting the
    /// `(variable, value)` pairs that were bound.
    pub fn unbind(&self) -> (ShapeTracker, Vec<(Variable, i64)>) {
        let mut pairs: Vec<(Variable, i64)> = Vec::new();
        let views = self
            .views
            .iter()
            .map(|v| {
                let shape = v
                    .shape
                    .iter()
                    .map(|d| {
                        let (unbound, pair) = d.unbind();
                        if let Some(p) = pair {
                            if !pairs.contains(&p) {
                                pairs.push(p);
                            }
                        }
                        unbound
                    })
                    .collect();
                View {
                    shape,
                    strides: v.strides.clone(),
                    offset: v.offset,
                    mask: v.mask.clone(),
                    contiguous: v.contiguous,
                }
            })
            .collect();
        (ShapeTracker { views }, pairs)
    }

    /// Bound `(variable, value)` pairs without stripping them
    pub fn var_vals(&self) -> Vec<(Variable, i64)> {
        let mut pairs = Vec::new();
        for v in &self.views {
            for d in &v.shape {
                if let SInt::Var(var) = d {
                    if let Some(val) = var.val {
                        let (unbound, _) = var.unbind();
                        if !pairs.contains(&(unbound.clone(), val)) {
                            pairs.push((unbound, val));
                        }
                    }
                }
            }
        }
        pairs
    }

    /// Per-axis buffer strides, where a single stride exists. Masked axes
    /// report `None` unless `ignore_valid`.
    pub fn real_strides(&self, ignore_valid: bool) -> Vec<Option<i64>> {
        let st = if self.views.len() == 1 {
            self.clone()
        } else {
            self.simplify()
        };
        if st.views.len() != 1 {
            return vec![None; self.shape().len()];
        }
        let v = &st.views[0];
        v.shape
            .iter()
            .enumerate()
            .map(|(i, d)| {
                if d.value() == 1 {
                    return Some(0);
                }
                if !ignore_valid {
                    if let Some(m) = &v.mask {
                        if m[i] != (0, d.value()) {
                            return None;
                        }
                    }
                }
                Some(v.strides[i])
            })
            .collect()
    }

    /// Axes addressed with stride 1
    pub fn unit_stride_axes(&self) -> Vec<usize> {
        self.real_strides(true)
            .iter()
            .enumerate()
            .filter_map(|(i, s)| (*s == Some(1)).then_some(i))
            .collect()
    }

    /// Wrap this tracker into a kernel AST node
    pub fn to_uop(&self) -> UOp {
        UOp::new(UOpKind::ShapeTracker, None, vec![], UArg::Tracker(self.clone()))
    }

    // movement ops rewrite the outermost view

    pub fn reshape(&self, new_shape: &[SInt]) -> ShapeTracker {
        let mut views = self.views.clone();
        let last = views.last_mut().expect("tracker has at least one view");
        if let Some(r) = last.reshape(new_shape) {
            *last = r;
        } else {
            views.push(View::from_shape(new_shape.to_vec()));
        }
        ShapeTracker { views }
    }

    pub fn permute(&self, order: &[usize]) -> ShapeTracker {
        self.map_last(|v| v.permute(order))
    }

    pub fn pad(&self, arg: &[(i64, i64)]) -> ShapeTracker {
        self.map_last(|v| v.pad(arg))
    }

    pub fn shrink(&self, arg: &[(i64, i64)]) -> ShapeTracker {
        self.map_last(|v| v.shrink(arg))
    }

    pub fn expand(&self, new_shape: &[SInt]) -> ShapeTracker {
        self.map_last(|v| v.expand(new_shape))
    }

    fn map_last(&self, f: impl FnOnce(&View) -> View) -> ShapeTracker {
        let mut views = self.views.clone();
        let last = views.last_mut().expect("tracker has at least one view");
        *last = f(last);
        ShapeTracker { views }
    }
}

impl Add<&ShapeTracker> for &ShapeTracker {
    type Output = ShapeTracker;

    /// Compose: `self` is the inner tracker, `rhs` reads through it.
    /// Views are appended one at a time so adjacent pairs can collapse.
    fn add(self, rhs: &ShapeTracker) -> ShapeTracker {
        let mut ret = self.clone();
        for v in &rhs.views {
            ret.views.push(v.clone());
            ret = ret.simplify();
        }
        ret
    }
}

impl fmt::Display for ShapeTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ST(")?;
        for (i, v) in self.views.iter().enumerate() {
            if i > 0 {
                write!(f, "+")?;
            }
            write!(f, "{:?}", v.shape.iter().map(SInt::value).collect::<Vec<_>>())?;
            if !v.contiguous {
                write!(f, "*")?;
            }
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_collapses_identity() {
        let a = ShapeTracker::from_dims(&[4, 4]);
        let b = ShapeTracker::from_dims(&[4, 4]).permute(&[1, 0]);
        let c = &a + &b;
        assert_eq!(c.views.len(), 1);
        assert_eq!(c.shape()[0].value(), 4);
        assert!(!c.contiguous());
    }

    #[test]
    fn test_simplify_idempotent() {
        let st = ShapeTracker::from_dims(&[2, 3, 4])
            .permute(&[2, 0, 1])
            .reshape(&ShapeTracker::from_dims(&[4, 6]).shape().to_vec());
        let once = st.simplify();
        assert_eq!(once, once.simplify());
    }

    #[test]
    fn test_pad_then_shrink_roundtrip() {
        let st = ShapeTracker::from_dims(&[8]).pad(&[(2, 2)]).shrink(&[(2, 10)]);
        assert!(st.simplify().contiguous());
    }

    #[test]
    fn test_reduce_keeps_rank() {
        let st = ShapeTracker::from_dims(&[8, 16]);
        let reduced = st.reduce(&[1]);
        assert_eq!(reduced.iter().map(SInt::value).collect::<Vec<_>>(), vec![8, 1]);
    }

    #[test]
    fn test_real_strides_masked() {
        let st = ShapeTracker::from_dims(&[4]).pad(&[(1, 0)]);
        assert_eq!(st.real_strides(false), vec![None]);
        assert_eq!(st.real_strides(true), vec![Some(1)]);
    }

    #[test]
    fn test_unit_stride_axes() {
        let st = ShapeTracker::from_dims(&[4, 8]);
        assert_eq!(st.unit_stride_axes(), vec![1]);
        assert_eq!(st.permute(&[1, 0]).unit_stride_axes(), vec![0]);
    }

    #[test]
    fn test_unbind_collects_pairs() {
        let n = Variable::new("n", 1, 32).bind(8);
        let st = ShapeTracker::from_shape(vec![SInt::Var(n), SInt::Const(4)]);
        let (unbound, pairs) = st.unbind();
        assert_eq!(pairs, vec![(Variable::new("n", 1, 32), 8)]);
        let (again, none) = unbound.unbind();
        assert_eq!(again, unbound);
        assert!(none.is_empty());
    }

    #[test]
    fn test_expand_via_tracker() {
        let st = ShapeTracker::from_dims(&[1, 4]).expand(
            &ShapeTracker::from_dims(&[3, 4]).shape().to_vec(),
        );
        assert_eq!(st.size(), 12);
        assert_eq!(st.real_strides(true), vec![Some(0), Some(1)]);
    }
}
