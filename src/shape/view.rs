//! A single strided view: shape, strides, offset, and an optional validity
//! mask. Dimensions of size one always carry stride zero so that layouts
//! compare canonically.

use crate::symbolic::{all_int, prod, SInt};

/// Row-major strides for a shape, with stride 0 on size-1 dimensions
pub fn strides_for_shape(shape: &[SInt]) -> Vec<i64> {
    let mut strides = vec![0i64; shape.len()];
    let mut acc = 1i64;
    for i in (0..shape.len()).rev() {
        if shape[i].value() != 1 {
            strides[i] = acc;
        }
        acc *= shape[i].value();
    }
    strides
}

/// One strided layout over a flat index space.
///
/// `mask` bounds the valid region per axis as half-open `(begin, end)`
/// ranges; reads outside it yield zero. A mask covering the whole shape is
/// canonicalized away.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct View {
    pub shape: Vec<SInt>,
    pub strides: Vec<i64>,
    pub offset: i64,
    pub mask: Option<Vec<(i64, i64)>>,
    pub contiguous: bool,
}

impl View {
    /// Build a canonical view: size-1 dims get stride 0, full masks drop,
    /// and contiguity is computed.
    pub fn create(
        shape: Vec<SInt>,
        strides: Option<Vec<i64>>,
        offset: i64,
        mask: Option<Vec<(i64, i64)>>,
    ) -> View {
        let canonical = strides_for_shape(&shape);
        let mut strides = strides.unwrap_or_else(|| canonical.clone());
        for (i, d) in shape.iter().enumerate() {
            if d.value() == 1 {
                strides[i] = 0;
            }
        }
        let mask = mask.filter(|m| {
            !m.iter()
                .zip(&shape)
                .all(|(&(b, e), d)| b == 0 && e == d.value())
        });
        let contiguous = offset == 0 && mask.is_none() && strides == canonical;
        View {
            shape,
            strides,
            offset,
            mask,
            contiguous,
        }
    }

    /// Identity view of a shape
    pub fn from_shape(shape: Vec<SInt>) -> View {
        View::create(shape, None, 0, None)
    }

    pub fn size(&self) -> i64 {
        prod(&self.shape)
    }

    fn mask_or_full(&self) -> Vec<(i64, i64)> {
        self.mask
            .clone()
            .unwrap_or_else(|| self.shape.iter().map(|d| (0, d.value())).collect())
    }

    /// Reorder axes
    pub fn permute(&self, order: &[usize]) -> View {
        debug_assert_eq!(order.len(), self.shape.len());
        View::create(
            order.iter().map(|&i| self.shape[i].clone()).collect(),
            Some(order.iter().map(|&i| self.strides[i]).collect()),
            self.offset,
            self.mask
                .as_ref()
                .map(|m| order.iter().map(|&i| m[i]).collect()),
        )
    }

    /// Grow each axis by `(before, after)` zero-padding
    pub fn pad(&self, arg: &[(i64, i64)]) -> View {
        debug_assert_eq!(arg.len(), self.shape.len());
        if arg.iter().all(|&(b, a)| b == 0 && a == 0) {
            return self.clone();
        }
        let old_mask = self.mask_or_full();
        let shape: Vec<SInt> = self
            .shape
            .iter()
            .zip(arg)
            .map(|(d, &(b, a))| SInt::Const(d.value() + b + a))
            .collect();
        let offset = self.offset
            - arg
                .iter()
                .zip(&self.strides)
                .map(|(&(b, _), s)| b * s)
                .sum::<i64>();
        let mask: Vec<(i64, i64)> = old_mask
            .iter()
            .zip(arg)
            .map(|(&(mb, me), &(b, _))| (mb + b, me + b))
            .collect();
        View::create(shape, Some(self.strides.clone()), offset, Some(mask))
    }

    /// Slice each axis to `(begin, end)`
    pub fn shrink(&self, arg: &[(i64, i64)]) -> View {
        debug_assert_eq!(arg.len(), self.shape.len());
        let old_mask = self.mask_or_full();
        let shape: Vec<SInt> = arg.iter().map(|&(b, e)| SInt::Const(e - b)).collect();
        let offset = self.offset
            + arg
                .iter()
                .zip(&self.strides)
                .map(|(&(b, _), s)| b * s)
                .sum::<i64>();
        let mask: Vec<(i64, i64)> = old_mask
            .iter()
            .zip(arg)
            .map(|(&(mb, me), &(b, e))| {
                let nb = (mb - b).clamp(0, e - b);
                let ne = (me - b).clamp(0, e - b);
                (nb, ne)
            })
            .collect();
        View::create(shape, Some(self.strides.clone()), offset, Some(mask))
    }

    /// Broadcast size-1 axes up to `new_shape`
    pub fn expand(&self, new_shape: &[SInt]) -> View {
        debug_assert_eq!(new_shape.len(), self.shape.len());
        let mask = self.mask.as_ref().map(|m| {
            m.iter()
                .zip(self.shape.iter().zip(new_shape))
                .map(|(&(b, e), (old, new))| {
                    if old.value() == new.value() {
                        (b, e)
                    } else if (b, e) == (0, 1) {
                        (0, new.value())
                    } else {
                        (0, 0)
                    }
                })
                .collect()
        });
        View::create(
            new_shape.to_vec(),
            Some(self.strides.clone()),
            self.offset,
            mask,
        )
    }

    /// Re-dimension without moving data. Returns `None` when the layout
    /// cannot express the new shape (the caller then stacks a fresh view).
    pub fn reshape(&self, new_shape: &[SInt]) -> Option<View> {
        if self.shape == new_shape {
            return Some(self.clone());
        }
        if self.contiguous {
            return Some(View::from_shape(new_shape.to_vec()));
        }
        if !all_int(&self.shape) || !all_int(new_shape) || prod(&self.shape) != prod(new_shape) {
            return None;
        }

        // match runs of old dims against runs of new dims by product
        let old_mask = self.mask_or_full();
        let mut new_strides = vec![0i64; new_shape.len()];
        let mut new_mask: Vec<(i64, i64)> = Vec::with_capacity(new_shape.len());
        let (mut i, mut j) = (0usize, 0usize);
        while i < self.shape.len() || j < new_shape.len() {
            let (i0, j0) = (i, j);
            let mut op = if i < self.shape.len() {
                self.shape[i].value()
            } else {
                1
            };
            let mut np = if j < new_shape.len() {
                new_shape[j].value()
            } else {
                1
            };
            if i < self.shape.len() {
                i += 1;
            }
            if j < new_shape.len() {
                j += 1;
            }
            while op != np {
                if op < np {
                    if i >= self.shape.len() {
                        return None;
                    }
                    op *= self.shape[i].value();
                    i += 1;
                } else {
                    if j >= new_shape.len() {
                        return None;
                    }
                    np *= new_shape[j].value();
                    j += 1;
                }
            }
            let old_run = i0..i;
            let new_run = j0..j;
            // strides within a merged run must be row-major contiguous
            if i > i0 + 1 {
                for k in i0..i - 1 {
                    let expect = self.strides[k + 1] * self.shape[k + 1].value();
                    if self.shape[k].value() != 1
                        && self.strides[k] != expect
                        && self.strides[k] != 0
                    {
                        return None;
                    }
                }
            }
            // masks survive only when full across every reshaped dim
            let full = old_run
                .clone()
                .all(|k| old_mask[k] == (0, self.shape[k].value()));
            let single_old = i - i0 == 1;
            let single_new = j - j0 == 1;
            if !full && !(single_old && single_new) {
                return None;
            }
            let base_stride = old_run
                .clone()
                .rev()
                .find(|&k| self.shape[k].value() != 1)
                .map_or(0, |k| self.strides[k]);
            let mut acc = base_stride;
            for k in new_run.clone().rev() {
                if new_shape[k].value() != 1 {
                    new_strides[k] = acc;
                    acc *= new_shape[k].value();
                }
            }
            for k in new_run {
                if single_old && single_new {
                    new_mask.push(old_mask[i0]);
                } else {
                    new_mask.push((0, new_shape[k].value()));
                }
            }
        }
        Some(View::create(
            new_shape.to_vec(),
            Some(new_strides),
            self.offset,
            self.mask.as_ref().map(|_| new_mask),
        ))
    }
}
