//! Reduce-op fusor: shape-tracker algebra for pushing movement ops
//! through reduces, plus the pattern rules that run over a lowered SINK
//! when rewrite-based lowering is enabled.
//!
//! The rules mirror the ad-hoc reduce planner: a swizzle sitting on a
//! reduce is pushed into the reduce's input tracker, back-to-back reduces
//! of one kind merge over the union of their axes, oversized reduces
//! split into a two-pass kernel, and ops downstream of a reduce are
//! reshaped to the reduce's output shape.

use std::collections::HashMap;

use tracing::debug;

use crate::config::SplitConfig;
use crate::dtype::DType;
use crate::shape::{strides_for_shape, ShapeTracker, View};
use crate::symbolic::{all_int, prod, SInt};
use crate::uop::pattern::{graph_rewrite, PatternMatcher, UPat};
use crate::uop::{UArg, UOp, UOpKind};

/// Move the non-reduced axes to the front; returns the permuted tracker
/// and the trailing reduce-shape suffix
pub(crate) fn permute_reduce(
    input_st: &ShapeTracker,
    axes: &[usize],
) -> (ShapeTracker, Vec<SInt>) {
    let ndim = input_st.shape().len();
    let mut order: Vec<usize> = (0..ndim).filter(|i| !axes.contains(i)).collect();
    order.extend(axes.iter().copied().filter(|&i| i < ndim));
    let tmp = input_st.permute(&order);
    let keep = tmp.shape().len() - axes.iter().filter(|&&i| i < ndim).count();
    let rshape = tmp.shape()[keep..].to_vec();
    (tmp, rshape)
}

/// Push a movement op (`swizzle_st`) inside a reduce: every swizzle view
/// is extended by the reduce suffix, its strides stretched by the reduce
/// volume, and contiguous strides appended for the new axes. Returns the
/// combined input tracker and the new (trailing) reduce axes.
pub(crate) fn swizzle_reduceop(
    input_st: &ShapeTracker,
    swizzle_st: &ShapeTracker,
    axes: &[usize],
) -> (ShapeTracker, Vec<usize>) {
    let (tmp, rshape) = permute_reduce(input_st, axes);
    let prshape = prod(&rshape);
    let rstrides = strides_for_shape(&rshape);
    let mut nv: Vec<View> = Vec::with_capacity(swizzle_st.views.len());
    for v in &swizzle_st.views {
        let mut shape = v.shape.clone();
        shape.extend(rshape.iter().cloned());
        let mut strides: Vec<i64> = v.strides.iter().map(|&s| s * prshape).collect();
        strides.extend(rstrides.iter().copied());
        let mask = v.mask.as_ref().map(|m| {
            let mut m = m.clone();
            m.extend(rshape.iter().map(|d| (0, d.value())));
            m
        });
        nv.push(View::create(shape, Some(strides), v.offset * prshape, mask));
    }
    let new_input_st = &tmp + &ShapeTracker::new(nv);
    let (_, new_rshape) = permute_reduce(&new_input_st, axes);
    let n = new_input_st.shape().len();
    let new_axes: Vec<usize> = (n - new_rshape.len()..n).collect();
    (new_input_st, new_axes)
}

/// The output shape-tracker a node would store through, derived from its
/// buffer ops. `None` when sources disagree (mid-rewrite trees).
pub(crate) fn get_output_st(
    uop: &UOp,
    uop_sts: &mut HashMap<UOp, ShapeTracker>,
) -> Option<ShapeTracker> {
    if let Some(st) = uop_sts.get(uop) {
        return Some(st.clone());
    }
    if uop.op.defines_shape() {
        return Some(uop.st_arg().clone());
    }
    let mut src_sts: Vec<ShapeTracker> = Vec::with_capacity(uop.src.len());
    for x in &uop.src {
        src_sts.push(get_output_st(x, uop_sts)?);
    }
    if src_sts.is_empty() || !src_sts.iter().all(|x| x.shape() == src_sts[0].shape()) {
        return None;
    }
    let st = if uop.op == UOpKind::ReduceAxis {
        let UArg::Reduce(_, axes) = &uop.arg else {
            return None;
        };
        ShapeTracker::from_shape(src_sts[0].reduce(axes))
    } else {
        src_sts[0].clone()
    };
    uop_sts.insert(uop.clone(), st.clone());
    Some(st)
}

/// Rebuild a tree applying `f` to every shape-tracker argument in it
pub(crate) fn st_fixup(
    uop: &UOp,
    f: &dyn Fn(&ShapeTracker) -> ShapeTracker,
    uop_sts: &mut HashMap<UOp, ShapeTracker>,
    cache: &mut HashMap<UOp, UOp>,
) -> UOp {
    if let Some(n) = cache.get(uop) {
        return n.clone();
    }
    if let Some(st) = uop_sts.get(uop) {
        if &f(st) == st {
            return uop.clone();
        }
    }
    if uop.op == UOpKind::ShapeTracker {
        if let UArg::Tracker(st) = &uop.arg {
            let new_st = f(st);
            if &new_st == st {
                return uop.clone();
            }
            return UOp::new(UOpKind::ShapeTracker, None, vec![], UArg::Tracker(new_st));
        }
    }
    let new_srcs: Vec<UOp> = uop
        .src
        .iter()
        .map(|x| st_fixup(x, f, uop_sts, cache))
        .collect();
    let ret = if new_srcs == uop.src {
        uop.clone()
    } else {
        UOp::new(uop.op, uop.dtype.clone(), new_srcs, uop.arg.clone())
    };
    cache.insert(uop.clone(), ret.clone());
    ret
}

fn push_swizzle_through_reduce(swizzle: &UOp, reduceop: &UOp) -> Option<UOp> {
    let mut uop_sts = HashMap::new();
    let UArg::Tracker(swizzle_st) = &swizzle.arg else {
        return None;
    };
    let UArg::Reduce(alu, axes) = &reduceop.arg else {
        return None;
    };
    let rsrc = &reduceop.src[0];
    let (new_input_st, new_axes) =
        swizzle_reduceop(&get_output_st(rsrc, &mut uop_sts)?, swizzle_st, axes);
    let fixed = st_fixup(rsrc, &|_| new_input_st.clone(), &mut uop_sts, &mut HashMap::new());
    Some(UOp::new(
        UOpKind::ReduceAxis,
        reduceop.dtype.clone(),
        vec![fixed],
        UArg::Reduce(*alu, new_axes),
    ))
}

fn merge_double_reduce(root: &UOp, first_reduce: &UOp) -> Option<UOp> {
    let UArg::Reduce(root_alu, root_axes) = &root.arg else {
        return None;
    };
    let UArg::Reduce(first_alu, first_axes) = &first_reduce.arg else {
        return None;
    };
    // only same-kind reduces merge, and only two at a time
    if root_alu != first_alu {
        return None;
    }
    if first_reduce
        .parents()
        .iter()
        .any(|x| x.op == UOpKind::ReduceAxis)
    {
        return None;
    }
    let mut new_axes = root_axes.clone();
    new_axes.extend(first_axes.iter().copied());
    Some(UOp::new(
        UOpKind::ReduceAxis,
        first_reduce.dtype.clone(),
        first_reduce.src.clone(),
        UArg::Reduce(*first_alu, new_axes),
    ))
}

/// Split a reduce whose input/output volume ratio exceeds the threshold
/// into a partial reduce stored to a synthetic global, reloaded and
/// reduced again, then swizzled back to the logical shape
fn split_reduceop(root: &UOp, split: &SplitConfig) -> Option<UOp> {
    let mut uop_sts = HashMap::new();
    let UArg::Reduce(alu, axes) = &root.arg else {
        return None;
    };
    let input_st = get_output_st(&root.src[0], &mut uop_sts)?;
    let new_shape = input_st.reduce(axes);
    if !all_int(input_st.shape())
        || input_st.shape().iter().any(|d| d.value() == 0)
        || prod(input_st.shape()) / prod(&new_shape) < split.reduceop_split_threshold
    {
        return None;
    }
    let real_strides = input_st.real_strides(true);
    let hi = 256.min((1i64 << split.reduceop_split_size) / prod(&new_shape));
    let mut candidate: Option<(usize, i64)> = None;
    'outer: for &i in axes {
        let mut x = hi;
        while x >= 8 {
            if input_st.shape()[i].value() % x == 0 && real_strides[i] != Some(0) {
                candidate = Some((i, x));
                break 'outer;
            }
            x -= 1;
        }
    }
    let (dim_to_split, divisor) = candidate?;

    let shape: Vec<i64> = input_st.shape().iter().map(SInt::value).collect();
    let mut splitted_shape: Vec<SInt> = Vec::with_capacity(shape.len() + 1);
    for (i, &d) in shape.iter().enumerate() {
        if i == dim_to_split {
            splitted_shape.push(SInt::Const(divisor));
            splitted_shape.push(SInt::Const(d / divisor));
        } else {
            splitted_shape.push(SInt::Const(d));
        }
    }
    let mut perm: Vec<usize> = (0..splitted_shape.len())
        .filter(|&x| x != dim_to_split)
        .collect();
    perm.push(dim_to_split);
    let splitted_for = splitted_shape.clone();
    let fix = move |st: &ShapeTracker| st.reshape(&splitted_for).permute(&perm);
    debug!(
        "split {divisor}: {:?} -> {:?} -> {:?}",
        shape,
        splitted_shape.iter().map(SInt::value).collect::<Vec<_>>(),
        new_shape.iter().map(SInt::value).collect::<Vec<_>>()
    );
    let splitted = st_fixup(&root.src[0], &fix, &mut uop_sts, &mut HashMap::new());
    let dtype = root.dtype.clone()?;
    let first_reduce = UOp::new(
        UOpKind::ReduceAxis,
        Some(dtype.clone()),
        vec![splitted],
        UArg::Reduce(*alu, axes.clone()),
    );
    let mid_st = get_output_st(&first_reduce, &mut uop_sts)?;
    let gbuf = UOp::new(
        UOpKind::DefineGlobal,
        Some(DType::Ptr(dtype.base())),
        vec![],
        UArg::Buffer(0),
    );
    let global_store = UOp::new(
        UOpKind::Store,
        None,
        vec![gbuf.clone(), mid_st.to_uop(), first_reduce],
        UArg::None,
    );
    let global_load = UOp::new(
        UOpKind::Load,
        Some(dtype.clone()),
        vec![gbuf, mid_st.to_uop(), global_store],
        UArg::None,
    );
    let second_reduce = UOp::new(
        UOpKind::ReduceAxis,
        Some(dtype),
        vec![global_load],
        UArg::Reduce(*alu, vec![new_shape.len()]),
    );
    let out_st = get_output_st(&second_reduce, &mut uop_sts)?.reshape(&new_shape);
    Some(UOp::new(
        UOpKind::Swizzle,
        None,
        vec![second_reduce],
        UArg::Tracker(out_st),
    ))
}

fn push_reduceop_shape(root: &UOp) -> Option<UOp> {
    let reduceops: Vec<UOp> = root
        .parents()
        .into_iter()
        .filter(|x| x.op == UOpKind::ReduceAxis)
        .collect();
    let first = reduceops.first()?;
    let mut uop_sts = HashMap::new();
    let rshape = get_output_st(first, &mut uop_sts)?.shape().to_vec();
    if let Some(root_st) = get_output_st(root, &mut uop_sts) {
        if root_st.shape() == rshape.as_slice() {
            return None;
        }
    }
    Some(st_fixup(
        root,
        &|st| st.reshape(&rshape),
        &mut uop_sts,
        &mut HashMap::new(),
    ))
}

/// The rewrite rules applied to a lowered SINK under rewrite-based
/// lowering
pub(crate) fn reduceop_fusor(split: &SplitConfig) -> PatternMatcher {
    let split = split.clone();
    PatternMatcher::new()
        .rule(
            UPat::op(UOpKind::Swizzle)
                .with_src(vec![UPat::op(UOpKind::ReduceAxis).named("reduceop")])
                .named("swizzle"),
            |c| push_swizzle_through_reduce(&c["swizzle"], &c["reduceop"]),
        )
        .rule(
            UPat::op(UOpKind::ReduceAxis)
                .with_src(vec![UPat::op(UOpKind::ReduceAxis).named("first_reduce")])
                .named("root"),
            |c| merge_double_reduce(&c["root"], &c["first_reduce"]),
        )
        .rule(UPat::op(UOpKind::ReduceAxis).named("root"), move |c| {
            split_reduceop(&c["root"], &split)
        })
        .rule(
            UPat::ops(&[
                UOpKind::Alu,
                UOpKind::Cast,
                UOpKind::Bitcast,
                UOpKind::Store,
            ])
            .named("root"),
            |c| push_reduceop_shape(&c["root"]),
        )
}

/// Wrap the STORE feeding a synthetic reload in its own SINK so every
/// kernel in a split lowering can be walked as one subtree
pub(crate) fn sinker() -> PatternMatcher {
    PatternMatcher::new().rule(
        UPat::op(UOpKind::Load)
            .with_src(vec![
                UPat::any(),
                UPat::any(),
                UPat::op(UOpKind::Store).named("store"),
            ])
            .named("root"),
        |c| {
            let root = &c["root"];
            let sink = UOp::new(UOpKind::Sink, None, vec![c["store"].clone()], UArg::None);
            Some(UOp::new(
                root.op,
                root.dtype.clone(),
                vec![root.src[0].clone(), root.src[1].clone(), sink],
                root.arg.clone(),
            ))
        },
    )
}

/// Inverse of [`sinker`]: detach the nested SINK again once items are cut
pub(crate) fn unsinker() -> PatternMatcher {
    PatternMatcher::new().rule(
        UPat::op(UOpKind::Load)
            .with_src(vec![UPat::any(), UPat::any(), UPat::op(UOpKind::Sink)])
            .named("root"),
        |c| {
            let root = &c["root"];
            Some(UOp::new(
                root.op,
                root.dtype.clone(),
                vec![root.src[0].clone(), root.src[1].clone()],
                root.arg.clone(),
            ))
        },
    )
}

/// Cut one schedule item per SINK in the rewritten tree, inner sinks
/// first
pub(crate) fn split_sinks(last_sink: &UOp) -> Vec<UOp> {
    let full_graph = graph_rewrite(last_sink, &sinker());
    let unsink = unsinker();
    full_graph
        .sparents()
        .into_iter()
        .filter(|u| u.op == UOpKind::Sink)
        .map(|u| graph_rewrite(&u, &unsink))
        .collect()
}
