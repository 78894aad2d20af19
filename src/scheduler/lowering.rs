//! Kernel lowering: turn one output group into the AST the executor runs.
//!
//! Meta ops short-circuit to a single `Ext` item (or a byte-move kernel
//! for same-device copies). Arithmetic groups run two sub-passes: the
//! reduce planner walks each output accumulating shape-trackers and
//! records, merges or swizzles every reduce it meets; AST construction
//! then builds the hash-consed kernel DAG, loading realize boundaries,
//! inlining consts, and wrapping each output in a `Store` under one
//! `Sink`.

use std::collections::{BTreeMap, HashMap};

use crate::config::Config;
use crate::error::{ScheduleError, ScheduleResult};
use crate::graph::{LazyGraph, LbArg, LbId, Metadata};
use crate::ops::{MetaOp, Op, UnaryOp};
use crate::scheduler::fusor::{reduceop_fusor, split_sinks, swizzle_reduceop};
use crate::scheduler::{LbScheduleItem, OrderedSet};
use crate::shape::ShapeTracker;
use crate::symbolic::{SInt, Variable};
use crate::uop::pattern::graph_rewrite;
use crate::uop::{ConstValue, ExtArg, UArg, UOp, UOpKind};
use crate::dtype::{DType, ScalarType};

type ReduceKey = (LbId, ShapeTracker);

/// Insertion-ordered reduce plan: `(reduce, output st) -> (input st,
/// axes)`. The emission order matters (the last entry fixes the kernel's
/// output shape), so this is a vec, not a map.
#[derive(Debug, Default)]
struct ReduceInfo {
    entries: Vec<(ReduceKey, (ShapeTracker, Vec<usize>))>,
}

impl ReduceInfo {
    fn get(&self, key: &ReduceKey) -> Option<&(ShapeTracker, Vec<usize>)> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    fn upsert(&mut self, key: ReduceKey, val: (ShapeTracker, Vec<usize>)) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = val,
            None => self.entries.push((key, val)),
        }
    }

    fn last(&self) -> Option<&(ReduceKey, (ShapeTracker, Vec<usize>))> {
        self.entries.last()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Walk an output accumulating shape-trackers, recording every reduce
/// along the way. Nested same-kind reduces merge; non-contiguous reduce
/// outputs are swizzled into the reduce input. Returns the topmost reduce
/// seen under `buf`.
#[allow(clippy::too_many_arguments)]
fn recurse_reduceops(
    graph: &LazyGraph,
    buf: LbId,
    st: ShapeTracker,
    realizes: &OrderedSet,
    outs: &[LbId],
    reduce_info: &mut ReduceInfo,
    cache: &mut HashMap<ReduceKey, Option<ReduceKey>>,
) -> Option<ReduceKey> {
    if let Some(hit) = cache.get(&(buf, st.clone())) {
        return hit.clone();
    }
    let base = graph.base_of(buf);
    if graph.realized(base) || (realizes.contains(base) && !outs.contains(&base)) {
        return None;
    }
    let (buf, st) = if buf == base {
        (buf, st)
    } else {
        (base, &graph.node(buf).st + &st)
    };
    let node = graph.node(buf);
    let is_reduce = node.op.is_some_and(Op::is_reduce);
    let input_st = if is_reduce {
        ShapeTracker::from_shape(graph.node(node.srcs[0]).shape().to_vec())
    } else {
        st.clone()
    };
    let srcs = node.srcs.clone();
    let mut reduce_srcs: Vec<ReduceKey> = Vec::new();
    for &x in &srcs {
        if let Some(r) = recurse_reduceops(graph, x, input_st.clone(), realizes, outs, reduce_info, cache)
        {
            reduce_srcs.push(r);
        }
    }
    let top_reduce = reduce_srcs.last().cloned();

    if is_reduce {
        let node = graph.node(buf);
        let mut axes = match &node.arg {
            LbArg::Axis(a) => a.clone(),
            _ => vec![],
        };
        let mut input_st = input_st;
        if !st.contiguous() {
            let (nst, naxes) = swizzle_reduceop(&input_st, &st, &axes);
            input_st = nst;
            axes = naxes;
        } else if let Some(top) = &top_reduce {
            let (top_input_st, top_axes) = reduce_info.get(top).cloned().expect("top reduce recorded");
            let src0 = node.srcs[0];
            if !graph.is_base(src0) && graph.base_of(src0) == top.0 && node.op == graph.node(top.0).op
            {
                // merge this reduce with its parent
                let mut new_axes = axes;
                new_axes.extend(top_axes);
                let new_st = &top.1 + &st;
                let merged_st = new_st.reshape(&top_input_st.reduce(&new_axes));
                let merged_key = (top.0, merged_st);
                reduce_info.upsert(merged_key, (top_input_st, new_axes));
                return None;
            }
            // reshape this reduce's input onto the top reduce's frame
            let frame: Vec<SInt> = top_input_st
                .shape()
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    if top_axes.contains(&i) {
                        SInt::Const(1)
                    } else {
                        s.clone()
                    }
                })
                .collect();
            input_st = input_st.reshape(&frame);
        }
        let st = st.reshape(&input_st.reduce(&axes));
        reduce_info.upsert((buf, st.clone()), (input_st, axes));
        return Some((buf, st));
    }
    cache.insert((buf, st), top_reduce.clone());
    top_reduce
}

/// Mutable state threaded through AST construction
struct LowerCtx<'a> {
    graph: &'a LazyGraph,
    outs: &'a [LbId],
    realizes: &'a OrderedSet,
    assign_targets: HashMap<LbId, LbId>,
    reduce_info: ReduceInfo,
    ast_rewrite: bool,
    var_vals: BTreeMap<Variable, i64>,
    inputs: Vec<LbId>,
    cache: HashMap<(LbId, ShapeTracker), UOp>,
}

impl LowerCtx<'_> {
    fn input_index(&mut self, buf: LbId) -> usize {
        match self.inputs.iter().position(|&x| x == buf) {
            Some(i) => i,
            None => {
                self.inputs.push(buf);
                self.inputs.len() - 1
            }
        }
    }
}

/// A masked view may stand in for a contiguous self-operand when
/// shrinking both to the mask gives back the same tracker
fn assignable_view(st: &ShapeTracker) -> bool {
    if st.contiguous() {
        return true;
    }
    if st.views.len() != 1 {
        return false;
    }
    let Some(mask) = st.views[0].mask.clone() else {
        return false;
    };
    ShapeTracker::from_shape(st.shape().to_vec()).shrink(&mask) == st.shrink(&mask)
}

/// Recursively build the kernel DAG for one output
fn recursive_uop(ctx: &mut LowerCtx<'_>, buf: LbId, st: ShapeTracker) -> ScheduleResult<UOp> {
    let (buf, st) = if ctx.graph.is_base(buf) {
        (buf, st)
    } else {
        let base = ctx.graph.base_of(buf);
        (base, &ctx.graph.node(buf).st + &st)
    };
    if let Some(hit) = ctx.cache.get(&(buf, st.clone())) {
        return Ok(hit.clone());
    }
    let node = ctx.graph.node(buf);
    let dtype = if node.dtype.is_image() {
        DType::Scalar(node.dtype.base())
    } else {
        node.dtype.clone()
    };

    // buffer ops define their shape-tracker
    if ctx.graph.realized(buf) || (ctx.realizes.contains(buf) && !ctx.outs.contains(&buf)) {
        let (unbound_st, pairs) = st.simplify().unbind();
        ctx.var_vals.extend(pairs);
        if node.op == Some(Op::Meta(MetaOp::Const)) {
            let val = match &node.arg {
                LbArg::Const(ConstValue::Var(v)) => {
                    let (unbound, bound) = v.unbind();
                    if let Some(x) = bound {
                        ctx.var_vals.insert(unbound.clone(), x);
                    }
                    ConstValue::Var(unbound)
                }
                LbArg::Const(c) => c.clone(),
                other => return Err(ScheduleError::UnsupportedConst(format!("{other:?}"))),
            };
            return Ok(UOp::new(
                UOpKind::Const,
                Some(dtype),
                vec![unbound_st.to_uop()],
                UArg::Const(val),
            ));
        }
        let assign = ctx.assign_targets.get(&buf).copied();
        if assign.is_some() && !assignable_view(&unbound_st) {
            return Err(ScheduleError::NonContiguousAssign);
        }
        let index = match assign {
            Some(a) => ctx
                .outs
                .iter()
                .position(|&o| o == a)
                .expect("assign is an output of its own kernel"),
            None => ctx.outs.len() + ctx.input_index(buf),
        };
        let ubuf = UOp::new(
            UOpKind::DefineGlobal,
            Some(node.dtype.as_buffer_arg()),
            vec![],
            UArg::Buffer(index),
        );
        return Ok(UOp::new(
            UOpKind::Load,
            Some(dtype),
            vec![ubuf, unbound_st.to_uop()],
            UArg::None,
        ));
    }

    // reduce ops change the shape-tracker
    if let Some(Op::Reduce(rop)) = node.op {
        let alu = rop.alu();
        let src0 = node.srcs[0];
        if !ctx.ast_rewrite {
            let rinfo = ctx.reduce_info.get(&(buf, st.clone())).cloned();
            let next_st = rinfo.as_ref().map_or_else(|| st.clone(), |(ist, _)| ist.clone());
            let rsrc = recursive_uop(ctx, src0, next_st.clone())?;
            return match rinfo {
                None => {
                    // this reduce merged into its parent
                    debug_assert!(
                        rsrc.op == UOpKind::ReduceAxis
                            && matches!(&rsrc.arg, UArg::Reduce(a, _) if *a == alu),
                        "can't merge reduce into {rsrc}"
                    );
                    Ok(rsrc)
                }
                Some((_, axes)) => {
                    let ret = UOp::new(
                        UOpKind::ReduceAxis,
                        Some(dtype),
                        vec![rsrc],
                        UArg::Reduce(alu, axes),
                    );
                    Ok(ctx
                        .cache
                        .entry((buf, next_st))
                        .or_insert(ret)
                        .clone())
                }
            };
        }
        // rewrite-based lowering: emit the reduce over its own input
        // frame and let the fusor push any swizzle through
        let input_st = ShapeTracker::from_shape(ctx.graph.node(src0).shape().to_vec());
        let axes = match &ctx.graph.node(buf).arg {
            LbArg::Axis(a) => a.clone(),
            _ => vec![],
        };
        let rsrc = recursive_uop(ctx, src0, input_st)?;
        let ret = UOp::new(
            UOpKind::ReduceAxis,
            Some(dtype.clone()),
            vec![rsrc],
            UArg::Reduce(alu, axes),
        );
        let ret = if st.contiguous() {
            ret
        } else {
            UOp::new(UOpKind::Swizzle, Some(dtype), vec![ret], UArg::Tracker(st.clone()))
        };
        return Ok(ctx.cache.entry((buf, st)).or_insert(ret).clone());
    }

    // elementwise ops pass the shape-tracker through
    let op = node.op.expect("base carries an op");
    let srcs = node.srcs.clone();
    let mut in_uops: Vec<UOp> = Vec::with_capacity(srcs.len());
    for &x in &srcs {
        in_uops.push(recursive_uop(ctx, x, st.clone())?);
    }
    match op {
        Op::Meta(MetaOp::Contiguous | MetaOp::Assign) => {
            debug_assert!(ctx.outs.contains(&buf), "{op} must be writable");
            Ok(in_uops[0].clone())
        }
        Op::Unary(UnaryOp::Cast) => {
            let ret = UOp::new(UOpKind::Cast, Some(dtype), in_uops, UArg::None);
            Ok(ctx.cache.entry((buf, st)).or_insert(ret).clone())
        }
        Op::Unary(UnaryOp::Bitcast) => {
            let ret = UOp::new(UOpKind::Bitcast, Some(dtype), in_uops, UArg::None);
            Ok(ctx.cache.entry((buf, st)).or_insert(ret).clone())
        }
        _ => {
            let ret = UOp::new(UOpKind::Alu, Some(dtype), in_uops, UArg::Alu(op));
            Ok(ctx.cache.entry((buf, st)).or_insert(ret).clone())
        }
    }
}

fn device_prefix(device: &str) -> &str {
    device.split(':').next().unwrap_or(device)
}

/// Describe the computation for one output group as AST + inputs +
/// var_vals
pub(crate) fn lower_lazybuffer(
    graph: &LazyGraph,
    outs: &[LbId],
    realizes: &OrderedSet,
    config: &Config,
) -> ScheduleResult<Vec<LbScheduleItem>> {
    let out = outs[0];
    let node = graph.node(out);

    // same-device copies can lower to a raw byte-move kernel
    if node.op == Some(Op::Meta(MetaOp::Copy))
        && config.fusion.use_copy_kernel
        && device_prefix(&node.device) == device_prefix(&graph.node(node.srcs[0]).device)
    {
        let LbArg::Bytes(nbytes) = &node.arg else {
            return Err(ScheduleError::UnsupportedConst(format!("{:?}", node.arg)));
        };
        let nbytes = *nbytes;
        if nbytes % node.dtype.itemsize() != 0 {
            return Err(ScheduleError::CopyKernelMisaligned {
                nbytes,
                itemsize: node.dtype.itemsize(),
            });
        }
        let st_uop = ShapeTracker::from_dims(&[nbytes]).to_uop();
        let rd = UOp::new(
            UOpKind::Load,
            Some(DType::Scalar(ScalarType::UInt8)),
            vec![
                UOp::new(
                    UOpKind::DefineGlobal,
                    Some(DType::Ptr(ScalarType::UInt8)),
                    vec![],
                    UArg::Buffer(1),
                ),
                st_uop.clone(),
            ],
            UArg::None,
        );
        let wr = UOp::new(
            UOpKind::Store,
            None,
            vec![
                UOp::new(
                    UOpKind::DefineGlobal,
                    Some(node.dtype.as_buffer_arg()),
                    vec![],
                    UArg::Buffer(0),
                ),
                st_uop,
                rd,
            ],
            UArg::None,
        );
        return Ok(vec![LbScheduleItem {
            ast: UOp::new(UOpKind::Sink, None, vec![wr], UArg::None),
            outputs: outs.to_vec(),
            inputs: node.srcs.iter().map(|&x| graph.base_of(x)).collect(),
            var_vals: BTreeMap::new(),
            metadata: Vec::new(),
        }]);
    }

    // remaining meta ops are opaque to the kernel pipeline
    if let Some(Op::Meta(m @ (MetaOp::Custom | MetaOp::Copy | MetaOp::Empty | MetaOp::View))) =
        node.op
    {
        let payload = match &node.arg {
            LbArg::Bytes(n) => ExtArg::Bytes(*n),
            LbArg::Custom(s) => ExtArg::Custom(s.clone()),
            _ => ExtArg::None,
        };
        return Ok(vec![LbScheduleItem {
            ast: UOp::new(
                UOpKind::Ext,
                Some(node.dtype.clone()),
                vec![],
                UArg::Ext(m, payload),
            ),
            outputs: outs.to_vec(),
            inputs: node.srcs.iter().map(|&x| graph.base_of(x)).collect(),
            var_vals: BTreeMap::new(),
            metadata: Vec::new(),
        }]);
    }

    // reduce planning, then pad all reduce inputs to agree per dimension
    let mut reduce_info = ReduceInfo::default();
    if !config.fusion.ast_rewrite {
        let mut planned: HashMap<ReduceKey, Option<ReduceKey>> = HashMap::new();
        for &o in outs {
            let st = graph.node(o).st.clone();
            recurse_reduceops(graph, o, st, realizes, outs, &mut reduce_info, &mut planned);
        }
        equalize_reduce_shapes(&mut reduce_info);
    }

    let mut var_vals: BTreeMap<Variable, i64> = BTreeMap::new();
    for &o in outs {
        var_vals.extend(graph.node(o).st.var_vals());
    }
    let assign_targets: HashMap<LbId, LbId> = outs
        .iter()
        .filter(|&&o| graph.node(o).op == Some(Op::Meta(MetaOp::Assign)))
        .map(|&o| (graph.node(o).srcs[1], o))
        .collect();

    let mut ctx = LowerCtx {
        graph,
        outs,
        realizes,
        assign_targets,
        reduce_info,
        ast_rewrite: config.fusion.ast_rewrite,
        var_vals,
        inputs: Vec::new(),
        cache: HashMap::new(),
    };

    let mut stores: Vec<UOp> = Vec::with_capacity(outs.len());
    for (i, &o) in outs.iter().enumerate() {
        let onode = graph.node(o);
        let output_shape: Vec<SInt> = match ctx.reduce_info.last() {
            Some((_, (input_st, axes))) if !ctx.ast_rewrite => input_st.reduce(axes),
            _ => onode.shape().to_vec(),
        };
        let output_st = ShapeTracker::from_shape(output_shape.clone());
        let src = recursive_uop(&mut ctx, o, output_st.clone())?;
        let output_st = match (&onode.op, &onode.arg) {
            (Some(Op::Meta(MetaOp::Assign)), LbArg::Tracker(assign_st)) => {
                debug_assert!(
                    assign_st.shape() == onode.shape(),
                    "ASSIGN must not override output shape"
                );
                assign_st.reshape(&output_shape)
            }
            _ => output_st,
        };
        let (output_st, vv) = output_st.simplify().unbind();
        ctx.var_vals.extend(vv);
        let ubuf = UOp::new(
            UOpKind::DefineGlobal,
            Some(onode.dtype.as_buffer_arg()),
            vec![],
            UArg::Buffer(i),
        );
        stores.push(UOp::new(
            UOpKind::Store,
            None,
            vec![ubuf, output_st.to_uop(), src],
            UArg::None,
        ));
    }
    let mut sink = UOp::new(UOpKind::Sink, None, stores, UArg::None);
    if config.fusion.ast_rewrite {
        sink = graph_rewrite(&sink, &reduceop_fusor(&config.split));
    }

    // metadata from every buffer touched that is not itself an input
    let mut touched: Vec<LbId> = ctx.cache.keys().map(|(b, _)| *b).collect();
    touched.sort_unstable();
    touched.dedup();
    let mut metadata: Vec<Metadata> = Vec::new();
    for b in touched {
        if ctx.inputs.contains(&b) {
            continue;
        }
        if let Some(m) = &graph.node(b).metadata {
            if !metadata.contains(m) {
                metadata.push(m.clone());
            }
        }
    }

    Ok(split_sinks(&sink)
        .into_iter()
        .map(|ast| LbScheduleItem {
            ast,
            outputs: outs.to_vec(),
            inputs: ctx.inputs.clone(),
            var_vals: ctx.var_vals.clone(),
            metadata: metadata.clone(),
        })
        .collect())
}

/// Where reduce inputs disagree on a dimension (and the sizes are not
/// just `{1, N}` broadcasts), pad the smaller inputs up to the max
fn equalize_reduce_shapes(reduce_info: &mut ReduceInfo) {
    if reduce_info.is_empty() {
        return;
    }
    let min_rank = reduce_info
        .entries
        .iter()
        .map(|(_, (ist, _))| ist.shape().len())
        .min()
        .unwrap_or(0);
    for i in 0..min_rank {
        let mut dims: Vec<i64> = reduce_info
            .entries
            .iter()
            .map(|(_, (ist, _))| ist.shape()[i].value())
            .collect();
        dims.sort_unstable();
        dims.dedup();
        if dims.len() == 1 || (dims.len() == 2 && dims[0] == 1) {
            continue;
        }
        let maxd = *dims.last().expect("nonempty dims");
        for (_, (ist, _)) in &mut reduce_info.entries {
            let dim = ist.shape()[i].value();
            if dim > 1 && dim != maxd {
                let mut arg = vec![(0i64, 0i64); ist.shape().len()];
                arg[i] = (0, maxd - dim);
                *ist = ist.pad(&arg);
            }
        }
    }
}
