//! Realization decision: pair every reduce with the elementwise consumers
//! it can fuse with, force-realize the ones that cannot pair cleanly, and
//! assemble the final output groups.
//!
//! Fusion ambiguity is never an error here. A reduce whose children reach
//! it through multiple distinct views, or whose candidate group contains a
//! second reduce, simply realizes; a forced realize is then *chased* along
//! single-child contiguous paths to put the kernel boundary as late as
//! possible.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, warn};

use crate::config::Config;
use crate::dtype::DType;
use crate::error::{ScheduleError, ScheduleResult};
use crate::graph::{LazyGraph, LbId};
use crate::ops::{MetaOp, Op, ReduceOp, UnaryOp};
use crate::scheduler::discovery::{discover, GraphInfo};
use crate::scheduler::OrderedSet;
use crate::shape::ShapeTracker;
use crate::symbolic::{prod, SInt};

/// Phase 2 result: the kernel output groups plus the context lowering and
/// ordering need
#[derive(Debug)]
pub(crate) struct OutputGroups {
    /// `(group key, outputs)` in emission order
    pub groups: Vec<(LbId, Vec<LbId>)>,
    pub realizes: OrderedSet,
    pub assign_targets: HashMap<LbId, LbId>,
}

/// Grow the fusion group reachable from `tr` downward through children.
/// Reaching another realize boundary adds it to the group; any unfusable
/// path adds `r` itself (forcing the reduce to realize).
#[allow(clippy::too_many_arguments)]
fn recursive_group(
    graph: &LazyGraph,
    tr: LbId,
    st: &ShapeTracker,
    r: LbId,
    info: &GraphInfo,
    realizes: &OrderedSet,
    reduce_for_op: &BTreeMap<LbId, LbId>,
    group: &mut OrderedSet,
    cache: &mut HashSet<(LbId, ShapeTracker)>,
) {
    if !cache.insert((tr, st.clone())) {
        return;
    }
    if realizes.contains(tr) && tr != r {
        // can only fuse contiguous; max one reduceop per kernel
        if !st.contiguous() || st.size() != graph.node(r).st.size() || reduce_for_op.contains_key(&tr)
        {
            group.insert(r);
        }
        group.insert(tr);
        return;
    }
    for &tr_next in info.children_of(tr) {
        // max one reduceop per kernel
        if graph.node(tr_next).op.is_some_and(Op::is_reduce) {
            group.insert(r);
            return;
        }
        // can only fuse a child reading through a single view of tr
        let mut st_childs: Vec<LbId> = Vec::new();
        for &s in &graph.node(tr_next).srcs {
            if graph.base_of(s) == tr && !st_childs.contains(&s) {
                st_childs.push(s);
            }
        }
        if st_childs.len() > 1 {
            group.insert(r);
            return;
        }
        let next_st = st + &graph.node(st_childs[0]).st;
        recursive_group(
            graph,
            tr_next,
            &next_st,
            r,
            info,
            realizes,
            reduce_for_op,
            group,
            cache,
        );
    }
}

/// Re-derive the group as the descendants of the reduce that group
/// cleanly, dropping the group entirely if a second reduce hides among
/// the ancestors of its members.
fn get_isolated_children(
    graph: &LazyGraph,
    r: LbId,
    info: &GraphInfo,
    realizes: &OrderedSet,
    reduce_for_op: &BTreeMap<LbId, LbId>,
    group: &OrderedSet,
) -> OrderedSet {
    let mut rc_parents: Vec<LbId> = group.iter().collect();
    let mut cache: HashSet<LbId> = HashSet::new();
    while let Some(p) = rc_parents.pop() {
        if !cache.insert(p) {
            continue;
        }
        // max one reduceop per kernel
        if graph.node(p).op.is_some_and(Op::is_reduce) {
            return OrderedSet::new();
        }
        for &x in &graph.node(p).srcs {
            let xb = graph.base_of(x);
            if !graph.realized(xb) && xb != r {
                rc_parents.push(xb);
            }
        }
    }
    // search descendants of the reduceop that can cleanly group
    let mut descendants = OrderedSet::new();
    for tr in group.iter() {
        let st = graph.node(tr).st.clone();
        recursive_group(
            graph,
            tr,
            &st,
            tr,
            info,
            realizes,
            reduce_for_op,
            &mut descendants,
            &mut HashSet::new(),
        );
    }
    let mut merged = group.clone();
    if !descendants.iter().any(|d| group.contains(d)) {
        for d in descendants.iter() {
            merged.insert(d);
        }
    }
    merged
}

/// Find all realizes in the graph and group the output buffers into
/// kernels
pub(crate) fn get_output_groups(
    graph: &mut LazyGraph,
    outs: &[LbId],
    seen: &HashSet<LbId>,
    config: &Config,
) -> ScheduleResult<OutputGroups> {
    let info = discover(graph, outs)?;
    let mut realizes = info.realizes.clone();

    // pair reduces with elementwise consumers; realize what can't pair
    let mut reduce_for_op: BTreeMap<LbId, LbId> = BTreeMap::new();
    let mut reduce_of_const: Vec<LbId> = Vec::new();
    for r in info.allbufs.iter() {
        if !graph.node(r).op.is_some_and(Op::is_reduce) || realizes.contains(r) {
            continue;
        }

        let mut group = OrderedSet::new();
        let r_st = graph.node(r).st.clone();
        recursive_group(
            graph,
            r,
            &r_st,
            r,
            &info,
            &realizes,
            &reduce_for_op,
            &mut group,
            &mut HashSet::new(),
        );
        let mut can_chase = group.iter().all(|tr| !reduce_for_op.contains_key(&tr));
        let mut forced_realize = group.contains(r);
        if !forced_realize && group.len() > 1 {
            group = get_isolated_children(graph, r, &info, &realizes, &reduce_for_op, &group);
        }
        // can only fuse an assign if no other assign target is read here
        if !forced_realize
            && group
                .iter()
                .any(|x| graph.node(x).op == Some(Op::Meta(MetaOp::Assign)))
        {
            let mut parents: Vec<LbId> = std::iter::once(r).chain(group.iter()).collect();
            while let Some(top) = parents.pop() {
                if forced_realize {
                    break;
                }
                let p = graph.base_of(top);
                if graph.realized(p) || realizes.contains(p) {
                    if let Some(&assign) = info.assign_targets.get(&p) {
                        if !group.contains(assign) {
                            forced_realize = true;
                            can_chase = false;
                        }
                    }
                    continue;
                }
                parents.extend(graph.node(p).srcs.iter().copied());
            }
        }
        if forced_realize || group.is_empty() {
            let mut tr = r;
            if can_chase {
                // push the realize point to the furthest contiguous child
                let mut st = graph.node(tr).st.clone();
                while info.children_of(tr).len() == 1 {
                    let tr_next = info.children_of(tr)[0];
                    let mut st_childs: Vec<LbId> = Vec::new();
                    for &s in &graph.node(tr_next).srcs {
                        if graph.base_of(s) == tr && !st_childs.contains(&s) {
                            st_childs.push(s);
                        }
                    }
                    if st_childs.len() > 1 {
                        break;
                    }
                    if st.size() != graph.node(st_childs[0]).st.size() {
                        break;
                    }
                    st = &st + &graph.node(st_childs[0]).st;
                    if !st.contiguous() || graph.node(tr_next).op.is_some_and(Op::is_reduce) {
                        break;
                    }
                    tr = tr_next;
                }
                // never realize a cast up to a wider dtype
                let trn = graph.node(tr);
                if trn.op == Some(Op::Unary(UnaryOp::Cast))
                    && trn.dtype.itemsize() > graph.node(trn.srcs[0]).dtype.itemsize()
                {
                    tr = graph.base_of(trn.srcs[0]);
                }
                reduce_for_op.insert(tr, r);
            }
            realizes.insert(tr);
        } else {
            for tr in group.iter() {
                reduce_for_op.insert(tr, r);
            }
        }
        if config.fusion.fuse_arange
            && graph.node(r).op == Some(Op::Reduce(ReduceOp::Sum))
            && graph.node(graph.base_of(graph.node(r).srcs[0])).op == Some(Op::Meta(MetaOp::Const))
        {
            reduce_of_const.push(r);
        }
    }

    // fuse double reduces with no other child
    if config.fusion.fuse_conv_bw {
        for &rid in &info.double_reduces {
            let top_reduce = graph.base_of(graph.node(rid).srcs[0]);
            if info.children_of(top_reduce).len() == 1 {
                realizes.remove(top_reduce);
            }
        }
    }

    for &r in &reduce_of_const {
        let group: Vec<LbId> = reduce_for_op
            .iter()
            .filter(|&(_, &rop)| rop == r)
            .map(|(&tr, _)| tr)
            .collect();
        debug!(reduce = %r, ?group, "checking arange fold");
        if group.iter().any(|&tr| graph.node(tr).forced_realize)
            || outs.iter().any(|&x| group.contains(&graph.base_of(x)))
        {
            continue;
        }
        let mut kernel_children: HashSet<LbId> = HashSet::new();
        for &tr in &group {
            for &c in info.children_of(tr) {
                let op = graph.node(c).op;
                if op != Some(Op::Meta(MetaOp::Copy)) && op != Some(Op::Meta(MetaOp::View)) {
                    kernel_children.insert(c);
                }
            }
        }
        if kernel_children.is_empty() {
            continue;
        }
        debug!(reduce = %r, "folding const reduce");
        for &tr in &group {
            realizes.remove(tr);
        }
    }

    // assemble output groups, fixing up infeasible image dtypes
    let mut groups: Vec<(LbId, Vec<LbId>)> = Vec::new();
    for buf in realizes.iter() {
        if graph.realized(buf)
            || graph.node(buf).op == Some(Op::Meta(MetaOp::Const))
            || seen.contains(&buf)
        {
            continue;
        }
        let key = match reduce_for_op.get(&buf) {
            Some(&r) if config.fusion.multioutput => r,
            _ => buf,
        };
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, list)) => list.push(buf),
            None => groups.push((key, vec![buf])),
        }

        // make things that can't be images not images
        fixup_image_dtype(graph, buf)?;
    }

    Ok(OutputGroups {
        groups,
        realizes,
        assign_targets: info.assign_targets,
    })
}

/// Downgrade an image buffer whose declared shape disagrees with its
/// logical shape, or whose unit-stride axes are not 4-aligned
fn fixup_image_dtype(graph: &mut LazyGraph, buf: LbId) -> ScheduleResult<()> {
    let node = graph.node(buf);
    let DType::Image { shape: img_shape, .. } = &node.dtype else {
        return Ok(());
    };
    let logical: Vec<SInt> = node.shape().to_vec();
    let img_size: i64 = img_shape.iter().product();
    let aligned = node
        .st
        .unit_stride_axes()
        .iter()
        .any(|&x| logical[x].value() % 4 == 0);
    if prod(&logical) == img_size && aligned {
        return Ok(());
    }
    warn!(buf = %buf, dtype = %node.dtype, "forcing image to float32");
    graph.node_mut(buf).dtype = DType::FLOAT32;
    if graph.is_base(buf) {
        if let Some(handle) = graph.node(buf).buffer.clone() {
            if handle.allocated() {
                return Err(ScheduleError::ImageFixupAllocated);
            }
            handle.set_dtype(DType::FLOAT32);
        }
    }
    Ok(())
}
