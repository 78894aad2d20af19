//! Graph discovery: walk the lazy DAG from the requested outputs,
//! classify every reachable buffer exactly once, and record the
//! adjacency the later phases group over.
//!
//! Views are classified against their base: expands force the base to
//! realize (an expanded read would recompute the base per broadcast
//! element), masked views become pad-fusion candidates checked for safety
//! after the walk. Meta ops and `forced_realize` buffers realize
//! unconditionally.

use std::collections::{HashMap, HashSet};

use tracing::trace;

use crate::error::{ScheduleError, ScheduleResult};
use crate::graph::{LazyGraph, LbId};
use crate::ops::{MetaOp, Op, UnaryOp};
use crate::scheduler::OrderedSet;
use crate::symbolic::{all_int, prod};

/// Everything phase 1 learns about the reachable graph
#[derive(Debug, Default)]
pub(crate) struct GraphInfo {
    /// Buffers that must become kernel outputs
    pub realizes: OrderedSet,
    /// Every reachable base, in first-visit order
    pub allbufs: OrderedSet,
    /// Bases read through a masked view, pending the pad-safety check
    pub simple_pads: OrderedSet,
    /// base -> consumers (bases), in first-visit order
    pub children: HashMap<LbId, Vec<LbId>>,
    /// realized target -> the ASSIGN writing it
    pub assign_targets: HashMap<LbId, LbId>,
    /// Reduces whose source is a view of a same-kind reduce
    pub double_reduces: Vec<LbId>,
}

impl GraphInfo {
    pub fn children_of(&self, id: LbId) -> &[LbId] {
        self.children.get(&id).map_or(&[], Vec::as_slice)
    }
}

/// Walk the graph from every requested output
pub(crate) fn discover(graph: &LazyGraph, outs: &[LbId]) -> ScheduleResult<GraphInfo> {
    let mut info = GraphInfo::default();

    // the requested outputs themselves realize
    for &out in outs {
        let base = graph.base_of(out);
        if !graph.realized(base) {
            info.realizes.insert(base);
        }
    }

    // depth-first, first output's subtree fully before the second
    let mut stack: Vec<LbId> = outs.iter().rev().map(|&o| graph.base_of(o)).collect();
    let mut visited_views: HashSet<LbId> = HashSet::new();

    while let Some(id) = stack.pop() {
        if info.allbufs.contains(id) || graph.realized(id) {
            continue;
        }
        let node = graph.node(id);

        if !graph.is_base(id) {
            if !visited_views.insert(id) {
                continue;
            }
            classify_view(graph, id, &mut info);
            stack.push(node.base);
            continue;
        }

        trace!(buf = %id, op = ?node.op, "discovered");
        info.allbufs.insert(id);
        let op = node.op.expect("base carries an op");
        if node.forced_realize || op.is_meta() {
            info.realizes.insert(id);
        }
        match op {
            Op::Meta(MetaOp::Assign) => {
                let target = node.srcs[1];
                if !graph.is_base(target) {
                    return Err(ScheduleError::AssignToView);
                }
                if !graph.realized(target) {
                    return Err(ScheduleError::AssignNotRealized);
                }
                info.assign_targets.insert(target, id);
            }
            Op::Meta(MetaOp::Copy) => {
                let src = node.srcs[0];
                let srcn = graph.node(src);
                if !srcn.st.contiguous() || srcn.size() != graph.node(srcn.base).size() {
                    return Err(ScheduleError::CopySourceNotContiguous);
                }
                info.realizes.insert(graph.base_of(src));
            }
            Op::Meta(MetaOp::View) => {
                info.realizes.insert(graph.base_of(node.srcs[0]));
            }
            Op::Reduce(_) => {
                let src = node.srcs[0];
                if !graph.is_base(src) && graph.node(graph.base_of(src)).op == node.op {
                    info.double_reduces.push(id);
                }
            }
            _ => {}
        }
        for &x in &node.srcs {
            let xbase = graph.base_of(x);
            if !graph.realized(xbase) {
                let entry = info.children.entry(xbase).or_default();
                if !entry.contains(&id) {
                    entry.push(id);
                }
            }
        }
        for &x in node.srcs.iter().rev() {
            stack.push(x);
        }
    }

    // pads fused past an unsafe op would feed garbage into the kernel
    let pads: Vec<LbId> = info.simple_pads.iter().collect();
    for p in pads {
        if !padding_okay(graph, p, &info.realizes) {
            info.realizes.insert(p);
        }
    }

    Ok(info)
}

/// Decide what a non-base view means for its base
fn classify_view(graph: &LazyGraph, id: LbId, info: &mut GraphInfo) {
    let node = graph.node(id);
    let base = node.base;
    let bnode = graph.node(base);
    let last = node.st.views.last().expect("tracker has at least one view");

    let simple_pad = node.st.views.len() == 1
        && last.mask.is_some()
        && all_int(bnode.shape())
        && prod(bnode.shape())
            >= last
                .mask
                .as_ref()
                .map_or(0, |m| m.iter().map(|&(b, e)| e - b).product());

    if simple_pad {
        info.simple_pads.insert(base);
    } else if prod(bnode.shape()) < prod(node.shape()) {
        // realize before expand, except image-to-image casts
        let image_cast = bnode.op == Some(Op::Unary(UnaryOp::Cast))
            && bnode.dtype.is_image()
            && graph.node(bnode.srcs[0]).dtype.is_image();
        if image_cast {
            info.simple_pads.insert(base);
        } else {
            info.realizes.insert(base);
        }
    } else if node.st.views.iter().any(|v| v.mask.is_some()) {
        info.simple_pads.insert(base);
    }
}

/// A pad can fuse only if nothing feeding the padded value maps the
/// masked zeros to garbage
fn padding_okay(graph: &LazyGraph, id: LbId, realizes: &OrderedSet) -> bool {
    if realizes.contains(id) || graph.realized(id) {
        return true;
    }
    let node = graph.node(id);
    if node.op.is_some_and(Op::unsafe_when_padded) {
        return false;
    }
    node.srcs
        .iter()
        .all(|&x| padding_okay(graph, graph.base_of(x), realizes))
}
