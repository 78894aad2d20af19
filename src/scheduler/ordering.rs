//! Ordering: build the dependency graph between lowered items and emit
//! them in Kahn topological order.
//!
//! Two edge kinds exist. A producer edge makes an item wait for every
//! item that outputs one of its inputs. An assign barrier points the
//! other way: every reader of a buffer's pre-assign value must emit
//! before the item that assigns it.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use tracing::trace;

use crate::error::{ScheduleError, ScheduleResult};
use crate::graph::{BufferHandle, LazyGraph, LbId};
use crate::scheduler::{LbScheduleItem, ScheduleItem, Scheduler};
use crate::symbolic::Variable;

/// Adjacency and in-degree over preschedule indices
pub(crate) fn build_graph(
    prescheduled: &[LbScheduleItem],
    assign_targets: &HashMap<LbId, LbId>,
) -> (Vec<Vec<usize>>, Vec<usize>) {
    // the producing item of every output; for split kernels the final
    // pass wins
    let mut schedule_targets: HashMap<LbId, usize> = HashMap::new();
    for (i, lsi) in prescheduled.iter().enumerate() {
        for &out in &lsi.outputs {
            schedule_targets.insert(out, i);
        }
    }

    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); prescheduled.len()];
    let mut in_degree: Vec<usize> = vec![0; prescheduled.len()];
    for (i, lsi) in prescheduled.iter().enumerate() {
        // realize outputs after all producing parents
        let mut parents: Vec<usize> = Vec::new();
        for x in &lsi.inputs {
            if let Some(&p) = schedule_targets.get(x) {
                if p != i && !parents.contains(&p) {
                    parents.push(p);
                }
            }
        }
        for p in parents {
            edges[p].push(i);
            in_degree[i] += 1;
        }
        // realize outputs before a parent is assigned to
        let mut assigns: Vec<usize> = Vec::new();
        for x in &lsi.inputs {
            if let Some(assign) = assign_targets.get(x) {
                if let Some(&a) = schedule_targets.get(assign) {
                    if a != i && !assigns.contains(&a) {
                        assigns.push(a);
                    }
                }
            }
        }
        for a in assigns {
            edges[i].push(a);
            in_degree[a] += 1;
        }
    }
    (edges, in_degree)
}

/// Kahn's algorithm over the item graph. Emitting an item marks its
/// outputs seen, detaches their sources (a buffer schedules once), binds
/// its buffers, and logs the AST when ops logging is on.
pub(crate) fn toposort(
    sched: &mut Scheduler,
    graph: &mut LazyGraph,
    prescheduled: Vec<LbScheduleItem>,
    edges: &[Vec<usize>],
    mut in_degree: Vec<usize>,
    seen: &mut HashSet<LbId>,
) -> ScheduleResult<(Vec<ScheduleItem>, BTreeMap<Variable, i64>)> {
    let mut queue: VecDeque<usize> = in_degree
        .iter()
        .enumerate()
        .filter_map(|(i, &d)| (d == 0).then_some(i))
        .collect();
    let mut schedule: Vec<ScheduleItem> = Vec::with_capacity(prescheduled.len());
    let mut var_vals: BTreeMap<Variable, i64> = BTreeMap::new();

    while let Some(i) = queue.pop_front() {
        let lsi = &prescheduled[i];
        for &out in &lsi.outputs {
            seen.insert(out);
        }
        let kernel = sched.bump_kernel_count();
        trace!(kernel, ast = %lsi.ast, "emit");
        var_vals.extend(lsi.var_vals.iter().map(|(k, v)| (k.clone(), *v)));
        for &out in &lsi.outputs {
            graph.clear_srcs(out);
        }
        let mut bufs: Vec<BufferHandle> = Vec::with_capacity(lsi.outputs.len() + lsi.inputs.len());
        for &x in lsi.outputs.iter().chain(&lsi.inputs) {
            if graph.node(x).size() != 0 {
                bufs.push(graph.buffer_handle(x));
            }
        }
        let item = ScheduleItem {
            ast: lsi.ast.clone(),
            bufs,
            metadata: if lsi.metadata.is_empty() {
                None
            } else {
                Some(lsi.metadata.clone())
            },
        };
        sched.log_ops(&item);
        schedule.push(item);
        for &next in &edges[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    // confirm everything was scheduled
    if in_degree.iter().any(|&d| d != 0) || prescheduled.len() != schedule.len() {
        return Err(ScheduleError::ScheduleCycle {
            prescheduled: prescheduled.len(),
            scheduled: schedule.len(),
        });
    }
    Ok((schedule, var_vals))
}
