//! # Kernel Scheduler
//!
//! Turns requested lazy-buffer outputs into an ordered list of
//! [`ScheduleItem`]s. The pipeline runs four phases over the immutable
//! graph:
//!
//! ```text
//! outputs: Vec<LbId>
//!     ↓
//! [Graph discovery]        → all reachable buffers, children edges,
//!     ↓                      assign targets, pad candidates
//! [Realization decision]   → the realize set + output groups
//!     ↓
//! [Kernel lowering]        → one AST (SINK of STOREs, or EXT) per group
//!     ↓
//! [Ordering]               → Kahn toposort with the assign barrier
//!     ↓
//! Vec<ScheduleItem>
//! ```
//!
//! A [`Scheduler`] value owns everything the pipeline needs across calls:
//! the loaded [`Config`], the kernel counter, the ops log handle, and the
//! schedule snapshots flushed when it drops. There are no globals.

pub mod discovery;
pub mod fusor;
pub mod grouping;
pub mod lowering;
pub mod ordering;

use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write as _;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{ScheduleError, ScheduleResult};
use crate::graph::{BufferHandle, LazyGraph, LbId, Metadata};
use crate::symbolic::Variable;
use crate::uop::{UOp, UOpKind};

/// An emitted kernel: the AST plus its buffers, outputs first.
///
/// For a `Sink` AST the first `ast.src.len()` buffers are outputs; an
/// `Ext` meta item has exactly one output. Zero-size buffers are dropped
/// from `bufs` before emission.
#[derive(Debug, Clone)]
pub struct ScheduleItem {
    pub ast: UOp,
    pub bufs: Vec<BufferHandle>,
    pub metadata: Option<Vec<Metadata>>,
}

impl ScheduleItem {
    /// Read/write or write-only buffers of this item
    pub fn outputs(&self) -> &[BufferHandle] {
        let n = if self.ast.op == UOpKind::Sink {
            self.ast.src.len().min(self.bufs.len())
        } else {
            1.min(self.bufs.len())
        };
        &self.bufs[..n]
    }

    /// Read-only buffers of this item
    pub fn inputs(&self) -> &[BufferHandle] {
        let n = if self.ast.op == UOpKind::Sink {
            self.ast.src.len().min(self.bufs.len())
        } else {
            1.min(self.bufs.len())
        };
        &self.bufs[n..]
    }
}

/// A lowered-but-unordered kernel, still talking about lazy buffers
#[derive(Debug)]
pub(crate) struct LbScheduleItem {
    pub ast: UOp,
    pub outputs: Vec<LbId>,
    pub inputs: Vec<LbId>,
    pub var_vals: BTreeMap<Variable, i64>,
    pub metadata: Vec<Metadata>,
}

/// An insertion-ordered set of buffer ids; the emitted kernel order
/// depends on insertion order.
#[derive(Debug, Default, Clone)]
pub(crate) struct OrderedSet {
    items: Vec<LbId>,
    set: HashSet<LbId>,
}

impl OrderedSet {
    pub fn new() -> OrderedSet {
        OrderedSet::default()
    }

    pub fn insert(&mut self, id: LbId) -> bool {
        if self.set.insert(id) {
            self.items.push(id);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, id: LbId) -> bool {
        self.set.contains(&id)
    }

    pub fn remove(&mut self, id: LbId) {
        if self.set.remove(&id) {
            self.items.retain(|&x| x != id);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = LbId> + '_ {
        self.items.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// One recorded schedule: item ASTs plus the dependency edges between them
#[derive(Debug, Serialize)]
struct ScheduleSnapshot {
    items: Vec<String>,
    edges: Vec<(usize, usize)>,
}

/// Scheduling context: configuration plus the process-wide state the
/// pipeline needs (kernel counter, ops log, snapshot buffer).
pub struct Scheduler {
    config: Config,
    kernel_count: usize,
    logops: Option<File>,
    snapshots: Vec<ScheduleSnapshot>,
}

impl Scheduler {
    pub fn new(config: Config) -> Scheduler {
        let logops = config.persist.logops.as_ref().and_then(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| warn!("cannot open ops log {}: {e}", path.display()))
                .ok()
        });
        Scheduler {
            config,
            kernel_count: 0,
            logops,
            snapshots: Vec::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Kernels emitted by this context so far
    pub fn kernel_count(&self) -> usize {
        self.kernel_count
    }

    /// Schedule `outs` and return the items plus the resolved symbolic
    /// variable map. `seen` carries already-scheduled roots across calls.
    pub fn create_schedule_with_vars(
        &mut self,
        graph: &mut LazyGraph,
        outs: &[LbId],
        seen: &mut HashSet<LbId>,
    ) -> ScheduleResult<(Vec<ScheduleItem>, BTreeMap<Variable, i64>)> {
        let groups = grouping::get_output_groups(graph, outs, seen, &self.config)?;

        // preschedule all buffers in the realize set
        let mut prescheduled: Vec<LbScheduleItem> = Vec::new();
        for (_, group) in &groups.groups {
            prescheduled.extend(lowering::lower_lazybuffer(
                graph,
                group,
                &groups.realizes,
                &self.config,
            )?);
        }

        let (edges, in_degree) = ordering::build_graph(&prescheduled, &groups.assign_targets);

        if self.config.persist.save_schedule {
            self.snapshots.push(ScheduleSnapshot {
                items: prescheduled.iter().map(|lsi| lsi.ast.to_string()).collect(),
                edges: edges
                    .iter()
                    .enumerate()
                    .flat_map(|(i, es)| es.iter().map(move |&j| (i, j)))
                    .collect(),
            });
        }

        let (schedule, var_vals) =
            ordering::toposort(self, graph, prescheduled, &edges, in_degree, seen)?;
        if schedule.len() >= 10 {
            debug!("scheduled {} kernels", schedule.len());
        }
        Ok((schedule, var_vals))
    }

    /// Schedule `outs`, requiring every symbolic variable to be resolved
    pub fn create_schedule(
        &mut self,
        graph: &mut LazyGraph,
        outs: &[LbId],
        seen: &mut HashSet<LbId>,
    ) -> ScheduleResult<Vec<ScheduleItem>> {
        let (schedule, var_vals) = self.create_schedule_with_vars(graph, outs, seen)?;
        if !var_vals.is_empty() {
            return Err(ScheduleError::UnresolvedVariables(var_vals.len()));
        }
        Ok(schedule)
    }

    pub(crate) fn log_ops(&mut self, item: &ScheduleItem) {
        let Some(f) = self.logops.as_mut() else {
            return;
        };
        if item.ast.op != UOpKind::Sink {
            return;
        }
        if item.inputs().iter().any(|b| b.device().starts_with("DISK:")) {
            return;
        }
        let line = item.ast.to_string().replace([' ', '\n'], "");
        if let Err(e) = writeln!(f, "{line}") {
            warn!("ops log write failed: {e}");
        }
    }

    pub(crate) fn bump_kernel_count(&mut self) -> usize {
        self.kernel_count += 1;
        self.kernel_count
    }
}

impl Drop for Scheduler {
    /// Flush recorded schedules
    fn drop(&mut self) {
        if !self.config.persist.save_schedule || self.snapshots.is_empty() {
            return;
        }
        let path = &self.config.persist.save_schedule_path;
        debug!(
            "saving {} schedule graphs to {}",
            self.snapshots.len(),
            path.display()
        );
        match File::create(path) {
            Ok(f) => {
                if let Err(e) = serde_json::to_writer(f, &self.snapshots) {
                    warn!("schedule snapshot write failed: {e}");
                }
            }
            Err(e) => warn!("cannot create {}: {e}", path.display()),
        }
    }
}
