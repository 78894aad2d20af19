//! # LazyLayer Kernel Scheduler
//!
//! The scheduling core of a lazy tensor compute engine: given the output
//! nodes of a lazy computation graph, decide which buffers become kernel
//! boundaries, fuse reduces with their elementwise consumers, lower each
//! group to a self-contained kernel AST, and order the kernels so every
//! dependency (including in-place assigns) holds.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! LazyGraph + requested outputs
//!     ↓
//! [Graph Discovery]       → allbufs, children, assign targets, pads
//!     ↓
//! [Realization Decision]  → realize set, reduce fusion groups
//!     ↓
//! [Kernel Lowering]       → UOp AST per group (reduce merge/swizzle/split)
//!     ↓
//! [Ordering]              → Kahn toposort with assign barrier
//!     ↓
//! Vec<ScheduleItem> (+ resolved symbolic variables)
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use lazylayer::{Config, LazyGraph, Scheduler};
//! use lazylayer::{BinaryOp, DType, Op, ReduceOp};
//! use std::collections::HashSet;
//!
//! let mut graph = LazyGraph::new();
//! let a = graph.input("CPU", DType::FLOAT32, &[8, 16]);
//! let b = graph.input("CPU", DType::FLOAT32, &[8, 16]);
//! let prod = graph.alu(Op::Binary(BinaryOp::Mul), &[a, b]);
//! let out = graph.reduce(ReduceOp::Sum, prod, &[1]);
//!
//! let mut scheduler = Scheduler::new(Config::load()?);
//! let schedule = scheduler.create_schedule(&mut graph, &[out], &mut HashSet::new())?;
//! // one fused kernel: SINK(STORE(.., REDUCE_AXIS(ALU(Mul, LOAD a, LOAD b))))
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `graph` | Lazy-buffer arena and construction API |
//! | `shape` | Shape-tracker view algebra |
//! | `symbolic` | Bound symbolic dimensions |
//! | `ops` / `dtype` | Operation tags and element types |
//! | `uop` | Kernel AST nodes + pattern rewrite engine |
//! | `scheduler` | The four-phase scheduling pipeline |
//! | `config` | Layered configuration (toml + env) |

pub mod config;
pub mod dtype;
pub mod error;
pub mod graph;
pub mod ops;
pub mod scheduler;
pub mod shape;
pub mod symbolic;
pub mod uop;

// Re-export the working set
pub use crate::config::Config;
pub use crate::dtype::{DType, ScalarType};
pub use crate::error::{ScheduleError, ScheduleResult};
pub use crate::graph::{BufferHandle, LazyGraph, LbId, Metadata};
pub use crate::ops::{BinaryOp, MetaOp, Op, ReduceOp, TernaryOp, UnaryOp};
pub use crate::scheduler::{ScheduleItem, Scheduler};
pub use crate::shape::{ShapeTracker, View};
pub use crate::symbolic::{SInt, Variable};
pub use crate::uop::{ConstValue, ExtArg, UArg, UOp, UOpKind};
