//! # Lazy Buffer Graph
//!
//! The caller-facing data model: an arena of immutable lazy-buffer nodes
//! addressed by [`LbId`]. A *base* node carries a computation (its `op`);
//! a *view* node has no op and no sources, only a shape-tracker over its
//! `base`. Movement operations therefore never copy: they mint view nodes.
//!
//! The scheduler mutates nodes in exactly three ways: detaching `srcs`
//! once a buffer is scheduled, flipping `forced_realize`, and downgrading
//! infeasible image dtypes.

use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::dtype::DType;
use crate::ops::{MetaOp, Op, ReduceOp, UnaryOp};
use crate::shape::ShapeTracker;
use crate::symbolic::SInt;
use crate::uop::ConstValue;

/// Stable arena index of a lazy buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LbId(pub u32);

impl fmt::Display for LbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lb{}", self.0)
    }
}

/// Caller-provided tag propagated onto schedule items
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    pub name: String,
    pub caller: String,
}

impl Metadata {
    pub fn new(name: impl Into<String>, caller: impl Into<String>) -> Metadata {
        Metadata {
            name: name.into(),
            caller: caller.into(),
        }
    }
}

#[derive(Debug)]
struct BufferInner {
    device: String,
    dtype: DType,
    size: i64,
    allocated: bool,
}

/// An opaque device allocation record. The scheduler never allocates; it
/// references handles and may retype one that is not yet allocated.
/// Identity is by handle, not by contents.
#[derive(Debug, Clone)]
pub struct BufferHandle(Rc<RefCell<BufferInner>>);

impl BufferHandle {
    pub fn new(device: impl Into<String>, dtype: DType, size: i64) -> BufferHandle {
        BufferHandle(Rc::new(RefCell::new(BufferInner {
            device: device.into(),
            dtype,
            size,
            allocated: false,
        })))
    }

    pub fn device(&self) -> String {
        self.0.borrow().device.clone()
    }

    pub fn dtype(&self) -> DType {
        self.0.borrow().dtype.clone()
    }

    pub fn size(&self) -> i64 {
        self.0.borrow().size
    }

    pub fn allocated(&self) -> bool {
        self.0.borrow().allocated
    }

    /// Mark the handle as backed by device memory (the allocator's job;
    /// exposed so callers can hand the scheduler realized inputs)
    pub fn allocate(&self) {
        self.0.borrow_mut().allocated = true;
    }

    pub(crate) fn set_dtype(&self, dtype: DType) {
        self.0.borrow_mut().dtype = dtype;
    }
}

impl PartialEq for BufferHandle {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for BufferHandle {}

impl Hash for BufferHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.0) as usize).hash(state);
    }
}

/// Operation argument payload of a lazy buffer
#[derive(Debug, Clone, PartialEq)]
pub enum LbArg {
    None,
    /// Reduced axes
    Axis(Vec<usize>),
    /// Constant value (possibly a bound symbolic variable)
    Const(ConstValue),
    /// Cast target dtype
    Dtype(DType),
    /// Copy size in bytes
    Bytes(i64),
    /// Assign-through-view tracker
    Tracker(ShapeTracker),
    /// Opaque custom-kernel payload
    Custom(String),
}

/// One node of the lazy graph
#[derive(Debug)]
pub struct LazyBuffer {
    /// `None` for view nodes; views carry no computation
    pub op: Option<Op>,
    pub dtype: DType,
    pub srcs: Vec<LbId>,
    pub arg: LbArg,
    /// Maps this node's logical indices to its base's buffer
    pub st: ShapeTracker,
    /// Self for bases, the canonical node for views
    pub base: LbId,
    /// Backing allocation; bases only, and never for consts
    pub buffer: Option<BufferHandle>,
    pub metadata: Option<Metadata>,
    pub forced_realize: bool,
    pub device: String,
    /// Set when the buffer has been scheduled (sources detached); a
    /// buffer with a backing record and detached sources is *realized*
    pub scheduled: bool,
}

impl LazyBuffer {
    pub fn shape(&self) -> &[SInt] {
        self.st.shape()
    }

    pub fn size(&self) -> i64 {
        self.st.size()
    }
}

/// Arena of lazy buffers plus the constructor API the tensor front-end
/// (or a test) uses to build graphs.
#[derive(Debug, Default)]
pub struct LazyGraph {
    nodes: Vec<LazyBuffer>,
}

impl LazyGraph {
    pub fn new() -> LazyGraph {
        LazyGraph { nodes: Vec::new() }
    }

    pub fn node(&self, id: LbId) -> &LazyBuffer {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: LbId) -> &mut LazyBuffer {
        &mut self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn base_of(&self, id: LbId) -> LbId {
        self.node(id).base
    }

    pub fn is_base(&self, id: LbId) -> bool {
        self.node(id).base == id
    }

    /// True when the node's base has a backing record and detached
    /// sources. An unscheduled assign shares its target's (allocated)
    /// buffer yet is not realized until it emits.
    pub fn realized(&self, id: LbId) -> bool {
        let base = self.node(self.base_of(id));
        base.buffer.is_some() && base.scheduled
    }

    /// The backing handle of a base, creating an unallocated record on
    /// first use. Consts have no backing.
    pub fn buffer_handle(&mut self, id: LbId) -> BufferHandle {
        debug_assert!(self.is_base(id));
        if self.node(id).buffer.is_none() {
            let node = self.node(id);
            let handle = BufferHandle::new(node.device.clone(), node.dtype.clone(), node.size());
            self.node_mut(id).buffer = Some(handle);
        }
        self.node(id).buffer.clone().expect("just created")
    }

    /// Detach sources once the buffer is scheduled; a buffer schedules
    /// exactly once
    pub(crate) fn clear_srcs(&mut self, id: LbId) {
        let node = self.node_mut(id);
        node.srcs.clear();
        node.scheduled = true;
    }

    fn push(&mut self, mut node: LazyBuffer, base: Option<LbId>) -> LbId {
        let id = LbId(self.nodes.len() as u32);
        node.base = base.unwrap_or(id);
        self.nodes.push(node);
        id
    }

    fn base_node(
        &mut self,
        op: Op,
        dtype: DType,
        srcs: Vec<LbId>,
        arg: LbArg,
        st: ShapeTracker,
        device: String,
    ) -> LbId {
        self.push(
            LazyBuffer {
                op: Some(op),
                dtype,
                srcs,
                arg,
                st,
                base: LbId(0),
                buffer: None,
                metadata: None,
                forced_realize: false,
                device,
                scheduled: false,
            },
            None,
        )
    }

    // ---- graph construction API ----

    /// An already-realized device buffer (an input tensor)
    pub fn input(&mut self, device: impl Into<String>, dtype: DType, dims: &[i64]) -> LbId {
        let id = self.empty(device, dtype, dims);
        self.buffer_handle(id).allocate();
        self.node_mut(id).scheduled = true;
        id
    }

    /// An unallocated placeholder buffer
    pub fn empty(&mut self, device: impl Into<String>, dtype: DType, dims: &[i64]) -> LbId {
        self.base_node(
            Op::Meta(MetaOp::Empty),
            dtype,
            vec![],
            LbArg::None,
            ShapeTracker::from_dims(dims),
            device.into(),
        )
    }

    /// A constant broadcast to `dims`: a rank-matched size-1 base expanded
    /// by a view
    pub fn cnst(&mut self, value: ConstValue, dtype: DType, dims: &[i64]) -> LbId {
        let ones = vec![1i64; dims.len().max(1)];
        let base = self.base_node(
            Op::Meta(MetaOp::Const),
            dtype,
            vec![],
            LbArg::Const(value),
            ShapeTracker::from_dims(&ones),
            "CPU".into(),
        );
        if dims.iter().all(|&d| d == 1) || dims.is_empty() {
            return base;
        }
        self.expand(base, dims)
    }

    /// Elementwise op over same-shape sources
    pub fn alu(&mut self, op: Op, srcs: &[LbId]) -> LbId {
        debug_assert!(!op.is_meta() && !op.is_reduce());
        let first = self.node(srcs[0]);
        let st = ShapeTracker::from_shape(first.shape().to_vec());
        let (dtype, device) = (first.dtype.clone(), first.device.clone());
        self.base_node(op, dtype, srcs.to_vec(), LbArg::None, st, device)
    }

    pub fn cast(&mut self, src: LbId, dtype: DType) -> LbId {
        let node = self.node(src);
        let st = ShapeTracker::from_shape(node.shape().to_vec());
        let device = node.device.clone();
        self.base_node(
            Op::Unary(UnaryOp::Cast),
            dtype.clone(),
            vec![src],
            LbArg::Dtype(dtype),
            st,
            device,
        )
    }

    pub fn bitcast(&mut self, src: LbId, dtype: DType) -> LbId {
        let node = self.node(src);
        let st = ShapeTracker::from_shape(node.shape().to_vec());
        let device = node.device.clone();
        self.base_node(
            Op::Unary(UnaryOp::Bitcast),
            dtype.clone(),
            vec![src],
            LbArg::Dtype(dtype),
            st,
            device,
        )
    }

    /// Reduce `axes` of `src`; reduced dimensions stay in the shape as 1
    pub fn reduce(&mut self, rop: ReduceOp, src: LbId, axes: &[usize]) -> LbId {
        let node = self.node(src);
        let st = ShapeTracker::from_shape(node.st.reduce(axes));
        let (dtype, device) = (node.dtype.clone(), node.device.clone());
        self.base_node(
            Op::Reduce(rop),
            dtype,
            vec![src],
            LbArg::Axis(axes.to_vec()),
            st,
            device,
        )
    }

    /// Realization barrier: the value is computed into its own buffer
    pub fn contiguous(&mut self, src: LbId) -> LbId {
        let node = self.node(src);
        let st = ShapeTracker::from_shape(node.shape().to_vec());
        let (dtype, device) = (node.dtype.clone(), node.device.clone());
        self.base_node(
            Op::Meta(MetaOp::Contiguous),
            dtype,
            vec![src],
            LbArg::None,
            st,
            device,
        )
    }

    /// In-place update of an already-realized `target` with `value`.
    /// The assign node shares the target's backing buffer.
    pub fn assign(&mut self, target: LbId, value: LbId) -> LbId {
        let node = self.node(target);
        let st = ShapeTracker::from_shape(node.shape().to_vec());
        let (dtype, device) = (node.dtype.clone(), node.device.clone());
        let id = self.base_node(
            Op::Meta(MetaOp::Assign),
            dtype,
            vec![value, target],
            LbArg::None,
            st,
            device,
        );
        let target_buffer = self.node(target).buffer.clone();
        self.node_mut(id).buffer = target_buffer;
        id
    }

    /// Cross-device (or same-device) copy of a contiguous source
    pub fn copy(&mut self, src: LbId, device: impl Into<String>) -> LbId {
        let node = self.node(src);
        let st = ShapeTracker::from_shape(node.shape().to_vec());
        let dtype = node.dtype.clone();
        let nbytes = node.size() * dtype.itemsize();
        self.base_node(
            Op::Meta(MetaOp::Copy),
            dtype,
            vec![src],
            LbArg::Bytes(nbytes),
            st,
            device.into(),
        )
    }

    /// Opaque custom kernel over realized sources
    pub fn custom(&mut self, payload: impl Into<String>, srcs: &[LbId], dims: &[i64]) -> LbId {
        let first = self.node(srcs[0]);
        let (dtype, device) = (first.dtype.clone(), first.device.clone());
        self.base_node(
            Op::Meta(MetaOp::Custom),
            dtype,
            srcs.to_vec(),
            LbArg::Custom(payload.into()),
            ShapeTracker::from_dims(dims),
            device,
        )
    }

    // ---- movement ops: all mint view nodes over the source's base ----

    fn view(&mut self, src: LbId, st: ShapeTracker) -> LbId {
        if st == self.node(src).st {
            return src;
        }
        let node = self.node(src);
        let (dtype, device, base) = (node.dtype.clone(), node.device.clone(), node.base);
        self.push(
            LazyBuffer {
                op: None,
                dtype,
                srcs: vec![],
                arg: LbArg::None,
                st,
                base: LbId(0),
                buffer: None,
                metadata: None,
                forced_realize: false,
                device,
                scheduled: false,
            },
            Some(base),
        )
    }

    pub fn reshape(&mut self, src: LbId, dims: &[i64]) -> LbId {
        let new_shape: Vec<SInt> = dims.iter().map(|&d| SInt::Const(d)).collect();
        let st = self.node(src).st.reshape(&new_shape);
        self.view(src, st)
    }

    pub fn permute(&mut self, src: LbId, order: &[usize]) -> LbId {
        let st = self.node(src).st.permute(order);
        self.view(src, st)
    }

    pub fn pad(&mut self, src: LbId, arg: &[(i64, i64)]) -> LbId {
        let st = self.node(src).st.pad(arg);
        self.view(src, st)
    }

    pub fn shrink(&mut self, src: LbId, arg: &[(i64, i64)]) -> LbId {
        let st = self.node(src).st.shrink(arg);
        self.view(src, st)
    }

    pub fn expand(&mut self, src: LbId, dims: &[i64]) -> LbId {
        let new_shape: Vec<SInt> = dims.iter().map(|&d| SInt::Const(d)).collect();
        let st = self.node(src).st.expand(&new_shape);
        self.view(src, st)
    }

    pub fn set_metadata(&mut self, id: LbId, metadata: Metadata) {
        self.node_mut(id).metadata = Some(metadata);
    }

    pub fn set_forced_realize(&mut self, id: LbId) {
        self.node_mut(id).forced_realize = true;
    }
}
