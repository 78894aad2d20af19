//! End-to-end scheduler tests
//!
//! Each test builds a small lazy graph, schedules it, and checks the
//! emitted items: kernel count, AST shape, buffer ordering, and the
//! universal scheduling invariants.

use std::collections::HashSet;

use lazylayer::{
    BinaryOp, Config, ConstValue, DType, ExtArg, LazyGraph, Op, ReduceOp, ScalarType,
    ScheduleItem, Scheduler, UArg, UOp, UOpKind,
};

fn schedule(graph: &mut LazyGraph, outs: &[lazylayer::LbId]) -> Vec<ScheduleItem> {
    Scheduler::new(Config::default())
        .create_schedule(graph, outs, &mut HashSet::new())
        .expect("schedules cleanly")
}

fn nodes_of_kind(ast: &UOp, kind: UOpKind) -> Vec<UOp> {
    ast.sparents()
        .into_iter()
        .filter(|u| u.op == kind)
        .collect()
}

fn store_tracker(store: &UOp) -> lazylayer::ShapeTracker {
    match &store.src[1].arg {
        UArg::Tracker(st) => st.clone(),
        other => panic!("store carries {other:?}"),
    }
}

#[test]
fn test_elementwise_chain_single_kernel() {
    // c = (a + b) * a over (4, 4)
    let mut g = LazyGraph::new();
    let a = g.input("CPU", DType::FLOAT32, &[4, 4]);
    let b = g.input("CPU", DType::FLOAT32, &[4, 4]);
    let add = g.alu(Op::Binary(BinaryOp::Add), &[a, b]);
    let c = g.alu(Op::Binary(BinaryOp::Mul), &[add, a]);

    let schedule = schedule(&mut g, &[c]);
    assert_eq!(schedule.len(), 1);
    let item = &schedule[0];
    assert_eq!(item.ast.op, UOpKind::Sink);
    assert_eq!(item.ast.src.len(), 1, "one STORE");
    assert_eq!(nodes_of_kind(&item.ast, UOpKind::Load).len(), 2, "a and b load once each");

    // ALU(Mul, ALU(Add, LOAD a, LOAD b), LOAD a)
    let mul = &item.ast.src[0].src[2];
    assert_eq!(mul.arg, UArg::Alu(Op::Binary(BinaryOp::Mul)));
    assert_eq!(mul.src[0].arg, UArg::Alu(Op::Binary(BinaryOp::Add)));
    assert_eq!(mul.src[1].op, UOpKind::Load);
    assert_eq!(mul.src[0].src[0], mul.src[1], "both reads of a share one node");

    // bufs: output first, then inputs in first-load order
    assert_eq!(item.bufs.len(), 3);
    assert_eq!(item.outputs().len(), 1);
    assert_eq!(item.outputs()[0], g.buffer_handle(c));
    assert_eq!(item.inputs(), &[g.buffer_handle(a), g.buffer_handle(b)]);
}

#[test]
fn test_single_reduce_kernel() {
    // y = sum(x, axis=1) over (8, 16)
    let mut g = LazyGraph::new();
    let x = g.input("CPU", DType::FLOAT32, &[8, 16]);
    let y = g.reduce(ReduceOp::Sum, x, &[1]);

    let schedule = schedule(&mut g, &[y]);
    assert_eq!(schedule.len(), 1);
    let store = &schedule[0].ast.src[0];
    assert_eq!(store.op, UOpKind::Store);
    assert!(matches!(store.src[0].arg, UArg::Buffer(0)));
    assert_eq!(store_tracker(store).size(), 8);

    let red = &store.src[2];
    assert_eq!(red.op, UOpKind::ReduceAxis);
    assert_eq!(red.arg, UArg::Reduce(BinaryOp::Add, vec![1]));
    assert_eq!(red.src[0].op, UOpKind::Load);
}

#[test]
fn test_elementwise_reduce_elementwise_fuses() {
    // z = relu(sum(a * b, axis=-1)) over (32, 64)
    let mut g = LazyGraph::new();
    let a = g.input("CPU", DType::FLOAT32, &[32, 64]);
    let b = g.input("CPU", DType::FLOAT32, &[32, 64]);
    let prod = g.alu(Op::Binary(BinaryOp::Mul), &[a, b]);
    let summed = g.reduce(ReduceOp::Sum, prod, &[1]);
    let zero = g.cnst(ConstValue::Float(0.0), DType::FLOAT32, &[32, 1]);
    let z = g.alu(Op::Binary(BinaryOp::Max), &[summed, zero]);

    let schedule = schedule(&mut g, &[z]);
    assert_eq!(schedule.len(), 1, "the whole chain is one kernel");
    let ast = &schedule[0].ast;
    assert_eq!(nodes_of_kind(ast, UOpKind::ReduceAxis).len(), 1);

    let relu = &ast.src[0].src[2];
    assert_eq!(relu.arg, UArg::Alu(Op::Binary(BinaryOp::Max)));
    assert_eq!(relu.src[0].op, UOpKind::ReduceAxis);
    assert_eq!(relu.src[1].op, UOpKind::Const);
    let mul = &relu.src[0].src[0];
    assert_eq!(mul.arg, UArg::Alu(Op::Binary(BinaryOp::Mul)));
}

#[test]
fn test_assign_reads_and_writes_same_buffer() {
    // a += 1
    let mut g = LazyGraph::new();
    let a = g.input("CPU", DType::FLOAT32, &[4, 4]);
    let one = g.cnst(ConstValue::Float(1.0), DType::FLOAT32, &[4, 4]);
    let bumped = g.alu(Op::Binary(BinaryOp::Add), &[a, one]);
    let asn = g.assign(a, bumped);

    let schedule = schedule(&mut g, &[asn]);
    assert_eq!(schedule.len(), 1);
    let item = &schedule[0];
    assert_eq!(item.outputs()[0], g.buffer_handle(a), "writes a's backing buffer");
    // the kernel also reads a, through the shared output slot
    let reads_g0 = nodes_of_kind(&item.ast, UOpKind::Load)
        .iter()
        .any(|l| l.src[0].arg == UArg::Buffer(0));
    assert!(reads_g0, "self operand loads buffer 0");
}

#[test]
fn test_unsafe_pad_splits_kernels() {
    // y = sum(pad(a / b)): the div cannot fuse under the pad mask
    let mut g = LazyGraph::new();
    let a = g.input("CPU", DType::FLOAT32, &[4]);
    let b = g.input("CPU", DType::FLOAT32, &[4]);
    let d = g.alu(Op::Binary(BinaryOp::Div), &[a, b]);
    let p = g.pad(d, &[(0, 1)]);
    let y = g.reduce(ReduceOp::Sum, p, &[0]);

    let schedule = schedule(&mut g, &[y]);
    assert_eq!(schedule.len(), 2, "pre-pad source realizes first");
    assert_eq!(schedule[0].outputs()[0], g.buffer_handle(d));
    // the reduce kernel reads d through the mask, with no div inside
    let reduce_item = &schedule[1];
    assert!(nodes_of_kind(&reduce_item.ast, UOpKind::Alu)
        .iter()
        .all(|u| u.arg != UArg::Alu(Op::Binary(BinaryOp::Div))));
    let masked = nodes_of_kind(&reduce_item.ast, UOpKind::Load)
        .iter()
        .any(|l| match &l.src[1].arg {
            UArg::Tracker(st) => st.views.iter().any(|v| v.mask.is_some()),
            _ => false,
        });
    assert!(masked, "pad survives as a masked load");
}

#[test]
fn test_large_reduce_splits_in_two() {
    let mut config = Config::default();
    config.fusion.ast_rewrite = true;

    let mut g = LazyGraph::new();
    let x = g.input("CPU", DType::FLOAT32, &[1024, 1024]);
    let y = g.reduce(ReduceOp::Sum, x, &[0, 1]);

    let schedule = Scheduler::new(config)
        .create_schedule(&mut g, &[y], &mut HashSet::new())
        .unwrap();
    assert_eq!(schedule.len(), 2, "partial reduce, then final reduce");
    for item in &schedule {
        assert_eq!(item.ast.op, UOpKind::Sink);
        assert_eq!(nodes_of_kind(&item.ast, UOpKind::ReduceAxis).len(), 1);
    }
    // the final kernel collapses to the logical reduce volume
    let final_store = &schedule[1].ast.src[0];
    assert_eq!(store_tracker(final_store).size(), 1);
    // the partial kernel holds the intermediate
    let partial_store = &schedule[0].ast.src[0];
    assert!(store_tracker(partial_store).size() > 1);
}

#[test]
fn test_schedule_is_deterministic() {
    fn build() -> (LazyGraph, Vec<lazylayer::LbId>) {
        let mut g = LazyGraph::new();
        let a = g.input("CPU", DType::FLOAT32, &[16, 32]);
        let b = g.input("CPU", DType::FLOAT32, &[16, 32]);
        let m = g.alu(Op::Binary(BinaryOp::Mul), &[a, b]);
        let r = g.reduce(ReduceOp::Sum, m, &[1]);
        let c = g.cnst(ConstValue::Float(2.0), DType::FLOAT32, &[16, 1]);
        let o1 = g.alu(Op::Binary(BinaryOp::Add), &[r, c]);
        let o2 = g.alu(Op::Binary(BinaryOp::Max), &[r, c]);
        let t = g.contiguous(b);
        (g, vec![o1, o2, t])
    }
    let render = |items: &[ScheduleItem]| -> Vec<String> {
        items
            .iter()
            .map(|i| format!("{} |{}", i.ast, i.bufs.len()))
            .collect()
    };
    let (mut g1, outs1) = build();
    let (mut g2, outs2) = build();
    let s1 = schedule(&mut g1, &outs1);
    let s2 = schedule(&mut g2, &outs2);
    assert_eq!(render(&s1), render(&s2));
}

#[test]
fn test_topological_soundness() {
    // diamond: two realized intermediates feeding one consumer
    let mut g = LazyGraph::new();
    let a = g.input("CPU", DType::FLOAT32, &[8]);
    let left = g.alu(Op::Unary(lazylayer::UnaryOp::Neg), &[a]);
    let left = g.contiguous(left);
    let right = g.alu(Op::Unary(lazylayer::UnaryOp::Sqrt), &[a]);
    let right = g.contiguous(right);
    let out = g.alu(Op::Binary(BinaryOp::Add), &[left, right]);

    let schedule = schedule(&mut g, &[out]);
    assert_eq!(schedule.len(), 3);
    // every input produced by another item comes from an earlier item
    for (i, item) in schedule.iter().enumerate() {
        for input in item.inputs() {
            if let Some(j) = schedule
                .iter()
                .position(|p| p.outputs().contains(input))
            {
                assert!(j < i, "producer {j} must precede consumer {i}");
            }
        }
    }
}

#[test]
fn test_assign_barrier_orders_readers_first() {
    // reader consumes a's old value; the assign must come after, no
    // matter the request order
    let mut g = LazyGraph::new();
    let a = g.input("CPU", DType::FLOAT32, &[4]);
    let b = g.input("CPU", DType::FLOAT32, &[4]);
    let reader = g.alu(Op::Binary(BinaryOp::Mul), &[a, b]);
    let one = g.cnst(ConstValue::Float(1.0), DType::FLOAT32, &[4]);
    let bumped = g.alu(Op::Binary(BinaryOp::Add), &[a, one]);
    let asn = g.assign(a, bumped);

    let schedule = schedule(&mut g, &[asn, reader]);
    assert_eq!(schedule.len(), 2);
    assert_eq!(schedule[0].outputs()[0], g.buffer_handle(reader));
    assert_eq!(schedule[1].outputs()[0], g.buffer_handle(a));
}

#[test]
fn test_outputs_schedule_once() {
    let mut g = LazyGraph::new();
    let a = g.input("CPU", DType::FLOAT32, &[4]);
    let b = g.input("CPU", DType::FLOAT32, &[4]);
    let out = g.alu(Op::Binary(BinaryOp::Add), &[a, b]);

    let mut seen = HashSet::new();
    let mut scheduler = Scheduler::new(Config::default());
    let first = scheduler
        .create_schedule(&mut g, &[out], &mut seen)
        .unwrap();
    assert_eq!(first.len(), 1);
    assert!(g.node(out).srcs.is_empty(), "sources detach at emission");

    // the same roots with the same seen set do not reschedule
    let second = scheduler
        .create_schedule(&mut g, &[out], &mut seen)
        .unwrap();
    assert!(second.is_empty());
}

#[test]
fn test_multioutput_shares_one_sink() {
    let mut g = LazyGraph::new();
    let x = g.input("CPU", DType::FLOAT32, &[8, 16]);
    let r = g.reduce(ReduceOp::Sum, x, &[1]);
    let c = g.cnst(ConstValue::Float(1.0), DType::FLOAT32, &[8, 1]);
    let o1 = g.alu(Op::Binary(BinaryOp::Add), &[r, c]);
    let o2 = g.alu(Op::Binary(BinaryOp::Mul), &[r, c]);

    let schedule = schedule(&mut g, &[o1, o2]);
    assert_eq!(schedule.len(), 1);
    let item = &schedule[0];
    assert_eq!(item.ast.src.len(), 2, "two STOREs under one SINK");
    assert_eq!(item.outputs().len(), 2);
    assert_eq!(
        nodes_of_kind(&item.ast, UOpKind::ReduceAxis).len(),
        1,
        "the shared reduce appears once"
    );
}

#[test]
fn test_load_trackers_are_simplify_stable() {
    let mut g = LazyGraph::new();
    let a = g.input("CPU", DType::FLOAT32, &[6, 4]);
    let t = g.permute(a, &[1, 0]);
    let r = g.reshape(t, &[2, 2, 6]);
    let p = g.pad(r, &[(0, 0), (1, 0), (0, 0)]);
    let out = g.reduce(ReduceOp::Sum, p, &[2]);

    let schedule = schedule(&mut g, &[out]);
    for item in &schedule {
        for load in nodes_of_kind(&item.ast, UOpKind::Load) {
            if let UArg::Tracker(st) = &load.src[1].arg {
                let (unbound, vars) = st.simplify().unbind();
                assert_eq!(&unbound, st, "emitted trackers are already simplified");
                assert!(vars.is_empty());
            }
        }
    }
}

#[test]
fn test_cross_device_copy_is_ext_item() {
    let mut g = LazyGraph::new();
    let a = g.input("CPU", DType::FLOAT32, &[4, 4]);
    let c = g.copy(a, "CUDA");

    let schedule = schedule(&mut g, &[c]);
    assert_eq!(schedule.len(), 1);
    let item = &schedule[0];
    assert_eq!(item.ast.op, UOpKind::Ext);
    assert_eq!(
        item.ast.arg,
        UArg::Ext(lazylayer::MetaOp::Copy, ExtArg::Bytes(64))
    );
    assert_eq!(item.outputs().len(), 1);
    assert_eq!(item.outputs()[0].device(), "CUDA");
    assert_eq!(item.inputs(), &[g.buffer_handle(a)]);
}

#[test]
fn test_same_device_copy_lowers_to_byte_kernel() {
    let mut config = Config::default();
    config.fusion.use_copy_kernel = true;

    let mut g = LazyGraph::new();
    let a = g.input("CUDA:0", DType::FLOAT32, &[4, 4]);
    let c = g.copy(a, "CUDA:1");

    let schedule = Scheduler::new(config)
        .create_schedule(&mut g, &[c], &mut HashSet::new())
        .unwrap();
    assert_eq!(schedule.len(), 1);
    let ast = &schedule[0].ast;
    assert_eq!(ast.op, UOpKind::Sink);
    let load = &ast.src[0].src[2];
    assert_eq!(load.op, UOpKind::Load);
    assert_eq!(load.dtype, Some(DType::Scalar(ScalarType::UInt8)));
    assert_eq!(store_tracker(&ast.src[0]).size(), 64, "moves raw bytes");
}

#[test]
fn test_non_contiguous_augmented_assign_is_rejected() {
    // a += f(a.T): the self operand reads a through a permuted view
    let mut g = LazyGraph::new();
    let a = g.input("CPU", DType::FLOAT32, &[4, 4]);
    let t = g.permute(a, &[1, 0]);
    let one = g.cnst(ConstValue::Float(1.0), DType::FLOAT32, &[4, 4]);
    let v = g.alu(Op::Binary(BinaryOp::Add), &[t, one]);
    let asn = g.assign(a, v);

    let err = Scheduler::new(Config::default()).create_schedule(&mut g, &[asn], &mut HashSet::new());
    match err {
        Err(lazylayer::ScheduleError::NonContiguousAssign) => {}
        other => panic!("expected contiguity rejection, got {other:?}"),
    }
}

#[test]
fn test_logops_appends_emitted_asts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ops.log");
    let mut config = Config::default();
    config.persist.logops = Some(path.clone());

    let mut g = LazyGraph::new();
    let a = g.input("CPU", DType::FLOAT32, &[4]);
    let b = g.input("CPU", DType::FLOAT32, &[4]);
    let out = g.alu(Op::Binary(BinaryOp::Add), &[a, b]);
    Scheduler::new(config)
        .create_schedule(&mut g, &[out], &mut HashSet::new())
        .unwrap();

    let logged = std::fs::read_to_string(&path).unwrap();
    assert_eq!(logged.lines().count(), 1);
    assert!(logged.contains("Store"));
}

#[test]
fn test_save_schedule_flushes_on_drop() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("schedule.json");
    let mut config = Config::default();
    config.persist.save_schedule = true;
    config.persist.save_schedule_path = path.clone();

    {
        let mut scheduler = Scheduler::new(config);
        let mut g = LazyGraph::new();
        let a = g.input("CPU", DType::FLOAT32, &[4]);
        let b = g.input("CPU", DType::FLOAT32, &[4]);
        let out = g.alu(Op::Binary(BinaryOp::Mul), &[a, b]);
        scheduler
            .create_schedule(&mut g, &[out], &mut HashSet::new())
            .unwrap();
        assert!(!path.exists(), "snapshots flush at drop, not during scheduling");
    }

    let saved: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(saved.as_array().unwrap().len(), 1);
}

#[test]
fn test_symbolic_shapes_resolve_via_vars() {
    use lazylayer::{SInt, ShapeTracker, Variable};

    let mut g = LazyGraph::new();
    let n = Variable::new("n", 1, 16).bind(8);
    let a = g.input("CPU", DType::FLOAT32, &[16]);
    // shrink a down to a bound symbolic length
    let view_st = ShapeTracker::from_shape(vec![SInt::Var(n.clone())]);
    let shrunk = g.shrink(a, &[(0, 8)]);
    let out = g.contiguous(shrunk);
    g.node_mut(out).st = view_st;

    let (schedule, var_vals) = Scheduler::new(Config::default())
        .create_schedule_with_vars(&mut g, &[out], &mut HashSet::new())
        .unwrap();
    assert_eq!(schedule.len(), 1);
    assert_eq!(var_vals.get(&Variable::new("n", 1, 16)), Some(&8));

    // create_schedule refuses unresolved variables by construction
    let mut g2 = LazyGraph::new();
    let a2 = g2.input("CPU", DType::FLOAT32, &[16]);
    let s2 = g2.shrink(a2, &[(0, 8)]);
    let out2 = g2.contiguous(s2);
    g2.node_mut(out2).st = ShapeTracker::from_shape(vec![SInt::Var(n)]);
    let err = Scheduler::new(Config::default()).create_schedule(&mut g2, &[out2], &mut HashSet::new());
    assert!(matches!(
        err,
        Err(lazylayer::ScheduleError::UnresolvedVariables(1))
    ));
}
