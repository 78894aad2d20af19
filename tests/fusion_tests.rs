//! Fusion-decision tests: arange folding, double-reduce fusion, chase
//! behavior, and image dtype fix-up, each driven through a full
//! scheduling pass.

use std::collections::HashSet;

use lazylayer::{
    BinaryOp, Config, ConstValue, DType, LazyGraph, LbId, Op, ReduceOp, ScalarType, ScheduleItem,
    Scheduler, UArg, UOpKind,
};

fn run(config: Config, graph: &mut LazyGraph, outs: &[LbId]) -> Vec<ScheduleItem> {
    Scheduler::new(config)
        .create_schedule(graph, outs, &mut HashSet::new())
        .expect("schedules cleanly")
}

/// arange-style graph: reduce of a broadcast const feeding an
/// elementwise op feeding a second reduce
fn arange_graph(g: &mut LazyGraph) -> (LbId, LbId, LbId) {
    let ones = g.cnst(ConstValue::Float(1.0), DType::FLOAT32, &[8, 8]);
    let r1 = g.reduce(ReduceOp::Sum, ones, &[1]);
    let x = g.input("CPU", DType::FLOAT32, &[8, 1]);
    let m = g.alu(Op::Binary(BinaryOp::Mul), &[r1, x]);
    let r2 = g.reduce(ReduceOp::Sum, m, &[0]);
    (r1, m, r2)
}

#[test]
fn test_arange_fold_removes_const_reduce_kernel() {
    // without folding the const reduce realizes at its chased child
    let mut g = LazyGraph::new();
    let (_, _, r2) = arange_graph(&mut g);
    let schedule = run(Config::default(), &mut g, &[r2]);
    assert_eq!(schedule.len(), 2);

    // with folding it disappears into the downstream kernel
    let mut config = Config::default();
    config.fusion.fuse_arange = true;
    let mut g = LazyGraph::new();
    let (r1, _, r2) = arange_graph(&mut g);
    let schedule = run(config, &mut g, &[r2]);
    assert_eq!(schedule.len(), 1, "const reduce folds downstream");
    let r1_buf = g.buffer_handle(r1);
    for item in &schedule {
        assert!(
            !item.outputs().contains(&r1_buf),
            "a folded reduce is never a kernel output"
        );
    }
}

#[test]
fn test_arange_fold_skips_requested_outputs() {
    // if the fold candidate's group member is itself requested, keep it
    let mut config = Config::default();
    config.fusion.fuse_arange = true;
    let mut g = LazyGraph::new();
    let (_, m, r2) = arange_graph(&mut g);
    let schedule = run(config, &mut g, &[r2, m]);
    assert_eq!(schedule.len(), 2, "requested outputs are not folded away");
    let m_buf = g.buffer_handle(m);
    assert!(schedule.iter().any(|i| i.outputs().contains(&m_buf)));
}

#[test]
fn test_double_reduce_fuses_with_flag() {
    fn build(g: &mut LazyGraph) -> LbId {
        let x = g.input("CPU", DType::FLOAT32, &[4, 8, 16]);
        let r1 = g.reduce(ReduceOp::Sum, x, &[2]);
        let v = g.reshape(r1, &[4, 8]);
        g.reduce(ReduceOp::Sum, v, &[1])
    }
    let mut g = LazyGraph::new();
    let r2 = build(&mut g);
    assert_eq!(run(Config::default(), &mut g, &[r2]).len(), 2);

    let mut config = Config::default();
    config.fusion.fuse_conv_bw = true;
    let mut g = LazyGraph::new();
    let r2 = build(&mut g);
    let schedule = run(config, &mut g, &[r2]);
    assert_eq!(schedule.len(), 1, "both reduces share one kernel");
    let reduces: Vec<_> = schedule[0]
        .ast
        .sparents()
        .into_iter()
        .filter(|u| u.op == UOpKind::ReduceAxis)
        .collect();
    assert_eq!(reduces.len(), 1, "the reduces merge into one");
    assert_eq!(
        reduces[0].arg,
        UArg::Reduce(BinaryOp::Add, vec![1, 2]),
        "merged over the union of axes"
    );
}

#[test]
fn test_double_reduce_merges_under_rewrite_lowering() {
    let mut config = Config::default();
    config.fusion.fuse_conv_bw = true;
    config.fusion.ast_rewrite = true;

    let mut g = LazyGraph::new();
    let x = g.input("CPU", DType::FLOAT32, &[4, 8, 16]);
    let r1 = g.reduce(ReduceOp::Sum, x, &[2]);
    let v = g.reshape(r1, &[4, 8]);
    let r2 = g.reduce(ReduceOp::Sum, v, &[1]);

    let schedule = run(config, &mut g, &[r2]);
    assert_eq!(schedule.len(), 1);
    let reduces: Vec<_> = schedule[0]
        .ast
        .sparents()
        .into_iter()
        .filter(|u| u.op == UOpKind::ReduceAxis)
        .collect();
    assert_eq!(reduces.len(), 1);
    assert_eq!(reduces[0].arg, UArg::Reduce(BinaryOp::Add, vec![1, 2]));
}

#[test]
fn test_chase_stops_before_widening_cast() {
    // the boundary never lands on a cast to a wider dtype
    let mut g = LazyGraph::new();
    let x = g.input("CPU", DType::Scalar(ScalarType::Float16), &[8, 16]);
    let r = g.reduce(ReduceOp::Sum, x, &[1]);
    let widened = g.cast(r, DType::FLOAT32);
    let r2 = g.reduce(ReduceOp::Sum, widened, &[0]);

    let schedule = run(Config::default(), &mut g, &[r2]);
    assert_eq!(schedule.len(), 2);
    // the first kernel stores the narrow dtype; the cast waits for the
    // second kernel
    let first = &schedule[0];
    assert_eq!(
        first.outputs()[0].dtype(),
        DType::Scalar(ScalarType::Float16)
    );
    assert!(first
        .ast
        .sparents()
        .iter()
        .all(|u| u.op != UOpKind::Cast));
    assert!(schedule[1]
        .ast
        .sparents()
        .iter()
        .any(|u| u.op == UOpKind::Cast));
}

#[test]
fn test_chase_lands_on_last_contiguous_child() {
    // reduce -> add -> mul -> (second reduce): boundary chases to mul
    let mut g = LazyGraph::new();
    let x = g.input("CPU", DType::FLOAT32, &[8, 16]);
    let r = g.reduce(ReduceOp::Sum, x, &[1]);
    let c = g.cnst(ConstValue::Float(3.0), DType::FLOAT32, &[8, 1]);
    let add = g.alu(Op::Binary(BinaryOp::Add), &[r, c]);
    let mul = g.alu(Op::Binary(BinaryOp::Mul), &[add, add]);
    let r2 = g.reduce(ReduceOp::Max, mul, &[0]);

    let schedule = run(Config::default(), &mut g, &[r2]);
    assert_eq!(schedule.len(), 2);
    assert_eq!(schedule[0].outputs()[0], g.buffer_handle(mul));
}

#[test]
fn test_image_dtype_downgrade_end_to_end() {
    let mut g = LazyGraph::new();
    let a = g.input("GPU", DType::FLOAT32, &[4, 6]);
    let b = g.input("GPU", DType::FLOAT32, &[4, 6]);
    let s = g.alu(Op::Binary(BinaryOp::Add), &[a, b]);
    // declared image geometry disagrees with the logical 24 elements
    g.node_mut(s).dtype = DType::Image {
        base: ScalarType::Float32,
        shape: vec![4, 4, 4],
    };

    let schedule = run(Config::default(), &mut g, &[s]);
    assert_eq!(g.node(s).dtype, DType::FLOAT32);
    for item in &schedule {
        for u in item.ast.sparents() {
            if u.op == UOpKind::DefineGlobal {
                assert!(
                    !u.dtype.as_ref().is_some_and(DType::is_image),
                    "no image buffer op survives the downgrade"
                );
            }
        }
        for buf in &item.bufs {
            assert!(!buf.dtype().is_image());
        }
    }
}
