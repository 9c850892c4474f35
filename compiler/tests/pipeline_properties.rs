use kernel_compiler::codegen::lir::Expr;
use kernel_compiler::codegen::{create_target, generate_lir, LirInst, LirUnit, TargetKind};
use kernel_compiler::ir::inlining::CalleeRegistry;
use kernel_compiler::ir::optimization::PhaseContext;
use kernel_compiler::ir::{Condition, GraphBuilder, KernelGraph, Kind, MethodId, Op, ParamType};
use kernel_compiler::pipeline::TierPipeline;
use kernel_compiler::{error_codes, CompileOptions, DeviceDescriptor, KernelCompiler};
use std::collections::HashSet;

/// `for (i = offset; i < range; i += stride) a[i] = i * 2`
fn parallel_fill() -> KernelGraph {
    let mut b = GraphBuilder::kernel(MethodId::new("Kernels", "fill"));
    let a = b.array_parameter("a", Kind::S32);
    let n = b.scalar_parameter("n", Kind::S32);
    let zero = b.int(0);
    let one = b.int(1);
    let two = b.int(2);
    let offset = b.parallel_offset(0, zero);
    let range = b.parallel_range(0, n);
    let stride = b.parallel_stride(0, one);
    let header = b.create_block();
    let body = b.create_block();
    let exit = b.create_block();
    b.jump(header).unwrap();
    b.switch_to_block(header);
    let i = b.phi(header, &[offset], Kind::S32).unwrap();
    let cond = b.compare(Condition::Lt, i, range);
    b.branch(cond, body, exit).unwrap();
    b.switch_to_block(body);
    let doubled = b.mul(i, two);
    b.write(a, i, doubled).unwrap();
    let next = b.add(i, stride);
    b.add_phi_input(i, next).unwrap();
    b.jump(header).unwrap();
    b.switch_to_block(exit);
    b.ret(None).unwrap();
    b.finish().unwrap()
}

fn lower(mut graph: KernelGraph, target: TargetKind, device: &DeviceDescriptor) -> (KernelGraph, LirUnit) {
    kernel_compiler::logging::init_test();
    let options = CompileOptions::default();
    let target = create_target(target);
    let callees = CalleeRegistry::new();
    let ctx = PhaseContext {
        options: &options,
        device,
        target: target.as_ref(),
        callees: &callees,
    };
    TierPipeline::new().run(&mut graph, &ctx).unwrap();
    let schedule = graph.schedule().unwrap().clone();
    let unit = generate_lir(&graph, &schedule, target.as_ref(), &options, device, "unit").unwrap();
    (graph, unit)
}

#[test]
fn test_compilation_is_deterministic() {
    let device = DeviceDescriptor::gpu("gpu0", 1024);
    for target in [TargetKind::Ptx, TargetKind::OpenCl, TargetKind::SpirV, TargetKind::Metal] {
        let compiler = KernelCompiler::new(target);
        let first = compiler.compile_uncached(&parallel_fill(), &device).unwrap();
        let second = compiler.compile_uncached(&parallel_fill(), &device).unwrap();
        assert_eq!(first.payload, second.payload, "{} output differs", target.name());
    }
}

#[test]
fn test_variables_are_contiguous_per_kind() {
    let device = DeviceDescriptor::gpu("gpu0", 1024);
    for target in [TargetKind::Ptx, TargetKind::OpenCl] {
        let (_, unit) = lower(parallel_fill(), target, &device);
        for (kind, vars) in &unit.variables {
            let indices: Vec<u32> = vars.iter().map(|v| v.index).collect();
            let expected: Vec<u32> = (0..vars.len() as u32).collect();
            assert_eq!(indices, expected, "{} variables of {}", kind, target.name());
            assert!(vars.iter().all(|v| v.kind == *kind));
        }
    }

    let (_, unit) = lower(parallel_fill(), TargetKind::Ptx, &device);
    let mut names = HashSet::new();
    for (_, vars) in &unit.variables {
        for var in vars {
            assert!(names.insert(var.name.clone()), "{} declared twice", var.name);
        }
    }
}

#[test]
fn test_no_parallel_markers_survive() {
    for units in [1, 1024] {
        let device = DeviceDescriptor::gpu("dev", units);
        let (graph, _) = lower(parallel_fill(), TargetKind::OpenCl, &device);
        assert!(!graph.nodes().any(|(_, n)| n.op.is_parallel_marker()));
        assert!(!graph
            .nodes()
            .any(|(_, n)| matches!(n.op, Op::Read { region: None, .. } | Op::Write { region: None })));
    }
}

#[test]
fn test_thread_ids_only_on_parallel_devices() {
    let compiler = KernelCompiler::new(TargetKind::OpenCl);
    let gpu = compiler
        .compile(&parallel_fill(), &DeviceDescriptor::gpu("gpu", 1024))
        .unwrap();
    let cpu = compiler
        .compile(&parallel_fill(), &DeviceDescriptor::gpu("cpu", 1))
        .unwrap();
    assert!(gpu.source().unwrap().contains("get_global_id(0)"));
    assert!(!cpu.source().unwrap().contains("get_global_id"));
}

#[test]
fn test_write_to_constant_parameter_fails() {
    let mut b = GraphBuilder::kernel(MethodId::new("Kernels", "poke"));
    let table = b.parameter(
        "table",
        ParamType::Array {
            element: Kind::S32,
            constant: true,
        },
    );
    let i = b.int(0);
    let v = b.int(1);
    b.write(table, i, v).unwrap();
    b.ret(None).unwrap();
    let graph = b.finish().unwrap();

    let compiler = KernelCompiler::new(TargetKind::Ptx);
    let err = compiler
        .compile(&graph, &DeviceDescriptor::gpu("gpu0", 256))
        .unwrap_err();
    assert_eq!(err.code(), error_codes::WRITE_TO_CONSTANT_REGION);
    assert!(compiler.cache().is_empty());
}

#[test]
fn test_switch_lowers_to_branch_chain() {
    let mut b = GraphBuilder::kernel(MethodId::new("Kernels", "pick"));
    let a = b.array_parameter("a", Kind::S32);
    let x = b.scalar_parameter("x", Kind::S32);
    let zero = b.int(0);
    let one = b.create_block();
    let two = b.create_block();
    let three = b.create_block();
    let other = b.create_block();
    let exit = b.create_block();
    b.switch(x, &[10, 20, 30], &[one, two, three], other).unwrap();
    for (block, value) in [(one, 1), (two, 2), (three, 3), (other, 4)] {
        b.switch_to_block(block);
        let v = b.int(value);
        b.write(a, zero, v).unwrap();
        b.jump(exit).unwrap();
    }
    b.switch_to_block(exit);
    b.ret(None).unwrap();
    let graph = b.finish().unwrap();

    let (_, unit) = lower(graph, TargetKind::Ptx, &DeviceDescriptor::gpu("gpu0", 256));
    let entry = &unit.blocks[0].instructions;
    let branches = entry
        .iter()
        .filter(|i| matches!(i, LirInst::Branch { .. }))
        .count();
    assert_eq!(branches, 3);
    assert!(matches!(entry.last(), Some(LirInst::Jump(_))));
    let predicates: HashSet<String> = entry
        .iter()
        .filter_map(|i| match i {
            LirInst::Branch { predicate, .. } => predicate.as_var().map(|v| v.name.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(predicates.len(), 3);
}

#[test]
fn test_select_compares_into_a_predicate() {
    let mut b = GraphBuilder::kernel(MethodId::new("Kernels", "max"));
    let a = b.array_parameter("a", Kind::F32);
    let x = b.scalar_parameter("x", Kind::F32);
    let y = b.scalar_parameter("y", Kind::F32);
    let gt = b.compare(Condition::Gt, x, y);
    let picked = b.select(gt, x, y);
    let i = b.int(0);
    b.write(a, i, picked).unwrap();
    b.ret(None).unwrap();
    let graph = b.finish().unwrap();

    let (_, unit) = lower(graph, TargetKind::Ptx, &DeviceDescriptor::gpu("gpu0", 256));
    let selects: Vec<&LirInst> = unit
        .instructions()
        .filter(|i| matches!(i, LirInst::Assign { expr: Expr::Ternary { .. }, .. }))
        .collect();
    assert_eq!(selects.len(), 1);
    match selects[0] {
        LirInst::Assign {
            dest,
            expr: Expr::Ternary { op, third, .. },
        } => {
            assert_eq!(dest.kind, Kind::F32);
            assert_eq!(op.mnemonic, "selp.f32");
            assert_eq!(third.kind(), Kind::PRED);
        }
        other => panic!("unexpected {:?}", other),
    }
}
