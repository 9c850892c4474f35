//! Benchmarks for end-to-end kernel compilation

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kernel_compiler::ir::{Condition, GraphBuilder, KernelGraph, Kind, MethodId};
use kernel_compiler::{DeviceDescriptor, KernelCompiler, TargetKind};

/// A parallel loop whose body is a chain of `depth` multiply-adds.
fn generate_saxpy_chain(depth: usize) -> KernelGraph {
    let mut b = GraphBuilder::kernel(MethodId::new("Bench", format!("chain{}", depth)));
    let x = b.array_parameter("x", Kind::F32);
    let y = b.array_parameter("y", Kind::F32);
    let alpha = b.scalar_parameter("alpha", Kind::F32);
    let n = b.scalar_parameter("n", Kind::S32);
    let zero = b.int(0);
    let one = b.int(1);
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
    let mut acc = b.read(y, i, Kind::F32).unwrap();
    let xi = b.read(x, i, Kind::F32).unwrap();
    for _ in 0..depth {
        let scaled = b.mul(alpha, xi);
        acc = b.add(scaled, acc);
    }
    b.write(y, i, acc).unwrap();
    let next = b.add(i, stride);
    b.add_phi_input(i, next).unwrap();
    b.jump(header).unwrap();
    b.switch_to_block(exit);
    b.ret(None).unwrap();
    b.finish().unwrap()
}

fn bench_targets(c: &mut Criterion) {
    let graph = generate_saxpy_chain(16);
    let device = DeviceDescriptor::gpu("bench", 1024);
    let mut group = c.benchmark_group("compile_target");
    for target in [TargetKind::Ptx, TargetKind::OpenCl, TargetKind::SpirV, TargetKind::Metal] {
        let compiler = KernelCompiler::new(target);
        group.bench_with_input(BenchmarkId::from_parameter(target.name()), &graph, |b, graph| {
            b.iter(|| compiler.compile_uncached(black_box(graph), &device).unwrap());
        });
    }
    group.finish();
}

fn bench_body_size(c: &mut Criterion) {
    let device = DeviceDescriptor::gpu("bench", 1024);
    let compiler = KernelCompiler::new(TargetKind::Ptx);
    let mut group = c.benchmark_group("compile_body_size");
    for depth in [4, 32, 128] {
        let graph = generate_saxpy_chain(depth);
        group.bench_with_input(BenchmarkId::from_parameter(depth), &graph, |b, graph| {
            b.iter(|| compiler.compile_uncached(black_box(graph), &device).unwrap());
        });
    }
    group.finish();
}

fn bench_cache_hit(c: &mut Criterion) {
    let device = DeviceDescriptor::gpu("bench", 1024);
    let compiler = KernelCompiler::new(TargetKind::OpenCl);
    let graph = generate_saxpy_chain(16);
    compiler.compile(&graph, &device).unwrap();
    c.bench_function("cache_hit", |b| {
        b.iter(|| compiler.compile(black_box(&graph), &device).unwrap());
    });
}

criterion_group!(benches, bench_targets, bench_body_size, bench_cache_hit);
criterion_main!(benches);
