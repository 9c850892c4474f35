use kernel_compiler::codegen::spirv_backend::is_spirv_module;
use kernel_compiler::ir::{AtomicOp, Condition, GraphBuilder, KernelGraph, Kind, MethodId};
use kernel_compiler::{error_codes, CompileOptions, DeviceDescriptor, KernelCompiler, Payload, TargetKind};

/// `a[i] = a[i] * 2.0` for a thread-indexed `i`
fn scale() -> KernelGraph {
    let mut b = GraphBuilder::kernel(MethodId::new("Blas", "scale"));
    let a = b.array_parameter("a", Kind::F32);
    let n = b.scalar_parameter("n", Kind::S32);
    let zero = b.int(0);
    let one = b.int(1);
    let two = b.float(2.0);
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
    let x = b.read(a, i, Kind::F32).unwrap();
    let y = b.mul(x, two);
    b.write(a, i, y).unwrap();
    let next = b.add(i, stride);
    b.add_phi_input(i, next).unwrap();
    b.jump(header).unwrap();
    b.switch_to_block(exit);
    b.ret(None).unwrap();
    b.finish().unwrap()
}

fn clamp() -> KernelGraph {
    let mut b = GraphBuilder::callee(MethodId::new("Math", "clamp"), Kind::S32);
    let x = b.scalar_parameter("x", Kind::S32);
    let zero = b.int(0);
    let cond = b.compare(Condition::Lt, x, zero);
    let neg = b.create_block();
    let pos = b.create_block();
    b.branch(cond, neg, pos).unwrap();
    b.switch_to_block(neg);
    b.ret(Some(zero)).unwrap();
    b.switch_to_block(pos);
    b.ret(Some(x)).unwrap();
    b.finish().unwrap()
}

fn clamp_all() -> KernelGraph {
    let mut b = GraphBuilder::kernel(MethodId::new("Kernels", "clamp_all"));
    let a = b.array_parameter("a", Kind::S32);
    let i = b.int(0);
    let x = b.read(a, i, Kind::S32).unwrap();
    let clamped = b.invoke(MethodId::new("Math", "clamp"), &[x], Kind::S32).unwrap();
    b.write(a, i, clamped).unwrap();
    b.ret(None).unwrap();
    b.finish().unwrap()
}

/// `total[0] = total[0] + a[i]` over a thread-indexed `i`
fn sum() -> KernelGraph {
    let mut b = GraphBuilder::kernel(MethodId::new("Blas", "sum"));
    let a = b.array_parameter("a", Kind::S32);
    let total = b.reduce_parameter("total", Kind::S32, AtomicOp::Add);
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
    let x = b.read(a, i, Kind::S32).unwrap();
    let acc = b.read(total, zero, Kind::S32).unwrap();
    let acc = b.add(acc, x);
    b.write(total, zero, acc).unwrap();
    let next = b.add(i, stride);
    b.add_phi_input(i, next).unwrap();
    b.jump(header).unwrap();
    b.switch_to_block(exit);
    b.ret(None).unwrap();
    b.finish().unwrap()
}

fn compile_sum(target: TargetKind, work_items: u64) -> Payload {
    kernel_compiler::logging::init_test();
    let compiler = KernelCompiler::new(target);
    let device = DeviceDescriptor::gpu("gpu0", work_items);
    compiler.compile(&sum(), &device).unwrap().payload.clone()
}

fn compile(target: TargetKind) -> Payload {
    kernel_compiler::logging::init_test();
    let compiler = KernelCompiler::new(target);
    let device = DeviceDescriptor::gpu("gpu0", 1024);
    compiler.compile(&scale(), &device).unwrap().payload.clone()
}

#[test]
fn test_ptx_module_shape() {
    let payload = compile(TargetKind::Ptx);
    let ptx = payload.as_text().unwrap();
    assert!(ptx.contains(".version "));
    assert!(ptx.contains(".address_size 64"));
    assert!(ptx.contains(".visible .entry Blas_scale("));
    assert!(ptx.contains("%tid.x"));
    assert!(ptx.contains("ret;"));
}

#[test]
fn test_opencl_kernel_shape() {
    let payload = compile(TargetKind::OpenCl);
    let source = payload.as_text().unwrap();
    assert!(source.contains("__kernel void Blas_scale("));
    assert!(source.contains("get_global_id(0)"));
    assert!(source.contains("__global"));
}

#[test]
fn test_metal_kernel_shape() {
    let payload = compile(TargetKind::Metal);
    let source = payload.as_text().unwrap();
    assert!(source.starts_with("#include <metal_stdlib>"));
    assert!(source.contains("kernel void Blas_scale("));
    assert!(source.contains("[[thread_position_in_grid]]"));
    assert!(!source.contains("goto"));
}

#[test]
fn test_spirv_is_a_binary_module() {
    let payload = compile(TargetKind::SpirV);
    assert!(payload.as_text().is_none());
    let bytes = payload.as_bytes();
    assert!(is_spirv_module(bytes));
    assert_eq!(bytes.len() % 4, 0);
    assert_eq!(&bytes[..4], &0x0723_0203u32.to_le_bytes());
}

#[test]
fn test_metal_rejects_double_precision() {
    let mut b = GraphBuilder::kernel(MethodId::new("Kernels", "wide"));
    let a = b.array_parameter("a", Kind::F64);
    let i = b.int(0);
    let x = b.read(a, i, Kind::F64).unwrap();
    let y = b.add(x, x);
    b.write(a, i, y).unwrap();
    b.ret(None).unwrap();
    let graph = b.finish().unwrap();

    let compiler = KernelCompiler::new(TargetKind::Metal);
    let err = compiler
        .compile(&graph, &DeviceDescriptor::gpu("m1", 1024))
        .unwrap_err();
    assert_eq!(err.code(), error_codes::UNSUPPORTED_KIND);
}

#[test]
fn test_callees_are_compiled_and_linked() {
    let compiler = KernelCompiler::new(TargetKind::OpenCl);
    let device = DeviceDescriptor::gpu("gpu0", 1024);
    let provider = |method: &MethodId| (*method == MethodId::new("Math", "clamp")).then(clamp);
    let program = compiler
        .compile_with_callees(&clamp_all(), &device, &provider)
        .unwrap();

    assert_eq!(program.kernel.callees, vec![MethodId::new("Math", "clamp")]);
    assert_eq!(program.callees.len(), 1);
    assert!(!program.callees[0].is_kernel);
    assert_eq!(program.callees[0].entry_name, "Math_clamp");

    let linked = program.linked_source().unwrap();
    let callee_at = linked.find("int Math_clamp(").unwrap();
    let kernel_at = linked.find("__kernel void Kernels_clamp_all(").unwrap();
    assert!(callee_at < kernel_at);
    assert_eq!(program.units().count(), 2);
}

#[test]
fn test_missing_callee_sketch_is_reported() {
    let compiler = KernelCompiler::new(TargetKind::Ptx);
    let device = DeviceDescriptor::gpu("gpu0", 1024);
    let provider = |_: &MethodId| -> Option<KernelGraph> { None };
    let err = compiler
        .compile_with_callees(&clamp_all(), &device, &provider)
        .unwrap_err();
    assert_eq!(err.code(), error_codes::UNSUPPORTED_CONSTRUCT);
}

#[test]
fn test_options_load_from_toml() {
    let options = CompileOptions::from_toml_str("parallelize = false\ninline = false\n").unwrap();
    assert!(!options.parallelize);
    let compiler = KernelCompiler::with_options(TargetKind::OpenCl, options).unwrap();
    let result = compiler
        .compile(&scale(), &DeviceDescriptor::gpu("gpu0", 1024))
        .unwrap();
    assert!(!result.source().unwrap().contains("get_global_id"));
}

#[test]
fn test_reduction_uses_atomics_on_every_target() {
    let ptx = compile_sum(TargetKind::Ptx, 1024);
    assert!(ptx.as_text().unwrap().contains("red.global.add.s32 ["));

    let opencl = compile_sum(TargetKind::OpenCl, 1024);
    assert!(opencl
        .as_text()
        .unwrap()
        .contains("atomic_add((volatile __global int *) "));

    let metal = compile_sum(TargetKind::Metal, 1024);
    let source = metal.as_text().unwrap();
    assert!(source.contains("atomic_fetch_add_explicit((device atomic_int *) "));
    assert!(source.contains("memory_order_relaxed"));

    let spirv = compile_sum(TargetKind::SpirV, 1024);
    assert!(is_spirv_module(spirv.as_bytes()));
}

#[test]
fn test_serial_reduction_is_a_plain_update() {
    let source = compile_sum(TargetKind::OpenCl, 1);
    let source = source.as_text().unwrap();
    assert!(!source.contains("atomic_"));
}
