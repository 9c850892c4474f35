//! Metal Shading Language target
//!
//! Metal has no `goto`, so blocks are emitted as cases of a dispatch loop.
//! Thread builtins are kernel parameters carrying attributes rather than
//! function calls, and there is no 64-bit floating point.

use super::c_like::{self, CDialect};
use super::lir::LirUnit;
use super::target::{IntrinsicStyle, Opcode, Payload, RegionBinding, TargetDescription, TargetKind};
use crate::config::{CompileOptions, DeviceDescriptor};
use crate::error::CompileResult;
use crate::ir::{
    AtomicOp, BarrierScope, BinaryOp, Builtin, Condition, Kind, Region, ScalarKind, UnaryOp,
};

pub struct MetalTarget;

impl MetalTarget {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MetalTarget {
    fn default() -> Self {
        Self::new()
    }
}

/// Parameter name and attribute exposing `builtin`.
fn builtin_source(builtin: Builtin) -> (&'static str, &'static str) {
    match builtin {
        Builtin::GlobalId(_) => ("_global_id", "thread_position_in_grid"),
        Builtin::GlobalSize(_) => ("_global_size", "threads_per_grid"),
        Builtin::LocalId(_) | Builtin::ThreadIdx(_) => ("_local_id", "thread_position_in_threadgroup"),
        Builtin::LocalSize(_) | Builtin::BlockDim(_) => ("_local_size", "threads_per_threadgroup"),
        Builtin::GroupId(_) | Builtin::BlockIdx(_) => ("_group_id", "threadgroup_position_in_grid"),
        Builtin::NumGroups(_) | Builtin::GridDim(_) => ("_num_groups", "threadgroups_per_grid"),
    }
}

impl TargetDescription for MetalTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::Metal
    }

    fn variable_prefix(&self, kind: Kind) -> String {
        c_like::variable_prefix(kind)
    }

    fn type_name(&self, kind: Kind) -> CompileResult<String> {
        c_like::type_name(self, kind)
    }

    fn supported_lanes(&self) -> &'static [u8] {
        &[2, 3, 4]
    }

    fn check_kind(&self, kind: Kind, device: &DeviceDescriptor) -> CompileResult<()> {
        if kind.element() == Some(ScalarKind::F64) {
            return Err(self.unsupported_kind(kind, "no 64-bit floating point in Metal"));
        }
        let Some(element) = kind.element() else {
            return Ok(());
        };
        if element == ScalarKind::F16 && !device.supports_fp16 {
            return Err(self.unsupported_kind(kind, "device has no 16-bit floating point"));
        }
        if kind.is_vector() && !self.supported_lanes().contains(&kind.lanes()) {
            return Err(self.unsupported_kind(kind, "vector width"));
        }
        Ok(())
    }

    fn intrinsic_style(&self) -> IntrinsicStyle {
        IntrinsicStyle::NativeBuiltins
    }

    fn builtin_kind(&self, _builtin: Builtin) -> Kind {
        Kind::U32
    }

    fn native_vector_arithmetic(&self) -> bool {
        true
    }

    fn binary_op(&self, op: BinaryOp, kind: Kind) -> CompileResult<Opcode> {
        c_like::binary_op(self, op, kind)
    }

    fn unary_op(&self, op: UnaryOp, kind: Kind) -> CompileResult<Opcode> {
        c_like::unary_op(self, op, kind)
    }

    fn compare_op(&self, cond: Condition, operand: Kind) -> CompileResult<Opcode> {
        c_like::compare_op(self, cond, operand)
    }

    fn select_op(&self, kind: Kind) -> CompileResult<Opcode> {
        c_like::select_op(self, kind)
    }

    fn convert_op(&self, from: Kind, to: Kind) -> CompileResult<Opcode> {
        c_like::convert_op(self, from, to)
    }

    fn atomic_op(&self, op: AtomicOp, kind: Kind, region: Region) -> CompileResult<Opcode> {
        c_like::atomic_op(self, op, kind, region)
    }

    fn region_binding(&self, region: Region) -> RegionBinding {
        let (register, slot, address_space) = match region {
            Region::Global => ("heap_base", 1, "device"),
            Region::Constant => ("constant_base", 2, "constant"),
            Region::Local => ("local_array", 3, "threadgroup"),
            Region::Private => ("private_array", 4, "thread"),
        };
        RegionBinding {
            region,
            register,
            slot,
            address_space,
        }
    }

    fn assemble(
        &self,
        unit: &LirUnit,
        options: &CompileOptions,
        device: &DeviceDescriptor,
    ) -> CompileResult<Payload> {
        c_like::assemble(self, unit, options, device).map(Payload::Text)
    }
}

impl CDialect for MetalTarget {
    fn preamble(&self, _unit: &LirUnit) -> Vec<String> {
        vec![
            "#include <metal_stdlib>".to_string(),
            "using namespace metal;".to_string(),
        ]
    }

    fn kernel_qualifier(&self) -> &'static str {
        "kernel"
    }

    fn pointer_param(&self, region: Region, name: &str, slot: u32) -> String {
        format!(
            "{} uchar *{} [[buffer({})]]",
            self.region_binding(region).address_space,
            name,
            slot
        )
    }

    fn builtin_params(&self, builtins: &[Builtin]) -> CompileResult<Vec<String>> {
        let mut params: Vec<String> = Vec::new();
        for &builtin in builtins {
            let (name, attribute) = builtin_source(builtin);
            let param = format!("uint3 {} [[{}]]", name, attribute);
            if !params.contains(&param) {
                params.push(param);
            }
        }
        Ok(params)
    }

    fn builtin(&self, builtin: Builtin) -> CompileResult<String> {
        let (name, _) = builtin_source(builtin);
        Ok(format!("{}.{}", name, builtin.axis()))
    }

    fn barrier(&self, scope: BarrierScope) -> &'static str {
        match scope {
            BarrierScope::Local => "threadgroup_barrier(mem_flags::mem_threadgroup);",
            BarrierScope::Global => "threadgroup_barrier(mem_flags::mem_device);",
        }
    }

    fn vector_literal(&self, type_name: &str, lanes: &[String]) -> String {
        format!("{}({})", type_name, lanes.join(", "))
    }

    fn lane(&self, vector: &str, lane: u8) -> String {
        format!("{}[{}]", vector, lane)
    }

    fn vector_convert(&self, type_name: &str) -> String {
        type_name.to_string()
    }

    fn builtins_in_functions(&self) -> bool {
        false
    }

    fn array_declaration(&self, space: &str, name: &str, bytes: u32, align: u32) -> String {
        format!("{} alignas({}) uchar {}[{}];", space, align, name, bytes)
    }

    fn has_goto(&self) -> bool {
        false
    }

    fn atomic_function(&self, op: AtomicOp) -> &'static str {
        match op {
            AtomicOp::Add => "atomic_fetch_add_explicit",
            AtomicOp::Min => "atomic_fetch_min_explicit",
            AtomicOp::Max => "atomic_fetch_max_explicit",
        }
    }

    fn atomic_update(
        &self,
        function: &str,
        space: &str,
        element: &str,
        address: &str,
        value: &str,
    ) -> String {
        format!(
            "{}(({} atomic_{} *) {}, {}, memory_order_relaxed);",
            function, space, element, address, value
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_double_precision() {
        let metal = MetalTarget::new();
        let device = DeviceDescriptor::gpu("m1", 1024);
        let err = metal.check_kind(Kind::F64, &device).unwrap_err();
        assert_eq!(err.code(), crate::error_codes::UNSUPPORTED_KIND);
        assert!(metal.check_kind(Kind::vector(ScalarKind::F32, 8), &device).is_err());
        assert!(metal.check_kind(Kind::vector(ScalarKind::F32, 4), &device).is_ok());
    }

    #[test]
    fn test_builtins_become_attributed_parameters() {
        let metal = MetalTarget::new();
        let params = metal
            .builtin_params(&[Builtin::GlobalId(0), Builtin::GlobalId(1), Builtin::LocalSize(0)])
            .unwrap();
        assert_eq!(
            params,
            vec![
                "uint3 _global_id [[thread_position_in_grid]]".to_string(),
                "uint3 _local_size [[threads_per_threadgroup]]".to_string(),
            ]
        );
        assert_eq!(metal.builtin(Builtin::GlobalId(1)).unwrap(), "_global_id.y");
    }
}
