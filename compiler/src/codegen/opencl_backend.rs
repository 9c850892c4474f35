//! OpenCL C target

use super::c_like::{self, CDialect};
use super::lir::LirUnit;
use super::target::{IntrinsicStyle, Opcode, Payload, RegionBinding, TargetDescription, TargetKind};
use crate::config::{CompileOptions, DeviceDescriptor};
use crate::error::CompileResult;
use crate::ir::{
    AtomicOp, BarrierScope, BinaryOp, Builtin, Condition, Kind, Region, ScalarKind, UnaryOp,
};

pub struct OpenClTarget;

impl OpenClTarget {
    pub fn new() -> Self {
        Self
    }
}

impl Default for OpenClTarget {
    fn default() -> Self {
        Self::new()
    }
}

fn uses(unit: &LirUnit, element: ScalarKind) -> bool {
    unit.variables
        .iter()
        .any(|(kind, _)| kind.element() == Some(element))
        || unit.arrays.iter().any(|a| a.element.element() == Some(element))
}

impl TargetDescription for OpenClTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::OpenCl
    }

    fn variable_prefix(&self, kind: Kind) -> String {
        c_like::variable_prefix(kind)
    }

    fn type_name(&self, kind: Kind) -> CompileResult<String> {
        c_like::type_name(self, kind)
    }

    fn supported_lanes(&self) -> &'static [u8] {
        &[2, 3, 4, 8, 16]
    }

    fn intrinsic_style(&self) -> IntrinsicStyle {
        IntrinsicStyle::NativeBuiltins
    }

    fn builtin_kind(&self, _builtin: Builtin) -> Kind {
        Kind::U64
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
            Region::Global => ("heap_base", 1, "__global"),
            Region::Constant => ("constant_base", 2, "__constant"),
            Region::Local => ("local_array", 3, "__local"),
            Region::Private => ("private_array", 4, "__private"),
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

impl CDialect for OpenClTarget {
    fn preamble(&self, unit: &LirUnit) -> Vec<String> {
        let mut lines = Vec::new();
        if uses(unit, ScalarKind::F64) {
            lines.push("#pragma OPENCL EXTENSION cl_khr_fp64 : enable".to_string());
        }
        if uses(unit, ScalarKind::F16) {
            lines.push("#pragma OPENCL EXTENSION cl_khr_fp16 : enable".to_string());
        }
        lines
    }

    fn kernel_qualifier(&self) -> &'static str {
        "__kernel"
    }

    fn pointer_param(&self, region: Region, name: &str, _slot: u32) -> String {
        format!("{} uchar *{}", self.region_binding(region).address_space, name)
    }

    fn builtin_params(&self, _builtins: &[Builtin]) -> CompileResult<Vec<String>> {
        Ok(Vec::new())
    }

    fn builtin(&self, builtin: Builtin) -> CompileResult<String> {
        let function = match builtin {
            Builtin::GlobalId(_) => "get_global_id",
            Builtin::GlobalSize(_) => "get_global_size",
            Builtin::LocalId(_) | Builtin::ThreadIdx(_) => "get_local_id",
            Builtin::LocalSize(_) | Builtin::BlockDim(_) => "get_local_size",
            Builtin::GroupId(_) | Builtin::BlockIdx(_) => "get_group_id",
            Builtin::NumGroups(_) | Builtin::GridDim(_) => "get_num_groups",
        };
        Ok(format!("{}({})", function, builtin.dim()))
    }

    fn barrier(&self, scope: BarrierScope) -> &'static str {
        match scope {
            BarrierScope::Local => "barrier(CLK_LOCAL_MEM_FENCE);",
            BarrierScope::Global => "barrier(CLK_GLOBAL_MEM_FENCE);",
        }
    }

    fn vector_literal(&self, type_name: &str, lanes: &[String]) -> String {
        format!("({})({})", type_name, lanes.join(", "))
    }

    fn lane(&self, vector: &str, lane: u8) -> String {
        format!("{}.s{:X}", vector, lane)
    }

    fn vector_convert(&self, type_name: &str) -> String {
        format!("convert_{}", type_name)
    }

    fn builtins_in_functions(&self) -> bool {
        true
    }

    fn array_declaration(&self, space: &str, name: &str, bytes: u32, align: u32) -> String {
        format!("{} uchar {}[{}] __attribute__((aligned({})));", space, name, bytes, align)
    }

    fn has_goto(&self) -> bool {
        true
    }

    fn atomic_function(&self, op: AtomicOp) -> &'static str {
        match op {
            AtomicOp::Add => "atomic_add",
            AtomicOp::Min => "atomic_min",
            AtomicOp::Max => "atomic_max",
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
        format!("{}((volatile {} {} *) {}, {});", function, space, element, address, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_spelling() {
        let cl = OpenClTarget::new();
        assert_eq!(cl.lane("v", 10), "v.sA");
        assert_eq!(
            cl.vector_literal("float4", &["a".into(), "b".into(), "c".into(), "d".into()]),
            "(float4)(a, b, c, d)"
        );
        assert_eq!(
            cl.convert_op(Kind::vector(ScalarKind::S32, 4), Kind::vector(ScalarKind::F32, 4))
                .unwrap()
                .mnemonic,
            "convert_float4"
        );
    }

    #[test]
    fn test_builtins_are_functions() {
        let cl = OpenClTarget::new();
        assert_eq!(cl.builtin(Builtin::GlobalId(1)).unwrap(), "get_global_id(1)");
        assert_eq!(cl.builtin(Builtin::NumGroups(0)).unwrap(), "get_num_groups(0)");
    }

    #[test]
    fn test_logical_shift_of_signed_value() {
        let cl = OpenClTarget::new();
        assert_eq!(cl.binary_op(BinaryOp::UShr, Kind::U32).unwrap().mnemonic, ">>");
        assert_eq!(cl.binary_op(BinaryOp::UShr, Kind::S32).unwrap().mnemonic, ">>>");
        assert_eq!(cl.binary_op(BinaryOp::Max, Kind::F32).unwrap().mnemonic, "fmax");
    }
}
