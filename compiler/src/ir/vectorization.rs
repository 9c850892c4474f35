//! Intrinsic and vector lowering.
//!
//! Replaces target-neutral thread-identity intrinsics with the builtins the
//! selected target actually has, and splits vector arithmetic into per-lane
//! scalar operations for targets without native vector ALUs.

use super::optimization::{Phase, PhaseContext, PhaseResult};
use super::{BinaryOp, Builtin, Intrinsic, Kind, KernelGraph, NodeId, Op};
use crate::codegen::target::{IntrinsicStyle, TargetDescription};
use crate::error::{CompileError, CompileResult};
use smallvec::SmallVec;

pub struct IntrinsicLoweringPhase;

impl IntrinsicLoweringPhase {
    pub fn new() -> Self {
        Self
    }

    fn builtin(graph: &mut KernelGraph, target: &dyn TargetDescription, builtin: Builtin) -> NodeId {
        graph.add_floating(Op::Builtin(builtin), &[], target.builtin_kind(builtin))
    }

    /// Value of `intrinsic` in the builtin kind of the target.
    fn expand(graph: &mut KernelGraph, target: &dyn TargetDescription, intrinsic: Intrinsic) -> NodeId {
        let d = intrinsic.dim();
        match target.intrinsic_style() {
            IntrinsicStyle::CudaRegisters => match intrinsic {
                Intrinsic::GlobalThreadId(_) => {
                    let block = Self::builtin(graph, target, Builtin::BlockIdx(d));
                    let size = Self::builtin(graph, target, Builtin::BlockDim(d));
                    let thread = Self::builtin(graph, target, Builtin::ThreadIdx(d));
                    let kind = target.builtin_kind(Builtin::ThreadIdx(d));
                    let base = graph.add_floating(Op::Binary(BinaryOp::Mul), &[block, size], kind);
                    graph.add_floating(Op::Binary(BinaryOp::Add), &[base, thread], kind)
                }
                Intrinsic::GlobalThreadCount(_) => {
                    let grid = Self::builtin(graph, target, Builtin::GridDim(d));
                    let size = Self::builtin(graph, target, Builtin::BlockDim(d));
                    let kind = target.builtin_kind(Builtin::GridDim(d));
                    graph.add_floating(Op::Binary(BinaryOp::Mul), &[grid, size], kind)
                }
                Intrinsic::LocalThreadId(_) => Self::builtin(graph, target, Builtin::ThreadIdx(d)),
                Intrinsic::LocalGroupSize(_) => Self::builtin(graph, target, Builtin::BlockDim(d)),
                Intrinsic::GroupId(_) => Self::builtin(graph, target, Builtin::BlockIdx(d)),
                Intrinsic::GroupCount(_) => Self::builtin(graph, target, Builtin::GridDim(d)),
            },
            IntrinsicStyle::NativeBuiltins => {
                let builtin = match intrinsic {
                    Intrinsic::GlobalThreadId(_) => Builtin::GlobalId(d),
                    Intrinsic::GlobalThreadCount(_) => Builtin::GlobalSize(d),
                    Intrinsic::LocalThreadId(_) => Builtin::LocalId(d),
                    Intrinsic::LocalGroupSize(_) => Builtin::LocalSize(d),
                    Intrinsic::GroupId(_) => Builtin::GroupId(d),
                    Intrinsic::GroupCount(_) => Builtin::NumGroups(d),
                };
                Self::builtin(graph, target, builtin)
            }
        }
    }
}

impl Default for IntrinsicLoweringPhase {
    fn default() -> Self {
        Self::new()
    }
}

impl Phase for IntrinsicLoweringPhase {
    fn name(&self) -> &'static str {
        "intrinsic-lowering"
    }

    fn run(&mut self, graph: &mut KernelGraph, ctx: &PhaseContext<'_>) -> CompileResult<PhaseResult> {
        let intrinsics: Vec<(NodeId, Intrinsic, Kind)> = graph
            .nodes()
            .filter_map(|(id, n)| match n.op {
                Op::Intrinsic(intrinsic) => Some((id, intrinsic, n.kind)),
                _ => None,
            })
            .collect();
        if intrinsics.is_empty() {
            return Ok(PhaseResult::unchanged());
        }
        for &(id, intrinsic, kind) in &intrinsics {
            let value = Self::expand(graph, ctx.target, intrinsic);
            let value_kind = graph.kind(value)?;
            let value = if value_kind == kind {
                value
            } else {
                graph.add_floating(Op::Convert, &[value], kind)
            };
            graph.replace_all_uses(id, value);
            graph.remove_node(id)?;
        }
        Ok(PhaseResult::changed().stat("lowered_intrinsics", intrinsics.len()))
    }
}

/// Checks vector widths and scalarizes vector arithmetic where needed.
pub struct VectorLoweringPhase;

impl VectorLoweringPhase {
    pub fn new() -> Self {
        Self
    }

    fn check_lanes(graph: &KernelGraph, target: &dyn TargetDescription) -> CompileResult<()> {
        for (_, node) in graph.nodes() {
            if let Kind::Vector { lanes, .. } = node.kind {
                if !target.supported_lanes().contains(&lanes) {
                    return Err(CompileError::unsupported(
                        target.name(),
                        format!(
                            "kind {} ({} lanes, supported: {:?})",
                            node.kind,
                            lanes,
                            target.supported_lanes()
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Split `id` into one scalar operation per lane.
    fn scalarize(graph: &mut KernelGraph, id: NodeId) -> CompileResult<NodeId> {
        let node = graph.node(id)?.clone();
        let Kind::Vector { element, lanes } = node.kind else {
            return Ok(id);
        };
        let mut results: SmallVec<[NodeId; 16]> = SmallVec::new();
        for lane in 0..lanes {
            let mut operands: SmallVec<[NodeId; 2]> = SmallVec::new();
            for &input in &node.inputs {
                let input_kind = graph.kind(input)?;
                let operand = match input_kind {
                    Kind::Vector { element: e, .. } => {
                        graph.add_floating(Op::VectorElement(lane), &[input], Kind::Scalar(e))
                    }
                    // shift amounts and other scalar operands apply to every lane
                    _ => input,
                };
                operands.push(operand);
            }
            let kind = match node.op {
                Op::Compare(_) => Kind::PRED,
                _ => Kind::Scalar(element),
            };
            results.push(graph.add_floating(node.op.clone(), &operands, kind));
        }
        Ok(graph.add_floating(Op::VectorValue, &results, node.kind))
    }
}

impl Default for VectorLoweringPhase {
    fn default() -> Self {
        Self::new()
    }
}

impl Phase for VectorLoweringPhase {
    fn name(&self) -> &'static str {
        "vector-lowering"
    }

    fn run(&mut self, graph: &mut KernelGraph, ctx: &PhaseContext<'_>) -> CompileResult<PhaseResult> {
        Self::check_lanes(graph, ctx.target)?;
        if ctx.target.native_vector_arithmetic() {
            return Ok(PhaseResult::unchanged());
        }
        let arithmetic: Vec<NodeId> = graph
            .nodes()
            .filter(|(_, n)| n.kind.is_vector())
            .filter(|(_, n)| matches!(n.op, Op::Binary(_) | Op::Unary(_) | Op::Conditional))
            .map(|(id, _)| id)
            .collect();
        if arithmetic.is_empty() {
            return Ok(PhaseResult::unchanged());
        }
        for &id in &arithmetic {
            let scalar = Self::scalarize(graph, id)?;
            graph.replace_all_uses(id, scalar);
            graph.remove_node(id)?;
        }
        Ok(PhaseResult::changed().stat("scalarized", arithmetic.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::target::{create_target, TargetKind};
    use crate::config::{CompileOptions, DeviceDescriptor};
    use crate::ir::inlining::CalleeRegistry;
    use crate::ir::{GraphBuilder, MethodId, ScalarKind};

    fn run<P: Phase>(phase: &mut P, graph: &mut KernelGraph, target: TargetKind) -> CompileResult<PhaseResult> {
        let options = CompileOptions::default();
        let device = DeviceDescriptor::gpu("gpu0", 1024);
        let target = create_target(target);
        let callees = CalleeRegistry::new();
        let ctx = PhaseContext {
            options: &options,
            device: &device,
            target: target.as_ref(),
            callees: &callees,
        };
        phase.run(graph, &ctx)
    }

    fn thread_id_kernel() -> KernelGraph {
        let mut b = GraphBuilder::kernel(MethodId::new("T", "ids"));
        let a = b.array_parameter("a", Kind::S32);
        let id = b.intrinsic(Intrinsic::GlobalThreadId(0));
        b.write(a, id, id).unwrap();
        b.ret(None).unwrap();
        b.finish().unwrap()
    }

    #[test]
    fn test_ptx_composes_global_id_from_registers() {
        let mut graph = thread_id_kernel();
        run(&mut IntrinsicLoweringPhase::new(), &mut graph, TargetKind::Ptx).unwrap();
        let builtins: Vec<Builtin> = graph
            .nodes()
            .filter_map(|(_, n)| match n.op {
                Op::Builtin(b) => Some(b),
                _ => None,
            })
            .collect();
        assert_eq!(
            builtins,
            vec![Builtin::BlockIdx(0), Builtin::BlockDim(0), Builtin::ThreadIdx(0)]
        );
        assert!(!graph.nodes().any(|(_, n)| matches!(n.op, Op::Intrinsic(_))));
    }

    #[test]
    fn test_opencl_reads_native_builtin() {
        let mut graph = thread_id_kernel();
        run(&mut IntrinsicLoweringPhase::new(), &mut graph, TargetKind::OpenCl).unwrap();
        let global: Vec<Kind> = graph
            .nodes()
            .filter(|(_, n)| n.op == Op::Builtin(Builtin::GlobalId(0)))
            .map(|(_, n)| n.kind)
            .collect();
        assert_eq!(global, vec![Kind::U64]);
        // converted back to the intrinsic kind
        assert!(graph
            .nodes()
            .any(|(_, n)| n.op == Op::Convert && n.kind == Kind::S32));
    }

    #[test]
    fn test_ptx_scalarizes_vector_add() {
        let v4 = Kind::vector(ScalarKind::F32, 4);
        let mut b = GraphBuilder::callee(MethodId::new("T", "vadd"), v4);
        let x = b.scalar_parameter("x", v4);
        let y = b.scalar_parameter("y", v4);
        let sum = b.add(x, y);
        b.ret(Some(sum)).unwrap();
        let mut graph = b.finish().unwrap();

        run(&mut VectorLoweringPhase::new(), &mut graph, TargetKind::Ptx).unwrap();
        assert!(!graph.contains(sum));
        let scalar_adds = graph
            .nodes()
            .filter(|(_, n)| n.op == Op::Binary(BinaryOp::Add) && n.kind == Kind::F32)
            .count();
        assert_eq!(scalar_adds, 4);
        crate::ir::validation::validate(&graph).unwrap();
    }

    #[test]
    fn test_unsupported_lane_count_rejected() {
        let v8 = Kind::vector(ScalarKind::F32, 8);
        let mut b = GraphBuilder::callee(MethodId::new("T", "v8"), v8);
        let x = b.scalar_parameter("x", v8);
        b.ret(Some(x)).unwrap();
        let mut graph = b.finish().unwrap();

        let err = run(&mut VectorLoweringPhase::new(), &mut graph, TargetKind::Metal).unwrap_err();
        assert_eq!(err.code(), crate::error_codes::UNSUPPORTED_KIND);
        assert!(run(&mut VectorLoweringPhase::new(), &mut graph, TargetKind::OpenCl).is_ok());
    }
}
