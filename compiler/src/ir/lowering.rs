//! Exception and address lowering.
//!
//! Kernels run without unwinding support and on pointers the host already
//! validated, so guards, frame states and null checks are dropped rather
//! than lowered. Array accesses become `Address` arithmetic bound to exactly
//! one memory region.

use super::graph::ParamType;
use super::memory::{resolve_roots, MemoryRoot};
use super::optimization::{Phase, PhaseContext, PhaseResult};
use super::{BinaryOp, Constant, Kind, KernelGraph, NodeId, Op, Region};
use crate::error::{CompileError, CompileResult};
use fxhash::FxHashSet;
use smallvec::SmallVec;
use tracing::debug;

/// Removes guards and frame-state bookkeeping.
pub struct ExceptionEliminationPhase;

impl ExceptionEliminationPhase {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ExceptionEliminationPhase {
    fn default() -> Self {
        Self::new()
    }
}

impl Phase for ExceptionEliminationPhase {
    fn name(&self) -> &'static str {
        "exception-elimination"
    }

    fn run(&mut self, graph: &mut KernelGraph, _ctx: &PhaseContext<'_>) -> CompileResult<PhaseResult> {
        let guards: Vec<NodeId> = graph
            .nodes()
            .filter(|(_, n)| n.op == Op::Guard)
            .map(|(id, _)| id)
            .collect();
        for &guard in &guards {
            graph.remove_node(guard)?;
        }

        let states: FxHashSet<NodeId> = graph
            .nodes()
            .filter(|(_, n)| n.op == Op::FrameState)
            .map(|(id, _)| id)
            .collect();
        if !states.is_empty() {
            let users: Vec<NodeId> = graph
                .nodes()
                .filter(|(id, n)| !states.contains(id) && n.inputs.iter().any(|i| states.contains(i)))
                .map(|(id, _)| id)
                .collect();
            for user in users {
                graph.node_mut(user)?.inputs.retain(|i| !states.contains(i));
            }
            let mut ordered: Vec<NodeId> = states.iter().copied().collect();
            ordered.sort();
            for state in ordered {
                graph.remove_node(state)?;
            }
        }

        let removed = guards.len() + states.len();
        if removed == 0 {
            return Ok(PhaseResult::unchanged());
        }
        let mut result = PhaseResult::changed()
            .stat("guards", guards.len())
            .stat("frame_states", states.len());
        result.nodes_eliminated = removed;
        Ok(result)
    }
}

/// Rewrites `Read`/`Write` on array references into region-bound
/// `Address{region}[base, offset]` accesses.
///
/// ```text
/// read a[i]  =>  addr = Address{global}[a, (i << log2(size)) + header]
///                read.global addr
/// ```
pub struct AddressLoweringPhase;

impl AddressLoweringPhase {
    pub fn new() -> Self {
        Self
    }

    fn root_region(graph: &KernelGraph, access: NodeId, root: MemoryRoot) -> CompileResult<Region> {
        match root {
            MemoryRoot::Parameter(index) => match graph.parameter_kind(index) {
                Some(ParamType::Array { constant: true, .. }) => Ok(Region::Constant),
                Some(ParamType::Array { .. }) => Ok(Region::Global),
                Some(ParamType::Scalar(kind)) => Err(CompileError::invalid_region(
                    access,
                    format!("parameter {} is a scalar of kind {}", index, kind),
                )),
                None => Err(CompileError::invalid_region(
                    access,
                    format!("undeclared parameter {}", index),
                )),
            },
            MemoryRoot::Allocation(alloc) => match graph.op(alloc)? {
                Op::NewArray { region, .. } => Ok(*region),
                other => Err(CompileError::Internal(format!(
                    "allocation root {} is {}",
                    alloc,
                    other.describe()
                ))),
            },
        }
    }

    /// The single region behind `base`.
    pub fn resolve_region(graph: &KernelGraph, access: NodeId, base: NodeId) -> CompileResult<Region> {
        let roots = resolve_roots(graph, base).ok_or_else(|| {
            CompileError::invalid_region(access, format!("base {} is not an array reference", base))
        })?;
        let mut region: Option<Region> = None;
        for &root in &roots {
            let r = Self::root_region(graph, access, root)?;
            match region {
                None => region = Some(r),
                Some(existing) if existing == r => {}
                Some(existing) => {
                    return Err(CompileError::invalid_region(
                        access,
                        format!("base may point into both {} and {}", existing.name(), r.name()),
                    ))
                }
            }
        }
        region.ok_or_else(|| CompileError::invalid_region(access, "base has no memory root"))
    }

    /// Byte offset of element `index`: `(index << shift) + header`.
    fn offset(
        graph: &mut KernelGraph,
        index: NodeId,
        element: Kind,
        header: u32,
        offset_kind: Kind,
    ) -> CompileResult<NodeId> {
        let mut offset = if graph.kind(index)? == offset_kind {
            index
        } else {
            graph.add_floating(Op::Convert, &[index], offset_kind)
        };
        match element.size_shift() {
            Some(0) => {}
            Some(shift) => {
                let amount = graph.add_floating(Op::Constant(Constant::Int(shift as i64)), &[], offset_kind);
                offset = graph.add_floating(Op::Binary(BinaryOp::Shl), &[offset, amount], offset_kind);
            }
            None => {
                let size = graph.add_floating(
                    Op::Constant(Constant::Int(element.size() as i64)),
                    &[],
                    offset_kind,
                );
                offset = graph.add_floating(Op::Binary(BinaryOp::Mul), &[offset, size], offset_kind);
            }
        }
        if header > 0 {
            let header = graph.add_floating(Op::Constant(Constant::Int(header as i64)), &[], offset_kind);
            offset = graph.add_floating(Op::Binary(BinaryOp::Add), &[offset, header], offset_kind);
        }
        Ok(offset)
    }

    /// Parameters, allocations and the phis and selects merging them.
    fn reference_web(graph: &KernelGraph, base: NodeId) -> Vec<NodeId> {
        let mut web = Vec::new();
        let mut seen: FxHashSet<NodeId> = FxHashSet::default();
        let mut worklist = vec![base];
        while let Some(id) = worklist.pop() {
            if !seen.insert(id) {
                continue;
            }
            let Some(node) = graph.get(id) else {
                continue;
            };
            match node.op {
                Op::Parameter(_) | Op::NewArray { .. } => web.push(id),
                Op::Phi => {
                    web.push(id);
                    worklist.extend(node.inputs.iter().copied());
                }
                Op::Conditional => {
                    web.push(id);
                    worklist.extend(node.inputs.iter().skip(1).copied());
                }
                _ => {}
            }
        }
        web
    }
}

impl Default for AddressLoweringPhase {
    fn default() -> Self {
        Self::new()
    }
}

impl Phase for AddressLoweringPhase {
    fn name(&self) -> &'static str {
        "address-lowering"
    }

    fn run(&mut self, graph: &mut KernelGraph, ctx: &PhaseContext<'_>) -> CompileResult<PhaseResult> {
        let accesses: Vec<NodeId> = graph
            .nodes()
            .filter(|(_, n)| match n.op {
                Op::Read { region, .. } => region.is_none(),
                Op::Write { region } | Op::AtomicUpdate { region, .. } => region.is_none(),
                _ => false,
            })
            .map(|(id, _)| id)
            .collect();
        if accesses.is_empty() {
            return Ok(PhaseResult::unchanged());
        }

        let word = ctx.device.word_kind();
        let offset_kind = ctx.device.offset_kind();
        let mut references: SmallVec<[NodeId; 8]> = SmallVec::new();
        let mut per_region = [0usize; 4];

        for access in accesses {
            let node = graph.node(access)?.clone();
            let (Some(base), Some(index)) = (node.input(0), node.input(1)) else {
                return Err(CompileError::malformed(format!(
                    "memory access {} needs a base and an index",
                    access
                )));
            };
            let region = Self::resolve_region(graph, access, base)?;
            let is_write = node.op.is_store();
            if is_write && region == Region::Constant {
                return Err(CompileError::invalid_region(access, "write to constant region"));
            }
            let element = if is_write {
                let value = node.input(2).ok_or_else(|| {
                    CompileError::malformed(format!("write {} has no value", access))
                })?;
                graph.kind(value)?
            } else {
                node.kind
            };
            let header = match region {
                Region::Global | Region::Constant => ctx.options.array_header_bytes,
                Region::Local | Region::Private => 0,
            };

            let offset = Self::offset(graph, index, element, header, offset_kind)?;
            let address = graph.add_floating(Op::Address { region }, &[base, offset], word);
            let lowered = graph.node_mut(access)?;
            lowered.inputs.remove(1);
            lowered.inputs[0] = address;
            match &mut lowered.op {
                Op::Read { region: r, .. }
                | Op::Write { region: r }
                | Op::AtomicUpdate { region: r, .. } => *r = Some(region),
                _ => {}
            }
            references.extend(Self::reference_web(graph, base));
            per_region[region as usize] += 1;
            debug!(node = %access, region = region.name(), "bound memory access");
        }

        for id in references {
            graph.node_mut(id)?.kind = word;
        }
        Ok(PhaseResult::changed()
            .stat("global", per_region[Region::Global as usize])
            .stat("constant", per_region[Region::Constant as usize])
            .stat("local", per_region[Region::Local as usize])
            .stat("private", per_region[Region::Private as usize]))
    }
}

/// Drops implicit null checks; host pointers are validated before launch.
pub struct NullCheckEliminationPhase;

impl NullCheckEliminationPhase {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullCheckEliminationPhase {
    fn default() -> Self {
        Self::new()
    }
}

impl Phase for NullCheckEliminationPhase {
    fn name(&self) -> &'static str {
        "null-check-elimination"
    }

    fn run(&mut self, graph: &mut KernelGraph, _ctx: &PhaseContext<'_>) -> CompileResult<PhaseResult> {
        let checks: Vec<NodeId> = graph
            .nodes()
            .filter(|(_, n)| n.op == Op::NullCheck)
            .map(|(id, _)| id)
            .collect();
        if checks.is_empty() {
            return Ok(PhaseResult::unchanged());
        }
        for &check in &checks {
            graph.remove_node(check)?;
        }
        let mut result = PhaseResult::changed();
        result.nodes_eliminated = checks.len();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompileOptions, DeviceDescriptor};
    use crate::ir::optimization::tests::{run_phase, run_phase_with};
    use crate::ir::{GraphBuilder, MethodId};

    fn addresses(graph: &KernelGraph) -> Vec<(Region, Kind)> {
        graph
            .nodes()
            .filter_map(|(_, n)| match n.op {
                Op::Address { region } => Some((region, n.kind)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_global_access_gets_shifted_offset_and_header() {
        let mut b = GraphBuilder::kernel(MethodId::new("T", "k"));
        let a = b.array_parameter("a", Kind::F32);
        let i = b.int(5);
        let x = b.read(a, i, Kind::F32).unwrap();
        b.write(a, i, x).unwrap();
        b.ret(None).unwrap();
        let mut graph = b.finish().unwrap();

        run_phase(&mut AddressLoweringPhase::new(), &mut graph).unwrap();
        assert_eq!(
            addresses(&graph),
            vec![(Region::Global, Kind::U64), (Region::Global, Kind::U64)]
        );
        assert!(matches!(
            graph.op(x).unwrap(),
            Op::Read {
                region: Some(Region::Global),
                ..
            }
        ));
        assert_eq!(graph.node(x).unwrap().inputs.len(), 1);
        let shifts: Vec<i64> = graph
            .nodes()
            .filter(|(_, n)| n.op == Op::Binary(BinaryOp::Shl))
            .filter_map(|(_, n)| graph.get(n.inputs[1]).and_then(|c| c.constant()))
            .filter_map(|c| c.as_i64())
            .collect();
        assert_eq!(shifts, vec![2, 2]);
        assert!(graph
            .nodes()
            .any(|(_, n)| n.op == Op::Constant(Constant::Int(24)) && n.kind == Kind::S64));
    }

    #[test]
    fn test_private_allocation_has_no_header() {
        let mut b = GraphBuilder::kernel(MethodId::new("T", "k"));
        let out = b.array_parameter("out", Kind::S32);
        let scratch = b.new_array(Kind::S32, 8, Region::Private).unwrap();
        let i = b.int(1);
        let v = b.int(4);
        b.write(scratch, i, v).unwrap();
        let x = b.read(scratch, i, Kind::S32).unwrap();
        b.write(out, i, x).unwrap();
        b.ret(None).unwrap();
        let mut graph = b.finish().unwrap();

        let result = run_phase(&mut AddressLoweringPhase::new(), &mut graph).unwrap();
        assert_eq!(result.stats["private"], 2);
        assert_eq!(result.stats["global"], 1);
        assert!(!graph
            .nodes()
            .any(|(_, n)| n.op == Op::Constant(Constant::Int(0)) && n.kind == Kind::S64));
    }

    #[test]
    fn test_32_bit_device_retypes_references() {
        let mut b = GraphBuilder::kernel(MethodId::new("T", "k"));
        let a = b.array_parameter("a", Kind::F64);
        let i = b.int(0);
        let x = b.read(a, i, Kind::F64).unwrap();
        b.write(a, i, x).unwrap();
        b.ret(None).unwrap();
        let mut graph = b.finish().unwrap();

        let mut device = DeviceDescriptor::gpu("gpu32", 256);
        device.address_bits = 32;
        run_phase_with(
            &mut AddressLoweringPhase::new(),
            &mut graph,
            &CompileOptions::default(),
            &device,
        )
        .unwrap();
        assert_eq!(graph.kind(a).unwrap(), Kind::U32);
        assert!(addresses(&graph).iter().all(|&(_, k)| k == Kind::U32));
    }

    #[test]
    fn test_write_to_constant_array_rejected() {
        let mut b = GraphBuilder::kernel(MethodId::new("T", "k"));
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
        let mut graph = b.finish().unwrap();

        let err = run_phase(&mut AddressLoweringPhase::new(), &mut graph).unwrap_err();
        assert_eq!(err.code(), crate::error_codes::WRITE_TO_CONSTANT_REGION);
    }

    #[test]
    fn test_mixed_regions_rejected() {
        let mut b = GraphBuilder::kernel(MethodId::new("T", "k"));
        let a = b.array_parameter("a", Kind::S32);
        let local = b.new_array(Kind::S32, 64, Region::Local).unwrap();
        let flag = b.boolean(true);
        let either = b.select(flag, a, local);
        let i = b.int(0);
        let x = b.read(either, i, Kind::S32).unwrap();
        b.write(a, i, x).unwrap();
        b.ret(None).unwrap();
        let mut graph = b.finish().unwrap();

        let err = run_phase(&mut AddressLoweringPhase::new(), &mut graph).unwrap_err();
        assert!(matches!(err, CompileError::InvalidRegion { node, .. } if node == x));
        assert_eq!(err.code(), crate::error_codes::INVALID_REGION);
    }

    #[test]
    fn test_guards_and_null_checks_removed() {
        let mut b = GraphBuilder::kernel(MethodId::new("T", "k"));
        let a = b.array_parameter("a", Kind::S32);
        let i = b.int(0);
        let state = b.frame_state(&[a, i]);
        let flag = b.boolean(true);
        b.guard(flag, Some(state)).unwrap();
        b.null_check(a).unwrap();
        b.write(a, i, i).unwrap();
        b.ret(None).unwrap();
        let mut graph = b.finish().unwrap();

        let exceptions = run_phase(&mut ExceptionEliminationPhase::new(), &mut graph).unwrap();
        assert_eq!(exceptions.nodes_eliminated, 2);
        let checks = run_phase(&mut NullCheckEliminationPhase::new(), &mut graph).unwrap();
        assert_eq!(checks.nodes_eliminated, 1);
        assert_eq!(graph.block(graph.entry()).unwrap().fixed.len(), 1);
    }
}
