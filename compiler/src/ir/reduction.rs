//! Reductions into array parameters.
//!
//! A parameter declared as a reduction target receives `a[k] = a[k] op v`
//! from every iteration of a parallel loop. Once the loop is spread over
//! threads those read-modify-write sequences race, so each one is replaced
//! by a single atomic update of `a[k]` with `v`. On serial devices the plain
//! update is kept.

use super::optimization::{Phase, PhaseContext, PhaseResult};
use super::{AtomicOp, Kind, KernelGraph, NodeId, Op};
use crate::error::{CompileError, CompileResult};
use fxhash::FxHashMap;
use tracing::debug;

pub struct ReductionPhase;

impl ReductionPhase {
    pub fn new() -> Self {
        Self
    }

    /// Whether some parallel dimension of `graph` will run on more than one
    /// thread.
    fn runs_in_parallel(graph: &KernelGraph, ctx: &PhaseContext<'_>) -> bool {
        ctx.options.parallelize
            && graph.nodes().any(|(_, n)| match n.op {
                Op::ParallelRange(d) | Op::ParallelOffset(d) | Op::ParallelStride(d) => {
                    ctx.device.max_work_items(d).unwrap_or(1) > 1
                }
                _ => false,
            })
    }

    /// `(read, value)` when `write` stores `read op value` back into the
    /// element `read` loaded.
    fn match_update(graph: &KernelGraph, write: NodeId, op: AtomicOp) -> Option<(NodeId, NodeId)> {
        let node = graph.get(write)?;
        let (base, index, combined) = (node.input(0)?, node.input(1)?, node.input(2)?);
        let combine = graph.get(combined)?;
        if combine.op != Op::Binary(op.binary()) {
            return None;
        }
        let loads_element = |id: NodeId| {
            graph.get(id).map_or(false, |n| {
                matches!(n.op, Op::Read { region: None, .. })
                    && n.input(0) == Some(base)
                    && n.input(1) == Some(index)
            })
        };
        let (left, right) = (combine.input(0)?, combine.input(1)?);
        if loads_element(left) {
            Some((left, right))
        } else if loads_element(right) {
            Some((right, left))
        } else {
            None
        }
    }
}

impl Default for ReductionPhase {
    fn default() -> Self {
        Self::new()
    }
}

impl Phase for ReductionPhase {
    fn name(&self) -> &'static str {
        "reductions"
    }

    fn run(&mut self, graph: &mut KernelGraph, ctx: &PhaseContext<'_>) -> CompileResult<PhaseResult> {
        let targets: FxHashMap<u32, AtomicOp> = graph
            .parameters
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.reduction.map(|op| (i as u32, op)))
            .collect();
        if targets.is_empty() || !Self::runs_in_parallel(graph, ctx) {
            return Ok(PhaseResult::unchanged());
        }

        let writes: Vec<(NodeId, AtomicOp)> = graph
            .nodes()
            .filter(|(_, n)| matches!(n.op, Op::Write { region: None }))
            .filter_map(|(id, n)| match graph.get(n.input(0)?)?.op {
                Op::Parameter(index) => targets.get(&index).map(|&op| (id, op)),
                _ => None,
            })
            .collect();

        let mut atomics = 0;
        let mut removed = 0;
        for (write, op) in writes {
            let Some((read, value)) = Self::match_update(graph, write, op) else {
                debug!(method = %graph.method, node = %write, "store to reduction array is not an update, kept");
                continue;
            };
            let node = graph.node(write)?.clone();
            let block = node
                .block
                .ok_or_else(|| CompileError::Internal(format!("write {} has no block", write)))?;
            let (base, index, combined) = (node.inputs[0], node.inputs[1], node.inputs[2]);
            graph.insert_fixed_before(
                block,
                write,
                Op::AtomicUpdate { op, region: None },
                &[base, index, value],
                Kind::Void,
            )?;
            graph.remove_node(write)?;
            removed += 1;
            // the old combine and element load die with the write
            for dead in [combined, read] {
                if graph.contains(dead) && graph.usages().is_unused(dead) {
                    graph.remove_node(dead)?;
                    removed += 1;
                }
            }
            atomics += 1;
        }

        if atomics == 0 {
            return Ok(PhaseResult::unchanged());
        }
        debug!(method = %graph.method, atomics, "reductions made atomic");
        let mut result = PhaseResult::changed().stat("atomic_updates", atomics);
        result.nodes_eliminated = removed;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::target::{create_target, TargetKind};
    use crate::config::{CompileOptions, DeviceDescriptor};
    use crate::ir::inlining::CalleeRegistry;
    use crate::ir::{BinaryOp, Condition, GraphBuilder, MethodId};

    /// `for (i = 0; i < n; i++) sum[0] = sum[0] + a[i]` on dimension 0
    fn sum(op: AtomicOp, combine: BinaryOp) -> KernelGraph {
        let mut b = GraphBuilder::kernel(MethodId::new("T", "sum"));
        let a = b.array_parameter("a", Kind::S32);
        let total = b.reduce_parameter("total", Kind::S32, op);
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
        let next_acc = b.binary(combine, acc, x);
        b.write(total, zero, next_acc).unwrap();
        let next = b.add(i, stride);
        b.add_phi_input(i, next).unwrap();
        b.jump(header).unwrap();
        b.switch_to_block(exit);
        b.ret(None).unwrap();
        b.finish().unwrap()
    }

    fn run(graph: &mut KernelGraph, units: u64) -> PhaseResult {
        let options = CompileOptions::default();
        let device = DeviceDescriptor::gpu("dev", units);
        let target = create_target(TargetKind::OpenCl);
        let callees = CalleeRegistry::new();
        let ctx = PhaseContext {
            options: &options,
            device: &device,
            target: target.as_ref(),
            callees: &callees,
        };
        ReductionPhase::new().run(graph, &ctx).unwrap()
    }

    fn atomics(graph: &KernelGraph) -> Vec<(AtomicOp, usize)> {
        graph
            .nodes()
            .filter_map(|(_, n)| match n.op {
                Op::AtomicUpdate { op, .. } => Some((op, n.inputs.len())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_parallel_update_becomes_atomic() {
        let mut graph = sum(AtomicOp::Add, BinaryOp::Add);
        let result = run(&mut graph, 1024);
        assert_eq!(result.stats["atomic_updates"], 1);
        assert_eq!(atomics(&graph), vec![(AtomicOp::Add, 3)]);
        assert!(!graph.nodes().any(|(_, n)| matches!(n.op, Op::Write { .. })));
        // only the read of `a` is left
        assert_eq!(
            graph.nodes().filter(|(_, n)| matches!(n.op, Op::Read { .. })).count(),
            1
        );
        crate::ir::validation::validate(&graph).unwrap();
    }

    #[test]
    fn test_serial_device_keeps_plain_update() {
        let mut graph = sum(AtomicOp::Add, BinaryOp::Add);
        let result = run(&mut graph, 1);
        assert!(!result.modified);
        assert!(atomics(&graph).is_empty());
    }

    #[test]
    fn test_mismatched_operator_is_not_rewritten() {
        let mut graph = sum(AtomicOp::Max, BinaryOp::Add);
        run(&mut graph, 1024);
        assert!(atomics(&graph).is_empty());

        let mut graph = sum(AtomicOp::Max, BinaryOp::Max);
        run(&mut graph, 1024);
        assert_eq!(atomics(&graph), vec![(AtomicOp::Max, 3)]);
    }
}
