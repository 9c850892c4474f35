//! Memory-side mid-tier phases.
//!
//! - Memory root resolution shared with address lowering
//! - Redundant phi and memory-phi elimination
//! - Floating reads
//!
//! # Floating reads
//!
//! A fixed read becomes floating (placed by scheduling, anchored at its
//! original block) only when all of the following hold:
//!
//! 1. No write, lane store or call anywhere in the compile unit may touch
//!    the same memory root. Roots are resolved through phis, selects and
//!    address arithmetic; an unresolvable root aliases everything. With no
//!    conflicting store anywhere, no path can carry one between the old and
//!    the new position.
//! 2. The next fixed node in its block is not a barrier.
//! 3. Reads from private allocations stay pinned unless every consumer is a
//!    vector lane select.

use super::optimization::{Phase, PhaseContext, PhaseResult};
use super::{KernelGraph, NodeId, Op, Region};
use crate::error::{CompileError, CompileResult};
use fxhash::FxHashSet;
use indexmap::IndexSet;

/// Where an array reference comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryRoot {
    Parameter(u32),
    Allocation(NodeId),
}

/// Roots an array reference may point into; `None` when one of the
/// sources is not a parameter or allocation.
pub fn resolve_roots(graph: &KernelGraph, base: NodeId) -> Option<IndexSet<MemoryRoot>> {
    let mut roots = IndexSet::new();
    let mut visited: FxHashSet<NodeId> = FxHashSet::default();
    let mut worklist = vec![base];
    while let Some(id) = worklist.pop() {
        if !visited.insert(id) {
            continue;
        }
        let node = graph.get(id)?;
        match node.op {
            Op::Parameter(index) => {
                roots.insert(MemoryRoot::Parameter(index));
            }
            Op::NewArray { .. } => {
                roots.insert(MemoryRoot::Allocation(id));
            }
            Op::Phi => worklist.extend(node.inputs.iter().copied()),
            Op::Conditional => worklist.extend(node.inputs.iter().skip(1).copied()),
            Op::Address { .. } => worklist.extend(node.input(0)),
            _ => return None,
        }
    }
    Some(roots)
}

pub struct RedundantPhiEliminationPhase;

impl RedundantPhiEliminationPhase {
    pub fn new() -> Self {
        Self
    }

    fn remove_memory_phis(graph: &mut KernelGraph) -> CompileResult<usize> {
        let memory_phis: FxHashSet<NodeId> = graph
            .nodes()
            .filter(|(_, n)| n.op == Op::MemoryPhi)
            .map(|(id, _)| id)
            .collect();
        if memory_phis.is_empty() {
            return Ok(0);
        }
        let users: Vec<NodeId> = graph
            .nodes()
            .filter(|(id, n)| {
                !memory_phis.contains(id) && n.inputs.iter().any(|i| memory_phis.contains(i))
            })
            .map(|(id, _)| id)
            .collect();
        for user in users {
            let node = graph.node_mut(user)?;
            if node.op != Op::FrameState {
                return Err(CompileError::malformed(format!(
                    "memory phi consumed by {} ({})",
                    user,
                    node.op.describe()
                )));
            }
            node.inputs.retain(|i| !memory_phis.contains(i));
        }
        let mut ordered: Vec<NodeId> = memory_phis.into_iter().collect();
        ordered.sort();
        for &phi in &ordered {
            graph.remove_node(phi)?;
        }
        Ok(ordered.len())
    }

    /// Phis that merge a single value, including phi cycles feeding only
    /// that value back.
    fn remove_redundant_value_phis(graph: &mut KernelGraph) -> CompileResult<usize> {
        let mut removed = 0;
        loop {
            let phis: Vec<NodeId> = graph
                .nodes()
                .filter(|(_, n)| n.op == Op::Phi)
                .map(|(id, _)| id)
                .collect();
            let mut progress = false;
            for phi in phis {
                if !graph.contains(phi) {
                    continue;
                }
                let Some(value) = Self::single_source(graph, phi) else {
                    continue;
                };
                graph.replace_all_uses(phi, value);
                graph.remove_node(phi)?;
                removed += 1;
                progress = true;
            }
            if !progress {
                return Ok(removed);
            }
        }
    }

    /// The only non-phi value reaching `phi` through a web of phis.
    fn single_source(graph: &KernelGraph, phi: NodeId) -> Option<NodeId> {
        let mut web: FxHashSet<NodeId> = FxHashSet::default();
        let mut source: Option<NodeId> = None;
        let mut worklist = vec![phi];
        while let Some(id) = worklist.pop() {
            if !web.insert(id) {
                continue;
            }
            for &input in &graph.get(id)?.inputs {
                if graph.get(input).map_or(false, |n| n.op == Op::Phi) {
                    worklist.push(input);
                } else {
                    match source {
                        None => source = Some(input),
                        Some(existing) if existing == input => {}
                        Some(_) => return None,
                    }
                }
            }
        }
        source
    }
}

impl Default for RedundantPhiEliminationPhase {
    fn default() -> Self {
        Self::new()
    }
}

impl Phase for RedundantPhiEliminationPhase {
    fn name(&self) -> &'static str {
        "redundant-phi-elimination"
    }

    fn run(&mut self, graph: &mut KernelGraph, _ctx: &PhaseContext<'_>) -> CompileResult<PhaseResult> {
        let memory = Self::remove_memory_phis(graph)?;
        let values = Self::remove_redundant_value_phis(graph)?;
        if memory + values == 0 {
            return Ok(PhaseResult::unchanged());
        }
        let mut result = PhaseResult::changed()
            .stat("memory_phis", memory)
            .stat("value_phis", values);
        result.nodes_eliminated = memory + values;
        Ok(result)
    }
}

pub struct FloatingReadPhase;

/// Memory touched by stores of the compile unit.
enum Clobbers {
    Everything,
    Roots(FxHashSet<MemoryRoot>),
}

impl FloatingReadPhase {
    pub fn new() -> Self {
        Self
    }

    fn clobbers(graph: &KernelGraph) -> Clobbers {
        let mut roots = FxHashSet::default();
        for (_, node) in graph.nodes() {
            let base = match node.op {
                Op::Write { .. } | Op::AtomicUpdate { .. } => node.input(0),
                Op::Invoke(_) => return Clobbers::Everything,
                _ => continue,
            };
            match base.and_then(|b| resolve_roots(graph, b)) {
                Some(resolved) => roots.extend(resolved),
                None => return Clobbers::Everything,
            }
        }
        Clobbers::Roots(roots)
    }

    fn may_float(graph: &KernelGraph, read: NodeId, clobbers: &Clobbers) -> CompileResult<bool> {
        let node = graph.node(read)?;
        let Some(roots) = node.input(0).and_then(|b| resolve_roots(graph, b)) else {
            return Ok(false);
        };
        match clobbers {
            Clobbers::Everything => return Ok(false),
            Clobbers::Roots(written) => {
                if roots.iter().any(|r| written.contains(r)) {
                    return Ok(false);
                }
            }
        }

        let Some(block) = node.block else {
            return Ok(false);
        };
        let fixed = &graph.block(block)?.fixed;
        let next = fixed
            .iter()
            .position(|&n| n == read)
            .and_then(|pos| fixed.get(pos + 1));
        if let Some(&next) = next {
            if matches!(graph.op(next)?, Op::Barrier(_)) {
                return Ok(false);
            }
        }

        let private = roots.iter().any(|root| match root {
            MemoryRoot::Allocation(alloc) => matches!(
                graph.get(*alloc).map(|n| &n.op),
                Some(Op::NewArray {
                    region: Region::Private,
                    ..
                })
            ),
            MemoryRoot::Parameter(_) => false,
        });
        if private {
            let users = graph.usages();
            let usages = users.of(read);
            let all_lane_selects = !usages.is_empty()
                && usages.iter().all(|u| match *u {
                    super::Usage::Node(user) => {
                        matches!(graph.get(user).map(|n| &n.op), Some(Op::VectorElement(_)))
                    }
                    super::Usage::Terminator(_) => false,
                });
            if !all_lane_selects {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl Default for FloatingReadPhase {
    fn default() -> Self {
        Self::new()
    }
}

impl Phase for FloatingReadPhase {
    fn name(&self) -> &'static str {
        "floating-reads"
    }

    fn run(&mut self, graph: &mut KernelGraph, ctx: &PhaseContext<'_>) -> CompileResult<PhaseResult> {
        if !ctx.options.float_reads {
            return Ok(PhaseResult::unchanged());
        }
        let clobbers = Self::clobbers(graph);
        let reads: Vec<NodeId> = graph
            .nodes()
            .filter(|(_, n)| matches!(n.op, Op::Read { floating: false, .. }))
            .map(|(id, _)| id)
            .collect();

        let mut floated = 0;
        let mut pinned = 0;
        for read in reads {
            if !Self::may_float(graph, read, &clobbers)? {
                pinned += 1;
                continue;
            }
            graph.detach_fixed(read)?;
            if let Op::Read { floating, .. } = &mut graph.node_mut(read)?.op {
                *floating = true;
            }
            floated += 1;
        }
        if floated == 0 {
            return Ok(PhaseResult::unchanged().stat("pinned", pinned));
        }
        Ok(PhaseResult::changed()
            .stat("floated", floated)
            .stat("pinned", pinned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::optimization::tests::run_phase;
    use crate::ir::{BarrierScope, GraphBuilder, Kind, MethodId, ScalarKind};

    fn is_floating(graph: &KernelGraph, read: NodeId) -> bool {
        matches!(graph.op(read).unwrap(), Op::Read { floating: true, .. })
    }

    #[test]
    fn test_read_of_unwritten_array_floats() {
        let mut b = GraphBuilder::kernel(MethodId::new("T", "copy"));
        let src = b.array_parameter("src", Kind::F32);
        let dst = b.array_parameter("dst", Kind::F32);
        let i = b.int(0);
        let x = b.read(src, i, Kind::F32).unwrap();
        b.write(dst, i, x).unwrap();
        b.ret(None).unwrap();
        let mut graph = b.finish().unwrap();

        run_phase(&mut FloatingReadPhase::new(), &mut graph).unwrap();
        assert!(is_floating(&graph, x));
        assert_eq!(graph.node(x).unwrap().block, Some(graph.entry()));
        assert!(!graph.block(graph.entry()).unwrap().fixed.contains(&x));
    }

    #[test]
    fn test_read_of_written_array_stays_pinned() {
        let mut b = GraphBuilder::kernel(MethodId::new("T", "inc"));
        let a = b.array_parameter("a", Kind::S32);
        let i = b.int(0);
        let x = b.read(a, i, Kind::S32).unwrap();
        let one = b.int(1);
        let y = b.add(x, one);
        b.write(a, i, y).unwrap();
        b.ret(None).unwrap();
        let mut graph = b.finish().unwrap();

        run_phase(&mut FloatingReadPhase::new(), &mut graph).unwrap();
        assert!(!is_floating(&graph, x));
    }

    #[test]
    fn test_read_before_barrier_stays_pinned() {
        let mut b = GraphBuilder::kernel(MethodId::new("T", "sync"));
        let src = b.array_parameter("src", Kind::F32);
        let dst = b.array_parameter("dst", Kind::F32);
        let i = b.int(0);
        let x = b.read(src, i, Kind::F32).unwrap();
        b.barrier(BarrierScope::Local).unwrap();
        b.write(dst, i, x).unwrap();
        b.ret(None).unwrap();
        let mut graph = b.finish().unwrap();

        run_phase(&mut FloatingReadPhase::new(), &mut graph).unwrap();
        assert!(!is_floating(&graph, x));
    }

    #[test]
    fn test_private_reads_float_only_into_lane_selects() {
        let v2 = Kind::vector(ScalarKind::F32, 2);
        let mut b = GraphBuilder::kernel(MethodId::new("T", "lanes"));
        let dst = b.array_parameter("dst", Kind::F32);
        let scratch = b.new_array(v2, 4, Region::Private).unwrap();
        let i = b.int(0);
        let whole = b.read(scratch, i, v2).unwrap();
        let lane = b.lane(whole, 1);
        let plain = b.read(scratch, i, v2).unwrap();
        let copy = b.vector(&[plain], v2);
        let first = b.lane(copy, 0);
        b.write(dst, i, lane).unwrap();
        b.write(dst, i, first).unwrap();
        b.ret(None).unwrap();
        let mut graph = b.finish().unwrap();

        run_phase(&mut FloatingReadPhase::new(), &mut graph).unwrap();
        assert!(is_floating(&graph, whole));
        assert!(!is_floating(&graph, plain));
    }

    #[test]
    fn test_memory_phis_removed() {
        //  entry -> merge(memphi) <- other
        let mut b = GraphBuilder::kernel(MethodId::new("T", "m"));
        let cond = b.boolean(true);
        let left = b.create_block();
        let right = b.create_block();
        let merge = b.create_block();
        b.branch(cond, left, right).unwrap();
        b.switch_to_block(left);
        b.jump(merge).unwrap();
        b.switch_to_block(right);
        b.jump(merge).unwrap();
        b.switch_to_block(merge);
        let state = b.frame_state(&[]);
        let phi = b.memory_phi(merge, &[state, state]).unwrap();
        let one = b.int(1);
        let same = b.phi(merge, &[one, one], Kind::S32).unwrap();
        b.ret(None).unwrap();
        let mut graph = b.finish().unwrap();

        let result = run_phase(&mut RedundantPhiEliminationPhase::new(), &mut graph).unwrap();
        assert_eq!(result.nodes_eliminated, 2);
        assert!(!graph.contains(phi));
        assert!(!graph.contains(same));
    }

    #[test]
    fn test_roots_resolve_through_selects() {
        let mut b = GraphBuilder::kernel(MethodId::new("T", "sel"));
        let a = b.array_parameter("a", Kind::S32);
        let c = b.array_parameter("c", Kind::S32);
        let flag = b.boolean(false);
        let either = b.select(flag, a, c);
        b.ret(None).unwrap();
        let graph = b.finish().unwrap();
        let roots = resolve_roots(&graph, either).unwrap();
        assert_eq!(
            roots.into_iter().collect::<Vec<_>>(),
            vec![MemoryRoot::Parameter(1), MemoryRoot::Parameter(0)]
        );
    }
}
