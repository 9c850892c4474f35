//! Escape analysis for kernel allocations.
//!
//! Kernels cannot allocate from a heap, so every `NewArray` must stay inside
//! the compile unit. An allocation is followed through phis, selects and
//! address arithmetic:
//!
//! 1. Stored as a value, passed to a call, or returned: it escapes and the
//!    compile unit is rejected.
//! 2. Never read: its writes are dead and are removed; the allocation itself
//!    is then dropped by dead-code elimination.

use super::graph::Usage;
use super::optimization::{Phase, PhaseContext, PhaseResult};
use super::{KernelGraph, NodeId, Op};
use crate::error::{CompileError, CompileResult};
use fxhash::FxHashSet;

/// Result of escape analysis for a single allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationInfo {
    pub allocation: NodeId,
    /// Values derived from the allocation pointer (including itself)
    pub derived: Vec<NodeId>,
    pub reads: Vec<NodeId>,
    pub writes: Vec<NodeId>,
    pub null_checks: Vec<NodeId>,
    /// Reason the pointer escapes, if it does
    pub escape: Option<String>,
}

pub fn analyze_allocation(graph: &KernelGraph, allocation: NodeId) -> CompileResult<AllocationInfo> {
    let usages = graph.usages();
    let mut info = AllocationInfo {
        allocation,
        derived: vec![allocation],
        reads: Vec::new(),
        writes: Vec::new(),
        null_checks: Vec::new(),
        escape: None,
    };
    let mut seen: FxHashSet<NodeId> = FxHashSet::default();
    seen.insert(allocation);
    let mut worklist = vec![allocation];

    while let Some(pointer) = worklist.pop() {
        for usage in usages.of(pointer) {
            let user = match *usage {
                Usage::Terminator(block) => {
                    if matches!(graph.block(block)?.terminator, super::Terminator::Return(_)) {
                        info.escape.get_or_insert_with(|| "returned".to_string());
                    }
                    continue;
                }
                Usage::Node(user) => user,
            };
            let node = graph.node(user)?;
            match &node.op {
                Op::Phi | Op::Address { .. } => {
                    if seen.insert(user) {
                        info.derived.push(user);
                        worklist.push(user);
                    }
                }
                Op::Conditional if node.input(0) != Some(pointer) => {
                    if seen.insert(user) {
                        info.derived.push(user);
                        worklist.push(user);
                    }
                }
                Op::Read { .. } if node.input(0) == Some(pointer) => {
                    if !info.reads.contains(&user) {
                        info.reads.push(user);
                    }
                }
                Op::Write { .. } | Op::AtomicUpdate { .. } => {
                    if node.inputs.iter().skip(1).any(|&i| i == pointer) {
                        info.escape
                            .get_or_insert_with(|| format!("stored to memory by {}", user));
                    } else if !info.writes.contains(&user) {
                        info.writes.push(user);
                    }
                }
                Op::Invoke(method) => {
                    info.escape
                        .get_or_insert_with(|| format!("passed to call of {}", method));
                }
                Op::NullCheck => {
                    if !info.null_checks.contains(&user) {
                        info.null_checks.push(user);
                    }
                }
                Op::FrameState | Op::Compare(_) => {}
                other => {
                    info.escape
                        .get_or_insert_with(|| format!("used by {}", other.describe()));
                }
            }
        }
    }
    Ok(info)
}

pub struct EscapeAnalysisPhase;

impl EscapeAnalysisPhase {
    pub fn new() -> Self {
        Self
    }
}

impl Default for EscapeAnalysisPhase {
    fn default() -> Self {
        Self::new()
    }
}

impl Phase for EscapeAnalysisPhase {
    fn name(&self) -> &'static str {
        "escape-analysis"
    }

    fn run(&mut self, graph: &mut KernelGraph, ctx: &PhaseContext<'_>) -> CompileResult<PhaseResult> {
        if !ctx.options.escape_analysis {
            return Ok(PhaseResult::unchanged());
        }
        let allocations: Vec<NodeId> = graph
            .nodes()
            .filter(|(_, n)| matches!(n.op, Op::NewArray { .. }))
            .map(|(id, _)| id)
            .collect();

        let mut removed_writes = 0;
        let mut dead_allocations = 0;
        for allocation in allocations {
            let info = analyze_allocation(graph, allocation)?;
            if let Some(reason) = info.escape {
                return Err(CompileError::unsupported(
                    self.name(),
                    format!("allocation {} escapes the kernel: {}", allocation, reason),
                ));
            }
            if info.reads.is_empty() {
                for id in info.writes.iter().chain(info.null_checks.iter()) {
                    graph.remove_node(*id)?;
                    removed_writes += 1;
                }
                dead_allocations += 1;
            }
        }

        if removed_writes == 0 {
            return Ok(PhaseResult::unchanged());
        }
        let mut result = PhaseResult::changed()
            .stat("dead_allocations", dead_allocations)
            .stat("removed_writes", removed_writes);
        result.nodes_eliminated = removed_writes;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::optimization::tests::run_phase;
    use crate::ir::optimization::DeadCodeEliminationPhase;
    use crate::ir::{GraphBuilder, Kind, MethodId, Region};

    #[test]
    fn test_write_only_allocation_removed() {
        let mut b = GraphBuilder::kernel(MethodId::new("T", "k"));
        let a = b.array_parameter("a", Kind::S32);
        let scratch = b.new_array(Kind::S32, 16, Region::Private).unwrap();
        let i = b.int(3);
        let v = b.int(7);
        b.write(scratch, i, v).unwrap();
        b.write(a, i, v).unwrap();
        b.ret(None).unwrap();
        let mut graph = b.finish().unwrap();

        let result = run_phase(&mut EscapeAnalysisPhase::new(), &mut graph).unwrap();
        assert_eq!(result.stats["removed_writes"], 1);
        run_phase(&mut DeadCodeEliminationPhase::new(), &mut graph).unwrap();
        assert!(!graph.contains(scratch));
        let writes = graph
            .nodes()
            .filter(|(_, n)| matches!(n.op, Op::Write { .. }))
            .count();
        assert_eq!(writes, 1);
    }

    #[test]
    fn test_allocation_passed_to_call_is_rejected() {
        let mut b = GraphBuilder::kernel(MethodId::new("T", "k"));
        let scratch = b.new_array(Kind::F32, 4, Region::Local).unwrap();
        b.invoke(MethodId::new("Util", "fill"), &[scratch], Kind::Void)
            .unwrap();
        b.ret(None).unwrap();
        let mut graph = b.finish().unwrap();

        let err = run_phase(&mut EscapeAnalysisPhase::new(), &mut graph).unwrap_err();
        assert!(err.is_unsupported());
        assert!(err.to_string().contains("passed to call of Util.fill"));
    }

    #[test]
    fn test_read_allocation_kept() {
        let mut b = GraphBuilder::kernel(MethodId::new("T", "k"));
        let a = b.array_parameter("a", Kind::S32);
        let scratch = b.new_array(Kind::S32, 4, Region::Private).unwrap();
        let i = b.int(0);
        let v = b.int(9);
        b.write(scratch, i, v).unwrap();
        let x = b.read(scratch, i, Kind::S32).unwrap();
        b.write(a, i, x).unwrap();
        b.ret(None).unwrap();
        let mut graph = b.finish().unwrap();

        let info = analyze_allocation(&graph, scratch).unwrap();
        assert_eq!(info.reads.len(), 1);
        assert_eq!(info.writes.len(), 1);
        let result = run_phase(&mut EscapeAnalysisPhase::new(), &mut graph).unwrap();
        assert!(!result.modified);
    }
}
