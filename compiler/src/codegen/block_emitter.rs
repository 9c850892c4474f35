//! Block emission order and the LIR entry point.
//!
//! Blocks are visited depth-first from the entry, successors in terminator
//! order, each block exactly once. Every dominator of a block is therefore
//! emitted before it, so a value is always defined before its first use in
//! emission order.

use super::instruction_lowering::LirGenerator;
use super::lir::LirUnit;
use super::target::{Payload, TargetDescription};
use crate::config::{CompileOptions, DeviceDescriptor};
use crate::error::CompileResult;
use crate::ir::scheduling::{compute_schedule, ScheduleStrategy};
use crate::ir::{BlockId, KernelGraph, Schedule};
use fxhash::FxHashSet;
use tracing::{debug, trace};

/// Blocks reachable from the entry in depth-first preorder.
pub fn emission_order(graph: &KernelGraph) -> CompileResult<Vec<BlockId>> {
    let mut order = Vec::with_capacity(graph.block_count());
    let mut visited = FxHashSet::default();
    visit(graph, graph.entry(), &mut visited, &mut order)?;
    Ok(order)
}

fn visit(
    graph: &KernelGraph,
    block: BlockId,
    visited: &mut FxHashSet<BlockId>,
    order: &mut Vec<BlockId>,
) -> CompileResult<()> {
    if !visited.insert(block) {
        return Ok(());
    }
    order.push(block);
    for successor in graph.successors(block)? {
        visit(graph, successor, visited, order)?;
    }
    Ok(())
}

/// Select instructions for every reachable block of `graph`.
pub fn generate_lir(
    graph: &KernelGraph,
    schedule: &Schedule,
    target: &dyn TargetDescription,
    options: &CompileOptions,
    device: &DeviceDescriptor,
    entry_name: &str,
) -> CompileResult<LirUnit> {
    let order = emission_order(graph)?;
    let mut generator = LirGenerator::new(graph, schedule, target, options, device, entry_name);
    for block in order {
        generator.emit_block(block)?;
    }
    let unit = generator.finish();
    debug!(
        target = target.name(),
        entry = %unit.entry_name,
        blocks = unit.blocks.len(),
        variables = unit.variable_count(),
        "generated LIR"
    );
    trace!("\n{}", unit);
    Ok(unit)
}

/// LIR generation and assembly of a fully lowered graph. Uses the graph's
/// installed schedule, or computes a latest-out-of-loops one.
pub fn emit(
    graph: &KernelGraph,
    target: &dyn TargetDescription,
    options: &CompileOptions,
    device: &DeviceDescriptor,
    entry_name: &str,
) -> CompileResult<(LirUnit, Payload)> {
    let computed;
    let schedule = match graph.schedule() {
        Some(schedule) => schedule,
        None => {
            computed = compute_schedule(graph, ScheduleStrategy::LatestOutOfLoops)?;
            &computed
        }
    };
    let unit = generate_lir(graph, schedule, target, options, device, entry_name)?;
    let payload = target.assemble(&unit, options, device)?;
    debug!(
        target = target.name(),
        entry = %unit.entry_name,
        bytes = payload.len(),
        "assembled"
    );
    Ok((unit, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{GraphBuilder, Kind, MethodId};

    #[test]
    fn test_dfs_visits_then_branch_first() {
        // bb0 -> bb1 -> bb3
        //   \--> bb2 --/
        let mut b = GraphBuilder::callee(MethodId::new("T", "diamond"), Kind::S32);
        let x = b.scalar_parameter("x", Kind::PRED);
        let then_block = b.create_block();
        let else_block = b.create_block();
        let join = b.create_block();
        b.branch(x, then_block, else_block).unwrap();
        b.switch_to_block(then_block);
        let one = b.int(1);
        b.jump(join).unwrap();
        b.switch_to_block(else_block);
        let two = b.int(2);
        b.jump(join).unwrap();
        b.switch_to_block(join);
        let merged = b.phi(join, &[one, two], Kind::S32).unwrap();
        b.ret(Some(merged)).unwrap();
        let graph = b.finish().unwrap();

        let order = emission_order(&graph).unwrap();
        assert_eq!(order, vec![BlockId(0), BlockId(1), BlockId(3), BlockId(2)]);
    }

    #[test]
    fn test_unreachable_blocks_are_skipped() {
        let mut b = GraphBuilder::kernel(MethodId::new("T", "dead"));
        let dead = b.create_block();
        b.ret(None).unwrap();
        b.switch_to_block(dead);
        b.ret(None).unwrap();
        let graph = b.finish().unwrap();
        assert_eq!(emission_order(&graph).unwrap(), vec![BlockId(0)]);
    }
}
