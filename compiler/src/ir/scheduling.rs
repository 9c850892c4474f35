//! Node Scheduling
//!
//! Assigns every floating node to a block and fixes a total order inside
//! each block. Two strategies are used by the tiers:
//!
//! - **Earliest**: the dominator-tree-deepest block among the blocks of the
//!   node's inputs. Run at the end of the high tier.
//! - **Latest out of loops**: the common dominator of all uses, then moved
//!   up the dominator path towards the earliest block to the block with the
//!   smallest loop depth. Run at the end of the low tier, it hoists
//!   loop-invariant code.
//!
//! Within a block the order is: phis, then the fixed nodes in program order
//! (each preceded by the not yet emitted floating nodes it depends on), then
//! the remaining floating nodes.

use super::graph::Usage;
use super::loop_analysis::{DominatorTree, LoopNestInfo};
use super::optimization::{Phase, PhaseContext, PhaseResult};
use super::{BlockId, KernelGraph, NodeId, Op};
use crate::error::{CompileError, CompileResult};
use fxhash::{FxHashMap, FxHashSet};
use indexmap::IndexMap;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduleStrategy {
    Earliest,
    LatestOutOfLoops,
}

/// Block assignment and in-block order of every live node.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    blocks: IndexMap<BlockId, Vec<NodeId>>,
    placement: FxHashMap<NodeId, BlockId>,
    strategy: ScheduleStrategy,
}

impl Schedule {
    /// Nodes of `block` in execution order.
    pub fn nodes_in(&self, block: BlockId) -> &[NodeId] {
        self.blocks.get(&block).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn block_of(&self, node: NodeId) -> Option<BlockId> {
        self.placement.get(&node).copied()
    }

    pub fn strategy(&self) -> ScheduleStrategy {
        self.strategy
    }

    pub fn node_count(&self) -> usize {
        self.placement.len()
    }
}

/// Compute a schedule for `graph` without installing it.
pub fn compute_schedule(graph: &KernelGraph, strategy: ScheduleStrategy) -> CompileResult<Schedule> {
    let domtree = DominatorTree::compute(graph);
    let loops = LoopNestInfo::analyze(graph, &domtree);
    let entry = graph.entry();

    let mut placement: FxHashMap<NodeId, BlockId> = FxHashMap::default();
    let mut floating: Vec<NodeId> = Vec::new();

    for (id, node) in graph.nodes() {
        if node.op.is_fixed() || node.op.is_phi() {
            let block = node.block.ok_or_else(|| {
                CompileError::Internal(format!("fixed node {} has no block", id))
            })?;
            if domtree.is_reachable(block) {
                placement.insert(id, block);
            }
        } else {
            floating.push(id);
        }
    }

    let order = topological_order(graph, &floating);

    // earliest placement, inputs first
    for &id in &order {
        let node = graph.node(id)?;
        let mut earliest = match (&node.op, node.block) {
            // floating reads never move above their anchor
            (Op::Read { .. }, Some(anchor)) if domtree.is_reachable(anchor) => anchor,
            _ => entry,
        };
        for &input in &node.inputs {
            if let Some(&block) = placement.get(&input) {
                if domtree.depth(block) > domtree.depth(earliest) {
                    earliest = block;
                }
            }
        }
        placement.insert(id, earliest);
    }

    if strategy == ScheduleStrategy::LatestOutOfLoops {
        let usages = graph.usages();
        for &id in order.iter().rev() {
            let earliest = placement.get(&id).copied().unwrap_or(entry);
            let Some(lca) = common_use_block(graph, &usages, &placement, &domtree, id)? else {
                continue;
            };
            if !domtree.dominates(earliest, lca) {
                continue;
            }
            let mut best = lca;
            let mut current = lca;
            while current != earliest {
                current = match domtree.idom(current) {
                    Some(parent) => parent,
                    None => break,
                };
                if loops.loop_depth(current) < loops.loop_depth(best) {
                    best = current;
                }
            }
            placement.insert(id, best);
        }
    }

    let blocks = order_blocks(graph, &domtree, &placement)?;
    let schedule = Schedule {
        blocks,
        placement,
        strategy,
    };
    trace!(method = %graph.method, ?strategy, nodes = schedule.node_count(), "scheduled");
    Ok(schedule)
}

/// Floating nodes ordered so that inputs come before their users.
fn topological_order(graph: &KernelGraph, floating: &[NodeId]) -> Vec<NodeId> {
    let floating_set: FxHashSet<NodeId> = floating.iter().copied().collect();
    let mut visited: FxHashSet<NodeId> = FxHashSet::default();
    let mut order = Vec::with_capacity(floating.len());

    for &root in floating {
        if visited.contains(&root) {
            continue;
        }
        // iterative post-order: (node, next input index)
        let mut stack: Vec<(NodeId, usize)> = vec![(root, 0)];
        visited.insert(root);
        while let Some((id, next)) = stack.pop() {
            let inputs = graph.get(id).map(|n| n.inputs.as_slice()).unwrap_or(&[]);
            if let Some(&input) = inputs.get(next) {
                stack.push((id, next + 1));
                if floating_set.contains(&input) && visited.insert(input) {
                    stack.push((input, 0));
                }
            } else {
                order.push(id);
            }
        }
    }
    order
}

fn common_use_block(
    graph: &KernelGraph,
    usages: &super::graph::Usages,
    placement: &FxHashMap<NodeId, BlockId>,
    domtree: &DominatorTree,
    id: NodeId,
) -> CompileResult<Option<BlockId>> {
    let mut lca: Option<BlockId> = None;
    let mut merge = |block: BlockId| {
        if !domtree.is_reachable(block) {
            return;
        }
        lca = Some(match lca {
            None => block,
            Some(current) => domtree.common_dominator(current, block),
        });
    };

    for usage in usages.of(id) {
        match *usage {
            Usage::Terminator(block) => merge(block),
            Usage::Node(user) => {
                let node = graph.node(user)?;
                if node.op.is_phi() {
                    // a phi input is used at the end of the matching predecessor
                    let Some(owner) = node.block else { continue };
                    let predecessors = &graph.block(owner)?.predecessors;
                    for (index, &input) in node.inputs.iter().enumerate() {
                        if input == id {
                            if let Some(&pred) = predecessors.get(index) {
                                merge(pred);
                            }
                        }
                    }
                } else if let Some(&block) = placement.get(&user) {
                    merge(block);
                }
            }
        }
    }
    Ok(lca)
}

fn order_blocks(
    graph: &KernelGraph,
    domtree: &DominatorTree,
    placement: &FxHashMap<NodeId, BlockId>,
) -> CompileResult<IndexMap<BlockId, Vec<NodeId>>> {
    let mut by_block: FxHashMap<BlockId, Vec<NodeId>> = FxHashMap::default();
    for (id, _) in graph.nodes() {
        if let Some(&block) = placement.get(&id) {
            by_block.entry(block).or_default().push(id);
        }
    }

    let mut blocks = IndexMap::new();
    for &block_id in domtree.reverse_postorder_blocks() {
        let block = graph.block(block_id)?;
        let members: FxHashSet<NodeId> = by_block
            .remove(&block_id)
            .unwrap_or_default()
            .into_iter()
            .collect();
        let mut emitted: FxHashSet<NodeId> = FxHashSet::default();
        let mut ordered: Vec<NodeId> = Vec::with_capacity(members.len());

        for &phi in &block.phis {
            if emitted.insert(phi) {
                ordered.push(phi);
            }
        }
        for &fixed in &block.fixed {
            emit_with_inputs(graph, fixed, &members, &mut emitted, &mut ordered);
        }
        for input in block.terminator.inputs() {
            emit_with_inputs(graph, input, &members, &mut emitted, &mut ordered);
        }
        // arena order keeps the rest deterministic
        for (id, _) in graph.nodes() {
            if members.contains(&id) {
                emit_with_inputs(graph, id, &members, &mut emitted, &mut ordered);
            }
        }
        blocks.insert(block_id, ordered);
    }
    Ok(blocks)
}

/// Emit `id` after its unemitted same-block inputs.
fn emit_with_inputs(
    graph: &KernelGraph,
    id: NodeId,
    members: &FxHashSet<NodeId>,
    emitted: &mut FxHashSet<NodeId>,
    ordered: &mut Vec<NodeId>,
) {
    if !members.contains(&id) || emitted.contains(&id) {
        return;
    }
    let mut stack: Vec<(NodeId, usize)> = vec![(id, 0)];
    emitted.insert(id);
    while let Some((current, next)) = stack.pop() {
        let node = graph.get(current);
        let is_phi = node.map_or(false, |n| n.op.is_phi());
        let inputs = node.map(|n| n.inputs.as_slice()).unwrap_or(&[]);
        match inputs.get(next) {
            Some(&input) if !is_phi => {
                stack.push((current, next + 1));
                let floating_member = members.contains(&input)
                    && graph.get(input).map_or(false, |n| !n.op.is_fixed());
                if floating_member && emitted.insert(input) {
                    stack.push((input, 0));
                }
            }
            _ => ordered.push(current),
        }
    }
}

/// Install a fresh schedule on the graph.
pub struct SchedulePhase {
    strategy: ScheduleStrategy,
}

impl SchedulePhase {
    pub fn new(strategy: ScheduleStrategy) -> Self {
        Self { strategy }
    }
}

impl Phase for SchedulePhase {
    fn name(&self) -> &'static str {
        match self.strategy {
            ScheduleStrategy::Earliest => "schedule-earliest",
            ScheduleStrategy::LatestOutOfLoops => "schedule-latest",
        }
    }

    fn run(&mut self, graph: &mut KernelGraph, _ctx: &PhaseContext<'_>) -> CompileResult<PhaseResult> {
        let schedule = compute_schedule(graph, self.strategy)?;
        let mut result = PhaseResult::unchanged();
        result
            .stats
            .insert("scheduled_nodes".to_string(), schedule.node_count());
        graph.set_schedule(schedule);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Condition, GraphBuilder, Kind, MethodId};

    /// `for (i = 0; i < n; i++) a[i] = x * y;` with `x * y` invariant.
    fn invariant_loop() -> (KernelGraph, NodeId, BlockId, BlockId) {
        //     entry
        //       |
        //     header <--+
        //      /  \     |
        //   exit   body-+
        let mut b = GraphBuilder::kernel(MethodId::new("T", "fill"));
        let a = b.array_parameter("a", Kind::F32);
        let x = b.scalar_parameter("x", Kind::F32);
        let y = b.scalar_parameter("y", Kind::F32);
        let n = b.scalar_parameter("n", Kind::S32);
        let zero = b.int(0);
        let header = b.create_block();
        let body = b.create_block();
        let exit = b.create_block();
        b.jump(header).unwrap();
        b.switch_to_block(header);
        let i = b.phi(header, &[zero], Kind::S32).unwrap();
        let cond = b.compare(Condition::Lt, i, n);
        b.branch(cond, body, exit).unwrap();
        b.switch_to_block(body);
        let product = b.mul(x, y);
        b.write(a, i, product).unwrap();
        let one = b.int(1);
        let next = b.add(i, one);
        b.add_phi_input(i, next).unwrap();
        b.jump(header).unwrap();
        b.switch_to_block(exit);
        b.ret(None).unwrap();
        (b.finish().unwrap(), product, header, body)
    }

    #[test]
    fn test_earliest_places_parameters_in_entry() {
        let (graph, product, _, _) = invariant_loop();
        let schedule = compute_schedule(&graph, ScheduleStrategy::Earliest).unwrap();
        assert_eq!(schedule.block_of(product), Some(BlockId::entry()));
    }

    #[test]
    fn test_latest_hoists_invariant_out_of_loop() {
        let (graph, product, header, body) = invariant_loop();
        let schedule = compute_schedule(&graph, ScheduleStrategy::LatestOutOfLoops).unwrap();
        let block = schedule.block_of(product).unwrap();
        assert_ne!(block, body);
        assert_ne!(block, header);
        assert_eq!(block, BlockId::entry());
    }

    #[test]
    fn test_inputs_precede_users_within_block() {
        let (graph, _, _, body) = invariant_loop();
        let schedule = compute_schedule(&graph, ScheduleStrategy::Earliest).unwrap();
        let nodes = schedule.nodes_in(body);
        assert!(nodes
            .iter()
            .any(|&n| matches!(graph.op(n).unwrap(), Op::Write { .. })));
        for (pos, &n) in nodes.iter().enumerate() {
            for input in &graph.node(n).unwrap().inputs {
                if let Some(input_pos) = nodes.iter().position(|m| m == input) {
                    assert!(input_pos < pos, "{} used before definition", input);
                }
            }
        }
    }

    #[test]
    fn test_every_live_node_is_placed() {
        let (graph, _, _, _) = invariant_loop();
        let schedule = compute_schedule(&graph, ScheduleStrategy::LatestOutOfLoops).unwrap();
        let total: usize = graph.block_ids().iter().map(|b| schedule.nodes_in(*b).len()).sum();
        assert_eq!(total, graph.node_count());
    }
}
