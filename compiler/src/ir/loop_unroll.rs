//! Full unrolling of small counted loops.
//!
//! Handles the canonical two-block shape produced by the front end:
//!
//! ```text
//!   preheader -> header(phis, if cond) -> body -> header
//!                        \-> exit
//! ```
//!
//! where one header phi is an induction variable starting at a constant,
//! stepped by a constant and compared against a constant bound. The trip
//! count is found by evaluating the induction at compile time; loops within
//! the trip and size budgets are replaced by one straight-line block holding
//! every iteration.

use super::loop_analysis::{DominatorTree, LoopNestInfo};
use super::nodes::{fold_binary, fold_compare};
use super::optimization::{Phase, PhaseContext, PhaseResult};
use super::{BinaryOp, BlockId, Condition, Constant, KernelGraph, NodeId, Op, ScalarKind, Terminator};
use crate::error::{CompileError, CompileResult};
use fxhash::{FxHashMap, FxHashSet};
use tracing::debug;

/// A loop matching the unrollable shape.
#[derive(Debug, Clone)]
pub struct CountedLoop {
    pub preheader: BlockId,
    pub header: BlockId,
    pub body: BlockId,
    pub exit: BlockId,
    pub induction: NodeId,
    pub trip_count: u64,
    /// Nodes recomputed on every iteration (header phis excluded)
    pub loop_nodes: usize,
}

struct Induction {
    phi: NodeId,
    kind: ScalarKind,
    init: Constant,
    step_op: BinaryOp,
    step: Constant,
    cond: Condition,
    bound: Constant,
    continue_when: bool,
}

/// Nodes whose value changes per iteration: header phis, body fixed nodes
/// and every floating node depending on them.
fn loop_dependent(graph: &KernelGraph, header: BlockId, body: BlockId) -> CompileResult<FxHashSet<NodeId>> {
    let mut dependent: FxHashSet<NodeId> = FxHashSet::default();
    dependent.extend(graph.block(header)?.phis.iter().copied());
    dependent.extend(graph.block(body)?.fixed.iter().copied());
    loop {
        let before = dependent.len();
        for (id, node) in graph.nodes() {
            if node.op.is_fixed() || node.op.is_phi() || dependent.contains(&id) {
                continue;
            }
            if node.inputs.iter().any(|i| dependent.contains(i)) {
                dependent.insert(id);
            }
        }
        if dependent.len() == before {
            return Ok(dependent);
        }
    }
}

fn match_induction(graph: &KernelGraph, header: BlockId, body: BlockId) -> CompileResult<Option<Induction>> {
    let block = graph.block(header)?;
    let Terminator::If {
        condition,
        then_block,
        ..
    } = block.terminator
    else {
        return Ok(None);
    };
    let continue_when = then_block == body;
    let Some(body_index) = block.predecessors.iter().position(|&p| p == body) else {
        return Ok(None);
    };
    let entry_index = 1 - body_index.min(1);

    let compare = graph.node(condition)?;
    let Op::Compare(cond) = compare.op else {
        return Ok(None);
    };
    let (left, right) = match (compare.input(0), compare.input(1)) {
        (Some(l), Some(r)) => (l, r),
        _ => return Ok(None),
    };
    let (phi, bound, cond) = if block.phis.contains(&left) {
        (left, right, cond)
    } else if block.phis.contains(&right) {
        (right, left, cond.mirror())
    } else {
        return Ok(None);
    };
    let Some(bound) = graph.node(bound)?.constant() else {
        return Ok(None);
    };

    let phi_node = graph.node(phi)?;
    let Some(kind) = phi_node.kind.scalar().filter(|k| k.is_integer()) else {
        return Ok(None);
    };
    let init = phi_node
        .input(entry_index)
        .and_then(|i| graph.get(i))
        .and_then(|n| n.constant());
    let Some(init) = init else { return Ok(None) };
    let Some(next) = phi_node.input(body_index).and_then(|i| graph.get(i)) else {
        return Ok(None);
    };
    let (step_op, step) = match (&next.op, next.input(0), next.input(1)) {
        (Op::Binary(op @ (BinaryOp::Add | BinaryOp::Sub)), Some(a), Some(b)) if a == phi => {
            match graph.get(b).and_then(|n| n.constant()) {
                Some(step) => (*op, step),
                None => return Ok(None),
            }
        }
        (Op::Binary(BinaryOp::Add), Some(a), Some(b)) if b == phi => {
            match graph.get(a).and_then(|n| n.constant()) {
                Some(step) => (BinaryOp::Add, step),
                None => return Ok(None),
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(Induction {
        phi,
        kind,
        init,
        step_op,
        step,
        cond,
        bound,
        continue_when,
    }))
}

fn trip_count(induction: &Induction, max_trip: u64) -> Option<u64> {
    let mut value = induction.init;
    let mut trips = 0u64;
    loop {
        let holds = fold_compare(induction.cond, induction.kind, value, induction.bound)?;
        if holds != induction.continue_when {
            return Some(trips);
        }
        trips += 1;
        if trips > max_trip {
            return None;
        }
        value = fold_binary(induction.step_op, induction.kind, value, induction.step)?;
    }
}

/// Find the first loop (innermost first) that can be fully unrolled.
pub fn find_counted_loop(
    graph: &KernelGraph,
    max_trip: u64,
    max_nodes: usize,
) -> CompileResult<Option<CountedLoop>> {
    let domtree = DominatorTree::compute(graph);
    let loops = LoopNestInfo::analyze(graph, &domtree);

    for natural_loop in loops.loops_innermost_first() {
        if natural_loop.blocks.len() != 2 || natural_loop.back_edge_sources.len() != 1 {
            continue;
        }
        let header = natural_loop.header;
        let body = natural_loop.back_edge_sources[0];
        let Some(preheader) = natural_loop.preheader else {
            continue;
        };
        let header_block = graph.block(header)?;
        let body_block = graph.block(body)?;
        if !header_block.fixed.is_empty()
            || header_block.predecessors.len() != 2
            || body_block.predecessors != [header]
            || body_block.terminator != Terminator::Jump(header)
        {
            continue;
        }
        let exit = match natural_loop.exit_blocks.as_slice() {
            [only] if *only == header => {
                match header_block.terminator.successors().iter().find(|s| **s != body) {
                    Some(&exit) => exit,
                    None => continue,
                }
            }
            _ => continue,
        };
        let Some(induction) = match_induction(graph, header, body)? else {
            continue;
        };
        let Some(trips) = trip_count(&induction, max_trip) else {
            continue;
        };
        let dependent = loop_dependent(graph, header, body)?;
        let loop_nodes = dependent.len() - header_block.phis.len();
        if loop_nodes as u64 * trips > max_nodes as u64 {
            debug!(header = %header, trips, loop_nodes, "loop too large to unroll");
            continue;
        }
        return Ok(Some(CountedLoop {
            preheader,
            header,
            body,
            exit,
            induction: induction.phi,
            trip_count: trips,
            loop_nodes,
        }));
    }
    Ok(None)
}

struct Cloner<'a> {
    dependent: &'a FxHashSet<NodeId>,
    env: FxHashMap<NodeId, NodeId>,
    memo: FxHashMap<NodeId, NodeId>,
}

impl Cloner<'_> {
    /// Value of `id` in the current iteration.
    fn value(&mut self, graph: &mut KernelGraph, id: NodeId) -> CompileResult<NodeId> {
        if let Some(&v) = self.env.get(&id) {
            return Ok(v);
        }
        if let Some(&v) = self.memo.get(&id) {
            return Ok(v);
        }
        if !self.dependent.contains(&id) {
            return Ok(id);
        }
        let node = graph.node(id)?.clone();
        if node.op.is_fixed() || node.op.is_phi() {
            return Err(CompileError::Internal(format!(
                "loop value {} used before it was unrolled",
                id
            )));
        }
        let mut inputs = Vec::with_capacity(node.inputs.len());
        for &input in &node.inputs {
            inputs.push(self.value(graph, input)?);
        }
        let copy = graph.add_floating(node.op, &inputs, node.kind);
        self.memo.insert(id, copy);
        Ok(copy)
    }
}

/// Replace the loop by `trip_count` copies of its body.
pub fn unroll(graph: &mut KernelGraph, counted: &CountedLoop) -> CompileResult<()> {
    let header = graph.block(counted.header)?.clone();
    let body = graph.block(counted.body)?.clone();
    let entry_index = header
        .predecessors
        .iter()
        .position(|&p| p == counted.preheader)
        .ok_or_else(|| CompileError::Internal("preheader is not a header predecessor".into()))?;
    let body_index = 1 - entry_index;
    let dependent = loop_dependent(graph, counted.header, counted.body)?;

    let mut env: FxHashMap<NodeId, NodeId> = FxHashMap::default();
    for &phi in &header.phis {
        let init = graph.node(phi)?.input(entry_index).ok_or_else(|| {
            CompileError::malformed(format!("phi {} misses its entry input", phi))
        })?;
        env.insert(phi, init);
    }

    let unrolled = graph.add_block();
    for _ in 0..counted.trip_count {
        let mut cloner = Cloner {
            dependent: &dependent,
            env: env.clone(),
            memo: FxHashMap::default(),
        };
        for &fixed in &body.fixed {
            let node = graph.node(fixed)?.clone();
            let mut inputs = Vec::with_capacity(node.inputs.len());
            for &input in &node.inputs {
                inputs.push(cloner.value(graph, input)?);
            }
            let copy = graph.append_fixed(unrolled, node.op, &inputs, node.kind)?;
            cloner.memo.insert(fixed, copy);
        }
        let mut next_env = FxHashMap::default();
        for &phi in &header.phis {
            let back = graph.node(phi)?.input(body_index).ok_or_else(|| {
                CompileError::malformed(format!("phi {} misses its back-edge input", phi))
            })?;
            next_env.insert(phi, cloner.value(graph, back)?);
        }
        env = next_env;
    }

    // values that leave the loop see the final phi values
    let usages = graph.usages();
    let loop_blocks = [counted.header, counted.body];
    let mut exit_values: FxHashMap<NodeId, NodeId> = FxHashMap::default();
    let mut exit_cloner = Cloner {
        dependent: &dependent,
        env,
        memo: FxHashMap::default(),
    };
    let mut ordered: Vec<NodeId> = dependent.iter().copied().collect();
    ordered.sort();
    for id in ordered {
        let external = usages.of(id).iter().any(|usage| match *usage {
            super::Usage::Node(user) => !dependent.contains(&user),
            super::Usage::Terminator(block) => !loop_blocks.contains(&block),
        });
        if external && graph.node(id).map_or(false, |n| !n.op.is_fixed()) {
            exit_values.insert(id, exit_cloner.value(graph, id)?);
        }
    }
    graph.replace_uses(&exit_values);

    // rewire preheader -> unrolled -> exit
    graph
        .block_mut(counted.preheader)?
        .terminator
        .replace_successor(counted.header, unrolled);
    graph.block_mut(unrolled)?.predecessors.push(counted.preheader);
    graph.set_terminator(unrolled, Terminator::Jump(counted.exit))?;
    graph.replace_predecessor(counted.exit, counted.header, unrolled)?;

    graph.set_terminator(counted.header, Terminator::Return(None))?;
    graph.set_terminator(counted.body, Terminator::Return(None))?;
    graph.remove_block(counted.body)?;
    graph.remove_block(counted.header)?;

    let mut leftovers: Vec<NodeId> = dependent
        .iter()
        .copied()
        .filter(|&id| graph.contains(id))
        .collect();
    leftovers.sort();
    for id in leftovers {
        graph.remove_node(id)?;
    }
    Ok(())
}

pub struct LoopUnrollPhase {
    max_loops: usize,
}

impl LoopUnrollPhase {
    pub fn new() -> Self {
        Self { max_loops: 64 }
    }
}

impl Default for LoopUnrollPhase {
    fn default() -> Self {
        Self::new()
    }
}

impl Phase for LoopUnrollPhase {
    fn name(&self) -> &'static str {
        "full-unroll"
    }

    fn run(&mut self, graph: &mut KernelGraph, ctx: &PhaseContext<'_>) -> CompileResult<PhaseResult> {
        let max_trip = ctx.options.full_unroll_max_trip;
        if max_trip == 0 {
            return Ok(PhaseResult::unchanged());
        }
        let mut loops = 0;
        let mut iterations = 0;
        while loops < self.max_loops {
            let Some(counted) = find_counted_loop(graph, max_trip, ctx.options.full_unroll_max_nodes)?
            else {
                break;
            };
            debug!(
                method = %graph.method,
                header = %counted.header,
                trips = counted.trip_count,
                "unrolling loop"
            );
            unroll(graph, &counted)?;
            loops += 1;
            iterations += counted.trip_count as usize;
        }
        if loops == 0 {
            return Ok(PhaseResult::unchanged());
        }
        let mut result = PhaseResult::changed()
            .stat("unrolled_loops", loops)
            .stat("unrolled_iterations", iterations);
        result.blocks_eliminated = loops;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::optimization::tests::run_phase;
    use crate::ir::optimization::CanonicalizerPhase;
    use crate::ir::validation::validate;
    use crate::ir::{GraphBuilder, Kind, MethodId};

    /// `for (i = 0; i < n; i++) a[i] = i * 2; return` followed by a use of `i`.
    fn counted(n: i32) -> KernelGraph {
        //     entry
        //       |
        //     header <--+
        //      /  \     |
        //   exit   body-+
        let mut b = GraphBuilder::kernel(MethodId::new("T", "fill"));
        let a = b.array_parameter("a", Kind::S32);
        let zero = b.int(0);
        let bound = b.int(n);
        let header = b.create_block();
        let body = b.create_block();
        let exit = b.create_block();
        b.jump(header).unwrap();
        b.switch_to_block(header);
        let i = b.phi(header, &[zero], Kind::S32).unwrap();
        let cond = b.compare(Condition::Lt, i, bound);
        b.branch(cond, body, exit).unwrap();
        b.switch_to_block(body);
        let two = b.int(2);
        let doubled = b.mul(i, two);
        b.write(a, i, doubled).unwrap();
        let one = b.int(1);
        let next = b.add(i, one);
        b.add_phi_input(i, next).unwrap();
        b.jump(header).unwrap();
        b.switch_to_block(exit);
        let last = b.int(100);
        b.write(a, last, i).unwrap();
        b.ret(None).unwrap();
        b.finish().unwrap()
    }

    fn writes(graph: &KernelGraph) -> Vec<(NodeId, NodeId)> {
        let mut out = Vec::new();
        for block in graph.blocks() {
            for &f in &block.fixed {
                let node = graph.node(f).unwrap();
                if matches!(node.op, Op::Write { .. }) {
                    out.push((node.inputs[1], node.inputs[2]));
                }
            }
        }
        out
    }

    #[test]
    fn test_trip_count_detected() {
        let graph = counted(4);
        let found = find_counted_loop(&graph, 16, 256).unwrap().unwrap();
        assert_eq!(found.trip_count, 4);
        assert!(find_counted_loop(&graph, 3, 256).unwrap().is_none());
        assert!(find_counted_loop(&graph, 16, 4).unwrap().is_none());
    }

    #[test]
    fn test_full_unroll_replicates_body() {
        let mut graph = counted(3);
        let result = run_phase(&mut LoopUnrollPhase::new(), &mut graph).unwrap();
        assert_eq!(result.stats["unrolled_loops"], 1);
        validate(&graph).unwrap();
        assert_eq!(graph.block_count(), 3);

        run_phase(&mut CanonicalizerPhase::new(), &mut graph).unwrap();
        let stored: Vec<(Option<Constant>, Option<Constant>)> = writes(&graph)
            .into_iter()
            .map(|(i, v)| {
                (
                    graph.node(i).unwrap().constant(),
                    graph.node(v).unwrap().constant(),
                )
            })
            .collect();
        assert_eq!(
            stored,
            vec![
                // exit block was created before the unrolled block
                (Some(Constant::Int(100)), Some(Constant::Int(3))),
                (Some(Constant::Int(0)), Some(Constant::Int(0))),
                (Some(Constant::Int(1)), Some(Constant::Int(2))),
                (Some(Constant::Int(2)), Some(Constant::Int(4))),
            ]
        );
    }

    #[test]
    fn test_zero_trip_loop_removed() {
        let mut graph = counted(0);
        run_phase(&mut LoopUnrollPhase::new(), &mut graph).unwrap();
        validate(&graph).unwrap();
        run_phase(&mut CanonicalizerPhase::new(), &mut graph).unwrap();
        assert_eq!(writes(&graph).len(), 1);
    }
}
