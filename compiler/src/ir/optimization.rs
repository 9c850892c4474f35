//! Kernel Graph Phases
//!
//! Every tier is an ordered list of phases run over one graph. This module
//! holds the phase trait and suite plus the two phases every tier reuses:
//! canonicalization and dead-code elimination.

use super::graph::Terminator;
use super::inlining::CalleeRegistry;
use super::nodes::{fold_binary, fold_compare, fold_convert, fold_unary};
use super::validation::validate;
use super::{BinaryOp, BlockId, Condition, Constant, Kind, KernelGraph, NodeId, Op, UnaryOp};
use crate::codegen::target::TargetDescription;
use crate::config::{CompileOptions, DeviceDescriptor};
use crate::error::CompileResult;
use fxhash::{FxHashMap, FxHashSet};
use indexmap::IndexMap;
use smallvec::SmallVec;
use tracing::{debug, trace};

/// Everything a phase may consult besides the graph itself.
pub struct PhaseContext<'a> {
    pub options: &'a CompileOptions,
    pub device: &'a DeviceDescriptor,
    pub target: &'a dyn TargetDescription,
    pub callees: &'a CalleeRegistry,
}

/// A graph-to-graph transformation
pub trait Phase {
    fn name(&self) -> &'static str;

    fn run(&mut self, graph: &mut KernelGraph, ctx: &PhaseContext<'_>) -> CompileResult<PhaseResult>;
}

/// Result of a phase
#[derive(Debug, Clone, Default)]
pub struct PhaseResult {
    /// Whether the graph was modified
    pub modified: bool,

    pub nodes_eliminated: usize,

    pub blocks_eliminated: usize,

    /// Other statistics
    pub stats: IndexMap<String, usize>,
}

impl PhaseResult {
    pub fn unchanged() -> Self {
        Self::default()
    }

    pub fn changed() -> Self {
        Self {
            modified: true,
            ..Self::default()
        }
    }

    pub fn combine(mut self, other: PhaseResult) -> Self {
        self.modified |= other.modified;
        self.nodes_eliminated += other.nodes_eliminated;
        self.blocks_eliminated += other.blocks_eliminated;

        for (key, value) in other.stats {
            *self.stats.entry(key).or_insert(0) += value;
        }

        self
    }

    pub fn stat(mut self, key: &str, value: usize) -> Self {
        if value > 0 {
            *self.stats.entry(key.to_string()).or_insert(0) += value;
        }
        self
    }
}

/// Ordered list of phases forming one tier.
pub struct PhaseSuite {
    name: &'static str,
    phases: Vec<Box<dyn Phase>>,
}

impl PhaseSuite {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            phases: Vec::new(),
        }
    }

    pub fn add_phase<P: Phase + 'static>(&mut self, phase: P) {
        self.phases.push(Box::new(phase));
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn phase_names(&self) -> Vec<&'static str> {
        self.phases.iter().map(|p| p.name()).collect()
    }

    /// Run every phase once, in order.
    pub fn run(&mut self, graph: &mut KernelGraph, ctx: &PhaseContext<'_>) -> CompileResult<PhaseResult> {
        let mut total = PhaseResult::unchanged();
        for phase in &mut self.phases {
            let result = phase.run(graph, ctx)?;
            debug!(
                tier = self.name,
                phase = phase.name(),
                modified = result.modified,
                nodes_eliminated = result.nodes_eliminated,
                blocks_eliminated = result.blocks_eliminated,
                stats = ?result.stats,
                "phase finished"
            );
            if cfg!(debug_assertions) {
                validate(graph)?;
            }
            total = total.combine(result);
        }
        trace!(tier = self.name, "\n{}", super::dump::dump_graph(graph));
        Ok(total)
    }
}

// === Canonicalization ===

enum Simplified {
    Node(NodeId),
    Constant(Constant, Kind),
    /// Operands swapped in place
    Swapped,
}

/// Constant folding, algebraic identities, value numbering and
/// constant-branch folding, repeated until nothing changes.
pub struct CanonicalizerPhase {
    max_rounds: usize,
}

impl CanonicalizerPhase {
    pub fn new() -> Self {
        Self { max_rounds: 32 }
    }

    fn simplify(graph: &KernelGraph, id: NodeId) -> CompileResult<Option<Simplified>> {
        let node = graph.node(id)?;
        let constant_of = |i: usize| -> Option<Constant> {
            node.input(i).and_then(|n| graph.get(n)).and_then(|n| n.constant())
        };
        let input_kind = |i: usize| node.input(i).and_then(|n| graph.get(n)).map(|n| n.kind);

        let simplified = match &node.op {
            Op::Binary(op) => {
                let Some(scalar) = node.kind.scalar() else {
                    return Ok(None);
                };
                let (left, right) = match (node.input(0), node.input(1)) {
                    (Some(l), Some(r)) => (l, r),
                    _ => return Ok(None),
                };
                match (constant_of(0), constant_of(1)) {
                    (Some(a), Some(b)) => fold_binary(*op, scalar, a, b)
                        .map(|c| Simplified::Constant(c.normalize(scalar), node.kind)),
                    (Some(_), None) if op.is_commutative() => Some(Simplified::Swapped),
                    (_, Some(c)) if scalar.is_integer() => {
                        let all_ones = super::nodes::wrap_int(-1, scalar);
                        match op {
                            BinaryOp::Add
                            | BinaryOp::Sub
                            | BinaryOp::Or
                            | BinaryOp::Xor
                            | BinaryOp::Shl
                            | BinaryOp::Shr
                            | BinaryOp::UShr
                                if c.is_int(0) =>
                            {
                                Some(Simplified::Node(left))
                            }
                            BinaryOp::Mul | BinaryOp::Div if c.is_int(1) => Some(Simplified::Node(left)),
                            BinaryOp::Mul | BinaryOp::And if c.is_int(0) => {
                                Some(Simplified::Constant(Constant::Int(0), node.kind))
                            }
                            BinaryOp::And if c.is_int(all_ones) => Some(Simplified::Node(left)),
                            _ => None,
                        }
                    }
                    _ if left == right && scalar.is_integer() => match op {
                        BinaryOp::Sub | BinaryOp::Xor => {
                            Some(Simplified::Constant(Constant::Int(0), node.kind))
                        }
                        BinaryOp::And | BinaryOp::Or | BinaryOp::Min | BinaryOp::Max => {
                            Some(Simplified::Node(left))
                        }
                        _ => None,
                    },
                    _ => None,
                }
            }
            Op::Unary(op) => {
                let Some(scalar) = node.kind.scalar() else {
                    return Ok(None);
                };
                if let Some(c) = constant_of(0) {
                    fold_unary(*op, scalar, c).map(|c| Simplified::Constant(c.normalize(scalar), node.kind))
                } else {
                    // -(-x) and ~(~x)
                    let inner = node.input(0).and_then(|n| graph.get(n));
                    match inner {
                        Some(inner)
                            if matches!(op, UnaryOp::Neg | UnaryOp::Not)
                                && inner.op == Op::Unary(*op)
                                && !(scalar.is_float() && *op == UnaryOp::Not) =>
                        {
                            inner.input(0).map(Simplified::Node)
                        }
                        _ => None,
                    }
                }
            }
            Op::Compare(cond) => {
                let Some(operand) = input_kind(0).and_then(Kind::scalar) else {
                    return Ok(None);
                };
                match (constant_of(0), constant_of(1)) {
                    (Some(a), Some(b)) => fold_compare(*cond, operand, a, b)
                        .map(|v| Simplified::Constant(Constant::Bool(v), Kind::PRED)),
                    _ if node.input(0) == node.input(1) && !operand.is_float() => {
                        let holds = matches!(cond, Condition::Eq | Condition::Le | Condition::Ge);
                        Some(Simplified::Constant(Constant::Bool(holds), Kind::PRED))
                    }
                    _ => None,
                }
            }
            Op::Conditional => match (constant_of(0).and_then(Constant::as_bool), node.input(1), node.input(2)) {
                (Some(true), Some(t), _) => Some(Simplified::Node(t)),
                (Some(false), _, Some(f)) => Some(Simplified::Node(f)),
                (None, Some(t), Some(f)) if t == f => Some(Simplified::Node(t)),
                _ => None,
            },
            Op::Convert => {
                let (Some(value), Some(from)) = (node.input(0), input_kind(0)) else {
                    return Ok(None);
                };
                if from == node.kind {
                    Some(Simplified::Node(value))
                } else {
                    match (from.scalar(), node.kind.scalar(), constant_of(0)) {
                        (Some(f), Some(t), Some(c)) => {
                            fold_convert(f, t, c).map(|c| Simplified::Constant(c, node.kind))
                        }
                        _ => None,
                    }
                }
            }
            Op::VectorElement(lane) => {
                // lane of a freshly assembled vector
                let vector = node.input(0).and_then(|v| graph.get(v));
                match vector {
                    Some(v)
                        if v.op == Op::VectorValue
                            && v.inputs.len() == v.kind.lanes() as usize
                            && v.kind.is_vector() =>
                    {
                        v.input(*lane as usize)
                            .filter(|&l| graph.get(l).map_or(false, |n| !n.kind.is_vector()))
                            .map(Simplified::Node)
                    }
                    _ => None,
                }
            }
            _ => None,
        };
        Ok(simplified)
    }

    fn fold_nodes(graph: &mut KernelGraph) -> CompileResult<usize> {
        let mut folded = 0;
        let mut constants: FxHashMap<(Constant, Kind), NodeId> = FxHashMap::default();
        for id in graph.node_ids() {
            if !graph.contains(id) || graph.op(id)?.is_fixed() {
                continue;
            }
            let replacement = match Self::simplify(graph, id)? {
                None => continue,
                Some(Simplified::Swapped) => {
                    graph.node_mut(id)?.inputs.swap(0, 1);
                    folded += 1;
                    continue;
                }
                Some(Simplified::Node(other)) => other,
                Some(Simplified::Constant(value, kind)) => *constants
                    .entry((value, kind))
                    .or_insert_with(|| graph.add_floating(Op::Constant(value), &[], kind)),
            };
            if replacement == id {
                continue;
            }
            graph.replace_all_uses(id, replacement);
            graph.remove_node(id)?;
            folded += 1;
        }
        Ok(folded)
    }

    /// Merge structurally equal pure nodes.
    fn value_number(graph: &mut KernelGraph) -> CompileResult<usize> {
        let mut seen: FxHashMap<(Op, SmallVec<[NodeId; 4]>, Kind), NodeId> = FxHashMap::default();
        let mut duplicates: FxHashMap<NodeId, NodeId> = FxHashMap::default();
        for (id, node) in graph.nodes() {
            if !node.op.is_pure() {
                continue;
            }
            let key = (node.op.clone(), node.inputs.clone(), node.kind);
            match seen.get(&key) {
                Some(&first) => {
                    duplicates.insert(id, first);
                }
                None => {
                    seen.insert(key, id);
                }
            }
        }
        graph.replace_uses(&duplicates);
        for &duplicate in duplicates.keys() {
            graph.remove_node(duplicate)?;
        }
        Ok(duplicates.len())
    }

    /// Fold branches on constants and drop blocks that became unreachable.
    fn simplify_control(graph: &mut KernelGraph) -> CompileResult<(usize, usize)> {
        let mut folded = 0;
        for block_id in graph.block_ids() {
            let terminator = graph.block(block_id)?.terminator.clone();
            let taken = match &terminator {
                Terminator::If {
                    condition,
                    then_block,
                    else_block,
                } => {
                    if then_block == else_block {
                        Some(*then_block)
                    } else {
                        graph
                            .node(*condition)?
                            .constant()
                            .and_then(Constant::as_bool)
                            .map(|c| if c { *then_block } else { *else_block })
                    }
                }
                Terminator::Switch {
                    value,
                    keys,
                    targets,
                    default,
                } => graph.node(*value)?.constant().and_then(Constant::as_i64).map(|v| {
                    keys.iter()
                        .position(|&k| k == v)
                        .and_then(|i| targets.get(i).copied())
                        .unwrap_or(*default)
                }),
                _ => None,
            };
            let Some(taken) = taken else { continue };
            for succ in terminator.successors() {
                if succ != taken {
                    graph.remove_edge(block_id, succ)?;
                }
            }
            graph.set_terminator(block_id, Terminator::Jump(taken))?;
            folded += 1;
        }

        let reachable: FxHashSet<BlockId> = graph.reachable_blocks().into_iter().collect();
        let mut removed = 0;
        for block_id in graph.block_ids() {
            if !reachable.contains(&block_id) {
                graph.remove_block(block_id)?;
                removed += 1;
            }
        }
        if removed > 0 {
            purge_dangling(graph)?;
        }
        Ok((folded, removed))
    }

    /// Phis whose inputs are all one value (or the phi itself).
    fn remove_trivial_phis(graph: &mut KernelGraph) -> CompileResult<usize> {
        let mut removed = 0;
        for block_id in graph.block_ids() {
            let phis = graph.block(block_id)?.phis.clone();
            for phi in phis {
                let node = graph.node(phi)?;
                if node.op != Op::Phi {
                    continue;
                }
                let mut distinct = node.inputs.iter().copied().filter(|&i| i != phi);
                let Some(first) = distinct.next() else {
                    continue;
                };
                if distinct.all(|i| i == first) {
                    graph.replace_all_uses(phi, first);
                    graph.remove_node(phi)?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

impl Default for CanonicalizerPhase {
    fn default() -> Self {
        Self::new()
    }
}

impl Phase for CanonicalizerPhase {
    fn name(&self) -> &'static str {
        "canonicalize"
    }

    fn run(&mut self, graph: &mut KernelGraph, _ctx: &PhaseContext<'_>) -> CompileResult<PhaseResult> {
        let mut result = PhaseResult::unchanged();
        for _ in 0..self.max_rounds {
            let folded = Self::fold_nodes(graph)?;
            let numbered = Self::value_number(graph)?;
            let (branches, blocks) = Self::simplify_control(graph)?;
            let phis = Self::remove_trivial_phis(graph)?;

            let round = PhaseResult {
                modified: folded + numbered + branches + blocks + phis > 0,
                nodes_eliminated: numbered + phis,
                blocks_eliminated: blocks,
                stats: IndexMap::new(),
            }
            .stat("folded", folded)
            .stat("value_numbered", numbered)
            .stat("branches_folded", branches)
            .stat("trivial_phis", phis);
            let modified = round.modified;
            result = result.combine(round);
            if !modified {
                break;
            }
        }
        Ok(result)
    }
}

/// Remove floating nodes left pointing at removed nodes, transitively.
fn purge_dangling(graph: &mut KernelGraph) -> CompileResult<usize> {
    let mut purged = 0;
    loop {
        let dangling: Vec<NodeId> = graph
            .nodes()
            .filter(|(_, node)| !node.op.is_fixed() && !node.op.is_phi())
            .filter(|(_, node)| node.inputs.iter().any(|&i| !graph.contains(i)))
            .map(|(id, _)| id)
            .collect();
        if dangling.is_empty() {
            return Ok(purged);
        }
        for id in dangling {
            graph.remove_node(id)?;
            purged += 1;
        }
    }
}

// === Dead code elimination ===

/// Removes nodes not reachable from side effects or terminators.
pub struct DeadCodeEliminationPhase;

impl DeadCodeEliminationPhase {
    pub fn new() -> Self {
        Self
    }

    /// Fixed nodes that only produce a value may go when unused.
    fn is_removable_fixed(op: &Op) -> bool {
        matches!(op, Op::Read { .. } | Op::NewArray { .. })
    }

    pub fn live_nodes(graph: &KernelGraph) -> FxHashSet<NodeId> {
        let mut live: FxHashSet<NodeId> = FxHashSet::default();
        let mut worklist: Vec<NodeId> = Vec::new();

        for block in graph.blocks() {
            for &fixed in &block.fixed {
                let removable = graph
                    .get(fixed)
                    .map_or(true, |n| Self::is_removable_fixed(&n.op));
                if !removable {
                    worklist.push(fixed);
                }
            }
            worklist.extend(block.terminator.inputs());
        }

        while let Some(id) = worklist.pop() {
            if !live.insert(id) {
                continue;
            }
            if let Some(node) = graph.get(id) {
                worklist.extend(node.inputs.iter().copied().filter(|i| !live.contains(i)));
            }
        }
        live
    }
}

impl Default for DeadCodeEliminationPhase {
    fn default() -> Self {
        Self::new()
    }
}

impl Phase for DeadCodeEliminationPhase {
    fn name(&self) -> &'static str {
        "dead-code-elimination"
    }

    fn run(&mut self, graph: &mut KernelGraph, _ctx: &PhaseContext<'_>) -> CompileResult<PhaseResult> {
        let live = Self::live_nodes(graph);
        let dead: Vec<NodeId> = graph
            .node_ids()
            .into_iter()
            .filter(|id| !live.contains(id))
            .collect();
        if dead.is_empty() {
            return Ok(PhaseResult::unchanged());
        }
        for &id in &dead {
            graph.remove_node(id)?;
        }
        let mut result = PhaseResult::changed();
        result.nodes_eliminated = dead.len();
        Ok(result)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codegen::target::{create_target, TargetKind};
    use crate::ir::{GraphBuilder, MethodId};

    /// Run one phase with default options on a generic GPU.
    pub(crate) fn run_phase<P: Phase>(phase: &mut P, graph: &mut KernelGraph) -> CompileResult<PhaseResult> {
        run_phase_with(
            phase,
            graph,
            &CompileOptions::default(),
            &DeviceDescriptor::gpu("gpu0", 1024),
        )
    }

    pub(crate) fn run_phase_with<P: Phase>(
        phase: &mut P,
        graph: &mut KernelGraph,
        options: &CompileOptions,
        device: &DeviceDescriptor,
    ) -> CompileResult<PhaseResult> {
        let target = create_target(TargetKind::OpenCl);
        let callees = CalleeRegistry::new();
        let ctx = PhaseContext {
            options,
            device,
            target: target.as_ref(),
            callees: &callees,
        };
        phase.run(graph, &ctx)
    }

    #[test]
    fn test_constant_folding_and_identities() {
        let mut b = GraphBuilder::callee(MethodId::new("T", "f"), Kind::S32);
        let x = b.scalar_parameter("x", Kind::S32);
        let two = b.int(2);
        let three = b.int(3);
        let five = b.add(two, three);
        let zero = b.int(0);
        let plus_zero = b.add(x, zero);
        let result = b.mul(plus_zero, five);
        b.ret(Some(result)).unwrap();
        let mut graph = b.finish().unwrap();

        run_phase(&mut CanonicalizerPhase::new(), &mut graph).unwrap();

        let Terminator::Return(Some(ret)) = graph.block(graph.entry()).unwrap().terminator else {
            panic!("expected return");
        };
        let node = graph.node(ret).unwrap();
        assert_eq!(node.op, Op::Binary(BinaryOp::Mul));
        assert_eq!(node.inputs[0], x);
        assert_eq!(graph.node(node.inputs[1]).unwrap().constant(), Some(Constant::Int(5)));
    }

    #[test]
    fn test_constant_branch_removes_dead_block() {
        //   entry --if true--> then
        //     \
        //      +------------> dead
        let mut b = GraphBuilder::kernel(MethodId::new("T", "k"));
        let a = b.array_parameter("a", Kind::S32);
        let cond = b.boolean(true);
        let then_block = b.create_block();
        let dead = b.create_block();
        b.branch(cond, then_block, dead).unwrap();
        b.switch_to_block(then_block);
        b.ret(None).unwrap();
        b.switch_to_block(dead);
        let i = b.int(0);
        let v = b.read(a, i, Kind::S32).unwrap();
        let w = b.add(v, i);
        b.write(a, i, w).unwrap();
        b.ret(None).unwrap();
        let mut graph = b.finish().unwrap();

        let result = run_phase(&mut CanonicalizerPhase::new(), &mut graph).unwrap();
        assert_eq!(result.blocks_eliminated, 1);
        assert!(!graph.has_block(dead));
        assert_eq!(
            graph.block(graph.entry()).unwrap().terminator,
            Terminator::Jump(then_block)
        );
        validate(&graph).unwrap();
    }

    #[test]
    fn test_switch_on_constant_folds_to_case() {
        let mut b = GraphBuilder::kernel(MethodId::new("T", "k"));
        let v = b.int(7);
        let case_a = b.create_block();
        let case_b = b.create_block();
        let default = b.create_block();
        b.switch(v, &[3, 7], &[case_a, case_b], default).unwrap();
        for block in [case_a, case_b, default] {
            b.switch_to_block(block);
            b.ret(None).unwrap();
        }
        let mut graph = b.finish().unwrap();
        run_phase(&mut CanonicalizerPhase::new(), &mut graph).unwrap();
        assert_eq!(graph.block_ids(), vec![BlockId::entry(), case_b]);
    }

    #[test]
    fn test_value_numbering_merges_duplicates() {
        let mut b = GraphBuilder::callee(MethodId::new("T", "f"), Kind::F32);
        let x = b.scalar_parameter("x", Kind::F32);
        let y = b.scalar_parameter("y", Kind::F32);
        let p1 = b.mul(x, y);
        let p2 = b.mul(x, y);
        let sum = b.binary(BinaryOp::Add, p1, p2);
        b.ret(Some(sum)).unwrap();
        let mut graph = b.finish().unwrap();
        run_phase(&mut CanonicalizerPhase::new(), &mut graph).unwrap();
        let node = graph.node(sum).unwrap();
        assert_eq!(node.inputs[0], node.inputs[1]);
    }

    #[test]
    fn test_dce_keeps_side_effects() {
        let mut b = GraphBuilder::kernel(MethodId::new("T", "k"));
        let a = b.array_parameter("a", Kind::S32);
        let i = b.int(1);
        let unused_read = b.read(a, i, Kind::S32).unwrap();
        let dead = b.add(unused_read, i);
        let stored = b.int(42);
        let write = b.write(a, i, stored).unwrap();
        b.ret(None).unwrap();
        let mut graph = b.finish().unwrap();

        let result = run_phase(&mut DeadCodeEliminationPhase::new(), &mut graph).unwrap();
        assert_eq!(result.nodes_eliminated, 2);
        assert!(!graph.contains(dead));
        assert!(!graph.contains(unused_read));
        assert!(graph.contains(write));
        assert!(graph.contains(stored));
    }
}
