//! Kernel graph: node arena plus control-flow graph.

use super::{AtomicOp, BlockId, Kind, MethodId, Node, NodeId, Op, Schedule};
use crate::error::{CompileError, CompileResult};
use fxhash::FxHashMap;
use indexmap::IndexMap;
use smallvec::{smallvec, SmallVec};

/// Declared type of a formal parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamType {
    Scalar(Kind),
    /// Reference to an array; `constant` arrays are read-only on the device.
    Array { element: Kind, constant: bool },
}

impl ParamType {
    pub fn is_array(&self) -> bool {
        matches!(self, ParamType::Array { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterDecl {
    pub name: String,
    pub ty: ParamType,
    /// Array every thread folds its partial result into with this operator.
    pub reduction: Option<AtomicOp>,
}

/// Declared local-variable slot of a callee unit; parameter `i` arrives in
/// slot `i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSlot {
    pub name: String,
    pub kind: Kind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Jump(BlockId),
    If {
        condition: NodeId,
        then_block: BlockId,
        else_block: BlockId,
    },
    /// Multi-way branch; `keys[i]` selects `targets[i]`.
    Switch {
        value: NodeId,
        keys: Vec<i64>,
        targets: Vec<BlockId>,
        default: BlockId,
    },
    Return(Option<NodeId>),
    /// Leave the kernel without completing; kernels cannot deoptimize.
    Deopt(String),
}

impl Terminator {
    /// Distinct successors in branch order.
    pub fn successors(&self) -> SmallVec<[BlockId; 2]> {
        match self {
            Terminator::Jump(target) => smallvec![*target],
            Terminator::If {
                then_block,
                else_block,
                ..
            } => {
                if then_block == else_block {
                    smallvec![*then_block]
                } else {
                    smallvec![*then_block, *else_block]
                }
            }
            Terminator::Switch {
                targets, default, ..
            } => {
                let mut out: SmallVec<[BlockId; 2]> = SmallVec::new();
                for target in targets.iter().chain(std::iter::once(default)) {
                    if !out.contains(target) {
                        out.push(*target);
                    }
                }
                out
            }
            Terminator::Return(_) | Terminator::Deopt(_) => SmallVec::new(),
        }
    }

    pub fn inputs(&self) -> SmallVec<[NodeId; 1]> {
        match self {
            Terminator::If { condition, .. } => smallvec![*condition],
            Terminator::Switch { value, .. } => smallvec![*value],
            Terminator::Return(Some(value)) => smallvec![*value],
            _ => SmallVec::new(),
        }
    }

    fn inputs_mut(&mut self) -> SmallVec<[&mut NodeId; 1]> {
        match self {
            Terminator::If { condition, .. } => smallvec![condition],
            Terminator::Switch { value, .. } => smallvec![value],
            Terminator::Return(Some(value)) => smallvec![value],
            _ => SmallVec::new(),
        }
    }

    pub fn replace_successor(&mut self, old: BlockId, new: BlockId) {
        let swap = |b: &mut BlockId| {
            if *b == old {
                *b = new;
            }
        };
        match self {
            Terminator::Jump(target) => swap(target),
            Terminator::If {
                then_block,
                else_block,
                ..
            } => {
                swap(then_block);
                swap(else_block);
            }
            Terminator::Switch {
                targets, default, ..
            } => {
                targets.iter_mut().for_each(swap);
                swap(default);
            }
            Terminator::Return(_) | Terminator::Deopt(_) => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub id: BlockId,
    pub phis: Vec<NodeId>,
    /// Fixed nodes in execution order
    pub fixed: Vec<NodeId>,
    pub terminator: Terminator,
    /// Incoming edges; phi input `i` flows along `predecessors[i]`.
    pub predecessors: Vec<BlockId>,
}

/// A consumer of a node value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Usage {
    Node(NodeId),
    Terminator(BlockId),
}

/// Reverse edges of a graph at one point in time.
#[derive(Debug, Default)]
pub struct Usages {
    map: FxHashMap<NodeId, Vec<Usage>>,
}

impl Usages {
    pub fn of(&self, id: NodeId) -> &[Usage] {
        self.map.get(&id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn is_unused(&self, id: NodeId) -> bool {
        self.of(id).is_empty()
    }

    /// Node consumers only, in first-use order without duplicates.
    pub fn nodes(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        for usage in self.of(id) {
            if let Usage::Node(user) = usage {
                if !out.contains(user) {
                    out.push(*user);
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// The sketch: method identity, signature, node arena and CFG.
#[derive(Debug, Clone)]
pub struct KernelGraph {
    pub method: MethodId,
    pub is_kernel: bool,
    pub parameters: Vec<ParameterDecl>,
    /// Declared locals of a callee unit
    pub locals: Vec<LocalSlot>,
    pub return_kind: Kind,
    slots: Vec<Slot>,
    free: Vec<u32>,
    blocks: IndexMap<BlockId, Block>,
    next_block: u32,
    schedule: Option<Schedule>,
}

impl KernelGraph {
    pub fn new(method: MethodId, is_kernel: bool) -> Self {
        let mut graph = Self {
            method,
            is_kernel,
            parameters: Vec::new(),
            locals: Vec::new(),
            return_kind: Kind::Void,
            slots: Vec::new(),
            free: Vec::new(),
            blocks: IndexMap::new(),
            next_block: 0,
            schedule: None,
        };
        graph.add_block();
        graph
    }

    pub fn entry(&self) -> BlockId {
        BlockId::entry()
    }

    // === Nodes ===

    fn alloc(&mut self, node: Node) -> NodeId {
        self.schedule = None;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            NodeId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                node: Some(node),
            });
            NodeId {
                index,
                generation: 0,
            }
        }
    }

    /// Add a floating node.
    pub fn add_floating(&mut self, op: Op, inputs: &[NodeId], kind: Kind) -> NodeId {
        self.alloc(Node::new(op, inputs, kind))
    }

    /// Append a fixed node at the end of `block`.
    pub fn append_fixed(
        &mut self,
        block: BlockId,
        op: Op,
        inputs: &[NodeId],
        kind: Kind,
    ) -> CompileResult<NodeId> {
        self.block(block)?;
        let mut node = Node::new(op, inputs, kind);
        node.block = Some(block);
        let id = self.alloc(node);
        self.block_mut(block)?.fixed.push(id);
        Ok(id)
    }

    /// Insert a fixed node into `block` right before the fixed node `before`.
    pub fn insert_fixed_before(
        &mut self,
        block: BlockId,
        before: NodeId,
        op: Op,
        inputs: &[NodeId],
        kind: Kind,
    ) -> CompileResult<NodeId> {
        let position = self
            .block(block)?
            .fixed
            .iter()
            .position(|&n| n == before)
            .ok_or_else(|| {
                CompileError::Internal(format!("{} is not a fixed node of {}", before, block))
            })?;
        let mut node = Node::new(op, inputs, kind);
        node.block = Some(block);
        let id = self.alloc(node);
        self.block_mut(block)?.fixed.insert(position, id);
        Ok(id)
    }

    /// Add a phi (or memory phi) to a merge block.
    pub fn add_phi(
        &mut self,
        block: BlockId,
        op: Op,
        inputs: &[NodeId],
        kind: Kind,
    ) -> CompileResult<NodeId> {
        if !op.is_phi() {
            return Err(CompileError::Internal(format!(
                "{} is not a phi operator",
                op.describe()
            )));
        }
        self.block(block)?;
        let mut node = Node::new(op, inputs, kind);
        node.block = Some(block);
        let id = self.alloc(node);
        self.block_mut(block)?.phis.push(id);
        Ok(id)
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    pub fn node(&self, id: NodeId) -> CompileResult<&Node> {
        self.get(id)
            .ok_or_else(|| CompileError::malformed(format!("dangling node handle {}", id)))
    }

    pub fn node_mut(&mut self, id: NodeId) -> CompileResult<&mut Node> {
        self.schedule = None;
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
            .ok_or_else(|| CompileError::malformed(format!("dangling node handle {}", id)))
    }

    pub fn kind(&self, id: NodeId) -> CompileResult<Kind> {
        Ok(self.node(id)?.kind)
    }

    pub fn op(&self, id: NodeId) -> CompileResult<&Op> {
        Ok(&self.node(id)?.op)
    }

    /// Live nodes in arena order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.node.as_ref().map(|node| {
                (
                    NodeId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    node,
                )
            })
        })
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes().map(|(id, _)| id).collect()
    }

    pub fn node_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.node.is_some()).count()
    }

    /// Remove a node; fixed nodes and phis are detached from their block.
    pub fn remove_node(&mut self, id: NodeId) -> CompileResult<Node> {
        let owner = self.node(id)?.block;
        if let Some(block) = owner.and_then(|b| self.blocks.get_mut(&b)) {
            block.fixed.retain(|&n| n != id);
            block.phis.retain(|&n| n != id);
        }
        self.schedule = None;
        let slot = &mut self.slots[id.index as usize];
        let node = slot.node.take().ok_or_else(|| {
            CompileError::Internal(format!("node {} removed twice", id))
        })?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Ok(node)
    }

    /// Take a fixed node out of its block's order without deleting it.
    pub fn detach_fixed(&mut self, id: NodeId) -> CompileResult<()> {
        let block = self
            .node(id)?
            .block
            .ok_or_else(|| CompileError::Internal(format!("{} has no block", id)))?;
        self.block_mut(block)?.fixed.retain(|&n| n != id);
        Ok(())
    }

    /// Rewrite every use of a key of `map` to its value, following chains.
    /// Returns the number of rewritten edges.
    pub fn replace_uses(&mut self, map: &FxHashMap<NodeId, NodeId>) -> usize {
        if map.is_empty() {
            return 0;
        }
        let resolve = |mut id: NodeId| {
            let mut hops = 0;
            while let Some(&next) = map.get(&id) {
                if next == id || hops > map.len() {
                    break;
                }
                id = next;
                hops += 1;
            }
            id
        };
        let mut rewritten = 0;
        for slot in &mut self.slots {
            if let Some(node) = slot.node.as_mut() {
                for input in node.inputs.iter_mut() {
                    let target = resolve(*input);
                    if target != *input {
                        *input = target;
                        rewritten += 1;
                    }
                }
            }
        }
        for block in self.blocks.values_mut() {
            for input in block.terminator.inputs_mut() {
                let target = resolve(*input);
                if target != *input {
                    *input = target;
                    rewritten += 1;
                }
            }
        }
        if rewritten > 0 {
            self.schedule = None;
        }
        rewritten
    }

    pub fn replace_all_uses(&mut self, old: NodeId, new: NodeId) -> usize {
        let mut map = FxHashMap::default();
        map.insert(old, new);
        self.replace_uses(&map)
    }

    pub fn usages(&self) -> Usages {
        let mut usages = Usages::default();
        for (id, node) in self.nodes() {
            for &input in &node.inputs {
                usages.map.entry(input).or_default().push(Usage::Node(id));
            }
        }
        for block in self.blocks.values() {
            for input in block.terminator.inputs() {
                usages
                    .map
                    .entry(input)
                    .or_default()
                    .push(Usage::Terminator(block.id));
            }
        }
        usages
    }

    // === Blocks ===

    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId(self.next_block);
        self.next_block += 1;
        self.blocks.insert(
            id,
            Block {
                id,
                phis: Vec::new(),
                fixed: Vec::new(),
                terminator: Terminator::Return(None),
                predecessors: Vec::new(),
            },
        );
        self.schedule = None;
        id
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }

    pub fn block_ids(&self) -> Vec<BlockId> {
        self.blocks.keys().copied().collect()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn has_block(&self, id: BlockId) -> bool {
        self.blocks.contains_key(&id)
    }

    pub fn block(&self, id: BlockId) -> CompileResult<&Block> {
        self.blocks
            .get(&id)
            .ok_or_else(|| CompileError::malformed(format!("unknown block {}", id)))
    }

    pub fn block_mut(&mut self, id: BlockId) -> CompileResult<&mut Block> {
        self.schedule = None;
        self.blocks
            .get_mut(&id)
            .ok_or_else(|| CompileError::malformed(format!("unknown block {}", id)))
    }

    pub fn successors(&self, id: BlockId) -> CompileResult<SmallVec<[BlockId; 2]>> {
        Ok(self.block(id)?.terminator.successors())
    }

    /// Set the terminator of a block that has none yet and register it as a
    /// predecessor of each successor.
    pub fn terminate(&mut self, block: BlockId, terminator: Terminator) -> CompileResult<()> {
        let successors = terminator.successors();
        for succ in &successors {
            self.block(*succ)?;
        }
        self.block_mut(block)?.terminator = terminator;
        for succ in successors {
            self.block_mut(succ)?.predecessors.push(block);
        }
        Ok(())
    }

    /// Replace a block's terminator without touching edge bookkeeping.
    pub fn set_terminator(&mut self, block: BlockId, terminator: Terminator) -> CompileResult<()> {
        self.block_mut(block)?.terminator = terminator;
        Ok(())
    }

    /// Drop the edge `from -> to` from `to`'s predecessors together with the
    /// matching phi inputs.
    pub fn remove_edge(&mut self, from: BlockId, to: BlockId) -> CompileResult<()> {
        let (index, phis) = {
            let target = self.block(to)?;
            let index = target
                .predecessors
                .iter()
                .position(|&p| p == from)
                .ok_or_else(|| {
                    CompileError::Internal(format!("{} is not a predecessor of {}", from, to))
                })?;
            (index, target.phis.clone())
        };
        self.block_mut(to)?.predecessors.remove(index);
        for phi in phis {
            let node = self.node_mut(phi)?;
            if index < node.inputs.len() {
                node.inputs.remove(index);
            }
        }
        Ok(())
    }

    /// Rename predecessor `old` of `block` to `new`, keeping its phi position.
    pub fn replace_predecessor(
        &mut self,
        block: BlockId,
        old: BlockId,
        new: BlockId,
    ) -> CompileResult<()> {
        let target = self.block_mut(block)?;
        match target.predecessors.iter_mut().find(|p| **p == old) {
            Some(slot) => {
                *slot = new;
                Ok(())
            }
            None => Err(CompileError::Internal(format!(
                "{} is not a predecessor of {}",
                old, block
            ))),
        }
    }

    /// Remove a block with its phis and fixed nodes, and its outgoing edges.
    pub fn remove_block(&mut self, id: BlockId) -> CompileResult<()> {
        if id == self.entry() {
            return Err(CompileError::Internal("entry block cannot be removed".into()));
        }
        let block = self.block(id)?.clone();
        for succ in block.terminator.successors() {
            if self.has_block(succ) && succ != id {
                self.remove_edge(id, succ)?;
            }
        }
        for node in block.phis.iter().chain(block.fixed.iter()) {
            if self.contains(*node) {
                self.remove_node(*node)?;
            }
        }
        self.blocks.shift_remove(&id);
        self.schedule = None;
        Ok(())
    }

    /// Blocks reachable from the entry, in depth-first preorder.
    pub fn reachable_blocks(&self) -> Vec<BlockId> {
        let mut seen = indexmap::IndexSet::new();
        let mut stack = vec![self.entry()];
        while let Some(block) = stack.pop() {
            if !seen.insert(block) {
                continue;
            }
            if let Some(b) = self.blocks.get(&block) {
                for succ in b.terminator.successors().into_iter().rev() {
                    if !seen.contains(&succ) {
                        stack.push(succ);
                    }
                }
            }
        }
        seen.into_iter().collect()
    }

    // === Schedule ===

    pub fn schedule(&self) -> Option<&Schedule> {
        self.schedule.as_ref()
    }

    pub fn set_schedule(&mut self, schedule: Schedule) {
        self.schedule = Some(schedule);
    }

    pub fn clear_schedule(&mut self) {
        self.schedule = None;
    }

    pub fn parameter_kind(&self, index: u32) -> Option<&ParamType> {
        self.parameters.get(index as usize).map(|p| &p.ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinaryOp, Constant};

    fn graph() -> KernelGraph {
        KernelGraph::new(MethodId::new("Test", "run"), true)
    }

    #[test]
    fn test_stale_handle_detected() {
        let mut g = graph();
        let a = g.add_floating(Op::Constant(Constant::Int(1)), &[], Kind::S32);
        g.remove_node(a).unwrap();
        let b = g.add_floating(Op::Constant(Constant::Int(2)), &[], Kind::S32);
        // slot reused, generation bumped
        assert_eq!(a.index, b.index);
        assert_ne!(a, b);
        assert!(g.get(a).is_none());
        assert!(matches!(g.node(a), Err(CompileError::Malformed(_))));
        assert_eq!(g.node(b).unwrap().constant(), Some(Constant::Int(2)));
    }

    #[test]
    fn test_replace_uses_follows_chains() {
        let mut g = graph();
        let a = g.add_floating(Op::Constant(Constant::Int(1)), &[], Kind::S32);
        let b = g.add_floating(Op::Constant(Constant::Int(2)), &[], Kind::S32);
        let c = g.add_floating(Op::Constant(Constant::Int(3)), &[], Kind::S32);
        let sum = g.add_floating(Op::Binary(BinaryOp::Add), &[a, a], Kind::S32);
        g.set_terminator(g.entry(), Terminator::Return(Some(a))).unwrap();

        let mut map = FxHashMap::default();
        map.insert(a, b);
        map.insert(b, c);
        assert_eq!(g.replace_uses(&map), 3);
        assert_eq!(g.node(sum).unwrap().inputs.as_slice(), &[c, c]);
        assert_eq!(
            g.block(g.entry()).unwrap().terminator,
            Terminator::Return(Some(c))
        );
    }

    #[test]
    fn test_remove_edge_trims_phi_inputs() {
        //  bb0 -> bb1 -> bb3
        //   \            ^
        //    +--> bb2 ---+
        let mut g = graph();
        let bb1 = g.add_block();
        let bb2 = g.add_block();
        let bb3 = g.add_block();
        let cond = g.add_floating(Op::Constant(Constant::Bool(true)), &[], Kind::PRED);
        g.terminate(
            g.entry(),
            Terminator::If {
                condition: cond,
                then_block: bb1,
                else_block: bb2,
            },
        )
        .unwrap();
        g.terminate(bb1, Terminator::Jump(bb3)).unwrap();
        g.terminate(bb2, Terminator::Jump(bb3)).unwrap();
        let one = g.add_floating(Op::Constant(Constant::Int(1)), &[], Kind::S32);
        let two = g.add_floating(Op::Constant(Constant::Int(2)), &[], Kind::S32);
        let phi = g.add_phi(bb3, Op::Phi, &[one, two], Kind::S32).unwrap();

        g.remove_block(bb1).unwrap();
        assert_eq!(g.block(bb3).unwrap().predecessors, vec![bb2]);
        assert_eq!(g.node(phi).unwrap().inputs.as_slice(), &[two]);
    }

    #[test]
    fn test_usages_cover_terminators() {
        let mut g = graph();
        let a = g.add_floating(Op::Constant(Constant::Int(1)), &[], Kind::S32);
        let neg = g.add_floating(Op::Unary(crate::ir::UnaryOp::Neg), &[a], Kind::S32);
        g.set_terminator(g.entry(), Terminator::Return(Some(neg))).unwrap();
        let usages = g.usages();
        assert_eq!(usages.of(a), &[Usage::Node(neg)]);
        assert_eq!(usages.of(neg), &[Usage::Terminator(g.entry())]);
        assert!(!usages.is_unused(neg));
    }
}
