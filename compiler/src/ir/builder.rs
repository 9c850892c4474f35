//! Graph Builder
//!
//! Builder interface used by front ends (and tests) to construct a
//! [`KernelGraph`]. The builder keeps a current block for fixed nodes and
//! checks that every block is terminated before handing the graph over.

use tracing::debug;

use super::graph::{LocalSlot, ParamType, ParameterDecl, Terminator};
use super::validation::validate;
use super::{
    AtomicOp, BarrierScope, BinaryOp, BlockId, Condition, Constant, Intrinsic, Kind, KernelGraph,
    MethodId, NodeId, Op, Region, UnaryOp,
};
use crate::error::{CompileError, CompileResult};
use fxhash::FxHashSet;

/// Kind of an array reference value before address lowering fixes the
/// device word size.
pub const REFERENCE_KIND: Kind = Kind::U64;

pub struct GraphBuilder {
    graph: KernelGraph,
    current: BlockId,
    terminated: FxHashSet<BlockId>,
}

impl GraphBuilder {
    /// Start a kernel-level compile unit.
    pub fn kernel(method: MethodId) -> Self {
        Self::with_graph(KernelGraph::new(method, true))
    }

    /// Start a callee compile unit returning `return_kind`.
    pub fn callee(method: MethodId, return_kind: Kind) -> Self {
        let mut graph = KernelGraph::new(method, false);
        graph.return_kind = return_kind;
        Self::with_graph(graph)
    }

    fn with_graph(graph: KernelGraph) -> Self {
        let current = graph.entry();
        Self {
            graph,
            current,
            terminated: FxHashSet::default(),
        }
    }

    pub fn graph(&self) -> &KernelGraph {
        &self.graph
    }

    // === Signature ===

    /// Declare the next formal parameter and return its value node. Callee
    /// units also get a local slot of the same name.
    pub fn parameter(&mut self, name: &str, ty: ParamType) -> NodeId {
        let index = self.graph.parameters.len() as u32;
        let kind = match ty {
            ParamType::Scalar(kind) => kind,
            ParamType::Array { .. } => REFERENCE_KIND,
        };
        if !self.graph.is_kernel {
            self.graph.locals.push(LocalSlot {
                name: name.to_string(),
                kind,
            });
        }
        self.graph.parameters.push(ParameterDecl {
            name: name.to_string(),
            ty,
            reduction: None,
        });
        self.graph
            .add_floating(Op::Parameter(index), &[], kind)
    }

    pub fn scalar_parameter(&mut self, name: &str, kind: Kind) -> NodeId {
        self.parameter(name, ParamType::Scalar(kind))
    }

    pub fn array_parameter(&mut self, name: &str, element: Kind) -> NodeId {
        self.parameter(
            name,
            ParamType::Array {
                element,
                constant: false,
            },
        )
    }

    /// An array parameter that receives a reduction: updates of the form
    /// `a[i] = a[i] op v` become atomic when the kernel runs in parallel.
    pub fn reduce_parameter(&mut self, name: &str, element: Kind, op: AtomicOp) -> NodeId {
        let id = self.array_parameter(name, element);
        if let Some(decl) = self.graph.parameters.last_mut() {
            decl.reduction = Some(op);
        }
        id
    }

    // === Blocks ===

    pub fn create_block(&mut self) -> BlockId {
        self.graph.add_block()
    }

    pub fn switch_to_block(&mut self, block: BlockId) {
        self.current = block;
    }

    pub fn current_block(&self) -> BlockId {
        self.current
    }

    fn terminate(&mut self, terminator: Terminator) -> CompileResult<()> {
        if !self.terminated.insert(self.current) {
            return Err(CompileError::malformed(format!(
                "block {} terminated twice",
                self.current
            )));
        }
        self.graph.terminate(self.current, terminator)
    }

    pub fn jump(&mut self, target: BlockId) -> CompileResult<()> {
        self.terminate(Terminator::Jump(target))
    }

    pub fn branch(&mut self, condition: NodeId, then_block: BlockId, else_block: BlockId) -> CompileResult<()> {
        self.terminate(Terminator::If {
            condition,
            then_block,
            else_block,
        })
    }

    pub fn switch(
        &mut self,
        value: NodeId,
        keys: &[i64],
        targets: &[BlockId],
        default: BlockId,
    ) -> CompileResult<()> {
        self.terminate(Terminator::Switch {
            value,
            keys: keys.to_vec(),
            targets: targets.to_vec(),
            default,
        })
    }

    pub fn ret(&mut self, value: Option<NodeId>) -> CompileResult<()> {
        self.terminate(Terminator::Return(value))
    }

    pub fn deopt(&mut self, reason: &str) -> CompileResult<()> {
        self.terminate(Terminator::Deopt(reason.to_string()))
    }

    // === Values ===

    pub fn constant(&mut self, value: Constant, kind: Kind) -> NodeId {
        self.graph.add_floating(Op::Constant(value), &[], kind)
    }

    pub fn int(&mut self, value: i32) -> NodeId {
        self.constant(Constant::Int(value as i64), Kind::S32)
    }

    pub fn long(&mut self, value: i64) -> NodeId {
        self.constant(Constant::Int(value), Kind::S64)
    }

    pub fn float(&mut self, value: f32) -> NodeId {
        self.constant(Constant::float(value as f64), Kind::F32)
    }

    pub fn double(&mut self, value: f64) -> NodeId {
        self.constant(Constant::float(value), Kind::F64)
    }

    pub fn boolean(&mut self, value: bool) -> NodeId {
        self.constant(Constant::Bool(value), Kind::PRED)
    }

    fn kind_of(&self, id: NodeId) -> Kind {
        self.graph.get(id).map(|n| n.kind).unwrap_or(Kind::Illegal)
    }

    pub fn binary(&mut self, op: BinaryOp, left: NodeId, right: NodeId) -> NodeId {
        let kind = self.kind_of(left);
        self.graph.add_floating(Op::Binary(op), &[left, right], kind)
    }

    pub fn add(&mut self, left: NodeId, right: NodeId) -> NodeId {
        self.binary(BinaryOp::Add, left, right)
    }

    pub fn mul(&mut self, left: NodeId, right: NodeId) -> NodeId {
        self.binary(BinaryOp::Mul, left, right)
    }

    pub fn unary(&mut self, op: UnaryOp, value: NodeId) -> NodeId {
        let kind = self.kind_of(value);
        self.graph.add_floating(Op::Unary(op), &[value], kind)
    }

    pub fn compare(&mut self, cond: Condition, left: NodeId, right: NodeId) -> NodeId {
        self.graph
            .add_floating(Op::Compare(cond), &[left, right], Kind::PRED)
    }

    pub fn select(&mut self, condition: NodeId, if_true: NodeId, if_false: NodeId) -> NodeId {
        let kind = self.kind_of(if_true);
        self.graph
            .add_floating(Op::Conditional, &[condition, if_true, if_false], kind)
    }

    pub fn convert(&mut self, value: NodeId, kind: Kind) -> NodeId {
        self.graph.add_floating(Op::Convert, &[value], kind)
    }

    /// Add a phi to `block`; inputs for edges that do not exist yet are added
    /// later with [`GraphBuilder::add_phi_input`].
    pub fn phi(&mut self, block: BlockId, inputs: &[NodeId], kind: Kind) -> CompileResult<NodeId> {
        self.graph.add_phi(block, Op::Phi, inputs, kind)
    }

    pub fn memory_phi(&mut self, block: BlockId, inputs: &[NodeId]) -> CompileResult<NodeId> {
        self.graph.add_phi(block, Op::MemoryPhi, inputs, Kind::Void)
    }

    pub fn add_phi_input(&mut self, phi: NodeId, value: NodeId) -> CompileResult<()> {
        self.graph.node_mut(phi)?.inputs.push(value);
        Ok(())
    }

    // === Memory ===

    pub fn new_array(&mut self, element: Kind, length: u32, region: Region) -> CompileResult<NodeId> {
        if !matches!(region, Region::Local | Region::Private) {
            return Err(CompileError::malformed(format!(
                "kernel allocations must be local or private, not {}",
                region.name()
            )));
        }
        self.fixed(
            Op::NewArray {
                element,
                length,
                region,
            },
            &[],
            REFERENCE_KIND,
        )
    }

    pub fn read(&mut self, base: NodeId, index: NodeId, kind: Kind) -> CompileResult<NodeId> {
        self.fixed(
            Op::Read {
                region: None,
                floating: false,
            },
            &[base, index],
            kind,
        )
    }

    pub fn write(&mut self, base: NodeId, index: NodeId, value: NodeId) -> CompileResult<NodeId> {
        self.fixed(Op::Write { region: None }, &[base, index, value], Kind::Void)
    }

    pub fn atomic(&mut self, op: AtomicOp, base: NodeId, index: NodeId, value: NodeId) -> CompileResult<NodeId> {
        self.fixed(Op::AtomicUpdate { op, region: None }, &[base, index, value], Kind::Void)
    }

    pub fn barrier(&mut self, scope: BarrierScope) -> CompileResult<NodeId> {
        self.fixed(Op::Barrier(scope), &[], Kind::Void)
    }

    // === Parallel loops ===

    pub fn parallel_range(&mut self, dim: u8, value: NodeId) -> NodeId {
        let kind = self.kind_of(value);
        self.graph
            .add_floating(Op::ParallelRange(dim), &[value], kind)
    }

    pub fn parallel_offset(&mut self, dim: u8, value: NodeId) -> NodeId {
        let kind = self.kind_of(value);
        self.graph
            .add_floating(Op::ParallelOffset(dim), &[value], kind)
    }

    pub fn parallel_stride(&mut self, dim: u8, value: NodeId) -> NodeId {
        let kind = self.kind_of(value);
        self.graph
            .add_floating(Op::ParallelStride(dim), &[value], kind)
    }

    pub fn intrinsic(&mut self, intrinsic: Intrinsic) -> NodeId {
        self.graph
            .add_floating(Op::Intrinsic(intrinsic), &[], Kind::S32)
    }

    // === Vectors ===

    pub fn vector(&mut self, lanes: &[NodeId], kind: Kind) -> NodeId {
        self.graph.add_floating(Op::VectorValue, lanes, kind)
    }

    /// Lane select; a non-vector operand yields an illegal-kinded node that
    /// validation rejects.
    pub fn lane(&mut self, vector: NodeId, lane: u8) -> NodeId {
        let kind = match self.kind_of(vector) {
            Kind::Vector { element, .. } => Kind::Scalar(element),
            _ => Kind::Illegal,
        };
        self.graph
            .add_floating(Op::VectorElement(lane), &[vector], kind)
    }

    pub fn lane_store(&mut self, vector: NodeId, lane: u8, value: NodeId) -> CompileResult<NodeId> {
        self.fixed(Op::VectorLaneStore(lane), &[vector, value], Kind::Void)
    }

    // === Calls and exceptions ===

    pub fn invoke(&mut self, method: MethodId, args: &[NodeId], kind: Kind) -> CompileResult<NodeId> {
        self.fixed(Op::Invoke(method), args, kind)
    }

    pub fn frame_state(&mut self, values: &[NodeId]) -> NodeId {
        self.graph.add_floating(Op::FrameState, values, Kind::Void)
    }

    pub fn guard(&mut self, condition: NodeId, state: Option<NodeId>) -> CompileResult<NodeId> {
        let mut inputs = vec![condition];
        inputs.extend(state);
        self.fixed(Op::Guard, &inputs, Kind::Void)
    }

    pub fn null_check(&mut self, object: NodeId) -> CompileResult<NodeId> {
        self.fixed(Op::NullCheck, &[object], Kind::Void)
    }

    fn fixed(&mut self, op: Op, inputs: &[NodeId], kind: Kind) -> CompileResult<NodeId> {
        self.graph.append_fixed(self.current, op, inputs, kind)
    }

    /// Check termination and structural invariants and return the graph.
    pub fn finish(self) -> CompileResult<KernelGraph> {
        for block in self.graph.block_ids() {
            if !self.terminated.contains(&block) {
                return Err(CompileError::malformed(format!(
                    "block {} has no terminator",
                    block
                )));
            }
        }
        validate(&self.graph)?;
        debug!(
            method = %self.graph.method,
            nodes = self.graph.node_count(),
            blocks = self.graph.block_count(),
            "built kernel graph"
        );
        Ok(self.graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unterminated_block_rejected() {
        let mut b = GraphBuilder::kernel(MethodId::new("T", "k"));
        let next = b.create_block();
        b.jump(next).unwrap();
        let err = b.finish().unwrap_err();
        assert!(err.to_string().contains("no terminator"));
    }

    #[test]
    fn test_double_termination_rejected() {
        let mut b = GraphBuilder::kernel(MethodId::new("T", "k"));
        b.ret(None).unwrap();
        assert!(b.ret(None).is_err());
    }

    #[test]
    fn test_callee_parameters_get_local_slots() {
        let mut b = GraphBuilder::callee(MethodId::new("T", "helper"), Kind::S32);
        let x = b.scalar_parameter("x", Kind::S32);
        b.ret(Some(x)).unwrap();
        let graph = b.finish().unwrap();
        assert_eq!(graph.locals.len(), 1);
        assert_eq!(graph.locals[0].name, "x");
        assert!(!graph.is_kernel);
    }

    #[test]
    fn test_loop_phi_patched_after_back_edge() {
        //     entry
        //       |
        //     header <--+
        //      /  \     |
        //   exit   body-+
        let mut b = GraphBuilder::kernel(MethodId::new("T", "loop"));
        let zero = b.int(0);
        let ten = b.int(10);
        let header = b.create_block();
        let body = b.create_block();
        let exit = b.create_block();
        b.jump(header).unwrap();

        b.switch_to_block(header);
        let i = b.phi(header, &[zero], Kind::S32).unwrap();
        let cond = b.compare(Condition::Lt, i, ten);
        b.branch(cond, body, exit).unwrap();

        b.switch_to_block(body);
        let one = b.int(1);
        let next = b.add(i, one);
        b.add_phi_input(i, next).unwrap();
        b.jump(header).unwrap();

        b.switch_to_block(exit);
        b.ret(None).unwrap();

        let graph = b.finish().unwrap();
        assert_eq!(graph.block(header).unwrap().predecessors.len(), 2);
        assert_eq!(graph.node(i).unwrap().inputs.len(), 2);
    }
}
