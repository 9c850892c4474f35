//! Instruction selection: scheduled kernel graph → LIR
//!
//! One call per block, nodes in scheduled order. Every node is materialized
//! at most once; a value-producing node gets its variable from the per-kind
//! allocator right before its defining instruction. Operators are picked
//! from the target's dispatch table, and a missing rule is an error rather
//! than a silent default.

use super::calling_convention::{symbol_name, ParamBinding};
use super::lir::{CalleeDecl, Expr, LirBlock, LirInst, LirUnit, LocalArray, Operand, Variable};
use super::target::{Opcode, TargetDescription};
use super::variables::VariableAllocator;
use crate::config::{CompileOptions, DeviceDescriptor};
use crate::error::{CompileError, CompileResult};
use crate::ir::dump::dump_node;
use crate::ir::{
    BinaryOp, BlockId, Condition, Constant, Kind, KernelGraph, MethodId, NodeId, Op, Region,
    Schedule, Terminator,
};
use fxhash::{FxHashMap, FxHashSet};
use indexmap::{IndexMap, IndexSet};

pub struct LirGenerator<'a> {
    pub(super) graph: &'a KernelGraph,
    pub(super) target: &'a dyn TargetDescription,
    pub(super) options: &'a CompileOptions,
    pub(super) device: &'a DeviceDescriptor,
    pub(super) vars: VariableAllocator<'a>,
    pub(super) values: FxHashMap<NodeId, Operand>,
    pub(super) parameters: Vec<ParamBinding>,
    pub(super) formals: Vec<(String, Kind)>,
    pub(super) frame: Option<Variable>,
    schedule: &'a Schedule,
    entry_name: String,
    emitted: FxHashSet<NodeId>,
    current: Option<LirBlock>,
    blocks: Vec<LirBlock>,
    arrays: Vec<LocalArray>,
    region_bases: IndexSet<Region>,
    callees: IndexMap<MethodId, CalleeDecl>,
}

impl<'a> LirGenerator<'a> {
    pub fn new(
        graph: &'a KernelGraph,
        schedule: &'a Schedule,
        target: &'a dyn TargetDescription,
        options: &'a CompileOptions,
        device: &'a DeviceDescriptor,
        entry_name: impl Into<String>,
    ) -> Self {
        Self {
            graph,
            target,
            options,
            device,
            vars: VariableAllocator::new(target),
            values: FxHashMap::default(),
            parameters: Vec::new(),
            formals: Vec::new(),
            frame: None,
            schedule,
            entry_name: entry_name.into(),
            emitted: FxHashSet::default(),
            current: None,
            blocks: Vec::new(),
            arrays: Vec::new(),
            region_bases: IndexSet::new(),
            callees: IndexMap::new(),
        }
    }

    /// Label `block`, run the prologue if it is the entry, then select every
    /// scheduled node and the terminator.
    pub fn emit_block(&mut self, block: BlockId) -> CompileResult<()> {
        if let Some(done) = self.current.take() {
            self.blocks.push(done);
        }
        self.current = Some(LirBlock {
            id: block,
            instructions: Vec::new(),
        });
        if block == self.graph.entry() && self.graph.block(block)?.predecessors.is_empty() {
            self.emit_prologue()?;
        }
        let schedule = self.schedule;
        for &id in schedule.nodes_in(block) {
            self.emit_node(id)?;
        }
        self.emit_terminator(block)
    }

    pub fn finish(mut self) -> LirUnit {
        if let Some(done) = self.current.take() {
            self.blocks.push(done);
        }
        LirUnit {
            entry_name: self.entry_name,
            method: self.graph.method.clone(),
            is_kernel: self.graph.is_kernel,
            return_kind: self.graph.return_kind,
            parameters: self.parameters,
            formals: self.formals,
            frame: self.frame,
            region_bases: self.region_bases.into_iter().collect(),
            arrays: self.arrays,
            variables: self.vars.into_declarations(),
            blocks: self.blocks,
            callees: self.callees.into_values().collect(),
        }
    }

    pub(super) fn push(&mut self, inst: LirInst) {
        if let Some(block) = self.current.as_mut() {
            block.instructions.push(inst);
        }
    }

    /// A fresh variable assigned from `expr`.
    pub(super) fn temp(&mut self, kind: Kind, expr: Expr) -> CompileResult<Variable> {
        self.target.check_kind(kind, self.device)?;
        let dest = self.vars.allocate(kind);
        self.push(LirInst::Assign {
            dest: dest.clone(),
            expr,
        });
        Ok(dest)
    }

    /// Define `node` as `expr`.
    fn assign(&mut self, node: NodeId, kind: Kind, expr: Expr) -> CompileResult<()> {
        self.target.check_kind(kind, self.device)?;
        let dest = self.vars.for_node(node, kind);
        self.push(LirInst::Assign {
            dest: dest.clone(),
            expr,
        });
        self.values.insert(node, Operand::Var(dest));
        Ok(())
    }

    /// Value of `id`, selecting it on demand.
    pub(super) fn operand(&mut self, id: NodeId) -> CompileResult<Operand> {
        if let Some(value) = self.values.get(&id) {
            return Ok(value.clone());
        }
        self.emit_node(id)?;
        self.values
            .get(&id)
            .cloned()
            .ok_or_else(|| CompileError::Internal(format!("{} produced no value", id)))
    }

    /// Immediates moved into a variable, for positions that need a register.
    fn register(&mut self, value: Operand) -> CompileResult<Operand> {
        match value {
            Operand::Const(..) | Operand::Builtin(..) => {
                let kind = value.kind();
                Ok(Operand::Var(self.temp(kind, Expr::Move(value))?))
            }
            other => Ok(other),
        }
    }

    /// A predicate operand for a branch or select condition.
    fn predicate(&mut self, id: NodeId) -> CompileResult<Operand> {
        let value = self.operand(id)?;
        let kind = value.kind();
        if kind.is_predicate() {
            return Ok(value);
        }
        if !kind.is_integer() || kind.is_vector() {
            return Err(CompileError::unsupported(
                self.target.name(),
                format!("condition of kind {}", kind),
            ));
        }
        let op = self.target.compare_op(Condition::Ne, kind)?;
        let p = self.temp(
            Kind::PRED,
            Expr::Binary {
                op,
                left: value,
                right: Operand::Const(Constant::Int(0), kind),
            },
        )?;
        Ok(Operand::Var(p))
    }

    fn input(&mut self, id: NodeId, index: usize) -> CompileResult<Operand> {
        let input = self.graph.node(id)?.input(index).ok_or_else(|| {
            CompileError::malformed(format!("{} is missing input {}", id, index))
        })?;
        self.operand(input)
    }

    fn emit_node(&mut self, id: NodeId) -> CompileResult<()> {
        if !self.emitted.insert(id) {
            return Ok(());
        }
        let graph = self.graph;
        let node = graph.node(id)?;
        let kind = node.kind;
        if self.options.emit_comments && !matches!(node.op, Op::Constant(_) | Op::Phi) {
            self.push(LirInst::Comment(dump_node(id, node)));
        }

        match &node.op {
            Op::Constant(c) => {
                self.values.insert(id, Operand::Const(*c, kind));
            }
            Op::Parameter(index) => {
                let binding = self
                    .parameters
                    .iter()
                    .find(|b| b.index == *index)
                    .map(|b| b.variable.clone())
                    .ok_or_else(|| {
                        CompileError::Internal(format!("parameter {} was not bound", index))
                    })?;
                self.values.insert(id, Operand::Var(binding));
            }
            Op::Binary(op) => {
                let left = self.input(id, 0)?;
                let right = self.input(id, 1)?;
                let op = self.target.binary_op(*op, kind)?;
                self.assign(id, kind, Expr::Binary { op, left, right })?;
            }
            Op::Unary(op) => {
                let value = self.input(id, 0)?;
                let op = self.target.unary_op(*op, kind)?;
                self.assign(id, kind, Expr::Unary { op, value })?;
            }
            Op::Compare(cond) => {
                let left = self.input(id, 0)?;
                let right = self.input(id, 1)?;
                let op = self.target.compare_op(*cond, left.kind())?;
                self.assign(id, Kind::PRED, Expr::Binary { op, left, right })?;
            }
            Op::Conditional => {
                let condition = node
                    .input(0)
                    .ok_or_else(|| CompileError::malformed(format!("select {} has no condition", id)))?;
                let predicate = self.predicate(condition)?;
                let if_true = self.input(id, 1)?;
                let if_false = self.input(id, 2)?;
                let op = self.target.select_op(kind)?;
                self.assign(
                    id,
                    kind,
                    Expr::Ternary {
                        op,
                        first: if_true,
                        second: if_false,
                        third: predicate,
                    },
                )?;
            }
            Op::Convert => {
                let value = self.input(id, 0)?;
                let from = value.kind();
                let expr = if from == kind {
                    Expr::Move(value)
                } else {
                    Expr::Convert {
                        op: self.target.convert_op(from, kind)?,
                        value,
                    }
                };
                self.assign(id, kind, expr)?;
            }
            Op::Phi => {
                let var = self.vars.for_node(id, kind);
                self.target.check_kind(kind, self.device)?;
                self.values.insert(id, Operand::Var(var));
            }
            Op::MemoryPhi | Op::FrameState => {}
            Op::NewArray {
                element,
                length,
                region,
            } => {
                if !matches!(region, Region::Local | Region::Private) {
                    return Err(CompileError::invalid_region(
                        id,
                        format!("allocation in {} region", region.name()),
                    ));
                }
                self.target.check_kind(*element, self.device)?;
                let index = self.arrays.len() as u32;
                let binding = self.target.region_binding(*region);
                self.arrays.push(LocalArray {
                    name: format!("{}_{}", binding.register, index),
                    region: *region,
                    element: *element,
                    length: *length,
                });
                self.assign(id, kind, Expr::Move(Operand::Array(index)))?;
            }
            Op::Read { region, .. } => {
                let region = region.ok_or_else(|| {
                    CompileError::invalid_region(id, "read reached instruction selection unbound")
                })?;
                let address = self.input(id, 0)?;
                self.assign(id, kind, Expr::Load { region, address })?;
            }
            Op::Write { region } => {
                let region = region.ok_or_else(|| {
                    CompileError::invalid_region(id, "write reached instruction selection unbound")
                })?;
                let address = self.input(id, 0)?;
                let value = self.input(id, 1)?;
                let value = self.register(value)?;
                self.push(LirInst::Store {
                    region,
                    address,
                    value,
                });
            }
            Op::AtomicUpdate { op, region } => {
                let region = region.ok_or_else(|| {
                    CompileError::invalid_region(id, "atomic update reached instruction selection unbound")
                })?;
                let address = self.input(id, 0)?;
                let value = self.input(id, 1)?;
                let value = self.register(value)?;
                let op = self.target.atomic_op(*op, value.kind(), region)?;
                self.push(LirInst::Atomic {
                    op,
                    region,
                    address,
                    value,
                });
            }
            Op::Address { region } => {
                let mut base = self.input(id, 0)?;
                let offset = self.input(id, 1)?;
                let add = self.target.binary_op(BinaryOp::Add, kind)?;
                if self.options.relative_addresses && matches!(region, Region::Global | Region::Constant) {
                    self.region_bases.insert(*region);
                    let register = self.target.region_binding(*region).register;
                    let region_base = self.temp(kind, Expr::Move(Operand::Register(register, kind)))?;
                    base = Operand::Var(self.temp(
                        kind,
                        Expr::Binary {
                            op: add.clone(),
                            left: Operand::Var(region_base),
                            right: base,
                        },
                    )?);
                }
                self.assign(
                    id,
                    kind,
                    Expr::Binary {
                        op: add,
                        left: base,
                        right: offset,
                    },
                )?;
            }
            Op::ParallelRange(_) | Op::ParallelOffset(_) | Op::ParallelStride(_) | Op::Intrinsic(_) => {
                return Err(CompileError::unsupported(
                    self.target.name(),
                    format!("{} survived specialization", node.op.describe()),
                ));
            }
            Op::Builtin(builtin) => {
                self.assign(id, kind, Expr::Move(Operand::Builtin(*builtin, kind)))?;
            }
            Op::Barrier(scope) => self.push(LirInst::Barrier(*scope)),
            Op::VectorValue => {
                let first = node
                    .input(0)
                    .ok_or_else(|| CompileError::malformed(format!("vector {} has no lanes", id)))?;
                if graph.kind(first)?.is_vector() {
                    // lane 0 already holds the whole vector
                    let source = self.operand(first)?;
                    self.assign(id, kind, Expr::Move(source))?;
                } else {
                    let mut lanes = Vec::with_capacity(node.inputs.len());
                    for &lane in &node.inputs {
                        lanes.push(self.operand(lane)?);
                    }
                    self.assign(id, kind, Expr::Vector(lanes))?;
                }
            }
            Op::VectorElement(lane) => {
                let vector = self.input(id, 0)?;
                if !vector.kind().is_vector() {
                    return Err(CompileError::malformed(format!(
                        "lane select {} references non-vector operand of kind {}",
                        id,
                        vector.kind()
                    )));
                }
                self.assign(id, kind, Expr::Lane { vector, lane: *lane })?;
            }
            Op::VectorLaneStore(lane) => {
                let vector = self.input(id, 0)?;
                let value = self.input(id, 1)?;
                let Operand::Var(vector) = vector else {
                    return Err(CompileError::malformed(format!(
                        "lane store {} targets a value without storage",
                        id
                    )));
                };
                self.push(LirInst::LaneStore {
                    vector,
                    lane: *lane,
                    value,
                });
            }
            Op::Invoke(method) => {
                let name = symbol_name(method).ok_or_else(|| {
                    CompileError::unsupported(self.target.name(), format!("call of anonymous method {}", method))
                })?;
                let mut args = Vec::with_capacity(node.inputs.len());
                for i in 0..node.inputs.len() {
                    let arg = self.input(id, i)?;
                    args.push(self.register(arg)?);
                }
                self.callees.entry(method.clone()).or_insert_with(|| CalleeDecl {
                    method: method.clone(),
                    name: name.clone(),
                    params: args.iter().map(Operand::kind).collect(),
                    return_kind: kind,
                });
                let call = Expr::Call { callee: name, args };
                if kind.is_value() {
                    self.assign(id, kind, call)?;
                } else {
                    self.push(LirInst::Eval(call));
                }
            }
            Op::Guard | Op::NullCheck => {
                return Err(CompileError::unsupported(
                    self.target.name(),
                    format!("{} has no lowering on kernels", node.op.describe()),
                ));
            }
        }
        Ok(())
    }

    fn emit_terminator(&mut self, block: BlockId) -> CompileResult<()> {
        let graph = self.graph;
        match &graph.block(block)?.terminator {
            Terminator::Jump(target) => {
                self.phi_moves(block, *target)?;
                self.push(LirInst::Jump(*target));
            }
            Terminator::If {
                condition,
                then_block,
                else_block,
            } => {
                let predicate = self.predicate(*condition)?;
                self.push(LirInst::Branch {
                    predicate,
                    target: *then_block,
                });
                self.push(LirInst::Jump(*else_block));
            }
            Terminator::Switch {
                value,
                keys,
                targets,
                default,
            } => {
                let value = self.operand(*value)?;
                let kind = value.kind();
                if !kind.is_integer() || kind.is_vector() {
                    return Err(CompileError::unsupported(
                        self.target.name(),
                        format!("switch on kind {}", kind),
                    ));
                }
                let eq: Opcode = self.target.compare_op(Condition::Eq, kind)?;
                for (&key, &target) in keys.iter().zip(targets) {
                    let p = self.temp(
                        Kind::PRED,
                        Expr::Binary {
                            op: eq.clone(),
                            left: value.clone(),
                            right: Operand::Const(Constant::Int(key), kind),
                        },
                    )?;
                    self.push(LirInst::Branch {
                        predicate: Operand::Var(p),
                        target,
                    });
                }
                self.push(LirInst::Jump(*default));
            }
            Terminator::Return(value) => {
                let value = match value {
                    Some(v) if !graph.is_kernel => {
                        let v = self.operand(*v)?;
                        Some(self.register(v)?)
                    }
                    _ => None,
                };
                self.push(LirInst::Return(value));
            }
            Terminator::Deopt(reason) => self.push(LirInst::Trap(reason.clone())),
        }
        Ok(())
    }

    /// Copies into the phis of `to` along the edge from `from`, as one
    /// parallel assignment.
    fn phi_moves(&mut self, from: BlockId, to: BlockId) -> CompileResult<()> {
        let graph = self.graph;
        let target = graph.block(to)?;
        if target.phis.is_empty() {
            return Ok(());
        }
        let edge = target
            .predecessors
            .iter()
            .position(|&p| p == from)
            .ok_or_else(|| CompileError::Internal(format!("{} is not a predecessor of {}", from, to)))?;

        let mut moves: Vec<(Variable, Operand)> = Vec::new();
        for &phi in &target.phis {
            let node = graph.node(phi)?;
            if node.op != Op::Phi {
                continue;
            }
            let input = node
                .input(edge)
                .ok_or_else(|| CompileError::malformed(format!("phi {} has no input for {}", phi, from)))?;
            let dest = self.vars.for_node(phi, node.kind);
            self.values.insert(phi, Operand::Var(dest.clone()));
            let source = self.operand(input)?;
            moves.push((dest, source));
        }

        let dests: FxHashSet<Variable> = moves.iter().map(|(d, _)| d.clone()).collect();
        let mut staged = Vec::with_capacity(moves.len());
        for (dest, source) in moves {
            let source = match source.as_var() {
                Some(var) if *var != dest && dests.contains(var) => {
                    Operand::Var(self.temp(var.kind, Expr::Move(source.clone()))?)
                }
                _ => source,
            };
            staged.push((dest, source));
        }
        for (dest, source) in staged {
            if source.as_var() == Some(&dest) {
                continue;
            }
            self.push(LirInst::Assign {
                dest,
                expr: Expr::Move(source),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::block_emitter::generate_lir;
    use crate::codegen::target::{create_target, TargetKind};
    use crate::ir::scheduling::{compute_schedule, ScheduleStrategy};
    use crate::ir::{GraphBuilder, ScalarKind};

    fn lower(graph: &KernelGraph, target: TargetKind) -> CompileResult<LirUnit> {
        let target = create_target(target);
        let schedule = compute_schedule(graph, ScheduleStrategy::LatestOutOfLoops)?;
        generate_lir(
            graph,
            &schedule,
            target.as_ref(),
            &CompileOptions::default(),
            &DeviceDescriptor::gpu("gpu0", 1024),
            "unit",
        )
    }

    #[test]
    fn test_select_emits_predicate_compare_then_select() {
        let mut b = GraphBuilder::callee(MethodId::new("T", "pick"), Kind::F32);
        let x = b.scalar_parameter("x", Kind::F32);
        let y = b.scalar_parameter("y", Kind::F32);
        let ge = b.compare(Condition::Ge, x, y);
        let picked = b.select(ge, x, y);
        b.ret(Some(picked)).unwrap();
        let graph = b.finish().unwrap();

        let unit = lower(&graph, TargetKind::Ptx).unwrap();
        let preds: Vec<&Variable> = unit
            .variables
            .iter()
            .filter(|(k, _)| *k == Kind::PRED)
            .flat_map(|(_, v)| v.iter())
            .collect();
        assert_eq!(preds.len(), 1);

        let assigns: Vec<&LirInst> = unit
            .instructions()
            .filter(|i| matches!(i, LirInst::Assign { expr: Expr::Binary { .. } | Expr::Ternary { .. }, .. }))
            .collect();
        assert_eq!(assigns.len(), 2);
        match (assigns[0], assigns[1]) {
            (
                LirInst::Assign {
                    dest: p,
                    expr: Expr::Binary { op: cmp, .. },
                },
                LirInst::Assign {
                    expr: Expr::Ternary { op: sel, third, .. },
                    ..
                },
            ) => {
                assert_eq!(p.kind, Kind::PRED);
                assert_eq!(cmp.mnemonic, "setp.ge.f32");
                assert_eq!(sel.mnemonic, "selp.f32");
                assert_eq!(third.as_var(), Some(p));
            }
            other => panic!("unexpected instructions {:?}", other),
        }
    }

    #[test]
    fn test_vector_with_vector_first_lane_is_a_copy() {
        let v4 = Kind::vector(ScalarKind::F32, 4);
        let mut b = GraphBuilder::callee(MethodId::new("T", "copy"), v4);
        let x = b.scalar_parameter("x", v4);
        let zero = b.float(0.0);
        let copy = b.vector(&[x, zero, zero, zero], v4);
        b.ret(Some(copy)).unwrap();
        let graph = b.finish().unwrap();

        let unit = lower(&graph, TargetKind::OpenCl).unwrap();
        assert!(!unit
            .instructions()
            .any(|i| matches!(i, LirInst::Assign { expr: Expr::Vector(_), .. })));
        let moves: Vec<&LirInst> = unit
            .instructions()
            .filter(|i| {
                matches!(i, LirInst::Assign { dest, expr: Expr::Move(Operand::Var(src)) }
                    if dest.kind == v4 && src.kind == v4)
            })
            .collect();
        assert_eq!(moves.len(), 1);
    }

    #[test]
    fn test_switch_becomes_compare_and_branch_chain() {
        let mut b = GraphBuilder::callee(MethodId::new("T", "sw"), Kind::S32);
        let x = b.scalar_parameter("x", Kind::S32);
        let one = b.create_block();
        let two = b.create_block();
        let other = b.create_block();
        b.switch(x, &[10, 20], &[one, two], other).unwrap();
        for (block, value) in [(one, 1), (two, 2), (other, 0)] {
            b.switch_to_block(block);
            let v = b.int(value);
            b.ret(Some(v)).unwrap();
        }
        let graph = b.finish().unwrap();

        let unit = lower(&graph, TargetKind::Ptx).unwrap();
        let entry = &unit.blocks[0].instructions;
        let tail: Vec<String> = entry
            .iter()
            .skip_while(|i| !matches!(i, LirInst::Assign { dest, .. } if dest.kind == Kind::PRED))
            .map(|i| i.to_string())
            .collect();
        assert_eq!(
            tail,
            vec![
                "rpb0 = setp.eq.s32 rsi0, 10:s32",
                "if rpb0 jump bb1",
                "rpb1 = setp.eq.s32 rsi0, 20:s32",
                "if rpb1 jump bb2",
                "jump bb3",
            ]
        );
    }

    #[test]
    fn test_lane_select_on_scalar_is_malformed() {
        let mut graph = KernelGraph::new(MethodId::new("T", "bad"), false);
        let x = graph.add_floating(Op::Constant(Constant::Int(1)), &[], Kind::S32);
        let lane = graph.add_floating(Op::VectorElement(0), &[x], Kind::S32);
        graph
            .terminate(graph.entry(), Terminator::Return(Some(lane)))
            .unwrap();
        graph.return_kind = Kind::S32;
        let err = lower(&graph, TargetKind::OpenCl).unwrap_err();
        assert_eq!(err.code(), crate::error_codes::MALFORMED_GRAPH);
    }

    #[test]
    fn test_unbound_access_fails_region_resolution() {
        let mut b = GraphBuilder::kernel(MethodId::new("T", "raw"));
        let a = b.array_parameter("a", Kind::S32);
        let i = b.int(0);
        b.write(a, i, i).unwrap();
        b.ret(None).unwrap();
        let graph = b.finish().unwrap();
        let err = lower(&graph, TargetKind::Ptx).unwrap_err();
        assert_eq!(err.code(), crate::error_codes::INVALID_REGION);
    }
}
