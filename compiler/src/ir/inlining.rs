//! Callee Inlining
//!
//! - Registry of callee graphs known to the compiler
//! - Cost model: single-block bodies ending in a return, below a node budget
//! - Body cloning at the call site
//!
//! Calls that are not inlined stay `Invoke` nodes and end up in the
//! compilation result as callees needing separate compilation.

use super::graph::Terminator;
use super::optimization::{Phase, PhaseContext, PhaseResult};
use super::{KernelGraph, MethodId, NodeId, Op};
use crate::error::{CompileError, CompileResult};
use fxhash::FxHashMap;
use indexmap::IndexMap;
use tracing::debug;

/// Callee graphs available for inlining, keyed by method identity.
#[derive(Debug, Clone, Default)]
pub struct CalleeRegistry {
    bodies: IndexMap<MethodId, KernelGraph>,
}

impl CalleeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, graph: KernelGraph) -> CompileResult<()> {
        if graph.is_kernel {
            return Err(CompileError::malformed(format!(
                "{} is a kernel and cannot be registered as a callee",
                graph.method
            )));
        }
        self.bodies.insert(graph.method.clone(), graph);
        Ok(())
    }

    pub fn get(&self, method: &MethodId) -> Option<&KernelGraph> {
        self.bodies.get(method)
    }

    pub fn contains(&self, method: &MethodId) -> bool {
        self.bodies.contains_key(method)
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }
}

/// Why a call site was left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InlineRejection {
    Unknown,
    MultipleBlocks,
    NoReturn,
    TooLarge,
    Recursive,
}

/// Inlining cost model
#[derive(Debug, Clone)]
pub struct InliningCostModel {
    pub max_nodes: usize,
}

impl InliningCostModel {
    pub fn should_inline(
        &self,
        caller: &MethodId,
        callee: Option<&KernelGraph>,
    ) -> Result<(), InlineRejection> {
        let callee = callee.ok_or(InlineRejection::Unknown)?;
        if callee.block_count() != 1 {
            return Err(InlineRejection::MultipleBlocks);
        }
        let entry = callee
            .block(callee.entry())
            .map_err(|_| InlineRejection::NoReturn)?;
        if !matches!(entry.terminator, Terminator::Return(_)) {
            return Err(InlineRejection::NoReturn);
        }
        if callee.node_count() > self.max_nodes {
            return Err(InlineRejection::TooLarge);
        }
        let recursive = callee.nodes().any(|(_, node)| match &node.op {
            Op::Invoke(target) => target == &callee.method || target == caller,
            _ => false,
        });
        if recursive {
            return Err(InlineRejection::Recursive);
        }
        Ok(())
    }
}

/// Copies callee bodies into the caller.
pub struct InliningPhase {
    max_rounds: usize,
}

impl InliningPhase {
    pub fn new() -> Self {
        Self { max_rounds: 4 }
    }

    fn call_sites(graph: &KernelGraph) -> Vec<(NodeId, MethodId)> {
        let mut sites = Vec::new();
        for block in graph.blocks() {
            for &fixed in &block.fixed {
                if let Some(Op::Invoke(method)) = graph.get(fixed).map(|n| &n.op) {
                    sites.push((fixed, method.clone()));
                }
            }
        }
        sites
    }

    /// Clone `callee` in front of `invoke` and replace the call by the
    /// cloned return value.
    fn inline_call_site(
        graph: &mut KernelGraph,
        invoke: NodeId,
        callee: &KernelGraph,
    ) -> CompileResult<usize> {
        let call = graph.node(invoke)?.clone();
        let block = call
            .block
            .ok_or_else(|| CompileError::Internal(format!("call {} has no block", invoke)))?;
        let mut map: FxHashMap<NodeId, NodeId> = FxHashMap::default();

        for (id, node) in callee.nodes() {
            if let Op::Parameter(index) = node.op {
                let arg = call.input(index as usize).ok_or_else(|| {
                    CompileError::malformed(format!(
                        "call {} passes {} arguments to {}",
                        invoke,
                        call.inputs.len(),
                        callee.method
                    ))
                })?;
                map.insert(id, arg);
            }
        }

        let body = callee.block(callee.entry())?;
        let mut cloned = 0;
        for &fixed in &body.fixed {
            let inputs = Self::clone_inputs(graph, callee, fixed, &mut map, &mut cloned)?;
            let node = callee.node(fixed)?;
            let copy = graph.insert_fixed_before(block, invoke, node.op.clone(), &inputs, node.kind)?;
            map.insert(fixed, copy);
            cloned += 1;
        }

        if let Terminator::Return(Some(value)) = body.terminator {
            let result = Self::clone_floating(graph, callee, value, &mut map, &mut cloned)?;
            graph.replace_all_uses(invoke, result);
        }
        graph.remove_node(invoke)?;
        Ok(cloned)
    }

    fn clone_inputs(
        graph: &mut KernelGraph,
        callee: &KernelGraph,
        id: NodeId,
        map: &mut FxHashMap<NodeId, NodeId>,
        cloned: &mut usize,
    ) -> CompileResult<Vec<NodeId>> {
        let inputs = callee.node(id)?.inputs.clone();
        inputs
            .iter()
            .map(|&input| Self::clone_floating(graph, callee, input, map, cloned))
            .collect()
    }

    fn clone_floating(
        graph: &mut KernelGraph,
        callee: &KernelGraph,
        id: NodeId,
        map: &mut FxHashMap<NodeId, NodeId>,
        cloned: &mut usize,
    ) -> CompileResult<NodeId> {
        if let Some(&mapped) = map.get(&id) {
            return Ok(mapped);
        }
        let node = callee.node(id)?;
        if node.op.is_fixed() || node.op.is_phi() {
            return Err(CompileError::Internal(format!(
                "{} of {} used before its definition",
                id, callee.method
            )));
        }
        let inputs = Self::clone_inputs(graph, callee, id, map, cloned)?;
        let copy = graph.add_floating(node.op.clone(), &inputs, node.kind);
        map.insert(id, copy);
        *cloned += 1;
        Ok(copy)
    }
}

impl Default for InliningPhase {
    fn default() -> Self {
        Self::new()
    }
}

impl Phase for InliningPhase {
    fn name(&self) -> &'static str {
        "inlining"
    }

    fn run(&mut self, graph: &mut KernelGraph, ctx: &PhaseContext<'_>) -> CompileResult<PhaseResult> {
        if !ctx.options.inline {
            return Ok(PhaseResult::unchanged());
        }
        let model = InliningCostModel {
            max_nodes: ctx.options.max_inline_nodes,
        };

        let mut inlined = 0;
        let mut cloned = 0;
        let mut rejected = 0;
        for _ in 0..self.max_rounds {
            let mut progress = false;
            for (invoke, method) in Self::call_sites(graph) {
                let callee = ctx.callees.get(&method);
                match model.should_inline(&graph.method, callee) {
                    Ok(()) => {
                        if let Some(callee) = callee {
                            cloned += Self::inline_call_site(graph, invoke, callee)?;
                            inlined += 1;
                            progress = true;
                        }
                    }
                    Err(reason) => {
                        debug!(caller = %graph.method, callee = %method, ?reason, "call not inlined");
                        rejected += 1;
                    }
                }
            }
            if !progress {
                break;
            }
        }

        if inlined == 0 {
            return Ok(PhaseResult::unchanged());
        }
        Ok(PhaseResult::changed()
            .stat("inlined", inlined)
            .stat("cloned_nodes", cloned)
            .stat("rejected", rejected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompileOptions, DeviceDescriptor};
    use crate::codegen::target::{create_target, TargetKind};
    use crate::ir::{Condition, GraphBuilder, Kind};

    fn square() -> KernelGraph {
        let mut b = GraphBuilder::callee(MethodId::new("Math", "square"), Kind::F32);
        let x = b.scalar_parameter("x", Kind::F32);
        let sq = b.mul(x, x);
        b.ret(Some(sq)).unwrap();
        b.finish().unwrap()
    }

    fn branching() -> KernelGraph {
        let mut b = GraphBuilder::callee(MethodId::new("Math", "clamp"), Kind::S32);
        let x = b.scalar_parameter("x", Kind::S32);
        let zero = b.int(0);
        let cond = b.compare(Condition::Lt, x, zero);
        let neg = b.create_block();
        let pos = b.create_block();
        b.branch(cond, neg, pos).unwrap();
        b.switch_to_block(neg);
        b.ret(Some(zero)).unwrap();
        b.switch_to_block(pos);
        b.ret(Some(x)).unwrap();
        b.finish().unwrap()
    }

    fn caller(method: MethodId, kind: Kind) -> (KernelGraph, NodeId) {
        let mut b = GraphBuilder::kernel(MethodId::new("K", "run"));
        let a = b.array_parameter("a", kind);
        let i = b.int(0);
        let x = b.read(a, i, kind).unwrap();
        let call = b.invoke(method, &[x], kind).unwrap();
        b.write(a, i, call).unwrap();
        b.ret(None).unwrap();
        (b.finish().unwrap(), call)
    }

    fn run(graph: &mut KernelGraph, registry: &CalleeRegistry, options: &CompileOptions) -> PhaseResult {
        let device = DeviceDescriptor::gpu("gpu0", 1024);
        let target = create_target(TargetKind::Ptx);
        let ctx = PhaseContext {
            options,
            device: &device,
            target: target.as_ref(),
            callees: registry,
        };
        InliningPhase::new().run(graph, &ctx).unwrap()
    }

    #[test]
    fn test_single_block_callee_inlined() {
        let mut registry = CalleeRegistry::new();
        registry.register(square()).unwrap();
        let (mut graph, call) = caller(MethodId::new("Math", "square"), Kind::F32);

        let result = run(&mut graph, &registry, &CompileOptions::default());
        assert!(result.modified);
        assert_eq!(result.stats["inlined"], 1);
        assert!(!graph.contains(call));
        assert!(!graph.nodes().any(|(_, n)| matches!(n.op, Op::Invoke(_))));
        crate::ir::validation::validate(&graph).unwrap();
    }

    #[test]
    fn test_multi_block_callee_stays_a_call() {
        let mut registry = CalleeRegistry::new();
        registry.register(branching()).unwrap();
        let (mut graph, call) = caller(MethodId::new("Math", "clamp"), Kind::S32);
        let result = run(&mut graph, &registry, &CompileOptions::default());
        assert!(!result.modified);
        assert!(graph.contains(call));
    }

    #[test]
    fn test_disabled_inlining_leaves_calls() {
        let mut registry = CalleeRegistry::new();
        registry.register(square()).unwrap();
        let (mut graph, call) = caller(MethodId::new("Math", "square"), Kind::F32);
        let options = CompileOptions {
            inline: false,
            ..CompileOptions::default()
        };
        run(&mut graph, &registry, &options);
        assert!(graph.contains(call));
    }

    #[test]
    fn test_budget_rejects_large_callee() {
        let model = InliningCostModel { max_nodes: 1 };
        let callee = square();
        assert_eq!(
            model.should_inline(&MethodId::new("K", "run"), Some(&callee)),
            Err(InlineRejection::TooLarge)
        );
    }
}
