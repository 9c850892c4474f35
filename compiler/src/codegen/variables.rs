//! Per-kind symbolic variable allocation.
//!
//! Kernels are compiled to unbounded symbolic registers; the device driver
//! does physical allocation. The n-th variable requested for a kind is named
//! `prefix(kind) + n`, with `n` counted per kind from 0 within one compile
//! unit.

use super::lir::Variable;
use super::target::TargetDescription;
use crate::ir::{Kind, NodeId};
use fxhash::FxHashMap;
use indexmap::IndexMap;

pub struct VariableAllocator<'t> {
    target: &'t dyn TargetDescription,
    by_kind: IndexMap<Kind, Vec<Variable>>,
    by_node: FxHashMap<NodeId, Variable>,
}

impl<'t> VariableAllocator<'t> {
    pub fn new(target: &'t dyn TargetDescription) -> Self {
        Self {
            target,
            by_kind: IndexMap::new(),
            by_node: FxHashMap::default(),
        }
    }

    /// A fresh variable of `kind`.
    pub fn allocate(&mut self, kind: Kind) -> Variable {
        let vars = self.by_kind.entry(kind).or_default();
        let index = vars.len() as u32;
        let variable = Variable {
            kind,
            index,
            name: format!("{}{}", self.target.variable_prefix(kind), index),
        };
        vars.push(variable.clone());
        variable
    }

    /// The variable holding `node`, allocated on first request.
    pub fn for_node(&mut self, node: NodeId, kind: Kind) -> Variable {
        if let Some(existing) = self.by_node.get(&node) {
            return existing.clone();
        }
        let variable = self.allocate(kind);
        self.by_node.insert(node, variable.clone());
        variable
    }

    pub fn get(&self, node: NodeId) -> Option<&Variable> {
        self.by_node.get(&node)
    }

    pub fn count(&self, kind: Kind) -> u32 {
        self.by_kind.get(&kind).map_or(0, |v| v.len() as u32)
    }

    /// Declarations grouped per kind, kinds in first-use order.
    pub fn into_declarations(self) -> Vec<(Kind, Vec<Variable>)> {
        self.by_kind.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::target::{create_target, TargetKind};
    use crate::ir::ScalarKind;

    fn node(index: u32) -> NodeId {
        NodeId {
            index,
            generation: 0,
        }
    }

    #[test]
    fn test_indices_count_per_kind() {
        let target = create_target(TargetKind::Ptx);
        let mut vars = VariableAllocator::new(target.as_ref());
        let a = vars.allocate(Kind::S32);
        let p = vars.allocate(Kind::PRED);
        let b = vars.allocate(Kind::S32);
        assert_eq!(a.name, "rsi0");
        assert_eq!(b.name, "rsi1");
        assert_eq!(p.name, "rpb0");
        assert_eq!(vars.count(Kind::S32), 2);
    }

    #[test]
    fn test_node_variables_allocated_once() {
        let target = create_target(TargetKind::OpenCl);
        let mut vars = VariableAllocator::new(target.as_ref());
        let first = vars.for_node(node(4), Kind::F32);
        let again = vars.for_node(node(4), Kind::F32);
        let other = vars.for_node(node(5), Kind::F32);
        assert_eq!(first, again);
        assert_eq!(first.name, "f_0");
        assert_eq!(other.name, "f_1");
        assert_eq!(vars.count(Kind::F32), 2);
    }

    #[test]
    fn test_declarations_keep_first_use_order() {
        let target = create_target(TargetKind::Ptx);
        let mut vars = VariableAllocator::new(target.as_ref());
        vars.allocate(Kind::F64);
        vars.allocate(Kind::vector(ScalarKind::F32, 4));
        vars.allocate(Kind::F64);
        let decls = vars.into_declarations();
        assert_eq!(decls.len(), 2);
        assert_eq!(decls[0].0, Kind::F64);
        assert_eq!(decls[0].1.len(), 2);
        assert_eq!(decls[1].1[0].name, "rv4fi0");
    }
}
