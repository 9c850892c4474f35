//! Kernel Graph Validation
//!
//! Structural checks run on every graph handed over by the front end and
//! again (in debug builds) after each tier. Problems are collected and
//! reported together as one malformed-graph error.

use super::graph::Terminator;
use super::{BlockId, Constant, Kind, KernelGraph, NodeId, Op};
use crate::error::{CompileError, CompileResult};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    DanglingInput { node: NodeId, input: NodeId },
    DanglingTerminatorInput { block: BlockId, input: NodeId },
    UnknownSuccessor { block: BlockId, successor: BlockId },
    EntryHasPredecessors,
    PhiArity { phi: NodeId, inputs: usize, predecessors: usize },
    /// A branch or switch edge enters a block with phis.
    BranchIntoMerge { from: BlockId, to: BlockId },
    SwitchShape { block: BlockId, reason: String },
    LaneSelectOnScalar { node: NodeId, operand: NodeId },
    LaneOutOfRange { node: NodeId, lane: u8, lanes: u8 },
    VectorArity { node: NodeId, inputs: usize, lanes: u8 },
    BadDimension { node: NodeId, dim: u8 },
    UnknownParameter { node: NodeId, index: u32 },
    OperandKindMismatch { node: NodeId, left: Kind, right: Kind },
    MisplacedFixedNode { node: NodeId, block: BlockId },
    ConditionKind { block: BlockId, kind: Kind },
    ConstantKind { node: NodeId, value: Constant, kind: Kind },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::DanglingInput { node, input } => {
                write!(f, "{} uses removed node {}", node, input)
            }
            ValidationError::DanglingTerminatorInput { block, input } => {
                write!(f, "terminator of {} uses removed node {}", block, input)
            }
            ValidationError::UnknownSuccessor { block, successor } => {
                write!(f, "{} branches to unknown block {}", block, successor)
            }
            ValidationError::EntryHasPredecessors => {
                write!(f, "entry block must not have predecessors")
            }
            ValidationError::PhiArity {
                phi,
                inputs,
                predecessors,
            } => write!(
                f,
                "phi {} has {} inputs for {} predecessors",
                phi, inputs, predecessors
            ),
            ValidationError::BranchIntoMerge { from, to } => write!(
                f,
                "conditional edge {} -> {} enters a block with phis",
                from, to
            ),
            ValidationError::SwitchShape { block, reason } => {
                write!(f, "switch in {}: {}", block, reason)
            }
            ValidationError::LaneSelectOnScalar { node, operand } => write!(
                f,
                "lane select {} references non-vector operand {}",
                node, operand
            ),
            ValidationError::LaneOutOfRange { node, lane, lanes } => write!(
                f,
                "{} selects lane {} of a {}-lane vector",
                node, lane, lanes
            ),
            ValidationError::VectorArity {
                node,
                inputs,
                lanes,
            } => write!(
                f,
                "vector {} has {} lane inputs for {} lanes",
                node, inputs, lanes
            ),
            ValidationError::BadDimension { node, dim } => {
                write!(f, "{} uses parallel dimension {}", node, dim)
            }
            ValidationError::UnknownParameter { node, index } => {
                write!(f, "{} reads undeclared parameter {}", node, index)
            }
            ValidationError::OperandKindMismatch { node, left, right } => write!(
                f,
                "{} combines operands of kind {} and {}",
                node, left, right
            ),
            ValidationError::MisplacedFixedNode { node, block } => {
                write!(f, "fixed node {} listed in {} but owned elsewhere", node, block)
            }
            ValidationError::ConditionKind { block, kind } => {
                write!(f, "branch condition of {} has kind {}", block, kind)
            }
            ValidationError::ConstantKind { node, value, kind } => {
                write!(f, "constant {} holds {} which is not a {}", node, value, kind)
            }
        }
    }
}

/// Collect every structural problem of `graph`.
pub fn check(graph: &KernelGraph) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if !graph
        .block(graph.entry())
        .map(|b| b.predecessors.is_empty())
        .unwrap_or(false)
    {
        errors.push(ValidationError::EntryHasPredecessors);
    }

    for (id, node) in graph.nodes() {
        for &input in &node.inputs {
            if !graph.contains(input) {
                errors.push(ValidationError::DanglingInput { node: id, input });
            }
        }
        check_node(graph, id, &mut errors);
    }

    for block in graph.blocks() {
        for &input in &block.terminator.inputs() {
            if !graph.contains(input) {
                errors.push(ValidationError::DanglingTerminatorInput {
                    block: block.id,
                    input,
                });
            }
        }
        for succ in block.terminator.successors() {
            match graph.block(succ) {
                Err(_) => errors.push(ValidationError::UnknownSuccessor {
                    block: block.id,
                    successor: succ,
                }),
                Ok(target) => {
                    let conditional = !matches!(block.terminator, Terminator::Jump(_));
                    if conditional && !target.phis.is_empty() {
                        errors.push(ValidationError::BranchIntoMerge {
                            from: block.id,
                            to: succ,
                        });
                    }
                }
            }
        }
        for &phi in &block.phis {
            if let Some(node) = graph.get(phi) {
                if node.inputs.len() != block.predecessors.len() {
                    errors.push(ValidationError::PhiArity {
                        phi,
                        inputs: node.inputs.len(),
                        predecessors: block.predecessors.len(),
                    });
                }
            }
        }
        for &fixed in &block.fixed {
            if graph.get(fixed).and_then(|n| n.block) != Some(block.id) {
                errors.push(ValidationError::MisplacedFixedNode {
                    node: fixed,
                    block: block.id,
                });
            }
        }
        match &block.terminator {
            Terminator::Switch { keys, targets, .. } => {
                if keys.len() != targets.len() {
                    errors.push(ValidationError::SwitchShape {
                        block: block.id,
                        reason: format!("{} keys for {} targets", keys.len(), targets.len()),
                    });
                }
                let mut sorted = keys.clone();
                sorted.sort_unstable();
                sorted.dedup();
                if sorted.len() != keys.len() {
                    errors.push(ValidationError::SwitchShape {
                        block: block.id,
                        reason: "duplicate case keys".to_string(),
                    });
                }
            }
            Terminator::If { condition, .. } => {
                if let Some(node) = graph.get(*condition) {
                    if !(node.kind.is_predicate() || node.kind.scalar().map_or(false, |s| s.is_integer())) {
                        errors.push(ValidationError::ConditionKind {
                            block: block.id,
                            kind: node.kind,
                        });
                    }
                }
            }
            _ => {}
        }
    }

    errors
}

fn check_node(graph: &KernelGraph, id: NodeId, errors: &mut Vec<ValidationError>) {
    let Some(node) = graph.get(id) else {
        return;
    };
    let input_kind = |i: usize| node.input(i).and_then(|n| graph.get(n)).map(|n| n.kind);
    match &node.op {
        Op::Constant(value) => {
            let fits = match node.kind {
                Kind::Scalar(s) => value.fits(s),
                _ => false,
            };
            if !fits {
                errors.push(ValidationError::ConstantKind {
                    node: id,
                    value: *value,
                    kind: node.kind,
                });
            }
        }
        Op::VectorElement(lane) | Op::VectorLaneStore(lane) => {
            if let (Some(vector), Some(kind)) = (node.input(0), input_kind(0)) {
                match kind {
                    Kind::Vector { lanes, .. } if *lane >= lanes => {
                        errors.push(ValidationError::LaneOutOfRange {
                            node: id,
                            lane: *lane,
                            lanes,
                        })
                    }
                    Kind::Vector { .. } => {}
                    _ => errors.push(ValidationError::LaneSelectOnScalar {
                        node: id,
                        operand: vector,
                    }),
                }
            }
        }
        Op::VectorValue => {
            if let Kind::Vector { lanes, .. } = node.kind {
                // a vector-kinded first operand is copied whole
                let first_is_vector = input_kind(0).map_or(false, Kind::is_vector);
                if !first_is_vector && node.inputs.len() != lanes as usize {
                    errors.push(ValidationError::VectorArity {
                        node: id,
                        inputs: node.inputs.len(),
                        lanes,
                    });
                }
            }
        }
        Op::ParallelRange(dim) | Op::ParallelOffset(dim) | Op::ParallelStride(dim) if *dim > 2 => {
            errors.push(ValidationError::BadDimension { node: id, dim: *dim })
        }
        Op::Intrinsic(intrinsic) if intrinsic.dim() > 2 => errors.push(ValidationError::BadDimension {
            node: id,
            dim: intrinsic.dim(),
        }),
        Op::Parameter(index) if *index as usize >= graph.parameters.len() => {
            errors.push(ValidationError::UnknownParameter {
                node: id,
                index: *index,
            })
        }
        Op::Binary(op) if !op.is_shift() => {
            if let (Some(left), Some(right)) = (input_kind(0), input_kind(1)) {
                if left != right {
                    errors.push(ValidationError::OperandKindMismatch {
                        node: id,
                        left,
                        right,
                    });
                }
            }
        }
        Op::Compare(_) => {
            if let (Some(left), Some(right)) = (input_kind(0), input_kind(1)) {
                if left != right {
                    errors.push(ValidationError::OperandKindMismatch {
                        node: id,
                        left,
                        right,
                    });
                }
            }
        }
        _ => {}
    }
}

/// Fail with a malformed-graph error listing every problem found.
pub fn validate(graph: &KernelGraph) -> CompileResult<()> {
    let errors = check(graph);
    if errors.is_empty() {
        return Ok(());
    }
    let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    Err(CompileError::malformed(format!(
        "{}: {}",
        graph.method,
        messages.join("; ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{GraphBuilder, MethodId, ScalarKind};

    #[test]
    fn test_lane_select_on_scalar_is_malformed() {
        let mut b = GraphBuilder::kernel(MethodId::new("T", "k"));
        let x = b.float(1.0);
        b.lane(x, 0);
        b.ret(None).unwrap();
        let err = b.finish().unwrap_err();
        assert!(matches!(err, CompileError::Malformed(_)));
        assert!(err.to_string().contains("non-vector operand"));
    }

    #[test]
    fn test_lane_out_of_range() {
        let mut b = GraphBuilder::kernel(MethodId::new("T", "k"));
        let x = b.float(1.0);
        let v = b.vector(&[x, x], Kind::vector(ScalarKind::F32, 2));
        b.lane(v, 2);
        b.ret(None).unwrap();
        assert!(b.finish().is_err());
    }

    #[test]
    fn test_branch_into_merge_rejected() {
        //   entry --if--> merge(phi)
        //     \            ^
        //      +-> other --+
        let mut b = GraphBuilder::kernel(MethodId::new("T", "k"));
        let cond = b.boolean(true);
        let merge = b.create_block();
        let other = b.create_block();
        b.branch(cond, merge, other).unwrap();
        b.switch_to_block(other);
        b.jump(merge).unwrap();
        b.switch_to_block(merge);
        let one = b.int(1);
        b.phi(merge, &[one, one], Kind::S32).unwrap();
        b.ret(None).unwrap();
        let err = b.finish().unwrap_err();
        assert!(err.to_string().contains("enters a block with phis"));
    }

    #[test]
    fn test_duplicate_switch_keys_rejected() {
        let mut b = GraphBuilder::kernel(MethodId::new("T", "k"));
        let v = b.int(3);
        let a = b.create_block();
        let d = b.create_block();
        b.switch(v, &[1, 1], &[a, a], d).unwrap();
        for block in [a, d] {
            b.switch_to_block(block);
            b.ret(None).unwrap();
        }
        assert!(b.finish().unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn test_constant_payload_must_match_kind() {
        let mut b = GraphBuilder::kernel(MethodId::new("T", "k"));
        let a = b.array_parameter("a", Kind::S32);
        let i = b.int(0);
        let v = b.constant(Constant::float(2.5), Kind::S32);
        b.write(a, i, v).unwrap();
        b.ret(None).unwrap();
        let err = b.finish().unwrap_err();
        assert!(matches!(err, CompileError::Malformed(_)));
        assert!(err.to_string().contains("is not a s32"));

        let mut b = GraphBuilder::kernel(MethodId::new("T", "k"));
        b.constant(Constant::Int(3), Kind::F32);
        b.ret(None).unwrap();
        assert!(b.finish().is_err());

        let mut b = GraphBuilder::kernel(MethodId::new("T", "k"));
        b.constant(Constant::Int(1), Kind::PRED);
        b.constant(Constant::Bool(true), Kind::U8);
        b.ret(None).unwrap();
        assert!(b.finish().is_ok());
    }

    #[test]
    fn test_mixed_operand_kinds_rejected() {
        let mut b = GraphBuilder::kernel(MethodId::new("T", "k"));
        let x = b.int(1);
        let y = b.long(2);
        b.add(x, y);
        b.ret(None).unwrap();
        assert!(b.finish().unwrap_err().to_string().contains("combines operands"));
    }
}
