//! Kernel IR
//!
//! The architecture-neutral graph handed over by the front end, plus every
//! tier phase that rewrites it before instruction selection.
//!
//! Nodes live in an arena inside [`KernelGraph`] and are addressed with
//! generation-checked [`NodeId`] handles, so a phase that keeps a handle to a
//! removed node gets an error instead of silently reading a reused slot.

pub mod builder;
pub mod dump;
pub mod escape_analysis;
pub mod graph;
pub mod inlining;
pub mod kinds;
pub mod loop_analysis;
pub mod loop_unroll;
pub mod lowering;
pub mod memory;
pub mod nodes;
pub mod optimization;
pub mod parallel;
pub mod reduction;
pub mod scheduling;
pub mod validation;
pub mod vectorization;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use builder::GraphBuilder;
pub use graph::{Block, KernelGraph, LocalSlot, ParamType, ParameterDecl, Terminator, Usage};
pub use kinds::{ElementType, Kind, ScalarKind};
pub use nodes::{
    AtomicOp, BarrierScope, BinaryOp, Builtin, Condition, Constant, Intrinsic, MethodId, Node, Op,
    Region, UnaryOp,
};
pub use scheduling::Schedule;

/// Handle to a node in a [`KernelGraph`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    pub index: u32,
    pub generation: u32,
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.index)
    }
}

/// Basic block identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn entry() -> Self {
        BlockId(0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}
