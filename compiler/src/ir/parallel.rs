//! Parallel-loop specialization.
//!
//! The front end brackets every parallel loop dimension with range, offset
//! and stride markers. This phase rewrites each marker into thread-identity
//! arithmetic when the device can run that dimension in parallel, or into
//! its plain value when the loop has to stay serial. No marker survives.

use super::optimization::{Phase, PhaseContext, PhaseResult};
use super::{BinaryOp, Intrinsic, Kind, KernelGraph, NodeId, Op};
use crate::config::{DeviceDescriptor, SchedulingStrategy};
use crate::error::{CompileError, CompileResult};
use indexmap::IndexMap;
use tracing::{debug, warn};

#[derive(Debug, Default, Clone, Copy)]
struct Markers {
    range: Option<NodeId>,
    offset: Option<NodeId>,
    stride: Option<NodeId>,
    count: usize,
}

impl Markers {
    fn is_single_triple(&self) -> bool {
        self.count == 3 && self.range.is_some() && self.offset.is_some() && self.stride.is_some()
    }
}

pub struct ParallelSpecializationPhase;

impl ParallelSpecializationPhase {
    pub fn new() -> Self {
        Self
    }

    /// Markers grouped by dimension, in dimension order.
    fn collect(graph: &KernelGraph, device: &DeviceDescriptor) -> CompileResult<IndexMap<u8, Markers>> {
        let mut by_dim: IndexMap<u8, Markers> = IndexMap::new();
        for (id, node) in graph.nodes() {
            let dim = match node.op {
                Op::ParallelRange(d) | Op::ParallelOffset(d) | Op::ParallelStride(d) => d,
                _ => continue,
            };
            if device.max_work_items(dim).is_none() {
                return Err(CompileError::malformed(format!(
                    "parallel marker {} uses dimension {} but device {} reports {} dimension(s)",
                    id,
                    dim,
                    device.id,
                    device.dimensions()
                )));
            }
            let entry = by_dim.entry(dim).or_default();
            entry.count += 1;
            match node.op {
                Op::ParallelRange(_) => entry.range = Some(id),
                Op::ParallelOffset(_) => entry.offset = Some(id),
                _ => entry.stride = Some(id),
            }
        }
        by_dim.sort_keys();
        Ok(by_dim)
    }

    /// Thread-identity intrinsic converted to `kind`.
    fn intrinsic(graph: &mut KernelGraph, intrinsic: Intrinsic, kind: Kind) -> NodeId {
        let value = graph.add_floating(Op::Intrinsic(intrinsic), &[], Kind::S32);
        if kind == Kind::S32 {
            value
        } else {
            graph.add_floating(Op::Convert, &[value], kind)
        }
    }

    fn marker_value(graph: &KernelGraph, marker: NodeId) -> CompileResult<(NodeId, Kind)> {
        let node = graph.node(marker)?;
        let value = node
            .input(0)
            .ok_or_else(|| CompileError::malformed(format!("parallel marker {} has no value", marker)))?;
        Ok((value, node.kind))
    }

    fn stride_value(graph: &KernelGraph, markers: &Markers) -> CompileResult<Option<NodeId>> {
        markers
            .stride
            .map(|marker| Self::marker_value(graph, marker).map(|(value, _)| value))
            .transpose()
    }

    fn replace(graph: &mut KernelGraph, marker: NodeId, value: NodeId) -> CompileResult<()> {
        graph.replace_all_uses(marker, value);
        graph.remove_node(marker)?;
        Ok(())
    }

    /// Every marker becomes its own value.
    fn serialize(graph: &mut KernelGraph, markers: &Markers) -> CompileResult<()> {
        for marker in [markers.range, markers.offset, markers.stride].into_iter().flatten() {
            let (value, _) = Self::marker_value(graph, marker)?;
            Self::replace(graph, marker, value)?;
        }
        Ok(())
    }

    /// Grid-stride loop: start at `(thread_id + offset) * stride`, step by the
    /// thread count. `stride` is the value of the dimension's stride marker.
    fn per_iteration(
        graph: &mut KernelGraph,
        dim: u8,
        markers: &Markers,
        stride: Option<NodeId>,
    ) -> CompileResult<()> {
        if let Some(range) = markers.range {
            let (value, _) = Self::marker_value(graph, range)?;
            Self::replace(graph, range, value)?;
        }
        if let Some(offset) = markers.offset {
            let (value, kind) = Self::marker_value(graph, offset)?;
            let thread = Self::intrinsic(graph, Intrinsic::GlobalThreadId(dim), kind);
            let mut start = graph.add_floating(Op::Binary(BinaryOp::Add), &[thread, value], kind);
            if let Some(stride) = stride {
                start = graph.add_floating(Op::Binary(BinaryOp::Mul), &[start, stride], kind);
            }
            Self::replace(graph, offset, start)?;
        }
        if let Some(stride) = markers.stride {
            let (_, kind) = Self::marker_value(graph, stride)?;
            let threads = Self::intrinsic(graph, Intrinsic::GlobalThreadCount(dim), kind);
            Self::replace(graph, stride, threads)?;
        }
        Ok(())
    }

    /// Contiguous block per thread:
    ///
    /// ```text
    /// block   = ((range / stride - offset) + (threads - 1)) / threads * stride
    /// offset' = thread_id * block
    /// range'  = min((thread_id * block + block) * stride, range)
    /// stride' = stride
    /// ```
    fn per_block(graph: &mut KernelGraph, dim: u8, markers: &Markers) -> CompileResult<()> {
        let (Some(range_marker), Some(offset_marker), Some(stride_marker)) =
            (markers.range, markers.offset, markers.stride)
        else {
            let stride = Self::stride_value(graph, markers)?;
            return Self::per_iteration(graph, dim, markers, stride);
        };
        let (range, kind) = Self::marker_value(graph, range_marker)?;
        let (offset, _) = Self::marker_value(graph, offset_marker)?;
        let (stride, _) = Self::marker_value(graph, stride_marker)?;

        let thread = Self::intrinsic(graph, Intrinsic::GlobalThreadId(dim), kind);
        let threads = Self::intrinsic(graph, Intrinsic::GlobalThreadCount(dim), kind);
        let one = graph.add_floating(Op::Constant(super::Constant::Int(1)), &[], kind);

        let mut binary = |op: BinaryOp, a: NodeId, b: NodeId| {
            graph.add_floating(Op::Binary(op), &[a, b], kind)
        };
        let iterations = binary(BinaryOp::Div, range, stride);
        let remaining = binary(BinaryOp::Sub, iterations, offset);
        let threads_minus_one = binary(BinaryOp::Sub, threads, one);
        let rounded = binary(BinaryOp::Add, remaining, threads_minus_one);
        let per_thread = binary(BinaryOp::Div, rounded, threads);
        let block = binary(BinaryOp::Mul, per_thread, stride);
        let start = binary(BinaryOp::Mul, thread, block);
        let end = binary(BinaryOp::Add, start, block);
        let scaled_end = binary(BinaryOp::Mul, end, stride);
        let bound = binary(BinaryOp::Min, scaled_end, range);

        Self::replace(graph, offset_marker, start)?;
        Self::replace(graph, range_marker, bound)?;
        Self::replace(graph, stride_marker, stride)?;
        Ok(())
    }
}

impl Default for ParallelSpecializationPhase {
    fn default() -> Self {
        Self::new()
    }
}

impl Phase for ParallelSpecializationPhase {
    fn name(&self) -> &'static str {
        "parallel-specialization"
    }

    fn run(&mut self, graph: &mut KernelGraph, ctx: &PhaseContext<'_>) -> CompileResult<PhaseResult> {
        let by_dim = Self::collect(graph, ctx.device)?;
        if by_dim.is_empty() {
            return Ok(PhaseResult::unchanged());
        }

        let mut parallel = 0;
        let mut serial = 0;
        let mut strides: IndexMap<u8, NodeId> = IndexMap::new();
        for (&dim, markers) in &by_dim {
            let stride = Self::stride_value(graph, markers)?;
            if let Some(stride) = stride {
                strides.insert(dim, stride);
            }
            let units = ctx.device.max_work_items(dim).unwrap_or(1);
            if !ctx.options.parallelize || units <= 1 {
                if ctx.options.parallelize {
                    warn!(
                        method = %graph.method,
                        device = %ctx.device.id,
                        dim,
                        "device has a single unit on this dimension, loop runs serially"
                    );
                }
                Self::serialize(graph, markers)?;
                serial += 1;
                continue;
            }
            match ctx.device.scheduling {
                SchedulingStrategy::PerBlock if markers.is_single_triple() => {
                    Self::per_block(graph, dim, markers)?
                }
                SchedulingStrategy::PerBlock => {
                    debug!(dim, markers = markers.count, "incomplete marker set, using grid-stride");
                    Self::per_iteration(graph, dim, markers, stride)?
                }
                SchedulingStrategy::PerIteration => Self::per_iteration(graph, dim, markers, stride)?,
            }
            parallel += 1;
        }

        // markers of a dimension seen more than once
        let leftovers: Vec<NodeId> = graph
            .nodes()
            .filter(|(_, n)| n.op.is_parallel_marker())
            .map(|(id, _)| id)
            .collect();
        for marker in leftovers {
            let dim = match graph.op(marker)? {
                Op::ParallelRange(d) | Op::ParallelOffset(d) | Op::ParallelStride(d) => *d,
                _ => continue,
            };
            let mut single = Markers::default();
            match graph.op(marker)? {
                Op::ParallelRange(_) => single.range = Some(marker),
                Op::ParallelOffset(_) => single.offset = Some(marker),
                _ => single.stride = Some(marker),
            }
            let units = ctx.device.max_work_items(dim).unwrap_or(1);
            if ctx.options.parallelize && units > 1 {
                Self::per_iteration(graph, dim, &single, strides.get(&dim).copied())?;
            } else {
                Self::serialize(graph, &single)?;
            }
        }

        Ok(PhaseResult::changed()
            .stat("parallel_dimensions", parallel)
            .stat("serial_dimensions", serial))
    }
}
