//! Tier pipeline: High -> Mid -> Low
//!
//! Each tier is a [`PhaseSuite`] built once per compile unit. The order of
//! the phases is fixed here and shared by every target; targets only
//! influence phases through the [`PhaseContext`].
//!
//! High tier:
//! 1. canonicalize, inline, dead code, escape analysis, canonicalize
//! 2. reductions, parallel-loop specialization, intrinsic and vector lowering
//! 3. canonicalize, full unrolling, canonicalize, dead code
//! 4. earliest schedule
//!
//! The earliest schedule only proves the high-tier graph can be scheduled.
//! Nothing reads it: the first node removal in the mid tier drops it, and
//! floating reads anchor to their own block instead.
//!
//! Mid tier: redundant phis, guards and frame states, floating reads.
//!
//! Low tier: address lowering, null checks, canonicalize, dead code, latest
//! out-of-loops schedule.

use crate::error::CompileResult;
use crate::ir::escape_analysis::EscapeAnalysisPhase;
use crate::ir::inlining::InliningPhase;
use crate::ir::loop_unroll::LoopUnrollPhase;
use crate::ir::lowering::{AddressLoweringPhase, ExceptionEliminationPhase, NullCheckEliminationPhase};
use crate::ir::memory::{FloatingReadPhase, RedundantPhiEliminationPhase};
use crate::ir::optimization::{
    CanonicalizerPhase, DeadCodeEliminationPhase, PhaseContext, PhaseResult, PhaseSuite,
};
use crate::ir::parallel::ParallelSpecializationPhase;
use crate::ir::reduction::ReductionPhase;
use crate::ir::scheduling::{SchedulePhase, ScheduleStrategy};
use crate::ir::vectorization::{IntrinsicLoweringPhase, VectorLoweringPhase};
use crate::ir::KernelGraph;
use serde::Serialize;
use std::time::Instant;
use tracing::info;

/// Statistics collected while running the tiers on one graph
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    /// High tier time in microseconds
    pub high_tier_time_us: u64,

    /// Mid tier time in microseconds
    pub mid_tier_time_us: u64,

    /// Low tier time in microseconds
    pub low_tier_time_us: u64,

    pub phases_run: usize,

    pub nodes_eliminated: usize,

    pub blocks_eliminated: usize,

    /// Nodes left after the low tier
    pub final_nodes: usize,
}

impl PipelineStats {
    pub fn total_time_us(&self) -> u64 {
        self.high_tier_time_us + self.mid_tier_time_us + self.low_tier_time_us
    }

    fn record(&mut self, result: &PhaseResult) {
        self.nodes_eliminated += result.nodes_eliminated;
        self.blocks_eliminated += result.blocks_eliminated;
    }
}

pub fn high_tier() -> PhaseSuite {
    let mut suite = PhaseSuite::new("high");
    suite.add_phase(CanonicalizerPhase::new());
    suite.add_phase(InliningPhase::new());
    suite.add_phase(DeadCodeEliminationPhase::new());
    suite.add_phase(EscapeAnalysisPhase::new());
    suite.add_phase(CanonicalizerPhase::new());
    suite.add_phase(ReductionPhase::new());
    suite.add_phase(ParallelSpecializationPhase::new());
    suite.add_phase(IntrinsicLoweringPhase::new());
    suite.add_phase(VectorLoweringPhase::new());
    suite.add_phase(CanonicalizerPhase::new());
    suite.add_phase(LoopUnrollPhase::new());
    suite.add_phase(CanonicalizerPhase::new());
    suite.add_phase(DeadCodeEliminationPhase::new());
    suite.add_phase(SchedulePhase::new(ScheduleStrategy::Earliest));
    suite
}

pub fn mid_tier() -> PhaseSuite {
    let mut suite = PhaseSuite::new("mid");
    suite.add_phase(RedundantPhiEliminationPhase::new());
    suite.add_phase(ExceptionEliminationPhase::new());
    suite.add_phase(FloatingReadPhase::new());
    suite
}

pub fn low_tier() -> PhaseSuite {
    let mut suite = PhaseSuite::new("low");
    suite.add_phase(AddressLoweringPhase::new());
    suite.add_phase(NullCheckEliminationPhase::new());
    suite.add_phase(CanonicalizerPhase::new());
    suite.add_phase(DeadCodeEliminationPhase::new());
    suite.add_phase(SchedulePhase::new(ScheduleStrategy::LatestOutOfLoops));
    suite
}

/// The three tiers in order.
pub struct TierPipeline {
    tiers: [PhaseSuite; 3],
}

impl TierPipeline {
    pub fn new() -> Self {
        Self {
            tiers: [high_tier(), mid_tier(), low_tier()],
        }
    }

    /// Phase names per tier, in execution order.
    pub fn describe(&self) -> Vec<(&'static str, Vec<&'static str>)> {
        self.tiers
            .iter()
            .map(|tier| (tier.name(), tier.phase_names()))
            .collect()
    }

    /// Run every tier over `graph`. On success the graph carries a
    /// latest-out-of-loops schedule and is ready for instruction selection.
    pub fn run(&mut self, graph: &mut KernelGraph, ctx: &PhaseContext<'_>) -> CompileResult<PipelineStats> {
        let mut stats = PipelineStats::default();
        for (index, tier) in self.tiers.iter_mut().enumerate() {
            let start = Instant::now();
            let result = tier.run(graph, ctx)?;
            let elapsed = start.elapsed().as_micros() as u64;
            match index {
                0 => stats.high_tier_time_us = elapsed,
                1 => stats.mid_tier_time_us = elapsed,
                _ => stats.low_tier_time_us = elapsed,
            }
            stats.phases_run += tier.phase_names().len();
            stats.record(&result);
            info!(
                tier = tier.name(),
                method = %graph.method,
                modified = result.modified,
                time_us = elapsed,
                "tier finished"
            );
        }
        stats.final_nodes = graph.nodes().count();
        Ok(stats)
    }
}

impl Default for TierPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::target::{create_target, TargetKind};
    use crate::config::{CompileOptions, DeviceDescriptor};
    use crate::ir::inlining::CalleeRegistry;
    use crate::ir::{GraphBuilder, Kind, MethodId, Op};

    #[test]
    fn test_tier_order() {
        let pipeline = TierPipeline::new();
        let tiers = pipeline.describe();
        assert_eq!(tiers.len(), 3);
        let high = &tiers[0].1;
        let position = |name: &str| high.iter().position(|p| *p == name).unwrap();
        assert!(position("parallel-specialization") < position("full-unroll"));
        assert!(position("reductions") < position("parallel-specialization"));
        assert_eq!(high.last(), Some(&"schedule-earliest"));
        assert_eq!(tiers[2].1.last(), Some(&"schedule-latest"));
    }

    #[test]
    fn test_high_tier_ends_with_earliest_schedule() {
        let mut b = GraphBuilder::kernel(MethodId::new("T", "sum"));
        let a = b.array_parameter("a", Kind::S32);
        let zero = b.int(0);
        let x = b.read(a, zero, Kind::S32).unwrap();
        let y = b.add(x, x);
        b.write(a, zero, y).unwrap();
        b.ret(None).unwrap();
        let mut graph = b.finish().unwrap();

        let options = CompileOptions::default();
        let device = DeviceDescriptor::gpu("gpu0", 256);
        let target = create_target(TargetKind::Ptx);
        let callees = CalleeRegistry::new();
        let ctx = PhaseContext {
            options: &options,
            device: &device,
            target: target.as_ref(),
            callees: &callees,
        };
        high_tier().run(&mut graph, &ctx).unwrap();
        let schedule = graph.schedule().unwrap();
        assert_eq!(schedule.strategy(), ScheduleStrategy::Earliest);
        assert!(schedule.block_of(y).is_some());
    }

    #[test]
    fn test_pipeline_leaves_a_schedule() {
        let mut b = GraphBuilder::kernel(MethodId::new("T", "store"));
        let a = b.array_parameter("a", Kind::S32);
        let zero = b.int(0);
        let seven = b.int(7);
        b.write(a, zero, seven).unwrap();
        b.ret(None).unwrap();
        let mut graph = b.finish().unwrap();

        let options = CompileOptions::default();
        let device = DeviceDescriptor::gpu("gpu0", 256);
        let target = create_target(TargetKind::OpenCl);
        let callees = CalleeRegistry::new();
        let ctx = PhaseContext {
            options: &options,
            device: &device,
            target: target.as_ref(),
            callees: &callees,
        };
        let stats = TierPipeline::new().run(&mut graph, &ctx).unwrap();
        let schedule = graph.schedule().unwrap();
        assert_eq!(schedule.strategy(), ScheduleStrategy::LatestOutOfLoops);
        assert!(stats.phases_run > 15);
        assert!(graph
            .nodes()
            .all(|(_, node)| !matches!(node.op, Op::Write { region: None })));
    }
}
