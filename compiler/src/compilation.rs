//! Compilation driver
//!
//! [`KernelCompiler`] owns one target description, the compile options, the
//! callee bodies available for inlining and the result cache. A compile runs
//! the tier pipeline on a private copy of the graph, generates LIR, assembles
//! it and packages the payload together with the parameter table and the
//! callees that stayed calls.

use crate::cache::{CacheKey, CompilationCache};
use crate::codegen::block_emitter;
use crate::codegen::calling_convention::{symbol_name, ParamBinding};
use crate::codegen::target::{create_target, Payload, TargetDescription, TargetKind};
use crate::config::{CompileOptions, DeviceDescriptor};
use crate::error::{CompileError, CompileResult};
use crate::ir::inlining::CalleeRegistry;
use crate::ir::optimization::PhaseContext;
use crate::ir::validation::validate;
use crate::ir::{KernelGraph, MethodId};
use crate::pipeline::{PipelineStats, TierPipeline};
use indexmap::IndexSet;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// A compiled unit, ready for the device runtime.
#[derive(Debug, Clone, Serialize)]
pub struct CompilationResult {
    pub entry_name: String,
    pub method: MethodId,
    pub target: TargetKind,
    pub device: String,
    pub is_kernel: bool,
    pub payload: Payload,
    pub parameters: Vec<ParamBinding>,
    /// Callees that were not inlined and need their own compile unit
    pub callees: Vec<MethodId>,
    #[serde(skip)]
    pub stats: PipelineStats,
}

#[derive(Serialize)]
struct Metadata<'a> {
    entry_name: &'a str,
    method: String,
    target: TargetKind,
    device: &'a str,
    kernel: bool,
    parameters: &'a [ParamBinding],
    callees: Vec<String>,
}

impl CompilationResult {
    pub fn source(&self) -> Option<&str> {
        self.payload.as_text()
    }

    /// Launch metadata for the device runtime as JSON.
    pub fn metadata_json(&self) -> CompileResult<String> {
        let metadata = Metadata {
            entry_name: &self.entry_name,
            method: self.method.to_string(),
            target: self.target,
            device: &self.device,
            kernel: self.is_kernel,
            parameters: &self.parameters,
            callees: self.callees.iter().map(|m| m.to_string()).collect(),
        };
        serde_json::to_string_pretty(&metadata)
            .map_err(|e| CompileError::Internal(format!("metadata serialization: {}", e)))
    }
}

/// Supplies graphs for callees that were not inlined.
pub trait SketchProvider {
    fn sketch(&self, method: &MethodId) -> Option<KernelGraph>;
}

impl SketchProvider for CalleeRegistry {
    fn sketch(&self, method: &MethodId) -> Option<KernelGraph> {
        self.get(method).cloned()
    }
}

impl<F> SketchProvider for F
where
    F: Fn(&MethodId) -> Option<KernelGraph>,
{
    fn sketch(&self, method: &MethodId) -> Option<KernelGraph> {
        self(method)
    }
}

/// A kernel and every callee it transitively needs.
#[derive(Debug, Clone)]
pub struct CompiledProgram {
    pub kernel: Arc<CompilationResult>,
    /// In discovery order
    pub callees: Vec<Arc<CompilationResult>>,
}

impl CompiledProgram {
    /// Text payloads joined with the deepest callee first and the kernel
    /// last. `None` for binary targets.
    pub fn linked_source(&self) -> Option<String> {
        let mut parts = Vec::with_capacity(self.callees.len() + 1);
        for unit in self.callees.iter().rev() {
            parts.push(unit.source()?);
        }
        parts.push(self.kernel.source()?);
        Some(parts.join("\n"))
    }

    pub fn units(&self) -> impl Iterator<Item = &Arc<CompilationResult>> {
        std::iter::once(&self.kernel).chain(self.callees.iter())
    }
}

pub struct KernelCompiler {
    target: Box<dyn TargetDescription>,
    options: CompileOptions,
    callees: CalleeRegistry,
    cache: CompilationCache,
    anonymous: AtomicU64,
}

impl KernelCompiler {
    pub fn new(target: TargetKind) -> Self {
        Self {
            target: create_target(target),
            options: CompileOptions::default(),
            callees: CalleeRegistry::new(),
            cache: CompilationCache::new(),
            anonymous: AtomicU64::new(0),
        }
    }

    pub fn with_options(target: TargetKind, options: CompileOptions) -> CompileResult<Self> {
        options.validate()?;
        let mut compiler = Self::new(target);
        compiler.options = options;
        Ok(compiler)
    }

    pub fn target(&self) -> &dyn TargetDescription {
        self.target.as_ref()
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    pub fn cache(&self) -> &CompilationCache {
        &self.cache
    }

    /// Make `graph` available for inlining and as a callee sketch.
    pub fn register_callee(&mut self, graph: KernelGraph) -> CompileResult<()> {
        self.callees.register(graph)
    }

    pub fn callees(&self) -> &CalleeRegistry {
        &self.callees
    }

    /// Entry symbol for `method`; anonymous methods draw a fresh number.
    fn entry_name(&self, method: &MethodId) -> String {
        symbol_name(method).unwrap_or_else(|| {
            format!("kernel_{}", self.anonymous.fetch_add(1, Ordering::Relaxed))
        })
    }

    /// Compile `graph` for `device`, sharing results per (method, device).
    /// Anonymous methods have no stable identity and are never cached.
    pub fn compile(&self, graph: &KernelGraph, device: &DeviceDescriptor) -> CompileResult<Arc<CompilationResult>> {
        if graph.method.name.is_none() {
            return self.compile_uncached(graph, device).map(Arc::new);
        }
        let key = CacheKey::new(graph.method.clone(), device.id.clone());
        self.cache
            .get_or_compile(key, || self.compile_uncached(graph, device))
    }

    /// One full compile, bypassing the cache.
    pub fn compile_uncached(&self, graph: &KernelGraph, device: &DeviceDescriptor) -> CompileResult<CompilationResult> {
        let start = Instant::now();
        info!(
            method = %graph.method,
            target = self.target.name(),
            device = %device.id,
            kernel = graph.is_kernel,
            "compiling"
        );
        let result = self.run(graph, device);
        match &result {
            Ok(unit) => info!(
                entry = %unit.entry_name,
                bytes = unit.payload.len(),
                callees = unit.callees.len(),
                time_us = start.elapsed().as_micros() as u64,
                "compiled"
            ),
            Err(e) => error!(method = %graph.method, code = e.code(), "compile failed: {}", e),
        }
        result
    }

    fn run(&self, graph: &KernelGraph, device: &DeviceDescriptor) -> CompileResult<CompilationResult> {
        device.validate()?;
        validate(graph)?;
        let mut graph = graph.clone();
        let ctx = PhaseContext {
            options: &self.options,
            device,
            target: self.target.as_ref(),
            callees: &self.callees,
        };
        let stats = TierPipeline::new().run(&mut graph, &ctx)?;
        let entry_name = self.entry_name(&graph.method);
        let (unit, payload) =
            block_emitter::emit(&graph, self.target.as_ref(), &self.options, device, &entry_name)?;
        Ok(CompilationResult {
            entry_name,
            method: graph.method.clone(),
            target: self.target.kind(),
            device: device.id.clone(),
            is_kernel: graph.is_kernel,
            payload,
            parameters: unit.parameters,
            callees: unit.callees.into_iter().map(|c| c.method).collect(),
            stats,
        })
    }

    /// Compile `graph` and every callee that stayed a call, transitively.
    pub fn compile_with_callees(
        &self,
        graph: &KernelGraph,
        device: &DeviceDescriptor,
        provider: &dyn SketchProvider,
    ) -> CompileResult<CompiledProgram> {
        let kernel = self.compile(graph, device)?;
        let mut seen: IndexSet<MethodId> = IndexSet::new();
        seen.insert(graph.method.clone());
        let mut pending: VecDeque<MethodId> = kernel.callees.iter().cloned().collect();
        let mut callees = Vec::new();
        while let Some(method) = pending.pop_front() {
            if !seen.insert(method.clone()) {
                continue;
            }
            let sketch = provider.sketch(&method).ok_or_else(|| {
                CompileError::unsupported("driver", format!("no graph available for callee {}", method))
            })?;
            if sketch.is_kernel {
                return Err(CompileError::malformed(format!("callee {} is a kernel", method)));
            }
            let unit = self.compile(&sketch, device)?;
            pending.extend(unit.callees.iter().cloned());
            callees.push(unit);
        }
        Ok(CompiledProgram { kernel, callees })
    }

    /// Compile independent requests concurrently. Results are in request
    /// order.
    pub fn compile_batch(
        &self,
        requests: &[(KernelGraph, DeviceDescriptor)],
    ) -> Vec<CompileResult<Arc<CompilationResult>>> {
        requests
            .par_iter()
            .map(|(graph, device)| self.compile(graph, device))
            .collect()
    }
}
