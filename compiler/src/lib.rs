//! Retargetable kernel code generator
//!
//! Takes an architecture-neutral kernel graph and produces PTX, OpenCL C,
//! SPIR-V or Metal code for it:
//!
//! ```text
//! KernelGraph -> High tier -> Mid tier -> Low tier -> LIR -> assembler
//! ```
//!
//! The entry point is [`KernelCompiler`].

pub mod cache;
pub mod codegen;
pub mod compilation;
pub mod config;
pub mod error;
pub mod error_codes;
pub mod ir;
pub mod logging;
pub mod pipeline;

pub use cache::{CacheKey, CacheStats, CompilationCache};
pub use codegen::target::{create_target, Payload, TargetDescription, TargetKind};
pub use compilation::{CompilationResult, CompiledProgram, KernelCompiler, SketchProvider};
pub use config::{CompileOptions, DeviceDescriptor};
pub use error::{CompileError, CompileResult};
pub use ir::{GraphBuilder, KernelGraph, Kind, MethodId};
