//! Code generation for kernel targets
//!
//! Instruction selection turns a scheduled, fully lowered [`KernelGraph`]
//! into LIR; each target then serializes the LIR:
//! - PTX assembly
//! - OpenCL C
//! - SPIR-V binary modules
//! - Metal Shading Language
//!
//! [`KernelGraph`]: crate::ir::KernelGraph

pub mod block_emitter;
pub mod c_like;
pub mod calling_convention;
mod instruction_lowering;
pub mod lir;
pub mod metal_backend;
pub mod opencl_backend;
pub mod ptx_backend;
pub mod spirv_backend;
pub mod target;
pub mod variables;

pub use block_emitter::{emission_order, emit, generate_lir};
pub use calling_convention::{Access, ParamBinding};
pub use instruction_lowering::LirGenerator;
pub use lir::{LirInst, LirUnit};
pub use metal_backend::MetalTarget;
pub use opencl_backend::OpenClTarget;
pub use ptx_backend::PtxTarget;
pub use spirv_backend::SpirvTarget;
pub use target::{create_target, create_target_by_name, Payload, TargetDescription, TargetKind};
pub use variables::VariableAllocator;
