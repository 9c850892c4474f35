//! Target descriptions.
//!
//! One generic pipeline serves every backend; a target only supplies its
//! kind table, operator dispatch table, region base-register table and
//! assembler.

use super::lir::LirUnit;
use super::metal_backend::MetalTarget;
use super::opencl_backend::OpenClTarget;
use super::ptx_backend::PtxTarget;
use super::spirv_backend::SpirvTarget;
use crate::config::{CompileOptions, DeviceDescriptor};
use crate::error::{CompileError, CompileResult};
use crate::ir::{AtomicOp, BinaryOp, Builtin, Condition, Kind, Region, ScalarKind, UnaryOp};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Name of the kernel parameter carrying the frame pointer.
pub const FRAME_REGISTER: &str = "kernel_context";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Ptx,
    OpenCl,
    SpirV,
    Metal,
}

impl TargetKind {
    pub const ALL: [TargetKind; 4] = [
        TargetKind::Ptx,
        TargetKind::OpenCl,
        TargetKind::SpirV,
        TargetKind::Metal,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TargetKind::Ptx => "ptx",
            TargetKind::OpenCl => "opencl",
            TargetKind::SpirV => "spirv",
            TargetKind::Metal => "metal",
        }
    }

    pub fn parse(name: &str) -> CompileResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "ptx" | "cuda" => Ok(TargetKind::Ptx),
            "opencl" | "ocl" => Ok(TargetKind::OpenCl),
            "spirv" | "spir-v" => Ok(TargetKind::SpirV),
            "metal" => Ok(TargetKind::Metal),
            other => Err(CompileError::Config(format!("unknown target '{}'", other))),
        }
    }

    /// Whether the payload is text rather than a binary module.
    pub fn is_textual(self) -> bool {
        self != TargetKind::SpirV
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How target-neutral thread queries map onto the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrinsicStyle {
    /// `%tid`, `%ntid`, `%ctaid`, `%nctaid` special registers only
    CudaRegisters,
    /// Global, local and group builtins
    NativeBuiltins,
}

/// Assembled kernel code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", content = "data", rename_all = "lowercase")]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(text) => text.as_bytes(),
            Payload::Binary(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How an opcode is spelled by the assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpForm {
    /// `a op b`
    Infix,
    /// `op a`
    Prefix,
    /// `op(a, b)`
    Call,
    /// `(type) a`
    Cast,
    /// `c ? a : b`
    Select,
    /// Assembly instruction `op dest, a, b`
    Instruction,
    /// Extended instruction set call (SPIR-V `OpExtInst`)
    ExtInst,
}

/// A dispatch-table entry. `code` is the numeric opcode of binary targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opcode {
    pub mnemonic: Cow<'static, str>,
    pub code: u32,
    pub form: OpForm,
}

impl Opcode {
    pub fn new(mnemonic: impl Into<Cow<'static, str>>, form: OpForm) -> Self {
        Self {
            mnemonic: mnemonic.into(),
            code: 0,
            form,
        }
    }

    pub fn coded(mnemonic: &'static str, code: u32, form: OpForm) -> Self {
        Self {
            mnemonic: Cow::Borrowed(mnemonic),
            code,
            form,
        }
    }
}

/// Base register and address space of one memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionBinding {
    pub region: Region,
    pub register: &'static str,
    /// Fixed position of the base register in the kernel signature
    pub slot: u32,
    pub address_space: &'static str,
}

pub trait TargetDescription: Send + Sync {
    fn kind(&self) -> TargetKind;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    // === Kind table ===

    fn variable_prefix(&self, kind: Kind) -> String;

    fn type_name(&self, kind: Kind) -> CompileResult<String>;

    /// Vector widths the target can hold in one variable.
    fn supported_lanes(&self) -> &'static [u8];

    /// Reject kinds the target or device cannot represent.
    fn check_kind(&self, kind: Kind, device: &DeviceDescriptor) -> CompileResult<()> {
        let Some(element) = kind.element() else {
            return Ok(());
        };
        if element == ScalarKind::F64 && !device.supports_fp64 {
            return Err(self.unsupported_kind(kind, "device has no 64-bit floating point"));
        }
        if element == ScalarKind::F16 && !device.supports_fp16 {
            return Err(self.unsupported_kind(kind, "device has no 16-bit floating point"));
        }
        if kind.is_vector() && !self.supported_lanes().contains(&kind.lanes()) {
            return Err(self.unsupported_kind(kind, "vector width"));
        }
        Ok(())
    }

    fn unsupported_kind(&self, kind: Kind, reason: &str) -> CompileError {
        CompileError::unsupported(self.name(), format!("kind {} ({})", kind, reason))
    }

    fn intrinsic_style(&self) -> IntrinsicStyle;

    fn builtin_kind(&self, builtin: Builtin) -> Kind;

    fn native_vector_arithmetic(&self) -> bool;

    // === Operator dispatch table ===

    fn binary_op(&self, op: BinaryOp, kind: Kind) -> CompileResult<Opcode>;

    fn unary_op(&self, op: UnaryOp, kind: Kind) -> CompileResult<Opcode>;

    /// Comparison of two operands of `operand` kind yielding a predicate.
    fn compare_op(&self, cond: Condition, operand: Kind) -> CompileResult<Opcode>;

    fn select_op(&self, kind: Kind) -> CompileResult<Opcode>;

    fn convert_op(&self, from: Kind, to: Kind) -> CompileResult<Opcode>;

    /// Atomic read-modify-write of a `kind` element in `region`.
    fn atomic_op(&self, op: AtomicOp, kind: Kind, region: Region) -> CompileResult<Opcode>;

    // === Regions ===

    fn region_binding(&self, region: Region) -> RegionBinding;

    // === Assembler ===

    fn assemble(
        &self,
        unit: &LirUnit,
        options: &CompileOptions,
        device: &DeviceDescriptor,
    ) -> CompileResult<Payload>;
}

/// Create the description of `kind`.
pub fn create_target(kind: TargetKind) -> Box<dyn TargetDescription> {
    match kind {
        TargetKind::Ptx => Box::new(PtxTarget::new()),
        TargetKind::OpenCl => Box::new(OpenClTarget::new()),
        TargetKind::SpirV => Box::new(SpirvTarget::new()),
        TargetKind::Metal => Box::new(MetalTarget::new()),
    }
}

pub fn create_target_by_name(name: &str) -> CompileResult<Box<dyn TargetDescription>> {
    TargetKind::parse(name).map(create_target)
}

/// Regions shared between threads, the only ones atomics make sense on.
pub(crate) fn check_atomic_region(target: &str, op: AtomicOp, region: Region) -> CompileResult<()> {
    match region {
        Region::Global | Region::Local => Ok(()),
        other => Err(CompileError::unsupported(
            target,
            format!("atomic {} in {} memory", op.name(), other.name()),
        )),
    }
}

/// Operator or kind combination without a lowering rule on `target`.
pub(crate) fn no_rule(target: &str, what: impl fmt::Display, kind: Kind) -> CompileError {
    CompileError::unsupported(target, format!("{} on {}", what, kind))
}
