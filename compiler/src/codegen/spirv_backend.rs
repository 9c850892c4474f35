//! SPIR-V target
//!
//! Produces an OpenCL-flavoured binary module (`Kernel` execution model,
//! physical addressing). Every LIR variable becomes a `Function` storage
//! variable declared in a dedicated entry block; values are loaded on use
//! and stored on assignment. Memory accesses convert the computed integer
//! address to a pointer of the region's storage class.
//!
//! Dispatch-table entries carry the numeric SPIR-V opcode in `code`, or the
//! `OpenCL.std` instruction number for `ExtInst` forms.

use super::lir::{Expr, LirInst, LirUnit, Operand, Variable};
use super::target::{
    check_atomic_region, no_rule, IntrinsicStyle, OpForm, Opcode, Payload, RegionBinding, TargetDescription, TargetKind,
    FRAME_REGISTER,
};
use crate::config::{ByteOrder, CompileOptions, DeviceDescriptor};
use crate::error::{CompileError, CompileResult};
use crate::ir::{
    AtomicOp, BarrierScope, BinaryOp, BlockId, Builtin, Condition, Constant, Kind, Region, ScalarKind,
    UnaryOp,
};
use fxhash::FxHashMap;
use rspirv::binary::Assemble;
use rspirv::dr::{Builder, InsertPoint, Instruction, Operand as SpvOperand};
use spirv::{
    AddressingModel, BuiltIn, Capability, Decoration, ExecutionModel, FunctionControl,
    LinkageType, MemoryModel, StorageClass, Word,
};
use std::fmt::Debug;
use tracing::{debug, trace};

const OPENCL_STD: &str = "OpenCL.std";
const SPIRV_MAGIC: u32 = 0x0723_0203;

const SCOPE_DEVICE: u32 = 1;
/// `Workgroup` scope for control barriers.
const SCOPE_WORKGROUP: u32 = 2;
const SEMANTICS_SEQ_CST: u32 = 0x10;
const SEMANTICS_WORKGROUP_MEMORY: u32 = 0x100;
const SEMANTICS_CROSS_WORKGROUP_MEMORY: u32 = 0x200;

// OpenCL.std extended instruction numbers
const CL_CEIL: u32 = 12;
const CL_COS: u32 = 14;
const CL_EXP2: u32 = 20;
const CL_FABS: u32 = 23;
const CL_FLOOR: u32 = 25;
const CL_FMAX: u32 = 27;
const CL_FMIN: u32 = 28;
const CL_LOG2: u32 = 38;
const CL_RSQRT: u32 = 56;
const CL_SIN: u32 = 57;
const CL_SQRT: u32 = 61;
const CL_S_ABS: u32 = 141;
const CL_S_MAX: u32 = 156;
const CL_U_MAX: u32 = 157;
const CL_S_MIN: u32 = 158;
const CL_U_MIN: u32 = 159;

pub struct SpirvTarget {
    version: (u8, u8),
}

impl SpirvTarget {
    pub fn new() -> Self {
        Self { version: (1, 2) }
    }

    pub fn with_version(major: u8, minor: u8) -> Self {
        Self {
            version: (major, minor),
        }
    }
}

impl Default for SpirvTarget {
    fn default() -> Self {
        Self::new()
    }
}

fn op(mnemonic: &'static str, code: u32) -> Opcode {
    Opcode::coded(mnemonic, code, OpForm::Instruction)
}

fn ext(mnemonic: &'static str, number: u32) -> Opcode {
    Opcode::coded(mnemonic, number, OpForm::ExtInst)
}

/// Opcodes selected by the dispatch table and emitted generically.
fn spirv_op(code: u32) -> Option<spirv::Op> {
    use spirv::Op;
    let op = match code {
        83 => Op::CopyObject,
        109 => Op::ConvertFToU,
        110 => Op::ConvertFToS,
        111 => Op::ConvertSToF,
        112 => Op::ConvertUToF,
        113 => Op::UConvert,
        114 => Op::SConvert,
        115 => Op::FConvert,
        117 => Op::ConvertPtrToU,
        120 => Op::ConvertUToPtr,
        126 => Op::SNegate,
        127 => Op::FNegate,
        128 => Op::IAdd,
        129 => Op::FAdd,
        130 => Op::ISub,
        131 => Op::FSub,
        132 => Op::IMul,
        133 => Op::FMul,
        134 => Op::UDiv,
        135 => Op::SDiv,
        136 => Op::FDiv,
        137 => Op::UMod,
        138 => Op::SRem,
        140 => Op::FRem,
        164 => Op::LogicalEqual,
        165 => Op::LogicalNotEqual,
        166 => Op::LogicalOr,
        167 => Op::LogicalAnd,
        168 => Op::LogicalNot,
        169 => Op::Select,
        170 => Op::IEqual,
        171 => Op::INotEqual,
        172 => Op::UGreaterThan,
        173 => Op::SGreaterThan,
        174 => Op::UGreaterThanEqual,
        175 => Op::SGreaterThanEqual,
        176 => Op::ULessThan,
        177 => Op::SLessThan,
        178 => Op::ULessThanEqual,
        179 => Op::SLessThanEqual,
        180 => Op::FOrdEqual,
        183 => Op::FUnordNotEqual,
        184 => Op::FOrdLessThan,
        186 => Op::FOrdGreaterThan,
        188 => Op::FOrdLessThanEqual,
        190 => Op::FOrdGreaterThanEqual,
        194 => Op::ShiftRightLogical,
        195 => Op::ShiftRightArithmetic,
        196 => Op::ShiftLeftLogical,
        197 => Op::BitwiseOr,
        198 => Op::BitwiseXor,
        199 => Op::BitwiseAnd,
        200 => Op::Not,
        234 => Op::AtomicIAdd,
        236 => Op::AtomicSMin,
        237 => Op::AtomicUMin,
        238 => Op::AtomicSMax,
        239 => Op::AtomicUMax,
        _ => return None,
    };
    Some(op)
}

fn element_of(target: &SpirvTarget, kind: Kind) -> CompileResult<ScalarKind> {
    kind.element()
        .ok_or_else(|| no_rule(target.name(), "instruction", kind))
}

fn storage_class(region: Region) -> StorageClass {
    match region {
        Region::Global => StorageClass::CrossWorkgroup,
        Region::Constant => StorageClass::UniformConstant,
        Region::Local => StorageClass::Workgroup,
        Region::Private => StorageClass::Function,
    }
}

fn spirv_builtin(builtin: Builtin) -> BuiltIn {
    match builtin {
        Builtin::GlobalId(_) => BuiltIn::GlobalInvocationId,
        Builtin::GlobalSize(_) => BuiltIn::GlobalSize,
        Builtin::LocalId(_) | Builtin::ThreadIdx(_) => BuiltIn::LocalInvocationId,
        Builtin::LocalSize(_) | Builtin::BlockDim(_) => BuiltIn::WorkgroupSize,
        Builtin::GroupId(_) | Builtin::BlockIdx(_) => BuiltIn::WorkgroupId,
        Builtin::NumGroups(_) | Builtin::GridDim(_) => BuiltIn::NumWorkgroups,
    }
}

/// Integer types are signless under the `Kernel` capability.
fn signless(kind: Kind) -> Kind {
    fn unsigned(s: ScalarKind) -> ScalarKind {
        match s {
            ScalarKind::S8 => ScalarKind::U8,
            ScalarKind::S16 => ScalarKind::U16,
            ScalarKind::S32 => ScalarKind::U32,
            ScalarKind::S64 => ScalarKind::U64,
            other => other,
        }
    }
    match kind {
        Kind::Scalar(s) => Kind::Scalar(unsigned(s)),
        Kind::Vector { element, lanes } => Kind::Vector {
            element: unsigned(element),
            lanes,
        },
        other => other,
    }
}

fn built<T, E: Debug>(result: Result<T, E>) -> CompileResult<T> {
    result.map_err(|e| CompileError::Internal(format!("SPIR-V builder: {:?}", e)))
}

impl TargetDescription for SpirvTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::SpirV
    }

    fn variable_prefix(&self, kind: Kind) -> String {
        format!("{}_", kind)
    }

    fn type_name(&self, kind: Kind) -> CompileResult<String> {
        match kind {
            Kind::Scalar(_) | Kind::Vector { .. } => Ok(kind.to_string()),
            other => Err(self.unsupported_kind(other, "no SPIR-V type")),
        }
    }

    fn supported_lanes(&self) -> &'static [u8] {
        &[2, 3, 4, 8, 16]
    }

    fn intrinsic_style(&self) -> IntrinsicStyle {
        IntrinsicStyle::NativeBuiltins
    }

    fn builtin_kind(&self, _builtin: Builtin) -> Kind {
        Kind::U64
    }

    fn native_vector_arithmetic(&self) -> bool {
        true
    }

    fn binary_op(&self, binary: BinaryOp, kind: Kind) -> CompileResult<Opcode> {
        let s = element_of(self, kind)?;
        let opcode = if s.is_predicate() {
            match binary {
                BinaryOp::And => op("OpLogicalAnd", 167),
                BinaryOp::Or => op("OpLogicalOr", 166),
                BinaryOp::Xor => op("OpLogicalNotEqual", 165),
                _ => return Err(no_rule(self.name(), binary.name(), kind)),
            }
        } else if s.is_float() {
            match binary {
                BinaryOp::Add => op("OpFAdd", 129),
                BinaryOp::Sub => op("OpFSub", 131),
                BinaryOp::Mul => op("OpFMul", 133),
                BinaryOp::Div => op("OpFDiv", 136),
                BinaryOp::Rem => op("OpFRem", 140),
                BinaryOp::Min => ext("fmin", CL_FMIN),
                BinaryOp::Max => ext("fmax", CL_FMAX),
                _ => return Err(no_rule(self.name(), binary.name(), kind)),
            }
        } else {
            let signed = s.is_signed();
            match binary {
                BinaryOp::Add => op("OpIAdd", 128),
                BinaryOp::Sub => op("OpISub", 130),
                BinaryOp::Mul => op("OpIMul", 132),
                BinaryOp::Div if signed => op("OpSDiv", 135),
                BinaryOp::Div => op("OpUDiv", 134),
                BinaryOp::Rem if signed => op("OpSRem", 138),
                BinaryOp::Rem => op("OpUMod", 137),
                BinaryOp::And => op("OpBitwiseAnd", 199),
                BinaryOp::Or => op("OpBitwiseOr", 197),
                BinaryOp::Xor => op("OpBitwiseXor", 198),
                BinaryOp::Shl => op("OpShiftLeftLogical", 196),
                BinaryOp::Shr if signed => op("OpShiftRightArithmetic", 195),
                BinaryOp::Shr | BinaryOp::UShr => op("OpShiftRightLogical", 194),
                BinaryOp::Min if signed => ext("s_min", CL_S_MIN),
                BinaryOp::Min => ext("u_min", CL_U_MIN),
                BinaryOp::Max if signed => ext("s_max", CL_S_MAX),
                BinaryOp::Max => ext("u_max", CL_U_MAX),
            }
        };
        Ok(opcode)
    }

    fn unary_op(&self, unary: UnaryOp, kind: Kind) -> CompileResult<Opcode> {
        let s = element_of(self, kind)?;
        let opcode = match unary {
            UnaryOp::Not if s.is_predicate() => op("OpLogicalNot", 168),
            UnaryOp::Not if s.is_integer() => op("OpNot", 200),
            UnaryOp::Neg if s.is_float() => op("OpFNegate", 127),
            UnaryOp::Neg if s.is_signed() => op("OpSNegate", 126),
            UnaryOp::Abs if s.is_float() => ext("fabs", CL_FABS),
            UnaryOp::Abs if s.is_signed() => ext("s_abs", CL_S_ABS),
            UnaryOp::Sqrt if s.is_float() => ext("sqrt", CL_SQRT),
            UnaryOp::Rsqrt if s.is_float() => ext("rsqrt", CL_RSQRT),
            UnaryOp::Sin if s.is_float() => ext("sin", CL_SIN),
            UnaryOp::Cos if s.is_float() => ext("cos", CL_COS),
            UnaryOp::Exp2 if s.is_float() => ext("exp2", CL_EXP2),
            UnaryOp::Log2 if s.is_float() => ext("log2", CL_LOG2),
            UnaryOp::Floor if s.is_float() => ext("floor", CL_FLOOR),
            UnaryOp::Ceil if s.is_float() => ext("ceil", CL_CEIL),
            _ => return Err(no_rule(self.name(), unary.name(), kind)),
        };
        Ok(opcode)
    }

    fn compare_op(&self, cond: Condition, operand: Kind) -> CompileResult<Opcode> {
        let Kind::Scalar(s) = operand else {
            return Err(no_rule(self.name(), format!("cmp.{}", cond.name()), operand));
        };
        let opcode = if s.is_predicate() {
            match cond {
                Condition::Eq => op("OpLogicalEqual", 164),
                Condition::Ne => op("OpLogicalNotEqual", 165),
                _ => return Err(no_rule(self.name(), format!("cmp.{}", cond.name()), operand)),
            }
        } else if s.is_float() {
            match cond {
                Condition::Eq => op("OpFOrdEqual", 180),
                Condition::Ne => op("OpFUnordNotEqual", 183),
                Condition::Lt => op("OpFOrdLessThan", 184),
                Condition::Le => op("OpFOrdLessThanEqual", 188),
                Condition::Gt => op("OpFOrdGreaterThan", 186),
                Condition::Ge => op("OpFOrdGreaterThanEqual", 190),
            }
        } else if s.is_signed() {
            match cond {
                Condition::Eq => op("OpIEqual", 170),
                Condition::Ne => op("OpINotEqual", 171),
                Condition::Lt => op("OpSLessThan", 177),
                Condition::Le => op("OpSLessThanEqual", 179),
                Condition::Gt => op("OpSGreaterThan", 173),
                Condition::Ge => op("OpSGreaterThanEqual", 175),
            }
        } else {
            match cond {
                Condition::Eq => op("OpIEqual", 170),
                Condition::Ne => op("OpINotEqual", 171),
                Condition::Lt => op("OpULessThan", 176),
                Condition::Le => op("OpULessThanEqual", 178),
                Condition::Gt => op("OpUGreaterThan", 172),
                Condition::Ge => op("OpUGreaterThanEqual", 174),
            }
        };
        Ok(opcode)
    }

    fn select_op(&self, kind: Kind) -> CompileResult<Opcode> {
        element_of(self, kind)?;
        Ok(Opcode::coded("OpSelect", 169, OpForm::Select))
    }

    fn convert_op(&self, from: Kind, to: Kind) -> CompileResult<Opcode> {
        if from.lanes() != to.lanes() {
            return Err(no_rule(self.name(), format!("convert from {}", from), to));
        }
        let (Some(f), Some(t)) = (from.element(), to.element()) else {
            return Err(no_rule(self.name(), format!("convert from {}", from), to));
        };
        let opcode = if f.is_predicate() {
            Opcode::coded("OpSelect", 169, OpForm::Select)
        } else if t.is_predicate() {
            if f.is_float() {
                op("OpFUnordNotEqual", 183)
            } else {
                op("OpINotEqual", 171)
            }
        } else if f.is_float() && t.is_float() {
            Opcode::coded("OpFConvert", 115, OpForm::Cast)
        } else if f.is_float() {
            if t.is_signed() {
                Opcode::coded("OpConvertFToS", 110, OpForm::Cast)
            } else {
                Opcode::coded("OpConvertFToU", 109, OpForm::Cast)
            }
        } else if t.is_float() {
            if f.is_signed() {
                Opcode::coded("OpConvertSToF", 111, OpForm::Cast)
            } else {
                Opcode::coded("OpConvertUToF", 112, OpForm::Cast)
            }
        } else if f.size() == t.size() {
            Opcode::coded("OpCopyObject", 83, OpForm::Cast)
        } else if f.is_signed() {
            Opcode::coded("OpSConvert", 114, OpForm::Cast)
        } else {
            Opcode::coded("OpUConvert", 113, OpForm::Cast)
        };
        Ok(opcode)
    }

    fn atomic_op(&self, atomic: AtomicOp, kind: Kind, region: Region) -> CompileResult<Opcode> {
        check_atomic_region(self.name(), atomic, region)?;
        // 64-bit atomics need the Int64Atomics capability
        let signed = match kind {
            Kind::Scalar(ScalarKind::S32) => true,
            Kind::Scalar(ScalarKind::U32) => false,
            _ => return Err(no_rule(self.name(), format!("atomic {}", atomic.name()), kind)),
        };
        Ok(match (atomic, signed) {
            (AtomicOp::Add, _) => op("OpAtomicIAdd", 234),
            (AtomicOp::Min, true) => op("OpAtomicSMin", 236),
            (AtomicOp::Min, false) => op("OpAtomicUMin", 237),
            (AtomicOp::Max, true) => op("OpAtomicSMax", 238),
            (AtomicOp::Max, false) => op("OpAtomicUMax", 239),
        })
    }

    fn region_binding(&self, region: Region) -> RegionBinding {
        let (register, slot, address_space) = match region {
            Region::Global => ("heap_base", 1, "CrossWorkgroup"),
            Region::Constant => ("constant_base", 2, "UniformConstant"),
            Region::Local => ("local_array", 3, "Workgroup"),
            Region::Private => ("private_array", 4, "Function"),
        };
        RegionBinding {
            region,
            register,
            slot,
            address_space,
        }
    }

    fn assemble(
        &self,
        unit: &LirUnit,
        _options: &CompileOptions,
        device: &DeviceDescriptor,
    ) -> CompileResult<Payload> {
        let words = SpirvAssembler::new(self, unit, device).run()?;
        let bytes = words
            .iter()
            .flat_map(|w| match device.byte_order {
                ByteOrder::Little => w.to_le_bytes(),
                ByteOrder::Big => w.to_be_bytes(),
            })
            .collect();
        Ok(Payload::Binary(bytes))
    }
}

struct SpirvAssembler<'a> {
    target: &'a SpirvTarget,
    unit: &'a LirUnit,
    device: &'a DeviceDescriptor,
    b: Builder,
    ext_set: Word,
    /// Types keyed by signless kind
    types: FxHashMap<Kind, Word>,
    pointers: FxHashMap<(StorageClass, Word), Word>,
    constants: FxHashMap<(Word, u64), Word>,
    bools: [Option<Word>; 2],
    labels: FxHashMap<BlockId, Word>,
    /// Function-storage pointer of every LIR variable, by name
    variables: FxHashMap<String, Word>,
    registers: FxHashMap<&'static str, Word>,
    formals: Vec<Word>,
    arrays: Vec<Word>,
    builtins: FxHashMap<BuiltIn, Word>,
    functions: FxHashMap<String, (Word, Kind)>,
    /// Kinds reaching the module, for capability declarations
    used: Vec<Kind>,
    terminated: bool,
}

impl<'a> SpirvAssembler<'a> {
    fn new(target: &'a SpirvTarget, unit: &'a LirUnit, device: &'a DeviceDescriptor) -> Self {
        let mut b = Builder::new();
        b.set_version(target.version.0, target.version.1);
        let ext_set = b.ext_inst_import(OPENCL_STD);
        Self {
            target,
            unit,
            device,
            b,
            ext_set,
            types: FxHashMap::default(),
            pointers: FxHashMap::default(),
            constants: FxHashMap::default(),
            bools: [None, None],
            labels: FxHashMap::default(),
            variables: FxHashMap::default(),
            registers: FxHashMap::default(),
            formals: Vec::new(),
            arrays: Vec::new(),
            builtins: FxHashMap::default(),
            functions: FxHashMap::default(),
            used: Vec::new(),
            terminated: false,
        }
    }

    fn run(mut self) -> CompileResult<Vec<u32>> {
        for callee in &self.unit.callees {
            self.declare_callee(&callee.name, &callee.params, callee.return_kind)?;
        }
        let function = self.emit_function()?;
        let unit = self.unit;
        if unit.is_kernel {
            let interface: Vec<Word> = self.builtins.values().copied().collect();
            self.b
                .entry_point(ExecutionModel::Kernel, function, unit.entry_name.as_str(), interface);
        } else {
            self.b.decorate(
                function,
                Decoration::LinkageAttributes,
                vec![
                    SpvOperand::LiteralString(unit.entry_name.clone()),
                    SpvOperand::LinkageType(LinkageType::Export),
                ],
            );
        }
        self.declare_capabilities();
        let module = self.b.module();
        let words = module.assemble();
        debug!(
            target = self.target.name(),
            entry = %unit.entry_name,
            words = words.len(),
            "assembled SPIR-V module"
        );
        Ok(words)
    }

    fn declare_capabilities(&mut self) {
        let physical64 = self.device.address_bits != 32;
        self.b.capability(Capability::Addresses);
        self.b.capability(Capability::Kernel);
        self.b.capability(Capability::Int8);
        let mut int16 = false;
        let mut int64 = physical64;
        let mut float16 = false;
        let mut float64 = false;
        let mut vector16 = false;
        for kind in &self.used {
            match kind.element() {
                Some(ScalarKind::S16 | ScalarKind::U16) => int16 = true,
                Some(ScalarKind::S64 | ScalarKind::U64) => int64 = true,
                Some(ScalarKind::F16) => float16 = true,
                Some(ScalarKind::F64) => float64 = true,
                _ => {}
            }
            if kind.lanes() > 4 {
                vector16 = true;
            }
        }
        let flags = [
            (int16, Capability::Int16),
            (int64, Capability::Int64),
            (float16, Capability::Float16),
            (float64, Capability::Float64),
            (vector16, Capability::Vector16),
            (
                !self.unit.is_kernel || !self.unit.callees.is_empty(),
                Capability::Linkage,
            ),
        ];
        for (needed, capability) in flags {
            if needed {
                self.b.capability(capability);
            }
        }
        let addressing = if physical64 {
            AddressingModel::Physical64
        } else {
            AddressingModel::Physical32
        };
        self.b.memory_model(addressing, MemoryModel::OpenCL);
    }

    // === Types and constants ===

    fn ty(&mut self, kind: Kind) -> CompileResult<Word> {
        let key = signless(kind);
        if let Some(&id) = self.types.get(&key) {
            return Ok(id);
        }
        let id = match key {
            Kind::Void => self.b.type_void(),
            Kind::Scalar(ScalarKind::Pred) => self.b.type_bool(),
            Kind::Scalar(s) if s.is_float() => self.b.type_float(s.bits()),
            Kind::Scalar(s) => self.b.type_int(s.bits(), 0),
            Kind::Vector { element, lanes } => {
                let component = self.ty(Kind::Scalar(element))?;
                self.b.type_vector(component, lanes as u32)
            }
            Kind::Illegal => return Err(self.target.unsupported_kind(kind, "no SPIR-V type")),
        };
        self.types.insert(key, id);
        self.used.push(key);
        Ok(id)
    }

    fn pointer_type(&mut self, class: StorageClass, pointee: Word) -> Word {
        if let Some(&id) = self.pointers.get(&(class, pointee)) {
            return id;
        }
        let id = self.b.type_pointer(None, class, pointee);
        self.pointers.insert((class, pointee), id);
        id
    }

    fn bool_constant(&mut self, value: bool) -> CompileResult<Word> {
        if let Some(id) = self.bools[value as usize] {
            return Ok(id);
        }
        let ty = self.ty(Kind::PRED)?;
        let id = if value {
            self.b.constant_true(ty)
        } else {
            self.b.constant_false(ty)
        };
        self.bools[value as usize] = Some(id);
        Ok(id)
    }

    fn constant(&mut self, value: Constant, kind: Kind) -> CompileResult<Word> {
        let Kind::Scalar(s) = kind else {
            return Err(no_rule(self.target.name(), "vector immediate", kind));
        };
        if s.is_predicate() {
            let flag = value
                .as_bool()
                .or_else(|| value.as_i64().map(|v| v != 0))
                .unwrap_or(false);
            return self.bool_constant(flag);
        }
        let bits: u64 = match s {
            ScalarKind::F16 => {
                return Err(CompileError::unsupported(
                    self.target.name(),
                    "16-bit floating point immediate",
                ))
            }
            ScalarKind::F32 => value.as_f64().map(|v| (v as f32).to_bits() as u64),
            ScalarKind::F64 => value.as_f64().map(f64::to_bits),
            _ => value.as_i64().map(|v| {
                let mask = if s.bits() == 64 { u64::MAX } else { (1u64 << s.bits()) - 1 };
                v as u64 & mask
            }),
        }
        .ok_or_else(|| CompileError::malformed(format!("immediate {} is not a {}", value, kind)))?;
        let ty = self.ty(kind)?;
        if let Some(&id) = self.constants.get(&(ty, bits)) {
            return Ok(id);
        }
        let id = if s.bits() == 64 {
            self.b.constant_bit64(ty, bits)
        } else {
            self.b.constant_bit32(ty, bits as u32)
        };
        self.constants.insert((ty, bits), id);
        Ok(id)
    }

    fn u32_constant(&mut self, value: u32) -> CompileResult<Word> {
        self.constant(Constant::Int(value as i64), Kind::U32)
    }

    // === Declarations ===

    fn declare_callee(&mut self, name: &str, params: &[Kind], return_kind: Kind) -> CompileResult<()> {
        let ret = self.ty(return_kind)?;
        let mut param_types = Vec::with_capacity(params.len());
        for &kind in params {
            param_types.push(self.ty(kind)?);
        }
        let fn_ty = self.b.type_function(ret, param_types.clone());
        let id = built(self.b.begin_function(ret, None, FunctionControl::NONE, fn_ty))?;
        for ty in param_types {
            built(self.b.function_parameter(ty))?;
        }
        built(self.b.end_function())?;
        self.b.decorate(
            id,
            Decoration::LinkageAttributes,
            vec![
                SpvOperand::LiteralString(name.to_string()),
                SpvOperand::LinkageType(LinkageType::Import),
            ],
        );
        self.b.name(id, name);
        self.functions.insert(name.to_string(), (id, return_kind));
        Ok(())
    }

    fn emit_function(&mut self) -> CompileResult<Word> {
        let unit = self.unit;
        let byte = self.ty(Kind::U8)?;
        let mut params: Vec<(String, Word)> = Vec::new();
        let ret = if unit.is_kernel {
            let context = self.pointer_type(StorageClass::CrossWorkgroup, byte);
            params.push((FRAME_REGISTER.to_string(), context));
            let mut bases = unit.region_bases.clone();
            bases.sort_by_key(|&r| self.target.region_binding(r).slot);
            for region in bases {
                let pointer = self.pointer_type(storage_class(region), byte);
                params.push((self.target.region_binding(region).register.to_string(), pointer));
            }
            self.ty(Kind::Void)?
        } else {
            for (name, kind) in &unit.formals {
                params.push((name.clone(), self.ty(*kind)?));
            }
            self.ty(unit.return_kind)?
        };

        let param_types: Vec<Word> = params.iter().map(|(_, ty)| *ty).collect();
        let fn_ty = self.b.type_function(ret, param_types);
        let function = built(self.b.begin_function(ret, None, FunctionControl::NONE, fn_ty))?;
        self.b.name(function, unit.entry_name.as_str());
        for (name, ty) in params {
            let id = built(self.b.function_parameter(ty))?;
            self.b.name(id, name.as_str());
            if unit.is_kernel {
                match self.register_name(&name) {
                    Some(register) => {
                        self.registers.insert(register, id);
                    }
                    None => {
                        return Err(CompileError::Internal(format!("unknown kernel parameter {}", name)))
                    }
                }
            } else {
                self.formals.push(id);
            }
        }

        for block in &unit.blocks {
            let label = self.b.id();
            self.labels.insert(block.id, label);
        }
        let first = unit
            .blocks
            .first()
            .and_then(|block| self.labels.get(&block.id).copied())
            .ok_or_else(|| CompileError::Internal(format!("{} has no blocks", unit.entry_name)))?;

        built(self.b.begin_block(None))?;
        self.declare_variables()?;
        built(self.b.branch(first))?;

        for block in &unit.blocks {
            let label = self.label(block.id)?;
            built(self.b.begin_block(Some(label)))?;
            self.terminated = false;
            for inst in &block.instructions {
                self.emit_inst(inst)?;
            }
            if !self.terminated {
                return Err(CompileError::Internal(format!(
                    "{} of {} falls through",
                    block.id, unit.entry_name
                )));
            }
        }
        built(self.b.end_function())?;
        Ok(function)
    }

    fn register_name(&self, name: &str) -> Option<&'static str> {
        if name == FRAME_REGISTER {
            return Some(FRAME_REGISTER);
        }
        [Region::Global, Region::Constant, Region::Local, Region::Private]
            .into_iter()
            .map(|r| self.target.region_binding(r).register)
            .find(|&register| register == name)
    }

    /// Function-storage variables, emitted into the entry block.
    fn declare_variables(&mut self) -> CompileResult<()> {
        let unit = self.unit;
        for (kind, vars) in &unit.variables {
            let ty = self.ty(*kind)?;
            let pointer = self.pointer_type(StorageClass::Function, ty);
            for var in vars {
                let id = self.b.variable(pointer, None, StorageClass::Function, None);
                self.b.name(id, var.name.as_str());
                self.variables.insert(var.name.clone(), id);
            }
        }
        for array in &unit.arrays {
            let byte = self.ty(Kind::U8)?;
            let length = self.u32_constant(array.size_bytes())?;
            let array_ty = self.b.type_array(byte, length);
            let class = storage_class(array.region);
            let pointer = self.pointer_type(class, array_ty);
            let id = self.b.variable(pointer, None, class, None);
            let align = array.element.size().max(1);
            self.b.decorate(
                id,
                Decoration::Alignment,
                vec![SpvOperand::LiteralBit32(align)],
            );
            self.b.name(id, array.name.as_str());
            self.arrays.push(id);
        }
        Ok(())
    }

    fn label(&self, block: BlockId) -> CompileResult<Word> {
        self.labels
            .get(&block)
            .copied()
            .ok_or_else(|| CompileError::Internal(format!("jump to unemitted {}", block)))
    }

    // === Instructions ===

    fn insert(&mut self, opcode: spirv::Op, ty: Option<Word>, operands: Vec<SpvOperand>) -> CompileResult<Word> {
        let id = self.b.id();
        let result = ty.map(|_| id);
        built(self.b.insert_into_block(
            InsertPoint::End,
            Instruction::new(opcode, ty, result, operands),
        ))?;
        Ok(id)
    }

    fn generic(&mut self, op: &Opcode, ty: Word, args: &[Word]) -> CompileResult<Word> {
        if op.form == OpForm::ExtInst {
            let mut operands = vec![
                SpvOperand::IdRef(self.ext_set),
                SpvOperand::LiteralExtInstInteger(op.code),
            ];
            operands.extend(args.iter().map(|&a| SpvOperand::IdRef(a)));
            return self.insert(spirv::Op::ExtInst, Some(ty), operands);
        }
        let opcode = spirv_op(op.code).ok_or_else(|| {
            CompileError::Internal(format!("{} has no SPIR-V opcode", op.mnemonic))
        })?;
        let operands = args.iter().map(|&a| SpvOperand::IdRef(a)).collect();
        self.insert(opcode, Some(ty), operands)
    }

    fn var_pointer(&self, var: &Variable) -> CompileResult<Word> {
        self.variables
            .get(&var.name)
            .copied()
            .ok_or_else(|| CompileError::Internal(format!("undeclared variable {}", var)))
    }

    fn word_type(&mut self) -> CompileResult<Word> {
        let word = self.device.word_kind();
        self.ty(word)
    }

    fn value(&mut self, operand: &Operand) -> CompileResult<Word> {
        match operand {
            Operand::Var(var) => {
                let ty = self.ty(var.kind)?;
                let pointer = self.var_pointer(var)?;
                built(self.b.load(ty, None, pointer, None, vec![]))
            }
            Operand::Const(c, kind) => self.constant(*c, *kind),
            Operand::Register(name, kind) => {
                let param = self.registers.get(name).copied().ok_or_else(|| {
                    CompileError::Internal(format!("register %{} is not a parameter", name))
                })?;
                let ty = self.ty(*kind)?;
                self.insert(spirv::Op::ConvertPtrToU, Some(ty), vec![SpvOperand::IdRef(param)])
            }
            Operand::Formal(index, _) => self.formals.get(*index as usize).copied().ok_or_else(|| {
                CompileError::Internal(format!("formal {} out of range", index))
            }),
            Operand::Builtin(builtin, kind) => self.builtin(*builtin, *kind),
            Operand::Array(index) => {
                let array = self.arrays.get(*index as usize).copied().ok_or_else(|| {
                    CompileError::Internal(format!("array {} out of range", index))
                })?;
                let ty = self.word_type()?;
                self.insert(spirv::Op::ConvertPtrToU, Some(ty), vec![SpvOperand::IdRef(array)])
            }
        }
    }

    fn builtin(&mut self, builtin: Builtin, kind: Kind) -> CompileResult<Word> {
        let word = self.device.word_kind();
        let component = self.ty(word)?;
        let vec3 = self.b.type_vector(component, 3);
        let spv = spirv_builtin(builtin);
        let var = match self.builtins.get(&spv) {
            Some(&var) => var,
            None => {
                let pointer = self.pointer_type(StorageClass::Input, vec3);
                let var = self.b.variable(pointer, None, StorageClass::Input, None);
                self.b.decorate(var, Decoration::BuiltIn, vec![SpvOperand::BuiltIn(spv)]);
                self.b.decorate(var, Decoration::Constant, vec![]);
                self.builtins.insert(spv, var);
                var
            }
        };
        let loaded = built(self.b.load(vec3, None, var, None, vec![]))?;
        let lane = built(self.b.composite_extract(component, None, loaded, vec![builtin.dim() as u32]))?;
        if kind.size() == word.size() {
            return Ok(lane);
        }
        let ty = self.ty(kind)?;
        self.insert(spirv::Op::UConvert, Some(ty), vec![SpvOperand::IdRef(lane)])
    }

    /// Pointer into `region` at the integer address `address`.
    fn address(&mut self, region: Region, address: &Operand, stored: Kind) -> CompileResult<Word> {
        let addr = self.value(address)?;
        let pointee = self.ty(stored)?;
        let pointer = self.pointer_type(storage_class(region), pointee);
        self.insert(spirv::Op::ConvertUToPtr, Some(pointer), vec![SpvOperand::IdRef(addr)])
    }

    fn expr(&mut self, expr: &Expr, kind: Kind) -> CompileResult<Word> {
        match expr {
            Expr::Move(source) => self.value(source),
            Expr::Unary { op, value } => {
                let v = self.value(value)?;
                let ty = self.ty(kind)?;
                self.generic(op, ty, &[v])
            }
            Expr::Binary { op, left, right } => {
                let l = self.value(left)?;
                let r = self.value(right)?;
                let ty = self.ty(kind)?;
                self.generic(op, ty, &[l, r])
            }
            Expr::Ternary {
                op,
                first,
                second,
                third,
            } => {
                let predicate = self.value(third)?;
                let if_true = self.value(first)?;
                let if_false = self.value(second)?;
                let ty = self.ty(kind)?;
                self.generic(op, ty, &[predicate, if_true, if_false])
            }
            Expr::Convert { op, value } => {
                let v = self.value(value)?;
                let ty = self.ty(kind)?;
                match op.form {
                    OpForm::Select => {
                        let one = self.constant(Constant::Int(1), kind)?;
                        let zero = self.constant(Constant::Int(0), kind)?;
                        self.generic(op, ty, &[v, one, zero])
                    }
                    OpForm::Instruction => {
                        let source = value.kind();
                        let zero = if source.is_float() {
                            self.constant(Constant::float(0.0), source)?
                        } else {
                            self.constant(Constant::Int(0), source)?
                        };
                        self.generic(op, ty, &[v, zero])
                    }
                    _ => self.generic(op, ty, &[v]),
                }
            }
            Expr::Load { region, address } => {
                if kind.is_predicate() {
                    let pointer = self.address(*region, address, Kind::U8)?;
                    let byte = self.ty(Kind::U8)?;
                    let raw = built(self.b.load(byte, None, pointer, None, vec![]))?;
                    let zero = self.constant(Constant::Int(0), Kind::U8)?;
                    let ty = self.ty(Kind::PRED)?;
                    return self.insert(
                        spirv::Op::INotEqual,
                        Some(ty),
                        vec![SpvOperand::IdRef(raw), SpvOperand::IdRef(zero)],
                    );
                }
                let pointer = self.address(*region, address, kind)?;
                let ty = self.ty(kind)?;
                built(self.b.load(ty, None, pointer, None, vec![]))
            }
            Expr::Vector(lanes) => {
                let mut ids = Vec::with_capacity(lanes.len());
                for lane in lanes {
                    ids.push(SpvOperand::IdRef(self.value(lane)?));
                }
                let ty = self.ty(kind)?;
                self.insert(spirv::Op::CompositeConstruct, Some(ty), ids)
            }
            Expr::Lane { vector, lane } => {
                let v = self.value(vector)?;
                let ty = self.ty(kind)?;
                built(self.b.composite_extract(ty, None, v, vec![*lane as u32]))
            }
            Expr::Call { callee, args } => {
                let (function, return_kind) = self.functions.get(callee).copied().ok_or_else(|| {
                    CompileError::Internal(format!("call of undeclared {}", callee))
                })?;
                let mut operands = vec![SpvOperand::IdRef(function)];
                for arg in args {
                    operands.push(SpvOperand::IdRef(self.value(arg)?));
                }
                let ty = self.ty(return_kind)?;
                self.insert(spirv::Op::FunctionCall, Some(ty), operands)
            }
        }
    }

    fn emit_inst(&mut self, inst: &LirInst) -> CompileResult<()> {
        if self.terminated && !matches!(inst, LirInst::Comment(_)) {
            // code after a terminator opens an unreachable block
            built(self.b.begin_block(None))?;
            self.terminated = false;
        }
        match inst {
            LirInst::Assign { dest, expr } => {
                let value = self.expr(expr, dest.kind)?;
                let pointer = self.var_pointer(dest)?;
                built(self.b.store(pointer, value, None, vec![]))?;
            }
            LirInst::Eval(expr) => {
                self.expr(expr, Kind::Void)?;
            }
            LirInst::Store {
                region,
                address,
                value,
            } => {
                let kind = value.kind();
                let mut v = self.value(value)?;
                let stored = if kind.is_predicate() {
                    let byte = self.ty(Kind::U8)?;
                    let one = self.constant(Constant::Int(1), Kind::U8)?;
                    let zero = self.constant(Constant::Int(0), Kind::U8)?;
                    v = self.insert(
                        spirv::Op::Select,
                        Some(byte),
                        vec![SpvOperand::IdRef(v), SpvOperand::IdRef(one), SpvOperand::IdRef(zero)],
                    )?;
                    Kind::U8
                } else {
                    kind
                };
                let pointer = self.address(*region, address, stored)?;
                built(self.b.store(pointer, v, None, vec![]))?;
            }
            LirInst::Atomic {
                op,
                region,
                address,
                value,
            } => {
                let kind = value.kind();
                let ty = self.ty(kind)?;
                let v = self.value(value)?;
                let pointer = self.address(*region, address, kind)?;
                let (scope, memory) = match region {
                    Region::Local => (SCOPE_WORKGROUP, SEMANTICS_WORKGROUP_MEMORY),
                    _ => (SCOPE_DEVICE, SEMANTICS_CROSS_WORKGROUP_MEMORY),
                };
                let scope = self.u32_constant(scope)?;
                // relaxed ordering
                let semantics = self.u32_constant(memory)?;
                let opcode = spirv_op(op.code).ok_or_else(|| {
                    CompileError::Internal(format!("{} has no SPIR-V opcode", op.mnemonic))
                })?;
                self.insert(
                    opcode,
                    Some(ty),
                    vec![
                        SpvOperand::IdRef(pointer),
                        SpvOperand::IdRef(scope),
                        SpvOperand::IdRef(semantics),
                        SpvOperand::IdRef(v),
                    ],
                )?;
            }
            LirInst::LaneStore {
                vector,
                lane,
                value,
            } => {
                let ty = self.ty(vector.kind)?;
                let pointer = self.var_pointer(vector)?;
                let v = self.value(value)?;
                let current = built(self.b.load(ty, None, pointer, None, vec![]))?;
                let updated = self.insert(
                    spirv::Op::CompositeInsert,
                    Some(ty),
                    vec![
                        SpvOperand::IdRef(v),
                        SpvOperand::IdRef(current),
                        SpvOperand::LiteralBit32(*lane as u32),
                    ],
                )?;
                built(self.b.store(pointer, updated, None, vec![]))?;
            }
            LirInst::Barrier(scope) => {
                let memory = match scope {
                    BarrierScope::Local => SEMANTICS_WORKGROUP_MEMORY,
                    BarrierScope::Global => SEMANTICS_CROSS_WORKGROUP_MEMORY,
                };
                let execution = self.u32_constant(SCOPE_WORKGROUP)?;
                let semantics = self.u32_constant(SEMANTICS_SEQ_CST | memory)?;
                self.insert(
                    spirv::Op::ControlBarrier,
                    None,
                    vec![
                        SpvOperand::IdRef(execution),
                        SpvOperand::IdRef(execution),
                        SpvOperand::IdRef(semantics),
                    ],
                )?;
            }
            LirInst::Comment(text) => trace!(comment = %text, "dropped from binary"),
            LirInst::Jump(target) => {
                let label = self.label(*target)?;
                built(self.b.branch(label))?;
                self.terminated = true;
            }
            LirInst::Branch { predicate, target } => {
                let condition = self.value(predicate)?;
                let taken = self.label(*target)?;
                let fall_through = self.b.id();
                built(self.b.branch_conditional(condition, taken, fall_through, vec![]))?;
                built(self.b.begin_block(Some(fall_through)))?;
            }
            LirInst::Return(Some(value)) => {
                let v = self.value(value)?;
                built(self.b.ret_value(v))?;
                self.terminated = true;
            }
            LirInst::Return(None) => {
                built(self.b.ret())?;
                self.terminated = true;
            }
            LirInst::Trap(reason) => {
                debug!(entry = %self.unit.entry_name, reason = %reason, "deoptimization point becomes an early exit");
                if self.unit.return_kind.is_value() && !self.unit.is_kernel {
                    built(self.b.unreachable())?;
                } else {
                    built(self.b.ret())?;
                }
                self.terminated = true;
            }
        }
        Ok(())
    }
}

/// First word of every module.
pub fn is_spirv_module(bytes: &[u8]) -> bool {
    bytes.len() >= 4
        && (u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) == SPIRV_MAGIC
            || u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) == SPIRV_MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_and_unsigned_dispatch() {
        let spv = SpirvTarget::new();
        assert_eq!(spv.binary_op(BinaryOp::Div, Kind::S32).unwrap().code, 135);
        assert_eq!(spv.binary_op(BinaryOp::Div, Kind::U32).unwrap().code, 134);
        assert_eq!(spv.binary_op(BinaryOp::Shr, Kind::S64).unwrap().mnemonic, "OpShiftRightArithmetic");
        assert_eq!(spv.compare_op(Condition::Lt, Kind::U32).unwrap().mnemonic, "OpULessThan");
        assert_eq!(spv.compare_op(Condition::Ne, Kind::F32).unwrap().mnemonic, "OpFUnordNotEqual");
        assert!(spv.compare_op(Condition::Lt, Kind::PRED).is_err());
    }

    #[test]
    fn test_math_goes_through_extended_set() {
        let spv = SpirvTarget::new();
        let sqrt = spv.unary_op(UnaryOp::Sqrt, Kind::F32).unwrap();
        assert_eq!(sqrt.form, OpForm::ExtInst);
        assert_eq!(sqrt.code, CL_SQRT);
        let max = spv.binary_op(BinaryOp::Max, Kind::U32).unwrap();
        assert_eq!((max.form, max.code), (OpForm::ExtInst, CL_U_MAX));
        assert!(spv.unary_op(UnaryOp::Sqrt, Kind::S32).is_err());
    }

    #[test]
    fn test_conversions() {
        let spv = SpirvTarget::new();
        assert_eq!(spv.convert_op(Kind::S32, Kind::F32).unwrap().mnemonic, "OpConvertSToF");
        assert_eq!(spv.convert_op(Kind::F64, Kind::U32).unwrap().mnemonic, "OpConvertFToU");
        assert_eq!(spv.convert_op(Kind::S32, Kind::U32).unwrap().mnemonic, "OpCopyObject");
        assert_eq!(spv.convert_op(Kind::S8, Kind::S64).unwrap().mnemonic, "OpSConvert");
        assert_eq!(spv.convert_op(Kind::PRED, Kind::S32).unwrap().form, OpForm::Select);
        assert!(spv
            .convert_op(Kind::vector(ScalarKind::F32, 4), Kind::F32)
            .is_err());
    }

    #[test]
    fn test_every_selected_opcode_is_encodable() {
        let spv = SpirvTarget::new();
        let kinds = [Kind::S32, Kind::U64, Kind::F32, Kind::F64];
        let binaries = [
            BinaryOp::Add,
            BinaryOp::Sub,
            BinaryOp::Mul,
            BinaryOp::Div,
            BinaryOp::Rem,
            BinaryOp::Min,
            BinaryOp::Max,
        ];
        for kind in kinds {
            for binary in binaries {
                let opcode = spv.binary_op(binary, kind).unwrap();
                if opcode.form != OpForm::ExtInst {
                    assert!(spirv_op(opcode.code).is_some(), "{:?}", opcode);
                }
            }
            for cond in [Condition::Eq, Condition::Ne, Condition::Lt, Condition::Ge] {
                assert!(spirv_op(spv.compare_op(cond, kind).unwrap().code).is_some());
            }
        }
    }

    #[test]
    fn test_signless_integer_types() {
        assert_eq!(signless(Kind::S32), Kind::U32);
        assert_eq!(signless(Kind::vector(ScalarKind::S16, 4)), Kind::vector(ScalarKind::U16, 4));
        assert_eq!(signless(Kind::F32), Kind::F32);
    }

    #[test]
    fn test_magic_detection() {
        assert!(is_spirv_module(&SPIRV_MAGIC.to_le_bytes()));
        assert!(is_spirv_module(&SPIRV_MAGIC.to_be_bytes()));
        assert!(!is_spirv_module(b".version"));
    }
}
