//! PTX target
//!
//! Emits one `.visible .entry` (kernels) or `.func` (callees) per unit.
//! Registers are declared per kind with the `prefix<count>` form, so the
//! n-th variable of a kind is `prefix` + n. Vector variables are held as
//! one register per lane, named `name_<lane>`.

use super::calling_convention::Access;
use super::lir::{Expr, LirInst, LirUnit, Operand, Variable};
use super::target::{
    check_atomic_region, no_rule, IntrinsicStyle, OpForm, Opcode, Payload, RegionBinding, TargetDescription, TargetKind,
    FRAME_REGISTER,
};
use crate::config::{CompileOptions, DeviceDescriptor};
use crate::error::{CompileError, CompileResult};
use crate::ir::{
    AtomicOp, BarrierScope, BinaryOp, BlockId, Builtin, Condition, Constant, Kind, Region, ScalarKind,
    UnaryOp,
};

/// Scratch register used to move predicates through memory and parameters.
const PRED_SCRATCH: &str = "pred_scratch";

pub struct PtxTarget {
    version: (u32, u32),
    sm: u32,
}

impl PtxTarget {
    pub fn new() -> Self {
        Self {
            version: (7, 0),
            sm: 70,
        }
    }

    pub fn with_arch(version: (u32, u32), sm: u32) -> Self {
        Self { version, sm }
    }
}

impl Default for PtxTarget {
    fn default() -> Self {
        Self::new()
    }
}

fn scalar_type(s: ScalarKind) -> &'static str {
    match s {
        ScalarKind::Pred => "pred",
        ScalarKind::S8 => "s8",
        ScalarKind::U8 => "u8",
        ScalarKind::S16 => "s16",
        ScalarKind::U16 => "u16",
        ScalarKind::F16 => "f16",
        ScalarKind::S32 => "s32",
        ScalarKind::U32 => "u32",
        ScalarKind::F32 => "f32",
        ScalarKind::S64 => "s64",
        ScalarKind::U64 => "u64",
        ScalarKind::F64 => "f64",
    }
}

fn type_char(s: ScalarKind) -> char {
    if s.is_predicate() {
        'p'
    } else if s.is_float() {
        'f'
    } else if s.is_unsigned() {
        'u'
    } else {
        's'
    }
}

fn size_char(s: ScalarKind) -> char {
    match s.size() {
        1 => 'b',
        2 => 'h',
        4 => 'i',
        _ => 'd',
    }
}

/// Untyped bit-size name (`b32`) for bitwise operations and parameters.
fn bits_type(s: ScalarKind) -> String {
    format!("b{}", s.bits())
}

fn scalar_of(target: &PtxTarget, kind: Kind) -> CompileResult<ScalarKind> {
    match kind {
        Kind::Scalar(s) => Ok(s),
        other => Err(no_rule(target.name(), "scalar instruction", other)),
    }
}

impl TargetDescription for PtxTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::Ptx
    }

    fn variable_prefix(&self, kind: Kind) -> String {
        match kind {
            Kind::Scalar(s) => format!("r{}{}", type_char(s), size_char(s)),
            Kind::Vector { element, lanes } => {
                format!("rv{}{}{}", lanes, type_char(element), size_char(element))
            }
            Kind::Void | Kind::Illegal => "rx".to_string(),
        }
    }

    fn type_name(&self, kind: Kind) -> CompileResult<String> {
        match kind {
            Kind::Scalar(s) => Ok(scalar_type(s).to_string()),
            Kind::Vector { element, lanes } => Ok(format!("v{}.{}", lanes, scalar_type(element))),
            other => Err(self.unsupported_kind(other, "no register type")),
        }
    }

    fn supported_lanes(&self) -> &'static [u8] {
        &[2, 4]
    }

    fn intrinsic_style(&self) -> IntrinsicStyle {
        IntrinsicStyle::CudaRegisters
    }

    fn builtin_kind(&self, _builtin: Builtin) -> Kind {
        Kind::U32
    }

    fn native_vector_arithmetic(&self) -> bool {
        false
    }

    fn binary_op(&self, op: BinaryOp, kind: Kind) -> CompileResult<Opcode> {
        let s = scalar_of(self, kind)?;
        let t = scalar_type(s);
        let mnemonic = if s.is_predicate() {
            match op {
                BinaryOp::And => "and.pred".to_string(),
                BinaryOp::Or => "or.pred".to_string(),
                BinaryOp::Xor => "xor.pred".to_string(),
                _ => return Err(no_rule(self.name(), op.name(), kind)),
            }
        } else if s.is_float() {
            match op {
                BinaryOp::Add => format!("add.{}", t),
                BinaryOp::Sub => format!("sub.{}", t),
                BinaryOp::Mul => format!("mul.{}", t),
                BinaryOp::Div if s == ScalarKind::F16 => return Err(no_rule(self.name(), op.name(), kind)),
                BinaryOp::Div => format!("div.rn.{}", t),
                BinaryOp::Min => format!("min.{}", t),
                BinaryOp::Max => format!("max.{}", t),
                _ => return Err(no_rule(self.name(), op.name(), kind)),
            }
        } else {
            match op {
                BinaryOp::Add => format!("add.{}", t),
                BinaryOp::Sub => format!("sub.{}", t),
                BinaryOp::Mul => format!("mul.lo.{}", t),
                BinaryOp::Div => format!("div.{}", t),
                BinaryOp::Rem => format!("rem.{}", t),
                BinaryOp::And => format!("and.{}", bits_type(s)),
                BinaryOp::Or => format!("or.{}", bits_type(s)),
                BinaryOp::Xor => format!("xor.{}", bits_type(s)),
                BinaryOp::Shl => format!("shl.{}", bits_type(s)),
                BinaryOp::Shr => format!("shr.s{}", s.bits()),
                BinaryOp::UShr => format!("shr.u{}", s.bits()),
                BinaryOp::Min => format!("min.{}", t),
                BinaryOp::Max => format!("max.{}", t),
            }
        };
        Ok(Opcode::new(mnemonic, OpForm::Instruction))
    }

    fn unary_op(&self, op: UnaryOp, kind: Kind) -> CompileResult<Opcode> {
        let s = scalar_of(self, kind)?;
        let t = scalar_type(s);
        let mnemonic = match op {
            UnaryOp::Not if s.is_predicate() => "not.pred".to_string(),
            UnaryOp::Not if s.is_integer() => format!("not.{}", bits_type(s)),
            UnaryOp::Neg if s.is_float() || s.is_signed() => format!("neg.{}", t),
            UnaryOp::Abs if s.is_float() || s.is_signed() => format!("abs.{}", t),
            UnaryOp::Sqrt if matches!(s, ScalarKind::F32 | ScalarKind::F64) => format!("sqrt.rn.{}", t),
            UnaryOp::Rsqrt if matches!(s, ScalarKind::F32 | ScalarKind::F64) => {
                format!("rsqrt.approx.{}", t)
            }
            UnaryOp::Sin if s == ScalarKind::F32 => "sin.approx.f32".to_string(),
            UnaryOp::Cos if s == ScalarKind::F32 => "cos.approx.f32".to_string(),
            UnaryOp::Exp2 if s == ScalarKind::F32 => "ex2.approx.f32".to_string(),
            UnaryOp::Log2 if s == ScalarKind::F32 => "lg2.approx.f32".to_string(),
            UnaryOp::Floor if s.is_float() => format!("cvt.rmi.{}.{}", t, t),
            UnaryOp::Ceil if s.is_float() => format!("cvt.rpi.{}.{}", t, t),
            _ => return Err(no_rule(self.name(), op.name(), kind)),
        };
        Ok(Opcode::new(mnemonic, OpForm::Instruction))
    }

    fn compare_op(&self, cond: Condition, operand: Kind) -> CompileResult<Opcode> {
        let s = scalar_of(self, operand)?;
        if s.is_predicate() {
            return Err(no_rule(self.name(), format!("cmp.{}", cond.name()), operand));
        }
        Ok(Opcode::new(
            format!("setp.{}.{}", cond.name(), scalar_type(s)),
            OpForm::Instruction,
        ))
    }

    fn select_op(&self, kind: Kind) -> CompileResult<Opcode> {
        let s = scalar_of(self, kind)?;
        if s.is_predicate() {
            return Err(no_rule(self.name(), "select", kind));
        }
        Ok(Opcode::new(format!("selp.{}", scalar_type(s)), OpForm::Select))
    }

    fn convert_op(&self, from: Kind, to: Kind) -> CompileResult<Opcode> {
        let (Kind::Scalar(f), Kind::Scalar(t)) = (from, to) else {
            return Err(no_rule(self.name(), format!("convert from {}", from), to));
        };
        let (fs, ts) = (scalar_type(f), scalar_type(t));
        let opcode = if f.is_predicate() {
            Opcode::new(format!("selp.{}", ts), OpForm::Select)
        } else if t.is_predicate() {
            Opcode::new(format!("setp.ne.{}", fs), OpForm::Instruction)
        } else if f.is_float() && t.is_float() {
            if t.size() < f.size() {
                Opcode::new(format!("cvt.rn.{}.{}", ts, fs), OpForm::Cast)
            } else {
                Opcode::new(format!("cvt.{}.{}", ts, fs), OpForm::Cast)
            }
        } else if f.is_float() {
            Opcode::new(format!("cvt.rzi.{}.{}", ts, fs), OpForm::Cast)
        } else if t.is_float() {
            Opcode::new(format!("cvt.rn.{}.{}", ts, fs), OpForm::Cast)
        } else {
            Opcode::new(format!("cvt.{}.{}", ts, fs), OpForm::Cast)
        };
        Ok(opcode)
    }

    fn atomic_op(&self, op: AtomicOp, kind: Kind, region: Region) -> CompileResult<Opcode> {
        check_atomic_region(self.name(), op, region)?;
        let s = scalar_of(self, kind)?;
        let ty = match (op, s) {
            (AtomicOp::Add, ScalarKind::S32 | ScalarKind::U32 | ScalarKind::U64 | ScalarKind::F32) => {
                scalar_type(s)
            }
            // two's complement add is sign agnostic
            (AtomicOp::Add, ScalarKind::S64) => "u64",
            (
                AtomicOp::Min | AtomicOp::Max,
                ScalarKind::S32 | ScalarKind::U32 | ScalarKind::S64 | ScalarKind::U64,
            ) => scalar_type(s),
            _ => return Err(no_rule(self.name(), format!("atomic {}", op.name()), kind)),
        };
        Ok(Opcode::new(format!("{}.{}", op.name(), ty), OpForm::Instruction))
    }

    fn region_binding(&self, region: Region) -> RegionBinding {
        match region {
            Region::Global => RegionBinding {
                region,
                register: "heap_base",
                slot: 1,
                address_space: "global",
            },
            Region::Constant => RegionBinding {
                region,
                register: "constant_base",
                slot: 2,
                address_space: "global.nc",
            },
            Region::Local => RegionBinding {
                region,
                register: "local_array",
                slot: 3,
                address_space: "shared",
            },
            Region::Private => RegionBinding {
                region,
                register: "private_array",
                slot: 4,
                address_space: "local",
            },
        }
    }

    fn assemble(
        &self,
        unit: &LirUnit,
        options: &CompileOptions,
        device: &DeviceDescriptor,
    ) -> CompileResult<Payload> {
        let mut asm = PtxAssembler {
            target: self,
            unit,
            options,
            device,
            out: String::new(),
        };
        asm.emit_unit()?;
        Ok(Payload::Text(asm.out))
    }
}

struct PtxAssembler<'a> {
    target: &'a PtxTarget,
    unit: &'a LirUnit,
    options: &'a CompileOptions,
    device: &'a DeviceDescriptor,
    out: String,
}

fn label(block: BlockId) -> String {
    format!("BB{}", block.0)
}

fn lane_name(var: &Variable, lane: u8) -> String {
    format!("{}_{}", var.name, lane)
}

/// Type used for a value crossing a `.param` boundary.
fn param_type(kind: Kind) -> Option<&'static str> {
    match kind {
        Kind::Scalar(ScalarKind::Pred) => Some("u32"),
        Kind::Scalar(s) => Some(scalar_type(s)),
        _ => None,
    }
}

impl PtxAssembler<'_> {
    fn line(&mut self, text: impl AsRef<str>) {
        self.out.push('\t');
        self.out.push_str(text.as_ref());
        self.out.push('\n');
    }

    fn raw(&mut self, text: impl AsRef<str>) {
        self.out.push_str(text.as_ref());
        self.out.push('\n');
    }

    fn unsupported(&self, what: impl Into<String>) -> CompileError {
        CompileError::unsupported(self.target.name(), what)
    }

    fn emit_unit(&mut self) -> CompileResult<()> {
        let (major, minor) = self.target.version;
        self.raw(format!("//\n// Generated for {}\n//", self.unit.method));
        self.raw(format!(".version {}.{}", major, minor));
        self.raw(format!(".target sm_{}", self.target.sm));
        self.raw(format!(".address_size {}", self.device.address_bits));
        self.raw("");

        let unit = self.unit;
        for callee in &unit.callees {
            let ret = match param_type(callee.return_kind) {
                Some(t) => format!("(.param .{} retval) ", t),
                None if callee.return_kind.is_void() => String::new(),
                None => return Err(self.unsupported(format!("call returning {}", callee.return_kind))),
            };
            let mut params = Vec::with_capacity(callee.params.len());
            for (i, &kind) in callee.params.iter().enumerate() {
                let t = param_type(kind)
                    .ok_or_else(|| self.unsupported(format!("call argument of kind {}", kind)))?;
                params.push(format!(".param .{} arg{}", t, i));
            }
            self.raw(format!(".func {}{}({});", ret, callee.name, params.join(", ")));
        }
        if !unit.callees.is_empty() {
            self.raw("");
        }

        self.emit_signature()?;
        self.raw("{");
        self.emit_declarations()?;
        self.raw("");

        let order: Vec<BlockId> = unit.blocks.iter().map(|b| b.id).collect();
        for (position, block) in unit.blocks.iter().enumerate() {
            self.raw(format!("{}:", label(block.id)));
            let next = order.get(position + 1).copied();
            for inst in &block.instructions {
                self.emit_inst(inst, next)?;
            }
        }
        self.raw("}");
        Ok(())
    }

    fn emit_signature(&mut self) -> CompileResult<()> {
        let unit = self.unit;
        if unit.is_kernel {
            let word = format!("u{}", self.device.address_bits);
            let mut params = vec![format!(".param .{} {}", word, FRAME_REGISTER)];
            for &region in &unit.region_bases {
                let binding = self.target.region_binding(region);
                params.push(format!(".param .{} {}", word, binding.register));
            }
            self.raw(format!(".visible .entry {}(", unit.entry_name));
            let count = params.len();
            for (i, param) in params.into_iter().enumerate() {
                let comma = if i + 1 < count { "," } else { "" };
                self.line(format!("{}{}", param, comma));
            }
            self.raw(")");
            // argument slots the kernel ignores are recorded for the runtime
            for binding in unit.parameters.iter().filter(|p| p.access == Access::None) {
                self.raw(format!("// unused argument {} ({})", binding.index, binding.name));
            }
        } else {
            let ret = match param_type(unit.return_kind) {
                Some(t) => format!("(.param .{} retval) ", t),
                None if unit.return_kind.is_void() => String::new(),
                None => return Err(self.unsupported(format!("function returning {}", unit.return_kind))),
            };
            let mut params = Vec::with_capacity(unit.formals.len());
            for (name, kind) in &unit.formals {
                let t = param_type(*kind)
                    .ok_or_else(|| self.unsupported(format!("formal {} of kind {}", name, kind)))?;
                params.push(format!(".param .{} {}", t, name));
            }
            self.raw(format!(".visible .func {}{}({})", ret, unit.entry_name, params.join(", ")));
        }
        Ok(())
    }

    fn emit_declarations(&mut self) -> CompileResult<()> {
        let unit = self.unit;
        let mut needs_scratch = false;
        for (kind, vars) in &unit.variables {
            match kind {
                Kind::Scalar(s) => {
                    needs_scratch |= s.is_predicate();
                    let prefix = self.target.variable_prefix(*kind);
                    self.line(format!(".reg .{} {}<{}>;", scalar_type(*s), prefix, vars.len()));
                }
                Kind::Vector { element, lanes } => {
                    for var in vars {
                        self.line(format!(".reg .{} {}_<{}>;", scalar_type(*element), var.name, lanes));
                    }
                }
                other => return Err(self.target.unsupported_kind(*other, "no register type")),
            }
        }
        if needs_scratch {
            self.line(format!(".reg .u32 {};", PRED_SCRATCH));
        }
        for array in &unit.arrays {
            let space = self.target.region_binding(array.region).address_space;
            self.line(format!(
                ".{} .align {} .b8 {}[{}];",
                space,
                array.element.size().clamp(4, 16),
                array.name,
                array.size_bytes()
            ));
        }
        Ok(())
    }

    /// Source operand text for a scalar position.
    fn operand(&self, op: &Operand) -> CompileResult<String> {
        match op {
            Operand::Var(v) if v.kind.is_vector() => {
                Err(self.unsupported(format!("vector {} in scalar position", v)))
            }
            Operand::Var(v) => Ok(v.name.clone()),
            Operand::Const(c, kind) => immediate(*c, *kind),
            Operand::Array(i) => self
                .unit
                .arrays
                .get(*i as usize)
                .map(|a| a.name.clone())
                .ok_or_else(|| CompileError::Internal(format!("unknown array {}", i))),
            Operand::Builtin(b, _) => builtin_register(*b)
                .ok_or_else(|| self.unsupported(format!("builtin {:?}", b))),
            Operand::Register(name, _) => Err(self.unsupported(format!("%{} outside a move", name))),
            Operand::Formal(i, _) => Err(self.unsupported(format!("formal {} outside a move", i))),
        }
    }

    fn address(&self, op: &Operand) -> CompileResult<String> {
        Ok(format!("[{}]", self.operand(op)?))
    }

    fn space(&self, region: Region) -> &'static str {
        self.target.region_binding(region).address_space
    }

    fn emit_inst(&mut self, inst: &LirInst, next: Option<BlockId>) -> CompileResult<()> {
        match inst {
            LirInst::Assign { dest, expr } => self.emit_assign(dest, expr)?,
            LirInst::Eval(expr) => match expr {
                Expr::Call { callee, args } => self.emit_call(None, callee, args)?,
                other => return Err(CompileError::Internal(format!("effect-free {}", other))),
            },
            LirInst::Store {
                region,
                address,
                value,
            } => {
                let space = self.space(*region);
                let addr = self.address(address)?;
                match value.kind() {
                    Kind::Scalar(ScalarKind::Pred) => {
                        let v = self.operand(value)?;
                        self.line(format!("selp.u32 {}, 1, 0, {};", PRED_SCRATCH, v));
                        self.line(format!("st.{}.u8 {}, {};", space, addr, PRED_SCRATCH));
                    }
                    Kind::Vector { element, lanes } => {
                        let var = value
                            .as_var()
                            .ok_or_else(|| self.unsupported("vector immediate store"))?;
                        let regs: Vec<String> = (0..lanes).map(|l| lane_name(var, l)).collect();
                        self.line(format!(
                            "st.{}.v{}.{} {}, {{{}}};",
                            space,
                            lanes,
                            scalar_type(element),
                            addr,
                            regs.join(", ")
                        ));
                    }
                    Kind::Scalar(s) => {
                        let v = self.operand(value)?;
                        self.line(format!("st.{}.{} {}, {};", space, scalar_type(s), addr, v));
                    }
                    other => return Err(self.target.unsupported_kind(other, "store")),
                }
            }
            LirInst::Atomic {
                op,
                region,
                address,
                value,
            } => {
                // `red` is the form of `atom` that discards the old value
                let addr = self.address(address)?;
                let v = self.operand(value)?;
                self.line(format!("red.{}.{} {}, {};", self.space(*region), op.mnemonic, addr, v));
            }
            LirInst::LaneStore { vector, lane, value } => {
                let element = vector
                    .kind
                    .element()
                    .ok_or_else(|| CompileError::Internal(format!("lane store into {}", vector)))?;
                let v = self.operand(value)?;
                self.line(format!(
                    "mov.{} {}, {};",
                    scalar_type(element),
                    lane_name(vector, *lane),
                    v
                ));
            }
            LirInst::Barrier(scope) => {
                if *scope == BarrierScope::Global {
                    self.line("membar.gl;");
                }
                self.line("bar.sync 0;");
            }
            LirInst::Comment(text) => {
                if self.options.emit_comments {
                    self.line(format!("// {}", text));
                }
            }
            LirInst::Jump(target) => {
                if Some(*target) != next {
                    self.line(format!("bra.uni {};", label(*target)));
                }
            }
            LirInst::Branch { predicate, target } => {
                let p = self.operand(predicate)?;
                self.line(format!("@{} bra {};", p, label(*target)));
            }
            LirInst::Return(value) => {
                if let Some(value) = value {
                    let kind = value.kind();
                    let v = self.operand(value)?;
                    if kind.is_predicate() {
                        self.line(format!("selp.u32 {}, 1, 0, {};", PRED_SCRATCH, v));
                        self.line(format!("st.param.u32 [retval], {};", PRED_SCRATCH));
                    } else {
                        let t = param_type(kind)
                            .ok_or_else(|| self.unsupported(format!("return of {}", kind)))?;
                        self.line(format!("st.param.{} [retval], {};", t, v));
                    }
                }
                self.line("ret;");
            }
            LirInst::Trap(reason) => {
                self.line(format!("// deopt: {}", reason));
                self.line("trap;");
            }
        }
        Ok(())
    }

    fn emit_assign(&mut self, dest: &Variable, expr: &Expr) -> CompileResult<()> {
        let d = &dest.name;
        match expr {
            Expr::Move(src) => self.emit_move(dest, src)?,
            Expr::Unary { op, value } => {
                let v = self.operand(value)?;
                self.line(format!("{} {}, {};", op.mnemonic, d, v));
            }
            Expr::Binary { op, left, right } => {
                let l = self.operand(left)?;
                let r = self.operand(right)?;
                self.line(format!("{} {}, {}, {};", op.mnemonic, d, l, r));
            }
            Expr::Ternary {
                op,
                first,
                second,
                third,
            } => {
                let a = self.operand(first)?;
                let b = self.operand(second)?;
                let p = self.operand(third)?;
                self.line(format!("{} {}, {}, {}, {};", op.mnemonic, d, a, b, p));
            }
            Expr::Convert { op, value } => {
                let v = self.operand(value)?;
                match op.form {
                    OpForm::Select => self.line(format!("{} {}, 1, 0, {};", op.mnemonic, d, v)),
                    OpForm::Instruction => self.line(format!("{} {}, {}, 0;", op.mnemonic, d, v)),
                    _ => self.line(format!("{} {}, {};", op.mnemonic, d, v)),
                }
            }
            Expr::Load { region, address } => {
                let space = self.space(*region);
                let addr = self.address(address)?;
                match dest.kind {
                    Kind::Scalar(ScalarKind::Pred) => {
                        self.line(format!("ld.{}.u8 {}, {};", space, PRED_SCRATCH, addr));
                        self.line(format!("setp.ne.u32 {}, {}, 0;", d, PRED_SCRATCH));
                    }
                    Kind::Vector { element, lanes } => {
                        let regs: Vec<String> = (0..lanes).map(|l| lane_name(dest, l)).collect();
                        self.line(format!(
                            "ld.{}.v{}.{} {{{}}}, {};",
                            space,
                            lanes,
                            scalar_type(element),
                            regs.join(", "),
                            addr
                        ));
                    }
                    Kind::Scalar(s) => {
                        self.line(format!("ld.{}.{} {}, {};", space, scalar_type(s), d, addr));
                    }
                    other => return Err(self.target.unsupported_kind(other, "load")),
                }
            }
            Expr::Vector(lanes) => {
                let element = dest
                    .kind
                    .element()
                    .ok_or_else(|| CompileError::Internal(format!("vector into {}", dest)))?;
                for (i, lane) in lanes.iter().enumerate() {
                    let v = self.operand(lane)?;
                    self.line(format!(
                        "mov.{} {}, {};",
                        scalar_type(element),
                        lane_name(dest, i as u8),
                        v
                    ));
                }
            }
            Expr::Lane { vector, lane } => {
                let var = vector
                    .as_var()
                    .ok_or_else(|| self.unsupported("lane of a vector immediate"))?;
                let t = self.target.type_name(dest.kind)?;
                self.line(format!("mov.{} {}, {};", t, d, lane_name(var, *lane)));
            }
            Expr::Call { callee, args } => self.emit_call(Some(dest), callee, args)?,
        }
        Ok(())
    }

    fn emit_move(&mut self, dest: &Variable, src: &Operand) -> CompileResult<()> {
        let d = &dest.name;
        match (dest.kind, src) {
            (Kind::Vector { element, lanes }, Operand::Var(v)) => {
                for l in 0..lanes {
                    self.line(format!(
                        "mov.{} {}, {};",
                        scalar_type(element),
                        lane_name(dest, l),
                        lane_name(v, l)
                    ));
                }
            }
            (Kind::Vector { .. }, other) => {
                return Err(self.unsupported(format!("vector move from {}", other)));
            }
            (kind, Operand::Register(name, _)) => {
                let t = self.target.type_name(kind)?;
                self.line(format!("ld.param.{} {}, [{}];", t, d, name));
            }
            (kind, Operand::Formal(i, _)) => {
                let name = self
                    .unit
                    .formals
                    .get(*i as usize)
                    .map(|(n, _)| n.clone())
                    .ok_or_else(|| CompileError::Internal(format!("unknown formal {}", i)))?;
                if kind.is_predicate() {
                    self.line(format!("ld.param.u32 {}, [{}];", PRED_SCRATCH, name));
                    self.line(format!("setp.ne.u32 {}, {}, 0;", d, PRED_SCRATCH));
                } else {
                    let t = self.target.type_name(kind)?;
                    self.line(format!("ld.param.{} {}, [{}];", t, d, name));
                }
            }
            (Kind::Scalar(ScalarKind::Pred), Operand::Const(c, _)) => {
                let bit = if c.as_bool().unwrap_or(c.as_i64() != Some(0)) { 1 } else { 0 };
                self.line(format!("setp.ne.u32 {}, {}, 0;", d, bit));
            }
            (kind, Operand::Builtin(..)) => {
                let reg = self.operand(src)?;
                let t = self.target.type_name(kind)?;
                if kind.size() == 4 {
                    self.line(format!("mov.{} {}, {};", t, d, reg));
                } else {
                    // special registers are 32 bits wide
                    self.line(format!("mov.u32 {}, {};", PRED_SCRATCH, reg));
                    self.line(format!("cvt.{}.u32 {}, {};", t, d, PRED_SCRATCH));
                }
            }
            (kind, src) => {
                let v = self.operand(src)?;
                let t = self.target.type_name(kind)?;
                self.line(format!("mov.{} {}, {};", t, d, v));
            }
        }
        Ok(())
    }

    /// `.param` call sequence in its own scope.
    fn emit_call(&mut self, dest: Option<&Variable>, callee: &str, args: &[Operand]) -> CompileResult<()> {
        self.line("{");
        let mut names = Vec::with_capacity(args.len());
        for (i, arg) in args.iter().enumerate() {
            let kind = arg.kind();
            let t = param_type(kind)
                .ok_or_else(|| self.unsupported(format!("call argument of kind {}", kind)))?;
            let name = format!("param{}", i);
            self.line(format!(".param .{} {};", t, name));
            let v = self.operand(arg)?;
            if kind.is_predicate() {
                self.line(format!("selp.u32 {}, 1, 0, {};", PRED_SCRATCH, v));
                self.line(format!("st.param.u32 [{}], {};", name, PRED_SCRATCH));
            } else {
                self.line(format!("st.param.{} [{}], {};", t, name, v));
            }
            names.push(name);
        }
        let mut call = String::from("call.uni ");
        if let Some(dest) = dest {
            let t = param_type(dest.kind)
                .ok_or_else(|| self.unsupported(format!("call returning {}", dest.kind)))?;
            self.line(format!(".param .{} retval0;", t));
            call.push_str("(retval0), ");
        }
        call.push_str(&format!("{}, ({});", callee, names.join(", ")));
        self.line(call);
        if let Some(dest) = dest {
            if dest.kind.is_predicate() {
                self.line(format!("ld.param.u32 {}, [retval0];", PRED_SCRATCH));
                self.line(format!("setp.ne.u32 {}, {}, 0;", dest.name, PRED_SCRATCH));
            } else {
                let t = self.target.type_name(dest.kind)?;
                self.line(format!("ld.param.{} {}, [retval0];", t, dest.name));
            }
        }
        self.line("}");
        Ok(())
    }
}

/// PTX immediate for a constant of `kind`.
fn immediate(c: Constant, kind: Kind) -> CompileResult<String> {
    let mismatch = || CompileError::malformed(format!("immediate {} is not a {}", c, kind));
    let s = kind.scalar().ok_or_else(mismatch)?;
    if !c.fits(s) {
        return Err(mismatch());
    }
    let text = match s {
        ScalarKind::F32 => {
            let v = c.as_f64().ok_or_else(mismatch)? as f32;
            format!("0F{:08X}", v.to_bits())
        }
        ScalarKind::F64 => format!("0D{:016X}", c.as_f64().ok_or_else(mismatch)?.to_bits()),
        ScalarKind::F16 => {
            return Err(CompileError::unsupported(
                TargetKind::Ptx.name(),
                "16-bit floating point immediate",
            ))
        }
        ScalarKind::Pred => if c.as_bool().ok_or_else(mismatch)? { "1" } else { "0" }.to_string(),
        _ => c.as_i64().ok_or_else(mismatch)?.to_string(),
    };
    Ok(text)
}

fn builtin_register(builtin: Builtin) -> Option<String> {
    let name = match builtin {
        Builtin::ThreadIdx(_) | Builtin::LocalId(_) => "tid",
        Builtin::BlockDim(_) | Builtin::LocalSize(_) => "ntid",
        Builtin::BlockIdx(_) | Builtin::GroupId(_) => "ctaid",
        Builtin::GridDim(_) | Builtin::NumGroups(_) => "nctaid",
        Builtin::GlobalId(_) | Builtin::GlobalSize(_) => return None,
    };
    Some(format!("%{}.{}", name, builtin.axis()))
}
