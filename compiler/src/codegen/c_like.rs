//! Shared emitter for C-family kernel languages.
//!
//! OpenCL C and Metal share their type names, operators and statement
//! syntax. A [`CDialect`] supplies what differs: qualifiers, builtins,
//! barriers, vector spelling and how control flow is written. Dialects
//! without `goto` get a dispatch loop over the block number instead of
//! labels.

use super::lir::{Expr, LirInst, LirUnit, Operand, Variable};
use super::target::{check_atomic_region, no_rule, OpForm, Opcode, TargetDescription, FRAME_REGISTER};
use crate::config::{CompileOptions, DeviceDescriptor};
use crate::error::{CompileError, CompileResult};
use crate::ir::{
    AtomicOp, BarrierScope, BinaryOp, BlockId, Builtin, Condition, Constant, Kind, Region, ScalarKind,
    UnaryOp,
};

/// Mnemonic of a logical right shift; C spells it through an unsigned cast.
const LOGICAL_SHIFT: &str = ">>>";

/// Name of the dispatch variable in loop-structured output.
const DISPATCH: &str = "__block";

pub trait CDialect: TargetDescription {
    /// Pragmas or includes at the top of the translation unit.
    fn preamble(&self, unit: &LirUnit) -> Vec<String>;

    fn kernel_qualifier(&self) -> &'static str;

    /// A kernel signature entry for a pointer argument at `slot`.
    fn pointer_param(&self, region: Region, name: &str, slot: u32) -> String;

    /// Extra kernel parameters that expose `builtins`.
    fn builtin_params(&self, builtins: &[Builtin]) -> CompileResult<Vec<String>>;

    fn builtin(&self, builtin: Builtin) -> CompileResult<String>;

    fn barrier(&self, scope: BarrierScope) -> &'static str;

    fn vector_literal(&self, type_name: &str, lanes: &[String]) -> String;

    fn lane(&self, vector: &str, lane: u8) -> String;

    /// Conversion of a whole vector to `type_name`.
    fn vector_convert(&self, type_name: &str) -> String;

    /// Whether non-kernel functions can query thread builtins.
    fn builtins_in_functions(&self) -> bool;

    /// Declaration of kernel-scope array storage.
    fn array_declaration(&self, space: &str, name: &str, bytes: u32, align: u32) -> String;

    /// Whether blocks are written as labels with `goto`.
    fn has_goto(&self) -> bool;

    fn atomic_function(&self, op: AtomicOp) -> &'static str;

    /// Statement applying the atomic `function` to the `element` at
    /// `address` in `space`.
    fn atomic_update(
        &self,
        function: &str,
        space: &str,
        element: &str,
        address: &str,
        value: &str,
    ) -> String;
}

// === Kind table ===

fn scalar_name(s: ScalarKind) -> &'static str {
    match s {
        ScalarKind::Pred => "bool",
        ScalarKind::S8 => "char",
        ScalarKind::U8 => "uchar",
        ScalarKind::S16 => "short",
        ScalarKind::U16 => "ushort",
        ScalarKind::F16 => "half",
        ScalarKind::S32 => "int",
        ScalarKind::U32 => "uint",
        ScalarKind::F32 => "float",
        ScalarKind::S64 => "long",
        ScalarKind::U64 => "ulong",
        ScalarKind::F64 => "double",
    }
}

fn type_char(s: ScalarKind) -> char {
    match s {
        ScalarKind::Pred => 'z',
        ScalarKind::S8 | ScalarKind::U8 => 'b',
        ScalarKind::S16 | ScalarKind::U16 => 's',
        ScalarKind::F16 => 'h',
        ScalarKind::S32 | ScalarKind::U32 => 'i',
        ScalarKind::F32 => 'f',
        ScalarKind::S64 | ScalarKind::U64 => 'l',
        ScalarKind::F64 => 'd',
    }
}

/// `[v<lanes>][u]<type char>_`, e.g. `i_`, `ul_`, `v4f_`.
pub fn variable_prefix(kind: Kind) -> String {
    let (lanes, s) = match kind {
        Kind::Scalar(s) => (None, s),
        Kind::Vector { element, lanes } => (Some(lanes), element),
        Kind::Void | Kind::Illegal => return "x_".to_string(),
    };
    let mut prefix = String::new();
    if let Some(lanes) = lanes {
        prefix.push('v');
        prefix.push_str(&lanes.to_string());
    }
    if s.is_unsigned() {
        prefix.push('u');
    }
    prefix.push(type_char(s));
    prefix.push('_');
    prefix
}

pub fn type_name(target: &dyn TargetDescription, kind: Kind) -> CompileResult<String> {
    match kind {
        Kind::Scalar(s) => Ok(scalar_name(s).to_string()),
        Kind::Vector { element, lanes } if !element.is_predicate() => {
            Ok(format!("{}{}", scalar_name(element), lanes))
        }
        Kind::Void => Ok("void".to_string()),
        other => Err(target.unsupported_kind(other, "no C type")),
    }
}

fn unsigned_of(s: ScalarKind) -> ScalarKind {
    match s {
        ScalarKind::S8 => ScalarKind::U8,
        ScalarKind::S16 => ScalarKind::U16,
        ScalarKind::S32 => ScalarKind::U32,
        ScalarKind::S64 => ScalarKind::U64,
        other => other,
    }
}

// === Operator dispatch table ===

pub fn binary_op(target: &dyn TargetDescription, op: BinaryOp, kind: Kind) -> CompileResult<Opcode> {
    let s = kind
        .element()
        .ok_or_else(|| no_rule(target.name(), op.name(), kind))?;
    let infix = |m: &'static str| -> CompileResult<Opcode> { Ok(Opcode::new(m, OpForm::Infix)) };
    let call = |m: &'static str| -> CompileResult<Opcode> { Ok(Opcode::new(m, OpForm::Call)) };
    if s.is_predicate() {
        return match op {
            BinaryOp::And => infix("&&"),
            BinaryOp::Or => infix("||"),
            BinaryOp::Xor => infix("!="),
            _ => Err(no_rule(target.name(), op.name(), kind)),
        };
    }
    if s.is_float() {
        return match op {
            BinaryOp::Add => infix("+"),
            BinaryOp::Sub => infix("-"),
            BinaryOp::Mul => infix("*"),
            BinaryOp::Div => infix("/"),
            BinaryOp::Rem => call("fmod"),
            BinaryOp::Min => call("fmin"),
            BinaryOp::Max => call("fmax"),
            _ => Err(no_rule(target.name(), op.name(), kind)),
        };
    }
    match op {
        BinaryOp::Add => infix("+"),
        BinaryOp::Sub => infix("-"),
        BinaryOp::Mul => infix("*"),
        BinaryOp::Div => infix("/"),
        BinaryOp::Rem => infix("%"),
        BinaryOp::And => infix("&"),
        BinaryOp::Or => infix("|"),
        BinaryOp::Xor => infix("^"),
        BinaryOp::Shl => infix("<<"),
        BinaryOp::Shr => infix(">>"),
        BinaryOp::UShr if s.is_unsigned() => infix(">>"),
        BinaryOp::UShr => infix(LOGICAL_SHIFT),
        BinaryOp::Min => call("min"),
        BinaryOp::Max => call("max"),
    }
}

pub fn unary_op(target: &dyn TargetDescription, op: UnaryOp, kind: Kind) -> CompileResult<Opcode> {
    let s = kind
        .element()
        .ok_or_else(|| no_rule(target.name(), op.name(), kind))?;
    let opcode = match op {
        UnaryOp::Not if s.is_predicate() => Opcode::new("!", OpForm::Prefix),
        UnaryOp::Not if s.is_integer() => Opcode::new("~", OpForm::Prefix),
        UnaryOp::Neg if !s.is_predicate() => Opcode::new("-", OpForm::Prefix),
        UnaryOp::Abs if s.is_float() => Opcode::new("fabs", OpForm::Call),
        UnaryOp::Abs if s.is_integer() => Opcode::new("abs", OpForm::Call),
        _ if op.is_float_only() && s.is_float() => Opcode::new(op.name(), OpForm::Call),
        _ => return Err(no_rule(target.name(), op.name(), kind)),
    };
    Ok(opcode)
}

pub fn compare_op(target: &dyn TargetDescription, cond: Condition, operand: Kind) -> CompileResult<Opcode> {
    let Kind::Scalar(s) = operand else {
        return Err(no_rule(target.name(), format!("cmp.{}", cond.name()), operand));
    };
    if s.is_predicate() && !matches!(cond, Condition::Eq | Condition::Ne) {
        return Err(no_rule(target.name(), format!("cmp.{}", cond.name()), operand));
    }
    let m = match cond {
        Condition::Eq => "==",
        Condition::Ne => "!=",
        Condition::Lt => "<",
        Condition::Le => "<=",
        Condition::Gt => ">",
        Condition::Ge => ">=",
    };
    Ok(Opcode::new(m, OpForm::Infix))
}

pub fn select_op(target: &dyn TargetDescription, kind: Kind) -> CompileResult<Opcode> {
    if !kind.is_value() {
        return Err(no_rule(target.name(), "select", kind));
    }
    Ok(Opcode::new("?:", OpForm::Select))
}

/// 32-bit integer atomics are the common subset of both dialects.
pub fn atomic_op<D: CDialect>(
    target: &D,
    op: AtomicOp,
    kind: Kind,
    region: Region,
) -> CompileResult<Opcode> {
    check_atomic_region(target.name(), op, region)?;
    if !matches!(kind, Kind::Scalar(ScalarKind::S32 | ScalarKind::U32)) {
        return Err(no_rule(target.name(), format!("atomic {}", op.name()), kind));
    }
    Ok(Opcode::new(target.atomic_function(op), OpForm::Call))
}

pub fn convert_op<D: CDialect>(target: &D, from: Kind, to: Kind) -> CompileResult<Opcode> {
    match (from, to) {
        (Kind::Scalar(_), Kind::Scalar(_)) => Ok(Opcode::new(type_name(target, to)?, OpForm::Cast)),
        (Kind::Vector { lanes: a, .. }, Kind::Vector { lanes: b, .. }) if a == b => {
            let name = type_name(target, to)?;
            Ok(Opcode::new(target.vector_convert(&name), OpForm::Call))
        }
        _ => Err(no_rule(target.name(), format!("convert from {}", from), to)),
    }
}

// === Assembler ===

pub fn assemble<D: CDialect>(
    dialect: &D,
    unit: &LirUnit,
    options: &CompileOptions,
    device: &DeviceDescriptor,
) -> CompileResult<String> {
    let mut emitter = CEmitter {
        dialect,
        unit,
        options,
        device,
        out: String::new(),
        indent: 0,
    };
    emitter.emit_unit()?;
    Ok(emitter.out)
}

struct CEmitter<'a, D: CDialect> {
    dialect: &'a D,
    unit: &'a LirUnit,
    options: &'a CompileOptions,
    device: &'a DeviceDescriptor,
    out: String,
    indent: usize,
}

fn label(block: BlockId) -> String {
    format!("BB{}", block.0)
}

impl<D: CDialect> CEmitter<'_, D> {
    fn line(&mut self, text: impl AsRef<str>) {
        for _ in 0..self.indent {
            self.out.push_str("    ");
        }
        self.out.push_str(text.as_ref());
        self.out.push('\n');
    }

    fn unsupported(&self, what: impl Into<String>) -> CompileError {
        CompileError::unsupported(self.dialect.name(), what)
    }

    fn ty(&self, kind: Kind) -> CompileResult<String> {
        type_name(self.dialect, kind)
    }

    fn space(&self, region: Region) -> &'static str {
        self.dialect.region_binding(region).address_space
    }

    fn emit_unit(&mut self) -> CompileResult<()> {
        let unit = self.unit;
        for line in self.dialect.preamble(unit) {
            self.line(line);
        }
        self.line(format!("// {}", unit.method));
        self.line("");

        for callee in &unit.callees {
            let mut params = Vec::with_capacity(callee.params.len());
            for &kind in &callee.params {
                params.push(self.ty(kind)?);
            }
            let ret = self.ty(callee.return_kind)?;
            self.line(format!("{} {}({});", ret, callee.name, params.join(", ")));
        }
        if !unit.callees.is_empty() {
            self.line("");
        }

        self.emit_signature()?;
        self.line("{");
        self.indent += 1;
        self.emit_declarations()?;

        if self.dialect.has_goto() {
            self.emit_labelled_blocks()?;
        } else {
            self.emit_dispatch_loop()?;
        }

        self.indent -= 1;
        self.line("}");
        Ok(())
    }

    fn used_builtins(&self) -> Vec<Builtin> {
        let mut used: Vec<Builtin> = Vec::new();
        for inst in self.unit.instructions() {
            if let LirInst::Assign {
                expr: Expr::Move(Operand::Builtin(b, _)),
                ..
            } = inst
            {
                if !used.contains(b) {
                    used.push(*b);
                }
            }
        }
        used
    }

    fn emit_signature(&mut self) -> CompileResult<()> {
        let unit = self.unit;
        if unit.is_kernel {
            let mut params = vec![self.dialect.pointer_param(Region::Global, FRAME_REGISTER, 0)];
            for &region in &unit.region_bases {
                let binding = self.dialect.region_binding(region);
                params.push(self.dialect.pointer_param(region, binding.register, binding.slot));
            }
            params.extend(self.dialect.builtin_params(&self.used_builtins())?);
            self.line(format!(
                "{} void {}({})",
                self.dialect.kernel_qualifier(),
                unit.entry_name,
                params.join(", ")
            ));
        } else {
            if !self.dialect.builtins_in_functions() && !self.used_builtins().is_empty() {
                return Err(self.unsupported("thread builtins outside a kernel"));
            }
            let mut params = Vec::with_capacity(unit.formals.len());
            for (name, kind) in &unit.formals {
                params.push(format!("{} {}", self.ty(*kind)?, name));
            }
            let ret = self.ty(unit.return_kind)?;
            self.line(format!("{} {}({})", ret, unit.entry_name, params.join(", ")));
        }
        Ok(())
    }

    fn emit_declarations(&mut self) -> CompileResult<()> {
        let unit = self.unit;
        for (kind, vars) in &unit.variables {
            let names: Vec<&str> = vars.iter().map(|v| v.name.as_str()).collect();
            let ty = self.ty(*kind)?;
            self.line(format!("{} {};", ty, names.join(", ")));
        }
        for array in &unit.arrays {
            let declaration = self.dialect.array_declaration(
                self.space(array.region),
                &array.name,
                array.size_bytes(),
                array.element.size().clamp(4, 16),
            );
            self.line(declaration);
        }
        if !self.dialect.has_goto() {
            self.line(format!("int {} = {};", DISPATCH, unit.blocks.first().map_or(0, |b| b.id.0)));
        }
        self.line("");
        Ok(())
    }

    fn emit_labelled_blocks(&mut self) -> CompileResult<()> {
        let unit = self.unit;
        for (position, block) in unit.blocks.iter().enumerate() {
            let next = unit.blocks.get(position + 1).map(|b| b.id);
            self.indent -= 1;
            self.line(format!("{}: ;", label(block.id)));
            self.indent += 1;
            for inst in &block.instructions {
                self.emit_inst(inst, next)?;
            }
        }
        Ok(())
    }

    fn emit_dispatch_loop(&mut self) -> CompileResult<()> {
        let unit = self.unit;
        self.line("while (true) {");
        self.indent += 1;
        self.line(format!("switch ({}) {{", DISPATCH));
        for (position, block) in unit.blocks.iter().enumerate() {
            let next = unit.blocks.get(position + 1).map(|b| b.id);
            self.line(format!("case {}:", block.id.0));
            self.indent += 1;
            for inst in &block.instructions {
                self.emit_inst(inst, next)?;
            }
            self.indent -= 1;
        }
        self.line("}");
        self.indent -= 1;
        self.line("}");
        Ok(())
    }

    fn jump(&self, target: BlockId) -> String {
        if self.dialect.has_goto() {
            format!("goto {};", label(target))
        } else {
            format!("{} = {}; continue;", DISPATCH, target.0)
        }
    }

    fn operand(&self, op: &Operand) -> CompileResult<String> {
        match op {
            Operand::Var(v) => Ok(v.name.clone()),
            Operand::Const(c, kind) => self.literal(*c, *kind),
            Operand::Register(name, kind) => Ok(format!("(({}) {})", self.ty(*kind)?, name)),
            Operand::Formal(i, _) => self
                .unit
                .formals
                .get(*i as usize)
                .map(|(name, _)| name.clone())
                .ok_or_else(|| CompileError::Internal(format!("unknown formal {}", i))),
            Operand::Builtin(b, kind) => Ok(format!("(({}) {})", self.ty(*kind)?, self.dialect.builtin(*b)?)),
            Operand::Array(i) => {
                let array = self
                    .unit
                    .arrays
                    .get(*i as usize)
                    .ok_or_else(|| CompileError::Internal(format!("unknown array {}", i)))?;
                Ok(format!("(({}) {})", self.ty(self.device.word_kind())?, array.name))
            }
        }
    }

    fn literal(&self, c: Constant, kind: Kind) -> CompileResult<String> {
        let Kind::Scalar(s) = kind else {
            return Err(self.unsupported(format!("literal of kind {}", kind)));
        };
        scalar_literal(c, s)
    }

    fn emit_inst(&mut self, inst: &LirInst, next: Option<BlockId>) -> CompileResult<()> {
        match inst {
            LirInst::Assign { dest, expr } => {
                let value = self.expr(dest, expr)?;
                self.line(format!("{} = {};", dest.name, value));
            }
            LirInst::Eval(expr) => match expr {
                Expr::Call { callee, args } => {
                    let args = self.args(args)?;
                    self.line(format!("{}({});", callee, args));
                }
                other => return Err(CompileError::Internal(format!("effect-free {}", other))),
            },
            LirInst::Store {
                region,
                address,
                value,
            } => {
                let kind = value.kind();
                let v = self.operand(value)?;
                let (stored, v) = if kind.is_predicate() {
                    (Kind::U8, format!("(uchar) {}", v))
                } else {
                    (kind, v)
                };
                let target = self.deref(*region, stored, address)?;
                self.line(format!("{} = {};", target, v));
            }
            LirInst::Atomic {
                op,
                region,
                address,
                value,
            } => {
                let element = self.ty(value.kind())?;
                let v = self.operand(value)?;
                let a = self.operand(address)?;
                let call = self
                    .dialect
                    .atomic_update(&op.mnemonic, self.space(*region), &element, &a, &v);
                self.line(call);
            }
            LirInst::LaneStore { vector, lane, value } => {
                let v = self.operand(value)?;
                let target = self.dialect.lane(&vector.name, *lane);
                self.line(format!("{} = {};", target, v));
            }
            LirInst::Barrier(scope) => {
                let barrier = self.dialect.barrier(*scope);
                self.line(barrier);
            }
            LirInst::Comment(text) => {
                if self.options.emit_comments {
                    self.line(format!("/* {} */", text.replace("*/", "* /")));
                }
            }
            LirInst::Jump(target) => {
                if Some(*target) != next {
                    let jump = self.jump(*target);
                    self.line(jump);
                }
            }
            LirInst::Branch { predicate, target } => {
                let p = self.operand(predicate)?;
                let jump = self.jump(*target);
                self.line(format!("if ({}) {{ {} }}", p, jump));
            }
            LirInst::Return(value) => match value {
                Some(value) => {
                    let v = self.operand(value)?;
                    self.line(format!("return {};", v));
                }
                None => self.line("return;"),
            },
            LirInst::Trap(reason) => {
                self.line(format!("/* deopt: {} */", reason.replace("*/", "* /")));
                if self.unit.is_kernel || self.unit.return_kind.is_void() {
                    self.line("return;");
                } else {
                    let ty = self.ty(self.unit.return_kind)?;
                    self.line(format!("return ({}) 0;", ty));
                }
            }
        }
        Ok(())
    }

    fn deref(&self, region: Region, kind: Kind, address: &Operand) -> CompileResult<String> {
        let space = self.space(region);
        let qualifier = if space.is_empty() {
            String::new()
        } else {
            format!("{} ", space)
        };
        Ok(format!(
            "*(({}{} *) {})",
            qualifier,
            self.ty(kind)?,
            self.operand(address)?
        ))
    }

    fn args(&self, args: &[Operand]) -> CompileResult<String> {
        let mut rendered = Vec::with_capacity(args.len());
        for arg in args {
            rendered.push(self.operand(arg)?);
        }
        Ok(rendered.join(", "))
    }

    fn expr(&self, dest: &Variable, expr: &Expr) -> CompileResult<String> {
        let text = match expr {
            Expr::Move(src) => self.operand(src)?,
            Expr::Unary { op, value } => {
                let v = self.operand(value)?;
                match op.form {
                    OpForm::Prefix => format!("{}{}", op.mnemonic, v),
                    _ => format!("{}({})", op.mnemonic, v),
                }
            }
            Expr::Binary { op, left, right } => {
                let l = self.operand(left)?;
                let r = self.operand(right)?;
                match op.form {
                    OpForm::Infix if op.mnemonic == LOGICAL_SHIFT => {
                        let s = left
                            .kind()
                            .element()
                            .ok_or_else(|| CompileError::Internal(format!("shift of {}", left)))?;
                        let unsigned = scalar_name(unsigned_of(s));
                        format!("({}) (({}) {} >> {})", scalar_name(s), unsigned, l, r)
                    }
                    OpForm::Infix => format!("{} {} {}", l, op.mnemonic, r),
                    _ => format!("{}({}, {})", op.mnemonic, l, r),
                }
            }
            Expr::Ternary {
                first,
                second,
                third,
                ..
            } => {
                let a = self.operand(first)?;
                let b = self.operand(second)?;
                let p = self.operand(third)?;
                format!("{} ? {} : {}", p, a, b)
            }
            Expr::Convert { op, value } => {
                let v = self.operand(value)?;
                match op.form {
                    OpForm::Cast if dest.kind.is_predicate() => format!("{} != 0", v),
                    OpForm::Cast => format!("({}) {}", op.mnemonic, v),
                    _ => format!("{}({})", op.mnemonic, v),
                }
            }
            Expr::Load { region, address } => {
                if dest.kind.is_predicate() {
                    format!("{} != 0", self.deref(*region, Kind::U8, address)?)
                } else {
                    self.deref(*region, dest.kind, address)?
                }
            }
            Expr::Vector(lanes) => {
                let mut rendered = Vec::with_capacity(lanes.len());
                for lane in lanes {
                    rendered.push(self.operand(lane)?);
                }
                self.dialect.vector_literal(&self.ty(dest.kind)?, &rendered)
            }
            Expr::Lane { vector, lane } => {
                let v = self.operand(vector)?;
                self.dialect.lane(&v, *lane)
            }
            Expr::Call { callee, args } => format!("{}({})", callee, self.args(args)?),
        };
        Ok(text)
    }
}

/// C literal of a floating-point value, suffixed for `kind`.
pub fn float_literal(value: f64, kind: ScalarKind) -> String {
    if value.is_nan() {
        return "NAN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "INFINITY" } else { "-INFINITY" }.to_string();
    }
    match kind {
        ScalarKind::F64 => format!("{:?}", value),
        ScalarKind::F16 => format!("{:?}h", value as f32),
        _ => format!("{:?}f", value as f32),
    }
}

/// C spelling of `c` as a `s` immediate.
fn scalar_literal(c: Constant, s: ScalarKind) -> CompileResult<String> {
    let mismatch = || CompileError::malformed(format!("immediate {} is not a {}", c, s.name()));
    if !c.fits(s) {
        return Err(mismatch());
    }
    if s.is_float() {
        return Ok(float_literal(c.as_f64().ok_or_else(mismatch)?, s));
    }
    if s.is_predicate() {
        return Ok(c.as_bool().ok_or_else(mismatch)?.to_string());
    }
    let v = c.as_i64().ok_or_else(mismatch)?;
    let text = match s {
        ScalarKind::S32 if v == i32::MIN as i64 => "(-2147483647 - 1)".to_string(),
        ScalarKind::S32 => v.to_string(),
        ScalarKind::U32 => format!("{}u", v as u32),
        ScalarKind::S64 if v == i64::MIN => "(-9223372036854775807L - 1)".to_string(),
        ScalarKind::S64 => format!("{}L", v),
        ScalarKind::U64 => format!("{}UL", v as u64),
        small => format!("(({}) {})", scalar_name(small), v),
    };
    Ok(text)
}
