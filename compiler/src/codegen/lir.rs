//! Low-level IR
//!
//! Target-near instruction lists produced by instruction selection. Operator
//! mnemonics are already chosen by the target's dispatch table; the
//! assemblers only serialize.

use super::calling_convention::ParamBinding;
use super::target::Opcode;
use crate::ir::{BarrierScope, BlockId, Builtin, Constant, Kind, MethodId, Region};
use serde::Serialize;
use std::fmt;

/// A symbolic register: `prefix(kind) + index`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Variable {
    pub kind: Kind,
    pub index: u32,
    pub name: String,
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Var(Variable),
    Const(Constant, Kind),
    /// Frame pointer or region base passed in the kernel signature
    Register(&'static str, Kind),
    /// Formal argument `index` of a callee unit
    Formal(u32, Kind),
    Builtin(Builtin, Kind),
    /// Base address of declared array storage
    Array(u32),
}

impl Operand {
    pub fn kind(&self) -> Kind {
        match self {
            Operand::Var(v) => v.kind,
            Operand::Const(_, kind)
            | Operand::Register(_, kind)
            | Operand::Formal(_, kind)
            | Operand::Builtin(_, kind) => *kind,
            Operand::Array(_) => Kind::U64,
        }
    }

    pub fn as_var(&self) -> Option<&Variable> {
        match self {
            Operand::Var(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Var(v) => write!(f, "{}", v),
            Operand::Const(c, kind) => write!(f, "{}:{}", c, kind),
            Operand::Register(name, _) => write!(f, "%{}", name),
            Operand::Formal(i, _) => write!(f, "arg{}", i),
            Operand::Builtin(b, _) => write!(f, "{:?}", b),
            Operand::Array(i) => write!(f, "array{}", i),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Move(Operand),
    Unary {
        op: Opcode,
        value: Operand,
    },
    Binary {
        op: Opcode,
        left: Operand,
        right: Operand,
    },
    /// Select: `(if_true, if_false, predicate)`
    Ternary {
        op: Opcode,
        first: Operand,
        second: Operand,
        third: Operand,
    },
    Convert {
        op: Opcode,
        value: Operand,
    },
    Load {
        region: Region,
        address: Operand,
    },
    Vector(Vec<Operand>),
    Lane {
        vector: Operand,
        lane: u8,
    },
    Call {
        callee: String,
        args: Vec<Operand>,
    },
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Move(v) => write!(f, "{}", v),
            Expr::Unary { op, value } => write!(f, "{} {}", op.mnemonic, value),
            Expr::Binary { op, left, right } => write!(f, "{} {}, {}", op.mnemonic, left, right),
            Expr::Ternary {
                op,
                first,
                second,
                third,
            } => write!(f, "{} {}, {}, {}", op.mnemonic, first, second, third),
            Expr::Convert { op, value } => write!(f, "{} {}", op.mnemonic, value),
            Expr::Load { region, address } => write!(f, "load.{} [{}]", region.name(), address),
            Expr::Vector(lanes) => {
                write!(f, "vector(")?;
                for (i, lane) in lanes.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", lane)?;
                }
                write!(f, ")")
            }
            Expr::Lane { vector, lane } => write!(f, "{}[{}]", vector, lane),
            Expr::Call { callee, args } => {
                write!(f, "call {}(", callee)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LirInst {
    Assign { dest: Variable, expr: Expr },
    /// Side-effecting expression without a result (void calls)
    Eval(Expr),
    Store {
        region: Region,
        address: Operand,
        value: Operand,
    },
    LaneStore {
        vector: Variable,
        lane: u8,
        value: Operand,
    },
    /// Combine `value` into the element at `address` atomically.
    Atomic {
        op: Opcode,
        region: Region,
        address: Operand,
        value: Operand,
    },
    Barrier(BarrierScope),
    Comment(String),
    Jump(BlockId),
    /// Branch to `target` when `predicate` holds, fall through otherwise.
    Branch { predicate: Operand, target: BlockId },
    Return(Option<Operand>),
    Trap(String),
}

impl fmt::Display for LirInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LirInst::Assign { dest, expr } => write!(f, "{} = {}", dest, expr),
            LirInst::Eval(expr) => write!(f, "{}", expr),
            LirInst::Store {
                region,
                address,
                value,
            } => write!(f, "store.{} [{}], {}", region.name(), address, value),
            LirInst::LaneStore {
                vector,
                lane,
                value,
            } => write!(f, "{}[{}] = {}", vector, lane, value),
            LirInst::Atomic {
                op,
                region,
                address,
                value,
            } => write!(f, "{}.{} [{}], {}", op.mnemonic, region.name(), address, value),
            LirInst::Barrier(scope) => write!(f, "barrier {:?}", scope),
            LirInst::Comment(text) => write!(f, "// {}", text),
            LirInst::Jump(target) => write!(f, "jump {}", target),
            LirInst::Branch { predicate, target } => write!(f, "if {} jump {}", predicate, target),
            LirInst::Return(Some(v)) => write!(f, "return {}", v),
            LirInst::Return(None) => write!(f, "return"),
            LirInst::Trap(reason) => write!(f, "trap \"{}\"", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LirBlock {
    pub id: BlockId,
    pub instructions: Vec<LirInst>,
}

/// Storage declared by a kernel-local allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalArray {
    pub name: String,
    pub region: Region,
    pub element: Kind,
    pub length: u32,
}

impl LocalArray {
    pub fn size_bytes(&self) -> u32 {
        self.element.size() * self.length
    }
}

/// Signature of a non-inlined callee, as seen from the call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalleeDecl {
    pub method: MethodId,
    pub name: String,
    pub params: Vec<Kind>,
    pub return_kind: Kind,
}

/// One compile unit in LIR form, blocks in emission order.
#[derive(Debug, Clone)]
pub struct LirUnit {
    pub entry_name: String,
    pub method: MethodId,
    pub is_kernel: bool,
    pub return_kind: Kind,
    pub parameters: Vec<ParamBinding>,
    /// Formal argument names and kinds of a callee unit
    pub formals: Vec<(String, Kind)>,
    pub frame: Option<Variable>,
    /// Region base registers the body references
    pub region_bases: Vec<Region>,
    pub arrays: Vec<LocalArray>,
    /// Declared variables per kind, in first-allocation order
    pub variables: Vec<(Kind, Vec<Variable>)>,
    pub blocks: Vec<LirBlock>,
    pub callees: Vec<CalleeDecl>,
}

impl LirUnit {
    pub fn instructions(&self) -> impl Iterator<Item = &LirInst> {
        self.blocks.iter().flat_map(|b| b.instructions.iter())
    }

    pub fn variable_count(&self) -> usize {
        self.variables.iter().map(|(_, vars)| vars.len()).sum()
    }
}

impl fmt::Display for LirUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} {} ({} variables)",
            if self.is_kernel { "kernel" } else { "function" },
            self.entry_name,
            self.variable_count()
        )?;
        for block in &self.blocks {
            writeln!(f, "{}:", block.id)?;
            for inst in &block.instructions {
                writeln!(f, "    {}", inst)?;
            }
        }
        Ok(())
    }
}
