//! Node model of the kernel graph.
//!
//! Nodes are a closed sum type: every later stage matches exhaustively on
//! [`Op`], so adding an operator forces each stage to decide how to handle it.

use super::{BlockId, Kind, NodeId, ScalarKind};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    /// Arithmetic shift right
    Shr,
    /// Logical shift right
    UShr,
    Min,
    Max,
}

impl BinaryOp {
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            BinaryOp::Add
                | BinaryOp::Mul
                | BinaryOp::And
                | BinaryOp::Or
                | BinaryOp::Xor
                | BinaryOp::Min
                | BinaryOp::Max
        )
    }

    pub fn is_bitwise(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or | BinaryOp::Xor)
    }

    pub fn is_shift(self) -> bool {
        matches!(self, BinaryOp::Shl | BinaryOp::Shr | BinaryOp::UShr)
    }

    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Rem => "rem",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
            BinaryOp::Shl => "shl",
            BinaryOp::Shr => "shr",
            BinaryOp::UShr => "ushr",
            BinaryOp::Min => "min",
            BinaryOp::Max => "max",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
    Abs,
    Sqrt,
    Rsqrt,
    Sin,
    Cos,
    Exp2,
    Log2,
    Floor,
    Ceil,
}

impl UnaryOp {
    /// Operators only defined on floating-point kinds.
    pub fn is_float_only(self) -> bool {
        !matches!(self, UnaryOp::Neg | UnaryOp::Not | UnaryOp::Abs)
    }

    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Not => "not",
            UnaryOp::Abs => "abs",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Rsqrt => "rsqrt",
            UnaryOp::Sin => "sin",
            UnaryOp::Cos => "cos",
            UnaryOp::Exp2 => "exp2",
            UnaryOp::Log2 => "log2",
            UnaryOp::Floor => "floor",
            UnaryOp::Ceil => "ceil",
        }
    }
}

/// Read-modify-write combine of an atomic update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomicOp {
    Add,
    Min,
    Max,
}

impl AtomicOp {
    pub fn name(self) -> &'static str {
        match self {
            AtomicOp::Add => "add",
            AtomicOp::Min => "min",
            AtomicOp::Max => "max",
        }
    }

    /// The arithmetic a plain update `a[i] = a[i] op v` spells it with.
    pub fn binary(self) -> BinaryOp {
        match self {
            AtomicOp::Add => BinaryOp::Add,
            AtomicOp::Min => BinaryOp::Min,
            AtomicOp::Max => BinaryOp::Max,
        }
    }
}

/// Comparison condition; signedness comes from the operand kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Condition {
    pub fn negate(self) -> Condition {
        match self {
            Condition::Eq => Condition::Ne,
            Condition::Ne => Condition::Eq,
            Condition::Lt => Condition::Ge,
            Condition::Le => Condition::Gt,
            Condition::Gt => Condition::Le,
            Condition::Ge => Condition::Lt,
        }
    }

    /// Condition with operands swapped: `a < b` is `b > a`.
    pub fn mirror(self) -> Condition {
        match self {
            Condition::Eq => Condition::Eq,
            Condition::Ne => Condition::Ne,
            Condition::Lt => Condition::Gt,
            Condition::Le => Condition::Ge,
            Condition::Gt => Condition::Lt,
            Condition::Ge => Condition::Le,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Condition::Eq => "eq",
            Condition::Ne => "ne",
            Condition::Lt => "lt",
            Condition::Le => "le",
            Condition::Gt => "gt",
            Condition::Ge => "ge",
        }
    }

    fn holds<T: PartialOrd>(self, a: T, b: T) -> bool {
        match self {
            Condition::Eq => a == b,
            Condition::Ne => a != b,
            Condition::Lt => a < b,
            Condition::Le => a <= b,
            Condition::Gt => a > b,
            Condition::Ge => a >= b,
        }
    }
}

/// Logical memory region of an access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    Global,
    Constant,
    Local,
    Private,
}

impl Region {
    pub const ALL: [Region; 4] = [Region::Global, Region::Constant, Region::Local, Region::Private];

    pub fn name(self) -> &'static str {
        match self {
            Region::Global => "global",
            Region::Constant => "constant",
            Region::Local => "local",
            Region::Private => "private",
        }
    }
}

/// Target-neutral thread identity queries, lowered per target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    GlobalThreadId(u8),
    GlobalThreadCount(u8),
    LocalThreadId(u8),
    LocalGroupSize(u8),
    GroupId(u8),
    GroupCount(u8),
}

impl Intrinsic {
    pub fn dim(self) -> u8 {
        match self {
            Intrinsic::GlobalThreadId(d)
            | Intrinsic::GlobalThreadCount(d)
            | Intrinsic::LocalThreadId(d)
            | Intrinsic::LocalGroupSize(d)
            | Intrinsic::GroupId(d)
            | Intrinsic::GroupCount(d) => d,
        }
    }
}

/// Registers and builtin variables a target reads directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    /// `%tid`
    ThreadIdx(u8),
    /// `%ntid`
    BlockDim(u8),
    /// `%ctaid`
    BlockIdx(u8),
    /// `%nctaid`
    GridDim(u8),
    GlobalId(u8),
    GlobalSize(u8),
    LocalId(u8),
    LocalSize(u8),
    GroupId(u8),
    NumGroups(u8),
}

impl Builtin {
    pub fn dim(self) -> u8 {
        match self {
            Builtin::ThreadIdx(d)
            | Builtin::BlockDim(d)
            | Builtin::BlockIdx(d)
            | Builtin::GridDim(d)
            | Builtin::GlobalId(d)
            | Builtin::GlobalSize(d)
            | Builtin::LocalId(d)
            | Builtin::LocalSize(d)
            | Builtin::GroupId(d)
            | Builtin::NumGroups(d) => d,
        }
    }

    pub fn axis(self) -> char {
        match self.dim() {
            0 => 'x',
            1 => 'y',
            _ => 'z',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarrierScope {
    /// Work-group barrier ordering local memory
    Local,
    /// Work-group barrier ordering global memory
    Global,
}

/// Constant payload. Floats are kept as raw bits so nodes can be hashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Constant {
    Int(i64),
    Float(u64),
    Bool(bool),
}

impl Constant {
    pub fn float(value: f64) -> Self {
        Constant::Float(value.to_bits())
    }

    pub fn as_i64(self) -> Option<i64> {
        match self {
            Constant::Int(v) => Some(v),
            Constant::Bool(b) => Some(b as i64),
            Constant::Float(_) => None,
        }
    }

    pub fn as_f64(self) -> Option<f64> {
        match self {
            Constant::Float(bits) => Some(f64::from_bits(bits)),
            _ => None,
        }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            Constant::Bool(b) => Some(b),
            Constant::Int(v) => Some(v != 0),
            Constant::Float(_) => None,
        }
    }

    /// Whether the payload can be emitted as an immediate of `kind`: floats
    /// for floating kinds, integers or booleans for the rest.
    pub fn fits(self, kind: ScalarKind) -> bool {
        match self {
            Constant::Float(_) => kind.is_float(),
            Constant::Int(_) | Constant::Bool(_) => !kind.is_float(),
        }
    }

    pub fn is_int(self, value: i64) -> bool {
        self == Constant::Int(value)
    }

    /// Canonical form of the constant for `kind`: integers wrapped to the
    /// kind's width, 32-bit floats rounded.
    pub fn normalize(self, kind: ScalarKind) -> Constant {
        match (self, kind) {
            (Constant::Int(v), k) if k.is_integer() => Constant::Int(wrap_int(v, k)),
            (Constant::Float(bits), ScalarKind::F32) => {
                Constant::float(f64::from_bits(bits) as f32 as f64)
            }
            (c, _) => c,
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Int(v) => write!(f, "{}", v),
            Constant::Float(bits) => write!(f, "{:?}", f64::from_bits(*bits)),
            Constant::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// Sign- or zero-extend the low bits of `value` according to `kind`.
pub fn wrap_int(value: i64, kind: ScalarKind) -> i64 {
    match kind {
        ScalarKind::S8 => value as i8 as i64,
        ScalarKind::U8 => value as u8 as i64,
        ScalarKind::S16 => value as i16 as i64,
        ScalarKind::U16 => value as u16 as i64,
        ScalarKind::S32 => value as i32 as i64,
        ScalarKind::U32 => value as u32 as i64,
        _ => value,
    }
}

fn unsigned_bits(value: i64, kind: ScalarKind) -> u64 {
    match kind.bits() {
        64 => value as u64,
        bits => (value as u64) & ((1u64 << bits) - 1),
    }
}

fn round_float(value: f64, kind: ScalarKind) -> Option<Constant> {
    match kind {
        ScalarKind::F32 => Some(Constant::float(value as f32 as f64)),
        ScalarKind::F64 => Some(Constant::float(value)),
        _ => None,
    }
}

/// Evaluate `a op b` at compile time; `None` when the result is not a
/// compile-time constant (division by zero, half precision, ...).
pub fn fold_binary(op: BinaryOp, kind: ScalarKind, a: Constant, b: Constant) -> Option<Constant> {
    if kind.is_predicate() {
        let (x, y) = (a.as_bool()?, b.as_bool()?);
        return match op {
            BinaryOp::And => Some(Constant::Bool(x & y)),
            BinaryOp::Or => Some(Constant::Bool(x | y)),
            BinaryOp::Xor => Some(Constant::Bool(x ^ y)),
            _ => None,
        };
    }
    if kind.is_float() {
        let (x, y) = (a.as_f64()?, b.as_f64()?);
        let result = match op {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
            BinaryOp::Div => x / y,
            BinaryOp::Rem => x % y,
            BinaryOp::Min => x.min(y),
            BinaryOp::Max => x.max(y),
            _ => return None,
        };
        return round_float(result, kind);
    }
    let (x, y) = (wrap_int(a.as_i64()?, kind), wrap_int(b.as_i64()?, kind));
    let shift = (y as u32) & (kind.bits() - 1);
    let result = if kind.is_unsigned() {
        let (ux, uy) = (unsigned_bits(x, kind), unsigned_bits(y, kind));
        match op {
            BinaryOp::Div if uy == 0 => return None,
            BinaryOp::Rem if uy == 0 => return None,
            BinaryOp::Div => (ux / uy) as i64,
            BinaryOp::Rem => (ux % uy) as i64,
            BinaryOp::Min => ux.min(uy) as i64,
            BinaryOp::Max => ux.max(uy) as i64,
            BinaryOp::Shr | BinaryOp::UShr => (ux >> shift) as i64,
            _ => return fold_common_int(op, x, y, shift).map(|v| Constant::Int(wrap_int(v, kind))),
        }
    } else {
        match op {
            BinaryOp::Div if y == 0 => return None,
            BinaryOp::Rem if y == 0 => return None,
            BinaryOp::Div => x.wrapping_div(y),
            BinaryOp::Rem => x.wrapping_rem(y),
            BinaryOp::Min => x.min(y),
            BinaryOp::Max => x.max(y),
            BinaryOp::Shr => x >> shift,
            BinaryOp::UShr => (unsigned_bits(x, kind) >> shift) as i64,
            _ => return fold_common_int(op, x, y, shift).map(|v| Constant::Int(wrap_int(v, kind))),
        }
    };
    Some(Constant::Int(wrap_int(result, kind)))
}

fn fold_common_int(op: BinaryOp, x: i64, y: i64, shift: u32) -> Option<i64> {
    match op {
        BinaryOp::Add => Some(x.wrapping_add(y)),
        BinaryOp::Sub => Some(x.wrapping_sub(y)),
        BinaryOp::Mul => Some(x.wrapping_mul(y)),
        BinaryOp::And => Some(x & y),
        BinaryOp::Or => Some(x | y),
        BinaryOp::Xor => Some(x ^ y),
        BinaryOp::Shl => Some(x.wrapping_shl(shift)),
        _ => None,
    }
}

pub fn fold_unary(op: UnaryOp, kind: ScalarKind, a: Constant) -> Option<Constant> {
    if kind.is_predicate() {
        return match op {
            UnaryOp::Not => Some(Constant::Bool(!a.as_bool()?)),
            _ => None,
        };
    }
    if kind.is_float() {
        let x = a.as_f64()?;
        let result = match op {
            UnaryOp::Neg => -x,
            UnaryOp::Abs => x.abs(),
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Floor => x.floor(),
            UnaryOp::Ceil => x.ceil(),
            // device transcendental precision differs from the host
            _ => return None,
        };
        return round_float(result, kind);
    }
    let x = wrap_int(a.as_i64()?, kind);
    let result = match op {
        UnaryOp::Neg => x.wrapping_neg(),
        UnaryOp::Not => !x,
        UnaryOp::Abs if kind.is_unsigned() => x,
        UnaryOp::Abs => x.wrapping_abs(),
        _ => return None,
    };
    Some(Constant::Int(wrap_int(result, kind)))
}

pub fn fold_compare(cond: Condition, kind: ScalarKind, a: Constant, b: Constant) -> Option<bool> {
    if kind.is_float() {
        return Some(cond.holds(a.as_f64()?, b.as_f64()?));
    }
    if kind.is_predicate() {
        return Some(cond.holds(a.as_bool()?, b.as_bool()?));
    }
    let (x, y) = (wrap_int(a.as_i64()?, kind), wrap_int(b.as_i64()?, kind));
    if kind.is_unsigned() {
        Some(cond.holds(unsigned_bits(x, kind), unsigned_bits(y, kind)))
    } else {
        Some(cond.holds(x, y))
    }
}

pub fn fold_convert(from: ScalarKind, to: ScalarKind, a: Constant) -> Option<Constant> {
    if to.is_predicate() {
        return match a {
            Constant::Float(_) => None,
            other => Some(Constant::Bool(other.as_i64()? != 0)),
        };
    }
    if to.is_float() {
        let value = if from.is_float() {
            a.as_f64()?
        } else if from.is_unsigned() {
            unsigned_bits(a.as_i64()?, from) as f64
        } else {
            a.as_i64()? as f64
        };
        return round_float(value, to);
    }
    let value = if from.is_float() {
        let x = a.as_f64()?;
        match to {
            ScalarKind::S8 => x as i8 as i64,
            ScalarKind::U8 => x as u8 as i64,
            ScalarKind::S16 => x as i16 as i64,
            ScalarKind::U16 => x as u16 as i64,
            ScalarKind::S32 => x as i32 as i64,
            ScalarKind::U32 => x as u32 as i64,
            ScalarKind::U64 => x as u64 as i64,
            _ => x as i64,
        }
    } else if from.is_unsigned() {
        unsigned_bits(a.as_i64()?, from) as i64
    } else {
        a.as_i64()?
    };
    Some(Constant::Int(wrap_int(value, to)))
}

/// Identity of a compiled method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodId {
    pub declaring_type: String,
    /// `None` for anonymous methods (lambdas without a stable name).
    pub name: Option<String>,
}

impl MethodId {
    pub fn new(declaring_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            declaring_type: declaring_type.into(),
            name: Some(name.into()),
        }
    }

    pub fn anonymous(declaring_type: impl Into<String>) -> Self {
        Self {
            declaring_type: declaring_type.into(),
            name: None,
        }
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}.{}", self.declaring_type, name),
            None => write!(f, "{}.<anonymous>", self.declaring_type),
        }
    }
}

/// Operator tag of a node. Input layout per operator is listed on each
/// variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Op {
    Constant(Constant),
    /// Formal parameter by position
    Parameter(u32),
    /// `[left, right]`
    Binary(BinaryOp),
    /// `[value]`
    Unary(UnaryOp),
    /// `[left, right]`, result is a predicate
    Compare(Condition),
    /// `[condition, if_true, if_false]`
    Conditional,
    /// `[value]`, converts to the node kind
    Convert,
    /// One input per predecessor of the owning block, in predecessor order
    Phi,
    /// Memory-ordering merge, one input per predecessor
    MemoryPhi,
    /// Thread-private or work-group array
    NewArray { element: Kind, length: u32, region: Region },
    /// `[base, index]` before address lowering, `[address]` after
    Read { region: Option<Region>, floating: bool },
    /// `[base, index, value]` before address lowering, `[address, value]` after
    Write { region: Option<Region> },
    /// `[base, index, value]` before address lowering, `[address, value]`
    /// after; combines `value` into memory atomically and yields nothing
    AtomicUpdate { op: AtomicOp, region: Option<Region> },
    /// `[base, byte_offset]`
    Address { region: Region },
    /// `[value]`, loop bound on a parallel dimension
    ParallelRange(u8),
    /// `[value]`, first iteration on a parallel dimension
    ParallelOffset(u8),
    /// `[value]`, step on a parallel dimension
    ParallelStride(u8),
    Intrinsic(Intrinsic),
    Builtin(Builtin),
    Barrier(BarrierScope),
    /// One input per lane
    VectorValue,
    /// `[vector]`
    VectorElement(u8),
    /// `[vector, value]`, overwrites one lane in place
    VectorLaneStore(u8),
    /// Call arguments
    Invoke(MethodId),
    /// `[condition, frame_state?]`, deoptimizes when the condition is false
    Guard,
    /// Values live at a deoptimization point
    FrameState,
    /// `[object]`
    NullCheck,
}

impl Op {
    /// Fixed nodes keep their position in their block; the rest float and are
    /// placed by scheduling.
    pub fn is_fixed(&self) -> bool {
        match self {
            Op::Read { floating, .. } => !floating,
            Op::Write { .. }
            | Op::AtomicUpdate { .. }
            | Op::NewArray { .. }
            | Op::Barrier(_)
            | Op::VectorLaneStore(_)
            | Op::Invoke(_)
            | Op::Guard
            | Op::NullCheck => true,
            _ => false,
        }
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, Op::Phi | Op::MemoryPhi)
    }

    /// Floating and free of side effects, so equal nodes can be merged.
    pub fn is_pure(&self) -> bool {
        !self.is_fixed()
            && !self.is_phi()
            && !matches!(
                self,
                Op::FrameState | Op::Read { .. } | Op::ParallelRange(_) | Op::ParallelOffset(_)
                    | Op::ParallelStride(_)
            )
    }

    pub fn is_memory_access(&self) -> bool {
        matches!(self, Op::Read { .. } | Op::Write { .. } | Op::AtomicUpdate { .. })
    }

    /// Writes and atomic updates: `[base, index, value]` until lowered.
    pub fn is_store(&self) -> bool {
        matches!(self, Op::Write { .. } | Op::AtomicUpdate { .. })
    }

    pub fn is_parallel_marker(&self) -> bool {
        matches!(
            self,
            Op::ParallelRange(_) | Op::ParallelOffset(_) | Op::ParallelStride(_)
        )
    }

    pub fn describe(&self) -> String {
        match self {
            Op::Constant(c) => format!("const {}", c),
            Op::Parameter(i) => format!("param {}", i),
            Op::Binary(op) => op.name().to_string(),
            Op::Unary(op) => op.name().to_string(),
            Op::Compare(cond) => format!("cmp.{}", cond.name()),
            Op::Conditional => "select".to_string(),
            Op::Convert => "convert".to_string(),
            Op::Phi => "phi".to_string(),
            Op::MemoryPhi => "memphi".to_string(),
            Op::NewArray {
                element,
                length,
                region,
            } => format!("new {}[{}] in {}", element, length, region.name()),
            Op::Read { region, floating } => format!(
                "read{}{}",
                region.map(|r| format!(".{}", r.name())).unwrap_or_default(),
                if *floating { " floating" } else { "" }
            ),
            Op::Write { region } => format!(
                "write{}",
                region.map(|r| format!(".{}", r.name())).unwrap_or_default()
            ),
            Op::AtomicUpdate { op, region } => format!(
                "atomic.{}{}",
                op.name(),
                region.map(|r| format!(".{}", r.name())).unwrap_or_default()
            ),
            Op::Address { region } => format!("address.{}", region.name()),
            Op::ParallelRange(d) => format!("parallel.range[{}]", d),
            Op::ParallelOffset(d) => format!("parallel.offset[{}]", d),
            Op::ParallelStride(d) => format!("parallel.stride[{}]", d),
            Op::Intrinsic(i) => format!("{:?}", i),
            Op::Builtin(b) => format!("{:?}", b),
            Op::Barrier(scope) => format!("barrier.{:?}", scope).to_lowercase(),
            Op::VectorValue => "vector".to_string(),
            Op::VectorElement(lane) => format!("lane {}", lane),
            Op::VectorLaneStore(lane) => format!("store lane {}", lane),
            Op::Invoke(method) => format!("invoke {}", method),
            Op::Guard => "guard".to_string(),
            Op::FrameState => "framestate".to_string(),
            Op::NullCheck => "nullcheck".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub op: Op,
    pub inputs: SmallVec<[NodeId; 4]>,
    pub kind: Kind,
    /// Owning block of fixed nodes and phis; the anchor block of floating reads.
    pub block: Option<BlockId>,
}

impl Node {
    pub fn new(op: Op, inputs: &[NodeId], kind: Kind) -> Self {
        Self {
            op,
            inputs: SmallVec::from_slice(inputs),
            kind,
            block: None,
        }
    }

    pub fn constant(&self) -> Option<Constant> {
        match self.op {
            Op::Constant(c) => Some(c),
            _ => None,
        }
    }

    pub fn input(&self, index: usize) -> Option<NodeId> {
        self.inputs.get(index).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_wraps_to_kind_width() {
        let sum = fold_binary(
            BinaryOp::Add,
            ScalarKind::S32,
            Constant::Int(i32::MAX as i64),
            Constant::Int(1),
        );
        assert_eq!(sum, Some(Constant::Int(i32::MIN as i64)));

        let byte = fold_binary(BinaryOp::Mul, ScalarKind::U8, Constant::Int(16), Constant::Int(17));
        assert_eq!(byte, Some(Constant::Int(16)));
    }

    #[test]
    fn test_fold_division_by_zero_is_not_constant() {
        assert_eq!(
            fold_binary(BinaryOp::Div, ScalarKind::S32, Constant::Int(1), Constant::Int(0)),
            None
        );
        assert_eq!(
            fold_binary(BinaryOp::Rem, ScalarKind::U64, Constant::Int(1), Constant::Int(0)),
            None
        );
    }

    #[test]
    fn test_fold_shifts() {
        assert_eq!(
            fold_binary(BinaryOp::UShr, ScalarKind::S32, Constant::Int(-1), Constant::Int(28)),
            Some(Constant::Int(15))
        );
        assert_eq!(
            fold_binary(BinaryOp::Shr, ScalarKind::S32, Constant::Int(-16), Constant::Int(2)),
            Some(Constant::Int(-4))
        );
        // shift amounts are masked to the width
        assert_eq!(
            fold_binary(BinaryOp::Shl, ScalarKind::S32, Constant::Int(1), Constant::Int(33)),
            Some(Constant::Int(2))
        );
    }

    #[test]
    fn test_fold_unsigned_compare() {
        assert_eq!(
            fold_compare(Condition::Lt, ScalarKind::U32, Constant::Int(-1), Constant::Int(1)),
            Some(false)
        );
        assert_eq!(
            fold_compare(Condition::Lt, ScalarKind::S32, Constant::Int(-1), Constant::Int(1)),
            Some(true)
        );
    }

    #[test]
    fn test_fold_float_rounds_to_f32() {
        let third = fold_binary(
            BinaryOp::Div,
            ScalarKind::F32,
            Constant::float(1.0),
            Constant::float(3.0),
        )
        .unwrap();
        assert_eq!(third.as_f64(), Some((1.0f32 / 3.0f32) as f64));
        assert_eq!(fold_unary(UnaryOp::Sin, ScalarKind::F32, Constant::float(1.0)), None);
    }

    #[test]
    fn test_fold_convert_saturates() {
        assert_eq!(
            fold_convert(ScalarKind::F32, ScalarKind::S32, Constant::float(1e20)),
            Some(Constant::Int(i32::MAX as i64))
        );
        assert_eq!(
            fold_convert(ScalarKind::F64, ScalarKind::S32, Constant::float(f64::NAN)),
            Some(Constant::Int(0))
        );
        assert_eq!(
            fold_convert(ScalarKind::U8, ScalarKind::S32, Constant::Int(200)),
            Some(Constant::Int(200))
        );
    }

    #[test]
    fn test_fixed_classification() {
        assert!(Op::Write { region: None }.is_fixed());
        assert!(Op::Read { region: None, floating: false }.is_fixed());
        assert!(!Op::Read { region: None, floating: true }.is_fixed());
        assert!(!Op::Read { region: None, floating: true }.is_pure());
        assert!(Op::Binary(BinaryOp::Add).is_pure());
        assert!(!Op::Phi.is_pure());
    }
}
