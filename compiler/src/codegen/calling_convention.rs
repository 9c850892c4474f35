//! Kernel calling convention
//!
//! A kernel receives one frame pointer. Argument `i` lives in the 8-byte
//! slot `RESERVED_SLOTS + i` of the frame; the reserved slots carry
//! runtime bookkeeping the kernel never reads. Callee units take their
//! arguments as ordinary formals instead.
//!
//! ```text
//!   frame: | reserved 0 | reserved 1 | reserved 2 | arg 0 | arg 1 | ...
//!          0            8            16           24      32
//! ```

use super::instruction_lowering::LirGenerator;
use super::lir::{Expr, Operand, Variable};
use super::target::FRAME_REGISTER;
use crate::error::{CompileError, CompileResult};
use crate::ir::memory::{resolve_roots, MemoryRoot};
use crate::ir::{BinaryOp, Constant, Kind, KernelGraph, MethodId, Op, Region};
use indexmap::IndexSet;
use serde::Serialize;

pub const RESERVED_SLOTS: u32 = 3;
pub const FRAME_SLOT_BYTES: u32 = 8;

/// How the kernel body uses a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    None,
    Read,
    Write,
    ReadWrite,
}

impl Access {
    fn join(self, other: Access) -> Access {
        match (self, other) {
            (Access::None, x) | (x, Access::None) => x,
            (a, b) if a == b => a,
            _ => Access::ReadWrite,
        }
    }

    pub fn reads(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub fn writes(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

/// Where parameter `index` is found and how the body uses it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParamBinding {
    pub index: u32,
    pub name: String,
    pub kind: Kind,
    pub is_array: bool,
    pub access: Access,
    #[serde(skip)]
    pub variable: Variable,
    /// Byte offset of the argument slot in the kernel frame
    pub frame_offset: Option<u32>,
}

pub fn frame_offset(index: u32) -> u32 {
    (RESERVED_SLOTS + index) * FRAME_SLOT_BYTES
}

/// Per-parameter access summary. Scalars are read; arrays are classified
/// by the accesses whose base resolves to them. An array passed to a call
/// is assumed read and written.
pub fn infer_access(graph: &KernelGraph) -> Vec<Access> {
    let mut access: Vec<Access> = graph
        .parameters
        .iter()
        .map(|p| if p.ty.is_array() { Access::None } else { Access::Read })
        .collect();

    let mut mark = |roots: Option<IndexSet<MemoryRoot>>, how: Access| {
        for root in roots.into_iter().flatten() {
            if let MemoryRoot::Parameter(i) = root {
                if let Some(slot) = access.get_mut(i as usize) {
                    *slot = slot.join(how);
                }
            }
        }
    };

    for (_, node) in graph.nodes() {
        let how = match node.op {
            Op::Read { .. } => Access::Read,
            Op::Write { .. } => Access::Write,
            Op::AtomicUpdate { .. } => Access::ReadWrite,
            Op::Invoke(_) => {
                for &arg in &node.inputs {
                    mark(resolve_roots(graph, arg), Access::ReadWrite);
                }
                continue;
            }
            _ => continue,
        };
        let Some(mut base) = node.input(0) else {
            continue;
        };
        // lowered accesses go through an address node
        if let Ok(Op::Address { .. }) = graph.op(base) {
            if let Some(inner) = graph.get(base).and_then(|n| n.input(0)) {
                base = inner;
            }
        }
        mark(resolve_roots(graph, base), how);
    }
    access
}

/// Symbol for a method: its qualified name with every character that is
/// not valid in an identifier replaced by `_`. Anonymous methods have none.
pub fn symbol_name(method: &MethodId) -> Option<String> {
    let name = method.name.as_ref()?;
    Some(sanitize(&format!("{}_{}", method.declaring_type, name)))
}

pub fn sanitize(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.starts_with(|c: char| c.is_ascii_digit()) || out.is_empty() {
        out.insert(0, '_');
    }
    out
}

impl LirGenerator<'_> {
    /// Bind every formal parameter to a variable at the top of the entry block.
    pub(super) fn emit_prologue(&mut self) -> CompileResult<()> {
        let graph = self.graph;
        let access = infer_access(graph);
        let word = self.device.word_kind();

        if graph.is_kernel {
            let frame = self.temp(word, Expr::Move(Operand::Register(FRAME_REGISTER, word)))?;
            self.frame = Some(frame.clone());
            let add = self.target.binary_op(BinaryOp::Add, word)?;
            for (i, param) in graph.parameters.iter().enumerate() {
                let index = i as u32;
                let kind = param_kind(graph, index, word);
                let offset = frame_offset(index);
                let slot = self.temp(
                    word,
                    Expr::Binary {
                        op: add.clone(),
                        left: Operand::Var(frame.clone()),
                        right: Operand::Const(Constant::Int(offset as i64), word),
                    },
                )?;
                let variable = self.temp(
                    kind,
                    Expr::Load {
                        region: Region::Global,
                        address: Operand::Var(slot),
                    },
                )?;
                self.parameters.push(ParamBinding {
                    index,
                    name: param.name.clone(),
                    kind,
                    is_array: param.ty.is_array(),
                    access: access[i],
                    variable,
                    frame_offset: Some(offset),
                });
            }
        } else {
            if graph.locals.len() < graph.parameters.len() {
                return Err(CompileError::malformed(format!(
                    "{} declares {} parameters but only {} locals",
                    graph.method,
                    graph.parameters.len(),
                    graph.locals.len()
                )));
            }
            for (i, param) in graph.parameters.iter().enumerate() {
                let index = i as u32;
                let kind = param_kind(graph, index, word);
                self.formals.push((sanitize(&graph.locals[i].name), kind));
                let variable = self.temp(kind, Expr::Move(Operand::Formal(index, kind)))?;
                self.parameters.push(ParamBinding {
                    index,
                    name: param.name.clone(),
                    kind,
                    is_array: param.ty.is_array(),
                    access: access[i],
                    variable,
                    frame_offset: None,
                });
            }
        }
        Ok(())
    }
}

/// Kind of the parameter node, or the word kind for references.
fn param_kind(graph: &KernelGraph, index: u32, word: Kind) -> Kind {
    graph
        .nodes()
        .find(|(_, n)| n.op == Op::Parameter(index))
        .map(|(_, n)| n.kind)
        .filter(|k| k.is_value())
        .unwrap_or(word)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::GraphBuilder;

    #[test]
    fn test_frame_offsets_skip_reserved_slots() {
        assert_eq!(frame_offset(0), 24);
        assert_eq!(frame_offset(2), 40);
    }

    #[test]
    fn test_symbol_names_are_identifiers() {
        let method = MethodId::new("demo.Kernels$Inner", "saxpy");
        assert_eq!(symbol_name(&method).unwrap(), "demo_Kernels_Inner_saxpy");
        assert!(symbol_name(&MethodId::anonymous("demo.Lambda")).is_none());
        assert_eq!(sanitize("1st"), "_1st");
    }

    #[test]
    fn test_access_follows_reads_and_writes() {
        let mut b = GraphBuilder::kernel(MethodId::new("T", "copy"));
        let src = b.array_parameter("src", Kind::F32);
        let dst = b.array_parameter("dst", Kind::F32);
        let _unused = b.array_parameter("unused", Kind::F32);
        let n = b.scalar_parameter("n", Kind::S32);
        let v = b.read(src, n, Kind::F32).unwrap();
        b.write(dst, n, v).unwrap();
        b.ret(None).unwrap();
        let graph = b.finish().unwrap();

        assert_eq!(
            infer_access(&graph),
            vec![Access::Read, Access::Write, Access::None, Access::Read]
        );
    }

    #[test]
    fn test_join_widens_to_read_write() {
        assert_eq!(Access::Read.join(Access::Write), Access::ReadWrite);
        assert_eq!(Access::None.join(Access::Write), Access::Write);
        assert!(Access::ReadWrite.reads() && Access::ReadWrite.writes());
    }
}
