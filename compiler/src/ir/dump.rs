//! Graph Dump Utility
//!
//! Pretty-prints a kernel graph for trace logging and test failure output.
//! When a schedule is present every node is printed inside its block;
//! otherwise floating nodes are listed after the blocks.

use super::graph::Terminator;
use super::{KernelGraph, Node, NodeId};
use fxhash::FxHashSet;
use std::fmt::Write;

pub fn dump_graph(graph: &KernelGraph) -> String {
    let mut out = String::new();
    let params: Vec<String> = graph
        .parameters
        .iter()
        .map(|p| format!("{}: {:?}", p.name, p.ty))
        .collect();
    let _ = writeln!(
        out,
        "{} {}({}) -> {} {{",
        if graph.is_kernel { "kernel" } else { "fn" },
        graph.method,
        params.join(", "),
        graph.return_kind
    );

    let mut printed = FxHashSet::default();
    for block in graph.blocks() {
        let preds: Vec<String> = block.predecessors.iter().map(|p| p.to_string()).collect();
        let _ = writeln!(out, "{}:  ; preds = [{}]", block.id, preds.join(", "));
        let ordered: Vec<NodeId> = match graph.schedule() {
            Some(schedule) => schedule.nodes_in(block.id).to_vec(),
            None => block.phis.iter().chain(block.fixed.iter()).copied().collect(),
        };
        for id in ordered {
            if let Some(node) = graph.get(id) {
                printed.insert(id);
                let _ = writeln!(out, "  {}", dump_node(id, node));
            }
        }
        let _ = writeln!(out, "  {}", dump_terminator(&block.terminator));
    }

    let floating: Vec<(NodeId, &Node)> = graph
        .nodes()
        .filter(|(id, _)| !printed.contains(id))
        .collect();
    if !floating.is_empty() {
        let _ = writeln!(out, "floating:");
        for (id, node) in floating {
            let _ = writeln!(out, "  {}", dump_node(id, node));
        }
    }
    let _ = writeln!(out, "}}");
    out
}

pub fn dump_node(id: NodeId, node: &Node) -> String {
    let inputs: Vec<String> = node.inputs.iter().map(|i| i.to_string()).collect();
    if node.kind.is_value() {
        format!(
            "{} = {} [{}] : {}",
            id,
            node.op.describe(),
            inputs.join(", "),
            node.kind
        )
    } else {
        format!("{} [{}]", node.op.describe(), inputs.join(", "))
    }
}

pub fn dump_terminator(terminator: &Terminator) -> String {
    match terminator {
        Terminator::Jump(target) => format!("jump {}", target),
        Terminator::If {
            condition,
            then_block,
            else_block,
        } => format!("if {} then {} else {}", condition, then_block, else_block),
        Terminator::Switch {
            value,
            keys,
            targets,
            default,
        } => {
            let cases: Vec<String> = keys
                .iter()
                .zip(targets)
                .map(|(k, t)| format!("{} => {}", k, t))
                .collect();
            format!(
                "switch {} [{}] default {}",
                value,
                cases.join(", "),
                default
            )
        }
        Terminator::Return(Some(value)) => format!("return {}", value),
        Terminator::Return(None) => "return".to_string(),
        Terminator::Deopt(reason) => format!("deopt \"{}\"", reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{GraphBuilder, Kind, MethodId};

    #[test]
    fn test_dump_lists_floating_nodes() {
        let mut b = GraphBuilder::kernel(MethodId::new("Vec", "scale"));
        let a = b.array_parameter("a", Kind::F32);
        let i = b.int(0);
        let x = b.read(a, i, Kind::F32).unwrap();
        let two = b.float(2.0);
        let y = b.mul(x, two);
        b.write(a, i, y).unwrap();
        b.ret(None).unwrap();
        let graph = b.finish().unwrap();

        let text = dump_graph(&graph);
        assert!(text.starts_with("kernel Vec.scale(a: Array"));
        assert!(text.contains("bb0:"));
        assert!(text.contains("= read ["));
        assert!(text.contains("floating:"));
        assert!(text.contains("= mul ["));
        assert!(text.trim_end().ends_with('}'));
    }
}
