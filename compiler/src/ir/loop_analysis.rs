//! Dominators and loop nests of a kernel graph
//!
//! Scheduling uses both to pick blocks for floating nodes; full unrolling
//! uses the loop nest to find counted loops.
//!
//! Everything is keyed and ordered by reverse postorder so results do not
//! depend on hash iteration order.

use super::{BlockId, KernelGraph};
use fxhash::FxHashMap;
use indexmap::{IndexMap, IndexSet};
use std::collections::VecDeque;

/// Dominator tree of the blocks reachable from the entry.
///
/// `d` dominates `b` when every entry-to-`b` path passes through `d`.
#[derive(Debug, Clone)]
pub struct DominatorTree {
    /// idom per block; the entry has none
    idom: FxHashMap<BlockId, BlockId>,

    /// Children in the dominator tree, in reverse postorder
    children: FxHashMap<BlockId, Vec<BlockId>>,

    /// Distance from the entry in the tree
    depth: FxHashMap<BlockId, usize>,

    rpo: Vec<BlockId>,

    entry: BlockId,
}

impl DominatorTree {
    /// Compute the dominator tree using Cooper, Harvey, and Kennedy's
    /// iterative algorithm.
    pub fn compute(graph: &KernelGraph) -> Self {
        let entry = graph.entry();
        let rpo = Self::reverse_postorder(graph, entry);
        let rpo_index: FxHashMap<BlockId, usize> =
            rpo.iter().enumerate().map(|(i, &b)| (b, i)).collect();

        let mut idom: FxHashMap<BlockId, Option<BlockId>> =
            rpo.iter().map(|&b| (b, None)).collect();
        idom.insert(entry, Some(entry));

        let mut changed = true;
        while changed {
            changed = false;

            for &block in &rpo {
                if block == entry {
                    continue;
                }

                let predecessors = graph
                    .block(block)
                    .map(|b| b.predecessors.clone())
                    .unwrap_or_default();

                let mut new_idom: Option<BlockId> = None;
                for &pred in &predecessors {
                    if idom.get(&pred).and_then(|x| *x).is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(current) => Self::intersect(current, pred, &idom, &rpo_index),
                    });
                }

                if new_idom != idom.get(&block).copied().flatten() {
                    idom.insert(block, new_idom);
                    changed = true;
                }
            }
        }

        let mut final_idom: FxHashMap<BlockId, BlockId> = FxHashMap::default();
        let mut children: FxHashMap<BlockId, Vec<BlockId>> = FxHashMap::default();
        for &block in &rpo {
            if block == entry {
                continue;
            }
            if let Some(Some(dom)) = idom.get(&block) {
                final_idom.insert(block, *dom);
                children.entry(*dom).or_default().push(block);
            }
        }

        let mut depth: FxHashMap<BlockId, usize> = FxHashMap::default();
        depth.insert(entry, 0);
        let mut queue: VecDeque<BlockId> = VecDeque::new();
        queue.push_back(entry);
        while let Some(block) = queue.pop_front() {
            let d = depth.get(&block).copied().unwrap_or(0);
            for &child in children.get(&block).map(|v| v.as_slice()).unwrap_or(&[]) {
                depth.insert(child, d + 1);
                queue.push_back(child);
            }
        }

        Self {
            idom: final_idom,
            children,
            depth,
            rpo,
            entry,
        }
    }

    fn reverse_postorder(graph: &KernelGraph, entry: BlockId) -> Vec<BlockId> {
        let mut visited = IndexSet::new();
        let mut postorder = Vec::new();

        fn dfs(
            graph: &KernelGraph,
            block: BlockId,
            visited: &mut IndexSet<BlockId>,
            postorder: &mut Vec<BlockId>,
        ) {
            if !visited.insert(block) {
                return;
            }
            if let Ok(successors) = graph.successors(block) {
                for succ in successors {
                    dfs(graph, succ, visited, postorder);
                }
            }
            postorder.push(block);
        }

        dfs(graph, entry, &mut visited, &mut postorder);
        postorder.reverse();
        postorder
    }

    fn intersect(
        mut b1: BlockId,
        mut b2: BlockId,
        idom: &FxHashMap<BlockId, Option<BlockId>>,
        rpo_index: &FxHashMap<BlockId, usize>,
    ) -> BlockId {
        while b1 != b2 {
            let mut idx1 = rpo_index.get(&b1).copied().unwrap_or(usize::MAX);
            let mut idx2 = rpo_index.get(&b2).copied().unwrap_or(usize::MAX);

            while idx1 > idx2 {
                match idom.get(&b1) {
                    Some(Some(dom)) => {
                        b1 = *dom;
                        idx1 = rpo_index.get(&b1).copied().unwrap_or(usize::MAX);
                    }
                    _ => return b1,
                }
            }

            while idx2 > idx1 {
                match idom.get(&b2) {
                    Some(Some(dom)) => {
                        b2 = *dom;
                        idx2 = rpo_index.get(&b2).copied().unwrap_or(usize::MAX);
                    }
                    _ => return b2,
                }
            }
        }
        b1
    }

    pub fn entry(&self) -> BlockId {
        self.entry
    }

    /// Reachable blocks in reverse postorder.
    pub fn reverse_postorder_blocks(&self) -> &[BlockId] {
        &self.rpo
    }

    pub fn is_reachable(&self, block: BlockId) -> bool {
        block == self.entry || self.idom.contains_key(&block)
    }

    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        self.idom.get(&block).copied()
    }

    pub fn children(&self, block: BlockId) -> &[BlockId] {
        self.children.get(&block).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn depth(&self, block: BlockId) -> usize {
        self.depth.get(&block).copied().unwrap_or(0)
    }

    /// Reflexive: every block dominates itself.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if a == b {
            return true;
        }

        let mut current = b;
        while let Some(dom) = self.idom.get(&current) {
            if *dom == a {
                return true;
            }
            current = *dom;
        }

        a == self.entry
    }

    pub fn strictly_dominates(&self, a: BlockId, b: BlockId) -> bool {
        a != b && self.dominates(a, b)
    }

    /// Closest common dominator of two blocks.
    pub fn common_dominator(&self, mut a: BlockId, mut b: BlockId) -> BlockId {
        while self.depth(a) > self.depth(b) {
            a = self.idom(a).unwrap_or(self.entry);
        }
        while self.depth(b) > self.depth(a) {
            b = self.idom(b).unwrap_or(self.entry);
        }
        while a != b {
            a = self.idom(a).unwrap_or(self.entry);
            b = self.idom(b).unwrap_or(self.entry);
        }
        a
    }
}

/// Loop formed by the back edges into one header. The body is every block
/// that reaches a back-edge source without passing the header.
#[derive(Debug, Clone)]
pub struct NaturalLoop {
    pub header: BlockId,

    /// Sources of back edges to the header
    pub back_edge_sources: Vec<BlockId>,

    /// Body blocks, header included
    pub blocks: IndexSet<BlockId>,

    /// Blocks in the loop with edges outside the loop
    pub exit_blocks: Vec<BlockId>,

    /// Single predecessor of the header from outside the loop, if any
    pub preheader: Option<BlockId>,

    /// 0 for an outermost loop
    pub nesting_depth: usize,

    pub parent: Option<BlockId>,

    pub children: Vec<BlockId>,
}

/// Loop nest information for a graph.
#[derive(Debug, Clone, Default)]
pub struct LoopNestInfo {
    /// Natural loops keyed by header, in reverse postorder of headers
    pub loops: IndexMap<BlockId, NaturalLoop>,

    pub top_level_loops: Vec<BlockId>,

    /// Innermost containing loop header of each block
    pub block_to_loop: FxHashMap<BlockId, BlockId>,

    pub max_depth: usize,
}

impl LoopNestInfo {
    pub fn analyze(graph: &KernelGraph, domtree: &DominatorTree) -> Self {
        let mut loops: IndexMap<BlockId, NaturalLoop> = IndexMap::new();

        for &block_id in domtree.reverse_postorder_blocks() {
            let successors = graph.successors(block_id).unwrap_or_default();
            for succ in successors {
                if !domtree.dominates(succ, block_id) {
                    continue;
                }
                // back edge block_id -> succ
                let loop_blocks = Self::find_loop_blocks(graph, succ, block_id);
                if let Some(existing) = loops.get_mut(&succ) {
                    existing.back_edge_sources.push(block_id);
                    existing.blocks.extend(loop_blocks);
                } else {
                    loops.insert(
                        succ,
                        NaturalLoop {
                            header: succ,
                            back_edge_sources: vec![block_id],
                            blocks: loop_blocks,
                            exit_blocks: Vec::new(),
                            preheader: None,
                            nesting_depth: 0,
                            parent: None,
                            children: Vec::new(),
                        },
                    );
                }
            }
        }

        // keep header order aligned with reverse postorder
        let order: FxHashMap<BlockId, usize> = domtree
            .reverse_postorder_blocks()
            .iter()
            .enumerate()
            .map(|(i, &b)| (b, i))
            .collect();
        loops.sort_by(|a, _, b, _| order.get(a).cmp(&order.get(b)));

        for natural_loop in loops.values_mut() {
            natural_loop.exit_blocks = Self::find_exit_blocks(graph, &natural_loop.blocks);
            natural_loop.preheader =
                Self::find_preheader(graph, natural_loop.header, &natural_loop.blocks);
        }

        // innermost enclosing loop = smallest other loop containing the header
        let headers: Vec<BlockId> = loops.keys().copied().collect();
        for &header in &headers {
            let mut parent: Option<(BlockId, usize)> = None;
            for &other in &headers {
                if other == header {
                    continue;
                }
                let Some(other_loop) = loops.get(&other) else {
                    continue;
                };
                if other_loop.blocks.contains(&header) {
                    let size = other_loop.blocks.len();
                    if parent.map_or(true, |(_, best)| size < best) {
                        parent = Some((other, size));
                    }
                }
            }
            if let Some(natural_loop) = loops.get_mut(&header) {
                natural_loop.parent = parent.map(|(p, _)| p);
            }
        }

        for &header in &headers {
            let parent = loops.get(&header).and_then(|l| l.parent);
            if let Some(parent_loop) = parent.and_then(|p| loops.get_mut(&p)) {
                parent_loop.children.push(header);
            }
        }

        let top_level_loops: Vec<BlockId> = headers
            .iter()
            .filter(|h| loops.get(*h).map_or(false, |l| l.parent.is_none()))
            .copied()
            .collect();

        fn set_depth(loops: &mut IndexMap<BlockId, NaturalLoop>, header: BlockId, depth: usize) {
            let children = match loops.get_mut(&header) {
                Some(natural_loop) => {
                    natural_loop.nesting_depth = depth;
                    natural_loop.children.clone()
                }
                None => return,
            };
            for child in children {
                set_depth(loops, child, depth + 1);
            }
        }

        for &top_level in &top_level_loops {
            set_depth(&mut loops, top_level, 0);
        }

        let max_depth = loops.values().map(|l| l.nesting_depth).max().unwrap_or(0);

        let mut block_to_loop: FxHashMap<BlockId, BlockId> = FxHashMap::default();
        for (&header, loop_info) in &loops {
            for &block in &loop_info.blocks {
                let deeper = match block_to_loop.get(&block).and_then(|h| loops.get(h)) {
                    Some(existing) => loop_info.nesting_depth > existing.nesting_depth,
                    None => true,
                };
                if deeper {
                    block_to_loop.insert(block, header);
                }
            }
        }

        Self {
            loops,
            top_level_loops,
            block_to_loop,
            max_depth,
        }
    }

    fn find_loop_blocks(
        graph: &KernelGraph,
        header: BlockId,
        back_edge_source: BlockId,
    ) -> IndexSet<BlockId> {
        let mut loop_blocks = IndexSet::new();
        loop_blocks.insert(header);

        if header == back_edge_source {
            return loop_blocks;
        }

        // walk backwards from the back edge source until the header
        let mut worklist = vec![back_edge_source];
        loop_blocks.insert(back_edge_source);

        while let Some(block) = worklist.pop() {
            if let Ok(b) = graph.block(block) {
                for &pred in &b.predecessors {
                    if loop_blocks.insert(pred) {
                        worklist.push(pred);
                    }
                }
            }
        }

        loop_blocks
    }

    fn find_exit_blocks(graph: &KernelGraph, loop_blocks: &IndexSet<BlockId>) -> Vec<BlockId> {
        loop_blocks
            .iter()
            .copied()
            .filter(|&block| {
                graph
                    .successors(block)
                    .map(|succs| succs.iter().any(|s| !loop_blocks.contains(s)))
                    .unwrap_or(false)
            })
            .collect()
    }

    fn find_preheader(
        graph: &KernelGraph,
        header: BlockId,
        loop_blocks: &IndexSet<BlockId>,
    ) -> Option<BlockId> {
        let header_block = graph.block(header).ok()?;
        let outside: Vec<BlockId> = header_block
            .predecessors
            .iter()
            .filter(|p| !loop_blocks.contains(*p))
            .copied()
            .collect();

        if let [pred] = outside.as_slice() {
            if graph.successors(*pred).ok()?.len() == 1 {
                return Some(*pred);
            }
        }
        None
    }

    pub fn get_loop(&self, block: BlockId) -> Option<&NaturalLoop> {
        self.block_to_loop.get(&block).and_then(|h| self.loops.get(h))
    }

    /// Loop depth for a block (0 if not in any loop).
    pub fn loop_depth(&self, block: BlockId) -> usize {
        self.get_loop(block).map(|l| l.nesting_depth + 1).unwrap_or(0)
    }

    pub fn is_loop_header(&self, block: BlockId) -> bool {
        self.loops.contains_key(&block)
    }

    /// Whether `block` lies inside the loop headed by `header`.
    pub fn in_loop(&self, header: BlockId, block: BlockId) -> bool {
        self.loops
            .get(&header)
            .map_or(false, |l| l.blocks.contains(&block))
    }

    /// Loops in reverse nesting order (innermost first).
    pub fn loops_innermost_first(&self) -> Vec<&NaturalLoop> {
        let mut loops: Vec<&NaturalLoop> = self.loops.values().collect();
        loops.sort_by_key(|l| std::cmp::Reverse(l.nesting_depth));
        loops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Condition, GraphBuilder, Kind, MethodId};

    #[test]
    fn test_dominator_tree_simple() {
        // Diamond CFG:
        //      entry
        //       /\
        //    bb1  bb2
        //       \/
        //      bb3
        let mut b = GraphBuilder::kernel(MethodId::new("T", "diamond"));
        let cond = b.boolean(true);
        let bb1 = b.create_block();
        let bb2 = b.create_block();
        let bb3 = b.create_block();
        b.branch(cond, bb1, bb2).unwrap();
        b.switch_to_block(bb1);
        b.jump(bb3).unwrap();
        b.switch_to_block(bb2);
        b.jump(bb3).unwrap();
        b.switch_to_block(bb3);
        b.ret(None).unwrap();
        let graph = b.finish().unwrap();

        let domtree = DominatorTree::compute(&graph);
        let entry = BlockId::entry();
        assert!(domtree.dominates(entry, bb1));
        assert!(domtree.dominates(entry, bb3));
        assert!(!domtree.dominates(bb1, bb2));
        assert!(!domtree.dominates(bb2, bb1));
        assert_eq!(domtree.idom(bb3), Some(entry));
        assert_eq!(domtree.common_dominator(bb1, bb2), entry);
        assert_eq!(domtree.depth(bb3), 1);
    }

    #[test]
    fn test_simple_loop_detection() {
        //     entry
        //       |
        //     header <----+
        //      |   \      |
        //     exit  body--+
        let mut b = GraphBuilder::kernel(MethodId::new("T", "loop"));
        let zero = b.int(0);
        let n = b.int(8);
        let header = b.create_block();
        let body = b.create_block();
        let exit = b.create_block();
        b.jump(header).unwrap();
        b.switch_to_block(header);
        let i = b.phi(header, &[zero], Kind::S32).unwrap();
        let cond = b.compare(Condition::Lt, i, n);
        b.branch(cond, body, exit).unwrap();
        b.switch_to_block(body);
        let one = b.int(1);
        let next = b.add(i, one);
        b.add_phi_input(i, next).unwrap();
        b.jump(header).unwrap();
        b.switch_to_block(exit);
        b.ret(None).unwrap();
        let graph = b.finish().unwrap();

        let domtree = DominatorTree::compute(&graph);
        let loop_info = LoopNestInfo::analyze(&graph, &domtree);
        assert_eq!(loop_info.loops.len(), 1);
        assert!(loop_info.is_loop_header(header));

        let the_loop = &loop_info.loops[&header];
        assert!(the_loop.blocks.contains(&body));
        assert!(!the_loop.blocks.contains(&exit));
        assert_eq!(the_loop.back_edge_sources, vec![body]);
        assert_eq!(the_loop.preheader, Some(BlockId::entry()));
        assert_eq!(loop_info.loop_depth(body), 1);
        assert_eq!(loop_info.loop_depth(exit), 0);
    }
}
