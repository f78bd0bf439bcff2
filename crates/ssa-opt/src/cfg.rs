//! Control-flow graph traversals
//!
//! Depth-first orderings over a function's blocks, shared by the dominance
//! and loop analyses. Blocks unreachable from the entry do not appear in
//! any ordering.

use rustc_hash::FxHashSet;
use ssa_core::{Block, Function};

/// Blocks in postorder, starting the walk at the entry block
pub fn postorder(f: &Function) -> Vec<Block> {
    let mut visited = FxHashSet::default();
    let mut order = Vec::new();
    dfs_postorder(f, f.entry(), &mut visited, &mut order);
    order
}

fn dfs_postorder(f: &Function, block: Block, visited: &mut FxHashSet<Block>, order: &mut Vec<Block>) {
    if !visited.insert(block) {
        return;
    }
    for succ in f.successors(block) {
        dfs_postorder(f, succ, visited, order);
    }
    order.push(block);
}

/// Blocks in reverse postorder; the entry block is first
pub fn reverse_postorder(f: &Function) -> Vec<Block> {
    let mut order = postorder(f);
    order.reverse();
    order
}
