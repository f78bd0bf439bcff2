//! Dominator and post-dominator trees
//!
//! Both trees are built with the iterative intersection algorithm over a
//! reverse-postorder numbering. The dominator tree additionally answers
//! value/use dominance queries (a constant or argument dominates every use;
//! an instruction dominates a use if its block strictly dominates the
//! user's block, or it comes earlier in the same block) and exposes its
//! children lists for preorder walks.

use rustc_hash::FxHashMap;
use ssa_core::{Block, Function, Value};

use crate::cfg;

/// Dominator tree over a function's reachable blocks
pub struct DominatorTree {
    rpo: Vec<Block>,
    rpo_num: FxHashMap<Block, usize>,
    idom: FxHashMap<Block, Block>,
    children: FxHashMap<Block, Vec<Block>>,
}

impl DominatorTree {
    /// Compute the dominator tree of a function
    pub fn compute(f: &Function) -> Self {
        let rpo = cfg::reverse_postorder(f);
        let rpo_num: FxHashMap<Block, usize> =
            rpo.iter().enumerate().map(|(i, &b)| (b, i)).collect();

        // idom of the entry is itself while iterating; exposed as None
        let mut idom: FxHashMap<Block, Block> = FxHashMap::default();
        idom.insert(f.entry(), f.entry());

        let mut changed = true;
        while changed {
            changed = false;
            for &block in rpo.iter().skip(1) {
                let mut new_idom: Option<Block> = None;
                for pred in f.predecessors(block) {
                    if !idom.contains_key(&pred) {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(cur) => intersect(&idom, &rpo_num, pred, cur),
                    });
                }
                if let Some(new_idom) = new_idom {
                    if idom.get(&block) != Some(&new_idom) {
                        idom.insert(block, new_idom);
                        changed = true;
                    }
                }
            }
        }

        let mut children: FxHashMap<Block, Vec<Block>> = FxHashMap::default();
        for &block in &rpo {
            if block == f.entry() {
                continue;
            }
            children.entry(idom[&block]).or_default().push(block);
        }
        // rpo iteration above keeps each child list in reverse-postorder
        Self {
            rpo,
            rpo_num,
            idom,
            children,
        }
    }

    /// Check if a block is reachable from the entry
    pub fn is_reachable(&self, b: Block) -> bool {
        self.rpo_num.contains_key(&b)
    }

    /// The blocks in reverse postorder
    pub fn rpo(&self) -> &[Block] {
        &self.rpo
    }

    /// The immediate dominator of a block; None for the entry and for
    /// unreachable blocks
    pub fn idom(&self, b: Block) -> Option<Block> {
        let id = *self.idom.get(&b)?;
        if id == b {
            None
        } else {
            Some(id)
        }
    }

    /// The dominator-tree children of a block, in reverse postorder
    pub fn children(&self, b: Block) -> &[Block] {
        self.children.get(&b).map_or(&[], |c| c.as_slice())
    }

    /// Check if `a` dominates `b` (reflexively)
    pub fn dominates(&self, a: Block, b: Block) -> bool {
        if a == b {
            return true;
        }
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return false;
        }
        let mut cur = b;
        while let Some(id) = self.idom(cur) {
            if id == a {
                return true;
            }
            cur = id;
        }
        false
    }

    /// Check if `a` strictly dominates `b`
    pub fn strictly_dominates(&self, a: Block, b: Block) -> bool {
        a != b && self.dominates(a, b)
    }

    /// Check if value `v` dominates the use of it at the non-phi
    /// instruction `user`
    pub fn dominates_use(&self, f: &Function, v: Value, user: Value) -> bool {
        let def_block = match f.parent(v) {
            // constants and arguments dominate every use
            None => return true,
            Some(b) => b,
        };
        let use_block = f.parent(user).expect("user is not installed");
        if def_block == use_block {
            let (_, def_at) = f.position(v).unwrap();
            let (_, use_at) = f.position(user).unwrap();
            def_at < use_at
        } else {
            self.strictly_dominates(def_block, use_block)
        }
    }
}

fn intersect(
    idom: &FxHashMap<Block, Block>,
    rpo_num: &FxHashMap<Block, usize>,
    mut a: Block,
    mut b: Block,
) -> Block {
    while a != b {
        while rpo_num[&a] > rpo_num[&b] {
            a = idom[&a];
        }
        while rpo_num[&b] > rpo_num[&a] {
            b = idom[&b];
        }
    }
    a
}

/// Post-dominator tree, built over the reversed CFG.
///
/// Functions with several exit blocks are handled with a virtual exit that
/// every exit block leads to; the immediate post-dominator of a block whose
/// only post-dominator is the virtual exit is reported as None.
pub struct PostDominatorTree {
    ipdom: FxHashMap<Block, Option<Block>>,
}

impl PostDominatorTree {
    /// Compute the post-dominator tree of a function
    pub fn compute(f: &Function) -> Self {
        // exits of the original CFG are the roots of the reversed one
        let exits: Vec<Block> = f
            .blocks()
            .iter()
            .copied()
            .filter(|&b| f.successors(b).is_empty())
            .collect();

        // postorder of the reversed graph, walking predecessor edges
        let mut visited: rustc_hash::FxHashSet<Block> = rustc_hash::FxHashSet::default();
        let mut post = Vec::new();
        fn dfs(f: &Function, b: Block, visited: &mut rustc_hash::FxHashSet<Block>, post: &mut Vec<Block>) {
            if !visited.insert(b) {
                return;
            }
            for p in f.predecessors(b) {
                dfs(f, p, visited, post);
            }
            post.push(b);
        }
        for &e in &exits {
            dfs(f, e, &mut visited, &mut post);
        }
        post.reverse();

        // number 0 is the virtual exit; reachable blocks follow in the
        // reversed graph's reverse postorder
        let mut num: FxHashMap<Block, usize> = FxHashMap::default();
        for (i, &b) in post.iter().enumerate() {
            num.insert(b, i + 1);
        }
        let is_exit = |b: Block| f.successors(b).is_empty();

        let mut doms: Vec<Option<usize>> = vec![None; post.len() + 1];
        doms[0] = Some(0);

        let intersect = |doms: &[Option<usize>], mut a: usize, mut b: usize| -> usize {
            while a != b {
                while a > b {
                    a = doms[a].unwrap();
                }
                while b > a {
                    b = doms[b].unwrap();
                }
            }
            a
        };

        let mut changed = true;
        while changed {
            changed = false;
            for (i, &block) in post.iter().enumerate() {
                let n = i + 1;
                let mut new_dom: Option<usize> = if is_exit(block) { Some(0) } else { None };
                for succ in f.successors(block) {
                    let Some(&sn) = num.get(&succ) else { continue };
                    if doms[sn].is_none() {
                        continue;
                    }
                    new_dom = Some(match new_dom {
                        None => sn,
                        Some(cur) => intersect(&doms, sn, cur),
                    });
                }
                if let Some(new_dom) = new_dom {
                    if doms[n] != Some(new_dom) {
                        doms[n] = Some(new_dom);
                        changed = true;
                    }
                }
            }
        }

        let mut ipdom = FxHashMap::default();
        for (i, &block) in post.iter().enumerate() {
            match doms[i + 1] {
                Some(0) => {
                    ipdom.insert(block, None);
                }
                Some(d) => {
                    ipdom.insert(block, Some(post[d - 1]));
                }
                None => {}
            }
        }
        Self { ipdom }
    }

    /// Check if `a` post-dominates `b` (reflexively)
    pub fn post_dominates(&self, a: Block, b: Block) -> bool {
        if a == b {
            return true;
        }
        if !self.ipdom.contains_key(&a) || !self.ipdom.contains_key(&b) {
            return false;
        }
        let mut cur = b;
        while let Some(&Some(p)) = self.ipdom.get(&cur) {
            if p == a {
                return true;
            }
            cur = p;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssa_core::{Builder, Function, Type};

    fn diamond() -> (Function, Block, Block, Block, Block) {
        let mut f = Function::new("diamond", &[Type::i1()], Type::Void);
        let entry = f.add_block("entry");
        let left = f.add_block("left");
        let right = f.add_block("right");
        let join = f.add_block("join");
        let c = f.param(0);
        let mut b = Builder::new(&mut f);
        b.position_at_end(entry);
        b.build_cond_br(c, left, right);
        b.position_at_end(left);
        b.build_br(join);
        b.position_at_end(right);
        b.build_br(join);
        b.position_at_end(join);
        b.build_ret(None);
        (f, entry, left, right, join)
    }

    #[test]
    fn test_diamond_dominance() {
        let (f, entry, left, right, join) = diamond();
        let dt = DominatorTree::compute(&f);
        assert!(dt.dominates(entry, join));
        assert!(dt.dominates(entry, left));
        assert!(!dt.dominates(left, join));
        assert!(!dt.dominates(right, join));
        assert_eq!(dt.idom(join), Some(entry));
        assert_eq!(dt.idom(entry), None);
    }

    #[test]
    fn test_diamond_post_dominance() {
        let (f, entry, left, right, join) = diamond();
        let pdt = PostDominatorTree::compute(&f);
        assert!(pdt.post_dominates(join, entry));
        assert!(pdt.post_dominates(join, left));
        assert!(!pdt.post_dominates(left, entry));
        assert!(!pdt.post_dominates(right, entry));
    }

    #[test]
    fn test_dominates_use_same_block() {
        let mut f = Function::new("line", &[Type::i32()], Type::i32());
        let entry = f.add_block("entry");
        let x = f.param(0);
        let mut b = Builder::new(&mut f);
        b.position_at_end(entry);
        let a = b.build_add(x, x);
        let c = b.build_mul(a, a);
        b.build_ret(Some(c));
        let dt = DominatorTree::compute(&f);
        assert!(dt.dominates_use(&f, a, c));
        assert!(!dt.dominates_use(&f, c, a));
        assert!(dt.dominates_use(&f, x, a));
    }
}
