//! Loop forest analysis
//!
//! Natural loops are discovered from back edges (edges whose target
//! dominates their source), grouped by header, and nested into a forest.
//! The per-loop queries answer the canonical-form questions the loop
//! passes depend on: unique preheader, unique latch, exiting and exit
//! blocks, guard branch, and the canonical induction variable (a header
//! phi starting at 0 and stepping by a constant on the latch edge).
//!
//! Passes that cannot prove canonical form from these queries must decline
//! to transform.

use indexmap::IndexSet;
use rustc_hash::FxHashMap;
use ssa_core::{Block, Function, Opcode, Value};

use crate::cfg;
use crate::domtree::DominatorTree;

/// A natural loop: its header, its blocks in reverse postorder, and its
/// position in the forest
pub struct Loop {
    header: Block,
    blocks: IndexSet<Block>,
    latches: Vec<Block>,
    parent: Option<usize>,
    children: Vec<usize>,
    depth: u32,
}

impl Loop {
    /// The loop header
    pub fn header(&self) -> Block {
        self.header
    }

    /// Check if the loop contains a block
    pub fn contains(&self, b: Block) -> bool {
        self.blocks.contains(&b)
    }

    /// The loop's blocks, header first, in reverse postorder
    pub fn blocks(&self) -> impl Iterator<Item = Block> + '_ {
        self.blocks.iter().copied()
    }

    /// Nesting depth; top-level loops have depth 1
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// The enclosing loop, if any
    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    /// The unique latch (in-loop predecessor of the header), if there is
    /// exactly one
    pub fn latch(&self) -> Option<Block> {
        match self.latches.as_slice() {
            &[latch] => Some(latch),
            _ => None,
        }
    }

    /// The unique preheader: the single out-of-loop predecessor of the
    /// header, whose only successor is the header
    pub fn preheader(&self, f: &Function) -> Option<Block> {
        let outside: Vec<Block> = f
            .predecessors(self.header)
            .into_iter()
            .filter(|p| !self.contains(*p))
            .collect();
        match outside.as_slice() {
            &[p] if f.successors(p).len() == 1 => Some(p),
            _ => None,
        }
    }

    /// Blocks inside the loop with a successor outside it
    pub fn exiting_blocks(&self, f: &Function) -> Vec<Block> {
        self.blocks()
            .filter(|&b| f.successors(b).iter().any(|s| !self.contains(*s)))
            .collect()
    }

    /// Unique blocks outside the loop reached from inside it
    pub fn exit_blocks(&self, f: &Function) -> Vec<Block> {
        let mut exits = IndexSet::new();
        for b in self.blocks() {
            for s in f.successors(b) {
                if !self.contains(s) {
                    exits.insert(s);
                }
            }
        }
        exits.into_iter().collect()
    }

    /// Unique exit blocks, not counting exits taken from a latch
    pub fn unique_non_latch_exit_blocks(&self, f: &Function) -> Vec<Block> {
        let mut exits = IndexSet::new();
        for b in self.blocks() {
            if self.latches.contains(&b) {
                continue;
            }
            for s in f.successors(b) {
                if !self.contains(s) {
                    exits.insert(s);
                }
            }
        }
        exits.into_iter().collect()
    }

    /// The guard branch: the conditional terminator of the preheader's
    /// single predecessor, when its other arm jumps past the loop to one
    /// of the loop's exit blocks
    pub fn guard_branch(&self, f: &Function) -> Option<Value> {
        let preheader = self.preheader(f)?;
        let preds = f.predecessors(preheader);
        let &[guard] = preds.as_slice() else {
            return None;
        };
        let term = f.terminator(guard)?;
        let inst = f.inst(term)?;
        if inst.opcode() != Opcode::CondBr {
            return None;
        }
        let exits = self.exit_blocks(f);
        let skips_loop = inst
            .blocks()
            .iter()
            .any(|t| *t != preheader && exits.contains(t));
        let enters_loop = inst.blocks().contains(&preheader);
        (skips_loop && enters_loop).then_some(term)
    }

    /// Check if the loop is guarded
    pub fn is_guarded(&self, f: &Function) -> bool {
        self.guard_branch(f).is_some()
    }

    /// The block through which control enters the loop's region: the guard
    /// block if guarded, the preheader otherwise
    pub fn entry_block(&self, f: &Function) -> Option<Block> {
        match self.guard_branch(f) {
            Some(guard) => f.parent(guard),
            None => self.preheader(f),
        }
    }

    /// The canonical induction variable: a header phi whose incoming value
    /// is 0 from the preheader and `add(self, constant step)` from the
    /// latch
    pub fn canonical_induction_variable(&self, f: &Function) -> Option<Value> {
        self.canonical_iv_and_step(f).map(|(iv, _)| iv)
    }

    /// The canonical induction variable together with its constant step
    pub fn canonical_iv_and_step(&self, f: &Function) -> Option<(Value, i64)> {
        let preheader = self.preheader(f)?;
        let latch = self.latch()?;
        for &inst in f.insts(self.header) {
            let data = f.inst(inst)?;
            if data.opcode() != Opcode::Phi {
                // phis are grouped at the top of the header
                break;
            }
            let start = data.incoming_for(preheader)?;
            if f.const_bits(start) != Some(0) {
                continue;
            }
            let next = data.incoming_for(latch)?;
            let Some(step_inst) = f.inst(next) else {
                continue;
            };
            if step_inst.opcode() != Opcode::Add {
                continue;
            }
            let &[a, b] = step_inst.operands() else {
                continue;
            };
            let step = if a == inst {
                f.const_signed(b)
            } else if b == inst {
                f.const_signed(a)
            } else {
                None
            };
            if let Some(step) = step.filter(|&s| s != 0) {
                return Some((inst, step));
            }
        }
        None
    }
}

/// The loop forest of a function
pub struct LoopInfo {
    loops: Vec<Loop>,
    preorder: Vec<usize>,
    innermost: FxHashMap<Block, usize>,
}

impl LoopInfo {
    /// Discover the loop forest of a function
    pub fn compute(f: &Function, dt: &DominatorTree) -> Self {
        let rpo = cfg::reverse_postorder(f);

        // back edges grouped by header, in discovery order
        let mut latches_of: Vec<(Block, Vec<Block>)> = Vec::new();
        for &b in &rpo {
            for s in f.successors(b) {
                if dt.dominates(s, b) {
                    match latches_of.iter_mut().find(|(h, _)| *h == s) {
                        Some((_, latches)) => latches.push(b),
                        None => latches_of.push((s, vec![b])),
                    }
                }
            }
        }

        let mut loops: Vec<Loop> = Vec::new();
        for (header, latches) in latches_of {
            let mut members: IndexSet<Block> = IndexSet::new();
            members.insert(header);
            let mut worklist = latches.clone();
            while let Some(b) = worklist.pop() {
                if members.insert(b) {
                    for p in f.predecessors(b) {
                        if dt.is_reachable(p) && !members.contains(&p) {
                            worklist.push(p);
                        }
                    }
                }
            }
            // keep the block set in reverse postorder, header first
            let blocks: IndexSet<Block> =
                rpo.iter().copied().filter(|b| members.contains(b)).collect();
            log::trace!("found loop with header {:?} ({} blocks)", header, blocks.len());
            loops.push(Loop {
                header,
                blocks,
                latches,
                parent: None,
                children: Vec::new(),
                depth: 0,
            });
        }

        // nesting: the parent is the smallest strict superset
        for i in 0..loops.len() {
            let mut parent: Option<usize> = None;
            for j in 0..loops.len() {
                if i == j || !loops[j].blocks.is_superset(&loops[i].blocks) {
                    continue;
                }
                if loops[j].blocks.len() == loops[i].blocks.len() {
                    continue;
                }
                if parent.map_or(true, |p| loops[j].blocks.len() < loops[p].blocks.len()) {
                    parent = Some(j);
                }
            }
            loops[i].parent = parent;
            if let Some(p) = parent {
                loops[p].children.push(i);
            }
        }

        // preorder over the forest; roots and children follow the reverse
        // postorder of their headers, which loop discovery already yields
        let mut preorder = Vec::new();
        let roots: Vec<usize> = (0..loops.len()).filter(|&i| loops[i].parent.is_none()).collect();
        fn visit(loops: &mut [Loop], id: usize, depth: u32, preorder: &mut Vec<usize>) {
            loops[id].depth = depth;
            preorder.push(id);
            let children = loops[id].children.clone();
            for c in children {
                visit(loops, c, depth + 1, preorder);
            }
        }
        for r in roots {
            visit(&mut loops, r, 1, &mut preorder);
        }

        // innermost loop per block: smaller loops win
        let mut by_size: Vec<usize> = (0..loops.len()).collect();
        by_size.sort_by_key(|&i| loops[i].blocks.len());
        let mut innermost = FxHashMap::default();
        for id in by_size {
            for b in loops[id].blocks() {
                innermost.entry(b).or_insert(id);
            }
        }

        Self {
            loops,
            preorder,
            innermost,
        }
    }

    /// Get a loop by id
    pub fn get(&self, id: usize) -> &Loop {
        &self.loops[id]
    }

    /// The number of loops in the forest
    pub fn num_loops(&self) -> usize {
        self.loops.len()
    }

    /// Loop ids in forest preorder
    pub fn loops_preorder(&self) -> &[usize] {
        &self.preorder
    }

    /// The innermost loop containing a block, if any
    pub fn loop_for(&self, b: Block) -> Option<usize> {
        self.innermost.get(&b).copied()
    }
}
