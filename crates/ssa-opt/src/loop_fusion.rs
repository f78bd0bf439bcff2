//! Loop fusion
//!
//! A function pass that walks the loop forest in preorder, remembering the
//! previously visited loop at each depth, and fuses the first sibling pair
//! proved legal: the loops must be adjacent (nothing but an empty block
//! between them), take the same number of backedges, be control-flow
//! equivalent, and carry no negative-distance memory dependence between
//! their bodies. At most one pair is fused per invocation; the driver
//! re-runs the pass after refreshing its analyses.
//!
//! The rewiring leaves the second loop's header, preheader, and latch in
//! place but unreachable; clearing them out is a dead-block cleanup
//! concern, not this pass's.

use rustc_hash::FxHashMap;
use ssa_core::{Block, Function, Instruction, IntPredicate, Opcode, Value};

use crate::depend::load_store_pointer;
use crate::loop_info::Loop;
use crate::scev::{ScalarEvolution, Scev};
use crate::{FunctionAnalyses, FunctionPass, Pass, PreservedAnalyses};

/// The loop fusion pass
pub struct LoopFusion;

impl LoopFusion {
    /// Try to fuse one pair of sibling loops; report whether the function
    /// changed
    pub fn run(f: &mut Function, analyses: &FunctionAnalyses) -> PreservedAnalyses {
        let li = &analyses.loop_info;
        let order = li.loops_preorder();
        if order.len() <= 1 {
            return PreservedAnalyses::All;
        }

        let mut prev_at_depth: FxHashMap<u32, usize> = FxHashMap::default();
        prev_at_depth.insert(li.get(order[0]).depth(), order[0]);

        for &l2 in &order[1..] {
            let depth = li.get(l2).depth();
            if let Some(&l1) = prev_at_depth.get(&depth) {
                if li.get(l1).parent() == li.get(l2).parent()
                    && are_adjacent(f, li.get(l1), li.get(l2))
                    && have_equal_trip_counts(f, &analyses.scev, li.get(l1), li.get(l2))
                    && are_flow_equivalent(f, analyses, li.get(l1), li.get(l2))
                    && are_distance_independent(f, analyses, l1, l2)
                    && fuse(f, li.get(l1), li.get(l2))
                {
                    log::debug!("fused two adjacent loops at depth {}", depth);
                    return PreservedAnalyses::None;
                }
            }
            prev_at_depth.insert(depth, l2);
        }
        PreservedAnalyses::All
    }
}

impl Pass for LoopFusion {
    fn name(&self) -> &'static str {
        "loop-fusion"
    }
}

impl FunctionPass for LoopFusion {
    fn run_on_function(
        &mut self,
        f: &mut Function,
        analyses: &FunctionAnalyses,
    ) -> PreservedAnalyses {
        LoopFusion::run(f, analyses)
    }
}

/// Every unique non-latch exit of the first loop must be the second loop's
/// entry block, and that block may hold nothing but its terminator
fn are_adjacent(f: &Function, l1: &Loop, l2: &Loop) -> bool {
    let Some(entry2) = l2.entry_block(f) else {
        log::trace!("second loop has no entry block");
        return false;
    };
    let exits = l1.unique_non_latch_exit_blocks(f);
    if exits.is_empty() {
        return false;
    }
    exits.iter().all(|&bb| bb == entry2 && f.insts(bb).len() == 1)
}

/// The backedge-taken counts must both be computable and structurally equal
fn have_equal_trip_counts(f: &Function, se: &ScalarEvolution, l1: &Loop, l2: &Loop) -> bool {
    let btc1 = se.backedge_taken_count(f, l1);
    let btc2 = se.backedge_taken_count(f, l2);
    if btc1 == Scev::CouldNotCompute || btc2 == Scev::CouldNotCompute {
        log::trace!("a backedge-taken count could not be computed");
        return false;
    }
    btc1 == btc2
}

/// Whenever one loop runs, so does the other: the first entry dominates the
/// second, and the second post-dominates the first
fn are_flow_equivalent(f: &Function, analyses: &FunctionAnalyses, l1: &Loop, l2: &Loop) -> bool {
    let (Some(e1), Some(e2)) = (l1.entry_block(f), l2.entry_block(f)) else {
        return false;
    };
    analyses.domtree.dominates(e1, e2) && analyses.postdomtree.post_dominates(e2, e1)
}

fn collect_loads_stores(f: &Function, lp: &Loop) -> (Vec<Value>, Vec<Value>) {
    let mut loads = Vec::new();
    let mut stores = Vec::new();
    for block in lp.blocks() {
        for &inst in f.insts(block) {
            match f.inst(inst).map(|i| i.opcode()) {
                Some(Opcode::Load) => loads.push(inst),
                Some(Opcode::Store) => stores.push(inst),
                _ => {}
            }
        }
    }
    (loads, stores)
}

/// Check every producer/consumer pair across the two loops for a
/// negative-distance dependence
fn are_distance_independent(
    f: &Function,
    analyses: &FunctionAnalyses,
    l1_id: usize,
    l2_id: usize,
) -> bool {
    let li = &analyses.loop_info;
    let (l1, l2) = (li.get(l1_id), li.get(l2_id));
    let (loads1, stores1) = collect_loads_stores(f, l1);
    let (loads2, stores2) = collect_loads_stores(f, l2);

    let in_loop = |inst: Value, id: usize| {
        li.loop_for(f.parent(inst).expect("memory op not installed")) == Some(id)
    };

    for &store in &stores1 {
        for &load in &loads2 {
            if !analyses.depinfo.depends(f, store, load) {
                continue;
            }
            if !in_loop(load, l2_id) || !in_loop(store, l1_id) {
                log::trace!("memory access inside a nested loop blocks fusion");
                return false;
            }
            if is_distance_negative(f, &analyses.scev, store, load, l1, l2) {
                return false;
            }
        }
    }

    for &store in &stores2 {
        for &load in &loads1 {
            if !analyses.depinfo.depends(f, store, load) {
                continue;
            }
            if !in_loop(load, l1_id) || !in_loop(store, l2_id) {
                log::trace!("memory access inside a nested loop blocks fusion");
                return false;
            }
            if is_distance_negative(f, &analyses.scev, load, store, l1, l2) {
                return false;
            }
        }
    }
    true
}

/// Decide the sign of the dependence distance between an access in the
/// first loop and one in the second.
///
/// Both subscripts must be affine recurrences with the same array base and
/// the same nonzero constant stride; the distance is then
/// `(start₁ - start₂) / stride`, and only its sign matters. Unanalyzable
/// shapes are treated as negative; distinct bases, or a delta that is not a
/// multiple of the stride, mean the accesses never overlap and the pair is
/// skipped.
fn is_distance_negative(
    f: &Function,
    se: &ScalarEvolution,
    inst1: Value,
    inst2: Value,
    l1: &Loop,
    l2: &Loop,
) -> bool {
    let (Some(p1), Some(p2)) = (load_store_pointer(f, inst1), load_store_pointer(f, inst2)) else {
        return true;
    };
    let (Scev::AddRec(r1), Scev::AddRec(r2)) =
        (se.at_scope(f, p1, l1), se.at_scope(f, p2, l2))
    else {
        log::trace!("subscript is not an affine recurrence");
        return true;
    };
    if r1.base.is_none() || r2.base.is_none() {
        return true;
    }
    if r1.base != r2.base {
        // distinct arrays cannot overlap; nothing to test
        return false;
    }
    if r1.step == 0 || r1.step != r2.step {
        log::trace!("strides are zero or differ, distance unknown");
        return true;
    }
    let Some(delta) = se.minus(&r1.start, &r2.start) else {
        log::trace!("subscript delta is not a known constant");
        return true;
    };
    if delta != 0 && delta.unsigned_abs() % r1.step.unsigned_abs() != 0 {
        return false;
    }
    let delta = Scev::Constant(delta);
    let distance = if r1.step < 0 { delta.negate() } else { delta };
    se.is_known_predicate(IntPredicate::SLT, &distance, &Scev::zero())
}

fn body_head(f: &Function, lp: &Loop) -> Option<Block> {
    let in_loop: Vec<Block> = f
        .successors(lp.header())
        .into_iter()
        .filter(|s| lp.contains(*s))
        .collect();
    match in_loop.as_slice() {
        &[head] => Some(head),
        _ => None,
    }
}

fn body_tail(f: &Function, latch: Block) -> Option<Block> {
    match f.predecessors(latch).as_slice() {
        &[tail] => Some(tail),
        _ => None,
    }
}

/// Rewire the CFG so the second loop's body runs inside the first loop.
///
/// Every shape requirement is validated before the first mutation, so a
/// bailed fusion leaves the function byte-identical.
fn fuse(f: &mut Function, l1: &Loop, l2: &Loop) -> bool {
    let Some(iv1) = l1.canonical_induction_variable(f) else {
        log::trace!("first loop has no canonical induction variable");
        return false;
    };
    let Some(iv2) = l2.canonical_induction_variable(f) else {
        log::trace!("second loop has no canonical induction variable");
        return false;
    };
    let Some(entry2) = l2.entry_block(f) else {
        return false;
    };
    let (Some(latch1), Some(latch2)) = (l1.latch(), l2.latch()) else {
        return false;
    };
    let (Some(head1_term), Some(head2_term)) =
        (f.terminator(l1.header()), f.terminator(l2.header()))
    else {
        return false;
    };
    let Some(exit2) = f
        .successors(l2.header())
        .into_iter()
        .find(|s| !l2.contains(*s))
    else {
        return false;
    };
    let Some(body_head2) = body_head(f, l2) else {
        return false;
    };
    let (Some(body_tail1), Some(body_tail2)) = (body_tail(f, latch1), body_tail(f, latch2)) else {
        return false;
    };
    let (Some(tail1_term), Some(tail2_term)) =
        (f.terminator(body_tail1), f.terminator(body_tail2))
    else {
        return false;
    };

    // one induction variable drives both bodies
    f.replace_all_uses_with(iv2, iv1);
    // the first loop now exits where the second one did
    f.replace_branch_target(head1_term, entry2, exit2);
    // the second header jumps straight to its latch, cutting its body out
    f.erase(head2_term);
    f.append(l2.header(), Instruction::br(latch2));
    // splice that body between the first body and the first latch
    f.replace_branch_target(tail1_term, latch1, body_head2);
    f.replace_branch_target(tail2_term, latch2, latch1);
    true
}
