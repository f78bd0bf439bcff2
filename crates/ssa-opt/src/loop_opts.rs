//! Loop-invariant code motion
//!
//! A per-loop pass over binary integer instructions. Each instruction is
//! marked invariant (both operands constant, argument, defined outside the
//! loop, or themselves marked), use-dominating (it dominates every in-loop
//! use, looking through phis), and dead-outside (every transitive user is
//! inside the loop); each block is marked when it dominates every exiting
//! block. An instruction moves to the preheader when it is invariant,
//! dominates its uses, and is either dead outside the loop or defined in a
//! block that dominates all exits: a speculated dead instruction can never
//! be observed after the loop, and an exit-dominating one executes exactly
//! as often as before.
//!
//! Marks live in tables scoped to one run. The hoist walks the dominator
//! tree in preorder from the header, which keeps hoisted instructions in an
//! order where producers precede their consumers in the preheader.

use rustc_hash::FxHashSet;
use ssa_core::{Block, Function, Value};

use crate::domtree::DominatorTree;
use crate::loop_info::{Loop, LoopInfo};
use crate::{LoopPass, Pass, PreservedAnalyses};

#[derive(Default)]
struct Marks {
    invariant: FxHashSet<Value>,
    use_dominator: FxHashSet<Value>,
    dead: FxHashSet<Value>,
    exits_dominator: FxHashSet<Block>,
}

fn is_invariant_operand(f: &Function, v: Value, lp: &Loop, marks: &Marks) -> bool {
    if f.is_constant(v) || f.is_argument(v) {
        return true;
    }
    match f.parent(v) {
        Some(b) if lp.contains(b) => marks.invariant.contains(&v),
        _ => true,
    }
}

/// The non-phi users of an instruction, looking through in-between phis.
/// A phi merges its inputs rather than consuming them, so the walk
/// continues to the phi's own users; the visited set stops phi cycles.
fn transitive_users(f: &Function, v: Value, visited: &mut FxHashSet<Value>, out: &mut Vec<Value>) {
    for u in f.uses(v) {
        let user = u.user;
        if f.is_phi(user) {
            if visited.insert(user) {
                transitive_users(f, user, visited, out);
            }
        } else {
            out.push(user);
        }
    }
}

fn users_of(f: &Function, v: Value) -> Vec<Value> {
    let mut visited = FxHashSet::default();
    let mut out = Vec::new();
    transitive_users(f, v, &mut visited, &mut out);
    out
}

/// The loop-invariant code motion pass
pub struct LoopOpts;

impl LoopOpts {
    /// Run on one loop of the forest; declines when the loop has no
    /// preheader
    pub fn run(
        f: &mut Function,
        loop_info: &LoopInfo,
        loop_id: usize,
        dt: &DominatorTree,
    ) -> PreservedAnalyses {
        let lp = loop_info.get(loop_id);
        let Some(preheader) = lp.preheader(f) else {
            log::trace!("loop has no preheader, skipping");
            return PreservedAnalyses::All;
        };

        let mut marks = Marks::default();

        // mark invariance, use domination, and outside-deadness of every
        // binary instruction, walking blocks top-down in loop order
        for block in lp.blocks() {
            for &inst in f.insts(block) {
                let Some(data) = f.inst(inst) else { continue };
                if !data.is_binary_int_op() {
                    continue;
                }
                let invariant = data
                    .operands()
                    .iter()
                    .all(|&op| is_invariant_operand(f, op, lp, &marks));
                if invariant {
                    log::trace!("invariant instruction found in loop");
                    marks.invariant.insert(inst);
                }

                let users = users_of(f, inst);
                let dominates_uses = users.iter().all(|&user| {
                    let in_loop = f.parent(user).map_or(false, |b| lp.contains(b));
                    !in_loop || dt.dominates_use(f, inst, user)
                });
                if dominates_uses {
                    marks.use_dominator.insert(inst);
                }

                let dead_outside = users
                    .iter()
                    .all(|&user| f.parent(user).map_or(false, |b| lp.contains(b)));
                if dead_outside {
                    marks.dead.insert(inst);
                }
            }
        }

        // mark the blocks that dominate every exiting block
        let exiting = lp.exiting_blocks(f);
        for block in lp.blocks() {
            if exiting.iter().all(|&e| dt.dominates(block, e)) {
                marks.exits_dominator.insert(block);
            }
        }

        // collect candidates in dominator-tree preorder from the header
        let mut to_move = Vec::new();
        collect_preorder(f, dt, lp, &marks, lp.header(), &mut to_move);

        let preheader_term = f
            .terminator(preheader)
            .expect("preheader has no terminator");
        for &inst in &to_move {
            log::debug!("hoisting invariant instruction into preheader");
            f.move_before(inst, preheader_term);
        }

        if to_move.is_empty() {
            PreservedAnalyses::All
        } else {
            PreservedAnalyses::None
        }
    }
}

fn collect_preorder(
    f: &Function,
    dt: &DominatorTree,
    lp: &Loop,
    marks: &Marks,
    block: Block,
    to_move: &mut Vec<Value>,
) {
    if !lp.contains(block) {
        return;
    }
    for &inst in f.insts(block) {
        if marks.invariant.contains(&inst)
            && marks.use_dominator.contains(&inst)
            && (marks.dead.contains(&inst) || marks.exits_dominator.contains(&block))
        {
            to_move.push(inst);
        }
    }
    for &child in dt.children(block) {
        collect_preorder(f, dt, lp, marks, child, to_move);
    }
}

impl Pass for LoopOpts {
    fn name(&self) -> &'static str {
        "loop-opts"
    }
}

impl LoopPass for LoopOpts {
    fn run_on_loop(
        &mut self,
        f: &mut Function,
        loop_info: &LoopInfo,
        loop_id: usize,
        dt: &DominatorTree,
    ) -> PreservedAnalyses {
        LoopOpts::run(f, loop_info, loop_id, dt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssa_core::{verify_function, Builder, Function, IntPredicate, Opcode, Type};

    fn analyses(f: &Function) -> (DominatorTree, LoopInfo) {
        let dt = DominatorTree::compute(f);
        let li = LoopInfo::compute(f, &dt);
        (dt, li)
    }

    /// for (i = 0; i < n; i++) { a[i] = c + 3; }
    fn store_loop() -> (Function, Value, Block) {
        let mut f = Function::new("fill", &[Type::i32(), Type::i32(), Type::Ptr], Type::Void);
        let entry = f.add_block("entry");
        let header = f.add_block("header");
        let body = f.add_block("body");
        let latch = f.add_block("latch");
        let exit = f.add_block("exit");
        let n = f.param(0);
        let c = f.param(1);
        let a = f.param(2);
        let mut b = Builder::new(&mut f);
        b.position_at_end(entry);
        let zero = b.const_int(Type::i32(), 0);
        let one = b.const_int(Type::i32(), 1);
        b.build_br(header);
        b.position_at_end(header);
        let iv = b.build_phi(Type::i32(), &[(zero, entry), (zero, latch)]);
        let cmp = b.build_icmp(IntPredicate::ULT, iv, n);
        b.build_cond_br(cmp, body, exit);
        b.position_at_end(body);
        let three = b.const_int(Type::i32(), 3);
        let h = b.build_add(c, three);
        let ptr = b.build_gep(a, iv);
        b.build_store(h, ptr);
        b.build_br(latch);
        b.position_at_end(latch);
        let next = b.build_add(iv, one);
        b.build_br(header);
        b.position_at_end(exit);
        b.build_ret(None);
        f.set_phi_incoming(iv, latch, next);
        (f, h, entry)
    }

    #[test]
    fn test_hoists_invariant_store_operand() {
        let (mut f, h, preheader) = store_loop();
        let (dt, li) = analyses(&f);
        let preserved = LoopOpts::run(&mut f, &li, li.loops_preorder()[0], &dt);
        assert_eq!(preserved, PreservedAnalyses::None);
        verify_function(&f).unwrap();
        assert_eq!(f.parent(h), Some(preheader));
        // hoisted before the preheader terminator
        let insts = f.insts(preheader);
        assert_eq!(insts[insts.len() - 2], h);
        // its operands are an argument and a constant
        let data = f.inst(h).unwrap();
        assert!(f.is_argument(data.operands()[0]));
        assert!(f.is_constant(data.operands()[1]));
    }

    #[test]
    fn test_induction_update_is_not_hoisted() {
        let (mut f, _, _) = store_loop();
        let (dt, li) = analyses(&f);
        let latch = li.get(li.loops_preorder()[0]).latch().unwrap();
        LoopOpts::run(&mut f, &li, li.loops_preorder()[0], &dt);
        // the iv increment still sits in the latch
        let next = f.insts(latch)[0];
        assert_eq!(f.inst(next).unwrap().opcode(), Opcode::Add);
    }

    /// Values computed under a branch inside the loop and merged through a
    /// phi do not dominate their uses and must stay put.
    #[test]
    fn test_branchy_values_stay_in_loop() {
        let mut f = Function::new(
            "branchy",
            &[Type::i32(), Type::i32(), Type::i1(), Type::Ptr],
            Type::Void,
        );
        let entry = f.add_block("entry");
        let header = f.add_block("header");
        let cond = f.add_block("cond");
        let then_bb = f.add_block("then");
        let else_bb = f.add_block("else");
        let merge = f.add_block("merge");
        let latch = f.add_block("latch");
        let exit = f.add_block("exit");
        let n = f.param(0);
        let c = f.param(1);
        let flag = f.param(2);
        let a = f.param(3);
        let mut b = Builder::new(&mut f);
        b.position_at_end(entry);
        let zero = b.const_int(Type::i32(), 0);
        let one = b.const_int(Type::i32(), 1);
        b.build_br(header);
        b.position_at_end(header);
        let iv = b.build_phi(Type::i32(), &[(zero, entry), (zero, latch)]);
        let cmp = b.build_icmp(IntPredicate::ULT, iv, n);
        b.build_cond_br(cmp, cond, exit);
        // the flag splits the body; neither arm dominates the merge
        b.position_at_end(cond);
        b.build_cond_br(flag, then_bb, else_bb);
        b.position_at_end(then_bb);
        let three = b.const_int(Type::i32(), 3);
        let h1 = b.build_add(c, three);
        b.build_br(merge);
        b.position_at_end(else_bb);
        let four = b.const_int(Type::i32(), 4);
        let h2 = b.build_add(c, four);
        b.build_br(merge);
        b.position_at_end(merge);
        let h = b.build_phi(Type::i32(), &[(h1, then_bb), (h2, else_bb)]);
        let two = b.const_int(Type::i32(), 2);
        let m = b.build_add(h, two);
        let ptr = b.build_gep(a, iv);
        b.build_store(m, ptr);
        b.build_br(latch);
        b.position_at_end(latch);
        let next = b.build_add(iv, one);
        b.build_br(header);
        b.position_at_end(exit);
        b.build_ret(None);
        f.set_phi_incoming(iv, latch, next);

        let (dt, li) = analyses(&f);
        let before = f.to_string();
        let preserved = LoopOpts::run(&mut f, &li, li.loops_preorder()[0], &dt);
        assert_eq!(preserved, PreservedAnalyses::All);
        assert_eq!(f.to_string(), before, "nothing was hoisted or reordered");
        assert_eq!(f.parent(h1), Some(then_bb));
        assert_eq!(f.parent(h2), Some(else_bb));
    }

    /// An invariant instruction that is dead outside the loop hoists even
    /// from a block that does not dominate the exits.
    #[test]
    fn test_dead_outside_hoists_from_conditional_block() {
        let mut f = Function::new(
            "deadout",
            &[Type::i32(), Type::i32(), Type::i1(), Type::Ptr],
            Type::Void,
        );
        let entry = f.add_block("entry");
        let header = f.add_block("header");
        let then_bb = f.add_block("then");
        let merge = f.add_block("merge");
        let latch = f.add_block("latch");
        let exit = f.add_block("exit");
        let n = f.param(0);
        let c = f.param(1);
        let flag = f.param(2);
        let a = f.param(3);
        let mut b = Builder::new(&mut f);
        b.position_at_end(entry);
        let zero = b.const_int(Type::i32(), 0);
        let one = b.const_int(Type::i32(), 1);
        b.build_br(header);
        b.position_at_end(header);
        let iv = b.build_phi(Type::i32(), &[(zero, entry), (zero, latch)]);
        let cmp = b.build_icmp(IntPredicate::ULT, iv, n);
        b.build_cond_br(cmp, then_bb, exit);
        b.position_at_end(then_bb);
        let seven = b.const_int(Type::i32(), 7);
        let q = b.build_add(c, seven);
        b.build_cond_br(flag, merge, latch);
        b.position_at_end(merge);
        let ptr = b.build_gep(a, iv);
        b.build_store(q, ptr);
        b.build_br(latch);
        b.position_at_end(latch);
        let next = b.build_add(iv, one);
        b.build_br(header);
        b.position_at_end(exit);
        b.build_ret(None);
        f.set_phi_incoming(iv, latch, next);

        let (dt, li) = analyses(&f);
        let preserved = LoopOpts::run(&mut f, &li, li.loops_preorder()[0], &dt);
        assert_eq!(preserved, PreservedAnalyses::None);
        verify_function(&f).unwrap();
        assert_eq!(f.parent(q), Some(entry), "dead-outside value hoisted");
    }

    /// An exit-dominating invariant instruction whose value is used after
    /// the loop hoists through the exits-dominator rule.
    #[test]
    fn test_exit_dominating_value_used_after_loop() {
        let mut f = Function::new("after", &[Type::i32(), Type::i32()], Type::i32());
        let entry = f.add_block("entry");
        let header = f.add_block("header");
        let latch = f.add_block("latch");
        let exit = f.add_block("exit");
        let n = f.param(0);
        let c = f.param(1);
        let mut b = Builder::new(&mut f);
        b.position_at_end(entry);
        let zero = b.const_int(Type::i32(), 0);
        let one = b.const_int(Type::i32(), 1);
        b.build_br(header);
        b.position_at_end(header);
        let iv = b.build_phi(Type::i32(), &[(zero, entry), (zero, latch)]);
        let three = b.const_int(Type::i32(), 3);
        let h = b.build_add(c, three);
        let cmp = b.build_icmp(IntPredicate::ULT, iv, n);
        b.build_cond_br(cmp, latch, exit);
        b.position_at_end(latch);
        let next = b.build_add(iv, one);
        b.build_br(header);
        b.position_at_end(exit);
        b.build_ret(Some(h));
        f.set_phi_incoming(iv, latch, next);

        let (dt, li) = analyses(&f);
        let preserved = LoopOpts::run(&mut f, &li, li.loops_preorder()[0], &dt);
        assert_eq!(preserved, PreservedAnalyses::None);
        verify_function(&f).unwrap();
        assert_eq!(f.parent(h), Some(entry));
    }

    #[test]
    fn test_declines_without_preheader() {
        // two outside predecessors of the header mean there is no preheader
        let mut f = Function::new("rough", &[Type::i1(), Type::i32(), Type::Ptr], Type::Void);
        let entry = f.add_block("entry");
        let side = f.add_block("side");
        let header = f.add_block("header");
        let exit = f.add_block("exit");
        let flag = f.param(0);
        let c = f.param(1);
        let p = f.param(2);
        let mut b = Builder::new(&mut f);
        b.position_at_end(entry);
        b.build_cond_br(flag, header, side);
        b.position_at_end(side);
        b.build_br(header);
        b.position_at_end(header);
        let three = b.const_int(Type::i32(), 3);
        let h = b.build_add(c, three);
        b.build_store(h, p);
        b.build_cond_br(flag, header, exit);
        b.position_at_end(exit);
        b.build_ret(None);

        let (dt, li) = analyses(&f);
        let before = f.to_string();
        let preserved = LoopOpts::run(&mut f, &li, li.loops_preorder()[0], &dt);
        assert_eq!(preserved, PreservedAnalyses::All);
        assert_eq!(f.to_string(), before);
    }

    #[test]
    fn test_idempotent_after_hoisting() {
        let (mut f, _, _) = store_loop();
        let (dt, li) = analyses(&f);
        LoopOpts::run(&mut f, &li, li.loops_preorder()[0], &dt);
        let after_first = f.to_string();
        let (dt, li) = analyses(&f);
        let preserved = LoopOpts::run(&mut f, &li, li.loops_preorder()[0], &dt);
        assert_eq!(preserved, PreservedAnalyses::All);
        assert_eq!(f.to_string(), after_first);
    }
}
