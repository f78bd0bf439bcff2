//! Local peephole optimizations
//!
//! A module pass over the binary integer instructions of every basic block:
//! algebraic identity, constant folding, multi-instruction cancellation,
//! and strength reduction, followed by a dead-code sweep. Each block is
//! rescanned until a full scan makes no change.
//!
//! Every candidate instruction is viewed through its `(value, constant)`
//! form: for commutative opcodes a leading constant is swapped behind the
//! generic operand; for the non-commutative ones a constant in front
//! disables the rewrites that need a trailing constant.

use ssa_core::{Block, Function, Instruction, Module, Opcode, Value};

use crate::{ModulePass, Pass, PreservedAnalyses};

/// The cancelling opposite of a binary opcode; signed division has none
fn opposite_op(opcode: Opcode) -> Option<Opcode> {
    match opcode {
        Opcode::Add => Some(Opcode::Sub),
        Opcode::Sub => Some(Opcode::Add),
        Opcode::Mul => Some(Opcode::UDiv),
        Opcode::UDiv => Some(Opcode::Mul),
        Opcode::Shl => Some(Opcode::LShr),
        Opcode::LShr => Some(Opcode::Shl),
        _ => None,
    }
}

/// The `(value, constant)` view of a binary instruction
struct ValConst {
    value: Value,
    constant: Option<Value>,
}

fn val_and_const(f: &Function, inst: Value) -> ValConst {
    let data = f.inst(inst).unwrap();
    let &[op0, op1] = data.operands() else {
        unreachable!("binary instruction with operand count != 2")
    };
    if data.opcode().is_commutative() && f.is_constant(op0) && !f.is_constant(op1) {
        ValConst {
            value: op1,
            constant: Some(op0),
        }
    } else {
        ValConst {
            value: op0,
            constant: f.is_constant(op1).then_some(op1),
        }
    }
}

/// x + 0, x - 0, x << 0, x >> 0, x * 1, x / 1: the result is x
fn algebraic_identity(f: &mut Function, inst: Value, vc: &ValConst) -> bool {
    let Some(c) = vc.constant else {
        return false;
    };
    let bits = f.const_bits(c).unwrap();
    let replace = match f.inst(inst).unwrap().opcode() {
        Opcode::Add | Opcode::Sub | Opcode::Shl | Opcode::LShr => bits == 0,
        Opcode::Mul | Opcode::UDiv | Opcode::SDiv => bits == 1,
        _ => false,
    };
    if replace {
        log::trace!("identity: folding instruction to its operand");
        f.replace_all_uses_with(inst, vc.value);
    }
    replace
}

/// Evaluate an operation whose operands are both constants.
///
/// Arithmetic is unsigned and wraps at the instruction width; signed
/// division is evaluated in two's complement with the quotient truncated
/// toward zero. Shifts are not folded. The result is materialized as
/// `add result, 0` after the instruction so the following rescan can
/// shorten it through the identity rule; an `add` with a trailing zero
/// operand (the materialized shape itself) therefore refuses to fold here.
fn constant_folding(f: &mut Function, inst: Value) -> bool {
    let data = f.inst(inst).unwrap();
    let opcode = data.opcode();
    let ty = data.ty();
    let &[op0, op1] = data.operands() else {
        unreachable!()
    };
    let (Some(c1), Some(c2)) = (f.const_bits(op0), f.const_bits(op1)) else {
        return false;
    };
    let result = match opcode {
        Opcode::Add => {
            if c2 == 0 {
                return false;
            }
            c1.wrapping_add(c2)
        }
        Opcode::Sub => c1.wrapping_sub(c2),
        Opcode::Mul => c1.wrapping_mul(c2),
        Opcode::UDiv => {
            if c2 == 0 {
                return false;
            }
            c1 / c2
        }
        Opcode::SDiv => {
            let (a, b) = (ty.sign_extend(c1), ty.sign_extend(c2));
            let width = ty.bits().unwrap();
            let min = if width == 64 { i64::MIN } else { -(1i64 << (width - 1)) };
            if b == 0 || (a == min && b == -1) {
                return false;
            }
            (a / b) as u64
        }
        _ => return false,
    };
    let result = f.const_int(ty, result);
    let zero = f.const_zero(ty);
    let folded = f.insert_after(inst, Instruction::binary(Opcode::Add, ty, result, zero));
    log::trace!("constant folding: materialized folded result");
    f.replace_all_uses_with(inst, folded);
    true
}

/// `(x op C) op⁻¹ C` collapses to `x`: look for a user of the instruction
/// applying the opposite opcode with the same constant, and short-circuit
/// its uses to the generic operand
fn multi_instruction(f: &mut Function, inst: Value, vc: &ValConst) -> bool {
    let Some(c) = vc.constant else {
        return false;
    };
    let Some(opposite) = opposite_op(f.inst(inst).unwrap().opcode()) else {
        return false;
    };
    let users: Vec<Value> = f.uses(inst).iter().map(|u| u.user).collect();
    for user in users {
        let Some(user_data) = f.inst(user) else {
            continue;
        };
        if user_data.opcode() != opposite {
            continue;
        }
        let user_vc = val_and_const(f, user);
        // interned constants compare by handle
        if user_vc.constant == Some(c) && user_vc.value == inst {
            log::trace!("cancellation: user undoes this operation");
            f.replace_all_uses_with(user, vc.value);
            return true;
        }
    }
    false
}

fn ceil_log2(k: u64) -> u32 {
    if k <= 1 {
        0
    } else {
        64 - (k - 1).leading_zeros()
    }
}

/// Rewrite a multiplication by a positive constant into a shift, minus at
/// most one subtraction and one residual multiplication (itself reduced on
/// a later rescan); rewrite a division by a power of two into a shift.
/// Zero and negative constants decline.
fn strength_reduction(f: &mut Function, inst: Value, vc: &ValConst) -> bool {
    let Some(c) = vc.constant else {
        return false;
    };
    let data = f.inst(inst).unwrap();
    let opcode = data.opcode();
    let ty = data.ty();
    let width = ty.bits().unwrap();
    let k = f.const_signed(c).unwrap();
    if k <= 0 {
        return false;
    }
    match opcode {
        Opcode::Mul => {
            let shift = ceil_log2(k as u64);
            if shift >= width {
                return false;
            }
            let shift_c = f.const_int(ty, shift as u64);
            let shl = f.insert_after(inst, Instruction::binary(Opcode::Shl, ty, vc.value, shift_c));
            let rest = (1u64 << shift) - (k as u64);
            let last = if rest == 0 {
                shl
            } else if rest == 1 {
                f.insert_after(shl, Instruction::binary(Opcode::Sub, ty, shl, vc.value))
            } else {
                let rest_c = f.const_int(ty, rest);
                let mul =
                    f.insert_after(shl, Instruction::binary(Opcode::Mul, ty, vc.value, rest_c));
                f.insert_after(mul, Instruction::binary(Opcode::Sub, ty, shl, mul))
            };
            log::trace!("strength reduction: multiply by {} became a shift sequence", k);
            f.replace_all_uses_with(inst, last);
            true
        }
        Opcode::UDiv => {
            let ku = k as u64;
            if !ku.is_power_of_two() {
                return false;
            }
            let shift_c = f.const_int(ty, ku.trailing_zeros() as u64);
            let lshr =
                f.insert_after(inst, Instruction::binary(Opcode::LShr, ty, vc.value, shift_c));
            log::trace!("strength reduction: divide by {} became a shift", k);
            f.replace_all_uses_with(inst, lshr);
            true
        }
        _ => false,
    }
}

/// Rescan one block until a full scan changes nothing, sweeping zero-use
/// instructions between scans
fn run_on_block(f: &mut Function, block: Block) -> bool {
    let mut changed_any = false;
    loop {
        let mut changed = false;
        let mut dead: Vec<Value> = Vec::new();
        for inst in f.insts(block).to_vec() {
            if !f.inst(inst).map_or(false, |i| i.is_binary_int_op()) {
                continue;
            }
            let vc = val_and_const(f, inst);
            let local = if f.num_uses(inst) == 0 {
                true
            } else {
                algebraic_identity(f, inst, &vc)
                    || constant_folding(f, inst)
                    || multi_instruction(f, inst, &vc)
                    || strength_reduction(f, inst, &vc)
            };
            if f.num_uses(inst) == 0 {
                dead.push(inst);
            }
            changed |= local;
        }
        for inst in dead {
            if f.num_uses(inst) == 0 {
                f.erase(inst);
            }
        }
        changed_any |= changed;
        if !changed {
            break;
        }
    }
    changed_any
}

/// The peephole pass
pub struct LocalOpts;

impl LocalOpts {
    /// Run over every block of every function in the module
    pub fn run(module: &mut Module) -> PreservedAnalyses {
        LocalOpts.run_on_module(module)
    }
}

impl Pass for LocalOpts {
    fn name(&self) -> &'static str {
        "local-opts"
    }
}

impl ModulePass for LocalOpts {
    fn run_on_module(&mut self, module: &mut Module) -> PreservedAnalyses {
        let mut changed = false;
        for f in module.functions_mut() {
            for block in f.blocks().to_vec() {
                changed |= run_on_block(f, block);
            }
        }
        if changed {
            PreservedAnalyses::None
        } else {
            PreservedAnalyses::All
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use ssa_core::{verify_function, Builder, Function, Type};

    /// Wrap a single function into a module, run the pass, and hand the
    /// function back
    fn optimized(f: Function) -> (Function, PreservedAnalyses) {
        let mut module = Module::new("test");
        module.add_function(f);
        let preserved = LocalOpts::run(&mut module);
        let f = module.functions_mut().iter_mut().next().unwrap();
        verify_function(f).unwrap();
        let f = std::mem::replace(f, Function::new("empty", &[], Type::Void));
        (f, preserved)
    }

    fn ret_operand(f: &Function) -> Value {
        let entry = f.entry();
        let term = f.terminator(entry).unwrap();
        f.inst(term).unwrap().operands()[0]
    }

    #[test]
    fn test_fold_add_of_constants() {
        let mut f = Function::new("fold", &[], Type::i32());
        let entry = f.add_block("entry");
        let mut b = Builder::new(&mut f);
        b.position_at_end(entry);
        let three = b.const_int(Type::i32(), 3);
        let four = b.const_int(Type::i32(), 4);
        let a = b.build_add(three, four);
        b.build_ret(Some(a));

        let (f, preserved) = optimized(f);
        assert_eq!(preserved, PreservedAnalyses::None);
        assert_eq!(f.const_bits(ret_operand(&f)), Some(7));
        // only the return remains
        assert_eq!(f.insts(f.entry()).len(), 1);
    }

    #[test]
    fn test_identity_then_cancellation() {
        let mut f = Function::new("cancel", &[Type::i32()], Type::i32());
        let entry = f.add_block("entry");
        let x = f.param(0);
        let mut b = Builder::new(&mut f);
        b.position_at_end(entry);
        let two = b.const_int(Type::i32(), 2);
        let y = b.build_add(x, two);
        let z = b.build_sub(y, two);
        b.build_ret(Some(z));

        let (f, _) = optimized(f);
        assert_eq!(ret_operand(&f), f.param(0));
        assert_eq!(f.insts(f.entry()).len(), 1, "both temporaries are erased");
    }

    #[test]
    fn test_strength_reduce_mul_by_six() {
        let mut f = Function::new("mul6", &[Type::i32()], Type::i32());
        let entry = f.add_block("entry");
        let x = f.param(0);
        let mut b = Builder::new(&mut f);
        b.position_at_end(entry);
        let six = b.const_int(Type::i32(), 6);
        let y = b.build_mul(x, six);
        b.build_ret(Some(y));

        let (f, _) = optimized(f);
        // shl x, 3; shl x, 1; sub; ret: the residual mul-by-2 has been
        // reduced again
        let insts: Vec<Opcode> = f
            .insts(f.entry())
            .iter()
            .map(|&i| f.inst(i).unwrap().opcode())
            .collect();
        assert_eq!(
            insts,
            vec![Opcode::Shl, Opcode::Shl, Opcode::Sub, Opcode::Ret]
        );
        let sub = f.insts(f.entry())[2];
        assert_eq!(ret_operand(&f), sub);
        assert!(!insts.contains(&Opcode::Mul));
    }

    #[test]
    fn test_mul_by_one_uses_identity_not_strength_reduction() {
        let mut f = Function::new("mul1", &[Type::i32()], Type::i32());
        let entry = f.add_block("entry");
        let x = f.param(0);
        let mut b = Builder::new(&mut f);
        b.position_at_end(entry);
        let one = b.const_int(Type::i32(), 1);
        let y = b.build_mul(x, one);
        b.build_ret(Some(y));

        let (f, _) = optimized(f);
        assert_eq!(ret_operand(&f), f.param(0));
        assert_eq!(f.insts(f.entry()).len(), 1, "no shift sequence was emitted");
    }

    #[test]
    fn test_udiv_by_power_of_two() {
        let mut f = Function::new("div8", &[Type::i32()], Type::i32());
        let entry = f.add_block("entry");
        let x = f.param(0);
        let mut b = Builder::new(&mut f);
        b.position_at_end(entry);
        let eight = b.const_int(Type::i32(), 8);
        let y = b.build_udiv(x, eight);
        b.build_ret(Some(y));

        let (f, _) = optimized(f);
        let lshr = ret_operand(&f);
        let data = f.inst(lshr).unwrap();
        assert_eq!(data.opcode(), Opcode::LShr);
        assert_eq!(f.const_bits(data.operands()[1]), Some(3));
    }

    #[test]
    fn test_udiv_by_non_power_of_two_is_kept() {
        let mut f = Function::new("div3", &[Type::i32()], Type::i32());
        let entry = f.add_block("entry");
        let x = f.param(0);
        let mut b = Builder::new(&mut f);
        b.position_at_end(entry);
        let three = b.const_int(Type::i32(), 3);
        let y = b.build_udiv(x, three);
        b.build_ret(Some(y));

        let (f, preserved) = optimized(f);
        assert_eq!(preserved, PreservedAnalyses::All);
        assert_eq!(f.inst(ret_operand(&f)).unwrap().opcode(), Opcode::UDiv);
    }

    #[test]
    fn test_division_by_zero_is_left_alone() {
        let mut f = Function::new("div0", &[], Type::i32());
        let entry = f.add_block("entry");
        let mut b = Builder::new(&mut f);
        b.position_at_end(entry);
        let five = b.const_int(Type::i32(), 5);
        let zero = b.const_int(Type::i32(), 0);
        let y = b.build_udiv(five, zero);
        b.build_ret(Some(y));

        let (f, preserved) = optimized(f);
        assert_eq!(preserved, PreservedAnalyses::All);
        assert_eq!(f.inst(ret_operand(&f)).unwrap().opcode(), Opcode::UDiv);
    }

    #[test]
    fn test_sdiv_folds_with_signed_semantics() {
        let mut f = Function::new("sdiv", &[], Type::i32());
        let entry = f.add_block("entry");
        let mut b = Builder::new(&mut f);
        b.position_at_end(entry);
        let minus_eight = b.const_int(Type::i32(), (-8i64) as u64);
        let two = b.const_int(Type::i32(), 2);
        let y = b.build_sdiv(minus_eight, two);
        b.build_ret(Some(y));

        let (f, _) = optimized(f);
        let ret = ret_operand(&f);
        assert_eq!(f.const_signed(ret), Some(-4));
    }

    #[test]
    fn test_sdiv_overflow_case_declines() {
        let mut f = Function::new("sdiv_min", &[], Type::i32());
        let entry = f.add_block("entry");
        let mut b = Builder::new(&mut f);
        b.position_at_end(entry);
        let min = b.const_int(Type::i32(), 0x8000_0000);
        let minus_one = b.const_int(Type::i32(), (-1i64) as u64);
        let y = b.build_sdiv(min, minus_one);
        b.build_ret(Some(y));

        let (f, preserved) = optimized(f);
        assert_eq!(preserved, PreservedAnalyses::All);
        assert_eq!(f.inst(ret_operand(&f)).unwrap().opcode(), Opcode::SDiv);
    }

    #[test]
    fn test_negative_multiplier_is_not_strength_reduced() {
        let mut f = Function::new("mulneg", &[Type::i32()], Type::i32());
        let entry = f.add_block("entry");
        let x = f.param(0);
        let mut b = Builder::new(&mut f);
        b.position_at_end(entry);
        let k = b.const_int(Type::i32(), (-3i64) as u64);
        let y = b.build_mul(x, k);
        b.build_ret(Some(y));

        let (f, preserved) = optimized(f);
        assert_eq!(preserved, PreservedAnalyses::All);
        assert_eq!(f.inst(ret_operand(&f)).unwrap().opcode(), Opcode::Mul);
    }

    #[test]
    fn test_unused_instruction_is_swept() {
        let mut f = Function::new("dead", &[Type::i32()], Type::Void);
        let entry = f.add_block("entry");
        let x = f.param(0);
        let mut b = Builder::new(&mut f);
        b.position_at_end(entry);
        b.build_add(x, x);
        b.build_ret(None);

        let (f, preserved) = optimized(f);
        assert_eq!(preserved, PreservedAnalyses::None);
        assert_eq!(f.insts(f.entry()).len(), 1);
    }

    #[test]
    fn test_idempotent_at_fixpoint() {
        let mut f = Function::new("idem", &[Type::i32()], Type::i32());
        let entry = f.add_block("entry");
        let x = f.param(0);
        let mut b = Builder::new(&mut f);
        b.position_at_end(entry);
        let six = b.const_int(Type::i32(), 6);
        let two = b.const_int(Type::i32(), 2);
        let y = b.build_mul(x, six);
        let z = b.build_add(y, two);
        let w = b.build_sub(z, two);
        b.build_ret(Some(w));

        let (f, _) = optimized(f);
        let after_first = f.to_string();
        let (f, preserved) = optimized(f);
        assert_eq!(preserved, PreservedAnalyses::All);
        assert_eq!(f.to_string(), after_first);
    }

    proptest! {
        #[test]
        fn prop_folding_matches_reference_arithmetic(
            a: u32,
            b in 1u32..,
            op in 0usize..5,
        ) {
            let opcode = [Opcode::Add, Opcode::Sub, Opcode::Mul, Opcode::UDiv, Opcode::SDiv][op];
            // the signed-overflow quotient is deliberately not folded
            prop_assume!(!(opcode == Opcode::SDiv && a == i32::MIN as u32 && b == u32::MAX));

            let mut f = Function::new("prop", &[], Type::i32());
            let entry = f.add_block("entry");
            let mut builder = Builder::new(&mut f);
            builder.position_at_end(entry);
            let ca = builder.const_int(Type::i32(), a as u64);
            let cb = builder.const_int(Type::i32(), b as u64);
            let r = match opcode {
                Opcode::Add => builder.build_add(ca, cb),
                Opcode::Sub => builder.build_sub(ca, cb),
                Opcode::Mul => builder.build_mul(ca, cb),
                Opcode::UDiv => builder.build_udiv(ca, cb),
                Opcode::SDiv => builder.build_sdiv(ca, cb),
                _ => unreachable!(),
            };
            builder.build_ret(Some(r));

            let expected = match opcode {
                Opcode::Add => a.wrapping_add(b),
                Opcode::Sub => a.wrapping_sub(b),
                Opcode::Mul => a.wrapping_mul(b),
                Opcode::UDiv => a / b,
                Opcode::SDiv => ((a as i32) / (b as i32)) as u32,
                _ => unreachable!(),
            };

            let (f, _) = optimized(f);
            prop_assert_eq!(f.const_bits(ret_operand(&f)), Some(expected as u64));
        }
    }
}
