//! IR Printer
//!
//! `Display` implementations producing a textual listing of modules,
//! functions, and instructions. The listing is stable for a given function,
//! which makes it usable both for diagnostics and for byte-identity
//! assertions in tests.

use std::fmt;

use rustc_hash::FxHashMap;

use crate::function::Function;
use crate::instruction::{IntPredicate, Opcode};
use crate::module::Module;
use crate::value::Value;

fn opcode_name(opcode: Opcode) -> &'static str {
    match opcode {
        Opcode::Add => "add",
        Opcode::Sub => "sub",
        Opcode::Mul => "mul",
        Opcode::UDiv => "udiv",
        Opcode::SDiv => "sdiv",
        Opcode::Shl => "shl",
        Opcode::LShr => "lshr",
        Opcode::ICmp => "icmp",
        Opcode::Load => "load",
        Opcode::Store => "store",
        Opcode::GetElementPtr => "getelementptr",
        Opcode::Br | Opcode::CondBr => "br",
        Opcode::Ret => "ret",
        Opcode::Phi => "phi",
    }
}

fn predicate_name(pred: IntPredicate) -> &'static str {
    match pred {
        IntPredicate::EQ => "eq",
        IntPredicate::NE => "ne",
        IntPredicate::UGT => "ugt",
        IntPredicate::UGE => "uge",
        IntPredicate::ULT => "ult",
        IntPredicate::ULE => "ule",
        IntPredicate::SGT => "sgt",
        IntPredicate::SGE => "sge",
        IntPredicate::SLT => "slt",
        IntPredicate::SLE => "sle",
    }
}

/// Assign `%N` names to value-producing instructions in layout order
fn number_values(f: &Function) -> FxHashMap<Value, usize> {
    let mut names = FxHashMap::default();
    let mut next = 0;
    for &b in f.blocks() {
        for &inst in f.insts(b) {
            if f.inst(inst).unwrap().ty() != crate::types::Type::Void {
                names.insert(inst, next);
                next += 1;
            }
        }
    }
    names
}

fn fmt_operand(
    f: &Function,
    names: &FxHashMap<Value, usize>,
    v: Value,
    out: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    if let Some(bits) = f.const_bits(v) {
        write!(out, "{}", f.ty(v).sign_extend(bits))
    } else if f.is_argument(v) {
        match f.value(v).kind() {
            crate::value::ValueKind::Argument { index } => write!(out, "%arg{}", index),
            _ => unreachable!(),
        }
    } else {
        match names.get(&v) {
            Some(n) => write!(out, "%{}", n),
            None => write!(out, "%?"),
        }
    }
}

fn fmt_inst(
    f: &Function,
    names: &FxHashMap<Value, usize>,
    inst: Value,
    out: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    let data = f.inst(inst).unwrap();
    if let Some(n) = names.get(&inst) {
        write!(out, "%{} = ", n)?;
    }
    match data.opcode() {
        op if op.is_binary_int_op() => {
            write!(out, "{} {} ", opcode_name(op), data.ty())?;
            fmt_operand(f, names, data.operands()[0], out)?;
            write!(out, ", ")?;
            fmt_operand(f, names, data.operands()[1], out)
        }
        Opcode::ICmp => {
            let lhs = data.operands()[0];
            write!(
                out,
                "icmp {} {} ",
                predicate_name(data.predicate().unwrap()),
                f.ty(lhs)
            )?;
            fmt_operand(f, names, lhs, out)?;
            write!(out, ", ")?;
            fmt_operand(f, names, data.operands()[1], out)
        }
        Opcode::Load => {
            write!(out, "load {}, ptr ", data.ty())?;
            fmt_operand(f, names, data.operands()[0], out)
        }
        Opcode::Store => {
            let value = data.operands()[0];
            write!(out, "store {} ", f.ty(value))?;
            fmt_operand(f, names, value, out)?;
            write!(out, ", ptr ")?;
            fmt_operand(f, names, data.operands()[1], out)
        }
        Opcode::GetElementPtr => {
            let index = data.operands()[1];
            write!(out, "getelementptr ptr ")?;
            fmt_operand(f, names, data.operands()[0], out)?;
            write!(out, ", {} ", f.ty(index))?;
            fmt_operand(f, names, index, out)
        }
        Opcode::Br => {
            write!(out, "br label %{}", f.block(data.blocks()[0]).name())
        }
        Opcode::CondBr => {
            write!(out, "br i1 ")?;
            fmt_operand(f, names, data.operands()[0], out)?;
            write!(
                out,
                ", label %{}, label %{}",
                f.block(data.blocks()[0]).name(),
                f.block(data.blocks()[1]).name()
            )
        }
        Opcode::Ret => match data.operands().first() {
            Some(&v) => {
                write!(out, "ret {} ", f.ty(v))?;
                fmt_operand(f, names, v, out)
            }
            None => write!(out, "ret void"),
        },
        Opcode::Phi => {
            write!(out, "phi {} ", data.ty())?;
            for (i, (&v, &b)) in data.operands().iter().zip(data.blocks()).enumerate() {
                if i > 0 {
                    write!(out, ", ")?;
                }
                write!(out, "[ ")?;
                fmt_operand(f, names, v, out)?;
                write!(out, ", %{} ]", f.block(b).name())?;
            }
            Ok(())
        }
        _ => unreachable!(),
    }
}

impl fmt::Display for Function {
    fn fmt(&self, out: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = number_values(self);
        write!(out, "define {} @{}(", self.ret_ty(), self.name())?;
        for (i, &p) in self.params().iter().enumerate() {
            if i > 0 {
                write!(out, ", ")?;
            }
            write!(out, "{} %arg{}", self.ty(p), i)?;
        }
        writeln!(out, ") {{")?;
        for &b in self.blocks() {
            writeln!(out, "{}:", self.block(b).name())?;
            for &inst in self.insts(b) {
                write!(out, "  ")?;
                fmt_inst(self, &names, inst, out)?;
                writeln!(out)?;
            }
        }
        writeln!(out, "}}")
    }
}

impl fmt::Display for Module {
    fn fmt(&self, out: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(out, "; ModuleID = '{}'", self.name())?;
        for func in self.functions() {
            writeln!(out)?;
            write!(out, "{}", func)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;
    use crate::types::Type;

    #[test]
    fn test_print_simple_function() {
        let mut f = Function::new("addmul", &[Type::i32()], Type::i32());
        let entry = f.add_block("entry");
        let x = f.param(0);
        let mut b = Builder::new(&mut f);
        b.position_at_end(entry);
        let two = b.const_int(Type::i32(), 2);
        let y = b.build_add(x, two);
        let z = b.build_mul(y, y);
        b.build_ret(Some(z));

        let expected = "\
define i32 @addmul(i32 %arg0) {
entry:
  %0 = add i32 %arg0, 2
  %1 = mul i32 %0, %0
  ret i32 %1
}
";
        assert_eq!(f.to_string(), expected);
    }

    #[test]
    fn test_print_phi_and_branches() {
        let mut f = Function::new("count", &[Type::i32()], Type::Void);
        let entry = f.add_block("entry");
        let header = f.add_block("header");
        let exit = f.add_block("exit");
        let n = f.param(0);
        let mut b = Builder::new(&mut f);
        b.position_at_end(entry);
        let zero = b.const_int(Type::i32(), 0);
        b.build_br(header);
        b.position_at_end(header);
        let iv = b.build_phi(Type::i32(), &[(zero, entry)]);
        let one = b.const_int(Type::i32(), 1);
        let next = b.build_add(iv, one);
        let cmp = b.build_icmp(crate::instruction::IntPredicate::ULT, next, n);
        b.build_cond_br(cmp, header, exit);
        b.position_at_end(exit);
        b.build_ret(None);

        let text = f.to_string();
        assert!(text.contains("%0 = phi i32 [ 0, %entry ]"));
        assert!(text.contains("br i1 %2, label %header, label %exit"));
        assert!(text.contains("ret void"));
    }
}
