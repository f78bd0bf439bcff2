//! IR Builder
//!
//! The Builder provides a convenient API for constructing IR. It maintains
//! an insertion point and appends instructions at the end of the current
//! block.

use crate::block::Block;
use crate::function::Function;
use crate::instruction::{Instruction, IntPredicate, Opcode};
use crate::types::Type;
use crate::value::Value;

/// An IR builder appending instructions to a block of a function
pub struct Builder<'f> {
    func: &'f mut Function,
    block: Option<Block>,
}

impl<'f> Builder<'f> {
    /// Create a new builder over the given function
    pub fn new(func: &'f mut Function) -> Self {
        Self { func, block: None }
    }

    /// Set the insertion point to the end of the given block
    pub fn position_at_end(&mut self, block: Block) {
        self.block = Some(block);
    }

    /// Get the current insertion block
    pub fn insertion_block(&self) -> Option<Block> {
        self.block
    }

    /// Get the function being built
    pub fn func(&mut self) -> &mut Function {
        self.func
    }

    fn insert(&mut self, inst: Instruction) -> Value {
        let block = self.block.expect("builder has no insertion point");
        assert!(
            self.func.terminator(block).is_none(),
            "cannot append to a terminated block"
        );
        self.func.append(block, inst)
    }

    /// Get or create a constant of the given type and bit pattern
    pub fn const_int(&mut self, ty: Type, bits: u64) -> Value {
        self.func.const_int(ty, bits)
    }

    fn binary(&mut self, opcode: Opcode, lhs: Value, rhs: Value) -> Value {
        let ty = self.func.ty(lhs);
        assert!(ty.is_int(), "binary operands must be integers");
        assert_eq!(ty, self.func.ty(rhs), "binary operand types differ");
        self.insert(Instruction::binary(opcode, ty, lhs, rhs))
    }

    /// Create an integer addition
    pub fn build_add(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Add, lhs, rhs)
    }

    /// Create an integer subtraction
    pub fn build_sub(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Sub, lhs, rhs)
    }

    /// Create an integer multiplication
    pub fn build_mul(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Mul, lhs, rhs)
    }

    /// Create an unsigned integer division
    pub fn build_udiv(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::UDiv, lhs, rhs)
    }

    /// Create a signed integer division
    pub fn build_sdiv(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::SDiv, lhs, rhs)
    }

    /// Create a left shift
    pub fn build_shl(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Shl, lhs, rhs)
    }

    /// Create a logical right shift
    pub fn build_lshr(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::LShr, lhs, rhs)
    }

    /// Create an integer comparison
    pub fn build_icmp(&mut self, pred: IntPredicate, lhs: Value, rhs: Value) -> Value {
        self.insert(Instruction::icmp(pred, lhs, rhs))
    }

    /// Create a load of `ty` through `ptr`
    pub fn build_load(&mut self, ty: Type, ptr: Value) -> Value {
        self.insert(Instruction::load(ty, ptr))
    }

    /// Create a store of `value` through `ptr`
    pub fn build_store(&mut self, value: Value, ptr: Value) -> Value {
        self.insert(Instruction::store(value, ptr))
    }

    /// Create an element-pointer computation
    pub fn build_gep(&mut self, base: Value, index: Value) -> Value {
        self.insert(Instruction::gep(base, index))
    }

    /// Create an unconditional branch
    pub fn build_br(&mut self, dest: Block) -> Value {
        self.insert(Instruction::br(dest))
    }

    /// Create a conditional branch
    pub fn build_cond_br(&mut self, cond: Value, then_dest: Block, else_dest: Block) -> Value {
        self.insert(Instruction::cond_br(cond, then_dest, else_dest))
    }

    /// Create a return
    pub fn build_ret(&mut self, value: Option<Value>) -> Value {
        self.insert(Instruction::ret(value))
    }

    /// Create a phi from `(incoming value, predecessor block)` pairs
    pub fn build_phi(&mut self, ty: Type, incoming: &[(Value, Block)]) -> Value {
        self.insert(Instruction::phi(ty, incoming))
    }
}
