//! IR Functions
//!
//! A function owns the arenas backing its values and blocks, its parameter
//! values, and an interning table for constants. All IR mutation goes
//! through the primitives defined here, which maintain the use-list
//! invariant: for every instruction `I` and operand index `k`, the pair
//! `(I, k)` appears exactly once in the use list of `I`'s operand at `k`.
//!
//! Constants are interned by `(type, bit pattern)`, so handle equality is
//! value equality.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::block::{Block, BlockData};
use crate::instruction::{Instruction, Opcode};
use crate::types::Type;
use crate::value::{Use, Value, ValueData, ValueKind};

/// A function: parameters, blocks in layout order, and the value arena
pub struct Function {
    name: String,
    ret_ty: Type,
    values: Vec<ValueData>,
    blocks: Vec<BlockData>,
    block_order: Vec<Block>,
    params: Vec<Value>,
    constants: FxHashMap<(Type, u64), Value>,
}

impl Function {
    /// Create a new function with the given parameter types
    pub fn new(name: impl Into<String>, param_tys: &[Type], ret_ty: Type) -> Self {
        let mut f = Self {
            name: name.into(),
            ret_ty,
            values: Vec::new(),
            blocks: Vec::new(),
            block_order: Vec::new(),
            params: Vec::new(),
            constants: FxHashMap::default(),
        };
        for (index, &ty) in param_tys.iter().enumerate() {
            let v = f.alloc_value(ty, ValueKind::Argument { index });
            f.params.push(v);
        }
        f
    }

    fn alloc_value(&mut self, ty: Type, kind: ValueKind) -> Value {
        let v = Value(self.values.len() as u32);
        self.values.push(ValueData {
            ty,
            kind,
            uses: Vec::new(),
            parent: None,
        });
        v
    }

    /// Get the name of this function
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the return type of this function
    pub fn ret_ty(&self) -> Type {
        self.ret_ty
    }

    /// Get the parameter values
    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Get a parameter value by index
    pub fn param(&self, index: usize) -> Value {
        self.params[index]
    }

    // Value accessors

    /// Get the arena slot of a value
    pub fn value(&self, v: Value) -> &ValueData {
        &self.values[v.index()]
    }

    /// Get the type of a value
    pub fn ty(&self, v: Value) -> Type {
        self.values[v.index()].ty
    }

    /// Get the uses of a value
    pub fn uses(&self, v: Value) -> &[Use] {
        &self.values[v.index()].uses
    }

    /// Get the number of uses of a value
    pub fn num_uses(&self, v: Value) -> usize {
        self.values[v.index()].uses.len()
    }

    /// Get the instruction payload of a value, if it is an instruction
    pub fn inst(&self, v: Value) -> Option<&Instruction> {
        self.values[v.index()].as_inst()
    }

    /// Check if a value is an interned constant
    pub fn is_constant(&self, v: Value) -> bool {
        self.values[v.index()].is_constant()
    }

    /// Check if a value is a function argument
    pub fn is_argument(&self, v: Value) -> bool {
        self.values[v.index()].is_argument()
    }

    /// Get the bit pattern of a constant value
    pub fn const_bits(&self, v: Value) -> Option<u64> {
        match self.values[v.index()].kind {
            ValueKind::Constant { bits } => Some(bits),
            _ => None,
        }
    }

    /// Get the value of a constant reinterpreted as signed at its width
    pub fn const_signed(&self, v: Value) -> Option<i64> {
        let bits = self.const_bits(v)?;
        Some(self.ty(v).sign_extend(bits))
    }

    /// Check if a value is a phi instruction
    pub fn is_phi(&self, v: Value) -> bool {
        self.inst(v).map_or(false, |i| i.opcode() == Opcode::Phi)
    }

    /// Get the block containing an installed instruction
    pub fn parent(&self, v: Value) -> Option<Block> {
        self.values[v.index()].parent
    }

    /// Get the number of values allocated in the arena
    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    // Constants

    /// Get or create the constant of the given type and bit pattern.
    ///
    /// The pattern is truncated to the type's width before interning, so
    /// `-1` and the all-ones pattern produce the same handle.
    pub fn const_int(&mut self, ty: Type, bits: u64) -> Value {
        let bits = ty.truncate(bits);
        if let Some(&v) = self.constants.get(&(ty, bits)) {
            return v;
        }
        let v = self.alloc_value(ty, ValueKind::Constant { bits });
        self.constants.insert((ty, bits), v);
        v
    }

    /// Get or create the zero constant of the given type
    pub fn const_zero(&mut self, ty: Type) -> Value {
        self.const_int(ty, 0)
    }

    // Blocks

    /// Append a new, empty block to the function; the first block added is
    /// the entry block
    pub fn add_block(&mut self, name: impl Into<String>) -> Block {
        let b = Block(self.blocks.len() as u32);
        self.blocks.push(BlockData {
            name: name.into(),
            insts: Vec::new(),
        });
        self.block_order.push(b);
        b
    }

    /// Get the entry block
    pub fn entry(&self) -> Block {
        self.block_order[0]
    }

    /// Get the blocks in layout order
    pub fn blocks(&self) -> &[Block] {
        &self.block_order
    }

    /// Get the arena slot of a block
    pub fn block(&self, b: Block) -> &BlockData {
        &self.blocks[b.index()]
    }

    /// Get the instructions of a block, in order
    pub fn insts(&self, b: Block) -> &[Value] {
        &self.blocks[b.index()].insts
    }

    /// Get the terminator of a block, if the block is terminated
    pub fn terminator(&self, b: Block) -> Option<Value> {
        let last = *self.blocks[b.index()].insts.last()?;
        self.inst(last)
            .filter(|inst| inst.is_terminator())
            .map(|_| last)
    }

    /// Get the successor blocks of a block, from its terminator's targets
    pub fn successors(&self, b: Block) -> SmallVec<[Block; 2]> {
        match self.terminator(b) {
            Some(term) => {
                let inst = self.inst(term).unwrap();
                match inst.opcode() {
                    Opcode::Br | Opcode::CondBr => inst.blocks().iter().copied().collect(),
                    _ => SmallVec::new(),
                }
            }
            None => SmallVec::new(),
        }
    }

    /// Get the predecessor blocks of a block, in layout order
    pub fn predecessors(&self, b: Block) -> Vec<Block> {
        self.block_order
            .iter()
            .copied()
            .filter(|&p| self.successors(p).contains(&b))
            .collect()
    }

    /// Get the position of an installed instruction within its block
    pub fn position(&self, v: Value) -> Option<(Block, usize)> {
        let b = self.parent(v)?;
        let idx = self.blocks[b.index()].insts.iter().position(|&i| i == v)?;
        Some((b, idx))
    }

    // Mutation primitives

    fn install(&mut self, inst: Instruction, block: Block, at: usize) -> Value {
        let ty = inst.ty();
        let operands: SmallVec<[Value; 2]> = inst.operands().iter().copied().collect();
        let v = self.alloc_value(ty, ValueKind::Inst(inst));
        self.values[v.index()].parent = Some(block);
        self.blocks[block.index()].insts.insert(at, v);
        for (index, op) in operands.into_iter().enumerate() {
            self.values[op.index()].uses.push(Use { user: v, index });
        }
        v
    }

    /// Append an instruction at the end of a block
    pub fn append(&mut self, block: Block, inst: Instruction) -> Value {
        let at = self.blocks[block.index()].insts.len();
        self.install(inst, block, at)
    }

    /// Splice a new instruction immediately before an installed one
    pub fn insert_before(&mut self, pos: Value, inst: Instruction) -> Value {
        let (block, at) = self.position(pos).expect("insert_before: position not installed");
        self.install(inst, block, at)
    }

    /// Splice a new instruction immediately after an installed one
    pub fn insert_after(&mut self, pos: Value, inst: Instruction) -> Value {
        let (block, at) = self.position(pos).expect("insert_after: position not installed");
        self.install(inst, block, at + 1)
    }

    /// Move an installed instruction to immediately before another one
    pub fn move_before(&mut self, inst: Value, pos: Value) {
        let (from_block, from_at) = self.position(inst).expect("move_before: inst not installed");
        self.blocks[from_block.index()].insts.remove(from_at);
        let (to_block, to_at) = self.position(pos).expect("move_before: position not installed");
        self.blocks[to_block.index()].insts.insert(to_at, inst);
        self.values[inst.index()].parent = Some(to_block);
    }

    fn remove_use(&mut self, of: Value, user: Value, index: usize) {
        let uses = &mut self.values[of.index()].uses;
        let at = uses
            .iter()
            .position(|u| u.user == user && u.index == index)
            .expect("use-list invariant broken: missing use record");
        uses.swap_remove(at);
    }

    fn set_operand(&mut self, user: Value, index: usize, new: Value) {
        let old = match &mut self.values[user.index()].kind {
            ValueKind::Inst(inst) => std::mem::replace(&mut inst.operands[index], new),
            _ => panic!("set_operand: not an instruction"),
        };
        self.remove_use(old, user, index);
        self.values[new.index()].uses.push(Use { user, index });
    }

    /// Rewrite every use of `old` to reference `new`; `old`'s use list
    /// becomes empty
    pub fn replace_all_uses_with(&mut self, old: Value, new: Value) {
        assert_ne!(old, new, "replace_all_uses_with: old and new are the same value");
        let uses = std::mem::take(&mut self.values[old.index()].uses);
        for u in uses {
            match &mut self.values[u.user.index()].kind {
                ValueKind::Inst(inst) => inst.operands[u.index] = new,
                _ => panic!("use-list invariant broken: user is not an instruction"),
            }
            self.values[new.index()].uses.push(u);
        }
    }

    /// Rewrite one instruction's operands: every slot referencing `old`
    /// now references `new`
    pub fn replace_uses_of_with(&mut self, user: Value, old: Value, new: Value) {
        let indices: Vec<usize> = match self.inst(user) {
            Some(inst) => inst
                .operands()
                .iter()
                .enumerate()
                .filter(|(_, &op)| op == old)
                .map(|(i, _)| i)
                .collect(),
            None => panic!("replace_uses_of_with: not an instruction"),
        };
        for index in indices {
            self.set_operand(user, index, new);
        }
    }

    /// Rewrite a phi's incoming value for the given predecessor block.
    ///
    /// Front-ends use this to close loop-carried phis whose latch value
    /// does not exist yet when the phi is created.
    pub fn set_phi_incoming(&mut self, phi: Value, pred: Block, new: Value) {
        let index = match self.inst(phi) {
            Some(inst) if inst.opcode() == Opcode::Phi => inst
                .blocks()
                .iter()
                .position(|&b| b == pred)
                .expect("set_phi_incoming: no incoming slot for block"),
            _ => panic!("set_phi_incoming: not a phi"),
        };
        self.set_operand(phi, index, new);
    }

    /// Rewrite a terminator's or phi's block references: every slot naming
    /// `old` now names `new`
    pub fn replace_branch_target(&mut self, inst: Value, old: Block, new: Block) {
        match &mut self.values[inst.index()].kind {
            ValueKind::Inst(i) => {
                for b in i.blocks.iter_mut() {
                    if *b == old {
                        *b = new;
                    }
                }
            }
            _ => panic!("replace_branch_target: not an instruction"),
        }
    }

    /// Remove an instruction from its block and break its operand links.
    ///
    /// Panics if the instruction still has uses; retarget them first.
    pub fn erase(&mut self, v: Value) {
        assert!(
            self.values[v.index()].uses.is_empty(),
            "erase: instruction still has uses"
        );
        let (block, at) = self.position(v).expect("erase: not an installed instruction");
        self.blocks[block.index()].insts.remove(at);
        self.values[v.index()].parent = None;
        let operands: Vec<Value> = match &self.values[v.index()].kind {
            ValueKind::Inst(inst) => inst.operands().to_vec(),
            _ => unreachable!(),
        };
        for (index, op) in operands.into_iter().enumerate() {
            self.remove_use(op, v, index);
        }
    }
}
