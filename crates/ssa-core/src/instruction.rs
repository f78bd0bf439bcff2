//! IR Instructions
//!
//! Instructions are the operations of the IR: integer arithmetic, memory
//! access, comparisons, and control flow. The `Instruction` struct is a pure
//! payload; identity, the use list, and the parent block live in the
//! function arena slot that owns it.

use smallvec::{smallvec, SmallVec};

use crate::block::Block;
use crate::types::Type;
use crate::value::Value;

/// Instruction opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // Binary integer operations
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    Shl,
    LShr,

    // Comparison
    ICmp,

    // Memory operations
    Load,
    Store,
    GetElementPtr,

    // Control flow
    Br,
    CondBr,
    Ret,

    // Other
    Phi,
}

impl Opcode {
    /// Check if this is a terminator opcode
    pub fn is_terminator(&self) -> bool {
        matches!(self, Opcode::Br | Opcode::CondBr | Opcode::Ret)
    }

    /// Check if this is one of the binary integer opcodes the scalar
    /// optimizations operate on
    pub fn is_binary_int_op(&self) -> bool {
        matches!(
            self,
            Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::UDiv
                | Opcode::SDiv
                | Opcode::Shl
                | Opcode::LShr
        )
    }

    /// Check if the operation is commutative
    pub fn is_commutative(&self) -> bool {
        matches!(self, Opcode::Add | Opcode::Mul)
    }

    /// Check if this is a memory opcode
    pub fn is_memory_op(&self) -> bool {
        matches!(self, Opcode::Load | Opcode::Store | Opcode::GetElementPtr)
    }
}

/// Integer comparison predicates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntPredicate {
    EQ,
    NE,
    UGT,
    UGE,
    ULT,
    ULE,
    SGT,
    SGE,
    SLT,
    SLE,
}

/// An instruction payload: opcode, operand values, and block references.
///
/// `blocks` carries the branch targets of Br/CondBr, and for Phi the
/// incoming predecessor blocks, parallel to `operands`. It is empty for
/// every other opcode.
pub struct Instruction {
    pub(crate) opcode: Opcode,
    pub(crate) ty: Type,
    pub(crate) operands: SmallVec<[Value; 2]>,
    pub(crate) blocks: SmallVec<[Block; 2]>,
    pub(crate) predicate: Option<IntPredicate>,
}

impl Instruction {
    /// Create a binary integer instruction
    pub fn binary(opcode: Opcode, ty: Type, lhs: Value, rhs: Value) -> Self {
        assert!(opcode.is_binary_int_op(), "not a binary opcode: {:?}", opcode);
        Self {
            opcode,
            ty,
            operands: smallvec![lhs, rhs],
            blocks: SmallVec::new(),
            predicate: None,
        }
    }

    /// Create an integer comparison
    pub fn icmp(predicate: IntPredicate, lhs: Value, rhs: Value) -> Self {
        Self {
            opcode: Opcode::ICmp,
            ty: Type::i1(),
            operands: smallvec![lhs, rhs],
            blocks: SmallVec::new(),
            predicate: Some(predicate),
        }
    }

    /// Create a load of `ty` through `ptr`
    pub fn load(ty: Type, ptr: Value) -> Self {
        Self {
            opcode: Opcode::Load,
            ty,
            operands: smallvec![ptr],
            blocks: SmallVec::new(),
            predicate: None,
        }
    }

    /// Create a store of `value` through `ptr`
    pub fn store(value: Value, ptr: Value) -> Self {
        Self {
            opcode: Opcode::Store,
            ty: Type::Void,
            operands: smallvec![value, ptr],
            blocks: SmallVec::new(),
            predicate: None,
        }
    }

    /// Create an element-pointer computation from a base pointer and an index
    pub fn gep(base: Value, index: Value) -> Self {
        Self {
            opcode: Opcode::GetElementPtr,
            ty: Type::Ptr,
            operands: smallvec![base, index],
            blocks: SmallVec::new(),
            predicate: None,
        }
    }

    /// Create an unconditional branch
    pub fn br(dest: Block) -> Self {
        Self {
            opcode: Opcode::Br,
            ty: Type::Void,
            operands: SmallVec::new(),
            blocks: smallvec![dest],
            predicate: None,
        }
    }

    /// Create a conditional branch
    pub fn cond_br(cond: Value, then_dest: Block, else_dest: Block) -> Self {
        Self {
            opcode: Opcode::CondBr,
            ty: Type::Void,
            operands: smallvec![cond],
            blocks: smallvec![then_dest, else_dest],
            predicate: None,
        }
    }

    /// Create a return, optionally carrying a value
    pub fn ret(value: Option<Value>) -> Self {
        Self {
            opcode: Opcode::Ret,
            ty: Type::Void,
            operands: value.into_iter().collect(),
            blocks: SmallVec::new(),
            predicate: None,
        }
    }

    /// Create a phi from `(incoming value, predecessor block)` pairs
    pub fn phi(ty: Type, incoming: &[(Value, Block)]) -> Self {
        Self {
            opcode: Opcode::Phi,
            ty,
            operands: incoming.iter().map(|(v, _)| *v).collect(),
            blocks: incoming.iter().map(|(_, b)| *b).collect(),
            predicate: None,
        }
    }

    /// Get the opcode
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Get the result type
    pub fn ty(&self) -> Type {
        self.ty
    }

    /// Get the operand values
    pub fn operands(&self) -> &[Value] {
        &self.operands
    }

    /// Get the block references (branch targets, or phi incoming blocks)
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Get the comparison predicate of an ICmp
    pub fn predicate(&self) -> Option<IntPredicate> {
        self.predicate
    }

    /// Check if this is a terminator instruction
    pub fn is_terminator(&self) -> bool {
        self.opcode.is_terminator()
    }

    /// Check if this is a binary integer operation
    pub fn is_binary_int_op(&self) -> bool {
        self.opcode.is_binary_int_op()
    }

    /// For a phi, the incoming value for the given predecessor block
    pub fn incoming_for(&self, pred: Block) -> Option<Value> {
        assert_eq!(self.opcode, Opcode::Phi);
        self.blocks
            .iter()
            .position(|&b| b == pred)
            .map(|i| self.operands[i])
    }
}
