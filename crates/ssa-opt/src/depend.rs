//! Memory dependence oracle
//!
//! A deliberately conservative may-dependence query over pairs of memory
//! instructions. With no alias analysis behind it, any pair involving a
//! store may touch the same location; only read/read pairs are known
//! independent. Clients that can prove more (for example, by comparing the
//! scalar evolutions of the two addresses) refine the answer themselves.

use ssa_core::{Function, Opcode, Value};

/// The dependence oracle
#[derive(Default)]
pub struct DependenceInfo;

impl DependenceInfo {
    pub fn new() -> Self {
        Self
    }

    /// May there be a dependence between two memory instructions?
    ///
    /// Returns false when either value is not a memory access, or when both
    /// are loads.
    pub fn depends(&self, f: &Function, src: Value, dst: Value) -> bool {
        let (Some(a), Some(b)) = (f.inst(src), f.inst(dst)) else {
            return false;
        };
        let is_access = |op: Opcode| matches!(op, Opcode::Load | Opcode::Store);
        if !is_access(a.opcode()) || !is_access(b.opcode()) {
            return false;
        }
        if a.opcode() == Opcode::Load && b.opcode() == Opcode::Load {
            return false;
        }
        true
    }
}

/// The pointer operand of a load or store
pub fn load_store_pointer(f: &Function, v: Value) -> Option<Value> {
    let inst = f.inst(v)?;
    match inst.opcode() {
        Opcode::Load => Some(inst.operands()[0]),
        Opcode::Store => Some(inst.operands()[1]),
        _ => None,
    }
}
