//! IR Verification
//!
//! Structural well-formedness checks: every block ends in exactly one
//! terminator, the use-list bijection holds in both directions, and phi
//! nodes agree with their block's predecessors. Dominance of uses is a
//! whole-CFG property and is checked by the analysis layer, not here.

use rustc_hash::FxHashSet;

use crate::function::Function;
use crate::instruction::Opcode;
use crate::value::{Use, ValueKind};

/// Verification errors
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("function '{0}' has no blocks")]
    NoBlocks(String),

    #[error("block '{0}' is empty")]
    EmptyBlock(String),

    #[error("block '{0}' does not end in a terminator")]
    MissingTerminator(String),

    #[error("block '{0}' has a terminator before its end")]
    MisplacedTerminator(String),

    #[error("broken use list: {0}")]
    BrokenUseList(String),

    #[error("instruction in block '{0}' has a stale parent link")]
    StaleParent(String),

    #[error("phi in block '{0}': {1}")]
    InvalidPhi(String, String),
}

/// Check the structural invariants of a function
pub fn verify_function(f: &Function) -> Result<(), VerifyError> {
    if f.blocks().is_empty() {
        return Err(VerifyError::NoBlocks(f.name().to_string()));
    }

    for &b in f.blocks() {
        let name = f.block(b).name().to_string();
        let insts = f.insts(b);
        if insts.is_empty() {
            return Err(VerifyError::EmptyBlock(name));
        }
        for (i, &inst) in insts.iter().enumerate() {
            let data = f
                .inst(inst)
                .ok_or_else(|| VerifyError::BrokenUseList(format!(
                    "non-instruction value listed in block '{}'",
                    name
                )))?;
            if f.parent(inst) != Some(b) {
                return Err(VerifyError::StaleParent(name));
            }
            let is_last = i + 1 == insts.len();
            if data.is_terminator() != is_last {
                return Err(if is_last {
                    VerifyError::MissingTerminator(name)
                } else {
                    VerifyError::MisplacedTerminator(name)
                });
            }
        }
    }

    check_use_lists(f)?;
    check_phis(f)
}

/// The use-list bijection: every operand edge has exactly one use record,
/// and every use record names a real operand edge
fn check_use_lists(f: &Function) -> Result<(), VerifyError> {
    for &b in f.blocks() {
        for &inst in f.insts(b) {
            let data = f.inst(inst).unwrap();
            for (index, &op) in data.operands().iter().enumerate() {
                let count = f
                    .uses(op)
                    .iter()
                    .filter(|u| u.user == inst && u.index == index)
                    .count();
                if count != 1 {
                    return Err(VerifyError::BrokenUseList(format!(
                        "operand {} of an instruction in '{}' has {} use records",
                        index,
                        f.block(b).name(),
                        count
                    )));
                }
            }
        }
    }

    for i in 0..f.num_values() {
        let v = crate::value::Value(i as u32);
        for &Use { user, index } in f.uses(v) {
            let ok = match f.value(user).kind() {
                ValueKind::Inst(inst) => {
                    f.parent(user).is_some() && inst.operands().get(index) == Some(&v)
                }
                _ => false,
            };
            if !ok {
                return Err(VerifyError::BrokenUseList(format!(
                    "use record on value {} does not match any operand edge",
                    i
                )));
            }
        }
    }
    Ok(())
}

/// Phi nodes must carry one incoming value per predecessor, and name each
/// predecessor exactly once
fn check_phis(f: &Function) -> Result<(), VerifyError> {
    for &b in f.blocks() {
        let preds: FxHashSet<_> = f.predecessors(b).into_iter().collect();
        for &inst in f.insts(b) {
            let data = f.inst(inst).unwrap();
            if data.opcode() != Opcode::Phi {
                continue;
            }
            let name = f.block(b).name().to_string();
            if data.operands().len() != data.blocks().len() {
                return Err(VerifyError::InvalidPhi(
                    name,
                    "incoming values and blocks differ in length".to_string(),
                ));
            }
            let incoming: FxHashSet<_> = data.blocks().iter().copied().collect();
            if incoming.len() != data.blocks().len() {
                return Err(VerifyError::InvalidPhi(
                    name,
                    "duplicate incoming block".to_string(),
                ));
            }
            if incoming != preds {
                return Err(VerifyError::InvalidPhi(
                    name,
                    "incoming blocks do not match predecessors".to_string(),
                ));
            }
        }
    }
    Ok(())
}
