//! Scalar evolution
//!
//! A minimal scalar-evolution analysis restricted to affine add-recurrences
//! over a loop's canonical induction variable. That is exactly the shape
//! the fusion legality test consumes: memory subscripts of the form
//! `base[start + stride * i]` and symbolic backedge-taken counts compared
//! structurally between two loops of the same function.

use ssa_core::{Block, Function, IntPredicate, Opcode, Value};

use crate::loop_info::Loop;

/// A symbolic expression at loop scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scev {
    /// A compile-time constant, read as signed at its width
    Constant(i64),
    /// An opaque loop-invariant value
    Unknown(Value),
    /// An invariant value plus a constant offset
    Offset { base: Value, offset: i64 },
    /// An affine recurrence `start + step * i`
    AddRec(AddRec),
    /// No result could be computed
    CouldNotCompute,
}

/// An affine add-recurrence on a loop's canonical induction variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRec {
    /// The identified array base, for recurrences describing an address
    pub base: Option<Value>,
    /// The subscript at the first iteration
    pub start: Box<Scev>,
    /// The constant per-iteration stride
    pub step: i64,
    /// Header of the loop the recurrence runs over
    pub header: Block,
}

impl Scev {
    /// The zero expression
    pub fn zero() -> Scev {
        Scev::Constant(0)
    }

    /// Arithmetic negation; only constants are closed under it here
    pub fn negate(&self) -> Scev {
        match self {
            Scev::Constant(c) => Scev::Constant(c.wrapping_neg()),
            _ => Scev::CouldNotCompute,
        }
    }
}

/// The scalar-evolution oracle
#[derive(Default)]
pub struct ScalarEvolution;

impl ScalarEvolution {
    pub fn new() -> Self {
        Self
    }

    /// The symbolic form of a value at the given loop's scope.
    ///
    /// Pointers produced by `getelementptr` become add-recurrences carrying
    /// their base; integers become constants, invariant unknowns, or
    /// add-recurrences on the loop's canonical induction variable.
    pub fn at_scope(&self, f: &Function, v: Value, lp: &Loop) -> Scev {
        if let Some(inst) = f.inst(v) {
            if inst.opcode() == Opcode::GetElementPtr {
                let base = inst.operands()[0];
                let index = inst.operands()[1];
                if self.defined_inside(f, base, lp) {
                    return Scev::CouldNotCompute;
                }
                return match self.eval(f, index, lp) {
                    Scev::AddRec(rec) => Scev::AddRec(AddRec {
                        base: Some(base),
                        ..rec
                    }),
                    // an invariant subscript is a zero-stride recurrence
                    s @ (Scev::Constant(_) | Scev::Unknown(_) | Scev::Offset { .. }) => {
                        Scev::AddRec(AddRec {
                            base: Some(base),
                            start: Box::new(s),
                            step: 0,
                            header: lp.header(),
                        })
                    }
                    _ => Scev::CouldNotCompute,
                };
            }
        }
        self.eval(f, v, lp)
    }

    fn defined_inside(&self, f: &Function, v: Value, lp: &Loop) -> bool {
        f.parent(v).map_or(false, |b| lp.contains(b))
    }

    fn eval(&self, f: &Function, v: Value, lp: &Loop) -> Scev {
        if let Some(c) = f.const_signed(v) {
            return Scev::Constant(c);
        }
        if !self.defined_inside(f, v, lp) {
            return Scev::Unknown(v);
        }
        if let Some((iv, step)) = lp.canonical_iv_and_step(f) {
            if v == iv {
                return Scev::AddRec(AddRec {
                    base: None,
                    start: Box::new(Scev::Constant(0)),
                    step,
                    header: lp.header(),
                });
            }
        }
        let Some(inst) = f.inst(v) else {
            return Scev::CouldNotCompute;
        };
        match inst.opcode() {
            Opcode::Add => {
                let lhs = self.eval(f, inst.operands()[0], lp);
                let rhs = self.eval(f, inst.operands()[1], lp);
                add(&lhs, &rhs)
            }
            Opcode::Sub => {
                let lhs = self.eval(f, inst.operands()[0], lp);
                let rhs = self.eval(f, inst.operands()[1], lp);
                match rhs {
                    Scev::Constant(c) => add(&lhs, &Scev::Constant(c.wrapping_neg())),
                    _ => Scev::CouldNotCompute,
                }
            }
            Opcode::Mul => {
                let lhs = self.eval(f, inst.operands()[0], lp);
                let rhs = self.eval(f, inst.operands()[1], lp);
                match (&lhs, &rhs) {
                    (s, Scev::Constant(c)) | (Scev::Constant(c), s) => scale(s, *c),
                    _ => Scev::CouldNotCompute,
                }
            }
            _ => Scev::CouldNotCompute,
        }
    }

    /// The number of backedges taken by a canonical counted loop, as a
    /// symbolic expression; `CouldNotCompute` when the loop's exit shape is
    /// not recognized.
    ///
    /// Recognizes a header-exiting `icmp ult/slt/ne iv, bound` over a
    /// canonical induction variable stepping by one, and reports
    /// `bound - 1`. The value is only ever compared structurally against
    /// another loop's count.
    pub fn backedge_taken_count(&self, f: &Function, lp: &Loop) -> Scev {
        let Some((iv, step)) = lp.canonical_iv_and_step(f) else {
            return Scev::CouldNotCompute;
        };
        if step != 1 {
            return Scev::CouldNotCompute;
        }
        let Some(term) = f.terminator(lp.header()) else {
            return Scev::CouldNotCompute;
        };
        let term_inst = f.inst(term).unwrap();
        if term_inst.opcode() != Opcode::CondBr {
            return Scev::CouldNotCompute;
        }
        let cond = term_inst.operands()[0];
        let Some(cmp) = f.inst(cond) else {
            return Scev::CouldNotCompute;
        };
        if cmp.opcode() != Opcode::ICmp
            || !matches!(
                cmp.predicate(),
                Some(IntPredicate::ULT | IntPredicate::SLT | IntPredicate::NE)
            )
        {
            return Scev::CouldNotCompute;
        }
        let &[lhs, bound] = cmp.operands() else {
            return Scev::CouldNotCompute;
        };
        if lhs != iv || self.defined_inside(f, bound, lp) {
            return Scev::CouldNotCompute;
        }
        match f.const_signed(bound) {
            Some(c) => Scev::Constant(c.wrapping_sub(1)),
            None => Scev::Offset {
                base: bound,
                offset: -1,
            },
        }
    }

    /// The constant difference `a - b`, when it is known
    pub fn minus(&self, a: &Scev, b: &Scev) -> Option<i64> {
        if a == b {
            return Some(0);
        }
        match (a, b) {
            (Scev::Constant(x), Scev::Constant(y)) => Some(x.wrapping_sub(*y)),
            (Scev::Offset { base: b1, offset: o1 }, Scev::Offset { base: b2, offset: o2 })
                if b1 == b2 =>
            {
                Some(o1.wrapping_sub(*o2))
            }
            (Scev::Offset { base: b1, offset }, Scev::Unknown(b2)) if b1 == b2 => Some(*offset),
            (Scev::Unknown(b1), Scev::Offset { base: b2, offset }) if b1 == b2 => {
                Some(offset.wrapping_neg())
            }
            _ => None,
        }
    }

    /// Whether `pred` is known to hold between two expressions; false when
    /// it cannot be decided
    pub fn is_known_predicate(&self, pred: IntPredicate, a: &Scev, b: &Scev) -> bool {
        match (a, b) {
            (Scev::Constant(x), Scev::Constant(y)) => match pred {
                IntPredicate::EQ => x == y,
                IntPredicate::NE => x != y,
                IntPredicate::SLT => x < y,
                IntPredicate::SLE => x <= y,
                IntPredicate::SGT => x > y,
                IntPredicate::SGE => x >= y,
                IntPredicate::ULT => (*x as u64) < (*y as u64),
                IntPredicate::ULE => (*x as u64) <= (*y as u64),
                IntPredicate::UGT => (*x as u64) > (*y as u64),
                IntPredicate::UGE => (*x as u64) >= (*y as u64),
            },
            _ => pred == IntPredicate::EQ && a == b && *a != Scev::CouldNotCompute,
        }
    }
}

fn add(lhs: &Scev, rhs: &Scev) -> Scev {
    match (lhs, rhs) {
        (Scev::Constant(a), Scev::Constant(b)) => Scev::Constant(a.wrapping_add(*b)),
        (Scev::Unknown(base), Scev::Constant(c)) | (Scev::Constant(c), Scev::Unknown(base)) => {
            Scev::Offset {
                base: *base,
                offset: *c,
            }
        }
        (Scev::Offset { base, offset }, Scev::Constant(c))
        | (Scev::Constant(c), Scev::Offset { base, offset }) => Scev::Offset {
            base: *base,
            offset: offset.wrapping_add(*c),
        },
        (Scev::AddRec(_), Scev::AddRec(_)) => Scev::CouldNotCompute,
        (Scev::AddRec(rec), other) | (other, Scev::AddRec(rec)) => {
            let start = add(&rec.start, other);
            if start == Scev::CouldNotCompute {
                return Scev::CouldNotCompute;
            }
            Scev::AddRec(AddRec {
                start: Box::new(start),
                ..rec.clone()
            })
        }
        _ => Scev::CouldNotCompute,
    }
}

fn scale(s: &Scev, c: i64) -> Scev {
    match s {
        Scev::Constant(x) => Scev::Constant(x.wrapping_mul(c)),
        Scev::AddRec(rec) => {
            let start = scale(&rec.start, c);
            if start == Scev::CouldNotCompute {
                return Scev::CouldNotCompute;
            }
            Scev::AddRec(AddRec {
                start: Box::new(start),
                step: rec.step.wrapping_mul(c),
                ..rec.clone()
            })
        }
        _ => Scev::CouldNotCompute,
    }
}
