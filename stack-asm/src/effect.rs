use crate::{CodeIterator, Opcode};

/// A pop or push count that is either statically known or depends on a
/// runtime value (the `n` of `ndup`/`nrot`/`ntuck`, or an optional
/// instruction's descriptor).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// The count is this value.
    Known(i32),
    /// The count cannot be determined statically.
    Unknown,
}

/// Pop and push counts of a single instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstructionEffect {
    pops: Effect,
    pushes: Effect,
}

impl InstructionEffect {
    /// Effect of the instruction starting with `byte`.
    pub const fn of(byte: u8) -> InstructionEffect {
        use Effect::{Known, Unknown};
        let (pops, pushes) = match Opcode::parse(byte) {
            Some(
                Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Div
                | Opcode::Mod
                | Opcode::Max
                | Opcode::Min
                | Opcode::Lt
                | Opcode::Le
                | Opcode::Eq
                | Opcode::Ge
                | Opcode::Gt,
            ) => (Known(2), Known(1)),
            Some(Opcode::Inc | Opcode::Dec | Opcode::Fetch | Opcode::Nrnd) => (Known(1), Known(1)),
            Some(Opcode::Drop | Opcode::Call | Opcode::Jmp | Opcode::Wait) => (Known(1), Known(0)),
            Some(Opcode::Halt | Opcode::Ret) => (Known(0), Known(0)),
            Some(Opcode::Dup) => (Known(1), Known(2)),
            Some(Opcode::Cjmp) => (Known(2), Known(0)),
            Some(Opcode::Size | Opcode::Push8 | Opcode::Push16) => (Known(0), Known(1)),
            Some(Opcode::Swap) => (Known(2), Known(2)),
            Some(Opcode::Tuck | Opcode::Rot) => (Known(3), Known(3)),
            Some(Opcode::Ndup | Opcode::Nrot | Opcode::Ntuck) => (Unknown, Known(0)),
            // Optional instructions and unassigned bytes.
            None => (Unknown, Unknown),
        };
        InstructionEffect { pops, pushes }
    }

    /// Pop count.
    pub const fn pops(&self) -> Effect {
        self.pops
    }

    /// Push count.
    pub const fn pushes(&self) -> Effect {
        self.pushes
    }

    /// Whether the pop count is statically known.
    pub const fn deterministic_pops(&self) -> bool {
        matches!(self.pops, Effect::Known(_))
    }
}

/// Aggregate stack effect of a basic block.
///
/// `pop_count` is the highest number of words the block reads below its
/// entry stack pointer, `push_count` the deepest it grows beyond it, and
/// `height_difference` the net movement (positive for a shrinking stack,
/// matching the descending stack pointer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStackEffect {
    deterministic_pops: bool,
    pop_count: i32,
    push_count: i32,
    height_difference: i32,
}

impl BlockStackEffect {
    /// Accumulates the effect of every instruction `iter` visits.
    ///
    /// For `ndup`/`nrot`/`ntuck` the reach is resolved from a directly
    /// preceding constant push; otherwise the block is marked
    /// non-deterministic and at least one present value is assumed. This is
    /// sufficient because the non-deterministic cases are lowered to helper
    /// calls that re-check bounds themselves.
    pub fn from_iter(mut iter: CodeIterator<'_>) -> Self {
        let mut effect = BlockStackEffect {
            deterministic_pops: true,
            pop_count: 0,
            push_count: 0,
            height_difference: 0,
        };

        while !iter.finished() {
            match iter.opcode() {
                Some(Opcode::Ndup) => {
                    // Height is unchanged, but the duplicated slot must be
                    // on the stack already.
                    if iter.last_was_push() {
                        effect.pop_count = effect
                            .pop_count
                            .max(effect.height_difference + iter.push_value());
                    } else {
                        effect.deterministic_pops = false;
                        effect.pop_count = effect.pop_count.max(effect.height_difference + 1);
                    }
                }
                Some(Opcode::Ntuck | Opcode::Nrot) => {
                    if iter.last_was_push() {
                        effect.pop_count = effect
                            .pop_count
                            .max(effect.height_difference + iter.push_value());
                    } else {
                        effect.deterministic_pops = false;
                        effect.pop_count = effect.pop_count.max(effect.height_difference + 1);
                    }
                    effect.height_difference += 1;
                }
                _ => {
                    let instruction = InstructionEffect::of(iter.byte());
                    let (pops, pushes) = if iter.current_is_optional() {
                        (
                            iter.optional_pop_count() as i32,
                            iter.optional_push_count() as i32,
                        )
                    } else {
                        match (instruction.pops(), instruction.pushes()) {
                            (Effect::Known(pops), Effect::Known(pushes)) => (pops, pushes),
                            _ => {
                                // Unassigned byte; assume one value present.
                                effect.deterministic_pops = false;
                                effect.pop_count =
                                    effect.pop_count.max(effect.height_difference + 1);
                                iter.advance();
                                continue;
                            }
                        }
                    };
                    effect.height_difference += pops;
                    effect.pop_count = effect.pop_count.max(effect.height_difference);
                    effect.height_difference -= pushes;
                    effect.push_count = effect.push_count.max(-effect.height_difference);
                }
            }
            iter.advance();
        }

        effect
    }

    /// Whether every pop count in the block was statically known.
    pub const fn deterministic_pops(&self) -> bool {
        self.deterministic_pops
    }

    /// Maximum words popped below the entry stack pointer.
    pub const fn pop_count(&self) -> i32 {
        self.pop_count
    }

    /// Maximum words pushed beyond the entry stack pointer.
    pub const fn push_count(&self) -> i32 {
        self.push_count
    }

    /// Net stack-pointer movement in words; positive means the stack shrank.
    pub const fn height_difference(&self) -> i32 {
        self.height_difference
    }

    /// Whether the bounds check of `other` is redundant when `other` is
    /// entered from the end of this block.
    pub fn supersedes(&self, other: &BlockStackEffect) -> bool {
        other.pop_count() <= self.pop_count() - self.height_difference()
            && other.push_count() <= self.push_count() + self.height_difference()
    }
}
