//! Virtual models of which stack slots live in which ARM registers.
//!
//! A register file is scoped to the lowering of a single basic block: every
//! block starts and ends in *naive state*, with the top of stack in `r2`,
//! the stack pointer in `r1` matching memory, and no other slot cached.
//! Inside the block the file may run the stack pointer behind by a tracked
//! delta that is reconciled in bulk before any branch or helper call.

mod cow;
mod stack;

pub use cow::CowAllocator;
pub use stack::StackAllocator;

use thumb_asm::{Encoder, Register};

use crate::buffer::CodeBuffer;
use crate::consts::STACK_REGISTERS;
use crate::error::RegisterError;

/// Operations the code generator runs against a register file. Emitting
/// variants append to `buf` through `enc`; pure remapping variants touch
/// neither.
pub trait RegisterFile {
    /// Whether the file is in the canonical block-boundary configuration.
    fn in_naive_state(&self) -> bool;

    /// Loads stack slots from memory until the top `n` are in registers.
    /// Fails when `n` exceeds the slot count.
    fn ensure_registers_hold(
        &mut self,
        n: usize,
        buf: &mut CodeBuffer,
        enc: &mut Encoder,
    ) -> Result<(), RegisterError>;

    /// The register future writes to the top of stack should target. May
    /// redirect subsequent reads to that register.
    fn top_writeback_register(&mut self) -> Register;

    /// The register backing stack slot `n` for reads.
    fn read_register(&self, n: usize) -> Register;

    /// Removes the top slot from the mapping without emitting anything and
    /// returns the register that held it.
    fn pop(&mut self) -> Register;

    /// Adds a new top slot, spilling the oldest cached slot to memory when
    /// all registers are occupied, and returns its register.
    fn push(&mut self, buf: &mut CodeBuffer, enc: &mut Encoder) -> Register;

    /// Stores live slots back to memory, restores `r2` as the top of stack
    /// and the stack pointer to its canonical value.
    fn return_to_naive_state(
        &mut self,
        buf: &mut CodeBuffer,
        enc: &mut Encoder,
    ) -> Result<(), RegisterError>;

    /// Prepares the two top slots in distinct registers for a fused
    /// `cmp`/branch, popping them, and re-establishes the naive state for
    /// the remainder of the stack.
    fn return_to_comparison_state(
        &mut self,
        _buf: &mut CodeBuffer,
        _enc: &mut Encoder,
    ) -> Result<(), RegisterError> {
        Err(RegisterError::ComparisonUnsupported)
    }

    /// The operand registers prepared by
    /// [`RegisterFile::return_to_comparison_state`], comparison order.
    fn comparison_registers(&self) -> (Register, Register) {
        (Register::R0, Register::R0)
    }

    /// Duplicates the top of stack.
    fn dup(&mut self, buf: &mut CodeBuffer, enc: &mut Encoder) -> Result<(), RegisterError>;

    /// Drops the top of stack.
    fn drop_top(&mut self, buf: &mut CodeBuffer, enc: &mut Encoder) -> Result<(), RegisterError>;

    /// Rotates the third slot to the top.
    fn rot(&mut self, buf: &mut CodeBuffer, enc: &mut Encoder) -> Result<(), RegisterError>;

    /// Swaps the two top slots.
    fn swap(&mut self, buf: &mut CodeBuffer, enc: &mut Encoder) -> Result<(), RegisterError>;

    /// Tucks the top slot beneath the next two.
    fn tuck(&mut self, buf: &mut CodeBuffer, enc: &mut Encoder) -> Result<(), RegisterError>;

    /// Tucks the top slot to depth `n` without touching memory, when the
    /// file supports it for this `n`. Returns whether it was handled.
    fn ntuck(
        &mut self,
        _n: i32,
        _buf: &mut CodeBuffer,
        _enc: &mut Encoder,
    ) -> Result<bool, RegisterError> {
        Ok(false)
    }

    /// Whether `reg` holds a compile-time-known constant.
    fn register_value_is_known(&self, _reg: Register) -> bool {
        false
    }

    /// The known constant in `reg`; meaningless unless
    /// [`RegisterFile::register_value_is_known`] holds.
    fn known_register_value(&self, _reg: Register) -> i32 {
        0
    }

    /// Records that `reg` holds `value`, or materialises it immediately for
    /// files without constant tracking.
    fn set_known_register_value(
        &mut self,
        reg: Register,
        value: i32,
        buf: &mut CodeBuffer,
        enc: &mut Encoder,
    );

    /// Materialises the constant in `reg` now, if one is pending.
    fn commit_register(&mut self, reg: Register, buf: &mut CodeBuffer, enc: &mut Encoder);

    /// Materialises the constant backing stack slot `n` now, if one is
    /// pending.
    fn commit_stack_slot(&mut self, n: usize, buf: &mut CodeBuffer, enc: &mut Encoder);
}

pub(crate) fn too_many_values(requested: usize) -> RegisterError {
    RegisterError::TooManyValues {
        requested,
        available: STACK_REGISTERS.len(),
    }
}
