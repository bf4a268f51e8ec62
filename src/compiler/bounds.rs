//! The per-block stack bounds check.

use stack_asm::BlockStackEffect;
use thumb_asm::{Encoder, Register};

use crate::buffer::CodeBuffer;
use crate::codegen;
use crate::compiler::StackCheckMode;
use crate::consts::{
    STACK_BASE_REGISTER, STACK_END_REGISTER, STACK_POINTER_REGISTER, TEMP_REGISTER,
    TEMP_REGISTER_3,
};
use crate::linker::Linker;

/// Emits the compare-and-branch bracket verifying a block's projected
/// stack extremes against the cached `stack_base`/`stack_end` registers.
///
/// When the combined reach fits an 8-bit immediate the stack pointer itself
/// is walked to the extremes and restored afterwards; otherwise the
/// candidate addresses are computed in the scratch register. The check
/// leaves its own PC in `r5` so the error stubs can record where the
/// violation was detected. Cost is 6 to 15 instructions depending on the
/// immediates, which is why superseded checks are worth eliding.
pub(crate) struct BoundsCheck;

impl BoundsCheck {
    pub fn emit(
        effect: BlockStackEffect,
        buf: &mut CodeBuffer,
        enc: &mut Encoder,
        linker: &mut Linker,
        mode: StackCheckMode,
    ) {
        if mode == StackCheckMode::None {
            return;
        }

        let pop_count = effect.pop_count();
        let push_count = effect.push_count();
        if pop_count == 0 && push_count == 0 {
            return;
        }

        buf.push(enc.move_general(TEMP_REGISTER_3, Register::PC));

        let can_adjust_in_place = pop_count * 4 + push_count * 4 < 256;
        let mut adjustment = 0;

        if pop_count != 0 {
            let compared = if can_adjust_in_place {
                buf.push(enc.add_large_imm(STACK_POINTER_REGISTER, (pop_count * 4) as u8));
                adjustment += pop_count * 4;
                STACK_POINTER_REGISTER
            } else if pop_count * 4 < 8 {
                buf.push(enc.add_small_imm(
                    TEMP_REGISTER,
                    STACK_POINTER_REGISTER,
                    (pop_count * 4) as u8,
                ));
                TEMP_REGISTER
            } else {
                codegen::load_constant(buf, enc, pop_count * 4, TEMP_REGISTER);
                buf.push(enc.add_reg(TEMP_REGISTER, STACK_POINTER_REGISTER, TEMP_REGISTER));
                TEMP_REGISTER
            };
            buf.push(enc.compare_registers_general(compared, STACK_END_REGISTER));
            linker.add_underflow_check(buf, enc);
        }

        if push_count != 0 {
            let compared = if can_adjust_in_place {
                buf.push(enc.sub_large_imm(
                    STACK_POINTER_REGISTER,
                    ((pop_count + push_count) * 4) as u8,
                ));
                adjustment -= (pop_count + push_count) * 4;
                STACK_POINTER_REGISTER
            } else if push_count * 4 < 8 {
                buf.push(enc.sub_small_imm(
                    TEMP_REGISTER,
                    STACK_POINTER_REGISTER,
                    (push_count * 4) as u8,
                ));
                TEMP_REGISTER
            } else {
                codegen::load_constant(buf, enc, push_count * 4, TEMP_REGISTER);
                buf.push(enc.sub_reg(TEMP_REGISTER, STACK_POINTER_REGISTER, TEMP_REGISTER));
                TEMP_REGISTER
            };
            buf.push(enc.compare_registers_general(compared, STACK_BASE_REGISTER));
            linker.add_overflow_check(buf, enc);
        }

        if adjustment > 0 {
            buf.push(enc.sub_large_imm(STACK_POINTER_REGISTER, adjustment as u8));
        } else if adjustment < 0 {
            buf.push(enc.add_large_imm(STACK_POINTER_REGISTER, (-adjustment) as u8));
        }
    }

    /// How many instructions [`BoundsCheck::emit`] would produce for
    /// `effect`; used to size the supersession skip at branch destinations.
    pub fn instruction_count(effect: BlockStackEffect, mode: StackCheckMode) -> usize {
        let mut buf = CodeBuffer::new();
        let mut enc = Encoder::new();
        let mut linker = Linker::new();
        Self::emit(effect, &mut buf, &mut enc, &mut linker, mode);
        buf.len()
    }
}
