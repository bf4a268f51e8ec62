//! Emission helpers shared by the compiler, the bounds check, and the
//! register files.

use thumb_asm::{bits, Encoder, Register};

use crate::buffer::CodeBuffer;
use crate::consts::{layout, STACK_POINTER_REGISTER, STATE_REGISTER, TEMP_REGISTER};
use crate::consts::{STACK_BASE_REGISTER, STACK_END_REGISTER, STACK_TOP_REGISTER};

/// Loads an arbitrary 32-bit constant into `destination` by building it a
/// byte at a time through shifted adds, negating at the end for negative
/// values. Costs one instruction for small values and up to eight for the
/// general case.
pub(crate) fn load_constant(buf: &mut CodeBuffer, enc: &mut Encoder, value: i32, destination: Register) {
    let is_negative = value < 0;
    let abs = value.unsigned_abs();

    let mut first = true;
    for b in (0..4u8).rev() {
        let byte = bits::extract(abs, 8 * b, 8);
        if byte > 0 || (byte == 0 && b == 0) {
            if first {
                buf.push(enc.move_immediate(destination, byte as u8));
                first = false;
            } else if byte > 0 {
                buf.push(enc.add_large_imm(destination, byte as u8));
            }
            if b != 0 {
                buf.push(enc.logical_shift_left_immediate(destination, destination, 8));
            }
        } else if !first && b != 0 {
            buf.push(enc.logical_shift_left_immediate(destination, destination, 8));
        }
    }

    if is_negative {
        buf.push(enc.neg(destination, destination));
    }
}

/// Pops the value below the top of stack into the scratch register.
pub(crate) fn pop_next_to_temp(buf: &mut CodeBuffer, enc: &mut Encoder) {
    buf.push(enc.add_small_imm(STACK_POINTER_REGISTER, STACK_POINTER_REGISTER, 4));
    buf.push(enc.load_word_with_offset(TEMP_REGISTER, STACK_POINTER_REGISTER, 0));
}

/// Calls a helper routine through a PC-relative literal load and `blx`.
///
/// The literal holding `address` is placed immediately after the sequence
/// and skipped by an unconditional branch; a `nop` keeps it word aligned
/// when needed. With `restore_invariant` the stack pointer and top of stack
/// are reloaded from the state record after the call, re-establishing the
/// naive state the helper may have changed.
pub(crate) fn c_function_call(
    buf: &mut CodeBuffer,
    enc: &mut Encoder,
    address: u32,
    restore_invariant: bool,
) {
    // The buffer base is word aligned, so index parity decides alignment.
    let start_was_aligned = buf.len() % 2 == 0;
    let offset = 1 + restore_invariant as u8;

    // The PC reads two instructions ahead, so this lands on the literal.
    buf.push(enc.load_word_with_pc_offset(TEMP_REGISTER, offset));
    buf.push(enc.branch_link_exchange_to_register(TEMP_REGISTER));

    if restore_invariant {
        buf.push(enc.load_word_with_offset(
            STACK_POINTER_REGISTER,
            STATE_REGISTER,
            (layout::STACK_POINTER / 4) as u8,
        ));
        buf.push(enc.load_word_with_offset(STACK_TOP_REGISTER, STACK_POINTER_REGISTER, 0));
    }

    if start_was_aligned {
        buf.push(enc.unconditional_branch(2));
        buf.push(enc.nop());
    } else {
        buf.push(enc.unconditional_branch(1));
    }

    buf.push_data(address as i32);
}

/// Writes the cached top of stack and stack pointer back to memory, unless
/// the stack pointer is outside its bounds (in which case the error
/// handlers are already on their way and the top slot must not be
/// clobbered).
pub(crate) fn write_state_to_memory(buf: &mut CodeBuffer, enc: &mut Encoder) {
    use thumb_asm::Condition;

    buf.push(enc.compare_registers_general(STACK_END_REGISTER, STACK_POINTER_REGISTER));
    // end <= sp means the stack is empty or underflowed.
    buf.push(enc.conditional_branch(Condition::Le, 2));

    buf.push(enc.compare_registers_general(STACK_BASE_REGISTER, STACK_POINTER_REGISTER));
    // base > sp means the stack overflowed.
    buf.push(enc.conditional_branch(Condition::Gt, 0));
    buf.push(enc.store_word_with_offset(STACK_TOP_REGISTER, STACK_POINTER_REGISTER, 0));

    buf.push(enc.store_word_with_offset(
        STACK_POINTER_REGISTER,
        STATE_REGISTER,
        (layout::STACK_POINTER / 4) as u8,
    ));
}

/// A deferred PC-relative constant load: a `nop` is reserved where the load
/// will go and the literal is appended to the function's trailing pool once
/// its position is known.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PcRelativeLoad {
    instruction_offset: usize,
    value: i32,
    destination: Register,
}

impl PcRelativeLoad {
    /// Reserves the load's slot with a `nop`.
    pub fn new(buf: &mut CodeBuffer, enc: &mut Encoder, value: i32, destination: Register) -> Self {
        let instruction_offset = buf.len();
        buf.push(enc.nop());
        Self {
            instruction_offset,
            value,
            destination,
        }
    }

    /// Appends the literal and patches the reserved slot into a real load.
    /// The caller aligns the pool to an even index first.
    pub fn insert_data(&self, buf: &mut CodeBuffer, enc: &mut Encoder) {
        let data_index = buf.len();
        buf.push_data(self.value);

        // Word-aligned pipeline PC, in index units over the word-aligned
        // buffer base.
        let aligned_pc = (self.instruction_offset + 2) & !1;
        let offset_words = match data_index.checked_sub(aligned_pc) {
            Some(delta) if delta / 2 <= 0xff => delta / 2,
            _ => {
                tracing::warn!(
                    at = self.instruction_offset,
                    data_index,
                    "literal pool out of reach"
                );
                enc.record_immediate_overflow();
                0
            }
        };
        let load = enc.load_word_with_pc_offset(self.destination, offset_words as u8);
        buf.set(self.instruction_offset, load);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thumb_asm::decode;

    fn emit(value: i32) -> (CodeBuffer, Encoder) {
        let mut buf = CodeBuffer::new();
        let mut enc = Encoder::new();
        load_constant(&mut buf, &mut enc, value, Register::R2);
        (buf, enc)
    }

    #[test]
    fn small_constants_are_one_move() {
        let (buf, enc) = emit(42);
        assert!(enc.check());
        assert_eq!(buf.len(), 1);
        assert_eq!(decode(buf.word(0)), "mov r2, #42");
    }

    #[test]
    fn zero_is_a_single_move() {
        let (buf, enc) = emit(0);
        assert!(enc.check());
        assert_eq!(buf.len(), 1);
        assert_eq!(decode(buf.word(0)), "mov r2, #0");
    }

    #[test]
    fn wide_constants_build_through_shifts() {
        let (buf, enc) = emit(0x1234);
        assert!(enc.check());
        assert_eq!(decode(buf.word(0)), "mov r2, #18"); // 0x12
        assert_eq!(decode(buf.word(1)), "lsl r2, r2, #8");
        assert_eq!(decode(buf.word(2)), "add r2, #52"); // 0x34
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn negative_constants_end_with_a_negate() {
        let (buf, enc) = emit(-42);
        assert!(enc.check());
        assert_eq!(decode(buf.word(0)), "mov r2, #42");
        assert_eq!(decode(buf.word(1)), "neg r2, r2");
    }

    #[test]
    fn interior_zero_bytes_still_shift() {
        let (buf, enc) = emit(0x0100_0001);
        assert!(enc.check());
        // mov #1; lsl; lsl; lsl; add #1 with an empty middle byte folded
        // into the shifts.
        assert_eq!(decode(buf.word(0)), "mov r2, #1");
        assert_eq!(decode(buf.word(buf.len() - 1)), "add r2, #1");
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn helper_call_embeds_the_address_behind_a_branch() {
        let mut buf = CodeBuffer::new();
        let mut enc = Encoder::new();
        c_function_call(&mut buf, &mut enc, 0x2000_1234, true);
        assert!(enc.check());

        // ldr r3, [pc, ...]; blx r3; two reloads; skip; literal.
        assert!(decode(buf.word(0)).starts_with("ldr r3, [pc"));
        assert_eq!(decode(buf.word(1)), "blx r3");
        assert!(decode(buf.word(2)).starts_with("ldr r1, [r0"));
        assert_eq!(decode(buf.word(3)), "ldr r2, [r1, #0 * 4]");

        // The last two words are the literal, low half first.
        assert_eq!(buf.word(buf.len() - 2), 0x1234);
        assert_eq!(buf.word(buf.len() - 1), 0x2000);
    }

    #[test]
    fn pc_relative_load_patches_its_slot() {
        let mut buf = CodeBuffer::new();
        let mut enc = Encoder::new();
        buf.push(enc.nop());
        let load = PcRelativeLoad::new(&mut buf, &mut enc, 0x0102_0304, Register::R4);
        load.insert_data(&mut buf, &mut enc);
        assert!(enc.check());

        assert_eq!(decode(buf.word(1)), "ldr r4, [pc, #0 * 4] /* 00000000 */");
        assert_eq!(buf.word(2), 0x0304);
        assert_eq!(buf.word(3), 0x0102);
    }
}
