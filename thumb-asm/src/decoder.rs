//! Textual decoding of the encoder's output, used for diagnostics only.
//!
//! Instructions are recognised by matching prefix bit patterns in the same
//! lexical order as the encoding tables. Branch destinations are rendered as
//! absolute byte addresses computed from the instruction's own address
//! (`origin`); the no-argument entry points use an origin of -4 so that a
//! branch by zero prints address zero.

use crate::bits::{extract, unpack_twos};
use crate::{Condition, Instruction, Register};

const DEFAULT_ORIGIN: u32 = -4i32 as u32;

const ALU_NAMES: [&str; 16] = [
    "and", "eor", "lsl", "lsr", "asr", "adc", "sbc", "ror", "tst", "neg", "cmp", "cmn", "orr",
    "mul", "bic", "mvn",
];

fn reg(bits: u32) -> &'static str {
    Register::from_index(bits as u8).name()
}

fn register_list(list: u32) -> String {
    let mut out = String::new();
    for i in 0..8 {
        if list & (1 << i) != 0 {
            out.push_str(reg(i));
            if list > (1 << (i + 1)) - 1 {
                out.push_str(", ");
            }
        }
    }
    out
}

/// Whether `instruction` is the first half of a long `BL`/`BLX` pair.
pub fn is_long_call(instruction: Instruction) -> bool {
    extract(instruction as u32, 11, 5) == 0b11110
}

/// Renders a long-call pair as a single mnemonic with its absolute
/// destination; `origin` is the byte address of the first half.
pub fn decode_long_call(first: Instruction, second: Instruction, origin: u32) -> String {
    let offset = unpack_twos(
        extract(first as u32, 0, 11) << 11 | extract(second as u32, 0, 11),
        22,
    );
    let mnemonic = if extract(second as u32, 11, 2) == 0b01 {
        "blx"
    } else {
        "bl"
    };
    let target = origin
        .wrapping_add(4)
        .wrapping_add((offset * 2) as u32);
    format!("{mnemonic} {target:08x} /* by {offset} */")
}

/// Decodes one instruction with the default origin.
pub fn decode(instruction: Instruction) -> String {
    decode_with_origin(instruction, DEFAULT_ORIGIN)
}

/// Decodes one instruction; `origin` is the byte address the instruction
/// lives at, used for branch and PC-relative destinations.
pub fn decode_with_origin(instruction: Instruction, origin: u32) -> String {
    let i = instruction as u32;
    let op5 = extract(i, 11, 5);
    let op7 = extract(i, 9, 7);
    let op8 = extract(i, 8, 8);
    let op9 = extract(i, 7, 9);

    if op5 == 0b00000 || op5 == 0b00001 || op5 == 0b00010 {
        let name = ["lsl", "lsr", "asr"][op5 as usize];
        format!(
            "{name} {}, {}, #{}",
            reg(extract(i, 0, 3)),
            reg(extract(i, 3, 3)),
            extract(i, 6, 5)
        )
    } else if op7 == 0b0001100 {
        format!(
            "add {}, {}, {}",
            reg(extract(i, 0, 3)),
            reg(extract(i, 3, 3)),
            reg(extract(i, 6, 3))
        )
    } else if op7 == 0b0001101 {
        format!(
            "sub {}, {}, {}",
            reg(extract(i, 0, 3)),
            reg(extract(i, 3, 3)),
            reg(extract(i, 6, 3))
        )
    } else if op7 == 0b0001110 && extract(i, 6, 3) == 0 {
        format!("mov {}, {}", reg(extract(i, 0, 3)), reg(extract(i, 3, 3)))
    } else if op7 == 0b0001110 {
        format!(
            "add {}, {}, #{}",
            reg(extract(i, 0, 3)),
            reg(extract(i, 3, 3)),
            extract(i, 6, 3)
        )
    } else if op7 == 0b0001111 {
        format!(
            "sub {}, {}, #{}",
            reg(extract(i, 0, 3)),
            reg(extract(i, 3, 3)),
            extract(i, 6, 3)
        )
    } else if op5 == 0b00100 {
        format!("mov {}, #{}", reg(extract(i, 8, 3)), extract(i, 0, 8))
    } else if op5 == 0b00101 {
        format!("cmp {}, #{}", reg(extract(i, 8, 3)), extract(i, 0, 8))
    } else if op5 == 0b00110 {
        format!("add {}, #{}", reg(extract(i, 8, 3)), extract(i, 0, 8))
    } else if op5 == 0b00111 {
        format!("sub {}, #{}", reg(extract(i, 8, 3)), extract(i, 0, 8))
    } else if extract(i, 10, 6) == 0b010000 {
        let name = ALU_NAMES[extract(i, 6, 4) as usize];
        format!("{name} {}, {}", reg(extract(i, 0, 3)), reg(extract(i, 3, 3)))
    } else if op8 == 0b01000100 {
        let rd = extract(i, 7, 1) << 3 | extract(i, 0, 3);
        let rm = extract(i, 6, 1) << 3 | extract(i, 3, 3);
        format!("add {}, {}", reg(rd), reg(rm))
    } else if op8 == 0b01000101 {
        let rn = extract(i, 7, 1) << 3 | extract(i, 0, 3);
        let rm = extract(i, 6, 1) << 3 | extract(i, 3, 3);
        format!("cmp {}, {}", reg(rn), reg(rm))
    } else if op8 == 0b01000110 {
        let rd = extract(i, 7, 1) << 3 | extract(i, 0, 3);
        let rm = extract(i, 6, 1) << 3 | extract(i, 3, 3);
        format!("mov {}, {}", reg(rd), reg(rm))
    } else if op9 == 0b010001110 {
        let rm = extract(i, 3, 4);
        if Register::from_index(rm as u8) == Register::LR {
            "ret".to_string()
        } else {
            format!("bx {}", reg(rm))
        }
    } else if op9 == 0b010001111 {
        format!("blx {}", reg(extract(i, 3, 4)))
    } else if matches!(
        op7,
        0b0101000 | 0b0101001 | 0b0101010 | 0b0101011 | 0b0101100 | 0b0101101 | 0b0101110 | 0b0101111
    ) {
        let name = match op7 {
            0b0101000 => "str",
            0b0101001 => "strh",
            0b0101010 => "strb",
            0b0101011 => "ldrsb",
            0b0101100 => "ldr",
            0b0101101 => "ldrh",
            0b0101110 => "ldrb",
            _ => "ldrsh",
        };
        format!(
            "{name} {}, [{}, {}]",
            reg(extract(i, 0, 3)),
            reg(extract(i, 3, 3)),
            reg(extract(i, 6, 3))
        )
    } else if matches!(op5, 0b01100 | 0b01101 | 0b01110 | 0b01111 | 0b10000 | 0b10001) {
        let (name, scale) = match op5 {
            0b01100 => ("str", " * 4"),
            0b01101 => ("ldr", " * 4"),
            0b01110 => ("strb", ""),
            0b01111 => ("ldrb", ""),
            0b10000 => ("strh", " * 2"),
            _ => ("ldrh", " * 2"),
        };
        format!(
            "{name} {}, [{}, #{}{scale}]",
            reg(extract(i, 0, 3)),
            reg(extract(i, 3, 3)),
            extract(i, 6, 5)
        )
    } else if op5 == 0b10010 || op5 == 0b10011 {
        let name = if op5 == 0b10010 { "str" } else { "ldr" };
        format!(
            "{name} {}, [sp, #{} * 4]",
            reg(extract(i, 8, 3)),
            extract(i, 0, 8)
        )
    } else if op5 == 0b01001 {
        let imm = extract(i, 0, 8);
        let target = (origin.wrapping_add(4) & !3).wrapping_add(imm * 4);
        format!(
            "ldr {}, [pc, #{imm} * 4] /* {target:08x} */",
            reg(extract(i, 8, 3))
        )
    } else if op5 == 0b10100 {
        format!("add {}, pc, #{} * 4", reg(extract(i, 8, 3)), extract(i, 0, 8))
    } else if op5 == 0b10101 {
        format!("add {}, sp, #{} * 4", reg(extract(i, 8, 3)), extract(i, 0, 8))
    } else if op9 == 0b101100000 {
        format!("add sp, #{} * 4", extract(i, 0, 7))
    } else if op9 == 0b101100001 {
        format!("sub sp, #{} * 4", extract(i, 0, 7))
    } else if extract(i, 6, 10) == 0b1011001001 {
        format!("sxtb {}, {}", reg(extract(i, 0, 3)), reg(extract(i, 3, 3)))
    } else if extract(i, 6, 10) == 0b1011001000 {
        format!("sxth {}, {}", reg(extract(i, 0, 3)), reg(extract(i, 3, 3)))
    } else if op7 == 0b1011010 || op7 == 0b1011110 {
        let (name, extra) = if op7 == 0b1011010 {
            ("push", "lr")
        } else {
            ("pop", "pc")
        };
        let list = extract(i, 0, 8);
        let mut out = name.to_string();
        out.push(' ');
        if extract(i, 8, 1) == 1 {
            out.push_str(extra);
            if list != 0 {
                out.push_str(", ");
            }
        }
        out.push_str(&register_list(list));
        out
    } else if op5 == 0b11000 || op5 == 0b11001 {
        let name = if op5 == 0b11000 { "stmia" } else { "ldmia" };
        format!(
            "{name} {}!, {}",
            reg(extract(i, 8, 3)),
            register_list(extract(i, 0, 8))
        )
    } else if extract(i, 12, 4) == 0b1101 {
        match Condition::from_bits(extract(i, 8, 4)) {
            Some(c) => {
                let by = unpack_twos(extract(i, 0, 8), 8) * 2;
                let target = origin.wrapping_add(4).wrapping_add(by as u32);
                format!("b{} {target:08x} /* by {by} */", c.name())
            }
            None => format!("unknown (0x{instruction:04x})"),
        }
    } else if op5 == 0b11100 {
        let by = unpack_twos(extract(i, 0, 11), 11) * 2;
        let target = origin.wrapping_add(4).wrapping_add(by as u32);
        format!("b {target:08x} /* by {by} */")
    } else {
        format!("unknown (0x{instruction:04x})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Encoder, RegisterList};

    fn dec(instruction: Instruction) -> String {
        decode(instruction)
    }

    #[test]
    fn arithmetic_forms() {
        let mut e = Encoder::new();
        assert_eq!(dec(e.add_with_carry(Register::R0, Register::R1)), "adc r0, r1");
        assert_eq!(dec(e.add_small_imm(Register::R0, Register::R1, 7)), "add r0, r1, #7");
        assert_eq!(dec(e.add_large_imm(Register::R3, 42)), "add r3, #42");
        assert_eq!(
            dec(e.add_reg(Register::R0, Register::R2, Register::R7)),
            "add r0, r2, r7"
        );
        assert_eq!(dec(e.add_general(Register::R8, Register::PC)), "add r8, pc");
        assert_eq!(dec(e.and_bitwise(Register::R0, Register::R1)), "and r0, r1");
        assert_eq!(
            dec(e.arithmetic_shift_right_imm(Register::R0, Register::R1, 17)),
            "asr r0, r1, #17"
        );
        assert_eq!(
            dec(e.arithmetic_shift_right_register(Register::R0, Register::R1)),
            "asr r0, r1"
        );
        assert_eq!(dec(e.bit_clear(Register::R0, Register::R1)), "bic r0, r1");
        assert_eq!(dec(e.eor(Register::R0, Register::R1)), "eor r0, r1");
        assert_eq!(dec(e.mul(Register::R0, Register::R3)), "mul r0, r3");
        assert_eq!(dec(e.move_not(Register::R0, Register::R3)), "mvn r0, r3");
        assert_eq!(dec(e.neg(Register::R0, Register::R3)), "neg r0, r3");
        assert_eq!(dec(e.or_bitwise(Register::R0, Register::R3)), "orr r0, r3");
        assert_eq!(dec(e.ror(Register::R0, Register::R3)), "ror r0, r3");
        assert_eq!(dec(e.subtract_with_carry(Register::R0, Register::R3)), "sbc r0, r3");
        assert_eq!(dec(e.test_bits(Register::R0, Register::R1)), "tst r0, r1");
        assert_eq!(dec(e.compare_negative(Register::R0, Register::R1)), "cmn r0, r1");
        assert!(e.check());
    }

    #[test]
    fn branches() {
        let mut e = Encoder::new();
        assert_eq!(
            dec(e.conditional_branch(Condition::Eq, 0)),
            "beq 00000000 /* by 0 */"
        );
        assert_eq!(
            dec(e.conditional_branch(Condition::Ne, 1)),
            "bne 00000002 /* by 2 */"
        );
        assert_eq!(
            dec(e.conditional_branch(Condition::Vc, -1)),
            "bvc fffffffe /* by -2 */"
        );
        assert_eq!(
            dec(e.conditional_branch(Condition::Le, -7)),
            "ble fffffff2 /* by -14 */"
        );
        assert_eq!(dec(e.unconditional_branch(0)), "b 00000000 /* by 0 */");
        assert_eq!(dec(e.unconditional_branch(-1)), "b fffffffe /* by -2 */");
        assert_eq!(dec(e.unconditional_branch(10)), "b 00000014 /* by 20 */");
        assert!(e.check());
    }

    #[test]
    fn long_calls() {
        let mut e = Encoder::new();
        let pair = e.branch_and_link(0);
        assert!(is_long_call(pair.first));
        assert!(!is_long_call(pair.second));
        assert_eq!(
            decode_long_call(pair.first, pair.second, 0),
            "bl 00000004 /* by 0 */"
        );
        let pair = e.branch_and_link(-1);
        assert_eq!(
            decode_long_call(pair.first, pair.second, 0),
            "bl 00000002 /* by -1 */"
        );
        let pair = e.branch_link_and_exchange(42);
        assert_eq!(
            decode_long_call(pair.first, pair.second, 0),
            "blx 00000058 /* by 42 */"
        );
    }

    #[test]
    fn loads_and_stores() {
        let mut e = Encoder::new();
        assert_eq!(
            dec(e.load_word_with_offset(Register::R0, Register::R1, 5)),
            "ldr r0, [r1, #5 * 4]"
        );
        assert_eq!(
            dec(e.load_word_with_register_offset(Register::R0, Register::R0, Register::R1)),
            "ldr r0, [r0, r1]"
        );
        assert_eq!(
            dec(e.load_word_with_pc_offset(Register::R0, 4)),
            "ldr r0, [pc, #4 * 4] /* 00000010 */"
        );
        assert_eq!(
            dec(e.load_word_with_sp_offset(Register::R7, 42)),
            "ldr r7, [sp, #42 * 4]"
        );
        assert_eq!(
            dec(e.load_byte_with_offset(Register::R0, Register::R1, 8)),
            "ldrb r0, [r1, #8]"
        );
        assert_eq!(
            dec(e.load_half_word_with_offset(Register::R0, Register::R1, 31)),
            "ldrh r0, [r1, #31 * 2]"
        );
        assert_eq!(
            dec(e.load_signed_byte_with_register_offset(Register::R0, Register::R3, Register::R7)),
            "ldrsb r0, [r3, r7]"
        );
        assert_eq!(
            dec(e.load_signed_half_word_with_register_offset(
                Register::R0,
                Register::R3,
                Register::R7
            )),
            "ldrsh r0, [r3, r7]"
        );
        assert_eq!(
            dec(e.store_word_with_offset(Register::R0, Register::R3, 31)),
            "str r0, [r3, #31 * 4]"
        );
        assert_eq!(
            dec(e.store_word_with_sp_offset(Register::R0, 42)),
            "str r0, [sp, #42 * 4]"
        );
        assert_eq!(
            dec(e.store_byte_with_offset(Register::R0, Register::R3, 31)),
            "strb r0, [r3, #31]"
        );
        assert_eq!(
            dec(e.store_half_word_with_offset(Register::R0, Register::R3, 17)),
            "strh r0, [r3, #17 * 2]"
        );
        assert_eq!(
            dec(e.load_multiple_increment_after(
                Register::R0,
                RegisterList::R0 | RegisterList::R3 | RegisterList::R7
            )),
            "ldmia r0!, r0, r3, r7"
        );
        assert_eq!(
            dec(e.store_multiple_increment_after(
                Register::R0,
                RegisterList::R3 | RegisterList::R4 | RegisterList::R7
            )),
            "stmia r0!, r3, r4, r7"
        );
        assert!(e.check());
    }

    #[test]
    fn moves_shifts_stack() {
        let mut e = Encoder::new();
        assert_eq!(dec(e.move_immediate(Register::R0, 42)), "mov r0, #42");
        assert_eq!(dec(e.move_low_to_low(Register::R0, Register::R7)), "mov r0, r7");
        assert_eq!(dec(e.move_general(Register::R0, Register::LR)), "mov r0, lr");
        assert_eq!(
            dec(e.logical_shift_left_immediate(Register::R3, Register::R7, 27)),
            "lsl r3, r7, #27"
        );
        assert_eq!(
            dec(e.left_shift_logical_register(Register::R0, Register::R1)),
            "lsl r0, r1"
        );
        assert_eq!(
            dec(e.right_shift_logical_register(Register::R0, Register::R1)),
            "lsr r0, r1"
        );
        assert_eq!(dec(e.pop_multiple(true, RegisterList::empty())), "pop pc");
        assert_eq!(
            dec(e.pop_multiple(false, RegisterList::R0 | RegisterList::R3 | RegisterList::R7)),
            "pop r0, r3, r7"
        );
        assert_eq!(
            dec(e.pop_multiple(true, RegisterList::R0 | RegisterList::R3 | RegisterList::R7)),
            "pop pc, r0, r3, r7"
        );
        assert_eq!(dec(e.push_multiple(true, RegisterList::empty())), "push lr");
        assert_eq!(
            dec(e.push_multiple(true, RegisterList::R0 | RegisterList::R3 | RegisterList::R7)),
            "push lr, r0, r3, r7"
        );
        assert_eq!(dec(e.add_sp(16)), "add sp, #16 * 4");
        assert_eq!(dec(e.sub_sp(16)), "sub sp, #16 * 4");
        assert_eq!(dec(e.sign_extend_byte(Register::R0, Register::R3)), "sxtb r0, r3");
        assert_eq!(
            dec(e.sign_extend_half_word(Register::R0, Register::R3)),
            "sxth r0, r3"
        );
        assert_eq!(dec(e.compare_immediate(Register::R0, 42)), "cmp r0, #42");
        assert_eq!(
            dec(e.compare_low_registers(Register::R0, Register::R1)),
            "cmp r0, r1"
        );
        assert_eq!(
            dec(e.compare_registers_general(Register::R0, Register::PC)),
            "cmp r0, pc"
        );
        assert_eq!(
            dec(e.branch_link_exchange_to_register(Register::PC)),
            "blx pc"
        );
        assert_eq!(dec(e.branch_and_exchange(Register::PC)), "bx pc");
        assert_eq!(dec(e.branch_and_exchange(Register::LR)), "ret");
        assert_eq!(dec(e.nop()), "mov r8, r8");
        assert!(e.check());
    }
}
