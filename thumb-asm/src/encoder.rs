use crate::bits;
use crate::{Condition, Instruction, InstructionPair, Register, RegisterList};

bitflags::bitflags! {
    /// Sticky range-violation flags accumulated by an [`Encoder`] session.
    pub struct EncodingFlags: u8 {
        /// A high register was passed where only `r0`-`r7` is encodable.
        const INCORRECT_USE_OF_LOW_REGISTER = 0b001;
        /// A branch immediate fell outside the reachable range.
        const TOO_BIG_BRANCH_OFFSET = 0b010;
        /// An immediate did not fit its bit field.
        const TOO_BIG_IMMEDIATE = 0b100;
    }
}

/// Inversion of the six ordered/equality condition codes. The remaining
/// codes have no inverse here and yield `None` (the unused `0b1111`
/// pattern in the original encoding tables).
pub const fn invert_condition(c: Condition) -> Option<Condition> {
    Some(match c {
        Condition::Ge => Condition::Lt,
        Condition::Gt => Condition::Le,
        Condition::Le => Condition::Gt,
        Condition::Lt => Condition::Ge,
        Condition::Ne => Condition::Eq,
        Condition::Eq => Condition::Ne,
        _ => return None,
    })
}

/// Register-register ALU operations sharing the `010000` format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum AluOperation {
    Adc = 0b0101,
    And = 0b0000,
    Asr2 = 0b0100,
    Bic = 0b1110,
    Cmn = 0b1011,
    Cmp2 = 0b1010,
    Eor = 0b0001,
    Lsl2 = 0b0010,
    Lsr2 = 0b0011,
    Mul = 0b1101,
    Mvn = 0b1111,
    Neg = 0b1001,
    Orr = 0b1100,
    Ror = 0b0111,
    Sbc = 0b0110,
    Tst = 0b1000,
}

/// An encoding session.
///
/// Each method returns a finished 16-bit instruction word. Methods never
/// fail: arguments outside a form's encodable range set one of the sticky
/// [`EncodingFlags`], which the caller checks once per compilation attempt
/// and clears with [`Encoder::reset`]. This keeps the emitting loops free of
/// error plumbing while still surfacing every violation.
#[derive(Debug)]
pub struct Encoder {
    flags: EncodingFlags,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    /// A fresh session with all flags clear.
    pub fn new() -> Self {
        Self {
            flags: EncodingFlags::empty(),
        }
    }

    /// The flags accumulated so far.
    pub const fn flags(&self) -> EncodingFlags {
        self.flags
    }

    /// True while no violation has been recorded.
    pub const fn check(&self) -> bool {
        self.flags.is_empty()
    }

    /// Clears the accumulated flags.
    pub fn reset(&mut self) {
        self.flags = EncodingFlags::empty();
    }

    /// Records an immediate overflow detected by a caller that synthesises
    /// a field value outside the encoder (PC-relative literal offsets).
    pub fn record_immediate_overflow(&mut self) {
        self.flags |= EncodingFlags::TOO_BIG_IMMEDIATE;
    }

    fn assert_low_register(&mut self, r: Register) {
        if !r.is_low() {
            tracing::warn!(register = r.name(), "not a low register");
            self.flags |= EncodingFlags::INCORRECT_USE_OF_LOW_REGISTER;
        }
    }

    /// Masks `value` to its `max_bits` least significant bits and shifts it
    /// into place, flagging a too-big immediate when masking lost bits.
    fn shift(&mut self, value: u32, offset: u32, max_bits: u8) -> Instruction {
        let masked = value & ((1u64 << max_bits) - 1) as u32;
        if masked != value {
            tracing::warn!(value, max_bits, "shifted value too big for field");
            self.flags |= EncodingFlags::TOO_BIG_IMMEDIATE;
        }
        (masked << offset) as Instruction
    }

    fn shift_reg(&mut self, r: Register, offset: u32, max_bits: u8) -> Instruction {
        self.shift(r as u32, offset, max_bits)
    }

    /// All register-register ALU operations take the form `rd = rd OP rm`
    /// (some ignore `rd`); both registers must be low.
    fn arithmetic_operation(&mut self, rd: Register, rm: Register, op: AluOperation) -> Instruction {
        self.assert_low_register(rd);
        self.assert_low_register(rm);
        self.shift(0b010000, 10, 6)
            | self.shift(op as u32, 6, 4)
            | self.shift_reg(rm, 3, 3)
            | self.shift_reg(rd, 0, 3)
    }

    /// ADC A7-4. Adds two low registers and the carry flag. 1 cycle.
    pub fn add_with_carry(&mut self, rd: Register, rm: Register) -> Instruction {
        self.arithmetic_operation(rd, rm, AluOperation::Adc)
    }

    /// ADD (1) A7-5. `rd = rn + imm`, `0 <= imm < 8`, low registers only.
    pub fn add_small_imm(&mut self, rd: Register, rn: Register, imm: u8) -> Instruction {
        self.assert_low_register(rd);
        self.assert_low_register(rn);
        self.shift(0b0001110, 9, 7)
            | self.shift(imm as u32, 6, 3)
            | self.shift_reg(rn, 3, 3)
            | self.shift_reg(rd, 0, 3)
    }

    /// ADD (2) A7-6. Adds an eight-bit unsigned immediate to a low register.
    pub fn add_large_imm(&mut self, rd: Register, imm: u8) -> Instruction {
        self.assert_low_register(rd);
        self.shift(0b00110, 11, 5) | self.shift_reg(rd, 8, 3) | self.shift(imm as u32, 0, 8)
    }

    /// ADD (3) A7-7. `rd = rn + rm`, low registers only.
    pub fn add_reg(&mut self, rd: Register, rn: Register, rm: Register) -> Instruction {
        self.assert_low_register(rd);
        self.assert_low_register(rn);
        self.assert_low_register(rm);
        self.shift(0b0001100, 9, 7)
            | self.shift_reg(rm, 6, 3)
            | self.shift_reg(rn, 3, 3)
            | self.shift_reg(rd, 0, 3)
    }

    /// ADD (4) A7-8. `rd = rd + rm` where at least one register is high.
    /// 1 cycle, or 2 if `rd` is `pc`.
    pub fn add_general(&mut self, rd: Register, rm: Register) -> Instruction {
        self.shift(0b01000100, 8, 9)
            | self.shift(rd.high_bit(), 7, 1)
            | self.shift(rm.high_bit(), 6, 1)
            | self.shift(rm.low_bits(), 3, 3)
            | self.shift(rd.low_bits(), 0, 3)
    }

    /// ADD (5) A7-10. `rd = pc + imm * 4`.
    pub fn add_pc_relative_address(&mut self, rd: Register, imm: u8) -> Instruction {
        self.assert_low_register(rd);
        self.shift(0b10100, 11, 5) | self.shift_reg(rd, 8, 3) | self.shift(imm as u32, 0, 8)
    }

    /// ADD (6) A7-11. `rd = sp + imm * 4`.
    pub fn add_sp_relative_address(&mut self, rd: Register, imm: u8) -> Instruction {
        self.assert_low_register(rd);
        self.shift(0b10101, 11, 5) | self.shift_reg(rd, 8, 3) | self.shift(imm as u32, 0, 8)
    }

    /// ADD (7) A7-12. `sp = sp + imm7 * 4`.
    pub fn add_sp(&mut self, imm7: u8) -> Instruction {
        self.shift(0b101100000, 7, 9) | self.shift(imm7 as u32, 0, 7)
    }

    /// AND A7-14. `rd = rd & rm`, low registers only.
    pub fn and_bitwise(&mut self, rd: Register, rm: Register) -> Instruction {
        self.arithmetic_operation(rd, rm, AluOperation::And)
    }

    /// ASR (1) A7-15. `rd = rm >> imm` (arithmetic), low registers only.
    pub fn arithmetic_shift_right_imm(&mut self, rd: Register, rm: Register, imm: u8) -> Instruction {
        self.assert_low_register(rd);
        self.assert_low_register(rm);
        self.shift(0b00010, 11, 5)
            | self.shift(imm as u32, 6, 5)
            | self.shift_reg(rm, 3, 3)
            | self.shift_reg(rd, 0, 3)
    }

    /// ASR (2) A7-17. `rd = rd >> rs` (arithmetic).
    pub fn arithmetic_shift_right_register(&mut self, rd: Register, rs: Register) -> Instruction {
        self.arithmetic_operation(rd, rs, AluOperation::Asr2)
    }

    /// B (1) A7-19. Conditional branch by signed `imm` instructions when `c`
    /// holds. Reaches -128 to +127 instructions (-256 to +254 bytes); a
    /// larger offset flags `TOO_BIG_BRANCH_OFFSET`. 1 cycle not taken, 3
    /// taken.
    pub fn conditional_branch(&mut self, c: Condition, imm: i32) -> Instruction {
        if !bits::fits_twos(imm, 8) {
            tracing::warn!(imm, "conditional branch immediate out of range");
            self.flags |= EncodingFlags::TOO_BIG_BRANCH_OFFSET;
        }
        self.shift(0b1101, 12, 4) | self.shift(c as u32, 8, 4) | self.shift(bits::pack_twos(imm, 8), 0, 8)
    }

    /// B (1) with `imm` counted from the branch instruction itself rather
    /// than from the pipeline PC.
    pub fn conditional_branch_natural(&mut self, c: Condition, imm: i32) -> Instruction {
        self.conditional_branch(c, imm - 2)
    }

    /// B (2) A7-21. Unconditional branch by signed `imm` instructions.
    ///
    /// The offset is taken from the address of the branch + 4, divided by
    /// two — i.e. from the instruction after next. Branching to the next
    /// instruction is -1, to the branch itself -2. Reaches ±1024
    /// instructions. 3 cycles.
    pub fn unconditional_branch(&mut self, imm: i32) -> Instruction {
        if !bits::fits_twos(imm, 11) {
            tracing::warn!(imm, "unconditional branch immediate out of range");
            self.flags |= EncodingFlags::TOO_BIG_BRANCH_OFFSET;
        }
        self.shift(0b11100, 11, 5) | self.shift(bits::pack_twos(imm, 11), 0, 11)
    }

    /// B (2) with the offset counted from the branch instruction itself.
    pub fn unconditional_branch_natural(&mut self, imm: i32) -> Instruction {
        self.unconditional_branch(imm - 2)
    }

    /// BIC A7-23. `rd = rd & !rm`.
    pub fn bit_clear(&mut self, rd: Register, rm: Register) -> Instruction {
        self.arithmetic_operation(rd, rm, AluOperation::Bic)
    }

    fn bl_or_blx(&mut self, offset: i32, is_blx: bool) -> InstructionPair {
        if !bits::fits_twos(offset, 22) {
            tracing::warn!(offset, "long call offset out of range");
            self.flags |= EncodingFlags::TOO_BIG_BRANCH_OFFSET;
        }
        let twenty_two = bits::pack_twos(offset, 22);
        let first = self.shift(0b111, 13, 3)
            | self.shift(0b10, 11, 2)
            | self.shift(bits::extract(twenty_two, 11, 11), 0, 11);
        let second = self.shift(0b111, 13, 3)
            | self.shift(if is_blx { 0b01 } else { 0b11 }, 11, 2)
            | self.shift(bits::extract(twenty_two, 0, 11), 0, 11);
        InstructionPair { first, second }
    }

    /// BL (1) A7-26. Calls another Thumb subroutine `offset` instructions
    /// away, counted from the instruction address + 4. 4 cycles.
    pub fn branch_and_link(&mut self, offset: i32) -> InstructionPair {
        self.bl_or_blx(offset, false)
    }

    /// BL (1) with the offset counted from the first half itself.
    pub fn branch_and_link_natural(&mut self, offset: i32) -> InstructionPair {
        self.branch_and_link(offset - 2)
    }

    /// BLX (1) A7-26. Long call into ARM state; the hardware clears the low
    /// two bits of the target. 3 cycles.
    pub fn branch_link_and_exchange(&mut self, offset: i32) -> InstructionPair {
        self.bl_or_blx(offset, true)
    }

    /// BLX (2) A7-30. Branches with link to the address in `rm`.
    pub fn branch_link_exchange_to_register(&mut self, rm: Register) -> Instruction {
        self.shift(0b010001111, 7, 9) | self.shift_reg(rm, 3, 4) | self.shift(0, 0, 3)
    }

    /// BX A7-32. Branches between ARM and Thumb state.
    pub fn branch_and_exchange(&mut self, rm: Register) -> Instruction {
        self.shift(0b010001110, 7, 9) | self.shift_reg(rm, 3, 4)
    }

    /// CMN A7-34. Compares `rn` with the negation of `rm`.
    pub fn compare_negative(&mut self, rn: Register, rm: Register) -> Instruction {
        self.arithmetic_operation(rn, rm, AluOperation::Cmn)
    }

    /// CMP (1) A7-35. Compares a low register with an 8-bit immediate.
    pub fn compare_immediate(&mut self, rn: Register, imm: u8) -> Instruction {
        self.shift(0b00101, 11, 5) | self.shift_reg(rn, 8, 3) | self.shift(imm as u32, 0, 8)
    }

    /// CMP (2) A7-36. Compares two low registers.
    pub fn compare_low_registers(&mut self, rn: Register, rm: Register) -> Instruction {
        self.arithmetic_operation(rn, rm, AluOperation::Cmp2)
    }

    /// CMP (3) A7-37. Compares two registers, either of which may be high.
    pub fn compare_registers_general(&mut self, rn: Register, rm: Register) -> Instruction {
        self.shift(0b01000101, 8, 8)
            | self.shift(rn.high_bit(), 7, 1)
            | self.shift(rm.high_bit(), 6, 1)
            | self.shift(rm.low_bits(), 3, 3)
            | self.shift(rn.low_bits(), 0, 3)
    }

    /// EOR A7-43. `rd = rd ^ rm`.
    pub fn eor(&mut self, rd: Register, rm: Register) -> Instruction {
        self.arithmetic_operation(rd, rm, AluOperation::Eor)
    }

    /// LDMIA A7-44. Loads the registers in `regs` from consecutive words at
    /// `rn`, incrementing `rn` past them unless it is itself loaded.
    /// 1 + N cycles.
    pub fn load_multiple_increment_after(&mut self, rn: Register, regs: RegisterList) -> Instruction {
        self.assert_low_register(rn);
        self.shift(0b11001, 11, 5) | self.shift_reg(rn, 8, 3) | self.shift(regs.bits() as u32, 0, 8)
    }

    fn load_or_store_with_offset(
        &mut self,
        op: u32,
        rd: Register,
        rn: Register,
        offset: u8,
    ) -> Instruction {
        self.assert_low_register(rd);
        self.assert_low_register(rn);
        self.shift(op, 11, 5)
            | self.shift(offset as u32, 6, 5)
            | self.shift_reg(rn, 3, 3)
            | self.shift_reg(rd, 0, 3)
    }

    fn load_or_store_with_register_offset(
        &mut self,
        op: u32,
        rd: Register,
        rn: Register,
        rm: Register,
    ) -> Instruction {
        self.assert_low_register(rd);
        self.assert_low_register(rn);
        self.assert_low_register(rm);
        self.shift(op, 9, 7)
            | self.shift_reg(rm, 6, 3)
            | self.shift_reg(rn, 3, 3)
            | self.shift_reg(rd, 0, 3)
    }

    /// LDR (1) A7-47. Loads a word from `rn + offset * 4`. 2 cycles.
    pub fn load_word_with_offset(&mut self, rd: Register, rn: Register, offset: u8) -> Instruction {
        self.load_or_store_with_offset(0b01101, rd, rn, offset)
    }

    /// LDR (2) A7-49. Loads a word from `rn + rm`.
    pub fn load_word_with_register_offset(
        &mut self,
        rd: Register,
        rn: Register,
        rm: Register,
    ) -> Instruction {
        self.load_or_store_with_register_offset(0b0101100, rd, rn, rm)
    }

    /// LDR (3) A7-51. Loads a word from `align(pc, 4) + offset * 4`.
    pub fn load_word_with_pc_offset(&mut self, rd: Register, offset: u8) -> Instruction {
        self.assert_low_register(rd);
        self.shift(0b01001, 11, 5) | self.shift_reg(rd, 8, 3) | self.shift(offset as u32, 0, 8)
    }

    /// LDR (4) A7-53. Loads a word from `sp + offset * 4`.
    pub fn load_word_with_sp_offset(&mut self, rd: Register, offset: u8) -> Instruction {
        self.assert_low_register(rd);
        self.shift(0b10011, 11, 5) | self.shift_reg(rd, 8, 3) | self.shift(offset as u32, 0, 8)
    }

    /// LDRB (1) A7-55. Loads and zero-extends a byte.
    pub fn load_byte_with_offset(&mut self, rd: Register, rn: Register, offset: u8) -> Instruction {
        self.load_or_store_with_offset(0b01111, rd, rn, offset)
    }

    /// LDRB (2) A7-56.
    pub fn load_byte_with_register_offset(
        &mut self,
        rd: Register,
        rn: Register,
        rm: Register,
    ) -> Instruction {
        self.load_or_store_with_register_offset(0b0101110, rd, rn, rm)
    }

    /// LDRH (1) A7-57. Loads and zero-extends a half word from
    /// `rn + offset * 2`.
    pub fn load_half_word_with_offset(&mut self, rd: Register, rn: Register, offset: u8) -> Instruction {
        self.load_or_store_with_offset(0b10001, rd, rn, offset)
    }

    /// LDRH (2) A7-59.
    pub fn load_half_word_with_register_offset(
        &mut self,
        rd: Register,
        rn: Register,
        rm: Register,
    ) -> Instruction {
        self.load_or_store_with_register_offset(0b0101101, rd, rn, rm)
    }

    /// LDRSB A7-61. Loads and sign-extends a byte.
    pub fn load_signed_byte_with_register_offset(
        &mut self,
        rd: Register,
        rn: Register,
        rm: Register,
    ) -> Instruction {
        self.load_or_store_with_register_offset(0b0101011, rd, rn, rm)
    }

    /// LDRSH A7-62. Loads and sign-extends a half word.
    pub fn load_signed_half_word_with_register_offset(
        &mut self,
        rd: Register,
        rn: Register,
        rm: Register,
    ) -> Instruction {
        self.load_or_store_with_register_offset(0b0101111, rd, rn, rm)
    }

    /// LSL (1) A7-64. `rd = rm << imm`, `0 <= imm < 32`.
    pub fn logical_shift_left_immediate(&mut self, rd: Register, rm: Register, imm: u8) -> Instruction {
        self.assert_low_register(rd);
        self.assert_low_register(rm);
        self.shift(0b00000, 11, 5)
            | self.shift(imm as u32, 6, 5)
            | self.shift_reg(rm, 3, 3)
            | self.shift_reg(rd, 0, 3)
    }

    /// LSR (1) A7-68. `rd = rm >> imm` (logical).
    pub fn logical_shift_right_immediate(&mut self, rd: Register, rm: Register, imm: u8) -> Instruction {
        self.assert_low_register(rd);
        self.assert_low_register(rm);
        self.shift(0b00001, 11, 5)
            | self.shift(imm as u32, 6, 5)
            | self.shift_reg(rm, 3, 3)
            | self.shift_reg(rd, 0, 3)
    }

    /// LSL (2) A7-66. `rd = rd << rs`.
    pub fn left_shift_logical_register(&mut self, rd: Register, rs: Register) -> Instruction {
        self.arithmetic_operation(rd, rs, AluOperation::Lsl2)
    }

    /// LSR (2) A7-70. `rd = rd >> rs` (logical).
    pub fn right_shift_logical_register(&mut self, rd: Register, rs: Register) -> Instruction {
        self.arithmetic_operation(rd, rs, AluOperation::Lsr2)
    }

    /// MOV (1) A7-72. Moves an unsigned 8-bit immediate into `rd`.
    pub fn move_immediate(&mut self, rd: Register, x: u8) -> Instruction {
        self.assert_low_register(rd);
        self.shift(0b00100, 11, 5) | self.shift_reg(rd, 8, 3) | self.shift(x as u32, 0, 8)
    }

    /// MOV (2) A7-73. `rd = rn` between low registers, updating flags.
    pub fn move_low_to_low(&mut self, rd: Register, rn: Register) -> Instruction {
        self.assert_low_register(rd);
        self.assert_low_register(rn);
        self.shift(0b0001110, 9, 7)
            | self.shift(0b000, 6, 3)
            | self.shift_reg(rn, 3, 3)
            | self.shift_reg(rd, 0, 3)
    }

    /// MOV (3) A7-75. Moves between any two registers without touching the
    /// flags. 1 cycle, or 2 if `rd` is `pc`.
    pub fn move_general(&mut self, rd: Register, rm: Register) -> Instruction {
        self.shift(0b01000110, 8, 8)
            | self.shift(rd.high_bit(), 7, 1)
            | self.shift(rm.high_bit(), 6, 1)
            | self.shift(rm.low_bits(), 3, 3)
            | self.shift(rd.low_bits(), 0, 3)
    }

    /// MUL A7-77. `rd = rd * rm`. Single cycle on cores with the fast
    /// multiplier; the Cortex-M0+ may ship either variant.
    pub fn mul(&mut self, rd: Register, rm: Register) -> Instruction {
        self.arithmetic_operation(rd, rm, AluOperation::Mul)
    }

    /// MVN A7-79. `rd = !rm`.
    pub fn move_not(&mut self, rd: Register, rm: Register) -> Instruction {
        self.arithmetic_operation(rd, rm, AluOperation::Mvn)
    }

    /// NEG A7-80. `rd = 0 - rm`.
    pub fn neg(&mut self, rd: Register, rm: Register) -> Instruction {
        self.arithmetic_operation(rd, rm, AluOperation::Neg)
    }

    /// ORR A7-81. `rd = rd | rm`.
    pub fn or_bitwise(&mut self, rd: Register, rm: Register) -> Instruction {
        self.arithmetic_operation(rd, rm, AluOperation::Orr)
    }

    /// POP A7-82. Pops the registers in `regs`, and `pc` when requested —
    /// in which case a branch occurs. 1 + N cycles, or 3 + N with `pc`.
    pub fn pop_multiple(&mut self, pc: bool, regs: RegisterList) -> Instruction {
        self.shift(0b1011110, 9, 7)
            | self.shift(pc as u32, 8, 1)
            | self.shift(regs.bits() as u32, 0, 8)
    }

    /// PUSH A7-85. Pushes the registers in `regs`, and `lr` when requested.
    /// 1 + N cycles.
    pub fn push_multiple(&mut self, lr: bool, regs: RegisterList) -> Instruction {
        self.shift(0b1011010, 9, 7)
            | self.shift(lr as u32, 8, 1)
            | self.shift(regs.bits() as u32, 0, 8)
    }

    /// ROR A7-92. `rd = rd` rotated right by `rs`.
    pub fn ror(&mut self, rd: Register, rs: Register) -> Instruction {
        self.arithmetic_operation(rd, rs, AluOperation::Ror)
    }

    /// SBC A7-94. `rd = rd - rm - !C`.
    pub fn subtract_with_carry(&mut self, rd: Register, rm: Register) -> Instruction {
        self.arithmetic_operation(rd, rm, AluOperation::Sbc)
    }

    /// STMIA A7-96. Stores the registers in `regs` from the address in `rn`,
    /// incrementing `rn` past them. 1 + N cycles.
    pub fn store_multiple_increment_after(&mut self, rn: Register, regs: RegisterList) -> Instruction {
        self.shift(0b11000, 11, 5) | self.shift_reg(rn, 8, 3) | self.shift(regs.bits() as u32, 0, 8)
    }

    /// STR (1) A7-99. Stores a word at `rn + imm * 4`. 2 cycles.
    pub fn store_word_with_offset(&mut self, rd: Register, rn: Register, imm: u8) -> Instruction {
        self.load_or_store_with_offset(0b01100, rd, rn, imm)
    }

    /// STR (2) A7-101.
    pub fn store_word_with_register_offset(
        &mut self,
        rd: Register,
        rn: Register,
        rm: Register,
    ) -> Instruction {
        self.load_or_store_with_register_offset(0b0101000, rd, rn, rm)
    }

    /// STR (3) A7-103. Stores a word at `sp + imm * 4`.
    pub fn store_word_with_sp_offset(&mut self, rd: Register, imm: u8) -> Instruction {
        self.assert_low_register(rd);
        self.shift(0b10010, 11, 5) | self.shift_reg(rd, 8, 3) | self.shift(imm as u32, 0, 8)
    }

    /// STRB (1) A7-105.
    pub fn store_byte_with_offset(&mut self, rd: Register, rn: Register, imm: u8) -> Instruction {
        self.load_or_store_with_offset(0b01110, rd, rn, imm)
    }

    /// STRB (2) A7-107.
    pub fn store_byte_with_register_offset(
        &mut self,
        rd: Register,
        rn: Register,
        rm: Register,
    ) -> Instruction {
        self.load_or_store_with_register_offset(0b0101010, rd, rn, rm)
    }

    /// STRH (1) A7-109. Stores a half word at `rn + imm * 2`.
    pub fn store_half_word_with_offset(&mut self, rd: Register, rn: Register, imm: u8) -> Instruction {
        self.load_or_store_with_offset(0b10000, rd, rn, imm)
    }

    /// STRH (2) A7-111.
    pub fn store_half_word_with_register_offset(
        &mut self,
        rd: Register,
        rn: Register,
        rm: Register,
    ) -> Instruction {
        self.load_or_store_with_register_offset(0b0101001, rd, rn, rm)
    }

    /// SUB (1) A7-113. `rd = rn - imm`, `0 <= imm < 8`.
    pub fn sub_small_imm(&mut self, rd: Register, rn: Register, imm: u8) -> Instruction {
        self.assert_low_register(rd);
        self.assert_low_register(rn);
        self.shift(0b0001111, 9, 7)
            | self.shift(imm as u32, 6, 3)
            | self.shift_reg(rn, 3, 3)
            | self.shift_reg(rd, 0, 3)
    }

    /// SUB (2) A7-114. Subtracts an eight-bit unsigned immediate.
    pub fn sub_large_imm(&mut self, rd: Register, imm: u8) -> Instruction {
        self.assert_low_register(rd);
        self.shift(0b00111, 11, 5) | self.shift_reg(rd, 8, 3) | self.shift(imm as u32, 0, 8)
    }

    /// SUB (3) A7-115. `rd = rn - rm`, low registers only.
    pub fn sub_reg(&mut self, rd: Register, rn: Register, rm: Register) -> Instruction {
        self.assert_low_register(rd);
        self.assert_low_register(rn);
        self.assert_low_register(rm);
        self.shift(0b0001101, 9, 7)
            | self.shift_reg(rm, 6, 3)
            | self.shift_reg(rn, 3, 3)
            | self.shift_reg(rd, 0, 3)
    }

    /// SUB (4) A7-116. Decrements `sp` by four times a 7-bit immediate.
    pub fn sub_sp(&mut self, imm: u8) -> Instruction {
        self.shift(0b101100001, 7, 9) | self.shift(imm as u32, 0, 7)
    }

    /// SXTB A7-120. Sign-extends the low byte of `rm` into `rd`.
    pub fn sign_extend_byte(&mut self, rd: Register, rm: Register) -> Instruction {
        self.assert_low_register(rd);
        self.assert_low_register(rm);
        self.shift(0b1011001001, 6, 10) | self.shift_reg(rm, 3, 3) | self.shift_reg(rd, 0, 3)
    }

    /// SXTH A7-121. Sign-extends the low half word of `rm` into `rd`.
    pub fn sign_extend_half_word(&mut self, rd: Register, rm: Register) -> Instruction {
        self.assert_low_register(rd);
        self.assert_low_register(rm);
        self.shift(0b1011001000, 6, 10) | self.shift_reg(rm, 3, 3) | self.shift_reg(rd, 0, 3)
    }

    /// TST A7-122. Updates the flags for `rn & rm` without writing back.
    pub fn test_bits(&mut self, rn: Register, rm: Register) -> Instruction {
        self.arithmetic_operation(rn, rm, AluOperation::Tst)
    }

    /// Pseudo-instruction, equivalent to `mov r8, r8`.
    pub fn nop(&mut self) -> Instruction {
        self.move_general(Register::R8, Register::R8)
    }

    /// Returns from a procedure; equivalent to `bx lr`.
    pub fn ret(&mut self) -> Instruction {
        self.branch_and_exchange(Register::LR)
    }
}
