use thumb_asm::{Encoder, Register};

use crate::buffer::CodeBuffer;
use crate::codegen;
use crate::consts::{STACK_POINTER_REGISTER, STACK_REGISTERS, STACK_TOP_REGISTER};
use crate::error::RegisterError;
use crate::regfile::{too_many_values, RegisterFile};

const REGISTER_COUNT: usize = 16;

/// Copy-on-write register allocator.
///
/// Each stack slot has separate *read* and *write* registers, and each
/// register may carry a compile-time-known constant:
///
///  - pure stack shuffles (`swap`, `rot`, `tuck`) only remap the tables;
///  - `dup` points the new slot's reads at the source register, so no move
///    is emitted until one of the copies is written;
///  - arithmetic over two known constants folds at compile time, and the
///    result is not materialised until a write to memory or a register
///    operand forces it.
#[derive(Debug)]
pub struct CowAllocator {
    register_in_use: [bool; REGISTER_COUNT],
    read_for_offset: [Register; STACK_REGISTERS.len()],
    write_for_offset: [Register; STACK_REGISTERS.len()],
    top_offset_from_sp: i32,
    holding: usize,
    comparison: (Register, Register),
    value_known: [bool; REGISTER_COUNT],
    values: [i32; REGISTER_COUNT],
    write_elimination: bool,
}

impl CowAllocator {
    /// A file in naive state with register-write elimination enabled.
    pub fn new() -> Self {
        Self::with_write_elimination(true)
    }

    /// A file in naive state; without write elimination every constant is
    /// materialised the moment it is assigned.
    pub fn with_write_elimination(write_elimination: bool) -> Self {
        let mut file = Self {
            register_in_use: [false; REGISTER_COUNT],
            read_for_offset: [STACK_TOP_REGISTER; STACK_REGISTERS.len()],
            write_for_offset: [STACK_TOP_REGISTER; STACK_REGISTERS.len()],
            top_offset_from_sp: 0,
            holding: 1,
            comparison: (Register::R0, Register::R0),
            value_known: [false; REGISTER_COUNT],
            values: [0; REGISTER_COUNT],
            write_elimination,
        };
        for slot in 1..STACK_REGISTERS.len() {
            file.read_for_offset[slot] = Register::R0;
            file.write_for_offset[slot] = Register::R0;
        }
        file.redetermine_registers_in_use();
        file
    }

    /// Garbage-collects the register tables. A register with readers but no
    /// writer gets one of its readers' writers redirected onto it, so that
    /// spilling a slot can never strand a value other slots still read.
    fn redetermine_registers_in_use(&mut self) {
        let mut has_reader = [false; REGISTER_COUNT];
        let mut has_writer = [false; REGISTER_COUNT];

        for slot in 0..self.holding {
            has_reader[self.read_for_offset[slot] as usize] = true;
            has_writer[self.write_for_offset[slot] as usize] = true;
        }

        for reg in 0..REGISTER_COUNT {
            if has_reader[reg] && !has_writer[reg] {
                for slot in 0..self.holding {
                    if self.read_for_offset[slot] as usize == reg {
                        has_writer[self.write_for_offset[slot] as usize] = false;
                        has_writer[reg] = true;
                        self.write_for_offset[slot] = Register::from_index(reg as u8);
                        break;
                    }
                }
            }
        }

        let mut in_use_count = 0;
        for reg in 0..REGISTER_COUNT {
            self.register_in_use[reg] = has_reader[reg] || has_writer[reg];
            in_use_count += self.register_in_use[reg] as usize;
        }

        if in_use_count > self.holding {
            tracing::warn!(
                in_use = in_use_count,
                holding = self.holding,
                "more registers in use than stack slots"
            );
        }
    }

    /// The next stack register with neither readers nor writers. Disregard
    /// the result when every slot is occupied.
    fn next_free_register(&self) -> Register {
        for candidate in STACK_REGISTERS {
            if !self.register_in_use[candidate as usize] {
                return candidate;
            }
        }
        tracing::warn!("could not allocate a register");
        Register::R0
    }

    fn adjust_stack_pointer(&mut self, buf: &mut CodeBuffer, enc: &mut Encoder) {
        if self.top_offset_from_sp > 0 {
            buf.push(enc.add_large_imm(
                STACK_POINTER_REGISTER,
                (self.top_offset_from_sp * 4) as u8,
            ));
        } else if self.top_offset_from_sp < 0 {
            buf.push(enc.sub_large_imm(
                STACK_POINTER_REGISTER,
                (-self.top_offset_from_sp * 4) as u8,
            ));
        }
    }

    /// Writes slots `offset..` back to memory at stack position
    /// `slot + delta`, committing pending constants first, and redirects
    /// shallower writers off the spilled registers so at least
    /// `holding - offset` registers come free.
    fn reset_memory_invariant(
        &mut self,
        offset: usize,
        delta: i32,
        buf: &mut CodeBuffer,
        enc: &mut Encoder,
    ) {
        for slot in offset..self.holding {
            self.commit_stack_slot(slot, buf, enc);
            buf.push(enc.store_word_with_offset(
                self.read_for_offset[slot],
                STACK_POINTER_REGISTER,
                (slot as i32 + delta) as u8,
            ));

            // A shallower slot may read the register we just wrote out;
            // hand it the spilled slot's writer so the register is truly
            // free afterwards.
            for shallower in (0..offset).rev() {
                if self.read_for_offset[shallower] == self.read_for_offset[slot] {
                    self.write_for_offset[shallower] = self.write_for_offset[slot];
                    break;
                }
            }
        }
    }

    fn return_to_naive_from(&mut self, offset: usize, buf: &mut CodeBuffer, enc: &mut Encoder) {
        if self.in_naive_state() {
            return;
        }
        self.adjust_stack_pointer(buf, enc);
        self.reset_memory_invariant(offset, 0, buf, enc);

        if offset == 1 {
            self.commit_stack_slot(0, buf, enc);

            if self.write_for_offset[0] != STACK_TOP_REGISTER
                || self.read_for_offset[0] != STACK_TOP_REGISTER
            {
                buf.push(enc.move_low_to_low(STACK_TOP_REGISTER, self.read_for_offset[0]));
                self.read_for_offset[0] = STACK_TOP_REGISTER;
                self.write_for_offset[0] = STACK_TOP_REGISTER;
            }
            self.value_known[STACK_TOP_REGISTER as usize] = false;
        }

        self.top_offset_from_sp = 0;
        if offset == 1 {
            self.holding = 1;
        }
        self.redetermine_registers_in_use();
    }
}

impl Default for CowAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterFile for CowAllocator {
    fn in_naive_state(&self) -> bool {
        self.holding == 1
            && self.top_offset_from_sp == 0
            && self.register_in_use[STACK_TOP_REGISTER as usize]
            && self.read_for_offset[0] == STACK_TOP_REGISTER
            && self.write_for_offset[0] == STACK_TOP_REGISTER
            && !self.value_known[STACK_TOP_REGISTER as usize]
    }

    fn ensure_registers_hold(
        &mut self,
        n: usize,
        buf: &mut CodeBuffer,
        enc: &mut Encoder,
    ) -> Result<(), RegisterError> {
        if n > STACK_REGISTERS.len() {
            return Err(too_many_values(n));
        }
        while self.holding < n {
            let next = self.next_free_register();
            self.read_for_offset[self.holding] = next;
            self.write_for_offset[self.holding] = next;
            self.register_in_use[next as usize] = true;
            // A value freshly loaded from memory is by definition unknown.
            self.value_known[next as usize] = false;

            let offset = self.top_offset_from_sp + self.holding as i32;
            self.holding += 1;
            buf.push(enc.load_word_with_offset(next, STACK_POINTER_REGISTER, offset as u8));
        }
        Ok(())
    }

    fn top_writeback_register(&mut self) -> Register {
        self.read_for_offset[0] = self.write_for_offset[0];
        self.redetermine_registers_in_use();
        self.write_for_offset[0]
    }

    fn read_register(&self, n: usize) -> Register {
        self.read_for_offset[n]
    }

    fn pop(&mut self) -> Register {
        let previous_top = self.read_for_offset[0];
        self.holding -= 1;
        for slot in 0..self.holding {
            self.read_for_offset[slot] = self.read_for_offset[slot + 1];
            self.write_for_offset[slot] = self.write_for_offset[slot + 1];
        }
        self.redetermine_registers_in_use();
        self.top_offset_from_sp += 1;
        previous_top
    }

    fn push(&mut self, buf: &mut CodeBuffer, enc: &mut Encoder) -> Register {
        if self.holding == STACK_REGISTERS.len() {
            self.return_to_naive_from(self.holding - 1, buf, enc);
            self.holding -= 1;
            self.redetermine_registers_in_use();
        }

        let reg = self.next_free_register();
        for slot in (1..=self.holding).rev() {
            self.read_for_offset[slot] = self.read_for_offset[slot - 1];
            self.write_for_offset[slot] = self.write_for_offset[slot - 1];
        }

        self.value_known[reg as usize] = false;
        self.read_for_offset[0] = reg;
        self.write_for_offset[0] = reg;

        self.holding += 1;
        self.top_offset_from_sp -= 1;
        self.redetermine_registers_in_use();
        reg
    }

    fn return_to_naive_state(
        &mut self,
        buf: &mut CodeBuffer,
        enc: &mut Encoder,
    ) -> Result<(), RegisterError> {
        self.return_to_naive_from(1, buf, enc);
        Ok(())
    }

    fn return_to_comparison_state(
        &mut self,
        buf: &mut CodeBuffer,
        enc: &mut Encoder,
    ) -> Result<(), RegisterError> {
        // Three values so that something is left for the top of stack.
        self.ensure_registers_hold(3, buf, enc)?;

        // Pop the two comparison operands.
        self.top_offset_from_sp += 2;
        self.adjust_stack_pointer(buf, enc);
        self.top_offset_from_sp = 0;

        // Deeper slots go back to memory, shifted past the two pops.
        self.reset_memory_invariant(3, -2, buf, enc);

        for slot in 0..3 {
            self.commit_stack_slot(slot, buf, enc);
        }

        let top = self.read_for_offset[2];
        let mut a = self.read_for_offset[1];
        let mut b = self.read_for_offset[0];

        // The new top of stack must end up in r2 without clobbering either
        // comparison operand; with at most three live values there is
        // always a spare stack register to shelter an operand in.
        if top != STACK_TOP_REGISTER {
            if a != STACK_TOP_REGISTER && b != STACK_TOP_REGISTER {
                buf.push(enc.move_low_to_low(STACK_TOP_REGISTER, top));
            } else {
                let mut spare = STACK_REGISTERS[1];
                for candidate in STACK_REGISTERS.iter().skip(1) {
                    if *candidate != top && *candidate != a && *candidate != b {
                        spare = *candidate;
                        break;
                    }
                }
                if a == STACK_TOP_REGISTER && b == STACK_TOP_REGISTER {
                    buf.push(enc.move_low_to_low(spare, a));
                    a = spare;
                    b = spare;
                } else if a == STACK_TOP_REGISTER {
                    buf.push(enc.move_low_to_low(spare, a));
                    a = spare;
                } else {
                    buf.push(enc.move_low_to_low(spare, b));
                    b = spare;
                }
                buf.push(enc.move_low_to_low(STACK_TOP_REGISTER, top));
            }
        }

        // Comparison order is a OP b: the stack reads a then b from bottom
        // to top.
        self.comparison = (a, b);

        self.holding = 1;
        self.read_for_offset[0] = STACK_TOP_REGISTER;
        self.write_for_offset[0] = STACK_TOP_REGISTER;
        self.value_known[STACK_TOP_REGISTER as usize] = false;
        self.redetermine_registers_in_use();

        Ok(())
    }

    fn comparison_registers(&self) -> (Register, Register) {
        self.comparison
    }

    fn dup(&mut self, buf: &mut CodeBuffer, enc: &mut Encoder) -> Result<(), RegisterError> {
        self.ensure_registers_hold(1, buf, enc)?;
        // A fresh write register, but reads keep following the source; no
        // move is emitted until one of the copies is written.
        let write = self.push(buf, enc);
        let source = self.read_for_offset[1];
        self.read_for_offset[0] = source;
        self.value_known[write as usize] = self.register_value_is_known(source);
        self.values[write as usize] = self.values[source as usize];
        Ok(())
    }

    fn drop_top(&mut self, buf: &mut CodeBuffer, enc: &mut Encoder) -> Result<(), RegisterError> {
        self.ensure_registers_hold(2, buf, enc)?;
        self.pop();
        Ok(())
    }

    fn rot(&mut self, buf: &mut CodeBuffer, enc: &mut Encoder) -> Result<(), RegisterError> {
        self.ensure_registers_hold(3, buf, enc)?;

        let [ra, rb, rc] = [
            self.read_for_offset[0],
            self.read_for_offset[1],
            self.read_for_offset[2],
        ];
        let [wa, wb, wc] = [
            self.write_for_offset[0],
            self.write_for_offset[1],
            self.write_for_offset[2],
        ];

        self.read_for_offset[0] = rc;
        self.read_for_offset[1] = ra;
        self.read_for_offset[2] = rb;
        self.write_for_offset[0] = wc;
        self.write_for_offset[1] = wa;
        self.write_for_offset[2] = wb;
        Ok(())
    }

    fn swap(&mut self, buf: &mut CodeBuffer, enc: &mut Encoder) -> Result<(), RegisterError> {
        self.ensure_registers_hold(2, buf, enc)?;
        self.read_for_offset.swap(0, 1);
        self.write_for_offset.swap(0, 1);
        Ok(())
    }

    fn tuck(&mut self, buf: &mut CodeBuffer, enc: &mut Encoder) -> Result<(), RegisterError> {
        self.ntuck(3, buf, enc)?;
        Ok(())
    }

    fn ntuck(
        &mut self,
        n: i32,
        buf: &mut CodeBuffer,
        enc: &mut Encoder,
    ) -> Result<bool, RegisterError> {
        if !(0..=4).contains(&n) {
            return Ok(false);
        }
        let n = n as usize;
        self.ensure_registers_hold(n, buf, enc)?;

        let top_read = self.read_for_offset[0];
        let top_write = self.write_for_offset[0];
        for slot in 0..n.saturating_sub(1) {
            self.read_for_offset[slot] = self.read_for_offset[slot + 1];
            self.write_for_offset[slot] = self.write_for_offset[slot + 1];
        }
        if n > 0 {
            self.read_for_offset[n - 1] = top_read;
            self.write_for_offset[n - 1] = top_write;
        }
        Ok(true)
    }

    fn register_value_is_known(&self, reg: Register) -> bool {
        self.write_elimination && self.value_known[reg as usize]
    }

    fn known_register_value(&self, reg: Register) -> i32 {
        self.values[reg as usize]
    }

    fn set_known_register_value(
        &mut self,
        reg: Register,
        value: i32,
        buf: &mut CodeBuffer,
        enc: &mut Encoder,
    ) {
        if !self.write_elimination {
            codegen::load_constant(buf, enc, value, reg);
            return;
        }
        self.value_known[reg as usize] = true;
        self.values[reg as usize] = value;
    }

    fn commit_register(&mut self, reg: Register, buf: &mut CodeBuffer, enc: &mut Encoder) {
        if self.register_value_is_known(reg) {
            codegen::load_constant(buf, enc, self.values[reg as usize], reg);
            self.value_known[reg as usize] = false;
        }
    }

    fn commit_stack_slot(&mut self, n: usize, buf: &mut CodeBuffer, enc: &mut Encoder) {
        let write = self.write_for_offset[n];
        if self.register_value_is_known(write) {
            self.commit_register(write, buf, enc);
            self.read_for_offset[n] = write;
        }
    }
}
