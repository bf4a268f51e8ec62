use thumb_asm::{Encoder, Register};

use crate::buffer::CodeBuffer;
use crate::codegen;
use crate::consts::{STACK_POINTER_REGISTER, STACK_REGISTERS, STACK_TOP_REGISTER, TEMP_REGISTER};
use crate::error::RegisterError;
use crate::regfile::{too_many_values, RegisterFile};

/// Rotating register allocator.
///
/// Stack slot `n` is backed by `STACK_REGISTERS[(start + n) % 5]`; a push
/// rotates the window backwards and a pop forwards, so no values ever move
/// between registers. Reads and writes share a register, so `dup` costs a
/// move and constants are materialised immediately.
#[derive(Debug)]
pub struct StackAllocator {
    /// How far the real top of stack is above the unadjusted stack pointer,
    /// in words. Zero in naive state.
    top_offset_from_sp: i32,
    /// At least one in naive state: the top of stack sits in `r2`.
    holding: usize,
    start_register: usize,
}

impl StackAllocator {
    /// A file in naive state.
    pub fn new() -> Self {
        Self {
            top_offset_from_sp: 0,
            holding: 1,
            start_register: 0,
        }
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

    /// Writes slots `offset..` back to memory and restores the stack
    /// pointer; `offset == 1` is the full return to naive state (the top
    /// slot stays cached in `r2`), larger offsets just spill the deepest
    /// slot to free its register.
    fn return_to_naive_from(&mut self, offset: usize, buf: &mut CodeBuffer, enc: &mut Encoder) {
        if self.in_naive_state() {
            return;
        }
        self.adjust_stack_pointer(buf, enc);

        for i in offset..self.holding {
            buf.push(enc.store_word_with_offset(
                self.read_register(i),
                STACK_POINTER_REGISTER,
                i as u8,
            ));
        }

        if offset == 1 && self.top_writeback_register() != STACK_TOP_REGISTER {
            let top = self.top_writeback_register();
            buf.push(enc.move_low_to_low(STACK_TOP_REGISTER, top));
        }

        self.top_offset_from_sp = 0;

        if offset == 1 {
            self.holding = 1;
            self.start_register = 0;
        }
    }
}

impl Default for StackAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterFile for StackAllocator {
    fn in_naive_state(&self) -> bool {
        self.top_offset_from_sp == 0 && self.holding == 1
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
            let next = STACK_REGISTERS[(self.start_register + self.holding) % STACK_REGISTERS.len()];
            let offset = self.top_offset_from_sp + self.holding as i32;
            self.holding += 1;
            buf.push(enc.load_word_with_offset(next, STACK_POINTER_REGISTER, offset as u8));
        }
        Ok(())
    }

    fn top_writeback_register(&mut self) -> Register {
        // Reads and writes share registers in this file.
        self.read_register(0)
    }

    fn read_register(&self, n: usize) -> Register {
        STACK_REGISTERS[(self.start_register + n) % STACK_REGISTERS.len()]
    }

    fn pop(&mut self) -> Register {
        let top = self.read_register(0);
        self.holding -= 1;
        self.start_register = (self.start_register + 1) % STACK_REGISTERS.len();
        self.top_offset_from_sp += 1;
        top
    }

    fn push(&mut self, buf: &mut CodeBuffer, enc: &mut Encoder) -> Register {
        let slots = STACK_REGISTERS.len();
        if self.holding == 0 {
            self.start_register = 0;
            self.holding = 1;
        } else if self.holding == slots {
            // Spill the oldest cached slot so its register can be reused.
            self.return_to_naive_from(slots - 1, buf, enc);
            self.start_register = (self.start_register + slots - 1) % slots;
        } else {
            self.holding += 1;
            self.start_register = (self.start_register + slots - 1) % slots;
        }
        self.top_offset_from_sp -= 1;
        self.top_writeback_register()
    }

    fn return_to_naive_state(
        &mut self,
        buf: &mut CodeBuffer,
        enc: &mut Encoder,
    ) -> Result<(), RegisterError> {
        self.return_to_naive_from(1, buf, enc);
        Ok(())
    }

    fn dup(&mut self, buf: &mut CodeBuffer, enc: &mut Encoder) -> Result<(), RegisterError> {
        let top = self.top_writeback_register();
        let dest = self.push(buf, enc);
        buf.push(enc.move_low_to_low(dest, top));
        Ok(())
    }

    fn drop_top(&mut self, buf: &mut CodeBuffer, enc: &mut Encoder) -> Result<(), RegisterError> {
        self.ensure_registers_hold(2, buf, enc)?;
        self.pop();
        Ok(())
    }

    fn rot(&mut self, buf: &mut CodeBuffer, enc: &mut Encoder) -> Result<(), RegisterError> {
        self.ensure_registers_hold(3, buf, enc)?;
        let a = self.read_register(0);
        let b = self.read_register(1);
        let c = self.read_register(2);
        buf.push(enc.move_low_to_low(TEMP_REGISTER, c));
        buf.push(enc.move_low_to_low(c, b));
        buf.push(enc.move_low_to_low(b, a));
        buf.push(enc.move_low_to_low(a, TEMP_REGISTER));
        Ok(())
    }

    fn swap(&mut self, buf: &mut CodeBuffer, enc: &mut Encoder) -> Result<(), RegisterError> {
        self.ensure_registers_hold(2, buf, enc)?;
        let a = self.read_register(0);
        let b = self.read_register(1);
        buf.push(enc.move_low_to_low(TEMP_REGISTER, a));
        buf.push(enc.move_low_to_low(a, b));
        buf.push(enc.move_low_to_low(b, TEMP_REGISTER));
        Ok(())
    }

    fn tuck(&mut self, buf: &mut CodeBuffer, enc: &mut Encoder) -> Result<(), RegisterError> {
        self.ensure_registers_hold(3, buf, enc)?;
        let a = self.read_register(0);
        let b = self.read_register(1);
        let c = self.read_register(2);
        buf.push(enc.move_low_to_low(TEMP_REGISTER, a));
        buf.push(enc.move_low_to_low(a, b));
        buf.push(enc.move_low_to_low(b, c));
        buf.push(enc.move_low_to_low(c, TEMP_REGISTER));
        Ok(())
    }

    fn set_known_register_value(
        &mut self,
        reg: Register,
        value: i32,
        buf: &mut CodeBuffer,
        enc: &mut Encoder,
    ) {
        // No constant tracking; materialise immediately.
        codegen::load_constant(buf, enc, value, reg);
    }

    fn commit_register(&mut self, _reg: Register, _buf: &mut CodeBuffer, _enc: &mut Encoder) {}

    fn commit_stack_slot(&mut self, _n: usize, _buf: &mut CodeBuffer, _enc: &mut Encoder) {}
}
