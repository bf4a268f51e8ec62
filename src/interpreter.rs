//! Reference executor for the bytecode.
//!
//! The interpreter and the compiled code share one semantics and one lower
//! layer: the `execute_*` helper routines here are the same operations the
//! generated code reaches through its literal-pool calls, each guarded by
//! the underflow/overflow pre-checks that set the VM status and bail.
//!
//! The main loop keeps the stack pointer and top of stack in locals and
//! writes them back to the stack memory only around re-entrant operations
//! (helper routines, device dispatch, nested calls), mirroring the register
//! assignment of compiled code.

use stack_asm::{is_optional, Opcode};

use crate::device::Device;
use crate::error::VmStatus;
use crate::state::VmState;

/// Runs `state` to completion and reports the final status.
pub fn execute(state: &mut VmState<'_>, device: &dyn Device) -> VmStatus {
    let sp = state.stack.sp();
    let top = state.stack.peek();
    run(state, device, sp, top);

    // The device gets to silence itself however execution ended.
    device.program_halted();

    state.status
}

/// Whether popping `pops` values would read past the end of the stack.
/// Sets the status when it would.
fn underflow_check(state: &mut VmState<'_>, sp: usize, pops: i64) -> bool {
    if pops < 0 || sp as i64 + pops > state.stack.end() as i64 {
        state.status = VmStatus::StackUnderflow;
        true
    } else {
        false
    }
}

/// Whether pushing `pushes` values would write below the base of the
/// stack. Sets the status when it would.
fn overflow_check(state: &mut VmState<'_>, sp: usize, pushes: i64) -> bool {
    if sp as i64 - pushes < state.stack.base() as i64 {
        state.status = VmStatus::StackOverflow;
        true
    } else {
        false
    }
}

/// Dispatches one of the shared helpers, then reloads the cached stack
/// pointer and top of stack.
fn helper(
    state: &mut VmState<'_>,
    sp: &mut usize,
    top: &mut i32,
    f: fn(&mut VmState<'_>, usize, i32),
) {
    f(state, *sp, *top);
    *sp = state.stack.sp();
    if *sp != state.stack.end() {
        *top = state.stack.word(*sp);
    }
}

fn run(state: &mut VmState<'_>, device: &dyn Device, mut sp: usize, mut top: i32) {
    while state.program_counter < state.code.len() && state.status == VmStatus::Success {
        let instruction_start = state.program_counter;
        let byte = state.code.byte(state.program_counter);
        state.program_counter += 1;

        // A nested call attributes failures to the instruction inside the
        // callee, not to the call itself.
        let mut error_attributed_elsewhere = false;

        match Opcode::parse(byte) {
            Some(Opcode::Add) => {
                if !underflow_check(state, sp, 2) {
                    sp += 1;
                    top = state.stack.word(sp).wrapping_add(top);
                }
            }
            Some(Opcode::Sub) => {
                if !underflow_check(state, sp, 2) {
                    sp += 1;
                    top = state.stack.word(sp).wrapping_sub(top);
                }
            }
            Some(Opcode::Mul) => {
                if !underflow_check(state, sp, 2) {
                    sp += 1;
                    top = state.stack.word(sp).wrapping_mul(top);
                }
            }
            Some(Opcode::Div) => helper(state, &mut sp, &mut top, execute_div),
            Some(Opcode::Mod) => helper(state, &mut sp, &mut top, execute_mod),
            Some(Opcode::Inc) => {
                if !underflow_check(state, sp, 1) {
                    top = top.wrapping_add(1);
                }
            }
            Some(Opcode::Dec) => {
                if !underflow_check(state, sp, 1) {
                    top = top.wrapping_sub(1);
                }
            }
            Some(Opcode::Max) => helper(state, &mut sp, &mut top, execute_max),
            Some(Opcode::Min) => helper(state, &mut sp, &mut top, execute_min),
            Some(Opcode::Lt) => {
                if !underflow_check(state, sp, 2) {
                    sp += 1;
                    top = (state.stack.word(sp) < top) as i32;
                }
            }
            Some(Opcode::Le) => {
                if !underflow_check(state, sp, 2) {
                    sp += 1;
                    top = (state.stack.word(sp) <= top) as i32;
                }
            }
            Some(Opcode::Eq) => {
                if !underflow_check(state, sp, 2) {
                    sp += 1;
                    top = (state.stack.word(sp) == top) as i32;
                }
            }
            Some(Opcode::Ge) => {
                if !underflow_check(state, sp, 2) {
                    sp += 1;
                    top = (state.stack.word(sp) >= top) as i32;
                }
            }
            Some(Opcode::Gt) => {
                if !underflow_check(state, sp, 2) {
                    sp += 1;
                    top = (state.stack.word(sp) > top) as i32;
                }
            }
            Some(Opcode::Drop) => {
                if !underflow_check(state, sp, 1) {
                    sp += 1;
                    top = state.stack.word(sp);
                }
            }
            Some(Opcode::Dup) => {
                if !underflow_check(state, sp, 1) && !overflow_check(state, sp, 1) {
                    state.stack.set_word(sp, top);
                    sp -= 1;
                }
            }
            Some(Opcode::Ndup) => {
                if top < 0 {
                    state.status = VmStatus::StackUnderflow;
                } else if !underflow_check(state, sp, top as i64 + 1) {
                    top = state.stack.word(sp + top as usize);
                }
            }
            Some(Opcode::Swap) => {
                if !underflow_check(state, sp, 2) {
                    let below = state.stack.word(sp + 1);
                    state.stack.set_word(sp + 1, top);
                    top = below;
                }
            }
            Some(Opcode::Rot) => helper(state, &mut sp, &mut top, execute_rot),
            Some(Opcode::Nrot) => helper(state, &mut sp, &mut top, execute_nrot),
            Some(Opcode::Tuck) => helper(state, &mut sp, &mut top, execute_tuck),
            Some(Opcode::Ntuck) => helper(state, &mut sp, &mut top, execute_ntuck),
            Some(Opcode::Size) => helper(state, &mut sp, &mut top, execute_size),
            Some(Opcode::Nrnd) => {
                dispatch_device(state, device, &mut sp, &mut top, byte, 1, 1);
            }
            Some(Opcode::Push8) => {
                if !overflow_check(state, sp, 1) {
                    state.stack.set_word(sp, top);
                    sp -= 1;
                    top = state.code.signed8(state.program_counter);
                    state.program_counter += 1;
                }
            }
            Some(Opcode::Push16) => {
                if !overflow_check(state, sp, 1) {
                    state.stack.set_word(sp, top);
                    sp -= 1;
                    top = state.code.signed16(state.program_counter);
                    state.program_counter += 2;
                }
            }
            Some(Opcode::Jmp) => {
                if !underflow_check(state, sp, 1) {
                    state.program_counter = jump_target(state, top);
                    sp += 1;
                    top = state.stack.word(sp);
                }
            }
            Some(Opcode::Cjmp) => {
                if !underflow_check(state, sp, 2) {
                    if state.stack.word(sp + 1) != 0 {
                        state.program_counter = jump_target(state, top);
                    }
                    sp += 2;
                    top = state.stack.word(sp);
                }
            }
            Some(Opcode::Fetch) => {
                if !underflow_check(state, sp, 1) {
                    if top < 0 || top as usize + 1 >= state.code.len() {
                        state.status = VmStatus::OutOfBoundsFetch;
                    } else {
                        top = state.code.signed16(top as usize);
                    }
                }
            }
            Some(Opcode::Call) => {
                if !underflow_check(state, sp, 1) {
                    let return_pc = state.program_counter;
                    state.program_counter = jump_target(state, top);
                    sp += 1;
                    top = state.stack.word(sp);

                    run(state, device, sp, top);

                    sp = state.stack.sp();
                    if sp != state.stack.end() {
                        top = state.stack.word(sp);
                    }
                    if state.status == VmStatus::Success {
                        state.program_counter = return_pc;
                    } else {
                        error_attributed_elsewhere = true;
                    }
                }
            }
            Some(Opcode::Ret) => {
                if sp != state.stack.end() {
                    state.stack.set_word(sp, top);
                }
                state.stack.set_sp(sp);
                return;
            }
            Some(Opcode::Wait) => {
                dispatch_device(state, device, &mut sp, &mut top, byte, 0, 1);
            }
            Some(Opcode::Halt) => {
                break;
            }
            None => {
                if is_optional(byte) {
                    let effect = if state.program_counter < state.code.len() {
                        state.code.byte(state.program_counter)
                    } else {
                        0
                    };
                    dispatch_device(
                        state,
                        device,
                        &mut sp,
                        &mut top,
                        byte,
                        stack_asm::optional_push_count(effect),
                        stack_asm::optional_pop_count(effect),
                    );
                    if state.status == VmStatus::Success {
                        state.program_counter += 1;
                    }
                } else {
                    // Unrecognised instruction: skip to the end as if the
                    // program had ended.
                    state.program_counter = state.code.len();
                }
            }
        }

        if state.status != VmStatus::Success && !error_attributed_elsewhere {
            state.error_pc = instruction_start as u32;
        }
    }

    // Reflect the cached values on exit.
    if sp != state.stack.end() {
        state.stack.set_word(sp, top);
    }
    state.stack.set_sp(sp);
}

/// Jump destinations are runtime values in the interpreter; a negative one
/// ends the program.
fn jump_target(state: &VmState<'_>, top: i32) -> usize {
    if top < 0 {
        state.code.len()
    } else {
        top as usize
    }
}

/// Synchronises the stack, hands an instruction to the device, and falls
/// back to the declared stack effect when the device does not implement it.
fn dispatch_device(
    state: &mut VmState<'_>,
    device: &dyn Device,
    sp: &mut usize,
    top: &mut i32,
    byte: u8,
    push_count: u32,
    pop_count: u32,
) {
    if *sp != state.stack.end() {
        state.stack.set_word(*sp, *top);
    }
    state.stack.set_sp(*sp);

    if !device.execute(byte, state) {
        execute_effect(state, *sp, *top, push_count, pop_count);
    }

    *sp = state.stack.sp();
    if *sp != state.stack.end() {
        *top = state.stack.word(*sp);
    }
}

/// `div`: the quotient of the two top values. Division by zero yields zero,
/// matching the runtime division routine of the target.
pub fn execute_div(state: &mut VmState<'_>, sp: usize, top: i32) {
    if underflow_check(state, sp, 2) {
        return;
    }
    let below = state.stack.word(sp + 1);
    let quotient = if top == 0 { 0 } else { below.wrapping_div(top) };
    state.stack.set_word(sp + 1, quotient);
    state.stack.set_sp(sp + 1);
}

/// `mod`, with the same zero-divisor convention as [`execute_div`].
pub fn execute_mod(state: &mut VmState<'_>, sp: usize, top: i32) {
    if underflow_check(state, sp, 2) {
        return;
    }
    let below = state.stack.word(sp + 1);
    let remainder = if top == 0 { 0 } else { below.wrapping_rem(top) };
    state.stack.set_word(sp + 1, remainder);
    state.stack.set_sp(sp + 1);
}

/// `max` of the two top values.
pub fn execute_max(state: &mut VmState<'_>, sp: usize, top: i32) {
    if underflow_check(state, sp, 2) {
        return;
    }
    if state.stack.word(sp + 1) < top {
        state.stack.set_word(sp + 1, top);
    }
    state.stack.set_sp(sp + 1);
}

/// `min` of the two top values.
pub fn execute_min(state: &mut VmState<'_>, sp: usize, top: i32) {
    if underflow_check(state, sp, 2) {
        return;
    }
    if state.stack.word(sp + 1) > top {
        state.stack.set_word(sp + 1, top);
    }
    state.stack.set_sp(sp + 1);
}

/// `rot`: rotates the three top values, third to the top.
pub fn execute_rot(state: &mut VmState<'_>, sp: usize, top: i32) {
    if underflow_check(state, sp, 3) {
        return;
    }
    if sp != state.stack.end() {
        state.stack.set_word(sp, top);
    }
    state.stack.set_sp(sp);
    state.stack.rotate(3);
}

/// `nrot`: pops a count, then rotates that many values.
pub fn execute_nrot(state: &mut VmState<'_>, sp: usize, top: i32) {
    if top < 0 {
        state.status = VmStatus::StackUnderflow;
        return;
    }
    if underflow_check(state, sp, top as i64 + 1) {
        return;
    }
    state.stack.set_sp(sp + 1);
    state.stack.rotate(top);
}

/// `tuck`: sends the top value under the next two.
pub fn execute_tuck(state: &mut VmState<'_>, sp: usize, top: i32) {
    if underflow_check(state, sp, 3) {
        return;
    }
    if sp != state.stack.end() {
        state.stack.set_word(sp, top);
    }
    state.stack.set_sp(sp);
    state.stack.tuck(3);
}

/// `ntuck`: pops a count, then sends the top value that deep.
pub fn execute_ntuck(state: &mut VmState<'_>, sp: usize, top: i32) {
    if top < 0 {
        state.status = VmStatus::StackUnderflow;
        return;
    }
    if underflow_check(state, sp, top as i64 + 1) {
        return;
    }
    state.stack.set_sp(sp + 1);
    state.stack.tuck(top);
}

/// `size`: pushes the current stack depth.
pub fn execute_size(state: &mut VmState<'_>, sp: usize, top: i32) {
    if overflow_check(state, sp, 1) {
        return;
    }
    if sp != state.stack.end() {
        state.stack.set_word(sp, top);
    }
    state.stack.set_sp(sp);
    let size = state.stack.size() as i32;
    state.stack.push(size);
}

/// Applies a declared `(push, pop)` effect: pops, then pushes zeros.
pub fn execute_effect(
    state: &mut VmState<'_>,
    sp: usize,
    top: i32,
    push_count: u32,
    pop_count: u32,
) {
    if sp != state.stack.end() {
        state.stack.set_word(sp, top);
    }
    state.stack.set_sp(sp);

    if underflow_check(state, sp, pop_count as i64) {
        return;
    }
    for _ in 0..pop_count {
        state.stack.pop();
    }

    if overflow_check(state, state.stack.sp(), push_count as i64) {
        return;
    }
    for _ in 0..push_count {
        state.stack.push(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::NullDevice;
    use crate::state::{VmStack, VmState};
    use stack_asm::StackCode;

    fn run_program<'a>(bytes: &'a [u8], initial: &[i32]) -> VmState<'a> {
        let mut stack = VmStack::new(128);
        for value in initial {
            stack.push(*value);
        }
        let mut state = VmState::new(stack, StackCode::new(bytes));
        execute(&mut state, &NullDevice);
        state
    }

    #[test]
    fn arithmetic() {
        let state = run_program(&[0x00], &[2, 3]);
        assert_eq!(state.status, VmStatus::Success);
        assert_eq!(state.stack.values(), &[5]);

        let state = run_program(&[0x01], &[10, 4]);
        assert_eq!(state.stack.values(), &[6]);

        let state = run_program(&[0x02], &[6, 7]);
        assert_eq!(state.stack.values(), &[42]);

        let state = run_program(&[0x03], &[42, 5]);
        assert_eq!(state.stack.values(), &[8]);

        let state = run_program(&[0x04], &[42, 5]);
        assert_eq!(state.stack.values(), &[2]);
    }

    #[test]
    fn division_by_zero_yields_zero() {
        let state = run_program(&[0x03], &[42, 0]);
        assert_eq!(state.status, VmStatus::Success);
        assert_eq!(state.stack.values(), &[0]);

        let state = run_program(&[0x04], &[42, 0]);
        assert_eq!(state.stack.values(), &[0]);
    }

    #[test]
    fn comparisons_produce_booleans() {
        assert_eq!(run_program(&[0x09], &[1, 2]).stack.values(), &[1]); // lt
        assert_eq!(run_program(&[0x09], &[2, 1]).stack.values(), &[0]);
        assert_eq!(run_program(&[0x0a], &[2, 2]).stack.values(), &[1]); // le
        assert_eq!(run_program(&[0x0b], &[2, 2]).stack.values(), &[1]); // eq
        assert_eq!(run_program(&[0x0c], &[3, 2]).stack.values(), &[1]); // ge
        assert_eq!(run_program(&[0x0d], &[2, 3]).stack.values(), &[0]); // gt
    }

    #[test]
    fn stack_shuffles() {
        assert_eq!(run_program(&[0x11], &[1, 2]).stack.values(), &[1, 2]); // swap
        assert_eq!(run_program(&[0x12], &[1, 2, 3]).stack.values(), &[1, 3, 2]); // rot
        assert_eq!(run_program(&[0x14], &[1, 2, 3]).stack.values(), &[2, 1, 3]); // tuck
        assert_eq!(run_program(&[0x0f], &[7]).stack.values(), &[7, 7]); // dup
        assert_eq!(run_program(&[0x0e], &[1, 2]).stack.values(), &[1]); // drop
    }

    #[test]
    fn ndup_reaches_down() {
        // ndup 1 duplicates the top value.
        let state = run_program(&[0x18, 0x01, 0x10], &[30, 20]);
        assert_eq!(state.stack.values(), &[20, 20, 30]);

        // ndup 2 duplicates the value below it.
        let state = run_program(&[0x18, 0x02, 0x10], &[30, 20]);
        assert_eq!(state.stack.values(), &[30, 20, 30]);
    }

    #[test]
    fn size_reports_depth() {
        let state = run_program(&[0x16], &[5, 6, 7]);
        assert_eq!(state.stack.values(), &[3, 7, 6, 5]);
    }

    #[test]
    fn fetch_reads_code() {
        // push8 4; fetch; halt; then the two data bytes fe ff = -2.
        let state = run_program(&[0x18, 0x04, 0x1a, 0x20, 0xfe, 0xff], &[]);
        assert_eq!(state.status, VmStatus::Success);
        assert_eq!(state.stack.values(), &[-2]);
    }

    #[test]
    fn fetch_out_of_bounds_sets_the_status() {
        let state = run_program(&[0x18, 0x70, 0x1a], &[]);
        assert_eq!(state.status, VmStatus::OutOfBoundsFetch);
        assert_eq!(state.error_pc, 2);
    }

    #[test]
    fn underflow_is_reported_with_the_offending_offset() {
        let state = run_program(&[0x00], &[]);
        assert_eq!(state.status, VmStatus::StackUnderflow);
        assert_eq!(state.error_pc, 0);
    }

    #[test]
    fn overflow_is_reported() {
        let mut stack = VmStack::without_padding(2);
        stack.push(1);
        stack.push(2);
        let code = [0x18, 0x07];
        let mut state = VmState::new(stack, StackCode::new(&code));
        execute(&mut state, &NullDevice);
        assert_eq!(state.status, VmStatus::StackOverflow);
        assert_eq!(state.error_pc, 0);
    }

    #[test]
    fn nested_call_failure_keeps_the_inner_error_pc() {
        // 0: push8 4; call; halt
        // 4: add; ret            -- underflows at offset 4
        let state = run_program(&[0x18, 0x04, 0x1b, 0x20, 0x00, 0x1c], &[]);
        assert_eq!(state.status, VmStatus::StackUnderflow);
        assert_eq!(state.error_pc, 4);
    }

    #[test]
    fn optional_instruction_applies_declared_effect() {
        // beep with effect (push 0, pop 2)
        let state = run_program(&[0x82, 0x02], &[1, 2, 3]);
        assert_eq!(state.status, VmStatus::Success);
        assert_eq!(state.stack.values(), &[1]);

        // temp with effect (push 1, pop 0) pushes a zero
        let state = run_program(&[0x86, 0x10], &[9]);
        assert_eq!(state.stack.values(), &[0, 9]);
    }

    #[test]
    fn optional_instruction_underflow_is_checked() {
        let state = run_program(&[0x82, 0x02], &[1]);
        assert_eq!(state.status, VmStatus::StackUnderflow);
        assert_eq!(state.error_pc, 0);
    }

    #[test]
    fn unknown_core_byte_ends_the_program() {
        let state = run_program(&[0x21, 0x18, 0x05], &[1]);
        assert_eq!(state.status, VmStatus::Success);
        assert_eq!(state.stack.values(), &[1]);
    }
}
