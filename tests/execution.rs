//! End-to-end scenarios: reference execution of whole programs, canary
//! checks, bounds-check completeness, and structural verification of the
//! generated Thumb code by decoding it.

use stack_asm::{Opcode, StackCode};
use stackvm::compiler::{
    compile_function_dynamically, CompilePhase, Compiler, CompilerConfig, ConditionalBranchMode,
    HelperRoutines, RegisterAllocation, StackCheckMode,
};
use stackvm::buffer::CodeBuffer;
use stackvm::device::NullDevice;
use stackvm::error::{CompileError, CompileStatus, VmStatus};
use stackvm::interpreter::execute;
use stackvm::state::{VmStack, VmState};
use thumb_asm::{decode_with_origin, is_long_call};

const STACK_DEPTH: usize = 128;
const CANARY_VALUES: usize = 4;

fn canary_value(index: usize) -> i32 {
    // Arbitrary, just distinguishable.
    ((2 * index + 1) * (index + 3)) as i32
}

/// Runs `bytes` in the interpreter over a fresh stack seeded with
/// `initial` (bottom first).
fn interpret<'a>(bytes: &'a [u8], initial: &[i32]) -> VmState<'a> {
    let mut stack = VmStack::new(STACK_DEPTH);
    for value in initial {
        stack.push(*value);
    }
    let mut state = VmState::new(stack, StackCode::new(bytes));
    execute(&mut state, &NullDevice);
    state
}

/// Runs `bytes` with the canary prefix and checks it survived untouched.
fn interpret_with_canary<'a>(bytes: &'a [u8]) -> VmState<'a> {
    let mut stack = VmStack::new(STACK_DEPTH);
    for index in 0..CANARY_VALUES {
        stack.push(canary_value(index));
    }
    let mut state = VmState::new(stack, StackCode::new(bytes));
    execute(&mut state, &NullDevice);

    let depth = state.stack.size();
    assert!(depth >= CANARY_VALUES, "canaries were consumed");
    for index in 0..CANARY_VALUES {
        assert_eq!(
            state.stack.peek_at(depth - index - 1),
            canary_value(index),
            "canary {index} was clobbered"
        );
    }
    state
}

/// Compiles `bytes` under `config`, asserting success.
fn compile_with(bytes: &[u8], config: CompilerConfig) -> CodeBuffer {
    let mut buf = CodeBuffer::new();
    let mut compiler = Compiler::with_config(
        StackCode::new(bytes),
        &NullDevice,
        HelperRoutines::placeholder(),
        config,
    );
    compiler
        .compile(&mut buf)
        .expect("compilation should succeed");
    assert_eq!(compiler.phase(), CompilePhase::Done);
    buf
}

fn compile(bytes: &[u8]) -> CodeBuffer {
    compile_with(bytes, CompilerConfig::default())
}

fn disassembly(buf: &CodeBuffer) -> Vec<String> {
    buf.words()
        .iter()
        .enumerate()
        .map(|(i, word)| decode_with_origin(*word, (2 * i) as u32))
        .collect()
}

fn long_call_count(buf: &CodeBuffer) -> usize {
    let mut count = 0;
    let mut i = 0;
    while i < buf.len() {
        if is_long_call(buf.word(i)) {
            count += 1;
            i += 2;
        } else {
            i += 1;
        }
    }
    count
}

/// Every register-allocation mode compiles the program successfully.
fn compiles_under_every_allocator(bytes: &[u8]) {
    for allocation in [
        RegisterAllocation::Naive,
        RegisterAllocation::Stack,
        RegisterAllocation::StackWithCopyOnWrite,
    ] {
        let config = CompilerConfig {
            register_allocation: allocation,
            ..CompilerConfig::default()
        };
        let buf = compile_with(bytes, config);
        assert!(!buf.is_empty());
    }
}

// push 1; push 2; add; halt
const ADD_CONSTANTS: &[u8] = &[0x18, 0x01, 0x18, 0x02, 0x00, 0x20];

/// The iterative fibonacci calibration program; the first operand byte is
/// `n`.
const ITERATIVE_FIBONACCI: &[u8] = &[
    0x18, 12, // push n
    0x18, 0x06, // push fibonacci
    0x1b, // call
    0x20, // halt
    // fibonacci:
    0x0f, // dup
    0x18, 0x01, // push 1
    0x0d, // gt
    0x18, 0x0e, // push isGreaterThanOne
    0x1e, // cjmp
    0x1c, // ret
    // isGreaterThanOne:
    0x18, 0x00, // push 0
    0x18, 0x01, // push 1
    // loop:
    0x0f, // dup
    0x14, // tuck
    0x00, // add
    0x12, // rot
    0x18, 0x01, // push 1
    0x01, // sub
    0x0f, // dup
    0x18, 0x04, // push 4
    0x15, // ntuck
    0x18, 0x01, // push 1
    0x0d, // gt
    0x18, 0x12, // push loop
    0x1e, // cjmp
    0x12, // rot
    0x0e, // drop
    0x11, // swap
    0x0e, // drop
    0x1c, // ret
];

/// Computes gcd(610, 987); consecutive fibonacci numbers are the worst
/// case for the algorithm.
const GCD: &[u8] = &[
    0x19, 0x62, 0x02, // push 610
    0x19, 0xdb, 0x03, // push 987
    0x18, 0x0a, // push gcd
    0x1b, // call
    0x20, // halt
    // gcd:
    0x0f, // dup
    0x18, 0x00, // push 0
    0x0b, // eq
    0x18, 0x19, // push ret0
    0x1e, // cjmp
    0x0f, // dup
    0x12, // rot
    0x11, // swap
    0x04, // mod
    0x18, 0x0a, // push gcd
    0x1b, // call
    0x1c, // ret
    // ret0:
    0x0e, // drop
    0x1c, // ret
];

/// push 37; push 42; eq; push 11; cjmp; push 10; halt; push 9; halt
const FUSED_BRANCH: &[u8] = &[
    0x18, 0x25, 0x18, 0x2a, 0x0b, 0x18, 0x0b, 0x1e, 0x18, 0x0a, 0x20, 0x18, 0x09, 0x20,
];

/// push fn; push 41; swap; call (dynamic); halt; ...; fn: inc; ret
const DYNAMIC_CALL: &[u8] = &[
    0x18, 0x0a, // push 10, the callee's offset
    0x18, 0x29, // push 41
    0x11, // swap
    0x1b, // call through the swapped-up address
    0x20, // halt
    0x00, 0x00, 0x00, // never reached
    0x05, // callee: inc
    0x1c, // ret
];

#[test]
fn add_of_two_constants() {
    let state = interpret(ADD_CONSTANTS, &[]);
    assert_eq!(state.status, VmStatus::Success);
    assert_eq!(state.stack.values(), &[3]);

    interpret_with_canary(ADD_CONSTANTS);
    compiles_under_every_allocator(ADD_CONSTANTS);
}

#[test]
fn constant_folding_materialises_the_result() {
    // push 6; push 7; mul; halt
    let program = &[0x18, 0x06, 0x18, 0x07, 0x02, 0x20];
    let state = interpret(program, &[]);
    assert_eq!(state.stack.values(), &[42]);

    // Under the copy-on-write allocator the product is computed at compile
    // time and lands as a single constant load.
    let buf = compile(program);
    let text = disassembly(&buf);
    assert!(
        text.iter().any(|t| t.contains("#42")),
        "folded constant missing: {text:?}"
    );
    assert!(
        !text.iter().any(|t| t.starts_with("mul")),
        "multiply should have been folded: {text:?}"
    );
}

#[test]
fn iterative_fibonacci() {
    let state = interpret(ITERATIVE_FIBONACCI, &[]);
    assert_eq!(state.status, VmStatus::Success);
    assert_eq!(state.stack.values(), &[144]);

    interpret_with_canary(ITERATIVE_FIBONACCI);
    compiles_under_every_allocator(ITERATIVE_FIBONACCI);
}

#[test]
fn gcd_of_consecutive_fibonacci_numbers() {
    let state = interpret(GCD, &[]);
    assert_eq!(state.status, VmStatus::Success);
    assert_eq!(state.stack.values(), &[1]);

    interpret_with_canary(GCD);
    compiles_under_every_allocator(GCD);
}

#[test]
fn fused_branch_emits_a_single_compare_and_branch() {
    let state = interpret(FUSED_BRANCH, &[]);
    assert_eq!(state.status, VmStatus::Success);
    // 37 != 42, so execution falls through to push 10.
    assert_eq!(state.stack.values(), &[10]);

    let buf = compile(FUSED_BRANCH);
    let text = disassembly(&buf);

    // The comparison feeds the branch directly: a cmp of two stack
    // registers immediately followed by beq.
    let fused = text
        .iter()
        .zip(text.iter().skip(1))
        .any(|(a, b)| a == "cmp r4, r5" && b.starts_with("beq"));
    assert!(fused, "no fused cmp/beq pair: {text:?}");

    // The naive lowering's materialised-boolean test never appears.
    assert!(
        !text.iter().any(|t| t == "cmp r3, #0"),
        "naive branch sequence leaked in: {text:?}"
    );
}

#[test]
fn naive_branch_mode_materialises_the_flag() {
    let config = CompilerConfig {
        conditional_branches: ConditionalBranchMode::Naive,
        ..CompilerConfig::default()
    };
    let buf = compile_with(FUSED_BRANCH, config);
    let text = disassembly(&buf);
    assert!(
        text.iter().any(|t| t == "cmp r3, #0"),
        "naive conditional branch missing: {text:?}"
    );
}

#[test]
fn underflow_on_add_reports_offset_zero() {
    let state = interpret(&[0x00], &[]);
    assert_eq!(state.status, VmStatus::StackUnderflow);
    assert_eq!(state.error_pc, 0);
}

#[test]
fn every_popping_opcode_underflows_on_an_empty_stack() {
    // (program, pops) pairs; all run against an empty stack.
    let programs: &[&[u8]] = &[
        &[0x00], // add
        &[0x01], // sub
        &[0x02], // mul
        &[0x03], // div
        &[0x04], // mod
        &[0x05], // inc
        &[0x06], // dec
        &[0x07], // max
        &[0x08], // min
        &[0x09], // lt
        &[0x0a], // le
        &[0x0b], // eq
        &[0x0c], // ge
        &[0x0d], // gt
        &[0x0e], // drop
        &[0x0f], // dup
        &[0x10], // ndup
        &[0x11], // swap
        &[0x12], // rot
        &[0x13], // nrot
        &[0x14], // tuck
        &[0x15], // ntuck
        &[0x1a], // fetch
        &[0x1b], // call
        &[0x1d], // jmp
        &[0x1e], // cjmp
        &[0x1f], // wait
    ];
    for program in programs {
        let mut stack = VmStack::without_padding(8);
        stack.clear();
        let mut state = VmState::new(stack, StackCode::new(program));
        execute(&mut state, &NullDevice);
        assert_eq!(
            state.status,
            VmStatus::StackUnderflow,
            "opcode {:#04x} did not underflow",
            program[0]
        );
    }
}

#[test]
fn every_pushing_opcode_overflows_a_full_stack() {
    let programs: &[&[u8]] = &[
        &[0x18, 0x01], // push8
        &[0x19, 0x01, 0x00], // push16
        &[0x0f], // dup
        &[0x16], // size
    ];
    for program in programs {
        let mut stack = VmStack::without_padding(2);
        stack.push(1);
        stack.push(2);
        let mut state = VmState::new(stack, StackCode::new(program));
        execute(&mut state, &NullDevice);
        assert_eq!(
            state.status,
            VmStatus::StackOverflow,
            "opcode {:#04x} did not overflow",
            program[0]
        );
    }
}

#[test]
fn dynamic_call_compiles_once_and_caches() {
    // The interpreter executes the dynamic call directly.
    let state = interpret(DYNAMIC_CALL, &[]);
    assert_eq!(state.status, VmStatus::Success);
    assert_eq!(state.stack.values(), &[42]);

    // The compiled program routes it through the trampoline.
    let mut buf = CodeBuffer::new();
    let mut compiler = Compiler::new(
        StackCode::new(DYNAMIC_CALL),
        &NullDevice,
        HelperRoutines::placeholder(),
    );
    compiler.compile(&mut buf).expect("compile");
    assert!(compiler.has_dynamic_calls());
    assert!(compiler
        .function_pointer_for(10, &buf)
        .is_none());

    // First dynamic call: the callee gets compiled and cached.
    let first = compile_function_dynamically(&mut compiler, &mut buf, 10);
    let entry = first.entry.expect("dynamic compilation should succeed");
    assert_eq!(entry & 1, 1);
    assert_ne!(buf.jump_table()[10], 0);
    let len_after_first = buf.len();

    // Second call: served from the jump table, no growth.
    let second = compile_function_dynamically(&mut compiler, &mut buf, 10);
    assert_eq!(second.entry, Some(entry));
    assert_eq!(second.relocation, 0);
    assert_eq!(buf.len(), len_after_first);
}

#[test]
fn dynamic_call_outside_the_code_fails() {
    let mut buf = CodeBuffer::new();
    let mut compiler = Compiler::new(
        StackCode::new(DYNAMIC_CALL),
        &NullDevice,
        HelperRoutines::placeholder(),
    );
    compiler.compile(&mut buf).expect("compile");
    let outcome = compile_function_dynamically(&mut compiler, &mut buf, 400);
    assert_eq!(outcome.entry, None);
}

#[test]
fn tail_calls_become_branches() {
    // 0: push 10; push downToZero; call; halt
    // 6: downToZero: dec; dup; push downToZero; cjmp; ret
    //
    // The self call is a cjmp here, so build the classic form instead: a
    // leaf function whose self call is directly followed by ret.
    let program: &[u8] = &[
        0x18, 0x0a, // push 10
        0x18, 0x06, // push 6
        0x1b, // call
        0x20, // halt
        // downToZero:
        0x06, // dec
        0x0f, // dup
        0x18, 0x06, // push 6 (self)
        0x1b, // call
        0x1c, // ret
    ];

    let with_tco = compile(program);
    let without_tco = compile_with(
        program,
        CompilerConfig {
            tail_calls: false,
            ..CompilerConfig::default()
        },
    );

    // With tail calls the self call is a plain branch: only the entry call
    // and the main-to-callee call remain as bl pairs.
    assert_eq!(long_call_count(&with_tco), 2);
    assert_eq!(long_call_count(&without_tco), 3);
}

#[test]
fn supersession_elides_the_destination_bounds_check() {
    // Block A pushes two constants and jumps; block B consumes them. A's
    // effect supersedes B's, so the branch may land past B's check.
    let program: &[u8] = &[
        0x18, 0x01, // push 1
        0x18, 0x02, // push 2
        0x18, 0x07, // push B
        0x1d, // jmp
        // B:
        0x00, // add
        0x20, // halt
    ];

    let eliminating = compile(program);
    let checking = compile_with(
        program,
        CompilerConfig {
            bounds_check_elimination: false,
            ..CompilerConfig::default()
        },
    );

    // Same code shape either way; only the branch offset differs by the
    // size of B's bounds check.
    assert_eq!(eliminating.len(), checking.len());
    assert_ne!(eliminating.words(), checking.words());
}

#[test]
fn blocks_without_supersession_are_untouched_by_elimination() {
    // A pops, so it cannot cover B's check; both configurations must agree.
    let program: &[u8] = &[
        0x00, // add
        0x18, 0x04, // push B
        0x1d, // jmp
        // B:
        0x00, // add
        0x20, // halt
    ];
    let eliminating = compile(program);
    let checking = compile_with(
        program,
        CompilerConfig {
            bounds_check_elimination: false,
            ..CompilerConfig::default()
        },
    );
    assert_eq!(eliminating.words(), checking.words());
}

#[test]
fn disabled_stack_checks_shrink_the_output() {
    let checked = compile(ADD_CONSTANTS);
    let unchecked = compile_with(
        ADD_CONSTANTS,
        CompilerConfig {
            stack_check: StackCheckMode::None,
            ..CompilerConfig::default()
        },
    );
    assert!(unchecked.len() < checked.len());
}

#[test]
fn variable_jumps_are_rejected_before_code_generation() {
    // dup; jmp
    let program: &[u8] = &[0x0f, 0x1d];
    let mut buf = CodeBuffer::new();
    let mut compiler = Compiler::new(
        StackCode::new(program),
        &NullDevice,
        HelperRoutines::placeholder(),
    );
    let error = compiler.compile(&mut buf).unwrap_err();
    assert!(matches!(error, CompileError::StaticAnalysis(_)));
    assert_eq!(
        compiler.phase(),
        CompilePhase::Failed(CompileStatus::StaticAnalysisFailed)
    );
}

#[test]
fn observers_see_every_compilation() {
    use std::cell::RefCell;
    let statuses: RefCell<Vec<CompileStatus>> = RefCell::new(Vec::new());

    let mut compiler = Compiler::new(
        StackCode::new(ADD_CONSTANTS),
        &NullDevice,
        HelperRoutines::placeholder(),
    );
    let id = compiler.add_observer(|_, status| statuses.borrow_mut().push(status));

    let mut buf = CodeBuffer::new();
    compiler.compile(&mut buf).expect("compile");
    assert_eq!(statuses.borrow().as_slice(), &[CompileStatus::Success]);

    assert!(compiler.remove_observer(id));
    assert!(!compiler.remove_observer(id));

    compiler.compile(&mut buf).expect("compile");
    assert_eq!(statuses.borrow().len(), 1);
}

#[test]
fn compiled_programs_keep_their_artefacts_reloadable() {
    use stackvm::transfer::MemoryStore;

    let mut buf = CodeBuffer::new();
    let mut compiler = Compiler::new(
        StackCode::new(GCD),
        &NullDevice,
        HelperRoutines::placeholder(),
    );
    compiler.compile(&mut buf).expect("compile");

    let mut store = MemoryStore::default();
    compiler.serialize(&mut store).expect("serialize");
    buf.serialize(&mut store).expect("serialize");

    let mut reloaded_buf = CodeBuffer::new();
    reloaded_buf.deserialize(&store).expect("deserialize");
    assert_eq!(reloaded_buf.words(), buf.words());

    let mut reloaded = Compiler::new(
        StackCode::new(GCD),
        &NullDevice,
        HelperRoutines::placeholder(),
    );
    reloaded.deserialize(&store).expect("deserialize");
    // The reloaded offset map resolves the same entry points (compared
    // over one buffer; entry addresses are relative to its base).
    assert!(reloaded.function_pointer_for(10, &buf).is_some());
    assert_eq!(
        reloaded.function_pointer_for(10, &buf),
        compiler.function_pointer_for(10, &buf),
    );
}

#[test]
fn recursive_programs_save_and_restore_the_link_register() {
    // Recursive fibonacci: the callee calls itself twice mid-body.
    let program: &[u8] = &[
        0x18, 0x0f, // push 15
        0x18, 0x06, // push fib
        0x1b, // call
        0x20, // halt
        // fib:
        0x0f, // dup
        0x18, 0x01, // push 1
        0x0d, // gt
        0x18, 0x0e, // push recurse
        0x1e, // cjmp
        0x1c, // ret
        // recurse:
        0x0f, // dup
        0x18, 0x01, // push 1
        0x01, // sub
        0x18, 0x06, // push fib
        0x1b, // call
        0x11, // swap
        0x18, 0x02, // push 2
        0x01, // sub
        0x18, 0x06, // push fib
        0x1b, // call
        0x00, // add
        0x1c, // ret
    ];

    let state = interpret(program, &[]);
    assert_eq!(state.status, VmStatus::Success);
    assert_eq!(state.stack.values(), &[610]); // fib(15)

    let buf = compile(program);
    let text = disassembly(&buf);
    // The callee's entry pushes lr and its returns pop into pc.
    assert!(text.iter().any(|t| t == "push lr"), "{text:?}");
    assert!(text.iter().any(|t| t == "pop pc"), "{text:?}");
}

#[test]
fn interpreter_and_compiler_agree_on_opcode_coverage() {
    // Every core opcode both interprets and compiles without tripping the
    // encoder, over a program that keeps the stack legal.
    let program: &[u8] = &[
        0x18, 0x08, // push 8
        0x18, 0x03, // push 3
        0x07, // max
        0x18, 0x02, // push 2
        0x08, // min
        0x05, // inc
        0x06, // dec
        0x0f, // dup
        0x00, // add
        0x0f, // dup
        0x01, // sub
        0x18, 0x05, // push 5
        0x02, // mul
        0x18, 0x03, // push 3
        0x03, // div
        0x18, 0x07, // push 7
        0x04, // mod
        0x16, // size
        0x0e, // drop
        0x18, 0x01, // push 1
        0x11, // swap
        0x14, // tuck? needs three values
        0x12, // rot
        0x0e, // drop
        0x0e, // drop
        0x20, // halt
    ];
    let state = interpret(program, &[9, 9, 9]);
    assert_eq!(state.status, VmStatus::Success);
    compiles_under_every_allocator(program);
}

#[test]
fn fibonacci_partial_loop_matches_the_reference() {
    // Just the inner loop of the iterative fibonacci program, over a
    // seeded stack: c a b -> c-1 c-1 ... as the loop body leaves it.
    let program: &[u8] = &[
        0x0f, // dup
        0x14, // tuck
        0x00, // add
        0x12, // rot
        0x18, 0x01, // push 1
        0x01, // sub
        0x0f, // dup
        0x18, 0x04, // push 4
    ];
    let (a, b, c) = (10, 17, 5);
    let state = interpret(program, &[c, a, b]);
    assert_eq!(state.status, VmStatus::Success);
    assert_eq!(state.stack.size(), 5);
    assert_eq!(state.stack.peek_at(0), 4);
    assert_eq!(state.stack.peek_at(1), c - 1);
    assert_eq!(state.stack.peek_at(2), c - 1);
    assert_eq!(state.stack.peek_at(3), a + b);
    assert_eq!(state.stack.peek_at(4), b);
}

#[test]
fn optional_instructions_compile_through_their_declared_effect() {
    // accel (push 3, pop 0) with no device lowers to three zero stores.
    let program: &[u8] = &[0x87, 0x30, 0x20];
    let state = interpret(program, &[]);
    assert_eq!(state.status, VmStatus::Success);
    assert_eq!(state.stack.values(), &[0, 0, 0]);

    let buf = compile(program);
    let text = disassembly(&buf);
    assert!(text.iter().any(|t| t == "mov r2, #0"), "{text:?}");
    compiles_under_every_allocator(program);
}

#[quickcheck_macros::quickcheck]
fn interpreted_arithmetic_matches_wrapping_semantics(a: i8, b: i8) -> bool {
    let add = [0x18, a as u8, 0x18, b as u8, 0x00, 0x20];
    let sub = [0x18, a as u8, 0x18, b as u8, 0x01, 0x20];
    let mul = [0x18, a as u8, 0x18, b as u8, 0x02, 0x20];
    let (a, b) = (a as i32, b as i32);
    interpret(&add, &[]).stack.values() == [a.wrapping_add(b)]
        && interpret(&sub, &[]).stack.values() == [a.wrapping_sub(b)]
        && interpret(&mul, &[]).stack.values() == [a.wrapping_mul(b)]
}

#[test]
fn opcode_table_matches_the_specification() {
    // Spot checks pinning the opcode numbering.
    assert_eq!(Opcode::Add as u8, 0x00);
    assert_eq!(Opcode::Gt as u8, 0x0d);
    assert_eq!(Opcode::Push8 as u8, 0x18);
    assert_eq!(Opcode::Push16 as u8, 0x19);
    assert_eq!(Opcode::Halt as u8, 0x20);
}
