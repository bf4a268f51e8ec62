//! Register roles, the virtual-machine record layout, and compilation
//! parameters.

use thumb_asm::Register;

/* REGISTER ROLES */

/// Holds the address of the VM state record for the whole run.
pub const STATE_REGISTER: Register = Register::R0;

/// Holds the VM stack pointer; kept equal to the in-memory value at every
/// basic-block boundary.
pub const STACK_POINTER_REGISTER: Register = Register::R1;

/// Holds the top of the VM stack in naive state.
pub const STACK_TOP_REGISTER: Register = Register::R2;

/// General scratch register, never allocated to stack values.
pub const TEMP_REGISTER: Register = Register::R3;

/// Second scratch; only live inside the bounds check, so the register
/// allocators may also use it.
pub const TEMP_REGISTER_2: Register = Register::R4;

/// Third scratch; carries the failing check's PC into the error handlers.
pub const TEMP_REGISTER_3: Register = Register::R5;

/// Caches `VmState.stack_base` for the whole run.
pub const STACK_BASE_REGISTER: Register = Register::R8;

/// Caches `VmState.stack_end` for the whole run.
pub const STACK_END_REGISTER: Register = Register::R9;

/// The registers available for holding stack slots, in allocation order.
/// `r3` stays free as the scratch register.
pub const STACK_REGISTERS: [Register; 5] = [
    Register::R2,
    Register::R4,
    Register::R5,
    Register::R6,
    Register::R7,
];

/// Conservative worst case for how many Thumb instructions one bytecode
/// instruction can expand to. An optional instruction with a 16-bit push and
/// a non-zero pop count reaches 20; one more covers a leading register push.
pub const MAX_THUMB_PER_STACK_INSTRUCTION: usize = 21;

/// Stacks larger than this get five zero words of padding above their end so
/// that naive top-of-stack loads on an empty stack read zeros.
pub const STACK_PADDING_THRESHOLD: usize = 16;

/// Number of zero words kept above a padded stack.
pub const STACK_PADDING_WORDS: usize = 5;

/// Byte offsets of the VM state record as observed by compiled code.
///
/// The first four pointers are load-bearing: emitted instructions address
/// them with hard-coded offsets. [`crate::state::RawVmState`] is checked
/// against these constants at compile time.
pub mod layout {
    /// `+0`, the live stack pointer.
    pub const STACK_POINTER: u32 = 0;
    /// `+4`, one past the highest stack slot.
    pub const STACK_END: u32 = 4;
    /// `+8`, the lowest stack slot.
    pub const STACK_BASE: u32 = 8;
    /// `+12`, base of the bytecode.
    pub const CODE_POINTER: u32 = 12;
    /// `+16`, bytecode length in bytes.
    pub const CODE_LENGTH: u32 = 16;
    /// `+20`, interpreter program counter.
    pub const PROGRAM_COUNTER: u32 = 20;
    /// `+24`, native stack pointer captured by the entry code.
    pub const ESCAPE_STACK_ADDRESS: u32 = 24;
    /// `+28`, program counter recorded on abnormal exit.
    pub const ESCAPE_PC: u32 = 28;
    /// `+32`, bytecode offset responsible for an error exit.
    pub const ERROR_PC: u32 = 32;
    /// `+36`, compiled-entry table indexed by bytecode offset.
    pub const JUMP_TABLE: u32 = 36;
    /// `+40`, the code buffer currently executing.
    pub const ENTRY_FUNCTOR: u32 = 40;
    /// `+44`, the compiler servicing dynamic calls, if any.
    pub const COMPILER: u32 = 44;
    /// `+48`, the dynamic-compilation trampoline.
    pub const COMPILE_OR_INTERPRET: u32 = 48;
    /// `+52`, the [`crate::error::VmStatus`] byte.
    pub const STATUS: u32 = 52;
}
