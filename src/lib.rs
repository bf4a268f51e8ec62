//! Just-in-time compiler and reference interpreter for the StackVM
//! bytecode, targeting ARMv6-M (Cortex-M0+) Thumb.
//!
//! The pipeline: [`analysis`] reconstructs functions and basic blocks from
//! the flat byte stream, [`compiler`] lowers each basic block to Thumb
//! through one of the [`regfile`] register files into a [`buffer`], and
//! [`linker`] patches branches and call sites once offsets are known.
//! [`interpreter`] provides the reference semantics and the helper routines
//! that compiled code shares with it.

#![warn(missing_docs)]

pub mod analysis;
pub mod buffer;
pub mod compiler;
pub mod consts;
pub mod device;
pub mod error;
pub mod interpreter;
pub mod linker;
pub mod regfile;
pub mod state;
pub mod transfer;

mod codegen;

pub mod prelude {
    //! Re-exports of the types most embedders need.

    pub use stack_asm::{BlockStackEffect, CodeIterator, Opcode, OptionalOp, Region, StackCode};
    pub use thumb_asm::{Condition, Encoder, EncodingFlags, Instruction, Register};

    pub use crate::analysis::{InstructionMetadata, StaticAnalysis};
    pub use crate::buffer::CodeBuffer;
    pub use crate::compiler::{
        compile_function_dynamically, CompilePhase, Compiler, CompilerConfig,
        ConditionalBranchMode, DynamicCallOutcome, HelperRoutines, RegisterAllocation,
        StackCheckMode,
    };
    pub use crate::device::{Device, NullDevice};
    pub use crate::error::{AnalysisError, CompileError, CompileStatus, VmStatus};
    pub use crate::interpreter::execute;
    pub use crate::linker::Linker;
    pub use crate::state::{RawVmState, VmStack, VmState};
    pub use crate::transfer::{BlobStore, MemoryStore};
}
