//! Status codes and error types for the virtual machine and the compiler.

use thiserror::Error;
use thumb_asm::EncodingFlags;

/// Result of a virtual-machine execution, fitting a single byte. Compiled
/// code stores the value directly into the state record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[repr(u8)]
pub enum VmStatus {
    /// The program ran to completion.
    Success = 0,
    /// The byte can't be mapped to any known status.
    UnknownFailure = 1,
    /// A push would have grown the stack past its base.
    StackOverflow = 2,
    /// A pop would have read past the end of the stack.
    StackUnderflow = 3,
    /// A `fetch` addressed bytes outside the code region.
    OutOfBoundsFetch = 4,
    /// Dynamic compilation failed while the program was running.
    CompilerError = 5,
}

impl core::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<u8> for VmStatus {
    fn from(b: u8) -> Self {
        use VmStatus::*;
        match b {
            0 => Success,
            2 => StackOverflow,
            3 => StackUnderflow,
            4 => OutOfBoundsFetch,
            5 => CompilerError,
            _ => UnknownFailure,
        }
    }
}

/// Errors detected while classifying the bytecode.
///
/// The first four are metadata contradictions found by the post-analysis
/// verification pass; the rest are programmer errors in the bytecode itself.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisError {
    /// A byte is marked both code and illegal.
    #[error("a code byte overlaps an illegal instruction")]
    CodeOverlapsIllegalInstruction,
    /// A basic block starts on a byte that is not code.
    #[error("basic block start is not marked as code")]
    BasicBlockStartNotCode,
    /// The double- and triple-width lookback flags contradict each other.
    #[error("inconsistent instruction width metadata")]
    InvalidWidth,
    /// A function head is missing its basic-block mark.
    #[error("function start not treated as a basic block")]
    FunctionStartNotBasicBlock,
    /// A jump whose target is not a directly preceding constant push.
    #[error("jump at offset {offset} has no compile-time constant target")]
    VariableJumpNotAllowed {
        /// Bytecode offset of the jump.
        offset: usize,
    },
    /// A jump leaving the bounds of its function.
    #[error("jump at offset {offset} targets {target}, outside the function")]
    IllegalJump {
        /// Bytecode offset of the jump.
        offset: usize,
        /// The rejected destination.
        target: i32,
    },
    /// A call to a location outside the code region.
    #[error("call at offset {offset} targets {target}, outside the code")]
    IllegalCall {
        /// Bytecode offset of the call.
        offset: usize,
        /// The rejected destination.
        target: i32,
    },
}

/// Errors raised by the register files.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    /// More of the stack was requested in registers than there are slots.
    #[error("cannot hold {requested} stack values in {available} registers")]
    TooManyValues {
        /// Stack values requested.
        requested: usize,
        /// Register slots available.
        available: usize,
    },
    /// The active allocator cannot prepare a fused comparison.
    #[error("the active register allocator does not support the comparison state")]
    ComparisonUnsupported,
}

/// Errors raised while resolving deferred link operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// The destination basic block was never emitted.
    #[error("no compiled code for bytecode offset {offset}")]
    UnresolvedDestination {
        /// Bytecode offset of the missing block.
        offset: usize,
    },
    /// Even the two-instruction fallback branch cannot span the distance.
    #[error("branch at code offset {from} cannot reach code offset {to}")]
    BranchOutOfRange {
        /// Code offset of the reserved slot.
        from: usize,
        /// Resolved destination code offset.
        to: usize,
    },
    /// A fused branch carried a condition with no inverse.
    #[error("conditional branch fallback needs an invertible condition")]
    UninvertibleCondition,
    /// A halt or bounds-error branch was requested before its handler.
    #[error("special handler was never emitted")]
    MissingSpecialHandler,
}

/// Compilation failure, one variant per pipeline stage.
#[derive(Debug, Error)]
pub enum CompileError {
    /// The static analyser rejected the bytecode.
    #[error("static analysis failed: {0}")]
    StaticAnalysis(#[from] AnalysisError),
    /// A jump or call with no compile-time constant target survived into
    /// code generation.
    #[error("unsupported non-constant jump at offset {offset}")]
    UnsupportedVariableJump {
        /// Bytecode offset of the jump.
        offset: usize,
    },
    /// A register file request could not be satisfied.
    #[error("register allocation failed: {0}")]
    RegisterAllocation(#[from] RegisterError),
    /// The encoder's sticky flags were set after emission.
    #[error("instruction encoding violated a range constraint: {0:?}")]
    InstructionEncoding(EncodingFlags),
    /// A deferred branch or call could not be resolved.
    #[error("linking failed: {0}")]
    Linker(#[from] LinkError),
}

/// Single-byte compiler status reported to observers and embedders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum CompileStatus {
    UnknownFailure = 0,
    Success = 1,
    StaticAnalysisFailed = 2,
    UnsupportedVariableJump = 3,
    RegisterAllocationError = 4,
    InstructionEncodingError = 5,
    LinkerFailed = 6,
}

impl CompileStatus {
    /// The status byte for a compilation outcome.
    pub fn of(result: &Result<(), CompileError>) -> CompileStatus {
        match result {
            Ok(()) => CompileStatus::Success,
            Err(CompileError::StaticAnalysis(_)) => CompileStatus::StaticAnalysisFailed,
            Err(CompileError::UnsupportedVariableJump { .. }) => {
                CompileStatus::UnsupportedVariableJump
            }
            Err(CompileError::RegisterAllocation(_)) => CompileStatus::RegisterAllocationError,
            Err(CompileError::InstructionEncoding(_)) => CompileStatus::InstructionEncodingError,
            Err(CompileError::Linker(_)) => CompileStatus::LinkerFailed,
        }
    }
}

impl From<u8> for CompileStatus {
    fn from(b: u8) -> Self {
        use CompileStatus::*;
        match b {
            1 => Success,
            2 => StaticAnalysisFailed,
            3 => UnsupportedVariableJump,
            4 => RegisterAllocationError,
            5 => InstructionEncodingError,
            6 => LinkerFailed,
            _ => UnknownFailure,
        }
    }
}

impl core::fmt::Display for CompileStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Errors from the persistence facade.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// A blob ended before the expected field.
    #[error("unexpected end of serialised stream")]
    UnexpectedEnd,
    /// A stored length field disagrees with the payload.
    #[error("serialised stream is inconsistent")]
    Corrupt,
}
