//! Deferred branch, call, and error-handler fixups.
//!
//! During code generation the linker reserves each operation's instruction
//! budget with `nop`s and records what should go there. Once every basic
//! block's code offset is known, [`Linker::link`] rewrites the reserved
//! slots with real encodings, accounting for the destination function's
//! `push {lr}` and for any superseded bounds check that the branch may
//! skip.

use std::collections::BTreeMap;

use thumb_asm::{bits, invert_condition, Condition, Encoder, Register};

use crate::analysis::StaticAnalysis;
use crate::buffer::CodeBuffer;
use crate::consts::{STACK_POINTER_REGISTER, STACK_TOP_REGISTER, TEMP_REGISTER};
use crate::error::{LinkError, TransferError};
use crate::transfer::{BlobStore, Deserializer, Serializer};

/// Name of the persisted linker blob.
const BLOB_NAME: &str = "linker";

/// The pre-compiled stubs that branches can target before their offsets are
/// known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum SpecialHandler {
    /// The halt/unwind epilogue.
    Halt = 0,
    /// Sets `StackUnderflow` and falls into the halt handler.
    StackUnderflow = 1,
    /// Sets `StackOverflow` and falls into the halt handler.
    StackOverflow = 2,
}

/// One deferred emission. `at` is the code offset of the reserved slots.
#[derive(Debug, Clone, Copy)]
enum LinkOperation {
    /// A plain `b`; fails if the destination is unreachable.
    UnconditionalBranch {
        at: usize,
        destination: usize,
        skip: usize,
    },
    /// Materialise the branch flag, pop it, compare against zero and
    /// branch. Falls back to an inverted branch over a long `b` when the
    /// destination is out of short range.
    ConditionalBranch {
        at: usize,
        destination: usize,
        skip: usize,
    },
    /// A fused `cmp`/`b<cond>` pair over operands the register file kept
    /// live; same long-range fallback as the naive form.
    MinimalConditionalBranch {
        at: usize,
        destination: usize,
        skip: usize,
        condition: Condition,
        operands: (Register, Register),
    },
    /// A `bl` pair to the destination's compiled entry.
    Call { at: usize, destination: usize },
    /// A branch into one of the special handlers: unconditional for halt,
    /// conditional on the preceding bounds comparison otherwise.
    Special { at: usize, kind: SpecialHandler },
}

impl LinkOperation {
    /// The number of instruction slots the operation reserves.
    fn instruction_count(&self) -> usize {
        match self {
            LinkOperation::UnconditionalBranch { .. } => 1,
            LinkOperation::ConditionalBranch { .. } => 6,
            LinkOperation::MinimalConditionalBranch { .. } => 3,
            LinkOperation::Call { .. } => 2,
            LinkOperation::Special { .. } => 2,
        }
    }
}

/// Records deferred operations during code generation and resolves them to
/// final offsets afterwards. Owns the operation list until link time, then
/// releases it.
#[derive(Debug, Default)]
pub struct Linker {
    operations: Vec<LinkOperation>,
    /// bytecode offset of a basic block -> code offset of its first word.
    link_locations: BTreeMap<usize, usize>,
    special_locations: [Option<usize>; 3],
}

impl Linker {
    /// An empty linker.
    pub fn new() -> Self {
        Self::default()
    }

    fn add_operation(&mut self, buf: &mut CodeBuffer, enc: &mut Encoder, operation: LinkOperation) {
        for _ in 0..operation.instruction_count() {
            buf.push(enc.nop());
        }
        self.operations.push(operation);
    }

    /// Reserves an unconditional jump to bytecode offset `destination`.
    pub fn add_unconditional_jump(
        &mut self,
        buf: &mut CodeBuffer,
        enc: &mut Encoder,
        destination: usize,
        skip: usize,
    ) {
        let at = buf.len();
        self.add_operation(
            buf,
            enc,
            LinkOperation::UnconditionalBranch {
                at,
                destination,
                skip,
            },
        );
    }

    /// Reserves a naive conditional jump to bytecode offset `destination`.
    pub fn add_conditional_jump(
        &mut self,
        buf: &mut CodeBuffer,
        enc: &mut Encoder,
        destination: usize,
        skip: usize,
    ) {
        let at = buf.len();
        self.add_operation(
            buf,
            enc,
            LinkOperation::ConditionalBranch {
                at,
                destination,
                skip,
            },
        );
    }

    /// Reserves a fused conditional jump comparing `operands`.
    pub fn add_minimal_conditional_jump(
        &mut self,
        buf: &mut CodeBuffer,
        enc: &mut Encoder,
        destination: usize,
        skip: usize,
        condition: Condition,
        operands: (Register, Register),
    ) {
        let at = buf.len();
        self.add_operation(
            buf,
            enc,
            LinkOperation::MinimalConditionalBranch {
                at,
                destination,
                skip,
                condition,
                operands,
            },
        );
    }

    /// Reserves a call to the function at bytecode offset `destination`.
    pub fn add_call(&mut self, buf: &mut CodeBuffer, enc: &mut Encoder, destination: usize) {
        let at = buf.len();
        self.add_operation(buf, enc, LinkOperation::Call { at, destination });
    }

    /// Reserves an unconditional branch into the halt handler.
    pub fn add_halt(&mut self, buf: &mut CodeBuffer, enc: &mut Encoder) {
        let at = buf.len();
        self.add_operation(
            buf,
            enc,
            LinkOperation::Special {
                at,
                kind: SpecialHandler::Halt,
            },
        );
    }

    /// Reserves the branch taken when the preceding comparison detected an
    /// underflow.
    pub fn add_underflow_check(&mut self, buf: &mut CodeBuffer, enc: &mut Encoder) {
        let at = buf.len();
        self.add_operation(
            buf,
            enc,
            LinkOperation::Special {
                at,
                kind: SpecialHandler::StackUnderflow,
            },
        );
    }

    /// Reserves the branch taken when the preceding comparison detected an
    /// overflow.
    pub fn add_overflow_check(&mut self, buf: &mut CodeBuffer, enc: &mut Encoder) {
        let at = buf.len();
        self.add_operation(
            buf,
            enc,
            LinkOperation::Special {
                at,
                kind: SpecialHandler::StackOverflow,
            },
        );
    }

    /// Records where a special handler was emitted.
    pub fn set_special_offset(&mut self, kind: SpecialHandler, code_offset: usize) {
        self.special_locations[kind as usize] = Some(code_offset);
    }

    /// Records that the basic block at `bytecode_offset` begins at
    /// `code_offset`. Only basic-block heads should be recorded.
    pub fn set_link_offset(&mut self, bytecode_offset: usize, code_offset: usize) {
        self.link_locations.insert(bytecode_offset, code_offset);
    }

    /// Whether a compiled entry exists for the block at `bytecode_offset`.
    pub fn has_offset_for_basic_block(&self, bytecode_offset: usize) -> bool {
        self.link_locations.contains_key(&bytecode_offset)
    }

    /// Code offset of the block at `bytecode_offset`, if compiled.
    pub fn offset_for_basic_block(&self, bytecode_offset: usize) -> Option<usize> {
        self.link_locations.get(&bytecode_offset).copied()
    }

    /// Resolves every recorded operation and clears the list.
    pub fn link(
        &mut self,
        buf: &mut CodeBuffer,
        enc: &mut Encoder,
        analysis: &StaticAnalysis<'_>,
    ) -> Result<(), LinkError> {
        let operations = std::mem::take(&mut self.operations);
        for operation in &operations {
            self.link_one(operation, buf, enc, analysis)?;
        }
        Ok(())
    }

    /// Code offset a jump to `bytecode_offset` should land on: past the
    /// destination's `push {lr}` when the destination function saves the
    /// link register, plus any superseded bounds check being skipped.
    fn jump_target(
        &self,
        bytecode_offset: usize,
        skip: usize,
        analysis: &StaticAnalysis<'_>,
    ) -> Result<usize, LinkError> {
        let mut destination = self
            .offset_for_basic_block(bytecode_offset)
            .ok_or(LinkError::UnresolvedDestination {
                offset: bytecode_offset,
            })?;
        if analysis.is_call_destination(bytecode_offset)
            && analysis.function_needs_to_push_registers(bytecode_offset)
        {
            destination += 1;
        }
        Ok(destination + skip)
    }

    fn special_target(&self, kind: SpecialHandler) -> Result<usize, LinkError> {
        self.special_locations[kind as usize].ok_or(LinkError::MissingSpecialHandler)
    }

    fn link_one(
        &self,
        operation: &LinkOperation,
        buf: &mut CodeBuffer,
        enc: &mut Encoder,
        analysis: &StaticAnalysis<'_>,
    ) -> Result<(), LinkError> {
        match *operation {
            LinkOperation::UnconditionalBranch {
                at,
                destination,
                skip,
            } => {
                let target = self.jump_target(destination, skip, analysis)?;
                buf.set(
                    at,
                    enc.unconditional_branch_natural(target as i32 - at as i32),
                );
                Ok(())
            }

            LinkOperation::ConditionalBranch {
                at,
                destination,
                skip,
            } => {
                let target = self.jump_target(destination, skip, analysis)?;

                buf.set(at, enc.move_low_to_low(TEMP_REGISTER, STACK_TOP_REGISTER));
                buf.set(
                    at + 1,
                    enc.add_small_imm(STACK_POINTER_REGISTER, STACK_POINTER_REGISTER, 4),
                );
                buf.set(
                    at + 2,
                    enc.load_word_with_offset(STACK_TOP_REGISTER, STACK_POINTER_REGISTER, 0),
                );
                buf.set(at + 3, enc.compare_immediate(TEMP_REGISTER, 0));

                let short = target as i32 - (at as i32 + 4) - 2;
                if bits::fits_twos(short, 8) {
                    buf.set(at + 4, enc.conditional_branch(Condition::Ne, short));
                    buf.set(at + 5, enc.nop());
                } else {
                    let long = target as i32 - (at as i32 + 5) - 2;
                    if !bits::fits_twos(long, 11) {
                        return Err(LinkError::BranchOutOfRange {
                            from: at,
                            to: target,
                        });
                    }
                    buf.set(at + 4, enc.conditional_branch(Condition::Eq, 0));
                    buf.set(at + 5, enc.unconditional_branch(long));
                }
                Ok(())
            }

            LinkOperation::MinimalConditionalBranch {
                at,
                destination,
                skip,
                condition,
                operands,
            } => {
                let target = self.jump_target(destination, skip, analysis)?;

                buf.set(at, enc.compare_low_registers(operands.0, operands.1));

                let short = target as i32 - (at as i32 + 1) - 2;
                if bits::fits_twos(short, 8) {
                    buf.set(at + 1, enc.conditional_branch(condition, short));
                } else {
                    let long = target as i32 - (at as i32 + 2) - 2;
                    if !bits::fits_twos(long, 11) {
                        return Err(LinkError::BranchOutOfRange {
                            from: at,
                            to: target,
                        });
                    }
                    let inverted =
                        invert_condition(condition).ok_or(LinkError::UninvertibleCondition)?;
                    buf.set(at + 1, enc.conditional_branch(inverted, 0));
                    buf.set(at + 2, enc.unconditional_branch(long));
                }
                Ok(())
            }

            LinkOperation::Call { at, destination } => {
                let target = self
                    .offset_for_basic_block(destination)
                    .ok_or(LinkError::UnresolvedDestination {
                        offset: destination,
                    })?;
                let pair = enc.branch_and_link_natural(target as i32 - at as i32);
                buf.set_pair(at, pair);
                Ok(())
            }

            LinkOperation::Special { at, kind } => {
                let handler = self.special_target(kind)?;
                let near = handler as i32 - at as i32 - 2;
                match kind {
                    SpecialHandler::Halt => {
                        buf.set(at, enc.unconditional_branch(near));
                    }
                    SpecialHandler::StackOverflow => {
                        if bits::fits_twos(near, 8) {
                            buf.set(at, enc.conditional_branch(Condition::Lt, near));
                        } else {
                            let far = handler as i32 - (at as i32 + 1) - 2;
                            if !bits::fits_twos(far, 11) {
                                return Err(LinkError::BranchOutOfRange {
                                    from: at,
                                    to: handler,
                                });
                            }
                            buf.set(at, enc.conditional_branch(Condition::Ge, 0));
                            buf.set(at + 1, enc.unconditional_branch(far));
                        }
                    }
                    SpecialHandler::StackUnderflow => {
                        if bits::fits_twos(near, 8) {
                            buf.set(at, enc.conditional_branch(Condition::Gt, near));
                        } else {
                            let far = handler as i32 - (at as i32 + 1) - 2;
                            if !bits::fits_twos(far, 11) {
                                return Err(LinkError::BranchOutOfRange {
                                    from: at,
                                    to: handler,
                                });
                            }
                            buf.set(at, enc.conditional_branch(Condition::Le, 0));
                            buf.set(at + 1, enc.unconditional_branch(far));
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Drops any unresolved operations.
    pub fn clear(&mut self) {
        self.operations.clear();
    }

    /// Persists the offset map and the special-handler offsets.
    pub fn serialize(&self, store: &mut dyn BlobStore) -> Result<(), TransferError> {
        let mut s = Serializer::new();
        s.push_u32(self.link_locations.len() as u32);
        for (bytecode_offset, code_offset) in &self.link_locations {
            s.push_u32(*bytecode_offset as u32);
            s.push_u32(*code_offset as u32);
        }
        for location in self.special_locations {
            match location {
                Some(offset) => {
                    s.push_u8(1);
                    s.push_u32(offset as u32);
                }
                None => {
                    s.push_u8(0);
                    s.push_u32(0);
                }
            }
        }
        store.write(BLOB_NAME, &s.finish())
    }

    /// Reloads a previously persisted offset map, if one was stored.
    pub fn deserialize(&mut self, store: &dyn BlobStore) -> Result<(), TransferError> {
        let Some(bytes) = store.read(BLOB_NAME)? else {
            return Ok(());
        };
        let mut d = Deserializer::new(&bytes);
        let count = d.u32()? as usize;
        self.link_locations.clear();
        for _ in 0..count {
            let bytecode_offset = d.u32()? as usize;
            let code_offset = d.u32()? as usize;
            self.link_locations.insert(bytecode_offset, code_offset);
        }
        for location in self.special_locations.iter_mut() {
            let present = d.u8()? != 0;
            let offset = d.u32()? as usize;
            *location = present.then_some(offset);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::MemoryStore;
    use stack_asm::StackCode;
    use thumb_asm::{decode, decode_long_call, is_long_call};

    fn analysis_for(bytes: &'static [u8]) -> StaticAnalysis<'static> {
        let mut analysis = StaticAnalysis::new(StackCode::new(bytes));
        analysis.analyse().expect("analysis");
        analysis
    }

    // push8 1; push8 0; jmp -- a trivial loop back to offset 0
    const LOOP: &[u8] = &[0x18, 0x01, 0x18, 0x00, 0x1d];

    #[test]
    fn operations_reserve_their_budget_in_nops() {
        let mut linker = Linker::new();
        let mut buf = CodeBuffer::new();
        let mut enc = Encoder::new();

        linker.add_unconditional_jump(&mut buf, &mut enc, 0, 0);
        assert_eq!(buf.len(), 1);
        linker.add_conditional_jump(&mut buf, &mut enc, 0, 0);
        assert_eq!(buf.len(), 7);
        linker.add_minimal_conditional_jump(
            &mut buf,
            &mut enc,
            0,
            0,
            Condition::Eq,
            (Register::R4, Register::R5),
        );
        assert_eq!(buf.len(), 10);
        linker.add_call(&mut buf, &mut enc, 0);
        assert_eq!(buf.len(), 12);
        linker.add_halt(&mut buf, &mut enc);
        assert_eq!(buf.len(), 14);
        assert!(buf.words().iter().all(|w| decode(*w) == "mov r8, r8"));
    }

    #[test]
    fn unconditional_branch_resolves_backwards() {
        let analysis = analysis_for(LOOP);
        let mut linker = Linker::new();
        let mut buf = CodeBuffer::new();
        let mut enc = Encoder::new();

        // Block 0 compiled at code offset 4; the jump back sits at 10.
        linker.set_link_offset(0, 4);
        for _ in 0..10 {
            buf.push(enc.nop());
        }
        linker.add_unconditional_jump(&mut buf, &mut enc, 0, 0);
        linker.link(&mut buf, &mut enc, &analysis).unwrap();

        // The landing pad moves one slot forward only when the destination
        // function pushes lr.
        let lands_at = if analysis.function_needs_to_push_registers(0) {
            5
        } else {
            4
        };
        let by = (lands_at as i32 - 10) * 2;
        assert_eq!(
            thumb_asm::decode_with_origin(buf.word(10), 20),
            format!("b {:08x} /* by {} */", (20 + 4 + by) as u32, by)
        );
        assert!(enc.check());
    }

    #[test]
    fn short_conditional_branch_uses_one_branch() {
        let analysis = analysis_for(LOOP);
        let mut linker = Linker::new();
        let mut buf = CodeBuffer::new();
        let mut enc = Encoder::new();

        linker.set_link_offset(0, 0);
        linker.add_conditional_jump(&mut buf, &mut enc, 0, 0);
        linker.link(&mut buf, &mut enc, &analysis).unwrap();

        assert_eq!(decode(buf.word(0)), "mov r3, r2");
        assert_eq!(decode(buf.word(1)), "add r1, r1, #4");
        assert_eq!(decode(buf.word(2)), "ldr r2, [r1, #0 * 4]");
        assert_eq!(decode(buf.word(3)), "cmp r3, #0");
        assert!(decode(buf.word(4)).starts_with("bne"));
        assert_eq!(decode(buf.word(5)), "mov r8, r8");
        assert!(enc.check());
    }

    #[test]
    fn distant_conditional_branch_falls_back_to_two_branches() {
        let analysis = analysis_for(LOOP);
        let mut linker = Linker::new();
        let mut buf = CodeBuffer::new();
        let mut enc = Encoder::new();

        linker.set_link_offset(0, 0);
        for _ in 0..400 {
            buf.push(enc.nop());
        }
        linker.add_conditional_jump(&mut buf, &mut enc, 0, 0);
        linker.link(&mut buf, &mut enc, &analysis).unwrap();

        assert!(decode(buf.word(404)).starts_with("beq"));
        assert!(decode(buf.word(405)).starts_with("b "));
        assert!(enc.check());
    }

    #[test]
    fn hopeless_branch_is_a_link_error() {
        let analysis = analysis_for(LOOP);
        let mut linker = Linker::new();
        let mut buf = CodeBuffer::new();
        let mut enc = Encoder::new();

        linker.set_link_offset(0, 0);
        for _ in 0..3000 {
            buf.push(enc.nop());
        }
        linker.add_conditional_jump(&mut buf, &mut enc, 0, 0);
        let err = linker.link(&mut buf, &mut enc, &analysis).unwrap_err();
        assert!(matches!(err, LinkError::BranchOutOfRange { .. }));
    }

    #[test]
    fn fused_branch_emits_cmp_then_branch() {
        let analysis = analysis_for(LOOP);
        let mut linker = Linker::new();
        let mut buf = CodeBuffer::new();
        let mut enc = Encoder::new();

        linker.set_link_offset(0, 0);
        linker.add_minimal_conditional_jump(
            &mut buf,
            &mut enc,
            0,
            0,
            Condition::Lt,
            (Register::R4, Register::R5),
        );
        linker.link(&mut buf, &mut enc, &analysis).unwrap();

        assert_eq!(decode(buf.word(0)), "cmp r4, r5");
        assert!(decode(buf.word(1)).starts_with("blt"));
        assert_eq!(decode(buf.word(2)), "mov r8, r8");
        assert!(enc.check());
    }

    #[test]
    fn calls_become_bl_pairs() {
        let analysis = analysis_for(LOOP);
        let mut linker = Linker::new();
        let mut buf = CodeBuffer::new();
        let mut enc = Encoder::new();

        linker.set_link_offset(0, 8);
        linker.add_call(&mut buf, &mut enc, 0);
        linker.link(&mut buf, &mut enc, &analysis).unwrap();

        assert!(is_long_call(buf.word(0)));
        // Calls land on the block head itself; the lr push belongs to the
        // callee and must be executed.
        assert_eq!(
            decode_long_call(buf.word(0), buf.word(1), 0),
            format!("bl {:08x} /* by {} */", 16, 6)
        );
        assert!(enc.check());
    }

    #[test]
    fn missing_destination_is_a_link_error() {
        let analysis = analysis_for(LOOP);
        let mut linker = Linker::new();
        let mut buf = CodeBuffer::new();
        let mut enc = Encoder::new();

        linker.add_unconditional_jump(&mut buf, &mut enc, 3, 0);
        let err = linker.link(&mut buf, &mut enc, &analysis).unwrap_err();
        assert_eq!(err, LinkError::UnresolvedDestination { offset: 3 });
    }

    #[test]
    fn special_branches_reach_their_handlers() {
        let analysis = analysis_for(LOOP);
        let mut linker = Linker::new();
        let mut buf = CodeBuffer::new();
        let mut enc = Encoder::new();

        linker.set_special_offset(SpecialHandler::Halt, 40);
        linker.set_special_offset(SpecialHandler::StackOverflow, 44);
        linker.set_special_offset(SpecialHandler::StackUnderflow, 48);

        linker.add_halt(&mut buf, &mut enc);
        linker.add_overflow_check(&mut buf, &mut enc);
        linker.add_underflow_check(&mut buf, &mut enc);
        linker.link(&mut buf, &mut enc, &analysis).unwrap();

        assert!(decode(buf.word(0)).starts_with("b "));
        assert!(decode(buf.word(2)).starts_with("blt"));
        assert!(decode(buf.word(4)).starts_with("bgt"));
        assert!(enc.check());
    }

    #[test]
    fn missing_handler_is_a_link_error() {
        let analysis = analysis_for(LOOP);
        let mut linker = Linker::new();
        let mut buf = CodeBuffer::new();
        let mut enc = Encoder::new();

        linker.add_halt(&mut buf, &mut enc);
        let err = linker.link(&mut buf, &mut enc, &analysis).unwrap_err();
        assert_eq!(err, LinkError::MissingSpecialHandler);
    }

    #[test]
    fn offsets_round_trip_through_a_store() {
        let mut linker = Linker::new();
        linker.set_link_offset(0, 12);
        linker.set_link_offset(7, 30);
        linker.set_special_offset(SpecialHandler::Halt, 5);

        let mut store = MemoryStore::default();
        linker.serialize(&mut store).unwrap();

        let mut reloaded = Linker::new();
        reloaded.deserialize(&store).unwrap();
        assert_eq!(reloaded.offset_for_basic_block(0), Some(12));
        assert_eq!(reloaded.offset_for_basic_block(7), Some(30));
        assert!(!reloaded.has_offset_for_basic_block(3));
        assert_eq!(
            reloaded.special_locations[SpecialHandler::Halt as usize],
            Some(5)
        );
    }
}
