//! Static analysis of the bytecode: function and basic-block discovery,
//! per-byte metadata, and the queries the code generator runs on them.

use core::fmt::Write;

use itertools::Itertools;
use stack_asm::{is_jump, BlockStackEffect, Opcode, Region, StackCode};

use crate::error::{AnalysisError, TransferError};
use crate::transfer::{BlobStore, Deserializer, Serializer};

/// Name of the persisted analysis blob.
const BLOB_NAME: &str = "sa";

bitflags::bitflags! {
    /// Per-byte classification flags.
    ///
    /// The implications `NO_RECURSION => FUNCTION_START => BASIC_BLOCK_START
    /// => CODE` and `CODE => !ILLEGAL` hold for verified metadata, and the
    /// two width flags are mutually exclusive. The width flags describe the
    /// *previous* instruction as seen from this byte and must be ignored on
    /// basic-block starts.
    pub struct InstructionMetadata: u8 {
        /// The byte can never be executed (operand bytes of a push or an
        /// optional instruction).
        const ILLEGAL = 1 << 1;
        /// The byte starts an executable instruction.
        const CODE = 1 << 2;
        /// The byte starts a basic block: the first statement is a jump
        /// destination and the last a (possibly implicit) jump.
        const BASIC_BLOCK_START = 1 << 3;
        /// The previous instruction occupied two bytes.
        const LAST_INSTRUCTION_DOUBLE_WIDTH = 1 << 4;
        /// The previous instruction occupied three bytes.
        const LAST_INSTRUCTION_TRIPLE_WIDTH = 1 << 5;
        /// The byte starts a function.
        const FUNCTION_START = 1 << 6;
        /// The function starting here performs no non-tail recursion and
        /// does not need to save the return address.
        const NO_RECURSION = 1 << 7;
    }
}

/// The first violated metadata property, if any.
pub(crate) fn violated_property(meta: InstructionMetadata) -> Option<AnalysisError> {
    if meta.contains(InstructionMetadata::NO_RECURSION) {
        if !meta.contains(InstructionMetadata::FUNCTION_START) {
            return Some(AnalysisError::FunctionStartNotBasicBlock);
        }
    } else if meta.contains(InstructionMetadata::FUNCTION_START) {
        if !meta.contains(InstructionMetadata::BASIC_BLOCK_START) {
            return Some(AnalysisError::FunctionStartNotBasicBlock);
        }
    } else if meta.contains(InstructionMetadata::LAST_INSTRUCTION_TRIPLE_WIDTH) {
        if !meta.contains(InstructionMetadata::CODE)
            || meta.contains(InstructionMetadata::LAST_INSTRUCTION_DOUBLE_WIDTH)
        {
            return Some(AnalysisError::InvalidWidth);
        }
    } else if meta.contains(InstructionMetadata::LAST_INSTRUCTION_DOUBLE_WIDTH) {
        if !meta.contains(InstructionMetadata::CODE) {
            return Some(AnalysisError::InvalidWidth);
        }
    } else if meta.contains(InstructionMetadata::BASIC_BLOCK_START) {
        if !meta.contains(InstructionMetadata::CODE) {
            return Some(AnalysisError::BasicBlockStartNotCode);
        }
    } else if meta.contains(InstructionMetadata::CODE)
        && meta.contains(InstructionMetadata::ILLEGAL)
    {
        return Some(AnalysisError::CodeOverlapsIllegalInstruction);
    }
    None
}

/// Whether the generated code for this instruction reaches a helper routine
/// through a call. A function containing any such instruction could
/// re-enter itself through the helper's own stack frame, so it must save
/// the return address.
fn implemented_with_helper_call(byte: u8) -> bool {
    match Opcode::parse(byte) {
        Some(
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Inc
            | Opcode::Dec
            | Opcode::Lt
            | Opcode::Le
            | Opcode::Eq
            | Opcode::Ge
            | Opcode::Gt
            | Opcode::Drop
            | Opcode::Dup
            | Opcode::Ndup
            | Opcode::Push8
            | Opcode::Push16
            | Opcode::Jmp
            | Opcode::Cjmp
            | Opcode::Halt
            | Opcode::Ret,
        ) => false,
        // Conservative: everything else is implemented in terms of a call.
        _ => true,
    }
}

/// Classifies every byte of the bytecode and recovers the function and
/// basic-block structure by a worklist traversal from the entry point and
/// every discovered call target.
#[derive(Debug)]
pub struct StaticAnalysis<'a> {
    source: StackCode<'a>,
    code_region: Region,
    data_region: Region,
    metadata: Vec<InstructionMetadata>,
    function_regions: Vec<Region>,
    new_function_regions: Vec<Region>,
    has_halts: bool,
    has_dynamic_calls: bool,
    tail_calls_optimised: bool,
}

impl<'a> StaticAnalysis<'a> {
    /// Analyser over `source` with tail-call optimisation enabled.
    pub fn new(source: StackCode<'a>) -> Self {
        Self::with_tail_calls(source, true)
    }

    /// Analyser over `source`; `tail_calls_optimised` controls whether
    /// recursion-free functions are marked [`InstructionMetadata::NO_RECURSION`].
    pub fn with_tail_calls(source: StackCode<'a>, tail_calls_optimised: bool) -> Self {
        Self {
            source,
            code_region: Region::default(),
            data_region: Region::default(),
            metadata: vec![InstructionMetadata::empty(); source.len()],
            function_regions: Vec::new(),
            new_function_regions: Vec::new(),
            has_halts: false,
            has_dynamic_calls: false,
            tail_calls_optimised,
        }
    }

    /// Analyses the whole program from offset zero.
    pub fn analyse(&mut self) -> Result<(), AnalysisError> {
        self.analyse_from(0)
    }

    /// Begins the analysis from a specific offset, for incremental analysis
    /// triggered by dynamic calls. Functions and basic blocks already
    /// visited are skipped; contradictions with earlier marks terminate the
    /// analysis as usual.
    ///
    /// The metadata verification is O(n) in the length of the code, not
    /// just in the newly discovered instructions, so programs are best
    /// served by few distinct dynamic call targets.
    pub fn analyse_from(&mut self, offset: usize) -> Result<(), AnalysisError> {
        self.determine_call_locations(offset)?;
        self.verify_instruction_metadata()?;
        if !self.function_regions.is_empty() {
            self.function_regions.sort();
            let mut code_region = self.function_regions[0];
            for region in &self.function_regions {
                code_region = code_region.merge(region);
            }
            self.code_region = code_region;
        }
        Ok(())
    }

    fn determine_call_locations(&mut self, offset: usize) -> Result<(), AnalysisError> {
        // function_regions is cumulative; this holds only the functions
        // discovered by this pass.
        self.new_function_regions.clear();

        let end = self.source.region().end();
        if self.source.is_empty() {
            return Ok(());
        }

        // Plain vectors drained from the front; the heads never shrink.
        let mut function_heads: Vec<usize> = vec![offset];
        let mut next_function = 0;

        while next_function < function_heads.len() {
            let f_head = function_heads[next_function];
            next_function += 1;
            if self.metadata[f_head].contains(InstructionMetadata::FUNCTION_START) {
                continue;
            }
            self.metadata[f_head] |= InstructionMetadata::FUNCTION_START;

            let mut function_has_recursive_calls = false;

            let mut block_heads: Vec<usize> = vec![f_head];
            let mut next_block = 0;
            let mut f_end = f_head;

            while next_block < block_heads.len() {
                let block_head = block_heads[next_block];
                next_block += 1;
                if self.metadata[block_head].contains(InstructionMetadata::BASIC_BLOCK_START) {
                    continue;
                }
                self.metadata[block_head] |= InstructionMetadata::BASIC_BLOCK_START;

                let block_region = Region::new(block_head, end - block_head);
                let mut iter = self.source.iter_region(block_region);
                while !iter.finished() {
                    let index = iter.index();
                    self.metadata[index] |= InstructionMetadata::CODE;

                    if index - iter.last_index() == 3 {
                        self.metadata[index] |= InstructionMetadata::LAST_INSTRUCTION_TRIPLE_WIDTH;
                    } else if index - iter.last_index() == 2 {
                        self.metadata[index] |= InstructionMetadata::LAST_INSTRUCTION_DOUBLE_WIDTH;
                    }

                    let op = iter.opcode();

                    if op == Some(Opcode::Halt) {
                        self.has_halts = true;
                    }

                    if op == Some(Opcode::Call)
                        && iter.last_was_push()
                        && iter.push_value() == f_head as i32
                    {
                        if iter.has_more_instructions() {
                            // A direct recursive call immediately followed
                            // by a return is a tail call, not recursion.
                            function_has_recursive_calls |=
                                iter.next_opcode() != Some(Opcode::Ret);
                        }
                    } else if implemented_with_helper_call(iter.byte()) {
                        function_has_recursive_calls = true;
                    }

                    match op {
                        // The next instruction is unreachable from this one.
                        Some(Opcode::Ret | Opcode::Halt) => {
                            f_end = f_end.max(index + 1);
                            break;
                        }
                        Some(jump) if is_jump(jump) => {
                            if !iter.last_was_push() {
                                return Err(AnalysisError::VariableJumpNotAllowed {
                                    offset: index,
                                });
                            }
                            let target = iter.push_value();
                            if target < f_head as i32 || target as i64 >= end as i64 {
                                return Err(AnalysisError::IllegalJump {
                                    offset: index,
                                    target,
                                });
                            }

                            // Execution falls through a conditional jump,
                            // so a new basic block starts right after it.
                            if jump == Opcode::Cjmp && iter.next_index() != block_region.end() {
                                block_heads.push(iter.next_index());
                            }

                            block_heads.push(target as usize);

                            // Step once more so that a jump ending the
                            // function still yields the right end offset.
                            iter.advance();
                            break;
                        }
                        Some(Opcode::Call) => {
                            if iter.last_was_push() {
                                let target = iter.push_value();
                                if target >= 0 && self.source.region().contains(target as usize) {
                                    function_heads.push(target as usize);
                                } else {
                                    tracing::warn!(
                                        offset = index,
                                        target,
                                        "call to illegal location"
                                    );
                                    return Err(AnalysisError::IllegalCall {
                                        offset: index,
                                        target,
                                    });
                                }
                            } else {
                                tracing::debug!(offset = index, "non-static call");
                                self.has_dynamic_calls = true;
                            }
                        }
                        _ => {}
                    }

                    iter.advance();
                }

                f_end = f_end.max(iter.index());
            }

            let function_region = Region::new(f_head, f_end - f_head);
            self.function_regions.push(function_region);
            self.new_function_regions.push(function_region);

            if !function_has_recursive_calls && self.tail_calls_optimised {
                self.metadata[f_head] |= InstructionMetadata::NO_RECURSION;
            }
        }

        Ok(())
    }

    fn verify_instruction_metadata(&self) -> Result<(), AnalysisError> {
        for meta in &self.metadata {
            if let Some(violation) = violated_property(*meta) {
                return Err(violation);
            }
        }
        Ok(())
    }

    /// The source under analysis.
    pub fn source(&self) -> StackCode<'a> {
        self.source
    }

    /// Minimal region enclosing every discovered function.
    pub fn code_region(&self) -> Region {
        self.code_region
    }

    /// Region of bytes treated as data, if any were identified externally.
    pub fn data_region(&self) -> Region {
        self.data_region
    }

    /// Every function discovered so far, sorted by start offset after a
    /// successful analysis.
    pub fn function_regions(&self) -> &[Region] {
        &self.function_regions
    }

    /// The functions discovered by the most recent analysis pass only.
    pub fn new_function_regions(&self) -> &[Region] {
        &self.new_function_regions
    }

    /// Whether any reachable `halt` instruction exists.
    pub fn has_halts(&self) -> bool {
        self.has_halts
    }

    /// Whether any call with a non-constant target was seen. The compiler
    /// must then stay attached to the state for runtime compilation.
    pub fn has_dynamic_calls(&self) -> bool {
        self.has_dynamic_calls
    }

    /// Whether byte `i` starts a function.
    pub fn is_call_destination(&self, i: usize) -> bool {
        self.metadata[i].contains(InstructionMetadata::FUNCTION_START)
    }

    /// Whether byte `i` starts a basic block.
    pub fn is_jump_destination(&self, i: usize) -> bool {
        self.metadata[i].contains(InstructionMetadata::BASIC_BLOCK_START)
    }

    /// Whether byte `i` is a call or jump destination.
    pub fn is_call_or_jump_destination(&self, i: usize) -> bool {
        self.is_call_destination(i) || self.is_jump_destination(i)
    }

    /// Whether the function starting at byte `i` must save the return
    /// address. Under the current compilation scheme this means pushing
    /// exactly one register, the link register.
    pub fn function_needs_to_push_registers(&self, i: usize) -> bool {
        !self.metadata[i].contains(InstructionMetadata::NO_RECURSION)
    }

    /// The metadata for byte `i`.
    pub fn metadata(&self, i: usize) -> InstructionMetadata {
        self.metadata[i]
    }

    /// Offset of the instruction preceding the one at `offset`, or `None`
    /// for the first instruction. Meaningless on basic-block starts, where
    /// the width flags must be ignored.
    pub fn previous_instruction_index(&self, offset: usize) -> Option<usize> {
        let width = if self.metadata[offset]
            .contains(InstructionMetadata::LAST_INSTRUCTION_TRIPLE_WIDTH)
        {
            3
        } else if self.metadata[offset].contains(InstructionMetadata::LAST_INSTRUCTION_DOUBLE_WIDTH)
        {
            2
        } else {
            1
        };
        offset.checked_sub(width)
    }

    /// The basic blocks of `function`, in layout order.
    pub fn basic_blocks_for_function(&self, function: Region) -> Vec<Region> {
        let mut blocks = Vec::new();
        let mut iter = self.source.iter_region(function);
        while !iter.finished() {
            let start = iter.index();
            iter.advance();
            while !iter.finished() && !self.is_jump_destination(iter.index()) {
                iter.advance();
            }
            blocks.push(Region::new(start, iter.index() - start));
        }
        blocks
    }

    /// The basic block beginning at `start`.
    pub fn basic_block_at(&self, start: usize) -> Region {
        let region = Region::new(start, self.source.region().end() - start);
        let mut iter = self.source.iter_region(region);
        // A basic block is at least one instruction long.
        iter.advance();
        while !iter.finished() && !self.is_jump_destination(iter.index()) {
            iter.advance();
        }
        Region::new(start, iter.index() - start)
    }

    /// Aggregate stack effect of `basic_block`.
    pub fn stack_effect(&self, basic_block: Region) -> BlockStackEffect {
        BlockStackEffect::from_iter(self.source.iter_region(basic_block))
    }

    /// Human-readable dump of the analysis, one line per instruction.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "data length = {}", self.source.len());
        let _ = writeln!(
            out,
            "code region [{}, {})",
            self.code_region.start(),
            self.code_region.end()
        );
        let _ = writeln!(
            out,
            "{}",
            if self.has_halts {
                "halt instructions"
            } else {
                "no halt instructions"
            }
        );
        for function in self.function_regions.iter().sorted() {
            let _ = writeln!(out, "function [{}, {})", function.start(), function.end());
            for block in self.basic_blocks_for_function(*function) {
                let effect = self.stack_effect(block);
                let _ = writeln!(
                    out,
                    "  basic block [{}, {}) pops {}, pushes {}, difference = {}",
                    block.start(),
                    block.end(),
                    effect.pop_count(),
                    effect.push_count(),
                    effect.height_difference()
                );
                let mut iter = self.source.iter_region(block);
                while !iter.finished() {
                    let meta = self.metadata[iter.index()];
                    let mut flags = String::new();
                    for (name, flag) in [
                        ("illegal", InstructionMetadata::ILLEGAL),
                        ("code", InstructionMetadata::CODE),
                        ("block", InstructionMetadata::BASIC_BLOCK_START),
                        ("func", InstructionMetadata::FUNCTION_START),
                        ("norec", InstructionMetadata::NO_RECURSION),
                    ] {
                        if meta.contains(flag) {
                            flags.push_str(name);
                            flags.push(' ');
                        }
                    }
                    let _ = writeln!(
                        out,
                        "    {:3} | {flags:<31}| {}",
                        iter.index(),
                        self.source.instruction_string(iter.index())
                    );
                    iter.advance();
                }
            }
        }
        out
    }

    /// Persists the regions and metadata.
    pub fn serialize(&self, store: &mut dyn BlobStore) -> Result<(), TransferError> {
        let mut s = Serializer::new();
        s.push_u32(self.code_region.start() as u32);
        s.push_u32(self.code_region.len() as u32);
        s.push_u32(self.data_region.start() as u32);
        s.push_u32(self.data_region.len() as u32);
        s.push_u8(self.has_halts as u8);
        s.push_u8(self.has_dynamic_calls as u8);

        s.push_u32(self.metadata.len() as u32);
        for meta in &self.metadata {
            s.push_u8(meta.bits());
        }

        for regions in [&self.function_regions, &self.new_function_regions] {
            s.push_u32(regions.len() as u32);
            for region in regions.iter() {
                s.push_u32(region.start() as u32);
                s.push_u32(region.len() as u32);
            }
        }
        store.write(BLOB_NAME, &s.finish())
    }

    /// Reloads previously persisted analysis results, if any were stored.
    pub fn deserialize(&mut self, store: &dyn BlobStore) -> Result<(), TransferError> {
        let Some(bytes) = store.read(BLOB_NAME)? else {
            return Ok(());
        };
        let mut d = Deserializer::new(&bytes);
        self.code_region = Region::new(d.u32()? as usize, d.u32()? as usize);
        self.data_region = Region::new(d.u32()? as usize, d.u32()? as usize);
        self.has_halts = d.u8()? != 0;
        self.has_dynamic_calls = d.u8()? != 0;

        let metadata_len = d.u32()? as usize;
        let mut metadata = Vec::with_capacity(metadata_len);
        for _ in 0..metadata_len {
            metadata.push(
                InstructionMetadata::from_bits(d.u8()?).ok_or(TransferError::Corrupt)?,
            );
        }
        self.metadata = metadata;

        for regions in [&mut self.function_regions, &mut self.new_function_regions] {
            let count = d.u32()? as usize;
            regions.clear();
            for _ in 0..count {
                regions.push(Region::new(d.u32()? as usize, d.u32()? as usize));
            }
        }
        Ok(())
    }
}
