//! Lowering of analysed bytecode to Thumb machine code.

mod bounds;
mod dynamic;

pub use dynamic::{compile_function_dynamically, DynamicCallOutcome};

use stack_asm::{is_jump_or_call, is_optional, CodeIterator, Opcode, Region, StackCode};
use thumb_asm::{Condition, Encoder, Register, RegisterList};

use crate::analysis::StaticAnalysis;
use crate::buffer::CodeBuffer;
use crate::codegen::{self, PcRelativeLoad};
use crate::compiler::bounds::BoundsCheck;
use crate::consts::{
    layout, MAX_THUMB_PER_STACK_INSTRUCTION, STACK_BASE_REGISTER, STACK_END_REGISTER,
    STACK_POINTER_REGISTER, STACK_TOP_REGISTER, STATE_REGISTER, TEMP_REGISTER, TEMP_REGISTER_3,
};
use crate::device::Device;
use crate::error::{CompileError, CompileStatus, TransferError, VmStatus};
use crate::linker::{Linker, SpecialHandler};
use crate::regfile::{CowAllocator, RegisterFile, StackAllocator};
use crate::transfer::BlobStore;

/// Which register file lowers basic blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterAllocation {
    /// Memory-resident stack; only the top lives in a register.
    Naive,
    /// Rotating assignment of the top slots to registers.
    Stack,
    /// Copy-on-write assignment with compile-time constant folding.
    StackWithCopyOnWrite,
}

/// How comparisons feeding a conditional jump are lowered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionalBranchMode {
    /// Materialise the boolean, then branch on it.
    Naive,
    /// Fuse the comparison into the branch when the allocator can keep the
    /// operands live.
    FewerBranches,
}

/// Whether basic blocks verify their stack extremes on entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackCheckMode {
    /// No checks; out-of-bounds programs are undefined.
    None,
    /// Compare the projected extremes against the cached bounds registers
    /// at each block head.
    BoundsCheckInPlace,
}

/// Compile-time switches, defaulting to the shipping configuration.
#[derive(Debug, Clone, Copy)]
pub struct CompilerConfig {
    /// Register file choice.
    pub register_allocation: RegisterAllocation,
    /// Branch lowering choice.
    pub conditional_branches: ConditionalBranchMode,
    /// Bounds checking choice.
    pub stack_check: StackCheckMode,
    /// Skip a destination block's bounds check when the source block's
    /// effect supersedes it.
    pub bounds_check_elimination: bool,
    /// Mark recursion-free functions so they skip the `lr` save, and turn
    /// self-call-then-return into a plain branch.
    pub tail_calls: bool,
    /// Allow `push` constants to come from a PC-relative literal pool.
    pub pc_relative_loads: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            register_allocation: RegisterAllocation::StackWithCopyOnWrite,
            conditional_branches: ConditionalBranchMode::FewerBranches,
            stack_check: StackCheckMode::BoundsCheckInPlace,
            bounds_check_elimination: true,
            tail_calls: true,
            pc_relative_loads: false,
        }
    }
}

/// Addresses of the shared runtime routines that compiled code reaches
/// through a literal-pool load and `blx`. On a target these are the machine
/// addresses of the interpreter's helper entry points; hosts that only
/// inspect generated code may use any distinguishable values.
#[derive(Debug, Clone, Copy)]
pub struct HelperRoutines {
    /// `div` with the machine ABI.
    pub div: u32,
    /// `mod`.
    pub modulo: u32,
    /// `max`.
    pub max: u32,
    /// `min`.
    pub min: u32,
    /// `rot`.
    pub rot: u32,
    /// `nrot`.
    pub nrot: u32,
    /// `tuck`.
    pub tuck: u32,
    /// `ntuck`.
    pub ntuck: u32,
    /// `size`.
    pub size: u32,
    /// The dynamic-compilation trampoline.
    pub dynamic_call: u32,
}

impl HelperRoutines {
    /// Distinguishable placeholder addresses for hosts that never execute
    /// the emitted code.
    pub fn placeholder() -> Self {
        Self {
            div: 0x1000_0010,
            modulo: 0x1000_0020,
            max: 0x1000_0030,
            min: 0x1000_0040,
            rot: 0x1000_0050,
            nrot: 0x1000_0060,
            tuck: 0x1000_0070,
            ntuck: 0x1000_0080,
            size: 0x1000_0090,
            dynamic_call: 0x1000_00a0,
        }
    }
}

/// Observable progress of a compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilePhase {
    /// Nothing attempted yet.
    NotStarted,
    /// Static analysis finished.
    AnalysisComplete,
    /// Emitting the function with this region start.
    EmittingFunction(usize),
    /// Emitting a basic block of a function.
    EmittingBlock {
        /// Region start of the function.
        function: usize,
        /// Region start of the block.
        block: usize,
    },
    /// Resolving deferred branches and calls.
    Linking,
    /// Finished successfully.
    Done,
    /// Terminated with this status.
    Failed(CompileStatus),
}

/// Observer registration handle.
pub type ObserverId = usize;

type ObserverFn<'a> = Box<dyn FnMut(&CodeBuffer, CompileStatus) + 'a>;

/// The compiler: drives analysis, per-block lowering, and linking over a
/// caller-provided [`CodeBuffer`].
pub struct Compiler<'a> {
    source: StackCode<'a>,
    analysis: StaticAnalysis<'a>,
    device: &'a dyn Device,
    helpers: HelperRoutines,
    linker: Linker,
    encoder: Encoder,
    config: CompilerConfig,
    phase: CompilePhase,
    observers: Vec<(ObserverId, ObserverFn<'a>)>,
    next_observer_id: ObserverId,
}

impl<'a> core::fmt::Debug for Compiler<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Compiler")
            .field("phase", &self.phase)
            .field("config", &self.config)
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl<'a> Compiler<'a> {
    /// Compiler over `source` with the default configuration.
    pub fn new(source: StackCode<'a>, device: &'a dyn Device, helpers: HelperRoutines) -> Self {
        Self::with_config(source, device, helpers, CompilerConfig::default())
    }

    /// Compiler over `source` with an explicit configuration.
    pub fn with_config(
        source: StackCode<'a>,
        device: &'a dyn Device,
        helpers: HelperRoutines,
        config: CompilerConfig,
    ) -> Self {
        Self {
            source,
            analysis: StaticAnalysis::with_tail_calls(source, config.tail_calls),
            device,
            helpers,
            linker: Linker::new(),
            encoder: Encoder::new(),
            config,
            phase: CompilePhase::NotStarted,
            observers: Vec::new(),
            next_observer_id: 0,
        }
    }

    /// The analysis results, valid after a compilation attempt.
    pub fn analysis(&self) -> &StaticAnalysis<'a> {
        &self.analysis
    }

    /// The compiler's current phase.
    pub fn phase(&self) -> CompilePhase {
        self.phase
    }

    /// Whether the program performs calls through runtime values. The
    /// compiler must then stay reachable from the running program.
    pub fn has_dynamic_calls(&self) -> bool {
        self.analysis.has_dynamic_calls()
    }

    /// Compiles the whole program into `buf`.
    pub fn compile(&mut self, buf: &mut CodeBuffer) -> Result<(), CompileError> {
        let result = self.compile_general(buf, 0, true);
        self.notify_observers(buf, CompileStatus::of(&result));
        result
    }

    /// Compiles a function discovered at run time by a dynamic call. Not
    /// for general compilation.
    pub fn compile_new_function(
        &mut self,
        buf: &mut CodeBuffer,
        start: usize,
    ) -> Result<(), CompileError> {
        let result = self.compile_general(buf, start, false);
        self.notify_observers(buf, CompileStatus::of(&result));
        result
    }

    /// Entry address of the compiled code for the function at bytecode
    /// `offset`, if it has been compiled.
    pub fn function_pointer_for(&self, offset: usize, buf: &CodeBuffer) -> Option<usize> {
        self.linker
            .offset_for_basic_block(offset)
            .map(|code_offset| buf.entry_address(code_offset))
    }

    /// Registers an observer invoked with `(buffer, status)` after every
    /// top-level compile call.
    pub fn add_observer(
        &mut self,
        observer: impl FnMut(&CodeBuffer, CompileStatus) + 'a,
    ) -> ObserverId {
        self.next_observer_id += 1;
        self.observers
            .push((self.next_observer_id, Box::new(observer)));
        self.next_observer_id
    }

    /// Removes an observer; returns whether it was registered.
    pub fn remove_observer(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(observer_id, _)| *observer_id != id);
        self.observers.len() != before
    }

    fn notify_observers(&mut self, buf: &CodeBuffer, status: CompileStatus) {
        for (_, observer) in self.observers.iter_mut() {
            observer(buf, status);
        }
    }

    /// Persists the linker map and the analysis results.
    pub fn serialize(&self, store: &mut dyn BlobStore) -> Result<(), TransferError> {
        self.linker.serialize(store)?;
        self.analysis.serialize(store)
    }

    /// Reloads previously persisted compilation artefacts.
    pub fn deserialize(&mut self, store: &dyn BlobStore) -> Result<(), TransferError> {
        self.linker.deserialize(store)?;
        self.analysis.deserialize(store)
    }

    fn compile_general(
        &mut self,
        buf: &mut CodeBuffer,
        start: usize,
        compile_global: bool,
    ) -> Result<(), CompileError> {
        let result = self.compile_general_inner(buf, start, compile_global);
        if result.is_err() {
            self.phase = CompilePhase::Failed(CompileStatus::of(&result));
        }
        result
    }

    fn compile_general_inner(
        &mut self,
        buf: &mut CodeBuffer,
        start: usize,
        compile_global: bool,
    ) -> Result<(), CompileError> {
        if let Err(error) = self.analysis.analyse_from(start) {
            tracing::warn!(%error, "static analysis failed");
            tracing::debug!("\n{}", self.analysis.summary());
            return Err(CompileError::StaticAnalysis(error));
        }
        tracing::debug!("\n{}", self.analysis.summary());
        self.phase = CompilePhase::AnalysisComplete;

        let functions: Vec<Region> = self.analysis.new_function_regions().to_vec();

        self.encoder.reset();

        if compile_global {
            // Halt support is always compiled so error conditions have
            // somewhere to land, even for programs with no reachable halt.
            self.compile_entry_code(buf);

            if !functions.is_empty() {
                self.linker.add_call(buf, &mut self.encoder, 0);
            }

            self.compile_halt_code(buf);
            if self.config.stack_check != StackCheckMode::None {
                self.compile_stack_overflow_code(buf);
                self.compile_stack_underflow_code(buf);
            }
        }

        for function in functions {
            self.phase = CompilePhase::EmittingFunction(function.start());
            self.compile_function(buf, function)?;
        }

        self.phase = CompilePhase::Linking;
        self.linker.link(buf, &mut self.encoder, &self.analysis)?;

        if !self.encoder.check() {
            tracing::warn!(flags = ?self.encoder.flags(), "encoding flags not OK");
            return Err(CompileError::InstructionEncoding(self.encoder.flags()));
        }

        buf.commit();
        self.phase = CompilePhase::Done;
        Ok(())
    }

    fn compile_function(
        &mut self,
        buf: &mut CodeBuffer,
        function: Region,
    ) -> Result<(), CompileError> {
        let mut relative_loads: Vec<PcRelativeLoad> = Vec::new();

        for block in self.analysis.basic_blocks_for_function(function) {
            self.phase = CompilePhase::EmittingBlock {
                function: function.start(),
                block: block.start(),
            };
            match self.config.register_allocation {
                RegisterAllocation::Naive => {
                    self.compile_basic_block_naive(buf, block, function, &mut relative_loads)?
                }
                RegisterAllocation::Stack | RegisterAllocation::StackWithCopyOnWrite => {
                    self.compile_basic_block_stack(buf, block, function)?
                }
            }
        }

        // Every code path should have terminated by now; halt rather than
        // running into the next section.
        self.compile_halt(buf);

        // The literal pool for this function's PC-relative loads.
        if !relative_loads.is_empty() {
            if buf.len() % 2 == 1 {
                buf.push(self.encoder.nop());
            }
            for load in &relative_loads {
                load.insert_data(buf, &mut self.encoder);
            }
        }

        Ok(())
    }

    fn skip_distance_for_branch(&self, current_block: Region, destination: usize) -> usize {
        let destination_block = self.analysis.basic_block_at(destination);
        let self_effect = self.analysis.stack_effect(current_block);
        let destination_effect = self.analysis.stack_effect(destination_block);
        if self.config.bounds_check_elimination && self_effect.supersedes(&destination_effect) {
            BoundsCheck::instruction_count(destination_effect, self.config.stack_check)
        } else {
            0
        }
    }

    fn compile_block_preamble(&mut self, buf: &mut CodeBuffer, block: Region) {
        self.linker.set_link_offset(block.start(), buf.len());

        if self.analysis.is_call_destination(block.start())
            && self.analysis.function_needs_to_push_registers(block.start())
        {
            buf.push(self.encoder.push_multiple(true, RegisterList::empty()));
        }

        if self.config.stack_check != StackCheckMode::None {
            BoundsCheck::emit(
                self.analysis.stack_effect(block),
                buf,
                &mut self.encoder,
                &mut self.linker,
                self.config.stack_check,
            );
        }
    }

    /// The naive lowering: the whole stack lives in memory, `r2` caches the
    /// top, and every instruction loads what it needs.
    fn compile_basic_block_naive(
        &mut self,
        buf: &mut CodeBuffer,
        block: Region,
        function: Region,
        relative_loads: &mut Vec<PcRelativeLoad>,
    ) -> Result<(), CompileError> {
        let mut push_instructions = 0usize;

        let mut iter = self.source.iter_region(block);
        while !iter.finished() {
            let remaining_estimate =
                (function.end() - iter.index()) * MAX_THUMB_PER_STACK_INSTRUCTION;

            if iter.index() == block.start() {
                self.compile_block_preamble(buf, block);
            }

            match iter.opcode() {
                Some(Opcode::Add) => compile_add(buf, &mut self.encoder),
                Some(Opcode::Sub) => compile_sub(buf, &mut self.encoder),
                Some(Opcode::Mul) => compile_mul(buf, &mut self.encoder),
                Some(Opcode::Div) => {
                    codegen::c_function_call(buf, &mut self.encoder, self.helpers.div, true)
                }
                Some(Opcode::Mod) => {
                    codegen::c_function_call(buf, &mut self.encoder, self.helpers.modulo, true)
                }
                Some(Opcode::Inc) => {
                    let word = self
                        .encoder
                        .add_small_imm(STACK_TOP_REGISTER, STACK_TOP_REGISTER, 1);
                    buf.push(word);
                }
                Some(Opcode::Dec) => {
                    let word = self
                        .encoder
                        .sub_small_imm(STACK_TOP_REGISTER, STACK_TOP_REGISTER, 1);
                    buf.push(word);
                }
                Some(Opcode::Max) => {
                    codegen::c_function_call(buf, &mut self.encoder, self.helpers.max, true)
                }
                Some(Opcode::Min) => {
                    codegen::c_function_call(buf, &mut self.encoder, self.helpers.min, true)
                }
                Some(Opcode::Lt) => compile_conditional(buf, &mut self.encoder, Condition::Lt),
                Some(Opcode::Le) => compile_conditional(buf, &mut self.encoder, Condition::Le),
                Some(Opcode::Eq) => compile_conditional(buf, &mut self.encoder, Condition::Eq),
                Some(Opcode::Ge) => compile_conditional(buf, &mut self.encoder, Condition::Ge),
                Some(Opcode::Gt) => compile_conditional(buf, &mut self.encoder, Condition::Gt),
                Some(Opcode::Drop) => compile_drop(buf, &mut self.encoder),
                Some(Opcode::Dup) => compile_dup(buf, &mut self.encoder),
                Some(Opcode::Ndup) => compile_ndup(buf, &mut self.encoder),
                Some(Opcode::Swap) => compile_swap(buf, &mut self.encoder),
                Some(Opcode::Rot) => {
                    codegen::c_function_call(buf, &mut self.encoder, self.helpers.rot, true)
                }
                Some(Opcode::Nrot) => {
                    codegen::c_function_call(buf, &mut self.encoder, self.helpers.nrot, true)
                }
                Some(Opcode::Tuck) => {
                    codegen::c_function_call(buf, &mut self.encoder, self.helpers.tuck, true)
                }
                Some(Opcode::Ntuck) => {
                    codegen::c_function_call(buf, &mut self.encoder, self.helpers.ntuck, true)
                }
                Some(Opcode::Size) => {
                    codegen::c_function_call(buf, &mut self.encoder, self.helpers.size, true)
                }
                Some(Opcode::Nrnd) => self.compile_device_or_effect(buf, Opcode::Nrnd as u8, 1, 1),
                Some(Opcode::Push8 | Opcode::Push16) => {
                    if iter.current_is_safe_push()
                        && !(iter.has_more_instructions()
                            && iter.next_opcode().is_some_and(is_jump_or_call))
                    {
                        // The estimate is extremely conservative; it only
                        // needs to keep the literal pool within reach.
                        let allow_pool = self.config.pc_relative_loads
                            && push_instructions + remaining_estimate < 0xff;
                        compile_push(
                            buf,
                            &mut self.encoder,
                            iter.push_value(),
                            allow_pool,
                            relative_loads,
                        );
                        push_instructions += 1;
                    }
                }
                Some(Opcode::Fetch) => compile_fetch(
                    buf,
                    &mut self.encoder,
                    STACK_TOP_REGISTER,
                    STACK_TOP_REGISTER,
                ),
                Some(Opcode::Jmp) => self.compile_jump(buf, &iter, block, false)?,
                Some(Opcode::Cjmp) => self.compile_jump(buf, &iter, block, true)?,
                Some(Opcode::Call) => self.compile_call(buf, &mut iter, block, function),
                Some(Opcode::Ret) => {
                    if self
                        .analysis
                        .function_needs_to_push_registers(function.start())
                    {
                        compile_return_with_pop(buf, &mut self.encoder);
                    } else {
                        compile_return(buf, &mut self.encoder);
                    }
                }
                Some(Opcode::Halt) => self.compile_halt(buf),
                Some(Opcode::Wait) => self.compile_device_or_effect(buf, Opcode::Wait as u8, 0, 1),
                _ => {
                    if is_optional(iter.byte()) {
                        let effect = self.source.byte(iter.index() + 1);
                        self.compile_optional(buf, iter.byte(), effect);
                    }
                }
            }

            iter.advance();
        }
        Ok(())
    }

    /// The register-allocated lowering shared by the rotating and
    /// copy-on-write files.
    fn compile_basic_block_stack(
        &mut self,
        buf: &mut CodeBuffer,
        block: Region,
        function: Region,
    ) -> Result<(), CompileError> {
        let function_returns_via_pop = self
            .analysis
            .function_needs_to_push_registers(function.start());

        self.compile_block_preamble(buf, block);

        let mut registers: Box<dyn RegisterFile> =
            if self.config.register_allocation == RegisterAllocation::Stack {
                Box::new(StackAllocator::new())
            } else {
                Box::new(CowAllocator::new())
            };
        let regs = registers.as_mut();

        let fused_branches = self.config.conditional_branches
            == ConditionalBranchMode::FewerBranches
            && self.config.register_allocation == RegisterAllocation::StackWithCopyOnWrite;

        let mut iter = self.source.iter_region(block);
        while !iter.finished() {
            match iter.opcode() {
                Some(op @ (Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Max | Opcode::Min)) => {
                    compile_two_operand_native_op(buf, &mut self.encoder, regs, op)?;
                }
                Some(op @ (Opcode::Lt | Opcode::Le | Opcode::Eq | Opcode::Ge | Opcode::Gt)) => {
                    if fused_branches && iter.next_are_push_and_cjmp() {
                        // The branch consuming this comparison will fuse it
                        // into a cmp/b<cond> pair; skip the boolean.
                        regs.return_to_comparison_state(buf, &mut self.encoder)?;
                    } else {
                        compile_two_operand_native_op(buf, &mut self.encoder, regs, op)?;
                    }
                }
                Some(Opcode::Div) => {
                    regs.return_to_naive_state(buf, &mut self.encoder)?;
                    codegen::c_function_call(buf, &mut self.encoder, self.helpers.div, true);
                }
                Some(Opcode::Mod) => {
                    regs.return_to_naive_state(buf, &mut self.encoder)?;
                    codegen::c_function_call(buf, &mut self.encoder, self.helpers.modulo, true);
                }
                Some(Opcode::Nrnd) => {
                    regs.return_to_naive_state(buf, &mut self.encoder)?;
                    self.compile_device_or_effect(buf, Opcode::Nrnd as u8, 1, 1);
                }
                Some(Opcode::Nrot) => {
                    regs.return_to_naive_state(buf, &mut self.encoder)?;
                    codegen::c_function_call(buf, &mut self.encoder, self.helpers.nrot, true);
                }
                Some(Opcode::Size) => {
                    regs.return_to_naive_state(buf, &mut self.encoder)?;
                    codegen::c_function_call(buf, &mut self.encoder, self.helpers.size, true);
                }
                Some(Opcode::Wait) => {
                    regs.return_to_naive_state(buf, &mut self.encoder)?;
                    self.compile_device_or_effect(buf, Opcode::Wait as u8, 0, 1);
                }
                Some(Opcode::Ntuck) => {
                    let top = regs.read_register(0);
                    let mut handled = false;
                    if regs.register_value_is_known(top) {
                        let value = regs.known_register_value(top);
                        if (1..=4).contains(&value) {
                            regs.pop();
                            handled = regs.ntuck(value, buf, &mut self.encoder)?;
                        }
                    }
                    if !handled {
                        regs.return_to_naive_state(buf, &mut self.encoder)?;
                        codegen::c_function_call(buf, &mut self.encoder, self.helpers.ntuck, true);
                    }
                }
                Some(Opcode::Ndup) => {
                    // The naive sequence is the best this can do.
                    regs.return_to_naive_state(buf, &mut self.encoder)?;
                    compile_ndup(buf, &mut self.encoder);
                }
                Some(op @ (Opcode::Inc | Opcode::Dec)) => {
                    compile_one_operand_native_op(buf, &mut self.encoder, regs, op)?;
                }
                Some(Opcode::Push8 | Opcode::Push16) => {
                    if iter.current_is_safe_push()
                        && !(iter.has_more_instructions()
                            && iter.next_opcode().is_some_and(is_jump_or_call))
                    {
                        let destination = regs.push(buf, &mut self.encoder);
                        regs.set_known_register_value(
                            destination,
                            iter.push_value(),
                            buf,
                            &mut self.encoder,
                        );
                    }
                }
                Some(Opcode::Drop) => regs.drop_top(buf, &mut self.encoder)?,
                Some(Opcode::Dup) => regs.dup(buf, &mut self.encoder)?,
                Some(Opcode::Rot) => regs.rot(buf, &mut self.encoder)?,
                Some(Opcode::Swap) => regs.swap(buf, &mut self.encoder)?,
                Some(Opcode::Tuck) => regs.tuck(buf, &mut self.encoder)?,
                Some(Opcode::Fetch) => {
                    regs.commit_stack_slot(0, buf, &mut self.encoder);
                    let from = regs.read_register(0);
                    let to = regs.top_writeback_register();
                    compile_fetch(buf, &mut self.encoder, from, to);
                }
                Some(Opcode::Jmp) => {
                    regs.return_to_naive_state(buf, &mut self.encoder)?;
                    self.compile_jump(buf, &iter, block, false)?;
                }
                Some(Opcode::Cjmp) => {
                    if iter.last_was_push() {
                        let destination = iter.push_value() as usize;
                        let skip = self.skip_distance_for_branch(block, destination);

                        // The destination's bounds check is only elided on
                        // the taken edge; the fall-through block checks
                        // itself.
                        if fused_branches && iter.two_prev_was_condition() {
                            let condition =
                                Opcode::parse(self.source.byte(iter.n_previous_index(2)))
                                    .and_then(condition_for)
                                    .unwrap_or(Condition::Eq);
                            let operands = regs.comparison_registers();
                            self.linker.add_minimal_conditional_jump(
                                buf,
                                &mut self.encoder,
                                destination,
                                skip,
                                condition,
                                operands,
                            );
                        } else {
                            regs.return_to_naive_state(buf, &mut self.encoder)?;
                            self.linker.add_conditional_jump(
                                buf,
                                &mut self.encoder,
                                destination,
                                skip,
                            );
                        }
                    } else {
                        tracing::warn!(
                            offset = iter.index(),
                            "unsupported non-constant conditional jump"
                        );
                        return Err(CompileError::UnsupportedVariableJump {
                            offset: iter.index(),
                        });
                    }
                }
                Some(Opcode::Call) => {
                    regs.return_to_naive_state(buf, &mut self.encoder)?;
                    self.compile_call(buf, &mut iter, block, function);
                }
                Some(Opcode::Ret) => {
                    regs.return_to_naive_state(buf, &mut self.encoder)?;
                    if function_returns_via_pop {
                        compile_return_with_pop(buf, &mut self.encoder);
                    } else {
                        compile_return(buf, &mut self.encoder);
                    }
                }
                Some(Opcode::Halt) => {
                    regs.return_to_naive_state(buf, &mut self.encoder)?;
                    self.compile_halt(buf);
                }
                _ => {
                    if is_optional(iter.byte()) {
                        regs.return_to_naive_state(buf, &mut self.encoder)?;
                        let effect = self.source.byte(iter.index() + 1);
                        self.compile_optional(buf, iter.byte(), effect);
                    }
                }
            }

            iter.advance();
        }

        if !registers.in_naive_state() {
            registers.return_to_naive_state(buf, &mut self.encoder)?;
        }
        Ok(())
    }

    /// Emits a jump with a compile-time constant destination; anything else
    /// is unsupported.
    fn compile_jump(
        &mut self,
        buf: &mut CodeBuffer,
        iter: &CodeIterator<'_>,
        block: Region,
        conditional: bool,
    ) -> Result<(), CompileError> {
        if !iter.last_was_push() {
            tracing::warn!(offset = iter.index(), "unsupported non-constant jump");
            return Err(CompileError::UnsupportedVariableJump {
                offset: iter.index(),
            });
        }
        let destination = iter.push_value() as usize;
        let skip = self.skip_distance_for_branch(block, destination);
        if conditional {
            self.linker
                .add_conditional_jump(buf, &mut self.encoder, destination, skip);
        } else {
            self.linker
                .add_unconditional_jump(buf, &mut self.encoder, destination, skip);
        }
        Ok(())
    }

    /// Shared call lowering, so tail calls work under every allocator. The
    /// register file has already been returned to naive state.
    fn compile_call(
        &mut self,
        buf: &mut CodeBuffer,
        iter: &mut CodeIterator<'_>,
        block: Region,
        function: Region,
    ) {
        if iter.last_was_push() {
            let destination = iter.push_value() as usize;
            if !self
                .analysis
                .function_needs_to_push_registers(function.start())
                && !self.analysis.function_needs_to_push_registers(destination)
                && iter.has_more_instructions()
                && iter.next_opcode() == Some(Opcode::Ret)
            {
                // A call in a leaf function directly followed by a return
                // is a tail call: branch instead, and skip the return.
                let skip = self.skip_distance_for_branch(block, destination);
                self.linker
                    .add_unconditional_jump(buf, &mut self.encoder, destination, skip);
                iter.advance();
            } else {
                self.linker.add_call(buf, &mut self.encoder, destination);
            }
        } else {
            compile_dynamic_call(buf, &mut self.encoder, &self.helpers);
        }
    }

    fn compile_halt(&mut self, buf: &mut CodeBuffer) {
        self.linker.add_halt(buf, &mut self.encoder);
    }

    /// Prologue: save the callee-saved low and high registers, capture the
    /// native stack pointer, and cache the stack bounds in `r8`/`r9`.
    fn compile_entry_code(&mut self, buf: &mut CodeBuffer) {
        let enc = &mut self.encoder;
        let low_saves = RegisterList::R4 | RegisterList::R5 | RegisterList::R6 | RegisterList::R7;

        buf.push(enc.push_multiple(true, low_saves));
        buf.push(enc.move_general(Register::R4, Register::R8));
        buf.push(enc.move_general(Register::R5, Register::R9));
        buf.push(enc.move_general(Register::R6, Register::R10));
        buf.push(enc.move_general(Register::R7, Register::R11));
        buf.push(enc.push_multiple(false, low_saves));

        buf.push(enc.move_general(TEMP_REGISTER, Register::SP));
        buf.push(enc.store_word_with_offset(
            TEMP_REGISTER,
            STATE_REGISTER,
            (layout::ESCAPE_STACK_ADDRESS / 4) as u8,
        ));

        buf.push(enc.load_word_with_offset(
            TEMP_REGISTER,
            STATE_REGISTER,
            (layout::STACK_END / 4) as u8,
        ));
        buf.push(enc.move_general(STACK_END_REGISTER, TEMP_REGISTER));
        buf.push(enc.load_word_with_offset(
            TEMP_REGISTER,
            STATE_REGISTER,
            (layout::STACK_BASE / 4) as u8,
        ));
        buf.push(enc.move_general(STACK_BASE_REGISTER, TEMP_REGISTER));
    }

    /// Epilogue: write the machine state back, restore the native stack
    /// pointer and both register save sets, and return to the host.
    fn compile_halt_code(&mut self, buf: &mut CodeBuffer) {
        self.linker
            .set_special_offset(SpecialHandler::Halt, buf.len());

        let enc = &mut self.encoder;
        codegen::write_state_to_memory(buf, enc);

        buf.push(enc.load_word_with_offset(
            TEMP_REGISTER,
            STATE_REGISTER,
            (layout::ESCAPE_STACK_ADDRESS / 4) as u8,
        ));
        buf.push(enc.move_general(Register::SP, TEMP_REGISTER));

        let low_saves = RegisterList::R4 | RegisterList::R5 | RegisterList::R6 | RegisterList::R7;
        buf.push(enc.pop_multiple(false, low_saves));
        buf.push(enc.move_general(Register::R8, Register::R4));
        buf.push(enc.move_general(Register::R9, Register::R5));
        buf.push(enc.move_general(Register::R10, Register::R6));
        buf.push(enc.move_general(Register::R11, Register::R7));
        buf.push(enc.pop_multiple(true, low_saves));
    }

    /// The overflow stub: the bounds check leaves its PC in `r5`.
    fn compile_stack_overflow_code(&mut self, buf: &mut CodeBuffer) {
        self.linker
            .set_special_offset(SpecialHandler::StackOverflow, buf.len());
        self.compile_bounds_error_code(buf, VmStatus::StackOverflow);
    }

    /// The underflow stub, mirroring the overflow stub.
    fn compile_stack_underflow_code(&mut self, buf: &mut CodeBuffer) {
        self.linker
            .set_special_offset(SpecialHandler::StackUnderflow, buf.len());
        self.compile_bounds_error_code(buf, VmStatus::StackUnderflow);
    }

    fn compile_bounds_error_code(&mut self, buf: &mut CodeBuffer, status: VmStatus) {
        let enc = &mut self.encoder;
        buf.push(enc.store_word_with_offset(
            TEMP_REGISTER_3,
            STATE_REGISTER,
            (layout::ERROR_PC / 4) as u8,
        ));
        buf.push(enc.move_immediate(TEMP_REGISTER, status as u8));
        buf.push(enc.store_word_with_offset(
            TEMP_REGISTER,
            STATE_REGISTER,
            (layout::STATUS / 4) as u8,
        ));
        self.compile_halt(buf);
    }

    /// Optional instructions resolve through the device; with no routine
    /// available the declared stack effect is applied instead.
    fn compile_optional(&mut self, buf: &mut CodeBuffer, opcode: u8, effect: u8) {
        self.compile_device_or_effect(
            buf,
            opcode,
            stack_asm::optional_push_count(effect),
            stack_asm::optional_pop_count(effect),
        );
    }

    /// Calls the device routine for `opcode` if one resolves; otherwise
    /// adjusts the stack by the declared effect, zero-filling any pushed
    /// slots.
    fn compile_device_or_effect(
        &mut self,
        buf: &mut CodeBuffer,
        opcode: u8,
        push_count: u32,
        pop_count: u32,
    ) {
        let enc = &mut self.encoder;
        if let Some(address) = self.device.resolve(opcode) {
            codegen::c_function_call(buf, enc, address, true);
            return;
        }

        if push_count == pop_count {
            return;
        }

        if pop_count == 0 {
            buf.push(enc.store_word_with_offset(STACK_TOP_REGISTER, STACK_POINTER_REGISTER, 0));
        } else {
            buf.push(enc.add_large_imm(STACK_POINTER_REGISTER, (pop_count * 4) as u8));
        }

        if push_count > 0 {
            buf.push(enc.move_immediate(STACK_TOP_REGISTER, 0));
            buf.push(enc.sub_large_imm(STACK_POINTER_REGISTER, (push_count * 4) as u8));
            for slot in 0..push_count {
                buf.push(enc.store_word_with_offset(
                    STACK_TOP_REGISTER,
                    STACK_POINTER_REGISTER,
                    slot as u8,
                ));
            }
        } else {
            buf.push(enc.load_word_with_offset(STACK_TOP_REGISTER, STACK_POINTER_REGISTER, 0));
        }
    }
}

/// The condition a comparison opcode branches on.
fn condition_for(op: Opcode) -> Option<Condition> {
    Some(match op {
        Opcode::Lt => Condition::Lt,
        Opcode::Le => Condition::Le,
        Opcode::Eq => Condition::Eq,
        Opcode::Ge => Condition::Ge,
        Opcode::Gt => Condition::Gt,
        _ => return None,
    })
}

fn compile_add(buf: &mut CodeBuffer, enc: &mut Encoder) {
    codegen::pop_next_to_temp(buf, enc);
    buf.push(enc.add_reg(STACK_TOP_REGISTER, STACK_TOP_REGISTER, TEMP_REGISTER));
}

fn compile_sub(buf: &mut CodeBuffer, enc: &mut Encoder) {
    codegen::pop_next_to_temp(buf, enc);
    buf.push(enc.sub_reg(STACK_TOP_REGISTER, TEMP_REGISTER, STACK_TOP_REGISTER));
}

fn compile_mul(buf: &mut CodeBuffer, enc: &mut Encoder) {
    codegen::pop_next_to_temp(buf, enc);
    buf.push(enc.mul(STACK_TOP_REGISTER, TEMP_REGISTER));
}

/// Materialises a comparison's boolean into `r2`.
fn compile_conditional(buf: &mut CodeBuffer, enc: &mut Encoder, condition: Condition) {
    codegen::pop_next_to_temp(buf, enc);
    buf.push(enc.compare_low_registers(TEMP_REGISTER, STACK_TOP_REGISTER));
    buf.push(enc.conditional_branch(condition, 1));
    buf.push(enc.move_immediate(STACK_TOP_REGISTER, 0));
    buf.push(enc.unconditional_branch(0));
    buf.push(enc.move_immediate(STACK_TOP_REGISTER, 1));
}

fn compile_drop(buf: &mut CodeBuffer, enc: &mut Encoder) {
    buf.push(enc.add_small_imm(STACK_POINTER_REGISTER, STACK_POINTER_REGISTER, 4));
    buf.push(enc.load_word_with_offset(STACK_TOP_REGISTER, STACK_POINTER_REGISTER, 0));
}

fn compile_dup(buf: &mut CodeBuffer, enc: &mut Encoder) {
    buf.push(enc.store_word_with_offset(STACK_TOP_REGISTER, STACK_POINTER_REGISTER, 0));
    buf.push(enc.sub_small_imm(STACK_POINTER_REGISTER, STACK_POINTER_REGISTER, 4));
}

fn compile_ndup(buf: &mut CodeBuffer, enc: &mut Encoder) {
    // Scale the index to a word offset, then index the stack directly.
    buf.push(enc.logical_shift_left_immediate(STACK_TOP_REGISTER, STACK_TOP_REGISTER, 2));
    buf.push(enc.load_word_with_register_offset(
        STACK_TOP_REGISTER,
        STACK_POINTER_REGISTER,
        STACK_TOP_REGISTER,
    ));
}

fn compile_swap(buf: &mut CodeBuffer, enc: &mut Encoder) {
    buf.push(enc.load_word_with_offset(TEMP_REGISTER, STACK_POINTER_REGISTER, 1));
    buf.push(enc.store_word_with_offset(STACK_TOP_REGISTER, STACK_POINTER_REGISTER, 1));
    buf.push(enc.move_low_to_low(STACK_TOP_REGISTER, TEMP_REGISTER));
}

/// Pushes a constant in the naive lowering.
fn compile_push(
    buf: &mut CodeBuffer,
    enc: &mut Encoder,
    value: i32,
    allow_pc_relative_load: bool,
    relative_loads: &mut Vec<PcRelativeLoad>,
) {
    buf.push(enc.store_word_with_offset(STACK_TOP_REGISTER, STACK_POINTER_REGISTER, 0));
    buf.push(enc.sub_small_imm(STACK_POINTER_REGISTER, STACK_POINTER_REGISTER, 4));
    if allow_pc_relative_load && !(0..=0xff).contains(&value) {
        relative_loads.push(PcRelativeLoad::new(buf, enc, value, STACK_TOP_REGISTER));
    } else {
        codegen::load_constant(buf, enc, value, STACK_TOP_REGISTER);
    }
}

/// Loads a sign-extended 16-bit value from `code_base + from` into `to`.
fn compile_fetch(buf: &mut CodeBuffer, enc: &mut Encoder, from: Register, to: Register) {
    buf.push(enc.load_word_with_offset(
        TEMP_REGISTER,
        STATE_REGISTER,
        (layout::CODE_POINTER / 4) as u8,
    ));
    buf.push(enc.add_reg(TEMP_REGISTER, TEMP_REGISTER, from));
    buf.push(enc.load_byte_with_offset(to, TEMP_REGISTER, 0));
    buf.push(enc.add_small_imm(TEMP_REGISTER, TEMP_REGISTER, 1));
    buf.push(enc.load_byte_with_offset(TEMP_REGISTER, TEMP_REGISTER, 0));
    buf.push(enc.logical_shift_left_immediate(TEMP_REGISTER, TEMP_REGISTER, 8));
    buf.push(enc.add_reg(to, to, TEMP_REGISTER));
    buf.push(enc.sign_extend_half_word(to, to));
}

fn compile_return(buf: &mut CodeBuffer, enc: &mut Encoder) {
    buf.push(enc.ret());
}

fn compile_return_with_pop(buf: &mut CodeBuffer, enc: &mut Encoder) {
    buf.push(enc.pop_multiple(true, RegisterList::empty()));
}

/// Tail call into the dynamic-compilation trampoline.
fn compile_dynamic_call(buf: &mut CodeBuffer, enc: &mut Encoder, helpers: &HelperRoutines) {
    codegen::c_function_call(buf, enc, helpers.dynamic_call | 0x1, false);
}

/// Lowers `inc`/`dec`, folding when the operand is a known constant.
fn compile_one_operand_native_op(
    buf: &mut CodeBuffer,
    enc: &mut Encoder,
    regs: &mut dyn RegisterFile,
    op: Opcode,
) -> Result<(), CompileError> {
    regs.ensure_registers_hold(1, buf, enc)?;

    let top = regs.pop();
    let top_is_known = regs.register_value_is_known(top);
    let top_value = regs.known_register_value(top);

    let destination = regs.push(buf, enc);

    if top_is_known {
        let folded = match op {
            Opcode::Inc => top_value.wrapping_add(1),
            _ => top_value.wrapping_sub(1),
        };
        regs.set_known_register_value(destination, folded, buf, enc);
    } else {
        regs.commit_register(top, buf, enc);
        match op {
            Opcode::Inc => buf.push(enc.add_small_imm(destination, top, 1)),
            _ => buf.push(enc.sub_small_imm(destination, top, 1)),
        }
    }

    Ok(())
}

/// Lowers the two-operand arithmetic and comparison opcodes, folding when
/// both operands are known constants.
fn compile_two_operand_native_op(
    buf: &mut CodeBuffer,
    enc: &mut Encoder,
    regs: &mut dyn RegisterFile,
    op: Opcode,
) -> Result<(), CompileError> {
    regs.ensure_registers_hold(2, buf, enc)?;

    let top1 = regs.pop();
    let top2 = regs.pop();

    let top1_known = regs.register_value_is_known(top1);
    let top2_known = regs.register_value_is_known(top2);

    if !(top1_known && top2_known) {
        regs.commit_register(top1, buf, enc);
        regs.commit_register(top2, buf, enc);
    }

    let top1_value = regs.known_register_value(top1);
    let top2_value = regs.known_register_value(top2);

    let destination = regs.push(buf, enc);

    if top1_known && top2_known {
        let folded = match op {
            Opcode::Add => top2_value.wrapping_add(top1_value),
            Opcode::Sub => top2_value.wrapping_sub(top1_value),
            Opcode::Mul => top2_value.wrapping_mul(top1_value),
            Opcode::Max => top2_value.max(top1_value),
            Opcode::Min => top2_value.min(top1_value),
            Opcode::Lt => (top2_value < top1_value) as i32,
            Opcode::Le => (top2_value <= top1_value) as i32,
            Opcode::Eq => (top2_value == top1_value) as i32,
            Opcode::Ge => (top2_value >= top1_value) as i32,
            Opcode::Gt => (top2_value > top1_value) as i32,
            _ => 0,
        };
        regs.set_known_register_value(destination, folded, buf, enc);
        return Ok(());
    }

    match op {
        Opcode::Add => buf.push(enc.add_reg(destination, top1, top2)),
        Opcode::Sub => buf.push(enc.sub_reg(destination, top2, top1)),
        Opcode::Mul => {
            if destination == top1 {
                buf.push(enc.mul(destination, top2));
            } else if destination == top2 {
                buf.push(enc.mul(destination, top1));
            } else {
                buf.push(enc.move_low_to_low(TEMP_REGISTER, top1));
                buf.push(enc.mul(TEMP_REGISTER, top2));
                buf.push(enc.move_low_to_low(destination, TEMP_REGISTER));
            }
        }
        Opcode::Max => {
            buf.push(enc.move_low_to_low(TEMP_REGISTER, top2));
            buf.push(enc.compare_low_registers(top1, top2));
            buf.push(enc.conditional_branch_natural(Condition::Le, 2));
            buf.push(enc.move_low_to_low(TEMP_REGISTER, top1));
            buf.push(enc.move_low_to_low(destination, TEMP_REGISTER));
        }
        Opcode::Min => {
            buf.push(enc.move_low_to_low(TEMP_REGISTER, top2));
            buf.push(enc.compare_low_registers(top1, top2));
            buf.push(enc.conditional_branch_natural(Condition::Ge, 2));
            buf.push(enc.move_low_to_low(TEMP_REGISTER, top1));
            buf.push(enc.move_low_to_low(destination, TEMP_REGISTER));
        }
        Opcode::Lt | Opcode::Le | Opcode::Eq | Opcode::Ge | Opcode::Gt => {
            buf.push(enc.move_immediate(TEMP_REGISTER, 1));
            buf.push(enc.compare_low_registers(top2, top1));
            let condition = condition_for(op).unwrap_or(Condition::Eq);
            buf.push(enc.conditional_branch(condition, 0));
            buf.push(enc.move_immediate(TEMP_REGISTER, 0));
            buf.push(enc.move_low_to_low(destination, TEMP_REGISTER));
        }
        _ => {}
    }
    Ok(())
}
