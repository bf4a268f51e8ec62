//! The buffer of emitted Thumb instructions, callable as a native function.

use thumb_asm::{decode_long_call, decode_with_origin, is_long_call, Instruction, InstructionPair};

use crate::error::TransferError;
use crate::transfer::{BlobStore, Deserializer, Serializer};

/// Name of the persisted instruction blob.
const BLOB_NAME: &str = "bytecode";

/// Append-only buffer of 16-bit instructions.
///
/// The compiler is the only writer. After any mutation a data/instruction
/// barrier pair must be issued before the buffer is invoked;
/// [`CodeBuffer::function_pointer`] does this on ARM targets whenever
/// changes are pending. Growth may relocate the storage, which is why the
/// dynamic-compilation trampoline reports the relocation delta to its
/// caller.
#[derive(Debug, Default)]
pub struct CodeBuffer {
    words: Vec<Instruction>,
    jump_table: Vec<u32>,
    has_changes: bool,
}

impl CodeBuffer {
    /// An empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-allocates room for `instructions` words so that later appends do
    /// not relocate earlier code.
    pub fn reserve(&mut self, instructions: usize) {
        self.words.reserve(instructions);
    }

    /// Appends one instruction.
    pub fn push(&mut self, instruction: Instruction) {
        self.words.push(instruction);
        self.has_changes = true;
    }

    /// Appends a long-call pair.
    pub fn push_pair(&mut self, pair: InstructionPair) {
        self.push(pair.first);
        self.push(pair.second);
    }

    /// Appends a 32-bit literal as two words, low half first.
    pub fn push_data(&mut self, data: i32) {
        self.push((data & 0xffff) as Instruction);
        self.push(((data >> 16) & 0xffff) as Instruction);
    }

    /// Number of 16-bit words emitted so far.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// Whether nothing has been emitted.
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// The word at `index`.
    pub fn word(&self, index: usize) -> Instruction {
        self.words[index]
    }

    /// All emitted words.
    pub fn words(&self) -> &[Instruction] {
        &self.words
    }

    /// Rewrites the word at `index`; used by the linker to fill reserved
    /// slots.
    pub fn set(&mut self, index: usize, instruction: Instruction) {
        self.words[index] = instruction;
        self.has_changes = true;
    }

    /// Rewrites a pair of words starting at `index`.
    pub fn set_pair(&mut self, index: usize, pair: InstructionPair) {
        self.set(index, pair.first);
        self.set(index + 1, pair.second);
    }

    /// Base address of the emitted code.
    pub fn base_address(&self) -> usize {
        self.words.as_ptr() as usize
    }

    /// Address of the word at `index`.
    pub fn address_of(&self, index: usize) -> usize {
        self.base_address() + 2 * index
    }

    /// Entry address for the word at `index`, with the Thumb interworking
    /// bit set.
    pub fn entry_address(&self, index: usize) -> usize {
        self.address_of(index) | 0x1
    }

    /// Issues the data/instruction barrier pair that makes emitted code
    /// visible to the fetch unit. A no-op on non-ARM hosts, which never
    /// execute the buffer.
    pub fn commit(&mut self) {
        #[cfg(target_arch = "arm")]
        unsafe {
            core::arch::asm!("dsb", "isb");
        }
        self.has_changes = false;
    }

    /// The buffer's base address with the Thumb bit set, barriered if any
    /// change is pending.
    pub fn function_pointer(&mut self) -> usize {
        if self.has_changes {
            self.commit();
        }
        self.base_address() | 0x1
    }

    /// Invokes the compiled code with the machine ABI. The pointer must
    /// come from [`CodeBuffer::function_pointer`] on this same buffer.
    #[cfg(target_arch = "arm")]
    pub unsafe fn call(
        &mut self,
        state: *mut crate::state::RawVmState,
        stack_pointer: *mut i32,
        top_of_stack: i32,
    ) -> *mut crate::state::RawVmState {
        let fp = self.function_pointer();
        let f: extern "C" fn(
            *mut crate::state::RawVmState,
            *mut i32,
            i32,
        ) -> *mut crate::state::RawVmState = core::mem::transmute(fp);
        f(state, stack_pointer, top_of_stack)
    }

    /// Associates the compiled-entry table used by dynamic calls, indexed
    /// by bytecode offset. Entry zero means "not compiled yet".
    pub fn attach_jump_table(&mut self, table: Vec<u32>) {
        if self.has_changes {
            self.commit();
        }
        self.jump_table = table;
    }

    /// The jump table.
    pub fn jump_table(&self) -> &[u32] {
        &self.jump_table
    }

    /// Mutable access for the dynamic-compilation trampoline.
    pub fn jump_table_mut(&mut self) -> &mut Vec<u32> {
        &mut self.jump_table
    }

    /// Disassembly of the whole buffer, one instruction per line, with
    /// offsets relative to the buffer base.
    pub fn disassemble(&self) -> String {
        use core::fmt::Write;

        let mut out = String::new();
        let mut i = 0;
        while i < self.words.len() {
            let word = self.words[i];
            let origin = (2 * i) as u32;
            if is_long_call(word) && i + 1 < self.words.len() {
                let text = decode_long_call(word, self.words[i + 1], origin);
                let _ = writeln!(out, "{i:4}\t{word:04x}\t{text}");
                i += 1;
                let _ = writeln!(out, "{i:4}\t{:04x}", self.words[i]);
            } else {
                let text = decode_with_origin(word, origin);
                let _ = writeln!(out, "{i:4}\t{word:04x}\t{text}");
            }
            i += 1;
        }
        out
    }

    /// Persists the emitted instructions.
    pub fn serialize(&self, store: &mut dyn BlobStore) -> Result<(), TransferError> {
        let mut s = Serializer::new();
        s.push_u32(self.words.len() as u32);
        for word in &self.words {
            s.push_u16(*word);
        }
        store.write(BLOB_NAME, &s.finish())
    }

    /// Reloads previously persisted instructions, if any were stored.
    pub fn deserialize(&mut self, store: &dyn BlobStore) -> Result<(), TransferError> {
        let Some(bytes) = store.read(BLOB_NAME)? else {
            return Ok(());
        };
        let mut d = Deserializer::new(&bytes);
        let count = d.u32()? as usize;
        let mut words = Vec::with_capacity(count);
        for _ in 0..count {
            words.push(d.u16()?);
        }
        self.words = words;
        self.commit();
        Ok(())
    }
}
