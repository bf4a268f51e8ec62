//! Runtime compilation of functions reached through dynamic calls.

use crate::buffer::CodeBuffer;
use crate::compiler::Compiler;

/// What a dynamic call resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicCallOutcome {
    /// Entry address of the callee's compiled code, with the Thumb bit
    /// set; `None` when compilation failed and the caller must halt with
    /// `CompilerError`.
    pub entry: Option<usize>,
    /// How far the code buffer's base moved while compiling. The caller's
    /// saved return address lives inside the buffer and must be relocated
    /// by this amount before returning into it.
    pub relocation: isize,
}

/// The dynamic-compilation trampoline.
///
/// Consults the buffer's jump table for a cached entry of the function at
/// bytecode offset `target`; failing that, runs incremental analysis from
/// `target`, compiles any newly discovered functions, and caches the entry.
/// Reached from compiled code through an indirect `blx` whose register ABI
/// shim calls this.
pub fn compile_function_dynamically(
    compiler: &mut Compiler<'_>,
    buf: &mut CodeBuffer,
    target: i32,
) -> DynamicCallOutcome {
    let original_base = buf.base_address() as isize;

    if target < 0 || target as usize >= compiler.source.len() {
        tracing::warn!(target, "dynamic call outside the code region");
        return DynamicCallOutcome {
            entry: None,
            relocation: 0,
        };
    }
    let offset = target as usize;

    if let Some(cached) = buf.jump_table().get(offset).copied() {
        if cached != 0 {
            return DynamicCallOutcome {
                entry: Some(cached as usize),
                relocation: 0,
            };
        }
    }

    if compiler.function_pointer_for(offset, buf).is_none() {
        if let Err(error) = compiler.compile_new_function(buf, offset) {
            tracing::warn!(%error, offset, "dynamic compilation failed");
            return DynamicCallOutcome {
                entry: None,
                relocation: buf.base_address() as isize - original_base,
            };
        }
    }

    let entry = compiler.function_pointer_for(offset, buf);
    if let Some(entry) = entry {
        let table = buf.jump_table_mut();
        if table.len() <= offset {
            table.resize(offset + 1, 0);
        }
        table[offset] = entry as u32;
    }

    DynamicCallOutcome {
        entry,
        relocation: buf.base_address() as isize - original_base,
    }
}
