//! Interfaces to the collaborators of the cache: the instruction
//! decoder/executor and the native code generator.
use crate::{
    Address,
    block::{BlockInstruction, GeneratedCode, InstrFlags},
    key::BlockKey,
};
use easyerr::Error;
use jitmem::CodeArena;

/// Execution state shared between the cache, the interpreter and generated
/// code. The register file itself lives with the [`InstructionSet`]
/// collaborator.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecState {
    /// The current guest PC.
    pub pc: Address,
    /// Whether the guest is executing in user mode.
    pub user_mode: bool,
    /// Set by the embedder or the executor when execution must return to the
    /// caller: pending interrupts, breakpoints, shutdown.
    pub pending_events: bool,
}

impl ExecState {
    pub fn new(pc: Address) -> Self {
        Self {
            pc,
            user_mode: false,
            pending_events: false,
        }
    }
}

/// A decoded instruction as handed out by the decoder. The cache derives the
/// positional flags (delay slots, block end) itself.
#[derive(Debug, Clone, Copy)]
pub struct DecodedInstruction {
    /// The raw instruction word.
    pub bits: u32,
    /// Intrinsic flags of the instruction.
    pub flags: InstrFlags,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("no memory is mapped at {pc}")]
    Unmapped { pc: Address },
    #[error("the word {bits:#010X} at {pc} is not a valid instruction")]
    Illegal { pc: Address, bits: u32 },
}

/// The guest instruction decoder and interpreter.
pub trait InstructionSet {
    /// Decodes the instruction at `pc` from current guest memory contents.
    fn decode(&mut self, pc: Address, user_mode: bool) -> Result<DecodedInstruction, DecodeError>;

    /// Executes one decoded instruction against the current register and
    /// memory state, updating `state.pc`.
    fn execute(&mut self, instr: &BlockInstruction, state: &mut ExecState);
}

#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("the instruction at {pc} is not supported by the generator")]
    Unsupported { pc: Address },
    #[error(transparent)]
    Memory { source: jitmem::VmError },
}

/// The native code generator.
///
/// Generated block exits must always be able to fall back to a dispatch
/// table lookup: a direct link between two blocks can be severed at any time
/// by invalidation.
pub trait Codegen {
    /// Generates native code for a block, allocating it from `arena`.
    ///
    /// Failure is per block and never fatal; the cache downgrades the block
    /// to interpretation.
    fn generate(
        &mut self,
        key: BlockKey,
        instructions: &[BlockInstruction],
        arena: &mut CodeArena,
    ) -> Result<GeneratedCode, CodegenError>;

    /// Redirects the memory access at `site` to its slow path after a
    /// fastmem fault. Returns whether the site could be patched.
    ///
    /// Called from a fault handler: must not allocate.
    fn backpatch(&mut self, site: crate::block::PatchSite) -> bool;
}
