//! A just-in-time translation cache for an emulated CPU with fixed-width,
//! 4-byte aligned instructions.
//!
//! Runs of guest instructions are decoded into [`Block`]s, optionally handed
//! to a native code generator, and indexed by guest program counter. The
//! [`CodeCache`] keeps the blocks coherent with guest memory (self-modifying
//! code, DMA) through page-granular invalidation, chains compiled blocks into
//! their successors, and optionally maps guest memory directly into the host
//! address space ("fastmem"), resolving the resulting page faults back to the
//! offending block.
//!
//! Instruction semantics, native code emission and the memory bus live
//! outside this crate, behind the traits in [`hooks`].
mod block;
mod cache;
mod dispatch;
mod fastmem;
mod key;
mod map;
mod store;

pub mod hooks;

pub use block::{Block, BlockEntry, BlockInstruction, GeneratedCode, InstrFlags, PatchSite};
pub use cache::{CodeCache, CompileError, RevalidateError, Settings};
pub use dispatch::{DispatchError, DispatchTable, Slot};
pub use fastmem::{FastmemArea, FastmemError, FaultContext, FaultOutcome};
pub use key::BlockKey;
pub use map::MemoryMap;
pub use store::{BlockId, BlockStore};

/// A guest memory address. This is a thin wrapper around a [`u32`].
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Address(pub u32);

impl Address {
    /// Returns the value of this address. Equivalent to `self.0`.
    #[inline(always)]
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Returns `true` if this address is aligned to the given alignment.
    #[inline(always)]
    pub const fn is_aligned(self, alignment: u32) -> bool {
        self.0.is_multiple_of(alignment)
    }

    /// Returns this address aligned down to the instruction width.
    #[inline(always)]
    pub const fn instr_aligned(self) -> Self {
        Self(self.0 & !3)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "0x{:04X}_{:04X}",
            (self.0 & 0xFFFF_0000) >> 16,
            self.0 & 0xFFFF
        )
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl From<u32> for Address {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl PartialEq<u32> for Address {
    fn eq(&self, other: &u32) -> bool {
        self.0 == *other
    }
}

impl std::ops::Add<u32> for Address {
    type Output = Self;

    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl std::ops::AddAssign<u32> for Address {
    fn add_assign(&mut self, rhs: u32) {
        *self = *self + rhs;
    }
}

impl std::ops::Sub<u32> for Address {
    type Output = Self;

    fn sub(self, rhs: u32) -> Self::Output {
        Self(self.0.wrapping_sub(rhs))
    }
}
