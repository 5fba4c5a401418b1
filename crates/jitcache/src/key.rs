use crate::Address;
use bitos::{bitos, integer::u30};

/// The canonical identity of a translation block: the aligned guest PC it
/// starts at, plus the privilege mode it was compiled for.
///
/// Two keys are equal iff both the PC and the privilege bit match.
#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockKey {
    /// Whether the block executes in user mode.
    #[bits(0)]
    pub user_mode: bool,
    /// The guest PC divided by the instruction width.
    #[bits(2..32)]
    pub aligned_pc: u30,
}

impl BlockKey {
    /// Builds a key from a guest PC and privilege mode. The PC is aligned
    /// down to the instruction width.
    #[inline(always)]
    pub fn new(pc: Address, user_mode: bool) -> Self {
        Self::from_bits(pc.instr_aligned().value() | user_mode as u32)
    }

    /// The guest PC this key identifies.
    #[inline(always)]
    pub fn pc(&self) -> Address {
        Address(self.aligned_pc().value() << 2)
    }

    /// The raw key bits, usable as a cache key.
    #[inline(always)]
    pub fn bits(&self) -> u32 {
        self.to_bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pc_is_aligned() {
        let key = BlockKey::new(Address(0x8000_1003), false);
        assert_eq!(key.pc(), 0x8000_1000);
        assert!(!key.user_mode());
    }

    #[test]
    fn privilege_mode_distinguishes() {
        let kernel = BlockKey::new(Address(0x1000), false);
        let user = BlockKey::new(Address(0x1000), true);

        assert_ne!(kernel, user);
        assert_ne!(kernel.bits(), user.bits());
        assert_eq!(kernel.pc(), user.pc());
    }
}
