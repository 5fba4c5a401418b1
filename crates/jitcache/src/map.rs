use crate::Address;

/// Layout of the guest physical memory regions that can hold executable code.
///
/// All predicates and index derivations in the cache come from this value
/// rather than hardcoded constants, so alternative RAM or BIOS sizes only
/// need a different map.
#[derive(Debug, Clone)]
pub struct MemoryMap {
    /// Size of guest RAM in bytes. Must be a power of two.
    pub ram_size: u32,
    /// Size of the physical region RAM is mirrored over, starting at zero.
    /// Must be a multiple of `ram_size`.
    pub ram_mirror_size: u32,
    /// Physical base address of the BIOS ROM.
    pub bios_base: u32,
    /// Size of the BIOS ROM in bytes. Must be a power of two.
    pub bios_size: u32,
    /// Mask collapsing the segment mirrors of the address space onto the
    /// physical region.
    pub physical_mask: u32,
    /// Granularity of code invalidation. Must be a power of two.
    pub page_size: u32,
}

impl Default for MemoryMap {
    fn default() -> Self {
        Self {
            ram_size: 2 * 1024 * 1024,
            ram_mirror_size: 8 * 1024 * 1024,
            bios_base: 0x1FC0_0000,
            bios_size: 512 * 1024,
            physical_mask: 0x1FFF_FFFF,
            page_size: 4096,
        }
    }
}

impl MemoryMap {
    /// Collapses an address onto the physical region.
    #[inline(always)]
    pub fn physical(&self, addr: Address) -> Address {
        Address(addr.value() & self.physical_mask)
    }

    /// Whether a physical address falls inside RAM or one of its mirrors.
    #[inline(always)]
    pub fn is_ram(&self, phys: Address) -> bool {
        phys.value() < self.ram_mirror_size
    }

    /// Whether a physical address falls inside the BIOS ROM.
    #[inline(always)]
    pub fn is_bios(&self, phys: Address) -> bool {
        phys.value().wrapping_sub(self.bios_base) < self.bios_size
    }

    /// Offset of a physical RAM address into the RAM backing, with mirrors
    /// collapsed.
    #[inline(always)]
    pub fn ram_offset(&self, phys: Address) -> u32 {
        phys.value() & (self.ram_size - 1)
    }

    /// Code page index of a physical address, if it resides in RAM.
    #[inline(always)]
    pub fn page_index(&self, phys: Address) -> Option<u32> {
        self.is_ram(phys)
            .then(|| self.ram_offset(phys) / self.page_size)
    }

    /// Number of RAM code pages.
    #[inline(always)]
    pub fn page_count(&self) -> u32 {
        self.ram_size / self.page_size
    }

    /// Extent of the physical address space that contains executable regions.
    #[inline(always)]
    pub fn physical_span(&self) -> usize {
        (self.bios_base + self.bios_size) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirrors_collapse() {
        let map = MemoryMap::default();

        // KSEG0 mirror of RAM
        let phys = map.physical(Address(0x8020_0400));
        assert!(map.is_ram(phys));
        assert_eq!(map.ram_offset(phys), 0x0400);

        // KSEG1 mirror of the BIOS
        let phys = map.physical(Address(0xBFC0_0180));
        assert!(map.is_bios(phys));
    }

    #[test]
    fn page_indices() {
        let map = MemoryMap::default();

        assert_eq!(map.page_index(Address(0x0000_0000)), Some(0));
        assert_eq!(map.page_index(Address(0x0000_1000)), Some(1));
        assert_eq!(map.page_index(Address(0x0020_1000)), Some(1)); // mirror
        assert_eq!(map.page_index(Address(0x1FC0_0000)), None); // rom
        assert_eq!(map.page_count(), 512);
    }
}
