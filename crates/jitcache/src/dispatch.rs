use crate::{Address, MemoryMap, block::BlockEntry};
use easyerr::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("address {pc} is outside the RAM and BIOS regions")]
    InvalidDispatchTarget { pc: Address },
}

/// One dispatch table entry.
///
/// Slots of blocks that have not been compiled yet, that failed native
/// generation, or that have been invalidated hold [`Slot::NeedsCompile`],
/// which sends execution back through the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Slot {
    #[default]
    NeedsCompile,
    Compiled(BlockEntry),
}

impl Slot {
    #[inline(always)]
    pub fn entry(self) -> Option<BlockEntry> {
        match self {
            Self::NeedsCompile => None,
            Self::Compiled(entry) => Some(entry),
        }
    }
}

/// A flat array mapping every instruction-aligned RAM and BIOS address to an
/// executable entry point, giving O(1) dispatch from the current guest PC.
///
/// RAM slots come first, BIOS slots after them; addresses outside both
/// regions are never dispatched.
pub struct DispatchTable {
    map: MemoryMap,
    ram_slots: usize,
    slots: Vec<Slot>,
}

impl DispatchTable {
    pub fn new(map: &MemoryMap) -> Self {
        let ram_slots = (map.ram_size / 4) as usize;
        let bios_slots = (map.bios_size / 4) as usize;

        Self {
            map: map.clone(),
            ram_slots,
            slots: vec![Slot::NeedsCompile; ram_slots + bios_slots],
        }
    }

    #[inline(always)]
    fn index(&self, pc: Address) -> Result<usize, DispatchError> {
        let phys = self.map.physical(pc);
        if self.map.is_ram(phys) {
            Ok((self.map.ram_offset(phys) >> 2) as usize)
        } else if self.map.is_bios(phys) {
            Ok(self.ram_slots + ((phys.value() - self.map.bios_base) >> 2) as usize)
        } else {
            Err(DispatchError::InvalidDispatchTarget { pc })
        }
    }

    /// The slot for `pc`.
    #[inline(always)]
    pub fn get(&self, pc: Address) -> Result<Slot, DispatchError> {
        Ok(self.slots[self.index(pc)?])
    }

    /// Points the slot for `pc` at a compiled entry.
    #[inline(always)]
    pub fn set(&mut self, pc: Address, entry: BlockEntry) -> Result<(), DispatchError> {
        let index = self.index(pc)?;
        self.slots[index] = Slot::Compiled(entry);
        Ok(())
    }

    /// Sends the slot for `pc` back through the cache.
    #[inline(always)]
    pub fn clear(&mut self, pc: Address) -> Result<(), DispatchError> {
        let index = self.index(pc)?;
        self.slots[index] = Slot::NeedsCompile;
        Ok(())
    }

    /// Resets every slot. Called on flush.
    pub fn reset(&mut self) {
        self.slots.fill(Slot::NeedsCompile);
    }

    /// Whether no slot points at compiled code.
    pub fn is_reset(&self) -> bool {
        self.slots.iter().all(|slot| slot.entry().is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn nop_entry(_: *mut crate::hooks::ExecState) {}

    #[test]
    fn ram_and_bios_split() {
        let map = MemoryMap::default();
        let table = DispatchTable::new(&map);

        assert_eq!(table.index(Address(0x0000_0000)).unwrap(), 0);
        assert_eq!(table.index(Address(0x0000_0004)).unwrap(), 1);
        // mirrors share slots
        assert_eq!(
            table.index(Address(0x8000_1000)).unwrap(),
            table.index(Address(0x0000_1000)).unwrap()
        );
        assert_eq!(table.index(Address(0xBFC0_0000)).unwrap(), table.ram_slots);
    }

    #[test]
    fn invalid_target_is_an_error() {
        let map = MemoryMap::default();
        let table = DispatchTable::new(&map);

        assert_eq!(
            table.get(Address(0x1F00_0000)),
            Err(DispatchError::InvalidDispatchTarget {
                pc: Address(0x1F00_0000)
            })
        );
    }

    #[test]
    fn set_clear_reset() {
        let map = MemoryMap::default();
        let mut table = DispatchTable::new(&map);
        let pc = Address(0x0000_2000);

        table.set(pc, nop_entry).unwrap();
        assert!(table.get(pc).unwrap().entry().is_some());

        table.clear(pc).unwrap();
        assert!(table.get(pc).unwrap().entry().is_none());

        table.set(pc, nop_entry).unwrap();
        table.reset();
        assert!(table.is_reset());
    }
}
