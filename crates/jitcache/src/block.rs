use crate::{Address, BlockKey, MemoryMap, hooks::ExecState, store::BlockId};
use bitos::bitos;

/// Static flags of a decoded instruction inside a block.
///
/// The decoder fills in the intrinsic flags (branch, load, store, load delay,
/// trap); the cache derives the positional ones while building the block.
#[bitos(16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InstrFlags {
    /// Whether this instruction branches.
    #[bits(0)]
    pub is_branch: bool,
    /// Whether this instruction sits in the delay slot of a branch.
    #[bits(1)]
    pub is_branch_delay_slot: bool,
    /// Whether this instruction loads from memory.
    #[bits(2)]
    pub is_load: bool,
    /// Whether this instruction stores to memory.
    #[bits(3)]
    pub is_store: bool,
    /// Whether this instruction sits in the delay slot of a load.
    #[bits(4)]
    pub is_load_delay_slot: bool,
    /// Whether this is the last instruction of its block.
    #[bits(5)]
    pub is_last: bool,
    /// Whether the loaded value only becomes visible after the next
    /// instruction.
    #[bits(6)]
    pub has_load_delay: bool,
    /// Whether this instruction can raise a guest exception.
    #[bits(7)]
    pub can_trap: bool,
}

/// One decoded guest instruction of a block. Immutable once the block is
/// built.
#[derive(Debug, Clone, Copy)]
pub struct BlockInstruction {
    /// The raw instruction word.
    pub bits: u32,
    /// The guest PC of this instruction.
    pub pc: Address,
    pub flags: InstrFlags,
}

/// Entry point of a compiled block. The generated code is fully responsible
/// for executing the block and updating the PC before returning or chaining
/// into a linked successor.
pub type BlockEntry = unsafe extern "C" fn(*mut ExecState);

/// A guest memory access site inside generated code that may need to be
/// redirected to its slow path when a fastmem access faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchSite {
    /// Host address of the access instruction.
    pub host_pc: usize,
    /// Guest PC of the load or store that generated it.
    pub guest_pc: Address,
}

/// Native code produced for a block by the generator collaborator.
pub struct GeneratedCode {
    pub entry: BlockEntry,
    pub size: u32,
    /// Load/store sites eligible for fastmem backpatching.
    pub patch_sites: Vec<PatchSite>,
}

impl GeneratedCode {
    /// Host address of the entry point.
    #[inline(always)]
    pub fn entry_addr(&self) -> usize {
        self.entry as usize
    }

    /// Whether `host_pc` falls inside this code region.
    #[inline(always)]
    pub fn contains(&self, host_pc: usize) -> bool {
        host_pc.wrapping_sub(self.entry_addr()) < self.size as usize
    }
}

/// A translation block: a straight-line run of decoded guest instructions,
/// plus the native code generated for it, if any.
///
/// Blocks without generated code are still executable through the
/// interpreter. Links to other blocks are non-owning [`BlockId`] handles used
/// only for graph maintenance.
pub struct Block {
    pub key: BlockKey,
    pub instructions: Vec<BlockInstruction>,
    pub generated: Option<GeneratedCode>,
    /// Blocks whose compiled exit may jump directly into this one.
    pub predecessors: Vec<BlockId>,
    /// Blocks this one may jump directly into.
    pub successors: Vec<BlockId>,
    pub contains_loadstore: bool,
    /// Set when a write lands on a page this block overlaps. Cleared again if
    /// revalidation finds the backing memory unchanged.
    pub invalidated: bool,
    /// How many times this block has been revived or recompiled after an
    /// invalidation.
    pub recompile_count: u32,
}

impl Block {
    pub fn new(key: BlockKey, instructions: Vec<BlockInstruction>) -> Self {
        let contains_loadstore = instructions
            .iter()
            .any(|i| i.flags.is_load() || i.flags.is_store());

        Self {
            key,
            instructions,
            generated: None,
            predecessors: Vec::new(),
            successors: Vec::new(),
            contains_loadstore,
            invalidated: false,
            recompile_count: 0,
        }
    }

    /// The guest PC this block starts at.
    #[inline(always)]
    pub fn pc(&self) -> Address {
        self.key.pc()
    }

    /// Size of the guest code covered by this block, in bytes.
    #[inline(always)]
    pub fn size_bytes(&self) -> u32 {
        self.instructions.len() as u32 * 4
    }

    /// Whether this block resides in RAM and is therefore subject to
    /// write invalidation.
    pub fn is_in_ram(&self, map: &MemoryMap) -> bool {
        map.is_ram(map.physical(self.pc()))
    }

    /// The inclusive range of RAM code pages this block overlaps, if it
    /// resides in RAM.
    pub fn page_range(&self, map: &MemoryMap) -> Option<std::ops::RangeInclusive<u32>> {
        let phys = map.physical(self.pc());
        let start = map.page_index(phys)?;
        let end = map.page_index(phys + (self.size_bytes() - 1))?;

        Some(start..=end)
    }

    /// Entry point of the generated code, if generation succeeded.
    #[inline(always)]
    pub fn entry(&self) -> Option<BlockEntry> {
        self.generated.as_ref().map(|g| g.entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instr(pc: u32, flags: InstrFlags) -> BlockInstruction {
        BlockInstruction {
            bits: 0,
            pc: Address(pc),
            flags,
        }
    }

    #[test]
    fn page_range_spans_boundaries() {
        let map = MemoryMap::default();
        let key = BlockKey::new(Address(0x0000_0FF8), false);
        let block = Block::new(
            key,
            (0..4)
                .map(|i| instr(0xFF8 + i * 4, InstrFlags::default()))
                .collect(),
        );

        assert_eq!(block.size_bytes(), 16);
        assert_eq!(block.page_range(&map), Some(0..=1));
        assert!(block.is_in_ram(&map));
    }

    #[test]
    fn bios_blocks_have_no_pages() {
        let map = MemoryMap::default();
        let key = BlockKey::new(Address(0xBFC0_0000), false);
        let block = Block::new(key, vec![instr(0xBFC0_0000, InstrFlags::default())]);

        assert!(!block.is_in_ram(&map));
        assert_eq!(block.page_range(&map), None);
    }

    #[test]
    fn loadstore_detection() {
        let flags = InstrFlags::default().with_is_load(true);
        let block = Block::new(
            BlockKey::new(Address(0x1000), false),
            vec![instr(0x1000, flags)],
        );
        assert!(block.contains_loadstore);
    }
}
