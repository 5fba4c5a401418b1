use crate::block::Block;
use slotmap::{SlotMap, new_key_type};

new_key_type! {
    /// Identifier for a block in a [`BlockStore`].
    ///
    /// Keys are generation tagged: a handle to a removed block resolves to
    /// `None` instead of dangling, so the link graph can hold them freely.
    pub struct BlockId;
}

/// The owning storage of all translation blocks.
pub type BlockStore = SlotMap<BlockId, Block>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Address, BlockKey};

    fn dummy(pc: u32) -> Block {
        Block::new(BlockKey::new(Address(pc), false), Vec::new())
    }

    #[test]
    fn stale_handles_resolve_to_none() {
        let mut store = BlockStore::with_key();
        let id = store.insert(dummy(0x1000));

        assert!(store.get(id).is_some());
        assert!(store.remove(id).is_some());
        assert!(store.get(id).is_none());
        assert!(store.remove(id).is_none());

        // the slot is reused but the old handle stays stale
        let new = store.insert(dummy(0x2000));
        assert_ne!(id, new);
        assert!(store.get(id).is_none());
        assert_eq!(store.get(new).unwrap().pc(), 0x2000);
    }

    #[test]
    fn clear_invalidates_everything() {
        let mut store = BlockStore::with_key();
        let a = store.insert(dummy(0x1000));
        let b = store.insert(dummy(0x2000));

        store.clear();
        assert!(store.is_empty());
        assert!(store.get(a).is_none());
        assert!(store.get(b).is_none());

        let c = store.insert(dummy(0x3000));
        assert!(store.get(c).is_some());
        assert_eq!(store.len(), 1);
    }
}
