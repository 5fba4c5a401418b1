use crate::vm::{Protection, Reservation, VmError};
use std::ptr::NonNull;

#[cfg(target_family = "windows")]
use windows::Win32::System::{Diagnostics::Debug::FlushInstructionCache, Threading::GetCurrentProcess};

const REGION_MIN_LEN: usize = 1 << 16;
const DEFAULT_CAPACITY: usize = 32 << 20;

/// A bump arena of executable code.
///
/// Allocations are write protected and mapped executable once their contents
/// are copied in. Individual allocations are never freed; the arena reclaims
/// memory wholesale through [`CodeArena::reset`]. Once the configured
/// capacity is reached, allocations fail with [`VmError::Capacity`] until the
/// arena is reset.
pub struct CodeArena {
    regions: Vec<Reservation>,
    /// Offset of the first free byte in the last region.
    offset: usize,
    used: usize,
    capacity: usize,
}

impl CodeArena {
    pub const fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub const fn with_capacity(capacity: usize) -> Self {
        Self {
            regions: Vec::new(),
            offset: 0,
            used: 0,
            capacity,
        }
    }

    /// Total bytes of code currently allocated.
    #[inline(always)]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Total bytes of code this arena may hold.
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn grow(&mut self, len: usize) -> Result<(), VmError> {
        let region = Reservation::new(len.max(REGION_MIN_LEN))?;
        self.regions.push(region);
        self.offset = 0;

        Ok(())
    }

    /// Copies `code` into the arena and returns an executable allocation for it.
    pub fn allocate(&mut self, alignment: usize, code: &[u8]) -> Result<NonNull<[u8]>, VmError> {
        assert!(!code.is_empty());

        if self.used + code.len() > self.capacity {
            return Err(VmError::Capacity {
                requested: code.len(),
            });
        }

        let alignment = alignment.max(1).next_power_of_two();

        let fits = self.regions.last().is_some_and(|region| {
            let start = self.offset.next_multiple_of(alignment);
            region.len().checked_sub(start).is_some_and(|r| r >= code.len())
        });

        if !fits {
            self.grow(code.len())?;
        }

        let region = self.regions.last().unwrap();
        let start = self.offset.next_multiple_of(alignment);
        let end = start + code.len();

        unsafe {
            region.protect(0, end, Protection::ReadWrite)?;
            std::ptr::copy_nonoverlapping(code.as_ptr(), region.as_ptr().add(start), code.len());
            region.protect(0, end, Protection::ReadExec)?;

            #[cfg(target_family = "windows")]
            {
                let process = GetCurrentProcess();
                let _ = FlushInstructionCache(
                    process,
                    Some(region.as_ptr().add(start).cast()),
                    code.len(),
                );
            }
        }

        self.offset = end;
        self.used += code.len();

        let ptr = unsafe { NonNull::new(region.as_ptr().add(start)).unwrap() };
        Ok(NonNull::slice_from_raw_parts(ptr, code.len()))
    }

    /// Unmaps every region, invalidating all previously returned allocations.
    ///
    /// # Safety
    /// No allocation returned by this arena may be accessed or executed
    /// afterwards.
    pub unsafe fn reset(&mut self) {
        self.regions.clear();
        self.offset = 0;
        self.used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_read_back() {
        let mut arena = CodeArena::new();
        let code = [0x90, 0x90, 0xC3];

        let alloc = arena.allocate(16, &code).unwrap();
        assert_eq!(alloc.as_ptr().addr() % 16, 0);
        assert_eq!(unsafe { alloc.as_ref() }, &code);
        assert_eq!(arena.used(), 3);

        // a second allocation must not overlap the first
        let other = arena.allocate(16, &[0xC3; 32]).unwrap();
        assert_ne!(alloc.as_ptr().addr(), other.as_ptr().addr());
        assert_eq!(unsafe { alloc.as_ref() }, &code);
    }

    #[test]
    fn grows_past_a_full_region() {
        let mut arena = CodeArena::new();
        let big = vec![0xC3; REGION_MIN_LEN];

        arena.allocate(16, &big).unwrap();
        arena.allocate(16, &big).unwrap();
        assert_eq!(arena.used(), 2 * REGION_MIN_LEN);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut arena = CodeArena::with_capacity(64);
        arena.allocate(16, &[0xC3; 48]).unwrap();

        let err = arena.allocate(16, &[0xC3; 32]).unwrap_err();
        assert!(matches!(err, VmError::Capacity { requested: 32 }));

        // a reset makes room again
        unsafe { arena.reset() };
        arena.allocate(16, &[0xC3; 32]).unwrap();
        assert_eq!(arena.used(), 32);
    }

    #[test]
    fn reset_reclaims_everything() {
        let mut arena = CodeArena::new();
        arena.allocate(16, &[0xC3]).unwrap();

        unsafe { arena.reset() };
        assert_eq!(arena.used(), 0);

        arena.allocate(16, &[0xC3; 8]).unwrap();
        assert_eq!(arena.used(), 8);
    }
}
