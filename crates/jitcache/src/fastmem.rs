//! Direct mapping of guest memory into the host address space.
//!
//! Generated code performs guest loads and stores as plain host accesses at
//! `base + physical address`, with no bounds checks. Anything that is not
//! RAM or BIOS stays inaccessible, so stray accesses raise a host page fault
//! which the cache resolves back to the faulting block.
use crate::MemoryMap;
use easyerr::Error;

/// A host page fault delivered by the platform fault interception adapter.
#[derive(Debug, Clone, Copy)]
pub struct FaultContext {
    /// Host address of the faulting instruction.
    pub host_pc: usize,
    /// Host address of the faulting access.
    pub fault_addr: usize,
    /// Whether the access was a write.
    pub is_write: bool,
}

/// Response to the fault interception adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The fault belonged to a fastmem access and was redirected; execution
    /// can resume.
    Handled,
    /// The fault is unrelated and must propagate as a fatal condition.
    NotHandled,
}

#[derive(Debug, Error)]
pub enum FastmemError {
    #[error("fastmem is not supported on this platform")]
    Unsupported,
    #[error(transparent)]
    Vm { source: jitmem::VmError },
}

/// The fastmem mapping: a reservation spanning the guest physical address
/// space, with RAM (and its mirrors) mapped read/write and the BIOS mapped
/// read-only at their physical offsets.
#[cfg(unix)]
pub struct FastmemArea {
    span: jitmem::Reservation,
    /// Backing objects are kept alive for the lifetime of the mapping.
    _ram: jitmem::SharedMem,
    _bios: jitmem::SharedMem,
    map: MemoryMap,
}

#[cfg(unix)]
impl FastmemArea {
    /// Maps the guest regions described by `map` into the host address
    /// space.
    pub fn install(map: &MemoryMap) -> Result<Self, FastmemError> {
        use jitmem::{Protection, Reservation, SharedMem};

        let vm = |source| FastmemError::Vm { source };

        let span = Reservation::new(map.physical_span()).map_err(vm)?;
        let ram = SharedMem::new(map.ram_size as usize).map_err(vm)?;
        let bios = SharedMem::new(map.bios_size as usize).map_err(vm)?;

        // RAM aliases into each of its mirrors
        for mirror in (0..map.ram_mirror_size).step_by(map.ram_size as usize) {
            ram.map_at(
                &span,
                mirror as usize,
                0,
                map.ram_size as usize,
                Protection::ReadWrite,
            )
            .map_err(vm)?;
        }

        bios.map_at(
            &span,
            map.bios_base as usize,
            0,
            map.bios_size as usize,
            Protection::Read,
        )
        .map_err(vm)?;

        tracing::debug!(
            base = span.as_ptr().addr(),
            span = span.len(),
            "fastmem area installed"
        );

        Ok(Self {
            span,
            _ram: ram,
            _bios: bios,
            map: map.clone(),
        })
    }

    /// Base host address of the mapping. The physical guest address `p` is
    /// accessible at `base + p`.
    #[inline(always)]
    pub fn base(&self) -> *mut u8 {
        self.span.as_ptr()
    }

    /// Host pointer to the start of guest RAM.
    #[inline(always)]
    pub fn ram_ptr(&self) -> *mut u8 {
        self.span.as_ptr()
    }

    /// If `host_addr` falls inside the mapping, returns the guest physical
    /// address it corresponds to.
    #[inline(always)]
    pub fn guest_of(&self, host_addr: usize) -> Option<u32> {
        self.span.offset_of(host_addr).map(|offset| offset as u32)
    }

    /// Copies a BIOS image into the read-only BIOS mapping.
    pub fn load_bios(&mut self, data: &[u8]) -> Result<(), FastmemError> {
        use jitmem::Protection;

        assert!(data.len() <= self.map.bios_size as usize);
        let base = self.map.bios_base as usize;

        unsafe {
            self.span
                .protect(base, self.map.bios_size as usize, Protection::ReadWrite)
                .map_err(|source| FastmemError::Vm { source })?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.span.as_ptr().add(base), data.len());
            self.span
                .protect(base, self.map.bios_size as usize, Protection::Read)
                .map_err(|source| FastmemError::Vm { source })?;
        }

        Ok(())
    }
}

/// Fastmem relies on memory mapped files and host fault interception; it is
/// only implemented for unix targets. Installation fails everywhere else and
/// the cache keeps using bounds-checked accesses.
#[cfg(not(unix))]
pub struct FastmemArea {
    _unsupported: std::convert::Infallible,
}

#[cfg(not(unix))]
impl FastmemArea {
    pub fn install(_map: &MemoryMap) -> Result<Self, FastmemError> {
        Err(FastmemError::Unsupported)
    }

    pub fn base(&self) -> *mut u8 {
        match self._unsupported {}
    }

    pub fn ram_ptr(&self) -> *mut u8 {
        match self._unsupported {}
    }

    pub fn guest_of(&self, _host_addr: usize) -> Option<u32> {
        match self._unsupported {}
    }

    pub fn load_bios(&mut self, _data: &[u8]) -> Result<(), FastmemError> {
        match self._unsupported {}
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn ram_mirrors_alias() {
        let map = MemoryMap::default();
        let area = FastmemArea::install(&map).unwrap();

        unsafe {
            area.base().add(0x100).write(0x77);
            // same byte through the second RAM mirror
            assert_eq!(area.base().add(map.ram_size as usize + 0x100).read(), 0x77);
        }
    }

    #[test]
    fn guest_address_resolution() {
        let map = MemoryMap::default();
        let area = FastmemArea::install(&map).unwrap();
        let base = area.base().addr();

        assert_eq!(area.guest_of(base + 0x1234), Some(0x1234));
        assert_eq!(area.guest_of(base + map.physical_span()), None);
        assert_eq!(area.guest_of(base.wrapping_sub(1)), None);
    }

    #[test]
    fn bios_image_is_readable() {
        let map = MemoryMap::default();
        let mut area = FastmemArea::install(&map).unwrap();

        area.load_bios(&[0xDE, 0xAD]).unwrap();
        unsafe {
            assert_eq!(area.base().add(map.bios_base as usize).read(), 0xDE);
            assert_eq!(area.base().add(map.bios_base as usize + 1).read(), 0xAD);
        }
    }
}
