//! Thin wrappers over the platform virtual memory interface.
use easyerr::Error;

#[cfg(target_family = "unix")]
use rustix::mm::{self as mman, MapFlags, MprotectFlags, ProtFlags};
#[cfg(target_family = "windows")]
use windows::Win32::System::Memory;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("failed to reserve {len} bytes of address space")]
    Reserve { len: usize },
    #[error("failed to change the protection of a page range")]
    Protect,
    #[error("allocating {requested} bytes would exceed the arena capacity")]
    Capacity { requested: usize },
    #[error("failed to create a shared memory object of {len} bytes")]
    Shared { len: usize },
    #[error("failed to map shared memory into a reservation")]
    Map,
}

/// Access protection of a page range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    None,
    Read,
    ReadWrite,
    ReadExec,
}

#[cfg(target_family = "unix")]
impl Protection {
    fn mprotect_flags(self) -> MprotectFlags {
        match self {
            Self::None => MprotectFlags::empty(),
            Self::Read => MprotectFlags::READ,
            Self::ReadWrite => MprotectFlags::READ | MprotectFlags::WRITE,
            Self::ReadExec => MprotectFlags::READ | MprotectFlags::EXEC,
        }
    }

    fn prot_flags(self) -> ProtFlags {
        match self {
            Self::None => ProtFlags::empty(),
            Self::Read => ProtFlags::READ,
            Self::ReadWrite => ProtFlags::READ | ProtFlags::WRITE,
            Self::ReadExec => ProtFlags::READ | ProtFlags::EXEC,
        }
    }
}

/// A contiguous, initially inaccessible region of address space.
///
/// Sub-ranges become usable through [`Reservation::protect`] or by mapping
/// shared memory over them. The whole region is unmapped on drop.
pub struct Reservation {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the region is exclusively owned and accesses go through &self/&mut self
unsafe impl Send for Reservation {}

impl Reservation {
    /// Reserves `len` bytes of address space with no access permissions.
    pub fn new(len: usize) -> Result<Self, VmError> {
        assert!(len > 0);

        #[cfg(target_family = "unix")]
        let ptr = unsafe {
            mman::mmap_anonymous(
                std::ptr::null_mut(),
                len,
                ProtFlags::empty(),
                MapFlags::PRIVATE,
            )
        }
        .map_err(|_| VmError::Reserve { len })?;

        #[cfg(target_family = "windows")]
        let ptr = {
            let ptr = unsafe {
                Memory::VirtualAlloc(
                    None,
                    len,
                    Memory::MEM_RESERVE | Memory::MEM_COMMIT,
                    Memory::PAGE_NOACCESS,
                )
            };

            if ptr.is_null() {
                return Err(VmError::Reserve { len });
            }

            ptr
        };

        Ok(Self {
            ptr: ptr.cast(),
            len,
        })
    }

    /// Returns the base pointer of the reservation.
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Returns the length of the reservation in bytes.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns whether `addr` falls inside the reservation, and if so, at which offset.
    #[inline(always)]
    pub fn offset_of(&self, addr: usize) -> Option<usize> {
        let base = self.ptr.addr();
        addr.checked_sub(base).filter(|off| *off < self.len)
    }

    /// Changes the protection of `[offset, offset + len)`.
    ///
    /// # Safety
    /// Must not revoke access to memory that live references point into.
    pub unsafe fn protect(
        &self,
        offset: usize,
        len: usize,
        protection: Protection,
    ) -> Result<(), VmError> {
        assert!(offset + len <= self.len);

        #[cfg(target_family = "unix")]
        unsafe {
            mman::mprotect(
                self.ptr.add(offset).cast(),
                len,
                protection.mprotect_flags(),
            )
        }
        .map_err(|_| VmError::Protect)?;

        #[cfg(target_family = "windows")]
        unsafe {
            let flags = match protection {
                Protection::None => Memory::PAGE_NOACCESS,
                Protection::Read => Memory::PAGE_READONLY,
                Protection::ReadWrite => Memory::PAGE_READWRITE,
                Protection::ReadExec => Memory::PAGE_EXECUTE_READ,
            };

            let mut previous = Memory::PAGE_PROTECTION_FLAGS(0);
            Memory::VirtualProtect(self.ptr.add(offset).cast(), len, flags, &raw mut previous)
                .map_err(|_| VmError::Protect)?;
        }

        Ok(())
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        #[cfg(target_family = "unix")]
        unsafe {
            let _ = mman::munmap(self.ptr.cast(), self.len);
        }

        #[cfg(target_family = "windows")]
        unsafe {
            let _ = Memory::VirtualFree(self.ptr.cast(), 0, Memory::MEM_RELEASE);
        }
    }
}

/// An anonymous shared memory object that can be mapped, possibly multiple
/// times, into a [`Reservation`].
#[cfg(unix)]
pub struct SharedMem {
    fd: std::os::fd::OwnedFd,
    len: usize,
}

#[cfg(unix)]
impl SharedMem {
    /// Creates a shared memory object of `len` bytes, zero filled.
    pub fn new(len: usize) -> Result<Self, VmError> {
        assert!(len > 0);

        let fd = rustix::fs::memfd_create("jitmem", rustix::fs::MemfdFlags::CLOEXEC)
            .map_err(|_| VmError::Shared { len })?;
        rustix::fs::ftruncate(&fd, len as u64).map_err(|_| VmError::Shared { len })?;

        Ok(Self { fd, len })
    }

    /// Returns the length of the object in bytes.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Maps `[file_offset, file_offset + len)` of this object over
    /// `[offset, offset + len)` of the given reservation.
    ///
    /// Mapping the same file range at multiple offsets aliases the same
    /// backing memory.
    pub fn map_at(
        &self,
        res: &Reservation,
        offset: usize,
        file_offset: usize,
        len: usize,
        protection: Protection,
    ) -> Result<(), VmError> {
        assert!(offset + len <= res.len());
        assert!(file_offset + len <= self.len);

        unsafe {
            mman::mmap(
                res.as_ptr().add(offset).cast(),
                len,
                protection.prot_flags(),
                MapFlags::SHARED | MapFlags::FIXED,
                &self.fd,
                file_offset as u64,
            )
        }
        .map_err(|_| VmError::Map)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_roundtrip() {
        let res = Reservation::new(1 << 16).unwrap();
        unsafe { res.protect(0, 4096, Protection::ReadWrite) }.unwrap();

        unsafe {
            res.as_ptr().write(0xAB);
            assert_eq!(res.as_ptr().read(), 0xAB);
        }

        assert_eq!(res.offset_of(res.as_ptr().addr() + 100), Some(100));
        assert_eq!(res.offset_of(res.as_ptr().addr() + (1 << 16)), None);
        assert_eq!(res.offset_of(res.as_ptr().addr().wrapping_sub(1)), None);
    }

    #[cfg(unix)]
    #[test]
    fn shared_mem_aliases() {
        let res = Reservation::new(1 << 16).unwrap();
        let shared = SharedMem::new(4096).unwrap();

        shared
            .map_at(&res, 0, 0, 4096, Protection::ReadWrite)
            .unwrap();
        shared
            .map_at(&res, 4096, 0, 4096, Protection::Read)
            .unwrap();

        unsafe {
            res.as_ptr().write(0x5A);
            assert_eq!(res.as_ptr().add(4096).read(), 0x5A);
        }
    }
}
