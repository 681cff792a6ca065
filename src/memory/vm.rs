use std::ptr::NonNull;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("VM reservation failed: {0}")]
    ReservationFailed(#[source] std::io::Error),
    #[error("VM commit failed: {0}")]
    CommitFailed(#[source] std::io::Error),
    #[error("VM decommit failed: {0}")]
    DecommitFailed(#[source] std::io::Error),
    #[error("VM release failed: {0}")]
    ReleaseFailed(#[source] std::io::Error),
}

/// Access rights applied to committed pages.
///
/// Chosen once per allocator (see `PoolAllocatorConfig::executable`) and
/// applied uniformly to every chunk commit and every large mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PageProtection {
    ReadWrite,
    ReadWriteExecute,
}

impl PageProtection {
    #[must_use]
    pub const fn from_executable(executable: bool) -> Self {
        if executable {
            Self::ReadWriteExecute
        } else {
            Self::ReadWrite
        }
    }

    #[must_use]
    pub const fn is_executable(self) -> bool {
        matches!(self, Self::ReadWriteExecute)
    }
}

/// Abstract interface for virtual memory operations.
pub(crate) trait VmOps {
    /// Reserve address space without committing physical pages.
    /// Returns a pointer to the start of the reserved range.
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Commit (back with physical pages) a range within a reservation.
    unsafe fn commit(ptr: NonNull<u8>, size: usize, protection: PageProtection)
    -> Result<(), VmError>;

    /// Decommit (return physical pages, keep address range reserved).
    /// The pages leave the resident set at once and read as zero after the
    /// next commit.
    unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Release address space entirely (after which pointers are invalid).
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Reserve and commit a fresh, page-aligned, zero-filled mapping in one
    /// call. Freed with [`release`](Self::release).
    unsafe fn map(size: usize, protection: PageProtection) -> Result<NonNull<u8>, VmError>;

    /// OS page size.
    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PageProtection, PlatformVmOps, VmError, VmOps};
    use std::io;

    fn prot_flags(protection: PageProtection) -> libc::c_int {
        match protection {
            PageProtection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            PageProtection::ReadWriteExecute => {
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC
            }
        }
    }

    unsafe fn mmap_anon(size: usize, prot: libc::c_int) -> Result<NonNull<u8>, VmError> {
        // Safety: FFI call to mmap.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                prot,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(VmError::ReservationFailed(io::Error::last_os_error()));
        }

        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| VmError::ReservationFailed(io::Error::other("mmap returned null")))
    }

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: anonymous private mapping, no aliasing.
            unsafe { mmap_anon(size, libc::PROT_NONE) }
        }

        unsafe fn commit(
            ptr: NonNull<u8>,
            size: usize,
            protection: PageProtection,
        ) -> Result<(), VmError> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    prot_flags(protection),
                )
            } != 0
            {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Replace the range with a fresh PROT_NONE mapping: the old pages
            // leave the resident set immediately and read as zero once the
            // range is committed again.
            // Safety: FFI call to mmap over a range this process owns.
            let fresh = unsafe {
                libc::mmap(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_FIXED,
                    -1,
                    0,
                )
            };
            if fresh == libc::MAP_FAILED {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            debug_assert_eq!(fresh.cast::<u8>(), ptr.as_ptr());
            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn map(size: usize, protection: PageProtection) -> Result<NonNull<u8>, VmError> {
            // Safety: anonymous private mapping, no aliasing.
            unsafe { mmap_anon(size, prot_flags(protection)) }
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // 64-bit targets only; the page size fits in usize.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

#[cfg(all(windows, not(any(loom, miri))))]
mod windows {
    use super::{NonNull, PageProtection, PlatformVmOps, VmError, VmOps};
    use std::ffi::c_void;
    use std::io;

    const MEM_COMMIT: u32 = 0x0000_1000;
    const MEM_RESERVE: u32 = 0x0000_2000;
    const MEM_DECOMMIT: u32 = 0x0000_4000;
    const MEM_RELEASE: u32 = 0x0000_8000;
    const PAGE_NOACCESS: u32 = 0x01;
    const PAGE_READWRITE: u32 = 0x04;
    const PAGE_EXECUTE_READWRITE: u32 = 0x40;

    #[repr(C)]
    struct SystemInfo {
        processor_architecture: u16,
        reserved: u16,
        page_size: u32,
        minimum_application_address: *mut c_void,
        maximum_application_address: *mut c_void,
        active_processor_mask: usize,
        number_of_processors: u32,
        processor_type: u32,
        allocation_granularity: u32,
        processor_level: u16,
        processor_revision: u16,
    }

    #[link(name = "kernel32")]
    unsafe extern "system" {
        fn VirtualAlloc(
            address: *mut c_void,
            size: usize,
            allocation_type: u32,
            protect: u32,
        ) -> *mut c_void;
        fn VirtualFree(address: *mut c_void, size: usize, free_type: u32) -> i32;
        fn GetSystemInfo(info: *mut SystemInfo);
    }

    fn page_flags(protection: PageProtection) -> u32 {
        match protection {
            PageProtection::ReadWrite => PAGE_READWRITE,
            PageProtection::ReadWriteExecute => PAGE_EXECUTE_READWRITE,
        }
    }

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to VirtualAlloc.
            let ptr = unsafe { VirtualAlloc(std::ptr::null_mut(), size, MEM_RESERVE, PAGE_NOACCESS) };
            NonNull::new(ptr.cast::<u8>())
                .ok_or_else(|| VmError::ReservationFailed(io::Error::last_os_error()))
        }

        unsafe fn commit(
            ptr: NonNull<u8>,
            size: usize,
            protection: PageProtection,
        ) -> Result<(), VmError> {
            // Safety: FFI call to VirtualAlloc.
            let result = unsafe {
                VirtualAlloc(ptr.as_ptr().cast::<c_void>(), size, MEM_COMMIT, page_flags(protection))
            };
            if result.is_null() {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to VirtualFree.
            if unsafe { VirtualFree(ptr.as_ptr().cast::<c_void>(), size, MEM_DECOMMIT) } == 0 {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
            // MEM_RELEASE requires size 0 and the base address of the region.
            // Safety: FFI call to VirtualFree.
            if unsafe { VirtualFree(ptr.as_ptr().cast::<c_void>(), 0, MEM_RELEASE) } == 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn map(size: usize, protection: PageProtection) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to VirtualAlloc.
            let ptr = unsafe {
                VirtualAlloc(
                    std::ptr::null_mut(),
                    size,
                    MEM_RESERVE | MEM_COMMIT,
                    page_flags(protection),
                )
            };
            NonNull::new(ptr.cast::<u8>())
                .ok_or_else(|| VmError::ReservationFailed(io::Error::last_os_error()))
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
            *PAGE_SIZE.get_or_init(|| {
                // Safety: SystemInfo is plain old data; GetSystemInfo fills it.
                let mut info: SystemInfo = unsafe { std::mem::zeroed() };
                // Safety: FFI call to GetSystemInfo with a valid out-pointer.
                unsafe { GetSystemInfo(&mut info) };
                info.page_size as usize
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Loom / Miri mock: heap-backed VmOps (no real mmap/VirtualAlloc)
//
// Under `cfg(loom)` we cannot issue real VM syscalls; loom runs inside a single
// OS process with its own scheduler. Every "reservation" is backed by a plain
// zeroed heap allocation. `commit`/`decommit` are no-ops: the memory is always
// accessible once reserved. `release` frees the heap block.
//
// This is enough to model the pool locking (loom) and to check the unsafe
// pointer code for UB (Miri). Page protection is exercised by the real
// platform implementation in normal builds.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
const MOCK_PAGE_SIZE: usize = 4096;

#[cfg(any(loom, miri))]
impl VmOps for PlatformVmOps {
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size reservation",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, MOCK_PAGE_SIZE)
            .map_err(|e| VmError::ReservationFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn commit(
        _ptr: NonNull<u8>,
        _size: usize,
        _protection: PageProtection,
    ) -> Result<(), VmError> {
        Ok(())
    }

    unsafe fn decommit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(())
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, MOCK_PAGE_SIZE)
            .map_err(|e| VmError::ReleaseFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `reserve`/`map`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    unsafe fn map(size: usize, _protection: PageProtection) -> Result<NonNull<u8>, VmError> {
        // Safety: caller guarantees size > 0.
        unsafe { Self::reserve(size) }
    }

    fn page_size() -> usize {
        MOCK_PAGE_SIZE
    }
}

#[cfg(all(test, not(any(loom, miri))))]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_commit_release() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Reserve failed");
            PlatformVmOps::commit(ptr, size, PageProtection::ReadWrite).expect("Commit failed");

            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            slice[0] = 42;
            slice[size - 1] = 24;
            assert_eq!(slice[0], 42);
            assert_eq!(slice[size - 1], 24);

            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_decommit_then_recommit() {
        let size = PlatformVmOps::page_size() * 4;
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).unwrap();
            PlatformVmOps::commit(ptr, size, PageProtection::ReadWrite).unwrap();
            ptr.as_ptr().write(7);
            PlatformVmOps::decommit(ptr, size).unwrap();

            // Recommitted pages are writable again and start out zeroed.
            PlatformVmOps::commit(ptr, size, PageProtection::ReadWrite).unwrap();
            assert!(std::slice::from_raw_parts(ptr.as_ptr(), size).iter().all(|&b| b == 0));
            ptr.as_ptr().write(9);
            assert_eq!(ptr.as_ptr().read(), 9);

            PlatformVmOps::release(ptr, size).unwrap();
        }
    }

    #[test]
    fn test_map_is_zeroed_and_page_aligned() {
        let page = PlatformVmOps::page_size();
        let size = page * 3;
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::map(size, PageProtection::ReadWrite).unwrap();
            assert_eq!(ptr.as_ptr() as usize % page, 0);
            let slice = std::slice::from_raw_parts(ptr.as_ptr(), size);
            assert!(slice.iter().all(|&b| b == 0));
            PlatformVmOps::release(ptr, size).unwrap();
        }
    }

    #[test]
    fn test_executable_commit() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).unwrap();
            PlatformVmOps::commit(ptr, size, PageProtection::ReadWriteExecute)
                .expect("RWX commit failed");
            ptr.as_ptr().write(0xC3);
            assert_eq!(ptr.as_ptr().read(), 0xC3);
            PlatformVmOps::release(ptr, size).unwrap();
        }
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        let page = PlatformVmOps::page_size();
        assert!(page.is_power_of_two());
        assert!(page >= 4096);
    }

    #[test]
    fn test_protection_from_executable() {
        assert_eq!(PageProtection::from_executable(false), PageProtection::ReadWrite);
        assert!(PageProtection::from_executable(true).is_executable());
    }
}
