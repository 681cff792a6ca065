//! Direct page-granular path for requests above the largest size class.
//!
//! Each allocation is its own mapping. A [`LargeHeader`] sits immediately
//! before the returned address so `free` and `block_size` need nothing but
//! the pointer.

use super::allocator::AllocError;
use super::stats;
use super::vm::{PageProtection, PlatformVmOps, VmOps};
use std::ptr::NonNull;

/// Bytes reserved in front of every large allocation.
pub(crate) const LARGE_HEADER_SIZE: usize = 32;

/// Alignment of large allocations made without an explicit alignment.
pub(crate) const LARGE_MIN_ALIGN: usize = 16;

const LARGE_TAG: usize = 0x4C52_4745_B10C_0A11;

#[repr(C)]
struct LargeHeader {
    /// `LARGE_TAG ^ base`, so a stale or foreign header is unlikely to pass.
    tag: usize,
    base: *mut u8,
    mapped: usize,
    _pad: usize,
}

const _: () = assert!(size_of::<LargeHeader>() == LARGE_HEADER_SIZE);

/// A freshly mapped large allocation.
pub(crate) struct LargeBlock {
    pub ptr: NonNull<u8>,
    pub mapped: usize,
}

/// Map `size` usable bytes aligned to `align` (a power of two no larger than
/// the page size).
///
/// # Errors
///
/// [`AllocError::SizeOverflow`] if the rounded request does not fit in the
/// address space, [`AllocError::OutOfMemory`] if the mapping fails.
pub(crate) fn map(
    size: usize,
    align: usize,
    protection: PageProtection,
) -> Result<LargeBlock, AllocError> {
    let page = PlatformVmOps::page_size();
    debug_assert!(align.is_power_of_two() && align <= page);

    let offset = LARGE_HEADER_SIZE.next_multiple_of(align.max(1));
    let mapped = offset
        .checked_add(size)
        .and_then(|n| n.checked_next_multiple_of(page))
        .filter(|&n| n <= isize::MAX.cast_unsigned())
        .ok_or(AllocError::SizeOverflow { size })?;

    // Safety: mapped is non-zero and page-granular.
    let base = unsafe { PlatformVmOps::map(mapped, protection) }.map_err(|err| {
        log::warn!("large allocation of {size} bytes ({mapped} mapped) failed: {err}");
        AllocError::OutOfMemory { size }
    })?;

    // Safety: offset < mapped and offset >= LARGE_HEADER_SIZE.
    let ptr = unsafe { base.add(offset) };
    // Safety: the header lies inside the mapping and is suitably aligned
    // (offset is a multiple of 32 or of a larger power of two).
    unsafe {
        ptr.sub(LARGE_HEADER_SIZE)
            .cast::<LargeHeader>()
            .write(LargeHeader {
                tag: LARGE_TAG ^ base.as_ptr().addr(),
                base: base.as_ptr(),
                mapped,
                _pad: 0,
            });
    }

    stats::TOTAL_RESERVED.add(mapped);
    stats::TOTAL_COMMITTED.add(mapped);
    stats::LARGE_COMMITTED.add(mapped);
    log::trace!("mapped large block {ptr:p} ({size} bytes, {mapped} mapped)");

    Ok(LargeBlock { ptr, mapped })
}

/// # Safety
/// `ptr` must be a live large allocation.
unsafe fn header<'a>(ptr: NonNull<u8>) -> &'a LargeHeader {
    assert!(
        ptr.as_ptr().addr() >= LARGE_HEADER_SIZE
            && ptr.as_ptr().addr().is_multiple_of(LARGE_MIN_ALIGN),
        "{ptr:p} is not a live allocation of this allocator"
    );
    // Safety: caller guarantees a header precedes ptr.
    let header = unsafe { &*ptr.as_ptr().sub(LARGE_HEADER_SIZE).cast::<LargeHeader>() };
    debug_assert!(
        header.tag == LARGE_TAG ^ header.base.addr(),
        "{ptr:p} is not a live allocation of this allocator"
    );
    header
}

/// Usable bytes from `ptr` to the end of its mapping.
///
/// # Safety
/// `ptr` must be a live large allocation.
pub(crate) unsafe fn usable_size(ptr: NonNull<u8>) -> usize {
    // Safety: forwarded.
    let header = unsafe { header(ptr) };
    header.mapped - (ptr.as_ptr().addr() - header.base.addr())
}

/// Unmap a large allocation, returning how many bytes were mapped.
///
/// # Safety
/// `ptr` must be a live large allocation; it is dangling afterwards.
pub(crate) unsafe fn unmap(ptr: NonNull<u8>) -> usize {
    // Safety: forwarded.
    let header = unsafe { header(ptr) };
    let (base, mapped) = (header.base, header.mapped);

    // Safety: base is the non-null start of the mapping.
    let base = unsafe { NonNull::new_unchecked(base) };
    // Safety: the mapping is released exactly once, here.
    if let Err(err) = unsafe { PlatformVmOps::release(base, mapped) } {
        log::warn!("releasing large block {ptr:p} ({mapped} bytes) failed: {err}");
    }

    stats::TOTAL_RESERVED.sub(mapped);
    stats::TOTAL_COMMITTED.sub(mapped);
    stats::LARGE_COMMITTED.sub(mapped);
    log::trace!("unmapped large block {ptr:p} ({mapped} bytes)");
    mapped
}
