use super::allocator::{AllocError, PoolAllocator};
use super::config::PoolAllocatorConfig;
use crate::sync::OnceLock;
use std::alloc::{GlobalAlloc, Layout};
use std::ptr::NonNull;

static GLOBAL_POOL_INSTANCE: OnceLock<PoolAllocator> = OnceLock::new();

/// Process-wide [`PoolAllocator`], created on first use with the default
/// configuration unless [`init`](Self::init) ran first.
///
/// Also usable as a [`GlobalAlloc`] handle. Pool metadata lives on the system
/// heap, so this is not meant to be the process `#[global_allocator]`.
#[derive(Clone, Copy, Debug, Default)]
pub struct GlobalPoolAllocator;

impl GlobalPoolAllocator {
    /// Create the global instance from `config`.
    ///
    /// # Errors
    ///
    /// [`AllocError::InvalidConfig`] if the instance already exists or
    /// `config` is invalid; [`AllocError::Vm`] if reservation fails.
    pub fn init(config: PoolAllocatorConfig) -> Result<(), AllocError> {
        if GLOBAL_POOL_INSTANCE.get().is_some() {
            return Err(already_initialized());
        }
        GLOBAL_POOL_INSTANCE
            .set(PoolAllocator::with_config(config)?)
            .map_err(|_| already_initialized())
    }

    /// The global instance, if it has been created.
    #[must_use]
    pub fn get() -> Option<&'static PoolAllocator> {
        GLOBAL_POOL_INSTANCE.get()
    }

    /// The global instance, creating it with the default configuration if
    /// needed.
    ///
    /// # Errors
    ///
    /// [`AllocError::Vm`] if the default instance cannot reserve its region.
    pub fn instance() -> Result<&'static PoolAllocator, AllocError> {
        if let Some(allocator) = GLOBAL_POOL_INSTANCE.get() {
            return Ok(allocator);
        }
        let fresh = PoolAllocator::with_config(PoolAllocatorConfig::default())?;
        // Losing the race drops `fresh`; the winner is returned either way.
        drop(GLOBAL_POOL_INSTANCE.set(fresh));
        GLOBAL_POOL_INSTANCE
            .get()
            .ok_or(AllocError::OutOfMemory { size: 0 })
    }

    /// See [`PoolAllocator::allocate`].
    ///
    /// # Errors
    ///
    /// As [`PoolAllocator::allocate`], or if the instance cannot be created.
    pub fn allocate(size: usize) -> Result<NonNull<u8>, AllocError> {
        Self::instance()?.allocate(size)
    }

    /// See [`PoolAllocator::reallocate`].
    ///
    /// # Errors
    ///
    /// As [`PoolAllocator::reallocate`].
    ///
    /// # Safety
    /// `ptr`, if present, must be a live allocation of the global instance.
    pub unsafe fn reallocate(
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        // Safety: forwarded.
        unsafe { Self::instance()?.reallocate(ptr, new_size) }
    }

    /// See [`PoolAllocator::free`].
    ///
    /// # Safety
    /// `ptr`, if present, must be a live allocation of the global instance.
    pub unsafe fn free(ptr: Option<NonNull<u8>>) {
        if ptr.is_none() {
            return;
        }
        let allocator = Self::get();
        debug_assert!(allocator.is_some(), "free before the global pool allocator exists");
        if let Some(allocator) = allocator {
            // Safety: forwarded.
            unsafe { allocator.free(ptr) };
        }
    }

    /// See [`PoolAllocator::block_size`]. Returns 0 if the global instance
    /// was never created.
    ///
    /// # Safety
    /// `ptr` must be a live allocation of the global instance.
    pub unsafe fn block_size(ptr: NonNull<u8>) -> usize {
        // Safety: forwarded.
        Self::get().map_or(0, |allocator| unsafe { allocator.block_size(ptr) })
    }

    /// Trim every pool of the global instance, if it exists.
    pub fn trim() -> usize {
        Self::get().map_or(0, PoolAllocator::trim)
    }
}

fn already_initialized() -> AllocError {
    AllocError::InvalidConfig("global pool allocator already initialized".to_string())
}

// Safety: every block returned honours `layout.align()` and holds at least
// `layout.size()` bytes; failures return null.
unsafe impl GlobalAlloc for GlobalPoolAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match Self::instance().and_then(|a| a.allocate_aligned(layout.size(), layout.align())) {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => std::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // Safety: ptr came from `alloc`/`realloc` above.
        unsafe { Self::free(NonNull::new(ptr)) };
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let (Some(ptr), Some(allocator)) = (NonNull::new(ptr), Self::get()) else {
            return std::ptr::null_mut();
        };
        // Safety: ptr came from `alloc` with `layout`.
        match unsafe { allocator.reallocate_aligned(ptr, new_size, layout.align()) } {
            Ok(new) => new.as_ptr(),
            Err(_) => std::ptr::null_mut(),
        }
    }
}
