use super::config::PoolAllocatorConfig;
use super::large::{self, LARGE_MIN_ALIGN};
use super::pool::{Pool, PoolParams, PoolStats};
use super::size_class::{NUM_SIZE_CLASSES, SizeClasses};
use super::spin::SpinMutex;
use super::stats;
use super::vm::{PageProtection, PlatformVmOps, VmError, VmOps};
use crate::sync::atomic::{AtomicUsize, Ordering};
use std::ptr::NonNull;

#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error("out of memory allocating {size} bytes")]
    OutOfMemory { size: usize },
    #[error(transparent)]
    Vm(#[from] VmError),
    #[error("invalid allocator configuration: {0}")]
    InvalidConfig(String),
    #[error("alignment {align} is not a power of two no larger than the page size")]
    UnsupportedAlignment { align: usize },
    #[error("allocation of {size} bytes overflows the address space")]
    SizeOverflow { size: usize },
}

/// Per-allocator snapshot returned by [`PoolAllocator::stats`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocatorStats {
    pub pools: [PoolStats; NUM_SIZE_CLASSES],
    pub large_allocations: usize,
    pub large_bytes: usize,
}

impl AllocatorStats {
    /// Committed chunks across every pool.
    #[must_use]
    pub fn pooled_chunks(&self) -> usize {
        self.pools.iter().map(PoolStats::chunks).sum()
    }

    /// Bytes committed by pools plus bytes mapped by live large allocations.
    #[must_use]
    pub fn committed_bytes(&self) -> usize {
        self.pools.iter().map(|p| p.committed_bytes).sum::<usize>() + self.large_bytes
    }
}

/// Size-segregated pool allocator.
///
/// Twelve pools, one per size class, each behind its own spin lock. All pools
/// share one contiguous reservation: pool `i` owns
/// `[base + i * span, base + (i + 1) * span)`, so the owner of any pointer is
/// found with one range test and one division. Requests above the largest
/// class bypass the pools and get a dedicated mapping.
///
/// Page protection (executable or not) is fixed at construction.
pub struct PoolAllocator {
    pools: [SpinMutex<Pool>; NUM_SIZE_CLASSES],
    classes: SizeClasses,
    protection: PageProtection,
    region: NonNull<u8>,
    region_size: usize,
    /// Chunk-aligned start of pool 0 inside `region`.
    base: NonNull<u8>,
    span: usize,
    chunk_size: usize,
    page_size: usize,
    large_count: AtomicUsize,
    large_bytes: AtomicUsize,
}

// Safety: every pool is behind its own lock and the region is only released
// on drop.
unsafe impl Send for PoolAllocator {}
// Safety: see above; the large-path counters are atomics.
unsafe impl Sync for PoolAllocator {}

impl std::fmt::Debug for PoolAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolAllocator")
            .field("protection", &self.protection)
            .field("size_classes", self.classes.as_array())
            .field("chunk_size", &self.chunk_size)
            .field("base", &self.base)
            .field("span", &self.span)
            .finish_non_exhaustive()
    }
}

impl Drop for PoolAllocator {
    fn drop(&mut self) {
        let mut committed = 0;
        let mut chunks = 0;
        for pool in &self.pools {
            let pool = pool.lock().stats();
            committed += pool.committed_bytes;
            chunks += pool.chunks();
        }

        let live_large = self.large_count.load(Ordering::Relaxed);
        if live_large > 0 {
            log::warn!("dropping pool allocator with {live_large} live large allocation(s)");
        }

        // Safety: nothing in this allocator can reach the region any more.
        if let Err(err) = unsafe { PlatformVmOps::release(self.region, self.region_size) } {
            log::warn!("releasing pool region at {:p} failed: {err}", self.region);
        }
        stats::TOTAL_RESERVED.sub(self.region_size);
        stats::TOTAL_COMMITTED.sub(committed);
        stats::POOL_COMMITTED.sub(committed);
        stats::POOL_LIVE_CHUNKS.sub(chunks);
        log::debug!("pool allocator at {:p} dropped", self.base);
    }
}

impl PoolAllocator {
    /// Allocator with the default configuration and the given protection mode.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::Vm`] if the address space cannot be reserved.
    pub fn new(executable: bool) -> Result<Self, AllocError> {
        Self::with_config(PoolAllocatorConfig::executable(executable))
    }

    /// # Errors
    ///
    /// [`AllocError::InvalidConfig`] if `config` fails validation,
    /// [`AllocError::Vm`] if the address space cannot be reserved.
    pub fn with_config(config: PoolAllocatorConfig) -> Result<Self, AllocError> {
        let page_size = PlatformVmOps::page_size();
        config.validate(page_size)?;

        let chunk_size = config.resolved_chunk_size(page_size);
        let span = config.pool_reserved_size;
        // Over-reserve by one chunk so the pool spans can start chunk-aligned.
        let region_size = span * NUM_SIZE_CLASSES + chunk_size;

        // Safety: FFI call to reserve address space.
        let region = unsafe { PlatformVmOps::reserve(region_size)? };
        stats::TOTAL_RESERVED.add(region_size);

        let addr = region.as_ptr().addr();
        // Safety: the padding is less than chunk_size, which was over-reserved.
        let base = unsafe { region.add(addr.next_multiple_of(chunk_size) - addr) };

        let params = PoolParams {
            chunk_size,
            max_chunks: u32::try_from(span / chunk_size).unwrap_or(u32::MAX),
            max_idle_age: config.max_idle_age,
            trim_check_frequency: config.trim_check_frequency,
        };
        let classes = SizeClasses::new(config.size_classes);
        let pools = std::array::from_fn(|i| {
            // Safety: i < NUM_SIZE_CLASSES, so the span lies inside the region.
            let pool_base = unsafe { base.add(i * span) };
            SpinMutex::new(Pool::new(i, classes.block_size(i), pool_base, params))
        });

        log::debug!(
            "pool allocator reserved {region_size} bytes at {base:p} \
             (chunk {chunk_size} B, span {span} B, executable: {})",
            config.executable
        );

        Ok(Self {
            pools,
            classes,
            protection: config.protection(),
            region,
            region_size,
            base,
            span,
            chunk_size,
            page_size,
            large_count: AtomicUsize::new(0),
            large_bytes: AtomicUsize::new(0),
        })
    }

    /// Allocate at least `size` bytes. A request of 0 bytes is served as 1.
    ///
    /// # Errors
    ///
    /// [`AllocError::OutOfMemory`] if the pool or the OS cannot supply memory,
    /// [`AllocError::SizeOverflow`] for sizes that cannot be mapped at all.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        match self.classes.index(size) {
            Some(idx) => self.allocate_pooled(idx),
            None => self.allocate_large(size, LARGE_MIN_ALIGN),
        }
    }

    /// Allocate at least `size` bytes aligned to `align`.
    ///
    /// Pooled requests go to the smallest class whose blocks are naturally
    /// aligned to `align`; everything else takes the large path.
    ///
    /// # Errors
    ///
    /// [`AllocError::UnsupportedAlignment`] if `align` is not a power of two
    /// or exceeds the page size; otherwise as [`allocate`](Self::allocate).
    pub fn allocate_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        if !align.is_power_of_two() || align > self.page_size {
            return Err(AllocError::UnsupportedAlignment { align });
        }
        match self.classes.index_aligned(size, align, self.chunk_size) {
            Some(idx) => self.allocate_pooled(idx),
            None => self.allocate_large(size, align.max(LARGE_MIN_ALIGN)),
        }
    }

    fn allocate_pooled(&self, idx: usize) -> Result<NonNull<u8>, AllocError> {
        let pool = &self.pools[idx];
        let req = {
            let mut guard = pool.lock();
            if let Some(ptr) = guard.try_alloc() {
                return Ok(ptr);
            }
            guard.probe_growth()?
        };

        // The slot is Pending, so no other thread touches it while unlocked.
        // Safety: req names an uncommitted chunk slot inside this pool's span.
        let committed = unsafe { PlatformVmOps::commit(req.ptr, req.size, self.protection) };
        pool.lock().integrate_growth(req, committed)
    }

    fn allocate_large(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        let block = large::map(size, align, self.protection)?;
        self.large_count.fetch_add(1, Ordering::Relaxed);
        self.large_bytes.fetch_add(block.mapped, Ordering::Relaxed);
        Ok(block.ptr)
    }

    /// Pool index owning `ptr`, or `None` for large allocations.
    #[inline]
    fn pool_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let offset = ptr.as_ptr().addr().wrapping_sub(self.base.as_ptr().addr());
        (offset < self.span * NUM_SIZE_CLASSES).then(|| offset / self.span)
    }

    /// Release a block. `None` is a no-op.
    ///
    /// # Safety
    /// `ptr` must have been returned by this allocator and not freed since.
    pub unsafe fn free(&self, ptr: Option<NonNull<u8>>) {
        let Some(ptr) = ptr else {
            return;
        };
        if let Some(idx) = self.pool_of(ptr) {
            // Safety: caller guarantees ptr is a live block of pool `idx`.
            unsafe { self.pools[idx].lock().free(ptr) };
        } else {
            // Safety: caller guarantees ptr is a live large allocation.
            let mapped = unsafe { large::unmap(ptr) };
            self.large_count.fetch_sub(1, Ordering::Relaxed);
            self.large_bytes.fetch_sub(mapped, Ordering::Relaxed);
        }
    }

    /// Usable bytes at `ptr`: the class size for pooled blocks, the mapped
    /// remainder for large allocations. Always at least the requested size.
    ///
    /// # Safety
    /// `ptr` must be a live allocation of this allocator.
    pub unsafe fn block_size(&self, ptr: NonNull<u8>) -> usize {
        match self.pool_of(ptr) {
            Some(idx) => self.classes.block_size(idx),
            // Safety: forwarded.
            None => unsafe { large::usable_size(ptr) },
        }
    }

    /// Resize an allocation.
    ///
    /// - `None` behaves like [`allocate`](Self::allocate).
    /// - `new_size == 0` frees `ptr` and returns `Ok(None)`.
    /// - A block keeps its address when the new size maps to the same class,
    ///   or when a large allocation stays large and fits its mapping.
    /// - Otherwise the contents up to the smaller size are copied to a new
    ///   block and the old one is freed. On failure the old block is intact.
    ///
    /// # Errors
    ///
    /// As [`allocate`](Self::allocate).
    ///
    /// # Safety
    /// `ptr`, if present, must be a live allocation of this allocator. After a
    /// successful call it must not be used unless it was returned again.
    pub unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let Some(old) = ptr else {
            return self.allocate(new_size).map(Some);
        };
        if new_size == 0 {
            // Safety: forwarded.
            unsafe { self.free(Some(old)) };
            return Ok(None);
        }

        // Safety: forwarded.
        let old_size = unsafe { self.block_size(old) };
        match (self.pool_of(old), self.classes.index(new_size)) {
            (Some(from), Some(to)) if from == to => return Ok(Some(old)),
            (None, None) if new_size <= old_size => return Ok(Some(old)),
            _ => {}
        }

        let new = self.allocate(new_size)?;
        // Safety: forwarded; distinct live blocks never overlap.
        unsafe { self.move_block(old, new, old_size.min(new_size)) };
        Ok(Some(new))
    }

    /// Resize keeping `align`, for [`GlobalAlloc::realloc`](std::alloc::GlobalAlloc::realloc).
    ///
    /// # Errors
    ///
    /// As [`allocate_aligned`](Self::allocate_aligned).
    ///
    /// # Safety
    /// `ptr` must be a live allocation of this allocator made with `align`.
    pub unsafe fn reallocate_aligned(
        &self,
        ptr: NonNull<u8>,
        new_size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        // Safety: forwarded.
        let old_size = unsafe { self.block_size(ptr) };
        match (
            self.pool_of(ptr),
            self.classes.index_aligned(new_size, align, self.chunk_size),
        ) {
            (Some(from), Some(to)) if from == to => return Ok(ptr),
            (None, None) if new_size <= old_size => return Ok(ptr),
            _ => {}
        }

        let new = self.allocate_aligned(new_size, align)?;
        // Safety: forwarded.
        unsafe { self.move_block(ptr, new, old_size.min(new_size)) };
        Ok(new)
    }

    /// # Safety
    /// `old` and `new` are distinct live blocks holding at least `len` bytes.
    unsafe fn move_block(&self, old: NonNull<u8>, new: NonNull<u8>, len: usize) {
        // Safety: caller guarantees both ranges are valid and disjoint.
        unsafe {
            std::ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), len);
            self.free(Some(old));
        }
    }

    /// Release every fully free chunk of every pool now, regardless of age.
    /// Returns the number of chunks released.
    pub fn trim(&self) -> usize {
        let released: usize = self.pools.iter().map(|pool| pool.lock().trim()).sum();
        log::debug!("trim released {released} chunk(s)");
        released
    }

    #[must_use]
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            pools: std::array::from_fn(|i| self.pools[i].lock().stats()),
            large_allocations: self.large_count.load(Ordering::Relaxed),
            large_bytes: self.large_bytes.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn is_executable(&self) -> bool {
        self.protection.is_executable()
    }

    #[must_use]
    pub fn protection(&self) -> PageProtection {
        self.protection
    }

    /// Largest request served from a pool; anything bigger is mapped directly.
    #[must_use]
    pub fn max_pooled_size(&self) -> usize {
        self.classes.max_size()
    }

    #[must_use]
    pub fn size_classes(&self) -> &[usize; NUM_SIZE_CLASSES] {
        self.classes.as_array()
    }

    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Debug walk of every pool's lists.
    #[cfg(test)]
    pub(crate) fn check_pools(&self) {
        for pool in &self.pools {
            pool.lock().check_lists();
        }
    }
}
