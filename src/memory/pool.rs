//! One size class: a fixed span of chunk slots, three chunk lists and the
//! idle-chunk trimming policy.
//!
//! A `Pool` is always accessed under its allocator's per-pool
//! [`SpinMutex`](super::spin::SpinMutex). Growth commits a chunk outside the
//! lock via [`Pool::probe_growth`] / [`Pool::integrate_growth`].

use super::allocator::AllocError;
use super::chunk::{ChunkMeta, ChunkState};
use super::dllist::IndexList;
use super::stats;
use super::vm::{PlatformVmOps, VmError, VmOps};
use std::ptr::NonNull;

/// Per-pool tuning taken from the allocator configuration.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PoolParams {
    pub chunk_size: usize,
    pub max_chunks: u32,
    pub max_idle_age: u64,
    pub trim_check_frequency: u64,
}

/// A chunk slot marked `Pending`, to be committed outside the pool lock.
/// Returned by [`Pool::probe_growth`]; consumed by [`Pool::integrate_growth`].
pub(crate) struct GrowRequest {
    pub ptr: NonNull<u8>,
    pub size: usize,
    slot: u32,
}

// Safety: the request only names a slot inside the pool's own span.
unsafe impl Send for GrowRequest {}

/// Point-in-time view of one pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub block_size: usize,
    pub blocks_per_chunk: usize,
    pub free_chunks: usize,
    pub partial_chunks: usize,
    pub full_chunks: usize,
    pub live_blocks: usize,
    pub committed_bytes: usize,
    pub tick: u64,
}

impl PoolStats {
    /// Committed chunks, whatever their occupancy.
    #[must_use]
    pub fn chunks(&self) -> usize {
        self.free_chunks + self.partial_chunks + self.full_chunks
    }
}

pub(crate) struct Pool {
    class_index: usize,
    block_size: usize,
    blocks_per_chunk: u16,
    base: NonNull<u8>,
    params: PoolParams,
    /// Slot metadata up to the high-water mark; slot `i` lives at
    /// `base + i * chunk_size`.
    chunks: Vec<ChunkMeta>,
    free: IndexList,
    partial: IndexList,
    full: IndexList,
    /// Decommitted slots below the high-water mark.
    vacant: Vec<u32>,
    live_blocks: usize,
    committed: usize,
    /// Operation counter driving the trim policy.
    tick: u64,
}

// Safety: Pool only addresses its own slice of the allocator's reservation and
// is always reached through the allocator's per-pool lock.
unsafe impl Send for Pool {}

impl Pool {
    /// # Safety / Constraints
    /// `base` must start a reserved, chunk-aligned span of
    /// `params.max_chunks * params.chunk_size` bytes that outlives the pool.
    pub fn new(class_index: usize, block_size: usize, base: NonNull<u8>, params: PoolParams) -> Self {
        debug_assert!(block_size >= 8, "block size {block_size} cannot hold a free-list link");
        debug_assert!(params.chunk_size >= block_size);
        let blocks_per_chunk = u16::try_from(params.chunk_size / block_size).unwrap_or(u16::MAX);

        Self {
            class_index,
            block_size,
            blocks_per_chunk,
            base,
            params,
            chunks: Vec::new(),
            free: IndexList::new(),
            partial: IndexList::new(),
            full: IndexList::new(),
            vacant: Vec::new(),
            live_blocks: 0,
            committed: 0,
            tick: 0,
        }
    }

    #[inline]
    fn chunk_base(&self, id: u32) -> NonNull<u8> {
        // Safety: id < max_chunks, so the slot lies inside the pool's span.
        unsafe { self.base.add(id as usize * self.params.chunk_size) }
    }

    /// Hand out a block from an already committed chunk.
    ///
    /// Prefers the most recently used partial chunk, then the most recently
    /// idled free chunk. Returns `None` when the pool must grow.
    pub fn try_alloc(&mut self) -> Option<NonNull<u8>> {
        let id = self.partial.front().or_else(|| self.free.front())?;
        let ptr = self.take_from(id);
        self.advance_tick();
        Some(ptr)
    }

    fn take_from(&mut self, id: u32) -> NonNull<u8> {
        let chunk_base = self.chunk_base(id);
        let (block_size, bpc) = (self.block_size, self.blocks_per_chunk);
        // Safety: chunk `id` is committed (it is on the free or partial list).
        let block = unsafe { self.chunks[id as usize].take_block(chunk_base, block_size, bpc) };
        debug_assert!(block.is_some(), "chunk {id} listed with room but has none");
        let block = block.unwrap_or_default();

        self.live_blocks += 1;
        self.settle(id);
        // Safety: block < blocks_per_chunk.
        unsafe { chunk_base.add(block as usize * block_size) }
    }

    /// Pick a slot for a new chunk and mark it `Pending`.
    ///
    /// # Errors
    ///
    /// [`AllocError::OutOfMemory`] when every slot of the span is in use.
    pub fn probe_growth(&mut self) -> Result<GrowRequest, AllocError> {
        let slot = if let Some(slot) = self.vacant.pop() {
            slot
        } else if let Ok(slot) = u32::try_from(self.chunks.len())
            && slot < self.params.max_chunks
        {
            self.chunks.push(ChunkMeta::vacant());
            slot
        } else {
            log::warn!(
                "pool {} ({} B blocks) exhausted its {} chunk slots",
                self.class_index,
                self.block_size,
                self.params.max_chunks
            );
            return Err(AllocError::OutOfMemory {
                size: self.block_size,
            });
        };

        self.chunks[slot as usize].state = ChunkState::Pending;
        Ok(GrowRequest {
            ptr: self.chunk_base(slot),
            size: self.params.chunk_size,
            slot,
        })
    }

    /// Finish a growth started by [`probe_growth`](Self::probe_growth) once
    /// `committed` reports the outcome of committing `req`.
    ///
    /// If another thread made a block available while the lock was dropped,
    /// that block is used and the new chunk is released again.
    ///
    /// # Errors
    ///
    /// [`AllocError::OutOfMemory`] if the commit failed; the pool lists are
    /// left exactly as they were.
    pub fn integrate_growth(
        &mut self,
        req: GrowRequest,
        committed: Result<(), VmError>,
    ) -> Result<NonNull<u8>, AllocError> {
        let slot = req.slot;
        debug_assert_eq!(self.chunks[slot as usize].state, ChunkState::Pending);

        if let Err(err) = committed {
            log::warn!(
                "pool {}: committing chunk {slot} at {:p} failed: {err}",
                self.class_index,
                req.ptr
            );
            self.chunks[slot as usize].state = ChunkState::Vacant;
            self.vacant.push(slot);
            return Err(AllocError::OutOfMemory {
                size: self.block_size,
            });
        }

        self.committed += req.size;
        stats::TOTAL_COMMITTED.add(req.size);
        stats::POOL_COMMITTED.add(req.size);
        stats::POOL_LIVE_CHUNKS.add(1);
        log::trace!(
            "pool {}: committed chunk {slot} at {:p}",
            self.class_index,
            req.ptr
        );

        if let Some(ptr) = self.try_alloc() {
            // Lost the race: someone freed or grew while we were unlocked.
            self.release_chunk(slot);
            return Ok(ptr);
        }

        let bpc = self.blocks_per_chunk;
        let meta = &mut self.chunks[slot as usize];
        meta.activate(bpc);
        meta.state = ChunkState::Free;
        meta.idle_since = self.tick;
        self.free.push_front(self.chunks.as_mut_slice(), slot);

        let ptr = self.take_from(slot);
        self.advance_tick();
        Ok(ptr)
    }

    /// Return a block to its chunk.
    ///
    /// # Safety
    /// `ptr` must be a live block handed out by this pool.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let offset = ptr.as_ptr() as usize - self.base.as_ptr() as usize;
        let chunk_size = self.params.chunk_size;
        let id = offset / chunk_size;
        let within = offset % chunk_size;

        debug_assert!(
            within.is_multiple_of(self.block_size),
            "{ptr:p} is not the start of a {} B block",
            self.block_size
        );
        debug_assert!(
            id < self.chunks.len()
                && matches!(
                    self.chunks[id].state,
                    ChunkState::Partial | ChunkState::Full
                ),
            "{ptr:p} does not belong to a live chunk of pool {}",
            self.class_index
        );

        #[allow(clippy::cast_possible_truncation)]
        let (id, block) = (id as u32, (within / self.block_size) as u16);
        let chunk_base = self.chunk_base(id);
        // Safety: caller guarantees ptr is a live block of chunk `id`.
        unsafe { self.chunks[id as usize].put_block(chunk_base, self.block_size, block) };

        self.live_blocks -= 1;
        self.settle(id);
        self.advance_tick();
    }

    /// Move chunk `id` to the list matching its occupancy, if it changed.
    fn settle(&mut self, id: u32) {
        let bpc = self.blocks_per_chunk;
        let meta = &self.chunks[id as usize];
        let target = match meta.in_use() {
            0 => ChunkState::Free,
            n if n == bpc => ChunkState::Full,
            _ => ChunkState::Partial,
        };

        if meta.state != target {
            let Self {
                chunks,
                free,
                partial,
                full,
                tick,
                ..
            } = self;
            let store = chunks.as_mut_slice();
            match store[id as usize].state {
                ChunkState::Free => free.remove(store, id),
                ChunkState::Partial => partial.remove(store, id),
                ChunkState::Full => full.remove(store, id),
                ChunkState::Vacant | ChunkState::Pending => {
                    debug_assert!(false, "chunk {id} is not on any list");
                }
            }
            match target {
                ChunkState::Free => {
                    store[id as usize].idle_since = *tick;
                    free.push_front(store, id);
                }
                ChunkState::Partial => partial.push_front(store, id),
                _ => full.push_front(store, id),
            }
            store[id as usize].state = target;
        }

        #[cfg(debug_assertions)]
        self.chunks[id as usize].sanity_check(id, bpc);
    }

    fn advance_tick(&mut self) {
        self.tick += 1;
        if self.tick.is_multiple_of(self.params.trim_check_frequency) {
            self.trim_idle();
        }
    }

    /// Release free chunks idle longer than `max_idle_age` ticks, oldest
    /// first, stopping at the first younger one.
    fn trim_idle(&mut self) -> usize {
        let mut released = 0;
        while let Some(id) = self.free.back() {
            let idle = self.tick - self.chunks[id as usize].idle_since;
            if idle <= self.params.max_idle_age {
                break;
            }
            self.free.remove(self.chunks.as_mut_slice(), id);
            self.release_chunk(id);
            released += 1;
        }
        if released > 0 {
            log::debug!(
                "pool {}: trimmed {released} idle chunk(s) at tick {}",
                self.class_index,
                self.tick
            );
        }
        released
    }

    /// Release every free chunk regardless of age. Returns how many.
    pub fn trim(&mut self) -> usize {
        let mut victims = IndexList::new();
        victims.append(self.chunks.as_mut_slice(), &mut self.free);

        let released = victims.len();
        while let Some(id) = victims.pop_front(self.chunks.as_mut_slice()) {
            self.release_chunk(id);
        }
        if released > 0 {
            log::debug!("pool {}: trimmed {released} free chunk(s)", self.class_index);
        }
        released
    }

    /// Decommit an unlinked, unused chunk and put its slot on the vacant stack.
    fn release_chunk(&mut self, id: u32) {
        let ptr = self.chunk_base(id);
        let size = self.params.chunk_size;

        // Safety: the slot is committed, unlinked and holds no live blocks.
        if let Err(err) = unsafe { PlatformVmOps::decommit(ptr, size) } {
            log::warn!(
                "pool {}: decommitting chunk {id} at {ptr:p} failed: {err}",
                self.class_index
            );
        }
        self.committed -= size;
        stats::TOTAL_COMMITTED.sub(size);
        stats::POOL_COMMITTED.sub(size);
        stats::POOL_LIVE_CHUNKS.sub(1);
        log::trace!("pool {}: released chunk {id} at {ptr:p}", self.class_index);

        self.chunks[id as usize].retire();
        self.vacant.push(id);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            block_size: self.block_size,
            blocks_per_chunk: usize::from(self.blocks_per_chunk),
            free_chunks: self.free.len(),
            partial_chunks: self.partial.len(),
            full_chunks: self.full.len(),
            live_blocks: self.live_blocks,
            committed_bytes: self.committed,
            tick: self.tick,
        }
    }

    /// Full walk of every list against the slot metadata.
    #[cfg(test)]
    pub fn check_lists(&self) {
        let store = self.chunks.as_slice();
        let mut live = 0usize;
        let mut on_lists = 0usize;
        for (list, state) in [
            (&self.free, ChunkState::Free),
            (&self.partial, ChunkState::Partial),
            (&self.full, ChunkState::Full),
        ] {
            for id in list.iter(store) {
                let meta = &store[id as usize];
                assert_eq!(meta.state, state, "chunk {id} tagged {:?} but listed as {state:?}", meta.state);
                #[cfg(debug_assertions)]
                meta.sanity_check(id, self.blocks_per_chunk);
                live += usize::from(meta.in_use());
                on_lists += 1;
            }
        }
        assert_eq!(live, self.live_blocks, "live block count drifted");
        assert_eq!(
            on_lists * self.params.chunk_size,
            self.committed,
            "committed bytes disagree with listed chunks"
        );
        for &slot in &self.vacant {
            assert_eq!(store[slot as usize].state, ChunkState::Vacant);
        }
    }
}
