use super::dllist::{Link, LinkStore};
#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;
use std::ptr::NonNull;

/// Terminates a chunk's free-block list.
pub(crate) const NO_BLOCK: u16 = u16::MAX;

/// Canary written at byte 4 of every freed block.
/// Checked when the block is handed out again to detect writes after free.
/// Only active when debug assertions are enabled.
#[cfg(debug_assertions)]
const FREE_CANARY: u32 = 0xDE_AD_F0_0D;

/// Which list of its pool a chunk slot currently sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ChunkState {
    /// Slot is decommitted and on the pool's vacant stack.
    Vacant,
    /// Slot is being committed outside the pool lock.
    Pending,
    /// Committed, zero blocks in use.
    Free,
    /// Committed, some but not all blocks in use.
    Partial,
    /// Committed, every block in use.
    Full,
}

/// Metadata for one chunk slot of a pool.
///
/// Blocks are handed out from the LIFO free list first, then from the bump
/// cursor over never-used blocks. The free list is threaded through the
/// freed blocks themselves: bytes `0..2` of a free block hold the index of
/// the next free block.
pub(crate) struct ChunkMeta {
    pub link: Link,
    pub state: ChunkState,
    /// Pool tick at which the chunk last became fully free.
    pub idle_since: u64,
    in_use: u16,
    bump: u16,
    free_head: u16,
    free_len: u16,
    #[cfg(debug_assertions)]
    free_map: FixedBitSet,
}

impl ChunkMeta {
    pub fn vacant() -> Self {
        Self {
            link: Link::detached(),
            state: ChunkState::Vacant,
            idle_since: 0,
            in_use: 0,
            bump: 0,
            free_head: NO_BLOCK,
            free_len: 0,
            #[cfg(debug_assertions)]
            free_map: FixedBitSet::new(),
        }
    }

    /// Reset counters for a freshly committed chunk with every block unused.
    pub fn activate(&mut self, blocks_per_chunk: u16) {
        debug_assert_eq!(self.link, Link::detached());
        self.in_use = 0;
        self.bump = 0;
        self.free_head = NO_BLOCK;
        self.free_len = 0;
        #[cfg(debug_assertions)]
        {
            self.free_map = FixedBitSet::with_capacity(blocks_per_chunk as usize);
            self.free_map.insert_range(..);
        }
        #[cfg(not(debug_assertions))]
        let _ = blocks_per_chunk;
    }

    /// Forget everything about the blocks; the slot is going back to vacant.
    pub fn retire(&mut self) {
        debug_assert_eq!(self.in_use, 0, "retiring a chunk with live blocks");
        self.state = ChunkState::Vacant;
        self.in_use = 0;
        self.bump = 0;
        self.free_head = NO_BLOCK;
        self.free_len = 0;
        #[cfg(debug_assertions)]
        {
            self.free_map = FixedBitSet::new();
        }
    }

    #[inline]
    pub fn in_use(&self) -> u16 {
        self.in_use
    }

    /// Hand out one block, returning its index within the chunk.
    ///
    /// # Safety
    /// `chunk_base` must be the committed start of this chunk and
    /// `block_size` its pool's block size (at least 8 bytes).
    pub unsafe fn take_block(
        &mut self,
        chunk_base: NonNull<u8>,
        block_size: usize,
        blocks_per_chunk: u16,
    ) -> Option<u16> {
        let idx = if self.free_head != NO_BLOCK {
            let idx = self.free_head;
            // Safety: idx < blocks_per_chunk, so the block lies inside the chunk.
            let block = unsafe { chunk_base.as_ptr().add(idx as usize * block_size) };

            #[cfg(debug_assertions)]
            {
                // Safety: block + 4 is inside a block of at least 8 bytes.
                let canary = unsafe { block.add(4).cast::<u32>().read_unaligned() };
                assert!(
                    canary == FREE_CANARY,
                    "pool corruption: free-block canary at {block:p}+4 was 0x{canary:08x}, expected 0x{FREE_CANARY:08x}",
                );
            }

            // Safety: bytes 0..2 of a free block hold the next free index.
            self.free_head = unsafe { block.cast::<u16>().read_unaligned() };
            self.free_len -= 1;
            idx
        } else if self.bump < blocks_per_chunk {
            let idx = self.bump;
            self.bump += 1;
            idx
        } else {
            return None;
        };

        #[cfg(debug_assertions)]
        {
            debug_assert!(self.free_map.contains(idx as usize), "block {idx} handed out twice");
            self.free_map.set(idx as usize, false);
        }

        self.in_use += 1;
        Some(idx)
    }

    /// Return block `idx` to the chunk's free list.
    ///
    /// # Safety
    /// Same as [`take_block`](Self::take_block); `idx` must be a block that is
    /// currently handed out.
    pub unsafe fn put_block(&mut self, chunk_base: NonNull<u8>, block_size: usize, idx: u16) {
        // Safety: caller guarantees idx < blocks_per_chunk.
        let block = unsafe { chunk_base.as_ptr().add(idx as usize * block_size) };

        #[cfg(debug_assertions)]
        {
            assert!(
                idx < self.bump && !self.free_map.contains(idx as usize),
                "double free of pool block {block:p}"
            );
            self.free_map.insert(idx as usize);
            // Safety: block + 4 is inside a block of at least 8 bytes.
            unsafe { block.add(4).cast::<u32>().write_unaligned(FREE_CANARY) };
        }

        // Safety: the block is free again and owned by the pool.
        unsafe { block.cast::<u16>().write_unaligned(self.free_head) };
        self.free_head = idx;
        self.free_len += 1;
        self.in_use -= 1;
    }

    /// Debug-only consistency check of the block accounting.
    #[cfg(debug_assertions)]
    pub fn sanity_check(&self, id: u32, blocks_per_chunk: u16) {
        let untouched = blocks_per_chunk - self.bump;
        assert_eq!(
            u32::from(self.in_use) + u32::from(self.free_len) + u32::from(untouched),
            u32::from(blocks_per_chunk),
            "chunk {id}: in_use {} + free {} + untouched {untouched} != {blocks_per_chunk}",
            self.in_use,
            self.free_len,
        );
        assert_eq!(
            self.free_map.count_ones(..),
            usize::from(blocks_per_chunk - self.in_use),
            "chunk {id}: free bitmap disagrees with in_use {}",
            self.in_use
        );
        let expected = match self.in_use {
            0 => ChunkState::Free,
            n if n == blocks_per_chunk => ChunkState::Full,
            _ => ChunkState::Partial,
        };
        assert_eq!(self.state, expected, "chunk {id} is on the wrong list");
    }
}

impl LinkStore for [ChunkMeta] {
    fn link(&self, id: u32) -> &Link {
        &self[id as usize].link
    }

    fn link_mut(&mut self, id: u32) -> &mut Link {
        &mut self[id as usize].link
    }
}
