use super::allocator::AllocError;
use super::size_class::{DEFAULT_SIZE_CLASSES, NUM_SIZE_CLASSES, validate_ladder};
use super::vm::PageProtection;

/// Default bytes per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default address space reserved per size class.
pub const DEFAULT_POOL_RESERVED_SIZE: usize = 256 * 1024 * 1024;

/// Pool operations a fully free chunk may sit idle before it is trimmed.
pub const DEFAULT_MAX_IDLE_AGE: u64 = 10_000;

/// Pool operations between two idle-chunk scans.
pub const DEFAULT_TRIM_CHECK_FREQUENCY: u64 = 128;

/// Block indices inside a chunk are `u16`; `u16::MAX` terminates free lists.
const MAX_BLOCKS_PER_CHUNK: usize = u16::MAX as usize;

/// Construction-time settings for a [`PoolAllocator`](super::PoolAllocator).
///
/// Immutable once the allocator is built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolAllocatorConfig {
    /// Commit chunks and large mappings with execute permission. Default: false.
    pub executable: bool,

    /// The twelve block sizes, strictly increasing multiples of 8.
    /// Default: `8 << i`, i.e. 8 B .. 16 KiB.
    pub size_classes: [usize; NUM_SIZE_CLASSES],

    /// Bytes per chunk. Default: `0` = auto-detect (`max(64 KiB, page size)`).
    pub chunk_size: usize,

    /// Address space reserved per size class; caps how many chunks a pool
    /// can ever hold. Default: 256 MiB.
    pub pool_reserved_size: usize,

    /// Pool operations a free chunk may idle before it is released.
    /// Default: 10 000.
    pub max_idle_age: u64,

    /// Pool operations between idle-chunk scans. Default: 128.
    pub trim_check_frequency: u64,
}

impl Default for PoolAllocatorConfig {
    fn default() -> Self {
        Self {
            executable: false,
            size_classes: DEFAULT_SIZE_CLASSES,
            chunk_size: 0,
            pool_reserved_size: DEFAULT_POOL_RESERVED_SIZE,
            max_idle_age: DEFAULT_MAX_IDLE_AGE,
            trim_check_frequency: DEFAULT_TRIM_CHECK_FREQUENCY,
        }
    }
}

impl PoolAllocatorConfig {
    /// Default configuration with the given page protection mode.
    #[must_use]
    pub fn executable(executable: bool) -> Self {
        Self {
            executable,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn protection(&self) -> PageProtection {
        PageProtection::from_executable(self.executable)
    }

    /// Chunk size after resolving the `0` = auto-detect default.
    #[must_use]
    pub fn resolved_chunk_size(&self, page_size: usize) -> usize {
        if self.chunk_size == 0 {
            DEFAULT_CHUNK_SIZE.max(page_size)
        } else {
            self.chunk_size
        }
    }

    /// Check every field against `page_size`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self, page_size: usize) -> Result<(), AllocError> {
        validate_ladder(&self.size_classes).map_err(AllocError::InvalidConfig)?;

        let chunk_size = self.resolved_chunk_size(page_size);
        if !chunk_size.is_power_of_two() {
            return Err(invalid(format!("chunk_size {chunk_size} is not a power of two")));
        }
        if !chunk_size.is_multiple_of(page_size) {
            return Err(invalid(format!(
                "chunk_size {chunk_size} is not a multiple of the page size {page_size}"
            )));
        }
        let largest = self.size_classes[NUM_SIZE_CLASSES - 1];
        if chunk_size < largest {
            return Err(invalid(format!(
                "chunk_size {chunk_size} is smaller than the largest size class {largest}"
            )));
        }
        let smallest = self.size_classes[0];
        if chunk_size / smallest > MAX_BLOCKS_PER_CHUNK {
            return Err(invalid(format!(
                "chunk_size {chunk_size} holds more than {MAX_BLOCKS_PER_CHUNK} blocks of {smallest} bytes"
            )));
        }

        if self.pool_reserved_size < chunk_size
            || !self.pool_reserved_size.is_multiple_of(chunk_size)
        {
            return Err(invalid(format!(
                "pool_reserved_size {} is not a non-zero multiple of chunk_size {chunk_size}",
                self.pool_reserved_size
            )));
        }
        if self
            .pool_reserved_size
            .checked_mul(NUM_SIZE_CLASSES)
            .and_then(|total| total.checked_add(chunk_size))
            .is_none()
        {
            return Err(invalid(format!(
                "pool_reserved_size {} overflows the address space",
                self.pool_reserved_size
            )));
        }
        if u32::try_from(self.pool_reserved_size / chunk_size).is_err() {
            return Err(invalid(format!(
                "pool_reserved_size {} holds too many chunks",
                self.pool_reserved_size
            )));
        }

        if self.trim_check_frequency == 0 {
            return Err(invalid("trim_check_frequency must be non-zero".to_string()));
        }
        Ok(())
    }
}

fn invalid(msg: String) -> AllocError {
    AllocError::InvalidConfig(msg)
}
