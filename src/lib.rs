#[cfg(not(target_pointer_width = "64"))]
compile_error!("binpool supports only 64-bit targets.");

pub(crate) mod sync;

// public module: allocator types are re-exported below, internals stay
// pub(crate); TEST_MUTEX is visible to tests
pub mod memory;

// allocator
pub use memory::{
    AllocError, AllocatorStats, GlobalPoolAllocator, PoolAllocator, PoolAllocatorConfig, PoolStats,
};

// size classes / page protection
pub use memory::{DEFAULT_SIZE_CLASSES, NUM_SIZE_CLASSES, PageProtection};

// stats
pub use memory::stats::{MemoryStats, snapshot as memory_stats};

// errors
pub use memory::VmError;
