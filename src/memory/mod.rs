pub(crate) mod allocator;
pub(crate) mod chunk;
pub(crate) mod config;
pub(crate) mod dllist;
pub(crate) mod global;
pub(crate) mod integration;
pub(crate) mod large;
pub(crate) mod pool;
pub(crate) mod size_class;
pub(crate) mod spin;
pub mod stats;
pub(crate) mod vm;

pub use allocator::{AllocError, AllocatorStats, PoolAllocator};
pub use config::PoolAllocatorConfig;
pub use global::GlobalPoolAllocator;
pub use pool::PoolStats;
pub use size_class::{DEFAULT_SIZE_CLASSES, NUM_SIZE_CLASSES};
pub use vm::{PageProtection, VmError};

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
