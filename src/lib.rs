#[cfg(not(target_pointer_width = "64"))]
compile_error!("blockpool supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod pool;

// fixed-block allocators
pub use pool::block_pool::BlockPool;
pub use pool::bucket::{BucketAllocator, GlobalBucketAllocator, BUCKET_COUNT};
pub use pool::object_pool::ObjectPool;

// upstream chunk suppliers
pub use pool::mapped::{MapMode, MappedPool};
pub use pool::page_pool::PagePool;

// mgmt/stats
pub use pool::stats::MemoryStats;

// errors
pub use pool::os::PoolError;
