use super::free_list::FreeList;
use super::os::PoolError;
use super::page_pool::PagePool;
use super::stats::Counter;
use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::Arc;
use std::ptr::NonNull;

/// A fixed-block allocator that refills from a shared [`PagePool`].
///
/// The block size is either fixed at construction or latched by the first
/// allocation, which lets one pool serve allocators for types whose size is
/// not known up front. Once latched it never changes: if callers mix sizes,
/// the largest size must be allocated first, and every later request must
/// fit in it.
///
/// Allocation is lock-free except when the free list runs dry, at which
/// point one thread at a time pulls a chunk from the page pool and carves
/// it into blocks. Deallocation is always lock-free.
pub struct BlockPool {
    pages: Arc<PagePool>,
    list: FreeList,
    /// 0 until latched by construction or the first allocation.
    block_size: AtomicUsize,
    /// Blocks currently handed out (running leak counter).
    blocks_allocated: Counter,
}

impl BlockPool {
    /// Create a pool serving blocks of `block_size` bytes, or of the size of
    /// the first allocation when `block_size` is 0.
    #[must_use]
    pub fn new(pages: Arc<PagePool>, block_size: usize) -> Self {
        debug_assert!(
            block_size == 0 || block_size.is_multiple_of(std::mem::align_of::<usize>()),
            "block_size ({block_size}) must be pointer aligned",
        );
        Self {
            pages,
            list: FreeList::new(),
            block_size: AtomicUsize::new(block_size),
            blocks_allocated: Counter::new(),
        }
    }

    /// The latched block size, or 0 if nothing has been allocated yet.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size.load(Ordering::Relaxed)
    }

    /// Blocks currently handed out.
    #[must_use]
    pub fn blocks_allocated(&self) -> usize {
        self.blocks_allocated.get()
    }

    /// Allocate one block of at least `size` bytes.
    ///
    /// No mutex guards the latch: racing first allocations of *different*
    /// sizes is a caller contract violation, so any race here is between
    /// threads storing the same value.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::OutOfMemory`] when the upstream page pool cannot
    /// supply another chunk.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, PoolError> {
        let mut block_size = self.block_size.load(Ordering::Relaxed);
        if block_size == 0 {
            // Latch the block size from the first allocation, rounded up to
            // pointer alignment so carved blocks keep their `next` slot
            // aligned.
            let word = std::mem::align_of::<usize>();
            block_size = size.next_multiple_of(word).max(word * 2);
            self.block_size.store(block_size, Ordering::Relaxed);
            log::trace!("BlockPool: block size latched to {block_size}");
        } else {
            debug_assert!(
                size <= block_size,
                "request of {size} bytes exceeds latched block size {block_size} \
                 (allocate the largest size first)",
            );
        }

        let mut refill_err = None;
        let ptr = self.list.allocate(|| match self.pages.acquire() {
            Ok(chunk) => {
                // Safety: the chunk is page-sized, exclusively ours until
                // the splice, and block_size is pointer aligned.
                unsafe {
                    self.list
                        .add_block(chunk.as_ptr(), self.pages.block_size(), block_size);
                }
                true
            }
            Err(e) => {
                refill_err = Some(e);
                false
            }
        });

        match ptr {
            Some(p) => {
                self.blocks_allocated.add(1);
                Ok(p)
            }
            None => Err(refill_err.unwrap_or_else(|| {
                PoolError::OutOfMemory(std::io::Error::new(
                    std::io::ErrorKind::OutOfMemory,
                    "page pool refused to grow",
                ))
            })),
        }
    }

    /// Return a block to the pool.
    ///
    /// # Safety
    /// - `ptr` must have been returned by [`allocate`](Self::allocate) on
    ///   this pool.
    /// - `ptr` must not have been freed already, and must not be used after
    ///   this call.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        self.list.push(ptr);
        self.blocks_allocated.sub(1);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::pool::os::{HostOps, PlatformHostOps};

    fn pool() -> Arc<PagePool> {
        Arc::new(PagePool::new(PlatformHostOps::page_size() * 8))
    }

    #[test]
    fn test_fixed_size_allocate_deallocate() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let bp = BlockPool::new(pool(), 64);
        let a = bp.allocate(64).unwrap();
        let b = bp.allocate(48).unwrap();
        assert_ne!(a, b);
        assert_eq!(bp.blocks_allocated(), 2);

        // Safety: Test code.
        unsafe {
            a.as_ptr().write_bytes(0xAA, 64);
            bp.deallocate(a);
            bp.deallocate(b);
        }
        assert_eq!(bp.blocks_allocated(), 0);
    }

    #[test]
    fn test_block_size_latched_by_first_allocation() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let bp = BlockPool::new(pool(), 0);
        assert_eq!(bp.block_size(), 0);
        let p = bp.allocate(100).unwrap();
        // Rounded up to pointer alignment.
        assert_eq!(bp.block_size(), 104);
        // Safety: Test code.
        unsafe { bp.deallocate(p) };
        // The size never changes afterwards.
        let q = bp.allocate(50).unwrap();
        assert_eq!(bp.block_size(), 104);
        // Safety: Test code.
        unsafe { bp.deallocate(q) };
    }

    #[test]
    fn test_tiny_first_allocation_still_fits_a_node() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let bp = BlockPool::new(pool(), 0);
        let p = bp.allocate(1).unwrap();
        assert!(bp.block_size() >= std::mem::size_of::<usize>());
        // Safety: Test code.
        unsafe { bp.deallocate(p) };
    }

    #[test]
    fn test_refill_acquires_one_chunk_per_exhaustion() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let pages = pool();
        let chunk_size = pages.block_size();
        let bp = BlockPool::new(pages.clone(), 256);

        let per_chunk = chunk_size / 256;
        let mut held = Vec::new();
        for _ in 0..per_chunk {
            held.push(bp.allocate(256).unwrap());
        }
        assert_eq!(pages.pool_blocks(), 1);

        // One more request spills into a second chunk.
        held.push(bp.allocate(256).unwrap());
        assert_eq!(pages.pool_blocks(), 2);

        for p in held {
            // Safety: Test code.
            unsafe { bp.deallocate(p) };
        }
        assert_eq!(bp.blocks_allocated(), 0);
    }

    #[test]
    fn test_recycles_before_growing() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let pages = pool();
        let chunk_size = pages.block_size();
        let bp = BlockPool::new(pages.clone(), 128);

        let per_chunk = chunk_size / 128;
        let mut held = Vec::new();
        for _ in 0..per_chunk {
            held.push(bp.allocate(128).unwrap());
        }
        for p in held.drain(..) {
            // Safety: Test code.
            unsafe { bp.deallocate(p) };
        }
        // Re-allocating the same count must not pull a new chunk.
        for _ in 0..per_chunk {
            held.push(bp.allocate(128).unwrap());
        }
        assert_eq!(pages.pool_blocks(), 1, "recycled blocks were not reused");
        for p in held {
            // Safety: Test code.
            unsafe { bp.deallocate(p) };
        }
    }

    #[test]
    fn test_allocation_count_round_trip() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let bp = BlockPool::new(pool(), 64);
        let initial = bp.blocks_allocated();

        let held: Vec<_> = (0..100).map(|_| bp.allocate(64).unwrap()).collect();
        assert_eq!(bp.blocks_allocated(), initial + 100);
        for p in held {
            // Safety: Test code.
            unsafe { bp.deallocate(p) };
        }
        assert_eq!(bp.blocks_allocated(), initial);
    }

    #[test]
    fn test_concurrent_allocate_distinct_pointers() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let bp = std::sync::Arc::new(BlockPool::new(pool(), 64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let bp = bp.clone();
            handles.push(std::thread::spawn(move || {
                let mut got = Vec::new();
                for _ in 0..200 {
                    got.push(bp.allocate(64).unwrap().as_ptr() as usize);
                }
                got
            }));
        }
        let mut all: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total, "concurrent allocate returned duplicates");
    }
}
