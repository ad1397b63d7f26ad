use super::os::{HostOps, PlatformHostOps, PoolError};
use super::stats;
use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::Mutex;
use log::{debug, trace};
use std::ptr::NonNull;

/// A pool of identically-sized, page-aligned chunks.
///
/// Each [`acquire`](PagePool::acquire) hands out one fresh chunk of exactly
/// `block_size` bytes from the host; chunks are retained for the pool's
/// lifetime and returned to the host only on drop. Downstream fixed-block
/// allocators carve the chunks into blocks and recycle at block granularity.
pub struct PagePool {
    block_size: usize,
    min_blocks: usize,
    max_blocks: usize,
    /// Every chunk ever acquired, retained until drop.
    chunks: Mutex<Vec<NonNull<u8>>>,
    /// Running count of chunks acquired from the host.
    pool_blocks: AtomicUsize,
}

// Safety: PagePool owns its chunks; the vector is Mutex-protected and the
// chunk memory itself is only ever handed out by value.
unsafe impl Send for PagePool {}
// Safety: all interior mutation goes through the Mutex or atomics.
unsafe impl Sync for PagePool {}

impl PagePool {
    /// Create a pool serving chunks of `block_size` bytes with default
    /// growth bounds.
    ///
    /// # Panics
    ///
    /// Panics if `block_size` is not a non-zero multiple of the host page
    /// size.
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        Self::with_limits(block_size, 0, 0)
    }

    /// Create a pool with explicit growth bounds, both measured in blocks.
    /// Zero selects the default: `min_blocks = 1`, and a `max_blocks`
    /// derived from physical memory. The bounds parameterise the capacity
    /// reserve of the chunk vector, not the growth per call.
    ///
    /// # Panics
    ///
    /// Panics if `block_size` is not a non-zero multiple of the host page
    /// size, or if the resolved bounds violate `max >= min >= 1`.
    #[must_use]
    pub fn with_limits(block_size: usize, min_blocks: usize, max_blocks: usize) -> Self {
        let page_size = PlatformHostOps::page_size();
        assert!(
            block_size >= page_size && block_size.is_multiple_of(page_size),
            "PagePool block_size ({block_size}) must be a non-zero multiple of the page size ({page_size})",
        );

        let min_blocks = if min_blocks == 0 { 1 } else { min_blocks };
        let max_blocks = if max_blocks == 0 {
            Self::default_max_blocks(block_size, min_blocks)
        } else {
            max_blocks
        };
        assert!(min_blocks >= 1, "min_blocks must be at least 1");
        assert!(
            max_blocks >= min_blocks,
            "max_blocks ({max_blocks}) must be >= min_blocks ({min_blocks})",
        );

        // Reserve up front so pushes during growth never reallocate while
        // other threads hold chunk pointers handed out earlier.
        let capacity = (1 + floor_log2(max_blocks)).next_power_of_two();
        debug!(
            "PagePool: block_size {} bytes ({}x page size), chunk capacity {}",
            block_size,
            block_size / page_size,
            capacity,
        );

        Self {
            block_size,
            min_blocks,
            max_blocks,
            chunks: Mutex::new(Vec::with_capacity(capacity)),
            pool_blocks: AtomicUsize::new(0),
        }
    }

    /// Default upper growth bound: enough blocks to cover a sixteenth of
    /// physical memory, but never less than `min_blocks`.
    fn default_max_blocks(block_size: usize, min_blocks: usize) -> usize {
        let budget = PlatformHostOps::physical_memory() / 16;
        (budget / block_size).max(min_blocks)
    }

    /// The size of every chunk this pool serves, in bytes.
    #[inline]
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of chunks acquired from the host so far.
    #[must_use]
    pub fn pool_blocks(&self) -> usize {
        self.pool_blocks.load(Ordering::Relaxed)
    }

    #[allow(dead_code)]
    pub(crate) fn limits(&self) -> (usize, usize) {
        (self.min_blocks, self.max_blocks)
    }

    /// Acquire one page-aligned chunk of exactly `block_size` bytes.
    ///
    /// The host allocation happens outside the growth mutex; only the
    /// bookkeeping push is serialised.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::OutOfMemory`] if the host refuses the
    /// allocation.
    pub fn acquire(&self) -> Result<NonNull<u8>, PoolError> {
        let chunk = PlatformHostOps::alloc_chunk(self.block_size)?;
        trace!("PagePool: acquired chunk {:p}", chunk);

        let mut chunks = self
            .chunks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        chunks.push(chunk);
        drop(chunks);

        self.pool_blocks.fetch_add(1, Ordering::Relaxed);
        stats::PAGE_POOL_CHUNKS.add(1);
        stats::PAGE_POOL_BYTES.add(self.block_size);
        Ok(chunk)
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        let chunks = self
            .chunks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        debug!(
            "PagePool: releasing {} chunks ({} bytes)",
            chunks.len(),
            chunks.len() * self.block_size,
        );
        // Wink out any remaining allocations.
        for &ptr in chunks.iter() {
            // Safety: every entry came from alloc_chunk with this size and
            // is released exactly once, here.
            unsafe { PlatformHostOps::free_chunk(ptr, self.block_size) };
        }
        stats::sub_saturating(&stats::PAGE_POOL_CHUNKS, chunks.len());
        stats::sub_saturating(&stats::PAGE_POOL_BYTES, chunks.len() * self.block_size);
    }
}

/// Floor of log2; `x` must be nonzero.
fn floor_log2(x: usize) -> usize {
    debug_assert!(x != 0);
    (usize::BITS - 1 - x.leading_zeros()) as usize
}
