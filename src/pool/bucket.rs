use super::block_pool::BlockPool;
use super::os::PoolError;
use super::page_pool::PagePool;
use super::stats;
use crate::sync::{Arc, OnceLock};
use log::debug;
use std::ptr::NonNull;

/// Number of per-size buckets.
pub const BUCKET_COUNT: usize = 12;

// Bucket block sizes in pointer-words. The schedule follows
// s(n) = (10 * 2^(n/2) - 2) words, a geometric series of ratio ~1.42, so a
// request is rounded up by at most ~42% of its exact size. The even entries
// (8, 18, 38, 78, 158, 318) are the doubling-plus-two growth steps that
// pointer-table containers actually request; the odd entries halve the gap.
const BUCKET_WORDS: [usize; BUCKET_COUNT] = [8, 12, 18, 26, 38, 54, 78, 111, 158, 224, 318, 451];

const WORD: usize = std::mem::size_of::<usize>();

/// Block size of bucket `index`, in bytes.
#[inline]
#[must_use]
pub fn bucket_size(index: usize) -> usize {
    BUCKET_WORDS[index] * WORD
}

/// The largest request served from a bucket; anything above goes to the
/// host allocator.
#[inline]
#[must_use]
pub fn max_bucket_size() -> usize {
    bucket_size(BUCKET_COUNT - 1)
}

/// Ceiling of log2; `x` must be at least 1.
#[inline]
fn ceil_log2(x: usize) -> usize {
    debug_assert!(x >= 1);
    if x <= 1 {
        0
    } else {
        (usize::BITS - (x - 1).leading_zeros()) as usize
    }
}

/// Map a request of `n` bytes to the smallest bucket whose block size can
/// hold it.
///
/// The geometric schedule admits a closed form: with `nodes = ceil(n / word)`
/// clamped to at least 8, `t = 16 * (nodes + 2) / 10` makes
/// `ceil_log2(t^2) - 8` land exactly on the table index (squaring folds the
/// `2 *` of the even/odd split into the log; the factor 16 keeps the
/// division exact enough in integers). The observable contract is only
/// monotonicity and containment, which the exhaustive test below checks
/// against the table.
#[inline]
fn size_to_index(n: usize) -> usize {
    debug_assert!(n >= 1 && n <= max_bucket_size());
    let nodes = n.div_ceil(WORD).max(BUCKET_WORDS[0]); // 8 <= nodes <= 451
    let t = 16 * (nodes + 2) / 10; //                     16 <= t <= 724
    ceil_log2(t * t) - 8 //                               0 <= result <= 11
}

/// A size-routed front over [`BUCKET_COUNT`] fixed-block pools.
///
/// Requests up to [`max_bucket_size`] are served by the bucket with the
/// smallest sufficient block size; larger requests pass through to the host
/// allocator. Deallocation routes by the original request size, which the
/// caller must supply unchanged.
pub struct BucketAllocator {
    buckets: [BlockPool; BUCKET_COUNT],
}

impl BucketAllocator {
    /// Build the bucket array over a shared page pool.
    #[must_use]
    pub fn new(pages: &Arc<PagePool>) -> Self {
        debug!(
            "BucketAllocator: {} buckets, {}..={} bytes, upstream chunk {} bytes",
            BUCKET_COUNT,
            bucket_size(0),
            max_bucket_size(),
            pages.block_size(),
        );
        Self {
            buckets: std::array::from_fn(|i| BlockPool::new(pages.clone(), bucket_size(i))),
        }
    }

    /// Allocate `n` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::OutOfMemory`] if the chosen bucket cannot grow
    /// or the host allocator refuses the request.
    pub fn allocate(&self, n: usize) -> Result<NonNull<u8>, PoolError> {
        // Make the bucketed sizes the fast path.
        if n > max_bucket_size() {
            return Self::host_allocate(n);
        }
        self.buckets[size_to_index(n)].allocate(n)
    }

    /// Release `n` bytes at `ptr`. `n` must equal the size passed to the
    /// matching [`allocate`](Self::allocate); the size is not recoverable
    /// from the pointer.
    ///
    /// # Safety
    /// - `ptr` must have been returned by `allocate(n)` on this allocator.
    /// - `ptr` must not have been freed already.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, n: usize) {
        if n > max_bucket_size() {
            // Safety: allocated by host_allocate with the same layout.
            unsafe { Self::host_deallocate(ptr, n) };
            return;
        }
        // Safety: routed to the same bucket that served the allocation.
        unsafe { self.buckets[size_to_index(n)].deallocate(ptr) };
    }

    /// Blocks currently handed out by bucket `index`.
    #[must_use]
    pub fn bucket_blocks_allocated(&self, index: usize) -> usize {
        self.buckets[index].blocks_allocated()
    }

    fn host_allocate(n: usize) -> Result<NonNull<u8>, PoolError> {
        let layout = std::alloc::Layout::from_size_align(n, WORD)
            .map_err(|e| PoolError::OutOfMemory(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size (n > max_bucket_size() > 0).
        let ptr = unsafe { std::alloc::alloc(layout) };
        stats::BUCKET_PASSTHROUGH.add(1);
        NonNull::new(ptr).ok_or_else(|| {
            PoolError::OutOfMemory(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "host allocator returned null",
            ))
        })
    }

    unsafe fn host_deallocate(ptr: NonNull<u8>, n: usize) {
        let layout = std::alloc::Layout::from_size_align(n, WORD)
            .expect("layout accepted by host_allocate");
        // Safety: upheld by caller.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        stats::sub_saturating(&stats::BUCKET_PASSTHROUGH, 1);
    }
}

static GLOBAL_BUCKETS: OnceLock<BucketAllocator> = OnceLock::new();

/// Process-wide bucket allocator.
///
/// Must be bound to a page pool via [`init`](GlobalBucketAllocator::init)
/// exactly once, before the first allocation, preferably at the top of
/// `main`, so initialization never races the first allocation.
pub struct GlobalBucketAllocator;

impl GlobalBucketAllocator {
    /// Bind every bucket to `pages`.
    ///
    /// # Panics
    ///
    /// Panics if called more than once.
    pub fn init(pages: &Arc<PagePool>) {
        assert!(
            GLOBAL_BUCKETS.set(BucketAllocator::new(pages)).is_ok(),
            "GlobalBucketAllocator::init called twice",
        );
    }

    /// Returns the initialized global allocator.
    ///
    /// # Panics
    ///
    /// Panics if [`init`](Self::init) has not run yet.
    pub fn get() -> &'static BucketAllocator {
        GLOBAL_BUCKETS
            .get()
            .expect("GlobalBucketAllocator not initialized; call init first")
    }

    /// Allocate `n` bytes from the global buckets.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::OutOfMemory`] on upstream or host failure.
    ///
    /// # Panics
    ///
    /// Panics if [`init`](Self::init) has not run yet.
    pub fn allocate(n: usize) -> Result<NonNull<u8>, PoolError> {
        Self::get().allocate(n)
    }

    /// Release `n` bytes at `ptr`.
    ///
    /// # Safety
    /// Same contract as [`BucketAllocator::deallocate`].
    ///
    /// # Panics
    ///
    /// Panics if [`init`](Self::init) has not run yet.
    pub unsafe fn deallocate(ptr: NonNull<u8>, n: usize) {
        // Safety: upheld by caller.
        unsafe { Self::get().deallocate(ptr, n) };
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::pool::os::{HostOps, PlatformHostOps};

    fn pages() -> Arc<PagePool> {
        Arc::new(PagePool::new(PlatformHostOps::page_size() * 8))
    }

    #[test]
    fn test_index_exact_table_sizes() {
        for (i, &words) in BUCKET_WORDS.iter().enumerate() {
            assert_eq!(
                size_to_index(words * WORD),
                i,
                "exact size of bucket {i} must stay in bucket {i}",
            );
        }
    }

    #[test]
    fn test_index_monotone_and_containing() {
        let mut prev = 0;
        for n in 1..=max_bucket_size() {
            let i = size_to_index(n);
            assert!(i >= prev, "size_to_index not monotone at {n}");
            assert!(
                bucket_size(i) >= n,
                "bucket {i} ({} bytes) cannot hold {n} bytes",
                bucket_size(i),
            );
            // Tightness: the next-smaller bucket must NOT fit.
            if i > 0 {
                assert!(bucket_size(i - 1) < n, "bucket {i} is not minimal for {n}");
            }
            prev = i;
        }
    }

    #[test]
    fn test_routing_3600_bytes() {
        // On 64-bit: S_10 = 2544 < 3600 <= S_11 = 3608.
        assert_eq!(size_to_index(3600), 11);
    }

    #[test]
    fn test_largest_bucket_boundary() {
        let _guard = crate::pool::TEST_MUTEX.write().unwrap();
        let alloc = BucketAllocator::new(&pages());

        // n == S_{K-1} hits the last bucket, not the host allocator.
        let passthrough_before = stats::BUCKET_PASSTHROUGH.get();
        let p = alloc.allocate(max_bucket_size()).unwrap();
        assert_eq!(stats::BUCKET_PASSTHROUGH.get(), passthrough_before);
        assert_eq!(alloc.bucket_blocks_allocated(BUCKET_COUNT - 1), 1);
        // Safety: Test code.
        unsafe { alloc.deallocate(p, max_bucket_size()) };

        // n == S_{K-1} + 1 bypasses the buckets entirely.
        let q = alloc.allocate(max_bucket_size() + 1).unwrap();
        assert_eq!(stats::BUCKET_PASSTHROUGH.get(), passthrough_before + 1);
        assert_eq!(alloc.bucket_blocks_allocated(BUCKET_COUNT - 1), 0);
        // Safety: Test code.
        unsafe { alloc.deallocate(q, max_bucket_size() + 1) };
        assert_eq!(stats::BUCKET_PASSTHROUGH.get(), passthrough_before);
    }

    #[test]
    fn test_allocations_fit_their_bucket() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let alloc = BucketAllocator::new(&pages());
        for n in [1, 24, 64, 65, 100, 1000, 2544, 2545, 3608] {
            let p = alloc.allocate(n).unwrap();
            // The block is writable for the full requested size.
            // Safety: Test code.
            unsafe {
                p.as_ptr().write_bytes(0x5A, n);
                alloc.deallocate(p, n);
            }
        }
    }

    #[test]
    fn test_small_request_hits_first_bucket() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let alloc = BucketAllocator::new(&pages());
        // 24 bytes rounds up to S_0 = 64 on 64-bit.
        let p = alloc.allocate(24).unwrap();
        assert_eq!(alloc.bucket_blocks_allocated(0), 1);
        // Safety: Test code.
        unsafe { alloc.deallocate(p, 24) };
        assert_eq!(alloc.bucket_blocks_allocated(0), 0);
    }

    #[test]
    fn test_global_init_and_route() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        // The global is process-wide; this is the only test that touches it.
        static PAGES: OnceLock<Arc<PagePool>> = OnceLock::new();
        let pages = PAGES.get_or_init(|| Arc::new(PagePool::new(PlatformHostOps::page_size() * 8)));
        GlobalBucketAllocator::init(pages);

        let p = GlobalBucketAllocator::allocate(40).unwrap();
        // Safety: Test code.
        unsafe {
            p.as_ptr().write_bytes(0x77, 40);
            GlobalBucketAllocator::deallocate(p, 40);
        }

        // A second init is a caller bug.
        let reinit = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            GlobalBucketAllocator::init(pages);
        }));
        assert!(reinit.is_err(), "double init must panic");
    }
}
