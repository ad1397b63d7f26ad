use crate::sync::Mutex;
use log::trace;
use std::ptr::NonNull;

const WORD: usize = std::mem::size_of::<usize>();

/// A mutex-protected slab pool for one object size.
///
/// Intended for allocating many objects of the same (initially unknown)
/// type one at a time: the object size is latched by the first allocation,
/// and storage grows a slab of `objects_per_slab` objects at a time from the
/// host allocator. Freed objects go on an intrusive free list; slabs are
/// retained until the pool is dropped.
///
/// Unlike the fixed-block allocators this pool takes its one mutex on every
/// operation; it trades the lock-free hot path for zero per-object
/// bookkeeping and no upstream page pool.
pub struct ObjectPool {
    inner: Mutex<Inner>,
}

struct Inner {
    objects_per_slab: usize,
    /// Latched by construction or the first allocation; 0 until then.
    object_size: usize,
    /// Intrusive free list through the first word of each free object.
    free_head: Option<NonNull<u8>>,
    /// Every slab ever allocated, retained until drop.
    slabs: Vec<NonNull<u8>>,
    total_free: usize,
}

// Safety: Inner owns its slabs; all access is serialised by the Mutex.
unsafe impl Send for ObjectPool {}
// Safety: see above.
unsafe impl Sync for ObjectPool {}

impl ObjectPool {
    /// Create a pool growing by `objects_per_slab` objects at a time;
    /// `object_size` may be 0 to latch it from the first allocation.
    ///
    /// # Panics
    ///
    /// Panics if `objects_per_slab` is 0.
    #[must_use]
    pub fn new(objects_per_slab: usize, object_size: usize) -> Self {
        assert!(objects_per_slab > 0, "objects_per_slab must be at least 1");
        Self {
            inner: Mutex::new(Inner {
                objects_per_slab,
                object_size: if object_size == 0 {
                    0
                } else {
                    Inner::round_up(object_size)
                },
                free_head: None,
                slabs: Vec::new(),
                total_free: 0,
            }),
        }
    }

    /// Allocate one object of `size` bytes.
    ///
    /// If callers mix sizes, the largest must be allocated first; later
    /// requests must fit in the latched size (debug-asserted).
    ///
    /// # Errors
    ///
    /// Returns `None` when the host allocator refuses a new slab.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.allocate(size)
    }

    /// Return an object to the pool.
    ///
    /// # Safety
    /// `ptr` must have been returned by [`allocate`](Self::allocate) on this
    /// pool and not freed since.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        // Safety: upheld by caller.
        unsafe { inner.deallocate(ptr) };
    }

    /// Objects currently on the free list.
    #[must_use]
    pub fn total_free(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .total_free
    }

    /// The latched object size, or 0 if nothing has been allocated yet.
    #[must_use]
    pub fn object_size(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .object_size
    }
}

impl Inner {
    /// Objects must hold the intrusive link and keep successors aligned.
    fn round_up(size: usize) -> usize {
        size.next_multiple_of(WORD).max(WORD)
    }

    fn slab_layout(&self) -> std::alloc::Layout {
        std::alloc::Layout::from_size_align(self.object_size * self.objects_per_slab, WORD)
            .expect("slab size fits an allocation")
    }

    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if self.object_size == 0 {
            self.object_size = Self::round_up(size);
            trace!("ObjectPool: object size latched to {}", self.object_size);
        }
        // If you use multiple sizes, allocate the largest size first.
        debug_assert!(
            size <= self.object_size,
            "request of {size} bytes exceeds latched object size {}",
            self.object_size,
        );

        if self.free_head.is_none() {
            self.grow()?;
        }
        // Safety: grow() guaranteed at least one free object, and free-list
        // entries always carry a valid link in their first word.
        let ptr = self.free_head.take().expect("free list refilled by grow");
        unsafe {
            let next = ptr.as_ptr().cast::<usize>().read();
            self.free_head = NonNull::new(next as *mut u8);
        }
        self.total_free -= 1;
        Some(ptr)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        // Safety: ptr is ours again; its first word becomes the link.
        unsafe {
            ptr.as_ptr()
                .cast::<usize>()
                .write(self.free_head.map_or(0, |p| p.as_ptr() as usize));
        }
        self.free_head = Some(ptr);
        self.total_free += 1;
        debug_assert!(self.total_free <= self.slabs.len() * self.objects_per_slab);
    }

    /// Allocate one slab and thread its objects onto the free list.
    fn grow(&mut self) -> Option<()> {
        let layout = self.slab_layout();
        // Safety: layout has non-zero size (object_size and count are > 0).
        let slab = NonNull::new(unsafe { std::alloc::alloc(layout) })?;
        trace!(
            "ObjectPool: new slab of {} objects at {slab:p}",
            self.objects_per_slab,
        );

        // Thread tail-to-head so the list walks the slab in address order.
        for i in (0..self.objects_per_slab).rev() {
            // Safety: i * object_size is within the slab.
            unsafe {
                let obj = slab.as_ptr().add(i * self.object_size);
                obj.cast::<usize>()
                    .write(self.free_head.map_or(0, |p| p.as_ptr() as usize));
                self.free_head = Some(NonNull::new_unchecked(obj));
            }
        }
        self.slabs.push(slab);
        self.total_free += self.objects_per_slab;
        Some(())
    }
}

impl Drop for ObjectPool {
    fn drop(&mut self) {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if inner.slabs.is_empty() {
            return;
        }
        let layout = inner.slab_layout();
        for &slab in &inner.slabs {
            // Safety: every slab came from alloc with this layout.
            unsafe { std::alloc::dealloc(slab.as_ptr(), layout) };
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_latch_size_and_allocate() {
        let pool = ObjectPool::new(8, 0);
        assert_eq!(pool.object_size(), 0);
        let p = pool.allocate(24).unwrap();
        assert_eq!(pool.object_size(), 24);
        // One slab of 8, one object out.
        assert_eq!(pool.total_free(), 7);
        // Safety: Test code.
        unsafe { pool.deallocate(p) };
        assert_eq!(pool.total_free(), 8);
    }

    #[test]
    fn test_fixed_size_round_up() {
        let pool = ObjectPool::new(4, 3);
        // Rounded up to hold the intrusive link.
        assert_eq!(pool.object_size(), WORD);
    }

    #[test]
    fn test_reuse_is_lifo() {
        let pool = ObjectPool::new(4, 16);
        let a = pool.allocate(16).unwrap();
        let _b = pool.allocate(16).unwrap();
        // Safety: Test code.
        unsafe { pool.deallocate(a) };
        assert_eq!(pool.allocate(16), Some(a));
    }

    #[test]
    fn test_grows_by_slab() {
        let pool = ObjectPool::new(4, 32);
        let held: Vec<_> = (0..9).map(|_| pool.allocate(32).unwrap()).collect();
        // 9 objects forced 3 slabs of 4; 3 spares remain free.
        assert_eq!(pool.total_free(), 3);

        let mut addrs: Vec<usize> = held.iter().map(|p| p.as_ptr() as usize).collect();
        addrs.sort_unstable();
        addrs.dedup();
        assert_eq!(addrs.len(), 9, "duplicate objects handed out");

        for p in held {
            // Safety: Test code.
            unsafe { pool.deallocate(p) };
        }
        assert_eq!(pool.total_free(), 12);
    }

    #[test]
    fn test_objects_do_not_overlap() {
        let pool = ObjectPool::new(16, 24);
        let held: Vec<_> = (0..16).map(|_| pool.allocate(24).unwrap()).collect();
        for (i, p) in held.iter().enumerate() {
            // Safety: Test code.
            unsafe { p.as_ptr().write_bytes(i as u8, 24) };
        }
        for (i, p) in held.iter().enumerate() {
            // Safety: Test code.
            unsafe {
                assert_eq!(p.as_ptr().read(), i as u8);
                assert_eq!(p.as_ptr().add(23).read(), i as u8);
            }
        }
        for p in held {
            // Safety: Test code.
            unsafe { pool.deallocate(p) };
        }
    }

    #[test]
    fn test_shared_across_threads() {
        let pool = std::sync::Arc::new(ObjectPool::new(32, 40));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    let p = pool.allocate(40).unwrap();
                    // Safety: Test code.
                    unsafe {
                        p.as_ptr().write(0x42);
                        pool.deallocate(p);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        // Everything returned; free count is a multiple of whole slabs.
        assert!(pool.total_free().is_multiple_of(32));
    }
}
