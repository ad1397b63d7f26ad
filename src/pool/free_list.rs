use super::tagged::{FreeNode, TaggedHead, END_OF_LIST, TAG_MASK};
use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::Mutex;
use std::ptr::NonNull;

// Consistent state is a singly linked list of free blocks threaded through
// their own storage:
//
//  head -->.-------------.   .-->.-------------.   .-->.-------------.
//          | next -------+--'    | next -------+--'    | next -------+--> (end)
//          |             |       |             |       |             |
//          `-------------'       `-------------'       `-------------'
//
// Popping removes the first block; pushing makes the freed block the new
// first. Both are a single CAS on the tagged head word.

/// Lock-free LIFO free list of fixed-size blocks.
///
/// The hot paths ([`try_pop`](Self::try_pop), [`push`](Self::push)) are
/// lock-free; the `grow_lock` mutex serialises only the refill path so that
/// at most one thread asks the upstream supplier for a new chunk at a time.
#[derive(Debug)]
pub(crate) struct FreeList {
    head: AtomicUsize,
    grow_lock: Mutex<()>,
}

impl FreeList {
    #[cfg(not(loom))]
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicUsize::new(END_OF_LIST),
            grow_lock: Mutex::new(()),
        }
    }

    #[cfg(loom)]
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicUsize::new(END_OF_LIST),
            grow_lock: Mutex::new(()),
        }
    }

    /// Seed the list with an existing chain starting at `head`.
    ///
    /// Only used by mapped pools, whose region begins life as one giant
    /// chain discovered lazily. Must be called once, before first use.
    pub(crate) fn initialize(&self, head: NonNull<u8>) {
        let prev = self
            .head
            .swap(TaggedHead::encode(head.as_ptr(), 0), Ordering::Relaxed);
        assert!(
            prev == END_OF_LIST,
            "FreeList::initialize called on a non-empty list",
        );
    }

    #[inline]
    pub(crate) fn load_head(&self, order: Ordering) -> TaggedHead {
        TaggedHead(self.head.load(order))
    }

    #[inline]
    pub(crate) fn cas_head(
        &self,
        current: TaggedHead,
        new: TaggedHead,
        success: Ordering,
        failure: Ordering,
    ) -> Result<usize, usize> {
        self.head
            .compare_exchange_weak(current.0, new.0, success, failure)
    }

    /// Pop the front block, or `None` if the list is empty.
    ///
    /// The Acquire on the load and on CAS failure pairs with the Release in
    /// [`push`](Self::push), so the `next` value read while computing the
    /// new head is the one written by the matching push.
    pub(crate) fn try_pop(&self) -> Option<NonNull<u8>> {
        let mut head = self.load_head(Ordering::Acquire);
        while !head.is_empty() {
            // Safety: head was published on this list and is not empty.
            let new_head = unsafe { head.next() };
            match self.cas_head(head, new_head, Ordering::Acquire, Ordering::Acquire) {
                Ok(_) => {
                    // Safety: a non-empty head always carries a non-null pointer.
                    return Some(unsafe { NonNull::new_unchecked(head.ptr()) });
                }
                // The head changed under us; retry with the observed value.
                Err(current) => head = TaggedHead(current),
            }
        }
        None
    }

    /// Push a block. `ptr` must be a value previously handed out from this
    /// list (or carved for it), with the list's block alignment.
    pub(crate) fn push(&self, ptr: NonNull<u8>) {
        debug_assert!(
            (ptr.as_ptr() as usize) & TAG_MASK == 0,
            "deallocated pointer {ptr:p} violates tag alignment",
        );
        let node = ptr.as_ptr();
        let mut head = self.load_head(Ordering::Relaxed);
        loop {
            // The popping side bumps the tag; push reuses the current one.
            let new_head = TaggedHead(TaggedHead::encode(node, head.tag()));
            // Safety: we own `node` until the CAS publishes it.
            unsafe {
                (*FreeNode::next_slot(node)).store(head.ptr() as usize, Ordering::Relaxed);
            }
            // Release pairs with the Acquire in try_pop: the store to
            // node->next above is visible to whoever pops this head.
            match self.cas_head(head, new_head, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => return,
                Err(current) => head = TaggedHead(current),
            }
        }
    }

    /// Pop a block, refilling from `refill` when the list runs dry.
    ///
    /// `refill` runs under the grow lock and must have published at least one
    /// block via [`add_block`](Self::add_block) before returning `true`;
    /// returning `false` means the upstream is out of memory.
    pub(crate) fn allocate<F: FnMut() -> bool>(&self, mut refill: F) -> Option<NonNull<u8>> {
        loop {
            if let Some(ptr) = self.try_pop() {
                return Some(ptr);
            }
            // Reached the end of the list; try to allocate more memory.
            if !self.try_grow(&mut refill) {
                return None;
            }
        }
    }

    /// Serialise refill: if another thread already refilled while we waited
    /// for the lock, report success without calling `refill` again.
    fn try_grow<F: FnMut() -> bool>(&self, refill: &mut F) -> bool {
        let _guard = self
            .grow_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.head.load(Ordering::Relaxed) != END_OF_LIST || refill()
    }

    /// Carve `chunk` into `chunk_size / block_size` blocks and splice them
    /// onto the list as one chain.
    ///
    /// # Safety
    /// `chunk` must address at least `chunk_size` writable bytes owned by
    /// the caller (exclusively, until the splice publishes them), and
    /// `block_size` must be a pointer-aligned divisor leaving at least two
    /// whole blocks.
    pub(crate) unsafe fn add_block(&self, chunk: *mut u8, chunk_size: usize, block_size: usize) {
        let partitions = chunk_size / block_size;
        // A chunk that doesn't hold at least 2 blocks is a configuration bug.
        assert!(
            partitions >= 2,
            "add_block: chunk of {chunk_size} bytes holds fewer than 2 blocks of {block_size}",
        );
        debug_assert!(block_size.is_multiple_of(std::mem::align_of::<usize>()));

        // Thread the chain tail-to-head through the blocks' own storage.
        let first = chunk;
        let last = unsafe { chunk.add((partitions - 1) * block_size) };
        let mut node = last;
        while node != first {
            let next_node = node;
            node = unsafe { next_node.sub(block_size) };
            // Safety: node is inside the chunk we exclusively own.
            unsafe {
                (*FreeNode::next_slot(node)).store(next_node as usize, Ordering::Relaxed);
            }
        }

        // Splice: tail points at the current head, then one CAS publishes
        // the whole chain. Tag starts at zero: these nodes have never been
        // on this list, so no popper can hold a stale view of them.
        let mut head = self.load_head(Ordering::Relaxed);
        loop {
            // Safety: `last` is still ours until the CAS succeeds.
            unsafe {
                (*FreeNode::next_slot(last)).store(head.ptr() as usize, Ordering::Relaxed);
            }
            let new_head = TaggedHead(TaggedHead::encode(first, 0));
            match self.cas_head(head, new_head, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => return,
                Err(current) => head = TaggedHead(current),
            }
        }
    }
}
