//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., byte totals may briefly disagree with chunk counts).
//! This is acceptable for diagnostic display. Do NOT use these values for
//! allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw
/// value may transiently dip below zero. Readers should always use
/// `load()`/`get()`, which clamp negative values to zero.
#[derive(Debug)]
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

// Chunks currently held by page pools, and their total bytes.
crate::sync::static_atomic! {
    pub static PAGE_POOL_CHUNKS: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static PAGE_POOL_BYTES: Counter = Counter::new();
}

// Bytes currently mapped by file-backed pools.
crate::sync::static_atomic! {
    pub static MAPPED_BYTES: Counter = Counter::new();
}

// Requests the bucket allocator forwarded to the host allocator.
crate::sync::static_atomic! {
    pub static BUCKET_PASSTHROUGH: Counter = Counter::new();
}

/// Best-effort subtract from a diagnostic atomic counter.
///
/// Uses a single atomic subtraction (no TOCTOU load-then-subtract race).
/// Readers clamp negative transients via `Counter::load`.
pub fn sub_saturating(counter: &Counter, val: usize) {
    counter.sub(val);
}

/// Point-in-time snapshot of the crate-wide diagnostic counters.
#[derive(Debug, Clone, Copy)]
pub struct MemoryStats {
    pub page_pool_chunks: usize,
    pub page_pool_bytes: usize,
    pub mapped_bytes: usize,
    pub bucket_passthrough: usize,
}

impl MemoryStats {
    #[must_use]
    pub fn snapshot() -> Self {
        Self {
            page_pool_chunks: PAGE_POOL_CHUNKS.load(Ordering::Relaxed),
            page_pool_bytes: PAGE_POOL_BYTES.load(Ordering::Relaxed),
            mapped_bytes: MAPPED_BYTES.load(Ordering::Relaxed),
            bucket_passthrough: BUCKET_PASSTHROUGH.load(Ordering::Relaxed),
        }
    }
}
