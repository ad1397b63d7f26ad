//! End-to-end scenarios across the pool stack: bucket routing over a shared
//! page pool, upstream growth accounting, and multi-thread stress on the
//! lock-free lists.
