//! Allocation statistics counters.
//!
//! All counters use `Relaxed` ordering: they are observational only and
//! never used for synchronisation. The tier locks provide the ordering that
//! correctness needs; these exist for monitoring and for tests that need to
//! observe which path served a request.

use core::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct Stats {
    /// Calls to `allocate` with a non-zero size.
    pub alloc_count: AtomicU64,
    /// Calls to `deallocate` with a non-null pointer and non-zero size.
    pub dealloc_count: AtomicU64,
    /// Thread-cache refills from the central cache.
    pub cache_refills: AtomicU64,
    /// Thread-cache half-flushes back to the central cache.
    pub cache_flushes: AtomicU64,
    /// Runs leased and sliced by the central cache.
    pub span_allocs: AtomicU64,
    /// Fully-free runs returned whole to the page cache.
    pub span_recycles: AtomicU64,
    /// OS page mappings requested by the page cache.
    pub os_alloc_count: AtomicU64,
    /// Bytes of those mappings.
    pub os_alloc_bytes: AtomicU64,
    /// Large-block (above the cacheable threshold) allocations.
    pub unit_alloc_count: AtomicU64,
    /// Large-block frees.
    pub unit_free_count: AtomicU64,
    /// Adjacent free runs merged during page deallocation.
    pub coalesce_count: AtomicU64,
}

impl Stats {
    const fn new() -> Self {
        Self {
            alloc_count: AtomicU64::new(0),
            dealloc_count: AtomicU64::new(0),
            cache_refills: AtomicU64::new(0),
            cache_flushes: AtomicU64::new(0),
            span_allocs: AtomicU64::new(0),
            span_recycles: AtomicU64::new(0),
            os_alloc_count: AtomicU64::new(0),
            os_alloc_bytes: AtomicU64::new(0),
            unit_alloc_count: AtomicU64::new(0),
            unit_free_count: AtomicU64::new(0),
            coalesce_count: AtomicU64::new(0),
        }
    }
}

pub(crate) static STATS: Stats = Stats::new();

/// A point-in-time copy of all counters.
///
/// Each field is loaded atomically, but the snapshot as a whole is not
/// globally consistent; concurrent operations may race between loads.
#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot {
    pub alloc_count: u64,
    pub dealloc_count: u64,
    pub cache_refills: u64,
    pub cache_flushes: u64,
    pub span_allocs: u64,
    pub span_recycles: u64,
    pub os_alloc_count: u64,
    pub os_alloc_bytes: u64,
    pub unit_alloc_count: u64,
    pub unit_free_count: u64,
    pub coalesce_count: u64,
}

/// Load every counter with `Relaxed` ordering.
pub fn snapshot() -> Snapshot {
    let s = &STATS;
    Snapshot {
        alloc_count: s.alloc_count.load(Ordering::Relaxed),
        dealloc_count: s.dealloc_count.load(Ordering::Relaxed),
        cache_refills: s.cache_refills.load(Ordering::Relaxed),
        cache_flushes: s.cache_flushes.load(Ordering::Relaxed),
        span_allocs: s.span_allocs.load(Ordering::Relaxed),
        span_recycles: s.span_recycles.load(Ordering::Relaxed),
        os_alloc_count: s.os_alloc_count.load(Ordering::Relaxed),
        os_alloc_bytes: s.os_alloc_bytes.load(Ordering::Relaxed),
        unit_alloc_count: s.unit_alloc_count.load(Ordering::Relaxed),
        unit_free_count: s.unit_free_count.load(Ordering::Relaxed),
        coalesce_count: s.coalesce_count.load(Ordering::Relaxed),
    }
}
