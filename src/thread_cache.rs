//! Thread cache (front tier): per-thread free lists served without
//! synchronisation.
//!
//! Single-block allocate and deallocate never cross a thread boundary.
//! Empty lists refill from the central cache in batches that double per
//! refill (slow start); a list whose cached bytes cross the cap flushes
//! half of itself back and halves the next batch (fast recycle), so each
//! class's working set tracks demand in both directions.

use crate::block::next_block;
use crate::central_cache::CentralCache;
use crate::page_cache::PageCache;
use crate::size_class::{self, MAX_CACHED_SIZE, MAX_UNIT_COUNT, NUM_SIZE_CLASSES};
use crate::stat_inc;
use core::ptr;
use std::ptr::NonNull;

/// Cached-byte cap per class list (2 MiB); crossing it flushes half.
pub const MAX_FREE_BYTES_PER_LIST: usize = 1 << 21;

/// Smallest refill batch.
const MIN_BATCH: usize = 16;

/// Floor for the batch counter when a flush halves it.
const BATCH_FLOOR_AFTER_FLUSH: usize = 4;

/// Free list of one size class within a thread cache.
struct FreeList {
    head: *mut u8,
    length: usize,
    /// Slow-start counter: blocks to request on the next refill.
    next_batch: usize,
}

impl FreeList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            length: 0,
            next_batch: 0,
        }
    }

    /// Batch size for the refill happening now; the stored counter
    /// advances (doubles, capped) for the refill after it.
    fn compute_batch(&mut self, size: usize) -> usize {
        let result = self.next_batch.max(MIN_BATCH);

        let class_cap = if size <= 128 {
            256
        } else if size <= 1024 {
            128
        } else {
            64
        };
        // Also cap so that one refill can never itself trigger a flush,
        // and never move more than a page's worth of pointers at once.
        let next = (result * 2)
            .min(class_cap)
            .min(MAX_FREE_BYTES_PER_LIST / size / 2)
            .min(MAX_UNIT_COUNT);
        self.next_batch = next;

        result
    }
}

/// Per-thread cache holding one free list per size class.
///
/// Strictly thread-owned; the only shared state it touches is the central
/// cache, under that cache's per-class locks. The pool wiring gives every
/// OS thread one instance and flushes it back on thread exit.
pub struct ThreadCache {
    lists: [FreeList; NUM_SIZE_CLASSES],
}

impl Default for ThreadCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadCache {
    pub const fn new() -> Self {
        Self {
            lists: [const { FreeList::new() }; NUM_SIZE_CLASSES],
        }
    }

    /// Allocate `size` bytes. Zero yields `None`; sizes above
    /// [`MAX_CACHED_SIZE`] bypass the cache via the central tier.
    ///
    /// # Safety
    ///
    /// The returned block is uninitialised and owned by the caller until
    /// passed back to [`deallocate`](Self::deallocate) with the same size.
    pub unsafe fn allocate(
        &mut self,
        size: usize,
        central: &CentralCache,
        pages: &PageCache,
    ) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let size = size_class::round_to_class(size);
        if size > MAX_CACHED_SIZE {
            return unsafe { central.allocate(size, 1, pages) };
        }

        let index = size_class::class_index(size);
        let list = &mut self.lists[index];
        if !list.head.is_null() {
            let block = list.head;
            list.head = unsafe { *next_block(block) };
            list.length -= 1;
            return NonNull::new(block);
        }
        unsafe { self.refill(size, index, central, pages) }
    }

    /// Return a block. Null pointer or zero size is a no-op; sizes above
    /// [`MAX_CACHED_SIZE`] forward to the central tier.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from [`allocate`](Self::allocate) on any thread
    /// with a size rounding into the same class, and must not be used
    /// afterwards.
    pub unsafe fn deallocate(
        &mut self,
        ptr: *mut u8,
        size: usize,
        central: &CentralCache,
        pages: &PageCache,
    ) {
        if ptr.is_null() || size == 0 {
            return;
        }
        let size = size_class::round_to_class(size);
        if size > MAX_CACHED_SIZE {
            unsafe { central.deallocate(ptr, size, pages) };
            return;
        }

        let index = size_class::class_index(size);
        let list = &mut self.lists[index];
        unsafe { *next_block(ptr) = list.head };
        list.head = ptr;
        list.length += 1;

        if list.length * size > MAX_FREE_BYTES_PER_LIST {
            unsafe { self.flush_excess(size, index, central, pages) };
        }
    }

    /// Slow path: fetch a batch from the central cache, keep the head for
    /// the caller, splice the remainder onto the class list.
    #[cold]
    unsafe fn refill(
        &mut self,
        size: usize,
        index: usize,
        central: &CentralCache,
        pages: &PageCache,
    ) -> Option<NonNull<u8>> {
        let batch = self.lists[index].compute_batch(size);
        let head = unsafe { central.allocate(size, batch, pages) }?.as_ptr();
        stat_inc!(cache_refills);

        let list = &mut self.lists[index];
        // Defensive tail walk: stop at the first null or after `batch`
        // nodes, whichever comes first.
        let mut tail = head;
        let mut seen = 1;
        unsafe {
            while seen < batch && !(*next_block(tail)).is_null() {
                tail = *next_block(tail);
                seen += 1;
            }
            *next_block(tail) = list.head;
            list.head = *next_block(head);
        }
        list.length += batch - 1;
        NonNull::new(head)
    }

    /// Sever the first half of the class list and hand it to the central
    /// cache; halve the refill counter.
    unsafe fn flush_excess(
        &mut self,
        size: usize,
        index: usize,
        central: &CentralCache,
        pages: &PageCache,
    ) {
        let list = &mut self.lists[index];
        let drain = list.length / 2;
        debug_assert!(drain >= 1);

        let chunk = list.head;
        let mut tail = chunk;
        for _ in 0..drain - 1 {
            let next = unsafe { *next_block(tail) };
            assert!(
                !next.is_null(),
                "thread cache free list shorter than its recorded length"
            );
            tail = next;
        }
        unsafe {
            list.head = *next_block(tail);
            *next_block(tail) = ptr::null_mut();
        }
        list.length -= drain;
        list.next_batch = (list.next_batch / 2).max(BATCH_FLOOR_AFTER_FLUSH);
        stat_inc!(cache_flushes);

        unsafe { central.deallocate(chunk, size, pages) };
    }

    /// Hand every cached block back to the central cache. Called when the
    /// owning thread finishes, so a finishing thread leaks nothing.
    ///
    /// # Safety
    ///
    /// No blocks may be popped from this cache afterwards without a refill.
    pub unsafe fn flush_all(&mut self, central: &CentralCache, pages: &PageCache) {
        for index in 0..NUM_SIZE_CLASSES {
            let list = &mut self.lists[index];
            if list.head.is_null() {
                continue;
            }
            let head = list.head;
            list.head = ptr::null_mut();
            list.length = 0;
            unsafe { central.deallocate(head, size_class::class_size(index), pages) };
        }
    }
}
