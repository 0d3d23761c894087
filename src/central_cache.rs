//! Central cache (middle tier): per-size-class shared free lists with
//! embedded page bookkeeping.
//!
//! Each size class owns a free list of fixed-size blocks, a map of span
//! records, and its own spin lock, so threads working in disjoint classes
//! never contend. Blocks arrive by slicing runs leased from the page cache;
//! a span record tracks how many blocks of each run are handed out, and
//! the moment a run's count reaches zero its blocks are purged from the
//! class list and the whole run goes back to the page cache.

use crate::block::{count_blocks, next_block};
use crate::page_cache::{PageCache, PageRun};
use crate::size_class::{self, ALIGNMENT, MAX_CACHED_SIZE, MAX_UNIT_COUNT, NUM_SIZE_CLASSES};
use crate::stat_inc;
use crate::sync::ClassFlag;
use crate::thread_cache::MAX_FREE_BYTES_PER_LIST;
use crate::PAGE_SIZE;
use core::ptr;
use std::collections::BTreeMap;
use std::ptr::NonNull;

/// Bookkeeping for one run leased from the page cache and sliced into
/// blocks of a single size class.
struct SpanRecord {
    run: PageRun,
    /// Block size the run was sliced into. Fixed for the record's life.
    unit_size: usize,
    /// Blocks from this run currently handed out of the class free list.
    in_use: usize,
}

impl SpanRecord {
    fn new(run: PageRun, unit_size: usize) -> Self {
        Self {
            run,
            unit_size,
            in_use: 0,
        }
    }

    /// Whether `addr` is a valid block start of size `size` inside this run.
    fn covers(&self, addr: usize, size: usize) -> bool {
        if size != self.unit_size {
            return false;
        }
        let base = self.run.base() as usize;
        addr >= base
            && (addr - base) % self.unit_size == 0
            && (addr - base) + self.unit_size <= self.run.byte_len()
    }
}

/// State of a single size class.
struct ClassShard {
    free_head: *mut u8,
    free_len: usize,
    /// Span records keyed by run start address; a predecessor query
    /// resolves any block to its owning run.
    spans: BTreeMap<usize, SpanRecord>,
    /// Slow-start counter: groups to request from the page cache on the
    /// next refill. Grows by one per refill, halves when a run recycles.
    next_group_count: usize,
}

// SAFETY: only reached through the enclosing ClassFlag; the raw pointers
// reference OS-backed memory that outlives any thread.
unsafe impl Send for ClassShard {}

impl ClassShard {
    const fn new() -> Self {
        Self {
            free_head: ptr::null_mut(),
            free_len: 0,
            spans: BTreeMap::new(),
            next_group_count: 0,
        }
    }

    /// Pages to request for the next refill; advances the slow start.
    fn next_refill_pages(&mut self) -> usize {
        let groups = self.next_group_count.max(1);
        self.next_group_count = groups + 1;
        (groups * MAX_FREE_BYTES_PER_LIST).div_ceil(PAGE_SIZE)
    }

    /// The span record whose run starts at the greatest address <= `addr`.
    fn record_of_mut(&mut self, addr: usize) -> Option<(usize, &mut SpanRecord)> {
        self.spans
            .range_mut(..=addr)
            .next_back()
            .map(|(&start, record)| (start, record))
    }

    /// Unlink every free block lying inside `run` from the class list.
    /// One linear walk.
    unsafe fn purge_run(&mut self, run: PageRun, size: usize) {
        let start = run.base() as usize;
        let end = start + run.byte_len();
        let mut prev: *mut u8 = ptr::null_mut();
        let mut current = self.free_head;
        while !current.is_null() {
            let next = unsafe { *next_block(current) };
            let addr = current as usize;
            if addr >= start && addr + size <= end {
                if prev.is_null() {
                    self.free_head = next;
                } else {
                    unsafe { *next_block(prev) = next };
                }
                self.free_len -= 1;
            } else {
                prev = current;
            }
            current = next;
        }
    }
}

/// Process-wide array of class shards, each behind its own flag.
pub struct CentralCache {
    shards: [ClassFlag<ClassShard>; NUM_SIZE_CLASSES],
}

impl Default for CentralCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CentralCache {
    pub const fn new() -> Self {
        Self {
            shards: [const { ClassFlag::new(ClassShard::new()) }; NUM_SIZE_CLASSES],
        }
    }

    /// Detach a null-terminated chain of exactly `batch` blocks of `size`.
    ///
    /// `size` must already be a size-class value (or anything above
    /// [`MAX_CACHED_SIZE`], which forwards to the page cache's unit path
    /// and ignores `batch`). Returns `None` only when the OS refuses
    /// backing memory.
    ///
    /// # Safety
    ///
    /// Returned blocks are uninitialised memory owned by the caller until
    /// handed back via [`deallocate`](Self::deallocate) with the same size.
    pub unsafe fn allocate(&self, size: usize, batch: usize, pages: &PageCache) -> Option<NonNull<u8>> {
        if size == 0 || batch == 0 {
            return None;
        }
        if size > MAX_CACHED_SIZE {
            return pages.allocate_unit(size);
        }
        debug_assert!(size % ALIGNMENT == 0);
        debug_assert!(batch <= MAX_UNIT_COUNT);

        let index = size_class::class_index(size);
        let mut guard = self.shards[index].lock();
        let shard = &mut *guard;

        let mut chain: *mut u8 = ptr::null_mut();
        if shard.free_len < batch {
            // Not enough cached: lease a fresh run and slice it. Whatever
            // the class list already held stays on it.
            let page_count = shard.next_refill_pages();
            let run = pages.allocate_page(page_count)?;
            stat_inc!(span_allocs);

            let total = run.byte_len() / size;
            assert!(
                total >= batch,
                "run of {total} blocks cannot satisfy a batch of {batch}"
            );

            let mut record = SpanRecord::new(run, size);
            let mut cursor = run.base();
            for _ in 0..batch {
                unsafe { *next_block(cursor) = chain };
                chain = cursor;
                record.in_use += 1;
                cursor = unsafe { cursor.add(size) };
            }
            for _ in batch..total {
                unsafe { *next_block(cursor) = shard.free_head };
                shard.free_head = cursor;
                shard.free_len += 1;
                cursor = unsafe { cursor.add(size) };
            }
            shard.spans.insert(run.base() as usize, record);
        } else {
            for _ in 0..batch {
                let block = shard.free_head;
                assert!(
                    !block.is_null(),
                    "class free list shorter than its recorded length"
                );
                shard.free_head = unsafe { *next_block(block) };
                shard.free_len -= 1;

                let addr = block as usize;
                let (_, record) = shard
                    .record_of_mut(addr)
                    .expect("free block has no owning span record");
                assert!(
                    record.covers(addr, size),
                    "block {addr:#x} lies outside its span record"
                );
                record.in_use += 1;

                unsafe { *next_block(block) = chain };
                chain = block;
            }
        }

        debug_assert_eq!(unsafe { count_blocks(chain) }, batch);
        NonNull::new(chain)
    }

    /// Take back a null-terminated chain of blocks of `size`.
    ///
    /// Each block rejoins the class free list and its span record's count
    /// drops; a run whose count reaches zero is purged from the list and
    /// returned whole to the page cache.
    ///
    /// # Safety
    ///
    /// Every block in the chain must have come from
    /// [`allocate`](Self::allocate) with the same (rounded) `size` and must
    /// not be reachable anywhere else. For sizes above
    /// [`MAX_CACHED_SIZE`], `head` is a single unit-path block, not a chain.
    pub unsafe fn deallocate(&self, head: *mut u8, size: usize, pages: &PageCache) {
        if head.is_null() {
            return;
        }
        if size > MAX_CACHED_SIZE {
            unsafe { pages.deallocate_unit(head, size) };
            return;
        }

        let index = size_class::class_index(size);
        let mut guard = self.shards[index].lock();
        let shard = &mut *guard;

        let mut current = head;
        while !current.is_null() {
            let next = unsafe { *next_block(current) };

            unsafe { *next_block(current) = shard.free_head };
            shard.free_head = current;
            shard.free_len += 1;

            let addr = current as usize;
            let recycled = {
                let (start, record) = shard
                    .record_of_mut(addr)
                    .expect("freed block has no owning span record");
                assert!(
                    record.covers(addr, size),
                    "block {addr:#x} lies outside its span record"
                );
                assert!(record.in_use > 0, "span in-use count underflow");
                record.in_use -= 1;
                (record.in_use == 0).then_some((start, record.run))
            };

            if let Some((start, run)) = recycled {
                // No block of this run is outstanding any more; pull its
                // free blocks off the list and hand the run back whole.
                unsafe { shard.purge_run(run, size) };
                shard.spans.remove(&start);
                shard.next_group_count = (shard.next_group_count / 2).max(1);
                stat_inc!(span_recycles);
                pages.deallocate_page(run);
            }

            current = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> (PageCache, CentralCache) {
        (PageCache::new(), CentralCache::new())
    }

    #[test]
    fn test_zero_args_are_none() {
        let (pages, central) = env();
        unsafe {
            assert!(central.allocate(0, 16, &pages).is_none());
            assert!(central.allocate(64, 0, &pages).is_none());
        }
    }

    #[test]
    fn test_batch_allocate_slices_a_run() {
        let (pages, central) = env();
        unsafe {
            let chain = central.allocate(64, 32, &pages).unwrap().as_ptr();
            assert_eq!(count_blocks(chain), 32);

            let mut node = chain;
            while !node.is_null() {
                assert_eq!(node as usize % ALIGNMENT, 0);
                node = *next_block(node);
            }

            let shard = central.shards[size_class::class_index(64)].lock();
            assert_eq!(shard.spans.len(), 1);
            let record = shard.spans.values().next().unwrap();
            assert_eq!(record.in_use, 32);
            assert_eq!(record.unit_size, 64);
            // Everything not handed out sits on the class list.
            assert_eq!(shard.free_len, record.run.byte_len() / 64 - 32);
        }
    }

    #[test]
    fn test_fast_path_reuses_class_list() {
        let (pages, central) = env();
        unsafe {
            let first = central.allocate(128, 16, &pages).unwrap().as_ptr();
            let before = {
                let shard = central.shards[size_class::class_index(128)].lock();
                (shard.free_len, shard.spans.len())
            };

            // Plenty is cached, so this detaches without a new run.
            let second = central.allocate(128, 8, &pages).unwrap().as_ptr();
            {
                let shard = central.shards[size_class::class_index(128)].lock();
                assert_eq!(shard.free_len, before.0 - 8);
                assert_eq!(shard.spans.len(), before.1);
                assert_eq!(shard.spans.values().next().unwrap().in_use, 24);
            }

            central.deallocate(second, 128, &pages);
            central.deallocate(first, 128, &pages);
        }
    }

    #[test]
    fn test_full_return_recycles_the_run() {
        let (pages, central) = env();
        unsafe {
            let chain = central.allocate(256, 16, &pages).unwrap().as_ptr();
            central.deallocate(chain, 256, &pages);

            // The last returned block drove in_use to zero, so the record
            // is gone and every sliced block was purged from the list.
            let shard = central.shards[size_class::class_index(256)].lock();
            assert!(shard.spans.is_empty());
            assert_eq!(shard.free_len, 0);
            assert!(shard.free_head.is_null());
        }
    }

    #[test]
    fn test_group_schedule_grows_and_halves() {
        let (pages, central) = env();
        let index = size_class::class_index(512);
        unsafe {
            let a = central.allocate(512, 16, &pages).unwrap().as_ptr();
            assert_eq!(central.shards[index].lock().next_group_count, 2);

            central.deallocate(a, 512, &pages);
            assert_eq!(central.shards[index].lock().next_group_count, 1);
        }
    }

    #[test]
    fn test_remove_insert_cycles() {
        let (pages, central) = env();
        unsafe {
            for _ in 0..10 {
                let chain = central.allocate(64, 4, &pages).unwrap().as_ptr();
                assert_eq!(count_blocks(chain), 4);
                central.deallocate(chain, 64, &pages);
            }
        }
    }

    #[test]
    fn test_large_sizes_forward_to_unit_path() {
        let (pages, central) = env();
        let size = MAX_CACHED_SIZE + 8;
        unsafe {
            let ptr = central.allocate(size, 1, &pages).unwrap().as_ptr();
            ptr.write_bytes(0x7E, size);
            assert_eq!(*ptr.add(size - 1), 0x7E);
            central.deallocate(ptr, size, &pages);

            // No shard was involved.
            for shard in &central.shards {
                let shard = shard.lock();
                assert!(shard.spans.is_empty());
                assert_eq!(shard.free_len, 0);
            }
        }
    }
}
