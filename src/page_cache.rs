//! Page cache (back-end): the sole intermediary with the OS for page runs.
//!
//! Owns a pool of page-aligned runs. Allocation is best-fit by page count
//! with prefix slicing; deallocation coalesces with both address-adjacent
//! neighbours, so the pool never stores two touching runs. OS regions are
//! recorded and returned wholesale at [`PageCache::stop`].
//!
//! Sizes above the cacheable threshold take the unit path, which delegates
//! straight to the system heap with no page accounting.

use crate::platform;
use crate::size_class::{ALIGNMENT, MAX_CACHED_SIZE};
use crate::{PAGE_SHIFT, PAGE_SIZE};
use crate::{stat_add, stat_inc};
use std::alloc::Layout;
use std::collections::{BTreeMap, BTreeSet};
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Pages fetched from the OS per growth step (8 MiB), unless a single
/// request needs more.
pub const PAGE_ALLOCATE_COUNT: usize = 2048;

/// A contiguous, page-aligned sequence of pages. The atomic unit of
/// OS-level allocation and of coalescing.
///
/// Stored as page IDs (address >> [`PAGE_SHIFT`]) so runs order and compare
/// by start address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct PageRun {
    start_page: usize,
    num_pages: usize,
}

impl PageRun {
    pub const fn new(start_page: usize, num_pages: usize) -> Self {
        Self {
            start_page,
            num_pages,
        }
    }

    /// Wrap a raw page-aligned region of whole pages.
    pub fn from_raw(ptr: *mut u8, bytes: usize) -> Self {
        assert!(!ptr.is_null());
        assert!(ptr as usize % PAGE_SIZE == 0, "run start not page-aligned");
        assert!(bytes % PAGE_SIZE == 0, "run length not page-aligned");
        Self {
            start_page: ptr as usize >> PAGE_SHIFT,
            num_pages: bytes >> PAGE_SHIFT,
        }
    }

    #[inline]
    pub const fn start_page(&self) -> usize {
        self.start_page
    }

    #[inline]
    pub const fn num_pages(&self) -> usize {
        self.num_pages
    }

    /// One past the last page ID in this run.
    #[inline]
    pub const fn end_page(&self) -> usize {
        self.start_page + self.num_pages
    }

    /// Base address of the covered memory.
    #[inline]
    pub const fn base(&self) -> *mut u8 {
        (self.start_page << PAGE_SHIFT) as *mut u8
    }

    #[inline]
    pub const fn byte_len(&self) -> usize {
        self.num_pages * PAGE_SIZE
    }

    /// Split off the first `prefix_pages` pages; the second half may be
    /// empty.
    fn split(self, prefix_pages: usize) -> (PageRun, PageRun) {
        debug_assert!(prefix_pages <= self.num_pages);
        (
            PageRun::new(self.start_page, prefix_pages),
            PageRun::new(self.start_page + prefix_pages, self.num_pages - prefix_pages),
        )
    }
}

/// The two free-run indices plus the OS region ledger.
struct PageStore {
    /// Free runs bucketed by exact page count, for best-fit allocation.
    /// Buckets are pruned when they empty.
    free_by_count: BTreeMap<usize, BTreeSet<PageRun>>,
    /// Free runs keyed by start page, for neighbour lookup while coalescing.
    free_by_addr: BTreeMap<usize, PageRun>,
    /// Every region obtained from the OS, for teardown.
    os_regions: Vec<PageRun>,
    stopped: bool,
}

impl PageStore {
    const fn new() -> Self {
        Self {
            free_by_count: BTreeMap::new(),
            free_by_addr: BTreeMap::new(),
            os_regions: Vec::new(),
            stopped: false,
        }
    }

    fn insert_free(&mut self, run: PageRun) {
        debug_assert!(run.num_pages() > 0);
        self.free_by_count
            .entry(run.num_pages())
            .or_default()
            .insert(run);
        self.free_by_addr.insert(run.start_page(), run);
    }

    fn remove_free(&mut self, run: PageRun) {
        if let Some(bucket) = self.free_by_count.get_mut(&run.num_pages()) {
            bucket.remove(&run);
            if bucket.is_empty() {
                self.free_by_count.remove(&run.num_pages());
            }
        }
        self.free_by_addr.remove(&run.start_page());
    }
}

/// Process-wide run pool behind a single mutex. Every externally visible
/// operation holds the mutex for its whole duration; the unit path never
/// takes it.
pub struct PageCache {
    store: Mutex<PageStore>,
}

impl Default for PageCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PageCache {
    pub const fn new() -> Self {
        Self {
            store: Mutex::new(PageStore::new()),
        }
    }

    fn store(&self) -> MutexGuard<'_, PageStore> {
        // A poisoning panic mid-operation already aborted that operation;
        // teardown and later asserts still need the state.
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lease a run of exactly `page_count` pages.
    ///
    /// Best-fit over the free pool, slicing off the requested prefix and
    /// keeping the remainder; grows from the OS when nothing fits. `None`
    /// for a zero request, after [`stop`](Self::stop), or when the OS
    /// refuses memory.
    pub fn allocate_page(&self, page_count: usize) -> Option<PageRun> {
        if page_count == 0 {
            return None;
        }
        let mut store = self.store();
        if store.stopped {
            return None;
        }

        // Smallest count class that can satisfy the request, any run of it.
        let found = store
            .free_by_count
            .range(page_count..)
            .next()
            .and_then(|(_, bucket)| bucket.first().copied());
        if let Some(run) = found {
            store.remove_free(run);
            let (head, rest) = run.split(page_count);
            if rest.num_pages() > 0 {
                store.insert_free(rest);
            }
            return Some(head);
        }

        // Nothing cached fits: grow from the OS.
        let grow_pages = page_count.max(PAGE_ALLOCATE_COUNT);
        let bytes = grow_pages * PAGE_SIZE;
        let ptr = unsafe { platform::system_alloc(bytes) };
        if ptr.is_null() {
            return None;
        }
        stat_inc!(os_alloc_count);
        stat_add!(os_alloc_bytes, bytes as u64);

        let region = PageRun::from_raw(ptr, bytes);
        store.os_regions.push(region);
        let (head, rest) = region.split(page_count);
        if rest.num_pages() > 0 {
            store.insert_free(rest);
        }
        Some(head)
    }

    /// Return a leased run. Coalesces with the free neighbours on both
    /// sides before reinserting, so adjacent free pages always form one run.
    pub fn deallocate_page(&self, run: PageRun) {
        debug_assert!(run.num_pages() > 0);
        let mut store = self.store();
        assert!(
            !store.free_by_addr.contains_key(&run.start_page()),
            "run starting at page {:#x} is already free",
            run.start_page()
        );

        let mut merged = run;
        // Absorb the immediate left neighbour while it ends where we start.
        loop {
            let prev = store
                .free_by_addr
                .range(..merged.start_page())
                .next_back()
                .map(|(_, r)| *r);
            match prev {
                Some(prev) if prev.end_page() == merged.start_page() => {
                    store.remove_free(prev);
                    merged = PageRun::new(prev.start_page(), prev.num_pages() + merged.num_pages());
                    stat_inc!(coalesce_count);
                }
                _ => break,
            }
        }
        // Then absorb runs that start exactly where we end.
        while let Some(next) = store.free_by_addr.get(&merged.end_page()).copied() {
            store.remove_free(next);
            merged = PageRun::new(merged.start_page(), merged.num_pages() + next.num_pages());
            stat_inc!(coalesce_count);
        }

        store.insert_free(merged);
    }

    /// Allocate a block above [`MAX_CACHED_SIZE`] from the system heap.
    /// No page accounting; never touches the run pool.
    pub fn allocate_unit(&self, size: usize) -> Option<NonNull<u8>> {
        debug_assert!(size > MAX_CACHED_SIZE);
        let layout = Layout::from_size_align(size, ALIGNMENT).ok()?;
        let ptr = NonNull::new(unsafe { std::alloc::alloc(layout) });
        if ptr.is_some() {
            stat_inc!(unit_alloc_count);
        }
        ptr
    }

    /// Free a block obtained from [`allocate_unit`](Self::allocate_unit).
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `allocate_unit` with this exact `size`.
    pub unsafe fn deallocate_unit(&self, ptr: *mut u8, size: usize) {
        debug_assert!(size > MAX_CACHED_SIZE);
        stat_inc!(unit_free_count);
        let layout =
            Layout::from_size_align(size, ALIGNMENT).expect("unit layout was valid at allocation");
        unsafe { std::alloc::dealloc(ptr, layout) };
    }

    /// Release every OS region and refuse further page allocation.
    /// Idempotent. Callers must have returned all leased runs first; blocks
    /// still cached elsewhere dangle after this.
    pub fn stop(&self) {
        let mut store = self.store();
        if store.stopped {
            return;
        }
        store.stopped = true;
        store.free_by_count.clear();
        store.free_by_addr.clear();
        for region in std::mem::take(&mut store.os_regions) {
            unsafe { platform::system_free(region.base(), region.byte_len()) };
        }
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        self.stop();
    }
}
