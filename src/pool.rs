//! Public surface: wires the three tiers together.
//!
//! The page cache and central cache are process-wide statics (inert until
//! first use, so initialisation order is trivially page cache, then central
//! cache, then a thread cache). Each thread gets its own [`ThreadCache`]
//! via `thread_local!`; when the thread finishes, the wrapper's `Drop`
//! hands any cached blocks back to the central cache. If thread-local
//! storage is already gone (allocation during thread teardown), calls fall
//! through to the central cache directly.

use crate::block::singleton;
use crate::central_cache::CentralCache;
use crate::page_cache::PageCache;
use crate::size_class::{self, MAX_CACHED_SIZE};
use crate::stat_inc;
use crate::thread_cache::ThreadCache;
use core::cell::UnsafeCell;
use std::ptr::NonNull;

pub(crate) static PAGE_CACHE: PageCache = PageCache::new();
pub(crate) static CENTRAL_CACHE: CentralCache = CentralCache::new();

/// Thread-local cache plus the exit handoff.
struct LocalCache {
    cache: ThreadCache,
}

impl Drop for LocalCache {
    fn drop(&mut self) {
        unsafe { self.cache.flush_all(&CENTRAL_CACHE, &PAGE_CACHE) };
    }
}

std::thread_local! {
    static LOCAL_CACHE: UnsafeCell<LocalCache> = const {
        UnsafeCell::new(LocalCache {
            cache: ThreadCache::new(),
        })
    };
}

/// Allocate `size` bytes.
///
/// Returns `None` for a zero size, and otherwise only when the OS refuses
/// backing memory. The address is aligned to the platform pointer size;
/// sizes round up transparently to their size class, and sizes above 32 KiB
/// bypass the caches entirely.
pub fn allocate(size: usize) -> Option<NonNull<u8>> {
    if size == 0 {
        return None;
    }
    stat_inc!(alloc_count);
    LOCAL_CACHE
        .try_with(|cell| unsafe { (*cell.get()).cache.allocate(size, &CENTRAL_CACHE, &PAGE_CACHE) })
        .unwrap_or_else(|_| allocate_uncached(size))
}

/// Free a block obtained from [`allocate`]. Null `ptr` or zero `size` is a
/// no-op.
///
/// # Safety
///
/// `ptr` must have come from [`allocate`] with a size that rounds into the
/// same size class as `size`, must not have been freed already, and must
/// not be used afterwards.
pub unsafe fn deallocate(ptr: *mut u8, size: usize) {
    if ptr.is_null() || size == 0 {
        return;
    }
    stat_inc!(dealloc_count);
    let routed = LOCAL_CACHE.try_with(|cell| unsafe {
        (*cell.get())
            .cache
            .deallocate(ptr, size, &CENTRAL_CACHE, &PAGE_CACHE)
    });
    if routed.is_err() {
        unsafe { deallocate_uncached(ptr, size) };
    }
}

/// Release every OS region back to the system and refuse further cached
/// allocation. Idempotent.
///
/// Only meaningful once all outstanding blocks have been freed and all
/// allocating threads have finished; blocks still cached anywhere dangle
/// after this.
pub fn shutdown() {
    PAGE_CACHE.stop();
}

/// Fallback used while a thread's local storage is being torn down.
#[cold]
fn allocate_uncached(size: usize) -> Option<NonNull<u8>> {
    let size = size_class::round_to_class(size);
    unsafe { CENTRAL_CACHE.allocate(size, 1, &PAGE_CACHE) }
}

#[cold]
unsafe fn deallocate_uncached(ptr: *mut u8, size: usize) {
    let size = size_class::round_to_class(size);
    unsafe {
        if size <= MAX_CACHED_SIZE {
            singleton(ptr);
        }
        CENTRAL_CACHE.deallocate(ptr, size, &PAGE_CACHE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_size_is_none() {
        assert!(allocate(0).is_none());
    }

    #[test]
    fn test_round_trip() {
        let ptr = allocate(100).unwrap();
        unsafe {
            ptr.as_ptr().write_bytes(0x3D, 100);
            assert_eq!(*ptr.as_ptr().add(99), 0x3D);
            deallocate(ptr.as_ptr(), 100);
        }
    }

    #[test]
    fn test_null_and_zero_free_are_noops() {
        unsafe {
            deallocate(core::ptr::null_mut(), 64);
            let ptr = allocate(64).unwrap();
            deallocate(ptr.as_ptr(), 0);
            deallocate(ptr.as_ptr(), 64);
        }
    }

    #[test]
    fn test_blocks_survive_thread_exit() {
        // A thread's cached blocks are handed back on exit and stay usable
        // from other threads afterwards.
        let addr = std::thread::spawn(|| {
            let ptr = allocate(48).unwrap();
            unsafe { deallocate(ptr.as_ptr(), 48) };
            ptr.as_ptr() as usize
        })
        .join()
        .unwrap();

        let ptr = allocate(48).unwrap();
        unsafe {
            ptr.as_ptr().write_bytes(0x11, 48);
            deallocate(ptr.as_ptr(), 48);
        }
        // The exited thread's block went back through the central cache;
        // nothing asserts it must be reused, only that it was not leaked in
        // a dead thread cache (covered by the span accounting tests).
        let _ = addr;
    }
}
