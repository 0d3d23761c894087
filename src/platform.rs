//! OS abstraction for raw page memory.
//!
//! Provides `system_alloc` and `system_free` over the platform virtual
//! memory APIs (mmap on Unix, VirtualAlloc on Windows). Returned memory is
//! page-aligned and zero-initialised by the OS.

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        mod windows;
        use windows as imp;
    } else {
        mod unix;
        use unix as imp;
    }
}

/// Map `size` bytes of zero-initialised, page-aligned memory.
/// Returns null if the OS refuses.
///
/// # Safety
///
/// The caller must eventually pass the returned pointer and the same `size`
/// to [`system_free`], and must not access the region afterwards.
#[inline]
pub unsafe fn system_alloc(size: usize) -> *mut u8 {
    debug_assert!(size > 0 && size % crate::PAGE_SIZE == 0);
    unsafe { imp::system_alloc(size) }
}

/// Unmap memory previously obtained from [`system_alloc`].
///
/// # Safety
///
/// `ptr` must have been returned by [`system_alloc`] with this exact `size`,
/// and must not be freed twice.
#[inline]
pub unsafe fn system_free(ptr: *mut u8, size: usize) {
    unsafe { imp::system_free(ptr, size) }
}
