//! Unix virtual memory via mmap/munmap.

use core::ptr;

pub unsafe fn system_alloc(size: usize) -> *mut u8 {
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        addr.cast()
    }
}

pub unsafe fn system_free(ptr: *mut u8, size: usize) {
    unsafe { libc::munmap(ptr.cast(), size) };
}
