//! The intrusive free-list encoding.
//!
//! A free block's first pointer-sized word stores the address of the next
//! free block, so free lists carry zero per-node overhead. Every read or
//! write of that word goes through [`next_block`] to keep the
//! pointer-in-block encoding explicit at each use site.

use core::ptr;

/// Mutable access to the next-pointer stored in the first word of a free
/// block. A null value terminates the list.
///
/// # Safety
///
/// `block` must be non-null, aligned to `*mut u8`, and point to at least
/// one pointer-sized word of writable memory that the allocator owns (i.e.
/// the block must be free). The returned reference must not outlive that
/// ownership, and no other reference to the word may exist concurrently.
#[inline]
pub unsafe fn next_block<'a>(block: *mut u8) -> &'a mut *mut u8 {
    debug_assert!(!block.is_null());
    debug_assert!(block as usize % core::mem::size_of::<*mut u8>() == 0);
    unsafe { &mut *block.cast::<*mut u8>() }
}

/// Walk a free-list chain and count its blocks.
///
/// # Safety
///
/// `head` must be null or the head of a well-formed, null-terminated chain
/// of free blocks.
pub unsafe fn count_blocks(head: *mut u8) -> usize {
    let mut count = 0;
    let mut current = head;
    while !current.is_null() {
        count += 1;
        current = unsafe { *next_block(current) };
    }
    count
}

/// Build a detached single-block chain: stores a null terminator in the
/// block and returns it as a chain head.
///
/// # Safety
///
/// Same requirements as [`next_block`].
#[inline]
pub unsafe fn singleton(block: *mut u8) -> *mut u8 {
    unsafe { *next_block(block) = ptr::null_mut() };
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_round_trip() {
        // Three 8-aligned slots acting as free blocks.
        let mut slots = [0usize; 3];
        let base = slots.as_mut_ptr().cast::<u8>();
        let a = base;
        let b = unsafe { base.add(size_of::<usize>()) };
        let c = unsafe { base.add(2 * size_of::<usize>()) };

        unsafe {
            let mut head = singleton(c);
            *next_block(b) = head;
            head = b;
            *next_block(a) = head;
            head = a;

            assert_eq!(count_blocks(head), 3);
            assert_eq!(*next_block(a), b);
            assert_eq!(*next_block(b), c);
            assert!((*next_block(c)).is_null());
        }
    }

    #[test]
    fn test_count_empty() {
        unsafe {
            assert_eq!(count_blocks(ptr::null_mut()), 0);
        }
    }
}
