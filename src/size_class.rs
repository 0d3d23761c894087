//! Size class table and lookup functions.
//!
//! Cached allocations are bucketed into size classes to bound fragmentation
//! and enable per-class free lists. The table covers sizes from 8 bytes up
//! to 32 KiB with piecewise-linear steps; anything larger bypasses the
//! caches entirely.

/// All blocks are aligned to the platform pointer size.
pub const ALIGNMENT: usize = core::mem::size_of::<*mut u8>();

/// Largest size served through the size-class caches. Larger requests go
/// straight to the system heap via the page cache's unit path.
pub const MAX_CACHED_SIZE: usize = 32 * 1024;

/// Upper bound on blocks moved between tiers in one batch.
pub const MAX_UNIT_COUNT: usize = crate::PAGE_SIZE / ALIGNMENT;

// Step ladder: (range end, step). Each range is half-open on the left,
// so e.g. 129..=1024 rounds up in 128-byte steps.
const LADDER: [(usize, usize); 4] = [(128, 8), (1024, 128), (8192, 512), (32768, 2048)];

/// Number of size classes: 16 + 7 + 14 + 12.
pub const NUM_SIZE_CLASSES: usize = {
    let mut total = 0;
    let mut range_start = 0;
    let mut i = 0;
    while i < LADDER.len() {
        let (end, step) = LADDER[i];
        total += (end - range_start) / step;
        range_start = end;
        i += 1;
    }
    total
};

/// The size class table, smallest to largest.
pub static SIZE_CLASSES: [usize; NUM_SIZE_CLASSES] = {
    let mut table = [0usize; NUM_SIZE_CLASSES];
    let mut idx = 0;
    let mut range_start = 0;
    let mut i = 0;
    while i < LADDER.len() {
        let (end, step) = LADDER[i];
        let mut size = range_start + step;
        while size <= end {
            table[idx] = size;
            idx += 1;
            size += step;
        }
        range_start = end;
        i += 1;
    }
    table
};

/// Round `size` up to the next multiple of `align` (a power of two).
#[inline]
pub const fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// Round a request up to its size class. Sizes above [`MAX_CACHED_SIZE`]
/// are returned unchanged (they bypass the caches).
///
/// Returns the smallest table entry >= `size` for cached sizes; callers
/// must handle `size == 0` themselves.
#[inline]
pub fn round_to_class(size: usize) -> usize {
    debug_assert!(size > 0);
    if size <= 128 {
        align_up(size, 8)
    } else if size <= 1024 {
        align_up(size, 128)
    } else if size <= 8192 {
        align_up(size, 512)
    } else if size <= MAX_CACHED_SIZE {
        align_up(size, 2048)
    } else {
        size
    }
}

/// Map a size-class value (an exact entry of [`SIZE_CLASSES`]) to its table
/// index. Branch on range, then shift; O(1).
#[inline]
pub fn class_index(cls: usize) -> usize {
    debug_assert!(cls >= 8 && cls <= MAX_CACHED_SIZE);
    if cls <= 128 {
        debug_assert!(cls % 8 == 0);
        cls / 8 - 1
    } else if cls <= 1024 {
        debug_assert!(cls % 128 == 0);
        16 + (cls - 256) / 128
    } else if cls <= 8192 {
        debug_assert!(cls % 512 == 0);
        23 + (cls - 1536) / 512
    } else {
        debug_assert!(cls % 2048 == 0);
        37 + (cls - 10240) / 2048
    }
}

/// The block size for a given class index.
#[inline]
pub fn class_size(index: usize) -> usize {
    SIZE_CLASSES[index]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_shape() {
        assert_eq!(NUM_SIZE_CLASSES, 49);
        assert_eq!(SIZE_CLASSES[0], 8);
        assert_eq!(SIZE_CLASSES[15], 128);
        assert_eq!(SIZE_CLASSES[16], 256);
        assert_eq!(SIZE_CLASSES[22], 1024);
        assert_eq!(SIZE_CLASSES[23], 1536);
        assert_eq!(SIZE_CLASSES[36], 8192);
        assert_eq!(SIZE_CLASSES[37], 10240);
        assert_eq!(SIZE_CLASSES[NUM_SIZE_CLASSES - 1], MAX_CACHED_SIZE);
    }

    #[test]
    fn test_classes_monotonically_increasing() {
        for i in 1..NUM_SIZE_CLASSES {
            assert!(
                SIZE_CLASSES[i] > SIZE_CLASSES[i - 1],
                "class {} size {} not greater than class {} size {}",
                i,
                SIZE_CLASSES[i],
                i - 1,
                SIZE_CLASSES[i - 1]
            );
        }
    }

    #[test]
    fn test_all_sizes_pointer_aligned() {
        for (i, &size) in SIZE_CLASSES.iter().enumerate() {
            assert_eq!(size % ALIGNMENT, 0, "class {i} size {size} misaligned");
        }
    }

    #[test]
    fn test_round_up_exact_sizes() {
        for &size in &SIZE_CLASSES {
            assert_eq!(round_to_class(size), size);
        }
    }

    #[test]
    fn test_round_up_boundaries() {
        assert_eq!(round_to_class(1), 8);
        assert_eq!(round_to_class(7), 8);
        assert_eq!(round_to_class(9), 16);
        assert_eq!(round_to_class(128), 128);
        assert_eq!(round_to_class(129), 256);
        assert_eq!(round_to_class(1024), 1024);
        assert_eq!(round_to_class(1025), 1536);
        assert_eq!(round_to_class(8192), 8192);
        assert_eq!(round_to_class(8193), 10240);
        assert_eq!(round_to_class(16384), 16384);
        assert_eq!(round_to_class(16384 + 8), 18432);
        assert_eq!(round_to_class(32768), 32768);
    }

    #[test]
    fn test_large_sizes_pass_through() {
        assert_eq!(round_to_class(32769), 32769);
        assert_eq!(round_to_class(1_000_000), 1_000_000);
    }

    #[test]
    fn test_index_round_trip_all_classes() {
        for (i, &size) in SIZE_CLASSES.iter().enumerate() {
            assert_eq!(
                class_index(size),
                i,
                "round-trip failed for class {i} (size {size})"
            );
            assert_eq!(class_size(i), size);
        }
    }

    #[test]
    fn test_rounding_and_indexing_agree() {
        for n in 1..=MAX_CACHED_SIZE {
            let cls = round_to_class(n);
            assert!(cls >= n);
            assert_eq!(
                SIZE_CLASSES[class_index(cls)],
                cls,
                "disagreement at request size {n}"
            );
        }
    }

    #[test]
    fn test_smallest_entry_not_less() {
        // Spot-check that rounding really picks the smallest entry >= n.
        for n in [1usize, 8, 100, 200, 1000, 1100, 5000, 9000, 30000] {
            let cls = round_to_class(n);
            let smallest = SIZE_CLASSES
                .iter()
                .copied()
                .find(|&s| s >= n)
                .expect("in cached range");
            assert_eq!(cls, smallest, "wrong class for request size {n}");
        }
    }
}
