//! tieralloc: a three-tier concurrent pool allocator.
//!
//! Optimised for high-throughput churn of small objects (up to 32 KiB)
//! across many threads. Three tiers, fastest first:
//! - Thread caches (per-thread free lists, no locks)
//! - Central cache (per-size-class spin-locked free lists with span accounting)
//! - Page cache (global run pool, coalescing, OS interface)
//!
//! # Usage
//!
//! ```
//! let ptr = tieralloc::allocate(64).expect("out of memory");
//! unsafe {
//!     ptr.as_ptr().write_bytes(0xAA, 64);
//!     tieralloc::deallocate(ptr.as_ptr(), 64);
//! }
//! ```
//!
//! Sizes above 32 KiB bypass the caches and go straight to the system heap.
//! `deallocate` must be given the same size as the matching `allocate` (or
//! any size that rounds into the same class).

pub mod block;
pub mod central_cache;
mod macros;
pub mod page_cache;
pub mod platform;
pub mod pool;
pub mod size_class;
#[cfg(feature = "stats")]
pub mod stats;
pub mod sync;
pub mod thread_cache;

/// Page size used by the allocator (4 KiB).
pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

pub use pool::{allocate, deallocate, shutdown};
