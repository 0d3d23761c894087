//! The per-class critical-section guard.
//!
//! Every central-cache size class keeps its state behind its own atomic
//! flag, so contention scales with the overlap of classes used by
//! concurrent threads, not with total allocation traffic. A holder's
//! critical section can nest a page-cache mutex acquisition and an OS
//! mapping call, so acquisition yields the scheduler between attempts
//! instead of spinning hot: a descheduled holder must be given cycles to
//! finish.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// One class's state behind a test-and-set flag.
///
/// Const-constructible so the whole shard array can live in a `static`.
pub struct ClassFlag<T> {
    flag: AtomicBool,
    state: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for ClassFlag<T> {}
unsafe impl<T: Send> Sync for ClassFlag<T> {}

impl<T> ClassFlag<T> {
    pub const fn new(state: T) -> Self {
        Self {
            flag: AtomicBool::new(false),
            state: UnsafeCell::new(state),
        }
    }

    /// Acquire the flag for the scope of the returned guard, yielding the
    /// scheduler after each unsuccessful attempt.
    #[inline]
    pub fn lock(&self) -> ClassFlagGuard<'_, T> {
        while self.flag.swap(true, Ordering::Acquire) {
            std::thread::yield_now();
        }
        ClassFlagGuard { owner: self }
    }
}

/// Scoped access to the guarded class state. Clears the flag with release
/// ordering when dropped, so the critical section is held unconditionally
/// for its scope, exceptional exits included.
pub struct ClassFlagGuard<'a, T> {
    owner: &'a ClassFlag<T>,
}

impl<T> Deref for ClassFlagGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.owner.state.get() }
    }
}

impl<T> DerefMut for ClassFlagGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.owner.state.get() }
    }
}

impl<T> Drop for ClassFlagGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.owner.flag.store(false, Ordering::Release);
    }
}
