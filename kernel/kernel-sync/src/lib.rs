//! # Kernel synchronization primitives
//!
//! Busy-waiting mutual exclusion for a multi-hart kernel. All operations in
//! the memory subsystem are synchronous and run to completion, so a lock
//! acquisition spins until it succeeds; nothing ever blocks or sleeps.
//!
//! The raw acquire/release capability is abstracted behind [`RawLock`] /
//! [`RawUnlock`] so the atomic instruction sequence stays in one place
//! ([`RawSpin`]) and everything above it is portable. Critical sections are
//! expected to be short and bounded; lock ordering is the callers' contract.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod mutex;
mod raw_spin;
mod sync_once_cell;

pub use mutex::{Mutex, MutexGuard};
pub use raw_spin::RawSpin;
pub use sync_once_cell::SyncOnceCell;

/// A mutex built on the busy-wait primitive.
pub type SpinMutex<T> = Mutex<T, RawSpin>;

impl<T> SpinMutex<T> {
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawSpin::new(), value)
    }
}

/// Exclusive-acquire half of a raw lock.
pub trait RawLock {
    /// Spin until the lock is held by the caller.
    fn raw_lock(&self);
    /// Try once; `true` if the lock was acquired.
    fn raw_try_lock(&self) -> bool;
}

/// Release half of a raw lock.
pub trait RawUnlock {
    /// # Safety
    /// The caller must currently hold the lock.
    unsafe fn raw_unlock(&self);
}
