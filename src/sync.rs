//! A thread-safe wrapper over [`crate::BuddyPool`].
//!
//! The core pool is single-threaded (see the crate root docs); this module
//! shares one pool across threads behind a single mutex guarding every
//! public operation. No finer-grained locking is attempted.
use crate::{BuddyError, BuddyPool};
use std::sync::Mutex;

/// A [`BuddyPool`] guarded by a single mutex. All public operations serialize
/// on the same lock, matching the "one mutex guards every public operation"
/// contract -- this crate does not attempt finer-grained locking.
pub struct SyncBuddyPool {
    inner: Mutex<Box<BuddyPool>>,
}

impl SyncBuddyPool {
    /// Creates a new pool of the given size (see [`BuddyPool::new`]) behind a mutex.
    pub fn new(size: usize) -> Result<SyncBuddyPool, BuddyError> {
        let pool = BuddyPool::new(size)?;
        Ok(SyncBuddyPool {
            inner: Mutex::new(pool),
        })
    }

    /// Allocates `size` bytes from the pool. See [`BuddyPool::malloc`].
    pub fn malloc(&self, size: usize) -> Result<*mut u8, BuddyError> {
        let mut guard = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.malloc(size)
    }

    /// Releases a pointer previously returned by `malloc`. See [`BuddyPool::free`].
    pub fn free(&self, ptr: *mut u8) {
        let mut guard = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.free(ptr)
    }
}

// Every field access to the inner `BuddyPool` happens through the mutex, so the
// raw pointers inside it never escape to more than one thread at a time; the
// pool's own heap allocation (see `BuddyPool::new`) never moves.
unsafe impl Send for SyncBuddyPool {}
unsafe impl Sync for SyncBuddyPool {}
