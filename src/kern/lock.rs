//! Locking Primitives
//!
//! Based on Mach4 kern/lock.h/c by Avadis Tevanian, Jr. and Michael Wayne Young
//!
//! A read/write lock protecting a value, whose read guard can be dropped
//! and retaken around a call that must not run under the lock.
//!
//! The address space's VMA list is guarded by `RwLock`. Fault handling
//! enters memory objects with the read side held; an object that needs to
//! do work that may block releases it with `ReadGuard::unlocked`.
//!
//! Short critical sections elsewhere use `spin::Mutex`.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

// ============================================================================
// Read/Write Lock
// ============================================================================

/// Held for writing
const WRITER: u32 = 1 << 31;
/// A writer is spinning; new readers hold off
const WRITER_WAITING: u32 = 1 << 30;
/// Reader count
const READERS: u32 = WRITER_WAITING - 1;

/// A read/write lock protecting a value
///
/// Many readers or one writer. A waiting writer blocks new readers, so a
/// thread must not take the read side twice.
pub struct RwLock<T> {
    state: AtomicU32,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            state: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    fn lock_read(&self) {
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state & (WRITER | WRITER_WAITING) == 0
                && self
                    .state
                    .compare_exchange_weak(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            core::hint::spin_loop();
        }
    }

    fn unlock_read(&self) {
        self.state.fetch_sub(1, Ordering::Release);
    }

    fn lock_write(&self) {
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state & (WRITER | READERS) == 0 {
                // Taking the lock also clears our waiting bit
                if self
                    .state
                    .compare_exchange_weak(state, WRITER, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
            } else if state & WRITER_WAITING == 0 {
                self.state.fetch_or(WRITER_WAITING, Ordering::Relaxed);
            }
            core::hint::spin_loop();
        }
    }

    fn unlock_write(&self) {
        self.state.fetch_and(!WRITER, Ordering::Release);
    }

    /// Acquire for reading (shared access)
    pub fn read(&self) -> ReadGuard<'_, T> {
        self.lock_read();
        ReadGuard { lock: self }
    }

    /// Acquire for writing (exclusive access)
    pub fn write(&self) -> WriteGuard<'_, T> {
        self.lock_write();
        WriteGuard { lock: self }
    }

    pub fn read_count(&self) -> u32 {
        self.state.load(Ordering::Relaxed) & READERS
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & WRITER != 0
    }

    pub fn is_read_locked(&self) -> bool {
        self.read_count() != 0
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> core::fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RwLock")
            .field("readers", &self.read_count())
            .field("writer", &self.is_write_locked())
            .finish()
    }
}

// ============================================================================
// Guards
// ============================================================================

/// Shared access to the value
pub struct ReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<'a, T> ReadGuard<'a, T> {
    /// Run `f` with the read lock released, then take it again
    ///
    /// Anything read through the guard before the call may be stale
    /// afterwards; callers revalidate.
    pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.lock.unlock_read();
        let result = f();
        self.lock.lock_read();
        result
    }
}

impl<'a, T> core::ops::Deref for ReadGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: no writer while a reader is counted
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> Drop for ReadGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock_read();
    }
}

/// Exclusive access to the value
pub struct WriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<'a, T> core::ops::Deref for WriteGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: WRITER is set by this guard
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> core::ops::DerefMut for WriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: WRITER is set by this guard
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for WriteGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock_write();
    }
}
