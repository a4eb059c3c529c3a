// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reader/writer lock that can live inside shared memory.
//!
//! The whole lock state is one `AtomicU32`: bit 24 marks an exclusive holder
//! and the low bits count shared holders. No pointers are stored, so the
//! lock is valid at any base address and in any attached process. Waiters
//! spin, then yield; there is no queueing and no fairness guarantee.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

const EXCLUSIVE: u32 = 1 << 24;
const SHARED_MASK: u32 = EXCLUSIVE - 1;
const SPINS_BEFORE_YIELD: u32 = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LwLockMode {
    Shared,
    Exclusive,
}

#[repr(C)]
pub struct LwLock {
    state: AtomicU32,
    tranche: u32,
}

const _: () = assert!(core::mem::size_of::<LwLock>() == 8);

impl LwLock {
    pub const fn new(tranche: u32) -> Self {
        LwLock {
            state: AtomicU32::new(0),
            tranche,
        }
    }

    /// Initializes a lock at `ptr`.
    ///
    /// # Safety
    /// `ptr` must be valid for writes and suitably aligned, and no other
    /// process may be using a lock at that location.
    pub unsafe fn init(ptr: *mut LwLock, tranche: u32) {
        ptr.write(LwLock::new(tranche));
    }

    /// Diagnostic identifier for the group this lock belongs to.
    pub fn tranche(&self) -> u32 {
        self.tranche
    }

    pub fn read(&self) -> LwLockGuard<'_> {
        self.acquire(LwLockMode::Shared)
    }

    pub fn write(&self) -> LwLockGuard<'_> {
        self.acquire(LwLockMode::Exclusive)
    }

    pub fn acquire(&self, mode: LwLockMode) -> LwLockGuard<'_> {
        self.lock_raw(mode);
        LwLockGuard { lock: self, mode }
    }

    pub fn try_acquire(&self, mode: LwLockMode) -> Option<LwLockGuard<'_>> {
        if self.try_lock_raw(mode) {
            Some(LwLockGuard { lock: self, mode })
        } else {
            None
        }
    }

    /// Acquires the lock without producing a guard. The caller is
    /// responsible for a matching [`LwLock::unlock_raw`].
    pub fn lock_raw(&self, mode: LwLockMode) {
        let mut spins = 0;
        while !self.try_lock_raw(mode) {
            if spins < SPINS_BEFORE_YIELD {
                spins += 1;
                core::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    pub fn try_lock_raw(&self, mode: LwLockMode) -> bool {
        match mode {
            LwLockMode::Exclusive => self
                .state
                .compare_exchange(0, EXCLUSIVE, Ordering::Acquire, Ordering::Relaxed)
                .is_ok(),
            LwLockMode::Shared => {
                let current = self.state.load(Ordering::Relaxed);
                if current & EXCLUSIVE != 0 || current & SHARED_MASK == SHARED_MASK {
                    return false;
                }
                self.state
                    .compare_exchange(
                        current,
                        current + 1,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            }
        }
    }

    /// Releases a lock taken with [`LwLock::lock_raw`].
    ///
    /// # Safety
    /// The calling thread must hold the lock in `mode`.
    pub unsafe fn unlock_raw(&self, mode: LwLockMode) {
        match mode {
            LwLockMode::Exclusive => self.state.store(0, Ordering::Release),
            LwLockMode::Shared => {
                self.state.fetch_sub(1, Ordering::Release);
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != 0
    }

    pub fn is_locked_exclusive(&self) -> bool {
        self.state.load(Ordering::Relaxed) & EXCLUSIVE != 0
    }
}

impl fmt::Debug for LwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.load(Ordering::Relaxed);
        f.debug_struct("LwLock")
            .field("tranche", &self.tranche)
            .field("exclusive", &(state & EXCLUSIVE != 0))
            .field("shared", &(state & SHARED_MASK))
            .finish()
    }
}

/// Scoped hold on an [`LwLock`]; released on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LwLockGuard<'a> {
    lock: &'a LwLock,
    mode: LwLockMode,
}

impl<'a> LwLockGuard<'a> {
    pub fn mode(&self) -> LwLockMode {
        self.mode
    }

    pub fn lock(&self) -> &'a LwLock {
        self.lock
    }

    /// Gives up the guard without releasing the lock.
    pub fn leak(self) -> &'a LwLock {
        let lock = self.lock;
        core::mem::forget(self);
        lock
    }
}

impl Drop for LwLockGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard only exists while the lock is held in `mode`.
        unsafe { self.lock.unlock_raw(self.mode) }
    }
}

impl fmt::Debug for LwLockGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LwLockGuard")
            .field("tranche", &self.lock.tranche)
            .field("mode", &self.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn shared_holders_stack() {
        let lock = LwLock::new(7);
        let a = lock.read();
        let b = lock.read();
        assert!(lock.is_locked());
        assert!(!lock.is_locked_exclusive());
        assert!(lock.try_acquire(LwLockMode::Exclusive).is_none());
        drop(a);
        drop(b);
        assert!(!lock.is_locked());
        assert_eq!(lock.tranche(), 7);
    }

    #[test]
    fn exclusive_blocks_everyone() {
        let lock = LwLock::new(0);
        let guard = lock.write();
        assert!(lock.is_locked_exclusive());
        assert!(lock.try_acquire(LwLockMode::Shared).is_none());
        assert!(lock.try_acquire(LwLockMode::Exclusive).is_none());
        drop(guard);
        assert!(lock.try_acquire(LwLockMode::Exclusive).is_some());
        assert!(!lock.is_locked());
    }

    #[test]
    fn leaked_guard_needs_raw_unlock() {
        let lock = LwLock::new(0);
        let raw = lock.read().leak();
        assert!(lock.is_locked());
        unsafe { raw.unlock_raw(LwLockMode::Shared) };
        assert!(!lock.is_locked());
    }

    #[test]
    fn try_acquire_follows_the_holders() {
        bolero::check!()
            .with_type::<Vec<(bool, bool)>>()
            .for_each(|ops| {
                let lock = LwLock::new(0);
                let mut guards: Vec<LwLockGuard<'_>> = Vec::new();
                for &(exclusive, release) in ops {
                    let held_exclusive = guards.iter().any(|g| g.mode() == LwLockMode::Exclusive);
                    if release {
                        guards.pop();
                    } else if exclusive {
                        let guard = lock.try_acquire(LwLockMode::Exclusive);
                        assert_eq!(guard.is_some(), guards.is_empty());
                        guards.extend(guard);
                    } else {
                        let guard = lock.try_acquire(LwLockMode::Shared);
                        assert_eq!(guard.is_some(), !held_exclusive);
                        guards.extend(guard);
                    }
                    assert_eq!(lock.is_locked(), !guards.is_empty());
                    assert_eq!(
                        lock.is_locked_exclusive(),
                        guards.iter().any(|g| g.mode() == LwLockMode::Exclusive)
                    );
                }
            });
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn counter_under_contention() {
        let lock = Arc::new(LwLock::new(0));
        let counter = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let _guard = lock.write();
                        // Non-atomic read-modify-write is safe under the lock.
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
        assert!(!lock.is_locked());
    }
}
