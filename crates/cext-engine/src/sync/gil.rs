//! Global interpreter lock
//!
//! One OS thread at a time may run native extension code or touch bridge
//! bookkeeping. The holder may re-acquire without blocking; each acquire
//! must be matched by a release. A thread about to block on external work
//! drops every level at once ([`Gil::release_all`]) and later restores the
//! exact depth it had ([`Gil::restore`]).
//!
//! Acquisition never times out. A native extension that never returns
//! hangs the process visibly instead of abandoning shared state.

use crate::error::fatal;
use parking_lot::{Condvar, Mutex};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

#[derive(Debug, Default)]
struct GilState {
    holder: Option<ThreadId>,
    depth: usize,
    waiting: usize,
}

#[derive(Debug, Default)]
struct GilCounters {
    acquisitions: AtomicUsize,
    reentries: AtomicUsize,
    contended: AtomicUsize,
    blocking_releases: AtomicUsize,
}

/// Snapshot of GIL usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GilStats {
    /// Outermost acquisitions (depth 0 -> 1)
    pub acquisitions: usize,
    /// Nested acquisitions by the current holder
    pub reentries: usize,
    /// Acquisitions that had to wait for another holder
    pub contended: usize,
    /// Full releases around blocking calls
    pub blocking_releases: usize,
}

/// Reentrancy depth captured by [`Gil::release_all`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a released GIL depth must be restored"]
pub struct SavedDepth(usize);

impl SavedDepth {
    /// Depth the thread held before releasing
    pub fn depth(self) -> usize {
        self.0
    }
}

/// Reentrant global lock
pub struct Gil {
    state: Mutex<GilState>,
    available: Condvar,
    counters: GilCounters,
}

impl Gil {
    /// Create an unheld lock
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GilState::default()),
            available: Condvar::new(),
            counters: GilCounters::default(),
        }
    }

    /// Acquire and return a guard that releases one level on drop
    pub fn acquire(&self) -> GilGuard<'_> {
        self.lock();
        GilGuard {
            gil: self,
            _not_send: PhantomData,
        }
    }

    /// Acquire one level without a guard (`pre` side of a call boundary)
    pub fn lock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.holder == Some(me) {
            state.depth += 1;
            self.counters.reentries.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.wait_until_free(&mut state, me);
        state.holder = Some(me);
        state.depth = 1;
        self.counters.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    /// Release one level (`post` side of a call boundary)
    pub fn unlock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.holder != Some(me) {
            drop(state);
            fatal("GIL released by a thread that does not hold it");
        }
        if state.depth == 0 {
            drop(state);
            fatal("GIL reentrancy counter underflow");
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.holder = None;
            if state.waiting > 0 {
                self.available.notify_one();
            }
        }
    }

    /// Drop every level held by the calling thread.
    ///
    /// Returns depth 0 if the caller did not hold the lock.
    pub fn release_all(&self) -> SavedDepth {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.holder != Some(me) {
            return SavedDepth(0);
        }
        let saved = state.depth;
        state.depth = 0;
        state.holder = None;
        if state.waiting > 0 {
            self.available.notify_one();
        }
        self.counters
            .blocking_releases
            .fetch_add(1, Ordering::Relaxed);
        SavedDepth(saved)
    }

    /// Re-acquire to the depth captured by [`Gil::release_all`]
    pub fn restore(&self, saved: SavedDepth) {
        if saved.0 == 0 {
            return;
        }
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.holder == Some(me) {
            state.depth += saved.0;
            return;
        }
        self.wait_until_free(&mut state, me);
        state.holder = Some(me);
        state.depth = saved.0;
        self.counters.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    /// Fully release for the lifetime of the returned guard
    pub fn release_for_blocking(&self) -> GilReleased<'_> {
        let saved = self.release_all();
        GilReleased {
            gil: self,
            saved,
            _not_send: PhantomData,
        }
    }

    fn wait_until_free(&self, state: &mut parking_lot::MutexGuard<'_, GilState>, me: ThreadId) {
        if state.holder.is_none() {
            return;
        }
        self.counters.contended.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(thread = ?me, holder = ?state.holder, "waiting for GIL");
        state.waiting += 1;
        while state.holder.is_some() {
            self.available.wait(state);
        }
        state.waiting -= 1;
    }

    /// Check whether the calling thread holds the lock
    pub fn is_held_by_current_thread(&self) -> bool {
        self.state.lock().holder == Some(thread::current().id())
    }

    /// Check whether any thread holds the lock
    pub fn is_locked(&self) -> bool {
        self.state.lock().holder.is_some()
    }

    /// Reentrancy depth of the calling thread (0 if it is not the holder)
    pub fn depth(&self) -> usize {
        let state = self.state.lock();
        if state.holder == Some(thread::current().id()) {
            state.depth
        } else {
            0
        }
    }

    /// Current holder
    pub fn holder(&self) -> Option<ThreadId> {
        self.state.lock().holder
    }

    /// Abort unless the calling thread holds the lock
    #[track_caller]
    pub fn assert_held(&self, operation: &str) {
        if !self.is_held_by_current_thread() {
            fatal(format_args!("{} requires the GIL", operation));
        }
    }

    /// Counter snapshot
    pub fn stats(&self) -> GilStats {
        GilStats {
            acquisitions: self.counters.acquisitions.load(Ordering::Relaxed),
            reentries: self.counters.reentries.load(Ordering::Relaxed),
            contended: self.counters.contended.load(Ordering::Relaxed),
            blocking_releases: self.counters.blocking_releases.load(Ordering::Relaxed),
        }
    }
}

impl Default for Gil {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases one GIL level on drop
///
/// Must be dropped on the acquiring thread, so it is not `Send`.
#[must_use = "dropping the guard releases the GIL immediately"]
pub struct GilGuard<'a> {
    gil: &'a Gil,
    _not_send: PhantomData<*const ()>,
}

impl Drop for GilGuard<'_> {
    fn drop(&mut self) {
        self.gil.unlock();
    }
}

/// Restores the released depth on drop, including during unwinding
#[must_use = "dropping the guard re-acquires the GIL immediately"]
pub struct GilReleased<'a> {
    gil: &'a Gil,
    saved: SavedDepth,
    _not_send: PhantomData<*const ()>,
}

impl GilReleased<'_> {
    /// Depth that will be restored
    pub fn saved_depth(&self) -> usize {
        self.saved.0
    }
}

impl Drop for GilReleased<'_> {
    fn drop(&mut self) {
        self.gil.restore(self.saved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_gil_reentrant_depth() {
        let gil = Gil::new();
        assert_eq!(gil.depth(), 0);
        {
            let _outer = gil.acquire();
            let _inner = gil.acquire();
            assert_eq!(gil.depth(), 2);
            assert!(gil.is_held_by_current_thread());
        }
        assert_eq!(gil.depth(), 0);
        assert!(!gil.is_locked());

        let stats = gil.stats();
        assert_eq!(stats.acquisitions, 1);
        assert_eq!(stats.reentries, 1);
    }

    #[test]
    fn test_release_all_and_restore() {
        let gil = Gil::new();
        gil.lock();
        gil.lock();
        gil.lock();

        let saved = gil.release_all();
        assert_eq!(saved.depth(), 3);
        assert!(!gil.is_locked());

        gil.restore(saved);
        assert_eq!(gil.depth(), 3);
        gil.unlock();
        gil.unlock();
        gil.unlock();
        assert!(!gil.is_locked());
    }

    #[test]
    fn test_release_all_without_holding() {
        let gil = Gil::new();
        let saved = gil.release_all();
        assert_eq!(saved.depth(), 0);
        gil.restore(saved);
        assert!(!gil.is_locked());
    }

    #[test]
    fn test_blocking_guard_restores() {
        let gil = Gil::new();
        let _g1 = gil.acquire();
        let _g2 = gil.acquire();
        {
            let released = gil.release_for_blocking();
            assert_eq!(released.saved_depth(), 2);
            assert_eq!(gil.depth(), 0);
        }
        assert_eq!(gil.depth(), 2);
    }

    #[test]
    fn test_waiter_gets_lock_after_release() {
        let gil = Arc::new(Gil::new());
        let guard = gil.acquire();

        let gil2 = gil.clone();
        let waiter = std::thread::spawn(move || {
            let _g = gil2.acquire();
            gil2.depth()
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(gil.is_held_by_current_thread());
        drop(guard);

        assert_eq!(waiter.join().unwrap(), 1);
        assert!(!gil.is_locked());
    }

    #[test]
    #[should_panic(expected = "does not hold")]
    fn test_unlock_by_non_holder_is_fatal() {
        let gil = Gil::new();
        gil.unlock();
    }
}
