//! Cleaner
//!
//! A background reaper that frees native resources whose managed owner has
//! been collected. Each tracked resource moves through three states:
//!
//! ```text
//! ACTIVE ──(owner collected, token queued)──► ENQUEUED ──(reaped)──► DISPOSED
//! ```
//!
//! The reaper blocks on the reference queue. For every token it takes the
//! GIL, unlinks the entry from the tracking table, disposes the resource and
//! drops the GIL again. Handle-slot tokens from the handle table come through
//! the same queue and return their slot to the free list.

use super::queue::{PhantomToken, Reclaim};
use crate::error::fatal;
use crate::handle::HandleTable;
use crate::object::RObject;
use crate::runtime::Shared;
use crate::shadow::ShadowBuffer;
use crate::sync::{Gil, GilCell};
use cext_sdk::DataFreeFn;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::ffi::c_void;
use std::io;
use std::mem;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

/// Identifies one tracked native resource
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TrackId(u64);

impl TrackId {
    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// A native resource owned by a managed object
pub(crate) enum TrackedResource {
    /// Shadow memory of a string or array
    Shadow(Arc<ShadowBuffer>),
    /// Pointer wrapped by a data object, released with its free function
    Data {
        ptr: *mut c_void,
        free: Option<DataFreeFn>,
    },
}

// Data pointers are only dereferenced by their free function, under the GIL.
unsafe impl Send for TrackedResource {}

impl TrackedResource {
    /// Release the native side; true if this call did the work
    fn dispose(self) -> bool {
        match self {
            TrackedResource::Shadow(buffer) => buffer.dispose(),
            TrackedResource::Data { ptr, free } => {
                if let Some(free) = free {
                    if !ptr.is_null() {
                        unsafe { free(ptr) };
                    }
                }
                true
            }
        }
    }
}

#[derive(Default)]
struct TrackingTable {
    next: u64,
    entries: FxHashMap<TrackId, TrackedResource>,
}

/// Cleaner statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanerStats {
    /// Resources still tracked (ACTIVE or ENQUEUED)
    pub tracked: usize,
    /// Queue messages handled
    pub processed: u64,
    /// Native resources released
    pub disposed: u64,
    /// Handle slots returned to the table
    pub handles_reclaimed: u64,
}

/// Background reaper for native resources
pub struct Cleaner {
    queue: Sender<Reclaim>,
    receiver: Mutex<Option<Receiver<Reclaim>>>,
    tracked: GilCell<TrackingTable>,
    live: AtomicUsize,
    processed: AtomicU64,
    disposed: AtomicU64,
    handles_reclaimed: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Cleaner {
    /// Create a cleaner draining `receiver`; nothing runs until [`Cleaner::start`]
    pub fn new(queue: Sender<Reclaim>, receiver: Receiver<Reclaim>) -> Self {
        Self {
            queue,
            receiver: Mutex::new(Some(receiver)),
            tracked: GilCell::new(TrackingTable::default()),
            live: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            disposed: AtomicU64::new(0),
            handles_reclaimed: AtomicU64::new(0),
            thread: Mutex::new(None),
        }
    }

    /// Sender side of the reference queue
    pub fn queue(&self) -> &Sender<Reclaim> {
        &self.queue
    }

    /// Spawn the reaper thread
    ///
    /// The thread holds only a weak reference to the runtime and exits once
    /// the runtime is gone. It is never joined.
    pub(crate) fn start(&self, runtime: Weak<Shared>, name: &str) -> io::Result<()> {
        let Some(receiver) = self.receiver.lock().take() else {
            return Ok(());
        };

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || reaper_loop(runtime, receiver))?;
        *self.thread.lock() = Some(handle);
        tracing::debug!(thread = name, "cleaner started");
        Ok(())
    }

    /// Check whether the reaper thread was started
    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some()
    }

    /// Track a native resource owned by `owner`
    pub(crate) fn track(&self, gil: &Gil, owner: &RObject, resource: TrackedResource) -> TrackId {
        let id = {
            let mut table = self.tracked.borrow_mut(gil);
            table.next += 1;
            let id = TrackId(table.next);
            table.entries.insert(id, resource);
            id
        };
        self.live.fetch_add(1, Ordering::Relaxed);
        owner.register_phantom(&self.queue, PhantomToken::Resource(id));
        id
    }

    /// Handle one collected token (reaper thread, or inline in tests)
    pub(crate) fn reap(&self, gil: &Gil, handles: &GilCell<HandleTable>, token: PhantomToken) {
        let _guard = gil.acquire();
        self.processed.fetch_add(1, Ordering::Relaxed);

        match token {
            PhantomToken::Handle(handle) => {
                if handles.borrow_mut(gil).reclaim(handle) {
                    self.handles_reclaimed.fetch_add(1, Ordering::Relaxed);
                }
            }
            PhantomToken::Resource(id) => {
                let entry = self.tracked.borrow_mut(gil).entries.remove(&id);
                let Some(resource) = entry else {
                    return;
                };
                self.live.fetch_sub(1, Ordering::Relaxed);
                if resource.dispose() {
                    self.disposed.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(track_id = id.0, "disposed native resource");
                }
            }
        }
    }

    /// Release every resource still tracked, whether or not its owner was
    /// collected; returns how many were disposed
    ///
    /// Runs at runtime teardown. Entries leave the table here, so a token
    /// that arrives later finds nothing to release.
    pub(crate) fn dispose_all(&self, gil: &Gil) -> usize {
        let _guard = gil.acquire();
        let entries = mem::take(&mut self.tracked.borrow_mut(gil).entries);
        let mut count = 0;
        for (_, resource) in entries {
            self.live.fetch_sub(1, Ordering::Relaxed);
            if resource.dispose() {
                count += 1;
            }
        }
        self.disposed.fetch_add(count as u64, Ordering::Relaxed);
        if count > 0 {
            tracing::debug!(count, "disposed native resources at teardown");
        }
        count
    }

    /// Block until every token queued before this call has been reaped
    ///
    /// Must not be called with the GIL held: the reaper needs it.
    pub fn sync(&self, gil: &Gil) {
        if gil.is_held_by_current_thread() {
            fatal("Cleaner::sync called while holding the GIL");
        }
        if !self.is_running() {
            return;
        }
        let (ack_tx, ack_rx) = channel::bounded(1);
        if self.queue.send(Reclaim::Barrier(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    /// Snapshot statistics
    pub fn stats(&self) -> CleanerStats {
        CleanerStats {
            tracked: self.live.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            disposed: self.disposed.load(Ordering::Relaxed),
            handles_reclaimed: self.handles_reclaimed.load(Ordering::Relaxed),
        }
    }
}

fn reaper_loop(runtime: Weak<Shared>, receiver: Receiver<Reclaim>) {
    while let Ok(message) = receiver.recv() {
        match message {
            Reclaim::Collected(token) => {
                let Some(shared) = runtime.upgrade() else {
                    break;
                };
                shared.cleaner.reap(&shared.gil, &shared.handles, token);
            }
            Reclaim::Barrier(ack) => {
                let _ = ack.send(());
            }
            Reclaim::Shutdown => break,
        }
    }
    tracing::debug!("cleaner stopped");
}
