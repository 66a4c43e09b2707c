//! Managed threads and interrupt delivery
//!
//! Every OS thread that runs managed code has a [`ThreadControl`]: a pending
//! interrupt flag, the unblock callback of the blocking call it is currently
//! in (if any), and a safepoint inhibition counter. Threads created with
//! [`Runtime::spawn_thread`] get one installed up front. Other threads get
//! one lazily on first use.

use crate::error::CallError;
use crate::runtime::Runtime;
use cext_sdk::UnblockFn;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::ffi::c_void;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

thread_local! {
    static CURRENT: RefCell<Option<Arc<ThreadControl>>> = const { RefCell::new(None) };
}

struct UnblockCallback {
    func: UnblockFn,
    data: *mut c_void,
}

// The data pointer is only handed back to the native callback it came with.
unsafe impl Send for UnblockCallback {}

/// Per-thread interrupt and blocking state
#[derive(Default)]
pub struct ThreadControl {
    interrupted: AtomicBool,
    unblock: Mutex<Option<UnblockCallback>>,
    inhibit: AtomicUsize,
}

impl ThreadControl {
    /// Create fresh control state
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Control state of the calling thread
    pub fn current() -> Arc<ThreadControl> {
        CURRENT.with(|slot| slot.borrow_mut().get_or_insert_with(ThreadControl::new).clone())
    }

    fn install(control: Arc<ThreadControl>) {
        CURRENT.with(|slot| *slot.borrow_mut() = Some(control));
    }

    /// Ask the owning thread to stop
    ///
    /// If the thread is inside a blocking call that registered an unblock
    /// callback, the callback runs now, on the interrupting thread. Otherwise
    /// the interrupt waits for the thread's next native call boundary.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        let unblock = self.unblock.lock();
        if let Some(callback) = unblock.as_ref() {
            tracing::debug!("waking blocked native call");
            unsafe { (callback.func)(callback.data) };
        }
    }

    /// Check for a pending interrupt without consuming it
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Consume a pending interrupt
    pub fn check_interrupts(&self) -> Result<(), CallError> {
        if self.interrupted.swap(false, Ordering::SeqCst) {
            return Err(CallError::Interrupted);
        }
        Ok(())
    }

    /// Register the unblock callback for the duration of a blocking call
    pub(crate) fn register_unblock(
        &self,
        func: Option<UnblockFn>,
        data: *mut c_void,
    ) -> UnblockRegistration<'_> {
        *self.unblock.lock() = func.map(|func| UnblockCallback { func, data });
        UnblockRegistration { control: self }
    }

    /// Suppress cooperative sweeps while the guard lives
    pub fn inhibit_safepoints(&self) -> SafepointInhibit<'_> {
        self.inhibit.fetch_add(1, Ordering::SeqCst);
        SafepointInhibit { control: self }
    }

    /// Check whether this thread is in a region that must not run sweeps
    pub fn safepoints_inhibited(&self) -> bool {
        self.inhibit.load(Ordering::SeqCst) > 0
    }
}

/// Clears the unblock callback on drop
pub(crate) struct UnblockRegistration<'a> {
    control: &'a ThreadControl,
}

impl Drop for UnblockRegistration<'_> {
    fn drop(&mut self) {
        *self.control.unblock.lock() = None;
    }
}

/// Re-enables safepoints on drop
pub struct SafepointInhibit<'a> {
    control: &'a ThreadControl,
}

impl Drop for SafepointInhibit<'_> {
    fn drop(&mut self) {
        self.control.inhibit.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A thread running managed code
pub struct ManagedThread<T> {
    control: Arc<ThreadControl>,
    handle: JoinHandle<T>,
}

impl<T> ManagedThread<T> {
    /// Interrupt the thread
    pub fn interrupt(&self) {
        self.control.interrupt();
    }

    /// The thread's control state
    pub fn control(&self) -> &Arc<ThreadControl> {
        &self.control
    }

    /// Wait for the thread to finish
    pub fn join(self) -> thread::Result<T> {
        self.handle.join()
    }
}

impl Runtime {
    /// Start a managed thread running `body`
    pub fn spawn_thread<F, T>(&self, body: F) -> io::Result<ManagedThread<T>>
    where
        F: FnOnce(Runtime) -> T + Send + 'static,
        T: Send + 'static,
    {
        let control = ThreadControl::new();
        let installed = control.clone();
        let runtime = self.clone();
        let handle = thread::Builder::new()
            .name("cext-managed".to_string())
            .spawn(move || {
                ThreadControl::install(installed);
                body(runtime)
            })?;
        Ok(ManagedThread { control, handle })
    }
}
