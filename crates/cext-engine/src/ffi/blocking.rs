//! Blocking task runner
//!
//! Lets native code run a blocking call (I/O, sleeps, waits on external
//! events) without holding the GIL. The thread gives up every level it
//! holds, runs the call on its own OS thread, then takes back exactly the
//! depth it had.

use crate::error::CallError;
use crate::sync::Gil;
use crate::thread::ThreadControl;
use cext_sdk::{BlockingFn, UnblockFn};
use std::ffi::c_void;

/// A native blocking call with an optional wakeup
pub struct BlockingTaskRunner {
    run: BlockingFn,
    data: *mut c_void,
    unblock: Option<UnblockFn>,
    unblock_data: *mut c_void,
}

impl BlockingTaskRunner {
    /// A call that cannot be woken early; interrupts wait for it to return
    pub fn new(run: BlockingFn, data: *mut c_void) -> Self {
        Self {
            run,
            data,
            unblock: None,
            unblock_data: std::ptr::null_mut(),
        }
    }

    /// Add a wakeup callback invoked if the thread is interrupted while blocked
    pub fn with_unblock(mut self, unblock: Option<UnblockFn>, data: *mut c_void) -> Self {
        self.unblock = unblock;
        self.unblock_data = data;
        self
    }

    /// Release the GIL, run the call, restore the GIL
    ///
    /// Returns `Err(Interrupted)` without running anything if an interrupt is
    /// already pending. The interrupt itself stays pending and is delivered
    /// at the end of the enclosing native call.
    ///
    /// # Safety
    ///
    /// `run` and `unblock` must be safe to call with their data pointers, and
    /// `run` must not touch managed state: it executes without the GIL.
    pub unsafe fn execute(&self, gil: &Gil) -> Result<*mut c_void, CallError> {
        let control = ThreadControl::current();
        let registration = control.register_unblock(self.unblock, self.unblock_data);
        if control.is_interrupted() {
            return Err(CallError::Interrupted);
        }

        let _inhibit = control.inhibit_safepoints();
        let released = gil.release_for_blocking();
        tracing::debug!(depth = released.saved_depth(), "entering blocking region");

        let result = (self.run)(self.data);

        drop(registration);
        drop(released);
        tracing::debug!(depth = gil.depth(), "left blocking region");
        Ok(result)
    }
}
