//! Native call scopes
//!
//! A [`NativeScope`] is the `pre`/`post` pair around every entry into native
//! code. Entering takes the GIL and opens a call frame; dropping flushes the
//! shadows handed out during the frame, pops it (releasing its pins) and
//! releases the GIL. Dropping runs on every exit path, unwinding included.
//!
//! The scope also publishes its runtime to the exported C API, which has no
//! other way to find it.

use crate::error::{fatal, CallError, HandleError};
use crate::handle::FrameId;
use crate::runtime::Runtime;
use crate::thread::ThreadControl;
use crate::value::Value;
use cext_sdk::Handle;
use std::cell::RefCell;
use std::marker::PhantomData;

thread_local! {
    static ACTIVE: RefCell<Vec<Runtime>> = const { RefCell::new(Vec::new()) };
}

/// Run `f` against the runtime of the innermost native scope on this thread
///
/// Native code calling into the bridge outside any native call is a
/// contract violation.
pub(crate) fn with_active<R>(f: impl FnOnce(&Runtime) -> R) -> R {
    let runtime = ACTIVE
        .with(|active| active.borrow().last().cloned())
        .unwrap_or_else(|| fatal("C API called outside a native call"));
    f(&runtime)
}

/// One open native call frame
///
/// Not `Send`: the frame and the GIL level belong to the entering thread.
pub struct NativeScope<'rt> {
    runtime: &'rt Runtime,
    frame: FrameId,
    _not_send: PhantomData<*const ()>,
}

impl<'rt> NativeScope<'rt> {
    /// `pre`: take the GIL and open a frame
    pub fn enter(runtime: &'rt Runtime) -> Self {
        runtime.poll_safepoint();
        runtime.gil().lock();
        let frame = runtime.with_handles(|table| table.push_frame());
        ACTIVE.with(|active| active.borrow_mut().push(runtime.clone()));
        Self {
            runtime,
            frame,
            _not_send: PhantomData,
        }
    }

    /// Owning runtime
    pub fn runtime(&self) -> &'rt Runtime {
        self.runtime
    }

    /// This scope's frame
    pub fn frame(&self) -> FrameId {
        self.frame
    }

    /// Convert a managed value to a handle pinned by this frame
    pub fn to_handle(&self, value: &Value) -> Handle {
        self.runtime
            .with_handles(|table| self.runtime.encode_value(table, value))
    }

    /// Convert a handle back to a managed value
    pub fn from_handle(&self, handle: Handle) -> Result<Value, HandleError> {
        self.runtime
            .with_handles(|table| self.runtime.decode_value(table, handle))
    }

    /// Exception raised by native code during this frame, if any
    pub fn take_pending(&self) -> Option<CallError> {
        self.runtime.with_handles(|table| {
            table
                .current_frame_mut()
                .and_then(|frame| frame.take_pending())
        })
    }

    /// Finish the call: surface a native raise or a pending interrupt,
    /// otherwise convert the returned handle
    pub fn complete(self, returned: Handle) -> Result<Value, CallError> {
        if let Some(error) = self.take_pending() {
            return Err(error);
        }
        ThreadControl::current().check_interrupts()?;
        match self.from_handle(returned) {
            Ok(value) => Ok(value),
            Err(err) => fatal(format!("native method returned {}", err)),
        }
    }
}

impl Drop for NativeScope<'_> {
    fn drop(&mut self) {
        let checked_out = self.runtime.with_handles(|table| {
            table
                .current_frame_mut()
                .map(|frame| frame.take_checked_out())
                .unwrap_or_default()
        });
        for obj in &checked_out {
            self.runtime.flush_shadow(obj);
        }

        let frame = self
            .runtime
            .with_handles(|table| table.pop_frame(self.frame));
        ACTIVE.with(|active| active.borrow_mut().pop());
        self.runtime.gil().unlock();

        drop(frame);
        drop(checked_out);
    }
}
