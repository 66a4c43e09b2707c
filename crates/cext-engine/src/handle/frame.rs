//! Native call frames
//!
//! A frame is pushed by `pre` when a thread enters native code and popped
//! by `post` when it returns. Pins taken while a frame is on top belong to
//! it and are released when it pops. Frames nest strictly per thread.

use crate::error::CallError;
use crate::object::ObjRef;
use cext_sdk::Handle;

/// Identifies one `pre`/`post` pair
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FrameId(pub(crate) u64);

impl FrameId {
    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// State owned by one native call
#[derive(Debug)]
pub struct CallFrame {
    id: FrameId,
    pins: Vec<Handle>,
    checked_out: Vec<ObjRef>,
    pending: Option<CallError>,
}

impl CallFrame {
    pub(crate) fn new(id: FrameId) -> Self {
        Self {
            id,
            pins: Vec::new(),
            checked_out: Vec::new(),
            pending: None,
        }
    }

    /// Frame identity
    pub fn id(&self) -> FrameId {
        self.id
    }

    /// Handles pinned by this frame, in pin order
    pub fn pins(&self) -> &[Handle] {
        &self.pins
    }

    pub(crate) fn record_pin(&mut self, handle: Handle) {
        self.pins.push(handle);
    }

    pub(crate) fn take_pins(&mut self) -> Vec<Handle> {
        std::mem::take(&mut self.pins)
    }

    /// Remember that native code was handed this object's shadow pointer
    pub(crate) fn check_out(&mut self, obj: &ObjRef) {
        if !self.checked_out.iter().any(|o| o.id() == obj.id()) {
            self.checked_out.push(obj.clone());
        }
    }

    pub(crate) fn take_checked_out(&mut self) -> Vec<ObjRef> {
        std::mem::take(&mut self.checked_out)
    }

    /// Record an exception raised by native code; the first one wins
    pub(crate) fn raise(&mut self, error: CallError) {
        if self.pending.is_none() {
            self.pending = Some(error);
        }
    }

    pub(crate) fn take_pending(&mut self) -> Option<CallError> {
        self.pending.take()
    }

    /// Check whether native code raised during this frame
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}
