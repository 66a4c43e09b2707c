//! Reference queue
//!
//! Objects carry phantom registrations. When an object is collected every
//! registration posts its token here; nothing else is known about the
//! object at that point, only that it is gone.

use crate::gc::TrackId;
use cext_sdk::Handle;
use crossbeam::channel::{self, Receiver, Sender};

/// What a phantom registration stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhantomToken {
    /// The object owned this handle-table slot
    Handle(Handle),
    /// The object owned a tracked native resource
    Resource(TrackId),
}

/// Reference queue message
#[derive(Debug)]
pub enum Reclaim {
    /// An object was collected
    Collected(PhantomToken),
    /// Acknowledge once everything queued earlier has been processed
    Barrier(Sender<()>),
    /// Stop the reaper
    Shutdown,
}

/// Create an unbounded reference queue
pub fn reference_queue() -> (Sender<Reclaim>, Receiver<Reclaim>) {
    channel::unbounded()
}

/// A pending notification held by a live object
pub(crate) struct PhantomRef {
    queue: Sender<Reclaim>,
    token: PhantomToken,
}

impl PhantomRef {
    pub(crate) fn new(queue: Sender<Reclaim>, token: PhantomToken) -> Self {
        Self { queue, token }
    }

    /// Post the token; a closed queue means the runtime is gone
    pub(crate) fn enqueue(self) {
        let _ = self.queue.send(Reclaim::Collected(self.token));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_after_receiver_dropped_is_silent() {
        let (tx, rx) = reference_queue();
        drop(rx);
        PhantomRef::new(tx, PhantomToken::Handle(Handle::NIL)).enqueue();
    }

    #[test]
    fn test_queue_is_fifo() {
        let (tx, rx) = reference_queue();
        PhantomRef::new(tx.clone(), PhantomToken::Handle(Handle::object(1, 0))).enqueue();
        PhantomRef::new(tx, PhantomToken::Handle(Handle::object(2, 0))).enqueue();

        let first = rx.recv().unwrap();
        assert!(matches!(
            first,
            Reclaim::Collected(PhantomToken::Handle(h)) if h.slot_index() == Some(1)
        ));
    }
}
