//! Slot table mapping handles to managed objects
//!
//! Every slot carries a generation. Reclaiming a slot bumps it, so a handle
//! that outlived its object decodes to the right index but the wrong
//! generation and is rejected instead of aliasing whatever moved in.
//!
//! All access goes through the runtime's `GilCell`; nothing here locks.

use super::frame::{CallFrame, FrameId};
use super::roots::RootSet;
use crate::error::{fatal, HandleError};
use crate::gc::{PhantomToken, Reclaim};
use crate::object::{ObjRef, ObjectId, RObject};
use cext_sdk::Handle;
use crossbeam::channel::Sender;
use rustc_hash::FxHashMap;
use std::sync::Weak;
use std::thread::{self, ThreadId};

struct SlotEntry {
    id: ObjectId,
    object: Weak<RObject>,
    /// Present while `pins > 0`
    strong: Option<ObjRef>,
    pins: u32,
}

struct Slot {
    generation: u32,
    entry: Option<SlotEntry>,
}

/// Handle table statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleStats {
    /// Slots currently naming an object
    pub live: usize,
    /// Slots ever allocated
    pub capacity: usize,
    /// Slots waiting on the free list
    pub free: usize,
    /// Handles issued for objects that had none
    pub issued: u64,
    /// Issues that recycled a freed slot
    pub reused: u64,
    /// Slots returned after their object was collected
    pub reclaimed: u64,
}

/// Handle table
pub struct HandleTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_object: FxHashMap<ObjectId, Handle>,
    frames: FxHashMap<ThreadId, Vec<CallFrame>>,
    roots: RootSet,
    queue: Sender<Reclaim>,
    reuse: bool,
    next_frame: u64,
    issued: u64,
    reused: u64,
    reclaimed: u64,
}

impl HandleTable {
    /// Create a table posting collection notices to `queue`
    pub fn new(queue: Sender<Reclaim>, capacity: usize, reuse: bool) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            by_object: FxHashMap::default(),
            frames: FxHashMap::default(),
            roots: RootSet::new(),
            queue,
            reuse,
            next_frame: 1,
            issued: 0,
            reused: 0,
            reclaimed: 0,
        }
    }

    // ========================================================================
    // Issue and resolve
    // ========================================================================

    /// Get the handle for `obj`, issuing one if needed, and pin it in the
    /// current thread's innermost frame
    pub fn handle_for(&mut self, obj: &ObjRef) -> Handle {
        let tid = thread::current().id();
        if self.frames.get(&tid).map_or(true, |f| f.is_empty()) {
            fatal("handle requested outside a native call frame");
        }

        let handle = match self.existing_handle(obj) {
            Some(handle) => handle,
            None => self.issue(obj),
        };
        self.pin_slot(handle, obj);

        if let Some(frame) = self.frames.get_mut(&tid).and_then(|f| f.last_mut()) {
            frame.record_pin(handle);
        }
        handle
    }

    fn existing_handle(&self, obj: &ObjRef) -> Option<Handle> {
        let handle = *self.by_object.get(&obj.id())?;
        let entry = self.entry(handle)?;
        (entry.id == obj.id()).then_some(handle)
    }

    fn issue(&mut self, obj: &ObjRef) -> Handle {
        let index = match self.free.pop() {
            Some(index) => {
                self.reused += 1;
                index
            }
            None => {
                let index = self.slots.len() as u32;
                if index > cext_sdk::MAX_SLOT_INDEX {
                    fatal("handle table exhausted");
                }
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                index
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.entry = Some(SlotEntry {
            id: obj.id(),
            object: std::sync::Arc::downgrade(obj),
            strong: None,
            pins: 0,
        });
        let handle = Handle::object(index, slot.generation);

        obj.register_phantom(&self.queue, PhantomToken::Handle(handle));
        self.by_object.insert(obj.id(), handle);
        self.issued += 1;
        tracing::trace!(?handle, object = obj.id().as_u64(), "issued handle");
        handle
    }

    /// Resolve a handle to its live object
    pub fn resolve(&self, handle: Handle) -> Result<ObjRef, HandleError> {
        self.entry(handle)
            .and_then(|entry| entry.object.upgrade())
            .ok_or(HandleError::InvalidHandle(handle))
    }

    fn slot_index(&self, handle: Handle) -> Option<usize> {
        let index = handle.slot_index()? as usize;
        let slot = self.slots.get(index)?;
        (Some(slot.generation) == handle.generation()).then_some(index)
    }

    fn entry(&self, handle: Handle) -> Option<&SlotEntry> {
        let index = self.slot_index(handle)?;
        self.slots[index].entry.as_ref()
    }

    fn entry_mut(&mut self, handle: Handle) -> Option<&mut SlotEntry> {
        let index = self.slot_index(handle)?;
        self.slots[index].entry.as_mut()
    }

    // ========================================================================
    // Pinning
    // ========================================================================

    fn pin_slot(&mut self, handle: Handle, obj: &ObjRef) {
        let Some(entry) = self.entry_mut(handle) else {
            fatal(format!("pinning unknown handle {:?}", handle));
        };
        entry.pins += 1;
        if entry.strong.is_none() {
            entry.strong = Some(obj.clone());
        }
    }

    /// Drop one pin; the object becomes collectable when none remain
    pub fn release(&mut self, handle: Handle) {
        let Some(entry) = self.entry_mut(handle) else {
            fatal(format!("releasing unknown handle {:?}", handle));
        };
        if entry.pins == 0 {
            fatal(format!("pin count underflow on {:?}", handle));
        }
        entry.pins -= 1;
        if entry.pins == 0 {
            entry.strong = None;
        }
    }

    /// Current pin count for `handle`
    pub fn pins(&self, handle: Handle) -> Option<u32> {
        self.entry(handle).map(|entry| entry.pins)
    }

    /// Pin `handle` until [`HandleTable::unpin_global`]
    pub fn pin_global(&mut self, handle: Handle) -> Result<(), HandleError> {
        let obj = self.resolve(handle)?;
        self.pin_slot(handle, &obj);
        self.roots.add(handle);
        Ok(())
    }

    /// Undo one [`HandleTable::pin_global`]; false if none was registered
    pub fn unpin_global(&mut self, handle: Handle) -> bool {
        if !self.roots.remove(handle) {
            return false;
        }
        self.release(handle);
        true
    }

    /// Globally pinned handles
    pub fn roots(&self) -> &RootSet {
        &self.roots
    }

    // ========================================================================
    // Call frames
    // ========================================================================

    /// Open a frame on the current thread
    pub fn push_frame(&mut self) -> FrameId {
        let id = FrameId(self.next_frame);
        self.next_frame += 1;
        self.frames
            .entry(thread::current().id())
            .or_default()
            .push(CallFrame::new(id));
        id
    }

    /// Close the current thread's innermost frame, releasing its pins
    ///
    /// Frames must close in reverse order of opening.
    pub fn pop_frame(&mut self, id: FrameId) -> CallFrame {
        let tid = thread::current().id();
        let Some(stack) = self.frames.get_mut(&tid) else {
            fatal("native frame popped on a thread with no frames");
        };
        match stack.last() {
            Some(top) if top.id() == id => {}
            Some(top) => fatal(format!(
                "native frames closed out of order: expected {:?}, got {:?}",
                top.id(),
                id
            )),
            None => fatal("native frame popped on a thread with no frames"),
        }

        let mut frame = stack.pop().unwrap_or_else(|| fatal("frame stack emptied"));
        if stack.is_empty() {
            self.frames.remove(&tid);
        }
        for handle in frame.take_pins() {
            self.release(handle);
        }
        frame
    }

    /// Innermost frame on the current thread
    pub fn current_frame_mut(&mut self) -> Option<&mut CallFrame> {
        self.frames
            .get_mut(&thread::current().id())
            .and_then(|stack| stack.last_mut())
    }

    /// Number of open frames on the current thread
    pub fn frame_depth(&self) -> usize {
        self.frames
            .get(&thread::current().id())
            .map_or(0, |stack| stack.len())
    }

    // ========================================================================
    // Reclamation
    // ========================================================================

    /// Return the slot named by `handle` if its object has been collected
    ///
    /// A stale token (slot already reclaimed by a sweep) is ignored.
    pub fn reclaim(&mut self, handle: Handle) -> bool {
        let Some(index) = self.slot_index(handle) else {
            return false;
        };
        self.reclaim_slot(index)
    }

    fn reclaim_slot(&mut self, index: usize) -> bool {
        let slot = &mut self.slots[index];
        let collected = match &slot.entry {
            Some(entry) => entry.pins == 0 && entry.object.strong_count() == 0,
            None => false,
        };
        if !collected {
            return false;
        }

        let handle = Handle::object(index as u32, slot.generation);
        if let Some(entry) = slot.entry.take() {
            if self.by_object.get(&entry.id) == Some(&handle) {
                self.by_object.remove(&entry.id);
            }
        }
        slot.generation = Handle::next_generation(slot.generation);
        if self.reuse {
            self.free.push(index as u32);
        }
        self.reclaimed += 1;
        tracing::trace!(?handle, "reclaimed handle slot");
        true
    }

    /// Reclaim every slot whose object is already gone
    pub fn sweep(&mut self) -> usize {
        (0..self.slots.len())
            .filter(|&index| self.reclaim_slot(index))
            .count()
    }

    /// Snapshot statistics
    pub fn stats(&self) -> HandleStats {
        HandleStats {
            live: self.slots.iter().filter(|s| s.entry.is_some()).count(),
            capacity: self.slots.len(),
            free: self.free.len(),
            issued: self.issued,
            reused: self.reused,
            reclaimed: self.reclaimed,
        }
    }
}
