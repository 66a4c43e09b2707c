//! Shadow buffers
//!
//! Native code expects to read and write string bytes and array elements
//! through a raw pointer. Managed strings and arrays keep their contents in
//! ordinary Rust collections, so the first time native code asks for a
//! pointer the object grows a shadow: a `calloc`ed mirror of its contents.
//!
//! While a shadow is attached it is the authoritative copy:
//!
//! - at the end of every native call frame, shadows whose pointer was handed
//!   out during the frame are flushed back into the managed object
//! - managed reads of a shadowed object flush first (under the GIL)
//! - managed writes update the object and then refresh the shadow
//!
//! Shadows are freed only by the cleaner, after their owner is collected.

use crate::error::{fatal, CallError};
use crate::gc::cleaner::TrackedResource;
use crate::object::{ObjRef, ObjectBody};
use crate::runtime::Runtime;
use crate::value::Value;
use cext_sdk::Handle;
use parking_lot::Mutex;
use std::ffi::c_void;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Element layout of a shadow
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ShadowKind {
    /// String bytes, kept NUL-terminated
    Bytes,
    /// Array elements as handles
    Handles,
}

impl ShadowKind {
    fn element_size(self) -> usize {
        match self {
            ShadowKind::Bytes => 1,
            ShadowKind::Handles => mem::size_of::<Handle>(),
        }
    }
}

struct NativeMemory {
    ptr: *mut u8,
    /// Elements in use
    len: usize,
    /// Elements allocated, not counting the terminator slot
    capacity: usize,
}

/// Native-memory mirror of a managed string or array
pub struct ShadowBuffer {
    kind: ShadowKind,
    mem: Mutex<NativeMemory>,
    /// Objects named by handles currently stored in the buffer
    anchors: Mutex<Vec<ObjRef>>,
    disposed: AtomicBool,
}

// The raw allocation is only touched under `mem`, or by native code holding the GIL.
unsafe impl Send for ShadowBuffer {}
unsafe impl Sync for ShadowBuffer {}

impl ShadowBuffer {
    /// Allocate zeroed memory for `capacity` elements plus a terminator
    pub fn new(kind: ShadowKind, capacity: usize) -> Self {
        match Self::try_new(kind, capacity) {
            Some(buffer) => buffer,
            None => fatal(format!("failed to allocate shadow of {} elements", capacity)),
        }
    }

    /// Like [`ShadowBuffer::new`], but `None` when the allocation fails
    pub fn try_new(kind: ShadowKind, capacity: usize) -> Option<Self> {
        let count = capacity.checked_add(1)?;
        let ptr = unsafe { libc::calloc(count, kind.element_size()) } as *mut u8;
        if ptr.is_null() {
            return None;
        }
        Some(Self {
            kind,
            mem: Mutex::new(NativeMemory {
                ptr,
                len: 0,
                capacity,
            }),
            anchors: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        })
    }

    /// Element layout
    pub fn kind(&self) -> ShadowKind {
        self.kind
    }

    /// Raw address native code reads and writes through; null once disposed
    pub fn address(&self) -> *mut c_void {
        self.mem.lock().ptr as *mut c_void
    }

    /// Elements in use
    pub fn len(&self) -> usize {
        self.mem.lock().len
    }

    /// Check if no elements are in use
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Elements that fit without reallocating
    pub fn capacity(&self) -> usize {
        self.mem.lock().capacity
    }

    /// Adopt a length chosen by native code; false if it exceeds capacity
    pub fn set_len(&self, len: usize) -> bool {
        let mut mem = self.mem.lock();
        if mem.ptr.is_null() || len > mem.capacity {
            return false;
        }
        mem.len = len;
        if self.kind == ShadowKind::Bytes {
            unsafe { *mem.ptr.add(len) = 0 };
        }
        true
    }

    fn ensure_capacity(&self, mem: &mut NativeMemory, wanted: usize) {
        if wanted <= mem.capacity {
            return;
        }
        let size = self.kind.element_size();
        let new_capacity = wanted.max(mem.capacity * 2);
        let ptr = unsafe { libc::realloc(mem.ptr as *mut c_void, (new_capacity + 1) * size) } as *mut u8;
        if ptr.is_null() {
            fatal(format!("failed to grow shadow to {} elements", new_capacity));
        }
        unsafe {
            ptr::write_bytes(
                ptr.add((mem.capacity + 1) * size),
                0,
                (new_capacity - mem.capacity) * size,
            );
        }
        mem.ptr = ptr;
        mem.capacity = new_capacity;
    }

    /// Replace the contents of a byte shadow
    pub fn write_bytes(&self, bytes: &[u8]) {
        debug_assert_eq!(self.kind, ShadowKind::Bytes);
        let mut mem = self.mem.lock();
        if mem.ptr.is_null() {
            return;
        }
        self.ensure_capacity(&mut mem, bytes.len());
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), mem.ptr, bytes.len());
            *mem.ptr.add(bytes.len()) = 0;
        }
        mem.len = bytes.len();
    }

    /// Copy out the bytes in use
    pub fn read_bytes(&self) -> Vec<u8> {
        debug_assert_eq!(self.kind, ShadowKind::Bytes);
        let mem = self.mem.lock();
        if mem.ptr.is_null() {
            return Vec::new();
        }
        unsafe { std::slice::from_raw_parts(mem.ptr, mem.len) }.to_vec()
    }

    /// Replace the contents of a handle shadow
    pub fn write_handles(&self, handles: &[Handle]) {
        debug_assert_eq!(self.kind, ShadowKind::Handles);
        let mut mem = self.mem.lock();
        if mem.ptr.is_null() {
            return;
        }
        self.ensure_capacity(&mut mem, handles.len());
        unsafe {
            ptr::copy_nonoverlapping(handles.as_ptr(), mem.ptr as *mut Handle, handles.len());
        }
        mem.len = handles.len();
    }

    /// Copy out the handles in use
    pub fn read_handles(&self) -> Vec<Handle> {
        debug_assert_eq!(self.kind, ShadowKind::Handles);
        let mem = self.mem.lock();
        if mem.ptr.is_null() {
            return Vec::new();
        }
        unsafe { std::slice::from_raw_parts(mem.ptr as *const Handle, mem.len) }.to_vec()
    }

    /// Keep the objects behind stored handles alive while they sit here
    pub(crate) fn anchor(&self, objects: Vec<ObjRef>) {
        *self.anchors.lock() = objects;
    }

    /// Free the native allocation; true only for the call that freed it
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let mut mem = self.mem.lock();
        unsafe { libc::free(mem.ptr as *mut c_void) };
        mem.ptr = ptr::null_mut();
        mem.len = 0;
        mem.capacity = 0;
        drop(mem);
        self.anchors.lock().clear();
        true
    }

    /// Check whether the allocation has been freed
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl Drop for ShadowBuffer {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for ShadowBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mem = self.mem.lock();
        f.debug_struct("ShadowBuffer")
            .field("kind", &self.kind)
            .field("len", &mem.len)
            .field("capacity", &mem.capacity)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Shadow statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShadowStats {
    /// Shadows allocated
    pub attached: u64,
    /// Shadow to object copies
    pub flushes: u64,
    /// Object to shadow copies
    pub refreshes: u64,
}

#[derive(Debug, Default)]
pub(crate) struct ShadowCounters {
    attached: AtomicU64,
    flushes: AtomicU64,
    refreshes: AtomicU64,
}

impl ShadowCounters {
    pub(crate) fn snapshot(&self) -> ShadowStats {
        ShadowStats {
            attached: self.attached.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
        }
    }
}

fn expected(obj: &ObjRef, what: &str) -> CallError {
    CallError::TypeError(format!(
        "wrong argument type {} (expected {})",
        obj.class_name(),
        what
    ))
}

/// Largest element count an array may grow to
pub const MAX_ARRAY_LEN: usize = isize::MAX as usize / mem::size_of::<Value>();

pub(crate) fn no_memory() -> CallError {
    CallError::raised(cext_sdk::ErrorKind::NoMemory, "failed to allocate memory")
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let index = if index < 0 { index + len as i64 } else { index };
    (index >= 0).then_some(index as usize)
}

impl Runtime {
    // ========================================================================
    // Attach, flush, refresh
    // ========================================================================

    /// Attach a shadow to a string or array, or return the one it has
    pub fn attach_shadow(&self, obj: &ObjRef) -> Result<Arc<ShadowBuffer>, CallError> {
        let _gil = self.gil().acquire();
        if let Some(existing) = obj.shadow() {
            return Ok(existing.clone());
        }

        let buffer = match obj.body() {
            ObjectBody::String(cell) => {
                let bytes = cell.write();
                let buffer = Arc::new(
                    ShadowBuffer::try_new(ShadowKind::Bytes, bytes.capacity().max(bytes.len()))
                        .ok_or_else(no_memory)?,
                );
                buffer.write_bytes(&bytes);
                let _ = obj.shadow_cell().set(buffer.clone());
                buffer
            }
            ObjectBody::Array(cell) => {
                let items = cell.write();
                let buffer = Arc::new(
                    ShadowBuffer::try_new(ShadowKind::Handles, items.capacity().max(items.len()))
                        .ok_or_else(no_memory)?,
                );
                self.encode_into(&buffer, &items);
                let _ = obj.shadow_cell().set(buffer.clone());
                buffer
            }
            _ => return Err(expected(obj, "String or Array")),
        };

        self.shared()
            .cleaner
            .track(self.gil(), obj, TrackedResource::Shadow(buffer.clone()));
        self.shared().shadows.attached.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(object = obj.id().as_u64(), kind = ?buffer.kind(), "attached shadow");
        Ok(buffer)
    }

    fn encode_into(&self, buffer: &ShadowBuffer, items: &[Value]) {
        let mut anchors = Vec::new();
        let handles: Vec<Handle> = self.with_handles(|table| {
            let frame = table.push_frame();
            let handles = items
                .iter()
                .map(|value| {
                    let handle = self.encode_value(table, value);
                    if let Ok(obj) = table.resolve(handle) {
                        anchors.push(obj);
                    }
                    handle
                })
                .collect();
            table.pop_frame(frame);
            handles
        });
        buffer.write_handles(&handles);
        buffer.anchor(anchors);
    }

    /// Copy a shadow's contents back into its object
    pub fn flush_shadow(&self, obj: &ObjRef) {
        let Some(buffer) = obj.shadow() else {
            return;
        };
        let _gil = self.gil().acquire();
        match obj.body() {
            ObjectBody::String(cell) => {
                *cell.write() = buffer.read_bytes();
            }
            ObjectBody::Array(cell) => {
                let handles = buffer.read_handles();
                let (values, anchors) = self.with_handles(|table| {
                    let mut anchors = Vec::new();
                    let values = handles
                        .iter()
                        .map(|&handle| {
                            if let Ok(obj) = table.resolve(handle) {
                                anchors.push(obj);
                            }
                            self.decode_value(table, handle).unwrap_or_else(|_| {
                                fatal(format!("array shadow holds invalid handle {:?}", handle))
                            })
                        })
                        .collect::<Vec<_>>();
                    (values, anchors)
                });
                buffer.anchor(anchors);
                *cell.write() = values;
            }
            _ => return,
        }
        self.shared().shadows.flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn refresh_shadow(&self, obj: &ObjRef) {
        let Some(buffer) = obj.shadow() else {
            return;
        };
        match obj.body() {
            ObjectBody::String(cell) => buffer.write_bytes(&cell.read()),
            ObjectBody::Array(cell) => {
                let items = cell.read().clone();
                self.encode_into(buffer, &items);
            }
            _ => return,
        }
        self.shared().shadows.refreshes.fetch_add(1, Ordering::Relaxed);
    }

    /// Shadow statistics
    pub fn shadow_stats(&self) -> ShadowStats {
        self.shared().shadows.snapshot()
    }

    // ========================================================================
    // Managed access to buffer objects
    // ========================================================================

    fn with_string<R>(
        &self,
        obj: &ObjRef,
        mutates: bool,
        f: impl FnOnce(&mut Vec<u8>) -> R,
    ) -> Result<R, CallError> {
        let cell = obj.string_cell().ok_or_else(|| expected(obj, "String"))?;
        {
            let mut bytes = cell.write();
            if obj.shadow().is_none() {
                return Ok(f(&mut bytes));
            }
        }
        let _gil = self.gil().acquire();
        self.flush_shadow(obj);
        let result = f(&mut cell.write());
        if mutates {
            self.refresh_shadow(obj);
        }
        Ok(result)
    }

    fn with_array<R>(
        &self,
        obj: &ObjRef,
        mutates: bool,
        f: impl FnOnce(&mut Vec<Value>) -> R,
    ) -> Result<R, CallError> {
        let cell = obj.array_cell().ok_or_else(|| expected(obj, "Array"))?;
        {
            let mut items = cell.write();
            if obj.shadow().is_none() {
                return Ok(f(&mut items));
            }
        }
        let _gil = self.gil().acquire();
        self.flush_shadow(obj);
        let result = f(&mut cell.write());
        if mutates {
            self.refresh_shadow(obj);
        }
        Ok(result)
    }

    /// Read a string's bytes
    pub fn string_bytes(&self, obj: &ObjRef) -> Result<Vec<u8>, CallError> {
        self.with_string(obj, false, |bytes| bytes.clone())
    }

    /// Replace a string's bytes
    pub fn string_set(&self, obj: &ObjRef, value: &[u8]) -> Result<(), CallError> {
        self.with_string(obj, true, |bytes| {
            bytes.clear();
            bytes.extend_from_slice(value);
        })
    }

    /// Append to a string
    pub fn string_push(&self, obj: &ObjRef, value: &[u8]) -> Result<(), CallError> {
        self.with_string(obj, true, |bytes| bytes.extend_from_slice(value))
    }

    /// Number of array elements
    pub fn array_len(&self, obj: &ObjRef) -> Result<usize, CallError> {
        self.with_array(obj, false, |items| items.len())
    }

    /// Element at `index` (negative counts from the end); nil when out of range
    pub fn array_entry(&self, obj: &ObjRef, index: i64) -> Result<Value, CallError> {
        self.with_array(obj, false, |items| {
            normalize_index(index, items.len())
                .and_then(|i| items.get(i).cloned())
                .unwrap_or_default()
        })
    }

    /// Store at `index`, padding with nil when storing past the end
    pub fn array_store(&self, obj: &ObjRef, index: i64, value: Value) -> Result<(), CallError> {
        self.with_array(obj, true, |items| {
            let Some(i) = normalize_index(index, items.len()) else {
                return Err(CallError::raised(
                    cext_sdk::ErrorKind::Index,
                    format!("index {} too small for array", index),
                ));
            };
            if i >= MAX_ARRAY_LEN {
                return Err(CallError::raised(
                    cext_sdk::ErrorKind::Index,
                    format!("index {} too big", index),
                ));
            }
            if i >= items.len() {
                items
                    .try_reserve(i + 1 - items.len())
                    .map_err(|_| no_memory())?;
                items.resize(i + 1, Value::Nil);
            }
            items[i] = value;
            Ok(())
        })?
    }

    /// Append to an array
    pub fn array_push(&self, obj: &ObjRef, value: Value) -> Result<(), CallError> {
        self.with_array(obj, true, |items| items.push(value))
    }

    /// Snapshot an array's elements
    pub fn array_values(&self, obj: &ObjRef) -> Result<Vec<Value>, CallError> {
        self.with_array(obj, false, |items| items.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_shadow_nul_terminated() {
        let buffer = ShadowBuffer::new(ShadowKind::Bytes, 4);
        buffer.write_bytes(b"hello world");
        assert_eq!(buffer.len(), 11);
        assert!(buffer.capacity() >= 11);
        let ptr = buffer.address() as *const u8;
        assert_eq!(unsafe { *ptr.add(11) }, 0);
        assert_eq!(buffer.read_bytes(), b"hello world");
    }

    #[test]
    fn test_set_len_bounds() {
        let buffer = ShadowBuffer::new(ShadowKind::Bytes, 8);
        buffer.write_bytes(b"abcdef");
        assert!(buffer.set_len(3));
        assert_eq!(buffer.read_bytes(), b"abc");
        assert!(!buffer.set_len(9));
    }

    #[test]
    fn test_grow_zeroes_new_elements() {
        let buffer = ShadowBuffer::new(ShadowKind::Handles, 1);
        buffer.write_handles(&[Handle::TRUE, Handle::NIL, Handle::TRUE]);
        assert!(buffer.capacity() >= 3);
        assert!(buffer.set_len(buffer.capacity()));
        let handles = buffer.read_handles();
        assert_eq!(&handles[..3], &[Handle::TRUE, Handle::NIL, Handle::TRUE]);
        assert!(handles[3..].iter().all(|&h| h == Handle::FALSE));
    }

    #[test]
    fn test_dispose_once() {
        let buffer = ShadowBuffer::new(ShadowKind::Bytes, 2);
        assert!(buffer.dispose());
        assert!(!buffer.dispose());
        assert!(buffer.address().is_null());
        buffer.write_bytes(b"ignored");
        assert!(buffer.read_bytes().is_empty());
    }

    #[test]
    fn test_normalize_index() {
        assert_eq!(normalize_index(-1, 3), Some(2));
        assert_eq!(normalize_index(-4, 3), None);
        assert_eq!(normalize_index(5, 3), Some(5));
    }
}
