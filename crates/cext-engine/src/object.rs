//! Managed object space
//!
//! This is the slice of the host object model the bridge depends on:
//! object identity, a class pointer, buffer-like bodies (strings and arrays)
//! that can grow a native shadow, class method tables, wrapped native data,
//! and a phantom-reference hook that reports collection to a reference
//! queue. Reachability is reference reachability: an object is collected
//! when its last `ObjRef` drops.

use crate::error::CallError;
use crate::ffi::NativeMethod;
use crate::gc::{PhantomRef, PhantomToken, Reclaim};
use crate::runtime::Runtime;
use crate::shadow::ShadowBuffer;
use crate::value::Value;
use crossbeam::channel::Sender;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::ffi::c_void;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Strong reference to a managed object
pub type ObjRef = Arc<RObject>;

/// Managed method body (stands in for interpreted code)
pub type ManagedMethod =
    Arc<dyn Fn(&Runtime, &Value, &[Value], Option<&Value>) -> Result<Value, CallError> + Send + Sync>;

/// Managed callable stored in a `Proc` object
pub type ManagedProc = Arc<dyn Fn(&Runtime, &[Value]) -> Result<Value, CallError> + Send + Sync>;

/// Unique identifier for a managed object
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ObjectId(u64);

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

impl ObjectId {
    fn next() -> Self {
        ObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Object payload
pub enum ObjectBody {
    /// Ordinary instance without a buffer
    Plain,
    /// Mutable byte string
    String(RwLock<Vec<u8>>),
    /// Mutable array of values
    Array(RwLock<Vec<Value>>),
    /// Class with a method table
    Class(RClass),
    /// Managed wrapper around a native pointer
    Data(RData),
    /// Managed callable
    Proc(ManagedProc),
    /// Integer or float that had to be boxed to cross the native boundary
    Boxed(Value),
}

/// A heap object
pub struct RObject {
    id: ObjectId,
    class: Option<ObjRef>,
    body: ObjectBody,
    shadow: OnceCell<Arc<ShadowBuffer>>,
    phantoms: Mutex<Vec<PhantomRef>>,
}

impl RObject {
    pub(crate) fn new(class: Option<ObjRef>, body: ObjectBody) -> ObjRef {
        Arc::new(RObject {
            id: ObjectId::next(),
            class,
            body,
            shadow: OnceCell::new(),
            phantoms: Mutex::new(Vec::new()),
        })
    }

    /// Object identity
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Class pointer (`None` for class objects themselves)
    pub fn class(&self) -> Option<&ObjRef> {
        self.class.as_ref()
    }

    /// Object payload
    pub fn body(&self) -> &ObjectBody {
        &self.body
    }

    /// Name of this object's class
    pub fn class_name(&self) -> String {
        if let ObjectBody::Class(_) = self.body {
            return "Class".to_string();
        }
        self.class
            .as_ref()
            .and_then(|c| c.as_class().map(|k| k.name().to_string()))
            .unwrap_or_else(|| "Object".to_string())
    }

    /// Class payload, if this object is a class
    pub fn as_class(&self) -> Option<&RClass> {
        match &self.body {
            ObjectBody::Class(class) => Some(class),
            _ => None,
        }
    }

    /// Check for a string body
    pub fn is_string(&self) -> bool {
        matches!(self.body, ObjectBody::String(_))
    }

    /// Check for an array body
    pub fn is_array(&self) -> bool {
        matches!(self.body, ObjectBody::Array(_))
    }

    /// Wrapped native pointer, if this is a data object
    pub fn data_ptr(&self) -> Option<*mut c_void> {
        match &self.body {
            ObjectBody::Data(data) => Some(data.ptr),
            _ => None,
        }
    }

    /// Attached native shadow, if any
    pub fn shadow(&self) -> Option<&Arc<ShadowBuffer>> {
        self.shadow.get()
    }

    pub(crate) fn shadow_cell(&self) -> &OnceCell<Arc<ShadowBuffer>> {
        &self.shadow
    }

    pub(crate) fn string_cell(&self) -> Option<&RwLock<Vec<u8>>> {
        match &self.body {
            ObjectBody::String(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub(crate) fn array_cell(&self) -> Option<&RwLock<Vec<Value>>> {
        match &self.body {
            ObjectBody::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Ask to be notified on `queue` when this object is collected
    pub(crate) fn register_phantom(&self, queue: &Sender<Reclaim>, token: PhantomToken) {
        self.phantoms.lock().push(PhantomRef::new(queue.clone(), token));
    }
}

impl Drop for RObject {
    fn drop(&mut self) {
        for phantom in self.phantoms.get_mut().drain(..) {
            phantom.enqueue();
        }
    }
}

impl fmt::Debug for RObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RObject")
            .field("id", &self.id.0)
            .field("class", &self.class_name())
            .field("shadowed", &self.shadow.get().is_some())
            .finish()
    }
}

/// A method table entry
#[derive(Clone)]
pub enum Method {
    /// Native function bound through an adapter
    Native(Arc<NativeMethod>),
    /// Managed method
    Managed(ManagedMethod),
}

/// Class payload
pub struct RClass {
    name: String,
    superclass: Option<ObjRef>,
    module: bool,
    methods: RwLock<FxHashMap<String, Method>>,
}

impl RClass {
    pub(crate) fn new(name: impl Into<String>, superclass: Option<ObjRef>) -> Self {
        Self {
            name: name.into(),
            superclass,
            module: false,
            methods: RwLock::new(FxHashMap::default()),
        }
    }

    pub(crate) fn module(name: impl Into<String>) -> Self {
        Self {
            module: true,
            ..Self::new(name, None)
        }
    }

    /// Class name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check whether this is a module rather than a class
    pub fn is_module(&self) -> bool {
        self.module
    }

    /// Superclass object
    pub fn superclass(&self) -> Option<&ObjRef> {
        self.superclass.as_ref()
    }

    /// Define or replace a method on this class
    pub(crate) fn define(&self, name: impl Into<String>, method: Method) {
        self.methods.write().insert(name.into(), method);
    }

    /// Method defined directly on this class
    pub fn own_method(&self, name: &str) -> Option<Method> {
        self.methods.read().get(name).cloned()
    }

    /// Look `name` up along the superclass chain
    pub fn find_method(&self, name: &str) -> Option<Method> {
        if let Some(method) = self.own_method(name) {
            return Some(method);
        }
        let mut next = self.superclass.clone();
        while let Some(class_obj) = next {
            let class = class_obj.as_class()?;
            if let Some(method) = class.own_method(name) {
                return Some(method);
            }
            next = class.superclass.clone();
        }
        None
    }
}

/// Native pointer owned by a managed wrapper
pub struct RData {
    ptr: *mut c_void,
}

impl RData {
    pub(crate) fn new(ptr: *mut c_void) -> Self {
        Self { ptr }
    }
}

// The pointer is only dereferenced by native code under the GIL.
unsafe impl Send for RData {}
unsafe impl Sync for RData {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::reference_queue;

    fn class(name: &str, superclass: Option<ObjRef>) -> ObjRef {
        RObject::new(None, ObjectBody::Class(RClass::new(name, superclass)))
    }

    #[test]
    fn test_object_ids_unique() {
        let a = RObject::new(None, ObjectBody::Plain);
        let b = RObject::new(None, ObjectBody::Plain);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_class_name() {
        let string = class("String", None);
        let s = RObject::new(Some(string.clone()), ObjectBody::String(RwLock::new(b"hi".to_vec())));
        assert_eq!(s.class_name(), "String");
        assert_eq!(string.class_name(), "Class");
        assert!(s.is_string());
        assert!(!s.is_array());
    }

    #[test]
    fn test_method_lookup_walks_superclasses() {
        let base = class("Base", None);
        let derived = class("Derived", Some(base.clone()));
        let method: ManagedMethod = Arc::new(|_, _, _, _| Ok(Value::Integer(1)));
        base.as_class().unwrap().define("answer", Method::Managed(method));

        let derived_class = derived.as_class().unwrap();
        assert!(derived_class.own_method("answer").is_none());
        assert!(derived_class.find_method("answer").is_some());
        assert!(derived_class.find_method("missing").is_none());
        assert_eq!(derived_class.superclass().unwrap().id(), base.id());
    }

    #[test]
    fn test_drop_enqueues_phantoms() {
        let (tx, rx) = reference_queue();
        let obj = RObject::new(None, ObjectBody::Plain);
        obj.register_phantom(&tx, PhantomToken::Handle(cext_sdk::Handle::object(4, 0)));
        assert!(rx.try_recv().is_err());

        drop(obj);
        match rx.try_recv() {
            Ok(Reclaim::Collected(PhantomToken::Handle(h))) => {
                assert_eq!(h.slot_index(), Some(4));
            }
            _ => panic!("expected a collected handle token"),
        }
    }
}
