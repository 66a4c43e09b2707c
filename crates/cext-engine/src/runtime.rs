//! Bridge runtime
//!
//! All process-scoped state of the bridge (GIL, handle table, cleaner,
//! loaded-extension set, class table) lives in one [`Runtime`]. It is
//! created explicitly and passed around; two runtimes in one process are
//! fully isolated from each other.

use crate::error::{CallError, HandleError, RegistrationError};
use crate::ffi::{ModuleLoader, NativeMethod, NativeScope};
use crate::gc::cleaner::TrackedResource;
use crate::gc::{reference_queue, Cleaner, CleanerStats, Reclaim};
use crate::handle::{HandleStats, HandleTable};
use crate::object::{ManagedMethod, ManagedProc, Method, ObjRef, ObjectBody, RClass, RData, RObject};
use crate::options::BridgeOptions;
use crate::shadow::{no_memory, ShadowCounters, MAX_ARRAY_LEN};
use crate::sync::{Gil, GilCell, GilStats};
use crate::thread::ThreadControl;
use crate::value::Value;
use cext_sdk::{DataFreeFn, ErrorKind, Handle};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::ffi::c_void;
use std::io;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Built-in classes
pub struct CoreClasses {
    /// Root of the hierarchy; also the context handed to `Init_` functions
    pub object: ObjRef,
    /// Class of class objects
    pub class: ObjRef,
    /// Modules (classes without a superclass)
    pub module: ObjRef,
    /// Strings
    pub string: ObjRef,
    /// Arrays
    pub array: ObjRef,
    /// Integers
    pub integer: ObjRef,
    /// Floats
    pub float: ObjRef,
    /// `nil`
    pub nil: ObjRef,
    /// `true`
    pub true_class: ObjRef,
    /// `false`
    pub false_class: ObjRef,
    /// Managed callables
    pub proc: ObjRef,
    /// Wrapped native data
    pub data: ObjRef,
}

fn new_class(name: &str, superclass: Option<&ObjRef>) -> ObjRef {
    RObject::new(None, ObjectBody::Class(RClass::new(name, superclass.cloned())))
}

impl CoreClasses {
    fn bootstrap() -> Self {
        let object = new_class("Object", None);
        let sub = |name: &str| new_class(name, Some(&object));
        Self {
            class: sub("Class"),
            module: sub("Module"),
            string: sub("String"),
            array: sub("Array"),
            integer: sub("Integer"),
            float: sub("Float"),
            nil: sub("NilClass"),
            true_class: sub("TrueClass"),
            false_class: sub("FalseClass"),
            proc: sub("Proc"),
            data: sub("Data"),
            object,
        }
    }

    fn all(&self) -> [&ObjRef; 12] {
        [
            &self.object,
            &self.class,
            &self.module,
            &self.string,
            &self.array,
            &self.integer,
            &self.float,
            &self.nil,
            &self.true_class,
            &self.false_class,
            &self.proc,
            &self.data,
        ]
    }
}

pub(crate) struct Shared {
    pub(crate) options: BridgeOptions,
    pub(crate) gil: Gil,
    pub(crate) handles: GilCell<HandleTable>,
    pub(crate) cleaner: Cleaner,
    pub(crate) loader: ModuleLoader,
    pub(crate) classes: CoreClasses,
    pub(crate) constants: RwLock<FxHashMap<String, ObjRef>>,
    pub(crate) shadows: ShadowCounters,
    pub(crate) sweep_requested: AtomicBool,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.cleaner.dispose_all(&self.gil);
        let _ = self.cleaner.queue().send(Reclaim::Shutdown);
    }
}

/// Handle to a bridge runtime; clones share state
#[derive(Clone)]
pub struct Runtime {
    shared: Arc<Shared>,
}

impl Runtime {
    /// Start a runtime and its cleaner thread
    pub fn new(options: BridgeOptions) -> io::Result<Self> {
        let (queue, receiver) = reference_queue();
        let classes = CoreClasses::bootstrap();
        let constants = classes
            .all()
            .iter()
            .filter_map(|class| {
                let name = class.as_class()?.name().to_string();
                Some((name, (*class).clone()))
            })
            .collect();

        let shared = Arc::new(Shared {
            gil: Gil::new(),
            handles: GilCell::new(HandleTable::new(
                queue.clone(),
                options.initial_handle_capacity,
                options.reuse_handles,
            )),
            cleaner: Cleaner::new(queue, receiver),
            loader: ModuleLoader::new(options.extension_paths.clone()),
            classes,
            constants: RwLock::new(constants),
            shadows: ShadowCounters::default(),
            sweep_requested: AtomicBool::new(false),
            options,
        });
        shared
            .cleaner
            .start(Arc::downgrade(&shared), &shared.options.cleaner_thread_name)?;

        Ok(Runtime { shared })
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    /// The global lock
    pub fn gil(&self) -> &Gil {
        &self.shared.gil
    }

    /// Options the runtime was started with
    pub fn options(&self) -> &BridgeOptions {
        &self.shared.options
    }

    /// Built-in classes
    pub fn classes(&self) -> &CoreClasses {
        &self.shared.classes
    }

    /// Borrow the handle table; the GIL must be held
    pub(crate) fn with_handles<R>(&self, f: impl FnOnce(&mut HandleTable) -> R) -> R {
        let mut table = self.shared.handles.borrow_mut(&self.shared.gil);
        f(&mut table)
    }

    /// `pre`: open a native call scope on this thread
    pub fn enter_native(&self) -> NativeScope<'_> {
        NativeScope::enter(self)
    }

    // ========================================================================
    // Value <-> handle
    // ========================================================================

    pub(crate) fn encode_value(&self, table: &mut HandleTable, value: &Value) -> Handle {
        match value {
            Value::Nil => Handle::NIL,
            Value::Bool(b) => Handle::from_bool(*b),
            Value::Integer(n) => match Handle::fixnum(*n) {
                Some(handle) => handle,
                None => self.boxed_handle(table, &self.classes().integer, value),
            },
            Value::Float(_) => self.boxed_handle(table, &self.classes().float, value),
            Value::Object(obj) => table.handle_for(obj),
        }
    }

    fn boxed_handle(&self, table: &mut HandleTable, class: &ObjRef, value: &Value) -> Handle {
        let boxed = RObject::new(Some(class.clone()), ObjectBody::Boxed(value.clone()));
        table.handle_for(&boxed)
    }

    pub(crate) fn decode_value(&self, table: &HandleTable, handle: Handle) -> Result<Value, HandleError> {
        if let Some(n) = handle.as_fixnum() {
            return Ok(Value::Integer(n));
        }
        if handle == Handle::FALSE {
            return Ok(Value::Bool(false));
        }
        if handle == Handle::TRUE {
            return Ok(Value::Bool(true));
        }
        if handle == Handle::NIL || handle == Handle::UNDEF {
            return Ok(Value::Nil);
        }
        let obj = table.resolve(handle)?;
        match obj.body() {
            ObjectBody::Boxed(value) => Ok(value.clone()),
            _ => Ok(Value::Object(obj)),
        }
    }

    /// Look up what a handle refers to
    pub fn resolve(&self, handle: Handle) -> Result<Value, HandleError> {
        let _gil = self.gil().acquire();
        self.with_handles(|table| self.decode_value(table, handle))
    }

    // ========================================================================
    // Object creation
    // ========================================================================

    /// New string
    pub fn str_new(&self, bytes: &[u8]) -> ObjRef {
        RObject::new(
            Some(self.classes().string.clone()),
            ObjectBody::String(RwLock::new(bytes.to_vec())),
        )
    }

    /// New empty string with room for `capacity` bytes
    ///
    /// Fails with `NoMemoryError` instead of aborting when the buffer
    /// cannot be allocated.
    pub fn str_with_capacity(&self, capacity: usize) -> Result<ObjRef, CallError> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(capacity).map_err(|_| no_memory())?;
        Ok(RObject::new(
            Some(self.classes().string.clone()),
            ObjectBody::String(RwLock::new(bytes)),
        ))
    }

    /// New array
    pub fn array_new(&self, items: Vec<Value>) -> ObjRef {
        RObject::new(
            Some(self.classes().array.clone()),
            ObjectBody::Array(RwLock::new(items)),
        )
    }

    /// New empty array with room for `capacity` elements
    pub fn array_with_capacity(&self, capacity: usize) -> Result<ObjRef, CallError> {
        if capacity > MAX_ARRAY_LEN {
            return Err(CallError::raised(ErrorKind::Argument, "array size too big"));
        }
        let mut items = Vec::new();
        items.try_reserve_exact(capacity).map_err(|_| no_memory())?;
        Ok(self.array_new(items))
    }

    /// New plain instance of `class`
    pub fn object_new(&self, class: &ObjRef) -> Result<ObjRef, CallError> {
        if class.as_class().is_none() {
            return Err(CallError::TypeError(format!("{} is not a class", class.class_name())));
        }
        Ok(RObject::new(Some(class.clone()), ObjectBody::Plain))
    }

    /// New managed callable
    pub fn proc_new(&self, body: ManagedProc) -> ObjRef {
        RObject::new(Some(self.classes().proc.clone()), ObjectBody::Proc(body))
    }

    /// Wrap a native pointer; `free` runs once the wrapper is collected
    pub fn data_wrap(
        &self,
        class: &ObjRef,
        ptr: *mut c_void,
        free: Option<DataFreeFn>,
    ) -> Result<ObjRef, CallError> {
        if class.as_class().is_none() {
            return Err(CallError::TypeError(format!("{} is not a class", class.class_name())));
        }
        let obj = RObject::new(Some(class.clone()), ObjectBody::Data(RData::new(ptr)));
        let _gil = self.gil().acquire();
        self.shared
            .cleaner
            .track(self.gil(), &obj, TrackedResource::Data { ptr, free });
        Ok(obj)
    }

    // ========================================================================
    // Classes and methods
    // ========================================================================

    /// Define (or reopen) a class
    pub fn define_class(&self, name: &str, superclass: Option<&ObjRef>) -> Result<ObjRef, CallError> {
        if let Some(existing) = self.lookup_class(name) {
            return Ok(existing);
        }
        let superclass = superclass.unwrap_or(&self.classes().object);
        if superclass.as_class().is_none() {
            return Err(CallError::TypeError(format!(
                "superclass must be a Class ({} given)",
                superclass.class_name()
            )));
        }
        let class = new_class(name, Some(superclass));
        self.shared
            .constants
            .write()
            .entry(name.to_string())
            .or_insert(class.clone());
        Ok(self.lookup_class(name).unwrap_or(class))
    }

    /// Define (or reopen) a module: a method container without a superclass
    pub fn define_module(&self, name: &str) -> ObjRef {
        self.shared
            .constants
            .write()
            .entry(name.to_string())
            .or_insert_with(|| RObject::new(None, ObjectBody::Class(RClass::module(name))))
            .clone()
    }

    /// Find a class or module by name
    pub fn lookup_class(&self, name: &str) -> Option<ObjRef> {
        self.shared.constants.read().get(name).cloned()
    }

    /// Class of any value
    pub fn class_of(&self, value: &Value) -> ObjRef {
        let classes = self.classes();
        match value {
            Value::Nil => classes.nil.clone(),
            Value::Bool(true) => classes.true_class.clone(),
            Value::Bool(false) => classes.false_class.clone(),
            Value::Integer(_) => classes.integer.clone(),
            Value::Float(_) => classes.float.clone(),
            Value::Object(obj) => match obj.class() {
                Some(class) => class.clone(),
                None if obj.as_class().is_some_and(|c| c.is_module()) => {
                    classes.module.clone()
                }
                None => classes.class.clone(),
            },
        }
    }

    /// Bind a native function as a method of `class`
    pub fn define_native_method(
        &self,
        class: &ObjRef,
        name: &str,
        address: *const c_void,
        arity: c_int,
        takes_block: bool,
    ) -> Result<(), RegistrationError> {
        let Some(target) = class.as_class() else {
            return Err(RegistrationError::NotAClass {
                name: name.to_string(),
                target: class.class_name(),
            });
        };
        let method = NativeMethod::new(name, target.name(), address, arity, takes_block)?;
        tracing::trace!(class = target.name(), method = name, arity, "defined native method");
        target.define(name, Method::Native(Arc::new(method)));
        Ok(())
    }

    /// Bind a Rust closure as a managed method of `class`
    pub fn define_managed_method(
        &self,
        class: &ObjRef,
        name: &str,
        body: ManagedMethod,
    ) -> Result<(), RegistrationError> {
        let Some(target) = class.as_class() else {
            return Err(RegistrationError::NotAClass {
                name: name.to_string(),
                target: class.class_name(),
            });
        };
        target.define(name, Method::Managed(body));
        Ok(())
    }

    /// Call `name` on `recv`
    pub fn call_method(
        &self,
        recv: &Value,
        name: &str,
        args: &[Value],
        block: Option<&Value>,
    ) -> Result<Value, CallError> {
        let class = self.class_of(recv);
        let method = class.as_class().and_then(|c| c.find_method(name));
        match method {
            Some(Method::Native(native)) => self.call_native(&native, recv, args, block),
            Some(Method::Managed(body)) => body(self, recv, args, block),
            None => Err(CallError::NoMethod {
                name: name.to_string(),
                class: class.as_class().map_or_else(|| class.class_name(), |c| c.name().to_string()),
            }),
        }
    }

    /// Call a proc object
    pub fn call_proc(&self, proc: &ObjRef, args: &[Value]) -> Result<Value, CallError> {
        match proc.body() {
            ObjectBody::Proc(body) => body(self, args),
            _ => Err(CallError::TypeError(format!(
                "wrong argument type {} (expected Proc)",
                proc.class_name()
            ))),
        }
    }

    // ========================================================================
    // Sweeps and statistics
    // ========================================================================

    /// Ask the next safepoint to sweep dead handle slots
    pub fn request_sweep(&self) {
        self.shared.sweep_requested.store(true, Ordering::Release);
    }

    /// Run a requested sweep; does nothing inside a blocking region
    pub fn poll_safepoint(&self) -> usize {
        if ThreadControl::current().safepoints_inhibited() {
            return 0;
        }
        if !self.shared.sweep_requested.swap(false, Ordering::AcqRel) {
            return 0;
        }
        let _gil = self.gil().acquire();
        let swept = self.with_handles(|table| table.sweep());
        tracing::debug!(swept, "handle table sweep");
        swept
    }

    /// Wait for the cleaner to drain everything queued so far
    pub fn sync_cleaner(&self) {
        self.shared.cleaner.sync(&self.shared.gil);
    }

    /// GIL counters
    pub fn gil_stats(&self) -> GilStats {
        self.gil().stats()
    }

    /// Handle table counters
    pub fn handle_stats(&self) -> HandleStats {
        let _gil = self.gil().acquire();
        self.with_handles(|table| table.stats())
    }

    /// Pin count of a handle, if it names a live slot
    pub fn pin_count(&self, handle: Handle) -> Option<u32> {
        let _gil = self.gil().acquire();
        self.with_handles(|table| table.pins(handle))
    }

    /// Cleaner counters
    pub fn cleaner_stats(&self) -> CleanerStats {
        self.shared.cleaner.stats()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("options", &self.shared.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> Runtime {
        Runtime::new(BridgeOptions::default()).unwrap()
    }

    #[test]
    fn test_value_handle_conversion() {
        let rt = runtime();
        let scope = rt.enter_native();

        assert_eq!(scope.to_handle(&Value::Nil), Handle::NIL);
        assert_eq!(scope.to_handle(&Value::Bool(true)), Handle::TRUE);
        assert_eq!(scope.to_handle(&Value::Integer(42)).as_fixnum(), Some(42));

        let big = scope.to_handle(&Value::Integer(i64::MAX));
        assert!(big.is_object());
        assert_eq!(scope.from_handle(big).unwrap(), Value::Integer(i64::MAX));

        let float = scope.to_handle(&Value::Float(1.5));
        assert_eq!(scope.from_handle(float).unwrap(), Value::Float(1.5));

        let s = rt.str_new(b"x");
        let h = scope.to_handle(&Value::Object(s.clone()));
        assert_eq!(scope.from_handle(h).unwrap(), Value::Object(s));
    }

    #[test]
    fn test_define_class_reopens() {
        let rt = runtime();
        let foo = rt.define_class("Foo", None).unwrap();
        let again = rt.define_class("Foo", None).unwrap();
        assert!(Arc::ptr_eq(&foo, &again));
        assert!(Arc::ptr_eq(&rt.class_of(&Value::Object(foo)), &rt.classes().class));

        let object = Value::Object(rt.classes().object.clone());
        assert!(Arc::ptr_eq(&rt.class_of(&object), &rt.classes().class));
        let module = Value::Object(rt.define_module("Helpers"));
        assert!(Arc::ptr_eq(&rt.class_of(&module), &rt.classes().module));

        let string = rt.str_new(b"");
        assert!(rt.define_class("Bad", Some(&string)).is_err());
    }

    #[test]
    fn test_call_managed_method_and_no_method() {
        let rt = runtime();
        let foo = rt.define_class("Greeter", None).unwrap();
        let body: ManagedMethod = Arc::new(|_rt, _recv, args, _block| Ok(args[0].clone()));
        rt.define_managed_method(&foo, "echo", body).unwrap();

        let obj = Value::Object(rt.object_new(&foo).unwrap());
        assert_eq!(
            rt.call_method(&obj, "echo", &[Value::Integer(7)], None).unwrap(),
            Value::Integer(7)
        );
        assert_eq!(
            rt.call_method(&obj, "missing", &[], None),
            Err(CallError::NoMethod {
                name: "missing".into(),
                class: "Greeter".into()
            })
        );
    }

    #[test]
    fn test_define_method_on_non_class() {
        let rt = runtime();
        let s = rt.str_new(b"");
        let body: ManagedMethod = Arc::new(|_, _, _, _| Ok(Value::Nil));
        assert!(matches!(
            rt.define_managed_method(&s, "m", body),
            Err(RegistrationError::NotAClass { .. })
        ));
    }

    #[test]
    fn test_runtimes_are_isolated() {
        let a = runtime();
        let b = runtime();
        a.define_class("OnlyInA", None).unwrap();
        assert!(a.lookup_class("OnlyInA").is_some());
        assert!(b.lookup_class("OnlyInA").is_none());
    }
}
