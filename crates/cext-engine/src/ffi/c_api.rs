//! C API exported to native extensions
//!
//! Every function here must be called from inside a native call (an `Init_`
//! function, a native method body, or code they call) on the thread that
//! made that call, with the GIL held. The runtime is found through the
//! innermost native scope on the calling thread.
//!
//! Errors are reported the way extensions expect: the function records an
//! exception on the current call frame and returns a neutral value (`nil`,
//! `0`, or null). The exception surfaces to managed code when the native
//! method returns. Invalid handles abort the process.

use super::blocking::BlockingTaskRunner;
use super::scope::with_active;
use crate::error::{fatal, CallError};
use crate::object::{ObjRef, ObjectBody, RObject};
use crate::runtime::Runtime;
use crate::value::Value;
use cext_sdk::{BlockingFn, DataFreeFn, ErrorKind, Handle, UnblockFn};
use std::ffi::{c_void, CStr};
use std::os::raw::{c_char, c_double, c_int, c_long};
use std::ptr;
use std::slice;

// ============================================================================
// Helper Functions
// ============================================================================

impl Runtime {
    fn handle_of(&self, value: &Value) -> Handle {
        self.gil().assert_held("handle conversion");
        self.with_handles(|table| self.encode_value(table, value))
    }

    fn value_of(&self, handle: Handle) -> Value {
        self.gil().assert_held("handle resolution");
        match self.with_handles(|table| self.decode_value(table, handle)) {
            Ok(value) => value,
            Err(err) => fatal(err),
        }
    }

    fn raise_pending(&self, error: CallError) {
        self.with_handles(|table| match table.current_frame_mut() {
            Some(frame) => frame.raise(error),
            None => fatal("exception raised outside a native call frame"),
        })
    }

    fn check_out(&self, obj: &ObjRef) {
        self.with_handles(|table| {
            if let Some(frame) = table.current_frame_mut() {
                frame.check_out(obj);
            }
        })
    }

    /// Resolve to an object passing `accepts`, raising TypeError otherwise
    fn expect(&self, handle: Handle, expected: &str, accepts: fn(&RObject) -> bool) -> Option<ObjRef> {
        let value = self.value_of(handle);
        match value.as_object() {
            Some(obj) if accepts(obj) => Some(obj.clone()),
            _ => {
                self.raise_pending(CallError::TypeError(format!(
                    "wrong argument type {} (expected {})",
                    value.type_name(),
                    expected
                )));
                None
            }
        }
    }

    fn expect_class(&self, handle: Handle) -> Option<ObjRef> {
        self.expect(handle, "Class", |obj| obj.as_class().is_some())
    }

    fn finish(&self, result: Result<Value, CallError>) -> Handle {
        match result {
            Ok(value) => self.handle_of(&value),
            Err(err) => {
                self.raise_pending(err);
                Handle::NIL
            }
        }
    }
}

unsafe fn c_str<'a>(ptr: *const c_char) -> &'a str {
    if ptr.is_null() {
        fatal("null string passed to the C API");
    }
    match CStr::from_ptr(ptr).to_str() {
        Ok(s) => s,
        Err(_) => fatal("non-UTF-8 name passed to the C API"),
    }
}

unsafe fn handle_args<'a>(argc: c_int, argv: *const Handle) -> &'a [Handle] {
    if argc <= 0 || argv.is_null() {
        return &[];
    }
    slice::from_raw_parts(argv, argc as usize)
}

// ============================================================================
// Classes and methods
// ============================================================================

/// Define (or reopen) a class; `superclass` may be nil for `Object`
#[no_mangle]
pub unsafe extern "C" fn cext_define_class(name: *const c_char, superclass: Handle) -> Handle {
    let name = c_str(name);
    with_active(|rt| {
        let superclass = if superclass.is_nil() {
            None
        } else {
            match rt.expect_class(superclass) {
                Some(obj) => Some(obj),
                None => return Handle::NIL,
            }
        };
        let result = rt
            .define_class(name, superclass.as_ref())
            .map(Value::Object);
        rt.finish(result)
    })
}

/// Define (or reopen) a module
#[no_mangle]
pub unsafe extern "C" fn cext_define_module(name: *const c_char) -> Handle {
    let name = c_str(name);
    with_active(|rt| {
        let module = rt.define_module(name);
        rt.handle_of(&Value::Object(module))
    })
}

/// Look up a class or module by name; nil if undefined
#[no_mangle]
pub unsafe extern "C" fn cext_path2class(name: *const c_char) -> Handle {
    let name = c_str(name);
    with_active(|rt| match rt.lookup_class(name) {
        Some(class) => rt.handle_of(&Value::Object(class)),
        None => Handle::NIL,
    })
}

/// Class of any object
#[no_mangle]
pub extern "C" fn cext_obj_class(obj: Handle) -> Handle {
    with_active(|rt| {
        let class = rt.class_of(&rt.value_of(obj));
        rt.handle_of(&Value::Object(class))
    })
}

unsafe fn define_method(klass: Handle, name: *const c_char, func: *const c_void, arity: c_int, takes_block: bool) {
    let name = c_str(name);
    with_active(|rt| {
        let Some(class) = rt.expect_class(klass) else {
            return;
        };
        if let Err(err) = rt.define_native_method(&class, name, func, arity, takes_block) {
            rt.raise_pending(CallError::raised(ErrorKind::Argument, err.to_string()));
        }
    })
}

/// Define a native method; `arity` is -1 (argc, argv, self) or 0..=3
#[no_mangle]
pub unsafe extern "C" fn cext_define_method(
    klass: Handle,
    name: *const c_char,
    func: *const c_void,
    arity: c_int,
) {
    define_method(klass, name, func, arity, false)
}

/// Define a native method whose block arrives as a trailing handle
#[no_mangle]
pub unsafe extern "C" fn cext_define_method_with_block(
    klass: Handle,
    name: *const c_char,
    func: *const c_void,
    arity: c_int,
) {
    define_method(klass, name, func, arity, true)
}

// ============================================================================
// Strings
// ============================================================================

/// New string from `len` bytes at `ptr`
#[no_mangle]
pub unsafe extern "C" fn cext_str_new(ptr: *const c_char, len: c_long) -> Handle {
    let bytes = if ptr.is_null() || len <= 0 {
        &[][..]
    } else {
        slice::from_raw_parts(ptr as *const u8, len as usize)
    };
    with_active(|rt| rt.handle_of(&Value::Object(rt.str_new(bytes))))
}

/// New string from a NUL-terminated C string
#[no_mangle]
pub unsafe extern "C" fn cext_str_new_cstr(ptr: *const c_char) -> Handle {
    if ptr.is_null() {
        fatal("null string passed to cext_str_new_cstr");
    }
    let bytes = CStr::from_ptr(ptr).to_bytes();
    with_active(|rt| rt.handle_of(&Value::Object(rt.str_new(bytes))))
}

/// New empty string with room for `capa` bytes behind its pointer
#[no_mangle]
pub extern "C" fn cext_str_buf_new(capa: c_long) -> Handle {
    with_active(|rt| {
        let string = usize::try_from(capa)
            .map_err(|_| CallError::raised(ErrorKind::Argument, "negative string size (or size too big)"))
            .and_then(|capa| rt.str_with_capacity(capa));
        rt.finish(string.map(Value::Object))
    })
}

/// Direct pointer to a string's bytes, valid until the string is resized
#[no_mangle]
pub extern "C" fn cext_str_ptr(string: Handle) -> *mut c_char {
    with_active(|rt| {
        let Some(obj) = rt.expect(string, "String", RObject::is_string) else {
            return ptr::null_mut();
        };
        match rt.attach_shadow(&obj) {
            Ok(shadow) => {
                rt.check_out(&obj);
                shadow.address() as *mut c_char
            }
            Err(err) => {
                rt.raise_pending(err);
                ptr::null_mut()
            }
        }
    })
}

/// Length of a string in bytes
#[no_mangle]
pub extern "C" fn cext_str_len(string: Handle) -> c_long {
    with_active(|rt| {
        let Some(obj) = rt.expect(string, "String", RObject::is_string) else {
            return 0;
        };
        if let Some(shadow) = obj.shadow() {
            return shadow.len() as c_long;
        }
        match rt.string_bytes(&obj) {
            Ok(bytes) => bytes.len() as c_long,
            Err(err) => {
                rt.raise_pending(err);
                0
            }
        }
    })
}

/// Adopt a length after writing through [`cext_str_ptr`]
#[no_mangle]
pub extern "C" fn cext_str_set_len(string: Handle, len: c_long) {
    with_active(|rt| {
        let Some(obj) = rt.expect(string, "String", RObject::is_string) else {
            return;
        };
        let shadow = match rt.attach_shadow(&obj) {
            Ok(shadow) => shadow,
            Err(err) => return rt.raise_pending(err),
        };
        if len < 0 || !shadow.set_len(len as usize) {
            rt.raise_pending(CallError::raised(
                ErrorKind::Argument,
                format!("length {} out of range (capacity {})", len, shadow.capacity()),
            ));
            return;
        }
        rt.check_out(&obj);
    })
}

/// Append `len` bytes to a string
#[no_mangle]
pub unsafe extern "C" fn cext_str_cat(string: Handle, ptr: *const c_char, len: c_long) -> Handle {
    let bytes = if ptr.is_null() || len <= 0 {
        &[][..]
    } else {
        slice::from_raw_parts(ptr as *const u8, len as usize)
    };
    with_active(|rt| {
        if let Some(obj) = rt.expect(string, "String", RObject::is_string) {
            if let Err(err) = rt.string_push(&obj, bytes) {
                rt.raise_pending(err);
            }
        }
        string
    })
}

// ============================================================================
// Arrays
// ============================================================================

/// New empty array
#[no_mangle]
pub extern "C" fn cext_ary_new() -> Handle {
    with_active(|rt| rt.handle_of(&Value::Object(rt.array_new(Vec::new()))))
}

/// New empty array with room for `capa` elements
#[no_mangle]
pub extern "C" fn cext_ary_new_capa(capa: c_long) -> Handle {
    with_active(|rt| {
        let array = usize::try_from(capa)
            .map_err(|_| CallError::raised(ErrorKind::Argument, "negative array size"))
            .and_then(|capa| rt.array_with_capacity(capa));
        rt.finish(array.map(Value::Object))
    })
}

/// Direct pointer to an array's element handles
#[no_mangle]
pub extern "C" fn cext_ary_ptr(array: Handle) -> *mut Handle {
    with_active(|rt| {
        let Some(obj) = rt.expect(array, "Array", RObject::is_array) else {
            return ptr::null_mut();
        };
        match rt.attach_shadow(&obj) {
            Ok(shadow) => {
                rt.check_out(&obj);
                shadow.address() as *mut Handle
            }
            Err(err) => {
                rt.raise_pending(err);
                ptr::null_mut()
            }
        }
    })
}

/// Number of elements
#[no_mangle]
pub extern "C" fn cext_ary_len(array: Handle) -> c_long {
    with_active(|rt| {
        let Some(obj) = rt.expect(array, "Array", RObject::is_array) else {
            return 0;
        };
        match rt.array_len(&obj) {
            Ok(len) => len as c_long,
            Err(err) => {
                rt.raise_pending(err);
                0
            }
        }
    })
}

/// Append `value`; returns the array
#[no_mangle]
pub extern "C" fn cext_ary_push(array: Handle, value: Handle) -> Handle {
    with_active(|rt| {
        let value = rt.value_of(value);
        if let Some(obj) = rt.expect(array, "Array", RObject::is_array) {
            if let Err(err) = rt.array_push(&obj, value) {
                rt.raise_pending(err);
            }
        }
        array
    })
}

/// Element at `index` (negative counts from the end); nil when out of range
#[no_mangle]
pub extern "C" fn cext_ary_entry(array: Handle, index: c_long) -> Handle {
    with_active(|rt| {
        let Some(obj) = rt.expect(array, "Array", RObject::is_array) else {
            return Handle::NIL;
        };
        let result = rt.array_entry(&obj, index as i64);
        rt.finish(result)
    })
}

/// Store `value` at `index`
#[no_mangle]
pub extern "C" fn cext_ary_store(array: Handle, index: c_long, value: Handle) {
    with_active(|rt| {
        let value = rt.value_of(value);
        if let Some(obj) = rt.expect(array, "Array", RObject::is_array) {
            if let Err(err) = rt.array_store(&obj, index as i64, value) {
                rt.raise_pending(err);
            }
        }
    })
}

// ============================================================================
// Numbers
// ============================================================================

/// Integer handle (fixnum, or boxed when out of fixnum range)
#[no_mangle]
pub extern "C" fn cext_int2num(n: i64) -> Handle {
    match Handle::fixnum(n) {
        Some(handle) => handle,
        None => with_active(|rt| rt.handle_of(&Value::Integer(n))),
    }
}

/// Integer value; raises TypeError for non-integers
#[no_mangle]
pub extern "C" fn cext_num2long(num: Handle) -> i64 {
    if let Some(n) = num.as_fixnum() {
        return n;
    }
    with_active(|rt| match rt.value_of(num) {
        Value::Integer(n) => n,
        // i64::MAX as f64 rounds up to 2^63, so the upper bound is exclusive
        Value::Float(f) if f >= i64::MIN as f64 && f < i64::MAX as f64 => f as i64,
        Value::Float(f) => {
            rt.raise_pending(CallError::raised(
                ErrorKind::Range,
                format!("float {} out of range of integer", f),
            ));
            0
        }
        other => {
            rt.raise_pending(CallError::TypeError(format!(
                "no implicit conversion of {} into Integer",
                other.type_name()
            )));
            0
        }
    })
}

/// Float handle
#[no_mangle]
pub extern "C" fn cext_float_new(f: c_double) -> Handle {
    with_active(|rt| rt.handle_of(&Value::Float(f)))
}

/// Float value of a numeric handle; raises TypeError otherwise
#[no_mangle]
pub extern "C" fn cext_num2dbl(num: Handle) -> c_double {
    if let Some(n) = num.as_fixnum() {
        return n as c_double;
    }
    with_active(|rt| match rt.value_of(num) {
        Value::Float(f) => f,
        Value::Integer(n) => n as c_double,
        other => {
            rt.raise_pending(CallError::TypeError(format!(
                "no implicit conversion to float from {}",
                other.type_name()
            )));
            0.0
        }
    })
}

// ============================================================================
// Calls and exceptions
// ============================================================================

/// Call a method by name
#[no_mangle]
pub unsafe extern "C" fn cext_funcall(
    recv: Handle,
    name: *const c_char,
    argc: c_int,
    argv: *const Handle,
) -> Handle {
    let name = c_str(name);
    let args = handle_args(argc, argv);
    with_active(|rt| {
        let recv = rt.value_of(recv);
        let args: Vec<Value> = args.iter().map(|&h| rt.value_of(h)).collect();
        let result = rt.call_method(&recv, name, &args, None);
        rt.finish(result)
    })
}

/// Call a proc object
#[no_mangle]
pub unsafe extern "C" fn cext_proc_call(proc: Handle, argc: c_int, argv: *const Handle) -> Handle {
    let args = handle_args(argc, argv);
    with_active(|rt| {
        let Some(proc) = rt.expect(proc, "Proc", |obj| matches!(obj.body(), ObjectBody::Proc(_))) else {
            return Handle::NIL;
        };
        let args: Vec<Value> = args.iter().map(|&h| rt.value_of(h)).collect();
        let result = rt.call_proc(&proc, &args);
        rt.finish(result)
    })
}

/// Raise an exception of `kind` (see `ErrorKind`) when the native call returns
#[no_mangle]
pub unsafe extern "C" fn cext_raise(kind: c_int, message: *const c_char) {
    let message = if message.is_null() {
        String::new()
    } else {
        CStr::from_ptr(message).to_string_lossy().into_owned()
    };
    with_active(|rt| rt.raise_pending(CallError::raised(ErrorKind::from_raw(kind), message)))
}

/// 1 if an exception is pending on the current call, else 0
#[no_mangle]
pub extern "C" fn cext_error_pending() -> c_int {
    with_active(|rt| {
        rt.with_handles(|table| {
            table
                .current_frame_mut()
                .map_or(0, |frame| frame.has_pending() as c_int)
        })
    })
}

// ============================================================================
// Pins and wrapped data
// ============================================================================

/// Keep `handle` valid beyond the current call
#[no_mangle]
pub extern "C" fn cext_global_pin(handle: Handle) {
    if handle.is_immediate() {
        return;
    }
    with_active(|rt| {
        if let Err(err) = rt.with_handles(|table| table.pin_global(handle)) {
            fatal(err);
        }
    })
}

/// Undo one [`cext_global_pin`]
#[no_mangle]
pub extern "C" fn cext_global_unpin(handle: Handle) {
    if handle.is_immediate() {
        return;
    }
    with_active(|rt| {
        if !rt.with_handles(|table| table.unpin_global(handle)) {
            fatal(format!("{:?} was not globally pinned", handle));
        }
    })
}

/// Wrap `ptr` in an instance of `klass`; `dfree` runs after collection
#[no_mangle]
pub extern "C" fn cext_data_wrap(klass: Handle, ptr: *mut c_void, dfree: Option<DataFreeFn>) -> Handle {
    with_active(|rt| {
        let Some(class) = rt.expect_class(klass) else {
            return Handle::NIL;
        };
        let result = rt.data_wrap(&class, ptr, dfree).map(Value::Object);
        rt.finish(result)
    })
}

/// Pointer wrapped by a data object; raises TypeError otherwise
#[no_mangle]
pub extern "C" fn cext_data_ptr(data: Handle) -> *mut c_void {
    with_active(|rt| {
        let Some(obj) = rt.expect(data, "Data", |obj| obj.data_ptr().is_some()) else {
            return ptr::null_mut();
        };
        obj.data_ptr().unwrap_or(ptr::null_mut())
    })
}

// ============================================================================
// Blocking regions
// ============================================================================

/// Run `func(data)` without the GIL
///
/// `ubf(ubf_data)`, if given, is called from the interrupting thread to make
/// `func` return early. Returns null without calling `func` if an interrupt
/// is already pending; the interrupt is raised when the native method
/// returns.
#[no_mangle]
pub unsafe extern "C" fn cext_thread_call_without_gil(
    func: BlockingFn,
    data: *mut c_void,
    ubf: Option<UnblockFn>,
    ubf_data: *mut c_void,
) -> *mut c_void {
    with_active(|rt| {
        let runner = BlockingTaskRunner::new(func, data).with_unblock(ubf, ubf_data);
        runner.execute(rt.gil()).unwrap_or(ptr::null_mut())
    })
}
