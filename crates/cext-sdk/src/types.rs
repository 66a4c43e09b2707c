//! Function pointer types crossing the native boundary

use crate::handle::Handle;
use std::ffi::c_void;
use std::os::raw::c_int;

/// Arity value declaring a `(argc, argv, self)` method body
pub const ARITY_VARIADIC: c_int = -1;

/// Largest positional arity with a dedicated call path
pub const MAX_FIXED_ARITY: c_int = 3;

/// Extension entry point, exported as `Init_<basename>`
pub type InitFn = unsafe extern "C" fn(context: Handle);

/// Method body taking only the receiver
pub type MethodFn0 = unsafe extern "C" fn(recv: Handle) -> Handle;
/// Method body with one handle after the receiver
pub type MethodFn1 = unsafe extern "C" fn(recv: Handle, a: Handle) -> Handle;
/// Method body with two handles after the receiver
pub type MethodFn2 = unsafe extern "C" fn(recv: Handle, a: Handle, b: Handle) -> Handle;
/// Method body with three handles after the receiver
pub type MethodFn3 =
    unsafe extern "C" fn(recv: Handle, a: Handle, b: Handle, c: Handle) -> Handle;
/// Method body with four handles after the receiver (arity 3 plus block)
pub type MethodFn4 =
    unsafe extern "C" fn(recv: Handle, a: Handle, b: Handle, c: Handle, d: Handle) -> Handle;

/// Variable-arity method body
pub type VariadicMethodFn =
    unsafe extern "C" fn(argc: c_int, argv: *const Handle, recv: Handle) -> Handle;
/// Variable-arity method body receiving a trailing block handle
pub type VariadicBlockMethodFn =
    unsafe extern "C" fn(argc: c_int, argv: *const Handle, recv: Handle, block: Handle) -> Handle;

/// Blocking work run without the GIL
pub type BlockingFn = unsafe extern "C" fn(data: *mut c_void) -> *mut c_void;

/// Callback asking a blocking call to return early
pub type UnblockFn = unsafe extern "C" fn(data: *mut c_void);

/// Destructor for a wrapped native pointer
pub type DataFreeFn = unsafe extern "C" fn(ptr: *mut c_void);
