//! Cext SDK - ABI types for native extensions
//!
//! This crate carries the small set of types a native extension and the
//! bridge must agree on, without depending on the bridge itself:
//!
//! - [`Handle`]: the pointer-sized token native code uses to refer to a
//!   managed object, plus the immediate encodings for `false`, `true`, `nil`
//!   and fixnums
//! - Function pointer types for method bodies, init entry points, blocking
//!   tasks and data destructors
//! - Error kinds understood by `cext_raise`
//!
//! # Example
//!
//! ```ignore
//! use cext_sdk::Handle;
//!
//! #[no_mangle]
//! pub extern "C" fn Init_counter(_ctx: Handle) {
//!     // define classes and methods through the cext_* C API
//! }
//! ```

#![warn(missing_docs)]

mod error;
mod handle;
mod types;

pub use error::{ErrorKind, NativeError};
pub use handle::{Handle, FIXNUM_MAX, FIXNUM_MIN, MAX_SLOT_INDEX};
pub use types::{
    BlockingFn, DataFreeFn, InitFn, MethodFn0, MethodFn1, MethodFn2, MethodFn3, MethodFn4,
    UnblockFn, VariadicBlockMethodFn, VariadicMethodFn, ARITY_VARIADIC, MAX_FIXED_ARITY,
};
