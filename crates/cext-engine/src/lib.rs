//! Cext Engine
//!
//! The native-extension bridge: lets shared libraries written against a
//! C-style object API call into, and be called from, managed objects they
//! never see directly.
//!
//! - **Handles**: dense tokens for managed objects, pinned per call frame
//!   (`handle` module)
//! - **GIL**: the reentrant lock serializing native code (`sync` module)
//! - **Shadows**: native mirrors of string and array storage (`shadow`)
//! - **Cleaner**: frees native resources after their owner is collected
//!   (`gc` module)
//! - **FFI**: method adapters, extension loading, blocking calls and the
//!   exported `cext_*` C API (`ffi` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use cext_engine::{BridgeOptions, Runtime, Value};
//!
//! let rt = Runtime::new(BridgeOptions::default().with_env())?;
//! rt.load_extension("counter")?;
//!
//! let class = rt.lookup_class("Counter").unwrap();
//! let counter = Value::Object(rt.object_new(&class)?);
//! rt.call_method(&counter, "increment", &[Value::Integer(2)], None)?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![allow(clippy::not_unsafe_ptr_arg_deref)]
#![allow(clippy::missing_safety_doc)]

// ============================================================================
// Core Modules
// ============================================================================

pub mod error;
pub mod ffi;
pub mod gc;
pub mod handle;
pub mod object;
pub mod options;
pub mod runtime;
pub mod shadow;
pub mod sync;
pub mod thread;
pub mod value;

// ============================================================================
// Re-exports
// ============================================================================

pub use cext_sdk::{ErrorKind, Handle};
pub use error::{fatal, CallError, HandleError, RegistrationError};
pub use ffi::{BlockingTaskRunner, LinkError, NativeMethod, NativeScope};
pub use gc::CleanerStats;
pub use handle::HandleStats;
pub use object::{ManagedMethod, ManagedProc, ObjRef, ObjectBody, RObject};
pub use options::{BridgeOptions, OptionsError};
pub use runtime::{CoreClasses, Runtime};
pub use shadow::{ShadowBuffer, ShadowKind, ShadowStats};
pub use sync::{Gil, GilStats};
pub use thread::{ManagedThread, ThreadControl};
pub use value::Value;

#[cfg(not(target_pointer_width = "64"))]
compile_error!("cext-engine requires a 64-bit target");
