//! Native extension interface
//!
//! This module provides:
//! - Native method descriptors and the call adapter (NativeMethod)
//! - `pre`/`post` call scopes (NativeScope)
//! - Shared-library loading and `Init_` dispatch (Library, ModuleLoader)
//! - GIL-free blocking calls (BlockingTaskRunner)
//! - The exported C API (`cext_*`)

mod adapter;
pub mod blocking;
pub mod c_api;
pub mod loader;
mod method;
mod scope;

pub use blocking::BlockingTaskRunner;
pub use loader::{Library, LinkError, LoadedExtension, ModuleLoader, LIBRARY_SUFFIX};
pub use method::NativeMethod;
pub use scope::NativeScope;

