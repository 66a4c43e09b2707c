//! Synchronization for native-extension execution
//!
//! - [`Gil`]: the single reentrant lock serializing native code against the
//!   managed heap
//! - [`GilCell`]: interior mutability for bridge tables that the GIL
//!   already serializes

mod gil;
mod gil_cell;

pub use gil::{Gil, GilGuard, GilReleased, GilStats, SavedDepth};
pub use gil_cell::GilCell;
