//! Handle table
//!
//! Native code never sees managed objects directly. It sees [`Handle`]s:
//! dense integers issued by the [`HandleTable`], pinned for the duration of
//! the native call frame that obtained them, and returned to a free list
//! once the object they named has been collected.
//!
//! [`Handle`]: cext_sdk::Handle

mod frame;
mod roots;
mod table;

pub use frame::{CallFrame, FrameId};
pub use roots::RootSet;
pub use table::{HandleStats, HandleTable};
