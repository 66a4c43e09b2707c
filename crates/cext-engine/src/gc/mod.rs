//! Collection-side plumbing for native resources
//!
//! - [`queue`]: the reference queue objects post to when they are collected
//! - [`cleaner`]: the background reaper that drains it

pub mod cleaner;
pub mod queue;

pub use cleaner::{Cleaner, CleanerStats, TrackId};
pub use queue::{reference_queue, PhantomToken, Reclaim};
pub(crate) use queue::PhantomRef;
