//! Global roots
//!
//! Native code that stores a handle somewhere outliving the current call
//! (a static, a struct behind a data pointer) registers it here. A rooted
//! handle stays pinned until every registration is removed.

use cext_sdk::Handle;
use rustc_hash::FxHashMap;

/// Registration counts for globally pinned handles
#[derive(Debug, Default)]
pub struct RootSet {
    roots: FxHashMap<Handle, usize>,
}

impl RootSet {
    /// Create an empty root set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one registration for `handle`
    pub fn add(&mut self, handle: Handle) {
        *self.roots.entry(handle).or_insert(0) += 1;
    }

    /// Remove one registration; false if `handle` was not rooted
    pub fn remove(&mut self, handle: Handle) -> bool {
        match self.roots.get_mut(&handle) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                self.roots.remove(&handle);
                true
            }
            None => false,
        }
    }

    /// Check whether `handle` is rooted
    pub fn contains(&self, handle: Handle) -> bool {
        self.roots.contains_key(&handle)
    }

    /// Iterate over rooted handles
    pub fn iter(&self) -> impl Iterator<Item = Handle> + '_ {
        self.roots.keys().copied()
    }

    /// Number of distinct rooted handles
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}
