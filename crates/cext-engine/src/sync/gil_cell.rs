//! GIL-protected interior mutability
//!
//! Bridge tables (handles, cleaner tracking list) are only ever touched by
//! the GIL holder, so they need no lock of their own. `GilCell` checks the
//! holder on every borrow; the `RefCell` inside catches same-thread
//! aliasing through reentrant paths.

use crate::sync::Gil;
use std::cell::{RefCell, RefMut};

/// Cell whose contents may only be borrowed by the GIL holder
pub struct GilCell<T> {
    inner: RefCell<T>,
}

// Access is gated on `Gil::assert_held`; the GIL's mutex orders accesses
// from successive holders.
unsafe impl<T: Send> Sync for GilCell<T> {}

impl<T> GilCell<T> {
    /// Wrap a value
    pub fn new(value: T) -> Self {
        Self {
            inner: RefCell::new(value),
        }
    }

    /// Mutably borrow the contents; aborts if `gil` is not held by the caller
    #[track_caller]
    pub fn borrow_mut<'a>(&'a self, gil: &Gil) -> RefMut<'a, T> {
        gil.assert_held("GIL-protected table access");
        self.inner.borrow_mut()
    }

    /// Consume the cell
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_borrow_under_gil() {
        let gil = Gil::new();
        let cell = GilCell::new(vec![1, 2]);
        {
            let _g = gil.acquire();
            cell.borrow_mut(&gil).push(3);
        }
        assert_eq!(cell.into_inner(), vec![1, 2, 3]);
    }

    #[test]
    #[should_panic(expected = "requires the GIL")]
    fn test_borrow_without_gil_is_fatal() {
        let gil = Gil::new();
        let cell = GilCell::new(0u32);
        *cell.borrow_mut(&gil) += 1;
    }
}
