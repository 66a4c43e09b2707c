//! Native method descriptors
//!
//! A [`NativeMethod`] binds a name, an owning class, a declared arity and a
//! raw function address. It is validated once, at registration, and is
//! immutable afterwards.

use crate::error::{CallError, RegistrationError};
use cext_sdk::{
    Handle, MethodFn0, MethodFn1, MethodFn2, MethodFn3, MethodFn4, VariadicBlockMethodFn,
    VariadicMethodFn, ARITY_VARIADIC, MAX_FIXED_ARITY,
};
use std::ffi::c_void;
use std::fmt;
use std::os::raw::c_int;

/// Registered native function
pub struct NativeMethod {
    name: String,
    owner: String,
    address: *const c_void,
    arity: c_int,
    takes_block: bool,
}

// The address is code, not data.
unsafe impl Send for NativeMethod {}
unsafe impl Sync for NativeMethod {}

impl NativeMethod {
    /// Validate and build a descriptor
    ///
    /// `arity` is `-1` for `(argc, argv, self)` functions or `0..=3` for
    /// positional ones. With `takes_block` the block handle is passed as an
    /// extra trailing argument.
    pub fn new(
        name: impl Into<String>,
        owner: impl Into<String>,
        address: *const c_void,
        arity: c_int,
        takes_block: bool,
    ) -> Result<Self, RegistrationError> {
        let name = name.into();
        if address.is_null() {
            return Err(RegistrationError::NullFunction(name));
        }
        if arity != ARITY_VARIADIC && !(0..=MAX_FIXED_ARITY).contains(&arity) {
            return Err(RegistrationError::UnsupportedArity { name, arity });
        }
        Ok(Self {
            name,
            owner: owner.into(),
            address,
            arity,
            takes_block,
        })
    }

    /// Method name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the class it was defined on
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Declared arity (`-1` for variadic)
    pub fn arity(&self) -> c_int {
        self.arity
    }

    /// Check whether the block is passed as a trailing handle
    pub fn takes_block(&self) -> bool {
        self.takes_block
    }

    /// Function address
    pub fn address(&self) -> *const c_void {
        self.address
    }

    /// Reject a call site passing the wrong number of arguments
    pub fn check_arity(&self, given: usize) -> Result<(), CallError> {
        if self.arity == ARITY_VARIADIC || given == self.arity as usize {
            return Ok(());
        }
        Err(CallError::ArgumentCount {
            given,
            expected: self.arity as usize,
        })
    }

    /// Call the function
    ///
    /// # Safety
    ///
    /// `args.len()` must have passed [`NativeMethod::check_arity`], the
    /// address must point at a function with the registered shape, and the
    /// caller must hold the GIL inside an open native frame.
    pub(crate) unsafe fn invoke(&self, recv: Handle, args: &[Handle], block: Handle) -> Handle {
        if self.arity == ARITY_VARIADIC {
            let argc = args.len() as c_int;
            return if self.takes_block {
                let f: VariadicBlockMethodFn = std::mem::transmute(self.address);
                f(argc, args.as_ptr(), recv, block)
            } else {
                let f: VariadicMethodFn = std::mem::transmute(self.address);
                f(argc, args.as_ptr(), recv)
            };
        }

        match (args, self.takes_block) {
            ([], false) => std::mem::transmute::<_, MethodFn0>(self.address)(recv),
            ([], true) => std::mem::transmute::<_, MethodFn1>(self.address)(recv, block),
            ([a], false) => std::mem::transmute::<_, MethodFn1>(self.address)(recv, *a),
            ([a], true) => std::mem::transmute::<_, MethodFn2>(self.address)(recv, *a, block),
            ([a, b], false) => std::mem::transmute::<_, MethodFn2>(self.address)(recv, *a, *b),
            ([a, b], true) => {
                std::mem::transmute::<_, MethodFn3>(self.address)(recv, *a, *b, block)
            }
            ([a, b, c], false) => {
                std::mem::transmute::<_, MethodFn3>(self.address)(recv, *a, *b, *c)
            }
            ([a, b, c], true) => {
                std::mem::transmute::<_, MethodFn4>(self.address)(recv, *a, *b, *c, block)
            }
            _ => crate::error::fatal(format!(
                "native method '{}' invoked with {} arguments",
                self.name,
                args.len()
            )),
        }
    }
}

impl fmt::Debug for NativeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeMethod")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("arity", &self.arity)
            .field("takes_block", &self.takes_block)
            .finish()
    }
}
