//! Native method adapter
//!
//! Turns a managed call into a native one: `pre`, arity check, receiver and
//! arguments to handles, the call itself, raise/interrupt/return handling,
//! `post`. Calls with up to three arguments convert into a stack buffer;
//! longer variadic calls fall back to a heap vector. Both take the same path
//! otherwise.

use super::method::NativeMethod;
use super::scope::NativeScope;
use crate::error::CallError;
use crate::runtime::Runtime;
use crate::value::Value;
use cext_sdk::{Handle, MAX_FIXED_ARITY};

const INLINE_ARGS: usize = MAX_FIXED_ARITY as usize;

impl Runtime {
    /// Invoke a native method with managed arguments
    pub fn call_native(
        &self,
        method: &NativeMethod,
        recv: &Value,
        args: &[Value],
        block: Option<&Value>,
    ) -> Result<Value, CallError> {
        let scope = NativeScope::enter(self);
        method.check_arity(args.len())?;

        let recv = scope.to_handle(recv);
        let block = block.map_or(Handle::NIL, |b| scope.to_handle(b));

        let returned = if args.len() <= INLINE_ARGS {
            let mut buf = [Handle::NIL; INLINE_ARGS];
            for (slot, arg) in buf.iter_mut().zip(args) {
                *slot = scope.to_handle(arg);
            }
            unsafe { method.invoke(recv, &buf[..args.len()], block) }
        } else {
            let handles: Vec<Handle> = args.iter().map(|arg| scope.to_handle(arg)).collect();
            unsafe { method.invoke(recv, &handles, block) }
        };

        scope.complete(returned)
    }
}
