//! Error types for the native-extension bridge
//!
//! Recoverable conditions are returned as `Result`s. Contract violations by
//! native code or by the bridge itself (stale handles, unbalanced frames, GIL
//! misuse) are not recoverable and go through [`fatal`].

use cext_sdk::{ErrorKind, Handle, NativeError};
use thiserror::Error;

/// Handle resolution failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    /// Handle was never issued, or its referent has been collected
    #[error("Invalid handle: {0:?}")]
    InvalidHandle(Handle),
}

/// Errors surfaced to managed code by a method call
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    /// Call site passed the wrong number of arguments
    #[error("wrong number of arguments (given {given}, expected {expected})")]
    ArgumentCount {
        /// Arguments supplied by the caller
        given: usize,
        /// Arguments the method declares
        expected: usize,
    },

    /// A value could not be converted to the type the callee expects
    #[error("Type error: {0}")]
    TypeError(String),

    /// No method with this name on the receiver's class chain
    #[error("undefined method '{name}' for {class}")]
    NoMethod {
        /// Method name
        name: String,
        /// Receiver class name
        class: String,
    },

    /// Exception raised by native or managed code
    #[error("{}: {}", .kind.class_name(), .message)]
    Raised {
        /// Exception kind
        kind: ErrorKind,
        /// Exception message
        message: String,
    },

    /// The calling thread was interrupted
    #[error("Thread interrupted")]
    Interrupted,
}

impl CallError {
    /// Build a raised exception
    pub fn raised(kind: ErrorKind, message: impl Into<String>) -> Self {
        CallError::Raised {
            kind,
            message: message.into(),
        }
    }

    /// Exception kind managed code observes for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            CallError::ArgumentCount { .. } => ErrorKind::Argument,
            CallError::TypeError(_) => ErrorKind::Type,
            CallError::NoMethod { .. } => ErrorKind::NoMethod,
            CallError::Raised { kind, .. } => *kind,
            CallError::Interrupted => ErrorKind::Interrupt,
        }
    }
}

impl From<NativeError> for CallError {
    fn from(err: NativeError) -> Self {
        match err {
            NativeError::TypeMismatch { expected, got } => CallError::TypeError(format!(
                "no implicit conversion of {} into {}",
                got, expected
            )),
            NativeError::ArgumentError(message) => CallError::raised(ErrorKind::Argument, message),
            NativeError::ExtensionError(message) => CallError::raised(ErrorKind::Runtime, message),
        }
    }
}

/// Method registration failures (configuration errors in the extension)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// Declared arity has no call path
    #[error("Unsupported arity {arity} for method '{name}' (expected -1..=3)")]
    UnsupportedArity {
        /// Method name
        name: String,
        /// Declared arity
        arity: i32,
    },

    /// Function address was null
    #[error("Null function pointer registered for method '{0}'")]
    NullFunction(String),

    /// Methods can only be defined on class objects
    #[error("Cannot define method '{name}' on non-class {target}")]
    NotAClass {
        /// Method name
        name: String,
        /// Description of the target
        target: String,
    },
}

/// Abort on a broken native-extension contract.
///
/// Logs and panics; inside an exported `extern "C"` function the panic
/// aborts the process.
#[cold]
#[track_caller]
pub fn fatal(message: impl std::fmt::Display) -> ! {
    tracing::error!(%message, "native-extension contract violation");
    panic!("cext fatal: {}", message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_error_kinds() {
        let err = CallError::ArgumentCount {
            given: 3,
            expected: 2,
        };
        assert_eq!(err.kind(), ErrorKind::Argument);
        assert_eq!(
            err.to_string(),
            "wrong number of arguments (given 3, expected 2)"
        );

        let err = CallError::raised(ErrorKind::Type, "no implicit conversion");
        assert_eq!(err.kind(), ErrorKind::Type);
        assert_eq!(err.to_string(), "TypeError: no implicit conversion");
        assert_eq!(CallError::Interrupted.kind(), ErrorKind::Interrupt);
    }

    #[test]
    fn test_native_error_conversion() {
        let err: CallError = NativeError::TypeMismatch {
            expected: "Integer".into(),
            got: "String".into(),
        }
        .into();
        assert_eq!(
            err,
            CallError::TypeError("no implicit conversion of String into Integer".into())
        );

        let err = CallError::from(NativeError::from("backend offline"));
        assert_eq!(err, CallError::raised(ErrorKind::Runtime, "backend offline"));
    }

    #[test]
    #[should_panic(expected = "cext fatal: broken")]
    fn test_fatal_panics() {
        fatal("broken");
    }
}
