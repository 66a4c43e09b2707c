//! Error types shared across the native boundary

use std::os::raw::c_int;

/// Exception kinds native code can raise through `cext_raise`.
///
/// The discriminants are part of the C ABI.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Generic runtime failure
    Runtime = 0,
    /// Wrong number or shape of arguments
    Argument = 1,
    /// Value of the wrong type
    Type = 2,
    /// Method lookup failed
    NoMethod = 3,
    /// Thread was interrupted
    Interrupt = 4,
    /// Index out of range
    Index = 5,
    /// Allocation request could not be satisfied
    NoMemory = 6,
    /// Numeric value outside the representable range
    Range = 7,
}

impl ErrorKind {
    /// Decode a raw kind from native code, falling back to `Runtime`
    pub fn from_raw(raw: c_int) -> Self {
        match raw {
            1 => ErrorKind::Argument,
            2 => ErrorKind::Type,
            3 => ErrorKind::NoMethod,
            4 => ErrorKind::Interrupt,
            5 => ErrorKind::Index,
            6 => ErrorKind::NoMemory,
            7 => ErrorKind::Range,
            _ => ErrorKind::Runtime,
        }
    }

    /// Managed class name for this kind
    pub fn class_name(self) -> &'static str {
        match self {
            ErrorKind::Runtime => "RuntimeError",
            ErrorKind::Argument => "ArgumentError",
            ErrorKind::Type => "TypeError",
            ErrorKind::NoMethod => "NoMethodError",
            ErrorKind::Interrupt => "Interrupt",
            ErrorKind::Index => "IndexError",
            ErrorKind::NoMemory => "NoMemoryError",
            ErrorKind::Range => "RangeError",
        }
    }
}

/// Native extension error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum NativeError {
    /// Type mismatch during conversion
    #[error("Type mismatch: expected {expected}, got {got}")]
    TypeMismatch {
        /// Expected type name
        expected: String,
        /// Actual type name
        got: String,
    },

    /// Invalid argument
    #[error("Argument error: {0}")]
    ArgumentError(String),

    /// Extension-level error
    #[error("Extension error: {0}")]
    ExtensionError(String),
}

impl NativeError {
    /// Exception kind this error is raised as
    pub fn kind(&self) -> ErrorKind {
        match self {
            NativeError::TypeMismatch { .. } => ErrorKind::Type,
            NativeError::ArgumentError(_) => ErrorKind::Argument,
            NativeError::ExtensionError(_) => ErrorKind::Runtime,
        }
    }
}

impl From<String> for NativeError {
    fn from(s: String) -> Self {
        NativeError::ExtensionError(s)
    }
}

impl From<&str> for NativeError {
    fn from(s: &str) -> Self {
        NativeError::ExtensionError(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_from_raw() {
        assert_eq!(ErrorKind::from_raw(2), ErrorKind::Type);
        assert_eq!(ErrorKind::from_raw(7), ErrorKind::Range);
        assert_eq!(ErrorKind::from_raw(99), ErrorKind::Runtime);
        assert_eq!(ErrorKind::Argument.class_name(), "ArgumentError");
    }

    #[test]
    fn test_native_error_kind() {
        let err = NativeError::TypeMismatch {
            expected: "Integer".into(),
            got: "String".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Type);
        assert_eq!(err.to_string(), "Type mismatch: expected Integer, got String");
        assert_eq!(NativeError::from("boom").kind(), ErrorKind::Runtime);
    }
}
