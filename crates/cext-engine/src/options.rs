//! Bridge configuration (cext.toml)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable holding extra extension directories
pub const EXTENSION_PATH_ENV: &str = "CEXT_EXTENSION_PATH";

/// Errors that can occur while loading options
#[derive(Debug, Error)]
pub enum OptionsError {
    /// Failed to read the options file
    #[error("Failed to read options file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse options: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Value out of range
    #[error("Invalid options: {0}")]
    ValidationError(String),
}

/// Runtime options for the extension bridge
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeOptions {
    /// Directories searched for bare extension names
    #[serde(default)]
    pub extension_paths: Vec<PathBuf>,

    /// Handle slots reserved up front
    #[serde(default = "default_handle_capacity")]
    pub initial_handle_capacity: usize,

    /// OS thread name of the cleaner
    #[serde(default = "default_cleaner_thread_name")]
    pub cleaner_thread_name: String,

    /// Recycle freed handle slots (off: the table only grows)
    #[serde(default = "default_reuse_handles")]
    pub reuse_handles: bool,
}

fn default_handle_capacity() -> usize {
    1024
}

fn default_cleaner_thread_name() -> String {
    "cext-cleaner".to_string()
}

fn default_reuse_handles() -> bool {
    true
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            extension_paths: Vec::new(),
            initial_handle_capacity: default_handle_capacity(),
            cleaner_thread_name: default_cleaner_thread_name(),
            reuse_handles: default_reuse_handles(),
        }
    }
}

impl BridgeOptions {
    /// Load options from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, OptionsError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse options from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, OptionsError> {
        let options: BridgeOptions = toml::from_str(content)?;
        options.validate()?;
        Ok(options)
    }

    /// Reject values the runtime cannot start with
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.cleaner_thread_name.is_empty() || self.cleaner_thread_name.contains('\0') {
            return Err(OptionsError::ValidationError(format!(
                "cleaner_thread_name must be non-empty and NUL-free, got {:?}",
                self.cleaner_thread_name
            )));
        }
        Ok(())
    }

    /// Append directories listed in `CEXT_EXTENSION_PATH`
    pub fn with_env(mut self) -> Self {
        if let Some(paths) = std::env::var_os(EXTENSION_PATH_ENV) {
            self.extension_paths.extend(std::env::split_paths(&paths));
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = BridgeOptions::from_toml_str("").unwrap();
        assert_eq!(options, BridgeOptions::default());
        assert_eq!(options.initial_handle_capacity, 1024);
        assert_eq!(options.cleaner_thread_name, "cext-cleaner");
        assert!(options.reuse_handles);
    }

    #[test]
    fn test_parse_options() {
        let toml = r#"
extension_paths = ["/opt/ext", "lib/ext"]
initial_handle_capacity = 16
reuse_handles = false
"#;
        let options = BridgeOptions::from_toml_str(toml).unwrap();
        assert_eq!(
            options.extension_paths,
            vec![PathBuf::from("/opt/ext"), PathBuf::from("lib/ext")]
        );
        assert_eq!(options.initial_handle_capacity, 16);
        assert!(!options.reuse_handles);
    }

    #[test]
    fn test_reject_bad_thread_name() {
        let err = BridgeOptions::from_toml_str("cleaner_thread_name = \"\"").unwrap_err();
        assert!(matches!(err, OptionsError::ValidationError(_)));
        assert!(matches!(
            BridgeOptions::from_toml_str("reuse_handles = 3"),
            Err(OptionsError::ParseError(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cext.toml");
        std::fs::write(&path, "initial_handle_capacity = 8\n").unwrap();
        assert_eq!(BridgeOptions::from_file(&path).unwrap().initial_handle_capacity, 8);
        assert!(matches!(
            BridgeOptions::from_file(&dir.path().join("missing.toml")),
            Err(OptionsError::IoError(_))
        ));
    }
}
