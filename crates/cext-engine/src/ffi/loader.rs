//! Native extension loading
//!
//! Cross-platform loading of extension shared libraries (.so, .dylib, .dll).
//! An extension `foo` lives in `foo.<suffix>` and exports `Init_foo`, which
//! is called once under the GIL with a handle to the `Object` class.
//! Libraries are opened with global symbol visibility and never closed.

use super::scope::NativeScope;
use crate::runtime::Runtime;
use crate::value::Value;
use cext_sdk::InitFn;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::ffi::{CStr, CString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur while loading an extension
#[derive(Debug, Error)]
pub enum LinkError {
    /// Library file not found or could not be opened
    #[error("could not load extension: {path}")]
    NotFound {
        /// Path that was attempted, with the platform's reason
        path: String,
    },

    /// Init symbol not exported
    #[error("missing entry point {symbol} in {library}")]
    SymbolNotFound {
        /// Symbol name that was not found
        symbol: String,
        /// Library path
        library: String,
    },

    /// Init function raised
    #[error("{symbol} failed: {message}")]
    InitFailed {
        /// Init symbol
        symbol: String,
        /// Raised error
        message: String,
    },

    /// Platform-specific error
    #[error("Platform error: {0}")]
    PlatformError(String),

    /// Invalid path encoding
    #[error("Invalid UTF-8 in path: {0}")]
    InvalidPath(String),
}

/// Platform library suffix
#[cfg(target_os = "macos")]
pub const LIBRARY_SUFFIX: &str = "dylib";
/// Platform library suffix
#[cfg(windows)]
pub const LIBRARY_SUFFIX: &str = "dll";
/// Platform library suffix
#[cfg(all(unix, not(target_os = "macos")))]
pub const LIBRARY_SUFFIX: &str = "so";

/// An opened shared library
pub struct Library {
    handle: LibraryHandle,
    path: String,
}

impl Library {
    /// Open a shared library.
    ///
    /// # Platform-specific behavior
    ///
    /// - **Linux/macOS**: `dlopen(RTLD_NOW | RTLD_GLOBAL)`, so later
    ///   extensions can link against this one's symbols
    /// - **Windows**: `LoadLibraryW`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LinkError> {
        let path_ref = path.as_ref();
        let path_str = path_ref
            .to_str()
            .ok_or_else(|| LinkError::InvalidPath(format!("{:?}", path_ref)))?;

        let handle = LibraryHandle::load(path_str)?;

        Ok(Library {
            handle,
            path: path_str.to_string(),
        })
    }

    /// Get a function pointer by name.
    ///
    /// # Safety
    ///
    /// The function signature must match `T`.
    pub unsafe fn get<T>(&self, symbol: &str) -> Result<T, LinkError> {
        self.handle.symbol(symbol, &self.path)
    }

    /// Path this library was opened from
    pub fn path(&self) -> &str {
        &self.path
    }
}

#[cfg(unix)]
type LibraryHandle = UnixLibrary;

#[cfg(windows)]
type LibraryHandle = WindowsLibrary;

// ============================================================================
// Unix Implementation (Linux, macOS, BSD)
// ============================================================================

#[cfg(unix)]
struct UnixLibrary {
    handle: *mut std::ffi::c_void,
}

#[cfg(unix)]
impl UnixLibrary {
    fn load(path: &str) -> Result<Self, LinkError> {
        let c_path = CString::new(path)
            .map_err(|e| LinkError::PlatformError(format!("Invalid path: {}", e)))?;

        // RTLD_GLOBAL: dependent extensions resolve against this one
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL) };

        if handle.is_null() {
            return Err(LinkError::NotFound {
                path: format!("{}: {}", path, unsafe { last_dl_error() }),
            });
        }

        Ok(UnixLibrary { handle })
    }

    unsafe fn symbol<T>(&self, name: &str, lib_path: &str) -> Result<T, LinkError> {
        let c_name = CString::new(name)
            .map_err(|e| LinkError::PlatformError(format!("Invalid symbol name: {}", e)))?;

        libc::dlerror();
        let symbol = libc::dlsym(self.handle, c_name.as_ptr());

        if symbol.is_null() {
            return Err(LinkError::SymbolNotFound {
                symbol: name.to_string(),
                library: lib_path.to_string(),
            });
        }

        Ok(std::mem::transmute_copy(&symbol))
    }
}

#[cfg(unix)]
unsafe fn last_dl_error() -> String {
    let err_ptr = libc::dlerror();
    if err_ptr.is_null() {
        "Unknown error".to_string()
    } else {
        CStr::from_ptr(err_ptr).to_string_lossy().into_owned()
    }
}

#[cfg(unix)]
unsafe impl Send for UnixLibrary {}
#[cfg(unix)]
unsafe impl Sync for UnixLibrary {}

// ============================================================================
// Windows Implementation
// ============================================================================

#[cfg(windows)]
struct WindowsLibrary {
    handle: *mut std::ffi::c_void,
}

#[cfg(windows)]
impl WindowsLibrary {
    fn load(path: &str) -> Result<Self, LinkError> {
        use std::ffi::OsStr;
        use std::os::windows::ffi::OsStrExt;

        let wide: Vec<u16> = OsStr::new(path)
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        let handle = unsafe { LoadLibraryW(wide.as_ptr()) };

        if handle.is_null() {
            let error = unsafe { GetLastError() };
            return Err(LinkError::NotFound {
                path: format!("{} (error code: {})", path, error),
            });
        }

        Ok(WindowsLibrary { handle })
    }

    unsafe fn symbol<T>(&self, name: &str, lib_path: &str) -> Result<T, LinkError> {
        let c_name = CString::new(name)
            .map_err(|e| LinkError::PlatformError(format!("Invalid symbol name: {}", e)))?;

        let symbol = GetProcAddress(self.handle, c_name.as_ptr());

        if symbol.is_null() {
            return Err(LinkError::SymbolNotFound {
                symbol: name.to_string(),
                library: lib_path.to_string(),
            });
        }

        Ok(std::mem::transmute_copy(&symbol))
    }
}

#[cfg(windows)]
unsafe impl Send for WindowsLibrary {}
#[cfg(windows)]
unsafe impl Sync for WindowsLibrary {}

#[cfg(windows)]
extern "system" {
    fn LoadLibraryW(filename: *const u16) -> *mut std::ffi::c_void;
    fn GetProcAddress(
        module: *mut std::ffi::c_void,
        procname: *const std::os::raw::c_char,
    ) -> *mut std::ffi::c_void;
    fn GetLastError() -> u32;
}

// ============================================================================
// Loaded-extension registry
// ============================================================================

/// An initialized extension
pub struct LoadedExtension {
    name: String,
    init_symbol: String,
    library: Option<Arc<Library>>,
}

impl LoadedExtension {
    /// Extension name (library basename)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Init symbol that was called
    pub fn init_symbol(&self) -> &str {
        &self.init_symbol
    }

    /// Backing library; `None` for statically linked extensions
    pub fn library(&self) -> Option<&Arc<Library>> {
        self.library.as_ref()
    }
}

/// Resolves extension names and keeps every loaded library open
pub struct ModuleLoader {
    search_paths: Vec<PathBuf>,
    loaded: Mutex<FxHashMap<String, LoadedExtension>>,
}

impl ModuleLoader {
    /// Create a loader searching `search_paths` for bare names
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self {
            search_paths,
            loaded: Mutex::new(FxHashMap::default()),
        }
    }

    /// Map a request to a library path
    ///
    /// Names with a directory component or a file extension are used as
    /// given. Bare names get the platform suffix and are looked up in the
    /// search paths, falling back to the bare file name.
    pub fn resolve_path(&self, name: &str) -> PathBuf {
        let requested = Path::new(name);
        if requested.components().count() > 1 || requested.extension().is_some() {
            return requested.to_path_buf();
        }
        let file = format!("{}.{}", name, LIBRARY_SUFFIX);
        self.search_paths
            .iter()
            .map(|dir| dir.join(&file))
            .find(|candidate| candidate.is_file())
            .unwrap_or_else(|| PathBuf::from(file))
    }

    /// Extension name for a library path: the file name up to its first '.'
    pub fn extension_name(path: &Path) -> String {
        let file = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        file.split('.').next().unwrap_or_default().to_string()
    }

    /// `Init_<name>`
    pub fn init_symbol_for(name: &str) -> String {
        format!("Init_{}", name)
    }

    /// Check whether an extension has been initialized
    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.lock().contains_key(name)
    }

    /// Names of every initialized extension, sorted
    pub fn loaded_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.loaded.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn insert(&self, extension: LoadedExtension) {
        self.loaded.lock().insert(extension.name.clone(), extension);
    }
}

impl Runtime {
    /// Load and initialize a native extension
    ///
    /// Returns `Ok(false)` if an extension of that name is already loaded.
    pub fn load_extension(&self, name: &str) -> Result<bool, LinkError> {
        let _gil = self.gil().acquire();
        let loader = &self.shared().loader;
        let path = loader.resolve_path(name);
        let ext_name = ModuleLoader::extension_name(&path);
        if loader.is_loaded(&ext_name) {
            return Ok(false);
        }

        let library = Library::open(&path).map_err(|err| {
            tracing::warn!(extension = %ext_name, error = %err, "extension load failed");
            err
        })?;
        let symbol = ModuleLoader::init_symbol_for(&ext_name);
        let init: InitFn = unsafe { library.get(&symbol) }.map_err(|err| {
            tracing::warn!(extension = %ext_name, error = %err, "extension load failed");
            err
        })?;

        self.run_init(&ext_name, &symbol, init)?;
        loader.insert(LoadedExtension {
            name: ext_name.clone(),
            init_symbol: symbol,
            library: Some(Arc::new(library)),
        });
        tracing::info!(extension = %ext_name, path = %path.display(), "loaded native extension");
        Ok(true)
    }

    /// Initialize an extension linked into the host binary
    pub fn init_static_extension(&self, name: &str, init: InitFn) -> Result<bool, LinkError> {
        let _gil = self.gil().acquire();
        if self.shared().loader.is_loaded(name) {
            return Ok(false);
        }
        let symbol = ModuleLoader::init_symbol_for(name);
        self.run_init(name, &symbol, init)?;
        self.shared().loader.insert(LoadedExtension {
            name: name.to_string(),
            init_symbol: symbol,
            library: None,
        });
        tracing::info!(extension = name, "initialized static extension");
        Ok(true)
    }

    fn run_init(&self, name: &str, symbol: &str, init: InitFn) -> Result<(), LinkError> {
        let object_class = Value::Object(self.classes().object.clone());
        let scope = NativeScope::enter(self);
        let context = scope.to_handle(&object_class);
        unsafe { init(context) };
        scope
            .complete(cext_sdk::Handle::NIL)
            .map(|_| ())
            .map_err(|err| {
                tracing::warn!(extension = name, error = %err, "extension init raised");
                LinkError::InitFailed {
                    symbol: symbol.to_string(),
                    message: err.to_string(),
                }
            })
    }

    /// Names of loaded extensions
    pub fn loaded_extensions(&self) -> Vec<String> {
        self.shared().loader.loaded_names()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_not_found() {
        let result = Library::open("/nonexistent/library.so");
        match result {
            Err(LinkError::NotFound { path }) => assert!(path.starts_with("/nonexistent/library.so")),
            _ => panic!("Expected NotFound error"),
        }
    }

    #[test]
    fn test_extension_name_and_symbol() {
        assert_eq!(ModuleLoader::extension_name(Path::new("/ext/foo.so")), "foo");
        assert_eq!(ModuleLoader::extension_name(Path::new("libc.so.6")), "libc");
        assert_eq!(ModuleLoader::init_symbol_for("foo"), "Init_foo");
    }

    #[test]
    fn test_resolve_path_prefers_search_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(format!("bar.{}", LIBRARY_SUFFIX));
        std::fs::write(&file, b"").unwrap();

        let loader = ModuleLoader::new(vec![PathBuf::from("/nonexistent"), dir.path().to_path_buf()]);
        assert_eq!(loader.resolve_path("bar"), file);
        assert_eq!(
            loader.resolve_path("baz"),
            PathBuf::from(format!("baz.{}", LIBRARY_SUFFIX))
        );
        assert_eq!(loader.resolve_path("./baz.so"), PathBuf::from("./baz.so"));
    }
}
