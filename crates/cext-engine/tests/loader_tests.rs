//! Extension Loader Tests
//!
//! Library resolution, link failures, and `Init_` entry points. Statically
//! linked initializers stand in for real extension libraries.
//!
//! # Running Tests
//! ```bash
//! cargo test --test loader_tests
//! ```

#![allow(non_snake_case)]

use cext_engine::ffi::c_api::*;
use cext_engine::ffi::{LinkError, LIBRARY_SUFFIX};
use cext_engine::{BridgeOptions, ErrorKind, Handle, Runtime, Value};
use std::ffi::c_void;
use std::io::Write;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

fn runtime() -> Runtime {
    Runtime::new(BridgeOptions::default()).expect("runtime")
}

// ===== Link failures =====

#[test]
fn test_missing_library_is_not_found() {
    let rt = runtime();
    let err = rt.load_extension("/nonexistent/dir/ghost.so").unwrap_err();
    assert!(matches!(err, LinkError::NotFound { .. }));
    assert!(err.to_string().starts_with("could not load extension: "));
    assert!(rt.loaded_extensions().is_empty());
}

#[test]
fn test_invalid_library_file_is_not_found() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(format!("broken.{}", LIBRARY_SUFFIX));
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(b"this is not a shared library").unwrap();
    drop(file);

    let rt = runtime();
    let err = rt.load_extension(path.to_str().unwrap()).unwrap_err();
    assert!(matches!(err, LinkError::NotFound { .. }));
    assert!(rt.loaded_extensions().is_empty());
}

#[test]
fn test_bare_name_searches_extension_paths() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(format!("fake.{}", LIBRARY_SUFFIX));
    std::fs::write(&path, b"junk").unwrap();

    let options = BridgeOptions {
        extension_paths: vec![dir.path().to_path_buf()],
        ..BridgeOptions::default()
    };
    let rt = Runtime::new(options).unwrap();

    match rt.load_extension("fake").unwrap_err() {
        LinkError::NotFound { path: reported } => {
            assert!(reported.contains(dir.path().to_str().unwrap()))
        }
        other => panic!("expected NotFound, got {:?}", other),
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
#[test]
fn test_library_without_init_symbol() {
    let rt = runtime();
    let err = rt.load_extension("libc.so.6").unwrap_err();
    match &err {
        LinkError::SymbolNotFound { symbol, .. } => assert_eq!(symbol, "Init_libc"),
        other => panic!("expected SymbolNotFound, got {:?}", other),
    }
    assert!(err.to_string().starts_with("missing entry point Init_libc in "));
    assert!(rt.loaded_extensions().is_empty());
}

// ===== Static initializers =====

static COUNTER_INITS: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn counter_next(recv: Handle) -> Handle {
    let current = cext_funcall(recv, c"value".as_ptr(), 0, std::ptr::null());
    cext_int2num(cext_num2long(current) + 1)
}

unsafe extern "C" fn Init_counter(context: Handle) {
    COUNTER_INITS.fetch_add(1, Ordering::SeqCst);
    let object = cext_path2class(c"Object".as_ptr());
    assert_eq!(cext_obj_class(context), cext_obj_class(object));
    let class = cext_define_class(c"Counter".as_ptr(), object);
    cext_define_method(class, c"next".as_ptr(), counter_next as *const c_void, 0);
}

#[test]
fn test_static_extension_initializes_once() {
    let rt = runtime();
    assert!(rt.init_static_extension("counter", Init_counter).unwrap());
    assert!(!rt.init_static_extension("counter", Init_counter).unwrap());
    assert_eq!(COUNTER_INITS.load(Ordering::SeqCst), 1);
    assert_eq!(rt.loaded_extensions(), vec!["counter".to_string()]);
    assert!(!rt.gil().is_locked());

    let class = rt.lookup_class("Counter").unwrap();
    rt.define_managed_method(
        &class,
        "value",
        std::sync::Arc::new(|_rt, _recv, _args, _block| Ok(Value::Integer(9))),
    )
    .unwrap();
    let recv = Value::Object(rt.object_new(&class).unwrap());
    assert_eq!(
        rt.call_method(&recv, "next", &[], None).unwrap(),
        Value::Integer(10)
    );
}

unsafe extern "C" fn Init_broken(_context: Handle) {
    cext_raise(ErrorKind::Runtime as c_int, c"setup failed".as_ptr());
}

#[test]
fn test_raising_initializer_fails_load() {
    let rt = runtime();
    let err = rt.init_static_extension("broken", Init_broken).unwrap_err();
    match err {
        LinkError::InitFailed { symbol, message } => {
            assert_eq!(symbol, "Init_broken");
            assert_eq!(message, "RuntimeError: setup failed");
        }
        other => panic!("expected InitFailed, got {:?}", other),
    }
    assert!(rt.loaded_extensions().is_empty());
    assert!(!rt.gil().is_locked());
}
