//! Fatal Path Tests
//!
//! Contract violations by native code must fail loudly:
//! - Stale handles reaching the C API
//! - Pin and global-pin underflow
//! - Invalid handles returned from a native method
//!
//! A fatal error inside an `extern "C"` entry point aborts the process, so
//! those cases re-run this test binary as a child and check that it died
//! with the fatal message. Rust-level entry points unwind and use
//! `#[should_panic]`.
//!
//! # Running Tests
//! ```bash
//! cargo test --test fatal_tests
//! ```

use cext_engine::ffi::c_api::*;
use cext_engine::gc::reference_queue;
use cext_engine::handle::HandleTable;
use cext_engine::{BridgeOptions, Handle, HandleError, Runtime, Value};
use std::env;
use std::process::{Command, Output};

const CHILD_ENV: &str = "CEXT_FATAL_CHILD";

fn runtime() -> Runtime {
    Runtime::new(BridgeOptions::default()).expect("runtime")
}

/// True when this process was spawned to run `name`'s aborting body
fn is_child(name: &str) -> bool {
    env::var(CHILD_ENV).is_ok_and(|value| value == name)
}

fn run_child(name: &str) -> Output {
    Command::new(env::current_exe().expect("test binary"))
        .args([name, "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, name)
        .output()
        .expect("spawn child")
}

fn assert_died_with(output: &Output, message: &str) {
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!output.status.success(), "child survived:\n{}", stderr);
    assert!(stderr.contains(message), "missing {:?} in:\n{}", message, stderr);
}

/// Handle to a string that has been collected and whose slot was reclaimed
fn stale_handle(rt: &Runtime) -> Handle {
    let handle = rt.enter_native().to_handle(&Value::Object(rt.str_new(b"gone")));
    rt.sync_cleaner();
    assert_eq!(rt.resolve(handle), Err(HandleError::InvalidHandle(handle)));
    handle
}

// ===== Stale Handles =====

#[test]
fn test_stale_handle_in_c_api_aborts() {
    const NAME: &str = "test_stale_handle_in_c_api_aborts";
    if is_child(NAME) {
        let rt = runtime();
        let stale = stale_handle(&rt);
        let _scope = rt.enter_native();
        cext_str_len(stale);
        return;
    }
    assert_died_with(&run_child(NAME), "cext fatal: Invalid handle");
}

#[test]
#[should_panic(expected = "native method returned Invalid handle")]
fn test_stale_handle_returned_from_native_is_fatal() {
    let rt = runtime();
    let stale = stale_handle(&rt);
    let scope = rt.enter_native();
    let _ = scope.complete(stale);
}

#[test]
fn test_stale_handle_after_frame_pop_is_an_error() {
    let rt = runtime();
    let stale = stale_handle(&rt);
    let scope = rt.enter_native();
    assert_eq!(scope.from_handle(stale), Err(HandleError::InvalidHandle(stale)));
    drop(scope);
    assert!(!rt.gil().is_locked());
}

// ===== Pin Underflow =====

#[test]
#[should_panic(expected = "pin count underflow")]
fn test_release_without_pin_is_fatal() {
    let rt = runtime();
    let (tx, _rx) = reference_queue();
    let mut table = HandleTable::new(tx, 8, true);
    let string = rt.str_new(b"once");

    let frame = table.push_frame();
    let handle = table.handle_for(&string);
    table.pop_frame(frame);
    assert_eq!(table.pins(handle), Some(0));
    table.release(handle);
}

#[test]
fn test_global_unpin_without_pin_is_refused() {
    let rt = runtime();
    let (tx, _rx) = reference_queue();
    let mut table = HandleTable::new(tx, 8, true);
    let string = rt.str_new(b"once");

    let frame = table.push_frame();
    let handle = table.handle_for(&string);
    table.pin_global(handle).unwrap();
    assert!(table.unpin_global(handle));
    assert!(!table.unpin_global(handle));
    table.pop_frame(frame);
    assert_eq!(table.pins(handle), Some(0));
}

#[test]
fn test_global_unpin_underflow_in_c_api_aborts() {
    const NAME: &str = "test_global_unpin_underflow_in_c_api_aborts";
    if is_child(NAME) {
        let rt = runtime();
        let string = Value::Object(rt.str_new(b"loose"));
        let scope = rt.enter_native();
        let handle = scope.to_handle(&string);
        cext_global_pin(handle);
        cext_global_unpin(handle);
        cext_global_unpin(handle);
        return;
    }
    assert_died_with(&run_child(NAME), "was not globally pinned");
}

#[test]
fn test_immediates_ignore_global_unpin() {
    let rt = runtime();
    let before = rt.handle_stats();
    let scope = rt.enter_native();
    cext_global_unpin(Handle::NIL);
    cext_global_unpin(Handle::fixnum(3).unwrap());
    drop(scope);
    assert_eq!(rt.handle_stats(), before);
}
