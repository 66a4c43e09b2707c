//! Blocking Region Tests
//!
//! Native code that blocks without the GIL: the lock is released for the
//! duration, other threads run meanwhile, and interrupts wake the blocked
//! call through its unblock callback.
//!
//! # Running Tests
//! ```bash
//! cargo test --test blocking_tests
//! ```

use cext_engine::ffi::c_api::*;
use cext_engine::{BridgeOptions, CallError, Gil, Handle, ObjRef, Runtime, Value};
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

fn runtime() -> Runtime {
    Runtime::new(BridgeOptions::default()).expect("runtime")
}

fn receiver(rt: &Runtime, class: &ObjRef) -> Value {
    Value::Object(rt.object_new(class).unwrap())
}

fn wait_for(flag: &AtomicBool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !flag.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "timed out waiting for flag");
        thread::sleep(Duration::from_millis(1));
    }
}

// ===== Release and restore =====

static DEPTH_GIL: AtomicPtr<Gil> = AtomicPtr::new(std::ptr::null_mut());
static DEPTH_INSIDE: AtomicUsize = AtomicUsize::new(usize::MAX);

unsafe extern "C" fn observe_depth(data: *mut c_void) -> *mut c_void {
    let gil = &*(data as *const Gil);
    DEPTH_INSIDE.store(gil.depth(), Ordering::SeqCst);
    data
}

unsafe extern "C" fn native_block_inner(_recv: Handle) -> Handle {
    let gil = DEPTH_GIL.load(Ordering::SeqCst);
    cext_thread_call_without_gil(observe_depth, gil as *mut c_void, None, std::ptr::null_mut());
    cext_int2num((*gil).depth() as i64)
}

unsafe extern "C" fn native_block_outer(recv: Handle) -> Handle {
    cext_funcall(recv, c"inner".as_ptr(), 0, std::ptr::null())
}

#[test]
fn test_nested_depth_released_and_restored() {
    let rt = runtime();
    DEPTH_GIL.store(rt.gil() as *const Gil as *mut Gil, Ordering::SeqCst);
    let class = rt.define_class("Nested", None).unwrap();
    rt.define_native_method(&class, "inner", native_block_inner as *const c_void, 0, false)
        .unwrap();
    rt.define_native_method(&class, "outer", native_block_outer as *const c_void, 0, false)
        .unwrap();
    let recv = receiver(&rt, &class);
    let releases_before = rt.gil_stats().blocking_releases;

    let depth_after = rt.call_method(&recv, "outer", &[], None).unwrap();

    assert_eq!(DEPTH_INSIDE.load(Ordering::SeqCst), 0);
    assert_eq!(depth_after, Value::Integer(2));
    assert_eq!(rt.gil_stats().blocking_releases - releases_before, 1);
    assert!(!rt.gil().is_locked());
}

// ===== Other threads run while one blocks =====

static PARKED: AtomicBool = AtomicBool::new(false);
static RESUME: AtomicBool = AtomicBool::new(false);

unsafe extern "C" fn park_until_resumed(_data: *mut c_void) -> *mut c_void {
    PARKED.store(true, Ordering::SeqCst);
    wait_for(&RESUME);
    std::ptr::null_mut()
}

unsafe extern "C" fn native_park(_recv: Handle) -> Handle {
    cext_thread_call_without_gil(park_until_resumed, std::ptr::null_mut(), None, std::ptr::null_mut());
    Handle::TRUE
}

unsafe extern "C" fn native_ping(_recv: Handle) -> Handle {
    cext_int2num(7)
}

#[test]
fn test_native_calls_proceed_while_another_thread_blocks() {
    let rt = runtime();
    let class = rt.define_class("Parker", None).unwrap();
    rt.define_native_method(&class, "park", native_park as *const c_void, 0, false)
        .unwrap();
    rt.define_native_method(&class, "ping", native_ping as *const c_void, 0, false)
        .unwrap();
    let recv = receiver(&rt, &class);

    let blocked_recv = recv.clone();
    let blocked = rt
        .spawn_thread(move |rt| rt.call_method(&blocked_recv, "park", &[], None))
        .unwrap();

    wait_for(&PARKED);
    assert!(!rt.gil().is_locked());
    assert_eq!(rt.call_method(&recv, "ping", &[], None).unwrap(), Value::Integer(7));

    RESUME.store(true, Ordering::SeqCst);
    let result = blocked.join().unwrap();
    assert_eq!(result.unwrap(), Value::Bool(true));
}

// ===== Interrupts =====

static WAITING: AtomicBool = AtomicBool::new(false);
static WOKEN: AtomicBool = AtomicBool::new(false);
static UBF_CALLS: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn wait_for_wakeup(_data: *mut c_void) -> *mut c_void {
    WAITING.store(true, Ordering::SeqCst);
    wait_for(&WOKEN);
    std::ptr::null_mut()
}

unsafe extern "C" fn wake_up(_data: *mut c_void) {
    UBF_CALLS.fetch_add(1, Ordering::SeqCst);
    WOKEN.store(true, Ordering::SeqCst);
}

unsafe extern "C" fn native_wait(_recv: Handle) -> Handle {
    cext_thread_call_without_gil(wait_for_wakeup, std::ptr::null_mut(), Some(wake_up), std::ptr::null_mut());
    Handle::TRUE
}

#[test]
fn test_interrupt_wakes_blocked_call() {
    let rt = runtime();
    let class = rt.define_class("Waiter", None).unwrap();
    rt.define_native_method(&class, "wait", native_wait as *const c_void, 0, false)
        .unwrap();
    let recv = receiver(&rt, &class);

    let waiter_recv = recv.clone();
    let waiter = rt
        .spawn_thread(move |rt| rt.call_method(&waiter_recv, "wait", &[], None))
        .unwrap();

    wait_for(&WAITING);
    {
        // The blocked thread must not be holding the lock
        let _gil = rt.gil().acquire();
    }

    let started = Instant::now();
    waiter.interrupt();
    let result = waiter.join().unwrap();

    assert_eq!(result, Err(CallError::Interrupted));
    assert_eq!(UBF_CALLS.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!rt.gil().is_locked());
}

static SLEEPING: AtomicBool = AtomicBool::new(false);
static SLEEP_DONE: AtomicBool = AtomicBool::new(false);

unsafe extern "C" fn sleep_briefly(_data: *mut c_void) -> *mut c_void {
    SLEEPING.store(true, Ordering::SeqCst);
    thread::sleep(Duration::from_millis(100));
    SLEEP_DONE.store(true, Ordering::SeqCst);
    std::ptr::null_mut()
}

unsafe extern "C" fn native_sleep(_recv: Handle) -> Handle {
    cext_thread_call_without_gil(sleep_briefly, std::ptr::null_mut(), None, std::ptr::null_mut());
    Handle::TRUE
}

#[test]
fn test_interrupt_without_unblock_waits_for_return() {
    let rt = runtime();
    let class = rt.define_class("Sleeper", None).unwrap();
    rt.define_native_method(&class, "sleep", native_sleep as *const c_void, 0, false)
        .unwrap();
    let recv = receiver(&rt, &class);

    let sleeper_recv = recv.clone();
    let sleeper = rt
        .spawn_thread(move |rt| rt.call_method(&sleeper_recv, "sleep", &[], None))
        .unwrap();

    wait_for(&SLEEPING);
    sleeper.interrupt();
    let result = sleeper.join().unwrap();

    assert!(SLEEP_DONE.load(Ordering::SeqCst));
    assert_eq!(result, Err(CallError::Interrupted));
}

static GUARDED_RUNS: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn count_run(data: *mut c_void) -> *mut c_void {
    GUARDED_RUNS.fetch_add(1, Ordering::SeqCst);
    data
}

unsafe extern "C" fn native_guarded(_recv: Handle) -> Handle {
    let result = cext_thread_call_without_gil(count_run, 1usize as *mut c_void, None, std::ptr::null_mut());
    Handle::from_bool(!result.is_null())
}

#[test]
fn test_pending_interrupt_skips_blocking_call() {
    let rt = runtime();
    let class = rt.define_class("Guarded", None).unwrap();
    rt.define_native_method(&class, "guarded", native_guarded as *const c_void, 0, false)
        .unwrap();
    let recv = receiver(&rt, &class);

    let guarded = rt
        .spawn_thread(move |rt| {
            cext_engine::ThreadControl::current().interrupt();
            let first = rt.call_method(&recv, "guarded", &[], None);
            let runs_after_first = GUARDED_RUNS.load(Ordering::SeqCst);
            let second = rt.call_method(&recv, "guarded", &[], None);
            (first, runs_after_first, second)
        })
        .unwrap();
    let (first, runs_after_first, second) = guarded.join().unwrap();

    assert_eq!(first, Err(CallError::Interrupted));
    assert_eq!(runs_after_first, 0);
    // The interrupt is consumed once; the next call runs normally
    assert_eq!(second, Ok(Value::Bool(true)));
    assert_eq!(GUARDED_RUNS.load(Ordering::SeqCst), 1);
}
