//! FFI bindings for the Notabot engine
//!
//! This module provides C-compatible functions for embedding the tracker in
//! host applications. Strings are null-terminated; returned strings are
//! allocated by the library and must be freed with `notabot_free_string`.
//! Timestamps cross the boundary as Unix epoch milliseconds.
//!
//! The commit protocol is split so the host owns networking:
//! `notabot_tracker_begin_commit` returns the request JSON to send, and
//! `notabot_tracker_complete_commit` applies the HTTP status and body.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tracing::warn;

use crate::commit::CommitTicket;
use crate::config::TrackerConfig;
use crate::error::NotabotError;
use crate::identity::Ed25519Identity;
use crate::ledger::Credit;
use crate::protocol::CommitResponse;
use crate::storage::FileStateStore;
use crate::tracker::NotabotTracker;
use crate::types::{FocusKind, FocusSample, PointerSample, ScrollSample, TouchSample};

// Thread-local storage for the last error message
thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

/// Helper to convert C string to Rust string
unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

/// Helper to convert Rust string to C string (caller must free)
fn string_to_cstr(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cstr) => cstr.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

// ============================================================================
// Tracker Lifecycle
// ============================================================================

/// Opaque handle to a NotabotTracker and its in-flight commit
pub struct NotabotTrackerHandle {
    tracker: NotabotTracker,
    ticket: Option<CommitTicket>,
}

unsafe fn handle_mut<'a>(handle: *mut NotabotTrackerHandle) -> Option<&'a mut NotabotTrackerHandle> {
    if handle.is_null() {
        set_last_error("Null tracker pointer");
        return None;
    }
    Some(&mut *handle)
}

fn timestamp_arg(ms: i64) -> Option<DateTime<Utc>> {
    let ts = millis_to_datetime(ms);
    if ts.is_none() {
        set_last_error(&format!("Timestamp out of range: {}", ms));
    }
    ts
}

/// Map an ingest result to the number of events appended, or -1
fn appended_count(result: Result<Vec<Credit>, NotabotError>) -> i32 {
    match result {
        Ok(credits) => credits.len() as i32,
        Err(e) => {
            set_last_error(&e.to_string());
            -1
        }
    }
}

/// Create a tracker persisting to `state_path`, signing with a hex Ed25519 seed.
///
/// # Safety
/// - `config_json` may be NULL for the default configuration; otherwise it
///   must be a valid null-terminated C string.
/// - `state_path` and `seed_hex` must be valid null-terminated C strings.
/// - Returns a pointer that must be freed with `notabot_tracker_free`.
/// - Returns NULL on error; call `notabot_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn notabot_tracker_new(
    config_json: *const c_char,
    state_path: *const c_char,
    seed_hex: *const c_char,
) -> *mut NotabotTrackerHandle {
    clear_last_error();

    let config = if config_json.is_null() {
        TrackerConfig::default()
    } else {
        let json = match cstr_to_string(config_json) {
            Some(s) => s,
            None => {
                set_last_error("Invalid config string pointer");
                return ptr::null_mut();
            }
        };
        match TrackerConfig::from_json(&json) {
            Ok(config) => config,
            Err(e) => {
                set_last_error(&e.to_string());
                return ptr::null_mut();
            }
        }
    };

    let path = match cstr_to_string(state_path) {
        Some(s) => s,
        None => {
            set_last_error("Invalid state path pointer");
            return ptr::null_mut();
        }
    };

    let seed = match cstr_to_string(seed_hex) {
        Some(s) => s,
        None => {
            set_last_error("Invalid seed string pointer");
            return ptr::null_mut();
        }
    };

    let identity = match Ed25519Identity::from_hex_seed(&seed) {
        Ok(identity) => identity,
        Err(e) => {
            set_last_error(&e.to_string());
            return ptr::null_mut();
        }
    };

    match NotabotTracker::new(config, Arc::new(identity), Box::new(FileStateStore::new(path))) {
        Ok(tracker) => Box::into_raw(Box::new(NotabotTrackerHandle {
            tracker,
            ticket: None,
        })),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

/// Free a tracker. Its state is persisted first.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `notabot_tracker_new`, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn notabot_tracker_free(handle: *mut NotabotTrackerHandle) {
    if !handle.is_null() {
        let mut handle = Box::from_raw(handle);
        handle.tracker.teardown();
    }
}

/// Start or resume the session.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `notabot_tracker_new`.
/// - Returns 0 on success, -1 on error.
#[no_mangle]
pub unsafe extern "C" fn notabot_tracker_start(handle: *mut NotabotTrackerHandle, now_ms: i64) -> i32 {
    clear_last_error();

    let Some(handle) = handle_mut(handle) else {
        return -1;
    };
    let Some(now) = timestamp_arg(now_ms) else {
        return -1;
    };

    match handle.tracker.start(now) {
        Ok(()) => 0,
        Err(e) => {
            set_last_error(&e.to_string());
            -1
        }
    }
}

/// Stop ingestion and the session timer.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `notabot_tracker_new`.
/// - Returns 0 on success, -1 on error.
#[no_mangle]
pub unsafe extern "C" fn notabot_tracker_stop(handle: *mut NotabotTrackerHandle) -> i32 {
    clear_last_error();

    let Some(handle) = handle_mut(handle) else {
        return -1;
    };
    handle.tracker.stop();
    0
}

// ============================================================================
// Ingestion
// ============================================================================

/// Feed a pointer sample.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `notabot_tracker_new`.
/// - Returns the number of events appended, or -1 on error.
#[no_mangle]
pub unsafe extern "C" fn notabot_tracker_ingest_pointer(
    handle: *mut NotabotTrackerHandle,
    x: f64,
    y: f64,
    timestamp_ms: i64,
) -> i32 {
    clear_last_error();

    let Some(handle) = handle_mut(handle) else {
        return -1;
    };
    let Some(timestamp) = timestamp_arg(timestamp_ms) else {
        return -1;
    };
    appended_count(handle.tracker.ingest_pointer(PointerSample { x, y, timestamp }))
}

/// Feed a scroll sample.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `notabot_tracker_new`.
/// - Returns the number of events appended, or -1 on error.
#[no_mangle]
pub unsafe extern "C" fn notabot_tracker_ingest_scroll(
    handle: *mut NotabotTrackerHandle,
    position: f64,
    timestamp_ms: i64,
) -> i32 {
    clear_last_error();

    let Some(handle) = handle_mut(handle) else {
        return -1;
    };
    let Some(timestamp) = timestamp_arg(timestamp_ms) else {
        return -1;
    };
    appended_count(handle.tracker.ingest_scroll(ScrollSample { position, timestamp }))
}

/// Feed a focus (non-zero `focused`) or blur (zero) transition.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `notabot_tracker_new`.
/// - Returns the number of events appended, or -1 on error.
#[no_mangle]
pub unsafe extern "C" fn notabot_tracker_ingest_focus(
    handle: *mut NotabotTrackerHandle,
    focused: i32,
    timestamp_ms: i64,
) -> i32 {
    clear_last_error();

    let Some(handle) = handle_mut(handle) else {
        return -1;
    };
    let Some(timestamp) = timestamp_arg(timestamp_ms) else {
        return -1;
    };
    let kind = if focused != 0 {
        FocusKind::Focus
    } else {
        FocusKind::Blur
    };
    appended_count(handle.tracker.ingest_focus(FocusSample { kind, timestamp }))
}

/// Feed a touch sample. Pass NaN for `pressure` when the device has none.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `notabot_tracker_new`.
/// - Returns the number of events appended, or -1 on error.
#[no_mangle]
pub unsafe extern "C" fn notabot_tracker_ingest_touch(
    handle: *mut NotabotTrackerHandle,
    x: f64,
    y: f64,
    pressure: f64,
    touches: u8,
    timestamp_ms: i64,
) -> i32 {
    clear_last_error();

    let Some(handle) = handle_mut(handle) else {
        return -1;
    };
    let Some(timestamp) = timestamp_arg(timestamp_ms) else {
        return -1;
    };
    let sample = TouchSample {
        x,
        y,
        pressure: if pressure.is_nan() { None } else { Some(pressure) },
        touches,
        timestamp,
    };
    appended_count(handle.tracker.ingest_touch(sample))
}

/// Drive the session timer.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `notabot_tracker_new`.
/// - Returns the number of events appended, or -1 on error.
#[no_mangle]
pub unsafe extern "C" fn notabot_tracker_tick(handle: *mut NotabotTrackerHandle, now_ms: i64) -> i32 {
    clear_last_error();

    let Some(handle) = handle_mut(handle) else {
        return -1;
    };
    let Some(now) = timestamp_arg(now_ms) else {
        return -1;
    };
    appended_count(handle.tracker.tick(now))
}

// ============================================================================
// Read API
// ============================================================================

/// Current score as JSON: `{points, event_count, last_update}`.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `notabot_tracker_new`.
/// - Returns a newly allocated string that must be freed with `notabot_free_string`.
/// - Returns NULL on error; call `notabot_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn notabot_tracker_score(handle: *mut NotabotTrackerHandle) -> *mut c_char {
    clear_last_error();

    let Some(handle) = handle_mut(handle) else {
        return ptr::null_mut();
    };
    match serde_json::to_string(&handle.tracker.score()) {
        Ok(json) => string_to_cstr(&json),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

/// Full event chain as a JSON array.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `notabot_tracker_new`.
/// - Returns a newly allocated string that must be freed with `notabot_free_string`.
/// - Returns NULL on error; call `notabot_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn notabot_tracker_chain(handle: *mut NotabotTrackerHandle) -> *mut c_char {
    clear_last_error();

    let Some(handle) = handle_mut(handle) else {
        return ptr::null_mut();
    };
    match serde_json::to_string(handle.tracker.event_chain()) {
        Ok(json) => string_to_cstr(&json),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

// ============================================================================
// Commit Protocol
// ============================================================================

/// Whether a commit attempt should be made now: 1 yes, 0 no, -1 on error.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `notabot_tracker_new`.
#[no_mangle]
pub unsafe extern "C" fn notabot_tracker_commit_due(handle: *mut NotabotTrackerHandle, now_ms: i64) -> i32 {
    clear_last_error();

    let Some(handle) = handle_mut(handle) else {
        return -1;
    };
    let Some(now) = timestamp_arg(now_ms) else {
        return -1;
    };
    i32::from(handle.tracker.commit_due(now))
}

/// Begin a commit and return the request JSON the host must send.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `notabot_tracker_new`.
/// - Returns a newly allocated string that must be freed with `notabot_free_string`.
/// - Returns NULL on error (including when a commit is already in flight,
///   deferred or denied); call `notabot_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn notabot_tracker_begin_commit(
    handle: *mut NotabotTrackerHandle,
    now_ms: i64,
) -> *mut c_char {
    clear_last_error();

    let Some(handle) = handle_mut(handle) else {
        return ptr::null_mut();
    };
    let Some(now) = timestamp_arg(now_ms) else {
        return ptr::null_mut();
    };

    let ticket = match handle.tracker.begin_commit(now) {
        Ok(ticket) => ticket,
        Err(e) => {
            set_last_error(&e.to_string());
            return ptr::null_mut();
        }
    };

    match serde_json::to_string(&ticket.request) {
        Ok(json) => {
            handle.ticket = Some(ticket);
            string_to_cstr(&json)
        }
        Err(e) => {
            abandon_commit(&mut handle.tracker, ticket, NotabotError::from(e), now);
            set_last_error("Failed to serialize commit request");
            ptr::null_mut()
        }
    }
}

/// Nothing was sent; resolve the attempt as a transport failure
fn abandon_commit(
    tracker: &mut NotabotTracker,
    ticket: CommitTicket,
    error: NotabotError,
    now: DateTime<Utc>,
) {
    if let Err(e) = tracker.complete_commit(ticket, Err(error), now) {
        warn!(error = %e, "could not resolve unsent commit");
    }
}

/// Complete the in-flight commit from the authority's HTTP reply.
///
/// Pass `status` 0 (body may be NULL) when the request never got a reply.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `notabot_tracker_new`.
/// - `body` must be NULL or a valid null-terminated C string.
/// - Returns the outcome JSON, newly allocated; free with `notabot_free_string`.
/// - Returns NULL on error; call `notabot_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn notabot_tracker_complete_commit(
    handle: *mut NotabotTrackerHandle,
    status: i32,
    body: *const c_char,
    now_ms: i64,
) -> *mut c_char {
    clear_last_error();

    let Some(handle) = handle_mut(handle) else {
        return ptr::null_mut();
    };
    let Some(now) = timestamp_arg(now_ms) else {
        return ptr::null_mut();
    };
    let Some(ticket) = handle.ticket.take() else {
        set_last_error("No commit in flight");
        return ptr::null_mut();
    };

    let reply = match (u16::try_from(status), cstr_to_string(body)) {
        (Ok(status), Some(body)) if status > 0 => CommitResponse::from_http(status, &body),
        (Ok(status), None) if status >= 500 => CommitResponse::from_http(status, ""),
        _ => Err(NotabotError::Transport(format!("no reply (status {})", status))),
    };

    match handle.tracker.complete_commit(ticket, reply, now) {
        Ok(outcome) => match serde_json::to_string(&outcome) {
            Ok(json) => string_to_cstr(&json),
            Err(e) => {
                set_last_error(&e.to_string());
                ptr::null_mut()
            }
        },
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

/// Clear a denial after remediation. Returns 1 if cleared, 0 if not denied.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `notabot_tracker_new`.
#[no_mangle]
pub unsafe extern "C" fn notabot_tracker_acknowledge_denial(handle: *mut NotabotTrackerHandle) -> i32 {
    clear_last_error();

    let Some(handle) = handle_mut(handle) else {
        return -1;
    };
    i32::from(handle.tracker.acknowledge_denial())
}

// ============================================================================
// Memory Management
// ============================================================================

/// Free a string returned by Notabot functions.
///
/// # Safety
/// - `ptr` must be a valid pointer returned by a Notabot function, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn notabot_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

// ============================================================================
// Error Handling
// ============================================================================

/// Get the last error message.
///
/// # Safety
/// - Returns a pointer to a thread-local error string.
/// - The returned pointer is valid until the next Notabot function call on this thread.
/// - Do NOT free the returned pointer.
/// - Returns NULL if no error occurred.
#[no_mangle]
pub unsafe extern "C" fn notabot_last_error() -> *const c_char {
    LAST_ERROR.with(|e| match &*e.borrow() {
        Some(cstr) => cstr.as_ptr(),
        None => ptr::null(),
    })
}

// ============================================================================
// Version Information
// ============================================================================

/// Get the engine version.
///
/// # Safety
/// - Returns a pointer to a static string. Do NOT free.
#[no_mangle]
pub unsafe extern "C" fn notabot_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}
