// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

// FFI cdylib: all public functions are extern "C" entry points called by the hosting runtime.
#![allow(clippy::missing_safety_doc)]

//! C ABI over the GPU resource broker.
//!
//! Provides functions prefixed with `gpubroker_` for a managed-runtime shim
//! to forward to. The library holds one process-wide broker. No entry point
//! unwinds or aborts: failures return the operation's sentinel and leave a
//! code and message in the calling thread's last-error slot.

use std::cell::RefCell;
use std::ffi::{CStr, c_char};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{LazyLock, Once};

use gpubroker::{
    AllocationHandle, BackendKind, BrokerConfig, BrokerError, DeviceListing, GpuBroker, Result,
};

/// Interface version reported by `gpubroker_on_load` (matches JNI 1.6).
pub const GPUBROKER_INTERFACE_VERSION: i32 = 0x0001_0006;

static BROKER: LazyLock<GpuBroker> = LazyLock::new(|| GpuBroker::new(initial_config()));

static LOGGING: Once = Once::new();

thread_local! {
    static LAST_ERROR: RefCell<Option<(i32, String)>> = const { RefCell::new(None) };
}

fn initial_config() -> BrokerConfig {
    BrokerConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!("[gpubroker] {}, using defaults", e);
        BrokerConfig::default()
    })
}

// Installed once, at the first FFI entry.
fn ensure_logging() {
    LOGGING.call_once(|| {
        gpubroker::logging::init(&BROKER.config().log_filter);
    });
}

fn record_error(op: &str, err: &BrokerError) {
    tracing::error!("[gpubroker] {} failed: {}", op, err);
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some((err.code(), err.to_string())));
}

fn clear_error() {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = None);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run an entry point body. Errors and panics become `fallback`.
fn guarded<T>(op: &str, fallback: T, body: impl FnOnce() -> Result<T>) -> T {
    ensure_logging();
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(value)) => {
            clear_error();
            value
        }
        Ok(Err(e)) => {
            record_error(op, &e);
            fallback
        }
        Err(payload) => {
            let err = BrokerError::driver(format!("panic: {}", panic_message(payload.as_ref())));
            record_error(op, &err);
            fallback
        }
    }
}

unsafe fn c_str_to_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

/// Copy `data` into `out_buf` (up to `buf_len` bytes); `out_len` receives the
/// full length so callers can size a retry.
unsafe fn copy_out(data: &[u8], out_buf: *mut u8, buf_len: usize, out_len: *mut usize) {
    let copy_len = data.len().min(buf_len);
    if !out_buf.is_null() && copy_len > 0 {
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), out_buf, copy_len) };
    }
    if !out_len.is_null() {
        unsafe { *out_len = data.len() };
    }
}

/// Negative indices map to an index no session contains.
fn device_index(index: i32) -> usize {
    usize::try_from(index).unwrap_or(usize::MAX)
}

fn handle(token: u64) -> Result<AllocationHandle> {
    AllocationHandle::from_raw(token)
        .ok_or_else(|| BrokerError::InvalidHandle(format!("{token:#x}")))
}

// ============================================================================
// C ABI: Library lifecycle
// ============================================================================

/// Called once by the hosting runtime when the library is loaded.
///
/// `requested_version` is the highest interface version the host speaks (0
/// accepts any). Returns `GPUBROKER_INTERFACE_VERSION`, or -1 if the host
/// requires a newer interface.
#[unsafe(no_mangle)]
pub extern "C" fn gpubroker_on_load(requested_version: i32) -> i32 {
    guarded("on_load", -1, || {
        if requested_version != 0 && requested_version > GPUBROKER_INTERFACE_VERSION {
            return Err(BrokerError::InvalidArgument(format!(
                "interface version {requested_version:#x} requested, {GPUBROKER_INTERFACE_VERSION:#x} supported"
            )));
        }
        tracing::info!(
            "[gpubroker] loaded (interface {:#x}, crate {})",
            GPUBROKER_INTERFACE_VERSION,
            env!("CARGO_PKG_VERSION")
        );
        Ok(GPUBROKER_INTERFACE_VERSION)
    })
}

/// Called once by the hosting runtime before the library is unloaded.
/// Releases the backend and every outstanding allocation.
#[unsafe(no_mangle)]
pub extern "C" fn gpubroker_on_unload() {
    guarded("on_unload", (), || {
        let report = BROKER.shutdown();
        tracing::info!(
            "[gpubroker] unloaded ({} allocation(s) reclaimed)",
            report.allocations_released
        );
        Ok(())
    })
}

// ============================================================================
// C ABI: Backend lifecycle
// ============================================================================

/// Initialize the backend. Idempotent. Returns false on failure.
#[unsafe(no_mangle)]
pub extern "C" fn gpubroker_initialize() -> bool {
    guarded("initialize", false, || BROKER.initialize().map(|()| true))
}

/// Initialize with an explicit backend (`"vulkan"` or `"host"`) for this run.
///
/// When already initialized, succeeds only if the running backend matches.
/// The choice does not outlive `gpubroker_shutdown`: a later
/// `gpubroker_initialize` resolves the backend from configuration again.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn gpubroker_initialize_backend(name: *const c_char) -> bool {
    let name = unsafe { c_str_to_str(name) };
    guarded("initialize_backend", false, || {
        let name = name.ok_or_else(|| BrokerError::InvalidArgument("backend name".into()))?;
        let kind: BackendKind = name.parse().map_err(BrokerError::InvalidArgument)?;
        BROKER.initialize_backend(kind).map(|()| true)
    })
}

/// Load a TOML configuration file. Only allowed before initialization.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn gpubroker_configure(path: *const c_char) -> bool {
    let path = unsafe { c_str_to_str(path) };
    guarded("configure", false, || {
        let path = path.ok_or_else(|| BrokerError::InvalidArgument("config path".into()))?;
        let config = BrokerConfig::load(std::path::Path::new(path))?;
        BROKER.reconfigure(config).map(|()| true)
    })
}

/// Release the backend and every outstanding allocation. Safe to call when
/// not initialized.
#[unsafe(no_mangle)]
pub extern "C" fn gpubroker_shutdown() {
    guarded("shutdown", (), || {
        BROKER.shutdown();
        Ok(())
    })
}

// ============================================================================
// C ABI: Device enumeration
// ============================================================================

/// Enumerate devices and write `{"devices":[...],"count":n}` as UTF-8 JSON.
///
/// Returns the device count, or -1 on error. `out_len` receives the full
/// JSON length even when `buf_len` is too small.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn gpubroker_enumerate_devices(
    out_json: *mut u8,
    buf_len: usize,
    out_len: *mut usize,
) -> i32 {
    guarded("enumerate_devices", -1, || {
        let devices = BROKER.enumerate_devices()?;
        let json = DeviceListing::new(&devices).to_json()?;
        unsafe { copy_out(json.as_bytes(), out_json, buf_len, out_len) };
        Ok(i32::try_from(devices.len()).unwrap_or(i32::MAX))
    })
}

/// Write the UTF-8 name of device `index` (no NUL terminator).
///
/// Returns 0 on success, -1 on error.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn gpubroker_device_name(
    index: i32,
    out_buf: *mut u8,
    buf_len: usize,
    out_len: *mut usize,
) -> i32 {
    guarded("device_name", -1, || {
        let name = BROKER.device_name(device_index(index))?;
        unsafe { copy_out(name.as_bytes(), out_buf, buf_len, out_len) };
        Ok(0)
    })
}

/// Total device memory in bytes, or -1 on error.
#[unsafe(no_mangle)]
pub extern "C" fn gpubroker_device_memory(index: i32) -> i64 {
    guarded("device_memory", -1, || {
        let bytes = BROKER.device_memory(device_index(index))?;
        Ok(i64::try_from(bytes).unwrap_or(i64::MAX))
    })
}

/// Compute unit count, or -1 on error.
#[unsafe(no_mangle)]
pub extern "C" fn gpubroker_compute_units(index: i32) -> i32 {
    guarded("compute_units", -1, || {
        let units = BROKER.compute_units(device_index(index))?;
        Ok(i32::try_from(units).unwrap_or(i32::MAX))
    })
}

// ============================================================================
// C ABI: Memory
// ============================================================================

/// Allocate `size_bytes` on device `index`. Returns a non-zero handle token,
/// or 0 on failure.
#[unsafe(no_mangle)]
pub extern "C" fn gpubroker_allocate(index: i32, size_bytes: i64) -> u64 {
    guarded("allocate", 0, || {
        let size = u64::try_from(size_bytes).map_err(|_| {
            BrokerError::AllocationFailed(format!("negative size {size_bytes}"))
        })?;
        Ok(BROKER.allocate(device_index(index), size)?.to_raw())
    })
}

/// Free an allocation. Returns false for unknown or already-freed handles.
#[unsafe(no_mangle)]
pub extern "C" fn gpubroker_free(token: u64) -> bool {
    guarded("free", false, || BROKER.free(handle(token)?).map(|()| true))
}

// ============================================================================
// C ABI: Transfers
// ============================================================================

/// Copy `len` bytes from `data` to the start of the allocation.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn gpubroker_copy_to_device(token: u64, data: *const u8, len: usize) -> bool {
    guarded("copy_to_device", false, || {
        let bytes: &[u8] = if len == 0 {
            &[]
        } else if data.is_null() {
            return Err(BrokerError::InvalidArgument("null data pointer".into()));
        } else {
            unsafe { std::slice::from_raw_parts(data, len) }
        };
        BROKER.copy_to_device(handle(token)?, bytes).map(|()| true)
    })
}

/// Copy `size_bytes` from the start of the allocation into `out_buf`, which
/// must hold at least `size_bytes`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn gpubroker_copy_from_device(
    token: u64,
    out_buf: *mut u8,
    size_bytes: usize,
) -> bool {
    guarded("copy_from_device", false, || {
        let out: &mut [u8] = if size_bytes == 0 {
            &mut []
        } else if out_buf.is_null() {
            return Err(BrokerError::InvalidArgument("null output buffer".into()));
        } else {
            unsafe { std::slice::from_raw_parts_mut(out_buf, size_bytes) }
        };
        BROKER.copy_from_device_into(handle(token)?, out).map(|()| true)
    })
}

// ============================================================================
// C ABI: Diagnostics
// ============================================================================

/// Code of the calling thread's last failure (0 when the last call succeeded).
#[unsafe(no_mangle)]
pub extern "C" fn gpubroker_last_error_code() -> i32 {
    LAST_ERROR.with(|slot| slot.borrow().as_ref().map_or(0, |(code, _)| *code))
}

/// Write the calling thread's last error message, NUL-terminated and
/// truncated to `buf_len - 1` bytes. Returns the full message length.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn gpubroker_last_error_message(out_buf: *mut c_char, buf_len: usize) -> usize {
    LAST_ERROR.with(|slot| {
        let slot = slot.borrow();
        let message = slot.as_ref().map_or("", |(_, msg)| msg.as_str());
        if !out_buf.is_null() && buf_len > 0 {
            let copy_len = message.len().min(buf_len - 1);
            unsafe {
                std::ptr::copy_nonoverlapping(message.as_ptr(), out_buf.cast::<u8>(), copy_len);
                *out_buf.add(copy_len) = 0;
            }
        }
        message.len()
    })
}
