//! C entry points for managed code. Every function takes the service pointer the launcher handed
//! to the runtime; a null service pointer makes the call a no-op.
use std::{
    ffi::{c_char, c_void, CStr, OsStr},
    os::unix::ffi::OsStrExt,
    path::Path,
};

use crate::service::HotReloadService;

/// The stats record as seen from C.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HotReloadStatsRaw {
    pub start_epoch: i64,
    pub end_epoch: i64,
    pub rebound_symbols: u64,
    pub successful: bool,
}

static_assertions::const_assert_eq!(std::mem::size_of::<HotReloadStatsRaw>(), 32);

/// Reload the object or library at `path`. Returns whether the reload succeeded.
///
/// # Safety
/// `service` must be null or point to a live service, and `path` must be null or a valid C
/// string.
#[no_mangle]
pub unsafe extern "C" fn hotreload_service_request(
    service: *const HotReloadService,
    path: *const c_char,
) -> bool {
    let (Some(service), false) = (service.as_ref(), path.is_null()) else {
        return false;
    };
    let path = Path::new(OsStr::from_bytes(CStr::from_ptr(path).to_bytes()));
    service.request_reload(path)
}

struct CallbackData(*mut c_void);

// Safety: the pointer is only handed back to the callback its owner registered with it.
unsafe impl Send for CallbackData {}
unsafe impl Sync for CallbackData {}

/// Register `callback`, to be called with `data` after every successful reload. A null callback
/// clears the registration.
///
/// # Safety
/// `service` must be null or point to a live service. `callback` must be safe to call from the
/// thread that performs reloads, for as long as it stays registered.
#[no_mangle]
pub unsafe extern "C" fn hotreload_service_set_success_callback(
    service: *const HotReloadService,
    callback: Option<unsafe extern "C" fn(*mut c_void)>,
    data: *mut c_void,
) {
    let Some(service) = service.as_ref() else {
        return;
    };
    match callback {
        Some(callback) => {
            let data = CallbackData(data);
            service.set_success_callback(move || {
                let data = &data;
                unsafe { callback(data.0) }
            });
        }
        None => service.clear_success_callback(),
    }
}

/// Copy the current stats record into `out`.
///
/// # Safety
/// `service` must be null or point to a live service; `out` must be null or writable.
#[no_mangle]
pub unsafe extern "C" fn hotreload_service_stats(
    service: *const HotReloadService,
    out: *mut HotReloadStatsRaw,
) -> bool {
    let (Some(service), Some(out)) = (service.as_ref(), out.as_mut()) else {
        return false;
    };
    let stats = service.stats();
    *out = HotReloadStatsRaw {
        start_epoch: stats.start_epoch,
        end_epoch: stats.end_epoch,
        rebound_symbols: stats.rebound_symbols as u64,
        successful: stats.successful,
    };
    true
}

/// Copy the path of the most recently reloaded object into `buf`, NUL-terminated and truncated
/// to fit. Returns the full length of the path, excluding the terminator.
///
/// # Safety
/// `service` must be null or point to a live service; `buf` must be null or point to `len`
/// writable bytes.
#[no_mangle]
pub unsafe extern "C" fn hotreload_service_loaded_library(
    service: *const HotReloadService,
    buf: *mut c_char,
    len: usize,
) -> usize {
    let Some(service) = service.as_ref() else {
        return 0;
    };
    let path = service.stats().loaded_library;
    if !buf.is_null() && len > 0 {
        let n = path.len().min(len - 1);
        std::ptr::copy_nonoverlapping(path.as_ptr() as *const c_char, buf, n);
        *buf.add(n) = 0;
    }
    path.len()
}
