#![doc = include_str!("../README.md")]

pub mod arch;
pub mod debug;
pub mod detours;
pub mod error;
pub mod glob;
pub mod hook;
pub mod meter;
pub mod rules;
pub mod utils;

use std::ffi::c_void;
use std::ptr;
use std::sync::{Mutex, PoisonError};

use once_cell::sync::Lazy;
use widestring::U16CStr;
use windows_sys::Win32::Foundation::{BOOL, FreeLibrary, HMODULE, TRUE};
use windows_sys::Win32::System::LibraryLoader::{
    GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS, GetModuleHandleExW,
};
use windows_sys::Win32::System::SystemServices::DLL_PROCESS_DETACH;

use hook::HookSet;

/// The one library this module reaches into.
const TARGET_LIBRARY: &str = "WS2_32.DLL";

/// Install succeeded, or an already-armed filter re-bound its rules.
const INSTALL_OK: i32 = 1;
/// The rule string failed to parse; prior rules remain in force.
const INSTALL_PARSE_FAILED: i32 = 0;
/// Hook installation failed and was fully rolled back.
const INSTALL_HOOK_FAILED: i32 = -1;

struct FilterState {
    hooks: HookSet,
    /// The extra load reference this module holds on itself once armed,
    /// so the injecting process can drop its own.
    pin: HMODULE,
}

// SAFETY: `pin` is a module handle, not thread-affine data; the hook
// set is only touched under the state lock.
unsafe impl Send for FilterState {}

static STATE: Lazy<Mutex<FilterState>> = Lazy::new(|| {
    Mutex::new(FilterState {
        hooks: HookSet::new(),
        pin: ptr::null_mut(),
    })
});

/// Install the filter, or re-bind the rules if it is already armed.
///
/// First installation waits for the target sockets library to appear in
/// the process (nothing is touched before it is observable), installs
/// the rules, then arms the six hooks atomically. Any hook failure
/// rolls back every hook that had armed. Once armed the module pins
/// itself in memory.
pub fn install_filter(rules_text: &str) -> i32 {
    let mut state = STATE.lock().unwrap_or_else(PoisonError::into_inner);

    if state.hooks.is_armed() {
        return match rules::install(rules_text) {
            Ok(()) => INSTALL_OK,
            Err(_) => INSTALL_PARSE_FAILED,
        };
    }

    let ws2 = utils::wait_for_library(TARGET_LIBRARY);

    if let Err(err) = rules::install(rules_text) {
        debug::note(&format!("Rule install failed: {}", err));
        return INSTALL_PARSE_FAILED;
    }

    let specs = detours::hook_specs();
    match unsafe { state.hooks.install(ws2, &specs) } {
        Ok(()) => {
            debug::note("SteamFilter hook attached");
            state.pin = pin_self();
            INSTALL_OK
        }
        Err(err) => {
            debug::note(&format!("SteamFilter hook failed: {}", err));
            INSTALL_HOOK_FAILED
        }
    }
}

/// Detach all hooks and release the self-pin. Returns 1 if a pin
/// existed, 0 otherwise; the module actually unloads when the caller
/// drops its own reference.
pub fn unload_filter() -> i32 {
    let mut state = STATE.lock().unwrap_or_else(PoisonError::into_inner);

    if state.pin.is_null() {
        return 0;
    }

    state.hooks.uninstall();
    debug::note("SteamFilter unhooked");

    unsafe { FreeLibrary(state.pin) };
    state.pin = ptr::null_mut();
    1
}

/// Process-detach cleanup: put the patched bytes back if anything is
/// still armed. The sockets library may already be gone; the restore is
/// best-effort by construction and cannot fault the host.
fn detach_cleanup() {
    let mut state = STATE.lock().unwrap_or_else(PoisonError::into_inner);
    if state.hooks.is_armed() {
        state.hooks.uninstall();
        debug::note("SteamFilter unhooked");
    }
}

/// Take an extra load reference on this module, keyed off one of its
/// own code addresses.
fn pin_self() -> HMODULE {
    let mut module: HMODULE = ptr::null_mut();
    unsafe {
        GetModuleHandleExW(
            GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
            SteamFilter as usize as *const u16,
            &mut module,
        );
    }
    module
}

/// The injection shim's entry point: install the filter with the given
/// wide-character rule string, or re-bind the rules of an armed filter.
///
/// # Safety
///
/// `address` must be null or a valid NUL-terminated wide string. The
/// out-parameters are accepted for shim compatibility and not written.
#[unsafe(no_mangle)]
pub unsafe extern "system" fn SteamFilter(
    address: *const u16,
    _result: *mut u16,
    _result_size: *mut usize,
) -> i32 {
    let rules_text = if address.is_null() {
        String::new()
    } else {
        unsafe { U16CStr::from_ptr_str(address) }.to_string_lossy()
    };

    install_filter(&rules_text)
}

/// Explicit unload entry point for the injection shim.
///
/// # Safety
///
/// Callable from any thread; the caller must still hold its own
/// reference on this module while the call runs.
#[unsafe(no_mangle)]
pub unsafe extern "system" fn FilterUnload() -> i32 {
    unload_filter()
}

#[unsafe(no_mangle)]
pub unsafe extern "system" fn DllMain(
    _instance: HMODULE,
    reason: u32,
    _reserved: *mut c_void,
) -> BOOL {
    if reason == DLL_PROCESS_DETACH {
        detach_cleanup();
    }
    TRUE
}
