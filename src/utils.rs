//! Module-handle helpers for the target sockets library.

use std::ffi::CStr;

use widestring::U16CString;
use windows_sys::Win32::Foundation::HMODULE;
use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows_sys::Win32::System::Threading::Sleep;

use crate::error::{FilterError, Result};

/// Handle of an already-loaded module, without adding a reference.
pub fn library_handle(name: &str) -> Option<HMODULE> {
    let wide = U16CString::from_str(name).ok()?;
    let handle = unsafe { GetModuleHandleW(wide.as_ptr()) };
    if handle.is_null() { None } else { Some(handle) }
}

pub fn is_library_loaded(name: &str) -> bool {
    library_handle(name).is_some()
}

/// Block until `name` is loaded into the process, polling at a coarse
/// cadence so the host's own startup is left alone. Nothing may be
/// patched before the target is observable.
pub fn wait_for_library(name: &str) -> HMODULE {
    loop {
        if let Some(handle) = library_handle(name) {
            return handle;
        }
        unsafe { Sleep(1000) };
    }
}

/// Resolve an exported symbol to its entry address.
pub fn resolve(lib: HMODULE, name: &CStr) -> Result<*mut u8> {
    match unsafe { GetProcAddress(lib, name.as_ptr() as *const u8) } {
        Some(proc) => Ok(proc as usize as *mut u8),
        None => Err(FilterError::SymbolNotFound(
            name.to_string_lossy().into_owned(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel32_is_always_loaded() {
        assert!(is_library_loaded("KERNEL32.DLL"));
        assert!(!is_library_loaded("no-such-module.dll"));
    }

    #[test]
    fn resolve_known_and_unknown_symbols() {
        let lib = library_handle("KERNEL32.DLL").unwrap();
        assert!(resolve(lib, c"GetTickCount").is_ok());
        assert!(matches!(
            resolve(lib, c"NoSuchExport"),
            Err(FilterError::SymbolNotFound(_))
        ));
    }
}
