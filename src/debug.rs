//! Diagnostics over the debugger channel.
//!
//! A filter DLL has no console of its own, so notices go to
//! `OutputDebugStringA` where a attached debugger or DbgView can pick
//! them up. Routine notices are always emitted; anything chattier sits
//! behind the process-wide debug flag.

use std::sync::atomic::{AtomicBool, Ordering};

use windows_sys::Win32::System::Diagnostics::Debug::OutputDebugStringA;

pub static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

pub fn enable_debug() {
    DEBUG_ENABLED.store(true, Ordering::Relaxed);
}

pub fn is_debug_enabled() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Emit a one-line notice to the debugger channel.
pub fn note(message: &str) {
    let mut line = Vec::with_capacity(message.len() + 3);
    line.extend_from_slice(message.as_bytes());
    line.extend_from_slice(b"\r\n\0");
    unsafe { OutputDebugStringA(line.as_ptr()) };
}

/// Emit a notice only when the debug flag is up.
pub fn trace(message: &str) {
    if is_debug_enabled() {
        note(message);
    }
}

/// Dump a small byte window to the debugger channel, flag permitting.
#[cfg(feature = "debug")]
pub fn log_bytes(data: &[u8], mark: &str) {
    if !is_debug_enabled() {
        return;
    }

    let mut line = String::with_capacity(mark.len() + 1 + data.len() * 3);
    line.push_str(mark);
    line.push(':');
    for byte in data {
        line.push_str(&format!(" {:02x}", byte));
    }
    note(&line);
}

#[cfg(not(feature = "debug"))]
pub fn log_bytes(_data: &[u8], _mark: &str) {}
