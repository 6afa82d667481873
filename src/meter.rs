//! Received-bandwidth accounting.
//!
//! Receive detours run on whatever host thread made the call, so the
//! totals sit behind a mutex. Bytes land in a per-tick window first and
//! roll into the grand total when the tick moves on; the window is what
//! a future rate limiter would throttle against.

use std::sync::{Mutex, PoisonError};

use once_cell::sync::Lazy;
use windows_sys::Win32::Networking::WinSock::SOCKET_ERROR;
use windows_sys::Win32::System::SystemInformation::GetTickCount;

pub struct Meter {
    state: Mutex<MeterState>,
}

struct MeterState {
    now: u32,
    current_bytes: u32,
    last: u32,
    total: u64,
}

impl Meter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MeterState {
                now: unsafe { GetTickCount() },
                current_bytes: 0,
                last: 0,
                total: 0,
            }),
        }
    }

    /// Attribute the result of a receive call. `SOCKET_ERROR` counts as
    /// zero bytes.
    pub fn add(&self, bytes: i32) {
        self.add_at(bytes, unsafe { GetTickCount() });
    }

    fn add_at(&self, bytes: i32, now: u32) {
        let bytes = if bytes == SOCKET_ERROR { 0 } else { bytes as u32 };

        let mut state = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.roll_window(now);
        state.current_bytes += bytes;
    }

    /// Total bytes attributed so far, current window included.
    pub fn total(&self) -> u64 {
        let state = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.total + state.current_bytes as u64
    }
}

impl MeterState {
    fn roll_window(&mut self, now: u32) {
        let delta = now.wrapping_sub(self.now);
        if delta < 1 {
            return;
        }

        let bytes = self.current_bytes;
        self.current_bytes = 0;
        self.total += bytes as u64;

        if crate::debug::is_debug_enabled() {
            crate::debug::note(&format!(
                "meter: {} bytes in {} ms, {} since previous window, total {:#x}",
                bytes,
                delta,
                self.now.wrapping_sub(self.last),
                self.total
            ));
        }

        self.last = self.now;
        self.now = now;
    }
}

impl Default for Meter {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide meter, initialized before any hook is armed and never
/// destroyed.
pub static METER: Lazy<Meter> = Lazy::new(Meter::new);

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Meter {
        let meter = Meter::new();
        meter
            .state
            .lock()
            .unwrap()
            .now = 100;
        meter
    }

    #[test]
    fn adds_exact_byte_count() {
        let meter = fresh();
        meter.add_at(4096, 100);
        assert_eq!(meter.total(), 4096);
    }

    #[test]
    fn socket_error_contributes_nothing() {
        let meter = fresh();
        meter.add_at(4096, 100);
        meter.add_at(SOCKET_ERROR, 100);
        assert_eq!(meter.total(), 4096);
    }

    #[test]
    fn same_tick_accumulates_in_window() {
        let meter = fresh();
        meter.add_at(5, 100);
        meter.add_at(7, 100);
        let state = meter.state.lock().unwrap();
        assert_eq!(state.current_bytes, 12);
        assert_eq!(state.total, 0);
    }

    #[test]
    fn tick_change_rolls_window_into_total() {
        let meter = fresh();
        meter.add_at(10, 100);
        meter.add_at(20, 150);
        let total_now = meter.total();
        let state = meter.state.lock().unwrap();
        assert_eq!(state.total, 10);
        assert_eq!(state.current_bytes, 20);
        assert_eq!(state.last, 100);
        assert_eq!(state.now, 150);
        assert_eq!(total_now, 30);
    }

    #[test]
    fn tick_wraparound_still_rolls() {
        let meter = fresh();
        meter.state.lock().unwrap().now = u32::MAX;
        meter.add_at(3, u32::MAX);
        meter.add_at(4, 1);
        let state = meter.state.lock().unwrap();
        assert_eq!(state.total, 3);
        assert_eq!(state.current_bytes, 4);
    }
}
