use std::ffi::c_void;
use std::ptr;

use windows_sys::Win32::System::Diagnostics::Debug::{FlushInstructionCache, WriteProcessMemory};
use windows_sys::Win32::System::Memory::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE,
    PAGE_PROTECTION_FLAGS, PAGE_READWRITE, VirtualAlloc, VirtualFree, VirtualProtect,
};
use windows_sys::Win32::System::Threading::GetCurrentProcess;

use crate::error::{FilterError, Result};

/// Makes a span of target bytes writable for the lifetime of the guard,
/// then puts the old protection back and flushes the instruction cache.
pub struct ProtectionGuard {
    address: *mut u8,
    width: usize,
    old: PAGE_PROTECTION_FLAGS,
}

impl ProtectionGuard {
    pub unsafe fn new(address: *mut u8, width: usize) -> Result<Self> {
        if address.is_null() || width == 0 {
            return Err(FilterError::NullTarget);
        }

        let mut old: PAGE_PROTECTION_FLAGS = 0;
        let ok = unsafe {
            VirtualProtect(
                address as *const c_void,
                width,
                PAGE_EXECUTE_READWRITE,
                &mut old,
            )
        };
        if ok == 0 {
            let err = std::io::Error::last_os_error();
            return Err(FilterError::MemoryProtection(format!("{}", err)));
        }

        Ok(Self { address, width, old })
    }
}

impl Drop for ProtectionGuard {
    fn drop(&mut self) {
        unsafe {
            let mut scratch: PAGE_PROTECTION_FLAGS = 0;
            VirtualProtect(
                self.address as *const c_void,
                self.width,
                self.old,
                &mut scratch,
            );
            FlushInstructionCache(
                GetCurrentProcess(),
                self.address as *const c_void,
                self.width,
            );
        }
    }
}

/// A small private executable buffer for relocated prologue bytes.
///
/// Committed read-write, filled, then sealed execute-read; freed with the
/// owning hook record.
pub struct Trampoline {
    base: *mut u8,
    size: usize,
}

impl Trampoline {
    pub fn allocate(size: usize) -> Result<Self> {
        let base = unsafe {
            VirtualAlloc(ptr::null(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
        };
        if base.is_null() {
            let err = std::io::Error::last_os_error();
            return Err(FilterError::TrampolineAlloc(format!("{}", err)));
        }

        Ok(Self {
            base: base as *mut u8,
            size,
        })
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn seal(&self) -> Result<()> {
        let mut old: PAGE_PROTECTION_FLAGS = 0;
        let ok = unsafe {
            VirtualProtect(self.base as *const c_void, self.size, PAGE_EXECUTE_READ, &mut old)
        };
        if ok == 0 {
            let err = std::io::Error::last_os_error();
            return Err(FilterError::MemoryProtection(format!("{}", err)));
        }

        unsafe {
            FlushInstructionCache(GetCurrentProcess(), self.base as *const c_void, self.size);
        }
        Ok(())
    }
}

impl Drop for Trampoline {
    fn drop(&mut self) {
        unsafe {
            VirtualFree(self.base as *mut c_void, 0, MEM_RELEASE);
        }
    }
}

// A Trampoline is only handed out whole and never aliased mutably after
// sealing, so moving it between threads is fine.
unsafe impl Send for Trampoline {}

/// Copy `bytes` over possibly-unmapped code, reporting failure instead of
/// faulting. The target library may already have been unloaded when a
/// restore runs; both the protection change and the kernel-mediated copy
/// fail with an error in that case, which is exactly the containment the
/// caller wants.
pub unsafe fn best_effort_restore(dest: *mut u8, bytes: &[u8]) -> bool {
    let mut old: PAGE_PROTECTION_FLAGS = 0;
    let ok = unsafe {
        VirtualProtect(
            dest as *const c_void,
            bytes.len(),
            PAGE_EXECUTE_READWRITE,
            &mut old,
        )
    };
    if ok == 0 {
        return false;
    }

    let written = unsafe {
        WriteProcessMemory(
            GetCurrentProcess(),
            dest as *const c_void,
            bytes.as_ptr() as *const c_void,
            bytes.len(),
            ptr::null_mut(),
        )
    };

    unsafe {
        let mut scratch: PAGE_PROTECTION_FLAGS = 0;
        VirtualProtect(dest as *const c_void, bytes.len(), old, &mut scratch);
        FlushInstructionCache(GetCurrentProcess(), dest as *const c_void, bytes.len());
    }

    written != 0
}
