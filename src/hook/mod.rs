//! Hook records and the registry of patched entry points.
//!
//! An [`ApiHook`] owns everything needed to arm and disarm one patch: the
//! bytes it overwrote, the trampoline (when the prologue had to be
//! relocated), and the resume address a detour calls through to reach the
//! original function. [`HookSet`] is the fixed collection of records for
//! the intercepted entry points and gives install-all its all-or-nothing
//! behavior.
//!
//! Install and uninstall must be serialized by the caller. The detoured
//! functions themselves are never quiesced; the patch writes are ordered
//! so that a thread racing through the entry point always sees a
//! consistent path (long jump planted before the short jump that reaches
//! it, short jump removed before the long jump is).

pub mod memory;

use std::ffi::CStr;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use windows_sys::Win32::Foundation::HMODULE;

use crate::arch::x86::{
    self, JMP_LONG_LEN, PATCH_LEN, PROLOGUE_COPY_LEN, Prologue,
};
use crate::debug;
use crate::error::{FilterError, Result};
use crate::utils;
use memory::{ProtectionGuard, Trampoline, best_effort_restore};

/// Window saved at attach: `[target-5, target+3)`. Only the first seven
/// bytes are ever rewritten or restored; the eighth rides along so the
/// save spans everything the classifier looked at.
const SAVE_LEN: usize = 8;

/// Trampoline capacity: two relocated prologue bytes plus a long jump,
/// rounded up with slack as the original thunk buffer was.
const THUNK_LEN: usize = 16;

/// One patched entry point.
pub struct ApiHook {
    original: *mut u8,
    resume: *const u8,
    detour: *const u8,
    save: [u8; SAVE_LEN],
    thunk: Option<Trampoline>,
}

// SAFETY: the raw pointers are either null or point at code/buffers whose
// lifetime exceeds the record's; the record carries no thread affinity.
unsafe impl Send for ApiHook {}

impl ApiHook {
    pub fn new() -> Self {
        Self {
            original: ptr::null_mut(),
            resume: ptr::null(),
            detour: ptr::null(),
            save: [0; SAVE_LEN],
            thunk: None,
        }
    }

    /// A record is armed iff it has a resume address.
    pub fn is_armed(&self) -> bool {
        !self.resume.is_null()
    }

    /// Where a call-through must jump to run the original function;
    /// null while disarmed.
    pub fn resume(&self) -> *const u8 {
        self.resume
    }

    /// The replacement the patched entry point jumps to.
    pub fn detour(&self) -> *const u8 {
        self.detour
    }

    /// Base of the relocated-prologue trampoline, when one was needed.
    pub fn trampoline_base(&self) -> Option<*const u8> {
        self.thunk.as_ref().map(|thunk| thunk.base() as *const u8)
    }

    /// Arm the hook: divert `target` to `detour` and work out the resume
    /// address.
    ///
    /// On failure nothing observable has changed: target bytes are only
    /// written after every fallible step has succeeded.
    ///
    /// # Safety
    ///
    /// `target` must be the entry point of a function inside a loaded
    /// module and `detour` a function of identical signature and calling
    /// convention.
    pub unsafe fn attach(&mut self, target: *mut u8, detour: *const u8) -> Result<()> {
        if target.is_null() {
            return Err(FilterError::NullTarget);
        }

        let mut save = [0u8; SAVE_LEN];
        unsafe {
            ptr::copy_nonoverlapping(target.sub(JMP_LONG_LEN), save.as_mut_ptr(), SAVE_LEN)
        };
        debug::log_bytes(&save, "save window");

        let shape = x86::classify(&save[JMP_LONG_LEN..])
            .ok_or(FilterError::UnsupportedPrologue(target as usize))?;

        let (resume, thunk) = match shape {
            Prologue::HotPatch => (unsafe { target.add(2) } as *const u8, None),
            Prologue::PushImm8 => {
                let thunk = unsafe { Self::make_thunk(target) }?;
                (thunk.base() as *const u8, Some(thunk))
            }
        };

        {
            let _writable = unsafe {
                ProtectionGuard::new(target.sub(JMP_LONG_LEN), PATCH_LEN)
            }?;

            // The long jump goes into the padding first; only then does
            // the short jump at the entry point make it reachable. A
            // thread fetching the entry before the final word store just
            // falls through the original NOP.
            unsafe {
                x86::write_jmp_long(target.sub(JMP_LONG_LEN), detour as usize);
                std::sync::atomic::compiler_fence(Ordering::Release);
                x86::write_jmp_short_minus5(target);
            }
        }

        self.original = target;
        self.detour = detour;
        self.save = save;
        self.thunk = thunk;
        self.resume = resume;
        Ok(())
    }

    /// Resolve `name` in `lib` and attach. The record stays disarmed if
    /// resolution fails.
    ///
    /// # Safety
    ///
    /// As for [`ApiHook::attach`]; `lib` must be a loaded module handle.
    pub unsafe fn attach_by_name(
        &mut self,
        detour: *const u8,
        lib: HMODULE,
        name: &CStr,
    ) -> Result<()> {
        let target = match utils::resolve(lib, name) {
            Ok(addr) => addr,
            Err(err) => {
                debug::note(&format!("No function: {}", name.to_string_lossy()));
                return Err(err);
            }
        };

        unsafe { self.attach(target, detour) }.inspect_err(|_| {
            debug::note(&format!("Can't hook: {}", name.to_string_lossy()));
        })
    }

    /// Relocate the two prologue bytes into a fresh trampoline that jumps
    /// back to `target+2`.
    unsafe fn make_thunk(target: *mut u8) -> Result<Trampoline> {
        let thunk = Trampoline::allocate(THUNK_LEN)?;
        unsafe {
            ptr::copy_nonoverlapping(target, thunk.base(), PROLOGUE_COPY_LEN);
            x86::write_jmp_long(
                thunk.base().add(PROLOGUE_COPY_LEN),
                target.add(PROLOGUE_COPY_LEN) as usize,
            );
        }
        thunk.seal()?;
        Ok(thunk)
    }

    /// Disarm: put the saved bytes back and forget the target.
    ///
    /// The restore is best-effort. If the target library has been
    /// unloaded the writes fail without faulting and the record is still
    /// marked disarmed. The short jump at the entry point goes first so
    /// no thread can reach the long-jump bytes while they are being
    /// rewritten; the trampoline is kept allocated in case a call is
    /// still in flight through it.
    pub fn unhook(&mut self) {
        if !self.is_armed() {
            return;
        }

        debug::log_bytes(&self.save[..PATCH_LEN], "restore window");

        unsafe {
            if best_effort_restore(
                self.original,
                &self.save[JMP_LONG_LEN..JMP_LONG_LEN + 2],
            ) {
                best_effort_restore(
                    self.original.sub(JMP_LONG_LEN),
                    &self.save[..JMP_LONG_LEN],
                );
            }
        }

        self.original = ptr::null_mut();
        self.resume = ptr::null();
    }
}

impl Default for ApiHook {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ApiHook {
    fn drop(&mut self) {
        self.unhook();
    }
}

/// What to patch: a symbol name, the detour that replaces it, and the
/// process-wide slot its resume address is published through.
pub struct HookSpec {
    pub name: &'static CStr,
    pub detour: *const u8,
    pub resume_slot: &'static AtomicUsize,
}

// SAFETY: `detour` is a 'static function pointer; specs are shared
// read-only tables.
unsafe impl Sync for HookSpec {}

/// The fixed set of hook records for the intercepted entry points.
///
/// Invariant: after any public operation either every requested hook is
/// armed or none is.
pub struct HookSet {
    records: Vec<(ApiHook, &'static AtomicUsize)>,
}

impl HookSet {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.records.iter().any(|(hook, _)| hook.is_armed())
    }

    /// Attach every spec in turn. The first failure unhooks whatever had
    /// armed and reports the error; on success all resume slots are
    /// published.
    ///
    /// # Safety
    ///
    /// `lib` must be a loaded module handle and every spec's detour must
    /// match its target's signature. The caller serializes install and
    /// uninstall.
    pub unsafe fn install(&mut self, lib: HMODULE, specs: &[HookSpec]) -> Result<()> {
        for spec in specs {
            let armed = utils::resolve(lib, spec.name)
                .inspect_err(|_| {
                    debug::note(&format!("No function: {}", spec.name.to_string_lossy()));
                })
                .and_then(|target| {
                    unsafe { self.attach_target(target, spec.detour, spec.resume_slot) }
                        .inspect_err(|_| {
                            debug::note(&format!(
                                "Can't hook: {}",
                                spec.name.to_string_lossy()
                            ));
                        })
                });

            if let Err(err) = armed {
                self.uninstall();
                return Err(FilterError::HookFailed(format!(
                    "{}: {}",
                    spec.name.to_string_lossy(),
                    err
                )));
            }
        }
        Ok(())
    }

    /// Attach a record directly to a known address; install uses this
    /// once a spec's symbol resolves.
    pub(crate) unsafe fn attach_target(
        &mut self,
        target: *mut u8,
        detour: *const u8,
        slot: &'static AtomicUsize,
    ) -> Result<()> {
        let mut hook = ApiHook::new();
        unsafe { hook.attach(target, detour) }?;
        slot.store(hook.resume() as usize, Ordering::Release);
        self.records.push((hook, slot));
        Ok(())
    }

    /// Unhook every record unconditionally and clear the published
    /// resume slots. Bytes go back before a slot is zeroed: a call
    /// already inside a detour keeps a usable resume address, and new
    /// calls take the restored entry point directly.
    pub fn uninstall(&mut self) {
        for (hook, slot) in self.records.iter_mut().rev() {
            hook.unhook();
            slot.store(0, Ordering::Release);
        }
        self.records.clear();
    }
}

impl Default for HookSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A patch target needs five writable bytes ahead of its entry point,
    // like the padding the real loader leaves before hot-patchable
    // functions, and word alignment for the entry-point store. The
    // buffers are data-only; nothing here ever executes the patched
    // bytes.
    fn synthetic_target(prologue: &[u8]) -> (Trampoline, *mut u8) {
        let buf = Trampoline::allocate(64).unwrap();
        unsafe {
            ptr::write_bytes(buf.base(), 0xcc, 6);
            ptr::copy_nonoverlapping(prologue.as_ptr(), buf.base().add(6), prologue.len());
        }
        let target = unsafe { buf.base().add(6) };
        (buf, target)
    }

    fn snapshot(target: *mut u8) -> [u8; 16] {
        let mut out = [0u8; 16];
        unsafe { ptr::copy_nonoverlapping(target.sub(5), out.as_mut_ptr(), 16) };
        out
    }

    extern "system" fn dummy_detour() {}

    #[test]
    fn attach_hot_patch_prologue() {
        let (_buf, target) = synthetic_target(&[0x8b, 0xff, 0x55, 0x8b, 0xec]);
        let before = snapshot(target);

        let mut hook = ApiHook::new();
        unsafe { hook.attach(target, dummy_detour as *const u8) }.unwrap();

        assert!(hook.is_armed());
        assert_eq!(hook.resume() as usize, target as usize + 2);
        assert_eq!(hook.detour(), dummy_detour as *const u8);
        assert_eq!(hook.trampoline_base(), None);

        let after = snapshot(target);
        // Long jump in the padding, aimed at the detour.
        assert_eq!(after[0], 0xe9);
        let disp = u32::from_le_bytes([after[1], after[2], after[3], after[4]]);
        let expect =
            (dummy_detour as usize).wrapping_sub(target as usize) as u32;
        assert_eq!(disp, expect);
        // Short jump back onto it in the NOP slot.
        assert_eq!(&after[5..7], &[0xeb, 0xf9]);
        // Bytes past the patch window untouched.
        assert_eq!(&after[7..], &before[7..]);

        hook.unhook();
        assert!(!hook.is_armed());
        assert_eq!(snapshot(target), before);
    }

    #[test]
    fn attach_push_imm8_prologue() {
        let (_buf, target) = synthetic_target(&[0x6a, 0x18, 0x68, 0x10, 0x20, 0x30, 0x40]);
        let before = snapshot(target);

        let mut hook = ApiHook::new();
        unsafe { hook.attach(target, dummy_detour as *const u8) }.unwrap();

        // Resume goes through the trampoline, not the entry point.
        let resume = hook.resume();
        assert!(!resume.is_null());
        assert_ne!(resume as usize, target as usize + 2);
        assert_eq!(hook.trampoline_base(), Some(resume));

        let thunk = unsafe { std::slice::from_raw_parts(resume, 7) };
        assert_eq!(&thunk[..2], &[0x6a, 0x18]);
        assert_eq!(thunk[2], 0xe9);
        let disp = u32::from_le_bytes([thunk[3], thunk[4], thunk[5], thunk[6]]);
        let expect = (target as usize + 2)
            .wrapping_sub(resume as usize + 7) as u32;
        assert_eq!(disp, expect);

        hook.unhook();
        assert_eq!(snapshot(target), before);
    }

    #[test]
    fn attach_rejects_unknown_prologue() {
        // push ebp; mov ebp, esp: a frame-pointer prologue the engine
        // must not try to displace.
        let (_buf, target) = synthetic_target(&[0x55, 0x8b, 0xec]);
        let before = snapshot(target);

        let mut hook = ApiHook::new();
        let err = unsafe { hook.attach(target, dummy_detour as *const u8) };
        assert!(matches!(err, Err(FilterError::UnsupportedPrologue(_))));
        assert!(!hook.is_armed());
        assert_eq!(snapshot(target), before);
    }

    #[test]
    fn attach_rejects_null_target() {
        let mut hook = ApiHook::new();
        let err = unsafe { hook.attach(ptr::null_mut(), dummy_detour as *const u8) };
        assert!(matches!(err, Err(FilterError::NullTarget)));
    }

    #[test]
    fn unhook_twice_is_a_no_op() {
        let (_buf, target) = synthetic_target(&[0x8b, 0xff, 0x55]);
        let mut hook = ApiHook::new();
        unsafe { hook.attach(target, dummy_detour as *const u8) }.unwrap();
        hook.unhook();
        let restored = snapshot(target);
        hook.unhook();
        assert_eq!(snapshot(target), restored);
    }

    static SLOT_A: AtomicUsize = AtomicUsize::new(0);
    static SLOT_B: AtomicUsize = AtomicUsize::new(0);

    #[test]
    fn set_uninstall_restores_every_target() {
        let (_a, target_a) = synthetic_target(&[0x8b, 0xff, 0x55]);
        let (_b, target_b) = synthetic_target(&[0x6a, 0x08, 0x68]);
        let before_a = snapshot(target_a);
        let before_b = snapshot(target_b);

        let mut set = HookSet::new();
        unsafe {
            set.attach_target(target_a, dummy_detour as *const u8, &SLOT_A)
                .unwrap();
            set.attach_target(target_b, dummy_detour as *const u8, &SLOT_B)
                .unwrap();
        }
        assert!(set.is_armed());
        assert_ne!(SLOT_A.load(Ordering::Acquire), 0);
        assert_ne!(SLOT_B.load(Ordering::Acquire), 0);

        set.uninstall();
        assert!(!set.is_armed());
        assert_eq!(SLOT_A.load(Ordering::Acquire), 0);
        assert_eq!(SLOT_B.load(Ordering::Acquire), 0);
        assert_eq!(snapshot(target_a), before_a);
        assert_eq!(snapshot(target_b), before_b);
    }

    static SLOT_D: AtomicUsize = AtomicUsize::new(0);

    #[test]
    fn install_fails_cleanly_on_unresolved_symbol() {
        let lib = utils::library_handle("KERNEL32.DLL").unwrap();
        let specs = [HookSpec {
            name: c"NoSuchSocketExport",
            detour: dummy_detour as usize as *const u8,
            resume_slot: &SLOT_D,
        }];

        let mut set = HookSet::new();
        let err = unsafe { set.install(lib, &specs) };
        match err {
            Err(FilterError::HookFailed(detail)) => {
                assert!(detail.contains("NoSuchSocketExport"));
            }
            other => panic!("expected HookFailed, got {:?}", other),
        }
        assert!(!set.is_armed());
        assert_eq!(SLOT_D.load(Ordering::Acquire), 0);
    }

    static SLOT_C: AtomicUsize = AtomicUsize::new(0);

    #[test]
    fn failed_install_rolls_back_armed_records() {
        let (_a, target_a) = synthetic_target(&[0x8b, 0xff, 0x55]);
        let (_b, target_b) = synthetic_target(&[0x55, 0x8b, 0xec]);
        let before_a = snapshot(target_a);
        let before_b = snapshot(target_b);

        let mut set = HookSet::new();
        unsafe {
            set.attach_target(target_a, dummy_detour as *const u8, &SLOT_C)
                .unwrap();
            let err = set.attach_target(target_b, dummy_detour as *const u8, &SLOT_C);
            assert!(err.is_err());
        }

        // install() unwinds by uninstalling everything that armed.
        set.uninstall();
        assert_eq!(SLOT_C.load(Ordering::Acquire), 0);
        assert_eq!(snapshot(target_a), before_a);
        assert_eq!(snapshot(target_b), before_b);
    }
}
