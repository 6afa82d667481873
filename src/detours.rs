//! The thin wrappers installed over the Winsock entry points.
//!
//! Each body runs on whichever host thread made the original call; it
//! consults the rule set (connect, gethostbyname) or tallies bytes into
//! the meter (the receive family) and then calls through the resume
//! address published by the hook registry. A detour never blocks beyond
//! what the underlying call would have, and never reports an error the
//! original API could not have produced itself.

use std::ffi::CStr;
use std::mem;
use std::net::Ipv4Addr;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use windows_sys::Win32::Foundation::{BOOL, SetLastError};
use windows_sys::Win32::Networking::WinSock::{
    AF_INET, HOSTENT, LPWSAOVERLAPPED_COMPLETION_ROUTINE, MSG_PEEK, SOCKADDR, SOCKADDR_IN,
    SOCKET, SOCKET_ERROR, WSABUF, WSAECONNREFUSED, WSAHOST_NOT_FOUND,
};
use windows_sys::Win32::System::IO::OVERLAPPED;

use crate::debug;
use crate::hook::HookSpec;
use crate::meter::METER;
use crate::rules::{self, Action};

type ConnectFn = unsafe extern "system" fn(SOCKET, *const SOCKADDR, i32) -> i32;
type GetHostFn = unsafe extern "system" fn(*const u8) -> *mut HOSTENT;
type RecvFn = unsafe extern "system" fn(SOCKET, *mut u8, i32, i32) -> i32;
type RecvFromFn =
    unsafe extern "system" fn(SOCKET, *mut u8, i32, i32, *mut SOCKADDR, *mut i32) -> i32;
type WsaRecvFn = unsafe extern "system" fn(
    SOCKET,
    *const WSABUF,
    u32,
    *mut u32,
    *mut u32,
    *mut OVERLAPPED,
    LPWSAOVERLAPPED_COMPLETION_ROUTINE,
) -> i32;
type WsaGetOverlappedFn =
    unsafe extern "system" fn(SOCKET, *const OVERLAPPED, *mut u32, BOOL, *mut u32) -> BOOL;

// Resume addresses, published by the registry when a hook arms and
// cleared after it disarms. A zero slot means the patch is (or is about
// to be) gone, so there is no original to reach.
static CONNECT_RESUME: AtomicUsize = AtomicUsize::new(0);
static GETHOST_RESUME: AtomicUsize = AtomicUsize::new(0);
static RECV_RESUME: AtomicUsize = AtomicUsize::new(0);
static RECVFROM_RESUME: AtomicUsize = AtomicUsize::new(0);
static WSA_RECV_RESUME: AtomicUsize = AtomicUsize::new(0);
static WSA_GET_OVERLAPPED_RESUME: AtomicUsize = AtomicUsize::new(0);

fn resume(slot: &AtomicUsize) -> usize {
    slot.load(Ordering::Acquire)
}

/// connect(): veto or redirect IPv4 destinations per the rule set.
pub unsafe extern "system" fn connect_detour(
    s: SOCKET,
    name: *const SOCKADDR,
    namelen: i32,
) -> i32 {
    let forward = resume(&CONNECT_RESUME);
    if forward == 0 {
        return SOCKET_ERROR;
    }
    let forward: ConnectFn = unsafe { mem::transmute(forward) };

    if name.is_null() || unsafe { (*name).sa_family } != AF_INET {
        return unsafe { forward(s, name, namelen) };
    }

    let base = name as *const SOCKADDR_IN;
    let addr = Ipv4Addr::from(u32::from_be(unsafe { (*base).sin_addr.S_un.S_addr }));
    let port = u16::from_be(unsafe { (*base).sin_port });

    match rules::active().match_endpoint(addr, port) {
        None | Some(Action::Passthrough) => unsafe { forward(s, name, namelen) },
        Some(Action::Deny) => {
            debug::note("Connect refused");
            unsafe { SetLastError(WSAECONNREFUSED as u32) };
            SOCKET_ERROR
        }
        Some(Action::Rewrite {
            addr: new_addr,
            port: new_port,
        }) => {
            debug::note("Connect redirected");

            // Rewrite into a local copy so the caller's buffer comes
            // back byte-unchanged.
            let mut temp: SOCKADDR_IN = unsafe { *base };
            if let Some(addr) = new_addr {
                temp.sin_addr.S_un.S_addr = u32::from(addr).to_be();
            }
            if let Some(port) = new_port {
                temp.sin_port = port.to_be();
            }

            unsafe {
                forward(
                    s,
                    &temp as *const SOCKADDR_IN as *const SOCKADDR,
                    mem::size_of::<SOCKADDR_IN>() as i32,
                )
            }
        }
    }
}

static CANONICAL_NAME: &CStr = c"remapped.local";

// Backing storage for the fabricated lookup result. The legacy API's
// own storage is per-process at best, so callers already tolerate the
// last-writer-wins behavior this shares with it.
static mut DNS_ADDR: u32 = 0;
static mut DNS_ADDR_LIST: [*mut u8; 2] = [ptr::null_mut(), ptr::null_mut()];
static mut DNS_RESULT: HOSTENT = HOSTENT {
    h_name: ptr::null_mut(),
    h_aliases: ptr::null_mut(),
    h_addrtype: 0,
    h_length: 0,
    h_addr_list: ptr::null_mut(),
};

/// Build the single-address IPv4 response handed out in place of a real
/// lookup.
fn fabricate_host_entry(addr: Ipv4Addr) -> *mut HOSTENT {
    unsafe {
        DNS_ADDR = u32::from(addr).to_be();
        DNS_ADDR_LIST = [(&raw mut DNS_ADDR) as *mut u8, ptr::null_mut()];
        DNS_RESULT = HOSTENT {
            h_name: CANONICAL_NAME.as_ptr() as *mut u8,
            h_aliases: ptr::null_mut(),
            h_addrtype: AF_INET as i16,
            h_length: mem::size_of::<u32>() as i16,
            h_addr_list: (&raw mut DNS_ADDR_LIST) as *mut *mut i8,
        };
        &raw mut DNS_RESULT
    }
}

/// gethostbyname(): answer, refuse, or forward a legacy name lookup.
pub unsafe extern "system" fn gethostbyname_detour(name: *const u8) -> *mut HOSTENT {
    let forward = resume(&GETHOST_RESUME);
    if forward == 0 {
        return ptr::null_mut();
    }
    let forward: GetHostFn = unsafe { mem::transmute(forward) };

    if name.is_null() {
        return unsafe { forward(name) };
    }
    let host = unsafe { CStr::from_ptr(name.cast()) }.to_string_lossy();

    match rules::active().match_name(&host) {
        None
        | Some(Action::Passthrough)
        | Some(Action::Rewrite { addr: None, .. }) => unsafe { forward(name) },
        Some(Action::Deny) => {
            debug::note("gethostbyname refused");
            // The classic API reports through the thread error slot;
            // this is the error number resolvers look for.
            unsafe { SetLastError(WSAHOST_NOT_FOUND as u32) };
            ptr::null_mut()
        }
        Some(Action::Rewrite {
            addr: Some(addr), ..
        }) => {
            debug::note("gethostbyname redirected");
            fabricate_host_entry(addr)
        }
    }
}

/// recv(): forward and meter the received bytes.
pub unsafe extern "system" fn recv_detour(s: SOCKET, buf: *mut u8, len: i32, flags: i32) -> i32 {
    let forward = resume(&RECV_RESUME);
    if forward == 0 {
        return SOCKET_ERROR;
    }
    let forward: RecvFn = unsafe { mem::transmute(forward) };

    let result = unsafe { forward(s, buf, len, flags) };
    METER.add(result);
    result
}

/// recvfrom(): forward and meter the received bytes.
pub unsafe extern "system" fn recvfrom_detour(
    s: SOCKET,
    buf: *mut u8,
    len: i32,
    flags: i32,
    from: *mut SOCKADDR,
    fromlen: *mut i32,
) -> i32 {
    let forward = resume(&RECVFROM_RESUME);
    if forward == 0 {
        return SOCKET_ERROR;
    }
    let forward: RecvFromFn = unsafe { mem::transmute(forward) };

    let result = unsafe { forward(s, buf, len, flags, from, fromlen) };
    METER.add(result);
    result
}

/// WSARecv(): forward and meter, minding the overlapped cases.
pub unsafe extern "system" fn wsa_recv_detour(
    s: SOCKET,
    buffers: *const WSABUF,
    count: u32,
    received: *mut u32,
    flags: *mut u32,
    overlapped: *mut OVERLAPPED,
    handler: LPWSAOVERLAPPED_COMPLETION_ROUTINE,
) -> i32 {
    let forward = resume(&WSA_RECV_RESUME);
    if forward == 0 {
        return SOCKET_ERROR;
    }
    let forward: WsaRecvFn = unsafe { mem::transmute(forward) };

    if !overlapped.is_null() || handler.is_some() {
        let result =
            unsafe { forward(s, buffers, count, received, flags, overlapped, handler) };

        // Zero means the call completed synchronously and the
        // transferred length is already posted in the overlapped block.
        if result == 0 && !overlapped.is_null() {
            METER.add(unsafe { (*overlapped).InternalHigh } as i32);
        }
        return result;
    }

    // A peek hands back bytes that a later receive will deliver again;
    // counting it would double-bill the caller.
    let ignore = !flags.is_null() && unsafe { *flags } & MSG_PEEK as u32 != 0;

    let result = unsafe { forward(s, buffers, count, received, flags, overlapped, handler) };
    if result != SOCKET_ERROR && !ignore && !received.is_null() {
        METER.add(unsafe { *received } as i32);
    }
    result
}

/// WSAGetOverlappedResult(): forward untouched. Attributing completed
/// lengths here would double-count against what the WSARecv path
/// already tallies, so until overlapped completions are tracked as a
/// whole this stays a pure pass-through.
pub unsafe extern "system" fn wsa_get_overlapped_result_detour(
    s: SOCKET,
    overlapped: *const OVERLAPPED,
    length: *mut u32,
    wait: BOOL,
    flags: *mut u32,
) -> BOOL {
    let forward = resume(&WSA_GET_OVERLAPPED_RESUME);
    if forward == 0 {
        return 0;
    }
    let forward: WsaGetOverlappedFn = unsafe { mem::transmute(forward) };

    unsafe { forward(s, overlapped, length, wait, flags) }
}

/// The six entry points the registry patches, with the slots their
/// resume addresses are published through.
pub fn hook_specs() -> [HookSpec; 6] {
    [
        HookSpec {
            name: c"connect",
            detour: connect_detour as usize as *const u8,
            resume_slot: &CONNECT_RESUME,
        },
        HookSpec {
            name: c"gethostbyname",
            detour: gethostbyname_detour as usize as *const u8,
            resume_slot: &GETHOST_RESUME,
        },
        HookSpec {
            name: c"recv",
            detour: recv_detour as usize as *const u8,
            resume_slot: &RECV_RESUME,
        },
        HookSpec {
            name: c"recvfrom",
            detour: recvfrom_detour as usize as *const u8,
            resume_slot: &RECVFROM_RESUME,
        },
        HookSpec {
            name: c"WSARecv",
            detour: wsa_recv_detour as usize as *const u8,
            resume_slot: &WSA_RECV_RESUME,
        },
        HookSpec {
            name: c"WSAGetOverlappedResult",
            detour: wsa_get_overlapped_result_detour as usize as *const u8,
            resume_slot: &WSA_GET_OVERLAPPED_RESUME,
        },
    ]
}
