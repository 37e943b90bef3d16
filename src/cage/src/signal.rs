//! Guest fault handling.
//!
//! A fault taken while a thread is inside a guest, with the faulting PC or
//! address inside that guest's sandbox, forces the guest to exit with
//! `128 + signal`. Faults that are not the guest's are re-raised with the
//! default disposition so the host crashes as it would have anyway.

use std::os::raw::c_void;
use std::sync::OnceLock;

use crate::proc::{current_proc, proc_exit, EXIT_FAULT_BASE};

static INSTALLED: OnceLock<()> = OnceLock::new();

const GUEST_SIGNALS: [libc::c_int; 4] =
    [libc::SIGSEGV, libc::SIGBUS, libc::SIGILL, libc::SIGTRAP];

pub(crate) fn install() {
    INSTALLED.get_or_init(|| unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = fault_handler as usize;
        // SA_ONSTACK: the guest stack pointer may itself be the problem, so
        // run on the sigaltstack std sets up per thread.
        // SA_NODEFER: the handler leaves by unwinding to the guest entry
        // point, not by returning, so the signal must not stay masked.
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK | libc::SA_NODEFER;
        libc::sigemptyset(&mut action.sa_mask);
        for sig in GUEST_SIGNALS {
            libc::sigaction(sig, &action, std::ptr::null_mut());
        }
    });
}

#[cfg(target_arch = "x86_64")]
fn fault_pc(uctx: *mut c_void) -> u64 {
    let uc = unsafe { &*(uctx as *const libc::ucontext_t) };
    uc.uc_mcontext.gregs[libc::REG_RIP as usize] as u64
}

#[cfg(target_arch = "aarch64")]
fn fault_pc(uctx: *mut c_void) -> u64 {
    let uc = unsafe { &*(uctx as *const libc::ucontext_t) };
    uc.uc_mcontext.pc
}

extern "C" fn fault_handler(
    signo: libc::c_int,
    info: *mut libc::siginfo_t,
    uctx: *mut c_void,
) {
    let p = current_proc();
    if !p.is_null() {
        let (base, size) = unsafe { ((*p).base(), (*p).size()) };
        let inside = |a: u64| a >= base && a < base + size;
        let pc = fault_pc(uctx);
        let addr = unsafe { (*info).si_addr() as u64 };
        if inside(pc) || inside(addr) {
            proc_exit(EXIT_FAULT_BASE + signo as u64);
        }
    }
    unsafe {
        libc::signal(signo, libc::SIG_DFL);
        libc::raise(signo);
    }
}
