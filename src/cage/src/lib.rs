//! Sandbox runtime core: bounded address spaces, guest loading and the
//! host<->guest control transfer protocol.
//!
//! A [`Platform`] owns the slot allocator and the process-wide
//! configuration. Each guest gets an [`AddrSpace`] (one reserved,
//! tag-aligned slot plus its mapping table) and a [`Proc`] (register bank,
//! system page and entry anchors). Guest pointers are carried as the opaque
//! [`BoxPtr`] so they cannot be dereferenced as host pointers by accident.

mod addrspace;
mod error;
mod host;
mod loader;
mod platform;
mod proc;
mod signal;
#[cfg(test)]
pub(crate) mod testelf;

use std::fmt;
use std::ops::{Add, Sub};

pub use addrspace::{AddrSpace, AddrSpaceInfo, GUARD1_SIZE, GUARD2_SIZE};
pub use arch::{ProcCtx, Regs};
pub use error::{
    last_error, Error, Result, ERR_CANNOT_MAP, ERR_CONFIG, ERR_INVALID_ELF, ERR_INVALID_GAS,
    ERR_NOMEM, ERR_NOSPACE, ERR_VERIFY,
};
pub use loader::ProcInfo;
pub use memtab::{MapFlags, MapInfo, Prot};
pub use platform::{Options, Platform, SysHandler, Verifier};
pub use proc::{current_proc, proc_exit, Proc, EXIT_FAULT_BASE};

/// An in-sandbox pointer. Never a host pointer: conversions go through
/// [`AddrSpace::to_ptr`] and [`AddrSpace::from_ptr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BoxPtr(u64);

impl BoxPtr {
    pub const fn new(addr: u64) -> Self {
        BoxPtr(addr)
    }

    pub const fn addr(self) -> u64 {
        self.0
    }
}

impl Add<u64> for BoxPtr {
    type Output = BoxPtr;

    fn add(self, rhs: u64) -> BoxPtr {
        BoxPtr(self.0 + rhs)
    }
}

impl Sub<u64> for BoxPtr {
    type Output = BoxPtr;

    fn sub(self, rhs: u64) -> BoxPtr {
        BoxPtr(self.0 - rhs)
    }
}

impl fmt::LowerHex for BoxPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}
