//! Thin wrappers over the host's mapping syscalls. Everything here operates
//! on fixed addresses inside a slot the caller already owns; the sandbox
//! invariant (every slot byte is either mapped or an inaccessible
//! reservation) is maintained by the callers in `addrspace`.

use memtab::{MapFlags, Prot};
use nix::errno::Errno;

pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn prot_raw(prot: Prot) -> libc::c_int {
    let mut raw = 0;
    if prot.contains(Prot::READ) {
        raw |= libc::PROT_READ;
    }
    if prot.contains(Prot::WRITE) {
        raw |= libc::PROT_WRITE;
    }
    if prot.contains(Prot::EXEC) {
        raw |= libc::PROT_EXEC;
    }
    raw
}

fn flags_raw(flags: MapFlags) -> libc::c_int {
    let mut raw = 0;
    if flags.contains(MapFlags::SHARED) {
        raw |= libc::MAP_SHARED;
    }
    if flags.contains(MapFlags::PRIVATE) {
        raw |= libc::MAP_PRIVATE;
    }
    if flags.contains(MapFlags::ANONYMOUS) {
        raw |= libc::MAP_ANONYMOUS;
    }
    raw
}

/// Re-reserve `[addr, addr+len)` as inaccessible address space.
pub fn reserve(addr: u64, len: u64) -> Result<(), Errno> {
    let p = unsafe {
        libc::mmap(
            addr as *mut _,
            len as usize,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        return Err(Errno::last());
    }
    Ok(())
}

/// Install a mapping at a fixed address.
pub fn map_fixed(
    addr: u64,
    len: u64,
    prot: Prot,
    flags: MapFlags,
    fd: i32,
    off: i64,
) -> Result<(), Errno> {
    let p = unsafe {
        libc::mmap(
            addr as *mut _,
            len as usize,
            prot_raw(prot),
            flags_raw(flags) | libc::MAP_FIXED,
            fd,
            off as libc::off_t,
        )
    };
    if p == libc::MAP_FAILED {
        return Err(Errno::last());
    }
    Ok(())
}

/// Anonymous mapping at a host-chosen address (external system page).
pub fn map_anywhere(len: u64, prot: Prot) -> Result<u64, Errno> {
    let p = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len as usize,
            prot_raw(prot),
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        return Err(Errno::last());
    }
    Ok(p as u64)
}

pub fn protect(addr: u64, len: u64, prot: Prot) -> Result<(), Errno> {
    let ret = unsafe { libc::mprotect(addr as *mut _, len as usize, prot_raw(prot)) };
    Errno::result(ret).map(drop)
}

pub fn unmap(addr: u64, len: u64) {
    unsafe {
        libc::munmap(addr as *mut _, len as usize);
    }
}
