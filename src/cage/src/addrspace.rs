use std::sync::Arc;

use memtab::{MapEntry, MapFlags, MapInfo, MemTab, Prot};
use tracing::{debug, error};

use crate::error::{seterr, Error, Result};
use crate::{host, BoxPtr, Platform};

/// Inaccessible region below the usable range. Also covers the first page of
/// the slot, which holds the internal system page.
pub const GUARD1_SIZE: u64 = 80 * 1024;
/// Inaccessible region above the usable range; the stack sits right below it.
pub const GUARD2_SIZE: u64 = 80 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct AddrSpaceInfo {
    pub base: u64,
    pub size: u64,
    pub min_addr: u64,
    pub max_addr: u64,
}

/// One sandbox slot: a reserved, tag-aligned range of host address space and
/// the table of guest mappings inside it.
///
/// Invariant: every byte of `[base, base+size)` is at all times either an
/// active guest mapping or an inaccessible reservation, so no host allocator
/// can ever be handed an address inside the slot. Mutations are not
/// internally synchronized; concurrent users must serialize externally.
pub struct AddrSpace {
    plat: Arc<Platform>,
    base: u64,
    size: u64,
    min_addr: u64,
    max_addr: u64,
    tab: MemTab,
}

impl AddrSpace {
    pub fn new(plat: &Arc<Platform>) -> Result<AddrSpace> {
        let size = plat.opts().vm_size;
        let page = plat.opts().page_size as u64;
        let base = plat.boxmap().alloc(size).map_err(|e| seterr(e.into()))?;
        let min_addr = base + page + GUARD1_SIZE;
        let max_addr = base + size - GUARD2_SIZE;
        debug!(
            "addrspace: base={:#x} usable=[{:#x}, {:#x})",
            base, min_addr, max_addr
        );
        Ok(AddrSpace {
            plat: plat.clone(),
            base,
            size,
            min_addr,
            max_addr,
            tab: MemTab::new(min_addr, max_addr, page),
        })
    }

    pub fn info(&self) -> AddrSpaceInfo {
        AddrSpaceInfo {
            base: self.base,
            size: self.size,
            min_addr: self.min_addr,
            max_addr: self.max_addr,
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn min_addr(&self) -> u64 {
        self.min_addr
    }

    pub fn max_addr(&self) -> u64 {
        self.max_addr
    }

    pub(crate) fn platform(&self) -> &Arc<Platform> {
        &self.plat
    }

    /// Map `len` bytes at a runtime-chosen address (first fit from the low
    /// end of the usable range).
    pub fn map_any(
        &mut self,
        len: u64,
        prot: Prot,
        flags: MapFlags,
        fd: i32,
        off: i64,
    ) -> Result<BoxPtr> {
        let entry = MapEntry { prot, flags, fd, off };
        let addr = self.tab.map_any(len, entry).map_err(|e| seterr(e.into()))?;
        if let Err(e) = self.map_verify(addr, len, prot, flags, fd, off) {
            let _ = self.tab.unmap(addr, len, |_, _, _| {});
            return Err(e);
        }
        Ok(BoxPtr::new(addr))
    }

    /// Map `len` bytes at a fixed in-sandbox address. Displaced mappings are
    /// re-reserved as inaccessible before the new mapping is installed.
    pub fn map_at(
        &mut self,
        ptr: BoxPtr,
        len: u64,
        prot: Prot,
        flags: MapFlags,
        fd: i32,
        off: i64,
    ) -> Result<BoxPtr> {
        let addr = ptr.addr();
        let entry = MapEntry { prot, flags, fd, off };
        self.tab
            .map_at(addr, len, entry, reserve_displaced)
            .map_err(|e| seterr(e.into()))?;
        if let Err(e) = self.map_verify(addr, len, prot, flags, fd, off) {
            let _ = self.tab.unmap(addr, len, reserve_displaced);
            return Err(e);
        }
        Ok(ptr)
    }

    /// Change the protection of an existing range. Raising to executable is
    /// routed through the verifier.
    pub fn mprotect(&mut self, ptr: BoxPtr, len: u64, prot: Prot) -> Result<()> {
        let addr = ptr.addr();
        self.check_bounds(addr, len)?;
        self.protect_verify(addr, len, prot)?;
        self.tab
            .protect(addr, len, prot)
            .map_err(|e| seterr(e.into()))?;
        Ok(())
    }

    /// Remove a mapping, leaving the range as an inaccessible reservation.
    pub fn munmap(&mut self, ptr: BoxPtr, len: u64) -> Result<()> {
        let addr = ptr.addr();
        self.check_bounds(addr, len)?;
        self.tab
            .unmap(addr, len, reserve_displaced)
            .map_err(|e| seterr(e.into()))?;
        Ok(())
    }

    /// The mapping covering `ptr`, if any.
    pub fn query(&self, ptr: BoxPtr) -> Option<MapInfo> {
        self.tab.query(ptr.addr())
    }

    /// All recorded mappings, in address order.
    pub fn mappings(&self) -> impl Iterator<Item = MapInfo> + '_ {
        self.tab.spans()
    }

    pub fn to_ptr(&self, host: *const u8) -> BoxPtr {
        BoxPtr::new(host as u64)
    }

    /// Host pointer for an in-sandbox pointer. With tagging enabled the
    /// result is forced into the sandbox by reconstructing the high bits
    /// from the base.
    pub fn from_ptr(&self, ptr: BoxPtr) -> *mut u8 {
        let tag_bits = self.plat.opts().tag_bits;
        let addr = if tag_bits == 0 {
            ptr.addr()
        } else {
            self.base | (ptr.addr() & (self.size - 1))
        };
        addr as *mut u8
    }

    pub fn valid_ptr(&self, ptr: BoxPtr) -> bool {
        ptr.addr() >= self.base && ptr.addr() < self.base + self.size
    }

    /// Wipe the slot back to a fully inaccessible reservation and forget
    /// every recorded mapping.
    pub fn reset(&mut self) {
        host::reserve(self.base, self.size).expect("cannot re-reserve sandbox");
        self.tab.clear();
    }

    fn check_bounds(&self, addr: u64, len: u64) -> Result<()> {
        let page = self.plat.opts().page_size as u64;
        let ok = addr >= self.min_addr
            && len > 0
            && addr % page == 0
            && len % page == 0
            && addr
                .checked_add(len)
                .is_some_and(|end| end <= self.max_addr);
        if ok {
            Ok(())
        } else {
            Err(seterr(Error::CannotMap(nix::errno::Errno::EINVAL)))
        }
    }

    /// Install a host mapping, enforcing the W^X and verification policy.
    /// An executable request is staged read-only, checked, then granted its
    /// final protection; on rejection the range ends as an inaccessible
    /// reservation.
    fn map_verify(
        &self,
        addr: u64,
        len: u64,
        prot: Prot,
        flags: MapFlags,
        fd: i32,
        off: i64,
    ) -> Result<()> {
        if !prot.contains(Prot::EXEC) {
            return host::map_fixed(addr, len, prot, flags, fd, off)
                .map_err(|e| seterr(Error::CannotMap(e)));
        }
        if prot.contains(Prot::WRITE) {
            error!("refusing writable+executable mapping at {:#x}", addr);
            return Err(seterr(Error::Verify));
        }
        let verifier = match &self.plat.opts().verifier {
            Some(v) => v.clone(),
            None if self.plat.opts().no_verify => {
                return host::map_fixed(addr, len, prot, flags, fd, off)
                    .map_err(|e| seterr(Error::CannotMap(e)));
            }
            None => return Err(seterr(Error::Verify)),
        };
        host::map_fixed(addr, len, Prot::READ, flags, fd, off)
            .map_err(|e| seterr(Error::CannotMap(e)))?;
        let code = unsafe { std::slice::from_raw_parts(addr as *const u8, len as usize) };
        if !verifier.verify(code, addr) {
            let _ = host::reserve(addr, len);
            return Err(seterr(Error::Verify));
        }
        if let Err(e) = host::protect(addr, len, prot) {
            let _ = host::reserve(addr, len);
            return Err(seterr(Error::CannotMap(e)));
        }
        Ok(())
    }

    fn protect_verify(&self, addr: u64, len: u64, prot: Prot) -> Result<()> {
        if prot.contains(Prot::EXEC) {
            if prot.contains(Prot::WRITE) {
                error!("refusing writable+executable protection at {:#x}", addr);
                return Err(seterr(Error::Verify));
            }
            match &self.plat.opts().verifier {
                Some(v) => {
                    let code =
                        unsafe { std::slice::from_raw_parts(addr as *const u8, len as usize) };
                    if !v.verify(code, addr) {
                        return Err(seterr(Error::Verify));
                    }
                }
                None if self.plat.opts().no_verify => {}
                None => return Err(seterr(Error::Verify)),
            }
        }
        host::protect(addr, len, prot).map_err(|e| seterr(Error::CannotMap(e)))
    }
}

/// Unmap callback: a displaced or removed range must go back to being an
/// inaccessible reservation, never a hole another allocation could fill.
fn reserve_displaced(start: u64, len: u64, _entry: &MapEntry) {
    host::reserve(start, len).expect("cannot re-reserve displaced range");
}

impl Drop for AddrSpace {
    fn drop(&mut self) {
        self.reset();
        self.plat.boxmap().free(self.base, self.size);
    }
}
