//! Guest ELF loading.
//!
//! Only `PT_LOAD` segments are honored; relocation and dynamic linking are
//! the guest's business (via its interpreter, which is loaded just above the
//! program image when supplied).

use goblin::elf::header::{ET_DYN, ET_EXEC};
use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_LOAD};
use goblin::elf::Elf;
use memtab::{MapFlags, Prot};
use tracing::debug;

use crate::error::{seterr, Error, Result};
use crate::{AddrSpace, BoxPtr};

/// What the host needs to build the initial guest stack (argv/envp/auxv)
/// and enter the image.
#[derive(Debug, Clone, Copy)]
pub struct ProcInfo {
    pub stack: BoxPtr,
    pub stack_size: usize,
    /// Highest mapped guest address of the loaded images.
    pub last_va: u64,
    pub elf_entry: u64,
    /// Interpreter entry, 0 when the image has none.
    pub ld_entry: u64,
    pub elf_base: u64,
    /// Interpreter load base; equals `elf_base` without an interpreter.
    pub ld_base: u64,
    pub phdr_off: u64,
    pub phdr_count: u16,
    pub phdr_entsize: u16,
}

#[derive(Debug)]
pub(crate) struct LoadInfo {
    pub base: u64,
    pub last: u64,
    pub entry: u64,
}

fn truncp(x: u64, align: u64) -> u64 {
    x - x % align
}

fn ceilp(x: u64, align: u64) -> Option<u64> {
    Some(truncp(x.checked_add(align - 1)?, align))
}

fn pflags(flags: u32) -> Prot {
    let mut prot = Prot::empty();
    if flags & PF_R != 0 {
        prot |= Prot::READ;
    }
    if flags & PF_W != 0 {
        prot |= Prot::WRITE;
    }
    if flags & PF_X != 0 {
        prot |= Prot::EXEC;
    }
    prot
}

/// Install one ELF image into `aspace`. Position-independent images are
/// anchored at `base`; executable images carry sandbox-relative addresses
/// and must lie at or above it.
pub(crate) fn load_image(aspace: &mut AddrSpace, buf: &[u8], base: u64) -> Result<LoadInfo> {
    let elf = Elf::parse(buf).map_err(|_| seterr(Error::InvalidElf("unparsable image")))?;
    let header = &elf.header;

    if !elf.is_64 || !elf.little_endian {
        return Err(seterr(Error::InvalidElf("not a 64-bit little-endian image")));
    }
    if header.e_version != 1 {
        return Err(seterr(Error::InvalidElf("bad ELF version")));
    }
    if header.e_type != ET_EXEC && header.e_type != ET_DYN {
        return Err(seterr(Error::InvalidElf("not an executable or shared object")));
    }

    let sandbox = aspace.base();
    let page = aspace.platform().opts().page_size as u64;
    let code_max = arch::code_max(aspace.platform().opts().tag_bits);
    if header.e_entry >= code_max {
        return Err(seterr(Error::InvalidElf("entry beyond the code region")));
    }

    let mut last = 0u64;
    for ph in &elf.program_headers {
        if ph.p_type != PT_LOAD || ph.p_memsz == 0 {
            continue;
        }
        if ph.p_align == 0 || ph.p_align % page != 0 {
            return Err(seterr(Error::InvalidElf("segment alignment below page size")));
        }
        if ph.p_memsz < ph.p_filesz {
            return Err(seterr(Error::InvalidElf("memsz smaller than filesz")));
        }

        let start = truncp(ph.p_vaddr, ph.p_align);
        let end = ph
            .p_vaddr
            .checked_add(ph.p_memsz)
            .and_then(|e| ceilp(e, ph.p_align))
            .ok_or_else(|| seterr(Error::InvalidElf("segment overflows")))?;
        if end <= start {
            return Err(seterr(Error::InvalidElf("empty segment range")));
        }
        let seg_off = ph.p_vaddr - start;

        let abs_start = if header.e_type == ET_EXEC {
            // addresses are sandbox offsets baked in at link time
            if sandbox + start < base {
                return Err(seterr(Error::InvalidElf("segment below the load floor")));
            }
            sandbox + start
        } else {
            base + start
        };
        let abs_end = abs_start + (end - start);
        if abs_start - sandbox >= code_max || abs_end - sandbox > code_max {
            return Err(seterr(Error::InvalidElf("segment beyond the code region")));
        }

        let prot = pflags(ph.p_flags);
        debug!(
            "load segment [{:#x}, {:#x}) prot={:?}",
            abs_start, abs_end, prot
        );

        let len = abs_end - abs_start;
        aspace.map_at(
            BoxPtr::new(abs_start),
            len,
            Prot::READ | Prot::WRITE,
            MapFlags::PRIVATE | MapFlags::ANONYMOUS,
            -1,
            0,
        )?;

        let file_end = ph
            .p_offset
            .checked_add(ph.p_filesz)
            .ok_or_else(|| seterr(Error::InvalidElf("segment overflows")))?;
        if file_end > buf.len() as u64 {
            return Err(seterr(Error::InvalidElf("segment data out of bounds")));
        }

        unsafe {
            if prot.contains(Prot::EXEC) {
                // stray control flow into untouched padding must trap
                std::ptr::write_bytes(abs_start as *mut u8, arch::SAFE_CODE_BYTE, page as usize);
                std::ptr::write_bytes(
                    (abs_end - page) as *mut u8,
                    arch::SAFE_CODE_BYTE,
                    page as usize,
                );
            }
            std::ptr::copy_nonoverlapping(
                buf.as_ptr().add(ph.p_offset as usize),
                (abs_start + seg_off) as *mut u8,
                ph.p_filesz as usize,
            );
        }

        aspace.mprotect(BoxPtr::new(abs_start), len, prot)?;

        last = last.max(abs_end);
    }

    let entry = if header.e_type == ET_DYN {
        base + header.e_entry
    } else {
        sandbox + header.e_entry
    };

    Ok(LoadInfo { base, last, entry })
}
