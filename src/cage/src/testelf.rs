//! Minimal ELF64 images for loader tests, assembled by hand so the tests
//! control every header field.

pub struct Segment {
    pub vaddr: u64,
    pub memsz: u64,
    pub flags: u32,
    pub align: u64,
    pub data: Vec<u8>,
}

pub const PF_R: u32 = 4;
pub const PF_W: u32 = 2;
pub const PF_X: u32 = 1;

const EHSIZE: usize = 64;
const PHENTSIZE: usize = 56;

#[cfg(target_arch = "x86_64")]
const MACHINE: u16 = 62;
#[cfg(target_arch = "aarch64")]
const MACHINE: u16 = 183;

/// `e_type` 2 = EXEC, 3 = DYN.
pub fn build(e_type: u16, entry: u64, segments: &[Segment]) -> Vec<u8> {
    let phoff = EHSIZE;
    let mut data_off = EHSIZE + PHENTSIZE * segments.len();
    let mut out = Vec::new();

    // ELF header
    out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    out.extend_from_slice(&[0; 8]);
    out.extend_from_slice(&e_type.to_le_bytes());
    out.extend_from_slice(&MACHINE.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&entry.to_le_bytes());
    out.extend_from_slice(&(phoff as u64).to_le_bytes());
    out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    out.extend_from_slice(&(EHSIZE as u16).to_le_bytes());
    out.extend_from_slice(&(PHENTSIZE as u16).to_le_bytes());
    out.extend_from_slice(&(segments.len() as u16).to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
    assert_eq!(out.len(), EHSIZE);

    // program headers
    for seg in segments {
        out.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        out.extend_from_slice(&seg.flags.to_le_bytes());
        out.extend_from_slice(&(data_off as u64).to_le_bytes());
        out.extend_from_slice(&seg.vaddr.to_le_bytes());
        out.extend_from_slice(&seg.vaddr.to_le_bytes()); // p_paddr
        out.extend_from_slice(&(seg.data.len() as u64).to_le_bytes());
        out.extend_from_slice(&seg.memsz.to_le_bytes());
        out.extend_from_slice(&seg.align.to_le_bytes());
        data_off += seg.data.len();
    }

    for seg in segments {
        out.extend_from_slice(&seg.data);
    }
    out
}
