//! Reservation of large contiguous virtual-address regions and sub-allocation
//! of sandbox-aligned slots within them.
//!
//! A slot's base address never changes for the lifetime of the region: guest
//! pointer tagging bakes the base into the high bits of every in-sandbox
//! pointer, so slots must be carved out of an up-front reservation rather
//! than mapped on demand.

use std::sync::Mutex;

use nix::errno::Errno;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot reserve address space: {0}")]
    Reserve(Errno),
    #[error("no free sandbox slot")]
    NoSpace,
    #[error("slot size mismatch: requested {requested:#x}, slots are {slot:#x}")]
    SizeMismatch { requested: u64, slot: u64 },
}

pub type Result<T> = std::result::Result<T, Error>;

struct Bitmap(Vec<u64>);

impl Bitmap {
    fn new(num_bits: usize) -> Self {
        Bitmap(vec![0; num_bits.div_ceil(64)])
    }

    fn test(&self, bit: usize) -> bool {
        self.0[bit / 64] & (1 << (bit % 64)) != 0
    }

    fn set(&mut self, bit: usize) {
        self.0[bit / 64] |= 1 << (bit % 64);
    }

    fn clear(&mut self, bit: usize) {
        self.0[bit / 64] &= !(1 << (bit % 64));
    }
}

struct Region {
    base: u64,
    slots: usize,
    used: Bitmap,
    used_count: usize,
}

/// Allocator of `slot_size`-aligned sandbox slots carved out of `PROT_NONE`
/// host reservations. Internally synchronized: allocation and release may be
/// called from any thread.
pub struct BoxMap {
    slot_size: u64,
    regions: Mutex<Vec<Region>>,
}

impl BoxMap {
    pub fn new(slot_size: u64) -> Self {
        assert!(slot_size.is_power_of_two());
        BoxMap {
            slot_size,
            regions: Mutex::new(Vec::new()),
        }
    }

    pub fn slot_size(&self) -> u64 {
        self.slot_size
    }

    /// Reserve `size` bytes of inaccessible address space and register the
    /// `slot_size`-aligned slots inside it. Returns the aligned region base.
    pub fn add_region(&self, size: u64) -> Result<u64> {
        assert!(size > 0 && size % self.slot_size == 0);

        // Over-reserve so an aligned sub-range of exactly `size` bytes is
        // guaranteed to exist, then trim the misaligned ends.
        let total = size + self.slot_size - 1;
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total as usize,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(Error::Reserve(Errno::last()));
        }
        let raw = raw as u64;
        let base = raw.next_multiple_of(self.slot_size);
        let head = base - raw;
        let tail = total - head - size;
        unsafe {
            if head > 0 {
                libc::munmap(raw as *mut _, head as usize);
            }
            if tail > 0 {
                libc::munmap((base + size) as *mut _, tail as usize);
            }
        }

        debug!("boxmap: reserved region base={:#x} size={:#x}", base, size);

        let mut regions = self.regions.lock().unwrap();
        let slots = (size / self.slot_size) as usize;
        regions.push(Region {
            base,
            slots,
            used: Bitmap::new(slots),
            used_count: 0,
        });
        // lowest-address-first allocation order
        regions.sort_by_key(|r| r.base);
        Ok(base)
    }

    /// Claim the lowest free slot. `size` must equal the slot size.
    pub fn alloc(&self, size: u64) -> Result<u64> {
        if size != self.slot_size {
            return Err(Error::SizeMismatch {
                requested: size,
                slot: self.slot_size,
            });
        }
        let mut regions = self.regions.lock().unwrap();
        for region in regions.iter_mut() {
            if region.used_count == region.slots {
                continue;
            }
            for slot in 0..region.slots {
                if !region.used.test(slot) {
                    region.used.set(slot);
                    region.used_count += 1;
                    let base = region.base + slot as u64 * self.slot_size;
                    debug!("boxmap: alloc slot base={:#x}", base);
                    return Ok(base);
                }
            }
        }
        Err(Error::NoSpace)
    }

    /// Return a slot to the free pool. The caller must not double-free and
    /// must have wiped the slot back to an inaccessible reservation.
    pub fn free(&self, base: u64, size: u64) {
        assert_eq!(size, self.slot_size);
        let mut regions = self.regions.lock().unwrap();
        let region = regions
            .iter_mut()
            .find(|r| base >= r.base && base < r.base + r.slots as u64 * size)
            .expect("slot does not belong to any region");
        let slot = ((base - region.base) / size) as usize;
        assert!(region.used.test(slot), "double free of sandbox slot");
        region.used.clear(slot);
        region.used_count -= 1;
        debug!("boxmap: freed slot base={:#x}", base);
    }

    pub fn total_slots(&self) -> usize {
        self.regions.lock().unwrap().iter().map(|r| r.slots).sum()
    }

    pub fn free_slots(&self) -> usize {
        self.regions
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.slots - r.used_count)
            .sum()
    }
}

impl Drop for BoxMap {
    fn drop(&mut self) {
        let regions = self.regions.lock().unwrap();
        for region in regions.iter() {
            unsafe {
                libc::munmap(
                    region.base as *mut _,
                    region.slots * self.slot_size as usize,
                );
            }
        }
    }
}
