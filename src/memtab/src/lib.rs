//! In-memory bookkeeping of the mappings inside one sandbox.
//!
//! The table records which page-aligned ranges of `[lo, hi)` are mapped and
//! with what protection, flags and backing. It never touches the host's
//! virtual memory itself; callers that need host-side effects (releasing a
//! displaced range, re-reserving it, ...) receive them through the unmap
//! callback so the effect is applied even for indirect displacements.

use std::collections::BTreeMap;

use bitflags::bitflags;

bitflags! {
    /// Page protection. Bit values follow POSIX `PROT_*`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u32 {
        const READ = 1;
        const WRITE = 2;
        const EXEC = 4;
    }
}

bitflags! {
    /// Mapping kind flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const SHARED = 1 << 0;
        const PRIVATE = 1 << 1;
        const ANONYMOUS = 1 << 2;
    }
}

/// Per-mapping attributes. `fd` is -1 for anonymous memory; `off` is the
/// backing file offset of the entry's first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapEntry {
    pub prot: Prot,
    pub flags: MapFlags,
    pub fd: i32,
    pub off: i64,
}

impl MapEntry {
    pub fn anon(prot: Prot) -> Self {
        MapEntry {
            prot,
            flags: MapFlags::PRIVATE | MapFlags::ANONYMOUS,
            fd: -1,
            off: 0,
        }
    }
}

/// Result of a query: one recorded range and its attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapInfo {
    pub base: u64,
    pub len: u64,
    pub prot: Prot,
    pub flags: MapFlags,
    pub fd: i32,
    pub off: i64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("no free range of the requested size")]
    NoSpace,
    #[error("range {addr:#x}+{len:#x} outside the table bounds")]
    OutOfRange { addr: u64, len: u64 },
    #[error("address or length not page-aligned")]
    Misaligned,
    #[error("empty range")]
    EmptyRange,
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy)]
struct Span {
    len: u64,
    entry: MapEntry,
}

/// Ordered mapping table over `[lo, hi)`. Mutations and queries are
/// O(log n) in the number of recorded spans.
pub struct MemTab {
    lo: u64,
    hi: u64,
    page_size: u64,
    map: BTreeMap<u64, Span>,
}

impl MemTab {
    pub fn new(lo: u64, hi: u64, page_size: u64) -> Self {
        assert!(page_size.is_power_of_two());
        assert!(lo < hi);
        assert!(lo % page_size == 0 && hi % page_size == 0);
        MemTab {
            lo,
            hi,
            page_size,
            map: BTreeMap::new(),
        }
    }

    pub fn bounds(&self) -> (u64, u64) {
        (self.lo, self.hi)
    }

    fn check_range(&self, addr: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Err(Error::EmptyRange);
        }
        if addr % self.page_size != 0 || len % self.page_size != 0 {
            return Err(Error::Misaligned);
        }
        if addr < self.lo || addr.checked_add(len).is_none_or(|end| end > self.hi) {
            return Err(Error::OutOfRange { addr, len });
        }
        Ok(())
    }

    /// Record a mapping at the lowest free range of `len` bytes (first fit).
    pub fn map_any(&mut self, len: u64, entry: MapEntry) -> Result<u64> {
        if len == 0 {
            return Err(Error::EmptyRange);
        }
        if len % self.page_size != 0 {
            return Err(Error::Misaligned);
        }
        let mut cursor = self.lo;
        for (&start, span) in self.map.iter() {
            if start - cursor >= len {
                break;
            }
            cursor = start + span.len;
        }
        if cursor + len > self.hi {
            return Err(Error::NoSpace);
        }
        self.map.insert(cursor, Span { len, entry });
        Ok(cursor)
    }

    /// Record a mapping at a fixed address. Overlapped parts of existing
    /// spans are removed first and reported through `cb`.
    pub fn map_at<F>(&mut self, addr: u64, len: u64, entry: MapEntry, cb: F) -> Result<()>
    where
        F: FnMut(u64, u64, &MapEntry),
    {
        self.check_range(addr, len)?;
        self.remove(addr, len, cb);
        self.map.insert(addr, Span { len, entry });
        Ok(())
    }

    /// Remove recorded mappings covering `[addr, addr+len)`. Partial
    /// overlaps are trimmed; each removed sub-range is reported through
    /// `cb`.
    pub fn unmap<F>(&mut self, addr: u64, len: u64, cb: F) -> Result<()>
    where
        F: FnMut(u64, u64, &MapEntry),
    {
        self.check_range(addr, len)?;
        self.remove(addr, len, cb);
        Ok(())
    }

    /// Rewrite the protection of every recorded byte in `[addr, addr+len)`,
    /// splitting spans at the range boundaries.
    pub fn protect(&mut self, addr: u64, len: u64, prot: Prot) -> Result<()> {
        self.check_range(addr, len)?;
        let mut updated: Vec<(u64, Span)> = Vec::new();
        self.remove(addr, len, |start, sublen, entry| {
            let mut entry = *entry;
            entry.prot = prot;
            updated.push((start, Span { len: sublen, entry }));
        });
        for (start, span) in updated {
            self.map.insert(start, span);
        }
        Ok(())
    }

    /// The recorded range containing `addr`, if any.
    pub fn query(&self, addr: u64) -> Option<MapInfo> {
        let (&start, span) = self.map.range(..=addr).next_back()?;
        if addr >= start + span.len {
            return None;
        }
        Some(MapInfo {
            base: start,
            len: span.len,
            prot: span.entry.prot,
            flags: span.entry.flags,
            fd: span.entry.fd,
            off: span.entry.off,
        })
    }

    /// All recorded ranges, in address order.
    pub fn spans(&self) -> impl Iterator<Item = MapInfo> + '_ {
        self.map.iter().map(|(&start, span)| MapInfo {
            base: start,
            len: span.len,
            prot: span.entry.prot,
            flags: span.entry.flags,
            fd: span.entry.fd,
            off: span.entry.off,
        })
    }

    /// Drop every recorded mapping (the caller has wiped the host range).
    pub fn clear(&mut self) {
        self.map.clear();
    }

    fn remove<F>(&mut self, addr: u64, len: u64, mut cb: F)
    where
        F: FnMut(u64, u64, &MapEntry),
    {
        let end = addr + len;
        // A span beginning before `addr` can still overlap it, so widen the
        // scan by one entry and skip the non-overlapping ones below.
        let from = self
            .map
            .range(..=addr)
            .next_back()
            .map_or(addr, |(&k, _)| k);
        let keys: Vec<u64> = self.map.range(from..end).map(|(&k, _)| k).collect();
        for start in keys {
            let span = self.map[&start];
            let span_end = start + span.len;
            if span_end <= addr || start >= end {
                continue;
            }
            self.map.remove(&start);
            let cut_lo = addr.max(start);
            let cut_hi = end.min(span_end);
            if cut_lo > start {
                // left remainder keeps the original attributes
                self.map.insert(
                    start,
                    Span {
                        len: cut_lo - start,
                        entry: span.entry,
                    },
                );
            }
            if cut_hi < span_end {
                let mut entry = span.entry;
                entry.off += (cut_hi - start) as i64;
                self.map.insert(
                    cut_hi,
                    Span {
                        len: span_end - cut_hi,
                        entry,
                    },
                );
            }
            let mut cut_entry = span.entry;
            cut_entry.off += (cut_lo - start) as i64;
            cb(cut_lo, cut_hi - cut_lo, &cut_entry);
        }
    }
}
