//! Shadow memory: per-byte recent-access history
//!
//! Application memory is shadowed at 8-byte cell granularity with a per-byte
//! mask, in 4 KiB pages allocated lazily on first touch. Each cell holds up
//! to [`MAX_RECORDS`] access records `{segment, is_write, byte mask}`.
//!
//! The per-byte invariant: among the records covering any given byte, no
//! record's segment clock is ordered before another's. Ordered (dominated)
//! coverage is pruned as new accesses land, so a cell only remembers the
//! frontier of HB-unordered accesses, which are exactly the candidates a
//! future access can race with.
//!
//! Record insertion releases and acquires segment references; the segment
//! table recycles a segment once no cell references it.

use crate::clock::ClockTable;
use crate::segment::{SegmentId, SegmentTable};
use std::collections::HashMap;

/// Bytes covered by one shadow cell.
pub const CELL_BYTES: u64 = 8;
/// Records kept per cell.
pub const MAX_RECORDS: usize = 4;

const PAGE_SHIFT: u32 = 12;
const PAGE_BYTES: u64 = 1 << PAGE_SHIFT;
const CELLS_PER_PAGE: usize = (PAGE_BYTES / CELL_BYTES) as usize;

/// One recorded access within a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRecord {
    pub sid: SegmentId,
    /// Program counter of the access itself (the segment stack gives the
    /// surrounding frames).
    pub pc: u64,
    pub is_write: bool,
    /// Bytes of the cell this record covers (bit i = byte i).
    pub mask: u8,
}

/// One cell-aligned slice of an application access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubAccess {
    /// Cell-aligned base address.
    pub cell_addr: u64,
    pub mask: u8,
}

/// Split `[addr, addr + size)` into cell-aligned sub-accesses. An access
/// straddling a cell boundary is analyzed as two independent sub-accesses.
pub fn split_access(addr: u64, size: u64) -> Vec<SubAccess> {
    let size = if size == 0 { 1 } else { size };
    let mut subs = Vec::with_capacity(((size / CELL_BYTES) + 2) as usize);
    let mut cur = addr;
    let end = addr.saturating_add(size);
    while cur < end {
        let cell_addr = cur & !(CELL_BYTES - 1);
        let lo = cur - cell_addr;
        let hi = (end - cell_addr).min(CELL_BYTES);
        let mut mask = 0u8;
        for byte in lo..hi {
            mask |= 1 << byte;
        }
        subs.push(SubAccess { cell_addr, mask });
        cur = cell_addr + CELL_BYTES;
    }
    subs
}

#[derive(Debug, Default, Clone)]
struct ShadowCell {
    records: Vec<AccessRecord>,
}

#[derive(Debug)]
struct Page {
    cells: Vec<ShadowCell>,
}

impl Page {
    fn new() -> Self {
        Self {
            cells: vec![ShadowCell::default(); CELLS_PER_PAGE],
        }
    }

    fn is_empty(&self) -> bool {
        self.cells.iter().all(|c| c.records.is_empty())
    }
}

/// Sparse two-level shadow map: page number → dense cell array.
#[derive(Debug, Default)]
pub struct ShadowMemory {
    pages: HashMap<u64, Page>,
    pages_allocated: u64,
    cells_touched: u64,
}

impl ShadowMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one sub-access and return the prior records it is HB-unordered
    /// with (the race candidates). The caller applies the lockset filter and
    /// decides whether each candidate is reportable.
    pub fn record_access(
        &mut self,
        sub: SubAccess,
        sid: SegmentId,
        pc: u64,
        is_write: bool,
        clocks: &ClockTable,
        segments: &mut SegmentTable,
    ) -> Vec<AccessRecord> {
        let page_no = sub.cell_addr >> PAGE_SHIFT;
        let cell_idx = ((sub.cell_addr & (PAGE_BYTES - 1)) / CELL_BYTES) as usize;
        let page = match self.pages.entry(page_no) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                self.pages_allocated += 1;
                e.insert(Page::new())
            }
        };
        let cell = &mut page.cells[cell_idx];
        if cell.records.is_empty() {
            self.cells_touched += 1;
        }

        let cur_clock = segments.get(sid).clock;
        let mut priors = Vec::new();
        let mut new_mask = sub.mask;

        let mut i = 0;
        while i < cell.records.len() {
            let r = cell.records[i];
            if r.mask & sub.mask == 0 {
                i += 1;
                continue;
            }
            let r_clock = segments.get(r.sid).clock;
            if clocks.leq(r_clock, cur_clock) {
                // Prior coverage on these bytes is dominated by the new
                // access; prune it.
                let remaining = r.mask & !sub.mask;
                if remaining == 0 {
                    segments.release(r.sid);
                    cell.records.remove(i);
                    continue;
                }
                cell.records[i].mask = remaining;
            } else if clocks.leq(cur_clock, r_clock) {
                // The new access is ordered before the stored one on these
                // bytes; the stored record already covers them.
                new_mask &= !r.mask;
            } else {
                priors.push(r);
            }
            i += 1;
        }

        if new_mask != 0 {
            if cell.records.len() == MAX_RECORDS {
                let evicted = cell.records.remove(0);
                segments.release(evicted.sid);
            }
            cell.records.push(AccessRecord {
                sid,
                pc,
                is_write,
                mask: new_mask,
            });
            segments.acquire(sid);
        }

        priors
    }

    /// Forget all history for `[addr, addr + size)`. Used for MALLOC, FREE,
    /// MMAP, MUNMAP and fresh stack ranges. Cost is proportional to the
    /// pages that actually exist, not to the range size, so huge munmaps
    /// stay cheap.
    pub fn clear_range(&mut self, addr: u64, size: u64, segments: &mut SegmentTable) {
        if size == 0 {
            return;
        }
        let end = addr.saturating_add(size);
        let first_page = addr >> PAGE_SHIFT;
        let last_page = (end - 1) >> PAGE_SHIFT;
        let pages: Vec<u64> = self
            .pages
            .keys()
            .copied()
            .filter(|p| (first_page..=last_page).contains(p))
            .collect();
        for page_no in pages {
            let page = self.pages.get_mut(&page_no).expect("page key just listed");
            let page_base = page_no << PAGE_SHIFT;
            let from = addr.max(page_base);
            let to = end.min(page_base + PAGE_BYTES);
            let mut cur = from;
            while cur < to {
                let cell_addr = cur & !(CELL_BYTES - 1);
                let lo = cur - cell_addr;
                let hi = (to - cell_addr).min(CELL_BYTES);
                let mut mask = 0u8;
                for byte in lo..hi {
                    mask |= 1 << byte;
                }
                let cell = &mut page.cells[((cell_addr - page_base) / CELL_BYTES) as usize];
                let mut i = 0;
                while i < cell.records.len() {
                    let remaining = cell.records[i].mask & !mask;
                    if remaining == 0 {
                        segments.release(cell.records[i].sid);
                        cell.records.remove(i);
                    } else {
                        cell.records[i].mask = remaining;
                        i += 1;
                    }
                }
                cur = cell_addr + CELL_BYTES;
            }
            if page.is_empty() {
                self.pages.remove(&page_no);
            }
        }
    }

    /// Drop every page, releasing all segment references.
    pub fn clear_all(&mut self, segments: &mut SegmentTable) {
        for (_, page) in self.pages.drain() {
            for cell in &page.cells {
                for r in &cell.records {
                    segments.release(r.sid);
                }
            }
        }
    }

    /// Records covering any byte of `[addr, addr + size)`. Test/diagnostic
    /// helper.
    pub fn records_at(&self, addr: u64, size: u64) -> Vec<AccessRecord> {
        let mut out = Vec::new();
        for sub in split_access(addr, size) {
            let page_no = sub.cell_addr >> PAGE_SHIFT;
            let Some(page) = self.pages.get(&page_no) else {
                continue;
            };
            let cell_idx = ((sub.cell_addr & (PAGE_BYTES - 1)) / CELL_BYTES) as usize;
            for r in &page.cells[cell_idx].records {
                if r.mask & sub.mask != 0 {
                    out.push(*r);
                }
            }
        }
        out
    }

    pub fn pages_allocated(&self) -> u64 {
        self.pages_allocated
    }

    pub fn pages_live(&self) -> usize {
        self.pages.len()
    }

    pub fn cells_touched(&self) -> u64 {
        self.cells_touched
    }
}
