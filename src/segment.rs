//! Segments: units of thread execution between synchronization boundaries
//!
//! A segment snapshots a thread's vector clock, lock sets, and call stack at
//! the moment it is minted, and never changes afterwards. Shadow memory
//! records reference segments by id; segments are reference counted and
//! their slots recycled through a free list once the last shadow record
//! referencing them is evicted.

use crate::clock::ClockId;
use crate::lockset::LockSetId;
use crate::threads::Tid;
use std::sync::Arc;
use thiserror::Error;

/// Compact handle into the segment table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentId(u32);

impl SegmentId {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// Immutable snapshot of a thread's execution context.
#[derive(Debug, Clone)]
pub struct Segment {
    pub tid: Tid,
    pub clock: ClockId,
    pub writer_locks: LockSetId,
    pub reader_locks: LockSetId,
    /// Program counters of the call stack captured at minting, innermost
    /// frame last.
    pub stack: Arc<[u64]>,
    refs: u32,
}

/// The table ran out of segment slots. Fatal per the resource-error policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("segment table exhausted ({0} live segments)")]
pub struct SegmentExhausted(pub usize);

/// Owning table of segments, keyed by [`SegmentId`], with free-list
/// recycling.
#[derive(Debug, Default)]
pub struct SegmentTable {
    slots: Vec<Option<Segment>>,
    free: Vec<SegmentId>,
    minted: u64,
    recycled: u64,
}

impl SegmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a new segment with one reference (the owning thread's).
    pub fn mint(
        &mut self,
        tid: Tid,
        clock: ClockId,
        writer_locks: LockSetId,
        reader_locks: LockSetId,
        stack: Arc<[u64]>,
    ) -> Result<SegmentId, SegmentExhausted> {
        self.minted += 1;
        let segment = Segment {
            tid,
            clock,
            writer_locks,
            reader_locks,
            stack,
            refs: 1,
        };
        if let Some(id) = self.free.pop() {
            debug_assert!(self.slots[id.index()].is_none());
            self.slots[id.index()] = Some(segment);
            return Ok(id);
        }
        let idx = self.slots.len();
        if idx > u32::MAX as usize {
            return Err(SegmentExhausted(idx));
        }
        self.slots.push(Some(segment));
        Ok(SegmentId(idx as u32))
    }

    pub fn get(&self, id: SegmentId) -> &Segment {
        self.slots[id.index()]
            .as_ref()
            .expect("segment id refers to a recycled slot")
    }

    /// Take an additional reference (a shadow record now points at `id`).
    pub fn acquire(&mut self, id: SegmentId) {
        let seg = self.slots[id.index()]
            .as_mut()
            .expect("acquire on recycled segment");
        seg.refs += 1;
    }

    /// Drop a reference; the slot is recycled when the count reaches zero.
    pub fn release(&mut self, id: SegmentId) {
        let seg = self.slots[id.index()]
            .as_mut()
            .expect("release on recycled segment");
        debug_assert!(seg.refs > 0);
        seg.refs -= 1;
        if seg.refs == 0 {
            self.slots[id.index()] = None;
            self.free.push(id);
            self.recycled += 1;
        }
    }

    /// Live (referenced) segment count.
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn minted(&self) -> u64 {
        self.minted
    }

    pub fn recycled(&self) -> u64 {
        self.recycled
    }
}
