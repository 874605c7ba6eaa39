//! Per-thread analyzer state
//!
//! Thread ids are dense in `[0, N)`. The table owns one state record per
//! observed thread: its current vector clock and segment, held lock sets,
//! shadow call stack, ignore depths, and lifecycle flags. The record is
//! created on THR_START and marked finished on THR_END; finished threads
//! keep their final clock around so later THR_JOIN_AFTER events can pick it
//! up.

use crate::clock::ClockId;
use crate::lockset::LockSetId;
use crate::segment::SegmentId;
use std::collections::HashMap;
use std::fmt;

/// Dense thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tid(pub u32);

impl Tid {
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// One frame of the shadow call stack.
#[derive(Debug, Clone, Copy)]
pub struct StackFrame {
    pub call_pc: u64,
    pub target_pc: u64,
    /// Frame entered a routine whose memory operations are ignored; the
    /// matching RTN_EXIT ends the ignore scope.
    pub ignore_below: bool,
}

/// Mutable analyzer-side state of one thread.
#[derive(Debug)]
pub struct ThreadState {
    pub tid: Tid,
    pub parent: Option<Tid>,
    pub name: Option<String>,
    pub os_tid: Option<u64>,

    /// Current vector clock.
    pub clock: ClockId,
    /// Current segment; its snapshot may lag `clock` until the next
    /// synchronization boundary mints a fresh segment.
    pub segment: SegmentId,
    /// The current segment has accumulated at least one memory access.
    pub segment_dirty: bool,

    pub writer_locks: LockSetId,
    pub reader_locks: LockSetId,
    /// Writer-lock recursion depths, keyed by lock address. Only the
    /// outermost acquire/release has HB and lockset effects.
    pub lock_recursion: HashMap<u64, u32>,

    pub call_stack: Vec<StackFrame>,

    pub ignore_reads: u32,
    pub ignore_writes: u32,
    pub ignore_all: u32,
    pub ignore_sync: u32,

    /// Condvar address parked by WAIT_BEFORE, consumed by WAIT_AFTER.
    pub pending_wait: Option<u64>,
    /// Parent-side clock snapshot from THR_CREATE_BEFORE, consumed by the
    /// next THR_START of a child naming this thread as parent.
    pub create_snapshot: Option<ClockId>,

    /// Current trace is sampled out; accesses are counted but not analyzed.
    pub sampling_skip: bool,

    pub started: bool,
    pub finished: bool,
    pub final_clock: Option<ClockId>,
}

impl ThreadState {
    pub fn new(tid: Tid, parent: Option<Tid>, clock: ClockId, segment: SegmentId) -> Self {
        Self {
            tid,
            parent,
            name: None,
            os_tid: None,
            clock,
            segment,
            segment_dirty: false,
            writer_locks: LockSetId::EMPTY,
            reader_locks: LockSetId::EMPTY,
            lock_recursion: HashMap::new(),
            call_stack: Vec::new(),
            ignore_reads: 0,
            ignore_writes: 0,
            ignore_all: 0,
            ignore_sync: 0,
            pending_wait: None,
            create_snapshot: None,
            sampling_skip: false,
            started: true,
            finished: false,
            final_clock: None,
        }
    }

    pub fn reads_ignored(&self) -> bool {
        self.ignore_reads > 0 || self.ignore_all > 0 || self.in_ignore_below_scope()
    }

    pub fn writes_ignored(&self) -> bool {
        self.ignore_writes > 0 || self.ignore_all > 0 || self.in_ignore_below_scope()
    }

    pub fn sync_ignored(&self) -> bool {
        self.ignore_sync > 0
    }

    fn in_ignore_below_scope(&self) -> bool {
        self.call_stack.iter().any(|f| f.ignore_below)
    }

    /// Call-stack program counters with `top_pc` appended as the innermost
    /// frame, ready to capture into a segment.
    pub fn stack_pcs(&self, top_pc: u64) -> Vec<u64> {
        let mut pcs: Vec<u64> = self.call_stack.iter().map(|f| f.call_pc).collect();
        if top_pc != 0 {
            pcs.push(top_pc);
        }
        pcs
    }

    /// Display label for reports: the assigned name if any, else `T<n>`.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{} ({})", self.tid, name),
            None => self.tid.to_string(),
        }
    }
}

/// Dense table of thread states, indexed by tid.
#[derive(Debug, Default)]
pub struct ThreadTable {
    threads: Vec<Option<ThreadState>>,
}

impl ThreadTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, state: ThreadState) {
        let idx = state.tid.as_usize();
        if idx >= self.threads.len() {
            self.threads.resize_with(idx + 1, || None);
        }
        self.threads[idx] = Some(state);
    }

    pub fn get(&self, tid: Tid) -> Option<&ThreadState> {
        self.threads.get(tid.as_usize())?.as_ref()
    }

    pub fn get_mut(&mut self, tid: Tid) -> Option<&mut ThreadState> {
        self.threads.get_mut(tid.as_usize())?.as_mut()
    }

    pub fn exists(&self, tid: Tid) -> bool {
        self.get(tid).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ThreadState> {
        self.threads.iter().filter_map(|t| t.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ThreadState> {
        self.threads.iter_mut().filter_map(|t| t.as_mut())
    }

    /// Number of threads ever started.
    pub fn len(&self) -> usize {
        self.threads.iter().filter(|t| t.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentTable;
    use std::sync::Arc;

    fn new_thread(tid: u32) -> (ThreadState, SegmentTable) {
        let mut segments = SegmentTable::new();
        let sid = segments
            .mint(
                Tid(tid),
                ClockId::ZERO,
                LockSetId::EMPTY,
                LockSetId::EMPTY,
                Arc::from(Vec::new().into_boxed_slice()),
            )
            .unwrap();
        (ThreadState::new(Tid(tid), None, ClockId::ZERO, sid), segments)
    }

    #[test]
    fn test_table_dense_insert_and_lookup() {
        let mut table = ThreadTable::new();
        let (t5, _) = new_thread(5);
        table.insert(t5);
        assert!(table.exists(Tid(5)));
        assert!(!table.exists(Tid(4)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_ignore_depths() {
        let (mut t, _) = new_thread(0);
        assert!(!t.reads_ignored());
        t.ignore_reads = 1;
        assert!(t.reads_ignored());
        assert!(!t.writes_ignored());
        t.ignore_reads = 0;
        t.ignore_all = 1;
        assert!(t.reads_ignored());
        assert!(t.writes_ignored());
    }

    #[test]
    fn test_ignore_below_scope() {
        let (mut t, _) = new_thread(0);
        t.call_stack.push(StackFrame {
            call_pc: 0x10,
            target_pc: 0x100,
            ignore_below: true,
        });
        assert!(t.reads_ignored());
        assert!(t.writes_ignored());
        t.call_stack.pop();
        assert!(!t.reads_ignored());
    }

    #[test]
    fn test_stack_pcs_appends_top() {
        let (mut t, _) = new_thread(0);
        t.call_stack.push(StackFrame {
            call_pc: 0x10,
            target_pc: 0x100,
            ignore_below: false,
        });
        t.call_stack.push(StackFrame {
            call_pc: 0x20,
            target_pc: 0x200,
            ignore_below: false,
        });
        assert_eq!(t.stack_pcs(0x30), vec![0x10, 0x20, 0x30]);
        assert_eq!(t.stack_pcs(0), vec![0x10, 0x20]);
    }

    #[test]
    fn test_label_prefers_name() {
        let (mut t, _) = new_thread(3);
        assert_eq!(t.label(), "T3");
        t.name = Some("worker".to_string());
        assert_eq!(t.label(), "T3 (worker)");
    }
}
