//! Event records exchanged between producers and the analyzer
//!
//! Every observable action of a traced program is encoded as a fixed-shape
//! 5-tuple: `{kind, tid, pc, addr, info}`. The meaning of `addr` and `info`
//! depends on the kind (access size for READ/WRITE, participant count for
//! CYCLIC_BARRIER_INIT, parent tid for THR_START, and so on).
//!
//! The kind set is closed: producers may not invent new kinds, and the
//! offline log reader rejects unknown names.

use serde::Serialize;
use std::fmt;

/// Closed set of event kinds understood by the analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    Noop,
    Read,
    Write,
    WriterLock,
    ReaderLock,
    Unlock,
    UnlockOrInit,
    LockCreate,
    LockDestroy,
    HbLock,
    NonHbLock,
    Signal,
    Wait,
    WaitBefore,
    WaitAfter,
    CyclicBarrierInit,
    CyclicBarrierWaitBefore,
    CyclicBarrierWaitAfter,
    PcqCreate,
    PcqDestroy,
    PcqPut,
    PcqGet,
    ThrStart,
    ThrFirstInsn,
    ThrEnd,
    ThrCreateBefore,
    ThrCreateAfter,
    ThrJoinBefore,
    ThrJoinAfter,
    ThrStackTop,
    ThrSetPtid,
    RtnCall,
    RtnExit,
    SblockEnter,
    StackTrace,
    Malloc,
    Free,
    Mmap,
    Munmap,
    PublishRange,
    UnpublishRange,
    ExpectRace,
    BenignRace,
    FlushState,
    IgnoreReadsBeg,
    IgnoreReadsEnd,
    IgnoreWritesBeg,
    IgnoreWritesEnd,
    IgnoreAllBeg,
    IgnoreAllEnd,
    IgnoreSyncBeg,
    IgnoreSyncEnd,
    GlobalIgnoreOn,
    GlobalIgnoreOff,
    SetThreadName,
    TraceMem,
}

/// All kinds, in wire-name order. Used to build the name lookup table and to
/// iterate per-kind statistics.
pub const ALL_KINDS: &[EventKind] = &[
    EventKind::Noop,
    EventKind::Read,
    EventKind::Write,
    EventKind::WriterLock,
    EventKind::ReaderLock,
    EventKind::Unlock,
    EventKind::UnlockOrInit,
    EventKind::LockCreate,
    EventKind::LockDestroy,
    EventKind::HbLock,
    EventKind::NonHbLock,
    EventKind::Signal,
    EventKind::Wait,
    EventKind::WaitBefore,
    EventKind::WaitAfter,
    EventKind::CyclicBarrierInit,
    EventKind::CyclicBarrierWaitBefore,
    EventKind::CyclicBarrierWaitAfter,
    EventKind::PcqCreate,
    EventKind::PcqDestroy,
    EventKind::PcqPut,
    EventKind::PcqGet,
    EventKind::ThrStart,
    EventKind::ThrFirstInsn,
    EventKind::ThrEnd,
    EventKind::ThrCreateBefore,
    EventKind::ThrCreateAfter,
    EventKind::ThrJoinBefore,
    EventKind::ThrJoinAfter,
    EventKind::ThrStackTop,
    EventKind::ThrSetPtid,
    EventKind::RtnCall,
    EventKind::RtnExit,
    EventKind::SblockEnter,
    EventKind::StackTrace,
    EventKind::Malloc,
    EventKind::Free,
    EventKind::Mmap,
    EventKind::Munmap,
    EventKind::PublishRange,
    EventKind::UnpublishRange,
    EventKind::ExpectRace,
    EventKind::BenignRace,
    EventKind::FlushState,
    EventKind::IgnoreReadsBeg,
    EventKind::IgnoreReadsEnd,
    EventKind::IgnoreWritesBeg,
    EventKind::IgnoreWritesEnd,
    EventKind::IgnoreAllBeg,
    EventKind::IgnoreAllEnd,
    EventKind::IgnoreSyncBeg,
    EventKind::IgnoreSyncEnd,
    EventKind::GlobalIgnoreOn,
    EventKind::GlobalIgnoreOff,
    EventKind::SetThreadName,
    EventKind::TraceMem,
];

impl EventKind {
    /// Wire name used by the offline log format.
    pub fn name(self) -> &'static str {
        match self {
            EventKind::Noop => "NOOP",
            EventKind::Read => "READ",
            EventKind::Write => "WRITE",
            EventKind::WriterLock => "WRITER_LOCK",
            EventKind::ReaderLock => "READER_LOCK",
            EventKind::Unlock => "UNLOCK",
            EventKind::UnlockOrInit => "UNLOCK_OR_INIT",
            EventKind::LockCreate => "LOCK_CREATE",
            EventKind::LockDestroy => "LOCK_DESTROY",
            EventKind::HbLock => "HB_LOCK",
            EventKind::NonHbLock => "NON_HB_LOCK",
            EventKind::Signal => "SIGNAL",
            EventKind::Wait => "WAIT",
            EventKind::WaitBefore => "WAIT_BEFORE",
            EventKind::WaitAfter => "WAIT_AFTER",
            EventKind::CyclicBarrierInit => "CYCLIC_BARRIER_INIT",
            EventKind::CyclicBarrierWaitBefore => "CYCLIC_BARRIER_WAIT_BEFORE",
            EventKind::CyclicBarrierWaitAfter => "CYCLIC_BARRIER_WAIT_AFTER",
            EventKind::PcqCreate => "PCQ_CREATE",
            EventKind::PcqDestroy => "PCQ_DESTROY",
            EventKind::PcqPut => "PCQ_PUT",
            EventKind::PcqGet => "PCQ_GET",
            EventKind::ThrStart => "THR_START",
            EventKind::ThrFirstInsn => "THR_FIRST_INSN",
            EventKind::ThrEnd => "THR_END",
            EventKind::ThrCreateBefore => "THR_CREATE_BEFORE",
            EventKind::ThrCreateAfter => "THR_CREATE_AFTER",
            EventKind::ThrJoinBefore => "THR_JOIN_BEFORE",
            EventKind::ThrJoinAfter => "THR_JOIN_AFTER",
            EventKind::ThrStackTop => "THR_STACK_TOP",
            EventKind::ThrSetPtid => "THR_SET_PTID",
            EventKind::RtnCall => "RTN_CALL",
            EventKind::RtnExit => "RTN_EXIT",
            EventKind::SblockEnter => "SBLOCK_ENTER",
            EventKind::StackTrace => "STACK_TRACE",
            EventKind::Malloc => "MALLOC",
            EventKind::Free => "FREE",
            EventKind::Mmap => "MMAP",
            EventKind::Munmap => "MUNMAP",
            EventKind::PublishRange => "PUBLISH_RANGE",
            EventKind::UnpublishRange => "UNPUBLISH_RANGE",
            EventKind::ExpectRace => "EXPECT_RACE",
            EventKind::BenignRace => "BENIGN_RACE",
            EventKind::FlushState => "FLUSH_STATE",
            EventKind::IgnoreReadsBeg => "IGNORE_READS_BEG",
            EventKind::IgnoreReadsEnd => "IGNORE_READS_END",
            EventKind::IgnoreWritesBeg => "IGNORE_WRITES_BEG",
            EventKind::IgnoreWritesEnd => "IGNORE_WRITES_END",
            EventKind::IgnoreAllBeg => "IGNORE_ALL_BEG",
            EventKind::IgnoreAllEnd => "IGNORE_ALL_END",
            EventKind::IgnoreSyncBeg => "IGNORE_SYNC_BEG",
            EventKind::IgnoreSyncEnd => "IGNORE_SYNC_END",
            EventKind::GlobalIgnoreOn => "GLOBAL_IGNORE_ON",
            EventKind::GlobalIgnoreOff => "GLOBAL_IGNORE_OFF",
            EventKind::SetThreadName => "SET_THREAD_NAME",
            EventKind::TraceMem => "TRACE_MEM",
        }
    }

    /// Inverse of [`EventKind::name`]. Returns `None` for unknown names.
    pub fn from_name(name: &str) -> Option<EventKind> {
        ALL_KINDS.iter().copied().find(|k| k.name() == name)
    }

    /// Memory access kinds (READ/WRITE).
    pub fn is_access(self) -> bool {
        matches!(self, EventKind::Read | EventKind::Write)
    }

    /// Kinds the event pipeline may batch in a thread-local buffer. Every
    /// other kind forces the producing thread's buffer to flush first so the
    /// analyzer observes synchronization in stream order.
    pub fn is_batched(self) -> bool {
        matches!(
            self,
            EventKind::Read
                | EventKind::Write
                | EventKind::RtnCall
                | EventKind::RtnExit
                | EventKind::SblockEnter
                | EventKind::Noop
        )
    }

    /// Kinds whose effect is visible to every thread (annotations, global
    /// ignores, state flush). The pipeline drains all buffers before these.
    pub fn is_global(self) -> bool {
        matches!(
            self,
            EventKind::ExpectRace
                | EventKind::BenignRace
                | EventKind::FlushState
                | EventKind::PublishRange
                | EventKind::UnpublishRange
                | EventKind::GlobalIgnoreOn
                | EventKind::GlobalIgnoreOff
                | EventKind::TraceMem
        )
    }

    /// Coarse class used for per-kind statistics.
    pub fn class(self) -> EventClass {
        use EventKind::*;
        match self {
            Read | Write => EventClass::Access,
            WriterLock | ReaderLock | Unlock | UnlockOrInit | LockCreate | LockDestroy
            | HbLock | NonHbLock | Signal | Wait | WaitBefore | WaitAfter
            | CyclicBarrierInit | CyclicBarrierWaitBefore | CyclicBarrierWaitAfter
            | PcqCreate | PcqDestroy | PcqPut | PcqGet => EventClass::Sync,
            ThrStart | ThrFirstInsn | ThrEnd | ThrCreateBefore | ThrCreateAfter
            | ThrJoinBefore | ThrJoinAfter | ThrStackTop | ThrSetPtid | SetThreadName => {
                EventClass::Thread
            }
            RtnCall | RtnExit | SblockEnter | StackTrace => EventClass::Routine,
            Malloc | Free | Mmap | Munmap => EventClass::Memory,
            ExpectRace | BenignRace | PublishRange | UnpublishRange | TraceMem => {
                EventClass::Annotation
            }
            Noop | FlushState | IgnoreReadsBeg | IgnoreReadsEnd | IgnoreWritesBeg
            | IgnoreWritesEnd | IgnoreAllBeg | IgnoreAllEnd | IgnoreSyncBeg | IgnoreSyncEnd
            | GlobalIgnoreOn | GlobalIgnoreOff => EventClass::Control,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Statistics bucket for an event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventClass {
    Access,
    Sync,
    Thread,
    Routine,
    Memory,
    Annotation,
    Control,
}

pub const ALL_CLASSES: &[EventClass] = &[
    EventClass::Access,
    EventClass::Sync,
    EventClass::Thread,
    EventClass::Routine,
    EventClass::Memory,
    EventClass::Annotation,
    EventClass::Control,
];

impl EventClass {
    pub fn name(self) -> &'static str {
        match self {
            EventClass::Access => "access",
            EventClass::Sync => "sync",
            EventClass::Thread => "thread",
            EventClass::Routine => "routine",
            EventClass::Memory => "memory",
            EventClass::Annotation => "annotation",
            EventClass::Control => "control",
        }
    }
}

/// One producer-side event record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub tid: u32,
    pub pc: u64,
    pub addr: u64,
    pub info: u64,
}

impl Event {
    pub fn new(kind: EventKind, tid: u32, pc: u64, addr: u64, info: u64) -> Self {
        Self {
            kind,
            tid,
            pc,
            addr,
            info,
        }
    }

    /// Access size for READ/WRITE events. A zero `info` field means a
    /// one-byte access.
    pub fn access_size(&self) -> u64 {
        debug_assert!(self.kind.is_access());
        if self.info == 0 {
            1
        } else {
            self.info
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:x} {:x} {:x} {:x}",
            self.kind, self.tid, self.pc, self.addr, self.info
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_round_trip() {
        for &kind in ALL_KINDS {
            assert_eq!(EventKind::from_name(kind.name()), Some(kind));
        }
    }

    #[test]
    fn test_unknown_name_rejected() {
        assert_eq!(EventKind::from_name("BOGUS"), None);
        assert_eq!(EventKind::from_name("read"), None); // case-sensitive
        assert_eq!(EventKind::from_name(""), None);
    }

    #[test]
    fn test_all_kinds_has_no_duplicates() {
        use std::collections::HashSet;
        let set: HashSet<_> = ALL_KINDS.iter().map(|k| k.name()).collect();
        assert_eq!(set.len(), ALL_KINDS.len());
    }

    #[test]
    fn test_access_size_defaults_to_one_byte() {
        let e = Event::new(EventKind::Read, 1, 0x100, 0x1000, 0);
        assert_eq!(e.access_size(), 1);
        let e = Event::new(EventKind::Write, 1, 0x100, 0x1000, 4);
        assert_eq!(e.access_size(), 4);
    }

    #[test]
    fn test_batched_kinds_are_thread_local() {
        // Everything batched must be free of cross-thread effects.
        for &kind in ALL_KINDS {
            if kind.is_batched() {
                assert!(!kind.is_global(), "{kind} both batched and global");
            }
        }
    }

    #[test]
    fn test_display_matches_offline_format() {
        let e = Event::new(EventKind::Write, 1, 0x100, 0x1000, 4);
        assert_eq!(e.to_string(), "WRITE 1 100 1000 4");
    }
}
