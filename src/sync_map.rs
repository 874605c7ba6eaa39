//! Synchronization object map
//!
//! Every synchronization primitive referenced by the event stream is keyed
//! by its address. Entries are created lazily on first use (or eagerly on
//! LOCK_CREATE) and removed on LOCK_DESTROY; an event arriving for an
//! address currently bound to a different object variant re-binds the
//! address, which is the reuse-after-destroy defect pattern and is logged.

use crate::clock::ClockId;
use crate::threads::Tid;
use std::collections::{HashMap, VecDeque};
use tracing::warn;

/// Mutex state. Recursion is tracked on the owning thread, not here.
///
/// Two release clocks: writer releases snapshot into `release_clock`, reader
/// releases accumulate into `reader_release_clock`. A writer acquire joins
/// both; a reader acquire joins only `release_clock`, so two readers never
/// become ordered through the lock.
#[derive(Debug, Default)]
pub struct LockState {
    /// Clock snapshot taken at the last writer release.
    pub release_clock: Option<ClockId>,
    /// Join of reader-release clocks since the last writer acquire.
    pub reader_release_clock: Option<ClockId>,
    /// Lock upgraded to pure happens-before semantics (the
    /// mutex-used-as-condvar annotation), or running in pure-HB mode.
    pub pure_hb: bool,
    /// Current writer owner, for reuse/double-lock diagnostics.
    pub writer_owner: Option<Tid>,
}

/// Condition variable / semaphore / event state: signals accumulate into one
/// clock that waits pick up.
#[derive(Debug, Default)]
pub struct CondVarState {
    pub signal_clock: Option<ClockId>,
}

/// Cyclic barrier state.
#[derive(Debug)]
pub struct BarrierState {
    pub participants: u32,
    /// Arrivals in the current (unpublished) phase.
    pub arrived: u32,
    /// Join of the clocks contributed so far this phase.
    pub pending: Option<ClockId>,
    /// Clock published by the last completed phase.
    pub phase: Option<ClockId>,
    pub epoch: u64,
}

/// Producer-consumer queue: one clock per outstanding put.
#[derive(Debug, Default)]
pub struct PcqState {
    pub queue: VecDeque<ClockId>,
}

/// Handle installed by THR_CREATE_AFTER, mapping the handle address to the
/// child thread for diagnostics.
#[derive(Debug)]
pub struct ThreadHandleState {
    pub child: Tid,
}

#[derive(Debug)]
pub enum SyncObject {
    Lock(LockState),
    CondVar(CondVarState),
    Barrier(BarrierState),
    Pcq(PcqState),
    ThreadHandle(ThreadHandleState),
}

impl SyncObject {
    fn kind_name(&self) -> &'static str {
        match self {
            SyncObject::Lock(_) => "lock",
            SyncObject::CondVar(_) => "condvar",
            SyncObject::Barrier(_) => "barrier",
            SyncObject::Pcq(_) => "pcq",
            SyncObject::ThreadHandle(_) => "thread-handle",
        }
    }
}

/// Address-keyed map of all live synchronization objects.
#[derive(Debug, Default)]
pub struct SyncMap {
    objects: HashMap<u64, SyncObject>,
    created: u64,
    destroyed: u64,
    rebound: u64,
}

impl SyncMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn rebind(&mut self, addr: u64, wanted: &'static str, make: impl FnOnce() -> SyncObject) {
        if let Some(existing) = self.objects.get(&addr) {
            warn!(
                addr = format_args!("{addr:#x}"),
                was = existing.kind_name(),
                now = wanted,
                "sync object address re-bound; possible reuse after destroy"
            );
            self.rebound += 1;
        }
        self.created += 1;
        self.objects.insert(addr, make());
    }

    /// Lock at `addr`, created on first sight. `pure_hb` seeds the HB flag
    /// for new locks only; HB_LOCK/NON_HB_LOCK flip it later.
    pub fn lock_mut(&mut self, addr: u64, pure_hb: bool) -> &mut LockState {
        if !matches!(self.objects.get(&addr), Some(SyncObject::Lock(_))) {
            self.rebind(addr, "lock", || {
                SyncObject::Lock(LockState {
                    pure_hb,
                    ..LockState::default()
                })
            });
        }
        match self.objects.get_mut(&addr) {
            Some(SyncObject::Lock(state)) => state,
            _ => unreachable!("lock was just bound"),
        }
    }

    pub fn condvar_mut(&mut self, addr: u64) -> &mut CondVarState {
        if !matches!(self.objects.get(&addr), Some(SyncObject::CondVar(_))) {
            self.rebind(addr, "condvar", || SyncObject::CondVar(CondVarState::default()));
        }
        match self.objects.get_mut(&addr) {
            Some(SyncObject::CondVar(state)) => state,
            _ => unreachable!("condvar was just bound"),
        }
    }

    /// Barrier at `addr`. `participants` is used when the barrier is created
    /// implicitly by a wait (init event missing from the stream).
    pub fn barrier_mut(&mut self, addr: u64, participants: u32) -> &mut BarrierState {
        if !matches!(self.objects.get(&addr), Some(SyncObject::Barrier(_))) {
            self.rebind(addr, "barrier", || {
                SyncObject::Barrier(BarrierState {
                    participants,
                    arrived: 0,
                    pending: None,
                    phase: None,
                    epoch: 0,
                })
            });
        }
        match self.objects.get_mut(&addr) {
            Some(SyncObject::Barrier(state)) => state,
            _ => unreachable!("barrier was just bound"),
        }
    }

    pub fn pcq_mut(&mut self, addr: u64) -> &mut PcqState {
        if !matches!(self.objects.get(&addr), Some(SyncObject::Pcq(_))) {
            self.rebind(addr, "pcq", || SyncObject::Pcq(PcqState::default()));
        }
        match self.objects.get_mut(&addr) {
            Some(SyncObject::Pcq(state)) => state,
            _ => unreachable!("pcq was just bound"),
        }
    }

    pub fn bind_thread_handle(&mut self, addr: u64, child: Tid) {
        self.rebind(addr, "thread-handle", || {
            SyncObject::ThreadHandle(ThreadHandleState { child })
        });
    }

    /// Remove the object at `addr`. Returns whether anything was removed.
    pub fn destroy(&mut self, addr: u64) -> bool {
        let removed = self.objects.remove(&addr).is_some();
        if removed {
            self.destroyed += 1;
        }
        removed
    }

    pub fn get(&self, addr: u64) -> Option<&SyncObject> {
        self.objects.get(&addr)
    }

    pub fn live(&self) -> usize {
        self.objects.len()
    }

    pub fn created(&self) -> u64 {
        self.created
    }

    pub fn destroyed(&self) -> u64 {
        self.destroyed
    }

    pub fn rebound(&self) -> u64 {
        self.rebound
    }
}
