//! The analyzer: single-threaded consumer of the event stream
//!
//! All detector state lives here and is mutated only while the caller holds
//! the pipeline's analyzer lock, so the analysis itself is logically
//! single-threaded. Each event updates the relevant segment, vector clock,
//! lock set, sync object and shadow cell, and may emit race reports through
//! the sink.
//!
//! Protocol violations (events that no correct producer can emit) are
//! returned as [`ProtocolError`]; the analyzer's state must be considered
//! corrupt afterwards and the driver exits. Race reports are not errors and
//! never stop the stream.

use crate::annotations::{AnnotationMap, Range};
use crate::clock::{ClockId, ClockOverflow, ClockTable};
use crate::config::Options;
use crate::events::{Event, EventKind};
use crate::heap::HeapMap;
use crate::lockset::{LockSetId, LockSetTable};
use crate::report::{
    AccessSnapshot, Frame, HeapInfo, RaceReport, ReportSink, Suppressions, SymbolTable, Symbolizer,
};
use crate::segment::{SegmentExhausted, SegmentId, SegmentTable};
use crate::shadow::{split_access, AccessRecord, ShadowMemory};
use crate::stats::Stats;
use crate::sync_map::SyncMap;
use crate::threads::{StackFrame, ThreadState, ThreadTable, Tid};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Event-count budget a producer may analyze under one lock acquisition in
/// the ON_SYSCALL locking scheme.
pub const ON_SYSCALL_EVENT_BUDGET: u64 = 1 << 18;

/// Thread ids are dense in `[0, N)`; anything past this bound is a malformed
/// stream, not a real thread.
pub const MAX_THREADS: u32 = 1 << 16;

/// Largest single memory access analyzed byte-by-byte. Instruction operands
/// are at most a cache line; anything bigger in a log is clamped (bulk moves
/// are reported as MALLOC/MMAP-style range events, not accesses).
pub const MAX_ACCESS_BYTES: u64 = 4096;

/// Fatal stream malformations. The analyzer cannot continue past any of
/// these; its invariants no longer hold.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("event for unknown thread T{tid}")]
    UnknownThread { tid: u32 },
    #[error("THR_START for already-live thread T{tid}")]
    ThreadRestarted { tid: u32 },
    #[error("thread id {tid} exceeds the dense tid bound {MAX_THREADS}")]
    TidOutOfRange { tid: u32 },
    #[error("event {kind} for finished thread T{tid}")]
    EventOnFinishedThread { tid: u32, kind: EventKind },
    #[error("buffer flush for finished thread T{tid}")]
    FlushOnDeadThread { tid: u32 },
    #[error("ignore depth underflow for T{tid} ({scope})")]
    NegativeIgnoreDepth { tid: u32, scope: &'static str },
    #[error(transparent)]
    ClockOverflow(#[from] ClockOverflow),
    #[error(transparent)]
    SegmentExhausted(#[from] SegmentExhausted),
}

/// Final run summary returned by [`Analyzer::finalize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Finalization {
    pub races_reported: u64,
    pub expectations_unfired: u64,
}

pub struct Analyzer {
    opts: Options,
    clocks: ClockTable,
    locksets: LockSetTable,
    segments: SegmentTable,
    threads: ThreadTable,
    shadow: ShadowMemory,
    sync: SyncMap,
    annotations: AnnotationMap,
    heap: HeapMap,
    suppressions: Suppressions,
    stats: Stats,
    sink: Box<dyn ReportSink + Send>,
    symbols: SymbolTable,
    host_symbolizer: Option<Box<dyn Symbolizer + Send>>,
    /// Per-trace (per-PC) hit counters for sampling.
    trace_hits: HashMap<u64, u64>,
    global_ignore: bool,
    finalized: bool,
}

fn live_thread<'a>(
    threads: &'a mut ThreadTable,
    tid: u32,
    kind: EventKind,
) -> Result<&'a mut ThreadState, ProtocolError> {
    let t = threads
        .get_mut(Tid(tid))
        .ok_or(ProtocolError::UnknownThread { tid })?;
    if t.finished {
        return Err(ProtocolError::EventOnFinishedThread { tid, kind });
    }
    Ok(t)
}

/// Mint a fresh segment for `tid` from its current clock, lock sets and call
/// stack, and release the previous one. Called at every synchronization
/// boundary.
fn resegment(
    threads: &mut ThreadTable,
    segments: &mut SegmentTable,
    tid: u32,
    pc: u64,
) -> Result<(), ProtocolError> {
    let t = threads
        .get_mut(Tid(tid))
        .ok_or(ProtocolError::UnknownThread { tid })?;
    let stack: Arc<[u64]> = t.stack_pcs(pc).into();
    let sid = segments.mint(t.tid, t.clock, t.writer_locks, t.reader_locks, stack)?;
    let old = std::mem::replace(&mut t.segment, sid);
    t.segment_dirty = false;
    segments.release(old);
    Ok(())
}

impl Analyzer {
    pub fn new(opts: Options, sink: Box<dyn ReportSink + Send>) -> Self {
        Self {
            opts,
            clocks: ClockTable::new(),
            locksets: LockSetTable::new(),
            segments: SegmentTable::new(),
            threads: ThreadTable::new(),
            shadow: ShadowMemory::new(),
            sync: SyncMap::new(),
            annotations: AnnotationMap::new(),
            heap: HeapMap::new(),
            suppressions: Suppressions::new(),
            stats: Stats::new(),
            sink,
            symbols: SymbolTable::new(),
            host_symbolizer: None,
            trace_hits: HashMap::new(),
            global_ignore: false,
            finalized: false,
        }
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Install a `#PC` symbol mapping (offline logs) for report stacks.
    pub fn install_pc(&mut self, pc: u64, descr: crate::report::PcDescr) {
        self.symbols.install(pc, descr);
    }

    /// Inject a host symbolizer; it takes precedence over installed `#PC`
    /// mappings.
    pub fn set_symbolizer(&mut self, symbolizer: Box<dyn Symbolizer + Send>) {
        self.host_symbolizer = Some(symbolizer);
    }

    /// Attach a display name to a thread.
    pub fn set_thread_name(&mut self, tid: u32, name: impl Into<String>) {
        if let Some(t) = self.threads.get_mut(Tid(tid)) {
            t.name = Some(name.into());
        }
    }

    pub fn races_reported(&self) -> u64 {
        self.stats.races_reported
    }

    /// Consume one flushed buffer. The buffer owner must still be live (or
    /// not yet started); per-thread event order inside the buffer is the
    /// producer's program order.
    pub fn handle_buffer(&mut self, owner: u32, events: &[Event]) -> Result<(), ProtocolError> {
        if let Some(t) = self.threads.get(Tid(owner)) {
            if t.finished {
                return Err(ProtocolError::FlushOnDeadThread { tid: owner });
            }
        }
        self.stats.flushes += 1;
        for event in events {
            self.handle_event(event)?;
        }
        Ok(())
    }

    pub fn handle_event(&mut self, event: &Event) -> Result<(), ProtocolError> {
        self.stats.count_event(event.kind.class());
        let tid = event.tid;
        let pc = event.pc;
        let addr = event.addr;
        let info = event.info;

        match event.kind {
            EventKind::Noop => {}

            EventKind::Read => self.handle_access(tid, pc, addr, event.access_size(), false)?,
            EventKind::Write => self.handle_access(tid, pc, addr, event.access_size(), true)?,

            EventKind::ThrStart => self.handle_thread_start(tid, pc, addr as u32)?,
            EventKind::ThrFirstInsn => {}
            EventKind::ThrEnd => {
                let t = live_thread(&mut self.threads, tid, event.kind)?;
                t.finished = true;
                t.final_clock = Some(t.clock);
                let sid = t.segment;
                self.segments.release(sid);
                self.stats.threads_finished += 1;
            }
            EventKind::ThrCreateBefore => {
                let t = live_thread(&mut self.threads, tid, event.kind)?;
                t.create_snapshot = Some(t.clock);
                t.clock = self.clocks.tick(t.clock, tid)?;
                resegment(&mut self.threads, &mut self.segments, tid, pc)?;
            }
            EventKind::ThrCreateAfter => {
                // addr carries the child tid; info (when nonzero) the handle
                // address the host will join through.
                let child = Tid(addr as u32);
                if info != 0 {
                    self.sync.bind_thread_handle(info, child);
                }
                if let Some(c) = self.threads.get_mut(child) {
                    if c.parent.is_none() {
                        c.parent = Some(Tid(tid));
                    }
                }
            }
            EventKind::ThrJoinBefore => {}
            EventKind::ThrJoinAfter => {
                let child_clock = match self.threads.get(Tid(addr as u32)) {
                    Some(c) => {
                        if c.final_clock.is_none() {
                            warn!(joiner = tid, child = addr, "join on unfinished thread");
                        }
                        c.final_clock.unwrap_or(c.clock)
                    }
                    None => {
                        warn!(joiner = tid, child = addr, "join on unknown thread");
                        return Ok(());
                    }
                };
                let t = live_thread(&mut self.threads, tid, event.kind)?;
                t.clock = self.clocks.join(t.clock, child_clock);
                resegment(&mut self.threads, &mut self.segments, tid, pc)?;
            }
            EventKind::ThrStackTop => {
                // addr = stack top, info = stack size. The fresh stack range
                // holds no shared history.
                let size = if info == 0 { 64 * 1024 } else { info };
                let base = addr.saturating_sub(size);
                self.shadow.clear_range(base, size, &mut self.segments);
            }
            EventKind::ThrSetPtid => {
                let t = live_thread(&mut self.threads, tid, event.kind)?;
                t.os_tid = Some(addr);
            }
            EventKind::SetThreadName => {
                let t = live_thread(&mut self.threads, tid, event.kind)?;
                if addr != 0 {
                    t.name = Some(format!("thr#{addr:x}"));
                }
            }

            EventKind::SblockEnter => {
                let skip = self.sampling_skip(pc);
                let t = live_thread(&mut self.threads, tid, event.kind)?;
                t.sampling_skip = skip;
                if t.segment_dirty {
                    resegment(&mut self.threads, &mut self.segments, tid, pc)?;
                }
            }
            EventKind::StackTrace => {
                // Unconditional stack refresh.
                live_thread(&mut self.threads, tid, event.kind)?;
                resegment(&mut self.threads, &mut self.segments, tid, pc)?;
            }
            EventKind::RtnCall => {
                let t = live_thread(&mut self.threads, tid, event.kind)?;
                t.call_stack.push(StackFrame {
                    call_pc: pc,
                    target_pc: addr,
                    ignore_below: info != 0,
                });
            }
            EventKind::RtnExit => {
                let t = live_thread(&mut self.threads, tid, event.kind)?;
                if t.call_stack.pop().is_none() {
                    warn!(tid, "RTN_EXIT with empty shadow stack");
                }
            }

            EventKind::WriterLock => self.handle_writer_lock(tid, pc, addr)?,
            EventKind::ReaderLock => self.handle_reader_lock(tid, pc, addr)?,
            EventKind::Unlock => self.handle_unlock(tid, pc, addr)?,
            EventKind::UnlockOrInit => {
                let t = live_thread(&mut self.threads, tid, event.kind)?;
                if t.sync_ignored() {
                    return Ok(());
                }
                let clock = t.clock;
                let lock = self.sync.lock_mut(addr, self.opts.pure_happens_before);
                lock.release_clock = Some(clock);
                t.clock = self.clocks.tick(clock, tid)?;
                resegment(&mut self.threads, &mut self.segments, tid, pc)?;
            }
            EventKind::LockCreate => {
                self.sync.lock_mut(addr, self.opts.pure_happens_before);
            }
            EventKind::LockDestroy => {
                if !self.sync.destroy(addr) {
                    debug!(addr = format_args!("{addr:#x}"), "destroy of unknown lock");
                }
            }
            EventKind::HbLock => {
                self.sync.lock_mut(addr, self.opts.pure_happens_before).pure_hb = true;
            }
            EventKind::NonHbLock => {
                self.sync.lock_mut(addr, self.opts.pure_happens_before).pure_hb = false;
            }

            EventKind::Signal => {
                let t = live_thread(&mut self.threads, tid, event.kind)?;
                if t.sync_ignored() {
                    return Ok(());
                }
                let clock = t.clock;
                let cv = self.sync.condvar_mut(addr);
                cv.signal_clock = Some(match cv.signal_clock {
                    Some(prev) => self.clocks.join(prev, clock),
                    None => clock,
                });
                t.clock = self.clocks.tick(clock, tid)?;
                resegment(&mut self.threads, &mut self.segments, tid, pc)?;
            }
            EventKind::Wait => self.handle_wait(tid, pc, addr)?,
            EventKind::WaitBefore => {
                let t = live_thread(&mut self.threads, tid, event.kind)?;
                t.pending_wait = Some(addr);
            }
            EventKind::WaitAfter => {
                let t = live_thread(&mut self.threads, tid, event.kind)?;
                let target = if addr != 0 { Some(addr) } else { t.pending_wait };
                t.pending_wait = None;
                if let Some(target) = target {
                    self.handle_wait(tid, pc, target)?;
                }
            }

            EventKind::CyclicBarrierInit => {
                self.sync.barrier_mut(addr, info as u32).participants = info as u32;
            }
            EventKind::CyclicBarrierWaitBefore => {
                let t = live_thread(&mut self.threads, tid, event.kind)?;
                if t.sync_ignored() {
                    return Ok(());
                }
                let clock = t.clock;
                t.clock = self.clocks.tick(clock, tid)?;
                let b = self.sync.barrier_mut(addr, 0);
                b.pending = Some(match b.pending {
                    Some(prev) => self.clocks.join(prev, clock),
                    None => clock,
                });
                b.arrived += 1;
                if b.participants > 0 && b.arrived >= b.participants {
                    b.phase = b.pending.take();
                    b.arrived = 0;
                    b.epoch += 1;
                }
                resegment(&mut self.threads, &mut self.segments, tid, pc)?;
            }
            EventKind::CyclicBarrierWaitAfter => {
                let t = live_thread(&mut self.threads, tid, event.kind)?;
                if t.sync_ignored() {
                    return Ok(());
                }
                let phase = self.sync.barrier_mut(addr, 0).phase;
                match phase {
                    Some(phase) => {
                        t.clock = self.clocks.join(t.clock, phase);
                        resegment(&mut self.threads, &mut self.segments, tid, pc)?;
                    }
                    None => warn!(
                        tid,
                        addr = format_args!("{addr:#x}"),
                        "barrier wait-after without a completed phase"
                    ),
                }
            }

            EventKind::PcqCreate => {
                self.sync.pcq_mut(addr);
            }
            EventKind::PcqDestroy => {
                self.sync.destroy(addr);
            }
            EventKind::PcqPut => {
                let t = live_thread(&mut self.threads, tid, event.kind)?;
                if t.sync_ignored() {
                    return Ok(());
                }
                let clock = t.clock;
                self.sync.pcq_mut(addr).queue.push_back(clock);
                t.clock = self.clocks.tick(clock, tid)?;
                resegment(&mut self.threads, &mut self.segments, tid, pc)?;
            }
            EventKind::PcqGet => {
                let t = live_thread(&mut self.threads, tid, event.kind)?;
                if t.sync_ignored() {
                    return Ok(());
                }
                match self.sync.pcq_mut(addr).queue.pop_front() {
                    Some(put_clock) => {
                        t.clock = self.clocks.join(t.clock, put_clock);
                        resegment(&mut self.threads, &mut self.segments, tid, pc)?;
                    }
                    None => warn!(
                        tid,
                        addr = format_args!("{addr:#x}"),
                        "PCQ_GET on empty queue"
                    ),
                }
            }

            EventKind::Malloc | EventKind::Mmap => {
                self.shadow.clear_range(addr, info, &mut self.segments);
                self.heap.alloc(addr, info, Tid(tid), pc);
            }
            EventKind::Free | EventKind::Munmap => {
                let size = match self.heap.free(addr) {
                    Some(block) => block.size,
                    None => info,
                };
                self.shadow.clear_range(addr, size, &mut self.segments);
            }

            EventKind::PublishRange => {
                let t = live_thread(&mut self.threads, tid, event.kind)?;
                let clock = t.clock;
                self.annotations.publish(addr, info, clock);
                t.clock = self.clocks.tick(clock, tid)?;
                resegment(&mut self.threads, &mut self.segments, tid, pc)?;
            }
            EventKind::UnpublishRange => {
                self.annotations.unpublish(addr, info);
            }
            EventKind::ExpectRace => {
                self.annotations.expect_race(addr, info, pc);
            }
            EventKind::BenignRace => {
                self.annotations.benign_race(addr, info);
            }
            EventKind::TraceMem => {
                self.annotations.trace_mem(addr);
            }
            EventKind::FlushState => {
                self.shadow.clear_all(&mut self.segments);
                self.suppressions.clear();
                self.heap.clear();
            }

            EventKind::IgnoreReadsBeg => {
                live_thread(&mut self.threads, tid, event.kind)?.ignore_reads += 1;
            }
            EventKind::IgnoreReadsEnd => {
                let t = live_thread(&mut self.threads, tid, event.kind)?;
                t.ignore_reads = Self::dec_ignore(t.ignore_reads, tid, "reads")?;
            }
            EventKind::IgnoreWritesBeg => {
                live_thread(&mut self.threads, tid, event.kind)?.ignore_writes += 1;
            }
            EventKind::IgnoreWritesEnd => {
                let t = live_thread(&mut self.threads, tid, event.kind)?;
                t.ignore_writes = Self::dec_ignore(t.ignore_writes, tid, "writes")?;
            }
            EventKind::IgnoreAllBeg => {
                live_thread(&mut self.threads, tid, event.kind)?.ignore_all += 1;
            }
            EventKind::IgnoreAllEnd => {
                let t = live_thread(&mut self.threads, tid, event.kind)?;
                t.ignore_all = Self::dec_ignore(t.ignore_all, tid, "all")?;
            }
            EventKind::IgnoreSyncBeg => {
                live_thread(&mut self.threads, tid, event.kind)?.ignore_sync += 1;
            }
            EventKind::IgnoreSyncEnd => {
                let t = live_thread(&mut self.threads, tid, event.kind)?;
                t.ignore_sync = Self::dec_ignore(t.ignore_sync, tid, "sync")?;
            }
            EventKind::GlobalIgnoreOn => self.global_ignore = true,
            EventKind::GlobalIgnoreOff => self.global_ignore = false,
        }
        Ok(())
    }

    fn dec_ignore(depth: u32, tid: u32, scope: &'static str) -> Result<u32, ProtocolError> {
        depth
            .checked_sub(1)
            .ok_or(ProtocolError::NegativeIgnoreDepth { tid, scope })
    }

    fn sampling_skip(&mut self, trace_pc: u64) -> bool {
        if self.opts.literace_sampling == 0 {
            return false;
        }
        let period = 1u64 << self.opts.literace_sampling.min(31);
        let hits = self.trace_hits.entry(trace_pc).or_insert(0);
        *hits += 1;
        *hits > period && *hits % period != 0
    }

    fn handle_thread_start(
        &mut self,
        tid: u32,
        pc: u64,
        parent: u32,
    ) -> Result<(), ProtocolError> {
        if tid >= MAX_THREADS {
            return Err(ProtocolError::TidOutOfRange { tid });
        }
        if self.threads.exists(Tid(tid)) {
            // Dense tids are lifetime-stable; reuse after THR_END is a
            // restart too.
            return Err(ProtocolError::ThreadRestarted { tid });
        }

        // Seed the child clock from the parent: preferably the snapshot the
        // parent took at THR_CREATE_BEFORE, else its current clock. Tid 0 is
        // a valid parent when it exists; an absent parent is only noisy when
        // it was named explicitly.
        let mut parent_tid = (parent != tid).then_some(Tid(parent));
        let mut base = ClockId::ZERO;
        if let Some(ptid) = parent_tid {
            if self.threads.exists(ptid) {
                let p = self.threads.get_mut(ptid).expect("parent just checked");
                match p.create_snapshot.take() {
                    Some(snap) => base = snap,
                    None => {
                        base = p.clock;
                        p.clock = self.clocks.tick(p.clock, ptid.0)?;
                        resegment(&mut self.threads, &mut self.segments, ptid.0, pc)?;
                    }
                }
            } else {
                if ptid.0 != 0 {
                    warn!(tid, parent, "THR_START names an unknown parent");
                }
                parent_tid = None;
            }
        }
        let clock = self.clocks.tick(base, tid)?;
        let stack: Arc<[u64]> = if pc != 0 {
            Arc::from(vec![pc].into_boxed_slice())
        } else {
            Arc::from(Vec::new().into_boxed_slice())
        };
        let sid = self.segments.mint(
            Tid(tid),
            clock,
            LockSetId::EMPTY,
            LockSetId::EMPTY,
            stack,
        )?;
        self.threads
            .insert(ThreadState::new(Tid(tid), parent_tid, clock, sid));
        self.stats.threads_started += 1;
        Ok(())
    }

    fn handle_writer_lock(&mut self, tid: u32, pc: u64, mu: u64) -> Result<(), ProtocolError> {
        let default_hb = self.opts.pure_happens_before;
        let t = live_thread(&mut self.threads, tid, EventKind::WriterLock)?;
        if t.sync_ignored() {
            return Ok(());
        }
        let depth = t.lock_recursion.entry(mu).or_insert(0);
        *depth += 1;
        if *depth > 1 {
            return Ok(()); // recursive re-acquire: no HB or lockset effect
        }
        let lock = self.sync.lock_mut(mu, default_hb);
        lock.writer_owner = Some(Tid(tid));
        let hb = default_hb || lock.pure_hb;
        let release = lock.release_clock;
        let reader_release = lock.reader_release_clock;
        if hb {
            let mut clock = t.clock;
            if let Some(c) = release {
                clock = self.clocks.join(clock, c);
            }
            if let Some(c) = reader_release {
                clock = self.clocks.join(clock, c);
            }
            t.clock = clock;
        }
        t.writer_locks = self.locksets.add(t.writer_locks, mu);
        resegment(&mut self.threads, &mut self.segments, tid, pc)
    }

    fn handle_reader_lock(&mut self, tid: u32, pc: u64, mu: u64) -> Result<(), ProtocolError> {
        let default_hb = self.opts.pure_happens_before;
        let t = live_thread(&mut self.threads, tid, EventKind::ReaderLock)?;
        if t.sync_ignored() {
            return Ok(());
        }
        let lock = self.sync.lock_mut(mu, default_hb);
        let hb = default_hb || lock.pure_hb;
        let release = lock.release_clock;
        if hb {
            // Join only the writer-release clock: readers synchronize with
            // the previous writer, not with each other.
            if let Some(c) = release {
                t.clock = self.clocks.join(t.clock, c);
            }
        }
        t.reader_locks = self.locksets.add(t.reader_locks, mu);
        resegment(&mut self.threads, &mut self.segments, tid, pc)
    }

    fn handle_unlock(&mut self, tid: u32, pc: u64, mu: u64) -> Result<(), ProtocolError> {
        let default_hb = self.opts.pure_happens_before;
        let t = live_thread(&mut self.threads, tid, EventKind::Unlock)?;
        if t.sync_ignored() {
            return Ok(());
        }
        if self.locksets.contains(t.writer_locks, mu) {
            let depth = t.lock_recursion.entry(mu).or_insert(1);
            *depth -= 1;
            if *depth > 0 {
                return Ok(());
            }
            t.lock_recursion.remove(&mu);
            let clock = t.clock;
            let lock = self.sync.lock_mut(mu, default_hb);
            lock.release_clock = Some(clock);
            lock.reader_release_clock = None;
            lock.writer_owner = None;
            t.clock = self.clocks.tick(clock, tid)?;
            t.writer_locks = self.locksets.remove(t.writer_locks, mu);
        } else if self.locksets.contains(t.reader_locks, mu) {
            let clock = t.clock;
            let lock = self.sync.lock_mut(mu, default_hb);
            lock.reader_release_clock = Some(match lock.reader_release_clock {
                Some(prev) => self.clocks.join(prev, clock),
                None => clock,
            });
            t.clock = self.clocks.tick(clock, tid)?;
            t.reader_locks = self.locksets.remove(t.reader_locks, mu);
        } else {
            warn!(tid, mu = format_args!("{mu:#x}"), "unlock of unheld lock");
            return Ok(());
        }
        resegment(&mut self.threads, &mut self.segments, tid, pc)
    }

    fn handle_wait(&mut self, tid: u32, pc: u64, addr: u64) -> Result<(), ProtocolError> {
        let t = live_thread(&mut self.threads, tid, EventKind::Wait)?;
        if t.sync_ignored() {
            return Ok(());
        }
        let signal = self.sync.condvar_mut(addr).signal_clock;
        if let Some(signal) = signal {
            t.clock = self.clocks.join(t.clock, signal);
            resegment(&mut self.threads, &mut self.segments, tid, pc)?;
        }
        Ok(())
    }

    fn handle_access(
        &mut self,
        tid: u32,
        pc: u64,
        addr: u64,
        size: u64,
        is_write: bool,
    ) -> Result<(), ProtocolError> {
        let size = size.min(MAX_ACCESS_BYTES);
        let traced = self.annotations.is_traced(addr, size)
            || self
                .opts
                .trace_addr
                .is_some_and(|t| Range::new(t, 1).overlaps(addr, size));
        if traced {
            info!(
                tid,
                pc = format_args!("{pc:#x}"),
                addr = format_args!("{addr:#x}"),
                size,
                write = is_write,
                "traced access"
            );
        }

        let kind = if is_write {
            EventKind::Write
        } else {
            EventKind::Read
        };
        {
            let t = live_thread(&mut self.threads, tid, kind)?;
            let ignored = self.global_ignore
                || (is_write && t.writes_ignored())
                || (!is_write && t.reads_ignored())
                || (is_write && self.annotations.writes_ignored_at(addr, size))
                || (!is_write && self.annotations.reads_ignored_at(addr, size));
            if ignored {
                self.stats.accesses_ignored += 1;
                return Ok(());
            }
            if t.sampling_skip {
                self.stats.accesses_sampled_out += 1;
                return Ok(());
            }
        }

        // Reads from a published range happen-after the publish.
        if !is_write {
            if let Some(pub_clock) = self.annotations.publish_clock(addr, size) {
                let t = live_thread(&mut self.threads, tid, kind)?;
                if !self.clocks.leq(pub_clock, t.clock) {
                    t.clock = self.clocks.join(t.clock, pub_clock);
                    resegment(&mut self.threads, &mut self.segments, tid, pc)?;
                }
            }
        }

        self.stats.accesses_analyzed += 1;
        let sid = {
            let t = live_thread(&mut self.threads, tid, kind)?;
            t.segment_dirty = true;
            t.segment
        };

        for sub in split_access(addr, size) {
            let priors = self.shadow.record_access(
                sub,
                sid,
                pc,
                is_write,
                &self.clocks,
                &mut self.segments,
            );
            for prior in priors {
                self.judge(tid, pc, addr, size, is_write, sid, &prior);
            }
        }
        Ok(())
    }

    /// Decide whether an HB-unordered overlapping pair is a reportable race
    /// and report it.
    fn judge(
        &mut self,
        tid: u32,
        pc: u64,
        addr: u64,
        size: u64,
        is_write: bool,
        sid: SegmentId,
        prior: &AccessRecord,
    ) {
        if !is_write && !prior.is_write {
            return;
        }
        let (cur_writers, cur_readers) = {
            let seg = self.segments.get(sid);
            (seg.writer_locks, seg.reader_locks)
        };
        let (prior_writers, prior_readers, prior_tid) = {
            let seg = self.segments.get(prior.sid);
            (seg.writer_locks, seg.reader_locks, seg.tid)
        };
        debug_assert_ne!(prior_tid, Tid(tid), "same-thread accesses are ordered");

        if !self.opts.pure_happens_before
            && self
                .locksets
                .protects(cur_writers, cur_readers, prior_writers, prior_readers)
        {
            return;
        }

        if self.annotations.is_benign(addr, size) {
            self.stats.races_suppressed_benign += 1;
            return;
        }
        if self.annotations.expectation_hit(addr, size) {
            self.stats.races_suppressed_expected += 1;
            return;
        }
        if !self.suppressions.first_sighting(pc, prior.pc) {
            self.stats.races_suppressed_duplicate += 1;
            return;
        }

        let report = self.build_report(tid, pc, addr, size, is_write, sid, prior, prior_tid);
        self.stats.races_reported += 1;
        self.sink.race(&report);
    }

    #[allow(clippy::too_many_arguments)]
    fn build_report(
        &self,
        tid: u32,
        pc: u64,
        addr: u64,
        size: u64,
        is_write: bool,
        sid: SegmentId,
        prior: &AccessRecord,
        prior_tid: Tid,
    ) -> RaceReport {
        let current_seg = self.segments.get(sid);
        let prior_seg = self.segments.get(prior.sid);

        let mut current_stack: Vec<u64> = current_seg.stack.to_vec();
        if pc != 0 && current_stack.last() != Some(&pc) {
            current_stack.push(pc);
        }
        let mut prior_stack: Vec<u64> = prior_seg.stack.to_vec();
        if prior.pc != 0 && prior_stack.last() != Some(&prior.pc) {
            prior_stack.push(prior.pc);
        }

        let current = AccessSnapshot {
            tid,
            thread_label: self.thread_label(Tid(tid)),
            pc,
            is_write,
            bytes: size.min(u32::MAX as u64) as u32,
            sid: sid.raw(),
            writer_locks: self.locksets.render(current_seg.writer_locks),
            reader_locks: self.locksets.render(current_seg.reader_locks),
            stack: self.frames(&current_stack),
        };
        let prior_snapshot = AccessSnapshot {
            tid: prior_tid.0,
            thread_label: self.thread_label(prior_tid),
            pc: prior.pc,
            is_write: prior.is_write,
            bytes: prior.mask.count_ones(),
            sid: prior.sid.raw(),
            writer_locks: self.locksets.render(prior_seg.writer_locks),
            reader_locks: self.locksets.render(prior_seg.reader_locks),
            stack: self.frames(&prior_stack),
        };
        let heap = self.heap.find(addr).map(|block| HeapInfo {
            base: block.base,
            size: block.size,
            offset: addr - block.base,
            alloc_tid: block.tid.0,
            alloc_pc: block.alloc_pc,
        });
        RaceReport {
            addr,
            current,
            prior: prior_snapshot,
            heap,
            description: None,
        }
    }

    fn thread_label(&self, tid: Tid) -> String {
        self.threads
            .get(tid)
            .map(|t| t.label())
            .unwrap_or_else(|| tid.to_string())
    }

    fn frames(&self, pcs: &[u64]) -> Vec<Frame> {
        pcs.iter()
            .map(|&pc| Frame {
                pc,
                descr: if self.opts.symbolize {
                    self.host_symbolizer
                        .as_deref()
                        .and_then(|s| s.pc_to_strings(pc))
                        .or_else(|| self.symbols.pc_to_strings(pc))
                } else {
                    None
                },
            })
            .collect()
    }

    /// Emit expectation mismatches and the statistics block. Idempotent; the
    /// pipeline calls this once after draining every live buffer.
    pub fn finalize(&mut self) -> Finalization {
        if !self.finalized {
            self.finalized = true;
            let mut unfired = 0;
            let mut notes = Vec::new();
            for exp in self.annotations.unfired() {
                unfired += 1;
                notes.push(format!(
                    "WARNING: expected race at {:#x} (declared at pc={:#x}) did not happen",
                    exp.range.addr, exp.pc
                ));
            }
            for note in notes {
                self.sink.note(&note);
            }
            self.stats.expectations_unfired = unfired;
            self.stats.segments_minted = self.segments.minted();
            self.stats.segments_recycled = self.segments.recycled();
            self.stats.clocks_interned = self.clocks.len() as u64;
            self.stats.locksets_interned = self.locksets.len() as u64;
            self.stats.shadow_pages = self.shadow.pages_allocated();
            let summary = self.stats.summary();
            self.sink.note(&summary);
        }
        Finalization {
            races_reported: self.stats.races_reported,
            expectations_unfired: self.stats.expectations_unfired,
        }
    }
}
