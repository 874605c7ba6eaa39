//! Event pipeline: thread-local buffers and the analyzer lock
//!
//! Producers batch events into a thread-local event buffer (TLEB) and hand
//! full buffers to the analyzer, which is guarded by a single mutex. Three
//! locking schemes are supported:
//!
//! - `ON_FLUSH`: the producer takes the lock once per flush.
//! - `SEPARATE_THREAD`: flushes are enqueued onto a bounded queue drained by
//!   a dedicated consumer thread; when the queue is full the producer drains
//!   it inline under the lock so it cannot grow without bound.
//! - `ON_SYSCALL`: the producer keeps the lock across flushes until it
//!   reaches a syscall boundary or exhausts an event budget. One producer
//!   per OS thread.
//!
//! Ordering: events of one thread reach the analyzer in append order; across
//! threads, analysis order is the order in which flushes commit (lock
//! acquisitions, or queue slots in `SEPARATE_THREAD`).
//!
//! Kinds that synchronize across threads are never batched: appending one
//! flushes the buffer and the event rides in its own flush, so the analyzer
//! observes synchronization in stream order.

use crate::analyzer::{Analyzer, Finalization, ProtocolError, ON_SYSCALL_EVENT_BUDGET};
use crate::config::FlushMode;
use crate::events::Event;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::trace;

/// TLEB capacity in events. Check-and-flush precedes every append, so the
/// buffer can never overflow.
pub const TLEB_CAPACITY: usize = 2048;

/// `SEPARATE_THREAD` queue bound. A producer that finds the queue full
/// drains it inline.
pub const QUEUE_SOFT_BOUND: usize = 100;

/// Thread-local event buffer.
#[derive(Debug)]
pub struct Tleb {
    owner: u32,
    events: Vec<Event>,
}

impl Tleb {
    pub fn new(owner: u32) -> Self {
        Self {
            owner,
            events: Vec::with_capacity(TLEB_CAPACITY),
        }
    }

    pub fn owner(&self) -> u32 {
        self.owner
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.events.len() >= TLEB_CAPACITY
    }

    /// Append one event. The caller must have flushed a full buffer first.
    pub fn push(&mut self, event: Event) {
        debug_assert!(!self.is_full(), "TLEB overflow: flush-before-append violated");
        self.events.push(event);
    }

    /// Move the buffered events out, leaving this buffer empty.
    pub fn take(&mut self) -> Tleb {
        Tleb {
            owner: self.owner,
            events: std::mem::take(&mut self.events),
        }
    }

    /// Feed the buffered events to the analyzer and clear the buffer.
    pub fn drain_into(&mut self, analyzer: &mut Analyzer) -> Result<(), ProtocolError> {
        if self.events.is_empty() {
            return Ok(());
        }
        let result = analyzer.handle_buffer(self.owner, &self.events);
        self.events.clear();
        result
    }
}

struct Shared {
    analyzer: Mutex<Analyzer>,
    queue: ArrayQueue<Tleb>,
    shutdown: AtomicBool,
    failure: Mutex<Option<ProtocolError>>,
}

/// The pipeline: owns the analyzer lock, the flush queue and (in
/// `SEPARATE_THREAD` mode) the consumer thread.
pub struct Pipeline {
    shared: Arc<Shared>,
    mode: FlushMode,
    consumer: Option<JoinHandle<()>>,
}

impl Pipeline {
    pub fn new(analyzer: Analyzer) -> Self {
        let mode = analyzer.options().locking_scheme;
        let shared = Arc::new(Shared {
            analyzer: Mutex::new(analyzer),
            queue: ArrayQueue::new(QUEUE_SOFT_BOUND),
            shutdown: AtomicBool::new(false),
            failure: Mutex::new(None),
        });
        let consumer = (mode == FlushMode::SeparateThread).then(|| {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || Self::consumer_loop(&shared))
        });
        Self {
            shared,
            mode,
            consumer,
        }
    }

    pub fn mode(&self) -> FlushMode {
        self.mode
    }

    /// Take the analyzer lock. Poisoning is unrecoverable (a panic under the
    /// lock left the analyzer in an unknown state).
    pub fn lock(&self) -> MutexGuard<'_, Analyzer> {
        self.shared
            .analyzer
            .lock()
            .expect("analyzer lock poisoned")
    }

    /// Run `f` under the analyzer lock.
    pub fn with_analyzer<R>(&self, f: impl FnOnce(&mut Analyzer) -> R) -> R {
        f(&mut self.lock())
    }

    /// Create a producer handle. In `ON_SYSCALL` mode a producer may retain
    /// the analyzer lock between flushes, so create at most one per OS
    /// thread.
    pub fn producer(&self, tid: u32) -> Producer<'_> {
        Producer {
            pipeline: self,
            tleb: Tleb::new(tid),
            guard: None,
            analyzed_under_lock: 0,
        }
    }

    /// Commit one buffer according to the locking scheme, without lock
    /// retention (`ON_SYSCALL` retention lives in [`Producer`] and in the
    /// offline driver).
    pub fn submit(&self, tleb: &mut Tleb) -> Result<(), ProtocolError> {
        if tleb.is_empty() {
            return Ok(());
        }
        match self.mode {
            FlushMode::OnFlush | FlushMode::OnSyscall => {
                let mut analyzer = self.lock();
                tleb.drain_into(&mut analyzer)
            }
            FlushMode::SeparateThread => self.enqueue(tleb.take()),
        }
    }

    /// Enqueue a copied buffer for the consumer thread, draining the queue
    /// inline when it is full.
    pub fn enqueue(&self, tleb: Tleb) -> Result<(), ProtocolError> {
        let mut pending = tleb;
        loop {
            match self.shared.queue.push(pending) {
                Ok(()) => return Ok(()),
                Err(back) => {
                    trace!(owner = back.owner(), "flush queue full; draining inline");
                    pending = back;
                    let mut analyzer = self.lock();
                    self.drain_queue_locked(&mut analyzer)?;
                }
            }
        }
    }

    fn drain_queue_locked(&self, analyzer: &mut Analyzer) -> Result<(), ProtocolError> {
        while let Some(mut tleb) = self.shared.queue.pop() {
            tleb.drain_into(analyzer)?;
        }
        Ok(())
    }

    fn consumer_loop(shared: &Shared) {
        loop {
            match shared.queue.pop() {
                Some(mut tleb) => {
                    if shared.failure.lock().unwrap().is_some() {
                        continue; // drop buffers after a protocol failure
                    }
                    let mut analyzer = shared.analyzer.lock().expect("analyzer lock poisoned");
                    if let Err(err) = tleb.drain_into(&mut analyzer) {
                        *shared.failure.lock().unwrap() = Some(err);
                    }
                }
                None => {
                    if shared.shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    /// Drain everything still queued, stop the consumer, and finalize the
    /// analyzer. Returns the first protocol failure instead if one occurred.
    pub fn finalize(mut self) -> Result<Finalization, ProtocolError> {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.consumer.take() {
            let _ = handle.join();
        }
        if let Some(err) = self.shared.failure.lock().unwrap().take() {
            return Err(err);
        }
        let mut analyzer = self.lock();
        self.drain_queue_locked(&mut analyzer)?;
        Ok(analyzer.finalize())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.consumer.take() {
            let _ = handle.join();
        }
    }
}

/// Producer-side handle: one per traced thread. Appends are lock-free with
/// respect to other producers until a flush point.
pub struct Producer<'p> {
    pipeline: &'p Pipeline,
    tleb: Tleb,
    /// Retained analyzer guard (`ON_SYSCALL` scheme only).
    guard: Option<MutexGuard<'p, Analyzer>>,
    analyzed_under_lock: u64,
}

impl<'p> Producer<'p> {
    pub fn tid(&self) -> u32 {
        self.tleb.owner()
    }

    /// Append one event, flushing first if the buffer is full and flushing
    /// after if the event kind is not batchable.
    pub fn append(&mut self, event: Event) -> Result<(), ProtocolError> {
        if self.tleb.is_full() {
            self.flush()?;
        }
        self.tleb.push(event);
        if !event.kind.is_batched() {
            self.flush()?;
        }
        Ok(())
    }

    /// Hand the buffered events to the analyzer.
    pub fn flush(&mut self) -> Result<(), ProtocolError> {
        if self.tleb.is_empty() {
            return Ok(());
        }
        if self.pipeline.mode != FlushMode::OnSyscall {
            return self.pipeline.submit(&mut self.tleb);
        }
        // ON_SYSCALL: acquire once, keep the guard, release on budget.
        if self.guard.is_none() {
            self.guard = Some(self.pipeline.lock());
            self.analyzed_under_lock = 0;
        }
        self.analyzed_under_lock += self.tleb.len() as u64;
        let guard = self.guard.as_mut().expect("guard just installed");
        self.tleb.drain_into(&mut **guard)?;
        if self.analyzed_under_lock >= ON_SYSCALL_EVENT_BUDGET {
            self.guard = None;
        }
        Ok(())
    }

    /// A syscall is about to happen: flush and release any retained lock.
    pub fn syscall_boundary(&mut self) -> Result<(), ProtocolError> {
        self.flush()?;
        self.guard = None;
        Ok(())
    }

    /// Flush remaining events and release the lock. Use this instead of
    /// dropping to observe protocol errors.
    pub fn finish(mut self) -> Result<(), ProtocolError> {
        self.flush()?;
        self.guard = None;
        Ok(())
    }
}

impl Drop for Producer<'_> {
    fn drop(&mut self) {
        // Best effort: a dropped producer must not lose buffered events.
        let _ = self.flush();
        self.guard = None;
    }
}
