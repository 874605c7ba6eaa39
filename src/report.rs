//! Race reports, the report sink, and symbolization
//!
//! The analyzer never prints: every detected race is packaged as a
//! [`RaceReport`] and handed to a [`ReportSink`]. The offline binary uses
//! [`TextSink`]; tests use [`CollectingSink`]; hosts embed their own.
//!
//! Symbolization is a callback contract: the host supplies a [`Symbolizer`]
//! (the offline reader fills a [`SymbolTable`] from `#PC` log comments) and
//! the analyzer resolves stacks at report time.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex};

/// Symbol information for one program counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PcDescr {
    pub img: String,
    pub rtn: String,
    pub file: String,
    pub line: u32,
}

/// PC → symbol resolution, injected by the host.
pub trait Symbolizer {
    fn pc_to_strings(&self, pc: u64) -> Option<PcDescr>;

    fn pc_to_routine(&self, pc: u64) -> Option<String> {
        self.pc_to_strings(pc).map(|d| d.rtn)
    }
}

/// Symbol map fed by `#PC` comments in offline logs.
#[derive(Debug, Default)]
pub struct SymbolTable {
    map: HashMap<u64, PcDescr>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&mut self, pc: u64, descr: PcDescr) {
        self.map.insert(pc, descr);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Symbolizer for SymbolTable {
    fn pc_to_strings(&self, pc: u64) -> Option<PcDescr> {
        self.map.get(&pc).cloned()
    }
}

/// One stack frame of a report, symbolized if possible.
#[derive(Debug, Clone, Serialize)]
pub struct Frame {
    pub pc: u64,
    pub descr: Option<PcDescr>,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.descr {
            Some(d) if !d.file.is_empty() => {
                write!(f, "{:#x}: {} ({}:{})", self.pc, d.rtn, d.file, d.line)
            }
            Some(d) => write!(f, "{:#x}: {}", self.pc, d.rtn),
            None => write!(f, "{:#x}", self.pc),
        }
    }
}

/// One side of a racing pair.
#[derive(Debug, Clone, Serialize)]
pub struct AccessSnapshot {
    pub tid: u32,
    pub thread_label: String,
    pub pc: u64,
    pub is_write: bool,
    /// Bytes of the racy range this access covered.
    pub bytes: u32,
    pub sid: u32,
    pub writer_locks: String,
    pub reader_locks: String,
    pub stack: Vec<Frame>,
}

impl AccessSnapshot {
    fn mode(&self) -> &'static str {
        if self.is_write {
            "write"
        } else {
            "read"
        }
    }
}

/// Description of the heap block containing the racy address.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HeapInfo {
    pub base: u64,
    pub size: u64,
    pub offset: u64,
    pub alloc_tid: u32,
    pub alloc_pc: u64,
}

/// A detected data race: two HB-unordered, lockset-disjoint accesses to
/// overlapping bytes, at least one a write.
#[derive(Debug, Clone, Serialize)]
pub struct RaceReport {
    pub addr: u64,
    pub current: AccessSnapshot,
    pub prior: AccessSnapshot,
    pub heap: Option<HeapInfo>,
    pub description: Option<String>,
}

impl fmt::Display for RaceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "WARNING: data race at {:#x}: {} {} of {} byte(s) by {} (S{}) vs {} {} of {} byte(s) by {} (S{})",
            self.addr,
            self.current.mode(),
            format_args!("pc={:#x}", self.current.pc),
            self.current.bytes,
            self.current.thread_label,
            self.current.sid,
            self.prior.mode(),
            format_args!("pc={:#x}", self.prior.pc),
            self.prior.bytes,
            self.prior.thread_label,
            self.prior.sid,
        )?;
        if let Some(descr) = &self.description {
            writeln!(f, "  note: {descr}")?;
        }
        for (side, access) in [("current", &self.current), ("prior", &self.prior)] {
            writeln!(
                f,
                "  {side} access by {}: locks held: writer {}, reader {}",
                access.thread_label, access.writer_locks, access.reader_locks
            )?;
            if access.stack.is_empty() {
                writeln!(f, "    (no stack captured)")?;
            }
            for frame in &access.stack {
                writeln!(f, "    #{frame}")?;
            }
        }
        if let Some(heap) = &self.heap {
            writeln!(
                f,
                "  address {:#x} is {} bytes inside a block of size {} allocated by T{} at pc={:#x}",
                self.addr, heap.offset, heap.size, heap.alloc_tid, heap.alloc_pc
            )?;
        }
        Ok(())
    }
}

/// Consumer of analyzer output.
pub trait ReportSink {
    fn race(&mut self, report: &RaceReport);

    /// Non-race output: expectation mismatches, finalization notes.
    fn note(&mut self, message: &str);
}

/// Writes reports as text to any writer (stderr, a log file).
pub struct TextSink {
    out: Box<dyn Write + Send>,
}

impl TextSink {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self { out }
    }

    pub fn stderr() -> Self {
        Self::new(Box::new(std::io::stderr()))
    }
}

impl ReportSink for TextSink {
    fn race(&mut self, report: &RaceReport) {
        let _ = write!(self.out, "{report}");
        let _ = self.out.flush();
    }

    fn note(&mut self, message: &str) {
        let _ = writeln!(self.out, "{message}");
        let _ = self.out.flush();
    }
}

/// Collects reports in memory. Test helper.
#[derive(Default)]
pub struct CollectingSink {
    pub reports: Vec<RaceReport>,
    pub notes: Vec<String>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReportSink for CollectingSink {
    fn race(&mut self, report: &RaceReport) {
        self.reports.push(report.clone());
    }

    fn note(&mut self, message: &str) {
        self.notes.push(message.to_string());
    }
}

/// Clonable handle over a [`CollectingSink`]. Lets a test hand the sink to
/// the analyzer and still read reports back afterwards.
#[derive(Clone, Default)]
pub struct SharedSink {
    inner: Arc<Mutex<CollectingSink>>,
}

impl SharedSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<RaceReport> {
        self.inner.lock().unwrap().reports.clone()
    }

    pub fn notes(&self) -> Vec<String> {
        self.inner.lock().unwrap().notes.clone()
    }
}

impl ReportSink for SharedSink {
    fn race(&mut self, report: &RaceReport) {
        self.inner.lock().unwrap().race(report);
    }

    fn note(&mut self, message: &str) {
        self.inner.lock().unwrap().note(message);
    }
}

/// At most one report per unique racing PC pair. The pair is canonicalized
/// so (a, b) and (b, a) count as one.
#[derive(Debug, Default)]
pub struct Suppressions {
    seen: HashSet<(u64, u64)>,
}

impl Suppressions {
    pub fn new() -> Self {
        Self::default()
    }

    /// True the first time this pc pair is seen.
    pub fn first_sighting(&mut self, pc_a: u64, pc_b: u64) -> bool {
        let key = if pc_a <= pc_b {
            (pc_a, pc_b)
        } else {
            (pc_b, pc_a)
        };
        self.seen.insert(key)
    }

    /// Forget everything (FLUSH_STATE).
    pub fn clear(&mut self) {
        self.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
