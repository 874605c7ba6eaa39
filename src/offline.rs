//! Offline event log reader
//!
//! Parses text event logs and drives them through the pipeline, so buffer
//! batching and the configured locking scheme apply to offline runs exactly
//! as they do to live ones.
//!
//! Default syntax, one event per whitespace-separated 5-tuple:
//!
//! ```text
//! EVENT_NAME tid pc addr info      # all numeric fields hex
//! ```
//!
//! Lines starting with `#` or `=` are comments. A comment of the shape
//! `#PC pc img rtn file line` installs a PC→symbol mapping used by report
//! stacks.
//!
//! The `jli` syntax accepts java.lang.instrument encoded streams: decimal
//! fields, 1-based tids, string PCs interned to dense fake addresses, and a
//! handful of composite events expanded to core event sequences.

use crate::analyzer::{Analyzer, ProtocolError, ON_SYSCALL_EVENT_BUDGET};
use crate::config::{FlushMode, OfflineSyntax, Options};
use crate::events::{Event, EventKind};
use crate::pipeline::{Pipeline, Tleb};
use crate::report::PcDescr;
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufWriter, Write};
use std::sync::MutexGuard;
use tracing::info;

/// Demultiplexes a single-threaded event log into per-thread buffers and
/// commits them through the pipeline. Owns the `ON_SYSCALL` lock retention
/// for the reading thread (the reader multiplexes every tid, so retention
/// lives here rather than in per-thread producers).
struct Demux<'p> {
    pipeline: &'p Pipeline,
    tlebs: HashMap<u32, Tleb>,
    guard: Option<MutexGuard<'p, Analyzer>>,
    analyzed_under_lock: u64,
    dump: Option<BufWriter<File>>,
    events_read: u64,
}

impl<'p> Demux<'p> {
    fn new(pipeline: &'p Pipeline, dump: Option<BufWriter<File>>) -> Self {
        Self {
            pipeline,
            tlebs: HashMap::new(),
            guard: None,
            analyzed_under_lock: 0,
            dump,
            events_read: 0,
        }
    }

    fn feed(&mut self, event: Event) -> Result<()> {
        self.events_read += 1;
        if let Some(dump) = self.dump.as_mut() {
            let line = serde_json::to_string(&event).context("serializing event dump record")?;
            writeln!(dump, "{line}").context("writing event dump")?;
        }

        if event.kind.is_global() {
            // Global effects must observe every buffered access first.
            self.flush_all()?;
            self.commit_single(event)?;
            return Ok(());
        }
        let tleb = self
            .tlebs
            .entry(event.tid)
            .or_insert_with(|| Tleb::new(event.tid));
        if tleb.is_full() {
            self.flush_one(event.tid)?;
        }
        let tleb = self
            .tlebs
            .get_mut(&event.tid)
            .expect("tleb exists after flush");
        tleb.push(event);
        if !event.kind.is_batched() {
            self.flush_one(event.tid)?;
        }
        Ok(())
    }

    fn commit(&mut self, tleb: &mut Tleb) -> Result<(), ProtocolError> {
        if self.pipeline.mode() == FlushMode::OnSyscall {
            if self.guard.is_none() {
                self.guard = Some(self.pipeline.lock());
                self.analyzed_under_lock = 0;
            }
            self.analyzed_under_lock += tleb.len() as u64;
            let guard = self.guard.as_mut().expect("guard just installed");
            tleb.drain_into(&mut **guard)?;
            if self.analyzed_under_lock >= ON_SYSCALL_EVENT_BUDGET {
                self.guard = None;
            }
            Ok(())
        } else {
            self.pipeline.submit(tleb)
        }
    }

    fn commit_single(&mut self, event: Event) -> Result<()> {
        let mut single = Tleb::new(event.tid);
        single.push(event);
        self.commit(&mut single)
            .with_context(|| format!("analyzing {} event", event.kind))
    }

    fn flush_one(&mut self, tid: u32) -> Result<()> {
        let Some(mut tleb) = self.tlebs.remove(&tid) else {
            return Ok(());
        };
        let result = self.commit(&mut tleb);
        self.tlebs.insert(tid, tleb);
        result.with_context(|| format!("analyzing buffer of T{tid}"))
    }

    fn flush_all(&mut self) -> Result<()> {
        let mut tids: Vec<u32> = self.tlebs.keys().copied().collect();
        tids.sort_unstable();
        for tid in tids {
            self.flush_one(tid)?;
        }
        Ok(())
    }

    fn install_pc(&mut self, pc: u64, descr: PcDescr) {
        match self.guard.as_mut() {
            Some(guard) => guard.install_pc(pc, descr),
            None => self.pipeline.with_analyzer(|a| a.install_pc(pc, descr)),
        }
    }

    fn finish(mut self) -> Result<u64> {
        self.flush_all()?;
        self.guard = None;
        if let Some(mut dump) = self.dump.take() {
            dump.flush().context("flushing event dump")?;
        }
        Ok(self.events_read)
    }
}

fn open_dump(opts: &Options) -> Result<Option<BufWriter<File>>> {
    match &opts.dump_events {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("creating event dump {}", path.display()))?;
            Ok(Some(BufWriter::new(file)))
        }
        None => Ok(None),
    }
}

/// Read an event log from `input` and run it through `pipeline`. Returns the
/// number of events analyzed. The caller finalizes the pipeline afterwards.
pub fn run<R: BufRead>(pipeline: &Pipeline, input: R) -> Result<u64> {
    let opts = pipeline.with_analyzer(|a| a.options().clone());
    let dump = open_dump(&opts)?;
    let demux = Demux::new(pipeline, dump);
    let events = match opts.offline_syntax {
        OfflineSyntax::Default => read_default(input, demux)?,
        OfflineSyntax::Jli => read_jli(input, demux)?,
    };
    info!(events, "offline log consumed");
    Ok(events)
}

fn parse_hex(token: &str, what: &str, line_no: usize) -> Result<u64> {
    u64::from_str_radix(token.trim_start_matches("0x"), 16)
        .with_context(|| format!("line {line_no}: bad hex {what} {token:?}"))
}

/// Handle one comment body. `#PC pc img rtn file line` installs a symbol.
fn handle_comment(body: &str, demux: &mut Demux<'_>) {
    let body = body.trim_start();
    let Some(rest) = body.strip_prefix("PC") else {
        return;
    };
    let fields: Vec<&str> = rest.split_whitespace().collect();
    if fields.len() != 5 {
        return;
    }
    let (Ok(pc), Ok(line)) = (
        u64::from_str_radix(fields[0].trim_start_matches("0x"), 16),
        fields[4].parse::<u32>(),
    ) else {
        return;
    };
    if pc == 0 || line == 0 {
        return;
    }
    demux.install_pc(
        pc,
        PcDescr {
            img: fields[1].to_string(),
            rtn: fields[2].to_string(),
            file: fields[3].to_string(),
            line,
        },
    );
}

fn read_default<R: BufRead>(input: R, mut demux: Demux<'_>) -> Result<u64> {
    // Events are whitespace-separated 5-tuples and may span lines; comments
    // are line-scoped.
    let mut tokens: Vec<String> = Vec::new();
    for (idx, line) in input.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.with_context(|| format!("reading log line {line_no}"))?;
        let text = match line.find(&['#', '='][..]) {
            Some(pos) => {
                handle_comment(&line[pos + 1..], &mut demux);
                &line[..pos]
            }
            None => &line[..],
        };
        for token in text.split_whitespace() {
            tokens.push(token.to_string());
            if tokens.len() == 5 {
                let kind = EventKind::from_name(&tokens[0])
                    .with_context(|| format!("line {line_no}: unknown event {:?}", tokens[0]))?;
                let tid = parse_hex(&tokens[1], "tid", line_no)? as u32;
                let pc = parse_hex(&tokens[2], "pc", line_no)?;
                let addr = parse_hex(&tokens[3], "addr", line_no)?;
                let info = parse_hex(&tokens[4], "info", line_no)?;
                demux.feed(Event::new(kind, tid, pc, addr, info))?;
                tokens.clear();
            }
        }
    }
    if !tokens.is_empty() {
        bail!("truncated event at end of log: {:?}", tokens);
    }
    demux.finish()
}

/// Interns jli PC strings to dense fake addresses (0 is "unknown") and
/// installs each as its own symbol.
struct JliPcs {
    map: HashMap<String, u64>,
}

impl JliPcs {
    fn new() -> Self {
        let mut map = HashMap::new();
        map.insert("unknown".to_string(), 0);
        Self { map }
    }

    fn intern(&mut self, s: &str, demux: &mut Demux<'_>) -> u64 {
        if let Some(&pc) = self.map.get(s) {
            return pc;
        }
        let pc = self.map.len() as u64;
        self.map.insert(s.to_string(), pc);
        demux.install_pc(
            pc,
            PcDescr {
                img: String::new(),
                rtn: s.to_string(),
                file: String::new(),
                line: 0,
            },
        );
        pc
    }
}

fn parse_dec(token: &str, what: &str, line_no: usize) -> Result<u64> {
    token
        .parse::<u64>()
        .with_context(|| format!("line {line_no}: bad decimal {what} {token:?}"))
}

fn read_jli<R: BufRead>(input: R, mut demux: Demux<'_>) -> Result<u64> {
    let mut pcs = JliPcs::new();

    // jli streams do not announce the main thread.
    demux.feed(Event::new(EventKind::ThrStart, 0, 0, 0, 0))?;
    demux.feed(Event::new(EventKind::ThrFirstInsn, 0, 0, 0, 0))?;

    let mut tokens: Vec<String> = Vec::new();
    for (idx, line) in input.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.with_context(|| format!("reading log line {line_no}"))?;
        let text = match line.find(&['#', '='][..]) {
            Some(pos) => &line[..pos],
            None => &line[..],
        };
        for token in text.split_whitespace() {
            tokens.push(token.to_string());
            if tokens.len() < 5 {
                continue;
            }
            let name = tokens[0].as_str();
            // 1-based producer tids
            let tid = parse_dec(&tokens[1], "tid", line_no)?
                .checked_sub(1)
                .with_context(|| format!("line {line_no}: jli tid 0 is invalid"))?
                as u32;
            let pc = pcs.intern(&tokens[2], &mut demux);
            let a = parse_dec(&tokens[3], "addr", line_no)?;
            let info = parse_dec(&tokens[4], "info", line_no)?;

            match name {
                "RTN_ENTER" => {
                    demux.feed(Event::new(EventKind::RtnCall, tid, 0x1234, pc, 0))?;
                    demux.feed(Event::new(EventKind::SblockEnter, tid, pc, 0, 0))?;
                    if tid != 0 {
                        demux.feed(Event::new(EventKind::StackTrace, tid, pc, 0, 0))?;
                    }
                }
                "THR_CREATE" => {
                    let child = a
                        .checked_sub(1)
                        .with_context(|| format!("line {line_no}: jli child tid 0 is invalid"))?
                        as u32;
                    demux.feed(Event::new(EventKind::ThrCreateBefore, tid, pc, 0, 0))?;
                    demux.feed(Event::new(EventKind::ThrStart, child, pc, tid as u64, 0))?;
                    demux.feed(Event::new(EventKind::ThrFirstInsn, child, pc, 0, 0))?;
                    demux.feed(Event::new(
                        EventKind::ThrSetPtid,
                        child,
                        pc,
                        child as u64,
                        0,
                    ))?;
                }
                "THR_START" | "THR_END" => {} // implicit in jli streams
                "THR_JOIN" => {
                    let child = a
                        .checked_sub(1)
                        .with_context(|| format!("line {line_no}: jli child tid 0 is invalid"))?;
                    demux.feed(Event::new(EventKind::ThrEnd, child as u32, 0, 0, 0))?;
                    demux.feed(Event::new(EventKind::ThrJoinBefore, tid, pc, child, 0))?;
                    demux.feed(Event::new(EventKind::ThrJoinAfter, tid, pc, child, 0))?;
                }
                "WAIT" => {
                    demux.feed(Event::new(EventKind::WaitBefore, tid, pc, a, 0))?;
                    demux.feed(Event::new(EventKind::WaitAfter, tid, pc, 0, 0))?;
                }
                "LOCK" => {
                    demux.feed(Event::new(EventKind::WriterLock, tid, pc, a, 0))?;
                }
                _ => {
                    let kind = EventKind::from_name(name).with_context(|| {
                        format!("line {line_no}: unknown jli event {name:?}")
                    })?;
                    demux.feed(Event::new(kind, tid, pc, a, info))?;
                }
            }
            tokens.clear();
        }
    }
    if !tokens.is_empty() {
        bail!("truncated event at end of log: {:?}", tokens);
    }
    demux.finish()
}
