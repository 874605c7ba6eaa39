//! Ordering and flush-mode behavior of the event pipeline

use carrera::analyzer::{Analyzer, ProtocolError};
use carrera::config::{FlushMode, Options};
use carrera::events::{Event, EventKind};
use carrera::pipeline::{Pipeline, TLEB_CAPACITY};
use carrera::report::SharedSink;

fn pipeline(mode: FlushMode) -> (Pipeline, SharedSink) {
    let opts = Options {
        locking_scheme: mode,
        ..Options::default()
    };
    let sink = SharedSink::new();
    (
        Pipeline::new(Analyzer::new(opts, Box::new(sink.clone()))),
        sink,
    )
}

fn ev(kind: EventKind, tid: u32, pc: u64, addr: u64, info: u64) -> Event {
    Event::new(kind, tid, pc, addr, info)
}

const ALL_MODES: &[FlushMode] = &[
    FlushMode::OnFlush,
    FlushMode::SeparateThread,
    FlushMode::OnSyscall,
];

#[test]
fn per_thread_order_holds_in_every_mode() {
    for &mode in ALL_MODES {
        let (pipeline, _) = pipeline(mode);
        {
            let mut p1 = pipeline.producer(1);
            p1.append(ev(EventKind::ThrStart, 1, 0, 0, 0)).unwrap();
            p1.append(ev(EventKind::Write, 1, 0x100, 0x3000, 4)).unwrap();
            p1.append(ev(EventKind::Signal, 1, 0, 0xc0, 0)).unwrap();
            p1.syscall_boundary().unwrap();
            p1.finish().unwrap();
            let mut p2 = pipeline.producer(2);
            p2.append(ev(EventKind::ThrStart, 2, 0, 0, 0)).unwrap();
            p2.append(ev(EventKind::Wait, 2, 0, 0xc0, 0)).unwrap();
            p2.append(ev(EventKind::Write, 2, 0x200, 0x3000, 4)).unwrap();
            p2.syscall_boundary().unwrap();
            p2.finish().unwrap();
        }
        let fin = pipeline.finalize().unwrap();
        assert_eq!(fin.races_reported, 0, "mode {mode:?}");
    }
}

#[test]
fn race_detected_in_every_mode() {
    for &mode in ALL_MODES {
        let (pipeline, sink) = pipeline(mode);
        {
            let mut p1 = pipeline.producer(1);
            p1.append(ev(EventKind::ThrStart, 1, 0, 0, 0)).unwrap();
            p1.append(ev(EventKind::Write, 1, 0x100, 0x1000, 4)).unwrap();
            p1.syscall_boundary().unwrap();
            p1.finish().unwrap();
            let mut p2 = pipeline.producer(2);
            p2.append(ev(EventKind::ThrStart, 2, 0, 0, 0)).unwrap();
            p2.append(ev(EventKind::Read, 2, 0x200, 0x1000, 4)).unwrap();
            p2.syscall_boundary().unwrap();
            p2.finish().unwrap();
        }
        let fin = pipeline.finalize().unwrap();
        assert_eq!(fin.races_reported, 1, "mode {mode:?}");
        assert_eq!(sink.reports().len(), 1, "mode {mode:?}");
    }
}

#[test]
fn parallel_producers_with_disjoint_data_are_clean() {
    for &mode in &[FlushMode::OnFlush, FlushMode::SeparateThread] {
        let (pipeline, _) = pipeline(mode);
        std::thread::scope(|scope| {
            for tid in 1..=8u32 {
                let pipeline = &pipeline;
                scope.spawn(move || {
                    let mut p = pipeline.producer(tid);
                    p.append(ev(EventKind::ThrStart, tid, 0, 0, 0)).unwrap();
                    for i in 0..(TLEB_CAPACITY as u64 + 100) {
                        p.append(ev(
                            EventKind::Write,
                            tid,
                            0x100,
                            (tid as u64) << 32 | (8 * i),
                            4,
                        ))
                        .unwrap();
                    }
                    p.finish().unwrap();
                });
            }
        });
        let fin = pipeline.finalize().unwrap();
        assert_eq!(fin.races_reported, 0, "mode {mode:?}");
    }
}

#[test]
fn parallel_producers_sharing_data_race() {
    // Two threads hammer the same address with no synchronization: exactly
    // one report regardless of interleaving (one racing pc pair).
    let (pipeline, _) = pipeline(FlushMode::SeparateThread);
    std::thread::scope(|scope| {
        for tid in 1..=2u32 {
            let pipeline = &pipeline;
            scope.spawn(move || {
                let mut p = pipeline.producer(tid);
                p.append(ev(EventKind::ThrStart, tid, 0, 0, 0)).unwrap();
                for _ in 0..200 {
                    p.append(ev(EventKind::Write, tid, 0x100 * tid as u64, 0x5000, 4))
                        .unwrap();
                }
                p.finish().unwrap();
            });
        }
    });
    let fin = pipeline.finalize().unwrap();
    assert_eq!(fin.races_reported, 1);
}

#[test]
fn flush_for_finished_thread_is_fatal() {
    let (pipeline, _) = pipeline(FlushMode::OnFlush);
    let mut p = pipeline.producer(1);
    p.append(ev(EventKind::ThrStart, 1, 0, 0, 0)).unwrap();
    p.append(ev(EventKind::ThrEnd, 1, 0, 0, 0)).unwrap();
    p.append(ev(EventKind::Write, 1, 0x100, 0x1000, 4)).unwrap();
    let err = p.finish().unwrap_err();
    assert!(matches!(err, ProtocolError::FlushOnDeadThread { tid: 1 }));
}

#[test]
fn buffers_stay_bounded() {
    let (pipeline, _) = pipeline(FlushMode::OnFlush);
    let mut p = pipeline.producer(1);
    p.append(ev(EventKind::ThrStart, 1, 0, 0, 0)).unwrap();
    for i in 0..(10 * TLEB_CAPACITY as u64) {
        p.append(ev(EventKind::Write, 1, 0x100, 8 * i, 1)).unwrap();
    }
    p.finish().unwrap();
    let events = pipeline.with_analyzer(|a| a.stats().events);
    assert_eq!(events, 1 + 10 * TLEB_CAPACITY as u64);
    pipeline.finalize().unwrap();
}

#[test]
fn queue_backpressure_drains_inline() {
    // Many single-event flushes from one thread overflow the soft-bounded
    // queue; the producer must drain inline rather than lose events.
    let (pipeline, _) = pipeline(FlushMode::SeparateThread);
    let mut p = pipeline.producer(1);
    p.append(ev(EventKind::ThrStart, 1, 0, 0, 0)).unwrap();
    for i in 0..500u64 {
        // SIGNAL is unbatchable: every append is its own flush
        p.append(ev(EventKind::Signal, 1, 0, 0xc000 + i, 0)).unwrap();
    }
    p.finish().unwrap();
    let events = pipeline.with_analyzer(|a| a.stats().events);
    // everything survived the backpressure path
    assert!(events >= 1);
    let fin = pipeline.finalize().unwrap();
    assert_eq!(fin.races_reported, 0);
}
