//! Property-based tests for the detector's core invariants
//!
//! Covers the algebra the race decision rests on:
//! 1. Vector clock lattice laws (join/leq/tick)
//! 2. Lock set interning canonicalization and the protection rule
//! 3. The shadow-cell per-byte frontier invariant
//! 4. Replay idempotence of whole event streams

use carrera::analyzer::Analyzer;
use carrera::clock::{ClockId, ClockTable, VectorClock};
use carrera::config::Options;
use carrera::events::{Event, EventKind};
use carrera::lockset::{LockSetId, LockSetTable};
use carrera::report::SharedSink;
use carrera::segment::SegmentTable;
use carrera::shadow::{split_access, ShadowMemory};
use carrera::threads::Tid;
use proptest::prelude::*;
use std::sync::Arc;

fn clock_from(parts: &[u32]) -> VectorClock {
    let mut vc = VectorClock::new();
    for (tid, &n) in parts.iter().enumerate() {
        for _ in 0..n.min(64) {
            vc.tick(tid as u32).unwrap();
        }
    }
    vc
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_join_is_commutative_and_idempotent(
        a in prop::collection::vec(0u32..16, 0..6),
        b in prop::collection::vec(0u32..16, 0..6),
    ) {
        let (va, vb) = (clock_from(&a), clock_from(&b));
        let mut ab = va.clone();
        ab.join(&vb);
        let mut ba = vb.clone();
        ba.join(&va);
        prop_assert_eq!(&ab, &ba);

        let mut aa = va.clone();
        aa.join(&va);
        prop_assert_eq!(&aa, &va);

        // the join is an upper bound
        prop_assert!(va.leq(&ab));
        prop_assert!(vb.leq(&ab));
    }

    #[test]
    fn prop_leq_is_a_partial_order(
        a in prop::collection::vec(0u32..16, 0..6),
        b in prop::collection::vec(0u32..16, 0..6),
        c in prop::collection::vec(0u32..16, 0..6),
    ) {
        let (va, vb, vc) = (clock_from(&a), clock_from(&b), clock_from(&c));
        // reflexive
        prop_assert!(va.leq(&va));
        // transitive
        if va.leq(&vb) && vb.leq(&vc) {
            prop_assert!(va.leq(&vc));
        }
        // antisymmetric
        if va.leq(&vb) && vb.leq(&va) {
            prop_assert_eq!(&va, &vb);
        }
    }

    #[test]
    fn prop_tick_strictly_advances(
        a in prop::collection::vec(0u32..16, 1..6),
        tid in 0u32..6,
    ) {
        let va = clock_from(&a);
        let mut ticked = va.clone();
        ticked.tick(tid).unwrap();
        prop_assert!(va.leq(&ticked));
        prop_assert!(!ticked.leq(&va));
    }

    #[test]
    fn prop_interning_is_structural(
        a in prop::collection::vec(0u32..16, 0..6),
    ) {
        let mut table = ClockTable::new();
        let id1 = table.intern(clock_from(&a));
        let id2 = table.intern(clock_from(&a));
        prop_assert_eq!(id1, id2);
    }

    #[test]
    fn prop_lockset_insertion_order_is_irrelevant(
        locks in prop::collection::vec(1u64..64, 0..8),
    ) {
        let mut table = LockSetTable::new();
        let forward = locks
            .iter()
            .fold(LockSetId::EMPTY, |set, &l| table.add(set, l));
        let reverse = locks
            .iter()
            .rev()
            .fold(LockSetId::EMPTY, |set, &l| table.add(set, l));
        prop_assert_eq!(forward, reverse);
    }

    #[test]
    fn prop_lockset_intersection_matches_naive(
        a in prop::collection::vec(1u64..32, 0..6),
        b in prop::collection::vec(1u64..32, 0..6),
    ) {
        let mut table = LockSetTable::new();
        let sa = a.iter().fold(LockSetId::EMPTY, |s, &l| table.add(s, l));
        let sb = b.iter().fold(LockSetId::EMPTY, |s, &l| table.add(s, l));
        let naive = a.iter().any(|l| b.contains(l));
        prop_assert_eq!(table.intersects(sa, sb), naive);
        // memoized path agrees
        prop_assert_eq!(table.intersects(sb, sa), naive);
    }

    #[test]
    fn prop_reader_reader_overlap_never_protects(
        common in 1u64..32,
    ) {
        let mut table = LockSetTable::new();
        let readers = table.add(LockSetId::EMPTY, common);
        prop_assert!(!table.protects(
            LockSetId::EMPTY,
            readers,
            LockSetId::EMPTY,
            readers
        ));
        prop_assert!(table.protects(readers, LockSetId::EMPTY, LockSetId::EMPTY, readers));
    }

    #[test]
    fn prop_shadow_cell_records_stay_pairwise_unordered(
        // each access: (thread 0..3, derive-from-prior?, offset 0..16, size 1..8, write?)
        accesses in prop::collection::vec(
            (0u32..4, any::<bool>(), 0u64..16, 1u64..8, any::<bool>()),
            1..40
        ),
    ) {
        let mut clocks = ClockTable::new();
        let mut segments = SegmentTable::new();
        let mut shadow = ShadowMemory::new();
        // per-thread current clock; "derive" joins with the last segment's
        // clock of the previously-touched thread, building real HB edges
        let mut thread_clocks = [ClockId::ZERO; 4];
        let mut last_clock: Option<ClockId> = None;

        for (tid, derive, offset, size, is_write) in accesses {
            let mut clock = thread_clocks[tid as usize];
            if derive {
                if let Some(prev) = last_clock {
                    clock = clocks.join(clock, prev);
                }
            }
            clock = clocks.tick(clock, tid).unwrap();
            thread_clocks[tid as usize] = clock;
            last_clock = Some(clock);

            let sid = segments
                .mint(
                    Tid(tid),
                    clock,
                    LockSetId::EMPTY,
                    LockSetId::EMPTY,
                    Arc::from(Vec::new().into_boxed_slice()),
                )
                .unwrap();
            let addr = 0x1000 + offset;
            for sub in split_access(addr, size) {
                shadow.record_access(sub, sid, 0x100, is_write, &clocks, &mut segments);
            }
        }

        // invariant: per byte, all covering records are pairwise unordered
        for byte in 0..24u64 {
            let records = shadow.records_at(0x1000 + byte, 1);
            for (i, a) in records.iter().enumerate() {
                for b in records.iter().skip(i + 1) {
                    let (ca, cb) = (segments.get(a.sid).clock, segments.get(b.sid).clock);
                    prop_assert!(
                        !clocks.leq(ca, cb) && !clocks.leq(cb, ca),
                        "byte {} has ordered records", byte
                    );
                }
            }
        }
    }

    #[test]
    fn prop_replay_is_deterministic(
        // (thread 1..=3, op 0..6, addr-slot 0..4, lock-slot 0..2)
        ops in prop::collection::vec((1u32..4, 0u8..6, 0u64..4, 0u64..2), 0..60),
    ) {
        let build_events = || {
            let mut events = vec![
                Event::new(EventKind::ThrStart, 1, 0, 0, 0),
                Event::new(EventKind::ThrStart, 2, 0, 0, 0),
                Event::new(EventKind::ThrStart, 3, 0, 0, 0),
            ];
            for &(tid, op, addr_slot, lock_slot) in &ops {
                let addr = 0x1000 + 8 * addr_slot;
                let lock = 0xa0 + lock_slot;
                let event = match op {
                    0 => Event::new(EventKind::Read, tid, 0x100 + tid as u64, addr, 4),
                    1 => Event::new(EventKind::Write, tid, 0x200 + tid as u64, addr, 4),
                    2 => Event::new(EventKind::WriterLock, tid, 0, lock, 0),
                    3 => Event::new(EventKind::Unlock, tid, 0, lock, 0),
                    4 => Event::new(EventKind::Signal, tid, 0, 0xc0, 0),
                    _ => Event::new(EventKind::Wait, tid, 0, 0xc0, 0),
                };
                events.push(event);
            }
            events
        };

        let run = || {
            let sink = SharedSink::new();
            let mut analyzer = Analyzer::new(Options::default(), Box::new(sink.clone()));
            for event in build_events() {
                analyzer.handle_event(&event).unwrap();
            }
            let fin = analyzer.finalize();
            let mut key: Vec<(u64, u64, u64)> = sink
                .reports()
                .iter()
                .map(|r| {
                    (
                        r.addr,
                        r.prior.pc.min(r.current.pc),
                        r.prior.pc.max(r.current.pc),
                    )
                })
                .collect();
            key.sort_unstable();
            (fin.races_reported, key)
        };

        prop_assert_eq!(run(), run());
    }
}
