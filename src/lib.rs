//! Carrera - hybrid happens-before + lockset dynamic data race detector
//!
//! This library analyzes a totally-ordered stream of per-thread events
//! (memory accesses, synchronization operations, thread lifecycle) and
//! reports pairs of accesses that race: overlapping bytes, at least one
//! write, unordered by happens-before, and (in hybrid mode) not protected by
//! any common lock.
//!
//! Event producers (an instrumentation runtime or the offline log reader)
//! append to per-thread buffers and flush them through the [`pipeline`] to
//! the single-threaded [`analyzer`], which owns all detector state: the
//! vector-clock and segment engine, shadow memory, and the synchronization
//! object map. Reports leave through a caller-provided sink.

pub mod analyzer;
pub mod annotations;
pub mod cli;
pub mod clock;
pub mod config;
pub mod events;
pub mod heap;
pub mod lockset;
pub mod offline;
pub mod pipeline;
pub mod report;
pub mod segment;
pub mod shadow;
pub mod stats;
pub mod sync_map;
pub mod threads;
