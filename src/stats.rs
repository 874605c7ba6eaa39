//! Analyzer statistics
//!
//! Counters accumulated during a run and printed as a summary block at
//! finalization. Also serializable for machine consumption.

use crate::events::{EventClass, ALL_CLASSES};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Default, Serialize)]
pub struct Stats {
    /// Events consumed, total.
    pub events: u64,
    /// Events consumed, by class.
    pub events_by_class: HashMap<&'static str, u64>,
    /// TLEB flushes committed to the analyzer.
    pub flushes: u64,

    /// Memory accesses analyzed against shadow memory.
    pub accesses_analyzed: u64,
    /// Accesses skipped because of ignore scopes or annotations.
    pub accesses_ignored: u64,
    /// Accesses skipped by trace sampling.
    pub accesses_sampled_out: u64,

    /// Segments minted / recycled (mirrors the segment table).
    pub segments_minted: u64,
    pub segments_recycled: u64,
    /// Distinct interned vector clocks / lock sets.
    pub clocks_interned: u64,
    pub locksets_interned: u64,
    /// Shadow pages ever allocated.
    pub shadow_pages: u64,

    /// Races reported to the sink.
    pub races_reported: u64,
    /// Race sightings swallowed per cause.
    pub races_suppressed_duplicate: u64,
    pub races_suppressed_benign: u64,
    pub races_suppressed_expected: u64,
    /// Expectations that never fired.
    pub expectations_unfired: u64,

    pub threads_started: u64,
    pub threads_finished: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_event(&mut self, class: EventClass) {
        self.events += 1;
        *self.events_by_class.entry(class.name()).or_insert(0) += 1;
    }

    /// Render the finalization summary block.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        out.push_str("==== carrera summary ====\n");
        out.push_str(&format!("{:>12} events consumed\n", self.events));
        for class in ALL_CLASSES {
            let n = self.events_by_class.get(class.name()).copied().unwrap_or(0);
            if n > 0 {
                out.push_str(&format!("{n:>12}   {}\n", class.name()));
            }
        }
        out.push_str(&format!("{:>12} buffer flushes\n", self.flushes));
        out.push_str(&format!(
            "{:>12} accesses analyzed ({} ignored, {} sampled out)\n",
            self.accesses_analyzed, self.accesses_ignored, self.accesses_sampled_out
        ));
        out.push_str(&format!(
            "{:>12} segments minted ({} recycled)\n",
            self.segments_minted, self.segments_recycled
        ));
        out.push_str(&format!(
            "{:>12} vector clocks interned, {} lock sets\n",
            self.clocks_interned, self.locksets_interned
        ));
        out.push_str(&format!("{:>12} shadow pages allocated\n", self.shadow_pages));
        out.push_str(&format!(
            "{:>12} threads started ({} finished)\n",
            self.threads_started, self.threads_finished
        ));
        out.push_str(&format!(
            "{:>12} races reported ({} duplicate, {} benign, {} expected suppressed)\n",
            self.races_reported,
            self.races_suppressed_duplicate,
            self.races_suppressed_benign,
            self.races_suppressed_expected
        ));
        if self.expectations_unfired > 0 {
            out.push_str(&format!(
                "{:>12} expected races did not happen\n",
                self.expectations_unfired
            ));
        }
        out
    }
}
