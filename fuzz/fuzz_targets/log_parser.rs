#![no_main]

use carrera::analyzer::Analyzer;
use carrera::config::{OfflineSyntax, Options};
use carrera::offline;
use carrera::pipeline::Pipeline;
use carrera::report::{RaceReport, ReportSink};
use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

struct NullSink;

impl ReportSink for NullSink {
    fn race(&mut self, _report: &RaceReport) {}
    fn note(&mut self, _message: &str) {}
}

fuzz_target!(|data: &[u8]| {
    // Malformed logs must produce errors, never panics, in either dialect.
    for syntax in [OfflineSyntax::Default, OfflineSyntax::Jli] {
        let opts = Options {
            offline_syntax: syntax,
            ..Options::default()
        };
        let pipeline = Pipeline::new(Analyzer::new(opts, Box::new(NullSink)));
        let _ = offline::run(&pipeline, Cursor::new(data));
        let _ = pipeline.finalize();
    }
});
