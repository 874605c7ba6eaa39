//! Detector configuration
//!
//! One immutable [`Options`] value is captured at construction and passed by
//! reference; there are no global flag singletons. The CLI front-end maps
//! command-line flags onto this struct.

use serde::Serialize;
use std::path::{Path, PathBuf};

/// How producers hand buffers to the analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum FlushMode {
    /// Acquire the analyzer lock per flush. Simplest; producers may contend.
    #[default]
    OnFlush,
    /// Flush copies the buffer onto a bounded queue drained by a dedicated
    /// consumer thread; producers never analyze.
    SeparateThread,
    /// The producer keeps the analyzer lock across flushes until a syscall
    /// boundary or an event-count budget, minimizing lock churn in CPU-bound
    /// regions.
    OnSyscall,
}

/// Offline log dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum OfflineSyntax {
    /// `EVENT_NAME tid pc addr info`, hex fields.
    #[default]
    Default,
    /// java.lang.instrument encoded streams: decimal fields, 1-based tids,
    /// composite events, string PCs.
    Jli,
}

/// All recognized configuration options.
#[derive(Debug, Clone, Serialize)]
pub struct Options {
    /// Pure happens-before mode: every lock creates HB edges and the
    /// lockset filter is disabled.
    pub pure_happens_before: bool,
    pub locking_scheme: FlushMode,
    /// If nonzero (1..=31), thin out analysis of hot traces: a trace past
    /// 2^n hits is analyzed once every 2^n hits.
    pub literace_sampling: u32,
    /// Resolve PCs in reports through the symbolizer.
    pub symbolize: bool,
    /// Log every access to this literal address.
    pub trace_addr: Option<u64>,
    /// Process exit code when at least one race was reported.
    pub error_exitcode: i32,
    /// Plain-text JSON event dump path.
    pub dump_events: Option<PathBuf>,
    /// Report sink path; `%p` expands to the current PID. None = stderr.
    pub log_file: Option<PathBuf>,
    /// Follow children on exec (honored by instrumentation front-ends; the
    /// offline reader carries it for them).
    pub trace_children: bool,
    pub offline_syntax: OfflineSyntax,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            pure_happens_before: false,
            locking_scheme: FlushMode::OnFlush,
            literace_sampling: 0,
            symbolize: true,
            trace_addr: None,
            error_exitcode: 1,
            dump_events: None,
            log_file: None,
            trace_children: false,
            offline_syntax: OfflineSyntax::Default,
        }
    }
}

/// Expand `%p` in a log path to the current process id.
pub fn expand_log_path(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if s.contains("%p") {
        PathBuf::from(s.replace("%p", &std::process::id().to_string()))
    } else {
        path.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = Options::default();
        assert!(!opts.pure_happens_before);
        assert_eq!(opts.locking_scheme, FlushMode::OnFlush);
        assert_eq!(opts.literace_sampling, 0);
        assert_eq!(opts.error_exitcode, 1);
        assert_eq!(opts.offline_syntax, OfflineSyntax::Default);
    }

    #[test]
    fn test_expand_log_path() {
        let expanded = expand_log_path(Path::new("races-%p.log"));
        let name = expanded.to_string_lossy();
        assert!(name.starts_with("races-"));
        assert!(!name.contains("%p"));
        assert_eq!(
            expand_log_path(Path::new("plain.log")),
            PathBuf::from("plain.log")
        );
    }
}
