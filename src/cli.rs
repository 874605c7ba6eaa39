//! CLI argument parsing for the offline detector

use crate::config::{FlushMode, OfflineSyntax, Options};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LockingSchemeArg {
    /// Take the analyzer lock once per buffer flush
    OnFlush,
    /// Queue flushed buffers to a dedicated consumer thread
    SeparateThread,
    /// Keep the lock across flushes until a syscall boundary
    OnSyscall,
}

impl From<LockingSchemeArg> for FlushMode {
    fn from(arg: LockingSchemeArg) -> Self {
        match arg {
            LockingSchemeArg::OnFlush => FlushMode::OnFlush,
            LockingSchemeArg::SeparateThread => FlushMode::SeparateThread,
            LockingSchemeArg::OnSyscall => FlushMode::OnSyscall,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SyntaxArg {
    /// `EVENT_NAME tid pc addr info` with hex fields
    Default,
    /// java.lang.instrument encoded streams
    Jli,
}

impl From<SyntaxArg> for OfflineSyntax {
    fn from(arg: SyntaxArg) -> Self {
        match arg {
            SyntaxArg::Default => OfflineSyntax::Default,
            SyntaxArg::Jli => OfflineSyntax::Jli,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "carrera")]
#[command(version)]
#[command(about = "Hybrid happens-before data race detector", long_about = None)]
pub struct Cli {
    /// Event log to analyze; reads stdin when omitted
    pub log: Option<PathBuf>,

    /// Pure happens-before mode: disable lockset-based filtering
    #[arg(long = "pure-happens-before")]
    pub pure_happens_before: bool,

    /// How producers hand event buffers to the analyzer
    #[arg(long = "locking-scheme", value_enum, default_value = "on-flush")]
    pub locking_scheme: LockingSchemeArg,

    /// Sample hot traces: analyze one in 2^N occurrences past 2^N hits
    #[arg(long = "literace-sampling", value_name = "N", default_value = "0")]
    pub literace_sampling: u32,

    /// Do not resolve PCs in reports
    #[arg(long = "no-symbolize")]
    pub no_symbolize: bool,

    /// Log every access to this address (hex)
    #[arg(long = "trace-addr", value_name = "ADDR")]
    pub trace_addr: Option<String>,

    /// Exit code when at least one race was reported
    #[arg(long = "error-exitcode", value_name = "CODE", default_value = "1")]
    pub error_exitcode: i32,

    /// Write every parsed event as a JSON line to this file
    #[arg(long = "dump-events", value_name = "PATH")]
    pub dump_events: Option<PathBuf>,

    /// Write reports here instead of stderr; %p expands to the PID
    #[arg(long = "log-file", value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Follow child processes on exec (instrumentation front-ends)
    #[arg(long = "trace-children")]
    pub trace_children: bool,

    /// Offline log dialect
    #[arg(long = "offline-syntax", value_enum, default_value = "default")]
    pub offline_syntax: SyntaxArg,
}

impl Cli {
    pub fn to_options(&self) -> Result<Options> {
        let trace_addr = self
            .trace_addr
            .as_deref()
            .map(|s| {
                u64::from_str_radix(s.trim_start_matches("0x"), 16)
                    .with_context(|| format!("--trace-addr: bad hex address {s:?}"))
            })
            .transpose()?;
        Ok(Options {
            pure_happens_before: self.pure_happens_before,
            locking_scheme: self.locking_scheme.into(),
            literace_sampling: self.literace_sampling.min(31),
            symbolize: !self.no_symbolize,
            trace_addr,
            error_exitcode: self.error_exitcode,
            dump_events: self.dump_events.clone(),
            log_file: self.log_file.clone(),
            trace_children: self.trace_children,
            offline_syntax: self.offline_syntax.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_map_to_default_options() {
        let cli = Cli::parse_from(["carrera"]);
        let opts = cli.to_options().unwrap();
        assert!(!opts.pure_happens_before);
        assert_eq!(opts.locking_scheme, FlushMode::OnFlush);
        assert!(opts.symbolize);
        assert_eq!(opts.error_exitcode, 1);
    }

    #[test]
    fn test_flags_parse() {
        let cli = Cli::parse_from([
            "carrera",
            "--pure-happens-before",
            "--locking-scheme",
            "separate-thread",
            "--literace-sampling",
            "3",
            "--trace-addr",
            "0x1000",
            "--no-symbolize",
            "--offline-syntax",
            "jli",
            "events.log",
        ]);
        let opts = cli.to_options().unwrap();
        assert!(opts.pure_happens_before);
        assert_eq!(opts.locking_scheme, FlushMode::SeparateThread);
        assert_eq!(opts.literace_sampling, 3);
        assert_eq!(opts.trace_addr, Some(0x1000));
        assert!(!opts.symbolize);
        assert_eq!(opts.offline_syntax, OfflineSyntax::Jli);
        assert_eq!(cli.log.as_deref(), Some(std::path::Path::new("events.log")));
    }

    #[test]
    fn test_bad_trace_addr_rejected() {
        let cli = Cli::parse_from(["carrera", "--trace-addr", "zz"]);
        assert!(cli.to_options().is_err());
    }

    #[test]
    fn test_sampling_clamped() {
        let cli = Cli::parse_from(["carrera", "--literace-sampling", "99"]);
        assert_eq!(cli.to_options().unwrap().literace_sampling, 31);
    }
}
