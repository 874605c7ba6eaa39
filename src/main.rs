use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::BufReader;
use tracing::info;

use carrera::analyzer::Analyzer;
use carrera::cli::Cli;
use carrera::config::expand_log_path;
use carrera::offline;
use carrera::pipeline::Pipeline;
use carrera::report::{ReportSink, TextSink};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let opts = cli.to_options()?;

    let sink: Box<dyn ReportSink + Send> = match &opts.log_file {
        Some(path) => {
            let path = expand_log_path(path);
            let file = File::create(&path)
                .with_context(|| format!("creating log file {}", path.display()))?;
            Box::new(TextSink::new(Box::new(file)))
        }
        None => Box::new(TextSink::stderr()),
    };

    let pipeline = Pipeline::new(Analyzer::new(opts.clone(), sink));

    let events = match &cli.log {
        Some(path) => {
            let file =
                File::open(path).with_context(|| format!("opening log {}", path.display()))?;
            offline::run(&pipeline, BufReader::new(file))?
        }
        None => offline::run(&pipeline, std::io::stdin().lock())?,
    };

    let fin = pipeline
        .finalize()
        .context("analyzer failed during finalization")?;
    info!(
        events,
        races = fin.races_reported,
        unfired_expectations = fin.expectations_unfired,
        "analysis complete"
    );

    if fin.races_reported > 0 {
        std::process::exit(opts.error_exitcode);
    }
    Ok(())
}
