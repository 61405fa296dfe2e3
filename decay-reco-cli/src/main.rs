//! Decay Reconstruction CLI Application
//!
//! This is the command-line interface for the decay reconstruction pipeline.
//! It uses the decay-reco library and adds:
//! - TOML run configuration
//! - JSON-lines event input
//! - Parallel per-event processing
//! - CSV output and a run statistics report

use anyhow::{Context, Result};
use clap::Parser;
use decay_reco::{Pipeline, RowSink, RunStatistics};
use rayon::prelude::*;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;

mod config;
mod input;
mod report;
mod sink;

use input::{EventReader, ReadItem};
use sink::CsvSink;

/// Decay Reco - Reconstruct decay candidates and write a flat table
#[derive(Parser, Debug)]
#[command(name = "decay-reco-cli")]
#[command(about = "Reconstruct particle decays from event records into a flat table", long_about = None)]
#[command(version)]
struct Args {
    /// Path to the run configuration (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Event file(s) in JSON-lines format (can be repeated; replaces the configured inputs)
    #[arg(short, long, value_name = "FILE")]
    input: Vec<PathBuf>,

    /// Output CSV file (default: configured path, else stdout)
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Number of worker threads (0 = one per core)
    #[arg(short = 'j', long, value_name = "COUNT")]
    threads: Option<usize>,

    /// Maximum number of events to process
    #[arg(long, value_name = "COUNT")]
    max_events: Option<usize>,

    /// Validate the configuration, print the output columns and exit
    #[arg(long)]
    check: bool,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.quiet);

    log::info!("Decay Reco CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using reconstruction library v{}", decay_reco::VERSION);

    log::info!("Loading configuration from: {:?}", args.config);
    let mut config = config::load_config(&args.config)?;

    // Command line flags override the file
    if !args.input.is_empty() {
        config.input.files = args.input.clone();
    }
    if args.output.is_some() {
        config.output.path = args.output.clone();
    }
    if let Some(threads) = args.threads {
        config.processing.threads = threads;
    }
    if args.max_events.is_some() {
        config.processing.max_events = args.max_events;
    }

    let pipeline = Pipeline::new(&config.pipeline).context("Invalid pipeline configuration")?;

    if args.check {
        println!("Configuration OK: {} steps", pipeline.step_names().count());
        for step in pipeline.step_names() {
            println!("  step    {}", step);
        }
        println!("Table '{}':", pipeline.table());
        for column in sink::LEADING_COLUMNS.iter().map(|c| c.to_string()).chain(pipeline.columns().iter().cloned()) {
            println!("  column  {}", column);
        }
        return Ok(());
    }

    if config.input.files.is_empty() {
        anyhow::bail!("No input files given (use --input or [input] files)");
    }

    if config.processing.threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(config.processing.threads)
            .build_global()
            .context("Failed to start worker threads")?;
    }

    let writer: Box<dyn Write> = match &config.output.path {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("Failed to create output file: {:?}", path))?,
        ),
        None => Box::new(io::stdout().lock()),
    };
    let mut sink = CsvSink::new(BufWriter::new(writer));

    let started = chrono::Local::now();
    let clock = Instant::now();
    let reader = EventReader::new(config.input.files.clone());
    let stats = run(&pipeline, reader, &mut sink, &config.processing)?;

    let text = report::format_report(&stats, started, clock.elapsed());
    if !args.quiet {
        eprint!("{}", text);
    }
    if let Some(path) = &config.output.report {
        report::write_report(path, &text)?;
    }

    Ok(())
}

/// Run the pipeline over every input event, batch by batch
///
/// Events of a batch are processed in parallel; rows are written in input order.
fn run(
    pipeline: &Pipeline,
    reader: EventReader,
    sink: &mut dyn RowSink,
    processing: &config::ProcessingConfig,
) -> Result<RunStatistics> {
    sink.begin(pipeline.table(), pipeline.columns())?;
    let mut stats = RunStatistics::new(pipeline);
    let mut items = reader.take(processing.max_events.unwrap_or(usize::MAX));

    loop {
        let mut batch = Vec::with_capacity(processing.batch_size);
        for item in items.by_ref() {
            match item? {
                ReadItem::Event(record) => batch.push(record),
                ReadItem::Malformed { location, reason } => {
                    log::warn!("Skipping malformed record at {}: {}", location, reason);
                    stats.record_skipped();
                }
            }
            if batch.len() == processing.batch_size {
                break;
            }
        }
        if batch.is_empty() {
            break;
        }

        let results: Vec<_> = batch
            .into_par_iter()
            .map(|record| {
                let number = record.event;
                (number, pipeline.process_event(record))
            })
            .collect();

        for (number, result) in results {
            stats
                .consume(number, result, sink)
                .with_context(|| format!("Pipeline failed on event {}", number))?;
        }
        log::debug!("{} events processed", stats.events);
    }

    sink.finish()?;
    log::info!(
        "Processed {} events ({} skipped), wrote {} rows",
        stats.events,
        stats.skipped,
        stats.rows
    );
    Ok(stats)
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use decay_reco::{MemorySink, PipelineConfig, TableConfig};
    use tempfile::NamedTempFile;

    fn pipeline() -> Pipeline {
        let config = PipelineConfig::new(TableConfig::new("pi+").with_variables(&["p", "charge"]))
            .fill("pi+", "pionID > 0.5");
        Pipeline::new(&config).unwrap()
    }

    fn events(lines: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file
    }

    fn track(id: u32, charge: i32, pion_id: f64) -> String {
        format!(
            r#"{{"id": {}, "charge": {}, "momentum": [0.0, 0.0, 0.5], "attributes": {{"pionID": {}}}}}"#,
            id, charge, pion_id
        )
    }

    #[test]
    fn test_run_keeps_event_order_across_batches() {
        let lines: Vec<String> = (0..7)
            .map(|n| format!(r#"{{"event": {}, "tracks": [{}, {}]}}"#, n, track(0, 1, 0.9), track(1, 1, 0.2)))
            .collect();
        let line_refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let file = events(&line_refs);

        let processing = config::ProcessingConfig { threads: 0, batch_size: 3, max_events: None };
        let mut sink = MemorySink::new();
        let stats = run(&pipeline(), EventReader::new(vec![file.path().to_path_buf()]), &mut sink, &processing)
            .unwrap();

        assert_eq!(stats.events, 7);
        assert_eq!(stats.rows, 7);
        assert_eq!(sink.rows.iter().map(|r| r.event).collect::<Vec<_>>(), (0..7).collect::<Vec<u64>>());
        assert_eq!(sink.value(0, "p"), Some(0.5));
    }

    #[test]
    fn test_run_skips_bad_records_and_honours_limit() {
        let bad_charge = format!(r#"{{"event": 2, "tracks": [{}]}}"#, track(0, 3, 0.9));
        let file = events(&[
            r#"{"event": 1}"#,
            "garbage",
            &bad_charge,
            r#"{"event": 4}"#,
            r#"{"event": 5}"#,
        ]);

        let processing = config::ProcessingConfig { threads: 0, batch_size: 2, max_events: Some(4) };
        let mut sink = MemorySink::new();
        let stats = run(&pipeline(), EventReader::new(vec![file.path().to_path_buf()]), &mut sink, &processing)
            .unwrap();

        assert_eq!(stats.events, 2);
        assert_eq!(stats.skipped, 2);
        assert!(sink.finished);
    }

    #[test]
    fn test_run_writes_csv() {
        let line = format!(r#"{{"event": 8, "tracks": [{}]}}"#, track(0, 1, 0.9));
        let file = events(&[&line]);
        let processing = config::ProcessingConfig::default();
        let mut sink = CsvSink::new(Vec::new());
        run(&pipeline(), EventReader::new(vec![file.path().to_path_buf()]), &mut sink, &processing).unwrap();

        let text = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        assert_eq!(text, "__event__,__candidate__,__ncandidates__,p,charge\n8,0,1,0.5,1\n");
    }
}
