//! Run statistics report

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use decay_reco::RunStatistics;
use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

/// Render the per-step statistics table
pub fn format_report(stats: &RunStatistics, started: DateTime<Local>, wall: Duration) -> String {
    let mut out = String::new();
    let width = stats.steps.iter().map(|s| s.name.len()).max().unwrap_or(0).max(4);

    let _ = writeln!(out, "Run started {}", started.format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(
        out,
        "Events: {} processed, {} skipped; rows written: {}; wall time {:.3}s",
        stats.events,
        stats.skipped,
        stats.rows,
        wall.as_secs_f64()
    );
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "{:<width$}  {:>8}  {:>12}  {:>12}  {:>10}  {:>12}",
        "step", "calls", "in", "out", "time [s]", "per call [ms]",
        width = width
    );
    let _ = writeln!(out, "{}", "-".repeat(width + 66));
    for step in &stats.steps {
        let per_call = if step.calls == 0 {
            0.0
        } else {
            step.elapsed.as_secs_f64() * 1e3 / step.calls as f64
        };
        let _ = writeln!(
            out,
            "{:<width$}  {:>8}  {:>12}  {:>12}  {:>10.3}  {:>12.4}",
            step.name,
            step.calls,
            step.candidates_in,
            step.candidates_out,
            step.elapsed.as_secs_f64(),
            per_call,
            width = width
        );
    }
    out
}

pub fn write_report(path: &Path, text: &str) -> Result<()> {
    std::fs::write(path, text).with_context(|| format!("Failed to write report: {:?}", path))
}
