//! CSV output sink

use decay_reco::{OutputRow, PipelineError, RowSink};
use std::io::Write;

/// Bookkeeping columns written before the value columns
pub const LEADING_COLUMNS: [&str; 3] = ["__event__", "__candidate__", "__ncandidates__"];

/// Writes the output table as CSV, one header line then one line per row
pub struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
    width: usize,
}

impl<W: Write> CsvSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer: csv::Writer::from_writer(writer), width: 0 }
    }

    /// Flush and hand back the underlying writer
    pub fn into_inner(self) -> std::result::Result<W, PipelineError> {
        self.writer
            .into_inner()
            .map_err(|e| PipelineError::IoError(std::io::Error::other(e.to_string())))
    }
}

fn io_error(e: csv::Error) -> PipelineError {
    PipelineError::IoError(e.into())
}

impl<W: Write> RowSink for CsvSink<W> {
    fn begin(&mut self, table: &str, columns: &[String]) -> decay_reco::Result<()> {
        log::debug!("Writing table '{}' with {} columns", table, columns.len());
        self.width = columns.len();
        let header = LEADING_COLUMNS.iter().copied().chain(columns.iter().map(String::as_str));
        self.writer.write_record(header).map_err(io_error)
    }

    fn write(&mut self, row: &OutputRow) -> decay_reco::Result<()> {
        if row.values.len() != self.width {
            return Err(PipelineError::InvalidConfig(format!(
                "row has {} values for {} columns",
                row.values.len(),
                self.width
            )));
        }
        let mut record = Vec::with_capacity(LEADING_COLUMNS.len() + row.values.len());
        record.push(row.event.to_string());
        record.push(row.candidate.to_string());
        record.push(row.n_candidates.to_string());
        record.extend(row.values.iter().map(|v| v.to_string()));
        self.writer.write_record(&record).map_err(io_error)
    }

    fn finish(&mut self) -> decay_reco::Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
