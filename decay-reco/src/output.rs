//! Output sinks
//!
//! The pipeline hands finished rows to a [`RowSink`]. The library only ships an
//! in-memory sink; file formats live in the application.

use crate::flatten::OutputRow;
use crate::types::{PipelineError, Result};

/// Receives the output table
///
/// `begin` is called once before any row, `finish` once after the last one.
pub trait RowSink {
    fn begin(&mut self, table: &str, columns: &[String]) -> Result<()>;

    fn write(&mut self, row: &OutputRow) -> Result<()>;

    fn finish(&mut self) -> Result<()>;
}

/// Sink that keeps every row in memory
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<OutputRow>,
    pub finished: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of a named column in one row
    pub fn value(&self, row: usize, column: &str) -> Option<f64> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row).and_then(|r| r.values.get(index)).copied()
    }
}

impl RowSink for MemorySink {
    fn begin(&mut self, table: &str, columns: &[String]) -> Result<()> {
        self.table = table.to_string();
        self.columns = columns.to_vec();
        self.rows.clear();
        self.finished = false;
        Ok(())
    }

    fn write(&mut self, row: &OutputRow) -> Result<()> {
        if row.values.len() != self.columns.len() {
            return Err(PipelineError::InvalidConfig(format!(
                "row has {} values for {} columns",
                row.values.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink() {
        let mut sink = MemorySink::new();
        sink.begin("tree", &["M".to_string(), "p".to_string()]).unwrap();
        sink.write(&OutputRow { event: 1, candidate: 0, n_candidates: 1, values: vec![1.87, 2.0] })
            .unwrap();
        assert!(sink
            .write(&OutputRow { event: 1, candidate: 0, n_candidates: 1, values: vec![1.0] })
            .is_err());
        sink.finish().unwrap();

        assert!(sink.finished);
        assert_eq!(sink.rows.len(), 1);
        assert_eq!(sink.value(0, "p"), Some(2.0));
        assert_eq!(sink.value(0, "E"), None);
    }
}
