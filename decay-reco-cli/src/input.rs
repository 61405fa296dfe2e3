//! JSON-lines event input
//!
//! One [`EventRecord`] per line; blank lines are ignored.

use anyhow::{Context, Result};
use decay_reco::EventRecord;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

/// Streams event records from one or more JSON-lines files
pub struct EventReader {
    files: std::vec::IntoIter<PathBuf>,
    current: Option<(PathBuf, Lines<BufReader<File>>, usize)>,
}

impl EventReader {
    pub fn new(files: Vec<PathBuf>) -> Self {
        Self { files: files.into_iter(), current: None }
    }

    fn open(path: &Path) -> Result<Lines<BufReader<File>>> {
        log::info!("Reading events from: {:?}", path);
        let file = File::open(path).with_context(|| format!("Failed to open input file: {:?}", path))?;
        Ok(BufReader::new(file).lines())
    }
}

/// Outcome of reading one line
#[derive(Debug)]
pub enum ReadItem {
    Event(EventRecord),
    /// A line that is not a valid event record; the run continues
    Malformed { location: String, reason: String },
}

impl Iterator for EventReader {
    /// I/O failures abort the run, malformed lines do not
    type Item = Result<ReadItem>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                let path = self.files.next()?;
                match Self::open(&path) {
                    Ok(lines) => self.current = Some((path, lines, 0)),
                    Err(e) => return Some(Err(e)),
                }
            }

            let (path, lines, line_number) = self.current.as_mut()?;
            match lines.next() {
                None => self.current = None,
                Some(Err(e)) => {
                    let e = anyhow::Error::new(e).context(format!("Failed to read {:?}", path));
                    self.current = None;
                    return Some(Err(e));
                }
                Some(Ok(line)) => {
                    *line_number += 1;
                    if line.trim().is_empty() {
                        continue;
                    }
                    return Some(Ok(match serde_json::from_str(&line) {
                        Ok(record) => ReadItem::Event(record),
                        Err(e) => ReadItem::Malformed {
                            location: format!("{}:{}", path.display(), line_number),
                            reason: e.to_string(),
                        },
                    }));
                }
            }
        }
    }
}
