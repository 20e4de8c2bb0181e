//! Telemetry Log
//!
//! Accumulates the telemetry records a session accepted, in arrival order,
//! for export once the session ends normally.

mod format;

pub use format::write_csv;

use std::fs::File;
use std::io::{self, BufWriter};
use std::path::Path;

use crate::protocol::Telemetry;

/// Ordered, in-memory telemetry log
#[derive(Debug, Clone, Default)]
pub struct TelemetryLog {
    entries: Vec<Telemetry>,
}

impl TelemetryLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record
    pub fn push(&mut self, telemetry: Telemetry) {
        self.entries.push(telemetry);
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records in arrival order
    pub fn entries(&self) -> &[Telemetry] {
        &self.entries
    }

    /// Write the log as CSV to `path`
    ///
    /// An empty log leaves the filesystem untouched and returns `Ok(false)`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> io::Result<bool> {
        if self.entries.is_empty() {
            return Ok(false);
        }
        let file = File::create(path)?;
        write_csv(BufWriter::new(file), &self.entries)?;
        Ok(true)
    }
}

impl Extend<Telemetry> for TelemetryLog {
    fn extend<I: IntoIterator<Item = Telemetry>>(&mut self, iter: I) {
        self.entries.extend(iter);
    }
}
