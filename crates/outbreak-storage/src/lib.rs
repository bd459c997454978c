//! CSV-backed export layer for Outbreak tick histories.
//!
//! The exporter doubles as a streaming [`TallySink`], writing one row per
//! recorded tally as the simulation runs. IO failures are contained here:
//! they are logged and surfaced through [`StorageError`] on flush, and never
//! reach back into the simulation core.

use outbreak_core::{TallySink, Tick, TickTally};
use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
    sync::{Arc, Mutex},
};
use thiserror::Error;
use tracing::warn;

/// Header a collaborator may prepend to the plain history format.
pub const HISTORY_HEADER: &str = "normal,infected,immune";

/// Header of the detailed report format, including per-tick deltas and the
/// cumulative infection count.
pub const REPORT_HEADER: &str = "Current Normal,Current Infected,Current Immune,\
Normal Change,Infected Change,Immune Change,Total Infected";

/// Storage error wrapper.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("csv export io error: {0}")]
    Io(#[from] io::Error),
    /// Streaming rows were dropped after an earlier io failure.
    #[error("csv export incomplete: rows were dropped after an io error")]
    Incomplete,
}

/// Streaming CSV writer producing one `normal,infected,immune` row per tick.
pub struct CsvExporter {
    writer: BufWriter<File>,
    failed: bool,
}

impl CsvExporter {
    /// Create (or truncate) the file at `path` for headerless export.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            failed: false,
        })
    }

    /// Create the file at `path` and write the history header first.
    pub fn create_with_header(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let mut exporter = Self::create(path)?;
        writeln!(exporter.writer, "{HISTORY_HEADER}")?;
        Ok(exporter)
    }

    /// Append one tally row.
    pub fn write_tally(&mut self, tally: TickTally) -> Result<(), StorageError> {
        writeln!(
            self.writer,
            "{},{},{}",
            tally.normal, tally.infected, tally.immune
        )?;
        Ok(())
    }

    /// Whether a previous streaming write failed and rows are being dropped.
    #[must_use]
    pub const fn has_failed(&self) -> bool {
        self.failed
    }

    /// Flush buffered rows and close the exporter. Fails when any streaming
    /// row was dropped, so callers learn the file is incomplete.
    pub fn finish(mut self) -> Result<(), StorageError> {
        if self.failed {
            return Err(StorageError::Incomplete);
        }
        self.writer.flush()?;
        Ok(())
    }
}

impl TallySink for CsvExporter {
    fn on_tick(&mut self, tick: Tick, tally: TickTally) {
        if self.failed {
            return;
        }
        if let Err(error) = self.write_tally(tally) {
            warn!(tick = tick.0, %error, "csv export failed; dropping further rows");
            self.failed = true;
        }
    }
}

/// Shareable exporter handle: the simulation owns one clone as its sink
/// while the caller keeps another to flush after the run.
#[derive(Clone)]
pub struct SharedExporter {
    inner: Arc<Mutex<CsvExporter>>,
}

impl SharedExporter {
    #[must_use]
    pub fn new(inner: Arc<Mutex<CsvExporter>>) -> Self {
        Self { inner }
    }

    /// Access the underlying exporter.
    #[must_use]
    pub fn exporter(&self) -> Arc<Mutex<CsvExporter>> {
        Arc::clone(&self.inner)
    }
}

impl TallySink for SharedExporter {
    fn on_tick(&mut self, tick: Tick, tally: TickTally) {
        match self.inner.lock() {
            Ok(mut exporter) => exporter.on_tick(tick, tally),
            Err(_) => warn!(tick = tick.0, "exporter mutex poisoned; dropping row"),
        }
    }
}

/// Write an already-recorded history to `path` in one shot.
pub fn export_history(
    path: impl AsRef<Path>,
    history: &[TickTally],
    header: bool,
) -> Result<(), StorageError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    if header {
        writeln!(writer, "{HISTORY_HEADER}")?;
    }
    for tally in history {
        writeln!(
            writer,
            "{},{},{}",
            tally.normal, tally.infected, tally.immune
        )?;
    }
    writer.flush()?;
    Ok(())
}

/// Write the detailed report: current counts, per-tick deltas, and the
/// cumulative infection count on the opening row. The first row describes
/// the initial population and therefore carries zero deltas.
pub fn write_report<W: Write>(
    mut writer: W,
    history: &[TickTally],
    total_infections: u64,
) -> Result<(), StorageError> {
    writeln!(writer, "{REPORT_HEADER}")?;
    let mut previous: Option<TickTally> = None;
    for tally in history {
        match previous {
            None => writeln!(
                writer,
                "{},{},{},0,0,0,{}",
                tally.normal, tally.infected, tally.immune, total_infections
            )?,
            Some(prev) => writeln!(
                writer,
                "{},{},{},{},{},{}",
                tally.normal,
                tally.infected,
                tally.immune,
                tally.normal as i64 - prev.normal as i64,
                tally.infected as i64 - prev.infected as i64,
                tally.immune as i64 - prev.immune as i64,
            )?,
        }
        previous = Some(*tally);
    }
    writer.flush()?;
    Ok(())
}

/// Write the detailed report to a file at `path`.
pub fn export_report(
    path: impl AsRef<Path>,
    history: &[TickTally],
    total_infections: u64,
) -> Result<(), StorageError> {
    let file = File::create(path)?;
    write_report(BufWriter::new(file), history, total_infections)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_rows_carry_deltas() {
        let history = [
            TickTally::new(10, 2, 0),
            TickTally::new(8, 4, 0),
            TickTally::new(7, 3, 2),
        ];
        let mut buffer = Vec::new();
        write_report(&mut buffer, &history, 6).expect("report");
        let text = String::from_utf8(buffer).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], REPORT_HEADER);
        assert_eq!(lines[1], "10,2,0,0,0,0,6");
        assert_eq!(lines[2], "8,4,0,-2,2,0");
        assert_eq!(lines[3], "7,3,2,-1,-1,2");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn report_of_empty_history_is_header_only() {
        let mut buffer = Vec::new();
        write_report(&mut buffer, &[], 0).expect("report");
        let text = String::from_utf8(buffer).expect("utf8");
        assert_eq!(text.lines().count(), 1);
    }
}
