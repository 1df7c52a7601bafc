use crate::tally::TallySnapshot;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("report I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Append-only CSV time series of tally snapshots.
///
/// The file is truncated and given its header once at session start; each
/// snapshot becomes one flushed row, so the series survives an abrupt
/// daemon death up to the last completed tally.
pub struct ReportSink {
    file: File,
    error_bounds: bool,
}

impl ReportSink {
    pub fn create(path: &Path, error_bounds: bool) -> Result<Self, ReportError> {
        let mut file = File::create(path)?;

        write!(file, "Time,Coverage")?;
        if error_bounds {
            write!(file, ",(Lower),(Upper)")?;
        }
        writeln!(file, ",Density,RateS(ins),RateE(per),RateS(avg),RateE(avg)")?;
        file.flush()?;

        Ok(Self { file, error_bounds })
    }

    pub fn append(&mut self, snapshot: &TallySnapshot) -> Result<(), ReportError> {
        write!(
            self.file,
            "{},{}",
            snapshot.elapsed_secs, snapshot.cardinality
        )?;
        if self.error_bounds {
            let (lower, upper) = snapshot
                .bounds
                .unwrap_or((snapshot.cardinality, snapshot.cardinality));
            write!(self.file, ",{lower},{upper}")?;
        }
        writeln!(
            self.file,
            ",{:.2},{},{:.2},{},{:.2}",
            snapshot.density_percent,
            snapshot.rate_inst,
            snapshot.rate_per_exec,
            snapshot.rate_avg,
            snapshot.rate_per_exec_avg,
        )?;
        self.file.flush()?;
        Ok(())
    }
}
