//! Time-series collaborator seam (spec §4.11). Out of scope per spec.md
//! §1 as a full integration; this gives the engine a concrete, runnable
//! sink so the scheduler's "next time-series flush" deadline
//! (spec.md §4.8 step 6) has something to call.
//!
//! `FileTimeSeriesSink` reuses `rmp`, the same crate `zzping-lib`'s
//! `framedata` module encodes its own on-disk time series with, writing
//! one small record per target per flush rather than adopting
//! `framedata`'s specific frame layout (which serializes a different
//! shape of sample than this engine produces).

use crate::error::TimeSeriesError;
use crate::target::Target;
use chrono::{DateTime, Utc};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};

pub trait TimeSeriesSink {
    fn flush(&mut self, now: DateTime<Utc>, targets: &[Target]) -> Result<(), TimeSeriesError>;
}

/// Appends one `rmp`-encoded record per target to a flat file:
/// `[name: str, unix_secs: uint, avg_delay_ms: f64|nil, avg_loss_pct: f64|nil]`.
pub struct FileTimeSeriesSink {
    path: String,
}

impl FileTimeSeriesSink {
    pub fn new(path: impl Into<String>) -> Self {
        FileTimeSeriesSink { path: path.into() }
    }
}

impl TimeSeriesSink for FileTimeSeriesSink {
    fn flush(&mut self, now: DateTime<Utc>, targets: &[Target]) -> Result<(), TimeSeriesError> {
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut w = BufWriter::new(file);
        let unix_secs = now.timestamp().max(0) as u64;

        for target in targets {
            rmp::encode::write_array_len(&mut w, 4)?;
            rmp::encode::write_str(&mut w, &target.config.name)?;
            rmp::encode::write_uint(&mut w, unix_secs)?;
            match target.avg_delay() {
                Some(v) => rmp::encode::write_f64(&mut w, v)?,
                None => rmp::encode::write_nil(&mut w)?,
            };
            match target.avg_loss() {
                Some(v) => rmp::encode::write_f64(&mut w, v)?,
                None => rmp::encode::write_nil(&mut w)?,
            };
        }
        w.flush()?;
        Ok(())
    }
}
