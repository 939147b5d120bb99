//! State file: everything needed to resume an interrupted chain.
//!
//! The file is JSON. It is written to a sibling `.tmp` file first and then
//! renamed over the target, so a crash mid-write leaves the previous state
//! file intact.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use canopy_core::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::schedule::ScheduleSnapshot;
use crate::state::StateSnapshot;

/// Contents of a state file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Committed state values, tagged with the sample number.
    pub state: StateSnapshot,
    /// Operator tuning and counters.
    pub schedule: ScheduleSnapshot,
    /// Incrementally maintained posterior at `state.sample`.
    pub log_posterior: f64,
}

impl Checkpoint {
    pub fn sample(&self) -> u64 {
        self.state.sample
    }

    /// Write to `path`, replacing any previous file atomically.
    pub fn write(&self, path: &Path) -> Result<()> {
        let tmp = tmp_path(path);
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer_pretty(&mut out, self)?;
            out.write_all(b"\n")?;
            out.flush()?;
        }
        fs::rename(&tmp, path)?;
        info!(path = %path.display(), sample = self.sample(), "state file written");
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
