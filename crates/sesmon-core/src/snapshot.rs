//! Persistence of device snapshots and timestamped change reports.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::config::Device;
use crate::error::{Error, Result};
use crate::parse::Change;

/// A device in a certain state: either the raw upstream dump or the
/// canonicalised parsed form, distinguished by file name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub device: Device,
    pub captured_at: String,
    pub raw: serde_json::Value,
}

/// All changes between two polls of a single device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeReport {
    pub device: Device,
    pub detected_at: String,
    pub changes: Vec<Change>,
}

/// Writes snapshots and change reports into one per-device directory.
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    dir: PathBuf,
}

impl SnapshotWriter {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|err| Error::io(format!("failure creating directory: {err}")))
    }

    /// Writes a snapshot under the given file name, atomically replacing any
    /// previous content via a temp-file rename.
    pub fn write_device_snapshot(&self, snapshot: &DeviceSnapshot, filename: &str) -> Result<()> {
        self.ensure_dir()?;

        let data = to_pretty_json(snapshot)?;
        let tmp_path = self.dir.join(format!(".{filename}.tmp"));
        let final_path = self.dir.join(filename);

        fs::write(&tmp_path, &data)
            .map_err(|err| Error::io(format!("failure writing to file: {err}")))?;
        fs::rename(&tmp_path, &final_path)
            .map_err(|err| Error::io(format!("failure replacing file: {err}")))
    }

    /// Writes a change report under `change-YYYYMMDD-HHMMSS.json`.
    ///
    /// Reports are never overwritten: a second report within the same
    /// wall-clock second fails instead of clobbering the first.
    pub fn write_change_report(&self, report: &ChangeReport) -> Result<PathBuf> {
        let stamp = Local::now().format("%Y%m%d-%H%M%S").to_string();
        self.write_change_report_at(report, &stamp)
    }

    fn write_change_report_at(&self, report: &ChangeReport, stamp: &str) -> Result<PathBuf> {
        self.ensure_dir()?;

        let path = self.dir.join(format!("change-{stamp}.json"));
        let data = to_pretty_json(report)?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|err| Error::io(format!("failure creating report file: {err}")))?;
        file.write_all(&data)
            .map_err(|err| Error::io(format!("failure writing to file: {err}")))?;

        Ok(path)
    }
}

/// Pretty-prints with a two-space indent and a terminating newline.
fn to_pretty_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut data = serde_json::to_vec_pretty(value)
        .map_err(|err| Error::io(format!("failure marshalling to JSON: {err}")))?;
    data.push(b'\n');
    Ok(data)
}
