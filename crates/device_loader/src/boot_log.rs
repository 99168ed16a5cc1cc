//! Boot log: one JSON object per line recording loading milestones

use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize)]
struct Record<'a> {
    phase: &'a str,
    msg: &'a str,
}

#[derive(Debug, Clone)]
pub struct BootLog {
    path: PathBuf,
}

impl BootLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record. Failures are logged at debug level and otherwise ignored.
    pub fn record(&self, phase: &str, msg: &str) {
        if let Err(e) = self.append(&Record { phase, msg }) {
            log::debug!("Boot log '{}' not written: {}", self.path.display(), e);
        }
    }

    fn append(&self, record: &Record<'_>) -> std::io::Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()
    }
}
