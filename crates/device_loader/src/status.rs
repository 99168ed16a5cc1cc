//! Status model served by the HTTP API and the status printer
//!
//! Fields are declared in alphabetical order so the serialized JSON has
//! sorted keys.

use crate::progress::{Progress, MAX_LEVEL};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use sysinfo::{Disks, System};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Error,
    Busy,
    Ready,
}

impl StatusKind {
    pub fn from_flags(busy: bool, error: bool) -> Self {
        if error {
            StatusKind::Error
        } else if busy {
            StatusKind::Busy
        } else {
            StatusKind::Ready
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CpuStatus {
    pub temperature: i64,
    pub usage: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiskStatus {
    pub free: u64,
    pub total: u64,
    pub usage: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Steps {
    pub current: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LevelStatus {
    pub action: Option<String>,
    pub output: Option<String>,
    pub progress: u64,
    pub steps: Steps,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoaderStatus {
    pub cpu: CpuStatus,
    pub disk: DiskStatus,
    pub progress: BTreeMap<usize, LevelStatus>,
    pub status: StatusKind,
}

impl LoaderStatus {
    pub fn new(
        progress: &Progress,
        busy: bool,
        error: bool,
        cpu: CpuStatus,
        disk: DiskStatus,
    ) -> Self {
        let percentages = progress.percentages();
        let levels = (0..MAX_LEVEL)
            .map(|lvl| {
                let level = progress.level(lvl);
                (
                    lvl,
                    LevelStatus {
                        action: level.action.clone(),
                        output: level.output.clone(),
                        progress: percentages[lvl],
                        steps: Steps {
                            current: level.tick,
                            total: level.total,
                        },
                    },
                )
            })
            .collect();

        Self {
            cpu,
            disk,
            progress: levels,
            status: StatusKind::from_flags(busy, error),
        }
    }

    /// The same status with every level's captured output dropped
    pub fn without_output(mut self) -> Self {
        for level in self.progress.values_mut() {
            level.output = None;
        }
        self
    }

    pub fn to_pretty_json(&self) -> serde_json::Result<String> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut ser)?;
        // serde_json only ever writes valid UTF-8
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// Samples CPU usage, CPU temperature and disk space
pub struct SystemProbe {
    system: System,
    data_dir: PathBuf,
    temperature_file: PathBuf,
}

impl SystemProbe {
    pub fn new(data_dir: impl Into<PathBuf>, temperature_file: impl Into<PathBuf>) -> Self {
        let mut system = System::new();
        // The first usage sample only establishes a baseline
        system.refresh_cpu_usage();
        Self {
            system,
            data_dir: data_dir.into(),
            temperature_file: temperature_file.into(),
        }
    }

    pub fn cpu(&mut self) -> CpuStatus {
        self.system.refresh_cpu_usage();
        CpuStatus {
            temperature: read_temperature(&self.temperature_file),
            usage: self.system.global_cpu_usage().clamp(0.0, 100.0) as u64,
        }
    }

    /// Space on the filesystem holding the data directory
    pub fn disk(&self) -> DiskStatus {
        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .list()
            .iter()
            .filter(|d| self.data_dir.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len());

        match disk {
            Some(d) => disk_status(d.total_space(), d.available_space()),
            None => DiskStatus::default(),
        }
    }
}

pub fn disk_status(total: u64, free: u64) -> DiskStatus {
    let usage = if total == 0 {
        0
    } else {
        total.saturating_sub(free) * 100 / total
    };
    DiskStatus { free, total, usage }
}

/// Whole degrees from a millidegree sysfs file; 0 when unreadable
pub fn read_temperature(path: &Path) -> i64 {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .map(|milli| (milli / 1000.0) as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_status() -> LoaderStatus {
        let mut progress = Progress::new();
        progress.set_total(0, 2);
        progress.set_status(0, "Loading Docker images");
        progress.set_tick(0, 1);
        progress.set_output(3, Some("\nPull complete".to_string()));
        LoaderStatus::new(
            &progress,
            true,
            false,
            CpuStatus {
                temperature: 47,
                usage: 12,
            },
            disk_status(1000, 250),
        )
    }

    #[test]
    fn test_status_kind() {
        assert_eq!(StatusKind::from_flags(true, true), StatusKind::Error);
        assert_eq!(StatusKind::from_flags(true, false), StatusKind::Busy);
        assert_eq!(StatusKind::from_flags(false, false), StatusKind::Ready);
    }

    #[test]
    fn test_json_shape() {
        let value = serde_json::to_value(sample_status()).unwrap();
        assert_eq!(value["status"], "busy");
        assert_eq!(value["cpu"]["temperature"], 47);
        assert_eq!(value["disk"]["usage"], 75);
        assert_eq!(value["progress"]["0"]["action"], "Loading Docker images");
        assert_eq!(value["progress"]["0"]["progress"], 50);
        assert_eq!(value["progress"]["0"]["steps"]["current"], 1);
        assert_eq!(value["progress"]["0"]["steps"]["total"], 2);
        assert_eq!(value["progress"]["3"]["output"], "\nPull complete");
        assert!(value["progress"]["1"]["action"].is_null());
    }

    #[test]
    fn test_pretty_json_has_sorted_keys() {
        let json = sample_status().to_pretty_json().unwrap();
        let cpu = json.find("\"cpu\"").unwrap();
        let disk = json.find("\"disk\"").unwrap();
        let progress = json.find("\"progress\"").unwrap();
        let status = json.find("\"status\"").unwrap();
        assert!(cpu < disk && disk < progress && progress < status);
        assert!(json.contains("\n    \"cpu\": {\n        \"temperature\": 47,"));
    }

    #[test]
    fn test_without_output() {
        let status = sample_status().without_output();
        assert!(status.progress.values().all(|level| level.output.is_none()));
    }

    #[test]
    fn test_read_temperature() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("temp");
        std::fs::write(&path, "47850\n").unwrap();
        assert_eq!(read_temperature(&path), 47);
        assert_eq!(read_temperature(&dir.path().join("missing")), 0);
    }

    #[test]
    fn test_disk_status() {
        assert_eq!(disk_status(0, 0).usage, 0);
        assert_eq!(disk_status(200, 50).usage, 75);
    }
}
