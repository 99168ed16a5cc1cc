//! Loader configuration
//!
//! Settings come from the process environment with built-in defaults; the
//! command line can override any of them (see `main.rs`).

use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_DATA_DIR: &str = "/data/loader";
pub const DEFAULT_BOOT_LOG_FILE: &str = "/data/boot-log.txt";
pub const DEFAULT_CPU_TEMPERATURE_FILE: &str = "/sys/class/thermal/thermal_zone0/temp";
pub const DEFAULT_PORT: u16 = 8081;
pub const RECHECK_PERIOD_SECS: u64 = 60;
pub const RECHECK_PERIOD_ON_ERROR_SECS: u64 = 10;

/// Advertisement withdrawn once a loading pass completes
pub const DEVICE_INIT_SERVICE: &str = "dt.device-init";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    pub data_dir: PathBuf,
    pub boot_log_file: PathBuf,
    pub temperature_file: PathBuf,
    pub avahi_dir: PathBuf,
    /// Lowercased stack names that are pulled but never brought up
    pub exclude_run: Vec<String>,
    pub delete_inputs: bool,
    pub recheck_period: Duration,
    pub recheck_period_on_error: Duration,
    pub port: u16,
    pub include_output: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            boot_log_file: PathBuf::from(DEFAULT_BOOT_LOG_FILE),
            temperature_file: PathBuf::from(DEFAULT_CPU_TEMPERATURE_FILE),
            avahi_dir: PathBuf::from(device_loader_launch::avahi::DEFAULT_AVAHI_SERVICES_DIR),
            exclude_run: Vec::new(),
            delete_inputs: true,
            recheck_period: Duration::from_secs(RECHECK_PERIOD_SECS),
            recheck_period_on_error: Duration::from_secs(RECHECK_PERIOD_ON_ERROR_SECS),
            port: DEFAULT_PORT,
            include_output: false,
        }
    }
}

impl LoaderConfig {
    /// Defaults overridden by `LOADER_DATA_DIR`, `BOOT_LOG_FILE`,
    /// `EXCLUDE_RUN`, `NO_DELETE` and `AVAHI_SERVICES_DIR`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(dir) = lookup("LOADER_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(file) = lookup("BOOT_LOG_FILE") {
            config.boot_log_file = PathBuf::from(file);
        }
        if let Some(dir) = lookup("AVAHI_SERVICES_DIR") {
            config.avahi_dir = PathBuf::from(dir);
        }
        if let Some(exclude) = lookup("EXCLUDE_RUN") {
            config.exclude_run = parse_exclude_run(&exclude);
        }
        config.delete_inputs = lookup("NO_DELETE").as_deref() != Some("1");
        config
    }

    pub fn is_excluded(&self, stack_name: &str) -> bool {
        let name = stack_name.to_lowercase();
        self.exclude_run.iter().any(|excluded| *excluded == name)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

fn parse_exclude_run(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|name| name.trim().to_lowercase())
        .filter(|name| !name.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> LoaderConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LoaderConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);
        assert_eq!(config.data_dir, PathBuf::from("/data/loader"));
        assert_eq!(config.boot_log_file, PathBuf::from("/data/boot-log.txt"));
        assert!(config.exclude_run.is_empty());
        assert!(config.delete_inputs);
        assert_eq!(config.recheck_period, Duration::from_secs(60));
        assert_eq!(config.recheck_period_on_error, Duration::from_secs(10));
        assert_eq!(config.port, 8081);
    }

    #[test]
    fn test_environment_overrides() {
        let config = config_from(&[
            ("LOADER_DATA_DIR", "/tmp/loader"),
            ("BOOT_LOG_FILE", "/tmp/boot.txt"),
            ("EXCLUDE_RUN", "Duckiebot, dev,"),
            ("NO_DELETE", "1"),
            ("AVAHI_SERVICES_DIR", "/tmp/avahi"),
        ]);
        assert_eq!(config.data_dir(), Path::new("/tmp/loader"));
        assert_eq!(config.boot_log_file, PathBuf::from("/tmp/boot.txt"));
        assert_eq!(config.avahi_dir, PathBuf::from("/tmp/avahi"));
        assert_eq!(config.exclude_run, vec!["duckiebot", "dev"]);
        assert!(!config.delete_inputs);
    }

    #[test]
    fn test_no_delete_requires_exactly_one() {
        assert!(config_from(&[("NO_DELETE", "true")]).delete_inputs);
        assert!(config_from(&[("NO_DELETE", "0")]).delete_inputs);
    }

    #[test]
    fn test_exclusion_is_case_insensitive() {
        let config = config_from(&[("EXCLUDE_RUN", "duckiebot")]);
        assert!(config.is_excluded("DuckieBot"));
        assert!(!config.is_excluded("default"));
    }
}
