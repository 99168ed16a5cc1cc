//! Launch file YAML schema definitions

use crate::avahi::ServiceAdvertisement;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Root launch file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchFile {
    /// Launch file format version
    #[serde(default = "default_version")]
    pub version: String,

    /// Argument definitions with defaults
    #[serde(default)]
    pub args: IndexMap<String, ArgDefinition>,

    /// Sourceable environment description file
    #[serde(default = "default_env_file")]
    pub env_file: String,

    /// Extra variables layered over the environment file
    #[serde(default)]
    pub env: IndexMap<String, String>,

    /// Service advertisements to install before the application starts
    #[serde(default)]
    pub services: ServicesConfig,

    /// The foreground application
    #[serde(default)]
    pub app: AppConfig,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_env_file() -> String {
    super::DEFAULT_ENV_FILE.to_string()
}

impl Default for LaunchFile {
    fn default() -> Self {
        Self {
            version: default_version(),
            args: IndexMap::new(),
            env_file: default_env_file(),
            env: IndexMap::new(),
            services: ServicesConfig::default(),
            app: AppConfig::default(),
        }
    }
}

/// Argument definition with default value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgDefinition {
    pub default: ArgValue,
    #[serde(default)]
    pub description: Option<String>,
}

/// Argument values can be strings, booleans, or numbers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Bool(b) => write!(f, "{}", b),
            ArgValue::Int(i) => write!(f, "{}", i),
            ArgValue::Float(x) => write!(f, "{}", x),
            ArgValue::String(s) => f.write_str(s),
        }
    }
}

/// Where Avahi service files come from and where they go
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// Set to false to skip service installation entirely
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Directory of `*.service` templates; defaults to the project assets
    #[serde(default)]
    pub dir: Option<String>,

    /// Avahi services directory
    #[serde(default)]
    pub target_dir: Option<String>,

    /// Advertisements declared inline
    #[serde(default)]
    pub advertise: Vec<ServiceAdvertisement>,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            target_dir: None,
            advertise: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// How the application replaces or is supervised by the launcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// Replace the launcher's process image; the terminate hook only runs
    /// if the replacement fails
    Replace,
    /// Run the application as a child, forward signals, and report its status
    #[default]
    Supervise,
}

impl FromStr for ExecMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "replace" | "exec" => Ok(ExecMode::Replace),
            "supervise" | "child" => Ok(ExecMode::Supervise),
            other => Err(format!(
                "Invalid exec mode '{}'. Expected 'replace' or 'supervise'",
                other
            )),
        }
    }
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecMode::Replace => f.write_str("replace"),
            ExecMode::Supervise => f.write_str("supervise"),
        }
    }
}

/// Application started as the container's main process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Logical name used in lifecycle markers
    #[serde(default = "default_app_name")]
    pub name: String,

    /// Executable, resolved through `PATH` when not a path
    #[serde(default = "default_executable")]
    pub executable: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub working_dir: Option<String>,

    #[serde(default)]
    pub mode: ExecMode,

    /// Grace period between SIGTERM and SIGKILL when supervising
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_app_name() -> String {
    "device_loader.launch".to_string()
}

fn default_executable() -> String {
    "device-loader".to_string()
}

fn default_shutdown_timeout_ms() -> u64 {
    5000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            executable: default_executable(),
            args: Vec::new(),
            working_dir: None,
            mode: ExecMode::default(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl LaunchFile {
    /// Load launch file from a YAML file
    pub fn from_file(path: &str) -> Result<Self, LaunchFileError> {
        let content = std::fs::read_to_string(path).map_err(|e| LaunchFileError::Io {
            path: path.to_string(),
            source: e,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse launch file from YAML string
    pub fn from_yaml(content: &str) -> Result<Self, LaunchFileError> {
        let launch_file: LaunchFile =
            serde_yaml::from_str(content).map_err(LaunchFileError::Parse)?;
        launch_file.validate()?;
        Ok(launch_file)
    }

    pub fn validate(&self) -> Result<(), LaunchFileError> {
        if self.env_file.trim().is_empty() {
            return Err(LaunchFileError::Validation(
                "'env_file' must not be empty".to_string(),
            ));
        }

        if self.app.executable.trim().is_empty() {
            return Err(LaunchFileError::Validation(
                "'app.executable' must not be empty".to_string(),
            ));
        }

        for service in &self.services.advertise {
            service
                .validate()
                .map_err(|e| LaunchFileError::Validation(e.to_string()))?;
        }

        Ok(())
    }
}

/// Errors that can occur when loading a launch file
#[derive(Debug, thiserror::Error)]
pub enum LaunchFileError {
    #[error("Failed to read launch file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse launch file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avahi::AdvertisedPort;

    #[test]
    fn test_empty_document_uses_defaults() {
        let launch_file = LaunchFile::from_yaml("version: \"1.0\"\n").unwrap();
        assert_eq!(launch_file.env_file, "/environment.sh");
        assert_eq!(launch_file.app.executable, "device-loader");
        assert_eq!(launch_file.app.mode, ExecMode::Supervise);
        assert!(launch_file.services.enabled);
    }

    #[test]
    fn test_full_launch_file() {
        let yaml = r#"
version: "1.0"
args:
  port:
    default: 8081
env_file: /tmp/environment.sh
env:
  LOADER_DATA_DIR: /data/loader
services:
  dir: assets/avahi-services
  target_dir: /tmp/avahi
  advertise:
    - name: device-loader
      type: _duckietown._tcp
      port: 8081
      txt:
        api: "/"
app:
  executable: /usr/local/bin/device-loader
  args: ["--port", "$(arg port)"]
  mode: replace
"#;
        let launch_file = LaunchFile::from_yaml(yaml).unwrap();
        assert_eq!(launch_file.args["port"].default.to_string(), "8081");
        assert_eq!(launch_file.services.advertise.len(), 1);
        assert_eq!(launch_file.services.advertise[0].port, AdvertisedPort::Number(8081));
        assert_eq!(launch_file.app.mode, ExecMode::Replace);
        assert_eq!(launch_file.app.args, vec!["--port", "$(arg port)"]);
    }

    #[test]
    fn test_empty_executable_is_rejected() {
        let result = LaunchFile::from_yaml("app:\n  executable: \"\"\n");
        assert!(matches!(result, Err(LaunchFileError::Validation(_))));
    }

    #[test]
    fn test_bad_service_is_rejected() {
        let yaml = r#"
services:
  advertise:
    - name: broken
      type: duckietown
      port: 8081
"#;
        assert!(LaunchFile::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_exec_mode_from_str() {
        assert_eq!("Replace".parse::<ExecMode>(), Ok(ExecMode::Replace));
        assert_eq!("supervise".parse::<ExecMode>(), Ok(ExecMode::Supervise));
        assert!("fork".parse::<ExecMode>().is_err());
    }

    #[test]
    fn test_shipped_launch_file() {
        let lf = LaunchFile::from_yaml(include_str!("../../../../launch/default.launch.yaml"))
            .unwrap();
        assert!(lf.validate().is_ok());
        assert_eq!(lf.app.executable, "device-loader");
        assert_eq!(lf.app.mode, ExecMode::Supervise);
        assert_eq!(lf.args.len(), 2);
        assert_eq!(
            lf.services.advertise[0].port,
            AdvertisedPort::Template("$(arg port)".to_string())
        );
    }
}
