//! Command-line interface for device-loader-launch

use crate::config::{ExecMode, LaunchFile};
use argh::FromArgs;
use std::collections::HashMap;

/// Container entry point for the device loader
#[derive(FromArgs, Debug)]
pub struct LaunchArgs {
    /// optional launch file; the built-in plan is used when omitted
    #[argh(positional)]
    pub launch_file: Option<String>,

    /// environment description file (default: /environment.sh)
    #[argh(option, short = 'e')]
    pub env_file: Option<String>,

    /// exec mode: replace or supervise
    #[argh(option, short = 'm')]
    pub mode: Option<ExecMode>,

    /// directory holding Avahi service templates
    #[argh(option)]
    pub services_dir: Option<String>,

    /// avahi services directory to install into
    #[argh(option)]
    pub avahi_dir: Option<String>,

    /// skip service installation
    #[argh(switch)]
    pub no_services: bool,

    /// override launch arguments (format: key:=value)
    #[argh(option, short = 'a', from_str_fn(parse_arg_override))]
    pub arg: Vec<(String, String)>,

    /// show the launch plan without executing
    #[argh(switch)]
    pub dry_run: bool,

    /// validate the launch file and exit
    #[argh(switch)]
    pub validate: bool,

    /// log level (error, warn, info, debug, trace)
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    pub log_level: String,
}

/// Parse argument override in format "key:=value"
fn parse_arg_override(s: &str) -> Result<(String, String), String> {
    match s.split_once(":=") {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!(
            "Invalid argument format '{}'. Expected 'key:=value'",
            s
        )),
    }
}

impl LaunchArgs {
    /// Convert argument overrides to a HashMap
    pub fn arg_overrides(&self) -> HashMap<String, String> {
        self.arg.iter().cloned().collect()
    }

    /// Normalised log level, falling back to `info`
    pub fn log_filter(&self) -> &'static str {
        match self.log_level.to_lowercase().as_str() {
            "error" => "error",
            "warn" => "warn",
            "debug" => "debug",
            "trace" => "trace",
            _ => "info",
        }
    }

    /// Layer command-line flags over the launch file
    pub fn apply_to(&self, launch_file: &mut LaunchFile) {
        if let Some(env_file) = &self.env_file {
            launch_file.env_file = env_file.clone();
        }
        if let Some(mode) = self.mode {
            launch_file.app.mode = mode;
        }
        if let Some(dir) = &self.services_dir {
            launch_file.services.dir = Some(dir.clone());
        }
        if let Some(dir) = &self.avahi_dir {
            launch_file.services.target_dir = Some(dir.clone());
        }
        if self.no_services {
            launch_file.services.enabled = false;
        }
    }
}
