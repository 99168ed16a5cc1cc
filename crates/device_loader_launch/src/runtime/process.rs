//! Running the application: process replacement or supervised child

use std::fmt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for starting the application
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Process name (for logging)
    pub name: String,
    /// Executable path or name looked up in `PATH`
    pub executable: String,
    /// Command line arguments
    pub args: Vec<String>,
    /// Variables layered over the inherited environment
    pub env: Vec<(String, String)>,
    /// Working directory
    pub working_dir: Option<PathBuf>,
}

impl ProcessConfig {
    /// Command inheriting stdio, file descriptors and the environment
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.executable);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.executable.clone()
        } else {
            format!("{} {}", self.executable, self.args.join(" "))
        }
    }
}

/// How the application ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Terminating signal, if the process was killed
    pub signal: Option<i32>,
}

impl ExitReport {
    pub fn from_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Status the launcher should exit with, following the shell convention
    /// of `128 + signal` for killed processes
    pub fn exit_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => 1,
        }
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "killed by signal {}", signal),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Flag shared with the signal handler asking the supervised child to stop
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    requested: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// The application running as a child of the launcher
pub struct SupervisedProcess {
    config: ProcessConfig,
    child: Child,
    pid: u32,
    started_at: Instant,
}

impl SupervisedProcess {
    pub fn spawn(config: ProcessConfig) -> Result<Self, ExecError> {
        log::info!("[{}] Starting: {}", config.name, config.command_line());

        let child = config
            .command()
            .spawn()
            .map_err(|source| ExecError::SpawnFailed {
                name: config.name.clone(),
                source,
            })?;
        let pid = child.id();
        log::info!("[{}] Process started with PID: {}", config.name, pid);

        Ok(Self {
            config,
            child,
            pid,
            started_at: Instant::now(),
        })
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Block until the child exits. Once `stop` is requested the child gets
    /// SIGTERM, then SIGKILL if it is still alive after `shutdown_timeout`.
    pub fn wait(
        mut self,
        stop: &StopHandle,
        shutdown_timeout: Duration,
    ) -> Result<ExitReport, ExecError> {
        let mut terminate_sent: Option<Instant> = None;
        let mut killed = false;

        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    let report = ExitReport::from_status(status);
                    log::info!(
                        "[{}] Process exited after {:.1}s: {}",
                        self.config.name,
                        self.uptime().as_secs_f64(),
                        report
                    );
                    return Ok(report);
                }
                Ok(None) => {}
                Err(source) => {
                    return Err(ExecError::Wait {
                        name: self.config.name.clone(),
                        source,
                    })
                }
            }

            if stop.is_requested() {
                match terminate_sent {
                    None => {
                        log::info!("[{}] Stopping process...", self.config.name);
                        self.signal_terminate();
                        terminate_sent = Some(Instant::now());
                    }
                    Some(sent) if !killed && sent.elapsed() >= shutdown_timeout => {
                        log::warn!(
                            "[{}] Process did not exit gracefully, forcing kill",
                            self.config.name
                        );
                        let _ = self.child.kill();
                        killed = true;
                    }
                    Some(_) => {}
                }
            }

            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn signal_terminate(&mut self) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Err(e) = kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
                log::debug!("[{}] SIGTERM failed: {}", self.config.name, e);
            }
        }

        #[cfg(not(unix))]
        {
            let _ = self.child.kill();
        }
    }
}

/// Replace the launcher's process image with the application.
///
/// Only returns if the replacement failed.
#[cfg(unix)]
pub fn exec_replace(config: &ProcessConfig) -> ExecError {
    use std::os::unix::process::CommandExt;

    log::info!("[{}] Exec: {}", config.name, config.command_line());
    let source = config.command().exec();
    ExecError::ReplaceFailed {
        name: config.name.clone(),
        source,
    }
}

#[cfg(not(unix))]
pub fn exec_replace(config: &ProcessConfig) -> ExecError {
    ExecError::Unsupported(config.name.clone())
}

/// Errors that can occur while running the application
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("Failed to spawn '{name}': {source}")]
    SpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to replace process with '{name}': {source}")]
    ReplaceFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wait for '{name}': {source}")]
    Wait {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process replacement is not supported on this platform ('{0}')")]
    Unsupported(String),
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(name: &str, script: &str) -> ProcessConfig {
        ProcessConfig {
            name: name.to_string(),
            executable: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: Vec::new(),
            working_dir: None,
        }
    }

    #[test]
    fn test_exit_code_is_reported() {
        let process = SupervisedProcess::spawn(shell("app", "exit 3")).unwrap();
        let report = process
            .wait(&StopHandle::new(), Duration::from_secs(1))
            .unwrap();
        assert_eq!(report, ExitReport::from_code(3));
        assert!(!report.success());
    }

    #[test]
    fn test_env_overlay_reaches_child() {
        let mut config = shell("app", "test \"$LOADER_TEST_VALUE\" = overlay");
        config
            .env
            .push(("LOADER_TEST_VALUE".to_string(), "overlay".to_string()));
        let report = SupervisedProcess::spawn(config)
            .unwrap()
            .wait(&StopHandle::new(), Duration::from_secs(1))
            .unwrap();
        assert!(report.success());
    }

    #[test]
    fn test_stop_sends_sigterm() {
        let stop = StopHandle::new();
        let process = SupervisedProcess::spawn(shell("app", "sleep 30")).unwrap();
        stop.request_stop();
        let report = process.wait(&stop, Duration::from_secs(5)).unwrap();
        assert_eq!(report.signal, Some(15));
        assert_eq!(report.exit_code(), 143);
    }

    #[test]
    fn test_stop_escalates_to_sigkill() {
        let stop = StopHandle::new();
        let process =
            SupervisedProcess::spawn(shell("app", "trap '' TERM; sleep 30")).unwrap();
        // Give the shell time to install the trap
        std::thread::sleep(Duration::from_millis(300));
        stop.request_stop();
        let report = process.wait(&stop, Duration::from_millis(300)).unwrap();
        assert_eq!(report.signal, Some(9));
    }

    #[test]
    fn test_spawn_failure() {
        let config = ProcessConfig {
            name: "missing".to_string(),
            executable: "/nonexistent/device-loader".to_string(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
        };
        assert!(matches!(
            SupervisedProcess::spawn(config),
            Err(ExecError::SpawnFailed { .. })
        ));
    }

    #[test]
    fn test_exit_report_display() {
        assert_eq!(ExitReport::from_code(0).to_string(), "exit code 0");
        let killed = ExitReport {
            code: None,
            signal: Some(9),
        };
        assert_eq!(killed.to_string(), "killed by signal 9");
        assert_eq!(killed.exit_code(), 137);
    }
}
