//! Container engine access
//!
//! The loader talks to Docker through the [`ContainerEngine`] trait so a
//! pass can be exercised without a daemon. [`DockerCli`] is the real
//! implementation and shells out to `docker` and `docker-compose`.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;

/// Archives are streamed into `docker load` in chunks of this size
pub const LOAD_CHUNK_BYTES: usize = 8 * 1024 * 1024;

/// Docker short layer ids are 12 hex characters
const LAYER_ID_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum DockerError {
    #[error("Failed to run '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' exited with {status}: {output}")]
    CommandFailed {
        command: String,
        status: String,
        output: String,
    },

    #[error("IO error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Interrupted by shutdown")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, DockerError>;

/// Progress reported while an engine operation runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Cumulative bytes written into `docker load`
    Transferred(u64),
    /// One line of `docker pull` output
    Line(String),
}

pub type EventFn<'a> = &'a (dyn Fn(EngineEvent) + Send + Sync);

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Stream an image archive into the engine; returns the engine's output
    async fn load_archive(
        &self,
        archive: &Path,
        shutdown: &watch::Receiver<()>,
        on_event: EventFn<'_>,
    ) -> Result<String>;

    /// Whether `image` (as `repository:tag`) is present locally
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Pull an image; returns the full pull output
    async fn pull_image(&self, image: &str, on_event: EventFn<'_>) -> Result<String>;

    /// Bring a compose stack up detached; returns the tool's stderr
    async fn compose_up(&self, project: &str, compose_file: &Path) -> Result<String>;
}

/// Engine backed by the `docker` and `docker-compose` command-line tools
#[derive(Debug, Clone)]
pub struct DockerCli {
    docker: String,
    compose: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            docker: "docker".to_string(),
            compose: "docker-compose".to_string(),
        }
    }
}

impl DockerCli {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use different binaries, e.g. `podman` / `podman-compose`
    pub fn with_binaries(docker: impl Into<String>, compose: impl Into<String>) -> Self {
        Self {
            docker: docker.into(),
            compose: compose.into(),
        }
    }

    fn check(command: String, output: &std::process::Output) -> Result<()> {
        Self::check_status(command, output.status, &output.stderr)
    }

    fn check_status(command: String, status: ExitStatus, stderr: &[u8]) -> Result<()> {
        if status.success() {
            return Ok(());
        }
        Err(DockerError::CommandFailed {
            command,
            status: status.to_string(),
            output: String::from_utf8_lossy(stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn load_archive(
        &self,
        archive: &Path,
        shutdown: &watch::Receiver<()>,
        on_event: EventFn<'_>,
    ) -> Result<String> {
        let command = format!("{} load", self.docker);
        let io_err = |source| DockerError::Io {
            path: archive.display().to_string(),
            source,
        };

        let mut file = tokio::fs::File::open(archive).await.map_err(io_err)?;
        let mut child = Command::new(&self.docker)
            .arg("load")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DockerError::Spawn {
                command: command.clone(),
                source,
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| DockerError::Spawn {
            command: command.clone(),
            source: std::io::Error::other("stdin not captured"),
        })?;

        let mut buffer = vec![0u8; LOAD_CHUNK_BYTES];
        let mut transferred = 0u64;
        let mut write_error = None;
        loop {
            if shutdown.has_changed().unwrap_or(true) {
                return Err(DockerError::Interrupted);
            }
            let n = file.read(&mut buffer).await.map_err(io_err)?;
            if n == 0 {
                break;
            }
            // An early exit of `docker load` shows up here as a broken pipe;
            // its stderr explains why
            if let Err(e) = stdin.write_all(&buffer[..n]).await {
                write_error = Some(e);
                break;
            }
            transferred += n as u64;
            on_event(EngineEvent::Transferred(transferred));
        }
        // Closing stdin tells `docker load` the archive is complete
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|source| DockerError::Spawn {
                command: command.clone(),
                source,
            })?;
        Self::check(command.clone(), &output)?;
        if let Some(source) = write_error {
            return Err(DockerError::Spawn { command, source });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        let command = format!("{} images", self.docker);
        let output = Command::new(&self.docker)
            .args(["images", "--format", "{{.Repository}}:{{.Tag}}"])
            .output()
            .await
            .map_err(|source| DockerError::Spawn {
                command: command.clone(),
                source,
            })?;
        Self::check(command, &output)?;

        let listing = String::from_utf8_lossy(&output.stdout);
        Ok(listing.lines().any(|line| line.trim() == image))
    }

    async fn pull_image(&self, image: &str, on_event: EventFn<'_>) -> Result<String> {
        let command = format!("{} pull {}", self.docker, image);
        let mut child = Command::new(&self.docker)
            .args(["pull", image])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DockerError::Spawn {
                command: command.clone(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // stderr is drained alongside stdout so neither pipe can fill up
        let read_stdout = async {
            let mut collected = String::new();
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let line = line.trim().to_string();
                    collected.push('\n');
                    collected.push_str(&line);
                    on_event(EngineEvent::Line(line));
                }
            }
            collected
        };
        let read_stderr = async {
            let mut buf = Vec::new();
            if let Some(mut stderr) = stderr {
                if let Err(e) = stderr.read_to_end(&mut buf).await {
                    log::debug!("Reading stderr of '{}' failed: {}", command, e);
                }
            }
            buf
        };
        let (collected, stderr) = tokio::join!(read_stdout, read_stderr);

        let status = child.wait().await.map_err(|source| DockerError::Spawn {
            command: command.clone(),
            source,
        })?;
        Self::check_status(command, status, &stderr)?;
        Ok(collected)
    }

    async fn compose_up(&self, project: &str, compose_file: &Path) -> Result<String> {
        let command = format!(
            "{} -p {} --file {} up -d",
            self.compose,
            project,
            compose_file.display()
        );
        let output = Command::new(&self.compose)
            .arg("-p")
            .arg(project)
            .arg("--file")
            .arg(compose_file)
            .args(["up", "-d"])
            .output()
            .await
            .map_err(|source| DockerError::Spawn {
                command: command.clone(),
                source,
            })?;
        Self::check(command, &output)?;
        Ok(String::from_utf8_lossy(&output.stderr).trim().to_string())
    }
}

/// What a line of `docker pull` output means for progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullUpdate {
    /// A new layer was announced; carries the number of layers seen so far
    LayerAdded(usize),
    /// A layer finished downloading or extracting
    Step,
    Ignored,
}

/// Tracks layers announced by `docker pull`.
///
/// Each layer contributes two steps: download and extraction.
#[derive(Debug, Default)]
pub struct PullProgress {
    layers: HashSet<String>,
}

impl PullProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layers(&self) -> usize {
        self.layers.len()
    }

    pub fn total_steps(&self) -> u64 {
        2 * self.layers.len() as u64
    }

    pub fn observe(&mut self, line: &str) -> PullUpdate {
        let mut parts = line.trim().split(':');
        let (Some(layer), Some(action), None) = (parts.next(), parts.next(), parts.next()) else {
            return PullUpdate::Ignored;
        };
        let layer = layer.trim();
        if layer.len() != LAYER_ID_LEN {
            return PullUpdate::Ignored;
        }

        match action.trim() {
            "Waiting" | "Pulling fs layer" => {
                self.layers.insert(layer.to_string());
                PullUpdate::LayerAdded(self.layers.len())
            }
            "Download complete" | "Pull complete" => PullUpdate::Step,
            _ => PullUpdate::Ignored,
        }
    }
}
