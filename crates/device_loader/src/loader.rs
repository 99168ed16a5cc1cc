//! The loading loop
//!
//! Each pass scans the data directory, loads image archives, pulls the
//! images of every stack, brings up the stacks marked to run and removes
//! consumed inputs. Progress is published through [`LoaderState`] which the
//! HTTP server and the status printer read concurrently.

use crate::boot_log::BootLog;
use crate::config::{LoaderConfig, DEVICE_INIT_SERVICE};
use crate::docker::{ContainerEngine, DockerError, EngineEvent, PullProgress, PullUpdate};
use crate::progress::Progress;
use crate::scan::{Scan, ScanSummary};
use crate::stack::{self, StackError};
use crate::status::{LoaderStatus, SystemProbe};
use device_loader_launch::avahi::disable_service;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

const LEVEL_ALL: usize = 0;
const LEVEL_PHASE: usize = 1;
const LEVEL_ITEM: usize = 2;
const LEVEL_STEP: usize = 3;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error(transparent)]
    Stack(#[from] StackError),

    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error("Failed to access '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Interrupted by shutdown")]
    Interrupted,
}

impl LoaderError {
    pub fn is_interrupted(&self) -> bool {
        matches!(
            self,
            LoaderError::Interrupted | LoaderError::Docker(DockerError::Interrupted)
        )
    }
}

pub type Result<T> = std::result::Result<T, LoaderError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderState {
    pub progress: Progress,
    pub busy: bool,
    pub error: bool,
}

impl Default for LoaderState {
    fn default() -> Self {
        Self {
            progress: Progress::new(),
            busy: true,
            error: false,
        }
    }
}

pub struct Loader {
    config: LoaderConfig,
    engine: Arc<dyn ContainerEngine>,
    state: RwLock<LoaderState>,
    probe: Mutex<SystemProbe>,
    boot_log: BootLog,
}

fn is_shutdown(shutdown: &watch::Receiver<()>) -> bool {
    shutdown.has_changed().unwrap_or(true)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl Loader {
    pub fn new(config: LoaderConfig, engine: Arc<dyn ContainerEngine>) -> Self {
        let probe = SystemProbe::new(&config.data_dir, &config.temperature_file);
        let boot_log = BootLog::new(&config.boot_log_file);
        Self {
            config,
            engine,
            state: RwLock::new(LoaderState::default()),
            probe: Mutex::new(probe),
            boot_log,
        }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    fn read(&self) -> RwLockReadGuard<'_, LoaderState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, LoaderState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn progress<R>(&self, f: impl FnOnce(&mut Progress) -> R) -> R {
        f(&mut self.write().progress)
    }

    /// Copy of the current state
    pub fn state(&self) -> LoaderState {
        self.read().clone()
    }

    /// Current status including CPU and disk telemetry
    pub fn status(&self) -> LoaderStatus {
        let (cpu, disk) = {
            let mut probe = self.probe.lock().unwrap_or_else(|e| e.into_inner());
            (probe.cpu(), probe.disk())
        };
        let state = self.read();
        LoaderStatus::new(&state.progress, state.busy, state.error, cpu, disk)
    }

    /// Run passes until shutdown, waiting between them
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<()>) {
        while !is_shutdown(&shutdown) {
            let period = match self.run_once(&shutdown).await {
                Ok(()) => {
                    self.withdraw_init_service();
                    self.config.recheck_period
                }
                Err(e) if e.is_interrupted() => break,
                Err(e) => {
                    log::error!("Loading failed: {}", e);
                    let mut state = self.write();
                    state.progress.fail(&e.to_string());
                    state.error = true;
                    self.config.recheck_period_on_error
                }
            };

            log::debug!("Next check in {:?}", period);
            if sleep_or_shutdown(period, &mut shutdown).await {
                break;
            }
        }
        log::info!("Loader stopped");
    }

    fn withdraw_init_service(&self) {
        match disable_service(&self.config.avahi_dir, DEVICE_INIT_SERVICE) {
            Ok(true) => {}
            Ok(false) => log::debug!("{} is not advertised", DEVICE_INIT_SERVICE),
            Err(e) => log::warn!("Failed to withdraw {}: {}", DEVICE_INIT_SERVICE, e),
        }
    }

    /// One loading pass over the data directory
    pub async fn run_once(&self, shutdown: &watch::Receiver<()>) -> Result<()> {
        let scan = Scan::scan(&self.config.data_dir);
        log::info!(
            "{}",
            ScanSummary {
                scan: &scan,
                exclude_run: &self.config.exclude_run,
                delete_inputs: self.config.delete_inputs,
            }
        );

        self.write().busy = true;

        let stacks_to_load = read_stacks(&scan.stacks_to_load)?;
        let stacks_to_run = read_stacks(&scan.stacks_to_run)?;
        let num_images = scan.archives()
            + stacks_to_load.iter().map(|(_, i)| i.len()).sum::<usize>()
            + stacks_to_run.iter().map(|(_, i)| i.len()).sum::<usize>();

        self.progress(|p| {
            p.set_total(LEVEL_ALL, num_images as u64);
            p.set_status(LEVEL_ALL, "Loading Docker images");
        });

        self.load_archives(
            &scan.images_tar,
            "Loading uncompressed images (.tar)",
            shutdown,
        )
        .await?;
        self.load_archives(
            &scan.images_tar_gz,
            "Loading compressed images (.tar.gz)",
            shutdown,
        )
        .await?;

        self.progress(|p| {
            p.set_total(LEVEL_PHASE, stacks_to_run.len() as u64);
            p.set_status(LEVEL_PHASE, "Loading stacks we run at boot");
        });
        for (stack_file, images) in &stacks_to_run {
            let name = stack::stack_name(stack_file);
            self.progress(|p| {
                p.set_total(LEVEL_ITEM, images.len() as u64 + 1);
                p.set_status(LEVEL_ITEM, format!("Loading stack: {}", name));
            });
            for image in images {
                if is_shutdown(shutdown) {
                    return Err(LoaderError::Interrupted);
                }
                if !self.engine.image_exists(image).await? {
                    self.pull_image(image).await?;
                    self.boot_log.record("loading", &format!("Image loaded: {}", image));
                }
                self.progress(|p| {
                    p.tick(LEVEL_ITEM);
                    p.tick(LEVEL_ALL);
                });
            }
            if self.config.is_excluded(&name) {
                log::info!("Stack '{}' is excluded from running", name);
            } else {
                self.run_stack(&name, stack_file).await?;
                self.boot_log.record("loading", &format!("Stack run: {}", name));
            }
            self.boot_log
                .record("loading", &format!("Stack completed: {}", name));
            self.progress(|p| {
                p.tick(LEVEL_ITEM);
                p.tick(LEVEL_PHASE);
            });
        }

        self.progress(|p| {
            p.set_total(LEVEL_PHASE, stacks_to_load.len() as u64);
            p.set_status(LEVEL_PHASE, "Loading other stacks");
        });
        for (stack_file, images) in &stacks_to_load {
            let name = stack::stack_name(stack_file);
            self.progress(|p| {
                p.set_total(LEVEL_ITEM, images.len() as u64);
                p.set_status(LEVEL_ITEM, format!("Loading stack: {}", name));
            });
            for image in images {
                if is_shutdown(shutdown) {
                    return Err(LoaderError::Interrupted);
                }
                self.pull_image(image).await?;
                self.progress(|p| {
                    p.tick(LEVEL_ITEM);
                    p.tick(LEVEL_ALL);
                });
                self.boot_log.record("loading", &format!("Image loaded: {}", image));
            }
            self.remove_input(stack_file)?;
            self.boot_log
                .record("loading", &format!("Stack completed: {}", name));
            self.progress(|p| p.tick(LEVEL_PHASE));
        }

        self.boot_log.record("done", "All stacks up");
        log::info!("All stacks up");

        let mut state = self.write();
        state.busy = false;
        state.error = false;
        Ok(())
    }

    async fn load_archives(
        &self,
        archives: &[PathBuf],
        phase: &str,
        shutdown: &watch::Receiver<()>,
    ) -> Result<()> {
        self.progress(|p| {
            p.set_total(LEVEL_PHASE, archives.len() as u64);
            p.set_status(LEVEL_PHASE, phase);
        });
        for archive in archives {
            if is_shutdown(shutdown) {
                return Err(LoaderError::Interrupted);
            }
            self.load_archive(archive, shutdown).await?;
            self.remove_input(archive)?;
            self.progress(|p| {
                p.tick(LEVEL_PHASE);
                p.tick(LEVEL_ALL);
            });
            self.boot_log
                .record("loading", &format!("Archive loaded: {}", file_name(archive)));
        }
        Ok(())
    }

    async fn load_archive(&self, archive: &Path, shutdown: &watch::Receiver<()>) -> Result<()> {
        let size = std::fs::metadata(archive)
            .map_err(|source| LoaderError::Io {
                path: archive.to_path_buf(),
                source,
            })?
            .len();
        log::info!("Loading archive {} ({} bytes)", archive.display(), size);
        self.progress(|p| {
            p.set_status(LEVEL_ITEM, format!("Loading archive: {}", file_name(archive)));
            p.set_total(LEVEL_ITEM, size);
        });

        let on_event = |event: EngineEvent| {
            if let EngineEvent::Transferred(bytes) = event {
                self.progress(|p| p.set_tick(LEVEL_ITEM, bytes));
            }
        };
        let output = self
            .engine
            .load_archive(archive, shutdown, &on_event)
            .await?;
        self.progress(|p| p.set_output(LEVEL_ITEM, Some(output)));
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        log::info!("Pulling image {}", image);
        self.progress(|p| {
            p.set_action(LEVEL_STEP, format!("Pulling image: {}", image));
            p.set_total(LEVEL_STEP, 1);
            p.set_tick(LEVEL_STEP, 0);
            p.set_output(LEVEL_STEP, Some(String::new()));
        });

        let pull = Mutex::new(PullProgress::new());
        let on_event = |event: EngineEvent| {
            if let EngineEvent::Line(line) = event {
                let update = pull.lock().unwrap_or_else(|e| e.into_inner()).observe(&line);
                self.progress(|p| {
                    p.append_output(LEVEL_STEP, &line);
                    match update {
                        PullUpdate::LayerAdded(layers) => {
                            p.set_total(LEVEL_STEP, 2 * layers as u64)
                        }
                        PullUpdate::Step => p.tick(LEVEL_STEP),
                        PullUpdate::Ignored => {}
                    }
                });
            }
        };
        self.engine.pull_image(image, &on_event).await?;
        Ok(())
    }

    async fn run_stack(&self, name: &str, stack_file: &Path) -> Result<()> {
        log::info!("Bringing up stack {}", name);
        self.progress(|p| {
            p.set_status(LEVEL_STEP, format!("Running stack: {}", name));
            p.set_total(LEVEL_STEP, 1);
        });
        let output = self.engine.compose_up(name, stack_file).await?;
        self.progress(|p| {
            p.set_output(LEVEL_STEP, Some(output));
            p.tick(LEVEL_STEP);
        });
        Ok(())
    }

    fn remove_input(&self, path: &Path) -> Result<()> {
        if !self.config.delete_inputs {
            return Ok(());
        }
        log::info!("Now removing: {}", path.display());
        std::fs::remove_file(path).map_err(|source| LoaderError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn read_stacks(files: &[PathBuf]) -> Result<Vec<(PathBuf, Vec<String>)>> {
    files
        .iter()
        .map(|file| Ok((file.clone(), stack::images_in_stack(file)?)))
        .collect()
}

/// Sleep for `period`; returns true if shutdown was requested meanwhile
pub(crate) async fn sleep_or_shutdown(
    period: Duration,
    shutdown: &mut watch::Receiver<()>,
) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(period) => false,
        _ = shutdown.changed() => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_busy() {
        let state = LoaderState::default();
        assert!(state.busy);
        assert!(!state.error);
    }

    #[test]
    fn test_interrupted_errors() {
        assert!(LoaderError::Interrupted.is_interrupted());
        assert!(LoaderError::Docker(DockerError::Interrupted).is_interrupted());
        assert!(!LoaderError::Stack(StackError::MissingImage {
            stack: "dev".into(),
            service: "builder".into(),
        })
        .is_interrupted());
    }

    #[test]
    fn test_read_stacks_fails_on_bad_stack() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.yaml");
        let bad = dir.path().join("bad.yaml");
        std::fs::write(&good, "services:\n  a:\n    image: x:1\n").unwrap();
        std::fs::write(&bad, "services:\n  a:\n    build: .\n").unwrap();

        let stacks = read_stacks(std::slice::from_ref(&good)).unwrap();
        assert_eq!(stacks, vec![(good.clone(), vec!["x:1".to_string()])]);
        assert!(matches!(
            read_stacks(&[good, bad]),
            Err(LoaderError::Stack(StackError::MissingImage { .. }))
        ));
    }
}
