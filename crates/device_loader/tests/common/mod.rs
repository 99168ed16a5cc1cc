//! Test helpers: a scripted container engine and a scratch data directory

#![allow(dead_code)]

use async_trait::async_trait;
use device_loader::docker::{ContainerEngine, DockerError, EngineEvent, EventFn};
use device_loader::{Loader, LoaderConfig};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Container engine that records calls instead of talking to Docker
#[derive(Default)]
pub struct FakeEngine {
    pub calls: Mutex<Vec<String>>,
    pub present: Mutex<HashSet<String>>,
    /// Pulls of this image fail while `failures_left` is non-zero
    pub failing_image: Option<String>,
    pub failures_left: AtomicUsize,
}

impl FakeEngine {
    pub fn with_present(images: &[&str]) -> Self {
        let engine = Self::default();
        engine
            .present
            .lock()
            .unwrap()
            .extend(images.iter().map(|s| s.to_string()));
        engine
    }

    pub fn failing(mut self, image: &str, times: usize) -> Self {
        self.failing_image = Some(image.to_string());
        self.failures_left = AtomicUsize::new(times);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn load_archive(
        &self,
        archive: &Path,
        shutdown: &watch::Receiver<()>,
        on_event: EventFn<'_>,
    ) -> Result<String, DockerError> {
        if shutdown.has_changed().unwrap_or(true) {
            return Err(DockerError::Interrupted);
        }
        let name = archive.file_name().unwrap().to_string_lossy().into_owned();
        self.record(format!("load:{}", name));
        let size = std::fs::metadata(archive).unwrap().len();
        on_event(EngineEvent::Transferred(size));
        Ok(format!("Loaded image: {}", name))
    }

    async fn image_exists(&self, image: &str) -> Result<bool, DockerError> {
        self.record(format!("exists:{}", image));
        Ok(self.present.lock().unwrap().contains(image))
    }

    async fn pull_image(&self, image: &str, on_event: EventFn<'_>) -> Result<String, DockerError> {
        self.record(format!("pull:{}", image));
        if self.failing_image.as_deref() == Some(image)
            && self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(DockerError::CommandFailed {
                command: format!("docker pull {}", image),
                status: "exit status: 1".to_string(),
                output: "manifest unknown".to_string(),
            });
        }

        let lines = [
            format!("{}: Pulling from library", image),
            "a1b2c3d4e5f6: Pulling fs layer".to_string(),
            "a1b2c3d4e5f6: Download complete".to_string(),
            "a1b2c3d4e5f6: Pull complete".to_string(),
        ];
        for line in &lines {
            on_event(EngineEvent::Line(line.clone()));
        }
        self.present.lock().unwrap().insert(image.to_string());
        Ok(lines.join("\n"))
    }

    async fn compose_up(&self, project: &str, _compose_file: &Path) -> Result<String, DockerError> {
        self.record(format!("up:{}", project));
        Ok(format!("Creating {}_service_1 ... done", project))
    }
}

/// Scratch loader data directory plus boot log and avahi directory
pub struct Fixture {
    pub dir: tempfile::TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("avahi")).unwrap();
        std::fs::write(
            dir.path().join("avahi/dt.device-init.service"),
            "<service-group/>\n",
        )
        .unwrap();
        Self { dir }
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn write(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.path(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    pub fn stack(&self, rel: &str, images: &[&str]) -> PathBuf {
        let mut content = String::from("version: \"3\"\nservices:\n");
        for (i, image) in images.iter().enumerate() {
            content.push_str(&format!("  service{}:\n    image: {}\n", i, image));
        }
        self.write(rel, &content)
    }

    pub fn config(&self) -> LoaderConfig {
        LoaderConfig {
            data_dir: self.path("loader"),
            boot_log_file: self.path("boot-log.txt"),
            temperature_file: self.path("thermal_zone0/temp"),
            avahi_dir: self.path("avahi"),
            recheck_period: Duration::from_secs(60),
            recheck_period_on_error: Duration::from_millis(20),
            ..LoaderConfig::default()
        }
    }

    pub fn boot_log(&self) -> Vec<serde_json::Value> {
        std::fs::read_to_string(self.path("boot-log.txt"))
            .unwrap_or_default()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    pub fn init_advertised(&self) -> bool {
        self.path("avahi/dt.device-init.service").exists()
    }
}

pub fn loader(config: LoaderConfig, engine: Arc<FakeEngine>) -> Arc<Loader> {
    Arc::new(Loader::new(config, engine))
}

/// Poll `condition` every 10ms for up to 5s
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
