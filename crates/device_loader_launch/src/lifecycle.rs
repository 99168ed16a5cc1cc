//! Managed lifecycle scope around the container's main process

use crate::runtime::ExitReport;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    Terminated,
}

/// Opened by [`LifecycleScope::init`], closed exactly once by
/// [`LifecycleScope::terminate`] or on drop.
#[derive(Debug)]
pub struct LifecycleScope {
    name: String,
    started_at: Instant,
    state: LifecycleState,
    exit: Option<ExitReport>,
}

impl LifecycleScope {
    pub fn init(name: impl Into<String>) -> Self {
        let name = name.into();
        log::info!(
            "[lifecycle] ==> Entrypoint '{}' started (pid {})",
            name,
            std::process::id()
        );
        Self {
            name,
            started_at: Instant::now(),
            state: LifecycleState::Running,
            exit: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Exit report recorded at termination, if the application returned one
    pub fn exit(&self) -> Option<&ExitReport> {
        self.exit.as_ref()
    }

    /// Close the scope. Later calls are ignored.
    pub fn terminate(&mut self, exit: Option<&ExitReport>) {
        if self.state == LifecycleState::Terminated {
            return;
        }
        self.state = LifecycleState::Terminated;
        self.exit = exit.cloned();

        match exit {
            Some(report) => log::info!(
                "[lifecycle] <== Entrypoint '{}' terminated after {:.1}s: {}",
                self.name,
                self.uptime().as_secs_f64(),
                report
            ),
            None => log::warn!(
                "[lifecycle] <== Entrypoint '{}' terminated after {:.1}s without an exit status",
                self.name,
                self.uptime().as_secs_f64()
            ),
        }
    }
}

impl Drop for LifecycleScope {
    fn drop(&mut self) {
        self.terminate(None);
    }
}
