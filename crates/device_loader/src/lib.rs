//! Device loader
//!
//! Loads Docker image archives and compose stacks dropped on the data
//! partition, reports multi-level progress over HTTP and records loading
//! milestones in the boot log.
//!
//! # Data layout
//!
//! ```text
//! /data/loader/
//!   images_to_load/   *.tar, *.tar.gz   loaded, then removed
//!   stacks_to_load/   *.yaml, *.yml     images pulled, then removed
//!   stacks_to_run/    *.yaml, *.yml     images pulled, stack brought up
//! ```

pub mod boot_log;
pub mod config;
pub mod docker;
pub mod http_server;
pub mod loader;
pub mod printer;
pub mod progress;
pub mod scan;
pub mod stack;
pub mod status;

pub use config::LoaderConfig;
pub use docker::{ContainerEngine, DockerCli, DockerError, EngineEvent};
pub use http_server::{create_router, run_http_server};
pub use loader::{Loader, LoaderError, LoaderState};
pub use printer::run_status_printer;
pub use progress::{Progress, ProgressLevel, MAX_LEVEL};
pub use status::{LoaderStatus, StatusKind};
