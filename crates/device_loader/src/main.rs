//! Device loader
//!
//! Loads images and stacks from the data partition, then keeps checking for
//! new ones. Progress is served over HTTP.
//!
//! Usage:
//!   device-loader
//!   device-loader --data-dir /tmp/loader --port 8082 --include-output
//!   device-loader --print-status 1

use argh::FromArgs;
use device_loader::{run_http_server, run_status_printer, DockerCli, Loader, LoaderConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(FromArgs)]
/// Device loader - loads Docker images and stacks from the data partition
struct Args {
    /// loader data directory (default: $LOADER_DATA_DIR or /data/loader)
    #[argh(option)]
    data_dir: Option<PathBuf>,

    /// boot log file (default: $BOOT_LOG_FILE or /data/boot-log.txt)
    #[argh(option)]
    boot_log: Option<PathBuf>,

    /// port of the HTTP status API (default: 8081)
    #[argh(option, short = 'p')]
    port: Option<u16>,

    /// include captured command output in the HTTP status
    #[argh(switch)]
    include_output: bool,

    /// print the status to stdout every N seconds
    #[argh(option)]
    print_status: Option<u64>,

    /// seconds between checks after a successful pass (default: 60)
    #[argh(option)]
    recheck_secs: Option<u64>,

    /// seconds between checks after a failed pass (default: 10)
    #[argh(option)]
    recheck_on_error_secs: Option<u64>,

    /// avahi services directory (default: $AVAHI_SERVICES_DIR or /etc/avahi/services)
    #[argh(option)]
    avahi_dir: Option<PathBuf>,
}

impl Args {
    fn apply_to(self, config: &mut LoaderConfig) {
        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        if let Some(file) = self.boot_log {
            config.boot_log_file = file;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.include_output {
            config.include_output = true;
        }
        if let Some(secs) = self.recheck_secs {
            config.recheck_period = Duration::from_secs(secs);
        }
        if let Some(secs) = self.recheck_on_error_secs {
            config.recheck_period_on_error = Duration::from_secs(secs);
        }
        if let Some(dir) = self.avahi_dir {
            config.avahi_dir = dir;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    let args: Args = argh::from_env();
    let print_status = args.print_status.map(|secs| Duration::from_secs(secs.max(1)));

    let mut config = LoaderConfig::from_env();
    args.apply_to(&mut config);

    log::info!("Starting device-loader...");
    log::info!("  Data directory: {}", config.data_dir.display());
    log::info!("  Boot log: {}", config.boot_log_file.display());

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(());

    // Set up Ctrl+C handler
    ctrlc::set_handler({
        let shutdown_tx = shutdown_tx.clone();
        move || {
            log::info!("Received termination signal, shutting down gracefully...");
            shutdown_tx.send(()).ok();
        }
    })?;

    let port = config.port;
    let include_output = config.include_output;
    let loader = Arc::new(Loader::new(config, Arc::new(DockerCli::new())));

    let http_loader = loader.clone();
    let http_shutdown = shutdown_rx.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = run_http_server(http_loader, port, include_output, http_shutdown).await {
            log::error!("HTTP server error: {}", e);
        }
    });

    let printer_task = print_status.map(|period| {
        tokio::spawn(run_status_printer(
            loader.clone(),
            period,
            shutdown_rx.clone(),
        ))
    });

    // Blocks until shutdown
    loader.run(shutdown_rx).await;

    if let Some(task) = printer_task {
        task.await.ok();
    }
    http_task.await.ok();

    log::info!("Device loader stopped.");

    Ok(())
}
