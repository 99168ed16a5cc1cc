//! Periodic status dump to stdout

use crate::loader::{sleep_or_shutdown, Loader};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Print the status as JSON every `period` until shutdown
pub async fn run_status_printer(
    loader: Arc<Loader>,
    period: Duration,
    mut shutdown: watch::Receiver<()>,
) {
    loop {
        match loader.status().to_pretty_json() {
            Ok(json) => println!("{}", json),
            Err(e) => log::warn!("Failed to serialize status: {}", e),
        }
        if sleep_or_shutdown(period, &mut shutdown).await {
            break;
        }
    }
}
