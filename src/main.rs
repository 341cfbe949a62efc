//! echo-device: a single shared echo buffer served over TCP
//!
//! Clients write a message into one bounded buffer and read it back, with
//! the semantics of a tiny character device:
//! - Writes start a new message at offset 0 or append at the message end
//! - Oversized writes are truncated to the buffer capacity
//! - Reads see the message followed by a zero terminator
//! - Every connection shares the same buffer; the last writer wins
//!
//! Configuration via CLI arguments or TOML file.

mod config;
mod device;
mod protocols;
mod runtime;
mod server;

use config::{Config, RuntimeType};
use device::EchoDevice;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        runtime = ?config.runtime,
        workers = config.workers,
        device = %config.device.node.name,
        capacity = config.device.capacity,
        "Starting echo-device server"
    );

    let device = EchoDevice::attach(config.device.clone())?;

    let result = match config.runtime {
        RuntimeType::Mio => run_mio(&config, Arc::clone(&device)),
        RuntimeType::Tokio => run_tokio(config, Arc::clone(&device)),
    };

    // Every connection has been dropped by now, so no session outlives the device.
    device.detach()?;
    result
}

/// Run with mio runtime (epoll on Linux, kqueue on macOS)
fn run_mio(config: &Config, device: Arc<EchoDevice>) -> Result<(), Box<dyn std::error::Error>> {
    info!("Using mio runtime (epoll/kqueue)");
    runtime::run_mio(config, device)?;
    Ok(())
}

/// Run with Tokio runtime
fn run_tokio(config: Config, device: Arc<EchoDevice>) -> Result<(), Box<dyn std::error::Error>> {
    info!("Using tokio runtime");
    server::run(config, device)?;
    Ok(())
}
