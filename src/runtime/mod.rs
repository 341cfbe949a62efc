//! Custom runtime for high-performance networking.
//!
//! - `mio`: readiness-based worker threads (epoll on Linux, kqueue on macOS)
//! - `request`: synchronous request dispatch shared with the Tokio server

mod mio;
pub mod request;

use self::mio::Shutdown;
use crate::config::Config;
use crate::device::EchoDevice;
use std::io;
use std::sync::Arc;
use std::thread;
use tracing::{error, info};

/// Run the mio backend until ctrl-c or a worker failure.
pub fn run_mio(config: &Config, device: Arc<EchoDevice>) -> io::Result<()> {
    let shutdown = Shutdown::new();
    watch_ctrl_c(Arc::clone(&shutdown))?;
    mio::run(config, device, shutdown)
}

/// Trigger `shutdown` on the first ctrl-c.
///
/// The workers stay off tokio; a current-thread runtime on a side thread
/// hosts only the signal listener.
fn watch_ctrl_c(shutdown: Arc<Shutdown>) -> io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    thread::Builder::new()
        .name("signal".to_string())
        .spawn(move || match runtime.block_on(tokio::signal::ctrl_c()) {
            Ok(()) => {
                info!("Shutdown requested");
                shutdown.trigger();
            }
            Err(e) => error!(error = %e, "Failed to listen for ctrl-c"),
        })?;

    Ok(())
}
