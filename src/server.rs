//! TCP server for the Tokio runtime.
//!
//! Accepts connections, opens one device session per connection, and hands
//! both to the device protocol handler.

use crate::config::Config;
use crate::device::EchoDevice;
use crate::protocols::device::handle_connection;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Time allowed for connection tasks to wind down after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Server instance
pub struct Server {
    config: Config,
    device: Arc<EchoDevice>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config, device: Arc<EchoDevice>) -> Self {
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));
        Server {
            config,
            device,
            connection_limit,
        }
    }

    /// Accept connections on `listener` until `shutdown` resolves.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let permit = match self.connection_limit.clone().try_acquire_owned() {
                            Ok(permit) => permit,
                            Err(_) => {
                                warn!(peer = %addr, "Connection limit reached");
                                continue;
                            }
                        };

                        let session = self.device.open();
                        let max_request_size = self.config.max_request_size;
                        debug!(peer = %addr, session = session.id(), "New connection");

                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, session, max_request_size).await {
                                debug!(error = %e, "Connection error");
                            }
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    return Ok(());
                }
            }
        }
    }

    /// Bind the configured address and serve until ctrl-c.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        info!(address = %self.config.listen, "Server listening");

        self.serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await
    }
}

/// Run the server on a multi-threaded Tokio runtime.
///
/// Returns once the server has stopped and every connection task (and with
/// it every session) has been dropped.
pub fn run(config: Config, device: Arc<EchoDevice>) -> std::io::Result<()> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if config.workers > 0 {
        builder.worker_threads(config.workers);
    }
    let runtime = builder.enable_all().build()?;

    info!(workers = config.workers, "Starting tokio runtime");

    let server = Server::new(config, device);
    let result = runtime.block_on(server.run());

    drop(server);
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}
