//! Running server instances and the readiness probe

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::E2eResult;

/// Something that can tear a running server down
pub trait Stop: Send {
    fn stop(&mut self) -> E2eResult<()>;
}

/// A live server bound to `port`, owned by exactly one case
///
/// The stop handle runs at most once: either through [`RunningInstance::stop`]
/// or, failing that, when the instance is dropped.
pub struct RunningInstance {
    port: u16,
    base_url: String,
    handle: Option<Box<dyn Stop>>,
}

impl RunningInstance {
    pub fn new(port: u16, handle: impl Stop + 'static) -> Self {
        Self {
            port,
            base_url: format!("http://localhost:{}", port),
            handle: Some(Box::new(handle)),
        }
    }

    /// The application port, which is what callers connect to
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get the base URL for this server
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn is_stopped(&self) -> bool {
        self.handle.is_none()
    }

    /// Stop the server. Later calls are no-ops.
    pub fn stop(&mut self) -> E2eResult<()> {
        match self.handle.take() {
            Some(mut handle) => {
                info!("Stopping server on port {}", self.port);
                handle.stop()
            }
            None => Ok(()),
        }
    }
}

impl Drop for RunningInstance {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Failed to stop server on port {}: {}", self.port, e);
        }
    }
}

impl std::fmt::Debug for RunningInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningInstance")
            .field("port", &self.port)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// One plain TCP connect to `localhost:{port}`
///
/// `localhost` may resolve to both `::1` and `127.0.0.1`; each address is
/// tried, since dev servers differ in which family they bind.
pub async fn probe(port: u16, connect_timeout: Duration) -> bool {
    match timeout(connect_timeout, TcpStream::connect(("localhost", port))).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!("Probe on port {} refused: {}", port, e);
            false
        }
        Err(_) => false,
    }
}
