use super::core::Server;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Handle to a running server
///
/// Provides methods for waiting until the server is ready, stopping it
/// gracefully, or blocking until it has been destroyed.
pub struct ServerHandle {
    addr: SocketAddr,
    server: Arc<Server>,
}

impl ServerHandle {
    pub(crate) fn new(addr: SocketAddr, server: Arc<Server>) -> Self {
        Self { addr, server }
    }

    /// Bound address; resolves port 0 to the ephemeral port actually used.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Wait for the server to be ready to accept connections
    ///
    /// Polls the server address by attempting TCP connections until successful.
    /// Useful in tests to ensure the server is fully started before sending requests.
    ///
    /// # Errors
    ///
    /// Returns `TimedOut` error if the server doesn't become ready within ~250ms (50 attempts × 5ms).
    pub fn wait_ready(&self) -> io::Result<()> {
        for _ in 0..50 {
            if TcpStream::connect(self.addr).is_ok() {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(5));
        }
        Err(io::Error::new(io::ErrorKind::TimedOut, "server not ready"))
    }

    /// Stop the server gracefully
    ///
    /// Runs [`Server::destroy`]: blocks until in-flight requests finished and
    /// every component was destroyed.
    pub fn stop(self) {
        self.server.destroy();
    }

    /// Block until the server is destroyed (from a signal handler, another
    /// thread, or a component).
    pub fn join(self) {
        self.server.wait_stopped();
    }
}
