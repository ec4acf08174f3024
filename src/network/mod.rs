//! Network module - Handles TCP/TLS communication between nodes
//!
//! Provides:
//! - Server for accepting incoming connections
//! - Client for connecting to other nodes
//! - Network channels with query correlation and backpressure

mod channel;
mod client;
pub mod connection;
mod handler;
mod server;

pub use channel::*;
pub use client::*;
pub use handler::*;
pub use server::*;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Outbound buffer thresholds in bytes.
///
/// A channel becomes unwritable once more than `high` bytes are queued and
/// writable again when the queue drains to `low` or below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub low: usize,
    pub high: usize,
}

impl Watermarks {
    pub fn new(low: usize, high: usize) -> Self {
        Self {
            low: low.min(high),
            high,
        }
    }
}

impl Default for Watermarks {
    fn default() -> Self {
        Self::new(1024 * 1024, 8 * 1024 * 1024)
    }
}

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Port to listen on or connect to
    pub port: u16,
    /// Interface to bind to (None = all)
    pub bind_address: Option<String>,
    /// Whether to use TLS encryption
    pub use_tls: bool,
    /// PKCS#12 identity for the listening side
    pub identity_path: Option<PathBuf>,
    /// Password of the PKCS#12 identity
    pub identity_password: String,
    /// Accept self-signed certificates when connecting
    pub accept_invalid_certs: bool,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Default timeout for queries
    pub query_timeout: Duration,
    /// Outbound backpressure thresholds
    pub watermarks: Watermarks,
    /// Maximum frame size
    pub max_frame_size: usize,
    /// Concurrently running packet handlers
    pub dispatcher_workers: usize,
    /// Initial capacity of each connection's read buffer
    pub read_buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: crate::protocol::DEFAULT_PORT,
            bind_address: None,
            use_tls: false,
            identity_path: None,
            identity_password: String::new(),
            accept_invalid_certs: false,
            connect_timeout: Duration::from_millis(5000),
            query_timeout: Duration::from_millis(5000),
            watermarks: Watermarks::default(),
            max_frame_size: crate::protocol::MAX_FRAME_SIZE,
            dispatcher_workers: 8,
            read_buffer_size: 8 * 1024,
        }
    }
}

impl NetworkConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_tls(mut self, identity_path: PathBuf, password: String) -> Self {
        self.use_tls = true;
        self.identity_path = Some(identity_path);
        self.identity_password = password;
        self
    }

    pub fn without_tls(mut self) -> Self {
        self.use_tls = false;
        self
    }

    /// Address the server binds to
    pub fn bind_addr(&self) -> String {
        let host = self.bind_address.as_deref().unwrap_or("0.0.0.0");
        format!("{}:{}", host, self.port)
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
