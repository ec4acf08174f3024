//! CloudNet Server
//!
//! Accepts connections from other nodes and services and turns each one
//! into a [`NetworkChannel`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_native_tls::{native_tls, TlsAcceptor};

use super::handler::TrackingHandler;
use super::{connection, ChannelHandler, NetworkChannel, NetworkConfig};
use crate::dispatch::PacketDispatcher;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("TLS enabled but no identity configured")]
    MissingIdentity,

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Failed to bind to {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Accepting side of the network
pub struct NetworkServer {
    /// Server configuration
    config: NetworkConfig,
    /// Lifecycle handler for accepted channels
    handler: Arc<dyn ChannelHandler>,
    /// Dispatcher for inbound packets
    dispatcher: Arc<PacketDispatcher>,
    /// Accepted channels that are still open
    channels: Arc<RwLock<HashMap<u64, NetworkChannel>>>,
    /// Shutdown signal
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Whether the server is running
    running: Arc<RwLock<bool>>,
}

impl NetworkServer {
    /// Create a new server
    pub fn new(
        config: NetworkConfig,
        handler: Arc<dyn ChannelHandler>,
        dispatcher: Arc<PacketDispatcher>,
    ) -> Self {
        let channels = Arc::new(RwLock::new(HashMap::new()));
        Self {
            config,
            handler: Arc::new(TrackingHandler::new(handler, channels.clone())),
            dispatcher,
            channels,
            shutdown_tx: None,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Start accepting connections. Returns the bound address.
    pub async fn start(&mut self) -> ServerResult<SocketAddr> {
        {
            let running = self.running.read().await;
            if *running {
                return Err(ServerError::AlreadyRunning);
            }
        }

        let acceptor = build_acceptor(&self.config)?;

        let bind_addr = self.config.bind_addr();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| ServerError::BindFailed {
                addr: bind_addr.clone(),
                source,
            })?;

        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, tls = acceptor.is_some(), "server listening");

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        {
            let mut running = self.running.write().await;
            *running = true;
        }

        let handler = self.handler.clone();
        let dispatcher = self.dispatcher.clone();
        let config = self.config.clone();
        let running = self.running.clone();

        // Spawn the accept loop
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                tracing::debug!(remote = %addr, "accepted connection");
                                accept_connection(
                                    stream,
                                    addr,
                                    local_addr,
                                    acceptor.clone(),
                                    handler.clone(),
                                    dispatcher.clone(),
                                    &config,
                                );
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "accept error");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("server shutdown requested");
                        break;
                    }
                }
            }

            let mut running = running.write().await;
            *running = false;
        });

        Ok(local_addr)
    }

    /// Stop accepting and close every accepted channel
    pub async fn stop(&mut self) -> ServerResult<()> {
        {
            let running = self.running.read().await;
            if !*running {
                return Err(ServerError::NotRunning);
            }
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }

        let channels = self.channels.read().await;
        for channel in channels.values() {
            channel.close();
        }

        Ok(())
    }

    /// Accepted channels that are still open
    pub async fn channels(&self) -> Vec<NetworkChannel> {
        let channels = self.channels.read().await;
        channels.values().cloned().collect()
    }

    /// Check if the server is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

fn build_acceptor(config: &NetworkConfig) -> ServerResult<Option<TlsAcceptor>> {
    if !config.use_tls {
        return Ok(None);
    }

    let path = config
        .identity_path
        .as_ref()
        .ok_or(ServerError::MissingIdentity)?;
    let der = std::fs::read(path)?;
    let identity = native_tls::Identity::from_pkcs12(&der, &config.identity_password)?;
    Ok(Some(TlsAcceptor::from(native_tls::TlsAcceptor::new(identity)?)))
}

/// Wrap an accepted stream and start its channel
fn accept_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    handler: Arc<dyn ChannelHandler>,
    dispatcher: Arc<PacketDispatcher>,
    config: &NetworkConfig,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(remote = %remote_addr, error = %e, "failed to set TCP_NODELAY");
    }

    match acceptor {
        None => {
            connection::spawn(stream, local_addr, remote_addr, false, handler, dispatcher, config);
        }
        Some(acceptor) => {
            let config = config.clone();
            // Handshakes run off the accept loop
            tokio::spawn(async move {
                match acceptor.accept(stream).await {
                    Ok(tls) => {
                        connection::spawn(tls, local_addr, remote_addr, false, handler, dispatcher, &config);
                    }
                    Err(e) => {
                        tracing::warn!(remote = %remote_addr, error = %e, "TLS handshake failed");
                    }
                }
            });
        }
    }
}
