//! CloudNet Client
//!
//! Connects to other nodes and turns each connection into a [`NetworkChannel`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio_native_tls::{native_tls, TlsConnector};

use super::handler::TrackingHandler;
use super::{connection, ChannelHandler, NetworkChannel, NetworkConfig};
use crate::dispatch::PacketDispatcher;

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("Connection timeout")]
    Timeout,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Connecting side of the network
pub struct NetworkClient {
    /// Client configuration
    config: NetworkConfig,
    /// Lifecycle handler for opened channels
    handler: Arc<dyn ChannelHandler>,
    /// Dispatcher for inbound packets
    dispatcher: Arc<PacketDispatcher>,
    /// Connector used when TLS is enabled
    connector: Option<TlsConnector>,
    /// Opened channels that are still open
    channels: Arc<RwLock<HashMap<u64, NetworkChannel>>>,
}

impl NetworkClient {
    /// Create a new client
    pub fn new(
        config: NetworkConfig,
        handler: Arc<dyn ChannelHandler>,
        dispatcher: Arc<PacketDispatcher>,
    ) -> ClientResult<Self> {
        let connector = if config.use_tls {
            let connector = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(config.accept_invalid_certs)
                .build()?;
            Some(TlsConnector::from(connector))
        } else {
            None
        };

        let channels = Arc::new(RwLock::new(HashMap::new()));
        Ok(Self {
            config,
            handler: Arc::new(TrackingHandler::new(handler, channels.clone())),
            dispatcher,
            connector,
            channels,
        })
    }

    /// Connect to a node by address
    pub async fn connect(&self, addr: SocketAddr) -> ClientResult<NetworkChannel> {
        self.connect_with_domain(addr, &addr.ip().to_string()).await
    }

    /// Connect to a node by hostname
    pub async fn connect_hostname(&self, hostname: &str, port: u16) -> ClientResult<NetworkChannel> {
        let addr = super::resolve_host(hostname, port).await?;
        self.connect_with_domain(addr, hostname).await
    }

    async fn connect_with_domain(&self, addr: SocketAddr, domain: &str) -> ClientResult<NetworkChannel> {
        tracing::info!(remote = %addr, tls = self.connector.is_some(), "connecting");

        // Connect with timeout
        let stream = match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ClientError::Io(e)),
            Err(_) => return Err(ClientError::Timeout),
        };
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;

        let channel = match &self.connector {
            None => connection::spawn(
                stream,
                local_addr,
                addr,
                true,
                self.handler.clone(),
                self.dispatcher.clone(),
                &self.config,
            ),
            Some(connector) => {
                let tls = match tokio::time::timeout(self.config.connect_timeout, connector.connect(domain, stream)).await {
                    Ok(result) => result?,
                    Err(_) => return Err(ClientError::Timeout),
                };
                connection::spawn(
                    tls,
                    local_addr,
                    addr,
                    true,
                    self.handler.clone(),
                    self.dispatcher.clone(),
                    &self.config,
                )
            }
        };

        Ok(channel)
    }

    /// Channels opened by this client that are still open
    pub async fn channels(&self) -> Vec<NetworkChannel> {
        let channels = self.channels.read().await;
        channels.values().cloned().collect()
    }

    /// Close every channel opened by this client
    pub async fn close_all(&self) {
        let channels = self.channels.read().await;
        for channel in channels.values() {
            channel.close();
        }
    }
}
