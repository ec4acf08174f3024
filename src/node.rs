//! Node runtime
//!
//! Wires the dispatcher, chunked transfer registry, channel messenger and
//! topology to a server and a client. Both sides of every connection
//! announce their identity on [`IDENTITY_CHANNEL`] so targets can be resolved
//! by name.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::chunk::{ChunkedTransferRegistry, MemorySinkFactory, SinkFactory, TempFileSinkFactory};
use crate::config::Config;
use crate::dispatch::PacketDispatcher;
use crate::messaging::{
    ChannelMessageSender, ChannelMessenger, NetworkComponentType, ServiceEnvironment, ServiceInfo,
    StaticTopology,
};
use crate::network::{
    ChannelHandler, ClientError, NetworkChannel, NetworkClient, NetworkConfig, NetworkServer, ServerError,
};
use crate::protocol::{BufReadExt, BufWriteExt, CodecError, Packet, CHUNKED_TRANSFER_CHANNEL, IDENTITY_CHANNEL};

/// Node errors
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Peer {0} did not announce its identity")]
    NoIdentity(SocketAddr),
}

pub type NodeResult<T> = Result<T, NodeError>;

/// What a connected component announces about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentIdentity {
    Node(String),
    Service(ServiceInfo),
}

impl ComponentIdentity {
    pub fn name(&self) -> &str {
        match self {
            ComponentIdentity::Node(name) => name,
            ComponentIdentity::Service(info) => &info.name,
        }
    }

    /// Sender identity used on channel messages
    pub fn sender(&self) -> ChannelMessageSender {
        match self {
            ComponentIdentity::Node(name) => ChannelMessageSender::node(name.clone()),
            ComponentIdentity::Service(info) => ChannelMessageSender::service(info.name.clone()),
        }
    }

    pub fn kind(&self) -> NetworkComponentType {
        match self {
            ComponentIdentity::Node(_) => NetworkComponentType::Node,
            ComponentIdentity::Service(_) => NetworkComponentType::Service,
        }
    }

    pub fn to_packet(&self) -> Packet {
        let mut buf = BytesMut::new();
        match self {
            ComponentIdentity::Node(name) => {
                buf.put_u8(0);
                buf.put_string(name);
            }
            ComponentIdentity::Service(info) => {
                buf.put_u8(1);
                buf.put_string(&info.name);
                buf.put_string(&info.task);
                buf.put_var_u32(info.groups.len() as u32);
                for group in &info.groups {
                    buf.put_string(group);
                }
                buf.put_string(info.environment.name());
            }
        }
        Packet::prioritized(IDENTITY_CHANNEL, buf.freeze())
    }

    pub fn from_packet(packet: &Packet) -> Result<Self, CodecError> {
        let mut body: Bytes = packet.body().clone();
        let identity = match body.get_u8_checked()? {
            0 => ComponentIdentity::Node(body.get_string()?),
            1 => {
                let name = body.get_string()?;
                let task = body.get_string()?;
                let count = body.get_var_u32_checked()? as usize;
                if count > body.remaining() {
                    return Err(CodecError::Malformed("group count exceeds body"));
                }
                let groups = (0..count)
                    .map(|_| body.get_string())
                    .collect::<Result<Vec<_>, _>>()?;
                let environment = ServiceEnvironment::from_name(&body.get_string()?)
                    .ok_or(CodecError::Malformed("unknown service environment"))?;
                ComponentIdentity::Service(ServiceInfo {
                    name,
                    task,
                    groups,
                    environment,
                })
            }
            _ => return Err(CodecError::Malformed("unknown component type")),
        };
        if body.has_remaining() {
            return Err(CodecError::Malformed("trailing bytes after identity"));
        }
        Ok(identity)
    }
}

/// Announces the local identity and keeps the topology in sync with peers
struct NodeChannelHandler {
    identity: ComponentIdentity,
    topology: Arc<StaticTopology>,
    peers: DashMap<u64, ComponentIdentity>,
    peer_announced: Notify,
}

impl NodeChannelHandler {
    fn peer(&self, channel: &NetworkChannel) -> Option<ComponentIdentity> {
        self.peers.get(&channel.id()).map(|entry| entry.value().clone())
    }

    /// Wait until the peer behind `channel` announced itself
    async fn wait_for_peer(&self, channel: &NetworkChannel, timeout: Duration) -> Option<ComponentIdentity> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let announced = self.peer_announced.notified();
            tokio::pin!(announced);
            announced.as_mut().enable();

            if let Some(identity) = self.peer(channel) {
                return Some(identity);
            }
            if !channel.is_active() {
                return None;
            }
            if tokio::time::timeout_at(deadline, announced).await.is_err() {
                return self.peer(channel);
            }
        }
    }
}

#[async_trait]
impl ChannelHandler for NodeChannelHandler {
    async fn on_init(&self, channel: &NetworkChannel) {
        if let Err(e) = channel.send(self.identity.to_packet()).await {
            tracing::debug!(channel = channel.id(), error = %e, "identity not sent");
        }
    }

    async fn on_packet(&self, channel: &NetworkChannel, packet: &Packet) -> bool {
        if packet.channel() != IDENTITY_CHANNEL {
            return true;
        }

        match ComponentIdentity::from_packet(packet) {
            Ok(identity) => {
                tracing::info!(
                    channel = channel.id(),
                    remote = %channel.remote_addr(),
                    peer = %identity.name(),
                    kind = ?identity.kind(),
                    "peer identified"
                );
                match &identity {
                    ComponentIdentity::Node(name) => self.topology.register_node(name.clone(), channel.clone()),
                    ComponentIdentity::Service(info) => {
                        self.topology.register_service(info.clone(), channel.clone())
                    }
                }
                self.peers.insert(channel.id(), identity);
                self.peer_announced.notify_waiters();
            }
            Err(e) => {
                tracing::warn!(channel = channel.id(), remote = %channel.remote_addr(), error = %e, "invalid identity, closing");
                channel.close();
            }
        }
        false
    }

    async fn on_close(&self, channel: &NetworkChannel) {
        self.peers.remove(&channel.id());
        let removed = self.topology.unregister_channel(channel.id());
        if removed > 0 {
            tracing::debug!(channel = channel.id(), removed, "peer left topology");
        }
        self.peer_announced.notify_waiters();
    }
}

/// A running cluster member
pub struct Node {
    identity: ComponentIdentity,
    network: NetworkConfig,
    handler: Arc<NodeChannelHandler>,
    dispatcher: Arc<PacketDispatcher>,
    transfers: Arc<ChunkedTransferRegistry>,
    topology: Arc<StaticTopology>,
    messenger: Arc<ChannelMessenger>,
    server: NetworkServer,
    client: NetworkClient,
    reaper: Option<JoinHandle<()>>,
}

impl Node {
    /// Build a node from configuration without starting it
    pub fn new(config: &Config) -> NodeResult<Self> {
        Self::with_identity(config, ComponentIdentity::Node(config.general.node_name.clone()))
    }

    /// Build a cluster member announcing a custom identity
    pub fn with_identity(config: &Config, identity: ComponentIdentity) -> NodeResult<Self> {
        let network = config.network_config();
        let dispatcher = Arc::new(PacketDispatcher::new(network.dispatcher_workers));
        let topology = Arc::new(StaticTopology::new());

        let factory: Arc<dyn SinkFactory> = if config.transfer.use_temp_files {
            Arc::new(TempFileSinkFactory)
        } else {
            Arc::new(MemorySinkFactory)
        };
        let transfers = Arc::new(
            ChunkedTransferRegistry::new(factory, config.transfer.session_timeout())
                .with_max_transfer_size(config.transfer.max_transfer_size),
        );
        dispatcher.register(CHUNKED_TRANSFER_CHANNEL, transfers.clone());

        let messenger = Arc::new(
            ChannelMessenger::new(identity.sender(), topology.clone())
                .with_limits(config.transfer.max_message_size, config.transfer.chunk_size)
                .with_reply_timeout(network.query_timeout),
        );
        messenger.attach(&dispatcher, &transfers);

        let handler = Arc::new(NodeChannelHandler {
            identity: identity.clone(),
            topology: topology.clone(),
            peers: DashMap::new(),
            peer_announced: Notify::new(),
        });
        let server = NetworkServer::new(network.clone(), handler.clone(), dispatcher.clone());
        let client = NetworkClient::new(network.clone(), handler.clone(), dispatcher.clone())?;

        Ok(Self {
            identity,
            network,
            handler,
            dispatcher,
            transfers,
            topology,
            messenger,
            server,
            client,
            reaper: None,
        })
    }

    /// Start listening and the idle transfer reaper. Returns the bound address.
    pub async fn start(&mut self) -> NodeResult<SocketAddr> {
        let addr = self.server.start().await?;
        if self.reaper.is_none() {
            let interval = (self.transfers.session_timeout() / 4).max(Duration::from_millis(100));
            self.reaper = Some(self.transfers.spawn_reaper(interval));
        }
        tracing::info!(node = %self.identity.name(), addr = %addr, "node started");
        Ok(addr)
    }

    /// Connect to another member and wait for its identity
    pub async fn connect(&self, addr: SocketAddr) -> NodeResult<(NetworkChannel, ComponentIdentity)> {
        let channel = self.client.connect(addr).await?;
        self.identify(channel).await
    }

    pub async fn connect_hostname(&self, host: &str, port: u16) -> NodeResult<(NetworkChannel, ComponentIdentity)> {
        let channel = self.client.connect_hostname(host, port).await?;
        self.identify(channel).await
    }

    async fn identify(&self, channel: NetworkChannel) -> NodeResult<(NetworkChannel, ComponentIdentity)> {
        match self.handler.wait_for_peer(&channel, self.network.connect_timeout).await {
            Some(identity) => Ok((channel, identity)),
            None => {
                channel.close();
                Err(NodeError::NoIdentity(channel.remote_addr()))
            }
        }
    }

    /// Identity of the peer behind a channel, once announced
    pub fn peer(&self, channel: &NetworkChannel) -> Option<ComponentIdentity> {
        self.handler.peer(channel)
    }

    /// Stop listening and close every connection
    pub async fn stop(&mut self) {
        if let Err(e) = self.server.stop().await {
            tracing::debug!(error = %e, "server was not running");
        }
        self.client.close_all().await;
        if let Some(reaper) = self.reaper.take() {
            reaper.abort();
        }
        tracing::info!(node = %self.identity.name(), "node stopped");
    }

    pub fn identity(&self) -> &ComponentIdentity {
        &self.identity
    }

    pub fn messenger(&self) -> &Arc<ChannelMessenger> {
        &self.messenger
    }

    pub fn transfers(&self) -> &Arc<ChunkedTransferRegistry> {
        &self.transfers
    }

    pub fn dispatcher(&self) -> &Arc<PacketDispatcher> {
        &self.dispatcher
    }

    pub fn topology(&self) -> &Arc<StaticTopology> {
        &self.topology
    }

    /// Default timeout for queries
    pub fn query_timeout(&self) -> Duration {
        self.network.query_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{AssembledData, ChunkSessionInformation, ChunkedPacketSender, TransferCallback};
    use crate::messaging::{ChannelMessage, ChannelMessageListener, ChannelMessageTarget};
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc;

    fn config(name: &str) -> Config {
        let mut config = Config::default();
        config.general.node_name = name.to_string();
        config.network.port = 0;
        config.network.bind_address = Some("127.0.0.1".to_string());
        config.network.dispatcher_workers = 2;
        config.transfer.use_temp_files = false;
        config
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition reached in time");
    }

    struct Pong;

    #[async_trait]
    impl ChannelMessageListener for Pong {
        fn channel(&self) -> Option<&str> {
            Some("status")
        }

        async fn on_message(&self, message: &ChannelMessage) -> anyhow::Result<Option<Bytes>> {
            Ok((message.message() == "ping").then(|| Bytes::from_static(b"pong")))
        }
    }

    struct Store {
        tx: mpsc::UnboundedSender<(Bytes, Vec<u8>)>,
    }

    #[async_trait]
    impl TransferCallback for Store {
        async fn on_complete(&self, info: &ChunkSessionInformation, mut data: AssembledData) -> anyhow::Result<()> {
            let mut out = Vec::new();
            data.read_to_end(&mut out).await?;
            self.tx.send((info.extra_data.clone(), out))?;
            Ok(())
        }
    }

    #[test]
    fn test_service_identity_packet() {
        let identity = ComponentIdentity::Service(ServiceInfo {
            name: "Lobby-1".to_string(),
            task: "Lobby".to_string(),
            groups: vec!["Global".to_string(), "Lobbies".to_string()],
            environment: ServiceEnvironment::MinecraftServer,
        });
        let packet = identity.to_packet();
        assert!(packet.is_prioritized());
        assert_eq!(ComponentIdentity::from_packet(&packet).unwrap(), identity);
        assert_eq!(identity.sender(), ChannelMessageSender::service("Lobby-1"));
    }

    #[tokio::test]
    async fn test_nodes_identify_and_talk() {
        let mut node_1 = Node::new(&config("Node-1")).unwrap();
        let addr = node_1.start().await.unwrap();
        node_1.messenger().add_listener(Arc::new(Pong));
        let (tx, mut files) = mpsc::unbounded_channel();
        node_1.transfers().register_callback("deploy_file", Arc::new(Store { tx }));

        let node_2 = Node::new(&config("Node-2")).unwrap();
        let (channel, peer) = node_2.connect(addr).await.unwrap();
        assert_eq!(peer, ComponentIdentity::Node("Node-1".to_string()));
        assert_eq!(node_2.topology().node_names(), vec!["Node-1".to_string()]);

        let topology = node_1.topology().clone();
        eventually(|| topology.node_names() == vec!["Node-2".to_string()]).await;

        let query = node_2
            .messenger()
            .build(
                ChannelMessage::builder()
                    .channel("status")
                    .message("ping")
                    .target_node("Node-1"),
            )
            .unwrap();
        let reply = node_2
            .messenger()
            .send_single_query(&query, Duration::from_secs(5))
            .await
            .unwrap()
            .expect("Node-1 answers");
        assert_eq!(reply.content().as_ref(), b"pong");
        assert_eq!(reply.targets(), &[ChannelMessageTarget::node("Node-2")]);

        let file: Vec<u8> = (0..200_000u32).map(|i| (i % 241) as u8).collect();
        let summary = ChunkedPacketSender::for_channel("deploy_file")
            .chunk_size(16 * 1024)
            .extra_data(&b"lobby.jar"[..])
            .source(&file[..])
            .transfer(&[channel.clone()])
            .await
            .unwrap();
        assert_eq!(summary.chunks, 13);
        channel.flush(Duration::from_secs(5)).await.unwrap();

        let (name, data) = tokio::time::timeout(Duration::from_secs(5), files.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(name.as_ref(), b"lobby.jar");
        assert_eq!(data, file);

        node_1.stop().await;
        eventually(|| node_2.topology().node_names().is_empty()).await;
    }
}
