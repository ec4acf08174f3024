//! Channel lifecycle capability

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::NetworkChannel;
use crate::protocol::Packet;

/// Lifecycle hooks of one network channel.
///
/// Client and server transports each provide their own implementation.
/// A single instance may serve many channels.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    /// Called once the channel is ready, before any packet is read
    async fn on_init(&self, _channel: &NetworkChannel) {}

    /// Called for every inbound packet that is not a correlated reply.
    ///
    /// Returning `false` means the packet was fully handled and must not be
    /// routed to the dispatcher.
    async fn on_packet(&self, _channel: &NetworkChannel, _packet: &Packet) -> bool {
        true
    }

    /// Called exactly once after the channel closed and its queries were failed
    async fn on_close(&self, _channel: &NetworkChannel) {}
}

/// Keeps a registry of live channels up to date around another handler
pub(crate) struct TrackingHandler {
    inner: Arc<dyn ChannelHandler>,
    channels: Arc<RwLock<HashMap<u64, NetworkChannel>>>,
}

impl TrackingHandler {
    pub(crate) fn new(
        inner: Arc<dyn ChannelHandler>,
        channels: Arc<RwLock<HashMap<u64, NetworkChannel>>>,
    ) -> Self {
        Self { inner, channels }
    }
}

#[async_trait]
impl ChannelHandler for TrackingHandler {
    async fn on_init(&self, channel: &NetworkChannel) {
        self.channels
            .write()
            .await
            .insert(channel.id(), channel.clone());
        self.inner.on_init(channel).await;
    }

    async fn on_packet(&self, channel: &NetworkChannel, packet: &Packet) -> bool {
        self.inner.on_packet(channel, packet).await
    }

    async fn on_close(&self, channel: &NetworkChannel) {
        self.channels.write().await.remove(&channel.id());
        self.inner.on_close(channel).await;
    }
}
