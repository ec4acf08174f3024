//! Sending and receiving channel messages

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::AsyncReadExt;

use super::{
    resolve_targets, ChannelMessage, ChannelMessageSender, ChannelMessageTarget, MessageError,
    MessageResult, NetworkComponentType, TargetResolver, CHANNEL_MESSAGE_TRANSFER,
};
use crate::chunk::{
    AssembledData, ChunkSessionInformation, ChunkedPacketSender, ChunkedTransferRegistry,
    TransferCallback, DEFAULT_CHUNK_SIZE,
};
use crate::dispatch::{PacketDispatcher, PacketListener};
use crate::network::NetworkChannel;
use crate::protocol::{Packet, CHANNEL_MESSAGE_CHANNEL};

/// Default largest encoded message sent in a single packet
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default time local listeners get to answer an inbound query
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Subscriber for inbound channel messages
#[async_trait]
pub trait ChannelMessageListener: Send + Sync {
    /// Channel name this listener wants, `None` for every channel
    fn channel(&self) -> Option<&str> {
        None
    }

    /// Handle a message. Returned content answers the message if it was a query.
    async fn on_message(&self, message: &ChannelMessage) -> anyhow::Result<Option<Bytes>>;
}

/// Sends messages to resolved targets and delivers inbound ones to listeners
pub struct ChannelMessenger {
    sender: ChannelMessageSender,
    resolver: Arc<dyn TargetResolver>,
    listeners: RwLock<Vec<Arc<dyn ChannelMessageListener>>>,
    max_message_size: usize,
    chunk_size: u32,
    reply_timeout: Duration,
}

impl ChannelMessenger {
    pub fn new(sender: ChannelMessageSender, resolver: Arc<dyn TargetResolver>) -> Self {
        Self {
            sender,
            resolver,
            listeners: RwLock::new(Vec::new()),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    /// Messages encoding larger than `max_message_size` travel as chunked transfers
    pub fn with_limits(mut self, max_message_size: usize, chunk_size: u32) -> Self {
        self.max_message_size = max_message_size;
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Inbound queries whose listeners take longer get an empty reply
    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    /// Identity stamped on messages built by this messenger
    pub fn sender(&self) -> &ChannelMessageSender {
        &self.sender
    }

    /// Build a message with this messenger's identity as default sender
    pub fn build(&self, builder: super::ChannelMessageBuilder) -> MessageResult<ChannelMessage> {
        builder.build(self.sender.clone())
    }

    pub fn add_listener(&self, listener: Arc<dyn ChannelMessageListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Register for channel message packets and oversized message transfers
    pub fn attach(self: &Arc<Self>, dispatcher: &PacketDispatcher, transfers: &ChunkedTransferRegistry) {
        dispatcher.register(CHANNEL_MESSAGE_CHANNEL, self.clone());
        transfers.register_callback(CHANNEL_MESSAGE_TRANSFER, self.clone());
    }

    /// Send a message without waiting for replies.
    ///
    /// Returns the number of destinations the message was handed to, the
    /// local listeners counting as one.
    pub async fn send(&self, message: &ChannelMessage) -> MessageResult<usize> {
        let channels = resolve_targets(self.resolver.as_ref(), message.targets());
        let mut delivered = 0;

        if self.is_local_target(message) {
            self.deliver_local(message).await;
            delivered += 1;
        }
        if channels.is_empty() {
            tracing::debug!(channel = %message.channel(), message = %message.message(), "no remote destination for message");
            return Ok(delivered);
        }

        let body = message.encode();
        if body.len() > self.max_message_size {
            tracing::debug!(
                channel = %message.channel(),
                size = body.len(),
                destinations = channels.len(),
                "sending oversized message as chunked transfer"
            );
            ChunkedPacketSender::for_channel(CHANNEL_MESSAGE_TRANSFER)
                .chunk_size(self.chunk_size)
                .source(std::io::Cursor::new(body))
                .transfer(&channels)
                .await?;
            return Ok(delivered + channels.len());
        }

        let packet = Packet::new(CHANNEL_MESSAGE_CHANNEL, body).with_priority(message.is_prioritized());
        for channel in &channels {
            match channel.send(packet.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::debug!(
                    remote = %channel.remote_addr(),
                    channel = %message.channel(),
                    error = %e,
                    "message not sent"
                ),
            }
        }
        Ok(delivered)
    }

    /// Send a query and return the first reply from any destination.
    ///
    /// Returns `None` if nobody answered before the timeout.
    pub async fn send_single_query(
        &self,
        message: &ChannelMessage,
        timeout: Duration,
    ) -> MessageResult<Option<ChannelMessage>> {
        let packet = self.query_packet(message)?;
        let deadline = tokio::time::Instant::now() + timeout;
        let channels = resolve_targets(self.resolver.as_ref(), message.targets());
        let mut replies = self.query_replies(message, packet, &channels, timeout);

        loop {
            match tokio::time::timeout_at(deadline, replies.next()).await {
                // Dropping the other queries discards their late replies
                Ok(Some(Some(reply))) => return Ok(Some(reply)),
                Ok(Some(None)) => {}
                Ok(None) => return Ok(None),
                Err(_) => {
                    tracing::debug!(channel = %message.channel(), "single query timed out");
                    return Ok(None);
                }
            }
        }
    }

    /// Send a query and collect the replies that arrive before the timeout
    pub async fn send_query(&self, message: &ChannelMessage, timeout: Duration) -> MessageResult<Vec<ChannelMessage>> {
        let packet = self.query_packet(message)?;
        let deadline = tokio::time::Instant::now() + timeout;
        let channels = resolve_targets(self.resolver.as_ref(), message.targets());
        let mut pending = self.query_replies(message, packet, &channels, timeout);

        let mut replies = Vec::new();
        while let Ok(Some(reply)) = tokio::time::timeout_at(deadline, pending.next()).await {
            replies.extend(reply);
        }
        tracing::trace!(
            channel = %message.channel(),
            destinations = channels.len(),
            replies = replies.len(),
            "query finished"
        );
        Ok(replies)
    }

    /// Local listeners and remote destinations of one query, each resolving to its reply
    fn query_replies<'a>(
        &'a self,
        message: &'a ChannelMessage,
        packet: Packet,
        channels: &'a [NetworkChannel],
        timeout: Duration,
    ) -> FuturesUnordered<BoxFuture<'a, Option<ChannelMessage>>> {
        let replies = FuturesUnordered::new();
        if self.is_local_target(message) {
            replies.push(
                async move {
                    let Some(content) = self.deliver_local(message).await else {
                        return None;
                    };
                    match self.local_response(message, content) {
                        Ok(reply) => Some(reply),
                        Err(e) => {
                            tracing::warn!(channel = %message.channel(), error = %e, "local reply dropped");
                            None
                        }
                    }
                }
                .boxed(),
            );
        }
        for channel in channels {
            let packet = packet.clone();
            replies.push(async move { decode_reply(channel.send_query(packet, timeout).await) }.boxed());
        }
        replies
    }

    fn query_packet(&self, message: &ChannelMessage) -> MessageResult<Packet> {
        let body = message.encode();
        if body.len() > self.max_message_size {
            return Err(MessageError::TooLarge {
                size: body.len(),
                max: self.max_message_size,
            });
        }
        Ok(Packet::new(CHANNEL_MESSAGE_CHANNEL, body).with_priority(message.is_prioritized()))
    }

    fn local_response(&self, request: &ChannelMessage, content: Bytes) -> MessageResult<ChannelMessage> {
        ChannelMessage::build_response_for(request, self.sender.clone())
            .content(content)
            .build(self.sender.clone())
    }

    /// Whether any target selects this messenger's own component
    fn is_local_target(&self, message: &ChannelMessage) -> bool {
        message.targets().iter().any(|target| match (target, self.sender.kind) {
            (ChannelMessageTarget::All, _) => true,
            (ChannelMessageTarget::Node(None), NetworkComponentType::Node) => true,
            (ChannelMessageTarget::Node(Some(name)), NetworkComponentType::Node)
            | (ChannelMessageTarget::Service(Some(name)), NetworkComponentType::Service) => {
                name.eq_ignore_ascii_case(&self.sender.name)
            }
            (ChannelMessageTarget::Service(None), NetworkComponentType::Service) => true,
            _ => false,
        })
    }

    /// Hand a message to every matching listener and return the first reply
    async fn deliver_local(&self, message: &ChannelMessage) -> Option<Bytes> {
        let listeners: Vec<_> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|listener| listener.channel().map_or(true, |channel| channel == message.channel()))
            .cloned()
            .collect();

        let mut reply = None;
        for listener in listeners {
            match listener.on_message(message).await {
                Ok(Some(content)) if reply.is_none() => reply = Some(content),
                Ok(_) => {}
                Err(e) => tracing::warn!(
                    channel = %message.channel(),
                    message = %message.message(),
                    sender = %message.sender(),
                    error = %e,
                    "message listener failed"
                ),
            }
        }
        reply
    }
}

/// Turn a query result into a reply message; empty bodies mean "no reply"
fn decode_reply(result: crate::network::ChannelResult<Packet>) -> Option<ChannelMessage> {
    match result {
        Ok(reply) if reply.is_empty() => None,
        Ok(reply) => match ChannelMessage::from_packet(&reply) {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::warn!(error = %e, "malformed query reply");
                None
            }
        },
        Err(e) => {
            tracing::debug!(error = %e, "query destination did not answer");
            None
        }
    }
}

#[async_trait]
impl PacketListener for ChannelMessenger {
    async fn handle(&self, channel: &NetworkChannel, packet: &Packet) -> anyhow::Result<()> {
        let message = match ChannelMessage::from_packet(packet) {
            Ok(message) => message,
            Err(e) => {
                // Release a remote waiter before reporting the bad packet
                if packet.correlation_id().is_some() {
                    channel.send(Packet::empty_response_to(packet)).await?;
                }
                return Err(e.into());
            }
        };

        if packet.correlation_id().is_none() {
            self.deliver_local(&message).await;
            return Ok(());
        }

        let reply = match tokio::time::timeout(self.reply_timeout, self.deliver_local(&message)).await {
            Ok(reply) => reply,
            Err(_) => {
                tracing::debug!(
                    channel = %message.channel(),
                    sender = %message.sender(),
                    timeout = ?self.reply_timeout,
                    "listeners too slow, answering query without reply"
                );
                None
            }
        };
        let body = match reply {
            Some(content) => self.local_response(&message, content)?.encode(),
            None => Bytes::new(),
        };
        channel.send(Packet::response_to(packet, body)).await?;
        Ok(())
    }
}

#[async_trait]
impl TransferCallback for ChannelMessenger {
    async fn on_complete(&self, info: &ChunkSessionInformation, mut data: AssembledData) -> anyhow::Result<()> {
        let mut body = Vec::new();
        data.read_to_end(&mut body).await?;
        let message = ChannelMessage::decode(Bytes::from(body), false)?;
        tracing::debug!(
            session = %info.session_id,
            channel = %message.channel(),
            "received oversized message"
        );
        self.deliver_local(&message).await;
        Ok(())
    }
}
