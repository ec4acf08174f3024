//! Channel message envelope

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;

use super::{ChannelMessageTarget, MessageError, MessageResult, ServiceEnvironment};
use crate::protocol::{BufReadExt, BufWriteExt, CodecError, Packet, CHANNEL_MESSAGE_CHANNEL};

/// Kind of component that sent a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkComponentType {
    Node,
    Service,
}

impl NetworkComponentType {
    fn to_byte(self) -> u8 {
        match self {
            NetworkComponentType::Node => 0,
            NetworkComponentType::Service => 1,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, CodecError> {
        match byte {
            0 => Ok(NetworkComponentType::Node),
            1 => Ok(NetworkComponentType::Service),
            _ => Err(CodecError::Malformed("unknown component type")),
        }
    }
}

/// Identity of a message sender
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelMessageSender {
    pub name: String,
    pub kind: NetworkComponentType,
}

impl ChannelMessageSender {
    pub fn node(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NetworkComponentType::Node,
        }
    }

    pub fn service(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NetworkComponentType::Service,
        }
    }

    /// Target addressing exactly this sender
    pub fn to_target(&self) -> ChannelMessageTarget {
        match self.kind {
            NetworkComponentType::Node => ChannelMessageTarget::node(self.name.clone()),
            NetworkComponentType::Service => ChannelMessageTarget::service(self.name.clone()),
        }
    }
}

impl fmt::Display for ChannelMessageSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            NetworkComponentType::Node => write!(f, "node:{}", self.name),
            NetworkComponentType::Service => write!(f, "service:{}", self.name),
        }
    }
}

/// Addressed application message.
///
/// Always carries at least one target; the builder refuses to create one
/// without.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    sender: ChannelMessageSender,
    channel: String,
    message: String,
    content: Bytes,
    targets: Vec<ChannelMessageTarget>,
    prioritized: bool,
}

impl ChannelMessage {
    pub fn builder() -> ChannelMessageBuilder {
        ChannelMessageBuilder::default()
    }

    /// Create the direct reply to a request, addressed back to its sender
    pub fn build_response_for(request: &ChannelMessage, sender: ChannelMessageSender) -> ChannelMessageBuilder {
        ChannelMessageBuilder {
            targets: vec![request.sender.to_target()],
            prioritized: request.prioritized,
            sender: Some(sender),
            ..ChannelMessageBuilder::default()
        }
    }

    pub fn sender(&self) -> &ChannelMessageSender {
        &self.sender
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn targets(&self) -> &[ChannelMessageTarget] {
        &self.targets
    }

    pub fn is_prioritized(&self) -> bool {
        self.prioritized
    }

    /// Whether this is a direct reply rather than an application broadcast
    pub fn is_response(&self) -> bool {
        self.channel.is_empty()
    }

    /// Decode bincode content into a value
    pub fn content_as<T: DeserializeOwned>(&self) -> MessageResult<T> {
        Ok(bincode::deserialize(&self.content)?)
    }

    /// Encoded size of this message inside a packet body
    pub fn encoded_len(&self) -> usize {
        self.encode().len()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            self.sender.name.len() + self.channel.len() + self.message.len() + self.content.len() + 32,
        );
        buf.put_string(&self.sender.name);
        buf.put_u8(self.sender.kind.to_byte());
        buf.put_string(&self.channel);
        buf.put_string(&self.message);
        buf.put_var_u32(self.targets.len() as u32);
        for target in &self.targets {
            target.encode(&mut buf);
        }
        buf.put_byte_array(&self.content);
        buf.freeze()
    }

    pub fn decode(mut body: Bytes, prioritized: bool) -> Result<Self, CodecError> {
        let name = body.get_string()?;
        let kind = NetworkComponentType::from_byte(body.get_u8_checked()?)?;
        let channel = body.get_string()?;
        let message = body.get_string()?;

        let count = body.get_var_u32_checked()? as usize;
        // Every target takes at least one byte
        if count > body.len() {
            return Err(CodecError::Malformed("target count exceeds body"));
        }
        let mut targets = Vec::with_capacity(count);
        for _ in 0..count {
            targets.push(ChannelMessageTarget::decode(&mut body)?);
        }
        if targets.is_empty() {
            return Err(CodecError::Malformed("channel message without targets"));
        }

        let content = body.get_byte_array()?;
        if !body.is_empty() {
            return Err(CodecError::Malformed("trailing bytes after channel message"));
        }

        Ok(Self {
            sender: ChannelMessageSender { name, kind },
            channel,
            message,
            content,
            targets,
            prioritized,
        })
    }

    /// Wrap into a packet on the channel message transport channel
    pub fn to_packet(&self) -> Packet {
        Packet::new(CHANNEL_MESSAGE_CHANNEL, self.encode()).with_priority(self.prioritized)
    }

    pub fn from_packet(packet: &Packet) -> Result<Self, CodecError> {
        Self::decode(packet.body().clone(), packet.is_prioritized())
    }
}

/// Builder for [`ChannelMessage`]
#[derive(Debug, Default, Clone)]
pub struct ChannelMessageBuilder {
    sender: Option<ChannelMessageSender>,
    channel: String,
    message: String,
    content: Bytes,
    targets: Vec<ChannelMessageTarget>,
    prioritized: bool,
}

impl ChannelMessageBuilder {
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn content(mut self, content: impl Into<Bytes>) -> Self {
        self.content = content.into();
        self
    }

    /// Serialize a value as the content
    pub fn content_object<T: Serialize + ?Sized>(mut self, value: &T) -> MessageResult<Self> {
        self.content = Bytes::from(bincode::serialize(value)?);
        Ok(self)
    }

    pub fn prioritized(mut self, prioritized: bool) -> Self {
        self.prioritized = prioritized;
        self
    }

    pub fn sender(mut self, sender: ChannelMessageSender) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn target(mut self, target: ChannelMessageTarget) -> Self {
        if !self.targets.contains(&target) {
            self.targets.push(target);
        }
        self
    }

    pub fn targets(self, targets: impl IntoIterator<Item = ChannelMessageTarget>) -> Self {
        targets.into_iter().fold(self, Self::target)
    }

    pub fn target_all(self) -> Self {
        self.target(ChannelMessageTarget::ALL)
    }

    pub fn target_nodes(self) -> Self {
        self.target(ChannelMessageTarget::ALL_NODES)
    }

    pub fn target_node(self, name: impl Into<String>) -> Self {
        self.target(ChannelMessageTarget::node(name))
    }

    pub fn target_services(self) -> Self {
        self.target(ChannelMessageTarget::ALL_SERVICES)
    }

    pub fn target_service(self, name: impl Into<String>) -> Self {
        self.target(ChannelMessageTarget::service(name))
    }

    pub fn target_task(self, task: impl Into<String>) -> Self {
        self.target(ChannelMessageTarget::Task(task.into()))
    }

    pub fn target_group(self, group: impl Into<String>) -> Self {
        self.target(ChannelMessageTarget::Group(group.into()))
    }

    pub fn target_environment(self, environment: ServiceEnvironment) -> Self {
        self.target(ChannelMessageTarget::Environment(environment))
    }

    /// Finish the message.
    ///
    /// `default_sender` is used unless a sender was set explicitly.
    pub fn build(self, default_sender: ChannelMessageSender) -> MessageResult<ChannelMessage> {
        if self.targets.is_empty() {
            return Err(MessageError::NoTargets);
        }

        Ok(ChannelMessage {
            sender: self.sender.unwrap_or(default_sender),
            channel: self.channel,
            message: self.message,
            content: self.content,
            targets: self.targets,
            prioritized: self.prioritized,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Deploy {
        path: String,
        overwrite: bool,
    }

    fn node() -> ChannelMessageSender {
        ChannelMessageSender::node("Node-1")
    }

    #[test]
    fn test_build_requires_targets() {
        let result = ChannelMessage::builder()
            .channel("cloud")
            .message("stop")
            .build(node());
        assert!(matches!(result, Err(MessageError::NoTargets)));

        let message = ChannelMessage::builder().target_all().build(node()).unwrap();
        assert_eq!(message.targets(), &[ChannelMessageTarget::ALL]);
    }

    #[test]
    fn test_duplicate_targets_collapse() {
        let message = ChannelMessage::builder()
            .target_node("Node-2")
            .target_node("Node-2")
            .target_services()
            .build(node())
            .unwrap();
        assert_eq!(message.targets().len(), 2);
    }

    #[test]
    fn test_packet_round_trip() {
        let message = ChannelMessage::builder()
            .channel("deploy")
            .message("template")
            .content_object(&Deploy {
                path: "templates/Lobby/default".to_string(),
                overwrite: true,
            })
            .unwrap()
            .target_task("Lobby")
            .target_environment(ServiceEnvironment::MinecraftServer)
            .prioritized(true)
            .build(ChannelMessageSender::service("Lobby-1"))
            .unwrap();

        let packet = message.to_packet();
        assert_eq!(packet.channel(), CHANNEL_MESSAGE_CHANNEL);
        assert!(packet.is_prioritized());

        let decoded = ChannelMessage::from_packet(&packet).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(
            decoded.content_as::<Deploy>().unwrap(),
            Deploy {
                path: "templates/Lobby/default".to_string(),
                overwrite: true,
            }
        );
    }

    #[test]
    fn test_response_addressed_to_sender() {
        let request = ChannelMessage::builder()
            .channel("status")
            .message("ping")
            .target_nodes()
            .build(ChannelMessageSender::service("Proxy-1"))
            .unwrap();

        let response = ChannelMessage::build_response_for(&request, node())
            .content(&b"pong"[..])
            .build(ChannelMessageSender::node("ignored"))
            .unwrap();

        assert!(response.is_response());
        assert_eq!(response.sender(), &node());
        assert_eq!(response.targets(), &[ChannelMessageTarget::service("Proxy-1")]);
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let message = ChannelMessage::builder().target_all().build(node()).unwrap();
        let mut body = BytesMut::from(&message.encode()[..]);
        body.extend_from_slice(&[0]);
        assert!(ChannelMessage::decode(body.freeze(), false).is_err());
    }
}
