//! Message addressing

use bytes::{Buf, BufMut};
use std::fmt;

use crate::protocol::{BufReadExt, BufWriteExt, CodecError};

/// Platform a service runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceEnvironment {
    MinecraftServer,
    Glowstone,
    Nukkit,
    Bungeecord,
    Velocity,
    WaterdogPe,
}

impl ServiceEnvironment {
    /// Stable wire name
    pub fn name(&self) -> &'static str {
        match self {
            ServiceEnvironment::MinecraftServer => "MINECRAFT_SERVER",
            ServiceEnvironment::Glowstone => "GLOWSTONE",
            ServiceEnvironment::Nukkit => "NUKKIT",
            ServiceEnvironment::Bungeecord => "BUNGEECORD",
            ServiceEnvironment::Velocity => "VELOCITY",
            ServiceEnvironment::WaterdogPe => "WATERDOG_PE",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "MINECRAFT_SERVER" => Some(ServiceEnvironment::MinecraftServer),
            "GLOWSTONE" => Some(ServiceEnvironment::Glowstone),
            "NUKKIT" => Some(ServiceEnvironment::Nukkit),
            "BUNGEECORD" => Some(ServiceEnvironment::Bungeecord),
            "VELOCITY" => Some(ServiceEnvironment::Velocity),
            "WATERDOG_PE" => Some(ServiceEnvironment::WaterdogPe),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Addressing rule selecting zero or more recipients.
///
/// A present name narrows a node or service target to exactly one entity,
/// an absent name selects every entity of that kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelMessageTarget {
    All,
    Node(Option<String>),
    Service(Option<String>),
    Task(String),
    Group(String),
    Environment(ServiceEnvironment),
}

impl ChannelMessageTarget {
    pub const ALL: ChannelMessageTarget = ChannelMessageTarget::All;
    pub const ALL_NODES: ChannelMessageTarget = ChannelMessageTarget::Node(None);
    pub const ALL_SERVICES: ChannelMessageTarget = ChannelMessageTarget::Service(None);

    pub fn node(name: impl Into<String>) -> Self {
        ChannelMessageTarget::Node(Some(name.into()))
    }

    pub fn service(name: impl Into<String>) -> Self {
        ChannelMessageTarget::Service(Some(name.into()))
    }

    /// Whether this target selects more than one entity by construction
    pub fn is_broadcast(&self) -> bool {
        matches!(
            self,
            ChannelMessageTarget::All | ChannelMessageTarget::Node(None) | ChannelMessageTarget::Service(None)
        )
    }

    fn kind(&self) -> u8 {
        match self {
            ChannelMessageTarget::All => 0,
            ChannelMessageTarget::Node(_) => 1,
            ChannelMessageTarget::Service(_) => 2,
            ChannelMessageTarget::Task(_) => 3,
            ChannelMessageTarget::Group(_) => 4,
            ChannelMessageTarget::Environment(_) => 5,
        }
    }

    pub(crate) fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind());
        match self {
            ChannelMessageTarget::All => {}
            ChannelMessageTarget::Node(name) | ChannelMessageTarget::Service(name) => match name {
                Some(name) => {
                    buf.put_bool(true);
                    buf.put_string(name);
                }
                None => buf.put_bool(false),
            },
            ChannelMessageTarget::Task(name) | ChannelMessageTarget::Group(name) => buf.put_string(name),
            ChannelMessageTarget::Environment(env) => buf.put_string(env.name()),
        }
    }

    pub(crate) fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        let target = match buf.get_u8_checked()? {
            0 => ChannelMessageTarget::All,
            1 => ChannelMessageTarget::Node(decode_optional_name(buf)?),
            2 => ChannelMessageTarget::Service(decode_optional_name(buf)?),
            3 => ChannelMessageTarget::Task(buf.get_string()?),
            4 => ChannelMessageTarget::Group(buf.get_string()?),
            5 => {
                let name = buf.get_string()?;
                let env = ServiceEnvironment::from_name(&name)
                    .ok_or(CodecError::Malformed("unknown service environment"))?;
                ChannelMessageTarget::Environment(env)
            }
            _ => return Err(CodecError::Malformed("unknown target kind")),
        };
        Ok(target)
    }
}

fn decode_optional_name(buf: &mut impl Buf) -> Result<Option<String>, CodecError> {
    if buf.get_bool_checked()? {
        Ok(Some(buf.get_string()?))
    } else {
        Ok(None)
    }
}

impl fmt::Display for ChannelMessageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelMessageTarget::All => write!(f, "all"),
            ChannelMessageTarget::Node(None) => write!(f, "node:*"),
            ChannelMessageTarget::Node(Some(name)) => write!(f, "node:{}", name),
            ChannelMessageTarget::Service(None) => write!(f, "service:*"),
            ChannelMessageTarget::Service(Some(name)) => write!(f, "service:{}", name),
            ChannelMessageTarget::Task(name) => write!(f, "task:{}", name),
            ChannelMessageTarget::Group(name) => write!(f, "group:{}", name),
            ChannelMessageTarget::Environment(env) => write!(f, "environment:{}", env),
        }
    }
}

impl std::str::FromStr for ChannelMessageTarget {
    type Err = String;

    /// Parse the `kind[:name]` form produced by `Display`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = match s.split_once(':') {
            Some((kind, name)) => (kind, Some(name)),
            None => (s, None),
        };
        let name = name.filter(|n| !n.is_empty() && *n != "*");

        match (kind.to_ascii_lowercase().as_str(), name) {
            ("all", None) => Ok(ChannelMessageTarget::All),
            ("node", name) => Ok(ChannelMessageTarget::Node(name.map(str::to_string))),
            ("service", name) => Ok(ChannelMessageTarget::Service(name.map(str::to_string))),
            ("task", Some(name)) => Ok(ChannelMessageTarget::Task(name.to_string())),
            ("group", Some(name)) => Ok(ChannelMessageTarget::Group(name.to_string())),
            ("environment", Some(name)) => ServiceEnvironment::from_name(name)
                .map(ChannelMessageTarget::Environment)
                .ok_or_else(|| format!("unknown environment: {}", name)),
            _ => Err(format!("invalid target: {}", s)),
        }
    }
}
