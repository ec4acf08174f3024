//! Channel messaging - Addressed pub/sub envelope on top of packets
//!
//! Provides:
//! - `ChannelMessage` and its builder, which rejects messages without targets
//! - Target addressing (all, nodes, services, tasks, groups, environments)
//! - `ChannelMessenger` for fire-and-forget, single-query and multi-query sends

mod message;
mod messenger;
mod resolver;
mod target;

pub use message::*;
pub use messenger::*;
pub use resolver::*;
pub use target::*;

use thiserror::Error;

use crate::chunk::TransferError;
use crate::network::ChannelError;
use crate::protocol::CodecError;

/// Transfer channel name used for channel messages too large for one packet
pub const CHANNEL_MESSAGE_TRANSFER: &str = "channel_message";

/// Messaging errors
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Channel message has no targets")]
    NoTargets,

    #[error("Channel message too large for a query: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("Content error: {0}")]
    Content(#[from] bincode::Error),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),
}

pub type MessageResult<T> = Result<T, MessageError>;
