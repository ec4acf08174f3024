//! Protocol module - Defines the wire protocol for CloudNet communication
//!
//! Every packet travels inside a length-delimited frame:
//! - var-int frame length (LEB128, 0 = keepalive no-op)
//! - var-int transport channel id
//! - 1 byte prioritized flag
//! - 1 byte correlation flag, followed by a 16 byte id when set
//! - var-int body length
//! - body bytes

mod buf;
mod codec;
mod packet;

pub use buf::*;
pub use codec::*;
pub use packet::*;

/// Default port for node-to-node communication
pub const DEFAULT_PORT: u16 = 1410;

/// Largest frame a peer may declare (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Replies to queries. Only ever resolved against a pending slot.
pub const QUERY_RESPONSE_CHANNEL: u32 = 0;

/// Channel messages, both fire-and-forget and query requests.
pub const CHANNEL_MESSAGE_CHANNEL: u32 = 1;

/// Chunks of a chunked transfer session.
pub const CHUNKED_TRANSFER_CHANNEL: u32 = 2;

/// Liveness probes, answered by the network channel itself.
pub const KEEPALIVE_CHANNEL: u32 = 3;

/// Identity announcement sent by both sides right after connecting.
pub const IDENTITY_CHANNEL: u32 = 4;

/// Channel ids below this value are reserved for the substrate.
pub const FIRST_USER_CHANNEL: u32 = 64;

/// Check whether a transport channel id belongs to the reserved range
pub fn is_reserved_channel(channel: u32) -> bool {
    channel < FIRST_USER_CHANNEL
}
