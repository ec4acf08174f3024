//! Chunked transfer - Moves payloads too large for one packet
//!
//! A sender splits a byte stream into fixed-size chunks plus exactly one
//! final chunk that declares the total chunk count. The receiver writes every
//! chunk at `index * chunk_size` into a random-access sink, so chunks may
//! arrive in any order and on any dispatcher worker.

mod handler;
mod registry;
mod sender;
mod sink;

pub use handler::*;
pub use registry::*;
pub use sender::*;
pub use sink::*;

use bytes::{Bytes, BytesMut};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::network::ChannelError;
use crate::protocol::{BufReadExt, BufWriteExt, CodecError, Packet, CHUNKED_TRANSFER_CHANNEL};

/// Default chunk size in bytes
pub const DEFAULT_CHUNK_SIZE: u32 = 50 * 1024;

/// Default upper bound on the reassembled size of one session
pub const DEFAULT_MAX_TRANSFER_SIZE: u64 = 1024 * 1024 * 1024;

/// Transfer errors
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transfer session {0} failed")]
    Failed(Uuid),

    #[error("Invalid chunk: {0}")]
    InvalidChunk(&'static str),

    #[error("Timed out waiting for transfer session {0}")]
    Timeout(Uuid),

    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

impl TransferError {
    /// Whether a new session with the same data can succeed.
    ///
    /// The failed session itself is never resumed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Io(_) | TransferError::Failed(_) | TransferError::Timeout(_) => true,
            TransferError::Channel(e) => e.is_retryable(),
            TransferError::InvalidChunk(_) | TransferError::Codec(_) => false,
        }
    }
}

pub type TransferResult<T> = Result<T, TransferError>;

/// State of one transfer session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Running,
    Success,
    Failure,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferStatus::Running)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Running => write!(f, "RUNNING"),
            TransferStatus::Success => write!(f, "SUCCESS"),
            TransferStatus::Failure => write!(f, "FAILURE"),
        }
    }
}

/// Session data repeated in every chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSessionInformation {
    pub session_id: Uuid,
    pub chunk_size: u32,
    /// Consumer of the transfer, e.g. `deploy_file`
    pub transfer_channel: String,
    /// Consumer defined metadata
    pub extra_data: Bytes,
}

/// Trailer of the final chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalChunk {
    /// Number of chunks in the session, this one included
    pub total_chunks: u32,
    /// Data bytes carried by the final chunk
    pub remaining_bytes: u32,
}

/// One chunk on the wire
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPacket {
    pub session: ChunkSessionInformation,
    pub index: u32,
    pub terminal: Option<FinalChunk>,
    pub data: Bytes,
}

impl ChunkPacket {
    pub fn is_final(&self) -> bool {
        self.terminal.is_some()
    }

    pub fn to_packet(&self) -> Packet {
        let info = &self.session;
        let mut buf = BytesMut::with_capacity(
            self.data.len() + info.transfer_channel.len() + info.extra_data.len() + 48,
        );
        buf.put_uuid(&info.session_id);
        buf.put_var_u32(info.chunk_size);
        buf.put_string(&info.transfer_channel);
        buf.put_byte_array(&info.extra_data);
        buf.put_var_u32(self.index);
        buf.put_bool(self.terminal.is_some());
        if let Some(terminal) = &self.terminal {
            buf.put_var_u32(terminal.total_chunks);
            buf.put_var_u32(terminal.remaining_bytes);
        }
        buf.put_byte_array(&self.data);
        Packet::new(CHUNKED_TRANSFER_CHANNEL, buf.freeze())
    }

    pub fn from_packet(packet: &Packet) -> Result<Self, CodecError> {
        let mut body = packet.body().clone();
        let session = ChunkSessionInformation {
            session_id: body.get_uuid_checked()?,
            chunk_size: body.get_var_u32_checked()?,
            transfer_channel: body.get_string()?,
            extra_data: body.get_byte_array()?,
        };
        let index = body.get_var_u32_checked()?;
        let terminal = if body.get_bool_checked()? {
            Some(FinalChunk {
                total_chunks: body.get_var_u32_checked()?,
                remaining_bytes: body.get_var_u32_checked()?,
            })
        } else {
            None
        };
        let data = body.get_byte_array()?;
        if !body.is_empty() {
            return Err(CodecError::Malformed("trailing bytes after chunk"));
        }

        Ok(Self {
            session,
            index,
            terminal,
            data,
        })
    }

    /// Check the chunk against its own session information
    pub fn validate(&self) -> TransferResult<()> {
        if self.session.chunk_size == 0 {
            return Err(TransferError::InvalidChunk("zero chunk size"));
        }
        match &self.terminal {
            None if self.data.len() != self.session.chunk_size as usize => {
                Err(TransferError::InvalidChunk("intermediate chunk is not full"))
            }
            Some(terminal) if terminal.total_chunks != self.index + 1 => {
                Err(TransferError::InvalidChunk("final chunk count does not match its index"))
            }
            Some(terminal) if terminal.remaining_bytes as usize != self.data.len() => {
                Err(TransferError::InvalidChunk("final chunk length does not match"))
            }
            Some(_) if self.data.len() >= self.session.chunk_size as usize => {
                Err(TransferError::InvalidChunk("final chunk is not short"))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> ChunkSessionInformation {
        ChunkSessionInformation {
            session_id: Uuid::new_v4(),
            chunk_size: 4,
            transfer_channel: "deploy_file".to_string(),
            extra_data: Bytes::from_static(b"local/templates/Lobby"),
        }
    }

    #[test]
    fn test_chunk_packet_layout() {
        let chunk = ChunkPacket {
            session: info(),
            index: 3,
            terminal: Some(FinalChunk {
                total_chunks: 4,
                remaining_bytes: 2,
            }),
            data: Bytes::from_static(b"ok"),
        };

        let packet = chunk.to_packet();
        assert_eq!(packet.channel(), CHUNKED_TRANSFER_CHANNEL);
        assert!(packet.correlation_id().is_none());
        assert_eq!(ChunkPacket::from_packet(&packet).unwrap(), chunk);
        assert!(chunk.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        let mut chunk = ChunkPacket {
            session: info(),
            index: 0,
            terminal: None,
            data: Bytes::from_static(b"abc"),
        };
        assert!(chunk.validate().is_err());

        chunk.data = Bytes::from_static(b"abcd");
        assert!(chunk.validate().is_ok());

        chunk.terminal = Some(FinalChunk {
            total_chunks: 1,
            remaining_bytes: 4,
        });
        assert!(chunk.validate().is_err());

        chunk.data = Bytes::new();
        chunk.terminal = Some(FinalChunk {
            total_chunks: 1,
            remaining_bytes: 0,
        });
        assert!(chunk.validate().is_ok());
    }

    #[test]
    fn test_truncated_chunk_rejected() {
        let chunk = ChunkPacket {
            session: info(),
            index: 0,
            terminal: None,
            data: Bytes::from_static(b"abcd"),
        };
        let body = chunk.to_packet().into_body();
        let truncated = Packet::new(CHUNKED_TRANSFER_CHANNEL, body.slice(..body.len() - 1));
        assert!(ChunkPacket::from_packet(&truncated).is_err());
    }
}
