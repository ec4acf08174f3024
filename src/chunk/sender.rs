//! Splitting side of a chunked transfer

use bytes::Bytes;
use std::future::Future;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use super::{
    ChunkPacket, ChunkSessionInformation, FinalChunk, TransferError, TransferResult, TransferStatus,
    DEFAULT_CHUNK_SIZE,
};
use crate::network::NetworkChannel;
use crate::protocol::Packet;

/// Outcome of a finished send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    pub session_id: Uuid,
    pub status: TransferStatus,
    pub chunks: u32,
    pub bytes: u64,
}

/// Builder for [`ChunkedPacketSender`]
#[derive(Debug, Clone)]
pub struct ChunkedPacketSenderBuilder {
    transfer_channel: String,
    chunk_size: u32,
    extra_data: Bytes,
    session_id: Option<Uuid>,
}

impl ChunkedPacketSenderBuilder {
    pub fn chunk_size(mut self, chunk_size: u32) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn extra_data(mut self, extra_data: impl Into<Bytes>) -> Self {
        self.extra_data = extra_data.into();
        self
    }

    pub fn session_id(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn source<R>(self, source: R) -> ChunkedPacketSender<R>
    where
        R: AsyncRead + Unpin + Send,
    {
        ChunkedPacketSender {
            info: ChunkSessionInformation {
                session_id: self.session_id.unwrap_or_else(Uuid::new_v4),
                chunk_size: self.chunk_size.max(1),
                transfer_channel: self.transfer_channel,
                extra_data: self.extra_data,
            },
            source,
        }
    }
}

/// Reads a source stream and emits it as chunk packets
pub struct ChunkedPacketSender<R> {
    info: ChunkSessionInformation,
    source: R,
}

impl ChunkedPacketSender<()> {
    pub fn for_channel(transfer_channel: impl Into<String>) -> ChunkedPacketSenderBuilder {
        ChunkedPacketSenderBuilder {
            transfer_channel: transfer_channel.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            extra_data: Bytes::new(),
            session_id: None,
        }
    }
}

impl<R> ChunkedPacketSender<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn info(&self) -> &ChunkSessionInformation {
        &self.info
    }

    /// Send every chunk to all given channels.
    ///
    /// Each chunk waits for the channel's backpressure before the next one
    /// is read.
    pub async fn transfer(self, channels: &[NetworkChannel]) -> TransferResult<TransferSummary> {
        self.transfer_with(|packet| async move {
            for channel in channels {
                channel.send(packet.clone()).await?;
            }
            Ok::<(), TransferError>(())
        })
        .await
    }

    /// Send every chunk through `emit`
    pub async fn transfer_with<F, Fut>(mut self, mut emit: F) -> TransferResult<TransferSummary>
    where
        F: FnMut(Packet) -> Fut,
        Fut: Future<Output = TransferResult<()>>,
    {
        let chunk_size = self.info.chunk_size;
        let mut index = 0u32;
        let mut bytes = 0u64;

        tracing::debug!(
            session = %self.info.session_id,
            transfer = %self.info.transfer_channel,
            chunk_size,
            "starting chunked transfer"
        );

        loop {
            let mut data = Vec::with_capacity(chunk_size as usize);
            (&mut self.source)
                .take(u64::from(chunk_size))
                .read_to_end(&mut data)
                .await?;
            bytes += data.len() as u64;

            let full = data.len() == chunk_size as usize;
            let terminal = if full {
                None
            } else {
                Some(FinalChunk {
                    total_chunks: index + 1,
                    remaining_bytes: data.len() as u32,
                })
            };

            let chunk = ChunkPacket {
                session: self.info.clone(),
                index,
                terminal,
                data: Bytes::from(data),
            };
            emit(chunk.to_packet()).await?;

            if !full {
                break;
            }
            index = index
                .checked_add(1)
                .ok_or(TransferError::InvalidChunk("too many chunks"))?;
        }

        let summary = TransferSummary {
            session_id: self.info.session_id,
            status: TransferStatus::Success,
            chunks: index + 1,
            bytes,
        };
        tracing::debug!(
            session = %summary.session_id,
            chunks = summary.chunks,
            bytes = summary.bytes,
            "chunked transfer sent"
        );
        Ok(summary)
    }
}
