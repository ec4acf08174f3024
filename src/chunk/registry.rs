//! Session table for inbound chunked transfers

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{
    AssembledData, ChunkPacket, ChunkSessionInformation, ChunkedPacketHandler, SinkFactory,
    TempFileSinkFactory, TransferResult, TransferStatus, DEFAULT_MAX_TRANSFER_SIZE,
};
use crate::dispatch::PacketListener;
use crate::network::NetworkChannel;
use crate::protocol::Packet;

/// Consumer of completed transfers for one transfer channel name
#[async_trait]
pub trait TransferCallback: Send + Sync {
    /// Called once per successful session with the reassembled payload
    async fn on_complete(&self, info: &ChunkSessionInformation, data: AssembledData) -> anyhow::Result<()>;
}

/// Routes chunks to their sessions.
///
/// Sessions do not contend with each other: each has its own lock, and the
/// table lock is never held across an await.
pub struct ChunkedTransferRegistry {
    sessions: DashMap<Uuid, Arc<ChunkedPacketHandler>>,
    callbacks: DashMap<String, Arc<dyn TransferCallback>>,
    factory: Arc<dyn SinkFactory>,
    session_timeout: Duration,
    max_transfer_size: u64,
}

impl ChunkedTransferRegistry {
    pub fn new(factory: Arc<dyn SinkFactory>, session_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            callbacks: DashMap::new(),
            factory,
            session_timeout,
            max_transfer_size: DEFAULT_MAX_TRANSFER_SIZE,
        }
    }

    /// Bound the reassembled size of every session
    pub fn with_max_transfer_size(mut self, max_transfer_size: u64) -> Self {
        self.max_transfer_size = max_transfer_size;
        self
    }

    /// Registry storing sessions in temporary files
    pub fn with_temp_files(session_timeout: Duration) -> Self {
        Self::new(Arc::new(TempFileSinkFactory), session_timeout)
    }

    pub fn register_callback(&self, transfer_channel: impl Into<String>, callback: Arc<dyn TransferCallback>) {
        self.callbacks.insert(transfer_channel.into(), callback);
    }

    pub fn unregister_callback(&self, transfer_channel: &str) -> bool {
        self.callbacks.remove(transfer_channel).is_some()
    }

    pub fn session(&self, session_id: &Uuid) -> Option<Arc<ChunkedPacketHandler>> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    /// Number of known sessions, finished ones included until reaped
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Route one chunk to its session and run the callback on completion
    pub async fn handle_chunk(&self, chunk: ChunkPacket) -> TransferResult<()> {
        let callback = match self.callbacks.get(&chunk.session.transfer_channel) {
            Some(entry) => entry.value().clone(),
            None => {
                tracing::debug!(
                    session = %chunk.session.session_id,
                    transfer = %chunk.session.transfer_channel,
                    "no callback for transfer channel, dropping chunk"
                );
                return Ok(());
            }
        };

        let handler = self
            .sessions
            .entry(chunk.session.session_id)
            .or_insert_with(|| {
                tracing::debug!(
                    session = %chunk.session.session_id,
                    transfer = %chunk.session.transfer_channel,
                    "chunked transfer session started"
                );
                Arc::new(
                    ChunkedPacketHandler::new(chunk.session.clone(), self.factory.clone())
                        .with_max_size(self.max_transfer_size),
                )
            })
            .value()
            .clone();

        if let Some(data) = handler.handle_chunk(chunk).await? {
            // The reader, and with it the temporary storage, is dropped after the callback
            if let Err(e) = callback.on_complete(handler.info(), data).await {
                tracing::warn!(
                    session = %handler.info().session_id,
                    transfer = %handler.info().transfer_channel,
                    error = %e,
                    "transfer callback failed"
                );
            }
        }
        Ok(())
    }

    /// Fail sessions without activity for longer than the session timeout and
    /// forget finished sessions after the same delay.
    ///
    /// Returns the number of sessions failed.
    pub async fn reap_idle(&self) -> usize {
        let idle: Vec<(Uuid, Arc<ChunkedPacketHandler>)> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for() >= self.session_timeout)
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut failed = 0;
        for (id, handler) in idle {
            if handler.status() == TransferStatus::Running {
                if handler.fail().await {
                    tracing::warn!(session = %id, idle = ?handler.idle_for(), "chunked transfer timed out");
                    failed += 1;
                }
            } else {
                self.sessions.remove(&id);
            }
        }
        failed
    }

    /// Run `reap_idle` periodically until the registry is dropped
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match registry.upgrade() {
                    Some(registry) => {
                        registry.reap_idle().await;
                    }
                    None => break,
                }
            }
        })
    }
}

#[async_trait]
impl PacketListener for ChunkedTransferRegistry {
    async fn handle(&self, _channel: &NetworkChannel, packet: &Packet) -> anyhow::Result<()> {
        let chunk = ChunkPacket::from_packet(packet)?;
        self.handle_chunk(chunk).await?;
        Ok(())
    }
}
