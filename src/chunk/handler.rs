//! Receiving side of one chunked transfer session

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};

use super::{
    AssembledData, ChunkPacket, ChunkSessionInformation, SinkFactory, TransferError, TransferResult,
    TransferSink, TransferStatus, DEFAULT_MAX_TRANSFER_SIZE,
};

/// Mutable session state, guarded by the per-session lock
struct SessionState {
    sink: Option<Box<dyn TransferSink>>,
    seen: HashSet<u32>,
    expected: Option<u32>,
    bytes: u64,
}

/// Reassembles one session.
///
/// Every chunk is written and counted under the session lock, so the
/// SUCCESS transition happens exactly once whatever order chunks arrive in.
pub struct ChunkedPacketHandler {
    info: ChunkSessionInformation,
    factory: Arc<dyn SinkFactory>,
    max_size: u64,
    state: Mutex<SessionState>,
    status: watch::Sender<TransferStatus>,
    last_activity: StdMutex<Instant>,
}

impl ChunkedPacketHandler {
    pub fn new(info: ChunkSessionInformation, factory: Arc<dyn SinkFactory>) -> Self {
        let (status, _) = watch::channel(TransferStatus::Running);
        Self {
            info,
            factory,
            max_size: DEFAULT_MAX_TRANSFER_SIZE,
            state: Mutex::new(SessionState {
                sink: None,
                seen: HashSet::new(),
                expected: None,
                bytes: 0,
            }),
            status,
            last_activity: StdMutex::new(Instant::now()),
        }
    }

    /// Reject chunks that would place data past `max_size` bytes
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn info(&self) -> &ChunkSessionInformation {
        &self.info
    }

    pub fn status(&self) -> TransferStatus {
        *self.status.borrow()
    }

    pub async fn received_chunks(&self) -> u32 {
        self.state.lock().await.seen.len() as u32
    }

    /// Total declared by the final chunk, once it arrived
    pub async fn expected_chunks(&self) -> Option<u32> {
        self.state.lock().await.expected
    }

    /// Time since the last chunk was handled
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Handle one chunk of this session.
    ///
    /// Returns the assembled data when this chunk completed the session.
    /// Chunks arriving after the session ended are ignored.
    pub async fn handle_chunk(&self, chunk: ChunkPacket) -> TransferResult<Option<AssembledData>> {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();

        let mut state = self.state.lock().await;
        if self.status().is_terminal() {
            tracing::trace!(
                session = %self.info.session_id,
                index = chunk.index,
                status = %self.status(),
                "ignoring chunk for finished session"
            );
            return Ok(None);
        }

        match self.write_chunk(&mut state, chunk).await {
            Ok(Some(sink)) => {
                // Storage is released on every exit path below
                let completed = sink.finish().await;
                match completed {
                    Ok(data) => {
                        self.status.send_replace(TransferStatus::Success);
                        tracing::debug!(
                            session = %self.info.session_id,
                            transfer = %self.info.transfer_channel,
                            chunks = state.seen.len(),
                            bytes = state.bytes,
                            "chunked transfer completed"
                        );
                        Ok(Some(data))
                    }
                    Err(e) => Err(self.fail_locked(&mut state, e.into())),
                }
            }
            Ok(None) => Ok(None),
            Err(e) => Err(self.fail_locked(&mut state, e)),
        }
    }

    /// Write a chunk. Returns the sink once every chunk was written.
    async fn write_chunk(
        &self,
        state: &mut SessionState,
        chunk: ChunkPacket,
    ) -> TransferResult<Option<Box<dyn TransferSink>>> {
        if chunk.session.chunk_size != self.info.chunk_size {
            return Err(TransferError::InvalidChunk("chunk size changed within session"));
        }
        chunk.validate()?;

        if let Some(terminal) = &chunk.terminal {
            if state.expected.is_some() {
                return Err(TransferError::InvalidChunk("second final chunk"));
            }
            if state.seen.iter().any(|index| *index >= terminal.total_chunks) {
                return Err(TransferError::InvalidChunk("chunk index beyond final chunk"));
            }
            state.expected = Some(terminal.total_chunks);
        } else if matches!(state.expected, Some(total) if chunk.index >= total) {
            return Err(TransferError::InvalidChunk("chunk index beyond final chunk"));
        }

        let offset = u64::from(chunk.index) * u64::from(self.info.chunk_size);
        match offset.checked_add(chunk.data.len() as u64) {
            Some(end) if end <= self.max_size => {}
            _ => return Err(TransferError::InvalidChunk("chunk beyond maximum transfer size")),
        }

        if state.seen.contains(&chunk.index) {
            tracing::debug!(session = %self.info.session_id, index = chunk.index, "duplicate chunk ignored");
            return Ok(None);
        }

        if state.sink.is_none() {
            state.sink = Some(self.factory.create(&self.info)?);
        }
        if let Some(sink) = state.sink.as_mut() {
            sink.write_at(offset, &chunk.data).await?;
        }
        state.seen.insert(chunk.index);
        state.bytes += chunk.data.len() as u64;

        match state.expected {
            Some(total) if state.seen.len() as u32 == total => Ok(state.sink.take()),
            _ => Ok(None),
        }
    }

    fn fail_locked(&self, state: &mut SessionState, error: TransferError) -> TransferError {
        state.sink = None;
        self.status.send_replace(TransferStatus::Failure);
        tracing::warn!(
            session = %self.info.session_id,
            transfer = %self.info.transfer_channel,
            error = %error,
            "chunked transfer failed"
        );
        error
    }

    /// Abandon the session and release its storage.
    ///
    /// Returns false if the session already ended.
    pub async fn fail(&self) -> bool {
        let mut state = self.state.lock().await;
        if self.status().is_terminal() {
            return false;
        }
        self.fail_locked(&mut state, TransferError::Failed(self.info.session_id));
        true
    }

    /// Wait until the session leaves RUNNING
    pub async fn wait_for_completion(&self, timeout: Duration) -> TransferResult<TransferStatus> {
        let mut status = self.status.subscribe();
        let finished = status.wait_for(|status| status.is_terminal());
        let outcome = match tokio::time::timeout(timeout, finished).await {
            Ok(Ok(status)) => Ok(*status),
            // The sender lives as long as self
            Ok(Err(_)) => Ok(self.status()),
            Err(_) => Err(TransferError::Timeout(self.info.session_id)),
        };
        outcome
    }
}
