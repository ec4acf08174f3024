//! Network channel handle
//!
//! A `NetworkChannel` is a cheap, cloneable handle to one live connection.
//! It owns:
//! - The outbound priority and bulk queues, with watermark based backpressure
//! - The table of outstanding query correlation ids
//! - The connection state shared with the I/O tasks

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use uuid::Uuid;

use super::Watermarks;
use crate::protocol::{var_u32_len, CodecError, Encoder, Packet, KEEPALIVE_CHANNEL};

/// Channel errors
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("TLS error: {0}")]
    Tls(#[from] tokio_native_tls::native_tls::Error),

    #[error("Channel closed")]
    Closed,

    #[error("Query timed out after {0:?}")]
    Timeout(Duration),

    #[error("Outbound queue above high watermark: {queued} bytes (high: {high})")]
    Backpressure { queued: usize, high: usize },

    #[error("Send channel closed")]
    SendChannelClosed,
}

impl ChannelError {
    /// Whether retrying the same operation later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChannelError::Timeout(_) | ChannelError::Backpressure { .. })
    }
}

pub type ChannelResult<T> = Result<T, ChannelError>;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// A packet waiting in an outbound queue together with its accounted size
pub(crate) struct Outbound {
    pub packet: Packet,
    pub size: usize,
}

/// Receiving ends handed to the connection's I/O tasks
pub(crate) struct ChannelQueues {
    pub priority_rx: mpsc::UnboundedReceiver<Outbound>,
    pub bulk_rx: mpsc::UnboundedReceiver<Outbound>,
    pub shutdown_rx: watch::Receiver<bool>,
}

/// Handle to one bidirectional connection
#[derive(Clone)]
pub struct NetworkChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    id: u64,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    client_side: bool,
    priority_tx: mpsc::UnboundedSender<Outbound>,
    bulk_tx: mpsc::UnboundedSender<Outbound>,
    /// Outstanding queries: correlation id -> reply slot
    pending: Mutex<HashMap<Uuid, oneshot::Sender<Packet>>>,
    queued_bytes: AtomicUsize,
    writable: AtomicBool,
    writable_notify: Notify,
    watermarks: Watermarks,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl NetworkChannel {
    pub(crate) fn new(
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        client_side: bool,
        watermarks: Watermarks,
    ) -> (Self, ChannelQueues) {
        let (priority_tx, priority_rx) = mpsc::unbounded_channel();
        let (bulk_tx, bulk_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let channel = Self {
            inner: Arc::new(ChannelInner {
                id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
                local_addr,
                remote_addr,
                client_side,
                priority_tx,
                bulk_tx,
                pending: Mutex::new(HashMap::new()),
                queued_bytes: AtomicUsize::new(0),
                writable: AtomicBool::new(true),
                writable_notify: Notify::new(),
                watermarks,
                closed: AtomicBool::new(false),
                shutdown_tx,
            }),
        };

        let queues = ChannelQueues {
            priority_rx,
            bulk_rx,
            shutdown_rx,
        };
        (channel, queues)
    }

    /// Process-unique channel id
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    /// Whether this side initiated the connection
    pub fn is_client_side(&self) -> bool {
        self.inner.client_side
    }

    /// Check if the channel is still open
    pub fn is_active(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    /// Whether the outbound queue is below the high watermark
    pub fn is_writable(&self) -> bool {
        self.inner.writable.load(Ordering::Acquire)
    }

    /// Bytes queued for writing but not yet written
    pub fn queued_bytes(&self) -> usize {
        self.inner.queued_bytes.load(Ordering::Acquire)
    }

    /// Number of queries still waiting for a reply
    pub fn pending_queries(&self) -> usize {
        self.pending().len()
    }

    /// Send a packet, waiting while the outbound queue is above the high watermark
    pub async fn send(&self, packet: Packet) -> ChannelResult<()> {
        self.wait_writable().await?;
        self.enqueue(packet)
    }

    /// Send a packet, failing instead of waiting when the channel is unwritable
    pub fn try_send(&self, packet: Packet) -> ChannelResult<()> {
        if !self.is_active() {
            return Err(ChannelError::Closed);
        }
        if !self.is_writable() {
            return Err(ChannelError::Backpressure {
                queued: self.queued_bytes(),
                high: self.inner.watermarks.high,
            });
        }
        self.enqueue(packet)
    }

    /// Send a query and wait for the reply carrying the same correlation id
    pub async fn send_query(&self, packet: Packet, timeout: Duration) -> ChannelResult<Packet> {
        let id = Uuid::new_v4();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending().insert(id, reply_tx);
        let _slot = PendingSlot { channel: self, id };

        // close() drains after flipping the flag, so a slot inserted late is caught here
        if !self.is_active() {
            return Err(ChannelError::Closed);
        }

        let exchange = async {
            self.send(packet.with_correlation(id)).await?;
            reply_rx.await.map_err(|_| ChannelError::Closed)
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(
                    channel = self.id(),
                    remote = %self.remote_addr(),
                    query = %id,
                    "query timed out"
                );
                Err(ChannelError::Timeout(timeout))
            }
        }
    }

    /// Measure the round-trip time to the peer
    pub async fn ping(&self, timeout: Duration) -> ChannelResult<Duration> {
        let start = Instant::now();
        self.send_query(Packet::prioritized(KEEPALIVE_CHANNEL, Bytes::new()), timeout)
            .await?;
        Ok(start.elapsed())
    }

    /// Wait until the peer has read every bulk packet queued before this call
    pub async fn flush(&self, timeout: Duration) -> ChannelResult<()> {
        // Bulk packets leave in order, so the reply to a bulk probe comes after them
        self.send_query(Packet::new(KEEPALIVE_CHANNEL, Bytes::new()), timeout)
            .await?;
        Ok(())
    }

    /// Close the channel.
    ///
    /// Every outstanding query resolves to `ChannelError::Closed` before this
    /// returns. Returns false if the channel was already closed.
    pub fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        let failed = {
            let mut pending = self.pending();
            let count = pending.len();
            // Dropping the reply senders wakes every waiter with an error
            pending.clear();
            count
        };
        if failed > 0 {
            tracing::debug!(channel = self.id(), failed, "failed outstanding queries on close");
        }

        self.inner.shutdown_tx.send_replace(true);
        self.inner.writable_notify.notify_waiters();
        true
    }

    /// Resolve a pending query with this packet.
    ///
    /// Returns the packet back if it does not answer an outstanding query.
    pub(crate) fn complete_query(&self, packet: Packet) -> Option<Packet> {
        if let Some(id) = packet.correlation_id() {
            let slot = self.pending().remove(&id);
            if let Some(reply_tx) = slot {
                // The waiter may have given up already
                let _ = reply_tx.send(packet);
                return None;
            }
        }
        Some(packet)
    }

    /// Queue a packet without waiting for writability.
    ///
    /// Used for replies produced on the read path, which must never block.
    pub(crate) fn enqueue(&self, packet: Packet) -> ChannelResult<()> {
        if !self.is_active() {
            return Err(ChannelError::Closed);
        }

        let frame_len = Encoder::frame_len(&packet);
        let size = frame_len + var_u32_len(frame_len as u32);
        let queued = self.inner.queued_bytes.fetch_add(size, Ordering::AcqRel) + size;
        if queued > self.inner.watermarks.high && self.inner.writable.swap(false, Ordering::AcqRel) {
            tracing::debug!(
                channel = self.id(),
                queued,
                high = self.inner.watermarks.high,
                "channel became unwritable"
            );
        }

        let queue = if packet.is_prioritized() {
            &self.inner.priority_tx
        } else {
            &self.inner.bulk_tx
        };
        queue.send(Outbound { packet, size }).map_err(|_| {
            self.release(size);
            ChannelError::SendChannelClosed
        })
    }

    /// Account for bytes that left the outbound queue
    pub(crate) fn release(&self, size: usize) {
        let queued = self.inner.queued_bytes.fetch_sub(size, Ordering::AcqRel) - size;
        if queued <= self.inner.watermarks.low
            && self
                .inner
                .writable
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            tracing::trace!(channel = self.id(), queued, "channel writable again");
            self.inner.writable_notify.notify_waiters();
        }
    }

    async fn wait_writable(&self) -> ChannelResult<()> {
        loop {
            if !self.is_active() {
                return Err(ChannelError::Closed);
            }
            if self.is_writable() {
                return Ok(());
            }

            let notified = self.inner.writable_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_active() || self.is_writable() {
                continue;
            }
            notified.await;
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<Uuid, oneshot::Sender<Packet>>> {
        self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for NetworkChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkChannel")
            .field("id", &self.id())
            .field("remote_addr", &self.remote_addr())
            .field("client_side", &self.is_client_side())
            .field("active", &self.is_active())
            .finish()
    }
}

/// Removes a query's slot when the waiting caller goes away
struct PendingSlot<'a> {
    channel: &'a NetworkChannel,
    id: Uuid,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.channel.pending().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FIRST_USER_CHANNEL;

    fn test_channel(watermarks: Watermarks) -> (NetworkChannel, ChannelQueues) {
        let local: SocketAddr = "127.0.0.1:1410".parse().unwrap();
        let remote: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        NetworkChannel::new(local, remote, true, watermarks)
    }

    #[tokio::test]
    async fn test_prioritized_packets_use_priority_queue() {
        let (channel, mut queues) = test_channel(Watermarks::default());
        channel.send(Packet::new(FIRST_USER_CHANNEL, &b"bulk"[..])).await.unwrap();
        channel
            .send(Packet::prioritized(FIRST_USER_CHANNEL, &b"urgent"[..]))
            .await
            .unwrap();

        assert_eq!(queues.priority_rx.recv().await.unwrap().packet.body().as_ref(), b"urgent");
        assert_eq!(queues.bulk_rx.recv().await.unwrap().packet.body().as_ref(), b"bulk");
    }

    #[tokio::test]
    async fn test_query_resolved_by_matching_reply() {
        let (channel, mut queues) = test_channel(Watermarks::default());

        let query = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .send_query(Packet::new(FIRST_USER_CHANNEL, &b"question"[..]), Duration::from_secs(5))
                    .await
            })
        };

        let request = queues.bulk_rx.recv().await.unwrap().packet;
        assert!(request.correlation_id().is_some());

        // A reply with an unknown id is handed back for normal dispatch
        let stray = Packet::response_to(&request.clone().with_correlation(Uuid::new_v4()), &b"stray"[..]);
        assert!(channel.complete_query(stray).is_some());
        assert_eq!(channel.pending_queries(), 1);

        assert!(channel
            .complete_query(Packet::response_to(&request, &b"answer"[..]))
            .is_none());

        let reply = query.await.unwrap().unwrap();
        assert_eq!(reply.body().as_ref(), b"answer");
        assert_eq!(channel.pending_queries(), 0);
    }

    #[tokio::test]
    async fn test_query_timeout_removes_slot() {
        let (channel, _queues) = test_channel(Watermarks::default());
        let result = channel
            .send_query(Packet::new(FIRST_USER_CHANNEL, Bytes::new()), Duration::from_millis(20))
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, ChannelError::Timeout(_)));
        assert!(err.is_retryable());
        assert_eq!(channel.pending_queries(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_all_pending_queries() {
        let (channel, _queues) = test_channel(Watermarks::default());

        let mut queries = Vec::new();
        for _ in 0..8 {
            let channel = channel.clone();
            queries.push(tokio::spawn(async move {
                channel
                    .send_query(Packet::new(FIRST_USER_CHANNEL, Bytes::new()), Duration::from_secs(60))
                    .await
            }));
        }

        while channel.pending_queries() < 8 {
            tokio::task::yield_now().await;
        }
        assert!(channel.close());
        assert!(!channel.close());

        for query in queries {
            let result = tokio::time::timeout(Duration::from_secs(1), query)
                .await
                .expect("query must resolve promptly")
                .unwrap();
            assert!(matches!(result, Err(ChannelError::Closed)));
        }
        assert_eq!(channel.pending_queries(), 0);
    }

    #[tokio::test]
    async fn test_backpressure_watermarks() {
        let (channel, mut queues) = test_channel(Watermarks::new(32, 64));

        channel.try_send(Packet::new(FIRST_USER_CHANNEL, vec![0u8; 100])).unwrap();
        assert!(!channel.is_writable());

        let err = channel
            .try_send(Packet::new(FIRST_USER_CHANNEL, vec![0u8; 10]))
            .unwrap_err();
        assert!(matches!(err, ChannelError::Backpressure { .. }));
        assert!(err.is_retryable());

        // A throttled sender resumes once the writer drains the queue
        let waiting = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.send(Packet::new(FIRST_USER_CHANNEL, vec![1u8; 4])).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        let written = queues.bulk_rx.recv().await.unwrap();
        channel.release(written.size);
        assert!(channel.is_writable());

        tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(queues.bulk_rx.recv().await.unwrap().packet.body().as_ref(), &[1u8; 4]);
    }

    #[tokio::test]
    async fn test_close_wakes_throttled_sender() {
        let (channel, _queues) = test_channel(Watermarks::new(1, 2));
        channel.try_send(Packet::new(FIRST_USER_CHANNEL, vec![0u8; 16])).unwrap();

        let waiting = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.send(Packet::new(FIRST_USER_CHANNEL, Bytes::new())).await })
        };
        tokio::task::yield_now().await;
        channel.close();

        let result = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ChannelError::Closed)));
    }
}
