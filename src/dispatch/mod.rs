//! Packet dispatcher
//!
//! Maps transport channel ids to listeners and runs them on a bounded worker
//! pool, off the connection I/O tasks. Packets for ids without listeners are
//! dropped silently so peers may speak channels this build does not know.

use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Semaphore;

use crate::network::NetworkChannel;
use crate::protocol::Packet;

/// Handler for packets of one transport channel id
#[async_trait]
pub trait PacketListener: Send + Sync {
    async fn handle(&self, channel: &NetworkChannel, packet: &Packet) -> anyhow::Result<()>;
}

/// Listener registry and worker pool
pub struct PacketDispatcher {
    listeners: RwLock<HashMap<u32, Vec<Arc<dyn PacketListener>>>>,
    workers: Arc<Semaphore>,
    worker_count: usize,
}

impl PacketDispatcher {
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        Self {
            listeners: RwLock::new(HashMap::new()),
            workers: Arc::new(Semaphore::new(worker_count)),
            worker_count,
        }
    }

    /// Add a listener for a channel id. Listeners of one id run in registration order.
    pub fn register(&self, channel: u32, listener: Arc<dyn PacketListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel)
            .or_default()
            .push(listener);
    }

    /// Remove every listener of a channel id. Returns false if there were none.
    pub fn unregister(&self, channel: u32) -> bool {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&channel)
            .is_some()
    }

    pub fn has_listeners(&self, channel: u32) -> bool {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&channel)
    }

    /// Route a packet to its listeners.
    ///
    /// Waits for a free worker, so packets handed in one after the other start
    /// in that order, then returns while the listeners run. Connections call
    /// this from their own dispatch task, never from the read path.
    pub async fn dispatch(&self, channel: NetworkChannel, packet: Packet) {
        let listeners = {
            let registry = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
            match registry.get(&packet.channel()) {
                Some(listeners) => listeners.clone(),
                None => {
                    tracing::trace!(
                        channel = packet.channel(),
                        size = packet.body().len(),
                        "no listener for packet, dropping"
                    );
                    return;
                }
            }
        };

        let permit = match self.workers.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        tokio::spawn(async move {
            let _permit = permit;
            for listener in listeners {
                let outcome = AssertUnwindSafe(listener.handle(&channel, &packet))
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(
                        channel = packet.channel(),
                        size = packet.body().len(),
                        remote = %channel.remote_addr(),
                        error = %e,
                        "packet listener failed"
                    ),
                    Err(_) => tracing::error!(
                        channel = packet.channel(),
                        size = packet.body().len(),
                        remote = %channel.remote_addr(),
                        "packet listener panicked"
                    ),
                }
            }
        });
    }

    /// Wait until no listener is running
    pub async fn wait_idle(&self) {
        if let Ok(permits) = self.workers.acquire_many(self.worker_count as u32).await {
            drop(permits);
        }
    }
}

impl Default for PacketDispatcher {
    fn default() -> Self {
        Self::new(
            std::thread::available_parallelism()
                .map(|n| n.get() * 2)
                .unwrap_or(4),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Watermarks;
    use crate::protocol::FIRST_USER_CHANNEL;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn test_channel() -> NetworkChannel {
        let addr = "127.0.0.1:1410".parse().unwrap();
        NetworkChannel::new(addr, addr, false, Watermarks::default()).0
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<Vec<u8>>,
    }

    #[async_trait]
    impl PacketListener for Recorder {
        async fn handle(&self, _channel: &NetworkChannel, packet: &Packet) -> anyhow::Result<()> {
            self.tx.send(packet.body().to_vec())?;
            Ok(())
        }
    }

    struct Failing {
        calls: AtomicUsize,
        panic: bool,
    }

    #[async_trait]
    impl PacketListener for Failing {
        async fn handle(&self, _channel: &NetworkChannel, packet: &Packet) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panic {
                panic!("listener blew up on {} bytes", packet.body().len());
            }
            anyhow::bail!("listener failed")
        }
    }

    #[tokio::test]
    async fn test_routes_by_channel_id() {
        let dispatcher = PacketDispatcher::new(2);
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.register(FIRST_USER_CHANNEL, Arc::new(Recorder { tx }));
        assert!(dispatcher.has_listeners(FIRST_USER_CHANNEL));

        dispatcher
            .dispatch(test_channel(), Packet::new(FIRST_USER_CHANNEL + 1, &b"unknown"[..]))
            .await;
        dispatcher
            .dispatch(test_channel(), Packet::new(FIRST_USER_CHANNEL, &b"known"[..]))
            .await;
        dispatcher.wait_idle().await;

        assert_eq!(rx.recv().await.unwrap(), b"known");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failures_are_contained() {
        let dispatcher = PacketDispatcher::new(1);
        let erroring = Arc::new(Failing {
            calls: AtomicUsize::new(0),
            panic: false,
        });
        let panicking = Arc::new(Failing {
            calls: AtomicUsize::new(0),
            panic: true,
        });
        let (tx, mut rx) = mpsc::unbounded_channel();

        dispatcher.register(FIRST_USER_CHANNEL, erroring.clone());
        dispatcher.register(FIRST_USER_CHANNEL, panicking.clone());
        dispatcher.register(FIRST_USER_CHANNEL, Arc::new(Recorder { tx }));

        for _ in 0..3 {
            dispatcher
                .dispatch(test_channel(), Packet::new(FIRST_USER_CHANNEL, &b"x"[..]))
                .await;
        }
        dispatcher.wait_idle().await;

        assert_eq!(erroring.calls.load(Ordering::SeqCst), 3);
        assert_eq!(panicking.calls.load(Ordering::SeqCst), 3);
        for _ in 0..3 {
            assert_eq!(rx.recv().await.unwrap(), b"x");
        }
    }

    struct Gated {
        gate: Arc<Semaphore>,
        tx: mpsc::UnboundedSender<Vec<u8>>,
    }

    #[async_trait]
    impl PacketListener for Gated {
        async fn handle(&self, _channel: &NetworkChannel, packet: &Packet) -> anyhow::Result<()> {
            let _ = self.gate.acquire().await;
            self.tx.send(packet.body().to_vec())?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_saturated_pool_keeps_order() {
        let dispatcher = Arc::new(PacketDispatcher::new(1));
        let gate = Arc::new(Semaphore::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.register(FIRST_USER_CHANNEL, Arc::new(Gated { gate: gate.clone(), tx }));

        let feeder = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                for body in [&b"first"[..], b"second", b"third"] {
                    dispatcher
                        .dispatch(test_channel(), Packet::new(FIRST_USER_CHANNEL, body))
                        .await;
                }
            })
        };

        // The first packet holds the only worker, the rest wait in line
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!feeder.is_finished());
        assert!(rx.try_recv().is_err());

        gate.close();
        feeder.await.unwrap();
        dispatcher.wait_idle().await;
        for expected in [&b"first"[..], b"second", b"third"] {
            assert_eq!(rx.recv().await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_unregister() {
        let dispatcher = PacketDispatcher::new(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.register(FIRST_USER_CHANNEL, Arc::new(Recorder { tx }));

        assert!(dispatcher.unregister(FIRST_USER_CHANNEL));
        assert!(!dispatcher.unregister(FIRST_USER_CHANNEL));

        dispatcher
            .dispatch(test_channel(), Packet::new(FIRST_USER_CHANNEL, &b"late"[..]))
            .await;
        dispatcher.wait_idle().await;
        assert!(rx.try_recv().is_err());
    }
}
