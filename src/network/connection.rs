//! Connection driver
//!
//! Drives one duplex byte stream (plain TCP, TLS, or in-memory) for a
//! [`NetworkChannel`]:
//! - The read task decodes frames, resolves correlated replies, answers
//!   keepalives and hands everything else to the channel handler
//! - The dispatch task feeds handled packets to the dispatcher in read order,
//!   so a busy worker pool never holds up reads
//! - The write task drains the priority queue before the bulk queue

use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};

use super::channel::Outbound;
use super::{ChannelError, ChannelHandler, NetworkChannel, NetworkConfig};
use crate::dispatch::PacketDispatcher;
use crate::protocol::{Decoder, Encoder, Packet, KEEPALIVE_CHANNEL};

/// Start the I/O tasks for an established stream and return its channel
pub fn spawn<S>(
    stream: S,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    client_side: bool,
    handler: Arc<dyn ChannelHandler>,
    dispatcher: Arc<PacketDispatcher>,
    config: &NetworkConfig,
) -> NetworkChannel
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (channel, queues) =
        NetworkChannel::new(local_addr, remote_addr, client_side, config.watermarks);
    let (reader, writer) = tokio::io::split(stream);

    tokio::spawn(write_loop(
        channel.clone(),
        writer,
        queues.priority_rx,
        queues.bulk_rx,
        queues.shutdown_rx.clone(),
        Encoder::new(config.max_frame_size),
    ));
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    tokio::spawn(dispatch_loop(channel.clone(), inbound_rx, dispatcher));
    tokio::spawn(read_loop(
        channel.clone(),
        reader,
        handler,
        inbound_tx,
        Decoder::new(config.max_frame_size),
        queues.shutdown_rx,
        config.read_buffer_size,
    ));

    channel
}

async fn read_loop<S>(
    channel: NetworkChannel,
    mut reader: ReadHalf<S>,
    handler: Arc<dyn ChannelHandler>,
    inbound: mpsc::UnboundedSender<Packet>,
    mut decoder: Decoder,
    mut shutdown: watch::Receiver<bool>,
    buffer_size: usize,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    handler.on_init(&channel).await;
    tracing::info!(
        channel = channel.id(),
        remote = %channel.remote_addr(),
        client_side = channel.is_client_side(),
        "channel opened"
    );

    let mut read_buf = BytesMut::with_capacity(buffer_size);
    let reason = 'read: loop {
        loop {
            match decoder.decode(&mut read_buf) {
                Ok(Some(packet)) => handle_inbound(&channel, handler.as_ref(), &inbound, packet).await,
                Ok(None) => break,
                Err(e) => break 'read format!("decode error: {}", e),
            }
        }

        if *shutdown.borrow() {
            break "closed locally".to_string();
        }
        if read_buf.capacity() - read_buf.len() < buffer_size / 4 {
            read_buf.reserve(buffer_size);
        }

        tokio::select! {
            result = reader.read_buf(&mut read_buf) => match result {
                Ok(0) if read_buf.is_empty() => break "connection closed by peer".to_string(),
                Ok(0) => break "connection closed mid-frame".to_string(),
                Ok(_) => {}
                Err(e) => break format!("read error: {}", e),
            },
            _ = shutdown.changed() => break "closed locally".to_string(),
        }
    };

    channel.close();
    handler.on_close(&channel).await;
    tracing::info!(
        channel = channel.id(),
        remote = %channel.remote_addr(),
        reason = %reason,
        "channel closed"
    );
}

async fn handle_inbound(
    channel: &NetworkChannel,
    handler: &dyn ChannelHandler,
    inbound: &mpsc::UnboundedSender<Packet>,
    packet: Packet,
) {
    // Correlated replies never reach the handler or the dispatcher
    let Some(packet) = channel.complete_query(packet) else {
        return;
    };

    if packet.channel() == KEEPALIVE_CHANNEL && packet.correlation_id().is_some() {
        if let Err(e) = channel.enqueue(Packet::empty_response_to(&packet)) {
            tracing::debug!(channel = channel.id(), error = %e, "keepalive reply dropped");
        }
        return;
    }

    if handler.on_packet(channel, &packet).await && inbound.send(packet).is_err() {
        tracing::debug!(channel = channel.id(), "dispatch task gone, dropping packet");
    }
}

/// Waits for workers on behalf of the read task, one packet at a time.
/// Ends once the read task dropped its sender and the backlog is dispatched.
async fn dispatch_loop(
    channel: NetworkChannel,
    mut inbound: mpsc::UnboundedReceiver<Packet>,
    dispatcher: Arc<PacketDispatcher>,
) {
    while let Some(packet) = inbound.recv().await {
        dispatcher.dispatch(channel.clone(), packet).await;
    }
}

async fn write_loop<S>(
    channel: NetworkChannel,
    mut writer: WriteHalf<S>,
    mut priority_rx: mpsc::UnboundedReceiver<Outbound>,
    mut bulk_rx: mpsc::UnboundedReceiver<Outbound>,
    mut shutdown: watch::Receiver<bool>,
    encoder: Encoder,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(8 * 1024);

    let result = async {
        loop {
            let outbound = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(outbound) = priority_rx.recv() => outbound,
                Some(outbound) = bulk_rx.recv() => outbound,
                else => break,
            };
            write_packet(&channel, &mut writer, &encoder, &mut buf, outbound).await?;

            // Batch whatever queued up meanwhile into a single flush
            while let Some(outbound) = next_queued(&mut priority_rx, &mut bulk_rx) {
                write_packet(&channel, &mut writer, &encoder, &mut buf, outbound).await?;
            }
            writer.flush().await?;
        }

        // Best effort: deliver what was queued before the close
        while let Some(outbound) = next_queued(&mut priority_rx, &mut bulk_rx) {
            write_packet(&channel, &mut writer, &encoder, &mut buf, outbound).await?;
        }
        writer.flush().await?;
        writer.shutdown().await?;
        Ok::<(), ChannelError>(())
    }
    .await;

    if let Err(e) = result {
        tracing::warn!(
            channel = channel.id(),
            remote = %channel.remote_addr(),
            error = %e,
            "write failed, closing channel"
        );
        channel.close();
    }
}

fn next_queued(
    priority_rx: &mut mpsc::UnboundedReceiver<Outbound>,
    bulk_rx: &mut mpsc::UnboundedReceiver<Outbound>,
) -> Option<Outbound> {
    priority_rx.try_recv().or_else(|_| bulk_rx.try_recv()).ok()
}

async fn write_packet<W>(
    channel: &NetworkChannel,
    writer: &mut W,
    encoder: &Encoder,
    buf: &mut BytesMut,
    outbound: Outbound,
) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    buf.clear();
    let encoded = encoder.encode(&outbound.packet, buf);
    channel.release(outbound.size);

    match encoded {
        Ok(()) => {
            writer.write_all(&buf[..]).await?;
            Ok(())
        }
        Err(e) => {
            // One unencodable packet must not take the connection down
            tracing::warn!(
                channel = channel.id(),
                packet_channel = outbound.packet.channel(),
                size = outbound.packet.body().len(),
                error = %e,
                "dropping unencodable packet"
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::PacketListener;
    use crate::protocol::FIRST_USER_CHANNEL;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::time::Duration;
    use uuid::Uuid;

    #[derive(Debug)]
    enum Event {
        Init,
        Packet(Packet),
        Close,
    }

    struct RecordingHandler {
        events: mpsc::UnboundedSender<Event>,
        pass_through: bool,
    }

    #[async_trait]
    impl ChannelHandler for RecordingHandler {
        async fn on_init(&self, _channel: &NetworkChannel) {
            let _ = self.events.send(Event::Init);
        }

        async fn on_packet(&self, _channel: &NetworkChannel, packet: &Packet) -> bool {
            let _ = self.events.send(Event::Packet(packet.clone()));
            self.pass_through
        }

        async fn on_close(&self, _channel: &NetworkChannel) {
            let _ = self.events.send(Event::Close);
        }
    }

    struct Echo;

    #[async_trait]
    impl PacketListener for Echo {
        async fn handle(&self, channel: &NetworkChannel, packet: &Packet) -> anyhow::Result<()> {
            channel
                .send(Packet::response_to(packet, packet.body().clone()))
                .await?;
            Ok(())
        }
    }

    /// Holds its worker until the gate closes
    struct Stalled {
        started: mpsc::UnboundedSender<Bytes>,
        gate: Arc<tokio::sync::Semaphore>,
    }

    #[async_trait]
    impl PacketListener for Stalled {
        async fn handle(&self, _channel: &NetworkChannel, packet: &Packet) -> anyhow::Result<()> {
            self.started.send(packet.body().clone())?;
            let _ = self.gate.acquire().await;
            Ok(())
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn recording(pass_through: bool) -> (Arc<RecordingHandler>, mpsc::UnboundedReceiver<Event>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Arc::new(RecordingHandler { events, pass_through }), rx)
    }

    #[tokio::test]
    async fn test_fragmented_stream() {
        let packet = Packet::prioritized(FIRST_USER_CHANNEL, &b"fragmented payload"[..])
            .with_correlation(Uuid::new_v4());
        let wire = Encoder::default().encode_to_bytes(&packet).unwrap();

        let mock = tokio_test::io::Builder::new()
            .read(&[0])
            .read(&wire[..2])
            .read(&wire[2..7])
            .read(&wire[7..])
            .build();

        let (handler, mut events) = recording(false);
        let channel = spawn(
            mock,
            addr(1410),
            addr(50000),
            true,
            handler,
            Arc::new(PacketDispatcher::new(1)),
            &NetworkConfig::default(),
        );

        assert!(matches!(events.recv().await, Some(Event::Init)));
        match events.recv().await {
            Some(Event::Packet(received)) => assert_eq!(received, packet),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(events.recv().await, Some(Event::Close)));
        assert!(!channel.is_active());
    }

    #[tokio::test]
    async fn test_query_over_duplex() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let config = NetworkConfig::default();

        let server_dispatcher = Arc::new(PacketDispatcher::new(2));
        server_dispatcher.register(FIRST_USER_CHANNEL, Arc::new(Echo));
        let (server_handler, _server_events) = recording(true);
        let _server = spawn(a, addr(1410), addr(50000), false, server_handler, server_dispatcher, &config);

        let (client_handler, mut client_events) = recording(true);
        let client = spawn(
            b,
            addr(50000),
            addr(1410),
            true,
            client_handler,
            Arc::new(PacketDispatcher::new(2)),
            &config,
        );

        let reply = client
            .send_query(Packet::new(FIRST_USER_CHANNEL, &b"echo me"[..]), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply.body().as_ref(), b"echo me");

        // Keepalives are answered by the peer channel itself
        client.ping(Duration::from_secs(5)).await.unwrap();
        client.flush(Duration::from_secs(5)).await.unwrap();

        // The correlated replies never reached the client's handler
        assert!(matches!(client_events.recv().await, Some(Event::Init)));
        assert!(client_events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_busy_workers_do_not_stall_other_connections() {
        let config = NetworkConfig::default();
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let (started_tx, mut started) = mpsc::unbounded_channel();

        // One worker shared by both server side channels
        let shared = Arc::new(PacketDispatcher::new(1));
        shared.register(
            FIRST_USER_CHANNEL,
            Arc::new(Stalled {
                started: started_tx,
                gate: gate.clone(),
            }),
        );

        let (server_a, client_a) = tokio::io::duplex(64 * 1024);
        let (server_b, client_b) = tokio::io::duplex(64 * 1024);
        let (handler, _events) = recording(true);
        let _to_a = spawn(server_a, addr(1410), addr(50001), false, handler.clone(), shared.clone(), &config);
        let to_b = spawn(server_b, addr(1410), addr(50002), false, handler.clone(), shared.clone(), &config);

        let peer_a = spawn(
            client_a,
            addr(50001),
            addr(1410),
            true,
            handler.clone(),
            Arc::new(PacketDispatcher::new(1)),
            &config,
        );
        let echo = Arc::new(PacketDispatcher::new(1));
        echo.register(FIRST_USER_CHANNEL + 1, Arc::new(Echo));
        let peer_b = spawn(client_b, addr(50002), addr(1410), true, handler, echo, &config);

        peer_a.send(Packet::new(FIRST_USER_CHANNEL, &b"slow"[..])).await.unwrap();
        assert_eq!(started.recv().await.unwrap().as_ref(), b"slow");

        // Waits for the busy worker, ahead of the reply below on the same stream
        peer_b.send(Packet::new(FIRST_USER_CHANNEL, &b"queued"[..])).await.unwrap();

        let reply = to_b
            .send_query(Packet::new(FIRST_USER_CHANNEL + 1, &b"still reading"[..]), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply.body().as_ref(), b"still reading");
        assert!(started.try_recv().is_err());

        // The queued packet runs once the worker frees up
        gate.close();
        assert_eq!(started.recv().await.unwrap().as_ref(), b"queued");
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending_queries() {
        let (a, b) = tokio::io::duplex(1024);
        let config = NetworkConfig::default();

        // Server side has no listener, so the query never gets an answer
        let (server_handler, _server_events) = recording(true);
        let server = spawn(
            a,
            addr(1410),
            addr(50000),
            false,
            server_handler,
            Arc::new(PacketDispatcher::new(1)),
            &config,
        );

        let (client_handler, mut client_events) = recording(true);
        let client = spawn(
            b,
            addr(50000),
            addr(1410),
            true,
            client_handler,
            Arc::new(PacketDispatcher::new(1)),
            &config,
        );

        let query = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .send_query(Packet::new(FIRST_USER_CHANNEL, Bytes::new()), Duration::from_secs(60))
                    .await
            })
        };
        while client.pending_queries() == 0 {
            tokio::task::yield_now().await;
        }

        server.close();

        let result = tokio::time::timeout(Duration::from_secs(5), query)
            .await
            .expect("query must not hang")
            .unwrap();
        assert!(matches!(result, Err(ChannelError::Closed)));

        assert!(matches!(client_events.recv().await, Some(Event::Init)));
        assert!(matches!(client_events.recv().await, Some(Event::Close)));
    }

    #[tokio::test]
    async fn test_garbage_closes_connection() {
        // A var-int prefix that never terminates
        let mock = tokio_test::io::Builder::new()
            .read(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF])
            .build();
        let (handler, mut events) = recording(true);
        let channel = spawn(
            mock,
            addr(1410),
            addr(50000),
            false,
            handler,
            Arc::new(PacketDispatcher::new(1)),
            &NetworkConfig::default(),
        );

        assert!(matches!(events.recv().await, Some(Event::Init)));
        assert!(matches!(events.recv().await, Some(Event::Close)));
        assert!(!channel.is_active());
    }
}
