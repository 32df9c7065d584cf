//! TCP connections, the connection handshake and the per-connection receive loop
//!
//! Every connection starts with the connecting side writing a 16-byte id.
//! Silo-to-silo connections use [`DIRECT_CONNECTION_ID`]; gateway clients send
//! their own client id. After the handshake the stream carries frames in the
//! configured layout.
//!
//! The receive loop keeps exactly one read outstanding per connection: it
//! reads into the [`FrameReceiver`] buffer, surfaces every completed message,
//! and only then issues the next read.

use crate::error::{Result, TransportError};
use crate::shutdown::ShutdownSignal;
use crate::stats::MessagingStats;
use silo_codec::{FrameReceiver, FramingMode, MessageCodec, WireFrame};
use silo_config::MessagingConfig;
use silo_types::Message;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Identifier a peer announces in the handshake.
pub type ConnectionId = Uuid;

/// Handshake id of silo-to-silo connections.
pub const DIRECT_CONNECTION_ID: ConnectionId =
    Uuid::from_u128(0x1111_1111_1111_1111_1111_1111_1111_1111);

pub const HANDSHAKE_LEN: usize = 16;

static NEXT_CONNECTION_KEY: AtomicU64 = AtomicU64::new(1);

pub async fn write_handshake<W>(writer: &mut W, id: ConnectionId) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(id.as_bytes()).await?;
    writer.flush().await
}

pub async fn read_handshake<R>(reader: &mut R) -> std::io::Result<ConnectionId>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HANDSHAKE_LEN];
    reader.read_exact(&mut buf).await?;
    Ok(Uuid::from_bytes(buf))
}

/// Write side of an established connection.
///
/// Writers are serialized by an async mutex so one frame is always written
/// contiguously. The read side is owned by whoever runs the receive loop.
#[derive(Debug)]
pub struct Connection {
    key: u64,
    remote: SocketAddr,
    peer_id: ConnectionId,
    writer: Mutex<OwnedWriteHalf>,
    connected: AtomicBool,
}

impl Connection {
    pub fn new(remote: SocketAddr, peer_id: ConnectionId, writer: OwnedWriteHalf) -> Self {
        Self {
            key: NEXT_CONNECTION_KEY.fetch_add(1, Ordering::Relaxed),
            remote,
            peer_id,
            writer: Mutex::new(writer),
            connected: AtomicBool::new(true),
        }
    }

    /// Process-unique key of this connection.
    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn peer_id(&self) -> ConnectionId {
        self.peer_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
    }

    /// Write every segment of `frame`, returning the number of bytes written.
    pub async fn write_frame(&self, frame: &WireFrame) -> std::io::Result<usize> {
        if !self.is_connected() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection already closed",
            ));
        }

        let mut writer = self.writer.lock().await;
        let mut written = 0;
        for segment in &frame.segments {
            if let Err(e) = writer.write_all(segment).await {
                self.mark_disconnected();
                return Err(e);
            }
            written += segment.len();
        }
        if let Err(e) = writer.flush().await {
            self.mark_disconnected();
            return Err(e);
        }
        trace!(peer = %self.remote, bytes = written, messages = frame.messages, "frame written");
        Ok(written)
    }

    pub async fn close(&self) {
        self.mark_disconnected();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            trace!(peer = %self.remote, error = %e, "shutdown of closed connection");
        }
    }
}

/// Settings of the receive loop, taken from [`MessagingConfig`].
#[derive(Debug, Clone, Copy)]
pub struct ReceiveSettings {
    pub mode: FramingMode,
    pub max_frame_size: usize,
    pub buffer_size: usize,
    pub large_message_threshold: usize,
}

impl From<&MessagingConfig> for ReceiveSettings {
    fn from(config: &MessagingConfig) -> Self {
        Self {
            mode: FramingMode::from_batching(config.use_message_batching),
            max_frame_size: config.max_frame_size,
            buffer_size: config.receive_buffer_size,
            large_message_threshold: config.large_message_warning_threshold,
        }
    }
}

/// Read frames from `reader` until the peer closes, the stream turns out to
/// be corrupt, or `shutdown` fires. Each decoded message goes to `on_message`
/// before the next read is issued.
///
/// A clean close (including shutdown) returns `Ok`. A corrupt stream returns
/// the codec error and no partially received message is ever surfaced.
pub async fn receive_messages<R, F>(
    mut reader: R,
    peer: SocketAddr,
    settings: ReceiveSettings,
    codec: &dyn MessageCodec,
    stats: &MessagingStats,
    mut shutdown: ShutdownSignal,
    mut on_message: F,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(Message),
{
    let mut receiver = FrameReceiver::new(settings.mode, settings.max_frame_size);

    loop {
        let want = receiver.required().max(settings.buffer_size);
        receiver.buffer_mut().reserve(want);

        let read = tokio::select! {
            biased;
            _ = shutdown.wait() => {
                debug!(peer = %peer, "receive loop stopped by shutdown");
                return Ok(());
            }
            read = reader.read_buf(receiver.buffer_mut()) => read,
        };

        let n = read.map_err(|e| TransportError::io(format!("read from {}", peer), e))?;
        if n == 0 {
            if !receiver.is_idle() {
                debug!(peer = %peer, phase = ?receiver.phase(), "peer closed mid-frame, partial message dropped");
            }
            return Ok(());
        }

        let frames = receiver.poll_frames().map_err(|e| {
            stats.on_corrupt_stream();
            warn!(peer = %peer, error = %e, "corrupted receive stream");
            TransportError::Codec(e)
        })?;

        for frame in frames {
            let size = frame.len();
            if size > settings.large_message_threshold {
                warn!(peer = %peer, size, threshold = settings.large_message_threshold, "large message received");
            }
            let msg = codec.decode(frame.header, frame.body).map_err(|e| {
                stats.on_deserialization_failure();
                stats.on_corrupt_stream();
                warn!(peer = %peer, error = %e, "undecodable message, closing connection");
                TransportError::Codec(e)
            })?;
            stats.on_message_received(msg.category, size);
            on_message(msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::ShutdownTrigger;
    use silo_codec::{encode_messages, BincodeCodec};
    use silo_types::{Category, Direction, GrainId, GrainKind};
    use bytes::Bytes;

    fn settings(mode: FramingMode) -> ReceiveSettings {
        ReceiveSettings {
            mode,
            max_frame_size: 1 << 20,
            buffer_size: 16,
            large_message_threshold: 1 << 16,
        }
    }

    fn message(body: &'static [u8]) -> Message {
        Message::new(Category::Application, Direction::OneWay)
            .with_target(None, GrainId::random(GrainKind::Grain))
            .with_body(vec![Bytes::from_static(body)])
    }

    #[tokio::test]
    async fn handshake_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_handshake(&mut a, DIRECT_CONNECTION_ID).await.unwrap();
        assert_eq!(read_handshake(&mut b).await.unwrap(), DIRECT_CONNECTION_ID);
        assert_eq!(
            DIRECT_CONNECTION_ID.to_string(),
            "11111111-1111-1111-1111-111111111111"
        );
    }

    #[tokio::test]
    async fn receive_loop_delivers_in_order() {
        let codec = BincodeCodec;
        let msgs = vec![message(b"first"), message(b""), message(b"third")];
        let frame = encode_messages(&codec, &msgs, FramingMode::Single).unwrap();

        let (mut tx, rx) = tokio::io::duplex(32);
        let writer = tokio::spawn(async move {
            for segment in frame.segments {
                tx.write_all(&segment).await.unwrap();
            }
        });

        let stats = MessagingStats::new();
        let (_trigger, signal) = ShutdownTrigger::new();
        let mut received = Vec::new();
        receive_messages(
            rx,
            "127.0.0.1:1".parse().unwrap(),
            settings(FramingMode::Single),
            &codec,
            &stats,
            signal,
            |m| received.push(m),
        )
        .await
        .unwrap();
        writer.await.unwrap();

        let ids: Vec<_> = received.iter().map(|m| m.id).collect();
        assert_eq!(ids, msgs.iter().map(|m| m.id).collect::<Vec<_>>());
        assert_eq!(received[0].body_len(), 5);
        assert_eq!(received[1].body_len(), 0);
        assert_eq!(stats.snapshot().received(Category::Application), 3);
    }

    #[tokio::test]
    async fn corrupt_lengths_close_the_stream() {
        let (mut tx, rx) = tokio::io::duplex(32);
        tx.write_all(&(-1i32).to_le_bytes()).await.unwrap();
        tx.write_all(&4i32.to_le_bytes()).await.unwrap();

        let stats = MessagingStats::new();
        let (_trigger, signal) = ShutdownTrigger::new();
        let mut delivered = 0;
        let result = receive_messages(
            rx,
            "127.0.0.1:1".parse().unwrap(),
            settings(FramingMode::Single),
            &BincodeCodec,
            &stats,
            signal,
            |_| delivered += 1,
        )
        .await;

        assert!(matches!(result, Err(TransportError::Codec(_))));
        assert_eq!(delivered, 0);
        assert_eq!(stats.snapshot().corrupt_streams, 1);
    }

    #[tokio::test]
    async fn shutdown_stops_idle_loop() {
        let (_tx, rx) = tokio::io::duplex(32);
        let stats = MessagingStats::new();
        let (trigger, signal) = ShutdownTrigger::new();
        trigger.trigger();
        receive_messages(
            rx,
            "127.0.0.1:1".parse().unwrap(),
            settings(FramingMode::Batched),
            &BincodeCodec,
            &stats,
            signal,
            |_| {},
        )
        .await
        .unwrap();
    }
}
