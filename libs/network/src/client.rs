//! Minimal gateway client
//!
//! Speaks the client side of the gateway protocol: a handshake carrying the
//! client id, then frames in the silo's framing mode. Used by tools and
//! tests that need to act as an external client.

use crate::connection::write_handshake;
use crate::error::{Result, TransportError};
use silo_codec::{frame_encoded, BincodeCodec, FrameReceiver, FramingMode, MessageCodec, RawFrame};
use silo_types::{GrainId, Message};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use uuid::Uuid;

const READ_CHUNK: usize = 8 * 1024;

pub struct GatewayClient {
    id: Uuid,
    remote: SocketAddr,
    stream: TcpStream,
    codec: Arc<dyn MessageCodec>,
    mode: FramingMode,
    receiver: FrameReceiver,
    ready: VecDeque<RawFrame>,
}

impl GatewayClient {
    /// Connect to a gateway at `addr` as client `id`.
    pub async fn connect(addr: SocketAddr, id: Uuid, mode: FramingMode, max_frame_size: usize) -> Result<Self> {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::connection_with_source("gateway connect failed", Some(addr), e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::io("set TCP_NODELAY", e))?;
        write_handshake(&mut stream, id)
            .await
            .map_err(|e| TransportError::connection_with_source("handshake write failed", Some(addr), e))?;
        debug!(gateway = %addr, client = %id, "connected to gateway");

        Ok(Self {
            id,
            remote: addr,
            stream,
            codec: Arc::new(BincodeCodec),
            mode,
            receiver: FrameReceiver::new(mode, max_frame_size),
            ready: VecDeque::new(),
        })
    }

    pub fn with_codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Grain id the gateway knows this client by.
    pub fn client_id(&self) -> GrainId {
        GrainId::client(self.id)
    }

    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        let encoded = self.codec.encode(msg)?;
        let frame = frame_encoded(std::slice::from_ref(&encoded), self.mode)?;
        for segment in &frame.segments {
            self.stream
                .write_all(segment)
                .await
                .map_err(|e| TransportError::io(format!("write to {}", self.remote), e))?;
        }
        self.stream
            .flush()
            .await
            .map_err(|e| TransportError::io(format!("flush to {}", self.remote), e))
    }

    /// Next message from the gateway; `None` once the gateway closes the
    /// connection.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(Some(self.codec.decode(frame.header, frame.body)?));
            }

            let want = self.receiver.required().max(READ_CHUNK);
            self.receiver.buffer_mut().reserve(want);
            let n = self
                .stream
                .read_buf(self.receiver.buffer_mut())
                .await
                .map_err(|e| TransportError::io(format!("read from {}", self.remote), e))?;
            if n == 0 {
                return Ok(None);
            }
            self.ready.extend(self.receiver.poll_frames()?);
        }
    }

    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }
}
