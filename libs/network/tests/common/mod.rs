//! Shared helpers for network integration tests

#![allow(dead_code)]

use bytes::Bytes;
use silo_codec::{BincodeCodec, CodecError, CodecResult, EncodedMessage, MessageCodec};
use silo_config::SiloConfig;
use silo_network::MessageCenter;
use silo_types::{Category, Message};
use std::sync::Arc;
use std::time::Duration;

pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Config listening on an ephemeral loopback port.
pub fn local_config(name: &str) -> SiloConfig {
    let mut config = SiloConfig::local(name, "127.0.0.1:0".parse().unwrap());
    config.messaging.silo_sender_queues = 2;
    config.messaging.gateway_sender_queues = 2;
    config
}

pub fn gateway_config(name: &str) -> SiloConfig {
    let mut config = local_config(name);
    config.gateway_listen = Some("127.0.0.1:0".parse().unwrap());
    config
}

/// Next message of `category`, failing the test after [`RECEIVE_TIMEOUT`].
pub async fn receive(center: &Arc<MessageCenter>, category: Category) -> Message {
    tokio::time::timeout(RECEIVE_TIMEOUT, center.receive(category))
        .await
        .expect("timed out waiting for a message")
        .expect("inbound queue stopped")
}

/// Poll `condition` until it holds or the timeout passes.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + RECEIVE_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Body segment that [`FailingCodec`] refuses to encode.
pub const UNSERIALIZABLE: &[u8] = b"\xffunserializable";

/// Bincode codec that fails to encode any message whose body carries
/// [`UNSERIALIZABLE`].
#[derive(Default)]
pub struct FailingCodec;

impl MessageCodec for FailingCodec {
    fn encode(&self, msg: &Message) -> CodecResult<EncodedMessage> {
        if msg.body().iter().any(|segment| segment.as_ref() == UNSERIALIZABLE) {
            return Err(CodecError::serialization("body cannot be serialized"));
        }
        BincodeCodec.encode(msg)
    }

    fn decode(&self, header: Bytes, body: Bytes) -> CodecResult<Message> {
        BincodeCodec.decode(header, body)
    }
}
