//! Codec boundary between a [`Message`] and its header/body byte segments

use crate::error::{CodecError, CodecResult};
use bytes::Bytes;
use silo_types::Message;

/// A message split into the two byte ranges the wire frame carries.
#[derive(Debug, Clone)]
pub struct EncodedMessage {
    pub header: Bytes,
    pub body: Vec<Bytes>,
}

impl EncodedMessage {
    pub fn body_len(&self) -> usize {
        self.body.iter().map(Bytes::len).sum()
    }

    pub fn total_len(&self) -> usize {
        self.header.len() + self.body_len()
    }
}

/// Turns messages into header + body bytes and back.
///
/// The body is opaque to the transport: `encode` must hand out the message's
/// body segments unchanged and `decode` must attach the received body bytes
/// unchanged.
pub trait MessageCodec: Send + Sync {
    fn encode(&self, msg: &Message) -> CodecResult<EncodedMessage>;

    fn decode(&self, header: Bytes, body: Bytes) -> CodecResult<Message>;
}

/// Header codec backed by bincode.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl MessageCodec for BincodeCodec {
    fn encode(&self, msg: &Message) -> CodecResult<EncodedMessage> {
        let header = bincode::serialize(msg)
            .map_err(|e| CodecError::serialization_with_source("message header", e))?;
        Ok(EncodedMessage {
            header: Bytes::from(header),
            body: msg.body().to_vec(),
        })
    }

    fn decode(&self, header: Bytes, body: Bytes) -> CodecResult<Message> {
        let mut msg: Message = bincode::deserialize(&header).map_err(|e| {
            CodecError::deserialization_with_source("message header", header.len(), e)
        })?;
        if !body.is_empty() {
            msg.set_body(vec![body]);
        }
        Ok(msg)
    }
}
