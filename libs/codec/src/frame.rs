//! Wire frame encoding
//!
//! ## Layout
//!
//! Non-batched, one message per frame:
//!
//! ```text
//! ┌───────────────┬─────────────┬──────────────┬────────────┐
//! │ header_len i32│ body_len i32│ header bytes │ body bytes │
//! └───────────────┴─────────────┴──────────────┴────────────┘
//! ```
//!
//! Batched, `count` messages per frame:
//!
//! ```text
//! ┌──────────┬──────────────────────────────┬──────────────────────────────┐
//! │ count i32│ count × (header i32, body i32)│ h0 b0 h1 b1 ... in order     │
//! └──────────┴──────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! All integers are little-endian. Frames are produced as a list of [`Bytes`]
//! segments so header and body buffers are written without being copied into
//! one contiguous allocation.

use crate::error::{CodecError, CodecResult};
use crate::message_codec::{EncodedMessage, MessageCodec};
use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use silo_types::Message;

/// Size of the (header_len, body_len) pair preceding each message.
pub const LENGTH_HEADER_SIZE: usize = 8;

/// Size of the message-count prefix of a batched frame.
pub const LENGTH_META_HEADER: usize = 4;

/// Which of the two wire layouts a connection speaks.
///
/// Chosen by configuration on both sides; it is never negotiated per
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingMode {
    Single,
    Batched,
}

impl FramingMode {
    pub fn from_batching(enabled: bool) -> Self {
        if enabled {
            FramingMode::Batched
        } else {
            FramingMode::Single
        }
    }
}

/// Encoded frame ready to be written.
#[derive(Debug, Clone)]
pub struct WireFrame {
    pub segments: Vec<Bytes>,
    pub len: usize,
    pub messages: usize,
}

fn to_i32(len: usize) -> CodecResult<i32> {
    i32::try_from(len).map_err(|_| CodecError::FrameTooLarge {
        size: len,
        max: i32::MAX as usize,
    })
}

fn put_lengths(buf: &mut BytesMut, msg: &EncodedMessage) -> CodecResult<()> {
    buf.put_i32_le(to_i32(msg.header.len())?);
    buf.put_i32_le(to_i32(msg.body_len())?);
    Ok(())
}

/// Frame one message as `lengths | header | body`.
pub fn encode_frame(msg: &EncodedMessage) -> CodecResult<WireFrame> {
    let mut lengths = BytesMut::with_capacity(LENGTH_HEADER_SIZE);
    put_lengths(&mut lengths, msg)?;

    let mut segments = Vec::with_capacity(2 + msg.body.len());
    segments.push(lengths.freeze());
    segments.push(msg.header.clone());
    segments.extend(msg.body.iter().filter(|b| !b.is_empty()).cloned());

    Ok(WireFrame {
        len: LENGTH_HEADER_SIZE + msg.total_len(),
        segments,
        messages: 1,
    })
}

/// Frame several messages as `count | lengths... | header/body...`.
pub fn encode_batch(msgs: &[EncodedMessage]) -> CodecResult<WireFrame> {
    let mut prefix = BytesMut::with_capacity(LENGTH_META_HEADER + LENGTH_HEADER_SIZE * msgs.len());
    prefix.put_i32_le(to_i32(msgs.len())?);
    for msg in msgs {
        put_lengths(&mut prefix, msg)?;
    }

    let mut len = prefix.len();
    let mut segments = vec![prefix.freeze()];
    for msg in msgs {
        segments.push(msg.header.clone());
        segments.extend(msg.body.iter().filter(|b| !b.is_empty()).cloned());
        len += msg.total_len();
    }

    Ok(WireFrame {
        segments,
        len,
        messages: msgs.len(),
    })
}

/// Frame already-encoded messages in `mode`.
///
/// In single mode every message becomes its own frame and the segments are
/// concatenated, so the result can always be written with one call.
pub fn frame_encoded(encoded: &[EncodedMessage], mode: FramingMode) -> CodecResult<WireFrame> {
    match mode {
        FramingMode::Batched => encode_batch(encoded),
        FramingMode::Single => {
            let mut out = WireFrame {
                segments: Vec::new(),
                len: 0,
                messages: 0,
            };
            for msg in encoded {
                let frame = encode_frame(msg)?;
                out.segments.extend(frame.segments);
                out.len += frame.len;
                out.messages += 1;
            }
            Ok(out)
        }
    }
}

/// Run `msgs` through `codec` and frame them in `mode`.
pub fn encode_messages(
    codec: &dyn MessageCodec,
    msgs: &[Message],
    mode: FramingMode,
) -> CodecResult<WireFrame> {
    let encoded = msgs
        .iter()
        .map(|m| codec.encode(m))
        .collect::<CodecResult<Vec<_>>>()?;
    frame_encoded(&encoded, mode)
}

/// Read and validate one `(header_len, body_len)` pair.
pub fn read_lengths(buf: &[u8], max_frame_size: usize) -> CodecResult<(usize, usize)> {
    let header_len = LittleEndian::read_i32(&buf[0..4]);
    let body_len = LittleEndian::read_i32(&buf[4..8]);
    if header_len < 0 || body_len < 0 || (header_len == 0 && body_len == 0) {
        return Err(CodecError::invalid_length(header_len, body_len));
    }
    let total = header_len as usize + body_len as usize;
    if total > max_frame_size {
        return Err(CodecError::FrameTooLarge {
            size: total,
            max: max_frame_size,
        });
    }
    Ok((header_len as usize, body_len as usize))
}

/// Read and validate a batch meta-header.
pub fn read_batch_count(buf: &[u8], limit: usize) -> CodecResult<usize> {
    let count = LittleEndian::read_i32(&buf[0..LENGTH_META_HEADER]);
    if count <= 0 || count as usize > limit {
        return Err(CodecError::InvalidBatchCount { count, limit });
    }
    Ok(count as usize)
}
