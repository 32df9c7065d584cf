//! Incremental frame receiver
//!
//! Bytes arrive in arbitrary pieces: a read may end in the middle of a length
//! prefix or carry several frames at once. [`FrameReceiver`] accumulates them
//! and walks the phases of the configured layout:
//!
//! - single:  `Lengths -> Header -> Body -> (emit) -> Lengths`
//! - batched: `MetaHeader -> Lengths -> HeaderBodies -> (emit all) -> MetaHeader`
//!
//! A phase completes once the accumulated bytes reach the length that phase
//! declared. Completed messages are returned as zero-copy slices of the
//! receive buffer whose boundaries are exactly the declared header/body split.

use crate::error::CodecResult;
use crate::frame::{read_batch_count, read_lengths, FramingMode, LENGTH_HEADER_SIZE, LENGTH_META_HEADER};
use bytes::{Bytes, BytesMut};
use tracing::trace;

/// Header and body bytes of one received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub header: Bytes,
    pub body: Bytes,
}

impl RawFrame {
    pub fn len(&self) -> usize {
        self.header.len() + self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceivePhase {
    Lengths,
    Header { header_len: usize, body_len: usize },
    Body { body_len: usize },
    MetaHeader,
    BatchLengths { count: usize },
    HeaderBodies { lengths: Vec<(usize, usize)>, total: usize },
}

/// Per-connection receive state.
#[derive(Debug)]
pub struct FrameReceiver {
    mode: FramingMode,
    phase: ReceivePhase,
    buffer: BytesMut,
    pending_header: Option<Bytes>,
    max_frame_size: usize,
}

impl FrameReceiver {
    pub fn new(mode: FramingMode, max_frame_size: usize) -> Self {
        Self {
            mode,
            phase: Self::initial_phase(mode),
            buffer: BytesMut::new(),
            pending_header: None,
            max_frame_size,
        }
    }

    fn initial_phase(mode: FramingMode) -> ReceivePhase {
        match mode {
            FramingMode::Single => ReceivePhase::Lengths,
            FramingMode::Batched => ReceivePhase::MetaHeader,
        }
    }

    pub fn phase(&self) -> &ReceivePhase {
        &self.phase
    }

    /// Receive buffer for the next read. Call [`poll_frames`] after filling it.
    ///
    /// [`poll_frames`]: FrameReceiver::poll_frames
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes still missing before the current phase completes.
    pub fn required(&self) -> usize {
        self.phase_len().saturating_sub(self.buffer.len())
    }

    /// True between frames with nothing buffered.
    pub fn is_idle(&self) -> bool {
        self.buffer.is_empty() && self.phase == Self::initial_phase(self.mode)
    }

    fn phase_len(&self) -> usize {
        match &self.phase {
            ReceivePhase::Lengths => LENGTH_HEADER_SIZE,
            ReceivePhase::Header { header_len, .. } => *header_len,
            ReceivePhase::Body { body_len } => *body_len,
            ReceivePhase::MetaHeader => LENGTH_META_HEADER,
            ReceivePhase::BatchLengths { count } => count * LENGTH_HEADER_SIZE,
            ReceivePhase::HeaderBodies { total, .. } => *total,
        }
    }

    /// Advance through every phase the buffered bytes complete.
    ///
    /// Any error leaves the receiver unusable; the stream must be dropped.
    pub fn poll_frames(&mut self) -> CodecResult<Vec<RawFrame>> {
        let mut frames = Vec::new();
        while self.buffer.len() >= self.phase_len() {
            let next = match std::mem::replace(&mut self.phase, ReceivePhase::Lengths) {
                ReceivePhase::Lengths => {
                    let lengths = self.buffer.split_to(LENGTH_HEADER_SIZE);
                    let (header_len, body_len) = read_lengths(&lengths, self.max_frame_size)?;
                    ReceivePhase::Header { header_len, body_len }
                }
                ReceivePhase::Header { header_len, body_len } => {
                    self.pending_header = Some(self.buffer.split_to(header_len).freeze());
                    ReceivePhase::Body { body_len }
                }
                ReceivePhase::Body { body_len } => {
                    let body = self.buffer.split_to(body_len).freeze();
                    let header = self.pending_header.take().unwrap_or_default();
                    frames.push(RawFrame { header, body });
                    ReceivePhase::Lengths
                }
                ReceivePhase::MetaHeader => {
                    let meta = self.buffer.split_to(LENGTH_META_HEADER);
                    let limit = self.max_frame_size / LENGTH_HEADER_SIZE;
                    let count = read_batch_count(&meta, limit)?;
                    ReceivePhase::BatchLengths { count }
                }
                ReceivePhase::BatchLengths { count } => {
                    let raw = self.buffer.split_to(count * LENGTH_HEADER_SIZE);
                    let mut lengths = Vec::with_capacity(count);
                    let mut total = 0usize;
                    for pair in raw.chunks_exact(LENGTH_HEADER_SIZE) {
                        let (header_len, body_len) = read_lengths(pair, self.max_frame_size)?;
                        total += header_len + body_len;
                        lengths.push((header_len, body_len));
                    }
                    if total > self.max_frame_size {
                        return Err(crate::CodecError::FrameTooLarge {
                            size: total,
                            max: self.max_frame_size,
                        });
                    }
                    ReceivePhase::HeaderBodies { lengths, total }
                }
                ReceivePhase::HeaderBodies { lengths, .. } => {
                    for (header_len, body_len) in lengths {
                        let header = self.buffer.split_to(header_len).freeze();
                        let body = self.buffer.split_to(body_len).freeze();
                        frames.push(RawFrame { header, body });
                    }
                    ReceivePhase::MetaHeader
                }
            };
            trace!(phase = ?next, buffered = self.buffer.len(), "receive phase complete");
            self.phase = next;
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode_batch, encode_frame};
    use crate::message_codec::EncodedMessage;

    fn encoded(header: &[u8], body: &[u8]) -> EncodedMessage {
        EncodedMessage {
            header: Bytes::copy_from_slice(header),
            body: vec![Bytes::copy_from_slice(body)],
        }
    }

    fn wire(segments: &[Bytes]) -> Vec<u8> {
        segments.iter().flat_map(|s| s.iter().copied()).collect()
    }

    #[test]
    fn single_frames_split_across_reads() {
        let mut bytes = wire(&encode_frame(&encoded(b"header-1", b"body-1")).unwrap().segments);
        bytes.extend(wire(&encode_frame(&encoded(b"h2", b"")).unwrap().segments));

        let mut receiver = FrameReceiver::new(FramingMode::Single, 1024);
        let mut frames = Vec::new();
        for chunk in bytes.chunks(3) {
            receiver.extend_from_slice(chunk);
            frames.extend(receiver.poll_frames().unwrap());
        }

        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0].header[..], b"header-1");
        assert_eq!(&frames[0].body[..], b"body-1");
        assert_eq!(&frames[1].header[..], b"h2");
        assert!(frames[1].body.is_empty());
        assert!(receiver.is_idle());
    }

    #[test]
    fn over_full_read_yields_every_frame() {
        let mut bytes = Vec::new();
        for i in 0..5u8 {
            bytes.extend(wire(&encode_frame(&encoded(&[i; 4], &[i; 7])).unwrap().segments));
        }
        let mut receiver = FrameReceiver::new(FramingMode::Single, 1024);
        receiver.extend_from_slice(&bytes);
        let frames = receiver.poll_frames().unwrap();
        assert_eq!(frames.len(), 5);
        assert_eq!(&frames[4].body[..], &[4u8; 7]);
    }

    #[test]
    fn batch_boundaries_land_on_declared_lengths() {
        let batch = encode_batch(&[
            encoded(b"aa", b"111"),
            encoded(b"bbbb", b""),
            encoded(b"c", b"2"),
        ])
        .unwrap();
        let bytes = wire(&batch.segments);

        let mut receiver = FrameReceiver::new(FramingMode::Batched, 1024);
        receiver.extend_from_slice(&bytes[..bytes.len() - 1]);
        assert!(receiver.poll_frames().unwrap().is_empty());
        assert_eq!(receiver.required(), 1);

        receiver.extend_from_slice(&bytes[bytes.len() - 1..]);
        let frames = receiver.poll_frames().unwrap();
        let pairs: Vec<(&[u8], &[u8])> = frames.iter().map(|f| (&f.header[..], &f.body[..])).collect();
        assert_eq!(
            pairs,
            vec![
                (&b"aa"[..], &b"111"[..]),
                (&b"bbbb"[..], &b""[..]),
                (&b"c"[..], &b"2"[..]),
            ]
        );
        assert_eq!(receiver.phase(), &ReceivePhase::MetaHeader);
    }

    #[test]
    fn corrupt_lengths_fail_without_emitting() {
        let mut receiver = FrameReceiver::new(FramingMode::Single, 1024);
        receiver.extend_from_slice(&(-5i32).to_le_bytes());
        receiver.extend_from_slice(&3i32.to_le_bytes());
        receiver.extend_from_slice(b"abc");
        assert!(receiver.poll_frames().is_err());
    }
}
