//! # Silo Codec - Wire Framing
//!
//! Converts messages to and from length-prefixed frames.
//!
//! - [`frame`]: single and batched frame layouts, length validation
//! - [`receive`]: incremental receiver that turns arbitrary read chunks into
//!   complete header/body pairs
//! - [`message_codec`]: the boundary trait that turns a message into header and
//!   body bytes, with a bincode implementation
//!
//! The crate has no networking dependencies; sockets live in `silo-network`.

pub mod error;
pub mod frame;
pub mod message_codec;
pub mod receive;

pub use error::{CodecError, CodecResult};
pub use frame::{
    encode_batch, encode_frame, encode_messages, frame_encoded, FramingMode, WireFrame, LENGTH_HEADER_SIZE,
    LENGTH_META_HEADER,
};
pub use message_codec::{BincodeCodec, EncodedMessage, MessageCodec};
pub use receive::{FrameReceiver, RawFrame, ReceivePhase};
