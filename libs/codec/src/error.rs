//! Codec errors for frame encoding and decoding
//!
//! Any decoding error means the byte stream can no longer be trusted; the
//! receiving side closes the connection instead of trying to resynchronize.

use thiserror::Error;

/// Frame and message codec errors with diagnostic context
#[derive(Debug, Error)]
pub enum CodecError {
    /// Declared header/body lengths are negative or add up to zero
    #[error("Invalid frame lengths: header {header_len}, body {body_len} ({diagnosis})")]
    InvalidLength {
        header_len: i32,
        body_len: i32,
        diagnosis: String,
    },

    /// Batch meta-header declared a non-positive or implausible message count
    #[error("Invalid batch count {count} (limit {limit})")]
    InvalidBatchCount { count: i32, limit: usize },

    /// Declared or encoded frame is larger than the configured maximum
    #[error("Frame too large: {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Message could not be turned into header bytes
    #[error("Serialization failed: {message}")]
    Serialization {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Header bytes could not be turned back into a message
    #[error("Deserialization failed: {message} (header: {header_len} bytes)")]
    Deserialization {
        message: String,
        header_len: usize,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Result type for codec operations
pub type CodecResult<T> = std::result::Result<T, CodecError>;

impl CodecError {
    pub fn invalid_length(header_len: i32, body_len: i32) -> Self {
        let diagnosis = if header_len < 0 || body_len < 0 {
            "negative length, stream is corrupted or misaligned"
        } else {
            "empty frame"
        };
        Self::InvalidLength {
            header_len,
            body_len,
            diagnosis: diagnosis.to_string(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
            source: None,
        }
    }

    pub fn serialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn deserialization_with_source(
        message: impl Into<String>,
        header_len: usize,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Deserialization {
            message: message.into(),
            header_len,
            source: Some(Box::new(source)),
        }
    }
}
