//! Transport Error Types
//!
//! [`TransportError`] covers socket, handshake and configuration failures.
//! [`SendFailure`] is the outcome of one attempt to push a message through a
//! sender agent; its variant decides whether the message is dropped, retried
//! or turned into a rejection.

use silo_codec::CodecError;
use silo_types::SiloAddress;
use std::net::SocketAddr;
use thiserror::Error;
use uuid::Uuid;

/// Main transport error type
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection management errors
    #[error("Connection error: {message} (remote: {remote_addr:?})")]
    Connection {
        message: String,
        remote_addr: Option<SocketAddr>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Peer sent an identifier this acceptor does not accept
    #[error("Handshake rejected from {remote_addr}: {reason} (peer id {peer_id})")]
    Handshake {
        remote_addr: SocketAddr,
        peer_id: Uuid,
        reason: String,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Generic I/O errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    /// Create a connection error
    pub fn connection(message: impl Into<String>, remote_addr: Option<SocketAddr>) -> Self {
        Self::Connection {
            message: message.into(),
            remote_addr,
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        remote_addr: Option<SocketAddr>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            remote_addr,
            source: Some(Box::new(source)),
        }
    }

    pub fn handshake(remote_addr: SocketAddr, peer_id: Uuid, reason: impl Into<String>) -> Self {
        Self::Handshake {
            remote_addr,
            peer_id,
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }
}

/// Why a message did not make it onto the wire.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendFailure {
    #[error("message to be sent does not have a target silo")]
    MissingTarget,

    #[error("target silo {0} is known to be dead")]
    TargetDead(SiloAddress),

    #[error("recent connection failure to {target}, retrying after {retry_in_ms}ms")]
    RecentConnectionFailure {
        target: SocketAddr,
        retry_in_ms: u64,
    },

    #[error("failed to connect to {target}: {reason}")]
    Connect { target: SocketAddr, reason: String },

    #[error("failed to write to {target}: {reason}")]
    Write { target: SocketAddr, reason: String },

    #[error("byte count mismatch on send to {target}: sent {written}, expected {expected}")]
    ShortWrite {
        target: SocketAddr,
        written: usize,
        expected: usize,
    },

    #[error("cross-cluster send requires a cluster id on the sending silo, got {0}")]
    ClusterNotConfigured(SiloAddress),

    #[error("no gateway configured for cluster {0}")]
    NoGatewayForCluster(i32),
}

impl SendFailure {
    /// Transient socket failures worth another attempt under the retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::Write { .. } | Self::ShortWrite { .. }
        )
    }
}
