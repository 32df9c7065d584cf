//! Messaging defaults
//!
//! Default values used when a configuration file leaves a setting out.

/// Sender pool and retry defaults
pub mod messaging {
    /// Pause after a failed connect before the same target is tried again
    pub const CONNECTION_RETRY_DELAY_MS: u64 = 1_000;

    /// Messages sent in one batched frame
    pub const MAX_MESSAGE_BATCHING_SIZE: usize = 10;

    /// Response timeout applied to requests without an explicit deadline
    pub const RESPONSE_TIMEOUT_MS: u64 = 30_000;

    /// Resend attempts for messages that do not carry their own limit
    pub const MAX_RESEND_COUNT: u32 = 0;

    /// Frames above this size are logged as large messages
    pub const LARGE_MESSAGE_WARNING_THRESHOLD: usize = 85_000;

    /// Declared frame lengths above this are treated as stream corruption
    pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

    /// Read chunk size for connection receive buffers
    pub const RECEIVE_BUFFER_SIZE: usize = 8 * 1024;

    /// Outbound sockets kept in the connection cache
    pub const SOCKET_CACHE_SIZE: usize = 200;

    /// Fallback sender pool size when parallelism cannot be queried
    pub const FALLBACK_SENDER_QUEUES: usize = 4;
}

/// Gateway defaults
pub mod gateway {
    /// Disconnected clients are dropped after this long
    pub const CLIENT_DROP_TIMEOUT_SECS: u64 = 60;

    /// Interval of the client and reply-route cleanup sweep
    pub const CLEANUP_INTERVAL_SECS: u64 = 60;

    /// Reply-route cache entries live for this multiple of the response timeout
    pub const REPLY_ROUTE_TTL_FACTOR: u32 = 5;
}
