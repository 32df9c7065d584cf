//! Messaging configuration
//!
//! Pool sizes, retry timing, framing and gateway client settings.

use crate::defaults::{gateway, messaging};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Application sender agents for silo-to-silo traffic
    pub silo_sender_queues: usize,
    /// Sender agents serving gateway clients
    pub gateway_sender_queues: usize,
    pub connection_retry_delay_ms: u64,
    pub client_drop_timeout_secs: u64,
    pub gateway_cleanup_interval_secs: u64,
    pub use_message_batching: bool,
    pub max_message_batching_size: usize,
    pub response_timeout_ms: u64,
    pub max_resend_count: u32,
    pub large_message_warning_threshold: usize,
    pub max_frame_size: usize,
    pub receive_buffer_size: usize,
    pub socket_cache_size: usize,
    pub drop_expired_messages: bool,
}

fn default_sender_queues() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(messaging::FALLBACK_SENDER_QUEUES)
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            silo_sender_queues: default_sender_queues(),
            gateway_sender_queues: default_sender_queues(),
            connection_retry_delay_ms: messaging::CONNECTION_RETRY_DELAY_MS,
            client_drop_timeout_secs: gateway::CLIENT_DROP_TIMEOUT_SECS,
            gateway_cleanup_interval_secs: gateway::CLEANUP_INTERVAL_SECS,
            use_message_batching: false,
            max_message_batching_size: messaging::MAX_MESSAGE_BATCHING_SIZE,
            response_timeout_ms: messaging::RESPONSE_TIMEOUT_MS,
            max_resend_count: messaging::MAX_RESEND_COUNT,
            large_message_warning_threshold: messaging::LARGE_MESSAGE_WARNING_THRESHOLD,
            max_frame_size: messaging::MAX_FRAME_SIZE,
            receive_buffer_size: messaging::RECEIVE_BUFFER_SIZE,
            socket_cache_size: messaging::SOCKET_CACHE_SIZE,
            drop_expired_messages: true,
        }
    }
}

impl MessagingConfig {
    pub fn connection_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connection_retry_delay_ms)
    }

    pub fn client_drop_timeout(&self) -> Duration {
        Duration::from_secs(self.client_drop_timeout_secs)
    }

    pub fn gateway_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.gateway_cleanup_interval_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Lifetime of a reply-route cache entry.
    pub fn reply_route_ttl(&self) -> Duration {
        self.response_timeout() * gateway::REPLY_ROUTE_TTL_FACTOR
    }

    /// Messages per write: 1 unless batching is on.
    pub fn batch_size(&self) -> usize {
        if self.use_message_batching {
            self.max_message_batching_size
        } else {
            1
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.silo_sender_queues == 0 {
            bail!("messaging.silo_sender_queues must be at least 1");
        }
        if self.gateway_sender_queues == 0 {
            bail!("messaging.gateway_sender_queues must be at least 1");
        }
        if self.use_message_batching && self.max_message_batching_size == 0 {
            bail!("messaging.max_message_batching_size must be at least 1 when batching is enabled");
        }
        if self.receive_buffer_size == 0 {
            bail!("messaging.receive_buffer_size must be at least 1");
        }
        if self.max_frame_size < self.receive_buffer_size {
            bail!(
                "messaging.max_frame_size ({}) is smaller than receive_buffer_size ({})",
                self.max_frame_size,
                self.receive_buffer_size
            );
        }
        if self.socket_cache_size == 0 {
            bail!("messaging.socket_cache_size must be at least 1");
        }
        Ok(())
    }
}
