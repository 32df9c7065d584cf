use super::{handle_serialization_failure, retry_or_fail, OutgoingMessageSender, Prepared};
use crate::connection::Connection;
use crate::error::SendFailure;
use crate::message_center::MessageCenter;
use crate::stats::MessagePhase;
use async_trait::async_trait;
use dashmap::DashMap;
use silo_codec::CodecError;
use silo_types::{Message, SiloAddress};
use std::sync::Arc;
use std::time::Instant;
use tracing::{trace, warn};

/// Sender for ping, system and application traffic between silos of one
/// cluster.
///
/// Remembers when connecting to a target last failed and vetoes further sends
/// to it until the connection retry delay has passed. Resends of a message
/// that already failed are not vetoed; they are bounded by its retry count.
pub struct SiloMessageSender {
    name: String,
    center: Arc<MessageCenter>,
    last_connection_failure: DashMap<SiloAddress, Instant>,
}

impl SiloMessageSender {
    pub fn new(name: impl Into<String>, center: Arc<MessageCenter>) -> Self {
        Self {
            name: name.into(),
            center,
            last_connection_failure: DashMap::new(),
        }
    }
}

#[async_trait]
impl OutgoingMessageSender for SiloMessageSender {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&self, mut msg: Message) -> Prepared {
        if msg.is_expired() {
            trace!(message = %msg, "dropping expired message before send");
            self.center.stats().on_expired(MessagePhase::Send);
            return Prepared::Handled;
        }

        if msg.sending_silo.is_none() {
            msg.sending_silo = Some(self.center.my_address());
        }

        let Some(target) = msg.target_silo else {
            return Prepared::Failed(msg, SendFailure::MissingTarget);
        };

        if self.center.directory().is_silo_dead(&target) {
            return Prepared::Failed(msg, SendFailure::TargetDead(target));
        }

        let failed_at = if msg.retry_count() == 0 {
            self.last_connection_failure.get(&target).map(|t| *t)
        } else {
            None
        };
        if let Some(failed_at) = failed_at {
            let since = failed_at.elapsed();
            let window = self.center.messaging_config().connection_retry_delay();
            if since < window {
                let retry_in_ms = (window - since).as_millis() as u64;
                return Prepared::Failed(
                    msg,
                    SendFailure::RecentConnectionFailure {
                        target: target.endpoint,
                        retry_in_ms,
                    },
                );
            }
        }

        Prepared::Ready(msg)
    }

    async fn connect(&self, msg: &Message) -> Result<Arc<Connection>, SendFailure> {
        let target = msg.target_silo.ok_or(SendFailure::MissingTarget)?;
        let connections = self.center.connections();

        let connection = match connections.get_connection(target.endpoint).await {
            Ok(connection) if connection.is_connected() => Ok(connection),
            Ok(_) => {
                connections.invalidate(target.endpoint).await;
                connections.get_connection(target.endpoint).await
            }
            Err(e) => Err(e),
        };

        connection.map_err(|e| {
            warn!(agent = %self.name, target = %target, error = %e, "unable to get a sending connection");
            self.last_connection_failure.insert(target, Instant::now());
            SendFailure::Connect {
                target: target.endpoint,
                reason: e.to_string(),
            }
        })
    }

    async fn on_send_failure(&self, msgs: Vec<Message>, failure: SendFailure) {
        match &failure {
            SendFailure::Connect { target, .. }
            | SendFailure::Write { target, .. }
            | SendFailure::ShortWrite { target, .. } => {
                self.center.connections().invalidate(*target).await;
            }
            _ => {}
        }

        for msg in msgs {
            retry_or_fail(&self.center, msg, &failure);
        }
    }

    fn on_serialization_failure(&self, msg: Message, error: &CodecError) {
        handle_serialization_failure(&self.center, msg, error);
    }
}
