use super::{handle_serialization_failure, retry_or_fail, OutgoingMessageSender, Prepared};
use crate::connection::Connection;
use crate::error::SendFailure;
use crate::message_center::MessageCenter;
use crate::stats::MessagePhase;
use async_trait::async_trait;
use silo_codec::CodecError;
use silo_types::Message;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Sender for messages whose target lives in another cluster.
///
/// The message is readdressed to the destination cluster's gateway and
/// flagged for rerouting; the gateway forwards it to the owning silo.
pub struct ClusterMessageSender {
    name: String,
    center: Arc<MessageCenter>,
}

impl ClusterMessageSender {
    pub fn new(name: impl Into<String>, center: Arc<MessageCenter>) -> Self {
        Self {
            name: name.into(),
            center,
        }
    }
}

#[async_trait]
impl OutgoingMessageSender for ClusterMessageSender {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&self, mut msg: Message) -> Prepared {
        if msg.is_expired() {
            trace!(message = %msg, "dropping expired cross-cluster message");
            self.center.stats().on_expired(MessagePhase::Send);
            return Prepared::Handled;
        }

        let me = self.center.my_address();
        let sender = msg.sending_silo.unwrap_or(me);
        if !sender.has_cluster() {
            return Prepared::Failed(msg, SendFailure::ClusterNotConfigured(sender));
        }
        if !me.has_cluster() {
            return Prepared::Failed(msg, SendFailure::ClusterNotConfigured(me));
        }
        msg.sending_silo = Some(sender);

        let Some(target) = msg.target_silo else {
            return Prepared::Failed(msg, SendFailure::MissingTarget);
        };
        let Some(gateway) = self.center.directory().resolve_gateway(target.cluster_id) else {
            return Prepared::Failed(msg, SendFailure::NoGatewayForCluster(target.cluster_id));
        };

        debug!(message = %msg, gateway = %gateway, "routing through cluster gateway");
        msg.target_silo = Some(gateway);
        msg.set_rerouting_requested();
        Prepared::Ready(msg)
    }

    async fn connect(&self, msg: &Message) -> Result<Arc<Connection>, SendFailure> {
        let target = msg.target_silo.ok_or(SendFailure::MissingTarget)?;
        self.center
            .connections()
            .get_connection(target.endpoint)
            .await
            .map_err(|e| {
                warn!(agent = %self.name, gateway = %target, error = %e, "unable to reach cluster gateway");
                SendFailure::Connect {
                    target: target.endpoint,
                    reason: e.to_string(),
                }
            })
    }

    async fn on_send_failure(&self, msgs: Vec<Message>, failure: SendFailure) {
        if let SendFailure::Connect { target, .. }
        | SendFailure::Write { target, .. }
        | SendFailure::ShortWrite { target, .. } = &failure
        {
            self.center.connections().invalidate(*target).await;
        }
        for msg in msgs {
            retry_or_fail(&self.center, msg, &failure);
        }
    }

    fn on_serialization_failure(&self, msg: Message, error: &CodecError) {
        handle_serialization_failure(&self.center, msg, error);
    }
}
