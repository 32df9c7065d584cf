use crate::acceptor::AcceptorRole;
use crate::connection::{Connection, ConnectionId, DIRECT_CONNECTION_ID};
use crate::error::{Result, TransportError};
use crate::message_center::MessageCenter;
use crate::stats::MessagePhase;
use silo_types::{Direction, GrainId, Message, RejectionType};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace};

/// Client-facing acceptor role.
///
/// Every message from a client is rerouted: the gateway stamps itself as
/// the sending silo and lets the directory (or the reply-route cache) pick
/// the destination.
pub struct GatewayAcceptor {
    center: Arc<MessageCenter>,
}

impl GatewayAcceptor {
    pub fn new(center: Arc<MessageCenter>) -> Self {
        Self { center }
    }
}

impl AcceptorRole for GatewayAcceptor {
    fn name(&self) -> &'static str {
        "gateway"
    }

    fn validate_peer(&self, remote: SocketAddr, peer_id: ConnectionId) -> Result<()> {
        if peer_id == DIRECT_CONNECTION_ID || peer_id.is_nil() {
            return Err(TransportError::handshake(
                remote,
                peer_id,
                "gateway connections must carry a client id",
            ));
        }
        Ok(())
    }

    fn on_socket_opened(&self, connection: &Arc<Connection>) {
        if let Some(gateway) = self.center.gateway() {
            gateway.record_opened_socket(Arc::clone(connection), GrainId::client(connection.peer_id()));
        }
    }

    fn on_socket_closed(&self, connection: &Arc<Connection>) {
        if let Some(gateway) = self.center.gateway() {
            gateway.record_closed_socket(connection.key());
        }
    }

    fn handle_message(&self, mut msg: Message, connection: &Arc<Connection>) {
        let center = &self.center;
        let Some(gateway) = center.gateway() else {
            return;
        };

        if msg.is_expired() {
            trace!(message = %msg, "dropping expired client message");
            center.stats().on_expired(MessagePhase::Receive);
            return;
        }

        if let Some(sender) = msg.sending_grain {
            gateway.record_sending_proxied_grain(sender, connection.key());
        }

        if msg.is_ping() {
            let mut response = msg.create_response();
            if response.target_grain.is_none() {
                let client = GrainId::client(connection.peer_id());
                gateway.record_sending_proxied_grain(client, connection.key());
                response.target_grain = Some(client);
            }
            trace!(message = %msg, "answering client ping");
            if let Err(response) = gateway.try_deliver_to_proxy(response) {
                debug!(message = %response, "no client route for ping response");
                center.stats().on_dropped();
            }
            return;
        }

        if center.is_overloaded() {
            center.stats().on_load_shed();
            if msg.direction == Direction::Request {
                debug!(message = %msg, "rejecting a request due to overloading");
                center.stats().on_rejection_sent();
                let rejection = msg.create_rejection(RejectionType::GatewayTooBusy, "Shedding load");
                if let Err(rejection) = gateway.try_deliver_to_proxy(rejection) {
                    debug!(message = %rejection, "no client route for load-shed rejection");
                    center.stats().on_dropped();
                }
            } else {
                center.stats().on_dropped();
            }
            return;
        }

        let route = gateway.try_to_reroute(&msg);
        let me = center.my_address();
        msg.sending_silo = Some(me);

        match route {
            Some(gateway_silo) => {
                trace!(message = %msg, gateway = %gateway_silo, "replying through cached client route");
                msg.target_silo = Some(gateway_silo);
                center.send_message(msg);
            }
            None => {
                msg.target_silo = None;
                msg.target_activation = None;
                if msg.target_grain.map_or(false, |g| g.is_system_target()) {
                    msg.target_silo = Some(me);
                }
                center.stats().on_rerouted();
                center.reroute(msg);
            }
        }
    }
}
