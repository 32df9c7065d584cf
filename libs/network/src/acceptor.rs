//! Incoming connection acceptors
//!
//! [`run_acceptor`] owns a listener: it accepts sockets, validates the
//! handshake, and runs one receive loop per connection. What happens to each
//! decoded message is decided by the [`AcceptorRole`]: the silo role here, or
//! the gateway role in [`crate::gateway`].

use crate::connection::{read_handshake, receive_messages, Connection, ConnectionId, DIRECT_CONNECTION_ID};
use crate::error::{Result, TransportError};
use crate::message_center::MessageCenter;
use crate::shutdown::ShutdownSignal;
use crate::stats::MessagePhase;
use dashmap::DashMap;
use silo_types::{header, Category, Direction, GrainId, Message, RejectionType};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, trace, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub trait AcceptorRole: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Check the id a peer sent in the handshake.
    fn validate_peer(&self, remote: SocketAddr, peer_id: ConnectionId) -> Result<()>;

    fn on_socket_opened(&self, _connection: &Arc<Connection>) {}

    fn on_socket_closed(&self, _connection: &Arc<Connection>) {}

    fn handle_message(&self, msg: Message, connection: &Arc<Connection>);
}

/// Accept connections on `listener` until `shutdown` fires.
pub async fn run_acceptor<R: AcceptorRole>(
    listener: TcpListener,
    role: Arc<R>,
    center: Arc<MessageCenter>,
    mut shutdown: ShutdownSignal,
) {
    let local = listener.local_addr().ok();
    info!(acceptor = role.name(), listen = ?local, "acceptor started");
    let open: Arc<DashMap<u64, Arc<Connection>>> = Arc::new(DashMap::new());

    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, remote)) => {
                let role = Arc::clone(&role);
                let center = Arc::clone(&center);
                let open = Arc::clone(&open);
                let signal = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, remote, role.as_ref(), &center, &open, signal).await {
                        debug!(peer = %remote, error = %e, "connection ended with error");
                    }
                });
            }
            Err(e) => {
                warn!(acceptor = role.name(), error = %e, "accept failed");
            }
        }
    }

    let remaining: Vec<Arc<Connection>> = open.iter().map(|c| Arc::clone(c.value())).collect();
    for connection in remaining {
        connection.close().await;
    }
    info!(acceptor = role.name(), "acceptor stopped");
}

async fn serve_connection<R: AcceptorRole>(
    stream: TcpStream,
    remote: SocketAddr,
    role: &R,
    center: &MessageCenter,
    open: &DashMap<u64, Arc<Connection>>,
    shutdown: ShutdownSignal,
) -> Result<()> {
    stream
        .set_nodelay(true)
        .map_err(|e| TransportError::io("set TCP_NODELAY", e))?;
    let (mut reader, writer) = stream.into_split();

    let peer_id = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_handshake(&mut reader))
        .await
        .map_err(|_| TransportError::connection("handshake timed out", Some(remote)))?
        .map_err(|e| TransportError::connection_with_source("handshake read failed", Some(remote), e))?;
    role.validate_peer(remote, peer_id)?;

    let connection = Arc::new(Connection::new(remote, peer_id, writer));
    open.insert(connection.key(), Arc::clone(&connection));
    center.stats().on_connection_opened();
    role.on_socket_opened(&connection);
    debug!(acceptor = role.name(), peer = %remote, peer_id = %peer_id, "accepted connection");

    let result = receive_messages(
        reader,
        remote,
        center.receive_settings(),
        center.codec().as_ref(),
        center.stats(),
        shutdown,
        |msg| role.handle_message(msg, &connection),
    )
    .await;

    open.remove(&connection.key());
    role.on_socket_closed(&connection);
    connection.close().await;
    center.stats().on_connection_closed();
    debug!(acceptor = role.name(), peer = %remote, "connection closed");
    result
}

/// Silo-to-silo acceptor role.
pub struct SiloAcceptor {
    center: Arc<MessageCenter>,
}

impl SiloAcceptor {
    pub fn new(center: Arc<MessageCenter>) -> Self {
        Self { center }
    }
}

impl AcceptorRole for SiloAcceptor {
    fn name(&self) -> &'static str {
        "silo"
    }

    fn validate_peer(&self, remote: SocketAddr, peer_id: ConnectionId) -> Result<()> {
        if peer_id != DIRECT_CONNECTION_ID {
            return Err(TransportError::handshake(
                remote,
                peer_id,
                "silo endpoint only accepts direct silo connections",
            ));
        }
        Ok(())
    }

    fn handle_message(&self, mut msg: Message, _connection: &Arc<Connection>) {
        let center = &self.center;
        let me = center.my_address();

        if msg.is_ping() {
            match msg.target_silo {
                Some(target) if !target.matches(&me) => {
                    let reason = format!(
                        "The target silo is no longer active: target was {}, but this silo is {}. The rejected ping message is {}.",
                        target, me, msg
                    );
                    debug!(message = %msg, "rejecting ping for another silo incarnation");
                    center.stats().on_rejection_sent();
                    center.send_message(msg.create_rejection(RejectionType::FutureTransient, reason));
                }
                _ => {
                    trace!(message = %msg, "answering ping");
                    center.send_message(msg.create_response());
                }
            }
            return;
        }

        center.run_sniff_hook(&msg);

        if msg.is_expired() {
            trace!(message = %msg, "dropping expired message on receive");
            center.stats().on_expired(MessagePhase::Receive);
            return;
        }

        if center.is_blocking_application_messages()
            && msg.category == Category::Application
            && msg.sending_grain != Some(GrainId::membership_table())
        {
            if msg.direction == Direction::Request {
                debug!(message = %msg, "rejecting application request while stopping");
                center.stats().on_rejection_sent();
                center.send_message(msg.create_rejection(RejectionType::Unrecoverable, "Silo stopping"));
            } else {
                debug!(message = %msg, "dropping application message while stopping");
                center.stats().on_dropped();
            }
            return;
        }

        if msg.is_rerouting_requested() {
            msg.remove_header(header::REROUTING_REQUESTED);
            msg.target_silo = None;
            center.stats().on_rerouted();
            center.reroute(msg);
            return;
        }

        match msg.target_silo {
            Some(target) if !target.matches(&me) && target.endpoint != me.endpoint => {
                trace!(message = %msg, "forwarding message addressed to another silo");
                center.send_message(msg);
            }
            Some(target) if !target.matches(&me) => {
                if msg.direction == Direction::Request {
                    let reason = format!(
                        "The target silo is no longer active: target was {}, but this silo is {}.",
                        target, me
                    );
                    center.stats().on_rejection_sent();
                    center.send_message(msg.create_rejection(RejectionType::FutureTransient, reason));
                } else {
                    debug!(message = %msg, "dropping message for an older incarnation of this silo");
                    center.stats().on_dropped();
                }
            }
            _ => center.deliver_locally(msg),
        }
    }
}
