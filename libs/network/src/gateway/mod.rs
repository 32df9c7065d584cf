//! Gateway tier
//!
//! Tracks the external clients connected to this silo and the grains they
//! proxy, and routes messages for those grains to the right client.
//!
//! Three maps hold the state: clients by id, clients by connection, and
//! clients by proxied grain. Structural changes (a client connecting,
//! disconnecting or being dropped) take the gateway lock so the maps never
//! disagree; hot-path lookups read the maps without it.

mod acceptor;
mod client_state;
mod reply_cache;
mod sender;

pub use acceptor::GatewayAcceptor;
pub use client_state::ClientState;
pub use reply_cache::ReplyRouteCache;
pub use sender::{run_gateway_sender, OutgoingClientMessage};

use crate::connection::Connection;
use crate::sender::{sender_channel, SenderHandle, SenderQueue};
use crate::stats::MessagingStats;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use silo_types::{GrainId, Message, SiloAddress};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Called with a dropped client's id and the grains it was proxying.
pub type ClientDropHook = Arc<dyn Fn(GrainId, Vec<GrainId>) + Send + Sync>;

pub struct Gateway {
    address: SiloAddress,
    lock: Mutex<usize>,
    clients: DashMap<GrainId, Arc<ClientState>>,
    client_sockets: DashMap<u64, Arc<ClientState>>,
    proxied_grains: DashMap<GrainId, Arc<ClientState>>,
    reply_routes: ReplyRouteCache,
    senders: Vec<SenderHandle<OutgoingClientMessage>>,
    drop_timeout: Duration,
    drop_hook: RwLock<Option<ClientDropHook>>,
    stats: Arc<MessagingStats>,
    stopped: AtomicBool,
}

impl Gateway {
    /// Gateway for the silo at `silo`, with `senders` client sender queues.
    ///
    /// The returned queues must be handed to [`run_gateway_sender`].
    pub fn new(
        silo: SiloAddress,
        senders: usize,
        drop_timeout: Duration,
        reply_route_ttl: Duration,
        stats: Arc<MessagingStats>,
    ) -> (Self, Vec<SenderQueue<OutgoingClientMessage>>) {
        let (handles, queues): (Vec<_>, Vec<_>) = (0..senders.max(1))
            .map(|i| sender_channel(format!("GatewaySender_{}", i)))
            .unzip();

        let gateway = Self {
            address: silo.without_generation(),
            lock: Mutex::new(0),
            clients: DashMap::new(),
            client_sockets: DashMap::new(),
            proxied_grains: DashMap::new(),
            reply_routes: ReplyRouteCache::new(reply_route_ttl),
            senders: handles,
            drop_timeout,
            drop_hook: RwLock::new(None),
            stats,
            stopped: AtomicBool::new(false),
        };
        (gateway, queues)
    }

    /// Address stamped on messages handed to clients.
    pub fn address(&self) -> SiloAddress {
        self.address
    }

    pub fn set_client_drop_hook(&self, hook: ClientDropHook) {
        *self.drop_hook.write() = Some(hook);
    }

    pub fn client(&self, id: &GrainId) -> Option<Arc<ClientState>> {
        self.clients.get(id).map(|c| Arc::clone(&c))
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn is_proxying(&self, grain: &GrainId) -> bool {
        self.proxied_grains.contains_key(grain)
    }

    pub fn queued_count(&self) -> usize {
        self.senders.iter().map(SenderHandle::count).sum()
    }

    /// A client connected (or reconnected) on `connection`.
    ///
    /// A known client gets the new connection and its sender is woken to
    /// drain whatever queued up while it was away. A new client is assigned
    /// the next sender round-robin.
    pub fn record_opened_socket(&self, connection: Arc<Connection>, client: GrainId) {
        let mut next_sender = self.lock.lock();
        info!(peer = %connection.remote(), client = %client, "client connected");

        let state = match self.clients.get(&client).map(|c| Arc::clone(&c)) {
            Some(state) => {
                if let Some(old) = state.record_connection(Arc::clone(&connection)) {
                    self.client_sockets.remove(&old.key());
                }
                self.queue_request(&state, None);
                state
            }
            None => {
                let index = *next_sender % self.senders.len();
                *next_sender += 1;
                let state = Arc::new(ClientState::new(client, index));
                state.record_connection(Arc::clone(&connection));
                self.clients.insert(client, Arc::clone(&state));
                state
            }
        };
        self.client_sockets.insert(connection.key(), state);
    }

    pub fn record_closed_socket(&self, key: u64) {
        self.record_closed_socket_at(key, Instant::now());
    }

    pub fn record_closed_socket_at(&self, key: u64, now: Instant) {
        let _guard = self.lock.lock();
        if let Some((_, state)) = self.client_sockets.remove(&key) {
            if state.record_disconnection(key, now) {
                info!(client = %state.id(), "client disconnected");
            }
        }
    }

    /// Route messages for `grain` to `client`, e.g. an observer the client
    /// registered before it sent anything from it.
    pub fn record_proxied_grain(&self, grain: GrainId, client: &GrainId) {
        let _guard = self.lock.lock();
        if let Some(state) = self.clients.get(client) {
            self.proxied_grains.insert(grain, Arc::clone(&state));
        }
    }

    /// `grain` sent a message over connection `key`; replies to it go back
    /// through that connection's client.
    pub fn record_sending_proxied_grain(&self, grain: GrainId, key: u64) {
        let _guard = self.lock.lock();
        if let Some(state) = self.client_sockets.get(&key) {
            self.proxied_grains.insert(grain, Arc::clone(&state));
        }
    }

    pub fn record_unproxied_grain(&self, grain: &GrainId) {
        let _guard = self.lock.lock();
        self.proxied_grains.remove(grain);
    }

    /// Gateway to send a client-addressable object's response through, when
    /// one is cached for the target client.
    pub fn try_to_reroute(&self, msg: &Message) -> Option<SiloAddress> {
        let sender = msg.sending_grain?;
        let target = msg.target_grain?;
        if sender.is_client_addressable_object()
            && target.is_client()
            && msg.direction == silo_types::Direction::Response
        {
            return self.reply_routes.find(&target);
        }
        None
    }

    /// Remove clients disconnected for at least the drop timeout, along with
    /// every grain they proxied. Returns the dropped client ids.
    pub fn drop_disconnected_clients(&self, now: Instant) -> Vec<GrainId> {
        let dropped: Vec<(GrainId, Vec<GrainId>)> = {
            let _guard = self.lock.lock();
            let ready: Vec<Arc<ClientState>> = self
                .clients
                .iter()
                .filter(|c| c.ready_to_drop(now, self.drop_timeout))
                .map(|c| Arc::clone(&c))
                .collect();

            ready
                .into_iter()
                .map(|state| {
                    let id = state.id();
                    info!(
                        client = %id,
                        disconnected_for = ?state.disconnected_since().map(|at| now.saturating_duration_since(at)),
                        "dropping client after disconnect with no reconnect"
                    );
                    self.clients.remove(&id);
                    if let Some(connection) = state.connection() {
                        self.client_sockets.remove(&connection.key());
                    }
                    let grains: Vec<GrainId> = self
                        .proxied_grains
                        .iter()
                        .filter(|entry| entry.value().id() == id)
                        .map(|entry| *entry.key())
                        .collect();
                    for grain in &grains {
                        self.proxied_grains.remove(grain);
                    }
                    self.stats.on_client_dropped();
                    (id, grains)
                })
                .collect()
        };

        let hook = self.drop_hook.read().clone();
        dropped
            .into_iter()
            .map(|(id, grains)| {
                if let Some(hook) = &hook {
                    hook(id, grains);
                }
                id
            })
            .collect()
    }

    pub fn drop_expired_routing_cache_entries(&self, now: Instant) -> usize {
        let _guard = self.lock.lock();
        let removed = self.reply_routes.drop_expired(now);
        if removed > 0 {
            debug!(removed, "expired reply routes dropped");
        }
        removed
    }

    /// Queue `msg` for the client proxying its target grain.
    ///
    /// Hands the message back when no connected-or-pending client proxies the
    /// target.
    pub fn try_deliver_to_proxy(&self, mut msg: Message) -> Result<(), Message> {
        let Some(target) = msg.target_grain else {
            return Err(msg);
        };
        let Some(state) = self.proxied_grains.get(&target).map(|c| Arc::clone(&c)) else {
            return Err(msg);
        };

        if !self.clients.contains_key(&state.id()) {
            let _guard = self.lock.lock();
            if !self.clients.contains_key(&state.id()) {
                self.proxied_grains.remove(&target);
                return Err(msg);
            }
        }

        if let (Some(sender), Some(silo)) = (msg.sending_grain, msg.sending_silo) {
            if sender.is_client() && target.is_client_addressable_object() {
                self.reply_routes.record(sender, silo);
            }
        }

        msg.target_silo = None;
        msg.sending_silo = Some(self.address);
        self.stats.on_gateway_routed();
        self.queue_request(&state, Some(msg));
        Ok(())
    }

    fn queue_request(&self, state: &ClientState, msg: Option<Message>) {
        if self.stopped.load(Ordering::Acquire) {
            if let Some(msg) = msg {
                debug!(message = %msg, "gateway stopped, dropping client message");
                self.stats.on_dropped();
            }
            return;
        }
        let item = OutgoingClientMessage {
            client: state.id(),
            msg,
        };
        if let Err(item) = self.senders[state.sender_index()].queue(item) {
            if let Some(msg) = item.msg {
                debug!(message = %msg, "gateway sender gone, dropping client message");
                self.stats.on_dropped();
            }
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_types::{Category, Direction, GrainKind};
    use tokio::net::{TcpListener, TcpStream};

    fn gateway(senders: usize) -> (Gateway, Vec<SenderQueue<OutgoingClientMessage>>) {
        Gateway::new(
            SiloAddress::new("127.0.0.1:30000".parse().unwrap(), 9),
            senders,
            Duration::from_secs(60),
            Duration::from_secs(150),
            Arc::new(MessagingStats::new()),
        )
    }

    async fn connection(client: GrainId) -> Arc<Connection> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();
        let (_, writer) = stream.into_split();
        Arc::new(Connection::new(addr, client.key, writer))
    }

    fn request_to(grain: GrainId) -> Message {
        Message::new(Category::Application, Direction::Request)
            .with_target(Some(SiloAddress::new("127.0.0.1:11111".parse().unwrap(), 3)), grain)
    }

    #[tokio::test]
    async fn clients_are_assigned_round_robin() {
        let (gateway, _queues) = gateway(2);
        let ids: Vec<GrainId> = (0..3).map(|_| GrainId::random(GrainKind::Client)).collect();
        for id in &ids {
            gateway.record_opened_socket(connection(*id).await, *id);
        }
        let indexes: Vec<usize> = ids
            .iter()
            .map(|id| gateway.client(id).unwrap().sender_index())
            .collect();
        assert_eq!(indexes, vec![0, 1, 0]);
    }

    #[tokio::test]
    async fn delivery_rewrites_addresses() {
        let (gateway, mut queues) = gateway(1);
        let client = GrainId::random(GrainKind::Client);
        gateway.record_opened_socket(connection(client).await, client);
        gateway.record_proxied_grain(client, &client);

        gateway.try_deliver_to_proxy(request_to(client)).unwrap();
        let item = queues[0].try_next().unwrap();
        let msg = item.msg.unwrap();
        assert_eq!(item.client, client);
        assert!(msg.target_silo.is_none());
        assert_eq!(msg.sending_silo.unwrap().generation, 0);

        let stranger = GrainId::random(GrainKind::Grain);
        assert!(gateway.try_deliver_to_proxy(request_to(stranger)).is_err());
    }

    #[tokio::test]
    async fn reconnect_replaces_socket_and_wakes_sender() {
        let (gateway, mut queues) = gateway(1);
        let client = GrainId::random(GrainKind::Client);
        let first = connection(client).await;
        gateway.record_opened_socket(Arc::clone(&first), client);
        gateway.record_closed_socket(first.key());
        assert!(!gateway.client(&client).unwrap().is_connected());

        let second = connection(client).await;
        gateway.record_opened_socket(Arc::clone(&second), client);
        let wake = queues[0].try_next().unwrap();
        assert!(wake.msg.is_none());
        assert_eq!(
            gateway.client(&client).unwrap().connection().unwrap().key(),
            second.key()
        );
    }

    #[tokio::test]
    async fn dropping_a_client_removes_its_grains() {
        let (gateway, _queues) = gateway(1);
        let client = GrainId::random(GrainKind::Client);
        let observer = GrainId::random(GrainKind::ClientAddressableObject);
        let conn = connection(client).await;
        gateway.record_opened_socket(Arc::clone(&conn), client);
        gateway.record_sending_proxied_grain(observer, conn.key());
        assert!(gateway.is_proxying(&observer));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        gateway.set_client_drop_hook(Arc::new(move |id, grains| sink.lock().push((id, grains))));

        let closed_at = Instant::now();
        gateway.record_closed_socket_at(conn.key(), closed_at);
        assert!(gateway
            .drop_disconnected_clients(closed_at + Duration::from_secs(10))
            .is_empty());

        let dropped = gateway.drop_disconnected_clients(closed_at + Duration::from_secs(61));
        assert_eq!(dropped, vec![client]);
        assert!(!gateway.is_proxying(&observer));
        assert_eq!(gateway.client_count(), 0);
        assert_eq!(seen.lock().as_slice(), &[(client, vec![observer])]);
    }
}
