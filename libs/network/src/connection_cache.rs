//! Outgoing connection cache
//!
//! Sender agents never open sockets themselves: they ask the cache for a
//! connection to an endpoint and invalidate the entry when a send fails. The
//! cache serializes creation per endpoint so two agents racing for the same
//! endpoint end up sharing one socket, while a slow connect to one endpoint
//! never holds up the others.

use crate::connection::{write_handshake, Connection, DIRECT_CONNECTION_ID};
use crate::error::{Result, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::{debug, info, trace};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait ConnectionCache: Send + Sync {
    /// Cached connection to `target`, connecting when none is usable.
    async fn get_connection(&self, target: SocketAddr) -> Result<Arc<Connection>>;

    /// Drop and close the cached connection to `target`, if any.
    async fn invalidate(&self, target: SocketAddr);

    async fn close_all(&self);
}

/// Cache entry of one endpoint.
///
/// The async mutex is held while connecting, so it serializes creation for
/// this endpoint only. An entry removed from the map is marked retired; a
/// caller that reaches a retired entry starts over with a fresh one.
#[derive(Default)]
struct Slot {
    connection: tokio::sync::Mutex<Option<Arc<Connection>>>,
    last_used: AtomicU64,
    retired: AtomicBool,
}

impl Slot {
    async fn retire(&self) {
        self.retired.store(true, Ordering::Release);
        if let Some(connection) = self.connection.lock().await.take() {
            connection.close().await;
        }
    }
}

#[derive(Default)]
struct CacheState {
    slots: HashMap<SocketAddr, Arc<Slot>>,
    tick: u64,
}

/// LRU cache of silo-to-silo TCP connections.
pub struct TcpConnectionCache {
    state: Mutex<CacheState>,
    capacity: usize,
}

impl TcpConnectionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            capacity: capacity.max(1),
        }
    }

    /// Number of endpoints with an entry.
    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry for `target`, creating it when missing, plus the entry evicted
    /// to make room for it.
    fn slot(&self, target: SocketAddr) -> (Arc<Slot>, Option<(SocketAddr, Arc<Slot>)>) {
        let mut state = self.state.lock();
        state.tick += 1;
        let tick = state.tick;

        if let Some(slot) = state.slots.get(&target) {
            slot.last_used.store(tick, Ordering::Relaxed);
            return (Arc::clone(slot), None);
        }

        let mut evicted = None;
        if state.slots.len() >= self.capacity {
            let oldest = state
                .slots
                .iter()
                .min_by_key(|(_, slot)| slot.last_used.load(Ordering::Relaxed))
                .map(|(addr, _)| *addr);
            if let Some(addr) = oldest {
                evicted = state.slots.remove(&addr).map(|slot| (addr, slot));
            }
        }

        let slot = Arc::new(Slot::default());
        slot.last_used.store(tick, Ordering::Relaxed);
        state.slots.insert(target, Arc::clone(&slot));
        (slot, evicted)
    }

    async fn connect(target: SocketAddr) -> Result<Arc<Connection>> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(target))
            .await
            .map_err(|_| TransportError::connection("connect timed out", Some(target)))?
            .map_err(|e| TransportError::connection_with_source("connect failed", Some(target), e))?;

        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::io("set TCP_NODELAY", e))?;

        let (mut reader, mut writer) = stream.into_split();
        write_handshake(&mut writer, DIRECT_CONNECTION_ID)
            .await
            .map_err(|e| TransportError::connection_with_source("handshake failed", Some(target), e))?;

        let connection = Arc::new(Connection::new(target, DIRECT_CONNECTION_ID, writer));

        // Outgoing silo connections are write-only; the read side only
        // observes the peer closing.
        let watched = Arc::clone(&connection);
        tokio::spawn(async move {
            let mut scratch = [0u8; 64];
            loop {
                match reader.read(&mut scratch).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
            watched.mark_disconnected();
            trace!(peer = %target, "outgoing connection closed by peer");
        });

        info!(peer = %target, "opened silo connection");
        Ok(connection)
    }
}

#[async_trait]
impl ConnectionCache for TcpConnectionCache {
    async fn get_connection(&self, target: SocketAddr) -> Result<Arc<Connection>> {
        loop {
            let (slot, evicted) = self.slot(target);
            if let Some((addr, evicted)) = evicted {
                debug!(peer = %addr, "evicting least recently used connection");
                evicted.retire().await;
            }

            let mut current = slot.connection.lock().await;
            if slot.retired.load(Ordering::Acquire) {
                continue;
            }
            if let Some(connection) = current.as_ref() {
                if connection.is_connected() {
                    return Ok(Arc::clone(connection));
                }
            }
            if let Some(stale) = current.take() {
                debug!(peer = %target, "replacing disconnected cached connection");
                stale.close().await;
            }

            let connection = Self::connect(target).await?;
            *current = Some(Arc::clone(&connection));
            return Ok(connection);
        }
    }

    async fn invalidate(&self, target: SocketAddr) {
        let removed = self.state.lock().slots.remove(&target);
        if let Some(slot) = removed {
            debug!(peer = %target, "invalidated cached connection");
            slot.retire().await;
        }
    }

    async fn close_all(&self) {
        let slots: Vec<_> = self.state.lock().slots.drain().collect();
        for (_, slot) in slots {
            slot.retire().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::read_handshake;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn connection_is_reused_and_handshakes() {
        let (listener, addr) = listener().await;
        let cache = TcpConnectionCache::new(4);

        let first = cache.get_connection(addr).await.unwrap();
        let (mut socket, _) = listener.accept().await.unwrap();
        assert_eq!(read_handshake(&mut socket).await.unwrap(), DIRECT_CONNECTION_ID);

        let second = cache.get_connection(addr).await.unwrap();
        assert_eq!(first.key(), second.key());

        cache.invalidate(addr).await;
        assert!(!first.is_connected());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn least_recently_used_is_evicted() {
        let (_l1, a) = listener().await;
        let (_l2, b) = listener().await;
        let (_l3, c) = listener().await;
        let cache = TcpConnectionCache::new(2);

        let conn_a = cache.get_connection(a).await.unwrap();
        cache.get_connection(b).await.unwrap();
        cache.get_connection(c).await.unwrap();

        assert_eq!(cache.len(), 2);
        assert!(!conn_a.is_connected());
    }

    #[tokio::test]
    async fn refused_connection_is_an_error() {
        let (listener, addr) = listener().await;
        drop(listener);
        let cache = TcpConnectionCache::new(2);
        let err = cache.get_connection(addr).await.unwrap_err();
        assert!(matches!(err, TransportError::Connection { .. }));
    }

    #[tokio::test]
    async fn pending_connect_only_blocks_its_own_endpoint() {
        let (_slow_listener, slow) = listener().await;
        let (_live_listener, live) = listener().await;
        let cache = TcpConnectionCache::new(4);

        // Stand in for a connect to `slow` that has not completed yet.
        let (slot, _) = cache.slot(slow);
        let in_flight = slot.connection.lock().await;

        let connection = tokio::time::timeout(Duration::from_secs(1), cache.get_connection(live))
            .await
            .expect("connect to a live endpoint waited on another endpoint")
            .unwrap();
        assert!(connection.is_connected());

        let blocked = tokio::time::timeout(Duration::from_millis(100), cache.get_connection(slow)).await;
        assert!(blocked.is_err());

        drop(in_flight);
        let connection = cache.get_connection(slow).await.unwrap();
        assert_eq!(connection.remote(), slow);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_connection() {
        let (listener, addr) = listener().await;
        let cache = Arc::new(TcpConnectionCache::new(4));

        let callers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.get_connection(addr).await.unwrap().key() })
            })
            .collect();
        let (mut socket, _) = listener.accept().await.unwrap();
        read_handshake(&mut socket).await.unwrap();

        let mut keys = Vec::new();
        for caller in callers {
            keys.push(caller.await.unwrap());
        }
        keys.dedup();
        assert_eq!(keys.len(), 1);
    }

    #[tokio::test]
    async fn invalidated_endpoint_reconnects() {
        let (_listener, addr) = listener().await;
        let cache = TcpConnectionCache::new(4);

        let first = cache.get_connection(addr).await.unwrap();
        cache.invalidate(addr).await;
        assert!(!first.is_connected());
        assert!(cache.is_empty());

        let second = cache.get_connection(addr).await.unwrap();
        assert_ne!(first.key(), second.key());
        cache.close_all().await;
        assert!(!second.is_connected());
    }
}
