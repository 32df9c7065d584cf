use dashmap::DashMap;
use silo_types::{GrainId, SiloAddress};
use std::time::{Duration, Instant};

/// Gateway through which a client last reached this silo, used to send
/// replies from client-addressable objects straight back.
///
/// Entries expire after a fixed lifetime; an expired or missing entry means
/// the reply is routed through the directory like any other message.
#[derive(Debug)]
pub struct ReplyRouteCache {
    routes: DashMap<GrainId, (SiloAddress, Instant)>,
    ttl: Duration,
}

impl ReplyRouteCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            routes: DashMap::new(),
            ttl,
        }
    }

    pub fn record(&self, client: GrainId, gateway: SiloAddress) {
        self.routes.insert(client, (gateway, Instant::now()));
    }

    pub fn find(&self, client: &GrainId) -> Option<SiloAddress> {
        self.find_at(client, Instant::now())
    }

    pub fn find_at(&self, client: &GrainId, now: Instant) -> Option<SiloAddress> {
        let entry = self.routes.get(client)?;
        let (gateway, recorded) = *entry;
        (now.saturating_duration_since(recorded) < self.ttl).then_some(gateway)
    }

    /// Remove entries older than the lifetime; returns how many were removed.
    pub fn drop_expired(&self, now: Instant) -> usize {
        let before = self.routes.len();
        self.routes
            .retain(|_, (_, recorded)| now.saturating_duration_since(*recorded) < self.ttl);
        before - self.routes.len()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
