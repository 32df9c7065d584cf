//! Directory boundary
//!
//! The transport only needs four answers from placement: where a grain lives,
//! which gateway fronts another cluster, whether a silo is known dead, and a
//! way to drop routes that keep failing.

use dashmap::{DashMap, DashSet};
use silo_config::ClusterConfig;
use silo_types::{GrainId, SiloAddress};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

pub trait GrainDirectory: Send + Sync {
    /// Called when sends to `target` keep failing.
    fn invalidate_cached_route(&self, target: &SiloAddress);

    /// Gateway silo of `cluster_id`.
    fn resolve_gateway(&self, cluster_id: i32) -> Option<SiloAddress>;

    fn is_silo_dead(&self, silo: &SiloAddress) -> bool;

    fn lookup_grain(&self, grain: &GrainId) -> Option<SiloAddress>;
}

/// Directory backed by configuration plus explicit registrations.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    gateways: DashMap<i32, SiloAddress>,
    grains: DashMap<GrainId, SiloAddress>,
    dead: DashSet<SiloAddress>,
    invalidations: AtomicU64,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ClusterConfig) -> Self {
        let directory = Self::new();
        for gateway in &config.gateways {
            directory.set_gateway(SiloAddress::with_cluster(
                gateway.address,
                gateway.generation,
                gateway.cluster_id,
            ));
        }
        directory
    }

    pub fn set_gateway(&self, gateway: SiloAddress) {
        self.gateways.insert(gateway.cluster_id, gateway);
    }

    pub fn register(&self, grain: GrainId, silo: SiloAddress) {
        self.grains.insert(grain, silo);
    }

    pub fn unregister(&self, grain: &GrainId) -> Option<SiloAddress> {
        self.grains.remove(grain).map(|(_, silo)| silo)
    }

    pub fn mark_dead(&self, silo: SiloAddress) {
        self.dead.insert(silo);
    }

    pub fn invalidation_count(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }
}

impl GrainDirectory for StaticDirectory {
    fn invalidate_cached_route(&self, target: &SiloAddress) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        debug!(target = %target, "route invalidated");
    }

    fn resolve_gateway(&self, cluster_id: i32) -> Option<SiloAddress> {
        self.gateways.get(&cluster_id).map(|g| *g)
    }

    fn is_silo_dead(&self, silo: &SiloAddress) -> bool {
        self.dead.iter().any(|dead| dead.matches(silo))
    }

    fn lookup_grain(&self, grain: &GrainId) -> Option<SiloAddress> {
        self.grains.get(grain).map(|s| *s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_config::ClusterGateway;
    use silo_types::GrainKind;

    #[test]
    fn gateways_come_from_config() {
        let config = ClusterConfig {
            cluster_id: 0,
            gateways: vec![ClusterGateway {
                cluster_id: 2,
                address: "10.2.0.1:30000".parse().unwrap(),
                generation: 7,
            }],
            ..ClusterConfig::default()
        };
        let directory = StaticDirectory::from_config(&config);
        let gateway = directory.resolve_gateway(2).unwrap();
        assert_eq!(gateway.cluster_id, 2);
        assert_eq!(gateway.generation, 7);
        assert!(directory.resolve_gateway(3).is_none());
    }

    #[test]
    fn dead_silos_match_any_generation() {
        let directory = StaticDirectory::new();
        let silo = SiloAddress::new("10.0.0.1:11111".parse().unwrap(), 42);
        directory.mark_dead(silo);
        assert!(directory.is_silo_dead(&silo));
        assert!(directory.is_silo_dead(&silo.without_generation()));
        assert!(!directory.is_silo_dead(&SiloAddress::new("10.0.0.2:11111".parse().unwrap(), 42)));
    }

    #[test]
    fn grain_registration() {
        let directory = StaticDirectory::new();
        let grain = GrainId::random(GrainKind::Grain);
        let silo = SiloAddress::new("10.0.0.1:11111".parse().unwrap(), 1);
        assert!(directory.lookup_grain(&grain).is_none());
        directory.register(grain, silo);
        assert_eq!(directory.lookup_grain(&grain), Some(silo));
        directory.invalidate_cached_route(&silo);
        assert_eq!(directory.invalidation_count(), 1);
        assert_eq!(directory.unregister(&grain), Some(silo));
    }
}
