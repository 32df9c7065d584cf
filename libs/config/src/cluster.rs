//! Multi-cluster configuration
//!
//! Each cluster exposes one gateway that other clusters send to, and every
//! ordered pair of clusters may carry an artificial WAN delay used to emulate
//! geo-distributed deployments.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

/// Cluster id for nodes that are not part of a multi-cluster deployment.
pub const UNSET_CLUSTER_ID: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterGateway {
    pub cluster_id: i32,
    pub address: SocketAddr,
    #[serde(default)]
    pub generation: i32,
}

/// One directed entry of the WAN delay matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WanLink {
    pub from: i32,
    pub to: i32,
    pub delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub cluster_id: i32,
    pub cluster_messaging_enabled: bool,
    pub gateways: Vec<ClusterGateway>,
    pub wan_delays: Vec<WanLink>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_id: UNSET_CLUSTER_ID,
            cluster_messaging_enabled: true,
            gateways: Vec::new(),
            wan_delays: Vec::new(),
        }
    }
}

impl ClusterConfig {
    pub fn gateway(&self, cluster_id: i32) -> Option<&ClusterGateway> {
        self.gateways.iter().find(|g| g.cluster_id == cluster_id)
    }

    /// Delay applied to messages from `from` to `to`; zero when not configured.
    pub fn wan_delay(&self, from: i32, to: i32) -> Duration {
        self.wan_delays
            .iter()
            .find(|link| link.from == from && link.to == to)
            .map(|link| Duration::from_millis(link.delay_ms))
            .unwrap_or(Duration::ZERO)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster_id < UNSET_CLUSTER_ID {
            bail!("cluster.cluster_id {} is not a valid cluster id", self.cluster_id);
        }
        let mut seen = HashSet::new();
        for gateway in &self.gateways {
            if gateway.cluster_id < 0 {
                bail!("cluster gateway {} has no cluster id", gateway.address);
            }
            if !seen.insert(gateway.cluster_id) {
                bail!("cluster {} has more than one gateway configured", gateway.cluster_id);
            }
        }
        for link in &self.wan_delays {
            if link.from < UNSET_CLUSTER_ID || link.to < UNSET_CLUSTER_ID {
                bail!("wan delay {} -> {} references an invalid cluster id", link.from, link.to);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClusterConfig {
        ClusterConfig {
            cluster_id: 0,
            cluster_messaging_enabled: true,
            gateways: vec![
                ClusterGateway {
                    cluster_id: 0,
                    address: "10.0.0.1:30000".parse().unwrap(),
                    generation: 0,
                },
                ClusterGateway {
                    cluster_id: 1,
                    address: "10.1.0.1:30000".parse().unwrap(),
                    generation: 0,
                },
            ],
            wan_delays: vec![WanLink {
                from: 0,
                to: 1,
                delay_ms: 120,
            }],
        }
    }

    #[test]
    fn wan_delay_is_directional() {
        let config = config();
        assert_eq!(config.wan_delay(0, 1), Duration::from_millis(120));
        assert_eq!(config.wan_delay(1, 0), Duration::ZERO);
        config.validate().unwrap();
    }

    #[test]
    fn duplicate_gateways_are_rejected() {
        let mut config = config();
        config.gateways.push(config.gateways[1]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn gateway_lookup_by_cluster() {
        let config = config();
        assert_eq!(config.gateway(1).map(|g| g.address.port()), Some(30000));
        assert!(config.gateway(7).is_none());
    }
}
