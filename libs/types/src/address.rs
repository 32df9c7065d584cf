//! Silo addressing
//!
//! A silo is identified by the endpoint it listens on, a generation number that
//! distinguishes restarts on the same endpoint, and the id of the cluster it
//! belongs to.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

/// Cluster id carried by addresses that were never assigned to a cluster.
pub const DEFAULT_CLUSTER_ID: i32 = -1;

/// Address of one runtime node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SiloAddress {
    pub endpoint: SocketAddr,
    pub generation: i32,
    pub cluster_id: i32,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("Invalid endpoint '{input}'")]
    Endpoint { input: String },

    #[error("Invalid {field} '{input}'")]
    Number { field: &'static str, input: String },
}

impl SiloAddress {
    pub fn new(endpoint: SocketAddr, generation: i32) -> Self {
        Self {
            endpoint,
            generation,
            cluster_id: DEFAULT_CLUSTER_ID,
        }
    }

    pub fn with_cluster(endpoint: SocketAddr, generation: i32, cluster_id: i32) -> Self {
        Self {
            endpoint,
            generation,
            cluster_id,
        }
    }

    /// Same endpoint and cluster with the generation cleared.
    ///
    /// Gateways stamp this form on messages they forward to clients so the
    /// client never pins a reply to one incarnation of the gateway.
    pub fn without_generation(&self) -> Self {
        Self {
            generation: 0,
            ..*self
        }
    }

    pub fn has_cluster(&self) -> bool {
        self.cluster_id != DEFAULT_CLUSTER_ID
    }

    /// Endpoint equality where generation 0 on either side acts as a wildcard.
    pub fn matches(&self, other: &SiloAddress) -> bool {
        self.endpoint == other.endpoint
            && (self.generation == 0 || other.generation == 0 || self.generation == other.generation)
    }

    /// Unset cluster ids are compatible with every cluster.
    pub fn is_same_cluster(&self, other: &SiloAddress) -> bool {
        !self.has_cluster() || !other.has_cluster() || self.cluster_id == other.cluster_id
    }

    /// CRC32 of the endpoint mixed with the generation; identical across
    /// processes and restarts.
    pub fn stable_hash(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        match self.endpoint.ip() {
            IpAddr::V4(ip) => hasher.update(&ip.octets()),
            IpAddr::V6(ip) => hasher.update(&ip.octets()),
        }
        hasher.update(&self.endpoint.port().to_le_bytes());
        hasher.finalize() ^ (self.generation as u32)
    }
}

impl fmt::Display for SiloAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}@{}", self.endpoint, self.generation)?;
        if self.has_cluster() {
            write!(f, "/c{}", self.cluster_id)?;
        }
        Ok(())
    }
}

/// Parses `ip:port@generation[/cN]`, the same form `Display` produces (the
/// leading `S` is optional).
impl FromStr for SiloAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix('S').unwrap_or(s);
        let (rest, cluster_id) = match s.rsplit_once("/c") {
            Some((rest, cluster)) => {
                let id = cluster.parse().map_err(|_| AddressParseError::Number {
                    field: "cluster id",
                    input: cluster.to_string(),
                })?;
                (rest, id)
            }
            None => (s, DEFAULT_CLUSTER_ID),
        };
        let (endpoint, generation) = match rest.rsplit_once('@') {
            Some((endpoint, gen)) => {
                let gen = gen.parse().map_err(|_| AddressParseError::Number {
                    field: "generation",
                    input: gen.to_string(),
                })?;
                (endpoint, gen)
            }
            None => (rest, 0),
        };
        let endpoint = endpoint.parse().map_err(|_| AddressParseError::Endpoint {
            input: endpoint.to_string(),
        })?;
        Ok(Self::with_cluster(endpoint, generation, cluster_id))
    }
}
