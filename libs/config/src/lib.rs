//! # Silo Configuration
//!
//! Configuration surface of the messaging transport:
//!
//! - **Messaging**: sender pool sizes, connection retry delay, batching,
//!   timeouts and frame limits
//! - **Gateway**: client drop grace period and cleanup interval
//! - **Cluster**: cluster id, per-cluster gateways and the WAN delay matrix
//!
//! ## Usage
//!
//! ```rust,no_run
//! use silo_config::SiloConfig;
//!
//! let config = SiloConfig::load("config/silo.toml")?;
//! let delay = config.cluster.wan_delay(0, 1);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod cluster;
pub mod defaults;
pub mod messaging;
pub mod silo_config;

pub use cluster::{ClusterConfig, ClusterGateway, WanLink, UNSET_CLUSTER_ID};
pub use messaging::MessagingConfig;
pub use silo_config::SiloConfig;
