//! Silo Configuration Module
//!
//! Loads a silo's configuration from a TOML file, optionally layered under
//! `SILO_`-prefixed environment variables (`SILO_MESSAGING__USE_MESSAGE_BATCHING=true`).

use crate::cluster::ClusterConfig;
use crate::messaging::MessagingConfig;
use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tracing::{debug, info};

/// Complete configuration of one silo process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiloConfig {
    pub name: String,

    /// Endpoint for silo-to-silo connections
    pub listen: SocketAddr,

    /// Endpoint accepting client connections; no gateway when absent
    #[serde(default)]
    pub gateway_listen: Option<SocketAddr>,

    /// Generation of this incarnation; 0 picks one at startup
    #[serde(default)]
    pub generation: i32,

    #[serde(default)]
    pub messaging: MessagingConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,
}

impl SiloConfig {
    /// Minimal configuration listening on `listen` with every default.
    pub fn local(name: impl Into<String>, listen: SocketAddr) -> Self {
        Self {
            name: name.into(),
            listen,
            gateway_listen: None,
            generation: 0,
            messaging: MessagingConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }

    /// Load from a TOML file only.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse silo config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file with `SILO_` environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading silo config: {:?}", path);

        let config = Config::builder()
            .add_source(File::from(path).required(true))
            .add_source(
                Environment::with_prefix("SILO")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Self = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        debug!(name = %config.name, listen = %config.listen, "silo config loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("silo name must not be empty");
        }
        if self.generation < 0 {
            bail!("generation must not be negative");
        }
        if let Some(gateway) = self.gateway_listen {
            if gateway == self.listen && gateway.port() != 0 {
                bail!("gateway_listen must differ from listen ({})", gateway);
            }
        }
        self.messaging
            .validate()
            .context("Invalid messaging configuration")?;
        self.cluster
            .validate()
            .context("Invalid cluster configuration")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
name = "silo-a"
listen = "127.0.0.1:11111"
gateway_listen = "127.0.0.1:30000"

[messaging]
silo_sender_queues = 3
use_message_batching = true
max_message_batching_size = 16

[cluster]
cluster_id = 0

[[cluster.gateways]]
cluster_id = 1
address = "10.1.0.1:30000"

[[cluster.wan_delays]]
from = 0
to = 1
delay_ms = 80
"#;

    #[test]
    fn parses_sample_toml() {
        let config = SiloConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.name, "silo-a");
        assert_eq!(config.messaging.silo_sender_queues, 3);
        assert_eq!(config.messaging.batch_size(), 16);
        assert_eq!(config.messaging.connection_retry_delay_ms, 1_000);
        assert_eq!(config.cluster.wan_delay(0, 1).as_millis(), 80);
        assert_eq!(config.gateway_listen.map(|a| a.port()), Some(30000));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = SiloConfig::load(file.path()).unwrap();
        assert_eq!(config.cluster.gateway(1).map(|g| g.cluster_id), Some(1));
        assert_eq!(config, SiloConfig::from_file(file.path()).unwrap());
    }

    #[test]
    fn rejects_same_listen_and_gateway() {
        let mut config = SiloConfig::local("x", "127.0.0.1:5000".parse().unwrap());
        config.gateway_listen = Some(config.listen);
        assert!(config.validate().is_err());
    }
}
