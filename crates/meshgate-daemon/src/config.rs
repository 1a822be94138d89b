//! Configuration loading

use anyhow::{Context, Result};
use meshgate_core::{Endpoint, IeeeAddress};
use meshgate_engine::{EnumeratorConfig, ManagerConfig, PollerConfig};
use meshgate_zcl::types::DEFAULT_GATEWAY_ENDPOINT;
use meshgate_zcl::DEFAULT_TIMEOUT_MS;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub enumerator: EnumeratorConfig,
    #[serde(default, rename = "simulated_node")]
    pub simulated_nodes: Vec<SimulatedNodeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Endpoint the gateway exposes to devices
    #[serde(default = "default_local_endpoint")]
    pub local_endpoint: Endpoint,
    /// Path of the persisted state file
    #[serde(default = "default_state_path")]
    pub state_path: String,
    /// Auto-save interval in seconds (0 to disable)
    #[serde(default = "default_autosave")]
    pub autosave_interval_secs: u64,
    /// Deadline of a single protocol round-trip in milliseconds
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            local_endpoint: default_local_endpoint(),
            state_path: default_state_path(),
            autosave_interval_secs: default_autosave(),
            operation_timeout_ms: default_operation_timeout(),
        }
    }
}

fn default_local_endpoint() -> Endpoint {
    DEFAULT_GATEWAY_ENDPOINT
}

fn default_state_path() -> String {
    "./meshgate-state.json".to_string()
}

fn default_autosave() -> u64 {
    60
}

fn default_operation_timeout() -> u64 {
    DEFAULT_TIMEOUT_MS
}

/// A node on the simulated network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedNodeConfig {
    /// IEEE address, hex with optional `0x` prefix or colons
    pub ieee: String,
    pub short_address: u16,
    #[serde(default)]
    pub manufacturer_code: u16,
    #[serde(default = "default_true")]
    pub mains_powered: bool,
    #[serde(default, rename = "endpoint")]
    pub endpoints: Vec<SimulatedEndpointConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedEndpointConfig {
    pub endpoint: Endpoint,
    pub device_id: u16,
    #[serde(default)]
    pub in_clusters: Vec<u16>,
    /// Initial on/off state when the endpoint has the on/off cluster
    #[serde(default)]
    pub on: bool,
}

fn default_true() -> bool {
    true
}

impl SimulatedNodeConfig {
    pub fn address(&self) -> Result<IeeeAddress> {
        self.ieee
            .parse()
            .with_context(|| format!("Invalid IEEE address {:?}", self.ieee))
    }
}

impl Config {
    pub fn to_manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            gateway_endpoint: self.gateway.local_endpoint,
            operation_timeout_ms: self.gateway.operation_timeout_ms,
            poller: self.poller.clone(),
            enumerator: self.enumerator.clone(),
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str(
            r#"
            [gateway]
            local_endpoint = 2
            state_path = "/tmp/state.json"

            [poller]
            workers = 8

            [enumerator]
            attempts = 5

            [[simulated_node]]
            ieee = "00:12:4b:00:01:02:03:04"
            short_address = 0x1234

            [[simulated_node.endpoint]]
            endpoint = 1
            device_id = 0x0100
            in_clusters = [0, 6]
            on = true
            "#,
        )
        .unwrap();

        assert_eq!(config.gateway.local_endpoint, 2);
        assert_eq!(config.gateway.autosave_interval_secs, 60);
        assert_eq!(config.poller.workers, 8);
        assert_eq!(config.poller.queue_capacity, PollerConfig::default().queue_capacity);
        assert_eq!(config.enumerator.attempts, 5);

        let node = &config.simulated_nodes[0];
        assert_eq!(node.address().unwrap(), IeeeAddress(0x00124b0001020304));
        assert!(node.mains_powered);
        assert_eq!(node.endpoints[0].in_clusters, vec![0, 6]);
        assert!(node.endpoints[0].on);

        let manager = config.to_manager_config();
        assert_eq!(manager.gateway_endpoint, 2);
        assert_eq!(manager.enumerator.attempts, 5);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.gateway.local_endpoint, DEFAULT_GATEWAY_ENDPOINT);
        assert!(config.simulated_nodes.is_empty());
    }

    #[test]
    fn test_bad_address_rejected() {
        let node = SimulatedNodeConfig {
            ieee: "not-hex".to_string(),
            short_address: 0,
            manufacturer_code: 0,
            mains_powered: true,
            endpoints: Vec::new(),
        };
        assert!(node.address().is_err());
    }
}
