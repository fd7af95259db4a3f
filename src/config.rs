//! Agent configuration loading and validation.
//!
//! One TOML file provisions a node: its identity, the mesh-wide node table
//! (id to MAC), protocol timing constants, the persistence endpoint, and
//! the RSSI probe. All timing knobs have deployment defaults so a minimal
//! file only names the node and its peers.

use serde::Deserialize;
use std::path::Path;

fn default_udp_port() -> u16 {
    5000
}
fn default_hello_interval() -> f64 {
    2.0
}
fn default_route_timeout() -> f64 {
    10.0
}
fn default_optimization_interval() -> f64 {
    15.0
}
fn default_max_hops() -> u8 {
    10
}
fn default_e2e_window() -> f64 {
    60.0
}
fn default_min_delay_ms() -> f64 {
    10.0
}
fn default_data_interval() -> f64 {
    5.0
}
fn default_data_payload() -> String {
    "telemetry".to_string()
}
fn default_discovery_wait() -> f64 {
    2.0
}
fn default_discovery_retries() -> u32 {
    2
}
fn default_interface() -> String {
    "wlan0".to_string()
}

/// One provisioned mesh node.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeEntry {
    pub node_id: u32,
    pub mac: String,
}

/// External tabular store reached over HTTP.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PersistenceConfig {
    /// Base URL of the ingest service (rows are posted to `{base}/{table}`).
    pub base_url: String,
    /// API key for the ingest endpoint; empty disables the header.
    #[serde(default)]
    pub api_key: String,
}

/// Where the current radio RSSI comes from.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "mode")]
pub enum ProbeConfig {
    /// Read `/proc/net/wireless` for the named interface.
    Proc {
        #[serde(default = "default_interface")]
        interface: String,
    },
    /// Constant value, useful on bench setups without a radio.
    Fixed { dbm: f64 },
    /// No RSSI available; metric windows fall back to defaults.
    Off,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig::Off
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AgentConfig {
    /// This agent's node id; must appear in `nodes`.
    pub node_id: u32,
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    #[serde(default = "default_hello_interval")]
    pub hello_interval_secs: f64,
    #[serde(default = "default_route_timeout")]
    pub route_timeout_secs: f64,
    #[serde(default = "default_optimization_interval")]
    pub optimization_interval_secs: f64,
    /// Initial TTL on originated frames.
    #[serde(default = "default_max_hops")]
    pub max_hops: u8,
    #[serde(default = "default_e2e_window")]
    pub e2e_window_secs: f64,
    /// Floor applied to measured one-hop delays, suppressing clock-drift noise.
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: f64,
    #[serde(default)]
    pub sink_node_id: u32,
    /// Cadence of the application DATA driver toward the sink; 0 disables it.
    #[serde(default = "default_data_interval")]
    pub data_interval_secs: f64,
    #[serde(default = "default_data_payload")]
    pub data_payload: String,
    #[serde(default = "default_discovery_wait")]
    pub discovery_wait_secs: f64,
    #[serde(default = "default_discovery_retries")]
    pub discovery_retries: u32,
    pub nodes: Vec<NodeEntry>,
    #[serde(default)]
    pub persistence: Option<PersistenceConfig>,
    #[serde(default)]
    pub rssi_probe: ProbeConfig,
}

impl AgentConfig {
    /// Load configuration from a TOML file.
    pub fn load(config_path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(config_path).map_err(|e| format!("Failed to read config file: {}", e))?;
        let config: AgentConfig = toml::from_str(&content).map_err(|e| format!("Failed to parse config file: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("node table is empty".to_string());
        }
        let mut ids = std::collections::HashSet::new();
        let mut macs = std::collections::HashSet::new();
        for entry in &self.nodes {
            let mac = crate::wire::MacAddr::parse(&entry.mac)
                .ok_or_else(|| format!("invalid MAC for node {}: {}", entry.node_id, entry.mac))?;
            if mac.is_broadcast() {
                return Err(format!("node {} uses the broadcast MAC", entry.node_id));
            }
            if !ids.insert(entry.node_id) {
                return Err(format!("duplicate node id {}", entry.node_id));
            }
            if !macs.insert(mac) {
                return Err(format!("duplicate MAC {}", entry.mac));
            }
        }
        if !ids.contains(&self.node_id) {
            return Err(format!("own node id {} missing from node table", self.node_id));
        }
        if self.hello_interval_secs <= 0.0 || self.route_timeout_secs <= 0.0 {
            return Err("hello-interval-secs and route-timeout-secs must be positive".to_string());
        }
        if self.max_hops == 0 {
            return Err("max-hops must be at least 1".to_string());
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
node-id = 4
sink-node-id = 0
data-interval-secs = 5.0

[[nodes]]
node-id = 4
mac = "b8:27:eb:00:00:04"

[[nodes]]
node-id = 0
mac = "b8:27:eb:00:00:00"

[persistence]
base-url = "http://10.0.0.2:8080"
api-key = "secret"

[rssi-probe]
mode = "proc"
interface = "wlan0"
"#;

    #[test]
    fn parse_sample() {
        let cfg: AgentConfig = toml::from_str(SAMPLE).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.node_id, 4);
        assert_eq!(cfg.udp_port, 5000);
        assert_eq!(cfg.hello_interval_secs, 2.0);
        assert_eq!(cfg.max_hops, 10);
        assert!(matches!(cfg.rssi_probe, ProbeConfig::Proc { ref interface } if interface == "wlan0"));
        assert_eq!(cfg.persistence.as_ref().unwrap().api_key, "secret");
    }

    #[test]
    fn rejects_missing_self() {
        let mut cfg: AgentConfig = toml::from_str(SAMPLE).unwrap();
        cfg.node_id = 9;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_macs() {
        let text = SAMPLE.replace("b8:27:eb:00:00:00", "b8:27:eb:00:00:04");
        let cfg: AgentConfig = toml::from_str(&text).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_bad_mac() {
        let text = SAMPLE.replace("b8:27:eb:00:00:00", "not-a-mac");
        let cfg: AgentConfig = toml::from_str(&text).unwrap();
        assert!(cfg.validate().is_err());
    }
}
