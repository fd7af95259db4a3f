//! Node identity and the static id ↔ MAC address map.
//!
//! The mesh is provisioned with a fixed table of node ids and radio MAC
//! addresses (loaded from the agent config). The directory answers both
//! directions of the mapping and the "is this frame for us" question.

use std::collections::HashMap;

use crate::config::AgentConfig;
use crate::wire::MacAddr;

#[derive(Clone)]
pub struct NodeDirectory {
    self_id: u32,
    self_mac: MacAddr,
    agent_id: String,
    by_id: HashMap<u32, MacAddr>,
    by_mac: HashMap<MacAddr, u32>,
}

impl NodeDirectory {
    /// Build the directory from a validated config. The config loader has
    /// already checked that the agent's own node id appears in the table and
    /// that every MAC parses, so this cannot fail after validation.
    pub fn from_config(cfg: &AgentConfig) -> Result<Self, String> {
        let mut by_id = HashMap::new();
        let mut by_mac = HashMap::new();
        for entry in &cfg.nodes {
            let mac = MacAddr::parse(&entry.mac).ok_or_else(|| format!("invalid MAC for node {}: {}", entry.node_id, entry.mac))?;
            by_id.insert(entry.node_id, mac);
            by_mac.insert(mac, entry.node_id);
        }
        let self_mac = *by_id
            .get(&cfg.node_id)
            .ok_or_else(|| format!("own node id {} missing from node table", cfg.node_id))?;
        Ok(NodeDirectory {
            self_id: cfg.node_id,
            self_mac,
            agent_id: format!("agent-{}-{}", cfg.node_id, std::process::id()),
            by_id,
            by_mac,
        })
    }

    pub fn self_id(&self) -> u32 {
        self.self_id
    }

    pub fn self_mac(&self) -> MacAddr {
        self.self_mac
    }

    /// Stable per-process identifier recorded in persisted rows.
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn mac_of(&self, node_id: u32) -> Option<MacAddr> {
        self.by_id.get(&node_id).copied()
    }

    pub fn id_of(&self, mac: MacAddr) -> Option<u32> {
        self.by_mac.get(&mac).copied()
    }

    /// Destination filter applied to every received frame: broadcast passes
    /// every receiver, anything else must match our own MAC.
    pub fn accepts(&self, dst: MacAddr) -> bool {
        dst.is_broadcast() || dst == self.self_mac
    }
}
