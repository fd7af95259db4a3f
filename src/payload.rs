//! JSON payload shapes carried inside link-local frames.
//!
//! One tagged struct per packet type with a fixed set of fields. Unknown
//! fields are ignored on decode; optional fields fall back to their
//! documented defaults so that frames from older firmware still parse.

use serde::{Deserialize, Serialize};

fn default_kind() -> String {
    String::new()
}

/// Periodic neighbor beacon, broadcast every hello interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    pub node_id: u32,
    pub seq_num: u32,
    pub timestamp: f64,
    pub mac_address: String,
    pub agent_id: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
}

/// Route request, flooded toward the destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RreqPayload {
    pub origin_id: u32,
    pub dest_id: u32,
    pub rreq_id: u32,
    #[serde(default)]
    pub hop_count: u32,
    #[serde(default)]
    pub timestamp: f64,
}

/// Route reply, unicast back along the reverse route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RrepPayload {
    pub origin_id: u32,
    pub dest_id: u32,
    pub rreq_id: u32,
    #[serde(default)]
    pub hop_count: u32,
    #[serde(default)]
    pub timestamp: f64,
}

/// One measured hop on a DATA path, accumulated on the way to the sink and
/// echoed back inside the ACK. All metric fields are optional; a relay that
/// cannot read its radio still contributes the `(u, v)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HopMetric {
    pub u: u32,
    pub v: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdr: Option<f64>,
}

/// Application data toward a destination. `path` and `route` carry the same
/// list; both names are kept for compatibility with deployed receivers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPayload {
    pub packet_id: u32,
    pub payload: String,
    pub source: u32,
    pub destination: u32,
    pub timestamp: f64,
    #[serde(default)]
    pub path: Vec<u32>,
    #[serde(default)]
    pub route: Vec<u32>,
    #[serde(default)]
    pub agent_id: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub hop_metrics: Vec<HopMetric>,
}

/// End-to-end acknowledgement returned by the DATA destination.
/// `source`/`destination` are swapped relative to the DATA packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckPayload {
    pub packet_id: u32,
    #[serde(default)]
    pub sent_ts: f64,
    #[serde(default)]
    pub ack_ts: f64,
    pub source: u32,
    pub destination: u32,
    #[serde(default)]
    pub route: Vec<u32>,
    #[serde(default)]
    pub hop_metrics: Vec<HopMetric>,
    #[serde(default)]
    pub agent_id: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
}

/// Route error naming a node that can no longer be reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerrPayload {
    pub unreachable_node: u32,
    #[serde(default)]
    pub seq_num: u32,
    #[serde(default)]
    pub timestamp: f64,
}
