//! Link metric aggregation.
//!
//! Three views feed route selection:
//! - per-directed-edge sliding windows over RSSI / delay / PDR samples,
//! - per-neighbor HELLO reception times, from which a windowed HELLO PDR
//!   is derived,
//! - a neighbor summary (last seen, last reported metric point, active flag)
//!   used as the fallback when an edge has no recorded samples.
//!
//! All operations take an explicit `now` (Unix seconds) so tests control
//! time. Rings are bounded; the oldest sample is evicted on overflow.

use std::collections::{HashMap, VecDeque};

/// Samples kept per edge metric ring.
pub const METRIC_WINDOW: usize = 20;

/// HELLO reception timestamps kept per neighbor.
pub const HELLO_LOG_CAPACITY: usize = 200;

/// Which of the three edge metrics to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Received signal strength, dBm (typically -100..-30).
    Rssi,
    /// One-hop delay, milliseconds.
    Delay,
    /// Packet delivery ratio, percent.
    Pdr,
}

/// Sliding windows for one directed edge `(u, v)`.
#[derive(Debug, Default)]
struct EdgeRecord {
    rssi: VecDeque<f64>,
    delay: VecDeque<f64>,
    pdr: VecDeque<f64>,
    last_update: f64,
}

impl EdgeRecord {
    fn ring(&self, kind: MetricKind) -> &VecDeque<f64> {
        match kind {
            MetricKind::Rssi => &self.rssi,
            MetricKind::Delay => &self.delay,
            MetricKind::Pdr => &self.pdr,
        }
    }
}

fn push_bounded(ring: &mut VecDeque<f64>, value: f64) {
    if ring.len() >= METRIC_WINDOW {
        ring.pop_front();
    }
    ring.push_back(value);
}

fn mean(ring: &VecDeque<f64>) -> Option<f64> {
    if ring.is_empty() {
        return None;
    }
    Some(ring.iter().sum::<f64>() / ring.len() as f64)
}

/// Last metric point reported for a neighbor, plus liveness state.
#[derive(Debug, Clone, Default)]
pub struct NeighborInfo {
    pub last_seen: f64,
    pub last_rssi: Option<f64>,
    pub last_delay: Option<f64>,
    pub last_pdr: Option<f64>,
    /// Cleared when a RERR names this node; restored by the next HELLO.
    pub active: bool,
}

impl NeighborInfo {
    fn last_point(&self, kind: MetricKind) -> Option<f64> {
        match kind {
            MetricKind::Rssi => self.last_rssi,
            MetricKind::Delay => self.last_delay,
            MetricKind::Pdr => self.last_pdr,
        }
    }
}

pub struct MetricStore {
    route_timeout: f64,
    hello_interval: f64,
    min_delay_ms: f64,
    edges: HashMap<(u32, u32), EdgeRecord>,
    neighbors: HashMap<u32, NeighborInfo>,
    hello_log: HashMap<u32, VecDeque<f64>>,
}

impl MetricStore {
    pub fn new(route_timeout: f64, hello_interval: f64, min_delay_ms: f64) -> Self {
        MetricStore {
            route_timeout,
            hello_interval,
            min_delay_ms,
            edges: HashMap::new(),
            neighbors: HashMap::new(),
            hello_log: HashMap::new(),
        }
    }

    /// Record a HELLO reception time for a neighbor and mark it alive.
    pub fn note_hello(&mut self, neighbor: u32, now: f64) {
        let log = self.hello_log.entry(neighbor).or_default();
        if log.len() >= HELLO_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(now);

        let info = self.neighbors.entry(neighbor).or_default();
        info.last_seen = now;
        info.active = true;
    }

    /// Windowed HELLO delivery ratio in percent over the last route-timeout
    /// seconds: `min(100, received / expected * 100)` with
    /// `expected = max(1, floor(route_timeout / hello_interval))`.
    pub fn hello_pdr(&self, neighbor: u32, now: f64) -> f64 {
        let expected = ((self.route_timeout / self.hello_interval).floor() as u64).max(1);
        let received = self
            .hello_log
            .get(&neighbor)
            .map(|log| log.iter().filter(|&&t| now - t <= self.route_timeout).count())
            .unwrap_or(0);
        (received as f64 / expected as f64 * 100.0).min(100.0)
    }

    /// One-hop delay in milliseconds from a sender wall-clock timestamp.
    /// Absent or implausible timestamps (before ~2001) are unusable and fall
    /// back to the floor; negative clock drift clamps to zero first.
    pub fn delay_from_timestamp(&self, timestamp: f64, now: f64) -> f64 {
        if timestamp < 1.0e9 {
            return self.min_delay_ms;
        }
        ((now - timestamp).max(0.0) * 1000.0).max(self.min_delay_ms)
    }

    /// Append samples to the directed edge `(u, v)`. Only present samples
    /// are pushed; their rings advance independently.
    pub fn record_edge(&mut self, u: u32, v: u32, rssi: Option<f64>, delay: Option<f64>, pdr: Option<f64>, now: f64) {
        let edge = self.edges.entry((u, v)).or_default();
        if let Some(r) = rssi {
            push_bounded(&mut edge.rssi, r);
        }
        if let Some(d) = delay {
            push_bounded(&mut edge.delay, d);
        }
        if let Some(p) = pdr {
            push_bounded(&mut edge.pdr, p);
        }
        edge.last_update = now;
    }

    /// Refresh the last reported metric point for a neighbor. Used as the
    /// second preference when reading an edge with no recorded samples.
    pub fn update_neighbor_point(&mut self, neighbor: u32, rssi: Option<f64>, delay: Option<f64>, pdr: Option<f64>) {
        let info = self.neighbors.entry(neighbor).or_default();
        if rssi.is_some() {
            info.last_rssi = rssi;
        }
        if delay.is_some() {
            info.last_delay = delay;
        }
        if pdr.is_some() {
            info.last_pdr = pdr;
        }
    }

    /// Aggregated metric for the directed edge `(u, v)`.
    ///
    /// Preference order: mean of the recorded edge window, then the last
    /// point reported for `v`, then the caller-supplied default.
    pub fn edge_metric(&self, u: u32, v: u32, kind: MetricKind, default: f64) -> f64 {
        if let Some(edge) = self.edges.get(&(u, v)) {
            if let Some(value) = mean(edge.ring(kind)) {
                return value;
            }
        }
        if let Some(info) = self.neighbors.get(&v) {
            if let Some(value) = info.last_point(kind) {
                return value;
            }
        }
        default
    }

    /// Neighbors seen within the route timeout and not marked unreachable.
    pub fn active_neighbors(&self, now: f64) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .neighbors
            .iter()
            .filter(|(_, info)| info.active && now - info.last_seen <= self.route_timeout)
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Mark a node unreachable in the topology view (RERR handling).
    pub fn mark_inactive(&mut self, node: u32) {
        if let Some(info) = self.neighbors.get_mut(&node) {
            info.active = false;
        }
    }

    pub fn neighbor_count(&self) -> usize {
        self.neighbors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MetricStore {
        MetricStore::new(10.0, 2.0, 10.0)
    }

    #[test]
    fn hello_pdr_window() {
        // expected = 10 / 2 = 5 beacons per window
        let mut m = store();
        let now = 2_000_000_000.0;
        for i in 0..5 {
            m.note_hello(2, now - 2.0 * i as f64);
        }
        assert_eq!(m.hello_pdr(2, now), 100.0);

        let mut m = store();
        m.note_hello(2, now - 1.0);
        m.note_hello(2, now - 3.0);
        assert_eq!(m.hello_pdr(2, now), 40.0);

        let m = store();
        assert_eq!(m.hello_pdr(2, now), 0.0);
    }

    #[test]
    fn hello_pdr_ignores_stale_receptions() {
        let mut m = store();
        let now = 2_000_000_000.0;
        m.note_hello(2, now - 11.0);
        m.note_hello(2, now - 1.0);
        assert_eq!(m.hello_pdr(2, now), 20.0);
    }

    #[test]
    fn hello_pdr_caps_at_hundred() {
        let mut m = store();
        let now = 2_000_000_000.0;
        for i in 0..8 {
            m.note_hello(2, now - 0.5 * i as f64);
        }
        assert_eq!(m.hello_pdr(2, now), 100.0);
    }

    #[test]
    fn delay_floor_and_clamp() {
        let m = store();
        let now = 2_000_000_000.0;
        // Missing / implausible timestamp uses the floor.
        assert_eq!(m.delay_from_timestamp(0.0, now), 10.0);
        // Negative drift clamps to zero before the floor applies.
        assert_eq!(m.delay_from_timestamp(now + 5.0, now), 10.0);
        // A plausible timestamp measures real delay.
        assert_eq!(m.delay_from_timestamp(now - 0.05, now), 50.0);
    }

    #[test]
    fn edge_metric_preference_order() {
        let mut m = store();
        let now = 2_000_000_000.0;
        // Nothing known: default wins.
        assert_eq!(m.edge_metric(1, 2, MetricKind::Rssi, -90.0), -90.0);
        // Neighbor summary point beats the default.
        m.update_neighbor_point(2, Some(-70.0), None, None);
        assert_eq!(m.edge_metric(1, 2, MetricKind::Rssi, -90.0), -70.0);
        // Recorded edge samples beat both.
        m.record_edge(1, 2, Some(-50.0), None, None, now);
        m.record_edge(1, 2, Some(-60.0), None, None, now);
        assert_eq!(m.edge_metric(1, 2, MetricKind::Rssi, -90.0), -55.0);
        // The other direction is a distinct edge.
        assert_eq!(m.edge_metric(2, 1, MetricKind::Rssi, -90.0), -90.0);
    }

    #[test]
    fn edge_window_is_bounded() {
        let mut m = store();
        for i in 0..(METRIC_WINDOW + 10) {
            m.record_edge(1, 2, Some(i as f64), None, None, 0.0);
        }
        // Only the newest METRIC_WINDOW samples remain: 10..=29, mean 19.5.
        assert_eq!(m.edge_metric(1, 2, MetricKind::Rssi, 0.0), 19.5);
    }

    #[test]
    fn active_neighbors_and_rerr() {
        let mut m = store();
        let now = 2_000_000_000.0;
        m.note_hello(1, now - 1.0);
        m.note_hello(2, now - 20.0);
        m.note_hello(3, now - 2.0);
        assert_eq!(m.active_neighbors(now), vec![1, 3]);

        m.mark_inactive(3);
        assert_eq!(m.active_neighbors(now), vec![1]);

        // A fresh HELLO revives the node.
        m.note_hello(3, now);
        assert_eq!(m.active_neighbors(now), vec![1, 3]);
    }
}
