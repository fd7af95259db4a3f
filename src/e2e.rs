//! End-to-end delivery tracking for DATA/ACK sessions.
//!
//! The sender registers every outgoing DATA packet, matches returning ACKs
//! exactly once, and answers windowed questions: how many packets did we
//! send to a destination in the last minute, how many came back, with what
//! delay and signal-strength profile.

use std::collections::{HashMap, VecDeque};

/// Entries kept per destination in the sent and ack logs.
pub const E2E_LOG_CAPACITY: usize = 5000;

/// A DATA packet awaiting its ACK.
#[derive(Debug, Clone)]
pub struct PendingData {
    pub dest: u32,
    pub t0: f64,
    pub route: Vec<u32>,
    pub hops: u32,
}

/// One accounted ACK.
#[derive(Debug, Clone)]
pub struct AckRecord {
    pub t_ack: f64,
    pub packet_id: u32,
    pub delay_ms: f64,
    pub rssi_min: Option<f64>,
    pub rssi_avg: Option<f64>,
    pub route: String,
    pub hops: u32,
}

/// Windowed end-to-end statistics for one destination.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowStats {
    pub sent: usize,
    pub acked: usize,
    /// `acked / sent * 100`; zero when nothing was sent in the window.
    pub pdr: f64,
    pub avg_delay_ms: f64,
    pub p95_delay_ms: f64,
    pub avg_rssi_min: f64,
    pub avg_rssi_avg: f64,
}

pub struct EndToEndTracker {
    window: f64,
    pending: HashMap<u32, PendingData>,
    sent_log: HashMap<u32, VecDeque<(f64, u32)>>,
    ack_log: HashMap<u32, VecDeque<AckRecord>>,
    /// packet_id -> first-seen time; duplicates beyond the window cannot
    /// cause double accounting, only repeat work.
    seen_acks: HashMap<u32, f64>,
}

impl EndToEndTracker {
    pub fn new(window: f64) -> Self {
        EndToEndTracker {
            window,
            pending: HashMap::new(),
            sent_log: HashMap::new(),
            ack_log: HashMap::new(),
            seen_acks: HashMap::new(),
        }
    }

    /// Register an outgoing DATA packet.
    pub fn note_sent(&mut self, packet_id: u32, dest: u32, route: Vec<u32>, t0: f64) {
        let hops = route.len().saturating_sub(1) as u32;
        self.pending.insert(packet_id, PendingData { dest, t0, route, hops });
        let log = self.sent_log.entry(dest).or_default();
        if log.len() >= E2E_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back((t0, packet_id));
    }

    /// At-most-once gate for ACK accounting. Returns `false` when this
    /// packet id was already accounted for; otherwise records it and prunes
    /// ids older than the window.
    pub fn first_sight(&mut self, packet_id: u32, now: f64) -> bool {
        let window = self.window;
        self.seen_acks.retain(|_, t| now - *t <= window);
        if self.seen_acks.contains_key(&packet_id) {
            return false;
        }
        self.seen_acks.insert(packet_id, now);
        true
    }

    pub fn take_pending(&mut self, packet_id: u32) -> Option<PendingData> {
        self.pending.remove(&packet_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn record_ack(&mut self, dest: u32, record: AckRecord) {
        let log = self.ack_log.entry(dest).or_default();
        if log.len() >= E2E_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(record);
    }

    pub fn ack_count(&self, dest: u32) -> usize {
        self.ack_log.get(&dest).map(|l| l.len()).unwrap_or(0)
    }

    /// Windowed statistics for a destination. Prunes both logs of entries
    /// older than the window before aggregating.
    pub fn window_stats(&mut self, dest: u32, now: f64) -> WindowStats {
        let window = self.window;
        let sent = self.sent_log.entry(dest).or_default();
        sent.retain(|(t, _)| now - *t <= window);
        let sent_count = sent.len();

        let acks = self.ack_log.entry(dest).or_default();
        acks.retain(|rec| now - rec.t_ack <= window);

        let mut delays: Vec<f64> = acks.iter().map(|r| r.delay_ms).collect();
        let rssi_mins: Vec<f64> = acks.iter().filter_map(|r| r.rssi_min).collect();
        let rssi_avgs: Vec<f64> = acks.iter().filter_map(|r| r.rssi_avg).collect();
        let acked = acks.len();

        let pdr = if sent_count == 0 {
            0.0
        } else {
            (acked as f64 / sent_count as f64 * 100.0).min(100.0)
        };

        delays.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let p95 = if delays.is_empty() {
            0.0
        } else {
            let idx = ((delays.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
            delays[idx.min(delays.len() - 1)]
        };

        WindowStats {
            sent: sent_count,
            acked,
            pdr,
            avg_delay_ms: mean_or_zero(&delays),
            p95_delay_ms: p95,
            avg_rssi_min: mean_or_zero(&rssi_mins),
            avg_rssi_avg: mean_or_zero(&rssi_avgs),
        }
    }
}

fn mean_or_zero(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}
