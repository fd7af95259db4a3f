//! Persistence adapter for the external tabular store.
//!
//! Two record shapes leave the agent: committed optimized routes (sink
//! destination only) and per-ACK end-to-end measurements. Producers never
//! block — records go onto a bounded channel via `try_send` and a dedicated
//! thread posts them as JSON rows to `{base-url}/{table}`. A failed write
//! triggers one client rebuild and retry; after that the record is dropped
//! with a log line. Missing database rows are the only user-visible effect.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use reqwest::blocking::Client;
use serde::Serialize;
use std::time::Duration;

use crate::config::PersistenceConfig;

/// Depth of the persistence channel; overflow drops the newest record.
pub const PERSIST_QUEUE_SIZE: usize = 128;
pub type PersistQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, PersistRecord, PERSIST_QUEUE_SIZE>;
pub type PersistQueueReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, PersistRecord, PERSIST_QUEUE_SIZE>;
pub type PersistQueueSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, PersistRecord, PERSIST_QUEUE_SIZE>;

/// Row for the `optimized_routes` table. Written only when the optimized
/// destination is the sink node.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizedRouteRecord {
    pub ts: String,
    pub source_node: u32,
    pub destination_node: u32,
    pub best_route: String,
    pub fitness: f64,
    pub avg_rssi: f64,
    pub avg_latency: f64,
    pub avg_pdr: f64,
    pub iterations: u32,
    pub agent_id: String,
}

/// Row for the `e2e_metrics` table, one per accounted ACK.
#[derive(Debug, Clone, Serialize)]
pub struct E2eMetricRecord {
    pub ts: String,
    pub packet_id: String,
    pub source_node: u32,
    pub destination_node: u32,
    pub route: String,
    pub hops: u32,
    pub e2e_delay_ms: f64,
    pub e2e_rssi_min: Option<f64>,
    pub e2e_rssi_avg: Option<f64>,
    pub success: bool,
    pub window_pdr: f64,
    pub agent_id: String,
}

#[derive(Debug, Clone)]
pub enum PersistRecord {
    OptimizedRoute(OptimizedRouteRecord),
    E2eMetric(E2eMetricRecord),
}

impl PersistRecord {
    pub fn table(&self) -> &'static str {
        match self {
            PersistRecord::OptimizedRoute(_) => "optimized_routes",
            PersistRecord::E2eMetric(_) => "e2e_metrics",
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            PersistRecord::OptimizedRoute(r) => serde_json::to_value(r).unwrap_or_default(),
            PersistRecord::E2eMetric(r) => serde_json::to_value(r).unwrap_or_default(),
        }
    }
}

/// Blocking HTTP client for the ingest service.
pub struct MetricsSink {
    client: Option<Client>,
    config: PersistenceConfig,
}

impl MetricsSink {
    pub fn new(config: PersistenceConfig) -> Self {
        let client = match build_client() {
            Ok(c) => Some(c),
            Err(err) => {
                log::error!("failed to create persistence client: {}", err);
                None
            }
        };
        MetricsSink { client, config }
    }

    /// Write one record. On failure the client is rebuilt once and the post
    /// retried; a second failure surfaces as `Err` for the caller to log.
    pub fn write(&mut self, record: &PersistRecord) -> Result<(), String> {
        let body = record.to_json();
        let table = record.table();
        match self.post(table, &body) {
            Ok(()) => Ok(()),
            Err(first) => {
                log::warn!("persistence write failed ({}), reconnecting", first);
                self.client = build_client().ok();
                self.post(table, &body)
            }
        }
    }

    fn post(&self, table: &str, body: &serde_json::Value) -> Result<(), String> {
        let client = self.client.as_ref().ok_or_else(|| "no client".to_string())?;
        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), table);
        let mut request = client.post(&url).header("Content-Type", "application/json").json(body);
        if !self.config.api_key.is_empty() {
            request = request.header("X-Api-Key", &self.config.api_key);
        }
        let response = request.send().map_err(|e| format!("network error: {}", e))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(format!("server returned {}", status.as_u16()))
        }
    }
}

fn build_client() -> Result<Client, String> {
    Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| format!("failed to create HTTP client: {}", e))
}

/// Consumer thread: parks on the channel and writes records as they come.
/// Runs for the life of the process.
pub fn persistence_loop(rx: PersistQueueReceiver, config: PersistenceConfig) {
    let mut sink = MetricsSink::new(config);
    loop {
        let record = futures::executor::block_on(rx.receive());
        if let Err(err) = sink.write(&record) {
            log::warn!("dropping {} record: {}", record.table(), err);
        }
    }
}

/// Consumer used when no store is configured; keeps producers from seeing
/// a full queue while discarding every record.
pub fn discard_loop(rx: PersistQueueReceiver) {
    loop {
        let record = futures::executor::block_on(rx.receive());
        log::trace!("persistence disabled, discarding {} record", record.table());
    }
}
