//! Shared agent state.
//!
//! Several tasks touch the same structures: the dispatch task mutates
//! everything, the optimizer reads metrics and writes routes, the DATA
//! driver reads routes and writes e2e logs. Each structure sits in its own
//! guarded container; locks are held only for the duration of a closure and
//! never across an await, and at most one is taken at a time.

use core::cell::RefCell;
use std::sync::atomic::{AtomicU32, Ordering};

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;

use crate::config::AgentConfig;
use crate::e2e::EndToEndTracker;
use crate::identity::NodeDirectory;
use crate::metrics::MetricStore;
use crate::persist::PersistQueueSender;
use crate::probe::RssiProbe;
use crate::routing::{ReverseRoutes, RoutingTable, RreqSeen};
use crate::transport::TxQueueSender;

/// Blocking mutex wrapping one shared structure.
pub type Guarded<T> = Mutex<CriticalSectionRawMutex, RefCell<T>>;

/// Everything the agent tasks share. Leaked to `'static` at startup so
/// Embassy tasks and the receive thread can all hold a reference.
pub struct AgentContext {
    pub cfg: AgentConfig,
    pub directory: NodeDirectory,
    pub probe: Box<dyn RssiProbe>,
    /// Outbound frames; drained by the single sender task.
    pub tx: TxQueueSender,
    /// Persistence records; drained by the persistence thread.
    pub persist: PersistQueueSender,
    pub routing: Guarded<RoutingTable>,
    pub reverse: Guarded<ReverseRoutes>,
    pub metrics: Guarded<MetricStore>,
    pub e2e: Guarded<EndToEndTracker>,
    pub seen_rreq: Guarded<RreqSeen>,
    /// Raised with the destination id whenever a forward route is installed;
    /// discovery waiters re-check the table on every wake, so spurious or
    /// coalesced signals are harmless.
    pub route_installed: Signal<CriticalSectionRawMutex, u32>,
    seq: AtomicU32,
}

impl AgentContext {
    pub fn new(cfg: AgentConfig, directory: NodeDirectory, probe: Box<dyn RssiProbe>, tx: TxQueueSender, persist: PersistQueueSender) -> Self {
        let route_timeout = cfg.route_timeout_secs;
        AgentContext {
            directory,
            probe,
            tx,
            persist,
            routing: Mutex::new(RefCell::new(RoutingTable::new(route_timeout))),
            reverse: Mutex::new(RefCell::new(ReverseRoutes::new(route_timeout))),
            metrics: Mutex::new(RefCell::new(MetricStore::new(route_timeout, cfg.hello_interval_secs, cfg.min_delay_ms))),
            e2e: Mutex::new(RefCell::new(EndToEndTracker::new(cfg.e2e_window_secs))),
            seen_rreq: Mutex::new(RefCell::new(RreqSeen::new(route_timeout))),
            route_installed: Signal::new(),
            seq: AtomicU32::new(0),
            cfg,
        }
    }

    /// Monotonically increasing sequence number shared by HELLO beacons,
    /// RREQ ids, and route commits.
    pub fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn self_id(&self) -> u32 {
        self.directory.self_id()
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::config::test_support::mesh_config;
    use crate::persist::{PersistQueue, PersistQueueReceiver};
    use crate::probe::FixedRssiProbe;
    use crate::transport::{TxQueue, TxQueueReceiver};

    /// Leak a full context for handler tests, returning the receive ends of
    /// both outbound channels so tests can inspect what the engine emitted.
    pub fn test_context(self_id: u32, peers: &[u32]) -> (&'static AgentContext, TxQueueReceiver, PersistQueueReceiver) {
        let cfg = mesh_config(self_id, peers);
        let tx_queue: &'static TxQueue = Box::leak(Box::new(TxQueue::new()));
        let persist_queue: &'static PersistQueue = Box::leak(Box::new(PersistQueue::new()));
        let directory = NodeDirectory::from_config(&cfg).unwrap();
        let ctx = Box::leak(Box::new(AgentContext::new(
            cfg,
            directory,
            Box::new(FixedRssiProbe(-55.0)),
            tx_queue.sender(),
            persist_queue.sender(),
        )));
        (ctx, tx_queue.receiver(), persist_queue.receiver())
    }

    /// Drain every frame currently queued for transmission.
    pub fn drain_tx(rx: &TxQueueReceiver) -> Vec<crate::wire::Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_receive() {
            frames.push(frame);
        }
        frames
    }
}
