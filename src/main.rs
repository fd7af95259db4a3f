//! # Mesh Routing Agent - Main Entry Point
//!
//! A routing agent for a small wireless mesh of embedded nodes cooperating
//! over link-local UDP broadcast. Each agent discovers its neighbors with
//! periodic HELLO beacons, builds routes to other nodes, forwards DATA
//! toward the sink, and measures per-session end-to-end quality (delay,
//! delivery ratio, signal strength) so path selection can favor reliable
//! routes.
//!
//! Two route-selection engines cooperate:
//! 1. A reactive AODV-style RREQ/RREP discovery with reverse-route caching.
//! 2. A PSO-GA hybrid optimizer that searches the known-neighbor topology
//!    for a fitness-maximizing path and installs it in the routing table.
//!
//! ## Architecture Overview
//!
//! Blocking work runs on dedicated threads, everything else as async tasks
//! on an Embassy executor:
//!
//! - **UDP receive thread**: blocks on the socket with a short poll
//!   timeout, decodes and filters frames, and feeds the dispatch task.
//! - **Persistence thread**: posts optimized-route and end-to-end metric
//!   rows to the external store without ever blocking the receive path.
//! - **Executor tasks**: frame dispatch, HELLO beacon, periodic
//!   optimization sweep, the application DATA driver, and the single
//!   socket sender draining the outbound channel.
//!
//! Bounded channels connect the threads and tasks; shared routing and
//! metric state lives in guarded containers inside `AgentContext`.

use embassy_executor::Executor;
use env_logger::Builder;
use log::{LevelFilter, error, info};
use std::path::Path;
use std::thread;

mod aodv;
mod clock;
mod config;
mod e2e;
mod identity;
mod metrics;
mod optimizer;
mod payload;
mod persist;
mod probe;
mod routing;
mod state;
mod tasks;
mod transport;
mod wire;

use persist::PersistQueue;
use state::AgentContext;
use transport::{FrameQueue, TxQueue};

fn main() {
    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter(Some("mesh_routing_agent"), LevelFilter::Debug)
        .init();

    info!("Starting up");

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "agent.toml".to_string());
    let cfg = match config::AgentConfig::load(Path::new(&config_path)) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("Error loading config file {}: {}", config_path, err);
            std::process::exit(1);
        }
    };
    let directory = match identity::NodeDirectory::from_config(&cfg) {
        Ok(directory) => directory,
        Err(err) => {
            error!("Error building node directory: {}", err);
            std::process::exit(1);
        }
    };
    info!("node {} ({}) as {} on UDP port {}", cfg.node_id, directory.self_mac(), directory.agent_id(), cfg.udp_port);

    let send_socket = match transport::open_socket(cfg.udp_port) {
        Ok(socket) => socket,
        Err(err) => {
            error!("Error opening mesh socket: {:#}", err);
            std::process::exit(1);
        }
    };
    let recv_socket = match send_socket.try_clone() {
        Ok(socket) => socket,
        Err(err) => {
            error!("Error cloning mesh socket: {}", err);
            std::process::exit(1);
        }
    };
    if let Err(err) = send_socket.set_nonblocking(true) {
        error!("Error configuring send socket: {}", err);
        std::process::exit(1);
    }

    // Channels and shared state live for the entire process; Box::leak
    // satisfies the 'static lifetimes the executor tasks require.
    let frame_queue: &'static FrameQueue = Box::leak(Box::new(FrameQueue::new()));
    let tx_queue: &'static TxQueue = Box::leak(Box::new(TxQueue::new()));
    let persist_queue: &'static PersistQueue = Box::leak(Box::new(PersistQueue::new()));

    let probe = probe::from_config(&cfg.rssi_probe);
    let persistence_cfg = cfg.persistence.clone();
    let udp_port = cfg.udp_port;
    let ctx: &'static AgentContext = Box::leak(Box::new(AgentContext::new(
        cfg,
        directory,
        probe,
        tx_queue.sender(),
        persist_queue.sender(),
    )));

    let rx_directory = ctx.directory.clone();
    let frames_tx = frame_queue.sender();
    thread::Builder::new()
        .name("udp-receiver".to_string())
        .spawn(move || transport::receiver_loop(recv_socket, rx_directory, frames_tx))
        .expect("failed to spawn receiver thread");

    let persist_rx = persist_queue.receiver();
    match persistence_cfg {
        Some(persistence_cfg) => {
            thread::Builder::new()
                .name("persistence".to_string())
                .spawn(move || persist::persistence_loop(persist_rx, persistence_cfg))
                .expect("failed to spawn persistence thread");
        }
        None => {
            info!("persistence disabled, records will be discarded");
            thread::Builder::new()
                .name("persistence".to_string())
                .spawn(move || persist::discard_loop(persist_rx))
                .expect("failed to spawn persistence thread");
        }
    }

    let executor: &'static mut Executor = Box::leak(Box::new(Executor::new()));
    executor.run(|spawner| {
        let _ = spawner.spawn(transport::tx_task(send_socket, udp_port, tx_queue.receiver()));
        let _ = spawner.spawn(tasks::rx_dispatch_task(ctx, frame_queue.receiver()));
        let _ = spawner.spawn(tasks::hello_task(ctx));
        let _ = spawner.spawn(tasks::optimizer_task(ctx));
        let _ = spawner.spawn(tasks::data_task(ctx));
    });
}
