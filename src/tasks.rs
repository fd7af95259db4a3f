//! Periodic agent tasks on the Embassy executor.
//!
//! Four tasks drive the agent: frame dispatch, the HELLO beacon, the
//! optimization sweep, and the application DATA driver toward the sink.
//! The sender task lives in `transport`; the persistence consumer runs on
//! its own thread. All of them share the leaked `AgentContext`.

use embassy_time::{Duration, Timer};
use rand::Rng;

use crate::aodv;
use crate::clock::{rfc3339_now, unix_now};
use crate::optimizer::{commit_route, optimize_route, path_averages};
use crate::persist::{OptimizedRouteRecord, PersistRecord};
use crate::routing::route_string;
use crate::state::AgentContext;
use crate::transport::FrameQueueReceiver;

fn secs(value: f64) -> Duration {
    Duration::from_millis((value * 1000.0) as u64)
}

/// Dispatch loop: every frame accepted by the receive thread lands here.
#[embassy_executor::task]
pub async fn rx_dispatch_task(ctx: &'static AgentContext, frames: FrameQueueReceiver) {
    loop {
        let frame = frames.receive().await;
        aodv::handle_frame(ctx, &frame, unix_now());
    }
}

/// HELLO beacon emitter.
#[embassy_executor::task]
pub async fn hello_task(ctx: &'static AgentContext) {
    let interval = secs(ctx.cfg.hello_interval_secs);
    loop {
        aodv::send_hello(ctx, unix_now());
        Timer::after(interval).await;
    }
}

/// Run one PSO-GA optimization toward `dest` and install the result.
///
/// Fails (without side effects) when no active neighbor is known. A
/// persistence record is emitted only on the explicit pre-send path and
/// only for the sink destination.
pub fn run_optimization(ctx: &AgentContext, dest: u32, persist: bool, now: f64, rng: &mut impl Rng) -> bool {
    let outcome = ctx.metrics.lock(|m| {
        let m = m.borrow();
        let available = m.active_neighbors(now);
        if available.is_empty() {
            return None;
        }
        optimize_route(&m, ctx.self_id(), dest, &available, rng)
    });
    let Some(outcome) = outcome else {
        return false;
    };

    ctx.routing.lock(|rt| commit_route(&mut rt.borrow_mut(), dest, &outcome.path, ctx.next_seq(), now));
    ctx.route_installed.signal(dest);
    log::debug!("optimized route to node {}: {} (fitness {:.3}, {} iterations)", dest, route_string(&outcome.path), outcome.fitness, outcome.iterations);

    if persist && dest == ctx.cfg.sink_node_id {
        let (avg_rssi, avg_latency, avg_pdr) = ctx.metrics.lock(|m| path_averages(&m.borrow(), &outcome.path));
        let record = PersistRecord::OptimizedRoute(OptimizedRouteRecord {
            ts: rfc3339_now(),
            source_node: ctx.self_id(),
            destination_node: dest,
            best_route: route_string(&outcome.path),
            fitness: outcome.fitness,
            avg_rssi,
            avg_latency,
            avg_pdr,
            iterations: outcome.iterations,
            agent_id: ctx.directory.agent_id().to_string(),
        });
        if ctx.persist.try_send(record).is_err() {
            log::warn!("persistence queue full, dropping optimized-route record");
        }
    }
    true
}

/// Periodic optimization sweep over every neighbor seen within the route
/// timeout. The sweep keeps routes warm; it never persists.
#[embassy_executor::task]
pub async fn optimizer_task(ctx: &'static AgentContext) {
    let interval = secs(ctx.cfg.optimization_interval_secs);
    loop {
        Timer::after(interval).await;
        let now = unix_now();
        let neighbors = ctx.metrics.lock(|m| m.borrow().active_neighbors(now));
        let route_count = ctx.routing.lock(|rt| rt.borrow().len());
        log::info!("optimization sweep: {} active neighbors, {} routing entries", neighbors.len(), route_count);
        let mut rng = rand::thread_rng();
        for dest in neighbors {
            if dest != ctx.self_id() {
                run_optimization(ctx, dest, false, now, &mut rng);
            }
        }
    }
}

/// Application driver: on its own cadence, optimize a route to the sink
/// (persisting the commit), fall back to AODV discovery when the swarm has
/// nothing to work with, then send one DATA packet.
#[embassy_executor::task]
pub async fn data_task(ctx: &'static AgentContext) {
    if ctx.cfg.data_interval_secs <= 0.0 {
        log::info!("DATA driver disabled");
        return;
    }
    let sink = ctx.cfg.sink_node_id;
    if sink == ctx.self_id() {
        log::info!("this node is the sink, DATA driver idle");
        return;
    }
    let interval = secs(ctx.cfg.data_interval_secs);
    loop {
        Timer::after(interval).await;
        let now = unix_now();
        {
            let mut rng = rand::thread_rng();
            run_optimization(ctx, sink, true, now, &mut rng);
        }
        let routed = ctx.routing.lock(|rt| rt.borrow().valid_route(sink, now).is_some());
        if !routed {
            aodv::discover_route(ctx, sink, ctx.cfg.discovery_wait_secs, ctx.cfg.discovery_retries).await;
        }
        if let Err(err) = aodv::send_data(ctx, sink, &ctx.cfg.data_payload, unix_now()) {
            log::warn!("DATA send failed: {}", err);
        }
    }
}
