//! AODV-style route discovery, forwarding, and delivery accounting.
//!
//! The dispatch task feeds every accepted frame into `handle_frame`; the
//! handlers mutate the shared state and queue any frames they need to send.
//! Nothing here touches a socket, which keeps the whole engine exercisable
//! from unit tests through the outbound channel.
//!
//! Sequence-number freshness rules, precursor lists, and local repair from
//! RFC 3561 are intentionally simplified: route validity is purely
//! time-based and RERR handling drops the entry and re-discovers.

use anyhow::bail;
use embassy_futures::select::{Either, select};
use embassy_time::{Duration, Instant, Timer};
use rand::Rng;

use crate::clock::rfc3339_now;
use crate::e2e::AckRecord;
use crate::payload::{AckPayload, DataPayload, HelloPayload, HopMetric, RerrPayload, RreqPayload, RrepPayload};
use crate::persist::{E2eMetricRecord, PersistRecord};
use crate::routing::{RouteEntry, route_string};
use crate::state::AgentContext;
use crate::wire::{BROADCAST_MAC, Frame, MacAddr, PacketType};

/// Queue a frame for the sender task. Best-effort: a full queue drops the
/// frame with a log line, never blocking the caller.
fn enqueue(ctx: &AgentContext, frame: Frame) {
    if ctx.tx.try_send(frame).is_err() {
        log::warn!("outbound frame queue full, dropping frame");
    }
}

fn frame_with<T: serde::Serialize>(ctx: &AgentContext, packet_type: PacketType, dst_mac: MacAddr, ttl: u8, payload: &T) -> Option<Frame> {
    let payload = match serde_json::to_vec(payload) {
        Ok(bytes) => bytes,
        Err(err) => {
            log::error!("failed to encode {:?} payload: {}", packet_type, err);
            return None;
        }
    };
    Some(Frame {
        packet_type,
        src_mac: ctx.directory.self_mac(),
        dst_mac,
        ttl,
        payload,
    })
}

/// Broadcast one HELLO beacon.
pub fn send_hello(ctx: &AgentContext, now: f64) {
    let payload = HelloPayload {
        node_id: ctx.self_id(),
        seq_num: ctx.next_seq(),
        timestamp: now,
        mac_address: ctx.directory.self_mac().to_string(),
        agent_id: ctx.directory.agent_id().to_string(),
        kind: "hello".to_string(),
    };
    if let Some(frame) = frame_with(ctx, PacketType::Hello, BROADCAST_MAC, ctx.cfg.max_hops, &payload) {
        enqueue(ctx, frame);
    }
}

/// Originate a route request toward `dest`. The `(self, rreq_id)` pair is
/// recorded immediately so our own flooded copy comes back dead.
pub fn originate_rreq(ctx: &AgentContext, dest: u32, now: f64) -> u32 {
    let rreq_id = ctx.next_seq();
    ctx.seen_rreq.lock(|s| s.borrow_mut().insert(ctx.self_id(), rreq_id, now));
    let payload = RreqPayload {
        origin_id: ctx.self_id(),
        dest_id: dest,
        rreq_id,
        hop_count: 0,
        timestamp: now,
    };
    if let Some(frame) = frame_with(ctx, PacketType::Rreq, BROADCAST_MAC, ctx.cfg.max_hops, &payload) {
        enqueue(ctx, frame);
    }
    log::debug!("RREQ {} originated for node {}", rreq_id, dest);
    rreq_id
}

/// Broadcast a route error naming an unreachable node.
pub fn send_rerr(ctx: &AgentContext, unreachable: u32, now: f64) {
    let payload = RerrPayload {
        unreachable_node: unreachable,
        seq_num: ctx.next_seq(),
        timestamp: now,
    };
    if let Some(frame) = frame_with(ctx, PacketType::Rerr, BROADCAST_MAC, ctx.cfg.max_hops, &payload) {
        enqueue(ctx, frame);
    }
}

/// Send application data toward `dest`.
///
/// Routing preference: installed next hop, then the destination's MAC
/// directly, otherwise the send fails after flagging the destination with
/// a RERR. Returns the allocated packet id on success.
pub fn send_data(ctx: &AgentContext, dest: u32, payload_text: &str, now: f64) -> anyhow::Result<u32> {
    let mut rng = rand::thread_rng();
    let mut packet_id: u32 = rng.r#gen();
    while packet_id == 0 {
        packet_id = rng.r#gen();
    }

    let routed = ctx.routing.lock(|rt| {
        rt.borrow()
            .valid_route(dest, now)
            .and_then(|route| ctx.directory.mac_of(route.next_hop).map(|mac| (route.path.clone(), mac)))
    });
    let (path, dst_mac) = match routed {
        Some(found) => found,
        None => match ctx.directory.mac_of(dest) {
            Some(mac) => (vec![ctx.self_id(), dest], mac),
            None => {
                send_rerr(ctx, dest, now);
                bail!("no route to node {} and no known MAC", dest);
            }
        },
    };

    let payload = DataPayload {
        packet_id,
        payload: payload_text.to_string(),
        source: ctx.self_id(),
        destination: dest,
        timestamp: now,
        path: path.clone(),
        route: path.clone(),
        agent_id: ctx.directory.agent_id().to_string(),
        kind: "data".to_string(),
        hop_metrics: Vec::new(),
    };
    ctx.e2e.lock(|t| t.borrow_mut().note_sent(packet_id, dest, path, now));
    if let Some(frame) = frame_with(ctx, PacketType::Data, dst_mac, ctx.cfg.max_hops, &payload) {
        enqueue(ctx, frame);
    }
    log::debug!("DATA {} sent toward node {}", packet_id, dest);
    Ok(packet_id)
}

/// Blocking discovery: returns once a valid route to `dest` exists, or
/// after `retries + 1` RREQs each waited out for `wait_secs`. Re-checks
/// the table on every wake, so coalesced or unrelated signals are fine.
pub async fn discover_route(ctx: &AgentContext, dest: u32, wait_secs: f64, retries: u32) -> bool {
    let has_route = |ctx: &AgentContext| {
        let now = crate::clock::unix_now();
        ctx.routing.lock(|rt| rt.borrow().valid_route(dest, now).is_some())
    };
    if has_route(ctx) {
        return true;
    }
    for _attempt in 0..=retries {
        originate_rreq(ctx, dest, crate::clock::unix_now());
        let deadline = Instant::now() + Duration::from_millis((wait_secs * 1000.0) as u64);
        let wait_for_route = async {
            loop {
                ctx.route_installed.wait().await;
                if has_route(ctx) {
                    return;
                }
            }
        };
        if let Either::First(_) = select(wait_for_route, Timer::at(deadline)).await {
            return true;
        }
    }
    has_route(ctx)
}

/// Dispatch one accepted frame by wire type. Malformed payloads drop the
/// frame silently; the mesh treats loss as routine.
pub fn handle_frame(ctx: &AgentContext, frame: &Frame, now: f64) {
    match frame.packet_type {
        PacketType::Hello => {
            if let Some(payload) = frame.payload_json::<HelloPayload>() {
                handle_hello(ctx, payload, now);
            }
        }
        PacketType::Rreq => {
            if let Some(payload) = frame.payload_json::<RreqPayload>() {
                handle_rreq(ctx, frame, payload, now);
            }
        }
        PacketType::Rrep => {
            if let Some(payload) = frame.payload_json::<RrepPayload>() {
                handle_rrep(ctx, frame, payload, now);
            }
        }
        PacketType::Data => {
            if let Some(payload) = frame.payload_json::<DataPayload>() {
                handle_data(ctx, frame, payload, now);
            }
        }
        PacketType::Ack => {
            if let Some(payload) = frame.payload_json::<AckPayload>() {
                handle_ack(ctx, payload, now);
            }
        }
        PacketType::Rerr => {
            if let Some(payload) = frame.payload_json::<RerrPayload>() {
                handle_rerr(ctx, payload, now);
            }
        }
    }
}

/// HELLO receipt: refresh the neighbor, extend its beacon log, and record
/// the one-hop edge with probed RSSI, measured delay, and windowed PDR.
fn handle_hello(ctx: &AgentContext, payload: HelloPayload, now: f64) {
    let source = payload.node_id;
    if source == ctx.self_id() {
        return;
    }
    let rssi = ctx.probe.current_rssi();
    ctx.metrics.lock(|m| {
        let mut m = m.borrow_mut();
        m.note_hello(source, now);
        let pdr = m.hello_pdr(source, now);
        let delay = m.delay_from_timestamp(payload.timestamp, now);
        m.record_edge(source, ctx.self_id(), rssi, Some(delay), Some(pdr), now);
        m.update_neighbor_point(source, rssi, Some(delay), Some(pdr));
    });
    log::trace!("HELLO from node {} seq {}", source, payload.seq_num);
}

fn handle_rreq(ctx: &AgentContext, frame: &Frame, payload: RreqPayload, now: f64) {
    let is_new = ctx.seen_rreq.lock(|s| s.borrow_mut().insert(payload.origin_id, payload.rreq_id, now));
    if !is_new {
        return;
    }
    let Some(sender_id) = ctx.directory.id_of(frame.src_mac) else {
        return;
    };
    ctx.reverse.lock(|r| r.borrow_mut().note(payload.origin_id, sender_id, payload.hop_count + 1, now));

    if payload.dest_id == ctx.self_id() {
        send_rrep(ctx, &payload, 0, now);
        return;
    }
    let known_hops = ctx.routing.lock(|rt| rt.borrow().valid_route(payload.dest_id, now).map(|route| route.hop_count));
    if let Some(hops) = known_hops {
        send_rrep(ctx, &payload, hops, now);
        return;
    }
    // No answer here: flood onward while the TTL budget lasts.
    if frame.ttl > 1 {
        let forwarded = RreqPayload {
            hop_count: payload.hop_count + 1,
            ..payload
        };
        if let Some(frame) = frame_with(ctx, PacketType::Rreq, BROADCAST_MAC, frame.ttl - 1, &forwarded) {
            enqueue(ctx, frame);
        }
    }
}

/// Unicast a RREP for `rreq` back along the reverse route.
fn send_rrep(ctx: &AgentContext, rreq: &RreqPayload, hop_count: u32, now: f64) {
    let next_hop_mac = ctx
        .reverse
        .lock(|r| r.borrow().valid_route(rreq.origin_id, now).map(|entry| entry.next_hop))
        .and_then(|next_hop| ctx.directory.mac_of(next_hop));
    let Some(dst_mac) = next_hop_mac else {
        return;
    };
    let payload = RrepPayload {
        origin_id: rreq.origin_id,
        dest_id: rreq.dest_id,
        rreq_id: rreq.rreq_id,
        hop_count,
        timestamp: now,
    };
    if let Some(frame) = frame_with(ctx, PacketType::Rrep, dst_mac, ctx.cfg.max_hops, &payload) {
        enqueue(ctx, frame);
    }
}

fn handle_rrep(ctx: &AgentContext, frame: &Frame, payload: RrepPayload, now: f64) {
    let Some(sender_id) = ctx.directory.id_of(frame.src_mac) else {
        return;
    };
    let installed = ctx.routing.lock(|rt| {
        let mut rt = rt.borrow_mut();
        let better = match rt.valid_route(payload.dest_id, now) {
            None => true,
            Some(entry) => payload.hop_count + 1 < entry.hop_count,
        };
        if better {
            // Only the locally known prefix of the path is stored; the
            // install normalizes hop_count against it.
            let mut path = vec![ctx.self_id(), sender_id, payload.dest_id];
            path.dedup();
            rt.install(
                payload.dest_id,
                RouteEntry {
                    next_hop: sender_id,
                    hop_count: payload.hop_count + 1,
                    seq_num: payload.rreq_id,
                    last_update: now,
                    path,
                },
            );
        }
        better
    });
    if installed {
        ctx.route_installed.signal(payload.dest_id);
        log::debug!("route to node {} via node {} installed", payload.dest_id, sender_id);
    }
    if payload.origin_id == ctx.self_id() {
        return;
    }
    // Relay the reply toward the origin along the cached reverse route.
    if frame.ttl > 1 {
        let next_hop_mac = ctx
            .reverse
            .lock(|r| r.borrow().valid_route(payload.origin_id, now).map(|entry| entry.next_hop))
            .and_then(|next_hop| ctx.directory.mac_of(next_hop));
        if let Some(dst_mac) = next_hop_mac {
            let forwarded = RrepPayload {
                hop_count: payload.hop_count + 1,
                ..payload
            };
            if let Some(frame) = frame_with(ctx, PacketType::Rrep, dst_mac, frame.ttl - 1, &forwarded) {
                enqueue(ctx, frame);
            }
        }
    }
}

fn handle_data(ctx: &AgentContext, frame: &Frame, mut payload: DataPayload, now: f64) {
    if payload.destination == ctx.self_id() {
        let sender = ctx.directory.id_of(frame.src_mac).unwrap_or(payload.source);
        payload.hop_metrics.push(HopMetric {
            u: sender,
            v: ctx.self_id(),
            rssi: ctx.probe.current_rssi(),
            delay: None,
            pdr: None,
        });
        let route = if payload.route.is_empty() { payload.path.clone() } else { payload.route.clone() };
        let ack = AckPayload {
            packet_id: payload.packet_id,
            sent_ts: payload.timestamp,
            ack_ts: now,
            source: payload.destination,
            destination: payload.source,
            route,
            hop_metrics: payload.hop_metrics,
            agent_id: ctx.directory.agent_id().to_string(),
            kind: "ack".to_string(),
        };
        let dst_mac = ctx.directory.mac_of(payload.source).unwrap_or(BROADCAST_MAC);
        if let Some(frame) = frame_with(ctx, PacketType::Ack, dst_mac, ctx.cfg.max_hops, &ack) {
            enqueue(ctx, frame);
        }
        log::debug!("DATA {} delivered, ACK returned to node {}", payload.packet_id, payload.source);
        return;
    }
    // Relay role: pass the payload bytes through untouched.
    if frame.ttl > 1 {
        let next_hop_mac = ctx
            .routing
            .lock(|rt| rt.borrow().valid_route(payload.destination, now).map(|route| route.next_hop))
            .and_then(|next_hop| ctx.directory.mac_of(next_hop));
        if let Some(dst_mac) = next_hop_mac {
            enqueue(
                ctx,
                Frame {
                    packet_type: PacketType::Data,
                    src_mac: ctx.directory.self_mac(),
                    dst_mac,
                    ttl: frame.ttl - 1,
                    payload: frame.payload.clone(),
                },
            );
        } else {
            log::debug!("no route to forward DATA {} toward node {}", payload.packet_id, payload.destination);
        }
    }
}

/// ACK receipt by the original DATA source. Idempotent: a replayed ACK
/// changes nothing once its packet id has been accounted.
fn handle_ack(ctx: &AgentContext, payload: AckPayload, now: f64) {
    if payload.destination != ctx.self_id() {
        return;
    }
    let fresh = ctx.e2e.lock(|t| t.borrow_mut().first_sight(payload.packet_id, now));
    if !fresh {
        return;
    }
    let pending = ctx.e2e.lock(|t| t.borrow_mut().take_pending(payload.packet_id));
    // A missing pending entry (expired or restarted agent) still gets
    // best-effort accounting from the ACK's own fields.
    let dest = pending.as_ref().map(|p| p.dest).unwrap_or(payload.source);
    let t0 = pending.as_ref().map(|p| p.t0).unwrap_or(payload.sent_ts);
    let route = pending.map(|p| p.route).unwrap_or_else(|| payload.route.clone());
    let hops = if route.len() >= 2 {
        route.len() as u32 - 1
    } else {
        payload.hop_metrics.len().max(1) as u32
    };

    let delay_ms = (now - t0).max(0.0) * 1000.0;
    let rssis: Vec<f64> = payload.hop_metrics.iter().filter_map(|h| h.rssi).collect();
    let rssi_min = rssis.iter().copied().fold(None, |acc: Option<f64>, r| Some(acc.map_or(r, |a| a.min(r))));
    let rssi_avg = if rssis.is_empty() { None } else { Some(rssis.iter().sum::<f64>() / rssis.len() as f64) };
    let route_text = route_string(&route);

    let stats = ctx.e2e.lock(|t| {
        let mut t = t.borrow_mut();
        t.record_ack(
            dest,
            AckRecord {
                t_ack: now,
                packet_id: payload.packet_id,
                delay_ms,
                rssi_min,
                rssi_avg,
                route: route_text.clone(),
                hops,
            },
        );
        t.window_stats(dest, now)
    });

    let record = PersistRecord::E2eMetric(E2eMetricRecord {
        ts: rfc3339_now(),
        packet_id: payload.packet_id.to_string(),
        source_node: ctx.self_id(),
        destination_node: dest,
        route: route_text,
        hops,
        e2e_delay_ms: delay_ms,
        e2e_rssi_min: rssi_min,
        e2e_rssi_avg: rssi_avg,
        success: true,
        window_pdr: stats.pdr,
        agent_id: ctx.directory.agent_id().to_string(),
    });
    if ctx.persist.try_send(record).is_err() {
        log::warn!("persistence queue full, dropping e2e record");
    }
    log::info!(
        "ACK for DATA {}: {:.1} ms end-to-end, window PDR {:.1}% toward node {}",
        payload.packet_id,
        delay_ms,
        stats.pdr,
        dest
    );
}

/// RERR receipt: forget the route, mark the node unreachable, and kick off
/// an asynchronous re-discovery.
fn handle_rerr(ctx: &AgentContext, payload: RerrPayload, now: f64) {
    let removed = ctx.routing.lock(|rt| rt.borrow_mut().remove(payload.unreachable_node).is_some());
    ctx.metrics.lock(|m| m.borrow_mut().mark_inactive(payload.unreachable_node));
    if removed {
        log::info!("route to node {} invalidated by RERR", payload.unreachable_node);
    }
    if payload.unreachable_node != ctx.self_id() {
        originate_rreq(ctx, payload.unreachable_node, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::commit_route;
    use crate::state::test_support::{drain_tx, test_context};

    fn frame_from(ctx: &AgentContext, from: u32, packet_type: PacketType, ttl: u8, payload: &impl serde::Serialize) -> Frame {
        Frame {
            packet_type,
            src_mac: ctx.directory.mac_of(from).unwrap(),
            dst_mac: BROADCAST_MAC,
            ttl,
            payload: serde_json::to_vec(payload).unwrap(),
        }
    }

    fn rreq(origin: u32, dest: u32, rreq_id: u32, now: f64) -> RreqPayload {
        RreqPayload { origin_id: origin, dest_id: dest, rreq_id, hop_count: 0, timestamp: now }
    }

    #[test]
    fn hello_populates_metrics() {
        let (ctx, tx, _persist) = test_context(4, &[0, 1]);
        let now = 2_000_000_000.0;
        let hello = HelloPayload {
            node_id: 1,
            seq_num: 3,
            timestamp: now - 0.05,
            mac_address: ctx.directory.mac_of(1).unwrap().to_string(),
            agent_id: "agent-1-1".to_string(),
            kind: "hello".to_string(),
        };
        let frame = frame_from(ctx, 1, PacketType::Hello, 10, &hello);
        handle_frame(ctx, &frame, now);

        ctx.metrics.lock(|m| {
            let m = m.borrow();
            assert_eq!(m.active_neighbors(now), vec![1]);
            assert_eq!(m.edge_metric(1, 4, crate::metrics::MetricKind::Rssi, -90.0), -55.0);
            assert_eq!(m.edge_metric(1, 4, crate::metrics::MetricKind::Delay, 0.0), 50.0);
        });
        assert!(drain_tx(&tx).is_empty());
    }

    #[test]
    fn rreq_dedup_forwards_once() {
        let (ctx, tx, _persist) = test_context(2, &[4, 0, 1]);
        let now = 2_000_000_000.0;
        let payload = rreq(4, 0, 7, now);
        let frame = frame_from(ctx, 4, PacketType::Rreq, 10, &payload);

        handle_frame(ctx, &frame, now);
        handle_frame(ctx, &frame, now + 0.1);

        let sent = drain_tx(&tx);
        assert_eq!(sent.len(), 1, "exactly one rebroadcast expected");
        assert_eq!(sent[0].packet_type, PacketType::Rreq);
        assert_eq!(sent[0].ttl, 9);
        let forwarded: RreqPayload = sent[0].payload_json().unwrap();
        assert_eq!(forwarded.hop_count, 1);
        assert_eq!(forwarded.rreq_id, 7);

        let reverse = ctx.reverse.lock(|r| r.borrow().valid_route(4, now).cloned()).unwrap();
        assert_eq!(reverse.next_hop, 4);
        assert_eq!(reverse.hop_count, 1);
    }

    #[test]
    fn rreq_ttl_exhaustion_drops() {
        let (ctx, tx, _persist) = test_context(2, &[4, 0, 1]);
        let now = 2_000_000_000.0;
        let frame = frame_from(ctx, 4, PacketType::Rreq, 1, &rreq(4, 0, 8, now));
        handle_frame(ctx, &frame, now);
        assert!(drain_tx(&tx).is_empty(), "post-decrement TTL is 0, no rebroadcast");
    }

    #[test]
    fn rreq_for_self_replies_rrep() {
        let (ctx, tx, _persist) = test_context(0, &[4, 2]);
        let now = 2_000_000_000.0;
        let frame = frame_from(ctx, 4, PacketType::Rreq, 10, &rreq(4, 0, 9, now));
        handle_frame(ctx, &frame, now);

        let sent = drain_tx(&tx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].packet_type, PacketType::Rrep);
        assert_eq!(sent[0].dst_mac, ctx.directory.mac_of(4).unwrap());
        let reply: RrepPayload = sent[0].payload_json().unwrap();
        assert_eq!(reply.hop_count, 0);
        assert_eq!(reply.dest_id, 0);
    }

    #[test]
    fn rreq_answered_from_existing_route() {
        let (ctx, tx, _persist) = test_context(2, &[4, 0, 1]);
        let now = 2_000_000_000.0;
        ctx.routing.lock(|rt| commit_route(&mut rt.borrow_mut(), 0, &[2, 1, 0], 1, now));

        let frame = frame_from(ctx, 4, PacketType::Rreq, 10, &rreq(4, 0, 10, now));
        handle_frame(ctx, &frame, now);

        let sent = drain_tx(&tx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].packet_type, PacketType::Rrep);
        let reply: RrepPayload = sent[0].payload_json().unwrap();
        assert_eq!(reply.hop_count, 2);
    }

    #[test]
    fn rrep_installs_and_keeps_better_route() {
        let (ctx, _tx, _persist) = test_context(4, &[0, 1]);
        let now = 2_000_000_000.0;
        let direct = RrepPayload { origin_id: 4, dest_id: 0, rreq_id: 5, hop_count: 0, timestamp: now };
        handle_frame(ctx, &frame_from(ctx, 0, PacketType::Rrep, 10, &direct), now);

        let route = ctx.routing.lock(|rt| rt.borrow().valid_route(0, now).cloned()).unwrap();
        assert_eq!(route.next_hop, 0);
        assert_eq!(route.hop_count, 1);
        assert_eq!(route.path, vec![4, 0]);

        // A longer advertisement must not displace the direct route.
        let worse = RrepPayload { origin_id: 4, dest_id: 0, rreq_id: 6, hop_count: 4, timestamp: now };
        handle_frame(ctx, &frame_from(ctx, 1, PacketType::Rrep, 10, &worse), now + 0.1);
        let route = ctx.routing.lock(|rt| rt.borrow().valid_route(0, now + 0.1).cloned()).unwrap();
        assert_eq!(route.next_hop, 0);
    }

    #[test]
    fn rrep_forwarded_toward_origin() {
        let (ctx, tx, _persist) = test_context(2, &[4, 0, 1]);
        let now = 2_000_000_000.0;
        // Seed the reverse route by processing the origin's RREQ first.
        handle_frame(ctx, &frame_from(ctx, 4, PacketType::Rreq, 10, &rreq(4, 0, 11, now)), now);
        drain_tx(&tx);

        let reply = RrepPayload { origin_id: 4, dest_id: 0, rreq_id: 11, hop_count: 0, timestamp: now };
        handle_frame(ctx, &frame_from(ctx, 0, PacketType::Rrep, 10, &reply), now + 0.1);

        // Forward route installed locally as well.
        let route = ctx.routing.lock(|rt| rt.borrow().valid_route(0, now + 0.1).cloned()).unwrap();
        assert_eq!(route.next_hop, 0);

        let sent = drain_tx(&tx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].packet_type, PacketType::Rrep);
        assert_eq!(sent[0].dst_mac, ctx.directory.mac_of(4).unwrap());
        assert_eq!(sent[0].ttl, 9);
        let forwarded: RrepPayload = sent[0].payload_json().unwrap();
        assert_eq!(forwarded.hop_count, 1);
    }

    #[test]
    fn data_at_destination_returns_ack_with_hop_metric() {
        let (ctx, tx, _persist) = test_context(0, &[4, 2]);
        let now = 2_000_000_000.0;
        let data = DataPayload {
            packet_id: 99,
            payload: "hi".to_string(),
            source: 4,
            destination: 0,
            timestamp: now - 0.1,
            path: vec![4, 0],
            route: vec![4, 0],
            agent_id: "agent-4-1".to_string(),
            kind: "data".to_string(),
            hop_metrics: Vec::new(),
        };
        handle_frame(ctx, &frame_from(ctx, 4, PacketType::Data, 10, &data), now);

        let sent = drain_tx(&tx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].packet_type, PacketType::Ack);
        assert_eq!(sent[0].dst_mac, ctx.directory.mac_of(4).unwrap());
        let ack: AckPayload = sent[0].payload_json().unwrap();
        assert_eq!(ack.packet_id, 99);
        assert_eq!(ack.source, 0);
        assert_eq!(ack.destination, 4);
        assert_eq!(ack.hop_metrics.len(), 1);
        assert_eq!(ack.hop_metrics[0].u, 4);
        assert_eq!(ack.hop_metrics[0].v, 0);
        assert_eq!(ack.hop_metrics[0].rssi, Some(-55.0));
    }

    #[test]
    fn data_relay_forwards_untouched_payload() {
        let (ctx, tx, _persist) = test_context(2, &[4, 0, 1]);
        let now = 2_000_000_000.0;
        ctx.routing.lock(|rt| commit_route(&mut rt.borrow_mut(), 0, &[2, 1, 0], 1, now));

        let data = DataPayload {
            packet_id: 42,
            payload: "hi".to_string(),
            source: 4,
            destination: 0,
            timestamp: now,
            path: vec![4, 2, 0],
            route: vec![4, 2, 0],
            agent_id: "agent-4-1".to_string(),
            kind: "data".to_string(),
            hop_metrics: Vec::new(),
        };
        let frame = frame_from(ctx, 4, PacketType::Data, 10, &data);
        handle_frame(ctx, &frame, now);

        let sent = drain_tx(&tx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].dst_mac, ctx.directory.mac_of(1).unwrap());
        assert_eq!(sent[0].ttl, 9);
        assert_eq!(sent[0].payload, frame.payload, "relay must not rewrite the payload");
    }

    #[test]
    fn data_relay_without_route_drops() {
        let (ctx, tx, _persist) = test_context(2, &[4, 0, 1]);
        let now = 2_000_000_000.0;
        let data = DataPayload {
            packet_id: 43,
            payload: "hi".to_string(),
            source: 4,
            destination: 0,
            timestamp: now,
            path: vec![],
            route: vec![],
            agent_id: String::new(),
            kind: "data".to_string(),
            hop_metrics: Vec::new(),
        };
        handle_frame(ctx, &frame_from(ctx, 4, PacketType::Data, 10, &data), now);
        assert!(drain_tx(&tx).is_empty());
    }

    #[test]
    fn two_node_data_ack_accounting() {
        let (ctx, tx, persist) = test_context(4, &[0]);
        let now = 2_000_000_000.0;

        let packet_id = send_data(ctx, 0, "hi", now).unwrap();
        let sent = drain_tx(&tx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].packet_type, PacketType::Data);
        assert_eq!(sent[0].dst_mac, ctx.directory.mac_of(0).unwrap());
        assert_eq!(ctx.e2e.lock(|t| t.borrow().pending_count()), 1);

        // The ACK node 0 would produce for that DATA packet.
        let ack = AckPayload {
            packet_id,
            sent_ts: now,
            ack_ts: now + 0.2,
            source: 0,
            destination: 4,
            route: vec![4, 0],
            hop_metrics: vec![HopMetric { u: 4, v: 0, rssi: Some(-55.0), delay: None, pdr: None }],
            agent_id: "agent-0-1".to_string(),
            kind: "ack".to_string(),
        };
        let frame = frame_from(ctx, 0, PacketType::Ack, 10, &ack);
        handle_frame(ctx, &frame, now + 0.2);

        assert_eq!(ctx.e2e.lock(|t| t.borrow().pending_count()), 0);
        assert_eq!(ctx.e2e.lock(|t| t.borrow().ack_count(0)), 1);
        let stats = ctx.e2e.lock(|t| t.borrow_mut().window_stats(0, now + 0.3));
        assert_eq!(stats.pdr, 100.0);

        let record = persist.try_receive().unwrap();
        let PersistRecord::E2eMetric(row) = record else {
            panic!("expected e2e record");
        };
        assert_eq!(row.source_node, 4);
        assert_eq!(row.destination_node, 0);
        assert!(row.success);
        assert_eq!(row.hops, 1);
        assert_eq!(row.e2e_rssi_avg, Some(-55.0));
        assert!(row.e2e_delay_ms >= 0.0 && row.e2e_delay_ms <= 2000.0);
        assert_eq!(row.window_pdr, 100.0);

        // Replaying the same ACK changes nothing and persists nothing.
        handle_frame(ctx, &frame, now + 0.4);
        assert_eq!(ctx.e2e.lock(|t| t.borrow().ack_count(0)), 1);
        assert!(persist.try_receive().is_err());
    }

    #[test]
    fn ack_for_other_node_is_ignored() {
        let (ctx, _tx, persist) = test_context(4, &[0, 2]);
        let now = 2_000_000_000.0;
        let ack = AckPayload {
            packet_id: 5,
            sent_ts: now,
            ack_ts: now,
            source: 0,
            destination: 2,
            route: vec![2, 0],
            hop_metrics: Vec::new(),
            agent_id: String::new(),
            kind: "ack".to_string(),
        };
        handle_frame(ctx, &frame_from(ctx, 0, PacketType::Ack, 10, &ack), now);
        assert!(persist.try_receive().is_err());
    }

    #[test]
    fn send_data_without_route_or_mac_fails_with_rerr() {
        let (ctx, tx, _persist) = test_context(4, &[0]);
        let now = 2_000_000_000.0;
        let result = send_data(ctx, 9, "hi", now);
        assert!(result.is_err());
        let sent = drain_tx(&tx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].packet_type, PacketType::Rerr);
        let rerr: RerrPayload = sent[0].payload_json().unwrap();
        assert_eq!(rerr.unreachable_node, 9);
    }

    #[test]
    fn rerr_drops_route_and_rediscovers() {
        let (ctx, tx, _persist) = test_context(4, &[0, 5]);
        let now = 2_000_000_000.0;
        ctx.routing.lock(|rt| commit_route(&mut rt.borrow_mut(), 5, &[4, 5], 1, now));
        ctx.metrics.lock(|m| m.borrow_mut().note_hello(5, now));

        let rerr = RerrPayload { unreachable_node: 5, seq_num: 1, timestamp: now };
        handle_frame(ctx, &frame_from(ctx, 0, PacketType::Rerr, 10, &rerr), now);

        assert!(ctx.routing.lock(|rt| rt.borrow().valid_route(5, now).is_none()));
        assert!(ctx.metrics.lock(|m| m.borrow().active_neighbors(now).is_empty()));
        let sent = drain_tx(&tx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].packet_type, PacketType::Rreq);
        let rediscovery: RreqPayload = sent[0].payload_json().unwrap();
        assert_eq!(rediscovery.dest_id, 5);
    }

    #[test]
    fn discovery_is_noop_with_valid_route() {
        let (ctx, tx, _persist) = test_context(4, &[0]);
        let now = crate::clock::unix_now();
        ctx.routing.lock(|rt| commit_route(&mut rt.borrow_mut(), 0, &[4, 0], 1, now));
        let found = futures::executor::block_on(discover_route(ctx, 0, 0.1, 0));
        assert!(found);
        assert!(drain_tx(&tx).is_empty(), "no RREQ when a valid route exists");
    }

    #[test]
    fn hello_from_self_is_ignored() {
        let (ctx, tx, _persist) = test_context(4, &[0]);
        let now = 2_000_000_000.0;
        let hello = HelloPayload {
            node_id: 4,
            seq_num: 1,
            timestamp: now,
            mac_address: ctx.directory.self_mac().to_string(),
            agent_id: "agent-4-1".to_string(),
            kind: "hello".to_string(),
        };
        let frame = Frame {
            packet_type: PacketType::Hello,
            src_mac: ctx.directory.self_mac(),
            dst_mac: BROADCAST_MAC,
            ttl: 10,
            payload: serde_json::to_vec(&hello).unwrap(),
        };
        handle_frame(ctx, &frame, now);
        assert_eq!(ctx.metrics.lock(|m| m.borrow().neighbor_count()), 0);
        assert!(drain_tx(&tx).is_empty());
    }

    #[test]
    fn malformed_payload_is_dropped() {
        let (ctx, tx, _persist) = test_context(4, &[0]);
        let frame = Frame {
            packet_type: PacketType::Rreq,
            src_mac: ctx.directory.mac_of(0).unwrap(),
            dst_mac: BROADCAST_MAC,
            ttl: 10,
            payload: b"not json".to_vec(),
        };
        handle_frame(ctx, &frame, 2_000_000_000.0);
        assert!(drain_tx(&tx).is_empty());
    }
}
