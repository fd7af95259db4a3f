//! Routing table, reverse route cache, and RREQ deduplication.
//!
//! Entries expire implicitly: an entry is valid only while its last update
//! is within the route timeout. Deletion happens eagerly only on RERR.

use std::collections::HashMap;

/// A forward route toward a destination. `path` always starts at the local
/// node and ends at the destination, with no repeated nodes; `hop_count` is
/// `path.len() - 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteEntry {
    pub next_hop: u32,
    pub hop_count: u32,
    pub seq_num: u32,
    pub last_update: f64,
    pub path: Vec<u32>,
}

/// True when `path` is usable as a route from `self_id` to `dest`: pinned
/// endpoints, no duplicates, at least one hop.
pub fn is_valid_path(path: &[u32], self_id: u32, dest: u32) -> bool {
    if path.len() < 2 || path[0] != self_id || *path.last().unwrap() != dest {
        return false;
    }
    let mut seen = std::collections::HashSet::new();
    path.iter().all(|node| seen.insert(*node))
}

/// Render a path the way persisted rows carry it, e.g. `4-1-0`.
pub fn route_string(path: &[u32]) -> String {
    path.iter().map(|n| n.to_string()).collect::<Vec<_>>().join("-")
}

pub struct RoutingTable {
    route_timeout: f64,
    entries: HashMap<u32, RouteEntry>,
}

impl RoutingTable {
    pub fn new(route_timeout: f64) -> Self {
        RoutingTable { route_timeout, entries: HashMap::new() }
    }

    /// Install or replace the route for a destination. The entry is
    /// normalized so the path invariant holds: `hop_count` always matches
    /// the stored path length.
    pub fn install(&mut self, dest: u32, mut entry: RouteEntry) {
        entry.hop_count = entry.path.len().saturating_sub(1) as u32;
        self.entries.insert(dest, entry);
    }

    /// The route for `dest` if one exists and is fresh.
    pub fn valid_route(&self, dest: u32, now: f64) -> Option<&RouteEntry> {
        self.entries.get(&dest).filter(|e| now - e.last_update <= self.route_timeout)
    }

    pub fn remove(&mut self, dest: u32) -> Option<RouteEntry> {
        self.entries.remove(&dest)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Next hop back toward a RREQ origin, cached when the first copy of that
/// RREQ is seen. Used to return RREPs without a forward route.
#[derive(Debug, Clone, PartialEq)]
pub struct ReverseEntry {
    pub next_hop: u32,
    pub hop_count: u32,
    pub last_update: f64,
}

pub struct ReverseRoutes {
    route_timeout: f64,
    entries: HashMap<u32, ReverseEntry>,
}

impl ReverseRoutes {
    pub fn new(route_timeout: f64) -> Self {
        ReverseRoutes { route_timeout, entries: HashMap::new() }
    }

    pub fn note(&mut self, origin: u32, next_hop: u32, hop_count: u32, now: f64) {
        self.entries.insert(origin, ReverseEntry { next_hop, hop_count, last_update: now });
    }

    pub fn valid_route(&self, origin: u32, now: f64) -> Option<&ReverseEntry> {
        self.entries.get(&origin).filter(|e| now - e.last_update <= self.route_timeout)
    }
}

/// Already-processed RREQ identifiers `(origin, rreq_id)`. Membership stops
/// both reprocessing and rebroadcast; ids age out after the route timeout.
pub struct RreqSeen {
    route_timeout: f64,
    seen: HashMap<(u32, u32), f64>,
}

impl RreqSeen {
    pub fn new(route_timeout: f64) -> Self {
        RreqSeen { route_timeout, seen: HashMap::new() }
    }

    /// Returns `true` when the id is new (and records it), `false` on a
    /// duplicate. Stale ids are pruned on every insert.
    pub fn insert(&mut self, origin: u32, rreq_id: u32, now: f64) -> bool {
        let timeout = self.route_timeout;
        self.seen.retain(|_, t| now - *t <= timeout);
        if self.seen.contains_key(&(origin, rreq_id)) {
            return false;
        }
        self.seen.insert((origin, rreq_id), now);
        true
    }
}
