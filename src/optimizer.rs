//! PSO-GA hybrid route optimizer.
//!
//! Searches the known-neighbor topology for a fitness-maximizing path to a
//! destination. A particle is a candidate path with pinned endpoints; each
//! iteration runs a PSO velocity update followed by a GA generation
//! (elitism, roulette selection, arithmetic crossover, mutation).
//!
//! The "velocity" here is not a positional delta: it is a scalar per hop
//! slot used as an index hash into the available-neighbor list when the
//! path is rebuilt. The fitness landscape is coarse and mostly driven by
//! the GA operators; the scalar velocity is kept for behavioral fidelity
//! with deployed agents.

use rand::Rng;

use crate::metrics::{MetricKind, MetricStore};
use crate::routing::{RouteEntry, RoutingTable, is_valid_path};

pub const PSO_POPULATION: usize = 30;
pub const PSO_MAX_ITERATIONS: u32 = 50;
pub const PSO_CONVERGENCE_THRESHOLD: f64 = 0.001;
pub const PSO_NO_IMPROVEMENT_LIMIT: u32 = 10;
const PSO_INERTIA: f64 = 0.7;
const PSO_C1: f64 = 1.5;
const PSO_C2: f64 = 1.5;
const GA_CROSSOVER_RATE: f64 = 0.8;
const GA_MUTATION_RATE: f64 = 0.05;
const GA_ELITE_FRACTION: f64 = 0.1;

/// Defaults fed to the fitness function for unmeasured edges.
const DEFAULT_RSSI: f64 = -90.0;
const DEFAULT_DELAY_MS: f64 = 100.0;
const DEFAULT_PDR: f64 = 50.0;

/// Longest path (in nodes) the initializer generates.
const MAX_INITIAL_PATH_LEN: usize = 4;

#[derive(Debug, Clone)]
struct Particle {
    path: Vec<u32>,
    /// One scalar per hop slot; see the module docs.
    velocity: Vec<f64>,
    best_path: Vec<u32>,
    best_fitness: f64,
    fitness: f64,
}

/// Result of one optimization run.
#[derive(Debug, Clone)]
pub struct OptimizeOutcome {
    pub path: Vec<u32>,
    pub fitness: f64,
    pub iterations: u32,
}

/// Score a candidate path against the aggregated edge metrics.
///
/// Each hop contributes `0.5·norm_rssi + 0.3·norm_delay + 0.2·norm_pdr`
/// with all components clamped into `[0, 1]`; the mean over hops is then
/// damped by `1 / (1 + ln(1 + hops))` so longer paths must earn their
/// extra hops. Invalid paths score negative infinity.
pub fn path_fitness(store: &MetricStore, self_id: u32, dest: u32, path: &[u32]) -> f64 {
    if !is_valid_path(path, self_id, dest) {
        return f64::NEG_INFINITY;
    }
    let hops = path.len() - 1;
    let mut total = 0.0;
    for hop in path.windows(2) {
        let (u, v) = (hop[0], hop[1]);
        let rssi = store.edge_metric(u, v, MetricKind::Rssi, DEFAULT_RSSI);
        let delay = store.edge_metric(u, v, MetricKind::Delay, DEFAULT_DELAY_MS);
        let pdr = store.edge_metric(u, v, MetricKind::Pdr, DEFAULT_PDR);
        let norm_rssi = ((rssi + 110.0) / 40.0).clamp(0.0, 1.0);
        let norm_delay = (1.0 - delay / 100.0).clamp(0.0, 1.0);
        let norm_pdr = (pdr / 100.0).clamp(0.0, 1.0);
        total += 0.5 * norm_rssi + 0.3 * norm_delay + 0.2 * norm_pdr;
    }
    (total / hops as f64) / (1.0 + ((1 + hops) as f64).ln())
}

/// Mean edge metrics along a path, used for the persisted route record.
pub fn path_averages(store: &MetricStore, path: &[u32]) -> (f64, f64, f64) {
    let hops = path.len().saturating_sub(1).max(1) as f64;
    let mut rssi = 0.0;
    let mut delay = 0.0;
    let mut pdr = 0.0;
    for hop in path.windows(2) {
        rssi += store.edge_metric(hop[0], hop[1], MetricKind::Rssi, DEFAULT_RSSI);
        delay += store.edge_metric(hop[0], hop[1], MetricKind::Delay, DEFAULT_DELAY_MS);
        pdr += store.edge_metric(hop[0], hop[1], MetricKind::Pdr, DEFAULT_PDR);
    }
    (rssi / hops, delay / hops, pdr / hops)
}

/// Rebuild a candidate into a valid path: pinned endpoints, first
/// occurrence wins on duplicates.
fn repair_path(candidate: &[u32], self_id: u32, dest: u32) -> Vec<u32> {
    let mut path = vec![self_id];
    for &node in candidate {
        if node == self_id || node == dest || path.contains(&node) {
            continue;
        }
        path.push(node);
    }
    path.push(dest);
    path
}

/// Random initial path: length uniform in `[2, min(4, |available| + 1)]`,
/// intermediates sampled without replacement.
fn random_path(self_id: u32, dest: u32, available: &[u32], rng: &mut impl Rng) -> Vec<u32> {
    let upper = available.len().saturating_add(1).min(MAX_INITIAL_PATH_LEN).max(2);
    let len = rng.gen_range(2..=upper);
    let mut pool: Vec<u32> = available.to_vec();
    let mut path = vec![self_id];
    for _ in 0..len.saturating_sub(2) {
        if pool.is_empty() {
            break;
        }
        let idx = rng.gen_range(0..pool.len());
        path.push(pool.swap_remove(idx));
    }
    path.push(dest);
    path
}

/// Rebuild a particle's path from its velocity: each scalar indexes into
/// the available list; duplicates and the destination are skipped.
fn rebuild_from_velocity(velocity: &[f64], self_id: u32, dest: u32, available: &[u32]) -> Vec<u32> {
    let mut path = vec![self_id];
    if !available.is_empty() {
        for v in velocity {
            let idx = (v.abs() * available.len() as f64).floor() as usize % available.len();
            let candidate = available[idx];
            if candidate == dest || path.contains(&candidate) {
                continue;
            }
            path.push(candidate);
        }
    }
    path.push(dest);
    path
}

/// Roulette-wheel selection over non-negative fitness; falls back to a
/// uniform pick when the wheel has no mass.
fn roulette<'a>(particles: &'a [Particle], rng: &mut impl Rng) -> &'a Particle {
    let total: f64 = particles.iter().map(|p| p.fitness.max(0.0)).sum();
    if total <= 0.0 {
        return &particles[rng.gen_range(0..particles.len())];
    }
    let mut spin = rng.gen_range(0.0..total);
    for particle in particles {
        spin -= particle.fitness.max(0.0);
        if spin <= 0.0 {
            return particle;
        }
    }
    particles.last().expect("population is never empty")
}

/// Arithmetic crossover over midsection position scores. A node absent
/// from one parent's midsection contributes position 1.0, pushing it
/// toward the tail of the ordering.
fn crossover(parent1: &[u32], parent2: &[u32], self_id: u32, dest: u32, rng: &mut impl Rng) -> Vec<u32> {
    let alpha = rng.gen_range(0.25..0.75);
    let mid1 = &parent1[1..parent1.len() - 1];
    let mid2 = &parent2[1..parent2.len() - 1];

    let mut union: Vec<u32> = Vec::new();
    for &node in mid1.iter().chain(mid2.iter()) {
        if !union.contains(&node) {
            union.push(node);
        }
    }
    if union.is_empty() {
        return vec![self_id, dest];
    }

    let position = |mid: &[u32], node: u32| -> f64 {
        mid.iter()
            .position(|&x| x == node)
            .map(|i| i as f64 / mid.len() as f64)
            .unwrap_or(1.0)
    };
    let mut scored: Vec<(f64, u32)> = union
        .iter()
        .map(|&node| (alpha * position(mid1, node) + (1.0 - alpha) * position(mid2, node), node))
        .collect();
    scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let take = ((alpha * union.len() as f64).floor() as usize).max(1);
    let mid: Vec<u32> = scored.iter().take(take).map(|&(_, node)| node).collect();
    repair_path(&mid, self_id, dest)
}

/// One of add / remove / replace, chosen uniformly. Endpoints are never
/// touched; uniqueness is preserved by candidate filtering.
fn mutate(path: &mut Vec<u32>, self_id: u32, dest: u32, available: &[u32], rng: &mut impl Rng) {
    match rng.gen_range(0..3u8) {
        0 => {
            let candidates: Vec<u32> = available.iter().copied().filter(|n| !path.contains(n) && *n != self_id && *n != dest).collect();
            if !candidates.is_empty() {
                let node = candidates[rng.gen_range(0..candidates.len())];
                let pos = rng.gen_range(1..path.len());
                path.insert(pos, node);
            }
        }
        1 => {
            if path.len() > 2 {
                let pos = rng.gen_range(1..path.len() - 1);
                path.remove(pos);
            }
        }
        _ => {
            if path.len() > 2 {
                let candidates: Vec<u32> = available.iter().copied().filter(|n| !path.contains(n) && *n != self_id && *n != dest).collect();
                if !candidates.is_empty() {
                    let node = candidates[rng.gen_range(0..candidates.len())];
                    let pos = rng.gen_range(1..path.len() - 1);
                    path[pos] = node;
                }
            }
        }
    }
}

/// Best direct or single-intermediate path, used when the swarm somehow
/// produces nothing valid and as the caller's last resort.
pub fn single_hop_fallback(store: &MetricStore, self_id: u32, dest: u32, neighbors: &[u32]) -> Option<Vec<u32>> {
    let mut best: Option<(f64, Vec<u32>)> = None;
    let mut consider = |path: Vec<u32>, best: &mut Option<(f64, Vec<u32>)>| {
        let fitness = path_fitness(store, self_id, dest, &path);
        if fitness.is_finite() && best.as_ref().map(|(f, _)| fitness > *f).unwrap_or(true) {
            *best = Some((fitness, path));
        }
    };
    consider(vec![self_id, dest], &mut best);
    for &n in neighbors {
        if n != self_id && n != dest {
            consider(vec![self_id, n, dest], &mut best);
        }
    }
    best.map(|(_, path)| path)
}

/// Run the PSO-GA search for a path from `self_id` to `dest` over the
/// given available intermediate nodes. Returns `None` only when the
/// request is degenerate (destination is self).
pub fn optimize_route(store: &MetricStore, self_id: u32, dest: u32, available: &[u32], rng: &mut impl Rng) -> Option<OptimizeOutcome> {
    if dest == self_id {
        return None;
    }
    let available: Vec<u32> = available.iter().copied().filter(|&n| n != self_id && n != dest).collect();

    let mut particles: Vec<Particle> = (0..PSO_POPULATION)
        .map(|_| {
            let path = random_path(self_id, dest, &available, rng);
            let fitness = path_fitness(store, self_id, dest, &path);
            Particle {
                velocity: (0..path.len() - 1).map(|_| rng.r#gen::<f64>()).collect(),
                best_path: path.clone(),
                best_fitness: fitness,
                fitness,
                path,
            }
        })
        .collect();

    let mut gbest_path = particles[0].path.clone();
    let mut gbest_fitness = particles[0].fitness;
    for particle in &particles {
        if particle.fitness > gbest_fitness {
            gbest_fitness = particle.fitness;
            gbest_path = particle.path.clone();
        }
    }

    let mut no_improvement = 0u32;
    let mut iterations = 0u32;

    for iter in 1..=PSO_MAX_ITERATIONS {
        iterations = iter;
        let previous_gbest = gbest_fitness;

        // PSO velocity update and path rebuild.
        for particle in particles.iter_mut() {
            for v in particle.velocity.iter_mut() {
                let r1: f64 = rng.r#gen();
                let r2: f64 = rng.r#gen();
                *v = PSO_INERTIA * *v
                    + PSO_C1 * r1 * (particle.best_fitness - particle.fitness)
                    + PSO_C2 * r2 * (gbest_fitness - particle.fitness);
            }
            particle.path = rebuild_from_velocity(&particle.velocity, self_id, dest, &available);
            particle.velocity.resize_with(particle.path.len() - 1, || rng.r#gen());
            particle.fitness = path_fitness(store, self_id, dest, &particle.path);
            if particle.fitness > particle.best_fitness {
                particle.best_fitness = particle.fitness;
                particle.best_path = particle.path.clone();
            }
            if particle.fitness > gbest_fitness {
                gbest_fitness = particle.fitness;
                gbest_path = particle.path.clone();
            }
        }

        // GA generation: elitism, selection, crossover, mutation.
        particles.sort_by(|a, b| b.fitness.partial_cmp(&a.fitness).unwrap_or(std::cmp::Ordering::Equal));
        let elite_count = ((GA_ELITE_FRACTION * PSO_POPULATION as f64).floor() as usize).max(1);
        let mut next: Vec<Particle> = particles[..elite_count].to_vec();
        while next.len() < PSO_POPULATION {
            let parent1 = roulette(&particles, rng);
            let parent2 = roulette(&particles, rng);
            let mut child_path = if rng.r#gen::<f64>() < GA_CROSSOVER_RATE {
                crossover(&parent1.path, &parent2.path, self_id, dest, rng)
            } else {
                parent1.path.clone()
            };
            if rng.r#gen::<f64>() < GA_MUTATION_RATE {
                mutate(&mut child_path, self_id, dest, &available, rng);
            }
            let child_path = repair_path(&child_path[1..child_path.len() - 1], self_id, dest);
            let fitness = path_fitness(store, self_id, dest, &child_path);
            next.push(Particle {
                velocity: (0..child_path.len() - 1).map(|_| rng.r#gen()).collect(),
                best_path: child_path.clone(),
                best_fitness: fitness,
                fitness,
                path: child_path,
            });
        }
        particles = next;
        for particle in &particles {
            if particle.fitness > gbest_fitness {
                gbest_fitness = particle.fitness;
                gbest_path = particle.path.clone();
            }
        }

        if (gbest_fitness - previous_gbest).abs() < PSO_CONVERGENCE_THRESHOLD {
            no_improvement += 1;
            if no_improvement >= PSO_NO_IMPROVEMENT_LIMIT {
                break;
            }
        } else {
            no_improvement = 0;
        }
    }

    // Should be impossible by construction; kept as a safety net.
    if !is_valid_path(&gbest_path, self_id, dest) {
        let fallback = single_hop_fallback(store, self_id, dest, &available)?;
        let fitness = path_fitness(store, self_id, dest, &fallback);
        return Some(OptimizeOutcome { path: fallback, fitness, iterations });
    }

    Some(OptimizeOutcome { path: gbest_path, fitness: gbest_fitness, iterations })
}

/// Install an optimized path into the routing table.
pub fn commit_route(routing: &mut RoutingTable, dest: u32, path: &[u32], seq_num: u32, now: f64) {
    routing.install(
        dest,
        RouteEntry {
            next_hop: path[1],
            hop_count: path.len() as u32 - 1,
            seq_num,
            last_update: now,
            path: path.to_vec(),
        },
    );
}
