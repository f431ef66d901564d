//! Graph construction.
//!
//! Inserts every stored vector into a [`BuildGraph`] with bidirectional
//! connections and policy-driven pruning (Algorithm 1 from the HNSW paper).
//! Insertions run on a dedicated rayon pool; each node layer is locked on its
//! own and a worker never holds more than one lock at a time.

use crate::config;
use crate::error::{IndexError, Result};
use crate::hnsw::distance::DistanceMetric;
use crate::hnsw::graph::{BuildConfig, BuildGraph, GraphMerging, NeighborPolicy};
use crate::hnsw::search::{greedy_descent, search_layer};
use crate::hnsw::select::select_neighbors;
use crate::hnsw::store::VectorStore;
use crate::hnsw::visited::VisitedSet;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Draw `n` node levels from a generator seeded with `seed`.
///
/// `level = floor(-ln(u) * mult)` with `u` uniform in `[0, 1)`; a draw below
/// machine epsilon counts as 1 (level 0). Levels are capped at
/// [`config::HNSW_MAX_LEVEL`].
pub fn draw_levels(n: usize, mult: f64, seed: u64) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let mut r: f64 = rng.gen();
            if r < f64::EPSILON {
                r = 1.0;
            }
            let level = (-r.ln() * mult).floor();
            (level as usize).min(config::HNSW_MAX_LEVEL)
        })
        .collect()
}

/// Whether a link may evict its target while pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkMode {
    Prune,
    /// The target survives pruning of the source's list.
    KeepTarget,
}

/// Builds a proximity graph over a vector store.
pub struct GraphBuilder<'a> {
    store: &'a VectorStore,
    metric: DistanceMetric,
    config: BuildConfig,
    pool: Option<rayon::ThreadPool>,
}

impl<'a> GraphBuilder<'a> {
    /// Creates a builder. `config` is resolved against the defaults first.
    pub fn new(store: &'a VectorStore, metric: DistanceMetric, config: &BuildConfig) -> Result<Self> {
        let config = config.resolved();
        let pool = if config.n_threads > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.n_threads)
                .thread_name(|i| format!("navgraph-build-{i}"))
                .build()
                .map_err(|e| IndexError::InvalidConfig(format!("cannot start build pool: {e}")))?;
            Some(pool)
        } else {
            None
        };
        Ok(Self {
            store,
            metric,
            config,
            pool,
        })
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    #[inline]
    pub(crate) fn store(&self) -> &VectorStore {
        self.store
    }

    #[inline]
    pub(crate) fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// Distance between two stored nodes.
    #[inline]
    pub(crate) fn node_distance(&self, a: u32, b: u32) -> f32 {
        self.metric
            .distance(self.store.vector(a), self.store.vector(b))
    }

    /// Build the arena for every stored vector. Checks `cancel` between node
    /// insertions and fails with [`IndexError::Cancelled`] once it is set.
    pub(crate) fn build(&self, cancel: &AtomicBool) -> Result<BuildGraph> {
        let n = self.store.len();
        if n == 0 {
            return Err(IndexError::EmptyIndex);
        }
        let mult = self.config.level_mult();
        let levels = draw_levels(n, mult, self.config.seed);
        info!(
            nodes = n,
            m = self.config.m,
            max_m0 = self.config.max_m0,
            ef_construction = self.config.ef_construction,
            threads = self.config.n_threads,
            policy = %self.config.neighbor_policy,
            mult,
            "building graph"
        );

        let graph = self.build_pass(&levels, false, cancel)?;
        if self.config.graph_merging == GraphMerging::MergeLevel0 {
            info!("graph post processing: merge_level0");
            let reverse = self.build_pass(&levels, true, cancel)?;
            self.merge_level0(&graph, &reverse);
        }
        Ok(graph)
    }

    /// One full insertion pass. Node 0 seeds the graph; the rest are inserted
    /// in ascending id order, or descending when `reverse` is set.
    fn build_pass(&self, levels: &[usize], reverse: bool, cancel: &AtomicBool) -> Result<BuildGraph> {
        let n = levels.len();
        let graph = BuildGraph::new(levels, 0, self.config.m, self.config.max_m0);
        let mut ids: Vec<u32> = (1..n as u32).collect();
        if reverse {
            ids.reverse();
        }

        let insert_one = |visited: &mut VisitedSet, id: u32| -> Result<()> {
            if cancel.load(Ordering::Relaxed) {
                return Err(IndexError::Cancelled);
            }
            self.insert(&graph, id, visited);
            Ok(())
        };

        match &self.pool {
            None => {
                let mut visited = VisitedSet::new(n);
                for &id in &ids {
                    insert_one(&mut visited, id)?;
                }
            }
            Some(pool) => pool.install(|| {
                ids.par_iter()
                    .with_min_len(config::BUILD_CHUNK_SIZE)
                    .try_for_each_init(|| VisitedSet::new(n), |visited, &id| insert_one(visited, id))
            })?,
        }
        debug!(nodes = n, reverse, "insertion pass finished");
        Ok(graph)
    }

    /// Insert node `id` (already allocated in `graph` with its level).
    pub(crate) fn insert(&self, graph: &BuildGraph, id: u32, visited: &mut VisitedSet) {
        let level = graph.level(id);
        let query = self.store.vector(id);
        let distance = |other: u32| self.metric.distance(query, self.store.vector(other));

        let (ep, top) = graph.entry().snapshot();
        if ep == id {
            return;
        }

        // Phase 1: greedy descent from the top layer down to the node's level + 1
        let mut current = (distance(ep), ep);
        if level < top {
            current = greedy_descent(graph, &distance, current, top, level, None);
        }

        // Phase 2: beam search each layer and wire the selected neighbors both ways
        let mut layer_eps = vec![current];
        for layer in (0..=level.min(top)).rev() {
            let candidates = search_layer(
                graph,
                &distance,
                &layer_eps,
                self.config.ef_construction,
                layer,
                visited,
            );

            let selected = select_neighbors(
                self.config.neighbor_policy,
                candidates.iter().copied().filter(|&(_, c)| c != id).collect(),
                graph.cap(layer),
                |a, b| self.node_distance(a, b),
            );
            for &(_, neighbor) in &selected {
                self.link(graph, neighbor, id, layer, LinkMode::Prune);
                self.link(graph, id, neighbor, layer, LinkMode::Prune);
            }

            // Update entry points for next (lower) layer
            if !candidates.is_empty() {
                layer_eps = candidates;
            }
        }

        // Phase 3: publish as entry point if this node reaches a new top layer
        if level > top && graph.entry().try_raise(id, level) {
            debug!(id, level, "entry point raised");
        }
    }

    /// Add `target` to the neighbor list of `source` at `layer`.
    ///
    /// Self links and duplicates are ignored. When the list outgrows its cap it
    /// is re-selected with the build policy over the old neighbors plus `target`.
    /// With [`LinkMode::KeepTarget`] the target replaces the farthest survivor
    /// if the policy dropped it.
    pub(crate) fn link(&self, graph: &BuildGraph, source: u32, target: u32, layer: usize, mode: LinkMode) {
        if source == target {
            return;
        }
        let Some(list) = graph.layer(source, layer) else {
            return;
        };
        let cap = graph.cap(layer);
        let mut neighbors = list.lock();
        if neighbors.contains(&target) {
            return;
        }
        neighbors.push(target);
        if neighbors.len() <= cap {
            return;
        }

        match self.config.neighbor_policy {
            NeighborPolicy::Naive => {
                // Drop the single farthest neighbor.
                let farthest = neighbors
                    .iter()
                    .enumerate()
                    .filter(|&(_, &nb)| mode == LinkMode::Prune || nb != target)
                    .map(|(i, &nb)| (self.node_distance(source, nb), nb, i))
                    .max_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)))
                    .map(|(_, _, i)| i);
                if let Some(i) = farthest {
                    neighbors.remove(i);
                }
            }
            policy => {
                let scored: Vec<(f32, u32)> = neighbors
                    .iter()
                    .map(|&nb| (self.node_distance(source, nb), nb))
                    .collect();
                let target_dist = scored.last().map_or(0.0, |s| s.0);
                let mut kept = select_neighbors(policy, scored, cap, |a, b| self.node_distance(a, b));
                if mode == LinkMode::KeepTarget && !kept.iter().any(|&(_, nb)| nb == target) {
                    if kept.len() >= cap {
                        kept.pop();
                    }
                    kept.push((target_dist, target));
                }
                neighbors.clear();
                neighbors.extend(kept.into_iter().map(|(_, nb)| nb));
            }
        }
    }

    /// Union the layer-0 neighbors of `primary` and `secondary` per node and
    /// re-select each merged set down to `max_m0` with the save-remains heuristic.
    /// The result replaces the layer-0 lists of `primary`.
    fn merge_level0(&self, primary: &BuildGraph, secondary: &BuildGraph) {
        let n = self.store.len() as u32;
        let cap = primary.cap(0);
        let merge_one = |id: u32| {
            let mut merged = primary.neighbors(id, 0);
            for nb in secondary.neighbors(id, 0) {
                if !merged.contains(&nb) {
                    merged.push(nb);
                }
            }
            let scored = merged
                .into_iter()
                .map(|nb| (self.node_distance(id, nb), nb))
                .collect();
            let kept = select_neighbors(
                NeighborPolicy::HeuristicSaveRemains,
                scored,
                cap,
                |a, b| self.node_distance(a, b),
            );
            if let Some(list) = primary.layer(id, 0) {
                *list.lock() = kept.into_iter().map(|(_, nb)| nb).collect();
            }
        };
        match &self.pool {
            None => (0..n).for_each(merge_one),
            Some(pool) => pool.install(|| {
                (0..n)
                    .into_par_iter()
                    .with_min_len(config::BUILD_CHUNK_SIZE)
                    .for_each(merge_one)
            }),
        }
        debug!(nodes = n, "merged layer-0 edges of forward and reverse graphs");
    }

    /// Run `f` on the build pool when there is one, inline otherwise.
    pub(crate) fn install<R: Send>(&self, f: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(f),
            None => f(),
        }
    }

    pub(crate) fn is_parallel(&self) -> bool {
        self.pool.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hnsw::graph::NeighborSource;

    fn grid_store(side: usize) -> VectorStore {
        let mut store = VectorStore::new(2);
        for x in 0..side {
            for y in 0..side {
                store.append(&[x as f32, y as f32]).unwrap();
            }
        }
        store
    }

    fn never() -> AtomicBool {
        AtomicBool::new(false)
    }

    #[test]
    fn test_draw_levels_is_seeded_and_geometric() {
        let a = draw_levels(10_000, 1.0 / 12f64.ln(), 17);
        let b = draw_levels(10_000, 1.0 / 12f64.ln(), 17);
        assert_eq!(a, b);
        let zeros = a.iter().filter(|&&l| l == 0).count();
        // P(level 0) = 1 - 1/12
        assert!(zeros > 8_800 && zeros < 9_500, "level-0 count {zeros}");
        assert!(a.iter().all(|&l| l <= config::HNSW_MAX_LEVEL));
    }

    #[test]
    fn test_build_respects_caps_and_has_no_self_loops() {
        let store = grid_store(12);
        let cfg = BuildConfig {
            m: 4,
            ef_construction: 32,
            ..BuildConfig::default()
        };
        let builder = GraphBuilder::new(&store, DistanceMetric::L2, &cfg).unwrap();
        let graph = builder.build(&never()).unwrap();
        for id in 0..store.len() as u32 {
            for layer in 0..=graph.level(id) {
                let nbs = graph.neighbors(id, layer);
                assert!(nbs.len() <= graph.cap(layer), "node {id} layer {layer} over cap");
                assert!(!nbs.contains(&id), "self loop on {id}");
                let mut dedup = nbs.clone();
                dedup.sort_unstable();
                dedup.dedup();
                assert_eq!(dedup.len(), nbs.len(), "duplicate neighbors on {id}");
                for &nb in &nbs {
                    assert!(graph.level(nb) >= layer, "edge to {nb} above its level");
                }
            }
        }
        let (ep, top) = graph.entry().snapshot();
        assert_eq!(top, (0..store.len() as u32).map(|id| graph.level(id)).max().unwrap());
        assert_eq!(graph.level(ep), top);
    }

    #[test]
    fn test_every_node_reachable_on_layer0() {
        let store = grid_store(10);
        let builder = GraphBuilder::new(&store, DistanceMetric::L2, &BuildConfig::default()).unwrap();
        let graph = builder.build(&never()).unwrap();
        let mut seen = vec![false; store.len()];
        let mut stack = vec![0u32];
        seen[0] = true;
        while let Some(id) = stack.pop() {
            graph.for_each_neighbor(id, 0, |nb| {
                if !seen[nb as usize] {
                    seen[nb as usize] = true;
                    stack.push(nb);
                }
            });
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_cancelled_build() {
        let store = grid_store(4);
        let builder = GraphBuilder::new(&store, DistanceMetric::L2, &BuildConfig::default()).unwrap();
        let cancel = AtomicBool::new(true);
        assert!(matches!(builder.build(&cancel), Err(IndexError::Cancelled)));
    }

    #[test]
    fn test_link_keeps_protected_target() {
        let store = VectorStore::from_flat(1, vec![0.0, 1.0, 2.0, 50.0]).unwrap();
        let cfg = BuildConfig {
            m: 1,
            max_m0: 2,
            neighbor_policy: NeighborPolicy::Naive,
            ..BuildConfig::default()
        };
        let builder = GraphBuilder::new(&store, DistanceMetric::L2, &cfg).unwrap();
        let graph = BuildGraph::new(&[0, 0, 0, 0], 0, 1, 2);
        builder.link(&graph, 0, 1, 0, LinkMode::Prune);
        builder.link(&graph, 0, 2, 0, LinkMode::Prune);
        builder.link(&graph, 0, 3, 0, LinkMode::Prune);
        assert_eq!(graph.neighbors(0, 0), vec![1, 2]);
        builder.link(&graph, 0, 3, 0, LinkMode::KeepTarget);
        assert!(graph.neighbors(0, 0).contains(&3));
        assert_eq!(graph.neighbors(0, 0).len(), 2);
        builder.link(&graph, 0, 0, 0, LinkMode::Prune);
        assert!(!graph.neighbors(0, 0).contains(&0));
    }

    #[test]
    fn test_heuristic_prune_reselects_existing_plus_new() {
        // source 0 at the origin; 1 and 2 clustered on the right, 3 alone on the left
        let store = VectorStore::from_flat(1, vec![0.0, 1.0, 1.1, -2.0]).unwrap();
        let cfg = BuildConfig {
            m: 1,
            max_m0: 2,
            ..BuildConfig::default()
        };
        let builder = GraphBuilder::new(&store, DistanceMetric::L2, &cfg).unwrap();
        let graph = BuildGraph::new(&[0, 0, 0, 0], 0, 1, 2);
        builder.link(&graph, 0, 1, 0, LinkMode::Prune);
        builder.link(&graph, 0, 2, 0, LinkMode::Prune);
        assert_eq!(graph.neighbors(0, 0), vec![1, 2]);
        builder.link(&graph, 0, 3, 0, LinkMode::Prune);
        assert_eq!(graph.neighbors(0, 0), vec![1, 3]);
    }

    #[test]
    fn test_merge_level0_build() {
        let store = grid_store(8);
        let cfg = BuildConfig {
            m: 4,
            graph_merging: GraphMerging::MergeLevel0,
            ..BuildConfig::default()
        };
        let builder = GraphBuilder::new(&store, DistanceMetric::L2, &cfg).unwrap();
        let graph = builder.build(&never()).unwrap();
        for id in 0..store.len() as u32 {
            let nbs = graph.neighbors(id, 0);
            assert!(!nbs.is_empty());
            assert!(nbs.len() <= 8);
        }
    }
}
