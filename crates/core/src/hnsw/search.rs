//! Graph search algorithms: single-layer beam search, greedy descent and
//! multi-layer KNN over the frozen graph.
//!
//! The traversal routines are generic over [`NeighborSource`] so insertion
//! (against the locked build arena) and queries (against the frozen graph) run
//! the exact same code.

use crate::config;
use crate::error::{IndexError, Result};
use crate::hnsw::distance::DistanceMetric;
use crate::hnsw::graph::{NeighborSource, ProximityGraph};
use crate::hnsw::store::VectorStore;
use crate::hnsw::visited::VisitedSet;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

thread_local! {
    /// Thread-local VisitedSet pool for search operations.
    /// Reused across searches on the same thread so queries never allocate one.
    static SEARCH_VISITED: RefCell<VisitedSet> = RefCell::new(VisitedSet::default());
}

/// One search hit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub id: u32,
    pub distance: f32,
}

/// Per-query knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchParams {
    /// Number of results wanted.
    pub k: usize,
    /// Layer-0 beam width. `0` means `50 * k`; widths below `k` are raised to `k`.
    pub ef: usize,
    /// Drop the query node itself from `search_by_id` results.
    pub exclude_self: bool,
    /// Backtrack along the descent path when the beam finds fewer than `k` nodes.
    pub ensure_k: bool,
}

impl SearchParams {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            ef: 0,
            exclude_self: false,
            ensure_k: false,
        }
    }

    pub fn with_ef(mut self, ef: usize) -> Self {
        self.ef = ef;
        self
    }

    pub fn exclude_self(mut self, exclude: bool) -> Self {
        self.exclude_self = exclude;
        self
    }

    pub fn ensure_k(mut self, ensure: bool) -> Self {
        self.ensure_k = ensure;
        self
    }

    /// Effective layer-0 beam width.
    pub fn beam_width(&self) -> usize {
        let ef = if self.ef == 0 {
            self.k.saturating_mul(config::HNSW_DEFAULT_EF_SEARCH_PER_K)
        } else {
            self.ef
        };
        ef.max(self.k)
    }
}

type Scored = (OrderedFloat<f32>, u32);

#[inline]
fn scored(dist: f32, id: u32) -> Scored {
    (OrderedFloat(dist), id)
}

/// Search a single layer of the graph.
///
/// Starts from `entry_points` (pre-scored `(distance, id)` pairs) and returns up
/// to `ef` closest nodes sorted by `(distance, id)`. `visited` is reset at the
/// start of each call.
pub fn search_layer<G, D>(
    graph: &G,
    distance: D,
    entry_points: &[(f32, u32)],
    ef: usize,
    layer: usize,
    visited: &mut VisitedSet,
) -> Vec<(f32, u32)>
where
    G: NeighborSource,
    D: Fn(u32) -> f32,
{
    visited.ensure_capacity(graph.node_count());
    visited.reset();
    let ef = ef.max(1);
    // min-heap of nodes still to expand, max-heap of the best `ef` found
    let reserve = ef.min(graph.node_count());
    let mut candidates: BinaryHeap<Reverse<Scored>> = BinaryHeap::with_capacity(reserve * 2);
    let mut results: BinaryHeap<Scored> = BinaryHeap::with_capacity(reserve + 1);
    // Cached worst `(distance, id)`, avoids repeated heap peeks in the hot loop.
    // Whole tuples are compared so equal distances resolve by ascending id.
    let mut worst = scored(f32::MAX, u32::MAX);

    for &(dist, ep) in entry_points {
        if visited.mark(ep) {
            candidates.push(Reverse(scored(dist, ep)));
            results.push(scored(dist, ep));
            if results.len() > ef {
                results.pop();
            }
            if results.len() >= ef {
                worst = results.peek().copied().unwrap_or(worst);
            }
        }
    }

    while let Some(Reverse(candidate)) = candidates.pop() {
        // If the closest candidate ranks behind the worst result, stop
        if results.len() >= ef && candidate > worst {
            break;
        }

        graph.for_each_neighbor(candidate.1, layer, |neighbor_id| {
            if !visited.mark(neighbor_id) {
                return;
            }
            let entry = scored(distance(neighbor_id), neighbor_id);
            if results.len() < ef || entry < worst {
                candidates.push(Reverse(entry));
                results.push(entry);
                if results.len() > ef {
                    results.pop(); // remove worst
                }
                if results.len() >= ef {
                    worst = results.peek().copied().unwrap_or(worst);
                }
            }
        });
    }

    results
        .into_sorted_vec()
        .into_iter()
        .map(|(d, id)| (d.0, id))
        .collect()
}

/// Greedy single-path descent through layers `from_layer` down to `to_layer + 1`.
///
/// At each layer, moves to the closest neighbor while it is strictly closer.
/// When `path` is given, every node the walk leaves behind is appended to it,
/// so the tail of `path` holds the nodes closest to the target.
pub fn greedy_descent<G, D>(
    graph: &G,
    distance: D,
    start: (f32, u32),
    from_layer: usize,
    to_layer: usize,
    mut path: Option<&mut Vec<(f32, u32)>>,
) -> (f32, u32)
where
    G: NeighborSource,
    D: Fn(u32) -> f32,
{
    let (mut cur_dist, mut cur) = start;
    let mut layer = from_layer;
    while layer > to_layer {
        let mut changed = true;
        while changed {
            changed = false;
            let mut best = (cur_dist, cur);
            graph.for_each_neighbor(cur, layer, |neighbor_id| {
                let d = distance(neighbor_id);
                if d < best.0 {
                    best = (d, neighbor_id);
                }
            });
            if best.1 != cur {
                if let Some(path) = path.as_deref_mut() {
                    path.push((cur_dist, cur));
                }
                (cur_dist, cur) = best;
                changed = true;
            }
        }
        layer -= 1;
    }
    (cur_dist, cur)
}

/// Merge two sorted result lists, dropping duplicate ids, keeping at most `limit`.
fn merge_results(into: &mut Vec<(f32, u32)>, more: Vec<(f32, u32)>, limit: usize) {
    into.extend(more);
    into.sort_unstable_by(|a, b| a.1.cmp(&b.1).then(a.0.total_cmp(&b.0)));
    into.dedup_by_key(|r| r.1);
    into.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    into.truncate(limit);
}

/// Read-only KNN queries over a built graph. Cheap to construct; borrows the index.
pub struct SearchEngine<'a> {
    store: &'a VectorStore,
    graph: &'a ProximityGraph,
    metric: DistanceMetric,
}

impl<'a> SearchEngine<'a> {
    pub fn new(store: &'a VectorStore, graph: &'a ProximityGraph, metric: DistanceMetric) -> Self {
        Self {
            store,
            graph,
            metric,
        }
    }

    /// K nearest stored vectors to `query`, closest first, ties by ascending id.
    pub fn search_by_vector(&self, query: &[f32], params: &SearchParams) -> Result<Vec<Neighbor>> {
        if query.len() != self.store.dimension() {
            return Err(IndexError::DimensionMismatch {
                expected: self.store.dimension(),
                actual: query.len(),
            });
        }
        let query = self.metric.prepare(query)?;
        if params.k == 0 {
            return Ok(Vec::new());
        }
        let distance = |id: u32| self.metric.distance(&query, self.store.vector(id));

        let ep = self.graph.entry_point();
        let start = (distance(ep), ep);
        Ok(self.knn(&distance, start, params, None))
    }

    /// K nearest neighbors of the stored node `id`.
    ///
    /// The node itself is reported first at distance 0 unless
    /// `params.exclude_self` is set; the remaining slots hold the closest other
    /// nodes ranked by their true distance. Under [`DistanceMetric::Dot`] those
    /// distances can be negative, and `id` still comes first.
    pub fn search_by_id(&self, id: u32, params: &SearchParams) -> Result<Vec<Neighbor>> {
        let node_vector = self.store.get(id)?;
        if params.k == 0 {
            return Ok(Vec::new());
        }
        let distance = |other: u32| self.metric.distance(node_vector, self.store.vector(other));

        // the node occupies one beam slot that is filtered out below
        let others = if params.exclude_self {
            params.k
        } else {
            params.k - 1
        };
        let mut inner = *params;
        inner.k = others.saturating_add(1);
        if inner.ef != 0 {
            inner.ef = inner.ef.saturating_add(1);
        }

        let mut hits = self.knn(&distance, (distance(id), id), &inner, Some(id));
        hits.retain(|h| h.id != id);
        hits.truncate(others);
        if !params.exclude_self {
            hits.insert(0, Neighbor { id, distance: 0.0 });
        }
        Ok(hits)
    }

    /// Shared tail of both query kinds: descend, beam layer 0, optionally
    /// backtrack, then rank.
    ///
    /// `from_node` is the query node of `search_by_id`, which starts the beam
    /// at itself instead of descending from the entry point.
    fn knn<D>(
        &self,
        distance: &D,
        start: (f32, u32),
        params: &SearchParams,
        from_node: Option<u32>,
    ) -> Vec<Neighbor>
    where
        D: Fn(u32) -> f32,
    {
        let width = params.beam_width();
        SEARCH_VISITED.with(|cell| {
            let mut visited = cell.borrow_mut();
            let mut path = Vec::new();

            let layer0_start = if from_node.is_some() {
                // The query node is its own nearest neighbor; skip the descent.
                start
            } else {
                let record = params.ensure_k.then_some(&mut path);
                greedy_descent(
                    self.graph,
                    distance,
                    start,
                    self.graph.max_level(),
                    0,
                    record,
                )
            };

            let mut results = search_layer(
                self.graph,
                distance,
                &[layer0_start],
                width,
                0,
                &mut visited,
            );

            if params.ensure_k {
                // a by-id search has no descent path; fall back to the entry point
                if let Some(id) = from_node {
                    let ep = self.graph.entry_point();
                    if ep != id {
                        path.push((distance(ep), ep));
                    }
                }
                while results.len() < params.k {
                    let Some(from) = path.pop() else { break };
                    let more = search_layer(self.graph, distance, &[from], width, 0, &mut visited);
                    merge_results(&mut results, more, width);
                }
            }

            results.truncate(params.k);
            results
                .into_iter()
                .map(|(distance, id)| Neighbor { id, distance })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Five points on a line, chained 0-1-2-3-4 on layer 0 plus a shortcut 0-4 on layer 1.
    fn chain() -> (VectorStore, ProximityGraph) {
        let store =
            VectorStore::from_flat(1, vec![0.0, 1.0, 2.0, 3.0, 4.0]).expect("valid table");
        let graph = ProximityGraph::from_parts(
            vec![
                vec![vec![1], vec![4]],
                vec![vec![0, 2]],
                vec![vec![1, 3]],
                vec![vec![2, 4]],
                vec![vec![3], vec![0]],
            ],
            0,
            2,
            4,
        )
        .expect("valid graph");
        (store, graph)
    }

    #[test]
    fn test_search_layer_returns_sorted_beam() {
        let (store, graph) = chain();
        let q = 2.2f32;
        let dist = |id: u32| (store.vector(id)[0] - q).powi(2);
        let mut visited = VisitedSet::new(5);
        let out = search_layer(&graph, dist, &[(dist(0), 0)], 3, 0, &mut visited);
        let ids: Vec<u32> = out.iter().map(|r| r.1).collect();
        assert_eq!(ids, vec![2, 3, 1]);
        assert!(out.windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[test]
    fn test_greedy_descent_records_path() {
        let (store, graph) = chain();
        let q = 3.9f32;
        let dist = |id: u32| (store.vector(id)[0] - q).powi(2);
        let mut path = Vec::new();
        let (_, best) = greedy_descent(&graph, dist, (dist(0), 0), 1, 0, Some(&mut path));
        assert_eq!(best, 4);
        assert_eq!(path.iter().map(|p| p.1).collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_engine_search_by_vector_and_id() {
        let (store, graph) = chain();
        let engine = SearchEngine::new(&store, &graph, DistanceMetric::L2);

        let hits = engine
            .search_by_vector(&[1.1], &SearchParams::new(2).with_ef(10))
            .unwrap();
        assert_eq!(hits.iter().map(|h| h.id).collect::<Vec<_>>(), vec![1, 2]);

        let hits = engine.search_by_id(3, &SearchParams::new(3)).unwrap();
        assert_eq!(hits[0], Neighbor { id: 3, distance: 0.0 });
        assert_eq!(hits.len(), 3);

        let hits = engine
            .search_by_id(3, &SearchParams::new(2).exclude_self(true))
            .unwrap();
        assert_eq!(hits.iter().map(|h| h.id).collect::<Vec<_>>(), vec![2, 4]);
    }

    #[test]
    fn test_engine_errors_and_empty_k() {
        let (store, graph) = chain();
        let engine = SearchEngine::new(&store, &graph, DistanceMetric::L2);
        assert!(matches!(
            engine.search_by_vector(&[1.0, 2.0], &SearchParams::new(1)),
            Err(IndexError::DimensionMismatch { expected: 1, actual: 2 })
        ));
        assert!(matches!(
            engine.search_by_id(9, &SearchParams::new(1)),
            Err(IndexError::UnknownId { id: 9, .. })
        ));
        assert!(engine
            .search_by_vector(&[0.0], &SearchParams::new(0))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_ensure_k_backtracks_into_other_component() {
        // Two disconnected layer-0 islands {0,1} and {2,3}; layer 1 links 0 and 2.
        let store = VectorStore::from_flat(1, vec![0.0, 1.0, 10.0, 11.0]).unwrap();
        let graph = ProximityGraph::from_parts(
            vec![
                vec![vec![1], vec![2]],
                vec![vec![0]],
                vec![vec![3], vec![0]],
                vec![vec![2]],
            ],
            0,
            2,
            4,
        )
        .unwrap();
        let engine = SearchEngine::new(&store, &graph, DistanceMetric::L2);

        let plain = engine
            .search_by_vector(&[10.5], &SearchParams::new(3).with_ef(3))
            .unwrap();
        assert_eq!(plain.len(), 2);

        let ensured = engine
            .search_by_vector(&[10.5], &SearchParams::new(3).with_ef(3).ensure_k(true))
            .unwrap();
        assert_eq!(ensured.iter().map(|h| h.id).collect::<Vec<_>>(), vec![2, 3, 1]);
    }

    #[test]
    fn test_equal_distances_rank_by_id_at_any_beam_width() {
        // id 0 at -1, id 1 at +1, entry point 1; both are 1.0 from the query
        let store = VectorStore::from_flat(1, vec![-1.0, 1.0]).unwrap();
        let graph =
            ProximityGraph::from_parts(vec![vec![vec![1]], vec![vec![0]]], 1, 2, 4).unwrap();
        let engine = SearchEngine::new(&store, &graph, DistanceMetric::L2);
        for ef in [1, 2, 10] {
            let hits = engine
                .search_by_vector(&[0.0], &SearchParams::new(1).with_ef(ef))
                .unwrap();
            assert_eq!(hits, vec![Neighbor { id: 0, distance: 1.0 }], "ef = {ef}");
        }
        let both = engine
            .search_by_vector(&[0.0], &SearchParams::new(2).with_ef(2))
            .unwrap();
        assert_eq!(both.iter().map(|h| h.id).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_duplicate_vectors_keep_lowest_ids() {
        // five copies of the same point, chained from the last id
        let store = VectorStore::from_flat(1, vec![3.0; 5]).unwrap();
        let graph = ProximityGraph::from_parts(
            vec![
                vec![vec![1]],
                vec![vec![0, 2]],
                vec![vec![1, 3]],
                vec![vec![2, 4]],
                vec![vec![3]],
            ],
            4,
            2,
            4,
        )
        .unwrap();
        let engine = SearchEngine::new(&store, &graph, DistanceMetric::L2);
        let hits = engine
            .search_by_vector(&[3.0], &SearchParams::new(2).with_ef(2))
            .unwrap();
        assert_eq!(hits.iter().map(|h| h.id).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_search_by_id_puts_self_first_under_dot() {
        let store = VectorStore::from_flat(1, vec![1.0, 5.0, 2.0]).unwrap();
        let graph = ProximityGraph::from_parts(
            vec![vec![vec![1, 2]], vec![vec![0, 2]], vec![vec![0, 1]]],
            0,
            2,
            4,
        )
        .unwrap();
        let engine = SearchEngine::new(&store, &graph, DistanceMetric::Dot);

        let hits = engine.search_by_id(0, &SearchParams::new(2)).unwrap();
        assert_eq!(
            hits,
            vec![
                Neighbor { id: 0, distance: 0.0 },
                Neighbor { id: 1, distance: -5.0 },
            ]
        );

        let all = engine.search_by_id(0, &SearchParams::new(5)).unwrap();
        assert_eq!(all.iter().map(|h| h.id).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(all[2].distance, -2.0);

        let others = engine
            .search_by_id(0, &SearchParams::new(1).exclude_self(true))
            .unwrap();
        assert_eq!(others, vec![Neighbor { id: 1, distance: -5.0 }]);

        let only_self = engine.search_by_id(1, &SearchParams::new(1)).unwrap();
        assert_eq!(only_self, vec![Neighbor { id: 1, distance: 0.0 }]);
    }

    #[test]
    fn test_exclude_self_with_unbounded_k() {
        let (store, graph) = chain();
        let engine = SearchEngine::new(&store, &graph, DistanceMetric::L2);
        let hits = engine
            .search_by_id(
                2,
                &SearchParams::new(usize::MAX).with_ef(usize::MAX).exclude_self(true),
            )
            .unwrap();
        assert_eq!(hits.iter().map(|h| h.id).collect::<Vec<_>>(), vec![1, 3, 0, 4]);
    }

    #[test]
    fn test_beam_width() {
        assert_eq!(SearchParams::new(10).beam_width(), 500);
        assert_eq!(SearchParams::new(10).with_ef(4).beam_width(), 10);
        assert_eq!(SearchParams::new(1).with_ef(64).beam_width(), 64);
    }
}
