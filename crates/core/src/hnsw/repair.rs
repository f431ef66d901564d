//! Post-build ensure-k pass.
//!
//! A node whose layer-0 beam cannot reach `ef_ensure` other nodes sits in an
//! under-connected pocket of the graph. Such nodes are re-searched from the
//! entry point and linked to what that search finds, through the same locked
//! `link` used by insertion.

use crate::hnsw::graph::BuildGraph;
use crate::hnsw::insert::{GraphBuilder, LinkMode};
use crate::hnsw::search::{greedy_descent, search_layer};
use crate::hnsw::select::select_neighbors;
use crate::hnsw::visited::VisitedSet;
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{info, warn};

/// Run the repair pass over every node. Returns the number of repaired nodes.
pub(crate) fn ensure_k(builder: &GraphBuilder<'_>, graph: &BuildGraph) -> usize {
    let n = builder.store().len();
    let ef_ensure = builder.config().ef_ensure;
    let target = ef_ensure.min(n);
    let repaired = AtomicUsize::new(0);

    let check_one = |visited: &mut VisitedSet, id: u32| {
        let query = builder.store().vector(id);
        let distance = |other: u32| builder.metric().distance(query, builder.store().vector(other));
        let reach = search_layer(graph, &distance, &[(0.0, id)], ef_ensure, 0, visited);
        if reach.len() >= target {
            return;
        }
        repair_node(builder, graph, id, visited);
        repaired.fetch_add(1, Ordering::Relaxed);
    };

    if builder.is_parallel() {
        builder.install(|| {
            (0..n as u32)
                .into_par_iter()
                .for_each_init(|| VisitedSet::new(n), |visited, id| check_one(visited, id))
        });
    } else {
        let mut visited = VisitedSet::new(n);
        for id in 0..n as u32 {
            check_one(&mut visited, id);
        }
    }

    let repaired = repaired.into_inner();
    if repaired > 0 {
        warn!(repaired, ef_ensure, "ensure-k relinked under-connected nodes");
    } else {
        info!(ef_ensure, "ensure-k found no under-connected nodes");
    }
    repaired
}

/// Search for `id` from the entry point and link it to the layer-0 neighbors found.
fn repair_node(builder: &GraphBuilder<'_>, graph: &BuildGraph, id: u32, visited: &mut VisitedSet) {
    let query = builder.store().vector(id);
    let distance = |other: u32| builder.metric().distance(query, builder.store().vector(other));

    let (ep, top) = graph.entry().snapshot();
    let start = greedy_descent(graph, &distance, (distance(ep), ep), top, 0, None);
    let candidates = search_layer(
        graph,
        &distance,
        &[start],
        builder.config().ef_construction,
        0,
        visited,
    );
    let selected = select_neighbors(
        builder.config().neighbor_policy,
        candidates.into_iter().filter(|&(_, c)| c != id).collect(),
        graph.cap(0),
        |a, b| builder.node_distance(a, b),
    );
    for &(_, neighbor) in &selected {
        builder.link(graph, id, neighbor, 0, LinkMode::Prune);
        builder.link(graph, neighbor, id, 0, LinkMode::KeepTarget);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hnsw::distance::DistanceMetric;
    use crate::hnsw::graph::{BuildConfig, EnsureKPolicy};
    use crate::hnsw::store::VectorStore;

    #[test]
    fn test_repair_reconnects_isolated_node() {
        let mut store = VectorStore::new(1);
        for x in [0.0, 1.0, 2.0, 3.0, 4.0] {
            store.append(&[x]).unwrap();
        }
        let cfg = BuildConfig {
            m: 2,
            max_m0: 4,
            ef_ensure: 3,
            ensure_k: EnsureKPolicy::Repair,
            ..BuildConfig::default()
        };
        let builder = GraphBuilder::new(&store, DistanceMetric::L2, &cfg).unwrap();
        // 0-1-2-3 chained, 4 linked to nothing
        let graph = BuildGraph::new(&[0, 0, 0, 0, 0], 0, 2, 4);
        for (a, b) in [(0u32, 1u32), (1, 2), (2, 3)] {
            builder.link(&graph, a, b, 0, LinkMode::Prune);
            builder.link(&graph, b, a, 0, LinkMode::Prune);
        }

        let repaired = ensure_k(&builder, &graph);
        assert_eq!(repaired, 1);
        assert!(!graph.neighbors(4, 0).is_empty());
        assert!(graph.neighbors(3, 0).contains(&4));

        // a second pass has nothing left to do
        assert_eq!(ensure_k(&builder, &graph), 0);
    }
}
