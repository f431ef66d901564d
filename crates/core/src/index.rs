//! The [`HnswIndex`] facade: create, add, build, search, save, load.
//!
//! An index starts out *building*: vectors can be appended but not searched.
//! [`HnswIndex::build`] constructs the graph and makes the index *built*, after
//! which it is read-only and safe to query from many threads at once (`&self`).
//! A loaded index is always built.

use crate::config;
use crate::error::{IndexError, Result};
use crate::hnsw::graph::{BuildConfig, EnsureKPolicy, ProximityGraph};
use crate::hnsw::insert::GraphBuilder;
use crate::hnsw::repair;
use crate::hnsw::search::{Neighbor, SearchEngine, SearchParams};
use crate::hnsw::{DistanceMetric, VectorStore};
use crate::storage::persistence::{self, LoadStrategy};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::time::Instant;
use tracing::{debug, info};

/// Approximate nearest neighbor index over fixed-dimension `f32` vectors.
#[derive(Debug)]
pub struct HnswIndex {
    metric: DistanceMetric,
    store: VectorStore,
    graph: Option<ProximityGraph>,
}

impl HnswIndex {
    /// Creates an empty index. Fails with [`IndexError::InvalidConfig`] for a
    /// dimension of zero or above [`config::MAX_DIMENSION`].
    pub fn new(dimension: usize, metric: DistanceMetric) -> Result<Self> {
        if dimension == 0 || dimension > config::MAX_DIMENSION {
            return Err(IndexError::InvalidConfig(format!(
                "dimension must be in 1..={}, got {dimension}",
                config::MAX_DIMENSION
            )));
        }
        Ok(Self {
            metric,
            store: VectorStore::new(dimension),
            graph: None,
        })
    }

    /// Append a vector and return its id (ids are dense, starting at 0).
    ///
    /// Angular indexes store the normalized vector; a zero vector is rejected.
    pub fn add_vector(&mut self, vector: &[f32]) -> Result<u32> {
        if self.graph.is_some() {
            return Err(IndexError::AlreadyBuilt);
        }
        if vector.len() != self.store.dimension() {
            return Err(IndexError::DimensionMismatch {
                expected: self.store.dimension(),
                actual: vector.len(),
            });
        }
        let prepared = self.metric.prepare(vector)?;
        self.store.append(&prepared)
    }

    /// Build the graph over every added vector.
    pub fn build(&mut self, config: &BuildConfig) -> Result<()> {
        self.build_cancellable(config, &AtomicBool::new(false))
    }

    /// Build, stopping with [`IndexError::Cancelled`] once `cancel` is set.
    ///
    /// A cancelled or failed build leaves the index unbuilt with all of its
    /// vectors, so `build` can simply be called again.
    pub fn build_cancellable(&mut self, config: &BuildConfig, cancel: &AtomicBool) -> Result<()> {
        if self.graph.is_some() {
            return Err(IndexError::AlreadyBuilt);
        }
        if self.store.is_empty() {
            return Err(IndexError::EmptyIndex);
        }
        let started = Instant::now();
        let builder = GraphBuilder::new(&self.store, self.metric, config)?;
        let arena = builder.build(cancel)?;
        if builder.config().ensure_k == EnsureKPolicy::Repair {
            repair::ensure_k(&builder, &arena);
        }
        drop(builder);
        let graph = arena.freeze();

        log_degree_distribution(&graph);
        info!(
            nodes = graph.len(),
            max_level = graph.max_level(),
            entry_point = graph.entry_point(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "index built"
        );
        self.graph = Some(graph);
        Ok(())
    }

    fn engine(&self) -> Result<SearchEngine<'_>> {
        let graph = self.graph.as_ref().ok_or(IndexError::IndexNotBuilt)?;
        Ok(SearchEngine::new(&self.store, graph, self.metric))
    }

    /// Up to `k` nearest stored vectors to `query`, closest first, ties by id.
    /// `ef == 0` uses a beam of `50 * k`.
    pub fn search_by_vector(&self, query: &[f32], k: usize, ef: usize) -> Result<Vec<Neighbor>> {
        self.search(query, &SearchParams::new(k).with_ef(ef))
    }

    /// Up to `k` nearest neighbors of stored node `id`; the node itself is
    /// reported first at distance 0.
    pub fn search_by_id(&self, id: u32, k: usize, ef: usize) -> Result<Vec<Neighbor>> {
        self.search_by_id_with(id, &SearchParams::new(k).with_ef(ef))
    }

    /// [`search_by_vector`](Self::search_by_vector) with full [`SearchParams`].
    pub fn search(&self, query: &[f32], params: &SearchParams) -> Result<Vec<Neighbor>> {
        self.engine()?.search_by_vector(query, params)
    }

    /// [`search_by_id`](Self::search_by_id) with full [`SearchParams`].
    pub fn search_by_id_with(&self, id: u32, params: &SearchParams) -> Result<Vec<Neighbor>> {
        self.engine()?.search_by_id(id, params)
    }

    /// Persist the built index to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let graph = self.graph.as_ref().ok_or(IndexError::IndexNotBuilt)?;
        persistence::save_model(path.as_ref(), &self.store, graph, self.metric)
    }

    /// Load a built index from `path`.
    pub fn load(path: impl AsRef<Path>, strategy: LoadStrategy) -> Result<Self> {
        let model = persistence::load_model(path.as_ref(), strategy)?;
        Ok(Self {
            metric: model.metric,
            store: model.store,
            graph: Some(model.graph),
        })
    }

    /// Replace this index's contents with the model at `path`.
    ///
    /// The model must match this index's dimension and metric; on any error the
    /// index is left untouched.
    pub fn load_model(&mut self, path: impl AsRef<Path>, strategy: LoadStrategy) -> Result<()> {
        let model = persistence::load_model(path.as_ref(), strategy)?;
        if model.store.dimension() != self.store.dimension() {
            return Err(IndexError::DimensionMismatch {
                expected: self.store.dimension(),
                actual: model.store.dimension(),
            });
        }
        if model.metric != self.metric {
            return Err(IndexError::InvalidConfig(format!(
                "model metric {} does not match index metric {}",
                model.metric, self.metric
            )));
        }
        if !self.store.is_empty() {
            debug!(
                discarded = self.store.len(),
                "load_model replaces existing vectors"
            );
        }
        self.store = model.store;
        self.graph = Some(model.graph);
        Ok(())
    }

    /// Returns the number of stored vectors.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Returns `true` if the index contains no vectors.
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.store.dimension()
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn is_built(&self) -> bool {
        self.graph.is_some()
    }

    /// Stored (for angular: normalized) vector of `id`.
    pub fn vector(&self, id: u32) -> Result<&[f32]> {
        self.store.get(id)
    }

    /// The frozen graph, once built.
    pub fn graph(&self) -> Option<&ProximityGraph> {
        self.graph.as_ref()
    }

    pub fn entry_point(&self) -> Option<u32> {
        self.graph.as_ref().map(ProximityGraph::entry_point)
    }

    pub fn max_level(&self) -> Option<usize> {
        self.graph.as_ref().map(ProximityGraph::max_level)
    }

    /// Neighbors of `id` at `layer`; empty above the node's level.
    pub fn neighbors(&self, id: u32, layer: usize) -> Result<&[u32]> {
        let graph = self.built_graph_for(id)?;
        Ok(graph.neighbors(id, layer))
    }

    pub fn node_level(&self, id: u32) -> Result<usize> {
        let graph = self.built_graph_for(id)?;
        Ok(graph.level(id))
    }

    /// Layer-0 degree histogram: entry `d` counts nodes with `d` neighbors.
    pub fn degree_distribution(&self) -> Result<Vec<usize>> {
        let graph = self.graph.as_ref().ok_or(IndexError::IndexNotBuilt)?;
        Ok(graph.degree_distribution())
    }

    fn built_graph_for(&self, id: u32) -> Result<&ProximityGraph> {
        let graph = self.graph.as_ref().ok_or(IndexError::IndexNotBuilt)?;
        if id as usize >= graph.len() {
            return Err(IndexError::UnknownId {
                id,
                node_count: graph.len(),
            });
        }
        Ok(graph)
    }
}

fn log_degree_distribution(graph: &ProximityGraph) {
    let hist = graph.degree_distribution();
    let nodes: usize = hist.iter().sum();
    let edges: usize = hist.iter().enumerate().map(|(d, &c)| d * c).sum();
    let min = hist.iter().position(|&c| c > 0).unwrap_or(0);
    let max = hist.iter().rposition(|&c| c > 0).unwrap_or(0);
    info!(
        min_degree = min,
        max_degree = max,
        mean_degree = edges as f64 / nodes.max(1) as f64,
        isolated = hist.first().copied().unwrap_or(0),
        "layer-0 degree distribution"
    );
    debug!(?hist, "layer-0 degree histogram");
}
