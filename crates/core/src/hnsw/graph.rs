//! Graph structure and build configuration.
//!
//! [`BuildConfig`] defines tuning parameters (M, MaxM0, ef_construction, threads, policies).
//! [`BuildGraph`] is the mutable arena used while inserting: every node layer is its
//! own lock so workers only contend when they touch the same node.
//! [`ProximityGraph`] is the frozen Struct-of-Arrays result that search and
//! persistence read without any locking.

use crate::config;
use crate::error::{IndexError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// How a node's neighbor list is chosen from a candidate set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeighborPolicy {
    /// Keep the closest candidates.
    Naive,
    /// Diversity pruning: a candidate is kept only if it is no farther from the
    /// base node than from every neighbor already kept.
    #[default]
    Heuristic,
    /// [`Heuristic`](Self::Heuristic), then refill free slots with the closest
    /// candidates the heuristic skipped.
    HeuristicSaveRemains,
}

/// Post-processing applied to the finished graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphMerging {
    #[default]
    Skip,
    /// Build a second graph in reverse insertion order and merge the layer-0
    /// neighbor sets of both.
    MergeLevel0,
}

/// Post-build connectivity pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsureKPolicy {
    #[default]
    Skip,
    /// Re-link nodes whose layer-0 neighborhood cannot produce `ef_ensure` results.
    Repair,
}

impl NeighborPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            NeighborPolicy::Naive => "naive",
            NeighborPolicy::Heuristic => "heuristic",
            NeighborPolicy::HeuristicSaveRemains => "heuristic_save_remains",
        }
    }
}

impl GraphMerging {
    pub fn as_str(&self) -> &'static str {
        match self {
            GraphMerging::Skip => "skip",
            GraphMerging::MergeLevel0 => "merge_level0",
        }
    }
}

impl EnsureKPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnsureKPolicy::Skip => "skip",
            EnsureKPolicy::Repair => "repair",
        }
    }
}

impl FromStr for NeighborPolicy {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "naive" => Ok(NeighborPolicy::Naive),
            "heuristic" => Ok(NeighborPolicy::Heuristic),
            "heuristic_save_remains" => Ok(NeighborPolicy::HeuristicSaveRemains),
            other => Err(IndexError::InvalidConfig(format!(
                "invalid value for NeighborSelecting: '{other}'"
            ))),
        }
    }
}

impl FromStr for GraphMerging {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "skip" => Ok(GraphMerging::Skip),
            "merge_level0" => Ok(GraphMerging::MergeLevel0),
            other => Err(IndexError::InvalidConfig(format!(
                "invalid value for GraphMerging: '{other}'"
            ))),
        }
    }
}

impl FromStr for EnsureKPolicy {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "skip" | "false" => Ok(EnsureKPolicy::Skip),
            "repair" | "true" => Ok(EnsureKPolicy::Repair),
            other => Err(IndexError::InvalidConfig(format!(
                "invalid value for EnsureK: '{other}'"
            ))),
        }
    }
}

impl fmt::Display for NeighborPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for GraphMerging {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for EnsureKPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration parameters for a graph build.
///
/// Controls the trade-off between build speed, search speed, recall, and memory usage.
/// Numeric fields left at zero (and a missing or non-positive `mult`) fall back to
/// the defaults in [`crate::config`]; see [`resolved`](Self::resolved).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Neighbor cap on layers above 0.
    pub m: usize,
    /// Neighbor cap on layer 0 (defaults to `2 * m`).
    pub max_m0: usize,
    /// Candidate list size during index construction.
    pub ef_construction: usize,
    /// Worker threads inserting in parallel. `1` builds sequentially.
    pub n_threads: usize,
    /// Beam width and target count of the ensure-k repair pass.
    pub ef_ensure: usize,
    /// Level multiplier. `None` means `1 / ln(m)`.
    pub mult: Option<f64>,
    pub neighbor_policy: NeighborPolicy,
    pub graph_merging: GraphMerging,
    pub ensure_k: EnsureKPolicy,
    /// Seed of the level generator.
    pub seed: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            m: config::HNSW_DEFAULT_M,
            max_m0: config::HNSW_DEFAULT_M * 2,
            ef_construction: config::HNSW_DEFAULT_EF_CONSTRUCTION,
            n_threads: config::HNSW_DEFAULT_THREADS,
            ef_ensure: config::HNSW_DEFAULT_EF_ENSURE,
            mult: None,
            neighbor_policy: NeighborPolicy::default(),
            graph_merging: GraphMerging::default(),
            ensure_k: EnsureKPolicy::default(),
            seed: config::HNSW_DEFAULT_SEED,
        }
    }
}

impl BuildConfig {
    /// Parse a configuration from string key/value pairs.
    ///
    /// Recognized keys: `M`, `MaxM0`, `efConstruction`, `NumThread`, `Mult`,
    /// `NeighborSelecting`, `GraphMerging`, `EnsureK`, `efEnsure`, `Seed`.
    /// Non-positive numbers select the default. Unknown keys and unparsable
    /// values fail with [`IndexError::InvalidConfig`].
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut cfg = BuildConfig {
            m: 0,
            max_m0: 0,
            ef_construction: 0,
            n_threads: 0,
            ef_ensure: 0,
            ..BuildConfig::default()
        };
        for (key, value) in pairs {
            let (key, value) = (key.as_ref(), value.as_ref().trim());
            match key {
                "M" => cfg.m = parse_count(key, value)?,
                "MaxM0" => cfg.max_m0 = parse_count(key, value)?,
                "efConstruction" => cfg.ef_construction = parse_count(key, value)?,
                "NumThread" => cfg.n_threads = parse_count(key, value)?,
                "efEnsure" => cfg.ef_ensure = parse_count(key, value)?,
                "Mult" => {
                    let mult: f64 = value.parse().map_err(|_| {
                        IndexError::InvalidConfig(format!("invalid value for Mult: '{value}'"))
                    })?;
                    cfg.mult = (mult > 0.0 && mult.is_finite()).then_some(mult);
                }
                "NeighborSelecting" => cfg.neighbor_policy = value.parse()?,
                "GraphMerging" => cfg.graph_merging = value.parse()?,
                "EnsureK" => cfg.ensure_k = value.parse()?,
                "Seed" => {
                    cfg.seed = value.parse().map_err(|_| {
                        IndexError::InvalidConfig(format!("invalid value for Seed: '{value}'"))
                    })?;
                }
                other => {
                    return Err(IndexError::InvalidConfig(format!(
                        "unknown configuration key '{other}'"
                    )))
                }
            }
        }
        Ok(cfg.resolved())
    }

    /// Replace every unset or non-positive parameter with its default.
    pub fn resolved(&self) -> Self {
        let m = if self.m == 0 {
            config::HNSW_DEFAULT_M
        } else {
            self.m
        };
        let or = |value: usize, default: usize| if value == 0 { default } else { value };
        Self {
            m,
            max_m0: or(self.max_m0, m * 2),
            ef_construction: or(self.ef_construction, config::HNSW_DEFAULT_EF_CONSTRUCTION),
            n_threads: or(self.n_threads, config::HNSW_DEFAULT_THREADS),
            ef_ensure: or(self.ef_ensure, config::HNSW_DEFAULT_EF_ENSURE),
            mult: Some(self.level_mult_for(m)),
            ..self.clone()
        }
    }

    /// Level multiplier in effect for this configuration.
    pub fn level_mult(&self) -> f64 {
        let m = if self.m == 0 {
            config::HNSW_DEFAULT_M
        } else {
            self.m
        };
        self.level_mult_for(m)
    }

    fn level_mult_for(&self, m: usize) -> f64 {
        match self.mult {
            Some(mult) if mult > 0.0 && mult.is_finite() => mult,
            // ln(1) = 0, so a single-neighbor graph uses the M=2 multiplier
            _ => 1.0 / (m.max(2) as f64).ln(),
        }
    }
}

fn parse_count(key: &str, value: &str) -> Result<usize> {
    let n: i64 = value
        .parse()
        .map_err(|_| IndexError::InvalidConfig(format!("invalid value for {key}: '{value}'")))?;
    Ok(usize::try_from(n).unwrap_or(0))
}

/// Read access to per-layer adjacency, shared by the build arena and the
/// frozen graph so one traversal routine serves both.
pub trait NeighborSource {
    /// Number of node slots.
    fn node_count(&self) -> usize;

    /// Call `f` with every neighbor of `id` at `layer`. A layer above the
    /// node's level has no neighbors.
    fn for_each_neighbor<F: FnMut(u32)>(&self, id: u32, layer: usize, f: F);
}

/// Entry point packed as `(level << 32) | id` so readers always see a
/// consistent pair.
#[derive(Debug)]
pub(crate) struct EntryPoint(AtomicU64);

impl EntryPoint {
    fn new(id: u32, level: usize) -> Self {
        Self(AtomicU64::new(Self::pack(id, level)))
    }

    #[inline]
    fn pack(id: u32, level: usize) -> u64 {
        ((level as u64) << 32) | id as u64
    }

    /// Current `(id, level)`.
    #[inline]
    pub(crate) fn snapshot(&self) -> (u32, usize) {
        let packed = self.0.load(Ordering::Acquire);
        (packed as u32, (packed >> 32) as usize)
    }

    /// Install `id` if `level` is strictly above the published maximum.
    /// Returns whether `id` became the entry point.
    pub(crate) fn try_raise(&self, id: u32, level: usize) -> bool {
        let desired = Self::pack(id, level);
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if (current >> 32) as usize >= level {
                return false;
            }
            match self
                .0
                .compare_exchange_weak(current, desired, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

struct BuildNode {
    level: usize,
    layers: Box<[Mutex<Vec<u32>>]>,
}

/// Mutable graph arena used during construction.
///
/// Node slots are allocated up front for every id with its pre-drawn level;
/// a node becomes reachable only once some insertion links to it.
pub(crate) struct BuildGraph {
    nodes: Vec<BuildNode>,
    entry: EntryPoint,
    m: usize,
    max_m0: usize,
}

impl BuildGraph {
    /// Allocates slots for `levels.len()` nodes and seeds the entry point with `first`.
    pub(crate) fn new(levels: &[usize], first: u32, m: usize, max_m0: usize) -> Self {
        let nodes = levels
            .iter()
            .map(|&level| BuildNode {
                level,
                layers: (0..=level)
                    .map(|layer| {
                        let cap = if layer == 0 { max_m0 } else { m };
                        Mutex::new(Vec::with_capacity(cap + 1))
                    })
                    .collect(),
            })
            .collect();
        let first_level = levels.get(first as usize).copied().unwrap_or(0);
        Self {
            nodes,
            entry: EntryPoint::new(first, first_level),
            m,
            max_m0,
        }
    }

    #[inline]
    pub(crate) fn entry(&self) -> &EntryPoint {
        &self.entry
    }

    #[inline]
    pub(crate) fn level(&self, id: u32) -> usize {
        self.nodes[id as usize].level
    }

    /// Degree cap at `layer`.
    #[inline]
    pub(crate) fn cap(&self, layer: usize) -> usize {
        if layer == 0 {
            self.max_m0
        } else {
            self.m
        }
    }

    /// Lock the neighbor list of `id` at `layer`. `None` above the node's level.
    #[inline]
    pub(crate) fn layer(&self, id: u32, layer: usize) -> Option<&Mutex<Vec<u32>>> {
        self.nodes[id as usize].layers.get(layer)
    }

    /// Copy of the neighbor list of `id` at `layer`.
    pub(crate) fn neighbors(&self, id: u32, layer: usize) -> Vec<u32> {
        self.layer(id, layer)
            .map(|list| list.lock().clone())
            .unwrap_or_default()
    }

    /// Consume the arena into a read-only graph.
    pub(crate) fn freeze(self) -> ProximityGraph {
        let (entry_point, max_level) = self.entry.snapshot();
        let mut levels = Vec::with_capacity(self.nodes.len());
        let mut neighbors = Vec::with_capacity(self.nodes.len());
        for node in self.nodes {
            levels.push(node.level as u8);
            neighbors.push(
                node.layers
                    .into_vec()
                    .into_iter()
                    .map(Mutex::into_inner)
                    .collect(),
            );
        }
        ProximityGraph {
            neighbors,
            levels,
            entry_point,
            max_level,
            m: self.m,
            max_m0: self.max_m0,
        }
    }
}

impl NeighborSource for BuildGraph {
    fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    fn for_each_neighbor<F: FnMut(u32)>(&self, id: u32, layer: usize, f: F) {
        if let Some(list) = self.layer(id, layer) {
            list.lock().iter().copied().for_each(f);
        }
    }
}

/// Frozen proximity graph using Struct-of-Arrays layout.
///
/// `neighbors[id][layer]` holds the neighbor ids of node `id` at `layer`, for
/// `layer` in `0..=levels[id]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProximityGraph {
    neighbors: Vec<Vec<Vec<u32>>>, // [node_id][layer][neighbor_ids]
    levels: Vec<u8>,
    entry_point: u32,
    max_level: usize,
    m: usize,
    max_m0: usize,
}

impl ProximityGraph {
    /// Assemble a graph from decoded parts, checking every structural invariant.
    pub(crate) fn from_parts(
        neighbors: Vec<Vec<Vec<u32>>>,
        entry_point: u32,
        m: usize,
        max_m0: usize,
    ) -> Result<Self> {
        let n = neighbors.len();
        if n == 0 {
            return Err(IndexError::CorruptModel("graph has no nodes".to_string()));
        }
        let mut levels = Vec::with_capacity(n);
        let mut sorted = Vec::new();
        for (id, layers) in neighbors.iter().enumerate() {
            let level = layers.len().checked_sub(1).ok_or_else(|| {
                IndexError::CorruptModel(format!("node {id} has no layers"))
            })?;
            if level > config::HNSW_MAX_LEVEL {
                return Err(IndexError::CorruptModel(format!(
                    "node {id} has level {level}, above the limit {}",
                    config::HNSW_MAX_LEVEL
                )));
            }
            for (layer, list) in layers.iter().enumerate() {
                if let Some(&bad) = list.iter().find(|&&nb| nb as usize >= n) {
                    return Err(IndexError::CorruptModel(format!(
                        "node {id} layer {layer} links to id {bad}, node count is {n}"
                    )));
                }
                if list.contains(&(id as u32)) {
                    return Err(IndexError::CorruptModel(format!(
                        "node {id} layer {layer} links to itself"
                    )));
                }
                sorted.clear();
                sorted.extend_from_slice(list);
                sorted.sort_unstable();
                if let Some(pair) = sorted.windows(2).find(|pair| pair[0] == pair[1]) {
                    return Err(IndexError::CorruptModel(format!(
                        "node {id} layer {layer} lists neighbor {} twice",
                        pair[0]
                    )));
                }
            }
            levels.push(level as u8);
        }
        let max_level = levels.iter().copied().max().unwrap_or(0) as usize;
        let entry_level = *levels.get(entry_point as usize).ok_or_else(|| {
            IndexError::CorruptModel(format!(
                "entry point {entry_point} out of range for {n} nodes"
            ))
        })? as usize;
        if entry_level != max_level {
            return Err(IndexError::CorruptModel(format!(
                "entry point level {entry_level} is below the maximum level {max_level}"
            )));
        }
        Ok(Self {
            neighbors,
            levels,
            entry_point,
            max_level,
            m,
            max_m0,
        })
    }

    /// Returns the number of nodes in the graph.
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn entry_point(&self) -> u32 {
        self.entry_point
    }

    pub fn max_level(&self) -> usize {
        self.max_level
    }

    pub fn m(&self) -> usize {
        self.m
    }

    pub fn max_m0(&self) -> usize {
        self.max_m0
    }

    /// Returns the level assignment of the given node.
    #[inline]
    pub fn level(&self, id: u32) -> usize {
        self.levels[id as usize] as usize
    }

    /// Neighbors of `id` at `layer`; empty above the node's level.
    #[inline]
    pub fn neighbors(&self, id: u32, layer: usize) -> &[u32] {
        self.neighbors[id as usize]
            .get(layer)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All layers of node `id`, layer 0 first.
    pub(crate) fn layers(&self, id: u32) -> &[Vec<u32>] {
        &self.neighbors[id as usize]
    }

    /// Histogram of layer-0 out-degrees: entry `d` counts nodes with exactly `d` neighbors.
    pub fn degree_distribution(&self) -> Vec<usize> {
        let mut hist = vec![0usize; self.max_m0 + 1];
        for layers in &self.neighbors {
            let degree = layers.first().map_or(0, Vec::len);
            if degree >= hist.len() {
                hist.resize(degree + 1, 0);
            }
            hist[degree] += 1;
        }
        hist
    }
}

impl NeighborSource for ProximityGraph {
    fn node_count(&self) -> usize {
        self.len()
    }

    #[inline]
    fn for_each_neighbor<F: FnMut(u32)>(&self, id: u32, layer: usize, f: F) {
        self.neighbors(id, layer).iter().copied().for_each(f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = BuildConfig::default();
        assert_eq!(cfg.m, 12);
        assert_eq!(cfg.max_m0, 24);
        assert_eq!(cfg.ef_construction, 150);
        assert_eq!(cfg.n_threads, 1);
        assert_eq!(cfg.neighbor_policy, NeighborPolicy::Heuristic);
        assert!((cfg.level_mult() - 1.0 / 12f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_resolved_fills_zeroes() {
        let cfg = BuildConfig {
            m: 8,
            max_m0: 0,
            ef_construction: 0,
            n_threads: 0,
            mult: Some(-1.0),
            ..BuildConfig::default()
        }
        .resolved();
        assert_eq!(cfg.max_m0, 16);
        assert_eq!(cfg.ef_construction, 150);
        assert_eq!(cfg.n_threads, 1);
        assert!((cfg.mult.unwrap() - 1.0 / 8f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_from_pairs() {
        let cfg = BuildConfig::from_pairs([
            ("M", "5"),
            ("efConstruction", "300"),
            ("NumThread", "-1"),
            ("NeighborSelecting", "heuristic_save_remains"),
            ("GraphMerging", "merge_level0"),
            ("EnsureK", "repair"),
            ("Mult", "0.5"),
        ])
        .unwrap();
        assert_eq!(cfg.m, 5);
        assert_eq!(cfg.max_m0, 10);
        assert_eq!(cfg.ef_construction, 300);
        assert_eq!(cfg.n_threads, 1);
        assert_eq!(cfg.neighbor_policy, NeighborPolicy::HeuristicSaveRemains);
        assert_eq!(cfg.graph_merging, GraphMerging::MergeLevel0);
        assert_eq!(cfg.ensure_k, EnsureKPolicy::Repair);
        assert_eq!(cfg.mult, Some(0.5));
    }

    #[test]
    fn test_from_pairs_rejects_unknown() {
        assert!(matches!(
            BuildConfig::from_pairs([("Bogus", "1")]),
            Err(IndexError::InvalidConfig(_))
        ));
        assert!(matches!(
            BuildConfig::from_pairs([("NeighborSelecting", "random")]),
            Err(IndexError::InvalidConfig(_))
        ));
        assert!(matches!(
            BuildConfig::from_pairs([("M", "many")]),
            Err(IndexError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_entry_point_raise_only_upwards() {
        let ep = EntryPoint::new(0, 2);
        assert!(!ep.try_raise(5, 2));
        assert_eq!(ep.snapshot(), (0, 2));
        assert!(ep.try_raise(7, 4));
        assert_eq!(ep.snapshot(), (7, 4));
        assert!(!ep.try_raise(9, 3));
        assert_eq!(ep.snapshot(), (7, 4));
    }

    #[test]
    fn test_freeze_keeps_adjacency() {
        let graph = BuildGraph::new(&[1, 0, 0], 0, 2, 4);
        graph.layer(0, 0).unwrap().lock().extend([1, 2]);
        graph.layer(1, 0).unwrap().lock().push(0);
        assert!(graph.layer(1, 1).is_none());
        let frozen = graph.freeze();
        assert_eq!(frozen.len(), 3);
        assert_eq!(frozen.entry_point(), 0);
        assert_eq!(frozen.max_level(), 1);
        assert_eq!(frozen.neighbors(0, 0), &[1, 2]);
        assert_eq!(frozen.neighbors(1, 0), &[0]);
        assert!(frozen.neighbors(1, 1).is_empty());
        assert_eq!(frozen.degree_distribution(), vec![1, 1, 1, 0, 0]);
    }

    #[test]
    fn test_from_parts_validation() {
        let ok = ProximityGraph::from_parts(vec![vec![vec![1]], vec![vec![0]]], 0, 2, 4);
        assert!(ok.is_ok());
        let dangling = ProximityGraph::from_parts(vec![vec![vec![3]], vec![vec![0]]], 0, 2, 4);
        assert!(matches!(dangling, Err(IndexError::CorruptModel(_))));
        let self_loop = ProximityGraph::from_parts(vec![vec![vec![1]], vec![vec![0, 1]]], 0, 2, 4);
        assert!(matches!(self_loop, Err(IndexError::CorruptModel(msg)) if msg.contains("itself")));
        let repeated =
            ProximityGraph::from_parts(vec![vec![vec![1, 2, 1]], vec![vec![0]], vec![vec![0]]], 0, 2, 4);
        assert!(matches!(repeated, Err(IndexError::CorruptModel(msg)) if msg.contains("twice")));
        let low_entry =
            ProximityGraph::from_parts(vec![vec![vec![1]], vec![vec![0], vec![]]], 0, 2, 4);
        assert!(matches!(low_entry, Err(IndexError::CorruptModel(_))));
    }
}
