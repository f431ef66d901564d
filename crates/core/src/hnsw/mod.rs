//! Hierarchical Navigable Small World (HNSW) approximate nearest neighbor graph.
//!
//! Vectors live in a dense [`VectorStore`] addressed by `u32` id. Construction
//! runs over a lock-per-node-layer arena so any number of workers can insert
//! at once, then freezes into a Struct-of-Arrays [`ProximityGraph`] that
//! queries traverse without locking.

/// Distance metrics: squared L2, angular, and negative dot product.
pub mod distance;
/// Graph structure, build configuration, and the build arena.
pub mod graph;
/// Insertion with bidirectional linking, parallel build, and layer-0 merging.
pub mod insert;
/// Post-build ensure-k connectivity repair.
pub mod repair;
/// Single-layer beam search, greedy descent, and KNN queries.
pub mod search;
/// Neighbor selection policies.
pub mod select;
/// SIMD distance kernels.
pub mod simd;
/// Append-only vector table.
pub mod store;
/// Generation-based visited set for efficient graph traversal.
pub mod visited;

pub use distance::DistanceMetric;
pub use graph::{BuildConfig, EnsureKPolicy, GraphMerging, NeighborPolicy, ProximityGraph};
pub use search::{Neighbor, SearchEngine, SearchParams};
pub use store::VectorStore;
