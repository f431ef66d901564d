//! # navgraph-core
//!
//! Approximate nearest neighbor search over dense `f32` vectors using a
//! hierarchical navigable small world graph.
//!
//! Vectors are appended to an [`HnswIndex`], the graph is built once (in
//! parallel when asked), and the frozen index then answers k-nearest-neighbor
//! queries from any number of threads. Built indexes persist to a single
//! checksummed model file that can be loaded eagerly or memory-mapped.
//!
//! ```no_run
//! use navgraph_core::{BuildConfig, DistanceMetric, HnswIndex};
//!
//! # fn main() -> navgraph_core::Result<()> {
//! let mut index = HnswIndex::new(3, DistanceMetric::L2)?;
//! index.add_vector(&[0.0, 1.0, 2.0])?;
//! index.add_vector(&[9.0, 11.0, 13.0])?;
//! index.build(&BuildConfig::default())?;
//! let hits = index.search_by_vector(&[0.0, 1.0, 2.0], 1, 0)?;
//! assert_eq!(hits[0].id, 0);
//! # Ok(())
//! # }
//! ```

/// Global configuration constants: limits, defaults, and model-format constants.
pub mod config;
/// Error type shared by every fallible operation.
pub mod error;
/// HNSW graph: storage, distance metrics, construction, and search.
pub mod hnsw;
/// The index facade tying storage, construction, search, and persistence together.
pub mod index;
/// Storage layer: model file save/load.
pub mod storage;

pub use error::{IndexError, Result};
pub use hnsw::{
    BuildConfig, DistanceMetric, EnsureKPolicy, GraphMerging, Neighbor, NeighborPolicy,
    ProximityGraph, SearchParams,
};
pub use index::HnswIndex;
pub use storage::LoadStrategy;
