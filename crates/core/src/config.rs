//! Global configuration constants for navgraph.
//!
//! Tuning defaults, input limits, and model-format constants live here. These
//! are compile-time values; per-build tuning is carried by
//! [`BuildConfig`](crate::hnsw::graph::BuildConfig), which falls back to these
//! defaults for any parameter left at zero.

/// Default number of neighbors kept per node on layers above 0.
///
/// Higher values improve recall but increase memory and build time.
/// Typical range: 5–48. Default: 12.
pub const HNSW_DEFAULT_M: usize = 12;

/// Default candidate list size during index construction.
///
/// Controls the width of the beam explored while inserting a node.
/// Higher values produce a better graph but slow down build time.
pub const HNSW_DEFAULT_EF_CONSTRUCTION: usize = 150;

/// Multiplier applied to `k` when a search is issued with `ef == 0`.
pub const HNSW_DEFAULT_EF_SEARCH_PER_K: usize = 50;

/// Default number of worker threads used by the graph builder.
pub const HNSW_DEFAULT_THREADS: usize = 1;

/// Default beam width of the post-build ensure-k connectivity check.
pub const HNSW_DEFAULT_EF_ENSURE: usize = 10;

/// Default seed for the level generator. Fixed so that single-threaded builds
/// are reproducible without any caller setup.
pub const HNSW_DEFAULT_SEED: u64 = 17;

/// Hard cap on the level a node may be assigned.
///
/// Levels are drawn as `floor(-ln(uniform) * mult)`; the cap only bites for
/// pathological `mult` values.
pub const HNSW_MAX_LEVEL: usize = 31;

/// Minimum number of ids handed to a build worker at a time.
///
/// Matches a dynamic schedule of 128-id chunks: large enough to amortize
/// scheduling, small enough to balance uneven insertion costs.
pub const BUILD_CHUNK_SIZE: usize = 128;

/// Maximum allowed vector dimension.
pub const MAX_DIMENSION: usize = 65_536;

/// Magic bytes at the start of every model file.
pub const MODEL_MAGIC: [u8; 8] = *b"NAVGRAPH";

/// Current model format version. Loaders reject any other value.
pub const MODEL_FORMAT_VERSION: u32 = 1;

/// Magic bytes written before the CRC32 footer of a model file.
pub const MODEL_CRC_MAGIC: &[u8; 4] = b"NCRC";
