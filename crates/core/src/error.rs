//! Error types for index operations.

use std::io;
use thiserror::Error;

/// Errors that can occur while building, querying, or persisting an index.
///
/// All errors are reported synchronously at the operation boundary; nothing
/// inside the index retries.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Vector length disagrees with the index dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Id outside `[0, node_count)`.
    #[error("unknown id {id} (node count {node_count})")]
    UnknownId { id: u32, node_count: usize },

    /// Search attempted before `build` or `load`.
    #[error("index is not built; call build() or load() first")]
    IndexNotBuilt,

    /// Mutation attempted on a built (read-only) index.
    #[error("index is already built and read-only")]
    AlreadyBuilt,

    /// Build attempted with no vectors in the store.
    #[error("no vectors to build; add vectors first")]
    EmptyIndex,

    /// Model file is malformed, truncated, or fails its checksum.
    #[error("corrupt model: {0}")]
    CorruptModel(String),

    /// Model file carries a format version this build cannot read.
    #[error("unsupported model version {found} (supported: {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    /// Angular metric given a vector with zero norm.
    #[error("zero-norm vector cannot be used with the angular metric")]
    ZeroNormVector,

    /// Invalid build or index configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Build stopped at a cancellation checkpoint.
    #[error("build cancelled")]
    Cancelled,

    /// I/O error from filesystem operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for index operations.
pub type Result<T> = std::result::Result<T, IndexError>;

impl From<bincode::Error> for IndexError {
    fn from(e: bincode::Error) -> Self {
        match *e {
            bincode::ErrorKind::Io(io) if io.kind() == io::ErrorKind::UnexpectedEof => {
                IndexError::CorruptModel("unexpected end of model data".to_string())
            }
            bincode::ErrorKind::Io(io) => IndexError::Io(io),
            other => IndexError::CorruptModel(other.to_string()),
        }
    }
}
