//! Storage layer: binary model files.
//!
//! A built index is persisted as one checksummed file (header, vector table,
//! adjacency) written with an atomic temp-file + rename, and loaded either
//! eagerly or through a read-only memory map.

/// Model file encoding, atomic save, and eager/lazy load.
pub mod persistence;

pub use persistence::{load_model, save_model, LoadStrategy, LoadedModel};
