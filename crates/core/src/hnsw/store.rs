//! Append-only vector table.
//!
//! The position at which a vector is appended is its permanent id. Vectors
//! live contiguously in one arena (`id * dimension` is the start offset), either
//! owned on the heap or borrowed from a memory-mapped model file.

use crate::error::{IndexError, Result};
use memmap2::Mmap;

enum Backing {
    Owned(Vec<f32>),
    /// Vectors read in place from a mapped model file, starting at `offset`.
    Mapped { map: Mmap, offset: usize },
}

/// Dense id → vector table with a fixed dimension.
pub struct VectorStore {
    dimension: usize,
    len: usize,
    backing: Backing,
}

impl VectorStore {
    /// Creates an empty, appendable store.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            len: 0,
            backing: Backing::Owned(Vec::new()),
        }
    }

    /// Wraps an already-populated arena. `data.len()` must be a multiple of `dimension`.
    pub(crate) fn from_flat(dimension: usize, data: Vec<f32>) -> Result<Self> {
        if dimension == 0 || data.len() % dimension != 0 {
            return Err(IndexError::CorruptModel(format!(
                "vector table of {} floats does not divide into dimension {}",
                data.len(),
                dimension
            )));
        }
        Ok(Self {
            dimension,
            len: data.len() / dimension,
            backing: Backing::Owned(data),
        })
    }

    /// Serves `len` vectors straight out of `map`, beginning at byte `offset`.
    ///
    /// Returns `None` when the mapped floats cannot be viewed in place
    /// (misaligned offset or a big-endian target); callers then decode eagerly.
    pub(crate) fn from_mapped(
        dimension: usize,
        len: usize,
        map: Mmap,
        offset: usize,
    ) -> Option<Self> {
        if cfg!(target_endian = "big") {
            return None;
        }
        let byte_len = len.checked_mul(dimension)?.checked_mul(4)?;
        let end = offset.checked_add(byte_len)?;
        if end > map.len() {
            return None;
        }
        if (map.as_ptr() as usize + offset) % std::mem::align_of::<f32>() != 0 {
            return None;
        }
        Some(Self {
            dimension,
            len,
            backing: Backing::Mapped { map, offset },
        })
    }

    /// Append a vector and return its id.
    ///
    /// Fails with [`IndexError::DimensionMismatch`] on a wrong-length vector,
    /// leaving the store unchanged. A memory-mapped store is read-only.
    pub fn append(&mut self, vector: &[f32]) -> Result<u32> {
        if vector.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        let id = u32::try_from(self.len)
            .map_err(|_| IndexError::InvalidConfig("vector store is full".to_string()))?;
        match &mut self.backing {
            Backing::Owned(data) => data.extend_from_slice(vector),
            Backing::Mapped { .. } => return Err(IndexError::AlreadyBuilt),
        }
        self.len += 1;
        Ok(id)
    }

    /// Look up a vector by id.
    pub fn get(&self, id: u32) -> Result<&[f32]> {
        if (id as usize) >= self.len {
            return Err(IndexError::UnknownId {
                id,
                node_count: self.len,
            });
        }
        Ok(self.vector(id))
    }

    /// Unchecked-by-contract lookup for traversal hot paths. Panics on an
    /// out-of-range id, which only a corrupted graph could produce.
    #[inline]
    pub fn vector(&self, id: u32) -> &[f32] {
        let start = id as usize * self.dimension;
        &self.as_flat()[start..start + self.dimension]
    }

    /// All vectors as one contiguous slice, in id order.
    pub fn as_flat(&self) -> &[f32] {
        match &self.backing {
            Backing::Owned(data) => data,
            Backing::Mapped { map, offset } => {
                let bytes = &map[*offset..*offset + self.len * self.dimension * 4];
                // SAFETY: from_mapped checked bounds, f32 alignment, and a
                // little-endian target; the map is read-only and lives as long
                // as `self`.
                unsafe {
                    std::slice::from_raw_parts(
                        bytes.as_ptr() as *const f32,
                        self.len * self.dimension,
                    )
                }
            }
        }
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when vectors are served from a memory-mapped file.
    pub fn is_mapped(&self) -> bool {
        matches!(self.backing, Backing::Mapped { .. })
    }
}

impl std::fmt::Debug for VectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorStore")
            .field("dimension", &self.dimension)
            .field("len", &self.len)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}
