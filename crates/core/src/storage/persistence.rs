//! Model files: save/load of a built index.
//!
//! Layout (little-endian; header and graph section use bincode's fixed-int encoding):
//!
//! ```text
//! [header 48 bytes][vectors: node_count * dimension * f32][graph: per-node records]["NCRC"][CRC32 BE]
//! ```
//!
//! Writes use atomic temp-file + fsync + rename, so a failed save never leaves a
//! truncated file at the target path. Eager loads verify the CRC32 footer; lazy
//! loads memory-map the file and only validate its structure.

use crate::config;
use crate::error::{IndexError, Result};
use crate::hnsw::distance::DistanceMetric;
use crate::hnsw::graph::ProximityGraph;
use crate::hnsw::store::VectorStore;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Encoded size of [`ModelHeader`]: magic, eight `u32` fields and a `u64`.
const HEADER_LEN: usize = 48;

/// Footer: CRC magic plus a big-endian CRC32.
const FOOTER_LEN: usize = 8;

/// How a model file is brought into memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadStrategy {
    /// Read the whole file and verify its checksum.
    #[default]
    Eager,
    /// Memory-map the file and serve vectors from the map.
    Lazy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ModelHeader {
    magic: [u8; 8],
    version: u32,
    metric: u32,
    dimension: u32,
    node_count: u32,
    m: u32,
    max_m0: u32,
    max_level: u32,
    entry_point: u32,
    /// Byte offset of the graph section.
    graph_offset: u64,
}

#[derive(Serialize)]
struct NodeRecordRef<'a> {
    level: u32,
    layers: &'a [Vec<u32>],
}

#[derive(Deserialize)]
struct NodeRecord {
    level: u32,
    layers: Vec<Vec<u32>>,
}

/// Everything a model file reconstructs.
#[derive(Debug)]
pub struct LoadedModel {
    pub metric: DistanceMetric,
    pub store: VectorStore,
    pub graph: ProximityGraph,
}

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| IndexError::InvalidConfig(format!("{what} {value} does not fit the model format")))
}

fn corrupt(msg: impl Into<String>) -> IndexError {
    IndexError::CorruptModel(msg.into())
}

/// Encode a model into bytes, footer included.
pub fn encode_model(
    store: &VectorStore,
    graph: &ProximityGraph,
    metric: DistanceMetric,
) -> Result<Vec<u8>> {
    let n = store.len();
    let vector_bytes = store.as_flat().len() * 4;
    let header = ModelHeader {
        magic: config::MODEL_MAGIC,
        version: config::MODEL_FORMAT_VERSION,
        metric: metric.to_tag(),
        dimension: to_u32(store.dimension(), "dimension")?,
        node_count: to_u32(n, "node count")?,
        m: to_u32(graph.m(), "M")?,
        max_m0: to_u32(graph.max_m0(), "MaxM0")?,
        max_level: to_u32(graph.max_level(), "max level")?,
        entry_point: graph.entry_point(),
        graph_offset: (HEADER_LEN + vector_bytes) as u64,
    };

    let mut out = Vec::with_capacity(HEADER_LEN + vector_bytes + n * 16 + FOOTER_LEN);
    bincode::serialize_into(&mut out, &header)?;
    debug_assert_eq!(out.len(), HEADER_LEN);
    for &x in store.as_flat() {
        out.extend_from_slice(&x.to_le_bytes());
    }
    for id in 0..n as u32 {
        let record = NodeRecordRef {
            level: graph.level(id) as u32,
            layers: graph.layers(id),
        };
        bincode::serialize_into(&mut out, &record)?;
    }

    let crc = crc32fast::hash(&out);
    out.extend_from_slice(config::MODEL_CRC_MAGIC);
    out.extend_from_slice(&crc.to_be_bytes());
    Ok(out)
}

/// Save a model with an atomic write: `<path>.tmp`, fsync, rename.
pub fn save_model(
    path: &Path,
    store: &VectorStore,
    graph: &ProximityGraph,
    metric: DistanceMetric,
) -> Result<()> {
    let bytes = encode_model(store, graph, metric)?;
    let tmp_path = tmp_path_for(path);

    let written = write_synced(&tmp_path, &bytes).and_then(|_| fs::rename(&tmp_path, path));
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }

    tracing::info!(
        path = %path.display(),
        nodes = store.len(),
        bytes = bytes.len(),
        "saved model (CRC32={:#010x})",
        crc32fast::hash(&bytes[..bytes.len() - FOOTER_LEN])
    );
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Load a model file.
pub fn load_model(path: &Path, strategy: LoadStrategy) -> Result<LoadedModel> {
    let model = match strategy {
        LoadStrategy::Eager => {
            let raw = fs::read(path)?;
            let payload = verify_footer(&raw)?;
            decode_model(payload)?
        }
        LoadStrategy::Lazy => load_mapped(path)?,
    };
    tracing::info!(
        path = %path.display(),
        ?strategy,
        nodes = model.store.len(),
        dimension = model.store.dimension(),
        metric = %model.metric,
        mapped = model.store.is_mapped(),
        "loaded model"
    );
    Ok(model)
}

/// Check the CRC32 footer and return the payload it covers.
fn verify_footer(raw: &[u8]) -> Result<&[u8]> {
    let payload = footer_payload(raw)?;
    let stored_crc = u32::from_be_bytes([
        raw[raw.len() - 4],
        raw[raw.len() - 3],
        raw[raw.len() - 2],
        raw[raw.len() - 1],
    ]);
    let computed_crc = crc32fast::hash(payload);
    if computed_crc != stored_crc {
        return Err(corrupt(format!(
            "CRC32 mismatch: expected {stored_crc:#010x}, got {computed_crc:#010x}"
        )));
    }
    tracing::debug!("model CRC32 verified: {:#010x}", stored_crc);
    Ok(payload)
}

/// Payload bytes in front of the footer. Only the footer magic is checked.
fn footer_payload(raw: &[u8]) -> Result<&[u8]> {
    if raw.len() < HEADER_LEN + FOOTER_LEN {
        return Err(corrupt(format!("file too short ({} bytes)", raw.len())));
    }
    let magic_at = raw.len() - FOOTER_LEN;
    if &raw[magic_at..magic_at + 4] != config::MODEL_CRC_MAGIC {
        return Err(corrupt("missing checksum footer"));
    }
    Ok(&raw[..magic_at])
}

fn read_header(payload: &[u8]) -> Result<ModelHeader> {
    if payload.len() < HEADER_LEN {
        return Err(corrupt("truncated header"));
    }
    let header: ModelHeader = bincode::deserialize(&payload[..HEADER_LEN])?;
    if header.magic != config::MODEL_MAGIC {
        return Err(corrupt("bad magic bytes"));
    }
    if header.version != config::MODEL_FORMAT_VERSION {
        return Err(IndexError::UnsupportedVersion {
            found: header.version,
            supported: config::MODEL_FORMAT_VERSION,
        });
    }
    let dimension = header.dimension as usize;
    if dimension == 0 || dimension > config::MAX_DIMENSION {
        return Err(corrupt(format!("invalid dimension {dimension}")));
    }
    if header.node_count == 0 {
        return Err(corrupt("model has no nodes"));
    }
    let expected_offset = (header.node_count as usize)
        .checked_mul(dimension)
        .and_then(|floats| floats.checked_mul(4))
        .and_then(|bytes| bytes.checked_add(HEADER_LEN))
        .ok_or_else(|| corrupt("vector table size overflows"))?;
    if header.graph_offset != expected_offset as u64 {
        return Err(corrupt(format!(
            "graph offset {} does not match vector table end {expected_offset}",
            header.graph_offset
        )));
    }
    if expected_offset > payload.len() {
        return Err(corrupt(format!(
            "vector table ends at byte {expected_offset}, payload has {}",
            payload.len()
        )));
    }
    Ok(header)
}

fn metric_of(header: &ModelHeader) -> Result<DistanceMetric> {
    DistanceMetric::from_tag(header.metric)
        .ok_or_else(|| corrupt(format!("unknown metric tag {}", header.metric)))
}

fn read_graph(header: &ModelHeader, payload: &[u8]) -> Result<ProximityGraph> {
    let mut cursor = &payload[header.graph_offset as usize..];
    let n = header.node_count as usize;
    let mut neighbors = Vec::with_capacity(n);
    for id in 0..n {
        let record: NodeRecord = bincode::deserialize_from(&mut cursor)?;
        if record.layers.len() != record.level as usize + 1 {
            return Err(corrupt(format!(
                "node {id} declares level {} but stores {} layers",
                record.level,
                record.layers.len()
            )));
        }
        neighbors.push(record.layers);
    }
    if !cursor.is_empty() {
        return Err(corrupt(format!("{} trailing bytes after graph", cursor.len())));
    }
    let graph = ProximityGraph::from_parts(
        neighbors,
        header.entry_point,
        header.m as usize,
        header.max_m0 as usize,
    )?;
    if graph.max_level() != header.max_level as usize {
        return Err(corrupt(format!(
            "header max level {} disagrees with graph max level {}",
            header.max_level,
            graph.max_level()
        )));
    }
    Ok(graph)
}

fn decode_vectors(header: &ModelHeader, payload: &[u8]) -> Vec<f32> {
    payload[HEADER_LEN..header.graph_offset as usize]
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn decode_model(payload: &[u8]) -> Result<LoadedModel> {
    let header = read_header(payload)?;
    let metric = metric_of(&header)?;
    let graph = read_graph(&header, payload)?;
    let store = VectorStore::from_flat(header.dimension as usize, decode_vectors(&header, payload))?;
    Ok(LoadedModel {
        metric,
        store,
        graph,
    })
}

fn load_mapped(path: &Path) -> Result<LoadedModel> {
    let file = File::open(path)?;
    // SAFETY: the map is read-only; model files are replaced by rename, never
    // rewritten in place.
    let map = unsafe { Mmap::map(&file)? };

    let payload = footer_payload(&map)?;
    let header = read_header(payload)?;
    let metric = metric_of(&header)?;
    let graph = read_graph(&header, payload)?;
    let dimension = header.dimension as usize;
    let n = header.node_count as usize;

    // Mapped pages are page-aligned, so the table at byte 48 is f32-aligned
    let mappable = cfg!(target_endian = "little")
        && (map.as_ptr() as usize + HEADER_LEN) % std::mem::align_of::<f32>() == 0;
    let store = if mappable {
        VectorStore::from_mapped(dimension, n, map, HEADER_LEN)
            .ok_or_else(|| corrupt("vector table cannot be mapped"))?
    } else {
        tracing::debug!("vector table cannot be served from the map, decoding eagerly");
        VectorStore::from_flat(dimension, decode_vectors(&header, payload))?
    };
    Ok(LoadedModel {
        metric,
        store,
        graph,
    })
}
