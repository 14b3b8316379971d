//! On-disk pair of `<name>.index` and `<name>_docs`.
//!
//! The index file is `KBVI`, a little-endian `u32` header length, a JSON
//! [`IndexHeader`], then the raw vector payload. The docs file is the JSON
//! array of chunks, and the header records its SHA-256 so a pair from two
//! different builds is rejected on load.
use crate::error::IndexError;
use crate::index::FlatIndex;
use crate::models::{distance_to_score, RetrievalResult};
use crate::store::DocumentStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

pub const INDEX_MAGIC: &[u8; 4] = b"KBVI";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexHeader {
    pub format_version: u32,
    pub build_id: Uuid,
    pub built_at: DateTime<Utc>,
    pub encoder_model: String,
    pub dimensions: usize,
    pub count: usize,
    pub docs_sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub name: String,
    pub index: PathBuf,
    pub docs: PathBuf,
}

impl ArtifactPaths {
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            name: name.to_string(),
            index: dir.join(format!("{name}.index")),
            docs: dir.join(format!("{name}_docs")),
        }
    }

    pub fn exists(&self) -> bool {
        self.index.is_file() && self.docs.is_file()
    }

    fn corrupt(&self, reason: impl Into<String>) -> IndexError {
        IndexError::Corrupt {
            name: self.name.clone(),
            reason: reason.into(),
        }
    }
}

/// A validated index and document store from one build.
#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    pub header: IndexHeader,
    pub index: FlatIndex,
    pub documents: DocumentStore,
}

impl IndexSnapshot {
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// k-NN over the vectors, joined with the chunk stored at each position.
    pub fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<RetrievalResult>, IndexError> {
        self.index
            .search(query, k)?
            .into_iter()
            .map(|neighbor| {
                let chunk = self.documents.get(neighbor.position).ok_or_else(|| {
                    IndexError::Corrupt {
                        name: self.header.build_id.to_string(),
                        reason: format!("no document at position {}", neighbor.position),
                    }
                })?;
                Ok(RetrievalResult {
                    content: chunk.content.clone(),
                    metadata: chunk.metadata.clone(),
                    distance: neighbor.distance,
                    score: distance_to_score(neighbor.distance),
                })
            })
            .collect()
    }
}

/// Writes both files next to their final location and renames them into
/// place, docs first and index last. A reader either sees the previous pair,
/// or a new docs file whose digest the old index rejects, or the new pair.
pub fn save_artifact(
    paths: &ArtifactPaths,
    build_id: Uuid,
    encoder_model: &str,
    index: &FlatIndex,
    documents: &DocumentStore,
) -> Result<IndexHeader, IndexError> {
    if index.len() != documents.len() {
        return Err(paths.corrupt(format!(
            "refusing to write {} vectors with {} documents",
            index.len(),
            documents.len()
        )));
    }

    let docs_bytes = documents.to_json_bytes()?;
    let header = IndexHeader {
        format_version: FORMAT_VERSION,
        build_id,
        built_at: Utc::now(),
        encoder_model: encoder_model.to_string(),
        dimensions: index.dimensions(),
        count: index.len(),
        docs_sha256: sha256_hex(&docs_bytes),
    };

    let header_bytes = serde_json::to_vec(&header)?;
    let header_len = u32::try_from(header_bytes.len())
        .map_err(|_| paths.corrupt("index header exceeds u32 length"))?;
    let payload = index.to_le_bytes();
    let mut index_bytes = Vec::with_capacity(8 + header_bytes.len() + payload.len());
    index_bytes.extend_from_slice(INDEX_MAGIC);
    index_bytes.extend_from_slice(&header_len.to_le_bytes());
    index_bytes.extend_from_slice(&header_bytes);
    index_bytes.extend_from_slice(&payload);

    for path in [&paths.index, &paths.docs] {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
    }

    let docs_tmp = tmp_path(&paths.docs, build_id);
    let index_tmp = tmp_path(&paths.index, build_id);
    let written = write_synced(&docs_tmp, &docs_bytes)
        .and_then(|_| write_synced(&index_tmp, &index_bytes))
        .and_then(|_| fs::rename(&docs_tmp, &paths.docs))
        .and_then(|_| fs::rename(&index_tmp, &paths.index));
    if let Err(error) = written {
        let _ = fs::remove_file(&docs_tmp);
        let _ = fs::remove_file(&index_tmp);
        return Err(error.into());
    }

    info!(
        index = %paths.index.display(),
        build_id = %header.build_id,
        count = header.count,
        "index artifact committed"
    );
    Ok(header)
}

/// Reads and cross-checks both files. Missing files yield
/// [`IndexError::NotBuilt`]; anything inconsistent yields
/// [`IndexError::Corrupt`].
pub fn load_artifact(paths: &ArtifactPaths) -> Result<IndexSnapshot, IndexError> {
    let index_bytes = read_or_not_built(paths, &paths.index)?;
    let docs_bytes = read_or_not_built(paths, &paths.docs)?;

    let (header, payload) = parse_index_file(paths, &index_bytes)?;
    if header.format_version != FORMAT_VERSION {
        return Err(paths.corrupt(format!(
            "unsupported format version {}",
            header.format_version
        )));
    }
    if sha256_hex(&docs_bytes) != header.docs_sha256 {
        return Err(paths.corrupt("document store does not belong to this index"));
    }

    let documents = DocumentStore::from_json_bytes(&docs_bytes)
        .map_err(|error| paths.corrupt(format!("document store is unreadable: {error}")))?;
    if documents.len() != header.count {
        return Err(paths.corrupt(format!(
            "header counts {} vectors but document store holds {}",
            header.count,
            documents.len()
        )));
    }

    let index = FlatIndex::from_le_bytes(header.dimensions, header.count, payload)
        .map_err(|error| paths.corrupt(error.to_string()))?;

    debug!(
        index = %paths.index.display(),
        build_id = %header.build_id,
        count = header.count,
        "index artifact loaded"
    );
    Ok(IndexSnapshot {
        header,
        index,
        documents,
    })
}

fn parse_index_file<'a>(
    paths: &ArtifactPaths,
    bytes: &'a [u8],
) -> Result<(IndexHeader, &'a [u8]), IndexError> {
    let Some(rest) = bytes.strip_prefix(INDEX_MAGIC.as_slice()) else {
        return Err(paths.corrupt("missing index magic"));
    };
    let Some((len_bytes, rest)) = rest.split_first_chunk::<4>() else {
        return Err(paths.corrupt("truncated index header"));
    };
    let header_len = u32::from_le_bytes(*len_bytes) as usize;
    if rest.len() < header_len {
        return Err(paths.corrupt("truncated index header"));
    }

    let (header_bytes, payload) = rest.split_at(header_len);
    let header = serde_json::from_slice::<IndexHeader>(header_bytes)
        .map_err(|error| paths.corrupt(format!("index header is unreadable: {error}")))?;
    Ok((header, payload))
}

fn read_or_not_built(paths: &ArtifactPaths, path: &Path) -> Result<Vec<u8>, IndexError> {
    fs::read(path).map_err(|error| match error.kind() {
        ErrorKind::NotFound => IndexError::NotBuilt {
            name: paths.name.clone(),
        },
        _ => IndexError::Io(error),
    })
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn tmp_path(path: &Path, build_id: Uuid) -> PathBuf {
    let mut name = path.file_name().map(|name| name.to_os_string()).unwrap_or_default();
    name.push(format!(".{}.tmp", build_id.simple()));
    path.with_file_name(name)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}
