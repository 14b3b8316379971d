use crate::error::IngestError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of source a document was read from.
///
/// The first four are free-text formats that go through the chunker; the
/// structured kinds come from the fixed record files at the corpus root and
/// are kept whole, one chunk per record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DocType {
    Pdf,
    Text,
    Word,
    Table,
    Career,
    Roadmap,
    Skill,
    Scheme,
}

impl DocType {
    pub fn is_structured(self) -> bool {
        matches!(
            self,
            DocType::Career | DocType::Roadmap | DocType::Skill | DocType::Scheme
        )
    }
}

/// Normalized output of the loader, alive only during ingestion.
#[derive(Debug, Clone)]
pub struct KnowledgeDocument {
    pub source_id: String,
    pub raw_text: String,
    pub doc_type: DocType,
    pub extra: BTreeMap<String, String>,
}

impl KnowledgeDocument {
    pub fn new(source_id: impl Into<String>, raw_text: impl Into<String>, doc_type: DocType) -> Self {
        Self {
            source_id: source_id.into(),
            raw_text: raw_text.into(),
            doc_type,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.extra.insert(key.into(), value.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    pub source: String,
    pub position: usize,
    pub doc_type: DocType,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl ChunkMetadata {
    pub fn new(
        source: impl Into<String>,
        position: usize,
        doc_type: DocType,
        extra: BTreeMap<String, String>,
    ) -> Result<Self, IngestError> {
        let source = source.into();
        if source.trim().is_empty() {
            return Err(IngestError::InvalidMetadata(
                "chunk source must not be empty".to_string(),
            ));
        }
        if let Some(reserved) = extra
            .keys()
            .find(|key| matches!(key.as_str(), "source" | "position" | "doc_type"))
        {
            return Err(IngestError::InvalidMetadata(format!(
                "extension key `{reserved}` shadows a required field"
            )));
        }

        Ok(Self {
            source,
            position,
            doc_type,
            extra,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        match key {
            "source" => Some(self.source.as_str()),
            _ => self.extra.get(key).map(String::as_str),
        }
    }
}

/// Minimal retrievable unit. Position `i` in the document store pairs with
/// vector `i` in the index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub content: String,
    pub metadata: ChunkMetadata,
}

/// Coarse-stage hit. `distance` is the squared Euclidean distance reported by
/// the index; `score` maps it into (0, 1] where higher is better.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalResult {
    pub content: String,
    pub metadata: ChunkMetadata,
    pub distance: f32,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedResult {
    pub content: String,
    pub metadata: ChunkMetadata,
    pub score: f32,
    pub rerank_score: f32,
}

impl RankedResult {
    pub fn from_coarse(result: RetrievalResult, rerank_score: f32) -> Self {
        Self {
            content: result.content,
            metadata: result.metadata,
            score: result.score,
            rerank_score,
        }
    }
}

/// Lightweight user signals used to bias coarse retrieval.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    #[serde(default)]
    pub education: Option<String>,
    #[serde(default)]
    pub interest_domains: Vec<String>,
}

pub fn distance_to_score(distance: f32) -> f32 {
    1.0 / (1.0 + distance.max(0.0))
}
