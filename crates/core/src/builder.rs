use crate::artifact::{save_artifact, IndexSnapshot};
use crate::config::EngineConfig;
use crate::error::{ModelError, RetrievalError};
use crate::index::FlatIndex;
use crate::ingest::{chunk_documents, load_corpus};
use crate::store::DocumentStore;
use crate::traits::Encoder;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSummary {
    pub build_id: Uuid,
    pub files_read: usize,
    pub skipped_files: usize,
    pub documents: usize,
    pub chunks: usize,
    pub elapsed_ms: u128,
}

impl BuildSummary {
    pub fn status_message(&self) -> String {
        format!(
            "Index built successfully: {} chunks from {} documents ({} files read, {} skipped)",
            self.chunks, self.documents, self.files_read, self.skipped_files
        )
    }
}

/// Runs loader, chunker and encoder over the corpus and commits a fresh
/// artifact. Blocking; the engine calls it from a worker thread.
pub struct IndexBuilder<'a> {
    config: &'a EngineConfig,
    encoder: &'a dyn Encoder,
}

impl<'a> IndexBuilder<'a> {
    pub fn new(config: &'a EngineConfig, encoder: &'a dyn Encoder) -> Self {
        Self { config, encoder }
    }

    pub fn build(&self) -> Result<(IndexSnapshot, BuildSummary), RetrievalError> {
        let started = Instant::now();
        let build_id = Uuid::new_v4();
        info!(
            %build_id,
            corpus = %self.config.corpus_dir.display(),
            encoder = self.encoder.model_name(),
            "index build started"
        );

        let report = load_corpus(&self.config.corpus_dir)?;
        let chunks = chunk_documents(&report.documents, self.config.chunking)?;
        let vectors = self.embed_all(&chunks.iter().map(|chunk| chunk.content.clone()).collect::<Vec<_>>())?;

        let index = FlatIndex::from_vectors(self.encoder.dimensions(), &vectors)?;
        let documents = DocumentStore::new(chunks);
        let header = save_artifact(
            &self.config.artifact_paths(),
            build_id,
            self.encoder.model_name(),
            &index,
            &documents,
        )?;

        let summary = BuildSummary {
            build_id,
            files_read: report.files_read,
            skipped_files: report.skipped_files.len(),
            documents: report.documents.len(),
            chunks: documents.len(),
            elapsed_ms: started.elapsed().as_millis(),
        };
        info!(
            %build_id,
            chunks = summary.chunks,
            documents = summary.documents,
            skipped = summary.skipped_files,
            elapsed_ms = summary.elapsed_ms as u64,
            "index build finished"
        );

        Ok((
            IndexSnapshot {
                header,
                index,
                documents,
            },
            summary,
        ))
    }

    fn embed_all(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        let batch_size = self.config.retrieval.embed_batch_size.max(1);
        let mut vectors = Vec::with_capacity(texts.len());
        for (batch_number, batch) in texts.chunks(batch_size).enumerate() {
            let embedded = self.encoder.embed_batch(batch)?;
            if embedded.len() != batch.len() {
                return Err(ModelError::OutputMismatch {
                    model: self.encoder.model_name().to_string(),
                    expected: batch.len(),
                    actual: embedded.len(),
                });
            }
            vectors.extend(embedded);
            debug!(batch = batch_number, embedded = vectors.len(), total = texts.len(), "embedded batch");
        }
        Ok(vectors)
    }
}
