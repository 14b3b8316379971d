pub mod artifact;
pub mod builder;
pub mod chunking;
pub mod config;
pub mod context;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod index;
pub mod ingest;
pub mod lazy;
pub mod models;
pub mod orchestrator;
pub mod rerank;
pub mod store;
pub mod traits;

pub use artifact::{load_artifact, save_artifact, ArtifactPaths, IndexHeader, IndexSnapshot};
pub use builder::{BuildSummary, IndexBuilder};
pub use chunking::{build_chunks, normalize_text, split_text, ChunkingConfig};
pub use config::{EncoderBackend, EngineConfig, ModelConfig, RerankerBackend, RetrievalConfig};
pub use context::{context_or_offline, expand_query, format_context, KNOWLEDGE_BASE_OFFLINE, NO_DOMAIN_DATA};
pub use embeddings::{encoder_from_config, NgramEncoder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{ConfigError, IndexError, IngestError, ModelError, RetrievalError};
pub use extractor::{extractor_for, Extractor};
pub use index::{FlatIndex, Neighbor};
pub use ingest::{chunk_documents, discover_documents, load_corpus, IngestionReport, SkippedFile};
pub use lazy::LazyModel;
pub use models::{Chunk, ChunkMetadata, DocType, KnowledgeDocument, RankedResult, RetrievalResult, UserProfile};
pub use orchestrator::{EngineState, EngineStatus, KnowledgeEngine};
pub use rerank::{logit_to_relevance, rerank_candidates, reranker_from_config, LexicalReranker};
pub use store::DocumentStore;
pub use traits::{ContextProvider, Encoder, Reranker};

#[cfg(feature = "fastembed")]
pub use embeddings::FastEmbedEncoder;
#[cfg(feature = "fastembed")]
pub use rerank::FastEmbedReranker;
