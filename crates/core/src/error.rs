use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("word document parse error: {0}")]
    WordParse(String),

    #[error("table parse error: {0}")]
    TableParse(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid chunk metadata: {0}")]
    InvalidMetadata(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model {model} is unavailable: {reason}")]
    Unavailable { model: String, reason: String },

    #[error("model {model} failed during inference: {reason}")]
    Inference { model: String, reason: String },

    #[error("model {model} returned {actual} outputs for {expected} inputs")]
    OutputMismatch {
        model: String,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index {name} is not built")]
    NotBuilt { name: String },

    #[error("index {name} is corrupt: {reason}")]
    Corrupt { name: String, reason: String },

    #[error("vector dimension {actual} does not match index dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config error: {0}")]
    Figment(#[from] figment::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error("blocking worker failed: {0}")]
    Worker(String),
}

impl RetrievalError {
    pub fn is_model_unavailable(&self) -> bool {
        matches!(self, RetrievalError::Model(ModelError::Unavailable { .. }))
    }
}

impl From<tokio::task::JoinError> for RetrievalError {
    fn from(value: tokio::task::JoinError) -> Self {
        RetrievalError::Worker(value.to_string())
    }
}
