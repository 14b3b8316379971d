use crate::error::{ModelError, RetrievalError};
use crate::models::UserProfile;
use async_trait::async_trait;

/// Maps text to fixed-dimension dense vectors. The same encoder must serve
/// chunks at build time and queries at search time.
pub trait Encoder: Send + Sync {
    fn model_name(&self) -> &str;

    fn dimensions(&self) -> usize;

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError>;

    fn embed(&self, text: &str) -> Result<Vec<f32>, ModelError> {
        let mut vectors = self.embed_batch(&[text.to_string()])?;
        if vectors.len() != 1 {
            return Err(ModelError::OutputMismatch {
                model: self.model_name().to_string(),
                expected: 1,
                actual: vectors.len(),
            });
        }
        Ok(vectors.remove(0))
    }
}

/// Scores (query, candidate) pairs directly. Higher is more relevant; the
/// scale is backend specific.
pub trait Reranker: Send + Sync {
    fn model_name(&self) -> &str;

    fn score_pairs(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>, ModelError>;
}

/// What downstream generation consumers depend on.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn context_for_query(
        &self,
        query: &str,
        profile: Option<&UserProfile>,
        k: usize,
    ) -> Result<String, RetrievalError>;
}
