use crate::config::{ModelConfig, RerankerBackend};
use crate::embeddings::tokenize;
use crate::error::ModelError;
use crate::lazy::LazyModel;
use crate::models::{RankedResult, RetrievalResult};
use crate::traits::Reranker;
use std::collections::HashSet;
use std::sync::Arc;

pub const LEXICAL_MODEL_NAME: &str = "lexical-overlap";

pub const CROSS_ENCODER_MODEL_NAME: &str = "bge-reranker-v2-m3";

const STOPWORDS: [&str; 24] = [
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "how", "i", "in", "is", "it", "me",
    "my", "of", "on", "or", "the", "to", "what", "with",
];

/// Pairwise scorer based on query-term coverage, refined by character
/// trigram containment. Scores lie in `[0, 1]` and are zero when the
/// candidate shares no query term.
#[derive(Debug, Default, Clone)]
pub struct LexicalReranker;

impl LexicalReranker {
    fn score(&self, terms: &[String], query_trigrams: &HashSet<String>, candidate: &str) -> f32 {
        if terms.is_empty() {
            return 0.0;
        }

        let lowered = candidate.to_lowercase();
        let words = tokenize(&lowered).collect::<HashSet<_>>();
        let matched = terms
            .iter()
            .filter(|term| {
                words.contains(term.as_str())
                    || (term.chars().count() >= 4 && words.iter().any(|word| word.starts_with(term.as_str())))
            })
            .count();
        if matched == 0 {
            return 0.0;
        }

        let coverage = matched as f32 / terms.len() as f32;
        let candidate_trigrams = trigrams(words.iter().copied());
        let containment = if query_trigrams.is_empty() {
            0.0
        } else {
            query_trigrams.intersection(&candidate_trigrams).count() as f32 / query_trigrams.len() as f32
        };

        0.8 * coverage + 0.2 * containment
    }
}

fn query_terms(query: &str) -> Vec<String> {
    let lowered = query.to_lowercase();
    let mut seen = HashSet::new();
    tokenize(&lowered)
        .filter(|token| !STOPWORDS.contains(token))
        .filter(|token| seen.insert(token.to_string()))
        .map(str::to_string)
        .collect()
}

fn trigrams<'a>(words: impl Iterator<Item = &'a str>) -> HashSet<String> {
    let mut grams = HashSet::new();
    for word in words {
        let padded: Vec<char> = format!(" {word} ").chars().collect();
        for window in padded.windows(3) {
            grams.insert(window.iter().collect::<String>());
        }
    }
    grams
}

impl Reranker for LexicalReranker {
    fn model_name(&self) -> &str {
        LEXICAL_MODEL_NAME
    }

    fn score_pairs(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>, ModelError> {
        let terms = query_terms(query);
        let query_trigrams = trigrams(terms.iter().map(String::as_str));
        Ok(candidates
            .iter()
            .map(|candidate| self.score(&terms, &query_trigrams, candidate))
            .collect())
    }
}

/// Maps a cross-encoder logit into `(0, 1)` so it shares a scale with
/// [`LexicalReranker`] scores and the configured relevance floor.
pub fn logit_to_relevance(logit: f32) -> f32 {
    1.0 / (1.0 + (-logit).exp())
}

#[cfg(feature = "fastembed")]
pub use self::fastembed_backend::FastEmbedReranker;

#[cfg(feature = "fastembed")]
mod fastembed_backend {
    use super::{logit_to_relevance, CROSS_ENCODER_MODEL_NAME};
    use crate::error::ModelError;
    use crate::traits::Reranker;
    use fastembed::{RerankInitOptions, RerankerModel, TextRerank};
    use std::path::Path;
    use std::sync::{Mutex, PoisonError};

    /// Multilingual cross-encoder through ONNX runtime. Scores are logits
    /// squashed into `(0, 1)`; a candidate the model did not return scores 0.
    pub struct FastEmbedReranker {
        model: Mutex<TextRerank>,
    }

    impl FastEmbedReranker {
        pub fn try_new(cache_dir: Option<&Path>) -> anyhow::Result<Self> {
            let mut options =
                RerankInitOptions::new(RerankerModel::BGERerankerV2M3).with_show_download_progress(false);
            if let Some(dir) = cache_dir {
                options = options.with_cache_dir(dir.to_path_buf());
            }

            Ok(Self {
                model: Mutex::new(TextRerank::try_new(options)?),
            })
        }
    }

    impl Reranker for FastEmbedReranker {
        fn model_name(&self) -> &str {
            CROSS_ENCODER_MODEL_NAME
        }

        fn score_pairs(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>, ModelError> {
            if candidates.is_empty() {
                return Ok(Vec::new());
            }

            let mut model = self.model.lock().unwrap_or_else(PoisonError::into_inner);
            let documents = candidates.iter().map(String::as_str).collect::<Vec<_>>();
            let results = model
                .rerank(query, documents, false, None)
                .map_err(|error| ModelError::Inference {
                    model: CROSS_ENCODER_MODEL_NAME.to_string(),
                    reason: error.to_string(),
                })?;

            let mut scores = vec![0.0; candidates.len()];
            for result in results {
                if let Some(slot) = scores.get_mut(result.index) {
                    *slot = logit_to_relevance(result.score);
                }
            }
            Ok(scores)
        }
    }
}

pub fn reranker_from_config(config: &ModelConfig) -> LazyModel<dyn Reranker> {
    match config.reranker {
        RerankerBackend::Lexical => LazyModel::new(LEXICAL_MODEL_NAME, || {
            Ok(Arc::new(LexicalReranker) as Arc<dyn Reranker>)
        }),
        RerankerBackend::Fastembed => fastembed_reranker(config),
    }
}

#[cfg(feature = "fastembed")]
fn fastembed_reranker(config: &ModelConfig) -> LazyModel<dyn Reranker> {
    let cache_dir = config.cache_dir.clone();
    LazyModel::new(CROSS_ENCODER_MODEL_NAME, move || {
        let reranker = FastEmbedReranker::try_new(cache_dir.as_deref())?;
        Ok(Arc::new(reranker) as Arc<dyn Reranker>)
    })
}

#[cfg(not(feature = "fastembed"))]
fn fastembed_reranker(_config: &ModelConfig) -> LazyModel<dyn Reranker> {
    LazyModel::new(CROSS_ENCODER_MODEL_NAME, || {
        Err(anyhow::anyhow!(
            "this build does not include the `fastembed` feature"
        ))
    })
}

/// Returns at most `max_chars` characters from the start of `text`.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((offset, _)) => &text[..offset],
        None => text,
    }
}

/// Scores every candidate against `query` and returns them best first,
/// truncated to `top_n`. Candidates are cut to `max_chars` before scoring and
/// only the first `max_batch` candidates are considered.
pub fn rerank_candidates(
    reranker: &dyn Reranker,
    query: &str,
    mut candidates: Vec<RetrievalResult>,
    top_n: usize,
    max_chars: usize,
    max_batch: usize,
) -> Result<Vec<RankedResult>, ModelError> {
    candidates.truncate(max_batch);
    if candidates.is_empty() || top_n == 0 {
        return Ok(Vec::new());
    }

    let texts = candidates
        .iter()
        .map(|candidate| truncate_chars(&candidate.content, max_chars).to_string())
        .collect::<Vec<_>>();
    let scores = reranker.score_pairs(query, &texts)?;
    if scores.len() != candidates.len() {
        return Err(ModelError::OutputMismatch {
            model: reranker.model_name().to_string(),
            expected: candidates.len(),
            actual: scores.len(),
        });
    }

    let mut ranked = candidates
        .into_iter()
        .zip(scores)
        .map(|(candidate, score)| RankedResult::from_coarse(candidate, score))
        .collect::<Vec<_>>();
    // Stable, so equal rerank scores keep their coarse order.
    ranked.sort_by(|left, right| right.rerank_score.total_cmp(&left.rerank_score));
    ranked.truncate(top_n);
    Ok(ranked)
}
