use crate::config::{EncoderBackend, ModelConfig};
use crate::error::ModelError;
use crate::lazy::LazyModel;
use crate::traits::Encoder;
use std::sync::Arc;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 384;

pub const NGRAM_MODEL_NAME: &str = "hashed-ngram";

pub const MULTILINGUAL_MODEL_NAME: &str = "paraphrase-multilingual-MiniLM-L12-v2";

const WORD_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.5;

/// Deterministic encoder hashing words and character trigrams into a fixed
/// number of buckets. Needs no model files, so it is the offline default and
/// the encoder used throughout the tests.
#[derive(Debug, Clone)]
pub struct NgramEncoder {
    dimensions: usize,
    name: String,
}

impl Default for NgramEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIMENSIONS)
    }
}

impl NgramEncoder {
    pub fn new(dimensions: usize) -> Self {
        let dimensions = dimensions.max(1);
        Self {
            dimensions,
            name: ngram_model_name(dimensions),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions];
        let lowered = text.to_lowercase();

        for word in tokenize(&lowered) {
            vector[self.bucket(b"w", word)] += WORD_WEIGHT;

            let padded: Vec<char> = format!(" {word} ").chars().collect();
            for window in padded.windows(3) {
                let trigram = window.iter().collect::<String>();
                vector[self.bucket(b"t", &trigram)] += TRIGRAM_WEIGHT;
            }
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }

    fn bucket(&self, namespace: &[u8], token: &str) -> usize {
        let mut hash = 1469598103934665603u64;
        for byte in namespace.iter().chain(token.as_bytes()) {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(1099511628211);
        }
        (hash % self.dimensions as u64) as usize
    }
}

fn ngram_model_name(dimensions: usize) -> String {
    format!("{NGRAM_MODEL_NAME}-{dimensions}")
}

/// Splits on whitespace and ASCII punctuation only, so scripts with combining
/// vowel signs stay whole.
pub(crate) fn tokenize(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| c.is_whitespace() || c.is_ascii_punctuation())
        .filter(|token| !token.is_empty())
}

impl Encoder for NgramEncoder {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}

#[cfg(feature = "fastembed")]
pub use self::fastembed_backend::FastEmbedEncoder;

#[cfg(feature = "fastembed")]
mod fastembed_backend {
    use super::MULTILINGUAL_MODEL_NAME;
    use crate::error::ModelError;
    use crate::traits::Encoder;
    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
    use std::path::Path;
    use std::sync::{Mutex, PoisonError};

    /// Multilingual sentence embeddings through ONNX runtime.
    pub struct FastEmbedEncoder {
        model: Mutex<TextEmbedding>,
        dimensions: usize,
    }

    impl FastEmbedEncoder {
        pub fn try_new(cache_dir: Option<&Path>) -> anyhow::Result<Self> {
            let mut options = InitOptions::new(EmbeddingModel::ParaphraseMLMiniLML12V2)
                .with_show_download_progress(false);
            if let Some(dir) = cache_dir {
                options = options.with_cache_dir(dir.to_path_buf());
            }

            let mut model = TextEmbedding::try_new(options)?;
            let probe = model.embed(vec!["dimension probe"], None)?;
            let dimensions = probe
                .first()
                .map(Vec::len)
                .ok_or_else(|| anyhow::anyhow!("encoder returned no vector for probe text"))?;

            Ok(Self {
                model: Mutex::new(model),
                dimensions,
            })
        }
    }

    impl Encoder for FastEmbedEncoder {
        fn model_name(&self) -> &str {
            MULTILINGUAL_MODEL_NAME
        }

        fn dimensions(&self) -> usize {
            self.dimensions
        }

        fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
            let mut model = self.model.lock().unwrap_or_else(PoisonError::into_inner);
            let inputs = texts.iter().map(String::as_str).collect::<Vec<_>>();
            model
                .embed(inputs, None)
                .map_err(|error| ModelError::Inference {
                    model: MULTILINGUAL_MODEL_NAME.to_string(),
                    reason: error.to_string(),
                })
        }
    }
}

/// Builds the lazily initialized encoder selected by configuration. The lazy
/// handle carries the same name the model reports once loaded, so persisted
/// indexes can be checked against it without loading the model.
pub fn encoder_from_config(config: &ModelConfig) -> LazyModel<dyn Encoder> {
    match config.encoder {
        EncoderBackend::Ngram => {
            let dimensions = config.ngram_dimensions.max(1);
            LazyModel::new(ngram_model_name(dimensions), move || {
                Ok(Arc::new(NgramEncoder::new(dimensions)) as Arc<dyn Encoder>)
            })
        }
        EncoderBackend::Fastembed => fastembed_encoder(config),
    }
}

#[cfg(feature = "fastembed")]
fn fastembed_encoder(config: &ModelConfig) -> LazyModel<dyn Encoder> {
    let cache_dir = config.cache_dir.clone();
    LazyModel::new(MULTILINGUAL_MODEL_NAME, move || {
        let encoder = FastEmbedEncoder::try_new(cache_dir.as_deref())?;
        Ok(Arc::new(encoder) as Arc<dyn Encoder>)
    })
}

#[cfg(not(feature = "fastembed"))]
fn fastembed_encoder(_config: &ModelConfig) -> LazyModel<dyn Encoder> {
    LazyModel::new(MULTILINGUAL_MODEL_NAME, || {
        Err(anyhow::anyhow!(
            "this build does not include the `fastembed` feature"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn distance(left: &[f32], right: &[f32]) -> f32 {
        left.iter().zip(right).map(|(a, b)| (a - b) * (a - b)).sum()
    }

    #[test]
    fn encoder_is_deterministic() {
        let encoder = NgramEncoder::default();
        let first = encoder.embed("Hydraulic pressure and flow").expect("embed");
        let second = encoder.embed("Hydraulic pressure and flow").expect("embed");
        assert_eq!(first, second);
    }

    #[test]
    fn encoder_outputs_expected_length_and_unit_norm() {
        let encoder = NgramEncoder::new(32);
        let vector = encoder.embed("abc").expect("embed");
        assert_eq!(vector.len(), 32);
        let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn related_text_is_closer_than_unrelated_text() {
        let encoder = NgramEncoder::default();
        let document = encoder
            .embed("title: Java Developer\nrequirements: Java, Spring Boot, SQL")
            .expect("embed");
        let related = encoder.embed("java developer requirements").expect("embed");
        let unrelated = encoder.embed("organic farming techniques").expect("embed");

        assert!(distance(&document, &related) < distance(&document, &unrelated));
    }

    #[test]
    fn gujarati_words_are_not_split_on_vowel_signs() {
        let tokens = tokenize("ખેતી યોજના, scholarship").collect::<Vec<_>>();
        assert_eq!(tokens, vec!["ખેતી", "યોજના", "scholarship"]);
    }

    #[test]
    fn empty_text_embeds_to_zero_vector() {
        let encoder = NgramEncoder::new(8);
        assert_eq!(encoder.embed("").expect("embed"), vec![0.0; 8]);
    }

    #[test]
    fn lazy_encoder_from_default_config_initializes() {
        let lazy = encoder_from_config(&ModelConfig::default());
        let encoder = lazy.get().expect("ngram encoder never fails");
        assert_eq!(encoder.dimensions(), DEFAULT_EMBEDDING_DIMENSIONS);
        assert_eq!(encoder.model_name(), lazy.name());
    }

    #[cfg(not(feature = "fastembed"))]
    #[test]
    fn fastembed_without_feature_is_unavailable() {
        let config = ModelConfig {
            encoder: EncoderBackend::Fastembed,
            ..ModelConfig::default()
        };
        assert!(matches!(
            encoder_from_config(&config).get(),
            Err(ModelError::Unavailable { .. })
        ));
    }
}
