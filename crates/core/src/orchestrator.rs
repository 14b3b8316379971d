use crate::artifact::{load_artifact, IndexSnapshot};
use crate::builder::{BuildSummary, IndexBuilder};
use crate::config::EngineConfig;
use crate::context::{expand_query, format_context, NO_DOMAIN_DATA};
use crate::embeddings::encoder_from_config;
use crate::error::{IndexError, RetrievalError};
use crate::lazy::LazyModel;
use crate::models::{RankedResult, RetrievalResult, UserProfile};
use crate::rerank::{rerank_candidates, reranker_from_config};
use crate::traits::{ContextProvider, Encoder, Reranker};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Uninitialized,
    Ready,
    Building,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub chunks: usize,
    pub build_id: Option<Uuid>,
    pub built_at: Option<DateTime<Utc>>,
    pub encoder_model: String,
    pub reranker_model: String,
}

/// What the engine serves queries from.
enum Serving {
    /// Nothing loaded yet; the next query tries the persisted artifact.
    Unloaded,
    Ready(Arc<IndexSnapshot>),
    /// The persisted artifact was rejected. Queries report no data without
    /// touching disk until `init` or `build_index` runs again.
    Refused(String),
}

/// The retrieval service. Construct one per process and share it.
///
/// Queries read an immutable [`IndexSnapshot`] handle; a rebuild prepares a
/// new snapshot off to the side and swaps the handle in one step, so
/// in-flight queries finish against the snapshot they started with.
pub struct KnowledgeEngine {
    config: Arc<EngineConfig>,
    encoder: Arc<LazyModel<dyn Encoder>>,
    reranker: Arc<LazyModel<dyn Reranker>>,
    serving: RwLock<Serving>,
    build_lock: Mutex<()>,
    building: AtomicBool,
}

impl KnowledgeEngine {
    pub fn new(
        config: EngineConfig,
        encoder: LazyModel<dyn Encoder>,
        reranker: LazyModel<dyn Reranker>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            encoder: Arc::new(encoder),
            reranker: Arc::new(reranker),
            serving: RwLock::new(Serving::Unloaded),
            build_lock: Mutex::new(()),
            building: AtomicBool::new(false),
        }
    }

    /// Engine with the model backends selected in `config`. Nothing is
    /// loaded until [`KnowledgeEngine::init`] or the first query.
    pub fn from_config(config: EngineConfig) -> Self {
        let encoder = encoder_from_config(&config.models);
        let reranker = reranker_from_config(&config.models);
        Self::new(config, encoder, reranker)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Loads the persisted artifact and starts serving it. A missing or
    /// corrupt artifact is returned as an error and leaves the engine
    /// uninitialized; queries then report no domain data.
    pub async fn init(&self) -> Result<EngineState, RetrievalError> {
        let snapshot = match self.load_persisted().await {
            Ok(snapshot) => snapshot,
            Err(RetrievalError::Index(error @ IndexError::Corrupt { .. })) => {
                self.refuse(&error);
                return Err(error.into());
            }
            Err(other) => return Err(other),
        };
        info!(
            build_id = %snapshot.header.build_id,
            chunks = snapshot.len(),
            "knowledge index loaded"
        );
        self.install(snapshot);
        Ok(EngineState::Ready)
    }

    pub fn status(&self) -> EngineStatus {
        let snapshot = self.current();
        let state = if self.building.load(Ordering::SeqCst) {
            EngineState::Building
        } else if snapshot.is_some() {
            EngineState::Ready
        } else {
            EngineState::Uninitialized
        };

        EngineStatus {
            state,
            chunks: snapshot.as_ref().map_or(0, |snapshot| snapshot.len()),
            build_id: snapshot.as_ref().map(|snapshot| snapshot.header.build_id),
            built_at: snapshot.as_ref().map(|snapshot| snapshot.header.built_at),
            encoder_model: self.encoder.name().to_string(),
            reranker_model: self.reranker.name().to_string(),
        }
    }

    /// Coarse retrieval: the `k` chunks nearest to `query`, best first.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<RetrievalResult>, RetrievalError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let Some(snapshot) = self.serving_snapshot().await? else {
            return Ok(Vec::new());
        };
        if snapshot.is_empty() {
            return Ok(Vec::new());
        }

        let encoder = Arc::clone(&self.encoder);
        let query = query.to_string();
        let results = spawn_blocking(move || -> Result<_, RetrievalError> {
            let vector = encoder.get()?.embed(&query)?;
            Ok(snapshot.nearest(&vector, k)?)
        })
        .await??;

        debug!(k, returned = results.len(), "coarse search");
        Ok(results)
    }

    /// Precision pass over `candidates`, best first, at most `top_n`.
    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<RetrievalResult>,
        top_n: usize,
    ) -> Result<Vec<RankedResult>, RetrievalError> {
        if candidates.is_empty() || top_n == 0 {
            return Ok(Vec::new());
        }

        // Model initialization is outside the rerank timeout; its errors propagate.
        let reranker = Arc::clone(&self.reranker);
        let model = spawn_blocking(move || reranker.get()).await??;

        let retrieval = &self.config.retrieval;
        let query = query.to_string();
        let (max_chars, max_batch) = (retrieval.rerank_max_chars, retrieval.rerank_max_batch);
        let fallback = candidates.clone();

        let task = spawn_blocking(move || {
            rerank_candidates(model.as_ref(), &query, candidates, top_n, max_chars, max_batch)
        });

        match tokio::time::timeout(Duration::from_millis(retrieval.rerank_timeout_ms), task).await {
            Ok(joined) => Ok(joined??),
            Err(_) => {
                warn!(
                    timeout_ms = retrieval.rerank_timeout_ms,
                    candidates = fallback.len(),
                    "rerank timed out, keeping coarse order"
                );
                Ok(fallback
                    .into_iter()
                    .take(top_n)
                    .map(|candidate| {
                        let score = candidate.score;
                        RankedResult::from_coarse(candidate, score)
                    })
                    .collect())
            }
        }
    }

    /// Expands the query with the profile, retrieves a wide candidate pool,
    /// reranks it against the original query and formats the best `k`.
    pub async fn get_context_for_query(
        &self,
        query: &str,
        profile: Option<&UserProfile>,
        k: usize,
    ) -> Result<String, RetrievalError> {
        let pool = self.config.retrieval.candidate_count(k);
        let expanded = expand_query(query, profile);
        let candidates = self.search(&expanded, pool).await?;
        if candidates.is_empty() {
            return Ok(NO_DOMAIN_DATA.to_string());
        }

        let coarse = candidates.len();
        let mut ranked = self.rerank(query, candidates, coarse).await?;
        if let Some(floor) = self.config.retrieval.relevance_floor {
            ranked.retain(|result| result.rerank_score > floor);
        }
        ranked.truncate(k);

        debug!(pool, coarse, kept = ranked.len(), "context assembled");
        Ok(format_context(&ranked, self.config.retrieval.context_max_chars))
    }

    /// Rebuilds from the corpus and swaps the result in. Concurrent calls
    /// run one after another. On failure the serving snapshot is untouched.
    pub async fn build_index(&self) -> Result<BuildSummary, RetrievalError> {
        let _exclusive = self.build_lock.lock().await;
        let _flag = BuildingFlag::raise(&self.building);

        let config = Arc::clone(&self.config);
        let encoder = Arc::clone(&self.encoder);
        let (snapshot, summary) = spawn_blocking(move || {
            let model = encoder.get()?;
            IndexBuilder::new(&config, model.as_ref()).build()
        })
        .await??;

        self.install(snapshot);
        info!(build_id = %summary.build_id, chunks = summary.chunks, "serving rebuilt index");
        Ok(summary)
    }

    fn current(&self) -> Option<Arc<IndexSnapshot>> {
        match &*self.serving.read().unwrap_or_else(PoisonError::into_inner) {
            Serving::Ready(snapshot) => Some(Arc::clone(snapshot)),
            Serving::Unloaded | Serving::Refused(_) => None,
        }
    }

    fn install(&self, snapshot: IndexSnapshot) {
        *self.serving.write().unwrap_or_else(PoisonError::into_inner) =
            Serving::Ready(Arc::new(snapshot));
    }

    /// Remembers a rejected artifact unless a snapshot is already serving.
    fn refuse(&self, error: &IndexError) {
        let mut serving = self.serving.write().unwrap_or_else(PoisonError::into_inner);
        if !matches!(*serving, Serving::Ready(_)) {
            warn!(%error, "refusing to serve corrupt index");
            *serving = Serving::Refused(error.to_string());
        }
    }

    /// The snapshot to serve, loading the persisted one on first use.
    async fn serving_snapshot(&self) -> Result<Option<Arc<IndexSnapshot>>, RetrievalError> {
        {
            let serving = self.serving.read().unwrap_or_else(PoisonError::into_inner);
            match &*serving {
                Serving::Ready(snapshot) => return Ok(Some(Arc::clone(snapshot))),
                Serving::Refused(reason) => {
                    debug!(%reason, "index refused earlier, serving no data");
                    return Ok(None);
                }
                Serving::Unloaded => {}
            }
        }

        match self.load_persisted().await {
            Ok(snapshot) => {
                let mut serving = self.serving.write().unwrap_or_else(PoisonError::into_inner);
                // A build may have finished while we were reading from disk.
                if let Serving::Ready(current) = &*serving {
                    return Ok(Some(Arc::clone(current)));
                }
                let snapshot = Arc::new(snapshot);
                *serving = Serving::Ready(Arc::clone(&snapshot));
                Ok(Some(snapshot))
            }
            Err(RetrievalError::Index(IndexError::NotBuilt { name })) => {
                debug!(index = %name, "index not built yet");
                Ok(None)
            }
            Err(RetrievalError::Index(error @ IndexError::Corrupt { .. })) => {
                self.refuse(&error);
                Ok(None)
            }
            Err(other) => Err(other),
        }
    }

    async fn load_persisted(&self) -> Result<IndexSnapshot, RetrievalError> {
        let paths = self.config.artifact_paths();
        let expected_encoder = self.encoder.name().to_string();
        let snapshot = spawn_blocking(move || -> Result<_, IndexError> {
            let snapshot = load_artifact(&paths)?;
            if snapshot.header.encoder_model != expected_encoder {
                return Err(IndexError::Corrupt {
                    name: paths.name.clone(),
                    reason: format!(
                        "built with encoder {} but serving with {expected_encoder}",
                        snapshot.header.encoder_model
                    ),
                });
            }
            Ok(snapshot)
        })
        .await??;
        Ok(snapshot)
    }
}

#[async_trait]
impl ContextProvider for KnowledgeEngine {
    async fn context_for_query(
        &self,
        query: &str,
        profile: Option<&UserProfile>,
        k: usize,
    ) -> Result<String, RetrievalError> {
        self.get_context_for_query(query, profile, k).await
    }
}

struct BuildingFlag<'a>(&'a AtomicBool);

impl<'a> BuildingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for BuildingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use crate::rerank::LEXICAL_MODEL_NAME;
    use std::fs;
    use std::path::Path;
    use std::thread;
    use tempfile::tempdir;

    struct SlowReranker;

    impl Reranker for SlowReranker {
        fn model_name(&self) -> &str {
            "slow"
        }

        fn score_pairs(&self, _query: &str, candidates: &[String]) -> Result<Vec<f32>, ModelError> {
            thread::sleep(Duration::from_millis(300));
            Ok(vec![0.0; candidates.len()])
        }
    }

    fn engine_in(root: &Path) -> KnowledgeEngine {
        KnowledgeEngine::from_config(EngineConfig {
            corpus_dir: root.join("corpus"),
            index_dir: root.join("index"),
            ..EngineConfig::default()
        })
    }

    fn write_corpus(root: &Path) -> std::io::Result<()> {
        let corpus = root.join("corpus");
        fs::create_dir_all(&corpus)?;
        fs::write(
            corpus.join("careers.json"),
            r#"[{"title":"Data Analyst","skills":["SQL","Excel"]},{"title":"Electrician","skills":["wiring"]}]"#,
        )
    }

    #[tokio::test]
    async fn uninitialized_engine_serves_sentinel() {
        let dir = tempdir().expect("tempdir");
        let engine = engine_in(dir.path());

        assert_eq!(engine.status().state, EngineState::Uninitialized);
        assert!(matches!(
            engine.init().await,
            Err(RetrievalError::Index(IndexError::NotBuilt { .. }))
        ));
        assert!(engine.search("data analyst", 3).await.expect("search").is_empty());
        assert_eq!(
            engine.get_context_for_query("data analyst", None, 3).await.expect("context"),
            NO_DOMAIN_DATA
        );
    }

    #[tokio::test]
    async fn build_swaps_in_ready_snapshot() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        write_corpus(dir.path())?;
        let engine = engine_in(dir.path());

        let summary = engine.build_index().await?;
        let status = engine.status();
        assert_eq!(status.state, EngineState::Ready);
        assert_eq!(status.chunks, 2);
        assert_eq!(status.build_id, Some(summary.build_id));
        assert_eq!(status.reranker_model, LEXICAL_MODEL_NAME);

        let hits = engine.search("data analyst sql", 1).await?;
        assert_eq!(hits[0].metadata.get("title"), Some("Data Analyst"));
        Ok(())
    }

    #[tokio::test]
    async fn fresh_engine_loads_persisted_index_lazily() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        write_corpus(dir.path())?;
        engine_in(dir.path()).build_index().await?;

        let reader = engine_in(dir.path());
        assert_eq!(reader.status().state, EngineState::Uninitialized);
        assert_eq!(reader.search("electrician wiring", 2).await?.len(), 2);
        assert_eq!(reader.status().state, EngineState::Ready);
        Ok(())
    }

    #[tokio::test]
    async fn index_from_other_encoder_is_refused() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        write_corpus(dir.path())?;
        engine_in(dir.path()).build_index().await?;

        let mut config = engine_in(dir.path()).config().clone();
        config.models.ngram_dimensions = 64;
        let reader = KnowledgeEngine::from_config(config);
        assert!(matches!(
            reader.init().await,
            Err(RetrievalError::Index(IndexError::Corrupt { .. }))
        ));
        assert!(reader.search("electrician", 2).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn failed_rebuild_keeps_serving_previous_snapshot() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        write_corpus(dir.path())?;
        let engine = engine_in(dir.path());
        let first = engine.build_index().await?;

        fs::remove_dir_all(dir.path().join("corpus"))?;
        assert!(engine.build_index().await.is_err());

        let status = engine.status();
        assert_eq!(status.state, EngineState::Ready);
        assert_eq!(status.build_id, Some(first.build_id));
        Ok(())
    }

    #[tokio::test]
    async fn slow_rerank_falls_back_to_coarse_order() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        write_corpus(dir.path())?;
        let mut config = engine_in(dir.path()).config().clone();
        config.retrieval.rerank_timeout_ms = 20;
        let engine = KnowledgeEngine::new(
            config.clone(),
            encoder_from_config(&config.models),
            LazyModel::ready("slow", Arc::new(SlowReranker) as Arc<dyn Reranker>),
        );
        engine.build_index().await?;

        let coarse = engine.search("data analyst", 2).await?;
        let ranked = engine.rerank("data analyst", coarse.clone(), 2).await?;
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].content, coarse[0].content);
        assert_eq!(ranked[0].rerank_score, coarse[0].score);
        Ok(())
    }

    #[tokio::test]
    async fn reranker_failing_after_timeout_is_reported() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        write_corpus(dir.path())?;
        let mut config = engine_in(dir.path()).config().clone();
        config.retrieval.rerank_timeout_ms = 50;
        let reranker: LazyModel<dyn Reranker> = LazyModel::new("cross-encoder", || {
            thread::sleep(Duration::from_millis(300));
            Err(anyhow::anyhow!("download failed"))
        });
        let engine = KnowledgeEngine::new(config.clone(), encoder_from_config(&config.models), reranker);
        engine.build_index().await?;

        let coarse = engine.search("data analyst", 2).await?;
        let failure = engine
            .rerank("data analyst", coarse, 2)
            .await
            .expect_err("initialization failure must surface");
        assert!(failure.is_model_unavailable());

        let failure = engine
            .get_context_for_query("data analyst", None, 3)
            .await
            .expect_err("initialization failure must surface");
        assert!(matches!(
            failure,
            RetrievalError::Model(ModelError::Unavailable { ref model, .. }) if model == "cross-encoder"
        ));
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_index_is_refused_until_reinitialized() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        write_corpus(dir.path())?;
        engine_in(dir.path()).build_index().await?;

        let paths = engine_in(dir.path()).config().artifact_paths();
        let intact = fs::read(&paths.docs)?;
        fs::write(&paths.docs, b"[]")?;

        let engine = engine_in(dir.path());
        assert!(engine.search("electrician", 2).await?.is_empty());

        // Repaired on disk, but the refusal stands until the operator reloads.
        fs::write(&paths.docs, intact)?;
        assert!(engine.search("electrician", 2).await?.is_empty());
        assert_eq!(engine.status().state, EngineState::Uninitialized);

        assert_eq!(engine.init().await?, EngineState::Ready);
        assert_eq!(engine.search("electrician", 2).await?.len(), 2);
        Ok(())
    }
}
