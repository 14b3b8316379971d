use chrono::Utc;
use clap::{Parser, Subcommand};
use knowledge_search_core::{
    context_or_offline, EngineConfig, KnowledgeEngine, RetrievalError, UserProfile,
};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "knowledge-search", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML configuration file. `KB_*` environment variables override it.
    #[arg(long, env = "KB_CONFIG")]
    config: Option<PathBuf>,

    /// Corpus root holding documents and the structured record files.
    #[arg(long)]
    corpus_dir: Option<PathBuf>,

    /// Directory for the persisted index pair.
    #[arg(long)]
    index_dir: Option<PathBuf>,

    /// File stem of the persisted index pair.
    #[arg(long)]
    index_name: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Rebuild the index from the corpus and persist it.
    Build {
        /// Query to run against the fresh index as a smoke test.
        #[arg(long)]
        test_query: Option<String>,
        #[arg(long, default_value = "5")]
        k: usize,
    },
    /// Coarse vector search.
    Search {
        query: String,
        #[arg(long, default_value = "5")]
        k: usize,
        /// Print results as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Coarse search followed by reranking.
    Rerank {
        query: String,
        /// Coarse candidates fetched before reranking.
        #[arg(long, default_value = "10")]
        candidates: usize,
        #[arg(long, default_value = "3")]
        top_n: usize,
    },
    /// Assemble the context block a generation request would receive.
    Context {
        query: String,
        #[arg(long, default_value = "4")]
        k: usize,
        #[arg(long)]
        education: Option<String>,
        /// Declared interest domain. Repeatable.
        #[arg(long = "interest")]
        interests: Vec<String>,
        /// Fail on retrieval errors instead of printing the offline marker.
        #[arg(long, default_value_t = false)]
        strict: bool,
    },
    /// Show engine state and the persisted index, if any.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut config = EngineConfig::load(cli.config.as_deref())?;
    if let Some(corpus_dir) = cli.corpus_dir {
        config.corpus_dir = corpus_dir;
    }
    if let Some(index_dir) = cli.index_dir {
        config.index_dir = index_dir;
    }
    if let Some(index_name) = cli.index_name {
        config.index_name = index_name;
    }
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        index = %config.artifact_paths().index.display(),
        "knowledge-search boot"
    );
    let engine = KnowledgeEngine::from_config(config);

    match cli.command {
        Command::Build { test_query, k } => {
            let summary = engine.build_index().await?;
            println!("{}", summary.status_message());

            if let Some(query) = test_query {
                let hits = engine.search(&query, k).await?;
                println!("test query: {query}");
                for (rank, hit) in hits.iter().enumerate() {
                    println!(
                        "[{}] score={:.4} source={}",
                        rank + 1,
                        hit.score,
                        hit.metadata.source
                    );
                }
            }
        }
        Command::Search { query, k, json } => {
            load_or_warn(&engine).await;
            let hits = engine.search(&query, k).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else {
                println!("query: {query}");
                for (rank, hit) in hits.iter().enumerate() {
                    println!(
                        "[{}] score={:.4} distance={:.4} source={}",
                        rank + 1,
                        hit.score,
                        hit.distance,
                        hit.metadata.source
                    );
                    println!("  {}", snippet(&hit.content));
                }
            }
        }
        Command::Rerank {
            query,
            candidates,
            top_n,
        } => {
            load_or_warn(&engine).await;
            let coarse = engine.search(&query, candidates).await?;
            let ranked = engine.rerank(&query, coarse, top_n).await?;
            println!("query: {query}");
            for (rank, hit) in ranked.iter().enumerate() {
                println!(
                    "[{}] rerank={:.4} score={:.4} source={}",
                    rank + 1,
                    hit.rerank_score,
                    hit.score,
                    hit.metadata.source
                );
                println!("  {}", snippet(&hit.content));
            }
        }
        Command::Context {
            query,
            k,
            education,
            interests,
            strict,
        } => {
            load_or_warn(&engine).await;
            let profile = (education.is_some() || !interests.is_empty()).then(|| UserProfile {
                education,
                interest_domains: interests,
            });

            let context = if strict {
                engine.get_context_for_query(&query, profile.as_ref(), k).await?
            } else {
                context_or_offline(&engine, &query, profile.as_ref(), k).await
            };
            println!("{context}");
        }
        Command::Status => {
            load_or_warn(&engine).await;
            println!("{}", serde_json::to_string_pretty(&engine.status())?);
        }
    }

    Ok(())
}

async fn load_or_warn(engine: &KnowledgeEngine) {
    match engine.init().await {
        Ok(_) => {}
        Err(RetrievalError::Index(error)) => {
            warn!(%error, "no usable index, run `knowledge-search build` first");
        }
        Err(error) => warn!(%error, "index load failed"),
    }
}

fn snippet(content: &str) -> String {
    let flattened = content.split_whitespace().collect::<Vec<_>>().join(" ");
    match flattened.char_indices().nth(160) {
        Some((offset, _)) => format!("{}...", &flattened[..offset]),
        None => flattened,
    }
}
