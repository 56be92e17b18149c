use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::Semaphore;
use tracing_subscriber::EnvFilter;

use pagefinder::chroma_store::ChromaStore;
use pagefinder::colpali::ColPaliClient;
use pagefinder::config::AppConfig;
use pagefinder::db::Database;
use pagefinder::index::Indexer;

#[derive(Parser, Debug)]
#[command(name = "index")]
#[command(about = "Index a PDF, an image, or a directory of them for page search")]
struct Cli {
    #[arg(long)]
    path: PathBuf,
    #[arg(long)]
    index_name: Option<String>,
    /// Add to the existing index instead of replacing it.
    #[arg(long, default_value_t = false)]
    append: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let config = AppConfig::from_env();
    config.validate()?;
    tokio::fs::create_dir_all(&config.data_dir).await?;

    let timeout = Duration::from_secs(config.backend_timeout_secs);
    let model = ColPaliClient::new(config.retrieval.base_url.clone(), timeout)?
        .load(&config.retrieval.model, &config.retrieval.device)
        .await
        .context("retrieval model not loaded")?;
    let collection = ChromaStore::new(config.chroma.base_url.clone(), timeout)?
        .get_or_create_collection(&config.chroma.collection)
        .await?;
    let db = Database::new(&config).await?;

    let indexer = Indexer::new(
        model,
        collection,
        db.clone(),
        Arc::new(Semaphore::new(config.retrieval.inference_concurrency)),
        config.retrieval.image_batch_size,
        config.retrieval.render_dpi,
    );

    let index_name = cli
        .index_name
        .unwrap_or_else(|| config.retrieval.index_name.clone());
    let report = indexer
        .index_path(&cli.path, &index_name, !cli.append)
        .await?;

    for (document, message) in &report.failures {
        println!("FAILED {}: {}", document.display(), message);
    }
    println!(
        "Index complete. index={} documents={} pages={} failed={}",
        index_name,
        report.documents,
        report.pages,
        report.failures.len()
    );

    if let Some(summary) = db.get_index(&index_name).await? {
        println!(
            "Index {} now holds {} pages embedded with {} (updated {}).",
            summary.name, summary.page_count, summary.model, summary.updated_at
        );
    }

    if report.documents == 0 && !report.failures.is_empty() {
        anyhow::bail!("no document could be indexed");
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
