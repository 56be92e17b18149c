use anyhow::Result;
use tracing_subscriber::EnvFilter;

use pagefinder::loader;
use pagefinder::{run_server, AppConfig};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env();
    config.validate()?;

    tokio::fs::create_dir_all(&config.upload_dir).await?;
    tokio::fs::create_dir_all(&config.data_dir).await?;

    let state = loader::initialize(&config).await;
    let health = state.health();
    tracing::info!(
        retrieval_model = health.retrieval_model,
        vector_store = health.vector_store,
        transcription_model = health.transcription_model,
        "startup complete"
    );

    run_server(&config, state).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
