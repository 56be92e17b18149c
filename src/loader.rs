use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Semaphore;

use crate::chroma_store::ChromaStore;
use crate::colpali::ColPaliClient;
use crate::config::AppConfig;
use crate::db::Database;
use crate::index::placeholder::write_placeholder;
use crate::models::HealthResponse;
use crate::retrieval::RagModel;
use crate::search::{PageRetriever, SearchService};
use crate::server::AppState;
use crate::tts::TtsClient;
use crate::voice::recorder::Microphone;
use crate::voice::VoiceCapture;
use crate::whisper::{Transcriber, WhisperClient, WhisperModel};

/// Handles produced by `load_models`. A `None` handle failed to load and
/// its failure has already been logged.
#[derive(Default)]
pub struct LoadedModels {
    pub rag: Option<RagModel>,
    pub retrieval_model_loaded: bool,
    pub vector_store_loaded: bool,
    pub initial_document_indexed: bool,
}

pub async fn load_models(config: &AppConfig, inference_limit: Arc<Semaphore>) -> LoadedModels {
    let timeout = Duration::from_secs(config.backend_timeout_secs);
    let mut loaded = LoadedModels::default();

    let model = match ColPaliClient::new(config.retrieval.base_url.clone(), timeout) {
        Ok(client) => client
            .load(&config.retrieval.model, &config.retrieval.device)
            .await,
        Err(err) => Err(err),
    };
    let model = match model {
        Ok(model) => model,
        Err(err) => {
            tracing::error!(
                "failed to load retrieval model {}: {:#}",
                config.retrieval.model,
                err
            );
            return loaded;
        }
    };
    loaded.retrieval_model_loaded = true;
    tracing::info!(
        "retrieval model {} ready on {}",
        model.name(),
        model.device().as_str()
    );

    let collection = match ChromaStore::new(config.chroma.base_url.clone(), timeout) {
        Ok(store) => store.get_or_create_collection(&config.chroma.collection).await,
        Err(err) => Err(err),
    };
    let collection = match collection {
        Ok(collection) => collection,
        Err(err) => {
            tracing::error!(
                "failed to open vector store collection {}: {:#}",
                config.chroma.collection,
                err
            );
            return loaded;
        }
    };

    let db = match Database::new(config).await {
        Ok(db) => db,
        Err(err) => {
            tracing::error!("failed to open page store: {:#}", err);
            return loaded;
        }
    };
    loaded.vector_store_loaded = true;
    match collection.count().await {
        Ok(count) => tracing::info!(
            "vector store collection {} ready with {} page vectors",
            collection.name(),
            count
        ),
        Err(err) => tracing::warn!("failed to count collection vectors: {:#}", err),
    }

    let rag = RagModel::new(
        model,
        collection,
        db,
        inference_limit,
        config.retrieval.clone(),
    );
    loaded.initial_document_indexed = index_initial_document(&rag, config).await;
    loaded.rag = Some(rag);
    loaded
}

/// Indexes the configured initial document, overwriting the index. Returns
/// whether any page was indexed; every failure is logged, none is raised.
pub async fn index_initial_document(rag: &RagModel, config: &AppConfig) -> bool {
    let Some(path) = config.initial_document.as_ref() else {
        tracing::info!("no initial document configured; skipping indexing");
        return false;
    };

    tracing::info!("checking document path {}", path.display());
    match tokio::fs::metadata(path).await {
        Err(_) => {
            tracing::warn!(
                "document {} not found; skipping indexing",
                path.display()
            );
            return false;
        }
        Ok(meta) if meta.is_dir() => {
            tracing::error!(
                "{} is a directory; index directories with the `index` binary",
                path.display()
            );
            return false;
        }
        Ok(_) => {}
    }

    if let Err(err) = tokio::fs::File::open(path).await {
        tracing::warn!("document {} exists but is not readable: {}", path.display(), err);
    }

    match rag
        .indexer()
        .index_path(path, rag.index_name(), true)
        .await
    {
        Ok(report) => {
            for (document, message) in &report.failures {
                tracing::error!("error during indexing of {}: {}", document.display(), message);
            }
            if report.pages > 0 {
                tracing::info!(
                    "document indexed: {} pages into {}",
                    report.pages,
                    rag.index_name()
                );
            }
            report.pages > 0
        }
        Err(err) => {
            tracing::error!("error during indexing: {:#}", err);
            false
        }
    }
}

/// Writes and indexes a blank placeholder page when the index is empty, so
/// there is something to search during smoke tests.
pub async fn index_placeholder_if_empty(rag: &RagModel, config: &AppConfig) -> Result<bool> {
    let indexer = rag.indexer();
    if indexer.page_count(rag.index_name()).await? > 0 {
        return Ok(false);
    }

    let path = &config.placeholder_document;
    tracing::info!("index is empty; indexing placeholder document {}", path.display());
    write_placeholder(path).await?;

    let report = indexer.index_path(path, rag.index_name(), true).await?;
    if let Some((_, message)) = report.failures.first() {
        anyhow::bail!("placeholder indexing failed: {message}");
    }
    Ok(report.pages > 0)
}

pub async fn load_whisper_model(config: &AppConfig) -> Option<WhisperModel> {
    let timeout = Duration::from_secs(config.backend_timeout_secs);
    let client = match WhisperClient::new(
        config.whisper.base_url.clone(),
        timeout,
        config.whisper.insecure_tls,
    ) {
        Ok(client) => client,
        Err(err) => {
            tracing::error!("failed to build transcription client: {:#}", err);
            return None;
        }
    };

    match client
        .load_model(&config.whisper_model_path(), &config.whisper.model_size)
        .await
    {
        Ok(model) => {
            tracing::info!("whisper model '{}' loaded", model.size());
            Some(model)
        }
        Err(err) => {
            tracing::error!("failed to load whisper model: {:#}", err);
            None
        }
    }
}

/// Runs every startup step and assembles the request context. Never fails:
/// components that did not load are absent from the returned state.
pub async fn initialize(config: &AppConfig) -> AppState {
    let whisper = load_whisper_model(config).await;

    let inference_limit = Arc::new(Semaphore::new(config.retrieval.inference_concurrency));
    let loaded = load_models(config, inference_limit).await;

    if let Some(rag) = loaded.rag.as_ref() {
        if !loaded.initial_document_indexed && config.placeholder_fallback {
            match index_placeholder_if_empty(rag, config).await {
                Ok(true) => tracing::info!("placeholder document indexed"),
                Ok(false) => {}
                Err(err) => tracing::error!("failed to index placeholder document: {:#}", err),
            }
        }
    }

    let health = HealthResponse {
        retrieval_model: loaded.retrieval_model_loaded,
        vector_store: loaded.vector_store_loaded,
        transcription_model: whisper.is_some(),
    };

    let retriever = loaded
        .rag
        .map(|rag| Arc::new(rag) as Arc<dyn PageRetriever>);
    let search = SearchService::new(retriever, config.retrieval.top_k);
    if !search.is_ready() {
        tracing::warn!("search requests will fail until the retrieval model and vector store load");
    }

    let transcriber = whisper.map(|model| Arc::new(model) as Arc<dyn Transcriber>);
    let voice = VoiceCapture::new(Arc::new(Microphone), transcriber, &config.voice);
    if !voice.has_transcriber() {
        tracing::warn!("voice search will return no results without a transcription model");
    }

    let tts = match TtsClient::from_config(
        &config.tts,
        Duration::from_secs(config.backend_timeout_secs),
    ) {
        Ok(tts) => tts,
        Err(err) => {
            tracing::error!("failed to build text-to-speech client: {:#}", err);
            None
        }
    };

    AppState::new(search, Arc::new(voice), tts, health)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    #[tokio::test]
    async fn unreachable_backends_leave_handles_unset() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.retrieval.base_url = "http://127.0.0.1:9".to_string();
        config.whisper.base_url = "http://127.0.0.1:9".to_string();
        config.backend_timeout_secs = 2;

        let loaded = load_models(&config, Arc::new(Semaphore::new(1))).await;
        assert!(loaded.rag.is_none());
        assert!(!loaded.retrieval_model_loaded);

        assert!(load_whisper_model(&config).await.is_none());

        let state = initialize(&config).await;
        assert!(!state.health().retrieval_model);
        assert!(!state.health().transcription_model);
    }

    #[tokio::test]
    async fn missing_initial_document_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/load")
            .with_body(r#"{"model":"vidore/colpali","device":"cpu"}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/api/v1/collections")
            .with_body(r#"{"id":"c-1","name":"document_index"}"#)
            .create_async()
            .await;

        let mut config = test_config(dir.path());
        config.retrieval.base_url = server.url();
        config.chroma.base_url = server.url();
        config.initial_document = Some(dir.path().join("does-not-exist.pdf"));

        let loaded = load_models(&config, Arc::new(Semaphore::new(1))).await;
        assert!(loaded.rag.is_some());
        assert!(loaded.retrieval_model_loaded);
        assert!(loaded.vector_store_loaded);
        assert!(!loaded.initial_document_indexed);
    }

    #[tokio::test]
    async fn directory_as_initial_document_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/load")
            .with_body(r#"{"model":"vidore/colpali","device":"cpu"}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/api/v1/collections")
            .with_body(r#"{"id":"c-1","name":"document_index"}"#)
            .create_async()
            .await;

        let mut config = test_config(dir.path());
        config.retrieval.base_url = server.url();
        config.chroma.base_url = server.url();
        config.initial_document = Some(dir.path().to_path_buf());

        let loaded = load_models(&config, Arc::new(Semaphore::new(1))).await;
        assert!(loaded.rag.is_some());
        assert!(!loaded.initial_document_indexed);
    }

    #[tokio::test]
    async fn vector_store_failure_keeps_model_flag_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/load")
            .with_body(r#"{"model":"vidore/colpali","device":"cpu"}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/api/v1/collections")
            .with_status(503)
            .create_async()
            .await;

        let mut config = test_config(dir.path());
        config.retrieval.base_url = server.url();
        config.chroma.base_url = server.url();

        let loaded = load_models(&config, Arc::new(Semaphore::new(1))).await;
        assert!(loaded.retrieval_model_loaded);
        assert!(!loaded.vector_store_loaded);
        assert!(loaded.rag.is_none());
    }

    async fn mock_model_and_collection(server: &mut mockito::ServerGuard) {
        server
            .mock("POST", "/load")
            .with_body(r#"{"model":"vidore/colpali","device":"cpu"}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/api/v1/collections")
            .with_body(r#"{"id":"c-1","name":"document_index"}"#)
            .create_async()
            .await;
    }

    async fn mock_indexing(server: &mut mockito::ServerGuard) {
        server
            .mock("POST", "/api/v1/collections/c-1/delete")
            .with_body("[]")
            .create_async()
            .await;
        server
            .mock("POST", "/embed/images")
            .with_body(r#"{"embeddings":[[[0.5,0.5]]]}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/api/v1/collections/c-1/upsert")
            .with_body("true")
            .create_async()
            .await;
    }

    fn backed_config(server: &mockito::ServerGuard, dir: &std::path::Path) -> AppConfig {
        let mut config = test_config(dir);
        config.retrieval.base_url = server.url();
        config.chroma.base_url = server.url();
        config.whisper.base_url = "http://127.0.0.1:9".to_string();
        config
    }

    async fn rag_with_db(config: &AppConfig) -> (RagModel, Database) {
        let timeout = Duration::from_secs(5);
        let model = ColPaliClient::new(config.retrieval.base_url.clone(), timeout)
            .unwrap()
            .load("vidore/colpali", "cpu")
            .await
            .unwrap();
        let collection = ChromaStore::new(config.chroma.base_url.clone(), timeout)
            .unwrap()
            .get_or_create_collection("document_index")
            .await
            .unwrap();
        let db = Database::new(config).await.unwrap();
        let rag = RagModel::new(
            model,
            collection,
            db.clone(),
            Arc::new(Semaphore::new(1)),
            config.retrieval.clone(),
        );
        (rag, db)
    }

    #[tokio::test]
    async fn placeholder_is_skipped_when_index_has_pages() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = mockito::Server::new_async().await;
        mock_model_and_collection(&mut server).await;
        let config = backed_config(&server, dir.path());
        let (rag, db) = rag_with_db(&config).await;

        db.insert_pages(&[crate::models::PageRecord {
            id: "document_index:seed:1".to_string(),
            index_name: "document_index".to_string(),
            doc_id: "seed".to_string(),
            doc_path: "/docs/seed.pdf".to_string(),
            page_num: 1,
            image_base64: "AQI=".to_string(),
            embedding: vec![vec![1.0, 0.0]],
        }])
        .await
        .unwrap();

        assert!(!index_placeholder_if_empty(&rag, &config).await.unwrap());
        assert!(!config.placeholder_document.exists());
    }

    #[tokio::test]
    async fn placeholder_is_written_and_indexed_when_index_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = mockito::Server::new_async().await;
        mock_model_and_collection(&mut server).await;
        mock_indexing(&mut server).await;
        let config = backed_config(&server, dir.path());
        let (rag, _db) = rag_with_db(&config).await;

        let result = index_placeholder_if_empty(&rag, &config).await;

        let written = std::fs::read(&config.placeholder_document).unwrap();
        assert!(written.starts_with(b"%PDF"));

        if crate::index::pages::has_command("pdftoppm").await {
            assert!(result.unwrap());
            assert_eq!(
                rag.indexer().page_count("document_index").await.unwrap(),
                1
            );
        } else {
            // Rendering needs poppler; without it the failure is reported.
            assert!(result.is_err());
        }
    }

    #[tokio::test]
    async fn placeholder_fallback_respects_its_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = mockito::Server::new_async().await;
        mock_model_and_collection(&mut server).await;
        mock_indexing(&mut server).await;

        let mut config = backed_config(&server, dir.path());
        config.placeholder_fallback = false;
        let state = initialize(&config).await;
        assert!(state.health().retrieval_model);
        assert!(!config.placeholder_document.exists());

        config.placeholder_fallback = true;
        initialize(&config).await;
        assert!(config.placeholder_document.exists());
    }

    #[tokio::test]
    async fn indexed_initial_document_suppresses_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = mockito::Server::new_async().await;
        mock_model_and_collection(&mut server).await;
        mock_indexing(&mut server).await;

        let page = dir.path().join("page.png");
        std::fs::write(&page, [0x89, b'P', b'N', b'G', 7]).unwrap();

        let mut config = backed_config(&server, dir.path());
        config.initial_document = Some(page);

        let loaded = load_models(&config, Arc::new(Semaphore::new(1))).await;
        assert!(loaded.initial_document_indexed);

        let state = initialize(&config).await;
        assert!(state.health().vector_store);
        assert!(!state.health().transcription_model);
        assert!(!config.placeholder_document.exists());
    }
}
