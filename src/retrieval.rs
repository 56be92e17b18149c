use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Map;
use tokio::sync::Semaphore;

use crate::chroma_store::ChromaCollection;
use crate::colpali::ColPaliModel;
use crate::config::RetrievalConfig;
use crate::db::Database;
use crate::index::Indexer;
use crate::models::SearchResult;
use crate::scoring::{mean_pool, rank_by_max_sim};
use crate::search::PageRetriever;

/// The loaded retrieval model together with the collection and page store
/// it searches.
#[derive(Clone)]
pub struct RagModel {
    model: ColPaliModel,
    collection: ChromaCollection,
    db: Database,
    inference_limit: Arc<Semaphore>,
    config: RetrievalConfig,
}

impl RagModel {
    pub fn new(
        model: ColPaliModel,
        collection: ChromaCollection,
        db: Database,
        inference_limit: Arc<Semaphore>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            model,
            collection,
            db,
            inference_limit,
            config,
        }
    }

    pub fn indexer(&self) -> Indexer {
        Indexer::new(
            self.model.clone(),
            self.collection.clone(),
            self.db.clone(),
            self.inference_limit.clone(),
            self.config.image_batch_size,
            self.config.render_dpi,
        )
    }

    pub fn index_name(&self) -> &str {
        &self.config.index_name
    }

    pub async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<SearchResult>> {
        if top_k == 0 {
            return Ok(vec![]);
        }

        let query_embedding = {
            let _permit = self.inference_limit.acquire().await?;
            self.model.embed_query(query).await?
        };

        let recall_k = top_k
            .saturating_mul(self.config.recall_multiplier)
            .max(self.config.recall_min);
        let hits = self
            .collection
            .query(&mean_pool(&query_embedding), recall_k, &self.config.index_name)
            .await?;

        if hits.is_empty() {
            return Ok(vec![]);
        }
        for hit in &hits {
            let source = hit
                .metadata
                .as_ref()
                .map(|meta| format!("{} page {}", meta.doc_path, meta.page_num))
                .unwrap_or_else(|| hit.id.clone());
            tracing::debug!(distance = hit.distance, "recall candidate {}", source);
        }

        let ids: Vec<String> = hits.into_iter().map(|hit| hit.id).collect();
        let pages = self.db.get_pages_by_ids(&ids).await?;
        if pages.is_empty() {
            tracing::warn!(
                "vector store returned {} candidates with no stored pages",
                ids.len()
            );
            return Ok(vec![]);
        }

        let pages = Arc::new(pages);
        let ranked = {
            let pages = pages.clone();
            tokio::task::spawn_blocking(move || {
                let refs: Vec<_> = pages.iter().map(|page| &page.embedding).collect();
                rank_by_max_sim(&query_embedding, &refs, top_k)
            })
            .await
            .context("scoring task panicked")?
        };

        Ok(ranked
            .into_iter()
            .map(|(idx, score)| {
                let page = &pages[idx];
                let mut metadata = Map::new();
                metadata.insert("doc_path".to_string(), page.doc_path.clone().into());
                metadata.insert("index_name".to_string(), page.index_name.clone().into());
                metadata.insert("doc_id".to_string(), page.doc_id.clone().into());
                metadata.insert("page_num".to_string(), page.page_num.into());

                SearchResult {
                    doc_id: page.doc_id.clone(),
                    page_num: page.page_num,
                    score,
                    base64: page.image_base64.clone(),
                    metadata,
                }
            })
            .collect())
    }
}

#[async_trait]
impl PageRetriever for RagModel {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchResult>> {
        self.retrieve(query, k).await
    }
}
