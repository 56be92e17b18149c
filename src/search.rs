use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::error::SearchError;
use crate::models::{SearchOutcome, SearchResult};

/// Anything that can turn a text query into ranked page images.
#[async_trait]
pub trait PageRetriever: Send + Sync {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchResult>>;
}

#[derive(Clone)]
pub struct SearchService {
    retriever: Option<Arc<dyn PageRetriever>>,
    default_k: usize,
}

impl SearchService {
    /// `retriever` is `None` when the retrieval model or its vector store
    /// failed to load; every search then reports `NotInitialized`.
    pub fn new(retriever: Option<Arc<dyn PageRetriever>>, default_k: usize) -> Self {
        Self {
            retriever,
            default_k,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.retriever.is_some()
    }

    pub fn default_k(&self) -> usize {
        self.default_k
    }

    pub async fn search(&self, query: &str, k: usize) -> Result<SearchOutcome, SearchError> {
        let Some(retriever) = self.retriever.as_ref() else {
            tracing::error!("search requested but the retrieval model is not loaded");
            return Err(SearchError::NotInitialized);
        };

        let query = query.trim();
        if query.is_empty() {
            return Err(SearchError::EmptyQuery);
        }

        let results = retriever
            .search(query, k)
            .await
            .map_err(SearchError::Internal)?;

        if results.is_empty() {
            tracing::info!("no results found for {:?}", query);
            return Ok(SearchOutcome::default());
        }

        for (rank, result) in results.iter().enumerate() {
            tracing::info!(
                rank = rank + 1,
                score = result.score,
                metadata = %serde_json::Value::Object(result.metadata.clone()),
                "result base64 {}...",
                preview(&result.base64, 100)
            );
        }

        let outcome = SearchOutcome::from_results(results);
        tracing::info!(
            "found {} results for {:?}; scores {:?}",
            outcome.images.len(),
            query,
            outcome.scores
        );

        Ok(outcome)
    }
}

fn preview(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
