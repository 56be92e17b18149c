use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::colpali::MultiVector;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub doc_id: String,
    pub page_num: i64,
    pub score: f32,
    pub base64: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Parallel, rank-ordered images and scores from one search call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchOutcome {
    pub images: Vec<String>,
    pub scores: Vec<f32>,
}

impl SearchOutcome {
    pub fn from_results(results: Vec<SearchResult>) -> Self {
        let mut outcome = Self::default();
        for result in results {
            outcome.images.push(result.base64);
            outcome.scores.push(result.score);
        }
        outcome
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// One indexed page as stored in the page store.
#[derive(Debug, Clone)]
pub struct PageRecord {
    pub id: String,
    pub index_name: String,
    pub doc_id: String,
    pub doc_path: String,
    pub page_num: i64,
    pub image_base64: String,
    pub embedding: MultiVector,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSummary {
    pub name: String,
    pub model: String,
    pub page_count: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub text_query: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    pub image_base64_list: Vec<String>,
}

impl From<SearchOutcome> for SearchResponse {
    fn from(value: SearchOutcome) -> Self {
        Self {
            image_base64_list: value.images,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechRequest {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub retrieval_model: bool,
    pub vector_store: bool,
    pub transcription_model: bool,
}
