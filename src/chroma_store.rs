use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::colpali::normalize_err_body;

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub distance: f32,
    pub metadata: Option<PageMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageMetadata {
    pub index_name: String,
    pub doc_id: String,
    pub page_num: i64,
    pub doc_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VectorRecord {
    pub id: String,
    pub embedding: Vec<f32>,
    pub metadata: PageMetadata,
}

#[derive(Clone)]
pub struct ChromaStore {
    client: Client,
    base_url: String,
}

impl ChromaStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build chroma http client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub async fn get_or_create_collection(&self, name: &str) -> Result<ChromaCollection> {
        #[derive(Deserialize)]
        struct CollectionResp {
            id: String,
            name: String,
        }

        let url = format!("{}/api/v1/collections", self.base_url);
        let payload = json!({
            "name": name,
            "metadata": { "hnsw:space": "cosine" },
            "get_or_create": true,
        });

        let response = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .context("failed to contact chroma while opening collection")?;
        let response = ensure_success(response, "get_or_create collection").await?;
        let collection = response
            .json::<CollectionResp>()
            .await
            .context("failed to decode chroma collection response")?;

        Ok(ChromaCollection {
            store: self.clone(),
            id: collection.id,
            name: collection.name,
        })
    }
}

/// Handle to an opened Chroma collection.
#[derive(Clone)]
pub struct ChromaCollection {
    store: ChromaStore,
    id: String,
    name: String,
}

impl ChromaCollection {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn url(&self, op: &str) -> String {
        format!(
            "{}/api/v1/collections/{}/{}",
            self.store.base_url, self.id, op
        )
    }

    pub async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let body = json!({
            "ids": records.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            "embeddings": records.iter().map(|r| &r.embedding).collect::<Vec<_>>(),
            "metadatas": records.iter().map(|r| &r.metadata).collect::<Vec<_>>(),
        });

        let response = self
            .store
            .client
            .post(self.url("upsert"))
            .json(&body)
            .send()
            .await
            .context("failed to contact chroma during upsert")?;
        ensure_success(response, "upsert").await?;

        Ok(())
    }

    pub async fn delete_index(&self, index_name: &str) -> Result<()> {
        let body = json!({ "where": { "index_name": index_name } });

        let response = self
            .store
            .client
            .post(self.url("delete"))
            .json(&body)
            .send()
            .await
            .context("failed to contact chroma during delete")?;
        ensure_success(response, "delete").await?;

        Ok(())
    }

    pub async fn count(&self) -> Result<u64> {
        let response = self
            .store
            .client
            .get(self.url("count"))
            .send()
            .await
            .context("failed to contact chroma during count")?;
        let response = ensure_success(response, "count").await?;

        response
            .json::<u64>()
            .await
            .context("failed to decode chroma count response")
    }

    pub async fn query(
        &self,
        vector: &[f32],
        limit: usize,
        index_name: &str,
    ) -> Result<Vec<VectorHit>> {
        if vector.is_empty() || limit == 0 {
            return Ok(vec![]);
        }

        let body = json!({
            "query_embeddings": [vector],
            "n_results": limit,
            "where": { "index_name": index_name },
            "include": ["metadatas", "distances"],
        });

        let response = self
            .store
            .client
            .post(self.url("query"))
            .json(&body)
            .send()
            .await
            .context("failed to contact chroma during query")?;
        let response = ensure_success(response, "query").await?;
        let response = response
            .json::<ChromaQueryResponse>()
            .await
            .context("failed to decode chroma query response")?;

        Ok(response.into_hits())
    }
}

#[derive(Debug, Deserialize)]
struct ChromaQueryResponse {
    ids: Vec<Vec<String>>,
    #[serde(default)]
    distances: Option<Vec<Vec<f32>>>,
    #[serde(default)]
    metadatas: Option<Vec<Vec<Option<PageMetadata>>>>,
}

impl ChromaQueryResponse {
    fn into_hits(self) -> Vec<VectorHit> {
        let ids = self.ids.into_iter().next().unwrap_or_default();
        let distances = self
            .distances
            .and_then(|d| d.into_iter().next())
            .unwrap_or_default();
        let metadatas = self
            .metadatas
            .and_then(|m| m.into_iter().next())
            .unwrap_or_default();

        ids.into_iter()
            .enumerate()
            .map(|(idx, id)| VectorHit {
                id,
                distance: distances.get(idx).copied().unwrap_or(f32::MAX),
                metadata: metadatas.get(idx).cloned().flatten(),
            })
            .collect()
    }
}

async fn ensure_success(response: reqwest::Response, op: &str) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    anyhow::bail!("chroma {op} returned {status}: {}", normalize_err_body(&body))
}
