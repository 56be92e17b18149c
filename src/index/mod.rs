pub mod pages;
pub mod placeholder;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::Engine;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;

use crate::chroma_store::{ChromaCollection, PageMetadata, VectorRecord};
use crate::colpali::ColPaliModel;
use crate::db::Database;
use crate::models::PageRecord;
use crate::scoring::mean_pool;

#[derive(Clone)]
pub struct Indexer {
    model: ColPaliModel,
    collection: ChromaCollection,
    db: Database,
    inference_limit: Arc<Semaphore>,
    batch_size: usize,
    render_dpi: u32,
}

#[derive(Debug, Clone, Default)]
pub struct IndexReport {
    pub documents: usize,
    pub pages: usize,
    pub failures: Vec<(PathBuf, String)>,
}

impl Indexer {
    pub fn new(
        model: ColPaliModel,
        collection: ChromaCollection,
        db: Database,
        inference_limit: Arc<Semaphore>,
        batch_size: usize,
        render_dpi: u32,
    ) -> Self {
        Self {
            model,
            collection,
            db,
            inference_limit,
            batch_size: batch_size.max(1),
            render_dpi,
        }
    }

    /// Indexes a file, or every visible file directly inside a directory.
    /// `overwrite` clears the index once before the first document. A
    /// document that fails is recorded in the report and the rest continue.
    pub async fn index_path(
        &self,
        path: &Path,
        index_name: &str,
        overwrite: bool,
    ) -> Result<IndexReport> {
        let documents = if path.is_dir() {
            pages::list_documents(path)?
        } else if path.is_file() {
            vec![path.to_path_buf()]
        } else {
            anyhow::bail!("document path not found: {}", path.display());
        };

        let mut report = IndexReport::default();
        if documents.is_empty() {
            tracing::warn!("no files found in directory {}", path.display());
            return Ok(report);
        }

        // Unsupported files are rejected up front so they never trigger a clear.
        let mut supported = Vec::with_capacity(documents.len());
        for document in documents {
            match pages::document_kind(&document) {
                Ok(_) => supported.push(document),
                Err(err) => {
                    tracing::error!("skipping {}: {:#}", document.display(), err);
                    report.failures.push((document, format!("{err:#}")));
                }
            }
        }
        if supported.is_empty() {
            tracing::warn!(
                "no supported documents under {}; index {} left unchanged",
                path.display(),
                index_name
            );
            return Ok(report);
        }

        if overwrite {
            self.clear(index_name).await?;
        }

        for document in supported {
            tracing::info!("indexing document {}", document.display());
            match self.index_document(&document, index_name, false).await {
                Ok(page_count) => {
                    tracing::info!(
                        "indexed {} ({} pages) into {}",
                        document.display(),
                        page_count,
                        index_name
                    );
                    report.documents += 1;
                    report.pages += page_count;
                }
                Err(err) => {
                    tracing::error!("error indexing {}: {:#}", document.display(), err);
                    report.failures.push((document, format!("{err:#}")));
                }
            }
        }

        self.db
            .record_index(index_name, self.model.name())
            .await
            .context("failed to record index summary")?;

        Ok(report)
    }

    /// Indexes one PDF or image file and returns its page count. With
    /// `overwrite` the index is emptied first.
    pub async fn index_document(
        &self,
        path: &Path,
        index_name: &str,
        overwrite: bool,
    ) -> Result<usize> {
        pages::document_kind(path)?;
        if overwrite {
            self.clear(index_name).await?;
        }
        self.add_document(path, index_name).await
    }

    /// Removes every page of `index_name` from the vector store and the page store.
    pub async fn clear(&self, index_name: &str) -> Result<()> {
        self.collection
            .delete_index(index_name)
            .await
            .with_context(|| format!("failed to clear vectors of index {index_name}"))?;
        self.db.clear_index(index_name).await?;
        Ok(())
    }

    pub async fn page_count(&self, index_name: &str) -> Result<i64> {
        self.db.page_count(index_name).await
    }

    async fn add_document(&self, path: &Path, index_name: &str) -> Result<usize> {
        let doc_id = file_sha256(path).await?[..16].to_string();
        let images = pages::render_pages(path, self.render_dpi).await?;

        let mut embeddings = Vec::with_capacity(images.len());
        for batch in images.chunks(self.batch_size) {
            let _permit = self.inference_limit.acquire().await?;
            let mut batch_embeddings = self
                .model
                .embed_images(batch)
                .await
                .with_context(|| format!("failed embedding pages of {}", path.display()))?;
            embeddings.append(&mut batch_embeddings);
        }

        let doc_path = path.display().to_string();
        let records = build_page_records(index_name, &doc_id, &doc_path, &images, embeddings);

        let vectors: Vec<VectorRecord> = records
            .iter()
            .map(|page| VectorRecord {
                id: page.id.clone(),
                embedding: mean_pool(&page.embedding),
                metadata: PageMetadata {
                    index_name: page.index_name.clone(),
                    doc_id: page.doc_id.clone(),
                    page_num: page.page_num,
                    doc_path: page.doc_path.clone(),
                },
            })
            .collect();

        for batch in vectors.chunks(64) {
            self.collection.upsert(batch).await?;
        }
        self.db.insert_pages(&records).await?;

        Ok(records.len())
    }
}

fn build_page_records(
    index_name: &str,
    doc_id: &str,
    doc_path: &str,
    images: &[Vec<u8>],
    embeddings: Vec<crate::colpali::MultiVector>,
) -> Vec<PageRecord> {
    images
        .iter()
        .zip(embeddings)
        .enumerate()
        .map(|(idx, (image, embedding))| {
            let page_num = (idx + 1) as i64;
            PageRecord {
                id: format!("{index_name}:{doc_id}:{page_num}"),
                index_name: index_name.to_string(),
                doc_id: doc_id.to_string(),
                doc_path: doc_path.to_string(),
                page_num,
                image_base64: base64::engine::general_purpose::STANDARD.encode(image),
                embedding,
            }
        })
        .collect()
}

async fn file_sha256(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed reading file for hash: {}", path.display()))?;

    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Ok(format!("{:x}", hasher.finalize()))
}
