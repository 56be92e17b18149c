use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};

use crate::config::AppConfig;
use crate::models::{IndexSummary, PageRecord};

/// SQLite page store: page images and their multi-vector embeddings, keyed
/// by the same ids the vector store uses.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(config: &AppConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let options = SqliteConnectOptions::from_str(&config.page_store_dsn())?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pages (
                id TEXT PRIMARY KEY,
                index_name TEXT NOT NULL,
                doc_id TEXT NOT NULL,
                doc_path TEXT NOT NULL,
                page_num INTEGER NOT NULL,
                image_base64 TEXT NOT NULL,
                embedding TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS pages_by_index ON pages (index_name);

            CREATE TABLE IF NOT EXISTS indexes (
                name TEXT PRIMARY KEY,
                model TEXT NOT NULL,
                page_count INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn clear_index(&self, index_name: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM pages WHERE index_name = ?")
            .bind(index_name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM indexes WHERE name = ?")
            .bind(index_name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn insert_pages(&self, pages: &[PageRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for page in pages {
            insert_page_tx(&mut tx, page).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_pages_by_ids(&self, ids: &[String]) -> Result<Vec<PageRecord>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, index_name, doc_id, doc_path, page_num, image_base64, embedding FROM pages WHERE id IN (",
        );
        let mut separated = qb.separated(",");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let rows: Vec<SqliteRow> = qb.build().fetch_all(&self.pool).await?;
        let mut pages = rows
            .into_iter()
            .map(row_to_page)
            .collect::<Result<Vec<_>>>()?;

        pages.sort_by_key(|page| {
            ids.iter()
                .position(|id| id == &page.id)
                .unwrap_or(usize::MAX)
        });

        Ok(pages)
    }

    pub async fn page_count(&self, index_name: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM pages WHERE index_name = ?")
            .bind(index_name)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }

    pub async fn record_index(&self, index_name: &str, model: &str) -> Result<IndexSummary> {
        let page_count = self.page_count(index_name).await?;
        let updated_at = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO indexes (name, model, page_count, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                model = excluded.model,
                page_count = excluded.page_count,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(index_name)
        .bind(model)
        .bind(page_count)
        .bind(updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(IndexSummary {
            name: index_name.to_string(),
            model: model.to_string(),
            page_count,
            updated_at,
        })
    }

    pub async fn get_index(&self, index_name: &str) -> Result<Option<IndexSummary>> {
        let row = sqlx::query(
            "SELECT name, model, page_count, updated_at FROM indexes WHERE name = ?",
        )
        .bind(index_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| IndexSummary {
            name: r.get("name"),
            model: r.get("model"),
            page_count: r.get("page_count"),
            updated_at: chrono::DateTime::parse_from_rfc3339(&r.get::<String, _>("updated_at"))
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        }))
    }
}

async fn insert_page_tx(tx: &mut Transaction<'_, Sqlite>, page: &PageRecord) -> Result<()> {
    let embedding = serde_json::to_string(&page.embedding)?;

    sqlx::query(
        r#"
        INSERT OR REPLACE INTO pages (id, index_name, doc_id, doc_path, page_num, image_base64, embedding)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&page.id)
    .bind(&page.index_name)
    .bind(&page.doc_id)
    .bind(&page.doc_path)
    .bind(page.page_num)
    .bind(&page.image_base64)
    .bind(embedding)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

fn row_to_page(row: SqliteRow) -> Result<PageRecord> {
    let id: String = row.get("id");
    let embedding = serde_json::from_str(&row.get::<String, _>("embedding"))
        .with_context(|| format!("corrupt embedding for page {id}"))?;

    Ok(PageRecord {
        id,
        index_name: row.get("index_name"),
        doc_id: row.get("doc_id"),
        doc_path: row.get("doc_path"),
        page_num: row.get("page_num"),
        image_base64: row.get("image_base64"),
        embedding,
    })
}
