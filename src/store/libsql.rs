//! LibSQL document store backend
//!
//! Stores every collection in a single `documents` table keyed by
//! (collection, id), with metadata as a JSON column. The bounded correlation
//! query pushes both the time-range and the path-intersection predicate into
//! SQL (JSON1 `json_each` over `involved_paths`) so latency stays independent
//! of total history size; similarity ranking runs only over the filtered set.

use crate::error::{AnamnesisError, Result};
use crate::store::{DocumentFilter, DocumentStore, StoredDocument};
use async_trait::async_trait;
use chrono::Utc;
use libsql::{params, Builder, Connection, Database};
use serde_json::{Map, Value};
use tracing::{debug, info};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS documents (
    collection TEXT NOT NULL,
    id         TEXT NOT NULL,
    content    TEXT NOT NULL,
    metadata   TEXT NOT NULL,
    ts         TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (collection, id)
);
CREATE INDEX IF NOT EXISTS idx_documents_collection_ts ON documents(collection, ts);
";

/// LibSQL-backed document store
///
/// Holds a single connection for its lifetime. An `:memory:` database is
/// private to its connection, so reconnecting per operation would discard
/// the schema and all data.
pub struct LibsqlDocumentStore {
    _db: Database,
    conn: Connection,
}

impl LibsqlDocumentStore {
    /// Open (or create) a local database file and bootstrap the schema
    pub async fn new_local(path: &str) -> Result<Self> {
        info!("Opening document store at {}", path);
        if path != ":memory:" {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
        let db = Builder::new_local(path).build().await?;
        let conn = db.connect()?;
        let store = Self { _db: db, conn };
        store.bootstrap().await?;
        Ok(store)
    }

    /// In-memory store for tests
    pub async fn new_in_memory() -> Result<Self> {
        let db = Builder::new_local(":memory:").build().await?;
        let conn = db.connect()?;
        let store = Self { _db: db, conn };
        store.bootstrap().await?;
        Ok(store)
    }

    async fn bootstrap(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA).await?;
        Ok(())
    }

    fn read_row(row: &libsql::Row) -> Result<StoredDocument> {
        let id: String = row.get(0)?;
        let content: String = row.get(1)?;
        let metadata_json: String = row.get(2)?;
        let metadata: Map<String, Value> = serde_json::from_str(&metadata_json)?;
        Ok(StoredDocument {
            id,
            content,
            metadata,
        })
    }
}

/// Crude lexical overlap used in place of vector similarity
///
/// Embedding-model selection and index tuning are out of scope; the ranking
/// contract only requires that it runs after the bounded filter.
fn similarity(query: &str, content: &str) -> f64 {
    let content_lower = content.to_lowercase();
    let terms: Vec<&str> = query.split_whitespace().collect();
    if terms.is_empty() {
        return 0.0;
    }
    let hits = terms
        .iter()
        .filter(|t| content_lower.contains(&t.to_lowercase()))
        .count();
    hits as f64 / terms.len() as f64
}

#[async_trait]
impl DocumentStore for LibsqlDocumentStore {
    async fn put(&self, collection: &str, document: &StoredDocument) -> Result<()> {
        let conn = &self.conn;
        let metadata_json = serde_json::to_string(&document.metadata)?;
        let ts = document
            .metadata
            .get("timestamp")
            .and_then(|v| v.as_str())
            .map(|s| libsql::Value::Text(s.to_string()))
            .unwrap_or(libsql::Value::Null);
        let now = Utc::now().to_rfc3339();

        // Upsert keeps put idempotent by (collection, id)
        conn.execute(
            "INSERT INTO documents (collection, id, content, metadata, ts, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT (collection, id) DO UPDATE SET
                 content = excluded.content,
                 metadata = excluded.metadata,
                 ts = excluded.ts,
                 updated_at = excluded.updated_at",
            params![
                collection,
                document.id.as_str(),
                document.content.as_str(),
                metadata_json,
                ts,
                now
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_by_ids(&self, collection: &str, ids: &[String]) -> Result<Vec<StoredDocument>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = &self.conn;
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT id, content, metadata FROM documents
             WHERE collection = ? AND id IN ({})",
            placeholders
        );

        let mut values: Vec<libsql::Value> = vec![libsql::Value::Text(collection.to_string())];
        values.extend(ids.iter().map(|id| libsql::Value::Text(id.clone())));

        let mut rows = conn.query(&sql, libsql::params_from_iter(values)).await?;
        let mut documents = Vec::new();
        while let Some(row) = rows.next().await? {
            documents.push(Self::read_row(&row)?);
        }
        Ok(documents)
    }

    async fn query(
        &self,
        collection: &str,
        filter: &DocumentFilter,
        similarity_query: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredDocument>> {
        let conn = &self.conn;

        let mut sql = String::from(
            "SELECT id, content, metadata FROM documents WHERE collection = ?",
        );
        let mut values: Vec<libsql::Value> = vec![libsql::Value::Text(collection.to_string())];

        if let Some((from, to)) = &filter.time_range {
            sql.push_str(" AND ts >= ? AND ts <= ?");
            values.push(libsql::Value::Text(from.to_rfc3339()));
            values.push(libsql::Value::Text(to.to_rfc3339()));
        }

        if let Some(paths) = &filter.any_path {
            if paths.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders = vec!["?"; paths.len()].join(", ");
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM json_each(documents.metadata, '$.involved_paths')
                              WHERE json_each.value IN ({}))",
                placeholders
            ));
            values.extend(paths.iter().map(|p| libsql::Value::Text(p.clone())));
        }

        for (key, value) in &filter.metadata_equals {
            sql.push_str(" AND json_extract(documents.metadata, ?) = ?");
            values.push(libsql::Value::Text(format!("$.{}", key)));
            match value {
                Value::String(s) => values.push(libsql::Value::Text(s.clone())),
                Value::Number(n) if n.is_i64() => {
                    values.push(libsql::Value::Integer(n.as_i64().unwrap_or(0)))
                }
                other => values.push(libsql::Value::Text(other.to_string())),
            }
        }

        sql.push_str(" ORDER BY ts DESC LIMIT ?");
        values.push(libsql::Value::Integer(limit as i64));

        debug!(collection, "Running bounded document query");
        let mut rows = conn.query(&sql, libsql::params_from_iter(values)).await?;
        let mut documents = Vec::new();
        while let Some(row) = rows.next().await? {
            documents.push(Self::read_row(&row)?);
        }

        // Similarity ranking only over the already-filtered set
        if let Some(query) = similarity_query {
            documents.sort_by(|a, b| {
                similarity(query, &b.content)
                    .partial_cmp(&similarity(query, &a.content))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        Ok(documents)
    }

    async fn update_metadata(
        &self,
        collection: &str,
        id: &str,
        patch: &Map<String, Value>,
    ) -> Result<()> {
        let conn = &self.conn;

        let mut rows = conn
            .query(
                "SELECT metadata FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Err(AnamnesisError::StoreWrite(format!(
                "update_metadata: document {}/{} not found",
                collection, id
            )));
        };

        let metadata_json: String = row.get(0)?;
        let mut metadata: Map<String, Value> = serde_json::from_str(&metadata_json)?;
        for (key, value) in patch {
            metadata.insert(key.clone(), value.clone());
        }

        let ts = metadata
            .get("timestamp")
            .and_then(|v| v.as_str())
            .map(|s| libsql::Value::Text(s.to_string()))
            .unwrap_or(libsql::Value::Null);

        conn.execute(
            "UPDATE documents SET metadata = ?3, ts = ?4, updated_at = ?5
             WHERE collection = ?1 AND id = ?2",
            params![
                collection,
                id,
                serde_json::to_string(&metadata)?,
                ts,
                Utc::now().to_rfc3339()
            ],
        )
        .await?;
        Ok(())
    }
}
