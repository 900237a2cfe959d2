//! Metadata store: datasets, collections, data rows, and conversation turns.
//!
//! Backed by an embedded SQLite database. The vector store owns the
//! embeddings; rows here reference them by id only, and consistency between
//! the two is maintained by ingestion ordering rather than foreign keys.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::Path;

use crate::error::{RagError, Result};
use crate::types::{ChunkRef, Collection, ConversationTurn, Data, Dataset};

pub struct MetadataStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS datasets (
    id               TEXT PRIMARY KEY,
    name             TEXT NOT NULL UNIQUE,
    description      TEXT NOT NULL,
    collection_count INTEGER NOT NULL DEFAULT 0,
    data_count       INTEGER NOT NULL DEFAULT 0,
    total_tokens     INTEGER NOT NULL DEFAULT 0,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS collections (
    id           TEXT PRIMARY KEY,
    dataset_id   TEXT NOT NULL,
    name         TEXT NOT NULL,
    description  TEXT NOT NULL,
    source_file  TEXT,
    file_type    TEXT,
    data_count   INTEGER NOT NULL DEFAULT 0,
    total_tokens INTEGER NOT NULL DEFAULT 0,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_collections_dataset ON collections(dataset_id);

CREATE TABLE IF NOT EXISTS data (
    id            TEXT PRIMARY KEY,
    collection_id TEXT NOT NULL,
    content       TEXT NOT NULL,
    title         TEXT,
    vector_ids    TEXT NOT NULL,
    metadata      TEXT NOT NULL,
    sequence      INTEGER,
    tokens        INTEGER NOT NULL DEFAULT 0,
    processed     INTEGER NOT NULL DEFAULT 0,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_data_collection ON data(collection_id);
CREATE INDEX IF NOT EXISTS idx_data_processed ON data(processed);

CREATE TABLE IF NOT EXISTS conversations (
    id               TEXT PRIMARY KEY,
    session_id       TEXT NOT NULL,
    question         TEXT NOT NULL,
    answer           TEXT NOT NULL,
    retrieved_chunks TEXT NOT NULL,
    timestamp        TEXT NOT NULL,
    tokens_used      INTEGER NOT NULL DEFAULT 0,
    relevance_score  REAL NOT NULL DEFAULT 0,
    response_time    REAL NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_conversations_session ON conversations(session_id, timestamp);
";

fn map_insert_err(err: rusqlite::Error, id: &str) -> RagError {
    if let rusqlite::Error::SqliteFailure(code, _) = &err {
        if code.code == rusqlite::ErrorCode::ConstraintViolation {
            return RagError::DuplicateId(id.to_string());
        }
    }
    RagError::Metadata(err)
}

fn dataset_from_row(row: &rusqlite::Row) -> rusqlite::Result<Dataset> {
    Ok(Dataset {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        collection_count: row.get("collection_count")?,
        data_count: row.get("data_count")?,
        total_tokens: row.get("total_tokens")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn collection_from_row(row: &rusqlite::Row) -> rusqlite::Result<Collection> {
    Ok(Collection {
        id: row.get("id")?,
        dataset_id: row.get("dataset_id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        source_file: row.get("source_file")?,
        file_type: row.get("file_type")?,
        data_count: row.get("data_count")?,
        total_tokens: row.get("total_tokens")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn data_from_row(row: &rusqlite::Row) -> rusqlite::Result<Data> {
    let vector_ids: String = row.get("vector_ids")?;
    let metadata: String = row.get("metadata")?;
    Ok(Data {
        id: row.get("id")?,
        collection_id: row.get("collection_id")?,
        content: row.get("content")?,
        title: row.get("title")?,
        vector_ids: serde_json::from_str(&vector_ids).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        sequence: row.get("sequence")?,
        tokens: row.get::<_, i64>("tokens")? as usize,
        processed: row.get("processed")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn turn_from_row(row: &rusqlite::Row) -> rusqlite::Result<ConversationTurn> {
    let chunks: String = row.get("retrieved_chunks")?;
    let chunks: Vec<ChunkRef> = serde_json::from_str(&chunks).unwrap_or_default();
    Ok(ConversationTurn {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        question: row.get("question")?,
        answer: row.get("answer")?,
        retrieved_chunks: chunks,
        timestamp: row.get("timestamp")?,
        tokens_used: row.get::<_, i64>("tokens_used")? as usize,
        relevance_score: row.get::<_, f64>("relevance_score")? as f32,
        response_time: row.get("response_time")?,
    })
}

impl MetadataStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!(path = %path.display(), "metadata store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // Datasets

    pub fn create_dataset(&self, dataset: &Dataset) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO datasets (id, name, description, collection_count, data_count,
                 total_tokens, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    dataset.id,
                    dataset.name,
                    dataset.description,
                    dataset.collection_count,
                    dataset.data_count,
                    dataset.total_tokens,
                    dataset.created_at,
                    dataset.updated_at,
                ],
            )
            .map_err(|e| map_insert_err(e, &dataset.id))?;
        Ok(())
    }

    pub fn get_dataset(&self, id: &str) -> Result<Option<Dataset>> {
        let conn = self.conn.lock();
        let dataset = conn
            .query_row("SELECT * FROM datasets WHERE id = ?1", [id], dataset_from_row)
            .optional()?;
        Ok(dataset)
    }

    pub fn get_dataset_by_name(&self, name: &str) -> Result<Option<Dataset>> {
        let conn = self.conn.lock();
        let dataset = conn
            .query_row(
                "SELECT * FROM datasets WHERE name = ?1",
                [name],
                dataset_from_row,
            )
            .optional()?;
        Ok(dataset)
    }

    pub fn bump_dataset_stats(
        &self,
        id: &str,
        collections: i64,
        data: i64,
        tokens: i64,
    ) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE datasets SET collection_count = collection_count + ?2,
             data_count = data_count + ?3, total_tokens = total_tokens + ?4,
             updated_at = ?5 WHERE id = ?1",
            params![id, collections, data, tokens, Utc::now()],
        )?;
        Ok(())
    }

    // Collections

    pub fn create_collection(&self, collection: &Collection) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO collections (id, dataset_id, name, description, source_file,
                 file_type, data_count, total_tokens, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    collection.id,
                    collection.dataset_id,
                    collection.name,
                    collection.description,
                    collection.source_file,
                    collection.file_type,
                    collection.data_count,
                    collection.total_tokens,
                    collection.created_at,
                    collection.updated_at,
                ],
            )
            .map_err(|e| map_insert_err(e, &collection.id))?;
        Ok(())
    }

    pub fn get_collection(&self, id: &str) -> Result<Option<Collection>> {
        let conn = self.conn.lock();
        let collection = conn
            .query_row(
                "SELECT * FROM collections WHERE id = ?1",
                [id],
                collection_from_row,
            )
            .optional()?;
        Ok(collection)
    }

    pub fn find_collection(&self, dataset_id: &str, name: &str) -> Result<Option<Collection>> {
        let conn = self.conn.lock();
        let collection = conn
            .query_row(
                "SELECT * FROM collections WHERE dataset_id = ?1 AND name = ?2",
                [dataset_id, name],
                collection_from_row,
            )
            .optional()?;
        Ok(collection)
    }

    pub fn get_collections_by_dataset(&self, dataset_id: &str) -> Result<Vec<Collection>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM collections WHERE dataset_id = ?1 ORDER BY created_at")?;
        let rows = stmt.query_map([dataset_id], collection_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn bump_collection_stats(&self, id: &str, data: i64, tokens: i64) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE collections SET data_count = data_count + ?2,
             total_tokens = total_tokens + ?3, updated_at = ?4 WHERE id = ?1",
            params![id, data, tokens, Utc::now()],
        )?;
        Ok(())
    }

    // Data

    /// Insert a batch of chunks in one transaction. A duplicate id aborts
    /// the whole batch — ingestion must stop rather than silently continue.
    pub fn insert_data_batch(&self, batch: &[Data]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for data in batch {
            tx.execute(
                "INSERT INTO data (id, collection_id, content, title, vector_ids, metadata,
                 sequence, tokens, processed, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    data.id,
                    data.collection_id,
                    data.content,
                    data.title,
                    serde_json::to_string(&data.vector_ids)?,
                    serde_json::to_string(&data.metadata)?,
                    data.sequence,
                    data.tokens as i64,
                    data.processed,
                    data.created_at,
                    data.updated_at,
                ],
            )
            .map_err(|e| map_insert_err(e, &data.id))?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_data(&self, id: &str) -> Result<Option<Data>> {
        let conn = self.conn.lock();
        let data = conn
            .query_row("SELECT * FROM data WHERE id = ?1", [id], data_from_row)
            .optional()?;
        Ok(data)
    }

    pub fn get_data_by_ids(&self, ids: &[String]) -> Result<Vec<Data>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let placeholders = vec!["?"; ids.len()].join(", ");
        let mut stmt =
            conn.prepare(&format!("SELECT * FROM data WHERE id IN ({placeholders})"))?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), data_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Inverse multi-vector lookup: rows whose vector_ids intersect the
    /// given set.
    pub fn get_data_by_vector_ids(&self, vector_ids: &[String]) -> Result<Vec<Data>> {
        if vector_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let placeholders = vec!["?"; vector_ids.len()].join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT data.* FROM data WHERE EXISTS (
                 SELECT 1 FROM json_each(data.vector_ids)
                 WHERE json_each.value IN ({placeholders})
             )"
        ))?;
        let rows = stmt.query_map(params_from_iter(vector_ids.iter()), data_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_data_by_collection(&self, collection_id: &str) -> Result<Vec<Data>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM data WHERE collection_id = ?1 ORDER BY sequence")?;
        let rows = stmt.query_map([collection_id], data_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Rows still awaiting vectorization, optionally scoped to a collection.
    pub fn get_pending_data(&self, collection_id: Option<&str>) -> Result<Vec<Data>> {
        let conn = self.conn.lock();
        match collection_id {
            Some(cid) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM data WHERE collection_id = ?1 AND processed = 0 ORDER BY sequence",
                )?;
                let rows = stmt.query_map([cid], data_from_row)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            }
            None => {
                let mut stmt = conn
                    .prepare("SELECT * FROM data WHERE processed = 0 ORDER BY collection_id, sequence")?;
                let rows = stmt.query_map([], data_from_row)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            }
        }
    }

    pub fn pending_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count =
            conn.query_row("SELECT COUNT(*) FROM data WHERE processed = 0", [], |row| {
                row.get(0)
            })?;
        Ok(count)
    }

    /// Replace a data row wholesale (vectorization updates vector_ids,
    /// processed, and the updated_at stamp).
    pub fn replace_data(&self, data: &Data) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE data SET collection_id = ?2, content = ?3, title = ?4, vector_ids = ?5,
             metadata = ?6, sequence = ?7, tokens = ?8, processed = ?9, updated_at = ?10
             WHERE id = ?1",
            params![
                data.id,
                data.collection_id,
                data.content,
                data.title,
                serde_json::to_string(&data.vector_ids)?,
                serde_json::to_string(&data.metadata)?,
                data.sequence,
                data.tokens as i64,
                data.processed,
                Utc::now(),
            ],
        )?;
        Ok(())
    }

    // Conversations

    pub fn save_turn(&self, turn: &ConversationTurn) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO conversations (id, session_id, question, answer, retrieved_chunks,
                 timestamp, tokens_used, relevance_score, response_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    turn.id,
                    turn.session_id,
                    turn.question,
                    turn.answer,
                    serde_json::to_string(&turn.retrieved_chunks)?,
                    turn.timestamp,
                    turn.tokens_used as i64,
                    turn.relevance_score as f64,
                    turn.response_time,
                ],
            )
            .map_err(|e| map_insert_err(e, &turn.id))?;
        Ok(())
    }

    /// Most recent `limit` turns for a session, in chronological order.
    pub fn get_history(&self, session_id: &str, limit: usize) -> Result<Vec<ConversationTurn>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM conversations WHERE session_id = ?1 ORDER BY timestamp DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![session_id, limit as i64], turn_from_row)?;
        let mut turns = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        turns.reverse();
        Ok(turns)
    }

    pub fn latest_turn_at(&self, session_id: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let ts = conn
            .query_row(
                "SELECT MAX(timestamp) FROM conversations WHERE session_id = ?1",
                [session_id],
                |row| row.get::<_, Option<DateTime<Utc>>>(0),
            )
            .optional()?;
        Ok(ts.flatten())
    }
}
