//! Ingestion pipeline: files → chunks → data rows → vectors.
//!
//! Each `.txt` file becomes one collection. Chunks are persisted first with
//! `processed = false`, then vectorized in batches (full-content vector plus
//! a first-512-chars sub-vector for long chunks) and flipped to
//! `processed = true` — so a killed run resumes by re-embedding whatever is
//! still pending. Duplicate ids and undecodable files abort the run.

pub mod chunker;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

use crate::embeddings::Embedder;
use crate::error::{RagError, Result};
use crate::search::LexicalIndex;
use crate::storage::{LanceVectorStore, MetadataStore};
use crate::tokens::TokenCounter;
use crate::types::{Collection, Data, Dataset, EmbeddingVector};

use chunker::ChunkSplitter;

/// Sub-vector threshold: chunks longer than this get an extra embedding of
/// their head, so lead-in content stays findable in long chunks.
const SUB_VECTOR_CHARS: usize = 512;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub dataset_id: String,
    pub files_processed: usize,
    pub data_created: usize,
    pub vectors_created: usize,
}

/// Sortable-prefix id generation: type digit + 6-digit unix-seconds suffix
/// + counter. Data/vector ids use a microsecond counter held strictly
/// monotonic so a tight loop cannot mint the same id twice.
struct IdGenerator {
    sequence: AtomicU32,
    last_micros: AtomicU64,
}

impl IdGenerator {
    fn new() -> Self {
        Self {
            sequence: AtomicU32::new(1),
            last_micros: AtomicU64::new(0),
        }
    }

    fn now_micros(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        let mut last = self.last_micros.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(last + 1);
            match self.last_micros.compare_exchange(
                last,
                candidate,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(actual) => last = actual,
            }
        }
    }

    fn short_id(&self, prefix: char) -> String {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let counter = self.sequence.fetch_add(1, Ordering::Relaxed) % 1000;
        format!("{prefix}{:06}{counter:03}", secs % 1_000_000)
    }

    fn long_id(&self, prefix: char) -> String {
        let micros = self.now_micros();
        format!(
            "{prefix}{:06}{:05}",
            (micros / 1_000_000) % 1_000_000,
            micros % 100_000
        )
    }

    fn dataset_id(&self) -> String {
        self.short_id('1')
    }

    fn collection_id(&self) -> String {
        self.short_id('2')
    }

    fn data_id(&self) -> String {
        self.long_id('3')
    }

    fn vector_id(&self) -> String {
        self.long_id('4')
    }
}

pub struct ImportPipeline {
    meta: Arc<MetadataStore>,
    vectors: Arc<LanceVectorStore>,
    lexical: Arc<LexicalIndex>,
    embedder: Arc<dyn Embedder>,
    counter: Arc<TokenCounter>,
    splitter: ChunkSplitter,
    model_name: String,
    batch_size: usize,
    ids: IdGenerator,
}

impl ImportPipeline {
    pub fn new(
        meta: Arc<MetadataStore>,
        vectors: Arc<LanceVectorStore>,
        lexical: Arc<LexicalIndex>,
        embedder: Arc<dyn Embedder>,
        counter: Arc<TokenCounter>,
        model_name: &str,
    ) -> Self {
        Self {
            meta,
            vectors,
            lexical,
            embedder,
            counter,
            splitter: ChunkSplitter::default(),
            model_name: model_name.to_string(),
            batch_size: 10,
            ids: IdGenerator::new(),
        }
    }

    /// Import every `.txt` file under `data_dir` into the named dataset.
    pub async fn import_directory(&self, data_dir: &Path, dataset_name: &str) -> Result<ImportReport> {
        let dataset = self.get_or_create_dataset(dataset_name)?;

        let mut files: Vec<_> = WalkDir::new(data_dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry.file_type().is_file()
                    && entry.path().extension().map(|ext| ext == "txt").unwrap_or(false)
            })
            .map(|entry| entry.into_path())
            .collect();
        files.sort();

        let mut report = ImportReport {
            dataset_id: dataset.id.clone(),
            ..Default::default()
        };
        if files.is_empty() {
            tracing::warn!(dir = %data_dir.display(), "no .txt files found to import");
            return Ok(report);
        }
        tracing::info!(count = files.len(), "importing files");

        for file in &files {
            let (data_created, vectors_created) = self.import_file(file, &dataset.id).await?;
            report.files_processed += 1;
            report.data_created += data_created;
            report.vectors_created += vectors_created;
        }

        if let Err(e) = self.vectors.create_index_if_needed().await {
            tracing::warn!("vector index build deferred: {e}");
        }

        tracing::info!(
            files = report.files_processed,
            data = report.data_created,
            vectors = report.vectors_created,
            "import complete"
        );
        Ok(report)
    }

    async fn import_file(&self, path: &Path, dataset_id: &str) -> Result<(usize, usize)> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unnamed");
        tracing::info!(file = %path.display(), "importing file");

        let (collection, collection_created) =
            self.get_or_create_collection(dataset_id, stem, path)?;

        // Resume anything a previous run left unvectorized.
        let mut vectors_created = 0usize;
        let pending = self.meta.get_pending_data(Some(&collection.id))?;
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "resuming pending rows");
            self.reindex_lexical(&pending)?;
            vectors_created += self.vectorize(&pending).await?;
        }

        let content = read_text_file(path)?;
        let chunks = self.splitter.split(&content);
        tracing::info!(chunks = chunks.len(), "file chunked");

        let now = Utc::now();
        let rows: Vec<Data> = chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                let mut metadata = crate::types::Metadata::new();
                metadata.insert("chunk_index".to_string(), json!(i));
                metadata.insert("char_count".to_string(), json!(chunk.chars().count()));
                Data {
                    id: self.ids.data_id(),
                    collection_id: collection.id.clone(),
                    content: chunk.clone(),
                    title: Some(stem.to_string()),
                    vector_ids: Vec::new(),
                    metadata,
                    sequence: Some(i as u32),
                    tokens: self.counter.count(chunk),
                    processed: false,
                    created_at: now,
                    updated_at: now,
                }
            })
            .collect();

        self.meta.insert_data_batch(&rows)?;
        self.lexical.index_batch(
            &rows
                .iter()
                .map(|row| {
                    (
                        row.id.clone(),
                        row.content.clone(),
                        row.title.clone().unwrap_or_default(),
                    )
                })
                .collect::<Vec<_>>(),
        )?;
        self.lexical.commit()?;

        vectors_created += self.vectorize(&rows).await?;

        let token_sum: i64 = rows.iter().map(|row| row.tokens as i64).sum();
        self.meta
            .bump_collection_stats(&collection.id, rows.len() as i64, token_sum)?;
        self.meta.bump_dataset_stats(
            dataset_id,
            i64::from(collection_created),
            rows.len() as i64,
            token_sum,
        )?;

        Ok((rows.len(), vectors_created))
    }

    /// Embed and persist vectors for the given rows, batch by batch. Each
    /// batch clears any half-written vectors first, inserts fresh ones, then
    /// flips the rows to `processed = true`.
    async fn vectorize(&self, rows: &[Data]) -> Result<usize> {
        let mut total = 0usize;
        let batch_count = rows.len().div_ceil(self.batch_size);

        for (batch_index, batch) in rows.chunks(self.batch_size).enumerate() {
            let data_ids: Vec<String> = batch.iter().map(|row| row.id.clone()).collect();
            self.vectors.delete_by_data_ids(&data_ids).await?;

            let mut vectors: Vec<EmbeddingVector> = Vec::new();
            for row in batch {
                let main = self.embedder.embed(&row.content).await?;
                vectors.push(EmbeddingVector {
                    id: self.ids.vector_id(),
                    data_id: row.id.clone(),
                    dimension: main.len(),
                    vector: main,
                    model: self.model_name.clone(),
                    chunk_text: row.content.clone(),
                    chunk_index: 0,
                });

                if row.content.chars().count() > SUB_VECTOR_CHARS {
                    let head: String = row.content.chars().take(SUB_VECTOR_CHARS).collect();
                    let sub = self.embedder.embed(&head).await?;
                    vectors.push(EmbeddingVector {
                        id: self.ids.vector_id(),
                        data_id: row.id.clone(),
                        dimension: sub.len(),
                        vector: sub,
                        model: self.model_name.clone(),
                        chunk_text: head,
                        chunk_index: 1,
                    });
                }
            }

            self.vectors.insert_vectors(&vectors).await?;

            for row in batch {
                let ids: Vec<String> = vectors
                    .iter()
                    .filter(|v| v.data_id == row.id)
                    .map(|v| v.id.clone())
                    .collect();
                let mut updated = row.clone();
                updated
                    .metadata
                    .insert("vector_count".to_string(), json!(ids.len()));
                updated.vector_ids = ids;
                updated.processed = true;
                self.meta.replace_data(&updated)?;
            }

            total += vectors.len();
            tracing::info!(
                batch = batch_index + 1,
                batches = batch_count,
                vectors = total,
                "vectorization batch complete"
            );
        }
        Ok(total)
    }

    /// Startup pass: finish whatever a previous process left pending.
    pub async fn resume_pending(&self) -> Result<usize> {
        let pending = self.meta.get_pending_data(None)?;
        if pending.is_empty() {
            return Ok(0);
        }
        tracing::info!(count = pending.len(), "resuming pending rows from previous run");
        self.reindex_lexical(&pending)?;
        self.vectorize(&pending).await?;
        Ok(pending.len())
    }

    fn reindex_lexical(&self, rows: &[Data]) -> Result<()> {
        for row in rows {
            self.lexical.delete_by_id(&row.id);
        }
        self.lexical.index_batch(
            &rows
                .iter()
                .map(|row| {
                    (
                        row.id.clone(),
                        row.content.clone(),
                        row.title.clone().unwrap_or_default(),
                    )
                })
                .collect::<Vec<_>>(),
        )?;
        self.lexical.commit()
    }

    fn get_or_create_dataset(&self, name: &str) -> Result<Dataset> {
        if let Some(existing) = self.meta.get_dataset_by_name(name)? {
            return Ok(existing);
        }
        let now = Utc::now();
        let dataset = Dataset {
            id: self.ids.dataset_id(),
            name: name.to_string(),
            description: format!("Auto-created dataset: {name}"),
            collection_count: 0,
            data_count: 0,
            total_tokens: 0,
            created_at: now,
            updated_at: now,
        };
        self.meta.create_dataset(&dataset)?;
        tracing::info!(name = %dataset.name, id = %dataset.id, "dataset created");
        Ok(dataset)
    }

    fn get_or_create_collection(
        &self,
        dataset_id: &str,
        name: &str,
        source: &Path,
    ) -> Result<(Collection, bool)> {
        if let Some(existing) = self.meta.find_collection(dataset_id, name)? {
            return Ok((existing, false));
        }
        let now = Utc::now();
        let collection = Collection {
            id: self.ids.collection_id(),
            dataset_id: dataset_id.to_string(),
            name: name.to_string(),
            description: format!("Imported from file: {name}"),
            source_file: Some(source.display().to_string()),
            file_type: Some("txt".to_string()),
            data_count: 0,
            total_tokens: 0,
            created_at: now,
            updated_at: now,
        };
        self.meta.create_collection(&collection)?;
        tracing::info!(name = %collection.name, id = %collection.id, "collection created");
        Ok((collection, true))
    }

    /// Consistency check usable by tests and operators: every row in the
    /// collection is processed, owns at least one vector, and every one of
    /// its vector ids exists in the vector store with a matching data_id.
    pub async fn verify_collection(&self, collection_id: &str) -> Result<bool> {
        let rows = self.meta.get_data_by_collection(collection_id)?;
        for row in rows {
            if !row.processed || row.vector_ids.is_empty() {
                return Ok(false);
            }
            let found = self.vectors.get_by_ids(&row.vector_ids).await?;
            if found.len() != row.vector_ids.len() {
                return Ok(false);
            }
            if found.iter().any(|(_, data_id)| data_id != &row.id) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Read a text file trying encodings in a fixed order; the first decode
/// without errors wins. (Under WHATWG labeling, gbk and gb2312 share the
/// GBK decoder.)
fn read_text_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    let encodings: [&'static encoding_rs::Encoding; 4] = [
        encoding_rs::UTF_8,
        encoding_rs::GBK,
        encoding_rs::UTF_16LE,
        encoding_rs::BIG5,
    ];
    for encoding in encodings {
        let (text, _, had_errors) = encoding.decode(&bytes);
        if !had_errors {
            tracing::debug!(encoding = encoding.name(), "file decoded");
            return Ok(text.into_owned());
        }
    }
    Err(RagError::DecodeFailure(path.display().to_string()))
}
