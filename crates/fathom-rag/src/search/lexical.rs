//! BM25 retrieval over chunk content.
//!
//! The index stores only the data_id and the searchable text; everything
//! else is resolved against the metadata store at query time. Ids are
//! STRING (indexed, untokenized) so delete_term works for re-ingestion.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{self, Schema, Value as TantivyValue, STORED, STRING, TEXT};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument};

use crate::error::Result;
use crate::storage::MetadataStore;
use crate::types::{RetrievalResult, RetrievalSource};

use super::SearchBackend;

pub struct LexicalIndex {
    index: Index,
    reader: IndexReader,
    writer: parking_lot::Mutex<IndexWriter>,
    id_field: schema::Field,
    content_field: schema::Field,
    title_field: schema::Field,
}

impl LexicalIndex {
    fn build_schema() -> (Schema, schema::Field, schema::Field, schema::Field) {
        let mut sb = Schema::builder();
        let id_field = sb.add_text_field("id", STRING | STORED);
        let content_field = sb.add_text_field("content", TEXT);
        let title_field = sb.add_text_field("title", TEXT);
        (sb.build(), id_field, content_field, title_field)
    }

    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path).ok();
        let (schema, id_field, content_field, title_field) = Self::build_schema();

        let dir = tantivy::directory::MmapDirectory::open(path)
            .map_err(tantivy::TantivyError::from)?;
        let index = if Index::exists(&dir).map_err(tantivy::TantivyError::from)? {
            Index::open_in_dir(path)?
        } else {
            Index::create_in_dir(path, schema)?
        };

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()?;
        let writer = index.writer(50_000_000)?;

        Ok(Self {
            index,
            reader,
            writer: parking_lot::Mutex::new(writer),
            id_field,
            content_field,
            title_field,
        })
    }

    /// Index `(data_id, content, title)` rows. Call `commit` afterwards.
    pub fn index_batch(&self, entries: &[(String, String, String)]) -> Result<()> {
        let writer = self.writer.lock();
        for (id, content, title) in entries {
            writer.add_document(doc!(
                self.id_field => id.as_str(),
                self.content_field => content.as_str(),
                self.title_field => title.as_str(),
            ))?;
        }
        Ok(())
    }

    pub fn delete_by_id(&self, id: &str) {
        let writer = self.writer.lock();
        let term = tantivy::Term::from_field_text(self.id_field, id);
        writer.delete_term(term);
    }

    pub fn commit(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.commit()?;
        self.reader.reload()?;
        Ok(())
    }

    /// BM25 search returning `(data_id, score)` ranked best-first.
    pub fn search(&self, query: &str, k: usize) -> Result<Vec<(String, f32)>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let searcher = self.reader.searcher();
        let query_parser =
            QueryParser::for_index(&self.index, vec![self.content_field, self.title_field]);

        let parsed_query = match query_parser.parse_query(query) {
            Ok(q) => q,
            Err(_) => {
                // Query text with operators or stray quotes — retry as a phrase.
                let escaped = query.replace('"', "");
                match query_parser.parse_query(&format!("\"{escaped}\"")) {
                    Ok(q) => q,
                    Err(e) => {
                        tracing::debug!("unparseable lexical query: {e}");
                        return Ok(Vec::new());
                    }
                }
            }
        };

        let top_docs = searcher.search(&parsed_query, &TopDocs::with_limit(k))?;

        let mut results = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            if let Ok(doc) = searcher.doc::<TantivyDocument>(doc_address) {
                if let Some(id) = doc.get_first(self.id_field).and_then(|v| v.as_str()) {
                    results.push((id.to_string(), score));
                }
            }
        }
        Ok(results)
    }
}

/// Lexical side of hybrid retrieval: BM25 ranks from the index, row data
/// from the metadata store. Results have unique data_ids by construction.
pub struct LexicalRetriever {
    index: Arc<LexicalIndex>,
    meta: Arc<MetadataStore>,
}

impl LexicalRetriever {
    pub fn new(index: Arc<LexicalIndex>, meta: Arc<MetadataStore>) -> Self {
        Self { index, meta }
    }
}

#[async_trait]
impl SearchBackend for LexicalRetriever {
    fn name(&self) -> &'static str {
        "lexical"
    }

    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<RetrievalResult>> {
        let hits = self.index.search(query, top_k)?;
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = hits.iter().map(|(id, _)| id.clone()).collect();
        let rows = self.meta.get_data_by_ids(&ids)?;
        let by_id: HashMap<&str, &crate::types::Data> =
            rows.iter().map(|d| (d.id.as_str(), d)).collect();

        let mut results = Vec::with_capacity(hits.len());
        for (id, score) in &hits {
            let Some(data) = by_id.get(id.as_str()) else {
                tracing::warn!(data_id = %id, "lexical hit missing from metadata store");
                continue;
            };
            let mut metadata = data.metadata.clone();
            metadata.insert("bm25_score".to_string(), json!(score));
            if let Some(title) = &data.title {
                metadata.insert("title".to_string(), json!(title));
            }
            results.push(RetrievalResult {
                data_id: data.id.clone(),
                collection_id: data.collection_id.clone(),
                content: data.content.clone(),
                score: *score,
                source: RetrievalSource::Lexical,
                metadata,
                tokens: data.tokens,
            });
        }
        tracing::debug!(count = results.len(), "lexical search complete");
        Ok(results)
    }
}
