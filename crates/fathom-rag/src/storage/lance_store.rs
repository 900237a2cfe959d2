use arrow_array::{
    Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray,
    UInt32Array,
};
use arrow_schema::{DataType, Field, Schema};
use lancedb::query::{ExecutableQuery, QueryBase};
use std::sync::Arc;

use crate::error::{RagError, Result};
use crate::types::EmbeddingVector;

/// One ANN hit: the matched vector, its owning data row, and the cosine
/// similarity score.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub vector_id: String,
    pub data_id: String,
    pub chunk_index: u32,
    pub score: f32,
}

/// Vector store on LanceDB. The table schema is fixed at open time; vector
/// dimension is uniform for the store's lifetime.
pub struct LanceVectorStore {
    db: lancedb::Connection,
    dimension: usize,
    table_name: String,
}

impl LanceVectorStore {
    pub async fn open(path: &str, dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(RagError::Init("vector dimension must be > 0".into()));
        }
        std::fs::create_dir_all(path).ok();
        let db = lancedb::connect(path)
            .execute()
            .await
            .map_err(|e| RagError::Init(format!("lancedb connect failed: {e}")))?;

        let store = Self {
            db,
            dimension,
            table_name: "vectors".to_string(),
        };
        store.ensure_table().await?;
        Ok(store)
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("data_id", DataType::Utf8, false),
            Field::new("chunk_index", DataType::UInt32, false),
            Field::new("model", DataType::Utf8, false),
            Field::new("chunk_text", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimension as i32,
                ),
                true,
            ),
        ]))
    }

    async fn ensure_table(&self) -> Result<()> {
        let names = self.db.table_names().execute().await?;
        if !names.contains(&self.table_name) {
            // LanceDB infers the schema from data, so create with one seed
            // row and delete it immediately.
            let schema = self.schema();
            let seed = vec![0.0f32; self.dimension];
            let values = Float32Array::from(seed);
            let vector_array = FixedSizeListArray::new(
                Arc::new(Field::new("item", DataType::Float32, true)),
                self.dimension as i32,
                Arc::new(values) as Arc<dyn Array>,
                None,
            );

            let batch = RecordBatch::try_new(
                schema.clone(),
                vec![
                    Arc::new(StringArray::from(vec!["__seed__"])) as Arc<dyn Array>,
                    Arc::new(StringArray::from(vec!["__seed__"])),
                    Arc::new(UInt32Array::from(vec![0u32])),
                    Arc::new(StringArray::from(vec![""])),
                    Arc::new(StringArray::from(vec![""])),
                    Arc::new(vector_array) as Arc<dyn Array>,
                ],
            )?;

            let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
            self.db
                .create_table(&self.table_name, Box::new(batches))
                .execute()
                .await?;

            let table = self.db.open_table(&self.table_name).execute().await?;
            table.delete("id = '__seed__'").await.ok();
        }
        Ok(())
    }

    pub async fn insert_vectors(&self, vectors: &[EmbeddingVector]) -> Result<()> {
        if vectors.is_empty() {
            return Ok(());
        }
        for vector in vectors {
            if vector.vector.len() != self.dimension {
                return Err(RagError::MalformedResponse(format!(
                    "vector {} has dimension {}, store expects {}",
                    vector.id,
                    vector.vector.len(),
                    self.dimension
                )));
            }
        }

        let table = self.db.open_table(&self.table_name).execute().await?;
        let schema = self.schema();

        let ids: Vec<&str> = vectors.iter().map(|v| v.id.as_str()).collect();
        let data_ids: Vec<&str> = vectors.iter().map(|v| v.data_id.as_str()).collect();
        let chunk_indices: Vec<u32> = vectors.iter().map(|v| v.chunk_index).collect();
        let models: Vec<&str> = vectors.iter().map(|v| v.model.as_str()).collect();
        let chunk_texts: Vec<&str> = vectors.iter().map(|v| v.chunk_text.as_str()).collect();

        let flat: Vec<f32> = vectors.iter().flat_map(|v| v.vector.iter().copied()).collect();
        let values = Float32Array::from(flat);
        let vector_array = FixedSizeListArray::new(
            Arc::new(Field::new("item", DataType::Float32, true)),
            self.dimension as i32,
            Arc::new(values) as Arc<dyn Array>,
            None,
        );

        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(ids)) as Arc<dyn Array>,
                Arc::new(StringArray::from(data_ids)),
                Arc::new(UInt32Array::from(chunk_indices)),
                Arc::new(StringArray::from(models)),
                Arc::new(StringArray::from(chunk_texts)),
                Arc::new(vector_array) as Arc<dyn Array>,
            ],
        )?;

        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table.add(Box::new(reader)).execute().await?;

        tracing::debug!("inserted {} vectors", vectors.len());
        Ok(())
    }

    /// Cosine ANN search. Returns up to `top_k` hits; the same data_id may
    /// appear more than once when several of its vectors match.
    pub async fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<VectorHit>> {
        let table = self.db.open_table(&self.table_name).execute().await?;

        let results = table
            .query()
            .nearest_to(query)?
            .distance_type(lancedb::DistanceType::Cosine)
            .limit(top_k)
            .execute()
            .await?;

        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;
        Ok(extract_hits(&batches))
    }

    /// Look up vectors by id, returning (vector_id, data_id) pairs.
    /// Used by the ingestion consistency check.
    pub async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<(String, String)>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let table = self.db.open_table(&self.table_name).execute().await?;
        let mut found = Vec::new();

        for chunk in ids.chunks(50) {
            let id_list: Vec<String> = chunk
                .iter()
                .map(|id| format!("'{}'", id.replace('\'', "''")))
                .collect();
            let predicate = format!("id IN ({})", id_list.join(", "));

            let results = table.query().only_if(predicate).execute().await?;
            let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;
            for hit in extract_hits(&batches) {
                found.push((hit.vector_id, hit.data_id));
            }
        }
        Ok(found)
    }

    /// Drop every vector owned by the given data rows. Re-vectorizing a
    /// half-ingested row starts from a clean slate so no orphans linger.
    pub async fn delete_by_data_ids(&self, data_ids: &[String]) -> Result<()> {
        if data_ids.is_empty() {
            return Ok(());
        }
        let table = self.db.open_table(&self.table_name).execute().await?;
        for chunk in data_ids.chunks(50) {
            let id_list: Vec<String> = chunk
                .iter()
                .map(|id| format!("'{}'", id.replace('\'', "''")))
                .collect();
            table
                .delete(&format!("data_id IN ({})", id_list.join(", ")))
                .await?;
        }
        Ok(())
    }

    pub async fn delete_by_ids(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let table = self.db.open_table(&self.table_name).execute().await?;
        for chunk in ids.chunks(50) {
            let id_list: Vec<String> = chunk
                .iter()
                .map(|id| format!("'{}'", id.replace('\'', "''")))
                .collect();
            table.delete(&format!("id IN ({})", id_list.join(", "))).await?;
        }
        Ok(())
    }

    pub async fn count(&self) -> Result<usize> {
        let table = self.db.open_table(&self.table_name).execute().await?;
        Ok(table.count_rows(None).await?)
    }

    /// Build the ANN index once the table is big enough to benefit.
    pub async fn create_index_if_needed(&self) -> Result<()> {
        let count = self.count().await?;
        if count >= 1_000 {
            let table = self.db.open_table(&self.table_name).execute().await?;
            table
                .create_index(&["vector"], lancedb::index::Index::Auto)
                .execute()
                .await?;
            tracing::info!("created vector index on {count} rows");
        }
        Ok(())
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

fn extract_hits(batches: &[RecordBatch]) -> Vec<VectorHit> {
    let mut hits = Vec::new();
    for batch in batches {
        let ids = batch
            .column_by_name("id")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let data_ids = batch
            .column_by_name("data_id")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let chunk_indices = batch
            .column_by_name("chunk_index")
            .and_then(|c| c.as_any().downcast_ref::<UInt32Array>());
        let distances = batch
            .column_by_name("_distance")
            .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

        let (Some(ids), Some(data_ids)) = (ids, data_ids) else {
            continue;
        };

        for i in 0..batch.num_rows() {
            // Cosine distance -> similarity in [0, 1].
            let score = distances.map(|d| (1.0 - d.value(i)).max(0.0)).unwrap_or(0.0);
            hits.push(VectorHit {
                vector_id: ids.value(i).to_string(),
                data_id: data_ids.value(i).to_string(),
                chunk_index: chunk_indices.map(|c| c.value(i)).unwrap_or(0),
                score,
            });
        }
    }
    hits
}
