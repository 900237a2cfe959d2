//! Process-wide engine: builds every component once at startup and exposes
//! the handler surface (query, health, import) the HTTP layer wraps.
//!
//! Construction is fail-fast: a collaborator that cannot be reached at
//! startup is an initialization error, not a degraded engine.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::chain::{ChainDefaults, QueryRequest, QueryResponse, RetrievalChain};
use crate::config::AppConfig;
use crate::embeddings::{Embedder, OllamaEmbedder};
use crate::error::{RagError, Result};
use crate::filter::ResultFilter;
use crate::ingest::{ImportPipeline, ImportReport};
use crate::llm::{ChatClient, ChatModel};
use crate::memory::ConversationMemory;
use crate::query::{QueryExpander, QueryOptimizer};
use crate::reranking::{HttpReranker, Reranker};
use crate::search::{
    DenseRetriever, HybridRetriever, LexicalIndex, LexicalRetriever, ParallelRetriever,
    SearchBackend,
};
use crate::storage::{LanceVectorStore, MetadataStore};
use crate::tokens::TokenCounter;

#[derive(Debug, Clone, Serialize)]
pub struct ComponentStatus {
    pub retrieval_chain: bool,
    pub llm: bool,
    pub config: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub components: ComponentStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportStatus {
    pub ready: bool,
    pub pending_data: i64,
    pub import_running: bool,
}

pub struct RagEngine {
    config: AppConfig,
    chain: RetrievalChain,
    pipeline: Arc<ImportPipeline>,
    meta: Arc<MetadataStore>,
    chat_configured: bool,
    sweeper: tokio::task::JoinHandle<()>,
    background_import: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RagEngine {
    pub async fn new(config: AppConfig) -> Result<Self> {
        config
            .validate()
            .map_err(RagError::Init)?;

        let counter = Arc::new(TokenCounter::new());

        let embedder: Arc<dyn Embedder> = Arc::new(
            OllamaEmbedder::connect(
                &config.embedding.service,
                &config.embedding.model,
                Duration::from_secs(config.embedding.timeout_secs),
                config.embedding.cache_size,
            )
            .await?,
        );

        let vectors = Arc::new(
            LanceVectorStore::open(
                config
                    .vector_store_path()
                    .to_str()
                    .ok_or_else(|| RagError::Init("vector store path is not UTF-8".into()))?,
                embedder.dimension(),
            )
            .await?,
        );
        let meta = Arc::new(MetadataStore::open(&config.metadata_db_path())?);
        let lexical = Arc::new(LexicalIndex::open(&config.lexical_index_path())?);

        let dense: Arc<dyn SearchBackend> = Arc::new(DenseRetriever::new(
            embedder.clone(),
            vectors.clone(),
            meta.clone(),
        ));
        let lexical_backend: Arc<dyn SearchBackend> =
            Arc::new(LexicalRetriever::new(lexical.clone(), meta.clone()));

        let hybrid = Arc::new(HybridRetriever::new(
            vec![
                (dense, config.retrieval.dense_weight),
                (lexical_backend, config.retrieval.lexical_weight),
            ],
            Duration::from_secs(config.retrieval.task_timeout_secs),
            config.retrieval.rrf_k,
        ));
        let retriever = Arc::new(ParallelRetriever::new(
            hybrid,
            config.retrieval.pool_size,
            Duration::from_secs(config.retrieval.task_timeout_secs),
            config.retrieval.rrf_k,
        ));

        let rerank_backend = Arc::new(HttpReranker::new(
            &config.rerank.service,
            &config.rerank.endpoint,
            &config.rerank.model,
            config.rerank.access_token.clone(),
            Duration::from_secs(config.rerank.timeout_secs),
        )?);
        let reranker = Reranker::new(
            rerank_backend,
            config.rerank.score_weight,
            config.rerank.batch_size,
        );

        let chat_client = ChatClient::new(
            &config.llm.api_base,
            &config.llm.api_key,
            &config.llm.model,
            Duration::from_secs(config.llm.timeout_secs),
        )?;
        let chat_configured = chat_client.is_configured();
        let chat: Arc<dyn ChatModel> = Arc::new(chat_client);

        let memory = Arc::new(ConversationMemory::new(
            meta.clone(),
            config.memory.max_history,
            config.memory.session_timeout_hours,
        ));

        let chain = RetrievalChain::new(
            QueryOptimizer::new(chat.clone()),
            QueryExpander::new(chat.clone(), config.retrieval.num_variants),
            retriever,
            reranker,
            ResultFilter::new(counter.clone()),
            memory.clone(),
            chat,
            ChainDefaults {
                max_tokens: config.retrieval.max_tokens_limit,
                relevance_threshold: config.retrieval.relevance_threshold,
                top_k: config.retrieval.top_k,
                ..Default::default()
            },
        );

        let pipeline = Arc::new(ImportPipeline::new(
            meta.clone(),
            vectors,
            lexical,
            embedder,
            counter,
            &config.embedding.model,
        ));

        // Hourly sweep of stale sessions from the memory cache.
        let sweeper = tokio::spawn({
            let memory = memory.clone();
            async move {
                let mut tick = tokio::time::interval(Duration::from_secs(3600));
                tick.tick().await;
                loop {
                    tick.tick().await;
                    memory.sweep_expired();
                }
            }
        });

        let engine = Self {
            config,
            chain,
            pipeline,
            meta,
            chat_configured,
            sweeper,
            background_import: Mutex::new(None),
        };

        // Finish whatever a previous process left half-vectorized.
        match engine.pipeline.resume_pending().await {
            Ok(0) => {}
            Ok(resumed) => tracing::info!(resumed, "pending rows vectorized at startup"),
            Err(e) => tracing::warn!("startup resume failed: {e}"),
        }

        tracing::info!("engine initialized");
        Ok(engine)
    }

    pub async fn query(&self, request: QueryRequest) -> QueryResponse {
        self.chain.run(request).await
    }

    pub fn health(&self) -> HealthStatus {
        let config_ok = self.config.validate().is_ok();
        let components = ComponentStatus {
            retrieval_chain: true,
            llm: self.chat_configured,
            config: config_ok,
        };
        let healthy = components.retrieval_chain && components.llm && components.config;
        HealthStatus {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            components,
            timestamp: Utc::now(),
        }
    }

    /// Synchronous import: runs the pipeline to completion and returns its
    /// statistics.
    pub async fn import_directory(&self, data_dir: &Path, dataset_name: &str) -> Result<ImportReport> {
        self.pipeline.import_directory(data_dir, dataset_name).await
    }

    /// Background import: schedules the pipeline and returns immediately.
    /// A run already in flight is left alone.
    pub fn start_import(self: &Arc<Self>, data_dir: std::path::PathBuf, dataset_name: String) -> bool {
        let mut slot = self.background_import.lock();
        if let Some(handle) = slot.as_ref() {
            if !handle.is_finished() {
                tracing::warn!("import already running, not scheduling another");
                return false;
            }
        }
        let engine = self.clone();
        *slot = Some(tokio::spawn(async move {
            match engine.pipeline.import_directory(&data_dir, &dataset_name).await {
                Ok(report) => tracing::info!(
                    files = report.files_processed,
                    data = report.data_created,
                    "background import finished"
                ),
                Err(e) => tracing::error!("background import failed: {e}"),
            }
        }));
        true
    }

    pub fn import_status(&self) -> Result<ImportStatus> {
        let pending = self.meta.pending_count()?;
        let running = self
            .background_import
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false);
        Ok(ImportStatus {
            ready: true,
            pending_data: pending,
            import_running: running,
        })
    }

    /// Join any background import and stop the sweeper before the process
    /// exits.
    pub async fn shutdown(&self) {
        let handle = self.background_import.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("background import join failed: {e}");
            }
        }
        self.sweeper.abort();
        tracing::info!("engine shut down");
    }
}
