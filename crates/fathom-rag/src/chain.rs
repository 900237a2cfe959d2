//! The retrieval chain: query transformation → parallel hybrid retrieval →
//! rerank → filter → prompt → generation → turn persistence.
//!
//! Stages degrade rather than fail: transformation falls back to the raw
//! question, fan-out absorbs backend failures, rerank degrades to identity,
//! and a generation failure still returns a well-formed envelope with a
//! fixed apology as the answer. Only infrastructure errors before prompt
//! assembly produce the error envelope.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::filter::{FilterParams, ResultFilter};
use crate::llm::{ChatModel, GenerationOptions};
use crate::memory::ConversationMemory;
use crate::prompts::{PromptTemplates, TEMPLATE_BASIC_RAG, TEMPLATE_CONVERSATIONAL_RAG};
use crate::query::{ExpandedQuery, QueryExpander, QueryOptimizer};
use crate::reranking::Reranker;
use crate::search::ParallelRetriever;
use crate::types::Query;

const NO_RESULTS_ANSWER: &str =
    "抱歉，我没有找到与您问题相关的信息。请尝试换个方式提问或提供更多详细信息。";
const GENERATION_FAILED_ANSWER: &str = "抱歉，在生成答案时遇到了问题，请稍后再试。";
const EMPTY_ANSWER_FALLBACK: &str = "抱歉，我无法基于提供的信息回答您的问题。";

fn default_template() -> String {
    TEMPLATE_BASIC_RAG.to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub relevance_threshold: Option<f32>,
    #[serde(default = "default_template")]
    pub template_name: String,
    #[serde(default = "default_true")]
    pub enable_rerank: bool,
    #[serde(default = "default_true")]
    pub enable_optimization: bool,
    #[serde(default = "default_true")]
    pub enable_expansion: bool,
}

impl QueryRequest {
    pub fn new(question: &str) -> Self {
        Self {
            question: question.to_string(),
            session_id: None,
            max_tokens: None,
            relevance_threshold: None,
            template_name: default_template(),
            enable_rerank: true,
            enable_optimization: true,
            enable_expansion: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalStats {
    pub initial_results: usize,
    pub reranked_results: usize,
    pub filtered_results: usize,
    pub rerank_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingEnabled {
    pub optimization: bool,
    pub expansion: bool,
    pub rerank: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_query: Option<Query>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieval_stats: Option<RetrievalStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_enabled: Option<ProcessingEnabled>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub question: String,
    pub answer: String,
    pub query_id: String,
    pub session_id: Option<String>,
    pub processing_time: f64,
    pub tokens_used: usize,
    pub relevance_score: f64,
    pub retrieved_chunks_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_results: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<bool>,
    pub metadata: ResponseMetadata,
}

#[derive(Debug, Clone)]
pub struct ChainDefaults {
    pub max_tokens: usize,
    pub relevance_threshold: f32,
    pub top_k: usize,
    pub history_turns: usize,
    pub history_max_tokens: usize,
}

impl Default for ChainDefaults {
    fn default() -> Self {
        Self {
            max_tokens: 4000,
            relevance_threshold: 0.6,
            top_k: 10,
            history_turns: 3,
            history_max_tokens: 800,
        }
    }
}

pub struct RetrievalChain {
    optimizer: QueryOptimizer,
    expander: QueryExpander,
    retriever: Arc<ParallelRetriever>,
    reranker: Reranker,
    filter: ResultFilter,
    memory: Arc<ConversationMemory>,
    templates: PromptTemplates,
    chat: Arc<dyn ChatModel>,
    defaults: ChainDefaults,
}

impl RetrievalChain {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        optimizer: QueryOptimizer,
        expander: QueryExpander,
        retriever: Arc<ParallelRetriever>,
        reranker: Reranker,
        filter: ResultFilter,
        memory: Arc<ConversationMemory>,
        chat: Arc<dyn ChatModel>,
        defaults: ChainDefaults,
    ) -> Self {
        Self {
            optimizer,
            expander,
            retriever,
            reranker,
            filter,
            memory,
            templates: PromptTemplates::new(),
            chat,
            defaults,
        }
    }

    pub async fn run(&self, request: QueryRequest) -> QueryResponse {
        let start = Instant::now();
        let max_tokens = request.max_tokens.unwrap_or(self.defaults.max_tokens);
        let threshold = request
            .relevance_threshold
            .unwrap_or(self.defaults.relevance_threshold);

        tracing::info!(question = %truncate(&request.question, 50), "retrieval chain started");

        // Query transformation, with history when the session provides it.
        let history = if request.enable_optimization {
            match &request.session_id {
                Some(session_id) => {
                    match self.memory.get_history(session_id, self.defaults.history_turns) {
                        Ok(history) => history,
                        Err(e) => {
                            tracing::error!("history read failed: {e}");
                            return self.error_response(&request, start);
                        }
                    }
                }
                None => Vec::new(),
            }
        } else {
            Vec::new()
        };

        let optimized = if request.enable_optimization {
            self.optimizer.optimize(&request.question, &history).await
        } else {
            request.question.clone()
        };

        let expansion = if request.enable_expansion {
            self.expander.expand(&optimized).await
        } else {
            ExpandedQuery {
                original: optimized.clone(),
                variants: Vec::new(),
                concat_query: optimized.clone(),
            }
        };

        let query = Query {
            id: Uuid::new_v4().to_string(),
            question: request.question.clone(),
            optimized_question: optimized,
            expanded_queries: expansion.variants,
            concat_query: expansion.concat_query,
            max_tokens,
            relevance_threshold: threshold,
            top_k: self.defaults.top_k,
        };

        // Parallel hybrid retrieval over the variant set.
        let variants = query.variant_set();
        let initial = self.retriever.retrieve(&variants, &query).await;
        if initial.is_empty() {
            tracing::warn!("retrieval returned nothing");
            return self.no_results_response(&request, query, start);
        }
        let initial_count = initial.len();

        // Rerank, or identity-convert when disabled.
        let reranked = if request.enable_rerank {
            self.reranker.rerank(&query.optimized_question, initial).await
        } else {
            Reranker::identity(initial)
        };
        let reranked_count = reranked.len();

        let filtered = self.filter.filter(
            reranked,
            &FilterParams {
                max_tokens,
                relevance_threshold: threshold,
                min_results: 1,
                preserve_diversity: true,
            },
        );
        if filtered.is_empty() {
            tracing::warn!("no results survived filtering");
            return self.no_results_response(&request, query, start);
        }

        // Conversation context for the conversational template.
        let conversation_history = if request.template_name == TEMPLATE_CONVERSATIONAL_RAG {
            match &request.session_id {
                Some(session_id) => {
                    match self.memory.get_recent_context(
                        session_id,
                        self.defaults.history_turns,
                        self.defaults.history_max_tokens,
                    ) {
                        Ok(context) => context,
                        Err(e) => {
                            tracing::error!("context read failed: {e}");
                            return self.error_response(&request, start);
                        }
                    }
                }
                None => String::new(),
            }
        } else {
            String::new()
        };

        // Generation. A model failure becomes a fixed apology, never an error.
        let prompt = self.templates.build(
            &request.template_name,
            &request.question,
            &filtered,
            &conversation_history,
        );
        let opts = GenerationOptions {
            temperature: 0.7,
            max_tokens: 2048,
        };
        let answer = match self.chat.complete(&prompt.system, &prompt.user, opts).await {
            Ok(answer) if !answer.trim().is_empty() => answer.trim().to_string(),
            Ok(_) => {
                tracing::warn!("model returned an empty answer");
                EMPTY_ANSWER_FALLBACK.to_string()
            }
            Err(e) => {
                tracing::error!("answer generation failed: {e}");
                GENERATION_FAILED_ANSWER.to_string()
            }
        };

        let processing_time = round3(start.elapsed().as_secs_f64());
        let tokens_used: usize = filtered.iter().map(|r| r.tokens).sum();
        let relevance = filtered.iter().map(|r| r.final_score as f64).sum::<f64>()
            / filtered.len() as f64;

        if let Some(session_id) = &request.session_id {
            self.memory.add_turn(
                session_id,
                &request.question,
                &answer,
                &filtered,
                tokens_used,
                relevance as f32,
                processing_time,
            );
        }

        tracing::info!(
            elapsed = processing_time,
            tokens = tokens_used,
            chunks = filtered.len(),
            "retrieval chain complete"
        );

        QueryResponse {
            question: request.question.clone(),
            answer,
            query_id: query.id.clone(),
            session_id: request.session_id.clone(),
            processing_time,
            tokens_used,
            relevance_score: round3(relevance),
            retrieved_chunks_count: filtered.len(),
            no_results: None,
            error: None,
            metadata: ResponseMetadata {
                processed_query: Some(query),
                retrieval_stats: Some(RetrievalStats {
                    initial_results: initial_count,
                    reranked_results: reranked_count,
                    filtered_results: filtered.len(),
                    rerank_enabled: request.enable_rerank,
                }),
                template_used: Some(request.template_name.clone()),
                processing_enabled: Some(ProcessingEnabled {
                    optimization: request.enable_optimization,
                    expansion: request.enable_expansion,
                    rerank: request.enable_rerank,
                }),
            },
        }
    }

    fn no_results_response(
        &self,
        request: &QueryRequest,
        query: Query,
        start: Instant,
    ) -> QueryResponse {
        QueryResponse {
            question: request.question.clone(),
            answer: NO_RESULTS_ANSWER.to_string(),
            query_id: query.id.clone(),
            session_id: request.session_id.clone(),
            processing_time: round3(start.elapsed().as_secs_f64()),
            tokens_used: 0,
            relevance_score: 0.0,
            retrieved_chunks_count: 0,
            no_results: Some(true),
            error: None,
            metadata: ResponseMetadata {
                processed_query: Some(query),
                ..Default::default()
            },
        }
    }

    fn error_response(&self, request: &QueryRequest, start: Instant) -> QueryResponse {
        QueryResponse {
            question: request.question.clone(),
            answer: "检索过程中发生错误，请稍后再试。".to_string(),
            query_id: String::new(),
            session_id: request.session_id.clone(),
            processing_time: round3(start.elapsed().as_secs_f64()),
            tokens_used: 0,
            relevance_score: 0.0,
            retrieved_chunks_count: 0,
            no_results: None,
            error: Some(true),
            metadata: ResponseMetadata::default(),
        }
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
