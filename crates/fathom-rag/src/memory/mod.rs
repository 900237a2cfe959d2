//! Per-session conversation memory.
//!
//! Turns are written durably to the metadata store; a bounded in-memory
//! cache accelerates reads. A session is live while its newest turn is
//! within the timeout window — stale sessions are evicted from the cache on
//! access and by a periodic sweep, but durable rows are never deleted.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::tokens::estimate_tokens;
use crate::types::{ChunkRef, ConversationTurn, RerankResult};

pub struct ConversationMemory {
    store: Arc<crate::storage::MetadataStore>,
    cache: DashMap<String, Vec<ConversationTurn>>,
    max_history: usize,
    session_timeout: Duration,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub total_turns: usize,
    pub total_tokens_used: usize,
    pub average_relevance_score: f32,
    pub average_response_time: f64,
    pub session_start: DateTime<Utc>,
    pub session_last_activity: DateTime<Utc>,
}

impl ConversationMemory {
    pub fn new(
        store: Arc<crate::storage::MetadataStore>,
        max_history: usize,
        session_timeout_hours: i64,
    ) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            max_history,
            session_timeout: Duration::hours(session_timeout_hours),
        }
    }

    /// Append a turn: durable write first, then the cache. Store failures
    /// are logged but do not fail the request that produced the answer.
    pub fn add_turn(
        &self,
        session_id: &str,
        question: &str,
        answer: &str,
        retrieved: &[RerankResult],
        tokens_used: usize,
        relevance_score: f32,
        response_time: f64,
    ) -> String {
        let turn = ConversationTurn {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            question: question.to_string(),
            answer: answer.to_string(),
            retrieved_chunks: retrieved
                .iter()
                .map(|r| ChunkRef {
                    data_id: r.data_id.clone(),
                    collection_id: r.collection_id.clone(),
                    final_score: r.final_score,
                })
                .collect(),
            timestamp: Utc::now(),
            tokens_used,
            relevance_score,
            response_time,
        };

        if let Err(e) = self.store.save_turn(&turn) {
            tracing::warn!(turn_id = %turn.id, "durable turn write failed: {e}");
        }

        let mut entry = self.cache.entry(session_id.to_string()).or_default();
        entry.push(turn.clone());
        let len = entry.len();
        if len > self.max_history {
            entry.drain(..len - self.max_history);
        }

        turn.id
    }

    /// Most recent `limit` turns in chronological order. Served from the
    /// cache while the session is live; stale cache entries are evicted on
    /// access and the durable store is consulted instead.
    pub fn get_history(&self, session_id: &str, limit: usize) -> Result<Vec<ConversationTurn>> {
        if let Some(cached) = self.cache.get(session_id) {
            if let Some(newest) = cached.last() {
                if self.is_live(newest.timestamp) {
                    let start = cached.len().saturating_sub(limit);
                    return Ok(cached[start..].to_vec());
                }
            }
            drop(cached);
            self.cache.remove(session_id);
        }

        let history = self.store.get_history(session_id, limit)?;
        let live: Vec<ConversationTurn> = history
            .into_iter()
            .filter(|turn| self.is_live(turn.timestamp))
            .collect();
        if !live.is_empty() {
            self.cache.insert(session_id.to_string(), live.clone());
        }
        Ok(live)
    }

    /// Newline-joined `Q:/A:` transcript of the most recent turns that fits
    /// under `max_tokens` (chars/4 estimate). Scans newest-first, emits
    /// oldest-first.
    pub fn get_recent_context(
        &self,
        session_id: &str,
        max_turns: usize,
        max_tokens: usize,
    ) -> Result<String> {
        let history = self.get_history(session_id, max_turns)?;
        if history.is_empty() {
            return Ok(String::new());
        }

        let mut parts: Vec<String> = Vec::new();
        let mut total_tokens = 0usize;
        for turn in history.iter().rev() {
            let text = format!("Q: {}\nA: {}", turn.question, turn.answer);
            let tokens = estimate_tokens(&text);
            if total_tokens + tokens > max_tokens {
                break;
            }
            total_tokens += tokens;
            parts.insert(0, text);
        }
        Ok(parts.join("\n\n"))
    }

    pub fn clear_session(&self, session_id: &str) {
        self.cache.remove(session_id);
    }

    /// Evict every cached session whose newest turn has gone stale.
    pub fn sweep_expired(&self) -> usize {
        let before = self.cache.len();
        self.cache.retain(|_, turns| {
            turns
                .last()
                .map(|turn| self.is_live(turn.timestamp))
                .unwrap_or(false)
        });
        let evicted = before - self.cache.len();
        if evicted > 0 {
            tracing::info!(evicted, "expired sessions evicted from memory cache");
        }
        evicted
    }

    pub fn session_summary(&self, session_id: &str) -> Result<Option<SessionSummary>> {
        let history = self.store.get_history(session_id, 100)?;
        if history.is_empty() {
            return Ok(None);
        }

        let total_tokens: usize = history.iter().map(|t| t.tokens_used).sum();
        let avg_relevance =
            history.iter().map(|t| t.relevance_score).sum::<f32>() / history.len() as f32;
        let avg_response =
            history.iter().map(|t| t.response_time).sum::<f64>() / history.len() as f64;
        let first = history.iter().map(|t| t.timestamp).min().unwrap_or_else(Utc::now);
        let last = history.iter().map(|t| t.timestamp).max().unwrap_or_else(Utc::now);

        Ok(Some(SessionSummary {
            session_id: session_id.to_string(),
            total_turns: history.len(),
            total_tokens_used: total_tokens,
            average_relevance_score: avg_relevance,
            average_response_time: avg_response,
            session_start: first,
            session_last_activity: last,
        }))
    }

    fn is_live(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp > Utc::now() - self.session_timeout
    }
}
