//! Coreference resolution and context completion over conversation history.
//!
//! One low-temperature chat call rewrites the question so it stands alone:
//! pronouns become explicit entities and omitted topic context is filled in
//! from recent turns. Every failure path falls back to the original
//! question — this stage never fails the pipeline.

use std::sync::Arc;

use crate::llm::{ChatModel, GenerationOptions};
use crate::types::ConversationTurn;

const OPTIMIZER_SYSTEM_PROMPT: &str = "你是一个专业的查询优化助手。你的任务是根据对话历史，优化当前的用户问题，使其更加清晰、完整和独立。

优化原则：
1. 指代消除：将\"它\"、\"这个\"、\"那个\"等指代词替换为具体的实体名称
2. 上下文补全：根据对话历史补充缺失的关键信息
3. 保持原意：确保优化后的问题与原问题意图完全一致
4. 独立理解：优化后的问题应该能够独立理解，不依赖对话历史

注意事项：
- 只输出优化后的问题，不要添加任何解释
- 如果原问题已经很清晰完整，可以直接返回原问题
- 不要改变问题的核心意图和要求";

pub struct QueryOptimizer {
    chat: Arc<dyn ChatModel>,
    max_history: usize,
}

impl QueryOptimizer {
    pub fn new(chat: Arc<dyn ChatModel>) -> Self {
        Self {
            chat,
            max_history: 3,
        }
    }

    pub async fn optimize(&self, question: &str, history: &[ConversationTurn]) -> String {
        if history.is_empty() {
            return question.to_string();
        }

        let context = self.build_context(history);
        let user_prompt = format!(
            "对话历史：\n{context}\n\n当前问题：\n{question}\n\n请根据对话历史优化当前问题，使其更加清晰、完整和独立："
        );

        let opts = GenerationOptions {
            temperature: 0.1,
            max_tokens: 512,
        };
        match self.chat.complete(OPTIMIZER_SYSTEM_PROMPT, &user_prompt, opts).await {
            Ok(rewritten) => {
                let rewritten = rewritten.trim();
                let original_len = question.chars().count();
                let rewritten_len = rewritten.chars().count();
                // A rewrite that lost most of the question is a bad rewrite.
                if rewritten.is_empty() || (rewritten_len as f32) < 0.8 * original_len as f32 {
                    tracing::debug!("query rewrite rejected, keeping original");
                    question.to_string()
                } else {
                    tracing::debug!(original = %question, rewritten = %rewritten, "query optimized");
                    rewritten.to_string()
                }
            }
            Err(e) => {
                tracing::warn!("query optimization failed, keeping original: {e}");
                question.to_string()
            }
        }
    }

    fn build_context(&self, history: &[ConversationTurn]) -> String {
        let recent = if history.len() > self.max_history {
            &history[history.len() - self.max_history..]
        } else {
            history
        };
        let mut parts = Vec::with_capacity(recent.len() * 2);
        for (i, turn) in recent.iter().enumerate() {
            parts.push(format!("Q{}: {}", i + 1, turn.question));
            parts.push(format!("A{}: {}", i + 1, turn.answer));
        }
        parts.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RagError, Result};
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;

    pub struct ScriptedChat {
        pub replies: Mutex<Vec<Result<String>>>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedChat {
        pub fn new(replies: Vec<Result<String>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedChat {
        async fn complete(
            &self,
            _system: &str,
            user: &str,
            _opts: GenerationOptions,
        ) -> Result<String> {
            self.prompts.lock().push(user.to_string());
            let mut replies = self.replies.lock();
            if replies.is_empty() {
                return Err(RagError::LlmFailure("script exhausted".into()));
            }
            replies.remove(0)
        }
    }

    fn turn(question: &str, answer: &str) -> ConversationTurn {
        ConversationTurn {
            id: "t".into(),
            session_id: "s".into(),
            question: question.into(),
            answer: answer.into(),
            retrieved_chunks: Vec::new(),
            timestamp: Utc::now(),
            tokens_used: 0,
            relevance_score: 0.0,
            response_time: 0.0,
        }
    }

    #[tokio::test]
    async fn no_history_returns_original_without_llm_call() {
        let chat = Arc::new(ScriptedChat::new(vec![Ok("should not be used".into())]));
        let optimizer = QueryOptimizer::new(chat.clone());
        let out = optimizer.optimize("它是什么时候发布的", &[]).await;
        assert_eq!(out, "它是什么时候发布的");
        assert!(chat.prompts.lock().is_empty());
    }

    #[tokio::test]
    async fn rewrite_accepted_when_long_enough() {
        let chat = Arc::new(ScriptedChat::new(vec![Ok(
            "Rust 1.0 是什么时候发布的".into()
        )]));
        let optimizer = QueryOptimizer::new(chat);
        let history = vec![turn("介绍一下 Rust", "Rust 是一门系统编程语言")];
        let out = optimizer.optimize("它是什么时候发布的", &history).await;
        assert_eq!(out, "Rust 1.0 是什么时候发布的");
    }

    #[tokio::test]
    async fn short_rewrite_rejected() {
        let chat = Arc::new(ScriptedChat::new(vec![Ok("何时".into())]));
        let optimizer = QueryOptimizer::new(chat);
        let history = vec![turn("q", "a")];
        let out = optimizer.optimize("它是什么时候发布的", &history).await;
        assert_eq!(out, "它是什么时候发布的");
    }

    #[tokio::test]
    async fn llm_failure_falls_back() {
        let chat = Arc::new(ScriptedChat::new(vec![Err(RagError::BackendTimeout(
            std::time::Duration::from_secs(60),
        ))]));
        let optimizer = QueryOptimizer::new(chat);
        let history = vec![turn("q", "a")];
        let out = optimizer.optimize("原始问题内容", &history).await;
        assert_eq!(out, "原始问题内容");
    }

    #[tokio::test]
    async fn context_window_keeps_most_recent_turns() {
        let chat = Arc::new(ScriptedChat::new(vec![Ok(
            "一个足够长的改写问题用于通过校验".into(),
        )]));
        let optimizer = QueryOptimizer::new(chat.clone());
        let history: Vec<ConversationTurn> = (0..5)
            .map(|i| turn(&format!("question {i}"), &format!("answer {i}")))
            .collect();
        optimizer.optimize("当前的问题是什么呢", &history).await;

        let prompts = chat.prompts.lock();
        assert!(prompts[0].contains("question 4"));
        assert!(!prompts[0].contains("question 0"));
    }
}
