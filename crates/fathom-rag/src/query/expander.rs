//! Query expansion: reworded variants plus one merged "concat" query.
//!
//! Each variant comes from an independent chat call; variants that fail the
//! validity predicate are dropped silently. The concat query is a final
//! merge call, falling back to whitespace concatenation when the model's
//! merge is no longer than the original.

use std::collections::HashSet;
use std::sync::Arc;

use regex::Regex;

use crate::llm::{ChatModel, GenerationOptions};

const VARIANT_SYSTEM_PROMPT: &str = "你是一个查询扩展专家。请为用户的查询生成一个语义相关但表达不同的变体查询。

要求：
1. 保持与原查询相同的核心意图
2. 使用不同的表达方式或关键词
3. 可以从不同角度表述同一问题
4. 确保变体查询有助于检索到更多相关信息
5. 只输出变体查询，不要添加解释

示例：
原查询：如何提高学习效率？
变体：怎样增强学习效果？";

const CONCAT_SYSTEM_PROMPT: &str = "你是一个查询合并专家。请将多个相关查询合并成一个综合查询。

要求：
1. 合并所有查询的关键信息
2. 去除重复的概念和词汇
3. 保持查询的可读性和逻辑性
4. 确保合并后的查询涵盖原始查询的核心意图
5. 只输出合并后的查询，不要添加解释";

#[derive(Debug, Clone)]
pub struct ExpandedQuery {
    pub original: String,
    pub variants: Vec<String>,
    pub concat_query: String,
}

pub struct QueryExpander {
    chat: Arc<dyn ChatModel>,
    num_variants: usize,
    list_prefix: Regex,
}

impl QueryExpander {
    pub fn new(chat: Arc<dyn ChatModel>, num_variants: usize) -> Self {
        Self {
            chat,
            num_variants,
            list_prefix: Regex::new(r"^\d+[.、]\s*").expect("static regex"),
        }
    }

    pub async fn expand(&self, original: &str) -> ExpandedQuery {
        let mut variants: Vec<String> = Vec::new();

        for i in 0..self.num_variants {
            match self.generate_variant(original, i + 1).await {
                Ok(variant) => {
                    if is_valid_variant(original, &variant)
                        && !variants.iter().any(|v| v.eq_ignore_ascii_case(&variant))
                    {
                        variants.push(variant);
                    }
                }
                Err(e) => {
                    tracing::warn!(variant = i + 1, "variant generation failed: {e}");
                }
            }
        }

        let concat_query = self.generate_concat(original, &variants).await;

        tracing::debug!(count = variants.len(), "query expansion complete");
        ExpandedQuery {
            original: original.to_string(),
            variants,
            concat_query,
        }
    }

    async fn generate_variant(&self, original: &str, index: usize) -> crate::error::Result<String> {
        let user_prompt = format!("原始查询：{original}\n\n请生成变体查询{index}：");
        let opts = GenerationOptions {
            temperature: 0.3,
            max_tokens: 1024,
        };
        let raw = self
            .chat
            .complete(VARIANT_SYSTEM_PROMPT, &user_prompt, opts)
            .await?;
        Ok(self.clean_variant(&raw))
    }

    /// Models sometimes answer with a numbered list; take the first
    /// substantive line and strip the numbering.
    fn clean_variant(&self, raw: &str) -> String {
        for line in raw.lines() {
            let line = self.list_prefix.replace(line.trim(), "");
            let line = line.trim();
            if line.chars().count() > 5 {
                return line.to_string();
            }
        }
        raw.trim().to_string()
    }

    async fn generate_concat(&self, original: &str, variants: &[String]) -> String {
        if variants.is_empty() {
            return original.to_string();
        }

        let whitespace_concat = format!("{} {}", original, variants.join(" "));

        let mut numbered = vec![format!("1. {original}")];
        for (i, variant) in variants.iter().enumerate() {
            numbered.push(format!("{}. {}", i + 2, variant));
        }
        let user_prompt = format!("需要合并的查询：\n{}\n\n请生成一个合并查询：", numbered.join("\n"));

        let opts = GenerationOptions {
            temperature: 0.3,
            max_tokens: 1024,
        };
        match self.chat.complete(CONCAT_SYSTEM_PROMPT, &user_prompt, opts).await {
            Ok(merged) => {
                let merged = merged.trim();
                if merged.chars().count() > original.chars().count() {
                    merged.to_string()
                } else {
                    whitespace_concat
                }
            }
            Err(e) => {
                tracing::warn!("concat query generation failed: {e}");
                whitespace_concat
            }
        }
    }
}

/// A variant is usable iff it is non-empty, at least 5 chars, differs from
/// the original (case-insensitive), is no more than 3x the original's
/// length, and either overlaps the original's vocabulary by at most 0.8
/// (token Jaccard against the original's vocabulary) or grows it strictly.
pub fn is_valid_variant(original: &str, variant: &str) -> bool {
    let variant = variant.trim();
    if variant.is_empty() || variant.chars().count() < 5 {
        return false;
    }
    if variant.to_lowercase() == original.to_lowercase() {
        return false;
    }
    if variant.chars().count() > original.chars().count() * 3 {
        return false;
    }

    let original_words: HashSet<String> = original
        .to_lowercase()
        .split_whitespace()
        .map(|w| w.to_string())
        .collect();
    let variant_words: HashSet<String> = variant
        .to_lowercase()
        .split_whitespace()
        .map(|w| w.to_string())
        .collect();
    if original_words.is_empty() {
        return true;
    }

    let overlap = original_words.intersection(&variant_words).count();
    let overlap_ratio = overlap as f32 / original_words.len() as f32;
    if overlap_ratio > 0.8 && variant_words.len() <= original_words.len() {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RagError, Result};
    use crate::llm::ChatModel;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct ScriptedChat {
        replies: Mutex<Vec<Result<String>>>,
    }

    impl ScriptedChat {
        fn new(replies: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
            })
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedChat {
        async fn complete(
            &self,
            _system: &str,
            _user: &str,
            _opts: GenerationOptions,
        ) -> Result<String> {
            let mut replies = self.replies.lock();
            if replies.is_empty() {
                return Err(RagError::LlmFailure("script exhausted".into()));
            }
            replies.remove(0)
        }
    }

    #[test]
    fn validity_predicate() {
        let original = "how to improve learning efficiency";
        // Too short.
        assert!(!is_valid_variant(original, "hey"));
        // Same text, different case.
        assert!(!is_valid_variant(original, "How To Improve Learning Efficiency"));
        // Too long.
        let long = "x".repeat(original.chars().count() * 3 + 1);
        assert!(!is_valid_variant(original, &long));
        // High overlap without new vocabulary.
        assert!(!is_valid_variant(original, "how to improve learning"));
        // High overlap but strictly larger vocabulary.
        assert!(is_valid_variant(
            original,
            "how to improve learning efficiency and focus"
        ));
        // Genuinely reworded.
        assert!(is_valid_variant(original, "ways to study more effectively"));
    }

    #[tokio::test]
    async fn invalid_variants_dropped_silently() {
        let chat = ScriptedChat::new(vec![
            Ok("ways to study more effectively".into()),
            Ok("bad".into()),
            Ok("boost your study productivity".into()),
            // Concat call.
            Ok("how to improve learning efficiency, study effectively and boost productivity".into()),
        ]);
        let expander = QueryExpander::new(chat, 3);
        let expanded = expander.expand("how to improve learning efficiency").await;

        assert_eq!(expanded.variants.len(), 2);
        for variant in &expanded.variants {
            assert!(is_valid_variant(&expanded.original, variant));
        }
        assert!(expanded.concat_query.chars().count() > expanded.original.chars().count());
    }

    #[tokio::test]
    async fn short_concat_falls_back_to_whitespace_join() {
        let chat = ScriptedChat::new(vec![
            Ok("ways to study more effectively".into()),
            Err(RagError::LlmFailure("down".into())),
            Err(RagError::LlmFailure("down".into())),
            // Concat reply shorter than the original.
            Ok("study".into()),
        ]);
        let expander = QueryExpander::new(chat, 3);
        let expanded = expander.expand("how to improve learning efficiency").await;

        assert_eq!(expanded.variants.len(), 1);
        assert_eq!(
            expanded.concat_query,
            "how to improve learning efficiency ways to study more effectively"
        );
    }

    #[tokio::test]
    async fn total_failure_yields_original_only() {
        let chat = ScriptedChat::new(vec![]);
        let expander = QueryExpander::new(chat, 3);
        let expanded = expander.expand("any question at all").await;

        assert!(expanded.variants.is_empty());
        assert_eq!(expanded.concat_query, "any question at all");
        assert_eq!(expanded.original, "any question at all");
    }

    #[tokio::test]
    async fn numbered_list_reply_is_cleaned() {
        let chat = ScriptedChat::new(vec![
            Ok("1. ways to study more effectively\n2. another option".into()),
            Err(RagError::LlmFailure("down".into())),
            Err(RagError::LlmFailure("down".into())),
            Ok("a merged query that is long enough to win".into()),
        ]);
        let expander = QueryExpander::new(chat, 3);
        let expanded = expander.expand("how to improve learning efficiency").await;
        assert_eq!(expanded.variants, vec!["ways to study more effectively"]);
    }
}
