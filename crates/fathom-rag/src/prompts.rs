//! Prompt templates for answer generation.
//!
//! Two templates: `basic_rag` embeds the retrieved context in the system
//! turn; `conversational_rag` additionally carries a formatted history
//! transcript. Unknown template names fall back to `basic_rag`.

use crate::types::RerankResult;

pub const TEMPLATE_BASIC_RAG: &str = "basic_rag";
pub const TEMPLATE_CONVERSATIONAL_RAG: &str = "conversational_rag";

const NO_CONTEXT_SENTINEL: &str = "暂无相关信息。";
const CONVERSATION_START_SENTINEL: &str = "这是对话的开始。";

/// A fully rendered prompt: the system turn and the user turn.
#[derive(Debug, Clone)]
pub struct RagPrompt {
    pub system: String,
    pub user: String,
}

pub struct PromptTemplates;

impl PromptTemplates {
    pub fn new() -> Self {
        Self
    }

    pub fn available(&self) -> Vec<&'static str> {
        vec![TEMPLATE_BASIC_RAG, TEMPLATE_CONVERSATIONAL_RAG]
    }

    pub fn build(
        &self,
        template_name: &str,
        question: &str,
        results: &[RerankResult],
        conversation_history: &str,
    ) -> RagPrompt {
        let context = format_context(results);
        match template_name {
            TEMPLATE_CONVERSATIONAL_RAG => {
                let history = if conversation_history.is_empty() {
                    CONVERSATION_START_SENTINEL
                } else {
                    conversation_history
                };
                RagPrompt {
                    system: format!(
                        "你是一个智能对话助手。请根据提供的上下文信息和对话历史来回答用户的问题。

回答要求：
1. 考虑对话历史，保持对话的连贯性
2. 优先使用提供的上下文信息
3. 如果当前问题与之前的对话相关，要体现这种关联
4. 保持友好、自然的对话语调
5. 如果信息不足，可以询问用户更多细节

对话历史：
{history}

当前上下文信息：
{context}

请基于对话历史和上下文信息回答用户的当前问题。"
                    ),
                    user: format!("当前问题：{question}"),
                }
            }
            other => {
                if other != TEMPLATE_BASIC_RAG {
                    tracing::warn!(template = other, "unknown template, using basic_rag");
                }
                RagPrompt {
                    system: format!(
                        "你是一个专业的知识问答助手。请根据提供的上下文信息来回答用户的问题。

回答要求：
1. 优先使用提供的上下文信息
2. 如果上下文不包含相关信息，请说明无法从提供的信息中找到答案
3. 保持回答准确、简洁、有用
4. 可以进行合理的推理，但要基于提供的信息
5. 如果问题需要实时信息或个人意见，请说明这些限制

上下文信息：
{context}

请基于以上信息回答用户的问题。"
                    ),
                    user: format!("问题：{question}"),
                }
            }
        }
    }
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self::new()
    }
}

/// Render the included records as numbered context entries, blank-line
/// separated. An empty result set renders as a fixed sentinel.
pub fn format_context(results: &[RerankResult]) -> String {
    if results.is_empty() {
        return NO_CONTEXT_SENTINEL.to_string();
    }

    let mut entries = Vec::with_capacity(results.len());
    for (i, result) in results.iter().enumerate() {
        let mut entry = format!(
            "[信息 {}]\n内容：{}\n相关性：{:.2}",
            i + 1,
            result.content,
            result.final_score
        );
        if let Some(title) = result.metadata.get("title").and_then(|v| v.as_str()) {
            entry.push_str(&format!("\n来源：{title}"));
        }
        entries.push(entry);
    }
    entries.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Metadata;
    use serde_json::json;

    fn record(content: &str, score: f32, title: Option<&str>) -> RerankResult {
        let mut metadata = Metadata::new();
        if let Some(title) = title {
            metadata.insert("title".into(), json!(title));
        }
        RerankResult {
            data_id: "d".into(),
            collection_id: "c".into(),
            content: content.into(),
            original_score: score,
            rerank_score: score,
            final_score: score,
            metadata,
            tokens: 1,
        }
    }

    #[test]
    fn context_entries_are_numbered_with_scores() {
        let context = format_context(&[
            record("first chunk", 0.876, None),
            record("second chunk", 0.5, Some("notes")),
        ]);
        assert!(context.starts_with("[信息 1]\n内容：first chunk\n相关性：0.88"));
        assert!(context.contains("[信息 2]"));
        assert!(context.contains("来源：notes"));
        assert!(context.contains("\n\n"));
    }

    #[test]
    fn empty_context_renders_sentinel() {
        assert_eq!(format_context(&[]), "暂无相关信息。");
    }

    #[test]
    fn basic_template_embeds_context_in_system() {
        let prompt = PromptTemplates::new().build(
            TEMPLATE_BASIC_RAG,
            "什么是所有权",
            &[record("chunk", 0.9, None)],
            "",
        );
        assert!(prompt.system.contains("chunk"));
        assert_eq!(prompt.user, "问题：什么是所有权");
    }

    #[test]
    fn conversational_template_carries_history() {
        let templates = PromptTemplates::new();
        let prompt = templates.build(
            TEMPLATE_CONVERSATIONAL_RAG,
            "然后呢",
            &[record("chunk", 0.9, None)],
            "Q: 第一问\nA: 第一答",
        );
        assert!(prompt.system.contains("Q: 第一问"));
        assert_eq!(prompt.user, "当前问题：然后呢");

        let empty_history = templates.build(TEMPLATE_CONVERSATIONAL_RAG, "q", &[], "");
        assert!(empty_history.system.contains("这是对话的开始。"));
    }

    #[test]
    fn unknown_template_falls_back_to_basic() {
        let prompt = PromptTemplates::new().build("fancy_rag", "q", &[], "");
        assert!(prompt.user.starts_with("问题："));
    }
}
