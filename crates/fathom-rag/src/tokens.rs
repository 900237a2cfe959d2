//! Token accounting with a fixed BPE encoder.
//!
//! Uses the cl100k_base encoding for deterministic counts; when the encoder
//! cannot be constructed the counter degrades to a chars/4 estimate, logged
//! once at startup.

use tiktoken_rs::CoreBPE;

pub struct TokenCounter {
    bpe: Option<CoreBPE>,
}

impl TokenCounter {
    pub fn new() -> Self {
        match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Self { bpe: Some(bpe) },
            Err(e) => {
                tracing::warn!("cl100k encoder unavailable, using chars/4 estimate: {e}");
                Self { bpe: None }
            }
        }
    }

    pub fn count(&self, text: &str) -> usize {
        match &self.bpe {
            Some(bpe) => bpe.encode_ordinary(text).len(),
            None => estimate_tokens(text),
        }
    }

    pub fn has_encoder(&self) -> bool {
        self.bpe.is_some()
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// chars/4, rounded up — the fallback used wherever exact counts are not
/// worth an encoder pass (conversation context budgeting uses this too).
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn counter_is_deterministic() {
        let counter = TokenCounter::new();
        let a = counter.count("the quick brown fox jumps over the lazy dog");
        let b = counter.count("the quick brown fox jumps over the lazy dog");
        assert_eq!(a, b);
        assert!(a > 0);
    }

    #[test]
    fn empty_text_counts_zero() {
        let counter = TokenCounter::new();
        assert_eq!(counter.count(""), 0);
    }
}
