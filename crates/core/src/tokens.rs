use tiktoken_rs::{cl100k_base, get_bpe_from_model, CoreBPE};
use tracing::{debug, warn};

/// Counts tokens the way the embedding provider bills them.
///
/// OpenAI models (recorded as `openai:<model>`) use their tiktoken BPE encoding. Other
/// providers have no published tokenizer here and fall back to [`estimate_tokens`].
pub enum TokenCounter {
    Bpe(CoreBPE),
    Estimate,
}

impl TokenCounter {
    /// Loads the encoding for `model_name`. Building a BPE table is not cheap, so build one
    /// counter per indexing run rather than per chunk.
    pub fn for_model(model_name: &str) -> Self {
        let Some(model) = model_name.strip_prefix("openai:") else {
            return Self::Estimate;
        };

        let bpe = get_bpe_from_model(model).or_else(|error| {
            debug!(model, error = %error, "unknown OpenAI model, using cl100k_base");
            cl100k_base()
        });
        match bpe {
            Ok(bpe) => Self::Bpe(bpe),
            Err(error) => {
                warn!(model, error = %error, "tiktoken encoding unavailable, estimating tokens");
                Self::Estimate
            }
        }
    }

    pub fn count(&self, text: &str) -> u64 {
        match self {
            Self::Bpe(bpe) => bpe.encode_ordinary(text).len() as u64,
            Self::Estimate => estimate_tokens(text),
        }
    }
}

/// Approximate token count for providers without a known tokenizer.
///
/// Averages a ~4 characters per token estimate with the whitespace word count, which tracks
/// BPE tokenizers closely enough for English prose. Non-empty text counts as at least one token.
pub fn estimate_tokens(text: &str) -> u64 {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0;
    }

    let char_estimate = trimmed.chars().count() / 4;
    let word_count = trimmed.split_whitespace().count();
    ((char_estimate + word_count) / 2).max(1) as u64
}

#[cfg(test)]
mod tests {
    use super::{estimate_tokens, TokenCounter};

    #[test]
    fn blank_text_has_no_tokens() {
        assert_eq!(estimate_tokens("   "), 0);
    }

    #[test]
    fn short_text_counts_at_least_one_token() {
        assert_eq!(estimate_tokens("a"), 1);
    }

    #[test]
    fn prose_estimate_is_between_words_and_quarter_chars() {
        let text = "The quick brown fox jumps over the lazy dog";
        // 43 chars / 4 = 10, 9 words
        assert_eq!(estimate_tokens(text), 9);
    }

    #[test]
    fn openai_models_count_with_bpe() {
        let counter = TokenCounter::for_model("openai:text-embedding-3-small");
        assert!(matches!(counter, TokenCounter::Bpe(_)));
        assert_eq!(counter.count("hello world"), 2);
        assert_eq!(counter.count(""), 0);
    }

    #[test]
    fn unknown_openai_model_still_uses_bpe() {
        let counter = TokenCounter::for_model("openai:some-future-embedding");
        assert!(matches!(counter, TokenCounter::Bpe(_)));
    }

    #[test]
    fn other_providers_estimate() {
        let counter = TokenCounter::for_model("ollama:nomic-embed-text");
        assert!(matches!(counter, TokenCounter::Estimate));
        assert_eq!(counter.count("The quick brown fox jumps over the lazy dog"), 9);
        assert!(matches!(TokenCounter::for_model("hashed:64"), TokenCounter::Estimate));
    }
}
