//! Token counting collaborator.
//!
//! No vendor tokenizer crate is a dependency of this core, so the counter is
//! modeled as a pluggable `Tokenizer` trait rather than a hardcoded call: a
//! deployment with a real vendor tokenizer can swap in its own impl. The
//! fallback `⌈words·2⌉` estimate is used for every flow except truncation
//! enforcement, where failure to tokenize means the original text is kept
//! unmodified.

/// A token counter a gateway can be built against. `estimate_tokens` must
/// never fail; `truncate_to_tokens` returns `None` on "already fits", not on
/// error, so a tokenizer that genuinely cannot truncate should simply return
/// its input unchanged via `Some`.
pub trait Tokenizer: Send + Sync {
    fn estimate_tokens(&self, text: &str) -> usize;
    fn truncate_to_tokens(&self, text: &str, max_tokens: usize) -> Option<String>;
}

/// Default tokenizer: `⌈words·2⌉`. Used everywhere a vendor tokenizer isn't
/// wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct WordCountTokenizer;

impl Tokenizer for WordCountTokenizer {
    fn estimate_tokens(&self, text: &str) -> usize {
        estimate_tokens(text)
    }

    fn truncate_to_tokens(&self, text: &str, max_tokens: usize) -> Option<String> {
        truncate_to_tokens(text, max_tokens)
    }
}

/// Estimate the token count of `text` using the word-count fallback.
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    let words = text.split_whitespace().count();
    words.saturating_mul(2)
}

/// Truncate `text` so its estimated token count is at most `max_tokens`.
///
/// Returns `None` if `text` already fits, signalling "keep the original
/// unmodified" to callers that only want to act on an actual truncation.
#[must_use]
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> Option<String> {
    if estimate_tokens(text) <= max_tokens {
        return None;
    }

    let allowed_words = max_tokens / 2;
    let truncated: Vec<&str> = text.split_whitespace().take(allowed_words).collect();
    Some(truncated.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens("one two three"), 6);
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn test_truncate_under_limit_is_none() {
        assert_eq!(truncate_to_tokens("a short sentence", 500), None);
    }

    #[test]
    fn test_word_count_tokenizer_matches_free_functions() {
        let t = WordCountTokenizer;
        assert_eq!(t.estimate_tokens("one two three"), estimate_tokens("one two three"));
        let long_text = (0..600).map(|i| i.to_string()).collect::<Vec<_>>().join(" ");
        assert_eq!(
            t.truncate_to_tokens(&long_text, 500),
            truncate_to_tokens(&long_text, 500)
        );
    }

    #[test]
    fn test_truncate_over_limit() {
        let long_text = (0..600).map(|i| i.to_string()).collect::<Vec<_>>().join(" ");
        let truncated = truncate_to_tokens(&long_text, 500).expect("should truncate");
        assert!(estimate_tokens(&truncated) <= 500);
    }
}
