// Tokenization module
// Turns dataset prompts into token id sequences
//
// Uses tiktoken-rs (cl100k_base). The benchmark only needs stable token
// counts and ids to feed the backend, not a model-exact vocabulary.

use once_cell::sync::OnceCell;
use tiktoken_rs::CoreBPE;

use crate::error::{BenchError, Result};

/// Global tiktoken encoding (lazily initialized)
static ENCODING: OnceCell<CoreBPE> = OnceCell::new();

/// Get the tiktoken encoding (cl100k_base), initializing if needed
fn get_encoding() -> Result<&'static CoreBPE> {
    ENCODING.get_or_try_init(|| {
        tiktoken_rs::cl100k_base()
            .map_err(|e| BenchError::Dataset(format!("Failed to initialize tokenizer: {}", e)))
    })
}

/// Encodes text into token ids.
pub fn encode(text: &str) -> Result<Vec<u32>> {
    if text.is_empty() {
        return Ok(Vec::new());
    }

    let ids = get_encoding()?
        .encode_with_special_tokens(text)
        .into_iter()
        .map(|id| id as u32)
        .collect();

    Ok(ids)
}

/// Counts the number of tokens in text.
pub fn count_tokens(text: &str) -> Result<usize> {
    if text.is_empty() {
        return Ok(0);
    }
    Ok(get_encoding()?.encode_with_special_tokens(text).len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_empty() {
        assert!(encode("").unwrap().is_empty());
        assert_eq!(count_tokens("").unwrap(), 0);
    }

    #[test]
    fn test_encode_matches_count() {
        let text = "Hello, world! This is a throughput benchmark.";
        let ids = encode(text).unwrap();
        assert!(!ids.is_empty());
        assert_eq!(ids.len(), count_tokens(text).unwrap());
    }

    #[test]
    fn test_encode_is_deterministic() {
        let text = "The quick brown fox jumps over the lazy dog";
        assert_eq!(encode(text).unwrap(), encode(text).unwrap());
    }

    #[test]
    fn test_longer_text_has_more_tokens() {
        let short = count_tokens("hello").unwrap();
        let long = count_tokens("hello hello hello hello hello hello").unwrap();
        assert!(long > short);
    }
}
