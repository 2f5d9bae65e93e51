//! Wordpiece tokenization
//!
//! The aligner only needs two things from a tokenizer: split text into
//! sub-word pieces, and map a piece to its vocabulary id. [`WordpieceTokenizer`]
//! captures that; [`HfWordpieceTokenizer`] implements it on top of the
//! `tokenizers` crate.

use std::path::Path;

use anyhow::{anyhow, Result};
use tokenizers::Tokenizer;

use crate::embedding::resolve_model_file;

/// Sub-word tokenizer used by the sentence aligner
pub trait WordpieceTokenizer {
    /// Split `text` into wordpieces, without special tokens
    fn tokenize(&self, text: &str) -> Result<Vec<String>>;

    /// Vocabulary id of a single piece
    fn token_to_id(&self, piece: &str) -> Option<u32>;

    /// Map pieces to vocabulary ids, failing on out-of-vocabulary pieces
    fn convert_tokens_to_ids(&self, pieces: &[String]) -> Result<Vec<u32>> {
        pieces
            .iter()
            .map(|piece| {
                self.token_to_id(piece)
                    .ok_or_else(|| anyhow!("Wordpiece '{piece}' is not in the vocabulary"))
            })
            .collect()
    }
}

/// Hugging Face `tokenizers` wordpiece tokenizer
pub struct HfWordpieceTokenizer {
    tokenizer: Tokenizer,
}

impl HfWordpieceTokenizer {
    pub fn new(tokenizer: Tokenizer) -> Self {
        Self { tokenizer }
    }

    /// Load `tokenizer.json` from a file path
    pub fn from_file(path: &Path) -> Result<Self> {
        let tokenizer =
            Tokenizer::from_file(path).map_err(|e| anyhow!("Tokenizer error: {e}"))?;
        Ok(Self::new(tokenizer))
    }

    /// Load the tokenizer that ships with a model (local directory or hub id)
    pub fn from_model(model: &str) -> Result<Self> {
        let path = resolve_model_file(model, "tokenizer.json")?;
        Self::from_file(&path)
    }
}

impl WordpieceTokenizer for HfWordpieceTokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<String>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow!("Tokenization error: {e}"))?;
        Ok(encoding.get_tokens().to_vec())
    }

    fn token_to_id(&self, piece: &str) -> Option<u32> {
        self.tokenizer.token_to_id(piece)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Fixed(HashMap<String, u32>);

    impl WordpieceTokenizer for Fixed {
        fn tokenize(&self, text: &str) -> Result<Vec<String>> {
            Ok(text.split_whitespace().map(str::to_string).collect())
        }

        fn token_to_id(&self, piece: &str) -> Option<u32> {
            self.0.get(piece).copied()
        }
    }

    #[test]
    fn test_convert_tokens_to_ids() {
        let vocab = HashMap::from([("a".to_string(), 5), ("b".to_string(), 7)]);
        let tok = Fixed(vocab);
        let ids = tok
            .convert_tokens_to_ids(&["a".to_string(), "b".to_string()])
            .unwrap();
        assert_eq!(ids, vec![5, 7]);
        assert!(tok.convert_tokens_to_ids(&["zzz".to_string()]).is_err());
    }

    #[test]
    #[ignore = "requires model download"]
    fn test_hf_tokenizer_splits_wordpieces() {
        let tok = HfWordpieceTokenizer::from_model("bert-base-multilingual-cased").unwrap();
        let pieces = tok.tokenize("unbelievably").unwrap();
        assert!(!pieces.is_empty());
        assert!(tok.token_to_id("[CLS]").is_some());
    }
}
