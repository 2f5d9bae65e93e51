//! Shared fixtures for unit tests

use std::sync::Arc;

use anyhow::Result;
use candle_core::{Device, Tensor};

use crate::embedding::LookupEmbedder;
use crate::tokenizer::WordpieceTokenizer;

pub const TEST_VOCAB: usize = 1024;

/// Splits words into fixed-size character chunks (`##`-prefixed after the first).
///
/// A word ending in `-` is glued to the following word when a whole sentence
/// is tokenized, which makes joined and per-word tokenization disagree.
pub struct ChunkTokenizer {
    chunk: usize,
}

impl ChunkTokenizer {
    pub fn new(chunk: usize) -> Self {
        Self { chunk }
    }
}

impl WordpieceTokenizer for ChunkTokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<String>> {
        let glued = text.replace("- ", "-");
        let mut pieces = Vec::new();
        for word in glued.split_whitespace() {
            let chars: Vec<char> = word.chars().collect();
            for (i, chunk) in chars.chunks(self.chunk).enumerate() {
                let piece: String = chunk.iter().collect();
                if i == 0 {
                    pieces.push(piece);
                } else {
                    pieces.push(format!("##{piece}"));
                }
            }
        }
        Ok(pieces)
    }

    fn token_to_id(&self, piece: &str) -> Option<u32> {
        match piece {
            "[CLS]" => Some(1),
            "[SEP]" => Some(2),
            _ => {
                let hash = piece
                    .bytes()
                    .fold(2_166_136_261u32, |h, b| (h ^ u32::from(b)).wrapping_mul(16_777_619));
                Some(3 + hash % (TEST_VOCAB as u32 - 3))
            }
        }
    }
}

/// CoNLL-U text for `(form, head)` sentences; "." is tagged PUNCT
pub fn conllu(sentences: &[&[(&str, usize)]]) -> String {
    let mut out = String::new();
    for sentence in sentences {
        for (i, (form, head)) in sentence.iter().enumerate() {
            let pos = if *form == "." { "PUNCT" } else { "X" };
            out.push_str(&format!(
                "{}\t{}\t{}\t{}\t_\t_\t{}\tdep\t_\t_\n",
                i + 1,
                form,
                form.to_lowercase(),
                pos,
                head
            ));
        }
        out.push('\n');
    }
    out
}

/// Static embedder over a deterministic table of `TEST_VOCAB` rows
pub fn lookup_embedder(dim: usize) -> Arc<LookupEmbedder> {
    let values: Vec<f32> = (0..TEST_VOCAB * dim)
        .map(|i| ((i * 7919) % 211) as f32 / 211.0 - 0.5)
        .collect();
    let table = Tensor::from_vec(values, (TEST_VOCAB, dim), &Device::Cpu).unwrap();
    Arc::new(LookupEmbedder::new(table).unwrap())
}
