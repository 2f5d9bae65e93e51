//! Wordpiece-to-word alignment
//!
//! Turns corpus sentences into fixed-length model inputs:
//!
//! - a wordpiece-id sequence wrapped in `[CLS]` ... `[SEP]` and right-padded with id 0
//! - a segment map of the same length, holding the zero-based word index of every
//!   wordpiece, or [`SEGMENT_SENTINEL`] for the markers and padding
//! - the number of words
//!
//! Sentences that exceed the length limits, or whose joined tokenization
//! disagrees with word-by-word tokenization, are dropped. Alignment never
//! mutates its input: it builds a new corpus snapshot and returns the list of
//! rejections next to it.

use std::collections::BTreeSet;
use std::fmt;

use anyhow::{ensure, Result};
use candle_core::{Device, Tensor};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::corpus::Corpus;
use crate::tokenizer::WordpieceTokenizer;

/// Segment value for positions that belong to no word
pub const SEGMENT_SENTINEL: i64 = -1;

/// Vocabulary id used to right-pad wordpiece sequences
pub const PAD_ID: u32 = 0;

/// Length limits and marker tokens for the aligner
#[derive(Debug, Clone)]
pub struct AlignmentConfig {
    /// Sentences with `word_count >= max_words` are rejected
    pub max_words: usize,
    /// Sentences with `wordpieces >= max_wordpieces` are rejected; also the padded width
    pub max_wordpieces: usize,
    pub begin_marker: String,
    pub end_marker: String,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            max_words: 128,
            max_wordpieces: 128,
            begin_marker: "[CLS]".to_string(),
            end_marker: "[SEP]".to_string(),
        }
    }
}

/// Why a sentence was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RejectionReason {
    TooManyWords { words: usize, limit: usize },
    TooManyWordpieces { wordpieces: usize, limit: usize },
    /// Word-by-word tokenization produced a different number of pieces than
    /// tokenizing the joined sentence
    AlignmentMismatch { joined: usize, per_word: usize },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyWords { words, limit } => {
                write!(f, "too many words ({words} >= {limit})")
            }
            Self::TooManyWordpieces { wordpieces, limit } => {
                write!(f, "too many wordpieces ({wordpieces} >= {limit})")
            }
            Self::AlignmentMismatch { joined, per_word } => write!(
                f,
                "mismatch in number of wordpieces (joined {joined}, per word {per_word})"
            ),
        }
    }
}

/// A dropped sentence, kept for auditing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    /// Index in the corpus as read from disk
    pub sentence_index: usize,
    /// File the sentence came from
    pub source: String,
    pub reason: RejectionReason,
}

/// Model input for one surviving sentence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignmentRecord {
    /// Vocabulary ids, padded with [`PAD_ID`] to the configured width
    pub wordpiece_ids: Vec<u32>,
    /// Word index per wordpiece position, [`SEGMENT_SENTINEL`] elsewhere
    pub segments: Vec<i64>,
    pub word_count: usize,
}

impl AlignmentRecord {
    /// Number of wordpiece positions assigned to each word.
    ///
    /// Segment ids outside `0..word_count` are not counted.
    pub fn pieces_per_word(&self) -> Vec<usize> {
        let mut counts = vec![0; self.word_count];
        for &segment in &self.segments {
            let slot = usize::try_from(segment)
                .ok()
                .and_then(|word| counts.get_mut(word));
            if let Some(count) = slot {
                *count += 1;
            }
        }
        counts
    }
}

/// Outcome of aligning a single sentence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentenceAlignment {
    Aligned(AlignmentRecord),
    Rejected(RejectionReason),
}

/// Align one sentence (its surface forms, in order).
///
/// Errors only come from the tokenizer itself; a sentence that cannot be
/// aligned is reported as [`SentenceAlignment::Rejected`].
pub fn align_sentence<T: WordpieceTokenizer + ?Sized>(
    tokens: &[String],
    tokenizer: &T,
    config: &AlignmentConfig,
) -> Result<SentenceAlignment> {
    let mut wordpieces = Vec::with_capacity(tokens.len() + 2);
    wordpieces.push(config.begin_marker.clone());
    wordpieces.extend(tokenizer.tokenize(&tokens.join(" "))?);
    wordpieces.push(config.end_marker.clone());

    if tokens.len() >= config.max_words {
        return Ok(SentenceAlignment::Rejected(RejectionReason::TooManyWords {
            words: tokens.len(),
            limit: config.max_words,
        }));
    }
    if wordpieces.len() >= config.max_wordpieces {
        return Ok(SentenceAlignment::Rejected(
            RejectionReason::TooManyWordpieces {
                wordpieces: wordpieces.len(),
                limit: config.max_wordpieces,
            },
        ));
    }

    // Each word is re-tokenized on its own to find how many positions it owns
    let pieces_per_word = tokens
        .iter()
        .map(|token| Ok(tokenizer.tokenize(token)?.len()))
        .collect::<Result<Vec<usize>>>()?;

    // begin marker + all word pieces + end marker must reproduce the joined length
    let wordpiece_pointer = 1 + pieces_per_word.iter().sum::<usize>();
    if wordpiece_pointer + 1 != wordpieces.len() {
        return Ok(SentenceAlignment::Rejected(
            RejectionReason::AlignmentMismatch {
                joined: wordpieces.len() - 2,
                per_word: wordpiece_pointer - 1,
            },
        ));
    }

    let mut segments = vec![SEGMENT_SENTINEL; config.max_wordpieces];
    let mut pointer = 1;
    for (segment_id, &count) in pieces_per_word.iter().enumerate() {
        segments[pointer..pointer + count].fill(segment_id as i64);
        pointer += count;
    }

    let mut wordpiece_ids = tokenizer.convert_tokens_to_ids(&wordpieces)?;
    wordpiece_ids.resize(config.max_wordpieces, PAD_ID);

    Ok(SentenceAlignment::Aligned(AlignmentRecord {
        wordpiece_ids,
        segments,
        word_count: tokens.len(),
    }))
}

/// A corpus after alignment filtering
#[derive(Debug, Clone)]
pub struct AlignedCorpus {
    /// Surviving sentences; index `i` here matches `records[i]`
    pub corpus: Corpus,
    pub records: Vec<AlignmentRecord>,
    /// Dropped sentences, in corpus order
    pub rejections: Vec<Rejection>,
    width: usize,
}

impl AlignedCorpus {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Padded wordpiece width of every record
    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of segments (words) per sentence
    pub fn max_segment(&self) -> Vec<usize> {
        self.records.iter().map(|r| r.word_count).collect()
    }

    /// Stack all records into model-ready tensors.
    ///
    /// Returns `(wordpiece_ids [N, W] u32, segments [N, W] i64, segment_counts [N] i64)`.
    pub fn stack(&self, device: &Device) -> Result<(Tensor, Tensor, Tensor)> {
        let n = self.records.len();
        let ids: Vec<u32> = self
            .records
            .iter()
            .flat_map(|r| r.wordpiece_ids.iter().copied())
            .collect();
        let segments: Vec<i64> = self
            .records
            .iter()
            .flat_map(|r| r.segments.iter().copied())
            .collect();
        let counts: Vec<i64> = self.records.iter().map(|r| r.word_count as i64).collect();

        Ok((
            Tensor::from_vec(ids, (n, self.width), device)?,
            Tensor::from_vec(segments, (n, self.width), device)?,
            Tensor::from_vec(counts, n, device)?,
        ))
    }
}

/// Align every sentence of a corpus, dropping the ones that cannot be aligned
pub fn align_corpus<T: WordpieceTokenizer + ?Sized>(
    corpus: &Corpus,
    tokenizer: &T,
    config: &AlignmentConfig,
) -> Result<AlignedCorpus> {
    ensure!(
        config.max_wordpieces > 2,
        "max_wordpieces must leave room for the marker tokens"
    );

    let mut records = Vec::with_capacity(corpus.len());
    let mut rejections = Vec::new();
    let mut removed = BTreeSet::new();

    for (idx, tokens) in corpus.tokens().iter().enumerate() {
        match align_sentence(tokens, tokenizer, config)? {
            SentenceAlignment::Aligned(record) => records.push(record),
            SentenceAlignment::Rejected(reason) => {
                warn!(
                    "Sentence {} in file {}: {}, skipping",
                    idx,
                    corpus.source(),
                    reason
                );
                removed.insert(idx);
                rejections.push(Rejection {
                    sentence_index: idx,
                    source: corpus.source().to_string(),
                    reason,
                });
            }
        }
    }

    let surviving = corpus.without(&removed);
    debug_assert_eq!(surviving.len(), records.len());

    info!(
        "Aligned {}/{} sentences from {} ({} rejected)",
        records.len(),
        corpus.len(),
        corpus.source(),
        rejections.len()
    );
    debug!("Rejections: {:?}", rejections);

    Ok(AlignedCorpus {
        corpus: surviving,
        records,
        rejections,
        width: config.max_wordpieces,
    })
}
