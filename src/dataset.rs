//! Aligned dependency data grouped by language, and mini-batching
//!
//! Every batch holds sentences of a single language so the probe can apply
//! one language map to the whole batch.

use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Result};
use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::info;

use crate::alignment::{align_corpus, AlignedCorpus, AlignmentConfig};
use crate::corpus::Corpus;
use crate::language::{LanguageId, LanguageSet};
use crate::tokenizer::WordpieceTokenizer;
use crate::tree::tree_distances;

/// One mini-batch of aligned sentences of a single language
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[batch, max_wordpieces]` u32
    pub wordpieces: Tensor,
    /// `[batch, max_wordpieces]` i64, `-1` outside words
    pub segments: Tensor,
    /// Largest word count in the batch; every sentence is pooled to this many slots
    pub max_token_len: usize,
    /// True word count per sentence
    pub token_len: Vec<usize>,
    /// Gold tree distances `[batch, max_token_len, max_token_len]`, zero padded
    pub target: Tensor,
    pub language: LanguageId,
    /// Positions of these sentences in their aligned corpus
    pub sentence_indices: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.token_len.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_len.is_empty()
    }
}

/// Aligned sentences and gold distances for one language
#[derive(Debug, Clone)]
pub struct LanguageData {
    pub language: LanguageId,
    pub aligned: AlignedCorpus,
    /// Gold distance matrix per surviving sentence
    pub gold: Vec<Vec<Vec<f32>>>,
}

impl LanguageData {
    pub fn new(language: LanguageId, aligned: AlignedCorpus) -> Self {
        let gold = aligned
            .corpus
            .relations()
            .iter()
            .map(|relations| tree_distances(relations))
            .collect();
        Self {
            language,
            aligned,
            gold,
        }
    }

    pub fn len(&self) -> usize {
        self.aligned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aligned.is_empty()
    }

    /// Assemble the sentences at `indices` into a batch
    pub fn batch(&self, indices: &[usize], device: &Device) -> Result<Batch> {
        ensure!(!indices.is_empty(), "Cannot build an empty batch");
        let width = self.aligned.width();
        let records: Vec<_> = indices
            .iter()
            .map(|&i| {
                self.aligned
                    .records
                    .get(i)
                    .ok_or_else(|| anyhow::anyhow!("Sentence {i} out of range"))
            })
            .collect::<Result<_>>()?;

        let token_len: Vec<usize> = records.iter().map(|r| r.word_count).collect();
        let words = token_len.iter().copied().max().unwrap_or(0);
        ensure!(words > 0, "Batch contains only empty sentences");

        let ids: Vec<u32> = records
            .iter()
            .flat_map(|r| r.wordpiece_ids.iter().copied())
            .collect();
        let segments: Vec<i64> = records
            .iter()
            .flat_map(|r| r.segments.iter().copied())
            .collect();

        let mut target = vec![0f32; indices.len() * words * words];
        for (slot, &i) in indices.iter().enumerate() {
            let gold = &self.gold[i];
            let base = slot * words * words;
            for (row, values) in gold.iter().enumerate() {
                let start = base + row * words;
                target[start..start + values.len()].copy_from_slice(values);
            }
        }

        let n = indices.len();
        Ok(Batch {
            wordpieces: Tensor::from_vec(ids, (n, width), device)?,
            segments: Tensor::from_vec(segments, (n, width), device)?,
            max_token_len: words,
            token_len,
            target: Tensor::from_vec(target, (n, words, words), device)?,
            language: self.language,
            sentence_indices: indices.to_vec(),
        })
    }
}

/// Train, validation, or test portion of a dataset
#[derive(Debug, Clone)]
pub struct DatasetSplit {
    languages: Vec<LanguageData>,
    device: Device,
}

impl DatasetSplit {
    pub fn new(device: Device) -> Self {
        Self {
            languages: Vec::new(),
            device,
        }
    }

    /// Add one language's data; each language may appear once
    pub fn push(&mut self, data: LanguageData) -> Result<()> {
        if self.languages.iter().any(|l| l.language == data.language) {
            bail!("Language {:?} was given more than once", data.language);
        }
        self.languages.push(data);
        self.languages.sort_by_key(|l| l.language);
        Ok(())
    }

    /// Align in-memory corpora and collect them into a split
    pub fn from_corpora<T: WordpieceTokenizer + ?Sized>(
        corpora: Vec<(LanguageId, Corpus)>,
        tokenizer: &T,
        config: &AlignmentConfig,
        device: &Device,
    ) -> Result<Self> {
        let mut split = Self::new(device.clone());
        for (language, corpus) in corpora {
            let aligned = align_corpus(&corpus, tokenizer, config)?;
            split.push(LanguageData::new(language, aligned))?;
        }
        Ok(split)
    }

    /// Load `language=path` CoNLL-U files
    pub fn load<T: WordpieceTokenizer + ?Sized>(
        files: &[(String, PathBuf)],
        languages: &LanguageSet,
        tokenizer: &T,
        config: &AlignmentConfig,
        device: &Device,
    ) -> Result<Self> {
        let corpora = files
            .iter()
            .map(|(name, path)| {
                let language = languages.resolve(name)?;
                let corpus = Corpus::load(Path::new(path))?;
                info!(
                    "Loaded {} sentences for {} from {}",
                    corpus.len(),
                    name,
                    path.display()
                );
                Ok((language, corpus))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_corpora(corpora, tokenizer, config, device)
    }

    /// Per-language data in language-id order
    pub fn languages(&self) -> &[LanguageData] {
        &self.languages
    }

    pub fn language(&self, id: LanguageId) -> Option<&LanguageData> {
        self.languages.iter().find(|l| l.language == id)
    }

    /// Total surviving sentences across languages
    pub fn len(&self) -> usize {
        self.languages.iter().map(LanguageData::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Training batches: sentences shuffled within each language, then
    /// single-language batches shuffled across languages
    pub fn train_batches<'a, R: Rng + ?Sized>(
        &'a self,
        batch_size: usize,
        rng: &mut R,
    ) -> impl Iterator<Item = Result<Batch>> + 'a {
        let mut plans: Vec<(usize, Vec<usize>)> = Vec::new();
        for (slot, data) in self.languages.iter().enumerate() {
            let mut order: Vec<usize> = (0..data.len()).collect();
            order.shuffle(rng);
            for chunk in order.chunks(batch_size.max(1)) {
                plans.push((slot, chunk.to_vec()));
            }
        }
        plans.shuffle(rng);

        plans
            .into_iter()
            .map(move |(slot, indices)| self.languages[slot].batch(&indices, &self.device))
    }

    /// Evaluation batches of one language, in corpus order
    pub fn evaluate_batches(
        &self,
        batch_size: usize,
        language: LanguageId,
    ) -> impl Iterator<Item = Result<Batch>> + '_ {
        let data = self.language(language);
        let n = data.map_or(0, LanguageData::len);
        let step = batch_size.max(1);
        (0..n).step_by(step).filter_map(move |start| {
            let indices: Vec<usize> = (start..(start + step).min(n)).collect();
            data.map(|d| d.batch(&indices, &self.device))
        })
    }
}

/// Training split plus optional validation split
#[derive(Debug, Clone)]
pub struct DependencyDataset {
    pub train: DatasetSplit,
    pub dev: Option<DatasetSplit>,
}

impl DependencyDataset {
    /// Load and align all files; `dev_files` may be empty
    pub fn load<T: WordpieceTokenizer + ?Sized>(
        train_files: &[(String, PathBuf)],
        dev_files: &[(String, PathBuf)],
        languages: &LanguageSet,
        tokenizer: &T,
        config: &AlignmentConfig,
        device: &Device,
    ) -> Result<Self> {
        let train = DatasetSplit::load(train_files, languages, tokenizer, config, device)?;
        ensure!(!train.is_empty(), "Training data is empty after alignment");
        let dev = if dev_files.is_empty() {
            None
        } else {
            Some(DatasetSplit::load(
                dev_files, languages, tokenizer, config, device,
            )?)
        };
        Ok(Self { train, dev })
    }
}
