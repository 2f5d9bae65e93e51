//! Probe and training configuration
//!
//! Loaded from JSON with `serde`; every field has a default so partial files
//! work. The CLI overrides individual fields after loading.

use std::path::Path;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::alignment::AlignmentConfig;
use crate::experiment::TrainingConfig;
use crate::language::LanguageSet;
use crate::probe::ProbeKind;

/// Full configuration for a probing run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Which probe variant to build
    pub probe_kind: ProbeKind,
    /// Rank of the shared projection
    pub probe_rank: usize,
    /// Hidden size of the embedding model
    pub embedding_dim: usize,
    /// Languages that get their own linear map
    pub train_languages: Vec<String>,
    /// Encoder layer to read (negative counts from the last layer)
    pub layer_index: i64,
    pub batch_size: usize,
    pub epochs: usize,
    /// Sentences with at least this many words are dropped
    pub max_words: usize,
    /// Sentences with at least this many wordpieces (markers included) are dropped
    pub max_wordpieces: usize,
    pub learning_rate: f64,
    /// Epochs without validation improvement tolerated before stopping
    pub patience: usize,
    /// Minimum validation improvement that resets patience
    pub es_delta: f64,
    pub seed: u64,
    /// Hub model id or local directory with config.json, model.safetensors, tokenizer.json
    pub model: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            probe_kind: ProbeKind::Distance,
            probe_rank: 128,
            embedding_dim: 768,
            train_languages: vec!["en".to_string()],
            layer_index: -1,
            batch_size: 32,
            epochs: 40,
            max_words: 128,
            max_wordpieces: 128,
            learning_rate: 1e-3,
            patience: 5,
            es_delta: 1e-4,
            seed: 42,
            model: "bert-base-multilingual-cased".to_string(),
        }
    }
}

impl ProbeConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that would otherwise fail deep inside training
    pub fn validate(&self) -> Result<()> {
        ensure!(self.probe_rank > 0, "probe_rank must be positive");
        ensure!(self.embedding_dim > 0, "embedding_dim must be positive");
        ensure!(self.batch_size > 0, "batch_size must be positive");
        ensure!(self.max_words > 0, "max_words must be positive");
        ensure!(
            self.max_wordpieces > 2,
            "max_wordpieces must leave room for the two marker tokens"
        );
        ensure!(self.learning_rate > 0.0, "learning_rate must be positive");
        ensure!(self.es_delta >= 0.0, "es_delta must not be negative");
        self.languages()?;
        Ok(())
    }

    /// Resolve the configured training languages
    pub fn languages(&self) -> Result<LanguageSet> {
        LanguageSet::new(self.train_languages.iter().cloned())
    }

    /// Length limits for the sentence aligner
    pub fn alignment(&self) -> AlignmentConfig {
        AlignmentConfig {
            max_words: self.max_words,
            max_wordpieces: self.max_wordpieces,
            ..AlignmentConfig::default()
        }
    }

    /// Loop settings for the trainer
    pub fn training(&self) -> TrainingConfig {
        TrainingConfig {
            epochs: self.epochs,
            batch_size: self.batch_size,
            patience: self.patience,
            es_delta: self.es_delta,
            seed: self.seed,
        }
    }
}
