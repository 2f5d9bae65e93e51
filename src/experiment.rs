//! Training and evaluation loop for structural probes
//!
//! Coordinates shuffled multi-language training, per-epoch validation, and
//! early stopping with best-weight restore.

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dataset::{DatasetSplit, DependencyDataset};
use crate::language::LanguageId;
use crate::probe::{ProbeWeights, StructuralProbe};

/// Loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Maximum number of passes over the training split
    pub epochs: usize,
    pub batch_size: usize,
    /// Epochs without validation improvement tolerated before stopping
    pub patience: usize,
    /// Minimum decrease of the validation loss that counts as improvement
    pub es_delta: f64,
    /// Seed for batch shuffling
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 40,
            batch_size: 32,
            patience: 5,
            es_delta: 1e-4,
            seed: 42,
        }
    }
}

/// Where the training loop is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TrainingState {
    NotStarted,
    Running { epoch: usize },
    Finished { epochs_run: usize, stopped_early: bool },
}

/// Losses of one epoch
#[derive(Debug, Clone, Serialize)]
pub struct EpochRecord {
    pub epoch: usize,
    /// Mean training batch loss
    pub train_loss: f32,
    /// Mean per-language validation loss, if a validation split exists
    pub dev_loss: Option<f32>,
}

/// Outcome of [`train`]
#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub epochs: Vec<EpochRecord>,
    pub best_epoch: Option<usize>,
    pub best_dev_loss: Option<f32>,
    pub state: TrainingState,
}

impl TrainingReport {
    pub fn epochs_run(&self) -> usize {
        match self.state {
            TrainingState::Finished { epochs_run, .. } => epochs_run,
            _ => self.epochs.len(),
        }
    }

    pub fn stopped_early(&self) -> bool {
        matches!(
            self.state,
            TrainingState::Finished {
                stopped_early: true,
                ..
            }
        )
    }
}

/// Mean loss of one language
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LanguageLoss {
    pub language: LanguageId,
    pub loss: f32,
}

/// Per-language mean losses and their mean
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub per_language: Vec<LanguageLoss>,
    pub mean: f32,
}

/// Train `probe` on `dataset.train`, validating on `dataset.dev` when present
pub fn train(
    probe: &mut dyn StructuralProbe,
    dataset: &DependencyDataset,
    config: &TrainingConfig,
) -> Result<TrainingReport> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut state = TrainingState::NotStarted;
    debug!("Training state: {:?}", state);

    let validation = dataset.dev.as_ref().filter(|dev| !dev.is_empty());
    let mut epochs = Vec::with_capacity(config.epochs);
    let mut best = f64::INFINITY;
    let mut best_epoch = None;
    let mut best_weights: Option<ProbeWeights> = None;
    let mut stale = 0usize;

    info!(
        "Training on {} sentences for up to {} epochs",
        dataset.train.len(),
        config.epochs
    );

    for epoch in 0..config.epochs {
        state = TrainingState::Running { epoch };

        let mut total = 0.0f64;
        let mut batches = 0usize;
        for batch in dataset.train.train_batches(config.batch_size, &mut rng) {
            let batch = batch?;
            total += f64::from(probe.train_on_batch(&batch)?);
            batches += 1;
        }
        let train_loss = if batches == 0 {
            0.0
        } else {
            (total / batches as f64) as f32
        };

        let dev_loss = match validation {
            Some(dev) => Some(evaluate(&*probe, dev, config.batch_size)?.mean),
            None => None,
        };

        match dev_loss {
            Some(dev) => info!("Epoch {epoch}: train loss {train_loss:.4}, dev loss {dev:.4}"),
            None => info!("Epoch {epoch}: train loss {train_loss:.4}"),
        }
        epochs.push(EpochRecord {
            epoch,
            train_loss,
            dev_loss,
        });

        let Some(dev_loss) = dev_loss else { continue };
        if f64::from(dev_loss) < best - config.es_delta {
            best = f64::from(dev_loss);
            best_epoch = Some(epoch);
            best_weights = Some(probe.snapshot()?);
            stale = 0;
        } else {
            stale += 1;
            if stale > config.patience {
                if let Some(weights) = &best_weights {
                    probe.restore(weights)?;
                }
                info!(
                    "Early stopping after epoch {epoch}; restored weights from epoch {}",
                    best_epoch.map_or_else(|| "-".to_string(), |e| e.to_string())
                );
                state = TrainingState::Finished {
                    epochs_run: epoch + 1,
                    stopped_early: true,
                };
                break;
            }
        }
    }

    if !matches!(state, TrainingState::Finished { .. }) {
        state = TrainingState::Finished {
            epochs_run: epochs.len(),
            stopped_early: false,
        };
    }
    debug!("Training state: {:?}", state);

    Ok(TrainingReport {
        epochs,
        best_epoch,
        best_dev_loss: best_epoch.map(|_| best as f32),
        state,
    })
}

/// Mean batch loss of one language, without updates
pub fn evaluate_language(
    probe: &dyn StructuralProbe,
    split: &DatasetSplit,
    language: LanguageId,
    batch_size: usize,
) -> Result<f32> {
    let mut total = 0.0f64;
    let mut batches = 0usize;
    for batch in split.evaluate_batches(batch_size, language) {
        total += f64::from(probe.evaluate_on_batch(&batch?)?);
        batches += 1;
    }
    if batches == 0 {
        bail!("No evaluation data for language {}", language.index());
    }
    Ok((total / batches as f64) as f32)
}

/// Evaluate every language present in `split`
pub fn evaluate(
    probe: &dyn StructuralProbe,
    split: &DatasetSplit,
    batch_size: usize,
) -> Result<EvaluationReport> {
    let mut per_language = Vec::with_capacity(split.languages().len());
    for (ordinal, data) in split.languages().iter().enumerate() {
        if data.is_empty() {
            continue;
        }
        let loss = evaluate_language(probe, split, data.language, batch_size)?;
        debug!("Language #{ordinal} ({}): loss {loss:.4}", data.language.index());
        per_language.push(LanguageLoss {
            language: data.language,
            loss,
        });
    }
    if per_language.is_empty() {
        bail!("Nothing to evaluate: every language split is empty");
    }
    let mean = per_language.iter().map(|l| l.loss).sum::<f32>() / per_language.len() as f32;
    Ok(EvaluationReport { per_language, mean })
}
