//! Structural probes over frozen embeddings
//!
//! A distance probe learns one shared low-rank projection `B` and one square
//! map `M_l` per training language so that, for words `i` and `j` of a
//! sentence in language `l`,
//!
//! ```text
//! || B M_l (h_i - h_j) ||^2  ~  tree_distance(i, j)
//! ```
//!
//! Word vectors `h` are the mean of their wordpiece embeddings. Only the
//! projection and the batch language's map receive updates.

use std::sync::Arc;

use anyhow::{bail, ensure, Result};
use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ProbeConfig;
use crate::dataset::Batch;
use crate::embedding::EmbeddingProvider;
use crate::language::{LanguageId, LanguageSet};
use crate::masks::create_pair_mask;

/// Probe variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// Pairwise squared distances against gold tree distances
    #[default]
    Distance,
    /// Per-word squared norms against gold tree depths
    Depth,
}

impl ProbeKind {
    /// Construct the probe for this variant
    pub fn build(
        self,
        config: &ProbeConfig,
        languages: &LanguageSet,
        embedder: Arc<dyn EmbeddingProvider>,
        device: &Device,
    ) -> Result<Box<dyn StructuralProbe>> {
        match self {
            Self::Distance => Ok(Box::new(DistanceProbe::new(
                config,
                languages.len(),
                embedder,
                device,
            )?)),
            Self::Depth => bail!("The depth probe is not implemented"),
        }
    }
}

/// Copy of every trainable parameter, used for early-stopping restores
#[derive(Debug, Clone)]
pub struct ProbeWeights {
    pub projection: Tensor,
    pub maps: Vec<Tensor>,
}

/// Operations shared by all probe variants
pub trait StructuralProbe {
    fn kind(&self) -> ProbeKind;

    /// Predicted structure for a batch; `[batch, words, words]` for distances
    fn forward(&self, batch: &Batch) -> Result<Tensor>;

    /// Scalar loss tensor of a prediction against the batch's gold target
    fn loss(&self, predicted: &Tensor, batch: &Batch) -> Result<Tensor>;

    /// One optimizer step on `batch`; returns the loss before the step
    fn train_on_batch(&mut self, batch: &Batch) -> Result<f32>;

    /// Loss on `batch` without touching parameters
    fn evaluate_on_batch(&self, batch: &Batch) -> Result<f32> {
        let predicted = self.forward(batch)?.detach();
        Ok(self.loss(&predicted, batch)?.to_scalar::<f32>()?)
    }

    fn snapshot(&self) -> Result<ProbeWeights>;

    fn restore(&mut self, weights: &ProbeWeights) -> Result<()>;
}

/// Mean of the wordpiece embeddings of each word
///
/// `embeddings`: `[batch, seq, dim]`, `segments`: `[batch, seq]` i64 holding
/// the word index of each position or a negative sentinel. Returns
/// `[batch, num_words, dim]`; words without any wordpiece are zero vectors.
pub fn segment_mean(embeddings: &Tensor, segments: &Tensor, num_words: usize) -> Result<Tensor> {
    let (batch, seq, dim) = embeddings.dims3()?;
    let (seg_batch, seg_len) = segments.dims2()?;
    ensure!(
        seg_batch == batch && seg_len == seq,
        "Segment map [{seg_batch}, {seg_len}] does not match embeddings [{batch}, {seq}]"
    );

    let slots = batch * num_words;
    // Sentinels and out-of-range ids land in one extra slot that is dropped
    let discard = slots;
    let mut counts = vec![0f32; slots];
    let mut index = Vec::with_capacity(batch * seq);
    for (b, row) in segments.to_vec2::<i64>()?.iter().enumerate() {
        for &segment in row {
            let slot = match usize::try_from(segment) {
                Ok(word) if word < num_words => b * num_words + word,
                _ => discard,
            };
            if slot != discard {
                counts[slot] += 1.0;
            }
            index.push(slot as u32);
        }
    }

    let device = embeddings.device();
    let index = Tensor::from_vec(index, batch * seq, device)?;
    let flat = embeddings.reshape((batch * seq, dim))?;
    let summed = Tensor::zeros((slots + 1, dim), embeddings.dtype(), device)?
        .index_add(&index, &flat, 0)?
        .narrow(0, 0, slots)?;

    let counts: Vec<f32> = counts.into_iter().map(|c| c.max(1.0)).collect();
    let counts = Tensor::from_vec(counts, (slots, 1), device)?.to_dtype(embeddings.dtype())?;
    Ok(summed
        .broadcast_div(&counts)?
        .reshape((batch, num_words, dim))?)
}

/// All-pairs squared Euclidean distances: `[batch, words, rank]` → `[batch, words, words]`
pub fn pairwise_squared_distances(vectors: &Tensor) -> Result<Tensor> {
    vectors.dims3()?;
    let rows = vectors.unsqueeze(1)?;
    let cols = rows.transpose(1, 2)?;
    Ok(rows.broadcast_sub(&cols)?.sqr()?.sum(D::Minus1)?)
}

/// Length-normalised L1 loss between predicted and gold distance matrices
///
/// Only pairs inside each sentence's true length count. Each sentence's sum is
/// divided by its squared length and the result is averaged over the batch.
pub fn distance_loss(predicted: &Tensor, gold: &Tensor, token_len: &[usize]) -> Result<Tensor> {
    let (batch, words, words2) = predicted.dims3()?;
    ensure!(words == words2, "Predicted distances must be square per sentence");
    ensure!(
        gold.dims() == predicted.dims(),
        "Gold distances {:?} do not match predictions {:?}",
        gold.dims(),
        predicted.dims()
    );
    ensure!(
        token_len.len() == batch,
        "Got {} sentence lengths for a batch of {batch}",
        token_len.len()
    );
    ensure!(
        token_len.iter().all(|&n| n > 0),
        "Sentences in a batch must have at least one word"
    );

    let device = predicted.device();
    let mask = create_pair_mask(token_len, words, device)?.to_dtype(predicted.dtype())?;
    let per_sentence = (predicted - gold)?.abs()?.mul(&mask)?.sum((1, 2))?;
    let squared: Vec<f32> = token_len.iter().map(|&n| (n * n) as f32).collect();
    let squared = Tensor::from_vec(squared, batch, device)?.to_dtype(predicted.dtype())?;
    Ok(per_sentence.div(&squared)?.mean_all()?)
}

/// Glorot-uniform `[rows, cols]` matrix from a seeded generator
fn glorot_uniform(rows: usize, cols: usize, seed: u64, device: &Device) -> Result<Tensor> {
    let limit = (6.0 / (rows + cols) as f64).sqrt() as f32;
    let mut rng = StdRng::seed_from_u64(seed);
    let values: Vec<f32> = (0..rows * cols)
        .map(|_| rng.gen_range(-limit..=limit))
        .collect();
    Ok(Tensor::from_vec(values, (rows, cols), device)?)
}

/// Distance probe with a shared projection and per-language maps
pub struct DistanceProbe {
    embedder: Arc<dyn EmbeddingProvider>,
    projection: Var,
    maps: Vec<Var>,
    optimizer: AdamW,
    rank: usize,
    embedding_dim: usize,
}

impl DistanceProbe {
    /// Build with Glorot-initialised projection and identity language maps
    pub fn new(
        config: &ProbeConfig,
        n_languages: usize,
        embedder: Arc<dyn EmbeddingProvider>,
        device: &Device,
    ) -> Result<Self> {
        ensure!(n_languages > 0, "A probe needs at least one language");
        ensure!(
            embedder.hidden_size() == config.embedding_dim,
            "embedding_dim is {} but the embedding model produces {}-dimensional vectors",
            config.embedding_dim,
            embedder.hidden_size()
        );

        let rank = config.probe_rank;
        let dim = config.embedding_dim;
        let projection = Var::from_tensor(&glorot_uniform(rank, dim, config.seed, device)?)?;
        let maps = (0..n_languages)
            .map(|_| Ok(Var::from_tensor(&Tensor::eye(dim, DType::F32, device)?)?))
            .collect::<Result<Vec<_>>>()?;

        let mut vars = vec![projection.clone()];
        vars.extend(maps.iter().cloned());
        let optimizer = AdamW::new(
            vars,
            ParamsAdamW {
                lr: config.learning_rate,
                weight_decay: 0.0,
                ..Default::default()
            },
        )?;

        debug!("Distance probe: rank {rank}, dim {dim}, {n_languages} language map(s)");

        Ok(Self {
            embedder,
            projection,
            maps,
            optimizer,
            rank,
            embedding_dim: dim,
        })
    }

    /// Current shared projection `[rank, dim]`
    pub fn projection(&self) -> &Tensor {
        self.projection.as_tensor()
    }

    /// Current map of one language `[dim, dim]`
    pub fn language_map(&self, language: LanguageId) -> Option<&Tensor> {
        self.maps.get(language.index()).map(Var::as_tensor)
    }

    fn map_for(&self, language: LanguageId) -> Result<&Var> {
        match self.maps.get(language.index()) {
            Some(map) => Ok(map),
            None => bail!(
                "Batch language {} has no map (probe has {})",
                language.index(),
                self.maps.len()
            ),
        }
    }
}

impl StructuralProbe for DistanceProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::Distance
    }

    fn forward(&self, batch: &Batch) -> Result<Tensor> {
        let embeddings = self.embedder.embed(&batch.wordpieces)?.detach();
        let (_, _, dim) = embeddings.dims3()?;
        ensure!(
            dim == self.embedding_dim,
            "Embeddings have dimension {dim}, probe expects {}",
            self.embedding_dim
        );

        let words = segment_mean(&embeddings, &batch.segments, batch.max_token_len)?;
        let (b, w, d) = words.dims3()?;
        let map = self.map_for(batch.language)?;

        let mapped = words.reshape((b * w, d))?.matmul(map.as_tensor())?;
        let projection_t = self.projection.as_tensor().t()?.contiguous()?;
        let projected = mapped.matmul(&projection_t)?.reshape((b, w, self.rank))?;
        pairwise_squared_distances(&projected)
    }

    fn loss(&self, predicted: &Tensor, batch: &Batch) -> Result<Tensor> {
        distance_loss(predicted, &batch.target, &batch.token_len)
    }

    fn train_on_batch(&mut self, batch: &Batch) -> Result<f32> {
        let predicted = self.forward(batch)?;
        let loss = self.loss(&predicted, batch)?;

        let mut grads = loss.backward()?;
        let active = batch.language.index();
        for (idx, map) in self.maps.iter().enumerate() {
            if idx != active {
                grads.remove(map.as_tensor());
            }
        }
        self.optimizer.step(&grads)?;

        Ok(loss.to_scalar::<f32>()?)
    }

    fn snapshot(&self) -> Result<ProbeWeights> {
        Ok(ProbeWeights {
            projection: self.projection.as_tensor().copy()?,
            maps: self
                .maps
                .iter()
                .map(|m| Ok(m.as_tensor().copy()?))
                .collect::<Result<_>>()?,
        })
    }

    fn restore(&mut self, weights: &ProbeWeights) -> Result<()> {
        ensure!(
            weights.maps.len() == self.maps.len(),
            "Snapshot has {} language maps, probe has {}",
            weights.maps.len(),
            self.maps.len()
        );
        self.projection.set(&weights.projection)?;
        for (map, saved) in self.maps.iter().zip(&weights.maps) {
            map.set(saved)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::{align_corpus, AlignmentConfig};
    use crate::corpus::Corpus;
    use crate::dataset::LanguageData;
    use crate::embedding::LookupEmbedder;
    use crate::testing::{conllu, lookup_embedder, ChunkTokenizer, TEST_VOCAB};

    const DIM: usize = 8;

    fn config() -> ProbeConfig {
        ProbeConfig {
            probe_rank: 4,
            embedding_dim: DIM,
            train_languages: vec!["en".into(), "de".into()],
            learning_rate: 0.01,
            ..Default::default()
        }
    }

    fn data(language: LanguageId, sentences: &[&[(&str, usize)]]) -> LanguageData {
        let corpus = Corpus::parse(&conllu(sentences), "test").unwrap();
        let aligned = align_corpus(
            &corpus,
            &ChunkTokenizer::new(2),
            &AlignmentConfig {
                max_wordpieces: 16,
                ..Default::default()
            },
        )
        .unwrap();
        LanguageData::new(language, aligned)
    }

    fn probe(embedder: Arc<dyn EmbeddingProvider>) -> (LanguageSet, DistanceProbe) {
        let config = config();
        let languages = config.languages().unwrap();
        let probe = DistanceProbe::new(&config, languages.len(), embedder, &Device::Cpu).unwrap();
        (languages, probe)
    }

    const SENTENCES: &[&[(&str, usize)]] = &[
        &[("the", 2), ("dog", 3), ("barks", 0)],
        &[("cats", 0), ("sleep", 1)],
        &[("a", 2), ("big", 3), ("red", 4), ("ball", 0)],
    ];

    #[test]
    fn test_forward_symmetric_with_zero_diagonal() {
        let (languages, probe) = probe(lookup_embedder(DIM));
        let en = languages.resolve("en").unwrap();
        let batch = data(en, SENTENCES).batch(&[0, 1, 2], &Device::Cpu).unwrap();

        let distances = probe.forward(&batch).unwrap();
        assert_eq!(distances.dims(), &[3, 4, 4]);
        for matrix in distances.to_vec3::<f32>().unwrap() {
            for i in 0..4 {
                assert_eq!(matrix[i][i], 0.0);
                for j in 0..4 {
                    assert!((matrix[i][j] - matrix[j][i]).abs() < 1e-5);
                    assert!(matrix[i][j] >= 0.0);
                }
            }
        }
    }

    #[test]
    fn test_identical_embeddings_give_zero_distances() {
        let table = Tensor::ones((TEST_VOCAB, DIM), DType::F32, &Device::Cpu).unwrap();
        let embedder = Arc::new(LookupEmbedder::new(table).unwrap());
        let (languages, probe) = probe(embedder);
        let en = languages.resolve("en").unwrap();
        let batch = data(en, SENTENCES).batch(&[2], &Device::Cpu).unwrap();

        let distances = probe.forward(&batch).unwrap();
        let values: Vec<f32> = distances.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_segment_mean_pools_and_zero_fills() {
        let device = Device::Cpu;
        let embeddings = Tensor::new(
            &[[[9f32, 9.], [1., 2.], [3., 4.], [5., 6.], [9., 9.]]],
            &device,
        )
        .unwrap();
        let segments = Tensor::new(&[[-1i64, 0, 0, 1, -1]], &device).unwrap();
        let pooled = segment_mean(&embeddings, &segments, 3).unwrap();
        assert_eq!(pooled.dims(), &[1, 3, 2]);
        let pooled = pooled.to_vec3::<f32>().unwrap();
        assert_eq!(pooled[0][0], vec![2.0, 3.0]);
        assert_eq!(pooled[0][1], vec![5.0, 6.0]);
        assert_eq!(pooled[0][2], vec![0.0, 0.0]);
    }

    #[test]
    fn test_loss_invariant_to_batch_order() {
        let (languages, probe) = probe(lookup_embedder(DIM));
        let en = languages.resolve("en").unwrap();
        let data = data(en, SENTENCES);

        let forward = data.batch(&[0, 1, 2], &Device::Cpu).unwrap();
        let shuffled = data.batch(&[2, 0, 1], &Device::Cpu).unwrap();
        let a = probe.evaluate_on_batch(&forward).unwrap();
        let b = probe.evaluate_on_batch(&shuffled).unwrap();
        assert!((a - b).abs() < 1e-5, "{a} vs {b}");
    }

    #[test]
    fn test_loss_sensitive_to_word_order() {
        let device = Device::Cpu;
        // A=(0,0) B=(1,0) C=(0,0.5), gold chain A-B-C
        let words = Tensor::new(&[[[0f32, 0.], [1., 0.], [0., 0.5]]], &device).unwrap();
        let permuted = Tensor::new(&[[[1f32, 0.], [0., 0.], [0., 0.5]]], &device).unwrap();
        let gold = Tensor::new(&[[[0f32, 1., 2.], [1., 0., 1.], [2., 1., 0.]]], &device).unwrap();

        let original = distance_loss(&pairwise_squared_distances(&words).unwrap(), &gold, &[3])
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let swapped = distance_loss(&pairwise_squared_distances(&permuted).unwrap(), &gold, &[3])
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();

        assert!((original - 4.0 / 9.0).abs() < 1e-5);
        assert!((swapped - 3.0 / 9.0).abs() < 1e-5);
    }

    #[test]
    fn test_loss_invariant_to_matching_word_and_gold_permutation() {
        let device = Device::Cpu;
        let words = Tensor::new(&[[[0f32, 0.], [1., 0.], [0., 0.5]]], &device).unwrap();
        let gold = Tensor::new(&[[[0f32, 1., 2.], [1., 0., 1.], [2., 1., 0.]]], &device).unwrap();
        // order B, A, C with gold rows and columns swapped the same way
        let permuted = Tensor::new(&[[[1f32, 0.], [0., 0.], [0., 0.5]]], &device).unwrap();
        let permuted_gold =
            Tensor::new(&[[[0f32, 1., 1.], [1., 0., 2.], [1., 2., 0.]]], &device).unwrap();

        let original = distance_loss(&pairwise_squared_distances(&words).unwrap(), &gold, &[3])
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let both = distance_loss(
            &pairwise_squared_distances(&permuted).unwrap(),
            &permuted_gold,
            &[3],
        )
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();

        assert!((original - 4.0 / 9.0).abs() < 1e-5);
        assert!((both - original).abs() < 1e-6, "{original} vs {both}");
    }

    #[test]
    fn test_loss_ignores_padded_pairs() {
        let device = Device::Cpu;
        let predicted = Tensor::new(&[[[0f32, 1., 7.], [1., 0., 7.], [7., 7., 0.]]], &device).unwrap();
        let gold = Tensor::new(&[[[0f32, 1., 0.], [1., 0., 0.], [0., 0., 0.]]], &device).unwrap();
        let loss = distance_loss(&predicted, &gold, &[2])
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(loss, 0.0);
    }

    #[test]
    fn test_training_leaves_other_language_maps_untouched() {
        let (languages, mut probe) = probe(lookup_embedder(DIM));
        let en = languages.resolve("en").unwrap();
        let de = languages.resolve("de").unwrap();
        let batch = data(en, SENTENCES).batch(&[0, 1, 2], &Device::Cpu).unwrap();

        let de_before = probe.language_map(de).unwrap().to_vec2::<f32>().unwrap();
        let en_before = probe.language_map(en).unwrap().to_vec2::<f32>().unwrap();
        let proj_before = probe.projection().to_vec2::<f32>().unwrap();

        for _ in 0..3 {
            probe.train_on_batch(&batch).unwrap();
        }

        assert_eq!(
            probe.language_map(de).unwrap().to_vec2::<f32>().unwrap(),
            de_before
        );
        assert_ne!(
            probe.language_map(en).unwrap().to_vec2::<f32>().unwrap(),
            en_before
        );
        assert_ne!(probe.projection().to_vec2::<f32>().unwrap(), proj_before);
    }

    #[test]
    fn test_language_maps_start_as_identity() {
        let (languages, probe) = probe(lookup_embedder(DIM));
        for (id, _) in languages.iter() {
            let map = probe.language_map(id).unwrap().to_vec2::<f32>().unwrap();
            assert_eq!(map.len(), DIM);
            for (i, row) in map.iter().enumerate() {
                for (j, &v) in row.iter().enumerate() {
                    assert_eq!(v, if i == j { 1.0 } else { 0.0 });
                }
            }
        }
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let (languages, mut probe) = probe(lookup_embedder(DIM));
        let en = languages.resolve("en").unwrap();
        let batch = data(en, SENTENCES).batch(&[0, 1], &Device::Cpu).unwrap();

        let saved = probe.snapshot().unwrap();
        let before = probe.evaluate_on_batch(&batch).unwrap();
        probe.train_on_batch(&batch).unwrap();
        probe.restore(&saved).unwrap();
        let after = probe.evaluate_on_batch(&batch).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_projection_is_seeded() {
        let (_, a) = probe(lookup_embedder(DIM));
        let (_, b) = probe(lookup_embedder(DIM));
        assert_eq!(
            a.projection().to_vec2::<f32>().unwrap(),
            b.projection().to_vec2::<f32>().unwrap()
        );
        let limit = (6.0f32 / (4 + DIM) as f32).sqrt();
        let values: Vec<f32> = a.projection().flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| v.abs() <= limit));
    }

    #[test]
    fn test_build_rejects_depth_and_dimension_mismatch() {
        let config = config();
        let languages = config.languages().unwrap();
        let depth = ProbeKind::Depth.build(&config, &languages, lookup_embedder(DIM), &Device::Cpu);
        assert!(depth.is_err());

        let wrong = ProbeKind::Distance.build(&config, &languages, lookup_embedder(DIM + 1), &Device::Cpu);
        assert!(wrong.is_err());

        let ok = ProbeKind::Distance
            .build(&config, &languages, lookup_embedder(DIM), &Device::Cpu)
            .unwrap();
        assert_eq!(ok.kind(), ProbeKind::Distance);
    }
}
