//! Undirected unlabeled attachment score (UUAS)
//!
//! Predicted distances are decoded into a minimum spanning tree over the
//! non-punctuation words of each sentence; its edges are compared with the
//! gold undirected edges.

use std::collections::HashSet;

use anyhow::{ensure, Context, Result};
use serde::Serialize;

use crate::corpus::unordered;
use crate::dataset::DatasetSplit;
use crate::language::LanguageId;
use crate::probe::{ProbeKind, StructuralProbe};

/// Edge counts accumulated over sentences
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UuasResults {
    /// Predicted edges that are also gold edges
    pub correct: usize,
    /// Gold edges
    pub total: usize,
}

impl UuasResults {
    pub fn uuas(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }

    pub fn add(&mut self, other: UuasResults) {
        self.correct += other.correct;
        self.total += other.total;
    }
}

/// Prim's algorithm over `nodes` (0-based word indices) of a distance matrix.
///
/// Returns undirected edges as sorted 1-based word ids.
pub fn minimum_spanning_edges(distances: &[Vec<f32>], nodes: &[usize]) -> HashSet<(usize, usize)> {
    let mut edges = HashSet::new();
    if nodes.len() < 2 {
        return edges;
    }

    let mut in_tree = vec![false; nodes.len()];
    let mut best = vec![f32::INFINITY; nodes.len()];
    let mut parent = vec![0usize; nodes.len()];
    best[0] = 0.0;

    for _ in 0..nodes.len() {
        let mut next = None;
        for k in 0..nodes.len() {
            if !in_tree[k] && next.map_or(true, |n: usize| best[k] < best[n]) {
                next = Some(k);
            }
        }
        let Some(u) = next else { break };
        in_tree[u] = true;
        if u != 0 {
            edges.insert(unordered(nodes[u] + 1, nodes[parent[u]] + 1));
        }
        for v in 0..nodes.len() {
            if in_tree[v] {
                continue;
            }
            let d = distances[nodes[u]][nodes[v]];
            if d < best[v] {
                best[v] = d;
                parent[v] = u;
            }
        }
    }
    edges
}

/// Score one sentence's predicted distances against its gold edges
pub fn sentence_uuas(
    predicted: &[Vec<f32>],
    punctuation_mask: &[bool],
    gold: &HashSet<(usize, usize)>,
) -> UuasResults {
    let nodes: Vec<usize> = punctuation_mask
        .iter()
        .enumerate()
        .filter(|(i, keep)| **keep && *i < predicted.len())
        .map(|(i, _)| i)
        .collect();
    let predicted_edges = minimum_spanning_edges(predicted, &nodes);
    UuasResults {
        correct: predicted_edges.intersection(gold).count(),
        total: gold.len(),
    }
}

/// UUAS of a distance probe on one language of a split
pub fn evaluate_uuas(
    probe: &dyn StructuralProbe,
    split: &DatasetSplit,
    language: LanguageId,
    batch_size: usize,
) -> Result<UuasResults> {
    ensure!(
        probe.kind() == ProbeKind::Distance,
        "UUAS needs a distance probe"
    );
    let data = split
        .language(language)
        .with_context(|| format!("No data for language {}", language.index()))?;
    let punctuation = data.aligned.corpus.punctuation_mask();
    let gold = data.aligned.corpus.unlabeled_unordered_relations();

    let mut results = UuasResults::default();
    for batch in split.evaluate_batches(batch_size, language) {
        let batch = batch?;
        let predicted = probe.forward(&batch)?.to_vec3::<f32>()?;
        for (slot, &sentence) in batch.sentence_indices.iter().enumerate() {
            let n = batch.token_len[slot];
            let matrix: Vec<Vec<f32>> = predicted[slot][..n]
                .iter()
                .map(|row| row[..n].to_vec())
                .collect();
            results.add(sentence_uuas(
                &matrix,
                &punctuation[sentence],
                &gold[sentence],
            ));
        }
    }
    Ok(results)
}
