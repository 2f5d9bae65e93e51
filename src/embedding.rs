//! Embedding providers: frozen models that turn wordpiece ids into vectors
//!
//! The probe never trains these weights. A provider is built once, wrapped in
//! an `Arc`, and shared read-only by every probe that needs it.

use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::Embedding;
use hf_hub::{api::sync::Api, Repo, RepoType};
use tracing::info;

/// Frozen model mapping wordpiece ids to per-position embeddings
pub trait EmbeddingProvider: Send + Sync {
    /// `wordpiece_ids`: `[batch, seq_len]` u32 → `[batch, seq_len, hidden_size]`
    fn embed(&self, wordpiece_ids: &Tensor) -> Result<Tensor>;

    /// Dimensionality of each returned vector
    fn hidden_size(&self) -> usize;
}

/// Locate a model file either in a local directory or in a hub repository.
///
/// If `model` names an existing directory the file must be inside it;
/// otherwise `model` is treated as a Hugging Face model id and the file is
/// downloaded (or taken from the local hub cache).
pub fn resolve_model_file(model: &str, file: &str) -> Result<PathBuf> {
    let dir = Path::new(model);
    if dir.is_dir() {
        let path = dir.join(file);
        ensure!(
            path.is_file(),
            "Checkpoint directory {} has no {file}",
            dir.display()
        );
        return Ok(path);
    }

    let api = Api::new()?;
    let repo = api.repo(Repo::new(model.to_string(), RepoType::Model));
    repo.get(file)
        .with_context(|| format!("Failed to download {file} for {model}"))
}

/// Pick the device the way the CLI does: CUDA when available unless forced to CPU
pub fn select_device(force_cpu: bool) -> Device {
    if force_cpu {
        info!("Forcing CPU mode");
        return Device::Cpu;
    }
    match Device::cuda_if_available(0) {
        Ok(dev) if dev.is_cuda() => {
            info!("Using CUDA device");
            dev
        }
        _ => {
            info!("CUDA not available, using CPU");
            Device::Cpu
        }
    }
}

/// Static (non-contextual) embeddings: one fixed vector per vocabulary id
pub struct LookupEmbedder {
    table: Embedding,
    hidden_size: usize,
}

impl LookupEmbedder {
    /// `table`: `[vocab_size, hidden_size]`
    pub fn new(table: Tensor) -> Result<Self> {
        let (_, hidden_size) = table.dims2()?;
        let table = table.to_dtype(DType::F32)?;
        Ok(Self {
            table: Embedding::new(table, hidden_size),
            hidden_size,
        })
    }
}

impl EmbeddingProvider for LookupEmbedder {
    fn embed(&self, wordpiece_ids: &Tensor) -> Result<Tensor> {
        Ok(self.table.forward(wordpiece_ids)?)
    }

    fn hidden_size(&self) -> usize {
        self.hidden_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_embedder_shapes() {
        let device = Device::Cpu;
        let table = Tensor::arange(0f32, 12f32, &device)
            .unwrap()
            .reshape((4, 3))
            .unwrap();
        let embedder = LookupEmbedder::new(table).unwrap();
        assert_eq!(embedder.hidden_size(), 3);

        let ids = Tensor::new(&[[1u32, 3, 0], [2, 2, 0]], &device).unwrap();
        let out = embedder.embed(&ids).unwrap();
        assert_eq!(out.dims(), &[2, 3, 3]);

        let rows = out.to_vec3::<f32>().unwrap();
        assert_eq!(rows[0][0], vec![3.0, 4.0, 5.0]);
        assert_eq!(rows[0][1], vec![9.0, 10.0, 11.0]);
        assert_eq!(rows[1][0], rows[1][1]);
    }

    #[test]
    fn test_resolve_missing_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_model_file(dir.path().to_str().unwrap(), "model.safetensors");
        assert!(err.is_err());

        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        let found = resolve_model_file(dir.path().to_str().unwrap(), "config.json").unwrap();
        assert!(found.ends_with("config.json"));
    }
}
