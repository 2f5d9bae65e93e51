//! BERT forward pass truncated at the probed layer
//!
//! Custom implementation that runs the encoder layer-by-layer so the probe can
//! read the hidden state of any intermediate layer, not just the last one.
//! Only the layers up to the requested one are loaded and run.
//!
//! Based on the original BERT encoder (post-LayerNorm, GELU feed-forward,
//! learned absolute positions). Checkpoints from TF conversions that name
//! LayerNorm parameters `gamma`/`beta` are accepted as well.

use anyhow::{bail, ensure, Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{embedding, linear, Embedding, LayerNorm, Linear, VarBuilder};
use tracing::info;

use crate::embedding::{resolve_model_file, EmbeddingProvider};
use crate::masks::create_padding_mask;

/// Model configuration (matches HuggingFace config.json for BERT)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct BertConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
}

fn default_max_position_embeddings() -> usize {
    512
}

fn default_type_vocab_size() -> usize {
    2
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

fn default_hidden_act() -> String {
    "gelu".to_string()
}

/// Feed-forward activation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activation {
    /// Exact GELU (erf)
    Gelu,
    /// Tanh approximation
    GeluApprox,
}

impl BertConfig {
    fn activation(&self) -> Result<Activation> {
        match self.hidden_act.as_str() {
            "gelu" => Ok(Activation::Gelu),
            "gelu_new" | "gelu_pytorch_tanh" => Ok(Activation::GeluApprox),
            other => bail!("Unsupported hidden_act '{other}'"),
        }
    }

    fn head_dim(&self) -> Result<usize> {
        ensure!(
            self.num_attention_heads > 0 && self.hidden_size % self.num_attention_heads == 0,
            "hidden_size {} is not divisible by num_attention_heads {}",
            self.hidden_size,
            self.num_attention_heads
        );
        Ok(self.hidden_size / self.num_attention_heads)
    }
}

/// LayerNorm that accepts both `weight`/`bias` and `gamma`/`beta` names
fn layer_norm(size: usize, eps: f64, vb: VarBuilder) -> Result<LayerNorm> {
    let (weight, bias) = match (vb.get(size, "weight"), vb.get(size, "bias")) {
        (Ok(weight), Ok(bias)) => (weight, bias),
        (Err(err), _) | (_, Err(err)) => {
            match (vb.get(size, "gamma"), vb.get(size, "beta")) {
                (Ok(weight), Ok(bias)) => (weight, bias),
                _ => return Err(err.into()),
            }
        }
    };
    Ok(LayerNorm::new(weight, bias, eps))
}

/// Word + position + token-type embeddings
struct Embeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Embedding,
    layer_norm: LayerNorm,
    max_positions: usize,
}

impl Embeddings {
    fn load(vb: VarBuilder, config: &BertConfig) -> Result<Self> {
        let word_embeddings = embedding(
            config.vocab_size,
            config.hidden_size,
            vb.pp("word_embeddings"),
        )?;
        let position_embeddings = embedding(
            config.max_position_embeddings,
            config.hidden_size,
            vb.pp("position_embeddings"),
        )?;
        let token_type_embeddings = embedding(
            config.type_vocab_size,
            config.hidden_size,
            vb.pp("token_type_embeddings"),
        )?;
        let layer_norm = layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("LayerNorm"))?;

        Ok(Self {
            word_embeddings,
            position_embeddings,
            token_type_embeddings,
            layer_norm,
            max_positions: config.max_position_embeddings,
        })
    }

    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (_b, seq_len) = input_ids.dims2()?;
        ensure!(
            seq_len <= self.max_positions,
            "Sequence length {seq_len} exceeds max_position_embeddings {}",
            self.max_positions
        );

        let positions = Tensor::arange(0u32, seq_len as u32, input_ids.device())?;
        // Single-segment input: every token has type 0
        let token_types = input_ids.zeros_like()?;

        let words = self.word_embeddings.forward(input_ids)?;
        let positions = self.position_embeddings.forward(&positions)?;
        let token_types = self.token_type_embeddings.forward(&token_types)?;

        let hidden = words.broadcast_add(&positions)?.add(&token_types)?;
        Ok(self.layer_norm.forward(&hidden)?)
    }
}

/// Bidirectional multi-head self-attention with its output projection
struct Attention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    output_norm: LayerNorm,
    num_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &BertConfig) -> Result<Self> {
        let head_dim = config.head_dim()?;
        let all_heads = config.num_attention_heads * head_dim;
        let vb_self = vb.pp("self");
        let query = linear(config.hidden_size, all_heads, vb_self.pp("query"))?;
        let key = linear(config.hidden_size, all_heads, vb_self.pp("key"))?;
        let value = linear(config.hidden_size, all_heads, vb_self.pp("value"))?;

        let vb_out = vb.pp("output");
        let output = linear(all_heads, config.hidden_size, vb_out.pp("dense"))?;
        let output_norm = layer_norm(config.hidden_size, config.layer_norm_eps, vb_out.pp("LayerNorm"))?;

        Ok(Self {
            query,
            key,
            value,
            output,
            output_norm,
            num_heads: config.num_attention_heads,
            head_dim,
        })
    }

    /// `mask`: additive padding mask `[batch, 1, 1, seq_len]`
    fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;

        let q = self.query.forward(x)?;
        let k = self.key.forward(x)?;
        let v = self.value.forward(x)?;

        // Reshape for multi-head attention
        let q = q
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = v
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        // Scaled dot-product attention, no causal mask
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let attn_weights = attn_weights.broadcast_add(mask)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&v)?;

        // Reshape back
        let attn_output = attn_output.transpose(1, 2)?.reshape((b, seq_len, ()))?;
        let projected = self.output.forward(&attn_output)?;
        Ok(self.output_norm.forward(&(projected + x)?)?)
    }
}

/// Feed-forward block with residual LayerNorm
struct FeedForward {
    intermediate: Linear,
    output: Linear,
    output_norm: LayerNorm,
    activation: Activation,
}

impl FeedForward {
    fn load(vb: VarBuilder, config: &BertConfig) -> Result<Self> {
        let intermediate = linear(
            config.hidden_size,
            config.intermediate_size,
            vb.pp("intermediate").pp("dense"),
        )?;
        let vb_out = vb.pp("output");
        let output = linear(config.intermediate_size, config.hidden_size, vb_out.pp("dense"))?;
        let output_norm = layer_norm(config.hidden_size, config.layer_norm_eps, vb_out.pp("LayerNorm"))?;

        Ok(Self {
            intermediate,
            output,
            output_norm,
            activation: config.activation()?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = self.intermediate.forward(x)?;
        let hidden = match self.activation {
            Activation::Gelu => hidden.gelu_erf()?,
            Activation::GeluApprox => hidden.gelu()?,
        };
        let hidden = self.output.forward(&hidden)?;
        Ok(self.output_norm.forward(&(hidden + x)?)?)
    }
}

/// Single encoder layer
struct EncoderLayer {
    attention: Attention,
    feed_forward: FeedForward,
}

impl EncoderLayer {
    fn load(vb: VarBuilder, config: &BertConfig) -> Result<Self> {
        let attention = Attention::load(vb.pp("attention"), config)?;
        let feed_forward = FeedForward::load(vb, config)?;
        Ok(Self {
            attention,
            feed_forward,
        })
    }

    fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let x = self.attention.forward(x, mask)?;
        self.feed_forward.forward(&x)
    }
}

/// Safetensors index for sharded checkpoints
#[derive(Debug, serde::Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// Frozen BERT encoder truncated at the probed layer
pub struct BertEmbedder {
    embeddings: Embeddings,
    layers: Vec<EncoderLayer>,
    hidden_size: usize,
    dtype: DType,
}

impl BertEmbedder {
    /// Load from a local checkpoint directory or a HuggingFace model id.
    ///
    /// `layer_index` selects the encoder layer whose output is returned by
    /// [`EmbeddingProvider::embed`]; negative values count from the last layer.
    pub fn load(model: &str, layer_index: i64, device: &Device) -> Result<Self> {
        info!("Loading BERT from: {}", model);

        let config_path = resolve_model_file(model, "config.json")?;
        let config_str = std::fs::read_to_string(&config_path).context("Failed to read config")?;
        let config: BertConfig =
            serde_json::from_str(&config_str).context("config.json is not a BERT config")?;

        info!(
            "Model config: {} layers, {} hidden, {} vocab",
            config.num_hidden_layers, config.hidden_size, config.vocab_size
        );

        // Check for sharded vs single safetensors
        let weights_paths = if let Ok(index_path) =
            resolve_model_file(model, "model.safetensors.index.json")
        {
            info!("Model is sharded, loading index...");
            let index_str = std::fs::read_to_string(&index_path).context("Failed to read index")?;
            let index: SafetensorsIndex = serde_json::from_str(&index_str)?;

            let mut shard_names: Vec<String> = index.weight_map.values().cloned().collect();
            shard_names.sort();
            shard_names.dedup();

            shard_names
                .iter()
                .map(|name| resolve_model_file(model, name))
                .collect::<Result<Vec<_>>>()?
        } else {
            vec![resolve_model_file(model, "model.safetensors")?]
        };

        info!("Loading weights from {} file(s)...", weights_paths.len());
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights_paths, DType::F32, device)? };
        Self::from_var_builder(vb, &config, layer_index)
    }

    /// Build from an existing VarBuilder (weights may or may not carry a `bert.` prefix)
    pub fn from_var_builder(vb: VarBuilder, config: &BertConfig, layer_index: i64) -> Result<Self> {
        let target = resolve_layer(layer_index, config.num_hidden_layers)?;
        let vb = if vb.contains_tensor("bert.embeddings.word_embeddings.weight") {
            vb.pp("bert")
        } else {
            vb
        };

        let embeddings = Embeddings::load(vb.pp("embeddings"), config)?;

        let n_loaded = target + 1;
        let mut layers = Vec::with_capacity(n_loaded);
        for i in 0..n_loaded {
            if (i + 1) % 4 == 0 || i == 0 {
                info!("Loading layer {}/{}", i + 1, n_loaded);
            }
            layers.push(EncoderLayer::load(
                vb.pp(format!("encoder.layer.{i}")),
                config,
            )?);
        }

        info!(
            "Encoder ready: reading layer {} of {}",
            target, config.num_hidden_layers
        );

        Ok(Self {
            embeddings,
            layers,
            hidden_size: config.hidden_size,
            dtype: vb.dtype(),
        })
    }

    /// Number of encoder layers that were loaded (probed layer + 1)
    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Hidden state after the last loaded layer, `(batch, seq_len, hidden)`
    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let mask = create_padding_mask(input_ids, self.dtype)?;
        let mut hidden = self.embeddings.forward(input_ids)?;
        for layer in &self.layers {
            hidden = layer.forward(&hidden, &mask)?;
        }
        Ok(hidden)
    }
}

/// Resolve a possibly negative layer index against `n_layers`
pub fn resolve_layer(layer: i64, n_layers: usize) -> Result<usize> {
    let n = n_layers as i64;
    let resolved = if layer < 0 { n + layer } else { layer };
    ensure!(
        (0..n).contains(&resolved),
        "Layer index {layer} out of range for a model with {n_layers} layers"
    );
    Ok(resolved as usize)
}

impl EmbeddingProvider for BertEmbedder {
    fn embed(&self, wordpiece_ids: &Tensor) -> Result<Tensor> {
        Ok(self.forward(wordpiece_ids)?.to_dtype(DType::F32)?)
    }

    fn hidden_size(&self) -> usize {
        self.hidden_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> BertConfig {
        BertConfig {
            vocab_size: 32,
            hidden_size: 8,
            num_hidden_layers: 3,
            num_attention_heads: 2,
            intermediate_size: 16,
            max_position_embeddings: 16,
            type_vocab_size: 2,
            layer_norm_eps: 1e-12,
            hidden_act: "gelu".to_string(),
        }
    }

    #[test]
    fn test_config_defaults_from_json() {
        let json = r#"{"vocab_size": 10, "hidden_size": 4, "num_hidden_layers": 1,
                       "num_attention_heads": 2, "intermediate_size": 8}"#;
        let config: BertConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_position_embeddings, 512);
        assert_eq!(config.activation().unwrap(), Activation::Gelu);
        assert_eq!(config.head_dim().unwrap(), 2);
    }

    #[test]
    fn test_truncates_at_requested_layer() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let last = BertEmbedder::from_var_builder(vb.clone(), &tiny_config(), -1).unwrap();
        assert_eq!(last.n_layers(), 3);

        let first = BertEmbedder::from_var_builder(vb.clone(), &tiny_config(), 0).unwrap();
        assert_eq!(first.n_layers(), 1);

        assert!(BertEmbedder::from_var_builder(vb, &tiny_config(), 3).is_err());
    }

    #[test]
    fn test_embed_shapes() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let embedder = BertEmbedder::from_var_builder(vb, &tiny_config(), 1).unwrap();

        let ids = Tensor::new(&[[1u32, 5, 6, 2, 0, 0], [1, 7, 2, 0, 0, 0]], &device).unwrap();
        assert_eq!(embedder.n_layers(), 2);

        let out = embedder.embed(&ids).unwrap();
        assert_eq!(out.dims(), &[2, 6, 8]);
        assert_eq!(out.dtype(), DType::F32);
        assert_eq!(embedder.hidden_size(), 8);
    }

    #[test]
    fn test_resolve_layer() {
        assert_eq!(resolve_layer(-1, 12).unwrap(), 11);
        assert_eq!(resolve_layer(7, 12).unwrap(), 7);
        assert_eq!(resolve_layer(-12, 12).unwrap(), 0);
        assert!(resolve_layer(12, 12).is_err());
        assert!(resolve_layer(-13, 12).is_err());
    }

    #[test]
    fn test_rejects_bad_head_split() {
        let mut config = tiny_config();
        config.num_attention_heads = 3;
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        assert!(BertEmbedder::from_var_builder(vb, &config, -1).is_err());
    }

    #[test]
    #[ignore = "requires model download"]
    fn test_load_multilingual_bert() {
        let embedder =
            BertEmbedder::load("bert-base-multilingual-cased", 6, &Device::Cpu).unwrap();
        assert_eq!(embedder.hidden_size(), 768);
        assert_eq!(embedder.n_layers(), 7);
    }
}
