//! Mask utilities shared by the encoder and the probe loss
//!
//! Two kinds of masks are needed:
//!
//! - an additive attention mask that keeps the encoder from attending to
//!   padding wordpieces (`PAD_ID`)
//! - a multiplicative word-pair mask that restricts the probe loss to pairs
//!   of real words, leaving the distance matrix itself untouched

use anyhow::{ensure, Result};
use candle_core::{DType, Device, Tensor};

use crate::alignment::PAD_ID;

/// Large negative bias for masked attention logits.
///
/// A finite value keeps softmax well defined even if a row were fully masked.
const MASKED_LOGIT: f32 = -10_000.0;

/// Create an additive padding mask from wordpiece ids
///
/// # Returns
///
/// A tensor of shape `[batch, 1, 1, seq_len]` where:
/// - `0.0` for real wordpieces
/// - `-10000.0` for padding positions
///
/// # Example
///
/// For ids `[[101, 7, 102, 0]]` the mask is:
/// ```text
/// [[[[0, 0, 0, -10000]]]]
/// ```
pub fn create_padding_mask(input_ids: &Tensor, dtype: DType) -> Result<Tensor> {
    let (batch, seq_len) = input_ids.dims2()?;
    let ids = input_ids.to_vec2::<u32>()?;
    let mask: Vec<f32> = ids
        .iter()
        .flat_map(|row| {
            row.iter()
                .map(|&id| if id == PAD_ID { MASKED_LOGIT } else { 0.0 })
        })
        .collect();
    Ok(Tensor::from_vec(mask, (batch, 1, 1, seq_len), input_ids.device())?.to_dtype(dtype)?)
}

/// Create a word-pair mask from true sentence lengths
///
/// Entry `[b, i, j]` is `1.0` when both `i` and `j` are real words of
/// sentence `b` (`i, j < lengths[b]`) and `0.0` otherwise.
///
/// # Returns
///
/// An F32 tensor of shape `[batch, words, words]`.
pub fn create_pair_mask(lengths: &[usize], words: usize, device: &Device) -> Result<Tensor> {
    ensure!(
        lengths.iter().all(|&len| len <= words),
        "Sentence length exceeds padded word count {words}: {lengths:?}"
    );
    let mask: Vec<f32> = lengths
        .iter()
        .flat_map(|&len| {
            (0..words).flat_map(move |i| {
                (0..words).map(move |j| if i < len && j < len { 1.0 } else { 0.0 })
            })
        })
        .collect();
    Ok(Tensor::from_vec(mask, (lengths.len(), words, words), device)?)
}
