// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 in tensor ops
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `head`/`heads`
#![allow(clippy::module_name_repetitions)] // ProbeConfig in config.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! structural-probe: syntax trees in frozen multilingual embeddings
//!
//! Trains a low-rank distance probe so that squared distances between
//! projected word vectors approximate dependency-tree distances. One shared
//! projection is learned jointly with one linear map per training language.
//!
//! ## Architecture
//!
//! - `corpus`: CoNLL-U reading and derived dependency views
//! - `tree`: Gold tree distances
//! - `tokenizer`: Wordpiece tokenizer seam and the `tokenizers` implementation
//! - `alignment`: Word-to-wordpiece alignment with auditable rejections
//! - `dataset`: Per-language aligned data and single-language batches
//! - `embedding`: Frozen embedding providers and model file resolution
//! - `forward_bert`: BERT encoder forward pass up to the probed layer
//! - `masks`: Attention padding masks and word-pair loss masks
//! - `language`: Language ids resolved at configuration time
//! - `probe`: Distance probe, pooling, and loss
//! - `experiment`: Training loop with early stopping, and evaluation
//! - `metrics`: UUAS via minimum spanning trees
//! - `config`: JSON configuration

pub mod alignment;
pub mod config;
pub mod corpus;
pub mod dataset;
pub mod embedding;
pub mod experiment;
pub mod forward_bert;
pub mod language;
pub mod masks;
pub mod metrics;
pub mod probe;
pub mod tokenizer;
pub mod tree;

#[cfg(test)]
pub(crate) mod testing;

pub use alignment::{
    align_corpus, align_sentence, AlignedCorpus, AlignmentConfig, AlignmentRecord, Rejection,
    RejectionReason, SentenceAlignment,
};
pub use config::ProbeConfig;
pub use corpus::{Corpus, Relation};
pub use dataset::{Batch, DatasetSplit, DependencyDataset, LanguageData};
pub use embedding::{select_device, EmbeddingProvider, LookupEmbedder};
pub use experiment::{
    evaluate, evaluate_language, train, EvaluationReport, TrainingConfig, TrainingReport,
    TrainingState,
};
pub use forward_bert::{BertConfig, BertEmbedder};
pub use language::{LanguageId, LanguageSet};
pub use metrics::{evaluate_uuas, UuasResults};
pub use probe::{DistanceProbe, ProbeKind, ProbeWeights, StructuralProbe};
pub use tokenizer::{HfWordpieceTokenizer, WordpieceTokenizer};
pub use tree::tree_distances;
