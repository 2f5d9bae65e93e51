//! structural-probe CLI: train a distance probe on CoNLL-U treebanks

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use serde::Serialize;
use structural_probe::{
    evaluate, evaluate_uuas, select_device, train, BertEmbedder, DependencyDataset,
    EmbeddingProvider, EvaluationReport, HfWordpieceTokenizer, ProbeConfig, TrainingReport,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "structural-probe")]
#[command(about = "Multilingual structural probes over frozen transformer embeddings")]
#[command(version)]
struct Cli {
    /// JSON configuration file (missing fields take defaults)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Training treebank as `language=path`; repeat for more languages
    #[arg(long = "train", value_parser = parse_language_file, required = true)]
    train: Vec<(String, PathBuf)>,

    /// Validation treebank as `language=path`; repeat for more languages
    #[arg(long = "dev", value_parser = parse_language_file)]
    dev: Vec<(String, PathBuf)>,

    /// Model ID from `HuggingFace` or a local checkpoint directory
    #[arg(short, long)]
    model: Option<String>,

    /// Encoder layer to probe (negative counts from the last layer)
    #[arg(long, allow_hyphen_values = true)]
    layer: Option<i64>,

    /// Rank of the shared projection
    #[arg(long)]
    rank: Option<usize>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Output directory for results
    #[arg(short, long, default_value = "outputs")]
    output: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long)]
    cpu: bool,
}

fn parse_language_file(value: &str) -> Result<(String, PathBuf), String> {
    match value.split_once('=') {
        Some((language, path)) if !language.is_empty() && !path.is_empty() => {
            Ok((language.to_string(), PathBuf::from(path)))
        }
        _ => Err(format!("expected `language=path`, got `{value}`")),
    }
}

#[derive(Serialize)]
struct LanguageSummary {
    dev_loss: Option<f32>,
    uuas: f64,
    uuas_correct: usize,
    uuas_total: usize,
    train_rejections: usize,
}

#[derive(Serialize)]
struct ProbeResults {
    config: ProbeConfig,
    training: TrainingReport,
    dev: Option<EvaluationReport>,
    languages: BTreeMap<String, LanguageSummary>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &cli.config {
        Some(path) => ProbeConfig::load(path)?,
        None => ProbeConfig::default(),
    };
    if let Some(model) = &cli.model {
        config.model.clone_from(model);
    }
    if let Some(layer) = cli.layer {
        config.layer_index = layer;
    }
    if let Some(rank) = cli.rank {
        config.probe_rank = rank;
    }
    if let Some(epochs) = cli.epochs {
        config.epochs = epochs;
    }
    if let Some(batch_size) = cli.batch_size {
        config.batch_size = batch_size;
    }
    config.validate()?;
    let languages = config.languages()?;

    println!("=== structural-probe ===");
    println!("Model:     {}", config.model);
    println!("Layer:     {}", config.layer_index);
    println!("Rank:      {}", config.probe_rank);
    println!("Languages: {}", config.train_languages.join(", "));
    println!("Output:    {}", cli.output.display());
    if cli.cpu {
        println!("Mode:      CPU (forced)");
    }

    let device = select_device(cli.cpu);

    info!("Loading tokenizer and model...");
    let tokenizer = HfWordpieceTokenizer::from_model(&config.model)?;
    let embedder = Arc::new(BertEmbedder::load(
        &config.model,
        config.layer_index,
        &device,
    )?);
    info!(
        "Model: {} layers loaded, {} hidden",
        embedder.n_layers(),
        embedder.hidden_size()
    );

    let dataset = DependencyDataset::load(
        &cli.train,
        &cli.dev,
        &languages,
        &tokenizer,
        &config.alignment(),
        &device,
    )?;

    let mut probe = config
        .probe_kind
        .build(&config, &languages, embedder, &device)?;
    let training = train(probe.as_mut(), &dataset, &config.training())?;

    let dev = match &dataset.dev {
        Some(split) if !split.is_empty() => Some(evaluate(probe.as_ref(), split, config.batch_size)?),
        _ => None,
    };

    // UUAS on the validation split when there is one, otherwise on training data
    let scored = dataset.dev.as_ref().filter(|s| !s.is_empty()).unwrap_or(&dataset.train);
    let mut summaries = BTreeMap::new();
    for data in scored.languages() {
        let name = languages.name(data.language).to_string();
        let uuas = evaluate_uuas(probe.as_ref(), scored, data.language, config.batch_size)?;
        let dev_loss = dev.as_ref().and_then(|report| {
            report
                .per_language
                .iter()
                .find(|l| l.language == data.language)
                .map(|l| l.loss)
        });
        let train_rejections = dataset
            .train
            .language(data.language)
            .map_or(0, |d| d.aligned.rejections.len());
        summaries.insert(
            name,
            LanguageSummary {
                dev_loss,
                uuas: uuas.uuas(),
                uuas_correct: uuas.correct,
                uuas_total: uuas.total,
                train_rejections,
            },
        );
    }

    // Print results
    println!("\n=== Results ===");
    println!(
        "Epochs run: {}{}",
        training.epochs_run(),
        if training.stopped_early() {
            " (early stop)"
        } else {
            ""
        }
    );
    if let Some(report) = &dev {
        println!("Mean dev loss: {:.4}", report.mean);
    }
    for (name, summary) in &summaries {
        println!(
            "{name:>6}: UUAS {:.1}% ({}/{})",
            summary.uuas * 100.0,
            summary.uuas_correct,
            summary.uuas_total
        );
    }

    // Save results
    std::fs::create_dir_all(&cli.output)?;
    let results_path = cli.output.join("probe_results.json");
    let results = ProbeResults {
        config,
        training,
        dev,
        languages: summaries,
    };
    std::fs::write(&results_path, serde_json::to_string_pretty(&results)?)?;
    info!("Results saved to {}", results_path.display());

    Ok(())
}
