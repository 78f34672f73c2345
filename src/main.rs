use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use ndarray::{array, s, Array1, Axis};
use tracing::info;
use tracing_subscriber::EnvFilter;

use luong_seq2seq::seq2seq::best_log_probs;
use luong_seq2seq::{AttentionScope, ModelConfig, ScoreMethod, Seq2Seq, SourceMask, SOS_IDX};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a forward pass of a Luong-attention seq2seq model")]
struct Args {
    /// JSON model config; defaults to a small model
    #[arg(long)]
    config: Option<PathBuf>,

    /// Parameter initialisation seed
    #[arg(long)]
    seed: Option<u64>,

    /// Attention scope: global, local-m or local-p
    #[arg(long, value_parser = parse_scope)]
    scope: Option<AttentionScope>,

    /// Alignment score: dot or general
    #[arg(long, value_parser = parse_score)]
    score: Option<ScoreMethod>,

    /// Maximum number of decoded tokens
    #[arg(long, default_value = "8")]
    max_len: usize,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_scope(s: &str) -> std::result::Result<AttentionScope, String> {
    serde_json::from_value(serde_json::Value::String(s.to_string())).map_err(|e| e.to_string())
}

fn parse_score(s: &str) -> std::result::Result<ScoreMethod, String> {
    serde_json::from_value(serde_json::Value::String(s.to_string())).map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &args.config {
        Some(path) => ModelConfig::from_json_file(path)?,
        None => ModelConfig::small(),
    };
    if let Some(seed) = args.seed {
        config = config.with_seed(seed);
    }
    if let Some(scope) = args.scope {
        config = config.with_scope(scope);
    }
    if let Some(score) = args.score {
        config = config.with_score(score);
    }
    config.validate()?;

    let vocab_size = 20;
    let mut model = Seq2Seq::new(config, vocab_size, vocab_size)?;

    // Two sources with true lengths 3 and 5, right-padded with PAD
    let src = array![[5, 6, 7, 0, 0], [8, 9, 10, 11, 12]];
    let mask = SourceMask::from_tokens(&src)?;

    let states = model.begin(&src, &mask)?;
    info!(shape = ?states.shape(), lengths = ?mask.lengths(), "encoder states");
    let padded = states.slice(s![0, 3.., ..]);
    info!(max_abs = padded.fold(0.0f32, |m, &v| m.max(v.abs())), "encoder output past true length");

    // Teacher-forced check of the per-step distributions
    let tgt = array![[4, 5, 1], [6, 7, 8]];
    let log_probs = model.score(&src, &mask, &tgt)?;
    for t in 0..tgt.ncols() {
        let step = log_probs.index_axis(Axis(1), t).to_owned();
        let prob_sums: Array1<f32> = step.mapv(f32::exp).sum_axis(Axis(1));
        info!(t, ?prob_sums, best = ?best_log_probs(&step), "decoder step");
    }

    let likelihood = model.sequence_log_likelihood(&src, &mask, &tgt)?;
    info!(?likelihood, "target log-likelihood");

    let decoded = model.greedy_decode(&src, &mask, args.max_len)?;
    for (b, tokens) in decoded.iter().enumerate() {
        info!(b, start = SOS_IDX, ?tokens, "greedy decode");
    }

    Ok(())
}
