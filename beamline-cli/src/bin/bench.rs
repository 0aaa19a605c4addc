//! Batch decode latency harness over synthetic posteriors.
//!
//! Generates random softmax posteriors of a configurable shape and times
//! repeated batch decodes, reporting the average per-call latency.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use beamline_engine::{Decoder, DecoderConfig, LogitsBatch, OutputBuffers};

#[derive(Parser, Debug)]
#[command(name = "beamline-bench")]
#[command(about = "Time batch CTC beam search over random posteriors")]
struct Cli {
    /// Batch size
    #[arg(short, long, default_value_t = 4)]
    batch: usize,

    /// Frames per sample
    #[arg(short, long, default_value_t = 1000)]
    frames: usize,

    /// Vocabulary size (ignored when --vocab is given)
    #[arg(short = 'V', long, default_value_t = 512)]
    vocab_size: usize,

    /// Vocabulary file: one token surface per line
    #[arg(long)]
    vocab: Option<PathBuf>,

    /// Beam width
    #[arg(short = 'w', long, default_value_t = 300)]
    beam_width: usize,

    /// Worker threads
    #[arg(short, long, default_value_t = 1)]
    threads: usize,

    /// Per-frame candidate cap
    #[arg(long, default_value_t = 40)]
    cutoff_top_n: usize,

    /// Number of timed iterations
    #[arg(short, long, default_value_t = 100)]
    iterations: usize,

    /// Optional ARPA or ZALM language model
    #[arg(long)]
    lm: Option<PathBuf>,

    /// Optional ZFST lexicon
    #[arg(long)]
    lexicon: Option<PathBuf>,

    /// RNG seed
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn synthetic_posteriors(rng: &mut StdRng, batch: usize, frames: usize, vocab: usize) -> Vec<f32> {
    let mut probs = vec![0.0f32; batch * frames * vocab];
    for row in probs.chunks_mut(vocab) {
        let mut sum = 0.0f32;
        for p in row.iter_mut() {
            *p = rng.random::<f32>();
            sum += *p;
        }
        for p in row.iter_mut() {
            *p /= sum;
        }
    }
    probs
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let vocab: Vec<String> = match &cli.vocab {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read vocabulary {path:?}"))?
            .lines()
            .map(|line| line.to_string())
            .collect(),
        None => (0..cli.vocab_size).map(|i| format!("t{i}")).collect(),
    };
    let vocab_size = vocab.len();

    let cfg = DecoderConfig {
        vocab,
        beam_width: cli.beam_width,
        thread_count: cli.threads,
        cutoff_top_n: cli.cutoff_top_n,
        lm_path: cli.lm.clone(),
        lexicon_fst_path: cli.lexicon.clone(),
        ..DecoderConfig::default()
    };
    let decoder = Decoder::new(cfg).context("Failed to construct decoder")?;

    let mut rng = StdRng::seed_from_u64(cli.seed);
    let seq_lens = vec![cli.frames; cli.batch];
    let mut labels = vec![0i32; cli.batch * cli.beam_width * cli.frames];
    let mut timesteps = vec![0i32; cli.batch * cli.beam_width * cli.frames];
    let mut seq_pos = vec![0i32; cli.batch * cli.beam_width];

    eprintln!(
        "batch={} frames={} vocab={} beam_width={} threads={} iterations={}",
        cli.batch, cli.frames, vocab_size, cli.beam_width, cli.threads, cli.iterations
    );

    let mut total = std::time::Duration::ZERO;
    for i in 0..cli.iterations {
        let probs = synthetic_posteriors(&mut rng, cli.batch, cli.frames, vocab_size);
        let logits = LogitsBatch {
            probs: &probs,
            batch: cli.batch,
            frames: cli.frames,
            vocab: vocab_size,
        };
        let mut out = OutputBuffers {
            labels: &mut labels,
            timesteps: &mut timesteps,
            seq_pos: &mut seq_pos,
        };

        let start = Instant::now();
        decoder.decode_batch(&logits, &seq_lens, &mut out, None)?;
        total += start.elapsed();

        if (i + 1) % 10 == 0 {
            eprintln!("  {}/{} iterations", i + 1, cli.iterations);
        }
    }

    let avg = total / cli.iterations as u32;
    println!(
        "avg latency: {:?} ({:.1} frames/s)",
        avg,
        (cli.batch * cli.frames) as f64 / avg.as_secs_f64()
    );
    Ok(())
}
