use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use beamline_engine::Fst;
use beamline_engine::fst::{parse_word_list_json, parse_word_list_text};

/// beamline lexicon tool — build and inspect token-trie automata.
#[derive(Parser, Debug)]
#[command(name = "beamline-fst")]
#[command(about = "beamline lexicon tool — build and inspect token-trie automata")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build a binary lexicon automaton from a word list and a vocabulary.
    ///
    /// Supports two input formats:
    /// - `json`: Array of {word, weight} objects (weight optional)
    /// - `text`: One `word[\tweight]` per line, `#` comments
    ///
    /// Format is auto-detected from file extension (.json → JSON,
    /// otherwise → text), or can be explicitly specified with --format.
    Build {
        /// Input word list (JSON or text)
        input: PathBuf,

        /// Vocabulary file: one token surface per line, line number = token id
        #[arg(short, long)]
        vocab: PathBuf,

        /// Output binary automaton file
        #[arg(short, long, default_value = "lexicon.fst")]
        output: PathBuf,

        /// Input format: json or text (auto-detected from extension if omitted)
        #[arg(short, long)]
        format: Option<String>,

        /// Continuation marker prefix for sub-word tokens
        #[arg(long, default_value = "#")]
        tok_sep: String,
    },

    /// Print the states and arcs of a binary automaton.
    Inspect {
        /// Automaton file to load
        input: PathBuf,

        /// Emit machine-readable JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

fn read_vocab(path: &PathBuf) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read vocabulary {path:?}"))?;
    Ok(content.lines().map(|line| line.to_string()).collect())
}

fn run_build(
    input: PathBuf,
    vocab: PathBuf,
    output: PathBuf,
    format: Option<String>,
    tok_sep: String,
) -> Result<()> {
    let format =
        format
            .as_deref()
            .unwrap_or_else(|| match input.extension().and_then(|e| e.to_str()) {
                Some("json") => "json",
                _ => "text",
            });

    let vocab = read_vocab(&vocab)?;
    eprintln!(
        "Building lexicon from {:?} (format: {}, vocab size: {})...",
        input,
        format,
        vocab.len()
    );

    let words = match format {
        "json" => parse_word_list_json(&input)?,
        "text" => parse_word_list_text(&input)?,
        other => anyhow::bail!("Unknown format: {}. Use 'json' or 'text'.", other),
    };

    let (fst, skipped) = Fst::build_lexicon(&words, &vocab, &tok_sep)?;
    if !skipped.is_empty() {
        eprintln!("Skipped {} untokenizable word(s):", skipped.len());
        for word in &skipped {
            eprintln!("  {word}");
        }
    }

    eprintln!(
        "Saving {} states ({} words) to {:?}...",
        fst.state_count(),
        words.len() - skipped.len(),
        output
    );
    fst.save(&output)?;

    eprintln!("Done.");
    Ok(())
}

#[derive(Serialize)]
struct JsonArc {
    label: u32,
    weight: f32,
    target: u32,
}

#[derive(Serialize)]
struct JsonState {
    id: u32,
    final_weight: Option<f32>,
    arcs: Vec<JsonArc>,
}

fn run_inspect(input: PathBuf, json: bool) -> Result<()> {
    let fst = Fst::load(&input).with_context(|| format!("Failed to load {input:?}"))?;

    if json {
        let states: Vec<JsonState> = (0..fst.state_count() as u32)
            .map(|id| JsonState {
                id,
                final_weight: fst.final_weight(id),
                arcs: fst
                    .arcs(id)
                    .iter()
                    .map(|arc| JsonArc {
                        label: arc.label,
                        weight: arc.weight,
                        target: arc.target,
                    })
                    .collect(),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&states)?);
        return Ok(());
    }

    println!(
        "{} states, alphabet size {}",
        fst.state_count(),
        fst.alphabet_size()
    );
    for id in 0..fst.state_count() as u32 {
        match fst.final_weight(id) {
            Some(weight) => println!("state {id} (final, weight {weight})"),
            None => println!("state {id}"),
        }
        for arc in fst.arcs(id) {
            println!("  --{}/{:.3}--> {}", arc.label, arc.weight, arc.target);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Build {
            input,
            vocab,
            output,
            format,
            tok_sep,
        } => run_build(input, vocab, output, format, tok_sep),
        Commands::Inspect { input, json } => run_inspect(input, json),
    }
}
