//! Decoder construction parameters.
//!
//! All knobs live in one serde struct so configurations can be stored as
//! TOML next to the model files. Every field has a default; `vocab` is the
//! only one that must always be supplied.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Worker pool size for batch decoding.
    pub thread_count: usize,
    /// CTC blank token index.
    pub blank_id: u32,
    /// Maximum candidate tokens considered per frame.
    pub cutoff_top_n: usize,
    /// Per-frame cumulative probability mass cap for candidates.
    pub cutoff_prob: f32,
    /// Language model weight.
    pub alpha: f32,
    /// Word insertion reward.
    pub beta: f32,
    /// Active beams retained per frame.
    pub beam_width: usize,
    /// Token surface forms; index is the token id.
    pub vocab: Vec<String>,
    /// Penalty for transitions the lexicon does not accept (log space).
    pub unk_lexicon_penalty: f32,
    /// Per-token log-probability floor for candidacy.
    pub min_tok_prob: f32,
    /// Beams scoring below `top + max_beam_deviation` are dropped
    /// (`-inf` disables the floor).
    pub max_beam_deviation: f32,
    /// Continuation marker prefix for sub-word tokens (e.g. `#` in `#llo`).
    pub tok_sep: String,
    /// Optional word n-gram model, ARPA text or ZALM binary.
    pub lm_path: Option<PathBuf>,
    /// Optional lexicon automaton, ZFST binary.
    pub lexicon_fst_path: Option<PathBuf>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            thread_count: 1,
            blank_id: 0,
            cutoff_top_n: 40,
            cutoff_prob: 1.0,
            alpha: 1.0,
            beta: 0.0,
            beam_width: 25,
            vocab: Vec::new(),
            unk_lexicon_penalty: -5.0,
            min_tok_prob: -5.0,
            max_beam_deviation: f32::NEG_INFINITY,
            tok_sep: "#".to_string(),
            lm_path: None,
            lexicon_fst_path: None,
        }
    }
}

impl DecoderConfig {
    /// Load a configuration from a TOML file.
    pub fn from_toml_path(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(toml::from_str(&content)?)
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    /// Token id of the literal apostrophe, if the vocabulary has one.
    pub fn apostrophe_id(&self) -> Option<u32> {
        self.vocab
            .iter()
            .position(|surface| surface == "'")
            .map(|id| id as u32)
    }

    /// Check every parameter range. Called once at decoder construction;
    /// a failing config never produces a usable decoder.
    pub fn validate(&self) -> Result<()> {
        if self.thread_count == 0 {
            return Err(DecodeError::Config("thread_count must be >= 1".to_string()));
        }
        if self.beam_width == 0 {
            return Err(DecodeError::Config("beam_width must be >= 1".to_string()));
        }
        if self.cutoff_top_n == 0 {
            return Err(DecodeError::Config("cutoff_top_n must be >= 1".to_string()));
        }
        if !(self.cutoff_prob > 0.0 && self.cutoff_prob <= 1.0) {
            return Err(DecodeError::Config(format!(
                "cutoff_prob must be in (0, 1], got {}",
                self.cutoff_prob
            )));
        }
        if self.vocab.is_empty() {
            return Err(DecodeError::Config("vocab must not be empty".to_string()));
        }
        if self.blank_id as usize >= self.vocab.len() {
            return Err(DecodeError::Config(format!(
                "blank_id {} out of vocabulary range (size {})",
                self.blank_id,
                self.vocab.len()
            )));
        }
        if self.unk_lexicon_penalty > 0.0 {
            return Err(DecodeError::Config(
                "unk_lexicon_penalty must be <= 0".to_string(),
            ));
        }
        if self.min_tok_prob > 0.0 {
            return Err(DecodeError::Config("min_tok_prob must be <= 0".to_string()));
        }
        if self.max_beam_deviation > 0.0 {
            return Err(DecodeError::Config(
                "max_beam_deviation must be <= 0".to_string(),
            ));
        }
        if self.tok_sep.is_empty() {
            return Err(DecodeError::Config("tok_sep must not be empty".to_string()));
        }
        Ok(())
    }
}
