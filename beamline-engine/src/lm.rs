//! Word n-gram language model interface and a bundled ARPA implementation.
//!
//! The decoder only sees [`LanguageModel`]: an initial state, a scoring step
//! over the sub-word tokens of one completed word, and an unknown-word
//! penalty. [`ArpaLm`] implements it for ARPA text files and for a compact
//! `ZALM` binary; adapters over external n-gram libraries can implement the
//! trait instead and be injected into the decoder directly.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Errors that can occur while loading or saving a language model.
#[derive(Debug, thiserror::Error)]
pub enum LmError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid language model format: {0}")]
    Format(String),
}

type Result<T> = std::result::Result<T, LmError>;

const MAGIC: &[u8; 4] = b"ZALM";
const VERSION: u16 = 1;

/// Log-probability assigned when a word is absent even as a unigram.
const DEFAULT_UNK: f32 = -23.025851; // ln(1e-10)

/// Opaque scoring state: the word-id history of the last `order - 1` words.
///
/// Implementations backed by external libraries can intern their native
/// state objects and store the handle here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LmState(pub Vec<u32>);

impl LmState {
    pub fn empty() -> Self {
        Self(Vec::new())
    }
}

/// Word-level n-gram scorer consulted at word boundaries.
pub trait LanguageModel: Send + Sync {
    fn initial_state(&self) -> LmState;

    /// Score one completed word, given as the sub-word token ids emitted
    /// since the previous word boundary. Returns the successor state and
    /// the natural-log probability delta.
    fn score(&self, state: &LmState, word_tokens: &[u32]) -> (LmState, f32);

    /// Finite penalty applied to words unknown to the model.
    fn unk_penalty(&self) -> f32;
}

#[derive(Debug, Clone, Copy)]
struct NgramEntry {
    logp: f32,
    backoff: f32,
}

/// Backoff word n-gram model in ARPA or `ZALM` binary form.
///
/// Sub-word tokens are assembled into surface words using the decoder's
/// vocabulary with the continuation marker stripped, so the model file
/// speaks words while the decoder speaks tokens.
#[derive(Debug)]
pub struct ArpaLm {
    words: HashMap<String, u32>,
    ngrams: HashMap<Vec<u32>, NgramEntry>,
    order: usize,
    unk: f32,
    /// Token id → surface with the continuation marker stripped.
    pieces: Vec<String>,
}

impl ArpaLm {
    /// Load a model with format auto-detection.
    ///
    /// Files starting with the `ZALM` magic are read as binary; everything
    /// else is parsed as ARPA text.
    pub fn from_path(
        path: impl AsRef<Path>,
        vocab: &[String],
        tok_sep: &str,
    ) -> Result<Self> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let mut magic = [0u8; 4];
        let bytes_read = file.read(&mut magic)?;

        if bytes_read >= 4 && &magic == MAGIC {
            Self::load_binary(path, vocab, tok_sep)
        } else {
            Self::from_arpa(path, vocab, tok_sep)
        }
    }

    /// Parse an ARPA text file (log10 probabilities, optional backoffs).
    pub fn from_arpa(
        path: impl AsRef<Path>,
        vocab: &[String],
        tok_sep: &str,
    ) -> Result<Self> {
        const LN_10: f32 = std::f32::consts::LN_10;

        let file = File::open(path.as_ref())?;
        let reader = BufReader::new(file);

        let mut words: HashMap<String, u32> = HashMap::new();
        let mut ngrams: HashMap<Vec<u32>, NgramEntry> = HashMap::new();
        let mut order = 0usize;
        let mut section = 0usize; // current n of "\n-grams:", 0 outside
        let mut seen_data = false;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if line == "\\data\\" {
                seen_data = true;
                continue;
            }
            if line == "\\end\\" {
                break;
            }
            if let Some(rest) = line.strip_prefix("ngram ") {
                // "ngram N=count" header entries
                if let Some((n, _)) = rest.split_once('=')
                    && let Ok(n) = n.trim().parse::<usize>()
                {
                    order = order.max(n);
                }
                continue;
            }
            if line.starts_with('\\') && line.ends_with("-grams:") {
                let n: usize = line[1..line.len() - "-grams:".len()]
                    .parse()
                    .map_err(|_| LmError::Format(format!("bad section header: {line}")))?;
                section = n;
                continue;
            }

            if section == 0 {
                continue;
            }

            let mut cols = line.split_whitespace();
            let logp: f32 = cols
                .next()
                .and_then(|c| c.parse().ok())
                .ok_or_else(|| LmError::Format(format!("bad n-gram line: {line}")))?;
            let mut key = Vec::with_capacity(section);
            for _ in 0..section {
                let w = cols
                    .next()
                    .ok_or_else(|| LmError::Format(format!("short n-gram line: {line}")))?;
                let next_id = words.len() as u32;
                let id = *words.entry(w.to_string()).or_insert(next_id);
                key.push(id);
            }
            let backoff: f32 = cols.next().and_then(|c| c.parse().ok()).unwrap_or(0.0);

            ngrams.insert(
                key,
                NgramEntry {
                    logp: logp * LN_10,
                    backoff: backoff * LN_10,
                },
            );
        }

        if !seen_data || order == 0 {
            return Err(LmError::Format("missing \\data\\ header".to_string()));
        }

        let unk = words
            .get("<unk>")
            .and_then(|&id| ngrams.get(&vec![id]))
            .map_or(DEFAULT_UNK, |e| e.logp);

        tracing::debug!(
            order,
            words = words.len(),
            ngrams = ngrams.len(),
            "loaded ARPA language model"
        );

        Ok(Self {
            words,
            ngrams,
            order,
            unk,
            pieces: strip_pieces(vocab, tok_sep),
        })
    }

    /// Save the model to a binary file.
    ///
    /// Format (little-endian):
    /// ```text
    /// [4B] magic "ZALM"
    /// [2B] version (u16)
    /// [2B] order (u16)
    /// [4B] word_count (u32); word id i is the i-th entry
    /// For each word: [2B] len (u16), [len B] UTF-8 bytes
    /// [4B] unk log-prob (f32)
    /// [4B] ngram_count (u32)
    /// For each n-gram: [1B] n (u8), [4B]×n word ids, [4B] logp, [4B] backoff
    /// ```
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let mut w = BufWriter::new(file);

        w.write_all(MAGIC)?;
        w.write_all(&VERSION.to_le_bytes())?;
        w.write_all(&(self.order as u16).to_le_bytes())?;

        let mut by_id: Vec<&str> = vec![""; self.words.len()];
        for (word, &id) in &self.words {
            by_id[id as usize] = word;
        }
        w.write_all(&(by_id.len() as u32).to_le_bytes())?;
        for word in by_id {
            let bytes = word.as_bytes();
            w.write_all(&(bytes.len() as u16).to_le_bytes())?;
            w.write_all(bytes)?;
        }
        w.write_all(&self.unk.to_le_bytes())?;

        w.write_all(&(self.ngrams.len() as u32).to_le_bytes())?;
        for (key, entry) in &self.ngrams {
            w.write_all(&[key.len() as u8])?;
            for &id in key {
                w.write_all(&id.to_le_bytes())?;
            }
            w.write_all(&entry.logp.to_le_bytes())?;
            w.write_all(&entry.backoff.to_le_bytes())?;
        }

        w.flush()?;
        Ok(())
    }

    /// Load a model saved by [`ArpaLm::save`].
    pub fn load_binary(
        path: impl AsRef<Path>,
        vocab: &[String],
        tok_sep: &str,
    ) -> Result<Self> {
        const MAX_WORDS: usize = 10_000_000;
        const MAX_NGRAMS: usize = 100_000_000;

        let file = File::open(path.as_ref())?;
        let mut r = BufReader::new(file);

        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(LmError::Format("invalid magic: expected ZALM".to_string()));
        }

        let mut buf2 = [0u8; 2];
        r.read_exact(&mut buf2)?;
        let version = u16::from_le_bytes(buf2);
        if version != VERSION {
            return Err(LmError::Format(format!("unsupported version: {version}")));
        }
        r.read_exact(&mut buf2)?;
        let order = u16::from_le_bytes(buf2) as usize;

        let mut buf4 = [0u8; 4];
        r.read_exact(&mut buf4)?;
        let word_count = u32::from_le_bytes(buf4) as usize;
        if word_count > MAX_WORDS {
            return Err(LmError::Format(format!(
                "word_count too large: {word_count} (max {MAX_WORDS})"
            )));
        }
        let mut words = HashMap::with_capacity(word_count);
        for id in 0..word_count {
            r.read_exact(&mut buf2)?;
            let len = u16::from_le_bytes(buf2) as usize;
            let mut bytes = vec![0u8; len];
            r.read_exact(&mut bytes)?;
            let word = String::from_utf8(bytes)
                .map_err(|e| LmError::Format(format!("invalid UTF-8 in word: {e}")))?;
            words.insert(word, id as u32);
        }

        r.read_exact(&mut buf4)?;
        let unk = f32::from_le_bytes(buf4);

        r.read_exact(&mut buf4)?;
        let ngram_count = u32::from_le_bytes(buf4) as usize;
        if ngram_count > MAX_NGRAMS {
            return Err(LmError::Format(format!(
                "ngram_count too large: {ngram_count} (max {MAX_NGRAMS})"
            )));
        }
        let mut ngrams = HashMap::with_capacity(ngram_count);
        let mut buf1 = [0u8; 1];
        for _ in 0..ngram_count {
            r.read_exact(&mut buf1)?;
            let n = buf1[0] as usize;
            if n == 0 || n > order {
                return Err(LmError::Format(format!("n-gram length {n} out of range")));
            }
            let mut key = Vec::with_capacity(n);
            for _ in 0..n {
                r.read_exact(&mut buf4)?;
                key.push(u32::from_le_bytes(buf4));
            }
            r.read_exact(&mut buf4)?;
            let logp = f32::from_le_bytes(buf4);
            r.read_exact(&mut buf4)?;
            let backoff = f32::from_le_bytes(buf4);
            ngrams.insert(key, NgramEntry { logp, backoff });
        }

        Ok(Self {
            words,
            ngrams,
            order,
            unk,
            pieces: strip_pieces(vocab, tok_sep),
        })
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// Assemble a surface word from sub-word token ids.
    fn assemble(&self, word_tokens: &[u32]) -> String {
        let mut word = String::new();
        for &tok in word_tokens {
            if let Some(piece) = self.pieces.get(tok as usize) {
                word.push_str(piece);
            }
        }
        word
    }

    /// Backoff query: `p(word | context)` in natural log.
    fn ngram_logp(&self, context: &[u32], word: u32) -> f32 {
        let mut penalty = 0.0f32;
        let mut ctx = context;
        loop {
            let mut key = Vec::with_capacity(ctx.len() + 1);
            key.extend_from_slice(ctx);
            key.push(word);
            if let Some(entry) = self.ngrams.get(&key) {
                return penalty + entry.logp;
            }
            if ctx.is_empty() {
                return penalty + self.unk;
            }
            penalty += self.ngrams.get(ctx).map_or(0.0, |e| e.backoff);
            ctx = &ctx[1..];
        }
    }

    /// Successor state: the longest known suffix of `context + word`.
    fn next_state(&self, context: &[u32], word: u32) -> LmState {
        let mut state: Vec<u32> = context.to_vec();
        state.push(word);
        let keep = self.order.saturating_sub(1);
        if state.len() > keep {
            state.drain(..state.len() - keep);
        }
        while !state.is_empty() && !self.ngrams.contains_key(&state) {
            state.remove(0);
        }
        LmState(state)
    }
}

impl LanguageModel for ArpaLm {
    fn initial_state(&self) -> LmState {
        LmState::empty()
    }

    fn score(&self, state: &LmState, word_tokens: &[u32]) -> (LmState, f32) {
        let word = self.assemble(word_tokens);
        match self.words.get(&word) {
            Some(&id) => (self.next_state(&state.0, id), self.ngram_logp(&state.0, id)),
            None => (LmState::empty(), self.unk),
        }
    }

    fn unk_penalty(&self) -> f32 {
        self.unk
    }
}

fn strip_pieces(vocab: &[String], tok_sep: &str) -> Vec<String> {
    vocab
        .iter()
        .map(|surface| {
            if !tok_sep.is_empty()
                && let Some(stripped) = surface.strip_prefix(tok_sep)
            {
                stripped.to_string()
            } else {
                surface.clone()
            }
        })
        .collect()
}
