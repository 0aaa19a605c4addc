//! Deterministic token-trie acceptors for lexicon constraints and hot words.
//!
//! An [`Fst`] is a weighted acceptor over token ids: start state `0`, one
//! path per accepted token sequence with shared prefixes, final states
//! carrying the sequence's weight. Lexicons are built from word lists by
//! greedy longest-prefix tokenization against the decoder vocabulary;
//! hot-word automata are built directly from token-id sequences.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::Deserialize;
use yada::DoubleArray;
use yada::builder::DoubleArrayBuilder;

/// Errors that can occur while building, loading or saving an FST.
#[derive(Debug, thiserror::Error)]
pub enum FstError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("JSON parse error")]
    Json(#[from] serde_json::Error),

    #[error("invalid FST format: {0}")]
    Format(String),

    #[error("FST build failed: {0}")]
    Build(String),
}

type Result<T> = std::result::Result<T, FstError>;

const MAGIC: &[u8; 4] = b"ZFST";
const VERSION: u16 = 1;

/// Outgoing transition, sorted by `label` within its state.
#[derive(Debug, Clone, Copy)]
pub struct FstArc {
    pub label: u32,
    pub weight: f32,
    pub target: u32,
}

#[derive(Debug, Clone, Default)]
struct FstStateData {
    final_weight: Option<f32>,
    arcs: Vec<FstArc>,
}

/// Deterministic weighted acceptor over token ids.
#[derive(Debug, Clone)]
pub struct Fst {
    states: Vec<FstStateData>,
    alphabet_size: u32,
}

impl Fst {
    /// The start state of every automaton.
    pub const START: u32 = 0;

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    pub fn alphabet_size(&self) -> u32 {
        self.alphabet_size
    }

    /// Follow the transition from `state` under `label`.
    #[inline]
    pub fn step(&self, state: u32, label: u32) -> Option<(u32, f32)> {
        let arcs = &self.states[state as usize].arcs;
        arcs.binary_search_by(|arc| arc.label.cmp(&label))
            .ok()
            .map(|i| (arcs[i].target, arcs[i].weight))
    }

    /// Weight of `state` if it accepts, `None` otherwise.
    #[inline]
    pub fn final_weight(&self, state: u32) -> Option<f32> {
        self.states[state as usize].final_weight
    }

    pub fn arcs(&self, state: u32) -> &[FstArc] {
        &self.states[state as usize].arcs
    }

    /// Save to a binary file.
    ///
    /// Format (little-endian):
    /// ```text
    /// [4B] magic "ZFST"
    /// [2B] version (u16)
    /// [4B] state_count (u32)
    /// [4B] alphabet_size (u32)
    /// For each state:
    ///   [1B] is_final (u8)
    ///   [4B] final_weight (f32, present iff is_final)
    ///   [4B] arc_count (u32)
    ///   For each arc (sorted by in_label):
    ///     [4B] in_label (u32), [4B] weight (f32), [4B] target (u32)
    /// ```
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let mut w = BufWriter::new(file);

        w.write_all(MAGIC)?;
        w.write_all(&VERSION.to_le_bytes())?;
        w.write_all(&(self.states.len() as u32).to_le_bytes())?;
        w.write_all(&self.alphabet_size.to_le_bytes())?;

        for state in &self.states {
            match state.final_weight {
                Some(weight) => {
                    w.write_all(&[1u8])?;
                    w.write_all(&weight.to_le_bytes())?;
                }
                None => w.write_all(&[0u8])?,
            }
            w.write_all(&(state.arcs.len() as u32).to_le_bytes())?;
            for arc in &state.arcs {
                w.write_all(&arc.label.to_le_bytes())?;
                w.write_all(&arc.weight.to_le_bytes())?;
                w.write_all(&arc.target.to_le_bytes())?;
            }
        }

        w.flush()?;
        Ok(())
    }

    /// Load a binary file written by [`Fst::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        const MAX_STATES: usize = 10_000_000;

        let file = File::open(path.as_ref())?;
        let mut r = BufReader::new(file);

        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(FstError::Format("invalid magic: expected ZFST".to_string()));
        }

        let mut buf2 = [0u8; 2];
        r.read_exact(&mut buf2)?;
        let version = u16::from_le_bytes(buf2);
        if version != VERSION {
            return Err(FstError::Format(format!("unsupported version: {version}")));
        }

        let mut buf4 = [0u8; 4];
        r.read_exact(&mut buf4)?;
        let state_count = u32::from_le_bytes(buf4) as usize;
        if state_count > MAX_STATES {
            return Err(FstError::Format(format!(
                "state_count too large: {state_count} (max {MAX_STATES})"
            )));
        }
        r.read_exact(&mut buf4)?;
        let alphabet_size = u32::from_le_bytes(buf4);

        let mut states = Vec::with_capacity(state_count);
        let mut buf1 = [0u8; 1];
        for _ in 0..state_count {
            r.read_exact(&mut buf1)?;
            let final_weight = if buf1[0] != 0 {
                r.read_exact(&mut buf4)?;
                Some(f32::from_le_bytes(buf4))
            } else {
                None
            };

            r.read_exact(&mut buf4)?;
            let arc_count = u32::from_le_bytes(buf4);
            if arc_count > alphabet_size {
                return Err(FstError::Format(format!(
                    "arc_count {arc_count} exceeds alphabet size {alphabet_size}"
                )));
            }
            let mut arcs = Vec::with_capacity(arc_count as usize);
            let mut prev_label: Option<u32> = None;
            for _ in 0..arc_count {
                r.read_exact(&mut buf4)?;
                let label = u32::from_le_bytes(buf4);
                r.read_exact(&mut buf4)?;
                let weight = f32::from_le_bytes(buf4);
                r.read_exact(&mut buf4)?;
                let target = u32::from_le_bytes(buf4);

                if label >= alphabet_size {
                    return Err(FstError::Format(format!(
                        "arc label {label} out of alphabet range"
                    )));
                }
                if target as usize >= state_count {
                    return Err(FstError::Format(format!(
                        "arc target {target} out of state range"
                    )));
                }
                if let Some(prev) = prev_label
                    && label <= prev
                {
                    return Err(FstError::Format("arcs not sorted by label".to_string()));
                }
                prev_label = Some(label);
                arcs.push(FstArc {
                    label,
                    weight,
                    target,
                });
            }
            states.push(FstStateData { final_weight, arcs });
        }

        if states.is_empty() {
            return Err(FstError::Format("empty automaton".to_string()));
        }

        Ok(Self {
            states,
            alphabet_size,
        })
    }

    /// Build a lexicon acceptor from `(word, weight)` pairs.
    ///
    /// Words are tokenized by greedy longest-prefix match against the
    /// vocabulary; words with an untokenizable residue are skipped and
    /// returned so the caller can report them.
    pub fn build_lexicon(
        words: &[(String, f32)],
        vocab: &[String],
        tok_sep: &str,
    ) -> Result<(Self, Vec<String>)> {
        let tokenizer = WordTokenizer::new(vocab, tok_sep)?;
        let mut builder = TrieBuilder::new(vocab.len() as u32);
        let mut skipped = Vec::new();

        for (word, weight) in words {
            match tokenizer.tokenize(word) {
                Some(tokens) => builder.add_path(&tokens, 0.0, *weight),
                None => {
                    tracing::warn!(word, "word not tokenizable with this vocabulary, skipping");
                    skipped.push(word.clone());
                }
            }
        }

        Ok((builder.finish(), skipped))
    }

    /// Build a hot-word acceptor from token-id sequences.
    ///
    /// Each sequence's weight is spread evenly across its arcs, so a fully
    /// matched hot word accrues exactly its configured weight; the final
    /// state records the full weight. Arcs shared between hot words keep
    /// the larger per-arc weight.
    pub fn build_hotwords(
        sequences: &[Vec<u32>],
        weights: &[f32],
        alphabet_size: u32,
    ) -> Result<Self> {
        debug_assert_eq!(sequences.len(), weights.len());
        let mut builder = TrieBuilder::new(alphabet_size);
        for (tokens, &weight) in sequences.iter().zip(weights) {
            if tokens.is_empty() {
                return Err(FstError::Build("empty hot-word token sequence".to_string()));
            }
            if let Some(&tok) = tokens.iter().find(|&&t| t >= alphabet_size) {
                return Err(FstError::Build(format!(
                    "hot-word token {tok} out of vocabulary range"
                )));
            }
            builder.add_path(tokens, weight / tokens.len() as f32, weight);
        }
        Ok(builder.finish())
    }
}

/// Incremental trie construction with prefix sharing.
struct TrieBuilder {
    states: Vec<FstStateData>,
    alphabet_size: u32,
}

impl TrieBuilder {
    fn new(alphabet_size: u32) -> Self {
        Self {
            states: vec![FstStateData::default()],
            alphabet_size,
        }
    }

    fn add_path(&mut self, tokens: &[u32], arc_weight: f32, final_weight: f32) {
        let mut state = 0usize;
        for &token in tokens {
            let existing = self.states[state]
                .arcs
                .iter()
                .position(|arc| arc.label == token);
            state = match existing {
                Some(i) => {
                    let arc = &mut self.states[state].arcs[i];
                    arc.weight = arc.weight.max(arc_weight);
                    arc.target as usize
                }
                None => {
                    let target = self.states.len();
                    self.states.push(FstStateData::default());
                    self.states[state].arcs.push(FstArc {
                        label: token,
                        weight: arc_weight,
                        target: target as u32,
                    });
                    target
                }
            };
        }
        let terminal = &mut self.states[state];
        terminal.final_weight = Some(match terminal.final_weight {
            Some(existing) => existing.max(final_weight),
            None => final_weight,
        });
    }

    fn finish(mut self) -> Fst {
        for state in &mut self.states {
            state.arcs.sort_unstable_by_key(|arc| arc.label);
        }
        Fst {
            states: self.states,
            alphabet_size: self.alphabet_size,
        }
    }
}

/// Greedy longest-prefix tokenizer over a sub-word vocabulary.
///
/// Word-initial pieces and continuation pieces (surfaces starting with the
/// continuation marker) live in separate double-array tries; tokenization
/// takes the longest word-initial match, then repeatedly the longest
/// continuation match until the word is consumed.
pub struct WordTokenizer {
    initial: Option<DoubleArray<Vec<u8>>>,
    continuation: Option<DoubleArray<Vec<u8>>>,
}

impl WordTokenizer {
    pub fn new(vocab: &[String], tok_sep: &str) -> Result<Self> {
        let mut initial: Vec<(&str, u32)> = Vec::new();
        let mut continuation: Vec<(&str, u32)> = Vec::new();

        for (id, surface) in vocab.iter().enumerate() {
            if surface.is_empty() {
                continue;
            }
            if !tok_sep.is_empty()
                && let Some(stripped) = surface.strip_prefix(tok_sep)
            {
                if !stripped.is_empty() {
                    continuation.push((stripped, id as u32));
                }
            } else {
                initial.push((surface.as_str(), id as u32));
            }
        }

        Ok(Self {
            initial: build_trie(initial, "word-initial")?,
            continuation: build_trie(continuation, "continuation")?,
        })
    }

    /// Token ids covering `word` exactly, or `None` if any residue remains.
    pub fn tokenize(&self, word: &str) -> Option<Vec<u32>> {
        let bytes = word.as_bytes();
        if bytes.is_empty() {
            return None;
        }
        let mut tokens = Vec::new();
        let mut pos = 0usize;
        let mut trie = self.initial.as_ref();
        while pos < bytes.len() {
            let (token, len) = longest_match(trie?, &bytes[pos..])?;
            tokens.push(token);
            pos += len;
            trie = self.continuation.as_ref();
        }
        Some(tokens)
    }
}

fn build_trie(mut keyset: Vec<(&str, u32)>, kind: &str) -> Result<Option<DoubleArray<Vec<u8>>>> {
    if keyset.is_empty() {
        return Ok(None);
    }
    keyset.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
    keyset.dedup_by(|b, a| {
        if a.0 == b.0 {
            tracing::warn!(surface = a.0, "duplicate {kind} surface, keeping first");
            true
        } else {
            false
        }
    });
    let keys: Vec<(&[u8], u32)> = keyset.iter().map(|(s, id)| (s.as_bytes(), *id)).collect();
    let bytes = DoubleArrayBuilder::build(&keys)
        .ok_or_else(|| FstError::Build(format!("failed to build {kind} trie")))?;
    Ok(Some(DoubleArray::new(bytes)))
}

fn longest_match(trie: &DoubleArray<Vec<u8>>, input: &[u8]) -> Option<(u32, usize)> {
    trie.common_prefix_search(input).last()
}

/// Parse a JSON word list: an array of `{word, weight}` objects
/// (`weight` defaults to 0).
pub fn parse_word_list_json(path: impl AsRef<Path>) -> Result<Vec<(String, f32)>> {
    #[derive(Deserialize)]
    struct JsonWord {
        word: String,
        #[serde(default)]
        weight: f32,
    }

    let file = File::open(path.as_ref())?;
    let reader = BufReader::new(file);
    let entries: Vec<JsonWord> = serde_json::from_reader(reader)?;
    Ok(entries.into_iter().map(|e| (e.word, e.weight)).collect())
}

/// Parse a plain-text word list: one `word[\tweight]` per line.
/// Lines starting with `#` are comments, empty lines are skipped.
pub fn parse_word_list_text(path: impl AsRef<Path>) -> Result<Vec<(String, f32)>> {
    let file = File::open(path.as_ref())?;
    let reader = BufReader::new(file);
    let mut words = Vec::new();

    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.split_once('\t') {
            Some((word, weight)) => {
                let weight: f32 = weight.trim().parse().map_err(|_| {
                    FstError::Format(format!("bad weight on line: {line}"))
                })?;
                words.push((word.to_string(), weight));
            }
            None => words.push((line.to_string(), 0.0)),
        }
    }

    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    fn vocab() -> Vec<String> {
        ["_", "he", "#llo", "wor", "#ld", "a", "#b", "#c"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_tokenize_wordpiece() {
        let tok = WordTokenizer::new(&vocab(), "#").unwrap();
        assert_eq!(tok.tokenize("hello"), Some(vec![1, 2]));
        assert_eq!(tok.tokenize("world"), Some(vec![3, 4]));
        assert_eq!(tok.tokenize("ab"), Some(vec![5, 6]));
        assert_eq!(tok.tokenize("xyz"), None);
        assert_eq!(tok.tokenize(""), None);
    }

    #[test]
    fn test_tokenize_prefers_longest_match() {
        let vocab: Vec<String> = ["h", "he", "#l", "#llo"].iter().map(|s| s.to_string()).collect();
        let tok = WordTokenizer::new(&vocab, "#").unwrap();
        assert_eq!(tok.tokenize("hello"), Some(vec![1, 3]));
    }

    #[test]
    fn test_lexicon_paths_share_prefixes() {
        let words = vec![("ab".to_string(), 0.0), ("ac".to_string(), 0.0)];
        let (fst, skipped) = Fst::build_lexicon(&words, &vocab(), "#").unwrap();
        assert!(skipped.is_empty());

        let (s1, w1) = fst.step(Fst::START, 5).unwrap();
        assert_eq!(w1, 0.0);
        let (s2, _) = fst.step(s1, 6).unwrap();
        let (s3, _) = fst.step(s1, 7).unwrap();
        assert_ne!(s2, s3);
        assert_eq!(fst.final_weight(s2), Some(0.0));
        assert_eq!(fst.final_weight(s3), Some(0.0));
        assert!(fst.step(s1, 1).is_none());
        // "a" then "b" share the state after "a"
        assert_eq!(fst.state_count(), 4);
    }

    #[test]
    fn test_lexicon_reports_skipped_words() {
        let words = vec![("hello".to_string(), 0.0), ("qqq".to_string(), 0.0)];
        let (_, skipped) = Fst::build_lexicon(&words, &vocab(), "#").unwrap();
        assert_eq!(skipped, vec!["qqq".to_string()]);
    }

    #[test]
    fn test_hotword_weight_is_spread_over_arcs() {
        let fst = Fst::build_hotwords(&[vec![5, 6]], &[10.0], 8).unwrap();
        let (s1, w1) = fst.step(Fst::START, 5).unwrap();
        let (s2, w2) = fst.step(s1, 6).unwrap();
        assert!((w1 - 5.0).abs() < 1e-6);
        assert!((w2 - 5.0).abs() < 1e-6);
        assert_eq!(fst.final_weight(s2), Some(10.0));
    }

    #[test]
    fn test_hotword_shared_arc_keeps_larger_weight() {
        let fst = Fst::build_hotwords(&[vec![5, 6], vec![5, 7]], &[10.0, 4.0], 8).unwrap();
        let (_, w) = fst.step(Fst::START, 5).unwrap();
        assert!((w - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_hotword_rejects_out_of_range_token() {
        assert!(Fst::build_hotwords(&[vec![9]], &[1.0], 8).is_err());
        assert!(Fst::build_hotwords(&[vec![]], &[1.0], 8).is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let words = vec![("hello".to_string(), 1.5), ("ab".to_string(), 0.0)];
        let (fst, _) = Fst::build_lexicon(&words, &vocab(), "#").unwrap();

        let f = NamedTempFile::new().unwrap();
        fst.save(f.path()).unwrap();
        let loaded = Fst::load(f.path()).unwrap();

        assert_eq!(loaded.state_count(), fst.state_count());
        assert_eq!(loaded.alphabet_size(), fst.alphabet_size());
        let (s1, _) = loaded.step(Fst::START, 1).unwrap();
        let (s2, _) = loaded.step(s1, 2).unwrap();
        assert_eq!(loaded.final_weight(s2), Some(1.5));
    }

    #[test]
    fn test_load_rejects_bad_magic() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"NOPE").unwrap();
        f.flush().unwrap();
        match Fst::load(f.path()) {
            Err(FstError::Format(msg)) => assert!(msg.contains("magic")),
            other => panic!("expected format error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_word_list_text() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"# comment\nhello\t1.5\nworld\n\n").unwrap();
        f.flush().unwrap();
        let words = parse_word_list_text(f.path()).unwrap();
        assert_eq!(
            words,
            vec![("hello".to_string(), 1.5), ("world".to_string(), 0.0)]
        );
    }

    #[test]
    fn test_parse_word_list_json() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(br#"[{"word": "hello", "weight": 2.0}, {"word": "ab"}]"#)
            .unwrap();
        f.flush().unwrap();
        let words = parse_word_list_json(f.path()).unwrap();
        assert_eq!(
            words,
            vec![("hello".to_string(), 2.0), ("ab".to_string(), 0.0)]
        );
    }
}
