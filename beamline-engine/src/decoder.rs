//! Batched CTC prefix beam search.
//!
//! [`Decoder`] is constructed once (validating the configuration and
//! loading the optional language model and lexicon) and then reused across
//! calls; a long-lived worker pool decodes the samples of each batch in
//! parallel. Each worker owns its sample's prefix-tree arena and beam set
//! and writes only into that sample's slices of the caller's output
//! buffers, so samples never share mutable state.

use std::sync::Arc;

use rayon::prelude::*;

use crate::beam::{BeamSet, log_add};
use crate::config::DecoderConfig;
use crate::error::{DecodeError, Result};
use crate::fst::Fst;
use crate::lm::{ArpaLm, LanguageModel};
use crate::logits::{CandidateCutoff, PosteriorView, SortedIndices};
use crate::scorer::Scorer;
use crate::tree::{NodeId, PrefixTree};

/// Borrowed `[B, T, V]` batch of post-softmax frame posteriors.
#[derive(Debug, Clone, Copy)]
pub struct LogitsBatch<'a> {
    pub probs: &'a [f32],
    pub batch: usize,
    pub frames: usize,
    pub vocab: usize,
}

/// Caller-owned output buffers: `labels` and `timesteps` are `[B, K, T]`,
/// `seq_pos` is `[B, K]`. Beam `k` of sample `b` occupies
/// `labels[b, k, seq_pos[b, k]..T]` right-aligned; the unused prefix is
/// zero-filled.
pub struct OutputBuffers<'a> {
    pub labels: &'a mut [i32],
    pub timesteps: &'a mut [i32],
    pub seq_pos: &'a mut [i32],
}

/// Hot words for one decode call: token-id sequences with either one
/// weight per sequence or a single weight broadcast over all of them.
#[derive(Debug, Clone, Copy)]
pub struct Hotwords<'a> {
    pub ids: &'a [Vec<u32>],
    pub weights: &'a [f32],
}

pub struct Decoder {
    cfg: DecoderConfig,
    scorer: Scorer,
    pool: rayon::ThreadPool,
}

impl Decoder {
    /// Build a decoder, loading the language model and lexicon named in the
    /// configuration.
    pub fn new(cfg: DecoderConfig) -> Result<Self> {
        cfg.validate()?;
        let lm: Option<Arc<dyn LanguageModel>> = match &cfg.lm_path {
            Some(path) => Some(Arc::new(ArpaLm::from_path(path, &cfg.vocab, &cfg.tok_sep)?)),
            None => None,
        };
        Self::with_language_model(cfg, lm)
    }

    /// Build a decoder with an injected language model, for callers that
    /// adapt an external n-gram library instead of using the bundled one.
    pub fn with_language_model(
        cfg: DecoderConfig,
        lm: Option<Arc<dyn LanguageModel>>,
    ) -> Result<Self> {
        cfg.validate()?;

        let apostrophe_id = cfg.apostrophe_id();
        if apostrophe_id.is_none() {
            tracing::warn!("vocabulary has no apostrophe token, contractions will split words");
        }

        let lexicon = match &cfg.lexicon_fst_path {
            Some(path) => Some(Arc::new(Fst::load(path)?)),
            None => None,
        };

        let scorer = Scorer::new(
            &cfg.vocab,
            &cfg.tok_sep,
            apostrophe_id,
            cfg.alpha,
            cfg.beta,
            cfg.unk_lexicon_penalty,
            lm,
            lexicon,
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(cfg.thread_count)
            .build()
            .map_err(|e| DecodeError::Pool(e.into()))?;

        Ok(Self { cfg, scorer, pool })
    }

    pub fn beam_width(&self) -> usize {
        self.cfg.beam_width
    }

    pub fn vocab_size(&self) -> usize {
        self.cfg.vocab_size()
    }

    /// Decode a batch of samples into the caller's buffers.
    ///
    /// On return every `(b, k)` slot is populated: labels and timesteps
    /// right-aligned from `seq_pos[b, k] = T - depth`, zeros before that,
    /// and empty padding beams where fewer than `beam_width` survive.
    pub fn decode_batch(
        &self,
        logits: &LogitsBatch<'_>,
        seq_lens: &[usize],
        out: &mut OutputBuffers<'_>,
        hotwords: Option<&Hotwords<'_>>,
    ) -> Result<()> {
        self.check_shapes(logits, seq_lens, out)?;

        let hw_fst = match hotwords {
            Some(hw) => Some(self.build_hotword_fst(hw)?),
            None => None,
        };

        let k = self.cfg.beam_width;
        let t = logits.frames;
        let v = logits.vocab;
        let kt = k * t;

        if logits.batch == 0 || t == 0 {
            out.seq_pos.fill(t as i32);
            return Ok(());
        }

        let sample = SampleDecoder {
            cfg: &self.cfg,
            scorer: &self.scorer,
            hotwords: hw_fst.as_ref(),
            frames: t,
        };

        self.pool.install(|| {
            out.labels
                .par_chunks_mut(kt)
                .zip(out.timesteps.par_chunks_mut(kt))
                .zip(out.seq_pos.par_chunks_mut(k))
                .enumerate()
                .for_each(|(b, ((labels, timesteps), seq_pos))| {
                    let probs = &logits.probs[b * t * v..(b + 1) * t * v];
                    sample.run(probs, v, seq_lens[b], labels, timesteps, seq_pos);
                });
        });

        tracing::debug!(
            batch = logits.batch,
            frames = t,
            beam_width = k,
            hotwords = hw_fst.as_ref().map_or(0, |f| f.state_count()),
            "batch decoded"
        );
        Ok(())
    }

    fn check_shapes(
        &self,
        logits: &LogitsBatch<'_>,
        seq_lens: &[usize],
        out: &OutputBuffers<'_>,
    ) -> Result<()> {
        let (b, t, v) = (logits.batch, logits.frames, logits.vocab);
        if v != self.cfg.vocab_size() {
            return Err(DecodeError::Shape(format!(
                "logits vocab {v} does not match decoder vocabulary {}",
                self.cfg.vocab_size()
            )));
        }
        if logits.probs.len() != b * t * v {
            return Err(DecodeError::Shape(format!(
                "logits length {} does not match [{b}, {t}, {v}]",
                logits.probs.len()
            )));
        }
        if seq_lens.len() != b {
            return Err(DecodeError::Shape(format!(
                "seq_lens length {} does not match batch {b}",
                seq_lens.len()
            )));
        }
        if let Some(&bad) = seq_lens.iter().find(|&&len| len > t) {
            return Err(DecodeError::Shape(format!(
                "sequence length {bad} exceeds frame count {t}"
            )));
        }
        let k = self.cfg.beam_width;
        if out.labels.len() != b * k * t || out.timesteps.len() != b * k * t {
            return Err(DecodeError::Shape(format!(
                "output buffers do not match [{b}, {k}, {t}]"
            )));
        }
        if out.seq_pos.len() != b * k {
            return Err(DecodeError::Shape(format!(
                "seq_pos length {} does not match [{b}, {k}]",
                out.seq_pos.len()
            )));
        }
        Ok(())
    }

    fn build_hotword_fst(&self, hw: &Hotwords<'_>) -> Result<Fst> {
        if hw.ids.is_empty() {
            return Err(DecodeError::Shape("empty hot-word list".to_string()));
        }
        let weights: Vec<f32> = if hw.weights.len() == hw.ids.len() {
            hw.weights.to_vec()
        } else if hw.weights.len() == 1 {
            vec![hw.weights[0]; hw.ids.len()]
        } else {
            return Err(DecodeError::Shape(format!(
                "hotword weights length {} does not match {} hot words",
                hw.weights.len(),
                hw.ids.len()
            )));
        };
        Ok(Fst::build_hotwords(
            hw.ids,
            &weights,
            self.cfg.vocab_size() as u32,
        )?)
    }
}

/// Per-sample decoding state shared read-only across the worker pool.
struct SampleDecoder<'a> {
    cfg: &'a DecoderConfig,
    scorer: &'a Scorer,
    hotwords: Option<&'a Fst>,
    /// Padded frame dimension of the output buffers.
    frames: usize,
}

impl SampleDecoder<'_> {
    fn run(
        &self,
        probs: &[f32],
        vocab: usize,
        seq_len: usize,
        labels: &mut [i32],
        timesteps: &mut [i32],
        seq_pos: &mut [i32],
    ) {
        labels.fill(0);
        timesteps.fill(0);
        seq_pos.fill(self.frames as i32);

        let view = PosteriorView::new(&probs[..seq_len * vocab], seq_len, vocab);
        let sorted = view.sorted_indices();
        let (tree, survivors, beams) = self.search(&view, &sorted);
        self.emit(&tree, &beams, &survivors, labels, timesteps, seq_pos);
    }

    /// Run the per-frame extension loop and return the surviving beams.
    fn search(
        &self,
        view: &PosteriorView<'_>,
        sorted: &SortedIndices,
    ) -> (PrefixTree, Vec<NodeId>, BeamSet) {
        let cutoff = CandidateCutoff {
            top_n: self.cfg.cutoff_top_n,
            cutoff_prob: self.cfg.cutoff_prob,
            min_tok_prob: self.cfg.min_tok_prob,
            blank_id: self.cfg.blank_id,
        };

        let (lm0, lex0, hw0) = self.scorer.root_state(self.hotwords);
        let mut tree = PrefixTree::new(lm0, lex0, hw0);
        let mut beams = BeamSet::new(
            self.cfg.beam_width,
            self.cfg.beta,
            self.cfg.max_beam_deviation,
        );
        let mut survivors = vec![tree.root()];
        let mut candidates = Vec::with_capacity(cutoff.top_n);

        for t in 0..view.frames() {
            view.frame_candidates(t, sorted, &cutoff, &mut candidates);
            beams.begin_frame(&mut tree, &survivors);
            let log_blank = view.log_prob(t, self.cfg.blank_id);

            for &id in &survivors {
                let (p_b_prev, p_nb_prev, last, depth, parent_ext) = {
                    let node = tree.get(id);
                    (
                        node.p_b_prev,
                        node.p_nb_prev,
                        node.token,
                        node.depth,
                        node.ext_score,
                    )
                };
                let total_prev = log_add(p_b_prev, p_nb_prev);

                // The prefix survives this frame on a blank...
                beams.touch_b(&mut tree, id, log_blank + total_prev);

                // ...or by repeating its last token without a blank gap.
                if depth > 0 {
                    beams.touch_nb(&mut tree, id, view.log_prob(t, last) + p_nb_prev);
                }

                // Fresh extensions by this frame's candidate tokens. A
                // candidate equal to the last token may only grow out of
                // the blank-ended mass; everything else was the repeat.
                for &c in &candidates {
                    let mass = if depth > 0 && c == last {
                        p_b_prev
                    } else {
                        total_prev
                    };
                    if mass == f32::NEG_INFINITY {
                        continue;
                    }
                    let lp = view.log_prob(t, c);
                    if lp == f32::NEG_INFINITY {
                        continue;
                    }

                    let child = match tree.child(id, c) {
                        Some(child) => child,
                        None => {
                            let ext = self.scorer.extend(&tree, id, c, self.hotwords);
                            tree.insert_child(
                                id,
                                c,
                                t,
                                ext.lm_state,
                                ext.lex_state,
                                ext.hw_state,
                                ext.lm_delta,
                                ext.hw_delta,
                                ext.ext_delta,
                            )
                        }
                    };
                    let ext_delta = tree.get(child).ext_score - parent_ext;
                    beams.touch_nb(&mut tree, child, lp + mass + ext_delta);
                }
            }

            // Every contribution underflowed: carry the best previous beam
            // forward unchanged rather than losing the whole decode.
            if beams.is_empty()
                && let Some(&best) = survivors.iter().max_by(|&&a, &&b| {
                    let sa = log_add(tree.get(a).p_b_prev, tree.get(a).p_nb_prev);
                    let sb = log_add(tree.get(b).p_b_prev, tree.get(b).p_nb_prev);
                    sa.total_cmp(&sb).then(b.cmp(&a))
                })
            {
                let (p_b_prev, p_nb_prev) = {
                    let node = tree.get(best);
                    (node.p_b_prev, node.p_nb_prev)
                };
                beams.touch_b(&mut tree, best, p_b_prev);
                beams.touch_nb(&mut tree, best, p_nb_prev);
            }

            survivors = beams.prune(&tree);
        }

        (tree, survivors, beams)
    }

    /// Walk the top beams back to the root and write the caller's slices.
    fn emit(
        &self,
        tree: &PrefixTree,
        beams: &BeamSet,
        survivors: &[NodeId],
        labels: &mut [i32],
        timesteps: &mut [i32],
        seq_pos: &mut [i32],
    ) {
        let mut ranked: Vec<(NodeId, f32)> = survivors
            .iter()
            .map(|&id| (id, beams.score(tree, id)))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(self.cfg.beam_width);

        for (slot, &(id, _)) in ranked.iter().enumerate() {
            let depth = tree.get(id).depth;
            seq_pos[slot] = (self.frames - depth) as i32;

            let row = &mut labels[slot * self.frames..(slot + 1) * self.frames];
            let ts_row = &mut timesteps[slot * self.frames..(slot + 1) * self.frames];
            let mut pos = self.frames;
            let mut cur = id;
            while let Some(parent) = tree.get(cur).parent {
                pos -= 1;
                row[pos] = tree.get(cur).token as i32;
                ts_row[pos] = tree.get(cur).frame as i32;
                cur = parent;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder(vocab: &[&str], beam_width: usize) -> Decoder {
        let cfg = DecoderConfig {
            vocab: vocab.iter().map(|s| s.to_string()).collect(),
            beam_width,
            min_tok_prob: -20.0,
            ..DecoderConfig::default()
        };
        Decoder::new(cfg).unwrap()
    }

    fn sample_decoder<'a>(dec: &'a Decoder, frames: usize) -> SampleDecoder<'a> {
        SampleDecoder {
            cfg: &dec.cfg,
            scorer: &dec.scorer,
            hotwords: None,
            frames,
        }
    }

    #[test]
    fn test_colliding_paths_merge_with_log_sum_exp() {
        // Repeat-continuation of "a" and a fresh extension from the root
        // both land on the prefix "a" in frame 2.
        let dec = decoder(&["_", "a"], 2);
        let probs = [0.1, 0.9, 0.1, 0.9];
        let view = PosteriorView::new(&probs, 2, 2);
        let sorted = view.sorted_indices();
        let (tree, survivors, _) = sample_decoder(&dec, 2).search(&view, &sorted);

        let a = tree.child(tree.root(), 1).unwrap();
        assert!(survivors.contains(&a));
        // p_nb("a") = 0.9*0.9 (repeat) + 0.1*0.9 (root extension) = 0.90
        assert!((tree.get(a).p_nb.exp() - 0.90).abs() < 1e-5);
        assert!((tree.get(a).p_b.exp() - 0.09).abs() < 1e-5);
    }

    #[test]
    fn test_repeat_needs_blank_gap_for_double_token() {
        // Two a-dominant frames with no blank in between cannot produce "aa".
        let dec = decoder(&["_", "a"], 4);
        let probs = [0.1, 0.9, 0.1, 0.9];
        let view = PosteriorView::new(&probs, 2, 2);
        let sorted = view.sorted_indices();
        let (tree, _, _) = sample_decoder(&dec, 2).search(&view, &sorted);

        let a = tree.child(tree.root(), 1).unwrap();
        // The "aa" child exists but only ever saw -inf mass.
        if let Some(aa) = tree.child(a, 1) {
            assert_eq!(tree.get(aa).p_nb, f32::NEG_INFINITY);
        }
    }

    #[test]
    fn test_forced_survival_on_dead_frame() {
        // Frame 2 has zero probability everywhere: every contribution
        // underflows, but the decode must carry the best beam through.
        let dec = decoder(&["_", "a"], 2);
        let probs = [0.1, 0.9, 0.0, 0.0, 0.1, 0.9];
        let view = PosteriorView::new(&probs, 3, 2);
        let sorted = view.sorted_indices();
        let (tree, survivors, _) = sample_decoder(&dec, 3).search(&view, &sorted);

        assert!(!survivors.is_empty());
        let a = tree.child(tree.root(), 1).unwrap();
        assert!(survivors.contains(&a));
    }

    #[test]
    fn test_emit_right_aligns_and_pads() {
        let dec = decoder(&["_", "a", "b"], 2);
        let logits = LogitsBatch {
            probs: &[0.1, 0.8, 0.1, 0.7, 0.2, 0.1],
            batch: 1,
            frames: 2,
            vocab: 3,
        };
        let mut labels = vec![-1i32; 4];
        let mut timesteps = vec![-1i32; 4];
        let mut seq_pos = vec![-1i32; 2];
        let mut out = OutputBuffers {
            labels: &mut labels,
            timesteps: &mut timesteps,
            seq_pos: &mut seq_pos,
        };
        dec.decode_batch(&logits, &[2], &mut out, None).unwrap();

        // Top beam "a": zero prefix then the label, emitted at frame 0.
        assert_eq!(seq_pos[0], 1);
        assert_eq!(&labels[..2], &[0, 1]);
        assert_eq!(&timesteps[..2], &[0, 0]);
        // Second beam exists too (either empty or "a"-sibling), zero-padded.
        assert!(seq_pos[1] >= seq_pos[0]);
    }

    #[test]
    fn test_shape_errors() {
        let dec = decoder(&["_", "a"], 1);
        let probs = [0.5f32, 0.5, 0.5, 0.5];
        let mut labels = vec![0i32; 2];
        let mut timesteps = vec![0i32; 2];
        let mut seq_pos = vec![0i32; 1];

        // vocab mismatch
        let logits = LogitsBatch {
            probs: &probs,
            batch: 1,
            frames: 2,
            vocab: 3,
        };
        let mut out = OutputBuffers {
            labels: &mut labels,
            timesteps: &mut timesteps,
            seq_pos: &mut seq_pos,
        };
        assert!(matches!(
            dec.decode_batch(&logits, &[2], &mut out, None),
            Err(DecodeError::Shape(_))
        ));

        // seq_len exceeding frames
        let logits = LogitsBatch {
            probs: &probs,
            batch: 1,
            frames: 2,
            vocab: 2,
        };
        let mut out = OutputBuffers {
            labels: &mut labels,
            timesteps: &mut timesteps,
            seq_pos: &mut seq_pos,
        };
        assert!(matches!(
            dec.decode_batch(&logits, &[3], &mut out, None),
            Err(DecodeError::Shape(_))
        ));
    }

    #[test]
    fn test_hotword_broadcast_weight() {
        let dec = decoder(&["_", "a", "b"], 1);
        let ids = vec![vec![1], vec![2]];
        let fst = dec
            .build_hotword_fst(&Hotwords {
                ids: &ids,
                weights: &[3.0],
            })
            .unwrap();
        let (_, w1) = fst.step(Fst::START, 1).unwrap();
        let (_, w2) = fst.step(Fst::START, 2).unwrap();
        assert!((w1 - 3.0).abs() < 1e-6);
        assert!((w2 - 3.0).abs() < 1e-6);

        let bad = dec.build_hotword_fst(&Hotwords {
            ids: &ids,
            weights: &[1.0, 2.0, 3.0],
        });
        assert!(matches!(bad, Err(DecodeError::Shape(_))));
    }

    #[test]
    fn test_zero_length_sample_emits_empty_beams() {
        let dec = decoder(&["_", "a"], 2);
        let probs = [0.1f32, 0.9, 0.1, 0.9];
        let logits = LogitsBatch {
            probs: &probs,
            batch: 1,
            frames: 2,
            vocab: 2,
        };
        let mut labels = vec![7i32; 4];
        let mut timesteps = vec![7i32; 4];
        let mut seq_pos = vec![7i32; 2];
        let mut out = OutputBuffers {
            labels: &mut labels,
            timesteps: &mut timesteps,
            seq_pos: &mut seq_pos,
        };
        dec.decode_batch(&logits, &[0], &mut out, None).unwrap();

        assert_eq!(labels, vec![0; 4]);
        assert_eq!(seq_pos, vec![2, 2]);
    }
}
