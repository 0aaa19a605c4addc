//! Read-only view over one sample's frame posteriors.
//!
//! A sample is a contiguous `[T, V]` matrix of per-frame token probabilities
//! (post-softmax, rows summing to ~1). The companion sorted-index matrix
//! orders each frame's tokens by descending probability and drives the
//! per-frame candidate scan.

/// Borrowed `[T, V]` probability matrix for a single sample.
#[derive(Debug, Clone, Copy)]
pub struct PosteriorView<'a> {
    probs: &'a [f32],
    frames: usize,
    vocab: usize,
}

/// Per-frame candidate cutoff parameters.
#[derive(Debug, Clone, Copy)]
pub struct CandidateCutoff {
    /// Maximum candidates admitted per frame.
    pub top_n: usize,
    /// Stop scanning once this much probability mass has been accumulated.
    pub cutoff_prob: f32,
    /// Log-probability floor below which a token is never a candidate.
    pub min_tok_prob: f32,
    /// CTC blank: considered implicitly, never admitted as a candidate.
    pub blank_id: u32,
}

impl<'a> PosteriorView<'a> {
    /// `probs.len()` must equal `frames * vocab`.
    pub fn new(probs: &'a [f32], frames: usize, vocab: usize) -> Self {
        debug_assert_eq!(probs.len(), frames * vocab);
        Self {
            probs,
            frames,
            vocab,
        }
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn vocab(&self) -> usize {
        self.vocab
    }

    #[inline]
    pub fn row(&self, t: usize) -> &'a [f32] {
        &self.probs[t * self.vocab..(t + 1) * self.vocab]
    }

    #[inline]
    pub fn prob(&self, t: usize, token: u32) -> f32 {
        self.probs[t * self.vocab + token as usize]
    }

    /// Natural log of the posterior; zero probability maps to `-inf`.
    #[inline]
    pub fn log_prob(&self, t: usize, token: u32) -> f32 {
        let p = self.prob(t, token);
        if p > 0.0 { p.ln() } else { f32::NEG_INFINITY }
    }

    /// Argsort every frame by descending probability.
    ///
    /// The sort is stable, so equal probabilities keep ascending token order
    /// and repeated calls produce identical candidate sets.
    pub fn sorted_indices(&self) -> SortedIndices {
        let mut idx = vec![0u32; self.frames * self.vocab];
        for t in 0..self.frames {
            let row = self.row(t);
            let out = &mut idx[t * self.vocab..(t + 1) * self.vocab];
            for (i, slot) in out.iter_mut().enumerate() {
                *slot = i as u32;
            }
            out.sort_by(|&a, &b| row[b as usize].total_cmp(&row[a as usize]));
        }
        SortedIndices {
            idx,
            vocab: self.vocab,
        }
    }

    /// Scan one frame's sorted tokens and collect the candidate set into `out`.
    ///
    /// Tokens are admitted until either `top_n` candidates have been taken or
    /// the accumulated probability mass exceeds `cutoff_prob`. The blank's
    /// mass counts toward the accumulation but blank never takes a slot, and
    /// tokens under the `min_tok_prob` floor are skipped regardless of rank.
    pub fn frame_candidates(
        &self,
        t: usize,
        sorted: &SortedIndices,
        cutoff: &CandidateCutoff,
        out: &mut Vec<u32>,
    ) {
        out.clear();
        let row = self.row(t);
        let mut mass = 0.0f32;
        for &token in sorted.row(t) {
            if out.len() >= cutoff.top_n || mass > cutoff.cutoff_prob {
                break;
            }
            let p = row[token as usize];
            if p <= 0.0 {
                break;
            }
            mass += p;
            if token == cutoff.blank_id {
                continue;
            }
            if p.ln() < cutoff.min_tok_prob {
                continue;
            }
            out.push(token);
        }
    }
}

/// Per-frame descending argsort companion to a [`PosteriorView`].
#[derive(Debug, Clone)]
pub struct SortedIndices {
    idx: Vec<u32>,
    vocab: usize,
}

impl SortedIndices {
    #[inline]
    pub fn row(&self, t: usize) -> &[u32] {
        &self.idx[t * self.vocab..(t + 1) * self.vocab]
    }
}
