//! Uniform façade over the optional external scorers.
//!
//! Three independent collaborators share one shape: opaque per-prefix state
//! carried in the tree nodes, a transition on every extension, and a score
//! delta. The language model fires at word boundaries, the lexicon
//! constrains token transitions within a word, and the hot-word automaton
//! boosts matching token spans. The façade itself is stateless; all mutable
//! state lives in the nodes.

use std::sync::Arc;

use crate::fst::Fst;
use crate::lm::{LanguageModel, LmState};
use crate::tree::{NodeId, PrefixTree};

/// External state and score deltas for extending a prefix by one token.
#[derive(Debug)]
pub struct Extension {
    pub lm_state: Option<LmState>,
    pub lex_state: Option<u32>,
    pub hw_state: Option<u32>,
    /// Unweighted language-model delta.
    pub lm_delta: f32,
    /// Hot-word boost delta.
    pub hw_delta: f32,
    /// Total weighted delta applied to the path score.
    pub ext_delta: f32,
}

pub struct Scorer {
    lm: Option<Arc<dyn LanguageModel>>,
    lexicon: Option<Arc<Fst>>,
    alpha: f32,
    beta: f32,
    unk_lexicon_penalty: f32,
    /// Per token: true if its surface starts a new word.
    word_begin: Vec<bool>,
}

impl Scorer {
    pub fn new(
        vocab: &[String],
        tok_sep: &str,
        apostrophe_id: Option<u32>,
        alpha: f32,
        beta: f32,
        unk_lexicon_penalty: f32,
        lm: Option<Arc<dyn LanguageModel>>,
        lexicon: Option<Arc<Fst>>,
    ) -> Self {
        let word_begin = vocab
            .iter()
            .enumerate()
            .map(|(id, surface)| {
                !surface.starts_with(tok_sep) && Some(id as u32) != apostrophe_id
            })
            .collect();
        Self {
            lm,
            lexicon,
            alpha,
            beta,
            unk_lexicon_penalty,
            word_begin,
        }
    }

    pub fn has_lm(&self) -> bool {
        self.lm.is_some()
    }

    pub fn has_lexicon(&self) -> bool {
        self.lexicon.is_some()
    }

    /// External state for the root prefix of one sample's decode.
    pub fn root_state(
        &self,
        hotwords: Option<&Fst>,
    ) -> (Option<LmState>, Option<u32>, Option<u32>) {
        (
            self.lm.as_ref().map(|lm| lm.initial_state()),
            self.lexicon.as_ref().map(|_| Fst::START),
            hotwords.map(|_| Fst::START),
        )
    }

    #[inline]
    pub fn begins_word(&self, token: u32) -> bool {
        self.word_begin[token as usize]
    }

    /// Compute the successor states and score deltas for appending `token`
    /// to the prefix at `parent`. Called once per created node; re-expansions
    /// recover the delta from the cumulative scores cached on the node.
    pub fn extend(
        &self,
        tree: &PrefixTree,
        parent: NodeId,
        token: u32,
        hotwords: Option<&Fst>,
    ) -> Extension {
        let parent_node = tree.get(parent);
        let begins_word = self.begins_word(token);
        let mut lm_delta = 0.0f32;
        let mut hw_delta = 0.0f32;
        let mut ext_delta = 0.0f32;

        // A word-starting token closes out the word accumulated behind it.
        let lm_state = match (&self.lm, &parent_node.lm_state) {
            (Some(lm), Some(state)) if begins_word => {
                let word = self.current_word(tree, parent);
                if word.is_empty() {
                    Some(state.clone())
                } else {
                    let (next, delta) = lm.score(state, &word);
                    lm_delta = delta;
                    ext_delta += self.alpha * delta + self.beta;
                    Some(next)
                }
            }
            (_, state) => state.clone(),
        };

        let lex_state = match (&self.lexicon, parent_node.lex_state) {
            (Some(lexicon), Some(state)) => {
                let from = if begins_word { Fst::START } else { state };
                match lexicon.step(from, token) {
                    Some((next, _)) => Some(next),
                    None => {
                        ext_delta += self.unk_lexicon_penalty;
                        Some(Fst::START)
                    }
                }
            }
            (_, state) => state,
        };

        // A failed mid-match transition retries from the start state so a
        // hot word can begin on the current token.
        let hw_state = match (hotwords, parent_node.hw_state) {
            (Some(hw), Some(state)) => {
                match hw
                    .step(state, token)
                    .or_else(|| hw.step(Fst::START, token))
                {
                    Some((next, weight)) => {
                        hw_delta = weight;
                        ext_delta += weight;
                        Some(next)
                    }
                    None => Some(Fst::START),
                }
            }
            (_, state) => state,
        };

        Extension {
            lm_state,
            lex_state,
            hw_state,
            lm_delta,
            hw_delta,
            ext_delta,
        }
    }

    /// Tokens of the in-progress word ending at `node`, oldest first: the
    /// maximal suffix of the path made of one word-starting token followed
    /// by continuations.
    fn current_word(&self, tree: &PrefixTree, node: NodeId) -> Vec<u32> {
        let mut tokens = Vec::new();
        let mut cur = node;
        loop {
            let n = tree.get(cur);
            let Some(parent) = n.parent else { break };
            tokens.push(n.token);
            if self.word_begin[n.token as usize] {
                break;
            }
            cur = parent;
        }
        tokens.reverse();
        tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fixed-score stand-in for a real n-gram model.
    struct StubLm {
        delta: f32,
    }

    impl LanguageModel for StubLm {
        fn initial_state(&self) -> LmState {
            LmState::empty()
        }

        fn score(&self, state: &LmState, word_tokens: &[u32]) -> (LmState, f32) {
            let mut next = state.clone();
            next.0.extend_from_slice(word_tokens);
            (next, self.delta)
        }

        fn unk_penalty(&self) -> f32 {
            -10.0
        }
    }

    fn vocab() -> Vec<String> {
        ["_", "he", "#llo", "wor", "#ld", "'", "a"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn bare_scorer() -> Scorer {
        Scorer::new(&vocab(), "#", Some(5), 1.0, 0.0, -5.0, None, None)
    }

    fn grow(scorer: &Scorer, tree: &mut PrefixTree, parent: NodeId, token: u32) -> NodeId {
        let ext = scorer.extend(tree, parent, token, None);
        tree.insert_child(
            parent,
            token,
            0,
            ext.lm_state,
            ext.lex_state,
            ext.hw_state,
            ext.lm_delta,
            ext.hw_delta,
            ext.ext_delta,
        )
    }

    #[test]
    fn test_word_boundary_detection() {
        let scorer = bare_scorer();
        assert!(scorer.begins_word(1)); // "he"
        assert!(!scorer.begins_word(2)); // "#llo"
        assert!(!scorer.begins_word(5)); // apostrophe continues the word
        assert!(scorer.begins_word(6)); // "a"
    }

    #[test]
    fn test_current_word_is_boundary_suffix() {
        let scorer = bare_scorer();
        let mut tree = PrefixTree::new(None, None, None);
        let root = tree.root();
        let he = grow(&scorer, &mut tree, root, 1);
        let llo = grow(&scorer, &mut tree, he, 2);
        assert_eq!(scorer.current_word(&tree, llo), vec![1, 2]);
        assert_eq!(scorer.current_word(&tree, he), vec![1]);
        assert_eq!(scorer.current_word(&tree, root), Vec::<u32>::new());
    }

    #[test]
    fn test_lm_fires_only_at_word_boundary() {
        let lm: Arc<dyn LanguageModel> = Arc::new(StubLm { delta: -2.0 });
        let scorer = Scorer::new(&vocab(), "#", Some(5), 0.5, 0.25, -5.0, Some(lm), None);
        let (lm0, _, _) = scorer.root_state(None);
        let mut tree = PrefixTree::new(lm0, None, None);
        let root = tree.root();

        // he, #llo: still mid-word, no LM query
        let he = grow(&scorer, &mut tree, root, 1);
        assert_eq!(tree.get(he).lm_score, 0.0);
        let llo = grow(&scorer, &mut tree, he, 2);
        assert_eq!(tree.get(llo).lm_score, 0.0);

        // "wor" starts the next word, scoring the completed "hello"
        let ext = scorer.extend(&tree, llo, 3, None);
        assert!((ext.lm_delta + 2.0).abs() < 1e-6);
        // alpha * delta + beta
        assert!((ext.ext_delta - (0.5 * -2.0 + 0.25)).abs() < 1e-6);
        assert_eq!(ext.lm_state, Some(LmState(vec![1, 2])));
    }

    #[test]
    fn test_lexicon_penalty_and_reset() {
        // Lexicon accepts only "ab" (tokens 6, then continuation "#b" absent
        // from this vocab; use "hello" instead: tokens 1, 2)
        let words = vec![("hello".to_string(), 0.0)];
        let (fst, _) = Fst::build_lexicon(&words, &vocab(), "#").unwrap();
        let lexicon = Arc::new(fst);
        let scorer = Scorer::new(&vocab(), "#", Some(5), 1.0, 0.0, -3.0, None, Some(lexicon));

        let (_, lex0, _) = scorer.root_state(None);
        let mut tree = PrefixTree::new(None, lex0, None);
        let root = tree.root();

        let he = grow(&scorer, &mut tree, root, 1);
        assert_eq!(tree.get(he).ext_score, 0.0);

        // "#ld" after "he" is off-lexicon: penalty, state back to start
        let ext = scorer.extend(&tree, he, 4, None);
        assert!((ext.ext_delta + 3.0).abs() < 1e-6);
        assert_eq!(ext.lex_state, Some(Fst::START));

        // "#llo" after "he" stays on-lexicon with no penalty
        let ext = scorer.extend(&tree, he, 2, None);
        assert_eq!(ext.ext_delta, 0.0);
        assert_ne!(ext.lex_state, Some(Fst::START));
    }

    #[test]
    fn test_hotword_match_and_restart() {
        let hw = Fst::build_hotwords(&[vec![1, 2]], &[8.0], 7).unwrap();
        let scorer = bare_scorer();
        let (_, _, hw0) = scorer.root_state(Some(&hw));
        let mut tree = PrefixTree::new(None, None, hw0);
        let root = tree.root();

        // Full match accrues the whole weight
        let ext = scorer.extend(&tree, root, 1, Some(&hw));
        assert!((ext.hw_delta - 4.0).abs() < 1e-6);
        let he = tree.insert_child(
            root, 1, 0, ext.lm_state, ext.lex_state, ext.hw_state, ext.lm_delta, ext.hw_delta,
            ext.ext_delta,
        );
        let ext = scorer.extend(&tree, he, 2, Some(&hw));
        assert!((ext.hw_delta - 4.0).abs() < 1e-6);
        assert!((tree.get(he).hw_score - 4.0).abs() < 1e-6);

        // Non-matching token resets to the start state with no boost
        let ext = scorer.extend(&tree, he, 3, Some(&hw));
        assert_eq!(ext.hw_delta, 0.0);
        assert_eq!(ext.hw_state, Some(Fst::START));

        // A match can begin mid-sequence via the start-state retry
        let wor = tree.insert_child(
            root, 3, 0, None, None, Some(Fst::START), 0.0, 0.0, 0.0,
        );
        let ext = scorer.extend(&tree, wor, 1, Some(&hw));
        assert!((ext.hw_delta - 4.0).abs() < 1e-6);
    }
}
