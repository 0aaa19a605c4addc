//! Prefix tree arena for one sample's decode.
//!
//! All prefixes of one sample live in a single arena and reference each
//! other by index, so parent/child links never form ownership cycles and
//! nodes stay contiguous in memory. The arena is created per decode call
//! and never frees nodes mid-decode; parents always outlive their children.

use std::collections::HashMap;

use crate::lm::LmState;

/// Arena-relative node reference.
pub type NodeId = usize;

/// Sentinel token carried by the root (blanks never appear in a path).
pub const NO_TOKEN: u32 = u32::MAX;

/// One prefix of non-blank tokens, with its per-frame score state.
#[derive(Debug, Clone)]
pub struct PrefixNode {
    /// Token appended by this node; `NO_TOKEN` on the root.
    pub token: u32,
    pub parent: Option<NodeId>,
    /// Frame at which `token` was first added to the tree.
    pub frame: usize,
    /// Number of tokens on the path from the root.
    pub depth: usize,

    /// Log-probability of the prefix ending in blank at the current frame.
    pub p_b: f32,
    /// Log-probability of the prefix ending in its last token at the current frame.
    pub p_nb: f32,
    pub p_b_prev: f32,
    pub p_nb_prev: f32,

    /// Language model state after the last completed word on this path.
    pub lm_state: Option<LmState>,
    /// Lexicon automaton state within the current word, if a lexicon is loaded.
    pub lex_state: Option<u32>,
    /// Hot-word automaton state, if hot words were supplied for this call.
    pub hw_state: Option<u32>,

    /// Cumulative unweighted language-model log-probability on this path.
    pub lm_score: f32,
    /// Cumulative hot-word boost on this path.
    pub hw_score: f32,
    /// Cumulative weighted external score (LM, lexicon penalty, hot words)
    /// as applied to `p_nb`. Child-minus-parent recovers an extension's
    /// delta without re-querying the scorers.
    pub ext_score: f32,

    /// Beam-set membership stamp for the current frame.
    pub(crate) stamp: u32,

    children: HashMap<u32, NodeId>,
}

/// Arena owning every prefix node of one sample.
#[derive(Debug)]
pub struct PrefixTree {
    nodes: Vec<PrefixNode>,
}

impl PrefixTree {
    /// Create an arena holding only the root, with neutral scores
    /// (`p_b = 0`, everything else `-inf`).
    pub fn new(lm_state: Option<LmState>, lex_state: Option<u32>, hw_state: Option<u32>) -> Self {
        let root = PrefixNode {
            token: NO_TOKEN,
            parent: None,
            frame: 0,
            depth: 0,
            p_b: 0.0,
            p_nb: f32::NEG_INFINITY,
            p_b_prev: 0.0,
            p_nb_prev: f32::NEG_INFINITY,
            lm_state,
            lex_state,
            hw_state,
            lm_score: 0.0,
            hw_score: 0.0,
            ext_score: 0.0,
            stamp: 0,
            children: HashMap::new(),
        };
        Self { nodes: vec![root] }
    }

    pub fn root(&self) -> NodeId {
        0
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    pub fn get(&self, id: NodeId) -> &PrefixNode {
        &self.nodes[id]
    }

    #[inline]
    pub fn get_mut(&mut self, id: NodeId) -> &mut PrefixNode {
        &mut self.nodes[id]
    }

    /// Existing child of `parent` under `token`, if any.
    pub fn child(&self, parent: NodeId, token: u32) -> Option<NodeId> {
        self.nodes[parent].children.get(&token).copied()
    }

    /// Allocate a child of `parent` under `token`, first emitted at `frame`.
    ///
    /// The caller must have checked that no such child exists; path
    /// uniqueness is what makes beam merging by node identity correct.
    /// Scores start at `-inf`; external state is supplied by the caller.
    pub fn insert_child(
        &mut self,
        parent: NodeId,
        token: u32,
        frame: usize,
        lm_state: Option<LmState>,
        lex_state: Option<u32>,
        hw_state: Option<u32>,
        lm_delta: f32,
        hw_delta: f32,
        ext_delta: f32,
    ) -> NodeId {
        debug_assert!(!self.nodes[parent].children.contains_key(&token));
        let id = self.nodes.len();
        let p = &self.nodes[parent];
        let node = PrefixNode {
            token,
            parent: Some(parent),
            frame,
            depth: p.depth + 1,
            p_b: f32::NEG_INFINITY,
            p_nb: f32::NEG_INFINITY,
            p_b_prev: f32::NEG_INFINITY,
            p_nb_prev: f32::NEG_INFINITY,
            lm_state,
            lex_state,
            hw_state,
            lm_score: p.lm_score + lm_delta,
            hw_score: p.hw_score + hw_delta,
            ext_score: p.ext_score + ext_delta,
            stamp: 0,
            children: HashMap::new(),
        };
        self.nodes.push(node);
        self.nodes[parent].children.insert(token, id);
        id
    }

    /// Tokens on the path root → `id`, oldest first.
    pub fn path(&self, id: NodeId) -> Vec<u32> {
        let mut tokens = Vec::with_capacity(self.nodes[id].depth);
        let mut cur = id;
        while let Some(parent) = self.nodes[cur].parent {
            tokens.push(self.nodes[cur].token);
            cur = parent;
        }
        tokens.reverse();
        tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_child(tree: &mut PrefixTree, parent: NodeId, token: u32, frame: usize) -> NodeId {
        tree.insert_child(parent, token, frame, None, None, None, 0.0, 0.0, 0.0)
    }

    #[test]
    fn test_root_is_neutral() {
        let tree = PrefixTree::new(None, None, None);
        let root = tree.get(tree.root());
        assert_eq!(root.token, NO_TOKEN);
        assert_eq!(root.depth, 0);
        assert_eq!(root.p_b, 0.0);
        assert_eq!(root.p_nb, f32::NEG_INFINITY);
    }

    #[test]
    fn test_child_lookup_is_unique() {
        let mut tree = PrefixTree::new(None, None, None);
        let root = tree.root();
        let a = plain_child(&mut tree, root, 3, 0);
        assert_eq!(tree.child(root, 3), Some(a));
        assert_eq!(tree.child(root, 4), None);
        assert_eq!(tree.get(a).depth, 1);
        assert_eq!(tree.get(a).frame, 0);
    }

    #[test]
    fn test_path_walks_to_root() {
        let mut tree = PrefixTree::new(None, None, None);
        let root = tree.root();
        let a = plain_child(&mut tree, root, 5, 0);
        let b = plain_child(&mut tree, a, 7, 2);
        assert_eq!(tree.path(b), vec![5, 7]);
        assert_eq!(tree.path(root), Vec::<u32>::new());
    }

    #[test]
    fn test_external_scores_accumulate() {
        let mut tree = PrefixTree::new(None, None, None);
        let root = tree.root();
        let a = tree.insert_child(root, 1, 0, None, None, None, -0.5, 2.0, 1.5);
        let b = tree.insert_child(a, 2, 1, None, None, None, -0.25, 0.0, -0.25);
        assert!((tree.get(b).lm_score + 0.75).abs() < 1e-6);
        assert!((tree.get(b).hw_score - 2.0).abs() < 1e-6);
        assert!((tree.get(b).ext_score - 1.25).abs() < 1e-6);
    }
}
