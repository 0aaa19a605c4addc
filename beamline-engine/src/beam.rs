//! Frame-level beam set over prefix-tree nodes.
//!
//! The set is rebuilt every frame: extensions `touch` nodes, colliding
//! contributions are log-sum-exp merged into the node's `p_b`/`p_nb`, and
//! `prune` keeps the `beam_width` best survivors for the next frame.

use crate::tree::{NodeId, PrefixTree};

/// `log(exp(a) + exp(b))` with `-inf` as the additive identity.
#[inline]
pub fn log_add(a: f32, b: f32) -> f32 {
    if a == f32::NEG_INFINITY {
        return b;
    }
    if b == f32::NEG_INFINITY {
        return a;
    }
    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    hi + (lo - hi).exp().ln_1p()
}

/// Active beam collection for the frame currently being extended.
#[derive(Debug)]
pub struct BeamSet {
    width: usize,
    /// Ranking bonus per emitted token.
    beta: f32,
    /// Beams scoring below `top + max_deviation` are dropped (non-positive).
    max_deviation: f32,
    stamp: u32,
    touched: Vec<NodeId>,
    scratch: Vec<(NodeId, f32)>,
}

impl BeamSet {
    pub fn new(width: usize, beta: f32, max_deviation: f32) -> Self {
        Self {
            width,
            beta,
            max_deviation,
            stamp: 0,
            touched: Vec::with_capacity(width * 2),
            scratch: Vec::with_capacity(width * 2),
        }
    }

    /// Snapshot the surviving beams and open a new frame.
    ///
    /// Every survivor's `p_b`/`p_nb` is copied into the `_prev` fields that
    /// this frame's extensions read; fresh values accumulate from `-inf` as
    /// nodes are touched.
    pub fn begin_frame(&mut self, tree: &mut PrefixTree, survivors: &[NodeId]) {
        self.stamp += 1;
        self.touched.clear();
        for &id in survivors {
            let node = tree.get_mut(id);
            node.p_b_prev = node.p_b;
            node.p_nb_prev = node.p_nb;
        }
    }

    #[inline]
    fn admit(&mut self, tree: &mut PrefixTree, id: NodeId) {
        let node = tree.get_mut(id);
        if node.stamp != self.stamp {
            node.stamp = self.stamp;
            node.p_b = f32::NEG_INFINITY;
            node.p_nb = f32::NEG_INFINITY;
            self.touched.push(id);
        }
    }

    /// Merge a blank-ending contribution into `id`.
    pub fn touch_b(&mut self, tree: &mut PrefixTree, id: NodeId, value: f32) {
        if value == f32::NEG_INFINITY {
            return;
        }
        self.admit(tree, id);
        let node = tree.get_mut(id);
        node.p_b = log_add(node.p_b, value);
    }

    /// Merge a non-blank-ending contribution into `id`.
    pub fn touch_nb(&mut self, tree: &mut PrefixTree, id: NodeId, value: f32) {
        if value == f32::NEG_INFINITY {
            return;
        }
        self.admit(tree, id);
        let node = tree.get_mut(id);
        node.p_nb = log_add(node.p_nb, value);
    }

    /// True if nothing has been touched since `begin_frame`.
    pub fn is_empty(&self) -> bool {
        self.touched.is_empty()
    }

    /// Ranking score used for pruning and terminal selection.
    #[inline]
    pub fn score(&self, tree: &PrefixTree, id: NodeId) -> f32 {
        let node = tree.get(id);
        log_add(node.p_b, node.p_nb) + self.beta * node.depth as f32
    }

    /// Close the frame: keep the best `width` touched nodes, then drop any
    /// whose score falls below `top + max_deviation`.
    ///
    /// Ties are broken toward the lower arena index, which makes a decode
    /// deterministic for fixed inputs.
    pub fn prune(&mut self, tree: &PrefixTree) -> Vec<NodeId> {
        let beta = self.beta;
        self.scratch.clear();
        for &id in &self.touched {
            let node = tree.get(id);
            let s = log_add(node.p_b, node.p_nb) + beta * node.depth as f32;
            self.scratch.push((id, s));
        }
        self.scratch
            .sort_unstable_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        self.scratch.truncate(self.width);

        let mut survivors = Vec::with_capacity(self.scratch.len());
        if let Some(&(_, top)) = self.scratch.first() {
            let floor = top + self.max_deviation;
            for &(id, s) in &self.scratch {
                if s >= floor || survivors.is_empty() {
                    survivors.push(id);
                }
            }
        }
        survivors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::PrefixTree;

    fn tree_with_children(n: usize) -> (PrefixTree, Vec<NodeId>) {
        let mut tree = PrefixTree::new(None, None, None);
        let root = tree.root();
        let ids = (0..n)
            .map(|i| tree.insert_child(root, i as u32 + 1, 0, None, None, None, 0.0, 0.0, 0.0))
            .collect();
        (tree, ids)
    }

    #[test]
    fn test_log_add_matches_probability_sum() {
        let a = (0.3f32).ln();
        let b = (0.2f32).ln();
        assert!((log_add(a, b).exp() - 0.5).abs() < 1e-6);
        assert_eq!(log_add(f32::NEG_INFINITY, a), a);
        assert_eq!(
            log_add(f32::NEG_INFINITY, f32::NEG_INFINITY),
            f32::NEG_INFINITY
        );
    }

    #[test]
    fn test_touch_merges_with_log_sum_exp() {
        let (mut tree, ids) = tree_with_children(1);
        let mut beams = BeamSet::new(4, 0.0, f32::NEG_INFINITY);
        beams.begin_frame(&mut tree, &[]);
        beams.touch_nb(&mut tree, ids[0], (0.81f32).ln());
        beams.touch_nb(&mut tree, ids[0], (0.09f32).ln());
        let merged = tree.get(ids[0]).p_nb.exp();
        assert!((merged - 0.90).abs() < 1e-5, "got {merged}");
    }

    #[test]
    fn test_prune_keeps_top_width() {
        let (mut tree, ids) = tree_with_children(4);
        let mut beams = BeamSet::new(2, 0.0, f32::NEG_INFINITY);
        beams.begin_frame(&mut tree, &[]);
        for (i, &id) in ids.iter().enumerate() {
            beams.touch_nb(&mut tree, id, -(i as f32));
        }
        let survivors = beams.prune(&tree);
        assert_eq!(survivors, vec![ids[0], ids[1]]);
    }

    #[test]
    fn test_prune_applies_deviation_floor() {
        let (mut tree, ids) = tree_with_children(3);
        let mut beams = BeamSet::new(3, 0.0, -1.5);
        beams.begin_frame(&mut tree, &[]);
        beams.touch_nb(&mut tree, ids[0], 0.0);
        beams.touch_nb(&mut tree, ids[1], -1.0);
        beams.touch_nb(&mut tree, ids[2], -2.0);
        let survivors = beams.prune(&tree);
        assert_eq!(survivors, vec![ids[0], ids[1]]);
    }

    #[test]
    fn test_prune_ties_break_toward_lower_index() {
        let (mut tree, ids) = tree_with_children(2);
        let mut beams = BeamSet::new(1, 0.0, f32::NEG_INFINITY);
        beams.begin_frame(&mut tree, &[]);
        beams.touch_nb(&mut tree, ids[1], -0.5);
        beams.touch_nb(&mut tree, ids[0], -0.5);
        let survivors = beams.prune(&tree);
        assert_eq!(survivors, vec![ids[0]]);
    }

    #[test]
    fn test_depth_bonus_ranks_longer_prefixes() {
        let mut tree = PrefixTree::new(None, None, None);
        let root = tree.root();
        let a = tree.insert_child(root, 1, 0, None, None, None, 0.0, 0.0, 0.0);
        let b = tree.insert_child(a, 2, 0, None, None, None, 0.0, 0.0, 0.0);
        let mut beams = BeamSet::new(2, 0.5, f32::NEG_INFINITY);
        beams.begin_frame(&mut tree, &[]);
        beams.touch_nb(&mut tree, a, -1.0);
        beams.touch_nb(&mut tree, b, -1.4);
        // depth bonus: a scores -1.0 + 0.5, b scores -1.4 + 1.0
        let survivors = beams.prune(&tree);
        assert_eq!(survivors[0], b);
    }
}
