//! Narrow and wide subtree exchange.

use canopy_core::{Named, Result};

use super::{pick, ChainRng, Operator, Proposal};
use crate::state::{State, StateNodeId};
use crate::tree::{NodeId, Tree};

/// Swap two subtrees without changing any height.
///
/// The narrow form swaps a child of a node with that node's sibling (its
/// "uncle"); the wide form swaps any two compatible nodes.
#[derive(Debug, Clone)]
pub struct Exchange {
    name: String,
    tree: StateNodeId,
    wide: bool,
}

impl Exchange {
    pub fn narrow(name: impl Into<String>, tree: StateNodeId) -> Self {
        Self {
            name: name.into(),
            tree,
            wide: false,
        }
    }

    pub fn wide(name: impl Into<String>, tree: StateNodeId) -> Self {
        Self {
            name: name.into(),
            tree,
            wide: true,
        }
    }

    pub fn is_wide(&self) -> bool {
        self.wide
    }

    fn propose_narrow(&self, state: &mut State, rng: &mut ChainRng) -> Result<Proposal> {
        let tree = state.tree(self.tree)?;
        let internal = tree.internal_node_count();
        if internal <= 1 {
            return Ok(Proposal::Reject);
        }
        let first = tree.leaf_count();
        let candidates: Vec<NodeId> = (first..first + internal)
            .filter(|&n| has_internal_child(tree, n))
            .collect();
        if candidates.is_empty() {
            return Ok(Proposal::Reject);
        }
        let grandparent = candidates[pick(rng, candidates.len())];
        let (mut parent, mut uncle) = children(tree, grandparent);
        if tree.height(parent) < tree.height(uncle) {
            std::mem::swap(&mut parent, &mut uncle);
        }
        if tree.is_leaf(parent) {
            // Only possible with tip dates.
            return Ok(Proposal::Reject);
        }
        let valid_before = candidates.len();
        let touched_before =
            grandparent_score(tree, parent) + grandparent_score(tree, uncle);
        let (left, right) = children(tree, parent);
        let i = if pick(rng, 2) == 0 { left } else { right };

        let tree = state.edit_tree(self.tree)?;
        exchange_nodes(tree, i, uncle, parent, grandparent)?;
        let valid_after = valid_before - touched_before
            + grandparent_score(tree, parent)
            + grandparent_score(tree, uncle);
        Ok(Proposal::Hastings(
            (valid_before as f64 / valid_after as f64).ln(),
        ))
    }

    fn propose_wide(&self, state: &mut State, rng: &mut ChainRng) -> Result<Proposal> {
        let tree = state.tree(self.tree)?;
        let root = tree.root();
        let non_root: Vec<NodeId> = (0..tree.node_count()).filter(|&n| n != root).collect();
        if non_root.len() < 2 {
            return Ok(Proposal::Reject);
        }
        let i = non_root[pick(rng, non_root.len())];
        let others: Vec<NodeId> = non_root.iter().copied().filter(|&n| n != i).collect();
        let j = others[pick(rng, others.len())];
        let (Some(p), Some(jp)) = (tree.parent(i), tree.parent(j)) else {
            return Ok(Proposal::Reject);
        };
        let compatible = p != jp
            && i != jp
            && j != p
            && tree.height(j) < tree.height(p)
            && tree.height(i) < tree.height(jp);
        if !compatible {
            return Ok(Proposal::Reject);
        }
        exchange_nodes(state.edit_tree(self.tree)?, i, j, p, jp)?;
        Ok(Proposal::SYMMETRIC)
    }
}

fn children(tree: &Tree, n: NodeId) -> (NodeId, NodeId) {
    let node = tree.node(n);
    match (node.left(), node.right()) {
        (Some(l), Some(r)) => (l, r),
        _ => (n, n),
    }
}

fn has_internal_child(tree: &Tree, n: NodeId) -> bool {
    tree.node(n).children().any(|c| !tree.is_leaf(c))
}

/// 1 if `n` could be picked as a grandparent, else 0.
fn grandparent_score(tree: &Tree, n: NodeId) -> usize {
    usize::from(!tree.is_leaf(n) && has_internal_child(tree, n))
}

/// Move `i` (child of `p`) under `jp` and `j` (child of `jp`) under `p`.
fn exchange_nodes(tree: &mut Tree, i: NodeId, j: NodeId, p: NodeId, jp: NodeId) -> Result<()> {
    tree.replace(p, i, j)?;
    tree.replace(jp, j, i)
}

impl Named for Exchange {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Operator for Exchange {
    fn state_nodes(&self) -> Vec<StateNodeId> {
        vec![self.tree]
    }

    fn proposal(&mut self, state: &mut State, rng: &mut ChainRng) -> Result<Proposal> {
        if self.wide {
            self.propose_wide(state, rng)
        } else {
            self.propose_narrow(state, rng)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    const FOUR_TAXA: &str = "((0:1.0,1:1.0)4:1.0,(2:1.0,3:1.0)5:0.5)6:0.0;";

    fn setup(newick: &str) -> (State, StateNodeId) {
        let mut state = State::new();
        let id = state
            .add_tree(Tree::from_newick("tree", newick).unwrap())
            .unwrap();
        (state, id)
    }

    #[test]
    fn narrow_moves_lower_cherry_under_higher() {
        let (mut state, id) = setup(FOUR_TAXA);
        let mut op = Exchange::narrow("narrow", id);
        let mut rng = ChainRng::seed_from_u64(1);
        let p = op.proposal(&mut state, &mut rng).unwrap();
        // One valid grandparent before the move, two after.
        assert!((p.log_hastings_ratio() - 0.5f64.ln()).abs() < 1e-12);
        let tree = state.tree(id).unwrap();
        tree.validate().unwrap();
        assert_eq!(tree.parent(4), Some(5));
        assert_eq!(tree.parent(5), Some(6));
        assert_eq!(tree.height(5), 1.5);
    }

    #[test]
    fn narrow_on_cherry_rejects() {
        let (mut state, id) = setup("(A:1,B:1);");
        let mut op = Exchange::narrow("narrow", id);
        let mut rng = ChainRng::seed_from_u64(1);
        assert!(op.proposal(&mut state, &mut rng).unwrap().is_reject());
    }

    #[test]
    fn wide_moves_are_symmetric_and_valid() {
        let (mut state, id) = setup("(((A:1,B:1):1,C:2):1,(D:2.5,E:2.5):0.5);");
        let mut op = Exchange::wide("wide", id);
        let mut rng = ChainRng::seed_from_u64(13);
        let mut accepted = 0;
        for _ in 0..400 {
            let p = op.proposal(&mut state, &mut rng).unwrap();
            if p.is_reject() {
                state.restore();
            } else {
                assert_eq!(p, Proposal::SYMMETRIC);
                accepted += 1;
                state.store();
            }
            state.tree(id).unwrap().validate().unwrap();
        }
        assert!(accepted > 0);
    }

    #[test]
    fn narrow_restores_cleanly() {
        let (mut state, id) = setup("(((A:1,B:1):1,C:2):1,(D:2.5,E:2.5):0.5);");
        let before = state.tree(id).unwrap().to_newick();
        let mut op = Exchange::narrow("narrow", id);
        let mut rng = ChainRng::seed_from_u64(3);
        for _ in 0..50 {
            op.proposal(&mut state, &mut rng).unwrap();
            state.restore();
            assert_eq!(state.tree(id).unwrap().to_newick(), before);
        }
    }
}
