//! Uniform redraw of one internal node height.

use canopy_core::{Named, Result};
use rand::Rng;

use super::{pick, ChainRng, Operator, Proposal};
use crate::state::{State, StateNodeId};

/// Pick a non-root internal node and draw its height uniformly between its
/// highest child and its parent. Symmetric.
#[derive(Debug, Clone)]
pub struct UniformHeight {
    name: String,
    tree: StateNodeId,
}

impl UniformHeight {
    pub fn new(name: impl Into<String>, tree: StateNodeId) -> Self {
        Self {
            name: name.into(),
            tree,
        }
    }
}

impl Named for UniformHeight {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Operator for UniformHeight {
    fn state_nodes(&self) -> Vec<StateNodeId> {
        vec![self.tree]
    }

    fn proposal(&mut self, state: &mut State, rng: &mut ChainRng) -> Result<Proposal> {
        let tree = state.tree(self.tree)?;
        let root = tree.root();
        let movable: Vec<_> = (tree.leaf_count()..tree.node_count())
            .filter(|&n| n != root)
            .collect();
        if movable.is_empty() {
            return Ok(Proposal::Reject);
        }
        let node = movable[pick(rng, movable.len())];
        let Some(parent) = tree.parent(node) else {
            return Ok(Proposal::Reject);
        };
        let upper = tree.height(parent);
        let lower = tree
            .node(node)
            .children()
            .map(|c| tree.height(c))
            .fold(f64::NEG_INFINITY, f64::max);
        if lower >= upper {
            return Ok(Proposal::Reject);
        }
        let height = lower + rng.random::<f64>() * (upper - lower);
        state.edit_tree(self.tree)?.set_height(node, height)?;
        Ok(Proposal::SYMMETRIC)
    }
}
