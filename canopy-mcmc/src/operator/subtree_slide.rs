//! Subtree slide: move a node's parent up or down the tree, regrafting the
//! subtree when the new height passes another branch.

use canopy_core::{CanopyError, Named, Result};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use super::{log_space_update, pick, tuning_suggestion, ChainRng, Operator, Proposal};
use crate::state::{State, StateNodeId};
use crate::tree::{NodeId, Tree};

/// Branches below `node` (inclusive) that cross `height`.
///
/// An edge is identified by its lower node. The caller guarantees that the
/// parent of `node` lies at or above `height`.
pub fn intersecting_edges(tree: &Tree, node: NodeId, height: f64) -> Vec<NodeId> {
    let mut edges = Vec::new();
    let mut stack = vec![node];
    while let Some(n) = stack.pop() {
        if tree.height(n) < height {
            edges.push(n);
        } else {
            stack.extend(tree.node(n).children());
        }
    }
    edges
}

enum Graft {
    /// Height change only.
    None,
    /// Reattach above the branch of `new_child`; `new_parent` is `None`
    /// when `p` becomes the root.
    Up {
        grandparent: NodeId,
        new_child: NodeId,
        new_parent: Option<NodeId>,
    },
    /// Reattach onto a branch below the sibling.
    Down {
        new_child: NodeId,
        candidates: usize,
    },
}

/// Subtree-slide operator with a Gaussian or uniform height step.
#[derive(Debug, Clone)]
pub struct SubtreeSlide {
    name: String,
    tree: StateNodeId,
    size: f64,
    gaussian: bool,
    optimise: bool,
}

impl SubtreeSlide {
    pub fn new(name: impl Into<String>, tree: StateNodeId) -> Self {
        Self {
            name: name.into(),
            tree,
            size: 1.0,
            gaussian: true,
            optimise: true,
        }
    }

    /// # Errors
    ///
    /// Returns an input error unless `size` is finite and positive.
    pub fn with_size(mut self, size: f64) -> Result<Self> {
        if !(size.is_finite() && size > 0.0) {
            return Err(CanopyError::InvalidInput(format!(
                "{}: slide size must be positive, got {}",
                self.name, size
            )));
        }
        self.size = size;
        Ok(self)
    }

    /// Use a uniform step on `[-size/2, size/2]` instead of a Gaussian.
    pub fn with_uniform_step(mut self) -> Self {
        self.gaussian = false;
        self
    }

    pub fn with_optimise(mut self, optimise: bool) -> Self {
        self.optimise = optimise;
        self
    }

    pub fn size(&self) -> f64 {
        self.size
    }

    fn step(&self, rng: &mut ChainRng) -> f64 {
        if self.gaussian {
            let z: f64 = StandardNormal.sample(rng);
            z * self.size
        } else {
            (rng.random::<f64>() - 0.5) * self.size
        }
    }
}

fn missing(tree: &Tree, what: &str, nr: NodeId) -> CanopyError {
    CanopyError::invariant(tree.name(), format!("node {} has no {}", nr, what))
}

impl Named for SubtreeSlide {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Operator for SubtreeSlide {
    fn state_nodes(&self) -> Vec<StateNodeId> {
        vec![self.tree]
    }

    fn proposal(&mut self, state: &mut State, rng: &mut ChainRng) -> Result<Proposal> {
        let tree = state.tree(self.tree)?;
        if tree.node_count() < 3 {
            return Ok(Proposal::Reject);
        }

        // Uniform over the non-root nodes.
        let mut i = pick(rng, tree.node_count() - 1);
        if i >= tree.root() {
            i += 1;
        }
        let p = tree.parent(i).ok_or_else(|| missing(tree, "parent", i))?;
        let sibling = tree
            .other_child(p, i)
            .ok_or_else(|| missing(tree, "sibling", i))?;
        let grandparent = tree.parent(p);

        let delta = self.step(rng);
        let old_height = tree.height(p);
        let new_height = old_height + delta;

        let graft = if delta > 0.0 {
            match grandparent {
                Some(gp) if tree.height(gp) < new_height => {
                    let mut new_child = gp;
                    let mut new_parent = tree.parent(gp);
                    while let Some(np) = new_parent {
                        if tree.height(np) >= new_height {
                            break;
                        }
                        new_child = np;
                        new_parent = tree.parent(np);
                    }
                    Graft::Up {
                        grandparent: gp,
                        new_child,
                        new_parent,
                    }
                }
                _ => Graft::None,
            }
        } else {
            if tree.height(i) > new_height {
                return Ok(Proposal::Reject);
            }
            if tree.height(sibling) > new_height {
                let edges = intersecting_edges(tree, sibling, new_height);
                if edges.is_empty() {
                    return Ok(Proposal::Reject);
                }
                Graft::Down {
                    new_child: edges[pick(rng, edges.len())],
                    candidates: edges.len(),
                }
            } else {
                Graft::None
            }
        };

        let tree = state.edit_tree(self.tree)?;
        let log_q = match graft {
            Graft::None => {
                tree.set_height(p, new_height)?;
                0.0
            }
            Graft::Up {
                grandparent,
                new_child,
                new_parent,
            } => {
                tree.replace(p, sibling, new_child)?;
                tree.replace(grandparent, p, sibling)?;
                match new_parent {
                    Some(np) => tree.replace(np, new_child, p)?,
                    None => tree.set_root(p)?,
                }
                tree.set_height(p, new_height)?;
                let sources = intersecting_edges(tree, new_child, old_height).len();
                -(sources as f64).ln()
            }
            Graft::Down {
                new_child,
                candidates,
            } => {
                let new_parent = tree
                    .parent(new_child)
                    .ok_or_else(|| missing(tree, "parent", new_child))?;
                match grandparent {
                    Some(gp) => tree.replace(gp, p, sibling)?,
                    None => tree.set_root(sibling)?,
                }
                tree.replace(new_parent, new_child, p)?;
                tree.replace(p, sibling, new_child)?;
                tree.set_height(p, new_height)?;
                (candidates as f64).ln()
            }
        };
        Ok(Proposal::Hastings(log_q))
    }

    fn tuning(&self) -> Option<f64> {
        Some(self.size)
    }

    fn set_tuning(&mut self, value: f64) {
        if value.is_finite() && value > 0.0 {
            self.size = value;
        }
    }

    fn optimize(&mut self, delta: f64) {
        if self.optimise {
            self.size = log_space_update(self.size, delta);
        }
    }

    fn performance_suggestion(&self, acceptance: f64) -> Option<String> {
        tuning_suggestion("size", self.size, acceptance, self.target_acceptance())
    }
}
