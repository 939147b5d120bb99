//! The chain state: every value an operator may change.
//!
//! The state tracks which nodes were opened for editing since the last
//! commit, so a rejected proposal rolls back only what it touched.

use std::collections::{BTreeMap, HashMap};

use canopy_core::{CanopyError, Checkpointable, Named, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::calculation::Dirty;
use crate::parameter::{BooleanParameter, IntegerParameter, RealParameter};
use crate::tree::{Node, Tree};

/// Handle to a node registered with a [`State`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateNodeId(usize);

impl StateNodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// One versioned value of the state.
#[derive(Debug, Clone)]
pub enum StateNode {
    Real(RealParameter),
    Integer(IntegerParameter),
    Boolean(BooleanParameter),
    Tree(Tree),
}

impl StateNode {
    pub fn kind(&self) -> &'static str {
        match self {
            StateNode::Real(_) => "real parameter",
            StateNode::Integer(_) => "integer parameter",
            StateNode::Boolean(_) => "boolean parameter",
            StateNode::Tree(_) => "tree",
        }
    }

    /// How much the node changed since the last store/restore.
    ///
    /// Parameters are at most [`Dirty::Dirty`]; a tree reports the highest
    /// tag over its nodes, so a topology edit shows up as filthy.
    pub fn dirtiness(&self) -> Dirty {
        match self {
            StateNode::Real(p) => dirty_if(p.something_is_dirty()),
            StateNode::Integer(p) => dirty_if(p.something_is_dirty()),
            StateNode::Boolean(p) => dirty_if(p.something_is_dirty()),
            StateNode::Tree(t) => t.dirtiness(),
        }
    }

    pub fn is_editing(&self) -> bool {
        match self {
            StateNode::Real(p) => p.is_editing(),
            StateNode::Integer(p) => p.is_editing(),
            StateNode::Boolean(p) => p.is_editing(),
            StateNode::Tree(t) => t.is_editing(),
        }
    }

    fn start_editing(&mut self) {
        match self {
            StateNode::Real(p) => p.start_editing(),
            StateNode::Integer(p) => p.start_editing(),
            StateNode::Boolean(p) => p.start_editing(),
            StateNode::Tree(t) => t.start_editing(),
        }
    }

    fn set_everything_dirty(&mut self, dirty: bool) {
        match self {
            StateNode::Real(p) => p.set_everything_dirty(dirty),
            StateNode::Integer(p) => p.set_everything_dirty(dirty),
            StateNode::Boolean(p) => p.set_everything_dirty(dirty),
            StateNode::Tree(t) => t.set_everything_dirty(dirty),
        }
    }

    fn snapshot(&self) -> NodeValue {
        match self {
            StateNode::Real(p) => NodeValue::Real {
                values: p.values().to_vec(),
            },
            StateNode::Integer(p) => NodeValue::Integer {
                values: p.values().to_vec(),
            },
            StateNode::Boolean(p) => NodeValue::Boolean {
                values: p.values().to_vec(),
            },
            StateNode::Tree(t) => NodeValue::Tree {
                nodes: t.nodes().to_vec(),
            },
        }
    }

    fn assign_snapshot(&mut self, value: &NodeValue) -> Result<()> {
        match (self, value) {
            (StateNode::Real(p), NodeValue::Real { values }) => p.assign_values(values),
            (StateNode::Integer(p), NodeValue::Integer { values }) => p.assign_values(values),
            (StateNode::Boolean(p), NodeValue::Boolean { values }) => p.assign_values(values),
            (StateNode::Tree(t), NodeValue::Tree { nodes }) => {
                let loaded = Tree::assemble(t.name().to_string(), nodes.clone(), t.has_tip_dates())?;
                t.assign_from(&loaded)
            }
            (node, _) => Err(CanopyError::model(
                node.name(),
                format!("state file holds a different kind of value for this {}", node.kind()),
            )),
        }
    }
}

fn dirty_if(dirty: bool) -> Dirty {
    if dirty {
        Dirty::Dirty
    } else {
        Dirty::Clean
    }
}

impl Named for StateNode {
    fn name(&self) -> &str {
        match self {
            StateNode::Real(p) => p.name(),
            StateNode::Integer(p) => p.name(),
            StateNode::Boolean(p) => p.name(),
            StateNode::Tree(t) => t.name(),
        }
    }
}

impl Checkpointable for StateNode {
    fn store(&mut self) {
        match self {
            StateNode::Real(p) => p.store(),
            StateNode::Integer(p) => p.store(),
            StateNode::Boolean(p) => p.store(),
            StateNode::Tree(t) => t.store(),
        }
    }

    fn restore(&mut self) {
        match self {
            StateNode::Real(p) => p.restore(),
            StateNode::Integer(p) => p.restore(),
            StateNode::Boolean(p) => p.restore(),
            StateNode::Tree(t) => t.restore(),
        }
    }
}

/// Serialized value of one state node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeValue {
    Real { values: Vec<f64> },
    Integer { values: Vec<i64> },
    Boolean { values: Vec<bool> },
    Tree { nodes: Vec<Node> },
}

/// Committed values of every state node, keyed by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub sample: u64,
    pub nodes: BTreeMap<String, NodeValue>,
}

macro_rules! typed_access {
    ($get:ident, $edit:ident, $add:ident, $variant:ident, $ty:ty) => {
        #[doc = concat!("Read access to a `", stringify!($variant), "` node.")]
        pub fn $get(&self, id: StateNodeId) -> Result<&$ty> {
            match self.node(id) {
                StateNode::$variant(v) => Ok(v),
                other => Err(wrong_kind(other, stringify!($variant))),
            }
        }

        #[doc = concat!("Open a `", stringify!($variant), "` node for editing.")]
        pub fn $edit(&mut self, id: StateNodeId) -> Result<&mut $ty> {
            if !matches!(self.node(id), StateNode::$variant(_)) {
                return Err(wrong_kind(self.node(id), stringify!($variant)));
            }
            match self.edit(id) {
                StateNode::$variant(v) => Ok(v),
                other => Err(wrong_kind(other, stringify!($variant))),
            }
        }

        #[doc = concat!("Register a `", stringify!($variant), "` node.")]
        pub fn $add(&mut self, value: $ty) -> Result<StateNodeId> {
            self.add(StateNode::$variant(value))
        }
    };
}

fn wrong_kind(node: &StateNode, wanted: &str) -> CanopyError {
    CanopyError::InvalidInput(format!(
        "state node '{}' is a {}, not {}",
        node.name(),
        node.kind(),
        wanted.to_lowercase()
    ))
}

/// The set of state nodes plus the list of nodes touched by the
/// proposal in flight.
#[derive(Debug, Clone, Default)]
pub struct State {
    nodes: Vec<StateNode>,
    names: HashMap<String, StateNodeId>,
    changed: Vec<StateNodeId>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node.
    ///
    /// # Errors
    ///
    /// Returns a model error if the name is already taken.
    pub fn add(&mut self, node: StateNode) -> Result<StateNodeId> {
        let name = node.name().to_string();
        if self.names.contains_key(&name) {
            return Err(CanopyError::model(&name, "state node name registered twice"));
        }
        let id = StateNodeId(self.nodes.len());
        self.nodes.push(node);
        self.names.insert(name, id);
        Ok(id)
    }

    typed_access!(real, edit_real, add_real, Real, RealParameter);
    typed_access!(integer, edit_integer, add_integer, Integer, IntegerParameter);
    typed_access!(boolean, edit_boolean, add_boolean, Boolean, BooleanParameter);
    typed_access!(tree, edit_tree, add_tree, Tree, Tree);

    pub fn find(&self, name: &str) -> Option<StateNodeId> {
        self.names.get(name).copied()
    }

    /// Look a node up by name, failing with a model error naming `user`.
    pub fn require(&self, name: &str, user: &str) -> Result<StateNodeId> {
        self.find(name).ok_or_else(|| {
            CanopyError::model(user, format!("refers to unknown state node '{}'", name))
        })
    }

    /// # Panics
    ///
    /// Panics if `id` does not come from this state.
    pub fn node(&self, id: StateNodeId) -> &StateNode {
        &self.nodes[id.0]
    }

    pub fn contains(&self, id: StateNodeId) -> bool {
        id.0 < self.nodes.len()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = StateNodeId> {
        (0..self.nodes.len()).map(StateNodeId)
    }

    /// Open a node for editing and register it as changed.
    pub fn edit(&mut self, id: StateNodeId) -> &mut StateNode {
        let node = &mut self.nodes[id.0];
        if !node.is_editing() {
            node.start_editing();
            self.changed.push(id);
        }
        node
    }

    /// Nodes touched since the last store/restore, in the order touched.
    pub fn changed(&self) -> &[StateNodeId] {
        &self.changed
    }

    /// Commit every touched node and clear the changed list.
    pub fn store(&mut self) {
        for id in self.changed.drain(..) {
            self.nodes[id.0].store();
        }
    }

    /// Roll every touched node back and clear the changed list.
    pub fn restore(&mut self) {
        for id in self.changed.drain(..) {
            self.nodes[id.0].restore();
        }
    }

    /// Mark every node as changed (`true`) or clear all dirty tags.
    pub fn set_everything_dirty(&mut self, dirty: bool) {
        for node in &mut self.nodes {
            node.set_everything_dirty(dirty);
        }
        if dirty {
            self.changed = self.ids().collect();
        }
    }

    /// Validate every tree.
    pub fn validate_all(&self) -> Result<()> {
        for node in &self.nodes {
            if let StateNode::Tree(t) = node {
                t.validate()?;
            }
        }
        Ok(())
    }

    /// Current values of every node.
    ///
    /// Only meaningful between proposals, when current equals stored.
    pub fn snapshot(&self, sample: u64) -> StateSnapshot {
        StateSnapshot {
            sample,
            nodes: self
                .nodes
                .iter()
                .map(|n| (n.name().to_string(), n.snapshot()))
                .collect(),
        }
    }

    /// Load values from a snapshot. Every node must be present.
    pub fn restore_snapshot(&mut self, snapshot: &StateSnapshot) -> Result<()> {
        if !self.changed.is_empty() {
            return Err(CanopyError::Protocol(
                "cannot load a snapshot while a proposal is in flight".into(),
            ));
        }
        for node in &mut self.nodes {
            let value = snapshot.nodes.get(node.name()).ok_or_else(|| {
                CanopyError::model(node.name(), "missing from the state file")
            })?;
            node.assign_snapshot(value)?;
        }
        debug!(sample = snapshot.sample, nodes = self.nodes.len(), "state restored from snapshot");
        Ok(())
    }
}
