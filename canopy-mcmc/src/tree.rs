//! Binary time tree stored as a versioned state node.
//!
//! Uses arena-style storage: nodes live in a flat `Vec<Node>` and are
//! referenced by `NodeId` (a `usize` index). Leaves are numbered
//! `0..leaf_count`, internal nodes after them, and a node's number is also
//! its index in the arena. Parent and child links are plain indices, so
//! the stored copy is an array clone and rolling back a topology change
//! never has to chase references.

use std::collections::BTreeMap;
use std::fmt;

use canopy_core::{CanopyError, Checkpointable, Named, Result, Summarizable};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::calculation::Dirty;

/// Index into the tree's node arena.
pub type NodeId = usize;

/// Value of a metadata annotation on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Number(f64),
    Text(String),
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Number(x) => write!(f, "{}", x),
            MetaValue::Text(s) => f.write_str(s),
        }
    }
}

/// A single vertex of a binary tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    nr: NodeId,
    height: f64,
    parent: Option<NodeId>,
    left: Option<NodeId>,
    right: Option<NodeId>,
    label: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metadata: BTreeMap<String, MetaValue>,
    #[serde(skip)]
    dirty: Dirty,
}

impl Node {
    /// A leaf at the given height.
    pub fn leaf(nr: NodeId, height: f64) -> Self {
        Self {
            nr,
            height,
            parent: None,
            left: None,
            right: None,
            label: None,
            metadata: BTreeMap::new(),
            dirty: Dirty::Clean,
        }
    }

    /// An internal node over two children. Parent links are filled in by
    /// [`Tree::from_nodes`].
    pub fn internal(nr: NodeId, height: f64, left: NodeId, right: NodeId) -> Self {
        Self {
            left: Some(left),
            right: Some(right),
            ..Self::leaf(nr, height)
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: MetaValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn nr(&self) -> NodeId {
        self.nr
    }

    pub fn height(&self) -> f64 {
        self.height
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn left(&self) -> Option<NodeId> {
        self.left
    }

    pub fn right(&self) -> Option<NodeId> {
        self.right
    }

    /// Children in left, right order.
    pub fn children(&self) -> impl Iterator<Item = NodeId> {
        self.left.into_iter().chain(self.right)
    }

    pub fn child_count(&self) -> usize {
        self.left.is_some() as usize + self.right.is_some() as usize
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn metadata(&self, key: &str) -> Option<&MetaValue> {
        self.metadata.get(key)
    }

    pub fn metadata_entries(&self) -> impl Iterator<Item = (&str, &MetaValue)> {
        self.metadata.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// True if this node has no children.
    pub fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }

    /// True if this node has no parent.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Dirtiness since the last store/restore.
    pub fn dirty(&self) -> Dirty {
        self.dirty
    }

    fn make_dirty(&mut self, level: Dirty) {
        self.dirty = self.dirty.max(level);
    }
}

/// A rooted binary tree whose nodes carry heights.
#[derive(Debug, Clone)]
pub struct Tree {
    name: String,
    nodes: Vec<Node>,
    stored_nodes: Vec<Node>,
    root: NodeId,
    stored_root: NodeId,
    leaf_count: usize,
    tip_dates: bool,
    editing: bool,
}

impl Tree {
    /// Build a tree from pre-built nodes.
    ///
    /// Nodes may come in any order; they are placed by number. Parent links
    /// are derived from child links and the result is validated.
    ///
    /// # Errors
    ///
    /// Returns a model error for duplicate or missing node numbers, a leaf
    /// numbered after an internal node, or any failed invariant.
    pub fn from_nodes(name: impl Into<String>, nodes: Vec<Node>) -> Result<Self> {
        Self::assemble(name.into(), nodes, false)
    }

    pub(crate) fn assemble(name: String, nodes: Vec<Node>, tip_dates: bool) -> Result<Self> {
        let n = nodes.len();
        if n == 0 {
            return Err(CanopyError::model(&name, "tree has no nodes"));
        }
        let mut slots: Vec<Option<Node>> = vec![None; n];
        for node in nodes {
            let nr = node.nr;
            if nr >= n {
                return Err(CanopyError::model(
                    &name,
                    format!("node number {} out of range for {} nodes", nr, n),
                ));
            }
            if slots[nr].is_some() {
                return Err(CanopyError::model(
                    &name,
                    format!("duplicate node number {}", nr),
                ));
            }
            slots[nr] = Some(node);
        }
        let mut nodes: Vec<Node> = slots.into_iter().flatten().collect();
        for node in &mut nodes {
            node.parent = None;
            node.dirty = Dirty::Clean;
        }
        for i in 0..n {
            let (left, right) = (nodes[i].left, nodes[i].right);
            for child in left.into_iter().chain(right) {
                if child >= n {
                    return Err(CanopyError::model(
                        &name,
                        format!("node {} has unknown child {}", i, child),
                    ));
                }
                if nodes[child].parent.is_some() {
                    return Err(CanopyError::model(
                        &name,
                        format!("node {} has more than one parent", child),
                    ));
                }
                nodes[child].parent = Some(i);
            }
        }
        let roots: Vec<NodeId> = (0..n).filter(|&i| nodes[i].parent.is_none()).collect();
        let root = match roots.as_slice() {
            [r] => *r,
            [] => return Err(CanopyError::model(&name, "tree has no root")),
            _ => {
                return Err(CanopyError::model(
                    &name,
                    format!("tree has {} parentless nodes", roots.len()),
                ))
            }
        };
        let leaf_count = nodes.iter().filter(|n| n.is_leaf()).count();
        let tree = Self {
            name,
            stored_nodes: nodes.clone(),
            nodes,
            root,
            stored_root: root,
            leaf_count,
            tip_dates,
            editing: false,
        };
        tree.validate().map_err(|e| match e {
            CanopyError::Invariant { component, message } => {
                CanopyError::Model { component, message }
            }
            other => other,
        })?;
        Ok(tree)
    }

    /// Parse a Newick string, deriving heights from branch lengths.
    pub fn from_newick(name: impl Into<String>, input: &str) -> Result<Self> {
        crate::newick::parse(name, input, &crate::newick::NewickOptions::default())
    }

    /// Give leaves sampling dates (as heights before the present) and relax
    /// the leaf-height-zero invariant.
    ///
    /// Internal nodes that end up below a child are pushed up just above it,
    /// with a warning naming each moved node.
    ///
    /// # Errors
    ///
    /// Returns a model error for an unknown leaf or a negative height.
    pub fn with_tip_dates(mut self, dates: &[(NodeId, f64)]) -> Result<Self> {
        for &(nr, h) in dates {
            if nr >= self.leaf_count {
                return Err(CanopyError::model(
                    &self.name,
                    format!("tip date given for non-leaf node {}", nr),
                ));
            }
            if !(h >= 0.0) {
                return Err(CanopyError::model(
                    &self.name,
                    format!("tip date {} for node {} is negative", h, nr),
                ));
            }
            self.nodes[nr].height = h;
        }
        self.tip_dates = true;
        let order = self.postorder();
        for id in order {
            let floor = self.nodes[id]
                .children()
                .map(|c| self.nodes[c].height)
                .fold(f64::NEG_INFINITY, f64::max);
            if self.nodes[id].height < floor {
                warn!(
                    tree = %self.name,
                    node = id,
                    from = self.nodes[id].height,
                    to = floor + 1e-6,
                    "tip dates put a node below its child; raising its height"
                );
                self.nodes[id].height = floor + 1e-6;
            }
        }
        self.stored_nodes = self.nodes.clone();
        self.validate()?;
        Ok(self)
    }

    /// The root node id.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Access a node by number.
    ///
    /// # Panics
    ///
    /// Panics if `nr >= node_count()`.
    pub fn node(&self, nr: NodeId) -> &Node {
        &self.nodes[nr]
    }

    pub fn get_node(&self, nr: NodeId) -> Option<&Node> {
        self.nodes.get(nr)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn height(&self, nr: NodeId) -> f64 {
        self.nodes[nr].height
    }

    pub fn parent(&self, nr: NodeId) -> Option<NodeId> {
        self.nodes[nr].parent
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    pub fn internal_node_count(&self) -> usize {
        self.nodes.len() - self.leaf_count
    }

    pub fn has_tip_dates(&self) -> bool {
        self.tip_dates
    }

    pub fn is_leaf(&self, nr: NodeId) -> bool {
        self.nodes[nr].is_leaf()
    }

    pub fn is_root(&self, nr: NodeId) -> bool {
        nr == self.root
    }

    /// The child of `parent` that is not `child`.
    pub fn other_child(&self, parent: NodeId, child: NodeId) -> Option<NodeId> {
        let p = self.nodes.get(parent)?;
        match (p.left, p.right) {
            (Some(l), Some(r)) if l == child => Some(r),
            (Some(l), Some(r)) if r == child => Some(l),
            _ => None,
        }
    }

    /// The other child of `nr`'s parent.
    pub fn sibling(&self, nr: NodeId) -> Option<NodeId> {
        let parent = self.nodes.get(nr)?.parent?;
        self.other_child(parent, nr)
    }

    /// Node ids in post-order (children before parents).
    pub fn postorder(&self) -> Vec<NodeId> {
        let mut result = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            result.push(id);
            stack.extend(self.nodes[id].children());
        }
        result.reverse();
        result
    }

    /// Node ids in pre-order, left child first.
    pub fn preorder(&self) -> Vec<NodeId> {
        let mut result = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            result.push(id);
            let node = &self.nodes[id];
            stack.extend(node.right);
            stack.extend(node.left);
        }
        result
    }

    /// All descendants of `nr` (excluding `nr`), in pre-order.
    pub fn all_children(&self, nr: NodeId) -> Vec<NodeId> {
        let mut result = Vec::new();
        let mut stack: Vec<NodeId> = self.nodes[nr].children().collect();
        stack.reverse();
        while let Some(id) = stack.pop() {
            result.push(id);
            let node = &self.nodes[id];
            stack.extend(node.right);
            stack.extend(node.left);
        }
        result
    }

    /// Leaves below `nr` (or `nr` itself if it is a leaf).
    pub fn all_leaf_nodes(&self, nr: NodeId) -> Vec<NodeId> {
        if self.nodes[nr].is_leaf() {
            return vec![nr];
        }
        self.all_children(nr)
            .into_iter()
            .filter(|&id| self.nodes[id].is_leaf())
            .collect()
    }

    /// Most recent common ancestor of two nodes.
    pub fn mrca(&self, a: NodeId, b: NodeId) -> Result<NodeId> {
        if a >= self.nodes.len() || b >= self.nodes.len() {
            return Err(CanopyError::InvalidInput("node id out of range".into()));
        }
        let mut ancestors_a = Vec::new();
        let mut cur = Some(a);
        while let Some(id) = cur {
            ancestors_a.push(id);
            cur = self.nodes[id].parent;
        }
        let mut cur = Some(b);
        while let Some(id) = cur {
            if ancestors_a.contains(&id) {
                return Ok(id);
            }
            cur = self.nodes[id].parent;
        }
        Ok(self.root)
    }

    /// Labels of the leaves, in node-number order.
    pub fn leaf_labels(&self) -> Vec<Option<&str>> {
        self.nodes[..self.leaf_count]
            .iter()
            .map(|n| n.label())
            .collect()
    }

    /// Independent deep copy, not open for editing.
    pub fn copy(&self) -> Tree {
        let mut t = self.clone();
        t.editing = false;
        for node in &mut t.nodes {
            node.dirty = Dirty::Clean;
        }
        t
    }

    /// True if the tree was opened for editing since the last store/restore.
    pub fn is_editing(&self) -> bool {
        self.editing
    }

    /// True if any node carries a non-clean tag.
    pub fn something_is_dirty(&self) -> bool {
        self.editing && self.nodes.iter().any(|n| n.dirty != Dirty::Clean)
    }

    /// Highest dirty tag over all nodes.
    pub fn dirtiness(&self) -> Dirty {
        if !self.editing {
            return Dirty::Clean;
        }
        self.nodes
            .iter()
            .map(|n| n.dirty)
            .max()
            .unwrap_or(Dirty::Clean)
    }

    // Mutators. All require the tree to be open for editing.

    /// Move a node to a new height.
    ///
    /// The node and its children are tagged dirty, since the lengths of the
    /// branches above the children changed too.
    pub fn set_height(&mut self, nr: NodeId, height: f64) -> Result<()> {
        self.check_editing()?;
        self.check_node(nr)?;
        self.nodes[nr].height = height;
        self.nodes[nr].make_dirty(Dirty::Dirty);
        let (left, right) = (self.nodes[nr].left, self.nodes[nr].right);
        for child in left.into_iter().chain(right) {
            self.nodes[child].make_dirty(Dirty::Dirty);
        }
        Ok(())
    }

    /// Detach `child` from `parent`, leaving the child slot empty.
    ///
    /// The tree is temporarily not binary until a matching [`add_child`]
    /// fills the slot again.
    ///
    /// [`add_child`]: Tree::add_child
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.check_editing()?;
        self.check_node(parent)?;
        let p = &mut self.nodes[parent];
        if p.left == Some(child) {
            p.left = None;
        } else if p.right == Some(child) {
            p.right = None;
        } else {
            return Err(CanopyError::Protocol(format!(
                "node {} is not a child of {} in '{}'",
                child, parent, self.name
            )));
        }
        self.mark_filthy_upward(parent);
        Ok(())
    }

    /// Attach `child` to the first free slot of `parent`.
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.check_editing()?;
        self.check_node(parent)?;
        self.check_node(child)?;
        let p = &mut self.nodes[parent];
        if p.left.is_none() {
            p.left = Some(child);
        } else if p.right.is_none() {
            p.right = Some(child);
        } else {
            return Err(CanopyError::Protocol(format!(
                "node {} already has two children in '{}'",
                parent, self.name
            )));
        }
        self.nodes[child].parent = Some(parent);
        self.nodes[child].make_dirty(Dirty::Filthy);
        self.mark_filthy_upward(parent);
        Ok(())
    }

    /// Swap `old_child` for `new_child` under `parent`, keeping its slot.
    pub fn replace(&mut self, parent: NodeId, old_child: NodeId, new_child: NodeId) -> Result<()> {
        self.check_editing()?;
        self.check_node(parent)?;
        self.check_node(new_child)?;
        let p = &mut self.nodes[parent];
        if p.left == Some(old_child) {
            p.left = Some(new_child);
        } else if p.right == Some(old_child) {
            p.right = Some(new_child);
        } else {
            return Err(CanopyError::Protocol(format!(
                "node {} is not a child of {} in '{}'",
                old_child, parent, self.name
            )));
        }
        self.nodes[new_child].parent = Some(parent);
        self.nodes[new_child].make_dirty(Dirty::Filthy);
        self.mark_filthy_upward(parent);
        Ok(())
    }

    /// Make `nr` the root, clearing its parent link.
    pub fn set_root(&mut self, nr: NodeId) -> Result<()> {
        self.check_editing()?;
        self.check_node(nr)?;
        self.root = nr;
        self.nodes[nr].parent = None;
        self.nodes[nr].make_dirty(Dirty::Filthy);
        Ok(())
    }

    /// Set or overwrite a metadata annotation.
    pub fn set_metadata(&mut self, nr: NodeId, key: impl Into<String>, value: MetaValue) -> Result<()> {
        self.check_editing()?;
        self.check_node(nr)?;
        self.nodes[nr].metadata.insert(key.into(), value);
        self.nodes[nr].make_dirty(Dirty::Dirty);
        Ok(())
    }

    /// Multiply every internal node height by `factor`.
    ///
    /// Returns the number of scaled nodes, or `None` without touching the
    /// tree if a branch would become negative (possible with tip dates).
    pub fn scale(&mut self, factor: f64) -> Result<Option<usize>> {
        self.check_editing()?;
        let new_height = |node: &Node| {
            if node.is_leaf() {
                node.height
            } else {
                node.height * factor
            }
        };
        for node in &self.nodes {
            if let Some(p) = node.parent {
                if new_height(&self.nodes[p]) < new_height(node) {
                    return Ok(None);
                }
            }
        }
        let mut scaled = 0;
        for node in &mut self.nodes {
            if !node.is_leaf() {
                node.height *= factor;
                scaled += 1;
            }
            node.make_dirty(Dirty::Dirty);
        }
        Ok(Some(scaled))
    }

    /// Overwrite topology and heights from another tree with the same
    /// node count (initialisation, resume). Both copies are replaced.
    pub fn assign_from(&mut self, other: &Tree) -> Result<()> {
        if other.nodes.len() != self.nodes.len() {
            return Err(CanopyError::model(
                &self.name,
                format!(
                    "cannot assign a tree of {} nodes to one of {}",
                    other.nodes.len(),
                    self.nodes.len()
                ),
            ));
        }
        self.nodes = other.nodes.clone();
        for node in &mut self.nodes {
            node.dirty = Dirty::Clean;
        }
        self.stored_nodes = self.nodes.clone();
        self.root = other.root;
        self.stored_root = other.root;
        self.leaf_count = other.leaf_count;
        self.tip_dates = other.tip_dates;
        self.editing = false;
        Ok(())
    }

    /// Check the structural invariants.
    ///
    /// O(N); meant for tests and debugging, not the hot path.
    ///
    /// # Errors
    ///
    /// Returns an invariant error naming the first violation found.
    pub fn validate(&self) -> Result<()> {
        let n = self.nodes.len();
        let fail = |msg: String| Err(CanopyError::invariant(&self.name, msg));
        if n == 0 {
            return fail("tree has no nodes".into());
        }
        if self.root >= n {
            return fail(format!("root {} out of range", self.root));
        }
        if self.nodes[self.root].parent.is_some() {
            return fail(format!("root {} has a parent", self.root));
        }
        if n > 1 && self.nodes[self.root].is_leaf() {
            return fail(format!("root {} is a leaf", self.root));
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if node.nr != i {
                return fail(format!("node at index {} is numbered {}", i, node.nr));
            }
            match (node.left, node.right) {
                (None, None) => {
                    if i >= self.leaf_count {
                        return fail(format!("leaf {} numbered after internal nodes", i));
                    }
                    if !self.tip_dates && node.height != 0.0 {
                        return fail(format!("leaf {} has height {}", i, node.height));
                    }
                }
                (Some(l), Some(r)) => {
                    if i < self.leaf_count {
                        return fail(format!("internal node {} numbered among leaves", i));
                    }
                    if l == r {
                        return fail(format!("node {} has the same child twice", i));
                    }
                    for c in [l, r] {
                        if c >= n {
                            return fail(format!("node {} has unknown child {}", i, c));
                        }
                        if self.nodes[c].parent != Some(i) {
                            return fail(format!(
                                "child {} of node {} points to parent {:?}",
                                c, i, self.nodes[c].parent
                            ));
                        }
                        let length = node.height - self.nodes[c].height;
                        if length < 0.0 {
                            return fail(format!(
                                "negative branch length {} above node {}",
                                length, c
                            ));
                        }
                    }
                }
                _ => return fail(format!("node {} has exactly one child", i)),
            }
            if i != self.root {
                match node.parent {
                    None => return fail(format!("non-root node {} has no parent", i)),
                    Some(p) if p >= n => {
                        return fail(format!("node {} has unknown parent {}", i, p))
                    }
                    Some(p) => {
                        let pn = &self.nodes[p];
                        if pn.left != Some(i) && pn.right != Some(i) {
                            return fail(format!(
                                "node {} is not a child of its parent {}",
                                i, p
                            ));
                        }
                    }
                }
            }
        }
        let mut seen = vec![false; n];
        let mut stack = vec![self.root];
        let mut reached = 0;
        while let Some(id) = stack.pop() {
            if seen[id] {
                return fail(format!("cycle through node {}", id));
            }
            seen[id] = true;
            reached += 1;
            stack.extend(self.nodes[id].children());
        }
        if reached != n {
            return fail(format!("{} of {} nodes unreachable from the root", n - reached, n));
        }
        Ok(())
    }

    /// Write the tree as Newick with node numbers as labels.
    pub fn to_newick(&self) -> String {
        crate::newick::write(self, crate::newick::NewickStyle::Numbers)
    }

    pub(crate) fn start_editing(&mut self) {
        self.editing = true;
    }

    pub(crate) fn set_everything_dirty(&mut self, dirty: bool) {
        let tag = if dirty { Dirty::Filthy } else { Dirty::Clean };
        for node in &mut self.nodes {
            node.dirty = tag;
        }
        self.editing = dirty;
    }

    // The walk is bounded by the node count: in the middle of a multi-step
    // edit the parent links may briefly form a loop.
    fn mark_filthy_upward(&mut self, from: NodeId) {
        let mut cur = Some(from);
        let mut steps = 0;
        while let Some(id) = cur {
            if steps > self.nodes.len() {
                break;
            }
            self.nodes[id].make_dirty(Dirty::Filthy);
            cur = self.nodes[id].parent;
            steps += 1;
        }
    }

    fn check_editing(&self) -> Result<()> {
        if self.editing {
            Ok(())
        } else {
            Err(CanopyError::Protocol(format!(
                "tree '{}' mutated without being opened for editing",
                self.name
            )))
        }
    }

    fn check_node(&self, nr: NodeId) -> Result<()> {
        if nr < self.nodes.len() {
            Ok(())
        } else {
            Err(CanopyError::InvalidInput(format!(
                "node {} out of range for '{}' ({} nodes)",
                nr,
                self.name,
                self.nodes.len()
            )))
        }
    }
}

impl Checkpointable for Tree {
    fn store(&mut self) {
        for node in &mut self.nodes {
            node.dirty = Dirty::Clean;
        }
        self.stored_nodes.clone_from(&self.nodes);
        self.stored_root = self.root;
        self.editing = false;
    }

    fn restore(&mut self) {
        self.nodes.clone_from(&self.stored_nodes);
        self.root = self.stored_root;
        self.editing = false;
    }
}

impl Named for Tree {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Summarizable for Tree {
    fn summary(&self) -> String {
        format!(
            "Tree '{}': {} nodes ({} leaves, {} internal), root height {}",
            self.name,
            self.node_count(),
            self.leaf_count,
            self.internal_node_count(),
            self.nodes[self.root].height
        )
    }
}

impl fmt::Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_newick())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FOUR_TAXA: &str = "((0:1.0,1:1.0)4:1.0,(2:1.0,3:1.0)5:0.5)6:0.0;";

    fn sample_tree() -> Tree {
        Tree::from_newick("tree", FOUR_TAXA).unwrap()
    }

    #[test]
    fn from_nodes_derives_parents() {
        let nodes = vec![
            Node::leaf(0, 0.0),
            Node::leaf(1, 0.0),
            Node::internal(2, 1.0, 0, 1),
        ];
        let tree = Tree::from_nodes("t", nodes).unwrap();
        assert_eq!(tree.root(), 2);
        assert_eq!(tree.parent(0), Some(2));
        assert_eq!(tree.parent(1), Some(2));
        assert_eq!(tree.leaf_count(), 2);
        assert!(tree.validate().is_ok());
    }

    #[test]
    fn from_nodes_rejects_duplicates() {
        let nodes = vec![
            Node::leaf(0, 0.0),
            Node::leaf(0, 0.0),
            Node::internal(2, 1.0, 0, 1),
        ];
        let err = Tree::from_nodes("t", nodes).unwrap_err();
        assert!(matches!(err, CanopyError::Model { .. }));
    }

    #[test]
    fn from_nodes_rejects_negative_branch() {
        let nodes = vec![
            Node::leaf(0, 0.0),
            Node::leaf(1, 0.0),
            Node::internal(2, -1.0, 0, 1),
        ];
        assert!(Tree::from_nodes("t", nodes).is_err());
    }

    #[test]
    fn from_nodes_rejects_leaf_root() {
        // Node 2 is a parentless leaf next to a proper cherry.
        let nodes = vec![
            Node::leaf(0, 0.0),
            Node::leaf(1, 0.0),
            Node::leaf(2, 0.0),
            Node::internal(3, 1.0, 0, 1),
        ];
        assert!(Tree::from_nodes("t", nodes).is_err());
    }

    #[test]
    fn single_node_tree_is_valid() {
        let tree = Tree::from_nodes("t", vec![Node::leaf(0, 0.0)]).unwrap();
        assert_eq!(tree.node_count(), 1);
        assert!(tree.validate().is_ok());
    }

    #[test]
    fn heights_and_counts() {
        let tree = sample_tree();
        assert_eq!(tree.node_count(), 7);
        assert_eq!(tree.leaf_count(), 4);
        assert_eq!(tree.internal_node_count(), 3);
        assert_eq!(tree.root(), 6);
        assert!((tree.height(4) - 1.0).abs() < 1e-10);
        assert!((tree.height(5) - 1.5).abs() < 1e-10);
        assert!((tree.height(6) - 2.0).abs() < 1e-10);
    }

    #[test]
    fn sibling_and_other_child() {
        let tree = sample_tree();
        assert_eq!(tree.sibling(0), Some(1));
        assert_eq!(tree.sibling(4), Some(5));
        assert_eq!(tree.sibling(6), None);
        assert_eq!(tree.other_child(6, 5), Some(4));
        assert_eq!(tree.other_child(6, 0), None);
    }

    #[test]
    fn traversals() {
        let tree = sample_tree();
        assert_eq!(tree.preorder(), vec![6, 4, 0, 1, 5, 2, 3]);
        let post = tree.postorder();
        assert_eq!(post.len(), 7);
        assert_eq!(*post.last().unwrap(), 6);
        assert_eq!(tree.all_leaf_nodes(5), vec![2, 3]);
        assert_eq!(tree.all_children(4), vec![0, 1]);
    }

    #[test]
    fn mrca_cases() {
        let tree = sample_tree();
        assert_eq!(tree.mrca(0, 1).unwrap(), 4);
        assert_eq!(tree.mrca(0, 3).unwrap(), 6);
        assert_eq!(tree.mrca(4, 0).unwrap(), 4);
        assert!(tree.mrca(0, 99).is_err());
    }

    #[test]
    fn mutation_requires_editing() {
        let mut tree = sample_tree();
        let err = tree.set_height(4, 1.2).unwrap_err();
        assert!(matches!(err, CanopyError::Protocol(_)));
    }

    #[test]
    fn set_height_marks_node_and_children() {
        let mut tree = sample_tree();
        tree.start_editing();
        tree.set_height(4, 1.2).unwrap();
        assert_eq!(tree.node(4).dirty(), Dirty::Dirty);
        assert_eq!(tree.node(0).dirty(), Dirty::Dirty);
        assert_eq!(tree.node(1).dirty(), Dirty::Dirty);
        assert_eq!(tree.node(5).dirty(), Dirty::Clean);
        assert_eq!(tree.node(6).dirty(), Dirty::Clean);
        assert_eq!(tree.dirtiness(), Dirty::Dirty);
    }

    #[test]
    fn replace_marks_path_to_root_filthy() {
        let mut tree = sample_tree();
        tree.start_editing();
        // Swap leaves 1 and 2 between the cherries.
        tree.replace(4, 1, 2).unwrap();
        tree.replace(5, 2, 1).unwrap();
        assert!(tree.validate().is_ok());
        assert_eq!(tree.node(4).dirty(), Dirty::Filthy);
        assert_eq!(tree.node(6).dirty(), Dirty::Filthy);
        assert_eq!(tree.dirtiness(), Dirty::Filthy);
        assert_eq!(tree.all_leaf_nodes(4), vec![0, 2]);
    }

    #[test]
    fn restore_undoes_root_change() {
        let mut tree = sample_tree();
        let before = tree.nodes().to_vec();
        tree.start_editing();
        // Re-root on node 5: 6 goes below 5 in place of leaf 3, which moves under 6.
        tree.set_height(6, 1.2).unwrap();
        tree.set_height(5, 2.5).unwrap();
        tree.replace(6, 5, 3).unwrap();
        tree.replace(5, 3, 6).unwrap();
        tree.set_root(5).unwrap();
        assert!(tree.validate().is_ok());
        assert_eq!(tree.root(), 5);
        tree.restore();
        assert_eq!(tree.root(), 6);
        assert_eq!(tree.nodes(), before.as_slice());
        assert!(tree.validate().is_ok());
    }

    #[test]
    fn remove_then_add_child() {
        let mut tree = sample_tree();
        tree.start_editing();
        tree.remove_child(4, 1).unwrap();
        assert!(tree.validate().is_err());
        tree.add_child(4, 1).unwrap();
        assert!(tree.validate().is_ok());
        assert!(tree.add_child(4, 2).is_err());
    }

    #[test]
    fn scale_multiplies_internal_heights() {
        let mut tree = sample_tree();
        tree.start_editing();
        assert_eq!(tree.scale(2.0).unwrap(), Some(3));
        assert!((tree.height(4) - 2.0).abs() < 1e-10);
        assert!((tree.height(5) - 3.0).abs() < 1e-10);
        assert!((tree.height(6) - 4.0).abs() < 1e-10);
        assert_eq!(tree.height(0), 0.0);
    }

    #[test]
    fn scale_refuses_negative_branch_with_tip_dates() {
        let mut tree = sample_tree().with_tip_dates(&[(0, 0.9)]).unwrap();
        tree.start_editing();
        assert_eq!(tree.scale(0.5).unwrap(), None);
        assert!((tree.height(4) - 1.0).abs() < 1e-10);
    }

    #[test]
    fn tip_dates_relax_leaf_heights() {
        let tree = sample_tree().with_tip_dates(&[(2, 0.25)]).unwrap();
        assert!(tree.has_tip_dates());
        assert!((tree.height(2) - 0.25).abs() < 1e-12);
        assert!(tree.validate().is_ok());
        assert!(sample_tree().with_tip_dates(&[(5, 0.1)]).is_err());
    }

    #[test]
    fn tip_dates_above_parent_raise_ancestors() {
        let tree = sample_tree().with_tip_dates(&[(0, 1.5)]).unwrap();
        assert!((tree.height(4) - (1.5 + 1e-6)).abs() < 1e-12);
        assert!((tree.height(6) - 2.0).abs() < 1e-12);
        assert!(tree.validate().is_ok());
        assert_eq!(tree.stored_nodes, tree.nodes);
    }

    #[test]
    fn copy_is_independent() {
        let tree = sample_tree();
        let mut copy = tree.copy();
        copy.start_editing();
        copy.set_height(6, 3.0).unwrap();
        assert!((tree.height(6) - 2.0).abs() < 1e-10);
    }

    #[test]
    fn store_commits() {
        let mut tree = sample_tree();
        tree.start_editing();
        tree.set_height(6, 3.0).unwrap();
        tree.store();
        assert_eq!(tree.dirtiness(), Dirty::Clean);
        tree.start_editing();
        tree.set_height(6, 4.0).unwrap();
        tree.restore();
        assert!((tree.height(6) - 3.0).abs() < 1e-10);
    }

    #[test]
    fn summary_format() {
        let tree = sample_tree();
        assert_eq!(
            tree.summary(),
            "Tree 'tree': 7 nodes (4 leaves, 3 internal), root height 2"
        );
    }
}
