//! Newick parser and writer for time trees.
//!
//! Supports the standard Newick grammar with optional `[&key=value,...]`
//! annotations:
//! ```text
//! tree     = subtree ';'
//! subtree  = '(' subtree ',' subtree ')' label | label
//! label    = name? meta? (':' length)? meta?
//! meta     = '[&' key '=' value (',' key '=' value)* ']'
//! ```
//!
//! Branch lengths become node heights: a node's height is the largest
//! root-to-tip distance minus its own distance from the root.

use std::collections::BTreeMap;

use canopy_core::{CanopyError, Result};

use crate::tree::{MetaValue, Node, NodeId, Tree};

/// Knobs for turning a Newick string into a [`Tree`].
#[derive(Debug, Clone)]
pub struct NewickOptions {
    /// Snap every leaf to height 0, making the tree ultrametric.
    pub adjust_tip_heights: bool,
    /// Leaves closer to 0 than this are snapped even without adjustment.
    pub threshold: f64,
    /// Subtracted from integer labels when they are used as node numbers.
    pub label_offset: usize,
}

impl Default for NewickOptions {
    fn default() -> Self {
        Self {
            adjust_tip_heights: true,
            threshold: 1e-6,
            label_offset: 0,
        }
    }
}

/// How node labels are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewickStyle {
    /// Leaf labels (or numbers for unlabelled leaves); internal nodes bare.
    Labels,
    /// Every node labelled with its number.
    Numbers,
    /// Numbers plus `[&key=value]` metadata.
    Metadata,
}

/// Parse a Newick string into a [`Tree`].
///
/// If every node carries an integer label the labels are the node numbers.
/// Otherwise leaves are numbered in order of appearance and internal nodes
/// after them in post-order.
///
/// # Errors
///
/// Returns a parse error for malformed input and a model error for a
/// non-binary node, a negative branch length or duplicate numbers.
pub fn parse(name: impl Into<String>, input: &str, options: &NewickOptions) -> Result<Tree> {
    let name = name.into();
    let mut parser = Parser::new(input.as_bytes());
    let root = parser.parse_tree()?;
    let raw = parser.nodes;

    for (i, node) in raw.iter().enumerate() {
        if !(node.children.is_empty() || node.children.len() == 2) {
            return Err(CanopyError::model(
                &name,
                format!(
                    "node '{}' has {} children; only binary trees are supported",
                    node.label.as_deref().unwrap_or("?"),
                    node.children.len()
                ),
            ));
        }
        if let Some(len) = node.length {
            if len < 0.0 && i != root {
                return Err(CanopyError::model(
                    &name,
                    format!(
                        "negative branch length {} above '{}'",
                        len,
                        node.label.as_deref().unwrap_or("?")
                    ),
                ));
            }
        }
    }

    let numbers = number_nodes(&raw, root, options.label_offset);

    // Depth below the root, then height = max depth - depth.
    let mut depth = vec![0.0; raw.len()];
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        for &c in &raw[id].children {
            depth[c] = depth[id] + raw[c].length.unwrap_or(0.0);
            stack.push(c);
        }
    }
    let max_depth = depth.iter().copied().fold(0.0, f64::max);

    let mut tip_dates = false;
    let mut nodes = Vec::with_capacity(raw.len());
    for (i, r) in raw.iter().enumerate() {
        let mut height = max_depth - depth[i];
        if r.children.is_empty() {
            if options.adjust_tip_heights || height.abs() < options.threshold {
                height = 0.0;
            } else {
                tip_dates = true;
            }
        }
        let mut node = match r.children.as_slice() {
            [l, rt] => Node::internal(numbers[i], height, numbers[*l], numbers[*rt]),
            _ => Node::leaf(numbers[i], height),
        };
        if let Some(label) = &r.label {
            node = node.with_label(label.clone());
        }
        for (k, v) in &r.metadata {
            node = node.with_metadata(k.clone(), v.clone());
        }
        nodes.push(node);
    }
    Tree::assemble(name, nodes, tip_dates)
}

/// Serialize a tree to Newick, with branch lengths from node heights.
pub fn write(tree: &Tree, style: NewickStyle) -> String {
    enum Step {
        Enter(NodeId),
        Comma,
        Close(NodeId),
    }

    let mut buf = String::new();
    let mut stack = vec![Step::Enter(tree.root())];
    while let Some(step) = stack.pop() {
        match step {
            Step::Enter(id) => {
                let node = tree.node(id);
                if let (Some(l), Some(r)) = (node.left(), node.right()) {
                    buf.push('(');
                    stack.push(Step::Close(id));
                    stack.push(Step::Enter(r));
                    stack.push(Step::Comma);
                    stack.push(Step::Enter(l));
                } else {
                    write_node(tree, id, style, &mut buf);
                }
            }
            Step::Comma => buf.push(','),
            Step::Close(id) => {
                buf.push(')');
                write_node(tree, id, style, &mut buf);
            }
        }
    }
    buf.push(';');
    buf
}

/// Label, metadata and branch length of one node.
fn write_node(tree: &Tree, id: NodeId, style: NewickStyle, buf: &mut String) {
    let node = tree.node(id);
    match style {
        NewickStyle::Labels => {
            if node.is_leaf() {
                match node.label() {
                    Some(label) => push_label(label, buf),
                    None => buf.push_str(&node.nr().to_string()),
                }
            }
        }
        NewickStyle::Numbers | NewickStyle::Metadata => buf.push_str(&node.nr().to_string()),
    }
    if style == NewickStyle::Metadata {
        let mut entries = node.metadata_entries().peekable();
        if entries.peek().is_some() {
            buf.push_str("[&");
            for (i, (k, v)) in entries.enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                buf.push_str(k);
                buf.push('=');
                buf.push_str(&v.to_string());
            }
            buf.push(']');
        }
    }
    if let Some(p) = node.parent() {
        buf.push(':');
        buf.push_str(&(tree.height(p) - node.height()).to_string());
    }
}

fn push_label(label: &str, buf: &mut String) {
    let needs_quotes = label
        .bytes()
        .any(|b| matches!(b, b'(' | b')' | b',' | b':' | b';' | b'[' | b']' | b' ' | b'\''));
    if needs_quotes {
        buf.push('\'');
        buf.push_str(&label.replace('\'', "''"));
        buf.push('\'');
    } else {
        buf.push_str(label);
    }
}

/// Map parse order to node numbers.
fn number_nodes(raw: &[RawNode], root: usize, offset: usize) -> Vec<NodeId> {
    let from_labels: Option<Vec<NodeId>> = raw
        .iter()
        .map(|r| {
            r.label
                .as_deref()
                .and_then(|l| l.parse::<usize>().ok())
                .and_then(|n| n.checked_sub(offset))
        })
        .collect();
    if let Some(numbers) = from_labels {
        return numbers;
    }

    let mut numbers = vec![0; raw.len()];
    let mut next_leaf = 0;
    for (i, r) in raw.iter().enumerate() {
        if r.children.is_empty() {
            numbers[i] = next_leaf;
            next_leaf += 1;
        }
    }
    let mut next_internal = next_leaf;
    let mut order = Vec::with_capacity(raw.len());
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        order.push(id);
        stack.extend(raw[id].children.iter().copied());
    }
    for &id in order.iter().rev() {
        if !raw[id].children.is_empty() {
            numbers[id] = next_internal;
            next_internal += 1;
        }
    }
    numbers
}

#[derive(Debug, Default)]
struct RawNode {
    label: Option<String>,
    length: Option<f64>,
    children: Vec<usize>,
    metadata: BTreeMap<String, MetaValue>,
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    nodes: Vec<RawNode>,
}

impl<'a> Parser<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            nodes: Vec::new(),
        }
    }

    fn parse_tree(&mut self) -> Result<usize> {
        let root = self.parse_subtree()?;
        self.skip_whitespace();
        if self.peek() != Some(b';') {
            return Err(CanopyError::Parse(format!(
                "expected ';' at position {}",
                self.pos
            )));
        }
        self.pos += 1;
        Ok(root)
    }

    /// Parse one subtree with an explicit stack of open internal nodes, so
    /// nesting depth is bounded by memory rather than the thread stack.
    fn parse_subtree(&mut self) -> Result<usize> {
        let mut open: Vec<usize> = Vec::new();
        loop {
            self.skip_whitespace();
            let id = self.nodes.len();
            self.nodes.push(RawNode::default());
            if let Some(&parent) = open.last() {
                self.nodes[parent].children.push(id);
            }
            if self.peek() == Some(b'(') {
                self.pos += 1;
                open.push(id);
                continue;
            }
            self.parse_label(id)?;

            // Close finished internal nodes until a sibling follows.
            loop {
                self.skip_whitespace();
                let Some(&parent) = open.last() else {
                    return Ok(0);
                };
                match self.peek() {
                    Some(b',') => {
                        self.pos += 1;
                        break;
                    }
                    Some(b')') => {
                        self.pos += 1;
                        open.pop();
                        self.parse_label(parent)?;
                    }
                    _ => {
                        return Err(CanopyError::Parse(format!(
                            "expected ',' or ')' at position {}",
                            self.pos
                        )))
                    }
                }
            }
        }
    }

    fn parse_label(&mut self, id: usize) -> Result<()> {
        self.skip_whitespace();
        let name = self.parse_name()?;
        if !name.is_empty() {
            self.nodes[id].label = Some(name);
        }
        self.parse_comments(id)?;
        if self.peek() == Some(b':') {
            self.pos += 1;
            self.skip_whitespace();
            let len_str = self.parse_float_str();
            if len_str.is_empty() {
                return Err(CanopyError::Parse("expected number after ':'".into()));
            }
            let len: f64 = len_str
                .parse()
                .map_err(|_| CanopyError::Parse(format!("invalid branch length: '{}'", len_str)))?;
            self.nodes[id].length = Some(len);
            self.parse_comments(id)?;
        }
        Ok(())
    }

    fn parse_name(&mut self) -> Result<String> {
        if self.peek() == Some(b'\'') || self.peek() == Some(b'"') {
            return self.parse_quoted();
        }
        let start = self.pos;
        while let Some(b) = self.peek() {
            match b {
                b':' | b',' | b')' | b'(' | b';' | b'[' => break,
                b' ' | b'\t' | b'\n' | b'\r' => break,
                _ => self.pos += 1,
            }
        }
        Ok(String::from_utf8_lossy(&self.input[start..self.pos]).into_owned())
    }

    fn parse_quoted(&mut self) -> Result<String> {
        let quote = self.input[self.pos];
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            match self.peek() {
                None => return Err(CanopyError::Parse("unterminated quoted label".into())),
                Some(b) if b == quote => {
                    self.pos += 1;
                    // A doubled quote is an escaped quote.
                    if self.peek() == Some(quote) {
                        out.push(quote);
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
                Some(b) => {
                    out.push(b);
                    self.pos += 1;
                }
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Consume any `[...]` blocks; `[&...]` blocks become metadata.
    fn parse_comments(&mut self, id: usize) -> Result<()> {
        loop {
            self.skip_whitespace();
            if self.peek() != Some(b'[') {
                return Ok(());
            }
            let start = self.pos + 1;
            let end = self.input[start..]
                .iter()
                .position(|&b| b == b']')
                .map(|p| start + p)
                .ok_or_else(|| CanopyError::Parse("unterminated '[' comment".into()))?;
            let body = String::from_utf8_lossy(&self.input[start..end]).into_owned();
            self.pos = end + 1;
            if let Some(annotations) = body.strip_prefix('&') {
                for (k, v) in split_annotations(annotations)? {
                    self.nodes[id].metadata.insert(k, v);
                }
            }
        }
    }

    fn parse_float_str(&mut self) -> String {
        let start = self.pos;
        while let Some(b) = self.peek() {
            match b {
                b'0'..=b'9' | b'.' | b'-' | b'+' | b'e' | b'E' => self.pos += 1,
                _ => break,
            }
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while let Some(b' ' | b'\t' | b'\n' | b'\r') = self.peek() {
            self.pos += 1;
        }
    }
}

/// Split `k1=v1,k2={a,b},k3="x"` on top-level commas.
fn split_annotations(body: &str) -> Result<Vec<(String, MetaValue)>> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in body.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&body[start..]);

    let mut out = Vec::new();
    for part in parts.into_iter().filter(|p| !p.trim().is_empty()) {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| CanopyError::Parse(format!("annotation '{}' has no '='", part)))?;
        let value = value.trim().trim_matches('"');
        let value = match value.parse::<f64>() {
            Ok(x) => MetaValue::Number(x),
            Err(_) => MetaValue::Text(value.to_string()),
        };
        out.push((key.trim().to_string(), value));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_default(s: &str) -> Result<Tree> {
        parse("tree", s, &NewickOptions::default())
    }

    #[test]
    fn labelled_newick_uses_labels_as_numbers() {
        let tree = parse_default("((0:1.0,1:1.0)4:1.0,(2:1.0,3:1.0)5:0.5)6:0.0;").unwrap();
        assert_eq!(tree.root(), 6);
        assert_eq!(tree.node(4).left(), Some(0));
        assert_eq!(tree.node(5).right(), Some(3));
        assert!((tree.height(4) - 1.0).abs() < 1e-10);
        assert!((tree.height(5) - 1.5).abs() < 1e-10);
        assert!((tree.height(6) - 2.0).abs() < 1e-10);
        for leaf in 0..4 {
            assert_eq!(tree.height(leaf), 0.0);
        }
    }

    #[test]
    fn taxon_labels_number_leaves_first() {
        let tree = parse_default("((A:1,B:1):1,C:2);").unwrap();
        assert_eq!(tree.leaf_labels(), vec![Some("A"), Some("B"), Some("C")]);
        // Internal nodes in post-order: (A,B) then the root.
        assert_eq!(tree.node(3).left(), Some(0));
        assert_eq!(tree.root(), 4);
        assert!((tree.height(4) - 2.0).abs() < 1e-10);
    }

    #[test]
    fn unadjusted_tips_become_dates() {
        let options = NewickOptions {
            adjust_tip_heights: false,
            ..NewickOptions::default()
        };
        let tree = parse("t", "((A:1,B:0.5):1,C:2);", &options).unwrap();
        assert!(tree.has_tip_dates());
        assert!((tree.height(1) - 0.5).abs() < 1e-10);
        assert_eq!(tree.height(0), 0.0);
    }

    #[test]
    fn label_offset_shifts_numbers() {
        let options = NewickOptions {
            label_offset: 1,
            ..NewickOptions::default()
        };
        let tree = parse("t", "((1:1,2:1)4:1,3:2)5;", &options).unwrap();
        assert_eq!(tree.root(), 4);
        assert_eq!(tree.node(3).left(), Some(0));
    }

    #[test]
    fn metadata_is_parsed() {
        let tree = parse_default("((A[&rate=0.5]:1,B:1)[&pop=2.0,tag=x]:1,C:2);").unwrap();
        assert_eq!(tree.node(0).metadata("rate"), Some(&MetaValue::Number(0.5)));
        assert_eq!(tree.node(3).metadata("pop"), Some(&MetaValue::Number(2.0)));
        assert_eq!(
            tree.node(3).metadata("tag"),
            Some(&MetaValue::Text("x".into()))
        );
    }

    #[test]
    fn plain_comments_are_skipped() {
        let tree = parse_default("((A:1,B:1)[a comment]:1,C:2);").unwrap();
        assert_eq!(tree.node_count(), 5);
        assert!(tree.node(3).metadata_entries().next().is_none());
    }

    #[test]
    fn quoted_labels() {
        let tree = parse_default("(('Homo sapiens':1,'O''Brien':1):1,C:2);").unwrap();
        assert_eq!(tree.node(0).label(), Some("Homo sapiens"));
        assert_eq!(tree.node(1).label(), Some("O'Brien"));
        let out = write(&tree, NewickStyle::Labels);
        assert!(out.contains("'Homo sapiens'"));
        assert!(out.contains("'O''Brien'"));
    }

    #[test]
    fn rejects_non_binary() {
        let err = parse_default("(A:1,B:1,C:1);").unwrap_err();
        assert!(matches!(err, CanopyError::Model { .. }));
    }

    #[test]
    fn rejects_negative_branch() {
        let err = parse_default("((A:1,B:-1):1,C:2);").unwrap_err();
        assert!(matches!(err, CanopyError::Model { .. }));
    }

    #[test]
    fn rejects_duplicate_numbers() {
        assert!(parse_default("((0:1,1:1)3:1,1:2)4;").is_err());
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(
            parse_default("((A,B);"),
            Err(CanopyError::Parse(_))
        ));
        assert!(matches!(parse_default("(A,B)"), Err(CanopyError::Parse(_))));
        assert!(matches!(
            parse_default("(A:abc,B);"),
            Err(CanopyError::Parse(_))
        ));
        assert!(parse_default("(A[&x=1,B);").is_err());
    }

    #[test]
    fn single_leaf() {
        let tree = parse_default("A;").unwrap();
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.root(), 0);
    }

    #[test]
    fn write_numbers_reparses_identically() {
        let input = "((A:0.1,B:0.2):0.3,(C:0.4,D:0.5):0.6);";
        let tree = parse_default(input).unwrap();
        let out = write(&tree, NewickStyle::Numbers);
        let again = parse_default(&out).unwrap();
        assert_eq!(tree.root(), again.root());
        for nr in 0..tree.node_count() {
            assert_eq!(tree.node(nr).parent(), again.node(nr).parent());
            assert!((tree.height(nr) - again.height(nr)).abs() < 1e-9);
        }
    }

    #[test]
    fn write_metadata_style() {
        let tree = parse_default("((A:1,B:1)[&pop=2]:1,C:2);").unwrap();
        let out = write(&tree, NewickStyle::Metadata);
        assert!(out.contains("3[&pop=2]:1"));
    }

    #[test]
    fn deep_caterpillar_parses_and_writes() {
        let mut newick = "(".repeat(3999);
        newick.push_str("t0:1,t1:1");
        for i in 2..4000 {
            newick.push_str(&format!("):1,t{}:{}", i, i));
        }
        newick.push_str(");");
        let handle = std::thread::Builder::new()
            .stack_size(256 * 1024)
            .spawn(move || {
                let tree = parse_default(&newick).unwrap();
                let out = write(&tree, NewickStyle::Labels);
                (tree.leaf_count(), tree.validate().is_ok(), out.len())
            })
            .unwrap();
        let (leaves, valid, len) = handle.join().unwrap();
        assert_eq!(leaves, 4000);
        assert!(valid);
        assert!(len > 4000);
    }

    #[test]
    fn write_labels_style() {
        let tree = parse_default("((A:1,B:1):1,C:2);").unwrap();
        assert_eq!(write(&tree, NewickStyle::Labels), "((A:1,B:1):1,C:2);");
    }
}
