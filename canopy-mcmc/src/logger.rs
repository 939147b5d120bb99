//! Sample output: tab-separated trace files and Nexus tree files.
//!
//! Diagnostics go through `tracing`; this module only writes samples.

use std::io::Write;

use canopy_core::{Named, Result};

use crate::calculation::{CalcGraph, CalcId};
use crate::newick::{self, NewickStyle};
use crate::state::{State, StateNode, StateNodeId};

/// Something that contributes columns (or lines) to a log.
pub trait Loggable: Send {
    /// Write the header.
    fn init(&mut self, out: &mut dyn Write, state: &State, graph: &CalcGraph) -> Result<()>;

    /// Write one sample. `state` is always at a committed point.
    fn log(
        &mut self,
        sample: u64,
        out: &mut dyn Write,
        state: &State,
        graph: &CalcGraph,
    ) -> Result<()>;

    /// Write any trailer.
    fn close(&mut self, _out: &mut dyn Write) -> Result<()> {
        Ok(())
    }
}

/// The cached value of one calculation node, e.g. the posterior.
pub struct PosteriorColumn {
    node: CalcId,
}

impl PosteriorColumn {
    pub fn new(node: CalcId) -> Self {
        Self { node }
    }
}

impl Loggable for PosteriorColumn {
    fn init(&mut self, out: &mut dyn Write, _state: &State, graph: &CalcGraph) -> Result<()> {
        write!(out, "{}\t", graph.name(self.node))?;
        Ok(())
    }

    fn log(&mut self, _: u64, out: &mut dyn Write, _: &State, graph: &CalcGraph) -> Result<()> {
        write!(out, "{}\t", graph.value(self.node))?;
        Ok(())
    }
}

/// One column per dimension of a parameter.
///
/// A scalar is headed by its name, a vector by `name.1`, `name.2`, ...
pub struct ParameterColumns {
    node: StateNodeId,
}

impl ParameterColumns {
    pub fn new(node: StateNodeId) -> Self {
        Self { node }
    }
}

fn parameter_values(node: &StateNode) -> Vec<String> {
    match node {
        StateNode::Real(p) => p.values().iter().map(|v| v.to_string()).collect(),
        StateNode::Integer(p) => p.values().iter().map(|v| v.to_string()).collect(),
        StateNode::Boolean(p) => p
            .values()
            .iter()
            .map(|&v| if v { "1".to_string() } else { "0".to_string() })
            .collect(),
        StateNode::Tree(t) => vec![t.height(t.root()).to_string()],
    }
}

impl Loggable for ParameterColumns {
    fn init(&mut self, out: &mut dyn Write, state: &State, _: &CalcGraph) -> Result<()> {
        let node = state.node(self.node);
        let dimension = parameter_values(node).len();
        if dimension == 1 {
            write!(out, "{}\t", node.name())?;
        } else {
            for i in 1..=dimension {
                write!(out, "{}.{}\t", node.name(), i)?;
            }
        }
        Ok(())
    }

    fn log(&mut self, _: u64, out: &mut dyn Write, state: &State, _: &CalcGraph) -> Result<()> {
        for v in parameter_values(state.node(self.node)) {
            write!(out, "{}\t", v)?;
        }
        Ok(())
    }
}

/// Nexus tree log: one `tree STATE_n = ...;` line per sample.
pub struct TreeLog {
    tree: StateNodeId,
    style: NewickStyle,
}

impl TreeLog {
    pub fn new(tree: StateNodeId) -> Self {
        Self {
            tree,
            style: NewickStyle::Labels,
        }
    }

    /// Write node numbers and metadata, with a translate table for the
    /// leaf labels.
    pub fn with_metadata(mut self) -> Self {
        self.style = NewickStyle::Metadata;
        self
    }
}

impl Loggable for TreeLog {
    fn init(&mut self, out: &mut dyn Write, state: &State, _: &CalcGraph) -> Result<()> {
        writeln!(out, "#NEXUS\n\nBegin trees;")?;
        if self.style != NewickStyle::Labels {
            let tree = state.tree(self.tree)?;
            let labels = tree.leaf_labels();
            if labels.iter().all(Option::is_some) {
                writeln!(out, "\tTranslate")?;
                let last = labels.len().saturating_sub(1);
                for (nr, label) in labels.iter().enumerate() {
                    let sep = if nr == last { "" } else { "," };
                    writeln!(out, "\t\t{} {}{}", nr, label.unwrap_or_default(), sep)?;
                }
                writeln!(out, "\t\t;")?;
            }
        }
        Ok(())
    }

    fn log(&mut self, sample: u64, out: &mut dyn Write, state: &State, _: &CalcGraph) -> Result<()> {
        let tree = state.tree(self.tree)?;
        writeln!(
            out,
            "tree STATE_{} = {}",
            sample,
            newick::write(tree, self.style)
        )?;
        Ok(())
    }

    fn close(&mut self, out: &mut dyn Write) -> Result<()> {
        writeln!(out, "End;")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    /// Tab-separated rows led by the sample number.
    Trace,
    /// Loggables write whole lines themselves.
    Lines,
}

/// A group of loggables written to one sink every `every` samples.
pub struct Logger {
    every: u64,
    layout: Layout,
    items: Vec<Box<dyn Loggable>>,
    out: Box<dyn Write + Send>,
}

impl Logger {
    /// Tab-separated trace log.
    pub fn trace(every: u64, out: Box<dyn Write + Send>, items: Vec<Box<dyn Loggable>>) -> Self {
        Self {
            every: every.max(1),
            layout: Layout::Trace,
            items,
            out,
        }
    }

    /// Nexus tree log.
    pub fn trees(every: u64, out: Box<dyn Write + Send>, tree: TreeLog) -> Self {
        Self {
            every: every.max(1),
            layout: Layout::Lines,
            items: vec![Box::new(tree)],
            out,
        }
    }

    pub fn every(&self) -> u64 {
        self.every
    }

    pub fn init(&mut self, state: &State, graph: &CalcGraph) -> Result<()> {
        if self.layout == Layout::Trace {
            write!(self.out, "Sample\t")?;
        }
        for item in &mut self.items {
            item.init(self.out.as_mut(), state, graph)?;
        }
        if self.layout == Layout::Trace {
            writeln!(self.out)?;
        }
        Ok(())
    }

    /// Write a row if `sample` falls on the log interval.
    pub fn log(&mut self, sample: u64, state: &State, graph: &CalcGraph) -> Result<()> {
        if sample % self.every != 0 {
            return Ok(());
        }
        if self.layout == Layout::Trace {
            write!(self.out, "{}\t", sample)?;
        }
        for item in &mut self.items {
            item.log(sample, self.out.as_mut(), state, graph)?;
        }
        if self.layout == Layout::Trace {
            writeln!(self.out)?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        for item in &mut self.items {
            item.close(self.out.as_mut())?;
        }
        self.out.flush()?;
        Ok(())
    }
}
