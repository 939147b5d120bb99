//! Lazily recomputed dataflow graph over the state.
//!
//! Calculation nodes cache a scalar (usually a log-density) and are only
//! re-evaluated when something upstream changed. Per proposal the driver
//! calls, in order:
//!
//! 1. [`CalcGraph::store_calculation_nodes`] to save the cached values of
//!    every node reachable from the changed state nodes,
//! 2. [`CalcGraph::check_dirtiness`] to tag those nodes,
//! 3. [`CalcGraph::calculate`] to re-evaluate the non-clean ones,
//! 4. [`CalcGraph::accept`] or [`CalcGraph::restore`].
//!
//! Node ids are handed out in insertion order and a node may only consume
//! nodes added before it, so id order is a topological order and cycles
//! cannot be built.

use std::collections::HashMap;
use std::sync::Arc;

use canopy_core::{CanopyError, Named, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::parameter::{BooleanParameter, IntegerParameter, RealParameter};
use crate::state::{State, StateNode, StateNodeId};
use crate::tree::Tree;

/// Recalculation level of a node, ordered `Clean < Dirty < Filthy`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum Dirty {
    /// Cached value is valid.
    #[default]
    Clean,
    /// A scalar input changed; partial recomputation suffices.
    Dirty,
    /// A structural input changed; substructure caches are invalid.
    Filthy,
}

/// Handle to a node of a [`CalcGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CalcId(usize);

impl CalcId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A producer feeding a calculation node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Input {
    State(StateNodeId),
    Calc(CalcId),
}

/// Read-only view handed to a node while it is checked or evaluated.
pub struct EvalContext<'a> {
    state: &'a State,
    inputs: &'a [Input],
    values: &'a [f64],
    dirty: &'a [Dirty],
    owner: &'a str,
}

impl<'a> EvalContext<'a> {
    pub fn state(&self) -> &'a State {
        self.state
    }

    pub fn inputs(&self) -> &'a [Input] {
        self.inputs
    }

    /// Dirtiness of the `k`-th input.
    pub fn input_dirtiness(&self, k: usize) -> Dirty {
        match self.inputs.get(k) {
            Some(Input::State(id)) => self.state.node(*id).dirtiness(),
            Some(Input::Calc(id)) => self.dirty[id.0],
            None => Dirty::Clean,
        }
    }

    /// Highest dirtiness over all inputs.
    pub fn inputs_dirtiness(&self) -> Dirty {
        (0..self.inputs.len())
            .map(|k| self.input_dirtiness(k))
            .max()
            .unwrap_or(Dirty::Clean)
    }

    /// Cached value of the `k`-th input, which must be a calculation node.
    pub fn value(&self, k: usize) -> Result<f64> {
        match self.inputs.get(k) {
            Some(Input::Calc(id)) => Ok(self.values[id.0]),
            _ => Err(self.bad_input(k, "calculation node")),
        }
    }

    /// Cached values of every calculation-node input, in input order.
    pub fn calc_values(&self) -> impl Iterator<Item = f64> + '_ {
        self.inputs.iter().filter_map(|input| match input {
            Input::Calc(id) => Some(self.values[id.0]),
            Input::State(_) => None,
        })
    }

    pub fn real(&self, k: usize) -> Result<&'a RealParameter> {
        match self.state_input(k) {
            Some(StateNode::Real(p)) => Ok(p),
            _ => Err(self.bad_input(k, "real parameter")),
        }
    }

    pub fn integer(&self, k: usize) -> Result<&'a IntegerParameter> {
        match self.state_input(k) {
            Some(StateNode::Integer(p)) => Ok(p),
            _ => Err(self.bad_input(k, "integer parameter")),
        }
    }

    pub fn boolean(&self, k: usize) -> Result<&'a BooleanParameter> {
        match self.state_input(k) {
            Some(StateNode::Boolean(p)) => Ok(p),
            _ => Err(self.bad_input(k, "boolean parameter")),
        }
    }

    pub fn tree(&self, k: usize) -> Result<&'a Tree> {
        match self.state_input(k) {
            Some(StateNode::Tree(t)) => Ok(t),
            _ => Err(self.bad_input(k, "tree")),
        }
    }

    fn state_input(&self, k: usize) -> Option<&'a StateNode> {
        match self.inputs.get(k) {
            Some(Input::State(id)) => Some(self.state.node(*id)),
            _ => None,
        }
    }

    fn bad_input(&self, k: usize, wanted: &str) -> CanopyError {
        CanopyError::model(self.owner, format!("input {} is not a {}", k, wanted))
    }
}

/// A cached derived quantity.
///
/// The graph owns the cached scalar and its stored copy; implementations
/// only compute. Nodes that keep further caches (interval lists, partial
/// likelihoods) hook into `store`/`restore`/`accept`.
pub trait CalculationNode: Send {
    /// Decide how much recomputation the current proposal needs.
    ///
    /// Called once per proposal, after every input has been checked.
    fn requires_recalculation(&mut self, ctx: &EvalContext<'_>) -> Dirty {
        ctx.inputs_dirtiness()
    }

    /// Compute the value from the inputs.
    ///
    /// A [`CanopyError::Numeric`] error is absorbed by the graph as −∞;
    /// any other error aborts the chain.
    fn calculate(&mut self, ctx: &EvalContext<'_>) -> Result<f64>;

    fn store(&mut self) {}

    fn restore(&mut self) {}

    fn accept(&mut self) {}
}

struct Entry {
    name: String,
    node: Box<dyn CalculationNode>,
    inputs: Vec<Input>,
    outputs: Vec<CalcId>,
}

/// Collects calculation nodes before the graph is sealed.
#[derive(Default)]
pub struct CalcGraphBuilder {
    entries: Vec<Entry>,
    names: HashMap<String, CalcId>,
}

impl CalcGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node consuming `inputs`.
    ///
    /// # Errors
    ///
    /// Returns a model error for a duplicate name or an input referring to
    /// a calculation node that has not been added yet.
    pub fn add(
        &mut self,
        name: impl Into<String>,
        node: impl CalculationNode + 'static,
        inputs: Vec<Input>,
    ) -> Result<CalcId> {
        let name = name.into();
        if self.names.contains_key(&name) {
            return Err(CanopyError::model(&name, "calculation node name used twice"));
        }
        let id = CalcId(self.entries.len());
        for input in &inputs {
            if let Input::Calc(c) = input {
                if c.0 >= id.0 {
                    return Err(CanopyError::model(
                        &name,
                        format!("input refers to calculation node {} which is not defined yet", c.0),
                    ));
                }
            }
        }
        for input in &inputs {
            if let Input::Calc(c) = input {
                self.entries[c.0].outputs.push(id);
            }
        }
        self.entries.push(Entry {
            name: name.clone(),
            node: Box::new(node),
            inputs,
            outputs: Vec::new(),
        });
        self.names.insert(name, id);
        Ok(id)
    }

    /// Seal the graph against `state`.
    ///
    /// # Errors
    ///
    /// Returns a model error if an input names a state node that does not
    /// exist. State nodes nothing depends on only produce a warning.
    pub fn build(self, state: &State) -> Result<CalcGraph> {
        let mut state_outputs = vec![Vec::new(); state.len()];
        for (i, entry) in self.entries.iter().enumerate() {
            for input in &entry.inputs {
                if let Input::State(s) = input {
                    if !state.contains(*s) {
                        return Err(CanopyError::model(
                            &entry.name,
                            format!("input refers to unknown state node {}", s.index()),
                        ));
                    }
                    state_outputs[s.index()].push(CalcId(i));
                }
            }
        }
        for id in state.ids() {
            if state_outputs[id.index()].is_empty() {
                warn!(
                    node = state.node(id).name(),
                    "state node has no calculation node depending on it"
                );
            }
        }
        let n = self.entries.len();
        Ok(CalcGraph {
            entries: self.entries,
            names: self.names,
            values: vec![0.0; n],
            stored_values: vec![0.0; n],
            dirty: vec![Dirty::Filthy; n],
            state_outputs,
            affected_cache: HashMap::new(),
            current: Arc::from(Vec::new()),
        })
    }
}

/// The sealed calculation graph with its value caches.
pub struct CalcGraph {
    entries: Vec<Entry>,
    names: HashMap<String, CalcId>,
    values: Vec<f64>,
    stored_values: Vec<f64>,
    dirty: Vec<Dirty>,
    state_outputs: Vec<Vec<CalcId>>,
    affected_cache: HashMap<Vec<StateNodeId>, Arc<[CalcId]>>,
    current: Arc<[CalcId]>,
}

impl CalcGraph {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<CalcId> {
        self.names.get(name).copied()
    }

    pub fn name(&self, id: CalcId) -> &str {
        &self.entries[id.0].name
    }

    pub fn inputs(&self, id: CalcId) -> &[Input] {
        &self.entries[id.0].inputs
    }

    /// Cached value. Valid once the node has been calculated.
    pub fn value(&self, id: CalcId) -> f64 {
        self.values[id.0]
    }

    pub fn dirtiness(&self, id: CalcId) -> Dirty {
        self.dirty[id.0]
    }

    pub fn is_dirty(&self, id: CalcId) -> bool {
        self.dirty[id.0] != Dirty::Clean
    }

    /// Calculation nodes reachable from `changed`, in topological order.
    ///
    /// Cached per set of changed nodes, whatever order they were edited in.
    pub fn affected(&mut self, changed: &[StateNodeId]) -> Arc<[CalcId]> {
        let mut key = changed.to_vec();
        key.sort_unstable();
        key.dedup();
        if let Some(list) = self.affected_cache.get(&key) {
            return Arc::clone(list);
        }
        let mut seen = vec![false; self.entries.len()];
        let mut stack: Vec<CalcId> = key
            .iter()
            .flat_map(|s| self.state_outputs[s.index()].iter().copied())
            .collect();
        while let Some(id) = stack.pop() {
            if seen[id.0] {
                continue;
            }
            seen[id.0] = true;
            stack.extend(self.entries[id.0].outputs.iter().copied());
        }
        let list: Arc<[CalcId]> = seen
            .iter()
            .enumerate()
            .filter(|(_, &s)| s)
            .map(|(i, _)| CalcId(i))
            .collect();
        self.affected_cache.insert(key, Arc::clone(&list));
        list
    }

    /// Save the cached values of every node the current proposal may
    /// change.
    pub fn store_calculation_nodes(&mut self, state: &State) {
        self.current = self.affected(state.changed());
        for &id in self.current.iter() {
            self.stored_values[id.0] = self.values[id.0];
            self.entries[id.0].node.store();
        }
    }

    /// Ask every affected node how much recomputation it needs.
    pub fn check_dirtiness(&mut self, state: &State) {
        let current = Arc::clone(&self.current);
        for &id in current.iter() {
            let entry = &mut self.entries[id.0];
            let ctx = EvalContext {
                state,
                inputs: &entry.inputs,
                values: &self.values,
                dirty: &self.dirty,
                owner: &entry.name,
            };
            let level = entry.node.requires_recalculation(&ctx);
            self.dirty[id.0] = level;
        }
    }

    /// Re-evaluate the non-clean affected nodes and return `target`.
    ///
    /// # Errors
    ///
    /// Propagates any non-recoverable error from a node.
    pub fn calculate(&mut self, state: &State, target: CalcId) -> Result<f64> {
        let current = Arc::clone(&self.current);
        for &id in current.iter() {
            if self.dirty[id.0] == Dirty::Clean {
                continue;
            }
            let entry = &mut self.entries[id.0];
            let ctx = EvalContext {
                state,
                inputs: &entry.inputs,
                values: &self.values,
                dirty: &self.dirty,
                owner: &entry.name,
            };
            let value = match entry.node.calculate(&ctx) {
                Ok(v) => v,
                Err(e) if e.is_recoverable() => {
                    debug!(node = %entry.name, error = %e, "density evaluation failed; using -inf");
                    f64::NEG_INFINITY
                }
                Err(e) => return Err(e),
            };
            self.values[id.0] = value;
        }
        Ok(self.values[target.0])
    }

    /// Keep the new values; every affected node becomes clean.
    pub fn accept(&mut self) {
        for &id in self.current.iter() {
            self.entries[id.0].node.accept();
            self.dirty[id.0] = Dirty::Clean;
        }
        self.current = Arc::from(Vec::new());
    }

    /// Swap the stored values back in without recomputation.
    pub fn restore(&mut self) {
        for &id in self.current.iter() {
            self.values[id.0] = self.stored_values[id.0];
            self.entries[id.0].node.restore();
            self.dirty[id.0] = Dirty::Clean;
        }
        self.current = Arc::from(Vec::new());
    }

    /// Recompute every node from scratch and commit the result.
    ///
    /// Nodes without any state input are evaluated too, and no node may
    /// declare itself clean. Used at chain start and to cross-check the
    /// incremental value. `state` must be at a committed point.
    pub fn recalculate_all(&mut self, state: &mut State, target: CalcId) -> Result<f64> {
        state.set_everything_dirty(true);
        self.current = (0..self.entries.len()).map(CalcId).collect();
        for &id in self.current.iter() {
            self.stored_values[id.0] = self.values[id.0];
            self.entries[id.0].node.store();
        }
        self.check_dirtiness(state);
        self.dirty.fill(Dirty::Filthy);
        let result = self.calculate(state, target);
        state.set_everything_dirty(false);
        state.store();
        self.accept();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sum of the real-parameter and calc inputs, counting evaluations.
    struct Sum {
        evaluations: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl Sum {
        fn new() -> (Self, Arc<std::sync::atomic::AtomicUsize>) {
            let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
            (
                Self {
                    evaluations: Arc::clone(&counter),
                },
                counter,
            )
        }
    }

    impl CalculationNode for Sum {
        fn calculate(&mut self, ctx: &EvalContext<'_>) -> Result<f64> {
            self.evaluations
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let mut total = 0.0;
            for (k, input) in ctx.inputs().iter().enumerate() {
                total += match input {
                    Input::State(_) => ctx.real(k)?.values().iter().sum::<f64>(),
                    Input::Calc(_) => ctx.value(k)?,
                };
            }
            Ok(total)
        }
    }

    struct Failing;

    impl CalculationNode for Failing {
        fn calculate(&mut self, _ctx: &EvalContext<'_>) -> Result<f64> {
            Err(CanopyError::Numeric("quantile out of range".into()))
        }
    }

    struct Broken;

    impl CalculationNode for Broken {
        fn calculate(&mut self, _ctx: &EvalContext<'_>) -> Result<f64> {
            Err(CanopyError::invariant("broken", "bad cache"))
        }
    }

    struct Fixture {
        state: State,
        x: StateNodeId,
        a: CalcId,
        b: CalcId,
        c: CalcId,
        graph: CalcGraph,
        a_evals: Arc<std::sync::atomic::AtomicUsize>,
        c_evals: Arc<std::sync::atomic::AtomicUsize>,
    }

    // x -> A -> B, y -> C
    fn fixture() -> Fixture {
        let mut state = State::new();
        let x = state
            .add_real(RealParameter::new("x", vec![1.0]).unwrap())
            .unwrap();
        let y = state
            .add_real(RealParameter::new("y", vec![10.0]).unwrap())
            .unwrap();
        let mut builder = CalcGraphBuilder::new();
        let (sa, a_evals) = Sum::new();
        let a = builder.add("A", sa, vec![Input::State(x)]).unwrap();
        let (sb, _) = Sum::new();
        let b = builder.add("B", sb, vec![Input::Calc(a)]).unwrap();
        let (sc, c_evals) = Sum::new();
        let c = builder.add("C", sc, vec![Input::State(y)]).unwrap();
        let mut graph = builder.build(&state).unwrap();
        graph.recalculate_all(&mut state, b).unwrap();
        Fixture {
            state,
            x,
            a,
            b,
            c,
            graph,
            a_evals,
            c_evals,
        }
    }

    #[test]
    fn initial_values() {
        let f = fixture();
        assert!((f.graph.value(f.a) - 1.0).abs() < 1e-12);
        assert!((f.graph.value(f.b) - 1.0).abs() < 1e-12);
        assert!((f.graph.value(f.c) - 10.0).abs() < 1e-12);
        assert!(!f.graph.is_dirty(f.c));
    }

    #[test]
    fn dirty_propagates_downstream_only() {
        let mut f = fixture();
        f.state.edit_real(f.x).unwrap().set_value(0, 2.0).unwrap();
        f.graph.store_calculation_nodes(&f.state);
        f.graph.check_dirtiness(&f.state);
        assert!(f.graph.is_dirty(f.a));
        assert!(f.graph.is_dirty(f.b));
        assert!(!f.graph.is_dirty(f.c));
        assert!((f.graph.value(f.c) - 10.0).abs() < 1e-12);

        let c_before = f.c_evals.load(std::sync::atomic::Ordering::SeqCst);
        let v = f.graph.calculate(&f.state, f.b).unwrap();
        assert!((v - 2.0).abs() < 1e-12);
        assert_eq!(f.c_evals.load(std::sync::atomic::Ordering::SeqCst), c_before);
    }

    #[test]
    fn restore_swaps_cached_values_back() {
        let mut f = fixture();
        f.state.edit_real(f.x).unwrap().set_value(0, 5.0).unwrap();
        f.graph.store_calculation_nodes(&f.state);
        f.graph.check_dirtiness(&f.state);
        f.graph.calculate(&f.state, f.b).unwrap();
        let evals = f.a_evals.load(std::sync::atomic::Ordering::SeqCst);

        f.graph.restore();
        f.state.restore();
        assert!((f.graph.value(f.b) - 1.0).abs() < 1e-12);
        assert!(!f.graph.is_dirty(f.a));
        assert_eq!(f.a_evals.load(std::sync::atomic::Ordering::SeqCst), evals);
    }

    #[test]
    fn accept_keeps_new_values() {
        let mut f = fixture();
        f.state.edit_real(f.x).unwrap().set_value(0, 4.0).unwrap();
        f.graph.store_calculation_nodes(&f.state);
        f.graph.check_dirtiness(&f.state);
        f.graph.calculate(&f.state, f.b).unwrap();
        f.graph.accept();
        f.state.store();
        assert!((f.graph.value(f.b) - 4.0).abs() < 1e-12);
        assert!(!f.graph.is_dirty(f.b));
    }

    #[test]
    fn affected_lists_are_cached_and_ordered() {
        let mut f = fixture();
        let first = f.graph.affected(&[f.x]);
        assert_eq!(&*first, &[f.a, f.b]);
        let second = f.graph.affected(&[f.x]);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn affected_cache_ignores_edit_order() {
        let mut f = fixture();
        let y = f.state.find("y").unwrap();
        let forward = f.graph.affected(&[f.x, y]);
        let backward = f.graph.affected(&[y, f.x]);
        assert!(Arc::ptr_eq(&forward, &backward));
        assert_eq!(&*forward, &[f.a, f.b, f.c]);
    }

    /// A fixed term with no state input.
    struct Constant(f64);

    impl CalculationNode for Constant {
        fn calculate(&mut self, _ctx: &EvalContext<'_>) -> Result<f64> {
            Ok(self.0)
        }
    }

    /// Reports clean no matter what changed.
    struct NeverDirty;

    impl CalculationNode for NeverDirty {
        fn requires_recalculation(&mut self, _ctx: &EvalContext<'_>) -> Dirty {
            Dirty::Clean
        }

        fn calculate(&mut self, ctx: &EvalContext<'_>) -> Result<f64> {
            Ok(ctx.real(0)?.value(0))
        }
    }

    #[test]
    fn full_recalculation_covers_state_free_terms() {
        let mut state = State::new();
        let x = state
            .add_real(RealParameter::new("x", vec![2.0]).unwrap())
            .unwrap();
        let mut builder = CalcGraphBuilder::new();
        let fixed = builder.add("fixedTerm", Constant(-5.0), vec![]).unwrap();
        let (sa, _) = Sum::new();
        let a = builder.add("A", sa, vec![Input::State(x)]).unwrap();
        let (st, _) = Sum::new();
        let total = builder
            .add("total", st, vec![Input::Calc(fixed), Input::Calc(a)])
            .unwrap();
        let mut graph = builder.build(&state).unwrap();
        let v = graph.recalculate_all(&mut state, total).unwrap();
        assert!((graph.value(fixed) + 5.0).abs() < 1e-12);
        assert!((v + 3.0).abs() < 1e-12);

        // An incremental step keeps the fixed term.
        state.edit_real(x).unwrap().set_value(0, 4.0).unwrap();
        graph.store_calculation_nodes(&state);
        graph.check_dirtiness(&state);
        let v = graph.calculate(&state, total).unwrap();
        assert!((v + 1.0).abs() < 1e-12);
    }

    #[test]
    fn full_recalculation_overrides_clean_claims() {
        let mut state = State::new();
        let x = state
            .add_real(RealParameter::new("x", vec![1.0]).unwrap())
            .unwrap();
        let mut builder = CalcGraphBuilder::new();
        let a = builder.add("stale", NeverDirty, vec![Input::State(x)]).unwrap();
        let mut graph = builder.build(&state).unwrap();
        assert!((graph.recalculate_all(&mut state, a).unwrap() - 1.0).abs() < 1e-12);

        state.edit_real(x).unwrap().set_value(0, 3.0).unwrap();
        graph.store_calculation_nodes(&state);
        graph.check_dirtiness(&state);
        assert!((graph.calculate(&state, a).unwrap() - 1.0).abs() < 1e-12);
        graph.accept();
        state.store();
        assert!((graph.recalculate_all(&mut state, a).unwrap() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn forward_references_are_rejected() {
        let mut builder = CalcGraphBuilder::new();
        let (s, _) = Sum::new();
        let err = builder
            .add("A", s, vec![Input::Calc(CalcId(0))])
            .unwrap_err();
        assert!(matches!(err, CanopyError::Model { .. }));
    }

    #[test]
    fn unknown_state_input_is_rejected() {
        let mut other = State::new();
        other
            .add_real(RealParameter::new("a", vec![1.0]).unwrap())
            .unwrap();
        let other_id = other
            .add_real(RealParameter::new("b", vec![1.0]).unwrap())
            .unwrap();
        let state = State::new();
        let mut builder = CalcGraphBuilder::new();
        let (s, _) = Sum::new();
        builder.add("A", s, vec![Input::State(other_id)]).unwrap();
        assert!(builder.build(&state).is_err());
    }

    #[test]
    fn numeric_failure_becomes_neg_infinity() {
        let mut state = State::new();
        let x = state
            .add_real(RealParameter::new("x", vec![1.0]).unwrap())
            .unwrap();
        let mut builder = CalcGraphBuilder::new();
        let a = builder.add("prior", Failing, vec![Input::State(x)]).unwrap();
        let mut graph = builder.build(&state).unwrap();
        let v = graph.recalculate_all(&mut state, a).unwrap();
        assert_eq!(v, f64::NEG_INFINITY);
    }

    #[test]
    fn other_failures_propagate() {
        let mut state = State::new();
        let x = state
            .add_real(RealParameter::new("x", vec![1.0]).unwrap())
            .unwrap();
        let mut builder = CalcGraphBuilder::new();
        let a = builder.add("broken", Broken, vec![Input::State(x)]).unwrap();
        let mut graph = builder.build(&state).unwrap();
        assert!(graph.recalculate_all(&mut state, a).is_err());
        assert!(state.changed().is_empty());
    }
}
