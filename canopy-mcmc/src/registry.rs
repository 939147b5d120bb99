//! Builds operators from declarative descriptions.
//!
//! An [`OperatorSpec`] names its operator kind and refers to state nodes
//! by name. The [`OperatorRegistry`] maps each kind to its slot table and
//! a factory; the built-in kinds are registered by
//! [`OperatorRegistry::new`] and further kinds can be added per run.

use std::collections::BTreeMap;

use canopy_core::{CanopyError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::inputs::{check_slots, Slot};
use crate::operator::{
    Exchange, IntRandomWalk, KernelDistribution, Operator, ParameterScaleMode, RealRandomWalk,
    ScaleOperator, ScaleTarget, SubtreeSlide, UniformHeight, UpDown,
};
use crate::schedule::{OperatorSchedule, ScheduleConfig};
use crate::state::{State, StateNodeId};

/// One operator as written in a model description.
///
/// Only `id` and `kind` are always needed; which of the other fields a
/// kind accepts is given by its slot table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OperatorSpec {
    pub id: String,
    pub kind: String,
    pub weight: f64,
    pub parameter: Option<String>,
    pub tree: Option<String>,
    pub up: Vec<String>,
    pub down: Vec<String>,
    pub indicator: Option<String>,
    pub scale_factor: Option<f64>,
    pub window: Option<f64>,
    pub size: Option<f64>,
    pub kernel: Option<KernelDistribution>,
    pub optimise: Option<bool>,
    pub root_only: Option<bool>,
    pub scale_all: Option<bool>,
    pub scale_all_independently: Option<bool>,
    pub degrees_of_freedom: Option<usize>,
    pub gaussian: Option<bool>,
}

impl Default for OperatorSpec {
    fn default() -> Self {
        Self {
            id: String::new(),
            kind: String::new(),
            weight: 1.0,
            parameter: None,
            tree: None,
            up: Vec::new(),
            down: Vec::new(),
            indicator: None,
            scale_factor: None,
            window: None,
            size: None,
            kernel: None,
            optimise: None,
            root_only: None,
            scale_all: None,
            scale_all_independently: None,
            degrees_of_freedom: None,
            gaussian: None,
        }
    }
}

impl OperatorSpec {
    /// Names of the optional fields that are set.
    pub fn filled(&self) -> Vec<&'static str> {
        let flags = [
            ("parameter", self.parameter.is_some()),
            ("tree", self.tree.is_some()),
            ("up", !self.up.is_empty()),
            ("down", !self.down.is_empty()),
            ("indicator", self.indicator.is_some()),
            ("scale_factor", self.scale_factor.is_some()),
            ("window", self.window.is_some()),
            ("size", self.size.is_some()),
            ("kernel", self.kernel.is_some()),
            ("optimise", self.optimise.is_some()),
            ("root_only", self.root_only.is_some()),
            ("scale_all", self.scale_all.is_some()),
            ("scale_all_independently", self.scale_all_independently.is_some()),
            ("degrees_of_freedom", self.degrees_of_freedom.is_some()),
            ("gaussian", self.gaussian.is_some()),
        ];
        flags
            .iter()
            .filter(|(_, set)| *set)
            .map(|(name, _)| *name)
            .collect()
    }

    fn node(&self, state: &State, name: &Option<String>) -> Result<StateNodeId> {
        let name = name.as_deref().ok_or_else(|| {
            CanopyError::model(&self.id, "missing state node reference")
        })?;
        state.require(name, &self.id)
    }

    fn nodes(&self, state: &State, names: &[String]) -> Result<Vec<StateNodeId>> {
        names.iter().map(|n| state.require(n, &self.id)).collect()
    }
}

/// Builds a boxed operator from a validated spec.
pub type OperatorFactory = fn(&OperatorSpec, &State) -> Result<Box<dyn Operator>>;

struct Registration {
    slots: &'static [Slot],
    build: OperatorFactory,
}

/// Operator kinds known to one run.
pub struct OperatorRegistry {
    kinds: BTreeMap<String, Registration>,
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

const SCALE_SLOTS: &[Slot] = &[
    Slot::xor("parameter", "tree", "real parameter to scale"),
    Slot::xor("tree", "parameter", "tree whose heights are scaled"),
    Slot::optional("scale_factor", "initial scale factor"),
    Slot::optional("kernel", "kernel distribution"),
    Slot::optional("optimise", "tune the scale factor"),
    Slot::optional("root_only", "scale only the root height"),
    Slot::optional("scale_all", "scale every entry by one factor"),
    Slot::optional("scale_all_independently", "scale every entry by its own factor"),
    Slot::optional("degrees_of_freedom", "dimension used in the Hastings ratio"),
    Slot::optional("indicator", "boolean parameter selecting entries"),
];

const RANDOM_WALK_SLOTS: &[Slot] = &[
    Slot::required("parameter", "parameter to move"),
    Slot::optional("window", "window size"),
    Slot::optional("kernel", "kernel distribution"),
    Slot::optional("optimise", "tune the window"),
];

const INT_RANDOM_WALK_SLOTS: &[Slot] = &[
    Slot::required("parameter", "integer parameter to move"),
    Slot::optional("window", "whole-number window size"),
];

const SUBTREE_SLIDE_SLOTS: &[Slot] = &[
    Slot::required("tree", "tree to operate on"),
    Slot::optional("size", "slide size"),
    Slot::optional("gaussian", "draw the slide from a normal rather than a uniform"),
    Slot::optional("optimise", "tune the slide size"),
];

const TREE_SLOTS: &[Slot] = &[Slot::required("tree", "tree to operate on")];

const UP_DOWN_SLOTS: &[Slot] = &[
    Slot::optional("up", "nodes scaled up"),
    Slot::optional("down", "nodes scaled down"),
    Slot::optional("scale_factor", "initial scale factor"),
    Slot::optional("kernel", "kernel distribution"),
    Slot::optional("optimise", "tune the scale factor"),
];

impl OperatorRegistry {
    /// A registry with no kinds.
    pub fn empty() -> Self {
        Self {
            kinds: BTreeMap::new(),
        }
    }

    /// A registry with every built-in operator kind.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        let builtin: [(&str, &'static [Slot], OperatorFactory); 8] = [
            ("scale", SCALE_SLOTS, build_scale),
            ("random_walk", RANDOM_WALK_SLOTS, build_random_walk),
            ("int_random_walk", INT_RANDOM_WALK_SLOTS, build_int_random_walk),
            ("subtree_slide", SUBTREE_SLIDE_SLOTS, build_subtree_slide),
            ("narrow_exchange", TREE_SLOTS, build_narrow_exchange),
            ("wide_exchange", TREE_SLOTS, build_wide_exchange),
            ("uniform", TREE_SLOTS, build_uniform),
            ("up_down", UP_DOWN_SLOTS, build_up_down),
        ];
        for (kind, slots, build) in builtin {
            registry
                .kinds
                .insert(kind.to_string(), Registration { slots, build });
        }
        registry
    }

    /// Add an operator kind.
    ///
    /// # Errors
    ///
    /// Returns a model error if the kind is already registered.
    pub fn register(
        &mut self,
        kind: impl Into<String>,
        slots: &'static [Slot],
        build: OperatorFactory,
    ) -> Result<()> {
        let kind = kind.into();
        if self.kinds.contains_key(&kind) {
            return Err(CanopyError::model(&kind, "operator kind registered twice"));
        }
        self.kinds.insert(kind, Registration { slots, build });
        Ok(())
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }

    /// Validate `spec` against its kind's slots and build the operator.
    ///
    /// # Errors
    ///
    /// Returns a model error for an unknown kind, a slot violation or a
    /// reference to a state node that does not exist, and whatever the
    /// operator's own constructor rejects.
    pub fn build(&self, spec: &OperatorSpec, state: &State) -> Result<Box<dyn Operator>> {
        if spec.id.is_empty() {
            return Err(CanopyError::model(&spec.kind, "operator without an id"));
        }
        let registration = self.kinds.get(&spec.kind).ok_or_else(|| {
            let known: Vec<&str> = self.kinds().collect();
            CanopyError::model(
                &spec.id,
                format!("unknown operator kind '{}'; known kinds: {}", spec.kind, known.join(", ")),
            )
        })?;
        check_slots(&spec.id, registration.slots, &spec.filled())?;
        let op = (registration.build)(spec, state)?;
        debug!(operator = %spec.id, kind = %spec.kind, weight = spec.weight, "operator built");
        Ok(op)
    }

    /// Build every spec and collect them in a schedule.
    ///
    /// # Errors
    ///
    /// Fails on the first spec that does not build, on a bad weight and on
    /// a repeated id.
    pub fn build_schedule(
        &self,
        specs: &[OperatorSpec],
        state: &State,
        config: ScheduleConfig,
    ) -> Result<OperatorSchedule> {
        let mut schedule = OperatorSchedule::new(config);
        for spec in specs {
            schedule.add(self.build(spec, state)?, spec.weight)?;
        }
        Ok(schedule)
    }
}

fn flag(value: Option<bool>) -> bool {
    value.unwrap_or(false)
}

fn build_scale(spec: &OperatorSpec, state: &State) -> Result<Box<dyn Operator>> {
    let target = if spec.tree.is_some() {
        for name in ["scale_all", "scale_all_independently", "degrees_of_freedom", "indicator"] {
            if spec.filled().contains(&name) {
                return Err(CanopyError::model(
                    &spec.id,
                    format!("'{}' applies to parameters, not trees", name),
                ));
            }
        }
        ScaleTarget::Tree {
            id: spec.node(state, &spec.tree)?,
            root_only: flag(spec.root_only),
        }
    } else {
        if spec.root_only.is_some() {
            return Err(CanopyError::model(&spec.id, "'root_only' applies to trees"));
        }
        let mode = match (flag(spec.scale_all), flag(spec.scale_all_independently)) {
            (false, false) if spec.degrees_of_freedom.is_some() => {
                return Err(CanopyError::model(
                    &spec.id,
                    "'degrees_of_freedom' needs 'scale_all'",
                ));
            }
            (false, false) => ParameterScaleMode::One,
            (true, false) => ParameterScaleMode::All {
                degrees_of_freedom: spec.degrees_of_freedom,
            },
            (false, true) => ParameterScaleMode::AllIndependently,
            (true, true) => {
                return Err(CanopyError::model(
                    &spec.id,
                    "'scale_all' and 'scale_all_independently' are exclusive",
                ));
            }
        };
        ScaleTarget::Parameter {
            id: spec.node(state, &spec.parameter)?,
            mode,
        }
    };
    let mut op = ScaleOperator::new(&spec.id, target);
    if let Some(sf) = spec.scale_factor {
        op = op.with_scale_factor(sf)?;
    }
    if let Some(kernel) = spec.kernel {
        op = op.with_kernel(kernel)?;
    }
    if let Some(optimise) = spec.optimise {
        op = op.with_optimise(optimise);
    }
    if spec.indicator.is_some() {
        op = op.with_indicator(spec.node(state, &spec.indicator)?);
    }
    Ok(Box::new(op))
}

fn build_random_walk(spec: &OperatorSpec, state: &State) -> Result<Box<dyn Operator>> {
    let id = spec.node(state, &spec.parameter)?;
    let mut op = RealRandomWalk::new(&spec.id, id, spec.window.unwrap_or(1.0))?;
    if let Some(kernel) = spec.kernel {
        op = op.with_kernel(kernel)?;
    }
    if let Some(optimise) = spec.optimise {
        op = op.with_optimise(optimise);
    }
    Ok(Box::new(op))
}

fn build_int_random_walk(spec: &OperatorSpec, state: &State) -> Result<Box<dyn Operator>> {
    let id = spec.node(state, &spec.parameter)?;
    let window = spec.window.unwrap_or(1.0);
    if window.fract() != 0.0 || !window.is_finite() {
        return Err(CanopyError::InvalidInput(format!(
            "{}: window must be a whole number, got {}",
            spec.id, window
        )));
    }
    Ok(Box::new(IntRandomWalk::new(&spec.id, id, window as i64)?))
}

fn build_subtree_slide(spec: &OperatorSpec, state: &State) -> Result<Box<dyn Operator>> {
    let mut op = SubtreeSlide::new(&spec.id, spec.node(state, &spec.tree)?);
    if let Some(size) = spec.size {
        op = op.with_size(size)?;
    }
    if spec.gaussian == Some(false) {
        op = op.with_uniform_step();
    }
    if let Some(optimise) = spec.optimise {
        op = op.with_optimise(optimise);
    }
    Ok(Box::new(op))
}

fn build_narrow_exchange(spec: &OperatorSpec, state: &State) -> Result<Box<dyn Operator>> {
    Ok(Box::new(Exchange::narrow(&spec.id, spec.node(state, &spec.tree)?)))
}

fn build_wide_exchange(spec: &OperatorSpec, state: &State) -> Result<Box<dyn Operator>> {
    Ok(Box::new(Exchange::wide(&spec.id, spec.node(state, &spec.tree)?)))
}

fn build_uniform(spec: &OperatorSpec, state: &State) -> Result<Box<dyn Operator>> {
    Ok(Box::new(UniformHeight::new(&spec.id, spec.node(state, &spec.tree)?)))
}

fn build_up_down(spec: &OperatorSpec, state: &State) -> Result<Box<dyn Operator>> {
    let up = spec.nodes(state, &spec.up)?;
    let down = spec.nodes(state, &spec.down)?;
    let mut op = UpDown::new(&spec.id, up, down)?;
    if let Some(sf) = spec.scale_factor {
        op = op.with_scale_factor(sf)?;
    }
    if let Some(kernel) = spec.kernel {
        op = op.with_kernel(kernel)?;
    }
    if let Some(optimise) = spec.optimise {
        op = op.with_optimise(optimise);
    }
    Ok(Box::new(op))
}
