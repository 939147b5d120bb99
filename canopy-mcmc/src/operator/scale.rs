//! Multiplicative moves on real parameters and tree heights.

use canopy_core::{CanopyError, Named, Result};
use serde::{Deserialize, Serialize};

use super::kernel::KernelDistribution;
use super::{log_space_update, pick, tuning_suggestion, ChainRng, Operator, Proposal};
use crate::state::{State, StateNodeId};

/// Target acceptance used with the two-mode kernels.
pub const BACTRIAN_TARGET_ACCEPTANCE: f64 = 0.3;

/// Which entries of a real parameter are scaled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ParameterScaleMode {
    /// One entry picked uniformly.
    One,
    /// Every entry by the same factor. The Hastings ratio uses
    /// `degrees_of_freedom` when given, the dimension otherwise.
    All { degrees_of_freedom: Option<usize> },
    /// Every entry by its own factor.
    AllIndependently,
}

/// What a [`ScaleOperator`] acts on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScaleTarget {
    Parameter {
        id: StateNodeId,
        mode: ParameterScaleMode,
    },
    /// All internal heights, or the root height alone.
    Tree { id: StateNodeId, root_only: bool },
}

/// Scale move `x' = x · exp(scale_factor · draw)`.
#[derive(Debug, Clone)]
pub struct ScaleOperator {
    name: String,
    target: ScaleTarget,
    scale_factor: f64,
    kernel: KernelDistribution,
    optimise: bool,
    lower_limit: f64,
    upper_limit: f64,
    indicator: Option<StateNodeId>,
}

impl ScaleOperator {
    pub fn new(name: impl Into<String>, target: ScaleTarget) -> Self {
        Self {
            name: name.into(),
            target,
            scale_factor: 0.75,
            kernel: KernelDistribution::default(),
            optimise: true,
            lower_limit: 1e-8,
            upper_limit: 10.0,
            indicator: None,
        }
    }

    /// # Errors
    ///
    /// Returns an input error unless the factor is finite and positive.
    pub fn with_scale_factor(mut self, scale_factor: f64) -> Result<Self> {
        if !(scale_factor.is_finite() && scale_factor > 0.0) {
            return Err(CanopyError::InvalidInput(format!(
                "{}: scale factor must be positive, got {}",
                self.name, scale_factor
            )));
        }
        self.scale_factor = scale_factor;
        Ok(self)
    }

    /// # Errors
    ///
    /// Returns an input error for an invalid kernel.
    pub fn with_kernel(mut self, kernel: KernelDistribution) -> Result<Self> {
        kernel.validate()?;
        self.kernel = kernel;
        Ok(self)
    }

    pub fn with_optimise(mut self, optimise: bool) -> Self {
        self.optimise = optimise;
        self
    }

    /// Bounds applied to the scale factor while tuning.
    ///
    /// # Errors
    ///
    /// Returns an input error unless `0 < lower < upper`.
    pub fn with_limits(mut self, lower: f64, upper: f64) -> Result<Self> {
        if !(lower > 0.0 && lower < upper) {
            return Err(CanopyError::InvalidInput(format!(
                "{}: scale limits [{}, {}] are not an interval of positive numbers",
                self.name, lower, upper
            )));
        }
        self.lower_limit = lower;
        self.upper_limit = upper;
        Ok(self)
    }

    /// Restrict parameter moves to entries whose indicator is set.
    ///
    /// An indicator one shorter than the parameter leaves entry 0 always
    /// eligible and gates entry `i` by flag `i - 1`.
    pub fn with_indicator(mut self, indicator: StateNodeId) -> Self {
        self.indicator = Some(indicator);
        self
    }

    pub fn target(&self) -> ScaleTarget {
        self.target
    }

    pub fn scale_factor(&self) -> f64 {
        self.scale_factor
    }

    /// Apply a fixed factor to every entry the target covers.
    ///
    /// For a parameter every eligible entry is scaled and the ratio is
    /// `k · ln(factor)`, `k` being the degrees of freedom if configured and
    /// the number of scaled entries otherwise.
    pub fn scale_by(&self, state: &mut State, factor: f64) -> Result<Proposal> {
        match self.target {
            ScaleTarget::Tree { id, root_only } => scale_tree(state, id, root_only, factor),
            ScaleTarget::Parameter { id, mode } => {
                let eligible = self.eligible(state, id)?;
                let dof = match mode {
                    ParameterScaleMode::All {
                        degrees_of_freedom: Some(d),
                    } => Some(d),
                    _ => None,
                };
                let factors = vec![factor; eligible.len()];
                let proposal = scale_entries(state, id, &eligible, &factors)?;
                Ok(match (proposal, dof) {
                    (Proposal::Hastings(_), Some(d)) => Proposal::Hastings(d as f64 * factor.ln()),
                    (p, _) => p,
                })
            }
        }
    }

    fn eligible(&self, state: &State, id: StateNodeId) -> Result<Vec<usize>> {
        let dimension = state.real(id)?.dimension();
        match self.indicator {
            None => Ok((0..dimension).collect()),
            Some(ind) => {
                let flags = state.boolean(ind)?;
                let implied_one = flags.dimension() + 1 == dimension;
                if !implied_one && flags.dimension() != dimension {
                    return Err(CanopyError::model(
                        &self.name,
                        format!(
                            "indicator has dimension {} but the parameter has {}",
                            flags.dimension(),
                            dimension
                        ),
                    ));
                }
                Ok((0..dimension)
                    .filter(|&i| match (implied_one, i) {
                        (true, 0) => true,
                        (true, _) => flags.value(i - 1),
                        (false, _) => flags.value(i),
                    })
                    .collect())
            }
        }
    }
}

/// Scale the chosen entries, rejecting before any write if one would leave
/// the bounds. The ratio is `Σ ln f_i`.
fn scale_entries(
    state: &mut State,
    id: StateNodeId,
    indices: &[usize],
    factors: &[f64],
) -> Result<Proposal> {
    if indices.is_empty() {
        return Ok(Proposal::Reject);
    }
    let param = state.real(id)?;
    let mut updates = Vec::with_capacity(indices.len());
    for (&i, &f) in indices.iter().zip(factors) {
        let v = param.value(i) * f;
        if !param.in_bounds(v) {
            return Ok(Proposal::Reject);
        }
        updates.push((i, v));
    }
    let param = state.edit_real(id)?;
    for (i, v) in updates {
        param.set_value(i, v)?;
    }
    Ok(Proposal::Hastings(factors.iter().map(|f| f.ln()).sum()))
}

fn scale_tree(state: &mut State, id: StateNodeId, root_only: bool, factor: f64) -> Result<Proposal> {
    if root_only {
        let tree = state.tree(id)?;
        let root = tree.root();
        let new_height = tree.height(root) * factor;
        let highest_child = tree
            .node(root)
            .children()
            .map(|c| tree.height(c))
            .fold(f64::NEG_INFINITY, f64::max);
        if new_height < highest_child {
            return Ok(Proposal::Reject);
        }
        state.edit_tree(id)?.set_height(root, new_height)?;
        return Ok(Proposal::Hastings(factor.ln()));
    }
    match state.edit_tree(id)?.scale(factor)? {
        Some(scaled) => Ok(Proposal::Hastings(scaled as f64 * factor.ln())),
        None => Ok(Proposal::Reject),
    }
}

impl Named for ScaleOperator {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Operator for ScaleOperator {
    fn state_nodes(&self) -> Vec<StateNodeId> {
        match self.target {
            ScaleTarget::Parameter { id, .. } | ScaleTarget::Tree { id, .. } => vec![id],
        }
    }

    fn proposal(&mut self, state: &mut State, rng: &mut ChainRng) -> Result<Proposal> {
        match self.target {
            ScaleTarget::Tree { id, root_only } => {
                let factor = self.kernel.scaler(rng, self.scale_factor);
                scale_tree(state, id, root_only, factor)
            }
            ScaleTarget::Parameter { id, mode } => {
                let eligible = self.eligible(state, id)?;
                if eligible.is_empty() {
                    return Ok(Proposal::Reject);
                }
                match mode {
                    ParameterScaleMode::One => {
                        let i = eligible[pick(rng, eligible.len())];
                        // Zero is a fixed point of scaling.
                        if state.real(id)?.value(i) == 0.0 {
                            return Ok(Proposal::Reject);
                        }
                        let f = self.kernel.scaler(rng, self.scale_factor);
                        scale_entries(state, id, &[i], &[f])
                    }
                    ParameterScaleMode::All { .. } => {
                        let f = self.kernel.scaler(rng, self.scale_factor);
                        self.scale_by(state, f)
                    }
                    ParameterScaleMode::AllIndependently => {
                        let factors: Vec<f64> = eligible
                            .iter()
                            .map(|_| self.kernel.scaler(rng, self.scale_factor))
                            .collect();
                        scale_entries(state, id, &eligible, &factors)
                    }
                }
            }
        }
    }

    fn target_acceptance(&self) -> f64 {
        if self.kernel.is_bactrian() {
            BACTRIAN_TARGET_ACCEPTANCE
        } else {
            super::DEFAULT_TARGET_ACCEPTANCE
        }
    }

    fn tuning(&self) -> Option<f64> {
        Some(self.scale_factor)
    }

    fn set_tuning(&mut self, value: f64) {
        self.scale_factor = value.clamp(self.lower_limit, self.upper_limit);
    }

    fn optimize(&mut self, delta: f64) {
        if self.optimise {
            self.scale_factor =
                log_space_update(self.scale_factor, delta).clamp(self.lower_limit, self.upper_limit);
        }
    }

    fn performance_suggestion(&self, acceptance: f64) -> Option<String> {
        tuning_suggestion(
            "scale factor",
            self.scale_factor,
            acceptance,
            self.target_acceptance(),
        )
    }
}
