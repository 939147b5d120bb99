//! Joint scaling of two groups of state nodes in opposite directions.

use canopy_core::{CanopyError, Named, Result};

use super::kernel::KernelDistribution;
use super::scale::BACTRIAN_TARGET_ACCEPTANCE;
use super::{log_space_update, tuning_suggestion, ChainRng, Operator, Proposal};
use crate::state::{State, StateNode, StateNodeId};

/// Multiply every `up` node by `f` and divide every `down` node by it.
///
/// Real parameters scale all entries, trees all internal heights. The log
/// Hastings ratio is `(n_up − n_down) · ln f`, counting scaled entries.
#[derive(Debug, Clone)]
pub struct UpDown {
    name: String,
    up: Vec<StateNodeId>,
    down: Vec<StateNodeId>,
    scale_factor: f64,
    kernel: KernelDistribution,
    optimise: bool,
}

impl UpDown {
    /// # Errors
    ///
    /// Returns a model error if both groups are empty.
    pub fn new(
        name: impl Into<String>,
        up: Vec<StateNodeId>,
        down: Vec<StateNodeId>,
    ) -> Result<Self> {
        let name = name.into();
        if up.is_empty() && down.is_empty() {
            return Err(CanopyError::model(&name, "needs at least one node to scale"));
        }
        Ok(Self {
            name,
            up,
            down,
            scale_factor: 0.75,
            kernel: KernelDistribution::default(),
            optimise: true,
        })
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

    /// Apply a fixed factor.
    pub fn scale_by(&self, state: &mut State, factor: f64) -> Result<Proposal> {
        let mut count: i64 = 0;
        for (ids, f, sign) in [(&self.up, factor, 1i64), (&self.down, 1.0 / factor, -1i64)] {
            for &id in ids {
                match self.scale_node(state, id, f)? {
                    Some(n) => count += sign * n as i64,
                    None => return Ok(Proposal::Reject),
                }
            }
        }
        Ok(Proposal::Hastings(count as f64 * factor.ln()))
    }

    fn scale_node(&self, state: &mut State, id: StateNodeId, factor: f64) -> Result<Option<usize>> {
        match state.node(id) {
            StateNode::Real(_) => state.edit_real(id)?.scale(factor),
            StateNode::Tree(_) => state.edit_tree(id)?.scale(factor),
            other => Err(CanopyError::model(
                &self.name,
                format!("cannot scale {} '{}'", other.kind(), other.name()),
            )),
        }
    }
}

impl Named for UpDown {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Operator for UpDown {
    fn state_nodes(&self) -> Vec<StateNodeId> {
        self.up.iter().chain(&self.down).copied().collect()
    }

    fn proposal(&mut self, state: &mut State, rng: &mut ChainRng) -> Result<Proposal> {
        let factor = self.kernel.scaler(rng, self.scale_factor);
        self.scale_by(state, factor)
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
        if value.is_finite() && value > 0.0 {
            self.scale_factor = value;
        }
    }

    fn optimize(&mut self, delta: f64) {
        if self.optimise {
            self.scale_factor = log_space_update(self.scale_factor, delta).clamp(1e-8, 10.0);
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
