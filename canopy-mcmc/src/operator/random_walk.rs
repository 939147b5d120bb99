//! Additive random walks on one entry of a real or integer parameter.

use canopy_core::{CanopyError, Named, Result};
use rand::Rng;

use super::kernel::KernelDistribution;
use super::{log_space_update, pick, tuning_suggestion, ChainRng, Operator, Proposal};
use crate::state::{State, StateNodeId};

/// Random walk `x' = x + δ` on a real parameter.
///
/// Without a kernel `δ` is uniform on `[-window, window]`.
#[derive(Debug, Clone)]
pub struct RealRandomWalk {
    name: String,
    parameter: StateNodeId,
    window: f64,
    kernel: Option<KernelDistribution>,
    optimise: bool,
}

impl RealRandomWalk {
    /// # Errors
    ///
    /// Returns an input error unless `window` is finite and positive.
    pub fn new(name: impl Into<String>, parameter: StateNodeId, window: f64) -> Result<Self> {
        let name = name.into();
        if !(window.is_finite() && window > 0.0) {
            return Err(CanopyError::InvalidInput(format!(
                "{}: window must be positive, got {}",
                name, window
            )));
        }
        Ok(Self {
            name,
            parameter,
            window,
            kernel: None,
            optimise: true,
        })
    }

    /// # Errors
    ///
    /// Returns an input error for an invalid kernel.
    pub fn with_kernel(mut self, kernel: KernelDistribution) -> Result<Self> {
        kernel.validate()?;
        self.kernel = Some(kernel);
        Ok(self)
    }

    pub fn with_optimise(mut self, optimise: bool) -> Self {
        self.optimise = optimise;
        self
    }

    pub fn window(&self) -> f64 {
        self.window
    }

    /// Add `delta` to entry `i`, rejecting if the result leaves the bounds.
    pub fn step_by(&self, state: &mut State, i: usize, delta: f64) -> Result<Proposal> {
        let param = state.real(self.parameter)?;
        let value = param.get(i).ok_or_else(|| {
            CanopyError::InvalidInput(format!(
                "{}: index {} out of range for '{}'",
                self.name,
                i,
                param.name()
            ))
        })? + delta;
        if !param.in_bounds(value) {
            return Ok(Proposal::Reject);
        }
        state.edit_real(self.parameter)?.set_value(i, value)?;
        Ok(Proposal::SYMMETRIC)
    }
}

impl Named for RealRandomWalk {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Operator for RealRandomWalk {
    fn state_nodes(&self) -> Vec<StateNodeId> {
        vec![self.parameter]
    }

    fn proposal(&mut self, state: &mut State, rng: &mut ChainRng) -> Result<Proposal> {
        let i = pick(rng, state.real(self.parameter)?.dimension());
        let delta = match self.kernel {
            Some(kernel) => kernel.random_delta(rng, self.window),
            None => rng.random_range(-self.window..=self.window),
        };
        self.step_by(state, i, delta)
    }

    fn target_acceptance(&self) -> f64 {
        match self.kernel {
            Some(k) if k.is_bactrian() => super::scale::BACTRIAN_TARGET_ACCEPTANCE,
            _ => super::DEFAULT_TARGET_ACCEPTANCE,
        }
    }

    fn tuning(&self) -> Option<f64> {
        Some(self.window)
    }

    fn set_tuning(&mut self, value: f64) {
        if value.is_finite() && value > 0.0 {
            self.window = value;
        }
    }

    fn optimize(&mut self, delta: f64) {
        if self.optimise {
            self.window = log_space_update(self.window, delta);
        }
    }

    fn performance_suggestion(&self, acceptance: f64) -> Option<String> {
        tuning_suggestion("window size", self.window, acceptance, self.target_acceptance())
    }
}

/// Random walk `x' = x + δ` on an integer parameter, `δ` uniform on
/// `-window..=window`.
///
/// A draw of zero is rejected outright since it cannot change the state.
#[derive(Debug, Clone)]
pub struct IntRandomWalk {
    name: String,
    parameter: StateNodeId,
    window: i64,
}

impl IntRandomWalk {
    /// # Errors
    ///
    /// Returns an input error unless `window` is positive.
    pub fn new(name: impl Into<String>, parameter: StateNodeId, window: i64) -> Result<Self> {
        let name = name.into();
        if window < 1 {
            return Err(CanopyError::InvalidInput(format!(
                "{}: window must be at least 1, got {}",
                name, window
            )));
        }
        Ok(Self {
            name,
            parameter,
            window,
        })
    }
}

impl Named for IntRandomWalk {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Operator for IntRandomWalk {
    fn state_nodes(&self) -> Vec<StateNodeId> {
        vec![self.parameter]
    }

    fn proposal(&mut self, state: &mut State, rng: &mut ChainRng) -> Result<Proposal> {
        let param = state.integer(self.parameter)?;
        let i = pick(rng, param.dimension());
        let delta = rng.random_range(-self.window..=self.window);
        if delta == 0 {
            return Ok(Proposal::Reject);
        }
        let value = param.value(i).saturating_add(delta);
        if !param.in_bounds(value) {
            return Ok(Proposal::Reject);
        }
        state.edit_integer(self.parameter)?.set_value(i, value)?;
        Ok(Proposal::SYMMETRIC)
    }

    fn tuning(&self) -> Option<f64> {
        Some(self.window as f64)
    }

    fn set_tuning(&mut self, value: f64) {
        if value >= 1.0 {
            self.window = value.round() as i64;
        }
    }
}
