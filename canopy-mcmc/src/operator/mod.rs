//! Proposal kernels.
//!
//! An [`Operator`] mutates one or more state nodes in place and returns a
//! [`Proposal`]: either the log Hastings ratio of a well-formed move or
//! [`Proposal::Reject`] for a move that must be rejected outright (bounds
//! violated, negative branch length, degenerate topology). A rejection is
//! a normal outcome, not an error; errors are reserved for protocol and
//! model faults that abort the chain.

pub mod exchange;
pub mod kernel;
pub mod random_walk;
pub mod scale;
pub mod subtree_slide;
pub mod uniform;
pub mod up_down;

pub use exchange::Exchange;
pub use kernel::KernelDistribution;
pub use random_walk::{IntRandomWalk, RealRandomWalk};
pub use scale::{ParameterScaleMode, ScaleOperator, ScaleTarget};
pub use subtree_slide::SubtreeSlide;
pub use uniform::UniformHeight;
pub use up_down::UpDown;

use canopy_core::{Named, Result};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};

use crate::state::{State, StateNodeId};

/// The single random number generator threaded through a chain.
pub type ChainRng = Xoshiro256PlusPlus;

/// Acceptance probability most operators are tuned towards.
pub const DEFAULT_TARGET_ACCEPTANCE: f64 = 0.234;

/// Outcome of [`Operator::proposal`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Proposal {
    /// A valid move with the given log Hastings ratio.
    Hastings(f64),
    /// Reject without evaluating the posterior.
    Reject,
}

impl Proposal {
    /// A symmetric move.
    pub const SYMMETRIC: Proposal = Proposal::Hastings(0.0);

    pub fn log_hastings_ratio(self) -> f64 {
        match self {
            Proposal::Hastings(x) => x,
            Proposal::Reject => f64::NEG_INFINITY,
        }
    }

    /// True for an explicit reject, a ratio of −∞ or NaN.
    pub fn is_reject(self) -> bool {
        match self {
            Proposal::Reject => true,
            Proposal::Hastings(x) => x == f64::NEG_INFINITY || x.is_nan(),
        }
    }
}

/// A proposal kernel with optional self-tuning.
pub trait Operator: Named + Send {
    /// State nodes this operator may edit.
    fn state_nodes(&self) -> Vec<StateNodeId>;

    /// Propose a new state by editing `state` in place.
    ///
    /// Nodes must be opened through the `State::edit_*` accessors so the
    /// driver can roll them back.
    fn proposal(&mut self, state: &mut State, rng: &mut ChainRng) -> Result<Proposal>;

    fn target_acceptance(&self) -> f64 {
        DEFAULT_TARGET_ACCEPTANCE
    }

    /// Current value of the tunable parameter, if any.
    fn tuning(&self) -> Option<f64> {
        None
    }

    fn set_tuning(&mut self, _value: f64) {}

    /// Apply an adaptation step computed by the schedule.
    fn optimize(&mut self, _delta: f64) {}

    /// Advice for the user when the acceptance rate is far off target.
    fn performance_suggestion(&self, _acceptance: f64) -> Option<String> {
        None
    }
}

/// Why a proposal was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Lost the Metropolis-Hastings coin flip.
    Ordinary,
    /// The new posterior was −∞.
    InvalidPosterior,
    /// The operator itself returned [`Proposal::Reject`].
    InvalidProposal,
}

/// Acceptance counters of one operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorStats {
    pub accepted: u64,
    pub rejected: u64,
    /// Accepts counted after the auto-optimise delay.
    pub accepted_for_correction: u64,
    /// Rejects counted after the auto-optimise delay.
    pub rejected_for_correction: u64,
    /// Rejects caused by −∞ (posterior or proposal).
    pub rejected_invalid: u64,
    /// Rejects where the proposal itself was invalid.
    pub rejected_operator: u64,
}

impl OperatorStats {
    pub fn record_accept(&mut self, counting_for_correction: bool) {
        self.accepted += 1;
        if counting_for_correction {
            self.accepted_for_correction += 1;
        }
    }

    pub fn record_reject(&mut self, reason: Rejection, counting_for_correction: bool) {
        self.rejected += 1;
        match reason {
            Rejection::Ordinary => {}
            Rejection::InvalidPosterior => self.rejected_invalid += 1,
            Rejection::InvalidProposal => {
                self.rejected_invalid += 1;
                self.rejected_operator += 1;
            }
        }
        if counting_for_correction {
            self.rejected_for_correction += 1;
        }
    }

    pub fn total(&self) -> u64 {
        self.accepted + self.rejected
    }

    pub fn acceptance_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            n => self.accepted as f64 / n as f64,
        }
    }

    /// Number of outcomes that fed tuning.
    pub fn corrections(&self) -> u64 {
        self.accepted_for_correction + self.rejected_for_correction
    }
}

/// Update a positive tuning value in log space.
pub(crate) fn log_space_update(value: f64, delta: f64) -> f64 {
    (value.ln() + delta).exp()
}

/// Suggest a new value for a tuning parameter when the acceptance rate is
/// below 0.1 or above 0.4.
///
/// The tuning value is scaled by the acceptance-to-target ratio, clamped
/// to [0.5, 2].
pub(crate) fn tuning_suggestion(
    parameter: &str,
    current: f64,
    acceptance: f64,
    target: f64,
) -> Option<String> {
    if (0.10..=0.40).contains(&acceptance) {
        return None;
    }
    let ratio = (acceptance / target).clamp(0.5, 2.0);
    Some(format!(
        "Try setting {} to about {:.3}",
        parameter,
        current * ratio
    ))
}

/// Draw an index in `0..n` with `rng`.
pub(crate) fn pick(rng: &mut ChainRng, n: usize) -> usize {
    use rand::Rng;
    rng.random_range(0..n)
}
