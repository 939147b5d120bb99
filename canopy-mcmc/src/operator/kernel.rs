//! Unit-variance kernels for random-walk and scale moves.
//!
//! The two-mode ("Bactrian") kernels put little mass near zero, which
//! avoids wasting proposals on tiny moves. All kernels are symmetric about
//! zero, so a random walk using them has a log Hastings ratio of 0 and a
//! scale move `x · exp(f · draw)` has `log(scale)`.

use canopy_core::{CanopyError, Result};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use super::ChainRng;

/// Default spike offset of the two-mode kernels.
pub const DEFAULT_BACTRIAN_M: f64 = 0.95;

/// Shape of the random draw behind a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum KernelDistribution {
    Uniform,
    Normal,
    BactrianNormal { m: f64 },
    BactrianUniform { m: f64 },
    BactrianLaplace { m: f64 },
    BactrianTriangle { m: f64 },
}

impl Default for KernelDistribution {
    fn default() -> Self {
        KernelDistribution::BactrianNormal {
            m: DEFAULT_BACTRIAN_M,
        }
    }
}

impl KernelDistribution {
    /// # Errors
    ///
    /// Returns an input error if a two-mode kernel has `m` outside (0, 1).
    pub fn validate(&self) -> Result<()> {
        match self.spike() {
            Some(m) if !(m > 0.0 && m < 1.0) => Err(CanopyError::InvalidInput(format!(
                "kernel parameter m = {} must lie in (0, 1)",
                m
            ))),
            _ => Ok(()),
        }
    }

    /// True for the two-mode kernels.
    pub fn is_bactrian(&self) -> bool {
        self.spike().is_some()
    }

    fn spike(&self) -> Option<f64> {
        match *self {
            KernelDistribution::Uniform | KernelDistribution::Normal => None,
            KernelDistribution::BactrianNormal { m }
            | KernelDistribution::BactrianUniform { m }
            | KernelDistribution::BactrianLaplace { m }
            | KernelDistribution::BactrianTriangle { m } => Some(m),
        }
    }

    /// One draw with mean 0 and variance 1.
    pub fn draw(&self, rng: &mut ChainRng) -> f64 {
        match *self {
            KernelDistribution::Uniform => uniform(rng),
            KernelDistribution::Normal => StandardNormal.sample(rng),
            KernelDistribution::BactrianNormal { m } => {
                bactrian(rng, m, |r| StandardNormal.sample(r))
            }
            KernelDistribution::BactrianUniform { m } => bactrian(rng, m, uniform),
            KernelDistribution::BactrianLaplace { m } => bactrian(rng, m, laplace),
            KernelDistribution::BactrianTriangle { m } => bactrian(rng, m, triangle),
        }
    }

    /// Additive step for a random walk with the given window.
    pub fn random_delta(&self, rng: &mut ChainRng, window: f64) -> f64 {
        window * self.draw(rng)
    }

    /// Multiplicative factor `exp(scale_factor · draw)`.
    pub fn scaler(&self, rng: &mut ChainRng, scale_factor: f64) -> f64 {
        (scale_factor * self.draw(rng)).exp()
    }
}

fn bactrian(rng: &mut ChainRng, m: f64, base: impl Fn(&mut ChainRng) -> f64) -> f64 {
    let spread = (1.0 - m * m).sqrt();
    let mode = if rng.random_bool(0.5) { m } else { -m };
    mode + base(rng) * spread
}

fn uniform(rng: &mut ChainRng) -> f64 {
    (rng.random::<f64>() - 0.5) * 12f64.sqrt()
}

fn laplace(rng: &mut ChainRng) -> f64 {
    let u = rng.random::<f64>() - 0.5;
    u.signum() * (1.0 - (2.0 * u).abs()).ln() / std::f64::consts::SQRT_2
}

fn triangle(rng: &mut ChainRng) -> f64 {
    let u: f64 = rng.random();
    if u < 0.5 {
        -(6f64.sqrt()) + 2.0 * (3.0 * u).sqrt()
    } else {
        6f64.sqrt() - 2.0 * (3.0 * (1.0 - u)).sqrt()
    }
}
