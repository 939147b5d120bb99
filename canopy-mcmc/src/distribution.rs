//! Calculation nodes producing log-densities.

use canopy_core::{CanopyError, Result};
use serde::{Deserialize, Serialize};
use statrs::distribution::{Continuous, Exp, Gamma, LogNormal, Normal, Uniform};

use crate::calculation::{CalculationNode, Dirty, EvalContext};

/// Sum of the log-densities of its calculation-node inputs.
///
/// Serves as posterior, prior and likelihood aggregate alike.
#[derive(Debug, Clone, Default)]
pub struct CompoundDistribution;

impl CalculationNode for CompoundDistribution {
    fn calculate(&mut self, ctx: &EvalContext<'_>) -> Result<f64> {
        let mut total = 0.0;
        for v in ctx.calc_values() {
            if v == f64::NEG_INFINITY {
                return Ok(f64::NEG_INFINITY);
            }
            total += v;
        }
        Ok(total)
    }
}

/// Parametric densities available as priors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum Density {
    Normal { mean: f64, sd: f64 },
    LogNormal { mu: f64, sigma: f64 },
    Exponential { mean: f64 },
    Uniform { lower: f64, upper: f64 },
    Gamma { shape: f64, scale: f64 },
}

enum Compiled {
    Normal(Normal),
    LogNormal(LogNormal),
    Exp(Exp),
    Uniform(Uniform),
    Gamma(Gamma),
}

impl Compiled {
    fn ln_pdf(&self, x: f64) -> f64 {
        match self {
            Compiled::Normal(d) => d.ln_pdf(x),
            Compiled::LogNormal(d) => d.ln_pdf(x),
            Compiled::Exp(d) => d.ln_pdf(x),
            Compiled::Uniform(d) => d.ln_pdf(x),
            Compiled::Gamma(d) => d.ln_pdf(x),
        }
    }
}

/// Independent log-density of every entry of a real parameter.
///
/// Input 0 must be the parameter.
pub struct ParametricPrior {
    density: Density,
    compiled: Compiled,
}

impl ParametricPrior {
    /// # Errors
    ///
    /// Returns a model error when `statrs` rejects the hyperparameters.
    pub fn new(name: &str, density: Density) -> Result<Self> {
        let bad = |e: &dyn std::fmt::Display| {
            CanopyError::model(name, format!("invalid {:?}: {}", density, e))
        };
        let compiled = match density {
            Density::Normal { mean, sd } => {
                Compiled::Normal(Normal::new(mean, sd).map_err(|e| bad(&e))?)
            }
            Density::LogNormal { mu, sigma } => {
                Compiled::LogNormal(LogNormal::new(mu, sigma).map_err(|e| bad(&e))?)
            }
            Density::Exponential { mean } => {
                Compiled::Exp(Exp::new(1.0 / mean).map_err(|e| bad(&e))?)
            }
            Density::Uniform { lower, upper } => {
                Compiled::Uniform(Uniform::new(lower, upper).map_err(|e| bad(&e))?)
            }
            Density::Gamma { shape, scale } => {
                Compiled::Gamma(Gamma::new(shape, 1.0 / scale).map_err(|e| bad(&e))?)
            }
        };
        Ok(Self { density, compiled })
    }

    pub fn density(&self) -> Density {
        self.density
    }
}

impl CalculationNode for ParametricPrior {
    fn calculate(&mut self, ctx: &EvalContext<'_>) -> Result<f64> {
        let param = ctx.real(0)?;
        let mut total = 0.0;
        for &x in param.values() {
            let lp = self.compiled.ln_pdf(x);
            if lp.is_nan() {
                return Err(CanopyError::Numeric(format!(
                    "{:?} log-density at {} is NaN",
                    self.density, x
                )));
            }
            total += lp;
        }
        Ok(total)
    }
}

/// Constant-population coalescent prior on a tree.
///
/// Input 0 is the tree, input 1 the population size. Sampling and
/// coalescent events are cached and only rebuilt when the tree changed.
#[derive(Debug, Clone, Default)]
pub struct CoalescentConstant {
    events: Vec<Event>,
    stored_events: Vec<Event>,
    events_known: bool,
    stored_events_known: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Event {
    height: f64,
    coalescent: bool,
}

impl CoalescentConstant {
    pub fn new() -> Self {
        Self::default()
    }

    fn rebuild_events(&mut self, ctx: &EvalContext<'_>) -> Result<()> {
        let tree = ctx.tree(0)?;
        self.events.clear();
        self.events.extend(tree.nodes().iter().map(|n| Event {
            height: n.height(),
            coalescent: !n.is_leaf(),
        }));
        // Samples sort before coalescences at the same height.
        self.events.sort_by(|a, b| {
            a.height
                .total_cmp(&b.height)
                .then(a.coalescent.cmp(&b.coalescent))
        });
        self.events_known = true;
        Ok(())
    }
}

impl CalculationNode for CoalescentConstant {
    fn requires_recalculation(&mut self, ctx: &EvalContext<'_>) -> Dirty {
        if ctx.input_dirtiness(0) != Dirty::Clean {
            self.events_known = false;
        }
        ctx.inputs_dirtiness()
    }

    fn calculate(&mut self, ctx: &EvalContext<'_>) -> Result<f64> {
        if !self.events_known {
            self.rebuild_events(ctx)?;
        }
        let pop_size = ctx.real(1)?.value(0);
        if !(pop_size > 0.0) {
            return Ok(f64::NEG_INFINITY);
        }
        let ln_pop = pop_size.ln();
        let mut log_p = 0.0;
        let mut lineages: usize = 0;
        let mut previous = self.events.first().map_or(0.0, |e| e.height);
        for event in &self.events {
            if lineages >= 2 {
                let pairs = (lineages * (lineages - 1) / 2) as f64;
                log_p -= pairs * (event.height - previous) / pop_size;
            }
            if event.coalescent {
                log_p -= ln_pop;
                lineages = lineages.saturating_sub(1);
            } else {
                lineages += 1;
            }
            previous = event.height;
        }
        Ok(log_p)
    }

    fn store(&mut self) {
        self.stored_events.clone_from(&self.events);
        self.stored_events_known = self.events_known;
    }

    fn restore(&mut self) {
        std::mem::swap(&mut self.events, &mut self.stored_events);
        self.events_known = self.stored_events_known;
    }
}
