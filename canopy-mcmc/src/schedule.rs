//! Weighted operator selection and adaptive tuning.

use std::fmt::Write as _;

use canopy_core::{CanopyError, CumulativeWeights, Named, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::operator::{ChainRng, Operator, OperatorStats, Rejection};

/// How the correction count is damped in the tuning step size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimisationTransform {
    #[default]
    None,
    Log,
    Sqrt,
}

/// Schedule settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Tune operators towards their target acceptance.
    pub auto_optimize: bool,
    /// Number of tuning requests to ignore before adapting.
    pub auto_optimize_delay: u64,
    pub transform: OptimisationTransform,
    /// Split rejections by cause in [`OperatorSchedule::operator_rates`].
    pub detailed_rejection: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            auto_optimize: true,
            auto_optimize_delay: 10_000,
            transform: OptimisationTransform::None,
            detailed_rejection: false,
        }
    }
}

/// Saved tuning value and counters of one operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorTuning {
    pub name: String,
    pub tuning: Option<f64>,
    pub stats: OperatorStats,
}

/// Everything the schedule needs to continue where it stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSnapshot {
    pub optimize_requests: u64,
    pub operators: Vec<OperatorTuning>,
}

struct Entry {
    operator: Box<dyn Operator>,
    weight: f64,
    stats: OperatorStats,
}

/// The operators of a chain, their weights and their statistics.
pub struct OperatorSchedule {
    config: ScheduleConfig,
    entries: Vec<Entry>,
    weights: CumulativeWeights,
    optimize_requests: u64,
}

impl OperatorSchedule {
    pub fn new(config: ScheduleConfig) -> Self {
        Self {
            config,
            entries: Vec::new(),
            weights: CumulativeWeights::default(),
            optimize_requests: 0,
        }
    }

    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    /// Register an operator with a relative selection weight.
    ///
    /// # Errors
    ///
    /// Returns an input error for a negative or non-finite weight and a
    /// model error for a duplicate operator name.
    pub fn add(&mut self, operator: Box<dyn Operator>, weight: f64) -> Result<usize> {
        if self.entries.iter().any(|e| e.operator.name() == operator.name()) {
            return Err(CanopyError::model(
                operator.name(),
                "operator name registered twice",
            ));
        }
        let mut weights: Vec<f64> = self.entries.iter().map(|e| e.weight).collect();
        weights.push(weight);
        self.weights = CumulativeWeights::from_weights(&weights)?;
        self.entries.push(Entry {
            operator,
            weight,
            stats: OperatorStats::default(),
        });
        Ok(self.entries.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn operator(&self, i: usize) -> &dyn Operator {
        self.entries[i].operator.as_ref()
    }

    pub fn operator_mut(&mut self, i: usize) -> &mut dyn Operator {
        self.entries[i].operator.as_mut()
    }

    pub fn operators(&self) -> impl Iterator<Item = &dyn Operator> {
        self.entries.iter().map(|e| e.operator.as_ref())
    }

    pub fn stats(&self, i: usize) -> &OperatorStats {
        &self.entries[i].stats
    }

    pub fn weight(&self, i: usize) -> f64 {
        self.entries[i].weight
    }

    /// Change a weight while the chain runs.
    ///
    /// # Errors
    ///
    /// Returns an input error for a bad index or weight.
    pub fn set_weight(&mut self, i: usize, weight: f64) -> Result<()> {
        self.weights.set(i, weight)?;
        self.entries[i].weight = weight;
        Ok(())
    }

    /// Pick an operator with probability proportional to its weight.
    ///
    /// # Errors
    ///
    /// Returns a model error if no operator has positive weight.
    pub fn select(&self, rng: &mut ChainRng) -> Result<usize> {
        let target = rng.random::<f64>() * self.weights.total();
        self.weights
            .find(target)
            .ok_or_else(|| CanopyError::model("operator schedule", "no operator has positive weight"))
    }

    /// True once the tuning delay has passed; outcomes then count as
    /// corrections.
    pub fn counting_for_correction(&self) -> bool {
        self.optimize_requests >= self.config.auto_optimize_delay
    }

    pub fn record_accept(&mut self, i: usize) {
        let counting = self.counting_for_correction();
        self.entries[i].stats.record_accept(counting);
    }

    pub fn record_reject(&mut self, i: usize, reason: Rejection) {
        let counting = self.counting_for_correction();
        self.entries[i].stats.record_reject(reason, counting);
    }

    /// Robbins-Monro step for operator `i`.
    ///
    /// Each call counts as one tuning request. Returns 0 until the delay
    /// has passed or when tuning is off, otherwise
    /// `(exp(min(log_alpha, 0)) − target) / c` with `c` the damped number
    /// of corrections so far plus one.
    pub fn calc_delta(&mut self, i: usize, log_alpha: f64) -> f64 {
        self.optimize_requests += 1;
        if self.optimize_requests < self.config.auto_optimize_delay || !self.config.auto_optimize {
            return 0.0;
        }
        let entry = &self.entries[i];
        let target = entry.operator.target_acceptance();
        let mut count = entry.stats.corrections() as f64 + 1.0;
        count = match self.config.transform {
            OptimisationTransform::None => count,
            OptimisationTransform::Log => (count + 1.0).ln(),
            OptimisationTransform::Sqrt => count.sqrt(),
        };
        let delta = (log_alpha.min(0.0).exp() - target) / count;
        if delta.is_finite() {
            delta
        } else {
            0.0
        }
    }

    /// Feed one outcome back into operator `i`.
    pub fn optimize(&mut self, i: usize, log_alpha: f64) {
        let delta = self.calc_delta(i, log_alpha);
        if delta != 0.0 {
            self.entries[i].operator.optimize(delta);
        }
    }

    /// Per-operator acceptance table.
    pub fn operator_rates(&self) -> String {
        let total: u64 = self.entries.iter().map(|e| e.stats.total()).sum();
        let mut out = String::new();
        let _ = write!(
            out,
            "{:<30} {:>10} {:>8} {:>8}",
            "Operator", "Tuning", "#accept", "#reject"
        );
        if self.config.detailed_rejection {
            let _ = write!(out, " {:>9} {:>9}", "#invalid", "#operator");
        }
        let _ = writeln!(out, " {:>8} {:>12}", "Pr(m)", "Pr(acc|m)");
        for e in &self.entries {
            let tuning = e
                .operator
                .tuning()
                .map(|t| format!("{:.5}", t))
                .unwrap_or_else(|| "-".into());
            let pr_m = if total > 0 {
                e.stats.total() as f64 / total as f64
            } else {
                0.0
            };
            let _ = write!(
                out,
                "{:<30} {:>10} {:>8} {:>8}",
                e.operator.name(),
                tuning,
                e.stats.accepted,
                e.stats.rejected
            );
            if self.config.detailed_rejection {
                let _ = write!(
                    out,
                    " {:>9} {:>9}",
                    e.stats.rejected_invalid, e.stats.rejected_operator
                );
            }
            let rate = e.stats.acceptance_rate();
            let _ = write!(out, " {:>8.5} {:>12.5}", pr_m, rate);
            if e.stats.total() > 0 {
                if let Some(s) = e.operator.performance_suggestion(rate) {
                    let _ = write!(out, " {}", s);
                }
            }
            out.push('\n');
        }
        out
    }

    /// Acceptance rate per operator name.
    pub fn acceptance_rates(&self) -> Vec<(String, f64)> {
        self.entries
            .iter()
            .map(|e| (e.operator.name().to_string(), e.stats.acceptance_rate()))
            .collect()
    }

    pub fn snapshot(&self) -> ScheduleSnapshot {
        ScheduleSnapshot {
            optimize_requests: self.optimize_requests,
            operators: self
                .entries
                .iter()
                .map(|e| OperatorTuning {
                    name: e.operator.name().to_string(),
                    tuning: e.operator.tuning(),
                    stats: e.stats.clone(),
                })
                .collect(),
        }
    }

    /// Restore tuning values and counters by operator name.
    ///
    /// Operators missing from the snapshot keep their current settings.
    /// Unknown names are skipped with a debug message.
    pub fn restore_snapshot(&mut self, snapshot: &ScheduleSnapshot) {
        self.optimize_requests = snapshot.optimize_requests;
        for saved in &snapshot.operators {
            match self
                .entries
                .iter_mut()
                .find(|e| e.operator.name() == saved.name)
            {
                Some(entry) => {
                    if let Some(t) = saved.tuning {
                        entry.operator.set_tuning(t);
                    }
                    entry.stats = saved.stats.clone();
                }
                None => debug!(operator = %saved.name, "saved tuning for unknown operator"),
            }
        }
    }
}
