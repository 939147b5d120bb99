//! The chain driver.
//!
//! One iteration selects an operator, lets it propose, evaluates the
//! posterior through the calculation graph and then accepts (commit state
//! and caches) or rejects (roll both back). A proposal that returns
//! [`Proposal::Reject`] is rolled back without touching the graph.

use std::path::{Path, PathBuf};

use canopy_core::{CanopyError, Named, Result};
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::calculation::{CalcGraph, CalcId};
use crate::checkpoint::Checkpoint;
use crate::logger::Logger;
use crate::operator::{ChainRng, Proposal, Rejection};
use crate::schedule::{OperatorSchedule, ScheduleConfig};
use crate::state::State;

/// Samples during which a posterior mismatch is fatal rather than
/// corrected.
pub const DEBUG_SAMPLES: u64 = 6000;

/// Corrections tolerated after [`DEBUG_SAMPLES`].
pub const MAX_CORRECTIONS: u32 = 100;

/// Largest tolerated gap between incremental and recomputed posteriors.
pub const POSTERIOR_TOLERANCE: f64 = 1e-6;

/// MCMC run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct McmcConfig {
    /// Number of logged samples.
    pub chain_length: u64,
    /// Samples run before the chain proper, without statistics or tuning.
    pub pre_burnin: u64,
    /// Write the state file every this many samples; 0 only at the end.
    pub store_every: u64,
    pub seed: u64,
    /// Start-up retries while the initial posterior is −∞.
    pub num_init_attempts: u32,
    /// Recompute the posterior from scratch every this many samples and
    /// compare with the incremental value; 0 disables.
    pub debug_check_interval: u64,
    pub schedule: ScheduleConfig,
}

impl Default for McmcConfig {
    fn default() -> Self {
        Self {
            chain_length: 10_000,
            pre_burnin: 0,
            store_every: 0,
            seed: 127,
            num_init_attempts: 10,
            debug_check_interval: 10_000,
            schedule: ScheduleConfig::default(),
        }
    }
}

/// Draws a fresh starting point for some state nodes, e.g. a random tree.
///
/// Called before every start-up attempt.
pub trait StateInitialiser: Send {
    fn initialise(&mut self, state: &mut State, rng: &mut ChainRng) -> Result<()>;
}

/// Outcome of [`Mcmc::run`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSummary {
    pub log_posterior: f64,
    /// Samples run by this call, excluding pre-burn-in.
    pub iterations: u64,
    /// Acceptance rate per operator, in schedule order.
    pub acceptance_rates: Vec<(String, f64)>,
    /// Posterior mismatches corrected by the debug check.
    pub corrections: u32,
}

/// A single Metropolis-Hastings chain.
pub struct Mcmc {
    config: McmcConfig,
    state: State,
    graph: CalcGraph,
    posterior: CalcId,
    schedule: OperatorSchedule,
    rng: ChainRng,
    loggers: Vec<Logger>,
    initialisers: Vec<Box<dyn StateInitialiser>>,
    state_file: Option<PathBuf>,
    log_posterior: f64,
    start_sample: u64,
    corrections: u32,
}

impl Mcmc {
    /// Assemble a chain.
    ///
    /// # Errors
    ///
    /// Returns a model error if the schedule is empty or an operator works
    /// on a state node that is not part of `state`. State nodes no operator
    /// touches only produce a warning.
    pub fn new(
        config: McmcConfig,
        state: State,
        graph: CalcGraph,
        posterior: CalcId,
        schedule: OperatorSchedule,
    ) -> Result<Self> {
        if schedule.is_empty() {
            return Err(CanopyError::model("operator schedule", "no operators"));
        }
        let mut operated = vec![false; state.len()];
        for op in schedule.operators() {
            for id in op.state_nodes() {
                if !state.contains(id) {
                    return Err(CanopyError::model(
                        op.name(),
                        format!("operates on state node {} which is not in the state", id.index()),
                    ));
                }
                operated[id.index()] = true;
            }
        }
        for id in state.ids() {
            if !operated[id.index()] {
                warn!(node = state.node(id).name(), "state node is not changed by any operator");
            }
        }
        let rng = ChainRng::seed_from_u64(config.seed);
        Ok(Self {
            config,
            state,
            graph,
            posterior,
            schedule,
            rng,
            loggers: Vec::new(),
            initialisers: Vec::new(),
            state_file: None,
            log_posterior: f64::NEG_INFINITY,
            start_sample: 0,
            corrections: 0,
        })
    }

    /// Write checkpoints to `path`.
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    pub fn with_initialiser(mut self, initialiser: Box<dyn StateInitialiser>) -> Self {
        self.initialisers.push(initialiser);
        self
    }

    pub fn add_logger(&mut self, logger: Logger) {
        let store_every = self.config.store_every;
        if store_every > 0 && store_every % logger.every() != 0 {
            warn!(
                store_every,
                log_every = logger.every(),
                "log interval does not divide the state file interval; a resumed log may have gaps"
            );
        }
        self.loggers.push(logger);
    }

    pub fn config(&self) -> &McmcConfig {
        &self.config
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn graph(&self) -> &CalcGraph {
        &self.graph
    }

    pub fn schedule(&self) -> &OperatorSchedule {
        &self.schedule
    }

    pub fn schedule_mut(&mut self) -> &mut OperatorSchedule {
        &mut self.schedule
    }

    /// Incrementally maintained log posterior of the committed state.
    pub fn log_posterior(&self) -> f64 {
        self.log_posterior
    }

    /// First sample the next [`Mcmc::run`] will draw.
    pub fn start_sample(&self) -> u64 {
        self.start_sample
    }

    /// Load a state file written by an earlier run of the same model.
    ///
    /// Restores state values, operator tuning and counters. The random
    /// stream is reseeded from the configured seed and the sample number.
    ///
    /// # Errors
    ///
    /// Returns I/O and serde errors from reading, and a model error when a
    /// state node is missing from the file.
    pub fn resume_from(&mut self, path: &Path) -> Result<()> {
        let checkpoint = Checkpoint::read(path)?;
        self.state.restore_snapshot(&checkpoint.state)?;
        self.schedule.restore_snapshot(&checkpoint.schedule);
        self.log_posterior = checkpoint.log_posterior;
        self.start_sample = checkpoint.sample() + 1;
        self.rng = ChainRng::seed_from_u64(self.config.seed.wrapping_add(self.start_sample));
        info!(path = %path.display(), sample = self.start_sample, "resuming chain");
        Ok(())
    }

    /// Run the chain to `chain_length`.
    ///
    /// # Errors
    ///
    /// Fails when no finite starting posterior is found, on a +∞ posterior,
    /// on a failed debug check and on any non-recoverable error raised by
    /// an operator, calculation node, logger or the state file.
    pub fn run(&mut self) -> Result<ChainSummary> {
        let resumed = self.start_sample > 0;
        if resumed {
            let saved = self.log_posterior;
            self.log_posterior = self.graph.recalculate_all(&mut self.state, self.posterior)?;
            if too_different(self.log_posterior, saved) {
                warn!(saved, recomputed = self.log_posterior, "posterior differs from the state file");
            }
        } else {
            self.initialise()?;
            for logger in &mut self.loggers {
                logger.init(&self.state, &self.graph)?;
            }
        }
        info!(log_posterior = self.log_posterior, sample = self.start_sample, "start likelihood");

        if !resumed {
            for _ in 0..self.config.pre_burnin {
                self.step(false)?;
            }
        }

        let start = self.start_sample;
        for sample in start..self.config.chain_length {
            self.step(true)?;
            let interval = self.config.debug_check_interval;
            if interval > 0 && sample % interval == 0 {
                self.debug_check(sample)?;
            }
            for logger in &mut self.loggers {
                logger.log(sample, &self.state, &self.graph)?;
            }
            let store_every = self.config.store_every;
            if store_every > 0 && sample > 0 && sample % store_every == 0 {
                self.write_checkpoint(sample)?;
            }
        }
        let iterations = self.config.chain_length.saturating_sub(start);
        if iterations > 0 {
            self.write_checkpoint(self.config.chain_length - 1)?;
            self.start_sample = self.config.chain_length;
        }
        for logger in &mut self.loggers {
            logger.close()?;
        }

        info!(log_posterior = self.log_posterior, iterations, "end likelihood");
        info!("operator analysis\n{}", self.schedule.operator_rates());
        Ok(ChainSummary {
            log_posterior: self.log_posterior,
            iterations,
            acceptance_rates: self.schedule.acceptance_rates(),
            corrections: self.corrections,
        })
    }

    /// One counted Metropolis-Hastings iteration. Returns whether the
    /// proposal was accepted.
    ///
    /// The chain must have been started (its posterior computed) first,
    /// which [`Mcmc::run`] and [`Mcmc::initialise`] do.
    pub fn propagate_state(&mut self) -> Result<bool> {
        self.step(true)
    }

    /// Find a starting state with a finite posterior.
    ///
    /// # Errors
    ///
    /// Returns a model error if the posterior is +∞, or still −∞ after
    /// `num_init_attempts` attempts.
    pub fn initialise(&mut self) -> Result<()> {
        let attempts = self.config.num_init_attempts.max(1);
        for attempt in 1..=attempts {
            for initialiser in &mut self.initialisers {
                initialiser.initialise(&mut self.state, &mut self.rng)?;
            }
            self.state.store();
            self.log_posterior = self.graph.recalculate_all(&mut self.state, self.posterior)?;
            if self.log_posterior == f64::INFINITY {
                return Err(CanopyError::model("posterior", "initial posterior is +inf"));
            }
            if self.log_posterior.is_finite() {
                return Ok(());
            }
            debug!(attempt, "initial posterior is not finite");
            if self.initialisers.is_empty() {
                break;
            }
        }
        Err(CanopyError::model(
            "posterior",
            format!(
                "could not find a starting state with finite posterior (last value {})",
                self.log_posterior
            ),
        ))
    }

    fn step(&mut self, counting: bool) -> Result<bool> {
        let i = self.schedule.select(&mut self.rng)?;
        let proposal = self
            .schedule
            .operator_mut(i)
            .proposal(&mut self.state, &mut self.rng)?;

        let (accepted, log_alpha) = match proposal {
            Proposal::Hastings(hastings) if !proposal.is_reject() => {
                self.graph.store_calculation_nodes(&self.state);
                self.graph.check_dirtiness(&self.state);
                let new = self.graph.calculate(&self.state, self.posterior)?;
                if new == f64::INFINITY {
                    return Err(CanopyError::model(
                        "posterior",
                        format!("+inf after {}", self.schedule.operator(i).name()),
                    ));
                }
                let log_alpha = new - self.log_posterior + hastings;
                if log_alpha >= 0.0 || self.rng.random::<f64>() < log_alpha.exp() {
                    self.log_posterior = new;
                    self.state.store();
                    self.graph.accept();
                    if counting {
                        self.schedule.record_accept(i);
                    }
                    (true, log_alpha)
                } else {
                    if counting {
                        let reason = if new == f64::NEG_INFINITY {
                            Rejection::InvalidPosterior
                        } else {
                            Rejection::Ordinary
                        };
                        self.schedule.record_reject(i, reason);
                    }
                    self.state.restore();
                    self.graph.restore();
                    (false, log_alpha)
                }
            }
            _ => {
                self.state.restore();
                if counting {
                    self.schedule.record_reject(i, Rejection::InvalidProposal);
                }
                (false, f64::NEG_INFINITY)
            }
        };
        trace!(operator = self.schedule.operator(i).name(), accepted, log_alpha, "proposal");

        if counting {
            self.schedule.optimize(i, log_alpha);
        }
        Ok(accepted)
    }

    fn debug_check(&mut self, sample: u64) -> Result<()> {
        let recomputed = self.graph.recalculate_all(&mut self.state, self.posterior)?;
        if !too_different(recomputed, self.log_posterior) {
            return Ok(());
        }
        if sample < DEBUG_SAMPLES {
            return Err(CanopyError::invariant(
                "posterior",
                format!(
                    "at sample {} incremental value {} != recomputed {}",
                    sample, self.log_posterior, recomputed
                ),
            ));
        }
        self.corrections += 1;
        warn!(
            sample,
            incremental = self.log_posterior,
            recomputed,
            corrections = self.corrections,
            "posterior incorrectly calculated; corrected"
        );
        if self.corrections > MAX_CORRECTIONS {
            return Err(CanopyError::invariant(
                "posterior",
                format!("more than {} posterior corrections", MAX_CORRECTIONS),
            ));
        }
        self.log_posterior = recomputed;
        Ok(())
    }

    fn write_checkpoint(&self, sample: u64) -> Result<()> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        Checkpoint {
            state: self.state.snapshot(sample),
            schedule: self.schedule.snapshot(),
            log_posterior: self.log_posterior,
        }
        .write(path)
    }
}

fn too_different(a: f64, b: f64) -> bool {
    if a == b {
        return false;
    }
    !((a - b).abs() <= POSTERIOR_TOLERANCE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculation::{CalcGraphBuilder, CalculationNode, Dirty, EvalContext, Input};
    use crate::distribution::{CoalescentConstant, CompoundDistribution, Density, ParametricPrior};
    use crate::operator::{
        Exchange, Operator, RealRandomWalk, ScaleOperator, ScaleTarget, SubtreeSlide,
        UniformHeight,
    };
    use crate::parameter::RealParameter;
    use crate::state::StateNodeId;
    use crate::tree::Tree;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Sets entry 0 of a parameter and reports a fixed Hastings ratio.
    struct SetTo {
        name: String,
        node: StateNodeId,
        value: f64,
        log_hr: f64,
    }

    impl Named for SetTo {
        fn name(&self) -> &str {
            &self.name
        }
    }

    impl Operator for SetTo {
        fn state_nodes(&self) -> Vec<StateNodeId> {
            vec![self.node]
        }

        fn proposal(&mut self, state: &mut State, _: &mut ChainRng) -> Result<Proposal> {
            state.edit_real(self.node)?.set_value(0, self.value)?;
            Ok(Proposal::Hastings(self.log_hr))
        }
    }

    /// Mutates and then refuses its own move.
    struct Spoiler {
        node: StateNodeId,
    }

    impl Named for Spoiler {
        fn name(&self) -> &str {
            "spoiler"
        }
    }

    impl Operator for Spoiler {
        fn state_nodes(&self) -> Vec<StateNodeId> {
            vec![self.node]
        }

        fn proposal(&mut self, state: &mut State, _: &mut ChainRng) -> Result<Proposal> {
            state.edit_real(self.node)?.set_value(0, 42.0)?;
            Ok(Proposal::Reject)
        }
    }

    /// Pushes entry 0 by a fixed amount through the random walk.
    struct Push {
        walk: RealRandomWalk,
        delta: f64,
    }

    impl Named for Push {
        fn name(&self) -> &str {
            self.walk.name()
        }
    }

    impl Operator for Push {
        fn state_nodes(&self) -> Vec<StateNodeId> {
            self.walk.state_nodes()
        }

        fn proposal(&mut self, state: &mut State, _: &mut ChainRng) -> Result<Proposal> {
            self.walk.step_by(state, 0, self.delta)
        }
    }

    /// Standard normal log-density of entry 0, counting evaluations.
    struct Counting(Arc<AtomicUsize>);

    impl CalculationNode for Counting {
        fn calculate(&mut self, ctx: &EvalContext<'_>) -> Result<f64> {
            self.0.fetch_add(1, Ordering::SeqCst);
            let x = ctx.real(0)?.value(0);
            Ok(-0.5 * x * x)
        }
    }

    /// Never reports itself dirty, so its cached value goes stale.
    struct Stale;

    impl CalculationNode for Stale {
        fn requires_recalculation(&mut self, _: &EvalContext<'_>) -> Dirty {
            Dirty::Clean
        }

        fn calculate(&mut self, ctx: &EvalContext<'_>) -> Result<f64> {
            let x = ctx.real(0)?.value(0);
            Ok(-0.5 * x * x)
        }
    }

    fn quiet_config() -> McmcConfig {
        McmcConfig {
            chain_length: 100,
            debug_check_interval: 0,
            ..Default::default()
        }
    }

    /// `x ~ N(0, 1)` with the density evaluated by a counting node.
    fn scalar_model(x0: f64) -> (State, CalcGraph, StateNodeId, CalcId, Arc<AtomicUsize>) {
        let mut state = State::new();
        let x = state
            .add_real(RealParameter::new("x", vec![x0]).unwrap())
            .unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut builder = CalcGraphBuilder::new();
        let density = builder
            .add("density", Counting(Arc::clone(&counter)), vec![Input::State(x)])
            .unwrap();
        let posterior = builder
            .add("posterior", CompoundDistribution, vec![Input::Calc(density)])
            .unwrap();
        let graph = builder.build(&state).unwrap();
        (state, graph, x, posterior, counter)
    }

    #[test]
    fn accept_then_reject_keeps_first_move() {
        let (state, graph, x, posterior, _) = scalar_model(0.0);
        let mut schedule = OperatorSchedule::new(ScheduleConfig::default());
        let good = schedule
            .add(
                Box::new(SetTo { name: "good".into(), node: x, value: 0.5, log_hr: 10.0 }),
                1.0,
            )
            .unwrap();
        let bad = schedule
            .add(
                Box::new(SetTo { name: "bad".into(), node: x, value: 0.7, log_hr: -1e9 }),
                0.0,
            )
            .unwrap();
        let mut mcmc = Mcmc::new(quiet_config(), state, graph, posterior, schedule).unwrap();
        mcmc.initialise().unwrap();

        assert!(mcmc.propagate_state().unwrap());
        assert_eq!(mcmc.state().real(x).unwrap().value(0), 0.5);
        assert!((mcmc.log_posterior() + 0.125).abs() < 1e-12);

        mcmc.schedule_mut().set_weight(good, 0.0).unwrap();
        mcmc.schedule_mut().set_weight(bad, 1.0).unwrap();
        assert!(!mcmc.propagate_state().unwrap());
        let p = mcmc.state().real(x).unwrap();
        assert_eq!(p.value(0), 0.5);
        assert_eq!(p.stored_values(), &[0.5]);
        assert!((mcmc.log_posterior() + 0.125).abs() < 1e-12);
        assert!((mcmc.graph().value(posterior) + 0.125).abs() < 1e-12);
        assert_eq!(mcmc.schedule().stats(good).accepted, 1);
        assert_eq!(mcmc.schedule().stats(bad).rejected, 1);
        assert_eq!(mcmc.schedule().stats(bad).rejected_invalid, 0);
    }

    #[test]
    fn rejected_proposal_skips_the_posterior() {
        let (state, graph, x, posterior, counter) = scalar_model(1.0);
        let mut schedule = OperatorSchedule::new(ScheduleConfig::default());
        schedule.add(Box::new(Spoiler { node: x }), 1.0).unwrap();
        let mut mcmc = Mcmc::new(quiet_config(), state, graph, posterior, schedule).unwrap();
        mcmc.initialise().unwrap();
        let evaluations = counter.load(Ordering::SeqCst);

        for _ in 0..5 {
            assert!(!mcmc.propagate_state().unwrap());
        }
        assert_eq!(counter.load(Ordering::SeqCst), evaluations);
        assert_eq!(mcmc.state().real(x).unwrap().value(0), 1.0);
        assert!(mcmc.state().changed().is_empty());
        let stats = mcmc.schedule().stats(0);
        assert_eq!(stats.rejected, 5);
        assert_eq!(stats.rejected_operator, 5);
    }

    #[test]
    fn out_of_bounds_move_leaves_stored_value() {
        let mut state = State::new();
        let x = state
            .add_real(
                RealParameter::new("x", vec![0.9])
                    .unwrap()
                    .with_bounds(0.0, 1.0)
                    .unwrap(),
            )
            .unwrap();
        let mut builder = CalcGraphBuilder::new();
        let posterior = builder
            .add(
                "prior",
                ParametricPrior::new("prior", Density::Uniform { lower: 0.0, upper: 1.0 }).unwrap(),
                vec![Input::State(x)],
            )
            .unwrap();
        let graph = builder.build(&state).unwrap();
        let walk = RealRandomWalk::new("walk", x, 1.0).unwrap();
        let mut schedule = OperatorSchedule::new(ScheduleConfig::default());
        schedule.add(Box::new(Push { walk, delta: 0.5 }), 1.0).unwrap();
        let mut mcmc = Mcmc::new(quiet_config(), state, graph, posterior, schedule).unwrap();
        mcmc.initialise().unwrap();

        assert!(!mcmc.propagate_state().unwrap());
        let p = mcmc.state().real(x).unwrap();
        assert_eq!(p.value(0), 0.9);
        assert_eq!(p.stored_values(), &[0.9]);
        assert_eq!(mcmc.schedule().stats(0).rejected_operator, 1);
    }

    #[test]
    fn impossible_start_is_a_model_error() {
        let mut state = State::new();
        let x = state
            .add_real(RealParameter::new("x", vec![5.0]).unwrap())
            .unwrap();
        let mut builder = CalcGraphBuilder::new();
        let posterior = builder
            .add(
                "prior",
                ParametricPrior::new("prior", Density::Uniform { lower: 0.0, upper: 1.0 }).unwrap(),
                vec![Input::State(x)],
            )
            .unwrap();
        let graph = builder.build(&state).unwrap();
        let mut schedule = OperatorSchedule::new(ScheduleConfig::default());
        schedule
            .add(Box::new(RealRandomWalk::new("walk", x, 0.1).unwrap()), 1.0)
            .unwrap();
        let mut mcmc = Mcmc::new(quiet_config(), state, graph, posterior, schedule).unwrap();
        assert!(matches!(mcmc.run(), Err(CanopyError::Model { .. })));
    }

    #[test]
    fn initialiser_is_retried_until_posterior_is_finite() {
        struct Walk {
            node: StateNodeId,
            calls: Arc<AtomicUsize>,
        }

        impl StateInitialiser for Walk {
            fn initialise(&mut self, state: &mut State, _: &mut ChainRng) -> Result<()> {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                // Inside the support from the third attempt on.
                let value = if n >= 2 { 0.5 } else { 5.0 };
                state.edit_real(self.node)?.set_value(0, value)
            }
        }

        let mut state = State::new();
        let x = state
            .add_real(RealParameter::new("x", vec![5.0]).unwrap())
            .unwrap();
        let mut builder = CalcGraphBuilder::new();
        let posterior = builder
            .add(
                "prior",
                ParametricPrior::new("prior", Density::Uniform { lower: 0.0, upper: 1.0 }).unwrap(),
                vec![Input::State(x)],
            )
            .unwrap();
        let graph = builder.build(&state).unwrap();
        let mut schedule = OperatorSchedule::new(ScheduleConfig::default());
        schedule
            .add(Box::new(RealRandomWalk::new("walk", x, 0.1).unwrap()), 1.0)
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut mcmc = Mcmc::new(quiet_config(), state, graph, posterior, schedule)
            .unwrap()
            .with_initialiser(Box::new(Walk { node: x, calls: Arc::clone(&calls) }));
        mcmc.initialise().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(mcmc.log_posterior().abs() < 1e-12);
    }

    #[test]
    fn operator_on_foreign_node_is_refused() {
        let (state, graph, _, posterior, _) = scalar_model(0.0);
        let mut other = State::new();
        other
            .add_real(RealParameter::new("a", vec![1.0]).unwrap())
            .unwrap();
        let foreign = other
            .add_real(RealParameter::new("b", vec![1.0]).unwrap())
            .unwrap();
        let mut schedule = OperatorSchedule::new(ScheduleConfig::default());
        schedule
            .add(Box::new(RealRandomWalk::new("walk", foreign, 0.1).unwrap()), 1.0)
            .unwrap();
        assert!(Mcmc::new(quiet_config(), state, graph, posterior, schedule).is_err());
    }

    #[test]
    fn stale_cache_fails_the_debug_check() {
        let mut state = State::new();
        let x = state
            .add_real(RealParameter::new("x", vec![0.0]).unwrap())
            .unwrap();
        let mut builder = CalcGraphBuilder::new();
        let density = builder.add("density", Stale, vec![Input::State(x)]).unwrap();
        let posterior = builder
            .add("posterior", CompoundDistribution, vec![Input::Calc(density)])
            .unwrap();
        let graph = builder.build(&state).unwrap();
        let mut schedule = OperatorSchedule::new(ScheduleConfig::default());
        schedule
            .add(Box::new(RealRandomWalk::new("walk", x, 1.0).unwrap()), 1.0)
            .unwrap();
        let config = McmcConfig {
            chain_length: 50,
            debug_check_interval: 1,
            ..Default::default()
        };
        let mut mcmc = Mcmc::new(config, state, graph, posterior, schedule).unwrap();
        assert!(matches!(mcmc.run(), Err(CanopyError::Invariant { .. })));
    }

    struct TreeModel {
        state: State,
        graph: CalcGraph,
        posterior: CalcId,
        schedule: OperatorSchedule,
        tree: StateNodeId,
    }

    /// Five taxa under a constant coalescent with a log-normal prior on the
    /// population size and the usual tree moves.
    fn tree_model() -> TreeModel {
        let mut state = State::new();
        let tree = state
            .add_tree(
                Tree::from_newick("tree", "(((A:1,B:1):1,C:2):1.5,(D:0.5,E:0.5):3);").unwrap(),
            )
            .unwrap();
        let pop = state
            .add_real(
                RealParameter::new("popSize", vec![2.0]).unwrap(),
            )
            .unwrap();
        let mut builder = CalcGraphBuilder::new();
        let coalescent = builder
            .add(
                "coalescent",
                CoalescentConstant::new(),
                vec![Input::State(tree), Input::State(pop)],
            )
            .unwrap();
        let pop_prior = builder
            .add(
                "popPrior",
                ParametricPrior::new("popPrior", Density::LogNormal { mu: 0.0, sigma: 1.0 })
                    .unwrap(),
                vec![Input::State(pop)],
            )
            .unwrap();
        let posterior = builder
            .add(
                "posterior",
                CompoundDistribution,
                vec![Input::Calc(coalescent), Input::Calc(pop_prior)],
            )
            .unwrap();
        let graph = builder.build(&state).unwrap();

        let mut schedule = OperatorSchedule::new(ScheduleConfig {
            auto_optimize_delay: 100,
            ..Default::default()
        });
        let ops: Vec<(Box<dyn Operator>, f64)> = vec![
            (
                Box::new(ScaleOperator::new(
                    "treeScaler",
                    ScaleTarget::Tree { id: tree, root_only: false },
                )),
                3.0,
            ),
            (
                Box::new(ScaleOperator::new(
                    "rootScaler",
                    ScaleTarget::Tree { id: tree, root_only: true },
                )),
                3.0,
            ),
            (Box::new(SubtreeSlide::new("slide", tree)), 15.0),
            (Box::new(Exchange::narrow("narrow", tree)), 15.0),
            (Box::new(Exchange::wide("wide", tree)), 3.0),
            (Box::new(UniformHeight::new("uniform", tree)), 30.0),
            (
                Box::new(ScaleOperator::new(
                    "popScaler",
                    ScaleTarget::Parameter {
                        id: pop,
                        mode: crate::operator::ParameterScaleMode::One,
                    },
                )),
                3.0,
            ),
        ];
        for (op, w) in ops {
            schedule.add(op, w).unwrap();
        }
        TreeModel {
            state,
            graph,
            posterior,
            schedule,
            tree,
        }
    }

    #[test]
    fn tree_chain_stays_consistent() {
        let m = tree_model();
        let config = McmcConfig {
            chain_length: 2000,
            pre_burnin: 50,
            debug_check_interval: 7,
            ..Default::default()
        };
        let mut mcmc = Mcmc::new(config, m.state, m.graph, m.posterior, m.schedule).unwrap();
        let summary = mcmc.run().unwrap();
        assert_eq!(summary.iterations, 2000);
        assert_eq!(summary.corrections, 0);
        assert!(summary.log_posterior.is_finite());
        assert_eq!(summary.acceptance_rates.len(), 7);
        mcmc.state().tree(m.tree).unwrap().validate().unwrap();
        let counted: u64 = (0..mcmc.schedule().len())
            .map(|i| mcmc.schedule().stats(i).total())
            .sum();
        assert_eq!(counted, 2000);
        assert!(summary.acceptance_rates.iter().any(|(_, r)| *r > 0.0));
    }

    #[test]
    fn same_seed_same_chain() {
        let run = || {
            let m = tree_model();
            let mut mcmc =
                Mcmc::new(quiet_config(), m.state, m.graph, m.posterior, m.schedule).unwrap();
            mcmc.run().unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn resume_continues_from_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.state");

        let m = tree_model();
        let config = McmcConfig {
            chain_length: 300,
            store_every: 100,
            debug_check_interval: 0,
            ..Default::default()
        };
        let mut first = Mcmc::new(config.clone(), m.state, m.graph, m.posterior, m.schedule)
            .unwrap()
            .with_state_file(&path);
        let summary = first.run().unwrap();
        let saved = Checkpoint::read(&path).unwrap();
        assert_eq!(saved.sample(), 299);
        assert!((saved.log_posterior - summary.log_posterior).abs() < 1e-12);

        let m = tree_model();
        let mut second = Mcmc::new(
            McmcConfig {
                chain_length: 500,
                ..config
            },
            m.state,
            m.graph,
            m.posterior,
            m.schedule,
        )
        .unwrap()
        .with_state_file(&path);
        second.resume_from(&path).unwrap();
        assert_eq!(second.start_sample(), 300);
        assert_eq!(second.state().snapshot(299), saved.state);
        assert_eq!(second.schedule().snapshot(), saved.schedule);

        let summary = second.run().unwrap();
        assert_eq!(summary.iterations, 200);
        assert_eq!(Checkpoint::read(&path).unwrap().sample(), 499);
        let counted: u64 = (0..second.schedule().len())
            .map(|i| second.schedule().stats(i).total())
            .sum();
        assert_eq!(counted, 500);
    }

    #[test]
    fn too_different_tolerates_rounding() {
        assert!(!too_different(-10.0, -10.0 + 1e-9));
        assert!(too_different(-10.0, -10.1));
        assert!(!too_different(f64::NEG_INFINITY, f64::NEG_INFINITY));
        assert!(too_different(f64::NAN, 0.0));
    }
}
