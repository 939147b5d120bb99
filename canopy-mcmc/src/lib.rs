//! State, calculation graph, tree and operator engine for Bayesian
//! phylogenetic MCMC.
//!
//! - **State** — Typed parameters and trees with store/restore checkpoints
//!   ([`State`], [`RealParameter`], [`Tree`])
//! - **Calculation graph** — Lazily recomputed log-densities with dirty
//!   propagation ([`CalcGraph`], [`CalculationNode`])
//! - **Densities** — [`ParametricPrior`], [`CoalescentConstant`] and the
//!   site-partitioned [`ThreadedTreeLikelihood`]
//! - **Operators** — Scale, random-walk, subtree-slide, exchange, uniform
//!   and up-down moves with adaptive tuning ([`Operator`])
//! - **Chain** — Weighted [`OperatorSchedule`], the [`Mcmc`] driver,
//!   trace and tree [`Logger`]s and resumable [`Checkpoint`]s
//! - **Wiring** — Declarative [`OperatorSpec`]s built by an
//!   [`OperatorRegistry`]
//!
//! # Example
//!
//! ```
//! use canopy_mcmc::{
//!     CalcGraphBuilder, CoalescentConstant, Input, Mcmc, McmcConfig, OperatorRegistry,
//!     OperatorSpec, RealParameter, ScheduleConfig, State, Tree,
//! };
//!
//! let mut state = State::new();
//! let tree = state
//!     .add_tree(Tree::from_newick("tree", "((A:1,B:1):1,C:2);").unwrap())
//!     .unwrap();
//! let pop = state
//!     .add_real(RealParameter::new("popSize", vec![1.0]).unwrap())
//!     .unwrap();
//!
//! let mut builder = CalcGraphBuilder::new();
//! let posterior = builder
//!     .add(
//!         "coalescent",
//!         CoalescentConstant::new(),
//!         vec![Input::State(tree), Input::State(pop)],
//!     )
//!     .unwrap();
//! let graph = builder.build(&state).unwrap();
//!
//! let specs: Vec<OperatorSpec> = serde_json::from_str(
//!     r#"[
//!         {"id": "slide", "kind": "subtree_slide", "tree": "tree"},
//!         {"id": "popScaler", "kind": "scale", "parameter": "popSize"}
//!     ]"#,
//! )
//! .unwrap();
//! let schedule = OperatorRegistry::new()
//!     .build_schedule(&specs, &state, ScheduleConfig::default())
//!     .unwrap();
//!
//! let config = McmcConfig {
//!     chain_length: 1000,
//!     ..Default::default()
//! };
//! let mut mcmc = Mcmc::new(config, state, graph, posterior, schedule).unwrap();
//! let summary = mcmc.run().unwrap();
//! assert_eq!(summary.iterations, 1000);
//! assert!(summary.log_posterior.is_finite());
//! ```

pub mod calculation;
pub mod checkpoint;
pub mod distribution;
pub mod inputs;
pub mod likelihood;
pub mod logger;
pub mod mcmc;
pub mod newick;
pub mod operator;
pub mod parameter;
pub mod registry;
pub mod schedule;
pub mod state;
pub mod tree;

// Re-export state types
pub use parameter::{BooleanParameter, IntegerParameter, Parameter, RealParameter};
pub use state::{State, StateNode, StateNodeId, StateSnapshot};
pub use tree::{MetaValue, Node, NodeId, Tree};

// Re-export the calculation graph and densities
pub use calculation::{CalcGraph, CalcGraphBuilder, CalcId, CalculationNode, Dirty, EvalContext, Input};
pub use distribution::{CoalescentConstant, CompoundDistribution, Density, ParametricPrior};
pub use likelihood::{SiteLikelihood, ThreadedTreeLikelihood};

// Re-export operators
pub use operator::{ChainRng, KernelDistribution, Operator, Proposal};

// Re-export the chain driver and its collaborators
pub use checkpoint::Checkpoint;
pub use logger::{Loggable, Logger, ParameterColumns, PosteriorColumn, TreeLog};
pub use mcmc::{ChainSummary, Mcmc, McmcConfig, StateInitialiser};
pub use schedule::{OperatorSchedule, ScheduleConfig};

// Re-export model wiring
pub use inputs::{check_slots, Rule, Slot};
pub use registry::{OperatorRegistry, OperatorSpec};
