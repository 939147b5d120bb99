//! Shared primitives, traits, and utilities for the Canopy MCMC engine.
//!
//! `canopy-core` provides the foundation the engine crates build on:
//!
//! - **Error types** — [`CanopyError`] and [`Result`] for structured error handling
//! - **Traits** — Core abstractions like [`Named`], [`Checkpointable`], [`Summarizable`]
//! - **Cumulative weights** — Fenwick-backed weighted choice with runtime reweighting

pub mod error;
pub mod fenwick;
pub mod traits;

pub use error::{CanopyError, Result};
pub use fenwick::CumulativeWeights;
pub use traits::*;
