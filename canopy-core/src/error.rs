//! Structured error types for the Canopy engine.

use thiserror::Error;

/// Unified error type for all Canopy operations.
#[derive(Debug, Error)]
pub enum CanopyError {
    /// I/O error (state file, log output)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error (malformed Newick, state file contents)
    #[error("parse error: {0}")]
    Parse(String),

    /// JSON (de)serialization failure
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Invalid input (bad arguments, out-of-range values)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Fatal model-construction error (missing slot, malformed tree, bad dimension)
    #[error("model error in '{component}': {message}")]
    Model { component: String, message: String },

    /// A class invariant does not hold
    #[error("invariant violated in '{component}': {message}")]
    Invariant { component: String, message: String },

    /// Store/restore protocol misuse
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Numeric failure inside a density evaluation
    #[error("numeric failure: {0}")]
    Numeric(String),

    /// A likelihood worker failed during a parallel evaluation
    #[error("worker {worker} failed: {message}")]
    WorkerFailed { worker: usize, message: String },

    /// Catch-all for other errors
    #[error("{0}")]
    Other(String),
}

impl CanopyError {
    /// Shorthand for a [`CanopyError::Model`] error.
    pub fn model(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Model {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a [`CanopyError::Invariant`] error.
    pub fn invariant(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invariant {
            component: component.into(),
            message: message.into(),
        }
    }

    /// True for errors a density evaluation may absorb as a zero-probability
    /// term. Everything else aborts the chain.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Numeric(_))
    }
}

/// Convenience alias used throughout the Canopy workspace.
pub type Result<T> = std::result::Result<T, CanopyError>;
