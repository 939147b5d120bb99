//! Array-valued parameters with bounds and a checkpoint copy.
//!
//! A [`Parameter`] keeps two copies of its values: the current values an
//! operator edits and the stored values of the last committed state.
//! Mutation is only legal while the parameter is open for editing, which
//! the [`State`](crate::state::State) arranges when an operator asks for it.

use std::fmt;
use std::str::FromStr;

use canopy_core::{CanopyError, Checkpointable, Named, Result};

/// Element types a [`Parameter`] can hold.
pub trait ParameterValue:
    Copy + PartialOrd + fmt::Debug + fmt::Display + FromStr + Send + Sync + 'static
{
    /// Short type name used in diagnostics.
    const KIND: &'static str;

    /// Smallest representable value (default lower bound).
    fn min_value() -> Self;

    /// Largest representable value (default upper bound).
    fn max_value() -> Self;

    /// Numeric view used by loggers and priors.
    fn to_f64(self) -> f64;
}

impl ParameterValue for f64 {
    const KIND: &'static str = "real";

    fn min_value() -> Self {
        f64::NEG_INFINITY
    }

    fn max_value() -> Self {
        f64::INFINITY
    }

    fn to_f64(self) -> f64 {
        self
    }
}

impl ParameterValue for i64 {
    const KIND: &'static str = "integer";

    fn min_value() -> Self {
        i64::MIN
    }

    fn max_value() -> Self {
        i64::MAX
    }

    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl ParameterValue for bool {
    const KIND: &'static str = "boolean";

    fn min_value() -> Self {
        false
    }

    fn max_value() -> Self {
        true
    }

    fn to_f64(self) -> f64 {
        if self {
            1.0
        } else {
            0.0
        }
    }
}

/// A named, fixed-dimension parameter with bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter<T: ParameterValue> {
    name: String,
    values: Vec<T>,
    stored: Vec<T>,
    lower: T,
    upper: T,
    dirty: Vec<bool>,
    editing: bool,
}

/// Real-valued parameter.
pub type RealParameter = Parameter<f64>;
/// Integer-valued parameter.
pub type IntegerParameter = Parameter<i64>;
/// Boolean parameter (indicator variables).
pub type BooleanParameter = Parameter<bool>;

impl<T: ParameterValue> Parameter<T> {
    /// Create an unbounded parameter.
    ///
    /// # Errors
    ///
    /// Returns a model error if `values` is empty.
    pub fn new(name: impl Into<String>, values: Vec<T>) -> Result<Self> {
        let name = name.into();
        if values.is_empty() {
            return Err(CanopyError::model(&name, "parameter has no values"));
        }
        let n = values.len();
        Ok(Self {
            name,
            stored: values.clone(),
            values,
            lower: T::min_value(),
            upper: T::max_value(),
            dirty: vec![false; n],
            editing: false,
        })
    }

    /// Set the bounds, checking the current values against them.
    ///
    /// # Errors
    ///
    /// Returns a model error if `lower > upper` or a value lies outside.
    pub fn with_bounds(mut self, lower: T, upper: T) -> Result<Self> {
        if lower > upper {
            return Err(CanopyError::model(
                &self.name,
                format!("lower bound {} exceeds upper bound {}", lower, upper),
            ));
        }
        self.lower = lower;
        self.upper = upper;
        if let Some(v) = self.values.iter().find(|&&v| !self.in_bounds(v)) {
            return Err(CanopyError::model(
                &self.name,
                format!("initial value {} outside [{}, {}]", v, lower, upper),
            ));
        }
        Ok(self)
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Current value at index `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i >= dimension()`.
    pub fn value(&self, i: usize) -> T {
        self.values[i]
    }

    pub fn get(&self, i: usize) -> Option<T> {
        self.values.get(i).copied()
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    /// Values of the last committed state.
    pub fn stored_values(&self) -> &[T] {
        &self.stored
    }

    pub fn lower(&self) -> T {
        self.lower
    }

    pub fn upper(&self) -> T {
        self.upper
    }

    pub fn in_bounds(&self, v: T) -> bool {
        v >= self.lower && v <= self.upper
    }

    /// Set the value at index `i`.
    ///
    /// Bounds are not enforced here; operators check them and reject
    /// before calling.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the parameter is not open for editing
    /// and an input error if `i` is out of range.
    pub fn set_value(&mut self, i: usize, v: T) -> Result<()> {
        self.check_editing()?;
        if i >= self.values.len() {
            return Err(CanopyError::InvalidInput(format!(
                "index {} out of range for '{}' (dimension {})",
                i,
                self.name,
                self.values.len()
            )));
        }
        self.values[i] = v;
        self.dirty[i] = true;
        Ok(())
    }

    pub fn is_dirty(&self, i: usize) -> bool {
        self.dirty.get(i).copied().unwrap_or(false)
    }

    /// True if the parameter has been touched since the last store/restore.
    pub fn something_is_dirty(&self) -> bool {
        self.editing
    }

    pub fn is_editing(&self) -> bool {
        self.editing
    }

    /// Overwrite both current and stored values (initialisation, resume).
    ///
    /// # Errors
    ///
    /// Returns a model error on a dimension mismatch or out-of-bounds value.
    pub fn assign_values(&mut self, values: &[T]) -> Result<()> {
        if values.len() != self.values.len() {
            return Err(CanopyError::model(
                &self.name,
                format!(
                    "expected {} values, got {}",
                    self.values.len(),
                    values.len()
                ),
            ));
        }
        if let Some(v) = values.iter().find(|&&v| !self.in_bounds(v)) {
            return Err(CanopyError::model(
                &self.name,
                format!("value {} outside [{}, {}]", v, self.lower, self.upper),
            ));
        }
        self.values.copy_from_slice(values);
        self.stored.copy_from_slice(values);
        self.dirty.fill(false);
        Ok(())
    }

    pub(crate) fn start_editing(&mut self) {
        self.editing = true;
    }

    pub(crate) fn set_everything_dirty(&mut self, dirty: bool) {
        self.dirty.fill(dirty);
        self.editing = dirty;
    }

    fn check_editing(&self) -> Result<()> {
        if self.editing {
            Ok(())
        } else {
            Err(CanopyError::Protocol(format!(
                "{} parameter '{}' mutated without being opened for editing",
                T::KIND,
                self.name
            )))
        }
    }
}

impl Parameter<f64> {
    /// Multiply every value by `factor`.
    ///
    /// Returns the number of scaled entries, or `None` without touching
    /// anything if a scaled value would leave the bounds.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the parameter is not open for editing.
    pub fn scale(&mut self, factor: f64) -> Result<Option<usize>> {
        self.check_editing()?;
        if self.values.iter().any(|&v| !self.in_bounds(v * factor)) {
            return Ok(None);
        }
        for v in &mut self.values {
            *v *= factor;
        }
        self.dirty.fill(true);
        Ok(Some(self.values.len()))
    }
}

impl<T: ParameterValue> Checkpointable for Parameter<T> {
    fn store(&mut self) {
        self.stored.copy_from_slice(&self.values);
        self.dirty.fill(false);
        self.editing = false;
    }

    fn restore(&mut self) {
        self.values.copy_from_slice(&self.stored);
        self.dirty.fill(false);
        self.editing = false;
    }
}

impl<T: ParameterValue> Named for Parameter<T> {
    fn name(&self) -> &str {
        &self.name
    }
}

impl<T: ParameterValue> fmt::Display for Parameter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", v)?;
        }
        Ok(())
    }
}
