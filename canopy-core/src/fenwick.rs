//! Fenwick tree (Binary Indexed Tree) over non-negative weights.
//!
//! Backs weighted random choice where individual weights change at
//! runtime: point updates, prefix sums and the inverse "which slot holds
//! cumulative mass `t`" query all run in O(log n).

use crate::{CanopyError, Result};

/// Cumulative weights with O(log n) update and weighted lookup.
///
/// Uses 1-based indexing internally.
#[derive(Debug, Clone)]
pub struct CumulativeWeights {
    tree: Vec<f64>,
    weights: Vec<f64>,
}

impl Default for CumulativeWeights {
    fn default() -> Self {
        Self {
            tree: vec![0.0],
            weights: Vec::new(),
        }
    }
}

impl CumulativeWeights {
    /// Build from a slice of weights in O(n) time.
    ///
    /// # Errors
    ///
    /// Returns an error if any weight is negative or not finite.
    pub fn from_weights(weights: &[f64]) -> Result<Self> {
        for (i, &w) in weights.iter().enumerate() {
            check_weight(i, w)?;
        }
        let n = weights.len();
        let mut tree = vec![0.0; n + 1];
        tree[1..].copy_from_slice(weights);
        for i in 1..=n {
            let parent = i + lowbit(i);
            if parent <= n {
                let child_val = tree[i];
                tree[parent] += child_val;
            }
        }
        Ok(Self {
            tree,
            weights: weights.to_vec(),
        })
    }

    /// Replace the weight at index `i` (0-based).
    ///
    /// # Errors
    ///
    /// Returns an error if `i` is out of range or the weight is invalid.
    pub fn set(&mut self, i: usize, weight: f64) -> Result<()> {
        if i >= self.weights.len() {
            return Err(CanopyError::InvalidInput(format!(
                "weight index {} out of range ({})",
                i,
                self.weights.len()
            )));
        }
        check_weight(i, weight)?;
        let delta = weight - self.weights[i];
        self.weights[i] = weight;
        let n = self.weights.len();
        let mut idx = i + 1;
        while idx <= n {
            self.tree[idx] += delta;
            idx += lowbit(idx);
        }
        Ok(())
    }

    /// Weight at index `i`.
    pub fn weight(&self, i: usize) -> Option<f64> {
        self.weights.get(i).copied()
    }

    /// Sum of weights in `[0, i]` (inclusive, 0-based).
    ///
    /// # Panics
    ///
    /// Panics if `i >= len`.
    pub fn prefix_sum(&self, i: usize) -> f64 {
        assert!(i < self.weights.len(), "index out of bounds");
        let mut idx = i + 1;
        let mut sum = 0.0;
        while idx > 0 {
            sum += self.tree[idx];
            idx -= lowbit(idx);
        }
        sum
    }

    /// Sum of all weights.
    pub fn total(&self) -> f64 {
        if self.weights.is_empty() {
            0.0
        } else {
            self.prefix_sum(self.weights.len() - 1)
        }
    }

    /// Weight of slot `i` relative to the total.
    pub fn normalized(&self, i: usize) -> f64 {
        let total = self.total();
        match self.weight(i) {
            Some(w) if total > 0.0 => w / total,
            _ => 0.0,
        }
    }

    /// Smallest index whose prefix sum exceeds `target`.
    ///
    /// `target` is expected in `[0, total)`. Slots with zero weight are
    /// never returned. Returns `None` when the total weight is zero.
    pub fn find(&self, target: f64) -> Option<usize> {
        let n = self.weights.len();
        if n == 0 || self.total() <= 0.0 {
            return None;
        }
        let mut pos = 0;
        let mut remaining = target;
        let mut step = 1usize << (usize::BITS - 1 - n.leading_zeros());
        while step > 0 {
            let next = pos + step;
            if next <= n && self.tree[next] <= remaining {
                pos = next;
                remaining -= self.tree[next];
            }
            step >>= 1;
        }
        // Rounding can push `pos` past the last positive slot.
        let mut idx = pos.min(n - 1);
        while self.weights[idx] <= 0.0 && idx > 0 {
            idx -= 1;
        }
        Some(idx)
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    /// Whether there are no slots.
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

fn check_weight(i: usize, w: f64) -> Result<()> {
    if !w.is_finite() || w < 0.0 {
        return Err(CanopyError::InvalidInput(format!(
            "weight {} at index {} must be finite and non-negative",
            w, i
        )));
    }
    Ok(())
}

/// Lowest set bit of `i` (i.e., `i & -i`).
#[inline]
fn lowbit(i: usize) -> usize {
    i & i.wrapping_neg()
}
