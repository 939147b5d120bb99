//! Site-partitioned tree likelihood evaluated on a fixed worker pool.
//!
//! The numeric kernel is external: anything implementing
//! [`SiteLikelihood`] for a contiguous range of site patterns. One kernel
//! instance is built per range and the partial log-likelihoods are summed
//! in worker order, so the result does not depend on scheduling.

use std::ops::Range;
use std::panic::{catch_unwind, AssertUnwindSafe};

use canopy_core::{CanopyError, Result};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

use crate::calculation::{CalculationNode, EvalContext};

/// Log-likelihood of one range of site patterns.
///
/// The instance sees the same inputs as the enclosing
/// [`ThreadedTreeLikelihood`] (conventionally input 0 is the tree).
pub trait SiteLikelihood: Send {
    fn calculate(&mut self, ctx: &EvalContext<'_>) -> Result<f64>;

    fn store(&mut self) {}

    fn restore(&mut self) {}
}

/// Split `site_count` patterns into `threads` contiguous ranges.
///
/// Without proportions the ranges are equal except the last, which takes
/// the remainder. Proportions are cycled if fewer than `threads` are given,
/// normalised, accumulated and rounded to the nearest pattern.
pub fn pattern_ranges(
    site_count: usize,
    threads: usize,
    proportions: Option<&[f64]>,
) -> Result<Vec<Range<usize>>> {
    if threads == 0 {
        return Err(CanopyError::InvalidInput("thread count must be positive".into()));
    }
    let mut points = vec![0usize; threads + 1];
    match proportions {
        None => {
            let range = site_count / threads;
            for (i, point) in points.iter_mut().enumerate().take(threads).skip(1) {
                *point = range * i;
            }
            points[threads] = site_count;
        }
        Some(props) => {
            if props.is_empty() || props.iter().any(|&p| !(p.is_finite() && p >= 0.0)) {
                return Err(CanopyError::InvalidInput(
                    "proportions must be finite and non-negative".into(),
                ));
            }
            let cycled: Vec<f64> = (0..threads).map(|i| props[i % props.len()]).collect();
            let sum: f64 = cycled.iter().sum();
            if sum <= 0.0 {
                return Err(CanopyError::InvalidInput("proportions sum to zero".into()));
            }
            let mut cumulative = 0.0;
            for (i, p) in cycled.iter().enumerate() {
                cumulative += p / sum;
                points[i + 1] = ((cumulative * site_count as f64 + 0.5) as usize).min(site_count);
            }
            points[threads] = site_count;
        }
    }
    Ok(points.windows(2).map(|w| w[0]..w[1].max(w[0])).collect())
}

/// Tree likelihood split across a fixed number of workers.
pub struct ThreadedTreeLikelihood<K: SiteLikelihood> {
    workers: Vec<K>,
    ranges: Vec<Range<usize>>,
    pool: Option<ThreadPool>,
}

impl<K: SiteLikelihood> ThreadedTreeLikelihood<K> {
    /// Build one kernel per range with `factory`.
    ///
    /// A single thread evaluates inline without a pool.
    ///
    /// # Errors
    ///
    /// Fails on a zero thread count, bad proportions, a factory error or a
    /// pool that cannot be started.
    pub fn new(
        site_count: usize,
        threads: usize,
        proportions: Option<&[f64]>,
        mut factory: impl FnMut(Range<usize>) -> Result<K>,
    ) -> Result<Self> {
        let ranges = pattern_ranges(site_count, threads, proportions)?;
        let workers = ranges
            .iter()
            .cloned()
            .map(&mut factory)
            .collect::<Result<Vec<K>>>()?;
        let pool = if threads > 1 {
            let pool = ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("likelihood-{}", i))
                .build()
                .map_err(|e| CanopyError::Other(format!("cannot start likelihood pool: {}", e)))?;
            Some(pool)
        } else {
            None
        };
        debug!(threads, site_count, "threaded likelihood ready");
        Ok(Self {
            workers,
            ranges,
            pool,
        })
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    pub fn ranges(&self) -> &[Range<usize>] {
        &self.ranges
    }
}

fn run_worker<K: SiteLikelihood>(worker: usize, kernel: &mut K, ctx: &EvalContext<'_>) -> Result<f64> {
    match catch_unwind(AssertUnwindSafe(|| kernel.calculate(ctx))) {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) if e.is_recoverable() => {
            debug!(worker, error = %e, "likelihood worker returned -inf");
            Ok(f64::NEG_INFINITY)
        }
        Ok(Err(e)) => Err(CanopyError::WorkerFailed {
            worker,
            message: e.to_string(),
        }),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panicked".into());
            Err(CanopyError::WorkerFailed { worker, message })
        }
    }
}

impl<K: SiteLikelihood> CalculationNode for ThreadedTreeLikelihood<K> {
    fn calculate(&mut self, ctx: &EvalContext<'_>) -> Result<f64> {
        let partials: Vec<Result<f64>> = match &self.pool {
            Some(pool) => {
                let workers = &mut self.workers;
                pool.install(|| {
                    workers
                        .par_iter_mut()
                        .enumerate()
                        .map(|(w, kernel)| run_worker(w, kernel, ctx))
                        .collect()
                })
            }
            None => self
                .workers
                .iter_mut()
                .enumerate()
                .map(|(w, kernel)| run_worker(w, kernel, ctx))
                .collect(),
        };
        let mut total = 0.0;
        for partial in partials {
            total += partial?;
        }
        Ok(total)
    }

    fn store(&mut self) {
        for w in &mut self.workers {
            w.store();
        }
    }

    fn restore(&mut self) {
        for w in &mut self.workers {
            w.restore();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculation::{CalcGraphBuilder, Input};
    use crate::state::State;
    use crate::tree::Tree;

    /// Site `s` contributes `-(s + 1) * root_height`.
    struct Linear {
        sites: Range<usize>,
    }

    impl SiteLikelihood for Linear {
        fn calculate(&mut self, ctx: &EvalContext<'_>) -> Result<f64> {
            let tree = ctx.tree(0)?;
            let h = tree.height(tree.root());
            Ok(self.sites.clone().map(|s| -((s + 1) as f64) * h).sum())
        }
    }

    struct Panicky;

    impl SiteLikelihood for Panicky {
        fn calculate(&mut self, _ctx: &EvalContext<'_>) -> Result<f64> {
            panic!("kernel exploded");
        }
    }

    struct Underflow {
        first: bool,
    }

    impl SiteLikelihood for Underflow {
        fn calculate(&mut self, _ctx: &EvalContext<'_>) -> Result<f64> {
            if self.first {
                Err(CanopyError::Numeric("scaling underflow".into()))
            } else {
                Ok(-1.0)
            }
        }
    }

    fn evaluate<K: SiteLikelihood + 'static>(node: ThreadedTreeLikelihood<K>) -> Result<f64> {
        let mut state = State::new();
        let t = state
            .add_tree(Tree::from_newick("tree", "((A:1,B:1):1,C:2);").unwrap())
            .unwrap();
        let mut builder = CalcGraphBuilder::new();
        let id = builder.add("likelihood", node, vec![Input::State(t)])?;
        let mut graph = builder.build(&state)?;
        graph.recalculate_all(&mut state, id)
    }

    #[test]
    fn equal_ranges() {
        let r = pattern_ranges(10, 3, None).unwrap();
        assert_eq!(r, vec![0..3, 3..6, 6..10]);
    }

    #[test]
    fn proportional_ranges() {
        let r = pattern_ranges(100, 2, Some(&[1.0, 3.0])).unwrap();
        assert_eq!(r, vec![0..25, 25..100]);
        let cycled = pattern_ranges(9, 3, Some(&[1.0])).unwrap();
        assert_eq!(cycled, vec![0..3, 3..6, 6..9]);
        assert!(pattern_ranges(9, 0, None).is_err());
        assert!(pattern_ranges(9, 2, Some(&[-1.0])).is_err());
    }

    #[test]
    fn threaded_sum_matches_serial() {
        let serial =
            ThreadedTreeLikelihood::new(20, 1, None, |sites| Ok(Linear { sites })).unwrap();
        let threaded =
            ThreadedTreeLikelihood::new(20, 4, None, |sites| Ok(Linear { sites })).unwrap();
        assert_eq!(threaded.thread_count(), 4);
        let a = evaluate(serial).unwrap();
        let b = evaluate(threaded).unwrap();
        // sum_{s=1}^{20} s * root height 2.0
        assert!((a - -420.0).abs() < 1e-9);
        assert_eq!(a.to_bits(), b.to_bits());
    }

    #[test]
    fn worker_panic_is_fatal() {
        let node = ThreadedTreeLikelihood::new(4, 2, None, |_| Ok(Panicky)).unwrap();
        match evaluate(node) {
            Err(CanopyError::WorkerFailed { message, .. }) => {
                assert!(message.contains("kernel exploded"))
            }
            other => panic!("expected worker failure, got {:?}", other),
        }
    }

    #[test]
    fn numeric_failure_in_worker_is_neg_infinity() {
        let node = ThreadedTreeLikelihood::new(4, 2, None, |sites| {
            Ok(Underflow {
                first: sites.start == 0,
            })
        })
        .unwrap();
        assert_eq!(evaluate(node).unwrap(), f64::NEG_INFINITY);
    }
}
