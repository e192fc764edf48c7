//! Statistics buffers.
//!
//! A [`ScoreBuffer`] is a dense array of bins with a fixed shape. Each
//! worker accumulates into its own private copy during tracking, so
//! scoring takes no shared lock. At the end of a batch the private copies
//! are merged, summed across ranks with a batched all-reduce, and folded
//! into running batch statistics (sum and sum of squares).

use std::sync::{Mutex, MutexGuard};

use crossbeam_utils::CachePadded;
use ember_core::{fatal, BinIndex, Site, WorkerId};
use ember_domain::{collective, Transport};
use smallvec::smallvec;

/// Handle to a score buffer registered on a [`Context`](crate::Context).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScoreId(pub usize);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Per-worker accumulators plus cross-batch statistics for one score.
pub struct ScoreBuffer {
    name: String,
    shape: BinIndex,
    len: usize,
    private: Vec<CachePadded<Mutex<Vec<f64>>>>,
    batch: Vec<f64>,
    sum: Vec<f64>,
    sum_sq: Vec<f64>,
    batches: u64,
}

impl ScoreBuffer {
    /// A buffer of shape `dims` for `workers` workers.
    ///
    /// An empty `dims` is a single scalar bin.
    pub fn new(name: impl Into<String>, dims: &[usize], workers: usize) -> Self {
        let name = name.into();
        if dims.contains(&0) {
            fatal!(
                Site::here("score"),
                "score {name} has a zero-length dimension in {dims:?}"
            );
        }
        let len = dims.iter().product();
        Self {
            name,
            shape: dims.iter().copied().collect(),
            len,
            private: (0..workers)
                .map(|_| CachePadded::new(Mutex::new(vec![0.0; len])))
                .collect(),
            batch: vec![0.0; len],
            sum: vec![0.0; len],
            sum_sq: vec![0.0; len],
            batches: 0,
        }
    }

    /// Name given at registration.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bin counts per dimension.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Total number of bins.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; every buffer has at least one bin.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Row-major flat index of `bins`.
    pub fn index(&self, bins: &[usize]) -> usize {
        if bins.len() != self.shape.len() {
            fatal!(
                Site::here("score"),
                "score {} has {} dimensions, got bin index {bins:?}",
                self.name,
                self.shape.len()
            );
        }
        let mut flat = 0;
        for (&b, &n) in bins.iter().zip(self.shape.iter()) {
            if b >= n {
                fatal!(
                    Site::here("score"),
                    "bin {bins:?} outside shape {:?} of score {}",
                    self.shape,
                    self.name
                );
            }
            flat = flat * n + b;
        }
        flat
    }

    /// Multi-dimensional bin of a flat index.
    pub fn bins(&self, mut flat: usize) -> BinIndex {
        let mut out: BinIndex = smallvec![0; self.shape.len()];
        for (slot, &n) in out.iter_mut().zip(self.shape.iter()).rev() {
            *slot = flat % n;
            flat /= n;
        }
        out
    }

    /// Add `value * weight` to `worker`'s private copy of `bins`.
    pub fn add_score(&self, worker: WorkerId, value: f64, weight: f64, bins: &[usize]) {
        let i = self.index(bins);
        let Some(slot) = self.private.get(worker.index()) else {
            fatal!(
                Site::here("score"),
                "worker {worker} out of range for score {}",
                self.name
            );
        };
        lock(slot)[i] += value * weight;
    }

    /// Merge every worker's private copy into the batch total and clear them.
    pub fn collect(&mut self) {
        for slot in &self.private {
            let mut private = lock(slot);
            for (acc, v) in self.batch.iter_mut().zip(private.iter_mut()) {
                *acc += std::mem::take(v);
            }
        }
    }

    /// This rank's collected but unreduced batch value of `bins`.
    pub fn batch_value(&self, bins: &[usize]) -> f64 {
        self.batch[self.index(bins)]
    }

    /// Collect, sum the batch across ranks and fold it into the statistics.
    ///
    /// Every rank must reduce its buffers in the same order.
    pub fn reduce<T: Transport + ?Sized>(&mut self, transport: &T, chunk: usize) {
        self.collect();
        collective::all_reduce_sum(transport, &mut self.batch, chunk);
        for ((v, s), sq) in self
            .batch
            .iter_mut()
            .zip(self.sum.iter_mut())
            .zip(self.sum_sq.iter_mut())
        {
            let x = std::mem::take(v);
            *s += x;
            *sq += x * x;
        }
        self.batches += 1;
    }

    /// Batches folded into the statistics.
    pub fn batches(&self) -> u64 {
        self.batches
    }

    /// Mean over batches of `bins`, or `None` before the first reduce.
    pub fn mean(&self, bins: &[usize]) -> Option<f64> {
        let i = self.index(bins);
        (self.batches > 0).then(|| self.sum[i] / self.batches as f64)
    }

    /// Standard error of the batch mean, or `None` with fewer than two batches.
    pub fn std_error(&self, bins: &[usize]) -> Option<f64> {
        let i = self.index(bins);
        if self.batches < 2 {
            return None;
        }
        let n = self.batches as f64;
        let mean = self.sum[i] / n;
        let var = (self.sum_sq[i] / n - mean * mean).max(0.0);
        Some((var / (n - 1.0)).sqrt())
    }
}
