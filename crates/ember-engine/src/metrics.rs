//! Per-batch metrics for the rank loop.
//!
//! [`BatchMetrics`] captures timing, particle counts and memory data for a
//! single batch on one rank. [`Context::run_batch`](crate::Context::run_batch)
//! returns it; the most recent copy is also kept on the context.

/// Timing, population and memory metrics collected during one batch.
///
/// Durations are in microseconds. Particle counts are local to the rank.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchMetrics {
    /// Batch index passed to `run_batch`.
    pub batch: u64,
    /// Wall-clock time for the whole batch.
    pub total_us: u64,
    /// Time spent in the parallel tracking phase.
    pub tracking_us: u64,
    /// Time spent servicing the exchange, rebalancing and refilling.
    pub serial_us: u64,
    /// Time spent in the end-of-batch score reduction.
    pub reduce_us: u64,
    /// Rank-loop iterations until termination.
    pub rounds: u64,
    /// Source histories started on this rank.
    pub histories_sourced: u64,
    /// Histories (primaries, secondaries, arrivals) tracked.
    pub tracked: u64,
    /// Secondaries created by trackers.
    pub secondaries: u64,
    /// Particles ending in absorption.
    pub absorbed: u64,
    /// Particles leaving the geometry.
    pub leaked: u64,
    /// Particles whose history ended by being stored in the bank.
    pub banked: u64,
    /// Sites created by trackers for the next generation.
    pub bank_sites: u64,
    /// Particles posted to other ranks.
    pub particles_sent: u64,
    /// Particles received from other ranks.
    pub particles_received: u64,
    /// Particles moved between worker queues by the rebalancer.
    pub rebalance_moves: u64,
    /// Records added by stack top-ups.
    pub refilled: u64,
    /// Free records moved between workers' stacks when levelling.
    pub stack_moves: u64,
    /// Termination waves until completion.
    pub termination_waves: u64,
    /// Arena size after the batch, in bytes.
    pub memory_bytes: usize,
    /// Cumulative arena growth events.
    pub arena_growths: u64,
}

impl BatchMetrics {
    /// Particles whose history ended on this rank.
    pub fn ended(&self) -> u64 {
        self.absorbed + self.leaked + self.banked
    }
}
