//! The rank loop and the worker pool.
//!
//! [`Context::run_batch`] alternates two phases until the termination
//! detector reports global completion:
//!
//! 1. **Parallel**: one named thread per worker drains its own queue, then
//!    the common queue, for up to `round_budget` histories.
//! 2. **Serial**: the rank thread rebuilds arrived particles, retires
//!    completed sends, flushes partial batches once locally idle, levels
//!    the worker queues, tops up the stacks inside a growth window, levels
//!    the stacks' free-lists and polls the detector.
//!
//! Growth only happens in the serial phase, where the rank thread holds
//! the arena mutably.
//!
//! A rank that fails a batch broadcasts an abort notice before returning,
//! so its peers leave their loops with [`RunError::PeerAborted`] instead of
//! waiting for a verdict that never comes.

use std::thread;
use std::time::Instant;

use crossbeam_utils::Backoff;
use ember_arena::Arena;
use ember_bank::{rebalance, CommonQueue, ParticleStacks, WorkerFifos};
use ember_core::record::particle;
use ember_core::{BankError, DiagnosticScope, Offset, RankId, WorkerId};
use ember_domain::{
    broadcast_abort, DomainExchange, LocalStatus, Route, TerminationDetector, TerminationState,
    Transport,
};

use crate::context::Context;
use crate::error::RunError;
use crate::history::{Fate, History, Source, Tracker};
use crate::metrics::BatchMetrics;
use crate::scores::ScoreBuffer;

/// Worker whose queue receives arrivals.
const SERIAL_WORKER: WorkerId = WorkerId(0);

/// Per-worker counts from one parallel round.
#[derive(Clone, Copy, Debug, Default)]
struct RoundTally {
    tracked: u64,
    secondaries: u64,
    absorbed: u64,
    leaked: u64,
    banked: u64,
    bank_sites: u64,
}

impl RoundTally {
    fn merge(&mut self, other: &RoundTally) {
        self.tracked += other.tracked;
        self.secondaries += other.secondaries;
        self.absorbed += other.absorbed;
        self.leaked += other.leaked;
        self.banked += other.banked;
        self.bank_sites += other.bank_sites;
    }

    fn add_to(&self, m: &mut BatchMetrics) {
        m.tracked += self.tracked;
        m.secondaries += self.secondaries;
        m.absorbed += self.absorbed;
        m.leaked += self.leaked;
        m.banked += self.banked;
        m.bank_sites += self.bank_sites;
    }
}

/// What every worker thread of a round shares.
struct Crew<'a, T: ?Sized, K: ?Sized> {
    transport: &'a T,
    arena: &'a Arena,
    stacks: &'a ParticleStacks,
    queues: &'a WorkerFifos,
    bank: &'a WorkerFifos,
    common: &'a CommonQueue,
    exchange: &'a DomainExchange,
    scores: &'a [ScoreBuffer],
    tracker: &'a K,
    rank: RankId,
    batch: u64,
    budget: u64,
}

impl<T: Transport + ?Sized, K: Tracker + ?Sized> Crew<'_, T, K> {
    fn next_particle(&self, worker: WorkerId) -> Result<Option<Offset>, BankError> {
        if let Some(p) = self.queues.pop(self.arena, worker) {
            return Ok(Some(p));
        }
        self.common.pop_for(self.arena, self.stacks, worker)
    }

    /// Turn an entry standing for `m` histories into `m` queued records.
    fn expand(&self, particle: Offset, worker: WorkerId) -> Result<(), BankError> {
        let m = self.arena.get(particle + particle::MULTIPLICITY);
        if m <= 1.0 {
            return Ok(());
        }
        self.arena.put(particle + particle::MULTIPLICITY, 1.0);
        for _ in 1..m as u64 {
            let copy = self.stacks.duplicate(self.arena, particle, worker)?;
            self.queues.push(self.arena, worker, copy);
        }
        Ok(())
    }

    fn run(&self, worker: WorkerId) -> Result<RoundTally, BankError> {
        let _scope = DiagnosticScope::enter(self.rank, Some(worker));
        let mut tally = RoundTally::default();
        while tally.tracked < self.budget {
            let Some(particle) = self.next_particle(worker)? else {
                break;
            };
            self.expand(particle, worker)?;
            let mut history = History {
                arena: self.arena,
                stacks: self.stacks,
                queues: self.queues,
                bank: self.bank,
                scores: self.scores,
                rank: self.rank,
                worker,
                batch: self.batch,
                particle,
                emitted: 0,
                banked: 0,
            };
            let fate = self.tracker.track(&mut history)?;
            tally.tracked += 1;
            tally.secondaries += history.emitted;
            tally.bank_sites += history.banked;
            match fate {
                Fate::Absorbed => {
                    self.stacks.give(self.arena, particle, worker);
                    tally.absorbed += 1;
                }
                Fate::Leaked => {
                    self.stacks.give(self.arena, particle, worker);
                    tally.leaked += 1;
                }
                Fate::Banked => {
                    self.bank.push(self.arena, worker, particle);
                    tally.banked += 1;
                }
                Fate::Moved => match self.exchange.route(self.arena, particle) {
                    Route::Local => self.queues.push(self.arena, worker, particle),
                    Route::Remote(_) => {
                        self.exchange
                            .post(self.transport, self.arena, self.stacks, particle, worker)
                    }
                },
            }
        }
        Ok(tally)
    }
}

impl<T: Transport> Context<T> {
    /// Track one batch to global completion.
    ///
    /// Every rank must call this with the same `batch` and equivalent
    /// `source`. On error the rank stops tracking, tells every peer through
    /// the abort stream, flushes its partial sends and returns without
    /// waiting on them. A rank told of a peer's abort returns
    /// [`RunError::PeerAborted`].
    pub fn run_batch<S, K>(
        &mut self,
        batch: u64,
        source: &S,
        tracker: &K,
    ) -> Result<BatchMetrics, RunError>
    where
        S: Source + ?Sized,
        K: Tracker + ?Sized,
    {
        let rank = self.rank();
        let span = tracing::info_span!("batch", %rank, batch);
        let _enter = span.enter();
        let _scope = DiagnosticScope::enter(rank, None);

        let start = Instant::now();
        let (sent0, received0) = self.exchange.counters();
        let mut metrics = BatchMetrics {
            batch,
            ..BatchMetrics::default()
        };
        if let Err(e) = self.track_to_completion(batch, source, tracker, &mut metrics) {
            return Err(self.abort_batch(batch, e));
        }

        let reduce_start = Instant::now();
        for score in &mut self.scores {
            score.reduce(&self.transport, self.config.collective_batch_size);
        }
        metrics.reduce_us = reduce_start.elapsed().as_micros() as u64;

        match self.write_checkpoint(batch) {
            Ok(Some(written)) => tracing::debug!(%rank, batch, written, "bank checkpointed"),
            Ok(None) => {}
            Err(e) => return Err(self.abort_batch(batch, e)),
        }

        let (sent, received) = self.exchange.counters();
        metrics.particles_sent = sent - sent0;
        metrics.particles_received = received - received0;
        metrics.memory_bytes = self.arena.memory_bytes();
        metrics.arena_growths = self.arena.growths();
        metrics.total_us = start.elapsed().as_micros() as u64;
        self.batches_run += 1;
        tracing::info!(
            %rank,
            batch,
            tracked = metrics.tracked,
            rounds = metrics.rounds,
            sent = metrics.particles_sent,
            received = metrics.particles_received,
            total_us = metrics.total_us,
            "batch complete"
        );
        self.last_metrics = Some(metrics.clone());
        Ok(metrics)
    }

    /// Leave a failed batch without waiting on any peer.
    fn abort_batch(&mut self, batch: u64, e: RunError) -> RunError {
        let rank = self.rank();
        match &e {
            RunError::PeerAborted { rank: peer } => {
                tracing::warn!(%rank, batch, %peer, "batch abandoned after peer abort");
            }
            _ => {
                tracing::error!(%rank, batch, error = %e, "batch aborted");
                broadcast_abort(&self.transport);
                self.exchange.flush_partial(&self.transport);
            }
        }
        self.exchange.cleanup(&self.transport, false, false);
        e
    }

    fn track_to_completion<S, K>(
        &mut self,
        batch: u64,
        source: &S,
        tracker: &K,
        metrics: &mut BatchMetrics,
    ) -> Result<(), RunError>
    where
        S: Source + ?Sized,
        K: Tracker + ?Sized,
    {
        metrics.histories_sourced = self.sample_source(batch, source)?;

        let mut detector =
            TerminationDetector::new(self.rank(), self.size(), self.config.termination.clone());
        let backoff = Backoff::new();
        loop {
            metrics.rounds += 1;
            let tracking = Instant::now();
            let tally = if self.queues.total_len() > 0 || !self.common.is_empty() {
                self.track_round(batch, tracker)?
            } else {
                RoundTally::default()
            };
            tally.add_to(metrics);
            metrics.tracking_us += tracking.elapsed().as_micros() as u64;

            let serial = Instant::now();
            let arrived = self.exchange.drain_received(
                &self.transport,
                &self.arena,
                &self.stacks,
                &self.queues,
                SERIAL_WORKER,
            )?;
            self.exchange.cleanup(&self.transport, false, false);
            let idle = self.queues.total_len() == 0 && self.common.is_empty();
            if idle {
                self.exchange.flush_partial(&self.transport);
            }
            let levelled = rebalance(&mut self.queues.balancer(&self.arena));
            metrics.rebalance_moves += levelled.moved as u64;
            {
                let mut window = self.arena.growth_window();
                for &species in &self.config.species {
                    metrics.refilled += self.stacks.refill_if_low(&mut window, species)? as u64;
                }
            }
            for &species in &self.config.species {
                metrics.stack_moves += self.stacks.level(&self.arena, species).moved as u64;
            }
            let (sent, received) = self.exchange.counters();
            let status = LocalStatus {
                idle: idle && self.exchange.pending() == 0,
                sent,
                received,
            };
            let state = detector.poll(&self.transport, status);
            metrics.serial_us += serial.elapsed().as_micros() as u64;
            match state {
                TerminationState::Terminated => break,
                TerminationState::Aborted(peer) => return Err(RunError::PeerAborted { rank: peer }),
                TerminationState::Running | TerminationState::ProbingCompletion => {}
            }
            if tally.tracked == 0 && arrived == 0 {
                backoff.snooze();
            } else {
                backoff.reset();
            }
        }
        metrics.termination_waves = detector.wave();
        self.exchange.finish(&self.transport);
        detector.finish(&self.transport);
        Ok(())
    }

    /// Sample this rank's share of the batch's histories.
    fn sample_source<S: Source + ?Sized>(&self, batch: u64, source: &S) -> Result<u64, RunError> {
        let total = source.histories(batch) as u128;
        let size = self.size() as u128;
        let r = self.rank().0 as u128;
        let first = (total * r / size) as u64;
        let end = (total * (r + 1) / size) as u64;
        for (i, history) in (first..end).enumerate() {
            let sampled = source.sample(batch, history);
            let worker = WorkerId((i % self.workers) as u32);
            let p = self.stacks.take(&self.arena, sampled.species, worker)?;
            sampled.write(&self.arena, p, history);
            match self.exchange.route(&self.arena, p) {
                Route::Remote(_) => {
                    self.exchange
                        .post(&self.transport, &self.arena, &self.stacks, p, worker)
                }
                Route::Local if sampled.multiplicity > 1 => self.common.push(&self.arena, p),
                Route::Local => self.queues.push(&self.arena, worker, p),
            }
        }
        tracing::debug!(rank = %self.rank(), first, end, "source sampled");
        Ok(end - first)
    }

    /// One parallel phase across all workers.
    fn track_round<K: Tracker + ?Sized>(
        &self,
        batch: u64,
        tracker: &K,
    ) -> Result<RoundTally, RunError> {
        let crew = Crew {
            transport: &self.transport,
            arena: &self.arena,
            stacks: &self.stacks,
            queues: &self.queues,
            bank: &self.bank,
            common: &self.common,
            exchange: &self.exchange,
            scores: &self.scores,
            tracker,
            rank: self.rank(),
            batch,
            budget: self.config.round_budget as u64,
        };
        let crew = &crew;
        thread::scope(|s| {
            let mut handles = Vec::with_capacity(self.workers);
            for i in 0..self.workers {
                let name = format!("ember-worker-{}-{i}", crew.rank);
                let handle = thread::Builder::new()
                    .name(name.clone())
                    .spawn_scoped(s, move || crew.run(WorkerId(i as u32)))
                    .map_err(|e| RunError::ThreadSpawnFailed {
                        reason: format!("{name}: {e}"),
                    })?;
                handles.push(handle);
            }
            let mut tally = RoundTally::default();
            let mut failure = None;
            for handle in handles {
                match handle.join() {
                    Ok(Ok(t)) => tally.merge(&t),
                    Ok(Err(e)) => {
                        failure.get_or_insert(e);
                    }
                    // Fatal invariant violations keep unwinding on the rank thread.
                    Err(panic) => std::panic::resume_unwind(panic),
                }
            }
            match failure {
                Some(e) => Err(RunError::Bank(e)),
                None => Ok(tally),
            }
        })
    }
}
