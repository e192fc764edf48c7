//! The explicitly constructed world of one rank.
//!
//! A [`Context`] owns everything a rank needs to track particles: the
//! arena and the structures laid out in it, the domain exchange, score
//! buffers and the optional checkpoint writer. It is built from a
//! [`RunConfig`] and a [`Transport`]; there is no global state.
//!
//! ```no_run
//! use ember_domain::ChannelTransport;
//! use ember_engine::{Context, RunConfig};
//!
//! let transport = ChannelTransport::cluster(1).pop().unwrap();
//! let ctx = Context::new(RunConfig::default(), transport).unwrap();
//! assert_eq!(ctx.bank_len(), 0);
//! let report = ctx.shutdown().unwrap();
//! assert_eq!(report.batches_run, 0);
//! ```

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use ember_arena::Arena;
use ember_bank::{CommonQueue, FifoKind, ParticleStacks, WorkerFifos};
use ember_checkpoint::{CheckpointReader, CheckpointWriter};
use ember_core::record::{list as header, particle};
use ember_core::{DiagnosticScope, RankId, Species, WorkerId};
use ember_domain::{DomainExchange, ExchangeStats, Route, Transport};

use crate::config::RunConfig;
use crate::error::RunError;
use crate::metrics::BatchMetrics;
use crate::scores::{ScoreBuffer, ScoreId};

/// Summary returned by [`Context::shutdown`].
#[derive(Clone, Debug, PartialEq)]
pub struct ShutdownReport {
    /// Batches completed.
    pub batches_run: u64,
    /// Cumulative migration counters.
    pub exchange: ExchangeStats,
    /// Arena size at shutdown, in bytes.
    pub memory_bytes: usize,
    /// Arena growth events over the context's lifetime.
    pub arena_growths: u64,
    /// Sites left in the bank.
    pub banked: usize,
    /// Records taken from the stacks and not given back, all species.
    pub live_records: usize,
}

/// One rank's tracking world.
pub struct Context<T: Transport> {
    pub(crate) config: RunConfig,
    pub(crate) workers: usize,
    pub(crate) transport: T,
    pub(crate) arena: Arena,
    pub(crate) stacks: ParticleStacks,
    pub(crate) queues: WorkerFifos,
    pub(crate) bank: WorkerFifos,
    pub(crate) common: CommonQueue,
    pub(crate) exchange: DomainExchange,
    pub(crate) scores: Vec<ScoreBuffer>,
    pub(crate) checkpoint: Option<CheckpointWriter<BufWriter<File>>>,
    pub(crate) batches_run: u64,
    pub(crate) last_metrics: Option<BatchMetrics>,
}

// Compile-time assertion: worker threads borrow the context.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<Context<ember_domain::ChannelTransport>>();
};

impl<T: Transport> Context<T> {
    /// Validate `config`, lay out the arena and preallocate every
    /// configured species' stacks.
    pub fn new(config: RunConfig, transport: T) -> Result<Self, RunError> {
        config.validate()?;
        let rank = transport.rank();
        let size = transport.size();
        let _scope = DiagnosticScope::enter(rank, None);
        let workers = config.resolved_worker_count();

        let mut arena = Arena::new(&config.arena)?;
        let (stacks, queues, bank, common) = {
            let mut window = arena.growth_window();
            let stacks = ParticleStacks::new(
                &mut window,
                workers,
                config.particles_per_worker,
                config.refill_policy(),
            );
            for &species in &config.species {
                stacks.bulk_allocate(&mut window, species, config.particles_per_worker * workers)?;
            }
            let queues = WorkerFifos::new(&mut window, FifoKind::Queue, workers);
            let bank = WorkerFifos::new(&mut window, FifoKind::Bank, workers);
            let common = CommonQueue::new(&mut window, workers);
            (stacks, queues, bank, common)
        };
        let exchange = DomainExchange::new(rank, size, config.dd_batch_size);
        let checkpoint = config
            .checkpoint
            .as_ref()
            .map(CheckpointWriter::append)
            .transpose()?;

        tracing::info!(
            %rank,
            size,
            workers,
            memory_bytes = arena.memory_bytes(),
            "context ready"
        );
        Ok(Self {
            config,
            workers,
            transport,
            arena,
            stacks,
            queues,
            bank,
            common,
            exchange,
            scores: Vec::new(),
            checkpoint,
            batches_run: 0,
            last_metrics: None,
        })
    }

    /// This rank.
    pub fn rank(&self) -> RankId {
        self.transport.rank()
    }

    /// Number of ranks.
    pub fn size(&self) -> usize {
        self.transport.size()
    }

    /// Worker threads per round.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// The configuration the context was built from.
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The arena.
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// Particle free-lists.
    pub fn stacks(&self) -> &ParticleStacks {
        &self.stacks
    }

    /// Per-worker tracking queues.
    pub fn queues(&self) -> &WorkerFifos {
        &self.queues
    }

    /// Per-worker banks of next-generation sites.
    pub fn bank(&self) -> &WorkerFifos {
        &self.bank
    }

    /// Shared queue for entries with multiplicity above one.
    pub fn common(&self) -> &CommonQueue {
        &self.common
    }

    /// Migration state.
    pub fn exchange(&self) -> &DomainExchange {
        &self.exchange
    }

    /// Batches completed so far.
    pub fn batches_run(&self) -> u64 {
        self.batches_run
    }

    /// Metrics of the most recent batch.
    pub fn last_metrics(&self) -> Option<&BatchMetrics> {
        self.last_metrics.as_ref()
    }

    /// Register a score buffer of shape `dims`.
    ///
    /// Every rank must register the same buffers in the same order.
    pub fn add_score(&mut self, name: impl Into<String>, dims: &[usize]) -> ScoreId {
        self.scores
            .push(ScoreBuffer::new(name, dims, self.workers));
        ScoreId(self.scores.len() - 1)
    }

    /// A registered score buffer.
    pub fn score(&self, id: ScoreId) -> Option<&ScoreBuffer> {
        self.scores.get(id.0)
    }

    /// Sites waiting in the bank, all workers.
    pub fn bank_len(&self) -> usize {
        self.bank.total_len()
    }

    /// Move every banked site back into tracking.
    ///
    /// Sites in the local domain go onto the same worker's queue; others
    /// are posted to their owner and arrive during the next batch.
    pub fn requeue_bank(&self) -> usize {
        let mut moved = 0;
        for w in 0..self.workers {
            let worker = WorkerId(w as u32);
            while let Some(site) = self.bank.pop(&self.arena, worker) {
                match self.exchange.route(&self.arena, site) {
                    Route::Local => self.queues.push(&self.arena, worker, site),
                    Route::Remote(_) => {
                        self.exchange
                            .post(&self.transport, &self.arena, &self.stacks, site, worker)
                    }
                }
                moved += 1;
            }
        }
        tracing::debug!(rank = %self.rank(), moved, "bank requeued");
        moved
    }

    /// Discard every banked site, returning the records to the stacks.
    pub fn release_bank(&self) -> usize {
        let mut released = 0;
        for w in 0..self.workers {
            let worker = WorkerId(w as u32);
            while let Some(site) = self.bank.pop(&self.arena, worker) {
                self.stacks.give(&self.arena, site, worker);
                released += 1;
            }
        }
        if released == 0 {
            tracing::warn!(rank = %self.rank(), "release of an empty bank");
        }
        released
    }

    /// Append the bank to the checkpoint file as `batch`.
    ///
    /// Returns the number of particles written, or `None` when no
    /// checkpoint is configured.
    pub fn write_checkpoint(&mut self, batch: u64) -> Result<Option<usize>, RunError> {
        let Some(writer) = self.checkpoint.as_mut() else {
            return Ok(None);
        };
        let mut payloads = Vec::with_capacity(self.bank.total_len() * particle::PAYLOAD_LEN);
        let mut buf = [0.0; particle::PAYLOAD_LEN];
        for w in 0..self.workers {
            for site in self.bank.items(&self.arena, WorkerId(w as u32)) {
                self.arena.read_into(site + header::HEADER_SIZE, &mut buf);
                payloads.extend_from_slice(&buf);
            }
        }
        writer.write_batch(batch as i64, &payloads)?;
        writer.flush()?;
        Ok(Some(payloads.len() / particle::PAYLOAD_LEN))
    }

    /// Load the last batch of a checkpoint file into the bank.
    ///
    /// Returns the number of sites restored.
    pub fn restore(&mut self, path: impl AsRef<Path>) -> Result<usize, RunError> {
        let mut last = None;
        for batch in CheckpointReader::open(path)?.batches() {
            last = Some(batch?);
        }
        let Some(batch) = last else {
            return Ok(0);
        };
        let mut restored = 0;
        for (i, payload) in batch.particles(particle::PAYLOAD_LEN).enumerate() {
            let tag = payload[particle::SPECIES - header::HEADER_SIZE];
            let Some(species) = Species::from_tag(tag) else {
                return Err(RunError::Restore {
                    reason: format!(
                        "particle {i} of batch {} has invalid species tag {tag}",
                        batch.batch
                    ),
                });
            };
            let worker = WorkerId((i % self.workers) as u32);
            let site = self.stacks.take(&self.arena, species, worker)?;
            self.arena.write_from(site + header::HEADER_SIZE, payload);
            self.bank.push(&self.arena, worker, site);
            restored += 1;
        }
        tracing::info!(rank = %self.rank(), batch = batch.batch, restored, "bank restored");
        Ok(restored)
    }

    /// Complete outstanding sends, flush the checkpoint and report.
    pub fn shutdown(mut self) -> Result<ShutdownReport, RunError> {
        let _scope = DiagnosticScope::enter(self.rank(), None);
        self.exchange.finish(&self.transport);
        if let Some(writer) = self.checkpoint.as_mut() {
            writer.flush()?;
        }
        let report = ShutdownReport {
            batches_run: self.batches_run,
            exchange: self.exchange.stats(),
            memory_bytes: self.arena.memory_bytes(),
            arena_growths: self.arena.growths(),
            banked: self.bank.total_len(),
            live_records: Species::ALL
                .iter()
                .map(|&s| self.stacks.outstanding(s))
                .sum(),
        };
        tracing::info!(rank = %self.rank(), ?report, "context shut down");
        Ok(report)
    }
}
