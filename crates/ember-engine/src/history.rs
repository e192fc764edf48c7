//! Collaborator traits and the per-history handle.
//!
//! Physics and geometry live outside this crate. The engine drives them
//! through two traits:
//!
//! - [`Source`] samples the starting particles of a batch.
//! - [`Tracker`] follows one particle until something happens to it and
//!   reports the outcome as a [`Fate`].
//!
//! A tracker sees the particle through a [`History`], which exposes the
//! record fields and the operations that create new particles (secondaries,
//! splits, bank sites) on the calling worker's own structures.

use ember_arena::Arena;
use ember_bank::{species_of, ParticleStacks, WorkerFifos};
use ember_core::record::particle;
use ember_core::{fatal, BankError, DomainId, Offset, RankId, Site, Species, WorkerId};

use crate::scores::{ScoreBuffer, ScoreId};

/// What happened to a tracked particle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fate {
    /// Absorbed; the record is recycled.
    Absorbed,
    /// Left the geometry; the record is recycled.
    Leaked,
    /// Stopped at a domain boundary or event and must be tracked again.
    ///
    /// The engine routes it by its `DOMAIN` field: back onto the worker's
    /// queue when local, to the owning rank otherwise.
    Moved,
    /// Stored in the bank for the next generation.
    Banked,
}

/// A particle drawn from a [`Source`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SourceParticle {
    /// Species of the particle.
    pub species: Species,
    /// Domain the starting position lies in.
    pub domain: DomainId,
    /// Position `(x, y, z)`.
    pub position: [f64; 3],
    /// Direction cosines `(u, v, w)`.
    pub direction: [f64; 3],
    /// Kinetic energy.
    pub energy: f64,
    /// Statistical weight.
    pub weight: f64,
    /// Identical histories this entry stands for. Entries above one go
    /// through the shared common queue and are split among workers.
    pub multiplicity: u32,
}

impl SourceParticle {
    /// Write the sampled state into a freshly taken record.
    pub(crate) fn write(&self, arena: &Arena, record: Offset, history: u64) {
        arena.put(record + particle::DOMAIN, self.domain.field());
        arena.put(record + particle::MULTIPLICITY, self.multiplicity.max(1) as f64);
        let [x, y, z] = self.position;
        let [u, v, w] = self.direction;
        for (field, value) in [
            (particle::X, x),
            (particle::Y, y),
            (particle::Z, z),
            (particle::U, u),
            (particle::V, v),
            (particle::W, w),
            (particle::ENERGY, self.energy),
            (particle::WEIGHT, self.weight),
            (particle::HISTORY, history as f64),
        ] {
            arena.put(record + field, value);
        }
    }
}

/// Samples the starting particles of each batch.
///
/// Histories `0..histories(batch)` are split evenly across ranks; each
/// rank samples its own share. `sample` must be deterministic in
/// `(batch, history)` so results do not depend on the rank count.
pub trait Source: Sync {
    /// Total histories started in `batch`, over all ranks.
    fn histories(&self, batch: u64) -> u64;

    /// Sample history `history` of `batch`.
    fn sample(&self, batch: u64, history: u64) -> SourceParticle;
}

/// Follows one particle to its next event.
///
/// Called concurrently from every worker thread of a rank.
pub trait Tracker: Sync {
    /// Track the particle in `history` and report what became of it.
    ///
    /// A `BankError` from creating secondaries aborts the batch.
    fn track(&self, history: &mut History<'_>) -> Result<Fate, BankError>;
}

/// A tracker's view of the particle it is following.
pub struct History<'a> {
    pub(crate) arena: &'a Arena,
    pub(crate) stacks: &'a ParticleStacks,
    pub(crate) queues: &'a WorkerFifos,
    pub(crate) bank: &'a WorkerFifos,
    pub(crate) scores: &'a [ScoreBuffer],
    pub(crate) rank: RankId,
    pub(crate) worker: WorkerId,
    pub(crate) batch: u64,
    pub(crate) particle: Offset,
    pub(crate) emitted: u64,
    pub(crate) banked: u64,
}

impl<'a> History<'a> {
    /// Offset of the particle record.
    pub fn particle(&self) -> Offset {
        self.particle
    }

    /// Species of the particle.
    pub fn species(&self) -> Species {
        species_of(self.arena, self.particle)
    }

    /// Read a field of the particle record, e.g. [`particle::ENERGY`].
    pub fn get(&self, field: usize) -> f64 {
        self.arena.get(self.particle + field)
    }

    /// Write a field of the particle record.
    pub fn put(&self, field: usize, value: f64) {
        self.arena.put(self.particle + field, value);
    }

    /// Move the particle into `domain`.
    pub fn set_domain(&self, domain: DomainId) {
        self.put(particle::DOMAIN, domain.field());
    }

    /// Domain recorded on the particle. Fatal if the field is not a domain.
    pub fn domain(&self) -> DomainId {
        let field = self.get(particle::DOMAIN);
        match DomainId::from_field(field) {
            Some(d) => d,
            None => fatal!(
                Site::here("history").at(self.particle),
                "particle carries invalid domain {field}"
            ),
        }
    }

    /// The arena, for collaborators that address records directly.
    pub fn arena(&self) -> &'a Arena {
        self.arena
    }

    /// Rank tracking this history.
    pub fn rank(&self) -> RankId {
        self.rank
    }

    /// Worker tracking this history.
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Batch index.
    pub fn batch(&self) -> u64 {
        self.batch
    }

    /// Create a secondary of `species` at the particle's position and put
    /// it on this worker's queue. The caller fills in direction and energy.
    pub fn emit(&mut self, species: Species) -> Result<Offset, BankError> {
        let secondary = self.stacks.take(self.arena, species, self.worker)?;
        self.inherit(secondary, 0.0);
        self.queues.push(self.arena, self.worker, secondary);
        self.emitted += 1;
        Ok(secondary)
    }

    /// Queue an exact copy of the particle (splitting).
    pub fn duplicate(&mut self) -> Result<Offset, BankError> {
        let copy = self.stacks.duplicate(self.arena, self.particle, self.worker)?;
        self.queues.push(self.arena, self.worker, copy);
        self.emitted += 1;
        Ok(copy)
    }

    /// Store a site of `species` for the next generation at the particle's
    /// position. The caller fills in direction and energy.
    pub fn bank(&mut self, species: Species) -> Result<Offset, BankError> {
        let site = self.stacks.take(self.arena, species, self.worker)?;
        self.inherit(site, 1.0);
        self.bank.push(self.arena, self.worker, site);
        self.banked += 1;
        Ok(site)
    }

    fn inherit(&self, child: Offset, generation_step: f64) {
        let a = self.arena;
        for field in [
            particle::DOMAIN,
            particle::X,
            particle::Y,
            particle::Z,
            particle::WEIGHT,
            particle::TIME,
            particle::HISTORY,
        ] {
            a.put(child + field, a.get(self.particle + field));
        }
        a.put(
            child + particle::GENERATION,
            a.get(self.particle + particle::GENERATION) + generation_step,
        );
    }

    /// Add `value * weight` to bin `bins` of score `id`.
    pub fn score(&self, id: ScoreId, value: f64, weight: f64, bins: &[usize]) {
        match self.scores.get(id.0) {
            Some(buffer) => buffer.add_score(self.worker, value, weight, bins),
            None => fatal!(
                Site::here("score"),
                "score id {} not registered ({} buffers)",
                id.0,
                self.scores.len()
            ),
        }
    }
}
