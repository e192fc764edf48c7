//! Per-worker, per-species free-lists of recycled particle records.
//!
//! Each (worker, species) pair owns one arena list headed by a dummy
//! sentinel record. [`ParticleStacks::take`] pops the tail; reaching the
//! sentinel means the buffer was sized too small and is reported as
//! [`BankError::BufferExhausted`]. Records are never freed, only returned
//! with [`ParticleStacks::give`].
//!
//! A worker only ever touches its own lists, so take/give need no lock.
//! Growth ([`ParticleStacks::bulk_allocate`], [`ParticleStacks::refill_if_low`])
//! takes `&mut Arena` and runs between parallel rounds.
//!
//! Records drift between workers: a particle taken on one worker is often
//! given back on another. Between rounds [`ParticleStacks::level`] evens
//! the free-lists with the same algorithm [`rebalance`] uses for work
//! queues, and serial-phase takes use [`ParticleStacks::take_from_richest`].

use std::cmp::Reverse;
use std::sync::atomic::{AtomicUsize, Ordering};

use ember_arena::{list, Arena, ArenaError};
use ember_core::record::{list as header, particle};
use ember_core::{fatal, BankError, Offset, Site, Species, WorkerId};

use crate::rebalance::{rebalance, Rebalance, RebalanceReport};

/// When and by how much [`ParticleStacks::refill_if_low`] tops up.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RefillPolicy {
    /// Refill once any one worker's low-water mark drops below this
    /// fraction of `per_worker`. Default: 0.2.
    pub threshold: f64,
    /// Records added per refill as a fraction of `per_worker * workers`.
    /// Default: 0.2.
    pub fraction: f64,
}

impl Default for RefillPolicy {
    fn default() -> Self {
        Self {
            threshold: 0.2,
            fraction: 0.2,
        }
    }
}

/// Per-worker counters, padded to avoid false sharing.
#[repr(align(128))]
struct WorkerCounters {
    taken: [AtomicUsize; Species::COUNT],
    given: [AtomicUsize; Species::COUNT],
    allocated: [AtomicUsize; Species::COUNT],
    /// Smallest free count seen since the last refill.
    low_water: [AtomicUsize; Species::COUNT],
}

impl WorkerCounters {
    fn new() -> Self {
        Self {
            taken: Default::default(),
            given: Default::default(),
            allocated: Default::default(),
            low_water: Default::default(),
        }
    }
}

/// Free-lists of particle records for every worker and species.
pub struct ParticleStacks {
    workers: usize,
    per_worker: usize,
    refill: RefillPolicy,
    /// Root slot of each free-list, indexed `worker * Species::COUNT + species`.
    roots: Vec<Offset>,
    /// Dummy sentinel heading each free-list, same indexing.
    sentinels: Vec<Offset>,
    counters: Vec<WorkerCounters>,
}

// Compile-time assertion: ParticleStacks must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<ParticleStacks>();
};

impl ParticleStacks {
    /// Create empty free-lists (sentinel only) for `workers` workers.
    ///
    /// `per_worker` is the allocation target per worker and species; it
    /// sizes the refill threshold. Records are added by
    /// [`bulk_allocate`](Self::bulk_allocate). The gate must be open.
    pub fn new(arena: &mut Arena, workers: usize, per_worker: usize, refill: RefillPolicy) -> Self {
        let n = workers * Species::COUNT;
        let base = arena.allocate(n);
        let mut roots = Vec::with_capacity(n);
        let mut sentinels = Vec::with_capacity(n);
        for i in 0..n {
            let root = base + i;
            arena.put_offset(root, None);
            let sentinel = list::new_tail(arena, root, particle::BLOCK_SIZE);
            arena.put(sentinel + particle::SPECIES, Species::ALL[i % Species::COUNT].tag());
            roots.push(root);
            sentinels.push(sentinel);
        }
        Self {
            workers,
            per_worker,
            refill,
            roots,
            sentinels,
            counters: (0..workers).map(|_| WorkerCounters::new()).collect(),
        }
    }

    /// Number of workers served.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Allocation target per worker and species.
    pub fn per_worker(&self) -> usize {
        self.per_worker
    }

    #[inline]
    fn slot(&self, worker: WorkerId, species: Species) -> usize {
        let w = worker.index();
        if w >= self.workers {
            fatal!(
                Site::here("particle-stack"),
                "worker {worker} out of range for {} workers",
                self.workers
            );
        }
        w * Species::COUNT + species.index()
    }

    /// Pop a record from `worker`'s free-list for `species`.
    ///
    /// All payload fields are zeroed, the species tag is rewritten and the
    /// multiplicity is set to one.
    pub fn take(&self, arena: &Arena, species: Species, worker: WorkerId) -> Result<Offset, BankError> {
        let slot = self.slot(worker, species);
        let counters = &self.counters[worker.index()];
        let tail = list::last(arena, self.roots[slot]);
        let record = match tail {
            Some(t) if t != self.sentinels[slot] => t,
            _ => {
                return Err(BankError::BufferExhausted {
                    species,
                    worker,
                    allocated: counters.allocated[species.index()].load(Ordering::Relaxed),
                })
            }
        };
        list::remove(arena, record);
        arena.zero(record + header::HEADER_SIZE, particle::PAYLOAD_LEN);
        arena.put(record + particle::SPECIES, species.tag());
        arena.put(record + particle::MULTIPLICITY, 1.0);
        counters.taken[species.index()].fetch_add(1, Ordering::Relaxed);
        self.note_free(arena, slot, worker, species);
        Ok(record)
    }

    /// Return `record` to `worker`'s free-list for its species.
    pub fn give(&self, arena: &Arena, record: Offset, worker: WorkerId) {
        let species = species_of(arena, record);
        let slot = self.slot(worker, species);
        list::append(arena, self.roots[slot], record);
        self.counters[worker.index()].given[species.index()].fetch_add(1, Ordering::Relaxed);
        self.note_free(arena, slot, worker, species);
    }

    /// Take a fresh record and copy `record`'s payload into it.
    pub fn duplicate(&self, arena: &Arena, record: Offset, worker: WorkerId) -> Result<Offset, BankError> {
        let species = species_of(arena, record);
        let copy = self.take(arena, species, worker)?;
        arena.copy(
            record + header::HEADER_SIZE,
            copy + header::HEADER_SIZE,
            particle::PAYLOAD_LEN,
        );
        Ok(copy)
    }

    fn note_free(&self, arena: &Arena, slot: usize, worker: WorkerId, species: Species) {
        let free = list::count(arena, self.roots[slot]) - 1;
        self.counters[worker.index()].low_water[species.index()].fetch_min(free, Ordering::Relaxed);
    }

    /// Add `count` fresh records for `species`, dealt round-robin across
    /// workers. Performs a single arena growth.
    pub fn bulk_allocate(&self, arena: &mut Arena, species: Species, count: usize) -> Result<(), ArenaError> {
        if count == 0 {
            return Ok(());
        }
        arena.try_preallocate(count * particle::BLOCK_SIZE)?;
        for i in 0..count {
            let worker = WorkerId((i % self.workers) as u32);
            let slot = self.slot(worker, species);
            let record = list::new_tail(arena, self.roots[slot], particle::BLOCK_SIZE);
            arena.put(record + particle::SPECIES, species.tag());
            let counters = &self.counters[worker.index()];
            counters.allocated[species.index()].fetch_add(1, Ordering::Relaxed);
        }
        self.reset_low_water(arena, species);
        tracing::debug!(%species, count, workers = self.workers, "particle stacks grown");
        Ok(())
    }

    /// Top up `species` when some worker's low-water mark has fallen under
    /// the refill threshold. Returns the number of records added.
    pub fn refill_if_low(&self, arena: &mut Arena, species: Species) -> Result<usize, ArenaError> {
        let floor = self.refill.threshold * self.per_worker as f64;
        let starved = self
            .counters
            .iter()
            .map(|c| c.low_water[species.index()].load(Ordering::Relaxed))
            .enumerate()
            .find(|&(_, low)| (low as f64) < floor);
        let Some((worker, low)) = starved else {
            return Ok(0);
        };
        let target = (self.per_worker * self.workers) as f64;
        let add = ((self.refill.fraction * target).ceil() as usize).max(1);
        tracing::debug!(%species, worker, low_water = low, add, "refilling particle stacks");
        self.bulk_allocate(arena, species, add)?;
        Ok(add)
    }

    /// Worker holding the most free records of `species`; the lowest id
    /// wins ties.
    pub fn richest(&self, arena: &Arena, species: Species) -> WorkerId {
        (0..self.workers)
            .map(|w| WorkerId(w as u32))
            .max_by_key(|&w| (self.free_on(arena, species, w), Reverse(w)))
            .unwrap_or(WorkerId(0))
    }

    /// [`take`](Self::take) from the [`richest`](Self::richest) worker.
    ///
    /// Reads every worker's free-list, so only call it while no worker
    /// thread is running.
    pub fn take_from_richest(&self, arena: &Arena, species: Species) -> Result<Offset, BankError> {
        self.take(arena, species, self.richest(arena, species))
    }

    /// Even out the free-lists of `species` across workers and restart the
    /// low-water marks from the new counts. Only call it between rounds.
    pub fn level(&self, arena: &Arena, species: Species) -> RebalanceReport {
        let report = rebalance(&mut StackBalancer {
            stacks: self,
            arena,
            species,
        });
        self.reset_low_water(arena, species);
        report
    }

    fn reset_low_water(&self, arena: &Arena, species: Species) {
        for w in 0..self.workers {
            let worker = WorkerId(w as u32);
            let slot = self.slot(worker, species);
            let free = list::count(arena, self.roots[slot]) - 1;
            self.counters[w].low_water[species.index()].store(free, Ordering::Relaxed);
        }
    }

    /// Records currently on the free-lists of `species`, all workers.
    pub fn free_count(&self, arena: &Arena, species: Species) -> usize {
        (0..self.workers)
            .map(|w| list::count(arena, self.roots[self.slot(WorkerId(w as u32), species)]) - 1)
            .sum()
    }

    /// Free records of `species` on one worker.
    pub fn free_on(&self, arena: &Arena, species: Species, worker: WorkerId) -> usize {
        list::count(arena, self.roots[self.slot(worker, species)]) - 1
    }

    /// Records of `species` ever allocated, all workers.
    pub fn allocated(&self, species: Species) -> usize {
        self.counters
            .iter()
            .map(|c| c.allocated[species.index()].load(Ordering::Relaxed))
            .sum()
    }

    /// Records of `species` taken and not yet given back.
    pub fn outstanding(&self, species: Species) -> usize {
        let (taken, given) = self.counters.iter().fold((0, 0), |(t, g), c| {
            (
                t + c.taken[species.index()].load(Ordering::Relaxed),
                g + c.given[species.index()].load(Ordering::Relaxed),
            )
        });
        taken.saturating_sub(given)
    }

    /// Summed low-water mark of `species` since the last refill.
    pub fn low_water(&self, species: Species) -> usize {
        self.counters
            .iter()
            .map(|c| c.low_water[species.index()].load(Ordering::Relaxed))
            .sum()
    }
}

/// [`Rebalance`] view over one species' free-lists.
struct StackBalancer<'a> {
    stacks: &'a ParticleStacks,
    arena: &'a Arena,
    species: Species,
}

impl Rebalance for StackBalancer<'_> {
    fn queue_count(&self) -> usize {
        self.stacks.workers
    }

    fn queue_len(&self, queue: usize) -> usize {
        self.stacks.free_on(self.arena, self.species, WorkerId(queue as u32))
    }

    fn move_items(&mut self, from: usize, to: usize, n: usize) -> usize {
        let from = self.stacks.slot(WorkerId(from as u32), self.species);
        let to = self.stacks.slot(WorkerId(to as u32), self.species);
        let mut moved = 0;
        while moved < n {
            match list::last(self.arena, self.stacks.roots[from]) {
                Some(record) if record != self.stacks.sentinels[from] => {
                    list::remove(self.arena, record);
                    list::append(self.arena, self.stacks.roots[to], record);
                    moved += 1;
                }
                _ => break,
            }
        }
        moved
    }
}

/// Species recorded in a particle record. Fatal if the tag is not valid.
pub fn species_of(arena: &Arena, record: Offset) -> Species {
    let tag = arena.get(record + particle::SPECIES);
    match Species::from_tag(tag) {
        Some(s) => s,
        None => fatal!(
            Site::here("particle-stack").at(record),
            "record carries invalid species tag {tag}"
        ),
    }
}
