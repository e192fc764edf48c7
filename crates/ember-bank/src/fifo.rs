//! Per-worker FIFO queues of live particles.
//!
//! The same structure serves as the tracking *queue* (particles waiting to
//! be followed) and the *bank* (particles deferred to the next batch); see
//! [`FifoKind`]. Each worker's FIFO is an arena list headed by a dummy
//! record so the list never empties and its common block survives.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use ember_arena::{list, Arena};
use ember_core::record::particle;
use ember_core::{fatal, Offset, Site, WorkerId};

use crate::rebalance::Rebalance;

/// Role of a [`WorkerFifos`] instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FifoKind {
    /// Particles waiting to be tracked in the current batch.
    Queue,
    /// Particles banked for a later batch.
    Bank,
}

impl fmt::Display for FifoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue => write!(f, "queue"),
            Self::Bank => write!(f, "bank"),
        }
    }
}

#[repr(align(128))]
struct PaddedLen(AtomicUsize);

/// One FIFO per worker.
pub struct WorkerFifos {
    kind: FifoKind,
    roots: Vec<Offset>,
    heads: Vec<Offset>,
    lens: Vec<PaddedLen>,
}

// Compile-time assertion: WorkerFifos must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<WorkerFifos>();
};

impl WorkerFifos {
    /// Allocate empty FIFOs for `workers` workers. The gate must be open.
    pub fn new(arena: &mut Arena, kind: FifoKind, workers: usize) -> Self {
        let base = arena.allocate(workers);
        let mut roots = Vec::with_capacity(workers);
        let mut heads = Vec::with_capacity(workers);
        for w in 0..workers {
            let root = base + w;
            arena.put_offset(root, None);
            heads.push(list::new_tail(arena, root, particle::BLOCK_SIZE));
            roots.push(root);
        }
        Self {
            kind,
            roots,
            heads,
            lens: (0..workers).map(|_| PaddedLen(AtomicUsize::new(0))).collect(),
        }
    }

    /// Queue or bank.
    pub fn kind(&self) -> FifoKind {
        self.kind
    }

    /// Number of workers.
    pub fn workers(&self) -> usize {
        self.roots.len()
    }

    fn index(&self, worker: WorkerId) -> usize {
        let w = worker.index();
        if w >= self.roots.len() {
            fatal!(
                Site::here("particle-fifo"),
                "{} worker {worker} out of range for {} workers",
                self.kind,
                self.roots.len()
            );
        }
        w
    }

    /// Enqueue `particle` at the back of `worker`'s FIFO.
    pub fn push(&self, arena: &Arena, worker: WorkerId, particle: Offset) {
        let w = self.index(worker);
        list::append(arena, self.roots[w], particle);
        self.lens[w].0.fetch_add(1, Ordering::Relaxed);
    }

    /// Put `particle` at the front of `worker`'s FIFO.
    pub fn push_front(&self, arena: &Arena, worker: WorkerId, particle: Offset) {
        let w = self.index(worker);
        list::insert_after(arena, self.heads[w], particle);
        self.lens[w].0.fetch_add(1, Ordering::Relaxed);
    }

    /// Dequeue from the front of `worker`'s FIFO.
    pub fn pop(&self, arena: &Arena, worker: WorkerId) -> Option<Offset> {
        let w = self.index(worker);
        let front = list::next(arena, self.heads[w])?;
        list::remove(arena, front);
        self.lens[w].0.fetch_sub(1, Ordering::Relaxed);
        Some(front)
    }

    /// Remove from the back of `worker`'s FIFO.
    fn pop_back(&self, arena: &Arena, w: usize) -> Option<Offset> {
        let back = list::last(arena, self.roots[w]).filter(|&b| b != self.heads[w])?;
        list::remove(arena, back);
        self.lens[w].0.fetch_sub(1, Ordering::Relaxed);
        Some(back)
    }

    /// Items waiting on `worker`.
    pub fn len(&self, worker: WorkerId) -> usize {
        self.lens[self.index(worker)].0.load(Ordering::Relaxed)
    }

    /// Whether `worker`'s FIFO is empty.
    pub fn is_empty(&self, worker: WorkerId) -> bool {
        self.len(worker) == 0
    }

    /// Items waiting across all workers.
    pub fn total_len(&self) -> usize {
        self.lens.iter().map(|l| l.0.load(Ordering::Relaxed)).sum()
    }

    /// Move up to `n` items from the back of `from` to the back of `to`.
    /// Returns the number moved.
    pub fn transfer(&self, arena: &Arena, from: WorkerId, to: WorkerId, n: usize) -> usize {
        let (f, t) = (self.index(from), self.index(to));
        let mut moved = 0;
        while moved < n {
            let Some(item) = self.pop_back(arena, f) else {
                break;
            };
            list::append(arena, self.roots[t], item);
            self.lens[t].0.fetch_add(1, Ordering::Relaxed);
            moved += 1;
        }
        moved
    }

    /// Move every item of `worker` into `dest`'s FIFO for the same worker,
    /// keeping order. Returns the number moved.
    pub fn drain_into(&self, arena: &Arena, worker: WorkerId, dest: &WorkerFifos) -> usize {
        let mut moved = 0;
        while let Some(item) = self.pop(arena, worker) {
            dest.push(arena, worker, item);
            moved += 1;
        }
        moved
    }

    /// Items of `worker`'s FIFO, front to back.
    pub fn items(&self, arena: &Arena, worker: WorkerId) -> Vec<Offset> {
        let w = self.index(worker);
        list::iter(arena, self.roots[w]).skip(1).collect()
    }

    /// View for [`rebalance`](crate::rebalance::rebalance).
    pub fn balancer<'a>(&'a self, arena: &'a Arena) -> FifoBalancer<'a> {
        FifoBalancer { fifos: self, arena }
    }
}

/// [`Rebalance`] adapter over a [`WorkerFifos`].
pub struct FifoBalancer<'a> {
    fifos: &'a WorkerFifos,
    arena: &'a Arena,
}

impl Rebalance for FifoBalancer<'_> {
    fn queue_count(&self) -> usize {
        self.fifos.workers()
    }

    fn queue_len(&self, queue: usize) -> usize {
        self.fifos.len(WorkerId(queue as u32))
    }

    fn move_items(&mut self, from: usize, to: usize, n: usize) -> usize {
        self.fifos
            .transfer(self.arena, WorkerId(from as u32), WorkerId(to as u32), n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::{ParticleStacks, RefillPolicy};
    use ember_arena::ArenaConfig;
    use ember_core::Species;

    fn setup(workers: usize) -> (Arena, ParticleStacks, WorkerFifos) {
        let mut arena = Arena::new(&ArenaConfig::default()).unwrap();
        let (stacks, fifos) = {
            let mut w = arena.growth_window();
            let stacks = ParticleStacks::new(&mut w, workers, 16, RefillPolicy::default());
            stacks.bulk_allocate(&mut w, Species::Neutron, workers * 16).unwrap();
            let fifos = WorkerFifos::new(&mut w, FifoKind::Queue, workers);
            (stacks, fifos)
        };
        (arena, stacks, fifos)
    }

    fn tagged(arena: &Arena, stacks: &ParticleStacks, worker: u32, tag: f64) -> Offset {
        let p = stacks.take(arena, Species::Neutron, WorkerId(worker)).unwrap();
        arena.put(p + particle::HISTORY, tag);
        p
    }

    fn tags(arena: &Arena, fifos: &WorkerFifos, worker: u32) -> Vec<f64> {
        fifos
            .items(arena, WorkerId(worker))
            .into_iter()
            .map(|p| arena.get(p + particle::HISTORY))
            .collect()
    }

    #[test]
    fn fifo_order() {
        let (arena, stacks, fifos) = setup(1);
        for i in 0..3 {
            let p = tagged(&arena, &stacks, 0, i as f64);
            fifos.push(&arena, WorkerId(0), p);
        }
        assert_eq!(fifos.len(WorkerId(0)), 3);
        let first = fifos.pop(&arena, WorkerId(0)).unwrap();
        assert_eq!(arena.get(first + particle::HISTORY), 0.0);
        fifos.push_front(&arena, WorkerId(0), first);
        assert_eq!(tags(&arena, &fifos, 0), vec![0.0, 1.0, 2.0]);
        while fifos.pop(&arena, WorkerId(0)).is_some() {}
        assert!(fifos.is_empty(WorkerId(0)));
        assert_eq!(fifos.pop(&arena, WorkerId(0)), None);
    }

    #[test]
    fn transfer_moves_from_back() {
        let (arena, stacks, fifos) = setup(2);
        for i in 0..5 {
            let p = tagged(&arena, &stacks, 0, i as f64);
            fifos.push(&arena, WorkerId(0), p);
        }
        let moved = fifos.transfer(&arena, WorkerId(0), WorkerId(1), 2);
        assert_eq!(moved, 2);
        assert_eq!(tags(&arena, &fifos, 0), vec![0.0, 1.0, 2.0]);
        assert_eq!(tags(&arena, &fifos, 1), vec![4.0, 3.0]);
        assert_eq!(fifos.transfer(&arena, WorkerId(1), WorkerId(0), 10), 2);
        assert_eq!(fifos.total_len(), 5);
    }

    #[test]
    fn drain_into_keeps_order() {
        let (mut arena, stacks, queue) = setup(1);
        let bank = WorkerFifos::new(&mut arena.growth_window(), FifoKind::Bank, 1);
        for i in 0..3 {
            let p = tagged(&arena, &stacks, 0, i as f64);
            bank.push(&arena, WorkerId(0), p);
        }
        assert_eq!(bank.drain_into(&arena, WorkerId(0), &queue), 3);
        assert_eq!(bank.total_len(), 0);
        assert_eq!(tags(&arena, &queue, 0), vec![0.0, 1.0, 2.0]);
    }
}
