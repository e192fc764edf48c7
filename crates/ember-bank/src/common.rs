//! Shared multi-producer queue with multiplicity splitting.
//!
//! Sources that emit one entry standing for many identical histories push
//! it here with a `MULTIPLICITY` above one. [`CommonQueue::pop_for`] hands
//! each polling worker at most one copy per call, so a single heavy entry
//! is spread across the pool instead of serialising on one worker.

use std::sync::Mutex;

use ember_arena::{list, Arena};
use ember_core::record::particle;
use ember_core::{BankError, Offset, WorkerId};

use crate::stack::ParticleStacks;

struct Shared {
    len: usize,
    splits: u64,
}

/// Mutex-guarded FIFO shared by all workers of a rank.
pub struct CommonQueue {
    root: Offset,
    head: Offset,
    workers: usize,
    shared: Mutex<Shared>,
}

// Compile-time assertion: CommonQueue must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<CommonQueue>();
};

impl CommonQueue {
    /// Allocate an empty queue serving `workers` workers. The gate must be open.
    pub fn new(arena: &mut Arena, workers: usize) -> Self {
        let root = arena.allocate(1);
        arena.put_offset(root, None);
        let head = list::new_tail(arena, root, particle::BLOCK_SIZE);
        Self {
            root,
            head,
            workers,
            shared: Mutex::new(Shared { len: 0, splits: 0 }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        // A poisoned lock means a worker panicked on an internal error;
        // the list itself is still consistent up to that point.
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue `particle` at the back.
    pub fn push(&self, arena: &Arena, particle: Offset) {
        let mut shared = self.lock();
        list::append(arena, self.root, particle);
        shared.len += 1;
    }

    /// Pop work for `worker`.
    ///
    /// If the front entry's multiplicity exceeds the worker count, the
    /// caller receives a duplicate with multiplicity one and the original
    /// stays at the front with its multiplicity decremented. Otherwise the
    /// entry itself is removed and returned.
    pub fn pop_for(
        &self,
        arena: &Arena,
        stacks: &ParticleStacks,
        worker: WorkerId,
    ) -> Result<Option<Offset>, BankError> {
        let mut shared = self.lock();
        let Some(front) = list::next(arena, self.head) else {
            return Ok(None);
        };
        let multiplicity = arena.get(front + particle::MULTIPLICITY);
        if multiplicity > self.workers as f64 {
            let copy = stacks.duplicate(arena, front, worker)?;
            arena.put(copy + particle::MULTIPLICITY, 1.0);
            arena.put(front + particle::MULTIPLICITY, multiplicity - 1.0);
            shared.splits += 1;
            return Ok(Some(copy));
        }
        list::remove(arena, front);
        shared.len -= 1;
        Ok(Some(front))
    }

    /// Entries waiting (a split entry counts once).
    pub fn len(&self) -> usize {
        self.lock().len
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of duplicates handed out by splitting.
    pub fn splits(&self) -> u64 {
        self.lock().splits
    }
}
