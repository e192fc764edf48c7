//! Benchmark profiles for the Ember transport core.
//!
//! - [`bench_world`]: an arena with preallocated stacks and worker FIFOs
//! - [`reference_config`]: run configuration for whole-batch benchmarks

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use ember_arena::{Arena, ArenaConfig};
use ember_bank::{FifoKind, ParticleStacks, RefillPolicy, WorkerFifos};
use ember_core::Species;
use ember_engine::RunConfig;

/// Arena, stacks and queues sized for `workers * per_worker` neutrons.
pub struct BenchWorld {
    /// Backing arena.
    pub arena: Arena,
    /// Neutron free-lists.
    pub stacks: ParticleStacks,
    /// Per-worker tracking queues.
    pub queues: WorkerFifos,
}

/// Build a [`BenchWorld`].
pub fn bench_world(workers: usize, per_worker: usize) -> BenchWorld {
    let mut arena = match Arena::new(&ArenaConfig::default()) {
        Ok(a) => a,
        Err(e) => panic!("bench arena: {e}"),
    };
    let (stacks, queues) = {
        let mut window = arena.growth_window();
        let stacks = ParticleStacks::new(&mut window, workers, per_worker, RefillPolicy::default());
        if let Err(e) = stacks.bulk_allocate(&mut window, Species::Neutron, workers * per_worker) {
            panic!("bench stacks: {e}");
        }
        let queues = WorkerFifos::new(&mut window, FifoKind::Queue, workers);
        (stacks, queues)
    };
    BenchWorld {
        arena,
        stacks,
        queues,
    }
}

/// Run configuration used by the whole-batch benchmark.
///
/// Four workers, 16K neutrons each, 100-particle migration messages.
pub fn reference_config() -> RunConfig {
    RunConfig {
        workers: Some(4),
        particles_per_worker: 1 << 14,
        dd_batch_size: 100,
        round_budget: 4096,
        ..RunConfig::default()
    }
}
