//! A particle's life across stacks, queues and the rebalancer.

use ember_arena::{Arena, ArenaConfig};
use ember_bank::{rebalance, FifoKind, ParticleStacks, RefillPolicy, WorkerFifos};
use ember_core::record::particle;
use ember_core::{Species, WorkerId};

struct Rank {
    arena: Arena,
    stacks: ParticleStacks,
    queues: WorkerFifos,
}

fn rank(workers: usize, per_worker: usize) -> Rank {
    let mut arena = Arena::new(&ArenaConfig::default()).unwrap();
    let (stacks, queues) = {
        let mut w = arena.growth_window();
        let stacks = ParticleStacks::new(&mut w, workers, per_worker, RefillPolicy::default());
        for species in Species::ALL {
            stacks
                .bulk_allocate(&mut w, species, workers * per_worker)
                .unwrap();
        }
        let queues = WorkerFifos::new(&mut w, FifoKind::Queue, workers);
        (stacks, queues)
    };
    Rank {
        arena,
        stacks,
        queues,
    }
}

#[test]
fn rebalanced_queues_track_to_completion() {
    let r = rank(4, 32);
    let sizes = [10usize, 2, 7, 5];
    for (w, &n) in sizes.iter().enumerate() {
        for h in 0..n {
            let p = r
                .stacks
                .take(&r.arena, Species::Neutron, WorkerId(w as u32))
                .unwrap();
            r.arena.put(p + particle::HISTORY, (w * 100 + h) as f64);
            r.queues.push(&r.arena, WorkerId(w as u32), p);
        }
    }

    let report = rebalance(&mut r.queues.balancer(&r.arena));
    assert!(report.transfers > 0);
    for w in 0..4 {
        let len = r.queues.len(WorkerId(w));
        assert!(len == 6 || len == 7, "worker {w} holds {len}");
    }
    assert_eq!(r.queues.total_len(), 24);

    // Every history is still present exactly once.
    let mut histories: Vec<u64> = (0..4)
        .flat_map(|w| r.queues.items(&r.arena, WorkerId(w)))
        .map(|p| r.arena.get(p + particle::HISTORY) as u64)
        .collect();
    histories.sort_unstable();
    histories.dedup();
    assert_eq!(histories.len(), 24);

    // Workers drain their queues concurrently and recycle the records.
    std::thread::scope(|s| {
        for w in 0..4u32 {
            let r = &r;
            s.spawn(move || {
                while let Some(p) = r.queues.pop(&r.arena, WorkerId(w)) {
                    r.stacks.give(&r.arena, p, WorkerId(w));
                }
            });
        }
    });
    assert_eq!(r.queues.total_len(), 0);
    assert_eq!(r.stacks.outstanding(Species::Neutron), 0);
    assert_eq!(r.stacks.free_count(&r.arena, Species::Neutron), 4 * 32);
}

#[test]
fn stacks_recover_after_refill() {
    let mut r = rank(2, 5);
    let mut held = Vec::new();
    while let Ok(p) = r.stacks.take(&r.arena, Species::Photon, WorkerId(0)) {
        held.push(p);
    }
    assert_eq!(held.len(), 5);
    for _ in 0..4 {
        held.push(r.stacks.take(&r.arena, Species::Photon, WorkerId(1)).unwrap());
    }
    // Summed low-water mark is 1, under 20% of 10.
    let added = r
        .stacks
        .refill_if_low(&mut r.arena.growth_window(), Species::Photon)
        .unwrap();
    assert_eq!(added, 2);
    assert!(r.stacks.take(&r.arena, Species::Photon, WorkerId(0)).is_ok());
}
