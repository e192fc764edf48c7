//! Two ranks random-walk particles across their shared boundary until
//! every particle is absorbed, then check nothing was lost or duplicated.

use ember_arena::{Arena, ArenaConfig};
use ember_bank::{FifoKind, ParticleStacks, RefillPolicy, WorkerFifos};
use ember_core::record::particle;
use ember_core::{RankId, Species, WorkerId};
use ember_domain::{
    ChannelTransport, DomainExchange, LocalStatus, Route, TerminationConfig, TerminationDetector,
    TerminationState, Transport,
};
use rand_chacha::rand_core::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

const SOURCE_PARTICLES: usize = 500;
const W0: WorkerId = WorkerId(0);

struct RankOutcome {
    absorbed: usize,
    sent: u64,
    received: u64,
    outstanding_records: usize,
}

fn uniform(rng: &mut ChaCha8Rng) -> f64 {
    (rng.next_u64() >> 11) as f64 / (1u64 << 53) as f64
}

fn run_rank(transport: &ChannelTransport, batch: usize, seed: u64) -> RankOutcome {
    let rank = transport.rank();
    let size = transport.size();
    let mut arena = Arena::new(&ArenaConfig::default()).unwrap();
    let (stacks, queue) = {
        let mut w = arena.growth_window();
        let stacks = ParticleStacks::new(&mut w, 1, 2048, RefillPolicy::default());
        stacks.bulk_allocate(&mut w, Species::Neutron, 2048).unwrap();
        let queue = WorkerFifos::new(&mut w, FifoKind::Queue, 1);
        (stacks, queue)
    };
    let exchange = DomainExchange::new(rank, size, batch);
    let mut detector = TerminationDetector::new(rank, size, TerminationConfig::default());
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    if rank.is_root() {
        for h in 0..SOURCE_PARTICLES {
            let p = stacks.take(&arena, Species::Neutron, W0).unwrap();
            arena.put(p + particle::HISTORY, h as f64);
            arena.put(p + particle::DOMAIN, 0.0);
            queue.push(&arena, W0, p);
        }
    }

    let mut absorbed = 0;
    loop {
        for _ in 0..16 {
            let Some(p) = queue.pop(&arena, W0) else {
                break;
            };
            if uniform(&mut rng) < 0.3 {
                stacks.give(&arena, p, W0);
                absorbed += 1;
                continue;
            }
            let domain = (rng.next_u64() % size as u64) as f64;
            arena.put(p + particle::DOMAIN, domain);
            match exchange.route(&arena, p) {
                Route::Local => queue.push(&arena, W0, p),
                Route::Remote(_) => exchange.post(transport, &arena, &stacks, p, W0),
            }
        }
        exchange
            .drain_received(transport, &arena, &stacks, &queue, W0)
            .unwrap();
        exchange.cleanup(transport, false, false);
        if queue.total_len() == 0 {
            exchange.flush_partial(transport);
        }
        let (sent, received) = exchange.counters();
        let status = LocalStatus {
            idle: queue.total_len() == 0 && exchange.pending() == 0,
            sent,
            received,
        };
        if detector.poll(transport, status) == TerminationState::Terminated {
            break;
        }
    }

    exchange.finish(transport);
    detector.finish(transport);
    let (sent, received) = exchange.counters();
    RankOutcome {
        absorbed,
        sent,
        received,
        outstanding_records: stacks.outstanding(Species::Neutron),
    }
}

fn run_cluster(ranks: usize, batch: usize) -> Vec<RankOutcome> {
    let cluster = ChannelTransport::cluster(ranks);
    std::thread::scope(|s| {
        let handles: Vec<_> = cluster
            .iter()
            .map(|t| s.spawn(move || run_rank(t, batch, 0x5eed + u64::from(t.rank().0))))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

#[test]
fn two_rank_migration_conserves_particles() {
    let outcomes = run_cluster(2, 8);
    let absorbed: usize = outcomes.iter().map(|o| o.absorbed).sum();
    assert_eq!(absorbed, SOURCE_PARTICLES);
    let sent: u64 = outcomes.iter().map(|o| o.sent).sum();
    let received: u64 = outcomes.iter().map(|o| o.received).sum();
    assert_eq!(sent, received);
    assert!(sent > 0, "no particle ever crossed the boundary");
    for o in &outcomes {
        assert_eq!(o.outstanding_records, 0);
    }
}

#[test]
fn migration_with_single_particle_batches_and_more_ranks() {
    let outcomes = run_cluster(5, 1);
    let absorbed: usize = outcomes.iter().map(|o| o.absorbed).sum();
    assert_eq!(absorbed, SOURCE_PARTICLES);
    assert!(outcomes.iter().all(|o| o.outstanding_records == 0));
    assert_eq!(RankId(4).parent(), Some(RankId(1)));
}
