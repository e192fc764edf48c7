//! Reusable source and tracker fixtures.
//!
//! - [`PointSource`]: histories spread round-robin over domains.
//! - [`RandomWalkTracker`]: absorbs, leaks, banks or hops to a random
//!   domain at each event, seeded per (batch, history, event).
//! - [`CountingTracker`]: absorbs everything and counts calls.

use std::sync::atomic::{AtomicU64, Ordering};

use ember_core::record::particle;
use ember_core::{BankError, DomainId, Species};
use ember_domain::{ChannelTransport, Transport};
use ember_engine::{Fate, History, RunConfig, ScoreId, Source, SourceParticle, Tracker};
use rand_chacha::rand_core::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// A config sized for tests: few workers, small stacks and messages.
pub fn small_config(workers: usize) -> RunConfig {
    RunConfig {
        workers: Some(workers),
        particles_per_worker: 256,
        dd_batch_size: 8,
        round_budget: 64,
        ..RunConfig::default()
    }
}

/// Run `f` once per rank of an in-process cluster, each on its own
/// thread, and collect the results in rank order.
pub fn run_cluster<R, F>(ranks: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(ChannelTransport) -> R + Sync,
{
    let f = &f;
    std::thread::scope(|s| {
        let handles: Vec<_> = ChannelTransport::cluster(ranks)
            .into_iter()
            .map(|t| {
                std::thread::Builder::new()
                    .name(format!("ember-rank-{}", t.rank()))
                    .spawn_scoped(s, move || f(t))
                    .unwrap()
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

/// Emits `histories` particles per batch, history `h` in domain
/// `h % domains`.
pub struct PointSource {
    pub histories: u64,
    pub domains: u32,
    pub species: Species,
    pub energy: f64,
    pub multiplicity: u32,
}

impl PointSource {
    pub fn new(histories: u64, domains: u32) -> Self {
        Self {
            histories,
            domains,
            species: Species::Neutron,
            energy: 2.0e6,
            multiplicity: 1,
        }
    }
}

impl Source for PointSource {
    fn histories(&self, _batch: u64) -> u64 {
        self.histories
    }

    fn sample(&self, _batch: u64, history: u64) -> SourceParticle {
        SourceParticle {
            species: self.species,
            domain: DomainId((history % self.domains.max(1) as u64) as u32),
            position: [history as f64, 0.0, 0.0],
            direction: [1.0, 0.0, 0.0],
            energy: self.energy,
            weight: 1.0,
            multiplicity: self.multiplicity,
        }
    }
}

fn mix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

fn uniform(rng: &mut ChaCha8Rng) -> f64 {
    (rng.next_u64() >> 11) as f64 / (1u64 << 53) as f64
}

/// Random walk over domains.
///
/// At each event the particle is absorbed with `absorb`, leaks with
/// `leak`, is banked with `bank`, and otherwise hops to a uniformly chosen
/// domain. `TIME` counts events so every call draws fresh numbers.
pub struct RandomWalkTracker {
    pub seed: u64,
    pub domains: u32,
    pub absorb: f64,
    pub leak: f64,
    pub bank: f64,
    /// Emit one photon secondary on absorption with this probability.
    pub photon_yield: f64,
    /// Score weight per event into bin `[domain]`.
    pub flux: Option<ScoreId>,
}

impl RandomWalkTracker {
    pub fn new(seed: u64, domains: u32) -> Self {
        Self {
            seed,
            domains,
            absorb: 0.3,
            leak: 0.0,
            bank: 0.0,
            photon_yield: 0.0,
            flux: None,
        }
    }

    fn rng(&self, history: &History<'_>) -> ChaCha8Rng {
        let key = mix(self.seed)
            ^ mix(history.batch().wrapping_mul(0x1000_0000_01b3))
            ^ mix(history.get(particle::HISTORY) as u64)
            ^ mix((history.get(particle::TIME) as u64) << 8 | history.species().index() as u64)
            ^ mix(history.get(particle::GENERATION) as u64 + 0x51);
        ChaCha8Rng::seed_from_u64(key)
    }
}

impl Tracker for RandomWalkTracker {
    fn track(&self, history: &mut History<'_>) -> Result<Fate, BankError> {
        let mut rng = self.rng(history);
        history.put(particle::TIME, history.get(particle::TIME) + 1.0);
        if let Some(flux) = self.flux {
            let weight = history.get(particle::WEIGHT);
            history.score(flux, 1.0, weight, &[history.domain().0 as usize]);
        }
        let u = uniform(&mut rng);
        if u < self.absorb {
            if history.species() == Species::Neutron && uniform(&mut rng) < self.photon_yield {
                let photon = history.emit(Species::Photon)?;
                history.arena().put(photon + particle::ENERGY, 1.0e5);
            }
            return Ok(Fate::Absorbed);
        }
        if u < self.absorb + self.leak {
            return Ok(Fate::Leaked);
        }
        if u < self.absorb + self.leak + self.bank {
            return Ok(Fate::Banked);
        }
        let domain = (rng.next_u64() % self.domains.max(1) as u64) as u32;
        history.set_domain(DomainId(domain));
        Ok(Fate::Moved)
    }
}

/// Absorbs every particle on first contact and counts the calls.
#[derive(Default)]
pub struct CountingTracker {
    calls: AtomicU64,
}

impl CountingTracker {
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl Tracker for CountingTracker {
    fn track(&self, _history: &mut History<'_>) -> Result<Fate, BankError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(Fate::Absorbed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_source_spreads_domains() {
        let s = PointSource::new(10, 3);
        let domains: Vec<u32> = (0..6).map(|h| s.sample(0, h).domain.0).collect();
        assert_eq!(domains, vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(s.histories(7), 10);
    }

    #[test]
    fn cluster_results_are_in_rank_order() {
        let ranks = run_cluster(4, |t| t.rank().0);
        assert_eq!(ranks, vec![0, 1, 2, 3]);
    }
}
