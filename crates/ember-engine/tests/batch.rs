//! End-to-end batches on in-process clusters.

use ember_core::{BankError, RankId, Species};
use ember_domain::{ChannelTransport, Transport};
use ember_engine::{Context, RunConfig, RunError};
use ember_test_utils::{run_cluster, small_config, CountingTracker, PointSource, RandomWalkTracker};

fn local() -> ChannelTransport {
    ChannelTransport::cluster(1).remove(0)
}

#[test]
fn single_rank_tracks_every_history() {
    let mut ctx = Context::new(small_config(4), local()).unwrap();
    let tracker = CountingTracker::default();
    let m = ctx.run_batch(0, &PointSource::new(500, 1), &tracker).unwrap();
    assert_eq!(m.histories_sourced, 500);
    assert_eq!(m.tracked, 500);
    assert_eq!(m.absorbed, 500);
    assert_eq!(tracker.calls(), 500);
    assert_eq!(m.particles_sent, 0);
    assert!(m.termination_waves >= 2);
    assert_eq!(ctx.last_metrics(), Some(&m));
    let report = ctx.shutdown().unwrap();
    assert_eq!(report.batches_run, 1);
    assert_eq!(report.live_records, 0);
}

#[test]
fn multiplicity_is_split_through_the_common_queue() {
    let mut ctx = Context::new(small_config(3), local()).unwrap();
    let source = PointSource {
        multiplicity: 10,
        ..PointSource::new(20, 1)
    };
    let m = ctx.run_batch(0, &source, &CountingTracker::default()).unwrap();
    assert_eq!(m.histories_sourced, 20);
    assert_eq!(m.tracked, 200);
    assert!(ctx.common().splits() > 0);
    assert!(ctx.common().is_empty());
    assert_eq!(ctx.stacks().outstanding(Species::Neutron), 0);
}

#[test]
fn migration_conserves_particles_across_two_ranks() {
    const HISTORIES: u64 = 400;
    let results = run_cluster(2, |t| {
        let mut ctx = Context::new(small_config(2), t).unwrap();
        let tracker = RandomWalkTracker {
            leak: 0.1,
            ..RandomWalkTracker::new(7, 2)
        };
        let m = ctx.run_batch(0, &PointSource::new(HISTORIES, 2), &tracker).unwrap();
        let report = ctx.shutdown().unwrap();
        (m, report)
    });
    let ended: u64 = results.iter().map(|(m, _)| m.absorbed + m.leaked).sum();
    assert_eq!(ended, HISTORIES);
    let sent: u64 = results.iter().map(|(m, _)| m.particles_sent).sum();
    let received: u64 = results.iter().map(|(m, _)| m.particles_received).sum();
    assert_eq!(sent, received);
    assert!(sent > 0);
    for (_, report) in &results {
        assert_eq!(report.live_records, 0);
    }
}

#[test]
fn arrivals_on_many_workers_survive_many_batches() {
    const BATCHES: u64 = 6;
    let results = run_cluster(2, |t| {
        let config = RunConfig {
            particles_per_worker: 64,
            ..small_config(4)
        };
        let mut ctx = Context::new(config, t).unwrap();
        let tracker = RandomWalkTracker::new(7, 2);
        let mut metrics = Vec::new();
        for batch in 0..BATCHES {
            match ctx.run_batch(batch, &PointSource::new(100, 2), &tracker) {
                Ok(m) => metrics.push(m),
                Err(e) => return Err(format!("rank {} failed batch {batch}: {e}", ctx.rank())),
            }
        }
        let report = ctx.shutdown().map_err(|e| e.to_string())?;
        Ok((metrics, report))
    });
    let results: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();
    for batch in 0..BATCHES as usize {
        let ended: u64 = results.iter().map(|(metrics, _)| metrics[batch].ended()).sum();
        assert_eq!(ended, 100, "batch {batch}");
    }
    for (_, report) in &results {
        assert_eq!(report.live_records, 0);
    }
}

#[test]
fn failing_rank_releases_its_peers() {
    let results = run_cluster(2, |t| {
        let per_worker = if t.rank() == RankId(0) { 4 } else { 256 };
        let config = RunConfig {
            particles_per_worker: per_worker,
            ..small_config(2)
        };
        let mut ctx = Context::new(config, t).unwrap();
        ctx.run_batch(0, &PointSource::new(200, 2), &RandomWalkTracker::new(5, 2))
    });
    match &results[0] {
        Err(RunError::Bank(BankError::BufferExhausted { allocated, .. })) => assert_eq!(*allocated, 4),
        other => panic!("expected BufferExhausted on rank 0, got {other:?}"),
    }
    match &results[1] {
        Err(RunError::PeerAborted { rank }) => assert_eq!(*rank, RankId(0)),
        other => panic!("expected PeerAborted on rank 1, got {other:?}"),
    }
}

#[test]
fn scores_agree_on_every_rank() {
    let results = run_cluster(4, |t| {
        let mut ctx = Context::new(small_config(2), t).unwrap();
        let flux = ctx.add_score("flux", &[4]);
        let tracker = RandomWalkTracker {
            flux: Some(flux),
            ..RandomWalkTracker::new(11, 4)
        };
        let mut tracked = 0;
        for batch in 0..2 {
            tracked += ctx
                .run_batch(batch, &PointSource::new(200, 4), &tracker)
                .unwrap()
                .tracked;
        }
        let score = ctx.score(flux).unwrap();
        assert_eq!(score.batches(), 2);
        let means: Vec<f64> = (0..4).map(|d| score.mean(&[d]).unwrap()).collect();
        ctx.shutdown().unwrap();
        (tracked, means)
    });
    let total_tracked: u64 = results.iter().map(|(t, _)| t).sum();
    let means = &results[0].1;
    for (_, m) in &results {
        assert_eq!(m, means);
    }
    // Weight one per event, averaged over two batches.
    let scored: f64 = means.iter().sum();
    assert!((scored * 2.0 - total_tracked as f64).abs() < 1e-9);
}

#[test]
fn bank_checkpoint_and_restore() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bank.ckpt");
    let config = RunConfig {
        checkpoint: Some(path.clone()),
        ..small_config(2)
    };
    let tracker = RandomWalkTracker {
        bank: 0.4,
        ..RandomWalkTracker::new(3, 1)
    };

    let mut ctx = Context::new(config, local()).unwrap();
    let m = ctx.run_batch(5, &PointSource::new(100, 1), &tracker).unwrap();
    assert!(m.banked > 0);
    assert_eq!(m.absorbed + m.banked, 100);
    assert_eq!(ctx.bank_len() as u64, m.banked);
    let report = ctx.shutdown().unwrap();
    assert_eq!(report.banked as u64, m.banked);
    assert_eq!(report.live_records as u64, m.banked);

    let mut restarted = Context::new(small_config(3), local()).unwrap();
    let restored = restarted.restore(&path).unwrap();
    assert_eq!(restored as u64, m.banked);
    assert_eq!(restarted.requeue_bank(), restored);
    let next = restarted
        .run_batch(6, &PointSource::new(0, 1), &CountingTracker::default())
        .unwrap();
    assert_eq!(next.tracked, restored as u64);
    assert_eq!(restarted.bank_len(), 0);
}

#[test]
fn photon_secondaries_are_tracked() {
    let config = RunConfig {
        species: vec![Species::Neutron, Species::Photon],
        ..small_config(2)
    };
    let mut ctx = Context::new(config, local()).unwrap();
    let tracker = RandomWalkTracker {
        absorb: 1.0,
        photon_yield: 1.0,
        ..RandomWalkTracker::new(1, 1)
    };
    let m = ctx.run_batch(0, &PointSource::new(50, 1), &tracker).unwrap();
    assert_eq!(m.secondaries, 50);
    assert_eq!(m.tracked, 100);
    assert_eq!(ctx.stacks().outstanding(Species::Photon), 0);
}

#[test]
fn undersized_stacks_report_buffer_exhaustion() {
    let config = RunConfig {
        particles_per_worker: 4,
        ..small_config(1)
    };
    let mut ctx = Context::new(config, local()).unwrap();
    let err = ctx
        .run_batch(0, &PointSource::new(100, 1), &CountingTracker::default())
        .unwrap_err();
    assert!(err.to_string().contains("particles_per_worker"));
    match err {
        RunError::Bank(BankError::BufferExhausted { species, allocated, .. }) => {
            assert_eq!(species, Species::Neutron);
            assert_eq!(allocated, 4);
        }
        other => panic!("expected BufferExhausted, got {other:?}"),
    }
}

#[test]
fn low_stacks_are_refilled_between_rounds() {
    let config = RunConfig {
        particles_per_worker: 16,
        ..small_config(1)
    };
    let mut ctx = Context::new(config, local()).unwrap();
    let before = ctx.stacks().allocated(Species::Neutron);
    let m = ctx
        .run_batch(0, &PointSource::new(15, 1), &CountingTracker::default())
        .unwrap();
    assert!(m.refilled > 0);
    assert_eq!(ctx.stacks().allocated(Species::Neutron), before + m.refilled as usize);
}

#[test]
fn invalid_config_is_rejected_before_allocation() {
    let config = RunConfig {
        species: Vec::new(),
        ..RunConfig::default()
    };
    let err = Context::new(config, local()).err().unwrap();
    assert!(matches!(err, RunError::Config(_)));
}
