//! Distributed completion detection over a binary tree of ranks.
//!
//! Ranks form an implicit binary tree (parent `(id - 1) / 2`). Detection
//! runs in *waves*. In each wave every rank sends its parent a report
//! aggregated over its subtree:
//!
//! ```text
//! [wave, sent, received, idle]
//! ```
//!
//! `sent` and `received` are the cumulative migration counters of the
//! subtree and `idle` is set only when every rank in it had empty local
//! queues and banks. The root evaluates the aggregate and sends a verdict
//! probe down the tree, which each rank forwards to its children
//! unchanged and which starts the next wave.
//!
//! Zero credit (`sent == received`) with every rank idle is necessary but
//! not sufficient: counters read at different moments can miss a particle
//! in transit. The root declares completion only after
//! [`TerminationConfig::confirmation_rounds`] consecutive candidate waves
//! observed identical counters, and each rank re-checks its own queues when
//! the verdict arrives. Any non-candidate wave resets the streak, so the
//! detector can enter and leave [`TerminationState::ProbingCompletion`] any
//! number of times.
//!
//! A rank that gives up on a batch calls [`broadcast_abort`]; every peer's
//! detector sees the notice on its next [`TerminationDetector::poll`] and
//! reports [`TerminationState::Aborted`].

use ember_core::{fatal, RankId, Site};

use crate::transport::{RecvRequest, SendRequest, TagLayout, Transport};

/// Detector state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationState {
    /// Work may remain somewhere.
    Running,
    /// The last wave saw zero credit with every rank idle; confirming.
    ProbingCompletion,
    /// No live or in-flight particle remains anywhere.
    Terminated,
    /// The given rank abandoned the batch; no verdict will follow.
    Aborted(RankId),
}

/// Termination detector configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TerminationConfig {
    /// Consecutive candidate waves with unchanged counters required before
    /// the root declares completion.
    ///
    /// Default: 2. Must be at least 1; a value of 1 trusts a single
    /// snapshot.
    pub confirmation_rounds: u32,
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self {
            confirmation_rounds: 2,
        }
    }
}

/// What a rank contributes to a wave.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LocalStatus {
    /// Local queues, banks and send buffers are all empty.
    pub idle: bool,
    /// Particles this rank has posted for migration.
    pub sent: u64,
    /// Particles this rank has received.
    pub received: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct WaveReport {
    sent: u64,
    received: u64,
    idle: bool,
}

impl WaveReport {
    fn candidate(self) -> bool {
        self.idle && self.sent == self.received
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Verdict {
    Continue = 0,
    MaybeDone = 1,
    Done = 2,
}

impl Verdict {
    fn from_wire(v: f64) -> Option<Self> {
        match v as i64 {
            0 => Some(Self::Continue),
            1 => Some(Self::MaybeDone),
            2 => Some(Self::Done),
            _ => None,
        }
    }
}

/// Per-rank termination detector.
pub struct TerminationDetector {
    rank: RankId,
    tags: TagLayout,
    parent: Option<RankId>,
    children: Vec<RankId>,
    config: TerminationConfig,
    state: TerminationState,
    wave: u64,
    /// Whether this rank has reported (or, at the root, evaluated) `wave`.
    reported: bool,
    child_reports: Vec<Option<WaveReport>>,
    child_recvs: Vec<RecvRequest>,
    probe_recv: Option<RecvRequest>,
    abort_recvs: Vec<RecvRequest>,
    sends: Vec<SendRequest>,
    /// Root only: counters of the previous candidate wave and the streak.
    last_candidate: Option<(u64, u64)>,
    streak: u32,
}

impl TerminationDetector {
    /// Detector for `rank` in a run of `size` ranks.
    pub fn new(rank: RankId, size: usize, config: TerminationConfig) -> Self {
        if config.confirmation_rounds == 0 {
            fatal!(
                Site::here("termination"),
                "confirmation_rounds must be at least 1"
            );
        }
        let tags = TagLayout::new(size);
        let children: Vec<RankId> = rank.children(size).collect();
        let child_recvs = children
            .iter()
            .map(|&c| RecvRequest {
                source: c,
                tag: tags.credits(c),
            })
            .collect();
        let probe_recv = rank.parent().map(|p| RecvRequest {
            source: p,
            tag: tags.probes(p),
        });
        let abort_recvs = (0..size as u32)
            .map(RankId)
            .filter(|&r| r != rank)
            .map(|r| RecvRequest {
                source: r,
                tag: tags.aborts(r),
            })
            .collect();
        Self {
            rank,
            tags,
            parent: rank.parent(),
            child_reports: vec![None; children.len()],
            children,
            child_recvs,
            probe_recv,
            abort_recvs,
            config,
            state: TerminationState::Running,
            wave: 0,
            reported: false,
            sends: Vec::new(),
            last_candidate: None,
            streak: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> TerminationState {
        self.state
    }

    /// Current wave number.
    pub fn wave(&self) -> u64 {
        self.wave
    }

    /// Advance the protocol without blocking.
    ///
    /// Call periodically from the rank's control thread with a fresh
    /// [`LocalStatus`]. Returns the state after this step. Abort notices
    /// take precedence over wave traffic.
    pub fn poll<T: Transport + ?Sized>(&mut self, transport: &T, local: LocalStatus) -> TerminationState {
        if matches!(self.state, TerminationState::Terminated | TerminationState::Aborted(_)) {
            return self.state;
        }
        if let Some(peer) = self.check_aborts(transport) {
            tracing::warn!(rank = %self.rank, %peer, wave = self.wave, "peer aborted the batch");
            self.state = TerminationState::Aborted(peer);
            return self.state;
        }
        self.sends.retain(|s| !transport.test_send(s));
        self.collect_child_reports(transport);

        if !self.reported && self.child_reports.iter().all(Option::is_some) {
            let aggregate = self.child_reports.iter().flatten().fold(
                WaveReport {
                    sent: local.sent,
                    received: local.received,
                    idle: local.idle,
                },
                |acc, c| WaveReport {
                    sent: acc.sent + c.sent,
                    received: acc.received + c.received,
                    idle: acc.idle && c.idle,
                },
            );
            self.reported = true;
            match self.parent {
                Some(parent) => {
                    let payload = vec![
                        self.wave as f64,
                        aggregate.sent as f64,
                        aggregate.received as f64,
                        if aggregate.idle { 1.0 } else { 0.0 },
                    ];
                    let tag = self.tags.credits(self.rank);
                    self.sends.push(transport.isend(parent, tag, payload));
                }
                None => {
                    let verdict = self.evaluate(aggregate);
                    self.apply(transport, verdict, local);
                }
            }
        }

        if self.reported {
            if let Some(request) = self.probe_recv {
                if let Some(probe) = transport.test_recv(&request) {
                    let verdict = self.decode_probe(&probe);
                    self.apply(transport, verdict, local);
                }
            }
        }
        self.state
    }

    fn check_aborts<T: Transport + ?Sized>(&self, transport: &T) -> Option<RankId> {
        self.abort_recvs
            .iter()
            .find_map(|req| transport.test_recv(req).map(|_| req.source))
    }

    fn collect_child_reports<T: Transport + ?Sized>(&mut self, transport: &T) {
        for i in 0..self.children.len() {
            if self.child_reports[i].is_some() {
                continue;
            }
            let Some(msg) = transport.test_recv(&self.child_recvs[i]) else {
                continue;
            };
            let child = self.children[i];
            if msg.len() != 4 || msg[0] as u64 != self.wave {
                fatal!(
                    Site::here("termination"),
                    "malformed wave report from rank {child} in wave {}: {msg:?}",
                    self.wave
                );
            }
            self.child_reports[i] = Some(WaveReport {
                sent: msg[1] as u64,
                received: msg[2] as u64,
                idle: msg[3] != 0.0,
            });
        }
    }

    /// Root: turn an aggregated wave into a verdict.
    fn evaluate(&mut self, aggregate: WaveReport) -> Verdict {
        if !aggregate.candidate() {
            self.streak = 0;
            self.last_candidate = None;
            return Verdict::Continue;
        }
        let counts = (aggregate.sent, aggregate.received);
        self.streak = match self.last_candidate {
            Some(prev) if prev == counts => self.streak + 1,
            _ => 1,
        };
        self.last_candidate = Some(counts);
        tracing::debug!(
            wave = self.wave,
            sent = aggregate.sent,
            streak = self.streak,
            "termination candidate wave"
        );
        if self.streak >= self.config.confirmation_rounds {
            Verdict::Done
        } else {
            Verdict::MaybeDone
        }
    }

    fn decode_probe(&self, probe: &[f64]) -> Verdict {
        let verdict = match probe {
            [wave, v] if *wave as u64 == self.wave => Verdict::from_wire(*v),
            _ => None,
        };
        match verdict {
            Some(v) => v,
            None => fatal!(
                Site::here("termination"),
                "malformed probe in wave {}: {probe:?}",
                self.wave
            ),
        }
    }

    /// Forward `verdict` to the children unchanged and start the next wave.
    fn apply<T: Transport + ?Sized>(&mut self, transport: &T, verdict: Verdict, local: LocalStatus) {
        let payload = [self.wave as f64, verdict as i64 as f64];
        let tag = self.tags.probes(self.rank);
        for &child in &self.children {
            self.sends.push(transport.isend(child, tag, payload.to_vec()));
        }
        self.state = match verdict {
            Verdict::Continue => TerminationState::Running,
            Verdict::MaybeDone => TerminationState::ProbingCompletion,
            Verdict::Done => {
                if !local.idle {
                    fatal!(
                        Site::here("termination"),
                        "completion declared in wave {} while local work remains",
                        self.wave
                    );
                }
                tracing::debug!(rank = %self.rank, wave = self.wave, "termination detected");
                TerminationState::Terminated
            }
        };
        self.wave += 1;
        self.reported = false;
        self.child_reports.iter_mut().for_each(|r| *r = None);
    }

    /// Wait until the detector's own sends (reports and probes) complete.
    pub fn finish<T: Transport + ?Sized>(&mut self, transport: &T) {
        for send in self.sends.drain(..) {
            transport.wait_send(&send);
        }
    }
}

/// Tell every other rank that this rank has abandoned the current batch.
///
/// The sends are not waited on: a peer that already stopped polling never
/// matches them.
pub fn broadcast_abort<T: Transport + ?Sized>(transport: &T) {
    let rank = transport.rank();
    let tag = TagLayout::new(transport.size()).aborts(rank);
    for peer in (0..transport.size() as u32).map(RankId).filter(|&r| r != rank) {
        let _ = transport.isend(peer, tag, vec![rank.0 as f64]);
    }
    tracing::debug!(%rank, peers = transport.size() - 1, "abort broadcast");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;

    fn detectors(n: usize, rounds: u32) -> Vec<TerminationDetector> {
        (0..n)
            .map(|r| {
                TerminationDetector::new(
                    RankId(r as u32),
                    n,
                    TerminationConfig {
                        confirmation_rounds: rounds,
                    },
                )
            })
            .collect()
    }

    /// Poll every rank in turn until all terminate or `max_rounds` pass.
    fn drive(
        cluster: &[ChannelTransport],
        dets: &mut [TerminationDetector],
        status: impl Fn(usize) -> LocalStatus,
        max_rounds: usize,
    ) -> Option<usize> {
        for round in 0..max_rounds {
            for (r, det) in dets.iter_mut().enumerate() {
                det.poll(&cluster[r], status(r));
            }
            if dets.iter().all(|d| d.state() == TerminationState::Terminated) {
                return Some(round);
            }
        }
        None
    }

    #[test]
    fn single_rank_terminates_after_confirmation() {
        let cluster = ChannelTransport::cluster(1);
        let mut det = detectors(1, 2);
        let idle = LocalStatus {
            idle: true,
            sent: 0,
            received: 0,
        };
        assert_eq!(det[0].poll(&cluster[0], idle), TerminationState::ProbingCompletion);
        assert_eq!(det[0].poll(&cluster[0], idle), TerminationState::Terminated);
    }

    #[test]
    fn idle_tree_terminates_within_bounded_rounds() {
        for n in [2, 3, 5, 8] {
            let cluster = ChannelTransport::cluster(n);
            let mut dets = detectors(n, 2);
            let done = drive(&cluster, &mut dets, |_| LocalStatus { idle: true, ..Default::default() }, 200);
            assert!(done.is_some(), "{n} ranks never terminated");
            for (r, d) in dets.iter_mut().enumerate() {
                d.finish(&cluster[r]);
            }
        }
    }

    #[test]
    fn busy_rank_blocks_termination() {
        let cluster = ChannelTransport::cluster(4);
        let mut dets = detectors(4, 2);
        let status = |r: usize| LocalStatus {
            idle: r != 3,
            ..Default::default()
        };
        assert_eq!(drive(&cluster, &mut dets, status, 100), None);
        assert!(dets.iter().all(|d| d.state() == TerminationState::Running));
        assert!(dets[0].wave() > 3);
    }

    #[test]
    fn nonzero_credit_blocks_termination() {
        let cluster = ChannelTransport::cluster(3);
        let mut dets = detectors(3, 2);
        // Rank 1 sent 5 particles, rank 2 has received only 4.
        let status = |r: usize| match r {
            1 => LocalStatus { idle: true, sent: 5, received: 0 },
            2 => LocalStatus { idle: true, sent: 0, received: 4 },
            _ => LocalStatus { idle: true, ..Default::default() },
        };
        assert_eq!(drive(&cluster, &mut dets, status, 100), None);
        assert!(dets.iter().all(|d| d.state() != TerminationState::Terminated));
    }

    #[test]
    fn changing_counters_restart_confirmation() {
        let cluster = ChannelTransport::cluster(1);
        let mut det = detectors(1, 2);
        let at = |n: u64| LocalStatus {
            idle: true,
            sent: n,
            received: n,
        };
        assert_eq!(det[0].poll(&cluster[0], at(1)), TerminationState::ProbingCompletion);
        // Counters moved between waves: the first snapshot is not trusted.
        assert_eq!(det[0].poll(&cluster[0], at(2)), TerminationState::ProbingCompletion);
        assert_eq!(det[0].poll(&cluster[0], LocalStatus { idle: false, ..at(2) }), TerminationState::Running);
        assert_eq!(det[0].poll(&cluster[0], at(2)), TerminationState::ProbingCompletion);
        assert_eq!(det[0].poll(&cluster[0], at(2)), TerminationState::Terminated);
    }

    #[test]
    fn abort_notice_stops_every_peer() {
        let cluster = ChannelTransport::cluster(3);
        let mut dets = detectors(3, 2);
        let busy = LocalStatus::default();
        for (r, det) in dets.iter_mut().enumerate() {
            assert_eq!(det.poll(&cluster[r], busy), TerminationState::Running);
        }
        broadcast_abort(&cluster[2]);
        assert_eq!(dets[0].poll(&cluster[0], busy), TerminationState::Aborted(RankId(2)));
        assert_eq!(dets[1].poll(&cluster[1], busy), TerminationState::Aborted(RankId(2)));
        // Sticky, even once the rank goes idle.
        let idle = LocalStatus { idle: true, ..Default::default() };
        assert_eq!(dets[0].poll(&cluster[0], idle), TerminationState::Aborted(RankId(2)));
    }

    #[test]
    fn own_abort_is_not_seen_locally() {
        let cluster = ChannelTransport::cluster(1);
        let mut det = detectors(1, 1);
        broadcast_abort(&cluster[0]);
        let idle = LocalStatus { idle: true, ..Default::default() };
        assert_eq!(det[0].poll(&cluster[0], idle), TerminationState::Terminated);
    }

    #[test]
    fn more_rounds_take_longer() {
        let rounds_for = |k: u32| {
            let cluster = ChannelTransport::cluster(4);
            let mut dets = detectors(4, k);
            drive(&cluster, &mut dets, |_| LocalStatus { idle: true, ..Default::default() }, 500)
        };
        let two = rounds_for(2).unwrap();
        let four = rounds_for(4).unwrap();
        assert!(four > two);
    }

    #[test]
    fn work_appearing_mid_probe_resets() {
        let cluster = ChannelTransport::cluster(3);
        let mut dets = detectors(3, 3);
        let mut busy_until_round = 0usize;
        for round in 0..400 {
            // Rank 2 receives a late particle once the root starts probing.
            if busy_until_round == 0 && dets[0].state() == TerminationState::ProbingCompletion {
                busy_until_round = round + 5;
            }
            let late = busy_until_round != 0;
            for (r, det) in dets.iter_mut().enumerate() {
                let status = match r {
                    1 if late => LocalStatus { idle: true, sent: 1, received: 0 },
                    2 if late => LocalStatus {
                        idle: round >= busy_until_round,
                        sent: 0,
                        received: 1,
                    },
                    _ => LocalStatus { idle: true, ..Default::default() },
                };
                let state = det.poll(&cluster[r], status);
                if state == TerminationState::Terminated {
                    assert!(status.idle, "rank {r} terminated while busy");
                }
            }
            if dets.iter().all(|d| d.state() == TerminationState::Terminated) {
                assert!(round >= busy_until_round);
                return;
            }
        }
        panic!("detector never terminated after work drained");
    }
}
