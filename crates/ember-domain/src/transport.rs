//! Asynchronous point-to-point message transport between ranks.
//!
//! [`Transport`] is the non-blocking post/test/complete contract the
//! exchange, termination and collective layers are written against.
//! Messages are flat `f64` arrays matched by `(source, tag)`; messages with
//! the same source and tag are delivered in send order.
//!
//! [`ChannelTransport`] implements it in-process: one crossbeam mailbox
//! per rank. A send completes when the receiver matches it, so
//! [`Transport::test_send`] reports real delivery.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};
use crossbeam_utils::Backoff;
use indexmap::IndexMap;

use ember_core::{fatal, RankId, Site};

/// Message tag.
pub type Tag = u32;

/// Tag ranges for the message streams of a run with `size` ranks.
///
/// | stream       | tag               |
/// |--------------|-------------------|
/// | particles    | `source`          |
/// | credits      | `size + child`    |
/// | probes       | `2 * size + parent` |
/// | aborts       | `3 * size + source` |
/// | collectives  | `4 * size + k`    |
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TagLayout {
    size: u32,
}

impl TagLayout {
    /// Layout for `size` ranks.
    pub fn new(size: usize) -> Self {
        Self { size: size as u32 }
    }

    /// Particle batches sent by `source`.
    pub fn particles(self, source: RankId) -> Tag {
        source.0
    }

    /// Wave reports sent up by `child`.
    pub fn credits(self, child: RankId) -> Tag {
        self.size + child.0
    }

    /// Termination probes sent down by `parent`.
    pub fn probes(self, parent: RankId) -> Tag {
        2 * self.size + parent.0
    }

    /// Abort notices sent by `source` when it gives up on a batch.
    pub fn aborts(self, source: RankId) -> Tag {
        3 * self.size + source.0
    }

    /// Collective stream `k`.
    pub fn collective(self, k: u32) -> Tag {
        4 * self.size + k
    }
}

/// Handle of a posted send.
#[derive(Debug)]
pub struct SendRequest {
    delivered: Arc<AtomicBool>,
}

impl SendRequest {
    /// A request that is already complete.
    pub fn completed() -> Self {
        Self {
            delivered: Arc::new(AtomicBool::new(true)),
        }
    }

    fn is_done(&self) -> bool {
        self.delivered.load(Ordering::Acquire)
    }
}

/// Handle of a posted receive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecvRequest {
    /// Rank the message must come from.
    pub source: RankId,
    /// Tag the message must carry.
    pub tag: Tag,
}

/// Non-blocking message passing between ranks.
pub trait Transport: Send + Sync {
    /// This rank.
    fn rank(&self) -> RankId;

    /// Number of ranks.
    fn size(&self) -> usize;

    /// Start sending `payload` to `dest`. Never blocks.
    fn isend(&self, dest: RankId, tag: Tag, payload: Vec<f64>) -> SendRequest;

    /// Whether the send has completed.
    fn test_send(&self, request: &SendRequest) -> bool;

    /// Block until the send has completed.
    fn wait_send(&self, request: &SendRequest) {
        let backoff = Backoff::new();
        while !self.test_send(request) {
            backoff.snooze();
        }
    }

    /// Post a receive for the next message from `source` with `tag`.
    fn irecv(&self, source: RankId, tag: Tag) -> RecvRequest;

    /// Complete a posted receive if a matching message has arrived.
    fn test_recv(&self, request: &RecvRequest) -> Option<Vec<f64>>;

    /// Block until a matching message arrives.
    fn recv(&self, source: RankId, tag: Tag) -> Vec<f64> {
        let request = self.irecv(source, tag);
        let backoff = Backoff::new();
        loop {
            if let Some(payload) = self.test_recv(&request) {
                return payload;
            }
            backoff.snooze();
        }
    }
}

struct Envelope {
    source: RankId,
    tag: Tag,
    payload: Vec<f64>,
    delivered: Arc<AtomicBool>,
}

/// In-process transport: every rank is a [`ChannelTransport`] endpoint.
pub struct ChannelTransport {
    rank: RankId,
    peers: Arc<[Sender<Envelope>]>,
    inbox: Receiver<Envelope>,
    /// Arrived but unmatched messages, per `(source, tag)` in arrival order.
    unmatched: Mutex<IndexMap<(RankId, Tag), VecDeque<Envelope>>>,
}

// Compile-time assertion: ChannelTransport must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<ChannelTransport>();
};

impl ChannelTransport {
    /// Create `n` connected endpoints, indexed by rank.
    pub fn cluster(n: usize) -> Vec<ChannelTransport> {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..n).map(|_| crossbeam_channel::unbounded()).unzip();
        let peers: Arc<[Sender<Envelope>]> = senders.into();
        receivers
            .into_iter()
            .enumerate()
            .map(|(i, inbox)| ChannelTransport {
                rank: RankId(i as u32),
                peers: Arc::clone(&peers),
                inbox,
                unmatched: Mutex::new(IndexMap::new()),
            })
            .collect()
    }
}

impl Transport for ChannelTransport {
    fn rank(&self) -> RankId {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn isend(&self, dest: RankId, tag: Tag, payload: Vec<f64>) -> SendRequest {
        let Some(peer) = self.peers.get(dest.index()) else {
            fatal!(
                Site::here("transport"),
                "send to rank {dest} outside cluster of {}",
                self.peers.len()
            );
        };
        let delivered = Arc::new(AtomicBool::new(false));
        let envelope = Envelope {
            source: self.rank,
            tag,
            payload,
            delivered: Arc::clone(&delivered),
        };
        if peer.send(envelope).is_err() {
            tracing::warn!(rank = %self.rank, %dest, tag, "send to a rank that has shut down");
        }
        SendRequest { delivered }
    }

    fn test_send(&self, request: &SendRequest) -> bool {
        request.is_done()
    }

    fn irecv(&self, source: RankId, tag: Tag) -> RecvRequest {
        RecvRequest { source, tag }
    }

    fn test_recv(&self, request: &RecvRequest) -> Option<Vec<f64>> {
        let mut unmatched = self.unmatched.lock().unwrap_or_else(|e| e.into_inner());
        while let Ok(envelope) = self.inbox.try_recv() {
            unmatched
                .entry((envelope.source, envelope.tag))
                .or_default()
                .push_back(envelope);
        }
        let envelope = unmatched
            .get_mut(&(request.source, request.tag))?
            .pop_front()?;
        envelope.delivered.store(true, Ordering::Release);
        Some(envelope.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_streams_are_disjoint() {
        let tags = TagLayout::new(4);
        let mut all = Vec::new();
        for r in 0..4 {
            let r = RankId(r);
            all.extend([tags.particles(r), tags.credits(r), tags.probes(r), tags.aborts(r)]);
        }
        all.extend([tags.collective(0), tags.collective(1)]);
        let n = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), n);
        assert_eq!(tags.credits(RankId(1)), 5);
        assert_eq!(tags.probes(RankId(0)), 8);
        assert_eq!(tags.aborts(RankId(3)), 15);
        assert_eq!(tags.collective(0), 16);
    }

    #[test]
    fn send_completes_on_match() {
        let cluster = ChannelTransport::cluster(2);
        let req = cluster[0].isend(RankId(1), 7, vec![1.0, 2.0]);
        assert!(!cluster[0].test_send(&req));
        let recv = cluster[1].irecv(RankId(0), 7);
        assert_eq!(cluster[1].test_recv(&recv), Some(vec![1.0, 2.0]));
        assert!(cluster[0].test_send(&req));
        assert_eq!(cluster[1].test_recv(&recv), None);
    }

    #[test]
    fn matching_is_per_source_and_tag_in_order() {
        let cluster = ChannelTransport::cluster(3);
        cluster[0].isend(RankId(2), 1, vec![1.0]);
        cluster[1].isend(RankId(2), 1, vec![10.0]);
        cluster[0].isend(RankId(2), 2, vec![2.0]);
        cluster[0].isend(RankId(2), 1, vec![3.0]);
        let from0 = cluster[2].irecv(RankId(0), 1);
        assert_eq!(cluster[2].test_recv(&from0), Some(vec![1.0]));
        assert_eq!(cluster[2].test_recv(&from0), Some(vec![3.0]));
        assert_eq!(cluster[2].test_recv(&from0), None);
        assert_eq!(cluster[2].recv(RankId(0), 2), vec![2.0]);
        assert_eq!(cluster[2].recv(RankId(1), 1), vec![10.0]);
    }

    #[test]
    fn wait_send_blocks_until_peer_receives() {
        let cluster = ChannelTransport::cluster(2);
        std::thread::scope(|s| {
            let sender = &cluster[0];
            let receiver = &cluster[1];
            s.spawn(move || {
                let req = sender.isend(RankId(1), 0, vec![4.0]);
                sender.wait_send(&req);
                assert!(sender.test_send(&req));
            });
            s.spawn(move || {
                assert_eq!(receiver.recv(RankId(0), 0), vec![4.0]);
            });
        });
    }
}
