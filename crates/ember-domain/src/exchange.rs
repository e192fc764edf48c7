//! Batched migration of particles between spatial domains.
//!
//! Each rank owns one domain. A particle whose `DOMAIN` field names another
//! rank is [`post`](DomainExchange::post)ed: its payload (the record minus
//! the list header) is appended to the batch buffer for that rank and the
//! record goes straight back to the worker's stack. A full batch becomes
//! one non-blocking send. On the other side
//! [`drain_received`](DomainExchange::drain_received) rebuilds the
//! particles from local stacks and enqueues them.
//!
//! Every migrating particle is in exactly one place: a pending batch
//! buffer, an in-flight send, or (after completion) nowhere. The
//! outstanding counter tracks in-flight particles and must be zero when
//! tracking ends.
//!
//! The exchange also keeps the rank's credit counters: `sent` grows on
//! every post and `received` on every rebuilt particle.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use ember_arena::Arena;
use ember_bank::{ParticleStacks, WorkerFifos};
use ember_core::record::{list, particle};
use ember_core::{fatal, BankError, DomainId, Offset, RankId, Site, Species, WorkerId};

use crate::transport::{RecvRequest, SendRequest, TagLayout, Transport};

/// Where a particle should be tracked next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    /// In this rank's domain.
    Local,
    /// In the domain owned by another rank.
    Remote(RankId),
}

/// Outcome of one [`DomainExchange::cleanup`] pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Sends that completed during this pass.
    pub completed: usize,
    /// Sends still in flight afterwards.
    pub in_flight: usize,
}

/// Exchange counters for one rank.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExchangeStats {
    /// Particles posted for migration.
    pub particles_sent: u64,
    /// Particles rebuilt from received messages.
    pub particles_received: u64,
    /// Messages handed to the transport.
    pub messages_sent: u64,
    /// Messages received.
    pub messages_received: u64,
}

struct InFlight {
    request: SendRequest,
    particles: usize,
}

/// Outgoing batches for one destination rank.
struct DdSend {
    dest: RankId,
    pending: Vec<f64>,
    pending_count: usize,
    in_flight: Vec<InFlight>,
    allocated: u64,
    completed: u64,
}

/// Posted receive for one source rank.
struct DdRecv {
    request: Option<RecvRequest>,
}

/// Per-rank particle exchange.
pub struct DomainExchange {
    rank: RankId,
    tags: TagLayout,
    batch_size: usize,
    /// Indexed by destination rank; the own-rank slot is never used.
    sends: Vec<Mutex<DdSend>>,
    /// Indexed by source rank; the own-rank slot is never used.
    recvs: Vec<Mutex<DdRecv>>,
    outstanding: AtomicUsize,
    sent: AtomicU64,
    received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

// Compile-time assertion: DomainExchange must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<DomainExchange>();
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl DomainExchange {
    /// Exchange for `rank` in a run of `size` ranks, sending batches of
    /// `batch_size` particles.
    pub fn new(rank: RankId, size: usize, batch_size: usize) -> Self {
        if batch_size == 0 {
            fatal!(Site::here("dd-send"), "batch size must be at least one");
        }
        Self {
            rank,
            tags: TagLayout::new(size),
            batch_size,
            sends: (0..size)
                .map(|d| {
                    Mutex::new(DdSend {
                        dest: RankId(d as u32),
                        pending: Vec::with_capacity(batch_size * particle::PAYLOAD_LEN),
                        pending_count: 0,
                        in_flight: Vec::new(),
                        allocated: 0,
                        completed: 0,
                    })
                })
                .collect(),
            recvs: (0..size)
                .map(|_| Mutex::new(DdRecv { request: None }))
                .collect(),
            outstanding: AtomicUsize::new(0),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
        }
    }

    /// Rank this exchange belongs to.
    pub fn rank(&self) -> RankId {
        self.rank
    }

    /// Decide where `particle` is tracked next from its `DOMAIN` field.
    ///
    /// Fatal if the field is not a whole non-negative number or names a
    /// domain outside the run.
    pub fn route(&self, arena: &Arena, particle: Offset) -> Route {
        let field = arena.get(particle + particle::DOMAIN);
        let Some(domain) = DomainId::from_field(field) else {
            fatal!(
                Site::here("dd-route").at(particle),
                "particle carries invalid domain {field}"
            );
        };
        let owner = domain.owner();
        if owner == self.rank {
            Route::Local
        } else if owner.index() < self.sends.len() {
            Route::Remote(owner)
        } else {
            fatal!(
                Site::here("dd-route").at(particle),
                "particle names domain {} outside {} ranks",
                owner,
                self.sends.len()
            );
        }
    }

    /// Serialize `particle` into the batch for its domain's owner and give
    /// the record back to `worker`'s stack. Sends the batch once full.
    pub fn post<T: Transport + ?Sized>(
        &self,
        transport: &T,
        arena: &Arena,
        stacks: &ParticleStacks,
        particle: Offset,
        worker: WorkerId,
    ) {
        let Route::Remote(dest) = self.route(arena, particle) else {
            fatal!(
                Site::here("dd-send").at(particle),
                "post of a particle already in the local domain"
            );
        };
        let mut send = lock(&self.sends[dest.index()]);
        let start = send.pending.len();
        send.pending.resize(start + particle::PAYLOAD_LEN, 0.0);
        arena.read_into(particle + list::HEADER_SIZE, &mut send.pending[start..]);
        send.pending_count += 1;
        stacks.give(arena, particle, worker);
        self.sent.fetch_add(1, Ordering::Relaxed);
        if send.pending_count == self.batch_size {
            self.transmit(transport, &mut send);
        }
    }

    fn transmit<T: Transport + ?Sized>(&self, transport: &T, send: &mut DdSend) {
        let payload = std::mem::replace(
            &mut send.pending,
            Vec::with_capacity(self.batch_size * particle::PAYLOAD_LEN),
        );
        let particles = std::mem::take(&mut send.pending_count);
        let request = transport.isend(send.dest, self.tags.particles(self.rank), payload);
        send.in_flight.push(InFlight { request, particles });
        send.allocated += 1;
        self.outstanding.fetch_add(particles, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(rank = %self.rank, dest = %send.dest, particles, "particle batch sent");
    }

    /// Send every non-empty batch buffer. Returns the number of messages.
    pub fn flush_partial<T: Transport + ?Sized>(&self, transport: &T) -> usize {
        let mut messages = 0;
        for slot in &self.sends {
            let mut send = lock(slot);
            if send.pending_count > 0 {
                self.transmit(transport, &mut send);
                messages += 1;
            }
        }
        messages
    }

    /// Retire completed sends.
    ///
    /// With `wait`, blocks on each in-flight send. With `require_done`, a
    /// send still incomplete afterwards is fatal.
    pub fn cleanup<T: Transport + ?Sized>(
        &self,
        transport: &T,
        wait: bool,
        require_done: bool,
    ) -> CleanupReport {
        let mut report = CleanupReport::default();
        for slot in &self.sends {
            let mut send = lock(slot);
            let mut retired = 0;
            send.in_flight.retain(|entry| {
                if wait {
                    transport.wait_send(&entry.request);
                }
                if transport.test_send(&entry.request) {
                    self.outstanding.fetch_sub(entry.particles, Ordering::Relaxed);
                    retired += 1;
                    false
                } else {
                    true
                }
            });
            send.completed += retired;
            report.completed += retired as usize;
            report.in_flight += send.in_flight.len();
            if require_done && !send.in_flight.is_empty() {
                fatal!(
                    Site::here("dd-send"),
                    "message lost: {} sends to rank {} incomplete ({} of {} completed)",
                    send.in_flight.len(),
                    send.dest,
                    send.completed,
                    send.allocated
                );
            }
        }
        report
    }

    /// Flush, wait for every send and check the outstanding counter is zero.
    pub fn finish<T: Transport + ?Sized>(&self, transport: &T) {
        self.flush_partial(transport);
        self.cleanup(transport, true, true);
        let outstanding = self.outstanding();
        if outstanding != 0 {
            fatal!(
                Site::here("dd-send"),
                "{outstanding} particles still counted in flight at end of tracking"
            );
        }
        tracing::debug!(rank = %self.rank, stats = ?self.stats(), "domain exchange finished");
    }

    /// Rebuild particles from every arrived message, enqueue them on
    /// `worker`'s queue and re-post the receives. Returns the particle count.
    ///
    /// Records come from whichever worker has the most free ones
    /// ([`ParticleStacks::take_from_richest`]), so call this only between
    /// parallel rounds. If the rank runs out of records mid-message the
    /// rest of that message is reported as [`BankError::ArrivalsLost`].
    pub fn drain_received<T: Transport + ?Sized>(
        &self,
        transport: &T,
        arena: &Arena,
        stacks: &ParticleStacks,
        queues: &WorkerFifos,
        worker: WorkerId,
    ) -> Result<usize, BankError> {
        let mut rebuilt = 0;
        for (s, slot) in self.recvs.iter().enumerate() {
            let source = RankId(s as u32);
            if source == self.rank {
                continue;
            }
            let mut recv = lock(slot);
            loop {
                let request = *recv
                    .request
                    .get_or_insert_with(|| transport.irecv(source, self.tags.particles(source)));
                let Some(payload) = transport.test_recv(&request) else {
                    break;
                };
                recv.request = None;
                self.messages_received.fetch_add(1, Ordering::Relaxed);
                rebuilt += self.rebuild(arena, stacks, queues, worker, source, &payload)?;
            }
        }
        Ok(rebuilt)
    }

    fn rebuild(
        &self,
        arena: &Arena,
        stacks: &ParticleStacks,
        queues: &WorkerFifos,
        worker: WorkerId,
        source: RankId,
        payload: &[f64],
    ) -> Result<usize, BankError> {
        if payload.len() % particle::PAYLOAD_LEN != 0 {
            fatal!(
                Site::here("dd-recv"),
                "message from rank {source} holds {} fields, not a whole number of particles",
                payload.len()
            );
        }
        let total = payload.len() / particle::PAYLOAD_LEN;
        for (n, record) in payload.chunks_exact(particle::PAYLOAD_LEN).enumerate() {
            let tag = record[particle::SPECIES - list::HEADER_SIZE];
            let Some(species) = Species::from_tag(tag) else {
                fatal!(
                    Site::here("dd-recv"),
                    "particle from rank {source} carries invalid species tag {tag}"
                );
            };
            let domain = record[particle::DOMAIN - list::HEADER_SIZE];
            if DomainId::from_field(domain) != Some(DomainId::from(self.rank)) {
                fatal!(
                    Site::here("dd-recv"),
                    "particle from rank {source} belongs to domain {domain}, not {}",
                    self.rank
                );
            }
            let p = match stacks.take_from_richest(arena, species) {
                Ok(p) => p,
                Err(cause) => {
                    let lost = total - n;
                    tracing::error!(rank = %self.rank, %source, lost, "arriving particles dropped");
                    return Err(BankError::ArrivalsLost {
                        from: source,
                        lost,
                        cause: Box::new(cause),
                    });
                }
            };
            arena.write_from(p + list::HEADER_SIZE, record);
            queues.push(arena, worker, p);
            self.received.fetch_add(1, Ordering::Relaxed);
        }
        Ok(total)
    }

    /// Particles in sends that have not completed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Particles sitting in batch buffers not yet sent.
    pub fn pending(&self) -> usize {
        self.sends.iter().map(|s| lock(s).pending_count).sum()
    }

    /// Cumulative `(sent, received)` particle counters.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.sent.load(Ordering::Relaxed),
            self.received.load(Ordering::Relaxed),
        )
    }

    /// Local credit: particles sent minus particles received.
    pub fn credit(&self) -> i64 {
        let (sent, received) = self.counters();
        sent as i64 - received as i64
    }

    /// Snapshot of the exchange counters.
    pub fn stats(&self) -> ExchangeStats {
        let (particles_sent, particles_received) = self.counters();
        ExchangeStats {
            particles_sent,
            particles_received,
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
        }
    }
}
