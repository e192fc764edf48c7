//! Particle lifecycle containers for Ember.
//!
//! Everything here is built from [`ember_arena`] lists:
//!
//! - [`ParticleStacks`]: per-(worker, species) free-lists of recycled records.
//! - [`WorkerFifos`]: per-worker FIFOs, used both as the tracking queue and
//!   the bank ([`FifoKind`]).
//! - [`CommonQueue`]: one mutex-guarded queue shared by all workers, with
//!   multiplicity splitting.
//! - [`rebalance`]: levels work across per-worker FIFOs.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod common;
pub mod fifo;
pub mod rebalance;
pub mod stack;

pub use common::CommonQueue;
pub use fifo::{FifoBalancer, FifoKind, WorkerFifos};
pub use rebalance::{rebalance, Rebalance, RebalanceReport};
pub use stack::{species_of, ParticleStacks, RefillPolicy};
