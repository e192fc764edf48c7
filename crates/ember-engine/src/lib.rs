//! Batch driver for Ember ranks.
//!
//! A [`Context`] is one rank's world: arena, particle stacks, worker
//! queues and bank, common queue, domain exchange and score buffers, built
//! explicitly from a [`RunConfig`] and a transport.
//! [`Context::run_batch`] samples a [`Source`], tracks every particle with
//! a [`Tracker`] on a pool of worker threads, migrates particles that
//! cross into other ranks' domains and returns once the termination
//! detector agrees that no work remains anywhere.
//!
//! # Modules
//!
//! - [`config`]: [`RunConfig`] and [`ConfigError`]
//! - [`context`]: [`Context`] construction, bank handling, checkpoints
//! - [`history`]: collaborator traits and the [`History`] handle
//! - [`scores`]: per-worker score buffers with cross-rank reduction
//! - [`metrics`]: [`BatchMetrics`]
//! - [`error`]: [`RunError`]

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod config;
pub mod context;
pub mod error;
pub mod history;
pub mod metrics;
mod run;
pub mod scores;

pub use config::{ConfigError, RunConfig};
pub use context::{Context, ShutdownReport};
pub use error::RunError;
pub use history::{Fate, History, Source, SourceParticle, Tracker};
pub use metrics::BatchMetrics;
pub use scores::{ScoreBuffer, ScoreId};
