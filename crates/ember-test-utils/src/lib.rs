//! Test utilities for Ember development.
//!
//! Provides deterministic [`Source`](ember_engine::Source) and
//! [`Tracker`](ember_engine::Tracker) fixtures plus helpers that run a
//! whole in-process cluster of ranks on scoped threads.

#![forbid(unsafe_code)]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod fixtures;

pub use fixtures::{run_cluster, small_config, CountingTracker, PointSource, RandomWalkTracker};
