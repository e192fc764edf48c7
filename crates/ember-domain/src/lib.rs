//! Spatial domain decomposition for Ember.
//!
//! Ranks cooperate only through messages over a [`Transport`]:
//!
//! - [`DomainExchange`] batches particles leaving the local domain into
//!   per-destination messages and rebuilds arriving ones.
//! - [`TerminationDetector`] decides, without a barrier per check, that no
//!   particle is live or in flight anywhere.
//! - [`collective`] provides batched reduce/broadcast of `f64` arrays.
//!
//! [`ChannelTransport`] connects ranks that live in one process, which is
//! how the engine's tests and benches run multi-rank scenarios.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod collective;
pub mod exchange;
pub mod termination;
pub mod transport;

pub use exchange::{CleanupReport, DomainExchange, ExchangeStats, Route};
pub use termination::{broadcast_abort, LocalStatus, TerminationConfig, TerminationDetector, TerminationState};
pub use transport::{ChannelTransport, RecvRequest, SendRequest, Tag, TagLayout, Transport};
