//! Particle checkpoint files for Ember.
//!
//! At the end of a batch the engine can append the banked particles to a
//! checkpoint so a later run restarts from them.
//!
//! # Format
//!
//! ```text
//! [batch i64][count i64][payload 1] ... [payload count]
//! [batch i64][count i64] ...
//! ```
//!
//! Each payload is [`PAYLOAD_LEN`](ember_core::record::particle::PAYLOAD_LEN)
//! little-endian `f64` values, the particle record without its list header.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod codec;
pub mod error;
pub mod reader;
pub mod writer;

pub use codec::Batch;
pub use error::CheckpointError;
pub use reader::{BatchIter, CheckpointReader};
pub use writer::CheckpointWriter;
