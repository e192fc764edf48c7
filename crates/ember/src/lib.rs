//! Ember: particle memory, work queues and domain migration for Monte
//! Carlo particle transport.
//!
//! This is the top-level facade crate that re-exports the public API from
//! all Ember sub-crates. Physics and geometry plug in through the
//! [`engine::Tracker`] and [`engine::Source`] traits.
//!
//! # Quick start
//!
//! ```rust
//! use ember::prelude::*;
//!
//! struct Uniform;
//! impl Source for Uniform {
//!     fn histories(&self, _batch: u64) -> u64 { 100 }
//!     fn sample(&self, _batch: u64, _history: u64) -> SourceParticle {
//!         SourceParticle {
//!             species: Species::Neutron,
//!             domain: DomainId(0),
//!             position: [0.0; 3],
//!             direction: [0.0, 0.0, 1.0],
//!             energy: 2.0e6,
//!             weight: 1.0,
//!             multiplicity: 1,
//!         }
//!     }
//! }
//!
//! struct Absorber;
//! impl Tracker for Absorber {
//!     fn track(&self, _h: &mut History<'_>) -> Result<Fate, BankError> {
//!         Ok(Fate::Absorbed)
//!     }
//! }
//!
//! let transport = ChannelTransport::cluster(1).remove(0);
//! let config = RunConfig { workers: Some(2), ..RunConfig::default() };
//! let mut ctx = Context::new(config, transport).unwrap();
//! let metrics = ctx.run_batch(0, &Uniform, &Absorber).unwrap();
//! assert_eq!(metrics.absorbed, 100);
//! ctx.shutdown().unwrap();
//! ```
//!
//! # Modules
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`types`] | `ember-core` | IDs, species, record layout, fatal diagnostics |
//! | [`arena`] | `ember-arena` | Arena storage and intrusive lists |
//! | [`bank`] | `ember-bank` | Particle stacks, FIFOs, common queue, rebalancer |
//! | [`domain`] | `ember-domain` | Transport, migration, termination, collectives |
//! | [`checkpoint`] | `ember-checkpoint` | Bank checkpoint files |
//! | [`engine`] | `ember-engine` | Context, rank loop, scores, metrics |

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

/// Core identifiers, species and the record layout (`ember-core`).
pub use ember_core as types;

/// Arena storage and intrusive lists (`ember-arena`).
///
/// Records are addressed by offset; [`arena::list`] links them into
/// doubly linked lists without any side allocation.
pub use ember_arena as arena;

/// Particle lifecycle containers (`ember-bank`).
pub use ember_bank as bank;

/// Domain decomposition (`ember-domain`).
///
/// [`domain::DomainExchange`] migrates particles between ranks and
/// [`domain::TerminationDetector`] decides when a batch is over.
pub use ember_domain as domain;

/// Bank checkpoint files (`ember-checkpoint`).
pub use ember_checkpoint as checkpoint;

/// Batch driver (`ember-engine`).
pub use ember_engine as engine;

/// Common imports for typical Ember usage.
///
/// ```rust
/// use ember::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use ember_core::record::particle;
    pub use ember_core::{BankError, DomainId, Offset, RankId, Species, WorkerId};

    // Arena
    pub use ember_arena::{Arena, ArenaConfig};

    // Domain
    pub use ember_domain::{ChannelTransport, TerminationConfig, Transport};

    // Engine
    pub use ember_engine::{
        BatchMetrics, Context, Fate, History, RunConfig, RunError, ScoreId, Source,
        SourceParticle, Tracker,
    };
}
