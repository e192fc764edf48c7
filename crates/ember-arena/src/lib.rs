//! Offset-addressed arena and intrusive lists for Ember.
//!
//! Every dynamic structure of a run lives in one flat, growable store of
//! `f64` fields and is named by an integer [`Offset`](ember_core::Offset),
//! never by a reference: growth may move the backing store.
//!
//! ```text
//! Arena
//! ├── Vec<AtomicU64>   (fields; [0, size) allocated, rest reserved)
//! ├── bump cursor
//! └── GrowthGate       (allow/deny; growth with the gate closed is fatal)
//!
//! list::*              (doubly-linked lists threaded through arena records)
//! ```
//!
//! # Growth discipline
//!
//! Field access takes `&Arena` and is safe to share across worker threads.
//! Growth takes `&mut Arena`, so it cannot overlap a parallel region, and
//! must additionally happen inside a [`GrowthWindow`]:
//!
//! ```
//! use ember_arena::{Arena, ArenaConfig};
//!
//! let mut arena = Arena::new(&ArenaConfig::default()).unwrap();
//! let base = {
//!     let mut window = arena.growth_window();
//!     window.allocate(8)
//! };
//! arena.put(base, 1.5);
//! assert_eq!(arena.get(base), 1.5);
//! ```

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod gate;
pub mod list;
pub mod store;

pub use config::ArenaConfig;
pub use error::ArenaError;
pub use gate::GrowthGate;
pub use list::{ListIter, SortOrder};
pub use store::{Arena, GrowthWindow};
