//! Core identifiers, record schema and error types for Ember.
//!
//! This is the leaf crate with zero internal dependencies. It defines the
//! vocabulary shared by every other crate in the workspace: rank, worker
//! and domain identifiers, particle species, the field-offset schema of
//! arena records (the "record ABI" consumed by physics collaborators),
//! the cross-crate error enums, and the fatal-diagnostic path used for
//! internal invariant violations.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod error;
pub mod fatal;
pub mod id;
pub mod record;
pub mod species;

pub use error::BankError;
pub use fatal::{DiagnosticScope, Site};
pub use id::{BinIndex, DomainId, Offset, RankId, WorkerId};
pub use species::Species;
