//! Arena-specific error types.
//!
//! Gate misuse and system allocation failure are not errors: they are
//! fatal (see [`ember_core::fatal`]). What remains is the configured
//! size ceiling, which a user can raise.

use std::error::Error;
use std::fmt;

/// Errors that can occur during arena operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArenaError {
    /// Growth would pass the configured `max_size`.
    CapacityExceeded {
        /// Fields requested by the failing call.
        requested: usize,
        /// Fields already in use.
        used: usize,
        /// Configured ceiling.
        max_size: usize,
    },
    /// The arena configuration is inconsistent.
    InvalidConfig {
        /// Which limit is wrong.
        reason: String,
    },
}

impl fmt::Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapacityExceeded {
                requested,
                used,
                max_size,
            } => {
                write!(
                    f,
                    "arena capacity exceeded: requested {requested} fields with {used} in use, \
                     max_size {max_size}; raise `arena.max_size`"
                )
            }
            Self::InvalidConfig { reason } => write!(f, "invalid arena config: {reason}"),
        }
    }
}

impl Error for ArenaError {}
