//! Errors that abort a run.

use std::error::Error;
use std::fmt;

use ember_arena::ArenaError;
use ember_checkpoint::CheckpointError;
use ember_core::{BankError, RankId};

use crate::config::ConfigError;

/// A run-level failure.
///
/// These are configuration or environment problems a user can fix.
/// Broken internal invariants panic through [`ember_core::fatal`] instead.
#[derive(Debug)]
pub enum RunError {
    /// The run configuration failed validation.
    Config(ConfigError),
    /// A particle buffer ran dry.
    Bank(BankError),
    /// Growing the arena failed.
    Arena(ArenaError),
    /// Writing or reading the checkpoint failed.
    Checkpoint(CheckpointError),
    /// A checkpoint held a record this run cannot restore.
    Restore {
        /// Description of the offending record.
        reason: String,
    },
    /// A worker thread could not be spawned.
    ThreadSpawnFailed {
        /// Description of which thread failed.
        reason: String,
    },
    /// Another rank abandoned the batch, so it can never complete here.
    PeerAborted {
        /// The rank that gave up.
        rank: RankId,
    },
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "config: {e}"),
            Self::Bank(e) => write!(f, "bank: {e}"),
            Self::Arena(e) => write!(f, "arena: {e}"),
            Self::Checkpoint(e) => write!(f, "checkpoint: {e}"),
            Self::Restore { reason } => write!(f, "restore: {reason}"),
            Self::ThreadSpawnFailed { reason } => write!(f, "thread spawn failed: {reason}"),
            Self::PeerAborted { rank } => write!(f, "rank {rank} aborted the batch"),
        }
    }
}

impl Error for RunError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Bank(e) => Some(e),
            Self::Arena(e) => Some(e),
            Self::Checkpoint(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for RunError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<BankError> for RunError {
    fn from(e: BankError) -> Self {
        Self::Bank(e)
    }
}

impl From<ArenaError> for RunError {
    fn from(e: ArenaError) -> Self {
        Self::Arena(e)
    }
}

impl From<CheckpointError> for RunError {
    fn from(e: CheckpointError) -> Self {
        Self::Checkpoint(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::{Species, WorkerId};

    #[test]
    fn bank_error_keeps_guidance() {
        let e: RunError = BankError::BufferExhausted {
            species: Species::Neutron,
            worker: WorkerId(0),
            allocated: 8,
        }
        .into();
        assert!(e.to_string().starts_with("bank: neutron buffer exhausted"));
        assert!(e.source().is_some());
    }

    #[test]
    fn peer_abort_names_the_rank() {
        let e = RunError::PeerAborted { rank: RankId(3) };
        assert_eq!(e.to_string(), "rank 3 aborted the batch");
        assert!(e.source().is_none());
    }
}
