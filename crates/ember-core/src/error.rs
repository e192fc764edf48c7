//! Error types shared across the Ember workspace.
//!
//! Only user-facing, recoverable-by-reconfiguration failures are errors.
//! Internal invariant violations go through [`fatal`](crate::fatal::fatal)
//! instead.

use std::error::Error;
use std::fmt;

use crate::id::{RankId, WorkerId};
use crate::species::Species;

/// Errors from the particle stacks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BankError {
    /// A worker's free-list for one species ran dry.
    ///
    /// The buffer was sized too small for the population in flight.
    BufferExhausted {
        /// Species whose free-list was empty.
        species: Species,
        /// Worker that asked for a particle.
        worker: WorkerId,
        /// Records allocated to that worker for the species.
        allocated: usize,
    },
    /// Particles arriving from another rank could not all be rebuilt.
    ///
    /// The message was already consumed, so the remaining particles of it
    /// are gone.
    ArrivalsLost {
        /// Rank the message came from.
        from: RankId,
        /// Particles of the message that were not rebuilt.
        lost: usize,
        /// The exhausted free-list that stopped the rebuild.
        cause: Box<BankError>,
    },
}

impl fmt::Display for BankError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferExhausted {
                species,
                worker,
                allocated,
            } => write!(
                f,
                "{species} buffer exhausted on worker {worker} ({allocated} records allocated); \
                 increase `particles_per_worker` in the run configuration"
            ),
            Self::ArrivalsLost { from, lost, cause } => {
                write!(f, "{lost} particles arriving from rank {from} lost: {cause}")
            }
        }
    }
}

impl Error for BankError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::ArrivalsLost { cause, .. } => Some(cause.as_ref()),
            Self::BufferExhausted { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_message_names_the_knob() {
        let e = BankError::BufferExhausted {
            species: Species::Photon,
            worker: WorkerId(3),
            allocated: 100,
        };
        let msg = e.to_string();
        assert!(msg.contains("photon buffer exhausted on worker 3"));
        assert!(msg.contains("particles_per_worker"));
    }

    #[test]
    fn lost_arrivals_name_the_sender_and_keep_the_cause() {
        let cause = BankError::BufferExhausted {
            species: Species::Neutron,
            worker: WorkerId(0),
            allocated: 8,
        };
        let e = BankError::ArrivalsLost {
            from: RankId(2),
            lost: 5,
            cause: Box::new(cause.clone()),
        };
        assert!(e.to_string().starts_with("5 particles arriving from rank 2 lost"));
        let source = e.source().unwrap();
        assert_eq!(source.to_string(), cause.to_string());
    }
}
