//! Error types for checkpoint files.

use std::fmt;
use std::io;

/// Errors raised while writing or reading a checkpoint.
#[derive(Debug)]
pub enum CheckpointError {
    /// An I/O error occurred during read or write.
    Io(io::Error),
    /// The file ended inside a batch.
    Truncated {
        /// Batch whose data was cut short, if its header was read.
        batch: Option<i64>,
        /// What was being read when the data ran out.
        detail: String,
    },
    /// A batch header declared a negative particle count.
    NegativeCount {
        /// Batch the header belongs to.
        batch: i64,
        /// The count found in the file.
        count: i64,
    },
    /// A payload slice is not a whole number of particles.
    RaggedPayload {
        /// Number of values supplied.
        values: usize,
        /// Values per particle.
        payload_len: usize,
    },
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Truncated {
                batch: Some(batch),
                detail,
            } => write!(f, "checkpoint truncated in batch {batch}: {detail}"),
            Self::Truncated {
                batch: None,
                detail,
            } => write!(f, "checkpoint truncated: {detail}"),
            Self::NegativeCount { batch, count } => {
                write!(f, "batch {batch} declares a negative particle count {count}")
            }
            Self::RaggedPayload {
                values,
                payload_len,
            } => write!(
                f,
                "{values} values is not a multiple of the {payload_len}-value particle payload"
            ),
        }
    }
}

impl std::error::Error for CheckpointError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CheckpointError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
